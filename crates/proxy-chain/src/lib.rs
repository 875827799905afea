//! proxy-chain: forwards HTTP requests and CONNECT tunnels received from
//! clients through an upstream HTTP or SOCKS4/5 proxy.

pub mod admin;
pub mod chain;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod options;
pub mod routing;

pub use chain::{ChainOptions, ProxyChain, TrafficSample, TrafficStats, TrafficTotals};
pub use error::ChainError;
pub use options::{derive_proxy_descriptor, make_auth, ProxyDescriptor, ProxyType, SocksVersion};
pub use routing::{DefaultRouter, RequestRouter, RouteDecision};
