//! Admin HTTP endpoint: health, Prometheus metrics and traffic counters.

mod router;
mod server;

pub use router::{route_request, AdminState};
pub use server::AdminServer;
