//! Upstream proxy descriptors.
//!
//! A [`ProxyDescriptor`] is derived once from the configured proxy URL and
//! shared (behind an `Arc`) by every handler. Routing callbacks may hand out
//! other descriptors per request; none of them is ever mutated.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use url::{Host, Url};

/// Wire protocol spoken with the upstream proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    /// HTTP or HTTPS proxy that understands CONNECT and absolute-form requests.
    Http,
    /// SOCKS4 or SOCKS5 proxy.
    Socks,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Http => "http",
            ProxyType::Socks => "socks",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
}

impl SocksVersion {
    pub fn as_u8(&self) -> u8 {
        match self {
            SocksVersion::V4 => 4,
            SocksVersion::V5 => 5,
        }
    }
}

/// Immutable description of how to reach and authenticate to an upstream proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    pub proxy_type: ProxyType,
    /// Present iff `proxy_type` is [`ProxyType::Socks`].
    pub socks_version: Option<SocksVersion>,
    /// Scheme as written in the URL (`http`, `https`, `socks`, `socks4`, `socks5`, ...).
    pub scheme: String,
    /// Host with IPv6 brackets removed.
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// `Basic <base64>` value for `Proxy-Authorization`, or empty.
    pub auth_header_value: String,
    /// The proxy URL with credentials re-embedded.
    pub canonical_url: String,
    /// Routing id adopted by handlers that resolve this descriptor.
    pub proxy_id: Option<String>,
}

impl ProxyDescriptor {
    /// Copy of this descriptor tagged with a routing id.
    pub fn with_proxy_id(&self, proxy_id: impl Into<String>) -> Self {
        Self {
            proxy_id: Some(proxy_id.into()),
            ..self.clone()
        }
    }

    /// `host:port`, with IPv6 literals re-bracketed.
    pub fn authority(&self) -> String {
        format!("{}:{}", bracket_host(&self.host), self.port)
    }

    pub fn has_auth(&self) -> bool {
        !self.auth_header_value.is_empty()
    }

    /// Username/password pair, only when both are non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

impl fmt::Display for ProxyDescriptor {
    // Never prints credentials.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

/// Build the `Proxy-Authorization` value, empty unless both parts are non-empty.
pub fn make_auth(username: Option<&str>, password: Option<&str>) -> String {
    match (username, password) {
        (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
            format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
        }
        _ => String::new(),
    }
}

/// Derive an upstream descriptor from a proxy URL and optional credentials.
///
/// Returns `None` for an absent, empty or unparsable URL; callers must refuse
/// service in that case. Explicit credentials win over ones embedded in the URL.
pub fn derive_proxy_descriptor(
    url: Option<&str>,
    username: Option<&str>,
    password: Option<&str>,
) -> Option<ProxyDescriptor> {
    let raw = url.map(str::trim).filter(|u| !u.is_empty())?;
    let parsed = Url::parse(raw).ok()?;

    let host = match parsed.host()? {
        Host::Domain(domain) if !domain.is_empty() => unbracket_host(domain).to_string(),
        Host::Domain(_) => return None,
        Host::Ipv4(addr) => addr.to_string(),
        Host::Ipv6(addr) => addr.to_string(),
    };

    let scheme = parsed.scheme().to_ascii_lowercase();
    let port = parsed.port().or_else(|| default_port(&scheme))?;

    let (proxy_type, socks_version) = if scheme.starts_with("socks") {
        let version = if scheme == "socks4" {
            SocksVersion::V4
        } else {
            SocksVersion::V5
        };
        (ProxyType::Socks, Some(version))
    } else {
        (ProxyType::Http, None)
    };

    let username = non_empty(username).or_else(|| decoded(parsed.username()));
    let password = non_empty(password).or_else(|| parsed.password().and_then(decoded));
    let auth_header_value = make_auth(username.as_deref(), password.as_deref());

    let mut canonical_url = format!("{scheme}://");
    if let (Some(user), Some(pass)) = (username.as_deref(), password.as_deref()) {
        if !user.is_empty() && !pass.is_empty() {
            canonical_url.push_str(&format!(
                "{}:{}@",
                urlencoding::encode(user),
                urlencoding::encode(pass)
            ));
        }
    }
    canonical_url.push_str(&format!("{}:{}", bracket_host(&host), port));

    Some(ProxyDescriptor {
        proxy_type,
        socks_version,
        scheme,
        host,
        port,
        username,
        password,
        auth_header_value,
        canonical_url,
        proxy_id: None,
    })
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        s if s.starts_with("socks") => Some(1080),
        _ => None,
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

fn decoded(value: &str) -> Option<String> {
    if value.is_empty() {
        return None;
    }
    Some(
        urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string()),
    )
}

fn unbracket_host(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

pub(crate) fn bracket_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}
