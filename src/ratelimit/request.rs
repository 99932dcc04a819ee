//! Request metadata consumed from the host pipeline.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Address used when no extraction strategy yields one.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// The parts of an inbound request admission control looks at.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// HTTP method
    pub method: String,
    /// Raw request path
    pub path: String,
    /// Matched route template, e.g. `/users/:id`
    pub route: Option<String>,
    /// Client address already resolved by the pipeline
    pub ip: Option<String>,
    /// Transport peer address
    pub peer_addr: Option<SocketAddr>,
    /// Request headers, keyed by lower-case name
    pub headers: HashMap<String, String>,
}

impl RequestMeta {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Route template if the pipeline matched one, otherwise the raw path.
    pub fn route_or_path(&self) -> &str {
        self.route.as_deref().unwrap_or(&self.path)
    }

    /// Client address from the first source in `sources` that has one.
    pub fn client_ip(&self, sources: &[AddressSource]) -> String {
        sources
            .iter()
            .find_map(|source| source.extract(self))
            .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
    }

    /// Default rate key: `ip:method:route-or-path`.
    pub fn default_key(&self, sources: &[AddressSource]) -> String {
        format!(
            "{}:{}:{}",
            self.client_ip(sources),
            self.method,
            self.route_or_path()
        )
    }
}

/// One way of finding the client address on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressSource {
    /// `RequestMeta::ip`, set by the pipeline
    Explicit,
    /// First entry of `X-Forwarded-For`
    ForwardedFor,
    /// `X-Real-IP`
    RealIp,
    /// Transport peer address
    Peer,
}

impl AddressSource {
    /// Forwarding headers are client-controlled, so they are opt-in.
    pub fn default_chain() -> Vec<AddressSource> {
        vec![AddressSource::Explicit, AddressSource::Peer]
    }

    fn extract(&self, request: &RequestMeta) -> Option<String> {
        let value = match self {
            AddressSource::Explicit => request.ip.clone(),
            AddressSource::ForwardedFor => request
                .header("x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_string()),
            AddressSource::RealIp => request.header("x-real-ip").map(|v| v.trim().to_string()),
            AddressSource::Peer => request.peer_addr.map(|addr| addr.ip().to_string()),
        };
        value.filter(|v| !v.is_empty())
    }
}
