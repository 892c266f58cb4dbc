//! Management cluster control-plane endpoint, `scheme://host:port`.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("control plane endpoint {0:?} must look like scheme://host:port")]
    Malformed(String),
    #[error("control plane endpoint port {0:?} is out of range")]
    Port(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlaneEndpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

fn endpoint_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Pattern is a literal; compilation cannot fail.
        Regex::new(r"^([a-zA-Z][a-zA-Z0-9+.\-]*)://([0-9a-zA-Z][0-9a-zA-Z\-.]*[0-9a-zA-Z]|[0-9a-zA-Z]):(\d+)$").unwrap()
    })
}

impl ControlPlaneEndpoint {
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        let caps = endpoint_re().captures(s.trim()).ok_or_else(|| EndpointError::Malformed(s.to_string()))?;
        let port_s = &caps[3];
        let port: u16 = port_s.parse().map_err(|_| EndpointError::Port(port_s.to_string()))?;
        if port == 0 {
            return Err(EndpointError::Port(port_s.to_string()));
        }
        Ok(Self { scheme: caps[1].to_string(), host: caps[2].to_string(), port })
    }

    /// `scheme://host`, the form stored in access requests next to the port.
    pub fn host_with_scheme(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }
}

impl FromStr for ControlPlaneEndpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ControlPlaneEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}
