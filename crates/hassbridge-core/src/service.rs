//! `domain/service` identifiers for service calls.

use std::fmt;
use std::str::FromStr;

/// A validated `domain/service` pair, e.g. `light/turn_on`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceName {
    domain: String,
    service: String,
}

impl ServiceName {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Path of the service-call endpoint, relative to the base URL.
    pub fn api_path(&self) -> String {
        format!("/api/services/{}/{}", self.domain, self.service)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.service)
    }
}

impl FromStr for ServiceName {
    type Err = ServiceNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (domain, service) = s
            .split_once('/')
            .ok_or_else(|| ServiceNameError::MissingSeparator(s.to_string()))?;

        if service.contains('/') {
            return Err(ServiceNameError::TooManySeparators(s.to_string()));
        }
        if domain.is_empty() || service.is_empty() {
            return Err(ServiceNameError::EmptyPart(s.to_string()));
        }

        Ok(Self {
            domain: domain.to_string(),
            service: service.to_string(),
        })
    }
}

/// A service name that is not exactly `domain/service`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceNameError {
    #[error("invalid service name {0:?}: expected domain/service")]
    MissingSeparator(String),
    #[error("invalid service name {0:?}: more than one '/'")]
    TooManySeparators(String),
    #[error("invalid service name {0:?}: empty domain or service")]
    EmptyPart(String),
}
