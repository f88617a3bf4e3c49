use crate::format::format_secs;
use nxsugar_core::NexusError;
use std::time::Duration;
use thiserror::Error;

/// Terminal and setup errors reported by `serve()`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("no methods to serve")]
    NoMethods,

    #[error("no services to serve")]
    NoServices,

    #[error("service is already serving")]
    AlreadyServing,

    #[error("can't connect to nexus server ({url}): {source}")]
    Connect { url: String, source: NexusError },

    #[error("graceful: timeout after {}", format_secs(*.0))]
    GracefulTimeout(Duration),

    #[error("stop: nexus connection ended: {0}")]
    ConnectionEnded(String),

    #[error("invalid parameter ({param}): {reason}")]
    InvalidConfig { param: String, reason: String },

    #[error("missing parameter ({0}) on config")]
    MissingConfig(String),
}

impl ServiceError {
    pub(crate) fn invalid(param: impl Into<String>, reason: impl Into<String>) -> Self {
        ServiceError::InvalidConfig {
            param: param.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
