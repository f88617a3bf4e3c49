use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// Nexus error codes
pub const ERR_PARSE: i32 = -32700;
pub const ERR_INVALID_REQUEST: i32 = -32600;
pub const ERR_INTERNAL: i32 = -32603;
pub const ERR_INVALID_PARAMS: i32 = -32602;
pub const ERR_METHOD_NOT_FOUND: i32 = -32601;
pub const ERR_TTL_EXPIRED: i32 = -32011;
pub const ERR_PERMISSION_DENIED: i32 = -32010;
pub const ERR_CONN_CLOSED: i32 = -32007;
pub const ERR_LOCK_NOT_OWNED: i32 = -32006;
pub const ERR_USER_EXISTS: i32 = -32005;
pub const ERR_INVALID_USER: i32 = -32004;
pub const ERR_INVALID_PIPE: i32 = -32003;
pub const ERR_INVALID_TASK: i32 = -32002;
pub const ERR_CANCEL: i32 = -32001;
pub const ERR_TIMEOUT: i32 = -32000;
pub const ERR_UNKNOWN_ERROR: i32 = -32098;
pub const ERR_NOT_SUPPORTED: i32 = -32099;

// SDK error codes
pub const ERR_TESTING_METHOD_NOT_PROVIDED: i32 = 20000;
pub const ERR_PACT_NOT_DEFINED: i32 = 20001;

/// Standard message for a known error code.
pub fn error_message(code: i32) -> &'static str {
    match code {
        ERR_PARSE => "Parse error",
        ERR_INVALID_REQUEST => "Invalid request",
        ERR_METHOD_NOT_FOUND => "Method not found",
        ERR_INVALID_PARAMS => "Invalid params",
        ERR_INTERNAL => "Internal error",
        ERR_TIMEOUT => "Timeout",
        ERR_CANCEL => "Cancel",
        ERR_INVALID_TASK => "Invalid task",
        ERR_INVALID_PIPE => "Invalid pipe",
        ERR_INVALID_USER => "Invalid user",
        ERR_USER_EXISTS => "User already exists",
        ERR_PERMISSION_DENIED => "Permission denied",
        ERR_TTL_EXPIRED => "TTL expired",
        ERR_LOCK_NOT_OWNED => "Lock not owned",
        ERR_CONN_CLOSED => "Connection is closed",
        ERR_UNKNOWN_ERROR => "Unknown error",
        ERR_NOT_SUPPORTED => "Not supported",
        ERR_TESTING_METHOD_NOT_PROVIDED => "Testing method not provided",
        ERR_PACT_NOT_DEFINED => "Pact not defined for provided input",
        _ => "",
    }
}

/// Error object carried by every error reply: `{code, message, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        JsonRpcError {
            code,
            message: message.into(),
            data,
        }
    }

    /// Error with the registry's standard message for `code`.
    pub fn from_code(code: i32) -> Self {
        JsonRpcError::new(code, error_message(code), None)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// Errors returned by the broker connection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NexusError {
    #[error("[{}] {}", ERR_TIMEOUT, error_message(ERR_TIMEOUT))]
    Timeout,

    #[error("[{}] {}", ERR_CANCEL, error_message(ERR_CANCEL))]
    Cancel,

    #[error("[{}] {}", ERR_CONN_CLOSED, error_message(ERR_CONN_CLOSED))]
    ConnClosed,

    #[error("{0}")]
    Remote(JsonRpcError),
}

impl NexusError {
    pub fn code(&self) -> i32 {
        match self {
            NexusError::Timeout => ERR_TIMEOUT,
            NexusError::Cancel => ERR_CANCEL,
            NexusError::ConnClosed => ERR_CONN_CLOSED,
            NexusError::Remote(e) => e.code,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.code() == ERR_TIMEOUT
    }

    /// Cancel and closed-connection errors are expected once the service is stopping.
    pub fn is_cancel_or_closed(&self) -> bool {
        matches!(self.code(), ERR_CANCEL | ERR_CONN_CLOSED)
    }
}

impl From<JsonRpcError> for NexusError {
    fn from(err: JsonRpcError) -> Self {
        match err.code {
            ERR_TIMEOUT => NexusError::Timeout,
            ERR_CANCEL => NexusError::Cancel,
            ERR_CONN_CLOSED => NexusError::ConnClosed,
            _ => NexusError::Remote(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, NexusError>;
