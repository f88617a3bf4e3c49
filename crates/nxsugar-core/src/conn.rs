use crate::{JsonRpcError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// A task as delivered by a pull, before it is bound to its connection.
#[derive(Debug, Clone, PartialEq)]
pub struct PulledTask {
    pub id: String,
    pub path: String,
    pub method: String,
    pub params: Value,
    pub tags: Map<String, Value>,
}

/// Broker connection used by services.
///
/// Login, framing and the wire protocol live behind this trait. Pulls block
/// until a task arrives, the timeout expires (`NexusError::Timeout`) or the
/// connection is closed (`NexusError::ConnClosed`).
#[async_trait]
pub trait NexusConn: Send + Sync {
    /// Identifier of the session, used in logs.
    fn conn_id(&self) -> String;

    /// Pull the next task addressed to `path`. A zero timeout waits forever.
    async fn task_pull(&self, path: &str, timeout: Duration) -> Result<PulledTask>;

    /// Close the connection. Outstanding pulls fail with a closed-connection error.
    async fn close(&self);

    fn is_closed(&self) -> bool;

    async fn task_accept(&self, task_id: &str) -> Result<()>;

    async fn task_result(&self, task_id: &str, result: Value) -> Result<()>;

    async fn task_error(&self, task_id: &str, error: JsonRpcError) -> Result<()>;

    async fn pipe_open(&self, pipe_id: &str) -> Result<Box<dyn Pipe>>;

    /// Push a task to `path`. Detached pushes return as soon as the task is queued.
    async fn task_push(
        &self,
        path: &str,
        params: Value,
        timeout: Duration,
        detach: bool,
    ) -> Result<Option<Value>>;
}

/// Write end of a broker pipe.
#[async_trait]
pub trait Pipe: Send + Sync {
    fn id(&self) -> &str;

    async fn write(&self, msg: Value) -> Result<()>;
}

/// Dials and logs into a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Address shown in logs, without credentials.
    fn url(&self) -> String;

    async fn connect(&self) -> Result<Arc<dyn NexusConn>>;
}
