use crate::conn::{NexusConn, PulledTask};
use crate::{JsonRpcError, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::warn;

/// Key of the params entry carrying mock/test flags.
pub const METADATA_KEY: &str = "@metadata";

/// Key of the params entry asking for the response to be routed elsewhere.
pub const REPLY_TO_KEY: &str = "replyTo";

/// Local notes attached to a task while it is being served.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Annotations {
    /// A reply (result, error or accept) has already been sent.
    pub replied: bool,
    /// Result returned by the handler.
    pub result: Option<Value>,
    /// Error returned by the handler.
    pub error: Option<JsonRpcError>,
}

/// Destination for a routed response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReplyTo {
    Pipe { path: String },
    Service { path: String },
}

/// One unit of work pulled from the broker.
///
/// A task is owned by exactly one executor. At most one reply is forwarded to
/// the broker; later replies are logged and dropped.
pub struct Task {
    pub id: String,
    pub path: String,
    pub method: String,
    pub params: Value,
    pub tags: Map<String, Value>,
    annotations: Annotations,
    conn: Arc<dyn NexusConn>,
}

impl Task {
    pub fn new(pulled: PulledTask, conn: Arc<dyn NexusConn>) -> Self {
        Task {
            id: pulled.id,
            path: pulled.path,
            method: pulled.method,
            params: pulled.params,
            tags: pulled.tags,
            annotations: Annotations::default(),
            conn,
        }
    }

    /// Connection the task was pulled from.
    pub fn conn(&self) -> &Arc<dyn NexusConn> {
        &self.conn
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    pub fn annotations_mut(&mut self) -> &mut Annotations {
        &mut self.annotations
    }

    pub fn is_replied(&self) -> bool {
        self.annotations.replied
    }

    /// Raw `@metadata` object from the params, if any.
    pub fn metadata(&self) -> Option<&Value> {
        self.params.as_object()?.get(METADATA_KEY)
    }

    /// True when `@metadata.<flag>` is set to a truthy value.
    pub fn metadata_flag(&self, flag: &str) -> bool {
        self.metadata()
            .and_then(|m| m.get(flag))
            .map(truthy)
            .unwrap_or(false)
    }

    /// Routing destination from `params.replyTo`, when well formed.
    pub fn reply_to(&self) -> Option<ReplyTo> {
        let raw = self.params.as_object()?.get(REPLY_TO_KEY)?;
        serde_json::from_value(raw.clone()).ok()
    }

    /// `{path, method, params, tags}` echo used in routed responses.
    pub fn echo(&self) -> Value {
        json!({
            "path": self.path,
            "method": self.method,
            "params": self.params,
            "tags": self.tags,
        })
    }

    /// Accept the task without a result.
    pub async fn accept(&mut self) -> Result<()> {
        if !self.claim_reply("accept") {
            return Ok(());
        }
        self.conn.task_accept(&self.id).await
    }

    pub async fn send_result(&mut self, result: Value) -> Result<()> {
        if !self.claim_reply("result") {
            return Ok(());
        }
        self.conn.task_result(&self.id, result).await
    }

    pub async fn send_error(
        &mut self,
        code: i32,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Result<()> {
        self.send_json_rpc_error(JsonRpcError::new(code, message, data))
            .await
    }

    pub async fn send_json_rpc_error(&mut self, error: JsonRpcError) -> Result<()> {
        if !self.claim_reply("error") {
            return Ok(());
        }
        self.conn.task_error(&self.id, error).await
    }

    fn claim_reply(&mut self, kind: &str) -> bool {
        if self.annotations.replied {
            warn!(task = %self.id, method = %self.method, "dropping {} reply: task already replied", kind);
            return false;
        }
        self.annotations.replied = true;
        true
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("method", &self.method)
            .field("params", &self.params)
            .field("tags", &self.tags)
            .field("annotations", &self.annotations)
            .finish()
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{MemBroker, Reply};
    use std::time::Duration;

    async fn pull_one(broker: &MemBroker, params: Value) -> (Task, crate::mem::PendingReply) {
        let conn = broker.connect_mem();
        let pending = broker.push("test.svc.echo", params);
        let pulled = conn.task_pull("test.svc", Duration::from_secs(1)).await.unwrap();
        (Task::new(pulled, conn), pending)
    }

    #[tokio::test]
    async fn test_single_reply() {
        let broker = MemBroker::new();
        let (mut task, pending) = pull_one(&broker, json!({"a": 1})).await;

        task.send_result(json!("first")).await.unwrap();
        task.send_error(-1, "second", None).await.unwrap();
        assert!(task.is_replied());

        assert_eq!(pending.wait().await, Some(Reply::Result(json!("first"))));
    }

    #[tokio::test]
    async fn test_metadata_and_reply_to() {
        let broker = MemBroker::new();
        let (task, _pending) = pull_one(
            &broker,
            json!({
                "@metadata": {"pact": true, "testing": 0},
                "replyTo": {"type": "pipe", "path": "p1"},
            }),
        )
        .await;

        assert!(task.metadata_flag("pact"));
        assert!(!task.metadata_flag("testing"));
        assert!(!task.metadata_flag("missing"));
        assert_eq!(task.reply_to(), Some(ReplyTo::Pipe { path: "p1".to_string() }));
        assert_eq!(task.method, "echo");
        assert_eq!(task.path, "test.svc");
    }

    #[tokio::test]
    async fn test_malformed_reply_to_is_ignored() {
        let broker = MemBroker::new();
        let (task, _pending) =
            pull_one(&broker, json!({"replyTo": {"type": "mail", "path": "x"}})).await;
        assert_eq!(task.reply_to(), None);
    }
}
