use crate::method::{Handler, MethodResult};
use async_trait::async_trait;
use nxsugar_core::{NexusConn, ReplyTo, Task};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout of the push used to forward a response to another service.
const SERVICE_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Handler wrapper honoring `params.replyTo`, see [`reply_to`].
pub struct ReplyToHandler<H> {
    inner: H,
}

/// Route responses to the pipe or service named in `params.replyTo`.
///
/// When a destination is present the task is accepted instead of answered,
/// and `{result, error, task}` is delivered to the destination in the
/// background. Tasks without a destination are served unchanged.
pub fn reply_to<H: Handler>(handler: H) -> ReplyToHandler<H> {
    ReplyToHandler { inner: handler }
}

#[async_trait]
impl<H: Handler> Handler for ReplyToHandler<H> {
    async fn call(&self, task: &mut Task) -> MethodResult {
        let Some(dest) = task.reply_to() else {
            return self.inner.call(task).await;
        };

        let res = self.inner.call(task).await;
        if let Err(e) = task.accept().await {
            warn!(kind = "reply_to", "could not accept task {}: {}", task.id, e);
            return res;
        }

        let envelope = json!({
            "result": res.as_ref().ok(),
            "error": res.as_ref().err(),
            "task": task.echo(),
        });
        tokio::spawn(deliver(task.conn().clone(), dest, envelope));
        res
    }
}

async fn deliver(conn: Arc<dyn NexusConn>, dest: ReplyTo, envelope: Value) {
    match dest {
        ReplyTo::Pipe { path } => {
            let pipe = match conn.pipe_open(&path).await {
                Ok(pipe) => pipe,
                Err(e) => {
                    warn!(kind = "reply_to", "could not open pipe {}: {}", path, e);
                    return;
                }
            };
            if let Err(e) = pipe.write(envelope).await {
                warn!(kind = "reply_to", "could not write to pipe {}: {}", path, e);
                return;
            }
            debug!("reply_to: response written to pipe {}", path);
        }
        ReplyTo::Service { path } => {
            if let Err(e) = conn
                .task_push(&path, envelope, SERVICE_REPLY_TIMEOUT, true)
                .await
            {
                warn!(kind = "reply_to", "could not push response to {}: {}", path, e);
                return;
            }
            debug!("reply_to: response pushed to {}", path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::handler_fn;
    use nxsugar_core::error::ERR_INVALID_PARAMS;
    use nxsugar_core::mem::{MemBroker, Reply};
    use nxsugar_core::{JsonRpcError, PulledTask};

    async fn pull_one(broker: &MemBroker) -> Task {
        let conn = broker.connect_mem();
        let pulled: PulledTask = conn
            .task_pull("test.svc", Duration::from_secs(1))
            .await
            .unwrap();
        Task::new(pulled, conn)
    }

    #[tokio::test]
    async fn test_without_destination_passes_through() {
        let broker = MemBroker::new();
        let pending = broker.push("test.svc.echo", json!({"a": 1}));
        let mut task = pull_one(&broker).await;

        let handler = reply_to(handler_fn(|task: &Task| Ok(task.params.clone())));
        let res = handler.call(&mut task).await;

        assert_eq!(res, Ok(json!({"a": 1})));
        assert!(!task.is_replied());
        drop(pending);
    }

    #[tokio::test]
    async fn test_routes_to_pipe() {
        let broker = MemBroker::new();
        let mut reader = broker.create_pipe();
        let params = json!({"v": 3, "replyTo": {"type": "pipe", "path": reader.id()}});
        let pending = broker.push("test.svc.echo", params.clone());
        let mut task = pull_one(&broker).await;

        let handler = reply_to(handler_fn(|_: &Task| Ok(json!("done"))));
        let res = handler.call(&mut task).await;
        assert_eq!(res, Ok(json!("done")));
        assert!(task.is_replied());

        assert_eq!(
            pending.wait_timeout(Duration::from_secs(1)).await,
            Some(Reply::Accepted)
        );
        let routed = reader.read_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(routed["result"], json!("done"));
        assert_eq!(routed["error"], Value::Null);
        assert_eq!(routed["task"]["method"], json!("echo"));
        assert_eq!(routed["task"]["params"], params);
    }

    #[tokio::test]
    async fn test_routes_handler_error() {
        let broker = MemBroker::new();
        let mut reader = broker.create_pipe();
        let params = json!({"replyTo": {"type": "pipe", "path": reader.id()}});
        let pending = broker.push("test.svc.check", params);
        let mut task = pull_one(&broker).await;

        let handler = reply_to(handler_fn(|_: &Task| {
            Err(JsonRpcError::new(ERR_INVALID_PARAMS, "bad input", None))
        }));
        let res = handler.call(&mut task).await;
        assert_eq!(res.unwrap_err().code, ERR_INVALID_PARAMS);

        assert_eq!(
            pending.wait_timeout(Duration::from_secs(1)).await,
            Some(Reply::Accepted)
        );
        let routed = reader.read_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(routed["result"], Value::Null);
        assert_eq!(routed["error"]["code"], json!(ERR_INVALID_PARAMS));
        assert_eq!(routed["error"]["message"], json!("bad input"));
    }

    #[tokio::test]
    async fn test_failed_delivery_is_dropped() {
        let broker = MemBroker::new();
        let conn = broker.connect_mem();
        let envelope = json!({"result": 1, "error": null, "task": {}});

        deliver(
            conn.clone(),
            ReplyTo::Pipe {
                path: "missing".to_string(),
            },
            envelope.clone(),
        )
        .await;

        conn.close().await;
        deliver(
            conn,
            ReplyTo::Service {
                path: "test.collector.collect".to_string(),
            },
            envelope,
        )
        .await;
        assert_eq!(broker.pending("test.collector"), 0);
    }
}
