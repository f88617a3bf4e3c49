//! In-process broker.
//!
//! Implements the connection traits over local queues so services can be
//! exercised without a nexus server: tests push tasks and await their replies,
//! the demo binary feeds tasks from stdin.

use crate::conn::{Connector, NexusConn, Pipe, PulledTask};
use crate::error::{ERR_INVALID_PIPE, ERR_INVALID_TASK};
use crate::{JsonRpcError, NexusError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Final answer received for a pushed task.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Accepted,
    Result(Value),
    Error(JsonRpcError),
}

/// Handle on the reply of a task pushed with [`MemBroker::push`].
pub struct PendingReply {
    rx: oneshot::Receiver<Reply>,
}

impl PendingReply {
    /// Wait for the reply. `None` if the task was dropped without one.
    pub async fn wait(self) -> Option<Reply> {
        self.rx.await.ok()
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Option<Reply> {
        tokio::time::timeout(timeout, self.rx).await.ok()?.ok()
    }
}

/// Read end of a pipe created with [`MemBroker::create_pipe`].
pub struct PipeReader {
    id: String,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl PipeReader {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn read(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub async fn read_timeout(&mut self, timeout: Duration) -> Option<Value> {
        tokio::time::timeout(timeout, self.rx.recv()).await.ok()?
    }
}

struct Queued {
    task: PulledTask,
    reply: Option<oneshot::Sender<Reply>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Queued>>,
    inflight: HashMap<String, Option<oneshot::Sender<Reply>>>,
    pipes: HashMap<String, mpsc::UnboundedSender<Value>>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    arrivals: Notify,
    down: CancellationToken,
}

/// Local broker shared by any number of [`MemConn`]s.
#[derive(Clone)]
pub struct MemBroker {
    inner: Arc<BrokerInner>,
}

impl MemBroker {
    pub fn new() -> Self {
        MemBroker {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                arrivals: Notify::new(),
                down: CancellationToken::new(),
            }),
        }
    }

    /// Open a new connection to this broker.
    pub fn connect_mem(&self) -> Arc<dyn NexusConn> {
        Arc::new(MemConn {
            id: Uuid::new_v4().to_string(),
            broker: self.inner.clone(),
            closed: self.inner.down.child_token(),
        })
    }

    /// Push a task to `path.method` and get a handle on its reply.
    pub fn push(&self, target: &str, params: Value) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        self.inner.enqueue(target, params, Some(tx));
        PendingReply { rx }
    }

    /// Push a task nobody waits on.
    pub fn push_detached(&self, target: &str, params: Value) {
        self.inner.enqueue(target, params, None);
    }

    pub fn create_pipe(&self) -> PipeReader {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.state.lock().pipes.insert(id.clone(), tx);
        PipeReader { id, rx }
    }

    /// Tasks queued on `path` and not yet pulled.
    pub fn pending(&self, path: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(path)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Drop every connection, as if the broker went away.
    pub fn shutdown(&self) {
        self.inner.down.cancel();
    }
}

impl Default for MemBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemBroker {
    fn url(&self) -> String {
        "mem://local".to_string()
    }

    async fn connect(&self) -> Result<Arc<dyn NexusConn>> {
        if self.inner.down.is_cancelled() {
            return Err(NexusError::ConnClosed);
        }
        Ok(self.connect_mem())
    }
}

impl BrokerInner {
    fn enqueue(&self, target: &str, params: Value, reply: Option<oneshot::Sender<Reply>>) {
        let (path, method) = match target.rsplit_once('.') {
            Some((path, method)) => (path.to_string(), method.to_string()),
            None => (String::new(), target.to_string()),
        };
        let task = PulledTask {
            id: Uuid::new_v4().to_string(),
            path: path.clone(),
            method,
            params,
            tags: Map::new(),
        };
        self.state
            .lock()
            .queues
            .entry(path)
            .or_default()
            .push_back(Queued { task, reply });
        self.arrivals.notify_waiters();
    }

    fn pop(&self, path: &str) -> Option<PulledTask> {
        let mut state = self.state.lock();
        let queued = state.queues.get_mut(path)?.pop_front()?;
        state.inflight.insert(queued.task.id.clone(), queued.reply);
        Some(queued.task)
    }

    fn resolve(&self, task_id: &str, reply: Reply) -> Result<()> {
        let sender = self
            .state
            .lock()
            .inflight
            .remove(task_id)
            .ok_or_else(|| NexusError::Remote(JsonRpcError::from_code(ERR_INVALID_TASK)))?;
        if let Some(tx) = sender {
            let _ = tx.send(reply);
        }
        Ok(())
    }
}

/// Connection to a [`MemBroker`].
pub struct MemConn {
    id: String,
    broker: Arc<BrokerInner>,
    closed: CancellationToken,
}

impl MemConn {
    fn check_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(NexusError::ConnClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl NexusConn for MemConn {
    fn conn_id(&self) -> String {
        self.id.clone()
    }

    async fn task_pull(&self, path: &str, timeout: Duration) -> Result<PulledTask> {
        let deadline = (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout);
        loop {
            self.check_open()?;

            let arrival = self.broker.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            if let Some(task) = self.broker.pop(path) {
                return Ok(task);
            }

            let expiry = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.closed.cancelled() => return Err(NexusError::ConnClosed),
                _ = expiry => return Err(NexusError::Timeout),
                _ = &mut arrival => {}
            }
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn task_accept(&self, task_id: &str) -> Result<()> {
        self.check_open()?;
        self.broker.resolve(task_id, Reply::Accepted)
    }

    async fn task_result(&self, task_id: &str, result: Value) -> Result<()> {
        self.check_open()?;
        self.broker.resolve(task_id, Reply::Result(result))
    }

    async fn task_error(&self, task_id: &str, error: JsonRpcError) -> Result<()> {
        self.check_open()?;
        self.broker.resolve(task_id, Reply::Error(error))
    }

    async fn pipe_open(&self, pipe_id: &str) -> Result<Box<dyn Pipe>> {
        self.check_open()?;
        let tx = self
            .broker
            .state
            .lock()
            .pipes
            .get(pipe_id)
            .cloned()
            .ok_or_else(|| NexusError::Remote(JsonRpcError::from_code(ERR_INVALID_PIPE)))?;
        Ok(Box::new(MemPipe {
            id: pipe_id.to_string(),
            tx,
        }))
    }

    async fn task_push(
        &self,
        path: &str,
        params: Value,
        timeout: Duration,
        detach: bool,
    ) -> Result<Option<Value>> {
        self.check_open()?;
        if detach {
            self.broker.enqueue(path, params, None);
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        self.broker.enqueue(path, params, Some(tx));
        let reply = if timeout.is_zero() {
            rx.await.ok()
        } else {
            tokio::time::timeout(timeout, rx)
                .await
                .map_err(|_| NexusError::Timeout)?
                .ok()
        };
        match reply {
            Some(Reply::Result(v)) => Ok(Some(v)),
            Some(Reply::Error(e)) => Err(NexusError::Remote(e)),
            Some(Reply::Accepted) => Ok(None),
            None => Err(NexusError::Cancel),
        }
    }
}

struct MemPipe {
    id: String,
    tx: mpsc::UnboundedSender<Value>,
}

#[async_trait]
impl Pipe for MemPipe {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write(&self, msg: Value) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| NexusError::Remote(JsonRpcError::from_code(ERR_INVALID_PIPE)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pull_and_reply() {
        let broker = MemBroker::new();
        let conn = broker.connect_mem();

        let pending = broker.push("test.fib.compute", json!({"v": 5}));
        assert_eq!(broker.pending("test.fib"), 1);

        let task = conn.task_pull("test.fib", Duration::from_secs(1)).await.unwrap();
        assert_eq!(task.method, "compute");
        assert_eq!(task.params, json!({"v": 5}));

        conn.task_result(&task.id, json!([0, 1, 1])).await.unwrap();
        assert_eq!(pending.wait().await, Some(Reply::Result(json!([0, 1, 1]))));
    }

    #[tokio::test]
    async fn test_pull_timeout() {
        let broker = MemBroker::new();
        let conn = broker.connect_mem();
        let err = conn
            .task_pull("test.empty", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_close_unblocks_pull() {
        let broker = MemBroker::new();
        let conn = broker.connect_mem();

        let puller = conn.clone();
        let handle = tokio::spawn(async move { puller.task_pull("test.empty", Duration::ZERO).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close().await;

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err, NexusError::ConnClosed);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_broker_shutdown_closes_connections() {
        let broker = MemBroker::new();
        let conn = broker.connect_mem();
        broker.shutdown();
        assert!(conn.is_closed());
        assert!(broker.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_pipe_roundtrip() {
        let broker = MemBroker::new();
        let conn = broker.connect_mem();
        let mut reader = broker.create_pipe();

        let pipe = conn.pipe_open(reader.id()).await.unwrap();
        pipe.write(json!({"hello": "world"})).await.unwrap();
        assert_eq!(reader.read().await, Some(json!({"hello": "world"})));

        assert!(conn.pipe_open("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_detached_push() {
        let broker = MemBroker::new();
        let conn = broker.connect_mem();

        let res = conn
            .task_push("test.dest.deliver", json!({"x": 1}), Duration::from_secs(1), true)
            .await
            .unwrap();
        assert_eq!(res, None);
        assert_eq!(broker.pending("test.dest"), 1);
    }
}
