use crate::arbiter::CommandSender;
use crate::executor::Hooks;
use crate::limiter::Limiter;
use crate::method::MethodRegistry;
use crate::workers::ActiveWorkers;
use nxsugar_core::{NexusConn, Stats};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// State shared by the pull workers, executors and arbiter of one serve run.
pub(crate) struct ServeContext {
    pub name: String,
    pub path: String,
    pub pull_timeout: Duration,
    pub conn: Arc<dyn NexusConn>,
    pub registry: Arc<MethodRegistry>,
    pub stats: Arc<Stats>,
    pub limiter: Limiter,
    pub workers: ActiveWorkers,
    pub commands: CommandSender,
    pub hooks: Hooks,
    stopping: AtomicBool,
}

impl ServeContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        path: String,
        pull_timeout: Duration,
        max_threads: usize,
        conn: Arc<dyn NexusConn>,
        registry: Arc<MethodRegistry>,
        stats: Arc<Stats>,
        commands: CommandSender,
        hooks: Hooks,
    ) -> Self {
        ServeContext {
            name,
            path,
            pull_timeout,
            limiter: Limiter::new(max_threads, stats.clone()),
            conn,
            registry,
            stats,
            workers: ActiveWorkers::new(),
            commands,
            hooks,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Mark the run as stopping. Returns whether it already was.
    pub fn set_stopping(&self) -> bool {
        self.stopping.swap(true, Ordering::SeqCst)
    }

    /// Close the connection off the caller's task.
    pub fn close_connection(&self) {
        let conn = self.conn.clone();
        tokio::spawn(async move { conn.close().await });
    }
}
