use crate::arbiter::{command_queue, Arbiter, Command, CommandSender};
use crate::builtin;
use crate::config::ServiceConfig;
use crate::context::ServeContext;
use crate::error::{Result, ServiceError};
use crate::executor::{Hooks, TaskHook};
use crate::format::format_secs;
use crate::method::{Handler, Method, MethodRegistry};
use crate::puller;
use chrono::{DateTime, Utc};
use nxsugar_core::{Connector, NexusConn, Stats, StatsSnapshot, Task};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use tracing::{debug, error, info};

/// Lifecycle of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Initializing,
    Connecting,
    Serving,
    Stopped,
}

/// Called on every state change.
pub type StateListener = Arc<dyn Fn(ServiceState) + Send + Sync>;

/// Serves the methods registered on it from one broker path.
///
/// Cloning is cheap and every clone controls the same service, so a clone
/// can be kept around to call [`Service::stop`] while another one serves.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

pub(crate) struct ServiceInner {
    pub(crate) config: RwLock<ServiceConfig>,
    pub(crate) registry: Arc<MethodRegistry>,
    pub(crate) stats: Arc<Stats>,
    pub(crate) started: DateTime<Utc>,
    hooks: RwLock<Hooks>,
    builtins: Once,
    state: Mutex<Option<ServiceState>>,
    state_listener: RwLock<Option<StateListener>>,
    control: Mutex<Option<Control>>,
    serving: AtomicBool,
}

/// Handles valid while a run is in progress.
struct Control {
    commands: CommandSender,
    conn: Arc<dyn NexusConn>,
}

impl Service {
    pub fn new(config: ServiceConfig) -> Self {
        Service {
            inner: Arc::new(ServiceInner {
                config: RwLock::new(config),
                registry: Arc::new(MethodRegistry::new()),
                stats: Arc::new(Stats::new()),
                started: Utc::now(),
                hooks: RwLock::new(Hooks::default()),
                builtins: Once::new(),
                state: Mutex::new(None),
                state_listener: RwLock::new(None),
                control: Mutex::new(None),
                serving: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner.config.read().name.clone()
    }

    pub fn path(&self) -> String {
        self.inner.config.read().path.clone()
    }

    pub fn is_testing(&self) -> bool {
        self.inner.config.read().testing
    }

    pub fn config(&self) -> ServiceConfig {
        self.inner.config.read().clone()
    }

    /// Edit the config. Changes apply to the next `serve()`.
    pub fn configure(&self, f: impl FnOnce(&mut ServiceConfig)) {
        f(&mut self.inner.config.write());
    }

    /// Register a method with default options and no schema.
    pub fn add_method<H: Handler + 'static>(&self, name: &str, handler: H) -> Result<()> {
        self.add_method_with(name, Method::new(handler))
    }

    /// Register a fully described method. Names starting with `@` are reserved.
    pub fn add_method_with(&self, name: &str, method: Method) -> Result<()> {
        if name.is_empty() {
            return Err(ServiceError::invalid("method", "name must not be empty"));
        }
        if name.starts_with('@') {
            return Err(ServiceError::invalid(
                format!("method {}", name),
                "names starting with @ are reserved",
            ));
        }
        let service = Arc::downgrade(&self.inner);
        self.inner
            .builtins
            .call_once(|| builtin::register(&self.inner.registry, service));
        if self.inner.registry.contains(name) {
            debug!("replacing method {}", name);
        }
        self.inner.registry.register(name, method);
        Ok(())
    }

    /// Route every task to `handler`, whatever its method name.
    pub fn set_handler<H: Handler + 'static>(&self, handler: H) {
        self.set_handler_with(Method::new(handler));
    }

    pub fn set_handler_with(&self, method: Method) {
        self.inner.registry.set_global(method);
    }

    /// Replace both task hooks.
    pub fn set_hooks(&self, hooks: Hooks) {
        *self.inner.hooks.write() = hooks;
    }

    pub fn set_pre_action<F>(&self, hook: F)
    where
        F: Fn(&Task) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.hooks.write().pre_action = Some(Arc::new(hook) as TaskHook);
    }

    pub fn set_post_action<F>(&self, hook: F)
    where
        F: Fn(&Task) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.hooks.write().post_action = Some(Arc::new(hook) as TaskHook);
    }

    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(ServiceState) + Send + Sync + 'static,
    {
        *self.inner.state_listener.write() = Some(Arc::new(listener));
    }

    /// Registered method names, built-ins included. Empty when a global handler is set.
    pub fn methods(&self) -> Vec<String> {
        if self.inner.registry.has_global() {
            return Vec::new();
        }
        self.inner.registry.names()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// `None` until the first `serve()`.
    pub fn state(&self) -> Option<ServiceState> {
        *self.inner.state.lock()
    }

    /// Connection of the run in progress.
    pub fn conn(&self) -> Option<Arc<dyn NexusConn>> {
        self.inner.control.lock().as_ref().map(|c| c.conn.clone())
    }

    /// Connect through `connector` and serve until stopped.
    ///
    /// Returns `Ok` after a requested stop that completed in time, or the
    /// error that ended the run.
    pub async fn serve(&self, connector: &dyn Connector) -> Result<()> {
        self.begin()?;
        self.set_state(ServiceState::Connecting);

        let url = connector.url();
        let conn = match connector.connect().await {
            Ok(conn) => conn,
            Err(source) => {
                let err = ServiceError::Connect { url, source };
                error!(service = %self.name(), kind = "connect", "{}", err);
                self.finish();
                return Err(err);
            }
        };
        info!("Connected to nexus server at {}", url);

        self.run(conn).await
    }

    /// Serve over an established connection, possibly shared with other services.
    pub async fn serve_conn(&self, conn: Arc<dyn NexusConn>) -> Result<()> {
        self.begin()?;
        self.run(conn).await
    }

    /// Stop pulling and wait up to `graceful_exit` for running tasks.
    /// Ignored unless serving; later calls during the same run are ignored too.
    pub fn graceful_stop(&self) {
        self.send(Command::Graceful);
    }

    /// Close the connection now. Running tasks are abandoned.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    fn send(&self, cmd: Command) {
        if self.state() != Some(ServiceState::Serving) {
            debug!("{:?} ignored: service is not serving", cmd);
            return;
        }
        if let Some(control) = self.inner.control.lock().as_ref() {
            control.commands.send(cmd);
        }
    }

    fn begin(&self) -> Result<()> {
        if self.inner.serving.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::AlreadyServing);
        }
        self.set_state(ServiceState::Initializing);
        if self.inner.registry.is_empty() {
            error!(service = %self.name(), kind = "no_methods", "no methods to serve");
            self.finish();
            return Err(ServiceError::NoMethods);
        }
        let valid = {
            let mut config = self.inner.config.write();
            config.normalize();
            config.validate()
        };
        if let Err(e) = valid {
            error!(service = %self.name(), kind = "config", "{}", e);
            self.finish();
            return Err(e);
        }
        Ok(())
    }

    async fn run(&self, conn: Arc<dyn NexusConn>) -> Result<()> {
        let config = self.inner.config.read().clone();

        let (commands, rx) = command_queue(config.pulls);
        let hooks = self.inner.hooks.read().clone();
        let ctx = Arc::new(ServeContext::new(
            config.name.clone(),
            config.path.clone(),
            config.pull_timeout,
            config.max_threads,
            conn.clone(),
            self.inner.registry.clone(),
            self.inner.stats.clone(),
            commands.clone(),
            hooks,
        ));
        *self.inner.control.lock() = Some(Control {
            commands,
            conn: conn.clone(),
        });

        info!(
            service = %config.name,
            kind = "start",
            "{} service started: path={} pulls={} pull_timeout={} max_threads={} stats_period={} graceful_exit={} testing={} version={} connid={}",
            config.name,
            config.path,
            config.pulls,
            format_secs(config.pull_timeout),
            config.max_threads,
            format_secs(config.stats_period),
            format_secs(config.graceful_exit),
            config.testing,
            config.version,
            conn.conn_id()
        );
        self.set_state(ServiceState::Serving);

        let pullers = (1..=config.pulls)
            .map(|n| tokio::spawn(puller::pull_loop(ctx.clone(), n)))
            .collect();
        let outcome = Arbiter::new(
            ctx,
            rx,
            pullers,
            config.graceful_exit,
            config.stats_period,
            config.max_threads,
        )
        .run()
        .await;

        self.finish();
        outcome
    }

    fn finish(&self) {
        self.inner.control.lock().take();
        self.set_state(ServiceState::Stopped);
        self.inner.serving.store(false, Ordering::SeqCst);
    }

    fn set_state(&self, state: ServiceState) {
        *self.inner.state.lock() = Some(state);
        let listener = self.inner.state_listener.read().clone();
        if let Some(listener) = listener {
            listener(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::handler_fn;
    use serde_json::json;

    fn service() -> Service {
        Service::new(ServiceConfig::new("test", "test.svc"))
    }

    #[test]
    fn test_builtins_registered_with_first_method() {
        let svc = service();
        assert!(svc.methods().is_empty());

        svc.add_method("echo", handler_fn(|t: &Task| Ok(t.params.clone())))
            .unwrap();
        assert_eq!(svc.methods(), vec!["@info", "@ping", "@schema", "echo"]);

        svc.set_handler(handler_fn(|_: &Task| Ok(json!(null))));
        assert!(svc.methods().is_empty());
    }

    #[test]
    fn test_reserved_method_names() {
        let svc = service();
        let res = svc.add_method("@ping", handler_fn(|_: &Task| Ok(json!(1))));
        assert!(matches!(res, Err(ServiceError::InvalidConfig { .. })));
        assert!(svc.add_method("", handler_fn(|_: &Task| Ok(json!(1)))).is_err());
    }

    #[tokio::test]
    async fn test_serve_without_methods() {
        let svc = service();
        let broker = nxsugar_core::mem::MemBroker::new();
        assert_eq!(svc.serve(&broker).await, Err(ServiceError::NoMethods));
        assert_eq!(svc.state(), Some(ServiceState::Stopped));
    }

    struct CountingConnector {
        broker: nxsugar_core::mem::MemBroker,
        dials: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Connector for CountingConnector {
        fn url(&self) -> String {
            self.broker.url()
        }

        async fn connect(&self) -> nxsugar_core::Result<Arc<dyn NexusConn>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            self.broker.connect().await
        }
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_connecting() {
        let svc = Service::new(ServiceConfig::new("test", ""));
        svc.add_method("echo", handler_fn(|t: &Task| Ok(t.params.clone())))
            .unwrap();
        let connector = CountingConnector {
            broker: nxsugar_core::mem::MemBroker::new(),
            dials: std::sync::atomic::AtomicUsize::new(0),
        };

        let res = svc.serve(&connector).await;
        assert!(matches!(res, Err(ServiceError::InvalidConfig { .. })));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 0);
        assert_eq!(svc.state(), Some(ServiceState::Stopped));
        assert!(svc.conn().is_none());
    }

    #[test]
    fn test_stop_before_serve_is_ignored() {
        let svc = service();
        svc.stop();
        svc.graceful_stop();
        assert_eq!(svc.state(), None);
    }
}
