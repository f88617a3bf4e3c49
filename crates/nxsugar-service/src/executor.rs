use crate::context::ServeContext;
use crate::limiter::Slot;
use crate::method::{Dispatch, Handler, Method};
use crate::workers::WorkerGuard;
use futures::FutureExt;
use nxsugar_core::error::{ERR_INTERNAL, ERR_PACT_NOT_DEFINED, ERR_TESTING_METHOD_NOT_PROVIDED};
use nxsugar_core::{JsonRpcError, Task};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Callback run around every task. Errors and panics are logged, never propagated.
pub type TaskHook = Arc<dyn Fn(&Task) -> anyhow::Result<()> + Send + Sync>;

/// Pre and post action hooks.
#[derive(Clone, Default)]
pub struct Hooks {
    pub pre_action: Option<TaskHook>,
    pub post_action: Option<TaskHook>,
}

/// Serves a single pulled task: hooks, mock/test dispatch, the reply and
/// the panic firewall.
pub(crate) struct TaskExecutor {
    ctx: Arc<ServeContext>,
    puller: usize,
}

impl TaskExecutor {
    pub fn new(ctx: Arc<ServeContext>, puller: usize) -> Self {
        TaskExecutor { ctx, puller }
    }

    /// Execute a task, releasing `slot` and `worker` once done
    pub async fn execute(self, mut task: Task, dispatch: Dispatch, slot: Slot, worker: WorkerGuard) {
        self.ctx.stats.add_tasks_running(1);
        let method = dispatch.method().clone();

        match AssertUnwindSafe(self.serve(&mut task, &method))
            .catch_unwind()
            .await
        {
            Ok(()) => self.ctx.stats.add_tasks_served(1),
            Err(panic) => {
                self.ctx.stats.add_tasks_panic(1);
                let trace = panic_message(panic.as_ref());
                error!(
                    service = %self.ctx.name,
                    kind = "panic",
                    "pull {}: panic serving task {} ({}): {}",
                    self.puller, task.id, task.method, trace
                );
                if let Err(e) = task.send_error(ERR_INTERNAL, trace, None).await {
                    warn!("pull {}: replying panicked task {}: {}", self.puller, task.id, e);
                }
            }
        }

        self.ctx.stats.add_tasks_running(-1);
        drop(slot);
        drop(worker);
    }

    async fn serve(&self, task: &mut Task, method: &Method) {
        self.run_hook("preaction", self.ctx.hooks.pre_action.as_ref(), task);

        if task.metadata_flag("pact") {
            self.reply_pact(task, method).await;
        } else {
            if method.schema.as_ref().is_some_and(|s| s.input.is_some()) {
                debug!("method {} has an input schema, params are not validated", task.method);
            }
            if task.metadata_flag("testing") {
                match method.test_handler() {
                    Some(handler) => self.invoke(task, handler).await,
                    None => {
                        let err = JsonRpcError::from_code(ERR_TESTING_METHOD_NOT_PROVIDED);
                        self.reply_error(task, err).await;
                    }
                }
            } else {
                self.invoke(task, method.handler()).await;
            }
            self.log_response(task, method);
        }

        self.run_hook("postaction", self.ctx.hooks.post_action.as_ref(), task);
    }

    async fn invoke(&self, task: &mut Task, handler: &Arc<dyn Handler>) {
        match handler.call(task).await {
            Ok(result) => {
                if !result.is_null() {
                    task.annotations_mut().result = Some(result.clone());
                }
                if !task.is_replied() {
                    if let Err(e) = task.send_result(result).await {
                        warn!("pull {}: replying task {}: {}", self.puller, task.id, e);
                    }
                }
            }
            Err(err) => {
                task.annotations_mut().error = Some(err.clone());
                if !task.is_replied() {
                    self.reply_error(task, err).await;
                }
            }
        }
    }

    async fn reply_pact(&self, task: &mut Task, method: &Method) {
        let metadata = task.metadata().cloned();
        let output = method
            .pacts()
            .iter()
            .find(|pact| pact.matches(metadata.as_ref(), &task.params))
            .map(|pact| pact.output.clone());

        let sent = match output {
            Some(output) => task.send_result(output).await,
            None => {
                task.send_json_rpc_error(JsonRpcError::from_code(ERR_PACT_NOT_DEFINED))
                    .await
            }
        };
        if let Err(e) = sent {
            warn!("pull {}: replying pact for task {}: {}", self.puller, task.id, e);
        }
    }

    async fn reply_error(&self, task: &mut Task, err: JsonRpcError) {
        if let Err(e) = task.send_json_rpc_error(err).await {
            warn!("pull {}: replying task {}: {}", self.puller, task.id, e);
        }
    }

    fn log_response(&self, task: &Task, method: &Method) {
        let annotations = task.annotations();
        if method.options.enable_response_result_log {
            if let Some(result) = &annotations.result {
                info!(
                    service = %self.ctx.name,
                    kind = "response_result",
                    "pull {}: task[ path={} method={} id={} ] result: {}",
                    self.puller, task.path, task.method, task.id, result
                );
            }
        }
        if method.options.enable_response_error_log {
            if let Some(err) = &annotations.error {
                info!(
                    service = %self.ctx.name,
                    kind = "response_error",
                    "pull {}: task[ path={} method={} id={} ] error: {}",
                    self.puller, task.path, task.method, task.id, err
                );
            }
        }
    }

    fn run_hook(&self, name: &str, hook: Option<&TaskHook>, task: &Task) {
        let Some(hook) = hook else {
            return;
        };
        match std::panic::catch_unwind(AssertUnwindSafe(|| hook(task))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(service = %self.ctx.name, kind = name, "pull {}: {} hook: {:#}", self.puller, name, e);
            }
            Err(panic) => {
                error!(
                    service = %self.ctx.name,
                    kind = name,
                    "pull {}: {} hook panicked: {}",
                    self.puller, name, panic_message(panic.as_ref())
                );
            }
        }
    }
}

/// Text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "code 7");

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(42u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "panic with a non-string payload");
    }
}
