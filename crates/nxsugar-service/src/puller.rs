use crate::arbiter::Command;
use crate::context::ServeContext;
use crate::executor::TaskExecutor;
use nxsugar_core::error::{ERR_CANCEL, ERR_METHOD_NOT_FOUND};
use nxsugar_core::{JsonRpcError, Task};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Pull worker `n`: waits for a slot, pulls a task and hands it to an executor.
///
/// Exits when the run is stopping or the connection fails. Unexpected pull
/// errors are escalated to the arbiter as `ConnectionEnded`.
pub(crate) async fn pull_loop(ctx: Arc<ServeContext>, n: usize) {
    loop {
        if ctx.is_stopping() {
            return;
        }
        let Some(slot) = ctx.limiter.acquire().await else {
            return;
        };
        if ctx.is_stopping() {
            return;
        }

        ctx.stats.add_task_pulls_done(1);
        let pulled = match ctx.conn.task_pull(&ctx.path, ctx.pull_timeout).await {
            Ok(pulled) => pulled,
            Err(e) if e.is_timeout() => {
                ctx.stats.add_task_pull_timeouts(1);
                continue;
            }
            Err(e) => {
                if !ctx.is_stopping() || !e.is_cancel_or_closed() {
                    error!(service = %ctx.name, kind = "pull_error", "pull {}: pulling task: {}", n, e);
                    ctx.commands.send(Command::ConnectionEnded(e.to_string()));
                }
                ctx.conn.close().await;
                return;
            }
        };

        ctx.stats.add_tasks_pulled(1);
        let mut task = Task::new(pulled, ctx.conn.clone());

        // Pulled after a stop was requested: nobody will wait for an executor.
        if ctx.is_stopping() {
            let _worker = ctx.workers.register();
            if let Err(e) = task
                .send_json_rpc_error(JsonRpcError::from_code(ERR_CANCEL))
                .await
            {
                warn!("pull {}: cancelling task {} pulled while stopping: {}", n, task.id, e);
            }
            return;
        }

        let Some(dispatch) = ctx.registry.resolve(&task.method) else {
            if let Err(e) = task
                .send_json_rpc_error(JsonRpcError::from_code(ERR_METHOD_NOT_FOUND))
                .await
            {
                warn!("pull {}: replying unknown method {}: {}", n, task.method, e);
            }
            ctx.stats.add_tasks_method_not_found(1);
            continue;
        };

        if !dispatch.method().options.disable_pull_log {
            info!(
                service = %ctx.name,
                kind = "pull",
                "pull {}: task[ path={} method={} id={} ]",
                n, task.path, task.method, task.id
            );
        }

        let worker = ctx.workers.register();
        let executor = TaskExecutor::new(ctx.clone(), n);
        tokio::spawn(executor.execute(task, dispatch, slot, worker));
    }
}
