use crate::context::ServeContext;
use crate::error::ServiceError;
use crate::format::format_secs;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Time a hard stop waits before the run is declared done.
pub(crate) const HARD_STOP_FAILSAFE: Duration = Duration::from_secs(1);

/// Commands room on top of one per pull worker.
const QUEUE_HEADROOM: usize = 1024;

/// Lifecycle events consumed by the arbiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    StatsTicker,
    Graceful,
    Stop,
    TaskWorkersDone,
    GracefulTimeout,
    ConnectionEnded(String),
}

/// Producer side of the command queue. Sending never blocks.
#[derive(Clone)]
pub(crate) struct CommandSender {
    tx: mpsc::Sender<Command>,
}

impl CommandSender {
    pub fn send(&self, cmd: Command) {
        match self.tx.try_send(cmd) {
            Ok(()) => {}
            Err(TrySendError::Full(cmd)) => {
                error!(kind = "command_queue", "command queue full, dropping {:?}", cmd);
            }
            Err(TrySendError::Closed(cmd)) => {
                debug!("command queue closed, dropping {:?}", cmd);
            }
        }
    }
}

pub(crate) fn command_queue(pulls: usize) -> (CommandSender, mpsc::Receiver<Command>) {
    let (tx, rx) = mpsc::channel(pulls + QUEUE_HEADROOM);
    (CommandSender { tx }, rx)
}

enum Step {
    Continue,
    Done(Result<(), ServiceError>),
}

/// Single consumer of the command queue. Owns every shutdown decision of a run.
pub(crate) struct Arbiter {
    ctx: Arc<ServeContext>,
    commands: mpsc::Receiver<Command>,
    pullers: Option<Vec<JoinHandle<()>>>,
    graceful_exit: Duration,
    stats_period: Duration,
    max_threads: usize,
    graceful: bool,
    hard_stop_armed: bool,
    timer: Option<JoinHandle<()>>,
    stats_ticker: Option<JoinHandle<()>>,
    watchers: Vec<JoinHandle<()>>,
}

impl Arbiter {
    pub fn new(
        ctx: Arc<ServeContext>,
        commands: mpsc::Receiver<Command>,
        pullers: Vec<JoinHandle<()>>,
        graceful_exit: Duration,
        stats_period: Duration,
        max_threads: usize,
    ) -> Self {
        Arbiter {
            ctx,
            commands,
            pullers: Some(pullers),
            graceful_exit,
            stats_period,
            max_threads,
            graceful: false,
            hard_stop_armed: false,
            timer: None,
            stats_ticker: None,
            watchers: Vec::new(),
        }
    }

    /// Consume commands until a terminal transition.
    pub async fn run(mut self) -> Result<(), ServiceError> {
        self.start_stats_ticker();

        let outcome = loop {
            let Some(cmd) = self.commands.recv().await else {
                break Ok(());
            };
            if let Step::Done(outcome) = self.handle(cmd) {
                break outcome;
            }
        };

        self.cancel_timers();
        outcome
    }

    fn handle(&mut self, cmd: Command) -> Step {
        match cmd {
            Command::StatsTicker => {
                self.log_stats();
                Step::Continue
            }
            Command::Stop => {
                self.graceful = false;
                self.ctx.set_stopping();
                info!(service = %self.ctx.name, kind = "stop", "stop: closing nexus connection");
                self.ctx.close_connection();
                if !self.hard_stop_armed {
                    self.hard_stop_armed = true;
                    self.arm_timer(HARD_STOP_FAILSAFE);
                }
                Step::Continue
            }
            Command::Graceful => {
                if self.ctx.set_stopping() {
                    return Step::Continue;
                }
                self.graceful = true;
                info!(
                    service = %self.ctx.name,
                    kind = "graceful",
                    "graceful: waiting {} for running tasks",
                    format_secs(self.graceful_exit)
                );
                self.arm_timer(self.graceful_exit);
                self.watch_drain();
                Step::Continue
            }
            Command::TaskWorkersDone => {
                debug!("graceful: task workers done, closing nexus connection");
                self.ctx.close_connection();
                self.watch_pullers();
                Step::Continue
            }
            Command::GracefulTimeout => {
                if !self.graceful {
                    debug!("stop: done");
                    return Step::Done(Ok(()));
                }
                self.ctx.close_connection();
                let err = ServiceError::GracefulTimeout(self.graceful_exit);
                error!(service = %self.ctx.name, kind = "graceful_timeout", "{}", err);
                Step::Done(Err(err))
            }
            Command::ConnectionEnded(reason) => {
                if self.ctx.is_stopping() {
                    if self.graceful {
                        debug!("graceful: done");
                    } else {
                        debug!("stop: done");
                    }
                    return Step::Done(Ok(()));
                }
                let err = ServiceError::ConnectionEnded(reason);
                error!(service = %self.ctx.name, kind = "connection_ended", "{}", err);
                Step::Done(Err(err))
            }
        }
    }

    fn log_stats(&self) {
        let s = self.ctx.stats.snapshot();
        debug!(
            service = %self.ctx.name,
            kind = "stats",
            "stats: threads[ {}/{} ] task_pulls[ done={} timeouts={} ] tasks[ pulled={} panic={} errmethod={} served={} running={} ]",
            s.threads_used,
            self.max_threads,
            s.task_pulls_done,
            s.task_pull_timeouts,
            s.tasks_pulled,
            s.tasks_panic,
            s.tasks_method_not_found,
            s.tasks_served,
            s.tasks_running
        );
    }

    fn start_stats_ticker(&mut self) {
        if self.stats_period.is_zero() {
            return;
        }
        let commands = self.ctx.commands.clone();
        let period = self.stats_period;
        self.stats_ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                commands.send(Command::StatsTicker);
            }
        }));
    }

    /// Replace the pending timeout with one firing after `after`.
    fn arm_timer(&mut self, after: Duration) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let commands = self.ctx.commands.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            commands.send(Command::GracefulTimeout);
        }));
    }

    fn watch_drain(&mut self) {
        let workers = self.ctx.workers.clone();
        let commands = self.ctx.commands.clone();
        self.watchers.push(tokio::spawn(async move {
            workers.wait_drained().await;
            commands.send(Command::TaskWorkersDone);
        }));
    }

    fn watch_pullers(&mut self) {
        let pullers = self.pullers.take().unwrap_or_default();
        let workers = self.ctx.workers.clone();
        let commands = self.ctx.commands.clone();
        self.watchers.push(tokio::spawn(async move {
            for puller in pullers {
                let _ = puller.await;
            }
            // A puller may have handed off a task after the first drain.
            workers.wait_drained().await;
            commands.send(Command::ConnectionEnded("closed by service".to_string()));
        }));
    }

    fn cancel_timers(&mut self) {
        for handle in self
            .timer
            .take()
            .into_iter()
            .chain(self.stats_ticker.take())
            .chain(self.watchers.drain(..))
        {
            handle.abort();
        }
    }
}
