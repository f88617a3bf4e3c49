pub mod config;
pub mod error;
pub mod format;
pub mod method;
pub mod reply_to;
pub mod server;
pub mod service;

mod arbiter;
mod builtin;
mod context;
mod executor;
mod limiter;
mod puller;
mod workers;

pub use config::{ServerConfig, ServiceConfig};
pub use error::{Result, ServiceError};
pub use executor::{Hooks, TaskHook};
pub use format::format_secs;
pub use method::{
    handler_fn, Dispatch, FnHandler, Handler, Method, MethodOptions, MethodRegistry,
    MethodResult, MethodSchema, Pact,
};
pub use reply_to::{reply_to, ReplyToHandler};
pub use server::Server;
pub use service::{Service, ServiceState, StateListener};

pub use nxsugar_core::{JsonRpcError, NexusConn, StatsSnapshot, Task};
