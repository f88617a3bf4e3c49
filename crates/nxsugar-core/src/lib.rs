pub mod conn;
pub mod error;
pub mod mem;
mod stats;
mod task;

pub use conn::{Connector, NexusConn, Pipe, PulledTask};
pub use error::{error_message, JsonRpcError, NexusError, Result};
pub use stats::{Stats, StatsSnapshot};
pub use task::{Annotations, ReplyTo, Task, METADATA_KEY, REPLY_TO_KEY};
