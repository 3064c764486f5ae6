pub mod catalog;
pub mod error;
pub mod executor;
pub mod instance;
pub mod output;
pub mod registry;

pub use catalog::{CommandMeta, Whitelist, WhitelistedCommand, builtin_catalog};
pub use error::RegistryError;
pub use executor::{ExecError, ExecEvent, ExecEventHandler, ExecSpec, RemoteExecutor};
pub use instance::{CommandInstance, CommandStatus, InstanceSnapshot};
pub use output::{DEFAULT_BUFFER_MAX_LINES, OutputBuffer, OutputKind, OutputLine, now_ms};
pub use registry::{CommandRegistry, RegistryConfig};
