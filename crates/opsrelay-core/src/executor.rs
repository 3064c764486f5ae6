use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// What to run remotely: the joined command line plus the working
/// directory it should run in, if the whitelist entry carries one.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub command: String,
    pub cwd: Option<String>,
}

/// Events produced by one remote run. Exactly one of `Exit` or `Error`
/// terminates the stream; no events follow a terminal.
#[derive(Debug, Clone)]
pub enum ExecEvent {
    Stdout(String),
    Stderr(String),
    Exit(Option<i32>),
    Error(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("remote target not configured")]
    NotConfigured,

    #[error("{0}")]
    Config(String),
}

pub type ExecEventHandler = Box<dyn Fn(ExecEvent) + Send + Sync>;

/// Seam between the registry and whatever transport actually runs
/// commands. The registry calls `preflight` synchronously before creating
/// an instance, then hands the run off with `spawn` and never waits on it.
pub trait RemoteExecutor: Send + Sync {
    /// Synchronous readiness check: configured target, usable credentials.
    /// A failure here fails the start request without creating an instance.
    fn preflight(&self) -> Result<(), ExecError>;

    /// Start `spec` remotely, streaming output through `on_event`.
    /// Implementations must emit exactly one terminal event, observe
    /// `cancel` as an advisory termination signal, and never panic across
    /// this boundary.
    fn spawn(&self, spec: ExecSpec, cancel: CancellationToken, on_event: ExecEventHandler);
}
