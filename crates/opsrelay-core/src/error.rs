use thiserror::Error;

use crate::executor::ExecError;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("too many running commands ({0} active)")]
    TooManyRunning(usize),

    #[error(transparent)]
    Exec(#[from] ExecError),
}
