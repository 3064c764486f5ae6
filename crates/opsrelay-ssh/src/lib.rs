pub mod exec;
pub mod settings;

pub use exec::{ConnectionTest, SshExecutor, SshExecutorConfig};
pub use settings::{
    ResolvedTarget, SettingsError, SettingsStore, SshSettings, SshSettingsPublic,
};
