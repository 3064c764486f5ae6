use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Execution mapping for one whitelisted command. Static, configured at
/// startup; the only commands the system will ever run.
#[derive(Debug, Clone)]
pub struct WhitelistedCommand {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
}

impl WhitelistedCommand {
    pub fn new(command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// The command line as shown in `START` meta lines.
    pub fn full_command(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    entries: HashMap<String, WhitelistedCommand>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in command set. `remote_home` is the working directory
    /// used for the compose restart on the remote host.
    pub fn builtin(remote_home: Option<&str>) -> Self {
        let mut wl = Self::new();
        let mut restart = WhitelistedCommand::new("docker", &["compose", "restart"]);
        if let Some(home) = remote_home {
            restart = restart.with_cwd(home);
        }
        wl.insert("docker-restart", restart);
        wl.insert("docker-ps", WhitelistedCommand::new("docker", &["ps"]));
        wl.insert("host-reboot", WhitelistedCommand::new("/sbin/reboot", &[]));
        wl
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: WhitelistedCommand) {
        self.entries.insert(key.into(), entry);
    }

    pub fn get(&self, key: &str) -> Option<&WhitelistedCommand> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

/// UI-safe catalog metadata for one command. Never carries execution
/// details beyond the public key name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMeta {
    pub key: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub confirm: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CommandMeta {
    fn new(key: &str, label: &str, icon: &str, confirm: bool, description: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            icon: Some(icon.to_string()),
            confirm,
            description: Some(description.to_string()),
        }
    }
}

/// The public catalog matching [`Whitelist::builtin`]. Order here is the
/// order commands are listed in.
pub fn builtin_catalog() -> Vec<CommandMeta> {
    vec![
        CommandMeta::new(
            "docker-restart",
            "Restart Docker Compose",
            "i-lucide-refresh-ccw",
            true,
            "Restarts all services defined in docker compose.",
        ),
        CommandMeta::new(
            "docker-ps",
            "List Docker Containers",
            "i-lucide-list",
            false,
            "Shows running docker containers.",
        ),
        CommandMeta::new(
            "host-reboot",
            "Reboot Host",
            "i-lucide-power",
            true,
            "Reboots the host machine.",
        ),
    ]
}
