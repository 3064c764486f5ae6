use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::catalog::{CommandMeta, Whitelist};
use crate::error::RegistryError;
use crate::executor::{ExecEvent, ExecSpec, RemoteExecutor};
use crate::instance::{CommandInstance, CommandStatus};
use crate::output::{DEFAULT_BUFFER_MAX_LINES, OutputKind};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Replay buffer cap per instance, in lines.
    pub buffer_max_lines: usize,
    /// Broadcast channel capacity per instance.
    pub channel_capacity: usize,
    /// Maximum simultaneously running instances.
    pub max_running: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            buffer_max_lines: DEFAULT_BUFFER_MAX_LINES,
            channel_capacity: 256,
            max_running: 16,
        }
    }
}

/// Owns the whitelist, the catalog, and every command instance created
/// during the process lifetime. All mutation of the instance table goes
/// through `start`; lookups and cancellation come from arbitrary callers.
pub struct CommandRegistry {
    whitelist: Whitelist,
    catalog: Vec<CommandMeta>,
    instances: DashMap<String, Arc<CommandInstance>>,
    executor: Arc<dyn RemoteExecutor>,
    config: RegistryConfig,
}

impl CommandRegistry {
    pub fn new(
        whitelist: Whitelist,
        catalog: Vec<CommandMeta>,
        executor: Arc<dyn RemoteExecutor>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            whitelist,
            catalog,
            instances: DashMap::new(),
            executor,
            config,
        }
    }

    /// Validate `key`, create a fresh running instance, and hand the run
    /// off to the executor. Returns as soon as the run is dispatched;
    /// remote failures surface through the instance's stream, never here.
    pub fn start(&self, key: &str) -> Result<Arc<CommandInstance>, RegistryError> {
        let entry = self
            .whitelist
            .get(key)
            .ok_or_else(|| RegistryError::UnknownCommand(key.to_string()))?;

        let running = self.running_count();
        if running >= self.config.max_running {
            return Err(RegistryError::TooManyRunning(running));
        }

        // A misconfigured target fails the request before any instance
        // exists, so the table stays unchanged.
        self.executor.preflight()?;

        let instance = Arc::new(CommandInstance::new(
            key,
            entry,
            self.config.buffer_max_lines,
            self.config.channel_capacity,
        ));
        let full = instance.full_command();
        instance.record(OutputKind::Meta, format!("START {full}"));
        self.instances
            .insert(instance.id.clone(), Arc::clone(&instance));

        let sink = Arc::clone(&instance);
        self.executor.spawn(
            ExecSpec {
                command: full,
                cwd: instance.cwd.clone(),
            },
            instance.cancel_token(),
            Box::new(move |event| match event {
                ExecEvent::Stdout(data) => sink.record(OutputKind::Stdout, data),
                ExecEvent::Stderr(data) => sink.record(OutputKind::Stderr, data),
                ExecEvent::Exit(code) => sink.mark_exited(code),
                ExecEvent::Error(message) => sink.mark_error(&message),
            }),
        );

        info!(id = %instance.id, key = %key, "command started");
        Ok(instance)
    }

    pub fn get(&self, id: &str) -> Option<Arc<CommandInstance>> {
        self.instances.get(id).map(|entry| Arc::clone(&entry))
    }

    /// Best-effort cancellation. Returns false for unknown ids and for
    /// instances that already reached a terminal status; otherwise signals
    /// termination and returns true without waiting for the actual exit.
    pub fn cancel(&self, id: &str) -> bool {
        let Some(instance) = self.get(id) else {
            return false;
        };
        if instance.status() != CommandStatus::Running {
            return false;
        }
        instance.cancel_token().cancel();
        instance.record(OutputKind::Meta, "CANCEL REQUESTED");
        info!(id = %id, key = %instance.key, "cancel requested");
        true
    }

    /// Catalog keys that are actually whitelisted, in catalog order.
    pub fn list_keys(&self) -> Vec<String> {
        self.catalog
            .iter()
            .filter(|meta| self.whitelist.contains(&meta.key))
            .map(|meta| meta.key.clone())
            .collect()
    }

    /// The public catalog, filtered to whitelisted keys.
    pub fn catalog(&self) -> Vec<CommandMeta> {
        self.catalog
            .iter()
            .filter(|meta| self.whitelist.contains(&meta.key))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|entry| entry.status() == CommandStatus::Running)
            .count()
    }
}
