use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::catalog::WhitelistedCommand;
use crate::output::{OutputBuffer, OutputKind, OutputLine, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Running,
    Exited,
    Error,
}

#[derive(Debug)]
struct InstanceState {
    status: CommandStatus,
    exit_code: Option<i32>,
    buffer: OutputBuffer,
}

/// One in-flight or completed invocation of a whitelisted command.
///
/// All mutation goes through the single internal mutex, so buffer appends
/// and broadcast publishes are serialized per instance: every subscriber
/// observes lines in exactly the order they were recorded. Status only
/// moves forward (`running` to `exited` or `error`, first terminal wins).
#[derive(Debug)]
pub struct CommandInstance {
    pub id: String,
    pub key: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub created_at_ms: u64,
    state: Mutex<InstanceState>,
    events: broadcast::Sender<OutputLine>,
    cancel: CancellationToken,
}

/// Public JSON view of an instance, as returned by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub key: String,
    pub status: CommandStatus,
    #[serde(rename = "exitCode")]
    pub exit_code: Option<i32>,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
}

impl CommandInstance {
    pub(crate) fn new(key: &str, entry: &WhitelistedCommand, buffer_cap: usize, channel_cap: usize) -> Self {
        let (events, _rx) = broadcast::channel(channel_cap.max(1));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key: key.to_string(),
            command: entry.command.clone(),
            args: entry.args.clone(),
            cwd: entry.cwd.clone(),
            created_at_ms: now_ms(),
            state: Mutex::new(InstanceState {
                status: CommandStatus::Running,
                exit_code: None,
                buffer: OutputBuffer::new(buffer_cap),
            }),
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn status(&self) -> CommandStatus {
        self.state.lock().expect("instance state poisoned").status
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state.lock().expect("instance state poisoned").exit_code
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The command line shown in the `START` meta line.
    pub fn full_command(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }

    /// Append one line and publish it to all subscribers.
    pub fn record(&self, kind: OutputKind, data: impl Into<String>) {
        let mut state = self.state.lock().expect("instance state poisoned");
        self.record_locked(&mut state, OutputLine::new(kind, data));
    }

    /// Terminal transition: process exited with `code`. No-op once the
    /// instance already left `running`.
    pub fn mark_exited(&self, code: Option<i32>) {
        let mut state = self.state.lock().expect("instance state poisoned");
        if state.status != CommandStatus::Running {
            return;
        }
        state.status = CommandStatus::Exited;
        state.exit_code = code;
        let text = match code {
            Some(code) => format!("EXIT {code}"),
            None => "EXIT unknown".to_string(),
        };
        self.record_locked(&mut state, OutputLine::new(OutputKind::Meta, text));
        debug!(id = %self.id, key = %self.key, exit_code = ?code, "command exited");
    }

    /// Terminal transition: the run failed. No-op once the instance
    /// already left `running`.
    pub fn mark_error(&self, message: &str) {
        let mut state = self.state.lock().expect("instance state poisoned");
        if state.status != CommandStatus::Running {
            return;
        }
        state.status = CommandStatus::Error;
        self.record_locked(
            &mut state,
            OutputLine::new(OutputKind::Meta, format!("ERROR: {message}")),
        );
        debug!(id = %self.id, key = %self.key, error = %message, "command failed");
    }

    /// Snapshot the replay buffer and subscribe to subsequent lines in one
    /// atomic step. The returned receiver sees every line recorded after
    /// the snapshot, in order, with nothing duplicated or missing.
    pub fn subscribe(&self) -> (Vec<OutputLine>, broadcast::Receiver<OutputLine>) {
        let state = self.state.lock().expect("instance state poisoned");
        let backlog = state.buffer.snapshot();
        let rx = self.events.subscribe();
        (backlog, rx)
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let state = self.state.lock().expect("instance state poisoned");
        InstanceSnapshot {
            id: self.id.clone(),
            key: self.key.clone(),
            status: state.status,
            exit_code: state.exit_code,
            created_at: self.created_at_ms,
        }
    }

    pub fn buffered_lines(&self) -> Vec<OutputLine> {
        self.state
            .lock()
            .expect("instance state poisoned")
            .buffer
            .snapshot()
    }

    fn record_locked(&self, state: &mut InstanceState, line: OutputLine) {
        state.buffer.push(line.clone());
        // Send failures just mean nobody is listening right now.
        let _ = self.events.send(line);
    }
}
