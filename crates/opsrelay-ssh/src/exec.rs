use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ssh2::Session;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use opsrelay_core::{ExecError, ExecEvent, ExecEventHandler, ExecSpec, RemoteExecutor};
use opsrelay_crypto::Vault;

use crate::settings::{ResolvedTarget, SettingsStore};

const READ_CHUNK_BYTES: usize = 8192;

#[derive(Debug, Clone)]
pub struct SshExecutorConfig {
    pub port: u16,
    pub connect_timeout: Duration,
    /// Wall-clock bound for one remote run.
    pub command_timeout: Duration,
    /// Backoff between non-blocking reads while the channel is idle.
    pub poll_interval: Duration,
}

impl Default for SshExecutorConfig {
    fn default() -> Self {
        Self {
            port: 22,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_millis(25),
        }
    }
}

/// Outcome of a connection test round-trip.
#[derive(Debug, Clone)]
pub struct ConnectionTest {
    pub success: bool,
    pub message: String,
    pub latency_ms: Option<u64>,
}

/// Runs one whitelisted command per SSH session: connect, authenticate
/// with the decrypted private key, exec non-interactively, stream output,
/// tear the connection down. No retries at this layer.
pub struct SshExecutor {
    settings: Arc<SettingsStore>,
    vault: Arc<Vault>,
    config: SshExecutorConfig,
}

impl SshExecutor {
    pub fn new(settings: Arc<SettingsStore>, vault: Arc<Vault>, config: SshExecutorConfig) -> Self {
        Self {
            settings,
            vault,
            config,
        }
    }

    /// Trivial remote round-trip (`echo ok`), reporting success + latency.
    pub async fn test_connection(&self) -> ConnectionTest {
        if let Err(err) = self.preflight() {
            return ConnectionTest {
                success: false,
                message: err.to_string(),
                latency_ms: None,
            };
        }

        let started = Instant::now();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        self.spawn(
            ExecSpec {
                command: "echo ok".to_string(),
                cwd: None,
            },
            CancellationToken::new(),
            Box::new(move |event| {
                let outcome = match event {
                    ExecEvent::Exit(Some(0)) => Some((true, "ok".to_string())),
                    ExecEvent::Exit(code) => Some((
                        false,
                        match code {
                            Some(code) => format!("exit {code}"),
                            None => "exit unknown".to_string(),
                        },
                    )),
                    ExecEvent::Error(message) => Some((false, message)),
                    ExecEvent::Stdout(_) | ExecEvent::Stderr(_) => None,
                };
                if let Some(outcome) = outcome {
                    if let Some(tx) = tx.lock().expect("test channel poisoned").take() {
                        let _ = tx.send(outcome);
                    }
                }
            }),
        );

        match rx.await {
            Ok((success, message)) => ConnectionTest {
                success,
                message,
                latency_ms: Some(started.elapsed().as_millis() as u64),
            },
            Err(_) => ConnectionTest {
                success: false,
                message: "connection test aborted".to_string(),
                latency_ms: None,
            },
        }
    }

    fn resolve_key(&self) -> Result<(ResolvedTarget, Zeroizing<String>), ExecError> {
        let target = self.settings.resolve().ok_or(ExecError::NotConfigured)?;
        let key = self
            .vault
            .decrypt(&target.encrypted_private_key)
            .map_err(|e| ExecError::Config(e.to_string()))?;
        Ok((target, key))
    }
}

impl RemoteExecutor for SshExecutor {
    fn preflight(&self) -> Result<(), ExecError> {
        self.resolve_key().map(|_| ())
    }

    fn spawn(&self, spec: ExecSpec, cancel: CancellationToken, on_event: ExecEventHandler) {
        // Snapshot credentials now so a concurrent settings change cannot
        // affect a run that already started.
        let (target, key) = match self.resolve_key() {
            Ok(resolved) => resolved,
            Err(err) => {
                on_event(ExecEvent::Error(err.to_string()));
                return;
            }
        };
        let config = self.config.clone();
        let command = build_command_line(&spec);

        tokio::task::spawn_blocking(move || {
            debug!(host = %target.host, command = %command, "opening ssh session");
            match run_remote(&target, &key, &command, &config, &cancel, &on_event) {
                Ok(code) => on_event(ExecEvent::Exit(code)),
                Err(message) => {
                    warn!(host = %target.host, error = %message, "remote run failed");
                    on_event(ExecEvent::Error(message));
                }
            }
        });
    }
}

/// Prefix the command with a `cd` when the whitelist entry pins a working
/// directory. The path is single-quoted for the remote shell.
fn build_command_line(spec: &ExecSpec) -> String {
    match &spec.cwd {
        Some(cwd) => format!("cd {} && {}", shell_quote(cwd), spec.command),
        None => spec.command.clone(),
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// The blocking session drive: connect with a bounded timeout, exec, poll
/// stdout/stderr until EOF, cancellation, or the wall-clock bound, then
/// tear down unconditionally. Returns the exit code when the channel
/// reported one.
fn run_remote(
    target: &ResolvedTarget,
    private_key: &str,
    command: &str,
    config: &SshExecutorConfig,
    cancel: &CancellationToken,
    emit: &ExecEventHandler,
) -> Result<Option<i32>, String> {
    let addr = (target.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| format!("failed to resolve {}: {e}", target.host))?
        .next()
        .ok_or_else(|| format!("no address for {}", target.host))?;

    let tcp = TcpStream::connect_timeout(&addr, config.connect_timeout)
        .map_err(|e| format!("failed to connect {}: {e}", target.host))?;
    tcp.set_read_timeout(Some(config.connect_timeout)).ok();
    tcp.set_write_timeout(Some(config.connect_timeout)).ok();

    let mut session = Session::new().map_err(|e| format!("failed to create session: {e}"))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| format!("ssh handshake failed: {e}"))?;
    session
        .userauth_pubkey_memory(&target.username, None, private_key, None)
        .map_err(|e| format!("ssh authentication failed: {e}"))?;
    if !session.authenticated() {
        return Err("ssh authentication failed".to_string());
    }

    let mut channel = session
        .channel_session()
        .map_err(|e| format!("failed to open channel: {e}"))?;
    channel
        .exec(command)
        .map_err(|e| format!("exec failed: {e}"))?;
    session.set_blocking(false);

    let started = Instant::now();
    let mut cancelled = false;
    let mut timed_out = false;
    let mut buf = [0u8; READ_CHUNK_BYTES];

    loop {
        let mut progressed = false;

        match channel.stream(0).read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                emit(ExecEvent::Stdout(
                    String::from_utf8_lossy(&buf[..n]).into_owned(),
                ));
                progressed = true;
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                teardown(&session, &mut channel);
                return Err(format!("read error: {err}"));
            }
        }

        match channel.stderr().read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                emit(ExecEvent::Stderr(
                    String::from_utf8_lossy(&buf[..n]).into_owned(),
                ));
                progressed = true;
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                teardown(&session, &mut channel);
                return Err(format!("stderr read error: {err}"));
            }
        }

        if channel.eof() && !progressed {
            break;
        }
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        if started.elapsed() > config.command_timeout {
            timed_out = true;
            break;
        }
        if !progressed {
            std::thread::sleep(config.poll_interval);
        }
    }

    let saw_eof = channel.eof();
    teardown(&session, &mut channel);

    if timed_out {
        return Err(format!(
            "command timed out after {}s",
            config.command_timeout.as_secs()
        ));
    }
    if cancelled && !saw_eof {
        // Killed before the remote reported a status.
        return Ok(None);
    }
    Ok(channel.exit_status().ok())
}

fn teardown(session: &Session, channel: &mut ssh2::Channel) {
    session.set_blocking(true);
    let _ = channel.close();
    let _ = channel.wait_close();
}
