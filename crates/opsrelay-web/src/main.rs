use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, warn};

use opsrelay_core::{CommandRegistry, RegistryConfig, Whitelist, builtin_catalog};
use opsrelay_crypto::{TokenCodec, Vault};
use opsrelay_ssh::{SettingsStore, SshExecutor, SshExecutorConfig};
use opsrelay_web::{AdminCredentials, AppState, build_cors, build_router};

#[derive(Debug)]
struct Args {
    listen: SocketAddr,
    state_dir: PathBuf,
    allow_origins: Vec<String>,
    command_timeout_secs: u64,
    max_running: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opsrelay_web=info".into()),
        )
        .init();

    let args = Args::parse()?;

    let vault_secret = std::env::var("OPSRELAY_VAULT_SECRET").unwrap_or_default();
    let auth_secret = std::env::var("OPSRELAY_AUTH_SECRET").ok();
    let allow_unsigned = std::env::var("OPSRELAY_ALLOW_UNSIGNED_TOKENS").as_deref() == Ok("1");
    let admin = AdminCredentials {
        username: std::env::var("OPSRELAY_ADMIN_USERNAME").unwrap_or_else(|_| "admin".into()),
        password: std::env::var("OPSRELAY_ADMIN_PASSWORD")
            .context("OPSRELAY_ADMIN_PASSWORD must be set")?,
    };
    let remote_home = std::env::var("OPSRELAY_REMOTE_HOME").ok();

    if auth_secret.as_deref().unwrap_or_default().is_empty() && !allow_unsigned {
        bail!("OPSRELAY_AUTH_SECRET must be set (or explicitly opt into unsigned tokens)");
    }
    if allow_unsigned {
        warn!("unsigned token compatibility mode enabled: disable once all clients re-login");
    }

    let vault = Arc::new(Vault::new(vault_secret));
    let tokens = Arc::new(TokenCodec::new(auth_secret, allow_unsigned));
    let settings = Arc::new(
        SettingsStore::open(args.state_dir.join("ssh.json"))
            .context("failed to open ssh settings store")?,
    );
    let ssh = Arc::new(SshExecutor::new(
        Arc::clone(&settings),
        Arc::clone(&vault),
        SshExecutorConfig {
            command_timeout: Duration::from_secs(args.command_timeout_secs),
            ..SshExecutorConfig::default()
        },
    ));
    let registry = Arc::new(CommandRegistry::new(
        Whitelist::builtin(remote_home.as_deref()),
        builtin_catalog(),
        Arc::clone(&ssh) as Arc<dyn opsrelay_core::RemoteExecutor>,
        RegistryConfig {
            max_running: args.max_running,
            ..RegistryConfig::default()
        },
    ));

    let state = Arc::new(AppState {
        registry,
        settings,
        vault,
        tokens,
        admin,
        ssh,
    });

    let cors = build_cors(&args.allow_origins)?;
    let app = build_router(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", args.listen))?;

    info!("opsrelay-web listening on http://{}", args.listen);
    axum::serve(listener, app).await?;
    Ok(())
}

impl Args {
    fn parse() -> Result<Self> {
        let mut listen = SocketAddr::from_str("127.0.0.1:8790")?;
        let mut state_dir = default_state_dir();
        let mut allow_origins = vec!["http://localhost:3000".to_string()];
        let mut command_timeout_secs = 15 * 60;
        let mut max_running = 16;

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--listen" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--listen requires a value"))?;
                    listen = SocketAddr::from_str(&value)
                        .with_context(|| format!("invalid --listen value: {value}"))?;
                }
                "--state-dir" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--state-dir requires a value"))?;
                    state_dir = PathBuf::from(value);
                }
                "--allow-origin" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--allow-origin requires a value"))?;
                    if allow_origins == ["http://localhost:3000".to_string()] {
                        allow_origins.clear();
                    }
                    allow_origins.push(value);
                }
                "--command-timeout-secs" => {
                    command_timeout_secs = args
                        .next()
                        .ok_or_else(|| anyhow!("--command-timeout-secs requires a value"))?
                        .parse()
                        .context("invalid --command-timeout-secs value")?;
                }
                "--max-running" => {
                    max_running = args
                        .next()
                        .ok_or_else(|| anyhow!("--max-running requires a value"))?
                        .parse()
                        .context("invalid --max-running value")?;
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                other => bail!("unknown argument: {other}"),
            }
        }

        if command_timeout_secs == 0 || max_running == 0 {
            bail!("--command-timeout-secs and --max-running must be > 0");
        }

        Ok(Self {
            listen,
            state_dir,
            allow_origins,
            command_timeout_secs,
            max_running,
        })
    }
}

fn print_help() {
    println!(
        "opsrelay-web [--listen HOST:PORT] [--state-dir PATH] [--allow-origin ORIGIN] [--command-timeout-secs N] [--max-running N]"
    );
}

fn default_state_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("opsrelay");
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".local").join("state").join("opsrelay")
}
