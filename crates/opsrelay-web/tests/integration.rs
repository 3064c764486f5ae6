use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

use opsrelay_core::{
    CommandRegistry, ExecError, ExecEvent, ExecEventHandler, ExecSpec, RegistryConfig,
    RemoteExecutor, Whitelist, builtin_catalog,
};
use opsrelay_crypto::{TokenCodec, Vault};
use opsrelay_ssh::{SettingsStore, SshExecutor, SshExecutorConfig};
use opsrelay_web::{AdminCredentials, AppState, build_router};

const VAULT_SECRET: &str = "0123456789abcdef0123456789abcdef";
const AUTH_SECRET: &str = "integration-test-auth-secret-0001";
const ADMIN_PASSWORD: &str = "correct-horse-battery";

/// Executor whose runs are driven by the test: each spawn parks its event
/// handler so the test can push output and terminals at will.
#[derive(Default)]
struct ManualExecutor {
    handlers: Mutex<Vec<ExecEventHandler>>,
}

impl ManualExecutor {
    fn emit(&self, run: usize, event: ExecEvent) {
        let handlers = self.handlers.lock().expect("handlers");
        (handlers[run])(event);
    }
}

impl RemoteExecutor for ManualExecutor {
    fn preflight(&self) -> Result<(), ExecError> {
        Ok(())
    }

    fn spawn(&self, _spec: ExecSpec, _cancel: CancellationToken, on_event: ExecEventHandler) {
        self.handlers.lock().expect("handlers").push(on_event);
    }
}

struct TestServer {
    addr: SocketAddr,
    executor: Arc<ManualExecutor>,
    client: reqwest::Client,
}

impl TestServer {
    async fn spawn() -> Self {
        let executor = Arc::new(ManualExecutor::default());
        let vault = Arc::new(Vault::new(VAULT_SECRET));
        let settings = Arc::new(SettingsStore::in_memory());
        let ssh = Arc::new(SshExecutor::new(
            Arc::clone(&settings),
            Arc::clone(&vault),
            SshExecutorConfig::default(),
        ));
        let registry = Arc::new(CommandRegistry::new(
            Whitelist::builtin(Some("/srv/nas")),
            builtin_catalog(),
            Arc::clone(&executor) as Arc<dyn RemoteExecutor>,
            RegistryConfig::default(),
        ));
        let state = Arc::new(AppState {
            registry,
            settings,
            vault,
            tokens: Arc::new(TokenCodec::new(Some(AUTH_SECRET.to_string()), false)),
            admin: AdminCredentials {
                username: "admin".to_string(),
                password: ADMIN_PASSWORD.to_string(),
            },
            ssh,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral listener");
        let addr = listener.local_addr().expect("listener addr");
        tokio::spawn(async move {
            axum::serve(listener, build_router(state))
                .await
                .expect("serve");
        });

        Self {
            addr,
            executor,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Tokens carry base64 padding, so they must be percent-encoded the
    /// way a browser's encodeURIComponent would before going in a query.
    fn ws_url(&self, path: &str, token: &str) -> String {
        let encoded: String = token
            .bytes()
            .map(|b| match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    (b as char).to_string()
                }
                other => format!("%{other:02X}"),
            })
            .collect();
        format!("ws://{}{path}?token={encoded}", self.addr)
    }

    async fn login(&self) -> String {
        let resp = self
            .client
            .post(self.url("/api/auth/login"))
            .json(&json!({"username": "admin", "password": ADMIN_PASSWORD}))
            .send()
            .await
            .expect("login request");
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.expect("login body");
        body["token"].as_str().expect("token").to_string()
    }

    async fn start(&self, token: &str, key: &str) -> Value {
        let resp = self
            .client
            .post(self.url(&format!("/api/commands/{key}")))
            .bearer_auth(token)
            .send()
            .await
            .expect("start request");
        assert_eq!(resp.status(), 200);
        resp.json().await.expect("start body")
    }
}

#[tokio::test]
async fn catalog_is_public() {
    let server = TestServer::spawn().await;

    let resp = server
        .client
        .get(server.url("/api/commands"))
        .send()
        .await
        .expect("catalog request");
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.expect("catalog body");
    assert_eq!(body["ok"], true);
    let keys: Vec<&str> = body["commands"]
        .as_array()
        .expect("commands array")
        .iter()
        .map(|c| c["key"].as_str().expect("key"))
        .collect();
    assert_eq!(keys, vec!["docker-restart", "docker-ps", "host-reboot"]);
    // Execution details never leak into the catalog.
    assert!(body["commands"][0].get("args").is_none());
}

#[tokio::test]
async fn login_and_session_flow() {
    let server = TestServer::spawn().await;

    let resp = server
        .client
        .post(server.url("/api/auth/login"))
        .json(&json!({"username": "admin", "password": "wrong"}))
        .send()
        .await
        .expect("bad login");
    assert_eq!(resp.status(), 401);

    let token = server.login().await;

    // Tolerant header parsing: duplicated Bearer markers still work.
    let resp = server
        .client
        .get(server.url("/api/auth/session"))
        .header("Authorization", format!("Bearer Bearer {token}"))
        .send()
        .await
        .expect("session request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("session body");
    assert_eq!(body["username"], "admin");
    assert_eq!(body["name"], "Administrator");

    let resp = server
        .client
        .get(server.url("/api/auth/session"))
        .send()
        .await
        .expect("anonymous session");
    assert_eq!(resp.status(), 401);

    // Unsigned legacy tokens are rejected while a secret is configured.
    let unsigned = {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(
            json!({"id": 1, "username": "admin", "iat": 0, "exp": u64::MAX, "v": 1}).to_string(),
        )
    };
    let resp = server
        .client
        .get(server.url("/api/auth/session"))
        .bearer_auth(&unsigned)
        .send()
        .await
        .expect("unsigned session");
    assert_eq!(resp.status(), 401);

    let resp = server
        .client
        .post(server.url("/api/auth/logout"))
        .send()
        .await
        .expect("logout");
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn start_stream_and_poll_flow() {
    let server = TestServer::spawn().await;
    let token = server.login().await;

    // Auth gates the control plane.
    let resp = server
        .client
        .post(server.url("/api/commands/docker-ps"))
        .send()
        .await
        .expect("anonymous start");
    assert_eq!(resp.status(), 401);

    let resp = server
        .client
        .post(server.url("/api/commands/definitely-not-whitelisted"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("unknown start");
    assert_eq!(resp.status(), 400);

    let body = server.start(&token, "docker-ps").await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["command"]["key"], "docker-ps");
    assert_eq!(body["command"]["status"], "running");
    let id = body["command"]["id"].as_str().expect("id").to_string();
    let stream_path = body["streamPath"].as_str().expect("streamPath").to_string();
    assert_eq!(stream_path, format!("/api/ws/command/{id}"));

    // One line lands in the buffer before anyone subscribes.
    server
        .executor
        .emit(0, ExecEvent::Stdout("CONTAINER ID  IMAGE\n".to_string()));

    let (mut ws, _) = connect_async(server.ws_url(&stream_path, &token))
        .await
        .expect("ws connect");

    // Replay: START meta line, then the buffered stdout line.
    let replayed = read_line(&mut ws).await;
    assert_eq!(replayed["kind"], "meta");
    assert_eq!(replayed["data"], "START docker ps");
    let replayed = read_line(&mut ws).await;
    assert_eq!(replayed["kind"], "stdout");
    assert_eq!(replayed["data"], "CONTAINER ID  IMAGE\n");

    // Live: lines recorded after the subscription arrive in order.
    server
        .executor
        .emit(0, ExecEvent::Stdout("abc123  nginx\n".to_string()));
    server.executor.emit(0, ExecEvent::Exit(Some(0)));

    let live = read_line(&mut ws).await;
    assert_eq!(live["kind"], "stdout");
    assert_eq!(live["data"], "abc123  nginx\n");
    assert!(live["t"].as_u64().is_some());
    let exit = read_line(&mut ws).await;
    assert_eq!(exit["kind"], "meta");
    assert_eq!(exit["data"], "EXIT 0");

    // Poll view agrees with the stream.
    let resp = server
        .client
        .get(server.url(&format!("/api/commands/{id}")))
        .bearer_auth(&token)
        .send()
        .await
        .expect("poll request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("poll body");
    assert_eq!(body["command"]["status"], "exited");
    assert_eq!(body["command"]["exitCode"], 0);

    // Cancel on a finished instance reports false; unknown ids are 404.
    let resp = server
        .client
        .delete(server.url(&format!("/api/commands/{id}")))
        .bearer_auth(&token)
        .send()
        .await
        .expect("cancel request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("cancel body");
    assert_eq!(body["ok"], false);

    let resp = server
        .client
        .delete(server.url("/api/commands/no-such-id"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("cancel unknown");
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn cancel_running_command() {
    let server = TestServer::spawn().await;
    let token = server.login().await;

    let body = server.start(&token, "host-reboot").await;
    let id = body["command"]["id"].as_str().expect("id").to_string();

    let resp = server
        .client
        .delete(server.url(&format!("/api/commands/{id}")))
        .bearer_auth(&token)
        .send()
        .await
        .expect("cancel request");
    let body: Value = resp.json().await.expect("cancel body");
    assert_eq!(body["ok"], true);

    // The registry recorded the advisory cancel for observers.
    let (mut ws, _) = connect_async(server.ws_url(&format!("/api/ws/command/{id}"), &token))
        .await
        .expect("ws connect");
    let start = read_line(&mut ws).await;
    assert_eq!(start["data"], "START /sbin/reboot");
    let cancel = read_line(&mut ws).await;
    assert_eq!(cancel["kind"], "meta");
    assert_eq!(cancel["data"], "CANCEL REQUESTED");
}

#[tokio::test]
async fn stream_rejects_bad_token_and_unknown_id() {
    let server = TestServer::spawn().await;
    let token = server.login().await;

    let (mut ws, _) = connect_async(server.ws_url("/api/ws/command/some-id", "forged-token"))
        .await
        .expect("ws connect");
    expect_policy_close(&mut ws).await;

    let (mut ws, _) = connect_async(server.ws_url("/api/ws/command/unknown-id", &token))
        .await
        .expect("ws connect");
    expect_policy_close(&mut ws).await;
}

#[tokio::test]
async fn ssh_settings_flow() {
    let server = TestServer::spawn().await;
    let token = server.login().await;

    let resp = server
        .client
        .get(server.url("/api/settings/ssh"))
        .send()
        .await
        .expect("anonymous settings");
    assert_eq!(resp.status(), 401);

    // Connection test before anything is configured fails cleanly.
    let resp = server
        .client
        .post(server.url("/api/settings/ssh/test"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("test request");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("test body");
    assert_eq!(body["success"], false);

    let resp = server
        .client
        .post(server.url("/api/settings/ssh"))
        .bearer_auth(&token)
        .json(&json!({"host": "nas host", "username": "admin"}))
        .send()
        .await
        .expect("invalid target");
    assert_eq!(resp.status(), 400);

    let resp = server
        .client
        .post(server.url("/api/settings/ssh"))
        .bearer_auth(&token)
        .json(&json!({"host": "nas.local", "username": "admin"}))
        .send()
        .await
        .expect("save target");
    assert_eq!(resp.status(), 200);

    let resp = server
        .client
        .post(server.url("/api/settings/ssh/key"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("generate key");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("key body");
    let public_key = body["publicKey"].as_str().expect("publicKey");
    assert!(public_key.starts_with("ssh-ed25519 "));
    assert_eq!(body["replaced"], false);

    let resp = server
        .client
        .post(server.url("/api/settings/ssh/key"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("regenerate without force");
    assert_eq!(resp.status(), 400);

    let resp = server
        .client
        .post(server.url("/api/settings/ssh/key?force=1"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("regenerate with force");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("force body");
    assert_eq!(body["replaced"], true);

    let resp = server
        .client
        .get(server.url("/api/settings/ssh"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("settings view");
    let body: Value = resp.json().await.expect("settings body");
    assert_eq!(body["settings"]["host"], "nas.local");
    assert_eq!(body["settings"]["hasKey"], true);
    assert!(body["settings"].get("encrypted_private_key").is_none());
}

async fn read_line(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Value {
    loop {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
            .await
            .expect("ws read timed out")
            .expect("ws stream ended")
            .expect("ws read failed");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("line json"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected ws message: {other:?}"),
        }
    }
}

async fn expect_policy_close(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    loop {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
            .await
            .expect("ws read timed out")
            .expect("ws stream ended")
            .expect("ws read failed");
        if let Message::Close(frame) = msg {
            let frame = frame.expect("close frame");
            assert_eq!(frame.code, CloseCode::Policy);
            return;
        }
    }
}
