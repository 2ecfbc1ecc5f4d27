//! Streaming session to the GitHound Explore dashboard.
//!
//! One manager task owns the WebSocket: every outbound frame funnels through
//! its command channel, which preserves emission order, and the task answers
//! server pings in between sends. Authentication happens on connect — either
//! a stored insert token or an interactive account-link flow whose token is
//! persisted for next time. A lost connection is retried with linear backoff
//! as long as a search id exists to resume onto.

use anyhow::{anyhow, bail, Context, Result};
use colored::Colorize;
use futures::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::VERSION;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket handshake deadline.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall deadline for reaching the authenticated state, including the
/// account-link flow.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(300);

/// How many times a dropped connection is redialed before giving up.
const RECONNECT_ATTEMPTS: u32 = 3;

/// Default pause multiplier between reconnect attempts (attempt × base).
pub const RECONNECT_BASE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SessionConfig {
    pub url: String,
    /// Insert token, when already known. Without one the account-link flow
    /// runs and persists the token it receives.
    pub token: Option<String>,
    /// Resume onto an existing dashboard search instead of registering one.
    pub search_id: Option<String>,
    /// Reconnect pause base; tests compress this.
    pub reconnect_base: Duration,
}

impl SessionConfig {
    pub fn new(url: String, token: Option<String>, search_id: Option<String>) -> Self {
        Self { url, token, search_id, reconnect_base: RECONNECT_BASE }
    }
}

enum Command {
    Register { query: String, ack: oneshot::Sender<Option<String>> },
    Result { payload: Value, search_term: String },
    Shutdown { done: oneshot::Sender<()> },
}

/// Cheap cloneable handle; all socket traffic goes through the manager task.
pub struct Session {
    tx: mpsc::UnboundedSender<Command>,
}

static SESSION: OnceCell<Session> = OnceCell::new();

/// The process-wide session, when dashboard mode is on and it came up.
pub fn active() -> Option<&'static Session> {
    SESSION.get()
}

impl Session {
    /// Connect and authenticate. Returns the handle once the session reached
    /// the authenticated state; the whole attempt is bounded by
    /// [`AUTH_TIMEOUT`].
    pub async fn start(config: SessionConfig) -> Result<Session> {
        let (auth_tx, mut auth_rx) = mpsc::channel::<bool>(1);
        let (tx, rx) = mpsc::unbounded_channel();

        let manager = Manager {
            config,
            search_id: None,
            pending_ack: None,
            auth_tx,
        };
        tokio::spawn(manager.run(rx));

        let authed = tokio::time::timeout(AUTH_TIMEOUT, auth_rx.recv())
            .await
            .context("timed out waiting for dashboard authentication")?
            .unwrap_or(false);
        if !authed {
            bail!("dashboard authentication failed");
        }
        Ok(Session { tx })
    }

    /// Install the process-wide session handle.
    pub fn install(self) {
        let _ = SESSION.set(self);
    }

    /// Register a dashboard search for `query`; resolves to the server-issued
    /// search id.
    pub async fn register_search(&self, query: &str) -> Option<String> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Register { query: query.to_string(), ack })
            .ok()?;
        ack_rx.await.ok().flatten()
    }

    /// Queue one finding for the dashboard.
    pub fn send_result(&self, finding: &crate::types::Finding, search_term: &str) {
        let payload = serde_json::to_value(finding).unwrap_or(Value::Null);
        let _ = self.tx.send(Command::Result { payload, search_term: search_term.to_string() });
    }

    /// Flush queued frames and close the socket.
    pub async fn shutdown(&self) {
        let (done, done_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { done }).is_ok() {
            let _ = done_rx.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Manager task
// ---------------------------------------------------------------------------

struct Manager {
    config: SessionConfig,
    search_id: Option<String>,
    pending_ack: Option<oneshot::Sender<Option<String>>>,
    auth_tx: mpsc::Sender<bool>,
}

impl Manager {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        self.search_id = self.config.search_id.clone();

        let mut ws = match self.connect_and_auth().await {
            Ok(ws) => {
                let _ = self.auth_tx.try_send(true);
                ws
            }
            Err(e) => {
                eprintln!("{}", format!("[!] Dashboard connection failed: {e}").red());
                let _ = self.auth_tx.try_send(false);
                return;
            }
        };

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        None => break,
                        Some(Command::Shutdown { done }) => {
                            let _ = ws.close(None).await;
                            let _ = done.send(());
                            break;
                        }
                        Some(Command::Register { query, ack }) => {
                            let frame = json!({
                                "event": "start_search",
                                "insertToken": self.config.token.clone().unwrap_or_default(),
                                "searchQuery": query,
                            });
                            self.pending_ack = Some(ack);
                            if let Err(e) = self.deliver(&mut ws, frame).await {
                                warn!("dashboard send failed during registration: {e}");
                                if let Some(ack) = self.pending_ack.take() {
                                    let _ = ack.send(None);
                                }
                                break;
                            }
                        }
                        Some(Command::Result { payload, search_term }) => {
                            let mut frame = json!({
                                "event": "search_result",
                                "insertToken": self.config.token.clone().unwrap_or_default(),
                                "result": payload,
                                "search_term": search_term,
                            });
                            if let Some(id) = &self.search_id {
                                frame["searchID"] = Value::String(id.clone());
                            }
                            if let Err(e) = self.deliver(&mut ws, frame).await {
                                warn!("dashboard send failed, dropping session: {e}");
                                break;
                            }
                        }
                    }
                }
                incoming = ws.next() => {
                    match incoming {
                        Some(Ok(msg)) => self.handle_incoming(&mut ws, msg).await,
                        Some(Err(e)) if is_connection_error(&e) => {
                            match self.reconnect().await {
                                Ok(next) => ws = next,
                                Err(e) => {
                                    eprintln!("{}", format!("[!] Dashboard connection lost: {e}").red());
                                    std::process::exit(1);
                                }
                            }
                        }
                        Some(Err(e)) => debug!("dashboard read error: {e}"),
                        None => {
                            match self.reconnect().await {
                                Ok(next) => ws = next,
                                Err(e) => {
                                    eprintln!("{}", format!("[!] Dashboard connection lost: {e}").red());
                                    std::process::exit(1);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Send one frame, transparently reconnecting once on a connection-level
    /// failure; the pending frame goes out again after the redial.
    async fn deliver(&mut self, ws: &mut WsStream, frame: Value) -> Result<()> {
        let text = frame.to_string();
        match ws.send(Message::text(text.clone())).await {
            Ok(()) => Ok(()),
            Err(e) if is_connection_error(&e) => {
                warn!("dashboard write failed ({e}), reconnecting");
                *ws = self.reconnect().await?;
                ws.send(Message::text(text)).await.context("resend after reconnect")
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Redial with linear backoff. Only legal once a search id exists — there
    /// is nothing to resume onto otherwise, and the process exits instead.
    async fn reconnect(&mut self) -> Result<WsStream> {
        if self.search_id.is_none() {
            eprintln!("{}", "[!] Dashboard connection lost before a search was registered".red());
            std::process::exit(1);
        }
        for attempt in 1..=RECONNECT_ATTEMPTS {
            tokio::time::sleep(self.config.reconnect_base * attempt).await;
            match self.connect_and_auth().await {
                Ok(ws) => {
                    debug!("dashboard reconnected on attempt {attempt}");
                    return Ok(ws);
                }
                Err(e) => warn!("reconnect attempt {attempt} failed: {e}"),
            }
        }
        Err(anyhow!("gave up after {RECONNECT_ATTEMPTS} reconnect attempts"))
    }

    /// Dial, banner, and authenticate. With a token this is one round trip;
    /// without one it walks the account-link flow and persists the token the
    /// server hands back.
    async fn connect_and_auth(&mut self) -> Result<WsStream> {
        let (mut ws, _) =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(self.config.url.as_str()))
                .await
                .context("handshake timed out")?
                .context("dial failed")?;

        let banner = match &self.config.token {
            Some(token) => json!({
                "event": "gh_banner",
                "ghVersion": VERSION,
                "insertToken": token,
            }),
            None => json!({
                "event": "gh_banner",
                "ghVersion": VERSION,
            }),
        };
        ws.send(Message::text(banner.to_string())).await.context("banner send failed")?;

        if self.config.token.is_some() {
            let response = read_json(&mut ws).await.context("no banner response")?;
            if response["logged_in"].as_bool() != Some(true) {
                bail!("invalid insert token");
            }
            return Ok(ws);
        }

        // Account-link flow: show the link, then wait for the server to
        // confirm and hand over a persistent token.
        let response = read_json(&mut ws).await.context("no banner response")?;
        if let Some(url) = response["url"].as_str() {
            println!(
                "{}",
                format!("Please visit the following URL to link your account: {url}").cyan()
            );
            println!("{}", "Waiting for verification...".cyan());
        }
        loop {
            let message = read_json(&mut ws).await.context("link flow interrupted")?;
            if message["logged_in"].as_bool() == Some(true) {
                if let Some(token) = message["insert_token"].as_str() {
                    if let Err(e) = persist_token(token) {
                        warn!("could not persist insert token: {e}");
                    }
                    self.config.token = Some(token.to_string());
                    return Ok(ws);
                }
            }
        }
    }

    async fn handle_incoming(&mut self, ws: &mut WsStream, msg: Message) {
        let Message::Text(text) = msg else { return };
        let Ok(value) = serde_json::from_str::<Value>(&text) else { return };

        if let Some(err) = value["error"].as_str() {
            eprintln!("{}", format!("[!] Dashboard error: {err}").red());
            return;
        }
        match value["event"].as_str() {
            Some("ping") => {
                let _ = ws.send(Message::text(json!({"event": "pong"}).to_string())).await;
            }
            Some("search_ack") => {
                if let Some(id) = value["searchID"].as_str() {
                    self.search_id = Some(id.to_string());
                    if let Some(url) = value["url"].as_str() {
                        println!(
                            "{}",
                            format!("Connected to GitHound Explore! View results at: {url}")
                                .green()
                        );
                    }
                }
                if let Some(ack) = self.pending_ack.take() {
                    let _ = ack.send(self.search_id.clone());
                }
            }
            _ => {}
        }
    }
}

/// Read frames until one parses as JSON.
async fn read_json(ws: &mut WsStream) -> Result<Value> {
    loop {
        let msg = ws.next().await.context("connection closed")??;
        if let Message::Text(text) = msg {
            if let Ok(value) = serde_json::from_str(&text) {
                return Ok(value);
            }
        }
    }
}

/// True for failures that mean the pipe itself died (and a redial could fix).
fn is_connection_error(e: &tokio_tungstenite::tungstenite::Error) -> bool {
    use std::io::ErrorKind;
    use tokio_tungstenite::tungstenite::Error;
    match e {
        Error::ConnectionClosed | Error::AlreadyClosed => true,
        Error::Protocol(_) => true,
        Error::Io(io) => matches!(
            io.kind(),
            ErrorKind::BrokenPipe
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::TimedOut
                | ErrorKind::UnexpectedEof
        ) || io.to_string().contains("No route to host")
            || io.to_string().contains("unreachable"),
        _ => false,
    }
}

/// Write the insert token under `~/.githound` with owner-only permissions.
pub fn persist_token(token: &str) -> Result<()> {
    let dir = crate::config_dir().context("no home directory")?;
    std::fs::create_dir_all(&dir)?;
    let file = dir.join("insert_token.txt");
    std::fs::write(&file, token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Read a previously persisted insert token, if any.
pub fn stored_token() -> Option<String> {
    let file = crate::config_dir()?.join("insert_token.txt");
    let token = std::fs::read_to_string(file).ok()?;
    let token = token.trim().to_string();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
