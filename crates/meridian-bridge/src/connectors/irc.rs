//! IRC connector.
//!
//! Unlike the webhook-driven connectors, IRC needs a live session: connect
//! opens a TCP connection, registers, joins the configured channels once the
//! server welcomes us, answers PINGs and pushes channel PRIVMSGs into the
//! manager's inbound sink. A session the server ends is reported to the
//! sink as [`SessionEvent::Closed`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use meridian_common::models::{BridgeConnection, BridgeType};

use crate::connector::{parse_config, BridgeConnector, InboundSink, OutboundMessage, RemoteEvent, SessionEvent};
use crate::error::BridgeError;

const WRITE_QUEUE: usize = 256;

#[derive(Debug, Clone, Deserialize)]
pub struct IrcConfig {
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub nick: String,
    #[serde(default)]
    pub password: Option<String>,
    /// TLS is not supported; connect through a local TLS terminator instead.
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub channels: Vec<String>,
}

fn default_port() -> u16 {
    6667
}

/// One parsed protocol line: `[:prefix] COMMAND params... [:trailing]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLine {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl IrcLine {
    /// Nick part of a `nick!user@host` prefix.
    pub fn nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split('!').next().unwrap_or(prefix))
    }
}

pub fn parse_line(line: &str) -> Option<IrcLine> {
    let mut rest = line.trim_end_matches(['\r', '\n']);
    if rest.is_empty() {
        return None;
    }

    let prefix = match rest.strip_prefix(':') {
        Some(stripped) => {
            let (prefix, tail) = stripped.split_once(' ')?;
            rest = tail;
            Some(prefix.to_owned())
        }
        None => None,
    };

    let (head, trailing) = match rest.split_once(" :") {
        Some((head, trailing)) => (head, Some(trailing)),
        None => (rest, None),
    };
    let mut words = head.split(' ').filter(|w| !w.is_empty());
    let command = words.next()?.to_ascii_uppercase();
    let mut params: Vec<String> = words.map(str::to_owned).collect();
    if let Some(trailing) = trailing {
        params.push(trailing.to_owned());
    }

    Some(IrcLine { prefix, command, params })
}

/// Characters that end or corrupt a protocol line.
const LINE_BREAKERS: [char; 3] = ['\r', '\n', '\0'];

fn single_line(s: &str) -> String {
    s.replace(LINE_BREAKERS, " ")
}

/// Channel names are one word with no line breakers or list separators.
fn valid_channel(channel: &str) -> bool {
    channel.starts_with(['#', '&']) && !channel.contains(LINE_BREAKERS) && !channel.contains([' ', ',', '\u{7}'])
}

/// One PRIVMSG per non-empty line of the body, attributed to the sender.
/// Nothing in the name or body can start a new protocol line.
pub fn privmsg_lines(channel: &str, message: &OutboundMessage) -> Result<Vec<String>, BridgeError> {
    if !valid_channel(channel) {
        return Err(BridgeError::Validation(format!("'{}' is not a channel name", single_line(channel))));
    }
    let name = single_line(&message.sender_display_name);
    Ok(message
        .body
        .split(['\r', '\n'])
        .filter(|l| !l.is_empty())
        .map(|text| format!("PRIVMSG {channel} :<{name}> {}", single_line(text)))
        .collect())
}

/// A channel PRIVMSG as a remote event. Private messages and CTCP are dropped.
fn to_event(line: &IrcLine, own_nick: &str) -> Option<RemoteEvent> {
    if line.command != "PRIVMSG" || line.params.len() < 2 {
        return None;
    }
    let channel = &line.params[0];
    let text = &line.params[1];
    if !channel.starts_with(['#', '&']) || text.starts_with('\u{1}') {
        return None;
    }
    let nick = line.nick()?;
    Some(RemoteEvent {
        remote_channel_id: channel.clone(),
        remote_user_id: nick.to_owned(),
        display_name: nick.to_owned(),
        avatar_url: None,
        body: text.clone(),
        remote_message_id: None,
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        from_bridge: nick.eq_ignore_ascii_case(own_nick),
    })
}

struct Session {
    token: Uuid,
    writer: mpsc::Sender<String>,
    reader: JoinHandle<()>,
}

type Sessions = Arc<Mutex<HashMap<Uuid, Session>>>;

pub struct IrcConnector {
    timeout: Duration,
    sink: InboundSink,
    sessions: Sessions,
}

impl IrcConnector {
    pub fn new(timeout: Duration, sink: InboundSink) -> Self {
        Self { timeout, sink, sessions: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn spawn_writer(mut half: tokio::net::tcp::OwnedWriteHalf, mut rx: mpsc::Receiver<String>) {
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = half.write_all(format!("{line}\r\n").as_bytes()).await {
                    warn!(error = %e, "IRC write failed");
                    break;
                }
            }
            let _ = half.shutdown().await;
        });
    }

    /// Reads until the server goes away, then drops the session and reports
    /// why. A session torn down by `disconnect` is aborted before that.
    fn spawn_reader(
        &self,
        bridge_id: Uuid,
        token: Uuid,
        cfg: IrcConfig,
        half: tokio::net::tcp::OwnedReadHalf,
        writer: mpsc::Sender<String>,
    ) -> JoinHandle<()> {
        let sink = self.sink.clone();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(half).lines();
            let reason = loop {
                let raw = match lines.next_line().await {
                    Ok(Some(raw)) => raw,
                    Ok(None) => {
                        info!(bridge = %bridge_id, "IRC server closed the connection");
                        break Some("IRC server closed the connection".to_owned());
                    }
                    Err(e) => {
                        warn!(bridge = %bridge_id, error = %e, "IRC read failed");
                        break Some(format!("IRC read failed: {e}"));
                    }
                };
                let Some(line) = parse_line(&raw) else { continue };
                match line.command.as_str() {
                    "PING" => {
                        let origin = line.params.first().cloned().unwrap_or_default();
                        let _ = writer.send(format!("PONG :{origin}")).await;
                    }
                    // RPL_WELCOME: registration finished, channels can be joined.
                    "001" => {
                        for channel in &cfg.channels {
                            let _ = writer.send(format!("JOIN {channel}")).await;
                        }
                    }
                    // Server-side errors close the link right after.
                    "ERROR" => {
                        let detail = line.params.last().cloned().unwrap_or_default();
                        warn!(bridge = %bridge_id, %detail, "IRC server reported an error");
                    }
                    "PRIVMSG" => {
                        if let Some(event) = to_event(&line, &cfg.nick) {
                            if sink.send((bridge_id, SessionEvent::Events(vec![event]))).await.is_err() {
                                break None;
                            }
                        }
                    }
                    _ => {}
                }
            };
            drop(writer);

            let mut sessions = sessions.lock().await;
            if sessions.get(&bridge_id).is_some_and(|s| s.token == token) {
                sessions.remove(&bridge_id);
                drop(sessions);
                if let Some(reason) = reason {
                    let _ = sink.send((bridge_id, SessionEvent::Closed { reason })).await;
                }
            }
        })
    }
}

#[async_trait]
impl BridgeConnector for IrcConnector {
    fn bridge_type(&self) -> BridgeType {
        BridgeType::Irc
    }

    fn validate_config(&self, config: &Value) -> Result<(), BridgeError> {
        let cfg: IrcConfig = parse_config(config)?;
        if cfg.use_tls {
            return Err(BridgeError::InvalidConfig("use_tls is not supported".into()));
        }
        if cfg.nick.is_empty() || cfg.nick.contains([' ', '!', '@', ':']) || cfg.nick.contains(LINE_BREAKERS) {
            return Err(BridgeError::InvalidConfig("nick is not a valid IRC nickname".into()));
        }
        if cfg.password.as_deref().is_some_and(|p| p.contains(LINE_BREAKERS)) {
            return Err(BridgeError::InvalidConfig("password may not contain line breaks".into()));
        }
        if let Some(bad) = cfg.channels.iter().find(|c| !valid_channel(c)) {
            return Err(BridgeError::InvalidConfig(format!("'{}' is not a channel name", single_line(bad))));
        }
        Ok(())
    }

    async fn connect(&self, conn: &BridgeConnection) -> Result<(), BridgeError> {
        self.validate_config(&conn.config)?;
        let cfg: IrcConfig = parse_config(&conn.config)?;

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect((cfg.server.as_str(), cfg.port)))
            .await
            .map_err(|_| BridgeError::Timeout)??;
        let (read_half, write_half) = stream.into_split();

        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        Self::spawn_writer(write_half, rx);

        let closed = |_| BridgeError::NotConnected(conn.id);
        if let Some(password) = &cfg.password {
            tx.send(format!("PASS {password}")).await.map_err(closed)?;
        }
        tx.send(format!("NICK {}", cfg.nick)).await.map_err(closed)?;
        tx.send(format!("USER {} 0 * :Meridian bridge", cfg.nick)).await.map_err(closed)?;

        let token = Uuid::new_v4();
        let mut sessions = self.sessions.lock().await;
        let reader = self.spawn_reader(conn.id, token, cfg.clone(), read_half, tx.clone());
        if let Some(old) = sessions.insert(conn.id, Session { token, writer: tx, reader }) {
            old.reader.abort();
        }
        drop(sessions);

        info!(bridge = %conn.id, server = %cfg.server, port = cfg.port, "IRC session opened");
        Ok(())
    }

    async fn disconnect(&self, conn: &BridgeConnection) -> Result<(), BridgeError> {
        let Some(session) = self.sessions.lock().await.remove(&conn.id) else {
            return Ok(());
        };
        // The writer drains the QUIT and exits once every sender is gone.
        let _ = session.writer.send("QUIT :Bridge disconnected".to_owned()).await;
        session.reader.abort();
        debug!(bridge = %conn.id, "IRC session closed");
        Ok(())
    }

    /// IRC traffic arrives over the session, never through the webhook.
    fn authenticate_inbound(&self, _conn: &BridgeConnection, _token: Option<&str>, _payload: &Value) -> Result<(), BridgeError> {
        Err(BridgeError::Unauthenticated)
    }

    /// Accepts `{"line": "<raw protocol line>"}`.
    fn translate_inbound(&self, conn: &BridgeConnection, payload: &Value) -> Result<Vec<RemoteEvent>, BridgeError> {
        let cfg: IrcConfig = parse_config(&conn.config)?;
        let raw = payload
            .get("line")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::Validation("expected {\"line\": ...}".into()))?;
        Ok(parse_line(raw).and_then(|line| to_event(&line, &cfg.nick)).into_iter().collect())
    }

    async fn send(&self, conn: &BridgeConnection, channel: &str, message: &OutboundMessage) -> Result<(), BridgeError> {
        let lines = privmsg_lines(channel, message)?;
        let writer = self
            .sessions
            .lock()
            .await
            .get(&conn.id)
            .map(|s| s.writer.clone())
            .ok_or(BridgeError::NotConnected(conn.id))?;

        for line in lines {
            writer.send(line).await.map_err(|_| BridgeError::NotConnected(conn.id))?;
        }
        Ok(())
    }
}
