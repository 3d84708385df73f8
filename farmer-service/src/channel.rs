// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Socket.IO (engine.io v4) channels over a websocket.
//!
//! A [`ChannelManager`] owns one logical channel: it connects, performs the
//! namespace handshake, dispatches events to its [`ChannelHandler`] and
//! reconnects with backoff when the connection drops.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::{Notify, mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{cancel::CancelToken, retry::RetryPolicy};

const NAMESPACE_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Kingdom,
    Chat,
    Field,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Kingdom => "kingdom",
            ChannelKind::Chat => "chat",
            ChannelKind::Field => "field",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Value),
    Connect,
    Disconnect,
    Event { name: String, data: Value },
    BinaryEvent { attachments: usize, name: String, data: Value },
    Ping,
    Pong,
    Other,
}

/// Parses one engine.io text frame.
pub fn parse_packet(text: &str) -> Option<Packet> {
    let mut chars = text.chars();
    match chars.next()? {
        '0' => Some(Packet::Open(
            serde_json::from_str(chars.as_str()).unwrap_or(Value::Null),
        )),
        '2' => Some(Packet::Ping),
        '3' => Some(Packet::Pong),
        '4' => parse_socket_packet(chars.as_str()),
        _ => Some(Packet::Other),
    }
}

fn parse_socket_packet(body: &str) -> Option<Packet> {
    let mut chars = body.chars();
    let kind = chars.next()?;
    let rest = chars.as_str();
    match kind {
        '0' => Some(Packet::Connect),
        '1' => Some(Packet::Disconnect),
        '2' => {
            let (name, data) = split_event(skip_ack_id(rest))?;
            Some(Packet::Event { name, data })
        }
        '5' => {
            let (count, payload) = rest.split_once('-')?;
            let attachments = count.parse().ok()?;
            let (name, data) = split_event(skip_ack_id(payload))?;
            Some(Packet::BinaryEvent {
                attachments,
                name,
                data,
            })
        }
        _ => Some(Packet::Other),
    }
}

fn skip_ack_id(body: &str) -> &str {
    body.trim_start_matches(|ch: char| ch.is_ascii_digit())
}

fn split_event(body: &str) -> Option<(String, Value)> {
    let mut items = match serde_json::from_str::<Value>(body).ok()? {
        Value::Array(items) => items.into_iter(),
        _ => return None,
    };
    let name = items.next()?.as_str()?.to_string();
    Some((name, items.next().unwrap_or(Value::Null)))
}

pub fn encode_event(name: &str, data: &Value) -> String {
    format!("42{}", Value::Array(vec![Value::from(name), data.clone()]))
}

/// Builds the websocket url for a channel base url.
pub fn socket_url(base: &str, token: &str) -> String {
    let base = base
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    let base = base.trim_end_matches('/');
    let base = base.strip_suffix("/socket.io").unwrap_or(base);
    format!("{base}/socket.io/?token={token}&EIO=4&transport=websocket")
}

/// An inbound event with any binary attachments already collected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPayload {
    pub data: Value,
    pub attachments: Vec<Vec<u8>>,
}

impl EventPayload {
    pub fn json(data: Value) -> Self {
        Self {
            data,
            attachments: Vec::new(),
        }
    }

    /// Bytes of `field`, resolving attachment placeholders and number arrays.
    pub fn bytes_of(&self, field: &str) -> Option<Vec<u8>> {
        let value = self.data.get(field)?;
        if value.get("_placeholder").and_then(Value::as_bool) == Some(true) {
            let index = value.get("num").and_then(Value::as_u64)? as usize;
            return self.attachments.get(index).cloned();
        }
        lok_common::codec::value_to_bytes(value)
    }
}

/// Outbound half handed to handlers while a connection is up.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl ChannelSender {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, name: &str, data: &Value) -> anyhow::Result<()> {
        self.send_text(encode_event(name, data))
    }

    fn send_text(&self, text: String) -> anyhow::Result<()> {
        self.tx
            .send(Message::Text(text))
            .map_err(|_| anyhow::anyhow!("channel connection is closed"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriveOutcome {
    /// Stay connected and keep dispatching events.
    Hold,
    /// Close the connection and reconnect after the given pause.
    PassComplete { resume_after: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Continue,
    ForceRestart,
}

#[async_trait]
pub trait ChannelHandler: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Full websocket url, including the current token.
    async fn connect_url(&self) -> anyhow::Result<String>;

    /// Runs once the namespace is connected, alongside event dispatch.
    async fn drive(
        &self,
        sender: ChannelSender,
        cancel: CancelToken,
    ) -> anyhow::Result<DriveOutcome>;

    async fn on_event(
        &self,
        name: &str,
        payload: EventPayload,
        sender: &ChannelSender,
    ) -> HandlerOutcome;

    async fn on_disconnected(&self) {}
}

/// Lets other components observe a channel and force it to reconnect.
#[derive(Clone)]
pub struct ChannelControl {
    restart: Arc<Notify>,
    state: Arc<watch::Sender<ChannelState>>,
}

impl Default for ChannelControl {
    fn default() -> Self {
        let (state, _rx) = watch::channel(ChannelState::Disconnected);
        Self {
            restart: Arc::new(Notify::new()),
            state: Arc::new(state),
        }
    }
}

impl ChannelControl {
    /// Tears down the live connection, if any. Nothing is stored for later.
    pub fn force_restart(&self) {
        self.restart.notify_waiters();
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }
}

/// The handler's drive task; aborted when the connection ends.
struct DriveTask(JoinHandle<anyhow::Result<DriveOutcome>>);

impl Drop for DriveTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum ConnectionEnd {
    Cancelled,
    PassComplete(Duration),
    Dropped { was_connected: bool },
}

pub struct ChannelManager<H: ChannelHandler + 'static> {
    handler: Arc<H>,
    policy: RetryPolicy,
    control: ChannelControl,
}

impl<H: ChannelHandler + 'static> ChannelManager<H> {
    pub fn new(handler: Arc<H>, policy: RetryPolicy, control: ChannelControl) -> Self {
        Self {
            handler,
            policy,
            control,
        }
    }

    pub fn control(&self) -> ChannelControl {
        self.control.clone()
    }

    /// Keeps the channel alive until cancelled; exhausting retries is fatal.
    pub async fn run(&self, cancel: CancelToken) -> anyhow::Result<()> {
        let kind = self.handler.kind().as_str();
        let mut failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.control.set_state(ChannelState::Connecting);
            let end = self.run_connection(&cancel).await;
            self.control.set_state(ChannelState::Disconnected);
            self.handler.on_disconnected().await;

            match end {
                Ok(ConnectionEnd::Cancelled) => return Ok(()),
                Ok(ConnectionEnd::PassComplete(resume_after)) => {
                    failures = 0;
                    debug!(
                        channel = kind,
                        resume_after_ms = resume_after.as_millis() as u64,
                        "channel pass complete"
                    );
                    if !cancel.sleep(resume_after).await {
                        return Ok(());
                    }
                    continue;
                }
                Ok(ConnectionEnd::Dropped { was_connected }) => {
                    if was_connected {
                        failures = 0;
                    }
                    failures += 1;
                    warn!(channel = kind, failures, "channel disconnected");
                }
                Err(error) => {
                    failures += 1;
                    warn!(channel = kind, failures, error = %format!("{error:#}"), "channel connection failed");
                }
            }

            if failures >= self.policy.max_attempts {
                anyhow::bail!("{kind} channel gave up after {failures} consecutive failures");
            }
            if !cancel.sleep(self.policy.delay_for(failures)).await {
                return Ok(());
            }
        }
    }

    async fn run_connection(&self, cancel: &CancelToken) -> anyhow::Result<ConnectionEnd> {
        let kind = self.handler.kind().as_str();
        let url = self.handler.connect_url().await?;
        let (socket, _response) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to open {kind} websocket"))?;
        let (mut sink, mut stream) = socket.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let sender = ChannelSender::new(tx);
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let result = self.pump(&mut stream, &sender, cancel).await;
        writer.abort();
        result
    }

    async fn pump<S>(
        &self,
        stream: &mut S,
        sender: &ChannelSender,
        cancel: &CancelToken,
    ) -> anyhow::Result<ConnectionEnd>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin
            + Send,
    {
        let kind = self.handler.kind().as_str();
        let mut connected = false;
        let mut drive: Option<DriveTask> = None;
        let mut pending_binary: Option<(String, Value, usize, Vec<Vec<u8>>)> = None;
        let connect_deadline = tokio::time::Instant::now() + NAMESPACE_CONNECT_TIMEOUT;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sender.send_text("41".to_string());
                    return Ok(ConnectionEnd::Cancelled);
                }
                _ = self.control.restart.notified() => {
                    info!(channel = kind, "channel restart requested");
                    return Ok(ConnectionEnd::Dropped { was_connected: connected });
                }
                _ = tokio::time::sleep_until(connect_deadline), if !connected => {
                    anyhow::bail!("{kind} namespace connect timed out");
                }
                joined = async {
                    match drive.as_mut() {
                        Some(task) => (&mut task.0).await,
                        None => std::future::pending().await,
                    }
                } => {
                    drive = None;
                    let outcome = joined.with_context(|| format!("{kind} channel drive task failed"))?;
                    match outcome {
                        Ok(DriveOutcome::Hold) => {}
                        Ok(DriveOutcome::PassComplete { resume_after }) => {
                            let _ = sender.send_text("41".to_string());
                            return Ok(ConnectionEnd::PassComplete(resume_after));
                        }
                        Err(error) => return Err(error.context(format!("{kind} channel drive failed"))),
                    }
                }
                frame = stream.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(error)) => {
                            return Err(anyhow::Error::new(error).context(format!("{kind} websocket read failed")));
                        }
                        None => return Ok(ConnectionEnd::Dropped { was_connected: connected }),
                    };
                    match message {
                        Message::Text(text) => {
                            let Some(packet) = parse_packet(&text) else {
                                continue;
                            };
                            match packet {
                                Packet::Open(_) => {
                                    sender.send_text("40".to_string())?;
                                }
                                Packet::Connect => {
                                    if !connected {
                                        connected = true;
                                        self.control.set_state(ChannelState::Connected);
                                        info!(channel = kind, "channel connected");
                                        let handler = self.handler.clone();
                                        let drive_sender = sender.clone();
                                        let drive_cancel = cancel.clone();
                                        drive = Some(DriveTask(tokio::spawn(async move {
                                            handler.drive(drive_sender, drive_cancel).await
                                        })));
                                    }
                                }
                                Packet::Disconnect => {
                                    return Ok(ConnectionEnd::Dropped { was_connected: connected });
                                }
                                Packet::Ping => {
                                    sender.send_text("3".to_string())?;
                                }
                                Packet::Event { name, data } => {
                                    let outcome = self
                                        .handler
                                        .on_event(&name, EventPayload::json(data), sender)
                                        .await;
                                    if outcome == HandlerOutcome::ForceRestart {
                                        return Ok(ConnectionEnd::Dropped { was_connected: connected });
                                    }
                                }
                                Packet::BinaryEvent { attachments: 0, name, data } => {
                                    let outcome = self
                                        .handler
                                        .on_event(&name, EventPayload::json(data), sender)
                                        .await;
                                    if outcome == HandlerOutcome::ForceRestart {
                                        return Ok(ConnectionEnd::Dropped { was_connected: connected });
                                    }
                                }
                                Packet::BinaryEvent { attachments, name, data } => {
                                    pending_binary = Some((name, data, attachments, Vec::new()));
                                }
                                Packet::Pong | Packet::Other => {}
                            }
                        }
                        Message::Binary(bytes) => {
                            let Some((name, data, expected, mut collected)) = pending_binary.take() else {
                                debug!(channel = kind, "binary frame without a pending event");
                                continue;
                            };
                            collected.push(bytes);
                            if collected.len() < expected {
                                pending_binary = Some((name, data, expected, collected));
                                continue;
                            }
                            let payload = EventPayload { data, attachments: collected };
                            let outcome = self.handler.on_event(&name, payload, sender).await;
                            if outcome == HandlerOutcome::ForceRestart {
                                return Ok(ConnectionEnd::Dropped { was_connected: connected });
                            }
                        }
                        Message::Close(_) => {
                            return Ok(ConnectionEnd::Dropped { was_connected: connected });
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[test]
    fn parses_engine_and_socket_frames() {
        assert_eq!(parse_packet("2"), Some(Packet::Ping));
        assert!(matches!(parse_packet(r#"0{"sid":"abc"}"#), Some(Packet::Open(_))));
        assert_eq!(parse_packet("40"), Some(Packet::Connect));
        assert_eq!(parse_packet(r#"40{"sid":"x"}"#), Some(Packet::Connect));
        assert_eq!(
            parse_packet(r#"42["/building/update",{"position":3}]"#),
            Some(Packet::Event {
                name: "/building/update".to_string(),
                data: json!({"position": 3}),
            })
        );
        assert_eq!(
            parse_packet(r#"4217["/field/enter/v3","abc"]"#),
            Some(Packet::Event {
                name: "/field/enter/v3".to_string(),
                data: json!("abc"),
            })
        );
        assert_eq!(
            parse_packet(r#"451-["/field/objects/v4",{"packs":{"_placeholder":true,"num":0}}]"#),
            Some(Packet::BinaryEvent {
                attachments: 1,
                name: "/field/objects/v4".to_string(),
                data: json!({"packs": {"_placeholder": true, "num": 0}}),
            })
        );
        assert_eq!(parse_packet(""), None);
    }

    #[test]
    fn encodes_events_and_urls() {
        assert_eq!(
            encode_event("/kingdom/enter", &json!({"token": "t"})),
            r#"42["/kingdom/enter",{"token":"t"}]"#
        );
        assert_eq!(
            socket_url("https://sock-lok-live.leagueofkingdoms.com/socket.io/", "tok"),
            "wss://sock-lok-live.leagueofkingdoms.com/socket.io/?token=tok&EIO=4&transport=websocket"
        );
        assert_eq!(
            socket_url("http://127.0.0.1:9000", "tok"),
            "ws://127.0.0.1:9000/socket.io/?token=tok&EIO=4&transport=websocket"
        );
    }

    #[test]
    fn payload_bytes_resolve_placeholders_and_arrays() {
        let payload = EventPayload {
            data: json!({"packs": {"_placeholder": true, "num": 1}, "raw": [1, 2, 3]}),
            attachments: vec![vec![9], vec![7, 8]],
        };
        assert_eq!(payload.bytes_of("packs"), Some(vec![7, 8]));
        assert_eq!(payload.bytes_of("raw"), Some(vec![1, 2, 3]));
        assert_eq!(payload.bytes_of("missing"), None);
    }

    struct RecordingHandler {
        url: String,
        events: Mutex<Vec<(String, EventPayload)>>,
        drives: Mutex<u32>,
        resume_after: Option<Duration>,
    }

    impl RecordingHandler {
        fn new(url: String, resume_after: Option<Duration>) -> Self {
            Self {
                url,
                events: Mutex::new(Vec::new()),
                drives: Mutex::new(0),
                resume_after,
            }
        }
    }

    #[async_trait]
    impl ChannelHandler for RecordingHandler {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Kingdom
        }

        async fn connect_url(&self) -> anyhow::Result<String> {
            Ok(self.url.clone())
        }

        async fn drive(
            &self,
            sender: ChannelSender,
            _cancel: CancelToken,
        ) -> anyhow::Result<DriveOutcome> {
            *self.drives.lock().unwrap() += 1;
            sender.emit("/kingdom/enter", &json!({"token": "t"}))?;
            Ok(match self.resume_after {
                Some(resume_after) => DriveOutcome::PassComplete { resume_after },
                None => DriveOutcome::Hold,
            })
        }

        async fn on_event(
            &self,
            name: &str,
            payload: EventPayload,
            _sender: &ChannelSender,
        ) -> HandlerOutcome {
            self.events
                .lock()
                .unwrap()
                .push((name.to_string(), payload));
            HandlerOutcome::Continue
        }
    }

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn restart_while_disconnected_is_not_replayed() {
        let control = ChannelControl::default();
        control.force_restart();
        let replayed = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            control.restart.notified(),
        )
        .await;
        assert!(replayed.is_err());

        let live = control.restart.notified();
        control.force_restart();
        tokio::time::timeout(std::time::Duration::from_millis(50), live)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unreachable_endpoint_exhausts_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let handler = Arc::new(RecordingHandler::new(
            socket_url(&format!("http://{addr}"), "t"),
            None,
        ));
        let manager = ChannelManager::new(handler, quick_policy(3), ChannelControl::default());
        let error = manager.run(CancelToken::never()).await.unwrap_err();
        assert!(error.to_string().contains("gave up after 3"));
        assert_eq!(manager.control().state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn handshake_dispatches_text_and_binary_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"0{"sid":"s","pingInterval":25000}"#.to_string()))
                .await
                .unwrap();
            let mut seen = Vec::new();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                seen.push(text.clone());
                if text == "40" {
                    ws.send(Message::Text("40".to_string())).await.unwrap();
                    ws.send(Message::Text("2".to_string())).await.unwrap();
                    ws.send(Message::Text(
                        r#"42["/resource/upgrade",{"resourceIdx":1,"value":5}]"#.to_string(),
                    ))
                    .await
                    .unwrap();
                    ws.send(Message::Text(
                        r#"451-["/march/objects",{"packs":{"_placeholder":true,"num":0}}]"#
                            .to_string(),
                    ))
                    .await
                    .unwrap();
                    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
                }
                if text.starts_with("42[\"/kingdom/enter\"") {
                    ws.send(Message::Text("41".to_string())).await.unwrap();
                }
                if text == "3" && seen.iter().any(|t| t.starts_with("42[")) {
                    break;
                }
            }
            seen
        });

        let handler = Arc::new(RecordingHandler::new(
            socket_url(&format!("http://{addr}"), "t"),
            None,
        ));
        let source = CancelSource::new();
        let manager = ChannelManager::new(handler.clone(), quick_policy(1), ChannelControl::default());
        let result = manager.run(source.token()).await;
        assert!(result.is_err());

        let events = handler.events.lock().unwrap().clone();
        let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["/resource/upgrade", "/march/objects"]);
        assert_eq!(events[1].1.bytes_of("packs"), Some(vec![1, 2, 3]));
        assert_eq!(*handler.drives.lock().unwrap(), 1);

        let seen = server.await.unwrap();
        assert!(seen.contains(&"40".to_string()));
        assert!(seen.iter().any(|text| text.starts_with("42[\"/kingdom/enter\"")));
    }
}
