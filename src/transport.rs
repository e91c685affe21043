//! Remote bidirectional stream: wire types, the connector/session trait
//! seams, a websocket implementation, and a scripted mock for tests.
//!
//! The remote service is opaque: we send one setup message followed by
//! encoded audio chunks, and receive a sequence of typed events that may
//! each carry transcript fragments, turn/interruption flags, and inline
//! audio. The websocket transport runs on its own tokio runtime thread
//! and feeds decoded events into the session's crossbeam queue, keeping
//! the core event loop free of async.

use crate::codec::EncodedChunk;
use crate::error::{Result, VoxliveError};
use crate::session::SessionEvent;
use crossbeam_channel::Sender;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// One-time session configuration sent as the first message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Persona text defining the agent's role for this session.
    pub system_instruction: String,
    /// Requested voice identity for synthesized speech.
    pub voice: String,
    /// Requested response modality; always "audio" for this client.
    pub response_modality: String,
    /// Transcribe the user's inbound speech.
    pub input_transcription: bool,
    /// Transcribe the agent's outbound speech.
    pub output_transcription: bool,
}

impl SetupConfig {
    pub fn new(system_instruction: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            system_instruction: system_instruction.into(),
            voice: voice.into(),
            response_modality: "audio".to_string(),
            input_transcription: true,
            output_transcription: true,
        }
    }
}

/// Outbound wire envelope, externally tagged: `{"setup": …}` / `{"audio": …}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Setup(SetupConfig),
    Audio(EncodedChunk),
}

/// One inbound message from the remote stream.
///
/// All fields are optional; a single message may carry several of them.
/// The session dispatches them in a fixed order (transcripts, turn
/// completion, interruption, audio).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerEvent {
    /// Partial transcript fragment of the user's speech.
    pub input_transcript: Option<String>,
    /// Partial transcript fragment of the agent's speech.
    pub output_transcript: Option<String>,
    /// The current turn is finished; finalize accumulated transcripts.
    pub turn_complete: bool,
    /// The user barged in; playback must stop immediately.
    pub interrupted: bool,
    /// Inline audio payload: base64 PCM at the playback rate, mono.
    pub audio: Option<EncodedChunk>,
}

/// An open bidirectional session with the remote service.
pub trait RemoteSession: Send {
    /// Queue one encoded capture chunk for transmission.
    ///
    /// Fire-and-forget: never blocks, and delivery failures surface later
    /// as connection events, not here.
    fn send_audio(&self, chunk: EncodedChunk);

    /// Close the session. Tolerates repeated calls.
    fn close(&mut self);
}

/// Opens remote sessions and wires their events into a session queue.
pub trait RemoteConnector: Send + Sync {
    /// Open a session. Lifecycle and message events are delivered on
    /// `events`: `Connected` once the stream is ready, `Remote` per
    /// message, then exactly one of `ConnectionClosed`/`ConnectionError`.
    ///
    /// # Errors
    /// Only fails synchronously (bad endpoint, runtime setup); handshake
    /// failures arrive as a `ConnectionError` event instead.
    fn connect(
        &self,
        setup: SetupConfig,
        events: Sender<SessionEvent>,
    ) -> Result<Box<dyn RemoteSession>>;
}

enum WsCommand {
    Audio(EncodedChunk),
    Close,
}

/// Websocket connector for the real remote service.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: String,
}

impl WsConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl RemoteConnector for WsConnector {
    fn connect(
        &self,
        setup: SetupConfig,
        events: Sender<SessionEvent>,
    ) -> Result<Box<dyn RemoteSession>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| VoxliveError::Connect {
                message: format!("failed to build transport runtime: {}", e),
            })?;

        let (out_tx, out_rx) = tokio::sync::mpsc::unbounded_channel();
        let endpoint = self.endpoint.clone();

        // The whole websocket lives on one dedicated thread; the session
        // only ever touches channels.
        std::thread::Builder::new()
            .name("voxlive-transport".to_string())
            .spawn(move || {
                runtime.block_on(run_ws(endpoint, setup, events, out_rx));
            })
            .map_err(|e| VoxliveError::Connect {
                message: format!("failed to spawn transport thread: {}", e),
            })?;

        Ok(Box::new(WsSession {
            out_tx,
            closed: false,
        }))
    }
}

/// Drive one websocket connection to completion.
async fn run_ws(
    endpoint: String,
    setup: SetupConfig,
    events: Sender<SessionEvent>,
    mut out_rx: tokio::sync::mpsc::UnboundedReceiver<WsCommand>,
) {
    let ws = match connect_async(endpoint.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            let _ = events.send(SessionEvent::ConnectionError(format!(
                "handshake with {} failed: {}",
                endpoint, e
            )));
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    let setup_json = match serde_json::to_string(&ClientMessage::Setup(setup)) {
        Ok(json) => json,
        Err(e) => {
            let _ = events.send(SessionEvent::ConnectionError(format!(
                "failed to encode setup: {}",
                e
            )));
            return;
        }
    };
    if let Err(e) = sink.send(Message::Text(setup_json.into())).await {
        let _ = events.send(SessionEvent::ConnectionError(format!(
            "failed to send setup: {}",
            e
        )));
        return;
    }

    let _ = events.send(SessionEvent::Connected);

    loop {
        tokio::select! {
            cmd = out_rx.recv() => match cmd {
                Some(WsCommand::Audio(chunk)) => {
                    let json = match serde_json::to_string(&ClientMessage::Audio(chunk)) {
                        Ok(json) => json,
                        Err(e) => {
                            eprintln!("voxlive: failed to encode audio chunk: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(json.into())).await {
                        let _ = events.send(SessionEvent::ConnectionError(format!(
                            "send failed: {}",
                            e
                        )));
                        break;
                    }
                }
                // Close requested, or the session dropped its sender.
                Some(WsCommand::Close) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            let _ = events.send(SessionEvent::Remote(event));
                        }
                        Err(e) => {
                            eprintln!("voxlive: dropping undecodable message: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = events.send(SessionEvent::ConnectionClosed);
                    break;
                }
                Some(Ok(_)) => {} // ping/pong/binary: transport noise
                Some(Err(e)) => {
                    let _ = events.send(SessionEvent::ConnectionError(e.to_string()));
                    break;
                }
            },
        }
    }
}

/// Handle side of a live websocket session.
struct WsSession {
    out_tx: tokio::sync::mpsc::UnboundedSender<WsCommand>,
    closed: bool,
}

impl RemoteSession for WsSession {
    fn send_audio(&self, chunk: EncodedChunk) {
        // Unbounded send never blocks; a dropped receiver means the
        // connection already ended and the chunk is moot.
        let _ = self.out_tx.send(WsCommand::Audio(chunk));
    }

    fn close(&mut self) {
        if !self.closed {
            let _ = self.out_tx.send(WsCommand::Close);
            self.closed = true;
        }
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Default)]
struct ScriptedShared {
    events: Option<Sender<SessionEvent>>,
    last_setup: Option<SetupConfig>,
    sent: Vec<EncodedChunk>,
    close_count: u32,
}

/// Scripted remote connector for tests: the test emits server events by
/// hand and inspects what the session sent.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    shared: Arc<Mutex<ScriptedShared>>,
    fail_connect: Option<String>,
    announce_open: bool,
}

impl ScriptedConnector {
    /// Connector that reports `Connected` as soon as the session connects.
    pub fn new() -> Self {
        Self {
            announce_open: true,
            ..Self::default()
        }
    }

    /// Connector that stays silent after connect; the test decides when
    /// (or whether) the stream opens.
    pub fn pending() -> Self {
        Self::default()
    }

    /// Connector whose `connect` fails synchronously.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_connect: Some(message.into()),
            ..Self::default()
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedShared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push one event into the connected session's queue.
    ///
    /// Returns false if no session is connected or the queue is gone.
    pub fn emit(&self, event: SessionEvent) -> bool {
        let guard = self.lock();
        match &guard.events {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Every audio chunk the session has sent, in order.
    pub fn sent_chunks(&self) -> Vec<EncodedChunk> {
        self.lock().sent.clone()
    }

    /// How many times the session handle was closed.
    pub fn close_count(&self) -> u32 {
        self.lock().close_count
    }

    /// The setup sent by the most recent connect.
    pub fn last_setup(&self) -> Option<SetupConfig> {
        self.lock().last_setup.clone()
    }
}

impl RemoteConnector for ScriptedConnector {
    fn connect(
        &self,
        setup: SetupConfig,
        events: Sender<SessionEvent>,
    ) -> Result<Box<dyn RemoteSession>> {
        if let Some(message) = &self.fail_connect {
            return Err(VoxliveError::Connect {
                message: message.clone(),
            });
        }
        if self.announce_open {
            let _ = events.send(SessionEvent::Connected);
        }
        let mut shared = self.lock();
        shared.events = Some(events);
        shared.last_setup = Some(setup);
        Ok(Box::new(ScriptedSession {
            shared: self.shared.clone(),
        }))
    }
}

struct ScriptedSession {
    shared: Arc<Mutex<ScriptedShared>>,
}

impl RemoteSession for ScriptedSession {
    fn send_audio(&self, chunk: EncodedChunk) {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sent
            .push(chunk);
    }

    fn close(&mut self) {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .close_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn client_setup_message_is_externally_tagged() {
        let setup = SetupConfig::new("Be helpful.", "Puck");
        let json = serde_json::to_string(&ClientMessage::Setup(setup)).unwrap();
        assert!(json.starts_with("{\"setup\":"));
        assert!(json.contains("\"response_modality\":\"audio\""));
        assert!(json.contains("\"input_transcription\":true"));
    }

    #[test]
    fn client_audio_message_carries_mime() {
        let chunk = crate::codec::encode_frame(&[0.0; 4]);
        let json = serde_json::to_string(&ClientMessage::Audio(chunk)).unwrap();
        assert!(json.starts_with("{\"audio\":"));
        assert!(json.contains("pcm;rate=16000"));
    }

    #[test]
    fn server_event_defaults_all_fields() {
        let event: ServerEvent = serde_json::from_str("{}").unwrap();
        assert_eq!(event, ServerEvent::default());
        assert!(!event.turn_complete);
        assert!(!event.interrupted);
    }

    #[test]
    fn server_event_parses_combined_message() {
        let json = r#"{
            "input_transcript": "Hola",
            "turn_complete": true,
            "audio": {"data": "AAAA", "mime_type": "pcm;rate=24000"}
        }"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.input_transcript.as_deref(), Some("Hola"));
        assert!(event.turn_complete);
        assert!(!event.interrupted);
        assert_eq!(event.audio.unwrap().data, "AAAA");
    }

    #[test]
    fn server_event_ignores_unknown_fields() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"usage": {"tokens": 12}, "turn_complete": true}"#).unwrap();
        assert!(event.turn_complete);
    }

    #[test]
    fn scripted_connector_records_sent_chunks() {
        let connector = ScriptedConnector::new();
        let (tx, rx) = unbounded();
        let session = connector
            .connect(SetupConfig::new("x", "y"), tx)
            .unwrap();

        // announce_open delivers Connected immediately.
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Connected)));

        session.send_audio(crate::codec::encode_frame(&[0.1; 8]));
        assert_eq!(connector.sent_chunks().len(), 1);
    }

    #[test]
    fn scripted_connector_emits_into_session_queue() {
        let connector = ScriptedConnector::pending();
        let (tx, rx) = unbounded();
        let _session = connector.connect(SetupConfig::new("x", "y"), tx).unwrap();

        assert!(rx.try_recv().is_err());
        assert!(connector.emit(SessionEvent::Connected));
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Connected)));
    }

    #[test]
    fn scripted_connector_connect_failure() {
        let connector = ScriptedConnector::failing("refused");
        let (tx, _rx) = unbounded();
        let err = connector
            .connect(SetupConfig::new("x", "y"), tx)
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, VoxliveError::Connect { .. }));
        assert!(!connector.emit(SessionEvent::Connected));
    }

    #[test]
    fn scripted_session_close_is_counted() {
        let connector = ScriptedConnector::new();
        let (tx, _rx) = unbounded();
        let mut session = connector.connect(SetupConfig::new("x", "y"), tx).unwrap();
        session.close();
        session.close();
        assert_eq!(connector.close_count(), 2);
    }
}
