//! Session lifecycle: a single event loop owns the transcript, the
//! playback scheduler, and the connection, and is the only thread that
//! mutates them.
//!
//! Everything else (capture thread, transport thread, playback
//! completions) feeds the loop through one bounded queue, so there is
//! no locking around the core state and causal order is preserved per
//! producer.

use crate::audio::DeviceFactory;
use crate::audio::capture::AudioSource;
use crate::audio::output::PlaybackId;
use crate::codec::{self, EncodedChunk};
use crate::defaults;
use crate::error::VoxliveError;
use crate::playback::PlaybackScheduler;
use crate::transcript::{Speaker, TranscriptAggregator, TranscriptItem};
use crate::transport::{RemoteConnector, RemoteSession, ServerEvent, SetupConfig};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MAX_CONSECUTIVE_READ_ERRORS: u32 = 10;
const TEARDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Error,
}

impl SessionState {
    /// Short label suitable for a status line.
    pub fn status_label(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting...",
            SessionState::Open => "Connected",
            SessionState::Closed => "Disconnected",
            SessionState::Error => "Error",
        }
    }

    /// Whether the session is still doing useful work.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Open)
    }
}

/// One unit of work for the session event loop.
#[derive(Debug)]
pub enum SessionEvent {
    /// The remote stream finished its handshake.
    Connected,
    /// One inbound message from the remote service.
    Remote(ServerEvent),
    /// One encoded capture frame ready to transmit.
    Capture(EncodedChunk),
    /// A scheduled playback chunk finished rendering.
    PlaybackDone(PlaybackId),
    /// The remote stream closed cleanly.
    ConnectionClosed,
    /// The connection failed, during handshake or mid-session.
    ConnectionError(String),
    /// The user asked to end the session.
    Stop,
}

/// Snapshot of presentation state, republished by the loop after every
/// event so readers never observe a half-applied update.
#[derive(Debug, Clone)]
struct Snapshot {
    state: SessionState,
    items: Vec<TranscriptItem>,
    interim_user: String,
    interim_agent: String,
}

impl Snapshot {
    fn new(state: SessionState) -> Self {
        Self {
            state,
            items: Vec::new(),
            interim_user: String::new(),
            interim_agent: String::new(),
        }
    }
}

type SharedSnapshot = Arc<Mutex<Snapshot>>;

fn lock_snapshot(shared: &SharedSnapshot) -> std::sync::MutexGuard<'_, Snapshot> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// How a session ended; decides the final state and closing message.
enum Outcome {
    UserStop,
    RemoteClosed,
    Failed(VoxliveError),
}

/// A voice session waiting to be started.
pub struct Session {
    setup: SetupConfig,
}

impl Session {
    pub fn new(setup: SetupConfig) -> Self {
        Self { setup }
    }

    /// Acquire devices, connect, and spawn the event loop.
    ///
    /// Never fails: device or connect errors produce a handle that is
    /// already terminal, with the failure recorded as a system
    /// transcript entry, so callers surface errors the same way they
    /// surface everything else.
    pub fn start(
        self,
        connector: &dyn RemoteConnector,
        devices: &dyn DeviceFactory,
    ) -> SessionHandle {
        let shared = Arc::new(Mutex::new(Snapshot::new(SessionState::Connecting)));

        let source = match devices.open_input() {
            Ok(source) => source,
            Err(e) => {
                return SessionHandle::failed(shared, format!("Microphone unavailable: {e}"));
            }
        };

        let (done_tx, done_rx) = unbounded::<PlaybackId>();
        let output = match devices.open_output(done_tx) {
            Ok(output) => output,
            Err(e) => {
                return SessionHandle::failed(shared, format!("Audio output unavailable: {e}"));
            }
        };

        let (event_tx, event_rx) = bounded(defaults::EVENT_QUEUE_SIZE);

        let remote = match connector.connect(self.setup, event_tx.clone()) {
            Ok(remote) => remote,
            Err(e) => {
                return SessionHandle::failed(shared, format!("Connection failed: {e}"));
            }
        };

        // Forward playback completions from the output callback into the
        // event queue. Polls a running flag because output handles may
        // outlive the session and keep the channel open.
        let forward_tx = event_tx.clone();
        let forwarder_running = Arc::new(AtomicBool::new(true));
        let forwarding = forwarder_running.clone();
        let forwarder = thread::spawn(move || {
            while forwarding.load(Ordering::SeqCst) {
                match done_rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(id) => {
                        if forward_tx.send(SessionEvent::PlaybackDone(id)).is_err() {
                            break;
                        }
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        let capture_running = Arc::new(AtomicBool::new(false));
        let mut event_loop = EventLoop {
            shared: shared.clone(),
            state: SessionState::Connecting,
            aggregator: TranscriptAggregator::new(),
            scheduler: PlaybackScheduler::new(output),
            remote,
            source: Some(source),
            capture_tx: event_tx.clone(),
            capture_running,
            capture_thread: None,
        };

        let thread = thread::spawn(move || event_loop.run(event_rx));

        SessionHandle {
            event_tx: Some(event_tx),
            shared,
            thread: Some(thread),
            forwarder: Some(forwarder),
            forwarder_running,
        }
    }
}

struct EventLoop {
    shared: SharedSnapshot,
    state: SessionState,
    aggregator: TranscriptAggregator,
    scheduler: PlaybackScheduler,
    remote: Box<dyn RemoteSession>,
    source: Option<Box<dyn AudioSource>>,
    capture_tx: Sender<SessionEvent>,
    capture_running: Arc<AtomicBool>,
    capture_thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    fn run(&mut self, events: Receiver<SessionEvent>) {
        self.publish();

        let outcome = loop {
            // All senders gone without a Stop means the handle was
            // dropped; treat it like one.
            let Ok(event) = events.recv() else {
                break Outcome::UserStop;
            };
            if let Some(outcome) = self.handle(event) {
                break outcome;
            }
            self.publish();
        };

        self.teardown(outcome);
        self.publish();
    }

    fn handle(&mut self, event: SessionEvent) -> Option<Outcome> {
        match event {
            SessionEvent::Connected => {
                if self.state != SessionState::Connecting {
                    return None;
                }
                self.state = SessionState::Open;
                self.aggregator.note_open(defaults::READY_MESSAGE);
                if let Err(e) = self.start_capture() {
                    return Some(Outcome::Failed(e));
                }
                None
            }
            SessionEvent::Remote(server_event) => {
                if self.state == SessionState::Open {
                    self.dispatch(server_event);
                }
                None
            }
            SessionEvent::Capture(chunk) => {
                if self.state == SessionState::Open {
                    self.remote.send_audio(chunk);
                }
                None
            }
            SessionEvent::PlaybackDone(id) => {
                self.scheduler.completed(id);
                None
            }
            SessionEvent::ConnectionClosed => Some(Outcome::RemoteClosed),
            SessionEvent::ConnectionError(message) => {
                Some(Outcome::Failed(VoxliveError::Remote { message }))
            }
            SessionEvent::Stop => Some(Outcome::UserStop),
        }
    }

    /// Apply one inbound message in a fixed field order: transcripts
    /// first, then turn completion, then interruption, then audio. The
    /// order matters when a single message carries several fields; in
    /// particular, audio arriving alongside an interruption belongs to
    /// the new turn and must be scheduled after the old one is cleared.
    fn dispatch(&mut self, event: ServerEvent) {
        if let Some(fragment) = event.input_transcript {
            self.aggregator.push_user(&fragment);
        }
        if let Some(fragment) = event.output_transcript {
            self.aggregator.push_agent(&fragment);
        }
        if event.turn_complete {
            self.aggregator.finalize_turn();
        }
        if event.interrupted {
            self.scheduler.interrupt();
        }
        if let Some(chunk) = event.audio {
            self.schedule_audio(&chunk);
        }
    }

    /// Decode and enqueue one inbound audio chunk. Malformed payloads
    /// are dropped with a log line; one bad chunk must not end the
    /// session.
    fn schedule_audio(&mut self, chunk: &EncodedChunk) {
        let bytes = match codec::unframe(chunk) {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("voxlive: dropping undecodable audio chunk: {e}");
                return;
            }
        };
        let buffer = match codec::decode_chunk(
            &bytes,
            defaults::PLAYBACK_SAMPLE_RATE,
            defaults::PLAYBACK_CHANNELS,
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                eprintln!("voxlive: dropping malformed audio chunk: {e}");
                return;
            }
        };
        if let Err(e) = self.scheduler.enqueue(&buffer) {
            eprintln!("voxlive: failed to schedule playback: {e}");
        }
    }

    /// Start the microphone and the capture thread that frames samples
    /// and feeds them into the event queue.
    fn start_capture(&mut self) -> crate::error::Result<()> {
        let Some(mut source) = self.source.take() else {
            return Ok(());
        };
        source.start()?;

        self.capture_running.store(true, Ordering::SeqCst);
        let running = self.capture_running.clone();
        let event_tx = self.capture_tx.clone();

        self.capture_thread = Some(thread::spawn(move || {
            let poll = Duration::from_millis(defaults::CAPTURE_POLL_MS);
            let mut pending: Vec<f32> = Vec::new();
            let mut consecutive_errors: u32 = 0;

            while running.load(Ordering::SeqCst) {
                match source.read_samples() {
                    Ok(samples) => {
                        consecutive_errors = 0;
                        pending.extend_from_slice(&samples);
                        while pending.len() >= defaults::FRAME_SAMPLES {
                            let frame: Vec<f32> =
                                pending.drain(..defaults::FRAME_SAMPLES).collect();
                            let chunk = codec::encode_frame(&frame);
                            // Drop the frame if the queue is full rather
                            // than stalling the microphone.
                            if event_tx.try_send(SessionEvent::Capture(chunk)).is_err()
                                && event_tx.is_full()
                            {
                                eprintln!("voxlive: event queue full, dropping capture frame");
                            }
                        }
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        eprintln!("voxlive: audio read error: {e}");
                        if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                            eprintln!("voxlive: too many audio read errors, stopping capture");
                            break;
                        }
                    }
                }
                thread::sleep(poll);
            }

            if let Err(e) = source.stop() {
                eprintln!("voxlive: failed to stop audio capture: {e}");
            }
        }));

        Ok(())
    }

    /// Release everything, in order: connection, capture, playback.
    /// Each step tolerates never having started.
    fn teardown(&mut self, outcome: Outcome) {
        self.remote.close();

        self.capture_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.capture_thread.take() {
            join_with_deadline(handle, TEARDOWN_JOIN_TIMEOUT, "capture");
        }
        // Mic handle that was acquired but never started.
        drop(self.source.take());

        self.scheduler.release();

        let (state, message) = match outcome {
            Outcome::UserStop => (SessionState::Closed, "Session ended.".to_string()),
            Outcome::RemoteClosed => (SessionState::Error, VoxliveError::RemoteClosed.to_string()),
            Outcome::Failed(err) => (SessionState::Error, err.to_string()),
        };
        self.state = state;
        self.aggregator.note_closed(&message);
    }

    fn publish(&self) {
        let mut snapshot = lock_snapshot(&self.shared);
        snapshot.state = self.state;
        snapshot.items = self.aggregator.items().to_vec();
        let (user, agent) = self.aggregator.interim();
        snapshot.interim_user = user.to_string();
        snapshot.interim_agent = agent.to_string();
    }
}

fn join_with_deadline(handle: JoinHandle<()>, timeout: Duration, name: &str) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    if handle.is_finished() {
        if handle.join().is_err() {
            eprintln!("voxlive: {name} thread panicked");
        }
    } else {
        eprintln!("voxlive: {name} thread still running at teardown, detaching");
    }
}

/// Owner's view of a running (or already finished) session.
///
/// Dropping the handle stops the session.
pub struct SessionHandle {
    event_tx: Option<Sender<SessionEvent>>,
    shared: SharedSnapshot,
    thread: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
    forwarder_running: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Handle for a session that failed before its loop could start.
    fn failed(shared: SharedSnapshot, message: String) -> Self {
        eprintln!("voxlive: session start failed: {message}");
        {
            let mut snapshot = lock_snapshot(&shared);
            snapshot.state = SessionState::Error;
            snapshot
                .items
                .push(TranscriptItem::new(Speaker::System, &message));
        }
        Self {
            event_tx: None,
            shared,
            thread: None,
            forwarder: None,
            forwarder_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> SessionState {
        lock_snapshot(&self.shared).state
    }

    pub fn status(&self) -> &'static str {
        self.state().status_label()
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Finalized transcript entries, oldest first.
    pub fn transcript(&self) -> Vec<TranscriptItem> {
        lock_snapshot(&self.shared).items.clone()
    }

    /// In-flight (not yet finalized) user and agent text.
    pub fn interim(&self) -> (String, String) {
        let snapshot = lock_snapshot(&self.shared);
        (snapshot.interim_user.clone(), snapshot.interim_agent.clone())
    }

    /// Ask the session to stop and wait for teardown to finish.
    /// Safe to call repeatedly, and after the session already ended.
    pub fn stop(&mut self) {
        if let Some(tx) = self.event_tx.take() {
            // Err means the loop already exited; nothing to do.
            let _ = tx.send(SessionEvent::Stop);
        }
        if let Some(thread) = self.thread.take() {
            join_with_deadline(thread, TEARDOWN_JOIN_TIMEOUT, "session");
        }
        self.forwarder_running.store(false, Ordering::SeqCst);
        if let Some(forwarder) = self.forwarder.take() {
            join_with_deadline(forwarder, TEARDOWN_JOIN_TIMEOUT, "completion forwarder");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
