//! Duplex voice session controller.
//!
//! Owns the connection lifecycle: `Idle -> Connecting -> Open -> Closing ->
//! Idle`, with an orthogonal error flag cleared only by a fresh `Connecting`
//! transition. A generation counter stale-proofs every async callback: the
//! receive loop checks it before touching shared state, so nothing from a
//! torn-down session can fire afterward.
//!
//! Configuration (language, voice, analysis context) is fixed at connect
//! time and immutable for the lifetime of a handle. Changing it means
//! disconnecting and reconnecting; there is deliberately no hot reload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::connect_async;
use url::Url;
use uuid::Uuid;

use crate::analysis::AnalysisReport;
use crate::audio::playback::OUTPUT_SAMPLE_RATE;
use crate::audio::{CapturePipeline, EncodedChunk, PlaybackPipeline, PlaybackScheduler, codec};
use crate::config::Config;
use crate::protocol::{
    self, ClientMessage, Content, ContentPart, GenerationConfig, PrebuiltVoiceConfig, ServerMessage,
    Setup, SpeechConfig, TranscriptionConfig, VoiceConfig,
};
use crate::transcript::{ConversationEntry, Role, TranscriptLog};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;
type WsSource = futures_util::stream::SplitStream<WsStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("microphone access denied or unavailable: {0}")]
    PermissionDenied(String),

    #[error("no API credential configured (set GEMINI_API_KEY or api_key in medivoice.toml)")]
    AuthFailure,

    #[error("connection failed: {0}")]
    ConnectFailure(String),
}

/// Unified event surface consumed by the UI loop.
#[derive(Debug)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Transcript(ConversationEntry),
    Interrupted,
    TurnComplete,
    TransportError(String),
    Closed,
}

/// Connect-time configuration, immutable for the life of one handle.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub language: String,
    pub voice: String,
    pub analysis: Option<AnalysisReport>,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            language: config.language.clone(),
            voice: config.voice.clone(),
            analysis: None,
        }
    }
}

struct SharedState {
    state: Mutex<SessionState>,
    error: Mutex<Option<String>>,
    generation: AtomicU64,
}

impl SharedState {
    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }
}

enum IoCommand {
    Close,
}

struct LiveSession {
    handle_id: Uuid,
    capture: CapturePipeline,
    playback: PlaybackPipeline,
    cmd_tx: mpsc::Sender<IoCommand>,
    io_task: tokio::task::JoinHandle<()>,
}

pub struct VoiceSession {
    config: Config,
    shared: Arc<SharedState>,
    events_tx: mpsc::Sender<SessionEvent>,
    transcript: Arc<Mutex<TranscriptLog>>,
    live: Option<LiveSession>,
}

impl VoiceSession {
    pub fn new(
        config: Config,
        events_tx: mpsc::Sender<SessionEvent>,
        transcript: Arc<Mutex<TranscriptLog>>,
    ) -> Self {
        Self {
            config,
            shared: Arc::new(SharedState {
                state: Mutex::new(SessionState::Idle),
                error: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
            events_tx,
            transcript,
            live: None,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().unwrap()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.error.lock().unwrap().clone()
    }

    /// Open a new duplex session with the given options.
    ///
    /// At most one session is live at a time: an already-open session is
    /// torn down first. On failure the state is back at `Idle` with the
    /// error flag set.
    pub async fn connect(&mut self, options: SessionOptions) -> Result<(), SessionError> {
        self.disconnect().await;

        self.shared.set_state(SessionState::Connecting);
        *self.shared.error.lock().unwrap() = None;
        emit(&self.events_tx, SessionEvent::StateChanged(SessionState::Connecting));

        match self.establish(&options).await {
            Ok(live) => {
                log::info!("voice session {} open", live.handle_id);
                self.live = Some(live);
                self.shared.set_state(SessionState::Open);
                emit(&self.events_tx, SessionEvent::StateChanged(SessionState::Open));
                Ok(())
            }
            Err(e) => {
                *self.shared.error.lock().unwrap() = Some(e.to_string());
                self.shared.set_state(SessionState::Idle);
                emit(&self.events_tx, SessionEvent::StateChanged(SessionState::Idle));
                Err(e)
            }
        }
    }

    async fn establish(&mut self, options: &SessionOptions) -> Result<LiveSession, SessionError> {
        if !self.config.has_credential() {
            return Err(SessionError::AuthFailure);
        }

        // New generation: pending callbacks from any older session are
        // no-ops from here on.
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (frames_tx, frames_rx) = mpsc::channel::<EncodedChunk>(64);
        let capture = CapturePipeline::start(&self.config.capture_device, frames_tx)
            .map_err(|e| SessionError::PermissionDenied(e.to_string()))?;

        let endpoint = format!("{}?key={}", self.config.live_endpoint, self.config.api_key);
        // Log the host only; the query string carries the credential.
        let host = Url::parse(&endpoint)
            .map_err(|e| SessionError::ConnectFailure(e.to_string()))?
            .host_str()
            .unwrap_or("<unknown>")
            .to_string();
        log::info!("dialing {host}...");

        let (ws, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| SessionError::ConnectFailure(e.to_string()))?;

        let playback = PlaybackPipeline::start(&self.config.playback_device)
            .map_err(|e| SessionError::ConnectFailure(format!("output device: {e}")))?;

        let (mut ws_tx, ws_rx) = ws.split();
        let setup = build_setup(&self.config, options);
        let raw = serde_json::to_string(&ClientMessage::setup(setup))
            .map_err(|e| SessionError::ConnectFailure(e.to_string()))?;
        ws_tx
            .send(Message::Text(raw.into()))
            .await
            .map_err(|e| SessionError::ConnectFailure(e.to_string()))?;

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let ctx = IoContext {
            shared: self.shared.clone(),
            generation,
            events_tx: self.events_tx.clone(),
            transcript: self.transcript.clone(),
            scheduler: playback.scheduler(),
        };
        let io_task = tokio::spawn(io_loop(ws_tx, ws_rx, frames_rx, cmd_rx, ctx));

        Ok(LiveSession {
            handle_id: Uuid::new_v4(),
            capture,
            playback,
            cmd_tx,
            io_task,
        })
    }

    /// Tear everything down. Valid in any state; calling it again is a
    /// no-op. Each teardown step is attempted independently.
    pub async fn disconnect(&mut self) {
        let Some(mut live) = self.live.take() else {
            return;
        };

        self.shared.set_state(SessionState::Closing);
        emit(&self.events_tx, SessionEvent::StateChanged(SessionState::Closing));
        // Stale-proof every pending callback from this session.
        self.shared.generation.fetch_add(1, Ordering::SeqCst);

        let _ = live.cmd_tx.send(IoCommand::Close).await;
        live.capture.stop();
        live.playback.stop();
        if tokio::time::timeout(Duration::from_millis(500), &mut live.io_task)
            .await
            .is_err()
        {
            live.io_task.abort();
        }

        self.shared.set_state(SessionState::Idle);
        emit(&self.events_tx, SessionEvent::StateChanged(SessionState::Idle));
        log::info!("voice session {} closed", live.handle_id);
    }
}

struct IoContext {
    shared: Arc<SharedState>,
    generation: u64,
    events_tx: mpsc::Sender<SessionEvent>,
    transcript: Arc<Mutex<TranscriptLog>>,
    scheduler: Arc<Mutex<PlaybackScheduler>>,
}

impl IoContext {
    fn is_current(&self) -> bool {
        self.shared.generation.load(Ordering::SeqCst) == self.generation
    }

    fn handle_raw(&self, raw: &str) {
        match ServerMessage::parse(raw) {
            Ok(msg) => route_server_message(
                msg,
                &self.transcript,
                &self.scheduler,
                &self.events_tx,
            ),
            Err(e) => log::debug!("unparseable server message ({e}): {raw}"),
        }
    }

    fn on_closed(&self, error: Option<String>) {
        if !self.is_current() {
            return;
        }
        self.shared.set_state(SessionState::Closing);
        if let Some(err) = error {
            log::error!("transport error: {err}");
            *self.shared.error.lock().unwrap() = Some(err.clone());
            emit(&self.events_tx, SessionEvent::TransportError(err));
        }
        self.shared.set_state(SessionState::Idle);
        emit(&self.events_tx, SessionEvent::Closed);
    }
}

async fn io_loop(
    mut ws_tx: WsSink,
    mut ws_rx: WsSource,
    mut frames_rx: mpsc::Receiver<EncodedChunk>,
    mut cmd_rx: mpsc::Receiver<IoCommand>,
    ctx: IoContext,
) {
    loop {
        tokio::select! {
            Some(cmd) = cmd_rx.recv() => match cmd {
                IoCommand::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },

            Some(chunk) = frames_rx.recv() => {
                if !ctx.is_current() {
                    break;
                }
                let raw = match serde_json::to_string(&ClientMessage::audio_chunk(chunk)) {
                    Ok(raw) => raw,
                    Err(e) => {
                        log::error!("failed to serialize audio chunk: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(raw.into())).await {
                    ctx.on_closed(Some(format!("send failed: {e}")));
                    break;
                }
            },

            inbound = ws_rx.next() => {
                if !ctx.is_current() {
                    break;
                }
                match inbound {
                    Some(Ok(Message::Text(text))) => ctx.handle_raw(&text),
                    // Some servers deliver JSON in binary frames.
                    Some(Ok(Message::Binary(data))) => {
                        if let Ok(text) = String::from_utf8(data.to_vec()) {
                            ctx.handle_raw(&text);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("server closed connection: {frame:?}");
                        ctx.on_closed(None);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        ctx.on_closed(Some(e.to_string()));
                        break;
                    }
                    None => {
                        ctx.on_closed(None);
                        break;
                    }
                }
            },

            else => break,
        }
    }
}

/// Dispatch one inbound message: transcript fragments to the sink in
/// arrival order, audio payloads to the scheduler, interruption to the
/// flush-and-reset path. Corrupt audio chunks are dropped, never fatal.
fn route_server_message(
    msg: ServerMessage,
    transcript: &Mutex<TranscriptLog>,
    scheduler: &Mutex<PlaybackScheduler>,
    events_tx: &mpsc::Sender<SessionEvent>,
) {
    if msg.setup_complete.is_some() {
        log::debug!("server acknowledged setup");
    }
    let Some(content) = msg.server_content else {
        return;
    };

    if content.interrupted == Some(true) {
        scheduler.lock().unwrap().interrupt();
        emit(events_tx, SessionEvent::Interrupted);
    }

    if let Some(text) = content.input_transcription.and_then(|t| t.text) {
        transcript.lock().unwrap().append(Role::User, text.clone());
        emit(
            events_tx,
            SessionEvent::Transcript(ConversationEntry {
                role: Role::User,
                text,
            }),
        );
    }
    if let Some(text) = content.output_transcription.and_then(|t| t.text) {
        transcript.lock().unwrap().append(Role::Assistant, text.clone());
        emit(
            events_tx,
            SessionEvent::Transcript(ConversationEntry {
                role: Role::Assistant,
                text,
            }),
        );
    }

    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            if let Some(inline) = part.inline_data {
                let rate =
                    protocol::mime_sample_rate(&inline.mime_type).unwrap_or(OUTPUT_SAMPLE_RATE);
                match codec::decode_transport(&inline.data)
                    .and_then(|bytes| codec::decode_to_playback_buffer(&bytes, rate, 1))
                {
                    Ok(buffer) => {
                        scheduler.lock().unwrap().schedule(buffer);
                    }
                    Err(e) => log::warn!("dropping corrupt audio chunk: {e}"),
                }
            } else if let Some(text) = part.text {
                log::debug!("model text part: {text}");
            }
        }
    }

    if content.turn_complete == Some(true) {
        emit(events_tx, SessionEvent::TurnComplete);
    }
}

fn emit(events_tx: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if let Err(e) = events_tx.try_send(event) {
        log::warn!("dropping session event: {e}");
    }
}

fn build_setup(config: &Config, options: &SessionOptions) -> Setup {
    Setup {
        model: config.live_model.clone(),
        generation_config: GenerationConfig {
            response_modalities: vec!["AUDIO".into()],
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: options.voice.clone(),
                    },
                },
                language_code: Some(options.language.clone()),
            },
        },
        system_instruction: Some(Content {
            parts: vec![ContentPart {
                text: build_system_instruction(&options.language, options.analysis.as_ref()),
            }],
        }),
        input_audio_transcription: config.transcribe_input.then(|| TranscriptionConfig {}),
        output_audio_transcription: config.transcribe_output.then(|| TranscriptionConfig {}),
    }
}

fn build_system_instruction(language: &str, analysis: Option<&AnalysisReport>) -> String {
    let mut instruction = format!(
        "You are a warm, clear medical assistant having a spoken conversation with a \
         patient. Speak {language}. Keep answers short and conversational. You are not \
         a doctor: remind the patient to consult a professional for treatment decisions."
    );
    if let Some(report) = analysis {
        instruction.push_str(
            " The patient has already received an automated analysis of their medical \
             image. Discuss it naturally instead of reading it back verbatim. ",
        );
        instruction.push_str(&report.narration());
    }
    instruction
}
