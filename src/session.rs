//! Command session facade.
//!
//! A [`Session`] owns one transport and the sequence bookkeeping for it.
//! `execute` calls are serialised by an internal mutex; `close` may be called
//! from any thread and aborts an in-flight wait within one poll slice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::DriverConfig;
use crate::error::FiscalError;
use crate::protocol::commands::{encode_fields, Answer, CommandSet};
use crate::protocol::engine::{next_sequence, EngineError, RetryEngine, RetryPolicy};
use crate::protocol::frame::{Frame, FrameCodec, MIN_SEQUENCE};
use crate::protocol::status::StatusSnapshot;
use crate::transport::{create_transport, Transport};

// ---------------------------------------------------------------------------
// Options / results
// ---------------------------------------------------------------------------

/// Knobs for [`Session::open_with`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub retry: RetryPolicy,
    pub codec: FrameCodec,
    pub commands: CommandSet,
    pub clock: Arc<dyn Clock>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            codec: FrameCodec::new(),
            commands: CommandSet::standard(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            retry: config.retry,
            codec: FrameCodec::with_escaping(config.escape_control_bytes),
            ..Self::default()
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_commands(mut self, commands: CommandSet) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }
}

/// Result of a successful `execute`.
#[derive(Debug, Clone)]
pub struct Reply {
    pub sequence: u8,
    pub command: u16,
    pub status: StatusSnapshot,
    pub answer: Answer,
    /// Times the request frame went on the wire (1 without retries).
    pub transmissions: u32,
    pub completed_at: DateTime<Utc>,
}

impl Reply {
    pub fn into_parts(self) -> (StatusSnapshot, Answer) {
        (self.status, self.answer)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SessionState {
    /// Sequence for the next frame, once `advance_pending` is applied.
    sequence: u8,
    /// Last exchange succeeded; bump `sequence` before the next send.
    advance_pending: bool,
    last_sequence_sent: Option<u8>,
    last_frame_sent: Option<Frame>,
    last_reply_received: Option<Frame>,
    last_status: Option<StatusSnapshot>,
    faulted: bool,
}

struct SessionInner {
    transport: Box<dyn Transport>,
    engine: RetryEngine,
    state: SessionState,
    closed: bool,
}

impl SessionInner {
    fn release(&mut self, id: &Uuid) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.transport.disconnect() {
            warn!(session = %id, "Disconnect failed: {e}");
        }
        info!(session = %id, "Session closed");
    }
}

/// A logical connection to one fiscal device.
pub struct Session {
    id: Uuid,
    description: String,
    commands: CommandSet,
    closing: Arc<AtomicBool>,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("transport", &self.description)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Open the transport described by `config`.
    pub fn open(config: &DriverConfig) -> Result<Self, FiscalError> {
        config.validate()?;
        Self::open_with(
            create_transport(&config.transport),
            SessionOptions::from_config(config),
        )
    }

    /// Open over an already-built transport (simulator, custom link).
    pub fn open_with(
        mut transport: Box<dyn Transport>,
        options: SessionOptions,
    ) -> Result<Self, FiscalError> {
        let id = Uuid::new_v4();
        let description = transport.description();
        if !transport.is_connected() {
            transport.connect()?;
        }
        info!(session = %id, "Session opened on {description}");

        let closing = Arc::new(AtomicBool::new(false));
        let engine = RetryEngine::new(
            options.retry,
            options.codec,
            options.clock,
            Arc::clone(&closing),
        );
        Ok(Self {
            id,
            description,
            commands: options.commands,
            closing,
            inner: Mutex::new(SessionInner {
                transport,
                engine,
                state: SessionState {
                    sequence: MIN_SEQUENCE,
                    ..SessionState::default()
                },
                closed: false,
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn commands(&self) -> &CommandSet {
        &self.commands
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one command with TAB-terminated parameters.
    pub fn execute<F: AsRef<[u8]>>(
        &self,
        command: u16,
        fields: &[F],
    ) -> Result<Reply, FiscalError> {
        self.commands
            .validate(command, fields.len())
            .and_then(|()| encode_fields(fields))
            .map_err(|e| FiscalError::InvalidPayload(e.to_string()))
            .and_then(|data| self.execute_raw(command, &data))
    }

    /// Run one command with a pre-built DATA payload.
    pub fn execute_raw(&self, command: u16, data: &[u8]) -> Result<Reply, FiscalError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(FiscalError::Closed);
        }
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.closed || self.closing.load(Ordering::SeqCst) {
            return Err(FiscalError::Closed);
        }
        if inner.state.faulted {
            return Err(FiscalError::Faulted);
        }

        let state = &mut inner.state;
        if state.advance_pending {
            state.sequence = next_sequence(state.sequence);
            state.advance_pending = false;
        }
        let request = Frame::request(state.sequence, command, data);
        debug!(
            session = %self.id,
            seq = request.sequence,
            cmd = command,
            "Executing command"
        );

        let result = inner.engine.exchange(
            inner.transport.as_mut(),
            &request,
            state.last_reply_received.as_ref(),
        );
        if !matches!(result, Err(EngineError::InvalidPayload(_))) {
            state.last_sequence_sent = Some(request.sequence);
            state.last_frame_sent = Some(request.clone());
        }

        match result {
            Ok(exchange) => {
                let reply = exchange.reply;
                let Some(raw_status) = reply.status else {
                    return Err(FiscalError::ProtocolViolation {
                        reason: "reply carries no status field".into(),
                        last_status: state.last_status.clone(),
                    });
                };
                let status = StatusSnapshot::decode(&raw_status);
                for diagnostic in &status.diagnostics {
                    warn!(session = %self.id, seq = reply.sequence, "Status: {diagnostic}");
                }
                if status.general_error {
                    debug!(
                        session = %self.id,
                        conditions = ?status.active_conditions(),
                        "Device reports errors"
                    );
                }

                state.advance_pending = true;
                state.last_status = Some(status.clone());
                let answer = Answer::parse(reply.data.clone());
                let sequence = reply.sequence;
                state.last_reply_received = Some(reply);
                Ok(Reply {
                    sequence,
                    command,
                    status,
                    answer,
                    transmissions: exchange.transmissions,
                    completed_at: Utc::now(),
                })
            }
            Err(e) => Err(self.map_engine_error(state, command, e)),
        }
    }

    fn map_engine_error(
        &self,
        state: &mut SessionState,
        command: u16,
        error: EngineError,
    ) -> FiscalError {
        match error {
            EngineError::InvalidPayload(e) => FiscalError::InvalidPayload(e.to_string()),
            EngineError::Unresponsive { transmissions } => {
                state.faulted = true;
                let idempotent = self.commands.get(command).is_some_and(|d| d.idempotent);
                warn!(
                    session = %self.id,
                    cmd = command,
                    transmissions,
                    "Device unresponsive, session faulted"
                );
                FiscalError::DeviceUnresponsive {
                    command,
                    attempts: transmissions,
                    may_have_executed: !idempotent && transmissions > 0,
                    last_status: state.last_status.clone(),
                }
            }
            EngineError::Corrupted {
                transmissions,
                error,
            } => {
                state.faulted = true;
                warn!(
                    session = %self.id,
                    cmd = command,
                    "Replies stayed corrupted ({error}), session faulted"
                );
                FiscalError::ChecksumMismatch {
                    attempts: transmissions,
                    last_status: state.last_status.clone(),
                }
            }
            EngineError::Violation { reason, status } => {
                warn!(session = %self.id, cmd = command, "Protocol violation: {reason}");
                if let Some(raw) = status {
                    state.last_status = Some(StatusSnapshot::decode(&raw));
                }
                FiscalError::ProtocolViolation {
                    reason,
                    last_status: state.last_status.clone(),
                }
            }
            EngineError::Transport(e) => FiscalError::TransportUnavailable(e),
            EngineError::Cancelled => FiscalError::Closed,
        }
    }

    /// Release the transport. Idempotent; callable from another thread while
    /// `execute` is waiting, which then fails with [`FiscalError::Closed`].
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.lock().release(&self.id);
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Retries were exhausted; only a new session can talk to the device.
    pub fn is_faulted(&self) -> bool {
        self.lock().state.faulted
    }

    pub fn last_status(&self) -> Option<StatusSnapshot> {
        self.lock().state.last_status.clone()
    }

    pub fn last_sequence_sent(&self) -> Option<u8> {
        self.lock().state.last_sequence_sent
    }

    /// The last request frame that reached the wire.
    pub fn last_frame_sent(&self) -> Option<Frame> {
        self.lock().state.last_frame_sent.clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        inner.release(&self.id);
    }
}
