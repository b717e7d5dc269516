//! Sequence/retry engine.
//!
//! Drives one request frame through the transport until a matching reply
//! arrives or the retry budget is spent:
//!
//! - a reply is awaited for `reply_timeout` (500 ms) after the last byte sent;
//!   the transport is polled in `poll_interval` (60 ms) slices;
//! - each SYN from the device restarts that deadline, and so does every byte
//!   of a reply already in progress (inter-character timeout at low baud);
//! - NAK or silence retransmits the identical frame, same sequence;
//! - a corrupted reply is answered with NAK and the device's retransmission
//!   is awaited;
//! - every NAK, timeout or corrupted reply consumes one retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::frame::{
    frame_body_len, Frame, FrameCodec, MIN_SEQUENCE, NAK, PREAMBLE, SYN, TERMINATOR,
};
use crate::clock::Clock;
use crate::error::{FrameError, TransportError};
use crate::transport::Transport;

/// Upper bound on a buffered reply before it is handed to the decoder as-is.
const MAX_REPLY_BYTES: usize = 512;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Timing and retry budget for one exchange. `max_retries` is caller policy;
/// the protocol itself only asks for "several" attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retransmissions allowed after the first send.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_retries() -> u32 {
    6
}

fn default_reply_timeout_ms() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    60
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            reply_timeout_ms: default_reply_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Sequence following `seq`, wrapping within 0x20..=0xFF.
pub fn next_sequence(seq: u8) -> u8 {
    if seq == u8::MAX || seq < MIN_SEQUENCE {
        MIN_SEQUENCE
    } else {
        seq + 1
    }
}

// ---------------------------------------------------------------------------
// Exchange state / results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    Idle,
    AwaitingReply,
    Retrying,
    Success,
    Failed,
}

/// A completed exchange.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub reply: Frame,
    /// Times the request frame went on the wire.
    pub transmissions: u32,
}

/// Why an exchange failed; the session maps these onto `FiscalError`.
#[derive(Debug)]
pub enum EngineError {
    InvalidPayload(FrameError),
    /// Budget spent on NAKs and silence.
    Unresponsive { transmissions: u32 },
    /// Budget spent with the last reply corrupted.
    Corrupted { transmissions: u32, error: FrameError },
    /// A valid frame that does not answer this request.
    Violation {
        reason: String,
        status: Option<[u8; 8]>,
    },
    Transport(TransportError),
    Cancelled,
}

impl From<TransportError> for EngineError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

enum WaitOutcome {
    Reply(Frame),
    Nak,
    TimedOut,
    Corrupted(FrameError),
}

// ---------------------------------------------------------------------------
// Reply assembler
// ---------------------------------------------------------------------------

/// Something recognised in the inbound byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Inbound {
    Syn,
    Nak,
    Frame(Vec<u8>),
}

/// Splits the inbound stream into control bytes and whole frames. Frame
/// length comes from LEN when it parses, otherwise from the terminator.
#[derive(Debug, Default)]
pub(crate) struct ReplyAssembler {
    buf: Vec<u8>,
    in_frame: bool,
    expected: Option<usize>,
}

impl ReplyAssembler {
    /// A frame has started but is not complete yet.
    pub(crate) fn in_frame(&self) -> bool {
        self.in_frame
    }

    pub(crate) fn push(&mut self, byte: u8) -> Option<Inbound> {
        if !self.in_frame {
            return match byte {
                SYN => Some(Inbound::Syn),
                NAK => Some(Inbound::Nak),
                PREAMBLE => {
                    self.buf.clear();
                    self.buf.push(byte);
                    self.in_frame = true;
                    self.expected = None;
                    None
                }
                other => {
                    trace!("Discarding stray byte 0x{other:02X}");
                    None
                }
            };
        }

        self.buf.push(byte);
        if self.buf.len() == 5 {
            self.expected = frame_body_len(&self.buf[1..5]).ok().map(|body| body + 6);
        }
        let complete = match self.expected {
            Some(total) => self.buf.len() >= total,
            None => byte == TERMINATOR || self.buf.len() >= MAX_REPLY_BYTES,
        };
        if complete || self.buf.len() >= MAX_REPLY_BYTES {
            self.in_frame = false;
            return Some(Inbound::Frame(std::mem::take(&mut self.buf)));
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Protocol state machine for one session.
#[derive(Debug)]
pub struct RetryEngine {
    policy: RetryPolicy,
    codec: FrameCodec,
    clock: Arc<dyn Clock>,
    cancel: Arc<AtomicBool>,
    state: ExchangeState,
}

impl RetryEngine {
    pub fn new(
        policy: RetryPolicy,
        codec: FrameCodec,
        clock: Arc<dyn Clock>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            policy,
            codec,
            clock,
            cancel,
            state: ExchangeState::Idle,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Send `request` and wait for its reply.
    ///
    /// `previous_reply` is the reply of the last completed exchange; a verbatim
    /// re-delivery of it is discarded instead of being treated as a violation.
    pub fn exchange(
        &mut self,
        transport: &mut dyn Transport,
        request: &Frame,
        previous_reply: Option<&Frame>,
    ) -> Result<Exchange, EngineError> {
        self.state = ExchangeState::Idle;
        let wire = self
            .codec
            .encode(request)
            .map_err(EngineError::InvalidPayload)?;

        let mut transmissions = 0u32;
        let mut retries = 0u32;
        let mut resend = true;

        loop {
            if resend {
                if transmissions > 0 {
                    debug!(
                        seq = request.sequence,
                        cmd = request.command,
                        attempt = transmissions + 1,
                        "Retransmitting frame"
                    );
                }
                transport.send(&wire)?;
                transmissions += 1;
            }
            self.state = ExchangeState::AwaitingReply;

            let outcome = match self.await_reply(transport, request, previous_reply) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.state = ExchangeState::Failed;
                    return Err(e);
                }
            };

            let failure = match outcome {
                WaitOutcome::Reply(reply) => {
                    self.state = ExchangeState::Success;
                    return Ok(Exchange {
                        reply,
                        transmissions,
                    });
                }
                other => other,
            };

            if retries >= self.policy.max_retries {
                self.state = ExchangeState::Failed;
                warn!(
                    seq = request.sequence,
                    cmd = request.command,
                    transmissions,
                    "Retry budget exhausted"
                );
                return Err(match failure {
                    WaitOutcome::Corrupted(error) => EngineError::Corrupted {
                        transmissions,
                        error,
                    },
                    _ => EngineError::Unresponsive { transmissions },
                });
            }
            retries += 1;
            self.state = ExchangeState::Retrying;

            resend = match failure {
                WaitOutcome::Corrupted(e) => {
                    debug!(seq = request.sequence, "Corrupted reply ({e}), sending NAK");
                    transport.send(&[NAK])?;
                    false
                }
                WaitOutcome::Nak => {
                    debug!(seq = request.sequence, "Device sent NAK");
                    true
                }
                _ => {
                    debug!(
                        seq = request.sequence,
                        timeout_ms = self.policy.reply_timeout_ms,
                        "No reply"
                    );
                    true
                }
            };
        }
    }

    fn await_reply(
        &self,
        transport: &mut dyn Transport,
        request: &Frame,
        previous_reply: Option<&Frame>,
    ) -> Result<WaitOutcome, EngineError> {
        let timeout = self.policy.reply_timeout();
        let mut assembler = ReplyAssembler::default();
        let mut deadline = self.clock.now() + timeout;

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(EngineError::Cancelled);
            }
            let now = self.clock.now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            let slice = (deadline - now).min(self.policy.poll_interval());

            for byte in transport.receive(slice)? {
                match assembler.push(byte) {
                    None if assembler.in_frame() => {
                        deadline = self.clock.now() + timeout;
                    }
                    None => {}
                    Some(Inbound::Syn) => {
                        trace!(seq = request.sequence, "Device busy (SYN)");
                        deadline = self.clock.now() + timeout;
                    }
                    Some(Inbound::Nak) => return Ok(WaitOutcome::Nak),
                    Some(Inbound::Frame(raw)) => match self.codec.decode(&raw) {
                        Err(e) => return Ok(WaitOutcome::Corrupted(e)),
                        Ok(frame) => match classify(&frame, request, previous_reply) {
                            Classified::Accept => return Ok(WaitOutcome::Reply(frame)),
                            Classified::Stale => {
                                debug!(seq = frame.sequence, "Discarding replayed reply");
                            }
                            Classified::Violation(reason) => {
                                return Err(EngineError::Violation {
                                    reason,
                                    status: frame.status,
                                })
                            }
                        },
                    },
                }
            }
        }
    }
}

enum Classified {
    Accept,
    Stale,
    Violation(String),
}

fn classify(frame: &Frame, request: &Frame, previous_reply: Option<&Frame>) -> Classified {
    if !frame.is_reply() {
        return Classified::Violation("reply carries no status field".into());
    }
    if frame.sequence == request.sequence {
        if frame.command == request.command {
            return Classified::Accept;
        }
        return Classified::Violation(format!(
            "reply command {:#06x} does not match request {:#06x}",
            frame.command, request.command
        ));
    }
    if previous_reply == Some(frame) {
        return Classified::Stale;
    }
    Classified::Violation(format!(
        "reply sequence 0x{:02X} does not match request 0x{:02X}",
        frame.sequence, request.sequence
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::protocol::commands::codes;
    use crate::simulator::{Fault, SimulatedPrinter};

    fn engine_for(printer: &SimulatedPrinter, max_retries: u32) -> RetryEngine {
        RetryEngine::new(
            RetryPolicy::with_max_retries(max_retries),
            FrameCodec::new(),
            printer.clock(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn connected() -> SimulatedPrinter {
        let mut printer = SimulatedPrinter::new();
        printer.connect().unwrap();
        printer
    }

    #[test]
    fn test_next_sequence_wraps() {
        assert_eq!(next_sequence(0x20), 0x21);
        assert_eq!(next_sequence(0xFE), 0xFF);
        assert_eq!(next_sequence(0xFF), 0x20);
        assert_eq!(next_sequence(0x05), 0x20);
    }

    #[test]
    fn test_policy_defaults_and_serde() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.reply_timeout(), Duration::from_millis(500));
        assert_eq!(policy.poll_interval(), Duration::from_millis(60));

        let parsed: RetryPolicy = serde_json::from_str(r#"{"maxRetries": 2}"#).unwrap();
        assert_eq!(parsed.max_retries, 2);
        assert_eq!(parsed.reply_timeout_ms, 500);
    }

    #[test]
    fn test_assembler_control_bytes_and_frames() {
        let codec = FrameCodec::new();
        let wire = codec
            .encode(&Frame::reply(0x20, 0x4A, b"0\t".to_vec(), [0x80; 8]))
            .unwrap();

        let mut asm = ReplyAssembler::default();
        assert_eq!(asm.push(SYN), Some(Inbound::Syn));
        assert_eq!(asm.push(0x7A), None);
        assert_eq!(asm.push(NAK), Some(Inbound::Nak));

        let mut out = Vec::new();
        for &b in &wire {
            if let Some(i) = asm.push(b) {
                out.push(i);
            }
        }
        assert_eq!(out, vec![Inbound::Frame(wire.clone())]);
    }

    #[test]
    fn test_assembler_uses_len_not_terminator() {
        // a status byte equal to the terminator must not cut the frame short
        let mut status = [0x80; 8];
        status[3] = TERMINATOR;
        let wire = FrameCodec::new()
            .encode(&Frame::reply(0x20, 0x4A, Vec::new(), status))
            .unwrap();
        let mut asm = ReplyAssembler::default();
        let frames: Vec<_> = wire.iter().filter_map(|&b| asm.push(b)).collect();
        assert_eq!(frames, vec![Inbound::Frame(wire)]);
    }

    #[test]
    fn test_exchange_success() {
        let mut printer = connected();
        let mut engine = engine_for(&printer, 3);
        let request = Frame::request(0x20, codes::READ_STATUS, Vec::new());
        let exchange = engine.exchange(&mut printer, &request, None).unwrap();
        assert_eq!(exchange.transmissions, 1);
        assert_eq!(exchange.reply.sequence, 0x20);
        assert_eq!(exchange.reply.command, codes::READ_STATUS);
        assert_eq!(engine.state(), ExchangeState::Success);
    }

    #[test]
    fn test_nak_retransmits_identical_bytes() {
        let mut printer = connected();
        let handle = printer.handle();
        handle.push_fault(Fault::Nak);
        let mut engine = engine_for(&printer, 3);
        let request = Frame::request(0x2A, codes::READ_STATUS, Vec::new());

        let exchange = engine.exchange(&mut printer, &request, None).unwrap();
        assert_eq!(exchange.transmissions, 2);
        let sent = handle.received();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
        assert_eq!(sent[0][5], 0x2A);
    }

    #[test]
    fn test_timeout_exhaustion_is_unresponsive() {
        let mut printer = connected();
        let handle = printer.handle();
        for _ in 0..4 {
            handle.push_fault(Fault::NoReply);
        }
        let clock = printer.clock();
        let start = clock.now();
        let mut engine = engine_for(&printer, 3);
        let request = Frame::request(0x20, codes::READ_STATUS, Vec::new());

        let err = engine.exchange(&mut printer, &request, None).unwrap_err();
        assert!(matches!(err, EngineError::Unresponsive { transmissions: 4 }));
        assert_eq!(engine.state(), ExchangeState::Failed);
        assert_eq!(clock.now() - start, Duration::from_millis(2000));
        assert_eq!(handle.execution_count(), 0);
    }

    #[test]
    fn test_syn_extends_deadline() {
        let mut printer = connected();
        let handle = printer.handle();
        handle.push_fault(Fault::Busy {
            syn_count: 40,
            interval_ms: 50,
        });
        let mut engine = engine_for(&printer, 0);
        let request = Frame::request(0x20, codes::DAILY_REPORT, b"0\t".to_vec());

        let exchange = engine.exchange(&mut printer, &request, None).unwrap();
        assert_eq!(exchange.transmissions, 1);
        assert!(printer.clock().elapsed() >= Duration::from_millis(2000));
    }

    #[test]
    fn test_corrupted_reply_is_nakked_then_accepted() {
        let mut printer = connected();
        let handle = printer.handle();
        handle.push_fault(Fault::CorruptReply);
        let mut engine = engine_for(&printer, 3);
        let request = Frame::request(0x20, codes::READ_STATUS, Vec::new());

        let exchange = engine.exchange(&mut printer, &request, None).unwrap();
        // request went out once; the host's NAK pulled the retransmission
        assert_eq!(exchange.transmissions, 1);
        assert_eq!(handle.received().last(), Some(&vec![NAK]));
        assert_eq!(handle.execution_count(), 1);
    }

    #[test]
    fn test_wrong_sequence_is_violation() {
        let mut printer = connected();
        let handle = printer.handle();
        let stray = FrameCodec::new()
            .encode(&Frame::reply(0x55, codes::READ_STATUS, b"0\t".to_vec(), [0x80; 8]))
            .unwrap();
        handle.push_fault(Fault::RawReply(stray));
        let mut engine = engine_for(&printer, 3);
        let request = Frame::request(0x20, codes::READ_STATUS, Vec::new());

        match engine.exchange(&mut printer, &request, None) {
            Err(EngineError::Violation { reason, status }) => {
                assert!(reason.contains("sequence"));
                assert_eq!(status, Some([0x80; 8]));
            }
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn test_replayed_previous_reply_is_discarded() {
        let mut printer = connected();
        let handle = printer.handle();
        let previous = Frame::reply(0x20, codes::READ_STATUS, b"0\t".to_vec(), [0x80; 8]);
        let replay = FrameCodec::new().encode(&previous).unwrap();
        handle.push_fault(Fault::Prefix(replay));
        let mut engine = engine_for(&printer, 0);
        let request = Frame::request(0x21, codes::READ_STATUS, Vec::new());

        let exchange = engine
            .exchange(&mut printer, &request, Some(&previous))
            .unwrap();
        assert_eq!(exchange.reply.sequence, 0x21);
    }

    #[test]
    fn test_cancel_flag_aborts_wait() {
        let mut printer = connected();
        printer.handle().push_fault(Fault::NoReply);
        let cancel = Arc::new(AtomicBool::new(true));
        let mut engine = RetryEngine::new(
            RetryPolicy::default(),
            FrameCodec::new(),
            Arc::new(ManualClock::new()),
            cancel,
        );
        let request = Frame::request(0x20, codes::READ_STATUS, Vec::new());
        assert!(matches!(
            engine.exchange(&mut printer, &request, None),
            Err(EngineError::Cancelled)
        ));
    }

    /// Serial line at a given byte time: one byte per `receive`.
    struct TricklingLink {
        clock: Arc<ManualClock>,
        byte_time: Duration,
        reply_data: Vec<u8>,
        /// Line goes silent after this many reply bytes.
        cut_after: Option<usize>,
        pending: std::collections::VecDeque<u8>,
    }

    impl Transport for TricklingLink {
        fn connect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn disconnect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            let request = FrameCodec::new().decode(data).unwrap();
            let reply = Frame::reply(
                request.sequence,
                request.command,
                self.reply_data.clone(),
                [0x80; 8],
            );
            let wire = FrameCodec::new().encode(&reply).unwrap();
            let keep = self.cut_after.unwrap_or(wire.len()).min(wire.len());
            self.pending.extend(&wire[..keep]);
            Ok(data.len())
        }

        fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
            match self.pending.pop_front() {
                Some(byte) => {
                    self.clock.advance(self.byte_time);
                    Ok(vec![byte])
                }
                None => {
                    self.clock.advance(timeout);
                    Ok(Vec::new())
                }
            }
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn state(&self) -> crate::transport::TransportState {
            crate::transport::TransportState::Connected
        }

        fn description(&self) -> String {
            "Trickling(1200)".to_string()
        }
    }

    #[test]
    fn test_slow_reply_completes_at_1200_baud() {
        use crate::protocol::frame::MAX_DEVICE_DATA;

        let clock = Arc::new(ManualClock::new());
        // 10 bits per byte at 1200 baud
        let mut link = TricklingLink {
            clock: clock.clone(),
            byte_time: Duration::from_micros(8333),
            reply_data: vec![b'7'; MAX_DEVICE_DATA],
            cut_after: None,
            pending: Default::default(),
        };
        let mut engine = RetryEngine::new(
            RetryPolicy::with_max_retries(3),
            FrameCodec::new(),
            clock.clone(),
            Arc::new(AtomicBool::new(false)),
        );
        let request = Frame::request(0x20, codes::DIAGNOSTIC_INFO, Vec::new());

        let exchange = engine.exchange(&mut link, &request, None).unwrap();
        assert_eq!(exchange.transmissions, 1);
        assert_eq!(exchange.reply.data.len(), MAX_DEVICE_DATA);
        // the whole reply took far longer than one reply timeout
        assert!(clock.elapsed() > Duration::from_millis(1500));
    }

    #[test]
    fn test_stalled_partial_reply_times_out() {
        let clock = Arc::new(ManualClock::new());
        let mut link = TricklingLink {
            clock: clock.clone(),
            byte_time: Duration::from_millis(10),
            reply_data: Vec::new(),
            cut_after: Some(12),
            pending: Default::default(),
        };
        let mut engine = RetryEngine::new(
            RetryPolicy::with_max_retries(0),
            FrameCodec::new(),
            clock.clone(),
            Arc::new(AtomicBool::new(false)),
        );
        let request = Frame::request(0x20, codes::READ_STATUS, Vec::new());

        assert!(matches!(
            engine.exchange(&mut link, &request, None),
            Err(EngineError::Unresponsive { transmissions: 1 })
        ));
        // 12 bytes at 10 ms, then one full timeout of silence
        assert_eq!(clock.elapsed(), Duration::from_millis(120 + 500));
    }

    #[test]
    fn test_invalid_payload_never_hits_the_wire() {
        let mut printer = connected();
        let handle = printer.handle();
        let mut engine = engine_for(&printer, 3);
        let request = Frame::request(0x20, codes::FISCAL_TEXT, vec![0x02]);
        assert!(matches!(
            engine.exchange(&mut printer, &request, None),
            Err(EngineError::InvalidPayload(_))
        ));
        assert!(handle.received().is_empty());
    }
}
