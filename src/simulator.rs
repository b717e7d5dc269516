//! Simulated FP-700X-class printer.
//!
//! Implements [`Transport`] so a [`crate::Session`] can be driven without
//! hardware. Time is a shared [`ManualClock`]: `receive` jumps the clock to the
//! next scheduled device event (or to the end of the poll slice), so SYN
//! storms and 500 ms timeouts run instantly and deterministically.
//!
//! Faults are queued on the [`SimulatorHandle`] and each one applies to the
//! next host frame the device receives.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::clock::{Clock, ManualClock};
use crate::error::TransportError;
use crate::protocol::commands::codes;
use crate::protocol::frame::{Frame, FrameCodec, NAK, STATUS_LEN, SYN};
use crate::transport::{Transport, TransportState};

/// Status block of an idle, fiscalised device with paper loaded.
pub const IDLE_STATUS: [u8; STATUS_LEN] = [0x80, 0x80, 0x80, 0x80, 0x86, 0x9A, 0x80, 0x80];

const DEFAULT_RESPONSE_DELAY: Duration = Duration::from_millis(10);

/// Answer callback: `(command, data) -> reply DATA`.
pub type Handler = Box<dyn FnMut(u16, &[u8]) -> Vec<u8> + Send>;

/// Misbehaviour injected into the next host frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Reject the frame with NAK; the command is not executed.
    Nak,
    /// Lose the frame on the line; the command is not executed.
    NoReply,
    /// Execute the command but lose the reply.
    LostReply,
    /// Send `syn_count` SYNs `interval_ms` apart before replying.
    Busy { syn_count: u32, interval_ms: u64 },
    /// Execute, then send the reply with one status bit flipped. A host NAK
    /// gets the clean reply.
    CorruptReply,
    /// Send these bytes instead of a reply; the command is not executed.
    RawReply(Vec<u8>),
    /// Send these bytes ahead of the normal reply.
    Prefix(Vec<u8>),
    /// Wedge: nothing is ever sent back and the shared clock stops advancing,
    /// so only cancellation ends the host's wait.
    Stall,
}

#[derive(Debug)]
struct Scheduled {
    at: Instant,
    bytes: Vec<u8>,
}

struct SimState {
    online: bool,
    stalled: bool,
    status: [u8; STATUS_LEN],
    response_delay: Duration,
    faults: VecDeque<Fault>,
    handler: Option<Handler>,
    received: Vec<Vec<u8>>,
    executions: Vec<u16>,
    outbox: Vec<Scheduled>,
    last_sequence: Option<u8>,
    last_reply: Option<Vec<u8>>,
}

impl SimState {
    fn new() -> Self {
        Self {
            online: true,
            stalled: false,
            status: IDLE_STATUS,
            response_delay: DEFAULT_RESPONSE_DELAY,
            faults: VecDeque::new(),
            handler: None,
            received: Vec::new(),
            executions: Vec::new(),
            outbox: Vec::new(),
            last_sequence: None,
            last_reply: None,
        }
    }

    /// Queue bytes, keeping the outbox ordered by due time.
    fn schedule(&mut self, at: Instant, bytes: Vec<u8>) {
        let pos = self.outbox.partition_point(|s| s.at <= at);
        self.outbox.insert(pos, Scheduled { at, bytes });
    }

    fn answer(&mut self, command: u16, data: &[u8]) -> Vec<u8> {
        if let Some(handler) = self.handler.as_mut() {
            return handler(command, data);
        }
        match command {
            codes::DIAGNOSTIC_INFO => {
                b"0\tFP-700X\t1.00BG\t27Nov23 1200\tDT123456\t02123456\t".to_vec()
            }
            _ => b"0\t".to_vec(),
        }
    }
}

/// Shared control surface for a [`SimulatedPrinter`]; clone freely.
#[derive(Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatorHandle {
    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push_fault(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    pub fn set_status(&self, status: [u8; STATUS_LEN]) {
        self.lock().status = status;
    }

    pub fn set_handler(&self, handler: Handler) {
        self.lock().handler = Some(handler);
    }

    pub fn set_response_delay(&self, delay: Duration) {
        self.lock().response_delay = delay;
    }

    /// An offline device (powered off, wrong baud rate) swallows everything.
    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    /// Raw writes from the host, one entry per `send` call.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.lock().received.clone()
    }

    /// Commands actually executed, in order.
    pub fn executions(&self) -> Vec<u16> {
        self.lock().executions.clone()
    }

    pub fn execution_count(&self) -> usize {
        self.lock().executions.len()
    }

    pub fn executions_of(&self, command: u16) -> usize {
        self.lock()
            .executions
            .iter()
            .filter(|&&c| c == command)
            .count()
    }
}

/// In-process device speaking the slave side of the protocol.
pub struct SimulatedPrinter {
    handle: SimulatorHandle,
    clock: Arc<ManualClock>,
    codec: FrameCodec,
    state: TransportState,
}

impl SimulatedPrinter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(ManualClock::new()))
    }

    /// Several printers may share one clock (baud-rate detection).
    pub fn with_clock(clock: Arc<ManualClock>) -> Self {
        Self {
            handle: SimulatorHandle {
                state: Arc::new(Mutex::new(SimState::new())),
            },
            clock,
            codec: FrameCodec::with_escaping(true),
            state: TransportState::Disconnected,
        }
    }

    pub fn handle(&self) -> SimulatorHandle {
        self.handle.clone()
    }

    pub fn clock(&self) -> Arc<ManualClock> {
        Arc::clone(&self.clock)
    }

    fn on_host_frame(&self, state: &mut SimState, raw: &[u8]) {
        let now = self.clock.now();
        let due = now + state.response_delay;

        let request = match self.codec.decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Simulator: undecodable host frame ({e}), sending NAK");
                state.schedule(due, vec![NAK]);
                return;
            }
        };

        let fault = state.faults.pop_front();
        trace!(
            seq = request.sequence,
            cmd = request.command,
            ?fault,
            "Simulator: host frame"
        );
        match fault {
            Some(Fault::Nak) => {
                state.schedule(due, vec![NAK]);
                return;
            }
            Some(Fault::NoReply) => return,
            Some(Fault::RawReply(bytes)) => {
                state.schedule(due, bytes);
                return;
            }
            Some(Fault::Stall) => {
                state.stalled = true;
                return;
            }
            _ => {}
        }

        let Some(reply) = self.reply_for(state, &request) else {
            return;
        };

        match fault {
            Some(Fault::LostReply) => {}
            Some(Fault::Busy {
                syn_count,
                interval_ms,
            }) => {
                let interval = Duration::from_millis(interval_ms);
                let mut at = now;
                for _ in 0..syn_count {
                    at += interval;
                    state.schedule(at, vec![SYN]);
                }
                state.schedule(at + state.response_delay, reply);
            }
            Some(Fault::CorruptReply) => {
                let mut corrupted = reply;
                // last status byte sits just ahead of POSTAMBLE + BCC + TERMINATOR
                let at = corrupted.len() - 7;
                corrupted[at] ^= 0x01;
                state.schedule(due, corrupted);
            }
            Some(Fault::Prefix(bytes)) => {
                state.schedule(due, bytes);
                state.schedule(due, reply);
            }
            _ => state.schedule(due, reply),
        }
    }

    /// Execute `request` unless it repeats the last sequence, in which case
    /// the cached reply is returned untouched.
    fn reply_for(&self, state: &mut SimState, request: &Frame) -> Option<Vec<u8>> {
        if state.last_sequence == Some(request.sequence) {
            if let Some(cached) = state.last_reply.clone() {
                debug!(
                    seq = request.sequence,
                    "Simulator: duplicate sequence, resending cached reply"
                );
                return Some(cached);
            }
        }

        state.executions.push(request.command);
        let data = state.answer(request.command, &request.data);
        let frame = Frame::reply(request.sequence, request.command, data, state.status);
        match self.codec.encode(&frame) {
            Ok(wire) => {
                state.last_sequence = Some(request.sequence);
                state.last_reply = Some(wire.clone());
                Some(wire)
            }
            Err(e) => {
                warn!("Simulator: cannot encode reply: {e}");
                None
            }
        }
    }
}

impl Default for SimulatedPrinter {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimulatedPrinter {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.state = TransportState::Connected;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.state = TransportState::Disconnected;
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if self.state != TransportState::Connected {
            return Err(TransportError::NotConnected);
        }
        let handle = self.handle.clone();
        let mut state = handle.lock();
        state.received.push(data.to_vec());
        if !state.online || state.stalled {
            return Ok(data.len());
        }

        if data == [NAK] {
            if let Some(reply) = state.last_reply.clone() {
                let due = self.clock.now() + state.response_delay;
                state.schedule(due, reply);
            }
        } else {
            self.on_host_frame(&mut state, data);
        }
        Ok(data.len())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.state != TransportState::Connected {
            return Err(TransportError::NotConnected);
        }
        let mut state = self.handle.lock();
        if state.stalled {
            drop(state);
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
            return Ok(Vec::new());
        }

        let limit = self.clock.now() + timeout;
        if state.outbox.first().is_some_and(|s| s.at <= limit) {
            let next = state.outbox.remove(0);
            self.clock.advance_to(next.at);
            return Ok(next.bytes);
        }
        self.clock.advance_to(limit);
        Ok(Vec::new())
    }

    fn is_connected(&self) -> bool {
        self.state == TransportState::Connected
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn description(&self) -> String {
        "Simulator(FP-700X)".to_string()
    }
}
