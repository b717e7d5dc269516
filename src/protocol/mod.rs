//! FP-700X-class fiscal printer protocol.
//!
//! - `frame`: wire framing, LEN/CMD/BCC digit fields, escaping
//! - `engine`: sequence numbers, reply wait, SYN/NAK handling, retries
//! - `status`: 8-byte status block decoding
//! - `commands`: command table, TAB-separated fields, answers

pub mod commands;
pub mod engine;
pub mod frame;
pub mod status;

pub use commands::{codes, Answer, CommandDescriptor, CommandSet};
pub use engine::{next_sequence, ExchangeState, RetryEngine, RetryPolicy};
pub use frame::{Frame, FrameCodec};
pub use status::{StatusDiagnostic, StatusSnapshot};
