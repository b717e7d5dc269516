//! Command descriptors, TAB field encoding and answer decoding.
//!
//! The driver is a generic transport: callers pass a command code and its
//! ordered parameter list. Every parameter is terminated by TAB, including
//! optional ones left empty, so `["1", "", "2"]` goes out as `1\t\t2\t`.

use std::borrow::Cow;
use std::collections::HashMap;

use serde::Serialize;

use super::frame::TAB;
use crate::error::FrameError;

/// Command codes of the common FP-700X-class command set.
pub mod codes {
    pub const PAPER_FEED: u16 = 0x2C;
    pub const PAPER_CUT: u16 = 0x2D;
    pub const OPEN_FISCAL_RECEIPT: u16 = 0x30;
    pub const REGISTER_SALE: u16 = 0x31;
    pub const SUBTOTAL: u16 = 0x33;
    pub const PAYMENT: u16 = 0x35;
    pub const FISCAL_TEXT: u16 = 0x36;
    pub const CLOSE_FISCAL_RECEIPT: u16 = 0x38;
    pub const CANCEL_FISCAL_RECEIPT: u16 = 0x3C;
    pub const SET_DATE_TIME: u16 = 0x3D;
    pub const READ_DATE_TIME: u16 = 0x3E;
    pub const DAILY_REPORT: u16 = 0x45;
    pub const CASH_IN_OUT: u16 = 0x46;
    pub const READ_STATUS: u16 = 0x4A;
    pub const FISCAL_TRANSACTION_STATUS: u16 = 0x4C;
    pub const DIAGNOSTIC_INFO: u16 = 0x5A;
    pub const READ_TAX_NUMBER: u16 = 0x63;
    pub const OPEN_DRAWER: u16 = 0x6A;
    pub const PRINT_DUPLICATE: u16 = 0x6D;
    pub const LAST_DOCUMENT_NUMBER: u16 = 0x71;
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// Static metadata for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommandDescriptor {
    pub code: u16,
    pub name: &'static str,
    pub min_fields: usize,
    pub max_fields: usize,
    /// Safe to re-issue under a new sequence number: it only reads state.
    pub idempotent: bool,
}

impl CommandDescriptor {
    pub const fn new(
        code: u16,
        name: &'static str,
        min_fields: usize,
        max_fields: usize,
        idempotent: bool,
    ) -> Self {
        Self {
            code,
            name,
            min_fields,
            max_fields,
            idempotent,
        }
    }

    pub fn accepts(&self, field_count: usize) -> bool {
        (self.min_fields..=self.max_fields).contains(&field_count)
    }
}

pub static STANDARD_COMMANDS: &[CommandDescriptor] = &[
    CommandDescriptor::new(codes::PAPER_FEED, "paper_feed", 0, 1, false),
    CommandDescriptor::new(codes::PAPER_CUT, "paper_cut", 0, 0, false),
    CommandDescriptor::new(codes::OPEN_FISCAL_RECEIPT, "open_fiscal_receipt", 3, 6, false),
    CommandDescriptor::new(codes::REGISTER_SALE, "register_sale", 4, 8, false),
    CommandDescriptor::new(codes::SUBTOTAL, "subtotal", 0, 3, false),
    CommandDescriptor::new(codes::PAYMENT, "payment", 2, 3, false),
    CommandDescriptor::new(codes::FISCAL_TEXT, "fiscal_text", 1, 1, false),
    CommandDescriptor::new(codes::CLOSE_FISCAL_RECEIPT, "close_fiscal_receipt", 0, 0, false),
    CommandDescriptor::new(codes::CANCEL_FISCAL_RECEIPT, "cancel_fiscal_receipt", 0, 0, false),
    CommandDescriptor::new(codes::SET_DATE_TIME, "set_date_time", 1, 1, false),
    CommandDescriptor::new(codes::READ_DATE_TIME, "read_date_time", 0, 0, true),
    CommandDescriptor::new(codes::DAILY_REPORT, "daily_report", 1, 1, false),
    CommandDescriptor::new(codes::CASH_IN_OUT, "cash_in_out", 2, 2, false),
    CommandDescriptor::new(codes::READ_STATUS, "read_status", 0, 0, true),
    CommandDescriptor::new(
        codes::FISCAL_TRANSACTION_STATUS,
        "fiscal_transaction_status",
        0,
        0,
        true,
    ),
    CommandDescriptor::new(codes::DIAGNOSTIC_INFO, "diagnostic_info", 0, 1, true),
    CommandDescriptor::new(codes::READ_TAX_NUMBER, "read_tax_number", 0, 0, true),
    CommandDescriptor::new(codes::OPEN_DRAWER, "open_drawer", 0, 1, false),
    CommandDescriptor::new(codes::PRINT_DUPLICATE, "print_duplicate", 0, 1, false),
    CommandDescriptor::new(codes::LAST_DOCUMENT_NUMBER, "last_document_number", 0, 0, true),
];

/// Registry of known commands, defined at startup and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct CommandSet {
    commands: HashMap<u16, CommandDescriptor>,
}

impl CommandSet {
    /// The built-in FP-700X-class table.
    pub fn standard() -> Self {
        Self::empty().with_all(STANDARD_COMMANDS.iter().copied())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Add or replace descriptors (model-specific commands).
    pub fn with_all(mut self, descriptors: impl IntoIterator<Item = CommandDescriptor>) -> Self {
        for d in descriptors {
            self.commands.insert(d.code, d);
        }
        self
    }

    pub fn get(&self, code: u16) -> Option<&CommandDescriptor> {
        self.commands.get(&code)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Check the field count for a known command. Unknown codes pass; the
    /// device reports them through the status bits.
    pub fn validate(&self, code: u16, field_count: usize) -> Result<(), FrameError> {
        match self.get(code) {
            Some(d) if !d.accepts(field_count) => Err(FrameError::InvalidPayload(format!(
                "{} ({code:#06x}) takes {}..={} fields, got {field_count}",
                d.name, d.min_fields, d.max_fields
            ))),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Field encoding
// ---------------------------------------------------------------------------

/// Join parameters into a DATA payload, each one terminated by TAB.
pub fn encode_fields<F: AsRef<[u8]>>(fields: &[F]) -> Result<Vec<u8>, FrameError> {
    let mut data = Vec::with_capacity(fields.iter().map(|f| f.as_ref().len() + 1).sum());
    for (i, field) in fields.iter().enumerate() {
        let field = field.as_ref();
        if field.contains(&TAB) {
            return Err(FrameError::InvalidPayload(format!(
                "field {i} contains the TAB separator"
            )));
        }
        data.extend_from_slice(field);
        data.push(TAB);
    }
    Ok(data)
}

// ---------------------------------------------------------------------------
// Answer
// ---------------------------------------------------------------------------

/// DATA of a reply, split on TAB.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Answer {
    raw: Vec<u8>,
    fields: Vec<Vec<u8>>,
}

impl Answer {
    pub fn parse(raw: Vec<u8>) -> Self {
        let mut fields: Vec<Vec<u8>> = raw.split(|&b| b == TAB).map(<[u8]>::to_vec).collect();
        // a trailing TAB terminates the last field rather than starting a new one
        if fields.last().is_some_and(Vec::is_empty) {
            fields.pop();
        }
        Self { raw, fields }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, index: usize) -> Option<&[u8]> {
        self.fields.get(index).map(Vec::as_slice)
    }

    /// Field as text. Non-UTF-8 bytes (cp1251 Cyrillic) are replaced.
    pub fn text(&self, index: usize) -> Option<Cow<'_, str>> {
        self.field(index).map(String::from_utf8_lossy)
    }

    pub fn texts(&self) -> Vec<String> {
        self.fields
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect()
    }

    /// Leading device error code; 0 means success, negatives are errors.
    pub fn error_code(&self) -> Option<i32> {
        self.text(0).and_then(|t| t.trim().parse().ok())
    }

    pub fn is_device_error(&self) -> bool {
        self.error_code().is_some_and(|c| c < 0)
    }
}
