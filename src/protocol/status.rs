//! Status field decoding.
//!
//! Every device-to-host frame carries eight status bytes. Bit 7 of each byte
//! is fixed at 1 and a number of other bits are fixed at 0; violations are
//! reported as soft diagnostics because devices vary.
//!
//! | Byte | Bits                                                                 |
//! |------|----------------------------------------------------------------------|
//! | 0    | 6 cover open, 5 general error, 4# printing mechanism failure, 3 (0), 2 clock not set, 1# invalid command, 0# syntax error |
//! | 1    | 6-2 (0), 1# command not permitted, 0# overflow                       |
//! | 2    | 6 (0), 5 non-fiscal receipt open, 4 EJ nearly full, 3 fiscal receipt open, 2 EJ full, 1 near paper end, 0 end of paper |
//! | 3    | 6-0 (0)                                                              |
//! | 4    | 6 (0), 5 fiscal memory error, 4* FM full, 3 FM nearly full, 2 serial numbers set, 1 tax number set, 0* FM access error |
//! | 5    | 6, 5 (0), 4 VAT rates set, 3 fiscalized, 2 (0), 1 FM formatted, 0 (0) |
//! | 6, 7 | 6-0 (0)                                                              |
//!
//! `#` bits feed the general-error aggregate, `*` bits the fiscal-memory one.

use serde::Serialize;
use std::fmt;

use super::frame::STATUS_LEN;

/// Bits fixed at 0, as (byte, bit).
const ALWAYS_CLEAR: &[(u8, u8)] = &[
    (0, 3),
    (1, 6),
    (1, 5),
    (1, 4),
    (1, 3),
    (1, 2),
    (2, 6),
    (3, 6),
    (3, 5),
    (3, 4),
    (3, 3),
    (3, 2),
    (3, 1),
    (3, 0),
    (4, 6),
    (5, 6),
    (5, 5),
    (5, 2),
    (5, 0),
    (6, 6),
    (6, 5),
    (6, 4),
    (6, 3),
    (6, 2),
    (6, 1),
    (6, 0),
    (7, 6),
    (7, 5),
    (7, 4),
    (7, 3),
    (7, 2),
    (7, 1),
    (7, 0),
];

/// Bits marked `#`, OR-ed into `general_error`.
const GENERAL_ERROR_BITS: &[(u8, u8)] = &[(0, 4), (0, 1), (0, 0), (1, 1), (1, 0)];

/// Bits marked `*`, OR-ed into `fiscal_memory_error`.
const FISCAL_MEMORY_ERROR_BITS: &[(u8, u8)] = &[(4, 4), (4, 0)];

/// Soft diagnostic raised while decoding a status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusDiagnostic {
    /// A fixed bit had the wrong value.
    ReservedBit { byte: u8, bit: u8, expected: bool },
    /// The status field was not eight bytes long; all flags are clear.
    WrongLength { actual: usize },
}

impl fmt::Display for StatusDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReservedBit {
                byte,
                bit,
                expected,
            } => write!(
                f,
                "status bit {byte}.{bit} should always be {}",
                u8::from(*expected)
            ),
            Self::WrongLength { actual } => {
                write!(f, "status field is {actual} bytes, expected {STATUS_LEN}")
            }
        }
    }
}

/// Decoded status field. Immutable; recomputed for every reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub raw: [u8; STATUS_LEN],

    // Byte 0
    pub cover_open: bool,
    /// Aggregate: the device's own summary bit OR any `#` bit in bytes 0-1.
    pub general_error: bool,
    pub printing_failure: bool,
    pub clock_not_set: bool,
    pub invalid_command: bool,
    pub syntax_error: bool,

    // Byte 1
    pub command_not_permitted: bool,
    pub overflow: bool,

    // Byte 2
    pub nonfiscal_receipt_open: bool,
    pub ej_nearly_full: bool,
    pub fiscal_receipt_open: bool,
    pub ej_full: bool,
    pub near_paper_end: bool,
    pub end_of_paper: bool,

    // Byte 4
    /// Aggregate: the device's own summary bit OR any `*` bit in bytes 4-5.
    pub fiscal_memory_error: bool,
    pub fiscal_memory_full: bool,
    pub fiscal_memory_nearly_full: bool,
    pub serial_numbers_set: bool,
    pub tax_number_set: bool,
    pub fiscal_memory_access_error: bool,

    // Byte 5
    pub vat_rates_set: bool,
    pub fiscalized: bool,
    pub fiscal_memory_formatted: bool,

    pub diagnostics: Vec<StatusDiagnostic>,
}

fn bit(raw: &[u8; STATUS_LEN], byte: u8, bit: u8) -> bool {
    raw[usize::from(byte)] & (1 << bit) != 0
}

impl StatusSnapshot {
    /// Decode a status field. Never fails.
    pub fn decode(status: &[u8]) -> Self {
        let Ok(raw) = <[u8; STATUS_LEN]>::try_from(status) else {
            return Self {
                diagnostics: vec![StatusDiagnostic::WrongLength {
                    actual: status.len(),
                }],
                ..Self::default()
            };
        };

        let any = |bits: &[(u8, u8)]| bits.iter().any(|&(b, n)| bit(&raw, b, n));

        let mut diagnostics = Vec::new();
        for byte in 0..STATUS_LEN as u8 {
            if !bit(&raw, byte, 7) {
                diagnostics.push(StatusDiagnostic::ReservedBit {
                    byte,
                    bit: 7,
                    expected: true,
                });
            }
        }
        for &(byte, n) in ALWAYS_CLEAR {
            if bit(&raw, byte, n) {
                diagnostics.push(StatusDiagnostic::ReservedBit {
                    byte,
                    bit: n,
                    expected: false,
                });
            }
        }

        Self {
            raw,
            cover_open: bit(&raw, 0, 6),
            general_error: bit(&raw, 0, 5) || any(GENERAL_ERROR_BITS),
            printing_failure: bit(&raw, 0, 4),
            clock_not_set: bit(&raw, 0, 2),
            invalid_command: bit(&raw, 0, 1),
            syntax_error: bit(&raw, 0, 0),

            command_not_permitted: bit(&raw, 1, 1),
            overflow: bit(&raw, 1, 0),

            nonfiscal_receipt_open: bit(&raw, 2, 5),
            ej_nearly_full: bit(&raw, 2, 4),
            fiscal_receipt_open: bit(&raw, 2, 3),
            ej_full: bit(&raw, 2, 2),
            near_paper_end: bit(&raw, 2, 1),
            end_of_paper: bit(&raw, 2, 0),

            fiscal_memory_error: bit(&raw, 4, 5) || any(FISCAL_MEMORY_ERROR_BITS),
            fiscal_memory_full: bit(&raw, 4, 4),
            fiscal_memory_nearly_full: bit(&raw, 4, 3),
            serial_numbers_set: bit(&raw, 4, 2),
            tax_number_set: bit(&raw, 4, 1),
            fiscal_memory_access_error: bit(&raw, 4, 0),

            vat_rates_set: bit(&raw, 5, 4),
            fiscalized: bit(&raw, 5, 3),
            fiscal_memory_formatted: bit(&raw, 5, 1),

            diagnostics,
        }
    }

    /// True when neither aggregate is set.
    pub fn is_ok(&self) -> bool {
        !self.general_error && !self.fiscal_memory_error
    }

    /// Names of the error/attention conditions currently set, for display.
    pub fn active_conditions(&self) -> Vec<&'static str> {
        [
            (self.cover_open, "cover_open"),
            (self.general_error, "general_error"),
            (self.printing_failure, "printing_failure"),
            (self.clock_not_set, "clock_not_set"),
            (self.invalid_command, "invalid_command"),
            (self.syntax_error, "syntax_error"),
            (self.command_not_permitted, "command_not_permitted"),
            (self.overflow, "overflow"),
            (self.nonfiscal_receipt_open, "nonfiscal_receipt_open"),
            (self.ej_nearly_full, "ej_nearly_full"),
            (self.fiscal_receipt_open, "fiscal_receipt_open"),
            (self.ej_full, "ej_full"),
            (self.near_paper_end, "near_paper_end"),
            (self.end_of_paper, "end_of_paper"),
            (self.fiscal_memory_error, "fiscal_memory_error"),
            (self.fiscal_memory_full, "fiscal_memory_full"),
            (self.fiscal_memory_nearly_full, "fiscal_memory_nearly_full"),
            (self.fiscal_memory_access_error, "fiscal_memory_access_error"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: [u8; 8] = [0x80, 0x80, 0x80, 0x80, 0x86, 0x9A, 0x80, 0x80];

    #[test]
    fn test_idle_printer_is_clean() {
        let s = StatusSnapshot::decode(&IDLE);
        assert!(s.is_ok());
        assert!(s.diagnostics.is_empty());
        assert!(s.serial_numbers_set && s.tax_number_set);
        assert!(s.vat_rates_set && s.fiscalized && s.fiscal_memory_formatted);
        assert!(s.active_conditions().is_empty());
    }

    #[test]
    fn test_byte0_general_error_and_printing_failure() {
        let mut raw = IDLE;
        raw[0] = 0x30;
        let s = StatusSnapshot::decode(&raw);
        assert!(s.general_error);
        assert!(s.printing_failure);
        assert!(!s.cover_open);
        assert!(!s.clock_not_set);
        assert!(!s.invalid_command);
        assert!(!s.syntax_error);
        // bit 0.7 is clear in 0x30
        assert_eq!(
            s.diagnostics,
            vec![StatusDiagnostic::ReservedBit {
                byte: 0,
                bit: 7,
                expected: true
            }]
        );
    }

    #[test]
    fn test_general_error_aggregates_marked_bits() {
        let mut raw = IDLE;
        raw[1] = 0x82; // command not permitted, summary bit not set
        let s = StatusSnapshot::decode(&raw);
        assert!(s.command_not_permitted);
        assert!(s.general_error);

        let mut raw = IDLE;
        raw[0] = 0xC0; // cover open alone is not a general error
        let s = StatusSnapshot::decode(&raw);
        assert!(s.cover_open);
        assert!(!s.general_error);
    }

    #[test]
    fn test_fiscal_memory_aggregate() {
        let mut raw = IDLE;
        raw[4] = 0x81; // access error
        let s = StatusSnapshot::decode(&raw);
        assert!(s.fiscal_memory_access_error);
        assert!(s.fiscal_memory_error);
        assert!(!s.general_error);

        let mut raw = IDLE;
        raw[4] = 0x88; // nearly full is a warning, not an error
        let s = StatusSnapshot::decode(&raw);
        assert!(s.fiscal_memory_nearly_full);
        assert!(!s.fiscal_memory_error);
    }

    #[test]
    fn test_paper_and_receipt_flags() {
        let mut raw = IDLE;
        raw[2] = 0x8B;
        let s = StatusSnapshot::decode(&raw);
        assert!(s.fiscal_receipt_open);
        assert!(s.near_paper_end);
        assert!(s.end_of_paper);
        assert!(!s.ej_full);
        assert_eq!(
            s.active_conditions(),
            vec!["fiscal_receipt_open", "near_paper_end", "end_of_paper"]
        );
    }

    #[test]
    fn test_all_zero_status_reports_violations() {
        let s = StatusSnapshot::decode(&[0; 8]);
        assert!(s.active_conditions().is_empty());
        assert_eq!(s.diagnostics.len(), 8);
        assert!(s
            .diagnostics
            .iter()
            .all(|d| matches!(d, StatusDiagnostic::ReservedBit { bit: 7, expected: true, .. })));
    }

    #[test]
    fn test_always_clear_violation() {
        let mut raw = IDLE;
        raw[3] = 0x81;
        let s = StatusSnapshot::decode(&raw);
        assert_eq!(
            s.diagnostics,
            vec![StatusDiagnostic::ReservedBit {
                byte: 3,
                bit: 0,
                expected: false
            }]
        );
        assert_eq!(
            s.diagnostics[0].to_string(),
            "status bit 3.0 should always be 0"
        );
    }

    #[test]
    fn test_wrong_length_never_fails() {
        let s = StatusSnapshot::decode(&[0xFF, 0xFF]);
        assert!(!s.general_error);
        assert!(!s.fiscal_memory_error);
        assert_eq!(s.diagnostics, vec![StatusDiagnostic::WrongLength { actual: 2 }]);
    }
}
