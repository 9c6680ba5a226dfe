// src/io/serial/utils.rs
//
// Shared types for the serial console.
// Baud rate options and line-ending conversion for outbound commands.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Baud Rates
// ============================================================================

/// Baud rates offered in the baud selector, slowest first
pub const BAUD_RATES: [u32; 12] = [
    300, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
];

/// Baud rate selected when nothing has been saved yet
pub const DEFAULT_BAUD_RATE: u32 = 115200;

// ============================================================================
// Line Endings
// ============================================================================

/// Terminator appended to outbound text before transmission
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineEnding {
    #[serde(rename = "None")]
    None,
    #[serde(rename = "CR")]
    Cr,
    #[serde(rename = "LF")]
    Lf,
    #[default]
    #[serde(rename = "CR+LF")]
    CrLf,
}

impl LineEnding {
    pub const ALL: [LineEnding; 4] = [LineEnding::None, LineEnding::Cr, LineEnding::Lf, LineEnding::CrLf];

    /// Raw terminator bytes for this mode
    pub fn terminator(self) -> &'static [u8] {
        match self {
            LineEnding::None => b"",
            LineEnding::Cr => b"\r",
            LineEnding::Lf => b"\n",
            LineEnding::CrLf => b"\r\n",
        }
    }

    /// Encode `text` as UTF-8 followed by the terminator
    pub fn encode(self, text: &str) -> Vec<u8> {
        let terminator = self.terminator();
        let mut bytes = Vec::with_capacity(text.len() + terminator.len());
        bytes.extend_from_slice(text.as_bytes());
        bytes.extend_from_slice(terminator);
        bytes
    }

    /// Label shown in the line-ending selector
    pub fn label(self) -> &'static str {
        match self {
            LineEnding::None => "None",
            LineEnding::Cr => "CR",
            LineEnding::Lf => "LF",
            LineEnding::CrLf => "CR+LF",
        }
    }
}

impl fmt::Display for LineEnding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for LineEnding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(LineEnding::None),
            "cr" => Ok(LineEnding::Cr),
            "lf" => Ok(LineEnding::Lf),
            "crlf" | "cr+lf" => Ok(LineEnding::CrLf),
            other => Err(format!(
                "Unknown line ending '{}' (expected none, cr, lf or crlf)",
                other
            )),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
