//! Versioned binary encoding of [`Template`].
//!
//! Layout, all integers little-endian:
//!
//! | offset | size | field                          |
//! |--------|------|--------------------------------|
//! | 0      | 4    | magic `IRC1`                   |
//! | 4      | 1    | format version (1)             |
//! | 5      | 2    | template rows                  |
//! | 7      | 2    | template columns               |
//! | 9      | 1    | bits per cell                  |
//! | 10     | 8·W  | code words (`u64`)             |
//! | 10+8W  | 8·W  | mask words (`u64`)             |

use crate::error::{BiometricError, Result};
use crate::types::{Template, CELL_BITS, TEMPLATE_COLS, TEMPLATE_ROWS, TEMPLATE_WORDS};

const MAGIC: &[u8; 4] = b"IRC1";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 10;

/// Encoded size of every template.
pub const ENCODED_LEN: usize = HEADER_LEN + 2 * 8 * TEMPLATE_WORDS;

impl Template {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENCODED_LEN);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&(TEMPLATE_ROWS as u16).to_le_bytes());
        out.extend_from_slice(&(TEMPLATE_COLS as u16).to_le_bytes());
        out.push(CELL_BITS as u8);
        for w in self.code_words().iter().chain(self.mask_words()) {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Template> {
        if bytes.len() < HEADER_LEN {
            return Err(invalid(format!("{} bytes is shorter than the header", bytes.len())));
        }
        if &bytes[0..4] != MAGIC {
            return Err(invalid("bad magic".into()));
        }
        if bytes[4] != VERSION {
            return Err(invalid(format!("unsupported version {}", bytes[4])));
        }
        let rows = u16::from_le_bytes([bytes[5], bytes[6]]) as usize;
        let cols = u16::from_le_bytes([bytes[7], bytes[8]]) as usize;
        let cell_bits = bytes[9] as usize;
        if (rows, cols, cell_bits) != (TEMPLATE_ROWS, TEMPLATE_COLS, CELL_BITS) {
            return Err(invalid(format!(
                "dimensions {rows}x{cols}x{cell_bits}, expected {TEMPLATE_ROWS}x{TEMPLATE_COLS}x{CELL_BITS}"
            )));
        }
        if bytes.len() != ENCODED_LEN {
            return Err(invalid(format!(
                "length {} bytes, expected {ENCODED_LEN}",
                bytes.len()
            )));
        }

        let mut words = bytes[HEADER_LEN..].chunks_exact(8).map(|c| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(c);
            u64::from_le_bytes(buf)
        });
        let code: Vec<u64> = words.by_ref().take(TEMPLATE_WORDS).collect();
        let mask: Vec<u64> = words.collect();
        Template::from_words(code, mask)
    }
}

fn invalid(reason: String) -> BiometricError {
    BiometricError::InvalidTemplate(reason)
}
