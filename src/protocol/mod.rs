//! Tris wire protocol
//!
//! Request bodies are plain text: newline separated command lines, each a
//! space separated command name followed by its arguments. Replies are
//! binary frames built from zig-zag varints:
//!
//! ```text
//! [return code: varint]
//! [field count: varint]
//! [field type: varint] x field count
//! [row] ...                  // type = signature[row_index % field count]
//!
//! BOOL   -> 4-byte slot holding varint 0 or 1
//! INT    -> 4-byte slot holding the varint value
//! STRING -> 4-byte slot holding the varint byte length, then the bytes
//! ```
//!
//! A message carrying several commands gets one frame per command, joined by
//! a single `\n` byte.

pub mod reply;
pub mod request;
pub mod varint;

pub use reply::{decode_batch, encode_batch, Field, FieldType, Reply, ReturnCode};
pub use request::{parse_request, CommandLine};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unexpected end of input")]
    Truncated,

    #[error("varint overflows a 64-bit integer")]
    VarintOverflow,

    #[error("value {0} does not fit a 4-byte varint slot")]
    SlotOverflow(i64),

    #[error("unknown field type {0}")]
    UnknownFieldType(i64),

    #[error("row {index} is {found:?} but the signature expects {expected:?}")]
    SignatureMismatch {
        index: usize,
        expected: FieldType,
        found: FieldType,
    },

    #[error("batch does not split into {0} reply frame(s)")]
    BatchMismatch(usize),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("message of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),
}
