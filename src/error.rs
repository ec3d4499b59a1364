use thiserror::Error;

use crate::ops::ArgKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Coarse classification of decode failures.
pub enum ErrorKind {
    UnknownOpcode,
    TruncatedArgument,
    InvalidStackShape,
    BufferExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Everything that can make decoding a single pickle fail. All of these
/// abort the decode; there is no partial result.
///
/// Offsets are relative to the start of the buffer handed to the decoder
/// and point at the opcode byte.
pub enum DecodeError {
    #[error("unknown opcode 0x{opcode:02x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("truncated argument for opcode {name} at offset {offset}")]
    TruncatedArgument { name: &'static str, offset: usize },

    #[error("argument encoding {arg:?} of opcode {name} at offset {offset} is not supported")]
    UnsupportedArgument {
        name: &'static str,
        arg: ArgKind,
        offset: usize,
    },

    #[error("string argument of opcode {name} at offset {offset} is not valid UTF-8")]
    InvalidString { name: &'static str, offset: usize },

    #[error("invalid stack state for opcode {name} (0x{opcode:02x}) at offset {offset}")]
    InvalidStackShape {
        opcode: u8,
        name: &'static str,
        offset: usize,
    },

    #[error("input ended before STOP at offset {offset}")]
    BufferExhausted { offset: usize },

    #[error("opcode {name} at offset {offset} is not handled")]
    UnhandledOpcode { name: &'static str, offset: usize },
}

impl DecodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DecodeError::UnknownOpcode { .. } | DecodeError::UnhandledOpcode { .. } => {
                ErrorKind::UnknownOpcode
            }
            DecodeError::TruncatedArgument { .. }
            | DecodeError::UnsupportedArgument { .. }
            | DecodeError::InvalidString { .. } => ErrorKind::TruncatedArgument,
            DecodeError::InvalidStackShape { .. } => ErrorKind::InvalidStackShape,
            DecodeError::BufferExhausted { .. } => ErrorKind::BufferExhausted,
        }
    }

    pub fn offset(&self) -> usize {
        match self {
            DecodeError::UnknownOpcode { offset, .. }
            | DecodeError::TruncatedArgument { offset, .. }
            | DecodeError::UnsupportedArgument { offset, .. }
            | DecodeError::InvalidString { offset, .. }
            | DecodeError::InvalidStackShape { offset, .. }
            | DecodeError::BufferExhausted { offset }
            | DecodeError::UnhandledOpcode { offset, .. } => *offset,
        }
    }
}

pub type DecodeResult<T> = Result<T, DecodeError>;
