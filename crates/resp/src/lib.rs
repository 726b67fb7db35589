//! RESP (REdis Serialization Protocol) support library
//!
//! Implements the multi-bulk request tokenizer and reply encoding used by the
//! server front-end.

pub mod reply;
mod tokenizer;

pub use tokenizer::{
    Tokenizer, TokenizerOptions, PROTO_BULK_MAX_SIZE, PROTO_INLINE_MAX_SIZE,
    PROTO_MAX_MULTI_BULKS,
};

/// RESP parsing error
///
/// Any protocol violation is fatal for the connection: the caller is expected
/// to reply with the error and close.
#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("Protocol error: {0}")]
    Protocol(String),
}
