//! Request tokenizer
//!
//! A small state machine driven by a growable input buffer. Each call to
//! [`Tokenizer::tokenize`] consumes as much of the buffer as possible and
//! queues completed argument vectors; partial input is not an error, the
//! caller simply calls again once more bytes arrive.

use bytes::{Buf, Bytes, BytesMut};

use crate::RespError;

/// Maximum size of an inline request line.
pub const PROTO_INLINE_MAX_SIZE: usize = 16 * 1024;
/// Maximum size of a single bulk string.
pub const PROTO_BULK_MAX_SIZE: usize = 128 * 1024 * 1024;
/// Maximum element count of a multi-bulk request.
pub const PROTO_MAX_MULTI_BULKS: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ArrayLen,
    BulkLen,
    BulkData,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenizerOptions {
    /// Lift the multi-bulk count limit. Set when a sharded proxy sits in
    /// front of the server and batches large pipelines into one request.
    pub unlimited_multi_bulk: bool,
}

pub struct Tokenizer {
    state: State,
    multi_bulk_len: usize,
    bulk_len: usize,
    tokens: Vec<Bytes>,
    commands: Vec<Vec<Bytes>>,
    consumed: u64,
    options: TokenizerOptions,
}

impl Tokenizer {
    pub fn new(options: TokenizerOptions) -> Self {
        Self {
            state: State::ArrayLen,
            multi_bulk_len: 0,
            bulk_len: 0,
            tokens: Vec::new(),
            commands: Vec::new(),
            consumed: 0,
            options,
        }
    }

    /// Consume as much of `input` as possible.
    ///
    /// Completed commands are queued and retrieved with [`take_commands`];
    /// a clean return with bytes left in `input` means more data is needed.
    ///
    /// [`take_commands`]: Tokenizer::take_commands
    pub fn tokenize(&mut self, input: &mut BytesMut) -> Result<(), RespError> {
        loop {
            match self.state {
                State::ArrayLen => {
                    let line = match self.read_line(input) {
                        Some(line) => line,
                        None => return Ok(()),
                    };
                    if line.first() == Some(&b'*') {
                        let count = parse_len(&line[1..])
                            .ok_or_else(|| RespError::Protocol("expect integer".into()))?;
                        if !self.options.unlimited_multi_bulk && count > PROTO_MAX_MULTI_BULKS {
                            return Err(RespError::Protocol("too many bulk strings".into()));
                        }
                        if count == 0 {
                            continue;
                        }
                        self.multi_bulk_len = count;
                        self.state = State::BulkLen;
                    } else {
                        // Inline command: split on blanks, no multi-bulk limit
                        if line.len() > PROTO_INLINE_MAX_SIZE {
                            return Err(RespError::Protocol("too big inline request".into()));
                        }
                        let tokens: Vec<Bytes> = line
                            .split(|&b| b == b' ' || b == b'\t')
                            .filter(|t| !t.is_empty())
                            .map(Bytes::copy_from_slice)
                            .collect();
                        if !tokens.is_empty() {
                            self.commands.push(tokens);
                        }
                    }
                }
                State::BulkLen => {
                    let line = match self.read_line(input) {
                        Some(line) => line,
                        None => return Ok(()),
                    };
                    if line.first() != Some(&b'$') {
                        return Err(RespError::Protocol("expect '$'".into()));
                    }
                    let len = parse_len(&line[1..])
                        .ok_or_else(|| RespError::Protocol("expect integer".into()))?;
                    if len > PROTO_BULK_MAX_SIZE {
                        return Err(RespError::Protocol("too big bulk string".into()));
                    }
                    self.bulk_len = len;
                    self.state = State::BulkData;
                }
                State::BulkData => {
                    if input.len() < self.bulk_len + 2 {
                        return Ok(());
                    }
                    let data = input.split_to(self.bulk_len).freeze();
                    input.advance(2);
                    self.consumed += self.bulk_len as u64 + 2;
                    self.tokens.push(data);
                    self.multi_bulk_len -= 1;
                    if self.multi_bulk_len == 0 {
                        self.commands.push(std::mem::take(&mut self.tokens));
                        self.state = State::ArrayLen;
                    } else {
                        self.state = State::BulkLen;
                    }
                }
            }
        }
    }

    /// Drain the queue of completed commands.
    pub fn take_commands(&mut self) -> Vec<Vec<Bytes>> {
        std::mem::take(&mut self.commands)
    }

    /// Bytes consumed since the last call; the server feeds this into its
    /// inbound-bytes counter.
    pub fn take_consumed(&mut self) -> u64 {
        std::mem::take(&mut self.consumed)
    }

    // Split one strict CRLF-terminated line off the front of the buffer,
    // without the terminator. Returns None when no full line is buffered yet.
    fn read_line(&mut self, input: &mut BytesMut) -> Option<Bytes> {
        let pos = input.windows(2).position(|w| w == b"\r\n")?;
        let line = input.split_to(pos).freeze();
        input.advance(2);
        self.consumed += line.len() as u64 + 2;
        Some(line)
    }
}

fn parse_len(digits: &[u8]) -> Option<usize> {
    let s = std::str::from_utf8(digits).ok()?;
    s.parse::<usize>().ok()
}
