//! Streaming NETASCII transcoding.
//!
//! RFC 1350 inherits NETASCII from the Telnet specification: lines end in
//! CR LF, and a carriage return that is not part of a line ending is sent
//! as CR NUL. Producing NETASCII from local data therefore maps
//!
//! - LF  -> CR LF
//! - CR  -> CR NUL
//!
//! and consuming it reverses those pairs:
//!
//! - CR NUL -> CR
//! - CR LF  -> LF
//! - bare NUL bytes are dropped (they only carry meaning after a CR)
//!
//! Both directions work on 512-byte chunks, so a CR can land on the last
//! byte of one datagram with its partner in the next. The decoder carries
//! exactly one pending CR across chunk boundaries to handle that.

use bytes::{BufMut, BytesMut};

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const NUL: u8 = b'\0';

/// Appends the NETASCII encoding of `input` to `out`. Encoding is a
/// per-byte mapping, so no state survives between calls; the output can
/// grow to at most twice the input length.
pub fn encode_into(input: &[u8], out: &mut BytesMut) {
    out.reserve(input.len());
    for &byte in input {
        match byte {
            LF => {
                out.put_u8(CR);
                out.put_u8(LF);
            }
            CR => {
                out.put_u8(CR);
                out.put_u8(NUL);
            }
            _ => out.put_u8(byte),
        }
    }
}

/// Incremental NETASCII decoder for inbound write payloads.
#[derive(Debug, Default)]
pub struct Decoder {
    pending_cr: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `input`, appending local bytes to `out`. A trailing CR is
    /// held back until the next call or [`Decoder::finish`].
    pub fn decode_into(&mut self, input: &[u8], out: &mut BytesMut) {
        out.reserve(input.len());
        for &byte in input {
            if self.pending_cr {
                self.pending_cr = false;
                match byte {
                    NUL => {
                        out.put_u8(CR);
                        continue;
                    }
                    LF => {
                        out.put_u8(LF);
                        continue;
                    }
                    // A CR without its escape partner; emit it and fall
                    // through to process the current byte normally.
                    _ => out.put_u8(CR),
                }
            }
            match byte {
                CR => self.pending_cr = true,
                NUL => {}
                _ => out.put_u8(byte),
            }
        }
    }

    /// Flushes a held CR at end of transfer.
    pub fn finish(&mut self, out: &mut BytesMut) {
        if self.pending_cr {
            self.pending_cr = false;
            out.put_u8(CR);
        }
    }
}
