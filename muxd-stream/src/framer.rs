//! Wire frames of the stream multiplexing protocol.
//!
//! The handler is byte-format agnostic: every place the format is known
//! lives behind the [`Framer`] trait, injected at construction. The trait
//! covers both directions (`format_*` builds outgoing frames,
//! `parse_*`/`*_feed` consume the inbound byte stream) plus stream-id
//! allocation, so a deployment can swap the entire wire dialect without
//! touching the state machine.
//!
//! [`BinaryFramer`] is the default dialect: 4-byte ASCII hellos and
//! type-byte frames with big-endian fields.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, StreamError};

/// One parsed frame of the multiplexing protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Open a stream.
    Syn { stream_id: u32 },
    /// Accept a stream.
    SynAck { stream_id: u32 },
    /// Data for a stream.
    Psh { stream_id: u32, data: Bytes },
    /// No more data from this side.
    Fin { stream_id: u32 },
    /// Abort a stream.
    Rst { stream_id: u32 },
    /// Liveness probe or its answer.
    Keepalive { id: u64, ack: bool },
    /// Final best-effort report before the connection is torn down.
    Error { message: String },
}

/// The pluggable wire dialect.
///
/// The `parse_*_handshake` hooks return the bytes consumed, `0` meaning
/// "incomplete, keep buffering". The `*_feed` hooks parse one frame from
/// the front of the buffer and return it with its encoded length, or
/// `None` when more bytes are needed. `parse_server_handshake` consumes the
/// *server's* hello (and therefore runs on the client); its counterpart
/// consumes the client's hello on the server.
pub trait Framer {
    fn format_client_handshake(&mut self) -> Bytes;
    fn format_server_handshake(&mut self) -> Bytes;
    fn parse_client_handshake(&mut self, buf: &[u8]) -> Result<usize>;
    fn parse_server_handshake(&mut self, buf: &[u8]) -> Result<usize>;

    fn format_syn(&mut self, stream_id: u32) -> Bytes;
    fn format_syn_ack(&mut self, stream_id: u32) -> Bytes;
    fn format_psh(&mut self, stream_id: u32, data: Bytes) -> Bytes;
    fn format_fin(&mut self, stream_id: u32) -> Bytes;
    fn format_rst(&mut self, stream_id: u32) -> Bytes;
    fn format_keepalive(&mut self, id: u64, ack: bool) -> Bytes;
    fn format_error(&mut self, message: &str) -> Bytes;

    fn client_feed(&mut self, buf: &[u8]) -> Result<Option<(Frame, usize)>>;
    fn server_feed(&mut self, buf: &[u8]) -> Result<Option<(Frame, usize)>>;

    /// Allocates a fresh id for a client-opened stream.
    fn next_stream_id(&mut self) -> u32;
}

const HELLO_CLIENT: &[u8; 4] = b"CHLO";
const HELLO_SERVER: &[u8; 4] = b"SHLO";

const FRAME_SYN: u8 = 0x01;
const FRAME_SYN_ACK: u8 = 0x02;
const FRAME_PSH: u8 = 0x03;
const FRAME_FIN: u8 = 0x04;
const FRAME_RST: u8 = 0x05;
const FRAME_KEEPALIVE: u8 = 0x06;
const FRAME_ERROR: u8 = 0x07;

/// Upper bound on a single PSH payload; a larger declared length can only
/// be corruption.
const MAX_PSH_LEN: usize = 1 << 22;

/// The default wire dialect.
#[derive(Debug, Default)]
pub struct BinaryFramer {
    next_stream_id: u32,
}

impl BinaryFramer {
    pub fn new() -> Self {
        Self::default()
    }

    fn id_frame(kind: u8, stream_id: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(kind);
        buf.put_u32(stream_id);
        buf.freeze()
    }

    fn parse_hello(expected: &[u8; 4], buf: &[u8]) -> Result<usize> {
        if buf.len() < expected.len() {
            return Ok(0);
        }
        if &buf[..expected.len()] != expected {
            return Err(StreamError::BadHandshake);
        }
        Ok(expected.len())
    }

    fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
        let Some(&kind) = buf.first() else {
            return Ok(None);
        };
        let body = &buf[1..];
        match kind {
            FRAME_SYN | FRAME_SYN_ACK | FRAME_FIN | FRAME_RST => {
                if body.len() < 4 {
                    return Ok(None);
                }
                let mut rd = body;
                let stream_id = rd.get_u32();
                let frame = match kind {
                    FRAME_SYN => Frame::Syn { stream_id },
                    FRAME_SYN_ACK => Frame::SynAck { stream_id },
                    FRAME_FIN => Frame::Fin { stream_id },
                    _ => Frame::Rst { stream_id },
                };
                Ok(Some((frame, 5)))
            }
            FRAME_PSH => {
                if body.len() < 8 {
                    return Ok(None);
                }
                let mut rd = body;
                let stream_id = rd.get_u32();
                let len = rd.get_u32() as usize;
                if len > MAX_PSH_LEN {
                    return Err(StreamError::MalformedFrame("oversized psh payload"));
                }
                if rd.len() < len {
                    return Ok(None);
                }
                let data = Bytes::copy_from_slice(&rd[..len]);
                Ok(Some((Frame::Psh { stream_id, data }, 9 + len)))
            }
            FRAME_KEEPALIVE => {
                if body.len() < 9 {
                    return Ok(None);
                }
                let mut rd = body;
                let id = rd.get_u64();
                let ack = match rd.get_u8() {
                    0 => false,
                    1 => true,
                    _ => return Err(StreamError::MalformedFrame("bad keepalive flag")),
                };
                Ok(Some((Frame::Keepalive { id, ack }, 10)))
            }
            FRAME_ERROR => {
                if body.len() < 2 {
                    return Ok(None);
                }
                let mut rd = body;
                let len = rd.get_u16() as usize;
                if rd.len() < len {
                    return Ok(None);
                }
                let message = String::from_utf8_lossy(&rd[..len]).into_owned();
                Ok(Some((Frame::Error { message }, 3 + len)))
            }
            _ => Err(StreamError::MalformedFrame("unknown frame type")),
        }
    }
}

impl Framer for BinaryFramer {
    fn format_client_handshake(&mut self) -> Bytes {
        Bytes::from_static(HELLO_CLIENT)
    }

    fn format_server_handshake(&mut self) -> Bytes {
        Bytes::from_static(HELLO_SERVER)
    }

    fn parse_client_handshake(&mut self, buf: &[u8]) -> Result<usize> {
        Self::parse_hello(HELLO_CLIENT, buf)
    }

    fn parse_server_handshake(&mut self, buf: &[u8]) -> Result<usize> {
        Self::parse_hello(HELLO_SERVER, buf)
    }

    fn format_syn(&mut self, stream_id: u32) -> Bytes {
        Self::id_frame(FRAME_SYN, stream_id)
    }

    fn format_syn_ack(&mut self, stream_id: u32) -> Bytes {
        Self::id_frame(FRAME_SYN_ACK, stream_id)
    }

    fn format_psh(&mut self, stream_id: u32, data: Bytes) -> Bytes {
        let mut buf = BytesMut::with_capacity(9 + data.len());
        buf.put_u8(FRAME_PSH);
        buf.put_u32(stream_id);
        buf.put_u32(data.len() as u32);
        buf.put_slice(&data);
        buf.freeze()
    }

    fn format_fin(&mut self, stream_id: u32) -> Bytes {
        Self::id_frame(FRAME_FIN, stream_id)
    }

    fn format_rst(&mut self, stream_id: u32) -> Bytes {
        Self::id_frame(FRAME_RST, stream_id)
    }

    fn format_keepalive(&mut self, id: u64, ack: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(10);
        buf.put_u8(FRAME_KEEPALIVE);
        buf.put_u64(id);
        buf.put_u8(ack as u8);
        buf.freeze()
    }

    fn format_error(&mut self, message: &str) -> Bytes {
        let trimmed = &message.as_bytes()[..message.len().min(u16::MAX as usize)];
        let mut buf = BytesMut::with_capacity(3 + trimmed.len());
        buf.put_u8(FRAME_ERROR);
        buf.put_u16(trimmed.len() as u16);
        buf.put_slice(trimmed);
        buf.freeze()
    }

    fn client_feed(&mut self, buf: &[u8]) -> Result<Option<(Frame, usize)>> {
        Self::parse_frame(buf)
    }

    fn server_feed(&mut self, buf: &[u8]) -> Result<Option<(Frame, usize)>> {
        Self::parse_frame(buf)
    }

    fn next_stream_id(&mut self) -> u32 {
        self.next_stream_id = self.next_stream_id.wrapping_add(1);
        self.next_stream_id
    }
}
