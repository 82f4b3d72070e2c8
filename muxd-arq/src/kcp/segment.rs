//! Wire segments of the ARQ engine.
//!
//! Every datagram carries one or more segments, each with a fixed 24-byte
//! little-endian header:
//!
//! ```text
//! conv:u32  cmd:u8  frg:u8  wnd:u16  ts:u32  sn:u32  una:u32  len:u32
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Header bytes preceding each segment payload.
pub const OVERHEAD: usize = 24;

/// Data push.
pub const CMD_PUSH: u8 = 81;
/// Acknowledgment of a single segment.
pub const CMD_ACK: u8 = 82;
/// Window probe request ("how much can you take?").
pub const CMD_WASK: u8 = 83;
/// Window size announcement.
pub const CMD_WINS: u8 = 84;

/// One segment, both as parsed from the wire and as kept in the send
/// buffer. The retransmission bookkeeping fields are only meaningful on
/// the sender side and never serialized.
#[derive(Debug, Clone, Default)]
pub struct Segment {
    pub conv: u32,
    pub cmd: u8,
    /// Fragment countdown: how many more segments follow in this message.
    pub frg: u8,
    /// Receive window advertised by the sender at transmit time.
    pub wnd: u16,
    pub ts: u32,
    /// Sequence number.
    pub sn: u32,
    /// Every sn before this one has been received by the sender.
    pub una: u32,
    pub data: Bytes,

    // sender-side bookkeeping
    pub resend_ts: u32,
    pub rto: u32,
    pub fast_ack: u32,
    pub xmit: u32,
}

impl Segment {
    pub fn new(conv: u32, cmd: u8) -> Self {
        Self {
            conv,
            cmd,
            ..Default::default()
        }
    }

    pub fn wire_len(&self) -> usize {
        OVERHEAD + self.data.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.wire_len());
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd);
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
    }

    /// Decodes one segment from the front of `src`.
    ///
    /// Returns the segment and the bytes consumed, or `None` when `src`
    /// does not hold a complete segment (short header or a declared payload
    /// length exceeding the remainder; the caller decides whether that is
    /// an error).
    pub fn decode(src: &[u8]) -> Option<(Segment, usize)> {
        if src.len() < OVERHEAD {
            return None;
        }
        let mut rd = src;
        let conv = rd.get_u32_le();
        let cmd = rd.get_u8();
        let frg = rd.get_u8();
        let wnd = rd.get_u16_le();
        let ts = rd.get_u32_le();
        let sn = rd.get_u32_le();
        let una = rd.get_u32_le();
        let len = rd.get_u32_le() as usize;
        if rd.len() < len {
            return None;
        }
        let seg = Segment {
            conv,
            cmd,
            frg,
            wnd,
            ts,
            sn,
            una,
            data: Bytes::copy_from_slice(&rd[..len]),
            ..Default::default()
        };
        Some((seg, OVERHEAD + len))
    }
}
