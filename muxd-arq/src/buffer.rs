//! Chunk-list byte buffer shared by the transport layers.
//!
//! Receive paths concatenate many small reads and the framer re-splits them;
//! [`ChunkBuf`] makes the concatenation O(1) by keeping the chunks apart and
//! only building a contiguous view when a reader actually asks for one.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// A byte buffer assembled from reference-counted chunks.
///
/// The buffer has a logical read cursor (advanced by [`skip`](Self::skip)
/// and the `read_*` operations) and a write cursor implied by the chunk
/// tail. Appending never copies; sub-ranges within a single chunk are
/// zero-copy slices.
#[derive(Debug, Default)]
pub struct ChunkBuf {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ChunkBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an already-written chunk: read cursor at 0, write cursor at
    /// `bytes.len()`.
    pub fn from_full(bytes: Bytes) -> Self {
        let mut buf = Self::new();
        buf.push(bytes);
        buf
    }

    /// Unconsumed bytes between the read and write cursors.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a chunk without copying.
    pub fn push(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.chunks.push_back(bytes);
    }

    /// Moves every unconsumed byte of `other` onto the tail of `self`.
    pub fn concat(&mut self, other: ChunkBuf) {
        for chunk in other.chunks {
            self.push(chunk);
        }
    }

    /// Advances the read cursor by up to `n` bytes, dropping fully-consumed
    /// chunks.
    pub fn skip(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.chunks.front_mut() else {
                return;
            };
            if front.len() > n {
                front.advance(n);
                self.len -= n;
                return;
            }
            n -= front.len();
            self.len -= front.len();
            self.chunks.pop_front();
        }
    }

    /// Copies up to `dst.len()` bytes into `dst` without consuming them.
    pub fn peek_to(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for chunk in &self.chunks {
            if copied == dst.len() {
                break;
            }
            let n = (dst.len() - copied).min(chunk.len());
            dst[copied..copied + n].copy_from_slice(&chunk[..n]);
            copied += n;
        }
        copied
    }

    /// Copies up to `dst.len()` bytes into `dst` and consumes them.
    pub fn read_to(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek_to(dst);
        self.skip(n);
        n
    }

    /// Drains everything into one contiguous `Bytes`.
    ///
    /// Zero-copy when the buffer holds a single chunk.
    pub fn read_all(&mut self) -> Bytes {
        self.len = 0;
        if self.chunks.len() <= 1 {
            return self.chunks.pop_front().unwrap_or_default();
        }
        let mut out = BytesMut::with_capacity(self.chunks.iter().map(Bytes::len).sum());
        for chunk in self.chunks.drain(..) {
            out.extend_from_slice(&chunk);
        }
        out.freeze()
    }

    /// Returns a contiguous borrowed view of all unconsumed bytes, merging
    /// the chunk list in place when it holds more than one chunk.
    pub fn coalesce(&mut self) -> &[u8] {
        if self.chunks.len() > 1 {
            let mut merged = BytesMut::with_capacity(self.len);
            for chunk in self.chunks.drain(..) {
                merged.extend_from_slice(&chunk);
            }
            self.chunks.push_back(merged.freeze());
        }
        self.chunks.front().map(|b| &b[..]).unwrap_or(&[])
    }

    /// Returns `len` bytes starting `offset` past the read cursor.
    ///
    /// Zero-copy when the range lies within a single chunk. The range is
    /// clamped to the unconsumed bytes.
    pub fn sub(&self, offset: usize, len: usize) -> Bytes {
        let offset = offset.min(self.len);
        let len = len.min(self.len - offset);
        if len == 0 {
            return Bytes::new();
        }
        let mut pos = 0;
        for chunk in &self.chunks {
            let end = pos + chunk.len();
            if offset >= pos && offset + len <= end {
                return chunk.slice(offset - pos..offset - pos + len);
            }
            if end > offset {
                break;
            }
            pos = end;
        }
        // the range spans chunks: copy
        let mut out = BytesMut::with_capacity(len);
        let mut pos = 0;
        let mut remaining = len;
        for chunk in &self.chunks {
            let end = pos + chunk.len();
            if end > offset {
                let start = offset.max(pos) - pos;
                let take = (chunk.len() - start).min(remaining);
                out.extend_from_slice(&chunk[start..start + take]);
                remaining -= take;
                if remaining == 0 {
                    break;
                }
            }
            pos = end;
        }
        out.freeze()
    }
}
