//! Refcounted packet buffer with head/tail room. Downward calls (layer N handing a buffer to layer N-1) transfer
//! ownership of one reference; fan-out (multicast/broadcast delivery) clones
//! the handle and bumps the count, the same way `net::ethernet::Packet<T>`
//! is cloned across `arp::get` / `send`.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

struct Inner {
    data: Vec<u8>,
    /// Offset of the first byte of the logical buffer.
    head: usize,
    /// Offset one past the last byte of the logical buffer.
    tail: usize,
}

/// A reference-counted packet buffer. Cloning is a "fan-out adds a
/// reference" operation; dropping the last clone releases the backing
/// storage ("unref").
#[derive(Clone)]
pub struct PktBuf {
    inner: Arc<RwLock<Inner>>,
}

impl PktBuf {
    /// Allocate a buffer with `payload_len` usable bytes, `headroom` bytes
    /// reserved in front for prepended headers, and `tailroom` bytes
    /// reserved after for growth.
    pub fn allocate(payload_len: usize, headroom: usize, tailroom: usize) -> Self {
        let total = headroom + payload_len + tailroom;
        let data = alloc::vec![0u8; total];
        Self {
            inner: Arc::new(RwLock::new(Inner {
                data,
                head: headroom,
                tail: headroom + payload_len,
            })),
        }
    }

    /// Build a buffer around existing bytes (used on ingress, where the NIC
    /// driver already produced a contiguous frame). No head/tail room.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            inner: Arc::new(RwLock::new(Inner {
                data: bytes,
                head: 0,
                tail: len,
            })),
        }
    }

    /// Prepend `n` bytes (grows the logical buffer into headroom). Panics in
    /// debug if there isn't enough headroom; callers size headroom up front
    /// since every header we prepend is a known, fixed size.
    pub fn push(&self, n: usize) {
        let mut inner = self.inner.write();
        debug_assert!(inner.head >= n, "pktbuf: push() exceeds headroom");
        inner.head -= n;
    }

    /// Append `n` bytes (grows the logical buffer into tailroom).
    pub fn put(&self, n: usize) {
        let mut inner = self.inner.write();
        let new_tail = inner.tail + n;
        debug_assert!(new_tail <= inner.data.len(), "pktbuf: put() exceeds tailroom");
        inner.tail = new_tail;
    }

    /// Strip `n` bytes from the front (inverse of `push`); used walking
    /// ingress headers off the front of the buffer.
    pub fn pull(&self, n: usize) {
        let mut inner = self.inner.write();
        debug_assert!(inner.head + n <= inner.tail, "pktbuf: pull() exceeds length");
        inner.head += n;
    }

    /// Shrink the logical length to `new_len` bytes, trimming from the tail.
    /// Used when ingress validation discovers the wire length is shorter
    /// than the physical frame (IPv4 total_length, IPv6 payload_length).
    pub fn trim(&self, new_len: usize) {
        let mut inner = self.inner.write();
        let max = inner.tail - inner.head;
        debug_assert!(new_len <= max, "pktbuf: trim() grows the buffer");
        inner.tail = inner.head + new_len;
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.tail - inner.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn headroom(&self) -> usize {
        self.inner.read().head
    }

    pub fn tailroom(&self) -> usize {
        let inner = self.inner.read();
        inner.data.len() - inner.tail
    }

    /// Number of outstanding handles to this buffer.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Copy the logical bytes out. Packet-buffer contents are small (MTU
    /// sized) so a copy is cheap and avoids exposing the lock guard's
    /// lifetime to callers that want to hold a slice across other calls.
    pub fn to_vec(&self) -> Vec<u8> {
        let inner = self.inner.read();
        inner.data[inner.head..inner.tail].to_vec()
    }

    pub fn copy_from_slice(&self, src: &[u8]) {
        let mut inner = self.inner.write();
        let (head, tail) = (inner.head, inner.tail);
        debug_assert_eq!(tail - head, src.len());
        inner.data[head..tail].copy_from_slice(src);
    }

    pub fn with_slice<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.read();
        f(&inner.data[inner.head..inner.tail])
    }

    pub fn with_slice_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.write();
        let (head, tail) = (inner.head, inner.tail);
        f(&mut inner.data[head..tail])
    }

    /// Explicit "unref" for callers that want the release to read as an
    /// operation in its own right; dropping the handle does the same thing.
    pub fn unref(self) {
        drop(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_put_trim_roundtrip() {
        let buf = PktBuf::allocate(10, 14, 4);
        assert_eq!(buf.len(), 10);
        buf.push(14);
        assert_eq!(buf.len(), 24);
        buf.put(4);
        assert_eq!(buf.len(), 28);
        buf.trim(20);
        assert_eq!(buf.len(), 20);
    }

    #[test]
    fn clone_bumps_refcount() {
        let buf = PktBuf::allocate(4, 0, 0);
        let clone = buf.clone();
        assert_eq!(buf.refcount(), 2);
        drop(clone);
        assert_eq!(buf.refcount(), 1);
    }

    #[test]
    fn pull_strips_header() {
        let buf = PktBuf::allocate(4, 0, 0);
        buf.copy_from_slice(&[1, 2, 3, 4]);
        buf.pull(1);
        assert_eq!(buf.len(), 3);
        buf.with_slice(|s| assert_eq!(s, &[2, 3, 4]));
    }
}
