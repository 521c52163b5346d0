//! Zero-copy composite buffers.
//!
//! A [FragmentBuffer] is the payload of one logical message, built from
//! reference-counted [Bytes] views that are never copied when appended,
//! transferred or snapshotted. A [ReadBuffer] is the readable side: a queue of
//! segments with a read cursor, as produced by the socket loops.

mod read_buffer;

use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

pub use read_buffer::{ReadBuffer, Readable};

/// Append-only composite of byte segments.
///
/// All mutation happens under an internal lock, so concurrent producers can
/// append to the same buffer. Readers work on a snapshot of the segment list.
#[derive(Default)]
pub struct FragmentBuffer {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    segments: Vec<Bytes>,
    already_transferred: usize,
}

impl FragmentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(segments: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                segments: Vec::with_capacity(segments),
                already_transferred: 0,
            }),
        }
    }

    /// Builds a buffer referencing the given segments.
    pub fn from_segments<I: IntoIterator<Item = Bytes>>(segments: I) -> Self {
        Self {
            inner: Mutex::new(Inner {
                segments: segments.into_iter().filter(|s| !s.is_empty()).collect(),
                already_transferred: 0,
            }),
        }
    }

    // === Composition ===

    /// Appends a view of `segment`.
    pub fn push(&self, segment: Bytes) -> &Self {
        if !segment.is_empty() {
            self.inner.lock().segments.push(segment);
        }
        self
    }

    /// Appends all segments of `other` by reference.
    pub fn add(&self, other: &FragmentBuffer) -> &Self {
        // Snapshot first, `other` may be `self`.
        let segments = other.segments();
        self.inner.lock().segments.extend(segments);
        self
    }

    /// A new buffer sharing the same segments, safe to iterate while this one
    /// keeps growing.
    pub fn shallow_copy(&self) -> FragmentBuffer {
        FragmentBuffer::from_segments(self.segments())
    }

    /// Moves up to `remaining` bytes out of `source` into this buffer.
    ///
    /// Segment boundaries of the source are kept and nothing is copied. The
    /// source's read cursor advances by the returned amount, which is
    /// `min(remaining, source.readable_bytes())`.
    pub fn transfer_from<R: Readable + ?Sized>(&self, source: &mut R, remaining: usize) -> usize {
        let length = remaining.min(source.readable_bytes());
        if length == 0 {
            return 0;
        }

        let slices = source.split_segments(length);

        let mut inner = self.inner.lock();
        inner.segments.extend(slices.into_iter().filter(|s| !s.is_empty()));
        inner.already_transferred += length;

        length
    }

    /// Hands every segment to `target`, counting them as transferred.
    pub fn transfer_to(&self, target: &mut ReadBuffer) -> usize {
        let segments = self.segments();
        let mut transferred = 0;
        for segment in segments {
            transferred += segment.len();
            target.push(segment);
        }

        self.inner.lock().already_transferred += transferred;
        transferred
    }

    /// Bytes moved through [Self::transfer_from] and [Self::transfer_to]
    /// since creation or the last reset.
    pub fn already_transferred(&self) -> usize {
        self.inner.lock().already_transferred
    }

    pub fn reset_already_transferred(&self) {
        self.inner.lock().already_transferred = 0;
    }

    // === Getters ===

    /// Shallow list of the segment views.
    pub fn segments(&self) -> Vec<Bytes> {
        self.inner.lock().segments.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().segments.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattens into one contiguous view.
    ///
    /// A single-segment buffer is returned without copying.
    pub fn to_bytes(&self) -> Bytes {
        let segments = self.segments();
        match segments.len() {
            0 => Bytes::new(),
            1 => segments[0].clone(),
            _ => {
                let mut flat = BytesMut::with_capacity(segments.iter().map(Bytes::len).sum());
                for segment in &segments {
                    flat.extend_from_slice(segment);
                }
                flat.freeze()
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}

impl Clone for FragmentBuffer {
    fn clone(&self) -> Self {
        self.shallow_copy()
    }
}

impl PartialEq for FragmentBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for FragmentBuffer {}

impl Hash for FragmentBuffer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl Debug for FragmentBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FragmentBuffer")
            .field("segments", &inner.segments.len())
            .field("len", &inner.segments.iter().map(Bytes::len).sum::<usize>())
            .field("already_transferred", &inner.already_transferred)
            .finish()
    }
}

impl From<Bytes> for FragmentBuffer {
    fn from(bytes: Bytes) -> Self {
        FragmentBuffer::from_segments([bytes])
    }
}

impl From<Vec<u8>> for FragmentBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<&'static [u8]> for FragmentBuffer {
    fn from(bytes: &'static [u8]) -> Self {
        Bytes::from_static(bytes).into()
    }
}

#[cfg(test)]
mod test {
    use std::collections::hash_map::DefaultHasher;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn hash_of(buffer: &FragmentBuffer) -> u64 {
        let mut hasher = DefaultHasher::new();
        buffer.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn add_keeps_order_and_shares_storage() {
        let a = FragmentBuffer::from(Bytes::from_static(b"hello "));
        let b = FragmentBuffer::from_segments([Bytes::from_static(b"wor"), Bytes::from_static(b"ld")]);

        a.add(&b);

        assert_eq!(a.to_vec(), b"hello world");
        assert_eq!(a.len(), 11);
        assert_eq!(a.segments().len(), 3);

        // same backing storage, no copy
        assert_eq!(a.segments()[1].as_ptr(), b.segments()[0].as_ptr());
    }

    #[test]
    fn add_self() {
        let a = FragmentBuffer::from(Bytes::from_static(b"ab"));
        a.add(&a);

        assert_eq!(a.to_vec(), b"abab");
    }

    #[test]
    fn shallow_copy_is_independent() {
        let original = FragmentBuffer::from(Bytes::from_static(b"one"));
        let snapshot = original.shallow_copy();

        original.push(Bytes::from_static(b"two"));

        assert_eq!(snapshot.to_vec(), b"one");
        assert_eq!(original.to_vec(), b"onetwo");
    }

    #[test]
    fn transfer_from_is_clamped() {
        let mut source = ReadBuffer::from(Bytes::from_static(b"abcdef"));
        let buffer = FragmentBuffer::new();

        assert_eq!(buffer.transfer_from(&mut source, 4), 4);
        assert_eq!(source.readable_bytes(), 2);

        assert_eq!(buffer.transfer_from(&mut source, 100), 2);
        assert_eq!(source.readable_bytes(), 0);

        assert_eq!(buffer.transfer_from(&mut source, 100), 0);

        assert_eq!(buffer.to_vec(), b"abcdef");
        assert_eq!(buffer.already_transferred(), 6);

        buffer.reset_already_transferred();
        assert_eq!(buffer.already_transferred(), 0);
    }

    #[test]
    fn transfer_from_preserves_segment_boundaries() {
        let mut source = ReadBuffer::new();
        source.push(Bytes::from_static(b"abc"));
        source.push(Bytes::from_static(b"defg"));
        source.push(Bytes::from_static(b"hi"));

        let buffer = FragmentBuffer::new();
        assert_eq!(buffer.transfer_from(&mut source, 5), 5);

        let segments = buffer.segments();
        assert_eq!(segments, vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de")]);
        assert_eq!(source.readable_bytes(), 4);
    }

    #[test]
    fn transfer_from_plain_bytes() {
        let mut source = Bytes::from_static(b"0123456789");
        let buffer = FragmentBuffer::new();

        assert_eq!(buffer.transfer_from(&mut source, 3), 3);
        assert_eq!(source, Bytes::from_static(b"3456789"));
        assert_eq!(buffer.to_vec(), b"012");
    }

    #[test]
    fn mixed_operations_preserve_content() {
        let buffer = FragmentBuffer::new();
        let mut expected = Vec::new();

        let source_bytes = b"alphabetagammadelta";
        let mut consumed = 0;
        let mut source = ReadBuffer::new();
        for chunk in [&b"alpha"[..], b"beta", b"gamma", b"delta"] {
            source.push(Bytes::copy_from_slice(chunk));
        }

        for step in 0..8 {
            if step % 2 == 0 {
                let extra = FragmentBuffer::from(vec![step as u8; step + 1]);
                expected.extend(extra.to_vec());
                buffer.add(&extra);
            } else {
                let before = source.readable_bytes();
                let moved = buffer.transfer_from(&mut source, step * 2);
                assert_eq!(moved, (step * 2).min(before));
                assert_eq!(source.readable_bytes(), before - moved);
                expected.extend_from_slice(&source_bytes[consumed..consumed + moved]);
                consumed += moved;
            }
        }

        assert_eq!(buffer.to_vec(), expected);
        assert_eq!(buffer.len(), expected.len());
    }

    #[test]
    fn transfer_to_counts_bytes() {
        let buffer = FragmentBuffer::from_segments([Bytes::from_static(b"ab"), Bytes::from_static(b"cde")]);
        let mut target = ReadBuffer::new();

        assert_eq!(buffer.transfer_to(&mut target), 5);
        assert_eq!(buffer.already_transferred(), 5);
        assert_eq!(target.readable_bytes(), 5);
    }

    #[test]
    fn equality_and_hash_follow_content() {
        let a = FragmentBuffer::from_segments([Bytes::from_static(b"ab"), Bytes::from_static(b"c")]);
        let b = FragmentBuffer::from(Bytes::from_static(b"abc"));
        let c = FragmentBuffer::from(Bytes::from_static(b"abd"));

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, c);
    }

    #[test]
    fn concurrent_appends() {
        let buffer = Arc::new(FragmentBuffer::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        buffer.push(Bytes::from(vec![i as u8; 3]));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(buffer.len(), 8 * 100 * 3);
        assert_eq!(buffer.segments().len(), 800);
    }
}
