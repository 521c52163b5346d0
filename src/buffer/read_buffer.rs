use std::collections::VecDeque;

use bytes::Bytes;

/// A source that [super::FragmentBuffer::transfer_from] can slice from.
pub trait Readable {
    /// Bytes left between the read cursor and the end.
    fn readable_bytes(&self) -> usize;

    /// Splits `len` bytes off the front as views, advancing the read cursor.
    ///
    /// `len` is clamped to [Self::readable_bytes].
    fn split_segments(&mut self, len: usize) -> Vec<Bytes>;
}

impl Readable for Bytes {
    fn readable_bytes(&self) -> usize {
        self.len()
    }

    fn split_segments(&mut self, len: usize) -> Vec<Bytes> {
        vec![self.split_to(len.min(self.len()))]
    }
}

/// Readable composite of segments, as accumulated by socket reads.
#[derive(Debug, Default, Clone)]
pub struct ReadBuffer {
    segments: VecDeque<Bytes>,
    readable: usize,
    /// Bytes still to drop from future pushes.
    discard: usize,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a segment behind the existing ones.
    pub fn push(&mut self, segment: Bytes) {
        let segment = if self.discard == 0 {
            segment
        } else if segment.len() <= self.discard {
            self.discard -= segment.len();
            return;
        } else {
            let rest = segment.slice(self.discard..);
            self.discard = 0;
            rest
        };

        if segment.is_empty() {
            return;
        }
        self.readable += segment.len();
        self.segments.push_back(segment);
    }

    /// Appends all remaining segments of `other`.
    pub fn append(&mut self, mut other: ReadBuffer) {
        for segment in other.segments.drain(..) {
            self.push(segment);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.readable == 0
    }

    /// Reads a big-endian u32 at the cursor without consuming it.
    pub fn peek_u32(&self) -> Option<u32> {
        if self.readable < 4 {
            return None;
        }

        let mut word = [0u8; 4];
        let mut filled = 0;
        for segment in &self.segments {
            let take = (4 - filled).min(segment.len());
            word[filled..filled + take].copy_from_slice(&segment[..take]);
            filled += take;
            if filled == 4 {
                break;
            }
        }

        Some(u32::from_be_bytes(word))
    }

    /// Reads and consumes a big-endian u32.
    pub fn get_u32(&mut self) -> Option<u32> {
        let value = self.peek_u32()?;
        self.skip(4);
        Some(value)
    }

    /// Advances the cursor by up to `len` bytes.
    pub fn skip(&mut self, len: usize) {
        let len = len.min(self.readable);
        let _ = self.split_segments(len);
    }

    /// Drops the next `len` bytes, including ones not received yet.
    pub fn discard(&mut self, len: usize) {
        let available = len.min(self.readable);
        self.skip(available);
        self.discard += len - available;
    }

    /// Bytes [ReadBuffer::discard] still has to drop from future pushes.
    pub fn pending_discard(&self) -> usize {
        self.discard
    }
}

impl Readable for ReadBuffer {
    fn readable_bytes(&self) -> usize {
        self.readable
    }

    fn split_segments(&mut self, len: usize) -> Vec<Bytes> {
        let mut out = Vec::new();
        let mut left = len.min(self.readable);

        while left > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };

            if front.len() <= left {
                left -= front.len();
                self.readable -= front.len();
                if let Some(segment) = self.segments.pop_front() {
                    out.push(segment);
                }
            } else {
                out.push(front.split_to(left));
                self.readable -= left;
                left = 0;
            }
        }

        out
    }
}

impl From<Bytes> for ReadBuffer {
    fn from(bytes: Bytes) -> Self {
        let mut buffer = ReadBuffer::new();
        buffer.push(bytes);
        buffer
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn peek_across_segments() {
        let mut buffer = ReadBuffer::new();
        buffer.push(Bytes::from_static(&[0, 0]));
        buffer.push(Bytes::from_static(&[1]));
        buffer.push(Bytes::from_static(&[2, 9]));

        assert_eq!(buffer.peek_u32(), Some(258));
        assert_eq!(buffer.readable_bytes(), 5);

        assert_eq!(buffer.get_u32(), Some(258));
        assert_eq!(buffer.readable_bytes(), 1);
        assert_eq!(buffer.peek_u32(), None);
    }

    #[test]
    fn split_advances_cursor() {
        let mut buffer = ReadBuffer::from(Bytes::from_static(b"abcdef"));
        buffer.push(Bytes::from_static(b"gh"));

        let head = buffer.split_segments(7);
        assert_eq!(head, vec![Bytes::from_static(b"abcdef"), Bytes::from_static(b"g")]);
        assert_eq!(buffer.readable_bytes(), 1);

        buffer.skip(10);
        assert!(buffer.is_empty());
    }

    #[test]
    fn bytes_split_is_clamped() {
        let mut bytes = Bytes::from_static(b"abc");

        assert_eq!(bytes.split_segments(10), vec![Bytes::from_static(b"abc")]);
        assert!(bytes.is_empty());
        assert_eq!(bytes.split_segments(1), vec![Bytes::new()]);
    }

    #[test]
    fn discard_spans_future_pushes() {
        let mut buffer = ReadBuffer::from(Bytes::from_static(b"abc"));

        buffer.discard(8);
        assert!(buffer.is_empty());
        assert_eq!(buffer.pending_discard(), 5);

        buffer.push(Bytes::from_static(b"defg"));
        assert!(buffer.is_empty());
        assert_eq!(buffer.pending_discard(), 1);

        buffer.push(Bytes::from_static(b"hij"));
        assert_eq!(buffer.pending_discard(), 0);
        assert_eq!(buffer.split_segments(2), vec![Bytes::from_static(b"ij")]);
    }
}
