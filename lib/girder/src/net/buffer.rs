use bytes::{Buf, BytesMut};
use std::io;

/// A bounded FIFO byte queue between the socket and the framing layer. Data
/// is appended at the tail and consumed from the head; the backing storage
/// keeps the live region contiguous.
pub struct Buffer {
    data: BytesMut,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        Buffer {
            data: BytesMut::with_capacity(size),
            size,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Consume `count` bytes from the head.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        self.data.advance(count);
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Append bytes at the tail. Panics if the bound would be exceeded; the
    /// caller checks `free_capacity` first.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        if bytes.len() > self.free_capacity() {
            panic!(
                "Buffer overrun: appending {} bytes to {}/{}",
                bytes.len(),
                self.data.len(),
                self.size
            );
        }

        self.data.extend_from_slice(bytes);
    }

    /// Write the contents of the buffer to the supplied writer, advancing the
    /// head past everything written.
    #[inline]
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.data.len();

        while !self.data.is_empty() {
            let write_count = writer.write(&self.data)?;

            if write_count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.move_head(write_count);
        }

        Ok(orig_len - self.data.len())
    }

    /// Read data from the supplied reader into the buffer tail, up to the
    /// size bound. Reaching the bound with the reader still ready is an
    /// overrun error.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let orig_len = self.data.len();

        while self.data.len() < self.size {
            let start = self.data.len();
            self.data.resize(self.size, 0);

            match reader.read(&mut self.data[start..]) {
                Ok(0) => {
                    self.data.truncate(start);
                    return Ok(start - orig_len);
                }
                Ok(read_count) => self.data.truncate(start + read_count),
                Err(err) => {
                    self.data.truncate(start);
                    return Err(err);
                }
            }
        }

        Err(io::Error::new(io::ErrorKind::Other, "Buffer overrun"))
    }

    /// Mutable slice containing data.
    #[allow(dead_code)]
    #[inline]
    pub(crate) fn data_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        pub fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.max_size - self.data.len());
            self.data.extend_from_slice(&buf[..offset]);
            Ok(offset)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_ingress_reads_until_wouldblock() {
        let mut buffer = Buffer::new(1024);
        let mut channel = MockChannel::new(vec![7u8; 100], 8, 0);

        let err = buffer.ingress(&mut channel).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.read_slice(), &[7u8; 100][..]);
    }

    #[test]
    fn test_ingress_err_overrun() {
        let mut buffer = Buffer::new(64);
        let mut channel = MockChannel::new(vec![7u8; 100], 8, 0);

        let err = buffer.ingress(&mut channel).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert_eq!(buffer.len(), 64);
    }

    #[test]
    fn test_egress_drains_buffer() {
        let mut buffer = Buffer::new(256);
        buffer.extend(&[9u8; 100]);

        let mut channel = MockChannel::new(Vec::new(), 16, 1024);
        let sent = buffer.egress(&mut channel).unwrap();

        assert_eq!(sent, 100);
        assert!(buffer.is_empty());
        assert_eq!(channel.data, vec![9u8; 100]);
    }

    #[test]
    fn test_egress_partial_on_wouldblock() {
        let mut buffer = Buffer::new(256);
        buffer.extend(&[9u8; 100]);

        let mut channel = MockChannel::new(Vec::new(), 16, 48);
        let err = buffer.egress(&mut channel).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buffer.len(), 52);
        assert_eq!(channel.data.len(), 48);
    }

    #[test]
    fn test_move_head_consumes() {
        let mut buffer = Buffer::new(64);
        buffer.extend(&[1, 2, 3, 4, 5]);

        buffer.move_head(2);

        assert_eq!(buffer.read_slice(), &[3, 4, 5]);
        assert_eq!(buffer.free_capacity(), 61);
    }

    #[test]
    #[should_panic(expected = "Buffer overrun")]
    fn test_extend_panics_on_overrun() {
        let mut buffer = Buffer::new(4);
        buffer.extend(&[0u8; 5]);
    }
}
