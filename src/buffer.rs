use std::io;
use std::os::fd::RawFd;

use crate::sys::syscall;

/// A growable byte queue backing each connection's input and output.
///
/// Layout over a single vector, with two cursors:
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0      <=      reader_index  <=  writer_index      <=    len
/// ```
///
/// The first [`CHEAP_PREPEND`] bytes are reserved so a length header can be
/// prepended without moving the payload. Consuming everything resets both
/// cursors to the prefix; appending past the end either compacts the already
/// consumed region or grows the vector.
///
/// [`CHEAP_PREPEND`]: Buffer::CHEAP_PREPEND
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

/// Stack-side overflow block used by [`Buffer::read_from_fd`].
const EXTRA_BUF_LEN: usize = 65536;

impl Buffer {
    /// Reserved prefix in front of the readable region.
    pub const CHEAP_PREPEND: usize = 8;
    /// Initial writable capacity.
    pub const INITIAL_SIZE: usize = 1024;

    /// Creates an empty buffer with the default capacity.
    pub fn new() -> Buffer {
        Buffer::with_capacity(Buffer::INITIAL_SIZE)
    }

    /// Creates an empty buffer with `initial` writable bytes.
    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            buf: vec![0; Buffer::CHEAP_PREPEND + initial],
            reader_index: Buffer::CHEAP_PREPEND,
            writer_index: Buffer::CHEAP_PREPEND,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_len(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Number of bytes that can be appended without growing.
    pub fn writable_len(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    /// Number of bytes in front of the readable region.
    pub fn prependable_len(&self) -> usize {
        self.reader_index
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Offset of the first `\r\n` in the readable region, if any.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|window| window == b"\r\n")
    }

    /// Marks `n` readable bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        if n < self.readable_len() {
            self.reader_index += n;
        } else {
            self.consume_all();
        }
    }

    /// Discards the whole readable region, resetting both cursors.
    pub fn consume_all(&mut self) {
        self.reader_index = Buffer::CHEAP_PREPEND;
        self.writer_index = Buffer::CHEAP_PREPEND;
    }

    /// Removes up to `n` readable bytes and returns them.
    pub fn consume_as_bytes(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.readable_len());
        let bytes = self.peek()[..n].to_vec();
        self.consume(n);
        bytes
    }

    /// Removes the whole readable region and returns it.
    pub fn consume_all_as_bytes(&mut self) -> Vec<u8> {
        self.consume_as_bytes(self.readable_len())
    }

    /// Removes up to `n` readable bytes and returns them as a string,
    /// replacing invalid UTF-8.
    pub fn consume_as_string(&mut self, n: usize) -> String {
        let bytes = self.consume_as_bytes(n);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Removes the whole readable region and returns it as a string.
    pub fn consume_all_as_string(&mut self) -> String {
        self.consume_as_string(self.readable_len())
    }

    /// Appends `data` after the readable region, growing if needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Writes `data` directly in front of the readable region.
    ///
    /// Panics if `data` is longer than the prependable region.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_len(), "prepend overflows the reserved prefix");
        self.reader_index -= data.len();
        self.buf[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    /// Makes room for at least `n` writable bytes.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_len() < n {
            self.make_space(n);
        }
    }

    /// Reads from `fd` into the buffer with a single `readv`.
    ///
    /// A 64 KiB stack block catches whatever does not fit in the writable
    /// region, so one call drains most sockets without pre-growing; the
    /// buffer only grows when the overflow block actually spills back in.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_LEN];
        let writable = self.writable_len();
        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.writer_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        let iovcnt: libc::c_int = if writable < extra.len() { 2 } else { 1 };
        let n = syscall!(readv(fd, iov.as_mut_ptr(), iovcnt))? as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable region to `fd`; the caller consumes what was sent.
    pub fn write_to_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_len();
        let n = syscall!(write(
            fd,
            self.peek().as_ptr() as *const libc::c_void,
            readable,
        ))?;
        Ok(n as usize)
    }

    fn make_space(&mut self, n: usize) {
        if self.writable_len() + self.prependable_len() < n + Buffer::CHEAP_PREPEND {
            self.buf.resize(self.writer_index + n, 0);
        } else {
            let readable = self.readable_len();
            self.buf
                .copy_within(self.reader_index..self.writer_index, Buffer::CHEAP_PREPEND);
            self.reader_index = Buffer::CHEAP_PREPEND;
            self.writer_index = Buffer::CHEAP_PREPEND + readable;
        }
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Buffer;

    #[test]
    fn append_consume_round_trip() {
        let mut buffer = Buffer::new();
        buffer.append(b"hello, world");
        assert_eq!(buffer.readable_len(), 12);
        assert_eq!(buffer.consume_as_string(12), "hello, world");
        assert_eq!(buffer.readable_len(), 0);
        assert_eq!(buffer.prependable_len(), Buffer::CHEAP_PREPEND);
    }

    #[test]
    fn partial_consume_keeps_cursor() {
        let mut buffer = Buffer::new();
        buffer.append(b"abcdef");
        buffer.consume(2);
        assert_eq!(buffer.peek(), b"cdef");
        assert_eq!(buffer.prependable_len(), Buffer::CHEAP_PREPEND + 2);
        buffer.consume(100);
        assert_eq!(buffer.readable_len(), 0);
        assert_eq!(buffer.prependable_len(), Buffer::CHEAP_PREPEND);
    }

    #[test]
    fn grows_when_capacity_is_exhausted() {
        let mut buffer = Buffer::with_capacity(16);
        let data = vec![0x5a; 400];
        buffer.append(&data);
        assert_eq!(buffer.readable_len(), 400);
        assert_eq!(buffer.consume_all_as_bytes(), data);
    }

    #[test]
    fn compacts_instead_of_growing() {
        let mut buffer = Buffer::with_capacity(64);
        buffer.append(&[1u8; 48]);
        buffer.consume(40);
        // 8 readable bytes left; the consumed prefix is reclaimed rather than
        // resizing the backing vector.
        let len_before = buffer.writable_len() + buffer.prependable_len() + buffer.readable_len();
        buffer.append(&[2u8; 40]);
        let len_after = buffer.writable_len() + buffer.prependable_len() + buffer.readable_len();
        assert_eq!(len_before, len_after);
        let drained = buffer.consume_all_as_bytes();
        assert_eq!(&drained[..8], &[1u8; 8]);
        assert_eq!(&drained[8..], &[2u8; 40]);
    }

    #[test]
    fn prepend_uses_the_reserved_prefix() {
        let mut buffer = Buffer::new();
        buffer.append(b"payload");
        let header = (7u32).to_be_bytes();
        buffer.prepend(&header);
        assert_eq!(buffer.prependable_len(), Buffer::CHEAP_PREPEND - 4);
        assert_eq!(&buffer.consume_all_as_bytes()[4..], b"payload");
    }

    #[test]
    fn find_crlf_offsets_into_readable() {
        let mut buffer = Buffer::new();
        buffer.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(buffer.find_crlf(), Some(14));
        buffer.consume(16);
        assert_eq!(buffer.find_crlf(), Some(7));
        buffer.consume_all();
        assert_eq!(buffer.find_crlf(), None);
    }
}
