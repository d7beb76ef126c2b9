//! Byte-level plumbing shared by both ends of a worker channel: line framing
//! over raw reads, and `poll(2)` over several descriptors at once.

use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Largest single read taken from a descriptor.
const READ_CHUNK: usize = 4096;

/// Splits a byte stream into newline-terminated frames.
///
/// Each `fill` performs exactly one `read`, so it never blocks after `poll`
/// reported the descriptor readable. Partial lines stay buffered until the
/// rest arrives.
pub struct LineReader<R> {
    inner: R,
    buffer: Vec<u8>,
    eof: bool,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            eof: false,
        }
    }

    /// Read once. Returns the number of bytes appended; zero means EOF.
    pub fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(0);
                }
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Pop the next complete frame, without its line terminator.
    pub fn next_frame(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=end).collect();
        let text = String::from_utf8_lossy(&line[..end]);
        Some(text.trim_end_matches('\r').to_string())
    }

    pub fn has_frame(&self) -> bool {
        self.buffer.contains(&b'\n')
    }

    /// True once the peer closed its end and no complete frame remains.
    pub fn is_drained(&self) -> bool {
        self.eof && !self.has_frame()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }
}

/// Unbuffered reader over a borrowed descriptor (used for stdin, whose std
/// handle buffers data where `poll` cannot see it).
pub struct FdReader(RawFd);

impl FdReader {
    pub fn new(fd: RawFd) -> Self {
        Self(fd)
    }

    pub fn stdin() -> Self {
        Self(libc::STDIN_FILENO)
    }

    pub fn fd(&self) -> RawFd {
        self.0
    }
}

impl Read for FdReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// Write one frame and flush it.
pub fn write_frame<W: Write>(writer: &mut W, frame: &str) -> io::Result<()> {
    writer.write_all(frame.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Wait until any descriptor is readable (or hung up), or the timeout
/// elapses. `None` waits indefinitely. Returns one flag per descriptor.
///
/// A signal interrupting the wait yields all-false rather than an error so
/// callers simply re-check their deadline.
pub fn poll_readable(fds: &[RawFd], timeout: Option<Duration>) -> io::Result<Vec<bool>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let timeout_ms = match timeout {
        None => -1,
        Some(duration) => duration.as_millis().min(i32::MAX as u128) as libc::c_int,
    };
    let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(vec![false; fds.len()]);
        }
        return Err(err);
    }
    Ok(pollfds
        .iter()
        .map(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
        .collect())
}

/// Time left until `deadline`, saturating at zero.
pub fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_split_on_newlines_and_keep_partials() {
        let mut reader = LineReader::new(Cursor::new(b"OK 1 2 95\nBATT".to_vec()));
        reader.fill().expect("read");
        assert_eq!(reader.next_frame().as_deref(), Some("OK 1 2 95"));
        assert_eq!(reader.next_frame(), None);
        assert!(!reader.is_drained());

        reader.fill().expect("read");
        assert!(reader.is_drained());
    }

    #[test]
    fn carriage_returns_are_stripped() {
        let mut reader = LineReader::new(Cursor::new(b"pos all\r\nexit\n".to_vec()));
        reader.fill().expect("read");
        assert_eq!(reader.next_frame().as_deref(), Some("pos all"));
        assert_eq!(reader.next_frame().as_deref(), Some("exit"));
    }

    #[test]
    fn poll_sees_pipe_data_and_timeout() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_fd, write_fd] = fds;

        let ready = poll_readable(&[read_fd], Some(Duration::from_millis(10))).expect("poll");
        assert_eq!(ready, vec![false]);

        let byte = b'x';
        assert_eq!(unsafe { libc::write(write_fd, (&byte as *const u8).cast(), 1) }, 1);
        let ready = poll_readable(&[read_fd], Some(Duration::from_millis(100))).expect("poll");
        assert_eq!(ready, vec![true]);

        let mut reader = LineReader::new(FdReader::new(read_fd));
        assert_eq!(reader.fill().expect("read"), 1);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
