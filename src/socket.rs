//! Non-blocking socket I/O shared by the server and the client.

use std::io::{self, ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;

// Internal data type for read_chunk
#[derive(Debug)]
pub(crate) enum ReadStatus {
    /// The socket has no more bytes right now.
    Drained,
    /// The buffer reached its capacity; the socket may hold more.
    Full,
    /// The peer closed its side of the connection.
    Closed,
    /// Reading failed. The connection is unusable.
    Failed(io::Error),
}

/// Fills `buf` with whatever the socket has available, up to `capacity`.
///
/// `buf` is cleared first and holds the bytes read on return, whatever the
/// status.
pub(crate) fn read_chunk<R: Read>(stream: &mut R, buf: &mut Vec<u8>, capacity: usize) -> ReadStatus {
    buf.clear();
    buf.resize(capacity, 0);
    let mut pos = 0;

    let status = loop {
        if pos == capacity {
            break ReadStatus::Full;
        }

        match stream.read(&mut buf[pos..]) {
            Ok(0) => break ReadStatus::Closed,
            Ok(sz) => {
                trace!(len = sz, "Read data from socket");
                pos += sz;
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => break ReadStatus::Drained,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => break ReadStatus::Failed(err),
        }
    };

    buf.truncate(pos);
    status
}

/// Writes all of `buf` to a non-blocking socket.
///
/// Partial writes and `WouldBlock` are retried until the buffer is drained.
/// Fails with `TimedOut` if the socket stays unwritable for longer than
/// `stall_limit`.
pub(crate) fn write_fully<W: Write>(stream: &mut W, buf: &[u8], stall_limit: Duration) -> io::Result<()> {
    let mut send_pos = 0;
    let mut stalled_since: Option<Instant> = None;

    while send_pos < buf.len() {
        match stream.write(&buf[send_pos..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "Write to socket returned 0",
                ))
            }
            Ok(sz) => {
                send_pos += sz;
                stalled_since = None;
                trace!(len = sz, remaining = buf.len() - send_pos, "Wrote to socket");
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                let since = *stalled_since.get_or_insert_with(Instant::now);
                if since.elapsed() > stall_limit {
                    return Err(io::Error::new(
                        ErrorKind::TimedOut,
                        format!("Socket not writable for {stall_limit:?}"),
                    ));
                }
                thread::yield_now();
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    // Reader that hands out scripted results one call at a time
    struct Script(VecDeque<io::Result<Vec<u8>>>);

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.0.push_front(Ok(data[n..].to_vec()));
                    }
                    Ok(n)
                }
                Some(Err(err)) => Err(err),
                None => Err(ErrorKind::WouldBlock.into()),
            }
        }
    }

    #[test]
    fn read_stops_at_would_block() {
        let mut stream = Script(VecDeque::from(vec![Ok(b"hel".to_vec()), Ok(b"lo".to_vec())]));
        let mut buf = Vec::new();
        assert!(matches!(read_chunk(&mut stream, &mut buf, 1024), ReadStatus::Drained));
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn read_stops_at_capacity() {
        let mut stream = Script(VecDeque::from(vec![Ok(b"abcdef".to_vec())]));
        let mut buf = Vec::new();
        assert!(matches!(read_chunk(&mut stream, &mut buf, 4), ReadStatus::Full));
        assert_eq!(buf, b"abcd");
        assert!(matches!(read_chunk(&mut stream, &mut buf, 4), ReadStatus::Drained));
        assert_eq!(buf, b"ef");
    }

    #[test]
    fn read_reports_end_of_stream() {
        let mut stream = Script(VecDeque::from(vec![Ok(b"bye".to_vec()), Ok(Vec::new())]));
        let mut buf = Vec::new();
        assert!(matches!(read_chunk(&mut stream, &mut buf, 1024), ReadStatus::Closed));
        assert_eq!(buf, b"bye");
    }

    #[test]
    fn read_reports_failure() {
        let mut stream = Script(VecDeque::from(vec![Err(ErrorKind::ConnectionReset.into())]));
        let mut buf = Vec::new();
        match read_chunk(&mut stream, &mut buf, 1024) {
            ReadStatus::Failed(err) => assert_eq!(err.kind(), ErrorKind::ConnectionReset),
            other => panic!("Unexpected status {other:?}"),
        }
    }

    // Writer that accepts at most `chunk` bytes per call and blocks every
    // other call
    struct Trickle {
        out: Vec<u8>,
        chunk: usize,
        block_next: bool,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.block_next = !self.block_next;
            if !self.block_next {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.chunk);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_retries_partial_and_blocked_writes() {
        let mut stream = Trickle {
            out: Vec::new(),
            chunk: 3,
            block_next: false,
        };
        write_fully(&mut stream, b"Client [1]: hello", Duration::from_secs(1)).unwrap();
        assert_eq!(stream.out, b"Client [1]: hello");
    }

    struct Stuck;

    impl Write for Stuck {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(ErrorKind::WouldBlock.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_gives_up_on_stalled_socket() {
        let err = write_fully(&mut Stuck, b"hello", Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }
}
