//! Galil ASCII command channel.
//!
//! Galil DMC controllers accept plain-text commands over TCP (port 23 by default).
//! Each request is one command terminated with a carriage return. The controller
//! answers with optional data followed by a single terminator character:
//!
//! ```text
//! TP\r        ->   0, 1000, -250, 0\r\n:
//! SHA\r       ->   :
//! XYZ\r       ->   ?
//! ```
//!
//! A `:` terminator means the command was accepted, `?` means it was rejected.
//! [`TcpChannel`] normalises the reply so higher layers only see text:
//!
//! - data replies are returned trimmed (`"0, 1000, -250, 0"`)
//! - an accepted command with no data is returned as the acknowledgement [`ACK`] (`":"`)
//! - a rejected command is returned as [`NAK`] (`"?"`)
//!
//! The channel performs exactly one round trip per [`send`](CommandChannel::send)
//! and never retries. Retry and fallback policy belongs to
//! [`SyntaxProbe`](super::SyntaxProbe).
//!
//! # Example
//!
//! ```no_run
//! use hardware::galil::{CommandChannel, TcpChannel};
//!
//! let mut channel = TcpChannel::connect_default_port("192.168.0.100")?;
//! let positions = channel.send("TP")?;
//! println!("Positions: {positions}");
//! # Ok::<(), hardware::galil::CommunicationError>(())
//! ```

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

/// Default TCP port for Galil Ethernet controllers.
pub const DEFAULT_PORT: u16 = 23;

/// Default bound on connect, read and write operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Normalised reply for an accepted command that returned no data.
pub const ACK: &str = ":";

/// Normalised reply for a command the controller rejected.
pub const NAK: &str = "?";

/// Transport-level failures.
///
/// These never carry protocol meaning: a rejected command is a successful
/// round trip that returned [`NAK`].
#[derive(Error, Debug)]
pub enum CommunicationError {
    /// Low-level I/O error (socket read/write failure).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to establish the TCP connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No terminator received within the I/O timeout.
    #[error("Timeout waiting for response")]
    Timeout,

    /// The controller closed the connection mid-reply.
    #[error("Connection closed by controller")]
    Closed,

    /// No link is available (e.g. after a failed reconnect).
    #[error("Controller not connected")]
    NotConnected,
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, CommunicationError>;

/// Synchronous request/response transport to the controller.
///
/// Implementations own the single physical link and serialise all traffic on it.
pub trait CommandChannel: Send {
    /// Send one command and return the normalised reply.
    fn send(&mut self, command: &str) -> ChannelResult<String>;
}

impl<C: CommandChannel + ?Sized> CommandChannel for Box<C> {
    fn send(&mut self, command: &str) -> ChannelResult<String> {
        (**self).send(command)
    }
}

/// Galil command channel over TCP.
pub struct TcpChannel {
    stream: TcpStream,
    timeout: Duration,
    /// A reply timed out and may still be in flight.
    out_of_sync: bool,
}

impl TcpChannel {
    /// Connect to a controller, bounding the connect attempt by [`DEFAULT_TIMEOUT`].
    ///
    /// Every resolved address is tried in turn; the first that connects wins.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> ChannelResult<Self> {
        Self::connect_with_timeout(addr, DEFAULT_TIMEOUT)
    }

    /// Connect to a controller at `ip` on [`DEFAULT_PORT`].
    pub fn connect_default_port(ip: &str) -> ChannelResult<Self> {
        Self::connect((ip, DEFAULT_PORT))
    }

    /// Connect with an explicit bound on connect, read and write.
    pub fn connect_with_timeout<A: ToSocketAddrs>(
        addr: A,
        timeout: Duration,
    ) -> ChannelResult<Self> {
        let addrs: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(|e| CommunicationError::ConnectionFailed(format!("Bad address: {e}")))?
            .collect();

        let mut last_error = None;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_write_timeout(Some(timeout))?;
                    stream.set_nodelay(true)?;
                    debug!("Connected to Galil controller at {addr}");
                    return Ok(Self {
                        stream,
                        timeout,
                        out_of_sync: false,
                    });
                }
                Err(e) => last_error = Some(format!("{addr}: {e}")),
            }
        }

        Err(CommunicationError::ConnectionFailed(
            last_error.unwrap_or_else(|| "No addresses resolved".to_string()),
        ))
    }

    /// Change the I/O timeout for subsequent round trips.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        let _ = self.stream.set_read_timeout(Some(timeout));
        let _ = self.stream.set_write_timeout(Some(timeout));
    }

    /// Current I/O timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Read bytes until a `:` or `?` terminator.
    ///
    /// The timeout bounds the whole reply, not each byte.
    fn read_reply(&mut self) -> ChannelResult<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 1];
        let mut bytes = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CommunicationError::Timeout);
            }
            self.stream.set_read_timeout(Some(remaining))?;

            match self.stream.read(&mut buf) {
                Ok(0) => return Err(CommunicationError::Closed),
                Ok(_) => {
                    bytes.push(buf[0]);
                    if is_terminator(buf[0]) {
                        return Ok(bytes);
                    }
                }
                Err(e) if is_timeout(&e) => return Err(CommunicationError::Timeout),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Swallow the late reply to a command that timed out.
    ///
    /// Waits at most one timeout for its terminator. Whatever arrives is
    /// dropped so the next command reads its own reply.
    fn discard_stale_reply(&mut self) {
        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 64];
        let mut discarded = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || self.stream.set_read_timeout(Some(remaining)).is_err() {
                break;
            }
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    discarded.extend_from_slice(&buf[..n]);
                    if buf[..n].iter().copied().any(is_terminator) {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }

        debug!(
            "Discarded stale reply: {:?}",
            String::from_utf8_lossy(&discarded)
        );
        self.out_of_sync = false;
    }
}

fn is_terminator(byte: u8) -> bool {
    byte == b':' || byte == b'?'
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}

impl CommandChannel for TcpChannel {
    fn send(&mut self, command: &str) -> ChannelResult<String> {
        if self.out_of_sync {
            self.discard_stale_reply();
        }

        let msg = format!("{}\r", command.trim_end());
        debug!("Galil send: {:?}", command.trim_end());
        self.stream.write_all(msg.as_bytes())?;
        self.stream.flush()?;

        let raw = match self.read_reply() {
            Ok(raw) => raw,
            Err(CommunicationError::Timeout) => {
                // The reply may still arrive; it must not answer the next command.
                self.out_of_sync = true;
                return Err(CommunicationError::Timeout);
            }
            Err(e) => return Err(e),
        };
        trace!("Galil raw: {:?}", String::from_utf8_lossy(&raw));

        let reply = normalize_reply(&raw);
        debug!("Galil recv: {:?}", reply);
        Ok(reply)
    }
}

/// Normalise a complete raw reply (data plus terminator) into reply text.
///
/// Bytes are decoded as Latin-1 so firmware strings never fail to decode.
pub fn normalize_reply(raw: &[u8]) -> String {
    let (terminator, body) = match raw.split_last() {
        Some((&t, body)) if t == b':' || t == b'?' => (Some(t), body),
        _ => (None, raw),
    };

    if terminator == Some(b'?') {
        return NAK.to_string();
    }

    let text: String = body.iter().map(|&b| b as char).collect();
    let text = text.trim();
    if text.is_empty() && terminator == Some(b':') {
        ACK.to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_normalize_data_reply() {
        assert_eq!(
            normalize_reply(b" 0, 1000, -250, 0\r\n:"),
            "0, 1000, -250, 0"
        );
    }

    #[test]
    fn test_normalize_acknowledgement() {
        assert_eq!(normalize_reply(b":"), ACK);
        assert_eq!(normalize_reply(b"\r\n:"), ACK);
    }

    #[test]
    fn test_normalize_rejection() {
        assert_eq!(normalize_reply(b"?"), NAK);
    }

    #[test]
    fn test_normalize_latin1() {
        assert_eq!(normalize_reply(b"Rev 1.2\xb5\r\n:"), "Rev 1.2µ");
    }

    #[test]
    fn test_round_trip_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = std::io::BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            for _ in 0..2 {
                let mut line = Vec::new();
                reader.read_until(b'\r', &mut line).unwrap();
                let reply: &[u8] = if line.starts_with(b"TP") {
                    b" 5, 6, 7, 8\r\n:"
                } else {
                    b"?"
                };
                writer.write_all(reply).unwrap();
            }
        });

        let mut channel = TcpChannel::connect(addr).unwrap();
        assert_eq!(channel.send("TP").unwrap(), "5, 6, 7, 8");
        assert_eq!(channel.send("XQ").unwrap(), NAK);
        server.join().unwrap();
    }

    #[test]
    fn test_stalled_device_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(300));
            drop(stream);
        });

        let mut channel = TcpChannel::connect_with_timeout(addr, Duration::from_millis(50)).unwrap();
        let err = channel.send("TP").unwrap_err();
        assert!(matches!(err, CommunicationError::Timeout));
        server.join().unwrap();
    }

    #[test]
    fn test_closed_link_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 8];
            let _ = stream.read(&mut buf);
            stream.write_all(b" 12").unwrap();
        });

        let mut channel = TcpChannel::connect(addr).unwrap();
        let err = channel.send("TP").unwrap_err();
        server.join().unwrap();
        assert!(matches!(
            err,
            CommunicationError::Closed | CommunicationError::Io(_)
        ));
    }

    #[test]
    fn test_late_reply_is_not_credited_to_next_command() {
        use crate::galil::{AttemptOutcome, Axis, Operation, OperationKind, SyntaxProbe};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = std::io::BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            loop {
                let mut line = Vec::new();
                if reader.read_until(b'\r', &mut line).unwrap_or(0) == 0 {
                    break;
                }
                let reply: &[u8] = match line.as_slice() {
                    b"PA A=10\r" => {
                        // Accepted, but only after the client gave up.
                        thread::sleep(Duration::from_millis(150));
                        b":"
                    }
                    b"PA A 10\r" => b":",
                    b"TP\r" => b" 1, 2, 3, 4\r\n:",
                    _ => b"?",
                };
                if writer.write_all(reply).is_err() {
                    break;
                }
            }
        });

        let channel = TcpChannel::connect_with_timeout(addr, Duration::from_millis(100)).unwrap();
        let mut link = SyntaxProbe::new(channel);

        link
            .execute(&Operation::PositionAbsolute {
                axis: Axis::A,
                position: 10,
            })
            .unwrap();

        let outcomes: Vec<AttemptOutcome> = link
            .drain_journal()
            .into_iter()
            .map(|a| a.outcome)
            .collect();
        assert!(matches!(outcomes[0], AttemptOutcome::Failed(_)));
        assert_eq!(outcomes[1], AttemptOutcome::Rejected("?".to_string()));
        assert_eq!(outcomes[2], AttemptOutcome::Accepted(":".to_string()));
        assert_eq!(
            link
                .cache()
                .get(&(OperationKind::PositionAbsolute, Some(Axis::A))),
            Some(2)
        );

        // Replies are back in step with commands.
        assert_eq!(link.send_raw("TP").unwrap(), "1, 2, 3, 4");

        drop(link);
        server.join().unwrap();
    }

    #[test]
    fn test_trickling_reply_is_bounded_by_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 8];
            let _ = stream.read(&mut buf);
            for _ in 0..30 {
                if stream.write_all(b"1").is_err() {
                    break;
                }
                thread::sleep(Duration::from_millis(30));
            }
        });

        let mut channel = TcpChannel::connect_with_timeout(addr, Duration::from_millis(100)).unwrap();
        let started = std::time::Instant::now();
        let err = channel.send("TP").unwrap_err();
        assert!(matches!(err, CommunicationError::Timeout));
        assert!(started.elapsed() < Duration::from_millis(500));

        drop(channel);
        server.join().unwrap();
    }
}
