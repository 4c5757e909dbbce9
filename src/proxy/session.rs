//! Bidirectional relay between the phone's TCP connection and the accessory

use serde::Serialize;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::cancel::{CancelToken, CancellableIo};
use super::frame::{self, FrameError, RELAY_BUFFER_SIZE};
use super::version::{self, ProtocolVersion};
use crate::error::Result;

/// Read timeout applied to the phone while waiting for its version response
const VERSION_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    TcpToUsb,
    UsbToTcp,
}

impl Direction {
    fn source(&self) -> &'static str {
        match self {
            Self::TcpToUsb => "TCP",
            Self::UsbToTcp => "USB",
        }
    }

    fn sink(&self) -> &'static str {
        match self {
            Self::TcpToUsb => "USB",
            Self::UsbToTcp => "TCP",
        }
    }

    fn thread_name(&self) -> &'static str {
        match self {
            Self::TcpToUsb => "tcp-to-usb",
            Self::UsbToTcp => "usb-to-tcp",
        }
    }
}

/// Why a relay direction stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionEnd {
    /// The source reached end of stream
    Closed,
    /// Cancelled, either externally or by the other direction ending
    Stopped,
    /// Read, write or framing error
    Failed,
}

/// Outcome of a finished session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub tcp_to_usb: DirectionEnd,
    pub usb_to_tcp: DirectionEnd,
}

impl SessionReport {
    /// Both directions were cancelled, so the stop came from outside
    pub fn stopped_externally(&self) -> bool {
        self.tcp_to_usb == DirectionEnd::Stopped && self.usb_to_tcp == DirectionEnd::Stopped
    }
}

/// Relay counters kept across sessions
#[derive(Debug, Default)]
pub struct ProxyStats {
    tcp_to_usb_bytes: AtomicU64,
    usb_to_tcp_bytes: AtomicU64,
    sessions: AtomicU64,
}

/// Point-in-time copy of [`ProxyStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProxyStatsSnapshot {
    pub tcp_to_usb_bytes: u64,
    pub usb_to_tcp_bytes: u64,
    pub sessions: u64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            tcp_to_usb_bytes: self.tcp_to_usb_bytes.load(Ordering::Relaxed),
            usb_to_tcp_bytes: self.usb_to_tcp_bytes.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
        }
    }

    fn counter(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::TcpToUsb => &self.tcp_to_usb_bytes,
            Direction::UsbToTcp => &self.usb_to_tcp_bytes,
        }
    }
}

/// One relay session between an accepted phone connection and the accessory
///
/// The session owns both endpoints. [`ProxySession::run`] consumes it, joins
/// both relay threads and only then drops the endpoints, so each descriptor is
/// closed exactly once after no thread can touch it.
pub struct ProxySession<U> {
    usb: U,
    tcp: TcpStream,
    token: Arc<CancelToken>,
    stats: Arc<ProxyStats>,
    /// Per-chunk logging at info instead of trace
    verbose: AtomicBool,
}

impl<U> ProxySession<U>
where
    U: AsFd + Send + Sync,
    for<'a> &'a U: Read + Write,
{
    pub fn new(usb: U, tcp: TcpStream, stats: Arc<ProxyStats>) -> Result<Self> {
        Ok(Self {
            usb,
            tcp,
            token: Arc::new(CancelToken::new()?),
            stats,
            verbose: AtomicBool::new(false),
        })
    }

    /// Handle that stops the session from another thread
    ///
    /// Cancelling interrupts blocked reads in both directions; it does not
    /// close the endpoints.
    pub fn stop_handle(&self) -> Arc<CancelToken> {
        Arc::clone(&self.token)
    }

    /// Answer the head unit's version request, then query the phone
    ///
    /// The phone leg is bounded by a read timeout rather than the stop handle.
    pub fn exchange_versions(&self, ours: ProtocolVersion) -> Result<ProtocolVersion> {
        let usb_version =
            version::exchange_with_usb(CancellableIo::new(&self.usb, &self.token), ours)?;

        self.tcp.set_read_timeout(Some(VERSION_EXCHANGE_TIMEOUT))?;
        let phone = version::exchange_with_phone(&self.tcp, usb_version, ours);
        self.tcp.set_read_timeout(None)?;

        Ok(phone?)
    }

    /// Relay in both directions until either side ends or the session is stopped
    pub fn run(self) -> SessionReport {
        self.stats.sessions.fetch_add(1, Ordering::Relaxed);
        info!("Forwarding data between TCP and USB");

        let session = &self;
        let report = thread::scope(|s| {
            let spawn = |direction: Direction| {
                thread::Builder::new()
                    .name(direction.thread_name().to_string())
                    .spawn_scoped(s, move || session.relay(direction))
            };

            let tcp_to_usb = match spawn(Direction::TcpToUsb) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("Failed to spawn relay thread: {}", e);
                    return SessionReport {
                        tcp_to_usb: DirectionEnd::Failed,
                        usb_to_tcp: DirectionEnd::Failed,
                    };
                }
            };
            let usb_to_tcp = match spawn(Direction::UsbToTcp) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("Failed to spawn relay thread: {}", e);
                    session.token.cancel();
                    None
                }
            };

            SessionReport {
                tcp_to_usb: tcp_to_usb.join().unwrap_or(DirectionEnd::Failed),
                usb_to_tcp: usb_to_tcp
                    .map(|h| h.join().unwrap_or(DirectionEnd::Failed))
                    .unwrap_or(DirectionEnd::Failed),
            }
        });

        let stats = self.stats.snapshot();
        info!(
            "Forwarding stopped (TCP->USB {:?}, USB->TCP {:?}, {} / {} bytes total)",
            report.tcp_to_usb, report.usb_to_tcp, stats.tcp_to_usb_bytes, stats.usb_to_tcp_bytes
        );
        report
    }

    fn relay(&self, direction: Direction) -> DirectionEnd {
        let end = match direction {
            Direction::TcpToUsb => self.forward::<TcpStream, U>(direction, &self.tcp, &self.usb),
            Direction::UsbToTcp => self.forward::<U, TcpStream>(direction, &self.usb, &self.tcp),
        };
        // Whichever direction ends first takes the other one down
        self.token.cancel();
        end
    }

    fn forward<R, W>(&self, direction: Direction, source: &R, sink: &W) -> DirectionEnd
    where
        R: AsFd,
        W: AsFd,
        for<'a> &'a R: Read,
        for<'a> &'a W: Write,
    {
        let mut reader = CancellableIo::new(source, &self.token);
        let mut writer = CancellableIo::new(sink, &self.token);
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let counter = self.stats.counter(direction);

        loop {
            let read = match direction {
                Direction::TcpToUsb => frame::read_message(&mut reader, &mut buf),
                Direction::UsbToTcp => reader.read(&mut buf).map_err(FrameError::from),
            };
            let len = match read {
                Ok(0) => {
                    debug!("{} reached end of stream", direction.source());
                    return DirectionEnd::Closed;
                }
                Ok(len) => len,
                Err(e) => return self.read_failed(direction, e),
            };
            self.log_chunk(len, "read from", direction.source());

            if let Err(e) = self.write_chunk(&mut writer, &buf[..len], direction) {
                if e.kind() == io::ErrorKind::ConnectionAborted && self.token.is_cancelled() {
                    debug!("Write to {} stopped", direction.sink());
                    return DirectionEnd::Stopped;
                }
                self.promote_logging();
                warn!("Write to {} failed: {}", direction.sink(), e);
                return DirectionEnd::Failed;
            }
            counter.fetch_add(len as u64, Ordering::Relaxed);
        }
    }

    /// An aborted read only counts as a stop when this session cancelled it
    fn read_failed(&self, direction: Direction, e: FrameError) -> DirectionEnd {
        if e.is_aborted() && self.token.is_cancelled() {
            debug!("Read from {} stopped", direction.source());
            return DirectionEnd::Stopped;
        }
        self.promote_logging();
        warn!("Read from {} failed: {}", direction.source(), e);
        DirectionEnd::Failed
    }

    /// Write a whole chunk, noting short writes
    fn write_chunk<W: Write>(
        &self,
        writer: &mut W,
        mut chunk: &[u8],
        direction: Direction,
    ) -> io::Result<()> {
        while !chunk.is_empty() {
            let written = match writer.write(chunk) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if written < chunk.len() {
                self.promote_logging();
                info!(
                    "Short write to {}: {} of {} bytes",
                    direction.sink(),
                    written,
                    chunk.len()
                );
            }
            self.log_chunk(written, "written to", direction.sink());
            chunk = &chunk[written..];
        }
        Ok(())
    }

    fn promote_logging(&self) {
        self.verbose.store(true, Ordering::Relaxed);
    }

    fn log_chunk(&self, len: usize, action: &str, endpoint: &str) {
        if self.verbose.load(Ordering::Relaxed) {
            info!("{} bytes {} {}", len, action, endpoint);
        } else {
            trace!("{} bytes {} {}", len, action, endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::version::{encode_request, encode_response, STATUS_MATCH};
    use std::net::TcpListener;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    /// Returns (session, phone side of TCP, head unit side of USB)
    fn session_pair() -> (ProxySession<UnixStream>, TcpStream, UnixStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let phone = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (tcp, _) = listener.accept().unwrap();
        let (usb, head_unit) = UnixStream::pair().unwrap();

        let session = ProxySession::new(usb, tcp, Arc::new(ProxyStats::new())).unwrap();
        (session, phone, head_unit)
    }

    #[test]
    fn test_frame_reaches_accessory_unmodified() {
        let (session, mut phone, mut head_unit) = session_pair();
        let stats = session.stats.clone();
        let relay = thread::spawn(move || session.run());

        phone.write_all(&[0x00, 0x03, 0x00, 0x02, b'A', b'B']).unwrap();
        phone.shutdown(std::net::Shutdown::Write).unwrap();

        let mut received = Vec::new();
        head_unit.read_to_end(&mut received).unwrap();
        assert_eq!(received, vec![0x00, 0x03, 0x00, 0x02, b'A', b'B']);

        let report = relay.join().unwrap();
        assert_eq!(report.tcp_to_usb, DirectionEnd::Closed);
        assert_eq!(report.usb_to_tcp, DirectionEnd::Stopped);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.tcp_to_usb_bytes, 6);
        assert_eq!(snapshot.sessions, 1);
    }

    #[test]
    fn test_usb_data_is_forwarded_raw() {
        let (session, mut phone, mut head_unit) = session_pair();
        let relay = thread::spawn(move || session.run());

        // Not a valid frame, which does not matter on this leg
        head_unit.write_all(b"\xffraw bytes").unwrap();

        let mut buf = [0u8; 10];
        phone.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"\xffraw bytes");

        drop(head_unit);
        relay.join().unwrap();
    }

    #[test]
    fn test_usb_close_ends_both_directions() {
        let (session, mut phone, head_unit) = session_pair();
        let relay = thread::spawn(move || session.run());

        drop(head_unit);
        let report = relay.join().unwrap();
        assert_eq!(report.usb_to_tcp, DirectionEnd::Closed);
        assert_eq!(report.tcp_to_usb, DirectionEnd::Stopped);

        // The session closed its TCP end
        let mut buf = [0u8; 1];
        assert_eq!(phone.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_stop_while_blocked() {
        let (session, _phone, _head_unit) = session_pair();
        let stop = session.stop_handle();
        let relay = thread::spawn(move || session.run());

        thread::sleep(Duration::from_millis(100));
        let start = Instant::now();
        stop.cancel();
        stop.cancel();

        let report = relay.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(report.stopped_externally());
    }

    #[test]
    fn test_peer_abort_is_a_failure() {
        let (session, _phone, _head_unit) = session_pair();
        let aborted = || FrameError::from(io::Error::from(io::ErrorKind::ConnectionAborted));

        assert_eq!(
            session.read_failed(Direction::TcpToUsb, aborted()),
            DirectionEnd::Failed
        );
        assert!(session.verbose.load(Ordering::Relaxed));

        session.token.cancel();
        assert_eq!(
            session.read_failed(Direction::TcpToUsb, aborted()),
            DirectionEnd::Stopped
        );
    }

    #[test]
    fn test_oversized_frame_ends_session() {
        let (session, mut phone, mut head_unit) = session_pair();
        let relay = thread::spawn(move || session.run());

        // FIRST fragment of 16381 bytes plus 4 continuation bytes and header
        phone.write_all(&[0x00, 0x01, 0x3f, 0xfd]).unwrap();

        let report = relay.join().unwrap();
        assert_eq!(report.tcp_to_usb, DirectionEnd::Failed);
        assert_eq!(report.usb_to_tcp, DirectionEnd::Stopped);

        let mut received = Vec::new();
        head_unit.read_to_end(&mut received).unwrap();
        assert!(received.is_empty());
    }

    #[test]
    fn test_version_exchange_then_relay() {
        let (session, mut phone, mut head_unit) = session_pair();

        let phone_side = thread::spawn(move || {
            let mut request = [0u8; 10];
            phone.read_exact(&mut request).unwrap();
            phone
                .write_all(&encode_response(ProtocolVersion::new(1, 7), STATUS_MATCH))
                .unwrap();
            (phone, request)
        });

        head_unit
            .write_all(&encode_request(ProtocolVersion::new(1, 6)))
            .unwrap();
        let theirs = session
            .exchange_versions(ProtocolVersion::new(1, 7))
            .unwrap();
        assert_eq!(theirs, ProtocolVersion::new(1, 7));

        let (phone, request) = phone_side.join().unwrap();
        assert_eq!(request.to_vec(), encode_request(ProtocolVersion::new(1, 6)));

        let mut response = [0u8; 12];
        head_unit.read_exact(&mut response).unwrap();
        assert_eq!(
            response.to_vec(),
            encode_response(ProtocolVersion::new(1, 7), STATUS_MATCH)
        );

        drop(phone);
        let report = session.run();
        assert_eq!(report.tcp_to_usb, DirectionEnd::Closed);
    }
}
