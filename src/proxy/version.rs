//! Early version exchange
//!
//! The head unit opens the accessory with a `VERSION_REQUEST` control
//! message. It is answered locally before the phone's stream is relayed, and
//! the phone is asked for its version with the numbers the head unit sent.
//!
//! Control messages are single unfragmented frames on channel 0:
//!
//! ```text
//! request:  00 03 | 00 06 | 00 01 | major | minor
//! response: 00 03 | 00 08 | 00 02 | major | minor | status
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;
use tracing::{info, warn};

use super::frame::{read_fully, FrameHeader, FRAME_FIRST, FRAME_LAST, HEADER_LEN};
use crate::error::AppError;

pub const VERSION_REQUEST: u16 = 1;
pub const VERSION_RESPONSE: u16 = 2;

pub const STATUS_MATCH: u16 = 0;
pub const STATUS_MISMATCH: u16 = 0xFFFF;

pub const REQUEST_LEN: usize = 10;
pub const RESPONSE_LEN: usize = 12;

/// Protocol version reported by either peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Version exchange failures; all of them end the session
#[derive(Debug, Error)]
pub enum VersionError {
    #[error("version exchange with {peer} failed: {source}")]
    Io {
        peer: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("version exchange with {peer} failed: expected {expected} bytes, got {got}")]
    Length {
        peer: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("version exchange with {peer} failed: malformed message")]
    Malformed { peer: &'static str },

    #[error("{peer} reported version mismatch")]
    Mismatch { peer: &'static str },
}

impl From<VersionError> for AppError {
    fn from(e: VersionError) -> Self {
        AppError::Proxy(e.to_string())
    }
}

fn control_message(message_id: u16, version: ProtocolVersion, status: Option<u16>) -> Vec<u8> {
    let payload_len = if status.is_some() { 8 } else { 6 };
    let mut bytes = FrameHeader::new(0, FRAME_FIRST | FRAME_LAST, payload_len)
        .encode()
        .to_vec();
    bytes.extend_from_slice(&message_id.to_be_bytes());
    bytes.extend_from_slice(&version.major.to_be_bytes());
    bytes.extend_from_slice(&version.minor.to_be_bytes());
    if let Some(status) = status {
        bytes.extend_from_slice(&status.to_be_bytes());
    }
    bytes
}

pub fn encode_request(version: ProtocolVersion) -> Vec<u8> {
    control_message(VERSION_REQUEST, version, None)
}

pub fn encode_response(version: ProtocolVersion, status: u16) -> Vec<u8> {
    control_message(VERSION_RESPONSE, version, Some(status))
}

fn be16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

/// Check header and message id, returning the version fields
fn parse_control(
    bytes: &[u8],
    peer: &'static str,
    expected_len: usize,
    message_id: u16,
) -> Result<ProtocolVersion, VersionError> {
    if bytes.len() != expected_len {
        return Err(VersionError::Length {
            peer,
            expected: expected_len,
            got: bytes.len(),
        });
    }

    let header = FrameHeader::parse([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let well_formed = header.channel == 0
        && header.flags == FRAME_FIRST | FRAME_LAST
        && header.payload_len as usize == expected_len - HEADER_LEN
        && be16(bytes, 4) == message_id;
    if !well_formed {
        return Err(VersionError::Malformed { peer });
    }

    Ok(ProtocolVersion::new(be16(bytes, 6), be16(bytes, 8)))
}

pub fn parse_request(bytes: &[u8], peer: &'static str) -> Result<ProtocolVersion, VersionError> {
    parse_control(bytes, peer, REQUEST_LEN, VERSION_REQUEST)
}

/// Parse a response into its version and status
pub fn parse_response(
    bytes: &[u8],
    peer: &'static str,
) -> Result<(ProtocolVersion, u16), VersionError> {
    let version = parse_control(bytes, peer, RESPONSE_LEN, VERSION_RESPONSE)?;
    Ok((version, be16(bytes, 10)))
}

/// Answer the head unit's version request with `ours`
///
/// The request arrives as one USB transfer, so a single read is expected to
/// deliver it whole. Returns the version the head unit reported.
pub fn exchange_with_usb<S: Read + Write>(
    mut usb: S,
    ours: ProtocolVersion,
) -> Result<ProtocolVersion, VersionError> {
    const PEER: &str = "USB";
    info!("Attempting early version exchange with USB");

    let mut buf = [0u8; 16];
    let len = loop {
        match usb.read(&mut buf) {
            Ok(len) => break len,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(VersionError::Io { peer: PEER, source }),
        }
    };
    let theirs = parse_request(&buf[..len], PEER)?;
    info!("USB reported version: {}", theirs);

    usb.write_all(&encode_response(ours, STATUS_MATCH))
        .map_err(|source| VersionError::Io { peer: PEER, source })?;

    info!("Version exchange completed with USB");
    Ok(theirs)
}

/// Ask the phone for its version, forwarding the head unit's numbers
///
/// `reported` is what the head unit was told earlier; a phone answering
/// with different numbers is only logged, an explicit mismatch status is
/// an error.
pub fn exchange_with_phone<S: Read + Write>(
    mut tcp: S,
    usb_version: ProtocolVersion,
    reported: ProtocolVersion,
) -> Result<ProtocolVersion, VersionError> {
    const PEER: &str = "TCP";

    tcp.write_all(&encode_request(usb_version))
        .map_err(|source| VersionError::Io { peer: PEER, source })?;

    let mut buf = [0u8; RESPONSE_LEN];
    let len = read_fully(&mut tcp, &mut buf)
        .map_err(|source| VersionError::Io { peer: PEER, source })?;
    let (theirs, status) = parse_response(&buf[..len], PEER)?;
    info!("TCP reported version: {}", theirs);

    if theirs != reported {
        warn!(
            "Version from TCP does not match version earlier reported ({}) to USB",
            reported
        );
    }

    match status {
        STATUS_MATCH => {}
        STATUS_MISMATCH => return Err(VersionError::Mismatch { peer: PEER }),
        other => warn!("TCP reported unknown version response status {:#06x}", other),
    }

    info!("Version exchange completed with TCP");
    Ok(theirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::thread;

    #[test]
    fn test_encode_messages() {
        let v = ProtocolVersion::new(1, 7);
        assert_eq!(
            encode_request(v),
            vec![0x00, 0x03, 0x00, 0x06, 0x00, 0x01, 0x00, 0x01, 0x00, 0x07]
        );
        assert_eq!(
            encode_response(v, STATUS_MATCH),
            vec![0x00, 0x03, 0x00, 0x08, 0x00, 0x02, 0x00, 0x01, 0x00, 0x07, 0x00, 0x00]
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let mut request = encode_request(ProtocolVersion::new(1, 6));
        assert_eq!(
            parse_request(&request, "USB").unwrap(),
            ProtocolVersion::new(1, 6)
        );

        assert!(matches!(
            parse_request(&request[..9], "USB"),
            Err(VersionError::Length { expected: 10, got: 9, .. })
        ));

        // Response id where a request is expected
        request[5] = 0x02;
        assert!(matches!(
            parse_request(&request, "USB"),
            Err(VersionError::Malformed { .. })
        ));

        // Fragmented header
        let mut request = encode_request(ProtocolVersion::new(1, 6));
        request[1] = FRAME_FIRST;
        assert!(matches!(
            parse_request(&request, "USB"),
            Err(VersionError::Malformed { .. })
        ));
    }

    #[test]
    fn test_usb_exchange() {
        let (local, mut head_unit) = UnixStream::pair().unwrap();

        head_unit
            .write_all(&encode_request(ProtocolVersion::new(1, 6)))
            .unwrap();
        let reported = exchange_with_usb(&local, ProtocolVersion::new(1, 7)).unwrap();
        assert_eq!(reported, ProtocolVersion::new(1, 6));

        let mut response = [0u8; RESPONSE_LEN];
        head_unit.read_exact(&mut response).unwrap();
        assert_eq!(
            parse_response(&response, "USB").unwrap(),
            (ProtocolVersion::new(1, 7), STATUS_MATCH)
        );
    }

    #[test]
    fn test_usb_exchange_malformed() {
        let (local, mut head_unit) = UnixStream::pair().unwrap();
        head_unit.write_all(&[0x00, 0x0b, 0x00, 0x02, 0x00, 0x05]).unwrap();

        let err = exchange_with_usb(&local, ProtocolVersion::new(1, 7)).unwrap_err();
        assert!(matches!(err, VersionError::Length { got: 6, .. }));
    }

    fn phone_answering(response: Vec<u8>) -> (UnixStream, thread::JoinHandle<Vec<u8>>) {
        let (local, mut phone) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || {
            let mut request = vec![0u8; REQUEST_LEN];
            phone.read_exact(&mut request).unwrap();
            phone.write_all(&response).unwrap();
            request
        });
        (local, handle)
    }

    #[test]
    fn test_phone_exchange() {
        let (local, phone) = phone_answering(encode_response(ProtocolVersion::new(1, 7), STATUS_MATCH));

        let theirs = exchange_with_phone(
            &local,
            ProtocolVersion::new(1, 6),
            ProtocolVersion::new(1, 7),
        )
        .unwrap();
        assert_eq!(theirs, ProtocolVersion::new(1, 7));

        // The head unit's version is what gets forwarded
        assert_eq!(phone.join().unwrap(), encode_request(ProtocolVersion::new(1, 6)));
    }

    #[test]
    fn test_phone_exchange_different_numbers_is_not_fatal() {
        let (local, phone) = phone_answering(encode_response(ProtocolVersion::new(1, 5), STATUS_MATCH));

        let theirs = exchange_with_phone(
            &local,
            ProtocolVersion::new(1, 6),
            ProtocolVersion::new(1, 7),
        )
        .unwrap();
        assert_eq!(theirs, ProtocolVersion::new(1, 5));
        phone.join().unwrap();
    }

    #[test]
    fn test_phone_exchange_mismatch_status() {
        let (local, phone) =
            phone_answering(encode_response(ProtocolVersion::new(1, 7), STATUS_MISMATCH));

        let err = exchange_with_phone(
            &local,
            ProtocolVersion::new(1, 6),
            ProtocolVersion::new(1, 7),
        )
        .unwrap_err();
        assert!(matches!(err, VersionError::Mismatch { peer: "TCP" }));
        phone.join().unwrap();
    }

    #[test]
    fn test_phone_closes_early() {
        let (local, phone) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || {
            let mut phone = phone;
            let mut request = vec![0u8; REQUEST_LEN];
            phone.read_exact(&mut request).unwrap();
            phone.write_all(&[0x00, 0x03, 0x00]).unwrap();
        });

        let err = exchange_with_phone(
            &local,
            ProtocolVersion::new(1, 6),
            ProtocolVersion::new(1, 7),
        )
        .unwrap_err();
        assert!(matches!(err, VersionError::Length { expected: 12, got: 3, .. }));
        handle.join().unwrap();
    }
}
