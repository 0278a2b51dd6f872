//! RTMP handshake
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes: time+random) ->|
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (1536 bytes: time+random) --|
//!   |<------ S2 (1536 bytes: echo C1) ------|
//!   |------- C2 (1536 bytes: echo S1) ----->|
//!   |          [chunk-framed from here]      |
//! ```
//!
//! Simple handshake only. Echo packets are verified: the time field
//! (bytes 0..4) and the random payload (bytes 8..) must match what we sent.
//! Bytes 4..8 carry the peer's own read time and are not compared.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::HandshakeError;
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

/// Which side of the exchange we play
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Initial,
    /// Server: waiting for C0C1. Client: waiting for S0S1S2.
    WaitingForPeerPacket,
    /// Server only: waiting for C2
    WaitingForPeerResponse,
    Done,
}

impl HandshakeState {
    fn name(&self) -> &'static str {
        match self {
            HandshakeState::Initial => "Initial",
            HandshakeState::WaitingForPeerPacket => "WaitingForPeerPacket",
            HandshakeState::WaitingForPeerResponse => "WaitingForPeerResponse",
            HandshakeState::Done => "Done",
        }
    }
}

/// Handshake state machine
///
/// Feed received bytes through [`Handshake::process`]; it consumes exactly the
/// bytes of the phase it completes and leaves anything after them (typically
/// the first chunks) in the buffer.
#[derive(Debug)]
pub struct Handshake {
    role: HandshakeRole,
    state: HandshakeState,
    our_packet: [u8; HANDSHAKE_SIZE],
}

impl Handshake {
    pub fn new(role: HandshakeRole) -> Self {
        Self {
            role,
            state: HandshakeState::Initial,
            our_packet: [0u8; HANDSHAKE_SIZE],
        }
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Bytes that must be buffered before [`process`](Self::process) can advance
    pub fn bytes_needed(&self) -> usize {
        match (self.state, self.role) {
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Server) => 1 + HANDSHAKE_SIZE,
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Client) => {
                1 + HANDSHAKE_SIZE * 2
            }
            (HandshakeState::WaitingForPeerResponse, _) => HANDSHAKE_SIZE,
            _ => 0,
        }
    }

    /// Start the exchange
    ///
    /// Client: returns C0+C1. Server: returns nothing and starts waiting for C0+C1.
    pub fn generate_initial(&mut self) -> Option<Bytes> {
        if self.state != HandshakeState::Initial {
            return None;
        }
        self.state = HandshakeState::WaitingForPeerPacket;

        match self.role {
            HandshakeRole::Client => {
                self.our_packet = generate_packet();
                let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
                buf.put_u8(RTMP_VERSION);
                buf.put_slice(&self.our_packet);
                Some(buf.freeze())
            }
            HandshakeRole::Server => None,
        }
    }

    /// Advance with buffered peer bytes
    ///
    /// Returns `Ok(None)` when more bytes are needed or when the phase produces
    /// no reply. Returns the bytes to send when a reply is due.
    pub fn process(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, HandshakeError> {
        let needed = self.bytes_needed();
        if needed == 0 {
            if self.state == HandshakeState::Initial {
                return Err(HandshakeError::UnexpectedData(self.state.name()));
            }
            return Ok(None);
        }
        if buf.len() < needed {
            return Ok(None);
        }

        match (self.state, self.role) {
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Server) => {
                let c0c1 = buf.split_to(needed);
                check_version(c0c1[0])?;

                let mut c1 = [0u8; HANDSHAKE_SIZE];
                c1.copy_from_slice(&c0c1[1..]);

                self.our_packet = generate_packet();

                let mut response = BytesMut::with_capacity(1 + HANDSHAKE_SIZE * 2);
                response.put_u8(RTMP_VERSION);
                response.put_slice(&self.our_packet);
                response.put_slice(&generate_echo(&c1));

                self.state = HandshakeState::WaitingForPeerResponse;
                Ok(Some(response.freeze()))
            }
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Client) => {
                let s0s1s2 = buf.split_to(needed);
                check_version(s0s1s2[0])?;

                let s1 = &s0s1s2[1..1 + HANDSHAKE_SIZE];
                let s2 = &s0s1s2[1 + HANDSHAKE_SIZE..];
                verify_echo(&self.our_packet, s2)?;

                let mut peer = [0u8; HANDSHAKE_SIZE];
                peer.copy_from_slice(s1);

                self.state = HandshakeState::Done;
                Ok(Some(Bytes::copy_from_slice(&generate_echo(&peer))))
            }
            (HandshakeState::WaitingForPeerResponse, _) => {
                let c2 = buf.split_to(needed);
                verify_echo(&self.our_packet, &c2)?;
                self.state = HandshakeState::Done;
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

fn check_version(version: u8) -> Result<(), HandshakeError> {
    if version != RTMP_VERSION {
        return Err(HandshakeError::InvalidVersion(version));
    }
    Ok(())
}

/// Compare an echo packet against the packet we originally sent
fn verify_echo(ours: &[u8; HANDSHAKE_SIZE], echo: &[u8]) -> Result<(), HandshakeError> {
    if echo.len() != HANDSHAKE_SIZE {
        return Err(HandshakeError::EchoMismatch(echo.len().min(HANDSHAKE_SIZE)));
    }
    let mismatch = (0..4)
        .chain(8..HANDSHAKE_SIZE)
        .find(|&i| ours[i] != echo[i]);

    match mismatch {
        Some(i) => Err(HandshakeError::EchoMismatch(i)),
        None => Ok(()),
    }
}

fn now_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// C1/S1: `time(4) | zero(4) | random(1528)`
fn generate_packet() -> [u8; HANDSHAKE_SIZE] {
    static SEED_COUNTER: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

    let mut packet = [0u8; HANDSHAKE_SIZE];
    let timestamp = now_millis();
    packet[0..4].copy_from_slice(&timestamp.to_be_bytes());

    // Not cryptographic; the simple handshake only needs the peer to echo it
    let mut seed = SEED_COUNTER.fetch_add(0x2545_F491_4F6C_DD1D, Ordering::Relaxed)
        ^ u64::from(timestamp);
    for chunk in packet[8..].chunks_mut(8) {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let bytes = seed.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }

    packet
}

/// C2/S2: the peer's packet with our read time in bytes 4..8
fn generate_echo(peer_packet: &[u8; HANDSHAKE_SIZE]) -> [u8; HANDSHAKE_SIZE] {
    let mut echo = *peer_packet;
    echo[4..8].copy_from_slice(&now_millis().to_be_bytes());
    echo
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive both sides to completion, returning the server's view of C2
    fn run_pair() -> (Handshake, Handshake, Bytes) {
        let mut client = Handshake::new(HandshakeRole::Client);
        let mut server = Handshake::new(HandshakeRole::Server);

        let c0c1 = client.generate_initial().unwrap();
        assert!(server.generate_initial().is_none());

        let mut buf = BytesMut::from(&c0c1[..]);
        let s0s1s2 = server.process(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());

        let mut buf = BytesMut::from(&s0s1s2[..]);
        let c2 = client.process(&mut buf).unwrap().unwrap();
        (client, server, c2)
    }

    #[test]
    fn test_client_server_converge() {
        let (client, mut server, c2) = run_pair();
        assert!(client.is_done());
        assert!(!server.is_done());

        let mut buf = BytesMut::from(&c2[..]);
        assert!(server.process(&mut buf).unwrap().is_none());
        assert!(server.is_done());
    }

    #[test]
    fn test_mutated_echo_is_rejected() {
        // Sample positions across the time field and the random payload
        for pos in [0usize, 3, 8, 9, 100, 767, 1200, HANDSHAKE_SIZE - 1] {
            let (_client, mut server, c2) = run_pair();
            let mut tampered = BytesMut::from(&c2[..]);
            tampered[pos] ^= 0x01;

            let err = server.process(&mut tampered).unwrap_err();
            assert_eq!(err, HandshakeError::EchoMismatch(pos));
            assert!(!server.is_done());
        }
    }

    #[test]
    fn test_time2_field_not_compared() {
        let (_client, mut server, c2) = run_pair();
        let mut echo = BytesMut::from(&c2[..]);
        echo[5] ^= 0xFF;
        assert!(server.process(&mut echo).is_ok());
        assert!(server.is_done());
    }

    #[test]
    fn test_client_rejects_bad_s2() {
        let mut client = Handshake::new(HandshakeRole::Client);
        let mut server = Handshake::new(HandshakeRole::Server);
        let c0c1 = client.generate_initial().unwrap();
        server.generate_initial();

        let mut buf = BytesMut::from(&c0c1[..]);
        let s0s1s2 = server.process(&mut buf).unwrap().unwrap();
        let mut tampered = BytesMut::from(&s0s1s2[..]);
        let last = tampered.len() - 1;
        tampered[last] ^= 0x80;

        assert!(matches!(
            client.process(&mut tampered),
            Err(HandshakeError::EchoMismatch(_))
        ));
    }

    #[test]
    fn test_invalid_version_rejected() {
        let mut server = Handshake::new(HandshakeRole::Server);
        server.generate_initial();

        let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
        buf.put_u8(6);
        buf.put_slice(&[0u8; HANDSHAKE_SIZE]);

        assert_eq!(
            server.process(&mut buf).unwrap_err(),
            HandshakeError::InvalidVersion(6)
        );
    }

    #[test]
    fn test_incomplete_input_waits() {
        let mut server = Handshake::new(HandshakeRole::Server);
        server.generate_initial();

        let mut buf = BytesMut::from(&[RTMP_VERSION; 100][..]);
        assert!(server.process(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 100);
        assert_eq!(server.bytes_needed(), 1 + HANDSHAKE_SIZE);
    }

    #[test]
    fn test_trailing_bytes_left_in_buffer() {
        let (_client, mut server, c2) = run_pair();
        let mut buf = BytesMut::from(&c2[..]);
        buf.put_slice(&[0x03, 0x00, 0x00]);

        server.process(&mut buf).unwrap();
        assert!(server.is_done());
        assert_eq!(&buf[..], &[0x03, 0x00, 0x00]);
    }

    #[test]
    fn test_process_before_start_is_error() {
        let mut server = Handshake::new(HandshakeRole::Server);
        let mut buf = BytesMut::from(&[0u8; 10][..]);
        assert!(server.process(&mut buf).is_err());
    }

    #[test]
    fn test_packets_differ() {
        let a = generate_packet();
        let b = generate_packet();
        assert_eq!(&a[4..8], &[0, 0, 0, 0]);
        assert_ne!(&a[8..], &b[8..]);
    }
}
