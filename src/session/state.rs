//! Session state machine
//!
//! ```text
//! New → Handshaking → ChunkReady → Connected → {Publishing | Playing} → Closed
//! ```
//!
//! Any phase may go to `Closed`. Control messages never change the phase.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use super::stream::MessageStream;
use crate::error::ProtocolError;
use crate::protocol::constants::DEFAULT_WINDOW_ACK_SIZE;
use crate::protocol::message::ConnectParams;

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Transport accepted
    New,
    Handshaking,
    /// Handshake done, waiting for connect
    ChunkReady,
    /// connect accepted
    Connected,
    Publishing,
    Playing,
    Closed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::New => "New",
            SessionPhase::Handshaking => "Handshaking",
            SessionPhase::ChunkReady => "ChunkReady",
            SessionPhase::Connected => "Connected",
            SessionPhase::Publishing => "Publishing",
            SessionPhase::Playing => "Playing",
            SessionPhase::Closed => "Closed",
        }
    }

    /// connect has been accepted and the session is not closed
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionPhase::Connected | SessionPhase::Publishing | SessionPhase::Playing
        )
    }
}

/// Complete session state
#[derive(Debug)]
pub struct SessionState {
    pub id: u64,

    pub peer_addr: SocketAddr,

    pub phase: SessionPhase,

    pub connected_at: Instant,

    pub handshake_completed_at: Option<Instant>,

    /// Connect parameters (after connect command)
    pub connect_params: Option<ConnectParams>,

    /// Message streams keyed by stream ID
    pub streams: HashMap<u32, MessageStream>,

    next_stream_id: u32,

    /// Acknowledgement window announced by the peer
    pub window_ack_size: u32,

    /// Bytes received, modulo 2^32 as carried in Acknowledgement
    pub bytes_received: u32,

    /// Sequence number of the last Acknowledgement we sent
    pub last_ack_sequence: u32,
}

impl SessionState {
    pub fn new(id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            phase: SessionPhase::New,
            connected_at: Instant::now(),
            handshake_completed_at: None,
            connect_params: None,
            streams: HashMap::new(),
            next_stream_id: 1, // 0 is the NetConnection stream
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            bytes_received: 0,
            last_ack_sequence: 0,
        }
    }

    pub fn start_handshake(&mut self) -> Result<(), ProtocolError> {
        self.transition("handshake", &[SessionPhase::New], SessionPhase::Handshaking)
    }

    pub fn complete_handshake(&mut self) -> Result<(), ProtocolError> {
        self.transition(
            "handshake",
            &[SessionPhase::Handshaking],
            SessionPhase::ChunkReady,
        )?;
        self.handshake_completed_at = Some(Instant::now());
        Ok(())
    }

    /// Accept the connect command
    pub fn on_connect(&mut self, params: ConnectParams) -> Result<(), ProtocolError> {
        self.transition("connect", &[SessionPhase::ChunkReady], SessionPhase::Connected)?;
        self.connect_params = Some(params);
        Ok(())
    }

    /// Allocate a message stream for createStream
    pub fn allocate_stream_id(&mut self) -> Result<u32, ProtocolError> {
        self.require_connected("createStream")?;
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        self.streams.insert(id, MessageStream::new(id));
        Ok(id)
    }

    /// Switch to publishing on `stream_id`
    pub fn on_publish(
        &mut self,
        stream_id: u32,
        stream_key: String,
        publish_type: String,
    ) -> Result<(), ProtocolError> {
        self.check_ready("publish", stream_id)?;
        self.transition("publish", &[SessionPhase::Connected], SessionPhase::Publishing)?;
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.start_publish(stream_key, publish_type);
        }
        Ok(())
    }

    /// Switch to playing on `stream_id`
    pub fn on_play(&mut self, stream_id: u32, stream_key: String) -> Result<(), ProtocolError> {
        self.check_ready("play", stream_id)?;
        self.transition("play", &[SessionPhase::Connected], SessionPhase::Playing)?;
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.start_play(stream_key);
        }
        Ok(())
    }

    /// Stop publishing/playing on `stream_id` and return to Connected
    pub fn end_stream(&mut self, stream_id: u32) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.stop();
        }
        if matches!(self.phase, SessionPhase::Publishing | SessionPhase::Playing)
            && !self.streams.values().any(|s| s.is_publishing() || s.is_playing())
        {
            self.phase = SessionPhase::Connected;
        }
    }

    pub fn remove_stream(&mut self, stream_id: u32) -> Option<MessageStream> {
        self.end_stream(stream_id);
        self.streams.remove(&stream_id)
    }

    pub fn get_stream(&self, stream_id: u32) -> Option<&MessageStream> {
        self.streams.get(&stream_id)
    }

    pub fn get_stream_mut(&mut self, stream_id: u32) -> Option<&mut MessageStream> {
        self.streams.get_mut(&stream_id)
    }

    /// Count received bytes; returns the sequence number when an
    /// Acknowledgement is due
    pub fn add_bytes_received(&mut self, bytes: usize) -> Option<u32> {
        self.bytes_received = self.bytes_received.wrapping_add(bytes as u32);
        if self.window_ack_size == 0 {
            return None;
        }
        let since_ack = self.bytes_received.wrapping_sub(self.last_ack_sequence);
        if since_ack >= self.window_ack_size {
            self.last_ack_sequence = self.bytes_received;
            Some(self.bytes_received)
        } else {
            None
        }
    }

    pub fn duration(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    pub fn close(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    pub fn app(&self) -> Option<&str> {
        self.connect_params.as_ref().map(|p| p.app.as_str())
    }

    fn require_connected(&self, command: &str) -> Result<(), ProtocolError> {
        if self.phase.is_connected() {
            Ok(())
        } else {
            Err(self.invalid(command))
        }
    }

    /// Whether `command` may start publishing or playing on `stream_id`
    pub fn check_ready(&self, command: &str, stream_id: u32) -> Result<(), ProtocolError> {
        if self.phase != SessionPhase::Connected {
            return Err(self.invalid(command));
        }
        if self.streams.contains_key(&stream_id) {
            Ok(())
        } else {
            Err(ProtocolError::StreamNotFound(stream_id))
        }
    }

    fn transition(
        &mut self,
        command: &str,
        from: &[SessionPhase],
        to: SessionPhase,
    ) -> Result<(), ProtocolError> {
        if !from.contains(&self.phase) {
            return Err(self.invalid(command));
        }
        tracing::trace!(
            session_id = self.id,
            from = self.phase.as_str(),
            to = to.as_str(),
            "Session phase change"
        );
        self.phase = to;
        Ok(())
    }

    fn invalid(&self, command: &str) -> ProtocolError {
        ProtocolError::InvalidState {
            command: command.to_string(),
            phase: self.phase.as_str(),
        }
    }
}
