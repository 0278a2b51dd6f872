//! Per-connection driver
//!
//! One `Connection` runs in its own task: handshake, then a single loop that
//! reads chunks from the socket and, for players, drains the subscription
//! into the socket. Generic over the transport so tests can drive it through
//! an in-memory duplex pipe.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};

use crate::amf::{AmfObject, AmfValue};
use crate::error::{Error, HandshakeError, Result};
use crate::media::{Packet, PacketKind};
use crate::protocol::constants::*;
use crate::protocol::message::{
    status_object, Command, ConnectParams, DataMessage, PlayParams, PublishParams, RtmpMessage,
    UserControlEvent,
};
use crate::protocol::{ChunkDecoder, ChunkEncoder, Handshake, HandshakeRole, RtmpChunk};
use crate::registry::{
    Capabilities, CloseReason, Publisher, RegistryError, StreamRegistry, Subscription,
};
use crate::server::config::ServerConfig;
use crate::server::handler::{DisconnectReason, RtmpHandler};
use crate::session::{SessionContext, SessionPhase, SessionState, StreamContext};

/// Packets written per wakeup before flushing
const MAX_WRITE_BATCH: usize = 64;

/// Minimum spare read capacity kept in the input buffer
const READ_RESERVE: usize = 4096;

struct PublishSlot {
    stream_id: u32,
    publisher: Publisher,
}

struct PlaySlot {
    stream_id: u32,
    subscription: Subscription,
}

enum Event {
    Read(std::io::Result<usize>),
    Packet(std::result::Result<Packet, CloseReason>),
    Idle,
}

/// A single RTMP session over any byte stream
pub struct Connection<S, H> {
    state: SessionState,
    ctx: SessionContext,
    socket: S,
    config: ServerConfig,
    handler: Arc<H>,
    registry: Arc<StreamRegistry>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,
    publisher: Option<PublishSlot>,
    player: Option<PlaySlot>,
}

impl<S, H> Connection<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    H: RtmpHandler,
{
    pub fn new(
        session_id: u64,
        socket: S,
        peer_addr: SocketAddr,
        config: ServerConfig,
        handler: Arc<H>,
        registry: Arc<StreamRegistry>,
    ) -> Self {
        let read_buf = BytesMut::with_capacity(config.read_buffer_size);
        let write_buf = BytesMut::with_capacity(config.write_buffer_size);
        let decoder = ChunkDecoder::new().with_max_message_size(config.max_message_size);
        Self {
            state: SessionState::new(session_id, peer_addr),
            ctx: SessionContext::new(session_id, peer_addr),
            socket,
            config,
            handler,
            registry,
            read_buf,
            write_buf,
            decoder,
            encoder: ChunkEncoder::new(),
            publisher: None,
            player: None,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.state.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase
    }

    /// Drive the session to completion
    ///
    /// Registry registrations are released before this returns, whatever
    /// the outcome.
    pub async fn run(&mut self) -> Result<()> {
        if !self.handler.on_connection(&self.ctx).await {
            tracing::debug!(session_id = self.state.id, "Connection refused by handler");
            self.state.close();
            self.handler
                .on_disconnect(&self.ctx, &DisconnectReason::Refused)
                .await;
            return Ok(());
        }

        let result = self.serve().await;
        self.teardown().await;

        let reason = match &result {
            Ok(reason) => reason.clone(),
            Err(e) => DisconnectReason::from_error(e),
        };
        tracing::debug!(
            session_id = self.state.id,
            reason = %reason,
            duration_ms = self.state.duration().as_millis() as u64,
            "Session ended"
        );
        self.handler.on_disconnect(&self.ctx, &reason).await;

        result.map(|_| ())
    }

    async fn serve(&mut self) -> Result<DisconnectReason> {
        self.state.start_handshake()?;
        match timeout(self.config.connection_timeout, self.handshake()).await {
            Ok(result) => result?,
            Err(_) => return Err(HandshakeError::Timeout.into()),
        }
        self.state.complete_handshake()?;
        tracing::debug!(session_id = self.state.id, "Handshake complete");

        // Announced with the old size, applies from the next chunk on
        let chunk_size = self.config.chunk_size;
        self.queue(0, 0, &RtmpMessage::SetChunkSize(chunk_size));
        self.encoder.set_chunk_size(chunk_size);

        // Chunks that arrived right behind C2
        self.process_input().await?;
        self.flush().await?;

        let idle = self.config.idle_timeout;
        let mut last_activity = Instant::now();

        loop {
            let event = {
                let Connection {
                    socket,
                    read_buf,
                    player,
                    ..
                } = self;
                if read_buf.capacity() - read_buf.len() < READ_RESERVE {
                    read_buf.reserve(READ_RESERVE);
                }
                tokio::select! {
                    read = socket.read_buf(read_buf) => Event::Read(read),
                    packet = next_packet(player) => Event::Packet(packet),
                    _ = tokio::time::sleep_until(last_activity + idle) => Event::Idle,
                }
            };

            match event {
                Event::Read(Ok(0)) => return Ok(DisconnectReason::PeerClosed),
                Event::Read(Ok(n)) => {
                    last_activity = Instant::now();
                    if let Some(sequence) = self.state.add_bytes_received(n) {
                        self.queue(0, 0, &RtmpMessage::Acknowledgement { sequence });
                    }
                    self.process_input().await?;
                    self.flush().await?;
                }
                Event::Read(Err(e)) => return Err(e.into()),
                Event::Packet(Ok(packet)) => {
                    last_activity = Instant::now();
                    self.deliver(packet).await?;
                }
                Event::Packet(Err(reason)) => {
                    self.end_playback(reason).await?;
                    return Ok(DisconnectReason::StreamEnded(reason));
                }
                Event::Idle => {
                    tracing::debug!(
                        session_id = self.state.id,
                        idle_ms = idle.as_millis() as u64,
                        "Idle timeout"
                    );
                    return Err(Error::Timeout);
                }
            }
        }
    }

    async fn handshake(&mut self) -> Result<()> {
        let mut handshake = Handshake::new(HandshakeRole::Server);
        handshake.generate_initial();

        loop {
            if let Some(reply) = handshake.process(&mut self.read_buf)? {
                self.socket.write_all(&reply).await?;
                self.socket.flush().await?;
            }
            if handshake.is_done() {
                return Ok(());
            }
            if self.read_buf.len() >= handshake.bytes_needed() {
                continue;
            }
            let n = self.socket.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    async fn process_input(&mut self) -> Result<()> {
        while let Some(chunk) = self.decoder.decode(&mut self.read_buf)? {
            let message = RtmpMessage::from_chunk(&chunk)?;
            self.handle_message(message, chunk.stream_id, chunk.timestamp)
                .await?;
        }
        Ok(())
    }

    async fn handle_message(
        &mut self,
        message: RtmpMessage,
        stream_id: u32,
        timestamp: u32,
    ) -> Result<()> {
        match message {
            RtmpMessage::SetChunkSize(size) => {
                self.decoder.set_chunk_size(size)?;
                tracing::debug!(session_id = self.state.id, chunk_size = size, "Peer chunk size");
            }
            RtmpMessage::Abort { csid } => self.decoder.abort(csid),
            RtmpMessage::Acknowledgement { sequence } => {
                tracing::trace!(session_id = self.state.id, sequence, "Peer acknowledgement");
            }
            RtmpMessage::WindowAckSize(size) => {
                self.state.window_ack_size = size;
                tracing::debug!(session_id = self.state.id, size, "Peer window ack size");
            }
            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                tracing::trace!(session_id = self.state.id, size, limit_type, "Peer bandwidth");
            }
            RtmpMessage::UserControl(event) => self.on_user_control(event),
            RtmpMessage::Audio { timestamp, data } => {
                self.on_media(stream_id, Packet::audio(timestamp, data))
                    .await?
            }
            RtmpMessage::Video { timestamp, data } => {
                self.on_media(stream_id, Packet::video(timestamp, data))
                    .await?
            }
            RtmpMessage::Command(cmd) => self.on_command(cmd).await?,
            RtmpMessage::Data(data) => self.on_data(data, timestamp).await?,
            RtmpMessage::Unknown { type_id, data } => {
                tracing::trace!(
                    session_id = self.state.id,
                    type_id,
                    len = data.len(),
                    "Ignoring message"
                );
            }
        }
        Ok(())
    }

    fn on_user_control(&mut self, event: UserControlEvent) {
        match event {
            UserControlEvent::PingRequest(ts) => {
                self.queue(
                    0,
                    0,
                    &RtmpMessage::UserControl(UserControlEvent::PingResponse(ts)),
                );
            }
            other => {
                tracing::trace!(session_id = self.state.id, event = ?other, "User control");
            }
        }
    }

    async fn on_command(&mut self, cmd: Command) -> Result<()> {
        match cmd.name.as_str() {
            CMD_CONNECT => self.on_connect(&cmd).await,
            CMD_CREATE_STREAM => self.on_create_stream(&cmd),
            CMD_PUBLISH => self.on_publish(&cmd).await,
            CMD_PLAY => self.on_play(&cmd).await,
            CMD_PAUSE => {
                self.on_pause(&cmd).await;
                Ok(())
            }
            CMD_RECEIVE_AUDIO | CMD_RECEIVE_VIDEO => {
                self.on_receive_toggle(&cmd);
                Ok(())
            }
            CMD_DELETE_STREAM => {
                let stream_id = cmd
                    .arguments
                    .first()
                    .and_then(AmfValue::as_number)
                    .map(|n| n as u32)
                    .unwrap_or(cmd.stream_id);
                self.close_stream(stream_id, true).await;
                Ok(())
            }
            CMD_CLOSE_STREAM => {
                self.close_stream(cmd.stream_id, false).await;
                Ok(())
            }
            CMD_RELEASE_STREAM => {
                self.reply_empty(&cmd);
                Ok(())
            }
            CMD_FC_PUBLISH => {
                self.reply_empty(&cmd);
                let name = cmd.string_arg(0).unwrap_or_default().to_string();
                self.queue_command(Command {
                    name: CMD_ON_FC_PUBLISH.to_string(),
                    transaction_id: 0.0,
                    command_object: AmfValue::Null,
                    arguments: vec![status_object("status", NS_PUBLISH_START, &name)],
                    stream_id: 0,
                });
                Ok(())
            }
            CMD_FC_UNPUBLISH => {
                self.on_fc_unpublish(&cmd).await;
                Ok(())
            }
            other => {
                tracing::trace!(session_id = self.state.id, command = other, "Ignoring command");
                Ok(())
            }
        }
    }

    async fn on_connect(&mut self, cmd: &Command) -> Result<()> {
        let params = ConnectParams::from_amf(&cmd.command_object);
        let app = params.app.clone();
        let object_encoding = params.object_encoding;

        self.state.on_connect(params.clone())?;
        self.ctx.with_connect(params);

        if app.is_empty() || !self.handler.is_application_allowed(&app).await {
            tracing::info!(session_id = self.state.id, app = %app, "Connect rejected");
            self.queue_command(Command::error(
                cmd.transaction_id,
                AmfValue::Null,
                status_object("error", NC_CONNECT_REJECTED, "Connection rejected."),
            ));
            self.flush().await?;
            return Err(Error::ConnectRejected(app));
        }

        self.queue(0, 0, &RtmpMessage::WindowAckSize(self.config.window_ack_size));
        self.queue(
            0,
            0,
            &RtmpMessage::SetPeerBandwidth {
                size: self.config.peer_bandwidth,
                limit_type: BANDWIDTH_LIMIT_DYNAMIC,
            },
        );
        self.queue(0, 0, &RtmpMessage::UserControl(UserControlEvent::StreamBegin(0)));

        let properties = AmfObject::new()
            .with("fmsVer", "FMS/3,0,1,123")
            .with("capabilities", 31.0);
        let info = AmfObject::new()
            .with("level", "status")
            .with("code", NC_CONNECT_SUCCESS)
            .with("description", "Connection succeeded.")
            .with("objectEncoding", object_encoding);
        self.queue_command(Command::result(
            cmd.transaction_id,
            AmfValue::Object(properties),
            AmfValue::Object(info),
        ));

        tracing::info!(
            session_id = self.state.id,
            peer = %self.state.peer_addr,
            app = %app,
            "Client connected"
        );
        Ok(())
    }

    fn on_create_stream(&mut self, cmd: &Command) -> Result<()> {
        let stream_id = self.state.allocate_stream_id()?;
        self.queue_command(Command::result(
            cmd.transaction_id,
            AmfValue::Null,
            AmfValue::Number(stream_id as f64),
        ));
        Ok(())
    }

    async fn on_publish(&mut self, cmd: &Command) -> Result<()> {
        let stream_id = cmd.stream_id;
        self.state.check_ready(CMD_PUBLISH, stream_id)?;

        let Some(params) = PublishParams::from_command(cmd) else {
            self.status(stream_id, "error", NS_PUBLISH_BAD_NAME, "Missing stream name");
            return Ok(());
        };
        let key = self.ctx.stream_key(&params.stream_key);

        if !self
            .handler
            .is_publish_allowed(&self.ctx.app, &params.stream_key)
            .await
        {
            tracing::info!(session_id = self.state.id, stream = %key, "Publish rejected");
            self.status(stream_id, "error", NS_PUBLISH_UNAUTHORIZED, "Publish not allowed");
            self.flush().await?;
            return Err(Error::PublishRejected(key.to_string()));
        }

        let publisher = match self.registry.acquire_publisher(&key, self.state.id).await {
            Ok(publisher) => publisher,
            Err(RegistryError::AlreadyPublishing(_)) => {
                tracing::info!(
                    session_id = self.state.id,
                    stream = %key,
                    "Publish refused, stream already has a publisher"
                );
                self.status(stream_id, "error", NS_PUBLISH_BAD_NAME, "Stream already publishing");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.state.on_publish(
            stream_id,
            params.stream_key.clone(),
            params.publish_type.clone(),
        ) {
            let _ = self.registry.release_publisher(&publisher).await;
            return Err(e.into());
        }
        self.publisher = Some(PublishSlot {
            stream_id,
            publisher,
        });

        self.status(
            stream_id,
            "status",
            NS_PUBLISH_START,
            &format!("{} is now published", params.stream_key),
        );
        tracing::info!(
            session_id = self.state.id,
            stream = %key,
            publish_type = %params.publish_type,
            "Publish started"
        );

        let ctx = StreamContext::new(self.ctx.clone(), stream_id, key, true);
        self.handler.on_publish_start(&ctx).await;
        Ok(())
    }

    async fn on_play(&mut self, cmd: &Command) -> Result<()> {
        let stream_id = cmd.stream_id;
        self.state.check_ready(CMD_PLAY, stream_id)?;

        let Some(params) = PlayParams::from_command(cmd) else {
            self.status(stream_id, "error", NS_PLAY_FAILED, "Missing stream name");
            return Ok(());
        };
        let key = self.ctx.stream_key(&params.stream_key);

        if !self
            .handler
            .is_play_allowed(&self.ctx.app, &params.stream_key)
            .await
        {
            tracing::info!(session_id = self.state.id, stream = %key, "Play rejected");
            self.status(stream_id, "error", NS_PLAY_FAILED, "Play not allowed");
            self.flush().await?;
            return Err(Error::PlayRejected(key.to_string()));
        }

        let subscription = match self.registry.subscribe(&key, Capabilities::all()).await {
            Ok(subscription) => subscription,
            Err(RegistryError::StreamNotFound(_)) => {
                tracing::debug!(session_id = self.state.id, stream = %key, "Stream not found");
                self.status(
                    stream_id,
                    "error",
                    NS_PLAY_STREAM_NOT_FOUND,
                    &format!("{} not found", params.stream_key),
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.state.on_play(stream_id, params.stream_key.clone()) {
            self.registry.unsubscribe(subscription).await;
            return Err(e.into());
        }

        let description = format!("Playing {}", params.stream_key);
        self.queue(
            0,
            0,
            &RtmpMessage::UserControl(UserControlEvent::StreamBegin(stream_id)),
        );
        self.status(stream_id, "status", NS_PLAY_RESET, &description);
        self.status(stream_id, "status", NS_PLAY_START, &description);
        self.queue(
            stream_id,
            0,
            &RtmpMessage::Data(DataMessage {
                name: DATA_SAMPLE_ACCESS.to_string(),
                values: vec![AmfValue::Boolean(true), AmfValue::Boolean(true)],
                stream_id,
            }),
        );

        tracing::info!(
            session_id = self.state.id,
            stream = %key,
            subscriber_id = subscription.id(),
            catchup = subscription.pending_catchup(),
            "Play started"
        );
        self.player = Some(PlaySlot {
            stream_id,
            subscription,
        });

        let ctx = StreamContext::new(self.ctx.clone(), stream_id, key, false);
        self.handler.on_play_start(&ctx).await;
        Ok(())
    }

    async fn on_pause(&mut self, cmd: &Command) {
        let stream_id = cmd.stream_id;
        let paused = cmd
            .arguments
            .first()
            .and_then(AmfValue::as_bool)
            .unwrap_or(true);

        let Some(key) = self
            .player
            .as_ref()
            .filter(|p| p.stream_id == stream_id)
            .map(|p| p.subscription.key().clone())
        else {
            tracing::debug!(session_id = self.state.id, stream_id, "Pause on a stream that is not playing");
            return;
        };

        if let Some(stream) = self.state.get_stream_mut(stream_id) {
            stream.set_paused(paused);
        }

        if paused {
            self.status(stream_id, "status", NS_PAUSE_NOTIFY, "Paused");
        } else {
            self.status(stream_id, "status", NS_UNPAUSE_NOTIFY, "Unpaused");
            for packet in self.registry.sequence_headers(&key).await {
                self.write_packet(&packet);
            }
        }
        tracing::debug!(session_id = self.state.id, stream = %key, paused, "Pause");
    }

    fn on_receive_toggle(&mut self, cmd: &Command) {
        let enabled = cmd
            .arguments
            .first()
            .and_then(AmfValue::as_bool)
            .unwrap_or(true);
        if let Some(stream) = self.state.get_stream_mut(cmd.stream_id) {
            if cmd.name == CMD_RECEIVE_AUDIO {
                stream.set_receive_audio(enabled);
            } else {
                stream.set_receive_video(enabled);
            }
        }
    }

    async fn on_fc_unpublish(&mut self, cmd: &Command) {
        self.reply_empty(cmd);
        let name = cmd.string_arg(0).map(|s| s.split('?').next().unwrap_or(s));
        self.queue_command(Command {
            name: CMD_ON_FC_UNPUBLISH.to_string(),
            transaction_id: 0.0,
            command_object: AmfValue::Null,
            arguments: vec![status_object(
                "status",
                NS_UNPUBLISH_SUCCESS,
                name.unwrap_or_default(),
            )],
            stream_id: 0,
        });
        let matches = self
            .publisher
            .as_ref()
            .is_some_and(|slot| name.map_or(true, |n| n == slot.publisher.key().name));
        if matches {
            self.stop_publishing().await;
        }
    }

    async fn on_media(&mut self, stream_id: u32, packet: Packet) -> Result<()> {
        let Some(slot) = self.publisher.as_ref().filter(|p| p.stream_id == stream_id) else {
            tracing::trace!(
                session_id = self.state.id,
                stream_id,
                "Media on a stream that is not publishing"
            );
            return Ok(());
        };

        if let Some(stream) = self.state.get_stream_mut(stream_id) {
            stream.record(&packet);
        }
        slot.publisher.send(packet).await?;
        Ok(())
    }

    async fn on_data(&mut self, data: DataMessage, timestamp: u32) -> Result<()> {
        if data.name == DATA_SAMPLE_ACCESS {
            return Ok(());
        }
        let stream_id = data.stream_id;
        let name = data.name.clone();
        match data.into_metadata() {
            Some(metadata) => {
                self.on_media(stream_id, Packet::metadata(timestamp, metadata.encode()))
                    .await
            }
            None => {
                tracing::trace!(session_id = self.state.id, name = %name, "Ignoring data message");
                Ok(())
            }
        }
    }

    /// Write a packet and whatever else is already queued, then flush once
    async fn deliver(&mut self, first: Packet) -> Result<()> {
        self.write_packet(&first);
        for _ in 1..MAX_WRITE_BATCH {
            let next = match self.player.as_mut() {
                Some(slot) => slot.subscription.try_recv().ok().flatten(),
                None => None,
            };
            match next {
                Some(packet) => self.write_packet(&packet),
                None => break,
            }
        }
        self.flush().await
    }

    fn write_packet(&mut self, packet: &Packet) {
        let Some(stream_id) = self.player.as_ref().map(|p| p.stream_id) else {
            return;
        };
        let wanted = self
            .state
            .get_stream_mut(stream_id)
            .is_some_and(|stream| stream.should_send(packet));
        if !wanted {
            return;
        }

        let (csid, message_type) = match packet.kind {
            PacketKind::Audio => (CSID_AUDIO, MSG_AUDIO),
            PacketKind::Video => (CSID_VIDEO, MSG_VIDEO),
            PacketKind::Metadata => (CSID_DATA, MSG_DATA_AMF0),
        };
        let chunk = RtmpChunk {
            csid,
            timestamp: packet.timestamp,
            message_type,
            stream_id,
            payload: packet.payload.clone(),
        };
        self.encoder.encode(&chunk, &mut self.write_buf);
    }

    async fn end_playback(&mut self, reason: CloseReason) -> Result<()> {
        let Some(slot) = self.player.take() else {
            return Ok(());
        };
        let stream_id = slot.stream_id;
        let key = slot.subscription.key().clone();

        self.queue(
            0,
            0,
            &RtmpMessage::UserControl(UserControlEvent::StreamEof(stream_id)),
        );
        if reason == CloseReason::StreamEnded {
            self.status(
                stream_id,
                "status",
                NS_PLAY_UNPUBLISH_NOTIFY,
                &format!("{} is now unpublished", key.name),
            );
        }
        self.status(stream_id, "status", NS_PLAY_STOP, &format!("Stopped playing {}", key.name));
        self.state.end_stream(stream_id);

        tracing::info!(
            session_id = self.state.id,
            stream = %key,
            subscriber_id = slot.subscription.id(),
            reason = %reason,
            "Playback ended"
        );
        self.flush().await
    }

    async fn stop_publishing(&mut self) {
        let Some(slot) = self.publisher.take() else {
            return;
        };
        if let Err(e) = self.registry.release_publisher(&slot.publisher).await {
            tracing::debug!(session_id = self.state.id, error = %e, "Publisher already released");
        }
        self.status(
            slot.stream_id,
            "status",
            NS_UNPUBLISH_SUCCESS,
            &format!("{} is now unpublished", slot.publisher.key().name),
        );
        self.state.end_stream(slot.stream_id);
        tracing::info!(
            session_id = self.state.id,
            stream = %slot.publisher.key(),
            "Publish stopped"
        );
    }

    async fn close_stream(&mut self, stream_id: u32, delete: bool) {
        if self.publisher.as_ref().is_some_and(|p| p.stream_id == stream_id) {
            self.stop_publishing().await;
        }
        if self.player.as_ref().is_some_and(|p| p.stream_id == stream_id) {
            if let Some(slot) = self.player.take() {
                tracing::debug!(
                    session_id = self.state.id,
                    stream = %slot.subscription.key(),
                    "Playback stopped by client"
                );
                self.registry.unsubscribe(slot.subscription).await;
            }
        }
        if delete {
            self.state.remove_stream(stream_id);
        } else {
            self.state.end_stream(stream_id);
        }
    }

    async fn teardown(&mut self) {
        if let Some(slot) = self.publisher.take() {
            match self.registry.release_publisher(&slot.publisher).await {
                Ok(()) => tracing::info!(
                    session_id = self.state.id,
                    stream = %slot.publisher.key(),
                    "Publisher disconnected"
                ),
                Err(e) => tracing::debug!(
                    session_id = self.state.id,
                    error = %e,
                    "Publisher already released"
                ),
            }
        }
        if let Some(slot) = self.player.take() {
            self.registry.unsubscribe(slot.subscription).await;
        }
        self.state.close();
    }

    fn reply_empty(&mut self, cmd: &Command) {
        if cmd.transaction_id != 0.0 {
            self.queue_command(Command::result(
                cmd.transaction_id,
                AmfValue::Null,
                AmfValue::Undefined,
            ));
        }
    }

    fn status(&mut self, stream_id: u32, level: &str, code: &str, description: &str) {
        self.queue_command(Command::on_status(stream_id, level, code, description));
    }

    fn queue_command(&mut self, cmd: Command) {
        let stream_id = cmd.stream_id;
        self.queue(stream_id, 0, &RtmpMessage::Command(cmd));
    }

    fn queue(&mut self, stream_id: u32, timestamp: u32, message: &RtmpMessage) {
        let (message_type, payload) = message.encode();
        let chunk = RtmpChunk {
            csid: message.default_csid(),
            timestamp,
            message_type,
            stream_id,
            payload,
        };
        self.encoder.encode(&chunk, &mut self.write_buf);
    }

    async fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.socket.write_all(&self.write_buf).await?;
        self.socket.flush().await?;
        self.write_buf.clear();
        Ok(())
    }
}

async fn next_packet(
    player: &mut Option<PlaySlot>,
) -> std::result::Result<Packet, CloseReason> {
    match player {
        Some(slot) => slot.subscription.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::duplex;

    use super::*;
    use crate::server::handler::AcceptAll;

    fn connection<S>(socket: S, config: ServerConfig) -> Connection<S, AcceptAll>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        Connection::new(
            1,
            socket,
            "127.0.0.1:40000".parse().unwrap(),
            config,
            Arc::new(AcceptAll),
            Arc::new(StreamRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (server, _client) = duplex(8192);
        let config = ServerConfig::default().connection_timeout(Duration::from_millis(50));
        let mut conn = connection(server, config);

        let err = conn.run().await.unwrap_err();
        assert!(err.is_handshake());
        assert!(matches!(err, Error::Handshake(HandshakeError::Timeout)));
        assert_eq!(conn.phase(), SessionPhase::Closed);
    }

    #[tokio::test]
    async fn test_bad_version_fails_handshake() {
        let (server, mut client) = duplex(8192);
        let mut conn = connection(server, ServerConfig::default());

        let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
        c0c1[0] = 6;
        client.write_all(&c0c1).await.unwrap();

        let err = conn.run().await.unwrap_err();
        assert!(err.is_handshake());
    }

    #[tokio::test]
    async fn test_peer_close_during_handshake() {
        let (server, client) = duplex(8192);
        drop(client);
        let mut conn = connection(server, ServerConfig::default());
        assert!(matches!(conn.run().await, Err(Error::ConnectionClosed)));
    }

    struct Refuse;

    impl RtmpHandler for Refuse {
        async fn on_connection(&self, _ctx: &SessionContext) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let (server, _client) = duplex(8192);
        let mut conn = Connection::new(
            9,
            server,
            "127.0.0.1:40000".parse().unwrap(),
            ServerConfig::default(),
            Arc::new(Refuse),
            Arc::new(StreamRegistry::new()),
        );
        assert!(conn.run().await.is_ok());
        assert_eq!(conn.phase(), SessionPhase::Closed);
        assert_eq!(conn.session_id(), 9);
    }
}
