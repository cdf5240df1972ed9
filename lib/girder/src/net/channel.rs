//! The secure channel state machine.
//!
//! A channel owns its TCP stream, the byte queues on both sides, the
//! negotiated transport limits and the security context (policy, token and
//! derived key sets). Chunk protection follows sign-then-encrypt: signatures
//! cover everything before them, encryption covers the sequence header
//! onward.

use crate::net::buffer::Buffer;
use crate::net::frame::{
    self, AcknowledgeMessage, AsymmetricSecurityHeader, ChunkAssembler, ChunkHeader, ChunkType,
    ErrorMessage, HelloMessage, MessageType, OpenSecureChannelRequestBody,
    OpenSecureChannelResponseBody, SecurityTokenRequestType, SequenceHeader,
};
use crate::net::support::{
    Deserialize, ErrorType, NetworkError, NetworkResult, Serialize, PROTOCOL_VERSION,
};
use crate::net::PolicySet;
use crate::status::StatusCode;
use flint::cert::Certificate;
use flint::choose;
use flint::logging;
use flint::policy::{ChannelKeys, MessageSecurityMode, PolicyKind, SecurityPolicy};
use mio::net::TcpStream;
use std::io::Cursor;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Slot index of the channel inside the endpoint; doubles as the poll token.
pub type ChannelSlot = usize;

/// Smallest buffer size either side may offer.
pub const MIN_BUFFER_SIZE: u32 = 8192;

const READ_FACTOR: usize = 4;
const WRITE_FACTOR: usize = 8;

/// Server-side transport and token limits, fed from configuration.
#[derive(Debug, Copy, Clone)]
pub struct TransportLimits {
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
    pub max_token_lifetime_ms: u32,
}

impl Default for TransportLimits {
    fn default() -> TransportLimits {
        TransportLimits {
            receive_buffer_size: 65536,
            send_buffer_size: 65536,
            max_message_size: 1 << 24,
            max_chunk_count: 64,
            max_token_lifetime_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    Fresh,
    HelReceived,
    AckSent,
    OpenReceived,
    Open,
    RenewalInProgress,
    Closing,
    Closed,
}

/// A decoded OPN request awaiting trust verification and acceptance.
#[derive(Debug)]
pub struct OpenRequest {
    pub request_id: u32,
    pub request_type: SecurityTokenRequestType,
    pub security_mode: MessageSecurityMode,
    pub client_nonce: Vec<u8>,
    pub requested_lifetime_ms: u32,
    /// Present on the initial asymmetric OPN for secured policies.
    pub client_cert: Option<Certificate>,
}

/// What the framing layer surfaced from one inbound chunk.
#[derive(Debug)]
pub enum ChannelEvent {
    Hello(HelloMessage),
    OpenRequest(OpenRequest),
    Message { request_id: u32, payload: Vec<u8> },
    CloseRequest { request_id: u32 },
    RemoteError(ErrorMessage),
}

/// Previous token retained for one round trip after renewal so in-flight
/// requests still verify.
struct PrevToken {
    token_id: u32,
    remote_keys: ChannelKeys,
}

pub struct Channel {
    slot: Option<ChannelSlot>,
    channel_id: u32,

    stream: Option<TcpStream>,
    state: ChannelState,

    policies: Rc<PolicySet>,
    policy: Option<Rc<SecurityPolicy>>,
    mode: MessageSecurityMode,

    // Token and key material
    token_id: u32,
    prev_token: Option<PrevToken>,
    local_nonce: Vec<u8>,
    remote_nonce: Vec<u8>,
    local_keys: ChannelKeys,
    remote_keys: ChannelKeys,
    remote_cert: Option<Certificate>,

    // Sequence of chunks sent / received
    local_sequence: u32,
    remote_sequence: u32,

    // Negotiated transport parameters
    limits: TransportLimits,
    remote_receive_buffer: u32,
    remote_send_buffer: u32,

    lifetime_ms: u32,
    token_deadline: Option<Instant>,

    // Communication timestamps
    last_egress: Instant,
    last_ingress: Instant,
    opened_at: Instant,

    assembler: ChunkAssembler,
    read_buffer: Buffer,
    write_buffer: Buffer,

    // Ids of the sessions currently bound to this channel
    bound_sessions: Vec<u64>,

    log: logging::Logger,
}

impl Channel {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        policies: Rc<PolicySet>,
        limits: TransportLimits,
        log: L,
    ) -> Channel {
        let now = Instant::now();

        Channel {
            slot: None,
            channel_id: 0,
            stream: None,
            state: ChannelState::Closed,
            policies,
            policy: None,
            mode: MessageSecurityMode::None,
            token_id: 0,
            prev_token: None,
            local_nonce: Vec::new(),
            remote_nonce: Vec::new(),
            local_keys: ChannelKeys::empty(),
            remote_keys: ChannelKeys::empty(),
            remote_cert: None,
            local_sequence: 0,
            remote_sequence: 0,
            limits,
            remote_receive_buffer: limits.receive_buffer_size,
            remote_send_buffer: limits.send_buffer_size,
            lifetime_ms: 0,
            token_deadline: None,
            last_egress: now,
            last_ingress: now,
            opened_at: now,
            assembler: ChunkAssembler::new(limits.max_message_size as usize, limits.max_chunk_count),
            read_buffer: Buffer::new(limits.receive_buffer_size as usize * READ_FACTOR),
            write_buffer: Buffer::new(limits.send_buffer_size as usize * WRITE_FACTOR),
            bound_sessions: Vec::new(),
            log: logging::child(log),
        }
    }

    /// Opens the channel over a fresh stream. The channel must be closed for
    /// this operation to succeed.
    pub fn open(&mut self, slot: ChannelSlot, channel_id: u32, stream: TcpStream, now: Instant) {
        if self.state != ChannelState::Closed {
            panic!("Attempted to open an already open channel");
        }

        self.slot = Some(slot);
        self.channel_id = channel_id;
        self.stream = Some(stream);
        self.state = ChannelState::Fresh;
        self.opened_at = now;
        self.last_ingress = now;
        self.last_egress = now;

        logging::debug!(self.log, "channel opened";
                        "context" => "open",
                        "slot" => slot,
                        "channel_id" => self.channel_id);
    }

    /// Closes the channel, optionally pushing an ERR chunk at the peer first,
    /// and clears all key material.
    pub fn close(&mut self, notify: Option<(StatusCode, &str)>) {
        logging::debug!(self.log, "closing channel";
                        "context" => "close",
                        "channel_id" => self.channel_id,
                        "state" => ?self.state,
                        "local_sequence" => self.local_sequence,
                        "remote_sequence" => self.remote_sequence);

        self.state = ChannelState::Closing;

        if let Some((status, reason)) = notify {
            // Best effort: queue the ERR chunk and try to flush once
            drop(self.queue_error(status, reason));
            if let Some(stream) = self.stream.as_mut() {
                drop(self.write_buffer.egress(stream));
            }
        }

        if let Some(stream) = self.stream.take() {
            drop(stream.shutdown(std::net::Shutdown::Both));
        }

        self.read_buffer.clear();
        self.write_buffer.clear();
        self.assembler.reset();

        self.slot = None;
        self.channel_id = 0;
        self.policy = None;
        self.mode = MessageSecurityMode::None;
        self.token_id = 0;
        self.prev_token = None;
        self.local_nonce.clear();
        self.remote_nonce.clear();
        self.local_keys = ChannelKeys::empty();
        self.remote_keys = ChannelKeys::empty();
        self.remote_cert = None;
        self.local_sequence = 0;
        self.remote_sequence = 0;
        self.lifetime_ms = 0;
        self.token_deadline = None;
        self.bound_sessions.clear();

        self.state = ChannelState::Closed;

        logging::debug!(self.log, "channel closed"; "context" => "close");
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    #[inline]
    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    #[inline]
    pub fn mode(&self) -> MessageSecurityMode {
        self.mode
    }

    #[inline]
    pub fn policy_kind(&self) -> Option<PolicyKind> {
        self.policy.as_ref().map(|policy| policy.kind())
    }

    #[inline]
    pub fn remote_cert(&self) -> Option<&Certificate> {
        self.remote_cert.as_ref()
    }

    /// Sessions currently bound to this channel.
    #[inline]
    pub fn bound_sessions(&self) -> &[u64] {
        &self.bound_sessions
    }

    #[inline]
    pub fn bind_session(&mut self, session_id: u64) {
        if !self.bound_sessions.contains(&session_id) {
            self.bound_sessions.push(session_id);
        }
    }

    #[inline]
    pub fn unbind_session(&mut self, session_id: u64) {
        self.bound_sessions.retain(|&id| id != session_id);
    }

    /// Returns the time elapsed since the last ingress.
    #[inline]
    pub fn last_ingress_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_ingress)
    }

    /// True once the current token's negotiated lifetime has lapsed.
    #[inline]
    pub fn token_expired(&self, now: Instant) -> bool {
        match self.token_deadline {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// Time spent in the pre-OPN handshake states.
    #[inline]
    pub fn handshake_elapsed(&self, now: Instant) -> Option<Duration> {
        match self.state {
            ChannelState::Fresh
            | ChannelState::HelReceived
            | ChannelState::AckSent
            | ChannelState::OpenReceived => Some(now.duration_since(self.opened_at)),
            _ => None,
        }
    }

    /// True if there is outgoing data on the channel.
    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    /// Registers this channel's stream on the supplied poll registry.
    pub fn register(&mut self, slot: ChannelSlot, registry: &mio::Registry) -> NetworkResult<()> {
        let stream = self.stream.as_mut().expect("Can't register disconnected channel");

        registry
            .register(
                stream,
                mio::Token(slot),
                mio::Interest::READABLE | mio::Interest::WRITABLE,
            )
            .map_err(Into::into)
    }

    /// Deregisters this channel's stream from the poll registry.
    pub fn deregister(&mut self, registry: &mio::Registry) -> NetworkResult<()> {
        let stream = self.stream.as_mut().expect("Can't deregister disconnected channel");

        registry.deregister(stream).map_err(Into::into)
    }

    /// Read all available data off the network into the read queue.
    pub fn receive(&mut self, now: Instant) -> NetworkResult<usize> {
        let stream = self.stream.as_mut().expect("Channel must have valid stream");
        let received = self.read_buffer.ingress(stream).map_err(NetworkError::from)?;

        if received > 0 {
            self.last_ingress = now;
        }

        Ok(received)
    }

    /// Flush queued outbound data to the network.
    pub fn send(&mut self, now: Instant) -> NetworkResult<usize> {
        if self.write_buffer.is_empty() {
            return Ok(0);
        }

        let stream = self.stream.as_mut().expect("Channel must have valid stream");
        let sent = self.write_buffer.egress(stream).map_err(NetworkError::from)?;

        if sent > 0 {
            self.last_egress = now;
        }

        Ok(sent)
    }

    /// Consumes one chunk off the read queue and advances the state machine.
    /// Returns `Wait` until a full chunk is buffered. Call repeatedly until
    /// `Wait` to drain.
    pub fn read(&mut self) -> NetworkResult<ChannelEvent> {
        let header = ChunkHeader::peek(self.read_buffer.read_slice())?;

        // Reject oversized chunks before any crypto work
        if header.size > self.limits.receive_buffer_size {
            return Err(NetworkError::Fatal(ErrorType::MessageTooLarge));
        }

        if self.read_buffer.len() < header.size as usize {
            return Err(NetworkError::Wait);
        }

        let chunk = self.read_buffer.read_slice()[..header.size as usize].to_vec();
        self.read_buffer.move_head(chunk.len());

        logging::trace!(self.log, "chunk received";
                        "context" => "read",
                        "channel_id" => self.channel_id,
                        "message_type" => ?header.message_type,
                        "size" => header.size);

        match (header.message_type, self.state) {
            (MessageType::Hello, ChannelState::Fresh) => self.process_hello(&chunk),
            (MessageType::OpenChannel, ChannelState::AckSent) => self.process_initial_open(chunk, header),
            (MessageType::OpenChannel, ChannelState::Open) => {
                self.process_symmetric(chunk, header)
            }
            (MessageType::Message, ChannelState::Open)
            | (MessageType::Message, ChannelState::RenewalInProgress)
            | (MessageType::CloseChannel, ChannelState::Open)
            | (MessageType::CloseChannel, ChannelState::RenewalInProgress) => {
                self.process_symmetric(chunk, header)
            }
            (MessageType::Error, _) => {
                let mut cursor = Cursor::new(&chunk[frame::MESSAGE_HEADER_SIZE..]);
                let error = ErrorMessage::deserialize(&mut cursor)?;
                Ok(ChannelEvent::RemoteError(error))
            }
            _ => Err(NetworkError::Fatal(ErrorType::StateInvalid)),
        }
    }

    fn process_hello(&mut self, chunk: &[u8]) -> NetworkResult<ChannelEvent> {
        let mut cursor = Cursor::new(&chunk[frame::MESSAGE_HEADER_SIZE..]);
        let hello = HelloMessage::deserialize(&mut cursor)?;

        if hello.receive_buffer_size < MIN_BUFFER_SIZE || hello.send_buffer_size < MIN_BUFFER_SIZE {
            return Err(NetworkError::Fatal(ErrorType::Decoding));
        }

        // Negotiation takes the minimum of each side's buffers
        self.remote_receive_buffer = hello.receive_buffer_size.min(self.limits.send_buffer_size);
        self.remote_send_buffer = hello.send_buffer_size.min(self.limits.receive_buffer_size);
        if hello.max_message_size != 0 {
            self.limits.max_message_size = self.limits.max_message_size.min(hello.max_message_size);
        }
        if hello.max_chunk_count != 0 {
            self.limits.max_chunk_count = self.limits.max_chunk_count.min(hello.max_chunk_count);
        }

        self.assembler =
            ChunkAssembler::new(self.limits.max_message_size as usize, self.limits.max_chunk_count);
        self.state = ChannelState::HelReceived;

        logging::debug!(self.log, "hello received";
                        "context" => "process_hello",
                        "channel_id" => self.channel_id,
                        "remote_receive_buffer" => self.remote_receive_buffer,
                        "remote_send_buffer" => self.remote_send_buffer,
                        "endpoint_url" => hello.endpoint_url.as_deref().unwrap_or(""));

        Ok(ChannelEvent::Hello(hello))
    }

    /// Queues the ACK reply to a received HEL.
    pub fn acknowledge(&mut self) -> NetworkResult<()> {
        if self.state != ChannelState::HelReceived {
            return Err(NetworkError::Fatal(ErrorType::StateInvalid));
        }

        let ack = AcknowledgeMessage {
            protocol_version: PROTOCOL_VERSION,
            receive_buffer_size: self.remote_send_buffer,
            send_buffer_size: self.remote_receive_buffer,
            max_message_size: self.limits.max_message_size,
            max_chunk_count: self.limits.max_chunk_count,
        };

        let mut body = Cursor::new(Vec::new());
        ack.serialize(&mut body)?;
        self.queue_unsecured(MessageType::Acknowledge, &body.into_inner())?;

        self.state = ChannelState::AckSent;
        Ok(())
    }

    fn process_initial_open(&mut self, chunk: Vec<u8>, header: ChunkHeader) -> NetworkResult<ChannelEvent> {
        if header.chunk_type != ChunkType::Final {
            // OPN is always a single chunk
            return Err(NetworkError::Fatal(ErrorType::ChunkTypeInvalid));
        }

        let wire_channel_id = u32::from_le_bytes([chunk[8], chunk[9], chunk[10], chunk[11]]);
        if wire_channel_id != 0 {
            return Err(NetworkError::Fatal(ErrorType::ChannelIdInvalid));
        }

        let mut cursor = Cursor::new(&chunk[frame::SECURE_HEADER_SIZE..]);
        let asym = AsymmetricSecurityHeader::deserialize(&mut cursor)?;
        let asym_end = frame::SECURE_HEADER_SIZE + asym.encoded_size();

        let entry = self
            .policies
            .find_by_uri(&asym.policy_uri)
            .ok_or(NetworkError::Fatal(ErrorType::PolicyRejected))?;
        let policy = entry.policy.clone();
        let mode = entry.mode;

        let (plain, client_cert) = if policy.kind() == PolicyKind::None {
            (chunk[asym_end..].to_vec(), None)
        } else {
            // The client must have encrypted to our current certificate
            let local_thumbprint = policy
                .local_cert()
                .map(|cert| cert.thumbprint().to_vec())
                .unwrap_or_default();
            match &asym.receiver_thumbprint {
                Some(thumbprint) if *thumbprint == local_thumbprint => (),
                _ => return Err(NetworkError::Fatal(ErrorType::Crypto)),
            }

            let sender_der = asym
                .sender_certificate
                .as_deref()
                .ok_or(NetworkError::Fatal(ErrorType::Security(StatusCode::BadSecurityChecksFailed)))?;
            let client_cert = Certificate::parse(sender_der).map_err(|_| {
                NetworkError::Fatal(ErrorType::Security(StatusCode::BadSecurityChecksFailed))
            })?;

            policy
                .validate_remote_key_bits(&client_cert)
                .map_err(|_| NetworkError::Fatal(ErrorType::Security(StatusCode::BadSecurityChecksFailed)))?;

            let plain = policy
                .asym_decrypt(&chunk[asym_end..])
                .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;

            // Signature over header + asym header + decrypted region before it
            let sig_len = policy.asym_remote_signature_size(&client_cert);
            if plain.len() < frame::SEQUENCE_HEADER_SIZE + sig_len + 1 {
                return Err(NetworkError::Fatal(ErrorType::Crypto));
            }

            let sig_start = plain.len() - sig_len;
            let mut signed = Vec::with_capacity(asym_end + sig_start);
            signed.extend_from_slice(&chunk[..asym_end]);
            signed.extend_from_slice(&plain[..sig_start]);

            policy
                .asym_verify(&client_cert, &signed, &plain[sig_start..])
                .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;

            // Strip the padding: size byte sits just before the signature
            let pad = plain[sig_start - 1] as usize;
            if sig_start < frame::SEQUENCE_HEADER_SIZE + 1 + pad {
                return Err(NetworkError::Fatal(ErrorType::Crypto));
            }
            (plain[..sig_start - 1 - pad].to_vec(), Some(client_cert))
        };

        let sequence = SequenceHeader::read(&plain)?;
        if !frame::sequence_follows(self.remote_sequence, sequence.sequence_number) {
            return Err(NetworkError::Fatal(ErrorType::SequenceInvalid));
        }
        self.remote_sequence = sequence.sequence_number;

        let mut cursor = Cursor::new(&plain[frame::SEQUENCE_HEADER_SIZE..]);
        let body = OpenSecureChannelRequestBody::deserialize(&mut cursor)?;

        if body.request_type != SecurityTokenRequestType::Issue {
            return Err(NetworkError::Fatal(ErrorType::StateInvalid));
        }

        let requested_mode = MessageSecurityMode::from_u32(body.security_mode)
            .ok_or(NetworkError::Fatal(ErrorType::ModeRejected))?;
        if requested_mode != mode {
            return Err(NetworkError::Fatal(ErrorType::ModeRejected));
        }

        self.policy = Some(policy);
        self.mode = mode;
        self.remote_cert = client_cert.clone();
        self.state = ChannelState::OpenReceived;

        logging::debug!(self.log, "open secure channel requested";
                        "context" => "process_initial_open",
                        "channel_id" => self.channel_id,
                        "policy" => asym.policy_uri,
                        "requested_lifetime_ms" => body.requested_lifetime_ms);

        Ok(ChannelEvent::OpenRequest(OpenRequest {
            request_id: sequence.request_id,
            request_type: SecurityTokenRequestType::Issue,
            security_mode: requested_mode,
            client_nonce: body.client_nonce.unwrap_or_default(),
            requested_lifetime_ms: body.requested_lifetime_ms,
            client_cert,
        }))
    }

    fn process_symmetric(&mut self, mut chunk: Vec<u8>, header: ChunkHeader) -> NetworkResult<ChannelEvent> {
        let policy = self
            .policy
            .clone()
            .ok_or(NetworkError::Fatal(ErrorType::StateInvalid))?;

        let wire_channel_id = u32::from_le_bytes([chunk[8], chunk[9], chunk[10], chunk[11]]);
        if wire_channel_id != self.channel_id {
            return Err(NetworkError::Fatal(ErrorType::ChannelIdInvalid));
        }

        let sec_start = frame::SECURE_HEADER_SIZE + frame::SYM_SECURITY_HEADER_SIZE;
        if chunk.len() < sec_start + frame::SEQUENCE_HEADER_SIZE {
            return Err(NetworkError::Fatal(ErrorType::Decoding));
        }

        let token_id = u32::from_le_bytes([chunk[12], chunk[13], chunk[14], chunk[15]]);
        let keys = if token_id == self.token_id {
            // First chunk under the new token retires the previous one
            self.prev_token = None;
            self.remote_keys.clone()
        } else {
            match &self.prev_token {
                Some(prev) if prev.token_id == token_id => prev.remote_keys.clone(),
                _ => return Err(NetworkError::Fatal(ErrorType::TokenInvalid)),
            }
        };

        let sig_len = match self.mode {
            MessageSecurityMode::None => 0,
            _ => policy.kind().sym_signature_size(),
        };

        if self.mode == MessageSecurityMode::SignAndEncrypt {
            let region = &mut chunk[sec_start..];
            if region.is_empty() || region.len() % policy.kind().sym_block_size() != 0 {
                return Err(NetworkError::Fatal(ErrorType::Crypto));
            }
            policy
                .sym_decrypt(&keys, region)
                .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;
        }

        if chunk.len() < sec_start + frame::SEQUENCE_HEADER_SIZE + sig_len {
            return Err(NetworkError::Fatal(ErrorType::Decoding));
        }

        if sig_len > 0 {
            let sig_start = chunk.len() - sig_len;
            policy
                .sym_verify(&keys, &chunk[..sig_start], &chunk[sig_start..])
                .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;
        }

        let sequence = SequenceHeader::read(&chunk[sec_start..])?;
        if !frame::sequence_follows(self.remote_sequence, sequence.sequence_number) {
            return Err(NetworkError::Fatal(ErrorType::SequenceInvalid));
        }
        self.remote_sequence = sequence.sequence_number;

        let body_start = sec_start + frame::SEQUENCE_HEADER_SIZE;
        let body_end = match self.mode {
            MessageSecurityMode::SignAndEncrypt => {
                let sig_start = chunk.len() - sig_len;
                let pad = chunk[sig_start - 1] as usize;
                if sig_start < body_start + 1 + pad {
                    return Err(NetworkError::Fatal(ErrorType::Crypto));
                }
                // Padding bytes must all carry the padding size value
                let pad_start = sig_start - 1 - pad;
                if chunk[pad_start..sig_start - 1].iter().any(|&byte| byte as usize != pad) {
                    return Err(NetworkError::Fatal(ErrorType::Crypto));
                }
                pad_start
            }
            MessageSecurityMode::Sign => chunk.len() - sig_len,
            MessageSecurityMode::None => chunk.len(),
        };

        let body = &chunk[body_start..body_end];

        match header.message_type {
            MessageType::OpenChannel => {
                // Renewal travels under the current symmetric keys
                if header.chunk_type != ChunkType::Final {
                    return Err(NetworkError::Fatal(ErrorType::ChunkTypeInvalid));
                }

                let mut cursor = Cursor::new(body);
                let request = OpenSecureChannelRequestBody::deserialize(&mut cursor)?;

                if request.request_type != SecurityTokenRequestType::Renew {
                    return Err(NetworkError::Fatal(ErrorType::StateInvalid));
                }

                // Renewal must keep the security policy
                match &request.policy_uri {
                    Some(uri) if *uri == policy.uri() => (),
                    _ => return Err(NetworkError::Fatal(ErrorType::PolicyRejected)),
                }

                self.state = ChannelState::RenewalInProgress;

                Ok(ChannelEvent::OpenRequest(OpenRequest {
                    request_id: sequence.request_id,
                    request_type: SecurityTokenRequestType::Renew,
                    security_mode: self.mode,
                    client_nonce: request.client_nonce.unwrap_or_default(),
                    requested_lifetime_ms: request.requested_lifetime_ms,
                    client_cert: None,
                }))
            }
            MessageType::CloseChannel => Ok(ChannelEvent::CloseRequest {
                request_id: sequence.request_id,
            }),
            _ => match self.assembler.feed(sequence.request_id, header.chunk_type, body)? {
                Some((request_id, payload)) => Ok(ChannelEvent::Message { request_id, payload }),
                None => Err(NetworkError::Wait),
            },
        }
    }

    /// Accepts a verified OPN request: issues the token, derives the
    /// symmetric keys and queues the response.
    pub fn accept_open(&mut self, request: &OpenRequest, now: Instant) -> NetworkResult<()> {
        let policy = self
            .policy
            .clone()
            .ok_or(NetworkError::Fatal(ErrorType::StateInvalid))?;

        let renewal = match (self.state, request.request_type) {
            (ChannelState::OpenReceived, SecurityTokenRequestType::Issue) => false,
            (ChannelState::RenewalInProgress, SecurityTokenRequestType::Renew) => true,
            _ => return Err(NetworkError::Fatal(ErrorType::StateInvalid)),
        };

        if policy.kind() != PolicyKind::None && request.client_nonce.len() != policy.kind().nonce_length()
        {
            return Err(NetworkError::Fatal(ErrorType::Security(StatusCode::BadNonceInvalid)));
        }

        let server_nonce = policy.make_nonce();
        let new_token_id = if renewal { self.token_id + 1 } else { 1 };

        let revised_lifetime_ms = match request.requested_lifetime_ms {
            0 => self.limits.max_token_lifetime_ms,
            requested => requested.min(self.limits.max_token_lifetime_ms),
        };

        // client keys secure client->server traffic, server keys the reverse
        let new_remote_keys = policy
            .derive_channel_keys(&server_nonce, &request.client_nonce)
            .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;
        let new_local_keys = policy
            .derive_channel_keys(&request.client_nonce, &server_nonce)
            .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;

        let body = OpenSecureChannelResponseBody {
            server_protocol_version: PROTOCOL_VERSION,
            channel_id: self.channel_id,
            token_id: new_token_id,
            revised_lifetime_ms,
            server_nonce: Some(server_nonce.clone()),
        };
        let mut encoded = Cursor::new(Vec::new());
        body.serialize(&mut encoded)?;
        let encoded = encoded.into_inner();

        if renewal {
            // The response still travels under the old token so the client
            // can read it; the old remote keys stay valid for one round trip.
            self.queue_secured(MessageType::OpenChannel, request.request_id, &encoded)?;

            self.prev_token = Some(PrevToken {
                token_id: self.token_id,
                remote_keys: std::mem::replace(&mut self.remote_keys, new_remote_keys),
            });
            self.local_keys = new_local_keys;
        } else {
            self.queue_asym_open_response(&policy, request, &encoded)?;
            self.remote_keys = new_remote_keys;
            self.local_keys = new_local_keys;
        }

        self.token_id = new_token_id;
        self.local_nonce = server_nonce;
        self.remote_nonce = request.client_nonce.clone();
        self.lifetime_ms = revised_lifetime_ms;
        self.token_deadline = Some(now + Duration::from_millis(u64::from(revised_lifetime_ms)));
        self.state = ChannelState::Open;

        logging::info!(self.log, "secure channel token issued";
                       "context" => "accept_open",
                       "channel_id" => self.channel_id,
                       "token_id" => new_token_id,
                       "renewal" => renewal,
                       "lifetime_ms" => revised_lifetime_ms);

        Ok(())
    }

    /// Queues a complete service message, chunked below the peer's receive
    /// buffer. All chunks are queued atomically or not at all.
    pub fn send_message(&mut self, request_id: u32, payload: &[u8]) -> NetworkResult<()> {
        if self.state != ChannelState::Open && self.state != ChannelState::RenewalInProgress {
            return Err(NetworkError::Fatal(ErrorType::StateInvalid));
        }

        self.queue_secured(MessageType::Message, request_id, payload)
    }

    /// Builds and queues ERR + nothing else; used right before teardown.
    pub fn queue_error(&mut self, status: StatusCode, reason: &str) -> NetworkResult<()> {
        let error = ErrorMessage {
            error: status.code(),
            reason: Some(reason.to_string()),
        };

        let mut body = Cursor::new(Vec::new());
        error.serialize(&mut body)?;
        self.queue_unsecured(MessageType::Error, &body.into_inner())
    }

    /// HEL/ACK/ERR framing: bare header + body, single chunk, no security.
    fn queue_unsecured(&mut self, message_type: MessageType, body: &[u8]) -> NetworkResult<()> {
        let size = frame::MESSAGE_HEADER_SIZE + body.len();

        if self.write_buffer.free_capacity() < size {
            return Err(NetworkError::Wait);
        }

        let mut chunk = vec![0u8; frame::MESSAGE_HEADER_SIZE];
        ChunkHeader {
            message_type,
            chunk_type: ChunkType::Final,
            size: size as u32,
        }
        .write_to(&mut chunk);
        chunk.extend_from_slice(body);

        self.write_buffer.extend(&chunk);
        Ok(())
    }

    /// Symmetric-secured framing for MSG/CLO and renewal OPN responses.
    fn queue_secured(
        &mut self,
        message_type: MessageType,
        request_id: u32,
        payload: &[u8],
    ) -> NetworkResult<()> {
        let policy = self
            .policy
            .clone()
            .ok_or(NetworkError::Fatal(ErrorType::StateInvalid))?;

        let sec_start = frame::SECURE_HEADER_SIZE + frame::SYM_SECURITY_HEADER_SIZE;
        let sig_len = match self.mode {
            MessageSecurityMode::None => 0,
            _ => policy.kind().sym_signature_size(),
        };
        let block = policy.kind().sym_block_size();

        let max_chunk = self.remote_receive_buffer.min(self.limits.send_buffer_size) as usize;

        // Cleartext body budget per chunk
        let max_body = match self.mode {
            MessageSecurityMode::SignAndEncrypt => {
                let region = (max_chunk - sec_start) / block * block;
                region - frame::SEQUENCE_HEADER_SIZE - 1 - sig_len - (block - 1)
            }
            MessageSecurityMode::Sign => {
                max_chunk - sec_start - frame::SEQUENCE_HEADER_SIZE - sig_len
            }
            MessageSecurityMode::None => max_chunk - sec_start - frame::SEQUENCE_HEADER_SIZE,
        };

        let bodies: Vec<&[u8]> = if payload.is_empty() {
            vec![&[]]
        } else {
            payload.chunks(max_body).collect()
        };

        if self.limits.max_chunk_count != 0 && bodies.len() > self.limits.max_chunk_count as usize {
            return Err(NetworkError::Fatal(ErrorType::ChunkCountExceeded));
        }

        // Pre-compute chunk sizes so the queue operation is all or nothing
        let mut total = 0;
        for body in &bodies {
            total += self.secured_chunk_size(body.len(), sig_len, block, sec_start);
        }
        if self.write_buffer.free_capacity() < total {
            return Err(NetworkError::Wait);
        }

        let count = bodies.len();
        for (index, body) in bodies.into_iter().enumerate() {
            let chunk_type = choose!(index + 1 == count => ChunkType::Final, ChunkType::Intermediate);

            let chunk = self.build_secured_chunk(
                &policy, message_type, chunk_type, request_id, body, sig_len, block, sec_start,
            )?;
            self.write_buffer.extend(&chunk);
        }

        Ok(())
    }

    fn secured_chunk_size(&self, body_len: usize, sig_len: usize, block: usize, sec_start: usize) -> usize {
        match self.mode {
            MessageSecurityMode::SignAndEncrypt => {
                let unpadded = frame::SEQUENCE_HEADER_SIZE + body_len + 1 + sig_len;
                let pad = (block - unpadded % block) % block;
                sec_start + unpadded + pad
            }
            MessageSecurityMode::Sign => {
                sec_start + frame::SEQUENCE_HEADER_SIZE + body_len + sig_len
            }
            MessageSecurityMode::None => sec_start + frame::SEQUENCE_HEADER_SIZE + body_len,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_secured_chunk(
        &mut self,
        policy: &SecurityPolicy,
        message_type: MessageType,
        chunk_type: ChunkType,
        request_id: u32,
        body: &[u8],
        sig_len: usize,
        block: usize,
        sec_start: usize,
    ) -> NetworkResult<Vec<u8>> {
        let size = self.secured_chunk_size(body.len(), sig_len, block, sec_start);
        self.local_sequence = frame::next_sequence(self.local_sequence);

        let mut chunk = Vec::with_capacity(size);
        chunk.resize(frame::MESSAGE_HEADER_SIZE, 0);
        ChunkHeader {
            message_type,
            chunk_type,
            size: size as u32,
        }
        .write_to(&mut chunk);

        chunk.extend_from_slice(&self.channel_id.to_le_bytes());
        chunk.extend_from_slice(&self.token_id.to_le_bytes());

        let mut sequence = [0u8; frame::SEQUENCE_HEADER_SIZE];
        SequenceHeader {
            sequence_number: self.local_sequence,
            request_id,
        }
        .write_to(&mut sequence);
        chunk.extend_from_slice(&sequence);
        chunk.extend_from_slice(body);

        if self.mode == MessageSecurityMode::SignAndEncrypt {
            let unpadded = frame::SEQUENCE_HEADER_SIZE + body.len() + 1 + sig_len;
            let pad = (block - unpadded % block) % block;
            chunk.extend(std::iter::repeat(pad as u8).take(pad));
            chunk.push(pad as u8);
        }

        if sig_len > 0 {
            let signature = policy
                .sym_sign(&self.local_keys, &chunk)
                .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;
            chunk.extend_from_slice(&signature);
        }

        if self.mode == MessageSecurityMode::SignAndEncrypt {
            policy
                .sym_encrypt(&self.local_keys, &mut chunk[sec_start..])
                .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;
        }

        debug_assert_eq!(chunk.len(), size);
        Ok(chunk)
    }

    /// The asymmetric OPN response: signed with the server key, encrypted to
    /// the client certificate. Always a single chunk.
    fn queue_asym_open_response(
        &mut self,
        policy: &SecurityPolicy,
        request: &OpenRequest,
        body: &[u8],
    ) -> NetworkResult<()> {
        let asym = AsymmetricSecurityHeader {
            policy_uri: policy.uri().to_string(),
            sender_certificate: policy.local_cert().map(|cert| cert.der().to_vec()),
            receiver_thumbprint: request
                .client_cert
                .as_ref()
                .map(|cert| cert.thumbprint().to_vec()),
        };

        let mut header_bytes = Cursor::new(Vec::new());
        asym.serialize(&mut header_bytes)?;
        let header_bytes = header_bytes.into_inner();
        let asym_end = frame::SECURE_HEADER_SIZE + header_bytes.len();

        self.local_sequence = frame::next_sequence(self.local_sequence);
        let mut sequence = [0u8; frame::SEQUENCE_HEADER_SIZE];
        SequenceHeader {
            sequence_number: self.local_sequence,
            request_id: request.request_id,
        }
        .write_to(&mut sequence);

        let (size, plain) = if policy.kind() == PolicyKind::None {
            let mut plain = Vec::with_capacity(frame::SEQUENCE_HEADER_SIZE + body.len());
            plain.extend_from_slice(&sequence);
            plain.extend_from_slice(body);
            (asym_end + plain.len(), plain)
        } else {
            let client_cert = request
                .client_cert
                .as_ref()
                .ok_or(NetworkError::Fatal(ErrorType::StateInvalid))?;

            let sig_len = policy.asym_local_signature_size();
            let plain_block = policy.asym_plain_block_size(client_cert);
            let cipher_block = policy.asym_cipher_block_size(client_cert);

            let unpadded = frame::SEQUENCE_HEADER_SIZE + body.len() + 1 + sig_len;
            let pad = (plain_block - unpadded % plain_block) % plain_block;
            let plain_len = unpadded + pad;
            let blocks = plain_len / plain_block;
            let size = asym_end + blocks * cipher_block;

            let mut plain = Vec::with_capacity(plain_len);
            plain.extend_from_slice(&sequence);
            plain.extend_from_slice(body);
            plain.extend(std::iter::repeat(pad as u8).take(pad));
            plain.push(pad as u8);

            (size, plain)
        };

        if self.write_buffer.free_capacity() < size {
            return Err(NetworkError::Wait);
        }

        let mut chunk = vec![0u8; frame::MESSAGE_HEADER_SIZE];
        ChunkHeader {
            message_type: MessageType::OpenChannel,
            chunk_type: ChunkType::Final,
            size: size as u32,
        }
        .write_to(&mut chunk);
        chunk.extend_from_slice(&self.channel_id.to_le_bytes());
        chunk.extend_from_slice(&header_bytes);

        if policy.kind() == PolicyKind::None {
            chunk.extend_from_slice(&plain);
        } else {
            let client_cert = request.client_cert.as_ref().expect("Checked above");

            // Sign over everything before the signature, then encrypt the
            // whole region including it
            let mut signed = chunk.clone();
            signed.extend_from_slice(&plain);
            let signature = policy
                .asym_sign(&signed)
                .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;

            let mut region = plain;
            region.extend_from_slice(&signature);
            let encrypted = policy
                .asym_encrypt(client_cert, &region)
                .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;
            chunk.extend_from_slice(&encrypted);
        }

        debug_assert_eq!(chunk.len(), size);
        self.write_buffer.extend(&chunk);
        Ok(())
    }

    #[allow(dead_code)]
    #[inline]
    pub(crate) fn read_buffer_mut(&mut self) -> &mut Buffer {
        &mut self.read_buffer
    }

    #[allow(dead_code)]
    #[inline]
    pub(crate) fn write_buffer_mut(&mut self) -> &mut Buffer {
        &mut self.write_buffer
    }
}
