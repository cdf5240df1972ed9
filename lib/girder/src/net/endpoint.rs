//! Connection management: the poll loop accepting TCP connections, pumping
//! channel I/O, advancing the secure channel handshakes and timing out dead
//! peers.

use crate::net::channel::{Channel, ChannelEvent, ChannelSlot, ChannelState, TransportLimits};
use crate::net::support::{ErrorUtils, NetworkError, NetworkResult};
use crate::net::PolicySet;
use crate::pki::{self, TrustStore};
use crate::status::StatusCode;
use flint::logging;
use indexmap::IndexSet;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Describes a change in the connectivity status of a channel.
#[derive(Debug, Clone)]
pub enum ConnectionChange {
    /// The secure channel completed its OPN handshake.
    Established { channel_id: u32 },
    /// The channel went away; carries the sessions that were bound to it.
    Closed {
        channel_id: u32,
        bound_sessions: Vec<u64>,
    },
}

/// A reassembled service message ready for dispatch.
#[derive(Debug)]
pub struct InboundMessage {
    pub channel_id: u32,
    pub request_id: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Copy, Clone)]
pub struct EndpointConfig {
    pub handshake_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub housekeeping_interval: Duration,
}

impl Default for EndpointConfig {
    fn default() -> EndpointConfig {
        EndpointConfig {
            handshake_timeout: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(60),
            housekeeping_interval: Duration::from_secs(3),
        }
    }
}

/// Handles connection management and network transmission for all channels.
pub struct Endpoint {
    listener: TcpListener,
    poll: Poll,
    events: Events,

    policies: Rc<PolicySet>,
    limits: TransportLimits,
    config: EndpointConfig,

    channels: Vec<Channel>,
    free: Vec<ChannelSlot>,
    live: IndexSet<ChannelSlot>,
    next_channel_id: u32,

    changes: Vec<ConnectionChange>,
    inbound: Vec<InboundMessage>,

    housekeeping_time: Instant,
    log: logging::Logger,
}

impl Endpoint {
    /// Binds the listener to `address` (`<ip>:<port>`).
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        address: &str,
        policies: Rc<PolicySet>,
        limits: TransportLimits,
        config: EndpointConfig,
        log: L,
    ) -> NetworkResult<Endpoint> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(address.parse::<SocketAddr>()?)?;

        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let log = logging::child(log);
        logging::info!(log, "endpoint listening"; "context" => "new", "address" => address);

        Ok(Endpoint {
            listener,
            poll,
            events: Events::with_capacity(1024),
            policies,
            limits,
            config,
            channels: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            next_channel_id: 1,
            changes: Vec::new(),
            inbound: Vec::new(),
            housekeeping_time: Instant::now(),
            log,
        })
    }

    /// The locally bound address (useful with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Replaces the policy set used by future channels. Existing channels
    /// keep their old policy until torn down.
    #[inline]
    pub fn set_policies(&mut self, policies: Rc<PolicySet>) {
        self.policies = policies;
    }

    /// Drains all connectivity changes accumulated since the last call.
    #[inline]
    pub fn changes(&mut self) -> impl Iterator<Item = ConnectionChange> + '_ {
        self.changes.drain(..)
    }

    /// Drains all reassembled service messages.
    #[inline]
    pub fn drain_messages(&mut self) -> impl Iterator<Item = InboundMessage> + '_ {
        self.inbound.drain(..)
    }

    /// The remote certificate presented on the channel's OPN, if any.
    pub fn remote_cert_der(&self, channel_id: u32) -> Option<Vec<u8>> {
        let slot = self.slot_of(channel_id)?;
        self.channels[slot].remote_cert().map(|cert| cert.der().to_vec())
    }

    /// Snapshot of all open channels and their remote certificates, used by
    /// the trust-list commit hook to find peers that no longer verify.
    pub fn open_channel_certs(&self) -> Vec<(u32, Option<Vec<u8>>)> {
        self.live
            .iter()
            .copied()
            .filter(|&slot| self.channels[slot].state() == ChannelState::Open)
            .map(|slot| {
                let channel = &self.channels[slot];
                (
                    channel.channel_id(),
                    channel.remote_cert().map(|cert| cert.der().to_vec()),
                )
            })
            .collect()
    }

    /// Number of channels in the Open state.
    pub fn open_channel_count(&self) -> usize {
        self.live
            .iter()
            .filter(|&&slot| self.channels[slot].state() == ChannelState::Open)
            .count()
    }

    /// Queues a service response on the channel. Unknown channel ids are
    /// ignored (the channel died while the response was being computed).
    pub fn send_response(&mut self, channel_id: u32, request_id: u32, payload: &[u8]) {
        let slot = match self.slot_of(channel_id) {
            Some(slot) => slot,
            None => {
                logging::debug!(self.log, "response dropped, channel gone";
                                "context" => "send_response",
                                "channel_id" => channel_id);
                return;
            }
        };

        if self.channels[slot].send_message(request_id, payload).is_err() {
            self.teardown(slot, Some((StatusCode::BadTcpInternalError, "send failed")));
        }
    }

    /// Marks a session as bound to the channel.
    pub fn bind_session(&mut self, channel_id: u32, session_id: u64) {
        if let Some(slot) = self.slot_of(channel_id) {
            self.channels[slot].bind_session(session_id);
        }
    }

    pub fn unbind_session(&mut self, channel_id: u32, session_id: u64) {
        if let Some(slot) = self.slot_of(channel_id) {
            self.channels[slot].unbind_session(session_id);
        }
    }

    /// Closes the channel with an optional ERR notification.
    pub fn close_channel(&mut self, channel_id: u32, notify: Option<(StatusCode, &str)>) {
        if let Some(slot) = self.slot_of(channel_id) {
            self.teardown(slot, notify);
        }
    }

    /// Closes every open channel the predicate selects; returns their ids.
    pub fn close_channels_where<F>(&mut self, notify: (StatusCode, &str), predicate: F) -> Vec<u32>
    where
        F: Fn(&Channel) -> bool,
    {
        let doomed: Vec<ChannelSlot> = self
            .live
            .iter()
            .copied()
            .filter(|&slot| predicate(&self.channels[slot]))
            .collect();

        let mut closed = Vec::with_capacity(doomed.len());
        for slot in doomed {
            closed.push(self.channels[slot].channel_id());
            self.teardown(slot, Some(notify));
        }
        closed
    }

    /// One tick of the event loop: housekeeping, accept, per-channel I/O and
    /// protocol processing. Certificate trust decisions for OPN handshakes
    /// run against the application PKI group.
    pub fn sync(&mut self, now: Instant, pki: &mut TrustStore) {
        if now.duration_since(self.housekeeping_time) >= self.config.housekeeping_interval {
            self.housekeeping(now);
            self.housekeeping_time = now;
        }

        self.poll
            .poll(&mut self.events, Some(Duration::from_millis(0)))
            .expect("Endpoint poll failed");

        let mut ready: Vec<(Token, bool, bool)> = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            ready.push((event.token(), event.is_readable(), event.is_writable()));
        }

        for (token, readable, writable) in ready {
            if token == LISTENER_TOKEN {
                self.accept_pending(now);
                continue;
            }

            let slot: ChannelSlot = token.0;
            if !self.live.contains(&slot) {
                continue;
            }

            if readable {
                if self.channels[slot].receive(now).has_failed_fatally() {
                    self.teardown(slot, None);
                    continue;
                }
                self.drain_channel(slot, now, pki);
            }

            if writable && self.live.contains(&slot) {
                if self.channels[slot].send(now).has_failed_fatally() {
                    self.teardown(slot, None);
                }
            }
        }

        // Flush anything the protocol processing queued
        let flush: Vec<ChannelSlot> = self.live.iter().copied().collect();
        for slot in flush {
            if self.channels[slot].has_egress() && self.channels[slot].send(now).has_failed_fatally() {
                self.teardown(slot, None);
            }
        }
    }

    fn accept_pending(&mut self, now: Instant) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let slot = match self.free.pop() {
                        Some(slot) => slot,
                        None => {
                            self.channels
                                .push(Channel::new(self.policies.clone(), self.limits, &self.log));
                            self.channels.len() - 1
                        }
                    };

                    let channel_id = self.next_channel_id;
                    self.next_channel_id += 1;

                    logging::debug!(self.log, "connection accepted";
                                    "context" => "accept",
                                    "slot" => slot,
                                    "channel_id" => channel_id,
                                    "peer" => %peer);

                    self.channels[slot].open(slot, channel_id, stream, now);
                    self.channels[slot]
                        .register(slot, self.poll.registry())
                        .expect("Stream registration failed");
                    self.live.insert(slot);
                }
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        panic!("Failure accepting connection {:?}", err);
                    }
                    break;
                }
            }
        }
    }

    /// Processes buffered chunks on one channel until it runs dry.
    fn drain_channel(&mut self, slot: ChannelSlot, now: Instant, pki: &mut TrustStore) {
        loop {
            match self.channels[slot].read() {
                Ok(ChannelEvent::Hello(_)) => {
                    if self.channels[slot].acknowledge().has_failed() {
                        self.teardown(slot, None);
                        return;
                    }
                }
                Ok(ChannelEvent::OpenRequest(request)) => {
                    // Trust decision on the client certificate
                    if let Some(cert) = &request.client_cert {
                        if let Err(status) =
                            pki.verify_certificate(pki::DEFAULT_APPLICATION_GROUP, cert.der())
                        {
                            logging::info!(self.log, "client certificate rejected";
                                           "context" => "drain_channel",
                                           "channel_id" => self.channels[slot].channel_id(),
                                           "status" => %status);
                            self.teardown(slot, Some((status, "certificate rejected")));
                            return;
                        }
                    }

                    if self.channels[slot].accept_open(&request, now).has_failed() {
                        self.teardown(slot, Some((StatusCode::BadSecurityChecksFailed, "open failed")));
                        return;
                    }

                    self.changes.push(ConnectionChange::Established {
                        channel_id: self.channels[slot].channel_id(),
                    });
                }
                Ok(ChannelEvent::Message { request_id, payload }) => {
                    self.inbound.push(InboundMessage {
                        channel_id: self.channels[slot].channel_id(),
                        request_id,
                        payload,
                    });
                }
                Ok(ChannelEvent::CloseRequest { .. }) => {
                    self.teardown(slot, None);
                    return;
                }
                Ok(ChannelEvent::RemoteError(error)) => {
                    logging::debug!(self.log, "peer error";
                                    "context" => "drain_channel",
                                    "status" => error.error,
                                    "reason" => error.reason.as_deref().unwrap_or(""));
                    self.teardown(slot, None);
                    return;
                }
                Err(NetworkError::Wait) => return,
                Err(NetworkError::Fatal(err)) => {
                    logging::info!(self.log, "channel protocol failure";
                                   "context" => "drain_channel",
                                   "channel_id" => self.channels[slot].channel_id(),
                                   "error" => ?err);
                    self.teardown(slot, Some((err.status(), "protocol failure")));
                    return;
                }
            }
        }
    }

    fn housekeeping(&mut self, now: Instant) {
        let doomed: Vec<(ChannelSlot, &'static str)> = self
            .live
            .iter()
            .copied()
            .filter_map(|slot| {
                let channel = &self.channels[slot];

                if let Some(elapsed) = channel.handshake_elapsed(now) {
                    if elapsed >= self.config.handshake_timeout {
                        return Some((slot, "handshake timeout"));
                    }
                }
                if channel.last_ingress_elapsed(now) >= self.config.inactivity_timeout {
                    return Some((slot, "inactivity timeout"));
                }
                if channel.token_expired(now) {
                    return Some((slot, "token expired"));
                }

                None
            })
            .collect();

        for (slot, reason) in doomed {
            logging::info!(self.log, "closing channel from housekeeping";
                           "context" => "housekeeping",
                           "channel_id" => self.channels[slot].channel_id(),
                           "reason" => reason);
            // Most of these peers are dead; do not bother with a notice
            self.teardown(slot, None);
        }
    }

    fn teardown(&mut self, slot: ChannelSlot, notify: Option<(StatusCode, &str)>) {
        let channel = &mut self.channels[slot];
        let channel_id = channel.channel_id();
        let bound_sessions = channel.bound_sessions().to_vec();

        drop(channel.deregister(self.poll.registry()));
        channel.close(notify);

        self.live.shift_remove(&slot);
        self.free.push(slot);
        self.changes.push(ConnectionChange::Closed {
            channel_id,
            bound_sessions,
        });
    }

    fn slot_of(&self, channel_id: u32) -> Option<ChannelSlot> {
        self.live
            .iter()
            .copied()
            .find(|&slot| self.channels[slot].channel_id() == channel_id)
    }
}

trait FatalCheck {
    fn has_failed_fatally(&self) -> bool;
}

impl<T> FatalCheck for NetworkResult<T> {
    #[inline]
    fn has_failed_fatally(&self) -> bool {
        matches!(self, Err(NetworkError::Fatal(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::frame::{
        self, ChunkHeader, ChunkType, HelloMessage, MessageType,
    };
    use crate::net::support::Serialize;
    use crate::net::PolicyEntry;
    use flint::policy::{MessageSecurityMode, PolicyKind, SecurityPolicy};
    use std::io::{Cursor, Read, Write};

    fn none_policies() -> Rc<PolicySet> {
        Rc::new(PolicySet::new(vec![PolicyEntry {
            policy: Rc::new(SecurityPolicy::new(PolicyKind::None)),
            mode: MessageSecurityMode::None,
        }]))
    }

    #[test]
    fn test_accept_hello_ack_over_tcp() {
        let mut endpoint = Endpoint::new(
            "127.0.0.1:0",
            none_policies(),
            TransportLimits::default(),
            EndpointConfig::default(),
            None,
        )
        .unwrap();
        let mut pki = TrustStore::with_default_groups(65536, 100, None);

        let address = endpoint.local_addr().unwrap();
        let mut client = std::net::TcpStream::connect(address).unwrap();
        client.set_nodelay(true).unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();

        // Client greeting
        let hello = HelloMessage {
            protocol_version: 0,
            receive_buffer_size: 65536,
            send_buffer_size: 65536,
            max_message_size: 0,
            max_chunk_count: 0,
            endpoint_url: Some(format!("opc.tcp://{}/", address)),
        };
        let mut body = Cursor::new(Vec::new());
        hello.serialize(&mut body).unwrap();
        let body = body.into_inner();

        let mut chunk = vec![0u8; frame::MESSAGE_HEADER_SIZE];
        ChunkHeader {
            message_type: MessageType::Hello,
            chunk_type: ChunkType::Final,
            size: (frame::MESSAGE_HEADER_SIZE + body.len()) as u32,
        }
        .write_to(&mut chunk);
        chunk.extend_from_slice(&body);
        client.write_all(&chunk).unwrap();

        // Pump the endpoint until the ACK comes back
        let mut response = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while response.len() < frame::MESSAGE_HEADER_SIZE && Instant::now() < deadline {
            endpoint.sync(Instant::now(), &mut pki);

            let mut buffer = [0u8; 256];
            match client.read(&mut buffer) {
                Ok(read) => response.extend_from_slice(&buffer[..read]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => (),
                Err(err) if err.kind() == io::ErrorKind::TimedOut => (),
                Err(err) => panic!("Client read failed: {:?}", err),
            }
        }

        let header = ChunkHeader::peek(&response).unwrap();
        assert_eq!(header.message_type, MessageType::Acknowledge);
    }

    #[test]
    fn test_handshake_timeout_closes_channel() {
        let mut endpoint = Endpoint::new(
            "127.0.0.1:0",
            none_policies(),
            TransportLimits::default(),
            EndpointConfig {
                handshake_timeout: Duration::from_millis(10),
                housekeeping_interval: Duration::from_millis(1),
                ..EndpointConfig::default()
            },
            None,
        )
        .unwrap();
        let mut pki = TrustStore::with_default_groups(65536, 100, None);

        let address = endpoint.local_addr().unwrap();
        let _client = std::net::TcpStream::connect(address).unwrap();

        // Let the accept land
        let deadline = Instant::now() + Duration::from_secs(5);
        while endpoint.live.is_empty() && Instant::now() < deadline {
            endpoint.sync(Instant::now(), &mut pki);
        }
        assert_eq!(endpoint.live.len(), 1);

        // The client never sends HEL; housekeeping reaps it
        std::thread::sleep(Duration::from_millis(20));
        endpoint.sync(Instant::now(), &mut pki);

        assert!(endpoint.live.is_empty());
        let closed = endpoint
            .changes()
            .filter(|change| matches!(change, ConnectionChange::Closed { .. }))
            .count();
        assert_eq!(closed, 1);
    }
}
