//! The server object: wires the endpoint, sessions, PKI, GDS, async table,
//! batching and scheduler together and drives them from a single-threaded
//! tick loop.

use crate::config::ServerConfig;
use crate::services;
use flint::cert::Certificate;
use flint::crypto;
use flint::logging;
use flint::policy::{PolicyKind, SecurityPolicy};
use girder::asyncop::{AsyncOperationTable, CompletedOperation, OperationKind};
use girder::batch::{BatchCoalescer, BatchConfig};
use girder::gds::{GdsConfig, GdsManager};
use girder::net::channel::TransportLimits;
use girder::net::endpoint::{ConnectionChange, Endpoint, EndpointConfig};
use girder::net::{PolicyEntry, PolicySet};
use girder::pki::{TrustStore, DEFAULT_APPLICATION_GROUP};
use girder::scheduler::{Scheduler, SchedulerOp};
use girder::service::{self, service_ids, DispatchResult, ServiceDispatcher, ServiceState};
use girder::session::{SessionConfig, SessionManager, UserAccount};
use girder::status::StatusCode;
use hashbrown::HashMap;
use rsa::RsaPrivateKey;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// A read operation queued in the batching coalescer.
#[derive(Debug, Copy, Clone)]
pub struct ReadOp {
    pub node_id: u32,
}

/// Work a service handler wants done after its response has flushed.
#[derive(Debug, Copy, Clone)]
pub enum DeferredAction {
    /// The server identity rotated: every channel must re-handshake.
    TeardownAll,
    /// The trust list changed: close channels whose peer no longer verifies.
    TeardownUntrusted,
}

/// Delay before a deferred teardown runs, so the triggering response can
/// leave over the old channel first.
const TEARDOWN_DELAY: Duration = Duration::from_millis(100);

/// Everything the handlers and timers operate on.
pub struct ServerCore {
    pub config: ServerConfig,
    pub endpoint: Endpoint,
    pub sessions: SessionManager,
    pub pki: TrustStore,
    pub gds: GdsManager,
    pub asyncop: AsyncOperationTable,
    pub read_batch: BatchCoalescer<ReadOp>,
    /// Demo attribute store standing in for the external node store.
    pub variables: HashMap<u32, u32>,
    pub identity: Option<(Certificate, RsaPrivateKey)>,
    pub policies: Rc<PolicySet>,
    pub server_cert_der: Vec<u8>,
    pub async_op_timeout: Duration,
    pub completions: Vec<CompletedOperation>,
    pub deferred: Vec<DeferredAction>,
    pub gds_sweep_registered: bool,
    pub log: logging::Logger,
}

impl ServiceState for ServerCore {
    #[inline]
    fn sessions(&mut self) -> &mut SessionManager {
        &mut self.sessions
    }
}

pub struct Server {
    core: ServerCore,
    dispatcher: ServiceDispatcher<ServerCore>,
    scheduler: Scheduler<ServerCore>,
}

/// Builds the exposed policy set from the resolved config entries and the
/// server identity. Secured policies without an identity are an error.
pub fn build_policy_set(
    resolved: &[(PolicyKind, flint::policy::MessageSecurityMode)],
    identity: Option<&(Certificate, RsaPrivateKey)>,
) -> Result<Rc<PolicySet>, String> {
    let mut entries = Vec::with_capacity(resolved.len());

    for &(kind, mode) in resolved {
        let policy = if kind == PolicyKind::None {
            SecurityPolicy::new(kind)
        } else {
            let (cert, key) = identity
                .ok_or_else(|| format!("Policy {:?} requires a server certificate", kind))?;
            SecurityPolicy::with_identity(kind, cert.clone(), key.clone())
                .map_err(|err| format!("Invalid server identity: {}", err))?
        };

        entries.push(PolicyEntry {
            policy: Rc::new(policy),
            mode,
        });
    }

    Ok(Rc::new(PolicySet::new(entries)))
}

impl Server {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        config: ServerConfig,
        log: L,
    ) -> Result<Server, String> {
        let log = logging::child(log);

        let identity = match (&config.security.certificate_file, &config.security.private_key_file) {
            (Some(cert_path), Some(key_path)) => {
                let cert_bytes = std::fs::read(cert_path)
                    .map_err(|err| format!("Error reading certificate {}: {}", cert_path, err))?;
                let key_bytes = std::fs::read(key_path)
                    .map_err(|err| format!("Error reading private key {}: {}", key_path, err))?;

                let cert = Certificate::parse(&cert_bytes)
                    .map_err(|err| format!("Error parsing certificate: {}", err))?;
                let key = crypto::parse_private_key(&key_bytes)
                    .map_err(|err| format!("Error parsing private key: {}", err))?;
                Some((cert, key))
            }
            (None, None) => None,
            _ => return Err("Certificate and private key must be configured together".to_string()),
        };

        let resolved = config.resolved_policies()?;
        let policies = build_policy_set(&resolved, identity.as_ref())?;

        let limits = TransportLimits {
            receive_buffer_size: config.transport.receive_buffer_size,
            send_buffer_size: config.transport.send_buffer_size,
            max_message_size: config.transport.max_message_size,
            max_chunk_count: config.transport.max_chunk_count,
            max_token_lifetime_ms: config.transport.max_token_lifetime_ms,
        };
        let endpoint_config = EndpointConfig {
            handshake_timeout: config.handshake_timeout(),
            inactivity_timeout: config.inactivity_timeout(),
            ..EndpointConfig::default()
        };

        let endpoint = Endpoint::new(
            &config.server.address,
            policies.clone(),
            limits,
            endpoint_config,
            &log,
        )
        .map_err(|err| format!("Error binding endpoint: {:?}", err))?;

        let users: HashMap<String, UserAccount> = config
            .users
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    UserAccount {
                        password: spec.password.clone(),
                        roles: ServerConfig::resolve_roles(&spec.roles),
                    },
                )
            })
            .collect();

        let sessions = SessionManager::new(
            SessionConfig {
                max_sessions: config.session.max_sessions,
                max_timeout: Duration::from_millis(config.session.max_timeout_ms),
                default_timeout: Duration::from_millis(config.session.default_timeout_ms),
                reject_concurrent_requests: config.session.reject_concurrent_requests,
                admin_thumbprints: config.session.admin_thumbprints.clone(),
                ..SessionConfig::default()
            },
            users,
            &log,
        );

        let pki = TrustStore::with_default_groups(
            config.pki.max_trust_list_size,
            config.pki.max_rejected_list_size,
            &log,
        );
        let gds = GdsManager::new(
            GdsConfig {
                check_session_interval: Duration::from_millis(config.gds.check_session_interval_ms),
            },
            &log,
        );
        let asyncop = AsyncOperationTable::new(&log);
        let read_batch = BatchCoalescer::new(
            OperationKind(service_ids::READ),
            BatchConfig {
                max_batch: config.batch.max_batch_size,
                timeout: Duration::from_millis(config.batch.timeout_ms),
            },
        );

        let mut dispatcher = ServiceDispatcher::new(&log);
        services::register_all(&mut dispatcher);

        let mut scheduler = Scheduler::new(&log);
        let now = Instant::now();

        // Expiry sweeps for parked operations and idle sessions
        scheduler.add_repeated(now, Duration::from_secs(1), |core: &mut ServerCore| {
            let now = Instant::now();

            let swept = core.asyncop.sweep(now);
            core.completions.extend(swept);

            for session_id in core.sessions.sweep(now) {
                let cancelled = core.asyncop.cancel_session(session_id, StatusCode::BadSessionClosed);
                core.completions.extend(cancelled);
            }

            SchedulerOp::Continue
        });

        let server_cert_der = identity
            .as_ref()
            .map(|(cert, _)| cert.der().to_vec())
            .unwrap_or_default();
        let async_op_timeout = Duration::from_millis(config.async_ops.operation_timeout_ms);

        logging::info!(log, "server assembled";
                       "context" => "new",
                       "address" => &config.server.address,
                       "policies" => resolved.len(),
                       "secured" => identity.is_some());

        Ok(Server {
            core: ServerCore {
                config,
                endpoint,
                sessions,
                pki,
                gds,
                asyncop,
                read_batch,
                variables: HashMap::new(),
                identity,
                policies,
                server_cert_der,
                async_op_timeout,
                completions: Vec::new(),
                deferred: Vec::new(),
                gds_sweep_registered: false,
                log: log.clone(),
            },
            dispatcher,
            scheduler,
        })
    }

    #[inline]
    pub fn core(&self) -> &ServerCore {
        &self.core
    }

    #[inline]
    pub fn core_mut(&mut self) -> &mut ServerCore {
        &mut self.core
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.core.endpoint.local_addr()
    }

    /// One pass of the event loop. Everything runs to completion; only the
    /// network suspends.
    pub fn tick(&mut self, now: Instant) {
        let core = &mut self.core;

        core.endpoint.sync(now, &mut core.pki);

        // Connectivity changes: detach sessions, cancel parked work
        let changes: Vec<ConnectionChange> = core.endpoint.changes().collect();
        for change in changes {
            match change {
                ConnectionChange::Established { channel_id } => {
                    logging::debug!(core.log, "secure channel established";
                                    "context" => "tick",
                                    "channel_id" => channel_id);
                }
                ConnectionChange::Closed { channel_id, .. } => {
                    core.sessions.detach_channel(channel_id);

                    // The responses are undeliverable; release the request
                    // slots and drop the completions
                    for op in core
                        .asyncop
                        .cancel_channel(channel_id, StatusCode::BadSecureChannelClosed)
                    {
                        core.sessions.end_request(op.ctx.session_id);
                    }
                }
            }
        }

        // Service dispatch
        let messages: Vec<_> = core.endpoint.drain_messages().collect();
        for message in messages {
            match self.dispatcher.dispatch(
                core,
                message.channel_id,
                message.request_id,
                &message.payload,
                now,
            ) {
                DispatchResult::Respond(response) => {
                    core.endpoint
                        .send_response(message.channel_id, message.request_id, &response);
                }
                DispatchResult::Parked { .. } => (),
            }
        }

        // Timers
        self.scheduler.process(now, core);

        // Batch timeout flush
        if matches!(core.read_batch.next_deadline(), Some(deadline) if deadline <= now) {
            services::flush_read_batch(core, now);
        }

        // GDS liveness sweep registration follows transaction/handle state
        if core.gds.needs_liveness_sweep() && !core.gds_sweep_registered {
            core.gds_sweep_registered = true;
            let interval = core.gds.config().check_session_interval;
            self.scheduler.add_repeated(now, interval, |core: &mut ServerCore| {
                if core.gds.sweep_dead_sessions(&core.sessions) {
                    SchedulerOp::Continue
                } else {
                    core.gds_sweep_registered = false;
                    SchedulerOp::Remove
                }
            });
        }

        // Deferred channel teardowns from commit hooks
        let deferred: Vec<DeferredAction> = core.deferred.drain(..).collect();
        for action in deferred {
            match action {
                DeferredAction::TeardownAll => {
                    self.scheduler.add_once(now, TEARDOWN_DELAY, |core: &mut ServerCore| {
                        let closed = core.endpoint.close_channels_where(
                            (StatusCode::BadSecureChannelClosed, "server certificate changed"),
                            |_| true,
                        );
                        logging::info!(core.log, "channels closed after certificate rotation";
                                       "context" => "teardown",
                                       "count" => closed.len());
                        SchedulerOp::Continue
                    });
                }
                DeferredAction::TeardownUntrusted => {
                    self.scheduler.add_once(now, TEARDOWN_DELAY, |core: &mut ServerCore| {
                        for (channel_id, cert) in core.endpoint.open_channel_certs() {
                            let der = match cert {
                                Some(der) => der,
                                None => continue,
                            };

                            if core
                                .pki
                                .verify_certificate(DEFAULT_APPLICATION_GROUP, &der)
                                .is_err()
                            {
                                core.endpoint.close_channel(
                                    channel_id,
                                    Some((StatusCode::BadSecureChannelClosed, "trust revoked")),
                                );
                            }
                        }
                        SchedulerOp::Continue
                    });
                }
            }
        }

        // Flush async completions to the wire
        let completions = std::mem::take(&mut core.completions);
        for op in completions {
            let response = match op.result {
                Ok(body) => {
                    service::encode_response(op.ctx.kind.0, op.ctx.request_handle, StatusCode::Good, &body)
                }
                Err(status) => service::encode_fault(op.ctx.request_handle, status),
            };

            core.endpoint
                .send_response(op.ctx.channel_id, op.ctx.request_id, &response);
            core.sessions.end_request(op.ctx.session_id);
        }
    }

    /// Drives the tick loop forever.
    pub fn run(&mut self) -> ! {
        logging::info!(self.core.log, "server running"; "context" => "run");

        loop {
            self.tick(Instant::now());
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}
