//! Session lifecycle: creation, activation with identity proof, rebinding
//! across channels and timeout enforcement.
//!
//! Sessions and channels reference each other by id only; the manager owns
//! the sessions, the endpoint owns the channels.

use crate::pki::{self, TrustStore};
use crate::status::StatusCode;
use flint::cert::Certificate;
use flint::choose;
use flint::crypto::{self, RsaSigAlg};
use flint::logging;
use hashbrown::HashMap;
use std::time::{Duration, Instant};

pub type SessionId = u64;

pub const AUTH_TOKEN_SIZE: usize = 32;

/// Role bits carried by an authenticated session.
pub mod roles {
    pub const OBSERVER: u32 = 0x01;
    pub const OPERATOR: u32 = 0x02;
    pub const CONFIGURE_ADMIN: u32 = 0x04;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Created,
    Activated,
    Closed,
}

/// The resolved identity of an activated session.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UserIdentity {
    Anonymous,
    UserName(String),
    X509 { thumbprint: Vec<u8> },
}

/// The identity token presented by ActivateSession.
#[derive(Debug, Clone)]
pub enum ActivationIdentity {
    Anonymous,
    UserName { user: String, password: String },
    X509 { cert_der: Vec<u8>, signature: Vec<u8> },
}

/// A configured user account for the username token policy.
#[derive(Debug, Clone)]
pub struct UserAccount {
    pub password: String,
    pub roles: u32,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub max_timeout: Duration,
    pub default_timeout: Duration,
    /// Reject a second in-flight request on a session instead of queueing.
    pub reject_concurrent_requests: bool,
    /// Roles granted to certificate-authenticated users.
    pub x509_roles: u32,
    /// Thumbprints (hex, lowercase) elevated to ConfigureAdmin.
    pub admin_thumbprints: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            max_sessions: 100,
            max_timeout: Duration::from_secs(3600),
            default_timeout: Duration::from_secs(60),
            reject_concurrent_requests: true,
            x509_roles: roles::OBSERVER | roles::OPERATOR,
            admin_thumbprints: Vec::new(),
        }
    }
}

/// A browse/query continuation point owned by the session.
#[derive(Debug, Clone)]
pub struct ContinuationPoint {
    pub id: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, Default, Clone)]
pub struct SessionDiagnostics {
    pub request_count: u64,
    pub error_count: u64,
}

pub struct Session {
    id: SessionId,
    auth_token: [u8; AUTH_TOKEN_SIZE],
    display_name: String,
    state: SessionState,
    channel_id: Option<u32>,
    identity: UserIdentity,
    locale_ids: Vec<String>,
    roles: u32,
    timeout: Duration,
    deadline: Instant,
    server_nonce: Vec<u8>,
    client_cert: Option<Certificate>,
    in_flight: bool,
    diagnostics: SessionDiagnostics,
    continuation_points: Vec<ContinuationPoint>,
}

impl Session {
    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    #[inline]
    pub fn channel_id(&self) -> Option<u32> {
        self.channel_id
    }

    #[inline]
    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    #[inline]
    pub fn locale_ids(&self) -> &[String] {
        &self.locale_ids
    }

    #[inline]
    pub fn roles(&self) -> u32 {
        self.roles
    }

    #[inline]
    pub fn has_role(&self, role: u32) -> bool {
        self.roles & role == role
    }

    #[inline]
    pub fn diagnostics(&self) -> &SessionDiagnostics {
        &self.diagnostics
    }

    #[inline]
    pub fn server_nonce(&self) -> &[u8] {
        &self.server_nonce
    }

    pub fn add_continuation_point(&mut self, point: ContinuationPoint) {
        self.continuation_points.retain(|existing| existing.id != point.id);
        self.continuation_points.push(point);
    }

    pub fn take_continuation_point(&mut self, id: &[u8]) -> Option<ContinuationPoint> {
        let index = self.continuation_points.iter().position(|point| point.id == id)?;
        Some(self.continuation_points.remove(index))
    }
}

/// Result of CreateSession handed back to the wire layer.
#[derive(Debug)]
pub struct CreatedSession {
    pub session_id: SessionId,
    pub auth_token: Vec<u8>,
    pub server_nonce: Vec<u8>,
    pub revised_timeout: Duration,
}

pub struct SessionManager {
    sessions: HashMap<SessionId, Session>,
    token_index: HashMap<[u8; AUTH_TOKEN_SIZE], SessionId>,
    users: HashMap<String, UserAccount>,
    config: SessionConfig,
    next_id: SessionId,
    log: logging::Logger,
}

impl SessionManager {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        config: SessionConfig,
        users: HashMap<String, UserAccount>,
        log: L,
    ) -> SessionManager {
        SessionManager {
            sessions: HashMap::new(),
            token_index: HashMap::new(),
            users,
            config,
            next_id: 1,
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    #[inline]
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Creates a session in the Created state. It cannot carry requests
    /// until activated.
    pub fn create_session(
        &mut self,
        display_name: &str,
        requested_timeout: Duration,
        client_cert: Option<Certificate>,
        now: Instant,
    ) -> Result<CreatedSession, StatusCode> {
        if self.sessions.len() >= self.config.max_sessions {
            return Err(StatusCode::BadTooManySessions);
        }

        let timeout = choose!(requested_timeout.as_millis() == 0 => self.config.default_timeout,
                              requested_timeout.min(self.config.max_timeout));

        let mut auth_token = [0u8; AUTH_TOKEN_SIZE];
        crypto::random_bytes(&mut auth_token);
        let server_nonce = crypto::random_vec(32);

        let id = self.next_id;
        self.next_id += 1;

        let session = Session {
            id,
            auth_token,
            display_name: display_name.to_string(),
            state: SessionState::Created,
            channel_id: None,
            identity: UserIdentity::Anonymous,
            locale_ids: Vec::new(),
            roles: 0,
            timeout,
            deadline: now + timeout,
            server_nonce: server_nonce.clone(),
            client_cert,
            in_flight: false,
            diagnostics: SessionDiagnostics::default(),
            continuation_points: Vec::new(),
        };

        self.token_index.insert(auth_token, id);
        self.sessions.insert(id, session);

        logging::info!(self.log, "session created";
                       "context" => "create_session",
                       "session_id" => id,
                       "display_name" => display_name,
                       "timeout_ms" => timeout.as_millis() as u64);

        Ok(CreatedSession {
            session_id: id,
            auth_token: auth_token.to_vec(),
            server_nonce,
            revised_timeout: timeout,
        })
    }

    /// Activates (or rebinds) a session: validates the identity token, for
    /// x509 checks possession by verifying the signature over
    /// server-certificate | server-nonce, and binds the session to the
    /// calling channel. Returns the session id and a fresh server nonce.
    #[allow(clippy::too_many_arguments)]
    pub fn activate_session(
        &mut self,
        auth_token: &[u8],
        channel_id: u32,
        identity: ActivationIdentity,
        locale_ids: Vec<String>,
        server_cert_der: &[u8],
        pki: &mut TrustStore,
        now: Instant,
    ) -> Result<(SessionId, Vec<u8>), StatusCode> {
        let id = self.lookup_token(auth_token)?;
        let config = self.config.clone();

        // Resolve identity before touching session state
        let (resolved, roles) = match identity {
            ActivationIdentity::Anonymous => (UserIdentity::Anonymous, roles::OBSERVER),
            ActivationIdentity::UserName { user, password } => {
                let account = self
                    .users
                    .get(&user)
                    .ok_or(StatusCode::BadIdentityTokenRejected)?;
                if account.password != password {
                    return Err(StatusCode::BadIdentityTokenRejected);
                }
                (UserIdentity::UserName(user), account.roles)
            }
            ActivationIdentity::X509 { cert_der, signature } => {
                pki.verify_certificate(pki::DEFAULT_USER_TOKEN_GROUP, &cert_der)
                    .map_err(|_| StatusCode::BadIdentityTokenRejected)?;

                let cert = Certificate::parse(&cert_der)
                    .map_err(|_| StatusCode::BadIdentityTokenInvalid)?;

                let session = self.sessions.get(&id).expect("Token index is consistent");
                let mut signed = server_cert_der.to_vec();
                signed.extend_from_slice(&session.server_nonce);

                crypto::rsa_verify(cert.public_key(), RsaSigAlg::Pkcs1v15Sha256, &signed, &signature)
                    .map_err(|_| StatusCode::BadIdentityTokenRejected)?;

                let thumbprint = hex(cert.thumbprint());
                let mut granted = config.x509_roles;
                if config.admin_thumbprints.contains(&thumbprint) {
                    granted |= roles::CONFIGURE_ADMIN;
                }

                (
                    UserIdentity::X509 {
                        thumbprint: cert.thumbprint().to_vec(),
                    },
                    granted,
                )
            }
        };

        let server_nonce = crypto::random_vec(32);
        let session = self.sessions.get_mut(&id).expect("Token index is consistent");

        // Rebinding to a different channel is an atomic swap
        session.channel_id = Some(channel_id);
        session.state = SessionState::Activated;
        session.identity = resolved;
        session.locale_ids = locale_ids;
        session.roles = roles;
        session.deadline = now + session.timeout;
        session.server_nonce = server_nonce.clone();

        logging::info!(self.log, "session activated";
                       "context" => "activate_session",
                       "session_id" => id,
                       "channel_id" => channel_id,
                       "identity" => ?session.identity);

        Ok((id, server_nonce))
    }

    /// Validates the auth token of an inbound request, checks activation and
    /// channel binding, and refreshes the timeout.
    pub fn validate_request(
        &mut self,
        auth_token: &[u8],
        channel_id: u32,
        now: Instant,
    ) -> Result<SessionId, StatusCode> {
        let id = self.lookup_token(auth_token)?;
        let session = self.sessions.get_mut(&id).expect("Token index is consistent");

        if session.state != SessionState::Activated {
            return Err(StatusCode::BadSessionNotActivated);
        }

        match session.channel_id {
            Some(bound) if bound == channel_id => (),
            _ => return Err(StatusCode::BadSessionNotActivated),
        }

        session.deadline = now + session.timeout;
        session.diagnostics.request_count += 1;
        Ok(id)
    }

    /// Claims the session's single in-flight request slot.
    pub fn begin_request(&mut self, id: SessionId) -> Result<(), StatusCode> {
        let session = self.sessions.get_mut(&id).ok_or(StatusCode::BadSessionIdInvalid)?;

        if session.in_flight && self.config.reject_concurrent_requests {
            return Err(StatusCode::BadTooManyOperations);
        }

        session.in_flight = true;
        Ok(())
    }

    pub fn end_request(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.in_flight = false;
        }
    }

    /// Closes and destroys a session.
    pub fn close_session(&mut self, id: SessionId) -> Result<(), StatusCode> {
        let session = self.sessions.remove(&id).ok_or(StatusCode::BadSessionIdInvalid)?;
        self.token_index.remove(&session.auth_token);

        logging::info!(self.log, "session closed";
                       "context" => "close_session",
                       "session_id" => id,
                       "requests" => session.diagnostics.request_count);
        Ok(())
    }

    /// Unbinds every session currently bound to the channel. The sessions
    /// survive, unbound, until their own timeout.
    pub fn detach_channel(&mut self, channel_id: u32) -> Vec<SessionId> {
        let mut detached = Vec::new();

        for session in self.sessions.values_mut() {
            if session.channel_id == Some(channel_id) {
                session.channel_id = None;
                detached.push(session.id);
            }
        }

        detached
    }

    /// Destroys sessions whose deadline has passed. Returns the destroyed
    /// ids for the caller to cancel their parked operations.
    pub fn sweep(&mut self, now: Instant) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| session.deadline <= now)
            .map(|session| session.id)
            .collect();

        for &id in &expired {
            if let Some(session) = self.sessions.remove(&id) {
                self.token_index.remove(&session.auth_token);
                logging::info!(self.log, "session timed out";
                               "context" => "sweep",
                               "session_id" => id);
            }
        }

        expired
    }

    /// True if the session still exists (GDS liveness checks).
    #[inline]
    pub fn is_alive(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    fn lookup_token(&self, auth_token: &[u8]) -> Result<SessionId, StatusCode> {
        if auth_token.len() != AUTH_TOKEN_SIZE {
            return Err(StatusCode::BadSessionIdInvalid);
        }

        let mut token = [0u8; AUTH_TOKEN_SIZE];
        token.copy_from_slice(auth_token);

        self.token_index
            .get(&token)
            .copied()
            .ok_or(StatusCode::BadSessionIdInvalid)
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use flint::forge;
    use lazy_static::lazy_static;
    use rsa::RsaPrivateKey;

    lazy_static! {
        static ref USER_KEY: RsaPrivateKey = crypto::generate_rsa_key(2048).unwrap();
    }

    fn manager() -> SessionManager {
        let mut users = HashMap::new();
        users.insert(
            "operator".to_string(),
            UserAccount {
                password: "hunter2".to_string(),
                roles: roles::OBSERVER | roles::OPERATOR,
            },
        );
        users.insert(
            "admin".to_string(),
            UserAccount {
                password: "tetrahedron".to_string(),
                roles: roles::OBSERVER | roles::OPERATOR | roles::CONFIGURE_ADMIN,
            },
        );

        SessionManager::new(SessionConfig::default(), users, None)
    }

    fn pki() -> TrustStore {
        TrustStore::with_default_groups(65536, 100, None)
    }

    #[test]
    fn test_create_clamps_timeout() {
        let mut manager = manager();
        let now = Instant::now();

        let created = manager
            .create_session("clamped", Duration::from_secs(100_000), None, now)
            .unwrap();

        assert_eq!(created.revised_timeout, Duration::from_secs(3600));
        assert_eq!(created.auth_token.len(), AUTH_TOKEN_SIZE);
        assert_eq!(created.server_nonce.len(), 32);
    }

    #[test]
    fn test_create_err_too_many_sessions() {
        let mut manager = SessionManager::new(
            SessionConfig {
                max_sessions: 1,
                ..SessionConfig::default()
            },
            HashMap::new(),
            None,
        );
        let now = Instant::now();

        manager.create_session("one", Duration::from_secs(60), None, now).unwrap();
        assert_eq!(
            manager
                .create_session("two", Duration::from_secs(60), None, now)
                .unwrap_err(),
            StatusCode::BadTooManySessions
        );
    }

    #[test]
    fn test_activate_username_and_validate() {
        let mut manager = manager();
        let mut pki = pki();
        let now = Instant::now();

        let created = manager
            .create_session("user-session", Duration::from_secs(60), None, now)
            .unwrap();

        // Not usable before activation
        assert_eq!(
            manager
                .validate_request(&created.auth_token, 1, now)
                .unwrap_err(),
            StatusCode::BadSessionNotActivated
        );

        manager
            .activate_session(
                &created.auth_token,
                1,
                ActivationIdentity::UserName {
                    user: "operator".to_string(),
                    password: "hunter2".to_string(),
                },
                vec!["en".to_string()],
                b"server-cert",
                &mut pki,
                now,
            )
            .unwrap();

        let id = manager.validate_request(&created.auth_token, 1, now).unwrap();
        let session = manager.get(id).unwrap();
        assert_eq!(session.state(), SessionState::Activated);
        assert!(session.has_role(roles::OPERATOR));
        assert!(!session.has_role(roles::CONFIGURE_ADMIN));
        assert_eq!(session.locale_ids(), &["en".to_string()]);
    }

    #[test]
    fn test_activate_err_bad_password() {
        let mut manager = manager();
        let mut pki = pki();
        let now = Instant::now();

        let created = manager
            .create_session("bad-pass", Duration::from_secs(60), None, now)
            .unwrap();

        assert_eq!(
            manager
                .activate_session(
                    &created.auth_token,
                    1,
                    ActivationIdentity::UserName {
                        user: "operator".to_string(),
                        password: "wrong".to_string(),
                    },
                    Vec::new(),
                    b"server-cert",
                    &mut pki,
                    now,
                )
                .unwrap_err(),
            StatusCode::BadIdentityTokenRejected
        );
    }

    #[test]
    fn test_activate_x509_possession_proof() {
        let mut config = SessionConfig::default();
        let cert = forge::create_self_signed(&*USER_KEY, "CN=x509-user", &[], 365).unwrap();
        config.admin_thumbprints.push(hex(cert.thumbprint()));

        let mut manager = SessionManager::new(config, HashMap::new(), None);
        let mut pki = pki();
        let now = Instant::now();

        let created = manager
            .create_session("x509-session", Duration::from_secs(60), None, now)
            .unwrap();

        let server_cert = b"server-cert-der";
        let mut signed = server_cert.to_vec();
        signed.extend_from_slice(&created.server_nonce);
        let signature =
            crypto::rsa_sign(&*USER_KEY, RsaSigAlg::Pkcs1v15Sha256, &signed).unwrap();

        manager
            .activate_session(
                &created.auth_token,
                2,
                ActivationIdentity::X509 {
                    cert_der: cert.der().to_vec(),
                    signature,
                },
                Vec::new(),
                server_cert,
                &mut pki,
                now,
            )
            .unwrap();

        let id = manager.validate_request(&created.auth_token, 2, now).unwrap();
        assert!(manager.get(id).unwrap().has_role(roles::CONFIGURE_ADMIN));
    }

    #[test]
    fn test_activate_x509_err_wrong_key() {
        let mut manager = manager();
        let mut pki = pki();
        let now = Instant::now();

        let cert = forge::create_self_signed(&*USER_KEY, "CN=x509-user", &[], 365).unwrap();
        let created = manager
            .create_session("x509-bad", Duration::from_secs(60), None, now)
            .unwrap();

        // Signature over the wrong nonce
        let signature =
            crypto::rsa_sign(&*USER_KEY, RsaSigAlg::Pkcs1v15Sha256, b"not the nonce").unwrap();

        assert_eq!(
            manager
                .activate_session(
                    &created.auth_token,
                    1,
                    ActivationIdentity::X509 {
                        cert_der: cert.der().to_vec(),
                        signature,
                    },
                    Vec::new(),
                    b"server-cert",
                    &mut pki,
                    now,
                )
                .unwrap_err(),
            StatusCode::BadIdentityTokenRejected
        );
    }

    #[test]
    fn test_rebind_across_channels() {
        let mut manager = manager();
        let mut pki = pki();
        let now = Instant::now();

        let created = manager
            .create_session("rebind", Duration::from_secs(60), None, now)
            .unwrap();
        manager
            .activate_session(
                &created.auth_token,
                1,
                ActivationIdentity::Anonymous,
                Vec::new(),
                b"server-cert",
                &mut pki,
                now,
            )
            .unwrap();

        manager.validate_request(&created.auth_token, 1, now).unwrap();

        // The channel died; the session survives unbound
        let detached = manager.detach_channel(1);
        assert_eq!(detached.len(), 1);
        assert_eq!(
            manager
                .validate_request(&created.auth_token, 1, now)
                .unwrap_err(),
            StatusCode::BadSessionNotActivated
        );

        // Reactivation on a new channel rebinds
        manager
            .activate_session(
                &created.auth_token,
                2,
                ActivationIdentity::Anonymous,
                Vec::new(),
                b"server-cert",
                &mut pki,
                now,
            )
            .unwrap();
        manager.validate_request(&created.auth_token, 2, now).unwrap();

        // Requests over the old channel stay rejected
        assert!(manager.validate_request(&created.auth_token, 1, now).is_err());
    }

    #[test]
    fn test_timeout_sweep_destroys_session() {
        let mut manager = manager();
        let mut pki = pki();
        let now = Instant::now();

        let created = manager
            .create_session("doomed", Duration::from_secs(1), None, now)
            .unwrap();
        manager
            .activate_session(
                &created.auth_token,
                1,
                ActivationIdentity::Anonymous,
                Vec::new(),
                b"server-cert",
                &mut pki,
                now,
            )
            .unwrap();

        // Activity extends the deadline
        manager
            .validate_request(&created.auth_token, 1, now + Duration::from_millis(500))
            .unwrap();
        assert!(manager.sweep(now + Duration::from_millis(1400)).is_empty());

        let expired = manager.sweep(now + Duration::from_millis(1600));
        assert_eq!(expired.len(), 1);

        assert_eq!(
            manager
                .validate_request(&created.auth_token, 1, now + Duration::from_secs(2))
                .unwrap_err(),
            StatusCode::BadSessionIdInvalid
        );
    }

    #[test]
    fn test_single_request_in_flight() {
        let mut manager = manager();
        let now = Instant::now();

        let created = manager
            .create_session("serial", Duration::from_secs(60), None, now)
            .unwrap();
        let id = created.session_id;

        manager.begin_request(id).unwrap();
        assert_eq!(
            manager.begin_request(id).unwrap_err(),
            StatusCode::BadTooManyOperations
        );

        manager.end_request(id);
        manager.begin_request(id).unwrap();
    }

    #[test]
    fn test_continuation_points() {
        let mut manager = manager();
        let now = Instant::now();

        let created = manager
            .create_session("browse", Duration::from_secs(60), None, now)
            .unwrap();
        let session = manager.get_mut(created.session_id).unwrap();

        session.add_continuation_point(ContinuationPoint {
            id: vec![1],
            data: vec![10],
        });
        session.add_continuation_point(ContinuationPoint {
            id: vec![1],
            data: vec![20],
        });

        // Same id replaces
        let point = session.take_continuation_point(&[1]).unwrap();
        assert_eq!(point.data, vec![20]);
        assert!(session.take_continuation_point(&[1]).is_none());
    }
}
