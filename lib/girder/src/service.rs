//! Service request dispatch.
//!
//! A reassembled MSG payload is `service id | request header | body`. The
//! dispatcher decodes the header, resolves and checks the session, routes to
//! the registered handler and encodes the response envelope. A handler may
//! answer inline or park the operation and complete it later through the
//! async operation table.

use crate::codec;
use crate::net::support::{NetworkResult, SizedRead, SizedWrite};
use crate::session::{SessionId, SessionManager};
use crate::status::StatusCode;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flint::logging;
use flint::time::timestamp_millis;
use hashbrown::HashMap;
use std::io::Cursor;
use std::time::Instant;

/// Service ids understood by the dispatcher. Application services register
/// under their own ids.
pub mod service_ids {
    /// Responses to undecodable or failed requests.
    pub const SERVICE_FAULT: u32 = 0;
    pub const GET_ENDPOINTS: u32 = 1;
    pub const CREATE_SESSION: u32 = 2;
    pub const ACTIVATE_SESSION: u32 = 3;
    pub const CLOSE_SESSION: u32 = 4;
    pub const READ: u32 = 5;
    pub const WRITE: u32 = 6;
    pub const CALL: u32 = 7;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestHeader {
    /// Session auth token; empty for session-less services.
    pub auth_token: Option<Vec<u8>>,
    /// Client-chosen handle echoed in the response.
    pub request_handle: u32,
    pub timeout_hint_ms: u32,
    pub diagnostics_mask: u32,
}

impl RequestHeader {
    pub fn read<R: SizedRead>(stream: &mut R) -> NetworkResult<RequestHeader> {
        let auth_token = codec::read_byte_string(stream)?;
        let mut fixed = [0u32; 3];
        for slot in fixed.iter_mut() {
            *slot = stream.read_u32::<LittleEndian>()?;
        }

        Ok(RequestHeader {
            auth_token,
            request_handle: fixed[0],
            timeout_hint_ms: fixed[1],
            diagnostics_mask: fixed[2],
        })
    }

    pub fn write<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        codec::write_byte_string(stream, self.auth_token.as_deref())?;
        stream.write_u32::<LittleEndian>(self.request_handle)?;
        stream.write_u32::<LittleEndian>(self.timeout_hint_ms)?;
        stream.write_u32::<LittleEndian>(self.diagnostics_mask)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResponseHeader {
    pub request_handle: u32,
    pub service_result: u32,
    pub timestamp_ms: u64,
}

impl ResponseHeader {
    pub fn read<R: SizedRead>(stream: &mut R) -> NetworkResult<ResponseHeader> {
        Ok(ResponseHeader {
            request_handle: stream.read_u32::<LittleEndian>()?,
            service_result: stream.read_u32::<LittleEndian>()?,
            timestamp_ms: stream.read_u64::<LittleEndian>()?,
        })
    }

    pub fn write<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        stream.write_u32::<LittleEndian>(self.request_handle)?;
        stream.write_u32::<LittleEndian>(self.service_result)?;
        stream.write_u64::<LittleEndian>(self.timestamp_ms)?;
        Ok(())
    }
}

/// Everything a handler learns about the request besides its body.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub channel_id: u32,
    pub request_id: u32,
    pub session_id: Option<SessionId>,
    /// Raw auth token for services that resolve the session themselves
    /// (ActivateSession arrives before the session is usable).
    pub auth_token: Option<Vec<u8>>,
    pub request_handle: u32,
    pub timeout_hint_ms: u32,
}

/// What a handler produced.
pub enum ServiceOutcome {
    /// Encoded response body, or a fault status.
    Sync(Result<Vec<u8>, StatusCode>),
    /// The handler parked the operation; the reply comes later.
    CompletesAsynchronously,
}

/// Application state visible to the dispatcher.
pub trait ServiceState {
    fn sessions(&mut self) -> &mut SessionManager;
}

type Handler<S> = Box<dyn FnMut(&mut S, &RequestInfo, &[u8]) -> ServiceOutcome>;

struct Registration<S> {
    handler: Handler<S>,
    requires_session: bool,
}

/// Result of dispatching one message.
pub enum DispatchResult {
    /// Encoded response, ready for the channel.
    Respond(Vec<u8>),
    /// Parked; the session's request slot stays claimed until completion.
    Parked { session_id: Option<SessionId> },
}

pub struct ServiceDispatcher<S> {
    handlers: HashMap<u32, Registration<S>>,
    log: logging::Logger,
}

impl<S: ServiceState> ServiceDispatcher<S> {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> ServiceDispatcher<S> {
        ServiceDispatcher {
            handlers: HashMap::new(),
            log: logging::child(log),
        }
    }

    /// Registers a handler. Session-bound services get their session
    /// resolved and refreshed before the handler runs.
    pub fn register<F>(&mut self, service_id: u32, requires_session: bool, handler: F)
    where
        F: FnMut(&mut S, &RequestInfo, &[u8]) -> ServiceOutcome + 'static,
    {
        let replaced = self
            .handlers
            .insert(
                service_id,
                Registration {
                    handler: Box::new(handler),
                    requires_session,
                },
            )
            .is_some();

        if replaced {
            panic!("Duplicate service handler for id {}", service_id);
        }
    }

    /// Decodes and dispatches one reassembled message payload.
    pub fn dispatch(
        &mut self,
        state: &mut S,
        channel_id: u32,
        request_id: u32,
        payload: &[u8],
        now: Instant,
    ) -> DispatchResult {
        let mut stream = Cursor::new(payload);

        let (service_id, header) = match Self::decode_envelope(&mut stream) {
            Ok(decoded) => decoded,
            Err(_) => {
                logging::debug!(self.log, "undecodable request envelope";
                                "context" => "dispatch",
                                "channel_id" => channel_id,
                                "request_id" => request_id);
                return DispatchResult::Respond(encode_fault(0, StatusCode::BadDecodingError));
            }
        };

        let registration = match self.handlers.get_mut(&service_id) {
            Some(registration) => registration,
            None => {
                return DispatchResult::Respond(encode_fault(
                    header.request_handle,
                    StatusCode::BadServiceUnsupported,
                ));
            }
        };

        // Resolve the session and refresh its deadline
        let session_id = if registration.requires_session {
            let token = match &header.auth_token {
                Some(token) if !token.is_empty() => token,
                _ => {
                    return DispatchResult::Respond(encode_fault(
                        header.request_handle,
                        StatusCode::BadSessionIdInvalid,
                    ));
                }
            };

            match state.sessions().validate_request(token, channel_id, now) {
                Ok(id) => Some(id),
                Err(status) => {
                    return DispatchResult::Respond(encode_fault(header.request_handle, status));
                }
            }
        } else {
            None
        };

        if let Some(id) = session_id {
            if let Err(status) = state.sessions().begin_request(id) {
                return DispatchResult::Respond(encode_fault(header.request_handle, status));
            }
        }

        let info = RequestInfo {
            channel_id,
            request_id,
            session_id,
            auth_token: header.auth_token.clone(),
            request_handle: header.request_handle,
            timeout_hint_ms: header.timeout_hint_ms,
        };

        let body = &payload[stream.position() as usize..];
        let outcome = (registration.handler)(state, &info, body);

        match outcome {
            ServiceOutcome::Sync(result) => {
                if let Some(id) = session_id {
                    state.sessions().end_request(id);
                }

                let response = match result {
                    Ok(body) => encode_response(service_id, header.request_handle, StatusCode::Good, &body),
                    Err(status) => encode_fault(header.request_handle, status),
                };
                DispatchResult::Respond(response)
            }
            ServiceOutcome::CompletesAsynchronously => {
                logging::trace!(self.log, "request parked";
                                "context" => "dispatch",
                                "request_id" => request_id,
                                "service_id" => service_id);
                DispatchResult::Parked { session_id }
            }
        }
    }

    fn decode_envelope(stream: &mut Cursor<&[u8]>) -> NetworkResult<(u32, RequestHeader)> {
        let service_id = stream.read_u32::<LittleEndian>()?;
        let header = RequestHeader::read(stream)?;
        Ok((service_id, header))
    }
}

/// Encodes `service id | response header | body`.
pub fn encode_response(service_id: u32, request_handle: u32, status: StatusCode, body: &[u8]) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::with_capacity(20 + body.len()));

    cursor
        .write_u32::<LittleEndian>(service_id)
        .expect("In-memory encode cannot fail");
    ResponseHeader {
        request_handle,
        service_result: status.code(),
        timestamp_ms: timestamp_millis(),
    }
    .write(&mut cursor)
    .expect("In-memory encode cannot fail");
    cursor.get_mut().extend_from_slice(body);

    cursor.into_inner()
}

/// Encodes a ServiceFault envelope.
#[inline]
pub fn encode_fault(request_handle: u32, status: StatusCode) -> Vec<u8> {
    encode_response(service_ids::SERVICE_FAULT, request_handle, status, &[])
}

/// Encodes `service id | request header | body`; used by clients and tests.
pub fn encode_request(service_id: u32, header: &RequestHeader, body: &[u8]) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::with_capacity(20 + body.len()));

    cursor
        .write_u32::<LittleEndian>(service_id)
        .expect("In-memory encode cannot fail");
    header.write(&mut cursor).expect("In-memory encode cannot fail");
    cursor.get_mut().extend_from_slice(body);

    cursor.into_inner()
}

/// Decodes a response envelope; used by clients and tests.
pub fn decode_response(payload: &[u8]) -> NetworkResult<(u32, ResponseHeader, Vec<u8>)> {
    let mut stream = Cursor::new(payload);
    let service_id = stream.read_u32::<LittleEndian>()?;
    let header = ResponseHeader::read(&mut stream)?;
    let body = payload[stream.position() as usize..].to_vec();
    Ok((service_id, header, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ActivationIdentity, SessionConfig};
    use std::time::Duration;

    struct TestState {
        sessions: SessionManager,
        parked: Vec<RequestInfo>,
    }

    impl ServiceState for TestState {
        fn sessions(&mut self) -> &mut SessionManager {
            &mut self.sessions
        }
    }

    fn state() -> TestState {
        TestState {
            sessions: SessionManager::new(SessionConfig::default(), HashMap::new(), None),
            parked: Vec::new(),
        }
    }

    fn request(service_id: u32, auth_token: Option<Vec<u8>>, body: &[u8]) -> Vec<u8> {
        encode_request(
            service_id,
            &RequestHeader {
                auth_token,
                request_handle: 77,
                timeout_hint_ms: 5000,
                diagnostics_mask: 0,
            },
            body,
        )
    }

    #[test]
    fn test_sync_dispatch_roundtrip() {
        let mut dispatcher: ServiceDispatcher<TestState> = ServiceDispatcher::new(None);
        let mut state = state();

        dispatcher.register(service_ids::READ, false, |_, _, body| {
            let mut echoed = body.to_vec();
            echoed.reverse();
            ServiceOutcome::Sync(Ok(echoed))
        });

        let payload = request(service_ids::READ, None, &[1, 2, 3]);
        let result = dispatcher.dispatch(&mut state, 1, 10, &payload, Instant::now());

        let response = match result {
            DispatchResult::Respond(response) => response,
            _ => panic!("Expected sync response"),
        };

        let (service_id, header, body) = decode_response(&response).unwrap();
        assert_eq!(service_id, service_ids::READ);
        assert_eq!(header.request_handle, 77);
        assert_eq!(header.service_result, StatusCode::Good.code());
        assert_eq!(body, vec![3, 2, 1]);
    }

    #[test]
    fn test_unknown_service_faults() {
        let mut dispatcher: ServiceDispatcher<TestState> = ServiceDispatcher::new(None);
        let mut state = state();

        let payload = request(999, None, &[]);
        let result = dispatcher.dispatch(&mut state, 1, 10, &payload, Instant::now());

        let response = match result {
            DispatchResult::Respond(response) => response,
            _ => panic!("Expected fault"),
        };

        let (service_id, header, _) = decode_response(&response).unwrap();
        assert_eq!(service_id, service_ids::SERVICE_FAULT);
        assert_eq!(header.service_result, StatusCode::BadServiceUnsupported.code());
    }

    #[test]
    fn test_undecodable_envelope_faults() {
        let mut dispatcher: ServiceDispatcher<TestState> = ServiceDispatcher::new(None);
        let mut state = state();

        let result = dispatcher.dispatch(&mut state, 1, 10, &[1, 2], Instant::now());

        let response = match result {
            DispatchResult::Respond(response) => response,
            _ => panic!("Expected fault"),
        };

        let (_, header, _) = decode_response(&response).unwrap();
        assert_eq!(header.service_result, StatusCode::BadDecodingError.code());
    }

    #[test]
    fn test_session_required_rejects_unknown_token() {
        let mut dispatcher: ServiceDispatcher<TestState> = ServiceDispatcher::new(None);
        let mut state = state();

        dispatcher.register(service_ids::WRITE, true, |_, _, _| {
            panic!("Handler must not run without a session")
        });

        let payload = request(service_ids::WRITE, Some(vec![9u8; 32]), &[]);
        let result = dispatcher.dispatch(&mut state, 1, 10, &payload, Instant::now());

        let response = match result {
            DispatchResult::Respond(response) => response,
            _ => panic!("Expected fault"),
        };

        let (_, header, _) = decode_response(&response).unwrap();
        assert_eq!(header.service_result, StatusCode::BadSessionIdInvalid.code());
    }

    #[test]
    fn test_session_bound_dispatch_and_refresh() {
        let mut dispatcher: ServiceDispatcher<TestState> = ServiceDispatcher::new(None);
        let mut state = state();
        let mut pki = crate::pki::TrustStore::with_default_groups(65536, 100, None);
        let now = Instant::now();

        let created = state
            .sessions
            .create_session("dispatch", Duration::from_secs(60), None, now)
            .unwrap();
        state
            .sessions
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

        dispatcher.register(service_ids::WRITE, true, |_, info, _| {
            assert!(info.session_id.is_some());
            ServiceOutcome::Sync(Ok(Vec::new()))
        });

        let payload = request(service_ids::WRITE, Some(created.auth_token.clone()), &[]);

        // Bound channel accepts, another channel does not
        match dispatcher.dispatch(&mut state, 1, 10, &payload, now) {
            DispatchResult::Respond(response) => {
                let (_, header, _) = decode_response(&response).unwrap();
                assert_eq!(header.service_result, StatusCode::Good.code());
            }
            _ => panic!("Expected response"),
        }

        match dispatcher.dispatch(&mut state, 2, 11, &payload, now) {
            DispatchResult::Respond(response) => {
                let (_, header, _) = decode_response(&response).unwrap();
                assert_eq!(header.service_result, StatusCode::BadSessionNotActivated.code());
            }
            _ => panic!("Expected fault"),
        }
    }

    #[test]
    fn test_async_park_keeps_request_slot() {
        let mut dispatcher: ServiceDispatcher<TestState> = ServiceDispatcher::new(None);
        let mut state = state();
        let mut pki = crate::pki::TrustStore::with_default_groups(65536, 100, None);
        let now = Instant::now();

        let created = state
            .sessions
            .create_session("parked", Duration::from_secs(60), None, now)
            .unwrap();
        state
            .sessions
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
        let session_id = created.session_id;

        dispatcher.register(service_ids::READ, true, |state: &mut TestState, info, _| {
            state.parked.push(info.clone());
            ServiceOutcome::CompletesAsynchronously
        });

        let payload = request(service_ids::READ, Some(created.auth_token.clone()), &[]);
        match dispatcher.dispatch(&mut state, 1, 10, &payload, now) {
            DispatchResult::Parked { session_id: parked } => assert_eq!(parked, Some(session_id)),
            _ => panic!("Expected parked"),
        }

        // The in-flight slot stays claimed until the completion is flushed
        match dispatcher.dispatch(&mut state, 1, 11, &payload, now) {
            DispatchResult::Respond(response) => {
                let (_, header, _) = decode_response(&response).unwrap();
                assert_eq!(header.service_result, StatusCode::BadTooManyOperations.code());
            }
            _ => panic!("Expected fault"),
        }

        state.sessions.end_request(session_id);
        match dispatcher.dispatch(&mut state, 1, 12, &payload, now) {
            DispatchResult::Parked { .. } => (),
            _ => panic!("Expected parked"),
        }
    }
}
