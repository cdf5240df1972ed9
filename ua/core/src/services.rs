//! Service handlers: session lifecycle, the demo read/write attribute
//! services (read goes through the async batching path) and the
//! push-management method surface routed through Call.

use crate::endpoints;
use crate::server::{build_policy_set, DeferredAction, ReadOp, ServerCore};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flint::cert::Certificate;
use flint::choose;
use flint::logging;
use girder::asyncop::{AsyncRequestContext, OperationKind};
use girder::codec;
use girder::gds;
use girder::pki;
use girder::service::{service_ids, RequestInfo, ServiceDispatcher, ServiceOutcome};
use girder::session::{roles, ActivationIdentity, SessionId};
use girder::status::StatusCode;
use std::io::Cursor;
use std::time::{Duration, Instant};

type Body = Result<Vec<u8>, StatusCode>;

/// Registers every service the server speaks.
pub fn register_all(dispatcher: &mut ServiceDispatcher<ServerCore>) {
    dispatcher.register(service_ids::GET_ENDPOINTS, false, |core, _, _| {
        let descriptions = endpoints::build(&core.config, &core.policies);
        ServiceOutcome::Sync(Ok(endpoints::encode(&descriptions)))
    });

    dispatcher.register(service_ids::CREATE_SESSION, false, |core, info, body| {
        ServiceOutcome::Sync(create_session(core, info, body))
    });

    dispatcher.register(service_ids::ACTIVATE_SESSION, false, |core, info, body| {
        ServiceOutcome::Sync(activate_session(core, info, body))
    });

    dispatcher.register(service_ids::CLOSE_SESSION, true, |core, info, _| {
        ServiceOutcome::Sync(close_session(core, info))
    });

    dispatcher.register(service_ids::READ, true, |core, info, body| read(core, info, body));

    dispatcher.register(service_ids::WRITE, true, |core, _, body| {
        ServiceOutcome::Sync(write(core, body))
    });

    dispatcher.register(service_ids::CALL, true, |core, info, body| {
        ServiceOutcome::Sync(call(core, info, body))
    });
}

/// CreateSession: issues the auth token and server nonce. When the channel
/// is secured, the client certificate's application URI is checked with the
/// deliberately permissive substring rule.
fn create_session(core: &mut ServerCore, info: &RequestInfo, body: &[u8]) -> Body {
    let mut stream = Cursor::new(body);
    let application_uri =
        codec::read_string(&mut stream).map_err(|_| StatusCode::BadDecodingError)?;
    let display_name = codec::read_string(&mut stream)
        .map_err(|_| StatusCode::BadDecodingError)?
        .unwrap_or_else(|| "anonymous client".to_string());
    let requested_timeout_ms = stream
        .read_u32::<LittleEndian>()
        .map_err(|_| StatusCode::BadDecodingError)?;

    let client_cert = match core.endpoint.remote_cert_der(info.channel_id) {
        Some(der) => {
            let cert =
                Certificate::parse(&der).map_err(|_| StatusCode::BadCertificateInvalid)?;
            if let Some(uri) = &application_uri {
                pki::verify_application_uri(&cert, uri, core.config.security.strict_application_uri)?;
            }
            Some(cert)
        }
        None => None,
    };

    let created = core.sessions.create_session(
        &display_name,
        Duration::from_millis(u64::from(requested_timeout_ms)),
        client_cert,
        Instant::now(),
    )?;

    let mut out = Cursor::new(Vec::new());
    codec::write_byte_string(&mut out, Some(&created.auth_token)).unwrap();
    codec::write_byte_string(&mut out, Some(&created.server_nonce)).unwrap();
    out.write_u32::<LittleEndian>(created.revised_timeout.as_millis() as u32)
        .unwrap();
    codec::write_byte_string(
        &mut out,
        choose!(core.server_cert_der.is_empty() => None, Some(core.server_cert_der.as_slice())),
    )
    .unwrap();

    Ok(out.into_inner())
}

/// ActivateSession: resolves the identity token, proves possession for x509
/// and binds the session to this channel (rebinding included).
fn activate_session(core: &mut ServerCore, info: &RequestInfo, body: &[u8]) -> Body {
    let auth_token = info
        .auth_token
        .as_deref()
        .ok_or(StatusCode::BadSessionIdInvalid)?;

    let mut stream = Cursor::new(body);
    let identity_type = stream
        .read_u32::<LittleEndian>()
        .map_err(|_| StatusCode::BadDecodingError)?;

    let identity = match identity_type {
        endpoints::token_types::ANONYMOUS => ActivationIdentity::Anonymous,
        endpoints::token_types::USERNAME => {
            let user = codec::read_string(&mut stream)
                .map_err(|_| StatusCode::BadDecodingError)?
                .ok_or(StatusCode::BadIdentityTokenInvalid)?;
            let password = codec::read_string(&mut stream)
                .map_err(|_| StatusCode::BadDecodingError)?
                .ok_or(StatusCode::BadIdentityTokenInvalid)?;
            ActivationIdentity::UserName { user, password }
        }
        endpoints::token_types::X509 => {
            let cert_der = codec::read_byte_string(&mut stream)
                .map_err(|_| StatusCode::BadDecodingError)?
                .ok_or(StatusCode::BadIdentityTokenInvalid)?;
            let signature = codec::read_byte_string(&mut stream)
                .map_err(|_| StatusCode::BadDecodingError)?
                .ok_or(StatusCode::BadIdentityTokenInvalid)?;
            ActivationIdentity::X509 { cert_der, signature }
        }
        _ => return Err(StatusCode::BadIdentityTokenInvalid),
    };

    let locale_ids = read_string_array(&mut stream)?;

    let ServerCore {
        sessions,
        pki,
        server_cert_der,
        endpoint,
        ..
    } = core;

    let (session_id, server_nonce) = sessions.activate_session(
        auth_token,
        info.channel_id,
        identity,
        locale_ids,
        server_cert_der,
        pki,
        Instant::now(),
    )?;

    endpoint.bind_session(info.channel_id, session_id);

    let mut out = Cursor::new(Vec::new());
    codec::write_byte_string(&mut out, Some(&server_nonce)).unwrap();
    Ok(out.into_inner())
}

fn close_session(core: &mut ServerCore, info: &RequestInfo) -> Body {
    let session_id = info.session_id.expect("Session-bound service");

    let cancelled = core
        .asyncop
        .cancel_session(session_id, StatusCode::BadSessionClosed);
    core.completions.extend(cancelled);

    core.endpoint.unbind_session(info.channel_id, session_id);
    core.sessions.close_session(session_id)?;

    Ok(Vec::new())
}

/// Read goes through the async operation table: the handler parks the
/// request and the batch coalescer answers a whole group of them in one
/// backend pass.
fn read(core: &mut ServerCore, info: &RequestInfo, body: &[u8]) -> ServiceOutcome {
    let mut stream = Cursor::new(body);
    let node_id = match stream.read_u32::<LittleEndian>() {
        Ok(node_id) => node_id,
        Err(_) => return ServiceOutcome::Sync(Err(StatusCode::BadDecodingError)),
    };

    let now = Instant::now();
    let deadline = now + core.async_op_timeout;

    let handle = core.asyncop.park(
        AsyncRequestContext {
            channel_id: info.channel_id,
            request_id: info.request_id,
            session_id: info.session_id.expect("Session-bound service"),
            request_handle: info.request_handle,
            kind: OperationKind(service_ids::READ),
        },
        deadline,
    );

    if core.read_batch.submit(handle, ReadOp { node_id }, now) {
        flush_read_batch(core, now);
    }

    ServiceOutcome::CompletesAsynchronously
}

/// Flushes the read batch through the variable store and queues the
/// completions for the dispatcher.
pub fn flush_read_batch(core: &mut ServerCore, now: Instant) {
    let ServerCore {
        read_batch,
        asyncop,
        variables,
        completions,
        log,
        ..
    } = core;

    let completed = read_batch.flush_with(now, asyncop, |ops| {
        ops.into_iter()
            .map(|op| match variables.get(&op.node_id) {
                Some(&value) => Ok(value.to_le_bytes().to_vec()),
                None => Err(StatusCode::BadNotFound),
            })
            .collect()
    });

    if !completed.is_empty() {
        logging::debug!(log, "read batch flushed";
                        "context" => "flush_read_batch",
                        "count" => completed.len());
    }

    completions.extend(completed);
}

fn write(core: &mut ServerCore, body: &[u8]) -> Body {
    let mut stream = Cursor::new(body);
    let node_id = stream
        .read_u32::<LittleEndian>()
        .map_err(|_| StatusCode::BadDecodingError)?;
    let value = stream
        .read_u32::<LittleEndian>()
        .map_err(|_| StatusCode::BadDecodingError)?;

    core.variables.insert(node_id, value);
    Ok(Vec::new())
}

/// Call routes the push-management methods. Everything under the
/// ServerConfiguration object and the TrustList objects is admin-only.
fn call(core: &mut ServerCore, info: &RequestInfo, body: &[u8]) -> Body {
    let mut stream = Cursor::new(body);
    let object_id = codec::read_string(&mut stream)
        .map_err(|_| StatusCode::BadDecodingError)?
        .ok_or(StatusCode::BadDecodingError)?;
    let method_id = codec::read_string(&mut stream)
        .map_err(|_| StatusCode::BadDecodingError)?
        .ok_or(StatusCode::BadDecodingError)?;

    let session_id = require_admin(core, info)?;

    match object_id.as_str() {
        "ServerConfiguration" => match method_id.as_str() {
            "UpdateCertificate" => update_certificate(core, session_id, &mut stream),
            "CreateSigningRequest" => create_signing_request(core, &mut stream),
            "GetRejectedList" => get_rejected_list(core),
            "ApplyChanges" => apply_changes(core, session_id),
            _ => Err(StatusCode::BadNotFound),
        },
        group_id if core.pki.has_group(group_id) => {
            trust_list_method(core, session_id, group_id, &method_id, &mut stream)
        }
        _ => Err(StatusCode::BadNotFound),
    }
}

fn update_certificate(
    core: &mut ServerCore,
    session_id: SessionId,
    stream: &mut Cursor<&[u8]>,
) -> Body {
    let group = required_string(stream)?;
    let cert_type = required_string(stream)?;
    let cert_der = required_bytes(stream)?;
    let issuer_chain = codec::read_byte_string_array(stream)
        .map_err(|_| StatusCode::BadDecodingError)?
        .unwrap_or_default();
    let _pk_format = codec::read_string(stream).map_err(|_| StatusCode::BadDecodingError)?;
    let private_key = codec::read_byte_string(stream)
        .map_err(|_| StatusCode::BadDecodingError)?
        .unwrap_or_default();

    if !core.pki.has_group(&group) {
        return Err(StatusCode::BadNotFound);
    }

    let current_key = core.identity.as_ref().map(|(_, key)| key.clone());
    let apply_required = core.gds.update_certificate(
        &group,
        &cert_type,
        &cert_der,
        &issuer_chain,
        &private_key,
        current_key.as_ref(),
        session_id,
    )?;

    encode_bool(apply_required)
}

fn create_signing_request(core: &mut ServerCore, stream: &mut Cursor<&[u8]>) -> Body {
    let group = required_string(stream)?;
    let cert_type = required_string(stream)?;
    let subject = read_string_array(stream)?;
    let regenerate = stream
        .read_u32::<LittleEndian>()
        .map_err(|_| StatusCode::BadDecodingError)?
        != 0;
    let _nonce = codec::read_byte_string(stream).map_err(|_| StatusCode::BadDecodingError)?;

    let ServerCore {
        gds, pki, identity, ..
    } = core;

    if !pki.has_group(&group) {
        return Err(StatusCode::BadNotFound);
    }

    let (current_cert, current_key) = match identity.as_ref() {
        Some((cert, key)) => (Some(cert), Some(key)),
        None => (None, None),
    };

    let csr =
        gds.create_signing_request(&group, &cert_type, &subject, regenerate, current_cert, current_key)?;

    let mut out = Cursor::new(Vec::new());
    codec::write_byte_string(&mut out, Some(&csr)).unwrap();
    Ok(out.into_inner())
}

fn get_rejected_list(core: &mut ServerCore) -> Body {
    let certs = core.gds.get_rejected_list(&core.pki);

    let mut out = Cursor::new(Vec::new());
    codec::write_byte_string_array(&mut out, Some(&certs)).unwrap();
    Ok(out.into_inner())
}

/// The commit point. Trust list changes go live here; a staged certificate
/// swap also rotates the policy set. The channel teardown runs as a deferred
/// action so this response still flushes over the old keys.
fn apply_changes(core: &mut ServerCore, session_id: SessionId) -> Body {
    let outcome = {
        let ServerCore { gds, pki, .. } = core;
        gds.apply_changes(pki, session_id)?
    };

    if let Some(update) = outcome.cert_update {
        let gds::StagedCertUpdate {
            cert, private_key, ..
        } = update;

        core.server_cert_der = cert.der().to_vec();
        core.identity = Some((cert, private_key));

        let resolved = core
            .config
            .resolved_policies()
            .map_err(|_| StatusCode::BadInternalError)?;
        let policies = build_policy_set(&resolved, core.identity.as_ref())
            .map_err(|_| StatusCode::BadInternalError)?;

        core.policies = policies.clone();
        core.endpoint.set_policies(policies);

        // The new identity invalidates every open channel
        core.deferred.push(DeferredAction::TeardownAll);
    } else if !outcome.trust_changed_groups.is_empty() {
        core.deferred.push(DeferredAction::TeardownUntrusted);
    }

    Ok(Vec::new())
}

fn trust_list_method(
    core: &mut ServerCore,
    session_id: SessionId,
    group_id: &str,
    method_id: &str,
    stream: &mut Cursor<&[u8]>,
) -> Body {
    match method_id {
        "Open" => {
            let mode = stream
                .read_u32::<LittleEndian>()
                .map_err(|_| StatusCode::BadDecodingError)? as u8;
            let handle = core.gds.open(&core.pki, group_id, session_id, mode)?;
            encode_u32(handle)
        }
        "OpenWithMasks" => {
            let mask = stream
                .read_u32::<LittleEndian>()
                .map_err(|_| StatusCode::BadDecodingError)?;
            let handle = core.gds.open_with_masks(&core.pki, group_id, session_id, mask)?;
            encode_u32(handle)
        }
        "Read" => {
            let handle = stream
                .read_u32::<LittleEndian>()
                .map_err(|_| StatusCode::BadDecodingError)?;
            let length = stream
                .read_u32::<LittleEndian>()
                .map_err(|_| StatusCode::BadDecodingError)?;
            let data = core.gds.read(handle, session_id, length as usize)?;

            let mut out = Cursor::new(Vec::new());
            codec::write_byte_string(&mut out, Some(&data)).unwrap();
            Ok(out.into_inner())
        }
        "Write" => {
            let handle = stream
                .read_u32::<LittleEndian>()
                .map_err(|_| StatusCode::BadDecodingError)?;
            let data = required_bytes(stream)?;
            core.gds.write(handle, session_id, &data)?;
            Ok(Vec::new())
        }
        "Close" => {
            let handle = stream
                .read_u32::<LittleEndian>()
                .map_err(|_| StatusCode::BadDecodingError)?;
            core.gds.close(handle, session_id)?;
            Ok(Vec::new())
        }
        "CloseAndUpdate" => {
            let handle = stream
                .read_u32::<LittleEndian>()
                .map_err(|_| StatusCode::BadDecodingError)?;
            let apply_required = core.gds.close_and_update(handle, session_id)?;
            encode_bool(apply_required)
        }
        "GetPosition" => {
            let handle = stream
                .read_u32::<LittleEndian>()
                .map_err(|_| StatusCode::BadDecodingError)?;
            let position = core.gds.get_position(handle, session_id)?;

            let mut out = Cursor::new(Vec::new());
            out.write_u64::<LittleEndian>(position).unwrap();
            Ok(out.into_inner())
        }
        "SetPosition" => {
            let handle = stream
                .read_u32::<LittleEndian>()
                .map_err(|_| StatusCode::BadDecodingError)?;
            let position = stream
                .read_u64::<LittleEndian>()
                .map_err(|_| StatusCode::BadDecodingError)?;
            core.gds.set_position(handle, session_id, position)?;
            Ok(Vec::new())
        }
        "AddCertificate" => {
            let cert_der = required_bytes(stream)?;
            let is_trusted = stream
                .read_u32::<LittleEndian>()
                .map_err(|_| StatusCode::BadDecodingError)?
                != 0;

            let ServerCore { gds, pki, .. } = core;
            gds.add_certificate(pki, group_id, &cert_der, is_trusted)?;
            Ok(Vec::new())
        }
        "RemoveCertificate" => {
            let thumbprint = required_string(stream)?;
            let is_trusted = stream
                .read_u32::<LittleEndian>()
                .map_err(|_| StatusCode::BadDecodingError)?
                != 0;

            let ServerCore { gds, pki, .. } = core;
            gds.remove_certificate(pki, group_id, &thumbprint, is_trusted)?;
            Ok(Vec::new())
        }
        _ => Err(StatusCode::BadNotFound),
    }
}

fn require_admin(core: &mut ServerCore, info: &RequestInfo) -> Result<SessionId, StatusCode> {
    let session_id = info.session_id.expect("Session-bound service");
    let session = core
        .sessions
        .get(session_id)
        .ok_or(StatusCode::BadSessionIdInvalid)?;

    if !session.has_role(roles::CONFIGURE_ADMIN) {
        return Err(StatusCode::BadUserAccessDenied);
    }

    Ok(session_id)
}

fn read_string_array(stream: &mut Cursor<&[u8]>) -> Result<Vec<String>, StatusCode> {
    let count = stream
        .read_i32::<LittleEndian>()
        .map_err(|_| StatusCode::BadDecodingError)?;

    if count < 0 {
        return Ok(Vec::new());
    }

    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let value = codec::read_string(stream)
            .map_err(|_| StatusCode::BadDecodingError)?
            .ok_or(StatusCode::BadDecodingError)?;
        values.push(value);
    }
    Ok(values)
}

fn required_string(stream: &mut Cursor<&[u8]>) -> Result<String, StatusCode> {
    codec::read_string(stream)
        .map_err(|_| StatusCode::BadDecodingError)?
        .ok_or(StatusCode::BadDecodingError)
}

fn required_bytes(stream: &mut Cursor<&[u8]>) -> Result<Vec<u8>, StatusCode> {
    codec::read_byte_string(stream)
        .map_err(|_| StatusCode::BadDecodingError)?
        .ok_or(StatusCode::BadDecodingError)
}

fn encode_bool(value: bool) -> Body {
    encode_u32(u32::from(value))
}

fn encode_u32(value: u32) -> Body {
    let mut out = Cursor::new(Vec::new());
    out.write_u32::<LittleEndian>(value).unwrap();
    Ok(out.into_inner())
}
