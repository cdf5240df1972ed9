//! Push-management of the server's own trust material: the transactional
//! certificate/trust-list update workflow and the chunked FileType access to
//! TrustList objects.
//!
//! At most one transaction exists server-wide. Write-mode file handles and
//! certificate updates stage their changes into it; nothing touches the live
//! trust store until ApplyChanges commits. A liveness sweep discards the
//! transaction if its owning session dies first.

use crate::pki::{masks, TrustList, TrustStore};
use crate::session::{SessionId, SessionManager};
use crate::status::StatusCode;
use flint::cert::Certificate;
use flint::crypto;
use flint::forge;
use flint::logging;
use rsa::RsaPrivateKey;
use std::time::Duration;

/// FileType open mode bits.
pub mod file_mode {
    pub const READ: u8 = 0x01;
    pub const WRITE: u8 = 0x02;
    pub const ERASE_EXISTING: u8 = 0x04;
    pub const WRITE_ERASE: u8 = WRITE | ERASE_EXISTING;
}

/// Certificate type ids accepted by UpdateCertificate/CreateSigningRequest.
pub const SUPPORTED_CERT_TYPES: [&str; 2] =
    ["ApplicationCertificateType", "RsaSha256ApplicationCertificateType"];

#[derive(Debug, Copy, Clone)]
pub struct GdsConfig {
    /// Interval of the owner-session liveness sweep.
    pub check_session_interval: Duration,
}

impl Default for GdsConfig {
    fn default() -> GdsConfig {
        GdsConfig {
            check_session_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransactionState {
    Fresh,
    Pending,
}

/// A staged server-certificate replacement.
#[derive(Debug)]
pub struct StagedCertUpdate {
    pub group_id: String,
    pub cert_type_id: String,
    pub cert: Certificate,
    pub private_key: RsaPrivateKey,
}

struct Transaction {
    session_id: SessionId,
    state: TransactionState,
    /// Copy-on-write staged trust lists, one per touched group.
    staged_trust_lists: Vec<(String, TrustList)>,
    staged_cert_update: Option<StagedCertUpdate>,
}

struct FileHandle {
    handle_id: u32,
    session_id: SessionId,
    group_id: String,
    write_mode: bool,
    buffer: Vec<u8>,
    cursor: usize,
}

/// What ApplyChanges committed; the server acts on it (policy swap, endpoint
/// refresh, delayed channel teardown).
#[derive(Debug)]
pub struct ApplyOutcome {
    pub trust_changed_groups: Vec<String>,
    pub cert_update: Option<StagedCertUpdate>,
}

pub struct GdsManager {
    config: GdsConfig,
    transaction: Option<Transaction>,
    handles: Vec<FileHandle>,
    next_handle: u32,
    /// Key generated by CreateSigningRequest(regenerateKey) awaiting the
    /// matching UpdateCertificate.
    pending_csr_key: Option<(String, RsaPrivateKey)>,
    log: logging::Logger,
}

impl GdsManager {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(config: GdsConfig, log: L) -> GdsManager {
        GdsManager {
            config,
            transaction: None,
            handles: Vec::new(),
            next_handle: 1,
            pending_csr_key: None,
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn config(&self) -> &GdsConfig {
        &self.config
    }

    /// Number of open handles on the given TrustList object.
    #[inline]
    pub fn open_count(&self, group_id: &str) -> u32 {
        self.handles.iter().filter(|handle| handle.group_id == group_id).count() as u32
    }

    /// True while the liveness sweep must stay registered.
    #[inline]
    pub fn needs_liveness_sweep(&self) -> bool {
        self.transaction.is_some() || !self.handles.is_empty()
    }

    #[inline]
    pub fn transaction_state(&self) -> Option<TransactionState> {
        self.transaction.as_ref().map(|transaction| transaction.state)
    }

    /// Opens a TrustList object as a file. Read mode serializes the current
    /// list; write+erase mode starts an empty buffer and enters the
    /// transaction.
    pub fn open(
        &mut self,
        store: &TrustStore,
        group_id: &str,
        session_id: SessionId,
        mode: u8,
    ) -> Result<u32, StatusCode> {
        match mode {
            file_mode::READ => self.open_masked(store, group_id, session_id, masks::ALL),
            file_mode::WRITE_ERASE => self.open_write(store, group_id, session_id),
            _ => Err(StatusCode::BadInvalidArgument),
        }
    }

    /// Read-only open restricted by a `specifiedLists` mask.
    pub fn open_with_masks(
        &mut self,
        store: &TrustStore,
        group_id: &str,
        session_id: SessionId,
        mask: u32,
    ) -> Result<u32, StatusCode> {
        self.open_masked(store, group_id, session_id, mask)
    }

    fn open_masked(
        &mut self,
        store: &TrustStore,
        group_id: &str,
        session_id: SessionId,
        mask: u32,
    ) -> Result<u32, StatusCode> {
        // A pending transaction from another session blocks even readers
        if let Some(transaction) = &self.transaction {
            if transaction.session_id != session_id {
                return Err(StatusCode::BadTransactionPending);
            }
        }

        let list = store.get_trust_list(group_id, mask)?;
        let buffer = list.encode();

        Ok(self.insert_handle(group_id, session_id, false, buffer))
    }

    fn open_write(
        &mut self,
        store: &TrustStore,
        group_id: &str,
        session_id: SessionId,
    ) -> Result<u32, StatusCode> {
        if !store.has_group(group_id) {
            return Err(StatusCode::BadNotFound);
        }

        // Write mode requires exclusive access to the object
        if self.open_count(group_id) > 0 {
            return Err(StatusCode::BadInvalidState);
        }

        self.enter_transaction(session_id)?;

        Ok(self.insert_handle(group_id, session_id, true, Vec::new()))
    }

    /// Reads up to `length` bytes from the handle's cursor.
    pub fn read(
        &mut self,
        handle_id: u32,
        session_id: SessionId,
        length: usize,
    ) -> Result<Vec<u8>, StatusCode> {
        let handle = self.handle_mut(handle_id, session_id)?;

        if handle.write_mode {
            return Err(StatusCode::BadInvalidState);
        }

        let start = handle.cursor.min(handle.buffer.len());
        let end = (start + length).min(handle.buffer.len());
        handle.cursor = end;

        Ok(handle.buffer[start..end].to_vec())
    }

    /// Writes at the handle's cursor (append or in-place overwrite).
    pub fn write(&mut self, handle_id: u32, session_id: SessionId, data: &[u8]) -> Result<(), StatusCode> {
        let handle = self.handle_mut(handle_id, session_id)?;

        if !handle.write_mode {
            return Err(StatusCode::BadInvalidState);
        }

        let end = handle.cursor + data.len();
        if end > handle.buffer.len() {
            handle.buffer.resize(end, 0);
        }
        handle.buffer[handle.cursor..end].copy_from_slice(data);
        handle.cursor = end;

        Ok(())
    }

    pub fn get_position(&self, handle_id: u32, session_id: SessionId) -> Result<u64, StatusCode> {
        let handle = self.handle(handle_id, session_id)?;
        Ok(handle.cursor as u64)
    }

    pub fn set_position(
        &mut self,
        handle_id: u32,
        session_id: SessionId,
        position: u64,
    ) -> Result<(), StatusCode> {
        let handle = self.handle_mut(handle_id, session_id)?;
        handle.cursor = position as usize;
        Ok(())
    }

    /// Closes a handle. A write-mode close without CloseAndUpdate discards
    /// the staged changes by cancelling the transaction.
    pub fn close(&mut self, handle_id: u32, session_id: SessionId) -> Result<(), StatusCode> {
        let index = self.handle_index(handle_id, session_id)?;
        let handle = self.handles.remove(index);

        if handle.write_mode {
            logging::debug!(self.log, "write handle closed without update, transaction discarded";
                            "context" => "close",
                            "group" => &handle.group_id);
            self.discard_transaction();
        }

        Ok(())
    }

    /// Decodes the written buffer as a TrustList and stages it into the
    /// transaction. The live group is untouched until ApplyChanges.
    /// Returns `applyChangesRequired = true`.
    pub fn close_and_update(&mut self, handle_id: u32, session_id: SessionId) -> Result<bool, StatusCode> {
        let index = self.handle_index(handle_id, session_id)?;

        if !self.handles[index].write_mode {
            return Err(StatusCode::BadInvalidState);
        }

        let handle = self.handles.remove(index);
        let list = match TrustList::decode(&handle.buffer) {
            Ok(list) => list,
            Err(status) => {
                // An undecodable buffer aborts the staged update
                self.discard_transaction();
                return Err(status);
            }
        };

        let transaction = match &mut self.transaction {
            Some(transaction) if transaction.session_id == session_id => transaction,
            _ => return Err(StatusCode::BadInvalidState),
        };

        transaction.state = TransactionState::Pending;
        match transaction
            .staged_trust_lists
            .iter_mut()
            .find(|(group, _)| *group == handle.group_id)
        {
            Some((_, staged)) => *staged = list,
            None => transaction.staged_trust_lists.push((handle.group_id.clone(), list)),
        }

        logging::info!(self.log, "trust list staged";
                       "context" => "close_and_update",
                       "group" => &handle.group_id);

        Ok(true)
    }

    /// Stages a new server certificate + private key. Returns
    /// `applyChangesRequired = true`.
    #[allow(clippy::too_many_arguments)]
    pub fn update_certificate(
        &mut self,
        group_id: &str,
        cert_type_id: &str,
        cert_der: &[u8],
        issuer_chain: &[Vec<u8>],
        private_key: &[u8],
        current_key: Option<&RsaPrivateKey>,
        session_id: SessionId,
    ) -> Result<bool, StatusCode> {
        if !SUPPORTED_CERT_TYPES.contains(&cert_type_id) {
            return Err(StatusCode::BadNotSupported);
        }

        let cert = Certificate::parse(cert_der).map_err(|_| StatusCode::BadCertificateInvalid)?;

        for issuer in issuer_chain {
            Certificate::parse(issuer).map_err(|_| StatusCode::BadCertificateInvalid)?;
        }

        // An empty key means "keep the current one" (the CSR flow), with a
        // regenerated CSR key taking precedence
        let key = if private_key.is_empty() {
            match self.pending_csr_key.take() {
                Some((pending_group, key)) if pending_group == group_id => key,
                _ => current_key.cloned().ok_or(StatusCode::BadInvalidArgument)?,
            }
        } else {
            crypto::parse_private_key(private_key).map_err(|_| StatusCode::BadSecurityChecksFailed)?
        };

        if !crypto::key_pair_matches(&key, cert.public_key()) {
            return Err(StatusCode::BadSecurityChecksFailed);
        }

        self.enter_transaction(session_id)?;
        let transaction = self.transaction.as_mut().expect("Just entered");

        transaction.state = TransactionState::Pending;
        transaction.staged_cert_update = Some(StagedCertUpdate {
            group_id: group_id.to_string(),
            cert_type_id: cert_type_id.to_string(),
            cert,
            private_key: key,
        });

        logging::info!(self.log, "certificate update staged";
                       "context" => "update_certificate",
                       "group" => group_id,
                       "cert_type" => cert_type_id);

        Ok(true)
    }

    /// Emits a PKCS#10 CSR for the group, optionally over a freshly
    /// generated key. SANs are copied from the current certificate.
    pub fn create_signing_request(
        &mut self,
        group_id: &str,
        cert_type_id: &str,
        subject: &[String],
        regenerate_key: bool,
        current_cert: Option<&Certificate>,
        current_key: Option<&RsaPrivateKey>,
    ) -> Result<Vec<u8>, StatusCode> {
        if !SUPPORTED_CERT_TYPES.contains(&cert_type_id) {
            return Err(StatusCode::BadNotSupported);
        }

        let subject = if subject.is_empty() {
            match current_cert {
                // The formatter joins RDNs with ", "; the builder wants bare commas
                Some(cert) => cert.subject().replace(", ", ","),
                None => return Err(StatusCode::BadInvalidArgument),
            }
        } else {
            subject.join(",")
        };

        let san = current_cert.map(|cert| cert.san().to_vec()).unwrap_or_default();

        let key = if regenerate_key {
            let key = crypto::generate_rsa_key(2048).map_err(|_| StatusCode::BadInternalError)?;
            self.pending_csr_key = Some((group_id.to_string(), key.clone()));
            key
        } else {
            current_key.cloned().ok_or(StatusCode::BadInvalidArgument)?
        };

        forge::create_signing_request(&key, &subject, &san).map_err(|_| StatusCode::BadInternalError)
    }

    /// Concatenation of the per-group rejected lists, deduplicated.
    pub fn get_rejected_list(&self, store: &TrustStore) -> Vec<Vec<u8>> {
        let mut all: Vec<Vec<u8>> = Vec::new();

        for group_id in store.group_ids() {
            if let Ok(rejected) = store.get_rejected_list(group_id) {
                for der in rejected {
                    if !all.contains(&der) {
                        all.push(der);
                    }
                }
            }
        }

        all
    }

    /// Adds a single trusted certificate immediately (no transaction).
    pub fn add_certificate(
        &mut self,
        store: &mut TrustStore,
        group_id: &str,
        cert_der: &[u8],
        is_trusted: bool,
    ) -> Result<(), StatusCode> {
        if self.open_count(group_id) > 0 {
            return Err(StatusCode::BadInvalidState);
        }
        if !is_trusted {
            return Err(StatusCode::BadInvalidArgument);
        }

        let cert = Certificate::parse(cert_der).map_err(|_| StatusCode::BadCertificateInvalid)?;

        // CA certificates belong in a trust list update, not here
        if cert.is_ca() {
            return Err(StatusCode::BadInvalidArgument);
        }

        let addition = TrustList {
            specified_lists: masks::TRUSTED_CERTIFICATES,
            trusted_certs: vec![cert_der.to_vec()],
            ..TrustList::default()
        };

        store.add_to_trust_list(group_id, &addition)
    }

    /// Removes a certificate by thumbprint, together with any CRLs it
    /// issued. Applied immediately as a single-shot transaction.
    pub fn remove_certificate(
        &mut self,
        store: &mut TrustStore,
        group_id: &str,
        thumbprint: &str,
        is_trusted: bool,
    ) -> Result<(), StatusCode> {
        if self.open_count(group_id) > 0 {
            return Err(StatusCode::BadInvalidState);
        }
        if self.transaction.is_some() {
            return Err(StatusCode::BadTransactionPending);
        }

        let list = store.get_trust_list(group_id, masks::ALL)?;
        let (certs, cert_mask, crls, crl_mask) = if is_trusted {
            (&list.trusted_certs, masks::TRUSTED_CERTIFICATES, &list.trusted_crls, masks::TRUSTED_CRLS)
        } else {
            (&list.issuer_certs, masks::ISSUER_CERTIFICATES, &list.issuer_crls, masks::ISSUER_CRLS)
        };

        let wanted = thumbprint.to_ascii_lowercase();
        let mut removal = TrustList::default();
        let mut removed_subject = None;

        for der in certs {
            if let Ok(cert) = Certificate::parse(der) {
                if hex(cert.thumbprint()) == wanted {
                    removed_subject = Some(cert.subject().to_string());
                    removal.specified_lists |= cert_mask;
                    match cert_mask {
                        masks::TRUSTED_CERTIFICATES => removal.trusted_certs.push(der.clone()),
                        _ => removal.issuer_certs.push(der.clone()),
                    }
                }
            }
        }

        let removed_subject = removed_subject.ok_or(StatusCode::BadNotFound)?;

        for der in crls {
            if let Ok(crl) = flint::cert::Crl::parse(der) {
                if crl.issuer() == removed_subject {
                    removal.specified_lists |= crl_mask;
                    match crl_mask {
                        masks::TRUSTED_CRLS => removal.trusted_crls.push(der.clone()),
                        _ => removal.issuer_crls.push(der.clone()),
                    }
                }
            }
        }

        store.remove_from_trust_list(group_id, &removal)
    }

    /// Commits the transaction. Staged trust lists hit the live store here;
    /// a staged certificate update is returned for the server to apply to
    /// its security policies.
    pub fn apply_changes(
        &mut self,
        store: &mut TrustStore,
        session_id: SessionId,
    ) -> Result<ApplyOutcome, StatusCode> {
        match &self.transaction {
            None => return Err(StatusCode::BadNothingToDo),
            Some(transaction) if transaction.session_id != session_id => {
                return Err(StatusCode::BadUserAccessDenied)
            }
            Some(transaction) if transaction.state != TransactionState::Pending => {
                return Err(StatusCode::BadNothingToDo)
            }
            Some(_) => (),
        }
        let transaction = self.transaction.take().expect("Checked above");

        let mut trust_changed_groups = Vec::new();
        for (group_id, staged) in &transaction.staged_trust_lists {
            store.set_trust_list(group_id, staged)?;
            trust_changed_groups.push(group_id.clone());
        }

        // Write handles of the committed transaction are gone by definition
        // (CloseAndUpdate removed them); drop any leftover read handles the
        // owner still has so OpenCount reflects the commit
        self.handles.retain(|handle| handle.session_id != session_id);

        logging::info!(self.log, "transaction committed";
                       "context" => "apply_changes",
                       "groups" => trust_changed_groups.len(),
                       "cert_update" => transaction.staged_cert_update.is_some());

        Ok(ApplyOutcome {
            trust_changed_groups,
            cert_update: transaction.staged_cert_update,
        })
    }

    /// Discards the transaction and closes the dead session's handles.
    /// Returns true while the sweep should stay registered.
    pub fn sweep_dead_sessions(&mut self, sessions: &SessionManager) -> bool {
        if let Some(transaction) = &self.transaction {
            if !sessions.is_alive(transaction.session_id) {
                logging::warn!(self.log, "transaction owner session gone, discarding";
                               "context" => "sweep_dead_sessions",
                               "session_id" => transaction.session_id);
                self.discard_transaction();
            }
        }

        self.handles.retain(|handle| sessions.is_alive(handle.session_id));

        self.needs_liveness_sweep()
    }

    fn enter_transaction(&mut self, session_id: SessionId) -> Result<(), StatusCode> {
        match &self.transaction {
            None => {
                self.transaction = Some(Transaction {
                    session_id,
                    state: TransactionState::Fresh,
                    staged_trust_lists: Vec::new(),
                    staged_cert_update: None,
                });
                Ok(())
            }
            Some(transaction) if transaction.session_id == session_id => Ok(()),
            Some(_) => Err(StatusCode::BadTransactionPending),
        }
    }

    fn discard_transaction(&mut self) {
        if let Some(transaction) = self.transaction.take() {
            // Any write handles belonging to the transaction die with it
            self.handles
                .retain(|handle| !(handle.write_mode && handle.session_id == transaction.session_id));
        }
    }

    fn insert_handle(
        &mut self,
        group_id: &str,
        session_id: SessionId,
        write_mode: bool,
        buffer: Vec<u8>,
    ) -> u32 {
        let handle_id = self.next_handle;
        self.next_handle += 1;

        self.handles.push(FileHandle {
            handle_id,
            session_id,
            group_id: group_id.to_string(),
            write_mode,
            buffer,
            cursor: 0,
        });

        logging::debug!(self.log, "file handle opened";
                        "context" => "insert_handle",
                        "handle" => handle_id,
                        "group" => group_id,
                        "write" => write_mode);

        handle_id
    }

    fn handle(&self, handle_id: u32, session_id: SessionId) -> Result<&FileHandle, StatusCode> {
        let handle = self
            .handles
            .iter()
            .find(|handle| handle.handle_id == handle_id)
            .ok_or(StatusCode::BadInvalidArgument)?;

        if handle.session_id != session_id {
            return Err(StatusCode::BadUserAccessDenied);
        }
        Ok(handle)
    }

    fn handle_mut(&mut self, handle_id: u32, session_id: SessionId) -> Result<&mut FileHandle, StatusCode> {
        let handle = self
            .handles
            .iter_mut()
            .find(|handle| handle.handle_id == handle_id)
            .ok_or(StatusCode::BadInvalidArgument)?;

        if handle.session_id != session_id {
            return Err(StatusCode::BadUserAccessDenied);
        }
        Ok(handle)
    }

    fn handle_index(&self, handle_id: u32, session_id: SessionId) -> Result<usize, StatusCode> {
        let index = self
            .handles
            .iter()
            .position(|handle| handle.handle_id == handle_id)
            .ok_or(StatusCode::BadInvalidArgument)?;

        if self.handles[index].session_id != session_id {
            return Err(StatusCode::BadUserAccessDenied);
        }
        Ok(index)
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
