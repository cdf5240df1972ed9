//! PKI trust store: certificate groups, trust lists, rejected lists and the
//! certificate verification algorithm.
//!
//! Raw DER is the identity of every stored item. Parsed views are rebuilt
//! lazily after a mutation; the rebuild happens off to the side and is
//! swapped in whole, so a failing parse never leaves the group half reloaded.

use crate::codec;
use crate::net::support::{SizedRead, SizedWrite};
use crate::status::StatusCode;
use flint::cert::{Certificate, Crl, TimeValidity};
use flint::logging;
use flint::time::timestamp_secs;
use std::io::Cursor;

pub const DEFAULT_APPLICATION_GROUP: &str = "DefaultApplicationGroup";
pub const DEFAULT_USER_TOKEN_GROUP: &str = "DefaultUserTokenGroup";

/// Smallest RSA modulus the verification profile accepts.
const MIN_PROFILE_KEY_BITS: usize = 1024;

/// Bits of the `specifiedLists` selector.
pub mod masks {
    pub const NONE: u32 = 0;
    pub const TRUSTED_CERTIFICATES: u32 = 1;
    pub const TRUSTED_CRLS: u32 = 2;
    pub const ISSUER_CERTIFICATES: u32 = 4;
    pub const ISSUER_CRLS: u32 = 8;
    pub const ALL: u32 = 15;
}

/// The four DER sets defining a PKI policy, plus the selector saying which
/// of them are meaningful in this instance.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct TrustList {
    pub specified_lists: u32,
    pub trusted_certs: Vec<Vec<u8>>,
    pub trusted_crls: Vec<Vec<u8>>,
    pub issuer_certs: Vec<Vec<u8>>,
    pub issuer_crls: Vec<Vec<u8>>,
}

impl TrustList {
    #[inline]
    pub fn empty() -> TrustList {
        TrustList {
            specified_lists: masks::ALL,
            ..TrustList::default()
        }
    }

    /// True when all four sets are empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.trusted_certs.is_empty()
            && self.trusted_crls.is_empty()
            && self.issuer_certs.is_empty()
            && self.issuer_crls.is_empty()
    }

    /// Aggregate byte count over all four sets.
    pub fn total_size(&self) -> usize {
        let sum = |items: &[Vec<u8>]| items.iter().map(Vec::len).sum::<usize>();
        sum(&self.trusted_certs) + sum(&self.trusted_crls) + sum(&self.issuer_certs) + sum(&self.issuer_crls)
    }

    /// Copy restricted to the lists selected by `mask`.
    pub fn filtered(&self, mask: u32) -> TrustList {
        let pick = |bit: u32, items: &[Vec<u8>]| {
            if mask & bit != 0 {
                items.to_vec()
            } else {
                Vec::new()
            }
        };

        TrustList {
            specified_lists: self.specified_lists & mask,
            trusted_certs: pick(masks::TRUSTED_CERTIFICATES, &self.trusted_certs),
            trusted_crls: pick(masks::TRUSTED_CRLS, &self.trusted_crls),
            issuer_certs: pick(masks::ISSUER_CERTIFICATES, &self.issuer_certs),
            issuer_crls: pick(masks::ISSUER_CRLS, &self.issuer_crls),
        }
    }

    /// Set-union by DER equality over the lists `other` specifies.
    pub fn merge(&mut self, other: &TrustList) {
        fn union(target: &mut Vec<Vec<u8>>, source: &[Vec<u8>]) {
            for item in source {
                if !target.iter().any(|existing| existing == item) {
                    target.push(item.clone());
                }
            }
        }

        if other.specified_lists & masks::TRUSTED_CERTIFICATES != 0 {
            union(&mut self.trusted_certs, &other.trusted_certs);
        }
        if other.specified_lists & masks::TRUSTED_CRLS != 0 {
            union(&mut self.trusted_crls, &other.trusted_crls);
        }
        if other.specified_lists & masks::ISSUER_CERTIFICATES != 0 {
            union(&mut self.issuer_certs, &other.issuer_certs);
        }
        if other.specified_lists & masks::ISSUER_CRLS != 0 {
            union(&mut self.issuer_crls, &other.issuer_crls);
        }
    }

    /// Set-difference by DER equality over the lists `other` specifies.
    pub fn subtract(&mut self, other: &TrustList) {
        fn difference(target: &mut Vec<Vec<u8>>, source: &[Vec<u8>]) {
            target.retain(|existing| !source.iter().any(|item| item == existing));
        }

        if other.specified_lists & masks::TRUSTED_CERTIFICATES != 0 {
            difference(&mut self.trusted_certs, &other.trusted_certs);
        }
        if other.specified_lists & masks::TRUSTED_CRLS != 0 {
            difference(&mut self.trusted_crls, &other.trusted_crls);
        }
        if other.specified_lists & masks::ISSUER_CERTIFICATES != 0 {
            difference(&mut self.issuer_certs, &other.issuer_certs);
        }
        if other.specified_lists & masks::ISSUER_CRLS != 0 {
            difference(&mut self.issuer_crls, &other.issuer_crls);
        }
    }

    /// Replaces the lists `other` specifies with `other`'s contents.
    pub fn replace_specified(&mut self, other: &TrustList) {
        if other.specified_lists & masks::TRUSTED_CERTIFICATES != 0 {
            self.trusted_certs = other.trusted_certs.clone();
        }
        if other.specified_lists & masks::TRUSTED_CRLS != 0 {
            self.trusted_crls = other.trusted_crls.clone();
        }
        if other.specified_lists & masks::ISSUER_CERTIFICATES != 0 {
            self.issuer_certs = other.issuer_certs.clone();
        }
        if other.specified_lists & masks::ISSUER_CRLS != 0 {
            self.issuer_crls = other.issuer_crls.clone();
        }
    }

    /// The standard binary encoding:
    /// `specifiedLists | trustedCerts[] | trustedCrls[] | issuerCerts[] | issuerCrls[]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        self.write(&mut cursor).expect("In-memory trust list encoding cannot fail");
        cursor.into_inner()
    }

    fn write<W: SizedWrite>(&self, stream: &mut W) -> Result<(), StatusCode> {
        use byteorder::{LittleEndian, WriteBytesExt};

        stream
            .write_u32::<LittleEndian>(self.specified_lists)
            .map_err(|_| StatusCode::BadInternalError)?;

        for list in [
            &self.trusted_certs,
            &self.trusted_crls,
            &self.issuer_certs,
            &self.issuer_crls,
        ] {
            codec::write_byte_string_array(stream, Some(list))
                .map_err(|_| StatusCode::BadInternalError)?;
        }

        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<TrustList, StatusCode> {
        use byteorder::{LittleEndian, ReadBytesExt};

        let mut stream = Cursor::new(data);
        if stream.remaining_data() < 4 {
            return Err(StatusCode::BadInvalidArgument);
        }

        let specified_lists = stream
            .read_u32::<LittleEndian>()
            .map_err(|_| StatusCode::BadInvalidArgument)?;

        let mut read_list = || -> Result<Vec<Vec<u8>>, StatusCode> {
            codec::read_byte_string_array(&mut stream)
                .map_err(|_| StatusCode::BadInvalidArgument)
                .map(Option::unwrap_or_default)
        };

        Ok(TrustList {
            specified_lists,
            trusted_certs: read_list()?,
            trusted_crls: read_list()?,
            issuer_certs: read_list()?,
            issuer_crls: read_list()?,
        })
    }
}

/// Parsed view of a group's trust material, rebuilt after mutations.
#[derive(Default)]
struct ParsedCache {
    trusted_certs: Vec<Certificate>,
    trusted_crls: Vec<Crl>,
    issuer_certs: Vec<Certificate>,
    issuer_crls: Vec<Crl>,
}

pub struct CertificateGroup {
    id: String,
    trust_list: TrustList,
    rejected: Vec<Vec<u8>>,
    max_trust_list_size: usize,
    max_rejected_list_size: usize,
    reload_required: bool,
    parsed: ParsedCache,
    last_update_time: i64,
}

impl CertificateGroup {
    fn new(id: &str, max_trust_list_size: usize, max_rejected_list_size: usize) -> CertificateGroup {
        CertificateGroup {
            id: id.to_string(),
            trust_list: TrustList::empty(),
            rejected: Vec::new(),
            max_trust_list_size,
            max_rejected_list_size,
            reload_required: false,
            parsed: ParsedCache::default(),
            last_update_time: timestamp_secs() as i64,
        }
    }
}

enum ChainOutcome {
    Ok,
    ProfileRejected,
    NotTrusted,
    TimeInvalid,
    Revoked,
}

pub struct TrustStore {
    groups: Vec<CertificateGroup>,
    log: logging::Logger,
}

impl TrustStore {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> TrustStore {
        TrustStore {
            groups: Vec::new(),
            log: logging::child(log),
        }
    }

    /// Creates a store with the two well-known groups.
    pub fn with_default_groups<'a, L: Into<Option<&'a logging::Logger>>>(
        max_trust_list_size: usize,
        max_rejected_list_size: usize,
        log: L,
    ) -> TrustStore {
        let mut store = TrustStore::new(log);
        store.add_group(DEFAULT_APPLICATION_GROUP, max_trust_list_size, max_rejected_list_size);
        store.add_group(DEFAULT_USER_TOKEN_GROUP, max_trust_list_size, max_rejected_list_size);
        store
    }

    pub fn add_group(&mut self, id: &str, max_trust_list_size: usize, max_rejected_list_size: usize) {
        if self.groups.iter().any(|group| group.id == id) {
            panic!("Duplicate certificate group {}", id);
        }

        self.groups
            .push(CertificateGroup::new(id, max_trust_list_size, max_rejected_list_size));
    }

    #[inline]
    pub fn group_ids(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|group| group.id.as_str())
    }

    #[inline]
    pub fn has_group(&self, id: &str) -> bool {
        self.groups.iter().any(|group| group.id == id)
    }

    /// Unix timestamp of the group's last trust list mutation.
    pub fn last_update_time(&self, group_id: &str) -> Result<i64, StatusCode> {
        Ok(self.group(group_id)?.last_update_time)
    }

    /// Filtered copy of the group's trust list.
    pub fn get_trust_list(&self, group_id: &str, mask: u32) -> Result<TrustList, StatusCode> {
        Ok(self.group(group_id)?.trust_list.filtered(mask))
    }

    /// Replaces the lists selected by `list.specified_lists`.
    pub fn set_trust_list(&mut self, group_id: &str, list: &TrustList) -> Result<(), StatusCode> {
        let group = self.group_mut(group_id)?;

        let mut candidate = group.trust_list.clone();
        candidate.replace_specified(list);
        Self::check_size(group, &candidate)?;

        group.trust_list = candidate;
        Self::mark_updated(group);
        Ok(())
    }

    /// Set-union of the given lists into the group.
    pub fn add_to_trust_list(&mut self, group_id: &str, list: &TrustList) -> Result<(), StatusCode> {
        let group = self.group_mut(group_id)?;

        let mut candidate = group.trust_list.clone();
        candidate.merge(list);
        Self::check_size(group, &candidate)?;

        group.trust_list = candidate;
        Self::mark_updated(group);
        Ok(())
    }

    /// Set-difference of the given lists out of the group.
    pub fn remove_from_trust_list(&mut self, group_id: &str, list: &TrustList) -> Result<(), StatusCode> {
        let group = self.group_mut(group_id)?;

        group.trust_list.subtract(list);
        Self::mark_updated(group);
        Ok(())
    }

    /// The recently rejected certificates, most recent first.
    pub fn get_rejected_list(&self, group_id: &str) -> Result<Vec<Vec<u8>>, StatusCode> {
        Ok(self.group(group_id)?.rejected.clone())
    }

    /// Appends to the bounded rejected FIFO. Re-adding an already rejected
    /// certificate moves it to the front; overflow evicts the oldest.
    pub fn add_to_rejected_list(&mut self, group_id: &str, der: &[u8]) -> Result<(), StatusCode> {
        let group = self.group_mut(group_id)?;

        group.rejected.retain(|existing| existing[..] != *der);
        group.rejected.insert(0, der.to_vec());

        if group.max_rejected_list_size != 0 && group.rejected.len() > group.max_rejected_list_size {
            group.rejected.truncate(group.max_rejected_list_size);
        }

        Ok(())
    }

    /// Runs the verification algorithm against the group's current trust
    /// material and appends rejectable failures to the rejected list.
    pub fn verify_certificate(&mut self, group_id: &str, der: &[u8]) -> Result<(), StatusCode> {
        self.verify_certificate_at(group_id, der, timestamp_secs() as i64)
    }

    pub fn verify_certificate_at(
        &mut self,
        group_id: &str,
        der: &[u8],
        now_secs: i64,
    ) -> Result<(), StatusCode> {
        let result = self.verify_inner(group_id, der, now_secs);

        if let Err(status) = result {
            if is_rejectable(status) {
                // Best effort bookkeeping; a full list is not an error
                if self.add_to_rejected_list(group_id, der).is_err() {
                    logging::warn!(self.log, "rejected list append failed";
                                   "context" => "verify_certificate",
                                   "group" => group_id);
                }
            }
        }

        result
    }

    fn verify_inner(&mut self, group_id: &str, der: &[u8], now_secs: i64) -> Result<(), StatusCode> {
        self.reload_if_needed(group_id)?;
        let log = self.log.clone();
        let group = self.group_mut(group_id)?;

        // An unconfigured store accepts everything
        if group.trust_list.is_empty() {
            logging::debug!(log, "no store configured, accepting certificate";
                            "context" => "verify_certificate",
                            "group" => group_id);
            return Ok(());
        }

        let leaf = Certificate::parse(der).map_err(|_| StatusCode::BadSecurityChecksFailed)?;

        let trusted_outcome =
            chain_outcome(&leaf, &group.parsed.trusted_certs, &group.parsed.trusted_crls, now_secs);

        let directly_trusted = group
            .parsed
            .trusted_certs
            .iter()
            .any(|cert| cert.der() == leaf.der());

        match trusted_outcome {
            ChainOutcome::Ok => {
                if !leaf.is_self_signed() || !directly_trusted {
                    // A parent signed this leaf: its revocation state must be
                    // knowable
                    let has_crl = crl_for_issuer(&group.parsed.trusted_crls, leaf.issuer())
                        || crl_for_issuer(&group.parsed.issuer_crls, leaf.issuer());
                    if !has_crl {
                        return Err(StatusCode::BadCertificateRevocationUnknown);
                    }
                }

                if leaf.is_ca() {
                    return Err(StatusCode::BadCertificateUseNotAllowed);
                }

                Ok(())
            }
            ChainOutcome::TimeInvalid if directly_trusted => {
                // Self-trusted: retry over the issuer lists to see whether a
                // proper chain exists despite the leaf's clock trouble
                let issuer_outcome = chain_outcome(
                    &leaf,
                    &group.parsed.issuer_certs,
                    &group.parsed.issuer_crls,
                    now_secs,
                );

                match issuer_outcome {
                    // Self-trust excuses the clock trouble, so time flags on
                    // the issuer chain do not fail it again
                    ChainOutcome::Ok | ChainOutcome::TimeInvalid => {
                        let anchor = revocation_anchor(&leaf, group);
                        let has_crl = crl_for_issuer(&group.parsed.issuer_crls, &anchor)
                            || crl_for_issuer(&group.parsed.trusted_crls, &anchor);
                        if !has_crl {
                            return Err(StatusCode::BadCertificateIssuerRevocationUnknown);
                        }

                        if leaf.is_ca() {
                            return Err(StatusCode::BadCertificateUseNotAllowed);
                        }
                        Ok(())
                    }
                    ChainOutcome::Revoked => Err(StatusCode::BadCertificateRevoked),
                    _ => Err(StatusCode::BadCertificateTimeInvalid),
                }
            }
            ChainOutcome::TimeInvalid => Err(StatusCode::BadCertificateTimeInvalid),
            ChainOutcome::NotTrusted => Err(StatusCode::BadCertificateUntrusted),
            ChainOutcome::Revoked => Err(StatusCode::BadCertificateRevoked),
            ChainOutcome::ProfileRejected => Err(StatusCode::BadSecurityChecksFailed),
        }
    }

    fn check_size(group: &CertificateGroup, candidate: &TrustList) -> Result<(), StatusCode> {
        if group.max_trust_list_size != 0 && candidate.total_size() > group.max_trust_list_size {
            return Err(StatusCode::BadRequestTooLarge);
        }
        Ok(())
    }

    fn mark_updated(group: &mut CertificateGroup) {
        group.reload_required = true;
        group.last_update_time = timestamp_secs() as i64;
    }

    /// Rebuilds the parsed caches if a mutation happened since the last
    /// verification. The new cache is built aside and swapped in whole.
    fn reload_if_needed(&mut self, group_id: &str) -> Result<(), StatusCode> {
        let group = self.group_mut(group_id)?;
        if !group.reload_required {
            return Ok(());
        }

        let mut cache = ParsedCache::default();

        for der in &group.trust_list.trusted_certs {
            match Certificate::parse(der) {
                Ok(cert) => cache.trusted_certs.push(cert),
                Err(_) => return Err(StatusCode::BadCertificateInvalid),
            }
        }
        for der in &group.trust_list.issuer_certs {
            match Certificate::parse(der) {
                Ok(cert) => cache.issuer_certs.push(cert),
                Err(_) => return Err(StatusCode::BadCertificateInvalid),
            }
        }
        for der in &group.trust_list.trusted_crls {
            match Crl::parse(der) {
                Ok(crl) => cache.trusted_crls.push(crl),
                Err(_) => return Err(StatusCode::BadCertificateInvalid),
            }
        }
        for der in &group.trust_list.issuer_crls {
            match Crl::parse(der) {
                Ok(crl) => cache.issuer_crls.push(crl),
                Err(_) => return Err(StatusCode::BadCertificateInvalid),
            }
        }

        group.parsed = cache;
        group.reload_required = false;
        Ok(())
    }

    fn group(&self, id: &str) -> Result<&CertificateGroup, StatusCode> {
        self.groups
            .iter()
            .find(|group| group.id == id)
            .ok_or(StatusCode::BadNotFound)
    }

    fn group_mut(&mut self, id: &str) -> Result<&mut CertificateGroup, StatusCode> {
        self.groups
            .iter_mut()
            .find(|group| group.id == id)
            .ok_or(StatusCode::BadNotFound)
    }
}

/// Verifies the leaf against one (certs, crls) pair the way the engine does:
/// anchor lookup, signature, validity window, revocation by issuer DN.
fn chain_outcome(leaf: &Certificate, certs: &[Certificate], crls: &[Crl], now_secs: i64) -> ChainOutcome {
    if leaf.key_bits() < MIN_PROFILE_KEY_BITS {
        return ChainOutcome::ProfileRejected;
    }

    let directly_trusted = certs.iter().any(|cert| cert.der() == leaf.der());
    let parent = certs
        .iter()
        .find(|cert| leaf.issued_by(cert) && leaf.verify_signed_by(cert).is_ok());

    if !directly_trusted && parent.is_none() {
        return ChainOutcome::NotTrusted;
    }

    // Revocation wins over clock trouble
    for crl in crls {
        if crl.issuer() == leaf.issuer() {
            if crl.revokes_serial(leaf.serial()) || crl.is_expired(now_secs) {
                return ChainOutcome::Revoked;
            }
        }
    }

    if leaf.validity_at(now_secs) != TimeValidity::Valid {
        return ChainOutcome::TimeInvalid;
    }
    if let Some(parent) = parent {
        if parent.validity_at(now_secs) != TimeValidity::Valid {
            return ChainOutcome::TimeInvalid;
        }
    }

    ChainOutcome::Ok
}

/// The DN whose CRL governs the leaf's revocation in the issuer-chain path.
/// If the parent's own issuer is trusted, the grandparent is promoted as the
/// effective anchor.
fn revocation_anchor(leaf: &Certificate, group: &CertificateGroup) -> String {
    let parent = group
        .parsed
        .issuer_certs
        .iter()
        .find(|cert| leaf.issued_by(cert));

    if let Some(parent) = parent {
        let grandparent_trusted = group
            .parsed
            .trusted_certs
            .iter()
            .any(|cert| parent.issued_by(cert) && cert.der() != parent.der());
        if grandparent_trusted {
            return parent.issuer().to_string();
        }
        return parent.subject().to_string();
    }

    leaf.issuer().to_string()
}

#[inline]
fn crl_for_issuer(crls: &[Crl], issuer: &str) -> bool {
    crls.iter().any(|crl| crl.issuer() == issuer)
}

/// True for verification verdicts that also land the certificate on the
/// rejected list.
#[inline]
pub fn is_rejectable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BadCertificateUntrusted
            | StatusCode::BadCertificateUseNotAllowed
            | StatusCode::BadCertificateRevocationUnknown
            | StatusCode::BadCertificateIssuerRevocationUnknown
    )
}

/// The deliberately permissive application URI check. With `strict` unset, a
/// certificate without SAN octets passes.
pub fn verify_application_uri(cert: &Certificate, uri: &str, strict: bool) -> Result<(), StatusCode> {
    if cert.san().is_empty() && !strict {
        return Ok(());
    }

    if cert.contains_application_uri(uri) {
        Ok(())
    } else {
        Err(StatusCode::BadCertificateUriInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flint::cert::SanEntry;
    use flint::crypto;
    use flint::forge;
    use lazy_static::lazy_static;
    use rsa::RsaPrivateKey;

    lazy_static! {
        static ref CA_KEY: RsaPrivateKey = crypto::generate_rsa_key(2048).unwrap();
        static ref LEAF_KEY: RsaPrivateKey = crypto::generate_rsa_key(2048).unwrap();
    }

    fn store() -> TrustStore {
        TrustStore::with_default_groups(65536, 100, None)
    }

    fn ca() -> Certificate {
        forge::create_ca(&*CA_KEY, "CN=pki-root", 3650).unwrap()
    }

    fn leaf_signed_by_ca(ca_cert: &Certificate) -> Certificate {
        forge::create_signed(
            &*LEAF_KEY,
            "CN=pki-leaf",
            &[SanEntry::Uri("urn:girder:pki-leaf".to_string())],
            365,
            ca_cert,
            &*CA_KEY,
        )
        .unwrap()
    }

    fn self_signed_leaf() -> Certificate {
        forge::create_self_signed(&*LEAF_KEY, "CN=pki-self", &[], 365).unwrap()
    }

    fn trust(store: &mut TrustStore, mask: u32, items: Vec<Vec<u8>>) {
        let list = match mask {
            masks::TRUSTED_CERTIFICATES => TrustList {
                specified_lists: mask,
                trusted_certs: items,
                ..TrustList::default()
            },
            masks::TRUSTED_CRLS => TrustList {
                specified_lists: mask,
                trusted_crls: items,
                ..TrustList::default()
            },
            masks::ISSUER_CERTIFICATES => TrustList {
                specified_lists: mask,
                issuer_certs: items,
                ..TrustList::default()
            },
            masks::ISSUER_CRLS => TrustList {
                specified_lists: mask,
                issuer_crls: items,
                ..TrustList::default()
            },
            _ => panic!("Single mask expected"),
        };
        store.add_to_trust_list(DEFAULT_APPLICATION_GROUP, &list).unwrap();
    }

    #[test]
    fn test_empty_store_accepts() {
        let mut store = store();
        let leaf = self_signed_leaf();

        store
            .verify_certificate(DEFAULT_APPLICATION_GROUP, leaf.der())
            .unwrap();
    }

    #[test]
    fn test_directly_trusted_self_signed_accepts_without_crl() {
        let mut store = store();
        let leaf = self_signed_leaf();
        trust(&mut store, masks::TRUSTED_CERTIFICATES, vec![leaf.der().to_vec()]);

        store
            .verify_certificate(DEFAULT_APPLICATION_GROUP, leaf.der())
            .unwrap();
    }

    #[test]
    fn test_untrusted_rejected_and_listed() {
        let mut store = store();
        let anchor = self_signed_leaf();
        trust(&mut store, masks::TRUSTED_CERTIFICATES, vec![anchor.der().to_vec()]);

        let stranger = forge::create_self_signed(&*CA_KEY, "CN=stranger", &[], 365).unwrap();
        let result = store.verify_certificate(DEFAULT_APPLICATION_GROUP, stranger.der());

        assert_eq!(result.unwrap_err(), StatusCode::BadCertificateUntrusted);
        let rejected = store.get_rejected_list(DEFAULT_APPLICATION_GROUP).unwrap();
        assert_eq!(rejected, vec![stranger.der().to_vec()]);
    }

    #[test]
    fn test_chained_leaf_requires_crl() {
        let mut store = store();
        let ca_cert = ca();
        let leaf = leaf_signed_by_ca(&ca_cert);
        trust(&mut store, masks::TRUSTED_CERTIFICATES, vec![ca_cert.der().to_vec()]);

        // No CRL for the signing parent
        assert_eq!(
            store
                .verify_certificate(DEFAULT_APPLICATION_GROUP, leaf.der())
                .unwrap_err(),
            StatusCode::BadCertificateRevocationUnknown
        );

        // With an (empty) CRL from the CA the leaf verifies
        let crl = forge::create_crl(&*CA_KEY, &ca_cert, &[], 30).unwrap();
        trust(&mut store, masks::TRUSTED_CRLS, vec![crl.der().to_vec()]);

        store
            .verify_certificate(DEFAULT_APPLICATION_GROUP, leaf.der())
            .unwrap();
    }

    #[test]
    fn test_revoked_leaf() {
        let mut store = store();
        let ca_cert = ca();
        let leaf = leaf_signed_by_ca(&ca_cert);
        let crl = forge::create_crl(&*CA_KEY, &ca_cert, &[leaf.serial().to_vec()], 30).unwrap();

        trust(&mut store, masks::TRUSTED_CERTIFICATES, vec![ca_cert.der().to_vec()]);
        trust(&mut store, masks::TRUSTED_CRLS, vec![crl.der().to_vec()]);

        assert_eq!(
            store
                .verify_certificate(DEFAULT_APPLICATION_GROUP, leaf.der())
                .unwrap_err(),
            StatusCode::BadCertificateRevoked
        );
    }

    #[test]
    fn test_ca_certificate_not_usable_as_end_entity() {
        let mut store = store();
        let ca_cert = ca();
        trust(&mut store, masks::TRUSTED_CERTIFICATES, vec![ca_cert.der().to_vec()]);

        let result = store.verify_certificate(DEFAULT_APPLICATION_GROUP, ca_cert.der());
        assert_eq!(result.unwrap_err(), StatusCode::BadCertificateUseNotAllowed);

        // UseNotAllowed is a rejectable verdict
        let rejected = store.get_rejected_list(DEFAULT_APPLICATION_GROUP).unwrap();
        assert_eq!(rejected.len(), 1);
    }

    #[test]
    fn test_expired_leaf_time_invalid() {
        let mut store = store();
        let leaf = self_signed_leaf();
        trust(&mut store, masks::TRUSTED_CERTIFICATES, vec![leaf.der().to_vec()]);

        let far_future = timestamp_secs() as i64 + 366 * 86_400;
        assert_eq!(
            store
                .verify_certificate_at(DEFAULT_APPLICATION_GROUP, leaf.der(), far_future)
                .unwrap_err(),
            StatusCode::BadCertificateTimeInvalid
        );

        // Time trouble alone does not land on the rejected list
        assert!(store.get_rejected_list(DEFAULT_APPLICATION_GROUP).unwrap().is_empty());
    }

    #[test]
    fn test_expired_self_trusted_with_issuer_chain() {
        let mut store = store();
        let ca_cert = ca();
        let leaf = leaf_signed_by_ca(&ca_cert);

        trust(&mut store, masks::TRUSTED_CERTIFICATES, vec![leaf.der().to_vec()]);
        trust(&mut store, masks::ISSUER_CERTIFICATES, vec![ca_cert.der().to_vec()]);

        let far_future = timestamp_secs() as i64 + 366 * 86_400;

        // The issuer chain exists but carries no CRL
        assert_eq!(
            store
                .verify_certificate_at(DEFAULT_APPLICATION_GROUP, leaf.der(), far_future)
                .unwrap_err(),
            StatusCode::BadCertificateIssuerRevocationUnknown
        );
    }

    #[test]
    fn test_rejected_list_fifo_and_dedup() {
        let mut store = TrustStore::with_default_groups(65536, 2, None);
        let anchor = self_signed_leaf();
        trust(&mut store, masks::TRUSTED_CERTIFICATES, vec![anchor.der().to_vec()]);

        store.add_to_rejected_list(DEFAULT_APPLICATION_GROUP, b"cert-a").unwrap();
        store.add_to_rejected_list(DEFAULT_APPLICATION_GROUP, b"cert-b").unwrap();

        // Re-adding moves to the front without duplication
        store.add_to_rejected_list(DEFAULT_APPLICATION_GROUP, b"cert-a").unwrap();
        let rejected = store.get_rejected_list(DEFAULT_APPLICATION_GROUP).unwrap();
        assert_eq!(rejected, vec![b"cert-a".to_vec(), b"cert-b".to_vec()]);

        // Overflow evicts the oldest
        store.add_to_rejected_list(DEFAULT_APPLICATION_GROUP, b"cert-c").unwrap();
        let rejected = store.get_rejected_list(DEFAULT_APPLICATION_GROUP).unwrap();
        assert_eq!(rejected, vec![b"cert-c".to_vec(), b"cert-a".to_vec()]);
    }

    #[test]
    fn test_trust_list_size_bound() {
        let mut store = TrustStore::new(None);
        store.add_group("Tiny", 16, 10);

        let list = TrustList {
            specified_lists: masks::TRUSTED_CERTIFICATES,
            trusted_certs: vec![vec![0u8; 32]],
            ..TrustList::default()
        };

        assert_eq!(
            store.add_to_trust_list("Tiny", &list).unwrap_err(),
            StatusCode::BadRequestTooLarge
        );
    }

    #[test]
    fn test_get_after_add_is_superset() {
        let mut store = store();
        let list = TrustList {
            specified_lists: masks::TRUSTED_CERTIFICATES | masks::ISSUER_CERTIFICATES,
            trusted_certs: vec![b"der-1".to_vec()],
            issuer_certs: vec![b"der-2".to_vec()],
            ..TrustList::default()
        };

        store.add_to_trust_list(DEFAULT_APPLICATION_GROUP, &list).unwrap();
        let all = store.get_trust_list(DEFAULT_APPLICATION_GROUP, masks::ALL).unwrap();

        assert!(all.trusted_certs.contains(&b"der-1".to_vec()));
        assert!(all.issuer_certs.contains(&b"der-2".to_vec()));

        // Idempotent union
        store.add_to_trust_list(DEFAULT_APPLICATION_GROUP, &list).unwrap();
        let again = store.get_trust_list(DEFAULT_APPLICATION_GROUP, masks::ALL).unwrap();
        assert_eq!(again.trusted_certs.len(), all.trusted_certs.len());
    }

    #[test]
    fn test_set_get_roundtrip_is_noop() {
        let mut store = store();
        trust(&mut store, masks::TRUSTED_CERTIFICATES, vec![b"der-1".to_vec()]);

        let all = store.get_trust_list(DEFAULT_APPLICATION_GROUP, masks::ALL).unwrap();
        store.set_trust_list(DEFAULT_APPLICATION_GROUP, &all).unwrap();

        assert_eq!(
            store.get_trust_list(DEFAULT_APPLICATION_GROUP, masks::ALL).unwrap(),
            all
        );
    }

    #[test]
    fn test_remove_from_trust_list() {
        let mut store = store();
        trust(
            &mut store,
            masks::TRUSTED_CERTIFICATES,
            vec![b"der-1".to_vec(), b"der-2".to_vec()],
        );

        let removal = TrustList {
            specified_lists: masks::TRUSTED_CERTIFICATES,
            trusted_certs: vec![b"der-1".to_vec()],
            ..TrustList::default()
        };
        store.remove_from_trust_list(DEFAULT_APPLICATION_GROUP, &removal).unwrap();

        let all = store.get_trust_list(DEFAULT_APPLICATION_GROUP, masks::ALL).unwrap();
        assert_eq!(all.trusted_certs, vec![b"der-2".to_vec()]);
    }

    #[test]
    fn test_masked_filtering() {
        let mut store = store();
        let list = TrustList {
            specified_lists: masks::ALL,
            trusted_certs: vec![b"tc".to_vec()],
            trusted_crls: vec![b"tl".to_vec()],
            issuer_certs: vec![b"ic".to_vec()],
            issuer_crls: vec![b"il".to_vec()],
        };
        store.set_trust_list(DEFAULT_APPLICATION_GROUP, &list).unwrap();

        let filtered = store
            .get_trust_list(DEFAULT_APPLICATION_GROUP, masks::TRUSTED_CERTIFICATES | masks::ISSUER_CRLS)
            .unwrap();

        assert_eq!(filtered.trusted_certs, vec![b"tc".to_vec()]);
        assert!(filtered.trusted_crls.is_empty());
        assert!(filtered.issuer_certs.is_empty());
        assert_eq!(filtered.issuer_crls, vec![b"il".to_vec()]);
    }

    #[test]
    fn test_trust_list_codec_roundtrip() {
        let list = TrustList {
            specified_lists: masks::ALL,
            trusted_certs: vec![vec![1, 2, 3], vec![4]],
            trusted_crls: vec![vec![5, 6]],
            issuer_certs: Vec::new(),
            issuer_crls: vec![vec![7]],
        };

        assert_eq!(TrustList::decode(&list.encode()).unwrap(), list);
    }

    #[test]
    fn test_trust_list_decode_err_truncated() {
        assert_eq!(TrustList::decode(&[1, 0]).unwrap_err(), StatusCode::BadInvalidArgument);
    }

    #[test]
    fn test_verify_application_uri() {
        let leaf = forge::create_self_signed(
            &*LEAF_KEY,
            "CN=uri-check",
            &[SanEntry::Uri("urn:girder:uri-check".to_string())],
            365,
        )
        .unwrap();

        verify_application_uri(&leaf, "urn:girder:uri-check", true).unwrap();
        // Substring anywhere in the extension octets is accepted
        verify_application_uri(&leaf, "girder:uri", true).unwrap();
        assert_eq!(
            verify_application_uri(&leaf, "urn:other", true).unwrap_err(),
            StatusCode::BadCertificateUriInvalid
        );

        // Without SAN octets the lenient mode passes, strict does not
        let bare = forge::create_self_signed(&*LEAF_KEY, "CN=bare", &[], 365).unwrap();
        verify_application_uri(&bare, "urn:girder:x", false).unwrap();
        assert_eq!(
            verify_application_uri(&bare, "urn:girder:x", true).unwrap_err(),
            StatusCode::BadCertificateUriInvalid
        );
    }
}
