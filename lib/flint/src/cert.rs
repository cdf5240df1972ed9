//! X.509 certificate and CRL handling.
//!
//! A `Certificate` owns its canonical DER body plus an eagerly extracted
//! parsed view. The x509-parser borrow never escapes this module; everything
//! downstream works on the owned view or re-parses from the DER.

use crate::crypto::{self, CryptoError, CryptoResult, HashAlg, RsaSigAlg};
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use x509_parser::oid_registry;
use x509_parser::prelude::*;

pub const THUMBPRINT_SIZE: usize = 20;

/// Subject alternative name entries the stack understands. Entries of any
/// other type are skipped during parsing.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SanEntry {
    Dns(String),
    Uri(String),
    Ip(Vec<u8>),
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct KeyUsageFlags {
    pub digital_signature: bool,
    pub key_encipherment: bool,
    pub data_encipherment: bool,
    pub key_cert_sign: bool,
    pub crl_sign: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimeValidity {
    Valid,
    NotYetValid,
    Expired,
}

/// Parsed certificate. Immutable after parse; equality is DER identity.
#[derive(Debug, Clone)]
pub struct Certificate {
    der: Vec<u8>,
    thumbprint: [u8; THUMBPRINT_SIZE],
    subject: String,
    issuer: String,
    serial: Vec<u8>,
    san: Vec<SanEntry>,
    san_raw: Vec<u8>,
    key_usage: KeyUsageFlags,
    not_before: i64,
    not_after: i64,
    public_key: RsaPublicKey,
    key_bits: usize,
    sig_alg: Option<RsaSigAlg>,
    tbs_digest: Vec<u8>,
    signature: Vec<u8>,
}

impl PartialEq for Certificate {
    #[inline]
    fn eq(&self, other: &Certificate) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl Certificate {
    /// Parses a certificate from DER or PEM input. The stored DER is the
    /// canonical body; any trailing bytes after the outer sequence are
    /// dropped.
    pub fn parse(input: &[u8]) -> CryptoResult<Certificate> {
        let der = normalize_to_der(input, "CERTIFICATE")?;

        let (rem, x509) = parse_x509_certificate(&der).map_err(|_| CryptoError::CertParseFailed)?;
        let body_len = der.len() - rem.len();
        let der = der[..body_len].to_vec();

        let mut san = Vec::new();
        let mut san_raw = Vec::new();

        if let Ok(Some(ext)) = x509.tbs_certificate.subject_alternative_name() {
            for name in &ext.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => san.push(SanEntry::Dns((*dns).to_string())),
                    GeneralName::URI(uri) => san.push(SanEntry::Uri((*uri).to_string())),
                    GeneralName::IPAddress(ip) => san.push(SanEntry::Ip(ip.to_vec())),
                    _ => (),
                }
            }
        }

        for ext in x509.extensions() {
            if ext.oid == oid_registry::OID_X509_EXT_SUBJECT_ALT_NAME {
                san_raw = ext.value.to_vec();
            }
        }

        let mut key_usage = KeyUsageFlags::default();
        if let Ok(Some(ext)) = x509.tbs_certificate.key_usage() {
            let ku = ext.value;
            key_usage.digital_signature = ku.digital_signature();
            key_usage.key_encipherment = ku.key_encipherment();
            key_usage.data_encipherment = ku.data_encipherment();
            key_usage.key_cert_sign = ku.key_cert_sign();
            key_usage.crl_sign = ku.crl_sign();
        }

        let spki = x509.public_key();
        let public_key =
            RsaPublicKey::from_public_key_der(spki.raw).map_err(|_| CryptoError::CertParseFailed)?;
        let key_bits = crypto::rsa_key_bits(&public_key);

        let sig_alg = signature_alg_from_oid(&x509.signature_algorithm);
        let tbs_digest = match sig_alg {
            Some(RsaSigAlg::Pkcs1v15Sha1) => crypto::hash(HashAlg::Sha1, x509.tbs_certificate.as_ref()),
            Some(_) => crypto::hash(HashAlg::Sha256, x509.tbs_certificate.as_ref()),
            None => Vec::new(),
        };

        let mut thumbprint = [0u8; THUMBPRINT_SIZE];
        thumbprint.copy_from_slice(&crypto::hash(HashAlg::Sha1, &der));

        Ok(Certificate {
            thumbprint,
            subject: x509.subject().to_string(),
            issuer: x509.issuer().to_string(),
            serial: x509.raw_serial().to_vec(),
            san,
            san_raw,
            key_usage,
            not_before: x509.validity().not_before.timestamp(),
            not_after: x509.validity().not_after.timestamp(),
            public_key,
            key_bits,
            sig_alg,
            signature: x509.signature_value.data.to_vec(),
            tbs_digest,
            der,
        })
    }

    /// The canonical DER body.
    #[inline]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// SHA-1 of the DER body.
    #[inline]
    pub fn thumbprint(&self) -> &[u8; THUMBPRINT_SIZE] {
        &self.thumbprint
    }

    #[inline]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[inline]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[inline]
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    #[inline]
    pub fn san(&self) -> &[SanEntry] {
        &self.san
    }

    #[inline]
    pub fn key_usage(&self) -> KeyUsageFlags {
        self.key_usage
    }

    #[inline]
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    #[inline]
    pub fn key_bits(&self) -> usize {
        self.key_bits
    }

    #[inline]
    pub fn is_self_signed(&self) -> bool {
        self.subject == self.issuer
    }

    /// A certificate carrying both KeyCertSign and CRLSign is a CA and may
    /// not act as an end entity.
    #[inline]
    pub fn is_ca(&self) -> bool {
        self.key_usage.key_cert_sign && self.key_usage.crl_sign
    }

    /// Checks the validity window against a unix timestamp.
    #[inline]
    pub fn validity_at(&self, now_secs: i64) -> TimeValidity {
        if now_secs < self.not_before {
            TimeValidity::NotYetValid
        } else if now_secs > self.not_after {
            TimeValidity::Expired
        } else {
            TimeValidity::Valid
        }
    }

    /// True if `issuer` names this certificate's issuing authority.
    #[inline]
    pub fn issued_by(&self, issuer: &Certificate) -> bool {
        self.issuer == issuer.subject
    }

    /// Verifies this certificate's signature against the issuer public key.
    pub fn verify_signed_by(&self, issuer: &Certificate) -> CryptoResult<()> {
        let alg = self.sig_alg.ok_or(CryptoError::Unsupported)?;
        crypto::rsa_verify_prehash(&issuer.public_key, alg, &self.tbs_digest, &self.signature)
    }

    /// The deliberately permissive application URI check: the URI must appear
    /// as a byte substring anywhere within the raw subject-alt-name extension
    /// octets. The SAN structure is not re-parsed.
    pub fn contains_application_uri(&self, uri: &str) -> bool {
        if uri.is_empty() || self.san_raw.is_empty() {
            return false;
        }

        self.san_raw
            .windows(uri.len())
            .any(|window| window == uri.as_bytes())
    }
}

/// Parsed certificate revocation list.
#[derive(Debug, Clone)]
pub struct Crl {
    der: Vec<u8>,
    issuer: String,
    this_update: i64,
    next_update: Option<i64>,
    revoked: Vec<Vec<u8>>,
    sig_alg: Option<RsaSigAlg>,
    tbs_digest: Vec<u8>,
    signature: Vec<u8>,
}

impl PartialEq for Crl {
    #[inline]
    fn eq(&self, other: &Crl) -> bool {
        self.der == other.der
    }
}

impl Eq for Crl {}

impl Crl {
    /// Parses a CRL from DER or PEM input.
    pub fn parse(input: &[u8]) -> CryptoResult<Crl> {
        let der = normalize_to_der(input, "X509 CRL")?;

        let (rem, crl) = parse_x509_crl(&der).map_err(|_| CryptoError::CertParseFailed)?;
        let body_len = der.len() - rem.len();
        let der = der[..body_len].to_vec();

        let revoked = crl
            .iter_revoked_certificates()
            .map(|entry| entry.raw_serial().to_vec())
            .collect();

        let sig_alg = signature_alg_from_oid(&crl.signature_algorithm);
        let tbs_digest = match sig_alg {
            Some(RsaSigAlg::Pkcs1v15Sha1) => crypto::hash(HashAlg::Sha1, crl.tbs_cert_list.as_ref()),
            Some(_) => crypto::hash(HashAlg::Sha256, crl.tbs_cert_list.as_ref()),
            None => Vec::new(),
        };

        Ok(Crl {
            issuer: crl.issuer().to_string(),
            this_update: crl.last_update().timestamp(),
            next_update: crl.next_update().map(|time| time.timestamp()),
            revoked,
            sig_alg,
            tbs_digest,
            signature: crl.signature_value.data.to_vec(),
            der,
        })
    }

    #[inline]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    #[inline]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[inline]
    pub fn this_update(&self) -> i64 {
        self.this_update
    }

    /// True if the CRL's validity window has lapsed.
    #[inline]
    pub fn is_expired(&self, now_secs: i64) -> bool {
        match self.next_update {
            Some(next) => now_secs > next,
            None => false,
        }
    }

    /// True if this CRL was issued by the given authority (by DN equality).
    #[inline]
    pub fn issued_by(&self, issuer: &Certificate) -> bool {
        self.issuer == issuer.subject()
    }

    /// True if the serial appears on the revocation list.
    #[inline]
    pub fn revokes_serial(&self, serial: &[u8]) -> bool {
        self.revoked.iter().any(|entry| entry == serial)
    }

    /// Verifies the CRL signature against the issuer public key.
    pub fn verify_signed_by(&self, issuer: &Certificate) -> CryptoResult<()> {
        let alg = self.sig_alg.ok_or(CryptoError::Unsupported)?;
        crypto::rsa_verify_prehash(issuer.public_key(), alg, &self.tbs_digest, &self.signature)
    }
}

#[inline]
fn signature_alg_from_oid(alg: &x509_parser::x509::AlgorithmIdentifier) -> Option<RsaSigAlg> {
    if alg.algorithm == oid_registry::OID_PKCS1_SHA1WITHRSA {
        Some(RsaSigAlg::Pkcs1v15Sha1)
    } else if alg.algorithm == oid_registry::OID_PKCS1_SHA256WITHRSA {
        Some(RsaSigAlg::Pkcs1v15Sha256)
    } else {
        None
    }
}

/// Normalizes certificate or CRL input to DER.
///
/// A leading `0x2D` ('-') marks PEM: the base64 body between the BEGIN/END
/// markers is decoded (a trailing NUL from C-side tooling is tolerated).
/// Anything else is assumed to already be DER.
pub fn normalize_to_der(input: &[u8], pem_label: &str) -> CryptoResult<Vec<u8>> {
    if input.is_empty() {
        return Err(CryptoError::InvalidArgument);
    }

    if input[0] != 0x2D {
        return Ok(input.to_vec());
    }

    let text = std::str::from_utf8(input).map_err(|_| CryptoError::CertParseFailed)?;
    let text = text.trim_end_matches('\0');

    let begin = format!("-----BEGIN {}-----", pem_label);
    let end = format!("-----END {}-----", pem_label);

    let body_start = text.find(&begin).ok_or(CryptoError::CertParseFailed)? + begin.len();
    let body_end = text.find(&end).ok_or(CryptoError::CertParseFailed)?;

    if body_end <= body_start {
        return Err(CryptoError::CertParseFailed);
    }

    crate::encoding::base64::decode_multiline(&text[body_start..body_end])
        .map_err(|_| CryptoError::CertParseFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keys;
    use crate::encoding::base64;
    use crate::forge;

    fn make_leaf() -> Certificate {
        forge::create_self_signed(
            &*test_keys::RSA_2048,
            "CN=girder-server,O=Bush Hammer Industries",
            &[
                SanEntry::Uri("urn:bushhammer:girder:server".to_string()),
                SanEntry::Dns("girder.local".to_string()),
            ],
            365,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_roundtrip_der() {
        let cert = make_leaf();
        let reparsed = Certificate::parse(cert.der()).unwrap();

        assert_eq!(reparsed.der(), cert.der());
        assert_eq!(reparsed, cert);
        assert_eq!(reparsed.thumbprint(), cert.thumbprint());
    }

    #[test]
    fn test_parse_pem() {
        let cert = make_leaf();

        let pem = format!(
            "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
            base64::encode(cert.der())
        );

        let parsed = Certificate::parse(pem.as_bytes()).unwrap();
        assert_eq!(parsed.der(), cert.der());
    }

    #[test]
    fn test_parse_pem_null_terminated() {
        let cert = make_leaf();

        let mut pem = format!(
            "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
            base64::encode(cert.der())
        )
        .into_bytes();
        pem.push(0);

        let parsed = Certificate::parse(&pem).unwrap();
        assert_eq!(parsed.der(), cert.der());
    }

    #[test]
    fn test_parse_err_empty() {
        assert_eq!(Certificate::parse(b"").unwrap_err(), CryptoError::InvalidArgument);
    }

    #[test]
    fn test_parse_err_garbage() {
        assert_eq!(
            Certificate::parse(&[0x30, 0x82, 0x01, 0x02, 0xFF]).unwrap_err(),
            CryptoError::CertParseFailed
        );
    }

    #[test]
    fn test_parsed_view_fields() {
        let cert = make_leaf();

        assert!(cert.subject().contains("girder-server"));
        assert!(cert.is_self_signed());
        assert!(!cert.is_ca());
        assert_eq!(cert.key_bits(), 2048);
        assert_eq!(cert.validity_at(crate::time::timestamp_secs() as i64), TimeValidity::Valid);

        let has_uri = cert
            .san()
            .iter()
            .any(|entry| matches!(entry, SanEntry::Uri(uri) if uri == "urn:bushhammer:girder:server"));
        assert!(has_uri);
    }

    #[test]
    fn test_self_signature_verifies() {
        let cert = make_leaf();
        cert.verify_signed_by(&cert).unwrap();
    }

    #[test]
    fn test_verify_signed_by_err_wrong_issuer() {
        let cert = make_leaf();
        let other = forge::create_self_signed(&*test_keys::RSA_2048_ALT, "CN=impostor", &[], 365).unwrap();

        assert_eq!(
            cert.verify_signed_by(&other).unwrap_err(),
            CryptoError::SignatureRejected
        );
    }

    #[test]
    fn test_application_uri_substring_match() {
        let cert = make_leaf();

        assert!(cert.contains_application_uri("urn:bushhammer:girder:server"));
        // The check is a plain substring scan over the extension octets
        assert!(cert.contains_application_uri("bushhammer:girder"));
        assert!(!cert.contains_application_uri("urn:someone:else"));
        assert!(!cert.contains_application_uri(""));
    }

    #[test]
    fn test_ca_chain_verification() {
        let (ca_cert, leaf_cert) = forge_chain();

        assert!(ca_cert.is_ca());
        assert!(leaf_cert.issued_by(&ca_cert));
        leaf_cert.verify_signed_by(&ca_cert).unwrap();
    }

    #[test]
    fn test_crl_parse_and_revocation() {
        let (ca_cert, leaf_cert) = forge_chain();

        let crl = forge::create_crl(
            &*test_keys::RSA_2048_ALT,
            &ca_cert,
            &[leaf_cert.serial().to_vec()],
            30,
        )
        .unwrap();
        let crl = Crl::parse(crl.der()).unwrap();

        assert!(crl.issued_by(&ca_cert));
        assert!(crl.revokes_serial(leaf_cert.serial()));
        assert!(!crl.revokes_serial(&[0xDE, 0xAD]));
        assert!(!crl.is_expired(crate::time::timestamp_secs() as i64));
        crl.verify_signed_by(&ca_cert).unwrap();
    }

    fn forge_chain() -> (Certificate, Certificate) {
        let ca_cert = forge::create_ca(&*test_keys::RSA_2048_ALT, "CN=girder-root", 3650).unwrap();
        let leaf_cert = forge::create_signed(
            &*test_keys::RSA_2048,
            "CN=girder-leaf",
            &[SanEntry::Uri("urn:bushhammer:girder:leaf".to_string())],
            365,
            &ca_cert,
            &*test_keys::RSA_2048_ALT,
        )
        .unwrap();

        (ca_cert, leaf_cert)
    }
}
