//! Certificate, CSR and CRL generation.
//!
//! Backs the push-management signing-request method, the `certgen` bootstrap
//! tool and the test fixtures. Everything is signed sha256WithRSAEncryption.

use crate::cert::{Certificate, Crl, SanEntry};
use crate::crypto::{self, CryptoError, CryptoResult};
use rsa::pkcs8::EncodePublicKey;
use rsa::RsaPrivateKey;
use sha2::Sha256;
use std::convert::TryFrom;
use std::str::FromStr;
use std::time::Duration;
use x509_cert::builder::{Builder, CertificateBuilder, Profile, RequestBuilder};
use x509_cert::der::asn1::{BitString, Ia5String, Null, OctetString, UtcTime};
use x509_cert::der::{Any, Encode};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::time::{Time, Validity};

const SECS_PER_DAY: u64 = 86_400;

type RsaSigner = rsa::pkcs1v15::SigningKey<Sha256>;
type RsaSignature = rsa::pkcs1v15::Signature;

/// Builds a PKCS#10 certificate signing request.
///
/// The subject is an RFC 4514 string; SAN entries are copied as given (IP
/// entries must be 4 raw bytes and are skipped otherwise, as are entries of
/// any other type upstream).
pub fn create_signing_request(
    key: &RsaPrivateKey,
    subject: &str,
    san: &[SanEntry],
) -> CryptoResult<Vec<u8>> {
    let subject = Name::from_str(subject).map_err(|_| CryptoError::InvalidArgument)?;
    let signer = RsaSigner::new(key.clone());

    let mut builder = RequestBuilder::new(subject, &signer).map_err(|_| CryptoError::GenerationFailed)?;

    if !san.is_empty() {
        let names = general_names(san)?;
        if !names.is_empty() {
            builder
                .add_extension(&SubjectAltName(names))
                .map_err(|_| CryptoError::GenerationFailed)?;
        }
    }

    let request = builder
        .build::<RsaSignature>()
        .map_err(|_| CryptoError::GenerationFailed)?;

    request.to_der().map_err(|_| CryptoError::GenerationFailed)
}

/// Generates a self-signed end-entity certificate.
pub fn create_self_signed(
    key: &RsaPrivateKey,
    subject: &str,
    san: &[SanEntry],
    valid_days: u64,
) -> CryptoResult<Certificate> {
    let name = Name::from_str(subject).map_err(|_| CryptoError::InvalidArgument)?;
    let profile = Profile::Leaf {
        issuer: name.clone(),
        enable_key_agreement: false,
        enable_key_encipherment: true,
        include_subject_key_identifier: true,
    };

    build_certificate(key, profile, name, san, valid_days, key)
}

/// Generates a self-signed CA certificate (KeyCertSign + CRLSign).
pub fn create_ca(key: &RsaPrivateKey, subject: &str, valid_days: u64) -> CryptoResult<Certificate> {
    let name = Name::from_str(subject).map_err(|_| CryptoError::InvalidArgument)?;

    build_certificate(key, Profile::Root, name, &[], valid_days, key)
}

/// Generates an end-entity certificate signed by the given CA.
pub fn create_signed(
    key: &RsaPrivateKey,
    subject: &str,
    san: &[SanEntry],
    valid_days: u64,
    issuer_cert: &Certificate,
    issuer_key: &RsaPrivateKey,
) -> CryptoResult<Certificate> {
    let name = Name::from_str(subject).map_err(|_| CryptoError::InvalidArgument)?;
    let profile = Profile::Leaf {
        issuer: issuer_name(issuer_cert)?,
        enable_key_agreement: false,
        enable_key_encipherment: true,
        include_subject_key_identifier: true,
    };

    build_certificate(key, profile, name, san, valid_days, issuer_key)
}

/// Builds a CRL listing the given raw serials, signed by the issuer key.
pub fn create_crl(
    issuer_key: &RsaPrivateKey,
    issuer_cert: &Certificate,
    revoked_serials: &[Vec<u8>],
    valid_days: u64,
) -> CryptoResult<Crl> {
    let now_secs = crate::time::timestamp_secs();
    let this_update = utc_time(now_secs)?;
    let next_update = utc_time(now_secs + valid_days * SECS_PER_DAY)?;

    let revoked: CryptoResult<Vec<_>> = revoked_serials
        .iter()
        .map(|serial| {
            Ok(x509_cert::crl::RevokedCert {
                serial_number: SerialNumber::new(serial).map_err(|_| CryptoError::InvalidArgument)?,
                revocation_date: this_update.clone(),
                crl_entry_extensions: None,
            })
        })
        .collect();
    let revoked = revoked?;

    let signature_algorithm = AlgorithmIdentifierOwned {
        oid: const_oid::db::rfc5912::SHA_256_WITH_RSA_ENCRYPTION,
        parameters: Some(Any::encode_from(&Null).map_err(|_| CryptoError::GenerationFailed)?),
    };

    let tbs = x509_cert::crl::TbsCertList {
        version: x509_cert::Version::V2,
        signature: signature_algorithm.clone(),
        issuer: issuer_name(issuer_cert)?,
        this_update,
        next_update: Some(next_update),
        revoked_certificates: if revoked.is_empty() { None } else { Some(revoked) },
        crl_extensions: None,
    };

    let tbs_der = tbs.to_der().map_err(|_| CryptoError::GenerationFailed)?;
    let signature = crypto::rsa_sign(issuer_key, crypto::RsaSigAlg::Pkcs1v15Sha256, &tbs_der)?;

    let crl = x509_cert::crl::CertificateList {
        tbs_cert_list: tbs,
        signature_algorithm,
        signature: BitString::from_bytes(&signature).map_err(|_| CryptoError::GenerationFailed)?,
    };

    let der = crl.to_der().map_err(|_| CryptoError::GenerationFailed)?;
    Crl::parse(&der)
}

fn build_certificate(
    key: &RsaPrivateKey,
    profile: Profile,
    subject: Name,
    san: &[SanEntry],
    valid_days: u64,
    signing_key: &RsaPrivateKey,
) -> CryptoResult<Certificate> {
    let spki_der = key
        .to_public_key()
        .to_public_key_der()
        .map_err(|_| CryptoError::GenerationFailed)?;
    let spki = SubjectPublicKeyInfoOwned::try_from(spki_der.as_bytes())
        .map_err(|_| CryptoError::GenerationFailed)?;

    let validity = Validity::from_now(Duration::from_secs(valid_days * SECS_PER_DAY))
        .map_err(|_| CryptoError::InvalidArgument)?;

    let signer = RsaSigner::new(signing_key.clone());

    let mut builder = CertificateBuilder::new(profile, random_serial()?, validity, subject, spki, &signer)
        .map_err(|_| CryptoError::GenerationFailed)?;

    if !san.is_empty() {
        let names = general_names(san)?;
        if !names.is_empty() {
            builder
                .add_extension(&SubjectAltName(names))
                .map_err(|_| CryptoError::GenerationFailed)?;
        }
    }

    let cert = builder
        .build::<RsaSignature>()
        .map_err(|_| CryptoError::GenerationFailed)?;

    let der = cert.to_der().map_err(|_| CryptoError::GenerationFailed)?;
    Certificate::parse(&der)
}

fn general_names(san: &[SanEntry]) -> CryptoResult<Vec<GeneralName>> {
    let mut names = Vec::with_capacity(san.len());

    for entry in san {
        match entry {
            SanEntry::Dns(dns) => {
                let value = Ia5String::new(dns).map_err(|_| CryptoError::InvalidArgument)?;
                names.push(GeneralName::DnsName(value));
            }
            SanEntry::Uri(uri) => {
                let value = Ia5String::new(uri).map_err(|_| CryptoError::InvalidArgument)?;
                names.push(GeneralName::UniformResourceIdentifier(value));
            }
            SanEntry::Ip(ip) => {
                // IPv4 only, written as the 4 raw address bytes
                if ip.len() == 4 {
                    let value =
                        OctetString::new(ip.clone()).map_err(|_| CryptoError::InvalidArgument)?;
                    names.push(GeneralName::IpAddress(value));
                }
            }
        }
    }

    Ok(names)
}

/// The issuer name for material we sign on a CA's behalf. Rebuilt from the
/// parsed subject string; the separator fixup covers the formatter's
/// ", "-joined multi-RDN output.
fn issuer_name(issuer_cert: &Certificate) -> CryptoResult<Name> {
    let subject = issuer_cert.subject().replace(", ", ",");
    Name::from_str(&subject).map_err(|_| CryptoError::InvalidArgument)
}

fn random_serial() -> CryptoResult<SerialNumber> {
    let mut bytes = [0u8; 8];
    crypto::random_bytes(&mut bytes);
    // Keep the INTEGER positive and non-zero
    bytes[0] = (bytes[0] & 0x7F) | 0x01;

    SerialNumber::new(&bytes).map_err(|_| CryptoError::GenerationFailed)
}

fn utc_time(secs: u64) -> CryptoResult<Time> {
    let time =
        UtcTime::from_unix_duration(Duration::from_secs(secs)).map_err(|_| CryptoError::InvalidArgument)?;
    Ok(Time::UtcTime(time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keys;

    #[test]
    fn test_create_signing_request() {
        let csr = create_signing_request(
            &*test_keys::RSA_2048,
            "CN=girder-server,O=Bush Hammer Industries",
            &[
                SanEntry::Uri("urn:bushhammer:girder:server".to_string()),
                SanEntry::Dns("girder.local".to_string()),
                SanEntry::Ip(vec![10, 0, 0, 1]),
            ],
        )
        .unwrap();

        // DER SEQUENCE header and a plausible size
        assert_eq!(csr[0], 0x30);
        assert!(csr.len() > 256);
    }

    #[test]
    fn test_create_signing_request_skips_bad_ip() {
        let csr_short = create_signing_request(
            &*test_keys::RSA_2048,
            "CN=girder-server",
            &[SanEntry::Ip(vec![1, 2, 3])],
        )
        .unwrap();

        let csr_none = create_signing_request(&*test_keys::RSA_2048, "CN=girder-server", &[]).unwrap();

        // A 3-byte IP entry is dropped; the requests differ only in serial-free
        // attribute content, so both parse and carry no SAN payload bytes.
        assert_eq!(csr_short.len(), csr_none.len());
    }

    #[test]
    fn test_create_self_signed_validity() {
        let cert = create_self_signed(&*test_keys::RSA_2048, "CN=validity-check", &[], 30).unwrap();
        let now = crate::time::timestamp_secs() as i64;

        assert_eq!(cert.validity_at(now), crate::cert::TimeValidity::Valid);
        assert_eq!(
            cert.validity_at(now + 31 * 86_400),
            crate::cert::TimeValidity::Expired
        );
    }

    #[test]
    fn test_create_ca_is_ca() {
        let ca = create_ca(&*test_keys::RSA_2048_ALT, "CN=forge-root", 3650).unwrap();

        assert!(ca.is_ca());
        assert!(ca.is_self_signed());
    }

    #[test]
    fn test_serials_are_unique() {
        let a = create_self_signed(&*test_keys::RSA_2048, "CN=serial-a", &[], 30).unwrap();
        let b = create_self_signed(&*test_keys::RSA_2048, "CN=serial-a", &[], 30).unwrap();

        assert_ne!(a.serial(), b.serial());
        assert_ne!(a.thumbprint(), b.thumbprint());
    }
}
