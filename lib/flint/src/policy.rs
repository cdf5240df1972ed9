//! Security policies: named algorithm bundles binding the crypto primitives
//! into the concrete per-channel operations.
//!
//! A policy optionally carries the local certificate + private key pair. The
//! pair is hot swappable through `update_certificate_and_private_key`; open
//! channels using the policy must be torn down by the caller afterwards.

use crate::cert::Certificate;
use crate::crypto::{self, CryptoError, CryptoResult, HashAlg, RsaEncAlg, RsaSigAlg};
use rsa::RsaPrivateKey;

pub const URI_NONE: &str = "http://opcfoundation.org/UA/SecurityPolicy#None";
pub const URI_BASIC128RSA15: &str = "http://opcfoundation.org/UA/SecurityPolicy#Basic128Rsa15";
pub const URI_BASIC256: &str = "http://opcfoundation.org/UA/SecurityPolicy#Basic256";
pub const URI_BASIC256SHA256: &str = "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256";
pub const URI_AES256SHA256RSAPSS: &str =
    "http://opcfoundation.org/UA/SecurityPolicy#Aes256_Sha256_RsaPss";
pub const URI_PUBSUB_AES128CTR: &str = "http://opcfoundation.org/UA/SecurityPolicy#PubSub-Aes128-CTR";

/// How messages on a channel are protected.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageSecurityMode {
    None = 1,
    Sign = 2,
    SignAndEncrypt = 3,
}

impl MessageSecurityMode {
    #[inline]
    pub fn from_u32(value: u32) -> Option<MessageSecurityMode> {
        match value {
            1 => Some(MessageSecurityMode::None),
            2 => Some(MessageSecurityMode::Sign),
            3 => Some(MessageSecurityMode::SignAndEncrypt),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PolicyKind {
    None,
    Basic128Rsa15,
    Basic256,
    Basic256Sha256,
    Aes256Sha256RsaPss,
    PubSubAes128Ctr,
}

impl PolicyKind {
    #[inline]
    pub fn uri(self) -> &'static str {
        match self {
            PolicyKind::None => URI_NONE,
            PolicyKind::Basic128Rsa15 => URI_BASIC128RSA15,
            PolicyKind::Basic256 => URI_BASIC256,
            PolicyKind::Basic256Sha256 => URI_BASIC256SHA256,
            PolicyKind::Aes256Sha256RsaPss => URI_AES256SHA256RSAPSS,
            PolicyKind::PubSubAes128Ctr => URI_PUBSUB_AES128CTR,
        }
    }

    #[inline]
    pub fn from_uri(uri: &str) -> Option<PolicyKind> {
        match uri {
            URI_NONE => Some(PolicyKind::None),
            URI_BASIC128RSA15 => Some(PolicyKind::Basic128Rsa15),
            URI_BASIC256 => Some(PolicyKind::Basic256),
            URI_BASIC256SHA256 => Some(PolicyKind::Basic256Sha256),
            URI_AES256SHA256RSAPSS => Some(PolicyKind::Aes256Sha256RsaPss),
            URI_PUBSUB_AES128CTR => Some(PolicyKind::PubSubAes128Ctr),
            _ => None,
        }
    }

    /// Relative strength used to order endpoint descriptions.
    #[inline]
    pub fn security_level(self) -> u8 {
        match self {
            PolicyKind::None => 0,
            PolicyKind::Basic128Rsa15 => 1,
            PolicyKind::Basic256 => 2,
            PolicyKind::PubSubAes128Ctr => 3,
            PolicyKind::Basic256Sha256 => 4,
            PolicyKind::Aes256Sha256RsaPss => 5,
        }
    }

    #[inline]
    pub fn asym_sig_alg(self) -> Option<RsaSigAlg> {
        match self {
            PolicyKind::None | PolicyKind::PubSubAes128Ctr => None,
            PolicyKind::Basic128Rsa15 | PolicyKind::Basic256 => Some(RsaSigAlg::Pkcs1v15Sha1),
            PolicyKind::Basic256Sha256 => Some(RsaSigAlg::Pkcs1v15Sha256),
            PolicyKind::Aes256Sha256RsaPss => Some(RsaSigAlg::PssSha256),
        }
    }

    #[inline]
    pub fn asym_enc_alg(self) -> Option<RsaEncAlg> {
        match self {
            PolicyKind::None | PolicyKind::PubSubAes128Ctr => None,
            PolicyKind::Basic128Rsa15 => Some(RsaEncAlg::Pkcs1v15),
            PolicyKind::Basic256 | PolicyKind::Basic256Sha256 => Some(RsaEncAlg::OaepSha1),
            PolicyKind::Aes256Sha256RsaPss => Some(RsaEncAlg::OaepSha256),
        }
    }

    /// Hash for both the symmetric HMAC and the P_HASH key derivation.
    #[inline]
    pub fn sym_hash(self) -> Option<HashAlg> {
        match self {
            PolicyKind::None => None,
            PolicyKind::Basic128Rsa15 | PolicyKind::Basic256 => Some(HashAlg::Sha1),
            _ => Some(HashAlg::Sha256),
        }
    }

    /// Derived key lengths: (signing key, encrypting key, iv).
    #[inline]
    pub fn derived_key_lengths(self) -> (usize, usize, usize) {
        match self {
            PolicyKind::None => (0, 0, 0),
            PolicyKind::Basic128Rsa15 => (16, 16, 16),
            PolicyKind::Basic256 => (24, 32, 16),
            PolicyKind::Basic256Sha256 => (32, 32, 16),
            PolicyKind::Aes256Sha256RsaPss => (32, 32, 16),
            PolicyKind::PubSubAes128Ctr => (32, 16, 4),
        }
    }

    #[inline]
    pub fn nonce_length(self) -> usize {
        match self {
            PolicyKind::None => 0,
            PolicyKind::Basic128Rsa15 => 16,
            _ => 32,
        }
    }

    /// Accepted remote key modulus range in bits.
    #[inline]
    pub fn key_bits_range(self) -> (usize, usize) {
        match self {
            PolicyKind::None | PolicyKind::PubSubAes128Ctr => (0, usize::MAX),
            PolicyKind::Basic128Rsa15 => (1024, 2048),
            PolicyKind::Basic256 | PolicyKind::Basic256Sha256 => (1024, 4096),
            PolicyKind::Aes256Sha256RsaPss => (2048, 4096),
        }
    }

    #[inline]
    pub fn sym_signature_size(self) -> usize {
        self.sym_hash().map_or(0, HashAlg::size)
    }

    /// Block size the symmetric cipher operates on.
    #[inline]
    pub fn sym_block_size(self) -> usize {
        match self {
            PolicyKind::None => 1,
            // CTR is a stream mode
            PolicyKind::PubSubAes128Ctr => 1,
            _ => crypto::AES_BLOCK_SIZE,
        }
    }
}

/// Symmetric key material for one direction of a channel.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChannelKeys {
    pub sign_key: Vec<u8>,
    pub enc_key: Vec<u8>,
    pub iv: Vec<u8>,
}

impl ChannelKeys {
    #[inline]
    pub fn empty() -> ChannelKeys {
        ChannelKeys {
            sign_key: Vec::new(),
            enc_key: Vec::new(),
            iv: Vec::new(),
        }
    }
}

/// A security policy instance, optionally bound to the local identity.
#[derive(Debug)]
pub struct SecurityPolicy {
    kind: PolicyKind,
    local_cert: Option<Certificate>,
    private_key: Option<RsaPrivateKey>,
}

impl SecurityPolicy {
    /// Creates a policy without a local identity (None / PubSub profiles).
    #[inline]
    pub fn new(kind: PolicyKind) -> SecurityPolicy {
        SecurityPolicy {
            kind,
            local_cert: None,
            private_key: None,
        }
    }

    /// Creates a policy bound to the local certificate + private key pair.
    pub fn with_identity(
        kind: PolicyKind,
        cert: Certificate,
        key: RsaPrivateKey,
    ) -> CryptoResult<SecurityPolicy> {
        if !crypto::key_pair_matches(&key, cert.public_key()) {
            return Err(CryptoError::KeyMismatch);
        }

        Ok(SecurityPolicy {
            kind,
            local_cert: Some(cert),
            private_key: Some(key),
        })
    }

    #[inline]
    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    #[inline]
    pub fn uri(&self) -> &'static str {
        self.kind.uri()
    }

    #[inline]
    pub fn local_cert(&self) -> Option<&Certificate> {
        self.local_cert.as_ref()
    }

    #[inline]
    pub fn private_key(&self) -> Option<&RsaPrivateKey> {
        self.private_key.as_ref()
    }

    /// Replaces the local certificate and private key. Open channels bound to
    /// this policy must be torn down by the caller once this returns.
    pub fn update_certificate_and_private_key(
        &mut self,
        cert: Certificate,
        key: RsaPrivateKey,
    ) -> CryptoResult<()> {
        if !crypto::key_pair_matches(&key, cert.public_key()) {
            return Err(CryptoError::KeyMismatch);
        }

        self.local_cert = Some(cert);
        self.private_key = Some(key);
        Ok(())
    }

    /// Checks the remote certificate's key size against the policy range.
    pub fn validate_remote_key_bits(&self, remote: &Certificate) -> CryptoResult<()> {
        let (min, max) = self.kind.key_bits_range();
        let bits = remote.key_bits();

        if bits < min || bits > max {
            return Err(CryptoError::BadKeyLength);
        }

        Ok(())
    }

    /// Signature produced by the local private key, in bytes.
    pub fn asym_local_signature_size(&self) -> usize {
        match (&self.private_key, self.kind.asym_sig_alg()) {
            (Some(key), Some(_)) => crypto::rsa_cipher_block_size(&key.to_public_key()),
            _ => 0,
        }
    }

    /// Signature produced by the remote certificate's key, in bytes.
    #[inline]
    pub fn asym_remote_signature_size(&self, remote: &Certificate) -> usize {
        match self.kind.asym_sig_alg() {
            Some(_) => crypto::rsa_cipher_block_size(remote.public_key()),
            None => 0,
        }
    }

    /// Signs with the local private key.
    pub fn asym_sign(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let alg = match self.kind.asym_sig_alg() {
            Some(alg) => alg,
            None => return Ok(Vec::new()),
        };
        let key = self.private_key.as_ref().ok_or(CryptoError::InvalidArgument)?;

        crypto::rsa_sign(key, alg, data)
    }

    /// Verifies against the remote certificate.
    pub fn asym_verify(&self, remote: &Certificate, data: &[u8], sig: &[u8]) -> CryptoResult<()> {
        let alg = match self.kind.asym_sig_alg() {
            Some(alg) => alg,
            None => return Ok(()),
        };

        crypto::rsa_verify(remote.public_key(), alg, data, sig)
    }

    /// Encrypts to the remote certificate's public key, block by block.
    pub fn asym_encrypt(&self, remote: &Certificate, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let alg = match self.kind.asym_enc_alg() {
            Some(alg) => alg,
            None => return Ok(data.to_vec()),
        };

        let plain_block = crypto::rsa_plain_block_size(remote.public_key(), alg);
        let cipher_block = crypto::rsa_cipher_block_size(remote.public_key());
        let blocks = (data.len() + plain_block - 1) / plain_block;

        let mut out = Vec::with_capacity(blocks * cipher_block);
        for chunk in data.chunks(plain_block) {
            out.extend_from_slice(&crypto::rsa_encrypt(remote.public_key(), alg, chunk)?);
        }

        Ok(out)
    }

    /// Decrypts with the local private key, block by block.
    pub fn asym_decrypt(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let alg = match self.kind.asym_enc_alg() {
            Some(alg) => alg,
            None => return Ok(data.to_vec()),
        };
        let key = self.private_key.as_ref().ok_or(CryptoError::InvalidArgument)?;

        let cipher_block = crypto::rsa_cipher_block_size(&key.to_public_key());
        if data.is_empty() || data.len() % cipher_block != 0 {
            return Err(CryptoError::BadBlockLength);
        }

        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks(cipher_block) {
            out.extend_from_slice(&crypto::rsa_decrypt(key, alg, chunk)?);
        }

        Ok(out)
    }

    /// Maximal cleartext block the remote key admits for one RSA block.
    #[inline]
    pub fn asym_plain_block_size(&self, remote: &Certificate) -> usize {
        match self.kind.asym_enc_alg() {
            Some(alg) => crypto::rsa_plain_block_size(remote.public_key(), alg),
            None => usize::MAX,
        }
    }

    #[inline]
    pub fn asym_cipher_block_size(&self, remote: &Certificate) -> usize {
        match self.kind.asym_enc_alg() {
            Some(_) => crypto::rsa_cipher_block_size(remote.public_key()),
            None => 1,
        }
    }

    /// Signs with a derived symmetric key.
    pub fn sym_sign(&self, keys: &ChannelKeys, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let hash = match self.kind.sym_hash() {
            Some(hash) => hash,
            None => return Ok(Vec::new()),
        };

        crypto::hmac_sign(hash, &keys.sign_key, data)
    }

    /// Verifies a symmetric MAC (constant time).
    pub fn sym_verify(&self, keys: &ChannelKeys, data: &[u8], mac: &[u8]) -> CryptoResult<()> {
        let hash = match self.kind.sym_hash() {
            Some(hash) => hash,
            None => return Ok(()),
        };

        crypto::hmac_verify(hash, &keys.sign_key, data, mac)
    }

    /// Encrypts in place with the derived key set.
    pub fn sym_encrypt(&self, keys: &ChannelKeys, data: &mut [u8]) -> CryptoResult<()> {
        match self.kind {
            PolicyKind::None => Ok(()),
            PolicyKind::PubSubAes128Ctr => {
                let counter = ctr_counter_block(&keys.iv);
                crypto::aes_ctr_apply(&keys.enc_key, &counter, data)
            }
            _ => crypto::aes_cbc_encrypt(&keys.enc_key, &keys.iv, data),
        }
    }

    /// Decrypts in place with the derived key set.
    pub fn sym_decrypt(&self, keys: &ChannelKeys, data: &mut [u8]) -> CryptoResult<()> {
        match self.kind {
            PolicyKind::None => Ok(()),
            PolicyKind::PubSubAes128Ctr => {
                let counter = ctr_counter_block(&keys.iv);
                crypto::aes_ctr_apply(&keys.enc_key, &counter, data)
            }
            _ => crypto::aes_cbc_decrypt(&keys.enc_key, &keys.iv, data),
        }
    }

    /// Derives one direction's key material with P_HASH and slices it into
    /// {signing key | encrypting key | iv} per the policy lengths.
    pub fn derive_channel_keys(&self, secret: &[u8], seed: &[u8]) -> CryptoResult<ChannelKeys> {
        let hash = match self.kind.sym_hash() {
            Some(hash) => hash,
            None => return Ok(ChannelKeys::empty()),
        };

        let (sign_len, enc_len, iv_len) = self.kind.derived_key_lengths();
        let material = crypto::p_hash(hash, secret, seed, sign_len + enc_len + iv_len)?;

        Ok(ChannelKeys {
            sign_key: material[..sign_len].to_vec(),
            enc_key: material[sign_len..sign_len + enc_len].to_vec(),
            iv: material[sign_len + enc_len..].to_vec(),
        })
    }

    /// Generates a nonce of the policy's length from the DRBG.
    #[inline]
    pub fn make_nonce(&self) -> Vec<u8> {
        crypto::random_vec(self.kind.nonce_length())
    }
}

/// Expands the short PubSub key nonce into a full AES counter block.
#[inline]
fn ctr_counter_block(nonce: &[u8]) -> [u8; crypto::AES_BLOCK_SIZE] {
    let mut block = [0u8; crypto::AES_BLOCK_SIZE];
    let len = nonce.len().min(crypto::AES_BLOCK_SIZE);
    block[..len].copy_from_slice(&nonce[..len]);
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keys;
    use crate::forge;

    fn make_policy(kind: PolicyKind) -> SecurityPolicy {
        let cert = forge::create_self_signed(&*test_keys::RSA_2048, "CN=policy-local", &[], 365).unwrap();
        SecurityPolicy::with_identity(kind, cert, test_keys::RSA_2048.clone()).unwrap()
    }

    fn remote_cert() -> Certificate {
        forge::create_self_signed(&*test_keys::RSA_2048_ALT, "CN=policy-remote", &[], 365).unwrap()
    }

    #[test]
    fn test_uri_roundtrip() {
        for kind in [
            PolicyKind::None,
            PolicyKind::Basic128Rsa15,
            PolicyKind::Basic256,
            PolicyKind::Basic256Sha256,
            PolicyKind::Aes256Sha256RsaPss,
            PolicyKind::PubSubAes128Ctr,
        ] {
            assert_eq!(PolicyKind::from_uri(kind.uri()), Some(kind));
        }
        assert_eq!(PolicyKind::from_uri("urn:not-a-policy"), None);
    }

    #[test]
    fn test_with_identity_err_key_mismatch() {
        let cert = forge::create_self_signed(&*test_keys::RSA_2048, "CN=mismatch", &[], 365).unwrap();
        let result = SecurityPolicy::with_identity(
            PolicyKind::Basic256Sha256,
            cert,
            test_keys::RSA_2048_ALT.clone(),
        );

        assert_eq!(result.unwrap_err(), CryptoError::KeyMismatch);
    }

    #[test]
    fn test_derive_channel_keys_lengths() {
        let policy = make_policy(PolicyKind::Basic256);
        let keys = policy.derive_channel_keys(b"server nonce material", b"client nonce").unwrap();

        assert_eq!(keys.sign_key.len(), 24);
        assert_eq!(keys.enc_key.len(), 32);
        assert_eq!(keys.iv.len(), 16);
    }

    #[test]
    fn test_derive_channel_keys_directional() {
        let policy = make_policy(PolicyKind::Basic256Sha256);
        let client = policy.derive_channel_keys(b"server-nonce", b"client-nonce").unwrap();
        let server = policy.derive_channel_keys(b"client-nonce", b"server-nonce").unwrap();

        assert_ne!(client, server);
    }

    #[test]
    fn test_sym_sign_verify_roundtrip() {
        let policy = make_policy(PolicyKind::Aes256Sha256RsaPss);
        let keys = policy.derive_channel_keys(b"secret", b"seed").unwrap();

        let mac = policy.sym_sign(&keys, b"sequence header and body").unwrap();
        assert_eq!(mac.len(), policy.kind().sym_signature_size());
        policy.sym_verify(&keys, b"sequence header and body", &mac).unwrap();

        assert_eq!(
            policy.sym_verify(&keys, b"tampered body", &mac).unwrap_err(),
            CryptoError::SignatureRejected
        );
    }

    #[test]
    fn test_sym_encrypt_decrypt_roundtrip() {
        let policy = make_policy(PolicyKind::Basic256Sha256);
        let keys = policy.derive_channel_keys(b"secret", b"seed").unwrap();
        let mut data = vec![7u8; 64];

        policy.sym_encrypt(&keys, &mut data).unwrap();
        assert_ne!(data, vec![7u8; 64]);
        policy.sym_decrypt(&keys, &mut data).unwrap();
        assert_eq!(data, vec![7u8; 64]);
    }

    #[test]
    fn test_pubsub_ctr_stream_roundtrip() {
        let policy = SecurityPolicy::new(PolicyKind::PubSubAes128Ctr);
        let keys = policy.derive_channel_keys(b"secret", b"seed").unwrap();

        assert_eq!(keys.sign_key.len(), 32);
        assert_eq!(keys.enc_key.len(), 16);
        assert_eq!(keys.iv.len(), 4);

        // Stream mode handles arbitrary lengths
        let mut data = vec![9u8; 23];
        policy.sym_encrypt(&keys, &mut data).unwrap();
        policy.sym_decrypt(&keys, &mut data).unwrap();
        assert_eq!(data, vec![9u8; 23]);
    }

    #[test]
    fn test_asym_sign_verify_roundtrip() {
        let local = make_policy(PolicyKind::Basic256Sha256);
        let local_cert = local.local_cert().unwrap().clone();

        let sig = local.asym_sign(b"opn chunk").unwrap();
        assert_eq!(sig.len(), local.asym_local_signature_size());

        // The remote side verifies against our certificate
        let remote = SecurityPolicy::new(PolicyKind::Basic256Sha256);
        remote.asym_verify(&local_cert, b"opn chunk", &sig).unwrap();
    }

    #[test]
    fn test_asym_encrypt_decrypt_multi_block() {
        let receiver = make_policy(PolicyKind::Basic256);
        let receiver_cert = receiver.local_cert().unwrap().clone();
        let sender = SecurityPolicy::new(PolicyKind::Basic256);

        // Larger than one OAEP block to force splitting
        let plain = crypto::random_vec(500);
        let cipher = sender.asym_encrypt(&receiver_cert, &plain).unwrap();

        assert_eq!(cipher.len() % 256, 0);
        assert!(cipher.len() > plain.len());
        assert_eq!(receiver.asym_decrypt(&cipher).unwrap(), plain);
    }

    #[test]
    fn test_asym_decrypt_err_partial_block() {
        let policy = make_policy(PolicyKind::Basic256);

        assert_eq!(
            policy.asym_decrypt(&[0u8; 255]).unwrap_err(),
            CryptoError::BadBlockLength
        );
    }

    #[test]
    fn test_validate_remote_key_bits() {
        let policy = make_policy(PolicyKind::Aes256Sha256RsaPss);
        policy.validate_remote_key_bits(&remote_cert()).unwrap();
    }

    #[test]
    fn test_none_policy_noops() {
        let policy = SecurityPolicy::new(PolicyKind::None);
        let keys = policy.derive_channel_keys(b"ignored", b"ignored").unwrap();

        assert_eq!(policy.asym_sign(b"data").unwrap(), Vec::<u8>::new());
        assert_eq!(policy.sym_sign(&keys, b"data").unwrap(), Vec::<u8>::new());

        let mut data = [1u8; 8];
        policy.sym_encrypt(&keys, &mut data).unwrap();
        assert_eq!(data, [1u8; 8]);
    }

    #[test]
    fn test_update_certificate_and_private_key() {
        let mut policy = make_policy(PolicyKind::Basic256Sha256);
        let new_cert =
            forge::create_self_signed(&*test_keys::RSA_2048_ALT, "CN=rotated", &[], 365).unwrap();

        assert_eq!(
            policy
                .update_certificate_and_private_key(new_cert.clone(), test_keys::RSA_2048.clone())
                .unwrap_err(),
            CryptoError::KeyMismatch
        );

        policy
            .update_certificate_and_private_key(new_cert, test_keys::RSA_2048_ALT.clone())
            .unwrap();
        assert!(policy.local_cert().unwrap().subject().contains("rotated"));
    }
}
