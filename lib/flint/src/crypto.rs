//! Cryptographic primitive capability set backing the security policies.
//!
//! Everything here returns tagged errors; nothing panics on bad peer input.
//! Randomness is drawn from a process-global DRBG seeded once at startup.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use lazy_static::lazy_static;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::hazmat::PrehashVerifier;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::convert::TryFrom;
use std::fmt;
use std::sync::Mutex;

pub const SHA1_SIZE: usize = 20;
pub const SHA256_SIZE: usize = 32;
pub const AES_BLOCK_SIZE: usize = 16;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CryptoError {
    /// Empty or nonsensical input.
    InvalidArgument,
    /// Key material has the wrong length for the requested primitive.
    BadKeyLength,
    /// Data length violates the primitive's block requirements.
    BadBlockLength,
    /// The requested algorithm is not available.
    Unsupported,
    /// Signature or MAC verification failed.
    SignatureRejected,
    EncryptFailed,
    DecryptFailed,
    KeyParseFailed,
    CertParseFailed,
    /// Certificate, CSR or CRL assembly failed.
    GenerationFailed,
    /// Private key does not match the certificate public key.
    KeyMismatch,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for CryptoError {}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HashAlg {
    Sha1,
    Sha256,
}

impl HashAlg {
    #[inline]
    pub fn size(self) -> usize {
        match self {
            HashAlg::Sha1 => SHA1_SIZE,
            HashAlg::Sha256 => SHA256_SIZE,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RsaSigAlg {
    Pkcs1v15Sha1,
    Pkcs1v15Sha256,
    PssSha256,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RsaEncAlg {
    Pkcs1v15,
    OaepSha1,
    OaepSha256,
}

lazy_static! {
    static ref DRBG: Mutex<ChaCha20Rng> = Mutex::new(ChaCha20Rng::from_entropy());
}

/// Fills the provided buffer with bytes drawn from the global DRBG.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    use rand::RngCore;
    DRBG.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .fill_bytes(out);
}

/// Returns `n` bytes drawn from the global DRBG.
#[inline]
pub fn random_vec(n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    random_bytes(&mut out);
    out
}

/// Generates a fresh RSA private key from the global DRBG.
pub fn generate_rsa_key(bits: usize) -> CryptoResult<RsaPrivateKey> {
    let mut rng = DRBG.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    RsaPrivateKey::new(&mut *rng, bits).map_err(|_| CryptoError::GenerationFailed)
}

/// Computes the digest of `input` with the selected algorithm.
pub fn hash(alg: HashAlg, input: &[u8]) -> Vec<u8> {
    match alg {
        HashAlg::Sha1 => Sha1::digest(input).to_vec(),
        HashAlg::Sha256 => Sha256::digest(input).to_vec(),
    }
}

/// Computes an HMAC over `input`.
pub fn hmac_sign(alg: HashAlg, key: &[u8], input: &[u8]) -> CryptoResult<Vec<u8>> {
    match alg {
        HashAlg::Sha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(key).map_err(|_| CryptoError::BadKeyLength)?;
            mac.update(input);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        HashAlg::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| CryptoError::BadKeyLength)?;
            mac.update(input);
            Ok(mac.finalize().into_bytes().to_vec())
        }
    }
}

/// Verifies an HMAC in constant time.
pub fn hmac_verify(alg: HashAlg, key: &[u8], input: &[u8], mac: &[u8]) -> CryptoResult<()> {
    let result = match alg {
        HashAlg::Sha1 => {
            let mut state = Hmac::<Sha1>::new_from_slice(key).map_err(|_| CryptoError::BadKeyLength)?;
            state.update(input);
            state.verify_slice(mac)
        }
        HashAlg::Sha256 => {
            let mut state = Hmac::<Sha256>::new_from_slice(key).map_err(|_| CryptoError::BadKeyLength)?;
            state.update(input);
            state.verify_slice(mac)
        }
    };

    result.map_err(|_| CryptoError::SignatureRejected)
}

/// The TLS P_HASH construction used for deriving symmetric key material.
///
/// `A(0) = seed, A(n) = HMAC(secret, A(n-1))`, output is the concatenation of
/// `HMAC(secret, A(n) | seed)` truncated to `out_len`.
pub fn p_hash(alg: HashAlg, secret: &[u8], seed: &[u8], out_len: usize) -> CryptoResult<Vec<u8>> {
    if secret.is_empty() || seed.is_empty() || out_len == 0 {
        return Err(CryptoError::InvalidArgument);
    }

    let mut out = Vec::with_capacity(out_len);
    let mut a = hmac_sign(alg, secret, seed)?;

    while out.len() < out_len {
        let mut input = a.clone();
        input.extend_from_slice(seed);
        let block = hmac_sign(alg, secret, &input)?;
        out.extend_from_slice(&block);
        a = hmac_sign(alg, secret, &a)?;
    }

    out.truncate(out_len);
    Ok(out)
}

/// Signs `input` with the private key. PSS draws its salt from the DRBG.
pub fn rsa_sign(key: &RsaPrivateKey, alg: RsaSigAlg, input: &[u8]) -> CryptoResult<Vec<u8>> {
    match alg {
        RsaSigAlg::Pkcs1v15Sha1 => {
            let signer = rsa::pkcs1v15::SigningKey::<Sha1>::new(key.clone());
            Ok(signer.sign(input).to_vec())
        }
        RsaSigAlg::Pkcs1v15Sha256 => {
            let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(key.clone());
            Ok(signer.sign(input).to_vec())
        }
        RsaSigAlg::PssSha256 => {
            let signer = rsa::pss::SigningKey::<Sha256>::new(key.clone());
            let mut rng = DRBG.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Ok(signer.sign_with_rng(&mut *rng, input).to_vec())
        }
    }
}

/// Verifies a signature over `input` against the public key.
pub fn rsa_verify(key: &RsaPublicKey, alg: RsaSigAlg, input: &[u8], sig: &[u8]) -> CryptoResult<()> {
    match alg {
        RsaSigAlg::Pkcs1v15Sha1 => {
            let verifier = rsa::pkcs1v15::VerifyingKey::<Sha1>::new(key.clone());
            let sig = rsa::pkcs1v15::Signature::try_from(sig).map_err(|_| CryptoError::SignatureRejected)?;
            verifier.verify(input, &sig).map_err(|_| CryptoError::SignatureRejected)
        }
        RsaSigAlg::Pkcs1v15Sha256 => {
            let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key.clone());
            let sig = rsa::pkcs1v15::Signature::try_from(sig).map_err(|_| CryptoError::SignatureRejected)?;
            verifier.verify(input, &sig).map_err(|_| CryptoError::SignatureRejected)
        }
        RsaSigAlg::PssSha256 => {
            let verifier = rsa::pss::VerifyingKey::<Sha256>::new(key.clone());
            let sig = rsa::pss::Signature::try_from(sig).map_err(|_| CryptoError::SignatureRejected)?;
            verifier.verify(input, &sig).map_err(|_| CryptoError::SignatureRejected)
        }
    }
}

/// Verifies a signature over an externally computed digest. Used for
/// certificate chain checks where the hash comes out of the DER structure.
pub fn rsa_verify_prehash(
    key: &RsaPublicKey,
    alg: RsaSigAlg,
    digest: &[u8],
    sig: &[u8],
) -> CryptoResult<()> {
    match alg {
        RsaSigAlg::Pkcs1v15Sha1 => {
            let verifier = rsa::pkcs1v15::VerifyingKey::<Sha1>::new(key.clone());
            let sig = rsa::pkcs1v15::Signature::try_from(sig).map_err(|_| CryptoError::SignatureRejected)?;
            verifier
                .verify_prehash(digest, &sig)
                .map_err(|_| CryptoError::SignatureRejected)
        }
        RsaSigAlg::Pkcs1v15Sha256 => {
            let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key.clone());
            let sig = rsa::pkcs1v15::Signature::try_from(sig).map_err(|_| CryptoError::SignatureRejected)?;
            verifier
                .verify_prehash(digest, &sig)
                .map_err(|_| CryptoError::SignatureRejected)
        }
        RsaSigAlg::PssSha256 => Err(CryptoError::Unsupported),
    }
}

/// Encrypts a single block with the public key.
pub fn rsa_encrypt(key: &RsaPublicKey, alg: RsaEncAlg, block: &[u8]) -> CryptoResult<Vec<u8>> {
    if block.is_empty() || block.len() > rsa_plain_block_size(key, alg) {
        return Err(CryptoError::BadBlockLength);
    }

    let mut rng = DRBG.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    let result = match alg {
        RsaEncAlg::Pkcs1v15 => key.encrypt(&mut *rng, Pkcs1v15Encrypt, block),
        RsaEncAlg::OaepSha1 => key.encrypt(&mut *rng, Oaep::new::<Sha1>(), block),
        RsaEncAlg::OaepSha256 => key.encrypt(&mut *rng, Oaep::new::<Sha256>(), block),
    };

    result.map_err(|_| CryptoError::EncryptFailed)
}

/// Decrypts a single block with the private key.
pub fn rsa_decrypt(key: &RsaPrivateKey, alg: RsaEncAlg, block: &[u8]) -> CryptoResult<Vec<u8>> {
    let result = match alg {
        RsaEncAlg::Pkcs1v15 => key.decrypt(Pkcs1v15Encrypt, block),
        RsaEncAlg::OaepSha1 => key.decrypt(Oaep::new::<Sha1>(), block),
        RsaEncAlg::OaepSha256 => key.decrypt(Oaep::new::<Sha256>(), block),
    };

    result.map_err(|_| CryptoError::DecryptFailed)
}

/// Ciphertext block size of the key (the modulus size in bytes).
#[inline]
pub fn rsa_cipher_block_size(key: &RsaPublicKey) -> usize {
    key.size()
}

/// Maximal plaintext block the padding scheme admits for the key.
#[inline]
pub fn rsa_plain_block_size(key: &RsaPublicKey, alg: RsaEncAlg) -> usize {
    let k = key.size();
    match alg {
        RsaEncAlg::Pkcs1v15 => k.saturating_sub(11),
        RsaEncAlg::OaepSha1 => k.saturating_sub(2 * SHA1_SIZE + 2),
        RsaEncAlg::OaepSha256 => k.saturating_sub(2 * SHA256_SIZE + 2),
    }
}

/// Modulus size of the key in bits.
#[inline]
pub fn rsa_key_bits(key: &RsaPublicKey) -> usize {
    key.n().bits()
}

/// Encrypts `data` in place with AES-CBC (no padding, length must be a
/// multiple of the block size). Key length selects AES-128 or AES-256.
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> CryptoResult<()> {
    if iv.len() != AES_BLOCK_SIZE {
        return Err(CryptoError::BadKeyLength);
    }
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::BadBlockLength);
    }

    let len = data.len();
    match key.len() {
        16 => {
            let cipher = cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::BadKeyLength)?;
            cipher
                .encrypt_padded_mut::<NoPadding>(data, len)
                .map_err(|_| CryptoError::EncryptFailed)?;
        }
        32 => {
            let cipher = cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::BadKeyLength)?;
            cipher
                .encrypt_padded_mut::<NoPadding>(data, len)
                .map_err(|_| CryptoError::EncryptFailed)?;
        }
        _ => return Err(CryptoError::BadKeyLength),
    }

    Ok(())
}

/// Decrypts `data` in place with AES-CBC (no padding).
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], data: &mut [u8]) -> CryptoResult<()> {
    if iv.len() != AES_BLOCK_SIZE {
        return Err(CryptoError::BadKeyLength);
    }
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::BadBlockLength);
    }

    match key.len() {
        16 => {
            let cipher = cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::BadKeyLength)?;
            cipher
                .decrypt_padded_mut::<NoPadding>(data)
                .map_err(|_| CryptoError::DecryptFailed)?;
        }
        32 => {
            let cipher = cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
                .map_err(|_| CryptoError::BadKeyLength)?;
            cipher
                .decrypt_padded_mut::<NoPadding>(data)
                .map_err(|_| CryptoError::DecryptFailed)?;
        }
        _ => return Err(CryptoError::BadKeyLength),
    }

    Ok(())
}

/// Applies the AES-CTR keystream to `data` in place. Encryption and
/// decryption are the same operation.
pub fn aes_ctr_apply(key: &[u8], counter_block: &[u8], data: &mut [u8]) -> CryptoResult<()> {
    if counter_block.len() != AES_BLOCK_SIZE {
        return Err(CryptoError::BadKeyLength);
    }

    match key.len() {
        16 => {
            let mut cipher = ctr::Ctr128BE::<aes::Aes128>::new_from_slices(key, counter_block)
                .map_err(|_| CryptoError::BadKeyLength)?;
            cipher.apply_keystream(data);
        }
        32 => {
            let mut cipher = ctr::Ctr128BE::<aes::Aes256>::new_from_slices(key, counter_block)
                .map_err(|_| CryptoError::BadKeyLength)?;
            cipher.apply_keystream(data);
        }
        _ => return Err(CryptoError::BadKeyLength),
    }

    Ok(())
}

/// Parses a private key from PEM or DER input.
///
/// Input starting with `0x2D` ('-') is treated as PEM; a leading
/// `0x30 0x82` DER sequence is used verbatim. Both PKCS#8 and PKCS#1
/// containers are accepted.
pub fn parse_private_key(input: &[u8]) -> CryptoResult<RsaPrivateKey> {
    if input.is_empty() {
        return Err(CryptoError::InvalidArgument);
    }

    if input[0] == 0x2D {
        let pem = std::str::from_utf8(input).map_err(|_| CryptoError::KeyParseFailed)?;
        // PEM bodies may arrive with a trailing NUL from C-side tooling
        let pem = pem.trim_end_matches('\0');
        return RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|_| CryptoError::KeyParseFailed);
    }

    RsaPrivateKey::from_pkcs8_der(input)
        .or_else(|_| RsaPrivateKey::from_pkcs1_der(input))
        .map_err(|_| CryptoError::KeyParseFailed)
}

/// Checks that the private key and the certificate public key form a pair.
pub fn key_pair_matches(private: &RsaPrivateKey, public: &RsaPublicKey) -> bool {
    private.n() == public.n() && private.e() == public.e()
}

#[cfg(test)]
pub(crate) mod test_keys {
    use lazy_static::lazy_static;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rsa::RsaPrivateKey;

    lazy_static! {
        pub static ref RSA_2048: RsaPrivateKey = {
            let mut rng = StdRng::seed_from_u64(0x0a55_0a55);
            RsaPrivateKey::new(&mut rng, 2048).expect("Test key generation failed")
        };
        pub static ref RSA_2048_ALT: RsaPrivateKey = {
            let mut rng = StdRng::seed_from_u64(0x0a55_0a56);
            RsaPrivateKey::new(&mut rng, 2048).expect("Test key generation failed")
        };
    }
}
