//! Cryptographic utilities for token schemes (HMAC, random handles, body digests).

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use rand::Rng;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Sha224, Sha256, Sha384, Sha512};

use super::types::TokenError;

/// Hash functions available for keyed message authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha224,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Name used in the `mac_algorithm` token parameter.
    pub fn mac_name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha224 => "hmac-sha-224",
            HashAlgorithm::Sha256 => "hmac-sha-256",
            HashAlgorithm::Sha384 => "hmac-sha-384",
            HashAlgorithm::Sha512 => "hmac-sha-512",
        }
    }

    pub fn from_mac_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "hmac-sha-224" => Some(HashAlgorithm::Sha224),
            "hmac-sha-256" => Some(HashAlgorithm::Sha256),
            "hmac-sha-384" => Some(HashAlgorithm::Sha384),
            "hmac-sha-512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    /// Tag length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha224 => 28,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }
}

fn keyed<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<M, TokenError> {
    let mut mac = <M as KeyInit>::new_from_slice(key)
        .map_err(|_| TokenError::Malformed("unusable MAC key".into()))?;
    mac.update(data);
    Ok(mac)
}

/// Create an HMAC tag for the given data using the provided secret key.
pub fn hmac_sign(algorithm: HashAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>, TokenError> {
    let tag = match algorithm {
        HashAlgorithm::Sha224 => keyed::<Hmac<Sha224>>(key, data)?.finalize().into_bytes().to_vec(),
        HashAlgorithm::Sha256 => keyed::<Hmac<Sha256>>(key, data)?.finalize().into_bytes().to_vec(),
        HashAlgorithm::Sha384 => keyed::<Hmac<Sha384>>(key, data)?.finalize().into_bytes().to_vec(),
        HashAlgorithm::Sha512 => keyed::<Hmac<Sha512>>(key, data)?.finalize().into_bytes().to_vec(),
    };
    Ok(tag)
}

/// Verify an HMAC tag in constant time.
pub fn hmac_verify(algorithm: HashAlgorithm, key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let verified = match algorithm {
        HashAlgorithm::Sha224 => keyed::<Hmac<Sha224>>(key, data).map(|m| m.verify_slice(tag).is_ok()),
        HashAlgorithm::Sha256 => keyed::<Hmac<Sha256>>(key, data).map(|m| m.verify_slice(tag).is_ok()),
        HashAlgorithm::Sha384 => keyed::<Hmac<Sha384>>(key, data).map(|m| m.verify_slice(tag).is_ok()),
        HashAlgorithm::Sha512 => keyed::<Hmac<Sha512>>(key, data).map(|m| m.verify_slice(tag).is_ok()),
    };
    verified.unwrap_or(false)
}

/// Generate `len` bytes from the system CSPRNG, base64url encoded without padding.
pub fn random_token(len: usize) -> Result<String, TokenError> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf)
        .map_err(|_| TokenError::Store("system random source unavailable".into()))?;
    Ok(URL_SAFE_NO_PAD.encode(&buf))
}

/// Alphanumeric nonce for request signing.
pub fn random_nonce(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// SHA-256 digest of a request body, base64 encoded.
pub fn body_digest(body: &[u8]) -> String {
    let hash = digest::digest(&digest::SHA256, body);
    STANDARD.encode(hash.as_ref())
}

pub fn encode_b64url(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn decode_b64url(data: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(data).ok()
}

pub fn encode_b64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn decode_b64(data: &str) -> Option<Vec<u8>> {
    STANDARD.decode(data).ok()
}
