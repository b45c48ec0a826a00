//! Public-key authentication primitives.
//!
//! Keys travel in OpenSSH authorized-key form (`ssh-ed25519 AAAA... comment`)
//! so an agent's allow-list can be pasted straight from the hub's API.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Domain separator prepended to every challenge before signing.
pub const AUTH_DOMAIN: &[u8] = b"fleetwatch-auth-v1";

const KEY_TYPE: &str = "ssh-ed25519";

/// Key handling error types.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error("no public keys found")]
    NoKeys,
}

/// Encode a verifying key as an OpenSSH `ssh-ed25519` line (no comment).
pub fn format_public_key(key: &VerifyingKey) -> String {
    format!("{} {}", KEY_TYPE, STANDARD.encode(key_blob(key)))
}

/// Parse one OpenSSH `ssh-ed25519` key line.
pub fn parse_public_key(line: &str) -> Result<VerifyingKey, KeyError> {
    let mut parts = line.split_whitespace();
    let (Some(kind), Some(data)) = (parts.next(), parts.next()) else {
        return Err(KeyError::InvalidPublicKey("expected '<type> <base64>'".to_string()));
    };
    if kind != KEY_TYPE {
        return Err(KeyError::InvalidPublicKey(format!("unsupported key type {}", kind)));
    }

    let blob = STANDARD
        .decode(data)
        .map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;

    let (embedded_type, rest) = read_ssh_string(&blob)?;
    if embedded_type != KEY_TYPE.as_bytes() {
        return Err(KeyError::InvalidPublicKey("key type mismatch in blob".to_string()));
    }
    let (raw, rest) = read_ssh_string(rest)?;
    if !rest.is_empty() {
        return Err(KeyError::InvalidPublicKey("trailing bytes in key blob".to_string()));
    }
    let raw: [u8; 32] = raw
        .try_into()
        .map_err(|_| KeyError::InvalidPublicKey(format!("expected 32 key bytes, got {}", raw.len())))?;

    VerifyingKey::from_bytes(&raw).map_err(|e| KeyError::InvalidPublicKey(e.to_string()))
}

/// Parse a newline-separated list of keys, skipping blanks and comments.
pub fn parse_keys(text: &str) -> Result<Vec<VerifyingKey>, KeyError> {
    let keys = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(parse_public_key)
        .collect::<Result<Vec<_>, _>>()?;

    if keys.is_empty() {
        return Err(KeyError::NoKeys);
    }
    Ok(keys)
}

/// OpenSSH-style SHA256 fingerprint (`SHA256:<base64, no padding>`).
pub fn fingerprint(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key_blob(key));
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

/// Sign an agent challenge.
pub fn sign_challenge(key: &SigningKey, nonce: &[u8]) -> String {
    let signature = key.sign(&challenge_message(nonce));
    STANDARD.encode(signature.to_bytes())
}

/// Check a challenge response against the allow-list. Returns the
/// authenticated key on success.
pub fn verify_challenge(
    allowed: &[VerifyingKey],
    public_key: &str,
    signature: &str,
    nonce: &[u8],
) -> Result<VerifyingKey, KeyError> {
    let key = parse_public_key(public_key)?;
    if !allowed.iter().any(|k| k.as_bytes() == key.as_bytes()) {
        return Err(KeyError::InvalidPublicKey(format!(
            "{} is not authorized",
            fingerprint(&key)
        )));
    }

    let sig_bytes = STANDARD
        .decode(signature)
        .map_err(|e| KeyError::InvalidPublicKey(format!("bad signature encoding: {}", e)))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| KeyError::InvalidPublicKey(format!("bad signature: {}", e)))?;

    key.verify_strict(&challenge_message(nonce), &signature)
        .map_err(|_| KeyError::InvalidPublicKey("signature verification failed".to_string()))?;

    Ok(key)
}

fn challenge_message(nonce: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(AUTH_DOMAIN.len() + nonce.len());
    msg.extend_from_slice(AUTH_DOMAIN);
    msg.extend_from_slice(nonce);
    msg
}

fn key_blob(key: &VerifyingKey) -> Vec<u8> {
    let mut blob = Vec::with_capacity(4 + KEY_TYPE.len() + 4 + 32);
    blob.extend_from_slice(&(KEY_TYPE.len() as u32).to_be_bytes());
    blob.extend_from_slice(KEY_TYPE.as_bytes());
    blob.extend_from_slice(&32u32.to_be_bytes());
    blob.extend_from_slice(key.as_bytes());
    blob
}

fn read_ssh_string(data: &[u8]) -> Result<(&[u8], &[u8]), KeyError> {
    if data.len() < 4 {
        return Err(KeyError::InvalidPublicKey("truncated key blob".to_string()));
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let rest = &data[4..];
    if rest.len() < len {
        return Err(KeyError::InvalidPublicKey("truncated key blob".to_string()));
    }
    Ok(rest.split_at(len))
}
