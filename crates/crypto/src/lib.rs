//! Signing helpers for the credentials Parley issues and verifies.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use ed25519_dalek::Signer;
use rand::rngs::OsRng;

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn verifying_key_from(signing_key: &SigningKey) -> VerifyingKey {
    signing_key.verifying_key()
}

pub fn sign_message(signing_key: &SigningKey, message: &[u8]) -> Signature {
    signing_key.sign(message)
}

pub fn verify_signature(
    verifying_key: &VerifyingKey,
    message: &[u8],
    signature: &Signature,
) -> Result<()> {
    verifying_key
        .verify_strict(message, signature)
        .map_err(|err| anyhow!(err))
}

/// Decode a 32-byte signing key from URL-safe base64 without padding.
pub fn signing_key_from_base64(raw: &str) -> Result<SigningKey> {
    let bytes = decode_key_bytes(raw).context("failed to decode signing key")?;
    Ok(SigningKey::from_bytes(&bytes))
}

pub fn verifying_key_from_base64(raw: &str) -> Result<VerifyingKey> {
    let bytes = decode_key_bytes(raw).context("failed to decode verifying key")?;
    VerifyingKey::from_bytes(&bytes).map_err(|err| anyhow!("invalid verifying key: {err}"))
}

pub fn encode_key(bytes: &[u8; 32]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn decode_key_bytes(raw: &str) -> Result<[u8; 32]> {
    let decoded = URL_SAFE_NO_PAD.decode(raw.trim())?;
    decoded
        .try_into()
        .map_err(|_| anyhow!("key material must be 32 bytes"))
}
