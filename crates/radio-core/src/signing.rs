//! Offer signing and verification.
//!
//! Providers sign the canonical encoding of an offer's `data` object (see
//! [`crate::canonical`]) and ship the signature and public key base58-encoded.
//! Two schemes are understood, told apart by the decoded key length:
//!
//! - 32-byte keys: Ed25519
//! - 33/65-byte SEC1 keys: ECDSA over secp256k1 with a SHA-256 digest

use crate::canonical::to_canonical_bytes;
use crate::error::{Error, Result};
use crate::protocol::{constants::CLOCK_SKEW_TOLERANCE_SECS, ServiceOffer, ServiceOfferData};
use chrono::{DateTime, NaiveDateTime, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Signature algorithms accepted for offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureScheme {
    Ed25519,
    Secp256k1,
}

impl SignatureScheme {
    /// Infer the scheme from the length of a decoded public key.
    pub fn from_key_len(len: usize) -> Option<Self> {
        match len {
            32 => Some(SignatureScheme::Ed25519),
            33 | 65 => Some(SignatureScheme::Secp256k1),
            _ => None,
        }
    }
}

impl std::str::FromStr for SignatureScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ed25519" => Ok(SignatureScheme::Ed25519),
            "secp256k1" => Ok(SignatureScheme::Secp256k1),
            other => Err(Error::Malformed(format!("Unknown signature scheme: {}", other))),
        }
    }
}

/// Verify `signature` over `payload` with `pubkey`.
///
/// Malformed keys or signatures yield `false`; this never panics.
pub fn verify(payload: &[u8], signature: &[u8], pubkey: &[u8]) -> bool {
    match SignatureScheme::from_key_len(pubkey.len()) {
        Some(SignatureScheme::Ed25519) => verify_ed25519(payload, signature, pubkey),
        Some(SignatureScheme::Secp256k1) => verify_secp256k1(payload, signature, pubkey),
        None => {
            debug!("Rejecting public key of unsupported length {}", pubkey.len());
            false
        }
    }
}

/// Like [`verify`], with signature and key in their base58 wire encoding.
pub fn verify_encoded(payload: &[u8], signature: &str, pubkey: &str) -> bool {
    let (Ok(signature), Ok(pubkey)) = (
        bs58::decode(signature.trim()).into_vec(),
        bs58::decode(pubkey.trim()).into_vec(),
    ) else {
        debug!("Signature or public key is not valid base58");
        return false;
    };

    verify(payload, &signature, &pubkey)
}

fn verify_ed25519(payload: &[u8], signature: &[u8], pubkey: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(pubkey) else {
        return false;
    };
    let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature) = ed25519_dalek::Signature::from_slice(signature) else {
        return false;
    };

    key.verify_strict(payload, &signature).is_ok()
}

fn verify_secp256k1(payload: &[u8], signature: &[u8], pubkey: &[u8]) -> bool {
    use k256::ecdsa::signature::Verifier;

    let Ok(key) = k256::ecdsa::VerifyingKey::from_sec1_bytes(pubkey) else {
        return false;
    };
    let Ok(signature) = k256::ecdsa::Signature::from_slice(signature) else {
        return false;
    };

    key.verify(payload, &signature).is_ok()
}

/// Configuration for offer verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Maximum age of an offer in seconds (for replay protection)
    pub max_offer_age_secs: Option<u64>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self::permissive()
    }
}

impl VerificationConfig {
    /// Accept offers of any age; only the signature is checked.
    pub fn permissive() -> Self {
        Self {
            max_offer_age_secs: None,
        }
    }

    /// Reject offers older than `max_age_seconds`.
    pub fn with_max_age(max_age_seconds: u64) -> Self {
        Self {
            max_offer_age_secs: Some(max_age_seconds),
        }
    }
}

/// Verify a service offer.
///
/// Returns `SignatureInvalid` if the signature does not match the canonical
/// encoding of `data`, and `StaleOffer` if a freshness window is configured
/// and the timestamp falls outside it.
pub fn verify_offer(offer: &ServiceOffer, config: &VerificationConfig) -> Result<()> {
    let payload = to_canonical_bytes(&offer.data)?;

    if !verify_encoded(&payload, &offer.signature, &offer.pubkey) {
        return Err(Error::SignatureInvalid(format!(
            "signature does not match public key {}",
            offer.pubkey
        )));
    }

    if let Some(max_age) = config.max_offer_age_secs {
        validate_timestamp(&offer.data.timestamp, max_age, Utc::now())?;
    }

    Ok(())
}

/// Parse an offer timestamp. RFC 3339 is preferred; a bare ISO-8601 local
/// time without offset is read as UTC.
pub fn parse_timestamp(timestamp: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) {
        return Ok(parsed.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::StaleOffer(format!("Unparseable timestamp {:?}: {}", timestamp, e)))
}

fn validate_timestamp(timestamp: &str, max_age_secs: u64, now: DateTime<Utc>) -> Result<()> {
    let signed_at = parse_timestamp(timestamp)?;
    let age = now.signed_duration_since(signed_at).num_seconds();

    if age < -(CLOCK_SKEW_TOLERANCE_SECS as i64) {
        return Err(Error::StaleOffer(format!(
            "Offer timestamp is {} seconds in the future",
            -age
        )));
    }

    if age > max_age_secs as i64 {
        return Err(Error::StaleOffer(format!(
            "Offer is too old: age {} seconds exceeds maximum {} seconds",
            age, max_age_secs
        )));
    }

    Ok(())
}

/// A provider-side key that signs offers the way [`verify_offer`] expects.
#[derive(Clone)]
pub enum OfferSigner {
    Ed25519(ed25519_dalek::SigningKey),
    Secp256k1(k256::ecdsa::SigningKey),
}

impl OfferSigner {
    /// Generate a fresh random key.
    pub fn generate(scheme: SignatureScheme) -> Self {
        match scheme {
            SignatureScheme::Ed25519 => {
                OfferSigner::Ed25519(ed25519_dalek::SigningKey::generate(&mut OsRng))
            }
            SignatureScheme::Secp256k1 => {
                OfferSigner::Secp256k1(k256::ecdsa::SigningKey::random(&mut OsRng))
            }
        }
    }

    /// Load a key from its hex-encoded secret.
    pub fn from_secret_hex(scheme: SignatureScheme, secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim().trim_start_matches("0x"))
            .map_err(|e| Error::Malformed(format!("Secret key is not hex: {}", e)))?;

        match scheme {
            SignatureScheme::Ed25519 => {
                let bytes: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Malformed("Ed25519 secret key must be 32 bytes".to_string()))?;
                Ok(OfferSigner::Ed25519(ed25519_dalek::SigningKey::from_bytes(&bytes)))
            }
            SignatureScheme::Secp256k1 => k256::ecdsa::SigningKey::from_slice(&bytes)
                .map(OfferSigner::Secp256k1)
                .map_err(|e| Error::Malformed(format!("Invalid secp256k1 secret key: {}", e))),
        }
    }

    pub fn scheme(&self) -> SignatureScheme {
        match self {
            OfferSigner::Ed25519(_) => SignatureScheme::Ed25519,
            OfferSigner::Secp256k1(_) => SignatureScheme::Secp256k1,
        }
    }

    /// Hex-encoded secret key.
    pub fn secret_hex(&self) -> String {
        match self {
            OfferSigner::Ed25519(key) => hex::encode(key.to_bytes()),
            OfferSigner::Secp256k1(key) => hex::encode(key.to_bytes()),
        }
    }

    /// Raw public key bytes (compressed SEC1 for secp256k1).
    pub fn public_key_bytes(&self) -> Vec<u8> {
        match self {
            OfferSigner::Ed25519(key) => key.verifying_key().to_bytes().to_vec(),
            OfferSigner::Secp256k1(key) => key
                .verifying_key()
                .to_encoded_point(true)
                .as_bytes()
                .to_vec(),
        }
    }

    /// Base58-encoded public key, as carried in `ServiceOffer::pubkey`.
    pub fn public_key_base58(&self) -> String {
        bs58::encode(self.public_key_bytes()).into_string()
    }

    /// Sign raw bytes.
    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        match self {
            OfferSigner::Ed25519(key) => {
                use ed25519_dalek::Signer;
                key.sign(payload).to_bytes().to_vec()
            }
            OfferSigner::Secp256k1(key) => {
                use k256::ecdsa::signature::Signer;
                let signature: k256::ecdsa::Signature = key.sign(payload);
                signature.to_bytes().to_vec()
            }
        }
    }

    /// Sign offer data, producing the complete wire offer.
    pub fn sign_offer(&self, data: ServiceOfferData) -> Result<ServiceOffer> {
        let payload = to_canonical_bytes(&data)?;
        let signature = bs58::encode(self.sign(&payload)).into_string();

        Ok(ServiceOffer {
            data,
            signature,
            pubkey: self.public_key_base58(),
        })
    }
}

impl std::fmt::Debug for OfferSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfferSigner")
            .field("scheme", &self.scheme())
            .field("pubkey", &self.public_key_base58())
            .finish()
    }
}
