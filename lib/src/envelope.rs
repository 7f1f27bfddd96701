//! Detached signature envelope.
//!
//! The envelope is what ends up embedded in a container: the digest that
//! was signed, the raw signature, the signer's chain and an optional
//! timestamp token. Its serialized form is the opaque [`SignatureBlob`]
//! that crosses from the signing step to the write side.
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::{
    certs::CertificateChain,
    digest::{DigestAlgorithm, to_hex},
    error::{BackendStage, Error, Result, VerifyError},
};

pub const ENVELOPE_VERSION: u32 = 1;
pub const SIGNATURE_ALGORITHM_ED25519: &str = "ed25519";

/// Signed, timestamped bytes ready to embed. Never partially applied.
#[derive(Clone, PartialEq, Eq)]
pub struct SignatureBlob(Bytes);

impl SignatureBlob {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SignatureBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignatureBlob(len={})", self.0.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampToken {
    pub authority: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub digest_algorithm: DigestAlgorithm,
    #[serde(with = "hex_bytes")]
    pub digest: Vec<u8>,
    pub signature_algorithm: String,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    #[serde(with = "hex_list")]
    pub certificates: Vec<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<TimestampToken>,
}

impl Envelope {
    pub fn new(
        digest_algorithm: DigestAlgorithm,
        digest: Vec<u8>,
        signature: Vec<u8>,
        chain: &CertificateChain,
    ) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            digest_algorithm,
            digest,
            signature_algorithm: SIGNATURE_ALGORITHM_ED25519.to_owned(),
            signature,
            certificates: chain.der_certificates().to_vec(),
            timestamp: None,
        }
    }

    pub fn to_blob(&self) -> Result<SignatureBlob> {
        let json = serde_json::to_vec(self).map_err(encoding_failed)?;
        Ok(SignatureBlob::from_bytes(json))
    }

    /// Parse and structurally validate an embedded envelope.
    pub fn from_blob(blob: &[u8]) -> Result<Self, VerifyError> {
        let envelope: Envelope =
            serde_json::from_slice(blob).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(VerifyError::Malformed(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        if envelope.digest.len() != envelope.digest_algorithm.output_len() {
            return Err(VerifyError::Malformed(format!(
                "{} digest has length {}",
                envelope.digest_algorithm,
                envelope.digest.len()
            )));
        }
        if envelope.certificates.is_empty() {
            return Err(VerifyError::Malformed("no signer certificate".to_owned()));
        }
        Ok(envelope)
    }

    /// Check the signature against the leaf certificate. Digest comparison
    /// against the container is the caller's job.
    pub fn verify(&self) -> Result<VerifiedSignature, VerifyError> {
        if self.signature_algorithm != SIGNATURE_ALGORITHM_ED25519 {
            return Err(VerifyError::UnsupportedKey(self.signature_algorithm.clone()));
        }
        let chain = CertificateChain::from_der_certificates(self.certificates.clone())
            .map_err(|e| VerifyError::Malformed(e.to_string()))?;
        chain
            .check_issuer()
            .map_err(|e| VerifyError::BadSignature(e.to_string()))?;
        let key = chain
            .ed25519_public_key()
            .map_err(|e| VerifyError::UnsupportedKey(e.to_string()))?;
        let key = VerifyingKey::from_bytes(&key)
            .map_err(|e| VerifyError::UnsupportedKey(e.to_string()))?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|e| VerifyError::Malformed(format!("signature: {e}")))?;
        key.verify_strict(&self.digest, &signature).map_err(|_| {
            VerifyError::BadSignature(format!(
                "signature over {} does not match '{}'",
                to_hex(&self.digest),
                chain.subject()
            ))
        })?;

        Ok(VerifiedSignature {
            chain,
            digest_algorithm: self.digest_algorithm,
            digest: self.digest.clone(),
            timestamp: self.timestamp.clone(),
        })
    }
}

/// The envelope is built by the signing step, so failing to encode it is a
/// signing failure.
fn encoding_failed(err: serde_json::Error) -> Error {
    Error::backend(BackendStage::Signer, format!("encoding signature envelope: {err}"))
}

/// An envelope whose signature checked out against its own chain.
#[derive(Debug, Clone)]
pub struct VerifiedSignature {
    pub chain: CertificateChain,
    pub digest_algorithm: DigestAlgorithm,
    pub digest: Vec<u8>,
    pub timestamp: Option<TimestampToken>,
}

impl VerifiedSignature {
    pub fn certificate_der(&self) -> &[u8] {
        self.chain.leaf_der()
    }

    pub fn subject(&self) -> String {
        self.chain.subject()
    }

    pub fn signing_time(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_ref().map(|t| t.time)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&crate::digest::to_hex(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let hex = String::deserialize(deserializer)?;
        crate::digest::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

mod hex_list {
    use serde::{Deserialize, Deserializer, Serializer, ser::SerializeSeq};

    pub fn serialize<S: Serializer>(list: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(list.len()))?;
        for item in list {
            seq.serialize_element(&crate::digest::to_hex(item))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|hex| crate::digest::from_hex(hex).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer, SigningKey, pkcs8::DecodePrivateKey};

    use super::*;

    const CHAIN: &[u8] = include_bytes!("../../test_data/chain.p7b");
    const KEY: &str = include_str!("../../test_data/signer.key.pem");
    const OTHER_KEY: &str = include_str!("../../test_data/other.key.pem");

    fn envelope_signed_with(pem: &str) -> Envelope {
        let chain = CertificateChain::from_p7b(CHAIN).unwrap();
        let key = SigningKey::from_pkcs8_pem(pem).unwrap();
        let digest = vec![0x5a; 32];
        let signature = key.sign(&digest).to_bytes().to_vec();
        Envelope::new(DigestAlgorithm::Sha256, digest, signature, &chain)
    }

    #[test]
    fn test_blob_round_trip_verifies() {
        let envelope = envelope_signed_with(KEY);
        let blob = envelope.to_blob().unwrap();
        let parsed = Envelope::from_blob(blob.as_bytes()).unwrap();
        assert_eq!(parsed, envelope);
        let verified = parsed.verify().unwrap();
        assert_eq!(
            verified.certificate_der(),
            include_bytes!("../../test_data/signer.der")
        );
        assert_eq!(verified.digest_algorithm, DigestAlgorithm::Sha256);
    }

    #[test]
    fn test_wrong_key_fails_signature_check() {
        let envelope = envelope_signed_with(OTHER_KEY);
        assert!(matches!(envelope.verify(), Err(VerifyError::BadSignature(_))));
    }

    #[test]
    fn test_malformed_blobs() {
        assert!(matches!(
            Envelope::from_blob(b"{\"version\":1}"),
            Err(VerifyError::Malformed(_))
        ));

        let mut envelope = envelope_signed_with(KEY);
        envelope.digest.truncate(10);
        let blob = envelope.to_blob().unwrap();
        assert!(matches!(
            Envelope::from_blob(blob.as_bytes()),
            Err(VerifyError::Malformed(_))
        ));
    }

    #[test]
    fn test_encoding_failure_is_a_signing_failure() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        assert_eq!(encoding_failed(err).stage(), "sign");
    }
}
