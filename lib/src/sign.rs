use std::path::Path;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey, pkcs8::DecodePrivateKey};

use crate::{
    certs::{CertType, CertificateChain},
    digest::{DigestAlgorithm, to_hex},
    envelope::{Envelope, SignatureBlob},
    error::{BackendStage, Error, Result},
    timestamp::Timestamper,
};

/// Something that can sign a digest on our behalf: a local key, an HSM, a
/// remote signing service. Only the digest crosses this boundary, never the
/// container bytes.
#[async_trait]
pub trait SigningBackend: Send + Sync {
    async fn sign(&self, digest: &[u8], algorithm: DigestAlgorithm) -> Result<Vec<u8>>;

    fn chain(&self) -> &CertificateChain;

    fn cert_type(&self) -> CertType {
        CertType::X509
    }

    fn description(&self) -> &'static str;
}

/// Ed25519 key held in process, paired with its certificate chain.
pub struct LocalSigner {
    key: SigningKey,
    chain: CertificateChain,
}

impl LocalSigner {
    pub fn new(key: SigningKey, chain: CertificateChain) -> Result<Self> {
        let leaf_key = chain.ed25519_public_key()?;
        if key.verifying_key().to_bytes() != leaf_key {
            return Err(Error::Configuration(format!(
                "signing key does not match certificate '{}'",
                chain.subject()
            )));
        }
        Ok(Self { key, chain })
    }

    pub fn from_pem(pem: &str, chain: CertificateChain) -> Result<Self> {
        let key = SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| Error::Configuration(format!("failed to parse PKCS#8 key: {e}")))?;
        Self::new(key, chain)
    }

    pub fn load(key_path: &Path, chain_path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(key_path)?;
        let chain = CertificateChain::load(chain_path)?;
        let signer = Self::from_pem(&pem, chain)?;
        log::info!("loaded signing key from {}", key_path.display());
        Ok(signer)
    }
}

#[async_trait]
impl SigningBackend for LocalSigner {
    async fn sign(&self, digest: &[u8], algorithm: DigestAlgorithm) -> Result<Vec<u8>> {
        if digest.len() != algorithm.output_len() {
            return Err(Error::backend(
                BackendStage::Signer,
                format!("{algorithm} digest has length {}", digest.len()),
            ));
        }
        Ok(self.key.sign(digest).to_bytes().to_vec())
    }

    fn chain(&self) -> &CertificateChain {
        &self.chain
    }

    fn description(&self) -> &'static str {
        "local Ed25519 key"
    }
}

/// Have `digest` signed by the backend and wrap the result in a
/// timestamped envelope.
pub async fn sign_digest(
    digest: Vec<u8>,
    algorithm: DigestAlgorithm,
    backend: &dyn SigningBackend,
    timestamper: &dyn Timestamper,
) -> Result<SignatureBlob> {
    log::debug!(
        "requesting {algorithm} signature over {} from {}",
        to_hex(&digest),
        backend.description()
    );
    let signature = backend
        .sign(&digest, algorithm)
        .await
        .map_err(|e| backend_error(BackendStage::Signer, e))?;
    let mut envelope = Envelope::new(algorithm, digest, signature, backend.chain());
    envelope.timestamp = timestamper
        .timestamp(&envelope.signature, backend.chain())
        .await
        .map_err(|e| backend_error(BackendStage::Timestamp, e))?;
    envelope.to_blob()
}

fn backend_error(stage: BackendStage, err: Error) -> Error {
    match err {
        Error::SignBackend { .. } => err,
        other => Error::backend(stage, other),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::timestamp::{ClockTimestamper, NoTimestamp};

    pub(crate) const CHAIN: &[u8] = include_bytes!("../../test_data/chain.p7b");
    pub(crate) const KEY: &str = include_str!("../../test_data/signer.key.pem");
    const OTHER_KEY: &str = include_str!("../../test_data/other.key.pem");

    pub(crate) fn test_signer() -> LocalSigner {
        LocalSigner::from_pem(KEY, CertificateChain::from_p7b(CHAIN).unwrap()).unwrap()
    }

    struct Unreachable(CertificateChain);

    #[async_trait]
    impl SigningBackend for Unreachable {
        async fn sign(&self, _digest: &[u8], _algorithm: DigestAlgorithm) -> Result<Vec<u8>> {
            Err(Error::Io(std::io::Error::other("connection refused")))
        }

        fn chain(&self) -> &CertificateChain {
            &self.0
        }

        fn description(&self) -> &'static str {
            "unreachable"
        }
    }

    #[test]
    fn test_mismatched_key_rejected() {
        let chain = CertificateChain::from_p7b(CHAIN).unwrap();
        let err = LocalSigner::from_pem(OTHER_KEY, chain).err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_sign_digest_produces_verifiable_envelope() {
        let signer = test_signer();
        let digest = DigestAlgorithm::Sha384.hasher().finalize();
        let blob = sign_digest(
            digest.clone(),
            DigestAlgorithm::Sha384,
            &signer,
            &ClockTimestamper::default(),
        )
        .await
        .unwrap();
        let envelope = Envelope::from_blob(blob.as_bytes()).unwrap();
        assert_eq!(envelope.digest, digest);
        assert!(envelope.timestamp.is_some());
        envelope.verify().unwrap();
    }

    #[tokio::test]
    async fn test_backend_failure_is_tagged() {
        let backend = Unreachable(CertificateChain::from_p7b(CHAIN).unwrap());
        let err = sign_digest(vec![0; 32], DigestAlgorithm::Sha256, &backend, &NoTimestamp)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::SignBackend {
                stage: BackendStage::Signer,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_wrong_digest_length_rejected() {
        let err = test_signer()
            .sign(&[0; 20], DigestAlgorithm::Sha256)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "sign");
    }
}
