//! End to end sign and verify over a file path.
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    digest::{DigestAlgorithm, to_hex},
    envelope::Envelope,
    error::Result,
    options::VerifyOptions,
    pipeline::PipelineConfig,
    registry::{Registry, SignerDescriptor},
    sign::SigningBackend,
    timestamp::Timestamper,
    verify::VerificationResult,
};

pub struct SignRequest {
    pub path: PathBuf,
    /// Where the signed container goes. Defaults to `path`.
    pub output: Option<PathBuf>,
    /// Format name or alias. Detected from the file when `None`.
    pub format: Option<String>,
    pub digest: DigestAlgorithm,
    pub flags: Vec<(String, Option<String>)>,
    pub pipeline: PipelineConfig,
    pub backend: Arc<dyn SigningBackend>,
    pub timestamper: Arc<dyn Timestamper>,
}

impl SignRequest {
    pub fn new(
        path: impl Into<PathBuf>,
        backend: Arc<dyn SigningBackend>,
        timestamper: Arc<dyn Timestamper>,
    ) -> Self {
        Self {
            path: path.into(),
            output: None,
            format: None,
            digest: DigestAlgorithm::default(),
            flags: Vec::new(),
            pipeline: PipelineConfig::default(),
            backend,
            timestamper,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignOutcome {
    pub format: &'static str,
    pub digest_algorithm: DigestAlgorithm,
    pub digest: Vec<u8>,
    pub destination: PathBuf,
}

fn select<'r>(
    registry: &'r Registry,
    path: &Path,
    format: Option<&str>,
) -> Result<&'r SignerDescriptor> {
    match format {
        Some(name) => registry.lookup(name),
        None => registry.detect(path),
    }
}

/// Transform, sign and apply. The file at `request.path` is either left
/// untouched or replaced by a fully signed copy.
pub async fn sign_file(registry: &Registry, request: &SignRequest) -> Result<SignOutcome> {
    let descriptor = select(registry, &request.path, request.format.as_deref())?;
    let options = descriptor.sign_options(
        request.digest,
        request
            .flags
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_deref())),
    )?;
    descriptor.check_backend(request.backend.as_ref())?;

    let mut transformer = descriptor.transform(&request.path, &options, request.pipeline)?;
    let blob = transformer
        .sign(request.backend.as_ref(), request.timestamper.as_ref())
        .await?;
    let destination = request.output.as_deref().unwrap_or(&request.path);
    transformer.apply(Some(destination), &blob)?;

    let envelope = Envelope::from_blob(blob.as_bytes())?;
    log::info!(
        "signed {} as {} ({} {})",
        destination.display(),
        descriptor.name,
        envelope.digest_algorithm,
        to_hex(&envelope.digest)
    );
    Ok(SignOutcome {
        format: descriptor.name,
        digest_algorithm: envelope.digest_algorithm,
        digest: envelope.digest,
        destination: destination.to_path_buf(),
    })
}

pub fn verify_file(
    registry: &Registry,
    path: &Path,
    options: &VerifyOptions,
) -> Result<VerificationResult> {
    registry.detect(path)?.verify(path, options)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{error::Error, sign::tests::test_signer, timestamp::NoTimestamp};

    #[tokio::test]
    async fn test_unknown_file_is_not_touched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, b"plain text").unwrap();
        let registry = Registry::with_builtin().unwrap();
        let request = SignRequest::new(&path, Arc::new(test_signer()), Arc::new(NoTimestamp));

        let err = sign_file(&registry, &request).await.unwrap_err();
        assert!(matches!(err, Error::Registry(_)));
        assert!(verify_file(&registry, &path, &VerifyOptions::default()).is_err());
        assert_eq!(fs::read(&path).unwrap(), b"plain text");
    }

    #[tokio::test]
    async fn test_bad_flag_rejected_before_opening() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::with_builtin().unwrap();
        let mut request = SignRequest::new(
            dir.path().join("missing.msi"),
            Arc::new(test_signer()),
            Arc::new(NoTimestamp),
        );
        request.format = Some("msi".to_owned());
        request.flags = vec![("bogus".to_owned(), None)];

        let err = sign_file(&registry, &request).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
