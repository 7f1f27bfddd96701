//! Format descriptors and the registry that selects them.
//!
//! The registry is an ordinary value built at startup and handed to the
//! call sites that need it; registration order is whatever the caller does.
use std::{fs::File, path::Path, sync::Arc};

use async_trait::async_trait;

use crate::{
    certs::CertType,
    digest::DigestAlgorithm,
    envelope::SignatureBlob,
    error::{Error, Result},
    formats,
    magic::{self, FileType},
    options::{FlagSchema, SignOptions, VerifyOptions},
    pipeline::{CanonicalStream, PipelineConfig},
    sign::SigningBackend,
    timestamp::Timestamper,
    transform::{TransformSession, Transformer},
    verify::{SignatureRecord, VerificationResult},
};

/// The three protocol entry points a container format implements.
#[async_trait]
pub trait SignerFormat: Send + Sync {
    /// Parse `source` and snapshot anything the signature will need. Must
    /// not modify the file.
    fn transform(&self, source: File, options: &SignOptions) -> Result<Box<dyn TransformSession>>;

    /// Digest a canonical stream and have the digest signed and stamped.
    async fn sign(
        &self,
        stream: CanonicalStream,
        backend: &dyn SigningBackend,
        timestamper: &dyn Timestamper,
        options: &SignOptions,
    ) -> Result<SignatureBlob>;

    fn verify(&self, source: File, options: &VerifyOptions) -> Result<Vec<SignatureRecord>>;
}

pub struct SignerDescriptor {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub magic: FileType,
    pub cert_types: &'static [CertType],
    pub flags: FlagSchema,
    pub format: Arc<dyn SignerFormat>,
}

impl SignerDescriptor {
    fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        std::iter::once(self.name).chain(self.aliases.iter().copied())
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.names().any(|n| n.eq_ignore_ascii_case(name))
    }

    pub fn accepts(&self, cert_type: CertType) -> bool {
        self.cert_types.contains(&cert_type)
    }

    /// Validate raw flags against this descriptor's schema.
    pub fn sign_options<I, K, V>(&self, digest: DigestAlgorithm, flags: I) -> Result<SignOptions>
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Ok(SignOptions::new(digest, self.flags.resolve(flags)?))
    }

    /// Fails with a configuration error when this format cannot embed the
    /// backend's certificate type.
    pub fn check_backend(&self, backend: &dyn SigningBackend) -> Result<()> {
        check_cert_type(self.name, self.cert_types, backend)
    }

    pub fn transform(
        &self,
        path: &Path,
        options: &SignOptions,
        pipeline: PipelineConfig,
    ) -> Result<Transformer> {
        Transformer::open(self, path, options, pipeline)
    }

    pub async fn sign(
        &self,
        stream: CanonicalStream,
        backend: &dyn SigningBackend,
        timestamper: &dyn Timestamper,
        options: &SignOptions,
    ) -> Result<SignatureBlob> {
        self.check_backend(backend)?;
        self.format
            .sign(stream, backend, timestamper, options)
            .await
    }

    pub fn verify(&self, path: &Path, options: &VerifyOptions) -> Result<VerificationResult> {
        let file = File::open(path)?;
        let signatures = self.format.verify(file, options)?;
        log::info!(
            "verified {} {} signature(s) in {}",
            signatures.len(),
            self.name,
            path.display()
        );
        Ok(VerificationResult {
            format: self.name,
            signatures,
        })
    }
}

pub(crate) fn check_cert_type(
    format: &str,
    accepted: &[CertType],
    backend: &dyn SigningBackend,
) -> Result<()> {
    if accepted.contains(&backend.cert_type()) {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "{format} signing does not accept {} certificates",
            backend.cert_type()
        )))
    }
}

impl std::fmt::Debug for SignerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerDescriptor")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("magic", &self.magic)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    descriptors: Vec<SignerDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every format this crate ships.
    pub fn with_builtin() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(formats::msi::descriptor())?;
        Ok(registry)
    }

    pub fn register(&mut self, descriptor: SignerDescriptor) -> Result<()> {
        let mut own: Vec<&str> = Vec::new();
        for name in descriptor.names() {
            if own.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                return Err(Error::Registry(format!(
                    "{} lists the name '{name}' twice",
                    descriptor.name
                )));
            }
            own.push(name);
            if let Some(existing) = self.descriptors.iter().find(|d| d.matches_name(name)) {
                return Err(Error::Registry(format!(
                    "'{name}' is already registered by {}",
                    existing.name
                )));
            }
        }
        let mut seen = Vec::new();
        for spec in descriptor.flags.specs() {
            if seen.contains(&spec.name) {
                return Err(Error::Registry(format!(
                    "{} declares flag '{}' twice",
                    descriptor.name, spec.name
                )));
            }
            seen.push(spec.name);
        }
        log::debug!("registered {} signer", descriptor.name);
        self.descriptors.push(descriptor);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&SignerDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.matches_name(name))
            .ok_or_else(|| Error::Registry(format!("no signer named '{name}'")))
    }

    pub fn by_magic(&self, file_type: FileType) -> Result<&SignerDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.magic == file_type && file_type != FileType::Unknown)
            .ok_or_else(|| Error::Registry(format!("no signer for {file_type} files")))
    }

    pub fn detect(&self, path: &Path) -> Result<&SignerDescriptor> {
        let file_type = magic::detect_path(path)?;
        log::debug!("{} detected as {file_type}", path.display());
        self.by_magic(file_type)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &SignerDescriptor> {
        self.descriptors.iter()
    }
}
