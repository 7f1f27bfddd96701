//! The transform handle: one open container, one canonical read side, one
//! signature write side.
//!
//! ```text
//! Created --reader()--> Streaming --apply() ok--> Applied
//!    |                      |
//!    +-------- failure -----+--------------------> Failed
//! ```
//!
//! `Applied` and `Failed` are terminal. A failed transformer is never
//! reused; a retry needs a fresh transform of the original file.
use std::{
    fmt,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    atomic::AtomicRewriter,
    certs::CertType,
    envelope::SignatureBlob,
    error::{ApplyStage, Error, Result},
    options::SignOptions,
    pipeline::{self, CanonicalStream, PipelineConfig, Producer, spawn_producer},
    registry::{SignerDescriptor, SignerFormat, check_cert_type},
    sign::SigningBackend,
    timestamp::Timestamper,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformState {
    Created,
    Streaming,
    Applied,
    Failed,
}

impl TransformState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransformState::Applied | TransformState::Failed)
    }
}

impl fmt::Display for TransformState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformState::Created => f.write_str("created"),
            TransformState::Streaming => f.write_str("streaming"),
            TransformState::Applied => f.write_str("applied"),
            TransformState::Failed => f.write_str("failed"),
        }
    }
}

/// Serialises a parsed container into canonical bytes. Runs on the
/// producer thread and owns the parsed structure while it does.
pub trait Canonicalize: Send {
    fn write_canonical(self: Box<Self>, out: &mut dyn Write) -> Result<()>;
}

/// Format-specific half of a transformer, produced by a format's
/// transform step.
pub trait TransformSession: Send {
    /// Hand the parsed structure to the canonical producer. Called once.
    fn canonicalizer(&mut self) -> Result<Box<dyn Canonicalize>>;

    /// Embed `blob` (and any snapshotted extended digest) into the staged
    /// copy of the container.
    fn embed(&mut self, staged: &mut File, blob: &SignatureBlob) -> Result<()>;
}

pub struct Transformer {
    name: &'static str,
    format: Arc<dyn SignerFormat>,
    cert_types: &'static [CertType],
    options: SignOptions,
    source: PathBuf,
    container: Option<File>,
    session: Option<Box<dyn TransformSession>>,
    state: TransformState,
    pipeline: PipelineConfig,
    producer: Option<Producer>,
}

impl Transformer {
    pub(crate) fn open(
        descriptor: &SignerDescriptor,
        path: &Path,
        options: &SignOptions,
        pipeline: PipelineConfig,
    ) -> Result<Self> {
        let container = OpenOptions::new().read(true).write(true).open(path)?;
        let parsed = File::open(path)?;
        let session = descriptor.format.transform(parsed, options)?;
        log::debug!(
            "opened {} for {} transform with {}",
            path.display(),
            descriptor.name,
            options.digest
        );
        Ok(Self {
            name: descriptor.name,
            format: descriptor.format.clone(),
            cert_types: descriptor.cert_types,
            options: options.clone(),
            source: path.to_path_buf(),
            container: Some(container),
            session: Some(session),
            state: TransformState::Created,
            pipeline,
            producer: None,
        })
    }

    pub fn state(&self) -> TransformState {
        self.state
    }

    /// Name of the format this transformer was opened for.
    pub fn format(&self) -> &'static str {
        self.name
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    fn require(&self, allowed: &[TransformState], operation: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::State {
                operation,
                state: self.state,
            })
        }
    }

    /// Start the background canonicalizer and return its stream together
    /// with the stream length, which is never known up front.
    ///
    /// Needs a tokio runtime for the producer. Without one this fails with
    /// [`Error::Configuration`] and the transformer stays `Created`.
    pub fn reader(&mut self) -> Result<(CanonicalStream, Option<u64>)> {
        self.require(&[TransformState::Created], "reading the canonical stream")?;
        let runtime = pipeline::current_runtime()?;
        let canonicalizer = match self.session.as_mut() {
            Some(session) => session.canonicalizer(),
            None => Err(Error::State {
                operation: "reading the canonical stream",
                state: self.state,
            }),
        };
        let canonicalizer = match canonicalizer {
            Ok(c) => c,
            Err(err) => {
                self.fail();
                return Err(err);
            }
        };
        let (stream, producer) = spawn_producer(&runtime, self.pipeline, move |out| {
            canonicalizer.write_canonical(out)
        });
        self.producer = Some(producer);
        self.state = TransformState::Streaming;
        log::debug!("{} canonical stream started for {}", self.name, self.source.display());
        Ok((stream, None))
    }

    /// Stream the canonical form through this format's sign step. Any
    /// failure, from the producer or the backend, leaves the transformer
    /// `Failed`.
    pub async fn sign(
        &mut self,
        backend: &dyn SigningBackend,
        timestamper: &dyn Timestamper,
    ) -> Result<SignatureBlob> {
        if let Err(err) = check_cert_type(self.name, self.cert_types, backend) {
            self.fail();
            return Err(err);
        }
        let (stream, _) = self.reader()?;
        let format = self.format.clone();
        let result = format
            .sign(stream, backend, timestamper, &self.options)
            .await;
        if let Err(err) = &result {
            log::warn!("{} signing of {} failed: {err}", self.name, self.source.display());
            self.fail();
        }
        result
    }

    /// Embed `blob` and atomically publish the result at `dest` (the source
    /// path when `None`). Valid exactly once, and never after the canonical
    /// producer has failed.
    pub fn apply(&mut self, dest: Option<&Path>, blob: &SignatureBlob) -> Result<()> {
        if self.producer.as_ref().is_some_and(Producer::has_failed) {
            log::warn!(
                "refusing to apply {} signature: canonical stream of {} failed",
                self.name,
                self.source.display()
            );
            self.fail();
        }
        self.require(
            &[TransformState::Created, TransformState::Streaming],
            "applying a signature",
        )?;
        let dest = dest.unwrap_or(self.source.as_path()).to_path_buf();
        let result = self.apply_staged(&dest, blob);
        self.release();
        match &result {
            Ok(()) => {
                self.state = TransformState::Applied;
                log::info!("embedded {} signature into {}", self.name, dest.display());
            }
            Err(err) => {
                self.state = TransformState::Failed;
                log::warn!(
                    "{} signature not applied to {}: {err}",
                    self.name,
                    dest.display()
                );
            }
        }
        result
    }

    fn apply_staged(&mut self, dest: &Path, blob: &SignatureBlob) -> Result<()> {
        let (Some(container), Some(session)) = (self.container.as_mut(), self.session.as_mut())
        else {
            return Err(Error::State {
                operation: "applying a signature",
                state: self.state,
            });
        };
        let mut rewriter = AtomicRewriter::write_in_place(container, dest)?;
        session
            .embed(rewriter.file()?, blob)
            .map_err(|err| match err {
                Error::Apply { .. } => err,
                other => Error::apply(ApplyStage::Embed, other),
            })?;
        rewriter.commit()
    }

    fn fail(&mut self) {
        self.state = TransformState::Failed;
        self.release();
    }

    /// Close the container and the write side. The producer keeps its own
    /// copy of the parsed structure and exits once its stream is drained or
    /// dropped.
    fn release(&mut self) {
        self.session = None;
        self.container = None;
    }
}

impl fmt::Debug for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformer")
            .field("format", &self.name)
            .field("source", &self.source)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        io::{Read, Seek, SeekFrom},
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{
        digest::DigestAlgorithm,
        magic::FileType,
        options::{FlagSchema, VerifyOptions},
        timestamp::NoTimestamp,
        verify::SignatureRecord,
    };

    /// Treats the whole file as canonical bytes and appends the blob. A
    /// broken one fails after six bytes.
    struct RawFormat {
        embeds: Arc<AtomicUsize>,
        broken: bool,
    }

    struct RawSession {
        source: Option<File>,
        embeds: Arc<AtomicUsize>,
        broken: bool,
    }

    struct RawCanonicalizer {
        source: File,
        broken: bool,
    }

    impl Canonicalize for RawCanonicalizer {
        fn write_canonical(mut self: Box<Self>, out: &mut dyn Write) -> Result<()> {
            if self.broken {
                let mut head = [0u8; 6];
                self.source.read_exact(&mut head)?;
                out.write_all(&head)?;
                return Err(Error::Stream("source truncated".to_owned()));
            }
            std::io::copy(&mut self.source, out)?;
            Ok(())
        }
    }

    impl TransformSession for RawSession {
        fn canonicalizer(&mut self) -> Result<Box<dyn Canonicalize>> {
            let file = self
                .source
                .take()
                .ok_or_else(|| Error::format("already streamed"))?;
            Ok(Box::new(RawCanonicalizer {
                source: file,
                broken: self.broken,
            }))
        }

        fn embed(&mut self, staged: &mut File, blob: &SignatureBlob) -> Result<()> {
            self.embeds.fetch_add(1, Ordering::SeqCst);
            staged.seek(SeekFrom::End(0))?;
            staged.write_all(blob.as_bytes())?;
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl SignerFormat for RawFormat {
        fn transform(&self, source: File, _options: &SignOptions) -> Result<Box<dyn TransformSession>> {
            Ok(Box::new(RawSession {
                source: Some(source),
                embeds: self.embeds.clone(),
                broken: self.broken,
            }))
        }

        async fn sign(
            &self,
            stream: CanonicalStream,
            _backend: &dyn SigningBackend,
            _timestamper: &dyn Timestamper,
            _options: &SignOptions,
        ) -> Result<SignatureBlob> {
            stream.collect_bytes().await?;
            Ok(SignatureBlob::from_bytes(&b"SIG"[..]))
        }

        fn verify(&self, _source: File, _options: &VerifyOptions) -> Result<Vec<SignatureRecord>> {
            Ok(Vec::new())
        }
    }

    fn raw_descriptor(embeds: Arc<AtomicUsize>) -> SignerDescriptor {
        descriptor(RawFormat {
            embeds,
            broken: false,
        })
    }

    fn broken_descriptor(embeds: Arc<AtomicUsize>) -> SignerDescriptor {
        descriptor(RawFormat {
            embeds,
            broken: true,
        })
    }

    fn descriptor(format: RawFormat) -> SignerDescriptor {
        SignerDescriptor {
            name: "raw",
            aliases: &[],
            magic: FileType::Unknown,
            cert_types: &[CertType::X509],
            flags: FlagSchema::new(),
            format: Arc::new(format),
        }
    }

    fn artifact(dir: &Path) -> PathBuf {
        let path = dir.join("artifact.bin");
        fs::write(&path, b"original payload").unwrap();
        path
    }

    fn options() -> SignOptions {
        SignOptions::new(DigestAlgorithm::Sha256, Default::default())
    }

    #[tokio::test]
    async fn test_lifecycle_and_single_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        fs::write(&path, b"payload").unwrap();
        let embeds = Arc::new(AtomicUsize::new(0));
        let descriptor = raw_descriptor(embeds.clone());

        let mut transformer =
            Transformer::open(&descriptor, &path, &options(), PipelineConfig::default()).unwrap();
        assert_eq!(transformer.state(), TransformState::Created);

        assert_eq!(transformer.format(), "raw");
        assert_eq!(transformer.source(), path);

        let (stream, len) = transformer.reader().unwrap();
        assert_eq!(len, None);
        assert_eq!(transformer.state(), TransformState::Streaming);
        assert_eq!(stream.collect_bytes().await.unwrap(), b"payload");

        let again = transformer.reader().unwrap_err();
        assert!(matches!(again, Error::State { .. }));

        let blob = SignatureBlob::from_bytes(&b"SIG"[..]);
        transformer.apply(None, &blob).unwrap();
        assert_eq!(transformer.state(), TransformState::Applied);
        let signed = fs::read(&path).unwrap();
        assert_eq!(signed, b"payloadSIG");

        let err = transformer.apply(None, &blob).unwrap_err();
        assert!(matches!(
            err,
            Error::State {
                state: TransformState::Applied,
                ..
            }
        ));
        assert_eq!(fs::read(&path).unwrap(), signed);
        assert_eq!(embeds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_apply_is_terminal_and_preserves_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        fs::write(&path, b"payload").unwrap();
        let blocked = dir.path().join("blocked");
        fs::create_dir(&blocked).unwrap();
        fs::write(blocked.join("keep"), b"x").unwrap();
        let descriptor = raw_descriptor(Arc::new(AtomicUsize::new(0)));

        let mut transformer =
            Transformer::open(&descriptor, &path, &options(), PipelineConfig::default()).unwrap();
        let blob = SignatureBlob::from_bytes(&b"SIG"[..]);
        let err = transformer.apply(Some(&blocked), &blob).unwrap_err();
        assert!(err.is_rolled_back());
        assert_eq!(transformer.state(), TransformState::Failed);
        assert!(transformer.state().is_terminal());

        let mut original = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut original).unwrap();
        assert_eq!(original, b"payload");

        let retry = transformer.apply(None, &blob).unwrap_err();
        assert!(matches!(
            retry,
            Error::State {
                state: TransformState::Failed,
                ..
            }
        ));
        assert_eq!(fs::read(&path).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_stream_failure_blocks_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(dir.path());
        let embeds = Arc::new(AtomicUsize::new(0));
        let descriptor = broken_descriptor(embeds.clone());
        let pipeline = PipelineConfig {
            capacity: 1,
            chunk_size: 4,
        };

        let mut transformer = Transformer::open(&descriptor, &path, &options(), pipeline).unwrap();
        let (stream, _) = transformer.reader().unwrap();
        let err = stream.collect_bytes().await.unwrap_err();
        assert_eq!(err.stage(), "stream");

        let blob = SignatureBlob::from_bytes(&b"SIG"[..]);
        let err = transformer.apply(None, &blob).unwrap_err();
        assert!(matches!(
            err,
            Error::State {
                state: TransformState::Failed,
                ..
            }
        ));
        assert_eq!(transformer.state(), TransformState::Failed);
        assert_eq!(embeds.load(Ordering::SeqCst), 0);
        assert_eq!(fs::read(&path).unwrap(), b"original payload");
    }

    #[tokio::test]
    async fn test_failed_sign_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(dir.path());
        let descriptor = broken_descriptor(Arc::new(AtomicUsize::new(0)));
        let signer = crate::sign::tests::test_signer();

        let mut transformer =
            Transformer::open(&descriptor, &path, &options(), PipelineConfig::default()).unwrap();
        let err = transformer
            .sign(&signer, &NoTimestamp)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "stream");
        assert_eq!(transformer.state(), TransformState::Failed);

        let retry = transformer
            .sign(&signer, &NoTimestamp)
            .await
            .unwrap_err();
        assert!(matches!(retry, Error::State { .. }));
        assert_eq!(fs::read(&path).unwrap(), b"original payload");
    }

    #[test]
    fn test_reader_without_runtime_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(dir.path());
        let descriptor = raw_descriptor(Arc::new(AtomicUsize::new(0)));

        let mut transformer =
            Transformer::open(&descriptor, &path, &options(), PipelineConfig::default()).unwrap();
        let err = transformer.reader().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(transformer.state(), TransformState::Created);
    }
}
