//! Windows Installer packages.
//!
//! An MSI is a compound document. The signature lives in two root streams:
//! `\u{5}DigitalSignature` holds the envelope and the optional
//! `\u{5}MsiDigitalSignatureEx` holds a digest of the directory metadata,
//! which is also mixed into the signed digest.
mod canonical;

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::Arc,
};

use async_trait::async_trait;
use cfb::CompoundFile;
use futures::StreamExt;

use crate::{
    certs::CertType,
    digest::DigestAlgorithm,
    envelope::{Envelope, SignatureBlob},
    error::{ApplyStage, Error, Result, VerifyError},
    magic::FileType,
    options::{FlagSchema, FlagSpec, Flags, SignOptions, VerifyOptions},
    pipeline::CanonicalStream,
    registry::{SignerDescriptor, SignerFormat},
    sign::{SigningBackend, sign_digest},
    timestamp::Timestamper,
    transform::{Canonicalize, TransformSession},
    verify::SignatureRecord,
};

pub use canonical::{DIGITAL_SIGNATURE, MSI_DIGITAL_SIGNATURE_EX};
use canonical::FrameDigester;

pub const NAME: &str = "msi";
pub const NO_EXTENDED_SIG: &str = "no-extended-sig";

pub fn descriptor() -> SignerDescriptor {
    SignerDescriptor {
        name: NAME,
        aliases: &["msi-tar"],
        magic: FileType::Msi,
        cert_types: &[CertType::X509],
        flags: FlagSchema::new().with(FlagSpec::bool(
            NO_EXTENDED_SIG,
            false,
            "(MSI) Don't emit a MsiDigitalSignatureEx digest",
        )),
        format: Arc::new(MsiFormat),
    }
}

#[derive(Debug, Clone, Copy)]
struct MsiOptions {
    extended: bool,
}

impl MsiOptions {
    fn from_flags(flags: &Flags) -> Result<Self> {
        Ok(Self {
            extended: !flags.get_bool(NO_EXTENDED_SIG)?,
        })
    }
}

fn root_path(name: &str) -> String {
    format!("/{name}")
}

fn open_cdf<F: Read + Seek>(source: F) -> Result<CompoundFile<F>> {
    CompoundFile::open(source).map_err(|e| Error::format(format!("not a compound document: {e}")))
}

fn corrupt_directory(err: io::Error) -> Error {
    Error::format(format!("unreadable storage directory: {err}"))
}

fn read_root_stream<F: Read + Seek>(cdf: &mut CompoundFile<F>, name: &str) -> Result<Option<Vec<u8>>> {
    let path = root_path(name);
    if !cdf.is_stream(&path) {
        return Ok(None);
    }
    let mut data = Vec::new();
    cdf.open_stream(&path)?.read_to_end(&mut data)?;
    Ok(Some(data))
}

#[derive(Debug, Default)]
pub struct MsiFormat;

#[async_trait]
impl SignerFormat for MsiFormat {
    fn transform(&self, source: File, options: &SignOptions) -> Result<Box<dyn TransformSession>> {
        let msi = MsiOptions::from_flags(&options.flags)?;
        let cdf = open_cdf(source)?;
        let exsig = if msi.extended {
            Some(canonical::prehash(&cdf, options.digest).map_err(corrupt_directory)?)
        } else {
            None
        };
        Ok(Box::new(MsiSession {
            cdf: Some(cdf),
            exsig,
        }))
    }

    async fn sign(
        &self,
        mut stream: CanonicalStream,
        backend: &dyn SigningBackend,
        timestamper: &dyn Timestamper,
        options: &SignOptions,
    ) -> Result<SignatureBlob> {
        let msi = MsiOptions::from_flags(&options.flags)?;
        let mut digester = FrameDigester::new(options.digest, msi.extended);
        while let Some(chunk) = stream.next().await {
            digester.update(&chunk?)?;
        }
        let digest = digester.finish()?;
        sign_digest(digest.digest, options.digest, backend, timestamper).await
    }

    fn verify(&self, source: File, options: &VerifyOptions) -> Result<Vec<SignatureRecord>> {
        let mut cdf = open_cdf(source)?;
        let blob = read_root_stream(&mut cdf, DIGITAL_SIGNATURE)?.ok_or(VerifyError::Missing)?;
        let envelope = Envelope::from_blob(&blob)?;
        let signature = envelope.verify()?;
        let algorithm = envelope.digest_algorithm;

        if options.no_digests {
            log::debug!("skipping {NAME} digest recomputation");
        } else {
            let exsig = read_root_stream(&mut cdf, MSI_DIGITAL_SIGNATURE_EX)?;
            if let Some(embedded) = &exsig {
                check_prehash(&cdf, algorithm, embedded)?;
            }
            let mut digester = FrameDigester::new(algorithm, exsig.is_some());
            canonical::write_canonical(&mut cdf, exsig.as_deref(), &mut digester)?;
            let computed = digester.finish()?.digest;
            if computed != envelope.digest {
                return Err(VerifyError::DigestMismatch {
                    signed: crate::digest::to_hex(&envelope.digest),
                    computed: crate::digest::to_hex(&computed),
                }
                .into());
            }
        }

        Ok(vec![SignatureRecord {
            hash: algorithm,
            signature,
        }])
    }
}

fn check_prehash<F: Read + Seek>(
    cdf: &CompoundFile<F>,
    algorithm: DigestAlgorithm,
    embedded: &[u8],
) -> Result<()> {
    if embedded.len() != algorithm.output_len() {
        return Err(VerifyError::Malformed(format!(
            "MsiDigitalSignatureEx holds {} bytes, {algorithm} needs {}",
            embedded.len(),
            algorithm.output_len()
        ))
        .into());
    }
    let computed = canonical::prehash(cdf, algorithm)?;
    if computed != embedded {
        return Err(VerifyError::ExtendedDigestMismatch {
            embedded: crate::digest::to_hex(embedded),
            computed: crate::digest::to_hex(&computed),
        }
        .into());
    }
    Ok(())
}

struct MsiSession {
    cdf: Option<CompoundFile<File>>,
    exsig: Option<Vec<u8>>,
}

struct MsiCanonicalizer {
    cdf: CompoundFile<File>,
    prehash: Option<Vec<u8>>,
}

impl Canonicalize for MsiCanonicalizer {
    fn write_canonical(mut self: Box<Self>, out: &mut dyn Write) -> Result<()> {
        canonical::write_canonical(&mut self.cdf, self.prehash.as_deref(), out)
    }
}

impl TransformSession for MsiSession {
    fn canonicalizer(&mut self) -> Result<Box<dyn Canonicalize>> {
        let cdf = self
            .cdf
            .take()
            .ok_or_else(|| Error::Stream("MSI structure already handed to a producer".into()))?;
        Ok(Box::new(MsiCanonicalizer {
            cdf,
            prehash: self.exsig.clone(),
        }))
    }

    fn embed(&mut self, staged: &mut File, blob: &SignatureBlob) -> Result<()> {
        staged.seek(SeekFrom::Start(0))?;
        let mut cdf = CompoundFile::open(&mut *staged)
            .map_err(|e| Error::apply(ApplyStage::Embed, format!("reopening staged copy: {e}")))?;
        replace_root_stream(&mut cdf, DIGITAL_SIGNATURE, Some(blob.as_bytes()))?;
        replace_root_stream(&mut cdf, MSI_DIGITAL_SIGNATURE_EX, self.exsig.as_deref())?;
        cdf.flush()?;
        log::debug!(
            "embedded {} byte signature{}",
            blob.len(),
            if self.exsig.is_some() { " with extended digest" } else { "" }
        );
        Ok(())
    }
}

fn replace_root_stream<F: Read + Write + Seek>(
    cdf: &mut CompoundFile<F>,
    name: &str,
    data: Option<&[u8]>,
) -> Result<()> {
    let path = root_path(name);
    if cdf.is_stream(&path) {
        cdf.remove_stream(&path)?;
    }
    if let Some(data) = data {
        let mut stream = cdf.create_stream(&path)?;
        stream.write_all(data)?;
        stream.flush()?;
    }
    Ok(())
}
