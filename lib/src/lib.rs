//! # artisign
//!
//! Pluggable signing for structured-storage containers. Each container
//! format plugs in through a [`SignerDescriptor`] and three steps:
//!
//! - **Transform** opens the container and exposes a canonical byte stream
//!   produced on a background thread, bounded so memory stays flat.
//! - **Sign** digests that stream and asks a [`SigningBackend`] to sign only
//!   the digest. Keys and container bytes never meet.
//! - **Apply** embeds the resulting [`SignatureBlob`] into a staged copy and
//!   atomically swaps it into place. The original is untouched on failure.
//!
//! Windows Installer packages (`msi`) ship built in.
//!
//! ### Minimal example
//!
//! ```no_run
//! use std::{path::Path, sync::Arc};
//!
//! use artisign::{ClockTimestamper, LocalSigner, Registry, SignRequest, VerifyOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Registry::with_builtin()?;
//!     let signer = LocalSigner::load(Path::new("signer.key.pem"), Path::new("chain.p7b"))?;
//!
//!     let request = SignRequest::new(
//!         "setup.msi",
//!         Arc::new(signer),
//!         Arc::new(ClockTimestamper::default()),
//!     );
//!     let outcome = artisign::sign_file(&registry, &request).await?;
//!     println!("signed {} as {}", outcome.destination.display(), outcome.format);
//!
//!     let result =
//!         artisign::verify_file(&registry, Path::new("setup.msi"), &VerifyOptions::default())?;
//!     for record in &result.signatures {
//!         println!("{}: {}", record.hash, record.signature.subject());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ### Environment variables
//!
//! Read by [`EngineConfig::init_from_env`](Envconfig::init_from_env):
//!
//! - `ARTISIGN_DIGEST` *(optional)*: `sha256` (default), `sha384` or `sha512`.
//! - `ARTISIGN_KEY`: PKCS#8 PEM Ed25519 private key.
//! - `ARTISIGN_CHAIN`: certificate chain, `.p7b` or a single DER certificate.
//! - `ARTISIGN_PIPELINE_CAPACITY` *(optional)*: chunks buffered between producer and signer (4).
//! - `ARTISIGN_CHUNK_SIZE` *(optional)*: bytes per chunk (65536).
//! - `ARTISIGN_TIMESTAMP` *(optional)*: `false` to skip the signing time.
//!
//! ### Driving the steps yourself
//!
//! [`sign_file`] is a thin wrapper over [`SignerDescriptor::transform`],
//! [`Transformer::sign`] and [`Transformer::apply`]. Callers that need the
//! signing step somewhere else (a remote service, a hardware token) can take
//! the stream from [`Transformer::reader`], ship its digest out, and call
//! `apply` with whatever blob comes back. The stream runs on the tokio
//! blocking pool, so `reader` must be called inside a runtime. A transformer
//! whose stream or signing step failed refuses to apply.
mod atomic;
mod certs;
mod config;
mod digest;
mod engine;
mod envelope;
mod error;
pub mod formats;
mod magic;
mod options;
mod pipeline;
mod registry;
mod sign;
mod timestamp;
mod transform;
mod verify;

pub use atomic::AtomicRewriter;
pub use certs::{CertType, CertificateChain, CertificateError};
pub use config::EngineConfig;
pub use digest::{DigestAlgorithm, Hasher};
pub use engine::{SignOutcome, SignRequest, sign_file, verify_file};
pub use envconfig::Envconfig;
pub use envelope::{Envelope, SignatureBlob, TimestampToken, VerifiedSignature};
pub use error::{ApplyStage, BackendStage, Error, Result, VerifyError};
pub use magic::{FileType, MSI_PACKAGE_CLSID, MSI_PATCH_CLSID, MSI_TRANSFORM_CLSID};
pub use options::{FlagKind, FlagSchema, FlagSpec, FlagValue, Flags, SignOptions, VerifyOptions};
pub use pipeline::{CanonicalStream, PipelineConfig, Producer};
pub use registry::{Registry, SignerDescriptor, SignerFormat};
pub use sign::{LocalSigner, SigningBackend, sign_digest};
pub use timestamp::{ClockTimestamper, NoTimestamp, Timestamper};
pub use transform::{Canonicalize, TransformSession, TransformState, Transformer};
pub use verify::{SignatureRecord, VerificationResult};
