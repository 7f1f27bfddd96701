use std::{path::PathBuf, sync::Arc};

use envconfig::Envconfig;

use crate::{
    digest::DigestAlgorithm,
    error::{Error, Result},
    pipeline::PipelineConfig,
    sign::{LocalSigner, SigningBackend},
    timestamp::{ClockTimestamper, NoTimestamp, Timestamper},
};

/// Engine settings read from `ARTISIGN_*` environment variables. Command
/// line arguments override these field by field.
#[derive(Debug, Clone, Envconfig)]
pub struct EngineConfig {
    #[envconfig(from = "ARTISIGN_DIGEST", default = "sha256")]
    pub digest: DigestAlgorithm,

    /// PKCS#8 PEM Ed25519 key.
    #[envconfig(from = "ARTISIGN_KEY")]
    pub key: Option<PathBuf>,

    /// `.p7b` bundle or single DER certificate.
    #[envconfig(from = "ARTISIGN_CHAIN")]
    pub chain: Option<PathBuf>,

    #[envconfig(from = "ARTISIGN_PIPELINE_CAPACITY", default = "4")]
    pub pipeline_capacity: usize,

    #[envconfig(from = "ARTISIGN_CHUNK_SIZE", default = "65536")]
    pub chunk_size: usize,

    #[envconfig(from = "ARTISIGN_TIMESTAMP", default = "true")]
    pub timestamp: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            digest: DigestAlgorithm::default(),
            key: None,
            chain: None,
            pipeline_capacity: crate::pipeline::DEFAULT_CAPACITY,
            chunk_size: crate::pipeline::DEFAULT_CHUNK_SIZE,
            timestamp: true,
        }
    }
}

impl EngineConfig {
    pub fn pipeline(&self) -> Result<PipelineConfig> {
        if self.pipeline_capacity == 0 || self.chunk_size == 0 {
            return Err(Error::Configuration(
                "pipeline capacity and chunk size must be non-zero".to_owned(),
            ));
        }
        Ok(PipelineConfig {
            capacity: self.pipeline_capacity,
            chunk_size: self.chunk_size,
        })
    }

    pub fn signer(&self) -> Result<Arc<dyn SigningBackend>> {
        let (Some(key), Some(chain)) = (&self.key, &self.chain) else {
            return Err(Error::Configuration(
                "signing needs both a key (ARTISIGN_KEY) and a chain (ARTISIGN_CHAIN)".to_owned(),
            ));
        };
        Ok(Arc::new(LocalSigner::load(key, chain)?))
    }

    pub fn timestamper(&self) -> Arc<dyn Timestamper> {
        if self.timestamp {
            Arc::new(ClockTimestamper::default())
        } else {
            Arc::new(NoTimestamp)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(config.digest, DigestAlgorithm::Sha256);
        assert_eq!(config.pipeline().unwrap(), PipelineConfig::default());
        assert!(config.timestamp);
        assert!(matches!(config.signer(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::init_from_hashmap(&env(&[
            ("ARTISIGN_DIGEST", "sha512"),
            ("ARTISIGN_PIPELINE_CAPACITY", "1"),
            ("ARTISIGN_CHUNK_SIZE", "7"),
            ("ARTISIGN_TIMESTAMP", "false"),
        ]))
        .unwrap();
        assert_eq!(config.digest, DigestAlgorithm::Sha512);
        assert_eq!(
            config.pipeline().unwrap(),
            PipelineConfig {
                capacity: 1,
                chunk_size: 7
            }
        );
        assert!(!config.timestamp);
    }

    #[test]
    fn test_bad_values() {
        assert!(EngineConfig::init_from_hashmap(&env(&[("ARTISIGN_DIGEST", "md5")])).is_err());
        let config =
            EngineConfig::init_from_hashmap(&env(&[("ARTISIGN_PIPELINE_CAPACITY", "0")])).unwrap();
        assert!(config.pipeline().is_err());
    }

    #[test]
    fn test_signer_from_files() {
        let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../test_data");
        let config = EngineConfig {
            key: Some(root.join("signer.key.pem")),
            chain: Some(root.join("chain.p7b")),
            ..Default::default()
        };
        let signer = config.signer().unwrap();
        assert_eq!(signer.chain().len(), 2);
    }
}
