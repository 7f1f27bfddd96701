use async_trait::async_trait;
use chrono::Utc;

use crate::{certs::CertificateChain, envelope::TimestampToken, error::Result};

/// Attaches trusted time to a raw signature before it is embedded.
#[async_trait]
pub trait Timestamper: Send + Sync {
    async fn timestamp(
        &self,
        signature: &[u8],
        chain: &CertificateChain,
    ) -> Result<Option<TimestampToken>>;
}

/// Records the local UTC clock as the signing time.
#[derive(Debug, Clone)]
pub struct ClockTimestamper {
    authority: String,
}

impl ClockTimestamper {
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
        }
    }
}

impl Default for ClockTimestamper {
    fn default() -> Self {
        Self::new("local-clock")
    }
}

#[async_trait]
impl Timestamper for ClockTimestamper {
    async fn timestamp(
        &self,
        signature: &[u8],
        chain: &CertificateChain,
    ) -> Result<Option<TimestampToken>> {
        let time = Utc::now();
        log::debug!(
            "stamped {} byte signature by '{}' at {time}",
            signature.len(),
            chain.subject()
        );
        Ok(Some(TimestampToken {
            authority: self.authority.clone(),
            time,
        }))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoTimestamp;

#[async_trait]
impl Timestamper for NoTimestamp {
    async fn timestamp(
        &self,
        _signature: &[u8],
        _chain: &CertificateChain,
    ) -> Result<Option<TimestampToken>> {
        Ok(None)
    }
}
