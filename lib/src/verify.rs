use crate::{digest::DigestAlgorithm, envelope::VerifiedSignature};

/// One signature found in a container.
#[derive(Debug, Clone)]
pub struct SignatureRecord {
    pub hash: DigestAlgorithm,
    pub signature: VerifiedSignature,
}

#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub format: &'static str,
    pub signatures: Vec<SignatureRecord>,
}
