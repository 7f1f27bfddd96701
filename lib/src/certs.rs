// Signing chains arrive as certs-only PKCS#7 (.p7b) or a single DER
// certificate. Everything downstream wants them ordered leaf first.
use std::{collections::HashMap, fmt, path::Path};

use cms::cert::CertificateChoices;
use cms::cert::x509::Certificate;
use cms::cert::x509::der::{Decode, Encode};
use cms::{content_info::ContentInfo, signed_data::SignedData};

use crate::error::Error;

const ED25519_OID: &str = "1.3.101.112";

/// Certificate families a format can accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertType {
    X509,
    Pgp,
}

impl fmt::Display for CertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertType::X509 => f.write_str("x509"),
            CertType::Pgp => f.write_str("pgp"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("certificate chain is empty")]
    Empty,

    #[error("could not decode certificate data: {0}")]
    Decode(String),

    #[error("certificate chain is broken at '{0}'")]
    Broken(String),

    #[error("unsupported public key algorithm {0}")]
    UnsupportedKey(String),
}

impl From<CertificateError> for Error {
    fn from(err: CertificateError) -> Self {
        Error::Configuration(err.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct CertificateChain {
    certs: Vec<Certificate>,
    der: Vec<Vec<u8>>,
}

impl CertificateChain {
    /// Load a chain from disk. Tries certs-only PKCS#7 first, then a single
    /// DER certificate.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let bytes = std::fs::read(path)?;
        let chain = match Self::from_p7b(&bytes) {
            Ok(chain) => chain,
            Err(p7b_err) => {
                log::debug!("{} is not a PKCS#7 bundle: {p7b_err}", path.display());
                Self::from_der_certificates(vec![bytes])?
            }
        };
        log::info!(
            "loaded {} certificate(s) from {}, signer '{}'",
            chain.len(),
            path.display(),
            chain.subject()
        );
        Ok(chain)
    }

    pub fn from_p7b(bytes: &[u8]) -> Result<Self, CertificateError> {
        let info = ContentInfo::from_der(bytes)
            .inspect_err(|x| log::debug!("{:?}", x))
            .map_err(|e| CertificateError::Decode(e.to_string()))?;
        let data: SignedData = info
            .content
            .decode_as()
            .map_err(|e| CertificateError::Decode(e.to_string()))?;
        let certs = data.certificates.ok_or(CertificateError::Empty)?;
        let certs: Vec<Certificate> = certs
            .0
            .iter()
            .filter_map(|c| match c {
                CertificateChoices::Certificate(c) => Some(c.clone()),
                _ => None,
            })
            .collect();
        Self::from_certificates(certs)
    }

    pub fn from_der_certificates(ders: Vec<Vec<u8>>) -> Result<Self, CertificateError> {
        let certs = ders
            .iter()
            .map(|d| Certificate::from_der(d).map_err(|e| CertificateError::Decode(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_certificates(certs)
    }

    fn from_certificates(certs: Vec<Certificate>) -> Result<Self, CertificateError> {
        let certs = sort_certificates(certs)?;
        let der = certs
            .iter()
            .map(|c| c.to_der().map_err(|e| CertificateError::Decode(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { certs, der })
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    pub fn leaf(&self) -> &Certificate {
        &self.certs[0]
    }

    pub fn leaf_der(&self) -> &[u8] {
        &self.der[0]
    }

    /// DER encodings, leaf first.
    pub fn der_certificates(&self) -> &[Vec<u8>] {
        &self.der
    }

    pub fn subject(&self) -> String {
        self.leaf().tbs_certificate.subject.to_string()
    }

    /// The leaf must be issued by the next certificate when there is one.
    pub fn check_issuer(&self) -> Result<(), CertificateError> {
        if let Some(issuer) = self.certs.get(1) {
            let leaf = self.leaf();
            if leaf.tbs_certificate.issuer.to_string() != issuer.tbs_certificate.subject.to_string()
            {
                return Err(CertificateError::Broken(
                    leaf.tbs_certificate.subject.to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Raw Ed25519 public key of the leaf certificate.
    pub fn ed25519_public_key(&self) -> Result<[u8; 32], CertificateError> {
        let spki = &self.leaf().tbs_certificate.subject_public_key_info;
        let oid = spki.algorithm.oid.to_string();
        if oid != ED25519_OID {
            return Err(CertificateError::UnsupportedKey(oid));
        }
        let bytes = spki
            .subject_public_key
            .as_bytes()
            .ok_or_else(|| CertificateError::Decode("public key has unused bits".to_owned()))?;
        <[u8; 32]>::try_from(bytes)
            .map_err(|_| CertificateError::Decode(format!("bad Ed25519 key length {}", bytes.len())))
    }
}

/// Order certificates leaf first, each followed by its issuer.
fn sort_certificates(certs: Vec<Certificate>) -> Result<Vec<Certificate>, CertificateError> {
    if certs.is_empty() {
        return Err(CertificateError::Empty);
    }
    if certs.len() == 1 {
        return Ok(certs);
    }

    let max_list_length = certs.len();
    let mut list: Vec<&Certificate> = Vec::with_capacity(max_list_length);
    let mut subject_of_cert_map = HashMap::new();
    let mut issuer_of_cert_map = HashMap::new();

    for cert in certs.iter() {
        let subject = cert.tbs_certificate.subject.to_string();
        let issuer = cert.tbs_certificate.issuer.to_string();
        if subject != issuer {
            issuer_of_cert_map.insert(issuer, cert);
        } else if list.is_empty() {
            list.push(cert);
        }
        subject_of_cert_map.insert(subject, cert);
    }

    // No self-signed root: the top is whichever issuer is not in the bundle.
    if list.is_empty() {
        if let Some((_, &cert)) = issuer_of_cert_map
            .iter()
            .find(|(issuer, _)| !subject_of_cert_map.contains_key(issuer.as_str()))
        {
            list.push(cert);
        }
    }

    while list.len() < max_list_length {
        let Some(last) = list.last() else {
            return Err(CertificateError::Broken("<no root>".to_owned()));
        };
        let subject = last.tbs_certificate.subject.to_string();
        match issuer_of_cert_map.get(&subject) {
            Some(&cert) => list.push(cert),
            None => return Err(CertificateError::Broken(subject)),
        }
    }

    list.iter()
        .rev()
        .inspect(|c| {
            log::debug!(
                "cert: Subject= ({}) Issuer= ({})",
                c.tbs_certificate.subject,
                c.tbs_certificate.issuer
            )
        })
        .map(|c| Ok((*c).clone()))
        .collect()
}
