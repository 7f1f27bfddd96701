//! Canonical serialisation of an MSI compound document.
//!
//! The stream is a sequence of frames, each a tag byte, a big-endian u64
//! payload length and the payload:
//!
//! * `Prehash`: the extended digest, first frame, only when enabled
//! * `Content`: one stream's bytes
//! * `Clsid`: a storage's CLSID, after all of its children
//!
//! Children of a storage are visited in order of their UTF-16LE names. The
//! root signature streams are skipped so signing does not change the
//! digest. The primary digest is the hash of every payload in order.
use std::{
    io::{self, Read, Seek, Write},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use cfb::{CompoundFile, Entry};

use crate::{
    digest::{DigestAlgorithm, Hasher},
    error::{Error, Result},
};

pub const DIGITAL_SIGNATURE: &str = "\u{5}DigitalSignature";
pub const MSI_DIGITAL_SIGNATURE_EX: &str = "\u{5}MsiDigitalSignatureEx";

const HEADER_LEN: usize = 9;
const CLSID_LEN: u64 = 16;
// 100ns intervals between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameTag {
    Prehash = 1,
    Content = 2,
    Clsid = 3,
}

impl FrameTag {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(FrameTag::Prehash),
            2 => Some(FrameTag::Content),
            3 => Some(FrameTag::Clsid),
            _ => None,
        }
    }
}

fn is_signature_stream(name: &str) -> bool {
    name == DIGITAL_SIGNATURE || name == MSI_DIGITAL_SIGNATURE_EX
}

fn utf16_name(name: &str) -> Vec<u8> {
    name.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn filetime(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => FILETIME_UNIX_EPOCH + (d.as_nanos() / 100) as u64,
        Err(_) => 0,
    }
}

fn sorted_children<F: Read + Seek>(
    cdf: &CompoundFile<F>,
    path: &Path,
    root: bool,
) -> io::Result<Vec<Entry>> {
    let mut entries: Vec<Entry> = cdf
        .read_storage(path)?
        .filter(|e| !(root && is_signature_stream(e.name())))
        .collect();
    entries.sort_by_cached_key(|e| utf16_name(e.name()));
    Ok(entries)
}

fn write_header(out: &mut dyn Write, tag: FrameTag, len: u64) -> io::Result<()> {
    let mut header = [0u8; HEADER_LEN];
    header[0] = tag as u8;
    header[1..].copy_from_slice(&len.to_be_bytes());
    out.write_all(&header)
}

/// Write the canonical frames for `cdf`, led by `prehash` when given.
pub(crate) fn write_canonical<F: Read + Seek>(
    cdf: &mut CompoundFile<F>,
    prehash: Option<&[u8]>,
    out: &mut dyn Write,
) -> Result<()> {
    if let Some(prehash) = prehash {
        write_header(out, FrameTag::Prehash, prehash.len() as u64)?;
        out.write_all(prehash)?;
    }
    write_storage(cdf, Path::new("/"), true, out)
}

fn write_storage<F: Read + Seek>(
    cdf: &mut CompoundFile<F>,
    path: &Path,
    root: bool,
    out: &mut dyn Write,
) -> Result<()> {
    for entry in sorted_children(cdf, path, root)? {
        if entry.is_stream() {
            write_header(out, FrameTag::Content, entry.len())?;
            let mut stream = cdf.open_stream(entry.path())?;
            let copied = io::copy(&mut stream, out)?;
            if copied != entry.len() {
                return Err(Error::format(format!(
                    "stream {} holds {copied} bytes but its directory entry says {}",
                    entry.path().display(),
                    entry.len()
                )));
            }
        } else if entry.is_storage() {
            write_storage(cdf, entry.path(), false, out)?;
        }
    }
    let clsid = cdf.entry(path)?.clsid().to_bytes_le();
    write_header(out, FrameTag::Clsid, CLSID_LEN)?;
    out.write_all(&clsid)?;
    Ok(())
}

/// Hash of the directory metadata, stored as `MsiDigitalSignatureEx`.
pub(crate) fn prehash<F: Read + Seek>(
    cdf: &CompoundFile<F>,
    algorithm: DigestAlgorithm,
) -> io::Result<Vec<u8>> {
    let mut hasher = algorithm.hasher();
    hash_metadata(cdf, Path::new("/"), true, &mut hasher)?;
    Ok(hasher.finalize())
}

fn hash_metadata<F: Read + Seek>(
    cdf: &CompoundFile<F>,
    path: &Path,
    root: bool,
    hasher: &mut Hasher,
) -> io::Result<()> {
    let storage = cdf.entry(path)?;
    hasher.update(&storage.clsid().to_bytes_le());
    hasher.update(&storage.state_bits().to_le_bytes());
    // Root timestamps move whenever the file is rewritten.
    if !root {
        hasher.update(&filetime(storage.created()).to_le_bytes());
        hasher.update(&filetime(storage.modified()).to_le_bytes());
    }
    for child in sorted_children(cdf, path, root)? {
        hasher.update(&utf16_name(child.name()));
        if child.is_stream() {
            hasher.update(&child.len().to_le_bytes());
        } else if child.is_storage() {
            hash_metadata(cdf, child.path(), false, hasher)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CanonicalDigest {
    pub digest: Vec<u8>,
    pub prehash: Option<Vec<u8>>,
}

/// Incremental consumer of canonical frames. Accepts arbitrary chunk
/// boundaries.
pub(crate) struct FrameDigester {
    algorithm: DigestAlgorithm,
    hasher: Hasher,
    expect_prehash: bool,
    header: [u8; HEADER_LEN],
    header_len: usize,
    payload: Option<(FrameTag, u64)>,
    prehash: Option<Vec<u8>>,
    last: Option<FrameTag>,
    frames: u64,
}

fn stream_error(message: impl Into<String>) -> Error {
    Error::Stream(message.into())
}

impl FrameDigester {
    pub fn new(algorithm: DigestAlgorithm, expect_prehash: bool) -> Self {
        Self {
            algorithm,
            hasher: algorithm.hasher(),
            expect_prehash,
            header: [0; HEADER_LEN],
            header_len: 0,
            payload: None,
            prehash: None,
            last: None,
            frames: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match self.payload {
                None => {
                    let take = (HEADER_LEN - self.header_len).min(data.len());
                    self.header[self.header_len..self.header_len + take]
                        .copy_from_slice(&data[..take]);
                    self.header_len += take;
                    data = &data[take..];
                    if self.header_len == HEADER_LEN {
                        self.begin_frame()?;
                    }
                }
                Some((tag, remaining)) => {
                    let take = remaining.min(data.len() as u64) as usize;
                    let (chunk, rest) = data.split_at(take);
                    self.hasher.update(chunk);
                    if let (FrameTag::Prehash, Some(prehash)) = (tag, self.prehash.as_mut()) {
                        prehash.extend_from_slice(chunk);
                    }
                    data = rest;
                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        self.payload = None;
                        self.last = Some(tag);
                    } else {
                        self.payload = Some((tag, remaining));
                    }
                }
            }
        }
        Ok(())
    }

    fn begin_frame(&mut self) -> Result<()> {
        self.header_len = 0;
        let tag = FrameTag::from_byte(self.header[0])
            .ok_or_else(|| stream_error(format!("unknown frame tag {:#04x}", self.header[0])))?;
        let mut len = [0u8; 8];
        len.copy_from_slice(&self.header[1..]);
        let len = u64::from_be_bytes(len);

        match tag {
            FrameTag::Prehash => {
                if !self.expect_prehash {
                    return Err(stream_error("unexpected extended digest in stream"));
                }
                if self.frames != 0 {
                    return Err(stream_error("extended digest must lead the stream"));
                }
                if len != self.algorithm.output_len() as u64 {
                    return Err(stream_error(format!(
                        "extended digest is {len} bytes, {} needs {}",
                        self.algorithm,
                        self.algorithm.output_len()
                    )));
                }
                self.prehash = Some(Vec::with_capacity(len as usize));
            }
            FrameTag::Content | FrameTag::Clsid => {
                if self.frames == 0 && self.expect_prehash {
                    return Err(stream_error("stream is missing the extended digest"));
                }
                if tag == FrameTag::Clsid && len != CLSID_LEN {
                    return Err(stream_error(format!("CLSID frame of {len} bytes")));
                }
            }
        }

        self.frames += 1;
        if len == 0 {
            self.last = Some(tag);
        } else {
            self.payload = Some((tag, len));
        }
        Ok(())
    }

    pub fn finish(self) -> Result<CanonicalDigest> {
        if self.header_len != 0 || self.payload.is_some() {
            return Err(stream_error("stream ended inside a frame"));
        }
        if self.last != Some(FrameTag::Clsid) {
            return Err(stream_error("stream ended before the root storage"));
        }
        log::debug!("digested {} canonical frames", self.frames);
        Ok(CanonicalDigest {
            digest: self.hasher.finalize(),
            prehash: self.prehash,
        })
    }
}

impl Write for FrameDigester {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn put(cdf: &mut CompoundFile<Cursor<Vec<u8>>>, path: &str, data: &[u8]) {
        let mut stream = cdf.create_stream(path).unwrap();
        stream.write_all(data).unwrap();
        stream.flush().unwrap();
    }

    fn sample() -> CompoundFile<Cursor<Vec<u8>>> {
        let mut cdf = CompoundFile::create(Cursor::new(Vec::new())).unwrap();
        put(&mut cdf, "/b", b"bravo");
        put(&mut cdf, "/a", b"alpha");
        cdf.create_storage("/sub").unwrap();
        put(&mut cdf, "/sub/c", b"charlie");
        cdf.flush().unwrap();
        cdf
    }

    fn canonical(cdf: &mut CompoundFile<Cursor<Vec<u8>>>, prehash: Option<&[u8]>) -> Vec<u8> {
        let mut out = Vec::new();
        write_canonical(cdf, prehash, &mut out).unwrap();
        out
    }

    #[test]
    fn test_digest_covers_payloads_in_name_order() {
        let mut cdf = sample();
        let bytes = canonical(&mut cdf, None);

        let mut expected = DigestAlgorithm::Sha256.hasher();
        expected.update(b"alpha");
        expected.update(b"bravo");
        expected.update(b"charlie");
        expected.update(&[0; 16]); // /sub CLSID
        expected.update(&[0; 16]); // root CLSID

        let mut digester = FrameDigester::new(DigestAlgorithm::Sha256, false);
        // Feed one byte at a time to exercise split headers.
        for b in &bytes {
            digester.update(std::slice::from_ref(b)).unwrap();
        }
        let result = digester.finish().unwrap();
        assert_eq!(result.digest, expected.finalize());
        assert_eq!(result.prehash, None);
    }

    #[test]
    fn test_signature_streams_are_excluded() {
        let mut cdf = sample();
        let before = canonical(&mut cdf, None);
        let before_prehash = prehash(&cdf, DigestAlgorithm::Sha256).unwrap();
        let path = format!("/{DIGITAL_SIGNATURE}");
        put(&mut cdf, &path, b"sig");
        assert_eq!(canonical(&mut cdf, None), before);
        assert_eq!(prehash(&cdf, DigestAlgorithm::Sha256).unwrap(), before_prehash);
    }

    #[test]
    fn test_prehash_frame_leads_and_is_hashed() {
        let mut cdf = sample();
        let pre = prehash(&cdf, DigestAlgorithm::Sha256).unwrap();
        let bytes = canonical(&mut cdf, Some(&pre));

        let mut with = FrameDigester::new(DigestAlgorithm::Sha256, true);
        with.update(&bytes).unwrap();
        let with = with.finish().unwrap();
        assert_eq!(with.prehash.as_deref(), Some(pre.as_slice()));

        let plain = canonical(&mut cdf, None);
        let mut without = FrameDigester::new(DigestAlgorithm::Sha256, false);
        without.update(&plain).unwrap();
        assert_ne!(with.digest, without.finish().unwrap().digest);
    }

    #[test]
    fn test_prehash_changes_with_metadata() {
        let mut cdf = sample();
        let before = prehash(&cdf, DigestAlgorithm::Sha256).unwrap();
        put(&mut cdf, "/a", b"alpha!");
        assert_ne!(prehash(&cdf, DigestAlgorithm::Sha256).unwrap(), before);
    }

    #[test]
    fn test_rejects_inconsistent_streams() {
        let mut cdf = sample();
        let plain = canonical(&mut cdf, None);

        let mut missing = FrameDigester::new(DigestAlgorithm::Sha256, true);
        assert!(matches!(missing.update(&plain), Err(Error::Stream(_))));

        let mut truncated = FrameDigester::new(DigestAlgorithm::Sha256, false);
        truncated.update(&plain[..plain.len() - 3]).unwrap();
        assert!(matches!(truncated.finish(), Err(Error::Stream(_))));

        let mut garbage = FrameDigester::new(DigestAlgorithm::Sha256, false);
        assert!(garbage.update(&[9; HEADER_LEN]).is_err());
    }
}
