//! File type sniffing used to pick a format descriptor.
use std::{
    fmt,
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

use cfb::CompoundFile;
use uuid::Uuid;

pub const COMPOUND_DOCUMENT_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

pub const MSI_PACKAGE_CLSID: Uuid = Uuid::from_u128(0x000C1084_0000_0000_C000_000000000046);
pub const MSI_PATCH_CLSID: Uuid = Uuid::from_u128(0x000C1086_0000_0000_C000_000000000046);
pub const MSI_TRANSFORM_CLSID: Uuid = Uuid::from_u128(0x000C1082_0000_0000_C000_000000000046);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Unknown,
    /// Structured storage whose root CLSID we do not recognise.
    CompoundDocument,
    Msi,
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileType::Unknown => f.write_str("unknown"),
            FileType::CompoundDocument => f.write_str("compound document"),
            FileType::Msi => f.write_str("windows installer"),
        }
    }
}

pub fn detect_path(path: &Path) -> io::Result<FileType> {
    let mut file = File::open(path)?;
    detect(&mut file)
}

pub fn detect<R: Read + Seek>(reader: &mut R) -> io::Result<FileType> {
    let mut header = [0u8; 8];
    reader.seek(SeekFrom::Start(0))?;
    if let Err(err) = reader.read_exact(&mut header) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(FileType::Unknown);
        }
        return Err(err);
    }
    if header != COMPOUND_DOCUMENT_MAGIC {
        return Ok(FileType::Unknown);
    }
    reader.seek(SeekFrom::Start(0))?;
    let file_type = match CompoundFile::open(&mut *reader) {
        Ok(cdf) => {
            let clsid = *cdf.root_entry().clsid();
            if [MSI_PACKAGE_CLSID, MSI_PATCH_CLSID, MSI_TRANSFORM_CLSID].contains(&clsid) {
                FileType::Msi
            } else {
                FileType::CompoundDocument
            }
        }
        Err(err) => {
            log::debug!("compound document magic but unreadable structure: {err}");
            FileType::CompoundDocument
        }
    };
    reader.seek(SeekFrom::Start(0))?;
    Ok(file_type)
}
