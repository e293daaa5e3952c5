//! Rotating startup metadata.
//!
//! Two small files record where the last known database root lives and whether
//! the previous shutdown was clean. Writes alternate between them so a torn
//! write always leaves the other intact; the valid file with the higher
//! version wins.
//!
//! ```text
//! +---------+--------+---------+---------+-----------+-----------+-------+-------+
//! | magic:8 | fmt:u32| ver:u64 | page:u32| file:u64  | root:u64  | clean | crc32c|
//! +---------+--------+---------+---------+-----------+-----------+-------+-------+
//! ```

use std::fs::{self, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;
use crate::Error;

pub const STARTUP_FILES: [&str; 2] = ["startup-0", "startup-1"];
pub const STARTUP_SIZE: usize = 64;
const MAGIC: &[u8; 8] = b"CINDERSU";
const FORMAT: u32 = 1;
const BODY_SIZE: usize = 8 + 4 + 8 + 4 + 8 + 8 + 1;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupMetadata {
    pub version: u64,
    pub page_size: u32,
    pub file_length: u64,
    pub root_address: u64,
    pub clean: bool,
}

impl StartupMetadata {
    pub fn encode(&self) -> Result<[u8; STARTUP_SIZE]> {
        let mut buf = [0u8; STARTUP_SIZE];
        {
            let mut out = &mut buf[..BODY_SIZE];
            out.write_all(MAGIC)?;
            out.write_u32::<BigEndian>(FORMAT)?;
            out.write_u64::<BigEndian>(self.version)?;
            out.write_u32::<BigEndian>(self.page_size)?;
            out.write_u64::<BigEndian>(self.file_length)?;
            out.write_u64::<BigEndian>(self.root_address)?;
            out.write_u8(self.clean as u8)?;
        }
        let checksum = CRC32.checksum(&buf[..BODY_SIZE]);
        (&mut buf[BODY_SIZE..BODY_SIZE + 4]).write_u32::<BigEndian>(checksum)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BODY_SIZE + 4 {
            return Err(Error::InvalidData("startup metadata is truncated".to_string()));
        }
        let mut cursor = Cursor::new(buf);

        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;
        if magic != *MAGIC {
            return Err(Error::InvalidData("invalid startup metadata magic".to_string()));
        }
        let format = cursor.read_u32::<BigEndian>()?;
        if format != FORMAT {
            return Err(Error::InvalidData(format!(
                "unsupported startup metadata format: {}",
                format
            )));
        }
        let version = cursor.read_u64::<BigEndian>()?;
        let page_size = cursor.read_u32::<BigEndian>()?;
        let file_length = cursor.read_u64::<BigEndian>()?;
        let root_address = cursor.read_u64::<BigEndian>()?;
        let clean = cursor.read_u8()? != 0;
        let stored = cursor.read_u32::<BigEndian>()?;

        let computed = CRC32.checksum(&buf[..BODY_SIZE]);
        if stored != computed {
            return Err(Error::DataCorruption(
                "startup metadata checksum mismatch".to_string(),
            ));
        }

        Ok(Self {
            version,
            page_size,
            file_length,
            root_address,
            clean,
        })
    }

    fn slot(&self) -> usize {
        (self.version % 2) as usize
    }
}

/// Newest valid startup metadata in `dir`, if any.
pub fn load(dir: &Path) -> Result<Option<StartupMetadata>> {
    let mut newest: Option<StartupMetadata> = None;
    for name in STARTUP_FILES {
        let path = dir.join(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        match StartupMetadata::decode(&bytes) {
            Ok(meta) if newest.map_or(true, |n| meta.version > n.version) => newest = Some(meta),
            Ok(_) => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Ignoring invalid startup metadata"),
        }
    }
    Ok(newest)
}

/// Writes `meta` into the slot picked by its version and syncs it.
pub fn store(dir: &Path, meta: &StartupMetadata) -> Result<()> {
    let path = dir.join(STARTUP_FILES[meta.slot()]);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    file.write_all(&meta.encode()?)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(version: u64, clean: bool) -> StartupMetadata {
        StartupMetadata {
            version,
            page_size: 4096,
            file_length: 65536,
            root_address: 1000 + version,
            clean,
        }
    }

    #[test]
    fn test_metadata_roundtrip() -> Result<()> {
        let original = meta(3, true);
        let decoded = StartupMetadata::decode(&original.encode()?)?;
        assert_eq!(decoded, original);
        Ok(())
    }

    #[test]
    fn test_newest_slot_wins() -> Result<()> {
        let dir = TempDir::new()?;
        assert!(load(dir.path())?.is_none());

        store(dir.path(), &meta(1, false))?;
        store(dir.path(), &meta(2, true))?;
        assert_eq!(load(dir.path())?, Some(meta(2, true)));

        store(dir.path(), &meta(3, false))?;
        assert_eq!(load(dir.path())?, Some(meta(3, false)));

        Ok(())
    }

    #[test]
    fn test_torn_slot_falls_back() -> Result<()> {
        let dir = TempDir::new()?;
        store(dir.path(), &meta(4, true))?;
        store(dir.path(), &meta(5, false))?;

        let torn = dir.path().join(STARTUP_FILES[1]);
        let mut bytes = fs::read(&torn)?;
        bytes[30] ^= 0xff;
        fs::write(&torn, bytes)?;

        assert_eq!(load(dir.path())?, Some(meta(4, true)));

        Ok(())
    }
}
