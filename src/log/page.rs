//! Page layout.
//!
//! ```text
//! +---------------------------+----------------------+---------------+
//! | data (page_size - 12)     | first_loggable: u32  | xxh64: u64    |
//! +---------------------------+----------------------+---------------+
//! ```
//!
//! Log addresses are physical, so a loggable whose bytes reach the end of a
//! page's data area continues right after the trailer. The checksum covers the
//! stored data area and the offset field. Only complete pages carry a trailer.

use byteorder::{BigEndian, ByteOrder};
use xxhash_rust::xxh64::xxh64;

use crate::error::Result;
use crate::Error;

pub const TRAILER_SIZE: usize = 12;
pub const HASH_SIZE: usize = 8;
pub const HASH_SEED: u64 = 0;
/// Offset marker for a page in which no loggable header starts.
pub const NO_LOGGABLE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLayout {
    page_size: usize,
    file_length: u64,
}

impl PageLayout {
    pub fn new(page_size: usize, file_length: u64) -> Self {
        Self {
            page_size,
            file_length,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    /// Data bytes a page can hold.
    pub fn capacity(&self) -> usize {
        self.page_size - TRAILER_SIZE
    }

    /// Data bytes a whole file can hold.
    pub fn file_capacity(&self) -> u64 {
        self.file_length / self.page_size as u64 * self.capacity() as u64
    }

    pub fn page_address(&self, address: u64) -> u64 {
        address - address % self.page_size as u64
    }

    pub fn page_offset(&self, address: u64) -> usize {
        (address % self.page_size as u64) as usize
    }

    pub fn file_address(&self, address: u64) -> u64 {
        address - address % self.file_length
    }

    /// Moves an address sitting in a trailer to the start of the next page.
    pub fn normalize(&self, address: u64) -> u64 {
        if self.page_offset(address) >= self.capacity() {
            self.page_address(address).saturating_add(self.page_size as u64)
        } else {
            address
        }
    }

    /// Address reached after `len` data bytes written from `address`, or
    /// `None` past the end of the address space.
    pub fn advance(&self, address: u64, len: u64) -> Option<u64> {
        let address = self.normalize(address);
        let left_in_page = (self.capacity() - self.page_offset(address)) as u64;
        if len < left_in_page {
            return address.checked_add(len);
        }
        let len = len - left_in_page;
        let next_page = self.page_address(address).checked_add(self.page_size as u64)?;
        let capacity = self.capacity() as u64;
        (len / capacity)
            .checked_mul(self.page_size as u64)?
            .checked_add(len % capacity)?
            .checked_add(next_page)
    }

    /// Data bytes between two normalized addresses, skipping trailers.
    pub fn data_len(&self, start: u64, end: u64) -> u64 {
        let start_page = self.page_address(start);
        let end_page = self.page_address(end);
        if start_page == end_page {
            return end - start;
        }
        let pages_between = (end_page - start_page) / self.page_size as u64 - 1;
        (self.capacity() - self.page_offset(start)) as u64
            + pages_between * self.capacity() as u64
            + self.page_offset(end) as u64
    }
}

pub fn checksum(page: &[u8]) -> u64 {
    xxh64(&page[..page.len() - HASH_SIZE], HASH_SEED)
}

/// Writes the trailer of a complete page.
pub fn seal(page: &mut [u8], first_loggable: u32, hash: u64) {
    let len = page.len();
    BigEndian::write_u32(&mut page[len - TRAILER_SIZE..len - HASH_SIZE], first_loggable);
    BigEndian::write_u64(&mut page[len - HASH_SIZE..], hash);
}

pub fn stored_checksum(page: &[u8]) -> u64 {
    BigEndian::read_u64(&page[page.len() - HASH_SIZE..])
}

pub fn first_loggable(page: &[u8]) -> Option<usize> {
    let len = page.len();
    match BigEndian::read_u32(&page[len - TRAILER_SIZE..len - HASH_SIZE]) {
        NO_LOGGABLE => None,
        offset => Some(offset as usize),
    }
}

/// Checks the checksum and offset marker of a complete page as stored on disk.
pub fn verify(page: &[u8], page_address: u64) -> Result<()> {
    let computed = checksum(page);
    let stored = stored_checksum(page);
    if computed != stored {
        return Err(Error::DataCorruption(format!(
            "page checksum mismatch at address {}: stored {:#018x}, computed {:#018x}",
            page_address, stored, computed
        )));
    }
    if let Some(offset) = first_loggable(page) {
        if offset >= page.len() - TRAILER_SIZE {
            return Err(Error::DataCorruption(format!(
                "page at address {} points its first loggable into the trailer",
                page_address
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> PageLayout {
        PageLayout::new(256, 1024)
    }

    #[test]
    fn test_advance_within_page() {
        let layout = layout();
        assert_eq!(layout.capacity(), 244);
        assert_eq!(layout.advance(0, 10), Some(10));
        assert_eq!(layout.advance(10, 233), Some(243));
    }

    #[test]
    fn test_advance_skips_trailers() {
        let layout = layout();
        // filling the data area exactly lands on the next page
        assert_eq!(layout.advance(0, 244), Some(256));
        assert_eq!(layout.advance(0, 245), Some(257));
        assert_eq!(layout.advance(240, 244 * 2 + 4), Some(256 * 3));
        assert_eq!(layout.advance(244, 1), Some(257));
    }

    #[test]
    fn test_advance_past_address_space() {
        let layout = layout();
        assert_eq!(layout.advance(0, u64::MAX), None);
        assert_eq!(layout.advance(u64::MAX - 300, 200), None);
        assert_eq!(layout.advance(10, u64::MAX / 2), None);
    }

    #[test]
    fn test_data_len_inverts_advance() {
        let layout = layout();
        for start in [0u64, 17, 243, 256, 300] {
            for len in [0u64, 1, 100, 244, 500, 1000] {
                let start = layout.normalize(start);
                let end = layout.advance(start, len).unwrap();
                assert_eq!(layout.data_len(start, end), len, "start {} len {}", start, len);
            }
        }
    }

    #[test]
    fn test_seal_and_verify() {
        let mut page = vec![0u8; 256];
        page[..5].copy_from_slice(b"hello");
        let len = page.len();
        BigEndian::write_u32(&mut page[len - TRAILER_SIZE..len - HASH_SIZE], 3);
        let hash = checksum(&page);
        seal(&mut page, 3, hash);

        assert!(verify(&page, 0).is_ok());
        assert_eq!(first_loggable(&page), Some(3));

        page[1] ^= 0x01;
        assert!(matches!(verify(&page, 0), Err(Error::DataCorruption(_))));
    }
}
