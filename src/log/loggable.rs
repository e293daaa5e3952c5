//! Loggables and their wire format.
//!
//! ```text
//! +-----------------+----------------------+-------------------+--------+
//! | type ^ 0x80: u8 | structure_id: varint | data_len: varint  | data   |
//! +-----------------+----------------------+-------------------+--------+
//! ```
//!
//! The null loggable (type 0) is the single byte `0x80` and pads the log up to
//! a file boundary.

use std::cmp::Ordering;
use std::sync::Arc;

use super::page::PageLayout;
use super::varint;
use crate::error::{Bound, Result};
use crate::Error;

pub const NULL_TYPE: u8 = 0;
pub const NULL_BYTE: u8 = 0x80;
const TYPE_FLAG: u8 = 0x80;

/// Appends the encoding of a loggable to `out`.
pub fn encode(kind: u8, structure_id: u64, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
    if kind == NULL_TYPE || kind >= TYPE_FLAG {
        return Err(Error::InvalidInput(format!(
            "loggable type must be in 1..128, got {}",
            kind
        )));
    }
    out.reserve(1 + varint::encoded_len(structure_id) + varint::encoded_len(data.len() as u64) + data.len());
    out.push(kind ^ TYPE_FLAG);
    varint::encode(structure_id, out);
    varint::encode(data.len() as u64, out);
    out.extend_from_slice(data);
    Ok(())
}

/// Largest data a single loggable of `structure_id` can carry.
pub fn max_data_len(layout: &PageLayout, structure_id: u64) -> u64 {
    let file_capacity = layout.file_capacity();
    let header = 1 + varint::encoded_len(structure_id) + varint::encoded_len(file_capacity);
    file_capacity.saturating_sub(header as u64)
}

/// Plaintext data of one page.
#[derive(Clone)]
pub struct PageView {
    pub data: Arc<[u8]>,
    /// Valid data bytes; less than the page capacity only for the tail page.
    pub len: usize,
    pub first_loggable: Option<usize>,
}

/// Anything that can hand out plaintext pages of a log.
pub trait PageSource {
    fn layout(&self) -> PageLayout;

    /// First address past the readable region.
    fn high_address(&self) -> u64;

    fn page(&self, page_address: u64) -> Result<PageView>;
}

#[derive(Clone)]
pub struct Segment {
    page: Arc<[u8]>,
    start: usize,
    len: usize,
}

impl Segment {
    fn bytes(&self) -> &[u8] {
        &self.page[self.start..self.start + self.len]
    }
}

/// Data of a loggable, borrowed from the page or pages holding it.
#[derive(Clone)]
pub enum LoggableData {
    Page {
        page: Arc<[u8]>,
        start: usize,
        len: usize,
    },
    Composite {
        segments: Arc<[Segment]>,
        len: usize,
    },
}

impl std::fmt::Debug for LoggableData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoggableData::Page { len, .. } => f.debug_struct("Page").field("len", len).finish(),
            LoggableData::Composite { segments, len } => f
                .debug_struct("Composite")
                .field("segments", &segments.len())
                .field("len", len)
                .finish(),
        }
    }
}

impl LoggableData {
    pub fn empty() -> Self {
        LoggableData::Page {
            page: Arc::from(Vec::new()),
            start: 0,
            len: 0,
        }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        LoggableData::Page {
            page: Arc::from(bytes),
            start: 0,
            len,
        }
    }

    fn from_segments(mut segments: Vec<Segment>) -> Self {
        match segments.len() {
            0 => Self::empty(),
            1 => {
                let Segment { page, start, len } = segments.remove(0);
                LoggableData::Page { page, start, len }
            }
            _ => {
                let len = segments.iter().map(|s| s.len).sum();
                LoggableData::Composite {
                    segments: Arc::from(segments),
                    len,
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            LoggableData::Page { len, .. } | LoggableData::Composite { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contiguous chunks in order.
    pub fn chunks(&self) -> Vec<&[u8]> {
        match self {
            LoggableData::Page { page, start, len } => vec![&page[*start..*start + *len]],
            LoggableData::Composite { segments, .. } => segments.iter().map(|s| s.bytes()).collect(),
        }
    }

    pub fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.chunks().into_iter().flat_map(|chunk| chunk.iter().copied())
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        match self {
            LoggableData::Page { page, start, len } => {
                (index < *len).then(|| page[*start + index])
            }
            LoggableData::Composite { segments, .. } => {
                let mut index = index;
                for segment in segments.iter() {
                    if index < segment.len {
                        return Some(segment.bytes()[index]);
                    }
                    index -= segment.len;
                }
                None
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Byte-wise comparison against a slice, without copying.
    pub fn compare(&self, other: &[u8]) -> Ordering {
        self.bytes().cmp(other.iter().copied())
    }

    /// Reads a compressed integer at `offset`, returning it and the offset after it.
    pub fn read_varint(&self, offset: usize) -> Result<(u64, usize)> {
        let mut pos = offset;
        let value = varint::decode_with(|| {
            let byte = self.get(pos).ok_or_else(|| {
                Error::InvalidData("compressed integer runs past loggable data".to_string())
            })?;
            pos += 1;
            Ok(byte)
        })?;
        Ok((value, pos))
    }
}

impl PartialEq<[u8]> for LoggableData {
    fn eq(&self, other: &[u8]) -> bool {
        self.len() == other.len() && self.compare(other) == Ordering::Equal
    }
}

/// One record read back from the log.
#[derive(Debug, Clone)]
pub struct Loggable {
    address: u64,
    end_address: u64,
    kind: u8,
    structure_id: u64,
    data: LoggableData,
}

impl Loggable {
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Address right after the last byte; trailers in between are included.
    pub fn end_address(&self) -> u64 {
        self.end_address
    }

    pub fn length(&self) -> u64 {
        self.end_address - self.address
    }

    pub fn kind(&self) -> u8 {
        self.kind
    }

    pub fn structure_id(&self) -> u64 {
        self.structure_id
    }

    pub fn data(&self) -> &LoggableData {
        &self.data
    }

    pub fn is_null(&self) -> bool {
        self.kind == NULL_TYPE
    }
}

/// Decoded header of a loggable, enough to skip over it.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub address: u64,
    pub kind: u8,
    pub structure_id: u64,
    pub data_address: u64,
    pub data_len: u64,
    pub end_address: u64,
}

/// Reads bytes sequentially across pages, skipping trailers.
struct Cursor<'a, S: PageSource + ?Sized> {
    source: &'a S,
    layout: PageLayout,
    address: u64,
    current: Option<(u64, PageView)>,
}

impl<'a, S: PageSource + ?Sized> Cursor<'a, S> {
    fn new(source: &'a S, address: u64) -> Self {
        let layout = source.layout();
        Self {
            source,
            layout,
            address: layout.normalize(address),
            current: None,
        }
    }

    /// Page holding the cursor position and the offset into it.
    fn view(&mut self) -> Result<(PageView, usize)> {
        self.address = self.layout.normalize(self.address);
        if self.address >= self.source.high_address() {
            return Err(Error::BlockNotFound {
                address: self.address,
                bound: Bound::Overflow,
            });
        }
        let page_address = self.layout.page_address(self.address);
        let view = match &self.current {
            Some((address, view)) if *address == page_address => view.clone(),
            _ => {
                let view = self.source.page(page_address)?;
                self.current = Some((page_address, view.clone()));
                view
            }
        };
        let offset = self.layout.page_offset(self.address);
        if offset >= view.len {
            return Err(Error::BlockNotFound {
                address: self.address,
                bound: Bound::Overflow,
            });
        }
        Ok((view, offset))
    }

    fn next_byte(&mut self) -> Result<u8> {
        let (view, offset) = self.view()?;
        self.address += 1;
        Ok(view.data[offset])
    }

    fn take(&mut self, len: u64) -> Result<LoggableData> {
        let mut segments = Vec::new();
        let mut left = len as usize;
        while left > 0 {
            let (view, offset) = self.view()?;
            let n = left.min(view.len - offset);
            segments.push(Segment {
                page: view.data.clone(),
                start: offset,
                len: n,
            });
            self.address += n as u64;
            left -= n;
        }
        Ok(LoggableData::from_segments(segments))
    }

    fn header(&mut self) -> Result<Header> {
        let address = self.layout.normalize(self.address);
        let type_byte = self.next_byte()?;
        if type_byte & TYPE_FLAG == 0 {
            return Err(Error::InvalidData(format!(
                "invalid loggable type byte {:#04x} at address {}",
                type_byte, address
            )));
        }
        let kind = type_byte ^ TYPE_FLAG;
        if kind == NULL_TYPE {
            let end_address = self.layout.normalize(self.address);
            return Ok(Header {
                address,
                kind,
                structure_id: 0,
                data_address: end_address,
                data_len: 0,
                end_address,
            });
        }
        let structure_id = varint::decode_with(|| self.next_byte())?;
        let data_len = varint::decode_with(|| self.next_byte())?;
        let data_address = self.layout.normalize(self.address);

        // a loggable never crosses into the next file
        let file_end = self.layout.file_address(address) + self.layout.file_length();
        let room = if data_address >= file_end {
            0
        } else {
            self.layout.data_len(data_address, file_end)
        };
        if data_len > room {
            return Err(Error::InvalidData(format!(
                "loggable at address {} claims {} data bytes, its file has room for {}",
                address, data_len, room
            )));
        }
        let end_address = self.layout.advance(data_address, data_len).ok_or_else(|| {
            Error::InvalidData(format!("loggable at address {} ends past the address space", address))
        })?;
        Ok(Header {
            address,
            kind,
            structure_id,
            data_address,
            data_len,
            end_address,
        })
    }
}

pub fn read_header<S: PageSource + ?Sized>(source: &S, address: u64) -> Result<Header> {
    let header = Cursor::new(source, address).header()?;
    if header.end_address > source.high_address() {
        return Err(Error::BlockNotFound {
            address: header.end_address,
            bound: Bound::Overflow,
        });
    }
    Ok(header)
}

pub fn read<S: PageSource + ?Sized>(source: &S, address: u64) -> Result<Loggable> {
    let mut cursor = Cursor::new(source, address);
    let header = cursor.header()?;
    let data = cursor.take(header.data_len)?;
    Ok(Loggable {
        address: header.address,
        end_address: header.end_address,
        kind: header.kind,
        structure_id: header.structure_id,
        data,
    })
}

/// Yields consecutive loggables from a start address up to the high address.
/// The first error ends the iteration.
pub struct LoggableIterator<'a, S: PageSource + ?Sized> {
    source: &'a S,
    address: u64,
    end: u64,
    failed: bool,
}

impl<'a, S: PageSource + ?Sized> LoggableIterator<'a, S> {
    pub fn new(source: &'a S, address: u64) -> Self {
        Self::bounded(source, address, source.high_address())
    }

    pub fn bounded(source: &'a S, address: u64, end: u64) -> Self {
        Self {
            source,
            address: source.layout().normalize(address),
            end: end.min(source.high_address()),
            failed: false,
        }
    }

    /// Address of the next loggable to be read.
    pub fn address(&self) -> u64 {
        self.address
    }
}

impl<S: PageSource + ?Sized> Iterator for LoggableIterator<'_, S> {
    type Item = Result<Loggable>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.address >= self.end {
            return None;
        }
        match read(self.source, self.address) {
            Ok(loggable) => {
                self.address = loggable.end_address();
                Some(Ok(loggable))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
