use crate::error::Result;
use crate::log::loggable::Loggable;
use crate::log::varint;
use crate::log::LogWrite;
use crate::tree::{StructureId, NULL_ADDRESS};
use crate::Error;

pub const DATABASE_ROOT_TYPE: u8 = 1;
pub const MAGIC: u64 = 199;

/// Loggable anchoring the meta tree.
///
/// The payload is three compressed integers: the meta tree root address, the
/// last allocated structure id, and their sum plus [`MAGIC`]. A root whose
/// third field does not match is invalid and skipped during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseRoot {
    address: u64,
    length: u64,
    tree_address: u64,
    last_structure_id: u64,
    valid: bool,
}

impl DatabaseRoot {
    pub fn new(tree_address: u64, last_structure_id: StructureId) -> Self {
        Self {
            address: NULL_ADDRESS,
            length: 0,
            tree_address,
            last_structure_id: last_structure_id as u64,
            valid: true,
        }
    }

    fn checksum(tree_address: u64, last_structure_id: u64) -> u64 {
        tree_address
            .wrapping_add(last_structure_id)
            .wrapping_add(MAGIC)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(24);
        varint::encode(self.tree_address, &mut data);
        varint::encode(self.last_structure_id, &mut data);
        varint::encode(Self::checksum(self.tree_address, self.last_structure_id), &mut data);
        data
    }

    pub fn from_loggable(loggable: &Loggable) -> Result<Self> {
        if loggable.kind() != DATABASE_ROOT_TYPE {
            return Err(Error::DataCorruption(format!(
                "loggable at {} is not a database root",
                loggable.address()
            )));
        }
        let data = loggable.data();
        let (tree_address, pos) = data.read_varint(0)?;
        let (last_structure_id, pos) = data.read_varint(pos)?;
        let (checksum, _) = data.read_varint(pos)?;
        Ok(Self {
            address: loggable.address(),
            length: loggable.length(),
            tree_address,
            last_structure_id,
            valid: checksum == Self::checksum(tree_address, last_structure_id),
        })
    }

    /// Appends the root and returns it with its address filled in.
    pub fn write(mut self, structure_id: StructureId, log: &mut LogWrite<'_>) -> Result<Self> {
        let address = log.write(DATABASE_ROOT_TYPE, structure_id as u64, &self.encode())?;
        self.address = address;
        self.length = log.position() - address;
        Ok(self)
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn end_address(&self) -> u64 {
        self.address + self.length
    }

    pub fn tree_address(&self) -> u64 {
        self.tree_address
    }

    pub fn last_structure_id(&self) -> Result<StructureId> {
        StructureId::try_from(self.last_structure_id).map_err(|_| {
            Error::DataCorruption(format!(
                "structure id {} in root at {} is out of range",
                self.last_structure_id, self.address
            ))
        })
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}
