//! Cell byte codec: the fixed-size records stored in a node's cell area.
//!
//! Every cell is `1 + 4 + key_payload` bytes: a type tag, a link (child page
//! for interior cells, value-unit id for leaf cells, next-cell id for free
//! cells) and the key image.

use byteorder::{BigEndian, ByteOrder};

use super::payload::{FieldType, Payload};
use crate::error::{Error, Result};

/// Tag + link bytes preceding the key image.
pub(crate) const CELL_HEADER: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CellType {
    Free = 0,
    Interior = 1,
    Leaf = 2,
}

impl CellType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CellType::Free),
            1 => Ok(CellType::Interior),
            2 => Ok(CellType::Leaf),
            other => Err(Error::Corrupt(format!("unknown cell type {other}"))),
        }
    }
}

/// Byte size of one cell for the given key columns.
pub(crate) fn cell_size(key_types: &[FieldType]) -> usize {
    CELL_HEADER + Payload::size_of(key_types)
}

/// An in-memory cell image. Stored keys must match the node's declared
/// column widths exactly; width-compatible payloads are a comparison-time
/// affordance only.
pub(crate) struct Cell {
    key_types: Vec<FieldType>,
    data: Vec<u8>,
}

impl Cell {
    pub fn new(cell_type: CellType, key_types: Vec<FieldType>) -> Self {
        let mut data = vec![0u8; cell_size(&key_types)];
        data[0] = cell_type as u8;
        Cell { key_types, data }
    }

    pub fn from_bytes(key_types: Vec<FieldType>, data: Vec<u8>) -> Result<Self> {
        if data.len() != cell_size(&key_types) {
            return Err(Error::Corrupt(format!(
                "cell image is {} bytes, layout needs {}",
                data.len(),
                cell_size(&key_types)
            )));
        }
        CellType::from_u8(data[0])?;
        Ok(Cell { key_types, data })
    }

    pub fn cell_type(&self) -> CellType {
        CellType::from_u8(self.data[0]).expect("validated at construction")
    }

    /// The link field: child page, value unit, or next free cell.
    pub fn link(&self) -> u32 {
        BigEndian::read_u32(&self.data[1..5])
    }

    pub fn set_link(&mut self, link: u32) {
        BigEndian::write_u32(&mut self.data[1..5], link);
    }

    pub fn key(&self) -> Result<Payload> {
        Payload::new(self.key_types.clone(), self.data[CELL_HEADER..].to_vec())
    }

    pub fn set_key(&mut self, key: &Payload) -> Result<()> {
        let expected = Payload::size_of(&self.key_types);
        if key.size() != expected {
            return Err(Error::InvalidArgument(format!(
                "key image is {} bytes, cell stores {expected}",
                key.size()
            )));
        }
        self.data[CELL_HEADER..].copy_from_slice(key.data());
        Ok(())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::payload::Value;
    use anyhow::Result;

    #[test]
    fn test_cell_layout() -> Result<()> {
        let types = vec![FieldType::Int];
        assert_eq!(cell_size(&types), 5 + 5);

        let key = Payload::from_values(&types, &[Value::Int(0x0102_0304)])?;
        let mut cell = Cell::new(CellType::Leaf, types.clone());
        cell.set_link(9);
        cell.set_key(&key)?;

        assert_eq!(cell.bytes()[0], 2);
        assert_eq!(&cell.bytes()[1..5], &[0, 0, 0, 9]);
        assert_eq!(&cell.bytes()[5..], &[0, 1, 2, 3, 4]);

        let back = Cell::from_bytes(types, cell.bytes().to_vec())?;
        assert_eq!(back.cell_type(), CellType::Leaf);
        assert_eq!(back.link(), 9);
        assert_eq!(back.key()?.get(0)?, Value::Int(0x0102_0304));
        Ok(())
    }

    #[test]
    fn test_wrong_width_key_rejected() -> Result<()> {
        let wide = Payload::from_values(&[FieldType::Str(16)], &[Value::Str("a".into())])?;
        let mut cell = Cell::new(CellType::Interior, vec![FieldType::Str(8)]);
        assert!(cell.set_key(&wide).is_err());
        Ok(())
    }
}
