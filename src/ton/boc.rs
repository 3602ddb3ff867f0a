/// Bag-of-cells deserialization and cell representation hashing.
use crate::ton::decode_base64;
use crc::{CRC_32_ISCSI, Crc};
use sha2::{Digest, Sha256};
use thiserror::Error;

const BOC_GENERIC_MAGIC: u32 = 0xb5ee_9c72;
const BOC_INDEXED_MAGIC: u32 = 0x68ff_65f3;
const BOC_INDEXED_CRC32_MAGIC: u32 = 0xacc3_a728;

const MAX_CELL_BITS: usize = 1023;
const MAX_CELL_REFS: usize = 4;
const MAX_CELL_DEPTH: u16 = 1024;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BocError {
    #[error("receipt is empty")]
    Empty,
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error("unexpected end of data while reading {0}")]
    Truncated(&'static str),
    #[error("unknown bag-of-cells magic {0:#010x}")]
    UnknownMagic(u32),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("crc32c mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    #[error("invalid cell {index}: {reason}")]
    InvalidCell { index: usize, reason: String },
    #[error("exotic cell {0} is not supported")]
    ExoticCell(usize),
}

/// Ordinary cell as stored in a bag. References are indices into the bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<usize>,
}

impl Cell {
    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    pub fn refs(&self) -> &[usize] {
        &self.refs
    }

    /// Descriptor byte pair `d1`, `d2` of the cell representation.
    fn descriptors(&self) -> [u8; 2] {
        // refs <= 4 and bit_len <= 1023, both fit in a byte
        let d1 = self.refs.len() as u8;
        let d2 = (self.bit_len / 8 + self.bit_len.div_ceil(8)) as u8;
        [d1, d2]
    }
}

/// Deserialized bag of cells.
///
/// Exactly one root and only ordinary cells are accepted; wallet transfer messages never carry
/// pruned branches, library references or merkle cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BagOfCells {
    cells: Vec<Cell>,
    root: usize,
}

impl BagOfCells {
    pub fn from_base64(encoded: &str) -> Result<Self, BocError> {
        if encoded.trim().is_empty() {
            return Err(BocError::Empty);
        }
        let bytes = decode_base64(encoded).map_err(|e| BocError::Base64(e.to_string()))?;
        Self::deserialize(&bytes)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, BocError> {
        if bytes.is_empty() {
            return Err(BocError::Empty);
        }
        let mut reader = Reader::new(bytes);
        let magic = u32::from_be_bytes(reader.array::<4>("magic")?);
        let flags = reader.u8("flags")?;
        let (has_index, has_crc32c, ref_size) = match magic {
            BOC_GENERIC_MAGIC => {
                let has_index = flags & 0x80 != 0;
                let has_cache_bits = flags & 0x20 != 0;
                if has_cache_bits && !has_index {
                    return Err(BocError::InvalidHeader(
                        "cache bits without index".to_string(),
                    ));
                }
                if flags & 0x18 != 0 {
                    return Err(BocError::InvalidHeader(format!(
                        "reserved flag bits set: {flags:#04x}"
                    )));
                }
                (has_index, flags & 0x40 != 0, usize::from(flags & 0x07))
            }
            BOC_INDEXED_MAGIC => (true, false, usize::from(flags)),
            BOC_INDEXED_CRC32_MAGIC => (true, true, usize::from(flags)),
            other => return Err(BocError::UnknownMagic(other)),
        };
        if !(1..=4).contains(&ref_size) {
            return Err(BocError::InvalidHeader(format!(
                "reference size {ref_size} out of range"
            )));
        }
        let offset_size = usize::from(reader.u8("offset size")?);
        if !(1..=8).contains(&offset_size) {
            return Err(BocError::InvalidHeader(format!(
                "offset size {offset_size} out of range"
            )));
        }

        let cell_count = reader.uint(ref_size, "cell count")?;
        let root_count = reader.uint(ref_size, "root count")?;
        let absent_count = reader.uint(ref_size, "absent count")?;
        let total_cells_size = reader.uint(offset_size, "total cells size")?;

        // a sent message is a single tree
        if root_count != 1 {
            return Err(BocError::InvalidHeader(format!(
                "expected a single root, found {root_count}"
            )));
        }
        if absent_count != 0 {
            return Err(BocError::InvalidHeader(
                "absent cells are not supported".to_string(),
            ));
        }

        let root = if magic == BOC_GENERIC_MAGIC {
            reader.uint(ref_size, "root list")?
        } else {
            0
        };
        if root >= cell_count {
            return Err(BocError::InvalidHeader(format!(
                "root index {root} out of range"
            )));
        }

        if has_index {
            let index_len = cell_count
                .checked_mul(offset_size)
                .ok_or_else(|| BocError::InvalidHeader("index size overflow".to_string()))?;
            reader.take(index_len, "cell index")?;
        }

        let cell_data = reader.take(total_cells_size, "cell data")?;

        if has_crc32c {
            let payload_len = reader.position();
            let expected = u32::from_le_bytes(reader.array::<4>("crc32c")?);
            let computed = CRC32C.checksum(&bytes[..payload_len]);
            if expected != computed {
                return Err(BocError::ChecksumMismatch { expected, computed });
            }
        }
        if !reader.is_empty() {
            return Err(BocError::InvalidHeader(format!(
                "{} trailing bytes",
                reader.remaining()
            )));
        }

        let cells = parse_cells(cell_data, cell_count, ref_size)?;
        Ok(Self { cells, root })
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Index of the root cell.
    pub fn root(&self) -> usize {
        self.root
    }

    /// Representation hash of the root cell.
    pub fn root_hash(&self) -> [u8; 32] {
        self.representation_hashes()[self.root].0
    }

    /// Hash and depth for every cell, computed children first.
    fn representation_hashes(&self) -> Vec<([u8; 32], u16)> {
        let mut computed = vec![([0u8; 32], 0u16); self.cells.len()];
        for (index, cell) in self.cells.iter().enumerate().rev() {
            let mut hasher = Sha256::new();
            hasher.update(cell.descriptors());
            hasher.update(&cell.data);
            let mut depth = 0u16;
            for &child in &cell.refs {
                let child_depth = computed[child].1;
                hasher.update(child_depth.to_be_bytes());
                depth = depth.max(child_depth.saturating_add(1));
            }
            for &child in &cell.refs {
                hasher.update(computed[child].0);
            }
            computed[index] = (hasher.finalize().into(), depth);
        }
        computed
    }
}

fn parse_cells(data: &[u8], cell_count: usize, ref_size: usize) -> Result<Vec<Cell>, BocError> {
    let mut reader = Reader::new(data);
    let mut cells = Vec::with_capacity(cell_count.min(data.len() / 2));
    for index in 0..cell_count {
        let invalid = |reason: String| BocError::InvalidCell { index, reason };

        let d1 = reader.u8("cell descriptor")?;
        let d2 = reader.u8("cell descriptor")?;
        let ref_count = usize::from(d1 & 0x07);
        let is_exotic = d1 & 0x08 != 0;
        let with_hashes = d1 & 0x10 != 0;
        let level_mask = d1 >> 5;

        if ref_count > MAX_CELL_REFS {
            return Err(invalid(format!("{ref_count} references")));
        }
        if is_exotic {
            return Err(BocError::ExoticCell(index));
        }
        if level_mask != 0 {
            return Err(invalid(format!("ordinary cell with level mask {level_mask}")));
        }
        if with_hashes {
            // one stored hash and depth for level 0
            reader.take(32 + 2, "stored cell hashes")?;
        }

        let data_len = usize::from(d2).div_ceil(2);
        let is_full = d2 % 2 == 0;
        let bytes = reader.take(data_len, "cell data")?;
        let bit_len = if is_full {
            data_len * 8
        } else {
            let last = bytes[data_len - 1];
            if last == 0 {
                return Err(invalid("missing completion tag".to_string()));
            }
            data_len * 8 - (last.trailing_zeros() as usize + 1)
        };
        if bit_len > MAX_CELL_BITS {
            return Err(invalid(format!("{bit_len} data bits")));
        }

        let mut refs = Vec::with_capacity(ref_count);
        for _ in 0..ref_count {
            let child = reader.uint(ref_size, "cell reference")?;
            if child <= index || child >= cell_count {
                return Err(invalid(format!("reference to cell {child}")));
            }
            refs.push(child);
        }

        cells.push(Cell {
            data: bytes.to_vec(),
            bit_len,
            refs,
        });
    }
    if !reader.is_empty() {
        return Err(BocError::InvalidHeader(format!(
            "{} unused bytes in cell data",
            reader.remaining()
        )));
    }
    check_depth(&cells)?;
    Ok(cells)
}

fn check_depth(cells: &[Cell]) -> Result<(), BocError> {
    let mut depths = vec![0u16; cells.len()];
    for (index, cell) in cells.iter().enumerate().rev() {
        let depth = cell
            .refs
            .iter()
            .map(|&child| depths[child].saturating_add(1))
            .max()
            .unwrap_or(0);
        if depth > MAX_CELL_DEPTH {
            return Err(BocError::InvalidCell {
                index,
                reason: format!("depth {depth} exceeds {MAX_CELL_DEPTH}"),
            });
        }
        depths[index] = depth;
    }
    Ok(())
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], BocError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(BocError::Truncated(what))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], BocError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, BocError> {
        Ok(self.take(1, what)?[0])
    }

    /// Big-endian unsigned integer of `width` bytes.
    fn uint(&mut self, width: usize, what: &'static str) -> Result<usize, BocError> {
        let value = self
            .take(width, what)?
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        usize::try_from(value)
            .map_err(|_| BocError::InvalidHeader(format!("{what} does not fit in memory")))
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}
