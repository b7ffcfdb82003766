use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::digest::{Digest, HashAlgorithm};
use crate::marshal::{self, put_tpm2b, put_u16, put_u32, put_u8, Marshal, Reader, Unmarshal};

/// A TPM object or NV index name: `nameAlg || H_nameAlg(public area)` for
/// objects and NV indices, the big-endian handle for permanent handles.
pub type Name = Vec<u8>;

/// Per bank, per PCR index digest values.
pub type PcrValues = BTreeMap<HashAlgorithm, BTreeMap<u32, Digest>>;

pub const TPM_RH_OWNER: u32 = 0x4000_0001;

/// Highest PCR index accepted anywhere in this crate
pub const MAX_PCR_INDEX: u32 = 31;

pub fn permanent_handle_name(handle: u32) -> Name {
    handle.to_be_bytes().to_vec()
}

pub fn is_nv_index(handle: u32) -> bool {
    handle >> 24 == 0x01
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandCode {
    NvIncrement = 0x0000_0134,
    NvWrite = 0x0000_0137,
    NvWriteLock = 0x0000_0138,
    NvChangeAuth = 0x0000_013b,
    NvRead = 0x0000_014e,
    PolicyNV = 0x0000_0149,
    PolicySecret = 0x0000_0151,
    Unseal = 0x0000_015e,
    PolicyAuthorize = 0x0000_016a,
    PolicyAuthValue = 0x0000_016b,
    PolicyCommandCode = 0x0000_016c,
    PolicyOR = 0x0000_0171,
    PolicyPCR = 0x0000_017f,
}

impl CommandCode {
    pub fn value(self) -> u32 {
        self as u32
    }

    pub fn to_be_bytes(self) -> [u8; 4] {
        self.value().to_be_bytes()
    }
}

/// TPM_EO comparison operators for PolicyNV
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NvOperation {
    Eq = 0x0000,
    Neq = 0x0001,
    UnsignedGt = 0x0003,
    UnsignedLt = 0x0005,
    UnsignedGe = 0x0007,
    UnsignedLe = 0x0009,
}

impl NvOperation {
    pub fn value(self) -> u16 {
        self as u16
    }

    /// Applies `a <op> b` where both are big-endian byte strings of equal length.
    pub fn compare(self, a: &[u8], b: &[u8]) -> bool {
        match self {
            NvOperation::Eq => a == b,
            NvOperation::Neq => a != b,
            NvOperation::UnsignedGt => a > b,
            NvOperation::UnsignedLt => a < b,
            NvOperation::UnsignedGe => a >= b,
            NvOperation::UnsignedLe => a <= b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvType {
    Ordinary,
    Counter,
    Bits,
    Extend,
}

impl NvType {
    fn bits(self) -> u32 {
        match self {
            NvType::Ordinary => 0x0,
            NvType::Counter => 0x1,
            NvType::Bits => 0x2,
            NvType::Extend => 0x4,
        }
    }
}

/// TPMA_NV
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct NvAttributes(pub u32);

impl NvAttributes {
    pub const OWNERWRITE: u32 = 1 << 1;
    pub const AUTHWRITE: u32 = 1 << 2;
    pub const POLICYWRITE: u32 = 1 << 3;
    pub const WRITELOCKED: u32 = 1 << 11;
    pub const WRITEDEFINE: u32 = 1 << 13;
    pub const OWNERREAD: u32 = 1 << 17;
    pub const AUTHREAD: u32 = 1 << 18;
    pub const POLICYREAD: u32 = 1 << 19;
    pub const NO_DA: u32 = 1 << 25;
    pub const READLOCKED: u32 = 1 << 28;
    pub const WRITTEN: u32 = 1 << 29;
    const TYPE_SHIFT: u32 = 4;
    const TYPE_MASK: u32 = 0xf << Self::TYPE_SHIFT;

    pub fn new(nv_type: NvType, flags: u32) -> Self {
        Self((flags & !Self::TYPE_MASK) | (nv_type.bits() << Self::TYPE_SHIFT))
    }

    pub fn nv_type(self) -> Option<NvType> {
        match (self.0 & Self::TYPE_MASK) >> Self::TYPE_SHIFT {
            0x0 => Some(NvType::Ordinary),
            0x1 => Some(NvType::Counter),
            0x2 => Some(NvType::Bits),
            0x4 => Some(NvType::Extend),
            _ => None,
        }
    }

    pub fn contains(self, flags: u32) -> bool {
        self.0 & flags == flags
    }

    pub fn with(self, flags: u32) -> Self {
        Self(self.0 | flags)
    }

    pub fn without(self, flags: u32) -> Self {
        Self(self.0 & !flags)
    }
}

impl fmt::Debug for NvAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NvAttributes({:#010x})", self.0)
    }
}

/// TPMS_NV_PUBLIC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvPublic {
    pub index: u32,
    pub name_alg: HashAlgorithm,
    pub attributes: NvAttributes,
    pub auth_policy: Digest,
    pub data_size: u16,
}

impl NvPublic {
    pub fn name(&self) -> Name {
        let mut name = self.name_alg.id().to_be_bytes().to_vec();
        name.extend(self.name_alg.hash(&[&self.to_marshalled()]));
        name
    }
}

impl Marshal for NvPublic {
    fn marshal(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.index);
        put_u16(buf, self.name_alg.id());
        put_u32(buf, self.attributes.0);
        put_tpm2b(buf, &self.auth_policy);
        put_u16(buf, self.data_size);
    }
}

impl Unmarshal for NvPublic {
    fn unmarshal(reader: &mut Reader<'_>) -> marshal::Result<Self> {
        let index = reader.u32()?;
        let name_alg = HashAlgorithm::from_id(reader.u16()?)
            .map_err(|e| marshal::MarshalError::InvalidValue(e.to_string()))?;
        Ok(Self {
            index,
            name_alg,
            attributes: NvAttributes(reader.u32()?),
            auth_policy: reader.tpm2b()?,
            data_size: reader.u16()?,
        })
    }
}

/// TPMS_PCR_SELECTION
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrSelection {
    pub alg: HashAlgorithm,
    pub indices: BTreeSet<u32>,
}

impl Marshal for PcrSelection {
    fn marshal(&self, buf: &mut Vec<u8>) {
        // PC client TPMs require at least 3 bytes of select bitmap
        let highest = self.indices.iter().next_back().copied().unwrap_or(0);
        let size = ((highest / 8) + 1).max(3) as usize;
        let mut bitmap = vec![0u8; size];
        for index in &self.indices {
            bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
        put_u16(buf, self.alg.id());
        put_u8(buf, size as u8);
        buf.extend(bitmap);
    }
}

impl Unmarshal for PcrSelection {
    fn unmarshal(reader: &mut Reader<'_>) -> marshal::Result<Self> {
        let alg = HashAlgorithm::from_id(reader.u16()?)
            .map_err(|e| marshal::MarshalError::InvalidValue(e.to_string()))?;
        let size = reader.u8()? as usize;
        let bitmap = reader.bytes(size)?;
        let indices = bitmap
            .iter()
            .enumerate()
            .flat_map(|(byte, bits)| {
                let bits = *bits;
                (0u8..8)
                    .filter(move |bit| bits & (1u8 << bit) != 0)
                    .map(move |bit| (byte * 8 + bit as usize) as u32)
            })
            .collect();
        Ok(Self { alg, indices })
    }
}

/// TPML_PCR_SELECTION, kept sorted by bank.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PcrSelectionList(Vec<PcrSelection>);

impl PcrSelectionList {
    pub fn new(mut selections: Vec<PcrSelection>) -> Self {
        selections.retain(|s| !s.indices.is_empty());
        selections.sort_by_key(|s| s.alg);
        Self(selections)
    }

    pub fn from_values(values: &PcrValues) -> Self {
        Self::new(
            values
                .iter()
                .map(|(alg, pcrs)| PcrSelection {
                    alg: *alg,
                    indices: pcrs.keys().copied().collect(),
                })
                .collect(),
        )
    }

    pub fn selections(&self) -> &[PcrSelection] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// (bank, index) pairs in the order the TPM concatenates PCR values
    pub fn slots(&self) -> impl Iterator<Item = (HashAlgorithm, u32)> + '_ {
        self.0
            .iter()
            .flat_map(|s| s.indices.iter().map(move |index| (s.alg, *index)))
    }

    /// Collects `values` in selection order; `None` if any selected PCR is missing.
    pub fn ordered_values<'a>(&self, values: &'a PcrValues) -> Option<Vec<&'a Digest>> {
        self.slots()
            .map(|(alg, index)| values.get(&alg).and_then(|bank| bank.get(&index)))
            .collect()
    }
}

impl Marshal for PcrSelectionList {
    fn marshal(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.0.len() as u32);
        for selection in &self.0 {
            selection.marshal(buf);
        }
    }
}

impl Unmarshal for PcrSelectionList {
    fn unmarshal(reader: &mut Reader<'_>) -> marshal::Result<Self> {
        let count = reader.u32()?;
        let selections = (0..count)
            .map(|_| reader.read())
            .collect::<marshal::Result<Vec<PcrSelection>>>()?;
        Ok(Self::new(selections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn selection_bitmap_layout() {
        let selection = PcrSelectionList::new(vec![PcrSelection {
            alg: HashAlgorithm::Sha256,
            indices: [0, 7, 8].into_iter().collect(),
        }]);
        assert_eq!(
            selection.to_marshalled(),
            vec![0, 0, 0, 1, 0x00, 0x0b, 3, 0b1000_0001, 0b0000_0001, 0]
        );
    }

    #[test]
    fn selection_sorted_by_bank() -> Result<()> {
        let selection = PcrSelectionList::new(vec![
            PcrSelection {
                alg: HashAlgorithm::Sha256,
                indices: [7].into_iter().collect(),
            },
            PcrSelection {
                alg: HashAlgorithm::Sha1,
                indices: [4, 7].into_iter().collect(),
            },
        ]);
        let slots: Vec<_> = selection.slots().collect();
        assert_eq!(
            slots,
            vec![
                (HashAlgorithm::Sha1, 4),
                (HashAlgorithm::Sha1, 7),
                (HashAlgorithm::Sha256, 7)
            ]
        );
        let bytes = selection.to_marshalled();
        let mut reader = Reader::new(&bytes);
        assert_eq!(reader.read::<PcrSelectionList>()?, selection);
        reader.finish()?;
        Ok(())
    }

    #[test]
    fn nv_name_tracks_attributes() {
        let public = NvPublic {
            index: 0x0180_1100,
            name_alg: HashAlgorithm::Sha256,
            attributes: NvAttributes::new(NvType::Ordinary, NvAttributes::AUTHREAD),
            auth_policy: vec![],
            data_size: 1,
        };
        let name = public.name();
        assert_eq!(&name[..2], &[0x00, 0x0b]);
        assert_eq!(name.len(), 34);

        let written = NvPublic {
            attributes: public.attributes.with(NvAttributes::WRITTEN),
            ..public
        };
        assert_ne!(written.name(), name);
    }

    #[test]
    fn attribute_type_field() {
        let attrs = NvAttributes::new(NvType::Counter, NvAttributes::OWNERWRITE);
        assert_eq!(attrs.nv_type(), Some(NvType::Counter));
        assert!(attrs.contains(NvAttributes::OWNERWRITE));
        assert!(!attrs.contains(NvAttributes::AUTHWRITE));
    }
}
