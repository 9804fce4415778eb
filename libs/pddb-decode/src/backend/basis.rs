use byteorder::{ByteOrder, LittleEndian};

use super::crypto::decrypt_committed_page;
use super::image::PddbImage;
use super::keys::BasisKeyPair;
use super::pagetable::BasisMap;
use crate::api::*;

/// The root record of a basis, stored at the start of virtual page 1.
///
/// Plaintext layout, after the 4-byte page journal:
/// `magic[4] | version u32 | age u32 | num_dictionaries u32 | name_len u8 | name[64]`
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct BasisRoot {
    /// journal revision of the page the root was read from
    pub journal: JournalType,
    pub magic: [u8; 4],
    pub version: u32,
    /// increments every time the BasisRoot is modified. This field saturates, it does not roll over.
    pub age: u32,
    pub num_dictionaries: u32,
    pub name: String,
}

/// Virtual address of the basis root record.
pub const BASIS_ROOT_VADDR: VirtAddr = VPAGE_SIZE as VirtAddr;
const ROOT_LEN: usize = 4 + 4 + 4 + 4 + 1 + BASIS_NAME_LEN;

impl BasisRoot {
    /// Parses a root from the plaintext of its page (journal included). Magic and version
    /// are checked here; the name is only checked for being well-formed.
    pub fn parse(pt: &[u8]) -> Result<BasisRoot> {
        if pt.len() < 4 + ROOT_LEN {
            return Err(PddbError::MalformedRecord("basis root page too short"));
        }
        let journal = LittleEndian::read_u32(&pt[0..4]);
        let rec = &pt[4..4 + ROOT_LEN];
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&rec[0..4]);
        if magic != PDDB_MAGIC {
            return Err(PddbError::MalformedRecord("basis root magic"));
        }
        let version = LittleEndian::read_u32(&rec[4..8]);
        if version != PDDB_VERSION {
            return Err(PddbError::VersionMismatch { expected: PDDB_VERSION, found: version });
        }
        let name_len = rec[16] as usize;
        if name_len > BASIS_NAME_LEN {
            return Err(PddbError::MalformedRecord("basis name length"));
        }
        let name = std::str::from_utf8(&rec[17..17 + name_len])
            .map_err(|_| PddbError::MalformedRecord("basis name is not utf-8"))?
            .to_string();
        Ok(BasisRoot {
            journal,
            magic,
            version,
            age: LittleEndian::read_u32(&rec[8..12]),
            num_dictionaries: LittleEndian::read_u32(&rec[12..16]),
            name,
        })
    }

    /// Serializes the record, journal first, in the same layout `parse` reads.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; 4 + ROOT_LEN];
        LittleEndian::write_u32(&mut out[0..4], self.journal);
        out[4..8].copy_from_slice(&self.magic);
        LittleEndian::write_u32(&mut out[8..12], self.version);
        LittleEndian::write_u32(&mut out[12..16], self.age);
        LittleEndian::write_u32(&mut out[16..20], self.num_dictionaries);
        let name = self.name.as_bytes();
        let len = name.len().min(BASIS_NAME_LEN);
        out[20] = len as u8;
        out[21..21 + len].copy_from_slice(&name[..len]);
        out
    }
}

/// Reads and authenticates the root record of a basis through its address map.
pub(crate) fn decode_basis_root(
    image: &PddbImage,
    map: &BasisMap,
    keys: &BasisKeyPair,
    aad: &[u8],
) -> Result<BasisRoot> {
    let pp = map.v2p.get(&BASIS_ROOT_VADDR).ok_or(PddbError::MissingAllocation(BASIS_ROOT_VADDR))?;
    let page = image.data_page(*pp).ok_or(PddbError::MissingAllocation(BASIS_ROOT_VADDR))?;
    let pt = decrypt_committed_page(&keys.data_key, aad, page)?;
    BasisRoot::parse(&pt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> BasisRoot {
        BasisRoot {
            journal: 3,
            magic: PDDB_MAGIC,
            version: PDDB_VERSION,
            age: 9,
            num_dictionaries: 2,
            name: ".System".to_string(),
        }
    }

    #[test]
    fn test_parse_checks_magic_and_version() {
        let good = root().to_bytes();
        assert_eq!(BasisRoot::parse(&good).unwrap(), root());

        let mut bad_magic = good.clone();
        bad_magic[4] = b'X';
        assert_eq!(BasisRoot::parse(&bad_magic), Err(PddbError::MalformedRecord("basis root magic")));

        let mut old = root();
        old.version = 0x00_00_01_01;
        assert_eq!(
            BasisRoot::parse(&old.to_bytes()),
            Err(PddbError::VersionMismatch { expected: PDDB_VERSION, found: 0x00_00_01_01 })
        );

        let mut long_name = good;
        long_name[20] = 65;
        assert!(BasisRoot::parse(&long_name).is_err());
    }
}
