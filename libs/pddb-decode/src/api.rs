use std::fmt;

pub const PAGE_SIZE: usize = 4096;
/// Journal revision stored in the first bytes of every page plaintext.
pub type JournalType = u32;
pub type VirtAddr = u64;

pub const AEAD_NONCE_LEN: usize = 12;
pub const AEAD_TAG_LEN: usize = 16;
pub const KCOM_NONCE_LEN: usize = 32;
pub const KCOM_LEN: usize = 32;
/// Plaintext carried by a committed page: the journal revision plus one VPAGE of data.
pub const KCOM_PT_LEN: usize = PAGE_SIZE - AEAD_NONCE_LEN - AEAD_TAG_LEN - KCOM_NONCE_LEN - KCOM_LEN;
/// A VPAGE is what is left of a PAGE once the nonce, tag, journal and key commitment are
/// accounted for: 4096 - 12 - 16 - 4 - 64 = 4000 bytes. Images laid out around a 4064-byte
/// VPAGE don't decode with this geometry.
pub const VPAGE_SIZE: usize = KCOM_PT_LEN - core::mem::size_of::<JournalType>();

/// Length of the basis name payload (the on-disk field has one more byte for the length).
pub const BASIS_NAME_LEN: usize = 64;
pub const DICT_NAME_LEN: usize = 127 - 4 - 4 - 4 - 4; // u32: flags, age, num_keys, free index = 111
pub const KEY_NAME_LEN: usize = 127 - 8 - 8 - 8 - 4 - 4; // u64: vaddr/len/resvd, u32: flags, age = 95
/// Longest password consumed by bcrypt; one more byte is used for the null terminator.
pub const PASSWORD_LEN: usize = 72;

/// Dictionary and key descriptors are packed at a 127-byte stride within a VPAGE
pub const DK_STRIDE: usize = 127;
pub const DK_PER_VPAGE: usize = VPAGE_SIZE / DK_STRIDE;
/// Each dictionary owns 4096 VPAGEs of index space.
pub const DICT_VSIZE: u64 = VPAGE_SIZE as u64 * 0x1000;
pub const DICT_MAXCOUNT: u32 = 16384;
pub const KEY_MAXCOUNT: usize = (DICT_VSIZE as usize / VPAGE_SIZE) * DK_PER_VPAGE;

/// Key data pool boundaries, in basis virtual space.
pub const SMALL_POOL_START: u64 = 0x0000_0040_0000_0000;
pub const MEDIUM_POOL_START: u64 = 0x0000_0080_0000_0000;
pub const LARGE_POOL_START: u64 = 0x0000_0100_0000_0000;

pub const PDDB_MAGIC: [u8; 4] = [0x50, 0x44, 0x44, 0x42];
/// 00.00.02.01 - hkdf on basis key derivation, separate page table/data keys
pub const PDDB_VERSION: u32 = 0x00_00_02_01;
/// Version of the key page (`StaticCryptoData`) inside the image.
pub const SCD_VERSION: u32 = 2;

pub const PDDB_DEFAULT_SYSTEM_BASIS: &str = ".System";
// this isn't an "official" basis, but it is used for the AAD for encrypting the FastSpace structure
pub const PDDB_FAST_SPACE_SYSTEM_BASIS: &str = ".FastSpace";

// 10 is the minimum recommended by OWASP; the device runs 7 so that unlock stays under a second
pub const BCRYPT_COST: u32 = 7;

pub const MBBB_PAGES: usize = 10;
pub const FSCB_PAGES: usize = 16;
pub const FASTSPACE_PAGES: usize = 2;

/// Errors surfaced by the decode engine. Everything the format can do wrong maps to one of
/// these; the report layer decides whether a given occurrence is fatal, a failure or a warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PddbError {
    /// AEAD tag or key-wrap integrity check failed. Usually a wrong password.
    AuthFailure,
    /// The page decrypts under the AEAD, but the key commitment belongs to another key.
    CommitMismatch,
    /// No physical page backs the requested virtual address.
    MissingAllocation(VirtAddr),
    /// A structure decoded but its contents are out of range or unparseable.
    MalformedRecord(&'static str),
    VersionMismatch { expected: u32, found: u32 },
    /// More than one page in the make-before-break buffer holds data.
    MbbbConflict(usize),
    /// A wrapped key blob has the wrong shape to be unwrapped at all.
    KeyWrap,
    InvalidName(String),
}

impl fmt::Display for PddbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PddbError::AuthFailure => write!(f, "authentication failure"),
            PddbError::CommitMismatch => write!(f, "key commitment mismatch"),
            PddbError::MissingAllocation(va) => write!(f, "no physical page allocated for va {:x}", va),
            PddbError::MalformedRecord(what) => write!(f, "malformed record: {}", what),
            PddbError::VersionMismatch { expected, found } => {
                write!(f, "version mismatch: expected {:08x}, found {:08x}", expected, found)
            }
            PddbError::MbbbConflict(count) => {
                write!(f, "found {} MBBB candidates, at most one is allowed", count)
            }
            PddbError::KeyWrap => write!(f, "wrapped key has an invalid length"),
            PddbError::InvalidName(name) => write!(f, "invalid basis name: {:?}", name),
        }
    }
}

impl std::error::Error for PddbError {}

pub type Result<T> = core::result::Result<T, PddbError>;

/// A basis name as typed in by the user. Names are never recorded on disk outside of the
/// basis' own encrypted root record, so this is the only handle we have on a basis.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BasisName(String);

impl BasisName {
    pub fn new(name: &str) -> Result<BasisName> {
        if name.is_empty()
            || name.len() > BASIS_NAME_LEN
            || name.contains('\0')
            || name.contains(':')
        {
            Err(PddbError::InvalidName(name.to_string()))
        } else {
            Ok(BasisName(name.to_string()))
        }
    }

    pub fn system() -> BasisName { BasisName(PDDB_DEFAULT_SYSTEM_BASIS.to_string()) }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn is_system(&self) -> bool { self.0 == PDDB_DEFAULT_SYSTEM_BASIS }

    /// The name zero-padded out to the full field width, as fed to the salt derivation.
    pub fn padded(&self) -> [u8; BASIS_NAME_LEN] {
        let mut padded = [0u8; BASIS_NAME_LEN];
        for (&src, dst) in self.0.as_bytes().iter().zip(padded.iter_mut()) {
            *dst = src;
        }
        padded
    }
}

impl fmt::Display for BasisName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl std::str::FromStr for BasisName {
    type Err = PddbError;

    fn from_str(s: &str) -> Result<BasisName> { BasisName::new(s) }
}

/// AAD for basis, dictionary and key pages: basis name, format version, device DNA.
pub fn basis_aad(name: &str, dna: u64) -> Vec<u8> {
    let mut aad = Vec::<u8>::new();
    aad.extend_from_slice(name.as_bytes());
    aad.extend_from_slice(&PDDB_VERSION.to_le_bytes());
    aad.extend_from_slice(&dna.to_le_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_geometry() {
        assert!(PAGE_SIZE & (PAGE_SIZE - 1) == 0, "PAGE_SIZE is not a power of two!");
        assert_eq!(VPAGE_SIZE, 4000);
        assert_eq!(DK_PER_VPAGE, 31);
        // a 4064-byte VPAGE plus journal doesn't fit next to the key commitment
        assert!(KCOM_PT_LEN < 4064 + core::mem::size_of::<JournalType>());
        assert_eq!(VPAGE_SIZE + core::mem::size_of::<JournalType>(), KCOM_PT_LEN);
        assert!(DK_PER_VPAGE * DK_STRIDE <= VPAGE_SIZE);
        // the whole dictionary region has to stay below the key data pools
        assert!(DICT_VSIZE * (DICT_MAXCOUNT as u64 + 1) <= SMALL_POOL_START);
    }

    #[test]
    fn test_basis_name_bounds() {
        assert!(BasisName::new("").is_err());
        assert!(BasisName::new("a:b").is_err());
        assert!(BasisName::new(&"x".repeat(BASIS_NAME_LEN)).is_ok());
        assert!(BasisName::new(&"x".repeat(BASIS_NAME_LEN + 1)).is_err());
        let name = BasisName::new("secret").unwrap();
        assert_eq!(&name.padded()[..6], b"secret");
        assert!(name.padded()[6..].iter().all(|&b| b == 0));
        assert!(BasisName::system().is_system());
    }

    #[test]
    fn test_aad_layout() {
        let aad = basis_aad(".System", 0x0102_0304_0506_0708);
        assert_eq!(&aad[..7], b".System");
        assert_eq!(&aad[7..11], &PDDB_VERSION.to_le_bytes());
        assert_eq!(&aad[11..], &[8, 7, 6, 5, 4, 3, 2, 1]);
    }
}
