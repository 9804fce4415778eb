use bitfield::bitfield;
use byteorder::{ByteOrder, LittleEndian};

use super::murmur3::murmur3_32;
use crate::api::*;

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct KeyFlags(u32);
    impl Debug;
    /// set if the entry is valid -- an invalid entry means it was previously allocated but then deleted
    pub valid, set_valid: 0;
    /// the "start" address wasn't fully resolved when the descriptor was written
    pub unresolved, set_unresolved: 1;
}
impl KeyFlags {
    pub fn from_bits(bits: u32) -> KeyFlags { KeyFlags(bits) }

    pub fn bits(&self) -> u32 { self.0 }
}

/// On-disk representation of a key, one per 127-byte descriptor slot.
///
/// `start u64 | len u64 | reserved u64 | flags u32 | age u32 | name_len u8 | name[94]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescriptor {
    /// virtual address of the key's start
    pub start: u64,
    /// length of the key's stored data
    pub len: u64,
    /// amount of space reserved for the key. Must be >= len.
    pub reserved: u64,
    pub flags: KeyFlags,
    /// Access count to the key
    pub age: u32,
    pub name: String,
}

impl KeyDescriptor {
    /// Returns `Ok(None)` for a slot whose valid flag is clear. A slot that claims to be valid
    /// but cannot be parsed is an error.
    pub fn parse(slot: &[u8]) -> Result<Option<KeyDescriptor>> {
        if slot.len() < DK_STRIDE {
            return Err(PddbError::MalformedRecord("key descriptor slot too short"));
        }
        let flags = KeyFlags(LittleEndian::read_u32(&slot[24..28]));
        if !flags.valid() {
            return Ok(None);
        }
        let name_len = slot[32] as usize;
        if name_len > KEY_NAME_LEN - 1 {
            return Err(PddbError::MalformedRecord("key name length"));
        }
        let name = std::str::from_utf8(&slot[33..33 + name_len])
            .map_err(|_| PddbError::MalformedRecord("key name is not utf-8"))?
            .to_string();
        Ok(Some(KeyDescriptor {
            start: LittleEndian::read_u64(&slot[0..8]),
            len: LittleEndian::read_u64(&slot[8..16]),
            reserved: LittleEndian::read_u64(&slot[16..24]),
            flags,
            age: LittleEndian::read_u32(&slot[28..32]),
            name,
        }))
    }

    pub fn to_bytes(&self) -> [u8; DK_STRIDE] {
        let mut slot = [0u8; DK_STRIDE];
        LittleEndian::write_u64(&mut slot[0..8], self.start);
        LittleEndian::write_u64(&mut slot[8..16], self.len);
        LittleEndian::write_u64(&mut slot[16..24], self.reserved);
        LittleEndian::write_u32(&mut slot[24..28], self.flags.bits());
        LittleEndian::write_u32(&mut slot[28..32], self.age);
        let name = self.name.as_bytes();
        let len = name.len().min(KEY_NAME_LEN - 1);
        slot[32] = len as u8;
        slot[33..33 + len].copy_from_slice(&name[..len]);
        slot
    }
}

/// True if the last four bytes of `data` are the murmur3 (seed 0) of everything before them.
/// Keys written by the self-test harness carry this trailer; the harness pads the body out
/// to a whole number of words with zeros before hashing, so both forms are accepted.
pub fn check_trailer(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    let (body, trailer) = data.split_at(data.len() - 4);
    let expected = LittleEndian::read_u32(trailer);
    if murmur3_32(body, 0) == expected {
        return true;
    }
    if body.len() % 4 == 0 {
        return false;
    }
    let mut padded = body.to_vec();
    while padded.len() % 4 != 0 {
        padded.push(0);
    }
    murmur3_32(&padded, 0) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_layout() {
        let mut flags = KeyFlags(0);
        flags.set_valid(true);
        let desc = KeyDescriptor {
            start: SMALL_POOL_START + 0x40,
            len: 12,
            reserved: 64,
            flags,
            age: 2,
            name: "wifi.ssid".to_string(),
        };
        let slot = desc.to_bytes();
        assert_eq!(slot[24], 1);
        assert_eq!(slot[32], 9);
        assert_eq!(KeyDescriptor::parse(&slot).unwrap(), Some(desc));

        let mut deleted = slot;
        deleted[24] = 0;
        assert_eq!(KeyDescriptor::parse(&deleted).unwrap(), None);

        let mut bad_name = slot;
        bad_name[32] = 95;
        assert!(KeyDescriptor::parse(&bad_name).is_err());
    }

    #[test]
    fn test_trailer() {
        let mut data = b"some key payload".to_vec();
        let checksum = murmur3_32(&data, 0);
        data.extend_from_slice(&checksum.to_le_bytes());
        assert!(check_trailer(&data));
        data[0] ^= 1;
        assert!(!check_trailer(&data));
        assert!(!check_trailer(&[1, 2, 3]));

        let mut harness = b"odd length".to_vec();
        let mut padded = harness.clone();
        padded.extend_from_slice(&[0, 0]);
        let checksum = murmur3_32(&padded, 0);
        harness.extend_from_slice(&checksum.to_le_bytes());
        assert!(check_trailer(&harness));
        // four bytes of zero: murmur3 of the empty slice is 0
        assert!(check_trailer(&[0, 0, 0, 0]));
    }
}
