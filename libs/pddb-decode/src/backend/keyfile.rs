//! Key export files let a debugging session skip the bcrypt step entirely.
//!
//! Layout: a `u32` LE count, followed by `count` records. Each record starts with a 64-byte
//! null-padded basis name. Single-key records follow it with one 32-byte key that serves as
//! both the page table and data key; full records carry the page table key and then the data key.

use zeroize::Zeroizing;

use super::keys::{BasisKeyPair, BasisKeyring};
use crate::api::*;

const NAME_FIELD: usize = BASIS_NAME_LEN;
const SINGLE_RECORD: usize = NAME_FIELD + 32;
const FULL_RECORD: usize = NAME_FIELD + 32 + 32;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeyFileMode {
    /// one key per basis, used for both the page table and the data
    SingleKey,
    /// separate page table and data keys
    FullFidelity,
}

fn parse_name(field: &[u8]) -> Result<BasisName> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let name = std::str::from_utf8(&field[..end]).map_err(|_| PddbError::MalformedRecord("key file basis name"))?;
    BasisName::new(name)
}

pub fn parse_keyfile(raw: &[u8]) -> Result<(BasisKeyring, KeyFileMode)> {
    if raw.len() < 4 {
        return Err(PddbError::MalformedRecord("key file too short"));
    }
    let count = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let body = &raw[4..];
    let mode = if count == 0 {
        if !body.is_empty() {
            return Err(PddbError::MalformedRecord("key file has trailing data"));
        }
        KeyFileMode::FullFidelity
    } else if body.len() == count * FULL_RECORD {
        KeyFileMode::FullFidelity
    } else if body.len() == count * SINGLE_RECORD {
        KeyFileMode::SingleKey
    } else {
        return Err(PddbError::MalformedRecord("key file length does not match its record count"));
    };
    let record_len = match mode {
        KeyFileMode::SingleKey => SINGLE_RECORD,
        KeyFileMode::FullFidelity => FULL_RECORD,
    };

    let mut ring = BasisKeyring::new();
    for record in body.chunks_exact(record_len) {
        let name = parse_name(&record[..NAME_FIELD])?;
        let mut keys = BasisKeyPair { page_table_key: [0u8; 32], data_key: [0u8; 32] };
        keys.page_table_key.copy_from_slice(&record[NAME_FIELD..NAME_FIELD + 32]);
        match mode {
            KeyFileMode::SingleKey => keys.data_key = keys.page_table_key,
            KeyFileMode::FullFidelity => keys.data_key.copy_from_slice(&record[NAME_FIELD + 32..]),
        }
        log::debug!("key file: loaded keys for basis {}", name);
        ring.insert(name, keys);
    }
    Ok((ring, mode))
}

/// Serializes `ring`. `SingleKey` mode only stores the data key, so it is only lossless when
/// each basis uses one key for both roles.
pub fn encode_keyfile(ring: &BasisKeyring, mode: KeyFileMode) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::new());
    out.extend_from_slice(&(ring.len() as u32).to_le_bytes());
    for (name, keys) in ring.iter() {
        out.extend_from_slice(&name.padded());
        match mode {
            KeyFileMode::SingleKey => out.extend_from_slice(&keys.data_key),
            KeyFileMode::FullFidelity => {
                out.extend_from_slice(&keys.page_table_key);
                out.extend_from_slice(&keys.data_key);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_length() {
        let mut ring = BasisKeyring::new();
        ring.insert(BasisName::system(), BasisKeyPair { page_table_key: [1; 32], data_key: [2; 32] });
        ring.insert(BasisName::new("hidden").unwrap(), BasisKeyPair { page_table_key: [3; 32], data_key: [4; 32] });

        let full = encode_keyfile(&ring, KeyFileMode::FullFidelity);
        assert_eq!(full.len(), 4 + 2 * FULL_RECORD);
        let (parsed, mode) = parse_keyfile(&full).unwrap();
        assert_eq!(mode, KeyFileMode::FullFidelity);
        assert_eq!(parsed.get(&BasisName::new("hidden").unwrap()).unwrap().page_table_key, [3; 32]);

        let single = encode_keyfile(&ring, KeyFileMode::SingleKey);
        let (parsed, mode) = parse_keyfile(&single).unwrap();
        assert_eq!(mode, KeyFileMode::SingleKey);
        let sys = parsed.system().unwrap();
        assert_eq!(sys.page_table_key, [2; 32]);
        assert_eq!(sys.data_key, [2; 32]);
    }

    #[test]
    fn test_rejects_bad_lengths() {
        let mut raw = 1u32.to_le_bytes().to_vec();
        raw.extend_from_slice(&[0u8; 100]);
        assert!(parse_keyfile(&raw).is_err());
        assert!(parse_keyfile(&[1, 0]).is_err());
        // an empty name is not a basis
        let mut raw = 1u32.to_le_bytes().to_vec();
        raw.extend_from_slice(&[0u8; SINGLE_RECORD]);
        assert_eq!(parse_keyfile(&raw).err(), Some(PddbError::InvalidName(String::new())));
    }
}
