use std::fmt;

use aes_kw::KekAes256;
use digest::Digest;
use hkdf::Hkdf;
use sha2::{Sha256, Sha512_256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::bcrypt::bcrypt;
use crate::api::*;

/// Wrapped AES-256 keys are 40 bytes: RFC 5649 adds one 64-bit block.
pub const WRAPPED_AES_KEYSIZE: usize = 40;

pub(crate) struct KeyRomLocs {}
#[allow(dead_code)]
impl KeyRomLocs {
    pub(crate) const FPGA_KEY: u8 = 0x00;
    pub(crate) const SELFSIGN_PRIVKEY: u8 = 0x08;
    pub(crate) const SELFSIGN_PUBKEY: u8 = 0x10;
    pub(crate) const DEVELOPER_PUBKEY: u8 = 0x18;
    pub(crate) const THIRDPARTY_PUBKEY: u8 = 0x20;
    pub(crate) const USER_KEY: u8 = 0x28;
    pub(crate) const PEPPER: u8 = 0xf8;
    pub(crate) const FPGA_MIN_REV: u8 = 0xfc;
    pub(crate) const LOADER_MIN_REV: u8 = 0xfd;
    pub(crate) const GLOBAL_ROLLBACK: u8 = 0xfe;
    pub(crate) const CONFIG: u8 = 0xff;
}

/// Salt tweak applied to the pepper for the boot password (`PasswordType::Boot`).
const PASSWORD_TYPE_BOOT: u8 = 1;

/// A dump of the device KEYROM: 256 words, stored little-endian in the dump file.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyRom {
    words: [u32; 256],
}
impl KeyRom {
    pub const LEN: usize = 256 * 4;

    pub fn from_bytes(raw: &[u8]) -> Result<KeyRom> {
        if raw.len() != KeyRom::LEN {
            return Err(PddbError::MalformedRecord("KEYROM dump must be exactly 1024 bytes"));
        }
        let mut words = [0u32; 256];
        for (src, dst) in raw.chunks_exact(4).zip(words.iter_mut()) {
            *dst = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        }
        Ok(KeyRom { words })
    }

    #[cfg(test)]
    pub(crate) fn from_words(words: [u32; 256]) -> KeyRom { KeyRom { words } }

    /// Reads a 256-bit key at a given index offset
    fn read_key_256(&self, index: u8) -> [u8; 32] {
        let mut key: [u8; 32] = [0; 32];
        for (addr, word) in key.chunks_mut(4).enumerate() {
            let keyword = self.words[index as usize + addr];
            for (&byte, dst) in keyword.to_be_bytes().iter().zip(word.iter_mut()) {
                *dst = byte;
            }
        }
        key
    }

    /// Reads a 128-bit key at a given index offset
    fn read_key_128(&self, index: u8) -> [u8; 16] {
        let mut key: [u8; 16] = [0; 16];
        for (addr, word) in key.chunks_mut(4).enumerate() {
            let keyword = self.words[index as usize + addr];
            for (&byte, dst) in keyword.to_be_bytes().iter().zip(word.iter_mut()) {
                *dst = byte;
            }
        }
        key
    }

    pub fn rollback_counter(&self) -> u8 { (self.words[KeyRomLocs::GLOBAL_ROLLBACK as usize] & 0xFF) as u8 }
}

/// The key page stored in the image between the page table and the MBBB.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StaticCryptoData {
    pub version: u32,
    /// aes-256 key of the system basis page table, wrapped with the rolled user key
    pub system_key_pt: [u8; WRAPPED_AES_KEYSIZE],
    /// aes-256 key of the system basis data, wrapped the same way
    pub system_key: [u8; WRAPPED_AES_KEYSIZE],
    /// a pool of fixed data used to pick salts, based on a hash of the basis name
    pub salt_base: Vec<u8>,
}
impl StaticCryptoData {
    pub fn from_page(page: &[u8]) -> Result<StaticCryptoData> {
        if page.len() != PAGE_SIZE {
            return Err(PddbError::MalformedRecord("key page is not one PAGE long"));
        }
        let version = u32::from_le_bytes([page[0], page[1], page[2], page[3]]);
        if version != SCD_VERSION {
            return Err(PddbError::VersionMismatch { expected: SCD_VERSION, found: version });
        }
        let mut system_key_pt = [0u8; WRAPPED_AES_KEYSIZE];
        system_key_pt.copy_from_slice(&page[4..4 + WRAPPED_AES_KEYSIZE]);
        let mut system_key = [0u8; WRAPPED_AES_KEYSIZE];
        system_key.copy_from_slice(&page[4 + WRAPPED_AES_KEYSIZE..4 + 2 * WRAPPED_AES_KEYSIZE]);
        Ok(StaticCryptoData {
            version,
            system_key_pt,
            system_key,
            salt_base: page[4 + 2 * WRAPPED_AES_KEYSIZE..].to_vec(),
        })
    }
}

/// Keys for one basis. Page table entries are encrypted with `page_table_key`; data pages are
/// committed to `data_key`.
#[derive(Zeroize, ZeroizeOnDrop, Clone, PartialEq, Eq)]
pub struct BasisKeyPair {
    pub page_table_key: [u8; 32],
    pub data_key: [u8; 32],
}
impl fmt::Debug for BasisKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("BasisKeyPair { .. }") }
}

/// Basis keys in decode order. The System basis, when present, always comes first.
#[derive(Default, Debug)]
pub struct BasisKeyring {
    entries: Vec<(BasisName, BasisKeyPair)>,
}
impl BasisKeyring {
    pub fn new() -> BasisKeyring { BasisKeyring::default() }

    /// Adds keys for `name`, replacing any keys already held for it.
    pub fn insert(&mut self, name: BasisName, keys: BasisKeyPair) {
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = keys;
        } else if name.is_system() {
            self.entries.insert(0, (name, keys));
        } else {
            self.entries.push((name, keys));
        }
    }

    pub fn get(&self, name: &BasisName) -> Option<&BasisKeyPair> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, k)| k)
    }

    pub fn system(&self) -> Option<&BasisKeyPair> { self.get(&BasisName::system()) }

    pub fn iter(&self) -> impl Iterator<Item = (&BasisName, &BasisKeyPair)> {
        self.entries.iter().map(|(n, k)| (n, k))
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

/// Everything needed to turn passwords into basis keys: the KEYROM of the device the image
/// came from, plus the key page inside the image.
pub struct KeyMaterial {
    keyrom: KeyRom,
    scd: StaticCryptoData,
}

fn null_terminated(pw: &str) -> Zeroizing<Vec<u8>> {
    let bytes = pw.as_bytes();
    let mut buf = Zeroizing::new(Vec::with_capacity(PASSWORD_LEN + 1));
    buf.extend_from_slice(&bytes[..bytes.len().min(PASSWORD_LEN)]);
    buf.push(0);
    buf
}

fn unwrap_key(kek: &KekAes256, wrapped: &[u8]) -> Result<[u8; 32]> {
    let key = Zeroizing::new(kek.unwrap_with_padding_vec(wrapped).map_err(|e| match e {
        aes_kw::Error::IntegrityCheckFailed => PddbError::AuthFailure,
        _ => PddbError::KeyWrap,
    })?);
    if key.len() != 32 {
        return Err(PddbError::KeyWrap);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&key);
    Ok(out)
}

impl KeyMaterial {
    pub fn new(keyrom: KeyRom, key_page: &[u8]) -> Result<KeyMaterial> {
        Ok(KeyMaterial { keyrom, scd: StaticCryptoData::from_page(key_page)? })
    }

    /// The 256-bit key-encryption key for the System basis: the boot password is bcrypt'd
    /// against the pepper, expanded, XOR'd with the user key and rolled forward to match
    /// the device's rollback counter.
    fn system_kek(&self, boot_password: &str) -> Zeroizing<[u8; 32]> {
        let mut salt = self.keyrom.read_key_128(KeyRomLocs::PEPPER);
        // we change the salt ever-so-slightly for every password type
        salt[0] ^= PASSWORD_TYPE_BOOT;
        let pw = null_terminated(boot_password);
        let mut hashed_password = Zeroizing::new([0u8; 24]);
        bcrypt(BCRYPT_COST, &salt, &pw, &mut hashed_password);

        let mut hasher = Sha512_256::new();
        hasher.update(&hashed_password[..]);
        let digest = hasher.finalize();

        let mut key = Zeroizing::new(self.keyrom.read_key_256(KeyRomLocs::USER_KEY));
        for (dst, &src) in key.iter_mut().zip(digest.iter()) {
            *dst ^= src;
        }
        let rollback_limit = 255 - self.keyrom.rollback_counter() as u32;
        log::debug!("rolling user key forward {} times", rollback_limit);
        for _ in 0..rollback_limit {
            let mut hasher = Sha512_256::new();
            hasher.update(&key[..]);
            key.copy_from_slice(hasher.finalize().as_slice());
        }
        key
    }

    /// Recovers the System basis keys. `AuthFailure` here almost always means the boot
    /// password is wrong.
    pub fn system_keys(&self, boot_password: &str) -> Result<BasisKeyPair> {
        let kek_bytes = self.system_kek(boot_password);
        let kek = KekAes256::from(*kek_bytes);
        let page_table_key = unwrap_key(&kek, &self.scd.system_key_pt)?;
        let data_key = unwrap_key(&kek, &self.scd.system_key)?;
        Ok(BasisKeyPair { page_table_key, data_key })
    }

    /// Derives the keys for a named (secret) basis. Any name/passphrase pair yields a key pair;
    /// whether a basis actually exists under it is only known once its pages are decoded.
    pub fn basis_keys(&self, name: &BasisName, passphrase: &str) -> Result<BasisKeyPair> {
        let pw = null_terminated(passphrase);
        let mut hasher = Sha512_256::new();
        hasher.update(&self.scd.salt_base[32..]);
        hasher.update(name.padded());
        hasher.update(&pw[..]);
        let digest = hasher.finalize();
        let mut salt = [0u8; 16];
        salt.copy_from_slice(&digest[..16]);

        let mut hashed_password = Zeroizing::new([0u8; 24]);
        bcrypt(BCRYPT_COST, &salt, &pw, &mut hashed_password);

        let hk = Hkdf::<Sha256>::new(None, &hashed_password[..]);
        let mut keys = BasisKeyPair { page_table_key: [0u8; 32], data_key: [0u8; 32] };
        hk.expand(b"pddb page table key", &mut keys.page_table_key)
            .map_err(|_| PddbError::MalformedRecord("HKDF output length"))?;
        hk.expand(b"pddb data key", &mut keys.data_key)
            .map_err(|_| PddbError::MalformedRecord("HKDF output length"))?;
        Ok(keys)
    }
}
