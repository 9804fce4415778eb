//! Builds encrypted PDDB images in memory for the decoder tests.

use std::collections::BTreeMap;

use aes_kw::{Kek, KekAes256};
use digest::Digest;
use rand::{Rng, RngCore};
use sha2::Sha512_256;

use crate::api::*;
use crate::backend::*;

pub(crate) const TEST_PAGES: usize = 128;
/// Small enough that key derivation tests still roll the user key forward.
const TEST_ROLLBACK: u32 = 253;

pub(crate) fn random_keys() -> BasisKeyPair {
    let mut rng = rand::thread_rng();
    let mut keys = BasisKeyPair { page_table_key: [0u8; 32], data_key: [0u8; 32] };
    rng.fill_bytes(&mut keys.page_table_key);
    rng.fill_bytes(&mut keys.data_key);
    keys
}

/// Key payload ending in a self-check trailer.
pub(crate) fn checked_data(len: usize, seed: u8) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len - 4).map(|i| seed.wrapping_add(i as u8)).collect();
    let checksum = murmur3_32(&data, 0);
    data.extend_from_slice(&checksum.to_le_bytes());
    data
}

/// The virtual-space contents of one basis, assembled before anything is encrypted.
#[derive(Default)]
pub(crate) struct BasisContent {
    vpages: BTreeMap<VirtAddr, Vec<u8>>,
    small_alloc: u64,
    large_alloc: u64,
}
impl BasisContent {
    pub(crate) fn write_virt(&mut self, va: VirtAddr, bytes: &[u8]) {
        let mut addr = va;
        let mut rest = bytes;
        while !rest.is_empty() {
            let vpage = (addr / VPAGE_SIZE as u64) * VPAGE_SIZE as u64;
            let offset = (addr - vpage) as usize;
            let take = (VPAGE_SIZE - offset).min(rest.len());
            let page = self.vpages.entry(vpage).or_insert_with(|| vec![0u8; VPAGE_SIZE]);
            page[offset..offset + take].copy_from_slice(&rest[..take]);
            addr += take as u64;
            rest = &rest[take..];
        }
    }

    pub(crate) fn set_root(&mut self, name: &str, age: u32, num_dictionaries: u32) {
        let root = BasisRoot {
            journal: 0,
            magic: PDDB_MAGIC,
            version: PDDB_VERSION,
            age,
            num_dictionaries,
            name: name.to_string(),
        };
        self.write_virt(BASIS_ROOT_VADDR, &root.to_bytes()[4..]);
    }

    pub(crate) fn set_dict_header(&mut self, index: u32, name: &str, valid: bool, num_keys: u32) {
        let mut flags = DictFlags::from_bits(0);
        flags.set_valid(valid);
        let dict = Dictionary { flags, age: 1, num_keys, free_key_index: num_keys + 1, name: name.to_string() };
        self.write_virt(self.slot_vaddr(index, 0), &dict.to_bytes());
    }

    fn slot_vaddr(&self, index: u32, slot: usize) -> VirtAddr {
        let index = std::num::NonZeroU32::new(index).unwrap();
        dict_indices_to_vaddr(index, slot) + (dict_slot_offset(slot) - 4) as u64
    }

    /// Places `data` in the small pool if it fits in a VPAGE, else in the large pool.
    pub(crate) fn alloc_data(&mut self, data: &[u8]) -> (VirtAddr, u64) {
        if data.len() <= VPAGE_SIZE / 2 {
            let start = SMALL_POOL_START + self.small_alloc;
            let reserved = ((data.len() as u64 + 31) / 32) * 32;
            self.small_alloc += reserved.max(32);
            (start, reserved)
        } else {
            let start = LARGE_POOL_START + self.large_alloc;
            let reserved = ((data.len() + VPAGE_SIZE - 1) / VPAGE_SIZE * VPAGE_SIZE) as u64;
            self.large_alloc += reserved;
            (start, reserved)
        }
    }

    pub(crate) fn set_key(&mut self, index: u32, slot: usize, desc: &KeyDescriptor) {
        self.write_virt(self.slot_vaddr(index, slot), &desc.to_bytes());
    }

    /// A valid dictionary at `index` holding `keys` in slots 1.., with their data allocated.
    pub(crate) fn add_dict(&mut self, index: u32, name: &str, keys: &[(&str, Vec<u8>)]) {
        self.set_dict_header(index, name, true, keys.len() as u32);
        for (i, (key_name, data)) in keys.iter().enumerate() {
            let (start, reserved) = self.alloc_data(data);
            self.write_virt(start, data);
            let mut flags = KeyFlags::from_bits(0);
            flags.set_valid(true);
            let desc = KeyDescriptor {
                start,
                len: data.len() as u64,
                reserved,
                flags,
                age: 0,
                name: key_name.to_string(),
            };
            self.set_key(index, i + 1, &desc);
        }
    }
}

pub(crate) struct TestImage {
    pub(crate) data: Vec<u8>,
    pub(crate) layout: Layout,
    pub(crate) dna: u64,
    keyrom_words: [u32; 256],
    next_pp: u32,
}
impl TestImage {
    pub(crate) fn new(dna: u64) -> TestImage {
        let data = vec![0xFFu8; TEST_PAGES * PAGE_SIZE];
        let layout = Layout::for_len(data.len()).unwrap();
        TestImage { data, layout, dna, keyrom_words: [0u32; 256], next_pp: 0 }
    }

    pub(crate) fn alloc_pp(&mut self) -> u32 {
        let pp = self.next_pp;
        self.next_pp += 1;
        assert!((pp as usize) < self.layout.data_pages, "test image is full");
        pp
    }

    pub(crate) fn pte_offset(&self, pp: u32) -> usize { self.layout.pt_phys_base + pp as usize * PTE_SIZE }

    pub(crate) fn page_offset(&self, pp: u32) -> usize { self.layout.data_phys_base + pp as usize * PAGE_SIZE }

    /// Maps `va` to `pp` and seals `vpage` into the data page.
    pub(crate) fn store_vpage(
        &mut self,
        name: &BasisName,
        keys: &BasisKeyPair,
        pp: u32,
        va: VirtAddr,
        journal: JournalType,
        vpage: &[u8],
    ) {
        let mut rng = rand::thread_rng();
        let pte = Pte::new(va, PtFlags::CLEAN | PtFlags::COMMITTED, rng.gen());
        let ct = BlockCodec::new(&keys.page_table_key).encrypt(pte.as_bytes());
        let pte_offset = self.pte_offset(pp);
        self.data[pte_offset..pte_offset + PTE_SIZE].copy_from_slice(&ct);

        let mut pt = journal.to_le_bytes().to_vec();
        pt.extend_from_slice(vpage);
        let nonce: [u8; AEAD_NONCE_LEN] = rng.gen();
        let commit_nonce: [u8; KCOM_NONCE_LEN] = rng.gen();
        let aad = basis_aad(name.as_str(), self.dna);
        let page = encrypt_committed_page(&keys.data_key, &aad, &pt, &nonce, &commit_nonce).unwrap();
        let offset = self.page_offset(pp);
        self.data[offset..offset + PAGE_SIZE].copy_from_slice(&page);
    }

    /// Writes every VPAGE of `content` to a fresh physical page. Returns where each one went.
    pub(crate) fn write_basis(
        &mut self,
        name: &BasisName,
        keys: &BasisKeyPair,
        content: &BasisContent,
        journal: JournalType,
    ) -> BTreeMap<VirtAddr, u32> {
        let mut placed = BTreeMap::new();
        for (&va, vpage) in content.vpages.iter() {
            let pp = self.alloc_pp();
            self.store_vpage(name, keys, pp, va, journal, vpage);
            placed.insert(va, pp);
        }
        placed
    }

    pub(crate) fn fscb_offset(&self, index: usize) -> usize { self.layout.fscb_phys_base + index * PAGE_SIZE }

    pub(crate) fn write_fastspace(&mut self, system: &BasisKeyPair, index: usize, entries: &[PhysPage]) {
        let mut pt = vec![0u8; FASTSPACE_FREE_POOL_LEN * 4];
        for (entry, dst) in entries.iter().zip(pt.chunks_exact_mut(4)) {
            dst.copy_from_slice(&u32::from(*entry).to_le_bytes());
        }
        let nonce: [u8; AEAD_NONCE_LEN] = rand::thread_rng().gen();
        let ct = aead_encrypt(&system.data_key, &nonce, &pt, &fastspace_aad(self.dna)).unwrap();
        let offset = self.fscb_offset(index);
        self.data[offset..offset + AEAD_NONCE_LEN].copy_from_slice(&nonce);
        self.data[offset + AEAD_NONCE_LEN..offset + FASTSPACE_PAGES * PAGE_SIZE].copy_from_slice(&ct);
    }

    /// Appends records to an update page. The page must still be erased past `first_record`.
    pub(crate) fn write_space_updates(
        &mut self,
        system: &BasisKeyPair,
        index: usize,
        first_record: usize,
        updates: &[PhysPage],
    ) {
        let codec = BlockCodec::new(&system.page_table_key);
        for (i, pp) in updates.iter().enumerate() {
            let update = SpaceUpdate::new(rand::thread_rng().gen(), *pp);
            self.write_raw_update(index, first_record + i, codec.encrypt(update.as_bytes()));
        }
    }

    pub(crate) fn write_raw_update(&mut self, index: usize, record: usize, raw: [u8; SPACE_UPDATE_SIZE]) {
        let offset = self.fscb_offset(index) + SPACE_UPDATE_SIZE * (record + 1);
        self.data[offset..offset + SPACE_UPDATE_SIZE].copy_from_slice(&raw);
    }

    /// Generates a KEYROM and a key page that unlock to fresh System keys under
    /// `boot_password`, and returns those keys.
    pub(crate) fn provision(&mut self, boot_password: &str) -> BasisKeyPair {
        let mut rng = rand::thread_rng();
        for w in self.keyrom_words.iter_mut() {
            *w = rng.next_u32();
        }
        self.keyrom_words[KeyRomLocs::GLOBAL_ROLLBACK as usize] = TEST_ROLLBACK;

        let mut salt = [0u8; 16];
        for (i, dst) in salt.chunks_exact_mut(4).enumerate() {
            dst.copy_from_slice(&self.keyrom_words[KeyRomLocs::PEPPER as usize + i].to_be_bytes());
        }
        salt[0] ^= 1;
        let mut pw = boot_password.as_bytes().to_vec();
        pw.push(0);
        let mut hashed = [0u8; 24];
        bcrypt(BCRYPT_COST, &salt, &pw, &mut hashed);
        let digest = Sha512_256::digest(hashed);

        let mut kek = [0u8; 32];
        for (i, dst) in kek.chunks_exact_mut(4).enumerate() {
            dst.copy_from_slice(&self.keyrom_words[KeyRomLocs::USER_KEY as usize + i].to_be_bytes());
        }
        for (dst, &src) in kek.iter_mut().zip(digest.iter()) {
            *dst ^= src;
        }
        for _ in 0..(255 - TEST_ROLLBACK) {
            let rolled = Sha512_256::digest(kek);
            kek.copy_from_slice(rolled.as_slice());
        }

        let system = random_keys();
        let wrapper: KekAes256 = Kek::from(kek);
        let wrapped_pt = wrapper.wrap_with_padding_vec(&system.page_table_key).unwrap();
        let wrapped_data = wrapper.wrap_with_padding_vec(&system.data_key).unwrap();
        assert_eq!(wrapped_pt.len(), WRAPPED_AES_KEYSIZE);

        let base = self.layout.key_phys_base;
        let page = &mut self.data[base..base + PAGE_SIZE];
        rng.fill_bytes(page);
        page[..4].copy_from_slice(&SCD_VERSION.to_le_bytes());
        page[4..4 + WRAPPED_AES_KEYSIZE].copy_from_slice(&wrapped_pt);
        page[4 + WRAPPED_AES_KEYSIZE..4 + 2 * WRAPPED_AES_KEYSIZE].copy_from_slice(&wrapped_data);
        system
    }

    pub(crate) fn keyrom(&self) -> KeyRom { KeyRom::from_words(self.keyrom_words) }

    /// Keys for a secret basis, derived the same way the device derives them.
    pub(crate) fn secret_keys(&self, name: &BasisName, passphrase: &str) -> BasisKeyPair {
        let base = self.layout.key_phys_base;
        let material = KeyMaterial::new(self.keyrom(), &self.data[base..base + PAGE_SIZE]).unwrap();
        material.basis_keys(name, passphrase).unwrap()
    }
}
