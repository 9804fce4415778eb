use std::collections::HashMap;

use bitflags::bitflags;

use super::crypto::{decrypt_committed_page, BlockCodec, AES_BLOCKSIZE};
use super::image::PddbImage;
use super::keys::BasisKeyPair;
use super::murmur3::murmur3_32;
use super::types::PhysPage;
use crate::api::*;
use crate::decoder::{DecodeContext, TieBreak};
use crate::report::CheckLog;

pub const PTE_SIZE: usize = AES_BLOCKSIZE;

bitflags! {
    /// flags used by the page table
    pub struct PtFlags: u8 {
        /// Pages that don't decrypt properly are marked as INVALID in the cache.
        const INVALID   = 0b0000_0000;
        /// set for records that are synced to the copy in Flash. Every valid record
        /// from Flash should have this set; it should only be cleared for blocks in Cache.
        const CLEAN     = 0b0000_0001;
        /// the page was read back and checked after it was written
        const CHECKED   = 0b0000_0010;
        /// the key commitment for the page has been written along with it
        const COMMITTED = 0b0000_0100;
    }
}
impl Default for PtFlags {
    fn default() -> PtFlags { PtFlags::INVALID }
}

/// A Page Table Entry. Must be equal in length to one AES block size (128 bits).
///
/// Contains the address map of the corresponding entry, plus a nonce, and a checksum. Due to
/// the Page Table being deliberately structured to have invalid entries that don't decrypt
/// correctly, you can't use a chaining approach. Thus these entries are encrypted closer to
/// an ECB-style, and an embedded nonce is necessary to keep identical entries from appearing
/// the same in the ciphertext domain.
///
/// Layout: `vpage[7] | flags | nonce[4] | checksum[4]`, where the checksum is murmur3 over the
/// first 12 bytes, seeded with the nonce.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Pte([u8; PTE_SIZE]);
impl Pte {
    pub fn new(va: VirtAddr, flags: PtFlags, nonce: [u8; 4]) -> Pte {
        let vpage = va / VPAGE_SIZE as u64;
        let mut raw = [0u8; PTE_SIZE];
        raw[..7].copy_from_slice(&vpage.to_le_bytes()[..7]);
        raw[7] = flags.bits();
        raw[8..12].copy_from_slice(&nonce);
        let checksum = murmur3_32(&raw[..12], u32::from_le_bytes(nonce));
        raw[12..].copy_from_slice(&checksum.to_le_bytes());
        Pte(raw)
    }

    pub fn from_bytes(raw: [u8; PTE_SIZE]) -> Pte { Pte(raw) }

    pub fn as_bytes(&self) -> &[u8; PTE_SIZE] { &self.0 }

    /// `None` if the stored page number has no byte address in a 64-bit space.
    pub fn vaddr(&self) -> Option<VirtAddr> {
        let mut vpage = [0u8; 8];
        vpage[..7].copy_from_slice(&self.0[..7]);
        u64::from_le_bytes(vpage).checked_mul(VPAGE_SIZE as u64)
    }

    pub fn flags(&self) -> PtFlags { PtFlags::from_bits_truncate(self.0[7]) }

    fn nonce(&self) -> u32 { u32::from_le_bytes([self.0[8], self.0[9], self.0[10], self.0[11]]) }

    /// An entry is valid only if its checksum matches. Entries that belong to another basis
    /// decrypt to noise and fail here.
    pub fn is_valid(&self) -> bool {
        let stored = u32::from_le_bytes([self.0[12], self.0[13], self.0[14], self.0[15]]);
        murmur3_32(&self.0[..12], self.nonce()) == stored
    }
}
impl std::fmt::Debug for Pte {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pte(va: {:x?}, flags: {:?}, valid: {})", self.vaddr(), self.flags(), self.is_valid())
    }
}

/// The address maps of one basis, as recovered from the page table.
#[derive(Debug, Default)]
pub struct BasisMap {
    pub v2p: HashMap<VirtAddr, PhysPage>,
    pub p2v: HashMap<u32, VirtAddr>,
    /// number of virtual addresses claimed by more than one physical page
    pub conflicts: usize,
}
impl BasisMap {
    fn evict(&mut self, va: VirtAddr, loser: PhysPage, winner: PhysPage) {
        self.p2v.remove(&loser.page_number());
        self.p2v.insert(winner.page_number(), va);
        self.v2p.insert(va, winner);
    }
}

fn page_journal(image: &PddbImage, keys: &BasisKeyPair, aad: &[u8], pp: PhysPage) -> Result<JournalType> {
    let page = image.data_page(pp).ok_or(PddbError::MalformedRecord("physical page beyond end of image"))?;
    let pt = decrypt_committed_page(&keys.data_key, aad, page)?;
    Ok(JournalType::from_le_bytes([pt[0], pt[1], pt[2], pt[3]]))
}

/// Decide between two physical pages that claim the same virtual address. Returns true if
/// `challenger` should replace `incumbent`.
#[allow(clippy::too_many_arguments)]
fn resolve_conflict(
    ctx: &DecodeContext,
    checks: &mut CheckLog,
    image: &PddbImage,
    keys: &BasisKeyPair,
    aad: &[u8],
    va: VirtAddr,
    incumbent: PhysPage,
    challenger: PhysPage,
) -> bool {
    let subject = format!("va {:x}", va);
    match (page_journal(image, keys, aad, incumbent), page_journal(image, keys, aad, challenger)) {
        (Ok(old), Ok(new)) if new > old => {
            log::debug!(
                "va {:x}: pp {:x} (journal {}) supersedes pp {:x} (journal {})",
                va,
                challenger.page_number(),
                new,
                incumbent.page_number(),
                old
            );
            true
        }
        (Ok(old), Ok(new)) if new == old => {
            let replace = ctx.config.tie_break == TieBreak::KeepLast;
            let (kept, dropped) = if replace { (challenger, incumbent) } else { (incumbent, challenger) };
            checks.warn(
                &subject,
                format!(
                    "page table conflict: pp {:x} and pp {:x} share journal {}; {:?} policy keeps pp {:x}, drops pp {:x}",
                    incumbent.page_number(),
                    challenger.page_number(),
                    old,
                    ctx.config.tie_break,
                    kept.page_number(),
                    dropped.page_number()
                ),
            );
            replace
        }
        (Ok(_), Ok(_)) => false,
        (Err(e), Ok(_)) => {
            checks.warn(
                &subject,
                format!(
                    "page table conflict: pp {:x} does not decrypt ({}), using pp {:x}",
                    incumbent.page_number(),
                    e,
                    challenger.page_number()
                ),
            );
            true
        }
        (Ok(_), Err(e)) => {
            checks.warn(
                &subject,
                format!(
                    "page table conflict: pp {:x} does not decrypt ({}), keeping pp {:x}",
                    challenger.page_number(),
                    e,
                    incumbent.page_number()
                ),
            );
            false
        }
        (Err(_), Err(_)) => {
            checks.warn(
                &subject,
                format!(
                    "page table conflict: neither pp {:x} nor pp {:x} decrypts; keeping pp {:x}",
                    incumbent.page_number(),
                    challenger.page_number(),
                    incumbent.page_number()
                ),
            );
            false
        }
    }
}

/// Scans `page_table` with the basis' page table key and builds its address maps. Slot `i`
/// of the table describes page `i` of the data region; slots past the end of the data region
/// exist because the table is sized for the whole image, and are ignored.
pub(crate) fn decode_page_table(
    ctx: &DecodeContext,
    checks: &mut CheckLog,
    image: &PddbImage,
    page_table: &[u8],
    keys: &BasisKeyPair,
    aad: &[u8],
) -> BasisMap {
    let codec = BlockCodec::new(&keys.page_table_key);
    let mut map = BasisMap::default();
    let data_pages = image.layout().data_pages;
    for (slot, chunk) in page_table.chunks_exact(PTE_SIZE).enumerate().take(data_pages) {
        let mut block = [0u8; PTE_SIZE];
        block.copy_from_slice(chunk);
        let pte = Pte::from_bytes(codec.decrypt(&block));
        if !pte.is_valid() {
            continue;
        }
        let va = match pte.vaddr() {
            Some(va) if va != 0 => va,
            // virtual page 0 is never allocated, and an overflowing page number can't be
            // addressed; either way this is a checksum collision
            _ => {
                log::debug!("slot {} decodes to unusable vpage {:?}, ignoring", slot, pte);
                continue;
            }
        };
        log::trace!("slot {}: {:?}", slot, pte);
        let pp = PhysPage::mapped(slot as u32);
        if let Some(&incumbent) = map.v2p.get(&va) {
            map.conflicts += 1;
            if resolve_conflict(ctx, checks, image, keys, aad, va, incumbent, pp) {
                map.evict(va, incumbent, pp);
            }
        } else {
            map.v2p.insert(va, pp);
            map.p2v.insert(slot as u32, va);
        }
    }
    log::info!("page table scan: {} mapped pages, {} conflicts", map.v2p.len(), map.conflicts);
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn test_pte_validity() {
        let pte = Pte::new(5 * VPAGE_SIZE as u64, PtFlags::CLEAN | PtFlags::COMMITTED, [1, 2, 3, 4]);
        assert!(pte.is_valid());
        assert_eq!(pte.vaddr(), Some(5 * VPAGE_SIZE as u64));
        assert_eq!(pte.flags(), PtFlags::CLEAN | PtFlags::COMMITTED);
        // any single bit flip in the covered bytes or the checksum invalidates the entry
        for byte in 0..PTE_SIZE {
            let mut raw = *pte.as_bytes();
            raw[byte] ^= 0x01;
            assert!(!Pte::from_bytes(raw).is_valid(), "flip in byte {} went unnoticed", byte);
        }
    }

    #[test]
    fn test_random_blocks_are_invalid() {
        let mut rng = rand::thread_rng();
        let mut valid = 0;
        for _ in 0..4096 {
            let mut raw = [0u8; PTE_SIZE];
            rng.fill_bytes(&mut raw);
            let pte = Pte::from_bytes(raw);
            let checksum = murmur3_32(&raw[..12], pte.nonce());
            assert_eq!(pte.is_valid(), checksum.to_le_bytes() == raw[12..]);
            if pte.is_valid() {
                valid += 1;
            }
        }
        assert!(valid < 2);
    }

    #[test]
    fn test_overflowing_vpage_is_skipped() {
        // a checksum-valid entry whose page number can't be scaled to a byte address
        let mut raw = [0xFFu8; PTE_SIZE];
        raw[7] = (PtFlags::CLEAN | PtFlags::COMMITTED).bits();
        raw[8..12].copy_from_slice(&[9, 8, 7, 6]);
        let checksum = murmur3_32(&raw[..12], u32::from_le_bytes([9, 8, 7, 6]));
        raw[12..].copy_from_slice(&checksum.to_le_bytes());
        let pte = Pte::from_bytes(raw);
        assert!(pte.is_valid());
        assert_eq!(pte.vaddr(), None);

        let keys = BasisKeyPair { page_table_key: [7; 32], data_key: [8; 32] };
        let codec = BlockCodec::new(&keys.page_table_key);
        let data = vec![0xFFu8; 64 * PAGE_SIZE];
        let image = PddbImage::new(&data).unwrap();
        let mut table = image.raw_page_table().to_vec();
        table[..PTE_SIZE].copy_from_slice(&codec.encrypt(pte.as_bytes()));
        let good = Pte::new(3 * VPAGE_SIZE as u64, PtFlags::CLEAN, [1, 1, 1, 1]);
        table[PTE_SIZE..2 * PTE_SIZE].copy_from_slice(&codec.encrypt(good.as_bytes()));

        let ctx = DecodeContext::new(Default::default());
        let mut checks = CheckLog::default();
        let map = decode_page_table(&ctx, &mut checks, &image, &table, &keys, b"aad");
        assert_eq!(map.v2p.len(), 1);
        assert_eq!(map.v2p.get(&(3 * VPAGE_SIZE as u64)).map(|pp| pp.page_number()), Some(1));
        assert!(!map.p2v.contains_key(&0));
        assert_eq!(map.conflicts, 0);
        assert!(checks.checks().is_empty());
    }

    #[test]
    fn test_erased_flash_is_invalid() {
        assert!(!Pte::from_bytes([0xFF; PTE_SIZE]).is_valid());
    }
}
