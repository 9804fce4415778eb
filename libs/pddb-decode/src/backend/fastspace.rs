use std::collections::BTreeMap;

use super::crypto::{aead_decrypt, BlockCodec, AES_BLOCKSIZE};
use super::image::{is_blank, PddbImage};
use super::keys::BasisKeyPair;
use super::murmur3::murmur3_32;
use super::types::{PhysPage, SpaceState};
use crate::api::*;
use crate::decoder::{DecodeContext, TieBreak};
use crate::report::FscbReport;

/// Each free_pool entry takes 4 bytes, so give-or-take we have about 1000 free_pool
/// entries per page of storage for the free_pool, or 4k * 1000 ~ 4MiB per page.
pub const FASTSPACE_FREE_POOL_LEN: usize =
    ((PAGE_SIZE * FASTSPACE_PAGES) - (AEAD_NONCE_LEN + AEAD_TAG_LEN)) / core::mem::size_of::<u32>();
pub const SPACE_UPDATE_SIZE: usize = AES_BLOCKSIZE;

/// Free space as recorded in FastSpace, keyed by physical page number.
pub type FreeSpacePool = BTreeMap<u32, PhysPage>;

/// AAD for the FastSpace block.
pub fn fastspace_aad(dna: u64) -> Vec<u8> { basis_aad(PDDB_FAST_SPACE_SYSTEM_BASIS, dna) }

/// A 128-bit record that stores an update to the FastSpace pool, so the large FastSpace
/// block only has to be rewritten rarely.
///
/// Plaintext layout: `nonce[8] | page (PhysPage, u32 LE) | checksum[4]`. The checksum is
/// murmur3 of the first 12 bytes seeded with the low nonce word; it catches torn writes
/// (trailing 0xFF bytes) and makes forged records unlikely to land on a valid page.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct SpaceUpdate([u8; SPACE_UPDATE_SIZE]);
impl SpaceUpdate {
    pub fn new(nonce: [u8; 8], page: PhysPage) -> SpaceUpdate {
        let mut raw = [0u8; SPACE_UPDATE_SIZE];
        raw[..8].copy_from_slice(&nonce);
        raw[8..12].copy_from_slice(&u32::from(page).to_le_bytes());
        let checksum = murmur3_32(&raw[..12], u32::from_le_bytes([nonce[0], nonce[1], nonce[2], nonce[3]]));
        raw[12..].copy_from_slice(&checksum.to_le_bytes());
        SpaceUpdate(raw)
    }

    pub fn from_bytes(raw: [u8; SPACE_UPDATE_SIZE]) -> SpaceUpdate { SpaceUpdate(raw) }

    pub fn as_bytes(&self) -> &[u8; SPACE_UPDATE_SIZE] { &self.0 }

    pub fn page(&self) -> PhysPage {
        PhysPage::from(u32::from_le_bytes([self.0[8], self.0[9], self.0[10], self.0[11]]))
    }

    pub fn is_valid(&self) -> bool {
        let seed = u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        let stored = u32::from_le_bytes([self.0[12], self.0[13], self.0[14], self.0[15]]);
        murmur3_32(&self.0[..12], seed) == stored
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FscbPage {
    Blank,
    /// 16 bytes of 0xFF, then SpaceUpdate records
    Updates,
    FastSpace,
}
fn classify(page: &[u8]) -> FscbPage {
    if is_blank(page) {
        FscbPage::Blank
    } else if page[..AES_BLOCKSIZE].iter().all(|&b| b == 0xFF) {
        FscbPage::Updates
    } else {
        FscbPage::FastSpace
    }
}

/// Decrypts the FastSpace block: `nonce[12] | ct | tag[16]` across FASTSPACE_PAGES pages.
pub fn decrypt_fastspace(keys: &BasisKeyPair, dna: u64, block: &[u8]) -> Result<FreeSpacePool> {
    if block.len() != PAGE_SIZE * FASTSPACE_PAGES {
        return Err(PddbError::MalformedRecord("FastSpace block has the wrong length"));
    }
    let pt = aead_decrypt(&keys.data_key, &block[..AEAD_NONCE_LEN], &block[AEAD_NONCE_LEN..], &fastspace_aad(dna))?;
    let mut pool = FreeSpacePool::new();
    for entry in pt.chunks_exact(4) {
        let pp = PhysPage::from(u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]));
        if pp.valid() {
            pool.insert(pp.page_number(), pp);
        }
    }
    Ok(pool)
}

/// Scans the FSCB, decrypts FastSpace with the System keys and replays the SpaceUpdate
/// journal over it. Returns `None` if no usable FastSpace block exists.
pub(crate) fn decode_fscb(
    ctx: &DecodeContext,
    image: &PddbImage,
    keys: &BasisKeyPair,
    report: &mut FscbReport,
) -> Option<FreeSpacePool> {
    let mut updates: Vec<[u8; SPACE_UPDATE_SIZE]> = Vec::new();
    let mut fastspace: Option<usize> = None;
    let mut index = 0;
    while index < FSCB_PAGES {
        let page = image.fscb_page(index)?;
        match classify(page) {
            FscbPage::Blank => {}
            FscbPage::Updates => {
                for record in page[AES_BLOCKSIZE..].chunks_exact(SPACE_UPDATE_SIZE) {
                    if is_blank(record) {
                        break;
                    }
                    let mut raw = [0u8; SPACE_UPDATE_SIZE];
                    raw.copy_from_slice(record);
                    updates.push(raw);
                }
            }
            FscbPage::FastSpace => {
                if fastspace.is_none() {
                    fastspace = Some(index);
                    // the block spans FASTSPACE_PAGES pages; the ones after the first are not classified
                    index += FASTSPACE_PAGES;
                    continue;
                } else {
                    report.checks.warn("fscb", format!("extra FastSpace candidate at FSCB page {} ignored", index));
                }
            }
        }
        index += 1;
    }
    log::info!("FSCB scan: FastSpace at {:?}, {} update records", fastspace, updates.len());

    let start = match fastspace {
        Some(start) => start,
        None => {
            report.checks.warn("fastspace", "no FastSpace block found in the FSCB");
            return None;
        }
    };
    report.fastspace_page = Some(start);
    if start + FASTSPACE_PAGES > FSCB_PAGES {
        report.checks.fail("fastspace", format!("FastSpace at FSCB page {} runs off the end of the FSCB", start));
        return None;
    }
    let mut block = Vec::with_capacity(PAGE_SIZE * FASTSPACE_PAGES);
    for i in start..start + FASTSPACE_PAGES {
        block.extend_from_slice(image.fscb_page(i)?);
    }
    let mut pool = match decrypt_fastspace(keys, ctx.config.dna, &block) {
        Ok(pool) => pool,
        Err(e) => {
            report.checks.fail("fastspace", format!("FastSpace at FSCB page {} does not decrypt: {}", start, e));
            return None;
        }
    };
    report.checks.ok("fastspace", format!("decrypted FastSpace at FSCB page {}: {} entries", start, pool.len()));
    if ctx.config.dump_data {
        for (page, pp) in pool.iter() {
            log::debug!("fastspace pp {:x}: {:?} journal {}", page, pp.space_state(), pp.journal());
        }
    }

    let codec = BlockCodec::new(&keys.page_table_key);
    for raw in updates.iter() {
        let update = SpaceUpdate::from_bytes(codec.decrypt(raw));
        if !update.is_valid() {
            report.updates_invalid += 1;
            continue;
        }
        let candidate = update.page();
        let target = candidate.page_number();
        let existing = match pool.get(&target) {
            Some(existing) => *existing,
            None => {
                report.checks.info("space update", format!("pp {:x} is not in the FastSpace pool, ignored", target));
                report.updates_orphaned += 1;
                continue;
            }
        };
        if candidate.journal_newer_than(&existing) {
            log::trace!("pp {:x}: journal {} -> {}", target, existing.journal(), candidate.journal());
            pool.insert(target, candidate);
            report.updates_applied += 1;
        } else if candidate.journal() == existing.journal() {
            report.checks.warn(
                "space update",
                format!(
                    "pp {:x}: update repeats journal {}; {:?} policy applies",
                    target,
                    candidate.journal(),
                    ctx.config.tie_break
                ),
            );
            if ctx.config.tie_break == TieBreak::KeepLast {
                pool.insert(target, candidate);
                report.updates_applied += 1;
            } else {
                report.updates_stale += 1;
            }
        } else {
            report.updates_stale += 1;
        }
    }
    if report.updates_invalid > 0 {
        report.checks.info("space update", format!("{} records failed their checksum", report.updates_invalid));
    }

    for pp in pool.values() {
        match pp.space_state() {
            SpaceState::Free => report.free += 1,
            SpaceState::MaybeUsed => report.maybe_used += 1,
            SpaceState::Used => report.used += 1,
            SpaceState::Dirty => report.dirty += 1,
        }
    }
    Some(pool)
}
