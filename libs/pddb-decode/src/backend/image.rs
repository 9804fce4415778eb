use std::borrow::Cow;

use super::pagetable::PTE_SIZE;
use super::types::PhysPage;
use crate::api::*;
use crate::report::CheckLog;

/// Rounds `len` up to the next PAGE_SIZE boundary.
fn page_align(len: usize) -> usize { (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1) }

pub(crate) fn is_blank(page: &[u8]) -> bool { page.iter().all(|&b| b == 0xFF) }

/// Region map of a PDDB image. All bases are byte offsets from the start of the image.
///
/// ```text
///   0x0000_0000 | page table start
///               | page table, one 16-byte entry per page of the image
///   key_phys    | static crypto data (one page)
///   mbbb_phys   | make before break buffer (10 pages)
///   fscb_phys   | free space commit buffer (16 pages)
///   data_phys   | data pages
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub total_pages: usize,
    pub pt_phys_base: usize,
    pub key_phys_base: usize,
    pub mbbb_phys_base: usize,
    pub fscb_phys_base: usize,
    pub data_phys_base: usize,
    pub data_pages: usize,
}
impl Layout {
    pub fn for_len(len: usize) -> Result<Layout> {
        if len % PAGE_SIZE != 0 {
            return Err(PddbError::MalformedRecord("image length is not a multiple of the page size"));
        }
        let total_pages = len / PAGE_SIZE;
        let key_phys_base = page_align(total_pages * PTE_SIZE);
        let mbbb_phys_base = key_phys_base + PAGE_SIZE;
        let fscb_phys_base = mbbb_phys_base + MBBB_PAGES * PAGE_SIZE;
        let data_phys_base = fscb_phys_base + FSCB_PAGES * PAGE_SIZE;
        if data_phys_base >= len {
            return Err(PddbError::MalformedRecord("image too short to hold a data region"));
        }
        Ok(Layout {
            total_pages,
            pt_phys_base: 0,
            key_phys_base,
            mbbb_phys_base,
            fscb_phys_base,
            data_phys_base,
            data_pages: (len - data_phys_base) / PAGE_SIZE,
        })
    }

    pub fn pt_len(&self) -> usize { self.key_phys_base - self.pt_phys_base }
}

/// A read-only view of a PDDB image.
pub struct PddbImage<'a> {
    data: &'a [u8],
    layout: Layout,
}
impl<'a> PddbImage<'a> {
    pub fn new(data: &'a [u8]) -> Result<PddbImage<'a>> {
        let layout = Layout::for_len(data.len())?;
        log::debug!("image layout: {:x?}", layout);
        Ok(PddbImage { data, layout })
    }

    pub fn layout(&self) -> &Layout { &self.layout }

    pub fn len(&self) -> usize { self.data.len() }

    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    fn page_at(&self, offset: usize) -> &'a [u8] { &self.data[offset..offset + PAGE_SIZE] }

    pub fn key_page(&self) -> &'a [u8] { self.page_at(self.layout.key_phys_base) }

    pub fn mbbb_page(&self, index: usize) -> Option<&'a [u8]> {
        if index < MBBB_PAGES { Some(self.page_at(self.layout.mbbb_phys_base + index * PAGE_SIZE)) } else { None }
    }

    pub fn fscb_page(&self, index: usize) -> Option<&'a [u8]> {
        if index < FSCB_PAGES { Some(self.page_at(self.layout.fscb_phys_base + index * PAGE_SIZE)) } else { None }
    }

    /// Returns the data page referenced by `pp`, or `None` if it lies past the end of the image.
    pub fn data_page(&self, pp: PhysPage) -> Option<&'a [u8]> {
        let index = pp.page_number() as usize;
        if index < self.layout.data_pages {
            Some(self.page_at(self.layout.data_phys_base + index * PAGE_SIZE))
        } else {
            None
        }
    }

    /// The page table exactly as stored.
    pub fn raw_page_table(&self) -> &'a [u8] { &self.data[self.layout.pt_phys_base..self.layout.key_phys_base] }

    /// The single page of the MBBB that holds data, if any. More than one is a fatal error:
    /// there is no way to know which one was in flight.
    pub fn mbbb_candidate(&self) -> Result<Option<(usize, &'a [u8])>> {
        let candidates: Vec<(usize, &'a [u8])> =
            (0..MBBB_PAGES).filter_map(|i| self.mbbb_page(i).map(|p| (i, p))).filter(|(_, p)| !is_blank(p)).collect();
        match candidates.len() {
            0 => Ok(None),
            1 => Ok(Some(candidates[0])),
            n => Err(PddbError::MbbbConflict(n)),
        }
    }

    /// The page table with an erased page swapped for the MBBB contents. An erased page
    /// table page next to a live MBBB page means a page table update was interrupted after
    /// the erase but before the write. Only one page is ever in flight, so only the first
    /// erased page is restored; any further erased page is reported and left blank.
    pub fn effective_page_table(&self, checks: &mut CheckLog) -> Result<Cow<'a, [u8]>> {
        let raw = self.raw_page_table();
        let (mbbb_index, mbbb_page) = match self.mbbb_candidate()? {
            Some(candidate) => candidate,
            None => return Ok(Cow::Borrowed(raw)),
        };
        let mut table = raw.to_vec();
        let mut restored = None;
        for (index, page) in table.chunks_exact_mut(PAGE_SIZE).enumerate() {
            if !is_blank(page) {
                continue;
            }
            match restored {
                None => {
                    log::info!("page table page {} is blank, restoring from MBBB page {}", index, mbbb_index);
                    page.copy_from_slice(mbbb_page);
                    restored = Some(index);
                }
                Some(first) => checks.fail(
                    "mbbb",
                    format!(
                        "page table page {} is also blank; MBBB page {} was already used for page {}",
                        index, mbbb_index, first
                    ),
                ),
            }
        }
        match restored {
            Some(index) => {
                checks.info("mbbb", format!("restored page table page {} from MBBB page {}", index, mbbb_index));
                Ok(Cow::Owned(table))
            }
            None => {
                checks.info(
                    "mbbb",
                    format!("MBBB page {} holds data but no page table page is blank; ignored", mbbb_index),
                );
                Ok(Cow::Borrowed(raw))
            }
        }
    }
}
