use std::collections::HashMap;
use std::num::NonZeroU32;

use bitfield::bitfield;
use byteorder::{ByteOrder, LittleEndian};

use super::crypto::decrypt_committed_page;
use super::image::PddbImage;
use super::key::{check_trailer, KeyDescriptor};
use super::keys::BasisKeyPair;
use super::pagetable::BasisMap;
use super::types::{KeyPool, PhysPage};
use crate::api::*;
use crate::decoder::DecodeContext;
use crate::report::{BasisReport, CheckLog, DictReport, KeyReport, TrailerStatus};

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct DictFlags(u32);
    impl Debug;
    pub valid, set_valid: 0;
}
impl DictFlags {
    pub fn from_bits(bits: u32) -> DictFlags { DictFlags(bits) }

    pub fn bits(&self) -> u32 { self.0 }
}

/// On-disk dictionary header, slot 0 of the dictionary's first VPAGE.
///
/// `flags u32 | age u32 | num_keys u32 | free_key_index u32 | name_len u8 | name[110]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dictionary {
    pub flags: DictFlags,
    /// Access count to the dictionary
    pub age: u32,
    /// Number of keys in the dictionary
    pub num_keys: u32,
    /// Free index starting space. 0 is an invalid index, as this is where the header goes.
    pub free_key_index: u32,
    pub name: String,
}
impl Dictionary {
    pub fn parse(slot: &[u8]) -> Result<Dictionary> {
        if slot.len() < DK_STRIDE {
            return Err(PddbError::MalformedRecord("dictionary header too short"));
        }
        let name_len = slot[16] as usize;
        if name_len > DICT_NAME_LEN - 1 {
            return Err(PddbError::MalformedRecord("dictionary name length"));
        }
        let name = std::str::from_utf8(&slot[17..17 + name_len])
            .map_err(|_| PddbError::MalformedRecord("dictionary name is not utf-8"))?
            .to_string();
        Ok(Dictionary {
            flags: DictFlags(LittleEndian::read_u32(&slot[0..4])),
            age: LittleEndian::read_u32(&slot[4..8]),
            num_keys: LittleEndian::read_u32(&slot[8..12]),
            free_key_index: LittleEndian::read_u32(&slot[12..16]),
            name,
        })
    }

    pub fn to_bytes(&self) -> [u8; DK_STRIDE] {
        let mut slot = [0u8; DK_STRIDE];
        LittleEndian::write_u32(&mut slot[0..4], self.flags.0);
        LittleEndian::write_u32(&mut slot[4..8], self.age);
        LittleEndian::write_u32(&mut slot[8..12], self.num_keys);
        LittleEndian::write_u32(&mut slot[12..16], self.free_key_index);
        let name = self.name.as_bytes();
        let len = name.len().min(DICT_NAME_LEN - 1);
        slot[16] = len as u8;
        slot[17..17 + len].copy_from_slice(&name[..len]);
        slot
    }
}

/// Virtual address of the VPAGE holding descriptor slot `key_meta_index` of a dictionary.
/// Slot 0 is the dictionary header itself.
pub fn dict_indices_to_vaddr(dict_index: NonZeroU32, key_meta_index: usize) -> VirtAddr {
    dict_index.get() as u64 * DICT_VSIZE + ((key_meta_index / DK_PER_VPAGE) as u64) * VPAGE_SIZE as u64
}

/// Byte offset of descriptor slot `key_meta_index` within the plaintext of its page.
pub fn dict_slot_offset(key_meta_index: usize) -> usize {
    core::mem::size_of::<JournalType>() + (key_meta_index % DK_PER_VPAGE) * DK_STRIDE
}

/// Caches one decrypted page, so that walking consecutive slots or bytes does not decrypt the
/// same page over and over. Failures are cached too; a page that did not decrypt once will
/// not decrypt the second time either.
#[derive(Default)]
pub(crate) struct PlaintextCache {
    /// a page of data, stored with the Journal rev on top
    pub(crate) data: Option<Result<Vec<u8>>>,
    /// the page the cache corresponds to
    pub(crate) tag: Option<PhysPage>,
}
impl PlaintextCache {
    pub(crate) fn fill(
        &mut self,
        image: &PddbImage,
        v2p_map: &HashMap<VirtAddr, PhysPage>,
        keys: &BasisKeyPair,
        aad: &[u8],
        req_vaddr: VirtAddr,
    ) -> Result<&[u8]> {
        let pp = match v2p_map.get(&req_vaddr) {
            Some(pp) => *pp,
            None => {
                self.data = None;
                self.tag = None;
                return Err(PddbError::MissingAllocation(req_vaddr));
            }
        };
        let fill_needed = match self.tag {
            Some(tag) => tag.page_number() != pp.page_number(),
            None => true,
        };
        if fill_needed {
            self.data = Some(match image.data_page(pp) {
                Some(page) => decrypt_committed_page(&keys.data_key, aad, page),
                None => Err(PddbError::MalformedRecord("physical page beyond end of image")),
            });
            self.tag = Some(pp);
        }
        match &self.data {
            Some(Ok(data)) => Ok(&data[..]),
            Some(Err(e)) => Err(e.clone()),
            None => Err(PddbError::MissingAllocation(req_vaddr)),
        }
    }
}

/// Reassembles the data of a key, which may span several VPAGEs.
pub(crate) fn read_key_data(
    image: &PddbImage,
    map: &BasisMap,
    keys: &BasisKeyPair,
    aad: &[u8],
    desc: &KeyDescriptor,
    cache: &mut PlaintextCache,
) -> Result<Vec<u8>> {
    if desc.len > desc.reserved {
        return Err(PddbError::MalformedRecord("key length exceeds its reservation"));
    }
    if desc.len > image.len() as u64 || desc.start.checked_add(desc.len).is_none() {
        return Err(PddbError::MalformedRecord("key length exceeds the image"));
    }
    let len = desc.len as usize;
    let mut data = Vec::with_capacity(len);
    let mut addr = desc.start;
    while data.len() < len {
        let vpage = (addr / VPAGE_SIZE as u64) * VPAGE_SIZE as u64;
        let offset = (addr - vpage) as usize;
        let page = cache.fill(image, &map.v2p, keys, aad, vpage)?;
        let take = (VPAGE_SIZE - offset).min(len - data.len());
        let start = core::mem::size_of::<JournalType>() + offset;
        data.extend_from_slice(&page[start..start + take]);
        addr += take as u64;
    }
    Ok(data)
}

#[allow(clippy::too_many_arguments)]
fn key_report(
    ctx: &mut DecodeContext,
    image: &PddbImage,
    map: &BasisMap,
    keys: &BasisKeyPair,
    aad: &[u8],
    basis_name: &BasisName,
    dict: &mut DictReport,
    slot: usize,
    desc: KeyDescriptor,
    data_cache: &mut PlaintextCache,
) -> KeyReport {
    let subject = desc.name.clone();
    let (data_readable, trailer, data) = match read_key_data(image, map, keys, aad, &desc, data_cache) {
        Ok(data) => {
            let trailer = if check_trailer(&data) {
                dict.checks.ok(&subject, format!("{} bytes, self-check trailer valid", data.len()));
                TrailerStatus::Valid
            } else if ctx.config.expect_trailers {
                dict.checks.fail(&subject, format!("{} bytes, self-check trailer missing or wrong", data.len()));
                TrailerStatus::Missing
            } else {
                dict.checks.info(&subject, format!("{} bytes, no self-check trailer", data.len()));
                TrailerStatus::Missing
            };
            let dump_id = format!("{}:{}:{}", basis_name, dict.name, desc.name);
            let data = if ctx.config.dump_data && ctx.first_dump(&dump_id) { Some(data) } else { None };
            (true, trailer, data)
        }
        Err(PddbError::MissingAllocation(va)) => {
            dict.checks.warn(&subject, format!("key data at va {:x} has no physical page", va));
            (false, TrailerStatus::Unchecked, None)
        }
        Err(e) => {
            dict.checks.fail(&subject, format!("key data unreadable: {}", e));
            (false, TrailerStatus::Unchecked, None)
        }
    };
    KeyReport {
        name: desc.name,
        slot,
        start: desc.start,
        len: desc.len,
        reserved: desc.reserved,
        age: desc.age,
        flags: desc.flags,
        pool: KeyPool::from(desc.start),
        data_readable,
        trailer,
        data,
    }
}

/// Walks the descriptor slots of one dictionary until `num_keys` valid keys are found or the
/// slot space runs out.
#[allow(clippy::too_many_arguments)]
fn decode_keys(
    ctx: &mut DecodeContext,
    image: &PddbImage,
    map: &BasisMap,
    keys: &BasisKeyPair,
    aad: &[u8],
    basis_name: &BasisName,
    index: NonZeroU32,
    dict: &mut DictReport,
) {
    let mut index_cache = PlaintextCache::default();
    let mut data_cache = PlaintextCache::default();
    let mut found = 0u32;
    let mut unmapped_pages = 0usize;
    let mut slot = 1usize;
    while slot < KEY_MAXCOUNT && found < dict.declared_keys {
        let vaddr = dict_indices_to_vaddr(index, slot);
        let raw = match index_cache.fill(image, &map.v2p, keys, aad, vaddr) {
            Ok(page) => {
                let offset = dict_slot_offset(slot);
                let mut raw = [0u8; DK_STRIDE];
                raw.copy_from_slice(&page[offset..offset + DK_STRIDE]);
                raw
            }
            Err(e) => {
                if let PddbError::MissingAllocation(_) = e {
                    unmapped_pages += 1;
                } else {
                    dict.checks.fail("key index", format!("index page at va {:x} unreadable: {}", vaddr, e));
                }
                // skip the rest of the slots on this page
                slot = (slot / DK_PER_VPAGE + 1) * DK_PER_VPAGE;
                continue;
            }
        };
        match KeyDescriptor::parse(&raw) {
            Ok(Some(desc)) => {
                found += 1;
                log::debug!("dict {} slot {}: key {} len {}", dict.name, slot, desc.name, desc.len);
                let report = key_report(ctx, image, map, keys, aad, basis_name, dict, slot, desc, &mut data_cache);
                dict.keys.push(report);
            }
            Ok(None) => {}
            Err(e) => {
                found += 1;
                dict.checks.fail(&format!("slot {}", slot), format!("key descriptor is marked valid but is malformed: {}", e));
            }
        }
        slot += 1;
    }
    if unmapped_pages > 0 {
        log::debug!("dict {}: skipped {} unmapped index pages", dict.name, unmapped_pages);
    }
    if found == dict.declared_keys {
        dict.checks.ok("keys", format!("found all {} keys", found));
    } else {
        dict.checks.warn("keys", format!("dictionary declares {} keys, found {}", dict.declared_keys, found));
    }
}

/// Probes dictionary index space until `num_dicts` valid dictionaries are found or the
/// configured probe limit is reached, decoding each dictionary's keys as it goes.
pub(crate) fn decode_dictionaries(
    ctx: &mut DecodeContext,
    image: &PddbImage,
    map: &BasisMap,
    keys: &BasisKeyPair,
    aad: &[u8],
    num_dicts: u32,
    basis: &mut BasisReport,
) {
    let mut found = 0u32;
    let probe_limit = ctx.config.dict_probe_limit.min(DICT_MAXCOUNT);
    for raw_index in 1..=probe_limit {
        if found >= num_dicts {
            break;
        }
        let index = match NonZeroU32::new(raw_index) {
            Some(index) => index,
            None => continue,
        };
        let vaddr = dict_indices_to_vaddr(index, 0);
        let pp = match map.v2p.get(&vaddr) {
            Some(pp) => *pp,
            None => continue,
        };
        let header = match image
            .data_page(pp)
            .ok_or(PddbError::MalformedRecord("physical page beyond end of image"))
            .and_then(|page| decrypt_committed_page(&keys.data_key, aad, page))
            .and_then(|pt| Dictionary::parse(&pt[dict_slot_offset(0)..dict_slot_offset(0) + DK_STRIDE]))
        {
            Ok(header) => header,
            Err(e) => {
                basis.checks.fail(&format!("dict index {}", raw_index), format!("dictionary header unreadable: {}", e));
                continue;
            }
        };
        if !header.flags.valid() {
            log::debug!("dict index {} ({}) is deleted", raw_index, header.name);
            continue;
        }
        found += 1;
        log::info!("dict index {}: {} ({} keys)", raw_index, header.name, header.num_keys);
        let mut dict = DictReport {
            index: raw_index,
            name: header.name,
            age: header.age,
            flags: header.flags,
            declared_keys: header.num_keys,
            free_key_index: header.free_key_index,
            keys: Vec::new(),
            checks: CheckLog::default(),
        };
        decode_keys(ctx, image, map, keys, aad, &basis.name, index, &mut dict);
        basis.stats.keys += dict.keys.len();
        basis.stats.key_bytes += dict.keys.iter().filter(|k| k.data_readable).map(|k| k.len).sum::<u64>();
        basis.dicts.push(dict);
    }
    basis.stats.dictionaries = found as usize;
    if found == num_dicts {
        basis.checks.ok("dicts", format!("found all {} dictionaries", found));
    } else {
        basis.checks.warn(
            "dicts",
            format!("basis root declares {} dictionaries, found {} in {} probed indices", num_dicts, found, probe_limit),
        );
    }
}
