use std::collections::HashSet;

use crate::api::*;
use crate::backend::basis::decode_basis_root;
use crate::backend::dictionary::decode_dictionaries;
use crate::backend::fastspace::{decode_fscb, FreeSpacePool};
use crate::backend::image::PddbImage;
use crate::backend::keys::{BasisKeyring, KeyMaterial, KeyRom};
use crate::backend::pagetable::{decode_page_table, BasisMap};
use crate::backend::types::SpaceState;
use crate::report::{BasisReport, CheckLog, DecodeReport, FscbReport};

/// What to do when two candidates carry the same journal revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// keep the candidate seen first in scan order (lowest physical page, earliest record)
    KeepFirst,
    /// let the later candidate replace the earlier one
    KeepLast,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// device DNA, mixed into every AAD
    pub dna: u64,
    /// treat keys without a valid self-check trailer as failures
    pub expect_trailers: bool,
    /// retain key contents in the report (and log the FastSpace table)
    pub dump_data: bool,
    /// how many dictionary indices to try before giving up
    pub dict_probe_limit: u32,
    pub tie_break: TieBreak,
}
impl Default for Config {
    fn default() -> Config {
        Config {
            dna: 0,
            expect_trailers: false,
            dump_data: false,
            dict_probe_limit: DICT_MAXCOUNT,
            tie_break: TieBreak::KeepFirst,
        }
    }
}

/// State carried through one decode run.
pub struct DecodeContext {
    pub config: Config,
    dumped: HashSet<String>,
}
impl DecodeContext {
    pub fn new(config: Config) -> DecodeContext { DecodeContext { config, dumped: HashSet::new() } }

    /// True the first time it is called for `id` in this run.
    pub fn first_dump(&mut self, id: &str) -> bool { self.dumped.insert(id.to_string()) }
}

/// Warns about any page that FastSpace offers as free space while a decoded basis maps it.
fn cross_check_free_space(
    checks: &mut CheckLog,
    pool: &FreeSpacePool,
    maps: &[(BasisName, BasisMap)],
) {
    let mut aliased = 0;
    for (name, map) in maps.iter() {
        for (&page, va) in map.p2v.iter() {
            if let Some(pp) = pool.get(&page) {
                match pp.space_state() {
                    SpaceState::Free | SpaceState::MaybeUsed => {
                        aliased += 1;
                        checks.warn(
                            "free space",
                            format!(
                                "pp {:x} is {:?} in FastSpace but maps va {:x} of basis {}",
                                page,
                                pp.space_state(),
                                va,
                                name
                            ),
                        );
                    }
                    SpaceState::Used | SpaceState::Dirty => {}
                }
            }
        }
    }
    if aliased == 0 {
        checks.ok("free space", "no FastSpace page aliases a mapped page");
    }
}

/// Decodes every basis in `keyring` from `image`.
///
/// Only structural problems with the image itself (bad length, conflicting MBBB pages) are
/// returned as errors. Everything else, including bases whose keys are simply wrong, is
/// recorded as a check in the report.
pub fn decode(image: &[u8], keyring: &BasisKeyring, config: &Config) -> Result<DecodeReport> {
    let mut ctx = DecodeContext::new(config.clone());
    let image = PddbImage::new(image)?;
    let mut report = DecodeReport::new(*image.layout());
    decode_into(&mut ctx, &image, keyring, &mut report)?;
    Ok(report)
}

fn decode_into(
    ctx: &mut DecodeContext,
    image: &PddbImage,
    keyring: &BasisKeyring,
    report: &mut DecodeReport,
) -> Result<()> {
    let page_table = image.effective_page_table(&mut report.checks)?;

    let mut maps: Vec<(BasisName, BasisMap)> = Vec::new();
    for (name, keys) in keyring.iter() {
        log::info!("decoding basis {}", name);
        let aad = basis_aad(name.as_str(), ctx.config.dna);
        let mut basis = BasisReport::new(name.clone());
        let map = decode_page_table(ctx, &mut basis.checks, image, &page_table, keys, &aad);
        basis.stats.mapped_pages = map.v2p.len();
        basis.stats.pt_conflicts = map.conflicts;
        if map.v2p.is_empty() {
            basis.checks.fail("page table", "no page table entries decode with this key");
        }

        match decode_basis_root(image, &map, keys, &aad) {
            Ok(root) => {
                basis.checks.ok(
                    "root",
                    format!("journal {}, age {}, {} dictionaries", root.journal, root.age, root.num_dictionaries),
                );
                if root.name != name.as_str() {
                    basis.checks.warn("root", format!("root record names the basis {:?}", root.name));
                }
                let num_dicts = root.num_dictionaries;
                basis.root = Some(root);
                decode_dictionaries(ctx, image, &map, keys, &aad, num_dicts, &mut basis);
            }
            Err(e) => {
                basis.checks.fail("root", format!("basis root unreadable: {}", e));
            }
        }
        maps.push((name.clone(), map));
        report.bases.push(basis);
    }

    match keyring.system() {
        Some(system_keys) => {
            let mut fscb = FscbReport::default();
            if let Some(pool) = decode_fscb(ctx, image, system_keys, &mut fscb) {
                cross_check_free_space(&mut report.checks, &pool, &maps);
            }
            report.fscb = Some(fscb);
        }
        None => {
            report.checks.warn("fscb", "no System basis keys; free space is not decoded");
        }
    }
    log::info!("decode complete: verdict {}", report.verdict());
    Ok(())
}

/// Derives keys from a KEYROM dump and passwords, then decodes.
///
/// A wrong boot password is not fatal: the System basis is reported as failed and the
/// secret bases, whose keys do not depend on it, are still decoded.
pub fn decode_with_credentials(
    image: &[u8],
    keyrom: KeyRom,
    boot_password: &str,
    credentials: &[(BasisName, String)],
    config: &Config,
) -> Result<(DecodeReport, BasisKeyring)> {
    let mut ctx = DecodeContext::new(config.clone());
    let pddb = PddbImage::new(image)?;
    let mut report = DecodeReport::new(*pddb.layout());
    let material = KeyMaterial::new(keyrom, pddb.key_page())?;

    let mut keyring = BasisKeyring::new();
    match material.system_keys(boot_password) {
        Ok(keys) => {
            report.checks.ok("keys", "System basis keys unwrapped");
            keyring.insert(BasisName::system(), keys);
        }
        Err(e) => {
            report.checks.fail("keys", format!("could not unwrap the System basis keys: {}", e));
        }
    }
    for (name, passphrase) in credentials.iter() {
        if name.is_system() {
            continue;
        }
        keyring.insert(name.clone(), material.basis_keys(name, passphrase)?);
    }

    decode_into(&mut ctx, &pddb, &keyring, &mut report)?;
    Ok((report, keyring))
}
