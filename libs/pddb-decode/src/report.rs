use std::fmt;

use crate::api::*;
use crate::backend::basis::BasisRoot;
use crate::backend::dictionary::DictFlags;
use crate::backend::image::Layout;
use crate::backend::key::KeyFlags;
use crate::backend::types::KeyPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckStatus {
    Ok,
    Info,
    Warn,
    Fail,
}
impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Ok => write!(f, " OK "),
            CheckStatus::Info => write!(f, "INFO"),
            CheckStatus::Warn => write!(f, "WARN"),
            CheckStatus::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub status: CheckStatus,
    /// what the check is about, e.g. "root", "fastspace" or a key name
    pub subject: String,
    pub message: String,
}
impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.status, self.subject, self.message)
    }
}

/// An ordered list of checks. Every check is also sent to the log as it is recorded.
#[derive(Debug, Clone, Default)]
pub struct CheckLog {
    checks: Vec<Check>,
}
impl CheckLog {
    fn push(&mut self, status: CheckStatus, subject: &str, message: String) {
        match status {
            CheckStatus::Ok => log::info!("{}: {}", subject, message),
            CheckStatus::Info => log::info!("{}: {}", subject, message),
            CheckStatus::Warn => log::warn!("{}: {}", subject, message),
            CheckStatus::Fail => log::error!("{}: {}", subject, message),
        }
        self.checks.push(Check { status, subject: subject.to_string(), message });
    }

    pub fn ok(&mut self, subject: &str, message: impl Into<String>) { self.push(CheckStatus::Ok, subject, message.into()) }

    pub fn info(&mut self, subject: &str, message: impl Into<String>) {
        self.push(CheckStatus::Info, subject, message.into())
    }

    pub fn warn(&mut self, subject: &str, message: impl Into<String>) {
        self.push(CheckStatus::Warn, subject, message.into())
    }

    pub fn fail(&mut self, subject: &str, message: impl Into<String>) {
        self.push(CheckStatus::Fail, subject, message.into())
    }

    pub fn checks(&self) -> &[Check] { &self.checks }

    pub fn count(&self, status: CheckStatus) -> usize { self.checks.iter().filter(|c| c.status == status).count() }
}

/// Outcome of the optional self-check trailer on a key's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailerStatus {
    Valid,
    /// the last four bytes are not a checksum of the rest
    Missing,
    /// data could not be read, so there was nothing to check
    Unchecked,
}

#[derive(Debug, Clone)]
pub struct KeyReport {
    pub name: String,
    /// descriptor slot within the dictionary; slot 0 is the dictionary header
    pub slot: usize,
    pub start: VirtAddr,
    pub len: u64,
    pub reserved: u64,
    pub age: u32,
    pub flags: KeyFlags,
    pub pool: KeyPool,
    pub data_readable: bool,
    pub trailer: TrailerStatus,
    /// key contents, only retained when dumping is enabled
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct DictReport {
    pub index: u32,
    pub name: String,
    pub age: u32,
    pub flags: DictFlags,
    pub declared_keys: u32,
    pub free_key_index: u32,
    pub keys: Vec<KeyReport>,
    pub checks: CheckLog,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BasisStats {
    pub mapped_pages: usize,
    pub pt_conflicts: usize,
    pub dictionaries: usize,
    pub keys: usize,
    pub key_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct BasisReport {
    pub name: BasisName,
    pub root: Option<BasisRoot>,
    pub stats: BasisStats,
    pub dicts: Vec<DictReport>,
    pub checks: CheckLog,
}
impl BasisReport {
    pub fn new(name: BasisName) -> BasisReport {
        BasisReport { name, root: None, stats: BasisStats::default(), dicts: Vec::new(), checks: CheckLog::default() }
    }

    pub fn dict(&self, name: &str) -> Option<&DictReport> { self.dicts.iter().find(|d| d.name == name) }
}

#[derive(Debug, Clone, Default)]
pub struct FscbReport {
    /// index within the FSCB of the first FastSpace page, if one was found
    pub fastspace_page: Option<usize>,
    pub free: usize,
    pub maybe_used: usize,
    pub used: usize,
    pub dirty: usize,
    pub updates_applied: usize,
    pub updates_stale: usize,
    pub updates_orphaned: usize,
    pub updates_invalid: usize,
    pub checks: CheckLog,
}

#[derive(Debug, Clone)]
pub struct DecodeReport {
    pub layout: Layout,
    /// checks that are not about any one basis: key derivation, MBBB, cross-checks
    pub checks: CheckLog,
    pub fscb: Option<FscbReport>,
    pub bases: Vec<BasisReport>,
}
impl DecodeReport {
    pub fn new(layout: Layout) -> DecodeReport {
        DecodeReport { layout, checks: CheckLog::default(), fscb: None, bases: Vec::new() }
    }

    pub fn basis(&self, name: &str) -> Option<&BasisReport> { self.bases.iter().find(|b| b.name.as_str() == name) }

    pub fn all_checks(&self) -> impl Iterator<Item = &Check> {
        self.checks
            .checks()
            .iter()
            .chain(self.fscb.iter().flat_map(|f| f.checks.checks().iter()))
            .chain(self.bases.iter().flat_map(|b| {
                b.checks.checks().iter().chain(b.dicts.iter().flat_map(|d| d.checks.checks().iter()))
            }))
    }

    pub fn count(&self, status: CheckStatus) -> usize { self.all_checks().filter(|c| c.status == status).count() }

    /// FAIL if any check failed, WARN if any warned, OK otherwise. INFO never affects the verdict.
    pub fn verdict(&self) -> CheckStatus {
        if self.count(CheckStatus::Fail) > 0 {
            CheckStatus::Fail
        } else if self.count(CheckStatus::Warn) > 0 {
            CheckStatus::Warn
        } else {
            CheckStatus::Ok
        }
    }

    pub fn passed(&self) -> bool { self.verdict() != CheckStatus::Fail }
}

fn write_checks(f: &mut fmt::Formatter<'_>, indent: &str, checks: &CheckLog) -> fmt::Result {
    for check in checks.checks() {
        writeln!(f, "{}{}", indent, check)?;
    }
    Ok(())
}

impl fmt::Display for DecodeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "PDDB image: {} pages, data region at {:#x} ({} pages)",
            self.layout.total_pages, self.layout.data_phys_base, self.layout.data_pages
        )?;
        write_checks(f, "  ", &self.checks)?;
        if let Some(fscb) = &self.fscb {
            writeln!(
                f,
                "FastSpace: {} free, {} maybe-used, {} used, {} dirty; updates {} applied, {} stale, {} orphaned, {} invalid",
                fscb.free,
                fscb.maybe_used,
                fscb.used,
                fscb.dirty,
                fscb.updates_applied,
                fscb.updates_stale,
                fscb.updates_orphaned,
                fscb.updates_invalid
            )?;
            write_checks(f, "  ", &fscb.checks)?;
        }
        for basis in self.bases.iter() {
            writeln!(f, "Basis {}", basis.name)?;
            if let Some(root) = &basis.root {
                writeln!(
                    f,
                    "  journal {}, version {:08x}, age {}, {} dictionaries",
                    root.journal, root.version, root.age, root.num_dictionaries
                )?;
            }
            let s = &basis.stats;
            writeln!(
                f,
                "  {} mapped pages, {} page table conflicts, {} dicts, {} keys, {} bytes of key data",
                s.mapped_pages, s.pt_conflicts, s.dictionaries, s.keys, s.key_bytes
            )?;
            write_checks(f, "  ", &basis.checks)?;
            for dict in basis.dicts.iter() {
                writeln!(
                    f,
                    "  Dict '{}' (index {}, age {}): {}/{} keys",
                    dict.name,
                    dict.index,
                    dict.age,
                    dict.keys.len(),
                    dict.declared_keys
                )?;
                write_checks(f, "    ", &dict.checks)?;
                for key in dict.keys.iter() {
                    writeln!(
                        f,
                        "    Key '{}' @{:x} len {} resv {} age {} {:?}",
                        key.name, key.start, key.len, key.reserved, key.age, key.pool
                    )?;
                    if let Some(data) = &key.data {
                        for line in data.chunks(32) {
                            writeln!(f, "      {}", hex::encode(line))?;
                        }
                    }
                }
            }
        }
        writeln!(f, "Verdict: {}", self.verdict())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict() {
        let layout = Layout::for_len(64 * PAGE_SIZE).unwrap();
        let mut report = DecodeReport::new(layout);
        report.checks.info("mbbb", "nothing to restore");
        assert_eq!(report.verdict(), CheckStatus::Ok);

        let mut basis = BasisReport::new(BasisName::system());
        basis.checks.warn("dicts", "found 1 of 2");
        report.bases.push(basis);
        assert_eq!(report.verdict(), CheckStatus::Warn);
        assert!(report.passed());

        report.checks.fail("keys", "unwrap failed");
        assert_eq!(report.verdict(), CheckStatus::Fail);
        assert!(!report.passed());
        assert_eq!(report.count(CheckStatus::Info), 1);
        assert!(format!("{}", report).contains("Verdict: FAIL"));
    }
}
