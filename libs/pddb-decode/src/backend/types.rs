use bitfield::bitfield;

use crate::api::*;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum SpaceState {
    /// pages that are completely un-spoken for
    Free = 0,
    /// pages that are in the process of being used, but the journal has yet to be committed
    /// in other words, these are pages that might be in the RAM cache.
    MaybeUsed = 1,
    /// pages that are confirmed fully used
    Used = 2,
    /// pages that are no longer used and need to be erased
    Dirty = 3,
}
impl From<u8> for SpaceState {
    fn from(arg: u8) -> Self {
        match arg & 0x3 {
            0 => SpaceState::Free,
            1 => SpaceState::MaybeUsed,
            2 => SpaceState::Used,
            _ => SpaceState::Dirty,
        }
    }
}
impl From<SpaceState> for u8 {
    fn from(arg: SpaceState) -> Self { arg as u8 }
}

bitfield! {
    /// A physical page reference, as it appears in FastSpace, SpaceUpdate records and the
    /// reverse maps. Physical page numbers are relative to the start of the data region.
    #[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct PhysPage(u32);
    impl Debug;
    pub u32, page_number, set_page_number: 19, 0;
    pub clean, set_clean: 20;
    pub valid, set_valid: 21;
    u8, space_state_raw, set_space_state_raw: 23, 22;
    /// 4-bit journal counter, only meaningful in the free space structures
    pub u8, journal, set_journal: 27, 24;
}
impl PhysPage {
    pub fn space_state(&self) -> SpaceState { SpaceState::from(self.space_state_raw()) }

    pub fn set_space_state(&mut self, state: SpaceState) { self.set_space_state_raw(state.into()) }

    /// A clean, valid reference to `page_number`, as produced by a page table scan.
    pub fn mapped(page_number: u32) -> PhysPage {
        let mut pp = PhysPage(0);
        pp.set_page_number(page_number);
        pp.set_clean(true);
        pp.set_valid(true);
        pp
    }

    /// True if `self` carries a strictly newer 4-bit journal than `other`. The counter wraps,
    /// so a forward distance of 1..=7 counts as newer.
    pub fn journal_newer_than(&self, other: &PhysPage) -> bool {
        let distance = self.journal().wrapping_sub(other.journal()) & 0xF;
        (1..=7).contains(&distance)
    }
}
impl From<u32> for PhysPage {
    fn from(raw: u32) -> Self { PhysPage(raw) }
}
impl From<PhysPage> for u32 {
    fn from(pp: PhysPage) -> Self { pp.0 }
}

/// Which allocation pool a key's data address falls in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeyPool {
    /// below the small pool: the address lands inside the dictionary index space
    Metadata,
    Small,
    Medium,
    Large,
}
impl From<VirtAddr> for KeyPool {
    fn from(va: VirtAddr) -> Self {
        if va < SMALL_POOL_START {
            KeyPool::Metadata
        } else if va < MEDIUM_POOL_START {
            KeyPool::Small
        } else if va < LARGE_POOL_START {
            KeyPool::Medium
        } else {
            KeyPool::Large
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physpage_fields() {
        let mut pp = PhysPage::mapped(0x1234);
        assert_eq!(pp.page_number(), 0x1234);
        assert!(pp.clean() && pp.valid());
        pp.set_space_state(SpaceState::Dirty);
        pp.set_journal(0xA);
        let raw: u32 = pp.into();
        assert_eq!(raw, 0x0A00_0000 | 0x00C0_0000 | 0x0030_0000 | 0x1234);
        assert_eq!(PhysPage::from(raw).space_state(), SpaceState::Dirty);
    }

    #[test]
    fn test_journal_ordering() {
        let mut three = PhysPage::mapped(1);
        three.set_journal(3);
        let mut seven = PhysPage::mapped(1);
        seven.set_journal(7);
        assert!(seven.journal_newer_than(&three));
        assert!(!three.journal_newer_than(&seven));
        assert!(!three.journal_newer_than(&three));
        // wraparound: 1 follows 15
        let mut fifteen = PhysPage::mapped(1);
        fifteen.set_journal(15);
        let mut one = PhysPage::mapped(1);
        one.set_journal(1);
        assert!(one.journal_newer_than(&fifteen));
    }

    #[test]
    fn test_pool_classification() {
        assert_eq!(KeyPool::from(DICT_VSIZE), KeyPool::Metadata);
        assert_eq!(KeyPool::from(SMALL_POOL_START), KeyPool::Small);
        assert_eq!(KeyPool::from(MEDIUM_POOL_START + 1), KeyPool::Medium);
        assert_eq!(KeyPool::from(LARGE_POOL_START), KeyPool::Large);
    }
}
