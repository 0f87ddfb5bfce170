//! Page ownership tracking for the stub relayer.
//!
//! A page with no entry is owned by whichever endpoint presents it: the
//! arena is identity mapped and carries no per-partition stage-2 view. An
//! entry exists while the page is part of an active transaction.

use std::collections::BTreeMap;

use crate::ffa::descriptors::{pages_of, Constituent};
use crate::ffa::{FfaError, Handle, TransferKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOwnership {
    Owned,
    SharedOwned,
    Lent,
    Donated,
}

impl From<TransferKind> for PageOwnership {
    fn from(kind: TransferKind) -> Self {
        match kind {
            TransferKind::Share => Self::SharedOwned,
            TransferKind::Lend => Self::Lent,
            TransferKind::Donate => Self::Donated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry {
    pub ownership: PageOwnership,
    pub handle: Handle,
}

/// Validate that a page can be transferred (must be in OWNED state).
pub fn validate_page_for_transfer(state: PageOwnership) -> Result<(), FfaError> {
    match state {
        PageOwnership::Owned => Ok(()),
        _ => Err(FfaError::Denied),
    }
}

#[derive(Debug, Default)]
pub struct PageTable {
    pages: BTreeMap<u64, PageEntry>,
}

impl PageTable {
    pub fn entry(&self, pa: u64) -> Option<PageEntry> {
        self.pages.get(&pa).copied()
    }

    pub fn state(&self, pa: u64) -> PageOwnership {
        self.entry(pa).map_or(PageOwnership::Owned, |e| e.ownership)
    }

    /// Move every page of a new transaction out of OWNED.
    pub fn claim(&mut self, constituents: &[Constituent], kind: TransferKind, handle: Handle) {
        let entry = PageEntry {
            ownership: kind.into(),
            handle,
        };
        for pa in pages_of(constituents) {
            self.pages.insert(pa, entry);
        }
    }

    /// Return every page held by `handle` to OWNED.
    pub fn release(&mut self, handle: Handle) {
        self.pages.retain(|_, e| e.handle != handle);
    }

    pub fn in_use(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_and_release() {
        let mut table = PageTable::default();
        let region = [Constituent::new(0x4000_0000, 2), Constituent::new(0x4001_0000, 1)];
        table.claim(&region, TransferKind::Lend, Handle(3));
        assert_eq!(table.in_use(), 3);
        assert_eq!(table.state(0x4000_1000), PageOwnership::Lent);
        assert_eq!(
            validate_page_for_transfer(table.state(0x4001_0000)),
            Err(FfaError::Denied)
        );
        assert_eq!(table.state(0x4000_2000), PageOwnership::Owned);

        table.release(Handle(3));
        assert_eq!(table.in_use(), 0);
        assert!(validate_page_for_transfer(table.state(0x4000_0000)).is_ok());
    }
}
