//! Transaction records kept by the stub relayer, one per live handle.

use std::collections::BTreeMap;

use crate::ffa::descriptors::{Constituent, DataAccess, MemAttributes, RegionFlags};
use crate::ffa::{EndpointId, Handle, TransferKind};

/// Memory share record.
#[derive(Debug, Clone)]
pub struct ShareRecord {
    pub handle: Handle,
    pub kind: TransferKind,
    pub sender: EndpointId,
    pub receiver: EndpointId,
    pub tag: u64,
    /// Flags the sender transferred with
    pub flags: RegionFlags,
    /// Access the sender granted
    pub data_access: DataAccess,
    pub attributes: MemAttributes,
    pub constituents: Vec<Constituent>,
    /// Endpoint currently holding the region retrieved.
    pub retrieved_by: Option<EndpointId>,
    /// Requested by the borrower at retrieve time.
    pub zero_after_relinquish: bool,
}

impl ShareRecord {
    pub fn total_page_count(&self) -> u64 {
        self.constituents.iter().map(|c| c.page_count as u64).sum()
    }
}

pub struct ShareTable {
    next_handle: u64,
    records: BTreeMap<Handle, ShareRecord>,
}

impl Default for ShareTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ShareTable {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            records: BTreeMap::new(),
        }
    }

    fn alloc_handle(&mut self) -> Handle {
        let handle = Handle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// Store `record` under a fresh handle and return it.
    pub fn insert(&mut self, mut record: ShareRecord) -> Handle {
        let handle = self.alloc_handle();
        record.handle = handle;
        self.records.insert(handle, record);
        handle
    }

    pub fn lookup(&self, handle: Handle) -> Option<&ShareRecord> {
        self.records.get(&handle)
    }

    pub fn lookup_mut(&mut self, handle: Handle) -> Option<&mut ShareRecord> {
        self.records.get_mut(&handle)
    }

    /// Mark a share as retrieved. Returns true if found and was not already retrieved.
    pub fn mark_retrieved(&mut self, handle: Handle, by: EndpointId) -> bool {
        match self.records.get_mut(&handle) {
            Some(r) if r.retrieved_by.is_none() => {
                r.retrieved_by = Some(by);
                true
            }
            _ => false,
        }
    }

    /// Mark a share as relinquished. Returns true if found and was retrieved.
    pub fn mark_relinquished(&mut self, handle: Handle) -> bool {
        match self.records.get_mut(&handle) {
            Some(r) if r.retrieved_by.is_some() => {
                r.retrieved_by = None;
                r.zero_after_relinquish = false;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, handle: Handle) -> Option<ShareRecord> {
        self.records.remove(&handle)
    }

    /// Drop every record `sender` transferred that nobody has retrieved.
    pub fn expire_unretrieved(&mut self, sender: EndpointId) -> Vec<ShareRecord> {
        let expired: Vec<Handle> = self
            .records
            .values()
            .filter(|r| r.sender == sender && r.retrieved_by.is_none())
            .map(|r| r.handle)
            .collect();
        expired
            .into_iter()
            .filter_map(|h| self.records.remove(&h))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.records.len()
    }
}
