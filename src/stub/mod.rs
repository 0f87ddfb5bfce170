//! In-process reference relayer.
//!
//! Implements the memory management side of an FF-A v1.1 relayer over the
//! simulated arena: RXTX mailboxes, DONATE/LEND/SHARE, retrieve with
//! fragmented responses, relinquish and reclaim. It validates every call
//! the way a conforming hypervisor or SPMC would, so the suite can run
//! end to end without hardware. [`Quirks`] switch individual checks off to
//! model a relayer that accepts calls it should reject.

mod mailbox;
mod memory;
pub mod ownership;
pub mod records;

use std::collections::BTreeMap;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::config::Config;
use crate::ffa::*;
use crate::mm::PhysMemory;
use crate::suite::LeakProbe;
use mailbox::RelayerMailbox;
use ownership::PageTable;
use records::ShareTable;

/// Checks a [`StubRelayer`] can be told to skip.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Quirks {
    /// Accept transfers regardless of endpoint, flag, permission and
    /// attribute rules. Descriptor parsing and page checks still apply.
    pub skip_transfer_checks: bool,
    /// Accept retrieve requests for any known handle regardless of
    /// sender, tag, receiver, flag, permission and attribute rules.
    pub skip_retrieve_checks: bool,
}

#[derive(Debug, Clone)]
pub struct StubConfig {
    /// Endpoints the relayer knows about
    pub partitions: Vec<EndpointId>,
    /// (base, size) of MMIO ranges that may never be transferred
    pub device_regions: Vec<(u64, u64)>,
    pub max_rxtx_pages: u32,
    /// Upper bound on a retrieve response fragment in bytes, 0 for the RX
    /// buffer size
    pub max_fragment: usize,
    /// Function IDs FFA_FEATURES reports
    pub supported: Vec<u64>,
    /// Receiver address window used when a retrieve asks for an aligned
    /// mapping
    pub aligned_window: u64,
    /// Largest alignment hint `n` the relayer can honour
    pub max_alignment_order: u8,
    pub quirks: Quirks,
}

impl StubConfig {
    pub fn new(partitions: Vec<EndpointId>) -> Self {
        Self {
            partitions,
            device_regions: Vec::new(),
            max_rxtx_pages: 4,
            max_fragment: 0,
            supported: vec![
                FFA_VERSION,
                FFA_FEATURES,
                FFA_ID_GET,
                FFA_RXTX_MAP_32,
                FFA_RXTX_MAP_64,
                FFA_RXTX_UNMAP,
                FFA_RX_RELEASE,
                FFA_MEM_DONATE_32,
                FFA_MEM_DONATE_64,
                FFA_MEM_LEND_32,
                FFA_MEM_LEND_64,
                FFA_MEM_SHARE_32,
                FFA_MEM_SHARE_64,
                FFA_MEM_RETRIEVE_REQ_32,
                FFA_MEM_RETRIEVE_REQ_64,
                FFA_MEM_RELINQUISH,
                FFA_MEM_RECLAIM,
                FFA_MEM_FRAG_RX,
            ],
            aligned_window: 0x1_0000_0000,
            max_alignment_order: 9,
            quirks: Quirks::default(),
        }
    }

    /// Relayer for the partitions and UARTs a run configuration names.
    pub fn for_config(config: &Config) -> Self {
        Self::new(vec![config.client_id, config.server_id, config.third_party_id])
            .with_device_region(config.s_uart_base, config.uart_size)
            .with_device_region(config.ns_uart_base, config.uart_size)
    }

    pub fn with_device_region(mut self, base: u64, size: u64) -> Self {
        self.device_regions.push((base, size));
        self
    }

    /// Stop reporting and accepting `fid`.
    pub fn without(mut self, fid: u64) -> Self {
        self.supported.retain(|&f| f != fid);
        self
    }

    pub fn with_quirks(mut self, quirks: Quirks) -> Self {
        self.quirks = quirks;
        self
    }

    fn is_partition(&self, id: EndpointId) -> bool {
        self.partitions.contains(&id)
    }

    fn is_device(&self, addr: u64, len: u64) -> bool {
        self.device_regions
            .iter()
            .any(|&(base, size)| addr < base + size && base < addr + len)
    }
}

#[derive(Default)]
struct State {
    mailboxes: BTreeMap<EndpointId, RelayerMailbox>,
    shares: ShareTable,
    pages: PageTable,
    /// Next free address in the aligned receiver window
    window_next: u64,
}

pub struct StubRelayer {
    memory: PhysMemory,
    config: StubConfig,
    state: Mutex<State>,
}

impl StubRelayer {
    pub fn new(memory: PhysMemory, config: StubConfig) -> Self {
        let state = State {
            window_next: config.aligned_window,
            ..State::default()
        };
        Self {
            memory,
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &StubConfig {
        &self.config
    }

    /// Endpoints with an RXTX pair currently mapped.
    pub fn mapped_mailboxes(&self) -> usize {
        self.state.lock().mailboxes.len()
    }

    /// Handles not yet reclaimed.
    pub fn outstanding_handles(&self) -> usize {
        self.state.lock().shares.active_count()
    }

    /// Pages currently part of a transaction.
    pub fn pages_in_use(&self) -> usize {
        self.state.lock().pages.in_use()
    }

    /// Whether `caller` owns its RX buffer right now.
    pub fn rx_held_by(&self, caller: EndpointId) -> bool {
        self.state
            .lock()
            .mailboxes
            .get(&caller)
            .is_some_and(|mb| !mb.rx_held_by_relayer)
    }

    fn dispatch(&self, st: &mut State, caller: EndpointId, args: &FfaArgs) -> Result<FfaArgs, FfaError> {
        if !self.config.supported.contains(&args.fid) {
            return Err(FfaError::NotSupported);
        }
        match args.fid {
            FFA_VERSION => Ok(self.handle_version()),
            FFA_ID_GET => Ok(self.handle_id_get(caller)),
            FFA_FEATURES => self.handle_features(args),
            FFA_RXTX_MAP_32 | FFA_RXTX_MAP_64 => self.handle_rxtx_map(st, caller, args),
            FFA_RXTX_UNMAP => self.handle_rxtx_unmap(st, caller, args),
            FFA_RX_RELEASE => self.handle_rx_release(st, caller, args),

            FFA_MEM_DONATE_32 | FFA_MEM_DONATE_64 | FFA_MEM_LEND_32 | FFA_MEM_LEND_64
            | FFA_MEM_SHARE_32 | FFA_MEM_SHARE_64 => self.handle_mem_transfer(st, caller, args),
            FFA_MEM_RETRIEVE_REQ_32 | FFA_MEM_RETRIEVE_REQ_64 => {
                self.handle_mem_retrieve_req(st, caller, args)
            }
            FFA_MEM_FRAG_RX => self.handle_mem_frag_rx(st, caller, args),
            FFA_MEM_RELINQUISH => self.handle_mem_relinquish(st, caller),
            FFA_MEM_RECLAIM => self.handle_mem_reclaim(st, caller, args),

            _ => Err(FfaError::NotSupported),
        }
    }

    // ── Locally Handled ──────────────────────────────────────────────

    /// FFA_VERSION: x0 = FFA_VERSION_1_1, whatever the caller asked for.
    fn handle_version(&self) -> FfaArgs {
        FfaArgs::new(FFA_VERSION_1_1 as u64)
    }

    /// FFA_ID_GET: x2 = caller's partition ID.
    fn handle_id_get(&self, caller: EndpointId) -> FfaArgs {
        let mut ret = FfaArgs::success();
        ret.arg2 = caller as u64;
        ret
    }

    fn handle_features(&self, args: &FfaArgs) -> Result<FfaArgs, FfaError> {
        if self.config.supported.contains(&args.arg1) {
            Ok(FfaArgs::success())
        } else {
            Err(FfaError::NotSupported)
        }
    }

    // ── RXTX Mailbox ─────────────────────────────────────────────────

    /// FFA_RXTX_MAP: x1 = TX address, x2 = RX address, x3 = page count.
    fn handle_rxtx_map(
        &self,
        st: &mut State,
        caller: EndpointId,
        args: &FfaArgs,
    ) -> Result<FfaArgs, FfaError> {
        let (tx, rx) = (args.arg1, args.arg2);
        let page_count = (args.arg3 & 0x3F) as u32;
        let bytes = page_count as u64 * FFA_PAGE_SIZE as u64;

        require(
            page_count > 0 && page_count <= self.config.max_rxtx_pages,
            FfaError::InvalidParameters,
            "mailbox page count out of range",
        )?;
        require(
            tx % FFA_PAGE_SIZE as u64 == 0 && rx % FFA_PAGE_SIZE as u64 == 0,
            FfaError::InvalidParameters,
            "mailbox buffers not page aligned",
        )?;
        require(
            self.memory.contains(tx, bytes) && self.memory.contains(rx, bytes),
            FfaError::InvalidParameters,
            "mailbox buffers outside memory",
        )?;
        require(
            tx + bytes <= rx || rx + bytes <= tx,
            FfaError::InvalidParameters,
            "TX and RX overlap",
        )?;
        require(
            !st.mailboxes.contains_key(&caller),
            FfaError::Denied,
            "mailbox already mapped",
        )?;

        st.mailboxes
            .insert(caller, RelayerMailbox::new(tx, rx, page_count));
        info!(
            "[relayer] {:#06x} mapped TX={:#x} RX={:#x} ({} page(s))",
            caller, tx, rx, page_count
        );
        Ok(FfaArgs::success())
    }

    /// FFA_RXTX_UNMAP: x1[31:16] = endpoint ID (0 for the caller).
    ///
    /// Transactions the caller sent that nobody retrieved expire with the
    /// mailbox.
    fn handle_rxtx_unmap(
        &self,
        st: &mut State,
        caller: EndpointId,
        args: &FfaArgs,
    ) -> Result<FfaArgs, FfaError> {
        let id = ((args.arg1 >> 16) & 0xFFFF) as u16;
        require(
            id == 0 || id == caller,
            FfaError::InvalidParameters,
            "unmap for another endpoint",
        )?;
        require(
            st.mailboxes.remove(&caller).is_some(),
            FfaError::Denied,
            "no mailbox mapped",
        )?;

        for record in st.shares.expire_unretrieved(caller) {
            warn!(
                "[relayer] handle {} expired with {:#06x}'s mailbox",
                record.handle, caller
            );
            st.pages.release(record.handle);
        }
        info!("[relayer] {:#06x} unmapped", caller);
        Ok(FfaArgs::success())
    }

    /// FFA_RX_RELEASE: hand the caller's RX buffer back to the relayer.
    fn handle_rx_release(
        &self,
        st: &mut State,
        caller: EndpointId,
        args: &FfaArgs,
    ) -> Result<FfaArgs, FfaError> {
        let id = (args.arg1 & 0xFFFF) as u16;
        require(
            id == 0 || id == caller,
            FfaError::InvalidParameters,
            "release for another endpoint",
        )?;
        let mb = st
            .mailboxes
            .get_mut(&caller)
            .ok_or_else(|| reject(FfaError::Denied, "no mailbox mapped"))?;
        require(
            !mb.rx_held_by_relayer,
            FfaError::Denied,
            "RX buffer not held by the caller",
        )?;
        mb.rx_held_by_relayer = true;
        Ok(FfaArgs::success())
    }
}

impl Relayer for StubRelayer {
    fn call(&self, caller: EndpointId, args: FfaArgs) -> FfaArgs {
        let mut st = self.state.lock();
        self.dispatch(&mut st, caller, &args)
            .unwrap_or_else(FfaArgs::error)
    }
}

impl LeakProbe for StubRelayer {
    fn mapped_mailboxes(&self) -> usize {
        StubRelayer::mapped_mailboxes(self)
    }

    fn outstanding_handles(&self) -> usize {
        StubRelayer::outstanding_handles(self)
    }
}

// ── Helper ───────────────────────────────────────────────────────────

fn reject(code: FfaError, why: &str) -> FfaError {
    debug!("[relayer] {}: {}", code, why);
    code
}

/// Fail with `code` unless `cond` holds.
fn require(cond: bool, code: FfaError, why: &str) -> Result<(), FfaError> {
    if cond {
        Ok(())
    } else {
        Err(reject(code, why))
    }
}
