//! Endpoint-side ABI calls.
//!
//! Thin wrappers that marshal one FF-A call into [`FfaArgs`], hand it to the
//! relayer and return the raw response. Interpreting the response is the
//! driver's job; nothing here decides success or failure.

use std::sync::Arc;

use log::debug;

use super::*;
use crate::mm::PhysMemory;

/// One partition's view of the FF-A interface.
#[derive(Clone)]
pub struct Endpoint {
    pub id: EndpointId,
    relayer: Arc<dyn Relayer>,
    memory: PhysMemory,
}

impl Endpoint {
    pub fn new(id: EndpointId, relayer: Arc<dyn Relayer>, memory: PhysMemory) -> Self {
        Self {
            id,
            relayer,
            memory,
        }
    }

    pub fn memory(&self) -> &PhysMemory {
        &self.memory
    }

    /// Issue a raw call. Every call in the crate funnels through here.
    pub fn call(&self, args: FfaArgs) -> FfaArgs {
        debug!(
            "[{:#06x}] -> {} w1={:#x} w2={:#x} w3={:#x} w4={:#x}",
            self.id,
            fid_name(args.fid),
            args.arg1,
            args.arg2,
            args.arg3,
            args.arg4
        );
        let ret = self.relayer.call(self.id, args);
        match ret.error_code() {
            Some(code) => debug!("[{:#06x}] <- FFA_ERROR {}", self.id, code),
            None if ret.is_error() => {
                debug!("[{:#06x}] <- FFA_ERROR raw {}", self.id, ret.raw_error())
            }
            None => debug!(
                "[{:#06x}] <- {} w1={:#x} w2={:#x} w3={:#x}",
                self.id,
                fid_name(ret.fid),
                ret.arg1,
                ret.arg2,
                ret.arg3
            ),
        }
        ret
    }

    pub fn version(&self, requested: u32) -> FfaArgs {
        let mut args = FfaArgs::new(FFA_VERSION);
        args.arg1 = requested as u64;
        self.call(args)
    }

    pub fn features(&self, fid: u64) -> FfaArgs {
        let mut args = FfaArgs::new(FFA_FEATURES);
        args.arg1 = fid;
        self.call(args)
    }

    /// True if the relayer reports `fid` as implemented.
    pub fn supports(&self, fid: u64) -> bool {
        !self.features(fid).is_error()
    }

    pub fn id_get(&self) -> FfaArgs {
        self.call(FfaArgs::new(FFA_ID_GET))
    }

    pub fn rxtx_map(&self, tx: u64, rx: u64, pages: u32) -> FfaArgs {
        let mut args = FfaArgs::new(FFA_RXTX_MAP_64);
        args.arg1 = tx;
        args.arg2 = rx;
        args.arg3 = pages as u64;
        self.call(args)
    }

    pub fn rxtx_unmap(&self) -> FfaArgs {
        let mut args = FfaArgs::new(FFA_RXTX_UNMAP);
        args.arg1 = (self.id as u64) << 16;
        self.call(args)
    }

    pub fn rx_release(&self) -> FfaArgs {
        let mut args = FfaArgs::new(FFA_RX_RELEASE);
        args.arg1 = self.id as u64;
        self.call(args)
    }

    /// DONATE/LEND/SHARE (any width) of a descriptor already in TX.
    pub fn mem_transfer(&self, fid: u64, total: u32, fragment: u32) -> FfaArgs {
        let mut args = FfaArgs::new(fid);
        args.arg1 = total as u64;
        args.arg2 = fragment as u64;
        self.call(args)
    }

    /// RETRIEVE_REQ of a request already in TX.
    pub fn mem_retrieve(&self, fid: u64, total: u32, fragment: u32) -> FfaArgs {
        self.mem_transfer(fid, total, fragment)
    }

    /// RELINQUISH of a descriptor already in TX.
    pub fn mem_relinquish(&self) -> FfaArgs {
        self.call(FfaArgs::new(FFA_MEM_RELINQUISH))
    }

    pub fn mem_reclaim(&self, handle: Handle, flags: u32) -> FfaArgs {
        let (lo, hi) = handle.to_regs();
        let mut args = FfaArgs::new(FFA_MEM_RECLAIM);
        args.arg1 = lo;
        args.arg2 = hi;
        args.arg3 = flags as u64;
        self.call(args)
    }

    /// Ask for the next fragment of a retrieve response, starting at byte
    /// `offset` of the full descriptor.
    pub fn mem_frag_rx(&self, handle: Handle, offset: u32) -> FfaArgs {
        let (lo, hi) = handle.to_regs();
        let mut args = FfaArgs::new(FFA_MEM_FRAG_RX);
        args.arg1 = lo;
        args.arg2 = hi;
        args.arg3 = offset as u64;
        self.call(args)
    }
}
