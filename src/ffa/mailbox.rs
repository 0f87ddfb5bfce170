//! Per-endpoint RX/TX mailbox pair.
//!
//! A [`MailboxPair`] owns two page spans mapped with the relayer through one
//! `FFA_RXTX_MAP` call. [`MailboxPair::release`] unmaps and frees them; if a
//! pair is dropped without being released (early return on an error path)
//! the same teardown runs from `Drop`.

use log::{error, warn};
use thiserror::Error;

use super::abi::Endpoint;
use super::CallError;
use crate::mm::{MmError, PageSpan};

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("mailbox allocation failed: {0}")]
    Alloc(#[from] MmError),
    #[error("FFA_RXTX_MAP failed: {0}")]
    Map(CallError),
    #[error("FFA_RXTX_UNMAP failed: {0}")]
    Unmap(CallError),
    #[error("FFA_RX_RELEASE failed: {0}")]
    RxRelease(CallError),
    #[error("mailbox access failed: {0}")]
    Access(MmError),
}

pub struct MailboxPair<'a> {
    endpoint: &'a Endpoint,
    tx: PageSpan,
    rx: PageSpan,
    /// The relayer has filled RX and ownership has not been handed back yet.
    rx_held: bool,
    released: bool,
}

impl<'a> MailboxPair<'a> {
    /// Allocate `pages` pages each for TX and RX and map them.
    ///
    /// On failure nothing stays allocated or mapped.
    pub fn acquire(endpoint: &'a Endpoint, pages: u32) -> Result<Self, MailboxError> {
        let mem = endpoint.memory();
        let tx = mem.alloc(pages as u64)?;
        let rx = match mem.alloc(pages as u64) {
            Ok(rx) => rx,
            Err(e) => {
                mem.free(tx);
                return Err(e.into());
            }
        };

        if let Err(e) = endpoint.rxtx_map(tx.pa, rx.pa, pages).expect_success() {
            mem.free(tx);
            mem.free(rx);
            return Err(MailboxError::Map(e));
        }

        Ok(Self {
            endpoint,
            tx,
            rx,
            rx_held: false,
            released: false,
        })
    }

    pub fn endpoint(&self) -> &'a Endpoint {
        self.endpoint
    }

    pub fn tx(&self) -> PageSpan {
        self.tx
    }

    pub fn rx(&self) -> PageSpan {
        self.rx
    }

    /// Size of each buffer in bytes.
    pub fn buffer_len(&self) -> usize {
        self.tx.bytes()
    }

    /// Run `f` over the TX buffer.
    pub fn write_tx<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, MailboxError> {
        self.endpoint
            .memory()
            .with_span_mut(self.tx, f)
            .map_err(MailboxError::Access)
    }

    /// Copy the first `len` bytes out of RX.
    pub fn read_rx(&self, len: usize) -> Result<Vec<u8>, MailboxError> {
        if len > self.rx.bytes() {
            return Err(MailboxError::Access(MmError::OutOfRange {
                addr: self.rx.pa,
                len: len as u64,
            }));
        }
        self.endpoint
            .memory()
            .read_vec(self.rx.pa, len)
            .map_err(MailboxError::Access)
    }

    /// Record that the relayer has written RX (a retrieve response or a
    /// fragment) and the endpoint now owns it.
    pub fn mark_rx_held(&mut self) {
        self.rx_held = true;
    }

    pub fn rx_held(&self) -> bool {
        self.rx_held
    }

    /// Hand RX back to the relayer.
    pub fn rx_release(&mut self) -> Result<(), MailboxError> {
        self.endpoint
            .rx_release()
            .expect_success()
            .map_err(MailboxError::RxRelease)?;
        self.rx_held = false;
        Ok(())
    }

    /// Unmap and free both buffers.
    ///
    /// The buffers are freed even when the unmap fails; the unmap error is
    /// what gets reported.
    pub fn release(mut self) -> Result<(), MailboxError> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), MailboxError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let unmap = self
            .endpoint
            .rxtx_unmap()
            .expect_success()
            .map(|_| ())
            .map_err(MailboxError::Unmap);
        if let Err(e) = &unmap {
            error!("[{:#06x}] {}", self.endpoint.id, e);
        }

        let mem = self.endpoint.memory();
        mem.free(self.tx);
        mem.free(self.rx);
        unmap
    }
}

impl Drop for MailboxPair<'_> {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                "[{:#06x}] mailbox dropped without release, unmapping",
                self.endpoint.id
            );
            let _ = self.teardown();
        }
    }
}
