//! Relayer-side RXTX mailbox state, one per mapped endpoint.

use crate::ffa::{Handle, FFA_PAGE_SIZE};

/// Retrieve response that did not fit in one RX buffer.
#[derive(Debug)]
pub struct PendingResponse {
    pub handle: Handle,
    pub data: Vec<u8>,
    /// Bytes already handed out
    pub sent: usize,
}

/// Per-endpoint RXTX buffer state.
#[derive(Debug)]
pub struct RelayerMailbox {
    /// Endpoint TX buffer (endpoint writes, relayer reads)
    pub tx: u64,
    /// Endpoint RX buffer (relayer writes, endpoint reads)
    pub rx: u64,
    pub page_count: u32,
    /// RX buffer ownership: true = relayer owns (can write), false = endpoint owns
    pub rx_held_by_relayer: bool,
    pub pending: Option<PendingResponse>,
}

impl RelayerMailbox {
    pub fn new(tx: u64, rx: u64, page_count: u32) -> Self {
        Self {
            tx,
            rx,
            page_count,
            rx_held_by_relayer: true,
            pending: None,
        }
    }

    /// Size of each buffer in bytes.
    pub fn bytes(&self) -> usize {
        self.page_count as usize * FFA_PAGE_SIZE
    }
}
