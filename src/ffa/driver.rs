//! Memory transaction lifecycle.
//!
//! ```text
//! Unallocated --DONATE/LEND/SHARE--> Transferred --RETRIEVE--> Retrieved
//!      ^                                  |                        |
//!      +------------RECLAIM---------------+<--- Relinquished <-----+
//! ```
//!
//! A [`Transaction`] is one endpoint's view of a handle. The sender's copy
//! stays `Transferred` while the receiver works, and moves on when the
//! receiver reports back over the channel. Every step compares the exact
//! response function ID and error code.

use log::{debug, error, info, warn};

use super::abi::Endpoint;
use super::channel::Handoff;
use super::descriptors::{
    build_relinquish, build_retrieve_request, build_transfer, pages_of, parse_transaction, Cacheability,
    Constituent, DataAccess, InstructionAccess, Lengths, MemAttributes, MemRegionIntent, MemType,
    RegionFlags, TransactionType,
};
use super::mailbox::MailboxPair;
use super::*;
use crate::status::{Expect, Failure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Unallocated,
    Transferred,
    Retrieved,
    Relinquished,
}

impl TransactionState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Unallocated => "UNALLOCATED",
            Self::Transferred => "TRANSFERRED",
            Self::Retrieved => "RETRIEVED",
            Self::Relinquished => "RELINQUISHED",
        }
    }
}

impl From<TransferKind> for TransactionType {
    fn from(kind: TransferKind) -> Self {
        match kind {
            TransferKind::Donate => Self::Donate,
            TransferKind::Lend => Self::Lend,
            TransferKind::Share => Self::Share,
        }
    }
}

/// Build `intent` into TX and issue transfer `fid`. `lengths` overrides the
/// w1/w2 lengths the builder computed.
pub fn issue_transfer(
    mb: &MailboxPair<'_>,
    fid: u64,
    intent: &MemRegionIntent,
    lengths: Option<Lengths>,
) -> Result<FfaArgs, Failure> {
    let built = mb.write_tx(|tx| build_transfer(intent, tx))??;
    let Lengths { total, fragment } = lengths.unwrap_or(built);
    Ok(mb.endpoint().mem_transfer(fid, total, fragment))
}

/// Build `request` into TX and issue retrieve `fid`. A retrieve response
/// leaves RX owned by the caller.
pub fn issue_retrieve(
    mb: &mut MailboxPair<'_>,
    fid: u64,
    request: &MemRegionIntent,
    total_override: Option<u32>,
) -> Result<FfaArgs, Failure> {
    let len = mb.write_tx(|tx| build_retrieve_request(request, tx))??;
    let ret = mb
        .endpoint()
        .mem_retrieve(fid, total_override.unwrap_or(len), len);
    if ret.fid == FFA_MEM_RETRIEVE_RESP {
        mb.mark_rx_held();
    }
    Ok(ret)
}

/// Relinquish `handle` on behalf of the mailbox's endpoint.
pub fn issue_relinquish(mb: &MailboxPair<'_>, handle: Handle) -> Result<FfaArgs, Failure> {
    let id = mb.endpoint().id;
    mb.write_tx(|tx| build_relinquish(handle, 0, &[id], tx))??;
    Ok(mb.endpoint().mem_relinquish())
}

/// Read a whole retrieve response out of RX.
///
/// `first` is the `FFA_MEM_RETRIEVE_RESP` payload (w1 total length, w2
/// fragment length). RX is released after every fragment, the last one
/// included, and the rest is fetched with `FFA_MEM_FRAG_RX`.
fn collect_retrieve_response(
    mb: &mut MailboxPair<'_>,
    handle: Handle,
    first: &FfaArgs,
) -> Result<Vec<u8>, Failure> {
    // Descriptor lengths are 32 bits on the wire.
    if first.arg1 > u64::from(u32::MAX) {
        return Err(Failure::Malformed(FfaError::InvalidParameters));
    }
    let total = first.arg1 as usize;
    let mut frag_len = first.arg2 as usize;
    if frag_len == 0 || frag_len > total || frag_len > mb.buffer_len() {
        return Err(Failure::Malformed(FfaError::InvalidParameters));
    }

    let mut buf = Vec::with_capacity(frag_len);
    loop {
        buf.extend_from_slice(&mb.read_rx(frag_len)?);
        mb.rx_release()?;
        if buf.len() >= total {
            break;
        }

        let ret = mb.endpoint().mem_frag_rx(handle, buf.len() as u32);
        Failure::check("FFA_MEM_FRAG_RX", &ret, Expect::Response(FFA_MEM_FRAG_TX))?;
        mb.mark_rx_held();
        let frag_handle = Handle::from_regs(ret.arg1, ret.arg2);
        if frag_handle != handle {
            return Err(Failure::Check(format!(
                "FFA_MEM_FRAG_TX for handle {}, expected {}",
                frag_handle, handle
            )));
        }
        frag_len = ret.arg3 as usize;
        if frag_len == 0 || frag_len > mb.buffer_len() || buf.len() + frag_len > total {
            return Err(Failure::Malformed(FfaError::InvalidParameters));
        }
        debug!("fragment at {:#x}, {} bytes", buf.len(), frag_len);
    }
    Ok(buf)
}

/// Compare two constituent lists page by page, in order.
pub fn same_pages(expected: &[Constituent], got: &[Constituent]) -> Result<(), Failure> {
    let want: Vec<u64> = pages_of(expected).collect();
    let have: Vec<u64> = pages_of(got).collect();
    if want == have {
        return Ok(());
    }
    let first_diff = want.iter().zip(&have).position(|(a, b)| a != b);
    Err(Failure::Check(match first_diff {
        Some(i) => format!(
            "composite page {} is {:#x}, expected {:#x}",
            i, have[i], want[i]
        ),
        None => format!("composite has {} pages, expected {}", have.len(), want.len()),
    }))
}

/// What in `granted` goes beyond `request` for a `kind` transaction, if
/// anything.
fn wider_grant(kind: TransferKind, request: &MemRegionIntent, granted: &MemRegionIntent) -> Option<String> {
    let data = granted.data_access;
    let instruction = granted.instruction_access;
    if matches!(data, DataAccess::NotSpecified | DataAccess::Reserved) {
        return Some(format!("data access {:?}", data));
    }
    if request.data_access == DataAccess::ReadOnly && data == DataAccess::ReadWrite {
        return Some("write access to a read-only request".into());
    }
    match instruction {
        InstructionAccess::Reserved => return Some(format!("instruction access {:?}", instruction)),
        InstructionAccess::Executable if kind == TransferKind::Share => {
            return Some("execute access to shared memory".into())
        }
        InstructionAccess::Executable if request.instruction_access == InstructionAccess::NotExecutable => {
            return Some("execute access to a non-executable request".into())
        }
        InstructionAccess::Executable if data == DataAccess::ReadWrite => {
            return Some("writable and executable access".into())
        }
        _ => {}
    }
    match (request.attributes.mem_type, granted.attributes.mem_type) {
        (MemType::NotSpecified, _) => None,
        (
            MemType::Normal {
                cacheability: Cacheability::NonCacheable,
                ..
            },
            MemType::Normal {
                cacheability: Cacheability::WriteBack,
                ..
            },
        ) => Some("write-back memory to a non-cacheable request".into()),
        (MemType::Normal { .. }, MemType::Normal { .. }) | (MemType::Device(_), MemType::Device(_)) => None,
        (asked, got) => Some(format!("memory type {:?} to a {:?} request", got, asked)),
    }
}

/// One endpoint's view of a memory transaction.
#[derive(Debug)]
pub struct Transaction {
    kind: TransferKind,
    width: AbiWidth,
    handle: Handle,
    tag: u64,
    sender: EndpointId,
    receiver: EndpointId,
    state: TransactionState,
    region: Option<MemRegionIntent>,
}

impl Transaction {
    /// DONATE/LEND/SHARE `intent` and expect a handle back.
    pub fn transfer(
        mb: &MailboxPair<'_>,
        kind: TransferKind,
        width: AbiWidth,
        intent: &MemRegionIntent,
    ) -> Result<Self, Failure> {
        let fid = kind.fid(width);
        let ret = issue_transfer(mb, fid, intent, None)?;
        Failure::check(fid_name(fid), &ret, Expect::Success)?;

        let handle = ret.handle();
        info!(
            "{} {:#06x} -> {:#06x}: handle {}",
            fid_name(fid),
            intent.sender,
            intent.receiver,
            handle
        );
        Ok(Self {
            kind,
            width,
            handle,
            tag: intent.tag,
            sender: intent.sender,
            receiver: intent.receiver,
            state: TransactionState::Transferred,
            region: None,
        })
    }

    /// The receiver's side of a handle handed over by the sender.
    pub fn incoming(
        handoff: Handoff,
        sender: EndpointId,
        receiver: EndpointId,
    ) -> Result<Self, Failure> {
        let (kind, width) =
            TransferKind::from_fid(handoff.fid).ok_or(Failure::Handoff(handoff.fid))?;
        Ok(Self {
            kind,
            width,
            handle: handoff.handle,
            tag: handoff.tag,
            sender,
            receiver,
            state: TransactionState::Transferred,
            region: None,
        })
    }

    pub fn handoff(&self) -> Handoff {
        Handoff::new(self.handle, self.tag, self.kind.fid(self.width))
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn width(&self) -> AbiWidth {
        self.width
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Region as reconstructed from the retrieve response.
    pub fn region(&self) -> Option<&MemRegionIntent> {
        self.region.as_ref()
    }

    pub fn retrieve_fid(&self) -> u64 {
        retrieve_fid(self.width)
    }

    /// Baseline retrieve request for this handle. Instruction access is
    /// only requested for donate and lend; a share borrower must leave it
    /// unspecified.
    pub fn retrieve_request(&self, data_access: DataAccess, attributes: MemAttributes) -> MemRegionIntent {
        MemRegionIntent {
            sender: self.sender,
            receiver: self.receiver,
            handle: self.handle,
            tag: self.tag,
            flags: RegionFlags::with_type(self.kind.into()),
            data_access,
            instruction_access: match self.kind {
                TransferKind::Share => InstructionAccess::NotSpecified,
                _ => InstructionAccess::NotExecutable,
            },
            attributes,
            receiver_flags: 0,
            constituents: Vec::new(),
        }
    }

    fn require(&self, state: TransactionState, op: &'static str) -> Result<(), Failure> {
        if self.state == state {
            Ok(())
        } else {
            Err(Failure::InvalidTransition {
                state: self.state.name(),
                op,
            })
        }
    }

    /// Retrieve the region and reassemble the response.
    pub fn retrieve(
        &mut self,
        mb: &mut MailboxPair<'_>,
        request: &MemRegionIntent,
    ) -> Result<&MemRegionIntent, Failure> {
        self.require(TransactionState::Transferred, "retrieve")?;

        let fid = self.retrieve_fid();
        let ret = issue_retrieve(mb, fid, request, None)?;
        Failure::check(fid_name(fid), &ret, Expect::Response(FFA_MEM_RETRIEVE_RESP))?;
        self.complete_retrieve(mb, &ret, request)
    }

    /// As [`Transaction::retrieve`], but a relayer that cannot satisfy the
    /// request may answer DENIED, reported as `Ok(None)`.
    pub fn try_retrieve(
        &mut self,
        mb: &mut MailboxPair<'_>,
        request: &MemRegionIntent,
    ) -> Result<Option<&MemRegionIntent>, Failure> {
        self.require(TransactionState::Transferred, "retrieve")?;

        let fid = self.retrieve_fid();
        let ret = issue_retrieve(mb, fid, request, None)?;
        if ret.error_code() == Some(FfaError::Denied) {
            return Ok(None);
        }
        Failure::check(fid_name(fid), &ret, Expect::Response(FFA_MEM_RETRIEVE_RESP))?;
        self.complete_retrieve(mb, &ret, request).map(Some)
    }

    /// Reassemble the response the relayer started with `first` and check
    /// it against `request`, for callers that issued the retrieve
    /// themselves.
    ///
    /// The relayer counts the handle as retrieved from `first` on. If the
    /// response cannot be taken, RX is released and the handle relinquished
    /// before the failure is returned.
    pub fn complete_retrieve(
        &mut self,
        mb: &mut MailboxPair<'_>,
        first: &FfaArgs,
        request: &MemRegionIntent,
    ) -> Result<&MemRegionIntent, Failure> {
        self.require(TransactionState::Transferred, "retrieve")?;
        let parsed = collect_retrieve_response(mb, self.handle, first)
            .and_then(|bytes| self.parse_response(&bytes, request));
        let region = match parsed {
            Ok(region) => region,
            Err(e) => {
                self.abandon(mb);
                return Err(e);
            }
        };

        info!(
            "retrieved handle {}: {} constituent(s), {} page(s)",
            self.handle,
            region.constituents.len(),
            region.total_page_count()
        );
        self.state = TransactionState::Retrieved;
        Ok(&*self.region.insert(region))
    }

    fn parse_response(&self, bytes: &[u8], request: &MemRegionIntent) -> Result<MemRegionIntent, Failure> {
        let parsed = parse_transaction(bytes).map_err(Failure::Malformed)?;
        if !parsed.has_composite {
            return Err(Failure::Malformed(FfaError::InvalidParameters));
        }
        if parsed.region.handle != self.handle {
            return Err(Failure::Check(format!(
                "retrieve response for handle {}, expected {}",
                parsed.region.handle, self.handle
            )));
        }
        if let Some(what) = wider_grant(self.kind, request, &parsed.region) {
            return Err(Failure::Check(format!(
                "retrieve response for handle {} grants {}",
                self.handle, what
            )));
        }
        Ok(parsed.region)
    }

    /// Give back a handle whose retrieve response was refused.
    fn abandon(&mut self, mb: &mut MailboxPair<'_>) {
        warn!("handle {}: bad retrieve response, relinquishing", self.handle);
        if mb.rx_held() {
            if let Err(e) = mb.rx_release() {
                error!("handle {}: {}", self.handle, e);
            }
        }
        let relinquish = issue_relinquish(mb, self.handle)
            .and_then(|ret| Failure::check("FFA_MEM_RELINQUISH", &ret, Expect::Success));
        match relinquish {
            Ok(()) => self.state = TransactionState::Relinquished,
            Err(e) => error!("handle {}: {}", self.handle, e),
        }
    }

    pub fn relinquish(&mut self, mb: &MailboxPair<'_>) -> Result<(), Failure> {
        self.require(TransactionState::Retrieved, "relinquish")?;
        let ret = issue_relinquish(mb, self.handle)?;
        Failure::check("FFA_MEM_RELINQUISH", &ret, Expect::Success)?;
        self.state = TransactionState::Relinquished;
        Ok(())
    }

    /// The receiver reported that it relinquished the handle.
    pub fn peer_relinquished(&mut self) -> Result<(), Failure> {
        self.require(TransactionState::Transferred, "note relinquish")?;
        self.state = TransactionState::Relinquished;
        Ok(())
    }

    /// Take the region back. Valid once the receiver has relinquished, or
    /// before it ever retrieved.
    pub fn reclaim(&mut self, endpoint: &Endpoint, flags: u32) -> Result<(), Failure> {
        if !matches!(
            self.state,
            TransactionState::Transferred | TransactionState::Relinquished
        ) {
            return Err(Failure::InvalidTransition {
                state: self.state.name(),
                op: "reclaim",
            });
        }
        let ret = endpoint.mem_reclaim(self.handle, flags);
        Failure::check("FFA_MEM_RECLAIM", &ret, Expect::Success)?;
        info!("reclaimed handle {}", self.handle);
        self.state = TransactionState::Unallocated;
        Ok(())
    }
}
