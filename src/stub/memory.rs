//! Memory management calls of the stub relayer.

use log::info;

use super::mailbox::{PendingResponse, RelayerMailbox};
use super::ownership::{validate_page_for_transfer, PageOwnership};
use super::records::ShareRecord;
use super::{reject, require, State, StubConfig, StubRelayer};
use crate::ffa::descriptors::{
    pages_of, parse_relinquish, parse_transaction, AlignmentHint, Constituent, DataAccess,
    Cacheability, InstructionAccess, MemAttributes, MemRegionIntent, MemType, RegionFlags,
    TransactionType, CONSTITUENTS_OFFSET, CONSTITUENT_SIZE,
};
use crate::ffa::*;

/// Bit 0 of the RELINQUISH and RECLAIM flags.
const FLAG_ZERO_MEMORY: u32 = 1;

impl StubRelayer {
    /// Copy a single-fragment descriptor of `args.arg1` bytes out of TX.
    fn read_descriptor(&self, mb: &RelayerMailbox, args: &FfaArgs) -> Result<Vec<u8>, FfaError> {
        let total = args.arg1 as u32 as usize;
        let fragment = args.arg2 as u32 as usize;
        require(
            total > 0 && fragment > 0 && fragment <= total && total <= mb.bytes(),
            FfaError::InvalidParameters,
            "descriptor length out of range",
        )?;
        require(
            fragment == total,
            FfaError::NotSupported,
            "fragmented descriptors are not supported",
        )?;
        self.memory
            .read_vec(mb.tx, total)
            .map_err(|_| reject(FfaError::InvalidParameters, "TX buffer unreadable"))
    }

    fn zero_region(&self, constituents: &[Constituent]) -> Result<(), FfaError> {
        for c in constituents {
            self.memory
                .fill(c.address, c.page_count as usize * FFA_PAGE_SIZE, 0)
                .map_err(|_| reject(FfaError::Aborted, "failed to zero region"))?;
        }
        Ok(())
    }

    // ── Transfer ─────────────────────────────────────────────────────

    /// FFA_MEM_DONATE/LEND/SHARE: x1 = total length, x2 = fragment length.
    ///
    /// Output: x0 = FFA_SUCCESS_32, x2/x3 = handle (low/high).
    pub(super) fn handle_mem_transfer(
        &self,
        st: &mut State,
        caller: EndpointId,
        args: &FfaArgs,
    ) -> Result<FfaArgs, FfaError> {
        let (kind, _) = TransferKind::from_fid(args.fid).ok_or(FfaError::NotSupported)?;
        let desc = {
            let mb = st
                .mailboxes
                .get(&caller)
                .ok_or_else(|| reject(FfaError::Denied, "no mailbox mapped"))?;
            self.read_descriptor(mb, args)?
        };
        let parsed =
            parse_transaction(&desc).map_err(|e| reject(e, "malformed transfer descriptor"))?;
        require(
            parsed.receiver_count == 1,
            FfaError::InvalidParameters,
            "only single-receiver transfers are supported",
        )?;
        require(
            parsed.has_composite,
            FfaError::InvalidParameters,
            "transfer without a composite region",
        )?;
        let region = parsed.region;

        if !self.config.quirks.skip_transfer_checks {
            check_transfer(&self.config, caller, kind, &region, parsed.raw_flags)?;
        }
        let retired = self.check_constituents(st, caller, &region.constituents)?;
        for old in retired {
            st.shares.remove(old);
            st.pages.release(old);
            info!("[relayer] handle {} retired: its pages were donated onward", old);
        }

        let handle = st.shares.insert(ShareRecord {
            handle: Handle(0),
            kind,
            sender: caller,
            receiver: region.receiver,
            tag: region.tag,
            flags: region.flags,
            data_access: region.data_access,
            attributes: region.attributes,
            constituents: region.constituents,
            retrieved_by: None,
            zero_after_relinquish: false,
        });
        if let Some(record) = st.shares.lookup(handle) {
            st.pages.claim(&record.constituents, kind, handle);
            info!(
                "[relayer] {} {:#06x} -> {:#06x}: handle {}, {} page(s)",
                fid_name(args.fid),
                caller,
                record.receiver,
                handle,
                record.total_page_count()
            );
        }

        let (lo, hi) = handle.to_regs();
        let mut ret = FfaArgs::success();
        ret.arg2 = lo;
        ret.arg3 = hi;
        Ok(ret)
    }

    /// Every constituent must be non-empty, disjoint from the others, in
    /// normal memory and not part of another live transaction.
    ///
    /// Pages the caller retrieved from a donation are its own. Returns the
    /// handles of such donations, which the new transaction retires.
    fn check_constituents(
        &self,
        st: &State,
        caller: EndpointId,
        constituents: &[Constituent],
    ) -> Result<Vec<Handle>, FfaError> {
        require(
            !constituents.is_empty(),
            FfaError::InvalidParameters,
            "no constituents",
        )?;

        let mut ranges = Vec::with_capacity(constituents.len());
        for c in constituents {
            require(
                c.page_count > 0,
                FfaError::InvalidParameters,
                "empty constituent",
            )?;
            let len = c.page_count as u64 * FFA_PAGE_SIZE as u64;
            let end = c
                .address
                .checked_add(len)
                .ok_or_else(|| reject(FfaError::InvalidParameters, "constituent wraps"))?;
            ranges.push((c.address, end));
        }
        ranges.sort_unstable();
        require(
            ranges.windows(2).all(|w| w[0].1 <= w[1].0),
            FfaError::InvalidParameters,
            "constituents overlap",
        )?;

        for &(start, end) in &ranges {
            require(
                !self.config.is_device(start, end - start),
                FfaError::Denied,
                "constituent covers device memory",
            )?;
            require(
                self.memory.contains(start, end - start),
                FfaError::Denied,
                "constituent outside memory",
            )?;
        }
        let mut retired = Vec::new();
        for pa in pages_of(constituents) {
            let Some(entry) = st.pages.entry(pa) else {
                continue;
            };
            let owned_donation = entry.ownership == PageOwnership::Donated
                && st
                    .shares
                    .lookup(entry.handle)
                    .is_some_and(|r| r.retrieved_by == Some(caller));
            if owned_donation {
                if !retired.contains(&entry.handle) {
                    retired.push(entry.handle);
                }
                continue;
            }
            validate_page_for_transfer(entry.ownership)
                .map_err(|e| reject(e, "page already in a transaction"))?;
        }
        Ok(retired)
    }

    // ── Retrieve ─────────────────────────────────────────────────────

    /// FFA_MEM_RETRIEVE_REQ: x1 = total length, x2 = fragment length.
    ///
    /// Output: x0 = FFA_MEM_RETRIEVE_RESP, x1 = total response length,
    /// x2 = length of the fragment now in RX.
    pub(super) fn handle_mem_retrieve_req(
        &self,
        st: &mut State,
        caller: EndpointId,
        args: &FfaArgs,
    ) -> Result<FfaArgs, FfaError> {
        let desc = {
            let mb = st
                .mailboxes
                .get(&caller)
                .ok_or_else(|| reject(FfaError::Denied, "no mailbox mapped"))?;
            require(
                mb.rx_held_by_relayer,
                FfaError::Busy,
                "RX buffer still held by the caller",
            )?;
            self.read_descriptor(mb, args)?
        };
        let parsed =
            parse_transaction(&desc).map_err(|e| reject(e, "malformed retrieve request"))?;
        require(
            parsed.receiver_count == 1,
            FfaError::InvalidParameters,
            "only single-receiver retrieves are supported",
        )?;
        let request = parsed.region;

        let record = st
            .shares
            .lookup(request.handle)
            .cloned()
            .ok_or_else(|| reject(FfaError::InvalidParameters, "unknown handle"))?;
        if !self.config.quirks.skip_retrieve_checks {
            check_retrieve(caller, &record, &request, parsed.raw_flags)?;
        }
        require(
            record.retrieved_by.is_none(),
            FfaError::Denied,
            "already retrieved",
        )?;

        let constituents = match request.flags.alignment_hint {
            AlignmentHint::Boundary(n) if n > 0 => {
                require(
                    n <= self.config.max_alignment_order,
                    FfaError::Denied,
                    "alignment hint beyond what the relayer can map",
                )?;
                let pages = record.total_page_count();
                let ipa = st.window_next.next_multiple_of((FFA_PAGE_SIZE as u64) << n);
                st.window_next = ipa + pages * FFA_PAGE_SIZE as u64;
                vec![Constituent::new(ipa, pages as u32)]
            }
            _ => record.constituents.clone(),
        };

        if record.kind != TransferKind::Share
            && (record.flags.zero_before_retrieve || request.flags.zero_before_retrieve)
        {
            self.zero_region(&record.constituents)?;
        }

        let response = MemRegionIntent {
            sender: record.sender,
            receiver: caller,
            handle: record.handle,
            tag: record.tag,
            flags: RegionFlags::with_type(record.kind.into()),
            data_access: match (request.data_access, record.data_access) {
                (DataAccess::NotSpecified, DataAccess::NotSpecified) => DataAccess::ReadWrite,
                (DataAccess::NotSpecified, granted) => granted,
                (requested, _) => requested,
            },
            instruction_access: match request.instruction_access {
                InstructionAccess::NotSpecified => InstructionAccess::NotExecutable,
                requested => requested,
            },
            attributes: MemAttributes {
                mem_type: match (request.attributes.mem_type, record.attributes.mem_type) {
                    (MemType::NotSpecified, MemType::NotSpecified) => MemType::NORMAL_WB,
                    (MemType::NotSpecified, granted) => granted,
                    (requested, _) => requested,
                },
                non_secure: !is_secure_endpoint(caller),
                reserved: 0,
            },
            receiver_flags: 0,
            constituents,
        }
        .encode(true);

        let total = response.len();
        let mb = st
            .mailboxes
            .get_mut(&caller)
            .ok_or_else(|| reject(FfaError::Denied, "no mailbox mapped"))?;
        let len = fragment_len(total, 0, fragment_limit(&self.config, mb));
        self.memory
            .write(mb.rx, &response[..len])
            .map_err(|_| reject(FfaError::Aborted, "RX buffer unwritable"))?;
        mb.rx_held_by_relayer = false;
        mb.pending = (len < total).then(|| PendingResponse {
            handle: record.handle,
            data: response,
            sent: len,
        });

        st.shares.mark_retrieved(record.handle, caller);
        if let Some(r) = st.shares.lookup_mut(record.handle) {
            r.zero_after_relinquish = request.flags.zero_after_relinquish;
        }
        info!(
            "[relayer] {:#06x} retrieved handle {} ({} of {} bytes in RX)",
            caller, record.handle, len, total
        );

        let mut ret = FfaArgs::new(FFA_MEM_RETRIEVE_RESP);
        ret.arg1 = total as u64;
        ret.arg2 = len as u64;
        Ok(ret)
    }

    /// FFA_MEM_FRAG_RX: x1/x2 = handle, x3 = offset of the next fragment.
    ///
    /// Output: x0 = FFA_MEM_FRAG_TX, x1/x2 = handle, x3 = fragment length.
    pub(super) fn handle_mem_frag_rx(
        &self,
        st: &mut State,
        caller: EndpointId,
        args: &FfaArgs,
    ) -> Result<FfaArgs, FfaError> {
        let handle = Handle::from_regs(args.arg1, args.arg2);
        let offset = args.arg3 as u32 as usize;

        let mb = st
            .mailboxes
            .get_mut(&caller)
            .ok_or_else(|| reject(FfaError::Denied, "no mailbox mapped"))?;
        let limit = fragment_limit(&self.config, mb);
        let rx = mb.rx;
        let pending = mb
            .pending
            .as_mut()
            .filter(|p| p.handle == handle)
            .ok_or_else(|| reject(FfaError::InvalidParameters, "no pending response for handle"))?;
        require(
            offset == pending.sent,
            FfaError::InvalidParameters,
            "fragment offset does not follow the last fragment",
        )?;
        require(
            mb.rx_held_by_relayer,
            FfaError::Busy,
            "RX buffer still held by the caller",
        )?;

        let len = fragment_len(pending.data.len(), pending.sent, limit);
        self.memory
            .write(rx, &pending.data[pending.sent..pending.sent + len])
            .map_err(|_| reject(FfaError::Aborted, "RX buffer unwritable"))?;
        pending.sent += len;
        let done = pending.sent == pending.data.len();
        mb.rx_held_by_relayer = false;
        if done {
            mb.pending = None;
        }

        let (lo, hi) = handle.to_regs();
        let mut ret = FfaArgs::new(FFA_MEM_FRAG_TX);
        ret.arg1 = lo;
        ret.arg2 = hi;
        ret.arg3 = len as u64;
        Ok(ret)
    }

    // ── Relinquish / Reclaim ─────────────────────────────────────────

    /// FFA_MEM_RELINQUISH: relinquish descriptor in the caller's TX.
    pub(super) fn handle_mem_relinquish(
        &self,
        st: &mut State,
        caller: EndpointId,
    ) -> Result<FfaArgs, FfaError> {
        let desc = {
            let mb = st
                .mailboxes
                .get(&caller)
                .ok_or_else(|| reject(FfaError::Denied, "no mailbox mapped"))?;
            self.memory
                .read_vec(mb.tx, mb.bytes())
                .map_err(|_| reject(FfaError::InvalidParameters, "TX buffer unreadable"))?
        };
        let req = parse_relinquish(&desc).map_err(|e| reject(e, "malformed relinquish"))?;

        let record = st
            .shares
            .lookup(req.handle)
            .ok_or_else(|| reject(FfaError::InvalidParameters, "unknown handle"))?;
        require(
            req.endpoints == [caller],
            FfaError::InvalidParameters,
            "relinquish must name the caller alone",
        )?;
        require(
            req.flags & !FLAG_ZERO_MEMORY == 0,
            FfaError::InvalidParameters,
            "reserved relinquish flags",
        )?;
        let zero_flag = req.flags & FLAG_ZERO_MEMORY != 0;
        require(
            !(record.kind == TransferKind::Share && zero_flag),
            FfaError::InvalidParameters,
            "zero flag on a share",
        )?;
        require(
            record.retrieved_by == Some(caller),
            FfaError::Denied,
            "caller does not hold the region",
        )?;

        if record.kind != TransferKind::Share && (zero_flag || record.zero_after_relinquish) {
            let constituents = record.constituents.clone();
            self.zero_region(&constituents)?;
        }
        if let Some(mb) = st.mailboxes.get_mut(&caller) {
            if mb.pending.as_ref().is_some_and(|p| p.handle == req.handle) {
                mb.pending = None;
            }
        }
        st.shares.mark_relinquished(req.handle);
        info!("[relayer] {:#06x} relinquished handle {}", caller, req.handle);
        Ok(FfaArgs::success())
    }

    /// FFA_MEM_RECLAIM: x1/x2 = handle, x3 = flags.
    pub(super) fn handle_mem_reclaim(
        &self,
        st: &mut State,
        caller: EndpointId,
        args: &FfaArgs,
    ) -> Result<FfaArgs, FfaError> {
        let handle = Handle::from_regs(args.arg1, args.arg2);
        let flags = args.arg3 as u32;

        let record = st
            .shares
            .lookup(handle)
            .ok_or_else(|| reject(FfaError::InvalidParameters, "unknown handle"))?;
        require(
            record.sender == caller,
            FfaError::Denied,
            "caller is not the owner",
        )?;
        require(
            record.retrieved_by.is_none(),
            FfaError::Denied,
            "region still retrieved",
        )?;
        require(
            flags & !FLAG_ZERO_MEMORY == 0,
            FfaError::InvalidParameters,
            "reserved reclaim flags",
        )?;
        let zero_flag = flags & FLAG_ZERO_MEMORY != 0;
        require(
            !(record.kind == TransferKind::Share && zero_flag),
            FfaError::InvalidParameters,
            "zero flag on a share",
        )?;

        if zero_flag {
            let constituents = record.constituents.clone();
            self.zero_region(&constituents)?;
        }
        st.shares.remove(handle);
        st.pages.release(handle);
        info!("[relayer] {:#06x} reclaimed handle {}", caller, handle);
        Ok(FfaArgs::success())
    }
}

// ── Validation ───────────────────────────────────────────────────────

fn check_transfer(
    config: &StubConfig,
    caller: EndpointId,
    kind: TransferKind,
    region: &MemRegionIntent,
    raw_flags: u32,
) -> Result<(), FfaError> {
    use FfaError::InvalidParameters as Invalid;

    require(region.sender == caller, Invalid, "sender is not the caller")?;
    require(config.is_partition(region.receiver), Invalid, "unknown receiver")?;
    require(region.receiver != caller, Invalid, "receiver is the sender")?;
    require(region.handle == Handle(0), Invalid, "handle must be zero")?;

    require(
        raw_flags & !RegionFlags::TRANSFER_MASK == 0,
        Invalid,
        "reserved transfer flag bits set",
    )?;
    require(
        !(kind == TransferKind::Share && region.flags.zero_before_retrieve),
        Invalid,
        "zero flag on a share",
    )?;

    require(
        region.data_access != DataAccess::Reserved
            && region.instruction_access != InstructionAccess::Reserved,
        Invalid,
        "reserved permission encoding",
    )?;
    let attrs = region.attributes;
    require(
        !attrs.mem_type.is_reserved_encoding() && attrs.reserved == 0 && !attrs.non_secure,
        Invalid,
        "reserved attribute encoding",
    )?;

    match kind {
        TransferKind::Donate => require(
            region.data_access == DataAccess::NotSpecified
                && region.instruction_access == InstructionAccess::NotSpecified
                && attrs.mem_type == MemType::NotSpecified,
            Invalid,
            "donor specified access or memory type",
        )?,
        TransferKind::Lend | TransferKind::Share => {
            require(
                region.data_access != DataAccess::NotSpecified,
                Invalid,
                "data access not specified",
            )?;
            require(
                region.instruction_access == InstructionAccess::NotSpecified,
                Invalid,
                "instruction access specified by the sender",
            )?;
        }
    }
    if kind == TransferKind::Share {
        require(
            attrs.mem_type != MemType::NotSpecified,
            Invalid,
            "share without a memory type",
        )?;
    }
    require(
        !matches!(attrs.mem_type, MemType::Device(_)),
        FfaError::Denied,
        "device memory type",
    )
}

fn check_retrieve(
    caller: EndpointId,
    record: &ShareRecord,
    request: &MemRegionIntent,
    raw_flags: u32,
) -> Result<(), FfaError> {
    use FfaError::InvalidParameters as Invalid;

    require(request.sender == record.sender, Invalid, "sender does not match")?;
    require(request.tag == record.tag, Invalid, "tag does not match")?;
    require(
        request.receiver == caller,
        Invalid,
        "access descriptor is not the caller's",
    )?;
    require(
        record.receiver == caller,
        FfaError::Denied,
        "caller is not the receiver",
    )?;

    let flags = request.flags;
    require(
        raw_flags & RegionFlags::RESERVED_MASK == 0,
        Invalid,
        "reserved retrieve flag bits set",
    )?;
    require(
        !matches!(flags.alignment_hint, AlignmentHint::Reserved(_)),
        Invalid,
        "alignment hint without its valid bit",
    )?;
    require(
        flags.transaction_type == TransactionType::Unspecified
            || flags.transaction_type == TransactionType::from(record.kind),
        Invalid,
        "transaction type does not match",
    )?;
    if record.kind == TransferKind::Share {
        require(
            !flags.zero_before_retrieve && !flags.zero_after_relinquish,
            Invalid,
            "zero flags on a share",
        )?;
    }

    require(
        request.data_access != DataAccess::Reserved
            && request.instruction_access != InstructionAccess::Reserved,
        Invalid,
        "reserved permission encoding",
    )?;
    let attrs = request.attributes;
    require(
        !attrs.mem_type.is_reserved_encoding() && attrs.reserved == 0 && !attrs.non_secure,
        Invalid,
        "reserved attribute encoding",
    )?;
    if record.kind == TransferKind::Share {
        require(
            request.instruction_access == InstructionAccess::NotSpecified,
            Invalid,
            "instruction access on a share",
        )?;
    }

    require(
        !(request.instruction_access == InstructionAccess::Executable
            && request.data_access == DataAccess::ReadWrite),
        FfaError::Denied,
        "writable and executable",
    )?;
    require(
        !(record.data_access == DataAccess::ReadOnly && request.data_access == DataAccess::ReadWrite),
        FfaError::Denied,
        "write access beyond the grant",
    )?;
    require(
        attributes_compatible(record.attributes.mem_type, attrs.mem_type),
        FfaError::Denied,
        "memory attributes beyond the grant",
    )
}

/// Whether a borrower asking for `requested` stays within `granted`.
fn attributes_compatible(granted: MemType, requested: MemType) -> bool {
    match (granted, requested) {
        (_, MemType::NotSpecified) => true,
        (MemType::NotSpecified, MemType::Normal { .. }) => true,
        (MemType::Device(_), MemType::Device(_)) => true,
        (
            MemType::Normal {
                cacheability: g, ..
            },
            MemType::Normal {
                cacheability: r, ..
            },
        ) => !(g == Cacheability::NonCacheable && r == Cacheability::WriteBack),
        _ => false,
    }
}

fn fragment_limit(config: &StubConfig, mb: &RelayerMailbox) -> usize {
    match config.max_fragment {
        0 => mb.bytes(),
        max => max.min(mb.bytes()),
    }
}

/// Length of the fragment starting at `sent`. Fragments end on a
/// constituent boundary unless they end the response.
fn fragment_len(total: usize, sent: usize, limit: usize) -> usize {
    let remaining = total - sent;
    if remaining <= limit {
        return remaining;
    }
    let end = sent + limit;
    let boundary =
        CONSTITUENTS_OFFSET + (end.saturating_sub(CONSTITUENTS_OFFSET) / CONSTITUENT_SIZE) * CONSTITUENT_SIZE;
    boundary.max(sent + CONSTITUENT_SIZE.min(remaining)) - sent
}
