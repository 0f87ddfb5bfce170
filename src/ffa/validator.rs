//! Error injection.
//!
//! A check is a baseline call that the relayer would accept, plus one
//! [`Mutation`] that breaks a single rule. [`inject`] applies the mutation
//! to a copy of the baseline, issues it and compares the answer against the
//! expected rejection. If the relayer accepts the broken call instead, the
//! call's [`InjectableCall::undo`] gives back whatever was granted before
//! the mismatch is reported.

use log::{error, info, warn};

use super::descriptors::{Lengths, MemRegionIntent};
use super::driver::{issue_relinquish, issue_retrieve, issue_transfer};
use super::mailbox::MailboxPair;
use super::*;
use crate::status::{AtPoint, CheckError, Expect, Failure, Status};

/// A call that can be issued with a mutated argument set.
pub trait InjectableCall: Clone {
    fn issue(&self, mb: &mut MailboxPair<'_>) -> Result<FfaArgs, Failure>;

    /// Release what a wrongly successful `issue` granted. `ret` is the
    /// relayer's response to it.
    fn undo(&self, mb: &mut MailboxPair<'_>, ret: &FfaArgs) -> Result<(), Failure>;
}

/// DONATE/LEND/SHARE of a descriptor.
#[derive(Debug, Clone)]
pub struct TransferCall {
    pub fid: u64,
    pub intent: MemRegionIntent,
    /// w1/w2 to send instead of the built lengths
    pub lengths: Option<Lengths>,
}

impl TransferCall {
    pub fn new(fid: u64, intent: MemRegionIntent) -> Self {
        Self {
            fid,
            intent,
            lengths: None,
        }
    }
}

impl InjectableCall for TransferCall {
    fn issue(&self, mb: &mut MailboxPair<'_>) -> Result<FfaArgs, Failure> {
        issue_transfer(mb, self.fid, &self.intent, self.lengths)
    }

    fn undo(&self, mb: &mut MailboxPair<'_>, ret: &FfaArgs) -> Result<(), Failure> {
        if !ret.is_success() {
            return Ok(());
        }
        let reclaim = mb.endpoint().mem_reclaim(ret.handle(), 0);
        Failure::check("FFA_MEM_RECLAIM", &reclaim, Expect::Success)
    }
}

/// RETRIEVE_REQ of a request.
#[derive(Debug, Clone)]
pub struct RetrieveCall {
    pub fid: u64,
    pub request: MemRegionIntent,
    /// w1 to send instead of the built length
    pub total_length: Option<u32>,
}

impl RetrieveCall {
    pub fn new(fid: u64, request: MemRegionIntent) -> Self {
        Self {
            fid,
            request,
            total_length: None,
        }
    }
}

impl InjectableCall for RetrieveCall {
    fn issue(&self, mb: &mut MailboxPair<'_>) -> Result<FfaArgs, Failure> {
        issue_retrieve(mb, self.fid, &self.request, self.total_length)
    }

    fn undo(&self, mb: &mut MailboxPair<'_>, ret: &FfaArgs) -> Result<(), Failure> {
        if ret.fid != FFA_MEM_RETRIEVE_RESP {
            return Ok(());
        }
        // The relayer may have honoured a mutated handle; relinquish
        // whichever one the response describes.
        let rx = mb.read_rx(descriptors::MEM_REGION_SIZE)?;
        let handle = descriptors::peek_header(&rx)
            .map(|(handle, _)| handle)
            .unwrap_or(self.request.handle);

        let mut status = Ok(());
        if let Err(e) = mb.rx_release() {
            status = Err(e.into());
        }
        let relinquish = issue_relinquish(mb, handle)
            .and_then(|r| Failure::check("FFA_MEM_RELINQUISH", &r, Expect::Success));
        status.and(relinquish)
    }
}

type Apply<C> = Box<dyn Fn(&mut C) + Send + Sync>;

/// One rule to break.
pub struct Mutation<C> {
    pub rule: &'static str,
    pub point: u32,
    pub expect: Expect,
    apply: Apply<C>,
}

impl<C> Mutation<C> {
    pub fn new(
        rule: &'static str,
        point: u32,
        expect: Expect,
        apply: impl Fn(&mut C) + Send + Sync + 'static,
    ) -> Self {
        Self {
            rule,
            point,
            expect,
            apply: Box::new(apply),
        }
    }
}

/// Issue `baseline` with `mutation` applied and check the answer.
pub fn inject<C: InjectableCall>(
    mb: &mut MailboxPair<'_>,
    baseline: &C,
    mutation: &Mutation<C>,
) -> Result<(), CheckError> {
    let mut call = baseline.clone();
    (mutation.apply)(&mut call);

    let ret = call.issue(mb).at(mutation.point)?;
    let verdict = Failure::check(mutation.rule, &ret, mutation.expect);
    if verdict.is_ok() {
        info!("  {}: {}", mutation.rule, mutation.expect);
        return Ok(());
    }

    if !ret.is_error() {
        warn!(
            "  {}: relayer accepted the call ({}), cleaning up",
            mutation.rule,
            fid_name(ret.fid)
        );
        if let Err(e) = call.undo(mb, &ret) {
            error!("  {}: cleanup failed: {}", mutation.rule, e);
        }
    }
    verdict.at(mutation.point)
}

/// Run every mutation in turn against the same baseline.
///
/// Conformance mismatches are recorded and the next mutation still runs; a
/// protocol or resource failure stops the sequence. The first failure is
/// returned.
pub fn inject_all<C: InjectableCall>(
    mb: &mut MailboxPair<'_>,
    baseline: &C,
    mutations: &[Mutation<C>],
) -> Result<(), CheckError> {
    let mut status = Status::new();
    for m in mutations {
        if let Err(e) = inject(mb, baseline, m) {
            let fatal = e.failure.is_fatal();
            status.record(e);
            if fatal {
                break;
            }
        }
    }
    status.into_result()
}
