//! LEND scenarios: retrieve alignment hints and fragmented retrieve
//! responses.

use log::{info, warn};

use super::*;
use crate::ffa::descriptors::{
    AlignmentHint, DataAccess, InstructionAccess, MemAttributes, MemRegionIntent, MemType,
};
use crate::ffa::driver::{issue_retrieve, Transaction};
use crate::ffa::validator::{inject_all, Mutation, RetrieveCall};
use crate::status::Expect;

fn each_width(
    env: &TestEnv,
    mut round: impl FnMut(AbiWidth) -> Result<(), CheckError>,
) -> Result<(), CheckError> {
    for width in widths(&env.client, TransferKind::Lend) {
        info!("{}", fid_name(TransferKind::Lend.fid(width)));
        round(width)?;
    }
    Ok(())
}

fn baseline_request(tx: &Transaction) -> MemRegionIntent {
    tx.retrieve_request(DataAccess::ReadWrite, MemAttributes::new(MemType::NORMAL_WB))
}

// ── lend_retrieve_align_hint ─────────────────────────────────────────

pub(super) fn align_hint_client(env: &TestEnv, port: &ClientPort) -> Result<(), CheckError> {
    each_width(env, |width| {
        let page = env.memory.alloc(1).at(3)?;
        let result = with_mailbox(&env.client, env.config.mailbox_pages, (1, 2), |mb| {
            let intent = MemRegionIntent::single_page(env.client.id, env.server.id, page.pa);
            let mut tx = Transaction::transfer(mb, TransferKind::Lend, width, &intent).at(4)?;

            let mut status = Status::new();
            status.check(hand_off(port, tx.handoff()).at(5));
            status.check(tx.reclaim(mb.endpoint(), 0).at(6));
            status.into_result()
        });
        env.memory.free(page);
        result
    })
}

pub(super) fn align_hint_server(
    env: &TestEnv,
    port: &mut ServerPort,
    request: DirectPayload,
) -> Result<(), CheckError> {
    let client = port.peer();
    let result = with_mailbox(&env.server, env.config.mailbox_pages, (4, 9), |mb| {
        let mut tx = Transaction::incoming(Handoff::from_payload(request), client, env.server.id).at(5)?;
        let mut request = baseline_request(&tx);

        let mutations = [
            // n without the valid bit
            Mutation::new(
                "alignment hint without the valid bit",
                1,
                Expect::Error(FfaError::InvalidParameters),
                |c: &mut RetrieveCall| c.request.flags.alignment_hint = AlignmentHint::Reserved(8),
            ),
            Mutation::new(
                "writable and executable",
                7,
                Expect::Error(FfaError::Denied),
                |c: &mut RetrieveCall| c.request.instruction_access = InstructionAccess::Executable,
            ),
        ];
        inject_all(mb, &RetrieveCall::new(tx.retrieve_fid(), request.clone()), &mutations)?;

        // 8KB boundary
        request.flags.alignment_hint = AlignmentHint::Boundary(1);
        let handle = tx.handle();
        let first = match tx.try_retrieve(mb, &request).at(3)? {
            Some(region) => region.constituents.first().map(|c| c.address),
            None => {
                warn!("relayer cannot map handle {} at an 8KB boundary", handle);
                return Ok(());
            }
        };

        let mut status = Status::new();
        match first {
            Some(addr) if request.flags.alignment_hint.is_satisfied_by(addr) => {
                info!("  region mapped at {:#x}", addr)
            }
            Some(addr) => status.record(
                Failure::Check(format!("first constituent at {:#x} is not 8KB aligned", addr)).at(2),
            ),
            None => status.record(Failure::Malformed(FfaError::InvalidParameters).at(2)),
        }
        status.check(tx.relinquish(mb).at(6));
        status.into_result()
    });
    finish(port, result, 10)
}

// ── lend_retrieve_fragmented ─────────────────────────────────────────
//
// Every other page of a span, so no two constituents merge and the
// retrieve response cannot fit in the server's one-page RX buffer.

const SCATTERED_PAGES: u64 = 300;
const STAMP: u64 = 0x1E_4D00;

pub(super) fn fragmented_client(env: &TestEnv, port: &ClientPort) -> Result<(), CheckError> {
    each_width(env, |width| {
        let span = env.memory.alloc(SCATTERED_PAGES * 2).at(3)?;
        let result = with_mailbox(&env.client, 2, (1, 2), |mb| {
            let region: Vec<Constituent> = (0..SCATTERED_PAGES)
                .map(|i| Constituent::new(span.page(2 * i), 1))
                .collect();
            stamp_pages(&env.memory, &region, STAMP).at(4)?;
            let intent = MemRegionIntent::single_page(env.client.id, env.server.id, span.pa)
                .with_constituents(region);
            let mut tx = Transaction::transfer(mb, TransferKind::Lend, width, &intent).at(5)?;

            let mut status = Status::new();
            if status.check(hand_off(port, tx.handoff()).at(6)).is_some() {
                // The server answers while it still holds the region.
                let ret = mb.endpoint().mem_reclaim(tx.handle(), 0);
                status.check(
                    Failure::check(
                        "FFA_MEM_RECLAIM while retrieved",
                        &ret,
                        Expect::Error(FfaError::Denied),
                    )
                    .at(7),
                );
                status.check(
                    port.send_direct_req(reply(0, None))
                        .map_err(Failure::from)
                        .and_then(parse_reply)
                        .at(8),
                );
                status.check(tx.peer_relinquished().at(9));
            }
            status.check(tx.reclaim(mb.endpoint(), 0).at(10));
            status.into_result()
        });
        env.memory.free(span);
        result
    })
}

pub(super) fn fragmented_server(
    env: &TestEnv,
    port: &mut ServerPort,
    request: DirectPayload,
) -> Result<(), CheckError> {
    let client = port.peer();
    let result = with_mailbox(&env.server, 1, (1, 10), |mb| {
        let mut tx = Transaction::incoming(Handoff::from_payload(request), client, env.server.id).at(2)?;
        let fid = tx.retrieve_fid();
        let request = baseline_request(&tx);
        let first = issue_retrieve(mb, fid, &request, None).at(3)?;
        Failure::check(fid_name(fid), &first, Expect::Response(FFA_MEM_RETRIEVE_RESP)).at(3)?;

        let mut status = Status::new();
        if first.arg2 >= first.arg1 {
            status.record(
                Failure::Check(format!("{} byte response arrived in one fragment", first.arg1)).at(4),
            );
        } else {
            // RX is still ours; the relayer has nowhere to put the next fragment.
            let busy = mb.endpoint().mem_frag_rx(tx.handle(), first.arg2 as u32);
            status.check(
                Failure::check(
                    "FFA_MEM_FRAG_RX with RX held",
                    &busy,
                    Expect::Error(FfaError::Busy),
                )
                .at(5),
            );
        }

        let region = tx
            .complete_retrieve(mb, &first, &request)
            .map(|r| r.constituents.clone())
            .at(6)?;
        status.check(verify_stamps(&env.memory, &region, STAMP).at(7));

        // Let the client try to reclaim, then give the region back.
        let next = port.respond_and_wait(reply(0, None)).at(8)?;
        status.check(parse_reply(next).at(8));
        status.check(tx.relinquish(mb).at(9));
        status.into_result()
    });
    finish(port, result, 11)
}
