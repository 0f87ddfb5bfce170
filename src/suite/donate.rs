//! DONATE scenarios.

use super::*;
use crate::ffa::descriptors::{
    Cacheability, DataAccess, InstructionAccess, MemAttributes, MemRegionIntent, MemType,
    Shareability,
};
use crate::ffa::driver::{same_pages, Transaction, TransactionState};
use crate::mm::PageSpan;

/// Donation of `region` with everything left for the receiver to choose.
fn donate_intent(sender: EndpointId, receiver: EndpointId, region: Vec<Constituent>) -> MemRegionIntent {
    MemRegionIntent {
        data_access: DataAccess::NotSpecified,
        instruction_access: InstructionAccess::NotSpecified,
        attributes: MemAttributes::default(),
        ..MemRegionIntent::single_page(sender, receiver, 0).with_constituents(region)
    }
}

/// Two single-page constituents, the lowest and highest page of `span`.
fn two_pages(span: PageSpan) -> Vec<Constituent> {
    vec![
        Constituent::new(span.page(0), 1),
        Constituent::new(span.page(span.pages - 1), 1),
    ]
}

// ── donate_lower_upper_boundary_32 ───────────────────────────────────
//
// The client donates two pages over the 32-bit ABI. The server retrieves
// them and donates the same pages straight back, which retires the first
// handle, then the client retrieves the new one and checks it names the
// pages it started with.

pub(super) fn boundary_32_client(env: &TestEnv, port: &ClientPort) -> Result<(), CheckError> {
    let span = env.memory.alloc(2).at(3)?;
    let result = with_mailbox(&env.client, env.config.mailbox_pages, (1, 9), |mb| {
        let region = two_pages(span);
        let intent = donate_intent(env.client.id, env.server.id, region.clone());
        let tx = Transaction::transfer(mb, TransferKind::Donate, AbiWidth::W32, &intent).at(4)?;

        let back = hand_off(port, tx.handoff())
            .at(5)?
            .ok_or_else(|| Failure::Check("server did not donate the pages back".into()).at(5))?;
        let mut returned = Transaction::incoming(back, env.server.id, env.client.id).at(5)?;
        let request = returned.retrieve_request(
            DataAccess::ReadWrite,
            MemAttributes::new(MemType::Normal {
                cacheability: Cacheability::WriteBack,
                shareability: Shareability::Outer,
            }),
        );
        let got = returned.retrieve(mb, &request).at(6)?.constituents.clone();

        let mut status = Status::new();
        status.check(same_pages(&region, &got).at(7));
        status.check(returned.relinquish(mb).at(8));
        // Let the server take its donation back.
        status.check(
            port.send_direct_req(reply(0, None))
                .map_err(Failure::from)
                .and_then(parse_reply)
                .at(10),
        );
        status.into_result()
    });
    env.memory.free(span);
    result
}

pub(super) fn boundary_32_server(
    env: &TestEnv,
    port: &mut ServerPort,
    request: DirectPayload,
) -> Result<(), CheckError> {
    let client = port.peer();
    let result = with_mailbox(&env.server, env.config.mailbox_pages, (1, 9), |mb| {
        let mut incoming =
            Transaction::incoming(Handoff::from_payload(request), client, env.server.id).at(2)?;
        let request = incoming.retrieve_request(DataAccess::ReadWrite, MemAttributes::new(MemType::NORMAL_WB));
        let region = incoming.retrieve(mb, &request).at(3)?.constituents.clone();

        let intent = donate_intent(env.server.id, client, region);
        let mut back = Transaction::transfer(mb, TransferKind::Donate, AbiWidth::W32, &intent).at(4)?;

        let next = port.respond_and_wait(reply(0, Some(back.handoff()))).at(5)?;
        parse_reply(next).at(5)?;
        back.peer_relinquished().at(6)?;
        back.reclaim(mb.endpoint(), 0).at(7)
    });
    finish(port, result, 10)
}

// ── donate_lifecycle ─────────────────────────────────────────────────
//
// DONATE, RETRIEVE, RELINQUISH, RECLAIM of a two-page region.

const STAMP: u64 = 0xD0_0A7E;

pub(super) fn lifecycle_client(env: &TestEnv, port: &ClientPort) -> Result<(), CheckError> {
    let mut status = Status::new();
    for width in widths(&env.client, TransferKind::Donate) {
        status.check(lifecycle_round(env, port, width));
        if !status.is_ok() {
            break;
        }
    }
    status.into_result()
}

fn lifecycle_round(env: &TestEnv, port: &ClientPort, width: AbiWidth) -> Result<(), CheckError> {
    let span = env.memory.alloc(2).at(1)?;
    let result = with_mailbox(&env.client, env.config.mailbox_pages, (2, 3), |mb| {
        let region = vec![
            Constituent::new(span.page(0), 1),
            Constituent::new(span.page(1), 1),
        ];
        stamp_pages(&env.memory, &region, STAMP).at(4)?;

        let intent = donate_intent(env.client.id, env.server.id, region);
        let mut tx = Transaction::transfer(mb, TransferKind::Donate, width, &intent).at(5)?;
        hand_off(port, tx.handoff()).at(6)?;
        tx.peer_relinquished().at(7)?;
        tx.reclaim(mb.endpoint(), 0).at(8)?;
        if tx.state() != TransactionState::Unallocated {
            return Err(Failure::Check(format!("handle ended {}", tx.state().name())).at(8));
        }
        Ok(())
    });
    env.memory.free(span);
    result
}

pub(super) fn lifecycle_server(
    env: &TestEnv,
    port: &mut ServerPort,
    request: DirectPayload,
) -> Result<(), CheckError> {
    let client = port.peer();
    let result = with_mailbox(&env.server, env.config.mailbox_pages, (1, 6), |mb| {
        let mut tx = Transaction::incoming(Handoff::from_payload(request), client, env.server.id).at(2)?;
        let request = tx.retrieve_request(DataAccess::ReadWrite, MemAttributes::new(MemType::NORMAL_WB));
        let region = tx.retrieve(mb, &request).at(3)?.constituents.clone();

        let mut status = Status::new();
        status.check(verify_stamps(&env.memory, &region, STAMP).at(4));
        status.check(tx.relinquish(mb).at(5));
        status.into_result()
    });
    finish(port, result, 7)
}
