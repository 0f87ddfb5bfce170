//! SHARE scenarios: transfer descriptor rejection, retrieve request
//! rejection, and retrieves naming the wrong handle or tag.

use log::info;

use super::*;
use crate::ffa::channel::ClientPort;
use crate::ffa::descriptors::{
    Cacheability, DataAccess, DeviceAttr, InstructionAccess, Lengths, MemAttributes,
    MemRegionIntent, MemType, Shareability,
};
use crate::ffa::driver::Transaction;
use crate::ffa::validator::{inject_all, Mutation, RetrieveCall, TransferCall};
use crate::status::Expect;

const INVALID: Expect = Expect::Error(FfaError::InvalidParameters);
const DENIED: Expect = Expect::Error(FfaError::Denied);

const fn normal_outer(cacheability: Cacheability) -> MemAttributes {
    MemAttributes::new(MemType::Normal {
        cacheability,
        shareability: Shareability::Outer,
    })
}

fn each_width(
    env: &TestEnv,
    mut round: impl FnMut(AbiWidth) -> Result<(), CheckError>,
) -> Result<(), CheckError> {
    for width in widths(&env.client, TransferKind::Share) {
        info!("{}", fid_name(TransferKind::Share.fid(width)));
        round(width)?;
    }
    Ok(())
}

// ── share_input_error_checks ─────────────────────────────────────────

pub(super) fn input_error_checks_client(env: &TestEnv, _port: &ClientPort) -> Result<(), CheckError> {
    each_width(env, |width| {
        let page = env.memory.alloc(1).at(1)?;
        let result = with_mailbox(&env.client, env.config.mailbox_pages, (11, 13), |mb| {
            let sender = env.client.id;
            let mut intent = MemRegionIntent::single_page(sender, env.server.id, page.pa);
            intent.attributes = normal_outer(Cacheability::WriteBack);
            let baseline = TransferCall::new(TransferKind::Share.fid(width), intent);

            let uart = env.config.uart_for(sender);
            let too_long = mb.buffer_len() as u32 + 1;
            let mutations = [
                Mutation::new("share of device MMIO", 10, Expect::AnyError, move |c: &mut TransferCall| {
                    c.intent.constituents = vec![Constituent::new(uart, 1)];
                    c.intent.attributes = MemAttributes::new(MemType::Device(DeviceAttr::NGnRnE));
                }),
                Mutation::new("receiver is not a partition", 2, INVALID, |c: &mut TransferCall| {
                    c.intent.receiver = 0xFFFF
                }),
                Mutation::new("receiver is the sender", 2, INVALID, move |c: &mut TransferCall| {
                    c.intent.receiver = sender
                }),
                Mutation::new("zero memory flag on share", 5, INVALID, |c: &mut TransferCall| {
                    c.intent.flags.zero_before_retrieve = true
                }),
                Mutation::new("instruction access on share", 8, INVALID, |c: &mut TransferCall| {
                    c.intent.instruction_access = InstructionAccess::NotExecutable
                }),
                Mutation::new("reserved flag bits", 15, INVALID, |c: &mut TransferCall| {
                    c.intent.flags.reserved = 1 << 31
                }),
                Mutation::new("descriptor longer than TX", 16, INVALID, move |c: &mut TransferCall| {
                    c.lengths = Some(Lengths {
                        total: too_long,
                        fragment: too_long,
                    })
                }),
            ];
            inject_all(mb, &baseline, &mutations)
        });
        env.memory.free(page);
        result
    })
}

// ── Client half shared by the retrieve scenarios ─────────────────────

/// Share one page with the server, hand it the handle and reclaim once
/// the server has finished with it.
fn share_round(
    env: &TestEnv,
    port: &ClientPort,
    width: AbiWidth,
    attributes: MemAttributes,
    tag: u64,
) -> Result<(), CheckError> {
    let page = env.memory.alloc(1).at(3)?;
    let result = with_mailbox(&env.client, env.config.mailbox_pages, (1, 2), |mb| {
        let mut intent = MemRegionIntent::single_page(env.client.id, env.server.id, page.pa);
        intent.attributes = attributes;
        intent.tag = tag;
        let mut tx = Transaction::transfer(mb, TransferKind::Share, width, &intent).at(4)?;

        let mut status = Status::new();
        status.check(hand_off(port, tx.handoff()).at(5));
        status.check(tx.reclaim(mb.endpoint(), 0).at(6));
        status.into_result()
    });
    env.memory.free(page);
    result
}

// ── share_retrieve_input_checks ──────────────────────────────────────

pub(super) fn retrieve_input_checks_client(env: &TestEnv, port: &ClientPort) -> Result<(), CheckError> {
    each_width(env, |width| {
        share_round(env, port, width, normal_outer(Cacheability::NonCacheable), 0)
    })
}

pub(super) fn retrieve_input_checks_server(
    env: &TestEnv,
    port: &mut ServerPort,
    request: DirectPayload,
) -> Result<(), CheckError> {
    let result = Transaction::incoming(Handoff::from_payload(request), port.peer(), env.server.id)
        .at(8)
        .and_then(|tx| {
            with_mailbox(&env.server, env.config.mailbox_pages, (6, 9), |mb| {
                let baseline = RetrieveCall::new(
                    tx.retrieve_fid(),
                    tx.retrieve_request(DataAccess::ReadWrite, normal_outer(Cacheability::NonCacheable)),
                );
                let third_party = env.third_party;
                let too_long = mb.buffer_len() as u32 + 1;
                let mutations = [
                    Mutation::new("zero before retrieve on share", 1, INVALID, |c: &mut RetrieveCall| {
                        c.request.flags.zero_before_retrieve = true
                    }),
                    Mutation::new("zero after relinquish on share", 1, INVALID, |c: &mut RetrieveCall| {
                        c.request.flags.zero_after_relinquish = true
                    }),
                    Mutation::new("cacheability beyond the grant", 2, DENIED, |c: &mut RetrieveCall| {
                        c.request.attributes = normal_outer(Cacheability::WriteBack)
                    }),
                    Mutation::new("total length beyond TX", 3, INVALID, move |c: &mut RetrieveCall| {
                        c.total_length = Some(too_long)
                    }),
                    Mutation::new("sender is not the owner", 4, INVALID, move |c: &mut RetrieveCall| {
                        c.request.sender = third_party
                    }),
                    Mutation::new("instruction access on share", 5, INVALID, |c: &mut RetrieveCall| {
                        c.request.instruction_access = InstructionAccess::NotExecutable
                    }),
                ];
                inject_all(mb, &baseline, &mutations)
            })
        });
    finish(port, result, 11)
}

// ── share_invalid_handle_tag ─────────────────────────────────────────

const HANDOFF_TAG: u64 = 0x1234;

pub(super) fn invalid_handle_tag_client(env: &TestEnv, port: &ClientPort) -> Result<(), CheckError> {
    each_width(env, |width| {
        share_round(env, port, width, normal_outer(Cacheability::WriteBack), HANDOFF_TAG)
    })
}

pub(super) fn invalid_handle_tag_server(
    env: &TestEnv,
    port: &mut ServerPort,
    request: DirectPayload,
) -> Result<(), CheckError> {
    let result = Transaction::incoming(Handoff::from_payload(request), port.peer(), env.server.id)
        .at(3)
        .and_then(|tx| {
            with_mailbox(&env.server, env.config.mailbox_pages, (4, 5), |mb| {
                let baseline = RetrieveCall::new(
                    tx.retrieve_fid(),
                    tx.retrieve_request(DataAccess::ReadWrite, normal_outer(Cacheability::WriteBack)),
                );
                let mutations = [
                    Mutation::new("handle below the issued one", 1, INVALID, |c: &mut RetrieveCall| {
                        c.request.handle = c.request.handle.offset(-0xF)
                    }),
                    Mutation::new("handle above the issued one", 1, INVALID, |c: &mut RetrieveCall| {
                        c.request.handle = c.request.handle.offset(1)
                    }),
                    Mutation::new("tag mismatch", 2, INVALID, |c: &mut RetrieveCall| {
                        c.request.tag = c.request.tag.wrapping_sub(0xFF)
                    }),
                ];
                inject_all(mb, &baseline, &mutations)
            })
        });
    finish(port, result, 6)
}
