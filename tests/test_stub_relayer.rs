//! Reference relayer: ABI dispatch and memory management rules.

mod common;

use common::{default_setup, endpoint_as, setup, CLIENT, SERVER, THIRD_PARTY};
use ffa_memval::ffa::descriptors::{
    Cacheability, Constituent, DataAccess, MemAttributes, MemRegionIntent, MemType, Shareability,
};
use ffa_memval::ffa::driver::{issue_relinquish, issue_transfer, Transaction};
use ffa_memval::ffa::mailbox::MailboxPair;
use ffa_memval::ffa::*;
use ffa_memval::stub::StubConfig;

fn share(mb: &MailboxPair<'_>, page: u64) -> Transaction {
    let intent = MemRegionIntent::single_page(CLIENT, SERVER, page);
    Transaction::transfer(mb, TransferKind::Share, AbiWidth::W64, &intent).unwrap()
}

fn lend(mb: &MailboxPair<'_>, page: u64) -> Transaction {
    let intent = MemRegionIntent::single_page(CLIENT, SERVER, page);
    Transaction::transfer(mb, TransferKind::Lend, AbiWidth::W64, &intent).unwrap()
}

#[test]
fn test_version_and_id() {
    let (env, _relayer) = default_setup();
    assert_eq!(env.client.version(0x0001_0000).fid, FFA_VERSION_1_1 as u64);

    let ret = env.server.id_get();
    assert!(ret.is_success());
    assert_eq!(ret.arg2, SERVER as u64);
}

#[test]
fn test_features() {
    let (env, _relayer) = setup(|stub| stub.without(FFA_MEM_DONATE_32));
    assert!(env.client.supports(FFA_MEM_SHARE_64));
    assert!(env.client.supports(FFA_MEM_DONATE_64));
    assert!(!env.client.supports(FFA_MEM_DONATE_32));
    assert!(!env.client.supports(FFA_MEM_FRAG_TX));
}

#[test]
fn test_unknown_and_disabled_calls() {
    let (env, _relayer) = setup(|stub| stub.without(FFA_MEM_DONATE_32));
    let unknown = env.client.call(FfaArgs::new(0x8400_00FF));
    assert_eq!(unknown.error_code(), Some(FfaError::NotSupported));
    let disabled = env.client.mem_transfer(FFA_MEM_DONATE_32, 96, 96);
    assert_eq!(disabled.error_code(), Some(FfaError::NotSupported));
}

#[test]
fn test_rxtx_map_rules() {
    let (env, relayer) = default_setup();
    let tx = env.memory.alloc(2).unwrap();
    let rx = env.memory.alloc(2).unwrap();

    let zero = env.client.rxtx_map(tx.pa, rx.pa, 0);
    assert_eq!(zero.error_code(), Some(FfaError::InvalidParameters));
    let misaligned = env.client.rxtx_map(tx.pa + 0x10, rx.pa, 1);
    assert_eq!(misaligned.error_code(), Some(FfaError::InvalidParameters));
    let overlap = env.client.rxtx_map(tx.pa, tx.pa + FFA_PAGE_SIZE as u64, 2);
    assert_eq!(overlap.error_code(), Some(FfaError::InvalidParameters));
    let outside = env.client.rxtx_map(0x1000, rx.pa, 1);
    assert_eq!(outside.error_code(), Some(FfaError::InvalidParameters));
    assert_eq!(relayer.mapped_mailboxes(), 0);

    assert!(env.client.rxtx_map(tx.pa, rx.pa, 2).is_success());
    let again = env.client.rxtx_map(tx.pa, rx.pa, 2);
    assert_eq!(again.error_code(), Some(FfaError::Denied));

    assert!(env.client.rxtx_unmap().is_success());
    assert_eq!(env.client.rxtx_unmap().error_code(), Some(FfaError::Denied));
    env.memory.free(tx);
    env.memory.free(rx);
}

#[test]
fn test_transfer_without_mailbox() {
    let (env, _relayer) = default_setup();
    let ret = env.client.mem_transfer(FFA_MEM_SHARE_64, 96, 96);
    assert_eq!(ret.error_code(), Some(FfaError::Denied));
}

#[test]
fn test_fragmented_transfer_not_supported() {
    let (env, _relayer) = default_setup();
    let page = env.memory.alloc(1).unwrap();
    let mb = MailboxPair::acquire(&env.client, 1).unwrap();
    let intent = MemRegionIntent::single_page(CLIENT, SERVER, page.pa);
    let lengths = Some(ffa_memval::ffa::descriptors::Lengths {
        total: 96,
        fragment: 48,
    });
    let ret = issue_transfer(&mb, FFA_MEM_SHARE_64, &intent, lengths).unwrap();
    assert_eq!(ret.error_code(), Some(FfaError::NotSupported));
    mb.release().unwrap();
}

#[test]
fn test_device_memory_is_denied() {
    let (env, relayer) = default_setup();
    let mb = MailboxPair::acquire(&env.client, 1).unwrap();
    let uart = env.config.uart_for(CLIENT);
    let intent = MemRegionIntent::single_page(CLIENT, SERVER, uart);
    let ret = issue_transfer(&mb, FFA_MEM_SHARE_64, &intent, None).unwrap();
    assert_eq!(ret.error_code(), Some(FfaError::Denied));
    assert_eq!(relayer.outstanding_handles(), 0);
    mb.release().unwrap();
}

#[test]
fn test_page_in_a_live_transaction() {
    let (env, relayer) = default_setup();
    let page = env.memory.alloc(1).unwrap();
    let mb = MailboxPair::acquire(&env.client, 1).unwrap();

    let mut first = share(&mb, page.pa);
    assert_eq!(relayer.pages_in_use(), 1);
    let intent = MemRegionIntent::single_page(CLIENT, THIRD_PARTY, page.pa);
    let ret = issue_transfer(&mb, FFA_MEM_LEND_64, &intent, None).unwrap();
    assert_eq!(ret.error_code(), Some(FfaError::Denied));

    // Overlapping constituents within one descriptor
    let span = env.memory.alloc(2).unwrap();
    let overlapping = MemRegionIntent::single_page(CLIENT, SERVER, span.pa).with_constituents(vec![
        Constituent::new(span.pa, 2),
        Constituent::new(span.page(1), 1),
    ]);
    let ret = issue_transfer(&mb, FFA_MEM_LEND_64, &overlapping, None).unwrap();
    assert_eq!(ret.error_code(), Some(FfaError::InvalidParameters));

    first.reclaim(&env.client, 0).unwrap();
    assert_eq!(relayer.pages_in_use(), 0);
    mb.release().unwrap();
}

#[test]
fn test_transfer_rules() {
    let (env, relayer) = default_setup();
    let page = env.memory.alloc(1).unwrap();
    let mb = MailboxPair::acquire(&env.client, 1).unwrap();
    let base = MemRegionIntent::single_page(CLIENT, SERVER, page.pa);

    let cases: Vec<(u64, MemRegionIntent, FfaError)> = vec![
        (
            FFA_MEM_SHARE_64,
            MemRegionIntent {
                sender: SERVER,
                receiver: CLIENT,
                ..base.clone()
            },
            FfaError::InvalidParameters,
        ),
        (
            FFA_MEM_LEND_64,
            MemRegionIntent {
                handle: Handle(9),
                ..base.clone()
            },
            FfaError::InvalidParameters,
        ),
        (
            FFA_MEM_LEND_64,
            MemRegionIntent {
                data_access: DataAccess::NotSpecified,
                ..base.clone()
            },
            FfaError::InvalidParameters,
        ),
        (
            FFA_MEM_SHARE_64,
            MemRegionIntent {
                attributes: MemAttributes::default(),
                ..base.clone()
            },
            FfaError::InvalidParameters,
        ),
        (
            FFA_MEM_SHARE_64,
            MemRegionIntent {
                attributes: MemAttributes::new(MemType::Normal {
                    cacheability: Cacheability::WriteBack,
                    shareability: Shareability::Reserved,
                }),
                ..base.clone()
            },
            FfaError::InvalidParameters,
        ),
        // A donor leaves access and type to the receiver
        (FFA_MEM_DONATE_64, base.clone(), FfaError::InvalidParameters),
    ];
    for (fid, intent, expected) in cases {
        let ret = issue_transfer(&mb, fid, &intent, None).unwrap();
        assert_eq!(ret.error_code(), Some(expected), "{} {:?}", fid_name(fid), intent);
    }
    assert_eq!(relayer.outstanding_handles(), 0);
    mb.release().unwrap();
}

#[test]
fn test_reclaim_rules() {
    let (env, relayer) = default_setup();
    let page = env.memory.alloc(1).unwrap();
    let client_mb = MailboxPair::acquire(&env.client, 1).unwrap();
    let mut server_mb = MailboxPair::acquire(&env.server, 1).unwrap();
    let tx = share(&client_mb, page.pa);
    let handle = tx.handle();

    let unknown = env.client.mem_reclaim(handle.offset(100), 0);
    assert_eq!(unknown.error_code(), Some(FfaError::InvalidParameters));
    let not_owner = env.server.mem_reclaim(handle, 0);
    assert_eq!(not_owner.error_code(), Some(FfaError::Denied));
    let reserved = env.client.mem_reclaim(handle, 0b10);
    assert_eq!(reserved.error_code(), Some(FfaError::InvalidParameters));
    let zero_share = env.client.mem_reclaim(handle, 1);
    assert_eq!(zero_share.error_code(), Some(FfaError::InvalidParameters));

    let mut incoming = Transaction::incoming(tx.handoff(), CLIENT, SERVER).unwrap();
    let request = incoming.retrieve_request(DataAccess::ReadWrite, MemAttributes::new(MemType::NORMAL_WB));
    incoming.retrieve(&mut server_mb, &request).unwrap();
    let retrieved = env.client.mem_reclaim(handle, 0);
    assert_eq!(retrieved.error_code(), Some(FfaError::Denied));

    incoming.relinquish(&server_mb).unwrap();
    assert!(env.client.mem_reclaim(handle, 0).is_success());
    assert_eq!(relayer.outstanding_handles(), 0);

    server_mb.release().unwrap();
    client_mb.release().unwrap();
}

#[test]
fn test_relinquish_rules() {
    let (env, relayer) = default_setup();
    let page = env.memory.alloc(1).unwrap();
    let client_mb = MailboxPair::acquire(&env.client, 1).unwrap();
    let mut server_mb = MailboxPair::acquire(&env.server, 1).unwrap();
    let third = endpoint_as(&env, THIRD_PARTY, &relayer);
    let third_mb = MailboxPair::acquire(&third, 1).unwrap();
    let mut tx = lend(&client_mb, page.pa);
    let handle = tx.handle();

    // Not retrieved yet
    let early = issue_relinquish(&server_mb, handle).unwrap();
    assert_eq!(early.error_code(), Some(FfaError::Denied));

    let mut incoming = Transaction::incoming(tx.handoff(), CLIENT, SERVER).unwrap();
    let request = incoming.retrieve_request(DataAccess::ReadWrite, MemAttributes::new(MemType::NORMAL_WB));
    incoming.retrieve(&mut server_mb, &request).unwrap();

    let unknown = issue_relinquish(&server_mb, handle.offset(50)).unwrap();
    assert_eq!(unknown.error_code(), Some(FfaError::InvalidParameters));
    let stranger = issue_relinquish(&third_mb, handle).unwrap();
    assert_eq!(stranger.error_code(), Some(FfaError::Denied));
    // Names someone other than the caller
    server_mb
        .write_tx(|buf| descriptors::build_relinquish(handle, 0, &[CLIENT], buf))
        .unwrap()
        .unwrap();
    assert_eq!(
        env.server.mem_relinquish().error_code(),
        Some(FfaError::InvalidParameters)
    );
    server_mb
        .write_tx(|buf| descriptors::build_relinquish(handle, 0b100, &[SERVER], buf))
        .unwrap()
        .unwrap();
    assert_eq!(
        env.server.mem_relinquish().error_code(),
        Some(FfaError::InvalidParameters)
    );

    incoming.relinquish(&server_mb).unwrap();
    tx.peer_relinquished().unwrap();
    tx.reclaim(&env.client, 0).unwrap();
    assert_eq!(relayer.outstanding_handles(), 0);

    third_mb.release().unwrap();
    server_mb.release().unwrap();
    client_mb.release().unwrap();
}

#[test]
fn test_zero_before_retrieve_clears_lent_pages() {
    let (env, _relayer) = default_setup();
    let page = env.memory.alloc(1).unwrap();
    env.memory.fill(page.pa, FFA_PAGE_SIZE, 0xAA).unwrap();
    let client_mb = MailboxPair::acquire(&env.client, 1).unwrap();
    let mut server_mb = MailboxPair::acquire(&env.server, 1).unwrap();

    let mut intent = MemRegionIntent::single_page(CLIENT, SERVER, page.pa);
    intent.flags.zero_before_retrieve = true;
    let mut tx = Transaction::transfer(&client_mb, TransferKind::Lend, AbiWidth::W32, &intent).unwrap();
    // Nothing happens until the borrower retrieves
    assert_eq!(env.memory.read_vec(page.pa, 1).unwrap(), vec![0xAA]);

    let mut incoming = Transaction::incoming(tx.handoff(), CLIENT, SERVER).unwrap();
    let request = incoming.retrieve_request(DataAccess::ReadWrite, MemAttributes::new(MemType::NORMAL_WB));
    incoming.retrieve(&mut server_mb, &request).unwrap();
    let contents = env.memory.read_vec(page.pa, FFA_PAGE_SIZE).unwrap();
    assert!(contents.iter().all(|&b| b == 0));

    incoming.relinquish(&server_mb).unwrap();
    tx.peer_relinquished().unwrap();
    tx.reclaim(&env.client, 0).unwrap();
    server_mb.release().unwrap();
    client_mb.release().unwrap();
}

#[test]
fn test_retrieve_response_fields() {
    let (env, _relayer) = default_setup();
    let page = env.memory.alloc(1).unwrap();
    let client_mb = MailboxPair::acquire(&env.client, 1).unwrap();
    let mut server_mb = MailboxPair::acquire(&env.server, 1).unwrap();
    let mut tx = share(&client_mb, page.pa);

    let mut incoming = Transaction::incoming(tx.handoff(), CLIENT, SERVER).unwrap();
    let request = incoming.retrieve_request(DataAccess::NotSpecified, MemAttributes::default());
    let region = incoming.retrieve(&mut server_mb, &request).unwrap().clone();
    assert_eq!(region.sender, CLIENT);
    assert_eq!(region.receiver, SERVER);
    assert_eq!(region.handle, tx.handle());
    // Unspecified fields take what the sender granted
    assert_eq!(region.data_access, DataAccess::ReadWrite);
    assert_eq!(region.attributes.mem_type, MemType::NORMAL_WB);
    assert!(!region.attributes.non_secure);
    assert_eq!(region.constituents, vec![Constituent::new(page.pa, 1)]);
    assert!(!server_mb.rx_held());

    incoming.relinquish(&server_mb).unwrap();
    tx.peer_relinquished().unwrap();
    tx.reclaim(&env.client, 0).unwrap();
    server_mb.release().unwrap();
    client_mb.release().unwrap();
}

#[test]
fn test_retrieve_while_rx_held_is_busy() {
    let (env, relayer) = default_setup();
    let page = env.memory.alloc(1).unwrap();
    let client_mb = MailboxPair::acquire(&env.client, 1).unwrap();
    let mut server_mb = MailboxPair::acquire(&env.server, 1).unwrap();
    let mut first = share(&client_mb, page.pa);
    let other = env.memory.alloc(1).unwrap();
    let mut second = share(&client_mb, other.pa);

    let incoming = Transaction::incoming(first.handoff(), CLIENT, SERVER).unwrap();
    let request = incoming.retrieve_request(DataAccess::ReadWrite, MemAttributes::new(MemType::NORMAL_WB));
    let ret = driver::issue_retrieve(&mut server_mb, incoming.retrieve_fid(), &request, None).unwrap();
    assert_eq!(ret.fid, FFA_MEM_RETRIEVE_RESP);
    assert!(server_mb.rx_held());
    assert!(relayer.rx_held_by(SERVER));

    let later = Transaction::incoming(second.handoff(), CLIENT, SERVER).unwrap();
    let request = later.retrieve_request(DataAccess::ReadWrite, MemAttributes::new(MemType::NORMAL_WB));
    let busy = driver::issue_retrieve(&mut server_mb, later.retrieve_fid(), &request, None).unwrap();
    assert_eq!(busy.error_code(), Some(FfaError::Busy));

    server_mb.rx_release().unwrap();
    issue_relinquish(&server_mb, first.handle()).unwrap();
    first.peer_relinquished().unwrap();
    first.reclaim(&env.client, 0).unwrap();
    second.reclaim(&env.client, 0).unwrap();
    server_mb.release().unwrap();
    client_mb.release().unwrap();
}

#[test]
fn test_unmap_expires_unretrieved_transfers() {
    let (env, relayer) = setup(|stub: StubConfig| stub);
    let page = env.memory.alloc(1).unwrap();
    let mb = MailboxPair::acquire(&env.client, 1).unwrap();
    let _tx = share(&mb, page.pa);
    assert_eq!(relayer.outstanding_handles(), 1);
    mb.release().unwrap();
    assert_eq!(relayer.outstanding_handles(), 0);
    assert_eq!(relayer.pages_in_use(), 0);
}
