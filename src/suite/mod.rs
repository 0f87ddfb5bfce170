//! Scenario catalogue and runner.
//!
//! Each scenario is a client half and an optional server half. The runner
//! gives them a rendezvous channel, runs them on two scoped threads and
//! joins both before checking that the test left nothing behind.
//!
//! Server halves are request handlers: the runner waits for a direct
//! request, calls the handler with it, and loops until the client hangs up.
//! Every handler answers with a reply whose first word is 0 on success or
//! the error point it failed at, so the client can stop before touching a
//! handle the server left in a bad state.

mod donate;
mod lend;
mod share;

use std::sync::Arc;
use std::thread;

use log::{error, info};

use crate::config::Config;
use crate::ffa::abi::Endpoint;
use crate::ffa::channel::{direct_channel, ChannelError, ClientPort, DirectPayload, Handoff, ServerPort};
use crate::ffa::descriptors::{pages_of, Constituent};
use crate::ffa::mailbox::MailboxPair;
use crate::ffa::*;
use crate::mm::PhysMemory;
use crate::status::{AtPoint, CheckError, Failure, Status};
use crate::stub::{StubConfig, StubRelayer};

/// Relayer-side counters the runner compares before and after a test.
pub trait LeakProbe: Send + Sync {
    fn mapped_mailboxes(&self) -> usize;
    fn outstanding_handles(&self) -> usize;
}

pub type ClientFn = fn(&TestEnv, &ClientPort) -> Result<(), CheckError>;
pub type ServerFn = fn(&TestEnv, &mut ServerPort, DirectPayload) -> Result<(), CheckError>;

pub struct TestCase {
    pub name: &'static str,
    /// The test is skipped unless the relayer reports at least one of these
    pub requires: &'static [u64],
    pub client: ClientFn,
    pub server: Option<ServerFn>,
}

#[derive(Debug)]
pub enum Verdict {
    Pass,
    Fail(CheckError),
    Skip,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Summary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    fn add(&mut self, verdict: &Verdict) {
        match verdict {
            Verdict::Pass => self.passed += 1,
            Verdict::Fail(_) => self.failed += 1,
            Verdict::Skip => self.skipped += 1,
        }
    }
}

/// Everything a scenario half can reach.
pub struct TestEnv {
    pub config: Config,
    pub memory: PhysMemory,
    pub client: Endpoint,
    pub server: Endpoint,
    /// Endpoint that takes part in no transaction
    pub third_party: EndpointId,
    probe: Arc<dyn LeakProbe>,
}

impl TestEnv {
    pub fn new<R>(config: Config, memory: PhysMemory, relayer: Arc<R>) -> Self
    where
        R: Relayer + LeakProbe + 'static,
    {
        let calls: Arc<dyn Relayer> = relayer.clone();
        Self {
            client: Endpoint::new(config.client_id, calls.clone(), memory.clone()),
            server: Endpoint::new(config.server_id, calls, memory.clone()),
            third_party: config.third_party_id,
            config,
            memory,
            probe: relayer,
        }
    }

    /// Environment backed by a fresh [`StubRelayer`].
    pub fn with_stub(config: Config) -> Self {
        let stub = StubConfig::for_config(&config);
        Self::with_stub_config(config, stub)
    }

    pub fn with_stub_config(config: Config, stub: StubConfig) -> Self {
        let memory = PhysMemory::new(config.arena_base, config.arena_pages);
        let relayer = Arc::new(StubRelayer::new(memory.clone(), stub));
        Self::new(config, memory, relayer)
    }

    fn snapshot(&self) -> Resources {
        Resources {
            pages: self.memory.outstanding_pages(),
            mailboxes: self.probe.mapped_mailboxes(),
            handles: self.probe.outstanding_handles(),
        }
    }
}

/// Resource counts the leak check compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Resources {
    pages: u64,
    mailboxes: usize,
    handles: usize,
}

impl Resources {
    fn compare(&self, after: &Resources) -> Result<(), Failure> {
        if after.pages > self.pages {
            return Err(Failure::Leak(after.pages - self.pages));
        }
        if after.mailboxes != self.mailboxes {
            return Err(Failure::Check(format!(
                "{} mailbox(es) mapped after the test, {} before",
                after.mailboxes, self.mailboxes
            )));
        }
        if after.handles != self.handles {
            return Err(Failure::Check(format!(
                "{} handle(s) outstanding after the test, {} before",
                after.handles, self.handles
            )));
        }
        Ok(())
    }
}

/// Error point of the post-test resource check.
pub const LEAK_CHECK_POINT: u32 = 0;

const CATALOGUE: &[TestCase] = &[
    TestCase {
        name: "share_input_error_checks",
        requires: &[FFA_MEM_SHARE_64, FFA_MEM_SHARE_32],
        client: share::input_error_checks_client,
        server: None,
    },
    TestCase {
        name: "share_retrieve_input_checks",
        requires: &[FFA_MEM_SHARE_64, FFA_MEM_SHARE_32],
        client: share::retrieve_input_checks_client,
        server: Some(share::retrieve_input_checks_server),
    },
    TestCase {
        name: "share_invalid_handle_tag",
        requires: &[FFA_MEM_SHARE_64, FFA_MEM_SHARE_32],
        client: share::invalid_handle_tag_client,
        server: Some(share::invalid_handle_tag_server),
    },
    TestCase {
        name: "donate_lower_upper_boundary_32",
        requires: &[FFA_MEM_DONATE_32],
        client: donate::boundary_32_client,
        server: Some(donate::boundary_32_server),
    },
    TestCase {
        name: "donate_lifecycle",
        requires: &[FFA_MEM_DONATE_64, FFA_MEM_DONATE_32],
        client: donate::lifecycle_client,
        server: Some(donate::lifecycle_server),
    },
    TestCase {
        name: "lend_retrieve_align_hint",
        requires: &[FFA_MEM_LEND_64, FFA_MEM_LEND_32],
        client: lend::align_hint_client,
        server: Some(lend::align_hint_server),
    },
    TestCase {
        name: "lend_retrieve_fragmented",
        requires: &[FFA_MEM_LEND_64, FFA_MEM_LEND_32],
        client: lend::fragmented_client,
        server: Some(lend::fragmented_server),
    },
];

pub fn all() -> &'static [TestCase] {
    CATALOGUE
}

pub fn find(name: &str) -> Option<&'static TestCase> {
    CATALOGUE.iter().find(|t| t.name == name)
}

/// Run one scenario to completion and check for leaks.
pub fn run_test(env: &TestEnv, test: &TestCase) -> Verdict {
    info!("=== Test: {} ===", test.name);
    if !test.requires.iter().any(|&fid| env.client.supports(fid)) {
        info!("[SKIP] {}: relayer supports none of the required ABIs", test.name);
        return Verdict::Skip;
    }

    let before = env.snapshot();
    let (client_port, server_port) = direct_channel(env.client.id, env.server.id);
    let (client_result, server_result) = thread::scope(|s| {
        let server = test
            .server
            .map(|handler| s.spawn(move || serve(env, server_port, handler)));
        let client_result = (test.client)(env, &client_port);
        // Hanging up ends the server's request loop.
        drop(client_port);
        let server_result = match server {
            Some(thread) => thread.join().unwrap_or_else(|_| {
                Err(Failure::Check("server thread panicked".into()).at(LEAK_CHECK_POINT))
            }),
            None => Ok(()),
        };
        (client_result, server_result)
    });

    // A failed server is what a failed client reacted to, unless the
    // server only failed because the client hung up on it.
    let hung_up = matches!(
        &server_result,
        Err(CheckError {
            failure: Failure::Channel(ChannelError::Disconnected),
            ..
        })
    );
    let mut status = Status::new();
    if hung_up {
        status.check(client_result);
        status.check(server_result);
    } else {
        status.check(server_result);
        status.check(client_result);
    }
    status.check(before.compare(&env.snapshot()).at(LEAK_CHECK_POINT));

    match status.into_result() {
        Ok(()) => {
            info!("[PASS] {}", test.name);
            Verdict::Pass
        }
        Err(e) => {
            error!("[FAIL] {}: {}", test.name, e);
            Verdict::Fail(e)
        }
    }
}

pub fn run_all<'a>(env: &TestEnv, tests: impl IntoIterator<Item = &'a TestCase>) -> Summary {
    let mut summary = Summary::default();
    for test in tests {
        summary.add(&run_test(env, test));
    }
    info!(
        "=== Results: {} passed, {} failed, {} skipped ===",
        summary.passed, summary.failed, summary.skipped
    );
    summary
}

/// Server request loop. Runs until the client hangs up.
fn serve(env: &TestEnv, mut port: ServerPort, handler: ServerFn) -> Result<(), CheckError> {
    let mut status = Status::new();
    loop {
        let request = match port.wait_direct_req() {
            Ok(request) => request,
            Err(ChannelError::Disconnected) => break,
            Err(e) => {
                status.record(Failure::from(e).at(LEAK_CHECK_POINT));
                break;
            }
        };
        status.check(handler(env, &mut port, request));
        if port.is_pending() {
            // The handler bailed out before answering; unblock the client.
            let point = status.first().map_or(u32::MAX, |e| e.point);
            if port.send_direct_resp(reply(point, None)).is_err() {
                break;
            }
        }
    }
    status.into_result()
}

// ── Helpers shared by the scenarios ─────────────────────────────────

/// ABI widths of `kind` the relayer supports, 64-bit first.
pub(crate) fn widths(endpoint: &Endpoint, kind: TransferKind) -> Vec<AbiWidth> {
    [AbiWidth::W64, AbiWidth::W32]
        .into_iter()
        .filter(|&w| endpoint.supports(kind.fid(w)))
        .collect()
}

/// Map a mailbox for `endpoint`, run `body` with it, then unmap it. The
/// mailbox is torn down whatever `body` returns.
pub(crate) fn with_mailbox<T>(
    endpoint: &Endpoint,
    pages: u32,
    (map_point, unmap_point): (u32, u32),
    body: impl FnOnce(&mut MailboxPair<'_>) -> Result<T, CheckError>,
) -> Result<T, CheckError> {
    let mut mb = MailboxPair::acquire(endpoint, pages).at(map_point)?;
    let result = body(&mut mb);
    let released = mb.release().at(unmap_point);
    match (result, released) {
        (Ok(v), Ok(())) => Ok(v),
        (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
        (Err(e), Err(later)) => {
            error!("{} (suppressed)", later);
            Err(e)
        }
    }
}

/// Reply payload: status word, then an optional handle for the client.
pub(crate) fn reply(status: u32, handoff: Option<Handoff>) -> DirectPayload {
    let [handle, tag, fid, ..] = handoff.map_or([0; 5], Handoff::to_payload);
    [status as u64, handle, tag, fid, 0]
}

/// Check a server reply and pull out the handle it carries, if any.
pub(crate) fn parse_reply(data: DirectPayload) -> Result<Option<Handoff>, Failure> {
    if data[0] != 0 {
        return Err(Failure::Check(format!(
            "server failed at error point {}",
            data[0]
        )));
    }
    Ok((data[3] != 0).then(|| Handoff::from_payload([data[1], data[2], data[3], 0, 0])))
}

/// Send `handoff` to the server and wait for its reply.
pub(crate) fn hand_off(port: &ClientPort, handoff: Handoff) -> Result<Option<Handoff>, Failure> {
    let data = port.send_direct_req(handoff.to_payload())?;
    parse_reply(data)
}

/// Answer the server's pending request with the outcome of its round.
pub(crate) fn finish(
    port: &mut ServerPort,
    result: Result<(), CheckError>,
    point: u32,
) -> Result<(), CheckError> {
    let status = result.as_ref().err().map_or(0, |e| e.point);
    let sent = port.send_direct_resp(reply(status, None)).at(point);
    result.and(sent)
}

/// Write each page's ordinal, xor `seed`, into its first eight bytes.
pub(crate) fn stamp_pages(memory: &PhysMemory, region: &[Constituent], seed: u64) -> Result<(), Failure> {
    for (i, pa) in pages_of(region).enumerate() {
        memory.write(pa, &(seed ^ i as u64).to_le_bytes())?;
    }
    Ok(())
}

/// Check that `region` lists the pages [`stamp_pages`] marked, in order.
pub(crate) fn verify_stamps(memory: &PhysMemory, region: &[Constituent], seed: u64) -> Result<(), Failure> {
    for (i, pa) in pages_of(region).enumerate() {
        let mut word = [0u8; 8];
        memory.read(pa, &mut word)?;
        let found = u64::from_le_bytes(word) ^ seed;
        if found != i as u64 {
            return Err(Failure::Check(format!(
                "page {} at {:#x} carries the stamp of page {}",
                i, pa, found
            )));
        }
    }
    Ok(())
}
