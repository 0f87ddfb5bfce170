//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use ffa_memval::config::Config;
use ffa_memval::ffa::abi::Endpoint;
use ffa_memval::ffa::{EndpointId, FfaArgs, Relayer, FFA_RXTX_MAP_64};
use ffa_memval::mm::PhysMemory;
use ffa_memval::stub::{StubConfig, StubRelayer};
use ffa_memval::suite::{LeakProbe, TestEnv};

pub const CLIENT: u16 = 0x8001;
pub const SERVER: u16 = 0x8002;
pub const THIRD_PARTY: u16 = 0x8003;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A suite environment over a stub relayer, plus the stub itself for
/// inspection. `tweak` adjusts the stub's configuration.
pub fn setup(tweak: impl FnOnce(StubConfig) -> StubConfig) -> (TestEnv, Arc<StubRelayer>) {
    init_logging();
    let config = Config::default();
    let memory = PhysMemory::new(config.arena_base, config.arena_pages);
    let stub = tweak(StubConfig::for_config(&config));
    let relayer = Arc::new(StubRelayer::new(memory.clone(), stub));
    (TestEnv::new(config, memory, relayer.clone()), relayer)
}

pub fn default_setup() -> (TestEnv, Arc<StubRelayer>) {
    setup(|stub| stub)
}

/// A bare endpoint sharing `env`'s relayer, for calls from an ID the
/// environment does not hand out.
pub fn endpoint_as(env: &TestEnv, id: u16, relayer: &Arc<StubRelayer>) -> Endpoint {
    Endpoint::new(id, relayer.clone(), env.memory.clone())
}

// ── Relayer that rewrites the stub's answers ───────────────────────

/// Rewrites one response. Gets the arena, the caller's RX address once it
/// has mapped a mailbox, and the stub's answer.
pub type Rewrite = dyn Fn(&PhysMemory, Option<u64>, FfaArgs) -> FfaArgs + Send + Sync;

/// A stub relayer whose responses pass through `rewrite` first.
pub struct Tampering {
    inner: Arc<StubRelayer>,
    memory: PhysMemory,
    rx: Mutex<BTreeMap<EndpointId, u64>>,
    rewrite: Box<Rewrite>,
}

impl Relayer for Tampering {
    fn call(&self, caller: EndpointId, args: FfaArgs) -> FfaArgs {
        if args.fid == FFA_RXTX_MAP_64 {
            self.rx.lock().insert(caller, args.arg2);
        }
        let ret = self.inner.call(caller, args);
        let rx = self.rx.lock().get(&caller).copied();
        (self.rewrite)(&self.memory, rx, ret)
    }
}

impl LeakProbe for Tampering {
    fn mapped_mailboxes(&self) -> usize {
        self.inner.mapped_mailboxes()
    }

    fn outstanding_handles(&self) -> usize {
        self.inner.outstanding_handles()
    }
}

/// A default environment whose relayer answers through `rewrite`, plus the
/// stub underneath for inspection.
pub fn tampered_setup(
    rewrite: impl Fn(&PhysMemory, Option<u64>, FfaArgs) -> FfaArgs + Send + Sync + 'static,
) -> (TestEnv, Arc<StubRelayer>) {
    init_logging();
    let config = Config::default();
    let memory = PhysMemory::new(config.arena_base, config.arena_pages);
    let inner = Arc::new(StubRelayer::new(memory.clone(), StubConfig::for_config(&config)));
    let relayer = Arc::new(Tampering {
        inner: inner.clone(),
        memory: memory.clone(),
        rx: Mutex::new(BTreeMap::new()),
        rewrite: Box::new(rewrite),
    });
    (TestEnv::new(config, memory, relayer), inner)
}

// ── Minimal flattened device tree writer ─────────────────────────────

const FDT_MAGIC: u32 = 0xD00D_FEED;
const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;
const HEADER_SIZE: usize = 40;
const RSVMAP_SIZE: usize = 16;

/// Writes a version 17 device tree blob.
#[derive(Default)]
pub struct FdtWriter {
    structs: Vec<u8>,
    strings: Vec<u8>,
}

impl FdtWriter {
    pub fn new() -> Self {
        let mut w = Self::default();
        w.begin_node("");
        w
    }

    fn word(&mut self, v: u32) {
        self.structs.extend_from_slice(&v.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structs.len() % 4 != 0 {
            self.structs.push(0);
        }
    }

    fn string_offset(&mut self, name: &str) -> u32 {
        let off = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        off
    }

    pub fn begin_node(&mut self, name: &str) -> &mut Self {
        self.word(FDT_BEGIN_NODE);
        self.structs.extend_from_slice(name.as_bytes());
        self.structs.push(0);
        self.pad();
        self
    }

    pub fn end_node(&mut self) -> &mut Self {
        self.word(FDT_END_NODE);
        self
    }

    pub fn prop(&mut self, name: &str, value: &[u8]) -> &mut Self {
        let nameoff = self.string_offset(name);
        self.word(FDT_PROP);
        self.word(value.len() as u32);
        self.word(nameoff);
        self.structs.extend_from_slice(value);
        self.pad();
        self
    }

    pub fn prop_cells(&mut self, name: &str, cells: &[u32]) -> &mut Self {
        let bytes: Vec<u8> = cells.iter().flat_map(|c| c.to_be_bytes()).collect();
        self.prop(name, &bytes)
    }

    pub fn prop_u32(&mut self, name: &str, v: u32) -> &mut Self {
        self.prop_cells(name, &[v])
    }

    /// `reg` with two address and two size cells.
    pub fn prop_reg(&mut self, base: u64, size: u64) -> &mut Self {
        self.prop_cells(
            "reg",
            &[(base >> 32) as u32, base as u32, (size >> 32) as u32, size as u32],
        )
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.end_node();
        self.word(FDT_END);

        let off_rsvmap = HEADER_SIZE;
        let off_struct = off_rsvmap + RSVMAP_SIZE;
        let off_strings = off_struct + self.structs.len();
        let total = off_strings + self.strings.len();

        let mut blob = Vec::with_capacity(total);
        for v in [
            FDT_MAGIC,
            total as u32,
            off_struct as u32,
            off_strings as u32,
            off_rsvmap as u32,
            17,
            16,
            0,
            self.strings.len() as u32,
            self.structs.len() as u32,
        ] {
            blob.extend_from_slice(&v.to_be_bytes());
        }
        blob.extend_from_slice(&[0u8; RSVMAP_SIZE]);
        blob.extend_from_slice(&self.structs);
        blob.extend_from_slice(&self.strings);
        blob
    }
}

/// Manifest with the root cell sizes set and `body` filling in the rest.
pub fn manifest(body: impl FnOnce(&mut FdtWriter)) -> Vec<u8> {
    let mut w = FdtWriter::new();
    w.prop_u32("#address-cells", 2).prop_u32("#size-cells", 2);
    body(&mut w);
    w.finish()
}
