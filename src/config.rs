//! Run configuration.
//!
//! Defaults describe an FVP-like layout. A flattened device tree manifest
//! can override any of them:
//!
//! ```text
//! / {
//!     #address-cells = <2>;
//!     #size-cells = <2>;
//!     endpoints {
//!         client-id = <0x8001>;
//!         server-id = <0x8002>;
//!         third-party-id = <0x8003>;
//!         mailbox-pages = <1>;
//!     };
//!     memory { reg = <0x0 0x80000000 0x0 0x1000000>; };
//!     secure-uart { reg = <0x0 0x1c0b0000 0x0 0x1000>; };
//!     ns-uart { reg = <0x0 0x1c0a0000 0x0 0x1000>; };
//! };
//! ```
//!
//! Properties that are missing keep their default.

use fdt::node::FdtNode;
use fdt::Fdt;
use log::{debug, info};
use thiserror::Error;

use crate::ffa::{EndpointId, FFA_PAGE_SIZE};

/// Arena pages the scenario catalogue needs: the fragmented retrieve lends
/// 300 scattered pages out of a 600-page span.
pub const MIN_ARENA_PAGES: u64 = 1024;

/// Largest RXTX page count the FF-A map call can encode.
const MAX_MAILBOX_PAGES: u32 = 63;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("manifest is not a valid device tree: {0}")]
    Fdt(String),
    #[error("manifest property {name} = {value:#x} is out of range")]
    Property { name: &'static str, value: u64 },
    #[error("endpoint ID {0:#06x} is used twice")]
    DuplicateId(EndpointId),
    #[error("mailbox page count {0} must be between 1 and {MAX_MAILBOX_PAGES}")]
    MailboxPages(u32),
    #[error("arena of {0} pages is smaller than the {MIN_ARENA_PAGES} the tests need")]
    ArenaTooSmall(u64),
    #[error("arena base {0:#x} is not page aligned")]
    ArenaAlignment(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub client_id: EndpointId,
    pub server_id: EndpointId,
    /// Partition that takes part in no transaction, for wrong-sender checks
    pub third_party_id: EndpointId,
    /// RX/TX buffer size in pages for the default mailboxes
    pub mailbox_pages: u32,
    pub s_uart_base: u64,
    pub ns_uart_base: u64,
    /// Size of each UART MMIO window
    pub uart_size: u64,
    pub arena_base: u64,
    pub arena_pages: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: 0x8001,
            server_id: 0x8002,
            third_party_id: 0x8003,
            mailbox_pages: 1,
            s_uart_base: 0x1C0B_0000,
            ns_uart_base: 0x1C0A_0000,
            uart_size: 0x1000,
            arena_base: 0x8000_0000,
            arena_pages: 4096,
        }
    }
}

impl Config {
    /// Apply a manifest blob on top of the defaults.
    pub fn from_manifest(blob: &[u8]) -> Result<Self, ConfigError> {
        let fdt = Fdt::new(blob).map_err(|e| ConfigError::Fdt(format!("{:?}", e)))?;
        let mut config = Self::default();

        // 1. Endpoints
        if let Some(node) = fdt.find_node("/endpoints") {
            if let Some(v) = id_prop(&node, "client-id")? {
                config.client_id = v;
            }
            if let Some(v) = id_prop(&node, "server-id")? {
                config.server_id = v;
            }
            if let Some(v) = id_prop(&node, "third-party-id")? {
                config.third_party_id = v;
            }
            if let Some(value) = int_prop(&node, "mailbox-pages") {
                config.mailbox_pages = u32::try_from(value).map_err(|_| ConfigError::Property {
                    name: "mailbox-pages",
                    value,
                })?;
            }
        }

        // 2. Arena
        if let Some((base, size)) = first_reg(&fdt, "/memory") {
            config.arena_base = base;
            if let Some(size) = size {
                config.arena_pages = size / FFA_PAGE_SIZE as u64;
            }
        }

        // 3. UARTs
        if let Some((base, size)) = first_reg(&fdt, "/secure-uart") {
            config.s_uart_base = base;
            if let Some(size) = size {
                config.uart_size = size;
            }
        }
        if let Some((base, _)) = first_reg(&fdt, "/ns-uart") {
            config.ns_uart_base = base;
        }

        config.validate()?;
        info!(
            "manifest: client={:#06x} server={:#06x} third={:#06x} arena={:#x}+{} pages",
            config.client_id,
            config.server_id,
            config.third_party_id,
            config.arena_base,
            config.arena_pages
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ids = [self.client_id, self.server_id, self.third_party_id];
        for (i, id) in ids.iter().enumerate() {
            if ids[..i].contains(id) {
                return Err(ConfigError::DuplicateId(*id));
            }
        }
        if self.mailbox_pages == 0 || self.mailbox_pages > MAX_MAILBOX_PAGES {
            return Err(ConfigError::MailboxPages(self.mailbox_pages));
        }
        if self.arena_pages < MIN_ARENA_PAGES {
            return Err(ConfigError::ArenaTooSmall(self.arena_pages));
        }
        if self.arena_base % FFA_PAGE_SIZE as u64 != 0 {
            return Err(ConfigError::ArenaAlignment(self.arena_base));
        }
        Ok(())
    }

    /// UART the client must never be able to transfer: the secure one for
    /// a secure partition, the non-secure one otherwise.
    pub fn uart_for(&self, id: EndpointId) -> u64 {
        if crate::ffa::is_secure_endpoint(id) {
            self.s_uart_base
        } else {
            self.ns_uart_base
        }
    }
}

fn int_prop(node: &FdtNode<'_, '_>, name: &str) -> Option<u64> {
    let value = node.property(name)?.as_usize()? as u64;
    debug!("manifest: {}/{} = {:#x}", node.name, name, value);
    Some(value)
}

fn id_prop(node: &FdtNode<'_, '_>, name: &'static str) -> Result<Option<EndpointId>, ConfigError> {
    match int_prop(node, name) {
        None => Ok(None),
        Some(value) => EndpointId::try_from(value)
            .map(Some)
            .map_err(|_| ConfigError::Property { name, value }),
    }
}

/// Base and size of the first `reg` entry of `path`.
fn first_reg(fdt: &Fdt<'_>, path: &str) -> Option<(u64, Option<u64>)> {
    let node = fdt.find_node(path)?;
    let reg = node.reg()?.next()?;
    Some((reg.starting_address as u64, reg.size.map(|s| s as u64)))
}
