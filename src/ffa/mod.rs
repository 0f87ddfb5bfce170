//! FF-A v1.1 memory management ABI.
//!
//! Function IDs, error codes and the register-level call payload shared by
//! the endpoint side (builder, mailbox, driver, validator) and by whatever
//! implements [`Relayer`].

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

pub mod abi;
pub mod channel;
pub mod descriptors;
pub mod driver;
pub mod mailbox;
pub mod validator;

// ── Function IDs (DEN0077A Table 12.x) ──────────────────────────────

pub const FFA_ERROR: u64 = 0x8400_0060;
pub const FFA_SUCCESS_32: u64 = 0x8400_0061;
pub const FFA_SUCCESS_64: u64 = 0xC400_0061;
pub const FFA_VERSION: u64 = 0x8400_0063;
pub const FFA_FEATURES: u64 = 0x8400_0064;
pub const FFA_RX_RELEASE: u64 = 0x8400_0065;
pub const FFA_RXTX_MAP_32: u64 = 0x8400_0066;
pub const FFA_RXTX_MAP_64: u64 = 0xC400_0066;
pub const FFA_RXTX_UNMAP: u64 = 0x8400_0067;
pub const FFA_ID_GET: u64 = 0x8400_0069;
pub const FFA_MSG_SEND_DIRECT_REQ_32: u64 = 0x8400_006F;
pub const FFA_MSG_SEND_DIRECT_REQ_64: u64 = 0xC400_006F;
pub const FFA_MSG_SEND_DIRECT_RESP_32: u64 = 0x8400_0070;
pub const FFA_MSG_SEND_DIRECT_RESP_64: u64 = 0xC400_0070;
pub const FFA_MEM_DONATE_32: u64 = 0x8400_0071;
pub const FFA_MEM_DONATE_64: u64 = 0xC400_0071;
pub const FFA_MEM_LEND_32: u64 = 0x8400_0072;
pub const FFA_MEM_LEND_64: u64 = 0xC400_0072;
pub const FFA_MEM_SHARE_32: u64 = 0x8400_0073;
pub const FFA_MEM_SHARE_64: u64 = 0xC400_0073;
pub const FFA_MEM_RETRIEVE_REQ_32: u64 = 0x8400_0074;
pub const FFA_MEM_RETRIEVE_REQ_64: u64 = 0xC400_0074;
pub const FFA_MEM_RETRIEVE_RESP: u64 = 0x8400_0075;
pub const FFA_MEM_RELINQUISH: u64 = 0x8400_0076;
pub const FFA_MEM_RECLAIM: u64 = 0x8400_0077;
pub const FFA_MEM_FRAG_RX: u64 = 0x8400_007A;
pub const FFA_MEM_FRAG_TX: u64 = 0x8400_007B;

/// FF-A version 1.1
pub const FFA_VERSION_1_1: u32 = 0x0001_0001;

/// Memory sizes in the ABI are always counted in 4KB pages, whatever the
/// translation granule.
pub const FFA_PAGE_SIZE: usize = 4096;

/// FF-A endpoint (partition) ID.
pub type EndpointId = u16;

/// Bit 15 of an endpoint ID marks a secure partition.
pub fn is_secure_endpoint(id: EndpointId) -> bool {
    id & 0x8000 != 0
}

/// Pack a sender/receiver pair the way direct messages carry it in w1:
/// [31:16] sender, [15:0] receiver.
pub fn pack_endpoints(sender: EndpointId, receiver: EndpointId) -> u64 {
    ((sender as u64) << 16) | receiver as u64
}

/// Error status codes carried in w2 of an `FFA_ERROR` response.
#[derive(Clone, Copy, Debug, Eq, Error, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(i32)]
pub enum FfaError {
    #[error("NOT_SUPPORTED")]
    NotSupported = -1,
    #[error("INVALID_PARAMETERS")]
    InvalidParameters = -2,
    #[error("NO_MEMORY")]
    NoMemory = -3,
    #[error("BUSY")]
    Busy = -4,
    #[error("INTERRUPTED")]
    Interrupted = -5,
    #[error("DENIED")]
    Denied = -6,
    #[error("RETRY")]
    Retry = -7,
    #[error("ABORTED")]
    Aborted = -8,
    #[error("NO_DATA")]
    NoData = -9,
}

impl FfaError {
    /// Decode w2 of an `FFA_ERROR` response. Only the low 32 bits are
    /// significant; the register is not sign-extended.
    pub fn from_w2(w2: u64) -> Option<Self> {
        Self::try_from(w2 as u32 as i32).ok()
    }

    /// Encode for w2, masked to 32 bits.
    pub fn to_w2(self) -> u64 {
        i32::from(self) as u32 as u64
    }
}

/// Register-level argument tuple of one ABI call or response (x0-x7).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FfaArgs {
    pub fid: u64,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
    pub arg4: u64,
    pub arg5: u64,
    pub arg6: u64,
    pub arg7: u64,
}

impl FfaArgs {
    pub fn new(fid: u64) -> Self {
        Self {
            fid,
            ..Self::default()
        }
    }

    pub fn error(code: FfaError) -> Self {
        Self {
            fid: FFA_ERROR,
            arg2: code.to_w2(),
            ..Self::default()
        }
    }

    pub fn success() -> Self {
        Self::new(FFA_SUCCESS_32)
    }

    pub fn is_error(&self) -> bool {
        self.fid == FFA_ERROR
    }

    /// Error code of an `FFA_ERROR` response, `None` for any other payload
    /// or an unrecognised code.
    pub fn error_code(&self) -> Option<FfaError> {
        if self.is_error() {
            FfaError::from_w2(self.arg2)
        } else {
            None
        }
    }

    /// Raw 32-bit error value, for reporting codes outside [`FfaError`].
    pub fn raw_error(&self) -> i32 {
        self.arg2 as u32 as i32
    }

    pub fn is_success(&self) -> bool {
        self.fid == FFA_SUCCESS_32 || self.fid == FFA_SUCCESS_64
    }

    /// Handle returned in w2/w3 of a successful transfer.
    pub fn handle(&self) -> Handle {
        Handle::from_regs(self.arg2, self.arg3)
    }

    /// Accept `FFA_SUCCESS_32`/`_64` only.
    pub fn expect_success(self) -> Result<FfaArgs, CallError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(CallError::from(&self))
        }
    }
}

/// A call that was expected to succeed and did not.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CallError {
    #[error("FFA_ERROR {0}")]
    Error(FfaError),
    #[error("FFA_ERROR with unknown status {0}")]
    UnknownError(i32),
    #[error("unexpected response {}", fid_name(*.0))]
    Unexpected(u64),
}

impl From<&FfaArgs> for CallError {
    fn from(ret: &FfaArgs) -> Self {
        match ret.error_code() {
            Some(code) => Self::Error(code),
            None if ret.is_error() => Self::UnknownError(ret.raw_error()),
            None => Self::Unexpected(ret.fid),
        }
    }
}

/// Opaque 64-bit memory handle naming one in-flight transaction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u64);

impl Handle {
    /// Handle split across two 32-bit registers (low word first).
    pub fn from_regs(lo: u64, hi: u64) -> Self {
        Self((lo & 0xFFFF_FFFF) | ((hi & 0xFFFF_FFFF) << 32))
    }

    pub fn to_regs(self) -> (u64, u64) {
        (self.0 & 0xFFFF_FFFF, self.0 >> 32)
    }

    /// A handle off by `delta` from this one. Used to forge invalid handles.
    pub fn offset(self, delta: i64) -> Self {
        Self(self.0.wrapping_add(delta as u64))
    }
}

impl core::fmt::Display for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The privileged component under test (hypervisor or SPMC).
///
/// `caller` identifies the endpoint issuing the call. On hardware the
/// relayer learns this from the trapping context; in-process it is passed
/// explicitly.
pub trait Relayer: Send + Sync {
    fn call(&self, caller: EndpointId, args: FfaArgs) -> FfaArgs;
}

/// Descriptor-address width of a memory management call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiWidth {
    W32,
    W64,
}

impl AbiWidth {
    pub fn of(fid: u64) -> Self {
        if fid & (1 << 30) == 0 {
            Self::W32
        } else {
            Self::W64
        }
    }
}

/// Memory transfer kinds. Each has a 32-bit and a 64-bit function ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Donate,
    Lend,
    Share,
}

impl TransferKind {
    pub fn fid(self, width: AbiWidth) -> u64 {
        match (self, width) {
            (Self::Donate, AbiWidth::W32) => FFA_MEM_DONATE_32,
            (Self::Donate, AbiWidth::W64) => FFA_MEM_DONATE_64,
            (Self::Lend, AbiWidth::W32) => FFA_MEM_LEND_32,
            (Self::Lend, AbiWidth::W64) => FFA_MEM_LEND_64,
            (Self::Share, AbiWidth::W32) => FFA_MEM_SHARE_32,
            (Self::Share, AbiWidth::W64) => FFA_MEM_SHARE_64,
        }
    }

    /// Decode a transfer function ID into (kind, width).
    pub fn from_fid(fid: u64) -> Option<(Self, AbiWidth)> {
        let kind = match fid {
            FFA_MEM_DONATE_32 | FFA_MEM_DONATE_64 => Self::Donate,
            FFA_MEM_LEND_32 | FFA_MEM_LEND_64 => Self::Lend,
            FFA_MEM_SHARE_32 | FFA_MEM_SHARE_64 => Self::Share,
            _ => return None,
        };
        Some((kind, AbiWidth::of(fid)))
    }
}

/// Retrieve request function ID for a given width.
pub fn retrieve_fid(width: AbiWidth) -> u64 {
    match width {
        AbiWidth::W32 => FFA_MEM_RETRIEVE_REQ_32,
        AbiWidth::W64 => FFA_MEM_RETRIEVE_REQ_64,
    }
}

/// Human-readable name of a function ID, for log output.
pub fn fid_name(fid: u64) -> &'static str {
    match fid {
        FFA_ERROR => "FFA_ERROR",
        FFA_SUCCESS_32 => "FFA_SUCCESS_32",
        FFA_SUCCESS_64 => "FFA_SUCCESS_64",
        FFA_VERSION => "FFA_VERSION",
        FFA_FEATURES => "FFA_FEATURES",
        FFA_RX_RELEASE => "FFA_RX_RELEASE",
        FFA_RXTX_MAP_32 => "FFA_RXTX_MAP_32",
        FFA_RXTX_MAP_64 => "FFA_RXTX_MAP_64",
        FFA_RXTX_UNMAP => "FFA_RXTX_UNMAP",
        FFA_ID_GET => "FFA_ID_GET",
        FFA_MSG_SEND_DIRECT_REQ_32 => "FFA_MSG_SEND_DIRECT_REQ_32",
        FFA_MSG_SEND_DIRECT_REQ_64 => "FFA_MSG_SEND_DIRECT_REQ_64",
        FFA_MSG_SEND_DIRECT_RESP_32 => "FFA_MSG_SEND_DIRECT_RESP_32",
        FFA_MSG_SEND_DIRECT_RESP_64 => "FFA_MSG_SEND_DIRECT_RESP_64",
        FFA_MEM_DONATE_32 => "FFA_MEM_DONATE_32",
        FFA_MEM_DONATE_64 => "FFA_MEM_DONATE_64",
        FFA_MEM_LEND_32 => "FFA_MEM_LEND_32",
        FFA_MEM_LEND_64 => "FFA_MEM_LEND_64",
        FFA_MEM_SHARE_32 => "FFA_MEM_SHARE_32",
        FFA_MEM_SHARE_64 => "FFA_MEM_SHARE_64",
        FFA_MEM_RETRIEVE_REQ_32 => "FFA_MEM_RETRIEVE_REQ_32",
        FFA_MEM_RETRIEVE_REQ_64 => "FFA_MEM_RETRIEVE_REQ_64",
        FFA_MEM_RETRIEVE_RESP => "FFA_MEM_RETRIEVE_RESP",
        FFA_MEM_RELINQUISH => "FFA_MEM_RELINQUISH",
        FFA_MEM_RECLAIM => "FFA_MEM_RECLAIM",
        FFA_MEM_FRAG_RX => "FFA_MEM_FRAG_RX",
        FFA_MEM_FRAG_TX => "FFA_MEM_FRAG_TX",
        _ => "UNKNOWN",
    }
}
