//! Test failure taxonomy and first-error retention.
//!
//! Every check in a test carries a numeric point so a failure names the
//! exact rule that was violated. [`Status`] keeps the first failure of a
//! test; anything recorded after it (typically a cleanup step failing on
//! the way out) is logged and dropped.

use core::fmt;

use log::error;
use thiserror::Error;

use crate::ffa::channel::ChannelError;
use crate::ffa::descriptors::BuildError;
use crate::ffa::mailbox::MailboxError;
use crate::ffa::{fid_name, FfaArgs, FfaError};
use crate::mm::MmError;

/// What a check expects the relayer to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// `FFA_SUCCESS_32` or `FFA_SUCCESS_64`
    Success,
    /// A specific non-error response, e.g. `FFA_MEM_RETRIEVE_RESP`
    Response(u64),
    /// `FFA_ERROR` with exactly this code
    Error(FfaError),
    /// `FFA_ERROR` with any code
    AnyError,
}

impl Expect {
    pub fn matches(&self, ret: &FfaArgs) -> bool {
        match *self {
            Self::Success => ret.is_success(),
            Self::Response(fid) => ret.fid == fid,
            Self::Error(code) => ret.error_code() == Some(code),
            Self::AnyError => ret.is_error(),
        }
    }

    pub fn expects_error(&self) -> bool {
        matches!(self, Self::Error(_) | Self::AnyError)
    }
}

impl fmt::Display for Expect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "FFA_SUCCESS"),
            Self::Response(fid) => write!(f, "{}", fid_name(*fid)),
            Self::Error(code) => write!(f, "FFA_ERROR({})", code),
            Self::AnyError => write!(f, "FFA_ERROR(any)"),
        }
    }
}

/// What the relayer actually answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Error(FfaError),
    UnknownError(i32),
    Response(u64),
}

impl From<&FfaArgs> for Outcome {
    fn from(ret: &FfaArgs) -> Self {
        match ret.error_code() {
            Some(code) => Self::Error(code),
            None if ret.is_error() => Self::UnknownError(ret.raw_error()),
            None => Self::Response(ret.fid),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(code) => write!(f, "FFA_ERROR({})", code),
            Self::UnknownError(raw) => write!(f, "FFA_ERROR({})", raw),
            Self::Response(fid) => write!(f, "{}", fid_name(*fid)),
        }
    }
}

#[derive(Debug, Error)]
pub enum Failure {
    // Resource errors
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Memory(#[from] MmError),
    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    // Protocol violations
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("protocol violation: expected {expected}, got {}", fid_name(*.got))]
    Protocol { expected: Expect, got: u64 },
    #[error("handoff names {}, which is not a memory transfer", fid_name(*.0))]
    Handoff(u64),
    #[error("malformed response descriptor: {0}")]
    Malformed(FfaError),
    #[error("transaction is {state}, cannot {op}")]
    InvalidTransition { state: &'static str, op: &'static str },

    // Conformance mismatches
    #[error("{rule}: expected {expected}, relayer returned {got}")]
    Mismatch {
        rule: &'static str,
        expected: Expect,
        got: Outcome,
    },
    #[error("{0}")]
    Check(String),
    #[error("{0} page(s) still allocated after the test")]
    Leak(u64),
}

impl Failure {
    /// Protocol and resource failures end the test; conformance mismatches
    /// let independent checks that follow still run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Mismatch { .. } | Self::Check(_))
    }

    /// Compare a response against what `rule` expects.
    ///
    /// A non-error response other than the expected one is a protocol
    /// violation when a specific success was expected, and a conformance
    /// mismatch when an error was.
    pub fn check(rule: &'static str, ret: &FfaArgs, expected: Expect) -> Result<(), Failure> {
        if expected.matches(ret) {
            return Ok(());
        }
        if !ret.is_error() && !expected.expects_error() {
            return Err(Self::Protocol {
                expected,
                got: ret.fid,
            });
        }
        Err(Self::Mismatch {
            rule,
            expected,
            got: Outcome::from(ret),
        })
    }
}

/// A failure tagged with the check point that raised it.
#[derive(Debug, Error)]
#[error("error point {point}: {failure}")]
pub struct CheckError {
    pub point: u32,
    #[source]
    pub failure: Failure,
}

pub trait AtPoint<T> {
    fn at(self, point: u32) -> Result<T, CheckError>;
}

impl<T, E: Into<Failure>> AtPoint<T> for Result<T, E> {
    fn at(self, point: u32) -> Result<T, CheckError> {
        self.map_err(|e| CheckError {
            point,
            failure: e.into(),
        })
    }
}

impl Failure {
    pub fn at(self, point: u32) -> CheckError {
        CheckError {
            point,
            failure: self,
        }
    }
}

/// First-error-wins accumulator.
#[derive(Debug, Default)]
pub struct Status {
    first: Option<CheckError>,
}

impl Status {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, err: CheckError) {
        if self.first.is_none() {
            error!("{}", err);
            self.first = Some(err);
        } else {
            error!("{} (suppressed)", err);
        }
    }

    /// Record the error of `result`, if any, and pass the value through.
    pub fn check<T>(&mut self, result: Result<T, CheckError>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.record(e);
                None
            }
        }
    }

    pub fn is_ok(&self) -> bool {
        self.first.is_none()
    }

    pub fn first(&self) -> Option<&CheckError> {
        self.first.as_ref()
    }

    pub fn into_result(self) -> Result<(), CheckError> {
        match self.first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
