//! FF-A v1.1 memory management conformance validator.
//!
//! Drives DONATE/LEND/SHARE, RETRIEVE, RELINQUISH and RECLAIM against a
//! relayer between two endpoints, injects single-field errors into
//! descriptors and checks the exact error code the relayer answers with.

pub mod config;
pub mod ffa;
pub mod mm;
pub mod status;
pub mod stub;
pub mod suite;
