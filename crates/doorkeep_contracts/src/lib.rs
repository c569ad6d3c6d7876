#![forbid(unsafe_code)]

pub mod access;
pub mod common;
pub mod dashboard;
pub mod identity;

pub use common::{ContractViolation, UnixTimeNs, Validate};
