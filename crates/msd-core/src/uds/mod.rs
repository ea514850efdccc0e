//! Diagnostic client: the ISO 14229 subset needed for flashing.

mod client;
mod constants;
mod response;
mod security;

pub use client::{DiagClient, DiagError, DiagTiming, SessionState, TESTER_PRESENT_INTERVAL};
pub use constants::{
    MAX_TRANSFER_PAYLOAD, Nrc, ROUTINE_CHECKSUM, ROUTINE_ERASE, SID_REQUEST_DOWNLOAD,
    SID_ROUTINE_CONTROL, SID_SECURITY_ACCESS, SID_TRANSFER_DATA,
};
pub use response::UdsReply;
pub use security::{SeedKeyAlgorithm, Unlock, UnlockPolicy, default_algorithm_order};
