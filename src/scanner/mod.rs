//! Client side of admission: what a door device does with each scan.

pub mod client;
pub mod feedback;
pub mod retry;
pub mod session;

pub use client::{AdmissionClient, HttpAdmissionClient, ScanError};
pub use feedback::{AlreadyUsedPolicy, IgnoreReason, ScanFeedback, Signal, ALREADY_USED_WELCOME};
pub use retry::RetryPolicy;
pub use session::{ScanSession, ScanSessionConfig};
