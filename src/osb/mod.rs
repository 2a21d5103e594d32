//! Open Service Broker client and the interceptors driving broker operations.

pub mod binding;
pub mod client;
pub mod context;
pub mod driver;
pub mod instance;
pub mod orphan;
pub mod poller;
pub mod types;

pub use binding::*;
pub use client::*;
pub use driver::{DriverContext, OsbSettings};
pub use instance::*;
pub use orphan::*;
pub use poller::{poll_operation, PollOutcome, PollRequest};
