//! shuttle-transfer — device-to-device snapshot transfer over the local network.
//!
//! The sending device runs a `TransferServer`; the receiving device runs a
//! `TransferClient`. Both speak the framed protocol from `shuttle_core::wire`
//! over one TCP connection and publish their progress as a `TransferState`.

pub mod channel;
pub mod client;
pub mod error;
pub mod flow;
pub mod server;
pub mod setup;
pub mod source;
pub mod speed;
pub mod state;

pub use client::TransferClient;
pub use error::TransferError;
pub use flow::{Admission, SpeedConditioner};
pub use server::TransferServer;
pub use source::{PairingCredentials, TransferItem, TransferSink, TransferSource};
pub use speed::{SpeedTester, Throughput};
pub use state::{FailureReason, Fault, SessionState, TransferState};
