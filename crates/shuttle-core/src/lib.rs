//! shuttle-core — key material, envelope codec, wire format and configuration.
//! The transfer crate and the daemon depend on this one.

pub mod config;
pub mod crypto;
pub mod wire;

pub use crypto::{CodecError, ContentDigest, KeyError, KeyMaterial};
pub use wire::{Command, Frame, FrameError, FrameKind, RecordType, TypedRecord};
