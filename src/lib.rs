#![cfg_attr(docsrs, feature(doc_cfg))]
//! # battgo_lib
//!
//! This crate provides a host-side controller for the BattGO single-wire,
//! half-duplex battery bus. The controller is the sole bus master: it
//! discovers smart battery packs, assigns them bus addresses, polls each one
//! for telemetry, decodes the packed binary records into engineering units
//! and can write configuration records back.
//!
//! The [`phy`] module owns the byte stream (framing, checksum, scrambling,
//! break signalling), the [`controller`] module owns the bus (enumeration,
//! addressing, polling, request/response matching) and the [`battery`]
//! module implements the battery device profile on top of both.
//!
//! ## Features
//!
//! This crate uses a feature-based system to keep dependencies minimal.
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling
//!   the `battgo` monitor binary.
//!
//! ### Client Features
//! - `serialport`: Enables the [`serialport`] module, backed by the
//!   `serialport` crate. Without it, bring your own
//!   [`phy::SerialLink`] implementation.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for the battery snapshot types.
//! - `bin-dependencies`: Enables all features required by the `battgo`
//!   binary executable.

/// Contains error types for the library.
mod error;
mod slot;
#[cfg(test)]
mod testutil;

/// Battery pack driver and snapshot types.
pub mod battery;
/// Bus controller: enumeration, addressing and the polling loop.
pub mod controller;
/// Bus device handles and the driver interface.
pub mod device;
/// Framing, scrambling and break signalling.
pub mod phy;

pub use error::Error;

/// Serial port glue for the PHY.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;
