//! # Crate to pilot Parrot minidrones over Bluetooth Low Energy
//!
//! This crate implements the piloting, telemetry and media transfer
//! protocol of the Parrot minidrone family. It drives the vehicle over an
//! already established BLE connection and keeps a local mirror of the
//! state the vehicle reports back.
//!
//! The supported vehicles are:
//! - Rolling Spider
//! - Airborne Cargo (Mars and Travis)
//! - Airborne Night (Blaze, SWAT and Maclane)
//!
//! # Protocol architecture
//!
//! The vehicle exposes everything as GATT characteristics under three
//! services. Commands and piloting input are written to one set of
//! characteristics, state comes back as notifications on another, and a
//! small FTP-like exchange on a third pair gives access to the picture
//! store.
//!
//! Piloting is time driven: the vehicle holds its attitude only while
//! parameter frames keep arriving, so a background task writes one frame
//! every 25 ms and motion calls only queue input for it. Every other
//! command is a single frame written with response.
//!
//! Scanning, pairing and connecting are left to the platform BLE stack:
//! implement [`BleAdapter`] on top of it and hand the connected
//! peripheral to [`Minidrone::connect`].
//!
//! See the demos in the repository for how to use this crate.

#![deny(missing_docs)]

mod commands;
mod dispatch;
mod drive;
mod error;
pub mod frame;
mod ftp;
pub mod gatt;
mod minidrone;
mod sequence;
pub mod telemetry;
#[cfg(test)]
mod testutil;

pub use commands::{FlipDirection, HeadlightAnimation};
pub use drive::DriveParameter;
pub use error::{Error, Result};
pub use frame::{Frame, FrameType};
pub use gatt::BleAdapter;
pub use minidrone::{Minidrone, MinidroneBuilder};
