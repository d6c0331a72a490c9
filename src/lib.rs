// src/lib.rs
//! evdi-vnc library crate.
//!
//! Exports a kernel-emulated virtual display as a remote screen: the
//! device seam receives mode changes and pixel updates, the bridge loop
//! reconciles them with the viewer transport, and only the rectangles that
//! actually changed travel to viewers.
//!
//! This exposes the internal modules for testing and library usage; the
//! binary in `main.rs` only wires them together.

pub mod bridge;
pub mod clients;
pub mod config;
pub mod damage;
pub mod device;
pub mod os;
pub mod screen;
pub mod transport;
