//! Core library for a union-style parity filesystem: N independent data
//! drives pooled under one mount point, covered by up to six parity drives
//! computed block-wise with Reed-Solomon over GF(2^8).
//!
//! This crate has no dependency on any kernel-filesystem binding crate — see
//! `fsops` for the adapter-facing contract a binding layer calls into, and
//! `control` for the live rebuild/scrub protocol. It never installs a global
//! logging subscriber of its own; it only emits through the `log` facade, so
//! it composes inside any host binary.

pub mod alloc;
pub mod codec;
pub mod config;
pub mod control;
pub mod core;
pub mod error;
pub mod fsops;
pub mod gf256;
pub mod journal;
pub mod parity;
pub mod state;

pub use config::Config;
pub use core::Core;
pub use error::{Error, Result};
