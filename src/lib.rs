//! Live-system mirror backups onto removable drives.
//!
//! The engine lives in [`core`]: a directory synchronizer with `rsync
//! --delete` semantics, a cheap progress estimator, drive discovery and
//! mounting, and a sampling verifier. Platform specifics sit behind
//! [`core::hardware::DriveAdapter`] in [`adapters`].

pub mod adapters;
pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod lock;
pub mod logging;

pub use error::{Error, Result};
