//! lanthrow: push a file or folder to a peer on the same LAN.
//!
//! The sender scans its target, announces a connect key and finds the
//! receiver with a UDP broadcast. Files then travel over N parallel TCP
//! connections; large files are cut into blocks and stitched back together
//! on the receiving side.

pub mod config;
pub mod discovery;
pub mod error;
pub mod locale;
pub mod logging;
pub mod streaming;
pub mod sync;
pub mod transport;
pub mod util;

pub use error::{Error, Result};
