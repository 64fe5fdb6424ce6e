//! Blocking POSIX file layer for the QuiverMQ node.
//!
//! Everything here assumes the single-threaded cooperative model of the
//! engine: calls block the caller for the duration of the syscall, retry on
//! `EINTR`, and report failures with the file name and operation attached.

pub mod data;
pub mod posix;
pub mod signal;

pub use data::{DataFile, HEAD_TRUNCATION_CHUNK};
pub use posix::PosixFile;
pub use signal::with_signals_blocked;
