//! Pure text-transform logic: patch application and diff computation.
//!
//! Nothing in here knows about sessions, sockets, or storage.

pub mod diff;
pub mod patch;

pub use diff::{diff, DiffOp};
pub use patch::{apply, PatchBatch, PatchError};
