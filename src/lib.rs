//! A thin, typed wrapper over the Linux io_uring submission/completion ring.
//!
//! [`Ring`] pairs an `io_uring` instance with a fixed-capacity slot table so
//! that every in-flight operation is identified by a small packed id carried
//! through the kernel's opaque `user_data` field. Submitting an operation
//! stores the caller's token (plus any memory the kernel must keep reading,
//! such as a path or a socket address) in a slot; reaping a completion
//! releases the slot and hands the token back next to the kernel's result.
//!
//! The ring is single-owner: nothing here is synchronized, and one logical
//! caller drives submission, [`Ring::submit`], [`Ring::peek`] and
//! [`Ring::wait`]. Submission never blocks and signals back-pressure by
//! returning `None`; the caller reaps a completion and retries.
//!
//! ```no_run
//! use ringlet::Ring;
//!
//! # fn main() -> Result<(), ringlet::RingError> {
//! let mut ring: Ring<&str> = Ring::new(8)?;
//! ring.noop("hello").expect("queue just created");
//! ring.submit()?;
//! let done = ring.wait(None)?.expect("one op in flight");
//! assert_eq!((done.token, done.result), ("hello", 0));
//! # Ok(())
//! # }
//! ```

pub mod ring;
pub mod slots;

mod addr;
mod errors;
mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use addr::SockAddr;
pub use errors::{error_of_errno, RingError};
pub use ring::{Builder, Completion, Job, Ring};
pub use slots::{SlotError, SlotId, SlotTable};
pub use types::Access;

// One flag vocabulary for callers and this crate alike; values match the
// host kernel's constants.
pub use nix::fcntl::{OFlag, ResolveFlag};
pub use nix::poll::PollFlags;
pub use nix::sys::stat::Mode;
