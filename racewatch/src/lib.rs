//! Race observation probes and the interactive supervisor that manages them.
//!
//! The crate has two halves that share a discipline rather than code paths:
//!
//! - **[`probe`]**: a subprocess that flips a two-field value between `(0,0)`
//!   and `(1,1)` while a one-shot `SIGALRM` timer samples it. Each sample is
//!   classified into one of four outcomes; the torn ones (`01`, `10`) show the
//!   update is not atomic.
//! - **[`supervisor`]**: a single-threaded command loop that spawns, kills and
//!   signals probes. `SIGCHLD` reaping runs asynchronously and never touches the
//!   registry the loop owns.
//!
//! Signal handlers on both sides only touch `static` atomics. Everything that
//! allocates, formats or writes happens on the main execution context.

pub mod config;
pub mod console;
pub mod exit_codes;
pub mod logging;
pub mod probe;
pub mod supervisor;
pub mod terminal;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
