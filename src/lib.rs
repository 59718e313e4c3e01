//! Push a configuration change to a fleet of Junos devices.
//!
//! # Program flow
//!
//! 1. The operator invokes the `confpush` binary with a list of routers, a configuration (one
//!    shared file, or a directory of per-device files), and the configuration's format.
//!
//! 2. [fleet::Fleet] walks the router list in order. For each router it resolves the
//!    configuration text and hands the device to a [runner::DeviceRunner].
//!
//! 3. The runner opens a [session::DeviceSession] and runs a [transaction::ConfigTransaction] on
//!    it: lock, load, diff, then roll back or commit, then unlock. The session is always closed
//!    afterwards.
//!
//! 4. Back in the fleet, [runner::failure_policy] decides whether a failure on one device should
//!    stop the whole run. Everything else moves on to the next device.
//!
//! Everything the workflow says goes through a [logger::Log] handle, which writes to standard
//! output and to a rotating log file.

pub mod config;
pub mod error;
pub mod fleet;
pub mod logger;
pub mod runner;
pub mod session;
pub mod transaction;

#[doc(inline)]
pub use fleet::{Fleet, PushPlan, RunSummary};
