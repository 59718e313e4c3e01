//! The interface between the push workflow and a device's management session. Does not contain a
//! network implementation; see [mod@netconf], and the ssh transports under it: [mod@openssh] (the
//! `openssh` feature) for key and agent logins, [mod@native] (the `native` feature) when there's a
//! password.
//!
//! A [Connect] implementation opens sessions. Each session it returns is a [DeviceSession], which
//! exposes the device's identity facts and the primitive configuration calls that
//! [ConfigTransaction] sequences. The workflow code never talks to the network directly, so tests
//! can substitute a fake.
//!
//! [ConfigTransaction]: crate::transaction::ConfigTransaction

#[cfg(feature = "native")]
pub mod native;
pub mod netconf;
#[cfg(feature = "openssh")]
pub mod openssh;

#[cfg(test)]
pub mod fixtures;

use crate::config::{ConfigFormat, Credentials};
use crate::error::{ConnectionError, RpcError};
use async_trait::async_trait;
use std::time::Duration;

/// Who the device says it is, as reported once the session is open.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Facts {
    pub hostname: String,
    pub version: String,
}

/// How to commit a staged change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitMode {
    /// An ordinary commit, subject to the session's default timeout.
    Standard,

    /// A full (non-incremental) commit. These can take much longer, so they carry their own
    /// timeout.
    Full { timeout: Duration },
}

/// Opens sessions to devices.
#[async_trait]
pub trait Connect {
    type Session: DeviceSession;

    /// Connect and authenticate to `host`. On failure, nothing is left open.
    async fn open(
        &mut self,
        host: &str,
        credentials: &Credentials,
    ) -> Result<Self::Session, ConnectionError>;
}

/// An open management session to exactly one device.
///
/// Methods map one-to-one onto remote calls and do no sequencing of their own. Ordering and
/// cleanup are [ConfigTransaction]'s job.
///
/// [ConfigTransaction]: crate::transaction::ConfigTransaction
#[async_trait]
pub trait DeviceSession: Send {
    /// The host identifier this session was opened with.
    fn host(&self) -> &str;

    fn facts(&self) -> &Facts;

    /// Takes the exclusive configuration lock.
    async fn lock(&mut self) -> Result<(), RpcError>;

    /// Stages `text` in the candidate configuration.
    async fn load(&mut self, text: &str, format: ConfigFormat) -> Result<(), RpcError>;

    /// Compares the candidate with the active configuration. `None` means no effective change.
    async fn diff(&mut self) -> Result<Option<String>, RpcError>;

    /// Validates the candidate without applying it.
    async fn commit_check(&mut self) -> Result<(), RpcError>;

    async fn commit(&mut self, mode: CommitMode) -> Result<(), RpcError>;

    /// Discards the candidate, returning it to the active configuration.
    async fn rollback(&mut self) -> Result<(), RpcError>;

    async fn unlock(&mut self) -> Result<(), RpcError>;

    /// Ends the session. Consumes it, so it can't be closed twice.
    async fn close(self) -> Result<(), RpcError>;
}
