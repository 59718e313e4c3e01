//! Drives one device through the whole workflow: open a session, run a [ConfigTransaction],
//! close the session.
//!
//! # States
//!
//! ```text
//! Idle -> Connecting -> Skip                                   (open failed)
//!                    -> Connected -> Transacting -> Settled    (committed or rolled back)
//!                                                -> Skipped    (load failed, run continues)
//!                                                -> Aborted    (load failed, run must stop)
//!                                                -> Failed     (lock, diff, commit, ... failed)
//!                                                -> Closed
//! ```
//!
//! Every state after `Connected` closes the session before [DeviceRunner::run] returns. The
//! terminal state comes back to the caller as a [DeviceOutcome].

use crate::config::{Credentials, RunOptions};
use crate::error::{ConfigFailure, ConnectionError, TransactionError};
use crate::fleet::ConfigSource;
use crate::logger::Log;
use crate::session::{Connect, DeviceSession};
use crate::transaction::{CommitPolicy, ConfigTransaction, Disposition, RollbackReason};

/// The kinds of failure that [failure_policy] distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// The configuration source couldn't be read.
    Source,

    /// The device rejected the configuration.
    Load,

    /// The configuration lock was held elsewhere.
    Lock,

    /// Some other call on the session failed.
    Rpc,
}

/// What the run should do after a device fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop the whole run. No further devices are attempted.
    Abort,

    /// Move on to the next device.
    Skip,
}

/// Decides whether a failure on one device should stop the whole run.
///
/// A configuration shared by every device that fails to read or load on one of them will most
/// likely fail the same way on the rest, so the run stops, unless the operator forced it to
/// continue. Per-device configurations only implicate their own device. Failures that don't
/// involve the configuration (a held lock, a broken session) never stop the run.
pub fn failure_policy(
    per_device_config: bool,
    force_continue: bool,
    failure: FailureKind,
) -> FailurePolicy {
    match failure {
        FailureKind::Source | FailureKind::Load if !per_device_config && !force_continue => {
            FailurePolicy::Abort
        }
        _ => FailurePolicy::Skip,
    }
}

/// How one device's run ended.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceOutcome {
    /// The session couldn't be opened. Nothing was attempted.
    Skip(ConnectionError),

    /// The configuration couldn't be read or loaded; the run continues.
    Skipped(ConfigFailure),

    /// The configuration couldn't be read or loaded, and the run must stop.
    Aborted(ConfigFailure),

    /// The transaction ran to completion.
    Settled(Disposition),

    /// The transaction hit an error unrelated to the configuration's content.
    Failed(TransactionError),
}

impl DeviceOutcome {
    /// Whether a session was opened (and has since been closed) for this device.
    pub fn was_connected(&self) -> bool {
        match self {
            DeviceOutcome::Skip(_) => false,
            DeviceOutcome::Skipped(failure) | DeviceOutcome::Aborted(failure) => {
                matches!(failure, ConfigFailure::Rejected(_))
            }
            DeviceOutcome::Settled(_) | DeviceOutcome::Failed(_) => true,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, DeviceOutcome::Settled(Disposition::Committed(_)))
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self, DeviceOutcome::Settled(Disposition::RolledBack(_)))
    }

    /// A one-line, human-readable description.
    pub fn summary(&self) -> String {
        use DeviceOutcome::*;
        match self {
            Skip(error) => format!("skipped, could not connect: {error}"),
            Skipped(failure) => format!("skipped: {failure}"),
            Aborted(failure) => format!("aborted the run: {failure}"),
            Settled(Disposition::Committed(_)) => "committed".into(),
            Settled(Disposition::RolledBack(RollbackReason::TestRun)) => {
                "rolled back (test run)".into()
            }
            Settled(Disposition::RolledBack(RollbackReason::NoChanges)) => {
                "rolled back (no changes)".into()
            }
            Settled(Disposition::RolledBack(RollbackReason::CommitCheckFailed(error))) => {
                format!("rolled back (commit check failed: {error})")
            }
            Failed(error) => format!("failed: {error}"),
        }
    }
}

/// Runs the workflow against one device at a time.
pub struct DeviceRunner<'a, C: Connect> {
    connector: &'a mut C,
    credentials: &'a Credentials,
    options: RunOptions,
    policy: CommitPolicy,
    log: Log,
}

impl<'a, C: Connect> DeviceRunner<'a, C> {
    pub fn new(
        connector: &'a mut C,
        credentials: &'a Credentials,
        options: RunOptions,
        policy: CommitPolicy,
        log: Log,
    ) -> Self {
        DeviceRunner {
            connector,
            credentials,
            options,
            policy,
            log,
        }
    }

    /// Pushes `source` to `host`.
    ///
    /// Never returns with the device's session still open.
    pub async fn run(&mut self, host: &str, source: &ConfigSource) -> DeviceOutcome {
        let mut session = match self.connector.open(host, self.credentials).await {
            Ok(session) => session,
            Err(error) => {
                self.log.error(&error);
                self.log.notice(format!(
                    "Skipping {host} and moving onto the next router in the list"
                ));
                return DeviceOutcome::Skip(error);
            }
        };

        let facts = session.facts();
        self.log.notice(format!(
            "Connected to '{host}'. Device hostname: '{}'. Software version: '{}'",
            facts.hostname, facts.version,
        ));
        self.log.separator('-');

        let result = ConfigTransaction::run(
            &mut session,
            self.log.clone(),
            &source.text,
            source.format,
            &self.policy,
        )
        .await;
        let outcome = self.outcome(host, result);

        if let Err(error) = session.close().await {
            self.log
                .warning(format!("{host}: the session did not close cleanly: {error}"));
        }
        outcome
    }

    fn outcome(&self, host: &str, result: Result<Disposition, TransactionError>) -> DeviceOutcome {
        let error = match result {
            Ok(disposition) => return DeviceOutcome::Settled(disposition),
            Err(error) => error,
        };

        let kind = match error {
            TransactionError::Load(_) => FailureKind::Load,
            TransactionError::Lock(_) => FailureKind::Lock,
            TransactionError::Rpc { .. } => FailureKind::Rpc,
        };
        let policy = failure_policy(
            self.options.per_device_config,
            self.options.force_continue,
            kind,
        );

        match (error, policy) {
            (TransactionError::Load(source), FailurePolicy::Abort) => {
                DeviceOutcome::Aborted(ConfigFailure::Rejected(source))
            }
            (TransactionError::Load(source), FailurePolicy::Skip) => {
                DeviceOutcome::Skipped(ConfigFailure::Rejected(source))
            }
            (error, _) => {
                self.log
                    .error(format!("{host}: {error}; giving up on this device"));
                DeviceOutcome::Failed(error)
            }
        }
    }
}
