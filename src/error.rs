//! Typed failures for every stage of a configuration push.
//!
//! Expected outcomes (a device that can't be reached, a configuration the device rejects) are
//! ordinary values here, not panics. Callers branch on the variants to decide whether to skip a
//! device or abort the run; see [crate::runner::failure_policy].

use crate::fleet::RunSummary;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The device could not be opened. The device is skipped; the run continues.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConnectionError {
    #[error("timed out connecting to {host}")]
    Timeout { host: String },

    #[error("connection to {host} was refused")]
    Refused { host: String },

    #[error("authentication to {host} failed: {message}")]
    Auth { host: String, message: String },

    #[error("unknown host: {host}")]
    UnknownHost { host: String },

    /// The device accepted the connection but reported an error while setting up the session,
    /// e.g. a configuration database it could not load.
    #[error("{host} rejected the session: {message}")]
    Rejected { host: String, message: String },

    #[error("could not connect to {host}: {message}")]
    Transport { host: String, message: String },
}

impl ConnectionError {
    /// Sorts an ssh failure into a variant by looking at the ssh client's diagnostics.
    pub fn classify(host: &str, message: &str) -> Self {
        let host = host.to_owned();
        let lower = message.to_lowercase();
        if lower.contains("timed out") || lower.contains("timeout") {
            ConnectionError::Timeout { host }
        } else if lower.contains("connection refused") {
            ConnectionError::Refused { host }
        } else if lower.contains("could not resolve hostname")
            || lower.contains("name or service not known")
            || lower.contains("nodename nor servname")
            || lower.contains("failed to lookup address")
        {
            ConnectionError::UnknownHost { host }
        } else if lower.contains("permission denied") || lower.contains("authentication") {
            ConnectionError::Auth {
                host,
                message: message.trim().to_owned(),
            }
        } else {
            ConnectionError::Transport {
                host,
                message: message.trim().to_owned(),
            }
        }
    }

    /// The host this error refers to.
    pub fn host(&self) -> &str {
        use ConnectionError::*;
        match self {
            Timeout { host }
            | Refused { host }
            | Auth { host, .. }
            | UnknownHost { host }
            | Rejected { host, .. }
            | Transport { host, .. } => host,
        }
    }
}

/// A single remote procedure call on an open session failed.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RpcError {
    /// The device answered with one or more errors.
    #[error("{0}")]
    Remote(String),

    /// No reply arrived within the allotted time.
    #[error("no reply within {}s", .0.as_secs())]
    Timeout(Duration),

    /// The session broke, or the reply could not be understood.
    #[error("transport error: {0}")]
    Transport(String),
}

/// The step of a [crate::transaction::ConfigTransaction] at which something went wrong.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Lock,
    Load,
    Diff,
    CommitCheck,
    Commit,
    Rollback,
    Unlock,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Stage::*;
        let name = match self {
            Lock => "lock",
            Load => "load",
            Diff => "diff",
            CommitCheck => "commit check",
            Commit => "commit",
            Rollback => "rollback",
            Unlock => "unlock",
        };
        f.write_str(name)
    }
}

/// A configuration transaction could not run to its disposition.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum TransactionError {
    /// Someone else holds the configuration lock. Nothing was staged.
    #[error("could not lock the configuration: {0}")]
    Lock(RpcError),

    /// The device rejected the configuration. It has already been rolled back and unlocked.
    #[error("could not load the configuration: {0}")]
    Load(RpcError),

    /// Any other call failed. Fatal for this device only.
    #[error("{stage} failed: {source}")]
    Rpc { stage: Stage, source: RpcError },
}

impl TransactionError {
    pub fn stage(&self) -> Stage {
        match self {
            TransactionError::Lock(_) => Stage::Lock,
            TransactionError::Load(_) => Stage::Load,
            TransactionError::Rpc { stage, .. } => *stage,
        }
    }
}

/// The configuration itself is suspect: it couldn't be read, or the device refused it.
///
/// Unlike other failures, these may affect every device that shares the same configuration.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigFailure {
    #[error("could not read {}: {message}", path.display())]
    Unreadable { path: PathBuf, message: String },

    /// The device rejected the configuration. The change was rolled back and unlocked.
    #[error("could not load the configuration: {0}")]
    Rejected(RpcError),
}

/// Errors that end a whole run.
#[derive(Debug, Error)]
pub enum FleetError {
    /// A shared configuration failed on `host`. Every remaining target was left untouched.
    #[error("aborted at {host} ({reason}); {remaining} target(s) not attempted")]
    Aborted {
        host: String,
        reason: ConfigFailure,
        remaining: usize,

        /// What happened to the devices processed before the abort, and to `host` itself.
        summary: RunSummary,
    },
}

#[cfg(test)]
mod test;
