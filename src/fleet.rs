//! Pushes one configuration change to a list of devices, one device at a time.
//!
//! For each target, in the order given, [Fleet::run] resolves the configuration source, hands
//! the device to a [DeviceRunner], and then decides whether to carry on. Only a configuration
//! failure that [failure_policy] says is likely to repeat on every device stops the run early.

use crate::config::{ConfigFormat, Credentials, RunOptions};
use crate::error::{ConfigFailure, FleetError};
use crate::logger::Log;
use crate::runner::{failure_policy, DeviceOutcome, DeviceRunner, FailureKind, FailurePolicy};
use crate::session::Connect;
use crate::transaction::CommitPolicy;
use anyhow::Context;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The extension of per-device configuration files.
pub const PER_DEVICE_EXTENSION: &str = "conf";

/// A configuration ready to send to one device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigSource {
    /// Where the text came from.
    pub path: PathBuf,
    pub text: String,
    pub format: ConfigFormat,
}

/// Reads configuration sources and target lists.
pub trait SourceStore {
    fn read(&self, path: &Path) -> io::Result<String>;
}

/// A [SourceStore] backed by the local file system.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileStore;

impl SourceStore for FileStore {
    fn read(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }
}

/// Splits a target list into hosts, one per line.
///
/// Lines are taken verbatim: no trimming, no deduplication, and blank lines are kept (they fail
/// at connect time like any other unknown host).
pub fn parse_targets(text: &str) -> Vec<String> {
    text.lines().map(str::to_owned).collect()
}

/// Reads and parses the target list at `path`.
pub fn read_targets(store: &impl SourceStore, path: &Path) -> anyhow::Result<Vec<String>> {
    let text = store
        .read(path)
        .with_context(|| format!("failed to read the router list {}", path.display()))?;
    Ok(parse_targets(&text))
}

/// What to push, and how.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushPlan {
    /// The shared configuration file, or with [RunOptions::per_device_config] the directory
    /// holding one `<host>.conf` per device.
    pub config_path: PathBuf,
    pub format: ConfigFormat,
    pub options: RunOptions,
    pub policy: CommitPolicy,
}

impl PushPlan {
    pub fn new(
        config_path: impl Into<PathBuf>,
        format: ConfigFormat,
        options: RunOptions,
        full_timeout: Duration,
    ) -> Self {
        PushPlan {
            config_path: config_path.into(),
            format,
            options,
            policy: CommitPolicy::new(&options, full_timeout),
        }
    }

    /// Where `host`'s configuration lives.
    pub fn source_path(&self, host: &str) -> PathBuf {
        match self.options.per_device_config {
            true => self
                .config_path
                .join(format!("{host}.{PER_DEVICE_EXTENSION}")),
            false => self.config_path.clone(),
        }
    }
}

/// Per-device outcomes of a run, in the order the devices were processed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    outcomes: Vec<(String, DeviceOutcome)>,
}

impl RunSummary {
    pub fn push(&mut self, host: impl Into<String>, outcome: DeviceOutcome) {
        self.outcomes.push((host.into(), outcome));
    }

    pub fn outcomes(&self) -> &[(String, DeviceOutcome)] {
        &self.outcomes
    }

    /// The outcome for `host`. If a host appears more than once, the first one.
    pub fn get(&self, host: &str) -> Option<&DeviceOutcome> {
        self.outcomes
            .iter()
            .find(|(h, _)| h == host)
            .map(|(_, outcome)| outcome)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn committed(&self) -> usize {
        self.count(DeviceOutcome::is_committed)
    }

    pub fn rolled_back(&self) -> usize {
        self.count(DeviceOutcome::is_rolled_back)
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, DeviceOutcome::Skip(_) | DeviceOutcome::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, DeviceOutcome::Failed(_) | DeviceOutcome::Aborted(_)))
    }

    fn count(&self, predicate: impl Fn(&DeviceOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| predicate(o)).count()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Finished: {} device(s); {} committed, {} rolled back, {} skipped, {} failed",
            self.len(),
            self.committed(),
            self.rolled_back(),
            self.skipped(),
            self.failed(),
        )
    }
}

/// Drives a [PushPlan] across a list of targets.
pub struct Fleet<C: Connect, S: SourceStore> {
    connector: C,
    store: S,
    credentials: Credentials,
    plan: PushPlan,
    log: Log,
}

impl<C: Connect, S: SourceStore> Fleet<C, S> {
    pub fn new(connector: C, store: S, credentials: Credentials, plan: PushPlan, log: Log) -> Self {
        Fleet {
            connector,
            store,
            credentials,
            plan,
            log,
        }
    }

    pub fn plan(&self) -> &PushPlan {
        &self.plan
    }

    /// Pushes the plan to every target in order.
    ///
    /// # Errors
    ///
    /// [FleetError::Aborted] if a shared configuration couldn't be read or was rejected, and the
    /// run wasn't forced to continue. Targets after the failing one are never attempted.
    pub async fn run(&mut self, targets: &[String]) -> Result<RunSummary, FleetError> {
        let mut summary = RunSummary::default();

        for (index, host) in targets.iter().enumerate() {
            let path = self.plan.source_path(host);
            self.log.separator('=');
            self.log
                .notice(format!("Pushing {} to {host}", path.display()));

            let outcome = match self.read_source(path) {
                Ok(source) => {
                    let mut runner = DeviceRunner::new(
                        &mut self.connector,
                        &self.credentials,
                        self.plan.options,
                        self.plan.policy,
                        self.log.clone(),
                    );
                    runner.run(host, &source).await
                }
                Err(failure) => self.unreadable(host, failure),
            };

            if outcome.was_connected() {
                self.log.notice(format!("Disconnected from {host}"));
            }

            if let DeviceOutcome::Aborted(reason) = &outcome {
                let reason = reason.clone();
                summary.push(host.as_str(), outcome);
                self.log.fatal(
                    "As an error was detected in config application, the assumption is this \
                     will happen on multiple devices so exiting. To change this behaviour use '-f'",
                );
                self.log.notice(&summary);
                return Err(FleetError::Aborted {
                    host: host.clone(),
                    reason,
                    remaining: targets.len() - index - 1,
                    summary,
                });
            }
            summary.push(host.as_str(), outcome);
        }

        self.log.separator('=');
        self.log.notice(&summary);
        Ok(summary)
    }

    fn read_source(&self, path: PathBuf) -> Result<ConfigSource, ConfigFailure> {
        match self.store.read(&path) {
            Ok(text) => Ok(ConfigSource {
                path,
                text,
                format: self.plan.format,
            }),
            Err(error) => Err(ConfigFailure::Unreadable {
                path,
                message: error.to_string(),
            }),
        }
    }

    fn unreadable(&self, host: &str, failure: ConfigFailure) -> DeviceOutcome {
        self.log.error(format!("{host}: {failure}"));
        let options = &self.plan.options;
        match failure_policy(
            options.per_device_config,
            options.force_continue,
            FailureKind::Source,
        ) {
            FailurePolicy::Abort => DeviceOutcome::Aborted(failure),
            FailurePolicy::Skip => {
                self.log.notice(format!(
                    "Skipping {host} and moving onto the next router in the list"
                ));
                DeviceOutcome::Skipped(failure)
            }
        }
    }
}
