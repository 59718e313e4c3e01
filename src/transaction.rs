//! One staged configuration change on one open session.
//!
//! The calls always happen in the same order: lock, load, diff, then a disposition (roll back or
//! commit), then unlock. Once the lock is held, it is released on every path out, including
//! failures, and a change that failed partway is rolled back before the lock goes. The only way
//! out with the lock never taken is a failed [ConfigTransaction::lock], in which case there is
//! nothing to release.

use crate::config::{ConfigFormat, RunOptions};
use crate::error::{RpcError, Stage, TransactionError};
use crate::logger::Log;
use crate::session::{CommitMode, DeviceSession};
use std::time::Duration;

/// Where a [ConfigTransaction] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Unlocked,
    Locked,
    Loaded,
    Diffed,
    Committed,
    RolledBack,
}

/// Why a staged change was thrown away instead of committed.
#[derive(Clone, Debug, PartialEq)]
pub enum RollbackReason {
    /// Test runs never commit.
    TestRun,

    /// The candidate matched the active configuration.
    NoChanges,

    /// The device refused the change on a dry run.
    CommitCheckFailed(RpcError),
}

/// How a transaction that ran to completion ended.
#[derive(Clone, Debug, PartialEq)]
pub enum Disposition {
    Committed(CommitMode),
    RolledBack(RollbackReason),
}

/// The parts of a run that decide what happens after the diff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitPolicy {
    pub test_run: bool,
    pub commit_full: bool,

    /// How long a full commit may take.
    pub full_timeout: Duration,
}

impl CommitPolicy {
    pub const DEFAULT_FULL_TIMEOUT: Duration = Duration::from_secs(120);

    pub fn new(options: &RunOptions, full_timeout: Duration) -> Self {
        CommitPolicy {
            test_run: options.test_run,
            commit_full: options.commit_full,
            full_timeout,
        }
    }

    fn commit_mode(&self) -> CommitMode {
        match self.commit_full {
            true => CommitMode::Full {
                timeout: self.full_timeout,
            },
            false => CommitMode::Standard,
        }
    }
}

/// A staged configuration change, scoped to one borrowed session.
///
/// Most callers want [ConfigTransaction::run], which performs the whole sequence. The individual
/// steps are public for callers that need finer control; they enforce the same ordering.
pub struct ConfigTransaction<'s, S: DeviceSession> {
    session: &'s mut S,
    log: Log,
    state: State,

    /// The most recent diff, if one has been computed and was non-empty.
    diff: Option<String>,
}

impl<'s, S: DeviceSession> ConfigTransaction<'s, S> {
    pub fn new(session: &'s mut S, log: Log) -> Self {
        ConfigTransaction {
            session,
            log,
            state: State::Unlocked,
            diff: None,
        }
    }

    /// Runs the whole transaction: lock, load, diff, dispose, unlock.
    ///
    /// # Errors
    ///
    /// * [TransactionError::Lock] if the lock is held elsewhere. Nothing was staged, and nothing
    ///   needs releasing.
    /// * [TransactionError::Load] if the device rejected `text`. The change has already been
    ///   rolled back and the lock released.
    /// * [TransactionError::Rpc] if any other call failed. A change that was still staged has
    ///   been rolled back, and the lock released, as far as the device allowed.
    pub async fn run(
        session: &'s mut S,
        log: Log,
        text: &str,
        format: ConfigFormat,
        policy: &CommitPolicy,
    ) -> Result<Disposition, TransactionError> {
        let mut transaction = ConfigTransaction::new(session, log);
        transaction.lock().await?;

        let outcome = transaction.stage_and_dispose(text, format, policy).await;
        if let Err(error) = &outcome {
            transaction.discard(error.stage()).await;
        }
        if transaction.is_locked() {
            let unlocked = transaction.unlock().await;
            return match (outcome, unlocked) {
                (Ok(disposition), Ok(())) => Ok(disposition),
                (Ok(_), Err(error)) => Err(error),
                (Err(error), _) => Err(error),
            };
        }
        outcome
    }

    async fn stage_and_dispose(
        &mut self,
        text: &str,
        format: ConfigFormat,
        policy: &CommitPolicy,
    ) -> Result<Disposition, TransactionError> {
        self.load(text, format).await?;
        self.diff().await?;
        self.dispose(policy).await
    }

    /// Best-effort rollback of a change left staged by a failed `stage`, so the unlock that
    /// follows doesn't leave it sitting in the candidate. A failure here is only logged.
    async fn discard(&mut self, stage: Stage) {
        if !matches!(self.state, State::Loaded | State::Diffed) || stage == Stage::Rollback {
            return;
        }

        let host = self.host();
        self.log.notice("Rolling back the staged change before unlocking");
        match self.session.rollback().await {
            Ok(()) => self.state = State::RolledBack,
            Err(error) => self.log.warning(format!(
                "{host}: rollback after failed {stage} also failed: {error}"
            )),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The diff computed by [ConfigTransaction::diff], or `None` if there were no changes.
    pub fn last_diff(&self) -> Option<&str> {
        self.diff.as_deref()
    }

    /// Whether this transaction currently holds the configuration lock.
    pub fn is_locked(&self) -> bool {
        !matches!(self.state, State::Unlocked)
    }

    fn host(&self) -> String {
        self.session.host().to_owned()
    }

    pub async fn lock(&mut self) -> Result<(), TransactionError> {
        debug_assert_eq!(State::Unlocked, self.state, "lock() called twice");
        self.session
            .lock()
            .await
            .map_err(TransactionError::Lock)?;
        self.state = State::Locked;
        Ok(())
    }

    /// Stages the configuration. If the device rejects it, rolls back and unlocks before
    /// returning the error.
    pub async fn load(&mut self, text: &str, format: ConfigFormat) -> Result<(), TransactionError> {
        debug_assert_eq!(State::Locked, self.state, "load() requires the lock");
        let error = match self.session.load(text, format).await {
            Ok(()) => {
                self.state = State::Loaded;
                return Ok(());
            }
            Err(error) => error,
        };

        let host = self.host();
        self.log.error(format!("{host}: {error}"));
        self.log.notice("Errors detected, rolling back the change and disconnecting");

        // The load error is what matters to the caller. Cleanup failures are only logged.
        if let Err(rollback_error) = self.session.rollback().await {
            self.log.warning(format!(
                "{host}: rollback after failed load also failed: {rollback_error}"
            ));
        }
        self.state = State::RolledBack;
        if let Err(unlock_error) = self.unlock().await {
            self.log.warning(format!("{host}: {unlock_error}"));
        }
        Err(TransactionError::Load(error))
    }

    /// Computes and logs the difference between the candidate and active configurations.
    pub async fn diff(&mut self) -> Result<Option<&str>, TransactionError> {
        debug_assert_eq!(State::Loaded, self.state, "diff() requires a loaded change");
        let diff = self.session.diff().await.map_err(rpc(Stage::Diff))?;
        self.diff = diff.filter(|d| !d.trim().is_empty());
        self.state = State::Diffed;

        match &self.diff {
            Some(diff) => self.log.notice(format!("Config diff:\n{diff}")),
            None => self.log.notice("Config diff: None"),
        }
        self.log.separator('-');
        Ok(self.last_diff())
    }

    /// Rolls back or commits, depending on the run mode and the diff.
    ///
    /// Test runs always roll back. Otherwise, an empty diff rolls back, and a non-empty diff goes
    /// through a commit check and then a commit. A failed commit check rolls back and is reported
    /// as a [Disposition], not an error.
    pub async fn dispose(
        &mut self,
        policy: &CommitPolicy,
    ) -> Result<Disposition, TransactionError> {
        debug_assert_eq!(State::Diffed, self.state, "dispose() requires a diff");

        let disposition = if policy.test_run {
            self.rollback().await?;
            self.log.notice("Test Run only, rolling back the change");
            Disposition::RolledBack(RollbackReason::TestRun)
        } else if self.diff.is_none() {
            self.rollback().await?;
            self.log.notice("Diff is empty so cancelling commit");
            Disposition::RolledBack(RollbackReason::NoChanges)
        } else {
            self.commit(policy).await?
        };

        self.log.separator('-');
        Ok(disposition)
    }

    async fn commit(&mut self, policy: &CommitPolicy) -> Result<Disposition, TransactionError> {
        if let Err(error) = self.session.commit_check().await {
            let host = self.host();
            self.log.error(format!("{host}: commit check failed: {error}"));
            self.log.notice("Commit failed, rolling back");
            self.rollback().await?;
            return Ok(Disposition::RolledBack(RollbackReason::CommitCheckFailed(error)));
        }

        self.log.notice("Commit check passed, committing changes");
        let mode = policy.commit_mode();
        if let CommitMode::Full { .. } = mode {
            self.log.notice("Performing 'commit full', this could take some time!");
        }

        self.session
            .commit(mode)
            .await
            .map_err(rpc(Stage::Commit))?;
        self.state = State::Committed;

        match mode {
            CommitMode::Full { .. } => self.log.notice("Commit full complete"),
            CommitMode::Standard => self.log.notice("Commit complete"),
        }
        Ok(Disposition::Committed(mode))
    }

    async fn rollback(&mut self) -> Result<(), TransactionError> {
        self.session
            .rollback()
            .await
            .map_err(rpc(Stage::Rollback))?;
        self.state = State::RolledBack;
        Ok(())
    }

    /// Releases the configuration lock. A no-op if the lock isn't held.
    pub async fn unlock(&mut self) -> Result<(), TransactionError> {
        if !self.is_locked() {
            return Ok(());
        }

        // Whatever the device says, we're done with the lock; don't try again.
        self.state = State::Unlocked;
        self.session.unlock().await.map_err(rpc(Stage::Unlock))
    }
}

fn rpc(stage: Stage) -> impl Fn(RpcError) -> TransactionError {
    move |source| TransactionError::Rpc { stage, source }
}
