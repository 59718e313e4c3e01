//! A fake fleet of devices for testing the workflow without a network.
//!
//! Every call made on any fake session is recorded, in order, so tests can check exactly what the
//! workflow did to each device.

use super::*;
use crate::error::Stage;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// One call made against a fake device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Open,
    Lock,
    Load { text: String, format: ConfigFormat },
    Diff,
    CommitCheck,
    Commit(CommitMode),
    Rollback,
    Unlock,
    Close,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub host: String,
    pub op: Op,
}

#[derive(Debug, Default)]
struct FleetState {
    calls: Vec<Call>,

    // Hosts the open method should not be able to reach.
    unreachable: HashSet<String>,

    // (host, stage) pairs whose calls should fail.
    failing: HashSet<(String, Stage)>,

    // Hosts whose close method should fail.
    failing_close: HashSet<String>,

    // Maps host -> diff. Hosts without an entry report no changes.
    diffs: HashMap<String, String>,
}

/// A [Connect] implementation that hands out [FakeSession]s. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct FakeFleet {
    state: Arc<Mutex<FleetState>>,
}

impl FakeFleet {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FleetState> {
        self.state.lock().unwrap()
    }

    pub fn set_unreachable(&self, host: impl Into<String>) {
        self.state().unreachable.insert(host.into());
    }

    pub fn fail(&self, host: impl Into<String>, stage: Stage) {
        self.state().failing.insert((host.into(), stage));
    }

    pub fn fail_close(&self, host: impl Into<String>) {
        self.state().failing_close.insert(host.into());
    }

    pub fn set_diff(&self, host: impl Into<String>, diff: impl Into<String>) {
        self.state().diffs.insert(host.into(), diff.into());
    }

    /// Every call made so far, across all hosts.
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// The calls made against `host`, in order.
    pub fn ops(&self, host: &str) -> Vec<Op> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.host == host)
            .map(|call| call.op.clone())
            .collect()
    }

    /// Hosts in the order they were first opened.
    pub fn opened(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.op == Op::Open)
            .map(|call| call.host.clone())
            .collect()
    }

    pub fn count(&self, host: &str, op: &Op) -> usize {
        self.ops(host).iter().filter(|o| *o == op).count()
    }

    fn record(&self, host: &str, op: Op) {
        self.state().calls.push(Call {
            host: host.to_owned(),
            op,
        });
    }

    fn outcome(&self, host: &str, stage: Stage) -> Result<(), RpcError> {
        match self.state().failing.contains(&(host.to_owned(), stage)) {
            true => Err(RpcError::Remote(format!("{stage} rejected by {host}"))),
            false => Ok(()),
        }
    }
}

#[async_trait]
impl Connect for FakeFleet {
    type Session = FakeSession;

    async fn open(
        &mut self,
        host: &str,
        _credentials: &Credentials,
    ) -> Result<FakeSession, ConnectionError> {
        self.record(host, Op::Open);
        if self.state().unreachable.contains(host) {
            return Err(ConnectionError::Refused {
                host: host.to_owned(),
            });
        }
        Ok(FakeSession {
            host: host.to_owned(),
            facts: Facts {
                hostname: format!("{host}-re0"),
                version: "21.4R3".into(),
            },
            fleet: self.clone(),
        })
    }
}

/// A session to one fake device.
#[derive(Debug)]
pub struct FakeSession {
    host: String,
    facts: Facts,
    fleet: FakeFleet,
}

#[async_trait]
impl DeviceSession for FakeSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn facts(&self) -> &Facts {
        &self.facts
    }

    async fn lock(&mut self) -> Result<(), RpcError> {
        self.fleet.record(&self.host, Op::Lock);
        self.fleet.outcome(&self.host, Stage::Lock)
    }

    async fn load(&mut self, text: &str, format: ConfigFormat) -> Result<(), RpcError> {
        let text = text.to_owned();
        self.fleet.record(&self.host, Op::Load { text, format });
        self.fleet.outcome(&self.host, Stage::Load)
    }

    async fn diff(&mut self) -> Result<Option<String>, RpcError> {
        self.fleet.record(&self.host, Op::Diff);
        self.fleet.outcome(&self.host, Stage::Diff)?;
        Ok(self.fleet.state().diffs.get(&self.host).cloned())
    }

    async fn commit_check(&mut self) -> Result<(), RpcError> {
        self.fleet.record(&self.host, Op::CommitCheck);
        self.fleet.outcome(&self.host, Stage::CommitCheck)
    }

    async fn commit(&mut self, mode: CommitMode) -> Result<(), RpcError> {
        self.fleet.record(&self.host, Op::Commit(mode));
        self.fleet.outcome(&self.host, Stage::Commit)
    }

    async fn rollback(&mut self) -> Result<(), RpcError> {
        self.fleet.record(&self.host, Op::Rollback);
        self.fleet.outcome(&self.host, Stage::Rollback)
    }

    async fn unlock(&mut self) -> Result<(), RpcError> {
        self.fleet.record(&self.host, Op::Unlock);
        self.fleet.outcome(&self.host, Stage::Unlock)
    }

    async fn close(self) -> Result<(), RpcError> {
        self.fleet.record(&self.host, Op::Close);
        match self.fleet.state().failing_close.contains(&self.host) {
            true => Err(RpcError::Transport("connection reset".into())),
            false => Ok(()),
        }
    }
}
