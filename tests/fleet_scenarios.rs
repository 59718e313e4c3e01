//! End-to-end runs of the push workflow against scripted devices, reading configurations from a
//! real directory.
//!
//! Each [Router] is scripted with how it reacts to a load and what diff it reports. Every call is
//! recorded in a shared journal as `<host> <call>`, so a test can check the exact sequence of
//! calls across the whole fleet.

use async_trait::async_trait;
use confpush::config::{ConfigFormat, Credentials, RunOptions};
use confpush::error::{ConfigFailure, ConnectionError, FleetError, RpcError};
use confpush::fleet::{FileStore, Fleet, PushPlan};
use confpush::logger::Log;
use confpush::runner::DeviceOutcome;
use confpush::session::{CommitMode, Connect, DeviceSession, Facts};
use confpush::transaction::{Disposition, RollbackReason};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, Default)]
struct Router {
    rejects_load: bool,
    diff: Option<String>,
}

impl Router {
    fn rejecting() -> Self {
        Router {
            rejects_load: true,
            diff: None,
        }
    }

    fn unchanged() -> Self {
        Router::default()
    }

    fn changed(diff: &str) -> Self {
        Router {
            rejects_load: false,
            diff: Some(diff.to_owned()),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct Lab {
    routers: HashMap<String, Router>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl Lab {
    fn with(mut self, host: &str, router: Router) -> Self {
        self.routers.insert(host.to_owned(), router);
        self
    }

    fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    fn calls_to(&self, host: &str) -> Vec<String> {
        let prefix = format!("{host} ");
        self.journal()
            .iter()
            .filter_map(|line| line.strip_prefix(&prefix).map(str::to_owned))
            .collect()
    }
}

#[async_trait]
impl Connect for Lab {
    type Session = LabSession;

    async fn open(
        &mut self,
        host: &str,
        _credentials: &Credentials,
    ) -> Result<LabSession, ConnectionError> {
        let router = self
            .routers
            .get(host)
            .cloned()
            .ok_or_else(|| ConnectionError::UnknownHost {
                host: host.to_owned(),
            })?;
        let session = LabSession {
            host: host.to_owned(),
            facts: Facts {
                hostname: host.to_uppercase(),
                version: "22.2R1".into(),
            },
            router,
            journal: Arc::clone(&self.journal),
        };
        session.note("open");
        Ok(session)
    }
}

struct LabSession {
    host: String,
    facts: Facts,
    router: Router,
    journal: Arc<Mutex<Vec<String>>>,
}

impl LabSession {
    fn note(&self, call: impl Into<String>) {
        let line = format!("{} {}", self.host, call.into());
        self.journal.lock().unwrap().push(line);
    }
}

#[async_trait]
impl DeviceSession for LabSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn facts(&self) -> &Facts {
        &self.facts
    }

    async fn lock(&mut self) -> Result<(), RpcError> {
        self.note("lock");
        Ok(())
    }

    async fn load(&mut self, text: &str, format: ConfigFormat) -> Result<(), RpcError> {
        self.note(format!("load {format} {}", text.trim()));
        match self.router.rejects_load {
            true => Err(RpcError::Remote("syntax error".into())),
            false => Ok(()),
        }
    }

    async fn diff(&mut self) -> Result<Option<String>, RpcError> {
        self.note("diff");
        Ok(self.router.diff.clone())
    }

    async fn commit_check(&mut self) -> Result<(), RpcError> {
        self.note("commit check");
        Ok(())
    }

    async fn commit(&mut self, mode: CommitMode) -> Result<(), RpcError> {
        match mode {
            CommitMode::Standard => self.note("commit"),
            CommitMode::Full { timeout } => {
                self.note(format!("commit full {}s", timeout.as_secs()))
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), RpcError> {
        self.note("rollback");
        Ok(())
    }

    async fn unlock(&mut self) -> Result<(), RpcError> {
        self.note("unlock");
        Ok(())
    }

    async fn close(self) -> Result<(), RpcError> {
        self.note("close");
        Ok(())
    }
}

fn hosts(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn fleet(lab: &Lab, plan: PushPlan, log: Log) -> Fleet<Lab, FileStore> {
    Fleet::new(lab.clone(), FileStore, Credentials::new("netops"), plan, log)
}

fn push_plan(config_path: &Path, options: RunOptions) -> PushPlan {
    PushPlan::new(
        config_path,
        ConfigFormat::Set,
        options,
        Duration::from_secs(120),
    )
}

#[tokio::test]
async fn shared_config_rejected_by_first_router_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("ntp.set");
    fs::write(&config, "set system ntp server 192.0.2.1\n").unwrap();

    let lab = Lab::default()
        .with("r1", Router::rejecting())
        .with("r2", Router::changed("+ ntp"))
        .with("r3", Router::changed("+ ntp"));
    let (log, captured) = Log::capture();
    let plan = push_plan(&config, RunOptions::default());
    let mut fleet = fleet(&lab, plan, log);

    let result = fleet.run(&hosts(&["r1", "r2", "r3"])).await;

    let (host, reason, remaining, summary) = match result {
        Err(FleetError::Aborted {
            host,
            reason,
            remaining,
            summary,
        }) => (host, reason, remaining, summary),
        Ok(summary) => panic!("expected the run to abort, got {summary:?}"),
    };
    assert_eq!("r1", host);
    assert_eq!(
        ConfigFailure::Rejected(RpcError::Remote("syntax error".into())),
        reason
    );
    assert_eq!(2, remaining);
    assert_eq!(1, summary.len());

    let expected = [
        "r1 open",
        "r1 lock",
        "r1 load set set system ntp server 192.0.2.1",
        "r1 rollback",
        "r1 unlock",
        "r1 close",
    ];
    assert_eq!(expected.to_vec(), lab.journal());

    let lines = captured.lines();
    assert!(lines.iter().any(|line| line == "ERROR: r1: syntax error"), "{lines:#?}");
    assert!(
        lines.iter().any(|line| line.starts_with("FATAL: As an error was detected")),
        "{lines:#?}"
    );
    assert!(
        lines.last().is_some_and(|line| line.starts_with("Finished: 1 device(s)")),
        "{lines:#?}"
    );
}

#[tokio::test]
async fn per_router_configs_settle_independently() {
    let dir = tempfile::tempdir().unwrap();
    for host in ["r1", "r2", "r3"] {
        let text = format!("set system host-name {host}\n");
        fs::write(dir.path().join(format!("{host}.conf")), text).unwrap();
    }

    let lab = Lab::default()
        .with("r1", Router::rejecting())
        .with("r2", Router::unchanged())
        .with("r3", Router::changed("[edit system]\n-  host-name old;\n+  host-name r3;"));
    let options = RunOptions {
        per_device_config: true,
        ..RunOptions::default()
    };
    let plan = push_plan(dir.path(), options);
    let mut fleet = fleet(&lab, plan, Log::disabled());

    let summary = fleet.run(&hosts(&["r1", "r2", "r3"])).await.unwrap();

    assert!(matches!(
        summary.get("r1"),
        Some(DeviceOutcome::Skipped(ConfigFailure::Rejected(_)))
    ));
    assert_eq!(
        Some(&DeviceOutcome::Settled(Disposition::RolledBack(
            RollbackReason::NoChanges
        ))),
        summary.get("r2")
    );
    assert_eq!(
        Some(&DeviceOutcome::Settled(Disposition::Committed(
            CommitMode::Standard
        ))),
        summary.get("r3")
    );

    assert_eq!(
        vec!["open", "lock", "load set set system host-name r1", "rollback", "unlock", "close"],
        lab.calls_to("r1")
    );
    assert_eq!(
        vec![
            "open",
            "lock",
            "load set set system host-name r2",
            "diff",
            "rollback",
            "unlock",
            "close",
        ],
        lab.calls_to("r2")
    );
    assert_eq!(
        vec![
            "open",
            "lock",
            "load set set system host-name r3",
            "diff",
            "commit check",
            "commit",
            "unlock",
            "close",
        ],
        lab.calls_to("r3")
    );
}

#[tokio::test]
async fn test_run_never_commits() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("snmp.set");
    fs::write(&config, "set snmp community public").unwrap();

    let lab = Lab::default()
        .with("r1", Router::changed("+ snmp"))
        .with("r2", Router::changed("+ snmp"));
    let options = RunOptions {
        test_run: true,
        commit_full: true,
        ..RunOptions::default()
    };
    let plan = push_plan(&config, options);
    let mut fleet = fleet(&lab, plan, Log::disabled());

    let summary = fleet.run(&hosts(&["r1", "r2"])).await.unwrap();

    assert_eq!(2, summary.rolled_back());
    assert!(!lab.journal().iter().any(|line| line.contains("commit")));
}

#[tokio::test]
async fn commit_full_uses_its_own_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("bgp.set");
    fs::write(&config, "set protocols bgp group core type internal").unwrap();

    let lab = Lab::default().with("r1", Router::changed("+ bgp"));
    let options = RunOptions {
        commit_full: true,
        ..RunOptions::default()
    };
    let plan = push_plan(&config, options);
    let mut fleet = fleet(&lab, plan, Log::disabled());

    fleet.run(&hosts(&["r1"])).await.unwrap();

    assert!(lab.calls_to("r1").contains(&"commit full 120s".to_string()));
}

#[tokio::test]
async fn unknown_and_blank_targets_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("ntp.set");
    fs::write(&config, "set system ntp server 192.0.2.1").unwrap();

    let lab = Lab::default().with("r2", Router::unchanged());
    let plan = push_plan(&config, RunOptions::default());
    let mut fleet = fleet(&lab, plan, Log::disabled());

    let summary = fleet.run(&hosts(&["r1", "", "r2"])).await.unwrap();

    assert_eq!(2, summary.skipped());
    assert_eq!(1, summary.rolled_back());
    assert_eq!(
        Some(&DeviceOutcome::Skip(ConnectionError::UnknownHost { host: String::new() })),
        summary.get("")
    );
}
