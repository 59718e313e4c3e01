//! NETCONF over a multiplexed OpenSSH connection.
//!
//! Authentication is whatever the local ssh client does without prompting (agent, keys,
//! `~/.ssh/config`), plus an optional key file from the command line. The ssh client runs in batch
//! mode, so it can't log in with a password; that's what [mod@super::native] is for. Once
//! connected, we ask the device's management process for a NETCONF channel with
//! `xml-mode netconf need-trailer` and speak NETCONF 1.0 over the child's standard input and
//! output.

use crate::config::{Credentials, KnownHostsPolicy, Settings};
use crate::error::{ConnectionError, RpcError};
use crate::logger::Log;
use crate::session::netconf::{NetconfSession, Transport};
use crate::session::Connect;
use async_trait::async_trait;
use openssh::{Child, ChildStdin, ChildStdout, KnownHosts, Session, SessionBuilder, Stdio};
use std::sync::Arc;

/// A NETCONF session over an OpenSSH child process.
pub type OpensshSession = NetconfSession<ChildStdout, ChildStdin, SshProcess>;

/// Opens [OpensshSession]s.
#[derive(Debug)]
pub struct SshConnector {
    settings: Settings,
    log: Log,

    /// Whether we've already told the operator that their password goes unused.
    warned_about_password: bool,
}

impl SshConnector {
    pub fn new(settings: Settings, log: Log) -> Self {
        SshConnector {
            settings,
            log,
            warned_about_password: false,
        }
    }

    fn builder(&self, credentials: &Credentials) -> SessionBuilder {
        let mut builder = SessionBuilder::default();
        builder
            .user(credentials.username.clone())
            .port(self.settings.port)
            .connect_timeout(self.settings.connect_timeout())
            .known_hosts_check(known_hosts(self.settings.known_hosts));
        if let Some(key) = &credentials.key {
            builder.keyfile(key);
        }
        builder
    }
}

fn known_hosts(policy: KnownHostsPolicy) -> KnownHosts {
    match policy {
        KnownHostsPolicy::Strict => KnownHosts::Strict,
        KnownHostsPolicy::Add => KnownHosts::Add,
        KnownHostsPolicy::Accept => KnownHosts::Accept,
    }
}

#[async_trait]
impl Connect for SshConnector {
    type Session = OpensshSession;

    async fn open(
        &mut self,
        host: &str,
        credentials: &Credentials,
    ) -> Result<OpensshSession, ConnectionError> {
        if credentials.password.is_some() && !self.warned_about_password {
            self.log.warning(
                "A password was given, but the OpenSSH transport only authenticates with keys \
                 and the ssh agent; the password will not be used",
            );
            self.warned_about_password = true;
        }

        let session = self
            .builder(credentials)
            .connect_mux(host)
            .await
            .map_err(|e| ConnectionError::classify(host, &e.to_string()))?;
        let session = Arc::new(session);

        let transport = |e: openssh::Error| ConnectionError::Transport {
            host: host.to_owned(),
            message: e.to_string(),
        };
        let mut command = Arc::clone(&session).arc_command("xml-mode");
        command
            .arg("netconf")
            .arg("need-trailer")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = command.spawn().await.map_err(transport)?;

        let stdin = child.stdin().take();
        let stdout = child.stdout().take();
        let process = SshProcess { child, session };
        let (stdout, stdin) = match (stdout, stdin) {
            (Some(stdout), Some(stdin)) => (stdout, stdin),
            _ => {
                if let Err(error) = process.shutdown().await {
                    self.log.debug(format!("{host}: {error}"));
                }
                return Err(ConnectionError::Transport {
                    host: host.to_owned(),
                    message: "ssh child has no stdin or stdout".into(),
                });
            }
        };

        NetconfSession::start(
            host,
            stdout,
            stdin,
            process,
            self.settings.rpc_timeout(),
            &self.log,
        )
        .await
    }
}

/// The `xml-mode` process on the device, and the connection it runs over.
pub struct SshProcess {
    child: Child<Arc<Session>>,
    session: Arc<Session>,
}

#[async_trait]
impl Transport for SshProcess {
    async fn shutdown(self) -> Result<(), RpcError> {
        let transport = |e: openssh::Error| RpcError::Transport(e.to_string());
        let SshProcess { child, session } = self;
        child.wait().await.map_err(transport)?;

        // The child holds the other reference; it's gone now.
        if let Ok(session) = Arc::try_unwrap(session) {
            session.close().await.map_err(transport)?;
        }
        Ok(())
    }
}
