//! NETCONF over an in-process ssh client.
//!
//! Unlike [mod@super::openssh], this transport can log in with the operator's password, so it's
//! the one to use when there is one. Host keys are checked against `~/.ssh/known_hosts`
//! according to [KnownHostsPolicy]. Once logged in, we open the `netconf` subsystem, which Junos
//! serves directly, and speak NETCONF 1.0 over the channel.

use crate::config::{Credentials, KnownHostsPolicy, Login, Settings};
use crate::error::{ConnectionError, RpcError};
use crate::logger::Log;
use crate::session::netconf::{NetconfSession, Transport};
use crate::session::Connect;
use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{ChannelStream, Disconnect};
use russh_keys::key::PublicKey;
use secrecy::ExposeSecret;
use std::sync::Arc;
use tokio::io::{ReadHalf, WriteHalf};

/// A NETCONF session over an in-process ssh connection.
pub type NativeSession =
    NetconfSession<ReadHalf<ChannelStream<Msg>>, WriteHalf<ChannelStream<Msg>>, NativeLink>;

/// Opens [NativeSession]s.
#[derive(Debug)]
pub struct NativeConnector {
    settings: Settings,
    log: Log,
}

impl NativeConnector {
    pub fn new(settings: Settings, log: Log) -> Self {
        NativeConnector { settings, log }
    }

    async fn login(
        &self,
        handle: &mut Handle<HostKeyCheck>,
        host: &str,
        credentials: &Credentials,
    ) -> Result<(), ConnectionError> {
        let failed = |e: russh::Error| ConnectionError::classify(host, &e.to_string());
        let user = credentials.username.as_str();

        for login in credentials.logins() {
            let accepted = match login {
                Login::Key(path) => {
                    let passphrase = credentials.password.as_ref().map(|p| p.expose_secret());
                    let key = match russh_keys::load_secret_key(path, passphrase) {
                        Ok(key) => key,
                        Err(error) => {
                            self.log
                                .warning(format!("{host}: can't use {}: {error}", path.display()));
                            continue;
                        }
                    };
                    handle
                        .authenticate_publickey(user, Arc::new(key))
                        .await
                        .map_err(failed)?
                }
                Login::Password(password) => handle
                    .authenticate_password(user, password.expose_secret())
                    .await
                    .map_err(failed)?,
            };
            if accepted {
                return Ok(());
            }
            self.log.debug(format!("{host}: {} login refused", login.kind()));
        }

        Err(ConnectionError::Auth {
            host: host.to_owned(),
            message: format!("no login accepted for {user}"),
        })
    }
}

impl Login<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Login::Key(_) => "key",
            Login::Password(_) => "password",
        }
    }
}

#[async_trait]
impl Connect for NativeConnector {
    type Session = NativeSession;

    async fn open(
        &mut self,
        host: &str,
        credentials: &Credentials,
    ) -> Result<NativeSession, ConnectionError> {
        let port = self.settings.port;
        let check = HostKeyCheck {
            host: host.to_owned(),
            port,
            policy: self.settings.known_hosts,
        };

        let timeout = self.settings.connect_timeout();
        // No inactivity timeout: a full commit can sit silent for longer than any sensible one.
        let config = Arc::new(client::Config::default());
        let connecting = client::connect(config, (host, port), check);
        let mut handle = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| ConnectionError::Timeout {
                host: host.to_owned(),
            })?
            .map_err(|e| ConnectionError::classify(host, &e.to_string()))?;

        let link = match self.login(&mut handle, host, credentials).await {
            Ok(()) => NativeLink { handle },
            Err(error) => {
                hang_up(&handle, host, &self.log).await;
                return Err(error);
            }
        };

        let stream = match netconf_subsystem(&link.handle).await {
            Ok(stream) => stream,
            Err(error) => {
                hang_up(&link.handle, host, &self.log).await;
                return Err(ConnectionError::Transport {
                    host: host.to_owned(),
                    message: error.to_string(),
                });
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        NetconfSession::start(
            host,
            reader,
            writer,
            link,
            self.settings.rpc_timeout(),
            &self.log,
        )
        .await
    }
}

async fn netconf_subsystem(
    handle: &Handle<HostKeyCheck>,
) -> Result<ChannelStream<Msg>, russh::Error> {
    let mut channel = handle.channel_open_session().await?;
    channel.request_subsystem(true, "netconf").await?;
    Ok(channel.into_stream())
}

async fn hang_up(handle: &Handle<HostKeyCheck>, host: &str, log: &Log) {
    if let Err(error) = handle
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
    {
        log.debug(format!("{host}: {error}"));
    }
}

/// The ssh connection under a [NativeSession].
pub struct NativeLink {
    handle: Handle<HostKeyCheck>,
}

#[async_trait]
impl Transport for NativeLink {
    async fn shutdown(self) -> Result<(), RpcError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))
    }
}

/// Decides whether to trust a server's host key.
pub struct HostKeyCheck {
    host: String,
    port: u16,
    policy: KnownHostsPolicy,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        if self.policy == KnownHostsPolicy::Accept {
            return Ok(true);
        }

        // A key that differs from the recorded one is an error, whatever the policy.
        let known = russh_keys::check_known_hosts(&self.host, self.port, key)?;
        match (known, self.policy) {
            (true, _) => Ok(true),
            (false, KnownHostsPolicy::Add) => {
                russh_keys::learn_known_hosts(&self.host, self.port, key)?;
                Ok(true)
            }
            (false, _) => Ok(false),
        }
    }
}
