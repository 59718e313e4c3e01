//! Run-time configuration: the flags of a single run, the operator's credentials, and the
//! optional settings file.

use anyhow::Context;
use secrecy::SecretString;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a [PathBuf] to the directory where confpush's configuration should live.
///
/// When compiled for testing, this returns `CARGO_MANIFEST_DIR` plus `resources/etc/confpush`.
/// Otherwise, it returns `/etc/confpush`.
pub fn config_dir() -> PathBuf {
    // Omit the leading slash so that PathBuf::push appends instead of replacing.
    const CONFIG_DIR: &str = "etc/confpush";

    let mut path = PathBuf::new();

    #[cfg(test)]
    {
        path.push(env!("CARGO_MANIFEST_DIR"));
        path.push("resources");
    }

    #[cfg(not(test))]
    path.push("/");

    path.push(CONFIG_DIR);
    path
}

/// The run-mode flags for one invocation. Read-only for the lifetime of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Each device has its own configuration file, named `<host>.conf`.
    pub per_device_config: bool,

    /// Load and diff, then always roll back. Nothing is ever committed.
    pub test_run: bool,

    /// Commit with `commit full` instead of an incremental commit.
    pub commit_full: bool,

    /// Keep going after a shared configuration fails to load on a device.
    pub force_continue: bool,
}

/// The format of the configuration text, as the device should parse it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// A `<configuration>` element.
    Xml,

    /// Curly-brace configuration text.
    Text,

    /// `set` and `delete` commands, one per line.
    Set,
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigFormat::Xml => "xml",
            ConfigFormat::Text => "text",
            ConfigFormat::Set => "set",
        })
    }
}

/// The operator's login details, gathered once and used for every device.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,

    /// `None` when the operator left the password prompt blank.
    pub password: Option<SecretString>,

    /// Private key to offer instead of (or in addition to) the ssh client's defaults.
    pub key: Option<PathBuf>,
}

impl Credentials {
    pub fn new(username: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: None,
            key: None,
        }
    }

    /// Sets the password as typed at the prompt. A blank one means there isn't one.
    pub fn with_password(mut self, password: String) -> Self {
        self.password = match password.is_empty() {
            true => None,
            false => Some(SecretString::from(password)),
        };
        self
    }

    /// The logins to offer a device, in order: the key file, then the password.
    pub fn logins(&self) -> Vec<Login<'_>> {
        let key = self.key.as_deref().map(Login::Key);
        let password = self.password.as_ref().map(Login::Password);
        key.into_iter().chain(password).collect()
    }
}

/// One way of authenticating to a device.
#[derive(Clone, Copy, Debug)]
pub enum Login<'a> {
    /// Public-key authentication. The password, if there is one, unlocks an encrypted key.
    Key(&'a Path),

    Password(&'a SecretString),
}

/// How to treat host keys that aren't in `known_hosts` yet.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KnownHostsPolicy {
    /// Refuse hosts whose keys are unknown.
    Strict,

    /// Accept and remember unknown keys, refuse changed ones.
    #[default]
    Add,

    /// Accept everything.
    Accept,
}

/// Tunables read from `settings.yaml`. Every field has a default, so the file is optional.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub port: u16,
    pub connect_timeout_secs: u64,

    /// Applies to every call on a session except `commit full`.
    pub rpc_timeout_secs: u64,
    pub commit_full_timeout_secs: u64,
    pub known_hosts: KnownHostsPolicy,
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            port: 22,
            connect_timeout_secs: 10,
            rpc_timeout_secs: 30,
            commit_full_timeout_secs: 120,
            known_hosts: KnownHostsPolicy::default(),
            log: LogSettings::default(),
        }
    }
}

/// Where and how much to log.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LogSettings {
    pub directory: PathBuf,

    /// The log file rotates once it would grow past this many bytes.
    pub max_bytes: u64,

    /// How many rotated files to keep.
    pub backups: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            directory: PathBuf::from("logs"),
            max_bytes: 100_000,
            backups: 10,
        }
    }
}

impl Settings {
    pub const FILE_NAME: &'static str = "settings.yaml";

    /// Parses settings from YAML.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        // An empty document deserializes as null, which isn't a map; treat it as "all defaults".
        if yaml.trim().is_empty() {
            return Ok(Settings::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Reads settings from `path`.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        Self::from_yaml(&yaml)
            .with_context(|| format!("failed to parse settings in {}", path.display()))
    }

    /// Reads settings from `explicit` if given. Otherwise, reads `settings.yaml` from
    /// [config_dir] if it exists, and falls back to the defaults if it doesn't.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let default_path = config_dir().join(Self::FILE_NAME);
        let exists = default_path
            .try_exists()
            .with_context(|| format!("could not check for {}", default_path.display()))?;
        match exists {
            true => Self::from_file(default_path),
            false => Ok(Settings::default()),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn commit_full_timeout(&self) -> Duration {
        Duration::from_secs(self.commit_full_timeout_secs)
    }
}

/// Expands a leading `~/` to the current user's home directory. Other paths are returned as-is.
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = home::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
