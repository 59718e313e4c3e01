use anyhow::Context;
use clap::Parser;
use confpush::config::{self, ConfigFormat, Credentials, RunOptions, Settings};
use confpush::error::FleetError;
use confpush::fleet::{self, FileStore};
use confpush::logger::{self, Log};
use confpush::session::native::NativeConnector;
use confpush::session::openssh::SshConnector;
use confpush::session::Connect;
use confpush::{Fleet, PushPlan};
use dialoguer::Input;
use std::path::PathBuf;
use std::process::ExitCode;

/// Push a configuration change to a list of Junos devices, one at a time.
#[derive(Debug, Parser)]
#[command(name = "confpush", version)]
struct Cli {
    /// File listing the routers to update, one per line
    routers_file: PathBuf,

    /// The configuration file, or with -d the directory of <router>.conf files
    config_path: PathBuf,

    /// Format of the configuration
    #[arg(value_enum)]
    config_format: ConfigFormat,

    /// SSH private key to authenticate with
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Test run: load and diff, then roll back without committing
    #[arg(short)]
    t: bool,

    /// Use 'commit full' instead of a normal commit
    #[arg(short)]
    c: bool,

    /// Carry on with the next router when a shared configuration fails to load
    #[arg(short)]
    f: bool,

    /// CONFIG_PATH is a directory holding one configuration per router
    #[arg(short)]
    d: bool,

    /// Settings file [default: /etc/confpush/settings.yaml, if present]
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log more detail (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn options(&self) -> RunOptions {
        RunOptions {
            per_device_config: self.d,
            test_run: self.t,
            commit_full: self.c,
            force_continue: self.f,
        }
    }
}

fn prompt_credentials(key: Option<PathBuf>) -> anyhow::Result<Credentials> {
    let username: String = Input::new()
        .with_prompt("username")
        .interact_text()
        .context("failed to read the username")?;
    let password = rpassword::prompt_password("password (blank if using SSH keys): ")
        .context("failed to read the password")?;

    let mut credentials = Credentials::new(username).with_password(password);
    credentials.key = key.map(|path| config::expand_home(&path));
    Ok(credentials)
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let settings = Settings::load(cli.settings.as_deref())?;
    let credentials = prompt_credentials(cli.key.clone())?;

    let (log, _guard) = logger::init(&settings.log, cli.verbose)?;
    let targets = fleet::read_targets(&FileStore, &cli.routers_file)?;

    let plan = PushPlan::new(
        cli.config_path.clone(),
        cli.config_format,
        cli.options(),
        settings.commit_full_timeout(),
    );

    // The OpenSSH client can't send a password, so a password means the native client.
    let code = match credentials.password.is_some() {
        true => {
            let connector = NativeConnector::new(settings, log.clone());
            push(connector, credentials, plan, log, &targets).await
        }
        false => {
            let connector = SshConnector::new(settings, log.clone());
            push(connector, credentials, plan, log, &targets).await
        }
    };
    Ok(code)
}

async fn push<C: Connect>(
    connector: C,
    credentials: Credentials,
    plan: PushPlan,
    log: Log,
    targets: &[String],
) -> ExitCode {
    let mut fleet = Fleet::new(connector, FileStore, credentials, plan, log);
    match fleet.run(targets).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(FleetError::Aborted { .. }) => ExitCode::FAILURE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("confpush: {error:#}");
            ExitCode::FAILURE
        }
    }
}
