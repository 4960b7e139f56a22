use std::time::Duration;

use aggregator::{
    client::{discovery::GroupFilter, KubeClient},
    core::{kinds::parse_kind, Operator},
    runtime::{AdoptionConfig, Controller, ControllerConfig, KindSelection},
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "component-aggregator", version, about, args_conflicts_with_subcommands = true)]
struct App {
    /// Log as JSON lines
    #[arg(long, env = "AGGREGATOR_LOG_JSON", global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Option<Command>,
    /// Arguments for `run`, the default command
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Keep the status of every operator current
    Run(RunArgs),
    /// Print the Operator CRD as YAML
    Crd,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Watch every listable kind the cluster serves instead of the defaults
    #[arg(long, env = "AGGREGATOR_DISCOVER")]
    discover: bool,
    /// Kinds to watch as `group/version/Kind` or `version/Kind`, replacing the defaults
    #[arg(long = "kind", env = "AGGREGATOR_KINDS", value_delimiter = ',', conflicts_with = "discover")]
    kinds: Vec<String>,
    /// API groups never watched when discovering
    #[arg(long = "exclude-group", env = "AGGREGATOR_EXCLUDE_GROUPS", value_delimiter = ',')]
    exclude_groups: Vec<String>,
    /// Only find components through labels
    #[arg(long, env = "AGGREGATOR_NO_ADOPTION")]
    no_adoption: bool,
    /// Quiet window in milliseconds before a unit counts as settled
    #[arg(long, env = "AGGREGATOR_QUIESCENCE_MS", default_value_t = 250)]
    quiescence_ms: u64,
    /// Longest a stale status waits under constant updates, in milliseconds
    #[arg(long, env = "AGGREGATOR_MAX_PUBLISH_DELAY_MS", default_value_t = 2000)]
    max_publish_delay_ms: u64,
    /// Attempts made after a conflicting status write
    #[arg(long, env = "AGGREGATOR_STATUS_RETRIES", default_value_t = 5)]
    status_retries: usize,
    /// Seconds between re-resolving the watched kinds
    #[arg(long, env = "AGGREGATOR_KIND_REFRESH_SECS", default_value_t = 60)]
    kind_refresh_secs: u64,
    /// Create an operator for every subscription that lacks one
    #[arg(long, env = "AGGREGATOR_ENSURE_PACKAGE_OPERATORS")]
    ensure_package_operators: bool,
}

impl RunArgs {
    fn config(&self) -> Result<ControllerConfig> {
        let kinds = if self.discover {
            KindSelection::Discover
        } else if self.kinds.is_empty() {
            KindSelection::default()
        } else {
            let kinds = self
                .kinds
                .iter()
                .map(|kind| parse_kind(kind).with_context(|| format!("invalid kind {kind:?}")))
                .collect::<Result<_>>()?;
            KindSelection::Static(kinds)
        };
        Ok(ControllerConfig {
            kinds,
            adoption: (!self.no_adoption).then(AdoptionConfig::default),
            quiescence: Duration::from_millis(self.quiescence_ms),
            max_publish_delay: Duration::from_millis(self.max_publish_delay_ms),
            status_retries: self.status_retries,
            kind_refresh_interval: Duration::from_secs(self.kind_refresh_secs),
            ensure_package_operators: self.ensure_package_operators,
            ..ControllerConfig::default()
        })
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = args.config()?;
    let mut client = KubeClient::try_default()
        .await
        .context("failed to connect to the cluster")?;
    if !args.exclude_groups.is_empty() {
        client = client.with_group_filter(GroupFilter::Block(args.exclude_groups.clone()));
    }

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, shutting down");
        }
        on_signal.cancel();
    });
    Controller::new(client, config).run(shutdown).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let app = App::parse();
    match app.command {
        Some(Command::Crd) => print!("{}", serde_yaml::to_string(&Operator::crd())?),
        Some(Command::Run(args)) => {
            init_tracing(app.log_json);
            run(args).await?;
        }
        None => {
            init_tracing(app.log_json);
            run(app.run).await?;
        }
    }
    Ok(())
}
