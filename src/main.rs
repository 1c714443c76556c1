use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wings::config;
use wings::model::{LinkGrant, LinkState, LinkStep, StepResult};
use wings::{EndpointKind, LinkProgress, Wings};

#[derive(Debug, Parser)]
#[command(author, version, about = "Queue files for linked destinations and deliver them")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "wings.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Deliver queued files in the background until Ctrl-C
    Run,
    /// Queue a file for an endpoint's linked destination
    Share {
        kind: EndpointKind,
        file: PathBuf,
        /// Deliver right away instead of leaving it for `run`
        #[arg(long)]
        now: bool,
    },
    /// Run one delivery cycle and print its notifications
    Flush,
    /// Link state and queue counts per endpoint
    Status,
    /// Drive an endpoint's link flow
    #[command(subcommand)]
    Link(LinkCommand),
    /// Forget an endpoint's link and drop its queue
    Unlink { kind: EndpointKind },
    /// Re-queue an endpoint's transient failures
    Retry { kind: EndpointKind },
    /// Print an example configuration
    ExampleConfig,
}

#[derive(Debug, Subcommand)]
enum LinkCommand {
    /// Start (or restart) linking and print the first step
    Start { kind: EndpointKind },
    /// Report the result of a link step
    Complete {
        kind: EndpointKind,
        step: LinkStep,
        /// Report the step as denied with this reason
        #[arg(long, conflicts_with_all = ["account", "token", "destination_id", "description", "settings"])]
        deny: Option<String>,
        #[arg(long)]
        account: Option<String>,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        destination_id: Option<i32>,
        #[arg(long)]
        description: Option<String>,
        /// Extra link setting as key=value; repeatable
        #[arg(long = "setting", value_parser = parse_setting)]
        settings: Vec<(String, String)>,
    },
}

fn parse_setting(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("loading {}", args.config.display()))?;
    init_tracing(&cfg.logging.filter);

    // Only `run` keeps a worker; every other command shares the database with
    // a possibly running `run` and delivers through an explicit flush, if at all.
    let background = matches!(args.command, Command::Run);
    let wings = Wings::builder(cfg)
        .configured_endpoints()?
        .background(background)
        .build()
        .await
        .context("initializing wings")?;

    let outcome = execute(&wings, args.command).await;
    wings.shutdown().await;
    outcome
}

async fn execute(wings: &Wings, command: Command) -> Result<()> {
    match command {
        Command::Run => {
            wings.wake();
            info!("running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("shutting down");
        }
        Command::Share { kind, file, now } => {
            let path = std::fs::canonicalize(&file).unwrap_or(file);
            let path = path.to_string_lossy();
            if !wings.share(&path, kind).await {
                anyhow::bail!("could not queue {path} for {kind}; is it linked?");
            }
            println!("queued {path} for {kind}");
            if now {
                print_notifications(&wings.flush().await)?;
            }
        }
        Command::Flush => print_notifications(&wings.flush().await)?,
        Command::Status => {
            for endpoint in wings.endpoints() {
                let state = match endpoint.link_state().await? {
                    LinkState::Unlinked => "unlinked".to_string(),
                    LinkState::LinkInProgress(step) => format!("linking (step {step})"),
                    LinkState::Linked(account) => format!(
                        "linked as {} to {} ({})",
                        account.account_name, account.destination_description, account.destination
                    ),
                };
                println!("{}: {}", endpoint.kind(), state);
                for (destination, counts) in endpoint.share_counts().await? {
                    if counts.total() > 0 {
                        println!(
                            "  {}: {} pending, {} processing, {} failed",
                            destination, counts.pending, counts.processing, counts.failed
                        );
                    }
                }
            }
        }
        Command::Link(LinkCommand::Start { kind }) => {
            let step = wings.endpoint(kind)?.start_link_request().await?;
            println!("next step: {step}");
        }
        Command::Link(LinkCommand::Complete {
            kind,
            step,
            deny,
            account,
            token,
            destination_id,
            description,
            settings,
        }) => {
            let result = match deny {
                Some(reason) => StepResult::Denied(reason),
                None => StepResult::Granted(LinkGrant {
                    account_name: account,
                    credential: token,
                    destination_id,
                    destination_description: description,
                    settings: settings.into_iter().collect::<BTreeMap<_, _>>(),
                }),
            };
            match wings.endpoint(kind)?.complete_link_request(step, result).await? {
                LinkProgress::Next(next) => println!("next step: {next}"),
                LinkProgress::Linked(info) => println!(
                    "linked as {} to {}",
                    info.account_name, info.destination_description
                ),
                LinkProgress::Failed(err) => anyhow::bail!("{}: {err}", err.user_message()),
            }
        }
        Command::Unlink { kind } => {
            wings.endpoint(kind)?.unlink().await?;
            println!("{kind} unlinked");
        }
        Command::Retry { kind } => {
            let count = wings.retry_failed(kind).await?;
            println!("{count} share requests re-queued for {kind}");
        }
        Command::ExampleConfig => print!("{}", config::example()),
    }
    Ok(())
}

fn print_notifications(notifications: &[wings::ShareNotification]) -> Result<()> {
    if notifications.is_empty() {
        println!("nothing delivered");
        return Ok(());
    }
    for notification in notifications {
        println!("{}", serde_json::to_string(notification)?);
    }
    Ok(())
}
