//! genwatch: start and follow generation jobs on a running API server.
//!
//! The terminal counterpart of the dashboard's progress widget: everything it
//! prints is derived from the server's status responses.

use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use guidance_api::generation::client::{
    GenerationClient, GenerationView, HttpGenerationApi, PollHandle, PollSettings,
};
use guidance_api::generation::job::{JobKey, JobKind};

/// Start and follow guidance generation jobs.
#[derive(Parser, Debug)]
#[command(name = "genwatch", version, about, long_about = None)]
struct Cli {
    /// API server base URL.
    #[arg(long, env = "GUIDANCE_API_URL", default_value = "http://localhost:8080")]
    base_url: String,

    /// Seconds between status checks.
    #[arg(long, env = "CLIENT_POLL_INTERVAL_SECS", default_value_t = 5)]
    poll_interval: u64,

    /// Seconds to keep polling before reporting "still working".
    #[arg(long, env = "CLIENT_POLL_BUDGET_SECS", default_value_t = 300)]
    poll_budget: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct Target {
    /// recommendations | profile
    #[arg(long, value_parser = parse_kind)]
    kind: JobKind,

    /// Student identifier.
    #[arg(long)]
    subject: String,
}

impl Target {
    fn key(&self) -> Result<JobKey> {
        let key = JobKey::new(self.subject.clone(), self.kind);
        if let Err(reason) = key.validate() {
            bail!("invalid subject: {reason}");
        }
        Ok(key)
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the current state once.
    Status(Target),
    /// Start (or join) a generation and follow it to the end.
    Start(Target),
    /// Follow a generation that is already running, if any.
    Watch(Target),
}

fn parse_kind(raw: &str) -> Result<JobKind, String> {
    JobKind::parse(raw).ok_or_else(|| format!("unknown job kind '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if cli.poll_interval == 0 || cli.poll_budget == 0 {
        bail!("--poll-interval and --poll-budget must be greater than zero");
    }

    let api = HttpGenerationApi::new(&cli.base_url, Duration::from_secs(30))?;
    let client = GenerationClient::new(
        api,
        PollSettings {
            interval: Duration::from_secs(cli.poll_interval),
            budget: Duration::from_secs(cli.poll_budget),
        },
    );

    let view = match &cli.command {
        Commands::Status(target) => client.load(&target.key()?).await?.view,
        Commands::Start(target) => follow(client.start(&target.key()?).await?).await,
        Commands::Watch(target) => {
            let loaded = client.load(&target.key()?).await?;
            match loaded.poll {
                Some(handle) => follow(handle).await,
                None => loaded.view,
            }
        }
    };

    print_view(&view);
    client.stop_all();

    if matches!(view, GenerationView::Failed { .. }) {
        std::process::exit(1);
    }
    Ok(())
}

/// Prints each new in-flight view until the loop settles, or Ctrl-C.
async fn follow(mut handle: PollHandle) -> GenerationView {
    print_view(&handle.view());
    loop {
        tokio::select! {
            next = handle.next_view() => match next {
                Some(view) if view.is_settled() => return view,
                Some(view) => print_view(&view),
                None => return handle.view(),
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("genwatch: stopped watching; the job keeps running on the server");
                return handle.view();
            }
        }
    }
}

fn print_view(view: &GenerationView) {
    match view {
        GenerationView::NotStarted => println!("not started: {}", view.message()),
        GenerationView::InFlight {
            generation_id,
            status,
        } => println!("{status} ({generation_id}): {}", view.message()),
        GenerationView::Completed {
            generation_id,
            result,
        } => {
            println!("completed ({generation_id})");
            match serde_json::to_string_pretty(result) {
                Ok(text) => println!("{text}"),
                Err(e) => eprintln!("genwatch: could not render result: {e}"),
            }
        }
        GenerationView::Failed {
            generation_id,
            error,
        } => println!(
            "failed ({generation_id}): {} [{}]",
            view.message(),
            error.message
        ),
        GenerationView::StillWorking { generation_id } => {
            println!("still working ({generation_id}): {}", view.message())
        }
    }
}
