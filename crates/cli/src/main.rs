// Filebus CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json output formats for scripting.
// Design Decision: Talk to queue directories directly; there is no server to call.

mod commands;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "filebus")]
#[command(about = "Filebus CLI - Create, inspect, feed and drain file-system queues")]
#[command(version)]
pub struct Cli {
    /// Directory holding one subdirectory per queue
    #[arg(long, env = "FILEBUS_BASE_DIRECTORY", default_value = "filebus-data")]
    pub base_dir: PathBuf,

    /// Output format
    #[arg(long, short, value_enum, default_value_t = output::OutputFormat::Text)]
    pub output: output::OutputFormat,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create queue directories
    CreateQueue {
        /// Queue names
        #[arg(required = true)]
        queues: Vec<String>,
    },

    /// Show record counts per queue
    Depth {
        /// Queue names
        #[arg(required = true)]
        queues: Vec<String>,
    },

    /// Send a message to a queue
    Send {
        /// Destination queue
        queue: String,

        /// Message body
        body: String,

        /// Message id (generated if omitted)
        #[arg(long)]
        id: Option<String>,

        /// Message type
        #[arg(long = "type")]
        message_type: Option<String>,

        /// Extra header, repeatable
        #[arg(long = "header", short = 'H', value_parser = commands::send::parse_header)]
        headers: Vec<(String, String)>,

        /// Discard the message if not received within this span (e.g. 30, 00:05:00)
        #[arg(long, value_parser = parse_span)]
        ttl: Option<Duration>,

        /// Deliver no earlier than this span from now
        #[arg(long, value_parser = parse_span)]
        defer: Option<Duration>,
    },

    /// Consume a queue until Ctrl-C
    Run {
        /// Queue to consume
        queue: String,

        /// Desired number of readers
        #[arg(long, short, default_value = "1")]
        workers: usize,

        /// Concurrent reads, primary reader included
        #[arg(long, default_value = "4")]
        parallelism: usize,

        /// Forward every message to this queue in the receive transaction
        #[arg(long)]
        forward: Option<String>,
    },

    /// Push a batch of messages through a scratch queue and report throughput
    Showdown {
        /// Number of messages
        #[arg(long, short, default_value = "1000")]
        messages: u64,

        /// Desired number of readers
        #[arg(long, short, default_value = "4")]
        workers: usize,

        /// Concurrent reads, primary reader included
        #[arg(long, default_value = "4")]
        parallelism: usize,

        /// Simulated handler duration (e.g. 0.05, 00:00:01)
        #[arg(long, value_parser = parse_span, default_value = "0")]
        handler_delay: Duration,

        /// Keep the scratch queue directory afterwards
        #[arg(long)]
        keep: bool,
    },
}

fn parse_span(value: &str) -> Result<Duration, String> {
    filebus::transport::parse_time_span(value)
        .ok_or_else(|| format!("'{}' is not a time span, use seconds or [d.]hh:mm[:ss]", value))
}

fn init_tracing(quiet: bool) {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let default_filter = if quiet {
        "warn".to_string()
    } else {
        format!("filebus={level},filebus_cli={level}")
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.quiet);
    let output_format = cli.output;

    match cli.command {
        Commands::CreateQueue { queues } => {
            commands::queues::create(&cli.base_dir, &queues, output_format, cli.quiet)
        }
        Commands::Depth { queues } => {
            commands::queues::depth(&cli.base_dir, &queues, output_format).await
        }
        Commands::Send {
            queue,
            body,
            id,
            message_type,
            headers,
            ttl,
            defer,
        } => {
            let request = commands::send::SendRequest {
                queue,
                body,
                id,
                message_type,
                headers,
                ttl,
                defer,
            };
            commands::send::run(&cli.base_dir, request, output_format, cli.quiet).await
        }
        Commands::Run {
            queue,
            workers,
            parallelism,
            forward,
        } => {
            let options = filebus::BusOptions::new(cli.base_dir.clone())
                .with_input_queue(queue)
                .with_number_of_workers(workers)
                .with_max_read_parallelism(parallelism);
            commands::run::run(options, forward, output_format, cli.quiet).await
        }
        Commands::Showdown {
            messages,
            workers,
            parallelism,
            handler_delay,
            keep,
        } => {
            let settings = commands::showdown::ShowdownSettings {
                messages,
                workers,
                parallelism,
                handler_delay,
                keep,
            };
            commands::showdown::run(&cli.base_dir, settings, output_format, cli.quiet).await
        }
    }
}
