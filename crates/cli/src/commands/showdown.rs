// Showdown command - fill a scratch queue behind an idle coordinator, then scale it up and drain

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use filebus::prelude::*;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::output::{print_field, OutputFormat};

const PROGRESS_TEMPLATE: &str =
    "   {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})";

pub struct ShowdownSettings {
    pub messages: u64,
    pub workers: usize,
    pub parallelism: usize,
    pub handler_delay: Duration,
    pub keep: bool,
}

#[derive(Debug, Serialize)]
struct ShowdownReport {
    queue: String,
    messages: u64,
    workers: usize,
    parallelism: usize,
    send_ms: u128,
    receive_ms: u128,
    sends_per_sec: f64,
    receives_per_sec: f64,
}

fn progress_bar(len: u64, quiet: bool) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(PROGRESS_TEMPLATE)?
            .progress_chars("=>-"),
    );
    Ok(pb)
}

fn per_second(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

pub async fn run(
    base_dir: &Path,
    settings: ShowdownSettings,
    output: OutputFormat,
    quiet: bool,
) -> Result<()> {
    if settings.workers == 0 {
        anyhow::bail!("--workers must be at least 1, nothing would drain the queue");
    }
    let queue = format!("showdown-{}", Uuid::now_v7().simple());
    let quiet_progress = quiet || !output.is_text();

    // Phase 1: start a coordinator with no readers, then fill its queue
    let options = BusOptions::new(base_dir)
        .with_input_queue(queue.clone())
        .with_number_of_workers(0)
        .with_max_read_parallelism(settings.parallelism);
    let transport = Arc::new(FileSystemTransport::from_options(&options)?);

    let handled = Arc::new(AtomicU64::new(0));
    let handler_delay = settings.handler_delay;
    let pipeline = {
        let handled = Arc::clone(&handled);
        HandlerPipeline::new(move |_ctx: IncomingContext| {
            let handled = Arc::clone(&handled);
            async move {
                if !handler_delay.is_zero() {
                    tokio::time::sleep(handler_delay).await;
                }
                handled.fetch_add(1, Ordering::Relaxed);
                Ok::<(), anyhow::Error>(())
            }
        })
    };
    let coordinator =
        WorkersCoordinatorFactory::new(options).create(transport.clone(), Arc::new(pipeline))?;

    let pb = progress_bar(settings.messages, quiet_progress)?;
    let send_start = Instant::now();
    for i in 0..settings.messages {
        let message = TransportMessage::new(BTreeMap::new(), format!("{{\"n\":{}}}", i).into_bytes())
            .with_header(headers::MESSAGE_ID, format!("showdown-{}", i))
            .with_header(headers::MESSAGE_TYPE, "showdown.Ping");
        transport.send(&queue, message, None).await?;
        pb.inc(1);
    }
    let send_elapsed = send_start.elapsed();
    pb.finish_and_clear();
    info!(queue = %queue, messages = settings.messages, "Queue filled, starting readers");

    // Phase 2: raise the worker count and drain
    let pb = progress_bar(settings.messages, quiet_progress)?;
    let receive_start = Instant::now();
    coordinator.set_max_workers(settings.workers);

    loop {
        let done = handled.load(Ordering::Relaxed);
        pb.set_position(done);
        if done >= settings.messages {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let receive_elapsed = receive_start.elapsed();
    pb.finish_and_clear();

    coordinator.stop().await?;

    if !settings.keep {
        let dir = base_dir.join(&queue);
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            warn!(path = %dir.display(), error = %e, "Could not remove scratch queue");
        }
    }

    let report = ShowdownReport {
        queue,
        messages: settings.messages,
        workers: settings.workers,
        parallelism: settings.parallelism,
        send_ms: send_elapsed.as_millis(),
        receive_ms: receive_elapsed.as_millis(),
        sends_per_sec: per_second(settings.messages, send_elapsed),
        receives_per_sec: per_second(settings.messages, receive_elapsed),
    };

    if output.is_text() {
        print_field("Queue", &report.queue);
        print_field("Messages", &report.messages.to_string());
        print_field("Workers", &report.workers.to_string());
        print_field("Send", &format!("{} ms ({:.0}/s)", report.send_ms, report.sends_per_sec));
        print_field(
            "Receive",
            &format!("{} ms ({:.0}/s)", report.receive_ms, report.receives_per_sec),
        );
        return Ok(());
    }

    output
        .print_value(&report)
        .context("failed to print showdown report")
}
