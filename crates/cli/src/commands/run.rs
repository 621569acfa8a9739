// Run command - consume a queue until interrupted

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use filebus::prelude::*;
use tracing::info;

use crate::output::{print_field, OutputFormat};

pub async fn run(
    options: BusOptions,
    forward: Option<String>,
    output: OutputFormat,
    quiet: bool,
) -> Result<()> {
    let transport = Arc::new(FileSystemTransport::from_options(&options)?);
    if let Some(target) = &forward {
        transport.create_queue(target)?;
    }

    let handled = Arc::new(AtomicU64::new(0));
    let pipeline = {
        let transport = Arc::clone(&transport);
        let handled = Arc::clone(&handled);
        HandlerPipeline::new(move |ctx: IncomingContext| {
            let transport = Arc::clone(&transport);
            let handled = Arc::clone(&handled);
            let forward = forward.clone();
            async move {
                let label = ctx.message.label();
                if let Some(target) = forward {
                    transport
                        .send(&target, ctx.message.clone(), Some(ctx.transaction.as_ref()))
                        .await?;
                }

                if output.is_text() && !quiet {
                    println!("{}\t{}", label, String::from_utf8_lossy(&ctx.message.body));
                } else if !output.is_text() {
                    println!(
                        "{}",
                        serde_json::json!({
                            "label": label,
                            "headers": ctx.message.headers,
                            "body": String::from_utf8_lossy(&ctx.message.body),
                        })
                    );
                }
                handled.fetch_add(1, Ordering::Relaxed);
                Ok::<(), anyhow::Error>(())
            }
        })
    };

    let coordinator = WorkersCoordinatorFactory::new(options).create(transport, Arc::new(pipeline))?;
    info!(queue = %coordinator.name(), "Consuming, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    coordinator.stop().await?;

    if output.is_text() && !quiet {
        print_field("Handled", &handled.load(Ordering::Relaxed).to_string());
    }
    Ok(())
}
