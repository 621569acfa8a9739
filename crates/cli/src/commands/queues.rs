// Queue management commands

use std::path::Path;

use anyhow::Result;
use filebus::prelude::*;
use serde::Serialize;

use crate::output::{print_field, OutputFormat, Table};

/// Record counts of one queue, by visibility
#[derive(Debug, Clone, Serialize)]
pub struct QueueDepth {
    pub queue: String,
    pub ready: usize,
    pub deferred: usize,
    pub claimed: usize,
    pub error: usize,
}

pub fn create(base_dir: &Path, queues: &[String], output: OutputFormat, quiet: bool) -> Result<()> {
    let store = FileRecordStore::new(base_dir);
    let mut created = Vec::with_capacity(queues.len());
    for queue in queues {
        let dir = store.ensure_queue(queue)?;
        created.push(serde_json::json!({ "queue": queue, "path": dir }));
        if output.is_text() && !quiet {
            print_field(queue, &dir.display().to_string());
        }
    }

    output.print_value(&serde_json::json!({ "data": created, "total": created.len() }))
}

pub async fn depth(base_dir: &Path, queues: &[String], output: OutputFormat) -> Result<()> {
    let store = FileRecordStore::new(base_dir);
    let mut depths = Vec::with_capacity(queues.len());
    for queue in queues {
        let dir = store.ensure_queue(queue)?;
        depths.push(QueueDepth {
            queue: queue.clone(),
            ready: store.count(&dir, Visibility::Ready).await?,
            deferred: store.count(&dir, Visibility::Deferred).await?,
            claimed: store.count(&dir, Visibility::Claimed).await?,
            error: store.count(&dir, Visibility::Error).await?,
        });
    }

    if output.is_text() {
        let table = Table::new(&[("QUEUE", 24), ("READY", 8), ("DEFERRED", 8), ("CLAIMED", 8), ("ERROR", 8)]);
        for d in &depths {
            let counts = [d.ready, d.deferred, d.claimed, d.error].map(|n| n.to_string());
            let mut cells = vec![d.queue.as_str()];
            cells.extend(counts.iter().map(String::as_str));
            table.row(&cells);
        }
        return Ok(());
    }

    output.print_value(&serde_json::json!({ "data": depths, "total": depths.len() }))
}
