// Send command - write one message into a queue

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use filebus::prelude::*;
use uuid::Uuid;

use crate::output::{print_field, OutputFormat};

pub struct SendRequest {
    pub queue: String,
    pub body: String,
    pub id: Option<String>,
    pub message_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub ttl: Option<Duration>,
    pub defer: Option<Duration>,
}

/// Parse a `name=value` header argument
pub fn parse_header(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("'{}' is not a header, expected name=value", value)),
    }
}

pub async fn run(base_dir: &Path, request: SendRequest, output: OutputFormat, quiet: bool) -> Result<()> {
    let transport = FileSystemTransport::one_way(base_dir)?;

    let id = request.id.unwrap_or_else(|| Uuid::now_v7().to_string());
    let mut message = TransportMessage::new(BTreeMap::new(), request.body.into_bytes())
        .with_header(headers::MESSAGE_ID, id.as_str());
    if let Some(message_type) = &request.message_type {
        message = message.with_header(headers::MESSAGE_TYPE, message_type.as_str());
    }
    for (name, value) in request.headers {
        message = message.with_header(name, value);
    }
    if let Some(ttl) = request.ttl {
        message = message.with_time_to_be_received(ttl);
    }
    let deliver_at = match request.defer {
        Some(defer) => {
            let due = Utc::now() + chrono::Duration::from_std(defer).context("defer span too large")?;
            message = message.with_deferred_until(due);
            Some(due)
        }
        None => None,
    };

    transport.send(&request.queue, message, None).await?;
    tracing::debug!(queue = %request.queue, message_id = %id, "Message sent");

    if output.is_text() {
        if !quiet {
            print_field("Queue", &request.queue);
            print_field("Message ID", &id);
            if let Some(due) = deliver_at {
                print_field("Deliver at", &due.to_rfc3339());
            }
        }
        return Ok(());
    }

    output.print_value(&serde_json::json!({
        "queue": request.queue,
        "message_id": id,
        "deliver_at": deliver_at,
    }))
}
