//! Subcommand handlers. Every handler prints JSON to stdout.

use color_eyre::eyre::{eyre, Result, WrapErr};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use offline_sync::engine::SyncOutcome;
use offline_sync::{OfflineClient, RecordType, SyncAction};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn parse_payload(raw: Option<&str>) -> Result<Option<Value>> {
  raw
    .map(|s| serde_json::from_str(s).wrap_err_with(|| format!("payload is not valid JSON: {}", s)))
    .transpose()
}

pub async fn stats(client: &OfflineClient) -> Result<()> {
  print_json(&client.get_offline_stats().await)
}

pub async fn enqueue(
  client: &OfflineClient,
  action: SyncAction,
  endpoint: &str,
  payload: Option<&str>,
  record: Option<&str>,
) -> Result<()> {
  let payload = parse_payload(payload)?;
  let id = match record {
    Some(record_id) => {
      if client.records().get(record_id).await.is_none() {
        return Err(eyre!("no offline record with id {}", record_id));
      }
      client
        .add_record_to_sync_queue(record_id, action, endpoint, payload.as_ref())
        .await?
    }
    None => client.add_to_sync_queue(action, endpoint, payload.as_ref()).await?,
  };
  print_json(&json!({ "id": id, "queue_length": client.queue().len().await }))
}

/// Store a record, optionally queueing a create for it in the same call.
pub async fn record_add(client: &OfflineClient, record_type: &str, payload: &str, sync_to: Option<&str>) -> Result<()> {
  let payload = parse_payload(Some(payload))?.unwrap_or(Value::Null);
  let id = client.store_offline_data(record_type, &payload).await?;

  let queued = match sync_to {
    Some(endpoint) => Some(
      client
        .add_record_to_sync_queue(&id, SyncAction::Create, endpoint, Some(&payload))
        .await?,
    ),
    None => None,
  };
  print_json(&json!({ "id": id, "queued": queued }))
}

pub async fn record_list(client: &OfflineClient, record_type: Option<&str>, unsynced: bool) -> Result<()> {
  let records = if unsynced {
    client.records().list_unsynced().await
  } else {
    let record_type = record_type.map(RecordType::from);
    client.get_offline_data(record_type.as_ref()).await
  };
  print_json(&records)
}

pub async fn cache_get(client: &OfflineClient, key: &str) -> Result<()> {
  let value: Option<Value> = client.get_cached_data(key).await;
  print_json(&json!({ "key": key, "value": value }))
}

pub async fn cache_set(client: &OfflineClient, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
  let value = parse_payload(Some(value))?.unwrap_or(Value::Null);
  client
    .cache_data(key, &value, ttl_secs.map(Duration::from_secs))
    .await?;
  print_json(&json!({ "key": key, "stored": true }))
}

pub async fn cache_sweep(client: &OfflineClient) -> Result<()> {
  let report = client.cache().sweep().await?;
  print_json(&json!({
    "expired": report.expired,
    "stale": report.stale,
    "evicted": report.evicted,
    "corrupt": report.corrupt,
    "remaining": report.remaining,
  }))
}

pub async fn cache_clear(client: &OfflineClient) -> Result<()> {
  client.cache().clear().await?;
  print_json(&json!({ "cleared": true }))
}

/// One drain, reported together with the stats afterwards.
pub async fn sync(client: &OfflineClient) -> Result<()> {
  let outcome = client.sync_now().await;
  let report = match outcome {
    Some(SyncOutcome::Drained { cycles, report }) => json!({ "cycles": cycles, "report": report }),
    Some(SyncOutcome::Coalesced) => json!({ "coalesced": true }),
    None => json!({ "skipped": "offline" }),
  };
  print_json(&json!({ "sync": report, "stats": client.get_offline_stats().await }))
}

/// Run the background loop until ctrl-c.
pub async fn run(client: &OfflineClient) -> Result<()> {
  let (tx, rx) = watch::channel(false);
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      info!("shutdown requested");
    }
    let _ = tx.send(true);
  });

  client.run(rx).await;
  print_json(&client.get_offline_stats().await)
}
