use std::future::Future;

use anyhow::Result;
use tracing::{error, warn};

/// Split a comma-separated recipient list into chat IDs.
/// Malformed entries are logged and skipped.
pub fn parse_recipients(kind: &str, list: &str) -> Vec<i64> {
    list.split(',')
        .map(str::trim)
        .filter_map(|entry| match entry.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("[{}] invalid recipient ID: {:?}", kind, entry);
                None
            }
        })
        .collect()
}

/// Spawn one detached send per recipient and return how many were started.
///
/// Nobody waits on the spawned tasks: a failed send is logged and dropped,
/// and shutting the server down does not cancel sends already in flight.
pub fn fan_out<F, Fut>(kind: &'static str, recipients: &[i64], send: F) -> usize
where
    F: Fn(i64) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    for &id in recipients {
        let fut = send(id);
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                error!("[{}] send to {} failed: {:#}", kind, id, e);
            }
        });
    }
    recipients.len()
}
