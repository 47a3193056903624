// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::sync::Arc;
use std::time::{Duration, Instant};

use backplane::{channel_operation_name, SubscriptionError};

use crate::InstanceInner;

///
/// Drives the operation pub/sub subscription into the WatcherHub. A subscription that lags or
/// breaks re-resolves every watched operation from the operations hash once it is
/// re-established, so watchers never miss a terminal state across a gap.
///
pub(crate) fn spawn_subscriber(
    inner: Arc<InstanceInner>,
    initial_subscription: Option<backplane::OperationSubscription>,
) {
    let mut initial_subscription = initial_subscription;
    inner.executor.clone().native_spawn(async move {
        let mut stopped = inner.stopped.clone();
        loop {
            if *stopped.borrow() {
                break;
            }
            let mut subscription = match initial_subscription.take() {
                Some(subscription) => subscription,
                None => match inner.backplane.subscribe().await {
                    Ok(subscription) => subscription,
                    Err(e) => {
                        log::warn!("Failed to subscribe to the operation channel: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
            };

            loop {
                let message = tokio::select! {
                    _ = stopped.changed() => return,
                    message = subscription.next() => message,
                };
                match message {
                    Ok((channel, backplane::OperationChange::Operation(operation))) => {
                        inner.hub.on_operation(&channel, &operation);
                    }
                    Ok((channel, backplane::OperationChange::Expire)) => {
                        inner.hub.on_expire(&channel, Instant::now());
                    }
                    Err(SubscriptionError::Lagged(skipped)) => {
                        log::warn!(
                            "Operation subscription lagged by {skipped} messages; re-resolving watchers"
                        );
                        resolve_watched_operations(&inner).await;
                    }
                    Err(SubscriptionError::Closed) => {
                        log::warn!("Operation subscription closed; reconnecting");
                        break;
                    }
                }
            }
            // On reconnect, watcher state may be arbitrarily stale.
            resolve_watched_operations(&inner).await;
        }
    });
}

///
/// Re-reads the operations hash for every watched channel and replays the current state into
/// the hub. Terminal operations observed this way deliver (exactly once) and drop their
/// watchers.
///
async fn resolve_watched_operations(inner: &Arc<InstanceInner>) {
    for channel in inner.hub.watched_channels() {
        let Some(operation_name) = channel_operation_name(&channel) else {
            continue;
        };
        match inner.backplane.get_operation(operation_name).await {
            Ok(Some(operation)) => inner.hub.on_operation(&channel, &operation.stripped()),
            Ok(None) => {
                log::debug!("Watched operation {operation_name} no longer exists; expiring");
                inner.hub.reset_watchers(&channel, Instant::now());
                inner.hub.on_expire(&channel, Instant::now());
            }
            Err(e) => log::warn!("Failed to re-resolve {operation_name}: {e}"),
        }
    }
}

///
/// Periodically publishes `expire` at channels carrying past-deadline watchers, so every shard
/// (this one included) sweeps them with a terminal observation.
///
pub(crate) fn spawn_expire_sweeper(inner: Arc<InstanceInner>) {
    inner.executor.clone().native_spawn(async move {
        let mut stopped = inner.stopped.clone();
        loop {
            tokio::select! {
                _ = stopped.changed() => break,
                _ = tokio::time::sleep(inner.options.expire_sweep_interval) => {}
            }
            if *stopped.borrow() {
                break;
            }
            for channel in inner.hub.expired_watched_operation_channels(Instant::now()) {
                if let Err(e) = inner.backplane.publish_expire(&channel).await {
                    log::warn!("Failed to publish expire at {channel}: {e}");
                }
            }
        }
    });
}
