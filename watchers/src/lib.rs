// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

//! Multiplexes the single operation pub/sub channel into per-operation watchers.
//!
//! Each watcher carries an expiration instant. Operation messages fan out to every watcher on
//! the channel (resetting their deadlines); an `expire` message sweeps watchers whose deadline
//! has passed, delivering a terminal `None` observation. A done operation is delivered exactly
//! once per watcher, after which the channel entry is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use remexec::Operation;
use task_executor::Executor;

///
/// An observation delivered to a watcher: a stripped Operation for each state transition, or
/// `None` when the watcher expired without observing a terminal state.
///
/// Returning an Err unwatches this watcher only; other watchers on the channel continue.
///
pub type Observer = Box<dyn FnMut(Option<Operation>) -> Result<(), String> + Send>;

struct Watcher {
    id: u64,
    expires_at: Instant,
    sender: mpsc::UnboundedSender<Option<Operation>>,
}

struct Inner {
    channels: Mutex<HashMap<String, Vec<Watcher>>>,
    next_id: AtomicU64,
    ttl: Duration,
    executor: Executor,
}

impl Inner {
    fn unwatch(&self, channel: &str, id: u64) {
        let mut channels = self.channels.lock();
        if let Some(watchers) = channels.get_mut(channel) {
            watchers.retain(|watcher| watcher.id != id);
            if watchers.is_empty() {
                channels.remove(channel);
            }
        }
    }
}

///
/// A handle to a registered watcher. Dropping it cancels the watch.
///
#[derive(Debug)]
pub struct WatchHandle {
    inner: Weak<Inner>,
    channel: String,
    id: u64,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unwatch(&self.channel, self.id);
        }
    }
}

#[derive(Clone)]
pub struct WatcherHub {
    inner: Arc<Inner>,
}

impl WatcherHub {
    pub fn new(executor: Executor, ttl: Duration) -> WatcherHub {
        WatcherHub {
            inner: Arc::new(Inner {
                channels: Mutex::default(),
                next_id: AtomicU64::new(0),
                ttl,
                executor,
            }),
        }
    }

    ///
    /// The deadline applied to a watcher each time a message is delivered to it. Pluggable in
    /// principle; the policy here is a fixed TTL from now, with `reset_watchers` extending it
    /// under heartbeats.
    ///
    pub fn next_expires_at(&self) -> Instant {
        Instant::now() + self.inner.ttl
    }

    ///
    /// Registers a watcher on a channel. The observer runs on the hub's executor; deliveries to
    /// one watcher are serialized and in order.
    ///
    pub fn watch(&self, channel: &str, mut observer: Observer) -> WatchHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, mut receiver) = mpsc::unbounded_channel::<Option<Operation>>();

        let inner = Arc::downgrade(&self.inner);
        let task_channel = channel.to_owned();
        self.inner.executor.native_spawn(async move {
            while let Some(message) = receiver.recv().await {
                let terminal = message.is_none() || matches!(&message, Some(op) if op.done);
                if let Err(e) = observer(message) {
                    log::warn!("Watcher on {task_channel} failed and was removed: {e}");
                    if let Some(inner) = inner.upgrade() {
                        inner.unwatch(&task_channel, id);
                    }
                    break;
                }
                if terminal {
                    break;
                }
            }
        });

        let watcher = Watcher {
            id,
            expires_at: self.next_expires_at(),
            sender,
        };
        let mut channels = self.inner.channels.lock();
        let watchers = channels.entry(channel.to_owned()).or_default();
        if watchers.is_empty() {
            log::debug!("First watcher for {channel}: subscribing");
        }
        watchers.push(watcher);

        WatchHandle {
            inner: Arc::downgrade(&self.inner),
            channel: channel.to_owned(),
            id,
        }
    }

    pub fn unwatch(&self, handle: &WatchHandle) {
        self.inner.unwatch(&handle.channel, handle.id);
    }

    ///
    /// Handles one pub/sub message for a channel.
    ///
    /// An Operation fans out to every watcher on the channel and resets their deadlines; a done
    /// Operation also removes them (exactly-once terminal delivery). An expire sweeps only the
    /// watchers whose deadline has passed, delivering the terminal `None`.
    ///
    pub fn on_operation(&self, channel: &str, operation: &Operation) {
        let next_expires_at = self.next_expires_at();
        let mut channels = self.inner.channels.lock();
        let Some(watchers) = channels.get_mut(channel) else {
            return;
        };
        for watcher in watchers.iter_mut() {
            let _ = watcher.sender.send(Some(operation.clone()));
            watcher.expires_at = next_expires_at;
        }
        if operation.done {
            channels.remove(channel);
        }
    }

    pub fn on_expire(&self, channel: &str, now: Instant) {
        let mut channels = self.inner.channels.lock();
        let Some(watchers) = channels.get_mut(channel) else {
            return;
        };
        watchers.retain(|watcher| {
            if watcher.expires_at <= now {
                let _ = watcher.sender.send(None);
                false
            } else {
                true
            }
        });
        if watchers.is_empty() {
            log::debug!("Last watcher for {channel} expired: unsubscribing");
            channels.remove(channel);
        }
    }

    ///
    /// Extends the deadline of every watcher on a channel; used by keep-alive heartbeats while
    /// an operation sits in the prequeue transform.
    ///
    pub fn reset_watchers(&self, channel: &str, new_expires_at: Instant) {
        if let Some(watchers) = self.inner.channels.lock().get_mut(channel) {
            for watcher in watchers.iter_mut() {
                watcher.expires_at = new_expires_at;
            }
        }
    }

    ///
    /// Channels with at least one expired watcher, for the periodic sweep to publish `expire`
    /// messages at.
    ///
    pub fn expired_watched_operation_channels(&self, now: Instant) -> Vec<String> {
        self.inner
            .channels
            .lock()
            .iter()
            .filter(|(_, watchers)| watchers.iter().any(|watcher| watcher.expires_at <= now))
            .map(|(channel, _)| channel.clone())
            .collect()
    }

    ///
    /// The channels currently carrying watchers.
    ///
    pub fn watched_channels(&self) -> Vec<String> {
        self.inner.channels.lock().keys().cloned().collect()
    }

    pub fn watcher_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map(|watchers| watchers.len())
            .unwrap_or(0)
    }
}
