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

//! The liveness heartbeat for claimed work.
//!
//! A Poller periodically runs a predicate (typically the backplane's `poll_operation`, renewing
//! a dispatch deadline). If the predicate reports the claim lost, `on_failure` fires and the
//! poller stops; if the absolute expiration passes first, `on_expiration` fires instead.
//! `pause` stops cleanly with neither callback. A Poller holds at most one active task;
//! resuming while active is an error.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;

use task_executor::Executor;

struct ActivePoll {
    stop: watch::Sender<bool>,
    generation: u64,
}

#[derive(Clone)]
pub struct Poller {
    executor: Executor,
    active: Arc<Mutex<Option<ActivePoll>>>,
    generation: Arc<Mutex<u64>>,
}

impl Poller {
    pub fn new(executor: Executor) -> Poller {
        Poller {
            executor,
            active: Arc::default(),
            generation: Arc::default(),
        }
    }

    ///
    /// Starts polling: every `period`, run `predicate`; a false result means the claim was lost
    /// (`on_failure` fires, polling stops). If `expires_at` passes before either a pause or a
    /// failure, `on_expiration` fires and polling stops.
    ///
    pub fn resume<P, Fut>(
        &self,
        period: Duration,
        expires_at: Instant,
        predicate: P,
        on_failure: Box<dyn FnOnce() + Send>,
        on_expiration: Box<dyn FnOnce() + Send>,
    ) -> Result<(), String>
    where
        P: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err("Poller is already active".to_owned());
        }

        let generation = {
            let mut generation = self.generation.lock();
            *generation += 1;
            *generation
        };
        let (stop, mut stopped) = watch::channel(false);
        *active = Some(ActivePoll { stop, generation });

        let active_slot = self.active.clone();
        self.executor.native_spawn(async move {
            let mut next_wakeup = Instant::now() + period;
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = tokio::time::sleep_until(next_wakeup.into()) => {
                        if Instant::now() >= expires_at {
                            on_expiration();
                            break;
                        }
                        let renewed = predicate().await;
                        // A pause that raced the predicate wins: no callback fires.
                        if *stopped.borrow() {
                            break;
                        }
                        if !renewed {
                            on_failure();
                            break;
                        }
                        next_wakeup += period;
                    }
                }
            }
            // Only clear our own registration: a pause/resume pair may already have installed a
            // newer poll.
            let mut active = active_slot.lock();
            if active.as_ref().map(|a| a.generation) == Some(generation) {
                active.take();
            }
        });
        Ok(())
    }

    ///
    /// Stops the active poll cleanly. No callback fires. A no-op if nothing is active.
    ///
    pub fn pause(&self) {
        if let Some(active) = self.active.lock().take() {
            let _ = active.stop.send(true);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }
}
