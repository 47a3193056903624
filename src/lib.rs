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

//! Farm assembly: configuration loading and the wiring of backplane, frontend instance, and
//! workers into a running process.

use std::sync::Arc;

use backplane::{Backplane, BackplaneConfig, MemoryBackplane, StaticCasResolver};
use cas_cache::CacheOptions;
use scheduler::{Instance, InstanceOptions};
use task_executor::Executor;
use worker::{Worker, WorkerOptions};

pub mod config;

pub use crate::config::FarmConfig;

///
/// A fully wired farm process. Depending on the role config this holds a frontend instance,
/// workers, or both, all sharing one backplane and CAS routing table.
///
pub struct Farm {
    pub backplane: Arc<MemoryBackplane>,
    pub resolver: Arc<StaticCasResolver>,
    pub instance: Option<Instance>,
    pub workers: Vec<Worker>,
}

impl Farm {
    ///
    /// Builds a farm from config. `with_instance` controls whether the frontend scheduler is
    /// constructed; workers come from the config's worker sections.
    ///
    pub async fn build(
        config: &FarmConfig,
        executor: Executor,
        with_instance: bool,
    ) -> Result<Farm, String> {
        let backplane_config: BackplaneConfig = config.backplane.clone().into();
        let backplane = Arc::new(MemoryBackplane::new(backplane_config));
        let resolver = Arc::new(StaticCasResolver::new());

        let instance = if with_instance {
            let options: InstanceOptions = config.instance.clone().into();
            Some(Instance::new(
                backplane.clone() as Arc<dyn Backplane>,
                resolver.clone(),
                executor.clone(),
                options,
            ))
        } else {
            None
        };

        let mut workers = Vec::with_capacity(config.workers.len());
        for worker_config in &config.workers {
            let options: WorkerOptions = worker_config.clone().into();
            let cache_options = CacheOptions {
                max_size_bytes: worker_config.max_cache_size_bytes,
                ..CacheOptions::default()
            };
            let worker = Worker::new(
                backplane.clone() as Arc<dyn Backplane>,
                resolver.clone(),
                executor.clone(),
                worker_config.cache_root.clone(),
                worker_config.exec_root.clone(),
                cache_options,
                options,
            )
            .await?;
            resolver.register(worker.name(), worker.cas_node());
            workers.push(worker);
        }

        Ok(Farm {
            backplane,
            resolver,
            instance,
            workers,
        })
    }

    pub async fn start(&self) -> Result<(), String> {
        if let Some(instance) = &self.instance {
            instance.start().await;
        }
        for worker in &self.workers {
            worker
                .start()
                .await
                .map_err(|e| format!("Failed to start worker {}: {e}", worker.name()))?;
            log::info!("Worker {} started", worker.name());
        }
        Ok(())
    }

    pub async fn stop(&self) {
        for worker in &self.workers {
            if let Err(e) = worker.stop().await {
                log::warn!("Failed to stop worker {}: {e}", worker.name());
            }
        }
        if let Some(instance) = &self.instance {
            instance.stop();
        }
    }
}

#[cfg(test)]
mod tests;
