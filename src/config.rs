// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::Deserialize;

use backplane::BackplaneConfig;
use scheduler::InstanceOptions;
use worker::WorkerOptions;

///
/// The top-level config file shape shared by both server roles; each binary reads the sections
/// it needs.
///
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FarmConfig {
    pub port: u16,
    pub instance: InstanceSection,
    pub backplane: BackplaneSection,
    pub workers: Vec<WorkerSection>,
}

impl FarmConfig {
    pub fn load(path: &Path) -> Result<FarmConfig, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {path:?}: {e}"))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config {path:?}: {e}"))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstanceSection {
    pub name: String,
    pub transform_tokens: usize,
    pub cache_check_deadline_secs: u64,
    pub queueing_poll_period_secs: u64,
    pub retry_cache_ttl_secs: u64,
    pub watcher_ttl_secs: u64,
    pub expire_sweep_interval_secs: u64,
    pub monitor_interval_secs: u64,
    pub requeue_attempt_budget: usize,
}

impl Default for InstanceSection {
    fn default() -> InstanceSection {
        let defaults = InstanceOptions::default();
        InstanceSection {
            name: defaults.instance_name,
            transform_tokens: defaults.transform_tokens,
            cache_check_deadline_secs: defaults.cache_check_deadline.as_secs(),
            queueing_poll_period_secs: defaults.queueing_poll_period.as_secs(),
            retry_cache_ttl_secs: defaults.retry_cache_ttl.as_secs(),
            watcher_ttl_secs: defaults.watcher_ttl.as_secs(),
            expire_sweep_interval_secs: defaults.expire_sweep_interval.as_secs(),
            monitor_interval_secs: defaults.monitor_interval.as_secs(),
            requeue_attempt_budget: defaults.requeue_attempt_budget,
        }
    }
}

impl From<InstanceSection> for InstanceOptions {
    fn from(section: InstanceSection) -> InstanceOptions {
        InstanceOptions {
            instance_name: section.name,
            transform_tokens: section.transform_tokens,
            cache_check_deadline: Duration::from_secs(section.cache_check_deadline_secs),
            queueing_poll_period: Duration::from_secs(section.queueing_poll_period_secs),
            retry_cache_ttl: Duration::from_secs(section.retry_cache_ttl_secs),
            watcher_ttl: Duration::from_secs(section.watcher_ttl_secs),
            expire_sweep_interval: Duration::from_secs(section.expire_sweep_interval_secs),
            monitor_interval: Duration::from_secs(section.monitor_interval_secs),
            requeue_attempt_budget: section.requeue_attempt_budget,
            ..InstanceOptions::default()
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackplaneSection {
    pub prequeue_capacity: usize,
    pub queue_capacity: usize,
    pub dispatch_deadline_secs: u64,
    pub max_completed_operations: usize,
    pub worker_set_cache_ttl_ms: u64,
}

impl Default for BackplaneSection {
    fn default() -> BackplaneSection {
        let defaults = BackplaneConfig::default();
        BackplaneSection {
            prequeue_capacity: defaults.prequeue_capacity,
            queue_capacity: defaults.queue_capacity,
            dispatch_deadline_secs: defaults.dispatch_deadline_ms / 1000,
            max_completed_operations: defaults.max_completed_operations,
            worker_set_cache_ttl_ms: defaults.worker_set_cache_ttl_ms,
        }
    }
}

impl From<BackplaneSection> for BackplaneConfig {
    fn from(section: BackplaneSection) -> BackplaneConfig {
        BackplaneConfig {
            prequeue_capacity: section.prequeue_capacity,
            queue_capacity: section.queue_capacity,
            dispatch_deadline_ms: section.dispatch_deadline_secs * 1000,
            max_completed_operations: section.max_completed_operations,
            worker_set_cache_ttl_ms: section.worker_set_cache_ttl_ms,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSection {
    pub name: String,
    pub cache_root: PathBuf,
    pub exec_root: PathBuf,
    pub max_cache_size_bytes: usize,
    pub input_fetch_width: usize,
    pub execute_width: usize,
    pub report_width: usize,
    pub poll_period_secs: u64,
    pub default_timeout_secs: u64,
    pub link_input_directories: bool,
}

impl Default for WorkerSection {
    fn default() -> WorkerSection {
        let defaults = WorkerOptions::default();
        WorkerSection {
            name: defaults.name,
            cache_root: PathBuf::from("/var/cache/buildfarm/cas"),
            exec_root: PathBuf::from("/var/cache/buildfarm/exec"),
            max_cache_size_bytes: cas_cache::CacheOptions::default().max_size_bytes,
            input_fetch_width: defaults.input_fetch_width,
            execute_width: defaults.execute_width,
            report_width: defaults.report_width,
            poll_period_secs: defaults.poll_period.as_secs(),
            default_timeout_secs: defaults.default_timeout.as_secs(),
            link_input_directories: defaults.link_input_directories,
        }
    }
}

impl From<WorkerSection> for WorkerOptions {
    fn from(section: WorkerSection) -> WorkerOptions {
        WorkerOptions {
            name: section.name,
            input_fetch_width: section.input_fetch_width,
            execute_width: section.execute_width,
            report_width: section.report_width,
            poll_period: Duration::from_secs(section.poll_period_secs),
            default_timeout: Duration::from_secs(section.default_timeout_secs),
            link_input_directories: section.link_input_directories,
            ..WorkerOptions::default()
        }
    }
}
