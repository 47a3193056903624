// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::future::Future;
use std::time::Duration;

use rand::{thread_rng, Rng};

use remexec::{Code, Status};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const BACKOFF_MULTIPLIER: u32 = 2;
const JITTER_RATIO: f64 = 0.1;
const MAX_ATTEMPTS: u32 = 5;

/// Transient errors a retry can plausibly outwait. Structural failures (bad arguments, decode
/// errors, missing inputs) surface immediately.
fn is_transient(status: &Status) -> bool {
    matches!(
        status.code,
        Code::Aborted | Code::ResourceExhausted | Code::Unavailable | Code::Unknown
    )
}

///
/// Retry a backplane operation with capped exponential backoff and jitter: 100 ms doubling to
/// 5 s, ±10 %, five attempts in total.
///
pub async fn with_retries<T, F, Fut>(description: &str, f: F) -> Result<T, Status>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, Status>>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut last_error: Option<Status> = None;

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let jitter = 1.0 - JITTER_RATIO + thread_rng().gen::<f64>() * JITTER_RATIO * 2.0;
            let sleep_time = backoff.mul_f64(jitter).min(MAX_BACKOFF);
            tokio::time::sleep(sleep_time).await;
            backoff = (backoff * BACKOFF_MULTIPLIER).min(MAX_BACKOFF);
        }

        match f().await {
            Ok(value) => return Ok(value),
            Err(status) if is_transient(&status) => {
                log::debug!(
                    "Transient failure of {description} (attempt {}): {status}",
                    attempt + 1
                );
                last_error = Some(status);
            }
            Err(status) => return Err(status),
        }
    }

    let status = last_error.expect("at least one attempt was made");
    log::warn!("{description} failed after {MAX_ATTEMPTS} attempts: {status}");
    Err(status)
}
