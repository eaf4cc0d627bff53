use anyhow::Result;
use reqwest::blocking::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backoff::{BackoffPolicy, Sleeper, ThreadSleeper};
use crate::cli::HealthArgs;
use crate::config::load_config;
use crate::error::CutoverError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub passed: bool,
    pub attempts: u32,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl HealthCheckResult {
    pub fn summary(&self) -> String {
        match (self.passed, &self.last_error) {
            (true, _) => format!("healthy after {} attempt(s)", self.attempts),
            (false, Some(err)) => format!("unhealthy after {} attempt(s): {err}", self.attempts),
            (false, None) => format!("unhealthy after {} attempt(s)", self.attempts),
        }
    }
}

/// Accepts a JSON body whose `status` field equals `expected`.
pub fn status_predicate(expected: &str) -> impl Fn(&JsonValue) -> bool + '_ {
    move |body: &JsonValue| body.get("status").and_then(JsonValue::as_str) == Some(expected)
}

pub struct HealthProber {
    client: HttpClient,
    sleeper: Arc<dyn Sleeper + Send + Sync>,
}

impl HealthProber {
    pub fn new(attempt_timeout: Duration) -> Result<Self> {
        let client = HttpClient::builder().timeout(attempt_timeout).build()?;
        Ok(Self {
            client,
            sleeper: Arc::new(ThreadSleeper),
        })
    }

    #[cfg(test)]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper + Send + Sync>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Polls `url` until `accept` passes or `policy.max_attempts` attempts are used.
    pub fn probe(
        &self,
        url: &str,
        policy: &BackoffPolicy,
        accept: impl Fn(&JsonValue) -> bool,
    ) -> HealthCheckResult {
        let max_attempts = policy.max_attempts.max(1);
        tracing::debug!(
            url,
            max_attempts,
            max_wait_ms = policy.max_total_delay().as_millis() as u64,
            "health probe started"
        );
        let mut last_latency = None;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let started = Instant::now();
            let outcome = self.attempt(url, &accept);
            last_latency = Some(started.elapsed().as_millis() as u64);
            match outcome {
                Ok(()) => {
                    tracing::info!(url, attempt, "health probe passed");
                    return HealthCheckResult {
                        passed: true,
                        attempts: attempt,
                        last_latency_ms: last_latency,
                        last_error: None,
                    };
                }
                Err(err) => {
                    tracing::warn!(url, attempt, max_attempts, error = %err, "health probe failed");
                    last_error = Some(err);
                }
            }
            if attempt < max_attempts {
                self.sleeper.sleep(policy.delay_after(attempt));
            }
        }

        HealthCheckResult {
            passed: false,
            attempts: max_attempts,
            last_latency_ms: last_latency,
            last_error,
        }
    }

    fn attempt(&self, url: &str, accept: &impl Fn(&JsonValue) -> bool) -> Result<(), String> {
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|err| format!("unreachable: {err}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("returned {status}"));
        }
        let body = resp
            .text()
            .map_err(|err| format!("failed to read body: {err}"))?;
        let parsed: JsonValue = serde_json::from_str(&body)
            .map_err(|err| format!("body is not JSON ({err}): {}", body.trim()))?;
        if !accept(&parsed) {
            return Err(format!("body rejected: {}", body.trim()));
        }
        Ok(())
    }
}

pub fn handle(args: HealthArgs, config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let health = &config.release.health;
    let url = args.url.unwrap_or_else(|| health.url.clone());
    let prober = HealthProber::new(health.attempt_timeout())?;
    let result = prober.probe(&url, &health.backoff(), status_predicate(&health.expected_status));
    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{url}: {}", result.summary());
    }
    if !result.passed {
        return Err(CutoverError::HealthGateFailed {
            attempts: result.attempts,
            detail: result.summary(),
        }
        .into());
    }
    Ok(())
}
