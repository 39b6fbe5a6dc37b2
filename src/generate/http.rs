/// HTTP generation client
///
/// Talks to a remote generation backend over `POST {base}/v1/generate`.
/// Transient failures (connect errors, timeouts, 5xx) are retried with
/// exponential backoff and jitter; 4xx responses fail fast.
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::{Candidate, GenerationRequest, ScriptGenerator};
use crate::config::GeneratorConfig;
use crate::error::{IncantError, Result};

pub struct HttpGenerator {
    client: reqwest::Client,
    base_url: String,
    retries: u32,
    backoff: Duration,
}

impl HttpGenerator {
    pub fn new(base_url: impl Into<String>, config: &GeneratorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|err| IncantError::Network(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retries: config.retries,
            backoff: config.backoff(),
        })
    }

    async fn attempt(&self, request: &GenerationRequest) -> std::result::Result<Candidate, Attempt> {
        let url = format!("{}/v1/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() || err.is_connect() {
                    Attempt::Transient(format!("request failed: {err}"))
                } else {
                    Attempt::Fatal(format!("request failed: {err}"))
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Attempt::Transient(format!("backend returned {status}")));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Attempt::Transient("backend returned 429".into()));
        }
        if !status.is_success() {
            return Err(Attempt::Fatal(format!("backend returned {status}")));
        }

        response
            .json::<Candidate>()
            .await
            .map_err(|err| Attempt::Fatal(format!("malformed backend response: {err}")))
    }
}

enum Attempt {
    Transient(String),
    Fatal(String),
}

#[async_trait]
impl ScriptGenerator for HttpGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Candidate> {
        let mut last_error = String::new();

        for attempt in 0..=self.retries {
            if attempt > 0 {
                let backoff = self.backoff * 2u32.saturating_pow(attempt - 1);
                let jitter = rand::rng().random_range(0..=backoff.as_millis() as u64 / 2);
                let delay = backoff + Duration::from_millis(jitter);
                debug!(
                    operation = "generate",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying generation request"
                );
                tokio::time::sleep(delay).await;
            }

            match self.attempt(request).await {
                Ok(candidate) => return Ok(candidate),
                Err(Attempt::Fatal(reason)) => {
                    warn!(
                        operation = "generate",
                        status = "error",
                        "generation request failed: {reason}"
                    );
                    return Err(IncantError::Network(reason));
                }
                Err(Attempt::Transient(reason)) => {
                    debug!(
                        operation = "generate",
                        attempt, "transient generation failure: {reason}"
                    );
                    last_error = reason;
                }
            }
        }

        Err(IncantError::Network(format!(
            "generation failed after {} attempts: {last_error}",
            self.retries + 1
        )))
    }
}
