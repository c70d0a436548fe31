//! Backend reporting with bounded retries.

use std::time::Duration;

use tracing::warn;

use lazyaf_core::ResourceId;
use lazyaf_core::control::{LogReport, LogReportLine, StatusReport, StepControlConfig};

const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_millis(500);

/// What a report attempt concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Delivered,
    /// 404: the step is already terminal on the backend.
    Terminal,
    /// Retries exhausted or the request was rejected.
    Dropped,
}

impl ReportOutcome {
    pub fn is_terminal(&self) -> bool {
        *self == ReportOutcome::Terminal
    }
}

#[derive(Clone)]
pub struct Reporter {
    client: reqwest::Client,
    base_url: String,
    step_execution_id: ResourceId,
    token: String,
}

impl Reporter {
    pub fn new(config: &StepControlConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.callback_url.trim_end_matches('/').to_string(),
            step_execution_id: config.step_execution_id,
            token: config.step_token.clone(),
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/api/steps/{}/{suffix}",
            self.base_url, self.step_execution_id
        )
    }

    /// POST with capped exponential backoff on 5xx. 4xx are final: a 404
    /// means the step is terminal, anything else is dropped with a log.
    async fn post_json<T: serde::Serialize>(&self, suffix: &str, body: &T) -> ReportOutcome {
        let url = self.url(suffix);
        let mut backoff = BASE_BACKOFF;
        for attempt in 1..=MAX_ATTEMPTS {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.token)
                .json(body)
                .send()
                .await;
            match response {
                Ok(resp) if resp.status().is_success() => return ReportOutcome::Delivered,
                Ok(resp) if resp.status().as_u16() == 404 => return ReportOutcome::Terminal,
                Ok(resp) if resp.status().is_client_error() => {
                    warn!(%url, status = %resp.status(), "report rejected");
                    return ReportOutcome::Dropped;
                }
                Ok(resp) => {
                    warn!(%url, status = %resp.status(), attempt, "server error, retrying");
                }
                Err(e) => {
                    warn!(%url, error = %e, attempt, "report failed, retrying");
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(8));
            }
        }
        ReportOutcome::Dropped
    }

    pub async fn post_status(
        &self,
        status: &str,
        exit_code: Option<i32>,
        message: Option<&str>,
    ) -> ReportOutcome {
        self.post_json(
            "status",
            &StatusReport {
                status: status.to_string(),
                exit_code,
                message: message.map(String::from),
            },
        )
        .await
    }

    pub async fn post_logs(&self, lines: Vec<(i64, String)>) -> ReportOutcome {
        let report = LogReport {
            lines: lines
                .into_iter()
                .map(|(seq, content)| LogReportLine { seq, content })
                .collect(),
        };
        self.post_json("logs", &report).await
    }

    pub async fn post_heartbeat(&self) -> ReportOutcome {
        self.post_json("heartbeat", &serde_json::json!({})).await
    }
}
