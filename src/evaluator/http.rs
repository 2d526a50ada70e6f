//! Reference evaluator driving model endpoints over HTTP.
//!
//! One non-streaming chat-completion call per (model, item), scored against
//! an item bank supplied at construction. Status codes classify into the
//! retryable/fatal split the worker's retry policy expects: 429 and 5xx are
//! transient, 401/403 and malformed responses are not.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{EvalError, EvalSample, EvalSink, Evaluator};
use crate::plan::{ModelSpec, Plan, ProviderKind, ScoringMethod};

/// One benchmark item. `subject` uses the taxonomy's `Coarse/fine` form.
#[derive(Debug, Clone, Deserialize)]
pub struct EvalItem {
    pub prompt: String,
    pub reference: String,
    pub subject: String,
    #[serde(default)]
    pub skill: Option<String>,
    #[serde(default)]
    pub dataset: Option<String>,
}

/// The items this evaluator can draw from. Datasets are deployment inputs;
/// an empty bank renders the evaluator unavailable rather than inventing
/// questions.
#[derive(Debug, Default)]
pub struct ItemBank {
    items: Vec<EvalItem>,
}

impl ItemBank {
    pub fn new(items: Vec<EvalItem>) -> Self {
        Self { items }
    }

    /// Load a JSON array of items from disk.
    pub fn from_json_file(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("item bank {}: {e}", path.display()))?;
        let items: Vec<EvalItem> = serde_json::from_str(&raw)
            .map_err(|e| format!("item bank {}: {e}", path.display()))?;
        Ok(Self::new(items))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Deterministic selection: the pool for the requested subjects, rotated
    /// by the seed, cycled up to `n` items. Same (subjects, n, seed) always
    /// yields the same sequence.
    pub fn select(&self, subjects: &[String], n: u32, seed: Option<u64>) -> Vec<&EvalItem> {
        let pool: Vec<&EvalItem> = self
            .items
            .iter()
            .filter(|item| subjects.iter().any(|s| s == &item.subject))
            .collect();
        if pool.is_empty() {
            return Vec::new();
        }
        let offset = (seed.unwrap_or(0) as usize) % pool.len();
        (0..n as usize).map(|k| pool[(offset + k) % pool.len()]).collect()
    }
}

pub struct HttpEvaluator {
    client: Client,
    bank: ItemBank,
}

impl HttpEvaluator {
    pub fn new(bank: ItemBank) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build HTTP client");
        Self { client, bank }
    }

    async fn query_model(
        &self,
        model: &ModelSpec,
        credential: Option<&str>,
        prompt: &str,
        call_timeout: Duration,
    ) -> Result<String, EvalError> {
        let (body, builder) = match model.provider_kind {
            ProviderKind::OpenaiCompatible => {
                let body = serde_json::json!({
                    "model": model.name,
                    "messages": [{"role": "user", "content": prompt}],
                    "stream": false,
                });
                let mut builder = self
                    .client
                    .post(&model.endpoint)
                    .header("Content-Type", "application/json");
                if let Some(key) = credential {
                    builder = builder.header("Authorization", format!("Bearer {key}"));
                }
                (body, builder)
            }
            ProviderKind::Anthropic => {
                let body = serde_json::json!({
                    "model": model.name,
                    "max_tokens": 1024,
                    "messages": [{"role": "user", "content": prompt}],
                });
                let mut builder = self
                    .client
                    .post(&model.endpoint)
                    .header("anthropic-version", "2023-06-01")
                    .header("Content-Type", "application/json");
                if let Some(key) = credential {
                    builder = builder.header("x-api-key", key);
                }
                (body, builder)
            }
        };

        let response = tokio::time::timeout(call_timeout, builder.json(&body).send())
            .await
            .map_err(|_| EvalError::retryable(format!("{}: provider call timed out", model.name)))?
            .map_err(|e| {
                // Transport failures (connect, TLS, reset) are transient.
                EvalError::retryable(format!("{}: request failed: {e}", model.name))
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(EvalError::fatal(format!(
                "{}: authentication failed (HTTP {status})",
                model.name
            )));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EvalError::retryable(format!("{}: rate limited", model.name)));
        }
        if status.is_server_error() {
            return Err(EvalError::retryable(format!(
                "{}: provider returned HTTP {status}",
                model.name
            )));
        }
        if !status.is_success() {
            return Err(EvalError::fatal(format!(
                "{}: provider returned HTTP {status}",
                model.name
            )));
        }

        let payload: serde_json::Value = response.json().await.map_err(|e| {
            EvalError::fatal(format!("{}: unparseable provider response: {e}", model.name))
        })?;

        let text = match model.provider_kind {
            ProviderKind::OpenaiCompatible => parse_openai_content(&payload),
            ProviderKind::Anthropic => parse_anthropic_content(&payload),
        };
        text.ok_or_else(|| {
            EvalError::fatal(format!("{}: provider response missing content", model.name))
        })
    }
}

#[async_trait]
impl Evaluator for HttpEvaluator {
    async fn evaluate(
        &self,
        plan: &Plan,
        credentials: &HashMap<String, String>,
        sink: EvalSink,
        cancel: CancellationToken,
    ) -> Result<(), EvalError> {
        if plan.directives.scoring_method == ScoringMethod::Judge {
            return Err(EvalError::fatal(
                "judge scoring requires an external judge model",
            ));
        }

        let items = self.bank.select(
            &plan.profile.subject_types,
            plan.profile.sample_size,
            plan.profile.seed,
        );
        if items.is_empty() {
            return Err(EvalError::fatal(
                "no benchmark items available for the requested subjects",
            ));
        }

        let call_timeout = Duration::from_secs(plan.directives.call_timeout_secs);
        let batch = plan.directives.batch_size.max(1) as u64;
        let total = items.len() as u64 * plan.models.len() as u64;
        let mut done = 0u64;

        for model in &plan.models {
            let credential = credentials.get(&model.name).map(String::as_str);
            for (index, item) in items.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(EvalError::fatal("cancelled"));
                }

                let answer = self
                    .query_model(model, credential, &item.prompt, call_timeout)
                    .await?;
                let correctness =
                    score(plan.directives.scoring_method, &answer, &item.reference);

                let delivered = sink
                    .emit(EvalSample {
                        model_name: model.name.clone(),
                        sample_index: index as u32,
                        prompt: item.prompt.clone(),
                        answer,
                        correctness,
                        skill_label: item.skill.clone(),
                        target_label: Some(plan.profile.target_type.as_str().to_string()),
                        subject_label: Some(item.subject.clone()),
                        task_label: Some(plan.profile.task_type.as_str().to_string()),
                        dataset_name: item.dataset.clone(),
                        metadata: None,
                    })
                    .await;
                if !delivered {
                    return Err(EvalError::fatal("sink closed"));
                }

                done += 1;
                if done % batch == 0 || done == total {
                    sink.progress(((done * 100) / total.max(1)) as u8).await;
                }
            }
        }

        Ok(())
    }

    fn available(&self) -> bool {
        !self.bank.is_empty()
    }
}

/// Score an answer against the reference. Comparison is over normalized
/// text: trimmed, lowercased, whitespace collapsed.
pub fn score(method: ScoringMethod, answer: &str, reference: &str) -> f64 {
    let answer = normalize(answer);
    let reference = normalize(reference);
    let correct = match method {
        ScoringMethod::ExactMatch => answer == reference,
        ScoringMethod::Contains => answer.contains(&reference),
        // Unreachable through evaluate(); kept total for direct callers.
        ScoringMethod::Judge => false,
    };
    if correct { 1.0 } else { 0.0 }
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn parse_openai_content(payload: &serde_json::Value) -> Option<String> {
    payload["choices"][0]["message"]["content"]
        .as_str()
        .map(|s| s.to_string())
}

fn parse_anthropic_content(payload: &serde_json::Value) -> Option<String> {
    payload["content"][0]["text"].as_str().map(|s| s.to_string())
}
