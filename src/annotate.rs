//! Batch annotation through an LLM oracle.
//!
//! Inputs are cut into fixed-size batches and each batch is sent to an
//! [`Annotator`]. Two failure kinds are handled differently:
//!
//! - **Transient** provider failures ([`ProviderError::is_retryable`]) are
//!   retried after a backoff and never consume the quality budget. By default
//!   there is no ceiling; [`TransientRetry::max_attempts`] adds one.
//! - **Quality** failures (wrong line count, too many malformed lines, a
//!   refusal or an unparseable response body) are retried up to
//!   `max_quality_retries` times. After that the batch output is truncated or
//!   padded with empty strings to the batch length.
//!
//! Only errors no retry can fix (missing key, rejected credentials, a request
//! the provider will never accept) end the run early. Otherwise the result
//! has exactly one prediction per input, in input order, even when batches
//! run concurrently.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, FinishReason, ProviderError};
use crate::prompts::{PromptTemplate, DEFAULT_PROMPT};
use crate::validate::{has_invalid_syntax, LabelSet, DEFAULT_INVALID_THRESHOLD};

// =============================================================================
// Oracle
// =============================================================================

/// One request/response round trip with the annotation service.
///
/// Returns the raw model text, expected to hold one tagged line per name.
/// `batch_index` identifies the batch for attribution only.
#[async_trait]
pub trait Annotator: Send + Sync {
    async fn annotate_once(
        &self,
        batch_index: usize,
        examples: &[String],
        names: &[String],
    ) -> Result<String, ProviderError>;
}

/// [`Annotator`] backed by a chat gateway.
pub struct GatewayAnnotator<G: ChatGateway> {
    gateway: G,
    model: ChatModel,
    template: PromptTemplate,
    labels: LabelSet,
    temperature: f32,
    max_tokens: Option<u32>,
    run_id: Uuid,
}

impl<G: ChatGateway> GatewayAnnotator<G> {
    pub fn new(gateway: G, model: ChatModel) -> Self {
        Self {
            gateway,
            model,
            template: DEFAULT_PROMPT,
            labels: LabelSet::person_names(),
            temperature: 0.0,
            max_tokens: None,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn with_labels(mut self, labels: LabelSet) -> Self {
        self.labels = labels;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

#[async_trait]
impl<G: ChatGateway> Annotator for GatewayAnnotator<G> {
    async fn annotate_once(
        &self,
        batch_index: usize,
        examples: &[String],
        names: &[String],
    ) -> Result<String, ProviderError> {
        let prompt = self.template.render(&self.labels, examples, names);
        debug!(
            template = prompt.template_slug,
            prompt_chars = prompt.len(),
            batch = batch_index,
            names = names.len(),
            "Sending annotation request"
        );

        let mut request = ChatRequest::new(
            self.model.clone(),
            prompt.to_messages(),
            Attribution::new("annotate::batch")
                .with_run(self.run_id)
                .with_batch(batch_index),
        )
        .temperature(self.temperature);
        if let Some(max) = self.max_tokens {
            request = request.max_tokens(max);
        }

        let response = self.gateway.chat(request).await?;
        if response.finish_reason == FinishReason::Length {
            warn!(
                output_tokens = response.output_tokens,
                "Annotation output hit the token limit"
            );
        }
        Ok(response.content)
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Backoff policy for transient provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransientRetry {
    /// Wait before retrying, and the base for exponential growth.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Retries allowed per batch for transient failures; `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Double the delay after each consecutive failure.
    #[serde(default)]
    pub exponential: bool,
    /// Upper bound for any single wait, including provider `retry-after` hints.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    10_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

impl Default for TransientRetry {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_attempts: None,
            exponential: false,
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl TransientRetry {
    /// No waiting at all. Intended for tests and local fakes.
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_attempts: None,
            exponential: false,
            max_delay_ms: 0,
        }
    }

    /// Wait before retry number `attempt` (0-based) after `err`.
    pub fn delay(&self, attempt: u32, err: &ProviderError) -> Duration {
        let base = Duration::from_millis(self.base_delay_ms);
        let delay = if self.exponential {
            base.saturating_mul(2u32.saturating_pow(attempt.min(16)))
        } else {
            base
        };
        let delay = match err.retry_after() {
            Some(hint) => delay.max(hint),
            None => delay,
        };
        delay.min(Duration::from_millis(self.max_delay_ms))
    }
}

/// Settings for [`annotate_all`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotateConfig {
    /// Inputs per oracle call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Re-requests allowed per batch for malformed output.
    #[serde(default = "default_max_quality_retries")]
    pub max_quality_retries: u32,
    /// Share of bad lines at which a batch output is rejected.
    #[serde(default = "default_invalid_threshold")]
    pub invalid_threshold: f64,
    /// Batches in flight at once. Output order does not depend on it.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub valid_labels: LabelSet,
    #[serde(default)]
    pub transient: TransientRetry,
}

fn default_batch_size() -> usize {
    20
}

fn default_max_quality_retries() -> u32 {
    3
}

fn default_invalid_threshold() -> f64 {
    DEFAULT_INVALID_THRESHOLD
}

fn default_concurrency() -> usize {
    1
}

impl Default for AnnotateConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_quality_retries: default_max_quality_retries(),
            invalid_threshold: default_invalid_threshold(),
            concurrency: default_concurrency(),
            valid_labels: LabelSet::default(),
            transient: TransientRetry::default(),
        }
    }
}

impl AnnotateConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self, AnnotateError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AnnotateError::Config(format!("reading {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| AnnotateError::Config(format!("parsing {}: {e}", path.display())))
    }

    fn validate(&self) -> Result<(), AnnotateError> {
        if self.batch_size == 0 {
            return Err(AnnotateError::Config("batch_size must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.invalid_threshold) {
            return Err(AnnotateError::Config(format!(
                "invalid_threshold must be within [0, 1], got {}",
                self.invalid_threshold
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Errors and results
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AnnotateError {
    #[error("invalid annotation config: {0}")]
    Config(String),
    /// Provider failure no retry can fix (auth, config, rejected request).
    #[error("batch {batch_index}: {source}")]
    Provider {
        batch_index: usize,
        #[source]
        source: ProviderError,
    },
    /// Transient failures exceeded [`TransientRetry::max_attempts`].
    #[error("batch {batch_index}: gave up after {attempts} transient failures: {source}")]
    TransientExhausted {
        batch_index: usize,
        attempts: u32,
        #[source]
        source: ProviderError,
    },
}

/// Counters for one [`annotate_all`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub batches: usize,
    pub quality_retries: u32,
    pub transient_retries: u32,
    /// Batches padded or truncated after the quality budget ran out.
    pub repaired_batches: usize,
    /// Batches kept despite failing the syntax gate on every attempt.
    pub accepted_invalid_batches: usize,
    pub elapsed_ms: u64,
}

/// Predictions aligned 1:1 with the inputs, plus run counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationRun {
    pub predictions: Vec<String>,
    pub stats: RunStats,
}

#[derive(Debug)]
struct BatchOutcome {
    lines: Vec<String>,
    quality_retries: u32,
    transient_retries: u32,
    repaired: bool,
    accepted_invalid: bool,
}

// =============================================================================
// Pipeline
// =============================================================================

/// Split raw model output into lines: trimmed, without blanks or code fences.
pub fn parse_output_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("```"))
        .map(str::to_string)
        .collect()
}

/// Truncate or pad with empty strings to exactly `len` lines.
pub fn reconcile_length(mut lines: Vec<String>, len: usize) -> Vec<String> {
    lines.resize(len, String::new());
    lines
}

/// Annotate every input, preserving order and length.
pub async fn annotate_all<A: Annotator + ?Sized>(
    annotator: &A,
    examples: &[String],
    inputs: &[String],
    config: &AnnotateConfig,
) -> Result<AnnotationRun, AnnotateError> {
    config.validate()?;
    let start = Instant::now();
    let total_batches = inputs.len().div_ceil(config.batch_size);

    info!(
        inputs = inputs.len(),
        batches = total_batches,
        batch_size = config.batch_size,
        concurrency = config.concurrency.max(1),
        "Starting annotation"
    );

    // `buffered` yields in submission order, so predictions line up with
    // inputs whatever order the batches finish in.
    let outcomes = stream::iter(inputs.chunks(config.batch_size).enumerate())
        .map(|(index, batch)| annotate_batch(annotator, examples, batch, index, config))
        .buffered(config.concurrency.max(1));
    futures::pin_mut!(outcomes);

    let mut predictions = Vec::with_capacity(inputs.len());
    let mut stats = RunStats::default();

    while let Some(outcome) = outcomes.next().await {
        let outcome = outcome?;
        stats.batches += 1;
        stats.quality_retries += outcome.quality_retries;
        stats.transient_retries += outcome.transient_retries;
        stats.repaired_batches += usize::from(outcome.repaired);
        stats.accepted_invalid_batches += usize::from(outcome.accepted_invalid);
        predictions.extend(outcome.lines);
        debug!(
            done = stats.batches,
            total = total_batches,
            "Batch merged"
        );
    }

    stats.elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
        predictions = predictions.len(),
        quality_retries = stats.quality_retries,
        transient_retries = stats.transient_retries,
        repaired = stats.repaired_batches,
        elapsed_ms = stats.elapsed_ms,
        "Annotation complete"
    );

    Ok(AnnotationRun { predictions, stats })
}

async fn annotate_batch<A: Annotator + ?Sized>(
    annotator: &A,
    examples: &[String],
    batch: &[String],
    batch_index: usize,
    config: &AnnotateConfig,
) -> Result<BatchOutcome, AnnotateError> {
    let mut quality_retries = 0u32;
    let mut transient_retries = 0u32;

    loop {
        let lines = match annotator.annotate_once(batch_index, examples, batch).await {
            Ok(raw) => parse_output_lines(&raw),
            Err(err) if err.is_output_failure() => {
                debug!(
                    batch = batch_index,
                    error_code = err.code(),
                    error = %err,
                    "Unusable model response, treating as empty output"
                );
                Vec::new()
            }
            Err(err) if err.is_retryable() => {
                if config
                    .transient
                    .max_attempts
                    .is_some_and(|max| transient_retries >= max)
                {
                    return Err(AnnotateError::TransientExhausted {
                        batch_index,
                        attempts: transient_retries + 1,
                        source: err,
                    });
                }
                let delay = config.transient.delay(transient_retries, &err);
                transient_retries += 1;
                warn!(
                    batch = batch_index,
                    attempt = transient_retries,
                    error_code = err.code(),
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Transient provider failure, retrying batch"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
            Err(err) => {
                return Err(AnnotateError::Provider {
                    batch_index,
                    source: err,
                })
            }
        };

        let length_ok = lines.len() == batch.len();
        let syntax_ok = !has_invalid_syntax(&lines, &config.valid_labels, config.invalid_threshold);

        if length_ok && syntax_ok {
            return Ok(BatchOutcome {
                lines,
                quality_retries,
                transient_retries,
                repaired: false,
                accepted_invalid: false,
            });
        }

        if quality_retries < config.max_quality_retries {
            quality_retries += 1;
            debug!(
                batch = batch_index,
                retry = quality_retries,
                expected = batch.len(),
                got = lines.len(),
                syntax_ok,
                "Malformed batch output, re-requesting"
            );
            continue;
        }

        if !length_ok {
            warn!(
                batch = batch_index,
                expected = batch.len(),
                got = lines.len(),
                "Quality retries exhausted, reconciling output length"
            );
        }
        if !syntax_ok {
            warn!(
                batch = batch_index,
                "Quality retries exhausted, keeping output that failed the syntax gate"
            );
        }

        return Ok(BatchOutcome {
            lines: reconcile_length(lines, batch.len()),
            quality_retries,
            transient_retries,
            repaired: !length_ok,
            accepted_invalid: !syntax_ok,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_lines_are_trimmed_and_fences_dropped() {
        let raw = "```xml\n  <GivenName>A</GivenName>  \n\n<Surname>B</Surname>\n```\n";
        assert_eq!(
            parse_output_lines(raw),
            vec!["<GivenName>A</GivenName>", "<Surname>B</Surname>"]
        );
    }

    #[test]
    fn reconcile_pads_and_truncates() {
        let lines = vec!["a".to_string(), "b".to_string()];
        assert_eq!(reconcile_length(lines.clone(), 3), vec!["a", "b", ""]);
        assert_eq!(reconcile_length(lines.clone(), 1), vec!["a"]);
        assert_eq!(reconcile_length(lines, 2), vec!["a", "b"]);
    }

    #[test]
    fn fixed_backoff_ignores_attempt_number() {
        let policy = TransientRetry::default();
        let err = ProviderError::provider("openrouter", "502", true);
        assert_eq!(policy.delay(0, &err), Duration::from_secs(10));
        assert_eq!(policy.delay(5, &err), Duration::from_secs(10));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = TransientRetry {
            base_delay_ms: 1_000,
            max_attempts: Some(5),
            exponential: true,
            max_delay_ms: 5_000,
        };
        let err = ProviderError::provider("openrouter", "502", true);
        assert_eq!(policy.delay(0, &err), Duration::from_secs(1));
        assert_eq!(policy.delay(2, &err), Duration::from_secs(4));
        assert_eq!(policy.delay(3, &err), Duration::from_secs(5));
        assert_eq!(policy.delay(40, &err), Duration::from_secs(5));
    }

    #[test]
    fn retry_after_hint_extends_the_wait() {
        let policy = TransientRetry::default();
        let err = ProviderError::rate_limited(
            Duration::from_secs(30),
            crate::gateway::ErrorContext::new(),
        );
        assert_eq!(policy.delay(0, &err), Duration::from_secs(30));
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: AnnotateConfig = serde_json::from_str(r#"{"batch_size": 5}"#).unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.max_quality_retries, 3);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.transient, TransientRetry::default());
        assert!(config.valid_labels.contains("Surname"));
    }
}
