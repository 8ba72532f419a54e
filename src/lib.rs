#![forbid(unsafe_code)]

//! # nametag-harness
//!
//! Benchmark harness for LLM-based person-name tagging.
//!
//! A labeled corpus of names (`<GivenName>John</GivenName> <Surname>Smith</Surname>`)
//! is split into a small, label-balanced example set and a test set. The
//! examples go into the prompt; the test names are sent to the model in
//! batches with their tags stripped, and the model output is validated,
//! retried and length-reconciled so predictions line up with the truth.
//!
//! - [`sampler`]: rarest-label-first example selection with a seeded RNG
//! - [`annotate`]: batching, transient/quality retries, order-preserving merge
//! - [`validate`]: batch-level syntax gate for model output
//! - [`gateway`]: OpenRouter chat client behind the [`ChatGateway`] trait

pub mod annotate;
pub mod corpus;
pub mod gateway;
pub mod metrics;
pub mod prompts;
pub mod sampler;
pub mod validate;

pub use annotate::{
    annotate_all, AnnotateConfig, AnnotateError, AnnotationRun, Annotator, GatewayAnnotator,
    RunStats, TransientRetry,
};
pub use corpus::{extract_labels, load_corpus, CorpusError};
pub use gateway::{ChatGateway, ProviderError, ProviderGateway, UsageSink};
pub use sampler::{select_examples, SelectionConfig};
pub use validate::{has_invalid_syntax, LabelSet};
