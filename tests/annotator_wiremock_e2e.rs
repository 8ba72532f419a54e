use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nametag_harness::annotate::{
    annotate_all, AnnotateConfig, AnnotateError, GatewayAnnotator, RunStats, TransientRetry,
};
use nametag_harness::corpus::strip_tags;
use nametag_harness::gateway::openrouter::OpenRouterAdapter;
use nametag_harness::gateway::usage::ProviderCallRecord;
use nametag_harness::gateway::{ChatModel, NoopUsageSink, ProviderGateway, UsageSink};
use nametag_harness::metrics::{equal_labels_ratio, equal_line_ratio};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Tags the first word of each name as GivenName and the rest as Surname.
/// Fails the first `fail_first` calls with a 500.
#[derive(Clone)]
struct TaggingResponder {
    calls: Arc<AtomicUsize>,
    fail_first: usize,
}

impl TaggingResponder {
    fn tag(name: &str) -> String {
        let mut words = name.split_whitespace();
        let mut out = Vec::new();
        if let Some(first) = words.next() {
            out.push(format!("<GivenName>{first}</GivenName>"));
        }
        out.extend(words.map(|w| format!("<Surname>{w}</Surname>")));
        out.join(" ")
    }
}

impl Respond for TaggingResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            return ResponseTemplate::new(500).set_body_json(json!({
                "error": { "message": "transient error", "code": "internal" }
            }));
        }

        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let user = body["messages"][1]["content"].as_str().unwrap();
        let names = user.rsplit("Input names:\n\n").next().unwrap();
        let tagged = names
            .lines()
            .map(Self::tag)
            .collect::<Vec<_>>()
            .join("\n");

        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": tagged }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 100, "completion_tokens": 10 }
        }))
    }
}

fn truth() -> Vec<String> {
    [
        "<GivenName>John</GivenName> <Surname>Smith</Surname>",
        "<GivenName>Laura</GivenName> <Surname>Perlman</Surname>",
        "<GivenName>Ada</GivenName> <Surname>Lovelace</Surname>",
        "<GivenName>Bo</GivenName> <Surname>Li</Surname>",
        "<GivenName>Grace</GivenName> <Surname>Hopper</Surname>",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[tokio::test]
async fn annotates_through_openrouter_with_transient_retry() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(TaggingResponder {
            calls: Arc::clone(&calls),
            fail_first: 1,
        })
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    let gateway = ProviderGateway::new(adapter, Arc::new(NoopUsageSink));
    let annotator = GatewayAnnotator::new(gateway, ChatModel::openrouter("openai/gpt-4o-mini"));

    let examples = vec!["<GivenName>Mary</GivenName> <Surname>Jones</Surname>".to_string()];
    let truth = truth();
    let names: Vec<String> = truth.iter().map(|l| strip_tags(l)).collect();

    let config = AnnotateConfig {
        batch_size: 2,
        transient: TransientRetry::immediate(),
        ..AnnotateConfig::default()
    };
    let run = annotate_all(&annotator, &examples, &names, &config)
        .await
        .unwrap();

    assert_eq!(run.predictions, truth);
    assert_eq!(run.stats.batches, 3);
    assert_eq!(run.stats.transient_retries, 1);
    assert_eq!(run.stats.quality_retries, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(equal_line_ratio(&truth, &run.predictions), 1.0);
    assert_eq!(equal_labels_ratio(&truth, &run.predictions), 1.0);

    let received = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    let user = body["messages"][1]["content"].as_str().unwrap();
    assert!(user.contains(&examples[0]));
    assert!(user.ends_with("John Smith\nLaura Perlman"));
}

/// Serves canned replies in order, repeating the last one.
#[derive(Clone)]
struct SequenceResponder {
    calls: Arc<AtomicUsize>,
    replies: Vec<ResponseTemplate>,
}

impl Respond for SequenceResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies[n.min(self.replies.len() - 1)].clone()
    }
}

fn content(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{ "message": { "content": text }, "finish_reason": "stop" }]
    }))
}

#[derive(Default)]
struct CollectingSink {
    records: Mutex<Vec<ProviderCallRecord>>,
}

#[async_trait]
impl UsageSink for CollectingSink {
    async fn record(&self, record: ProviderCallRecord) {
        self.records.lock().unwrap().push(record);
    }
}

async fn run_two_single_name_batches(
    second: ResponseTemplate,
) -> (Vec<String>, RunStats, Vec<ProviderCallRecord>) {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(SequenceResponder {
            calls: Arc::new(AtomicUsize::new(0)),
            replies: vec![
                content("<GivenName>John</GivenName> <Surname>Smith</Surname>"),
                second,
            ],
        })
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    let sink = Arc::new(CollectingSink::default());
    let gateway = ProviderGateway::new(adapter, Arc::clone(&sink));
    let annotator = GatewayAnnotator::new(gateway, ChatModel::openrouter("openai/gpt-4o-mini"));

    let config = AnnotateConfig {
        batch_size: 1,
        max_quality_retries: 1,
        transient: TransientRetry::immediate(),
        ..AnnotateConfig::default()
    };
    let names = vec!["John Smith".to_string(), "Laura Perlman".to_string()];
    let run = annotate_all(&annotator, &[], &names, &config)
        .await
        .unwrap();

    let records = sink.records.lock().unwrap().clone();
    (run.predictions, run.stats, records)
}

#[tokio::test]
async fn refused_batch_is_padded_and_the_run_completes() {
    let (predictions, stats, records) =
        run_two_single_name_batches(content("I cannot annotate these names.")).await;

    assert_eq!(
        predictions,
        vec![
            "<GivenName>John</GivenName> <Surname>Smith</Surname>".to_string(),
            String::new(),
        ]
    );
    assert_eq!(stats.quality_retries, 1);
    assert_eq!(stats.repaired_batches, 1);

    let batches: Vec<Option<usize>> = records.iter().map(|r| r.batch_index).collect();
    assert_eq!(batches, vec![Some(0), Some(1), Some(1)]);
    assert_eq!(records[1].error_code.as_deref(), Some("refused"));
}

#[tokio::test]
async fn non_json_body_is_padded_and_the_run_completes() {
    let html = ResponseTemplate::new(200).set_body_string("<html>gateway</html>");
    let (predictions, stats, records) = run_two_single_name_batches(html).await;

    assert_eq!(predictions.len(), 2);
    assert_eq!(predictions[1], "");
    assert_eq!(stats.repaired_batches, 1);
    assert_eq!(stats.transient_retries, 0);
    assert_eq!(records.len(), 3);
    assert_eq!(records[2].error_code.as_deref(), Some("malformed_response"));
}

#[tokio::test]
async fn rejected_credentials_stop_the_run() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "No auth credentials found", "code": 401 }
        })))
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    let gateway = ProviderGateway::new(adapter, Arc::new(NoopUsageSink));
    let annotator = GatewayAnnotator::new(gateway, ChatModel::openrouter("openai/gpt-4o-mini"));

    let config = AnnotateConfig {
        transient: TransientRetry::immediate(),
        ..AnnotateConfig::default()
    };
    let names = vec!["John Smith".to_string()];
    let err = annotate_all(&annotator, &[], &names, &config)
        .await
        .unwrap_err();

    assert!(matches!(err, AnnotateError::Provider { batch_index: 0, .. }), "{err}");
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
