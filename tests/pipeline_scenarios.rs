//! End-to-end pipeline scenarios: notification batch in, ingest POSTs and a
//! failure report out. The object store is in-memory and the sink is a mock
//! HTTP server.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use logtap::config::SinkSettings;
use logtap::errors::{LogtapError, Result};
use logtap::pipeline::run::{Forwarder, NotificationBatch, NotificationMessage};
use logtap::pipeline::RemainingTime;
use logtap::rules::{forwarding, processing, ForwardingRuleIndex, ProcessingRuleIndex};
use logtap::s3::{FetchedObject, ObjectStore};
use logtap::sink::credentials::StaticTokenProvider;
use logtap::sink::LogSink;

struct MemoryStore {
    objects: HashMap<(String, String), Vec<u8>>,
}

impl MemoryStore {
    fn new() -> Self {
        MemoryStore {
            objects: HashMap::new(),
        }
    }

    fn put(&mut self, bucket: &str, key: &str, bytes: &[u8]) {
        self.objects
            .insert((bucket.to_string(), key.to_string()), bytes.to_vec());
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<FetchedObject> {
        let bytes = self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| {
                LogtapError::ObjectFetchError(format!("s3://{bucket}/{key}: no such object"))
            })?;
        Ok(FetchedObject {
            content_length: Some(bytes.len() as i64),
            body: Box::new(std::io::Cursor::new(bytes)),
            content_encoding: None,
        })
    }
}

struct GenerousClock;

impl RemainingTime for GenerousClock {
    fn remaining_time_ms(&self) -> u64 {
        900_000
    }
}

struct ExhaustedClock;

impl RemainingTime for ExhaustedClock {
    fn remaining_time_ms(&self) -> u64 {
        5_000
    }
}

fn forwarding_rules(yaml: &str) -> ForwardingRuleIndex {
    forwarding::parse_rule_documents(yaml)
}

fn processing_rules(custom_yaml: &str) -> ProcessingRuleIndex {
    let mut index = processing::built_in_rules();
    for (kind, rules) in processing::parse_rule_documents(custom_yaml) {
        index.entry(kind).or_default().extend(rules);
    }
    index
}

async fn single_sink(server: &MockServer) -> IndexMap<String, LogSink> {
    let settings = SinkSettings {
        id: "1".to_string(),
        environment_url: server.uri(),
        api_key_parameter: "/logtap/api-key".to_string(),
        verify_tls: true,
    };
    let sink = LogSink::new(&settings, Arc::new(StaticTokenProvider::new("token"))).unwrap();
    let mut sinks = IndexMap::new();
    sinks.insert("1".to_string(), sink);
    sinks
}

fn notification(id: &str, bucket: &str, key: &str) -> NotificationMessage {
    NotificationMessage {
        message_id: id.to_string(),
        body: json!({
            "s3": {"bucket": {"name": bucket}, "object": {"key": key}},
            "awsRegion": "us-east-1",
            "userIdentity": {"principalId": "AWS:AROAEXAMPLE:svc"}
        })
        .to_string(),
    }
}

fn batch(messages: Vec<NotificationMessage>) -> NotificationBatch {
    NotificationBatch { records: messages }
}

fn gunzip(bytes: &[u8]) -> Vec<u8> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).unwrap();
    out
}

/// All records POSTed to the mock sink, across every request, in order.
async fn posted_records(server: &MockServer) -> Vec<Value> {
    let mut records = Vec::new();
    for request in server.received_requests().await.unwrap() {
        let payload = gunzip(&request.body);
        let batch: Vec<Value> = serde_json::from_slice(&payload).unwrap();
        records.extend(batch);
    }
    records
}

async fn sink_server_accepting_all() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/logs/ingest"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn no_matching_forwarding_rule_drops_object() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let rules = forwarding_rules(
        r#"
bucket_name: b
log_forwarding_rules:
  - name: aws-logs
    key_pattern: '^AWSLogs/.*'
    source_kind: aws
"#,
    );
    let mut store = MemoryStore::new();
    store.put("b", "other/x.log", b"unreachable\n");

    let mut forwarder = Forwarder::new(
        rules,
        processing::built_in_rules(),
        single_sink(&server).await,
        Arc::new(store),
        "arn:test".to_string(),
    );

    let report = forwarder
        .handle_event(&batch(vec![notification("m1", "b", "other/x.log")]), &GenerousClock)
        .await;
    assert!(report.batch_item_failures.is_empty());
}

#[tokio::test]
async fn plain_text_with_header_skip_ships_remaining_lines_in_order() {
    let server = sink_server_accepting_all().await;

    let rules = forwarding_rules(
        r#"
bucket_name: b
log_forwarding_rules:
  - name: app-logs
    key_pattern: '.*'
    source_kind: custom
    source_name: myapp
"#,
    );
    let processing = processing_rules(
        r#"
name: myapp
source_kind: custom
key_path_pattern: '.*'
log_format: text
skip_header_lines: 1
"#,
    );
    let mut store = MemoryStore::new();
    store.put("b", "logs/app.log", b"header\nline1\nline2\n");

    let mut forwarder = Forwarder::new(
        rules,
        processing,
        single_sink(&server).await,
        Arc::new(store),
        "arn:test".to_string(),
    );

    let report = forwarder
        .handle_event(&batch(vec![notification("m1", "b", "logs/app.log")]), &GenerousClock)
        .await;
    assert!(report.batch_item_failures.is_empty());

    let records = posted_records(&server).await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["content"], "line1");
    assert_eq!(records[1]["content"], "line2");
    assert_eq!(records[0]["log.source.bucket"], "b");
    assert_eq!(records[0]["log.source.key"], "logs/app.log");
    assert_eq!(records[0]["cloud.log_forwarder"], "arn:test");
}

#[tokio::test]
async fn nested_json_array_ships_each_element() {
    let server = sink_server_accepting_all().await;

    let rules = forwarding_rules(
        r#"
bucket_name: b
log_forwarding_rules:
  - name: trail
    key_pattern: '.*'
    source_kind: custom
    source_name: nested
"#,
    );
    let processing = processing_rules(
        r#"
name: nested
source_kind: custom
key_path_pattern: '.*'
log_format: json
log_entries_key: Records
"#,
    );
    let mut store = MemoryStore::new();
    store.put(
        "b",
        "trail/x.json",
        br#"{"Records": [{"eventName": "A"}, {"eventName": "B"}]}"#,
    );

    let mut forwarder = Forwarder::new(
        rules,
        processing,
        single_sink(&server).await,
        Arc::new(store),
        "arn:test".to_string(),
    );

    let report = forwarder
        .handle_event(&batch(vec![notification("m1", "b", "trail/x.json")]), &GenerousClock)
        .await;
    assert!(report.batch_item_failures.is_empty());

    let records = posted_records(&server).await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["content"], r#"{"eventName":"A"}"#);
    assert_eq!(records[1]["content"], r#"{"eventName":"B"}"#);
    // Region falls back to the notification's region
    assert_eq!(records[0]["aws.region"], "us-east-1");
}

#[tokio::test]
async fn json_stream_sub_records_inherit_and_derive_attributes() {
    let server = sink_server_accepting_all().await;

    let rules = forwarding_rules(
        r#"
bucket_name: b
log_forwarding_rules:
  - name: cwl
    key_pattern: '.*'
    source_kind: custom
    source_name: cwl_stream
"#,
    );
    let processing = processing_rules(
        r#"
name: cwl_stream
source_kind: custom
key_path_pattern: '.*'
log_format: json_stream
log_entries_key: logEvents
attrs_from_top_level_json:
  logGroup: aws.log_group
  logStream: aws.log_stream
"#,
    );

    let top_level = json!({
        "logGroup": "/aws/eks/cluster-X/cluster",
        "logStream": "kube-apiserver-abc",
        "logEvents": [{"message": "m1"}, {"message": "m2"}]
    })
    .to_string();
    let mut store = MemoryStore::new();
    store.put(
        "b",
        "cwl/stream",
        format!("{top_level}{top_level}").as_bytes(),
    );

    let mut forwarder = Forwarder::new(
        rules,
        processing,
        single_sink(&server).await,
        Arc::new(store),
        "arn:test".to_string(),
    );

    let report = forwarder
        .handle_event(&batch(vec![notification("m1", "b", "cwl/stream")]), &GenerousClock)
        .await;
    assert!(report.batch_item_failures.is_empty());

    let records = posted_records(&server).await;
    assert_eq!(records.len(), 4);
    for record in &records {
        assert_eq!(record["aws.service"], "eks");
        assert_eq!(record["aws.resource.id"], "cluster-X");
        assert_eq!(record["log.source"], "kube-apiserver");
        assert_eq!(record["aws.log_group"], "/aws/eks/cluster-X/cluster");
    }
}

#[tokio::test]
async fn oversize_content_is_truncated_with_marker() {
    let server = sink_server_accepting_all().await;

    let rules = forwarding_rules(
        r#"
bucket_name: b
log_forwarding_rules:
  - name: all
    key_pattern: '.*'
    source_kind: generic
"#,
    );
    let mut store = MemoryStore::new();
    let mut body = "x".repeat(9000);
    body.push('\n');
    store.put("b", "big.log", body.as_bytes());

    let mut forwarder = Forwarder::new(
        rules,
        processing::built_in_rules(),
        single_sink(&server).await,
        Arc::new(store),
        "arn:test".to_string(),
    );

    forwarder
        .handle_event(&batch(vec![notification("m1", "b", "big.log")]), &GenerousClock)
        .await;

    let records = posted_records(&server).await;
    assert_eq!(records.len(), 1);
    let content = records[0]["content"].as_str().unwrap();
    assert_eq!(content.chars().count(), 8192);
    assert!(content.ends_with("[TRUNCATED]"));
}

#[tokio::test]
async fn throttled_sink_fails_the_notification_after_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/logs/ingest"))
        .respond_with(ResponseTemplate::new(429))
        // 1 initial attempt + 3 retries
        .expect(4)
        .mount(&server)
        .await;

    let rules = forwarding_rules(
        r#"
bucket_name: b
log_forwarding_rules:
  - name: all
    key_pattern: '.*'
    source_kind: generic
"#,
    );
    let mut store = MemoryStore::new();
    store.put("b", "x.log", b"one line\n");

    let mut forwarder = Forwarder::new(
        rules,
        processing::built_in_rules(),
        single_sink(&server).await,
        Arc::new(store),
        "arn:test".to_string(),
    );

    let report = forwarder
        .handle_event(&batch(vec![notification("m1", "b", "x.log")]), &GenerousClock)
        .await;
    assert_eq!(report.batch_item_failures.len(), 1);
    assert_eq!(report.batch_item_failures[0].item_identifier, "m1");
}

#[tokio::test]
async fn deadline_marks_current_and_subsequent_notifications_failed() {
    let server = sink_server_accepting_all().await;

    let rules = forwarding_rules(
        r#"
bucket_name: b
log_forwarding_rules:
  - name: all
    key_pattern: '.*'
    source_kind: generic
"#,
    );
    let mut store = MemoryStore::new();
    // Enough entries to reach the first deadline checkpoint.
    let body: String = (0..1500).map(|i| format!("line{i}\n")).collect();
    store.put("b", "big.log", body.as_bytes());
    store.put("b", "small.log", b"tail\n");

    let mut forwarder = Forwarder::new(
        rules,
        processing::built_in_rules(),
        single_sink(&server).await,
        Arc::new(store),
        "arn:test".to_string(),
    );

    let report = forwarder
        .handle_event(
            &batch(vec![
                notification("m1", "b", "big.log"),
                notification("m2", "b", "small.log"),
            ]),
            &ExhaustedClock,
        )
        .await;

    let failed: Vec<&str> = report
        .batch_item_failures
        .iter()
        .map(|failure| failure.item_identifier.as_str())
        .collect();
    assert_eq!(failed, vec!["m1", "m2"]);
}

#[tokio::test]
async fn failed_notification_does_not_leak_records_into_the_next() {
    let server = MockServer::start().await;
    // First notification: throttled to death (4 attempts), then the second
    // notification's flush succeeds.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(4)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let rules = forwarding_rules(
        r#"
bucket_name: b
log_forwarding_rules:
  - name: all
    key_pattern: '.*'
    source_kind: generic
"#,
    );
    let mut store = MemoryStore::new();
    store.put("b", "first.log", b"first-record\n");
    store.put("b", "second.log", b"second-record\n");

    let mut forwarder = Forwarder::new(
        rules,
        processing::built_in_rules(),
        single_sink(&server).await,
        Arc::new(store),
        "arn:test".to_string(),
    );

    let report = forwarder
        .handle_event(
            &batch(vec![
                notification("m1", "b", "first.log"),
                notification("m2", "b", "second.log"),
            ]),
            &GenerousClock,
        )
        .await;

    assert_eq!(report.batch_item_failures.len(), 1);
    assert_eq!(report.batch_item_failures[0].item_identifier, "m1");

    // The successful POST carries only the second notification's records.
    let requests = server.received_requests().await.unwrap();
    let last = requests.last().unwrap();
    let batch_payload: Vec<Value> = serde_json::from_slice(&gunzip(&last.body)).unwrap();
    assert_eq!(batch_payload.len(), 1);
    assert_eq!(batch_payload[0]["content"], "second-record");
    assert_eq!(batch_payload[0]["log.source.key"], "second.log");
}

#[tokio::test]
async fn unparseable_notification_body_is_dropped_not_failed() {
    let server = sink_server_accepting_all().await;

    let rules = forwarding_rules(
        r#"
bucket_name: b
log_forwarding_rules:
  - name: all
    key_pattern: '.*'
    source_kind: generic
"#,
    );
    let mut store = MemoryStore::new();
    store.put("b", "x.log", b"line\n");

    let mut forwarder = Forwarder::new(
        rules,
        processing::built_in_rules(),
        single_sink(&server).await,
        Arc::new(store),
        "arn:test".to_string(),
    );

    let garbage = NotificationMessage {
        message_id: "bad".to_string(),
        body: "not json".to_string(),
    };
    let report = forwarder
        .handle_event(
            &batch(vec![garbage, notification("m2", "b", "x.log")]),
            &GenerousClock,
        )
        .await;

    assert!(report.batch_item_failures.is_empty());
    assert_eq!(posted_records(&server).await.len(), 1);
}

#[tokio::test]
async fn missing_object_fails_the_notification() {
    let server = sink_server_accepting_all().await;

    let rules = forwarding_rules(
        r#"
bucket_name: b
log_forwarding_rules:
  - name: all
    key_pattern: '.*'
    source_kind: generic
"#,
    );

    let mut forwarder = Forwarder::new(
        rules,
        processing::built_in_rules(),
        single_sink(&server).await,
        Arc::new(MemoryStore::new()),
        "arn:test".to_string(),
    );

    let report = forwarder
        .handle_event(&batch(vec![notification("m1", "b", "gone.log")]), &GenerousClock)
        .await;
    assert_eq!(report.batch_item_failures.len(), 1);
}

#[tokio::test]
async fn forwarding_rule_without_known_sinks_skips_notification() {
    let server = sink_server_accepting_all().await;

    let rules = forwarding_rules(
        r#"
bucket_name: b
log_forwarding_rules:
  - name: all
    key_pattern: '.*'
    source_kind: generic
    sinks: ['9']
"#,
    );
    let mut store = MemoryStore::new();
    store.put("b", "x.log", b"line\n");

    let mut forwarder = Forwarder::new(
        rules,
        processing::built_in_rules(),
        single_sink(&server).await,
        Arc::new(store),
        "arn:test".to_string(),
    );

    let report = forwarder
        .handle_event(&batch(vec![notification("m1", "b", "x.log")]), &GenerousClock)
        .await;
    // Dropped with a counter, not retried
    assert!(report.batch_item_failures.is_empty());
    assert!(posted_records(&server).await.is_empty());
}
