//! Streaming object decoder.
//!
//! Turns an object body into a lazy sequence of raw log entries. The decode
//! itself is synchronous IO (gzip, line splitting, incremental JSON) and runs
//! on a blocking task; entries flow to the async driver through a bounded
//! channel, so a slow consumer backpressures the read.

use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;

use flate2::read::MultiGzDecoder;
use serde::de::{DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::SyncIoBridge;
use tracing::warn;

use crate::errors::{LogtapError, Result};
use crate::rules::processing::{LogFormat, ProcessingRule};
use crate::s3::FetchedObject;
use crate::utils::query;

const CHANNEL_CAPACITY: usize = 256;

/// Processing rule whose json_stream payload carries a second gzip layer
/// (CloudWatch Logs delivered through Firehose).
const DOUBLE_GZIP_RULE: &str = "cwl_to_fh";

/// One decoded raw entry.
#[derive(Debug)]
pub enum RawEntry {
    /// A text line.
    Line(String),
    /// A consumed header line; counts toward ordinal accounting but is
    /// never shipped.
    HeaderSkipped,
    /// A structured entry.
    Object(Value),
    /// A sub-record of a json_stream object, along with its enclosing
    /// object (entries list removed).
    SubRecord {
        record: Value,
        enclosing: Arc<Value>,
    },
}

/// Everything the decode task needs from the processing rule, detached so it
/// can move onto the blocking thread.
#[derive(Debug, Clone)]
pub struct DecodeSpec {
    pub log_format: LogFormat,
    pub entries_path: Option<Vec<String>>,
    pub object_filter: Option<(String, String)>,
    pub skip_header_lines: usize,
    pub double_gzip: bool,
}

impl DecodeSpec {
    pub fn from_rule(rule: &ProcessingRule) -> Self {
        DecodeSpec {
            log_format: rule.log_format,
            entries_path: rule
                .log_entries_key
                .as_deref()
                .map(query::parse_path),
            object_filter: rule
                .filter_object_key
                .clone()
                .zip(rule.filter_object_value.clone()),
            skip_header_lines: rule.skip_header_lines,
            double_gzip: rule.name == DOUBLE_GZIP_RULE,
        }
    }

    fn passes_object_filter(&self, object: &Value) -> bool {
        let Some((key, expected)) = &self.object_filter else {
            return true;
        };
        object
            .get(key)
            .and_then(Value::as_str)
            .map(|actual| actual == expected)
            .unwrap_or(false)
    }
}

/// Decompression policy: gzip when the key ends in `.gz` or the stored
/// content encoding says so.
pub fn should_gunzip(key: &str, content_encoding: Option<&str>) -> bool {
    key.ends_with(".gz") || content_encoding == Some("gzip")
}

/// Spawns the blocking decode of an object body and returns the lazy entry
/// stream.
pub fn decode_object(
    object: FetchedObject,
    spec: DecodeSpec,
    key: &str,
) -> ReceiverStream<Result<RawEntry>> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let gunzip = should_gunzip(key, object.content_encoding.as_deref());
    let key = key.to_string();

    tokio::task::spawn_blocking(move || {
        let bridge = SyncIoBridge::new(object.body);
        if let Err(err) = run_decode(bridge, gunzip, &spec, &key, &tx) {
            let _ = tx.blocking_send(Err(err));
        }
    });

    ReceiverStream::new(rx)
}

struct CountingReader<R> {
    inner: R,
    bytes: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes += n as u64;
        Ok(n)
    }
}

type EntrySender = mpsc::Sender<Result<RawEntry>>;

/// Hands one entry to the driver; `false` means the receiver is gone and
/// decoding should stop.
fn send(tx: &EntrySender, entry: RawEntry) -> bool {
    tx.blocking_send(Ok(entry)).is_ok()
}

fn run_decode(
    raw: impl Read,
    gunzip: bool,
    spec: &DecodeSpec,
    key: &str,
    tx: &EntrySender,
) -> Result<()> {
    let decompressed: Box<dyn Read> = if gunzip {
        Box::new(MultiGzDecoder::new(raw))
    } else {
        Box::new(raw)
    };
    let mut counting = CountingReader {
        inner: decompressed,
        bytes: 0,
    };

    let outcome = match spec.log_format {
        LogFormat::Text => decode_text(&mut counting, spec, key, tx),
        LogFormat::Json => decode_json(&mut counting, spec, tx),
        LogFormat::JsonStream => decode_json_stream(&mut counting, spec, tx),
    };

    metrics::histogram!("ReceivedUncompressedLogFileSize").record(counting.bytes as f64);
    outcome
}

fn decode_text(
    reader: impl Read,
    spec: &DecodeSpec,
    key: &str,
    tx: &EntrySender,
) -> Result<()> {
    let mut buffered = BufReader::new(reader);
    let mut line_buf = Vec::new();
    let mut headers_skipped = 0;

    loop {
        line_buf.clear();
        if buffered.read_until(b'\n', &mut line_buf)? == 0 {
            return Ok(());
        }
        if line_buf.last() == Some(&b'\n') {
            line_buf.pop();
        }
        if line_buf.last() == Some(&b'\r') {
            line_buf.pop();
        }
        if line_buf.is_empty() {
            continue;
        }

        let line = std::str::from_utf8(&line_buf)
            .map_err(|_| LogtapError::NonUtf8TextEntry(key.to_string()))?;

        let entry = if headers_skipped < spec.skip_header_lines {
            headers_skipped += 1;
            RawEntry::HeaderSkipped
        } else {
            RawEntry::Line(line.to_string())
        };
        if !send(tx, entry) {
            return Ok(());
        }
    }
}

fn decode_json(reader: impl Read, spec: &DecodeSpec, tx: &EntrySender) -> Result<()> {
    let path = spec.entries_path.clone().unwrap_or_default();
    let mut emit = |value: Value| send(tx, RawEntry::Object(value));
    let mut deserializer = serde_json::Deserializer::from_reader(reader);

    NestedArraySeed {
        path: &path,
        emit: &mut emit,
    }
    .deserialize(&mut deserializer)
    .map_err(|err| LogtapError::MalformedStructuredEntry(err.to_string()))?;
    Ok(())
}

fn decode_json_stream(reader: impl Read, spec: &DecodeSpec, tx: &EntrySender) -> Result<()> {
    let reader: Box<dyn Read> = if spec.double_gzip {
        Box::new(MultiGzDecoder::new(reader))
    } else {
        Box::new(reader)
    };

    let stream = serde_json::Deserializer::from_reader(reader).into_iter::<Value>();
    for item in stream {
        let mut value =
            item.map_err(|err| LogtapError::MalformedStructuredEntry(err.to_string()))?;
        if !spec.passes_object_filter(&value) {
            continue;
        }

        match &spec.entries_path {
            None => {
                if !send(tx, RawEntry::Object(value)) {
                    return Ok(());
                }
            }
            Some(path) => {
                let Some(Value::Array(records)) = take_value_at(&mut value, path) else {
                    warn!("json_stream object carries no entry list at the configured path");
                    metrics::counter!("FilesWithInvalidLogEntries").increment(1);
                    continue;
                };
                let enclosing = Arc::new(value);
                for record in records {
                    let entry = RawEntry::SubRecord {
                        record,
                        enclosing: Arc::clone(&enclosing),
                    };
                    if !send(tx, entry) {
                        return Ok(());
                    }
                }
            }
        }
    }
    Ok(())
}

/// Removes and returns the value at a dotted path, leaving the rest of the
/// object in place.
fn take_value_at(value: &mut Value, path: &[String]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    let mut current = value;
    for segment in parents {
        current = current.as_object_mut()?.get_mut(segment)?;
    }
    current.as_object_mut()?.remove(last)
}

/// Streams the elements of the array at `path`, one at a time, without
/// materializing the enclosing document.
struct NestedArraySeed<'a, F>
where
    F: FnMut(Value) -> bool,
{
    path: &'a [String],
    emit: &'a mut F,
}

impl<'de, 'a, F> DeserializeSeed<'de> for NestedArraySeed<'a, F>
where
    F: FnMut(Value) -> bool,
{
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<(), D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match self.path.split_first() {
            None => deserializer.deserialize_seq(ElementsVisitor { emit: self.emit }),
            Some((head, tail)) => deserializer.deserialize_map(DescendVisitor {
                head,
                tail,
                emit: self.emit,
            }),
        }
    }
}

struct ElementsVisitor<'a, F> {
    emit: &'a mut F,
}

impl<'de, 'a, F> Visitor<'de> for ElementsVisitor<'a, F>
where
    F: FnMut(Value) -> bool,
{
    type Value = ();

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a list of log entries")
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        while let Some(value) = seq.next_element::<Value>()? {
            if !(self.emit)(value) {
                // Receiver is gone; drain the rest without building values.
                while seq.next_element::<IgnoredAny>()?.is_some() {}
                break;
            }
        }
        Ok(())
    }
}

struct DescendVisitor<'a, F> {
    head: &'a String,
    tail: &'a [String],
    emit: &'a mut F,
}

impl<'de, 'a, F> Visitor<'de> for DescendVisitor<'a, F>
where
    F: FnMut(Value) -> bool,
{
    type Value = ();

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("an object containing the log entry list")
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut descended = false;
        while let Some(key) = map.next_key::<String>()? {
            if !descended && key == *self.head {
                map.next_value_seed(NestedArraySeed {
                    path: self.tail,
                    emit: self.emit,
                })?;
                descended = true;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::processing::build_rule;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tokio_stream::StreamExt;

    fn spec_for(yaml: &str) -> DecodeSpec {
        DecodeSpec::from_rule(&build_rule(serde_yaml::from_str(yaml).unwrap()).unwrap())
    }

    fn text_spec(skip_header_lines: usize) -> DecodeSpec {
        spec_for(&format!(
            "name: r\nsource_kind: generic\nkey_path_pattern: '.*'\nlog_format: text\nskip_header_lines: {skip_header_lines}\n"
        ))
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn object_from(bytes: Vec<u8>, content_encoding: Option<&str>) -> FetchedObject {
        FetchedObject {
            content_length: Some(bytes.len() as i64),
            body: Box::new(std::io::Cursor::new(bytes)),
            content_encoding: content_encoding.map(str::to_string),
        }
    }

    async fn collect(
        object: FetchedObject,
        spec: DecodeSpec,
        key: &str,
    ) -> Vec<Result<RawEntry>> {
        decode_object(object, spec, key).collect().await
    }

    #[test]
    fn test_should_gunzip_policy() {
        assert!(should_gunzip("a/b.log.gz", None));
        assert!(should_gunzip("a/b.log", Some("gzip")));
        assert!(!should_gunzip("a/b.log", Some("identity")));
        assert!(!should_gunzip("a/b.log", None));
    }

    #[tokio::test]
    async fn test_text_lines_in_order_skipping_empties() {
        let entries = collect(
            object_from(b"line1\n\nline2\r\nline3".to_vec(), None),
            text_spec(0),
            "k.log",
        )
        .await;
        let lines: Vec<String> = entries
            .into_iter()
            .map(|entry| match entry.unwrap() {
                RawEntry::Line(line) => line,
                other => panic!("unexpected entry {other:?}"),
            })
            .collect();
        assert_eq!(lines, vec!["line1", "line2", "line3"]);
    }

    #[tokio::test]
    async fn test_text_header_skip_yields_placeholders() {
        let entries = collect(
            object_from(b"header\nline1\nline2\n".to_vec(), None),
            text_spec(1),
            "k.log",
        )
        .await;
        assert_eq!(entries.len(), 3);
        assert!(matches!(entries[0], Ok(RawEntry::HeaderSkipped)));
        assert!(matches!(&entries[1], Ok(RawEntry::Line(line)) if line == "line1"));
        assert!(matches!(&entries[2], Ok(RawEntry::Line(line)) if line == "line2"));
    }

    #[tokio::test]
    async fn test_text_non_utf8_is_poison_pill() {
        let entries = collect(
            object_from(vec![b'o', b'k', b'\n', 0xff, 0xfe, b'\n'], None),
            text_spec(0),
            "k.log",
        )
        .await;
        assert!(matches!(&entries[0], Ok(RawEntry::Line(line)) if line == "ok"));
        assert!(matches!(
            entries.last(),
            Some(Err(LogtapError::NonUtf8TextEntry(_)))
        ));
    }

    #[tokio::test]
    async fn test_gzipped_text_by_key_suffix() {
        let entries = collect(
            object_from(gzip(b"a\nb\n"), None),
            text_spec(0),
            "logs/x.log.gz",
        )
        .await;
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_gzipped_text_by_content_encoding() {
        let entries = collect(
            object_from(gzip(b"a\nb\n"), Some("gzip")),
            text_spec(0),
            "logs/x.log",
        )
        .await;
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_json_top_level_array() {
        let spec = spec_for(
            "name: r\nsource_kind: generic\nkey_path_pattern: '.*'\nlog_format: json\n",
        );
        let entries = collect(
            object_from(br#"[{"a": 1}, {"a": 2}, {"a": 3}]"#.to_vec(), None),
            spec,
            "k.json",
        )
        .await;
        assert_eq!(entries.len(), 3);
        assert!(
            matches!(&entries[2], Ok(RawEntry::Object(value)) if value["a"] == 3)
        );
    }

    #[tokio::test]
    async fn test_json_nested_entries_key() {
        let spec = spec_for(
            "name: r\nsource_kind: aws\nkey_path_pattern: '.*'\nlog_format: json\nlog_entries_key: Records\n",
        );
        let entries = collect(
            object_from(
                br#"{"other": {"ignored": true}, "Records": [{"eventName": "A"}, {"eventName": "B"}], "trailing": 1}"#.to_vec(),
                None,
            ),
            spec,
            "k.json",
        )
        .await;
        assert_eq!(entries.len(), 2);
        assert!(
            matches!(&entries[0], Ok(RawEntry::Object(value)) if value["eventName"] == "A")
        );
        assert!(
            matches!(&entries[1], Ok(RawEntry::Object(value)) if value["eventName"] == "B")
        );
    }

    #[tokio::test]
    async fn test_json_deeply_nested_entries_key() {
        let spec = spec_for(
            "name: r\nsource_kind: generic\nkey_path_pattern: '.*'\nlog_format: json\nlog_entries_key: data.logs.events\n",
        );
        let entries = collect(
            object_from(
                br#"{"data": {"logs": {"events": [{"n": 1}, {"n": 2}]}}}"#.to_vec(),
                None,
            ),
            spec,
            "k.json",
        )
        .await;
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_json_invalid_document_fails() {
        let spec = spec_for(
            "name: r\nsource_kind: generic\nkey_path_pattern: '.*'\nlog_format: json\n",
        );
        let entries = collect(
            object_from(br#"[{"a": 1}, {"a":"#.to_vec(), None),
            spec,
            "k.json",
        )
        .await;
        assert!(matches!(
            entries.last(),
            Some(Err(LogtapError::MalformedStructuredEntry(_)))
        ));
    }

    #[tokio::test]
    async fn test_json_stream_concatenated_objects() {
        let spec = spec_for(
            "name: r\nsource_kind: generic\nkey_path_pattern: '.*'\nlog_format: json_stream\n",
        );
        let entries = collect(
            object_from(br#"{"a": 1}{"a": 2} {"a": 3}"#.to_vec(), None),
            spec,
            "k",
        )
        .await;
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn test_json_stream_filter_skips_objects() {
        let spec = spec_for(
            "name: r\nsource_kind: generic\nkey_path_pattern: '.*'\nlog_format: json_stream\nfilter_object_key: messageType\nfilter_object_value: DATA_MESSAGE\n",
        );
        let entries = collect(
            object_from(
                br#"{"messageType": "CONTROL_MESSAGE", "a": 1}{"messageType": "DATA_MESSAGE", "a": 2}"#
                    .to_vec(),
                None,
            ),
            spec,
            "k",
        )
        .await;
        assert_eq!(entries.len(), 1);
        assert!(matches!(&entries[0], Ok(RawEntry::Object(value)) if value["a"] == 2));
    }

    #[tokio::test]
    async fn test_json_stream_sub_records_carry_enclosing_object() {
        let spec = spec_for(
            "name: r\nsource_kind: generic\nkey_path_pattern: '.*'\nlog_format: json_stream\nlog_entries_key: logEvents\n",
        );
        let entries = collect(
            object_from(
                br#"{"logGroup": "g", "logEvents": [{"m": 1}, {"m": 2}]}"#.to_vec(),
                None,
            ),
            spec,
            "k",
        )
        .await;
        assert_eq!(entries.len(), 2);
        let Ok(RawEntry::SubRecord { record, enclosing }) = &entries[0] else {
            panic!("expected a sub-record");
        };
        assert_eq!(record["m"], 1);
        assert_eq!(enclosing["logGroup"], "g");
        // The (potentially huge) entries list is not kept on the enclosing
        // object.
        assert!(enclosing.get("logEvents").is_none());
    }

    #[tokio::test]
    async fn test_cwl_to_fh_double_gzip() {
        let spec = spec_for(
            "name: cwl_to_fh\nsource_kind: custom\nkey_path_pattern: '.*'\nlog_format: json_stream\nlog_entries_key: logEvents\nfilter_object_key: messageType\nfilter_object_value: DATA_MESSAGE\n",
        );
        assert!(spec.double_gzip);

        let inner = gzip(
            br#"{"messageType": "DATA_MESSAGE", "logGroup": "/aws/lambda/f", "logEvents": [{"message": "m1"}]}"#,
        );
        let outer = gzip(&inner);
        let entries = collect(object_from(outer, None), spec, "firehose/x.gz").await;
        assert_eq!(entries.len(), 1);
        assert!(matches!(
            &entries[0],
            Ok(RawEntry::SubRecord { record, .. }) if record["message"] == "m1"
        ));
    }
}
