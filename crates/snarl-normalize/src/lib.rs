//! Trace-log normalizer.
//!
//! Ingests raw JSON Lines trace logs from one or more files, merges and
//! time-sorts them, and emits the canonical event stream the graph
//! builder consumes. Raw logs identify objects by heap address (reused
//! across lifetimes) and split waits into start/completion pairs; the
//! normalized stream identifies everything by small dense integers and
//! carries one finalized record per wait.
//!
//! Normalization is idempotent: feeding the emitted stream back in
//! reproduces it (modulo the timestamp zero-shift, which is then a
//! no-op).

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::io;

use serde_json::Value;
use snarl_types::{CompactId, NormalizedEvent};
use tracing::{debug, warn};

pub mod compact;
pub mod generation;

pub use compact::Compactify;
pub use generation::{GenerationCounter, VertexId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    /// A line that is not valid JSON. Fatal: the trace cannot be trusted.
    MalformedJson {
        file: usize,
        line: usize,
        error: String,
    },
    MissingField {
        event: &'static str,
        field: &'static str,
    },
    /// A field that should be an address was neither an integer nor an
    /// object with an integer `address`.
    InvalidAddress {
        event: &'static str,
        field: &'static str,
    },
}

impl fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedJson { file, line, error } => {
                write!(f, "malformed JSON at file {file}, line {line}: {error}")
            }
            Self::MissingField { event, field } => {
                write!(f, "{event} event is missing required field `{field}`")
            }
            Self::InvalidAddress { event, field } => {
                write!(f, "{event} field `{field}` is not an address")
            }
        }
    }
}

impl Error for NormalizeError {}

/// A wait that has started but whose completion has not been seen yet.
#[derive(Debug, Clone)]
struct PendingWait {
    sem: CompactId,
    pre: CompactId,
    post: CompactId,
    count: u64,
    timestamp: i64,
}

/// Turns raw trace logs into the canonical event stream.
///
/// All counters are per-run state: build one `Normalizer` per analysis.
#[derive(Debug, Default)]
pub struct Normalizer {
    counter: GenerationCounter,
    compact: Compactify,
    log: Vec<NormalizedEvent>,
    pending_waits: HashMap<CompactId, PendingWait>,
    moved: HashSet<VertexId>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses, merges, and normalizes the contents of one or more log
    /// files (one string per file, in argument order).
    ///
    /// Lines are stably sorted by timestamp across files, shifted so the
    /// first event is zero, then dispatched. Waits still pending at the
    /// end of the stream are flushed as finalized records, and the log is
    /// re-sorted by timestamp (completions finalize out of order).
    pub fn ingest_files(&mut self, files: &[String]) -> Result<(), NormalizeError> {
        let mut events: Vec<(i64, Value)> = Vec::new();
        for (file_index, content) in files.iter().enumerate() {
            for (line_index, raw_line) in content.lines().enumerate() {
                let line = raw_line.trim();
                if line.is_empty() {
                    continue;
                }
                let value: Value =
                    serde_json::from_str(line).map_err(|e| NormalizeError::MalformedJson {
                        file: file_index,
                        line: line_index + 1,
                        error: e.to_string(),
                    })?;
                let timestamp = value.get("timestamp").and_then(Value::as_i64).ok_or(
                    NormalizeError::MissingField {
                        event: "trace",
                        field: "timestamp",
                    },
                )?;
                events.push((timestamp, value));
            }
        }

        if events.is_empty() {
            return Ok(());
        }

        events.sort_by_key(|(timestamp, _)| *timestamp);
        let start = events[0].0;
        for (timestamp, value) in &events {
            self.dispatch(value, timestamp - start)?;
        }
        self.flush_pending();
        self.log.sort_by_key(NormalizedEvent::timestamp);
        Ok(())
    }

    /// The normalized stream, sorted by timestamp.
    pub fn events(&self) -> &[NormalizedEvent] {
        &self.log
    }

    pub fn into_events(self) -> Vec<NormalizedEvent> {
        self.log
    }

    /// Writes the normalized stream as JSON Lines.
    pub fn write_jsonl<W: io::Write>(&self, writer: &mut W) -> Result<(), String> {
        for event in &self.log {
            let line = event.to_json_line()?;
            writeln!(writer, "{line}").map_err(|e| format!("write normalized stream: {e}"))?;
        }
        Ok(())
    }

    fn dispatch(&mut self, event: &Value, timestamp: i64) -> Result<(), NormalizeError> {
        let Some(kind) = event.get("type").and_then(Value::as_str) else {
            return Err(NormalizeError::MissingField {
                event: "trace",
                field: "type",
            });
        };
        match kind {
            "sem_ctor" => self.sem_ctor(event, timestamp),
            "sem_dtor" => self.sem_dtor(event, timestamp),
            "sem_move" => self.rebind_move(event, "sem_move"),
            "vertex_ctor" => self.vertex_ctor(event, timestamp),
            "vertex_dtor" => self.vertex_dtor(event, timestamp),
            "vertex_move" => self.rebind_move(event, "vertex_move"),
            "edge" => self.edge(event, timestamp),
            "sem_wait" => self.sem_wait(event, timestamp),
            "sem_wait_completed" => self.sem_wait_completed(event),
            "sem_signal" => self.sem_signal(event, timestamp),
            _ => {
                warn!(event_type = kind, "ignoring unknown event type");
                Ok(())
            }
        }
    }

    fn sem_ctor(&mut self, event: &Value, timestamp: i64) -> Result<(), NormalizeError> {
        let sem = required(event, "sem_ctor", "sem")?;
        let address = address_of(sem, "sem_ctor", "sem")?;
        // Raw logs nest the initial count inside the sem object; the
        // normalized form carries it at the top level.
        let count = sem
            .get("available_units")
            .and_then(Value::as_u64)
            .or_else(|| event.get("count").and_then(Value::as_u64))
            .ok_or(NormalizeError::MissingField {
                event: "sem_ctor",
                field: "count",
            })?;
        let identity = self.construct(address);
        let sem = self.compact.add(identity);
        self.log.push(NormalizedEvent::SemCtor {
            sem,
            count,
            timestamp,
        });
        Ok(())
    }

    fn sem_dtor(&mut self, event: &Value, timestamp: i64) -> Result<(), NormalizeError> {
        let address = address_of(required(event, "sem_dtor", "sem")?, "sem_dtor", "sem")?;
        match self.counter.destroy(address) {
            Err(err) => {
                warn!(%err, "skipping semaphore destruction");
            }
            Ok(identity) => {
                let sem = self.compact.add(identity);
                if !self.moved.contains(&identity) {
                    self.log.push(NormalizedEvent::SemDtor { sem, timestamp });
                }
            }
        }
        Ok(())
    }

    fn vertex_ctor(&mut self, event: &Value, timestamp: i64) -> Result<(), NormalizeError> {
        let address = address_of(
            required(event, "vertex_ctor", "vertex")?,
            "vertex_ctor",
            "vertex",
        )?;
        let identity = self.construct(address);
        let vertex = self.compact.add(identity);
        self.log
            .push(NormalizedEvent::VertexCtor { vertex, timestamp });
        Ok(())
    }

    fn vertex_dtor(&mut self, event: &Value, timestamp: i64) -> Result<(), NormalizeError> {
        let address = address_of(
            required(event, "vertex_dtor", "vertex")?,
            "vertex_dtor",
            "vertex",
        )?;
        match self.counter.destroy(address) {
            Err(err) => {
                warn!(%err, "skipping vertex destruction");
            }
            Ok(identity) => {
                let vertex = self.compact.add(identity);
                if !self.moved.contains(&identity) {
                    self.log
                        .push(NormalizedEvent::VertexDtor { vertex, timestamp });
                }
            }
        }
        Ok(())
    }

    /// `sem_move` / `vertex_move`: the destination takes over the
    /// source's compact id, and the source's eventual dtor is suppressed.
    fn rebind_move(&mut self, event: &Value, kind: &'static str) -> Result<(), NormalizeError> {
        let from_address = address_of(required(event, kind, "from")?, kind, "from")?;
        let to_address = address_of(required(event, kind, "to")?, kind, "to")?;
        let to_identity = self.construct(to_address);
        let from_identity = self.counter.current(from_address);
        self.compact.rebind(from_identity, to_identity);
        self.moved.insert(from_identity);
        Ok(())
    }

    fn edge(&mut self, event: &Value, timestamp: i64) -> Result<(), NormalizeError> {
        let pre = self.compact_ref(event, "edge", "pre")?;
        let post = self.compact_ref(event, "edge", "post")?;
        let speculative = speculative_flag(event.get("speculative"));
        self.log.push(NormalizedEvent::Edge {
            pre,
            post,
            speculative,
            timestamp,
        });
        Ok(())
    }

    fn sem_wait(&mut self, event: &Value, timestamp: i64) -> Result<(), NormalizeError> {
        let sem = self.compact_ref(event, "sem_wait", "sem")?;
        let pre = self.compact_ref(event, "sem_wait", "pre")?;
        let post = self.compact_ref(event, "sem_wait", "post")?;
        let count = required_u64(event, "sem_wait", "count")?;
        let replaced = self.pending_waits.insert(
            post,
            PendingWait {
                sem,
                pre,
                post,
                count,
                timestamp,
            },
        );
        if replaced.is_some() {
            warn!(post, "wait started while another wait was pending on the same vertex");
        }
        Ok(())
    }

    fn sem_wait_completed(&mut self, event: &Value) -> Result<(), NormalizeError> {
        let sem = self.compact_ref(event, "sem_wait_completed", "sem")?;
        let post = self.compact_ref(event, "sem_wait_completed", "post")?;
        match self.pending_waits.remove(&post) {
            None => {
                warn!(post, "wait completion with no pending wait");
            }
            Some(pending) => {
                // The finalized record keeps the timestamp of the wait's
                // start, so the builder orders it where the wait began.
                self.log.push(NormalizedEvent::SemWait {
                    sem,
                    pre: pending.pre,
                    post: pending.post,
                    count: pending.count,
                    timestamp: pending.timestamp,
                });
            }
        }
        Ok(())
    }

    fn sem_signal(&mut self, event: &Value, timestamp: i64) -> Result<(), NormalizeError> {
        let sem = self.compact_ref(event, "sem_signal", "sem")?;
        let vertex = self.compact_ref(event, "sem_signal", "vertex")?;
        let count = required_u64(event, "sem_signal", "count")?;
        self.log.push(NormalizedEvent::SemSignal {
            sem,
            vertex,
            count,
            timestamp,
        });
        Ok(())
    }

    /// Waits whose completion never arrived are the operations that were
    /// still blocked when the trace ended; they are emitted as finalized
    /// records so the analyzer can decide whether they could ever
    /// complete. Also what makes re-normalization idempotent: a
    /// normalized `sem_wait` has no completion event.
    fn flush_pending(&mut self) {
        let mut pending: Vec<PendingWait> = self.pending_waits.drain().map(|(_, p)| p).collect();
        pending.sort_by_key(|p| (p.timestamp, p.post));
        for wait in pending {
            debug!(post = wait.post, "flushing wait with no completion event");
            self.log.push(NormalizedEvent::SemWait {
                sem: wait.sem,
                pre: wait.pre,
                post: wait.post,
                count: wait.count,
                timestamp: wait.timestamp,
            });
        }
    }

    fn construct(&mut self, address: u64) -> VertexId {
        match self.counter.construct(address) {
            Ok(identity) => identity,
            Err(err) => {
                warn!(%err, "rebinding to a fresh generation");
                self.counter.rebind(address)
            }
        }
    }

    fn compact_ref(
        &mut self,
        event: &Value,
        kind: &'static str,
        field: &'static str,
    ) -> Result<CompactId, NormalizeError> {
        let address = address_of(required(event, kind, field)?, kind, field)?;
        Ok(self.compact.add(self.counter.current(address)))
    }
}

fn required<'v>(
    event: &'v Value,
    kind: &'static str,
    field: &'static str,
) -> Result<&'v Value, NormalizeError> {
    event.get(field).ok_or(NormalizeError::MissingField {
        event: kind,
        field,
    })
}

fn required_u64(event: &Value, kind: &'static str, field: &'static str) -> Result<u64, NormalizeError> {
    required(event, kind, field)?
        .as_u64()
        .ok_or(NormalizeError::MissingField {
            event: kind,
            field,
        })
}

/// An address is either a bare integer or an object with an `address`
/// field; both shapes occur in raw logs.
fn address_of(value: &Value, kind: &'static str, field: &'static str) -> Result<u64, NormalizeError> {
    value
        .as_u64()
        .or_else(|| value.get("address").and_then(Value::as_u64))
        .ok_or(NormalizeError::InvalidAddress {
            event: kind,
            field,
        })
}

/// Raw logs encode the flag as a bool, an integer, or the strings
/// "0"/"1"; absent means not speculative.
fn speculative_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        Some(Value::String(s)) => s == "1" || s == "true",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(raw: &str) -> Vec<NormalizedEvent> {
        let mut normalizer = Normalizer::new();
        normalizer
            .ingest_files(&[raw.to_string()])
            .expect("normalize");
        normalizer.into_events()
    }

    // ── Basic canonicalization ─────────────────────────────────────

    #[test]
    fn addresses_compactify_in_first_use_order() {
        let events = normalize(concat!(
            r#"{"type":"sem_ctor","timestamp":100,"sem":{"address":4096,"available_units":1}}"#,
            "\n",
            r#"{"type":"edge","timestamp":110,"pre":{"address":8192},"post":{"address":8448},"speculative":"0"}"#,
        ));
        assert_eq!(
            events,
            vec![
                NormalizedEvent::SemCtor {
                    sem: 0,
                    count: 1,
                    timestamp: 0
                },
                NormalizedEvent::Edge {
                    pre: 1,
                    post: 2,
                    speculative: false,
                    timestamp: 10
                },
            ]
        );
    }

    #[test]
    fn timestamps_are_zero_shifted_and_merged_across_files() {
        let file_a =
            r#"{"type":"vertex_ctor","timestamp":500,"vertex":{"address":1}}"#.to_string();
        let file_b =
            r#"{"type":"vertex_ctor","timestamp":300,"vertex":{"address":2}}"#.to_string();
        let mut normalizer = Normalizer::new();
        normalizer.ingest_files(&[file_a, file_b]).expect("normalize");
        assert_eq!(
            normalizer.events(),
            &[
                NormalizedEvent::VertexCtor {
                    vertex: 0,
                    timestamp: 0
                },
                NormalizedEvent::VertexCtor {
                    vertex: 1,
                    timestamp: 200
                },
            ]
        );
    }

    #[test]
    fn unknown_event_types_are_skipped() {
        let events = normalize(concat!(
            r#"{"type":"sem_ctor","timestamp":0,"sem":{"address":1,"available_units":1}}"#,
            "\n",
            r#"{"type":"reactor_stall","timestamp":1,"duration":12}"#,
        ));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn malformed_json_aborts() {
        let mut normalizer = Normalizer::new();
        let err = normalizer
            .ingest_files(&["{not json".to_string()])
            .expect_err("must abort");
        assert!(matches!(err, NormalizeError::MalformedJson { line: 1, .. }));
    }

    #[test]
    fn empty_input_produces_an_empty_stream() {
        let mut normalizer = Normalizer::new();
        normalizer.ingest_files(&[String::new()]).expect("normalize");
        assert!(normalizer.events().is_empty());
    }

    // ── Wait start/completion pairing ──────────────────────────────

    #[test]
    fn completed_wait_is_finalized_with_its_start_timestamp() {
        let events = normalize(concat!(
            r#"{"type":"sem_ctor","timestamp":100,"sem":{"address":10,"available_units":1}}"#,
            "\n",
            r#"{"type":"sem_wait","timestamp":120,"sem":{"address":10},"pre":{"address":20},"post":{"address":30},"count":1}"#,
            "\n",
            r#"{"type":"sem_signal","timestamp":130,"sem":{"address":10},"vertex":{"address":40},"count":1}"#,
            "\n",
            r#"{"type":"sem_wait_completed","timestamp":140,"sem":{"address":10},"post":{"address":30}}"#,
        ));
        // The wait sorts back to its start position, before the signal.
        assert_eq!(
            events[1],
            NormalizedEvent::SemWait {
                sem: 0,
                pre: 1,
                post: 2,
                count: 1,
                timestamp: 20
            }
        );
        assert!(matches!(
            events[2],
            NormalizedEvent::SemSignal { timestamp: 30, .. }
        ));
    }

    #[test]
    fn unmatched_completion_is_skipped() {
        let events = normalize(concat!(
            r#"{"type":"sem_ctor","timestamp":0,"sem":{"address":10,"available_units":1}}"#,
            "\n",
            r#"{"type":"sem_wait_completed","timestamp":5,"sem":{"address":10},"post":{"address":30}}"#,
        ));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn pending_waits_flush_at_end_of_stream() {
        let events = normalize(concat!(
            r#"{"type":"sem_ctor","timestamp":0,"sem":{"address":10,"available_units":0}}"#,
            "\n",
            r#"{"type":"sem_wait","timestamp":7,"sem":{"address":10},"pre":{"address":20},"post":{"address":30},"count":1}"#,
        ));
        assert_eq!(
            events[1],
            NormalizedEvent::SemWait {
                sem: 0,
                pre: 1,
                post: 2,
                count: 1,
                timestamp: 7
            }
        );
    }

    // ── Moves and destruction suppression ──────────────────────────

    #[test]
    fn moved_identity_keeps_its_id_and_suppresses_its_dtor() {
        let events = normalize(concat!(
            r#"{"type":"sem_ctor","timestamp":0,"sem":{"address":100,"available_units":2}}"#,
            "\n",
            r#"{"type":"sem_move","timestamp":5,"from":{"address":100},"to":{"address":200}}"#,
            "\n",
            r#"{"type":"sem_dtor","timestamp":10,"sem":{"address":100}}"#,
            "\n",
            r#"{"type":"sem_dtor","timestamp":15,"sem":{"address":200}}"#,
        ));
        assert_eq!(
            events,
            vec![
                NormalizedEvent::SemCtor {
                    sem: 0,
                    count: 2,
                    timestamp: 0
                },
                // The source's dtor is gone; the destination retires the
                // same compact id.
                NormalizedEvent::SemDtor {
                    sem: 0,
                    timestamp: 15
                },
            ]
        );
    }

    #[test]
    fn address_reuse_after_destruction_is_a_fresh_identity() {
        let events = normalize(concat!(
            r#"{"type":"vertex_ctor","timestamp":0,"vertex":{"address":100}}"#,
            "\n",
            r#"{"type":"vertex_dtor","timestamp":1,"vertex":{"address":100}}"#,
            "\n",
            r#"{"type":"vertex_ctor","timestamp":2,"vertex":{"address":100}}"#,
        ));
        assert_eq!(
            events,
            vec![
                NormalizedEvent::VertexCtor {
                    vertex: 0,
                    timestamp: 0
                },
                NormalizedEvent::VertexDtor {
                    vertex: 0,
                    timestamp: 1
                },
                NormalizedEvent::VertexCtor {
                    vertex: 1,
                    timestamp: 2
                },
            ]
        );
    }

    // ── Idempotence ────────────────────────────────────────────────

    #[test]
    fn normalizing_the_normalized_stream_is_idempotent() {
        let raw = concat!(
            r#"{"type":"sem_ctor","timestamp":100,"sem":{"address":4096,"available_units":1}}"#,
            "\n",
            r#"{"type":"vertex_ctor","timestamp":110,"vertex":{"address":8192}}"#,
            "\n",
            r#"{"type":"edge","timestamp":115,"pre":{"address":8192},"post":{"address":8448},"speculative":"0"}"#,
            "\n",
            r#"{"type":"sem_wait","timestamp":120,"sem":{"address":4096},"pre":{"address":8192},"post":{"address":8448},"count":1}"#,
            "\n",
            r#"{"type":"sem_wait_completed","timestamp":130,"sem":{"address":4096},"post":{"address":8448}}"#,
            "\n",
            r#"{"type":"sem_signal","timestamp":140,"sem":{"address":4096},"vertex":{"address":8448},"count":1}"#,
            "\n",
            r#"{"type":"sem_dtor","timestamp":150,"sem":{"address":4096}}"#,
        );
        let mut first = Normalizer::new();
        first.ingest_files(&[raw.to_string()]).expect("first pass");
        let mut stream = Vec::new();
        first.write_jsonl(&mut stream).expect("write stream");
        let stream = String::from_utf8(stream).expect("utf8 stream");

        let mut second = Normalizer::new();
        second.ingest_files(&[stream]).expect("second pass");
        assert_eq!(first.events(), second.events());
    }
}
