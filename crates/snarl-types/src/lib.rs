//! Canonicalized trace-event model.
//!
//! The normalizer turns raw runtime logs into a stream of these events;
//! the graph builder consumes the stream to construct the happens-before
//! DAG. On the wire each event is one JSON line tagged by a `type` field,
//! with all identifiers compactified to small dense integers.

use facet::Facet;

/// Compact identifier assigned by the normalizer.
///
/// Dense, small, and shared between semaphores and vertices: the first
/// identity seen gets 0, the next 1, and so on.
pub type CompactId = u32;

/// One canonicalized trace event.
///
/// Timestamps are nanoseconds, zero-shifted so the earliest event of the
/// run is 0. Streams handed to the graph builder are sorted by timestamp
/// (stable on ties).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedEvent {
    /// A semaphore came into existence with `count` initial units.
    SemCtor {
        sem: CompactId,
        count: u64,
        timestamp: i64,
    },
    /// A semaphore was destroyed.
    SemDtor { sem: CompactId, timestamp: i64 },
    /// A vertex came into existence. Lifecycle only; carries no ordering.
    VertexCtor { vertex: CompactId, timestamp: i64 },
    /// A vertex was destroyed.
    VertexDtor { vertex: CompactId, timestamp: i64 },
    /// Happens-before constraint: `pre` must complete before `post` runs.
    Edge {
        pre: CompactId,
        post: CompactId,
        speculative: bool,
        timestamp: i64,
    },
    /// Vertex `post` waited for `count` units of `sem`, ordered after `pre`.
    SemWait {
        sem: CompactId,
        pre: CompactId,
        post: CompactId,
        count: u64,
        timestamp: i64,
    },
    /// Vertex `vertex` returned `count` units to `sem`.
    SemSignal {
        sem: CompactId,
        vertex: CompactId,
        count: u64,
        timestamp: i64,
    },
}

impl NormalizedEvent {
    /// The wire tag for this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SemCtor { .. } => "sem_ctor",
            Self::SemDtor { .. } => "sem_dtor",
            Self::VertexCtor { .. } => "vertex_ctor",
            Self::VertexDtor { .. } => "vertex_dtor",
            Self::Edge { .. } => "edge",
            Self::SemWait { .. } => "sem_wait",
            Self::SemSignal { .. } => "sem_signal",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Self::SemCtor { timestamp, .. }
            | Self::SemDtor { timestamp, .. }
            | Self::VertexCtor { timestamp, .. }
            | Self::VertexDtor { timestamp, .. }
            | Self::Edge { timestamp, .. }
            | Self::SemWait { timestamp, .. }
            | Self::SemSignal { timestamp, .. } => *timestamp,
        }
    }

    /// Encodes this event as one JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, String> {
        let encode = |e| format!("encode {} record: {e}", self.kind());
        match *self {
            Self::SemCtor {
                sem,
                count,
                timestamp,
            } => facet_json::to_string(&SemCtorRecord {
                r#type: self.kind().to_string(),
                sem,
                count,
                timestamp,
            })
            .map_err(encode),
            Self::SemDtor { sem, timestamp } => facet_json::to_string(&SemDtorRecord {
                r#type: self.kind().to_string(),
                sem,
                timestamp,
            })
            .map_err(encode),
            Self::VertexCtor { vertex, timestamp } => facet_json::to_string(&VertexRecord {
                r#type: self.kind().to_string(),
                vertex,
                timestamp,
            })
            .map_err(encode),
            Self::VertexDtor { vertex, timestamp } => facet_json::to_string(&VertexRecord {
                r#type: self.kind().to_string(),
                vertex,
                timestamp,
            })
            .map_err(encode),
            Self::Edge {
                pre,
                post,
                speculative,
                timestamp,
            } => facet_json::to_string(&EdgeRecord {
                r#type: self.kind().to_string(),
                pre,
                post,
                speculative,
                timestamp,
            })
            .map_err(encode),
            Self::SemWait {
                sem,
                pre,
                post,
                count,
                timestamp,
            } => facet_json::to_string(&SemWaitRecord {
                r#type: self.kind().to_string(),
                sem,
                pre,
                post,
                count,
                timestamp,
            })
            .map_err(encode),
            Self::SemSignal {
                sem,
                vertex,
                count,
                timestamp,
            } => facet_json::to_string(&SemSignalRecord {
                r#type: self.kind().to_string(),
                sem,
                vertex,
                count,
                timestamp,
            })
            .map_err(encode),
        }
    }
}

// ── Wire records ────────────────────────────────────────────────
//
// One struct per line shape. The tag travels as a plain `type` field.

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct SemCtorRecord {
    pub r#type: String,
    pub sem: CompactId,
    pub count: u64,
    pub timestamp: i64,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct SemDtorRecord {
    pub r#type: String,
    pub sem: CompactId,
    pub timestamp: i64,
}

/// Shared by `vertex_ctor` and `vertex_dtor`.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct VertexRecord {
    pub r#type: String,
    pub vertex: CompactId,
    pub timestamp: i64,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct EdgeRecord {
    pub r#type: String,
    pub pre: CompactId,
    pub post: CompactId,
    pub speculative: bool,
    pub timestamp: i64,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct SemWaitRecord {
    pub r#type: String,
    pub sem: CompactId,
    pub pre: CompactId,
    pub post: CompactId,
    pub count: u64,
    pub timestamp: i64,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct SemSignalRecord {
    pub r#type: String,
    pub sem: CompactId,
    pub vertex: CompactId,
    pub count: u64,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sem_ctor_line_carries_tag_and_fields() {
        let line = NormalizedEvent::SemCtor {
            sem: 0,
            count: 2,
            timestamp: 0,
        }
        .to_json_line()
        .expect("encode sem_ctor");
        assert!(line.contains("\"type\":\"sem_ctor\""), "line: {line}");
        assert!(line.contains("\"sem\":0"), "line: {line}");
        assert!(line.contains("\"count\":2"), "line: {line}");
        assert!(line.contains("\"timestamp\":0"), "line: {line}");
    }

    #[test]
    fn wait_line_keeps_pre_and_post() {
        let line = NormalizedEvent::SemWait {
            sem: 1,
            pre: 2,
            post: 3,
            count: 1,
            timestamp: 40,
        }
        .to_json_line()
        .expect("encode sem_wait");
        assert!(line.contains("\"type\":\"sem_wait\""), "line: {line}");
        assert!(line.contains("\"pre\":2"), "line: {line}");
        assert!(line.contains("\"post\":3"), "line: {line}");
    }

    #[test]
    fn edge_line_has_boolean_speculative() {
        let line = NormalizedEvent::Edge {
            pre: 0,
            post: 1,
            speculative: false,
            timestamp: 7,
        }
        .to_json_line()
        .expect("encode edge");
        assert!(line.contains("\"speculative\":false"), "line: {line}");
    }

    #[test]
    fn kind_matches_wire_tag() {
        let dtor = NormalizedEvent::SemDtor {
            sem: 4,
            timestamp: 9,
        };
        assert_eq!(dtor.kind(), "sem_dtor");
        let line = dtor.to_json_line().expect("encode sem_dtor");
        assert!(line.contains("\"type\":\"sem_dtor\""), "line: {line}");
    }
}
