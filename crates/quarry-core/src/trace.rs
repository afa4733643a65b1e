//! Cross-service trace correlation.
//!
//! Spans are plain values carrying W3C-compatible identifiers (32-hex trace
//! id, 16-hex span id). Parent links are by identifier only, so a span never
//! holds a reference to another span. Context crosses process boundaries in
//! the `traceparent` header.
//!
//! Finished spans are emitted as structured `tracing` events and kept in a
//! bounded in-memory buffer from which a whole trace can be reassembled.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TRACEPARENT_HEADER: &str = "traceparent";

const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// The part of a span that travels with a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
}

impl SpanContext {
    /// Render as a `traceparent` value: `00-{trace_id}-{span_id}-01`.
    pub fn to_traceparent(&self) -> String {
        format!("00-{}-{}-01", self.trace_id, self.span_id)
    }

    /// Parse a `traceparent` value. Rejects malformed or all-zero ids.
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;

        if version.len() != 2 || version == "ff" || !is_hex(version) {
            return None;
        }
        if flags.len() != 2 || !is_hex(flags) {
            return None;
        }
        // Version 00 has exactly four fields.
        if version == "00" && parts.next().is_some() {
            return None;
        }
        if !valid_id(trace_id, 32) || !valid_id(span_id, 16) {
            return None;
        }

        Some(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            span_id: span_id.to_ascii_lowercase(),
        })
    }
}

fn is_hex(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_hexdigit())
}

fn valid_id(id: &str, len: usize) -> bool {
    id.len() == len && is_hex(id) && id.chars().any(|c| c != '0')
}

fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// A named, timed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub operation: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub tags: HashMap<String, String>,
}

impl Span {
    pub fn context(&self) -> SpanContext {
        SpanContext {
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }

    pub fn is_error(&self) -> bool {
        self.tags.get("error").is_some_and(|v| v == "true")
    }
}

/// Options for [`Tracer::create_span`].
#[derive(Debug, Clone, Default)]
pub struct SpanOptions {
    pub operation: String,
    pub parent: Option<SpanContext>,
    pub tags: HashMap<String, String>,
}

impl SpanOptions {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn child_of(mut self, parent: Option<&SpanContext>) -> Self {
        self.parent = parent.cloned();
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Creates and records spans for one service.
#[derive(Clone)]
pub struct Tracer {
    service_name: String,
    capacity: usize,
    finished: Arc<Mutex<VecDeque<Span>>>,
}

impl Tracer {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self::with_capacity(service_name, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(service_name: impl Into<String>, capacity: usize) -> Self {
        Self {
            service_name: service_name.into(),
            capacity: capacity.max(1),
            finished: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    fn lock_finished(&self) -> std::sync::MutexGuard<'_, VecDeque<Span>> {
        self.finished.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned span buffer mutex");
            poisoned.into_inner()
        })
    }

    /// Start a span. Without a parent a new trace is started.
    pub fn create_span(&self, options: SpanOptions) -> Span {
        let (trace_id, parent_span_id) = match options.parent {
            Some(parent) => (parent.trace_id, Some(parent.span_id)),
            None => (new_trace_id(), None),
        };

        let mut tags = options.tags;
        tags.entry("service".to_string())
            .or_insert_with(|| self.service_name.clone());

        Span {
            trace_id,
            span_id: new_span_id(),
            parent_span_id,
            operation: options.operation,
            start_time: Utc::now(),
            end_time: None,
            tags,
        }
    }

    /// Stamp the end time, merge `tags`, emit and buffer the span.
    pub fn finish_span(&self, mut span: Span, tags: HashMap<String, String>) -> Span {
        span.end_time = Some(Utc::now());
        span.tags.extend(tags);

        tracing::info!(
            trace_id = %span.trace_id,
            span_id = %span.span_id,
            parent_span_id = span.parent_span_id.as_deref().unwrap_or(""),
            operation = %span.operation,
            duration_ms = span.duration_ms().unwrap_or(0),
            error = span.is_error(),
            "span finished"
        );

        let mut finished = self.lock_finished();
        if finished.len() >= self.capacity {
            finished.pop_front();
        }
        finished.push_back(span.clone());
        span
    }

    /// Run `f` inside a span. The span's context is handed to `f` so nested
    /// calls can link to it. The result is returned untouched; failures are
    /// tagged on the span.
    pub async fn trace_async_operation<F, Fut, T, E>(
        &self,
        operation: &str,
        parent: Option<&SpanContext>,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(SpanContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let span = self.create_span(SpanOptions::new(operation).child_of(parent));
        let result = f(span.context()).await;

        let mut tags = HashMap::new();
        if let Err(err) = &result {
            tags.insert("error".to_string(), "true".to_string());
            tags.insert("error.message".to_string(), err.to_string());
        }
        self.finish_span(span, tags);

        result
    }

    /// Every buffered span of a trace, ordered by start time.
    pub fn spans_for_trace(&self, trace_id: &str) -> Vec<Span> {
        let mut spans: Vec<Span> = self
            .lock_finished()
            .iter()
            .filter(|s| s.trace_id == trace_id)
            .cloned()
            .collect();
        spans.sort_by_key(|s| (s.start_time, s.parent_span_id.is_some()));
        spans
    }

    pub fn buffered_spans(&self) -> usize {
        self.lock_finished().len()
    }
}

/// Write `context` into outgoing headers.
pub fn inject_headers(context: &SpanContext, headers: &mut HashMap<String, String>) {
    headers.insert(TRACEPARENT_HEADER.to_string(), context.to_traceparent());
}

/// Read a span context from incoming headers. Header names match
/// case-insensitively.
pub fn extract_span_context(headers: &HashMap<String, String>) -> Option<SpanContext> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(TRACEPARENT_HEADER))
        .and_then(|(_, v)| SpanContext::from_traceparent(v))
}
