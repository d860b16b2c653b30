//! Observability sink for `log` and `metric` statements.
//!
//! The engine only talks to the `Observability` trait. `InMemoryObservability`
//! keeps everything in memory for tests and also forwards log statements to
//! the `log` facade so they show up next to engine logs.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use weft::ir::LogLevel;
use weft::{Value, ValueMap};

pub trait Observability: fmt::Debug + Send + Sync {
    fn record_log(&self, level: LogLevel, message: &Value, fields: Option<&ValueMap>);
    fn counter_increment(&self, name: &str, value: f64, labels: Option<&ValueMap>);
    fn counter_add(&self, name: &str, value: f64, labels: Option<&ValueMap>);
    fn counter_set(&self, name: &str, value: f64, labels: Option<&ValueMap>);
    fn record_timing(&self, name: &str, duration_ms: u64, labels: Option<&ValueMap>);
    /// Returns a span id to pass back to `span_end`.
    fn span_start(&self, name: &str) -> u64;
    fn span_end(&self, span_id: u64, status: &str);
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: Value,
    pub fields: ValueMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimingRecord {
    pub name: String,
    pub duration_ms: u64,
    pub labels: ValueMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpanRecord {
    pub id: u64,
    pub name: String,
    pub status: Option<String>,
}

#[derive(Debug, Default)]
struct Recorded {
    logs: Vec<LogRecord>,
    counters: Vec<(String, f64)>,
    timings: Vec<TimingRecord>,
    spans: Vec<SpanRecord>,
}

#[derive(Debug, Default)]
pub struct InMemoryObservability {
    inner: Mutex<Recorded>,
}

/// Counter key: name plus sorted labels, e.g. `orders{region=eu}`.
fn counter_key(name: &str, labels: Option<&ValueMap>) -> String {
    match labels {
        Some(labels) if !labels.is_empty() => {
            let mut parts: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            parts.sort();
            format!("{}{{{}}}", name, parts.join(","))
        }
        _ => name.to_string(),
    }
}

impl InMemoryObservability {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn logs(&self) -> Vec<LogRecord> {
        self.lock().logs.clone()
    }

    pub fn counter(&self, key: &str) -> Option<f64> {
        self.lock()
            .counters
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }

    pub fn timings(&self) -> Vec<TimingRecord> {
        self.lock().timings.clone()
    }

    pub fn spans(&self) -> Vec<SpanRecord> {
        self.lock().spans.clone()
    }

    fn update_counter(&self, name: &str, labels: Option<&ValueMap>, apply: impl FnOnce(f64) -> f64) {
        let key = counter_key(name, labels);
        let mut recorded = self.lock();
        match recorded.counters.iter_mut().find(|(k, _)| *k == key) {
            Some((_, value)) => *value = apply(*value),
            None => recorded.counters.push((key, apply(0.0))),
        }
    }
}

impl Observability for InMemoryObservability {
    fn record_log(&self, level: LogLevel, message: &Value, fields: Option<&ValueMap>) {
        let fields = fields.cloned().unwrap_or_default();
        match level {
            LogLevel::Debug => log::debug!("{} {:?}", message, fields),
            LogLevel::Info => log::info!("{} {:?}", message, fields),
            LogLevel::Warn => log::warn!("{} {:?}", message, fields),
            LogLevel::Error => log::error!("{} {:?}", message, fields),
        }
        self.lock().logs.push(LogRecord {
            level,
            message: message.clone(),
            fields,
        });
    }

    fn counter_increment(&self, name: &str, value: f64, labels: Option<&ValueMap>) {
        self.update_counter(name, labels, |current| current + value);
    }

    fn counter_add(&self, name: &str, value: f64, labels: Option<&ValueMap>) {
        self.update_counter(name, labels, |current| current + value);
    }

    fn counter_set(&self, name: &str, value: f64, labels: Option<&ValueMap>) {
        self.update_counter(name, labels, |_| value);
    }

    fn record_timing(&self, name: &str, duration_ms: u64, labels: Option<&ValueMap>) {
        self.lock().timings.push(TimingRecord {
            name: name.to_string(),
            duration_ms,
            labels: labels.cloned().unwrap_or_default(),
        });
    }

    fn span_start(&self, name: &str) -> u64 {
        let mut recorded = self.lock();
        let id = recorded.spans.len() as u64 + 1;
        recorded.spans.push(SpanRecord {
            id,
            name: name.to_string(),
            status: None,
        });
        id
    }

    fn span_end(&self, span_id: u64, status: &str) {
        if let Some(span) = self.lock().spans.iter_mut().find(|s| s.id == span_id) {
            span.status = Some(status.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_keyed_by_labels() {
        let obs = InMemoryObservability::new();
        let labels: ValueMap = [("region".to_string(), Value::text("eu"))].into_iter().collect();
        obs.counter_increment("orders", 1.0, Some(&labels));
        obs.counter_add("orders", 2.0, Some(&labels));
        obs.counter_increment("orders", 1.0, None);
        assert_eq!(obs.counter("orders{region=eu}"), Some(3.0));
        assert_eq!(obs.counter("orders"), Some(1.0));
        obs.counter_set("orders", 10.0, None);
        assert_eq!(obs.counter("orders"), Some(10.0));
    }

    #[test]
    fn test_spans_close_with_status() {
        let obs = InMemoryObservability::new();
        let id = obs.span_start("flow:checkout");
        obs.span_end(id, "ok");
        assert_eq!(obs.spans()[0].status.as_deref(), Some("ok"));
    }
}
