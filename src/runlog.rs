//! Structured per-run logging.
//!
//! Each run gets `log/<run_id>/` with `meta.json` plus three append-only
//! JSONL streams: `events.jsonl`, `llm_calls.jsonl`, `embedding_calls.jsonl`.
//! Writes go through an mpsc channel to a dedicated writer thread so logging
//! never blocks a pipeline step; `join` flushes everything at shutdown.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum RunLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("log channel closed")]
    Closed,
    #[error("log worker failed: {0}")]
    Join(String),
}

/// Which JSONL stream a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Events,
    LlmCalls,
    EmbeddingCalls,
}

#[derive(Debug)]
struct LogRecord {
    stream: Stream,
    payload: Value,
}

/// Handle for emitting run-log records. Cheap to clone.
#[derive(Clone)]
pub struct RunLogger {
    run_id: String,
    sender: mpsc::Sender<LogRecord>,
    max_text_chars: usize,
}

/// Owns the writer thread; join it once the run is over.
pub struct RunLogWorker {
    handle: Option<std::thread::JoinHandle<Result<(), RunLogError>>>,
    pub run_dir: PathBuf,
}

impl RunLogWorker {
    pub fn join(mut self) -> Result<(), RunLogError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(RunLogError::Join("log worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl RunLogger {
    /// Create `log/<run_id>/`, write `meta.json`, and start the writer thread.
    pub fn new(
        base_dir: &Path,
        run_id: &str,
        meta: Value,
        max_text_chars: usize,
    ) -> Result<(Self, RunLogWorker), RunLogError> {
        let run_dir = base_dir.join(run_id);
        std::fs::create_dir_all(&run_dir)?;

        let meta_payload = json!({
            "run_id": run_id,
            "created_at": Utc::now().to_rfc3339(),
            "meta": meta,
        });
        std::fs::write(
            run_dir.join("meta.json"),
            serde_json::to_string_pretty(&meta_payload)
                .map_err(|e| RunLogError::Serde(e.to_string()))?,
        )?;

        let events = std::fs::File::create(run_dir.join("events.jsonl"))?;
        let llm = std::fs::File::create(run_dir.join("llm_calls.jsonl"))?;
        let embedding = std::fs::File::create(run_dir.join("embedding_calls.jsonl"))?;

        let (sender, receiver) = mpsc::channel::<LogRecord>();
        let handle = std::thread::spawn(move || write_loop(events, llm, embedding, receiver));

        Ok((
            Self {
                run_id: run_id.to_string(),
                sender,
                max_text_chars,
            },
            RunLogWorker {
                handle: Some(handle),
                run_dir,
            },
        ))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn record(&self, stream: Stream, record_type: &str, data: Value) -> Result<(), RunLogError> {
        let payload = json!({
            "ts": Utc::now().to_rfc3339(),
            "run_id": self.run_id,
            "type": record_type,
            "data": data,
        });
        self.sender
            .send(LogRecord { stream, payload })
            .map_err(|_| RunLogError::Closed)
    }

    /// Emit a pipeline event. Failures are swallowed; logging must never take
    /// a run down.
    pub fn log_event(&self, event_type: &str, payload: Value) {
        let _ = self.record(
            Stream::Events,
            "event",
            json!({"event_type": event_type, "payload": payload}),
        );
    }

    /// Record one chat call with request prompt text truncated at the cap.
    pub fn log_llm_call(&self, request: Value, response: Value) {
        let request = self.truncate_field(request, "prompt");
        let response = self.truncate_field(response, "text");
        let _ = self.record(
            Stream::LlmCalls,
            "llm",
            json!({"request": request, "response": response}),
        );
    }

    /// Record one embedding call with input preview truncated at the cap.
    pub fn log_embedding_call(&self, request: Value, response: Value) {
        let request = self.truncate_field(request, "input_preview");
        let _ = self.record(
            Stream::EmbeddingCalls,
            "embedding",
            json!({"request": request, "response": response}),
        );
    }

    fn truncate_field(&self, mut value: Value, field: &str) -> Value {
        let Some(obj) = value.as_object_mut() else {
            return value;
        };
        let Some(Value::String(text)) = obj.get(field) else {
            return value;
        };
        let orig_len = text.chars().count();
        if orig_len > self.max_text_chars {
            let truncated: String = text.chars().take(self.max_text_chars).collect();
            obj.insert(field.to_string(), Value::String(truncated));
            obj.insert(format!("{field}_truncated"), Value::Bool(true));
        } else {
            obj.insert(format!("{field}_truncated"), Value::Bool(false));
        }
        obj.insert(format!("{field}_len"), json!(orig_len));
        value
    }
}

fn write_loop(
    events: std::fs::File,
    llm: std::fs::File,
    embedding: std::fs::File,
    receiver: mpsc::Receiver<LogRecord>,
) -> Result<(), RunLogError> {
    let mut events = BufWriter::new(events);
    let mut llm = BufWriter::new(llm);
    let mut embedding = BufWriter::new(embedding);

    for record in receiver {
        let line = serde_json::to_string(&record.payload)
            .map_err(|e| RunLogError::Serde(e.to_string()))?;
        let writer = match record.stream {
            Stream::Events => &mut events,
            Stream::LlmCalls => &mut llm,
            Stream::EmbeddingCalls => &mut embedding,
        };
        writeln!(writer, "{line}")?;
    }

    events.flush()?;
    llm.flush()?;
    embedding.flush()?;
    Ok(())
}

/// A usage sink that forwards gateway call records into the run log.
pub struct RunLogUsageSink {
    logger: RunLogger,
}

impl RunLogUsageSink {
    pub fn new(logger: RunLogger) -> Self {
        Self { logger }
    }
}

#[async_trait::async_trait]
impl crate::gateway::UsageSink for RunLogUsageSink {
    async fn record(&self, record: crate::gateway::usage::ProviderCallRecord) {
        let payload = json!({
            "provider": record.provider,
            "model": record.model,
            "caller": record.caller,
            "input_tokens": record.input_tokens,
            "output_tokens": record.output_tokens,
            "latency_ms": record.latency_ms,
            "status": record.status.as_str(),
            "error_code": record.error_code,
        });
        match record.endpoint {
            "embeddings" => self
                .logger
                .log_embedding_call(json!({"model": record.model}), payload),
            _ => self
                .logger
                .log_llm_call(json!({"model": record.model, "caller": record.caller}), payload),
        }
    }
}

/// Serialize any value for event payloads, falling back to `null`.
pub fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_marks_long_text() {
        let dir = std::env::temp_dir().join(format!("storyforge-runlog-{}", std::process::id()));
        let (logger, worker) =
            RunLogger::new(&dir, "run_test", json!({}), 10).expect("logger");
        logger.log_llm_call(
            json!({"prompt": "0123456789abcdef"}),
            json!({"text": "short"}),
        );
        drop(logger);
        worker.join().expect("join");

        let raw =
            std::fs::read_to_string(dir.join("run_test").join("llm_calls.jsonl")).expect("read");
        let line: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(line["data"]["request"]["prompt"], "0123456789");
        assert_eq!(line["data"]["request"]["prompt_truncated"], true);
        assert_eq!(line["data"]["request"]["prompt_len"], 16);
        assert_eq!(line["data"]["response"]["text_truncated"], false);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
