//! Outbound delta stream
//!
//! The sole output channel to the parent process: line-delimited JSON on
//! stdout. Deltas buffer and coalesce per model class, and a background
//! flusher honors the earliest `flush_within` deadline requested so far.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::warn;

pub const DELTA_TYPE_PERSIST: &str = "persist";
pub const DELTA_TYPE_UNPERSIST: &str = "unpersist";
pub const DELTA_TYPE_METADATA_EXPIRATION: &str = "metadata-expiration";

/// Default flush latency when a caller doesn't ask for better.
pub const DEFAULT_FLUSH_WITHIN: Duration = Duration::from_millis(200);

/// One buffered delta: a `{type, modelClass}` pair carrying one or more
/// model JSON payloads, each id at most once.
#[derive(Debug, Clone)]
pub struct DeltaStreamItem {
    pub delta_type: &'static str,
    pub model_class: String,
    pub model_jsons: Vec<serde_json::Value>,
    id_indexes: HashMap<String, usize>,
}

impl DeltaStreamItem {
    pub fn new(delta_type: &'static str, model_class: &str) -> Self {
        DeltaStreamItem {
            delta_type,
            model_class: model_class.to_string(),
            model_jsons: Vec::new(),
            id_indexes: HashMap::new(),
        }
    }

    pub fn with_json(
        delta_type: &'static str,
        model_class: &str,
        json: serde_json::Value,
    ) -> Self {
        let mut item = Self::new(delta_type, model_class);
        item.upsert_model_json(json);
        item
    }

    /// Add or merge one model payload. If the id is already present, the
    /// later emission merges into the earlier: keys present in `json`
    /// overwrite, keys absent are preserved. A save that omits `body`
    /// because it didn't change must not erase the body a prior delta in
    /// the same flush carried.
    pub fn upsert_model_json(&mut self, json: serde_json::Value) {
        let id = json
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if let Some(&idx) = self.id_indexes.get(&id) {
            if let (Some(existing), Some(incoming)) =
                (self.model_jsons[idx].as_object_mut(), json.as_object())
            {
                for (k, v) in incoming {
                    existing.insert(k.clone(), v.clone());
                }
            }
        } else {
            self.id_indexes.insert(id, self.model_jsons.len());
            self.model_jsons.push(json);
        }
    }

    /// Fold `other` into self when the `{type, modelClass}` pair matches.
    pub fn concatenate(&mut self, other: DeltaStreamItem) -> Result<(), DeltaStreamItem> {
        if other.delta_type != self.delta_type || other.model_class != self.model_class {
            return Err(other);
        }
        for json in other.model_jsons {
            self.upsert_model_json(json);
        }
        Ok(())
    }

    pub fn dump(&self) -> String {
        json!({
            "type": self.delta_type,
            "objectClass": self.model_class,
            "modelJSONs": self.model_jsons,
        })
        .to_string()
    }
}

struct StreamState {
    buffer: Vec<DeltaStreamItem>,
    deadline: Option<Instant>,
}

/// Buffered, coalescing writer shared by every worker. Instantiable (with
/// any sink) so tests can observe emitted lines.
pub struct DeltaStream {
    state: Mutex<StreamState>,
    sink: Mutex<Box<dyn Write + Send>>,
    notify: Notify,
}

impl DeltaStream {
    pub fn new(sink: Box<dyn Write + Send>) -> Arc<Self> {
        Arc::new(DeltaStream {
            state: Mutex::new(StreamState {
                buffer: Vec::new(),
                deadline: None,
            }),
            sink: Mutex::new(sink),
            notify: Notify::new(),
        })
    }

    pub fn stdout() -> Arc<Self> {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Queue a delta and guarantee a flush within `within`.
    pub fn emit(&self, item: DeltaStreamItem, within: Duration) {
        {
            let mut state = self.state.lock();
            let mut item = Some(item);
            for existing in state.buffer.iter_mut() {
                match existing.concatenate(item.take().unwrap()) {
                    Ok(()) => break,
                    Err(returned) => item = Some(returned),
                }
            }
            if let Some(item) = item {
                state.buffer.push(item);
            }
        }
        self.flush_within(within);
    }

    /// Guarantee a flush no later than `within` from now. An earlier
    /// deadline than the pending one wakes the flusher sooner.
    pub fn flush_within(&self, within: Duration) {
        let target = Instant::now() + within;
        let should_notify = {
            let mut state = self.state.lock();
            match state.deadline {
                Some(existing) if existing <= target => false,
                _ => {
                    state.deadline = Some(target);
                    true
                }
            }
        };
        // Notify outside the buffer lock: the flusher takes the buffer
        // lock inside flush_buffer.
        if should_notify {
            self.notify.notify_one();
        }
    }

    /// Write out everything currently buffered.
    pub fn flush_buffer(&self) {
        let items = {
            let mut state = self.state.lock();
            state.deadline = None;
            std::mem::take(&mut state.buffer)
        };
        if items.is_empty() {
            return;
        }
        let mut sink = self.sink.lock();
        for item in items {
            if let Err(err) = writeln!(sink, "{}", item.dump()) {
                warn!(error = %err, "delta stream write failed");
                return;
            }
        }
        let _ = sink.flush();
    }

    /// Background flusher; runs until the process exits.
    pub async fn run_flush_loop(self: Arc<Self>) {
        loop {
            let deadline = self.state.lock().deadline;
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        self.flush_buffer();
                    } else {
                        tokio::select! {
                            _ = tokio::time::sleep(deadline - now) => self.flush_buffer(),
                            _ = self.notify.notified() => {}
                        }
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Emit a single JSON object immediately, bypassing the buffer. Used
    /// by the account test mode, which must write exactly one line.
    pub fn emit_raw_immediate(&self, value: &serde_json::Value) {
        let mut sink = self.sink.lock();
        let _ = writeln!(sink, "{}", value);
        let _ = sink.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn stream_with_sink() -> (Arc<DeltaStream>, Arc<Mutex<Vec<u8>>>) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let stream = DeltaStream::new(Box::new(SharedSink(sink.clone())));
        (stream, sink)
    }

    fn lines(sink: &Arc<Mutex<Vec<u8>>>) -> Vec<serde_json::Value> {
        String::from_utf8(sink.lock().clone())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn same_id_emissions_merge_preserving_missing_keys() {
        let mut item = DeltaStreamItem::with_json(
            DELTA_TYPE_PERSIST,
            "Message",
            json!({"id": "m1", "subject": "Hi", "body": "full body"}),
        );
        item.upsert_model_json(json!({"id": "m1", "subject": "Hi (edited)"}));
        assert_eq!(item.model_jsons.len(), 1);
        assert_eq!(item.model_jsons[0]["subject"], "Hi (edited)");
        assert_eq!(item.model_jsons[0]["body"], "full body");
    }

    #[test]
    fn distinct_ids_stay_separate() {
        let mut item =
            DeltaStreamItem::with_json(DELTA_TYPE_PERSIST, "Message", json!({"id": "m1"}));
        item.upsert_model_json(json!({"id": "m2"}));
        assert_eq!(item.model_jsons.len(), 2);
    }

    #[test]
    fn concatenate_refuses_mismatched_class() {
        let mut a = DeltaStreamItem::with_json(DELTA_TYPE_PERSIST, "Message", json!({"id": "m"}));
        let b = DeltaStreamItem::with_json(DELTA_TYPE_PERSIST, "Thread", json!({"id": "t"}));
        assert!(a.concatenate(b).is_err());
        let c = DeltaStreamItem::with_json(DELTA_TYPE_UNPERSIST, "Message", json!({"id": "m2"}));
        assert!(a.concatenate(c).is_err());
    }

    #[test]
    fn flush_coalesces_per_class_and_emits_each_entity_once() {
        let (stream, sink) = stream_with_sink();
        stream.emit(
            DeltaStreamItem::with_json(DELTA_TYPE_PERSIST, "Message", json!({"id": "m1", "v": 1})),
            Duration::from_secs(5),
        );
        stream.emit(
            DeltaStreamItem::with_json(DELTA_TYPE_PERSIST, "Message", json!({"id": "m1", "v": 2})),
            Duration::from_secs(5),
        );
        stream.emit(
            DeltaStreamItem::with_json(DELTA_TYPE_PERSIST, "Thread", json!({"id": "t1"})),
            Duration::from_secs(5),
        );
        stream.flush_buffer();

        let lines = lines(&sink);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["objectClass"], "Message");
        assert_eq!(lines[0]["modelJSONs"].as_array().unwrap().len(), 1);
        assert_eq!(lines[0]["modelJSONs"][0]["v"], 2);
        assert_eq!(lines[1]["objectClass"], "Thread");
    }

    #[test]
    fn earlier_deadline_replaces_later_one() {
        let (stream, _sink) = stream_with_sink();
        stream.flush_within(Duration::from_secs(60));
        let d1 = stream.state.lock().deadline.unwrap();
        stream.flush_within(Duration::from_millis(1));
        let d2 = stream.state.lock().deadline.unwrap();
        assert!(d2 < d1);
        // and a later request must not push it back out
        stream.flush_within(Duration::from_secs(60));
        let d3 = stream.state.lock().deadline.unwrap();
        assert_eq!(d2, d3);
    }

    #[tokio::test]
    async fn flush_loop_honors_deadline() {
        let (stream, sink) = stream_with_sink();
        let handle = tokio::spawn(stream.clone().run_flush_loop());
        stream.emit(
            DeltaStreamItem::with_json(DELTA_TYPE_PERSIST, "Message", json!({"id": "m1"})),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(lines(&sink).len(), 1);
        handle.abort();
    }
}
