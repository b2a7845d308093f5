//! Append-only record storage.
//!
//! Every inbound message lands as one line in
//! `<data_dir>/<device_id>/<YYYY-MM-DD>_<topic_suffix>.jsonl`. The payload
//! bytes are appended verbatim - nothing is re-shaped - and files are
//! opened, written and released per message, so a crash can truncate at
//! most the final line. Records are never rewritten or deleted here.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to write record: {0}")]
    Io(#[from] std::io::Error),
}

pub struct RecordStore {
    data_dir: PathBuf,
    // One lock per target path: writers to the same file must not
    // interleave lines. Distinct paths never contend.
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl RecordStore {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Validates the payload as JSON and appends it to the file selected
    /// by (device_id, date, topic_suffix). Returns the target path.
    pub fn record(&self, topic: &str, payload: &[u8]) -> Result<PathBuf, StoreError> {
        let data: serde_json::Value = serde_json::from_slice(payload)?;

        let device_id = device_id_for(&data, topic);
        let timestamp = data
            .get("timestamp")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());

        let device_dir = self.data_dir.join(&device_id);
        fs::create_dir_all(&device_dir)?;

        let file_name = format!("{}_{}.jsonl", date_portion(&timestamp), topic_suffix(topic));
        let path = device_dir.join(file_name);

        let lock = self.lock_for(&path);
        let _guard = lock.lock();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(payload)?;
        file.write_all(b"\n")?;
        file.flush()?;

        debug!("stored record at {:?}", path);
        Ok(path)
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }
}

/// Device identity: the payload field when present, else the
/// second-to-last topic segment, else "unknown".
fn device_id_for(data: &serde_json::Value, topic: &str) -> String {
    if let Some(id) = data.get("device_id").and_then(|v| v.as_str()) {
        return id.to_string();
    }
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() > 2 {
        segments[segments.len() - 2].to_string()
    } else {
        "unknown".to_string()
    }
}

fn topic_suffix(topic: &str) -> &str {
    topic.rsplit('/').next().unwrap_or(topic)
}

/// The date half of an ISO-8601-ish timestamp, whether 'T'- or
/// space-separated.
fn date_portion(timestamp: &str) -> &str {
    let head = timestamp.split('T').next().unwrap_or(timestamp);
    head.split(' ').next().unwrap_or(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn routes_by_device_date_and_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());

        let payload =
            br#"{"device_id": "abc123", "timestamp": "2023-01-01T12:00:00", "cpu_percent": 12.5}"#;
        let path = store.record("iot/device/abc123/system", payload).unwrap();

        assert_eq!(path, dir.path().join("abc123").join("2023-01-01_system.jsonl"));
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].as_bytes(), payload);
    }

    #[test]
    fn device_id_falls_back_to_topic_segment() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());

        let payload = br#"{"timestamp": "2023-01-01T12:00:00", "value": 1}"#;
        let path = store.record("iot/device/abc123/resources", payload).unwrap();

        assert_eq!(
            path,
            dir.path().join("abc123").join("2023-01-01_resources.jsonl")
        );
    }

    #[test]
    fn short_topic_without_device_id_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());

        let payload = br#"{"timestamp": "2023-01-01T12:00:00"}"#;
        let path = store.record("iot/full", payload).unwrap();

        assert_eq!(path, dir.path().join("unknown").join("2023-01-01_full.jsonl"));
    }

    #[test]
    fn malformed_payload_touches_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());

        let result = store.record("iot/device/abc123/system", b"This is not JSON");
        assert!(matches!(result, Err(StoreError::Json(_))));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn stored_line_is_byte_identical_to_the_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());

        let snapshot = vigil_devkit::VigilMessageBuilder::snapshot("abc123", "2023-01-01T12:00:00");
        let payload = serde_json::to_vec(&snapshot).unwrap();
        let path = store.record("iot/device/abc123/full", &payload).unwrap();

        let stored = fs::read(&path).unwrap();
        assert_eq!(&stored[..stored.len() - 1], payload.as_slice());
        assert_eq!(stored.last(), Some(&b'\n'));
    }

    #[test]
    fn space_separated_timestamps_still_route_by_date() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());

        let payload = br#"{"device_id": "edge-7", "timestamp": "2023-06-15 08:30:00"}"#;
        let path = store.record("iot/device/edge-7/network", payload).unwrap();

        assert_eq!(
            path,
            dir.path().join("edge-7").join("2023-06-15_network.jsonl")
        );
    }

    #[test]
    fn missing_timestamp_uses_the_wall_clock() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());

        let payload = br#"{"device_id": "abc123", "value": 42}"#;
        let path = store.record("iot/device/abc123/system", payload).unwrap();

        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with(&today), "unexpected file {file_name}");
    }

    #[test]
    fn repeated_messages_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());

        for n in 0..3 {
            let payload =
                format!(r#"{{"device_id": "abc123", "timestamp": "2023-01-01T12:00:0{n}", "n": {n}}}"#);
            store
                .record("iot/device/abc123/resources", payload.as_bytes())
                .unwrap();
        }

        let path = dir.path().join("abc123").join("2023-01-01_resources.jsonl");
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 3);
        for (n, line) in lines.iter().enumerate() {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["n"], n as u64);
        }
    }

    #[test]
    fn concurrent_writers_to_one_file_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::new(dir.path()));

        std::thread::scope(|scope| {
            for n in 0..8 {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    let payload = format!(
                        r#"{{"device_id": "abc123", "timestamp": "2023-01-01T12:00:00", "writer": {n}}}"#
                    );
                    store
                        .record("iot/device/abc123/full", payload.as_bytes())
                        .unwrap();
                });
            }
        });

        let path = dir.path().join("abc123").join("2023-01-01_full.jsonl");
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 8);
        for line in lines {
            serde_json::from_str::<serde_json::Value>(&line).unwrap();
        }
    }
}
