//! Terminal replay recorder, asciicast v2: one JSON header line followed by
//! one `[time, "o", text]` JSON array per output event. Disk writes happen on
//! a dedicated writer thread per session so a slow disk never stalls the
//! backend read path; entries are buffered and flushed in batches.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Local, Utc};
use crossbeam_channel::{Sender, unbounded};
use serde_json::json;

/// 缓冲上限；达到后整体落盘，防止长会话占用过多内存
const FLUSH_THRESHOLD: usize = 50;

struct RecordEvent {
    elapsed: f64,
    text: String,
}

/// `<record_root>/<username>/<ip>.<yyyymmddHHMMSS>.cast`
pub fn replay_file_path(record_root: &Path, username: &str, ip: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d%H%M%S");
    record_root.join(username).join(format!("{}.{}.cast", ip, stamp))
}

pub struct Recorder {
    tx: Option<Sender<RecordEvent>>,
    worker: Option<std::thread::JoinHandle<()>>,
    path: PathBuf,
}

impl Recorder {
    /// Open the replay file, write the asciicast header and start the writer
    /// thread.
    pub fn create(path: PathBuf) -> anyhow::Result<Recorder> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let header = json!({
            "version": 2,
            "width": 220,
            "height": 100,
            "timestamp": Utc::now().timestamp(),
            "title": "ssh",
            "env": {
                "TERM": std::env::var("TERM").unwrap_or_default(),
                "SHELL": std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string()),
            },
        });
        writeln!(file, "{}", header)?;

        let (tx, rx) = unbounded::<RecordEvent>();
        let worker_path = path.clone();
        let worker = std::thread::spawn(move || {
            let mut buffer: Vec<RecordEvent> = Vec::new();
            while let Ok(event) = rx.recv() {
                buffer.push(event);
                if buffer.len() >= FLUSH_THRESHOLD {
                    flush(&mut file, &mut buffer, &worker_path);
                }
            }
            flush(&mut file, &mut buffer, &worker_path);
        });
        Ok(Recorder { tx: Some(tx), worker: Some(worker), path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue one output event; `elapsed` is seconds since session start.
    pub fn record(&self, elapsed: f64, text: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(RecordEvent { elapsed, text: text.into() });
        }
    }

    /// Flush everything and close the file. Returns the replay path for the
    /// upload step. Flush failures were already logged by the writer; the
    /// teardown itself cannot fail.
    pub fn finish(mut self) -> PathBuf {
        self.shutdown();
        self.path.clone()
    }

    fn shutdown(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn flush(file: &mut File, buffer: &mut Vec<RecordEvent>, path: &Path) {
    for event in buffer.drain(..) {
        let line = json!([event.elapsed, "o", event.text]);
        if let Err(e) = writeln!(file, "{}", line) {
            tracing::error!("[record] write failed for {}: {}", path.display(), e);
            return;
        }
    }
    if let Err(e) = file.flush() {
        tracing::error!("[record] flush failed for {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cast(name: &str) -> PathBuf {
        use std::sync::atomic::{AtomicU32, Ordering};
        static SEQ: AtomicU32 = AtomicU32::new(0);
        std::env::temp_dir().join(format!(
            "jmsgate-recorder-{}-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::SeqCst),
            name
        ))
    }

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .expect("read cast file")
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    #[test]
    fn header_is_first_line() {
        let path = temp_cast("header.cast");
        let rec = Recorder::create(path.clone()).expect("create");
        drop(rec);
        let lines = read_lines(&path);
        let header: serde_json::Value = serde_json::from_str(&lines[0]).expect("header json");
        assert_eq!(header["version"], 2);
        assert_eq!(header["width"], 220);
        assert_eq!(header["height"], 100);
        assert_eq!(header["title"], "ssh");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn small_bursts_appear_after_close() {
        let path = temp_cast("small.cast");
        let rec = Recorder::create(path.clone()).expect("create");
        for i in 0..7 {
            rec.record(i as f64 * 0.5, format!("chunk-{}", i));
        }
        let finished = rec.finish();
        assert_eq!(finished, path);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1 + 7);
        let entry: serde_json::Value = serde_json::from_str(&lines[3]).expect("entry");
        assert_eq!(entry[1], "o");
        assert_eq!(entry[2], "chunk-2");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn large_bursts_are_fully_persisted() {
        let path = temp_cast("large.cast");
        let rec = Recorder::create(path.clone()).expect("create");
        for i in 0..123 {
            rec.record(i as f64, format!("line-{}", i));
        }
        rec.finish();
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1 + 123);
        let last: serde_json::Value = serde_json::from_str(lines.last().unwrap()).expect("entry");
        assert_eq!(last[2], "line-122");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn replay_path_scheme() {
        let p = replay_file_path(Path::new("/data/records"), "ops", "10.1.2.3");
        let s = p.to_string_lossy();
        assert!(s.starts_with("/data/records/ops/10.1.2.3."));
        assert!(s.ends_with(".cast"));
    }
}
