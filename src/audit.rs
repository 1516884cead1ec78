use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use crossbeam_channel::{Sender, unbounded};
use serde_json::json;

/// Audit events emitted by the session engines. Submission is fire-and-forget:
/// records are queued to a background worker and may complete after the
/// originating WebSocket has closed.
#[derive(Debug, Clone)]
pub enum AuditRecord {
    /// 终端命令记录
    Command {
        name: String,
        command: String,
        asset_id: i64,
        account_id: i64,
        user_id: i64,
        duration_secs: i64,
    },
    /// 高危命令命中记录；`commands` 是与黑名单的交集
    BlackCommand {
        commands: Vec<String>,
        asset_hostname: String,
        account_name: String,
        username: String,
        raw_command: String,
    },
    /// 文件操作记录（上传/下载/重命名/删除）
    FileOperation {
        name: String,
        origin_path: String,
        target_path: String,
        filename: String,
        operate_type: i32,
        operator_id: i64,
        asset_id: i64,
        user_id: i64,
        file_size: u64,
    },
    /// 终端录屏入库
    ReplayUpload { name: String, path: PathBuf, account_id: i64, asset_id: i64, user_id: i64 },
}

impl AuditRecord {
    fn to_json(&self, replay_url: Option<&str>) -> serde_json::Value {
        let date_joined = Utc::now().to_rfc3339();
        match self {
            AuditRecord::Command { name, command, asset_id, account_id, user_id, duration_secs } => {
                json!({
                    "variant": "Command",
                    "name": name,
                    "command": {"command": command},
                    "asset_id": asset_id,
                    "executor_id": account_id,
                    "user_id": user_id,
                    "duration": duration_secs,
                    "date_joined": date_joined,
                })
            }
            AuditRecord::BlackCommand {
                commands,
                asset_hostname,
                account_name,
                username,
                raw_command,
            } => json!({
                "variant": "BlackCommand",
                "commands": commands,
                "asset_hostname": asset_hostname,
                "account_name": account_name,
                "user_name": username,
                "raw_command": raw_command,
                "date_joined": date_joined,
            }),
            AuditRecord::FileOperation {
                name,
                origin_path,
                target_path,
                filename,
                operate_type,
                operator_id,
                asset_id,
                user_id,
                file_size,
            } => json!({
                "variant": "FileOperation",
                "name": name,
                "origin_path": origin_path,
                "target_path": target_path,
                "filename": filename,
                "operate_type": operate_type,
                "operator_id": operator_id,
                "asset_id": asset_id,
                "user_id": user_id,
                "file_size": file_size,
                "date_joined": date_joined,
            }),
            AuditRecord::ReplayUpload { name, path, account_id, asset_id, user_id } => json!({
                "variant": "ReplayUpload",
                "name": name,
                "filename": path.file_name().and_then(|f| f.to_str()).unwrap_or(""),
                "video_path": replay_url.unwrap_or(""),
                "account_id": account_id,
                "asset_id": asset_id,
                "user_id": user_id,
                "date_joined": date_joined,
            }),
        }
    }
}

/// Persistence seam for audit records so tests can collect in memory.
pub trait AuditStore: Send {
    fn persist(&mut self, record: &serde_json::Value) -> anyhow::Result<()>;
}

/// Append-only JSON-lines store, one record per line.
pub struct JsonlAuditStore {
    path: PathBuf,
}

impl JsonlAuditStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl AuditStore for JsonlAuditStore {
    fn persist(&mut self, record: &serde_json::Value) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(f, "{}", record)?;
        Ok(())
    }
}

/// Replay-object storage seam: takes the finished local `.cast` file, returns
/// the stored object's URL.
pub trait ReplayStore: Send {
    fn upload(&self, local_path: &Path) -> anyhow::Result<String>;
}

/// Moves replay files into a local directory; stands in for the object store.
pub struct LocalReplayStore {
    replay_dir: PathBuf,
}

impl LocalReplayStore {
    pub fn new(replay_dir: PathBuf) -> Self {
        Self { replay_dir }
    }
}

impl ReplayStore for LocalReplayStore {
    fn upload(&self, local_path: &Path) -> anyhow::Result<String> {
        std::fs::create_dir_all(&self.replay_dir)?;
        let file_name = local_path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("replay path has no file name"))?;
        let dest = self.replay_dir.join(format!("video-playback-{}", file_name.to_string_lossy()));
        std::fs::copy(local_path, &dest)?;
        std::fs::remove_file(local_path)?;
        Ok(dest.to_string_lossy().into_owned())
    }
}

/// Cloneable submission handle. Dropping every clone shuts the worker down
/// after it drains the queue.
#[derive(Clone)]
pub struct AuditHandle {
    tx: Sender<AuditRecord>,
}

impl AuditHandle {
    /// Enqueue a record. Never blocks and never fails the caller: a closed
    /// queue is logged and dropped.
    pub fn submit(&self, record: AuditRecord) {
        if self.tx.send(record).is_err() {
            tracing::warn!("[audit] worker gone, record dropped");
        }
    }
}

/// Start the audit worker. Store/replay failures are logged and swallowed;
/// they never propagate back into a session.
pub fn spawn_audit_worker(
    mut store: Box<dyn AuditStore>,
    replay: Box<dyn ReplayStore>,
) -> (AuditHandle, std::thread::JoinHandle<()>) {
    let (tx, rx) = unbounded::<AuditRecord>();
    let handle = std::thread::spawn(move || {
        while let Ok(record) = rx.recv() {
            let replay_url = match &record {
                AuditRecord::ReplayUpload { path, .. } => match replay.upload(path) {
                    Ok(url) => Some(url),
                    Err(e) => {
                        tracing::error!("[audit] replay upload failed for {}: {}", path.display(), e);
                        continue;
                    }
                },
                _ => None,
            };
            if let Err(e) = store.persist(&record.to_json(replay_url.as_deref())) {
                tracing::error!("[audit] persist failed: {}", e);
            }
        }
        tracing::debug!("[audit] worker exit");
    });
    (AuditHandle { tx }, handle)
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Store that collects records in memory for assertions.
    #[derive(Clone, Default)]
    pub struct CollectingStore {
        pub records: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    impl AuditStore for CollectingStore {
        fn persist(&mut self, record: &serde_json::Value) -> anyhow::Result<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    pub struct NoopReplayStore;

    impl ReplayStore for NoopReplayStore {
        fn upload(&self, local_path: &Path) -> anyhow::Result<String> {
            Ok(local_path.to_string_lossy().into_owned())
        }
    }
}
