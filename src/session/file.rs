//! SFTP file-manager session: typed control messages over one WebSocket,
//! raw binary frames for upload/download payloads. Every successful control
//! reply carries a fresh listing of `current_path` so the client view stays
//! in sync.

use std::io::{Read, Write};

use serde_json::{Value, json};

use crate::audit::{AuditHandle, AuditRecord};
use crate::backend::sftp::RemoteFs;
use crate::session::Flow;
use crate::session::terminal::SessionMeta;
use crate::ws::{ClientSender, FileControl, WsFrame, file_op_code};

/// 下载分片大小
const DOWNLOAD_CHUNK: usize = 32 * 1024;

/// Decoded control message. String-keyed dispatch from the wire becomes a
/// tagged variant here; parameter validation that keeps the session alive is
/// done during decode.
#[derive(Debug, PartialEq)]
enum FileOp {
    ListDir,
    Mkdir { name: String },
    MkFile { name: String },
    Rename { old_name: String, new_name: String },
    Delete { filename: String, is_dir: bool },
    Cwd { dir_name: Option<String> },
    Upload { origin_path: Option<String>, filename: Option<String> },
    Download { filename: String },
    Finish,
    Unsupported,
}

/// 缺参时返回给前端的提示
const MSG_BAD_PARAMS: &str = "参数不正确！";

fn param_str(params: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    params.get(key).and_then(|v| v.as_str()).map(|s| s.to_string()).filter(|s| !s.is_empty())
}

impl FileOp {
    fn decode(control: &FileControl) -> Result<FileOp, String> {
        let params = &control.params;
        let op = match control.code {
            file_op_code::LISTDIR => FileOp::ListDir,
            file_op_code::MKDIR => FileOp::Mkdir {
                name: param_str(params, "name").ok_or(MSG_BAD_PARAMS)?,
            },
            file_op_code::MKFILE => FileOp::MkFile {
                name: param_str(params, "name").ok_or(MSG_BAD_PARAMS)?,
            },
            file_op_code::RENAME => FileOp::Rename {
                old_name: param_str(params, "old_name").ok_or(MSG_BAD_PARAMS)?,
                new_name: param_str(params, "new_name").ok_or(MSG_BAD_PARAMS)?,
            },
            file_op_code::DELETE => FileOp::Delete {
                filename: param_str(params, "filename").ok_or(MSG_BAD_PARAMS)?,
                // 线上约定：除字面量字符串 "false" 外一律视为目录
                is_dir: params.get("is_dir") != Some(&json!("false")),
            },
            file_op_code::CWD => FileOp::Cwd { dir_name: param_str(params, "dir_name") },
            file_op_code::UPLOAD => FileOp::Upload {
                origin_path: param_str(params, "origin_path"),
                filename: param_str(params, "filename"),
            },
            file_op_code::DOWNLOAD => FileOp::Download {
                filename: param_str(params, "filename").ok_or(MSG_BAD_PARAMS)?,
            },
            file_op_code::FINISH => FileOp::Finish,
            _ => FileOp::Unsupported,
        };
        Ok(op)
    }
}

/// `os.path.join` 语义：绝对路径直接替换当前路径
fn join_path(base: &str, name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), name)
    }
}

fn parent_path(path: &str) -> String {
    match std::path::Path::new(path).parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_string_lossy().into_owned(),
        _ => "/".to_string(),
    }
}

struct UploadState {
    fd: Box<dyn Write + Send>,
    /// 客户端本地源路径，FINISH 时写入审计
    origin_path: String,
    filename: String,
}

pub struct FileSession {
    client: ClientSender,
    fs: Box<dyn RemoteFs>,
    home: String,
    current_path: String,
    upload: Option<UploadState>,
    is_download: Option<bool>,
    audit: AuditHandle,
    meta: SessionMeta,
    closed: bool,
}

impl FileSession {
    pub fn new(
        client: ClientSender,
        fs: Box<dyn RemoteFs>,
        home: String,
        audit: AuditHandle,
        meta: SessionMeta,
    ) -> FileSession {
        let current_path = home.clone();
        FileSession {
            client,
            fs,
            home,
            current_path,
            upload: None,
            is_download: None,
            audit,
            meta,
            closed: false,
        }
    }

    pub fn current_path(&self) -> &str {
        &self.current_path
    }

    pub fn upload_in_progress(&self) -> bool {
        self.upload.is_some()
    }

    fn listing_json(&self) -> Result<String, String> {
        let entries = self.fs.list_dir(&self.current_path)?;
        let listed: Vec<Value> = entries
            .iter()
            .enumerate()
            .map(|(id, e)| json!({"name": e.name, "is_dir": e.is_dir, "id": id}))
            .collect();
        serde_json::to_string(&listed).map_err(|e| e.to_string())
    }

    /// Success reply with a fresh listing; a backend failure here means the
    /// SFTP channel itself is gone, which ends the session.
    fn reply_listing(&mut self) -> Flow {
        match self.listing_json() {
            Ok(listing) => {
                let _ = self.client.send_frame(&WsFrame::success(listing));
                Flow::Continue
            }
            Err(e) => {
                tracing::error!("[file] {} list_dir failed: {}", self.meta.conn_tag, e);
                let _ = self.client.send_frame(&WsFrame::error("fail"));
                Flow::Closed
            }
        }
    }

    fn reply_error(&self, message: &str) -> Flow {
        let _ = self.client.send_frame(&WsFrame::error(message));
        Flow::Continue
    }

    fn submit_file_audit(&self, operate_type: i32, filename: &str, target_path: &str, size: u64) {
        self.audit.submit(AuditRecord::FileOperation {
            name: self.meta.conn_tag.clone(),
            origin_path: self.current_path.clone(),
            target_path: target_path.to_string(),
            filename: filename.to_string(),
            operate_type,
            operator_id: self.meta.account.account_id,
            asset_id: self.meta.asset.asset_id,
            user_id: self.meta.principal.user_id,
            file_size: size,
        });
    }

    fn handle_cwd(&mut self, dir_name: Option<String>) -> Flow {
        let target = match dir_name {
            Some(name) => join_path(&self.current_path, &name),
            // 不带参数表示返回上一级；根目录钉死在 home，不允许再向上
            None => {
                if self.current_path == self.home {
                    self.current_path.clone()
                } else {
                    parent_path(&self.current_path)
                }
            }
        };
        tracing::info!(
            "[file] {} cwd {} -> {}",
            self.meta.conn_tag,
            self.current_path,
            target
        );
        match self.fs.stat(&target) {
            Ok(info) if info.is_dir => {
                self.current_path = target;
                self.reply_listing()
            }
            _ => self.reply_error("没有那个文件或目录"),
        }
    }

    fn handle_upload(&mut self, origin_path: Option<String>, filename: Option<String>) -> Flow {
        if self.upload.is_some() {
            // 进行中的上传未 FINISH，拒绝再次打开
            return self.reply_error("已存在同名文件");
        }
        let (Some(origin_path), Some(filename)) = (origin_path, filename) else {
            return self.reply_error("上传文件参数不正确");
        };
        let file_path = join_path(&self.current_path, &filename);
        if self.fs.stat(&file_path).is_ok() {
            return self.reply_error("已存在同名文件");
        }
        match self.fs.open_append(&file_path) {
            Ok(fd) => {
                self.upload = Some(UploadState { fd, origin_path, filename });
                self.is_download = Some(false);
                let _ = self.client.send_frame(&WsFrame::success("success"));
                Flow::Continue
            }
            Err(e) => {
                tracing::error!("[file] {} open for upload failed: {}", self.meta.conn_tag, e);
                self.reply_error("上传文件参数不正确")
            }
        }
    }

    fn handle_download(&mut self, filename: String) -> Flow {
        let file_path = join_path(&self.current_path, &filename);
        let info = match self.fs.stat(&file_path) {
            Ok(info) => info,
            Err(_) => return self.reply_error("下载失败"),
        };
        if info.is_dir {
            // 连发两条错误帧，前端依赖第二条复位下载状态
            let _ = self.client.send_frame(&WsFrame::error("仅支持文件下载！"));
            return self.reply_error("下载失败");
        }

        self.is_download = Some(true);
        let mut reader = match self.fs.open_read(&file_path) {
            Ok(r) => r,
            Err(_) => return self.reply_error("下载失败"),
        };
        let mut buf = vec![0u8; DOWNLOAD_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    // 空二进制帧 = 传输结束哨兵
                    let _ = self.client.send_binary(Vec::new());
                    break;
                }
                Ok(n) => {
                    if self.client.send_binary(buf[..n].to_vec()).is_err() {
                        return Flow::Closed;
                    }
                }
                Err(e) => {
                    tracing::error!("[file] {} download read failed: {}", self.meta.conn_tag, e);
                    return self.reply_error("下载失败");
                }
            }
        }
        if info.size == 0 {
            // 空文件同样回报下载失败，不产生审计
            return self.reply_error("下载失败");
        }
        self.submit_file_audit(file_op_code::DOWNLOAD, &filename, "", info.size);
        Flow::Continue
    }

    fn handle_finish(&mut self) -> Flow {
        if let Some(upload) = self.upload.take() {
            tracing::info!("[file] {} upload finished: {}", self.meta.conn_tag, upload.filename);
            drop(upload.fd);
            self.submit_file_audit(file_op_code::UPLOAD, &upload.filename, &upload.origin_path, 0);
        }
        self.reply_listing()
    }

    fn handle_op(&mut self, op: FileOp) -> Flow {
        match op {
            FileOp::ListDir => self.reply_listing(),
            FileOp::Mkdir { name } => {
                let path = join_path(&self.current_path, &name);
                match self.fs.mkdir(&path) {
                    Ok(()) => self.reply_listing(),
                    Err(e) => {
                        tracing::error!("[file] {} mkdir failed: {}", self.meta.conn_tag, e);
                        let _ = self.client.send_frame(&WsFrame::error("fail"));
                        Flow::Closed
                    }
                }
            }
            FileOp::MkFile { name } => {
                let path = join_path(&self.current_path, &name);
                match self.fs.create_empty(&path) {
                    Ok(()) => self.reply_listing(),
                    Err(e) => {
                        tracing::error!("[file] {} mkfile failed: {}", self.meta.conn_tag, e);
                        let _ = self.client.send_frame(&WsFrame::error("fail"));
                        Flow::Closed
                    }
                }
            }
            FileOp::Rename { old_name, new_name } => {
                let old_path = join_path(&self.current_path, &old_name);
                let new_path = join_path(&self.current_path, &new_name);
                match self.fs.rename(&old_path, &new_path) {
                    Ok(()) => {
                        let flow = self.reply_listing();
                        self.submit_file_audit(file_op_code::RENAME, &new_name, "", 0);
                        flow
                    }
                    Err(_) => self.reply_error("重命名失败！"),
                }
            }
            FileOp::Delete { filename, is_dir } => {
                let path = join_path(&self.current_path, &filename);
                let removed = if is_dir {
                    self.fs.remove_dir(&path)
                } else {
                    self.fs.remove_file(&path)
                };
                match removed {
                    Ok(()) => {
                        let flow = self.reply_listing();
                        self.submit_file_audit(file_op_code::DELETE, &filename, "", 0);
                        flow
                    }
                    Err(_) => self.reply_error("fail"),
                }
            }
            FileOp::Cwd { dir_name } => self.handle_cwd(dir_name),
            FileOp::Upload { origin_path, filename } => self.handle_upload(origin_path, filename),
            FileOp::Download { filename } => self.handle_download(filename),
            FileOp::Finish => self.handle_finish(),
            FileOp::Unsupported => self.reply_error("暂不支持的文件操作！"),
        }
    }
}

impl crate::session::SessionEngine for FileSession {
    fn on_client_text(&mut self, payload: &str) -> Flow {
        tracing::info!("[file] {} client message: {}", self.meta.conn_tag, payload);
        let control: FileControl = match serde_json::from_str(payload) {
            Ok(c) => c,
            Err(_) => return self.reply_error("数据解析失败！"),
        };
        match FileOp::decode(&control) {
            Ok(op) => self.handle_op(op),
            Err(message) => self.reply_error(&message),
        }
    }

    /// Raw upload payload. Empty frames are ignored; anything arriving
    /// without an open upload is a protocol violation the client is told
    /// about.
    fn on_client_binary(&mut self, payload: &[u8]) -> Flow {
        if self.upload.is_none() {
            return self.reply_error("数据解析失败！");
        }
        if self.is_download == Some(true) || payload.is_empty() {
            return Flow::Continue;
        }
        if let Some(upload) = self.upload.as_mut()
            && let Err(e) = upload.fd.write_all(payload)
        {
            tracing::error!("[file] {} upload write failed: {}", self.meta.conn_tag, e);
            let _ = self.client.send_frame(&WsFrame::error("fail"));
            return Flow::Closed;
        }
        Flow::Continue
    }

    fn poll_backend(&mut self) -> Flow {
        // SFTP 请求都是同步处理，没有独立的后端事件源
        Flow::Continue
    }

    fn on_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(upload) = self.upload.take() {
            tracing::warn!(
                "[file] {} closed with unfinished upload {}",
                self.meta.conn_tag,
                upload.filename
            );
            drop(upload.fd);
        }
    }
}
