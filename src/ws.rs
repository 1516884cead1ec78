use std::collections::HashMap;

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};

/// 前端协定的消息码；数值是线上既定值，不可调整
pub mod ws_code {
    pub const ERROR: i32 = 0;
    pub const SUCCESS: i32 = 1;
    pub const TEXT: i32 = 2;
}

/// 文件操作码，与前端文件管理器约定一致
pub mod file_op_code {
    pub const LISTDIR: i32 = 1;
    pub const MKDIR: i32 = 2;
    pub const MKFILE: i32 = 3;
    pub const RENAME: i32 = 4;
    pub const DELETE: i32 = 5;
    pub const CWD: i32 = 6;
    pub const UPLOAD: i32 = 7;
    pub const DOWNLOAD: i32 = 8;
    pub const FINISH: i32 = 9;
}

/// The `{code, message}` JSON envelope shared by every text frame the gateway
/// emits.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WsFrame {
    pub code: i32,
    pub message: String,
}

impl WsFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self { code: ws_code::ERROR, message: message.into() }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self { code: ws_code::SUCCESS, message: message.into() }
    }

    pub fn text(message: impl Into<String>) -> Self {
        Self { code: ws_code::TEXT, message: message.into() }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Inbound control message of the file manager: `{"code": <int>, "params": {...}}`.
#[derive(Deserialize, Debug)]
pub struct FileControl {
    pub code: i32,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// Frames queued by a session engine for delivery to the browser. The pump
/// thread owning the WebSocket drains this queue; engines never touch the
/// socket directly.
#[derive(Debug)]
pub enum OutFrame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Cloneable sending half handed to session engines and worker threads.
#[derive(Clone)]
pub struct ClientSender {
    tx: Sender<OutFrame>,
}

impl ClientSender {
    pub fn channel() -> (ClientSender, Receiver<OutFrame>) {
        let (tx, rx) = unbounded();
        (ClientSender { tx }, rx)
    }

    /// Send a raw text frame. Errors mean the pump is gone; callers treat
    /// that as "client disconnected" and unwind.
    pub fn send_text(&self, payload: impl Into<String>) -> anyhow::Result<()> {
        self.tx
            .send(OutFrame::Text(payload.into()))
            .map_err(|_| anyhow::anyhow!("client connection closed"))
    }

    pub fn send_frame(&self, frame: &WsFrame) -> anyhow::Result<()> {
        self.send_text(frame.to_json())
    }

    pub fn send_binary(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        self.tx
            .send(OutFrame::Binary(payload))
            .map_err(|_| anyhow::anyhow!("client connection closed"))
    }

    /// Ask the pump to close the WebSocket after flushing queued frames.
    pub fn close(&self) {
        let _ = self.tx.send(OutFrame::Close);
    }
}

/// Query parameters of the WebSocket handshake URL, e.g.
/// `ws/terminal/?asset_id=3&account_id=5`.
#[derive(Debug, Clone, Default)]
pub struct SessionQuery {
    params: HashMap<String, String>,
}

impl SessionQuery {
    pub fn parse(query: &str) -> Self {
        let mut params = HashMap::new();
        for pair in query.split('&') {
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((k, v)) => params.insert(k.to_string(), v.to_string()),
                None => params.insert(pair.to_string(), String::new()),
            };
        }
        Self { params }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|v| v.parse().ok())
    }
}
