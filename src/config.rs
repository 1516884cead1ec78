use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Gateway runtime configuration, persisted as JSON under `~/.jmsgate/`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// WebSocket 服务监听地址
    pub listen_addr: String,
    pub guacd_host: String,
    pub guacd_port: u16,
    pub screen_width: u32,
    pub screen_height: u32,
    /// RDP/VNC 录像目录（guacd 侧路径）
    pub replay_dir: PathBuf,
    /// SSH 终端录屏（asciicast）根目录
    pub record_root: PathBuf,
    /// 文件管理会话的根目录，CWD 不允许越过该目录
    pub remote_file_home_path: String,
    /// 资产/账号/黑名单库
    pub directory_db_path: PathBuf,
    /// 审计 JSONL 输出
    pub audit_log_path: PathBuf,
    /// 透传给 guacd connect 握手的可选参数
    #[serde(default)]
    pub guacd_options: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        let base = storage_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            listen_addr: "0.0.0.0:8022".to_string(),
            guacd_host: "127.0.0.1".to_string(),
            guacd_port: 4822,
            screen_width: 800,
            screen_height: 600,
            replay_dir: PathBuf::from("/data/jms/videos"),
            record_root: base.join("records"),
            remote_file_home_path: "/home/jms".to_string(),
            directory_db_path: base.join("directory.db"),
            audit_log_path: base.join("audit.jsonl"),
            guacd_options: default_guacd_options(),
        }
    }
}

/// guacd 连接参数默认值；键使用 guacd 的连字符写法
fn default_guacd_options() -> HashMap<String, String> {
    HashMap::from([
        ("ignore-cert".to_string(), "true".to_string()),
        ("security".to_string(), "any".to_string()),
        ("disable-auth".to_string(), "true".to_string()),
        ("recording-path".to_string(), "/data/jms/videos".to_string()),
        ("create-recording-path".to_string(), "true".to_string()),
        ("enable-wallpaper".to_string(), "true".to_string()),
    ])
}

pub fn storage_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".jmsgate"))
}

impl Config {
    /// Load the config, creating the storage dir and a default config file on
    /// first run. An explicit `--config` path skips the default location.
    pub fn init(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::read_from(path);
        }
        let dir = storage_dir()
            .ok_or_else(|| anyhow::anyhow!("cannot determine user's home directory"))?;
        std::fs::create_dir_all(&dir)?;
        let config_path = dir.join("config.json");
        if !config_path.exists() {
            let config = Config::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }
        Self::read_from(&config_path)
    }

    pub fn read_from(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context as _;
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件 {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("配置文件解析失败 {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context as _;
        let pretty = serde_json::to_string_pretty(self)?;
        std::fs::write(path, pretty)
            .with_context(|| format!("无法写入配置文件 {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_json() {
        let config = Config::default();
        let raw = serde_json::to_string(&config).expect("serialize");
        let back: Config = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back.guacd_port, 4822);
        assert_eq!(back.screen_width, 800);
        assert_eq!(back.guacd_options.get("security").map(String::as_str), Some("any"));
    }

    #[test]
    fn missing_guacd_options_defaults_to_empty() {
        // older config files predate the options map
        let raw = r#"{
            "listen_addr": "127.0.0.1:9000",
            "guacd_host": "127.0.0.1",
            "guacd_port": 4822,
            "screen_width": 1024,
            "screen_height": 768,
            "replay_dir": "/tmp/replay",
            "record_root": "/tmp/records",
            "remote_file_home_path": "/home/jms",
            "directory_db_path": "/tmp/directory.db",
            "audit_log_path": "/tmp/audit.jsonl"
        }"#;
        let config: Config = serde_json::from_str(raw).expect("deserialize");
        assert!(config.guacd_options.is_empty());
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
    }
}
