use std::io::{Read, Write};
use std::path::Path;

use crate::error::GatewayError;
use crate::registry::{Account, Asset};

/// One listing entry as the file manager consumes it; the wire `id` is the
/// position in the listing and is assigned at reply time.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileInfo {
    pub is_dir: bool,
    pub size: u64,
}

/// SFTP operations used by the file session. Boxed readers/writers so tests
/// can inject in-memory file-like objects; implementors must be Send so a
/// session can carry the backend across its worker threads.
pub trait RemoteFs: Send {
    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, String>;
    fn mkdir(&self, path: &str) -> Result<(), String>;
    fn create_empty(&self, path: &str) -> Result<(), String>;
    fn rename(&self, old_path: &str, new_path: &str) -> Result<(), String>;
    fn remove_file(&self, path: &str) -> Result<(), String>;
    fn remove_dir(&self, path: &str) -> Result<(), String>;
    fn stat(&self, path: &str) -> Result<FileInfo, String>;
    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>, String>;
    /// 追加写打开（上传分片逐帧落盘）
    fn open_append(&self, path: &str) -> Result<Box<dyn Write + Send>, String>;
}

/// Adapter owning an `ssh2::Sftp` (and the session keeping it alive).
pub struct Ssh2RemoteFs {
    // channel 的存活依赖 session；字段顺序即析构顺序
    sftp: ssh2::Sftp,
    _session: ssh2::Session,
}

impl Ssh2RemoteFs {
    /// Dial + authenticate + open the SFTP subsystem, then make sure the
    /// configured home directory exists (created on first visit).
    pub fn connect(asset: &Asset, account: &Account, home: &str) -> Result<Self, GatewayError> {
        let addr = format!("{}:{}", asset.ip, asset.port);
        let tcp = super::create_tcp_connection(&addr)?;
        let mut session = ssh2::Session::new()
            .map_err(|e| GatewayError::BackendUnreachable(format!("{}: {}", addr, e)))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| GatewayError::BackendUnreachable(format!("握手失败 {}: {}", addr, e)))?;
        session
            .userauth_password(&account.username, &account.password)
            .map_err(|e| GatewayError::BackendUnreachable(format!("认证失败 {}: {}", addr, e)))?;
        let sftp = session
            .sftp()
            .map_err(|e| GatewayError::BackendUnreachable(format!("SFTP 创建失败: {}", e)))?;

        if sftp.stat(Path::new(home)).is_err() {
            sftp.mkdir(Path::new(home), 0o755)
                .map_err(|e| GatewayError::BackendUnreachable(format!("无法创建 {}: {}", home, e)))?;
        }
        Ok(Self { sftp, _session: session })
    }
}

impl RemoteFs for Ssh2RemoteFs {
    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, String> {
        let entries = self.sftp.readdir(Path::new(path)).map_err(|e| e.to_string())?;
        Ok(entries
            .into_iter()
            .filter_map(|(p, stat)| {
                p.file_name().map(|name| DirEntry {
                    name: name.to_string_lossy().into_owned(),
                    is_dir: stat.is_dir(),
                })
            })
            .collect())
    }

    fn mkdir(&self, path: &str) -> Result<(), String> {
        self.sftp.mkdir(Path::new(path), 0o755).map_err(|e| e.to_string())
    }

    fn create_empty(&self, path: &str) -> Result<(), String> {
        self.sftp.create(Path::new(path)).map(|_| ()).map_err(|e| e.to_string())
    }

    fn rename(&self, old_path: &str, new_path: &str) -> Result<(), String> {
        self.sftp.rename(Path::new(old_path), Path::new(new_path), None).map_err(|e| e.to_string())
    }

    fn remove_file(&self, path: &str) -> Result<(), String> {
        self.sftp.unlink(Path::new(path)).map_err(|e| e.to_string())
    }

    fn remove_dir(&self, path: &str) -> Result<(), String> {
        self.sftp.rmdir(Path::new(path)).map_err(|e| e.to_string())
    }

    fn stat(&self, path: &str) -> Result<FileInfo, String> {
        let stat = self.sftp.stat(Path::new(path)).map_err(|e| e.to_string())?;
        Ok(FileInfo { is_dir: stat.is_dir(), size: stat.size.unwrap_or(0) })
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>, String> {
        match self.sftp.open(Path::new(path)) {
            Ok(f) => Ok(Box::new(f)),
            Err(e) => Err(e.to_string()),
        }
    }

    fn open_append(&self, path: &str) -> Result<Box<dyn Write + Send>, String> {
        use ssh2::{OpenFlags, OpenType};
        match self.sftp.open_mode(
            Path::new(path),
            OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::CREATE,
            0o644,
            OpenType::File,
        ) {
            Ok(f) => Ok(Box::new(f)),
            Err(e) => Err(e.to_string()),
        }
    }
}
