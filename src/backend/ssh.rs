//! SSH control connection with an interactive PTY shell channel.
//!
//! The blocking part (TCP dial, handshake, password auth, PTY allocation)
//! happens on the session thread during `on_open`. The channel is then
//! switched to non-blocking and handed to a per-session worker thread that
//! owns it exclusively: client input arrives over a channel, backend output
//! leaves as events. Nothing else ever touches the `ssh2` objects, which
//! keeps the libssh2 session single-threaded.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};

use crate::error::GatewayError;
use crate::registry::{Account, Asset};

/// 每次最多读 1 KiB
const READ_CHUNK: usize = 1024;
/// 后端静默超时：10 分钟无输出则断开
const IDLE_LIMIT: Duration = Duration::from_secs(600);

/// Output of the shell worker, consumed by the terminal session.
#[derive(Debug, Clone, PartialEq)]
pub enum ShellEvent {
    /// 一段后端输出（UTF-8 宽松解码）
    Chunk(String),
    /// 超过 10 分钟没有任何后端输出
    Timeout,
    /// 通道被对端关闭
    Eof,
    /// 通道异常（读写错误）
    Exited,
}

/// Running shell backend: input sink plus event source. Dropping the input
/// sender makes the worker exit and close the channel.
pub struct ShellHandle {
    pub input_tx: Sender<Vec<u8>>,
    pub events_rx: Receiver<ShellEvent>,
}

pub struct SshShell {
    session: ssh2::Session,
    channel: ssh2::Channel,
}

impl SshShell {
    /// Dial, authenticate with the account password and open a PTY shell.
    pub fn connect(asset: &Asset, account: &Account) -> Result<SshShell, GatewayError> {
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

        let mut channel = session
            .channel_session()
            .map_err(|e| GatewayError::BackendUnreachable(format!("{}: {}", addr, e)))?;
        channel
            .request_pty("xterm", None, None)
            .map_err(|e| GatewayError::BackendUnreachable(format!("{}: {}", addr, e)))?;
        channel
            .shell()
            .map_err(|e| GatewayError::BackendUnreachable(format!("{}: {}", addr, e)))?;
        Ok(SshShell { session, channel })
    }

    /// Blocking read of the shell greeting, one chunk per call. Used right
    /// after connect, before the worker takes over the channel.
    pub fn read_greeting(&mut self) -> Option<String> {
        let mut buf = [0u8; READ_CHUNK];
        match self.channel.read(&mut buf) {
            Ok(n) if n > 0 => Some(String::from_utf8_lossy(&buf[..n]).into_owned()),
            _ => None,
        }
    }

    /// Hand the channel to its worker thread and return the channel pair the
    /// session drives it through.
    pub fn spawn_worker(self) -> ShellHandle {
        let SshShell { session, mut channel } = self;
        session.set_blocking(false);

        let (input_tx, input_rx) = unbounded::<Vec<u8>>();
        let (events_tx, events_rx) = unbounded::<ShellEvent>();
        std::thread::spawn(move || {
            // session 必须与 channel 同生共死，否则底层连接被提前释放
            let _session = session;
            run_shell_worker(&mut channel, &input_rx, &events_tx);
            let _ = channel.close();
            let _ = channel.wait_close();
        });
        ShellHandle { input_tx, events_rx }
    }
}

fn run_shell_worker(
    channel: &mut ssh2::Channel,
    input_rx: &Receiver<Vec<u8>>,
    events_tx: &Sender<ShellEvent>,
) {
    let mut buf = [0u8; READ_CHUNK];
    let mut last_output = Instant::now();
    loop {
        loop {
            match input_rx.try_recv() {
                Ok(data) => {
                    if let Err(e) = write_channel_input(channel, &data) {
                        tracing::debug!("[term] shell write failed: {}", e);
                        let _ = events_tx.send(ShellEvent::Exited);
                        return;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        let mut did_read = false;
        match channel.read(&mut buf) {
            Ok(n) if n > 0 => {
                did_read = true;
                last_output = Instant::now();
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                if events_tx.send(ShellEvent::Chunk(chunk)).is_err() {
                    return;
                }
            }
            Ok(_) => {
                if channel.eof() {
                    let _ = events_tx.send(ShellEvent::Eof);
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::debug!("[term] shell read failed: {}", e);
                let _ = events_tx.send(ShellEvent::Exited);
                return;
            }
        }

        if channel.eof() {
            let _ = events_tx.send(ShellEvent::Eof);
            return;
        }
        if last_output.elapsed() >= IDLE_LIMIT {
            let _ = events_tx.send(ShellEvent::Timeout);
            return;
        }
        if !did_read {
            std::thread::sleep(Duration::from_millis(12));
        }
    }
}

fn write_channel_input(channel: &mut ssh2::Channel, data: &[u8]) -> std::io::Result<()> {
    let mut written = 0usize;
    while written < data.len() {
        match channel.write(&data[written..]) {
            Ok(0) => {
                if channel.eof() {
                    return Err(std::io::Error::other("channel closed while writing"));
                }
                std::thread::sleep(Duration::from_millis(4));
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(4));
            }
            Err(e) => return Err(e),
        }
    }
    loop {
        match channel.flush() {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(4));
            }
            Err(e) => return Err(e),
        }
    }
}
