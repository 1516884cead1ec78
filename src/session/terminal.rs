//! SSH terminal proxy session. Client keystrokes flow to the shell channel;
//! shell output flows back as TEXT frames, into the replay recorder and
//! through the command-line reconstructor that rebuilds what the user typed
//! for the command log and the high-risk-command audit.

use std::collections::HashSet;
use std::time::Instant;

use regex::Regex;

use crate::audit::{AuditHandle, AuditRecord};
use crate::backend::ssh::{ShellEvent, ShellHandle, SshShell};
use crate::error::GatewayError;
use crate::recorder::{Recorder, replay_file_path};
use crate::registry::{Account, Asset, Principal};
use crate::session::Flow;
use crate::ws::{ClientSender, WsFrame};

const MSG_RECV_TIMEOUT: &str = "连接服务器超时";
const MSG_IDLE_CLOSED: &str = "由于长时间没有操作，连接已断开!";
const MSG_CHANNEL_CLOSED: &str = "连接已断开!";

/// 历史回显清洗：去掉 ANSI CSI 序列与退格
const ANSI_PATTERN: &str = r"(?:\x1B[@-_]|[\u{80}-\u{9F}])[0-?]*[ -/]*[@-~]|\x08";

/// One decoded input token. Chunks are tokenized before they reach the
/// reconstruction rules so the outcome does not depend on how the transport
/// happened to split the byte stream.
#[derive(Debug, Clone, Copy, PartialEq)]
enum KeyToken {
    Cr,
    Bell,
    CtrlC,
    CtrlA,
    CtrlE,
    Left,
    Right,
    Up,
    Down,
    Backspace,
    Tab,
    Esc,
    Char(char),
}

/// Stateful tokenizer. A `\x1b[` prefix at a chunk boundary is carried into
/// the next chunk so a split arrow sequence still decodes; a bare ESC ending
/// a chunk is the ESC key itself (it arms completion, like TAB).
#[derive(Default)]
struct InputTokenizer {
    /// "" | "\x1b" | "\x1b["
    pending: String,
}

impl InputTokenizer {
    fn push(&mut self, chunk: &str) -> Vec<KeyToken> {
        let mut out = Vec::new();
        for c in chunk.chars() {
            let pending = std::mem::take(&mut self.pending);
            match (pending.as_str(), c) {
                ("", '\x1b') => self.pending.push('\x1b'),
                ("", _) => out.push(Self::plain(c)),
                ("\x1b", '[') => self.pending.push_str("\x1b["),
                ("\x1b", _) => {
                    // 不是转义序列开头，ESC 与后续字符按普通输入处理
                    out.push(KeyToken::Char('\x1b'));
                    if c == '\x1b' {
                        self.pending.push('\x1b');
                    } else {
                        out.push(Self::plain(c));
                    }
                }
                ("\x1b[", 'A') => out.push(KeyToken::Up),
                ("\x1b[", 'B') => out.push(KeyToken::Down),
                ("\x1b[", 'C') => out.push(KeyToken::Right),
                ("\x1b[", 'D') => out.push(KeyToken::Left),
                ("\x1b[", _) => {
                    out.push(KeyToken::Char('\x1b'));
                    out.push(KeyToken::Char('['));
                    out.push(Self::plain(c));
                }
                _ => unreachable!("pending holds at most \\x1b["),
            }
        }
        // 整个分片就是一个裸 ESC：按 ESC 键处理（与 TAB 等价触发补全）
        if self.pending == "\x1b" {
            out.push(KeyToken::Esc);
            self.pending.clear();
        }
        out
    }

    fn plain(c: char) -> KeyToken {
        match c {
            '\r' => KeyToken::Cr,
            '\x07' => KeyToken::Bell,
            '\x03' => KeyToken::CtrlC,
            '\x01' => KeyToken::CtrlA,
            '\x05' => KeyToken::CtrlE,
            '\x7f' => KeyToken::Backspace,
            '\t' => KeyToken::Tab,
            other => KeyToken::Char(other),
        }
    }
}

/// Reconstruction state for the current session: completed commands, the
/// line being typed and the cursor model of the wire protocol:
/// `cursor_index == 0` means "at the right end", positive values are offsets
/// from the left. The `len - 2` rule for ctrl-E and the left-arrow wrap is a
/// known quirk kept as-is.
pub struct CommandTracker {
    cmd_history: Vec<String>,
    cmd_tmp: Vec<char>,
    cursor_index: usize,
    tab_pending: bool,
    history_pending: bool,
    tokenizer: InputTokenizer,
    ansi_re: Regex,
}

impl Default for CommandTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTracker {
    pub fn new() -> Self {
        Self {
            cmd_history: Vec::new(),
            cmd_tmp: Vec::new(),
            cursor_index: 0,
            tab_pending: false,
            history_pending: false,
            tokenizer: InputTokenizer::default(),
            ansi_re: Regex::new(ANSI_PATTERN).expect("valid ANSI pattern"),
        }
    }

    pub fn cmd_tmp(&self) -> String {
        self.cmd_tmp.iter().collect()
    }

    pub fn cmd_history(&self) -> Vec<String> {
        self.cmd_history.clone()
    }

    pub fn cursor_index(&self) -> usize {
        self.cursor_index
    }

    /// Feed one client input chunk through the tokenizer and the per-token
    /// rules.
    pub fn feed(&mut self, chunk: &str) {
        for token in self.tokenizer.push(chunk) {
            self.apply(token);
        }
    }

    fn apply(&mut self, token: KeyToken) {
        match token {
            KeyToken::Cr => {
                self.cursor_index = 0;
                let line = self.cmd_tmp();
                if !line.trim().is_empty() {
                    self.cmd_history.push(line);
                }
                self.cmd_tmp.clear();
            }
            KeyToken::Bell => {}
            KeyToken::CtrlC | KeyToken::CtrlA => self.cursor_index = 0,
            KeyToken::CtrlE => self.cursor_index = self.cmd_tmp.len().saturating_sub(2),
            KeyToken::Left => {
                if self.cursor_index == 0 {
                    self.cursor_index = self.cmd_tmp.len().saturating_sub(2);
                } else {
                    self.cursor_index -= 1;
                }
            }
            KeyToken::Right => self.cursor_index += 1,
            KeyToken::Backspace => {
                if self.cursor_index == 0 {
                    self.cmd_tmp.pop();
                } else if self.cursor_index < self.cmd_tmp.len() {
                    self.cmd_tmp.remove(self.cursor_index);
                }
            }
            KeyToken::Tab | KeyToken::Esc => self.tab_pending = true,
            KeyToken::Up | KeyToken::Down => self.history_pending = true,
            KeyToken::Char(c) => {
                if self.cursor_index == 0 || self.cursor_index >= self.cmd_tmp.len() {
                    self.cmd_tmp.push(c);
                } else {
                    self.cmd_tmp.insert(self.cursor_index, c);
                }
            }
        }
    }

    /// Echo suppression: a backend chunk that is just the echo of a line we
    /// already sent is dropped. The check is substring containment against
    /// `cmd_tmp`, not equality.
    pub fn echo_suppressed(&self, chunk: &str) -> bool {
        let needle = format!("{}\n", chunk.trim());
        self.cmd_tmp().contains(&needle)
    }

    pub fn tab_pending(&self) -> bool {
        self.tab_pending
    }

    pub fn history_pending(&self) -> bool {
        self.history_pending
    }

    /// TAB 补全：把服务端回显的补全片段拼到当前命令后
    pub fn absorb_tab(&mut self, chunk: &str) {
        let parts: Vec<&str> = chunk.split(' ').collect();
        if parts.len() == 2 && parts[1].is_empty() && !parts[0].is_empty() {
            self.append_str(&parts[0].replace('\x07', ""));
        } else if parts.len() == 1 && parts[0] != "\x07" {
            self.append_str(&parts[0].replace('\x07', ""));
        }
        self.tab_pending = false;
    }

    /// 历史翻阅：服务端整行回显替换当前命令（去 ANSI 控制序列与退格）
    pub fn absorb_history(&mut self, chunk: &str) {
        self.cursor_index = 0;
        if !chunk.trim().is_empty() {
            let cleaned = self.ansi_re.replace_all(chunk, "").into_owned();
            self.cmd_tmp = cleaned.chars().collect();
        }
        self.history_pending = false;
    }

    fn append_str(&mut self, s: &str) {
        self.cmd_tmp.extend(s.chars());
    }

    /// Shutdown pass: collapse ctrl-Z suspensions, then cut the vi/fg →
    /// `:wq`/`:q`/`:q!` editing slice out of the history. The index-0
    /// truthiness quirks of the source are preserved: a `vi` or `fg` match
    /// at position 0 does not anchor the redaction.
    pub fn finalize(mut self) -> (Vec<String>, String) {
        let mut vi_index: Option<usize> = None;
        let mut fg_index: Option<usize> = None;
        let mut q_index: Option<usize> = None;
        let q_keys = [":wq", ":q", ":q!"];
        for (index, value) in self.cmd_history.iter_mut().enumerate() {
            let original = value.clone();
            if original.contains("vi") {
                vi_index = Some(index);
            }
            if q_keys.iter().any(|k| original.contains(k)) {
                q_index = Some(index);
            }
            if original.contains('\x1a') {
                *value = original.split('\x1a').nth(1).unwrap_or("").to_string();
            }
            if original.contains("fg") {
                fg_index = Some(index);
            }
        }

        let truthy = |idx: Option<usize>| idx.filter(|&i| i != 0);
        let first_index = truthy(fg_index).or(vi_index);
        if truthy(vi_index).is_some()
            && let (Some(first), Some(q)) = (first_index, q_index)
        {
            let tail: Vec<String> =
                self.cmd_history.iter().skip(q + 1).cloned().collect();
            self.cmd_history.truncate(first + 1);
            self.cmd_history.extend(tail);
        }
        (self.cmd_history, self.cmd_tmp.iter().collect())
    }
}

/// Identity and collaborator bundle the session engines share.
pub struct SessionMeta {
    pub principal: Principal,
    pub asset: Asset,
    pub account: Account,
    pub conn_tag: String,
}

pub struct TerminalSession {
    client: ClientSender,
    shell: Option<ShellHandle>,
    tracker: CommandTracker,
    recorder: Option<Recorder>,
    audit: AuditHandle,
    blocklist: HashSet<String>,
    meta: SessionMeta,
    started: Instant,
    closed: bool,
}

impl TerminalSession {
    /// Establish the SSH backend, start the recorder, forward the shell
    /// greeting and hand back a running session.
    pub fn open(
        client: ClientSender,
        meta: SessionMeta,
        blocklist: HashSet<String>,
        record_root: &std::path::Path,
        audit: AuditHandle,
    ) -> Result<TerminalSession, GatewayError> {
        let mut shell = SshShell::connect(&meta.asset, &meta.account)?;
        let path = replay_file_path(record_root, &meta.principal.username, &meta.asset.ip);
        let recorder = Recorder::create(path)
            .map_err(|e| GatewayError::Backend(format!("无法创建录屏文件: {}", e)))?;

        let started = Instant::now();
        // 登录横幅：原样录屏，去除首尾空白后发给前端
        for _ in 0..2 {
            let Some(chunk) = shell.read_greeting() else { break };
            let _ = client.send_frame(&WsFrame::text(chunk.trim()));
            recorder.record(started.elapsed().as_secs_f64(), chunk);
        }

        Ok(TerminalSession {
            client,
            shell: Some(shell.spawn_worker()),
            tracker: CommandTracker::new(),
            recorder: Some(recorder),
            audit,
            blocklist,
            meta,
            started,
            closed: false,
        })
    }

    /// Test constructor: backend already running (or faked through the
    /// channel pair), recorder optional.
    pub fn with_backend(
        client: ClientSender,
        shell: ShellHandle,
        recorder: Option<Recorder>,
        audit: AuditHandle,
        blocklist: HashSet<String>,
        meta: SessionMeta,
    ) -> TerminalSession {
        TerminalSession {
            client,
            shell: Some(shell),
            tracker: CommandTracker::new(),
            recorder,
            audit,
            blocklist,
            meta,
            started: Instant::now(),
            closed: false,
        }
    }

    pub fn tracker(&self) -> &CommandTracker {
        &self.tracker
    }

    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn record(&self, text: &str) {
        if let Some(recorder) = &self.recorder {
            recorder.record(self.elapsed(), text);
        }
    }

    /// Idle/exit teardown shared by timeout and exit-ready: the localized
    /// notice goes to the client and into the replay before the close.
    fn idle_close(&mut self) -> Flow {
        let _ = self.client.send_frame(&WsFrame::error(MSG_IDLE_CLOSED));
        self.record(&format!("\n{}", MSG_IDLE_CLOSED));
        Flow::Closed
    }

    fn handle_event(&mut self, event: ShellEvent) -> Flow {
        match event {
            ShellEvent::Chunk(chunk) => {
                if self.tracker.echo_suppressed(&chunk) {
                    return Flow::Continue;
                }
                if self.client.send_frame(&WsFrame::text(chunk.clone())).is_err() {
                    return Flow::Closed;
                }
                self.record(&chunk);
                if self.tracker.tab_pending() {
                    self.tracker.absorb_tab(&chunk);
                }
                if self.tracker.history_pending() {
                    self.tracker.absorb_history(&chunk);
                }
                Flow::Continue
            }
            ShellEvent::Timeout => {
                let _ = self.client.send_frame(&WsFrame::error(MSG_RECV_TIMEOUT));
                self.idle_close()
            }
            ShellEvent::Eof => {
                let _ = self.client.send_frame(&WsFrame::error(MSG_CHANNEL_CLOSED));
                Flow::Closed
            }
            ShellEvent::Exited => self.idle_close(),
        }
    }
}

impl crate::session::SessionEngine for TerminalSession {
    /// Client keystrokes. The blocklist audit is submitted before the input
    /// is forwarded so the attempt is on record even if the forward fails.
    fn on_client_text(&mut self, payload: &str) -> Flow {
        let hits: Vec<String> = payload
            .split(' ')
            .filter(|t| self.blocklist.contains(*t))
            .map(|t| t.to_string())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if !hits.is_empty() {
            tracing::info!("[term] {} blocked-command hit: {:?}", self.meta.conn_tag, hits);
            self.audit.submit(AuditRecord::BlackCommand {
                commands: hits,
                asset_hostname: self.meta.asset.hostname.clone(),
                account_name: self.meta.account.username.clone(),
                username: self.meta.principal.username.clone(),
                raw_command: payload.to_string(),
            });
        }

        let mut command = payload.to_string();
        if !command.ends_with('\n') {
            command.push('\n');
        }
        let forwarded = match &self.shell {
            Some(shell) => shell.input_tx.send(command.into_bytes()).is_ok(),
            None => false,
        };
        if !forwarded {
            let _ = self.client.send_frame(&WsFrame::error(MSG_CHANNEL_CLOSED));
            return Flow::Closed;
        }
        self.tracker.feed(payload);
        Flow::Continue
    }

    fn on_client_binary(&mut self, _payload: &[u8]) -> Flow {
        // 终端通道没有二进制帧
        Flow::Continue
    }

    fn poll_backend(&mut self) -> Flow {
        let Some(shell) = &self.shell else { return Flow::Closed };
        let events_rx = shell.events_rx.clone();
        loop {
            match events_rx.try_recv() {
                Ok(event) => {
                    if self.handle_event(event) == Flow::Closed {
                        return Flow::Closed;
                    }
                }
                Err(crossbeam_channel::TryRecvError::Empty) => return Flow::Continue,
                Err(crossbeam_channel::TryRecvError::Disconnected) => return Flow::Closed,
            }
        }
    }

    fn on_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let duration_secs = self.started.elapsed().as_secs() as i64;

        let tracker = std::mem::take(&mut self.tracker);
        let (history, leftover) = tracker.finalize();
        for command in history {
            self.audit.submit(AuditRecord::Command {
                name: self.meta.conn_tag.clone(),
                command,
                asset_id: self.meta.asset.asset_id,
                account_id: self.meta.account.account_id,
                user_id: self.meta.principal.user_id,
                duration_secs,
            });
        }
        if !leftover.is_empty() {
            self.audit.submit(AuditRecord::Command {
                name: self.meta.conn_tag.clone(),
                command: leftover,
                asset_id: self.meta.asset.asset_id,
                account_id: self.meta.account.account_id,
                user_id: self.meta.principal.user_id,
                duration_secs,
            });
        }

        // 丢弃输入通道让 shell 工作线程退出并关闭通道
        self.shell.take();
        if let Some(recorder) = self.recorder.take() {
            let path = recorder.finish();
            self.audit.submit(AuditRecord::ReplayUpload {
                name: self.meta.conn_tag.clone(),
                path,
                account_id: self.meta.account.account_id,
                asset_id: self.meta.asset.asset_id,
                user_id: self.meta.principal.user_id,
            });
        }
        tracing::info!("[term] {} closed after {}s", self.meta.conn_tag, duration_secs);
    }
}
