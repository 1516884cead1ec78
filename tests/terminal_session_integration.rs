//! TerminalSession behavior with the shell backend replaced by bare
//! channels: blocklist ordering, echo suppression, recorder wiring and the
//! close-time command log.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crossbeam_channel::unbounded;

use jmsgate::audit::{AuditStore, ReplayStore, spawn_audit_worker};
use jmsgate::backend::ssh::{ShellEvent, ShellHandle};
use jmsgate::recorder::Recorder;
use jmsgate::registry::{Account, Asset, Principal, Protocol};
use jmsgate::session::terminal::{SessionMeta, TerminalSession};
use jmsgate::session::{Flow, SessionEngine};
use jmsgate::ws::{ClientSender, OutFrame};

#[derive(Clone, Default)]
struct CollectingStore {
    records: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl AuditStore for CollectingStore {
    fn persist(&mut self, record: &serde_json::Value) -> anyhow::Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

struct NoopReplay;

impl ReplayStore for NoopReplay {
    fn upload(&self, local_path: &std::path::Path) -> anyhow::Result<String> {
        Ok(local_path.to_string_lossy().into_owned())
    }
}

fn meta() -> SessionMeta {
    SessionMeta {
        principal: Principal { user_id: 1, username: "ops".to_string() },
        asset: Asset {
            asset_id: 3,
            hostname: "db-master".to_string(),
            ip: "10.1.2.3".to_string(),
            port: 22,
            protocol: Protocol::Ssh,
            os: "linux".to_string(),
        },
        account: Account {
            account_id: 5,
            username: "root".to_string(),
            password: "pw".to_string(),
            is_active: true,
        },
        conn_tag: "root_db-master_20240101000000".to_string(),
    }
}

struct Harness {
    session: TerminalSession,
    out_rx: crossbeam_channel::Receiver<OutFrame>,
    /// 会话转发给 shell 的原始字节
    shell_in_rx: crossbeam_channel::Receiver<Vec<u8>>,
    /// 模拟 shell 输出
    shell_events_tx: crossbeam_channel::Sender<ShellEvent>,
    records: Arc<Mutex<Vec<serde_json::Value>>>,
}

fn harness(blocklist: &[&str], recorder: Option<Recorder>) -> Harness {
    let store = CollectingStore::default();
    let records = store.records.clone();
    let (audit, _worker) = spawn_audit_worker(Box::new(store), Box::new(NoopReplay));
    let (client, out_rx) = ClientSender::channel();
    let (input_tx, shell_in_rx) = unbounded();
    let (shell_events_tx, events_rx) = unbounded();
    let shell = ShellHandle { input_tx, events_rx };
    let session = TerminalSession::with_backend(
        client,
        shell,
        recorder,
        audit,
        blocklist.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
        meta(),
    );
    Harness { session, out_rx, shell_in_rx, shell_events_tx, records }
}

impl Harness {
    fn next_text(&self) -> serde_json::Value {
        match self.out_rx.try_recv().expect("expected a text frame") {
            OutFrame::Text(t) => serde_json::from_str(&t).expect("frame json"),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    fn wait_records(&self, expected: usize) -> Vec<serde_json::Value> {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if self.records.lock().unwrap().len() >= expected {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        self.records.lock().unwrap().clone()
    }
}

fn temp_cast(name: &str) -> PathBuf {
    use std::sync::atomic::{AtomicU32, Ordering};
    static SEQ: AtomicU32 = AtomicU32::new(0);
    std::env::temp_dir().join(format!(
        "jmsgate-termtest-{}-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::SeqCst),
        name
    ))
}

#[test]
fn blocked_command_is_audited_before_the_forward() {
    // S1: blocklist {"rm"}, client sends "rm -rf /"
    let mut h = harness(&["rm"], None);
    assert_eq!(h.session.on_client_text("rm -rf /"), Flow::Continue);

    // 审计在转发前入队：此刻记录一定已经提交
    let records = h.wait_records(1);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["variant"], "BlackCommand");
    assert_eq!(records[0]["commands"], serde_json::json!(["rm"]));
    assert_eq!(records[0]["raw_command"], "rm -rf /");

    // 后端收到补了换行的命令
    let forwarded = h.shell_in_rx.try_recv().expect("forwarded input");
    assert_eq!(forwarded, b"rm -rf /\n".to_vec());
}

#[test]
fn blocked_command_audit_survives_a_dead_backend() {
    let mut h = harness(&["rm"], None);
    // shell 工作线程已退出：输入通道对端关闭，转发必然失败
    let orphan_rx = unbounded::<Vec<u8>>().1;
    drop(std::mem::replace(&mut h.shell_in_rx, orphan_rx));

    assert_eq!(h.session.on_client_text("rm -rf /"), Flow::Closed);
    let records = h.wait_records(1);
    assert_eq!(records[0]["variant"], "BlackCommand");
    assert_eq!(h.next_text()["message"], "连接已断开!");
}

#[test]
fn clean_command_is_not_audited() {
    let mut h = harness(&["rm"], None);
    h.session.on_client_text("ls -la");
    assert_eq!(h.shell_in_rx.try_recv().expect("forwarded"), b"ls -la\n".to_vec());
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert!(h.records.lock().unwrap().is_empty());
}

#[test]
fn payload_with_trailing_newline_is_not_doubled() {
    let mut h = harness(&[], None);
    h.session.on_client_text("ls\n");
    assert_eq!(h.shell_in_rx.try_recv().expect("forwarded"), b"ls\n".to_vec());
}

#[test]
fn backend_chunk_becomes_text_frame() {
    let mut h = harness(&[], None);
    h.shell_events_tx.send(ShellEvent::Chunk("total 0\r\n".to_string())).unwrap();
    assert_eq!(h.session.poll_backend(), Flow::Continue);
    let frame = h.next_text();
    assert_eq!(frame["code"], 2);
    assert_eq!(frame["message"], "total 0\r\n");
}

#[test]
fn echo_of_a_sent_line_is_suppressed() {
    let mut h = harness(&[], None);
    // 整行客户端：载荷自带换行，回显与 strip+\n 形式一致
    h.session.on_client_text("ls -a\n");
    let _ = h.shell_in_rx.try_recv();

    h.shell_events_tx.send(ShellEvent::Chunk("ls -a\r\n".to_string())).unwrap();
    assert_eq!(h.session.poll_backend(), Flow::Continue);
    assert!(h.out_rx.try_recv().is_err(), "echo must not reach the client");

    // 真正的输出照常透传
    h.shell_events_tx.send(ShellEvent::Chunk("a.txt  b.txt\r\n".to_string())).unwrap();
    h.session.poll_backend();
    let frame = h.next_text();
    assert_eq!(frame["message"], "a.txt  b.txt\r\n");
}

#[test]
fn timeout_sends_both_notices_and_closes() {
    let mut h = harness(&[], None);
    h.shell_events_tx.send(ShellEvent::Timeout).unwrap();
    assert_eq!(h.session.poll_backend(), Flow::Closed);
    assert_eq!(h.next_text()["message"], "连接服务器超时");
    assert_eq!(h.next_text()["message"], "由于长时间没有操作，连接已断开!");
}

#[test]
fn eof_reports_closed_channel() {
    let mut h = harness(&[], None);
    h.shell_events_tx.send(ShellEvent::Eof).unwrap();
    assert_eq!(h.session.poll_backend(), Flow::Closed);
    assert_eq!(h.next_text()["message"], "连接已断开!");
}

#[test]
fn recorder_receives_backend_output_and_flushes_on_close() {
    let path = temp_cast("session.cast");
    let recorder = Recorder::create(path.clone()).expect("recorder");
    let mut h = harness(&[], Some(recorder));

    for i in 0..5 {
        h.shell_events_tx.send(ShellEvent::Chunk(format!("line-{}\r\n", i))).unwrap();
    }
    h.session.poll_backend();
    h.session.on_close();

    // close 之后所有条目都已落盘
    let raw = std::fs::read_to_string(&path).expect("cast file");
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 1 + 5);
    let entry: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(entry[1], "o");
    assert_eq!(entry[2], "line-0\r\n");

    // 录屏入库审计在关闭后提交
    let records = h.wait_records(1);
    assert!(records.iter().any(|r| r["variant"] == "ReplayUpload"));
    let _ = std::fs::remove_file(&path);
}

#[test]
fn close_submits_command_log_from_history() {
    let mut h = harness(&[], None);
    for key in ["l", "s", "\r", "p", "w", "d", "\r", "ech"] {
        h.session.on_client_text(key);
        let _ = h.shell_in_rx.try_recv();
    }
    h.session.on_close();

    let records = h.wait_records(3);
    let commands: Vec<String> = records
        .iter()
        .filter(|r| r["variant"] == "Command")
        .map(|r| r["command"]["command"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(commands, vec!["ls".to_string(), "pwd".to_string(), "ech".to_string()]);
}

#[test]
fn close_is_idempotent() {
    let mut h = harness(&[], None);
    h.session.on_client_text("ls");
    let _ = h.shell_in_rx.try_recv();
    h.session.on_close();
    h.session.on_close();
    std::thread::sleep(std::time::Duration::from_millis(100));
    let commands = h
        .records
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r["variant"] == "Command")
        .count();
    assert_eq!(commands, 1);
}
