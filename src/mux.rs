//! Shared readiness multiplexer for guacd sockets. One background worker
//! serves every desktop session: it waits for read-readiness on the whole
//! registered set and dispatches each event to the owning session's handler.
//! The worker starts lazily when the registry becomes non-empty and exits
//! when the last entry is removed. SSH/SFTP sessions keep their own read
//! threads; only the Guacamole path shares this loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

/// What a handler tells the worker after servicing a readiness event.
#[derive(Debug, PartialEq, Eq)]
pub enum HandlerFlow {
    Continue,
    /// 对端已关闭或转发完错误指令，工作线程负责注销该表项
    Closed,
}

type Handler = Arc<Mutex<dyn FnMut() -> anyhow::Result<HandlerFlow> + Send>>;

pub type SharedStream = Arc<Mutex<TcpStream>>;

/// Registration handle returned by [`ReadyLoop::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxToken(usize);

struct Entry {
    sock: SharedStream,
    /// fd captured at registration; used by the stale-entry sweep
    fd: u64,
    handler: Handler,
}

struct MuxState {
    entries: HashMap<Token, Entry>,
    registry: Option<mio::Registry>,
    running: bool,
    next_token: usize,
}

struct Inner {
    state: Mutex<MuxState>,
    workers_started: AtomicUsize,
}

/// Process-wide readiness loop; clone freely, all clones share the worker.
#[derive(Clone)]
pub struct ReadyLoop {
    inner: Arc<Inner>,
}

#[cfg(unix)]
fn raw_fd(sock: &TcpStream) -> u64 {
    use std::os::fd::AsRawFd;
    sock.as_raw_fd() as u64
}

#[cfg(not(unix))]
fn raw_fd(_sock: &TcpStream) -> u64 {
    0
}

impl Default for ReadyLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyLoop {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MuxState {
                    entries: HashMap::new(),
                    registry: None,
                    running: false,
                    next_token: 0,
                }),
                workers_started: AtomicUsize::new(0),
            }),
        }
    }

    /// Register a socket for read-readiness. The first registration starts
    /// the worker; registration and worker startup are serialized on one
    /// lock, so concurrent callers can never start two workers.
    pub fn register<F>(&self, sock: SharedStream, handler: F) -> anyhow::Result<MuxToken>
    where
        F: FnMut() -> anyhow::Result<HandlerFlow> + Send + 'static,
    {
        let mut guard = self.inner.state.lock().expect("mux state poisoned");
        let state = &mut *guard;
        if !state.running {
            let poll = Poll::new()?;
            state.registry = Some(poll.registry().try_clone()?);
            state.running = true;
            self.inner.workers_started.fetch_add(1, Ordering::SeqCst);
            let inner = self.inner.clone();
            std::thread::spawn(move || worker_loop(inner, poll));
            tracing::debug!("[mux] worker started");
        }

        let token = Token(state.next_token);
        state.next_token += 1;
        let registry = state.registry.as_ref().expect("registry present while running");
        let fd = {
            let mut sock_guard = sock.lock().expect("guacd socket poisoned");
            registry.register(&mut *sock_guard, token, Interest::READABLE)?;
            raw_fd(&sock_guard)
        };
        state.entries.insert(token, Entry { sock, fd, handler: Arc::new(Mutex::new(handler)) });
        Ok(MuxToken(token.0))
    }

    /// Remove a registration. When the token is already gone (the underlying
    /// client rotated its descriptor), sweep the registry and evict entries
    /// whose socket no longer matches the fd captured at registration. The
    /// sweep is best-effort, not race-free.
    pub fn unregister(&self, token: MuxToken) {
        let mut guard = self.inner.state.lock().expect("mux state poisoned");
        let state = &mut *guard;
        match state.entries.remove(&Token(token.0)) {
            Some(entry) => {
                if let Some(registry) = state.registry.as_ref() {
                    let mut sock_guard = entry.sock.lock().expect("guacd socket poisoned");
                    let _ = registry.deregister(&mut *sock_guard);
                }
            }
            None => {
                let stale: Vec<Token> = state
                    .entries
                    .iter()
                    .filter(|(_, e)| {
                        e.sock.lock().map(|guard| raw_fd(&guard) != e.fd).unwrap_or(true)
                    })
                    .map(|(t, _)| *t)
                    .collect();
                for t in stale {
                    tracing::warn!("[mux] evicting stale entry {:?}", t);
                    if let Some(entry) = state.entries.remove(&t)
                        && let Some(registry) = state.registry.as_ref()
                        && let Ok(mut sock_guard) = entry.sock.lock()
                    {
                        let _ = registry.deregister(&mut *sock_guard);
                    }
                }
            }
        }
    }

    /// Number of live registrations (observability + tests).
    pub fn len(&self) -> usize {
        self.inner.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().map(|s| s.running).unwrap_or(false)
    }

    pub fn workers_started(&self) -> usize {
        self.inner.workers_started.load(Ordering::SeqCst)
    }
}

fn worker_loop(inner: Arc<Inner>, mut poll: Poll) {
    let mut events = Events::with_capacity(64);
    loop {
        // 1 秒轮询上限：新注册与注销都能在一个周期内被感知
        if let Err(e) = poll.poll(&mut events, Some(Duration::from_secs(1))) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!("[mux] poll failed: {}", e);
        }

        for event in events.iter() {
            let token = event.token();
            let handler = {
                let state = inner.state.lock().expect("mux state poisoned");
                state.entries.get(&token).map(|e| e.handler.clone())
            };
            // 事件对应的表项可能刚被注销，直接丢弃
            let Some(handler) = handler else { continue };
            let flow = (&mut *handler.lock().expect("handler poisoned"))();
            match flow {
                Ok(HandlerFlow::Continue) => {}
                Ok(HandlerFlow::Closed) => {
                    let mut state = inner.state.lock().expect("mux state poisoned");
                    if let Some(entry) = state.entries.remove(&token) {
                        if let Some(registry) = state.registry.as_ref() {
                            let mut guard = entry.sock.lock().expect("guacd socket poisoned");
                            let _ = registry.deregister(&mut *guard);
                        }
                        tracing::debug!("[mux] entry {:?} closed", token);
                    }
                }
                Err(e) => {
                    tracing::error!("[mux] handler for {:?} failed: {}", token, e);
                }
            }
        }

        let mut state = inner.state.lock().expect("mux state poisoned");
        if state.entries.is_empty() {
            state.running = false;
            state.registry = None;
            tracing::debug!("[mux] worker exit");
            return;
        }
    }
}
