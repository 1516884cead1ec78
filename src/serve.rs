//! WebSocket accept path: one OS thread per connection. The handshake URL
//! picks the session kind, the query string carries identity and target,
//! and the pump loop moves frames between the socket and the session engine
//! until either side closes.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use tungstenite::protocol::WebSocket;
use tungstenite::{Error as WsError, Message};

use crate::audit::AuditHandle;
use crate::backend::conn_tag;
use crate::backend::sftp::Ssh2RemoteFs;
use crate::config::Config;
use crate::error::GatewayError;
use crate::mux::ReadyLoop;
use crate::registry::Directory;
use crate::session::file::FileSession;
use crate::session::guac::GuacSession;
use crate::session::terminal::{SessionMeta, TerminalSession};
use crate::session::{
    CounterGuard, Flow, ONLINE_CONNECTION_COUNT, OnlineCounter, SessionEngine,
};
use crate::ws::{ClientSender, OutFrame, SessionQuery, WsFrame};

/// Everything a connection needs, shared across accept threads.
pub struct Gateway {
    pub config: Config,
    pub directory: Arc<dyn Directory>,
    pub audit: AuditHandle,
    pub mux: ReadyLoop,
    pub counter: Arc<dyn OnlineCounter>,
}

/// Drive one accepted TCP connection to completion.
pub fn handle_connection(stream: TcpStream, gateway: Arc<Gateway>) {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    let mut path = String::new();
    let mut raw_query = String::new();
    let ws = tungstenite::accept_hdr(stream, |req: &tungstenite::handshake::server::Request, resp| {
        path = req.uri().path().to_string();
        raw_query = req.uri().query().unwrap_or("").to_string();
        Ok(resp)
    });
    let mut ws = match ws {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!("[serve] {} websocket handshake failed: {}", peer, e);
            return;
        }
    };

    let query = SessionQuery::parse(&raw_query);
    if let Err(e) = run_session(&mut ws, &path, &query, &gateway) {
        tracing::warn!("[serve] {} {}: {}", peer, path, e.detail());
        let _ = ws.send(Message::Text(WsFrame::error(e.to_string()).to_json()));
    }
    let _ = ws.close(None);
    let _ = ws.flush();
}

fn run_session(
    ws: &mut WebSocket<TcpStream>,
    path: &str,
    query: &SessionQuery,
    gateway: &Gateway,
) -> Result<(), GatewayError> {
    let principal = query
        .get("token")
        .and_then(|token| gateway.directory.authenticate(token))
        .ok_or(GatewayError::AuthFailure)?;
    let asset_id = query.get_i64("asset_id").ok_or(GatewayError::AuthFailure)?;
    let account_id = query.get_i64("account_id").ok_or(GatewayError::AuthFailure)?;
    let (asset, account) = gateway.directory.lookup_asset_account(asset_id, account_id)?;

    let _guard = CounterGuard::acquire(gateway.counter.as_ref(), ONLINE_CONNECTION_COUNT);
    let (client, out_rx) = ClientSender::channel();

    match path.trim_end_matches('/') {
        "/ws/terminal" => {
            let meta = SessionMeta {
                conn_tag: conn_tag(&account.username, &asset.hostname),
                principal,
                asset,
                account,
            };
            tracing::info!("[serve] terminal session open: {}", meta.conn_tag);
            let mut engine = TerminalSession::open(
                client,
                meta,
                gateway.directory.blocklist_snapshot(),
                &gateway.config.record_root,
                gateway.audit.clone(),
            )?;
            pump(ws, &out_rx, &mut engine);
            engine.on_close();
            Ok(())
        }
        "/ws/file" => {
            let meta = SessionMeta {
                conn_tag: conn_tag(&account.username, &asset.ip),
                principal,
                asset,
                account,
            };
            let fs = Ssh2RemoteFs::connect(
                &meta.asset,
                &meta.account,
                &gateway.config.remote_file_home_path,
            )?;
            tracing::info!("[serve] file session open: {}", meta.conn_tag);
            let _ = client.send_frame(&WsFrame::success("connection success"));
            let mut engine = FileSession::new(
                client,
                Box::new(fs),
                gateway.config.remote_file_home_path.clone(),
                gateway.audit.clone(),
                meta,
            );
            pump(ws, &out_rx, &mut engine);
            engine.on_close();
            Ok(())
        }
        "/ws/guacd" => {
            let meta = SessionMeta {
                conn_tag: conn_tag(&account.username, &asset.ip),
                principal,
                asset,
                account,
            };
            let mut engine =
                GuacSession::open(client, gateway.mux.clone(), &gateway.config, query, meta)?;
            pump(ws, &out_rx, &mut engine);
            engine.on_close();
            Ok(())
        }
        other => {
            tracing::debug!("[serve] unknown endpoint: {}", other);
            Err(GatewayError::AuthFailure)
        }
    }
}

/// Frame pump: short read timeout on the socket so one thread interleaves
/// client reads, backend polling and the outbound queue. Ordering within
/// each direction is preserved; the engine never touches the socket.
fn pump(ws: &mut WebSocket<TcpStream>, out_rx: &Receiver<OutFrame>, engine: &mut dyn SessionEngine) {
    let _ = ws.get_ref().set_read_timeout(Some(Duration::from_millis(50)));
    let mut closing = false;
    loop {
        match ws.read() {
            Ok(Message::Text(payload)) => {
                if engine.on_client_text(&payload) == Flow::Closed {
                    closing = true;
                }
            }
            Ok(Message::Binary(payload)) => {
                if engine.on_client_binary(&payload) == Flow::Closed {
                    closing = true;
                }
            }
            Ok(Message::Close(_)) => closing = true,
            Ok(_) => {}
            Err(WsError::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => break,
            Err(e) => {
                tracing::debug!("[serve] client read failed: {}", e);
                break;
            }
        }

        if engine.poll_backend() == Flow::Closed {
            closing = true;
        }

        loop {
            match out_rx.try_recv() {
                Ok(OutFrame::Text(payload)) => {
                    if ws.send(Message::Text(payload)).is_err() {
                        closing = true;
                        break;
                    }
                }
                Ok(OutFrame::Binary(payload)) => {
                    if ws.send(Message::Binary(payload)).is_err() {
                        closing = true;
                        break;
                    }
                }
                Ok(OutFrame::Close) => closing = true,
                Err(_) => break,
            }
        }

        if closing {
            break;
        }
    }
}
