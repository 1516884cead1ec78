//! Remote-desktop session tunneled through guacd. After the handshake the
//! guacd socket joins the shared readiness loop; the loop's worker drains
//! complete instructions and forwards them verbatim to the browser, which
//! speaks the Guacamole protocol natively. Client frames are complete
//! instructions and go to guacd untouched.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::Duration;

use crate::backend::guacd;
use crate::config::Config;
use crate::error::GatewayError;
use crate::guac::{GuacdParams, InstructionParser, handshake};
use crate::mux::{HandlerFlow, MuxToken, ReadyLoop, SharedStream};
use crate::session::Flow;
use crate::session::terminal::SessionMeta;
use crate::ws::{ClientSender, SessionQuery};

pub struct GuacSession {
    client: ClientSender,
    mux: ReadyLoop,
    sock: SharedStream,
    token: Option<MuxToken>,
    meta: SessionMeta,
    closed: bool,
}

impl GuacSession {
    /// Dial guacd, run the protocol handshake and register with the shared
    /// readiness loop.
    pub fn open(
        client: ClientSender,
        mux: ReadyLoop,
        config: &Config,
        query: &SessionQuery,
        meta: SessionMeta,
    ) -> Result<GuacSession, GatewayError> {
        let params = GuacdParams {
            protocol: meta.asset.protocol.as_str().to_string(),
            hostname: meta.asset.ip.clone(),
            port: meta.asset.port.to_string(),
            username: meta.account.username.clone(),
            password: meta.account.password.clone(),
            width: query
                .get_u32("width")
                .unwrap_or(config.screen_width)
                .to_string(),
            height: query
                .get_u32("height")
                .unwrap_or(config.screen_height)
                .to_string(),
            dpi: "96".to_string(),
            extra: config
                .guacd_options
                .iter()
                .map(|(k, v)| (k.replace('_', "-"), v.clone()))
                .collect::<HashMap<_, _>>(),
        };

        let mut stream = guacd::dial(&config.guacd_host, config.guacd_port)?;
        let connection_id = handshake(&mut stream, &params)
            .map_err(|e| GatewayError::BackendUnreachable(format!("guacd: {}", e)))?;
        tracing::info!("[guac] {} connected: {}", meta.conn_tag, connection_id);

        let polled = guacd::into_polled(stream)
            .map_err(|e| GatewayError::BackendUnreachable(format!("guacd: {}", e)))?;
        let sock: SharedStream = std::sync::Arc::new(std::sync::Mutex::new(polled));

        let mut session = GuacSession {
            client: client.clone(),
            mux: mux.clone(),
            sock: sock.clone(),
            token: None,
            meta,
            closed: false,
        };
        let token = mux
            .register(sock.clone(), guacd_reader(sock, client))
            .map_err(|e| GatewayError::Backend(format!("guacd 注册失败: {}", e)))?;
        session.token = Some(token);
        Ok(session)
    }
}

/// Readiness handler: drain whatever guacd has buffered, forward every
/// complete instruction, close the browser connection after a `5.error`
/// or when guacd hangs up.
fn guacd_reader(
    sock: SharedStream,
    client: ClientSender,
) -> impl FnMut() -> anyhow::Result<HandlerFlow> + Send + 'static {
    let mut parser = InstructionParser::new();
    let mut buf = [0u8; 4096];
    move || {
        loop {
            let read = {
                let mut guard = sock.lock().expect("guacd socket poisoned");
                guard.read(&mut buf)
            };
            match read {
                Ok(0) => {
                    client.close();
                    return Ok(HandlerFlow::Closed);
                }
                Ok(n) => {
                    parser.feed(&buf[..n]);
                    while let Some(instruction) = parser.next_raw()? {
                        let is_error = instruction.starts_with("5.error");
                        if client.send_text(instruction).is_err() {
                            return Ok(HandlerFlow::Closed);
                        }
                        if is_error {
                            client.close();
                            return Ok(HandlerFlow::Closed);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(HandlerFlow::Continue);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    client.close();
                    return Err(e.into());
                }
            }
        }
    }
}

impl crate::session::SessionEngine for GuacSession {
    /// Each client text frame is one complete Guacamole instruction,
    /// written through as-is.
    fn on_client_text(&mut self, payload: &str) -> Flow {
        let mut guard = self.sock.lock().expect("guacd socket poisoned");
        let data = payload.as_bytes();
        let mut written = 0usize;
        while written < data.len() {
            match guard.write(&data[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(4));
                }
                Err(e) => {
                    tracing::error!("[guac] {} write failed: {}", self.meta.conn_tag, e);
                    return Flow::Closed;
                }
            }
        }
        Flow::Continue
    }

    fn on_client_binary(&mut self, _payload: &[u8]) -> Flow {
        // Guacamole 协议全部走文本帧
        Flow::Continue
    }

    fn poll_backend(&mut self) -> Flow {
        // 后端方向由共享轮询线程驱动
        Flow::Continue
    }

    fn on_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(token) = self.token.take() {
            self.mux.unregister(token);
        }
        tracing::info!("[guac] {} closed", self.meta.conn_tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::OutFrame;
    use std::io::Write as _;

    fn socket_pair() -> (std::net::TcpStream, SharedStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = std::net::TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        server.set_nonblocking(true).expect("nonblocking");
        (client, std::sync::Arc::new(std::sync::Mutex::new(mio::net::TcpStream::from_std(server))))
    }

    fn invoke_until(
        handler: &mut (impl FnMut() -> anyhow::Result<HandlerFlow> + Send),
        stop: HandlerFlow,
    ) -> HandlerFlow {
        for _ in 0..50 {
            let flow = handler().expect("handler");
            if flow == stop {
                return flow;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("handler never reached {:?}", stop);
    }

    #[test]
    fn instructions_are_forwarded_verbatim() {
        let (mut peer, sock) = socket_pair();
        let (client, rx) = ClientSender::channel();
        let mut handler = guacd_reader(sock, client);

        peer.write_all(b"4.sync,8.12345678;5.mouse,2.10,2.20;").expect("write");
        for _ in 0..50 {
            assert_eq!(handler().expect("handler"), HandlerFlow::Continue);
            if rx.len() >= 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        match rx.try_recv().expect("first frame") {
            OutFrame::Text(t) => assert_eq!(t, "4.sync,8.12345678;"),
            other => panic!("unexpected frame {:?}", other),
        }
        match rx.try_recv().expect("second frame") {
            OutFrame::Text(t) => assert_eq!(t, "5.mouse,2.10,2.20;"),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn error_instruction_closes_after_forward() {
        let (mut peer, sock) = socket_pair();
        let (client, rx) = ClientSender::channel();
        let mut handler = guacd_reader(sock, client);

        peer.write_all(b"5.error,7.badauth,1.0;").expect("write");
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(invoke_until(&mut handler, HandlerFlow::Closed), HandlerFlow::Closed);

        match rx.try_recv().expect("forwarded error") {
            OutFrame::Text(t) => assert_eq!(t, "5.error,7.badauth,1.0;"),
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(matches!(rx.try_recv().expect("close follows"), OutFrame::Close));
    }

    #[test]
    fn peer_hangup_closes_the_client() {
        let (peer, sock) = socket_pair();
        let (client, rx) = ClientSender::channel();
        let mut handler = guacd_reader(sock, client);

        drop(peer);
        assert_eq!(invoke_until(&mut handler, HandlerFlow::Closed), HandlerFlow::Closed);
        assert!(matches!(rx.try_recv().expect("close queued"), OutFrame::Close));
    }
}
