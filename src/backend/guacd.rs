use std::net::TcpStream;

use crate::error::GatewayError;

/// Dial the local guacd. The returned stream is blocking with the handshake
/// read timeout still armed; call [`into_polled`] once the handshake is done.
pub fn dial(host: &str, port: u16) -> Result<TcpStream, GatewayError> {
    super::create_tcp_connection(&format!("{}:{}", host, port))
}

/// Switch a handshaken guacd socket to the non-blocking form the shared
/// readiness loop polls.
pub fn into_polled(stream: TcpStream) -> anyhow::Result<mio::net::TcpStream> {
    stream.set_read_timeout(None)?;
    stream.set_nonblocking(true)?;
    Ok(mio::net::TcpStream::from_std(stream))
}
