//! Thin transport adapters between the session engines and their backends:
//! the SSH shell channel, the SFTP subsystem and the guacd TCP socket. All
//! dial/auth failures collapse into `GatewayError::BackendUnreachable`; the
//! sessions translate that into a client-visible error frame and a clean
//! close.

pub mod guacd;
pub mod sftp;
pub mod ssh;

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::GatewayError;

/// 建立并配置 TCP 连接；握手阶段保留读写超时，避免挂死
pub(crate) fn create_tcp_connection(addr: &str) -> Result<TcpStream, GatewayError> {
    let mut addrs = addr
        .to_socket_addrs()
        .map_err(|e| GatewayError::BackendUnreachable(format!("{}: {}", addr, e)))?;
    let sock = addrs
        .next()
        .ok_or_else(|| GatewayError::BackendUnreachable(format!("无法解析地址: {}", addr)))?;
    let tcp = TcpStream::connect_timeout(&sock, Duration::from_secs(10))
        .map_err(|e| GatewayError::BackendUnreachable(format!("{}: {}", addr, e)))?;
    let _ = tcp.set_read_timeout(Some(Duration::from_secs(30)));
    let _ = tcp.set_write_timeout(Some(Duration::from_secs(30)));
    Ok(tcp)
}

/// `{username}_{host}_{yyyymmddHHMMSS}`: the session identity carried on
/// every audit record.
pub fn conn_tag(username: &str, host: &str) -> String {
    format!("{}_{}_{}", username, host, chrono::Local::now().format("%Y%m%d%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_tag_shape() {
        let tag = conn_tag("root", "10.1.2.3");
        let parts: Vec<&str> = tag.split('_').collect();
        assert_eq!(parts[0], "root");
        assert_eq!(parts[1], "10.1.2.3");
        assert_eq!(parts[2].len(), 14);
    }

    #[test]
    fn unresolvable_address_maps_to_backend_unreachable() {
        let err = create_tcp_connection("definitely-not-a-host.invalid:22").unwrap_err();
        assert!(matches!(err, GatewayError::BackendUnreachable(_)));
        assert_eq!(err.to_string(), "connection fail...");
    }
}
