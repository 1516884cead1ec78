/// Gateway-wide structured errors. The `Display` text of each variant is the
/// message shipped to the browser client inside an ERROR frame, so the literal
/// strings here are part of the wire contract.
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// 握手请求未携带有效身份
    AuthFailure,
    /// 资产不存在
    AssetNotFound(i64),
    /// 账号被禁用
    AccountInactive(i64),
    /// 后端 TCP/SSH/SFTP/guacd 建连或认证失败
    BackendUnreachable(String),
    /// 客户端消息缺少必要参数或无法解析
    Protocol(String),
    /// 会话中途后端出错（通道关闭、SFTP 异常、guacd error 指令）
    Backend(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use GatewayError::*;
        match self {
            AuthFailure => write!(f, "connection fail..."),
            AssetNotFound(_) => write!(f, "connection fail..."),
            AccountInactive(_) => write!(f, "account is invalid, connection fail... "),
            BackendUnreachable(_) => write!(f, "connection fail..."),
            Protocol(msg) => write!(f, "{}", msg),
            Backend(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    /// Whether the session must be torn down after sending the error frame.
    /// Protocol errors keep the session alive; everything else closes it.
    pub fn is_fatal(&self) -> bool {
        use GatewayError::*;
        match self {
            Protocol(_) => false,
            AuthFailure | AssetNotFound(_) | AccountInactive(_) | BackendUnreachable(_)
            | Backend(_) => true,
        }
    }

    /// Detail string for the operator log; the client only ever sees
    /// `Display`, which deliberately hides backend specifics.
    pub fn detail(&self) -> String {
        use GatewayError::*;
        match self {
            AuthFailure => "authentication failed".to_string(),
            AssetNotFound(id) => format!("asset {} not found", id),
            AccountInactive(id) => format!("account {} is inactive", id),
            BackendUnreachable(msg) => format!("backend unreachable: {}", msg),
            Protocol(msg) => format!("protocol error: {}", msg),
            Backend(msg) => format!("backend error: {}", msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_are_stable() {
        assert_eq!(GatewayError::AuthFailure.to_string(), "connection fail...");
        assert_eq!(GatewayError::AssetNotFound(3).to_string(), "connection fail...");
        // 尾部空格是线上既定格式，保持不变
        assert_eq!(
            GatewayError::AccountInactive(7).to_string(),
            "account is invalid, connection fail... "
        );
    }

    #[test]
    fn protocol_errors_are_not_fatal() {
        assert!(!GatewayError::Protocol("参数不正确！".to_string()).is_fatal());
        assert!(GatewayError::BackendUnreachable("dial".to_string()).is_fatal());
        assert!(GatewayError::Backend("channel closed".to_string()).is_fatal());
    }
}
