//! 错误定义模块

use thiserror::Error;

/// LIS系统统一错误类型
#[derive(Error, Debug)]
pub enum LisError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("不支持的协议: {0}")]
    UnsupportedProtocol(String),

    #[error("数值解析错误: 项目 {code} 的值 '{value}' 不是数字")]
    ValueParse { code: String, value: String },

    #[error("消息格式错误: {0}")]
    MessageFormat(String),

    #[error("持久化错误: {0}")]
    Persistence(String),

    #[error("操作超时: {operation} ({timeout_ms} ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("设备遥测更新失败: {0}")]
    Telemetry(String),

    #[error("传输错误: {0}")]
    Transport(String),

    #[error("设备连接已关闭: {0}")]
    ConnectionClosed(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LisError {
    /// 是否属于需要记录到设备遥测的处理失败
    pub fn is_processing_failure(&self) -> bool {
        matches!(
            self,
            LisError::MessageFormat(_)
                | LisError::ValueParse { .. }
                | LisError::Persistence(_)
                | LisError::Timeout { .. }
        )
    }

    /// 可重试的失败：存储不可用或超时
    pub fn is_transient(&self) -> bool {
        matches!(self, LisError::Persistence(_) | LisError::Timeout { .. })
    }
}

/// LIS系统统一结果类型
pub type Result<T> = std::result::Result<T, LisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_failure_classification() {
        assert!(LisError::Persistence("db down".to_string()).is_processing_failure());
        assert!(LisError::ValueParse { code: "GLU".to_string(), value: "abc".to_string() }
            .is_processing_failure());
        assert!(!LisError::NotFound("bs200".to_string()).is_processing_failure());
        assert!(!LisError::Telemetry("locked".to_string()).is_processing_failure());
    }

    #[test]
    fn test_transient_failures() {
        assert!(LisError::Persistence("db down".to_string()).is_transient());
        assert!(LisError::Timeout { operation: "persist result".to_string(), timeout_ms: 5000 }
            .is_transient());
        assert!(!LisError::ValueParse { code: "GLU".to_string(), value: ">500".to_string() }
            .is_transient());
        assert!(!LisError::MessageFormat("no MSH".to_string()).is_transient());
    }
}

