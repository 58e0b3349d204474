//! 通用工具函数

use crate::error::{LisError, Result};
use std::future::Future;
use std::time::Duration;

/// 为外部调用加上超时，超时转换为 `LisError::Timeout`
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(LisError::Timeout {
            operation: operation.to_string(),
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

/// 截取日志用的消息预览
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut preview: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        preview.push_str("...");
    }
    preview.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let value = with_timeout("fast", Duration::from_millis(100), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<()> = with_timeout("slow", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        match result {
            Err(LisError::Timeout { operation, timeout_ms }) => {
                assert_eq!(operation, "slow");
                assert_eq!(timeout_ms, 10);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("H|\\^&\nP|1", 4), "H|\\^...");
        assert_eq!(preview("R|1", 10), "R|1");
    }
}
