//! 结果通知模块
//!
//! 新结果保存后向订阅方发出通知，至多一次、无需确认：
//! - 进程内广播
//! - Webhook推送（可选SHA-256签名）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 新结果事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewResultEvent {
    pub device_id: String,
    pub device_name: String,
    pub patient_name: String,
    pub result_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

impl NewResultEvent {
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        patient_name: impl Into<String>,
        result_id: Uuid,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            patient_name: patient_name.into(),
            result_id,
            occurred_at: Utc::now(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        "device_result.created"
    }
}

/// 事件发布接口，调用方不等待投递结果
pub trait EventSink: Send + Sync {
    fn publish(&self, event: NewResultEvent);
}

/// 丢弃所有事件
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn publish(&self, event: NewResultEvent) {
        debug!("Dropping result event {}", event.result_id);
    }
}

/// 进程内广播
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<NewResultEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NewResultEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: NewResultEvent) {
        // 没有订阅者时发送失败属于正常情况
        if self.sender.send(event).is_err() {
            debug!("No subscribers for result event");
        }
    }
}

/// Webhook推送
#[derive(Debug, Clone)]
pub struct WebhookEventSink {
    url: String,
    secret: Option<String>,
    client: reqwest::Client,
}

impl WebhookEventSink {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            url: url.into(),
            secret,
            client: reqwest::Client::new(),
        }
    }

    /// 生成签名
    pub fn generate_signature(&self, payload: &str) -> Option<String> {
        use sha2::{Digest, Sha256};

        let secret = self.secret.as_ref()?;
        let mut hasher = Sha256::new();
        hasher.update(payload);
        hasher.update(secret);
        Some(format!("sha256={:x}", hasher.finalize()))
    }

    async fn send(client: reqwest::Client, url: String, payload: String, signature: Option<String>) {
        let mut request = client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("User-Agent", "LIS-Webhook/1.0")
            .body(payload);

        if let Some(signature) = signature {
            request = request.header("X-LIS-Signature", signature);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                info!("Successfully sent webhook to: {}", url);
            }
            Ok(response) => {
                error!("Webhook failed with status {}: {}", response.status(), url);
            }
            Err(e) => {
                error!("Failed to send webhook to {}: {}", url, e);
            }
        }
    }
}

impl EventSink for WebhookEventSink {
    fn publish(&self, event: NewResultEvent) {
        let payload = serde_json::json!({
            "event": event.event_type(),
            "data": event,
        })
        .to_string();
        let signature = self.generate_signature(&payload);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(Self::send(self.client.clone(), self.url.clone(), payload, signature));
            }
            Err(_) => warn!("No async runtime available, dropping webhook event"),
        }
    }
}
