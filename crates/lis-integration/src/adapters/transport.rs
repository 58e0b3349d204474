//! 流式传输
//!
//! TCP客户端、TCP服务端与串口三种端点共用一个驱动任务：
//! 建立连接后交给协议会话处理，断开后按退避策略重连（服务端则等待下一次连入）。

use super::AdapterLink;
use async_trait::async_trait;
use lis_core::utils::with_timeout;
use lis_core::{ConnectionStatus, LisError, Parity, Result, TransportSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, warn};

/// 可读写的字节流
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// 协议会话：在一条已建立的连接上收发，直到对端断开或出错
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn run(&self, stream: BoxedStream, link: &AdapterLink) -> Result<()>;
}

/// 重连策略（指数退避）
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// 最大重试次数，0表示不限
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 0,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            multiplier,
            max_attempts,
        }
    }

    /// 第 `attempt` 次重试前的等待时间（从1开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt > self.max_attempts
    }
}

/// 连接TCP端点，带超时
pub async fn connect_tcp(host: &str, port: u16, limit: Duration) -> Result<TcpStream> {
    let stream = with_timeout("transport connect", limit, async {
        TcpStream::connect((host, port))
            .await
            .map_err(|e| LisError::Transport(format!("连接 {}:{} 失败: {}", host, port, e)))
    })
    .await?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}:{}: {}", host, port, e);
    }
    Ok(stream)
}

/// 打开串口
pub fn open_serial(
    path: &str,
    baud_rate: u32,
    data_bits: u8,
    parity: Parity,
    stop_bits: u8,
) -> Result<SerialStream> {
    let data_bits = match data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        other => return Err(LisError::Config(format!("不支持的数据位: {}", other))),
    };
    let stop_bits = match stop_bits {
        1 => tokio_serial::StopBits::One,
        2 => tokio_serial::StopBits::Two,
        other => return Err(LisError::Config(format!("不支持的停止位: {}", other))),
    };
    let parity = match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    };

    tokio_serial::new(path, baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .open_native_async()
        .map_err(|e| LisError::Transport(format!("打开串口 {} 失败: {}", path, e)))
}

enum Endpoint {
    TcpClient {
        host: String,
        port: u16,
    },
    TcpServer(TcpListener),
    Serial {
        path: String,
        baud_rate: u32,
        data_bits: u8,
        parity: Parity,
        stop_bits: u8,
    },
}

impl Endpoint {
    async fn connect(&self, limit: Duration) -> Result<BoxedStream> {
        match self {
            Endpoint::TcpClient { host, port } => {
                Ok(Box::new(connect_tcp(host, *port, limit).await?))
            }
            Endpoint::Serial { path, baud_rate, data_bits, parity, stop_bits } => Ok(Box::new(
                open_serial(path, *baud_rate, *data_bits, *parity, *stop_bits)?,
            )),
            Endpoint::TcpServer(_) => Err(LisError::Transport("服务端端点不能主动连接".to_string())),
        }
    }

    /// 重新获得一条连接；被取消或重试耗尽时返回 `None`
    async fn reestablish(&self, link: &AdapterLink) -> Option<BoxedStream> {
        let device_id = link.device_id();

        if let Endpoint::TcpServer(listener) = self {
            loop {
                tokio::select! {
                    _ = link.cancel.cancelled() => return None,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            info!("Device {}: instrument connected from {}", device_id, peer);
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                            }
                            return Some(Box::new(stream));
                        }
                        Err(e) => {
                            warn!("Device {}: accept failed: {}", device_id, e);
                            tokio::time::sleep(Duration::from_millis(200)).await;
                        }
                    },
                }
            }
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if link.reconnect.is_exhausted(attempt) {
                error!(
                    "Device {}: giving up after {} reconnection attempts",
                    device_id,
                    attempt - 1
                );
                link.set_status(ConnectionStatus::Error);
                return None;
            }

            let delay = link.reconnect.delay_for(attempt);
            info!("Device {}: reconnection attempt {} in {:?}", device_id, attempt, delay);
            tokio::select! {
                _ = link.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.connect(link.connect_timeout).await {
                Ok(stream) => {
                    info!("Device {}: reconnected", device_id);
                    return Some(stream);
                }
                Err(e) => warn!("Device {}: reconnection failed: {}", device_id, e),
            }
        }
    }
}

/// 建立流式传输并启动驱动任务
///
/// 客户端与串口在这里完成首次连接，失败即返回错误；服务端只完成端口绑定。
pub async fn open_stream(
    settings: &TransportSettings,
    handler: Arc<dyn SessionHandler>,
    link: AdapterLink,
) -> Result<Option<JoinHandle<()>>> {
    let (endpoint, first): (Endpoint, Option<BoxedStream>) = match settings {
        TransportSettings::None => return Ok(None),
        TransportSettings::TcpClient { host, port } => {
            let endpoint = Endpoint::TcpClient { host: host.clone(), port: *port };
            let stream = endpoint.connect(link.connect_timeout).await?;
            info!("Device {}: connected to {}:{}", link.device_id(), host, port);
            (endpoint, Some(stream))
        }
        TransportSettings::TcpServer { bind, port } => {
            let listener = TcpListener::bind((bind.as_str(), *port))
                .await
                .map_err(|e| LisError::Transport(format!("绑定 {}:{} 失败: {}", bind, port, e)))?;
            info!("Device {}: listening on {}:{}", link.device_id(), bind, port);
            (Endpoint::TcpServer(listener), None)
        }
        TransportSettings::Serial { path, baud_rate, data_bits, parity, stop_bits } => {
            let endpoint = Endpoint::Serial {
                path: path.clone(),
                baud_rate: *baud_rate,
                data_bits: *data_bits,
                parity: *parity,
                stop_bits: *stop_bits,
            };
            let stream = endpoint.connect(link.connect_timeout).await?;
            info!("Device {}: serial port {} opened at {} baud", link.device_id(), path, baud_rate);
            (endpoint, Some(stream))
        }
        TransportSettings::Directory { .. } => {
            return Err(super::transport_mismatch(&link.device));
        }
    };

    Ok(Some(tokio::spawn(drive(endpoint, first, handler, link))))
}

async fn drive(
    endpoint: Endpoint,
    mut next: Option<BoxedStream>,
    handler: Arc<dyn SessionHandler>,
    link: AdapterLink,
) {
    let is_listener = matches!(endpoint, Endpoint::TcpServer(_));

    loop {
        let stream = match next.take() {
            Some(stream) => stream,
            None => match endpoint.reestablish(&link).await {
                Some(stream) => stream,
                None => break,
            },
        };
        link.set_status(ConnectionStatus::Connected);

        let outcome = tokio::select! {
            _ = link.cancel.cancelled() => break,
            outcome = handler.run(stream, &link) => outcome,
        };

        match outcome {
            Ok(()) => info!("Device {}: peer closed the connection", link.device_id()),
            Err(e) => warn!("Device {}: session ended with error: {}", link.device_id(), e),
        }

        if link.cancel.is_cancelled() {
            break;
        }
        if !is_listener {
            link.set_status(ConnectionStatus::Disconnected);
        }
    }

    debug!("Device {}: transport task stopped", link.device_id());
}
