//! 文件适配器
//!
//! 监听仪器的结果投递目录：每个新文件是一条ASTM消息。
//! 处理成功（保存、待匹配或无结果）的文件移入已处理目录；暂时性失败的文件留在原处，
//! 下次启动时重新处理；其余失败的文件移入 `failed` 目录。
//! 启动时目录中已有的文件也会被处理。

use super::astm::parse_astm;
use super::{is_push_only, transport_mismatch, AdapterFactory, AdapterLink, ProtocolAdapter};
use async_trait::async_trait;
use chrono::Utc;
use lis_core::{Device, LisError, ParsedMessage, Protocol, Result, TransportSettings};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 文件写入完成前可能触发多次事件，静默这么久后才读取
const DEBOUNCE: Duration = Duration::from_millis(300);
const TICK: Duration = Duration::from_millis(100);

/// 投递目录
#[derive(Debug, Clone)]
struct DropFolder {
    path: PathBuf,
    extension: Option<String>,
    processed_dir: PathBuf,
    failed_dir: PathBuf,
}

impl DropFolder {
    fn new(path: &Path, extension: Option<&String>, processed_dir: Option<&PathBuf>) -> Self {
        Self {
            path: path.to_path_buf(),
            extension: extension.map(|e| e.trim_start_matches('.').to_ascii_lowercase()),
            processed_dir: processed_dir
                .cloned()
                .unwrap_or_else(|| path.join("processed")),
            failed_dir: path.join("failed"),
        }
    }

    fn accepts(&self, file: &Path) -> bool {
        let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.starts_with('.') {
            return false;
        }

        match &self.extension {
            Some(expected) => file
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case(expected))
                .unwrap_or(false),
            None => true,
        }
    }

    async fn existing_files(&self) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.path).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && self.accepts(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn ingest(&self, file: &Path, link: &AdapterLink) {
        match tokio::fs::metadata(file).await {
            Ok(metadata) if metadata.is_file() => {}
            // 已被移走或不是普通文件
            _ => return,
        }

        let payload = match tokio::fs::read(file).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Device {}: failed to read {}: {}", link.device_id(), file.display(), e);
                return;
            }
        };

        info!("Device {}: ingesting result file {}", link.device_id(), file.display());
        match link.sink.submit(payload).await {
            Ok(outcome) => {
                debug!("Device {}: {} -> {:?}", link.device_id(), file.display(), outcome);
                self.move_into(&self.processed_dir, file, link).await;
            }
            // 连接正在停止，文件留待下次启动处理
            Err(LisError::ConnectionClosed(_)) => {}
            Err(e) if e.is_transient() => warn!(
                "Device {}: failed to process {}, file left for retry: {}",
                link.device_id(),
                file.display(),
                e
            ),
            Err(e) => {
                warn!("Device {}: rejected {}: {}", link.device_id(), file.display(), e);
                self.move_into(&self.failed_dir, file, link).await;
            }
        }
    }

    async fn move_into(&self, dir: &Path, file: &Path, link: &AdapterLink) {
        let Some(name) = file.file_name() else {
            return;
        };

        let mut target = dir.join(name);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            let stamped = format!(
                "{}-{}",
                Utc::now().format("%Y%m%d%H%M%S%3f"),
                name.to_string_lossy()
            );
            target = dir.join(stamped);
        }

        if let Err(e) = tokio::fs::rename(file, &target).await {
            warn!(
                "Device {}: failed to move {} to {}: {}",
                link.device_id(),
                file.display(),
                target.display(),
                e
            );
        }
    }
}

async fn watch_folder(
    folder: DropFolder,
    _watcher: RecommendedWatcher,
    mut events: mpsc::UnboundedReceiver<Event>,
    link: AdapterLink,
) {
    match folder.existing_files().await {
        Ok(files) => {
            for file in files {
                if link.cancel.is_cancelled() {
                    return;
                }
                folder.ingest(&file, &link).await;
            }
        }
        Err(e) => warn!("Device {}: failed to scan {}: {}", link.device_id(), folder.path.display(), e),
    }

    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
    let mut ticker = tokio::time::interval(TICK);

    loop {
        tokio::select! {
            _ = link.cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        for path in event.paths {
                            if folder.accepts(&path) {
                                pending.insert(path, Instant::now());
                            }
                        }
                    }
                }
                None => {
                    warn!("Device {}: directory watcher closed", link.device_id());
                    break;
                }
            },
            _ = ticker.tick() => {
                let ready: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, seen)| seen.elapsed() >= DEBOUNCE)
                    .map(|(path, _)| path.clone())
                    .collect();

                for path in ready {
                    pending.remove(&path);
                    folder.ingest(&path, &link).await;
                }
            }
        }
    }

    debug!("Device {}: directory watcher stopped", link.device_id());
}

pub struct FileAdapter {
    transport: TransportSettings,
}

#[async_trait]
impl ProtocolAdapter for FileAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::File
    }

    fn parse(&self, payload: &[u8]) -> Result<ParsedMessage> {
        Ok(parse_astm(payload))
    }

    async fn open(&self, link: AdapterLink) -> Result<Option<JoinHandle<()>>> {
        let TransportSettings::Directory { path, extension, processed_dir } = &self.transport else {
            return Ok(None);
        };

        let folder = DropFolder::new(path, extension.as_ref(), processed_dir.as_ref());
        tokio::fs::create_dir_all(&folder.path).await?;
        tokio::fs::create_dir_all(&folder.processed_dir).await?;
        tokio::fs::create_dir_all(&folder.failed_dir).await?;

        let (sender, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = sender.send(event);
            }
            Err(e) => warn!("Directory watch error: {}", e),
        })
        .map_err(|e| LisError::Transport(format!("创建目录监听失败: {}", e)))?;

        watcher
            .watch(&folder.path, RecursiveMode::NonRecursive)
            .map_err(|e| LisError::Transport(format!("监听目录 {} 失败: {}", folder.path.display(), e)))?;

        info!(
            "Device {}: watching {} (processed files go to {})",
            link.device_id(),
            folder.path.display(),
            folder.processed_dir.display()
        );
        Ok(Some(tokio::spawn(watch_folder(folder, watcher, events, link))))
    }
}

pub struct FileFactory;

impl AdapterFactory for FileFactory {
    fn protocol(&self) -> Protocol {
        Protocol::File
    }

    fn create(&self, device: &Device) -> Result<Arc<dyn ProtocolAdapter>> {
        if !is_push_only(&device.transport)
            && !matches!(device.transport, TransportSettings::Directory { .. })
        {
            return Err(transport_mismatch(device));
        }

        Ok(Arc::new(FileAdapter {
            transport: device.transport.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_filter() {
        let folder = DropFolder::new(Path::new("/data/in"), Some(&".ASTM".to_string()), None);
        assert!(folder.accepts(Path::new("/data/in/run1.astm")));
        assert!(folder.accepts(Path::new("/data/in/run2.ASTM")));
        assert!(!folder.accepts(Path::new("/data/in/run3.txt")));
        assert!(!folder.accepts(Path::new("/data/in/.run4.astm")));
        assert_eq!(folder.processed_dir, PathBuf::from("/data/in/processed"));
        assert_eq!(folder.failed_dir, PathBuf::from("/data/in/failed"));
    }

    #[tokio::test]
    async fn test_existing_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "R|1").unwrap();
        std::fs::write(dir.path().join("a.txt"), "R|1").unwrap();
        std::fs::create_dir(dir.path().join("processed")).unwrap();

        let folder = DropFolder::new(dir.path(), None, None);
        let files = folder.existing_files().await.unwrap();
        assert_eq!(files, vec![dir.path().join("a.txt"), dir.path().join("b.txt")]);
    }
}
