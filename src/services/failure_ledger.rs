//! 失败清单服务 - 业务能力层
//!
//! 只负责"记下重试耗尽的地址"，同一地址只写一次

use crate::error::LedgerError;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// 失败清单
///
/// 启动时从文件重建内存集合，之后只追加，不再扫描文件。
#[derive(Debug)]
pub struct FailureLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

#[derive(Debug)]
struct LedgerState {
    seen: HashSet<String>,
    /// 已有文件最后一行没有换行符，下次追加前先补上
    missing_newline: bool,
}

impl FailureLedger {
    /// 打开清单文件；文件不存在视为空清单
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let (seen, missing_newline) = match fs::read_to_string(&path).await {
            Ok(content) => {
                let seen: HashSet<String> = content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect();
                (seen, !content.is_empty() && !content.ends_with('\n'))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (HashSet::new(), false),
            Err(source) => {
                return Err(LedgerError::ReadFailed {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        info!("📒 失败清单 {} 已载入 {} 条", path.display(), seen.len());

        Ok(Self {
            path,
            state: Mutex::new(LedgerState {
                seen,
                missing_newline,
            }),
        })
    }

    /// 记录一个地址
    ///
    /// # 返回
    /// 新写入返回 `true`，已存在返回 `false`
    pub async fn record(&self, target: &str) -> Result<bool, LedgerError> {
        let target = target.trim();
        let mut state = self.state.lock().await;
        if state.seen.contains(target) {
            debug!("{} 已在失败清单中", target);
            return Ok(false);
        }

        let write_failed = |source| LedgerError::WriteFailed {
            path: self.path.display().to_string(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(write_failed)?;
        let line = if state.missing_newline {
            format!("\n{target}\n")
        } else {
            format!("{target}\n")
        };
        file.write_all(line.as_bytes()).await.map_err(write_failed)?;
        file.flush().await.map_err(write_failed)?;

        state.missing_newline = false;
        state.seen.insert(target.to_string());
        Ok(true)
    }

    pub async fn contains(&self, target: &str) -> bool {
        self.state.lock().await.seen.contains(target.trim())
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.seen.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
