//! 背景预加载器
//!
//! 为每个生效的 `ProviderConfig` 维护一个小容量的就绪队列：`get()` 命中队列时立即返回，
//! 同时保证后台至多一个补充任务在跑，让下一次请求也能命中。

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::provider::{self, AssetSource, ProviderSource};
use super::types::BackgroundAsset;
use crate::error::AppError;

struct PreloadShared<S> {
    source: S,
    depth: usize,
    default_asset: PathBuf,
    queue: Mutex<VecDeque<BackgroundAsset>>,
    /// 被替换后置位，后台任务不得再入队
    retired: AtomicBool,
}

impl<S> PreloadShared<S> {
    fn queued(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    fn pop(&self) -> Option<BackgroundAsset> {
        self.queue.lock().ok()?.pop_front()
    }

    /// retired 的检查与写入都在队列锁内，替换之后不会有结果写入旧队列
    fn push(&self, asset: BackgroundAsset) -> bool {
        match self.queue.lock() {
            Ok(mut q) if !self.retired.load(Ordering::Acquire) && q.len() < self.depth => {
                q.push_back(asset);
                true
            }
            _ => false,
        }
    }

    /// 在队列锁内置位并清空已排队的图片
    fn retire(&self) {
        match self.queue.lock() {
            Ok(mut q) => {
                self.retired.store(true, Ordering::Release);
                q.clear();
            }
            Err(_) => self.retired.store(true, Ordering::Release),
        }
    }
}

/// 单个配置对应的预加载器
pub struct Preloader<S: AssetSource = ProviderSource> {
    shared: Arc<PreloadShared<S>>,
    /// 后台补充任务句柄；“空闲才启动”的判断与登记在同一把锁内完成
    fill_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: AssetSource> Preloader<S> {
    pub fn new(source: S, depth: usize, default_asset: PathBuf) -> Self {
        Self {
            shared: Arc::new(PreloadShared {
                source,
                depth: depth.max(1),
                default_asset,
                queue: Mutex::new(VecDeque::new()),
                retired: AtomicBool::new(false),
            }),
            fill_task: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &S {
        &self.shared.source
    }

    /// 队列中已就绪的数量
    pub fn queued(&self) -> usize {
        self.shared.queued()
    }

    pub fn depth(&self) -> usize {
        self.shared.depth
    }

    /// 后台补充任务是否仍在运行
    pub fn is_filling(&self) -> bool {
        self.fill_task
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// 若没有补充任务在跑则启动一个，否则什么都不做。
    pub fn ensure_fill(&self) {
        if self.shared.retired.load(Ordering::Acquire) {
            return;
        }
        let Ok(mut slot) = self.fill_task.lock() else {
            warn!("预加载任务锁已中毒，跳过本次补充");
            return;
        };
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let shared = self.shared.clone();
        *slot = Some(tokio::spawn(async move {
            let name = shared.source.name().to_string();
            if let Err(panic) = AssertUnwindSafe(fill_queue(shared)).catch_unwind().await {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("背景预加载任务异常退出: source={name}, panic={msg}");
            }
        }));
    }

    /// 取一张背景：优先队列，其次同步获取一次，最后读取内置默认背景。
    ///
    /// 默认背景缺失返回 `AppError::DefaultAssetMissing`，属于不可恢复的部署错误。
    pub async fn get(&self) -> Result<BackgroundAsset, AppError> {
        self.ensure_fill();

        if let Some(asset) = self.shared.pop() {
            debug!(
                "背景命中预加载队列: source={}, remaining={}",
                self.shared.source.name(),
                self.queued()
            );
            return Ok(asset);
        }

        if let Some(asset) = self.shared.source.fetch().await {
            return Ok(asset);
        }

        warn!(
            "背景来源不可用，使用默认背景: source={}",
            self.shared.source.name()
        );
        provider::read_default_asset(&self.shared.default_asset).await
    }

    /// 标记为已替换并中止后台任务；已排队的图片随实例一起丢弃。
    pub fn retire(&self) {
        self.shared.retire();
        if let Ok(mut slot) = self.fill_task.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }
}

impl<S: AssetSource> Drop for Preloader<S> {
    fn drop(&mut self) {
        self.retire();
    }
}

/// 补充到目标深度；任意一次获取失败（来源枯竭或持续出错）即退出，等待下次 `ensure_fill`。
async fn fill_queue<S: AssetSource>(shared: Arc<PreloadShared<S>>) {
    loop {
        if shared.retired.load(Ordering::Acquire) || shared.queued() >= shared.depth {
            break;
        }
        let Some(asset) = shared.source.fetch().await else {
            debug!("预加载获取失败，停止本轮补充: source={}", shared.source.name());
            break;
        };
        if !shared.push(asset) {
            break;
        }
    }
}
