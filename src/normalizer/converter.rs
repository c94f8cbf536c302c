//! # HEIC 转换适配模块
//!
//! ## 设计思路
//!
//! HEIC/HEIF 的解码能力来自外部（HTTP 转换服务、本地命令行工具等），
//! 这里把“如何获得能力”与“如何使用能力”拆开：
//! - `CapabilitySource`：一个能力来源，`load` 成功即得到一个 `HeicConverter`
//! - `HeicConverter`：`(bytes) -> JPEG bytes` 的转换能力本身
//! - `HeicAdapter`：按顺序尝试各来源，解析成功后在实例生命周期内复用
//!
//! ## 实现思路
//!
//! 能力解析状态机：未解析 → 解析中 → 已解析 / 全部失败。
//! - 解析过程由 `tokio::sync::Mutex` 串行化；并发请求在锁上等待，复用同一轮解析结果（single-flight）。
//! - 全部来源失败时返回 `ConversionUnavailable`，不缓存失败结果；失败后到达的下一次调用会重新解析。
//! - 等待中的请求通过“失败轮次计数”判断自己是否加入了一轮已失败的解析，避免重复发起。
//! - 转换结果按来源标识缓存（仅写入一次、无淘汰），重复展示/导出同一张照片不再调用外部能力。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use super::NormalizeError;

/// 外部转换器的返回形态。
///
/// 多图层容器可能返回多张图片，适配器固定取第一张。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConverterOutput {
    Single(Vec<u8>),
    Multiple(Vec<Vec<u8>>),
}

/// HEIC → JPEG 转换能力。
#[async_trait]
pub trait HeicConverter: Send + Sync {
    async fn convert(&self, bytes: &[u8], quality: f32) -> Result<ConverterOutput, NormalizeError>;
}

/// 转换能力来源。
#[async_trait]
pub trait CapabilitySource: Send + Sync {
    fn name(&self) -> &str;
    async fn load(&self) -> Result<Arc<dyn HeicConverter>, NormalizeError>;
}

pub type DynCapabilitySource = Arc<dyn CapabilitySource>;

/// 按来源标识缓存的转换结果。
///
/// 相同标识必然对应相同结果，因此只在首次写入，不存在更新竞争。
#[derive(Debug, Default)]
pub struct ConversionCache {
    entries: Mutex<HashMap<String, Arc<Vec<u8>>>>,
}

impl ConversionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取得缓存锁。条目只写一次且值不可变，锁被毒化时数据仍然完整，
    /// 因此记录告警后恢复使用，而不是让缓存静默失效。
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<Vec<u8>>>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            log::warn!("⚠️ 转换缓存锁已毒化，恢复后继续使用");
            self.entries.clear_poison();
            poisoned.into_inner()
        })
    }

    pub fn get(&self, identity: &str) -> Option<Arc<Vec<u8>>> {
        self.entries().get(identity).cloned()
    }

    pub fn insert(&self, identity: &str, bytes: Arc<Vec<u8>>) {
        if bytes.is_empty() {
            return;
        }

        self.entries().entry(identity.to_string()).or_insert(bytes);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// HEIC 转换适配器。
pub struct HeicAdapter {
    sources: Vec<DynCapabilitySource>,
    conversion_quality: f32,
    resolved: RwLock<Option<Arc<dyn HeicConverter>>>,
    resolving: tokio::sync::Mutex<()>,
    failed_rounds: AtomicU64,
    cache: Arc<ConversionCache>,
}

impl HeicAdapter {
    pub fn new(sources: Vec<DynCapabilitySource>, conversion_quality: f32) -> Self {
        Self::with_cache(sources, conversion_quality, Arc::new(ConversionCache::new()))
    }

    /// 使用外部注入的结果缓存创建适配器。
    pub fn with_cache(
        sources: Vec<DynCapabilitySource>,
        conversion_quality: f32,
        cache: Arc<ConversionCache>,
    ) -> Self {
        Self {
            sources,
            conversion_quality,
            resolved: RwLock::new(None),
            resolving: tokio::sync::Mutex::new(()),
            failed_rounds: AtomicU64::new(0),
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<ConversionCache> {
        &self.cache
    }

    /// 能力是否已解析。
    pub fn is_resolved(&self) -> bool {
        self.resolved_capability().is_some()
    }

    fn resolved_capability(&self) -> Option<Arc<dyn HeicConverter>> {
        self.resolved.read().ok().and_then(|guard| guard.clone())
    }

    /// 获取转换能力（single-flight）。
    pub async fn capability(&self) -> Result<Arc<dyn HeicConverter>, NormalizeError> {
        if let Some(capability) = self.resolved_capability() {
            return Ok(capability);
        }

        let observed_round = self.failed_rounds.load(Ordering::SeqCst);
        let _guard = self.resolving.lock().await;

        if let Some(capability) = self.resolved_capability() {
            return Ok(capability);
        }

        if self.failed_rounds.load(Ordering::SeqCst) != observed_round {
            return Err(NormalizeError::ConversionUnavailable(
                "等待中的能力解析已失败".to_string(),
            ));
        }

        for source in &self.sources {
            match source.load().await {
                Ok(capability) => {
                    let mut slot = self
                        .resolved
                        .write()
                        .map_err(|_| NormalizeError::Internal("转换能力状态锁已中毒".to_string()))?;
                    *slot = Some(Arc::clone(&capability));
                    log::info!("✅ HEIC 转换能力已就绪 - 来源: {}", source.name());
                    return Ok(capability);
                }
                Err(err) => {
                    log::warn!("⚠️ HEIC 转换能力加载失败 - 来源: {}：{}", source.name(), err);
                }
            }
        }

        self.failed_rounds.fetch_add(1, Ordering::SeqCst);
        Err(NormalizeError::ConversionUnavailable(format!(
            "全部 {} 个转换能力来源均不可用",
            self.sources.len()
        )))
    }

    /// 将 HEIC/HEIF 字节转换为 JPEG 字节，结果按 `identity` 缓存。
    pub async fn convert(&self, identity: &str, bytes: &[u8]) -> Result<Arc<Vec<u8>>, NormalizeError> {
        if let Some(cached) = self.cache.get(identity) {
            log::debug!("♻️ 命中 HEIC 转换缓存 - {}", short_identity(identity));
            return Ok(cached);
        }

        let capability = self.capability().await?;
        let output = capability
            .convert(bytes, self.conversion_quality)
            .await
            .map_err(|err| match err {
                NormalizeError::ConversionFailed(_) => err,
                other => NormalizeError::ConversionFailed(other.to_string()),
            })?;

        let jpeg = Arc::new(select_first_image(output)?);
        self.cache.insert(identity, Arc::clone(&jpeg));

        Ok(jpeg)
    }
}

/// 从转换器输出中确定性地选出一张可解码的标准图片。
fn select_first_image(output: ConverterOutput) -> Result<Vec<u8>, NormalizeError> {
    let bytes = match output {
        ConverterOutput::Single(bytes) => bytes,
        ConverterOutput::Multiple(images) => {
            if images.len() > 1 {
                log::debug!("🖼️ 转换器返回 {} 张图片，取第一张", images.len());
            }
            images
                .into_iter()
                .next()
                .ok_or_else(|| NormalizeError::ConversionFailed("转换器返回空列表".to_string()))?
        }
    };

    if bytes.is_empty() {
        return Err(NormalizeError::ConversionFailed("转换器返回空结果".to_string()));
    }

    match infer::get(&bytes) {
        Some(kind)
            if kind.matcher_type() == infer::MatcherType::Image
                && kind.mime_type() != "image/heif"
                && kind.mime_type() != "image/heic" =>
        {
            Ok(bytes)
        }
        Some(kind) => Err(NormalizeError::ConversionFailed(format!(
            "转换器返回了非标准图片：{}",
            kind.mime_type()
        ))),
        None => Err(NormalizeError::ConversionFailed("转换器返回内容无法识别".to_string())),
    }
}

fn short_identity(identity: &str) -> &str {
    identity.get(..12).unwrap_or(identity)
}
