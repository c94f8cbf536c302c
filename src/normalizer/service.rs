//! # 服务层（可共享状态）
//!
//! ## 设计思路
//!
//! `NormalizerService` 是调用方持有的长期对象，替代全局单例：
//! 1. 生命周期清晰（由入口统一创建，可在任务间 `clone` 共享）
//! 2. 测试可创建独立实例，转换能力与缓存互不干扰
//! 3. 默认拟合策略可在运行时切换，单次调用仍使用一致的快照
//!
//! ## 实现思路
//!
//! 对外仅暴露少量稳定 API：
//! - `normalize`：单张照片，可覆盖拟合策略
//! - `normalize_batch`：多张照片，每张一个独立任务，结果按提交顺序返回
//! - `set_fit_config` / `fit_config`：读写默认拟合策略

use std::sync::{Arc, RwLock};

use super::{
    DisplayImage, FitConfig, NormalizeError, NormalizedPhoto, NormalizerConfig, PhotoNormalizer, SourceImage,
};

/// 归一化服务状态。
#[derive(Clone)]
pub struct NormalizerService {
    normalizer: Arc<PhotoNormalizer>,
    fit_config: Arc<RwLock<FitConfig>>,
}

impl NormalizerService {
    /// 使用默认配置创建服务。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use photo_normalizer::normalizer::NormalizerService;
    ///
    /// let service = NormalizerService::new()?;
    /// # Ok::<(), photo_normalizer::normalizer::NormalizeError>(())
    /// ```
    pub fn new() -> Result<Self, NormalizeError> {
        Self::with_config(NormalizerConfig::default(), FitConfig::default())
    }

    /// 使用自定义配置创建服务。
    pub fn with_config(config: NormalizerConfig, fit_config: FitConfig) -> Result<Self, NormalizeError> {
        fit_config.validate()?;
        let normalizer = PhotoNormalizer::new(config)?;
        Ok(Self::from_normalizer(normalizer, fit_config))
    }

    /// 包装已构建好的门面（测试中用于注入假转码器与转换来源）。
    pub fn from_normalizer(normalizer: PhotoNormalizer, fit_config: FitConfig) -> Self {
        Self {
            normalizer: Arc::new(normalizer),
            fit_config: Arc::new(RwLock::new(fit_config)),
        }
    }

    pub fn normalizer(&self) -> &PhotoNormalizer {
        &self.normalizer
    }

    /// 获取默认拟合策略快照。
    pub fn fit_config(&self) -> Result<FitConfig, NormalizeError> {
        self.fit_config
            .read()
            .map(|cfg| cfg.clone())
            .map_err(|_| NormalizeError::Internal("拟合配置读取锁已中毒".to_string()))
    }

    /// 替换默认拟合策略（先校验，后生效）。
    pub fn set_fit_config(&self, config: FitConfig) -> Result<(), NormalizeError> {
        config.validate()?;

        let mut current = self
            .fit_config
            .write()
            .map_err(|_| NormalizeError::Internal("拟合配置写入锁已中毒".to_string()))?;

        log::info!(
            "⚙️ 已更新拟合策略：max_bytes={} quality={:.2}→{:.2} box={}x{} downscale_step={:.2}",
            config.max_bytes,
            config.start_quality,
            config.min_quality,
            config.max_width,
            config.max_height,
            config.downscale_step
        );
        *current = config;

        Ok(())
    }

    /// 归一化单张照片；`config` 为空时使用默认拟合策略快照。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use photo_normalizer::normalizer::{NormalizerService, SourceImage};
    ///
    /// # async fn demo() -> Result<(), photo_normalizer::normalizer::NormalizeError> {
    /// let service = NormalizerService::new()?;
    /// let source = SourceImage::from_file("IMG_0001.HEIC", 50 * 1024 * 1024)?;
    /// let photo = service.normalize(&source, None).await?;
    /// println!("{}", photo.status.as_str());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn normalize(
        &self,
        source: &SourceImage,
        config: Option<FitConfig>,
    ) -> Result<NormalizedPhoto, NormalizeError> {
        let config = match config {
            Some(config) => config,
            None => self.fit_config()?,
        };
        self.normalizer.normalize(source, Some(&config)).await
    }

    /// 批量归一化：每张照片一个独立任务，互不等待；结果与输入一一对应。
    pub async fn normalize_batch(
        &self,
        sources: Vec<SourceImage>,
    ) -> Vec<Result<NormalizedPhoto, NormalizeError>> {
        let config = match self.fit_config() {
            Ok(config) => config,
            Err(err) => return sources.iter().map(|_| Err(err.clone())).collect(),
        };

        log::info!("📦 开始批量归一化 - {} 张", sources.len());

        let handles: Vec<_> = sources
            .into_iter()
            .map(|source| {
                let normalizer = Arc::clone(&self.normalizer);
                let config = config.clone();
                tokio::spawn(async move { normalizer.normalize(&source, Some(&config)).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let result = handle
                .await
                .unwrap_or_else(|e| Err(NormalizeError::Internal(format!("归一化任务异常退出：{}", e))));
            results.push(result);
        }

        results
    }

    /// 为展示准备已保存的 Data URL。
    pub async fn prepare_for_display(&self, data_url: &str) -> Result<DisplayImage, NormalizeError> {
        self.normalizer.prepare_for_display(data_url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::{FitStatus, HeicAdapter, JpegTranscoder, Transcode};
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;
    use std::thread;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| Rgb([(x % 255) as u8, (y % 255) as u8, 40]));
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut cursor, ImageFormat::Png)
            .expect("failed to encode test image");
        cursor.into_inner()
    }

    fn offline_service() -> NormalizerService {
        let config = NormalizerConfig::default();
        let transcoder: Arc<dyn Transcode> = Arc::new(JpegTranscoder::new(&config));
        let normalizer = PhotoNormalizer::with_parts(config, transcoder, HeicAdapter::new(Vec::new(), 0.9));
        NormalizerService::from_normalizer(normalizer, FitConfig::default())
    }

    #[test]
    fn set_fit_config_validates_before_storing() {
        let service = offline_service();

        let mut bad = FitConfig::default();
        bad.min_quality = 0.95;
        assert!(matches!(service.set_fit_config(bad), Err(NormalizeError::InvalidConfig(_))));
        assert_eq!(service.fit_config().expect("snapshot"), FitConfig::default());

        let mut good = FitConfig::default();
        good.max_bytes = 200 * 1024;
        service.set_fit_config(good.clone()).expect("valid config should be stored");
        assert_eq!(service.fit_config().expect("snapshot"), good);
    }

    #[test]
    fn concurrent_config_updates_remain_consistent() {
        let service = offline_service();
        let mut handles = Vec::new();

        for i in 0..8u64 {
            let service = service.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let mut config = FitConfig::default();
                    config.max_bytes = 100_000 + i;
                    service.set_fit_config(config).expect("set should succeed");
                    let snapshot = service.fit_config().expect("get should succeed");
                    assert!((100_000..100_008).contains(&snapshot.max_bytes));
                }
            }));
        }

        for handle in handles {
            handle.join().expect("thread should not panic");
        }
    }

    #[tokio::test]
    async fn batch_results_follow_submission_order() {
        let service = offline_service();
        let sources = vec![
            SourceImage::new(png(40, 30), "image/png", "a.png"),
            SourceImage::new(b"\x00\x00\x00\x18ftypheic".to_vec(), "image/heic", "b.heic"),
            SourceImage::new(png(20, 50), "image/png", "c.png"),
        ];

        let results = service.normalize_batch(sources).await;
        let photos: Vec<NormalizedPhoto> = results
            .into_iter()
            .map(|r| r.expect("batch item should not error"))
            .collect();

        assert_eq!(photos[0].status, FitStatus::FittedUnderBudget);
        assert_eq!(photos[0].image.as_ref().map(|v| (v.width, v.height)), Some((40, 30)));
        assert_eq!(photos[1].status, FitStatus::ConversionUnavailable);
        assert_eq!(photos[2].image.as_ref().map(|v| (v.width, v.height)), Some((20, 50)));
    }

    #[tokio::test]
    async fn explicit_config_overrides_default() {
        let service = offline_service();
        let source = SourceImage::new(png(300, 300), "image/png", "square.png");
        let override_config = FitConfig {
            initial_max_width: 150,
            initial_max_height: 150,
            ..FitConfig::default()
        };

        let photo = service
            .normalize(&source, Some(override_config))
            .await
            .expect("normalize");

        let image = photo.image.expect("image");
        assert_eq!((image.width, image.height), (150, 150));
    }
}
