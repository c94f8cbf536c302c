//! # 核心编排模块
//!
//! ## 设计思路
//!
//! `PhotoNormalizer` 只负责流程编排，不关心转换能力从哪里来、像素如何缩放。
//! 单张照片的处理链路固定为：
//! 1. 校验拟合配置（调用方覆盖或默认值）
//! 2. 格式识别（声明类型 + 文件签名）
//! 3. HEIC/HEIF 先经转换适配器得到标准字节
//! 4. 首次转码 → 字节预算拟合 → 硬上限兜底 → 缩略图
//!
//! ## 实现思路
//!
//! - 预期内的失败（转换器不可用、转换被拒、图片不可读）降级为 `FitStatus` 返回，
//!   `Err` 只用于配置错误与内部故障。
//! - 栅格阶段是纯 CPU 工作，整体放入 `spawn_blocking`，不阻塞异步运行时。
//! - 记录 `convert/transcode/fit/thumbnail/total` 阶段耗时，便于性能诊断。

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::classify::{SourceKind, classify_bytes, classify_source, classify_uri};
use super::config::MIN_DIMENSION;
use super::converter::HeicAdapter;
use super::loader::parse_data_url_with_limit;
use super::providers::create_sources;
use super::source::{EncodedVariant, FitStatus, NormalizedPhoto, SourceImage, payload_identity};
use super::thumbnail::{ThumbnailSpec, derive_thumbnail};
use super::transcode::{JpegTranscoder, Transcode};
use super::{FitConfig, NormalizeError, NormalizerConfig, fit};

/// 硬上限兜底时依次尝试的 (宽, 高, 质量)。
const AGGRESSIVE_PASSES: [(u32, u32, f32); 2] = [(800, 600, 0.56), (640, 480, 0.48)];

/// 展示用图片。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayImage {
    pub mime: String,
    pub bytes: Vec<u8>,
    /// 是否经过 HEIC 转换。
    pub converted: bool,
}

#[derive(Debug, Default)]
struct RasterTimings {
    transcode: Duration,
    fit: Duration,
    thumbnail: Duration,
    attempts: u32,
}

/// 照片归一化门面。
///
/// 持有转码器与转换适配器（含能力解析状态与结果缓存），可在多个任务间共享。
pub struct PhotoNormalizer {
    config: NormalizerConfig,
    transcoder: Arc<dyn Transcode>,
    adapter: HeicAdapter,
}

impl PhotoNormalizer {
    /// 根据配置创建门面：按配置顺序构建转换能力来源，使用 JPEG 转码器。
    ///
    /// # 示例
    /// ```rust,ignore
    /// use photo_normalizer::normalizer::{NormalizerConfig, PhotoNormalizer};
    ///
    /// let normalizer = PhotoNormalizer::new(NormalizerConfig::default())?;
    /// # Ok::<(), photo_normalizer::normalizer::NormalizeError>(())
    /// ```
    pub fn new(config: NormalizerConfig) -> Result<Self, NormalizeError> {
        let sources = create_sources(&config.converter)?;
        let adapter = HeicAdapter::new(sources, config.converter.conversion_quality);
        let transcoder: Arc<dyn Transcode> = Arc::new(JpegTranscoder::new(&config));

        Ok(Self::with_parts(config, transcoder, adapter))
    }

    /// 使用外部注入的转码器与转换适配器创建门面。
    pub fn with_parts(config: NormalizerConfig, transcoder: Arc<dyn Transcode>, adapter: HeicAdapter) -> Self {
        Self {
            config,
            transcoder,
            adapter,
        }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    pub fn adapter(&self) -> &HeicAdapter {
        &self.adapter
    }

    /// 处理主入口：将一张照片归一化为预算内的 JPEG 与缩略图。
    ///
    /// # 示例
    /// ```rust,ignore
    /// # async fn demo(normalizer: &photo_normalizer::normalizer::PhotoNormalizer)
    /// #     -> Result<(), photo_normalizer::normalizer::NormalizeError> {
    /// use photo_normalizer::normalizer::SourceImage;
    ///
    /// let source = SourceImage::from_file("IMG_0001.HEIC", 50 * 1024 * 1024)?;
    /// let photo = normalizer.normalize(&source, None).await?;
    /// println!("{}", photo.status.as_str());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn normalize(
        &self,
        source: &SourceImage,
        config: Option<&FitConfig>,
    ) -> Result<NormalizedPhoto, NormalizeError> {
        let fit_config = config.cloned().unwrap_or_default();
        fit_config.validate()?;

        let total_start = Instant::now();
        let file_name = source.file_name().to_string();

        if source.bytes().is_empty() {
            log::warn!("❌ 照片内容为空 - {}", file_name);
            return Ok(NormalizedPhoto::failed(FitStatus::ConversionFailed, "照片内容为空"));
        }

        let kind = classify_source(source);
        if kind == SourceKind::Unknown {
            log::info!(
                "❔ 无法确定格式（ClassificationAmbiguous），按标准格式处理 - 文件: {} 声明: {}",
                file_name,
                source.declared_type()
            );
        }

        let convert_start = Instant::now();
        let payload: Arc<Vec<u8>> = if kind == SourceKind::ExoticContainer {
            match self.adapter.convert(&source.identity(), source.bytes()).await {
                Ok(jpeg) => jpeg,
                Err(NormalizeError::ConversionUnavailable(msg)) => {
                    log::warn!("⚠️ HEIC 转换能力不可用 - {}：{}", file_name, msg);
                    return Ok(NormalizedPhoto::failed(
                        FitStatus::ConversionUnavailable,
                        "暂时无法转换 HEIC/HEIF 照片，请稍后重试或导出为 JPEG 后上传",
                    ));
                }
                Err(err) => {
                    log::warn!("❌ HEIC 转换失败 - {}：{}", file_name, err);
                    return Ok(NormalizedPhoto::failed(
                        FitStatus::ConversionFailed,
                        "无法转换该 HEIC/HEIF 照片，请导出为 JPEG 后重新上传",
                    ));
                }
            }
        } else {
            Arc::new(source.bytes().to_vec())
        };
        let convert_elapsed = convert_start.elapsed();

        let transcoder = Arc::clone(&self.transcoder);
        let (photo, timings) = tokio::task::spawn_blocking(move || {
            run_raster_stages(transcoder.as_ref(), &payload, &fit_config, ThumbnailSpec::default())
        })
        .await
        .map_err(|e| NormalizeError::Internal(format!("栅格处理任务异常退出：{}", e)))?;

        let total_elapsed = total_start.elapsed();
        log::info!(
            "✅ 照片归一化完成 - file={} status={} size={} attempts={} convert={}ms transcode={}ms fit={}ms thumbnail={}ms total={}ms",
            file_name,
            photo.status.as_str(),
            photo.image.as_ref().map(EncodedVariant::byte_len).unwrap_or(0),
            timings.attempts,
            convert_elapsed.as_millis(),
            timings.transcode.as_millis(),
            timings.fit.as_millis(),
            timings.thumbnail.as_millis(),
            total_elapsed.as_millis()
        );

        Ok(photo)
    }

    /// 为展示准备已保存的 Data URL：HEIC/HEIF 转为 JPEG，其它格式原样返回。
    ///
    /// 转换失败时记录告警并回退为原始内容，展示层自行决定占位策略。
    pub async fn prepare_for_display(&self, data_url: &str) -> Result<DisplayImage, NormalizeError> {
        let (mime, bytes) = parse_data_url_with_limit(data_url, self.config.max_file_size)?;
        let mime = mime.unwrap_or_else(|| "application/octet-stream".to_string());

        let exotic = classify_uri(data_url) == SourceKind::ExoticContainer
            || classify_bytes(&bytes) == SourceKind::ExoticContainer;

        if !exotic {
            return Ok(DisplayImage {
                mime,
                bytes,
                converted: false,
            });
        }

        match self.adapter.convert(&payload_identity(&bytes), &bytes).await {
            Ok(jpeg) => Ok(DisplayImage {
                mime: super::source::OUTPUT_MIME.to_string(),
                bytes: jpeg.as_ref().clone(),
                converted: true,
            }),
            Err(err) => {
                log::warn!("⚠️ 展示用 HEIC 转换失败，回退原始内容：{}", err);
                Ok(DisplayImage {
                    mime,
                    bytes,
                    converted: false,
                })
            }
        }
    }
}

/// 栅格阶段：首次转码 → 拟合 → 硬上限兜底 → 缩略图。
fn run_raster_stages(
    transcoder: &dyn Transcode,
    bytes: &[u8],
    config: &FitConfig,
    thumbnail_spec: ThumbnailSpec,
) -> (NormalizedPhoto, RasterTimings) {
    let mut timings = RasterTimings::default();

    let transcode_start = Instant::now();
    let initial = transcoder.transcode(
        bytes,
        config.initial_max_width,
        config.initial_max_height,
        config.start_quality,
    );
    timings.transcode = transcode_start.elapsed();

    let initial = match initial {
        Ok(variant) if !variant.is_empty() => variant,
        Ok(_) => {
            return (
                NormalizedPhoto::failed(FitStatus::ConversionFailed, "照片转码结果为空"),
                timings,
            );
        }
        Err(err) => {
            log::warn!("❌ 照片首次转码失败 [{}]：{}", err.code(), err);
            return (
                NormalizedPhoto::failed(FitStatus::ConversionFailed, format!("照片无法读取：{}", err)),
                timings,
            );
        }
    };

    let fit_start = Instant::now();
    let fitted = fit(transcoder, initial, config);
    timings.attempts = fitted.attempts;

    let (mut status, mut variant) = match (fitted.status, fitted.variant) {
        (FitStatus::FittedUnderBudget | FitStatus::FittedAtFloor, Some(variant)) => (fitted.status, variant),
        _ => {
            timings.fit = fit_start.elapsed();
            return (
                NormalizedPhoto::failed(FitStatus::ConversionFailed, "压缩过程中照片无法读取"),
                timings,
            );
        }
    };

    if variant.byte_len() > config.hard_max_bytes {
        match enforce_hard_ceiling(transcoder, variant, config) {
            Some(capped) => {
                status = if capped.byte_len() <= config.max_bytes {
                    FitStatus::FittedUnderBudget
                } else {
                    FitStatus::FittedAtFloor
                };
                variant = capped;
            }
            None => {
                timings.fit = fit_start.elapsed();
                return (
                    NormalizedPhoto::failed(
                        FitStatus::ConversionFailed,
                        format!("照片无法压缩到 {} KB 以内", config.hard_max_bytes / 1024),
                    ),
                    timings,
                );
            }
        }
    }
    timings.fit = fit_start.elapsed();

    let thumbnail_start = Instant::now();
    let thumbnail = derive_thumbnail(transcoder, &variant, thumbnail_spec);
    timings.thumbnail = thumbnail_start.elapsed();

    let note = (status == FitStatus::FittedAtFloor).then(|| {
        format!(
            "照片已压缩到 {} KB，仍高于目标 {} KB",
            variant.byte_len() / 1024,
            config.max_bytes / 1024
        )
    });

    (
        NormalizedPhoto {
            status,
            image: Some(variant),
            thumbnail: Some(thumbnail),
            note,
        },
        timings,
    )
}

/// 硬上限兜底：先走两档激进压缩，再以最低质量逐次减半尺寸，直到单边下限。
///
/// 返回 `None` 表示无法压到硬上限以内。
fn enforce_hard_ceiling(
    transcoder: &dyn Transcode,
    variant: EncodedVariant,
    config: &FitConfig,
) -> Option<EncodedVariant> {
    log::warn!(
        "⚠️ 拟合结果超过硬上限，进入兜底压缩 - size={} hard={}",
        variant.byte_len(),
        config.hard_max_bytes
    );

    let mut best = variant;
    let try_pass = |best: &mut EncodedVariant, width: u32, height: u32, quality: f32| -> bool {
        match transcoder.transcode(&best.bytes, width, height, quality) {
            Ok(candidate) if !candidate.is_empty() => {
                if candidate.byte_len() < best.byte_len() {
                    *best = candidate;
                }
            }
            Ok(_) => log::warn!("⚠️ 兜底压缩结果为空 - {}x{}", width, height),
            Err(err) => log::warn!("⚠️ 兜底压缩失败 - {}x{} q={:.2}：{}", width, height, quality, err),
        }
        best.byte_len() <= config.hard_max_bytes
    };

    for (width, height, quality) in AGGRESSIVE_PASSES {
        if try_pass(&mut best, width, height, quality) {
            return Some(best);
        }
    }

    let mut width = best.width;
    let mut height = best.height;
    while width > MIN_DIMENSION || height > MIN_DIMENSION {
        width = (width / 2).max(MIN_DIMENSION);
        height = (height / 2).max(MIN_DIMENSION);

        if try_pass(&mut best, width, height, config.min_quality) {
            return Some(best);
        }
    }

    log::warn!("❌ 兜底压缩失败，结果仍超过硬上限 - size={}", best.byte_len());
    None
}
