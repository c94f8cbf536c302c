//! # 配置模块
//!
//! ## 设计思路
//!
//! 将所有“可调策略”集中到两类配置中：
//! - `FitConfig`：单次调用的拟合策略（质量阶梯、尺寸阶梯、字节预算），调用方可逐次覆盖。
//! - `NormalizerConfig`：进程级参数（输入体积上限、解码像素上限、缩放滤镜、转换器来源）。
//!
//! ## 实现思路
//!
//! - `Default` 提供生产可用的默认值（350 KiB 软预算、约 1 MiB 硬上限）。
//! - `FitConfig::validate` 在进入流水线前拒绝不合理参数，保证两条阶梯都有上界。
//! - 配置可从 JSON 反序列化，缺省字段回落到默认值。

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use super::NormalizeError;

/// 单边尺寸下限，避免降采样退化成不可用的小图。
pub const MIN_DIMENSION: u32 = 100;

/// 存储层硬上限（1 MiB 减去安全余量）。
pub const DEFAULT_HARD_MAX_BYTES: u64 = 1_048_000;

/// 质量阶梯的最小步长，(0, 1] 区间内最多约 100 级。
pub const MIN_QUALITY_STEP: f32 = 0.01;

/// 尺寸阶梯的最大轮数。
pub const MAX_DOWNSCALE_ITERATIONS: u32 = 64;

/// 拟合策略。
///
/// 对应一次 `normalize` / `fit` 调用，不可变、按值传递。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// 软预算（字节）。
    pub max_bytes: u64,
    pub start_quality: f32,
    pub min_quality: f32,
    pub quality_step: f32,
    /// 质量阶梯阶段固定使用的最大宽高。
    pub max_width: u32,
    pub max_height: u32,
    /// 尺寸阶梯每轮的缩放系数。
    pub downscale_step: f32,
    pub max_downscale_iterations: u32,
    /// 首次转码使用的最大宽高（比拟合尺寸更宽松）。
    pub initial_max_width: u32,
    pub initial_max_height: u32,
    /// 存储层硬上限，任何情况下都不允许超过。
    pub hard_max_bytes: u64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_bytes: 350 * 1024,
            start_quality: 0.80,
            min_quality: 0.32,
            quality_step: 0.05,
            max_width: 1200,
            max_height: 900,
            downscale_step: 0.86,
            max_downscale_iterations: 12,
            initial_max_width: 1280,
            initial_max_height: 960,
            hard_max_bytes: DEFAULT_HARD_MAX_BYTES,
        }
    }
}

impl FitConfig {
    /// 校验参数组合，保证两条阶梯都会终止。
    pub fn validate(&self) -> Result<(), NormalizeError> {
        let quality_ok = |q: f32| q.is_finite() && q > 0.0 && q <= 1.0;

        if self.max_bytes == 0 {
            return Err(NormalizeError::InvalidConfig("max_bytes 必须大于 0".to_string()));
        }
        if self.max_bytes > self.hard_max_bytes {
            return Err(NormalizeError::InvalidConfig(format!(
                "max_bytes（{}）不能大于 hard_max_bytes（{}）",
                self.max_bytes, self.hard_max_bytes
            )));
        }
        if !quality_ok(self.start_quality) || !quality_ok(self.min_quality) {
            return Err(NormalizeError::InvalidConfig(
                "start_quality / min_quality 必须在 (0, 1] 之间".to_string(),
            ));
        }
        if self.min_quality > self.start_quality {
            return Err(NormalizeError::InvalidConfig(
                "min_quality 不能大于 start_quality".to_string(),
            ));
        }
        if !self.quality_step.is_finite() || self.quality_step < MIN_QUALITY_STEP {
            return Err(NormalizeError::InvalidConfig(format!(
                "quality_step 不能小于 {}",
                MIN_QUALITY_STEP
            )));
        }
        if self.max_downscale_iterations > MAX_DOWNSCALE_ITERATIONS {
            return Err(NormalizeError::InvalidConfig(format!(
                "max_downscale_iterations 不能大于 {}",
                MAX_DOWNSCALE_ITERATIONS
            )));
        }
        if !self.downscale_step.is_finite() || self.downscale_step <= 0.0 || self.downscale_step >= 1.0 {
            return Err(NormalizeError::InvalidConfig(
                "downscale_step 必须在 (0, 1) 之间".to_string(),
            ));
        }
        if self.max_width == 0
            || self.max_height == 0
            || self.initial_max_width == 0
            || self.initial_max_height == 0
        {
            return Err(NormalizeError::InvalidConfig("尺寸上限必须大于 0".to_string()));
        }

        Ok(())
    }

    /// 质量阶梯：从 `start_quality` 开始按步长递减，直到低于 `min_quality`。
    ///
    /// 使用整数步数计算，避免浮点累减带来的漂移。步长非法时只保留起始质量，
    /// 过小的步长按 [`MIN_QUALITY_STEP`] 计算，级数始终有上界。
    pub(crate) fn quality_ladder(&self) -> Vec<f32> {
        if !self.quality_step.is_finite() || self.quality_step <= 0.0 {
            return vec![self.start_quality];
        }

        let step = self.quality_step.max(MIN_QUALITY_STEP);
        let span = self.start_quality - self.min_quality;
        let steps = (span / step + 1e-4).floor().max(0.0) as u32;

        (0..=steps)
            .map(|i| self.start_quality - i as f32 * step)
            .collect()
    }

    /// 尺寸阶梯第 `iteration` 轮（从 0 开始）使用的质量：与尺寸同步衰减。
    pub(crate) fn downscale_quality(&self, iteration: u32) -> f32 {
        let decayed = self.start_quality * self.downscale_step.powi(iteration as i32);
        decayed.max(self.min_quality)
    }
}

/// 转换能力来源配置。
///
/// 列表顺序即尝试顺序，前一个失败才会尝试下一个。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConverterSourceConfig {
    /// HTTP 转换服务。
    Http { endpoint: String },
    /// 本地 `heif-convert` 风格的可执行文件（名称或路径）。
    Command { program: String },
}

/// HEIC 转换器配置。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    pub sources: Vec<ConverterSourceConfig>,
    /// 交给外部转换器的 JPEG 质量。
    pub conversion_quality: f32,
    /// 建立连接超时（秒）。
    pub connect_timeout: u64,
    /// 单次请求总超时（秒）。
    pub request_timeout: u64,
    /// 本地命令执行超时（秒）。
    pub command_timeout: u64,
    /// 转换结果允许的最大体积（字节）。
    pub max_response_bytes: u64,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            sources: vec![ConverterSourceConfig::Command {
                program: "heif-convert".to_string(),
            }],
            conversion_quality: 0.9,
            connect_timeout: 8,
            request_timeout: 30,
            command_timeout: 60,
            max_response_bytes: 50 * 1024 * 1024,
        }
    }
}

/// 进程级配置。
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// 读取原始字节时允许的最大文件体积（字节）。
    pub max_file_size: u64,
    /// 解码后的像素上限（`width * height`）。
    pub max_decoded_pixels: u64,
    /// 解码阶段允许的预计内存上限（按 RGB 估算，字节）。
    pub max_decoded_bytes: u64,
    /// 降采样滤镜策略。
    pub resize_filter: FilterType,
    pub converter: ConverterConfig,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024,
            max_decoded_pixels: 40_000_000,
            max_decoded_bytes: 160 * 1024 * 1024,
            resize_filter: FilterType::Triangle,
            converter: ConverterConfig::default(),
        }
    }
}
