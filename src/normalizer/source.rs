//! # 数据源与中间模型
//!
//! ## 设计思路
//!
//! 将“外部输入”和“流水线中间结果”解耦：
//! - `SourceImage` 表示调用方上传的原始文件（只读）
//! - `RasterSurface` 表示单次转码内部的解码像素（不跨调用保留）
//! - `EncodedVariant` 表示 JPEG 编码结果
//! - `FitResult` / `NormalizedPhoto` 表示对外返回的结果与状态

use image::RgbImage;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// 输出编码固定为 JPEG（拟合阶梯依赖连续的质量参数）。
pub const OUTPUT_MIME: &str = "image/jpeg";

/// 调用方提供的原始图片。
#[derive(Debug, Clone)]
pub struct SourceImage {
    bytes: Vec<u8>,
    declared_type: String,
    file_name: String,
}

impl SourceImage {
    pub fn new(bytes: Vec<u8>, declared_type: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            bytes,
            declared_type: declared_type.into(),
            file_name: file_name.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn declared_type(&self) -> &str {
        &self.declared_type
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// 来源标识：原始字节的 SHA-256（十六进制）。
    ///
    /// 同一张照片无论以文件还是 Data URL 形式到达，都会得到同一个标识。
    pub fn identity(&self) -> String {
        payload_identity(&self.bytes)
    }
}

pub(crate) fn payload_identity(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// 单次转码内的解码像素。
pub(crate) struct RasterSurface {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) pixels: RgbImage,
}

/// JPEG 编码结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedVariant {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl EncodedVariant {
    /// 实际编码字节数（非估算）。
    pub fn byte_len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn mime(&self) -> &'static str {
        OUTPUT_MIME
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// 拟合结果状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    /// 已压到软预算以内。
    FittedUnderBudget,
    /// 阶梯耗尽仍超出软预算，返回最小的结果。
    FittedAtFloor,
    /// 没有可用的 HEIC 转换能力。
    ConversionUnavailable,
    /// 输入无法读取或转换器拒绝了该输入。
    ConversionFailed,
}

impl FitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FittedUnderBudget => "fitted_under_budget",
            Self::FittedAtFloor => "fitted_at_floor",
            Self::ConversionUnavailable => "conversion_unavailable",
            Self::ConversionFailed => "conversion_failed",
        }
    }
}

/// 字节预算拟合器的输出。
#[derive(Debug, Clone)]
pub struct FitResult {
    pub status: FitStatus,
    /// 仅在 `ConversionFailed` 时为空。
    pub variant: Option<EncodedVariant>,
    /// 实际发生的转码次数。
    pub attempts: u32,
}

/// 门面对外返回的完整结果。
#[derive(Debug, Clone)]
pub struct NormalizedPhoto {
    pub status: FitStatus,
    pub image: Option<EncodedVariant>,
    pub thumbnail: Option<EncodedVariant>,
    /// 非理想状态下给调用方展示的说明。
    pub note: Option<String>,
}

impl NormalizedPhoto {
    pub(crate) fn failed(status: FitStatus, note: impl Into<String>) -> Self {
        Self {
            status,
            image: None,
            thumbnail: None,
            note: Some(note.into()),
        }
    }

    /// 生成不含字节的摘要，用于日志与命令行输出。
    pub fn report(&self, file_name: &str) -> NormalizeReport {
        NormalizeReport {
            file_name: file_name.to_string(),
            status: self.status,
            byte_length: self.image.as_ref().map(EncodedVariant::byte_len),
            width: self.image.as_ref().map(|v| v.width),
            height: self.image.as_ref().map(|v| v.height),
            thumbnail_byte_length: self.thumbnail.as_ref().map(EncodedVariant::byte_len),
            note: self.note.clone(),
        }
    }
}

/// 可序列化的结果摘要。
#[derive(Debug, Clone, Serialize)]
pub struct NormalizeReport {
    pub file_name: String,
    pub status: FitStatus,
    pub byte_length: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub thumbnail_byte_length: Option<u64>,
    pub note: Option<String>,
}
