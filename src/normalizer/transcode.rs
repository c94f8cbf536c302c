//! # 栅格转码模块
//!
//! ## 设计思路
//!
//! 将“字节 → 像素 → 缩放 → JPEG”的过程集中管理，并在关键节点增加资源上限控制。
//! 优先做尺寸检查，再进行完整解码，降低恶意输入触发高内存开销的风险。
//!
//! ## 实现思路
//!
//! 1. 猜测格式并读取 header 尺寸
//! 2. 按像素/内存上限快速拒绝
//! 3. 完整解码为 `RasterSurface`
//! 4. 按统一比例缩放（只缩不放，单边至少 1 像素）
//! 5. 按质量参数编码 JPEG，字节数取自实际编码结果

use fast_image_resize as fr;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, GenericImageView, ImageBuffer, Rgb};
use std::io::Cursor;

use super::source::{EncodedVariant, RasterSurface};
use super::{NormalizeError, NormalizerConfig};

/// 栅格转码能力。
///
/// 拟合器与缩略图只依赖该 trait，测试中可替换为计数/故障注入实现。
pub trait Transcode: Send + Sync {
    fn transcode(
        &self,
        bytes: &[u8],
        max_width: u32,
        max_height: u32,
        quality: f32,
    ) -> Result<EncodedVariant, NormalizeError>;
}

/// 基于 `image` + `fast_image_resize` 的 JPEG 转码器。
#[derive(Debug, Clone)]
pub struct JpegTranscoder {
    max_decoded_pixels: u64,
    max_decoded_bytes: u64,
    resize_filter: FilterType,
}

impl JpegTranscoder {
    pub fn new(config: &NormalizerConfig) -> Self {
        Self {
            max_decoded_pixels: config.max_decoded_pixels,
            max_decoded_bytes: config.max_decoded_bytes,
            resize_filter: config.resize_filter,
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<RasterSurface, NormalizeError> {
        if bytes.is_empty() {
            return Err(NormalizeError::Decode("图片内容为空".to_string()));
        }

        let (header_width, header_height) = inspect_dimensions_from_memory(bytes)?;
        self.validate_limits(header_width, header_height)?;

        let decoded = image::load_from_memory(bytes)
            .map_err(|e| NormalizeError::Decode(format!("图片解码失败：{}", e)))?;

        let (width, height) = decoded.dimensions();
        self.validate_limits(width, height)?;

        Ok(RasterSurface {
            width,
            height,
            pixels: decoded.to_rgb8(),
        })
    }

    /// 校验像素数量与预计内存是否超过配置上限。
    fn validate_limits(&self, width: u32, height: u32) -> Result<(), NormalizeError> {
        let pixels = (width as u64)
            .checked_mul(height as u64)
            .ok_or_else(|| NormalizeError::ResourceLimit("图片像素数溢出".to_string()))?;

        if pixels > self.max_decoded_pixels {
            return Err(NormalizeError::ResourceLimit(format!(
                "图片像素过大：{} 像素（限制：{} 像素）",
                pixels, self.max_decoded_pixels
            )));
        }

        let estimated = pixels
            .checked_mul(4)
            .ok_or_else(|| NormalizeError::ResourceLimit("图片解码内存估算溢出".to_string()))?;

        if estimated > self.max_decoded_bytes {
            return Err(NormalizeError::ResourceLimit(format!(
                "图片解码预计内存过大：{:.2} MB（限制：{:.2} MB）",
                estimated as f64 / 1024.0 / 1024.0,
                self.max_decoded_bytes as f64 / 1024.0 / 1024.0
            )));
        }

        Ok(())
    }

    fn resample(&self, surface: RasterSurface, target_width: u32, target_height: u32) -> RasterSurface {
        if surface.width == target_width && surface.height == target_height {
            return surface;
        }

        match resize_with_fast_image_resize(&surface, target_width, target_height, self.resize_filter) {
            Ok(resized) => resized,
            Err(err) => {
                log::warn!(
                    "⚠️ fast_image_resize 降采样失败，回退 image::resize：{}",
                    err
                );
                let pixels = image::imageops::resize(
                    &surface.pixels,
                    target_width,
                    target_height,
                    self.resize_filter,
                );
                RasterSurface {
                    width: target_width,
                    height: target_height,
                    pixels,
                }
            }
        }
    }
}

impl Transcode for JpegTranscoder {
    fn transcode(
        &self,
        bytes: &[u8],
        max_width: u32,
        max_height: u32,
        quality: f32,
    ) -> Result<EncodedVariant, NormalizeError> {
        let surface = self.decode(bytes)?;
        let (target_width, target_height) =
            target_dimensions(surface.width, surface.height, max_width, max_height);

        let resized = self.resample(surface, target_width, target_height);
        let encoded = encode_jpeg(&resized, quality)?;

        log::debug!(
            "🧩 转码完成 - {}x{} q={:.2} -> {} bytes",
            resized.width,
            resized.height,
            quality,
            encoded.len()
        );

        Ok(EncodedVariant {
            bytes: encoded,
            width: resized.width,
            height: resized.height,
        })
    }
}

/// 计算缩放后的目标尺寸：统一比例、只缩不放、单边至少 1 像素。
pub fn target_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width.max(1), height.max(1));
    }

    let ratio = (max_width as f64 / width as f64)
        .min(max_height as f64 / height as f64)
        .min(1.0);

    let target_width = ((width as f64 * ratio).round() as u32).clamp(1, width);
    let target_height = ((height as f64 * ratio).round() as u32).clamp(1, height);

    (target_width, target_height)
}

/// 将 0–1 的质量参数映射为编码器的 1–100 整数质量（单调不减）。
pub fn encoder_quality(quality: f32) -> u8 {
    let q = if quality.is_finite() { quality } else { 0.0 };
    (q.clamp(0.0, 1.0) * 100.0).round().clamp(1.0, 100.0) as u8
}

fn encode_jpeg(surface: &RasterSurface, quality: f32) -> Result<Vec<u8>, NormalizeError> {
    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, encoder_quality(quality));

    encoder
        .encode(
            surface.pixels.as_raw(),
            surface.width,
            surface.height,
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| NormalizeError::Encode(format!("JPEG 编码失败：{}", e)))?;

    if buffer.is_empty() {
        return Err(NormalizeError::Encode("JPEG 编码结果为空".to_string()));
    }

    Ok(buffer)
}

/// 仅通过内存中的图片头信息读取宽高。
fn inspect_dimensions_from_memory(bytes: &[u8]) -> Result<(u32, u32), NormalizeError> {
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| NormalizeError::Decode(format!("无法识别图片格式：{}", e)))?;

    reader
        .into_dimensions()
        .map_err(|e| NormalizeError::Decode(format!("无法读取图片尺寸：{}", e)))
}

fn resize_with_fast_image_resize(
    surface: &RasterSurface,
    target_width: u32,
    target_height: u32,
    filter: FilterType,
) -> Result<RasterSurface, NormalizeError> {
    let src_image = fr::images::Image::from_vec_u8(
        surface.width,
        surface.height,
        surface.pixels.as_raw().clone(),
        fr::PixelType::U8x3,
    )
    .map_err(|e| NormalizeError::Encode(format!("构建源图像缓冲失败：{}", e)))?;

    let mut dst_image = fr::images::Image::new(target_width, target_height, fr::PixelType::U8x3);

    let mut resizer = fr::Resizer::new();
    let options = fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(to_fast_filter(filter)));

    resizer
        .resize(&src_image, &mut dst_image, Some(&options))
        .map_err(|e| NormalizeError::Encode(format!("fast_image_resize 执行失败：{}", e)))?;

    let pixels = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(target_width, target_height, dst_image.into_vec())
        .ok_or_else(|| NormalizeError::Encode("fast_image_resize 输出缓冲长度异常".to_string()))?;

    Ok(RasterSurface {
        width: target_width,
        height: target_height,
        pixels,
    })
}

fn to_fast_filter(filter: FilterType) -> fr::FilterType {
    match filter {
        FilterType::Nearest => fr::FilterType::Box,
        FilterType::Triangle => fr::FilterType::Bilinear,
        FilterType::CatmullRom => fr::FilterType::CatmullRom,
        FilterType::Gaussian => fr::FilterType::Mitchell,
        FilterType::Lanczos3 => fr::FilterType::Lanczos3,
    }
}
