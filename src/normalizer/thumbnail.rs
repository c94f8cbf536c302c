//! 缩略图派生：始终基于已拟合的结果（而非原图）转码，失败时退回拟合结果本身。

use super::source::EncodedVariant;
use super::transcode::Transcode;

pub const THUMBNAIL_MAX_WIDTH: u32 = 420;
pub const THUMBNAIL_MAX_HEIGHT: u32 = 320;
pub const THUMBNAIL_QUALITY: f32 = 0.65;

/// 缩略图参数。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThumbnailSpec {
    pub max_width: u32,
    pub max_height: u32,
    pub quality: f32,
}

impl Default for ThumbnailSpec {
    fn default() -> Self {
        Self {
            max_width: THUMBNAIL_MAX_WIDTH,
            max_height: THUMBNAIL_MAX_HEIGHT,
            quality: THUMBNAIL_QUALITY,
        }
    }
}

/// 派生缩略图；缩略图可以“不更小”，但不能缺失。
pub fn derive_thumbnail<T: Transcode + ?Sized>(
    transcoder: &T,
    fitted: &EncodedVariant,
    params: ThumbnailSpec,
) -> EncodedVariant {
    match transcoder.transcode(&fitted.bytes, params.max_width, params.max_height, params.quality) {
        Ok(thumbnail) if !thumbnail.is_empty() => thumbnail,
        Ok(_) => {
            log::warn!("⚠️ 缩略图结果为空，使用拟合结果代替");
            fitted.clone()
        }
        Err(err) => {
            log::warn!("⚠️ 缩略图生成失败，使用拟合结果代替：{}", err);
            fitted.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::transcode::JpegTranscoder;
    use crate::normalizer::{NormalizeError, NormalizerConfig};
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;

    struct FailingTranscoder;

    impl Transcode for FailingTranscoder {
        fn transcode(&self, _: &[u8], _: u32, _: u32, _: f32) -> Result<EncodedVariant, NormalizeError> {
            Err(NormalizeError::Encode("encoder unavailable".into()))
        }
    }

    fn jpeg_variant(width: u32, height: u32) -> EncodedVariant {
        let img = ImageBuffer::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut cursor, ImageFormat::Jpeg)
            .expect("failed to encode test image");

        EncodedVariant {
            bytes: cursor.into_inner(),
            width,
            height,
        }
    }

    #[test]
    fn thumbnail_fits_default_box() {
        let fitted = jpeg_variant(1200, 900);
        let transcoder = JpegTranscoder::new(&NormalizerConfig::default());

        let thumb = derive_thumbnail(&transcoder, &fitted, ThumbnailSpec::default());

        assert_eq!((thumb.width, thumb.height), (420, 315));
        assert!(thumb.byte_len() < fitted.byte_len());
    }

    #[test]
    fn thumbnail_failure_falls_back_to_fitted() {
        let fitted = jpeg_variant(64, 48);
        let thumb = derive_thumbnail(&FailingTranscoder, &fitted, ThumbnailSpec::default());

        assert_eq!(thumb, fitted);
    }
}
