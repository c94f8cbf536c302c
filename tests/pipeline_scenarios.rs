//! 端到端场景：标准 JPEG、HEIC 转换、转换不可用、小图直通、预算收敛、阶梯终止、single-flight。

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb, RgbImage};

use photo_normalizer::normalizer::{
    CapabilitySource, ConverterOutput, EncodedVariant, FitConfig, FitStatus, HeicAdapter, HeicConverter,
    JpegTranscoder, NormalizeError, NormalizerConfig, PhotoNormalizer, SourceImage, Transcode, fit,
};

const HEIC_HEADER: [u8; 24] = [
    0x00, 0x00, 0x00, 0x18, b'f', b't', b'y', b'p', b'h', b'e', b'i', b'c', 0x00, 0x00, 0x00, 0x00,
    b'm', b'i', b'f', b'1', b'h', b'e', b'i', b'c',
];

// ========== 测试素材 ==========

/// 渐变 + 确定性噪声，体积随质量与尺寸明显变化。
fn textured_image(width: u32, height: u32) -> RgbImage {
    ImageBuffer::from_fn(width, height, |x, y| {
        let hash = x.wrapping_mul(374_761_393) ^ y.wrapping_mul(668_265_263);
        let hash = (hash ^ (hash >> 13)).wrapping_mul(1_274_126_177);
        let noise = (hash >> 24) as u8 / 4;
        Rgb([
            ((x * 255 / width.max(1)) as u8).wrapping_add(noise),
            ((y * 255 / height.max(1)) as u8).wrapping_add(noise),
            (((x + y) % 256) as u8).wrapping_add(noise),
        ])
    })
}

fn jpeg_bytes(img: &RgbImage, quality: u8) -> Vec<u8> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(img)
        .expect("failed to encode test jpeg");
    buffer
}

fn png_bytes(img: RgbImage) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut cursor, ImageFormat::Png)
        .expect("failed to encode test png");
    cursor.into_inner()
}

/// 4000×3000 的高质量 JPEG（数 MB），多个场景共用。
fn large_camera_jpeg() -> &'static [u8] {
    static BYTES: OnceLock<Vec<u8>> = OnceLock::new();
    BYTES.get_or_init(|| jpeg_bytes(&textured_image(4000, 3000), 92))
}

// ========== 测试替身 ==========

struct CountingTranscoder {
    inner: JpegTranscoder,
    calls: AtomicUsize,
}

impl CountingTranscoder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: JpegTranscoder::new(&NormalizerConfig::default()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transcode for CountingTranscoder {
    fn transcode(&self, bytes: &[u8], w: u32, h: u32, q: f32) -> Result<EncodedVariant, NormalizeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.transcode(bytes, w, h, q)
    }
}

struct FixedConverter {
    jpeg: Vec<u8>,
    calls: AtomicUsize,
}

#[async_trait]
impl HeicConverter for FixedConverter {
    async fn convert(&self, _bytes: &[u8], _quality: f32) -> Result<ConverterOutput, NormalizeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ConverterOutput::Single(self.jpeg.clone()))
    }
}

/// 加载耗时 50ms 的能力来源；`converter` 为空时加载失败。
struct SlowSource {
    loads: AtomicUsize,
    converter: Option<Arc<FixedConverter>>,
}

impl SlowSource {
    fn new(converter: Option<Arc<FixedConverter>>) -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            converter,
        })
    }

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilitySource for SlowSource {
    fn name(&self) -> &str {
        "slow"
    }

    async fn load(&self) -> Result<Arc<dyn HeicConverter>, NormalizeError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        match &self.converter {
            Some(converter) => Ok(Arc::clone(converter) as Arc<dyn HeicConverter>),
            None => Err(NormalizeError::Network("converter host unreachable".to_string())),
        }
    }
}

fn fixed_converter(jpeg: Vec<u8>) -> Arc<FixedConverter> {
    Arc::new(FixedConverter {
        jpeg,
        calls: AtomicUsize::new(0),
    })
}

fn normalizer(transcoder: Arc<CountingTranscoder>, sources: Vec<Arc<SlowSource>>) -> PhotoNormalizer {
    let sources = sources
        .into_iter()
        .map(|s| s as Arc<dyn CapabilitySource>)
        .collect();
    PhotoNormalizer::with_parts(NormalizerConfig::default(), transcoder, HeicAdapter::new(sources, 0.9))
}

fn heic_source(tag: u8) -> SourceImage {
    let mut bytes = HEIC_HEADER.to_vec();
    bytes.push(tag);
    SourceImage::new(bytes, "image/heic", format!("IMG_{tag:04}.HEIC"))
}

fn assert_jpeg_path_guarantees(result: Result<photo_normalizer::normalizer::NormalizedPhoto, NormalizeError>) {
    let photo = result.expect("normalize should not error");
    assert_eq!(photo.status, FitStatus::FittedUnderBudget);

    let image = photo.image.expect("fitted image");
    assert!(image.width <= 1280 && image.height <= 960);
    assert!(image.byte_len() <= 358_400);
    assert_eq!(image.mime(), "image/jpeg");

    let thumbnail = photo.thumbnail.expect("thumbnail");
    assert!(thumbnail.width <= 420 && thumbnail.height <= 320);
}

// ========== 场景 ==========

#[tokio::test]
async fn large_camera_jpeg_fits_under_budget() {
    let transcoder = CountingTranscoder::new();
    let normalizer = normalizer(transcoder.clone(), Vec::new());
    let source = SourceImage::new(large_camera_jpeg().to_vec(), "image/jpeg", "DSC_0001.JPG");

    assert_jpeg_path_guarantees(normalizer.normalize(&source, None).await);
    assert!(transcoder.calls() >= 2);
}

#[tokio::test]
async fn converted_heic_meets_jpeg_path_guarantees() {
    let converter = fixed_converter(large_camera_jpeg().to_vec());
    let source = SlowSource::new(Some(converter.clone()));
    let normalizer = normalizer(CountingTranscoder::new(), vec![source.clone()]);

    assert_jpeg_path_guarantees(normalizer.normalize(&heic_source(1), None).await);
    assert_eq!(source.loads(), 1);
    assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn heic_with_unreachable_sources_is_unavailable_without_transcode() {
    let transcoder = CountingTranscoder::new();
    let first = SlowSource::new(None);
    let second = SlowSource::new(None);
    let normalizer = normalizer(transcoder.clone(), vec![first.clone(), second.clone()]);

    let photo = normalizer
        .normalize(&heic_source(2), None)
        .await
        .expect("normalize should not error");

    assert_eq!(photo.status, FitStatus::ConversionUnavailable);
    assert!(photo.image.is_none());
    assert!(photo.thumbnail.is_none());
    assert!(photo.note.is_some());
    assert_eq!(transcoder.calls(), 0);
    assert_eq!((first.loads(), second.loads()), (1, 1));
}

#[test]
fn small_png_under_budget_needs_no_fitting() {
    let solid = ImageBuffer::from_pixel(50, 50, Rgb([200u8, 40, 90]));
    let png = png_bytes(solid);
    assert!(png.len() < 4 * 1024);

    let transcoder = CountingTranscoder::new();
    let initial = EncodedVariant {
        bytes: png,
        width: 50,
        height: 50,
    };

    let result = fit(transcoder.as_ref(), initial.clone(), &FitConfig::default());

    assert_eq!(result.status, FitStatus::FittedUnderBudget);
    assert_eq!(result.attempts, 0);
    assert_eq!(result.variant, Some(initial));
    assert_eq!(transcoder.calls(), 0);
}

#[tokio::test]
async fn small_png_through_facade_keeps_dimensions() {
    let transcoder = CountingTranscoder::new();
    let normalizer = normalizer(transcoder.clone(), Vec::new());
    let png = png_bytes(ImageBuffer::from_pixel(50, 50, Rgb([200u8, 40, 90])));
    let source = SourceImage::new(png, "image/png", "swatch.png");

    let photo = normalizer.normalize(&source, None).await.expect("normalize");

    assert_eq!(photo.status, FitStatus::FittedUnderBudget);
    let image = photo.image.expect("image");
    assert_eq!((image.width, image.height), (50, 50));
    // 首次转码 + 缩略图，拟合阶段不转码
    assert_eq!(transcoder.calls(), 2);
}

#[test]
fn fit_converges_for_reachable_budgets() {
    let transcoder = JpegTranscoder::new(&NormalizerConfig::default());
    let initial = transcoder
        .transcode(&jpeg_bytes(&textured_image(1600, 1200), 95), 1280, 960, 0.95)
        .expect("initial transcode");

    for budget in [30_000u64, 80_000, 200_000] {
        let config = FitConfig {
            max_bytes: budget,
            ..FitConfig::default()
        };
        let result = fit(&transcoder, initial.clone(), &config);

        assert_eq!(result.status, FitStatus::FittedUnderBudget, "budget {budget}");
        let variant = result.variant.expect("variant");
        assert!(variant.byte_len() <= budget, "budget {budget}: got {}", variant.byte_len());
    }
}

#[test]
fn impossible_budget_terminates_at_floor() {
    let transcoder = CountingTranscoder::new();
    let initial = transcoder
        .transcode(&jpeg_bytes(&textured_image(300, 200), 90), 1280, 960, 0.8)
        .expect("initial transcode");
    let config = FitConfig {
        max_bytes: 1,
        ..FitConfig::default()
    };

    let result = fit(transcoder.as_ref(), initial.clone(), &config);

    assert_eq!(result.status, FitStatus::FittedAtFloor);
    // 默认质量阶梯 0.80 → 0.35 共 10 级
    assert_eq!(result.attempts, 10 + config.max_downscale_iterations);
    let variant = result.variant.expect("smallest variant");
    assert!(variant.byte_len() <= initial.byte_len());
}

#[test]
fn refitting_a_fitted_result_is_a_no_op() {
    let transcoder = CountingTranscoder::new();
    let config = FitConfig {
        max_bytes: 60_000,
        ..FitConfig::default()
    };
    let initial = transcoder
        .transcode(&jpeg_bytes(&textured_image(1600, 1200), 95), 1280, 960, 0.95)
        .expect("initial transcode");

    let first = fit(transcoder.as_ref(), initial, &config);
    assert_eq!(first.status, FitStatus::FittedUnderBudget);
    let fitted = first.variant.expect("variant");

    let calls_before = transcoder.calls();
    let second = fit(transcoder.as_ref(), fitted.clone(), &config);

    assert_eq!(second.status, FitStatus::FittedUnderBudget);
    assert_eq!(second.attempts, 0);
    assert_eq!(second.variant, Some(fitted));
    assert_eq!(transcoder.calls(), calls_before);
}

#[tokio::test]
async fn concurrent_heic_uploads_share_one_capability_resolution() {
    let converter = fixed_converter(jpeg_bytes(&textured_image(320, 240), 85));
    let source = SlowSource::new(Some(converter.clone()));
    let normalizer = normalizer(CountingTranscoder::new(), vec![source.clone()]);

    let (src_a, src_b) = (heic_source(3), heic_source(4));
    let (a, b) = tokio::join!(
        normalizer.normalize(&src_a, None),
        normalizer.normalize(&src_b, None)
    );

    assert_eq!(a.expect("first").status, FitStatus::FittedUnderBudget);
    assert_eq!(b.expect("second").status, FitStatus::FittedUnderBudget);
    assert_eq!(source.loads(), 1);
    assert_eq!(converter.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn concurrent_uploads_share_a_failed_resolution() {
    let source = SlowSource::new(None);
    let normalizer = normalizer(CountingTranscoder::new(), vec![source.clone()]);

    let (src_a, src_b) = (heic_source(5), heic_source(6));
    let (a, b) = tokio::join!(
        normalizer.normalize(&src_a, None),
        normalizer.normalize(&src_b, None)
    );

    assert_eq!(a.expect("first").status, FitStatus::ConversionUnavailable);
    assert_eq!(b.expect("second").status, FitStatus::ConversionUnavailable);
    assert_eq!(source.loads(), 1);
}

#[tokio::test]
async fn repeated_heic_upload_hits_conversion_cache() {
    let converter = fixed_converter(jpeg_bytes(&textured_image(320, 240), 85));
    let source = SlowSource::new(Some(converter.clone()));
    let normalizer = normalizer(CountingTranscoder::new(), vec![source]);

    let heic = heic_source(7);
    normalizer.normalize(&heic, None).await.expect("first");
    normalizer.normalize(&heic, None).await.expect("second");

    assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(normalizer.adapter().cache().len(), 1);
}
