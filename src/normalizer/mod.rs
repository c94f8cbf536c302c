//! # 照片归一化模块（normalizer）
//!
//! ## 设计思路
//!
//! 该模块将“格式识别 → HEIC 转换 → 首次转码 → 字节预算拟合 → 缩略图”
//! 按职责拆分为多个子模块，避免单文件膨胀与耦合。
//!
//! - `service`：承载可共享状态（`NormalizerService`）与批量入口
//! - `handler`：编排整条处理流水线（`PhotoNormalizer`）
//! - `classify`：判断输入是否为 HEIC/HEIF
//! - `converter`：转换能力的 single-flight 解析与结果缓存
//! - `providers`：HTTP 服务 / 本地命令两种转换能力来源
//! - `transcode`：解码、像素限制、降采样、JPEG 编码
//! - `fit`：质量阶梯 + 尺寸阶梯的字节预算拟合
//! - `thumbnail`：基于拟合结果派生缩略图
//! - `loader`：本地文件 / Data URL 加载与体积校验
//! - `config/error/source`：配置、错误、中间数据模型
//!
//! ## 实现思路
//!
//! 对外仅暴露必要类型与函数，阶段内部细节保持 `mod` 私有。
//! 转换能力来源与转码器都以 trait 对象注入，测试可替换为计数或故障注入实现。
//!
//! ## 新同事快速上手
//!
//! 可以按下面顺序理解调用链：
//!
//! ```text
//! 调用方（命令行 / 上传接口）
//!    ↓
//! service.rs（配置快照、批量任务）
//!    ↓
//! handler.rs（统一编排 + 阶段耗时日志）
//!    ├─ classify.rs（声明类型 + 文件签名）
//!    ├─ converter.rs（能力解析 single-flight + 结果缓存）
//!    │     └─ providers.rs（HTTP / 本地命令）
//!    ├─ transcode.rs（首次转码）
//!    ├─ fit.rs（质量阶梯 → 尺寸阶梯）
//!    └─ thumbnail.rs（缩略图）
//!    ↓
//! 返回 NormalizedPhoto（状态 + 图片 + 缩略图 + 说明）
//! ```
//!
//! ## 分层职责建议
//!
//! - 预算、质量、尺寸等策略变更优先改 `config.rs`
//! - 处理顺序或状态降级规则变更优先改 `handler.rs`
//! - 新增转换能力来源在 `providers.rs` 实现 `CapabilitySource` 并接入 `create_source`

mod classify;
mod config;
mod converter;
mod error;
mod fit;
mod handler;
mod loader;
mod providers;
mod service;
mod source;
mod thumbnail;
mod transcode;

pub use classify::{SourceKind, classify, classify_bytes, classify_source, classify_uri};
pub use config::{
    ConverterConfig, ConverterSourceConfig, DEFAULT_HARD_MAX_BYTES, FitConfig, MAX_DOWNSCALE_ITERATIONS,
    MIN_DIMENSION, MIN_QUALITY_STEP, NormalizerConfig,
};
pub use converter::{
    CapabilitySource, ConversionCache, ConverterOutput, DynCapabilitySource, HeicAdapter, HeicConverter,
};
pub use error::NormalizeError;
pub use fit::fit;
pub use handler::{DisplayImage, PhotoNormalizer};
pub use providers::{CommandConverterSource, HttpConverterSource, create_source, create_sources};
pub use service::NormalizerService;
pub use source::{
    EncodedVariant, FitResult, FitStatus, NormalizeReport, NormalizedPhoto, OUTPUT_MIME, SourceImage,
};
pub use thumbnail::{ThumbnailSpec, derive_thumbnail};
pub use transcode::{JpegTranscoder, Transcode, encoder_quality, target_dimensions};
