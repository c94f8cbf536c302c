//! # 照片归一化工具 — 库入口
//!
//! ## 架构总览
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │        调用方（photo-normalize 命令行 / 上传接口）        │
//! │                                                          │
//! │  SourceImage::from_file / from_data_url                  │
//! │       │  (Result<T, AppError> / NormalizedPhoto)         │
//! └───────┼──────────────────────────────────────────────────┘
//!         ↓
//! ┌───────┼──────────────────────────────────────────────────┐
//! │       ↓            库 (Rust)                             │
//! │                                                          │
//! │  ┌─ error ────── AppError (统一错误类型)                  │
//! │  │                                                       │
//! │  ├─ settings ─── JSON 设置文件 → NormalizerConfig         │
//! │  │                                                       │
//! │  └─ normalizer   识别·转换·转码·拟合·缩略图               │
//! │      ├─ converter   HEIC 能力解析 (single-flight) + 缓存  │
//! │      ├─ providers   HTTP 转换服务 / heif-convert          │
//! │      └─ fit         质量阶梯 → 尺寸阶梯                   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 模块职责
//!
//! | 模块 | 职责 |
//! |------|------|
//! | [`error`] | 统一错误类型 `AppError`，命令行入口的返回类型 |
//! | [`settings`] | 读取 JSON 设置文件并生成运行配置 |
//! | [`normalizer`] | 将任意照片压成预算内的 JPEG 与缩略图 |

pub mod error;
pub mod normalizer;
pub mod settings;
