//! # 格式识别模块
//!
//! 纯函数、无 I/O、不会失败：判断输入是否需要先经过 HEIC/HEIF 转换。
//! 无法判断时返回 `Unknown`，由门面按“标准格式”乐观处理，真正无法解码时转码阶段会明确报错。

use super::source::SourceImage;

/// 格式分类结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// 常规栅格格式，可直接解码。
    Standard,
    /// HEIC/HEIF 容器，需要外部转换能力。
    ExoticContainer,
    Unknown,
}

const EXOTIC_MIME_TYPES: [&str; 2] = ["image/heic", "image/heif"];
const EXOTIC_EXTENSIONS: [&str; 2] = [".heic", ".heif"];

/// 按声明类型与文件名分类。
pub fn classify(declared_type: &str, file_name: &str) -> SourceKind {
    let declared = declared_type.trim().to_ascii_lowercase();
    let name = file_name.trim().to_ascii_lowercase();

    if EXOTIC_MIME_TYPES.contains(&declared.as_str()) || has_exotic_extension(&name) {
        return SourceKind::ExoticContainer;
    }

    if declared.starts_with("image/") {
        return SourceKind::Standard;
    }

    SourceKind::Unknown
}

/// 按 Data URL 或路径/URL 字符串分类。
///
/// Data URL 只检查逗号前的头部，避免 base64 正文里偶然出现 `heic` 字样导致误判。
pub fn classify_uri(uri: &str) -> SourceKind {
    let normalized = uri.trim().to_ascii_lowercase();

    if let Some(rest) = normalized.strip_prefix("data:") {
        let header = rest.split(',').next().unwrap_or_default();
        if header.contains("heic") || header.contains("heif") {
            return SourceKind::ExoticContainer;
        }
        if header.starts_with("image/") {
            return SourceKind::Standard;
        }
        return SourceKind::Unknown;
    }

    let path = normalized
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    if has_exotic_extension(path) {
        SourceKind::ExoticContainer
    } else {
        SourceKind::Unknown
    }
}

/// 按文件签名（magic bytes）分类。
pub fn classify_bytes(bytes: &[u8]) -> SourceKind {
    let Some(kind) = infer::get(bytes) else {
        return SourceKind::Unknown;
    };

    let mime = kind.mime_type();
    if EXOTIC_MIME_TYPES.contains(&mime) {
        SourceKind::ExoticContainer
    } else if kind.matcher_type() == infer::MatcherType::Image {
        SourceKind::Standard
    } else {
        SourceKind::Unknown
    }
}

/// 综合分类：声明信息优先，签名命中 HEIF 时覆盖声明。
///
/// 手机导出的 HEIC 常常保留 `.jpg` 扩展名，仅凭声明会走到必然失败的解码路径。
pub fn classify_source(source: &SourceImage) -> SourceKind {
    let declared = classify(source.declared_type(), source.file_name());
    if declared == SourceKind::ExoticContainer {
        return declared;
    }

    match classify_bytes(source.bytes()) {
        SourceKind::ExoticContainer => {
            log::debug!(
                "🔎 文件签名为 HEIF，覆盖声明类型 - 文件: {} 声明: {}",
                source.file_name(),
                source.declared_type()
            );
            SourceKind::ExoticContainer
        }
        SourceKind::Standard if declared == SourceKind::Unknown => SourceKind::Standard,
        _ => declared,
    }
}

fn has_exotic_extension(name: &str) -> bool {
    EXOTIC_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}
