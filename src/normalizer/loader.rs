//! # 加载与校验模块
//!
//! ## 设计思路
//!
//! 统一处理不同来源（本地文件 / Data URL）的原始字节加载，并在“尽可能早”的阶段执行输入校验。
//! 目标是尽快失败，减少不必要内存与 CPU 消耗。
//!
//! ## 实现思路
//!
//! - 文件：存在性 + metadata 体积限制 + 读取 + 签名嗅探声明类型。
//! - Data URL：头部解析 + 解码前体积估算 + base64 解码。

use base64::{Engine as _, engine::general_purpose};
use std::path::Path;

use super::NormalizeError;
use super::source::SourceImage;

const FALLBACK_MIME: &str = "application/octet-stream";

impl SourceImage {
    /// 从本地路径加载图片。
    pub fn from_file(path: impl AsRef<Path>, max_file_size: u64) -> Result<Self, NormalizeError> {
        let file_path = path.as_ref();
        log::info!("📁 开始读取本地图片 - 路径: {}", file_path.display());

        if !file_path.exists() {
            return Err(NormalizeError::FileSystem(format!(
                "文件不存在：{}",
                file_path.display()
            )));
        }

        let metadata = std::fs::metadata(file_path)
            .map_err(|e| NormalizeError::FileSystem(format!("无法读取文件信息：{}", e)))?;

        if metadata.len() > max_file_size {
            return Err(NormalizeError::ResourceLimit(format!(
                "文件过大：{:.2} MB（限制：{:.2} MB）",
                metadata.len() as f64 / 1024.0 / 1024.0,
                max_file_size as f64 / 1024.0 / 1024.0
            )));
        }

        let bytes = std::fs::read(file_path)
            .map_err(|e| NormalizeError::FileSystem(format!("无法读取图片文件：{}", e)))?;

        if bytes.is_empty() {
            return Err(NormalizeError::InvalidFormat("图片内容为空".to_string()));
        }

        let declared_type = sniff_mime(&bytes);
        let file_name = file_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(Self::new(bytes, declared_type, file_name))
    }

    /// 从 Data URL 加载图片（`data:<mime>;base64,<payload>`）。
    ///
    /// 声明类型取自 Data URL 头部；头部缺失类型时回退为签名嗅探结果。
    pub fn from_data_url(
        data_url: &str,
        file_name: impl Into<String>,
        max_file_size: u64,
    ) -> Result<Self, NormalizeError> {
        log::info!("📝 开始处理 Data URL 图片");

        let (mime, bytes) = parse_data_url_with_limit(data_url, max_file_size)?;
        if bytes.is_empty() {
            return Err(NormalizeError::InvalidFormat("图片内容为空".to_string()));
        }

        let declared_type = match mime {
            Some(mime) => mime,
            None => sniff_mime(&bytes),
        };

        Ok(Self::new(bytes, declared_type, file_name))
    }
}

/// 通过文件签名推断 MIME，无法识别时返回通用二进制类型。
fn sniff_mime(bytes: &[u8]) -> String {
    infer::get(bytes)
        .map(|kind| kind.mime_type().to_string())
        .unwrap_or_else(|| FALLBACK_MIME.to_string())
}

fn estimate_base64_decoded_upper_bound_len(base64_data: &str) -> Result<u64, NormalizeError> {
    let len = base64_data.trim().len() as u64;
    let groups = len
        .checked_add(3)
        .ok_or_else(|| NormalizeError::ResourceLimit("Base64 输入长度溢出".to_string()))?
        / 4;

    groups
        .checked_mul(3)
        .ok_or_else(|| NormalizeError::ResourceLimit("Base64 解码体积估算溢出".to_string()))
}

/// 解析 Data URL，返回头部声明的 MIME（可能缺失）与解码后的字节。
pub(crate) fn parse_data_url_with_limit(
    data_url: &str,
    max_file_size: u64,
) -> Result<(Option<String>, Vec<u8>), NormalizeError> {
    let normalized = data_url.trim();

    let rest = normalized
        .get(..5)
        .filter(|prefix| prefix.eq_ignore_ascii_case("data:"))
        .map(|_| &normalized[5..])
        .ok_or_else(|| NormalizeError::InvalidFormat("不是 Data URL".to_string()))?;

    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| NormalizeError::InvalidFormat("Data URL 缺少数据段".to_string()))?;

    let mut parts = header.split(';');
    let mime = parts
        .next()
        .map(|m| m.trim().to_ascii_lowercase())
        .filter(|m| !m.is_empty());

    if !parts.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return Err(NormalizeError::InvalidFormat("缺少 base64 标记".to_string()));
    }

    let estimated_len = estimate_base64_decoded_upper_bound_len(payload)?;
    if estimated_len > max_file_size {
        return Err(NormalizeError::ResourceLimit(format!(
            "Base64 预计解码体积过大：{:.2} MB（限制：{:.2} MB）",
            estimated_len as f64 / 1024.0 / 1024.0,
            max_file_size as f64 / 1024.0 / 1024.0
        )));
    }

    let bytes = general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| NormalizeError::Decode(format!("Base64 解码失败：{}", e)))?;

    Ok((mime, bytes))
}
