//! # 转换能力来源实现
//!
//! ## 设计思路
//!
//! 每种来源只负责“探测能力是否可用”和“提供转换实现”，
//! 顺序回退、并发合并与结果缓存全部交给 `HeicAdapter`。
//!
//! ## 实现思路
//!
//! - HTTP：`GET endpoint` 读取能力清单（`{"input": [...], "output": "image/jpeg"}`），
//!   转换时 `POST endpoint?quality=<1-100>` 上传原始字节；响应为图片或 `{"images": [base64...]}`。
//! - 命令：在 PATH（或显式路径）中定位 `heif-convert` 风格的程序，
//!   在临时目录中执行 `program -q <quality> input.heic output.jpg`，按自然顺序收集输出。

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::NormalizeError;
use super::config::{ConverterConfig, ConverterSourceConfig};
use super::converter::{CapabilitySource, ConverterOutput, DynCapabilitySource, HeicConverter};
use super::transcode::encoder_quality;

const BUFFER_INITIAL_CAPACITY: usize = 64 * 1024;
const HEIC_MIME: &str = "image/heic";
const HEIF_MIME: &str = "image/heif";

/// 按配置创建能力来源。
pub fn create_source(
    source: &ConverterSourceConfig,
    config: &ConverterConfig,
) -> Result<DynCapabilitySource, NormalizeError> {
    match source {
        ConverterSourceConfig::Http { endpoint } => {
            Ok(Arc::new(HttpConverterSource::new(endpoint, config)?))
        }
        ConverterSourceConfig::Command { program } => {
            Ok(Arc::new(CommandConverterSource::new(program, config)))
        }
    }
}

/// 按配置顺序创建全部能力来源。
pub fn create_sources(config: &ConverterConfig) -> Result<Vec<DynCapabilitySource>, NormalizeError> {
    config
        .sources
        .iter()
        .map(|source| create_source(source, config))
        .collect()
}

// ========== HTTP ==========

/// 转换服务返回的能力清单。
#[derive(Debug, Deserialize)]
struct CapabilityManifest {
    input: Vec<String>,
    output: String,
}

impl CapabilityManifest {
    fn supports_heic_to_jpeg(&self) -> bool {
        let accepts_heic = self
            .input
            .iter()
            .any(|mime| mime.eq_ignore_ascii_case(HEIC_MIME) || mime.eq_ignore_ascii_case(HEIF_MIME));
        accepts_heic && self.output.eq_ignore_ascii_case("image/jpeg")
    }
}

#[derive(Debug, Deserialize)]
struct ImageListPayload {
    images: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HttpConverterSource {
    name: String,
    endpoint: reqwest::Url,
    client: reqwest::Client,
    max_response_bytes: u64,
    request_timeout: u64,
}

impl HttpConverterSource {
    pub fn new(endpoint: &str, config: &ConverterConfig) -> Result<Self, NormalizeError> {
        let parsed = reqwest::Url::parse(endpoint)
            .map_err(|e| NormalizeError::InvalidConfig(format!("转换服务地址无效：{}", e)))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(NormalizeError::InvalidConfig(format!(
                "转换服务仅支持 http/https：{}",
                parsed.scheme()
            )));
        }

        Ok(Self {
            name: format!("http:{}", redact_url_for_log(endpoint)),
            endpoint: parsed,
            client: build_http_client(config)?,
            max_response_bytes: config.max_response_bytes,
            request_timeout: config.request_timeout,
        })
    }
}

#[async_trait]
impl CapabilitySource for HttpConverterSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<Arc<dyn HeicConverter>, NormalizeError> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.endpoint.as_str(), self.request_timeout))?;

        ensure_success(&response)?;
        let body = read_body_limited(response, self.max_response_bytes).await?;

        let manifest: CapabilityManifest = serde_json::from_slice(&body).map_err(|e| {
            if e.is_data() {
                NormalizeError::InvalidFormat(format!("能力清单结构不符：{}", e))
            } else {
                NormalizeError::InvalidFormat(format!("能力清单不是合法 JSON：{}", e))
            }
        })?;

        if !manifest.supports_heic_to_jpeg() {
            return Err(NormalizeError::InvalidFormat(format!(
                "转换服务不支持 HEIC → JPEG（input={:?}, output={}）",
                manifest.input, manifest.output
            )));
        }

        log::debug!("🔌 转换服务能力清单校验通过 - {}", self.name);

        Ok(Arc::new(HttpConverter {
            endpoint: self.endpoint.clone(),
            client: self.client.clone(),
            max_response_bytes: self.max_response_bytes,
            request_timeout: self.request_timeout,
        }))
    }
}

struct HttpConverter {
    endpoint: reqwest::Url,
    client: reqwest::Client,
    max_response_bytes: u64,
    request_timeout: u64,
}

#[async_trait]
impl HeicConverter for HttpConverter {
    async fn convert(&self, bytes: &[u8], quality: f32) -> Result<ConverterOutput, NormalizeError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("quality", &encoder_quality(quality).to_string());

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, HEIC_MIME)
            .header(reqwest::header::ACCEPT, "image/jpeg, application/json")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.endpoint.as_str(), self.request_timeout))?;

        ensure_success(&response)?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
            .map(|ct| ct.to_string())
            .unwrap_or_default();

        let body = read_body_limited(response, self.max_response_bytes).await?;

        if is_image_content_type(&content_type) {
            return Ok(ConverterOutput::Single(body));
        }

        if is_json_content_type(&content_type) {
            let payload: ImageListPayload = serde_json::from_slice(&body)
                .map_err(|e| NormalizeError::ConversionFailed(format!("转换结果 JSON 无法解析：{}", e)))?;

            let images = payload
                .images
                .iter()
                .map(|encoded| {
                    general_purpose::STANDARD
                        .decode(strip_data_url_header(encoded).trim())
                        .map_err(|e| NormalizeError::ConversionFailed(format!("转换结果 Base64 解码失败：{}", e)))
                })
                .collect::<Result<Vec<_>, _>>()?;

            return Ok(ConverterOutput::Multiple(images));
        }

        Err(NormalizeError::ConversionFailed(format!(
            "转换服务返回了未知类型：{}",
            if content_type.is_empty() { "<none>" } else { &content_type }
        )))
    }
}

fn build_http_client(config: &ConverterConfig) -> Result<reqwest::Client, NormalizeError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout))
        .connect_timeout(Duration::from_secs(config.connect_timeout))
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .map_err(|e| NormalizeError::Network(format!("无法创建 HTTP 客户端：{}", e)))
}

fn ensure_success(response: &reqwest::Response) -> Result<(), NormalizeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    Err(NormalizeError::Network(format!(
        "HTTP {}: {}",
        status.as_u16(),
        status_message(status.as_u16())
    )))
}

/// 读取响应体，并在 Content-Length 与实际流量两处执行体积上限。
async fn read_body_limited(
    mut response: reqwest::Response,
    max_bytes: u64,
) -> Result<Vec<u8>, NormalizeError> {
    let declared_len = response.content_length();
    if let Some(len) = declared_len {
        if len > max_bytes {
            return Err(NormalizeError::ResourceLimit(format!(
                "响应过大：{:.2} MB（限制：{:.2} MB）",
                len as f64 / 1024.0 / 1024.0,
                max_bytes as f64 / 1024.0 / 1024.0
            )));
        }
    }

    let initial_capacity = declared_len
        .map(|len| len.min(usize::MAX as u64) as usize)
        .filter(|len| *len > 0)
        .unwrap_or(BUFFER_INITIAL_CAPACITY);
    let mut buffer = Vec::with_capacity(initial_capacity);
    let mut total: u64 = 0;

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| NormalizeError::Network(format!("读取响应失败：{}", e)))?
    {
        total = total.saturating_add(chunk.len() as u64);
        if total > max_bytes {
            return Err(NormalizeError::ResourceLimit("响应超过大小限制".to_string()));
        }
        buffer.extend_from_slice(&chunk);
    }

    Ok(buffer)
}

fn is_image_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|base| base.trim().to_ascii_lowercase().starts_with("image/"))
        .unwrap_or(false)
}

fn is_json_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|base| {
            let base = base.trim().to_ascii_lowercase();
            base == "application/json" || base.ends_with("+json")
        })
        .unwrap_or(false)
}

fn strip_data_url_header(encoded: &str) -> &str {
    match encoded.split_once(";base64,") {
        Some((header, payload)) if header.trim_start().starts_with("data:") => payload,
        _ => encoded,
    }
}

fn redact_url_for_log(url: &str) -> String {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return "<invalid-url>".to_string();
    };

    let host = parsed.host_str().unwrap_or("<unknown-host>");
    let port = parsed.port().map(|p| format!(":{}", p)).unwrap_or_default();
    let path = parsed.path();

    format!("{}://{}{}{}", parsed.scheme(), host, port, path)
}

/// 统一映射 reqwest 错误到业务错误。
fn map_reqwest_error(e: reqwest::Error, url: &str, request_timeout: u64) -> NormalizeError {
    let err_msg = e.to_string().replace(url, &redact_url_for_log(url));

    if e.is_timeout() {
        NormalizeError::Timeout(format!("转换服务请求超时（{}秒）", request_timeout))
    } else if e.is_connect() {
        NormalizeError::Network(format!("无法连接转换服务：{}", err_msg))
    } else {
        NormalizeError::Network(format!("转换服务请求失败：{}", err_msg))
    }
}

fn status_message(code: u16) -> &'static str {
    match code {
        404 => "未找到",
        403 => "访问被拒绝",
        415 => "不支持的媒体类型",
        500..=599 => "服务器错误",
        _ => "请求失败",
    }
}

// ========== 本地命令 ==========

#[derive(Debug, Clone)]
pub struct CommandConverterSource {
    name: String,
    program: String,
    timeout: Duration,
}

impl CommandConverterSource {
    pub fn new(program: &str, config: &ConverterConfig) -> Self {
        Self {
            name: format!("command:{}", program),
            program: program.to_string(),
            timeout: Duration::from_secs(config.command_timeout),
        }
    }
}

#[async_trait]
impl CapabilitySource for CommandConverterSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<Arc<dyn HeicConverter>, NormalizeError> {
        let path = resolve_program(&self.program).ok_or_else(|| {
            NormalizeError::FileSystem(format!("未找到转换程序：{}", self.program))
        })?;

        log::debug!("🔌 找到本地转换程序 - {}", path.display());

        Ok(Arc::new(CommandConverter {
            program: path,
            timeout: self.timeout,
        }))
    }
}

struct CommandConverter {
    program: PathBuf,
    timeout: Duration,
}

#[async_trait]
impl HeicConverter for CommandConverter {
    async fn convert(&self, bytes: &[u8], quality: f32) -> Result<ConverterOutput, NormalizeError> {
        let workdir = tempfile::TempDir::new()
            .map_err(|e| NormalizeError::FileSystem(format!("无法创建临时目录：{}", e)))?;
        let input = workdir.path().join("input.heic");
        let output = workdir.path().join("output.jpg");

        tokio::fs::write(&input, bytes)
            .await
            .map_err(|e| NormalizeError::FileSystem(format!("无法写入临时文件：{}", e)))?;

        let run = tokio::process::Command::new(&self.program)
            .arg("-q")
            .arg(encoder_quality(quality).to_string())
            .arg(&input)
            .arg(&output)
            .kill_on_drop(true)
            .output();

        let result = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| NormalizeError::Timeout(format!("转换程序超时（{}秒）", self.timeout.as_secs())))?
            .map_err(|e| NormalizeError::ConversionFailed(format!("无法启动转换程序：{}", e)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(NormalizeError::ConversionFailed(format!(
                "转换程序退出码 {:?}：{}",
                result.status.code(),
                stderr.trim()
            )));
        }

        let mut images = collect_converted_images(workdir.path())?;
        match images.len() {
            0 => Err(NormalizeError::ConversionFailed("转换程序未产生输出".to_string())),
            1 => Ok(ConverterOutput::Single(images.remove(0))),
            _ => Ok(ConverterOutput::Multiple(images)),
        }
    }
}

/// 在 PATH 中定位程序；包含路径分隔符时按路径直接检查。
fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|path| path.is_file())
}

/// 收集转换目录下的 JPEG 输出。
///
/// 多图容器会生成 `output-1.jpg`、`output-2.jpg` ……，按“长度优先、再按名称”排序，
/// 保证 `output-10` 排在 `output-2` 之后。
fn collect_converted_images(dir: &Path) -> Result<Vec<Vec<u8>>, NormalizeError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| NormalizeError::FileSystem(format!("无法读取转换输出目录：{}", e)))?;

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| {
            let lower = name.to_ascii_lowercase();
            lower.starts_with("output") && (lower.ends_with(".jpg") || lower.ends_with(".jpeg"))
        })
        .collect();

    names.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

    names
        .iter()
        .map(|name| {
            std::fs::read(dir.join(name))
                .map_err(|e| NormalizeError::FileSystem(format!("无法读取转换结果 {}：{}", name, e)))
        })
        .collect()
}
