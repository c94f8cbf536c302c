//! JSON 设置文件：拟合策略 + 转换器来源 + 输入体积上限。
//!
//! 文件不存在时使用默认值；文件存在但无法解析时报错，避免静默使用错误配置。

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::normalizer::{ConverterConfig, FitConfig, NormalizerConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub fit: FitConfig,
    pub converter: ConverterConfig,
    pub max_file_size: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fit: FitConfig::default(),
            converter: ConverterConfig::default(),
            max_file_size: NormalizerConfig::default().max_file_size,
        }
    }
}

impl Settings {
    /// 生成进程级配置（解码上限与滤镜沿用默认值）。
    pub fn normalizer_config(&self) -> NormalizerConfig {
        NormalizerConfig {
            max_file_size: self.max_file_size,
            converter: self.converter.clone(),
            ..NormalizerConfig::default()
        }
    }
}

pub fn load_settings_from_path(settings_path: &Path) -> Result<Settings, AppError> {
    if !settings_path.exists() {
        log::info!("📄 设置文件不存在，使用默认设置 - {}", settings_path.display());
        return Ok(Settings::default());
    }

    let content = fs::read_to_string(settings_path)?;
    let settings: Settings = serde_json::from_str(&content)
        .map_err(|e| AppError::Settings(format!("解析设置文件失败: {}", e)))?;

    settings.fit.validate()?;
    Ok(settings)
}
