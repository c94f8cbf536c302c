//! # 错误模型模块
//!
//! ## 设计思路
//!
//! 使用单一错误枚举承载归一化链路中的所有错误来源，避免字符串拼接式错误处理。
//! 通过 `thiserror` 保持人类可读错误，同时让调用侧可按分支匹配。
//!
//! 预期内的失败（转换器不可用、图片过大）不会以 `Err` 穿出门面，
//! 而是在 `handler` 中降级为 `FitStatus`；`Err` 只留给配置错误与内部故障。

/// 归一化链路统一错误类型。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    /// 所有 HEIC 转换能力来源都无法加载（可在网络恢复后重试）。
    #[error("HEIC 转换能力不可用：{0}")]
    ConversionUnavailable(String),

    /// 转换能力可用，但拒绝了这份数据（同一输入重试无意义）。
    #[error("HEIC 转换失败：{0}")]
    ConversionFailed(String),

    #[error("解码错误：{0}")]
    Decode(String),

    #[error("编码错误：{0}")]
    Encode(String),

    #[error("格式错误：{0}")]
    InvalidFormat(String),

    #[error("资源限制：{0}")]
    ResourceLimit(String),

    #[error("网络错误：{0}")]
    Network(String),

    #[error("超时错误：{0}")]
    Timeout(String),

    #[error("文件错误：{0}")]
    FileSystem(String),

    #[error("配置错误：{0}")]
    InvalidConfig(String),

    #[error("内部错误：{0}")]
    Internal(String),
}

impl NormalizeError {
    /// 稳定错误码，供调用方做文案映射。
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConversionUnavailable(_) => "E_CONVERSION_UNAVAILABLE",
            Self::ConversionFailed(_) => "E_CONVERSION_FAILED",
            Self::Decode(_) => "E_DECODE",
            Self::Encode(_) => "E_ENCODE",
            Self::InvalidFormat(_) => "E_INVALID_FORMAT",
            Self::ResourceLimit(_) => "E_RESOURCE_LIMIT",
            Self::Network(_) => "E_NETWORK",
            Self::Timeout(_) => "E_TIMEOUT",
            Self::FileSystem(_) => "E_FILE_SYSTEM",
            Self::InvalidConfig(_) => "E_INVALID_CONFIG",
            Self::Internal(_) => "E_INTERNAL",
        }
    }

    /// 出错所在的流水线阶段。
    pub fn stage(&self) -> &'static str {
        match self {
            Self::ConversionUnavailable(_) | Self::ConversionFailed(_) => "convert",
            Self::Decode(_) | Self::Encode(_) | Self::ResourceLimit(_) => "transcode",
            Self::InvalidFormat(_) | Self::FileSystem(_) => "load",
            Self::Network(_) | Self::Timeout(_) => "capability",
            Self::InvalidConfig(_) => "config",
            Self::Internal(_) => "internal",
        }
    }

    /// 是否属于栅格转码失败（解码或编码阶段）。
    pub fn is_transcode_failure(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Encode(_) | Self::ResourceLimit(_))
    }
}

impl From<NormalizeError> for String {
    fn from(error: NormalizeError) -> Self {
        error.to_string()
    }
}
