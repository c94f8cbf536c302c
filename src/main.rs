//! # 照片归一化工具 — 命令行入口
//!
//! 本文件仅负责参数解析、日志初始化与结果落盘。
//! 处理逻辑位于 `normalizer` 模块，详见 `lib.rs` 架构文档。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

use photo_normalizer::error::AppError;
use photo_normalizer::normalizer::{
    ConverterSourceConfig, FitStatus, NormalizedPhoto, NormalizerService, SourceImage,
};
use photo_normalizer::settings::{Settings, load_settings_from_path};

#[derive(Parser, Debug)]
#[command(author, version, about = "将照片（含 HEIC/HEIF）压缩为预算内的 JPEG 与缩略图", long_about = None)]
struct Cli {
    /// 待处理的照片文件
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// 输出目录（写入 <名称>.jpg 与 <名称>.thumb.jpg）
    #[arg(short, long, default_value = "normalized")]
    out_dir: PathBuf,

    /// JSON 设置文件
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 覆盖软预算（字节）
    #[arg(long)]
    max_bytes: Option<u64>,

    /// HTTP 转换服务地址，可重复，按顺序尝试
    #[arg(long = "converter-endpoint")]
    converter_endpoints: Vec<String>,

    /// 本地 heif-convert 风格程序（名称或路径）
    #[arg(long)]
    converter_command: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            log::error!("❌ 运行失败: {err}");
            ExitCode::FAILURE
        }
    }
}

/// 返回是否全部成功。
async fn run(cli: Cli) -> Result<bool, AppError> {
    let settings = resolve_settings(&cli)?;
    let service = NormalizerService::with_config(settings.normalizer_config(), settings.fit.clone())?;

    tokio::fs::create_dir_all(&cli.out_dir).await?;

    let mut all_ok = true;
    let mut loaded = Vec::new();
    let mut loaded_paths = Vec::new();

    for path in &cli.inputs {
        match SourceImage::from_file(path, settings.max_file_size) {
            Ok(source) => {
                loaded.push(source);
                loaded_paths.push(path.clone());
            }
            Err(err) => {
                all_ok = false;
                let err = AppError::from(err);
                log::warn!("⚠️ 读取失败 - {}: {}", path.display(), err);
                println!(
                    "{}",
                    serde_json::json!({ "file_name": path.display().to_string(), "error": err })
                );
            }
        }
    }

    let names: Vec<String> = loaded.iter().map(|s| s.file_name().to_string()).collect();
    let stems = unique_output_stems(&loaded_paths);
    let results = service.normalize_batch(loaded).await;

    for ((stem, name), result) in stems.iter().zip(names).zip(results) {
        match result {
            Ok(photo) => {
                if !matches!(photo.status, FitStatus::FittedUnderBudget | FitStatus::FittedAtFloor) {
                    all_ok = false;
                }
                if let Err(err) = write_outputs(&cli.out_dir, stem, &photo).await {
                    all_ok = false;
                    log::warn!("⚠️ 写入结果失败 - {}: {}", name, err);
                    println!("{}", serde_json::json!({ "file_name": name, "error": err }));
                    continue;
                }
                let report = serde_json::to_string(&photo.report(&name))
                    .map_err(|e| AppError::Settings(format!("序列化报告失败: {}", e)))?;
                println!("{}", report);
            }
            Err(err) => {
                all_ok = false;
                let err = AppError::from(err);
                log::warn!("⚠️ 处理失败 - {}: {}", name, err);
                println!("{}", serde_json::json!({ "file_name": name, "error": err }));
            }
        }
    }

    Ok(all_ok)
}

fn resolve_settings(cli: &Cli) -> Result<Settings, AppError> {
    let mut settings = match &cli.config {
        Some(path) => load_settings_from_path(path)?,
        None => Settings::default(),
    };

    if let Some(max_bytes) = cli.max_bytes {
        settings.fit.max_bytes = max_bytes;
        settings.fit.validate()?;
    }

    if !cli.converter_endpoints.is_empty() || cli.converter_command.is_some() {
        let mut sources: Vec<ConverterSourceConfig> = cli
            .converter_endpoints
            .iter()
            .map(|endpoint| ConverterSourceConfig::Http {
                endpoint: endpoint.clone(),
            })
            .collect();

        if let Some(program) = &cli.converter_command {
            sources.push(ConverterSourceConfig::Command {
                program: program.clone(),
            });
        }

        settings.converter.sources = sources;
    }

    Ok(settings)
}

/// 为每个输入分配不冲突的输出名：同名（忽略大小写）时追加 `-2`、`-3` 等后缀，
/// 同时避开其它输入的 `.thumb` 文件名。
fn unique_output_stems(inputs: &[PathBuf]) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::new();

    inputs
        .iter()
        .map(|input| {
            let base = input
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "photo".to_string());

            let mut stem = base.clone();
            let mut n = 1;
            loop {
                let image = format!("{stem}.jpg").to_lowercase();
                let thumbnail = format!("{stem}.thumb.jpg").to_lowercase();
                if !taken.contains(&image) && !taken.contains(&thumbnail) {
                    taken.insert(image);
                    taken.insert(thumbnail);
                    break;
                }
                n += 1;
                stem = format!("{base}-{n}");
            }

            if n > 1 {
                log::info!("📝 输出文件名冲突，改用 {} - {}", stem, input.display());
            }
            stem
        })
        .collect()
}

async fn write_outputs(out_dir: &Path, stem: &str, photo: &NormalizedPhoto) -> Result<(), AppError> {
    if let Some(image) = &photo.image {
        tokio::fs::write(out_dir.join(format!("{stem}.jpg")), &image.bytes).await?;
    }
    if let Some(thumbnail) = &photo.thumbnail {
        tokio::fs::write(out_dir.join(format!("{stem}.thumb.jpg")), &thumbnail.bytes).await?;
    }

    Ok(())
}
