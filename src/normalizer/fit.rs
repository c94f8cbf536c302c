//! # 字节预算拟合模块
//!
//! ## 设计思路
//!
//! 两段式贪心阶梯搜索（不是二分）：JPEG 质量与体积的关系受内容影响较大，
//! 这里优先保证迭代次数有界、行为可预测，而不是追求最优解。
//!
//! ## 实现思路
//!
//! 1. 输入已在预算内：直接返回，不做任何转码。
//! 2. 质量阶梯：固定最大宽高，质量从 `start_quality` 逐级下降到 `min_quality`，
//!    每一级都从拟合输入重新编码。
//! 3. 尺寸阶梯：宽高按 `downscale_step` 递减（单边不低于 100px），质量同步衰减，
//!    每次仍超预算的结果作为下一轮的输入（渐进细化）。
//! 4. 阶梯耗尽：返回过程中最小的结果，状态为 `FittedAtFloor`。
//!
//! 某一级转码失败只跳过该级；输入本身不可读（解码失败或零字节）则中止整个拟合。

use super::config::{FitConfig, MIN_DIMENSION};
use super::source::{EncodedVariant, FitResult, FitStatus};
use super::transcode::Transcode;
use super::NormalizeError;

/// 单级转码的处理结果。
enum Rung {
    Fitted(EncodedVariant),
    Over(EncodedVariant),
    Skipped,
    Abort(String),
}

struct FitRun<'a, T: Transcode + ?Sized> {
    transcoder: &'a T,
    config: &'a FitConfig,
    attempts: u32,
    best: EncodedVariant,
}

impl<'a, T: Transcode + ?Sized> FitRun<'a, T> {
    fn attempt(&mut self, base: &[u8], max_width: u32, max_height: u32, quality: f32) -> Rung {
        self.attempts += 1;

        match self.transcoder.transcode(base, max_width, max_height, quality) {
            Ok(variant) if variant.is_empty() => Rung::Abort("转码结果为空".to_string()),
            Ok(variant) => {
                log::debug!(
                    "📉 拟合第 {} 次 - {}x{} q={:.2} size={} budget={}",
                    self.attempts,
                    variant.width,
                    variant.height,
                    quality,
                    variant.byte_len(),
                    self.config.max_bytes
                );

                if variant.byte_len() < self.best.byte_len() {
                    self.best = variant.clone();
                }

                if variant.byte_len() <= self.config.max_bytes {
                    Rung::Fitted(variant)
                } else {
                    Rung::Over(variant)
                }
            }
            Err(NormalizeError::Decode(msg)) => Rung::Abort(msg),
            Err(err) => {
                log::warn!(
                    "⚠️ 拟合转码失败，跳过该级 - {}x{} q={:.2}：{}",
                    max_width,
                    max_height,
                    quality,
                    err
                );
                Rung::Skipped
            }
        }
    }

    fn finish(self, status: FitStatus, variant: EncodedVariant) -> FitResult {
        FitResult {
            status,
            variant: Some(variant),
            attempts: self.attempts,
        }
    }

    fn abort(self, reason: &str) -> FitResult {
        log::warn!("❌ 拟合中止（输入不可读）：{}", reason);
        FitResult {
            status: FitStatus::ConversionFailed,
            variant: None,
            attempts: self.attempts,
        }
    }
}

/// 将已编码的图片压到 `config.max_bytes` 以内（尽力而为）。
///
/// `config` 未通过 [`FitConfig::validate`] 时不做任何转码，直接返回 `ConversionFailed`。
pub fn fit<T: Transcode + ?Sized>(
    transcoder: &T,
    initial: EncodedVariant,
    config: &FitConfig,
) -> FitResult {
    if let Err(err) = config.validate() {
        log::warn!("❌ 拟合配置无效：{}", err);
        return FitResult {
            status: FitStatus::ConversionFailed,
            variant: None,
            attempts: 0,
        };
    }

    if initial.is_empty() {
        log::warn!("❌ 拟合输入为零字节");
        return FitResult {
            status: FitStatus::ConversionFailed,
            variant: None,
            attempts: 0,
        };
    }

    if initial.byte_len() <= config.max_bytes {
        return FitResult {
            status: FitStatus::FittedUnderBudget,
            variant: Some(initial),
            attempts: 0,
        };
    }

    let mut run = FitRun {
        transcoder,
        config,
        attempts: 0,
        best: initial.clone(),
    };

    for quality in config.quality_ladder() {
        match run.attempt(&initial.bytes, config.max_width, config.max_height, quality) {
            Rung::Fitted(variant) => return run.finish(FitStatus::FittedUnderBudget, variant),
            Rung::Abort(reason) => return run.abort(&reason),
            Rung::Over(_) | Rung::Skipped => {}
        }
    }

    let mut base = run.best.clone();
    let mut current_width = config.max_width;
    let mut current_height = config.max_height;

    for iteration in 0..config.max_downscale_iterations {
        current_width = shrink(current_width, config.downscale_step);
        current_height = shrink(current_height, config.downscale_step);
        let quality = config.downscale_quality(iteration);

        match run.attempt(&base.bytes, current_width, current_height, quality) {
            Rung::Fitted(variant) => return run.finish(FitStatus::FittedUnderBudget, variant),
            Rung::Over(variant) => base = variant,
            Rung::Skipped => {}
            Rung::Abort(reason) => return run.abort(&reason),
        }
    }

    log::warn!(
        "⚠️ 拟合阶梯耗尽仍超预算 - best={} bytes budget={} attempts={}",
        run.best.byte_len(),
        config.max_bytes,
        run.attempts
    );

    let best = run.best.clone();
    run.finish(FitStatus::FittedAtFloor, best)
}

fn shrink(dimension: u32, step: f32) -> u32 {
    ((dimension as f64 * step as f64).round() as u32).max(MIN_DIMENSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// 按调用序号返回预设体积的假转码器。
    struct ScriptedTranscoder {
        sizes: Vec<Result<usize, NormalizeError>>,
        calls: Mutex<Vec<(u32, u32, f32, usize)>>,
    }

    impl ScriptedTranscoder {
        fn new(sizes: Vec<Result<usize, NormalizeError>>) -> Self {
            Self {
                sizes,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(u32, u32, f32, usize)> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    impl Transcode for ScriptedTranscoder {
        fn transcode(
            &self,
            bytes: &[u8],
            max_width: u32,
            max_height: u32,
            quality: f32,
        ) -> Result<EncodedVariant, NormalizeError> {
            let mut calls = self.calls.lock().expect("calls lock");
            let index = calls.len();
            calls.push((max_width, max_height, quality, bytes.len()));

            match self.sizes.get(index).cloned().unwrap_or(Ok(10_000)) {
                Ok(size) => Ok(EncodedVariant {
                    bytes: vec![0xAB; size],
                    width: max_width,
                    height: max_height,
                }),
                Err(err) => Err(err),
            }
        }
    }

    fn variant(size: usize) -> EncodedVariant {
        EncodedVariant {
            bytes: vec![0xCD; size],
            width: 4000,
            height: 3000,
        }
    }

    fn small_budget() -> FitConfig {
        FitConfig {
            max_bytes: 1_000,
            ..FitConfig::default()
        }
    }

    #[test]
    fn under_budget_input_returns_without_transcoding() {
        let transcoder = ScriptedTranscoder::new(vec![]);
        let result = fit(&transcoder, variant(500), &small_budget());

        assert_eq!(result.status, FitStatus::FittedUnderBudget);
        assert_eq!(result.attempts, 0);
        assert_eq!(result.variant.expect("variant").byte_len(), 500);
        assert!(transcoder.calls().is_empty());
    }

    #[test]
    fn zero_byte_input_aborts() {
        let transcoder = ScriptedTranscoder::new(vec![]);
        let result = fit(&transcoder, variant(0), &small_budget());

        assert_eq!(result.status, FitStatus::ConversionFailed);
        assert!(result.variant.is_none());
        assert!(transcoder.calls().is_empty());
    }

    #[test]
    fn quality_ladder_stops_at_first_fit() {
        let transcoder = ScriptedTranscoder::new(vec![Ok(5_000), Ok(3_000), Ok(900)]);
        let result = fit(&transcoder, variant(8_000), &small_budget());

        assert_eq!(result.status, FitStatus::FittedUnderBudget);
        assert_eq!(result.attempts, 3);

        let calls = transcoder.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(w, h, _, base)| (*w, *h) == (1200, 900) && *base == 8_000));
        assert!((calls[0].2 - 0.80).abs() < 1e-6);
        assert!((calls[1].2 - 0.75).abs() < 1e-6);
        assert!((calls[2].2 - 0.70).abs() < 1e-6);
    }

    #[test]
    fn downscale_ladder_refines_from_previous_output() {
        let config = small_budget();
        let ladder_len = config.quality_ladder().len();

        let mut sizes: Vec<Result<usize, NormalizeError>> = (0..ladder_len).map(|i| Ok(5_000 - i)).collect();
        sizes.push(Ok(3_000));
        sizes.push(Ok(2_000));
        sizes.push(Ok(800));
        let transcoder = ScriptedTranscoder::new(sizes);

        let result = fit(&transcoder, variant(8_000), &config);
        assert_eq!(result.status, FitStatus::FittedUnderBudget);
        assert_eq!(result.variant.expect("variant").byte_len(), 800);

        let calls = transcoder.calls();
        let phase2 = &calls[ladder_len..];
        assert_eq!(phase2.len(), 3);

        assert_eq!((phase2[0].0, phase2[0].1), (1032, 774));
        assert_eq!((phase2[1].0, phase2[1].1), (888, 666));
        // 第一轮以质量阶梯中最小的结果为输入，之后以上一轮输出为输入
        assert_eq!(phase2[0].3, 5_000 - (ladder_len - 1));
        assert_eq!(phase2[1].3, 3_000);
        assert_eq!(phase2[2].3, 2_000);
        assert!((phase2[0].2 - config.start_quality).abs() < 1e-6);
        assert!(phase2[1].2 < phase2[0].2);
    }

    #[test]
    fn exhausted_ladders_return_smallest_at_floor() {
        let config = small_budget();
        let transcoder = ScriptedTranscoder::new(vec![]);

        let result = fit(&transcoder, variant(50_000), &config);
        let expected_attempts = config.quality_ladder().len() as u32 + config.max_downscale_iterations;

        assert_eq!(result.status, FitStatus::FittedAtFloor);
        assert_eq!(result.attempts, expected_attempts);
        assert_eq!(result.variant.expect("variant").byte_len(), 10_000);
        assert_eq!(transcoder.calls().len() as u32, expected_attempts);
    }

    #[test]
    fn dimensions_never_drop_below_floor() {
        let config = FitConfig {
            max_bytes: 1_000,
            max_width: 150,
            max_height: 120,
            downscale_step: 0.5,
            ..FitConfig::default()
        };
        let transcoder = ScriptedTranscoder::new(vec![]);

        let _ = fit(&transcoder, variant(50_000), &config);

        for (w, h, _, _) in transcoder.calls() {
            assert!(w >= MIN_DIMENSION && h >= MIN_DIMENSION);
        }
    }

    #[test]
    fn failed_rung_is_skipped() {
        let transcoder = ScriptedTranscoder::new(vec![
            Err(NormalizeError::Encode("boom".into())),
            Ok(900),
        ]);
        let result = fit(&transcoder, variant(8_000), &small_budget());

        assert_eq!(result.status, FitStatus::FittedUnderBudget);
        assert_eq!(result.attempts, 2);
    }

    #[test]
    fn unreadable_input_aborts_whole_fit() {
        let transcoder = ScriptedTranscoder::new(vec![
            Err(NormalizeError::Decode("corrupt".into())),
            Ok(900),
        ]);
        let result = fit(&transcoder, variant(8_000), &small_budget());

        assert_eq!(result.status, FitStatus::ConversionFailed);
        assert!(result.variant.is_none());
        assert_eq!(transcoder.calls().len(), 1);
    }

    #[test]
    fn invalid_config_fails_without_transcoding() {
        let zero_step = FitConfig {
            quality_step: 0.0,
            ..small_budget()
        };
        let tiny_step = FitConfig {
            quality_step: 1e-6,
            ..small_budget()
        };

        for config in [zero_step, tiny_step] {
            let transcoder = ScriptedTranscoder::new(vec![]);
            let result = fit(&transcoder, variant(50_000), &config);

            assert_eq!(result.status, FitStatus::ConversionFailed);
            assert!(result.variant.is_none());
            assert_eq!(result.attempts, 0);
            assert!(transcoder.calls().is_empty());
        }
    }

    #[test]
    fn empty_rung_output_aborts() {
        let transcoder = ScriptedTranscoder::new(vec![Ok(0)]);
        let result = fit(&transcoder, variant(8_000), &small_budget());

        assert_eq!(result.status, FitStatus::ConversionFailed);
    }
}
