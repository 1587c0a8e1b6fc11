//! Module-call option validation.
//!
//! Applies the per-option value rules (`retry >= 0`, positive durations,
//! rate counts, named strategies), checks the fallback expression
//! against the module return type, and validates streaming-option
//! combinations. Produces the normalized [`TypedOptions`] image.

use super::{Checker, TypedOptions};
use crate::ast::{CallOption, OptionValue};
use crate::error::CompileError;
use crate::ir::{BackoffStrategy, ErrorStrategy, PriorityLevel};
use crate::types::{is_subtype, SemanticType};
use std::collections::HashSet;

impl Checker<'_> {
    pub(crate) fn validate_options(
        &mut self,
        options: &[CallOption],
        return_ty: &SemanticType,
    ) -> TypedOptions {
        let mut out = TypedOptions::default();
        let mut seen: HashSet<&str> = HashSet::new();

        for option in options {
            let name = option.name.as_str();
            if !seen.insert(name) {
                self.err(CompileError::InvalidOptionValue {
                    option: option.name.clone(),
                    reason: "specified more than once".to_string(),
                    location: Some(option.span),
                });
                continue;
            }

            match name {
                "retry" => {
                    if let Some(n) = self.expect_int(option, "a non-negative integer") {
                        if n < 0 {
                            self.invalid(option, "retry must be >= 0");
                        } else {
                            out.retry = Some(n as u32);
                        }
                    }
                }
                "timeout" => out.timeout_ms = self.expect_positive_duration(option),
                "delay" => out.delay_ms = self.expect_positive_duration(option),
                "cache" => out.cache_ttl_ms = self.expect_positive_duration(option),
                "concurrency" => {
                    if let Some(n) = self.expect_int(option, "a positive integer") {
                        if n <= 0 {
                            self.invalid(option, "concurrency must be > 0");
                        } else {
                            out.concurrency = Some(n as u32);
                        }
                    }
                }
                "throttle" => match &option.value {
                    OptionValue::Rate { count, window_ms } => {
                        if *count == 0 {
                            self.invalid(option, "throttle count must be > 0");
                        } else if *window_ms == 0 {
                            self.invalid(option, "throttle window must be > 0");
                        } else {
                            out.throttle = Some((*count, *window_ms));
                        }
                    }
                    other => self.invalid(
                        option,
                        &format!("expected a rate like 5/1s, found {}", other.describe()),
                    ),
                },
                "backoff" => match &option.value {
                    OptionValue::Ident(strategy) => match strategy.as_str() {
                        "fixed" => out.backoff = BackoffStrategy::Fixed,
                        "linear" => out.backoff = BackoffStrategy::Linear,
                        "exponential" => out.backoff = BackoffStrategy::Exponential,
                        other => self.invalid(
                            option,
                            &format!("unknown backoff strategy '{other}' (fixed, linear, exponential)"),
                        ),
                    },
                    other => self.invalid(
                        option,
                        &format!("expected a strategy name, found {}", other.describe()),
                    ),
                },
                "on_error" => match &option.value {
                    OptionValue::Ident(policy) => match policy.as_str() {
                        "fail" => out.on_error = ErrorStrategy::Fail,
                        "skip" => out.on_error = ErrorStrategy::Skip,
                        "log" => out.on_error = ErrorStrategy::Log,
                        "wrap" => out.on_error = ErrorStrategy::Wrap,
                        other => self.invalid(
                            option,
                            &format!("unknown error policy '{other}' (fail, skip, log, wrap)"),
                        ),
                    },
                    other => self.invalid(
                        option,
                        &format!("expected a policy name, found {}", other.describe()),
                    ),
                },
                "lazy" => match &option.value {
                    OptionValue::Bool(b) => out.lazy = *b,
                    other => self.invalid(
                        option,
                        &format!("expected true or false, found {}", other.describe()),
                    ),
                },
                "priority" => match &option.value {
                    OptionValue::Ident(level) => match PriorityLevel::parse(level) {
                        Some(level) => out.priority = Some(level.value()),
                        None => self.invalid(
                            option,
                            &format!(
                                "unknown priority '{level}' (critical, high, normal, low, background, or 0..=100)"
                            ),
                        ),
                    },
                    // Integers are used directly, clamped to the scale
                    OptionValue::Int(n) => out.priority = Some((*n).clamp(0, 100) as u8),
                    other => self.invalid(
                        option,
                        &format!("expected a priority, found {}", other.describe()),
                    ),
                },
                "cache_backend" => match &option.value {
                    OptionValue::String(backend) => {
                        out.cache_backend = Some(backend.clone());
                    }
                    other => self.invalid(
                        option,
                        &format!("expected a backend name string, found {}", other.describe()),
                    ),
                },
                "fallback" => match &option.value {
                    OptionValue::Expr(expr) => {
                        let typed = self.infer(expr, Some(return_ty));
                        if !is_subtype(&typed.ty, return_ty) {
                            self.err(CompileError::FallbackTypeMismatch {
                                expected: return_ty.render(),
                                found: typed.ty.render(),
                                location: Some(option.span),
                            });
                        }
                        out.fallback = Some(Box::new(typed));
                    }
                    other => self.invalid(
                        option,
                        &format!("expected an expression, found {}", other.describe()),
                    ),
                },
                "batch" => {
                    if let Some(n) = self.expect_int(option, "a positive batch size") {
                        if n <= 0 {
                            self.invalid(option, "batch must be > 0");
                        } else {
                            out.streaming.batch = Some(n as u64);
                        }
                    }
                }
                "window" => out.streaming.window_ms = self.expect_positive_duration(option),
                "join" => match &option.value {
                    OptionValue::Ident(strategy) => match strategy.as_str() {
                        "inner" | "left" | "full" => {
                            out.streaming.join = Some(strategy.clone());
                        }
                        other => self.invalid(
                            option,
                            &format!("unknown join strategy '{other}' (inner, left, full)"),
                        ),
                    },
                    other => self.invalid(
                        option,
                        &format!("expected a join strategy, found {}", other.describe()),
                    ),
                },
                "checkpoint" => {
                    out.streaming.checkpoint_ms = self.expect_positive_duration(option);
                }
                other => self.invalid(option, &format!("unknown option '{other}'")),
            }
        }

        // Streaming combination rules
        if out.streaming.batch.is_some() && out.streaming.window_ms.is_some() {
            if let Some(option) = options.iter().find(|o| o.name == "window") {
                self.invalid(option, "batch and window are mutually exclusive");
            }
        }
        if out.streaming.join.is_some() && out.streaming.window_ms.is_none() {
            if let Some(option) = options.iter().find(|o| o.name == "join") {
                self.invalid(option, "join requires a window");
            }
        }

        out
    }

    fn invalid(&mut self, option: &CallOption, reason: &str) {
        self.err(CompileError::InvalidOptionValue {
            option: option.name.clone(),
            reason: reason.to_string(),
            location: Some(option.span),
        });
    }

    fn expect_int(&mut self, option: &CallOption, expected: &str) -> Option<i64> {
        match &option.value {
            OptionValue::Int(n) => Some(*n),
            other => {
                self.invalid(
                    option,
                    &format!("expected {expected}, found {}", other.describe()),
                );
                None
            }
        }
    }

    fn expect_positive_duration(&mut self, option: &CallOption) -> Option<u64> {
        match &option.value {
            OptionValue::Duration { ms } if *ms > 0 => Some(*ms),
            OptionValue::Duration { .. } => {
                self.invalid(option, "duration must be > 0");
                None
            }
            other => {
                self.invalid(
                    option,
                    &format!("expected a duration like 500ms, found {}", other.describe()),
                );
                None
            }
        }
    }
}
