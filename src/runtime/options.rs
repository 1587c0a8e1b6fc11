//! Module-options execution layer.
//!
//! Composes the per-call resilience strategies around a module
//! invocation, outermost to innermost: concurrency limit, throttle,
//! cache, timeout, retry with backoff, fallback, error policy. The two
//! outermost layers of the full stack live elsewhere: laziness and
//! priority are scheduler concerns (the task defers on demand and the
//! worker pool orders by priority) before this function runs.

use super::cache::{cache_key, CacheBackend};
use super::limits::LimiterRegistry;
use super::{CancelToken, RuntimeError};
use crate::ir::{ErrorStrategy, IRModuleCallOptions};
use crate::registry::ModuleImpl;
use crate::value::{canonical_input_hash, CType, CValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// One module invocation plus everything its option image needs.
pub struct ModuleExecution<'a> {
    pub module_name: &'a str,
    pub implementation: Arc<dyn ModuleImpl>,
    pub inputs: BTreeMap<String, CValue>,
    pub options: &'a IRModuleCallOptions,
    /// Resolved fallback value, if the call configured one
    pub fallback: Option<CValue>,
    pub output_type: &'a CType,
}

/// Run a module through its resilience stack.
pub async fn execute_with_options(
    execution: ModuleExecution<'_>,
    cache: &dyn CacheBackend,
    limiters: &LimiterRegistry,
    cancel: &CancelToken,
) -> Result<CValue, RuntimeError> {
    let ModuleExecution {
        module_name,
        implementation,
        inputs,
        options,
        fallback,
        output_type,
    } = execution;

    // Concurrency: per-module-name semaphore
    let _permit = match options.concurrency {
        Some(limit) => {
            let semaphore = limiters.semaphore(module_name, limit);
            Some(
                semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| RuntimeError::Internal("limiter semaphore closed".into()))?,
            )
        }
        None => None,
    };

    // Throttle: token bucket per module name
    if let Some((count, window_ms)) = options.throttle {
        let bucket = limiters.bucket(module_name, count, Duration::from_millis(window_ms));
        tokio::select! {
            () = bucket.acquire() => {}
            () = cancel.cancelled() => return Err(RuntimeError::Cancelled),
        }
    }

    // Cache: keyed by module name and canonical input hash
    let cache_entry_key = options
        .cache_ttl_ms
        .map(|_| cache_key(module_name, &canonical_input_hash(&inputs)));
    if let Some(key) = &cache_entry_key {
        if let Some(value) = cache.get(key) {
            tracing::debug!(module = module_name, "module_cache_hit");
            return Ok(value);
        }
        tracing::debug!(module = module_name, "module_cache_miss");
    }

    // Timeout + retry with backoff; attempts are strictly sequential
    let attempts = 1 + options.retry.unwrap_or(0);
    let mut last_error = RuntimeError::ModuleFailed {
        module: module_name.to_string(),
        message: "module did not run".to_string(),
        cause: None,
    };

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        tracing::debug!(module = module_name, attempt, "module_attempt");

        let invocation = implementation.invoke(inputs.clone());
        let outcome = match options.timeout_ms {
            Some(timeout_ms) => {
                tokio::select! {
                    result = tokio::time::timeout(
                        Duration::from_millis(timeout_ms),
                        invocation,
                    ) => match result {
                        Ok(inner) => inner.map_err(|e| RuntimeError::ModuleFailed {
                            module: module_name.to_string(),
                            message: e.message,
                            cause: None,
                        }),
                        Err(_) => Err(RuntimeError::Timeout {
                            module: module_name.to_string(),
                            timeout_ms,
                        }),
                    },
                    () = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                }
            }
            None => {
                tokio::select! {
                    result = invocation => result.map_err(|e| RuntimeError::ModuleFailed {
                        module: module_name.to_string(),
                        message: e.message,
                        cause: None,
                    }),
                    () = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                }
            }
        };

        match outcome {
            Ok(value) => {
                let found = value.ctype();
                if found != *output_type {
                    return Err(RuntimeError::OutputTypeMismatch {
                        module: module_name.to_string(),
                        expected: output_type.render(),
                        found: found.render(),
                    });
                }
                if let Some(key) = cache_entry_key {
                    let ttl = Duration::from_millis(
                        options.cache_ttl_ms.expect("key implies ttl"),
                    );
                    cache.put(key, value.clone(), ttl);
                }
                return Ok(value);
            }
            Err(error) => {
                tracing::debug!(
                    module = module_name,
                    attempt,
                    error = %error,
                    "module_attempt_failed"
                );
                last_error = error;
                if attempt < attempts {
                    let base = options.delay_ms.unwrap_or(0);
                    let delay = base.saturating_mul(options.backoff.factor(attempt));
                    if delay > 0 {
                        tokio::select! {
                            () = tokio::time::sleep(Duration::from_millis(delay)) => {}
                            () = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                        }
                    }
                }
            }
        }
    }

    // Fallback wins over the error policy
    if let Some(value) = fallback {
        tracing::debug!(module = module_name, "module_fallback_used");
        return Ok(value);
    }

    apply_error_policy(module_name, options.on_error, output_type, last_error)
}

fn apply_error_policy(
    module_name: &str,
    policy: ErrorStrategy,
    output_type: &CType,
    error: RuntimeError,
) -> Result<CValue, RuntimeError> {
    match policy {
        ErrorStrategy::Fail => Err(error),
        ErrorStrategy::Skip => Ok(output_type.zero_value()),
        ErrorStrategy::Log => {
            tracing::warn!(module = module_name, error = %error, "module_error_skipped");
            Ok(output_type.zero_value())
        }
        ErrorStrategy::Wrap => {
            // Wraps into the output union when it has a string-typed
            // variant; otherwise the error propagates unchanged.
            if let CType::Union(variants) = output_type {
                if let Some((tag, _)) =
                    variants.iter().find(|(_, ty)| **ty == CType::String)
                {
                    return Ok(CValue::Union {
                        tag: tag.clone(),
                        value: Box::new(CValue::String(error.to_string())),
                        variants: variants.clone(),
                    });
                }
            }
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModuleFailure;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky(succeed_on: u32) -> (Arc<dyn ModuleImpl>, Arc<AtomicU32>) {
        let counter = Arc::new(AtomicU32::new(0));
        let shared = Arc::clone(&counter);
        let implementation: Arc<dyn ModuleImpl> =
            Arc::new(move |_inputs: BTreeMap<String, CValue>| {
                let count = shared.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if count >= succeed_on {
                        Ok(CValue::String(format!("attempt-{count}")))
                    } else {
                        Err(ModuleFailure::new("flaky", "boom"))
                    }
                }
                .boxed()
            });
        (implementation, counter)
    }

    fn execution<'a>(
        implementation: &'a Arc<dyn ModuleImpl>,
        options: &'a IRModuleCallOptions,
        fallback: Option<CValue>,
        output_type: &'a CType,
    ) -> ModuleExecution<'a> {
        let mut inputs = BTreeMap::new();
        inputs.insert("value".to_string(), CValue::String("in".to_string()));
        ModuleExecution {
            module_name: "flaky",
            implementation: Arc::clone(implementation),
            inputs,
            options,
            fallback,
            output_type,
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let (implementation, counter) = flaky(3);
        let options = IRModuleCallOptions {
            retry: Some(3),
            delay_ms: Some(1),
            ..IRModuleCallOptions::default()
        };
        let cache = super::super::cache::InMemoryCache::new();
        let limiters = LimiterRegistry::new();
        let cancel = CancelToken::new();

        let out = execute_with_options(
            execution(&implementation, &options, None, &CType::String),
            &cache,
            &limiters,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(out, CValue::String("attempt-3".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fallback_after_exhausted_retries() {
        let (implementation, counter) = flaky(u32::MAX);
        let options = IRModuleCallOptions {
            retry: Some(2),
            ..IRModuleCallOptions::default()
        };
        let cache = super::super::cache::InMemoryCache::new();
        let limiters = LimiterRegistry::new();
        let cancel = CancelToken::new();

        let out = execute_with_options(
            execution(
                &implementation,
                &options,
                Some(CValue::String("dflt".to_string())),
                &CType::String,
            ),
            &cache,
            &limiters,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(out, CValue::String("dflt".to_string()));
        // Initial attempt plus two retries
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_skip_policy_returns_zero_value() {
        let (implementation, _) = flaky(u32::MAX);
        let options = IRModuleCallOptions {
            on_error: ErrorStrategy::Skip,
            ..IRModuleCallOptions::default()
        };
        let cache = super::super::cache::InMemoryCache::new();
        let limiters = LimiterRegistry::new();
        let cancel = CancelToken::new();

        let out = execute_with_options(
            execution(&implementation, &options, None, &CType::String),
            &cache,
            &limiters,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(out, CValue::String(String::new()));
    }

    #[tokio::test]
    async fn test_cache_is_input_sensitive() {
        let (implementation, counter) = flaky(1);
        let options = IRModuleCallOptions {
            cache_ttl_ms: Some(60_000),
            ..IRModuleCallOptions::default()
        };
        let cache = super::super::cache::InMemoryCache::new();
        let limiters = LimiterRegistry::new();
        let cancel = CancelToken::new();

        let call = |input: &str| {
            let mut inputs = BTreeMap::new();
            inputs.insert("value".to_string(), CValue::String(input.to_string()));
            ModuleExecution {
                module_name: "flaky",
                implementation: Arc::clone(&implementation),
                inputs,
                options: &options,
                fallback: None,
                output_type: &CType::String,
            }
        };

        execute_with_options(call("hello"), &cache, &limiters, &cancel)
            .await
            .unwrap();
        execute_with_options(call("hello"), &cache, &limiters, &cancel)
            .await
            .unwrap();
        execute_with_options(call("world"), &cache, &limiters, &cancel)
            .await
            .unwrap();
        // Second "hello" call hit the cache
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let implementation: Arc<dyn ModuleImpl> =
            Arc::new(|_inputs: BTreeMap<String, CValue>| {
                async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(CValue::Int(1))
                }
                .boxed()
            });
        let options = IRModuleCallOptions {
            timeout_ms: Some(10),
            ..IRModuleCallOptions::default()
        };
        let cache = super::super::cache::InMemoryCache::new();
        let limiters = LimiterRegistry::new();
        let cancel = CancelToken::new();

        let mut inputs = BTreeMap::new();
        inputs.insert("x".to_string(), CValue::Int(0));
        let err = execute_with_options(
            ModuleExecution {
                module_name: "slow",
                implementation,
                inputs,
                options: &options,
                fallback: None,
                output_type: &CType::Int,
            },
            &cache,
            &limiters,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { timeout_ms: 10, .. }));
    }

    #[tokio::test]
    async fn test_wrap_policy_uses_string_variant() {
        let (implementation, _) = flaky(u32::MAX);
        let mut variants = std::collections::BTreeMap::new();
        variants.insert("Int".to_string(), CType::Int);
        variants.insert("String".to_string(), CType::String);
        let output_type = CType::Union(variants);

        let options = IRModuleCallOptions {
            on_error: ErrorStrategy::Wrap,
            ..IRModuleCallOptions::default()
        };
        let cache = super::super::cache::InMemoryCache::new();
        let limiters = LimiterRegistry::new();
        let cancel = CancelToken::new();

        let out = execute_with_options(
            execution(&implementation, &options, None, &output_type),
            &cache,
            &limiters,
            &cancel,
        )
        .await
        .unwrap();
        match out {
            CValue::Union { tag, value, .. } => {
                assert_eq!(tag, "String");
                assert!(matches!(*value, CValue::String(_)));
            }
            other => panic!("expected wrapped union, got {other}"),
        }
    }
}
