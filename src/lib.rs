//! # Constellation
//!
//! A typed dataflow pipeline language and runtime. Pipeline source
//! declares inputs, intermediate bindings, and outputs over typed module
//! calls; the compiler produces a content-addressed executable image and
//! the runtime orchestrates concurrent evaluation with per-call
//! resilience options (retry, timeout, cache, fallback, throttle,
//! concurrency, priority, lazy, backoff, on-error).
//!
//! ## Pipeline Architecture
//!
//! ```text
//! source text
//!     ↓
//! [Parser]            → AST
//!     ↓
//! [Type Checker]      → typed AST (registry-resolved, option-validated)
//!     ↓
//! [IR Generator]      → IR DAG (closures captured, options normalized)
//!     ↓
//! [IR Optimizer]      → folded + pruned + deduplicated IR
//!     ↓
//! [DAG Compiler]      → DagSpec (data/module nodes, edges, inline transforms)
//!     ↓
//! [Pipeline Store]    → content-addressed image, syntactic index
//!     ↓
//! inputs → [Scheduler] → outputs / suspension
//!               ↓
//!     [Module Options Executor] wraps each module call
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use constellation::{Config, Constellation};
//!
//! let mut engine = Constellation::new(Config::default());
//! engine.register_module(signature, implementation)?;
//!
//! let pipeline = engine.compile(
//!     "in name: String\n\
//!      greeting = concat(\"Hello, \", name)\n\
//!      out greeting",
//! )?;
//!
//! let signal = engine
//!     .run(&pipeline, [("name".into(), "Alice".into_cvalue())].into())
//!     .await;
//! ```
//!
//! Compiling the same source under the same module registry returns the
//! cached image in constant time via the syntactic index; structurally
//! identical pipelines share one image regardless of how they were
//! written.

pub mod ast;
pub mod config;
pub mod dag;
pub mod error;
pub mod ir;
pub mod parser;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod typecheck;
pub mod types;
pub mod value;

pub use config::{init_logging, Config};
pub use dag::{DagSpec, PipelineImage};
pub use error::{CompileError, ErrorCategory, SourceLocation};
pub use registry::{FunctionRegistry, ModuleFailure, ModuleImpl, ModuleSignature};
pub use runtime::{PipelineRuntime, RunStatus, RuntimeError, Signal};
pub use store::PipelineStore;
pub use types::SemanticType;
pub use value::{CType, CValue, FromCValue, IntoCValue};

use crate::dag::{compile_dag, syntactic_hash};
use crate::ir::{generate_ir, Optimizer};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use uuid::Uuid;

/// Engine-level failures outside the compile/run paths.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("modules cannot be registered after the runtime has started")]
    RegistryFrozen,
}

/// A compiled pipeline ready to run.
#[derive(Debug, Clone)]
pub struct LoadedPipeline {
    pub image: Arc<PipelineImage>,
    pub structural_hash: String,
}

/// The engine facade: owns the module registry, the pipeline store, and
/// the runtime instance. The cache backend, limiter registry, and store
/// are dependency-injected into the runtime; nothing is process-global.
pub struct Constellation {
    config: Config,
    registry: Arc<FunctionRegistry>,
    store: PipelineStore,
    runtime: OnceLock<PipelineRuntime>,
}

impl Constellation {
    pub fn new(config: Config) -> Self {
        Constellation {
            config,
            registry: Arc::new(FunctionRegistry::new()),
            store: PipelineStore::new(),
            runtime: OnceLock::new(),
        }
    }

    /// Register a callable module. Registration closes once the first
    /// run starts (the runtime holds the registry from then on).
    pub fn register_module(
        &mut self,
        signature: ModuleSignature,
        implementation: Arc<dyn ModuleImpl>,
    ) -> Result<(), EngineError> {
        let registry =
            Arc::get_mut(&mut self.registry).ok_or(EngineError::RegistryFrozen)?;
        registry.register(signature, implementation);
        Ok(())
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &PipelineStore {
        &self.store
    }

    fn runtime(&self) -> &PipelineRuntime {
        self.runtime.get_or_init(|| {
            PipelineRuntime::new(Arc::clone(&self.registry), self.config.runtime.clone())
        })
    }

    /// Compile source into a pipeline, consulting the syntactic index
    /// first: a hit under the current registry fingerprint skips
    /// parsing, checking, and compilation entirely.
    pub fn compile(&self, source: &str) -> Result<LoadedPipeline, Vec<CompileError>> {
        let source_hash = syntactic_hash(source);
        let registry_hash = self.registry.registry_hash();

        if let Some(hash) = self.store.lookup_syntactic(&source_hash, &registry_hash) {
            if let Some(image) = self.store.get(&hash) {
                tracing::debug!(hash = %hash, "syntactic_index_hit");
                return Ok(LoadedPipeline {
                    image,
                    structural_hash: hash,
                });
            }
        }

        let program = parser::parse_program(source)?;
        let typed = typecheck::check_program(&program, &self.registry)?;
        let ir = generate_ir(&typed).map_err(|e| vec![e])?;
        let ir = Optimizer::new().optimize(ir);
        let spec = compile_dag(&ir, Some(&self.registry)).map_err(|e| vec![e])?;

        let module_versions = self
            .registry
            .signatures()
            .map(|sig| (sig.module_name.clone(), sig.version.clone()))
            .collect();
        let image = PipelineImage {
            name: None,
            source_hash: source_hash.clone(),
            created_at_ms: None,
            spec,
            module_versions,
        };
        let hash = self.store.store(image);
        self.store
            .put_syntactic_index(source_hash, registry_hash, hash.clone());
        let image = self
            .store
            .get(&hash)
            .expect("image stored a moment ago");
        Ok(LoadedPipeline {
            image,
            structural_hash: hash,
        })
    }

    /// Bind a human name to a compiled pipeline in the store.
    pub fn alias(&self, name: impl Into<String>, pipeline: &LoadedPipeline) {
        self.store.alias(name, pipeline.structural_hash.clone());
    }

    /// Load a previously aliased pipeline.
    pub fn get_by_name(&self, name: &str) -> Option<LoadedPipeline> {
        let hash = self.store.resolve(name)?;
        let image = self.store.get(&hash)?;
        Some(LoadedPipeline {
            image,
            structural_hash: hash,
        })
    }

    /// Execute a pipeline with the given inputs.
    pub async fn run(
        &self,
        pipeline: &LoadedPipeline,
        inputs: BTreeMap<String, CValue>,
    ) -> Signal {
        self.runtime()
            .run(Arc::clone(&pipeline.image), inputs)
            .await
    }

    /// Resume a suspended execution with supplemental inputs.
    pub async fn resume(
        &self,
        execution_id: Uuid,
        inputs: BTreeMap<String, CValue>,
    ) -> Signal {
        self.runtime().resume(execution_id, inputs).await
    }

    /// Cancel a running or suspended execution.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        self.runtime().cancel(execution_id)
    }

    /// Ids of runs currently executing or suspended.
    pub fn executions(&self) -> Vec<Uuid> {
        self.runtime().executions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn engine_with_concat() -> Constellation {
        let mut engine = Constellation::new(Config::default());
        engine
            .register_module(
                ModuleSignature {
                    name: "concat".to_string(),
                    module_name: "concat".to_string(),
                    namespace: None,
                    version: "1.0.0".to_string(),
                    params: vec![
                        ("left".to_string(), SemanticType::String),
                        ("right".to_string(), SemanticType::String),
                    ],
                    returns: SemanticType::String,
                },
                Arc::new(|inputs: BTreeMap<String, CValue>| {
                    async move {
                        let left = match inputs.get("left") {
                            Some(CValue::String(s)) => s.clone(),
                            _ => return Err(ModuleFailure::new("concat", "bad left")),
                        };
                        let right = match inputs.get("right") {
                            Some(CValue::String(s)) => s.clone(),
                            _ => return Err(ModuleFailure::new("concat", "bad right")),
                        };
                        Ok(CValue::String(format!("{left}{right}")))
                    }
                    .boxed()
                }),
            )
            .expect("registry open");
        engine
    }

    #[test]
    fn test_compile_populates_the_syntactic_index() {
        let engine = engine_with_concat();
        let source = "in name: String\ngreeting = concat(\"Hello, \", name)\nout greeting";
        let first = engine.compile(source).expect("compile");

        // Second compile short-circuits through the index to the same
        // image
        let second = engine.compile(source).expect("compile");
        assert_eq!(first.structural_hash, second.structural_hash);
        assert!(Arc::ptr_eq(&first.image, &second.image));
        assert_eq!(engine.store().len(), 1);
    }

    #[test]
    fn test_compile_errors_are_reported() {
        let engine = engine_with_concat();
        let errors = engine.compile("x = missing\nout x").unwrap_err();
        assert_eq!(errors[0].code(), "E003");
    }

    #[tokio::test]
    async fn test_end_to_end_hello() {
        let engine = engine_with_concat();
        let pipeline = engine
            .compile("in name: String\ngreeting = concat(\"Hello, \", name)\nout greeting")
            .expect("compile");

        let mut inputs = BTreeMap::new();
        inputs.insert("name".to_string(), CValue::String("Alice".to_string()));
        let signal = engine.run(&pipeline, inputs).await;

        assert_eq!(signal.status, RunStatus::Completed);
        assert_eq!(
            signal.outputs.get("greeting"),
            Some(&CValue::String("Hello, Alice".to_string()))
        );
    }

    #[test]
    fn test_alias_round_trip() {
        let engine = engine_with_concat();
        let pipeline = engine
            .compile("x = concat(\"a\", \"b\")\nout x")
            .expect("compile");
        engine.alias("greeter", &pipeline);
        let loaded = engine.get_by_name("greeter").expect("aliased");
        assert_eq!(loaded.structural_hash, pipeline.structural_hash);
    }
}
