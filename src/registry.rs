//! Function Registry
//!
//! Enumerates the modules a pipeline can call: per function a parameter
//! list, return type, runtime module name, optional namespace, and a
//! version. The registry also owns the async implementations invoked by
//! the scheduler, and produces the deterministic fingerprint used by the
//! pipeline store's syntactic index.

use crate::types::SemanticType;
use crate::value::CValue;
use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Failure of a single module invocation, before the resilience layer
/// gets a say.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("module '{module}' failed: {message}")]
pub struct ModuleFailure {
    pub module: String,
    pub message: String,
}

impl ModuleFailure {
    pub fn new(module: impl Into<String>, message: impl Into<String>) -> Self {
        ModuleFailure {
            module: module.into(),
            message: message.into(),
        }
    }
}

/// Async module implementation contract. Inputs arrive keyed by
/// parameter name; the output is a single value of the declared return
/// type.
pub trait ModuleImpl: Send + Sync {
    fn invoke(
        &self,
        inputs: BTreeMap<String, CValue>,
    ) -> BoxFuture<'static, Result<CValue, ModuleFailure>>;
}

impl<F> ModuleImpl for F
where
    F: Fn(BTreeMap<String, CValue>) -> BoxFuture<'static, Result<CValue, ModuleFailure>>
        + Send
        + Sync,
{
    fn invoke(
        &self,
        inputs: BTreeMap<String, CValue>,
    ) -> BoxFuture<'static, Result<CValue, ModuleFailure>> {
        self(inputs)
    }
}

/// Declared shape of a callable module.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSignature {
    /// Function name in the surface language
    pub name: String,
    /// Runtime module identifier (cache keys, limiter keys, tracing)
    pub module_name: String,
    pub namespace: Option<String>,
    pub version: String,
    /// Ordered parameters; call arguments bind positionally
    pub params: Vec<(String, SemanticType)>,
    pub returns: SemanticType,
}

impl ModuleSignature {
    /// Qualified surface name: `ns.func` or bare `func`.
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

/// The set of callable modules, with implementations.
#[derive(Default)]
pub struct FunctionRegistry {
    signatures: BTreeMap<String, ModuleSignature>,
    implementations: HashMap<String, Arc<dyn ModuleImpl>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module with its implementation. Re-registering a
    /// qualified name replaces the previous entry.
    pub fn register(&mut self, signature: ModuleSignature, implementation: Arc<dyn ModuleImpl>) {
        self.implementations
            .insert(signature.module_name.clone(), implementation);
        self.signatures
            .insert(signature.qualified_name(), signature);
    }

    /// Look up by qualified surface name (`ns.func` or bare `func`).
    pub fn lookup(&self, qualified: &str) -> Option<&ModuleSignature> {
        self.signatures.get(qualified)
    }

    /// True if any registered function lives in `namespace`.
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.signatures
            .values()
            .any(|s| s.namespace.as_deref() == Some(namespace))
    }

    pub fn implementation(&self, module_name: &str) -> Option<Arc<dyn ModuleImpl>> {
        self.implementations.get(module_name).cloned()
    }

    /// All signatures, in qualified-name order.
    pub fn signatures(&self) -> impl Iterator<Item = &ModuleSignature> {
        self.signatures.values()
    }

    /// Deterministic fingerprint over names, signatures, and versions.
    ///
    /// `BTreeMap` iteration gives a stable row order; two registries
    /// with the same modules fingerprint identically regardless of
    /// registration order.
    pub fn registry_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (qualified, sig) in &self.signatures {
            hasher.update(qualified.as_bytes());
            hasher.update(b"|");
            hasher.update(sig.module_name.as_bytes());
            hasher.update(b"|");
            hasher.update(sig.version.as_bytes());
            hasher.update(b"|");
            for (param, ty) in &sig.params {
                hasher.update(param.as_bytes());
                hasher.update(b":");
                hasher.update(ty.render().as_bytes());
                hasher.update(b",");
            }
            hasher.update(b"->");
            hasher.update(sig.returns.render().as_bytes());
            hasher.update(b"\n");
        }
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for b in digest {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("signatures", &self.signatures.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn echo_impl() -> Arc<dyn ModuleImpl> {
        Arc::new(|inputs: BTreeMap<String, CValue>| {
            async move {
                inputs
                    .into_iter()
                    .next()
                    .map(|(_, v)| v)
                    .ok_or_else(|| ModuleFailure::new("echo", "no input"))
            }
            .boxed()
        })
    }

    fn sig(name: &str, namespace: Option<&str>) -> ModuleSignature {
        ModuleSignature {
            name: name.to_string(),
            module_name: format!("{name}-module"),
            namespace: namespace.map(ToString::to_string),
            version: "1.0.0".to_string(),
            params: vec![("value".to_string(), SemanticType::String)],
            returns: SemanticType::String,
        }
    }

    #[test]
    fn test_qualified_lookup() {
        let mut registry = FunctionRegistry::new();
        registry.register(sig("concat", None), echo_impl());
        registry.register(sig("upper", Some("text")), echo_impl());

        assert!(registry.lookup("concat").is_some());
        assert!(registry.lookup("text.upper").is_some());
        assert!(registry.lookup("upper").is_none());
        assert!(registry.has_namespace("text"));
        assert!(!registry.has_namespace("math"));
    }

    #[test]
    fn test_registry_hash_is_order_independent() {
        let mut a = FunctionRegistry::new();
        a.register(sig("f", None), echo_impl());
        a.register(sig("g", None), echo_impl());

        let mut b = FunctionRegistry::new();
        b.register(sig("g", None), echo_impl());
        b.register(sig("f", None), echo_impl());

        assert_eq!(a.registry_hash(), b.registry_hash());
    }

    #[test]
    fn test_registry_hash_tracks_signatures() {
        let mut a = FunctionRegistry::new();
        a.register(sig("f", None), echo_impl());

        let mut changed = sig("f", None);
        changed.returns = SemanticType::Int;
        let mut b = FunctionRegistry::new();
        b.register(changed, echo_impl());

        assert_ne!(a.registry_hash(), b.registry_hash());
    }

    #[tokio::test]
    async fn test_invocation() {
        let mut registry = FunctionRegistry::new();
        registry.register(sig("echo", None), echo_impl());
        let implementation = registry.implementation("echo-module").expect("registered");

        let mut inputs = BTreeMap::new();
        inputs.insert("value".to_string(), CValue::String("hi".to_string()));
        let out = implementation.invoke(inputs).await.unwrap();
        assert_eq!(out, CValue::String("hi".to_string()));
    }
}
