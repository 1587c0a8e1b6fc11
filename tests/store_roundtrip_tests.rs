//! Pipeline store round-trip tests
//!
//! The syntactic index law: a hit for (source, registry) resolves to a
//! stored image, and recompiling that source under the same registry
//! produces an image with the same structural hash. Changing the
//! registry fingerprint invalidates the index entry without touching
//! stored images.

use constellation::dag::structural_hash;
use constellation::{
    Config, Constellation, CValue, ModuleFailure, ModuleSignature, SemanticType,
};
use futures_util::FutureExt;
use std::collections::BTreeMap;
use std::sync::Arc;

fn echo_signature(version: &str) -> ModuleSignature {
    ModuleSignature {
        name: "echo".to_string(),
        module_name: "echo".to_string(),
        namespace: None,
        version: version.to_string(),
        params: vec![("value".to_string(), SemanticType::String)],
        returns: SemanticType::String,
    }
}

fn engine_with_echo(version: &str) -> Constellation {
    let mut engine = Constellation::new(Config::default());
    engine
        .register_module(
            echo_signature(version),
            Arc::new(|inputs: BTreeMap<String, CValue>| {
                async move {
                    inputs
                        .into_iter()
                        .next()
                        .map(|(_, v)| v)
                        .ok_or_else(|| ModuleFailure::new("echo", "no input"))
                }
                .boxed()
            }),
        )
        .expect("registry open");
    engine
}

const SOURCE: &str = "in s: String\nr = echo(s)\nout r";

#[test]
fn test_syntactic_index_round_trip() {
    let engine = engine_with_echo("1.0.0");
    let first = engine.compile(SOURCE).expect("compile");

    // Index hit resolves to the stored image...
    let syntactic = constellation::dag::syntactic_hash(SOURCE);
    let registry = engine.registry().registry_hash();
    let indexed = engine
        .store()
        .lookup_syntactic(&syntactic, &registry)
        .expect("index entry");
    assert_eq!(indexed, first.structural_hash);
    let image = engine.store().get(&indexed).expect("stored image");

    // ...and recompiling agrees with the stored hash
    let second = engine.compile(SOURCE).expect("compile");
    assert_eq!(second.structural_hash, indexed);
    assert_eq!(structural_hash(&image.spec), indexed);
}

#[test]
fn test_structural_hash_is_stable_across_engines() {
    // Fresh engines draw fresh UUIDs throughout compilation; the
    // canonical encoding erases them
    let a = engine_with_echo("1.0.0").compile(SOURCE).expect("compile");
    let b = engine_with_echo("1.0.0").compile(SOURCE).expect("compile");
    assert_eq!(a.structural_hash, b.structural_hash);
}

#[test]
fn test_registry_version_invalidates_the_index() {
    let v1 = engine_with_echo("1.0.0");
    let v2 = engine_with_echo("2.0.0");
    v1.compile(SOURCE).expect("compile");

    let syntactic = constellation::dag::syntactic_hash(SOURCE);
    assert!(v1
        .store()
        .lookup_syntactic(&syntactic, &v1.registry().registry_hash())
        .is_some());
    // The same source under a different registry fingerprint misses
    assert!(v1
        .store()
        .lookup_syntactic(&syntactic, &v2.registry().registry_hash())
        .is_none());
}

#[test]
fn test_whitespace_changes_miss_the_syntactic_index() {
    let engine = engine_with_echo("1.0.0");
    engine.compile(SOURCE).expect("compile");
    assert_eq!(engine.store().len(), 1);

    // Different text, same structure: the syntactic index misses but
    // the structural store deduplicates
    let reformatted = "in s: String\n\nr = echo(s)\nout r";
    let recompiled = engine.compile(reformatted).expect("compile");
    let original = engine.compile(SOURCE).expect("compile");
    assert_eq!(recompiled.structural_hash, original.structural_hash);
    assert_eq!(engine.store().len(), 1);
}

#[test]
fn test_module_versions_recorded_in_image() {
    let engine = engine_with_echo("3.1.4");
    let pipeline = engine.compile(SOURCE).expect("compile");
    assert_eq!(
        pipeline.image.module_versions.get("echo"),
        Some(&"3.1.4".to_string())
    );
    assert_eq!(
        pipeline.image.source_hash,
        constellation::dag::syntactic_hash(SOURCE)
    );
}
