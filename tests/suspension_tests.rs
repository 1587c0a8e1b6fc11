//! Suspension, resumption, and cancellation tests
//!
//! A run missing top-level inputs reports `Suspended` with the missing
//! name/type map and keeps its state; resuming with the inputs finishes
//! the run, reusing every already-completed cell. Cancellation stops
//! in-flight work cooperatively.

use constellation::{
    Config, Constellation, CType, CValue, ModuleFailure, ModuleSignature, RunStatus,
    SemanticType,
};
use futures_util::FutureExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn engine_with_upper() -> (Constellation, Arc<AtomicU32>) {
    let counter = Arc::new(AtomicU32::new(0));
    let shared = Arc::clone(&counter);
    let mut engine = Constellation::new(Config::default());
    engine
        .register_module(
            ModuleSignature {
                name: "upper".to_string(),
                module_name: "upper".to_string(),
                namespace: None,
                version: "1.0.0".to_string(),
                params: vec![("value".to_string(), SemanticType::String)],
                returns: SemanticType::String,
            },
            Arc::new(move |inputs: BTreeMap<String, CValue>| {
                shared.fetch_add(1, Ordering::SeqCst);
                async move {
                    match inputs.get("value") {
                        Some(CValue::String(s)) => Ok(CValue::String(s.to_uppercase())),
                        _ => Err(ModuleFailure::new("upper", "expected a string")),
                    }
                }
                .boxed()
            }),
        )
        .expect("registry open");
    (engine, counter)
}

fn one_input(name: &str, value: CValue) -> BTreeMap<String, CValue> {
    let mut inputs = BTreeMap::new();
    inputs.insert(name.to_string(), value);
    inputs
}

#[tokio::test]
async fn test_run_without_input_suspends() {
    let (engine, _) = engine_with_upper();
    let pipeline = engine
        .compile("in email: String\nnormalized = upper(email)\nout normalized")
        .expect("compile");

    let signal = engine.run(&pipeline, BTreeMap::new()).await;
    assert_eq!(signal.status, RunStatus::Suspended);
    assert_eq!(signal.missing.get("email"), Some(&CType::String));
    assert!(signal.outputs.is_empty());

    // Resuming with the missing input completes the run
    let resumed = engine
        .resume(
            signal.execution_id,
            one_input("email", CValue::String("a@b".to_string())),
        )
        .await;
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(
        resumed.outputs.get("normalized"),
        Some(&CValue::String("A@B".to_string()))
    );
}

#[tokio::test]
async fn test_partial_inputs_complete_what_they_can() {
    let (engine, counter) = engine_with_upper();
    let pipeline = engine
        .compile(
            "in first: String\nin second: String\n\
             a = upper(first)\n\
             b = upper(second)\n\
             out a\nout b",
        )
        .expect("compile");

    let signal = engine
        .run(&pipeline, one_input("first", CValue::String("x".to_string())))
        .await;
    assert_eq!(signal.status, RunStatus::Suspended);
    assert_eq!(signal.missing.len(), 1);
    assert_eq!(signal.missing.get("second"), Some(&CType::String));
    // The unblocked half already ran
    assert_eq!(
        signal.outputs.get("a"),
        Some(&CValue::String("X".to_string()))
    );
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let resumed = engine
        .resume(
            signal.execution_id,
            one_input("second", CValue::String("y".to_string())),
        )
        .await;
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(
        resumed.outputs.get("b"),
        Some(&CValue::String("Y".to_string()))
    );
    // 'a' was not recomputed on resume
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_resume_matches_a_fully_supplied_run() {
    let (engine, _) = engine_with_upper();
    let pipeline = engine
        .compile(
            "in first: String\nin second: String\n\
             combined = \"${first}/${second}\"\n\
             out combined",
        )
        .expect("compile");

    // One-shot run
    let mut all = BTreeMap::new();
    all.insert("first".to_string(), CValue::String("a".to_string()));
    all.insert("second".to_string(), CValue::String("b".to_string()));
    let oneshot = engine.run(&pipeline, all).await;

    // Suspended then resumed run
    let suspended = engine
        .run(&pipeline, one_input("first", CValue::String("a".to_string())))
        .await;
    assert_eq!(suspended.status, RunStatus::Suspended);
    let resumed = engine
        .resume(
            suspended.execution_id,
            one_input("second", CValue::String("b".to_string())),
        )
        .await;

    assert_eq!(oneshot.status, RunStatus::Completed);
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(oneshot.outputs, resumed.outputs);
}

#[tokio::test]
async fn test_resume_unknown_execution_fails() {
    let (engine, _) = engine_with_upper();
    // Compile something so the runtime exists
    engine
        .compile("in s: String\nout s")
        .expect("compile");
    let signal = engine
        .resume(uuid::Uuid::new_v4(), BTreeMap::new())
        .await;
    assert_eq!(signal.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_input_type_mismatch_fails_the_run() {
    let (engine, _) = engine_with_upper();
    let pipeline = engine
        .compile("in email: String\nout email")
        .expect("compile");
    let signal = engine
        .run(&pipeline, one_input("email", CValue::Int(5)))
        .await;
    assert_eq!(signal.status, RunStatus::Failed);
    let error = signal.error.expect("type error");
    assert!(error.to_string().contains("expected String"));
}

#[tokio::test]
async fn test_cancellation_stops_a_running_pipeline() {
    let mut engine = Constellation::new(Config::default());
    engine
        .register_module(
            ModuleSignature {
                name: "forever".to_string(),
                module_name: "forever".to_string(),
                namespace: None,
                version: "1.0.0".to_string(),
                params: vec![("value".to_string(), SemanticType::String)],
                returns: SemanticType::String,
            },
            Arc::new(|_inputs: BTreeMap<String, CValue>| {
                async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(CValue::String("never".to_string()))
                }
                .boxed()
            }),
        )
        .expect("registry open");
    let engine = Arc::new(engine);

    let pipeline = engine
        .compile("in s: String\nr = forever(s)\nout r")
        .expect("compile");

    let runner = {
        let engine = Arc::clone(&engine);
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            engine
                .run(&pipeline, one_input("s", CValue::String("x".to_string())))
                .await
        })
    };

    // Wait for the run to register, then cancel it
    let execution_id = loop {
        let ids = engine.executions();
        if let Some(id) = ids.first() {
            break *id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert!(engine.cancel(execution_id));

    let signal = runner.await.expect("join");
    assert_eq!(signal.status, RunStatus::Failed);
    let error = signal.error.expect("cancel error");
    assert!(error.to_string().contains("cancelled"));
}
