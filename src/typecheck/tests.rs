use super::*;
use crate::parser::parse_program;
use crate::registry::{FunctionRegistry, ModuleFailure, ModuleImpl};
use crate::types::RowVarId;
use crate::value::CValue;
use futures_util::FutureExt;
use std::collections::BTreeMap as Map;
use std::sync::Arc;

fn noop_impl() -> Arc<dyn ModuleImpl> {
    Arc::new(|_inputs: Map<String, CValue>| {
        async move { Err::<CValue, _>(ModuleFailure::new("noop", "not invoked in tests")) }
            .boxed()
    })
}

fn signature(
    name: &str,
    namespace: Option<&str>,
    params: Vec<(&str, SemanticType)>,
    returns: SemanticType,
) -> ModuleSignature {
    ModuleSignature {
        name: name.to_string(),
        module_name: format!("{name}-module"),
        namespace: namespace.map(ToString::to_string),
        version: "1.0.0".to_string(),
        params: params
            .into_iter()
            .map(|(n, t)| (n.to_string(), t))
            .collect(),
        returns,
    }
}

fn test_registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry.register(
        signature(
            "concat",
            None,
            vec![("left", SemanticType::String), ("right", SemanticType::String)],
            SemanticType::String,
        ),
        noop_impl(),
    );
    registry.register(
        signature(
            "fetch",
            None,
            vec![("url", SemanticType::String)],
            SemanticType::String,
        ),
        noop_impl(),
    );
    registry.register(
        signature(
            "upper",
            Some("text"),
            vec![("value", SemanticType::String)],
            SemanticType::String,
        ),
        noop_impl(),
    );
    registry.register(
        signature(
            "trim",
            Some("other"),
            vec![("value", SemanticType::String)],
            SemanticType::String,
        ),
        noop_impl(),
    );
    // Row-polymorphic: accepts any record with at least {score: Float},
    // returns the full record it was given.
    let row = RowVarId(0);
    registry.register(
        signature(
            "normalize",
            None,
            vec![(
                "entry",
                SemanticType::OpenRecord {
                    known: [("score".to_string(), SemanticType::Float)]
                        .into_iter()
                        .collect(),
                    row,
                },
            )],
            SemanticType::OpenRecord {
                known: [("score".to_string(), SemanticType::Float)]
                    .into_iter()
                    .collect(),
                row,
            },
        ),
        noop_impl(),
    );
    registry
}

fn check(source: &str) -> Result<TypedProgram, Vec<CompileError>> {
    let registry = test_registry();
    let program = parse_program(source).expect("parse");
    check_program(&program, &registry)
}

fn codes(errors: &[CompileError]) -> Vec<&'static str> {
    errors.iter().map(CompileError::code).collect()
}

#[test]
fn test_hello_program_checks() {
    let typed = check(
        "in name: String\ngreeting = concat(\"Hello, \", name)\nout greeting",
    )
    .unwrap();
    assert_eq!(typed.inputs.len(), 1);
    assert_eq!(typed.outputs, vec!["greeting".to_string()]);
    assert_eq!(typed.assignments[0].expr.ty, SemanticType::String);
}

#[test]
fn test_undefined_variable() {
    let errors = check("x = missing").unwrap_err();
    assert_eq!(codes(&errors), vec!["E003"]);
}

#[test]
fn test_undefined_function_and_namespace() {
    let errors = check("x = nope(1)").unwrap_err();
    assert_eq!(codes(&errors), vec!["E004"]);

    let errors = check("x = nowhere.f(1)").unwrap_err();
    assert_eq!(codes(&errors), vec!["E006"]);
}

#[test]
fn test_duplicate_definition() {
    let errors = check("x = 1\nx = 2").unwrap_err();
    assert!(codes(&errors).contains(&"E020"));
}

#[test]
fn test_circular_dependency() {
    let errors = check("a = b\nb = a").unwrap_err();
    assert!(codes(&errors).contains(&"E021"));
}

#[test]
fn test_merge_and_projection_types() {
    let typed = check(
        "in base: {id: Int, name: String}\n\
         in extra: {name: String, score: Float}\n\
         merged = base + extra\n\
         summary = merged[id, score]\n\
         out merged\nout summary",
    )
    .unwrap();
    let merged = &typed.assignments[0].expr.ty;
    assert_eq!(
        merged.render(),
        "{id: Int, name: String, score: Float}"
    );
    let summary = &typed.assignments[1].expr.ty;
    assert_eq!(summary.render(), "{id: Int, score: Float}");
}

#[test]
fn test_merge_rejects_incompatible_overlap() {
    let errors = check(
        "in a: {id: Int}\nin b: {id: String}\nm = a + b\nout m",
    )
    .unwrap_err();
    assert!(codes(&errors).contains(&"E012"));
}

#[test]
fn test_guard_coalesce_types() {
    let typed = check(
        "in score: Int\nin threshold: Int\n\
         high = \"Excellent!\" when score > threshold\n\
         msg = high ?? \"Below threshold\"\n\
         out msg",
    )
    .unwrap();
    assert_eq!(
        typed.assignments[0].expr.ty,
        SemanticType::optional(SemanticType::String)
    );
    assert_eq!(typed.assignments[1].expr.ty, SemanticType::String);
}

#[test]
fn test_coalesce_requires_optional_left() {
    let errors = check("in x: Int\ny = x ?? 0\nout y").unwrap_err();
    assert!(codes(&errors).contains(&"E010"));
}

#[test]
fn test_branch_joins_arm_types() {
    let typed = check(
        "in score: Int\n\
         grade = branch { score >= 90 -> \"A\", score >= 80 -> \"B\", otherwise -> \"F\" }\n\
         out grade",
    )
    .unwrap();
    assert_eq!(typed.assignments[0].expr.ty, SemanticType::String);
}

#[test]
fn test_branch_condition_must_be_boolean() {
    let errors =
        check("in score: Int\ng = branch { score -> 1, otherwise -> 2 }\nout g").unwrap_err();
    assert!(codes(&errors).contains(&"E010"));
}

#[test]
fn test_option_validation() {
    let errors = check("x = fetch(\"u\") with retry: -1\nout x").unwrap_err();
    assert_eq!(codes(&errors), vec!["E015"]);

    let errors = check("x = fetch(\"u\") with nonsense: 3\nout x").unwrap_err();
    assert_eq!(codes(&errors), vec!["E015"]);

    let errors = check("x = fetch(\"u\") with retry: 2, retry: 3\nout x").unwrap_err();
    assert_eq!(codes(&errors), vec!["E015"]);
}

#[test]
fn test_fallback_type_mismatch() {
    let errors = check("x = fetch(\"u\") with fallback: 42\nout x").unwrap_err();
    assert_eq!(codes(&errors), vec!["E016"]);

    // Matching fallback is fine
    check("x = fetch(\"u\") with retry: 2, fallback: \"default\"\nout x").unwrap();
}

#[test]
fn test_streaming_option_rules() {
    let errors =
        check("x = fetch(\"u\") with batch: 10, window: 5s\nout x").unwrap_err();
    assert!(codes(&errors).contains(&"E015"));

    let errors = check("x = fetch(\"u\") with join: inner\nout x").unwrap_err();
    assert!(codes(&errors).contains(&"E015"));

    check("x = fetch(\"u\") with window: 5s, join: inner\nout x").unwrap();
}

#[test]
fn test_priority_normalization() {
    let typed = check("x = fetch(\"u\") with priority: high\nout x").unwrap();
    let TypedExprKind::ModuleCall { options, .. } = &typed.assignments[0].expr.kind else {
        panic!("expected module call");
    };
    assert_eq!(options.priority, Some(80));

    let typed = check("x = fetch(\"u\") with priority: 250\nout x").unwrap();
    let TypedExprKind::ModuleCall { options, .. } = &typed.assignments[0].expr.kind else {
        panic!("expected module call");
    };
    assert_eq!(options.priority, Some(100));
}

#[test]
fn test_use_alias_resolution() {
    let typed = check("use text.upper as shout\nin s: String\nx = shout(s)\nout x").unwrap();
    let TypedExprKind::ModuleCall { signature, .. } = &typed.assignments[0].expr.kind else {
        panic!("expected module call");
    };
    assert_eq!(signature.module_name, "upper-module");
}

#[test]
fn test_ambiguous_import() {
    let errors =
        check("use text.upper as f\nuse other.trim as f\nin s: String\nx = f(s)\nout x")
            .unwrap_err();
    assert!(codes(&errors).contains(&"E007"));
}

#[test]
fn test_higher_order_inference_and_captures() {
    let typed = check(
        "in items: List<Int>\nin threshold: Int\n\
         big = filter(items, (x) => x > threshold)\n\
         out big",
    )
    .unwrap();
    let expr = &typed.assignments[0].expr;
    assert_eq!(expr.ty, SemanticType::list(SemanticType::Int));
    let TypedExprKind::HigherOrder { lambda, .. } = &expr.kind else {
        panic!("expected higher-order call");
    };
    assert_eq!(lambda.params, vec![("x".to_string(), SemanticType::Int)]);
    assert_eq!(lambda.captures, vec!["threshold".to_string()]);
}

#[test]
fn test_map_produces_element_type() {
    let typed = check(
        "in items: List<{name: String, age: Int}>\n\
         names = map(items, (p) => p.name)\n\
         out names",
    )
    .unwrap();
    assert_eq!(
        typed.assignments[0].expr.ty,
        SemanticType::list(SemanticType::String)
    );
}

#[test]
fn test_sort_by_is_unsupported() {
    let errors = check("in xs: List<Int>\ny = sort_by(xs, (x) => x)\nout y").unwrap_err();
    assert_eq!(codes(&errors), vec!["E030"]);
}

#[test]
fn test_match_exhaustiveness() {
    let errors = check(
        "in v: Int | String\n\
         r = match v { s: String -> \"s\" }\n\
         out r",
    )
    .unwrap_err();
    assert!(codes(&errors).contains(&"E017"));

    // Wildcard closes the match
    check(
        "in v: Int | String\n\
         r = match v { s: String -> \"s\", _ -> \"other\" }\n\
         out r",
    )
    .unwrap();

    // Full coverage without wildcard
    check(
        "in v: Int | String\n\
         r = match v { s: String -> \"s\", n: Int -> \"n\" }\n\
         out r",
    )
    .unwrap();
}

#[test]
fn test_match_pattern_mismatch() {
    let errors = check(
        "in v: Int | String\n\
         r = match v { b: Boolean -> \"b\", _ -> \"other\" }\n\
         out r",
    )
    .unwrap_err();
    assert!(codes(&errors).contains(&"E018"));
}

#[test]
fn test_match_narrows_binding() {
    let typed = check(
        "in v: Int | String\n\
         r = match v { n: Int -> n + 1, _ -> 0 }\n\
         out r",
    )
    .unwrap();
    assert_eq!(typed.assignments[0].expr.ty, SemanticType::Int);
}

#[test]
fn test_open_record_call() {
    // normalize requires at least {score: Float} and returns the full
    // record it was handed.
    let typed = check(
        "in entry: {name: String, score: Float}\n\
         n = normalize(entry)\n\
         renamed = n.name\n\
         out renamed",
    )
    .unwrap();
    assert_eq!(
        typed.assignments[0].expr.ty.render(),
        "{name: String, score: Float}"
    );

    let errors = check("in entry: {name: String}\nn = normalize(entry)\nout n").unwrap_err();
    assert!(codes(&errors).contains(&"E010"));
}

#[test]
fn test_empty_list_widens_by_context() {
    let typed = check("xs = []\nout xs").unwrap();
    assert_eq!(
        typed.assignments[0].expr.ty,
        SemanticType::list(SemanticType::Nothing)
    );

    // As an argument, List<Nothing> satisfies any list parameter
    check("in t: Int\nys = filter([], (x) => x > t)\nout ys").unwrap();
}

#[test]
fn test_interpolation_requires_printable() {
    let errors = check(
        "in r: {a: Int}\nmsg = \"value: ${r}\"\nout msg",
    )
    .unwrap_err();
    assert!(codes(&errors).contains(&"E010"));

    check("in n: Int\nmsg = \"value: ${n}\"\nout msg").unwrap();
}

#[test]
fn test_undefined_output() {
    let errors = check("x = 1\nout y").unwrap_err();
    assert!(codes(&errors).contains(&"E003"));
}

#[test]
fn test_arithmetic_rules() {
    check("x = 1 + 2 * 3\nout x").unwrap();
    check("x = 1.5 + 2.5\nout x").unwrap();
    check("x = \"a\" + \"b\"\nout x").unwrap();

    let errors = check("x = 1 + 1.5\nout x").unwrap_err();
    assert!(codes(&errors).contains(&"E014"));

    let errors = check("x = 1 < \"a\"\nout x").unwrap_err();
    assert!(codes(&errors).contains(&"E013"));
}

#[test]
fn test_multiple_errors_accumulate() {
    let errors = check("a = missing1\nb = missing2\nc = nope(1)").unwrap_err();
    assert_eq!(errors.len(), 3);
}
