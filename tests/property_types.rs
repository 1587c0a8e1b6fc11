//! Property-based tests for the type system and canonical hashing
//! (proptest).

use constellation::types::{is_subtype, join, meet, SemanticType};
use constellation::value::{canonical_value_hash, CType, CValue};
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

fn arb_semantic_type() -> impl Strategy<Value = SemanticType> {
    let leaf = prop_oneof![
        Just(SemanticType::String),
        Just(SemanticType::Int),
        Just(SemanticType::Float),
        Just(SemanticType::Boolean),
        Just(SemanticType::Nothing),
    ];
    leaf.prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            inner.clone().prop_map(SemanticType::list),
            inner.clone().prop_map(SemanticType::optional),
            proptest::collection::btree_map("[a-d]", inner.clone(), 1..3)
                .prop_map(SemanticType::Record),
            proptest::collection::vec(inner, 2..4)
                .prop_map(SemanticType::union),
        ]
    })
}

/// A structural supertype of `t`, chosen by `seed`: drop record fields,
/// widen components, or extend into a union.
fn widen(t: &SemanticType, seed: u64) -> SemanticType {
    let extra = match seed % 3 {
        0 => SemanticType::Float,
        1 => SemanticType::Boolean,
        _ => SemanticType::Record(Default::default()),
    };
    match t {
        SemanticType::Record(fields) if !fields.is_empty() && seed % 2 == 0 => {
            // Width subtyping: fewer required fields is wider
            let drop_index = (seed as usize / 2) % fields.len();
            SemanticType::Record(
                fields
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != drop_index)
                    .map(|(_, (n, ty))| (n.clone(), ty.clone()))
                    .collect(),
            )
        }
        SemanticType::Record(fields) if !fields.is_empty() => {
            // Depth subtyping: widen one field
            let widen_index = (seed as usize / 2) % fields.len();
            SemanticType::Record(
                fields
                    .iter()
                    .enumerate()
                    .map(|(i, (n, ty))| {
                        if i == widen_index {
                            (n.clone(), widen(ty, seed / 3))
                        } else {
                            (n.clone(), ty.clone())
                        }
                    })
                    .collect(),
            )
        }
        SemanticType::List(elem) => SemanticType::list(widen(elem, seed / 3)),
        SemanticType::Optional(inner) => SemanticType::optional(widen(inner, seed / 3)),
        SemanticType::Union(members) => {
            let mut extended: Vec<SemanticType> = members.iter().cloned().collect();
            extended.push(extra);
            SemanticType::union(extended)
        }
        other => SemanticType::union([other.clone(), extra]),
    }
}

fn arb_cvalue() -> impl Strategy<Value = CValue> {
    let leaf = prop_oneof![
        any::<i64>().prop_map(CValue::Int),
        "[a-z]{0,8}".prop_map(CValue::String),
        any::<bool>().prop_map(CValue::Boolean),
        // Positive finite floats only: NaN and the two IEEE zeros are
        // where bitwise hashing and IEEE equality deliberately part ways
        (0.5f64..1.0e9).prop_map(CValue::Float),
    ];
    leaf.prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            proptest::collection::btree_map("[a-d]", inner.clone(), 0..3)
                .prop_map(CValue::Record),
            inner.clone().prop_map(CValue::some),
            proptest::collection::vec(any::<i64>(), 0..4).prop_map(|items| {
                CValue::list(CType::Int, items.into_iter().map(CValue::Int).collect())
            }),
        ]
    })
}

// ============================================================================
// Subtyping algebra
// ============================================================================

proptest! {
    #[test]
    fn prop_subtyping_is_reflexive(t in arb_semantic_type()) {
        prop_assert!(is_subtype(&t, &t));
    }

    #[test]
    fn prop_nothing_is_bottom(t in arb_semantic_type()) {
        prop_assert!(is_subtype(&SemanticType::Nothing, &t));
    }

    #[test]
    fn prop_widening_produces_supertypes(t in arb_semantic_type(), seed in any::<u64>()) {
        let wider = widen(&t, seed);
        prop_assert!(
            is_subtype(&t, &wider),
            "{} should be a subtype of {}",
            t.render(),
            wider.render()
        );
    }

    #[test]
    fn prop_subtyping_is_transitive_along_widening_chains(
        t in arb_semantic_type(),
        seed1 in any::<u64>(),
        seed2 in any::<u64>(),
    ) {
        let mid = widen(&t, seed1);
        let top = widen(&mid, seed2);
        prop_assert!(is_subtype(&t, &mid));
        prop_assert!(is_subtype(&mid, &top));
        prop_assert!(
            is_subtype(&t, &top),
            "transitivity: {} <: {} <: {}",
            t.render(),
            mid.render(),
            top.render()
        );
    }

    #[test]
    fn prop_join_is_an_upper_bound(a in arb_semantic_type(), b in arb_semantic_type()) {
        let lub = join(&a, &b);
        prop_assert!(is_subtype(&a, &lub), "{} <: {}", a.render(), lub.render());
        prop_assert!(is_subtype(&b, &lub), "{} <: {}", b.render(), lub.render());
    }

    #[test]
    fn prop_join_is_symmetric(a in arb_semantic_type(), b in arb_semantic_type()) {
        prop_assert_eq!(join(&a, &b), join(&b, &a));
    }

    #[test]
    fn prop_meet_is_a_lower_bound(a in arb_semantic_type(), b in arb_semantic_type()) {
        let glb = meet(&a, &b);
        prop_assert!(is_subtype(&glb, &a), "{} <: {}", glb.render(), a.render());
        prop_assert!(is_subtype(&glb, &b), "{} <: {}", glb.render(), b.render());
    }

    #[test]
    fn prop_union_render_is_canonical(members in proptest::collection::vec(arb_semantic_type(), 2..4)) {
        let forward = SemanticType::union(members.clone());
        let mut reversed_members = members;
        reversed_members.reverse();
        let reversed = SemanticType::union(reversed_members);
        prop_assert_eq!(forward.render(), reversed.render());
        prop_assert_eq!(forward, reversed);
    }

    #[test]
    fn prop_lowerable_types_round_trip(t in arb_semantic_type()) {
        // Generated types never contain functions or rows, so lowering
        // is total; lifting back is the identity on the lowered form
        let lowered = t.to_ctype();
        prop_assert!(lowered.is_ok(), "lowering failed for {}", t.render());
        let ctype = lowered.expect("checked above");
        let lifted = SemanticType::from_ctype(&ctype);
        prop_assert_eq!(lifted.to_ctype().ok(), Some(ctype));
    }
}

// ============================================================================
// Canonical value hashing
// ============================================================================

proptest! {
    #[test]
    fn prop_equal_values_hash_equal(v in arb_cvalue()) {
        prop_assert_eq!(canonical_value_hash(&v), canonical_value_hash(&v.clone()));
    }

    #[test]
    fn prop_distinct_values_hash_distinct(a in arb_cvalue(), b in arb_cvalue()) {
        if a != b {
            prop_assert_ne!(canonical_value_hash(&a), canonical_value_hash(&b));
        } else {
            prop_assert_eq!(canonical_value_hash(&a), canonical_value_hash(&b));
        }
    }

    #[test]
    fn prop_map_entry_order_is_erased(entries in proptest::collection::vec((any::<i64>(), any::<i64>()), 0..6)) {
        let forward = CValue::map(
            CType::Int,
            CType::Int,
            entries
                .iter()
                .map(|(k, v)| (CValue::Int(*k), CValue::Int(*v)))
                .collect(),
        );
        let mut reversed_entries = entries;
        reversed_entries.reverse();
        let reversed = CValue::map(
            CType::Int,
            CType::Int,
            reversed_entries
                .iter()
                .map(|(k, v)| (CValue::Int(*k), CValue::Int(*v)))
                .collect(),
        );
        prop_assert_eq!(canonical_value_hash(&forward), canonical_value_hash(&reversed));
    }
}
