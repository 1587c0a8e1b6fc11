//! # Semantic Type System
//!
//! Compile-time types used by the analyzer: everything the runtime has,
//! plus the `Nothing` bottom type, functions, and row-polymorphic open
//! records. Functions and unresolved rows exist only at compile time;
//! lowering them to a runtime [`CType`] is a contract violation reported
//! through [`LoweringError`].
//!
//! Subtyping is structural: records are width + depth, lists and
//! optionals are covariant, map keys are invariant, functions are
//! contravariant in parameters and covariant in return.

pub mod unify;

pub use unify::{RowUnifier, UnifyError};

use crate::value::CType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Identifier of a row variable, allocated by the [`RowUnifier`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RowVarId(pub u32);

/// A compile-time type.
///
/// `Union` members live in a `BTreeSet`, so nested unions flatten through
/// [`SemanticType::union`] and structural equality is set-based.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum SemanticType {
    String,
    Int,
    Float,
    Boolean,
    /// Bottom type: subtype of everything, inhabited by nothing.
    /// The inferred element type of an empty list literal.
    Nothing,
    Record(BTreeMap<String, SemanticType>),
    List(Box<SemanticType>),
    Map(Box<SemanticType>, Box<SemanticType>),
    Optional(Box<SemanticType>),
    /// Compile-time only; has no runtime counterpart.
    Function {
        params: Vec<SemanticType>,
        ret: Box<SemanticType>,
    },
    Union(BTreeSet<SemanticType>),
    /// Unresolved row variable (compile-time only).
    RowVar(RowVarId),
    /// A record with at least `known` fields; `row` stands for the rest.
    OpenRecord {
        known: BTreeMap<String, SemanticType>,
        row: RowVarId,
    },
}

/// Failure to lower a semantic type into a runtime type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoweringError {
    #[error("function types have no runtime counterpart: {0}")]
    FunctionType(String),
    #[error("unresolved row variable r{0} escaped type checking")]
    UnresolvedRowVar(u32),
    #[error("open record {0} must be closed before lowering")]
    OpenRecord(String),
}

impl SemanticType {
    /// Build a union, flattening nested unions and collapsing
    /// singletons. An empty member set is `Nothing`.
    pub fn union<I: IntoIterator<Item = SemanticType>>(members: I) -> SemanticType {
        let mut set = BTreeSet::new();
        for member in members {
            match member {
                SemanticType::Union(inner) => set.extend(inner),
                SemanticType::Nothing => {}
                other => {
                    set.insert(other);
                }
            }
        }
        match set.len() {
            0 => SemanticType::Nothing,
            1 => set.into_iter().next().expect("singleton set"),
            _ => SemanticType::Union(set),
        }
    }

    /// Build a record type from `(name, type)` pairs.
    pub fn record(fields: Vec<(String, SemanticType)>) -> SemanticType {
        SemanticType::Record(fields.into_iter().collect())
    }

    pub fn list(elem: SemanticType) -> SemanticType {
        SemanticType::List(Box::new(elem))
    }

    pub fn optional(inner: SemanticType) -> SemanticType {
        SemanticType::Optional(Box::new(inner))
    }

    /// Canonical rendering. Union members print sorted by their
    /// rendered form, so two set-equal unions render identically and
    /// diagnostics de-duplicate cleanly.
    pub fn render(&self) -> String {
        match self {
            SemanticType::String => "String".to_string(),
            SemanticType::Int => "Int".to_string(),
            SemanticType::Float => "Float".to_string(),
            SemanticType::Boolean => "Boolean".to_string(),
            SemanticType::Nothing => "Nothing".to_string(),
            SemanticType::Record(fields) => {
                let body: Vec<String> = fields
                    .iter()
                    .map(|(name, ty)| format!("{}: {}", name, ty.render()))
                    .collect();
                format!("{{{}}}", body.join(", "))
            }
            SemanticType::List(elem) => format!("List<{}>", elem.render()),
            SemanticType::Map(k, v) => format!("Map<{}, {}>", k.render(), v.render()),
            SemanticType::Optional(inner) => format!("{}?", inner.render()),
            SemanticType::Function { params, ret } => {
                let ps: Vec<String> = params.iter().map(SemanticType::render).collect();
                format!("({}) => {}", ps.join(", "), ret.render())
            }
            SemanticType::Union(members) => {
                let mut parts: Vec<String> =
                    members.iter().map(SemanticType::render).collect();
                parts.sort();
                parts.join(" | ")
            }
            SemanticType::RowVar(id) => format!("r{}", id.0),
            SemanticType::OpenRecord { known, row } => {
                let mut body: Vec<String> = known
                    .iter()
                    .map(|(name, ty)| format!("{}: {}", name, ty.render()))
                    .collect();
                body.push(format!("..r{}", row.0));
                format!("{{{}}}", body.join(", "))
            }
        }
    }

    /// Lower to the runtime type space.
    ///
    /// Fails on `Function`, `RowVar`, `OpenRecord`, and `Nothing` — the
    /// type checker must have resolved or rejected those first.
    pub fn to_ctype(&self) -> Result<CType, LoweringError> {
        match self {
            SemanticType::String => Ok(CType::String),
            SemanticType::Int => Ok(CType::Int),
            SemanticType::Float => Ok(CType::Float),
            SemanticType::Boolean => Ok(CType::Boolean),
            // Nothing lowers to the uninhabited union; it only ever
            // appears as the element type of empty containers.
            SemanticType::Nothing => Ok(CType::Union(BTreeMap::new())),
            SemanticType::Record(fields) => {
                let mut lowered = BTreeMap::new();
                for (name, ty) in fields {
                    lowered.insert(name.clone(), ty.to_ctype()?);
                }
                Ok(CType::Product(lowered))
            }
            SemanticType::List(elem) => Ok(CType::List(Box::new(elem.to_ctype()?))),
            SemanticType::Map(k, v) => Ok(CType::Map(
                Box::new(k.to_ctype()?),
                Box::new(v.to_ctype()?),
            )),
            SemanticType::Optional(inner) => {
                Ok(CType::Optional(Box::new(inner.to_ctype()?)))
            }
            SemanticType::Function { .. } => {
                Err(LoweringError::FunctionType(self.render()))
            }
            SemanticType::RowVar(id) => Err(LoweringError::UnresolvedRowVar(id.0)),
            SemanticType::OpenRecord { .. } => {
                Err(LoweringError::OpenRecord(self.render()))
            }
            SemanticType::Union(members) => {
                // Tags are synthesized from canonical renders in sorted
                // order, so set-equal unions lower identically.
                let mut variants = BTreeMap::new();
                for member in members {
                    variants.insert(member.render(), member.to_ctype()?);
                }
                Ok(CType::Union(variants))
            }
        }
    }

    /// Lift a runtime type back into the semantic space.
    pub fn from_ctype(ctype: &CType) -> SemanticType {
        match ctype {
            CType::String => SemanticType::String,
            CType::Int => SemanticType::Int,
            CType::Float => SemanticType::Float,
            CType::Boolean => SemanticType::Boolean,
            CType::List(elem) => SemanticType::list(SemanticType::from_ctype(elem)),
            CType::Map(k, v) => SemanticType::Map(
                Box::new(SemanticType::from_ctype(k)),
                Box::new(SemanticType::from_ctype(v)),
            ),
            CType::Product(fields) => SemanticType::Record(
                fields
                    .iter()
                    .map(|(name, ty)| (name.clone(), SemanticType::from_ctype(ty)))
                    .collect(),
            ),
            CType::Union(variants) => {
                SemanticType::union(variants.values().map(SemanticType::from_ctype))
            }
            CType::Optional(inner) => {
                SemanticType::optional(SemanticType::from_ctype(inner))
            }
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

// ============================================================================
// Subtyping
// ============================================================================

/// Structural subtyping check: `sub <: sup`.
pub fn is_subtype(sub: &SemanticType, sup: &SemanticType) -> bool {
    use SemanticType::*;

    if sub == sup {
        return true;
    }

    match (sub, sup) {
        (Nothing, _) => true,

        // Union as subtype: every member must fit the supertype.
        // Checked before union-as-supertype so (A|B) <: (A|B|C) holds.
        (Union(members), _) => members.iter().all(|m| is_subtype(m, sup)),

        // Union as supertype: the subtype must fit some member.
        (_, Union(members)) => members.iter().any(|m| is_subtype(sub, m)),

        (List(s), List(t)) => is_subtype(s, t),

        // Keys invariant, values covariant.
        (Map(sk, sv), Map(tk, tv)) => sk == tk && is_subtype(sv, tv),

        (Optional(s), Optional(t)) => is_subtype(s, t),

        // Width + depth: the sub record must have every field of the
        // super record at a subtype.
        (Record(sub_fields), Record(sup_fields)) => sup_fields.iter().all(|(name, t)| {
            sub_fields
                .get(name)
                .is_some_and(|s| is_subtype(s, t))
        }),

        // A closed record satisfies an "at least these fields" bound.
        (Record(sub_fields), OpenRecord { known, .. }) => known.iter().all(|(name, t)| {
            sub_fields
                .get(name)
                .is_some_and(|s| is_subtype(s, t))
        }),

        (
            OpenRecord { known: sub_known, .. },
            OpenRecord { known: sup_known, .. },
        ) => sup_known.iter().all(|(name, t)| {
            sub_known
                .get(name)
                .is_some_and(|s| is_subtype(s, t))
        }),

        (
            Function {
                params: sub_params,
                ret: sub_ret,
            },
            Function {
                params: sup_params,
                ret: sup_ret,
            },
        ) => {
            sub_params.len() == sup_params.len()
                && sub_params
                    .iter()
                    .zip(sup_params.iter())
                    .all(|(s, t)| is_subtype(t, s))
                && is_subtype(sub_ret, sup_ret)
        }

        _ => false,
    }
}

/// Least upper bound, used for conditional and branch result types.
///
/// Falls back to a union when neither side subsumes the other and no
/// structural join applies.
pub fn join(a: &SemanticType, b: &SemanticType) -> SemanticType {
    use SemanticType::*;

    if is_subtype(a, b) {
        return b.clone();
    }
    if is_subtype(b, a) {
        return a.clone();
    }

    match (a, b) {
        // Width intersection, depth join.
        (Record(af), Record(bf)) => {
            let fields: BTreeMap<std::string::String, SemanticType> = af
                .iter()
                .filter_map(|(name, at)| {
                    bf.get(name).map(|bt| (name.clone(), join(at, bt)))
                })
                .collect();
            if fields.is_empty() {
                SemanticType::union([a.clone(), b.clone()])
            } else {
                Record(fields)
            }
        }
        (List(ae), List(be)) => SemanticType::list(join(ae, be)),
        (Optional(ai), Optional(bi)) => SemanticType::optional(join(ai, bi)),
        _ => SemanticType::union([a.clone(), b.clone()]),
    }
}

/// Greatest lower bound. `Nothing` when the types are unrelated.
pub fn meet(a: &SemanticType, b: &SemanticType) -> SemanticType {
    use SemanticType::*;

    if is_subtype(a, b) {
        return a.clone();
    }
    if is_subtype(b, a) {
        return b.clone();
    }

    match (a, b) {
        // Width union, depth meet.
        (Record(af), Record(bf)) => {
            let mut fields = af.clone();
            for (name, bt) in bf {
                let merged = match af.get(name) {
                    Some(at) => meet(at, bt),
                    None => bt.clone(),
                };
                if merged == Nothing {
                    return Nothing;
                }
                fields.insert(name.clone(), merged);
            }
            Record(fields)
        }
        (List(ae), List(be)) => {
            let elem = meet(ae, be);
            if elem == Nothing && **ae != Nothing && **be != Nothing {
                Nothing
            } else {
                SemanticType::list(elem)
            }
        }
        (Optional(ai), Optional(bi)) => SemanticType::optional(meet(ai, bi)),
        _ => Nothing,
    }
}
