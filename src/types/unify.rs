//! Row-variable unification.
//!
//! Open records typecheck functions over records with "at least" some
//! fields. The unifier keeps a union-find over row variables plus the
//! merged known-field set per class; closing a row against a concrete
//! record checks every accumulated requirement. Conflicting field
//! requirements abort with a [`UnifyError`].

use super::{is_subtype, RowVarId, SemanticType};
use std::collections::BTreeMap;
use thiserror::Error;

/// Row unification failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UnifyError {
    #[error("field '{field}' required as {left} and {right}")]
    FieldConflict {
        field: String,
        left: String,
        right: String,
    },
    #[error("record {found} is missing field '{field}' required as {required}")]
    MissingField {
        field: String,
        required: String,
        found: String,
    },
    #[error("row r{0} already closed")]
    AlreadyClosed(u32),
}

/// Union-find over row variables with per-class field requirements.
#[derive(Debug, Default)]
pub struct RowUnifier {
    parent: Vec<u32>,
    known: BTreeMap<u32, BTreeMap<String, SemanticType>>,
    closed: BTreeMap<u32, BTreeMap<String, SemanticType>>,
}

impl RowUnifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh row variable.
    pub fn fresh(&mut self) -> RowVarId {
        let id = self.parent.len() as u32;
        self.parent.push(id);
        RowVarId(id)
    }

    fn find(&mut self, id: u32) -> u32 {
        let mut root = id;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        // Path compression
        let mut cur = id;
        while self.parent[cur as usize] != root {
            let next = self.parent[cur as usize];
            self.parent[cur as usize] = root;
            cur = next;
        }
        root
    }

    /// Require `row` to carry `field` at `ty`. An existing requirement
    /// must agree up to mutual subtyping; the narrower type wins.
    pub fn require_field(
        &mut self,
        row: RowVarId,
        field: &str,
        ty: SemanticType,
    ) -> Result<(), UnifyError> {
        let root = self.find(row.0);
        if let Some(record) = self.closed.get(&root) {
            return match record.get(field) {
                Some(actual) if is_subtype(actual, &ty) => Ok(()),
                Some(actual) => Err(UnifyError::FieldConflict {
                    field: field.to_string(),
                    left: actual.render(),
                    right: ty.render(),
                }),
                None => Err(UnifyError::MissingField {
                    field: field.to_string(),
                    required: ty.render(),
                    found: SemanticType::Record(record.clone()).render(),
                }),
            };
        }

        let fields = self.known.entry(root).or_default();
        match fields.get(field) {
            None => {
                fields.insert(field.to_string(), ty);
                Ok(())
            }
            Some(existing) if is_subtype(existing, &ty) => Ok(()),
            Some(existing) if is_subtype(&ty, existing) => {
                fields.insert(field.to_string(), ty);
                Ok(())
            }
            Some(existing) => Err(UnifyError::FieldConflict {
                field: field.to_string(),
                left: existing.render(),
                right: ty.render(),
            }),
        }
    }

    /// Merge two row variables into one class, merging their field
    /// requirements.
    pub fn unify(&mut self, a: RowVarId, b: RowVarId) -> Result<(), UnifyError> {
        let ra = self.find(a.0);
        let rb = self.find(b.0);
        if ra == rb {
            return Ok(());
        }
        self.parent[rb as usize] = ra;
        if let Some(b_fields) = self.known.remove(&rb) {
            for (field, ty) in b_fields {
                self.require_field(RowVarId(ra), &field, ty)?;
            }
        }
        if let Some(record) = self.closed.remove(&rb) {
            self.close(RowVarId(ra), &record)?;
        }
        Ok(())
    }

    /// Close a row against a concrete record: every accumulated
    /// requirement must be satisfied by the record's fields.
    pub fn close(
        &mut self,
        row: RowVarId,
        record: &BTreeMap<String, SemanticType>,
    ) -> Result<(), UnifyError> {
        let root = self.find(row.0);
        if self.closed.contains_key(&root) {
            return Err(UnifyError::AlreadyClosed(root));
        }
        if let Some(required) = self.known.remove(&root) {
            for (field, ty) in &required {
                match record.get(field) {
                    Some(actual) if is_subtype(actual, ty) => {}
                    Some(actual) => {
                        return Err(UnifyError::FieldConflict {
                            field: field.clone(),
                            left: actual.render(),
                            right: ty.render(),
                        })
                    }
                    None => {
                        return Err(UnifyError::MissingField {
                            field: field.clone(),
                            required: ty.render(),
                            found: SemanticType::Record(record.clone()).render(),
                        })
                    }
                }
            }
        }
        self.closed.insert(root, record.clone());
        Ok(())
    }

    /// Substitute closed rows, turning resolved open records into closed
    /// records. Unresolved rows are left in place for lowering to reject.
    pub fn resolve(&mut self, ty: &SemanticType) -> SemanticType {
        match ty {
            SemanticType::OpenRecord { known, row } => {
                let root = self.find(row.0);
                if let Some(record) = self.closed.get(&root) {
                    SemanticType::Record(record.clone())
                } else {
                    SemanticType::OpenRecord {
                        known: known
                            .iter()
                            .map(|(n, t)| (n.clone(), self.resolve(t)))
                            .collect(),
                        row: RowVarId(root),
                    }
                }
            }
            SemanticType::Record(fields) => SemanticType::Record(
                fields
                    .iter()
                    .map(|(n, t)| (n.clone(), self.resolve(t)))
                    .collect(),
            ),
            SemanticType::List(elem) => SemanticType::list(self.resolve(elem)),
            SemanticType::Map(k, v) => {
                SemanticType::Map(Box::new(self.resolve(k)), Box::new(self.resolve(v)))
            }
            SemanticType::Optional(inner) => {
                SemanticType::optional(self.resolve(inner))
            }
            SemanticType::Function { params, ret } => SemanticType::Function {
                params: params.iter().map(|p| self.resolve(p)).collect(),
                ret: Box::new(self.resolve(ret)),
            },
            SemanticType::Union(members) => {
                SemanticType::union(members.iter().map(|m| self.resolve(m)))
            }
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_satisfies_requirements() {
        let mut unifier = RowUnifier::new();
        let row = unifier.fresh();
        unifier
            .require_field(row, "score", SemanticType::Float)
            .unwrap();

        let mut record = BTreeMap::new();
        record.insert("score".to_string(), SemanticType::Float);
        record.insert("name".to_string(), SemanticType::String);
        unifier.close(row, &record).unwrap();

        let open = SemanticType::OpenRecord {
            known: BTreeMap::new(),
            row,
        };
        assert_eq!(unifier.resolve(&open), SemanticType::Record(record));
    }

    #[test]
    fn test_close_rejects_missing_field() {
        let mut unifier = RowUnifier::new();
        let row = unifier.fresh();
        unifier
            .require_field(row, "score", SemanticType::Float)
            .unwrap();

        let record = BTreeMap::new();
        assert!(matches!(
            unifier.close(row, &record),
            Err(UnifyError::MissingField { .. })
        ));
    }

    #[test]
    fn test_conflicting_requirements() {
        let mut unifier = RowUnifier::new();
        let row = unifier.fresh();
        unifier
            .require_field(row, "id", SemanticType::Int)
            .unwrap();
        assert!(matches!(
            unifier.require_field(row, "id", SemanticType::String),
            Err(UnifyError::FieldConflict { .. })
        ));
    }

    #[test]
    fn test_unify_merges_requirements() {
        let mut unifier = RowUnifier::new();
        let a = unifier.fresh();
        let b = unifier.fresh();
        unifier.require_field(a, "x", SemanticType::Int).unwrap();
        unifier.require_field(b, "y", SemanticType::String).unwrap();
        unifier.unify(a, b).unwrap();

        let mut record = BTreeMap::new();
        record.insert("x".to_string(), SemanticType::Int);
        assert!(matches!(
            unifier.close(a, &record),
            Err(UnifyError::MissingField { .. })
        ));
    }
}
