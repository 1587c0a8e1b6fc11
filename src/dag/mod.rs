//! # Runtime DAG Specification
//!
//! The concrete execution spec produced by the DAG compiler and consumed
//! by the scheduler: a data-node table, a module-node table, edges, and
//! per-call option images.
//!
//! A data node is externally supplied (a top-level input), module
//! produced (exactly one producing module), or inline computed (a
//! lightweight pure transform the scheduler evaluates in place once its
//! inputs are ready). Control-flow constructs that cannot be a single
//! pure transform become synthetic modules; currently `Branch`.

pub mod compile;
pub mod hash;

pub use compile::compile_dag;
pub use hash::{structural_hash, syntactic_hash};

use crate::ir::{IRModuleCallOptions, ScalarOp, TypedLambda};
use crate::value::{CType, CValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Identifier of a data node.
pub type DataId = Uuid;
/// Identifier of a module node.
pub type ModuleId = Uuid;

// ============================================================================
// Inline transforms
// ============================================================================

/// Lightweight pure operations evaluated in place by the scheduler.
/// Input values arrive keyed by the parameter names documented per
/// variant (see `transform_inputs` on the data node).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InlineTransform {
    /// Constant; takes no inputs
    Literal { value: CValue },
    /// Right-biased merge of `left` and `right`. A list of records on
    /// one side broadcasts the record on the other side element-wise;
    /// right still wins on field conflicts.
    Merge,
    /// Select `fields` out of the record `source`
    Project { fields: Vec<String> },
    /// Read `field` from the record `source`
    FieldAccess { field: String },
    /// `cond ? then : else`
    Conditional,
    And,
    Or,
    Not,
    /// Arithmetic/comparison over `left` and `right`
    Scalar { op: ScalarOp },
    /// `expr when cond`; produces `Some(expr)` or `None<inner_type>`
    Guard { inner_type: CType },
    /// `left ?? right`
    Coalesce,
    /// Template over `expr0..exprN-1`
    Interpolate { parts: Vec<String> },
    /// List constructor over `item0..itemN-1`
    MakeList { elem_type: CType },
    /// Record constructor; one input per field name
    MakeRecord { fields: Vec<String> },
    /// filter over `source` (+ captures by name)
    Filter { lambda: TypedLambda },
    /// map over `source` (+ captures by name)
    Map { lambda: TypedLambda },
    /// all over `source` (+ captures by name)
    All { lambda: TypedLambda },
    /// any over `source` (+ captures by name)
    Any { lambda: TypedLambda },
    /// Union discrimination over `scrutinee` (+ captures by name)
    MatchUnion {
        arms: Vec<(Vec<String>, TypedLambda)>,
        default: Option<TypedLambda>,
    },
}

// ============================================================================
// Node specs
// ============================================================================

/// One data node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataNodeSpec {
    pub name: String,
    /// Per-consuming-module parameter name
    pub nicknames: BTreeMap<ModuleId, String>,
    pub ctype: CType,
    /// Present iff the node is inline computed
    pub inline: Option<InlineTransform>,
    /// Transform parameter name -> upstream data node
    pub transform_inputs: BTreeMap<String, DataId>,
}

/// Module kinds: user modules dispatch through the registry; synthetic
/// modules are provided by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleKind {
    User,
    /// Ordered condition evaluation with short-circuit
    SyntheticBranch { case_count: usize },
}

/// Metadata carried by every module node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    /// Runtime module name (registry key, cache/limiter key)
    pub name: String,
    /// Surface-language function name
    pub function: String,
    pub kind: ModuleKind,
    pub version: Option<String>,
}

/// One module node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleNodeSpec {
    pub metadata: ModuleMetadata,
    pub consumes: BTreeMap<String, CType>,
    pub produces: BTreeMap<String, CType>,
}

// ============================================================================
// The spec
// ============================================================================

/// A compiled runtime DAG.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DagSpec {
    pub data: BTreeMap<DataId, DataNodeSpec>,
    pub modules: BTreeMap<ModuleId, ModuleNodeSpec>,
    /// Data feeds module
    pub in_edges: BTreeSet<(DataId, ModuleId)>,
    /// Module produces data
    pub out_edges: BTreeSet<(ModuleId, DataId)>,
    pub declared_outputs: Vec<String>,
    pub output_bindings: BTreeMap<String, DataId>,
    pub module_options: BTreeMap<ModuleId, IRModuleCallOptions>,
}

impl DagSpec {
    /// The module producing a data node, if any.
    pub fn producer(&self, data: DataId) -> Option<ModuleId> {
        self.out_edges
            .iter()
            .find(|(_, d)| *d == data)
            .map(|(m, _)| *m)
    }

    /// Data nodes consumed by a module, with their parameter names.
    pub fn consumed_by(&self, module: ModuleId) -> Vec<(DataId, String)> {
        self.in_edges
            .iter()
            .filter(|(_, m)| *m == module)
            .filter_map(|(d, _)| {
                self.data
                    .get(d)
                    .and_then(|spec| spec.nicknames.get(&module))
                    .map(|nickname| (*d, nickname.clone()))
            })
            .collect()
    }

    /// Data nodes produced by a module.
    pub fn produced_by(&self, module: ModuleId) -> Vec<DataId> {
        self.out_edges
            .iter()
            .filter(|(m, _)| *m == module)
            .map(|(_, d)| *d)
            .collect()
    }

    /// Top-level inputs: data nodes with no producer and no inline
    /// transform.
    pub fn external_inputs(&self) -> BTreeMap<String, (DataId, CType)> {
        self.data
            .iter()
            .filter(|(id, spec)| spec.inline.is_none() && self.producer(**id).is_none())
            .map(|(id, spec)| (spec.name.clone(), (*id, spec.ctype.clone())))
            .collect()
    }
}

/// A compiled pipeline image: the spec plus the metadata needed to
/// rehydrate a runnable pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineImage {
    pub name: Option<String>,
    /// Syntactic hash of the source this image was compiled from
    pub source_hash: String,
    /// Caller-supplied creation clock, milliseconds
    pub created_at_ms: Option<u64>,
    pub spec: DagSpec,
    /// Module name -> version, for registry compatibility checks
    pub module_versions: BTreeMap<String, String>,
}
