//! IR -> DagSpec lowering.
//!
//! Walks the IR in topological order. Inputs become externally-supplied
//! data nodes, module calls become module nodes plus their output data
//! node, structural operations become inline-computed data nodes, and
//! `Branch` becomes a synthetic module (ordered evaluation cannot be a
//! single pure transform over pre-computed inputs).

use super::{
    DagSpec, DataId, DataNodeSpec, InlineTransform, ModuleId, ModuleKind, ModuleMetadata,
    ModuleNodeSpec,
};
use crate::error::CompileError;
use crate::ir::{HigherOrderOp, IRNode, IRProgram, NodeId};
use crate::registry::FunctionRegistry;
use crate::value::CType;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Compile an IR program into a runtime DAG spec.
///
/// When a registry is provided, module nodes resolve against it for
/// parameter/return specs and versions; otherwise a placeholder spec is
/// derived from the call's declared types.
pub fn compile_dag(
    ir: &IRProgram,
    registry: Option<&FunctionRegistry>,
) -> Result<DagSpec, CompileError> {
    let mut compiler = DagCompiler {
        ir,
        registry,
        spec: DagSpec::default(),
        data_of: HashMap::new(),
        names: reverse_bindings(ir),
    };
    compiler.run()?;
    Ok(compiler.spec)
}

fn reverse_bindings(ir: &IRProgram) -> HashMap<NodeId, String> {
    // First binding wins, so data nodes get stable human names
    let mut names = HashMap::new();
    for (name, id) in &ir.variable_bindings {
        names.entry(*id).or_insert_with(|| name.clone());
    }
    names
}

struct DagCompiler<'a> {
    ir: &'a IRProgram,
    registry: Option<&'a FunctionRegistry>,
    spec: DagSpec,
    /// IR node -> data node carrying its value
    data_of: HashMap<NodeId, DataId>,
    names: HashMap<NodeId, String>,
}

impl DagCompiler<'_> {
    fn run(&mut self) -> Result<(), CompileError> {
        for id in &self.ir.topological_order {
            let node = self.ir.nodes.get(id).ok_or_else(|| {
                CompileError::InternalError {
                    message: format!("missing IR node {id}"),
                }
            })?;
            let data_id = self.compile_node(*id, node)?;
            self.data_of.insert(*id, data_id);
        }

        self.spec.declared_outputs = self.ir.declared_outputs.clone();
        for name in &self.ir.declared_outputs {
            let node_id = self.ir.variable_bindings.get(name).ok_or_else(|| {
                CompileError::InternalError {
                    message: format!("output '{name}' has no variable binding"),
                }
            })?;
            let data_id = self.lookup(*node_id)?;
            self.spec.output_bindings.insert(name.clone(), data_id);
        }
        Ok(())
    }

    fn lookup(&self, id: NodeId) -> Result<DataId, CompileError> {
        self.data_of
            .get(&id)
            .copied()
            .ok_or_else(|| CompileError::InternalError {
                message: format!("IR node {id} was not compiled before use"),
            })
    }

    fn node_name(&self, id: NodeId, fallback: &str) -> String {
        self.names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }

    fn add_data(
        &mut self,
        name: String,
        ctype: CType,
        inline: Option<InlineTransform>,
        transform_inputs: BTreeMap<String, DataId>,
    ) -> DataId {
        let id = Uuid::new_v4();
        self.spec.data.insert(
            id,
            DataNodeSpec {
                name,
                nicknames: BTreeMap::new(),
                ctype,
                inline,
                transform_inputs,
            },
        );
        id
    }

    /// Inline-computed data node for a structural op.
    fn add_inline(
        &mut self,
        id: NodeId,
        label: &str,
        ctype: CType,
        inline: InlineTransform,
        inputs: Vec<(&str, NodeId)>,
    ) -> Result<DataId, CompileError> {
        let mut transform_inputs = BTreeMap::new();
        for (param, node) in inputs {
            transform_inputs.insert(param.to_string(), self.lookup(node)?);
        }
        let name = self.node_name(id, label);
        Ok(self.add_data(name, ctype, Some(inline), transform_inputs))
    }

    fn compile_node(&mut self, id: NodeId, node: &IRNode) -> Result<DataId, CompileError> {
        match node {
            IRNode::Input { name, output_type } => {
                Ok(self.add_data(name.clone(), output_type.clone(), None, BTreeMap::new()))
            }

            IRNode::Literal { value, output_type } => self.add_inline(
                id,
                "literal",
                output_type.clone(),
                InlineTransform::Literal {
                    value: value.clone(),
                },
                vec![],
            ),

            IRNode::ModuleCall {
                module_name,
                function_name,
                inputs,
                output_type,
                options,
            } => {
                let module_id = Uuid::new_v4();
                let signature = self
                    .registry
                    .and_then(|r| r.lookup(function_name));

                let call_site_type = |param: &str| {
                    inputs
                        .get(param)
                        .and_then(|node| self.ir.nodes.get(node))
                        .map(IRNode::output_type)
                        .unwrap_or(CType::String)
                };
                let consumes: BTreeMap<String, CType> = match signature {
                    Some(sig) => sig
                        .params
                        .iter()
                        .map(|(name, ty)| {
                            // Row-polymorphic params lower per call site
                            let ctype = ty
                                .to_ctype()
                                .unwrap_or_else(|_| call_site_type(name));
                            (name.clone(), ctype)
                        })
                        .collect(),
                    // Placeholder spec from the call's declared types
                    None => inputs
                        .iter()
                        .map(|(param, _)| (param.clone(), call_site_type(param)))
                        .collect(),
                };
                let produces: BTreeMap<String, CType> =
                    [("out".to_string(), output_type.clone())].into_iter().collect();

                self.spec.modules.insert(
                    module_id,
                    ModuleNodeSpec {
                        metadata: ModuleMetadata {
                            name: module_name.clone(),
                            function: function_name.clone(),
                            kind: ModuleKind::User,
                            version: signature.map(|s| s.version.clone()),
                        },
                        consumes,
                        produces,
                    },
                );

                for (param, input_node) in inputs {
                    let data_id = self.lookup(*input_node)?;
                    self.spec.in_edges.insert((data_id, module_id));
                    if let Some(data) = self.spec.data.get_mut(&data_id) {
                        data.nicknames.insert(module_id, param.clone());
                    }
                }

                // The per-call option image, with the fallback remapped
                // to its data node
                let mut options = options.clone();
                if let Some(fallback) = options.fallback {
                    options.fallback = Some(self.lookup(fallback)?);
                }
                self.spec.module_options.insert(module_id, options);

                let out_name = self.node_name(id, &format!("{module_name}_out"));
                let out_id =
                    self.add_data(out_name, output_type.clone(), None, BTreeMap::new());
                if let Some(data) = self.spec.data.get_mut(&out_id) {
                    data.nicknames.insert(module_id, "out".to_string());
                }
                self.spec.out_edges.insert((module_id, out_id));
                Ok(out_id)
            }

            IRNode::MakeList { items, elem_type } => {
                let mut transform_inputs = BTreeMap::new();
                for (index, item) in items.iter().enumerate() {
                    transform_inputs.insert(format!("item{index}"), self.lookup(*item)?);
                }
                let name = self.node_name(id, "list");
                Ok(self.add_data(
                    name,
                    CType::List(Box::new(elem_type.clone())),
                    Some(InlineTransform::MakeList {
                        elem_type: elem_type.clone(),
                    }),
                    transform_inputs,
                ))
            }

            IRNode::MakeRecord {
                fields,
                output_type,
            } => {
                let mut transform_inputs = BTreeMap::new();
                for (field, node) in fields {
                    transform_inputs.insert(field.clone(), self.lookup(*node)?);
                }
                let name = self.node_name(id, "record");
                Ok(self.add_data(
                    name,
                    output_type.clone(),
                    Some(InlineTransform::MakeRecord {
                        fields: fields.keys().cloned().collect(),
                    }),
                    transform_inputs,
                ))
            }

            IRNode::Merge {
                left,
                right,
                output_type,
            } => self.add_inline(
                id,
                "merge",
                output_type.clone(),
                InlineTransform::Merge,
                vec![("left", *left), ("right", *right)],
            ),

            IRNode::Project {
                source,
                fields,
                output_type,
            } => self.add_inline(
                id,
                "project",
                output_type.clone(),
                InlineTransform::Project {
                    fields: fields.clone(),
                },
                vec![("source", *source)],
            ),

            IRNode::FieldAccess {
                source,
                field,
                output_type,
            } => self.add_inline(
                id,
                "field",
                output_type.clone(),
                InlineTransform::FieldAccess {
                    field: field.clone(),
                },
                vec![("source", *source)],
            ),

            IRNode::Conditional {
                cond,
                then_node,
                else_node,
                output_type,
            } => self.add_inline(
                id,
                "conditional",
                output_type.clone(),
                InlineTransform::Conditional,
                vec![("cond", *cond), ("then", *then_node), ("else", *else_node)],
            ),

            IRNode::And { left, right } => self.add_inline(
                id,
                "and",
                CType::Boolean,
                InlineTransform::And,
                vec![("left", *left), ("right", *right)],
            ),
            IRNode::Or { left, right } => self.add_inline(
                id,
                "or",
                CType::Boolean,
                InlineTransform::Or,
                vec![("left", *left), ("right", *right)],
            ),
            IRNode::Not { operand } => self.add_inline(
                id,
                "not",
                CType::Boolean,
                InlineTransform::Not,
                vec![("operand", *operand)],
            ),

            IRNode::Scalar {
                op,
                left,
                right,
                output_type,
            } => self.add_inline(
                id,
                "scalar",
                output_type.clone(),
                InlineTransform::Scalar { op: *op },
                vec![("left", *left), ("right", *right)],
            ),

            IRNode::Guard {
                expr,
                cond,
                inner_type,
            } => self.add_inline(
                id,
                "guard",
                CType::Optional(Box::new(inner_type.clone())),
                InlineTransform::Guard {
                    inner_type: inner_type.clone(),
                },
                vec![("expr", *expr), ("cond", *cond)],
            ),

            IRNode::Coalesce {
                left,
                right,
                result_type,
            } => self.add_inline(
                id,
                "coalesce",
                result_type.clone(),
                InlineTransform::Coalesce,
                vec![("left", *left), ("right", *right)],
            ),

            IRNode::StringInterpolation { parts, expressions } => {
                let mut transform_inputs = BTreeMap::new();
                for (index, expr) in expressions.iter().enumerate() {
                    transform_inputs.insert(format!("expr{index}"), self.lookup(*expr)?);
                }
                let name = self.node_name(id, "interpolate");
                Ok(self.add_data(
                    name,
                    CType::String,
                    Some(InlineTransform::Interpolate {
                        parts: parts.clone(),
                    }),
                    transform_inputs,
                ))
            }

            IRNode::Branch {
                cases,
                otherwise,
                result_type,
            } => self.compile_branch(id, cases, *otherwise, result_type),

            IRNode::Match {
                scrutinee,
                arms,
                default,
                output_type,
                captured_inputs,
            } => {
                let mut inputs = vec![("scrutinee".to_string(), *scrutinee)];
                for (name, node) in captured_inputs {
                    inputs.push((name.clone(), *node));
                }
                let mut transform_inputs = BTreeMap::new();
                for (param, node) in inputs {
                    transform_inputs.insert(param, self.lookup(node)?);
                }
                let name = self.node_name(id, "match");
                Ok(self.add_data(
                    name,
                    output_type.clone(),
                    Some(InlineTransform::MatchUnion {
                        arms: arms.clone(),
                        default: default.clone(),
                    }),
                    transform_inputs,
                ))
            }

            IRNode::HigherOrder {
                op,
                source,
                lambda,
                output_type,
                captured_inputs,
            } => {
                let inline = match op {
                    HigherOrderOp::Filter => InlineTransform::Filter {
                        lambda: lambda.clone(),
                    },
                    HigherOrderOp::Map => InlineTransform::Map {
                        lambda: lambda.clone(),
                    },
                    HigherOrderOp::All => InlineTransform::All {
                        lambda: lambda.clone(),
                    },
                    HigherOrderOp::Any => InlineTransform::Any {
                        lambda: lambda.clone(),
                    },
                };
                let mut transform_inputs = BTreeMap::new();
                transform_inputs.insert("source".to_string(), self.lookup(*source)?);
                for (name, node) in captured_inputs {
                    transform_inputs.insert(name.clone(), self.lookup(*node)?);
                }
                let name = self.node_name(id, op.name());
                Ok(self.add_data(name, output_type.clone(), Some(inline), transform_inputs))
            }
        }
    }

    /// Branch lowers to a synthetic module consuming `cond0..condN-1`,
    /// `expr0..exprN-1`, and `otherwise`, producing `out`.
    fn compile_branch(
        &mut self,
        id: NodeId,
        cases: &[(NodeId, NodeId)],
        otherwise: NodeId,
        result_type: &CType,
    ) -> Result<DataId, CompileError> {
        let module_id = Uuid::new_v4();
        let mut consumes = BTreeMap::new();
        let mut wire = |compiler: &mut Self,
                        param: String,
                        node: NodeId,
                        ctype: CType,
                        consumes: &mut BTreeMap<String, CType>|
         -> Result<(), CompileError> {
            let data_id = compiler.lookup(node)?;
            compiler.spec.in_edges.insert((data_id, module_id));
            if let Some(data) = compiler.spec.data.get_mut(&data_id) {
                data.nicknames.insert(module_id, param.clone());
            }
            consumes.insert(param, ctype);
            Ok(())
        };

        for (index, (cond, expr)) in cases.iter().enumerate() {
            wire(
                self,
                format!("cond{index}"),
                *cond,
                CType::Boolean,
                &mut consumes,
            )?;
            wire(
                self,
                format!("expr{index}"),
                *expr,
                result_type.clone(),
                &mut consumes,
            )?;
        }
        wire(
            self,
            "otherwise".to_string(),
            otherwise,
            result_type.clone(),
            &mut consumes,
        )?;

        self.spec.modules.insert(
            module_id,
            ModuleNodeSpec {
                metadata: ModuleMetadata {
                    name: "branch".to_string(),
                    function: "branch".to_string(),
                    kind: ModuleKind::SyntheticBranch {
                        case_count: cases.len(),
                    },
                    version: None,
                },
                consumes,
                produces: [("out".to_string(), result_type.clone())]
                    .into_iter()
                    .collect(),
            },
        );
        self.spec
            .module_options
            .insert(module_id, crate::ir::IRModuleCallOptions::default());

        let out_name = self.node_name(id, "branch_out");
        let out_id = self.add_data(out_name, result_type.clone(), None, BTreeMap::new());
        if let Some(data) = self.spec.data.get_mut(&out_id) {
            data.nicknames.insert(module_id, "out".to_string());
        }
        self.spec.out_edges.insert((module_id, out_id));
        Ok(out_id)
    }
}
