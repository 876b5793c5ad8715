//! Expression evaluation: turns an [`Expr`] tree into a numeric value
//! against a concrete address space.
//!
//! Grounded in the rule engine's "dynamic dispatch into a script host"
//! design note: this module is the in-process half that the `Expression`
//! action variant evaluates directly; script actions delegate to a
//! pluggable host instead (see `rules::ScriptHost`). An undecidable
//! expression (an unknown variable, a runtime-dependent divisor that turns
//! out to be zero) is always recovered here — never propagated past the
//! caller that asked for the value — matching the `expression_eval` error
//! kind's "always recovered" contract.

use crate::error::EngineError;
use crate::instance::{DerefMode, Instance};
use crate::symbol::Symbol;
use crate::types::{BinaryOp, Expr, ExprArena, ExprId, Transform, TypeGraph, TypeKind, UnaryOp};
use crate::vmem::AddressSpace;

/// The symbol a rule's expression action uses to reference its source
/// instance — distinct from any global variable name, so `self.next` and a
/// global named `self` can never collide.
pub const SELF_SYMBOL: &str = "__self";

/// Resolves a `VariableRef`'s base instance. Implemented once for plain
/// global-variable expressions (a variable's `alt_referents`) and once more
/// for rule actions, which additionally bind [`SELF_SYMBOL`] to the rule's
/// source instance.
pub trait VariableResolver {
    fn resolve(&self, name: Symbol) -> Option<Instance>;
}

/// Resolves only against the type graph's global variables — the resolver
/// a [`crate::types::Variable`]'s own alternative-referent expressions
/// evaluate against; there is no "self" to bind.
pub struct GlobalResolver<'g> {
    pub graph: &'g TypeGraph,
}

impl VariableResolver for GlobalResolver<'_> {
    fn resolve(&self, name: Symbol) -> Option<Instance> {
        let var = self.graph.variable(name)?;
        Some(Instance::root(var.address, var.referent, name))
    }
}

/// Evaluates `id` to a numeric value (an address, an integer, a boolean
/// coerced to 0/1). Transform chains on a `VariableRef` step through
/// `member`/`dereference`/`array_elem` exactly as the instance layer
/// defines them; the final instance is coerced to a number by reading its
/// value if it is a scalar/pointer, or taking its address otherwise.
pub fn evaluate(
    arena: &ExprArena,
    graph: &TypeGraph,
    space: &dyn AddressSpace,
    resolver: &dyn VariableResolver,
    id: ExprId,
) -> Result<i128, EngineError> {
    match arena.get(id) {
        Expr::Literal(v) => Ok(*v),
        // Enumerator values are folded into a literal by the ingestion
        // pipeline before an expression referencing them is evaluated here;
        // a bare `Enumerator` reaching this point carries no further
        // evaluable payload.
        Expr::Enumerator(_, _) => Ok(0),
        Expr::VariableRef { var, transforms } => {
            let mut instance = resolver
                .resolve(*var)
                .ok_or_else(|| EngineError::ExpressionEval(format!("unknown variable {var:?}")))?;
            for t in transforms {
                instance = apply_transform(arena, graph, space, resolver, &instance, t)?;
            }
            instance_to_numeric(&instance, graph, space)
        }
        Expr::Unary(op, operand) => {
            let v = evaluate(arena, graph, space, resolver, *operand)?;
            Ok(match op {
                UnaryOp::Neg => v.wrapping_neg(),
                UnaryOp::Not => i128::from(v == 0),
                UnaryOp::BitNot => !v,
            })
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = evaluate(arena, graph, space, resolver, *lhs)?;
            let r = evaluate(arena, graph, space, resolver, *rhs)?;
            eval_binary(*op, l, r)
        }
    }
}

fn eval_binary(op: BinaryOp, l: i128, r: i128) -> Result<i128, EngineError> {
    Ok(match op {
        BinaryOp::Add => l.wrapping_add(r),
        BinaryOp::Sub => l.wrapping_sub(r),
        BinaryOp::Mul => l.wrapping_mul(r),
        BinaryOp::Div => {
            if r == 0 {
                return Err(EngineError::ExpressionEval("division by unknown/zero divisor".into()));
            }
            l.wrapping_div(r)
        }
        BinaryOp::Mod => {
            if r == 0 {
                return Err(EngineError::ExpressionEval("modulo by unknown/zero divisor".into()));
            }
            l.wrapping_rem(r)
        }
        BinaryOp::Shl => l.wrapping_shl(u32::try_from(r & 0x7f).unwrap_or(0)),
        BinaryOp::Shr => l.wrapping_shr(u32::try_from(r & 0x7f).unwrap_or(0)),
        BinaryOp::BitAnd => l & r,
        BinaryOp::BitOr => l | r,
        BinaryOp::BitXor => l ^ r,
        BinaryOp::Eq => i128::from(l == r),
        BinaryOp::Ne => i128::from(l != r),
        BinaryOp::Lt => i128::from(l < r),
        BinaryOp::Le => i128::from(l <= r),
        BinaryOp::Gt => i128::from(l > r),
        BinaryOp::Ge => i128::from(l >= r),
    })
}

fn apply_transform(
    arena: &ExprArena,
    graph: &TypeGraph,
    space: &dyn AddressSpace,
    resolver: &dyn VariableResolver,
    instance: &Instance,
    transform: &Transform,
) -> Result<Instance, EngineError> {
    match transform {
        Transform::Field(name) => instance.member(graph, *name),
        Transform::Dereference => instance.dereference(graph, space, DerefMode::all(), 1),
        Transform::Index(idx_expr) => {
            let idx = evaluate(arena, graph, space, resolver, *idx_expr)?;
            instance.array_elem(graph, idx.max(0) as u64)
        }
        // Function-call coercions are a scripting-host concern; evaluated
        // in-process they are the identity coercion.
        Transform::Call(_name) => Ok(instance.clone()),
    }
}

fn instance_to_numeric(instance: &Instance, graph: &TypeGraph, space: &dyn AddressSpace) -> Result<i128, EngineError> {
    let kind = graph
        .find_by_id(instance.type_id)
        .map(|t| &t.kind)
        .ok_or_else(|| EngineError::ExpressionEval("unresolved type in expression".into()))?;
    match kind {
        TypeKind::Pointer { .. } => instance
            .to_pointer(graph, space)
            .map(i128::from)
            .map_err(|_| EngineError::ExpressionEval("pointer read failed".into())),
        TypeKind::Int { .. } | TypeKind::Bool { .. } | TypeKind::Enum { .. } => instance
            .to_integer(graph, space)
            .map_err(|_| EngineError::ExpressionEval("integer read failed".into())),
        // Struct/array/union/etc: the expression refers to the object
        // itself, so its address is the numeric value (`&s` semantics).
        _ => Ok(i128::from(instance.address)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::SliceDump;
    use crate::memspec::{KernelVersion, MemSpecs};
    use crate::symbol::Interner;
    use crate::types::{AggregateKind, DebugRecord, MemberRecord, RecordBody};
    use crate::vmem::VirtualMemory;
    use std::sync::Arc;

    fn specs() -> Arc<MemSpecs> {
        Arc::new(MemSpecs {
            page_offset: 0,
            vmalloc_start: u64::MAX,
            vmalloc_end: u64::MAX,
            vmalloc_offset: 0,
            vmemmap_start: 0,
            vmemmap_end: 0,
            modules_vaddr: 0,
            modules_end: 0,
            start_kernel_map: 0,
            page_table_root: 0,
            high_memory: 0,
            vmalloc_early_reserve: 0,
            list_poison_1: 0,
            list_poison_2: 0,
            max_errno: 4095,
            sizeof_long: 8,
            sizeof_pointer: 8,
            arch: crate::config::Arch::X86_64,
            version: KernelVersion::default(),
            symbol_map: Default::default(),
        })
    }

    #[test]
    fn literal_arithmetic() {
        let mut arena = ExprArena::new();
        let a = arena.alloc(Expr::Literal(4));
        let b = arena.alloc(Expr::Literal(3));
        let add = arena.alloc(Expr::Binary(BinaryOp::Add, a, b));
        let graph = TypeGraph::new();
        let dump = SliceDump::new(vec![0u8; 16]);
        let space = VirtualMemory::new(dump, specs(), 8);
        struct NoVars;
        impl VariableResolver for NoVars {
            fn resolve(&self, _: Symbol) -> Option<Instance> {
                None
            }
        }
        let value = evaluate(&arena, &graph, &space, &NoVars, add).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn division_by_zero_is_undefined_not_fatal() {
        let mut arena = ExprArena::new();
        let a = arena.alloc(Expr::Literal(10));
        let z = arena.alloc(Expr::Literal(0));
        let div = arena.alloc(Expr::Binary(BinaryOp::Div, a, z));
        let graph = TypeGraph::new();
        let dump = SliceDump::new(vec![0u8; 16]);
        let space = VirtualMemory::new(dump, specs(), 8);
        struct NoVars;
        impl VariableResolver for NoVars {
            fn resolve(&self, _: Symbol) -> Option<Instance> {
                None
            }
        }
        let err = evaluate(&arena, &graph, &space, &NoVars, div).unwrap_err();
        assert!(matches!(err, EngineError::ExpressionEval(_)));
    }

    #[test]
    fn variable_field_access_reads_member_value() {
        let mut graph = TypeGraph::new();
        let mut interner = Interner::new();
        graph
            .add(DebugRecord { id: 1, name: Some("int".into()), size: 4, body: RecordBody::Int { bits: 32, signed: true }, compile_unit: None }, &mut interner)
            .unwrap();
        graph
            .add(
                DebugRecord {
                    id: 2,
                    name: Some("pair".into()),
                    size: 8,
                    body: RecordBody::Aggregate {
                        kind: AggregateKind::Struct,
                        members: vec![MemberRecord {
                            name: Some("a".into()),
                            offset: 0,
                            referent: 1,
                            bit_size: None,
                            bit_offset: None,
                            observed_constants: vec![],
                        }],
                    },
                    compile_unit: None,
                },
                &mut interner,
            )
            .unwrap();
        graph.add(DebugRecord { id: 3, name: Some("root".into()), size: 0, body: RecordBody::Variable { referent: 2, address: 0 }, compile_unit: None }, &mut interner).unwrap();

        let mut backing = vec![0u8; 16];
        backing[0..4].copy_from_slice(&9i32.to_le_bytes());
        let dump = SliceDump::new(backing);
        let space = VirtualMemory::new(dump, specs(), 8);

        let root_sym = interner.intern("root");
        let a_sym = interner.intern("a");
        let mut arena = ExprArena::new();
        let expr = arena.alloc(Expr::VariableRef { var: root_sym, transforms: smallvec::smallvec![Transform::Field(a_sym)] });

        let resolver = GlobalResolver { graph: &graph };
        let value = evaluate(&arena, &graph, &space, &resolver, expr).unwrap();
        assert_eq!(value, 9);
    }
}
