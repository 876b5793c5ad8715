//! Expression trees: the immutable AST used by variable alternative-referent
//! expressions and by the rule engine's expression actions.

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::symbol::Symbol;
use crate::types::TypeId;

bitflags! {
    /// Describes how (and whether) an expression can be evaluated.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EvalFlags: u8 {
        /// Value is known without reading the dump.
        const CONSTANT = 0b0001;
        /// Value depends on memory contents at evaluation time.
        const RUNTIME_DEPENDENT = 0b0010;
        /// Value depends on a rule parameter supplied by the caller.
        const PARAMETER = 0b0100;
        /// Cannot be evaluated: reads a runtime-unknown variable, or
        /// divides by an unknown divisor.
        const UNDEFINED = 0b1000;
    }
}

/// Index into an [`ExprArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// One step of a variable-reference's transformation list.
#[derive(Debug, Clone)]
pub enum Transform {
    Field(Symbol),
    Dereference,
    Index(ExprId),
    /// A function-call coercion (e.g. a rule script invoked as part of an
    /// expression); carries the callee name only — the rule engine's
    /// scripting host resolves it.
    Call(Symbol),
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(i128),
    Enumerator(TypeId, Symbol),
    VariableRef { var: Symbol, transforms: SmallVec<[Transform; 2]> },
    Unary(UnaryOp, ExprId),
    Binary(BinaryOp, ExprId, ExprId),
}

/// Reports whether a [`Symbol`] names a variable actually installed in the
/// type graph — used by [`ExprArena::flags`] to classify a `VariableRef`
/// to a variable nothing ever installed as [`EvalFlags::UNDEFINED`] (spec
/// §3: "reads a runtime-unknown variable"). Implemented against the
/// static variable table only; this is still pure structural analysis,
/// never a dump read.
pub trait KnownVariables {
    fn is_known_variable(&self, var: Symbol) -> bool;
}

/// Owns a batch of expressions by value, addressed by index — the
/// permanent, process-lifetime arena the type graph's variables and
/// members reference.
#[derive(Debug, Default)]
pub struct ExprArena {
    nodes: Vec<Expr>,
}

impl ExprArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, expr: Expr) -> ExprId {
        let id = ExprId(u32::try_from(self.nodes.len()).expect("expression arena overflow"));
        self.nodes.push(expr);
        id
    }

    #[must_use]
    pub fn get(&self, id: ExprId) -> &Expr {
        &self.nodes[id.0 as usize]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Static evaluability classification: does this expression tree ever
    /// need a runtime read, a caller-supplied parameter, or is it fully
    /// known ahead of time? Pure structural analysis — no dump access,
    /// though `known` is consulted to tell an installed variable from one
    /// nothing ever defined.
    ///
    /// `UNDEFINED` (spec §3's resultType invariant) is set for a
    /// `VariableRef` naming a variable `known` doesn't recognise, and for
    /// a `Div`/`Mod` whose divisor isn't provably `CONSTANT`; it otherwise
    /// propagates up through `Unary`/`Binary` the same way every other
    /// flag does.
    #[must_use]
    pub fn flags(&self, id: ExprId, known: &dyn KnownVariables) -> EvalFlags {
        match self.get(id) {
            Expr::Literal(_) | Expr::Enumerator(..) => EvalFlags::CONSTANT,
            Expr::VariableRef { var, transforms } => {
                let mut flags = EvalFlags::RUNTIME_DEPENDENT;
                if !known.is_known_variable(*var) {
                    flags |= EvalFlags::UNDEFINED;
                }
                for t in transforms {
                    if let Transform::Index(idx) = t {
                        flags |= self.flags(*idx, known);
                    }
                    if matches!(t, Transform::Call(_)) {
                        flags |= EvalFlags::PARAMETER;
                    }
                }
                flags
            }
            Expr::Unary(_, operand) => self.flags(*operand, known),
            Expr::Binary(op, lhs, rhs) => {
                let lhs_flags = self.flags(*lhs, known);
                let rhs_flags = self.flags(*rhs, known);
                let mut flags = lhs_flags | rhs_flags;
                if matches!(op, BinaryOp::Div | BinaryOp::Mod) && !rhs_flags.contains(EvalFlags::CONSTANT) {
                    flags |= EvalFlags::UNDEFINED;
                }
                flags
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AllKnown;
    impl KnownVariables for AllKnown {
        fn is_known_variable(&self, _: Symbol) -> bool {
            true
        }
    }

    struct NoneKnown;
    impl KnownVariables for NoneKnown {
        fn is_known_variable(&self, _: Symbol) -> bool {
            false
        }
    }

    #[test]
    fn literal_is_constant() {
        let mut arena = ExprArena::new();
        let lit = arena.alloc(Expr::Literal(42));
        assert_eq!(arena.flags(lit, &AllKnown), EvalFlags::CONSTANT);
    }

    #[test]
    fn variable_ref_is_runtime_dependent() {
        let mut arena = ExprArena::new();
        let v = arena.alloc(Expr::VariableRef { var: Symbol::default(), transforms: SmallVec::new() });
        let flags = arena.flags(v, &AllKnown);
        assert!(flags.contains(EvalFlags::RUNTIME_DEPENDENT));
        assert!(!flags.contains(EvalFlags::UNDEFINED));
    }

    #[test]
    fn variable_ref_to_unknown_variable_is_undefined() {
        let mut arena = ExprArena::new();
        let v = arena.alloc(Expr::VariableRef { var: Symbol::default(), transforms: SmallVec::new() });
        assert!(arena.flags(v, &NoneKnown).contains(EvalFlags::UNDEFINED));
    }

    #[test]
    fn binary_propagates_runtime_dependence() {
        let mut arena = ExprArena::new();
        let v = arena.alloc(Expr::VariableRef { var: Symbol::default(), transforms: SmallVec::new() });
        let lit = arena.alloc(Expr::Literal(1));
        let add = arena.alloc(Expr::Binary(BinaryOp::Add, v, lit));
        assert!(arena.flags(add, &AllKnown).contains(EvalFlags::RUNTIME_DEPENDENT));
    }

    #[test]
    fn division_by_non_constant_divisor_is_undefined() {
        let mut arena = ExprArena::new();
        let v = arena.alloc(Expr::VariableRef { var: Symbol::default(), transforms: SmallVec::new() });
        let ten = arena.alloc(Expr::Literal(10));
        let div = arena.alloc(Expr::Binary(BinaryOp::Div, ten, v));
        assert!(arena.flags(div, &AllKnown).contains(EvalFlags::UNDEFINED));
    }

    #[test]
    fn division_by_constant_divisor_is_not_undefined() {
        let mut arena = ExprArena::new();
        let ten = arena.alloc(Expr::Literal(10));
        let two = arena.alloc(Expr::Literal(2));
        let div = arena.alloc(Expr::Binary(BinaryOp::Div, ten, two));
        assert!(!arena.flags(div, &AllKnown).contains(EvalFlags::UNDEFINED));
    }
}
