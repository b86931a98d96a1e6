//! Interpret-only expression evaluator over an untyped 8-byte register
//! array, ported from
//! `examples/original_source/expression-evaluation/src/codegen/expression.cc`.
//! The source also lowers each node to LLVM IR for a compiled fast path;
//! SPEC_FULL.md scopes this module to the `evaluate` interpreter only.

use crate::error::{Result, StorageError};

/// The declared type of a node's 8-byte register, reinterpreted from its
/// raw bits on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Int64,
    Double,
}

/// A node in an expression tree. `Argument` indexes into the `args`
/// slice passed to [`Expr::evaluate`]; every other node is built from
/// its children.
#[derive(Debug, Clone)]
pub enum Expr {
    Constant { value: u64, value_type: ValueType },
    Argument { index: usize, value_type: ValueType },
    Cast { child: Box<Expr>, child_type: ValueType, value_type: ValueType },
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn constant_int(value: i64) -> Self {
        Expr::Constant { value: value as u64, value_type: ValueType::Int64 }
    }

    pub fn constant_double(value: f64) -> Self {
        Expr::Constant { value: value.to_bits(), value_type: ValueType::Double }
    }

    pub fn argument(index: usize, value_type: ValueType) -> Self {
        Expr::Argument { index, value_type }
    }

    pub fn cast(child: Expr, value_type: ValueType) -> Self {
        let child_type = child.value_type();
        Expr::Cast { child: Box::new(child), child_type, value_type }
    }

    /// The node's own declared type, not the type of its evaluated
    /// result (those always agree, since every arithmetic node asserts
    /// both children share a type and takes that type itself).
    pub fn value_type(&self) -> ValueType {
        match self {
            Expr::Constant { value_type, .. } => *value_type,
            Expr::Argument { value_type, .. } => *value_type,
            Expr::Cast { value_type, .. } => *value_type,
            Expr::Add(left, _) | Expr::Sub(left, _) | Expr::Mul(left, _) | Expr::Div(left, _) => left.value_type(),
        }
    }

    /// Interprets the tree against `args`, returning a raw 8-byte
    /// register whose bits the caller reinterprets per `value_type()`.
    pub fn evaluate(&self, args: &[u64]) -> Result<u64> {
        match self {
            Expr::Constant { value, .. } => Ok(*value),
            Expr::Argument { index, .. } => args
                .get(*index)
                .copied()
                .ok_or_else(|| StorageError::Storage(format!("expression argument index {index} out of range"))),
            Expr::Cast { child, child_type, value_type } => {
                let value = child.evaluate(args)?;
                Ok(if child_type == value_type {
                    value
                } else if *child_type == ValueType::Double {
                    ((f64::from_bits(value)) as i64) as u64
                } else {
                    ((value as i64) as f64).to_bits()
                })
            }
            Expr::Add(left, right) => binary(left, right, args, |a, b| a + b, |a, b| a + b),
            Expr::Sub(left, right) => binary(left, right, args, |a, b| a - b, |a, b| a - b),
            Expr::Mul(left, right) => binary(left, right, args, |a, b| a * b, |a, b| a * b),
            Expr::Div(left, right) => binary(left, right, args, |a, b| a / b, |a, b| a / b),
        }
    }
}

fn binary(
    left: &Expr,
    right: &Expr,
    args: &[u64],
    int_op: impl Fn(i64, i64) -> i64,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<u64> {
    assert_eq!(left.value_type(), right.value_type(), "arithmetic expression over mismatched value types");
    let l = left.evaluate(args)?;
    let r = right.evaluate(args)?;
    Ok(match left.value_type() {
        ValueType::Int64 => (int_op(l as i64, r as i64)) as u64,
        ValueType::Double => float_op(f64::from_bits(l), f64::from_bits(r)).to_bits(),
    })
}
