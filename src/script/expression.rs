//! The linker-script expression language: a borrow-free owned AST and a
//! post-order evaluator.
//!
//! Evaluation failures carry the rendered expression and the reason, so a
//! failing `ASSERT` or address expression names itself in the diagnostic.

use std::fmt;

use crate::error::{Error, Result};
use crate::module::Module;
use crate::object::section_map::OutputSectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Binary operators, in C precedence
pub enum BinaryOp {
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `<=`
    Le,
    /// `>=`
    Ge,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `&`
    BitAnd,
    /// `^`
    BitXor,
    /// `|`
    BitOr,
    /// `&&`
    LogicalAnd,
    /// `||`
    LogicalOr,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitXor => "^",
            BinaryOp::BitOr => "|",
            BinaryOp::LogicalAnd => "&&",
            BinaryOp::LogicalOr => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Unary operators
pub enum UnaryOp {
    /// `-`
    Neg,
    /// `!`
    Not,
    /// `~`
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Script builtin functions
pub enum BuiltinFn {
    /// `ABSOLUTE(expr)`
    Absolute,
    /// `ADDR(section)`
    Addr,
    /// `ALIGN(expr)` / `ALIGN(expr, align)`
    Align,
    /// `ALIGNOF(section)`
    AlignOf,
    /// `DATA_SEGMENT_ALIGN(maxpage, commonpage)`
    DataSegmentAlign,
    /// `DATA_SEGMENT_END(expr)`
    DataSegmentEnd,
    /// `DATA_SEGMENT_RELRO_END(offset, expr)`
    DataSegmentRelroEnd,
    /// `DEFINED(symbol)`
    Defined,
    /// `LENGTH(region)`
    Length,
    /// `LOADADDR(section)`
    LoadAddr,
    /// `LOG2CEIL(expr)`
    Log2Ceil,
    /// `MAX(a, b)`
    Max,
    /// `MIN(a, b)`
    Min,
    /// `ORIGIN(region)`
    Origin,
    /// `SEGMENT_START(name, default)`
    SegmentStart,
    /// `SIZEOF(section)`
    SizeOf,
    /// `SIZEOF_HEADERS`
    SizeOfHeaders,
}

impl BuiltinFn {
    /// Parse a builtin name
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "ABSOLUTE" => BuiltinFn::Absolute,
            "ADDR" => BuiltinFn::Addr,
            "ALIGN" => BuiltinFn::Align,
            "ALIGNOF" => BuiltinFn::AlignOf,
            "DATA_SEGMENT_ALIGN" => BuiltinFn::DataSegmentAlign,
            "DATA_SEGMENT_END" => BuiltinFn::DataSegmentEnd,
            "DATA_SEGMENT_RELRO_END" => BuiltinFn::DataSegmentRelroEnd,
            "DEFINED" => BuiltinFn::Defined,
            "LENGTH" | "len" | "l" => BuiltinFn::Length,
            "LOADADDR" => BuiltinFn::LoadAddr,
            "LOG2CEIL" => BuiltinFn::Log2Ceil,
            "MAX" => BuiltinFn::Max,
            "MIN" => BuiltinFn::Min,
            "ORIGIN" | "org" | "o" => BuiltinFn::Origin,
            "SEGMENT_START" => BuiltinFn::SegmentStart,
            "SIZEOF" => BuiltinFn::SizeOf,
            "SIZEOF_HEADERS" => BuiltinFn::SizeOfHeaders,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            BuiltinFn::Absolute => "ABSOLUTE",
            BuiltinFn::Addr => "ADDR",
            BuiltinFn::Align => "ALIGN",
            BuiltinFn::AlignOf => "ALIGNOF",
            BuiltinFn::DataSegmentAlign => "DATA_SEGMENT_ALIGN",
            BuiltinFn::DataSegmentEnd => "DATA_SEGMENT_END",
            BuiltinFn::DataSegmentRelroEnd => "DATA_SEGMENT_RELRO_END",
            BuiltinFn::Defined => "DEFINED",
            BuiltinFn::Length => "LENGTH",
            BuiltinFn::LoadAddr => "LOADADDR",
            BuiltinFn::Log2Ceil => "LOG2CEIL",
            BuiltinFn::Max => "MAX",
            BuiltinFn::Min => "MIN",
            BuiltinFn::Origin => "ORIGIN",
            BuiltinFn::SegmentStart => "SEGMENT_START",
            BuiltinFn::SizeOf => "SIZEOF",
            BuiltinFn::SizeOfHeaders => "SIZEOF_HEADERS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An owned expression tree
pub enum Expression {
    /// A literal
    Number(u64),
    /// A symbol reference
    Symbol(String),
    /// The location counter
    Dot,
    /// A section or region name handed to a builtin
    Name(String),
    /// Unary application
    Unary {
        /// The operator
        op: UnaryOp,
        /// The operand
        operand: Box<Expression>,
    },
    /// Binary application
    Binary {
        /// The operator
        op: BinaryOp,
        /// Left operand
        lhs: Box<Expression>,
        /// Right operand
        rhs: Box<Expression>,
    },
    /// `cond ? then : otherwise`
    Ternary {
        /// Condition
        cond: Box<Expression>,
        /// Value when nonzero
        then: Box<Expression>,
        /// Value when zero
        otherwise: Box<Expression>,
    },
    /// Builtin call
    Call {
        /// The builtin
        func: BuiltinFn,
        /// Arguments in order
        args: Vec<Expression>,
    },
}

impl Expression {
    /// Shorthand for a literal
    pub fn number(value: u64) -> Self {
        Expression::Number(value)
    }

    /// True when the expression mentions the location counter
    pub fn has_dot(&self) -> bool {
        match self {
            Expression::Dot => true,
            Expression::Number(_) | Expression::Symbol(_) | Expression::Name(_) => false,
            Expression::Unary { operand, .. } => operand.has_dot(),
            Expression::Binary { lhs, rhs, .. } => lhs.has_dot() || rhs.has_dot(),
            Expression::Ternary { cond, then, otherwise } => {
                cond.has_dot() || then.has_dot() || otherwise.has_dot()
            }
            Expression::Call { args, .. } => args.iter().any(Expression::has_dot),
        }
    }

    /// Collect the symbol names the expression references
    pub fn symbol_names(&self, out: &mut Vec<String>) {
        match self {
            Expression::Symbol(name) => out.push(name.clone()),
            Expression::Unary { operand, .. } => operand.symbol_names(out),
            Expression::Binary { lhs, rhs, .. } => {
                lhs.symbol_names(out);
                rhs.symbol_names(out);
            }
            Expression::Ternary { cond, then, otherwise } => {
                cond.symbol_names(out);
                then.symbol_names(out);
                otherwise.symbol_names(out);
            }
            Expression::Call { func, args } => {
                if *func == BuiltinFn::Defined {
                    return;
                }
                for arg in args {
                    arg.symbol_names(out);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Number(n) => write!(f, "{n:#x}"),
            Expression::Symbol(s) | Expression::Name(s) => write!(f, "{s}"),
            Expression::Dot => write!(f, "."),
            Expression::Unary { op, operand } => {
                let sym = match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Not => "!",
                    UnaryOp::BitNot => "~",
                };
                write!(f, "{sym}{operand}")
            }
            Expression::Binary { op, lhs, rhs } => {
                write!(f, "({lhs} {} {rhs})", op.symbol())
            }
            Expression::Ternary { cond, then, otherwise } => {
                write!(f, "({cond} ? {then} : {otherwise})")
            }
            Expression::Call { func, args } => {
                write!(f, "{}(", func.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Everything evaluation needs besides the expression itself
pub struct EvalContext<'a> {
    /// The module holding symbols, output sections, and regions
    pub module: &'a Module,
    /// The location counter at this point
    pub dot: u64,
    /// Inside a SECTIONS block (`.` is meaningful)
    pub inside_sections: bool,
    /// The output section currently being laid out, if any
    pub current_section: Option<OutputSectId>,
}

fn fail(expr: &Expression, reason: impl Into<String>) -> Error {
    Error::ExprEval { context: expr.to_string(), reason: reason.into() }
}

fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        return value;
    }
    value.div_ceil(align) * align
}

fn section_named<'a>(
    ctx: &'a EvalContext<'_>,
    expr: &Expression,
    name: &str,
) -> Result<&'a crate::section::ElfSection> {
    let id = ctx
        .module
        .section_map
        .find(name)
        .ok_or_else(|| fail(expr, format!("no output section named {name}")))?;
    let entry = ctx.module.section_map.entry(id);
    Ok(ctx.module.section(entry.section).elf())
}

fn name_arg<'e>(expr: &Expression, args: &'e [Expression], at: usize) -> Result<&'e str> {
    match args.get(at) {
        Some(Expression::Name(name)) | Some(Expression::Symbol(name)) => Ok(name),
        _ => Err(fail(expr, "expected a name argument")),
    }
}

/// Evaluate `expr` by post-order walk
pub fn eval(expr: &Expression, ctx: &EvalContext<'_>) -> Result<u64> {
    match expr {
        Expression::Number(n) => Ok(*n),
        Expression::Dot => {
            if !ctx.inside_sections {
                return Err(fail(expr, "`.` used outside SECTIONS"));
            }
            Ok(ctx.dot)
        }
        Expression::Name(name) | Expression::Symbol(name) => {
            let info = ctx
                .module
                .name_pool
                .find_info(name)
                .map(|id| ctx.module.name_pool.info(id));
            match info {
                Some(info) if info.is_defined() || info.is_common() => Ok(info.value),
                _ => Err(fail(expr, format!("undefined symbol `{name}`"))),
            }
        }
        Expression::Unary { op, operand } => {
            let v = eval(operand, ctx)?;
            Ok(match op {
                UnaryOp::Neg => v.wrapping_neg(),
                UnaryOp::Not => u64::from(v == 0),
                UnaryOp::BitNot => !v,
            })
        }
        Expression::Binary { op, lhs, rhs } => {
            let l = eval(lhs, ctx)?;
            // Logical operators short-circuit.
            match op {
                BinaryOp::LogicalAnd => {
                    if l == 0 {
                        return Ok(0);
                    }
                    return Ok(u64::from(eval(rhs, ctx)? != 0));
                }
                BinaryOp::LogicalOr => {
                    if l != 0 {
                        return Ok(1);
                    }
                    return Ok(u64::from(eval(rhs, ctx)? != 0));
                }
                _ => {}
            }
            let r = eval(rhs, ctx)?;
            Ok(match op {
                BinaryOp::Mul => l.wrapping_mul(r),
                BinaryOp::Div => {
                    if r == 0 {
                        return Err(fail(expr, "division by zero"));
                    }
                    l / r
                }
                BinaryOp::Rem => {
                    if r == 0 {
                        return Err(fail(expr, "modulo by zero"));
                    }
                    l % r
                }
                BinaryOp::Add => l.wrapping_add(r),
                BinaryOp::Sub => l.wrapping_sub(r),
                BinaryOp::Shl => l.wrapping_shl(r as u32),
                BinaryOp::Shr => l.wrapping_shr(r as u32),
                BinaryOp::Lt => u64::from(l < r),
                BinaryOp::Gt => u64::from(l > r),
                BinaryOp::Le => u64::from(l <= r),
                BinaryOp::Ge => u64::from(l >= r),
                BinaryOp::Eq => u64::from(l == r),
                BinaryOp::Ne => u64::from(l != r),
                BinaryOp::BitAnd => l & r,
                BinaryOp::BitXor => l ^ r,
                BinaryOp::BitOr => l | r,
                BinaryOp::LogicalAnd | BinaryOp::LogicalOr => 0,
            })
        }
        Expression::Ternary { cond, then, otherwise } => {
            if eval(cond, ctx)? != 0 {
                eval(then, ctx)
            } else {
                eval(otherwise, ctx)
            }
        }
        Expression::Call { func, args } => eval_call(expr, *func, args, ctx),
    }
}

fn eval_call(
    expr: &Expression,
    func: BuiltinFn,
    args: &[Expression],
    ctx: &EvalContext<'_>,
) -> Result<u64> {
    let arg = |at: usize| -> Result<&Expression> {
        args.get(at).ok_or_else(|| fail(expr, "missing argument"))
    };
    match func {
        BuiltinFn::Absolute => eval(arg(0)?, ctx),
        BuiltinFn::Addr => {
            let section = section_named(ctx, expr, name_arg(expr, args, 0)?)?;
            section
                .addr
                .ok_or_else(|| fail(expr, "section has no address yet"))
        }
        BuiltinFn::Align => {
            if args.len() == 1 {
                Ok(align_up(ctx.dot, eval(arg(0)?, ctx)?))
            } else {
                Ok(align_up(eval(arg(0)?, ctx)?, eval(arg(1)?, ctx)?))
            }
        }
        BuiltinFn::AlignOf => {
            let section = section_named(ctx, expr, name_arg(expr, args, 0)?)?;
            Ok(section.align)
        }
        BuiltinFn::DataSegmentAlign => {
            let maxpage = eval(arg(0)?, ctx)?;
            Ok(align_up(ctx.dot, maxpage))
        }
        BuiltinFn::DataSegmentEnd | BuiltinFn::DataSegmentRelroEnd => {
            eval(args.last().ok_or_else(|| fail(expr, "missing argument"))?, ctx)
        }
        BuiltinFn::Defined => {
            let name = name_arg(expr, args, 0)?;
            let defined = ctx
                .module
                .name_pool
                .find_info(name)
                .map(|id| ctx.module.name_pool.info(id).is_defined())
                .unwrap_or(false);
            Ok(u64::from(defined))
        }
        BuiltinFn::Length => {
            let name = name_arg(expr, args, 0)?;
            ctx.module
                .memory_region(name)
                .map(|r| r.length)
                .ok_or_else(|| fail(expr, format!("no memory region named {name}")))
        }
        BuiltinFn::LoadAddr => {
            let section = section_named(ctx, expr, name_arg(expr, args, 0)?)?;
            section
                .load_address()
                .ok_or_else(|| fail(expr, "section has no load address yet"))
        }
        BuiltinFn::Log2Ceil => {
            let v = eval(arg(0)?, ctx)?;
            Ok(u64::from(64 - v.saturating_sub(1).leading_zeros()))
        }
        BuiltinFn::Max => Ok(eval(arg(0)?, ctx)?.max(eval(arg(1)?, ctx)?)),
        BuiltinFn::Min => Ok(eval(arg(0)?, ctx)?.min(eval(arg(1)?, ctx)?)),
        BuiltinFn::Origin => {
            let name = name_arg(expr, args, 0)?;
            ctx.module
                .memory_region(name)
                .map(|r| r.origin)
                .ok_or_else(|| fail(expr, format!("no memory region named {name}")))
        }
        BuiltinFn::SegmentStart => eval(arg(1)?, ctx),
        BuiltinFn::SizeOf => {
            let section = section_named(ctx, expr, name_arg(expr, args, 0)?)?;
            Ok(section.size)
        }
        BuiltinFn::SizeOfHeaders => Ok(ctx.module.sizeof_headers()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(module: &Module) -> EvalContext<'_> {
        EvalContext { module, dot: 0x1000, inside_sections: true, current_section: None }
    }

    fn bin(op: BinaryOp, lhs: Expression, rhs: Expression) -> Expression {
        Expression::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    #[test]
    fn arithmetic_and_precedence_shapes() {
        let module = Module::for_tests();
        let e = bin(
            BinaryOp::Add,
            Expression::number(0x10),
            bin(BinaryOp::Mul, Expression::number(4), Expression::number(8)),
        );
        assert_eq!(eval(&e, &ctx(&module)).unwrap(), 0x30);
    }

    #[test]
    fn dot_respects_sections_scope() {
        let module = Module::for_tests();
        let mut c = ctx(&module);
        assert_eq!(eval(&Expression::Dot, &c).unwrap(), 0x1000);
        c.inside_sections = false;
        assert!(eval(&Expression::Dot, &c).is_err());
    }

    #[test]
    fn align_builtin_rounds_up() {
        let module = Module::for_tests();
        let one_arg = Expression::Call {
            func: BuiltinFn::Align,
            args: vec![Expression::number(0x800)],
        };
        assert_eq!(eval(&one_arg, &ctx(&module)).unwrap(), 0x1000);
        let two_arg = Expression::Call {
            func: BuiltinFn::Align,
            args: vec![Expression::number(0x1001), Expression::number(0x10)],
        };
        assert_eq!(eval(&two_arg, &ctx(&module)).unwrap(), 0x1010);
    }

    #[test]
    fn division_by_zero_is_reported_with_context() {
        let module = Module::for_tests();
        let e = bin(BinaryOp::Div, Expression::number(4), Expression::number(0));
        let err = eval(&e, &ctx(&module)).unwrap_err();
        assert!(matches!(err, Error::ExprEval { .. }));
    }

    #[test]
    fn defined_returns_zero_for_unknown_symbols() {
        let module = Module::for_tests();
        let e = Expression::Call {
            func: BuiltinFn::Defined,
            args: vec![Expression::Name("nope".into())],
        };
        assert_eq!(eval(&e, &ctx(&module)).unwrap(), 0);
    }

    #[test]
    fn log2ceil_matches_reference_values() {
        let module = Module::for_tests();
        for (v, want) in [(1u64, 0u64), (2, 1), (3, 2), (4, 2), (1024, 10), (1025, 11)] {
            let e = Expression::Call {
                func: BuiltinFn::Log2Ceil,
                args: vec![Expression::number(v)],
            };
            assert_eq!(eval(&e, &ctx(&module)).unwrap(), want, "LOG2CEIL({v})");
        }
    }
}
