//! Abstract syntax tree data types.
//!
//! Expressions are shared behind [`ExprRef`] so that desugaring and the
//! parser can reuse subtrees without copying them.

use std::rc::Rc;

/// Shared reference to an expression.
pub type ExprRef = Rc<Expr>;

/// Expression.
#[derive(Debug)]
pub enum Expr
{
    /// `"foo"`
    String(String),
    /// `42`
    Int(i64),
    /// The empty expression; yields nil.
    Empty,

    /// `x`
    Variable(String),
    /// `let x = e` — declares a block-local variable.
    Let{
        /// Variable name.
        name: String,
        /// Initializer.
        value: ExprRef,
    },
    /// `x = e`
    Assign{
        /// Variable name.
        name: String,
        /// Assigned value.
        value: ExprRef,
    },

    /// `obj@prop`
    GetProp{
        /// Receiver.
        obj: ExprRef,
        /// Property name.
        name: String,
    },
    /// `obj@prop = e`
    SetProp{
        /// Receiver.
        obj: ExprRef,
        /// Property name.
        name: String,
        /// Assigned value.
        value: ExprRef,
    },
    /// `obj[keys...]` — sugar for `obj.[](keys...)`.
    GetIndex{
        /// Receiver.
        obj: ExprRef,
        /// Index arguments.
        keys: Vec<ExprRef>,
    },
    /// `obj[keys...] = e` — sugar for `obj.[]=(keys..., e)`.
    SetIndex{
        /// Receiver.
        obj: ExprRef,
        /// Index arguments.
        keys: Vec<ExprRef>,
        /// Assigned value.
        value: ExprRef,
    },

    /// `f(args...)`
    Call{
        /// Callee.
        func: ExprRef,
        /// Arguments.
        args: Vec<ExprRef>,
    },
    /// `obj.msg` — message send.
    Send{
        /// Receiver.
        obj: ExprRef,
        /// Message name.
        msg: String,
    },
    /// `op x` — sugar for `x.op`.
    Unary{
        /// Operator name.
        op: String,
        /// Operand.
        value: ExprRef,
    },
    /// `x op y` — sugar for `x.op(y)`.
    Binary{
        /// Operator name.
        op: String,
        /// Left operand.
        lhs: ExprRef,
        /// Right operand.
        rhs: ExprRef,
    },
    /// `x && y` — short-circuit conjunction.
    And{
        /// Left operand.
        lhs: ExprRef,
        /// Right operand, evaluated only when the left is true.
        rhs: ExprRef,
    },
    /// `x || y` — short-circuit disjunction.
    Or{
        /// Left operand.
        lhs: ExprRef,
        /// Right operand, evaluated only when the left is false.
        rhs: ExprRef,
    },

    /// `{ ... }`
    Block(Vec<ExprRef>),
    /// `if c { ... } else if c2 { ... } else { ... }`
    If{
        /// Condition/body pairs, in order.
        branches: Vec<(ExprRef, Vec<ExprRef>)>,
        /// The `else` body, if present.
        otherwise: Option<Vec<ExprRef>>,
    },
    /// `while c { ... }`
    While{
        /// Loop condition.
        cond: ExprRef,
        /// Loop body.
        body: Vec<ExprRef>,
    },
    /// `try { ... } catch e { ... }`
    Try{
        /// Guarded body.
        body: Vec<ExprRef>,
        /// Name the raised value is bound to in the handler.
        error: String,
        /// Handler body.
        handler: Vec<ExprRef>,
    },
    /// `defer e` — runs `e` when the enclosing block exits, normally or
    /// exceptionally.
    Defer(ExprRef),

    /// `fn(args...) { ... }`
    Lambda{
        /// Parameter names.
        args: Vec<String>,
        /// Function body.
        body: Vec<ExprRef>,
    },
    /// `method(args...) { ... }` — sugar for `fn(self) { fn(args...) { ... } }`,
    /// or `fn(self) { ... }` when the argument list is absent.
    Method{
        /// Parameter names, if an argument list was written.
        args: Option<Vec<String>>,
        /// Method body.
        body: Vec<ExprRef>,
    },

    /// `break`
    Break,
    /// `continue`
    Continue,
    /// `return e` — an absent value returns nil.
    Return(Option<ExprRef>),
    /// `throw e`
    Throw(ExprRef),
}
