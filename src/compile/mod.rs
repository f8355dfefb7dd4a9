//! Translation of expression trees into bytecode functions.
//!
//! The compiler consumes the parser's [`Expr`] nodes and produces a
//! [`Function`] whose proto carries bytecode and a constant pool.
//! Compilation simulates the VM data stack: every expression nets one
//! value, locals are stack slots addressed relative to the enclosing
//! function's frame, and blocks collapse their interior slots when they
//! finish. Name capture across nested functions is resolved during
//! compilation and materializes as `MakeUp`/`CopyUp` instructions in
//! the enclosing functions.

use {
    crate::{
        bytecode::{Instruction, Opcode},
        context::Context,
        heap::{Ptr, Root},
        syntax::ast::{Expr, ExprRef},
        value::{Function, Value},
    },
    self::env::{BlockEnv, BlockKind, Deferral, FunctionEnv, LoopBlock},
    log::debug,
    std::rc::Rc,
    thiserror::Error as ThisError,
};

mod env;

/// Placeholder argument for jumps patched later.
const UNPATCHED: u32 = Instruction::MAX_ARG;

/// Compilation result.
pub type Result<T> = std::result::Result<T, Error>;

/// Compilation error.
#[derive(Debug, ThisError)]
pub enum Error
{
    /// The named variable is neither a local, nor capturable from an
    /// enclosing function, nor a builtin.
    #[error("Variable `{0}` not found")]
    VariableNotFound(String),

    /// `break` appeared with no enclosing loop.
    #[error("Break can only be used inside of a loop")]
    BreakOutsideLoop,

    /// `continue` appeared with no enclosing loop.
    #[error("Continue can only be used inside of a loop")]
    ContinueOutsideLoop,

    /// `break` would leave a deferred expression.
    #[error("Break can't leave a deferred expression")]
    BreakAcrossDefer,

    /// `continue` would leave a deferred expression.
    #[error("Continue can't leave a deferred expression")]
    ContinueAcrossDefer,

    /// `return` appeared inside a deferred expression.
    #[error("Return can't be used inside a deferred expression")]
    ReturnInsideDefer,

    /// The function needs more constants than an instruction argument
    /// can address.
    #[error("Too many constants")]
    TooManyConstants,
}

/// Compiles expression sequences into executable functions.
pub struct Compiler<'a>
{
    ctx: &'a Context,
    /// Functions being compiled, outermost first. Rooted so constants
    /// already interned in a proto survive collections triggered by
    /// later allocations.
    functions: Root<Vec<FunctionEnv>>,
}

impl<'a> Compiler<'a>
{
    /// Create a compiler tied to the given context.
    pub fn new(ctx: &'a Context) -> Self
    {
        Self{ctx, functions: ctx.root(Vec::new())}
    }

    /// Compile a sequence of expressions into the program's main
    /// function.
    ///
    /// Every builtin of the context is loaded as a pre-declared local
    /// of the main function, forming the program's outermost lexical
    /// scope. The program's value is its last expression.
    pub fn compile(&self, body: &[ExprRef]) -> Result<Root<Ptr<Function>>>
    {
        self.functions.borrow_mut().clear();
        self.push_func();
        self.push_block(BlockKind::Plain);
        for (name, value) in self.ctx.builtins() {
            self.compile_constant(value)?;
            self.pop_local();
            self.define_variable(&name);
        }
        for expr in body {
            self.declare_expr(expr);
        }
        self.compile_expr_chain(body)?;
        let height = self.locals();
        for index in (0 .. self.block_count()).rev() {
            self.leave_block(index, height);
        }
        self.emit(Opcode::Return);
        let env = self.functions.borrow_mut().pop().expect("No function is being compiled");
        let proto = self.ctx.alloc(env.proto);
        let func = self.ctx.alloc(Function::new(proto.get()));
        debug!(
            "compiled main: {} instructions, {} constants",
            proto.get().borrow().code.len(),
            proto.get().borrow().constants.len(),
        );
        Ok(func)
    }

    /* ------------------------------- Plumbing ------------------------------- */

    fn with_func<R>(&self, f: impl FnOnce(&mut FunctionEnv) -> R) -> R
    {
        let mut functions = self.functions.borrow_mut();
        f(functions.last_mut().expect("No function is being compiled"))
    }

    fn with_block<R>(&self, f: impl FnOnce(&mut BlockEnv) -> R) -> R
    {
        self.with_func(|func| {
            f(func.blocks.last_mut().expect("No block is being compiled"))
        })
    }

    fn push_func(&self)
    {
        self.functions.borrow_mut().push(FunctionEnv::default());
    }

    fn push_block(&self, kind: BlockKind)
    {
        self.with_func(|func| {
            let bottom = func.locals;
            func.blocks.push(BlockEnv::new(bottom, kind));
        });
    }

    fn pop_block(&self)
    {
        self.with_func(|func| {
            let block = func.blocks.pop().expect("No block is being compiled");
            func.locals = block.bottom;
        });
    }

    fn block_count(&self) -> usize
    {
        self.with_func(|func| func.blocks.len())
    }

    fn locals(&self) -> usize
    {
        self.with_func(|func| func.locals)
    }

    fn push_local(&self)
    {
        self.with_func(|func| func.locals += 1);
    }

    fn pop_local(&self)
    {
        self.with_func(|func| func.locals -= 1);
    }

    fn address(&self) -> usize
    {
        self.with_func(|func| func.proto.code.len())
    }

    fn emit(&self, op: Opcode)
    {
        self.with_func(|func| func.proto.code.push(Instruction::new(op)));
    }

    fn emit_arg(&self, op: Opcode, arg: u32)
    {
        self.with_func(|func| func.proto.code.push(Instruction::with_arg(op, arg)));
    }

    fn patch(&self, addr: usize, target: usize)
    {
        self.with_func(|func| func.proto.code[addr].set_arg(target as u32));
    }

    fn define_variable(&self, name: &str)
    {
        self.with_func(|func| {
            let index = func.locals;
            func.blocks.last_mut().expect("No block is being compiled")
                .definitions.insert(name.to_owned(), index);
            func.locals += 1;
        });
    }

    /* ------------------------------- Constants ------------------------------ */

    fn compile_constant(&self, value: Value) -> Result<()>
    {
        let index = self.with_func(|func| {
            let index = func.proto.constants.len();
            func.proto.constants.push(value);
            index
        });
        if index > Instruction::MAX_ARG as usize {
            return Err(Error::TooManyConstants);
        }
        self.emit_arg(Opcode::GetConst, index as u32);
        self.push_local();
        Ok(())
    }

    fn compile_string(&self, value: &str) -> Result<()>
    {
        let string = self.ctx.alloc(value.to_owned());
        self.compile_constant(Value::String(string.get()))
    }

    fn compile_int(&self, value: i64) -> Result<()>
    {
        self.compile_constant(Value::Int(value))
    }

    fn compile_nil(&self)
    {
        self.emit(Opcode::Nil);
        self.push_local();
    }

    /* ------------------------------- Variables ------------------------------ */

    fn compile_variable(&self, name: &str) -> Result<()>
    {
        if let Some(index) = self.lookup_local(name) {
            self.emit_arg(Opcode::GetVar, index as u32);
        }
        else if let Some(index) = self.lookup_upvalue(name) {
            self.emit_arg(Opcode::GetUp, index as u32);
        }
        else {
            return Err(Error::VariableNotFound(name.to_owned()));
        }
        self.push_local();
        Ok(())
    }

    fn compile_let(&self, name: &str, value: &ExprRef) -> Result<()>
    {
        let index = self.with_block(|block| {
            block.declarations.get(name).and_then(|indices| indices.front().copied())
        });
        let index = index.expect("Variable was not predeclared");
        self.compile_expr(value)?;
        self.emit(Opcode::Dup);
        self.emit_arg(Opcode::SetVar, index as u32);
        self.with_block(|block| {
            block.definitions.insert(name.to_owned(), index);
            block.declarations.get_mut(name)
                .expect("Variable was not predeclared")
                .pop_front();
        });
        Ok(())
    }

    fn compile_assign(&self, name: &str, value: &ExprRef) -> Result<()>
    {
        self.compile_expr(value)?;
        self.emit(Opcode::Dup);
        if let Some(index) = self.lookup_local(name) {
            self.emit_arg(Opcode::SetVar, index as u32);
        }
        else if let Some(index) = self.lookup_upvalue(name) {
            self.emit_arg(Opcode::SetUp, index as u32);
        }
        else {
            return Err(Error::VariableNotFound(name.to_owned()));
        }
        Ok(())
    }

    fn lookup_local(&self, name: &str) -> Option<usize>
    {
        self.with_func(|func| {
            func.blocks.iter().rev()
                .find_map(|block| block.definitions.get(name).copied())
        })
    }

    fn lookup_upvalue(&self, name: &str) -> Option<usize>
    {
        let mut functions = self.functions.borrow_mut();
        let level = functions.len() - 1;
        lookup_upvalue_rec(&mut functions, level, name)
    }

    /* ------------------------------ Declarations ----------------------------- */

    /// Pre-walk a block's expression to reserve a slot for every `let`
    /// that will execute in it.
    ///
    /// Reserving slots up front lets a lambda capture a variable that
    /// is only defined later in the same block, which is what makes
    /// mutually recursive lambdas work. Nodes that open their own scope
    /// are not entered.
    fn declare_expr(&self, expr: &Expr)
    {
        match expr {
            Expr::Let{name, value} => {
                self.declare_expr(value);
                let index = self.locals();
                self.with_block(|block| {
                    block.declarations.entry(name.clone()).or_default().push_back(index);
                });
                self.compile_nil();
            }
            Expr::Assign{value, ..} => self.declare_expr(value),
            Expr::GetProp{obj, ..} => self.declare_expr(obj),
            Expr::SetProp{obj, value, ..} => {
                self.declare_expr(obj);
                self.declare_expr(value);
            }
            Expr::GetIndex{obj, keys} => {
                self.declare_expr(obj);
                for key in keys {
                    self.declare_expr(key);
                }
            }
            Expr::SetIndex{obj, keys, value} => {
                self.declare_expr(obj);
                for key in keys {
                    self.declare_expr(key);
                }
                self.declare_expr(value);
            }
            Expr::Call{func, args} => {
                self.declare_expr(func);
                for arg in args {
                    self.declare_expr(arg);
                }
            }
            Expr::Send{obj, ..} => self.declare_expr(obj),
            Expr::Unary{value, ..} => self.declare_expr(value),
            Expr::Binary{lhs, rhs, ..} => {
                self.declare_expr(lhs);
                self.declare_expr(rhs);
            }
            Expr::And{lhs, ..} => self.declare_expr(lhs),
            Expr::Or{lhs, ..} => self.declare_expr(lhs),
            Expr::Return(Some(value)) => self.declare_expr(value),
            Expr::Throw(value) => self.declare_expr(value),
            _ => {}
        }
    }

    /* ---------------------------- Leave sequences ---------------------------- */

    /// Re-emit a deferral's copied code at the current address,
    /// re-basing stack indices to the given local count and jump
    /// targets to the current program counter, then pop its handler.
    fn emit_deferral(&self, deferral: &Deferral, height: usize)
    {
        let base = self.address();
        self.with_func(|func| {
            for instr in &deferral.code {
                let arg = match instr.op {
                    Opcode::Jump | Opcode::JumpIf | Opcode::JumpUnless | Opcode::Catch =>
                        instr.arg() as usize - deferral.address + base,
                    Opcode::GetVar | Opcode::SetVar | Opcode::MakeUp
                        if instr.arg() as usize >= deferral.bottom =>
                        instr.arg() as usize - deferral.bottom + height,
                    _ => instr.arg() as usize,
                };
                func.proto.code.push(Instruction::with_arg(instr.op, arg as u32));
            }
        });
        self.emit(Opcode::Uncatch);
    }

    /// Emit the exit effects of one block: deferrals fire in reverse
    /// registration order, then a try block's handler is popped. The
    /// stack shape is left alone.
    fn leave_block(&self, index: usize, height: usize)
    {
        let deferrals = self.with_func(|func| std::mem::take(&mut func.blocks[index].deferrals));
        for deferral in deferrals.iter().rev() {
            self.emit_deferral(deferral, height);
        }
        self.with_func(|func| func.blocks[index].deferrals = deferrals);
        let is_try = self.with_func(|func| matches!(func.blocks[index].kind, BlockKind::Try));
        if is_try {
            self.emit(Opcode::Uncatch);
        }
    }

    /// Leave the innermost block keeping its topmost value: run the
    /// block's exit effects, then nip the interior locals away.
    fn compile_leave_nip(&self)
    {
        let index = self.block_count() - 1;
        let height = self.locals();
        self.leave_block(index, height);
        let bottom = self.with_func(|func| func.blocks[index].bottom);
        for _ in 0 .. height - bottom - 1 {
            self.emit(Opcode::Nip);
        }
    }

    /// Leave the innermost block discarding everything it pushed.
    fn compile_leave_pop(&self)
    {
        let index = self.block_count() - 1;
        let height = self.locals();
        self.leave_block(index, height);
        let bottom = self.with_func(|func| func.blocks[index].bottom);
        for _ in 0 .. height - bottom {
            self.emit(Opcode::Pop);
        }
    }

    /* --------------------------------- Blocks -------------------------------- */

    fn compile_block(&self, exprs: &[ExprRef], kind: BlockKind) -> Result<()>
    {
        self.push_block(kind);
        for expr in exprs {
            self.declare_expr(expr);
        }
        self.compile_expr_chain(exprs)?;
        self.compile_leave_nip();
        self.pop_block();
        self.push_local();
        Ok(())
    }

    fn compile_expr_chain(&self, exprs: &[ExprRef]) -> Result<()>
    {
        let Some((first, rest)) = exprs.split_first() else {
            self.compile_nil();
            return Ok(());
        };
        self.compile_expr(first)?;
        for expr in rest {
            self.emit(Opcode::Pop);
            self.pop_local();
            self.compile_expr(expr)?;
        }
        Ok(())
    }

    fn compile_if(
        &self,
        branches: &[(ExprRef, Vec<ExprRef>)],
        otherwise: Option<&[ExprRef]>,
    ) -> Result<()>
    {
        // Each branch is two nested regions: one for the predicate, one
        // for the body. This keeps predicate locals out of the body's
        // scope without predeclaring anything for it.
        let mut finish_jumps = Vec::new();
        for (cond, body) in branches {
            self.push_block(BlockKind::Plain);
            self.declare_expr(cond);
            self.compile_expr(cond)?;
            let next = self.address();
            self.emit_arg(Opcode::JumpUnless, UNPATCHED);
            self.pop_local();
            // True: evaluate the body, drop predicate locals, jump out.
            self.compile_block(body, BlockKind::Plain)?;
            self.compile_leave_nip();
            finish_jumps.push(self.address());
            self.emit_arg(Opcode::Jump, UNPATCHED);
            self.pop_local();
            // False: drop predicate locals, try the next branch.
            let target = self.address();
            self.patch(next, target);
            self.compile_leave_pop();
            self.pop_block();
        }
        match otherwise {
            Some(body) => self.compile_block(body, BlockKind::Plain)?,
            None => self.compile_nil(),
        }
        let target = self.address();
        for jump in finish_jumps {
            self.patch(jump, target);
        }
        Ok(())
    }

    fn compile_while(&self, cond: &ExprRef, body: &[ExprRef]) -> Result<()>
    {
        let start = self.address();
        self.push_block(BlockKind::Loop(LoopBlock::default()));
        self.declare_expr(cond);
        self.compile_expr(cond)?;
        let finish = self.address();
        self.emit_arg(Opcode::JumpUnless, UNPATCHED);
        self.pop_local();
        // True: run the body, drop its value, close the iteration.
        self.compile_block(body, BlockKind::Plain)?;
        self.emit(Opcode::Pop);
        self.pop_local();
        let continue_target = self.address();
        self.compile_leave_pop();
        self.emit_arg(Opcode::Jump, start as u32);
        // False: drop the loop's locals and yield nil. Breaks join the
        // exit path before its leave sequence.
        let break_target = self.address();
        self.patch(finish, break_target);
        self.compile_leave_pop();
        let (continues, breaks) = self.with_block(|block| match &mut block.kind {
            BlockKind::Loop(jumps) => (
                std::mem::take(&mut jumps.continue_jumps),
                std::mem::take(&mut jumps.break_jumps),
            ),
            _ => unreachable!("Loop block changed kind"),
        });
        for jump in continues {
            self.patch(jump, continue_target);
        }
        for jump in breaks {
            self.patch(jump, break_target);
        }
        self.pop_block();
        self.compile_nil();
        Ok(())
    }

    fn compile_try(&self, body: &[ExprRef], error: &str, handler: &[ExprRef]) -> Result<()>
    {
        let catch = self.address();
        self.emit_arg(Opcode::Catch, UNPATCHED);
        self.compile_block(body, BlockKind::Try)?;
        let finish = self.address();
        self.emit_arg(Opcode::Jump, UNPATCHED);
        self.pop_local();
        // The raised value arrives on the stack and becomes a variable
        // of the handler's scope.
        let target = self.address();
        self.patch(catch, target);
        self.push_block(BlockKind::Plain);
        self.define_variable(error);
        self.compile_block(handler, BlockKind::Plain)?;
        self.compile_leave_nip();
        self.pop_block();
        let target = self.address();
        self.patch(finish, target);
        self.push_local();
        Ok(())
    }

    fn compile_defer(&self, expr: &ExprRef) -> Result<()>
    {
        // Register a handler that re-runs the deferred expression and
        // rethrows; the same code is copied so normal exits can replay
        // it without routing control through the throw path.
        let catch = self.address();
        self.emit_arg(Opcode::Catch, UNPATCHED);
        let skip = self.address();
        self.emit_arg(Opcode::Jump, UNPATCHED);
        let handler = self.address();
        self.patch(catch, handler);
        // On the exceptional path the raised value sits below the
        // deferred code.
        self.push_local();
        let bottom = self.locals();
        let start = self.address();
        self.compile_block(std::slice::from_ref(expr), BlockKind::Defer)?;
        self.emit(Opcode::Pop);
        self.pop_local();
        let code = self.with_func(|func| func.proto.code[start ..].to_vec());
        self.emit(Opcode::Throw);
        self.pop_local();
        let target = self.address();
        self.patch(skip, target);
        self.with_block(|block| {
            block.deferrals.push(Deferral{bottom, address: start, code});
        });
        self.compile_nil();
        Ok(())
    }

    /* ------------------------------ Invocations ------------------------------ */

    fn compile_call(&self, func: &ExprRef, args: &[ExprRef]) -> Result<()>
    {
        self.compile_expr(func)?;
        for arg in args {
            self.compile_expr(arg)?;
        }
        self.compile_int(args.len() as i64)?;
        self.emit(Opcode::Call);
        for _ in 0 .. args.len() + 1 {
            self.pop_local();
        }
        Ok(())
    }

    fn compile_send(&self, obj: &ExprRef, msg: &str) -> Result<()>
    {
        self.compile_expr(obj)?;
        self.compile_string(msg)?;
        self.emit(Opcode::Send);
        self.pop_local();
        Ok(())
    }

    fn compile_binary(&self, op: &str, lhs: &ExprRef, rhs: &ExprRef) -> Result<()>
    {
        // `x op y` is `x.op(y)`: a send followed by a call.
        let send = Rc::new(Expr::Send{obj: lhs.clone(), msg: op.to_owned()});
        self.compile_call(&send, std::slice::from_ref(rhs))
    }

    fn compile_get_index(&self, obj: &ExprRef, keys: &[ExprRef]) -> Result<()>
    {
        let send = Rc::new(Expr::Send{obj: obj.clone(), msg: "[]".to_owned()});
        self.compile_call(&send, keys)
    }

    fn compile_set_index(&self, obj: &ExprRef, keys: &[ExprRef], value: &ExprRef) -> Result<()>
    {
        let send = Rc::new(Expr::Send{obj: obj.clone(), msg: "[]=".to_owned()});
        let mut args = keys.to_vec();
        args.push(value.clone());
        self.compile_call(&send, &args)
    }

    /* ------------------------------- Properties ------------------------------ */

    fn compile_get_prop(&self, obj: &ExprRef, name: &str) -> Result<()>
    {
        self.compile_expr(obj)?;
        self.compile_string(name)?;
        self.emit(Opcode::GetProp);
        self.pop_local();
        Ok(())
    }

    fn compile_set_prop(&self, obj: &ExprRef, name: &str, value: &ExprRef) -> Result<()>
    {
        self.compile_expr(obj)?;
        self.compile_string(name)?;
        self.compile_expr(value)?;
        self.emit(Opcode::SetProp);
        self.pop_local();
        self.pop_local();
        self.pop_local();
        // The opcode consumes all three operands; the expression's
        // value is nil.
        self.compile_nil();
        Ok(())
    }

    /* ----------------------------- Short circuits ---------------------------- */

    fn compile_short_circuit(&self, lhs: &ExprRef, rhs: &ExprRef, skip: Opcode) -> Result<()>
    {
        // The right side gets its own block so a `let` in it is not
        // conditionally defined in the enclosing scope.
        self.compile_expr(lhs)?;
        self.emit(Opcode::Dup);
        self.push_local();
        let jump = self.address();
        self.emit_arg(skip, UNPATCHED);
        self.pop_local();
        self.emit(Opcode::Pop);
        self.pop_local();
        self.compile_block(std::slice::from_ref(rhs), BlockKind::Plain)?;
        let target = self.address();
        self.patch(jump, target);
        Ok(())
    }

    /* ------------------------------- Functions ------------------------------- */

    fn compile_lambda(&self, args: &[String], body: &[ExprRef]) -> Result<()>
    {
        // Load the closure in the enclosing function. Capture
        // instructions accumulate after the ResetUp while the inner
        // function resolves names.
        let index = self.with_func(|func| func.proto.constants.len());
        if index > Instruction::MAX_ARG as usize {
            return Err(Error::TooManyConstants);
        }
        self.emit_arg(Opcode::GetConst, index as u32);
        self.emit(Opcode::ResetUp);
        self.push_local();
        // Compile the inner function: arguments are its bottommost
        // locals, the body is an ordinary block.
        self.push_func();
        self.with_func(|func| func.proto.nargs = args.len() as u64);
        self.push_block(BlockKind::Plain);
        for arg in args {
            self.define_variable(arg);
        }
        self.push_block(BlockKind::Plain);
        for expr in body {
            self.declare_expr(expr);
        }
        self.compile_expr_chain(body)?;
        let height = self.locals();
        for block in (0 .. self.block_count()).rev() {
            self.leave_block(block, height);
        }
        self.emit(Opcode::Return);
        // Move the finished function into the reserved constant.
        let env = self.functions.borrow_mut().pop().expect("No function is being compiled");
        let proto = self.ctx.alloc(env.proto);
        let func = self.ctx.alloc(Function::new(proto.get()));
        self.with_func(|outer| outer.proto.constants.push(Value::Function(func.get())));
        Ok(())
    }

    fn compile_method(&self, args: Option<&[String]>, body: &[ExprRef]) -> Result<()>
    {
        // `method(args) body` is `fn(self) { fn(args) body }`; invoking
        // the method under a send yields a callable bound to `self`.
        match args {
            Some(args) => {
                let inner = Rc::new(Expr::Lambda{args: args.to_vec(), body: body.to_vec()});
                self.compile_lambda(&["self".to_owned()], std::slice::from_ref(&inner))
            }
            None => self.compile_lambda(&["self".to_owned()], body),
        }
    }

    /* ------------------------------ Control flow ----------------------------- */

    fn compile_loop_control(&self, is_break: bool) -> Result<()>
    {
        // Find the innermost enclosing loop; a defer block on the way
        // makes the jump illegal.
        let (loop_index, crosses_defer) = self.with_func(|func| {
            let mut crosses = false;
            for (index, block) in func.blocks.iter().enumerate().rev() {
                match block.kind {
                    BlockKind::Loop(..) => return (Some(index), crosses),
                    BlockKind::Defer => crosses = true,
                    _ => {}
                }
            }
            (None, crosses)
        });
        let Some(loop_index) = loop_index else {
            return Err(match is_break {
                true => Error::BreakOutsideLoop,
                false => Error::ContinueOutsideLoop,
            });
        };
        if crosses_defer {
            return Err(match is_break {
                true => Error::BreakAcrossDefer,
                false => Error::ContinueAcrossDefer,
            });
        }
        // Leave every block down to and including the loop's interior,
        // then jump; the target is patched when the loop finishes.
        let last = self.block_count() - 1;
        let mut height = self.locals();
        for index in (loop_index + 1 ..= last).rev() {
            self.leave_block(index, height);
            let bottom = self.with_func(|func| func.blocks[index].bottom);
            for _ in 0 .. height - bottom {
                self.emit(Opcode::Pop);
            }
            height = bottom;
        }
        let jump = self.address();
        self.emit_arg(Opcode::Jump, UNPATCHED);
        self.with_func(|func| match &mut func.blocks[loop_index].kind {
            BlockKind::Loop(jumps) => match is_break {
                true => jumps.break_jumps.push(jump),
                false => jumps.continue_jumps.push(jump),
            },
            _ => unreachable!("Loop block changed kind"),
        });
        // Control never falls through, but the simulation still nets
        // one value for the expression.
        self.push_local();
        Ok(())
    }

    fn compile_return(&self, value: Option<&ExprRef>) -> Result<()>
    {
        let inside_defer = self.with_func(|func| {
            func.blocks.iter().any(|block| matches!(block.kind, BlockKind::Defer))
        });
        if inside_defer {
            return Err(Error::ReturnInsideDefer);
        }
        match value {
            Some(value) => self.compile_expr(value)?,
            None => self.compile_nil(),
        }
        // Run the deferrals of every enclosing block; the Return does
        // the actual unwinding.
        let height = self.locals();
        for index in (0 .. self.block_count()).rev() {
            self.leave_block(index, height);
        }
        self.emit(Opcode::Return);
        Ok(())
    }

    fn compile_throw(&self, value: &ExprRef) -> Result<()>
    {
        self.compile_expr(value)?;
        self.emit(Opcode::Throw);
        Ok(())
    }

    /* ------------------------------- Dispatch -------------------------------- */

    fn compile_expr(&self, expr: &Expr) -> Result<()>
    {
        match expr {
            Expr::String(value) => self.compile_string(value),
            Expr::Int(value) => self.compile_int(*value),
            Expr::Empty => {
                self.compile_nil();
                Ok(())
            }
            Expr::Variable(name) => self.compile_variable(name),
            Expr::Let{name, value} => self.compile_let(name, value),
            Expr::Assign{name, value} => self.compile_assign(name, value),
            Expr::GetProp{obj, name} => self.compile_get_prop(obj, name),
            Expr::SetProp{obj, name, value} => self.compile_set_prop(obj, name, value),
            Expr::GetIndex{obj, keys} => self.compile_get_index(obj, keys),
            Expr::SetIndex{obj, keys, value} => self.compile_set_index(obj, keys, value),
            Expr::Call{func, args} => self.compile_call(func, args),
            Expr::Send{obj, msg} => self.compile_send(obj, msg),
            Expr::Unary{op, value} => self.compile_send(value, op),
            Expr::Binary{op, lhs, rhs} => self.compile_binary(op, lhs, rhs),
            Expr::And{lhs, rhs} => self.compile_short_circuit(lhs, rhs, Opcode::JumpUnless),
            Expr::Or{lhs, rhs} => self.compile_short_circuit(lhs, rhs, Opcode::JumpIf),
            Expr::Block(exprs) => self.compile_block(exprs, BlockKind::Plain),
            Expr::If{branches, otherwise} => self.compile_if(branches, otherwise.as_deref()),
            Expr::While{cond, body} => self.compile_while(cond, body),
            Expr::Try{body, error, handler} => self.compile_try(body, error, handler),
            Expr::Defer(expr) => self.compile_defer(expr),
            Expr::Lambda{args, body} => self.compile_lambda(args, body),
            Expr::Method{args, body} => self.compile_method(args.as_deref(), body),
            Expr::Break => self.compile_loop_control(true),
            Expr::Continue => self.compile_loop_control(false),
            Expr::Return(value) => self.compile_return(value.as_ref()),
            Expr::Throw(value) => self.compile_throw(value),
        }
    }
}

/// Resolve `name` as an upvalue of the function at `level`, creating
/// the capture chain through the enclosing functions as needed.
///
/// A name that is a local (or a pre-declared forward reference) of the
/// enclosing function is captured with a `MakeUp` emitted into that
/// function's code; otherwise the name is resolved recursively one
/// level up and propagated with `CopyUp`. The capture instructions land
/// right after the `ResetUp` of the closure being compiled, which is
/// where the enclosing function's emission is paused.
fn lookup_upvalue_rec(
    functions: &mut [FunctionEnv],
    level: usize,
    name: &str,
) -> Option<usize>
{
    if !functions[level].upvalues.contains_key(name) && level > 0 {
        if let Some(index) = lookup_upvalue_origin(&functions[level - 1], name) {
            let instr = Instruction::with_arg(Opcode::MakeUp, index as u32);
            functions[level - 1].proto.code.push(instr);
            let next = functions[level].upvalues.len();
            functions[level].upvalues.insert(name.to_owned(), next);
        }
        else if let Some(index) = lookup_upvalue_rec(functions, level - 1, name) {
            let instr = Instruction::with_arg(Opcode::CopyUp, index as u32);
            functions[level - 1].proto.code.push(instr);
            let next = functions[level].upvalues.len();
            functions[level].upvalues.insert(name.to_owned(), next);
        }
    }
    functions[level].upvalues.get(name).copied()
}

/// Find the stack slot `name` would occupy in the given function,
/// counting both defined variables and pre-declared ones.
fn lookup_upvalue_origin(func: &FunctionEnv, name: &str) -> Option<usize>
{
    for block in func.blocks.iter().rev() {
        if let Some(index) = block.definitions.get(name) {
            return Some(*index);
        }
        if let Some(indices) = block.declarations.get(name) {
            if let Some(index) = indices.front() {
                return Some(*index);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::{
            value::{ForeignFunction, Klass, Object},
            vm::{Vm, VmResult},
        },
    };

    /* ------------------------------ AST helpers ------------------------------ */

    fn e(expr: Expr) -> ExprRef
    {
        Rc::new(expr)
    }

    fn int(value: i64) -> ExprRef
    {
        e(Expr::Int(value))
    }

    fn var(name: &str) -> ExprRef
    {
        e(Expr::Variable(name.to_owned()))
    }

    fn let_(name: &str, value: ExprRef) -> ExprRef
    {
        e(Expr::Let{name: name.to_owned(), value})
    }

    fn assign(name: &str, value: ExprRef) -> ExprRef
    {
        e(Expr::Assign{name: name.to_owned(), value})
    }

    fn call(func: ExprRef, args: Vec<ExprRef>) -> ExprRef
    {
        e(Expr::Call{func, args})
    }

    fn bin(op: &str, lhs: ExprRef, rhs: ExprRef) -> ExprRef
    {
        call(var(op), vec![lhs, rhs])
    }

    fn lambda(args: &[&str], body: Vec<ExprRef>) -> ExprRef
    {
        let args = args.iter().map(|&arg| arg.to_owned()).collect();
        e(Expr::Lambda{args, body})
    }

    fn block(exprs: Vec<ExprRef>) -> ExprRef
    {
        e(Expr::Block(exprs))
    }

    fn if_(branches: Vec<(ExprRef, Vec<ExprRef>)>, otherwise: Option<Vec<ExprRef>>) -> ExprRef
    {
        e(Expr::If{branches, otherwise})
    }

    fn while_(cond: ExprRef, body: Vec<ExprRef>) -> ExprRef
    {
        e(Expr::While{cond, body})
    }

    fn try_(body: Vec<ExprRef>, error: &str, handler: Vec<ExprRef>) -> ExprRef
    {
        e(Expr::Try{body, error: error.to_owned(), handler})
    }

    fn defer(expr: ExprRef) -> ExprRef
    {
        e(Expr::Defer(expr))
    }

    fn ret(value: ExprRef) -> ExprRef
    {
        e(Expr::Return(Some(value)))
    }

    fn throw(value: ExprRef) -> ExprRef
    {
        e(Expr::Throw(value))
    }

    fn and(lhs: ExprRef, rhs: ExprRef) -> ExprRef
    {
        e(Expr::And{lhs, rhs})
    }

    fn or(lhs: ExprRef, rhs: ExprRef) -> ExprRef
    {
        e(Expr::Or{lhs, rhs})
    }

    fn get_prop(obj: ExprRef, name: &str) -> ExprRef
    {
        e(Expr::GetProp{obj, name: name.to_owned()})
    }

    fn set_prop(obj: ExprRef, name: &str, value: ExprRef) -> ExprRef
    {
        e(Expr::SetProp{obj, name: name.to_owned(), value})
    }

    /* ------------------------------- Harness -------------------------------- */

    fn binary_builtin(ctx: &Context, name: &str, f: impl Fn(i64, i64) -> Value + 'static)
    {
        let func = ctx.alloc(ForeignFunction::lambda(2, move |ctx, args| {
            let x = args[0].as_int().expect("expected an integer");
            let y = args[1].as_int().expect("expected an integer");
            Ok(ctx.root(f(x, y)))
        }));
        ctx.define_builtin(name, Value::Foreign(func.get()));
    }

    fn install_builtins(ctx: &Context)
    {
        ctx.define_builtin("true", Value::Bool(true));
        ctx.define_builtin("false", Value::Bool(false));
        binary_builtin(ctx, "==", |x, y| Value::Bool(x == y));
        binary_builtin(ctx, "!=", |x, y| Value::Bool(x != y));
        binary_builtin(ctx, "+", |x, y| Value::Int(x + y));
        binary_builtin(ctx, "-", |x, y| Value::Int(x - y));
    }

    fn run_program(ctx: &Context, body: &[ExprRef]) -> VmResult
    {
        let compiler = Compiler::new(ctx);
        let main = compiler.compile(body).expect("compilation failed");
        let vm = Vm::new(ctx);
        vm.call(&Value::Function(main.get()), &[])
    }

    fn eval_int(body: &[ExprRef]) -> i64
    {
        let ctx = Context::new();
        install_builtins(&ctx);
        run_program(&ctx, body).unwrap()
            .get().as_int().expect("program did not yield an integer")
    }

    /* ------------------------------- Programs -------------------------------- */

    #[test]
    fn recursive_functions()
    {
        // fn main() { ping(10) }
        // fn ping(n) {
        //     if n == 0 { return 0; };
        //     let n = n - 1;
        //     let y = pong(n);
        //     return y + y;
        // }
        // fn pong(n) { if 0 == n { 1 } else { ping(n - 1) + 1 } }
        // main()
        let body = vec![
            let_("main", lambda(&[], vec![
                call(var("ping"), vec![int(10)]),
            ])),
            let_("ping", lambda(&["n"], vec![
                if_(
                    vec![(bin("==", var("n"), int(0)), vec![ret(int(0))])],
                    None,
                ),
                let_("n", bin("-", var("n"), int(1))),
                let_("y", call(var("pong"), vec![var("n")])),
                ret(bin("+", var("y"), var("y"))),
            ])),
            let_("pong", lambda(&["n"], vec![
                if_(
                    vec![(bin("==", int(0), var("n")), vec![int(1)])],
                    Some(vec![
                        bin("+", call(var("ping"), vec![bin("-", var("n"), int(1))]), int(1)),
                    ]),
                ),
            ])),
            call(var("main"), vec![]),
        ];
        assert_eq!(eval_int(&body), 62);
    }

    #[test]
    fn try_catch()
    {
        // try {
        //     try { let x = 2; throw x; x = 0; return x; }
        //     catch x { let y = x + 1; y }
        // }
        // catch _ { 0 }
        let body = vec![
            try_(
                vec![
                    try_(
                        vec![
                            let_("x", int(2)),
                            throw(var("x")),
                            assign("x", int(0)),
                            ret(var("x")),
                        ],
                        "x",
                        vec![
                            let_("y", bin("+", var("x"), int(1))),
                            var("y"),
                        ],
                    ),
                ],
                "_",
                vec![int(0)],
            ),
        ];
        assert_eq!(eval_int(&body), 3);
    }

    #[test]
    fn nested_blocks()
    {
        // {
        //     let x = 2;
        //     let y = 10;
        //     let z = {
        //         let x = 5;
        //         { x = { y = y + 10; y }; }
        //         x
        //     };
        //     x = x + (y + z);
        //     x
        // }
        let body = vec![
            block(vec![
                let_("x", int(2)),
                let_("y", int(10)),
                let_("z", block(vec![
                    let_("x", int(5)),
                    block(vec![
                        assign("x", block(vec![
                            assign("y", bin("+", var("y"), int(10))),
                            var("y"),
                        ])),
                    ]),
                    var("x"),
                ])),
                assign("x", bin("+", var("x"), bin("+", var("y"), var("z")))),
                var("x"),
            ]),
        ];
        assert_eq!(eval_int(&body), 42);
    }

    #[test]
    fn fib_iter()
    {
        // fn fib(n) {
        //     let x = 0;
        //     let y = 1;
        //     while n != 0 { let z = x + y; x = y; y = z; n = n - 1; }
        //     x
        // }
        // fib(input)
        let program = |input: i64| vec![
            let_("fib", lambda(&["n"], vec![
                let_("x", int(0)),
                let_("y", int(1)),
                while_(bin("!=", var("n"), int(0)), vec![
                    let_("z", bin("+", var("x"), var("y"))),
                    assign("x", var("y")),
                    assign("y", var("z")),
                    assign("n", bin("-", var("n"), int(1))),
                ]),
                var("x"),
            ])),
            call(var("fib"), vec![int(input)]),
        ];
        for (input, expected) in [(0, 0), (1, 1), (4, 3), (7, 13), (10, 55), (15, 610)] {
            assert_eq!(eval_int(&program(input)), expected, "fib({input}) is wrong");
        }
    }

    #[test]
    fn break_continue()
    {
        let body = vec![
            let_("x", int(0)),
            let_("i", int(0)),
            while_(var("true"), vec![
                let_("j", int(0)),
                while_(var("true"), vec![
                    if_(
                        vec![(bin("==", var("j"), int(3)), vec![e(Expr::Break)])],
                        None,
                    ),
                    assign("j", bin("+", var("j"), int(1))),
                    assign("x", bin("+", var("x"), int(1))),
                ]),
                if_(
                    vec![(bin("==", var("i"), int(10)), vec![e(Expr::Break)])],
                    Some(vec![
                        assign("i", bin("+", var("i"), int(1))),
                        e(Expr::Continue),
                    ]),
                ),
                ret(int(0)),
            ]),
            ret(var("x")),
        ];
        assert_eq!(eval_int(&body), 33);
    }

    #[test]
    fn closure_counter()
    {
        let body = vec![
            let_("init", int(0)),
            let_("inc", int(1)),
            let_("main", lambda(&[], vec![
                let_("make", lambda(&[], vec![
                    let_("x", var("init")),
                    lambda(&[], vec![
                        assign("x", bin("+", var("x"), var("inc"))),
                        ret(var("x")),
                    ]),
                ])),
                let_("counter", call(var("make"), vec![])),
                call(var("counter"), vec![]),
                call(var("counter"), vec![]),
                call(var("counter"), vec![]),
            ])),
            call(var("main"), vec![]),
        ];
        assert_eq!(eval_int(&body), 3);
    }

    #[test]
    fn defer_runs_on_normal_exit()
    {
        // let n = 1;
        // { defer n = n + 100; n = n + 10; };
        // n
        let body = vec![
            let_("n", int(1)),
            block(vec![
                defer(assign("n", bin("+", var("n"), int(100)))),
                assign("n", bin("+", var("n"), int(10))),
            ]),
            var("n"),
        ];
        assert_eq!(eval_int(&body), 111);
    }

    #[test]
    fn defer_runs_on_throw()
    {
        // let n = 1;
        // try { defer n = n + 100; n = n + 10; throw 0; n = n + 1000; }
        // catch e {};
        // n
        let body = vec![
            let_("n", int(1)),
            try_(
                vec![
                    defer(assign("n", bin("+", var("n"), int(100)))),
                    assign("n", bin("+", var("n"), int(10))),
                    throw(int(0)),
                    assign("n", bin("+", var("n"), int(1000))),
                ],
                "e",
                vec![],
            ),
            var("n"),
        ];
        assert_eq!(eval_int(&body), 111);
    }

    #[test]
    fn defers_run_in_reverse_order()
    {
        // let n = 1;
        // { defer n = n + 1; defer n = n + n; n = 10; };
        // n
        let body = vec![
            let_("n", int(1)),
            block(vec![
                defer(assign("n", bin("+", var("n"), int(1)))),
                defer(assign("n", bin("+", var("n"), var("n")))),
                assign("n", int(10)),
            ]),
            var("n"),
        ];
        // n = 10, then n = n + n = 20, then n = n + 1 = 21.
        assert_eq!(eval_int(&body), 21);
    }

    #[test]
    fn defer_in_a_loop_runs_each_iteration()
    {
        let body = vec![
            let_("n", int(0)),
            let_("i", int(0)),
            while_(bin("!=", var("i"), int(3)), vec![
                defer(assign("n", bin("+", var("n"), int(1)))),
                assign("i", bin("+", var("i"), int(1))),
            ]),
            var("n"),
        ];
        assert_eq!(eval_int(&body), 3);
    }

    #[test]
    fn defer_runs_before_an_explicit_return()
    {
        // fn f() { defer n = n + 100; n = n + 10; return 0; }
        let body = vec![
            let_("n", int(1)),
            let_("f", lambda(&[], vec![
                defer(assign("n", bin("+", var("n"), int(100)))),
                assign("n", bin("+", var("n"), int(10))),
                ret(int(0)),
            ])),
            call(var("f"), vec![]),
            var("n"),
        ];
        assert_eq!(eval_int(&body), 111);
    }

    #[test]
    fn short_circuit()
    {
        // true || throw 1; false && throw 2; false || (true && true)
        let body = vec![
            or(var("true"), throw(int(1))),
            and(var("false"), throw(int(2))),
            or(var("false"), and(var("true"), var("true"))),
        ];
        let ctx = Context::new();
        install_builtins(&ctx);
        let result = run_program(&ctx, &body).unwrap();
        assert_eq!(result.get().as_bool(), Some(true));
    }

    #[test]
    fn properties_through_bytecode()
    {
        let ctx = Context::new();
        install_builtins(&ctx);
        let new_object = ctx.alloc(ForeignFunction::lambda(0, |ctx, _| {
            let object = ctx.alloc(Object::new(ctx.object_cls.get()));
            Ok(ctx.root(Value::Object(object.get())))
        }));
        ctx.define_builtin("new_object", Value::Foreign(new_object.get()));

        let body = vec![
            let_("o", call(var("new_object"), vec![])),
            set_prop(var("o"), "x", int(5)),
            bin("+", get_prop(var("o"), "x"), int(37)),
        ];
        let result = run_program(&ctx, &body).unwrap();
        assert_eq!(result.get().as_int(), Some(42));
    }

    #[test]
    fn missing_property_throws()
    {
        let ctx = Context::new();
        let new_object = ctx.alloc(ForeignFunction::lambda(0, |ctx, _| {
            let object = ctx.alloc(Object::new(ctx.object_cls.get()));
            Ok(ctx.root(Value::Object(object.get())))
        }));
        ctx.define_builtin("new_object", Value::Foreign(new_object.get()));

        let body = vec![
            get_prop(call(var("new_object"), vec![]), "missing"),
        ];
        let error = run_program(&ctx, &body).unwrap_err();
        match error.0.get() {
            Value::String(ptr) => assert!(ptr.borrow().contains("no property `missing`")),
            _ => panic!("expected a string exception"),
        }
    }

    #[test]
    fn methods_bind_self_through_send()
    {
        let ctx = Context::new();
        install_builtins(&ctx);
        let program = vec![
            e(Expr::Method{
                args: Some(vec!["a".to_owned()]),
                body: vec![
                    bin("+", get_prop(var("self"), "x"), var("a")),
                ],
            }),
        ];
        let compiler = Compiler::new(&ctx);
        let main = compiler.compile(&program).unwrap();
        let vm = Vm::new(&ctx);
        let method = vm.call(&Value::Function(main.get()), &[]).unwrap();

        let class = ctx.alloc(Klass::inheriting(&ctx, &ctx.object_cls.get()));
        class.get().define(&ctx, "add", method.get());
        let object = ctx.alloc(Object::new(class.get()));
        object.get().borrow_mut().set_prop("x", Value::Int(5));

        let result = vm.send_call(&Value::Object(object.get()), "add", &[Value::Int(37)]).unwrap();
        assert_eq!(result.get().as_int(), Some(42));
    }

    #[test]
    fn binary_sugar_sends_to_the_receiver()
    {
        let ctx = Context::new();
        let body = vec![
            e(Expr::Binary{op: "+".to_owned(), lhs: int(1), rhs: int(2)}),
        ];
        let error = run_program(&ctx, &body).unwrap_err();
        match error.0.get() {
            Value::String(ptr) => {
                assert!(ptr.borrow().contains("doesn't understand message `+`"));
            }
            _ => panic!("expected a string exception"),
        }
    }

    #[test]
    fn empty_program_yields_nil()
    {
        let ctx = Context::new();
        let result = run_program(&ctx, &[]).unwrap();
        assert!(result.get().is_nil());
    }

    #[test]
    fn while_yields_nil()
    {
        let ctx = Context::new();
        install_builtins(&ctx);
        let body = vec![while_(var("false"), vec![])];
        let result = run_program(&ctx, &body).unwrap();
        assert!(result.get().is_nil());
    }

    #[test]
    fn dump_lists_nested_functions()
    {
        let ctx = Context::new();
        let body = vec![lambda(&["n"], vec![var("n")])];
        let compiler = Compiler::new(&ctx);
        let main = compiler.compile(&body).unwrap();
        let listing = main.get().dump();
        assert!(listing.contains("Function#0"));
        assert!(listing.contains("Function#1"));
        assert!(listing.contains("nargs: 1"));
        assert!(listing.contains("Return"));
    }

    /* ----------------------------- Compile errors ---------------------------- */

    fn compile_error(ctx: &Context, body: &[ExprRef]) -> Error
    {
        Compiler::new(ctx).compile(body).unwrap_err()
    }

    #[test]
    fn unknown_variable_is_a_compile_error()
    {
        let ctx = Context::new();
        let error = compile_error(&ctx, &[var("nope")]);
        assert!(matches!(error, Error::VariableNotFound(name) if name == "nope"));
    }

    #[test]
    fn break_outside_a_loop_is_a_compile_error()
    {
        let ctx = Context::new();
        let error = compile_error(&ctx, &[e(Expr::Break)]);
        assert!(matches!(error, Error::BreakOutsideLoop));
    }

    #[test]
    fn continue_outside_a_loop_is_a_compile_error()
    {
        let ctx = Context::new();
        let error = compile_error(&ctx, &[e(Expr::Continue)]);
        assert!(matches!(error, Error::ContinueOutsideLoop));
    }

    #[test]
    fn return_inside_a_defer_is_a_compile_error()
    {
        let ctx = Context::new();
        let error = compile_error(&ctx, &[defer(ret(int(1)))]);
        assert!(matches!(error, Error::ReturnInsideDefer));
    }

    #[test]
    fn break_across_a_defer_is_a_compile_error()
    {
        let ctx = Context::new();
        install_builtins(&ctx);
        let body = vec![
            while_(var("true"), vec![
                defer(e(Expr::Break)),
            ]),
        ];
        let error = compile_error(&ctx, &body);
        assert!(matches!(error, Error::BreakAcrossDefer));
    }

    #[test]
    fn and_scopes_its_right_hand_side()
    {
        let ctx = Context::new();
        install_builtins(&ctx);
        let body = vec![
            and(var("true"), let_("q", int(1))),
            var("q"),
        ];
        let error = compile_error(&ctx, &body);
        assert!(matches!(error, Error::VariableNotFound(name) if name == "q"));
    }

    #[test]
    fn compiler_is_reusable_after_an_error()
    {
        let ctx = Context::new();
        let compiler = Compiler::new(&ctx);
        assert!(compiler.compile(&[var("nope")]).is_err());
        let main = compiler.compile(&[int(7)]).unwrap();
        let vm = Vm::new(&ctx);
        let result = vm.call(&Value::Function(main.get()), &[]).unwrap();
        assert_eq!(result.get().as_int(), Some(7));
    }
}
