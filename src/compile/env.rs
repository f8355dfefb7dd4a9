//! Compilation environments.

use {
    crate::{
        bytecode::Instruction,
        heap::{Trace, Tracer},
        value::FunctionProto,
    },
    std::collections::{HashMap, VecDeque},
};

/// A deferred expression's compiled handler, kept for re-emission on
/// the block's normal exit paths.
pub struct Deferral
{
    /// Local count assumed at the start of the copied code.
    pub bottom: usize,
    /// Address the copied code was first emitted at.
    pub address: usize,
    /// The copied handler code: the deferred expression followed by the
    /// `Pop` discarding its result.
    pub code: Vec<Instruction>,
}

/// Jump lists of a loop, patched when the loop finishes compiling.
#[derive(Default)]
pub struct LoopBlock
{
    /// Addresses of unresolved `break` jumps.
    pub break_jumps: Vec<usize>,
    /// Addresses of unresolved `continue` jumps.
    pub continue_jumps: Vec<usize>,
}

/// What kind of region a block is.
///
/// The kind drives control-flow checks (`break` must find a loop and
/// may not cross a defer) and the block's leave sequence (a try block
/// owns an exception handler that must be popped).
pub enum BlockKind
{
    /// An ordinary block.
    Plain,
    /// The block around a loop's condition; carries the loop's
    /// unresolved control-flow jumps.
    Loop(LoopBlock),
    /// The block a deferred expression is compiled in.
    Defer,
    /// A try body with an active exception handler.
    Try,
}

/// One lexical block of a function being compiled.
pub struct BlockEnv
{
    /// Index of the first local owned by the block.
    pub bottom: usize,
    /// Deferrals registered in the block, in registration order.
    pub deferrals: Vec<Deferral>,
    /// Currently visible variables and their stack slots.
    pub definitions: HashMap<String, usize>,
    /// Slots pre-reserved for `let`s that have not executed yet.
    ///
    /// A queue per name keeps shadowing within one block working: each
    /// `let` consumes the front entry for its name.
    pub declarations: HashMap<String, VecDeque<usize>>,
    /// The block's kind.
    pub kind: BlockKind,
}

impl BlockEnv
{
    /// Create a block starting at the given local index.
    pub fn new(bottom: usize, kind: BlockKind) -> Self
    {
        Self{
            bottom,
            deferrals: Vec::new(),
            definitions: HashMap::new(),
            declarations: HashMap::new(),
            kind,
        }
    }
}

/// A function being compiled.
#[derive(Default)]
pub struct FunctionEnv
{
    /// The proto under construction.
    pub proto: FunctionProto,
    /// Simulated number of values on the function's data stack.
    pub locals: usize,
    /// Lexical blocks, outermost first.
    pub blocks: Vec<BlockEnv>,
    /// Upvalues resolved so far, by name.
    pub upvalues: HashMap<String, usize>,
}

impl Trace for FunctionEnv
{
    fn trace(&self, tracer: &mut Tracer)
    {
        self.proto.trace(tracer);
    }
}
