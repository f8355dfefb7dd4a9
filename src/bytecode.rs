//! Bytecode instructions.
//!
//! Each opcode is documented with its argument (if any) and a stack
//! signature. For instance `GetVar(index), ( -- x )` names an
//! instruction argument `index` and describes an instruction that takes
//! no stack operands and leaves one result `x`.

use std::fmt;

/// Basic instruction executed by the VM.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Opcode
{
    /// `Nop(), ( -- )` — does nothing.
    Nop,
    /// `Pop(), ( x -- )` — removes the topmost value.
    Pop,
    /// `Nip(), ( x y -- y )` — removes the second topmost value.
    Nip,
    /// `Dup(), ( x -- x x )` — duplicates the topmost value.
    Dup,
    /// `Nil(), ( -- nil )` — pushes nil.
    Nil,

    /// `GetVar(index), ( -- x )` — pushes the local variable at `index`.
    ///
    /// Local variables live on the data stack; indices are relative to
    /// the bottommost slot of the currently executing function.
    GetVar,
    /// `SetVar(index), ( x -- )` — pops into the local at `index`.
    SetVar,

    /// `GetConst(index), ( -- x )` — pushes a value from the function's
    /// constant pool.
    GetConst,

    /// `GetUp(index), ( -- x )` — pushes the current closure's upvalue.
    ///
    /// Upvalues are references to an outer function's stack variables
    /// that stay usable after that function returns; they are how
    /// closures capture their environment.
    GetUp,
    /// `SetUp(index), ( x -- )` — pops into the closure's upvalue.
    SetUp,
    /// `ResetUp(), ( f -- f' )` — clones the function with an empty
    /// upvalue array.
    ResetUp,
    /// `MakeUp(index), ( f -- f )` — appends an upvalue bound to the
    /// local variable at `index` to the function on top of the stack.
    MakeUp,
    /// `CopyUp(index), ( f -- f )` — appends the current closure's
    /// upvalue at `index` to the function on top of the stack.
    CopyUp,

    /// `GetProp(), ( obj name -- v )` — reads a property.
    ///
    /// Throws when the property is missing or the receiver is a
    /// primitive.
    GetProp,
    /// `SetProp(), ( obj name v -- )` — writes a property.
    ///
    /// Throws when the receiver is a primitive.
    SetProp,

    /// `Call(), ( f x1 ... xn n -- y )` — calls a function.
    ///
    /// The arguments become the callee's bottommost locals, `x1` at
    /// index 0. The function and arguments are replaced by the result.
    Call,
    /// `Send(), ( obj name -- r )` — message dispatch.
    ///
    /// Looks `name` up in `obj`'s class and calls the found method with
    /// `obj` as its sole argument. When the method is missing but the
    /// class chain understands `not_understood`, the result of
    /// `not_understood(obj)(name)` is produced instead; otherwise an
    /// exception describing the missing message is thrown.
    Send,

    /// `Return(), ( x -- )` — exits the current function with `x`.
    Return,
    /// `Jump(addr), ( -- )` — unconditional jump.
    Jump,
    /// `JumpIf(addr), ( b -- )` — pops; jumps if true.
    JumpIf,
    /// `JumpUnless(addr), ( b -- )` — pops; jumps if false.
    JumpUnless,

    /// `Throw(), ( ex -- )` — raises the topmost value as an exception.
    ///
    /// The VM pops the topmost exception handler and resumes there. If
    /// the exception stack is empty, the VM itself returns the raised
    /// value as an error.
    Throw,
    /// `Catch(addr), ( -- )` — pushes an exception handler resuming at
    /// `addr` with the exception value on top of the stack.
    Catch,
    /// `Uncatch(), ( -- )` — pops the topmost exception handler.
    Uncatch,
}

impl Opcode
{
    /// Whether instructions with this opcode carry an argument.
    pub fn has_arg(self) -> bool
    {
        matches!(
            self,
            Self::GetVar | Self::SetVar | Self::GetConst
            | Self::GetUp | Self::SetUp | Self::MakeUp | Self::CopyUp
            | Self::Jump | Self::JumpIf | Self::JumpUnless | Self::Catch
        )
    }
}

impl fmt::Display for Opcode
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        fmt::Debug::fmt(self, f)
    }
}

/// VM instruction along with its argument.
#[derive(Clone, Copy)]
pub struct Instruction
{
    /// The operation to perform.
    pub op: Opcode,
    arg: u32,
}

impl Instruction
{
    /// Largest representable instruction argument.
    ///
    /// Arguments are stored in 27 bits; the constructors enforce the
    /// limit so the width stays an implementation detail.
    pub const MAX_ARG: u32 = (1 << 27) - 1;

    /// Create an instruction with argument zero.
    pub fn new(op: Opcode) -> Self
    {
        Self{op, arg: 0}
    }

    /// Create an instruction with the given argument.
    ///
    /// # Panics
    ///
    /// Panics if the argument exceeds [`MAX_ARG`][`Self::MAX_ARG`].
    pub fn with_arg(op: Opcode, arg: u32) -> Self
    {
        assert!(arg <= Self::MAX_ARG, "Instruction argument out of range");
        Self{op, arg}
    }

    /// The instruction's argument.
    pub fn arg(self) -> u32
    {
        self.arg
    }

    /// Replace the instruction's argument; used for patching jumps.
    ///
    /// # Panics
    ///
    /// Panics if the argument exceeds [`MAX_ARG`][`Self::MAX_ARG`].
    pub fn set_arg(&mut self, arg: u32)
    {
        assert!(arg <= Self::MAX_ARG, "Instruction argument out of range");
        self.arg = arg;
    }
}

impl fmt::Display for Instruction
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "{}", self.op)?;
        if self.op.has_arg() {
            write!(f, " {}", self.arg)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Instruction
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests
{
    use {super::*, proptest::{prop_oneof, proptest, strategy::{Just, Strategy}}, std::mem::size_of};

    #[test]
    fn instruction_size()
    {
        assert!(
            size_of::<Instruction>() <= 8,
            "Try not to make instructions too big ({} B)",
            size_of::<Instruction>(),
        );
    }

    #[test]
    fn display()
    {
        assert_eq!(Instruction::new(Opcode::Pop).to_string(), "Pop");
        assert_eq!(Instruction::new(Opcode::Call).to_string(), "Call");
        assert_eq!(Instruction::with_arg(Opcode::GetVar, 3).to_string(), "GetVar 3");
        assert_eq!(Instruction::with_arg(Opcode::Jump, 17).to_string(), "Jump 17");
    }

    fn opcodes() -> impl Strategy<Value = Opcode>
    {
        prop_oneof![
            Just(Opcode::GetVar),
            Just(Opcode::SetVar),
            Just(Opcode::GetConst),
            Just(Opcode::Jump),
            Just(Opcode::Catch),
        ]
    }

    proptest!
    {
        #[test]
        fn arg_round_trips(op in opcodes(), arg in 0 ..= Instruction::MAX_ARG)
        {
            let instruction = Instruction::with_arg(op, arg);
            assert_eq!(instruction.arg(), arg);
            assert_eq!(instruction.to_string(), format!("{op} {arg}"));
        }
    }
}
