//! The bytecode virtual machine.

use {
    crate::{
        bytecode::{Instruction, Opcode},
        context::Context,
        heap::{Ptr, Root, Trace, Tracer},
        value::{ForeignFunction, Function, FunctionProto, Upvalue, Value},
    },
    log::debug,
    std::fmt,
    thiserror::Error,
};

/* -------------------------------------------------------------------------- */
/*                                 Exceptions                                 */
/* -------------------------------------------------------------------------- */

/// A value raised out of the virtual machine.
///
/// Foreign functions raise script-visible errors by returning one of
/// these; the VM translates it into its `Throw` machinery at the call
/// boundary. An `Exception` escaping a VM entry point means no `Catch`
/// handled the raised value.
#[derive(Error)]
#[error("uncaught exception: {}", .0.get().inspect())]
pub struct Exception(
    /// The raised value, rooted so the host can inspect it.
    pub Root<Value>,
);

impl fmt::Debug for Exception
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "Exception({})", self.0.get().inspect())
    }
}

/// Result of a VM entry point.
pub type VmResult = Result<Root<Value>, Exception>;

/* -------------------------------------------------------------------------- */
/*                                   Frames                                   */
/* -------------------------------------------------------------------------- */

/// One slot of the data stack.
///
/// A slot carries its value and, once a closure has captured it, the
/// open upvalue aliasing it. Removing the slot closes the upvalue.
struct DataFrame
{
    value: Value,
    upvalue: Option<Ptr<Upvalue>>,
}

struct CallFrame
{
    func: Ptr<Function>,
    ip: usize,
    data_bottom: usize,
    exception_bottom: usize,
}

struct ExceptionFrame
{
    data_bottom: usize,
    call_bottom: usize,
    address: usize,
}

struct StateFrame
{
    data_bottom: usize,
    call_bottom: usize,
    exception_bottom: usize,
}

/// The traced part of a VM: its stacks and entry bookkeeping.
#[derive(Default)]
struct VmState
{
    data: Vec<DataFrame>,
    calls: Vec<CallFrame>,
    exceptions: Vec<ExceptionFrame>,
    saved: Vec<StateFrame>,
    data_bottom: usize,
    call_bottom: usize,
    exception_bottom: usize,
    thrown: bool,
}

impl Trace for VmState
{
    fn trace(&self, tracer: &mut Tracer)
    {
        for frame in &self.data {
            frame.value.trace(tracer);
            if let Some(upvalue) = &frame.upvalue {
                tracer.visit(upvalue);
            }
        }
        for frame in &self.calls {
            tracer.visit(&frame.func);
        }
    }
}

impl VmState
{
    /// Remove the value `off` slots below the top.
    ///
    /// The removed slot's upvalue, if any, is closed with its value;
    /// open upvalues of every slot that shifts down are re-pointed.
    fn remove_data(&mut self, off: usize) -> Value
    {
        assert!(self.data.len() > off, "Data stack underflow");
        let idx = self.data.len() - 1 - off;
        let frame = self.data.remove(idx);
        if let Some(upvalue) = &frame.upvalue {
            *upvalue.borrow_mut() = Upvalue::Closed(frame.value.clone());
        }
        for slot in &self.data[idx ..] {
            if let Some(upvalue) = &slot.upvalue {
                if let Upvalue::Open(index) = &mut *upvalue.borrow_mut() {
                    *index -= 1;
                }
            }
        }
        frame.value
    }

    fn pop_data(&mut self) -> Value
    {
        self.remove_data(0)
    }

    fn nip_data(&mut self)
    {
        self.remove_data(1);
    }

    fn peek_data(&self) -> &Value
    {
        &self.data.last().expect("Data stack underflow").value
    }

    fn push_data(&mut self, value: Value)
    {
        self.data.push(DataFrame{value, upvalue: None});
    }

    fn frame(&self) -> &CallFrame
    {
        self.calls.last().expect("Call stack underflow")
    }

    fn frame_mut(&mut self) -> &mut CallFrame
    {
        self.calls.last_mut().expect("Call stack underflow")
    }
}

/* -------------------------------------------------------------------------- */
/*                                     Vm                                     */
/* -------------------------------------------------------------------------- */

/// A virtual machine executing compiled functions against one context.
///
/// The VM's stacks are rooted, so collections triggered mid-execution
/// see everything the running program can still reach. Entry points
/// snapshot the stack bottoms and restore them on completion, which
/// keeps a nested entry from foreign code well-defined; multiple VMs on
/// one context are fine as long as all calls are serialized.
pub struct Vm<'a>
{
    ctx: &'a Context,
    state: Root<VmState>,
    /// Invoked when an object lacks a message but its class chain has
    /// `not_understood`. Takes `(not_understood, obj, msg)` and
    /// computes `not_understood(obj)(msg)`.
    fallback: Root<Ptr<Function>>,
}

impl<'a> Vm<'a>
{
    /// Create a VM tied to the given context.
    pub fn new(ctx: &'a Context) -> Self
    {
        let proto = FunctionProto{
            nargs: 3,
            code: vec![
                Instruction::with_arg(Opcode::GetVar, 0),
                Instruction::with_arg(Opcode::GetVar, 1),
                Instruction::with_arg(Opcode::GetConst, 0),
                Instruction::new(Opcode::Call),
                Instruction::with_arg(Opcode::GetVar, 2),
                Instruction::with_arg(Opcode::GetConst, 0),
                Instruction::new(Opcode::Call),
                Instruction::new(Opcode::Return),
            ],
            constants: vec![Value::Int(1)],
        };
        let proto = ctx.alloc(proto);
        let fallback = ctx.alloc(Function::new(proto.get()));
        Self{ctx, state: ctx.root(VmState::default()), fallback}
    }

    /// Call a function with the given arguments.
    ///
    /// Returns the function's result, or the raised value when an
    /// exception goes unhandled.
    pub fn call(&self, func: &Value, args: &[Value]) -> VmResult
    {
        debug!("call: {} with {} arguments", func.inspect(), args.len());
        self.save_state();
        {
            let mut state = self.state.borrow_mut();
            state.push_data(func.clone());
            for arg in args {
                state.push_data(arg.clone());
            }
            state.push_data(Value::Int(args.len() as i64));
        }
        self.do_call();
        let result = self.run();
        self.restore_state();
        result
    }

    /// Invoke the method handling the given message.
    pub fn send(&self, obj: &Value, msg: &str) -> VmResult
    {
        debug!("send: `{msg}` to {}", obj.inspect());
        self.save_state();
        let string = self.ctx.alloc(msg.to_owned());
        {
            let mut state = self.state.borrow_mut();
            state.push_data(obj.clone());
            state.push_data(Value::String(string.get()));
        }
        self.do_send();
        let result = self.run();
        self.restore_state();
        result
    }

    /// Send a message and call the resulting method with arguments.
    pub fn send_call(&self, obj: &Value, msg: &str, args: &[Value]) -> VmResult
    {
        let method = self.send(obj, msg)?;
        self.call(&method.get(), args)
    }

    /* ------------------------------ Entry state ----------------------------- */

    fn save_state(&self)
    {
        let mut state = self.state.borrow_mut();
        let frame = StateFrame{
            data_bottom: state.data_bottom,
            call_bottom: state.call_bottom,
            exception_bottom: state.exception_bottom,
        };
        state.saved.push(frame);
        state.data_bottom = state.data.len();
        state.call_bottom = state.calls.len();
        state.exception_bottom = state.exceptions.len();
        state.thrown = false;
    }

    fn restore_state(&self)
    {
        let mut state = self.state.borrow_mut();
        assert!(
            state.data.len() == state.data_bottom,
            "Data stack final size mismatch",
        );
        let frame = state.saved.pop().expect("State stack underflow");
        state.data_bottom = frame.data_bottom;
        state.call_bottom = frame.call_bottom;
        state.exception_bottom = frame.exception_bottom;
        state.thrown = false;
    }

    /* ------------------------------- Execution ------------------------------ */

    fn run(&self) -> VmResult
    {
        while let Some(instr) = self.fetch() {
            match instr.op {
                Opcode::Nop => {}
                Opcode::Pop => {
                    self.state.borrow_mut().pop_data();
                }
                Opcode::Nip => self.state.borrow_mut().nip_data(),
                Opcode::Dup => {
                    let mut state = self.state.borrow_mut();
                    let top = state.peek_data().clone();
                    state.push_data(top);
                }
                Opcode::Nil => self.state.borrow_mut().push_data(Value::Nil),
                Opcode::GetVar => self.get_variable(instr.arg() as usize),
                Opcode::SetVar => self.set_variable(instr.arg() as usize),
                Opcode::GetConst => self.get_constant(instr.arg() as usize),
                Opcode::GetUp => self.get_upvalue(instr.arg() as usize),
                Opcode::SetUp => self.set_upvalue(instr.arg() as usize),
                Opcode::ResetUp => self.reset_upvalues(),
                Opcode::MakeUp => self.make_upvalue(instr.arg() as usize),
                Opcode::CopyUp => self.copy_upvalue(instr.arg() as usize),
                Opcode::GetProp => self.get_property(),
                Opcode::SetProp => self.set_property(),
                Opcode::Call => self.do_call(),
                Opcode::Send => self.do_send(),
                Opcode::Return => self.do_return(),
                Opcode::Jump => self.jump(instr.arg() as usize),
                Opcode::JumpIf => self.jump_cond(instr.arg() as usize, true),
                Opcode::JumpUnless => self.jump_cond(instr.arg() as usize, false),
                Opcode::Throw => self.do_throw(),
                Opcode::Catch => self.do_catch(instr.arg() as usize),
                Opcode::Uncatch => self.uncatch(),
            }
        }
        let (value, thrown) = {
            let mut state = self.state.borrow_mut();
            assert!(
                state.data.len() == state.data_bottom + 1,
                "Data stack final size mismatch",
            );
            assert!(
                state.exceptions.len() == state.exception_bottom,
                "Exception stack final size mismatch",
            );
            let value = state.pop_data();
            let thrown = state.thrown;
            (value, thrown)
        };
        let value = self.ctx.root(value);
        match thrown {
            true => Err(Exception(value)),
            false => Ok(value),
        }
    }

    fn fetch(&self) -> Option<Instruction>
    {
        let mut state = self.state.borrow_mut();
        if state.calls.len() <= state.call_bottom {
            return None;
        }
        let frame = state.frame_mut();
        let func = frame.func.clone();
        let ip = frame.ip;
        frame.ip += 1;
        let func = func.borrow();
        let proto = func.proto.borrow();
        assert!(ip < proto.code.len(), "Instruction pointer out of range");
        Some(proto.code[ip])
    }

    /* ---------------------------- Local variables --------------------------- */

    fn get_variable(&self, idx: usize)
    {
        let mut state = self.state.borrow_mut();
        let idx = state.frame().data_bottom + idx;
        assert!(idx < state.data.len(), "Variable out of range");
        let value = state.data[idx].value.clone();
        state.push_data(value);
    }

    fn set_variable(&self, idx: usize)
    {
        let mut state = self.state.borrow_mut();
        let idx = state.frame().data_bottom + idx;
        assert!(idx < state.data.len(), "Variable out of range");
        let value = state.pop_data();
        state.data[idx].value = value;
    }

    fn get_constant(&self, idx: usize)
    {
        let mut state = self.state.borrow_mut();
        let value = {
            let func = state.frame().func.borrow();
            let proto = func.proto.borrow();
            proto.constants[idx].clone()
        };
        state.push_data(value);
    }

    /* ------------------------------- Upvalues ------------------------------- */

    fn get_upvalue(&self, idx: usize)
    {
        let mut state = self.state.borrow_mut();
        let value = {
            let func = state.frame().func.borrow();
            let upvalue = func.upvalues.get(idx).expect("Upvalue out of range");
            let upvalue = upvalue.borrow();
            match &*upvalue {
                Upvalue::Open(index) => state.data[*index].value.clone(),
                Upvalue::Closed(value) => value.clone(),
            }
        };
        state.push_data(value);
    }

    fn set_upvalue(&self, idx: usize)
    {
        let mut state = self.state.borrow_mut();
        let value = state.pop_data();
        let upvalue = {
            let func = state.frame().func.borrow();
            func.upvalues.get(idx).expect("Upvalue out of range").clone()
        };
        match &mut *upvalue.borrow_mut() {
            Upvalue::Open(index) => state.data[*index].value = value,
            Upvalue::Closed(stored) => *stored = value,
        }
    }

    fn reset_upvalues(&self)
    {
        let func = {
            let mut state = self.state.borrow_mut();
            match state.pop_data() {
                Value::Function(func) => func,
                _ => panic!("Accessing upvalues on a non-function"),
            }
        };
        let func = self.ctx.root(func);
        let proto = func.get().borrow().proto.clone();
        let clone = self.ctx.alloc(Function::new(proto));
        self.state.borrow_mut().push_data(Value::Function(clone.get()));
    }

    fn make_upvalue(&self, idx: usize)
    {
        let (idx, existing) = {
            let state = self.state.borrow();
            let idx = state.frame().data_bottom + idx;
            assert!(idx < state.data.len(), "Variable out of range");
            (idx, state.data[idx].upvalue.clone())
        };
        let upvalue = match existing {
            Some(upvalue) => upvalue,
            None => {
                let fresh = self.ctx.alloc(Upvalue::Open(idx));
                let mut state = self.state.borrow_mut();
                state.data[idx].upvalue = Some(fresh.get());
                fresh.get()
            }
        };
        let state = self.state.borrow();
        match state.peek_data() {
            Value::Function(func) => func.borrow_mut().upvalues.push(upvalue),
            _ => panic!("Accessing upvalues on a non-function"),
        }
    }

    fn copy_upvalue(&self, idx: usize)
    {
        let state = self.state.borrow();
        let upvalue = {
            let func = state.frame().func.borrow();
            func.upvalues.get(idx).expect("Upvalue out of range").clone()
        };
        match state.peek_data() {
            Value::Function(func) => func.borrow_mut().upvalues.push(upvalue),
            _ => panic!("Accessing upvalues on a non-function"),
        }
    }

    /* ------------------------------ Properties ------------------------------ */

    fn get_property(&self)
    {
        let (obj, name) = {
            let mut state = self.state.borrow_mut();
            let name = state.pop_data();
            let obj = state.pop_data();
            (obj, name)
        };
        let name = match name {
            Value::String(name) => name.borrow().clone(),
            _ => panic!("Property name must be a string"),
        };
        let found = match &obj {
            Value::Object(obj) => obj.borrow().get_prop(&name),
            Value::Class(class) => class.borrow().get_prop(&name),
            _ => {
                self.throw_message(&format!("Can't get a property of {}", obj.inspect()));
                return;
            }
        };
        match found {
            Some(value) => self.state.borrow_mut().push_data(value),
            None => self.throw_message(&format!("Object has no property `{name}`")),
        }
    }

    fn set_property(&self)
    {
        let (obj, name, value) = {
            let mut state = self.state.borrow_mut();
            let value = state.pop_data();
            let name = state.pop_data();
            let obj = state.pop_data();
            (obj, name, value)
        };
        let name = match name {
            Value::String(name) => name.borrow().clone(),
            _ => panic!("Property name must be a string"),
        };
        match &obj {
            Value::Object(obj) => obj.borrow_mut().set_prop(&name, value),
            Value::Class(class) => class.borrow_mut().set_prop(&name, value),
            _ => self.throw_message(&format!("Can't set a property of {}", obj.inspect())),
        }
    }

    /* -------------------------------- Calling ------------------------------- */

    fn do_call(&self)
    {
        let (func, nargs) = {
            let mut state = self.state.borrow_mut();
            let nargs = match state.pop_data() {
                Value::Int(n) => n as usize,
                _ => panic!("Malformed call: argument count must be an integer"),
            };
            let func = state.remove_data(nargs);
            (func, nargs)
        };
        let func = self.ctx.root(func);
        let callee = func.get();
        match &callee {
            Value::Function(func) => self.call_native(func, nargs),
            Value::Foreign(func) => self.call_foreign(func, nargs),
            _ => self.throw_message("Can't call a non-function"),
        }
    }

    fn call_native(&self, func: &Ptr<Function>, nargs: usize)
    {
        let arity = func.borrow().proto.borrow().nargs;
        if arity != nargs as u64 {
            self.throw_message("Wrong number of arguments");
            return;
        }
        let mut state = self.state.borrow_mut();
        let frame = CallFrame{
            func: func.clone(),
            ip: 0,
            data_bottom: state.data.len() - nargs,
            exception_bottom: state.exceptions.len(),
        };
        state.calls.push(frame);
    }

    fn call_foreign(&self, func: &Ptr<ForeignFunction>, nargs: usize)
    {
        if func.borrow().nargs != nargs as u64 {
            self.throw_message("Wrong number of arguments");
            return;
        }
        let args = {
            let mut state = self.state.borrow_mut();
            let mut args = vec![Value::Nil; nargs];
            for i in (0 .. nargs).rev() {
                args[i] = state.pop_data();
            }
            args
        };
        let args = self.ctx.root(args);
        let result = {
            let args = args.borrow();
            func.borrow().call(self.ctx, &args)
        };
        match result {
            Ok(value) => self.state.borrow_mut().push_data(value.get()),
            Err(Exception(value)) => {
                self.state.borrow_mut().push_data(value.get());
                self.do_throw();
            }
        }
    }

    fn do_send(&self)
    {
        let (obj, msg) = {
            let mut state = self.state.borrow_mut();
            let msg = state.pop_data();
            let obj = state.pop_data();
            (obj, msg)
        };
        let name = match &msg {
            Value::String(ptr) => ptr.borrow().clone(),
            _ => panic!("Message name must be a string"),
        };
        let obj = self.ctx.root(obj);
        let msg = self.ctx.root(msg);
        let class = obj.borrow().class_of(self.ctx);
        if let Some(method) = class.lookup(&name) {
            {
                let mut state = self.state.borrow_mut();
                state.push_data(method);
                state.push_data(obj.get());
                state.push_data(Value::Int(1));
            }
            self.do_call();
        }
        else if let Some(not_understood) = class.lookup("not_understood") {
            {
                let mut state = self.state.borrow_mut();
                state.push_data(Value::Function(self.fallback.get()));
                state.push_data(not_understood);
                state.push_data(obj.get());
                state.push_data(msg.get());
                state.push_data(Value::Int(3));
            }
            self.do_call();
        }
        else {
            let message = format!("{} doesn't understand message `{name}`", obj.get().inspect());
            self.throw_message(&message);
        }
    }

    fn do_return(&self)
    {
        let mut state = self.state.borrow_mut();
        let data_bottom = state.frame().data_bottom;
        let exception_bottom = state.frame().exception_bottom;
        assert!(state.data.len() > data_bottom, "Data stack underflow");
        let value = state.pop_data();
        while state.data.len() > data_bottom {
            state.pop_data();
        }
        state.push_data(value);
        state.exceptions.truncate(exception_bottom);
        state.calls.pop();
    }

    /* --------------------------------- Jumps -------------------------------- */

    fn jump(&self, addr: usize)
    {
        self.state.borrow_mut().frame_mut().ip = addr;
    }

    fn jump_cond(&self, addr: usize, cond: bool)
    {
        let value = self.state.borrow_mut().pop_data();
        match value {
            Value::Bool(b) => {
                if b == cond {
                    self.state.borrow_mut().frame_mut().ip = addr;
                }
            }
            _ => self.throw_message("Expected a bool in conditional"),
        }
    }

    /* ------------------------------ Exceptions ------------------------------ */

    fn do_throw(&self)
    {
        let mut state = self.state.borrow_mut();
        if state.exceptions.len() == state.exception_bottom {
            // No handler within this entry: surface the value to the
            // host through `run`.
            let value = state.pop_data();
            let data_bottom = state.data_bottom;
            while state.data.len() > data_bottom {
                state.pop_data();
            }
            state.push_data(value);
            let call_bottom = state.call_bottom;
            state.calls.truncate(call_bottom);
            state.thrown = true;
        }
        else {
            let handler = state.exceptions.pop().expect("Exception stack underflow");
            let value = state.pop_data();
            while state.data.len() > handler.data_bottom {
                state.pop_data();
            }
            state.push_data(value);
            state.calls.truncate(handler.call_bottom);
            state.frame_mut().ip = handler.address;
        }
    }

    fn throw_message(&self, message: &str)
    {
        let value = self.ctx.alloc(message.to_owned());
        self.state.borrow_mut().push_data(Value::String(value.get()));
        self.do_throw();
    }

    fn do_catch(&self, addr: usize)
    {
        let mut state = self.state.borrow_mut();
        let handler = ExceptionFrame{
            data_bottom: state.data.len(),
            call_bottom: state.calls.len(),
            address: addr,
        };
        state.exceptions.push(handler);
    }

    fn uncatch(&self)
    {
        let mut state = self.state.borrow_mut();
        assert!(
            state.exceptions.len() > state.exception_bottom,
            "Exception stack underflow",
        );
        state.exceptions.pop();
    }
}
