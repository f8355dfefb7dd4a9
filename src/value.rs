//! Values, objects, classes and functions.

use {
    crate::{
        bytecode::{Instruction, Opcode},
        context::Context,
        heap::{Ptr, Root, Trace, Tracer},
        vm::Exception,
    },
    std::{collections::HashMap, fmt::Write, rc::Rc},
};

/* -------------------------------------------------------------------------- */
/*                                    Value                                   */
/* -------------------------------------------------------------------------- */

/// Union of all possible value types.
///
/// Nil, booleans and integers are immediate; the remaining variants hold
/// weak pointers into the heap. Values are cheap to clone, and the heap
/// contents behind the pointer variants stay mutable and shared.
#[derive(Clone, Debug)]
pub enum Value
{
    /// The nil value.
    Nil,
    /// A boolean.
    Bool(bool),
    /// A 64-bit signed integer.
    Int(i64),
    /// A string.
    String(Ptr<String>),
    /// A bytecode function closure.
    Function(Ptr<Function>),
    /// A function implemented by the host.
    Foreign(Ptr<ForeignFunction>),
    /// A compound object.
    Object(Ptr<Object>),
    /// An object implemented by the host.
    ForeignObject(Ptr<ForeignObject>),
    /// A class.
    Class(Ptr<Klass>),
}

impl Value
{
    /// The value's class.
    pub fn class_of(&self, ctx: &Context) -> Ptr<Klass>
    {
        match self {
            Value::Nil => ctx.nil_cls.get(),
            Value::Bool(..) => ctx.bool_cls.get(),
            Value::Int(..) => ctx.int_cls.get(),
            Value::String(..) => ctx.string_cls.get(),
            Value::Function(..) => ctx.function_cls.get(),
            Value::Foreign(..) => ctx.function_cls.get(),
            Value::Object(obj) => obj.borrow().klass.clone(),
            Value::ForeignObject(obj) => obj.borrow().klass.clone(),
            Value::Class(class) => class.borrow().klass.clone(),
        }
    }

    /// The contained integer, if the value is one.
    pub fn as_int(&self) -> Option<i64>
    {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// The contained boolean, if the value is one.
    pub fn as_bool(&self) -> Option<bool>
    {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Whether the value is nil.
    pub fn is_nil(&self) -> bool
    {
        matches!(self, Value::Nil)
    }

    /// A human-readable representation of the value.
    ///
    /// Heap values are labelled with the address of their box.
    pub fn inspect(&self) -> String
    {
        match self {
            Value::Nil => "nil".to_owned(),
            Value::Bool(true) => "true".to_owned(),
            Value::Bool(false) => "false".to_owned(),
            Value::Int(value) => value.to_string(),
            Value::String(ptr) => inspect_string(&ptr.borrow()),
            Value::Function(ptr) => format!("Function#{:x}", ptr.address()),
            Value::Foreign(ptr) => format!("ForeignFunction#{:x}", ptr.address()),
            Value::Object(ptr) => format!("Object#{:x}", ptr.address()),
            Value::ForeignObject(ptr) => format!("ForeignObject#{:x}", ptr.address()),
            Value::Class(ptr) => format!("Klass#{:x}", ptr.address()),
        }
    }
}

impl Default for Value
{
    fn default() -> Self
    {
        Value::Nil
    }
}

impl Trace for Value
{
    fn trace(&self, tracer: &mut Tracer)
    {
        match self {
            Value::Nil | Value::Bool(..) | Value::Int(..) => {}
            Value::String(ptr) => tracer.visit(ptr),
            Value::Function(ptr) => tracer.visit(ptr),
            Value::Foreign(ptr) => tracer.visit(ptr),
            Value::Object(ptr) => tracer.visit(ptr),
            Value::ForeignObject(ptr) => tracer.visit(ptr),
            Value::Class(ptr) => tracer.visit(ptr),
        }
    }
}

fn inspect_string(value: &str) -> String
{
    const ESCAPES: [char; 7] = ['a', 'b', 't', 'n', 'v', 'f', 'r'];
    let mut buf = String::from("\"");
    for c in value.chars() {
        match c {
            '\x07' ..= '\x0d' => {
                buf.push('\\');
                buf.push(ESCAPES[c as usize - 0x07]);
            }
            '\0' ..= '\x1f' => {
                let _ = write!(buf, "\\x{:02x}", c as u32);
            }
            '"' | '\\' => {
                buf.push('\\');
                buf.push(c);
            }
            _ => buf.push(c),
        }
    }
    buf.push('"');
    buf
}

/* -------------------------------------------------------------------------- */
/*                                   Objects                                  */
/* -------------------------------------------------------------------------- */

/// A native compound object.
///
/// All values are objects to the language; this particular type is the
/// dictionary-like kind created by programs and hosts.
pub struct Object
{
    /// The object's properties.
    pub properties: HashMap<String, Value>,
    /// The object's class.
    pub klass: Ptr<Klass>,
}

impl Object
{
    /// Create an object of the given class with no properties.
    pub fn new(klass: Ptr<Klass>) -> Self
    {
        Self{properties: HashMap::new(), klass}
    }

    /// Read a property.
    pub fn get_prop(&self, name: &str) -> Option<Value>
    {
        self.properties.get(name).cloned()
    }

    /// Write a property, creating it if needed.
    pub fn set_prop(&mut self, name: &str, value: Value)
    {
        self.properties.insert(name.to_owned(), value);
    }
}

impl Trace for Object
{
    fn trace(&self, tracer: &mut Tracer)
    {
        self.properties.trace(tracer);
        tracer.visit(&self.klass);
    }
}

/// An object implemented by the host.
///
/// Carries an opaque host payload next to its class; the payload is not
/// traced, so it must not contain collector-managed pointers.
pub struct ForeignObject
{
    /// The object's class.
    pub klass: Ptr<Klass>,
    data: Box<dyn std::any::Any>,
}

impl ForeignObject
{
    /// Create a foreign object wrapping a host value.
    pub fn new(klass: Ptr<Klass>, data: impl std::any::Any) -> Self
    {
        Self{klass, data: Box::new(data)}
    }

    /// Borrow the host payload.
    pub fn data<T: std::any::Any>(&self) -> Option<&T>
    {
        self.data.downcast_ref()
    }

    /// Borrow the host payload mutably.
    pub fn data_mut<T: std::any::Any>(&mut self) -> Option<&mut T>
    {
        self.data.downcast_mut()
    }
}

impl Trace for ForeignObject
{
    fn trace(&self, tracer: &mut Tracer)
    {
        tracer.visit(&self.klass);
    }
}

/* -------------------------------------------------------------------------- */
/*                                   Classes                                  */
/* -------------------------------------------------------------------------- */

/// Entry in a class's method table.
struct MethodEntry
{
    value: Value,
    /// True if the class defined the method itself; false if the entry
    /// caches a hit from an ancestor.
    own: bool,
    /// Detonator shared with every cache of this entry. Flipping it to
    /// false invalidates those caches lazily; they are purged on their
    /// next lookup.
    valid: Ptr<bool>,
}

impl Trace for MethodEntry
{
    fn trace(&self, tracer: &mut Tracer)
    {
        self.value.trace(tracer);
        tracer.visit(&self.valid);
    }
}

/// A class. Spelled with a k to stay clear of the keyword.
///
/// A class carries everything an [`Object`] does along with a method
/// table and an optional base class. Method lookup walks the base chain
/// and caches ancestral hits locally; definitions and removals
/// invalidate affected caches through their detonators instead of
/// eagerly traversing descendants.
pub struct Klass
{
    /// The class object's own properties.
    pub properties: HashMap<String, Value>,
    /// The class of this class.
    pub klass: Ptr<Klass>,
    methods: HashMap<String, MethodEntry>,
    /// The base class, if any.
    pub base: Option<Ptr<Klass>>,
}

impl Klass
{
    /// Create a class from raw parts.
    pub fn from_parts(klass: Ptr<Klass>, base: Option<Ptr<Klass>>) -> Self
    {
        Self{properties: HashMap::new(), klass, methods: HashMap::new(), base}
    }

    /// Create a class inheriting from a base.
    pub fn inheriting(ctx: &Context, base: &Ptr<Klass>) -> Self
    {
        Self::from_parts(ctx.class_cls.get(), Some(base.clone()))
    }

    /// Read a property of the class object.
    pub fn get_prop(&self, name: &str) -> Option<Value>
    {
        self.properties.get(name).cloned()
    }

    /// Write a property of the class object.
    pub fn set_prop(&mut self, name: &str, value: Value)
    {
        self.properties.insert(name.to_owned(), value);
    }
}

impl Trace for Klass
{
    fn trace(&self, tracer: &mut Tracer)
    {
        self.properties.trace(tracer);
        tracer.visit(&self.klass);
        self.methods.trace(tracer);
        self.base.trace(tracer);
    }
}

impl Ptr<Klass>
{
    /// Find a method in the class chain.
    pub fn lookup(&self, name: &str) -> Option<Value>
    {
        self.lookup_rec(name).map(|(value, _)| value)
    }

    fn lookup_rec(&self, name: &str) -> Option<(Value, Ptr<bool>)>
    {
        let base = {
            let mut klass = self.borrow_mut();
            if let Some(entry) = klass.methods.get(name) {
                if entry.own || *entry.valid.borrow() {
                    return Some((entry.value.clone(), entry.valid.clone()));
                }
                // Purge the invalidated cache.
                klass.methods.remove(name);
            }
            klass.base.clone()
        };
        let (value, valid) = base?.lookup_rec(name)?;
        let entry = MethodEntry{value: value.clone(), own: false, valid: valid.clone()};
        self.borrow_mut().methods.insert(name.to_owned(), entry);
        Some((value, valid))
    }

    /// Create a method or overwrite an existing one.
    ///
    /// The caller keeps `value` reachable; defining may trigger a
    /// collection while allocating the fresh detonator.
    pub fn define(&self, ctx: &Context, name: &str, value: Value)
    {
        // Fast path when redefining a method this class already owns:
        // detonate the old entry and install a fresh detonator.
        let owned = self.borrow().methods.get(name).map_or(false, |entry| entry.own);
        if owned {
            let fresh = ctx.alloc(true);
            let mut klass = self.borrow_mut();
            let entry = klass.methods.get_mut(name).expect("method table changed during define");
            entry.value = value;
            *entry.valid.borrow_mut() = false;
            entry.valid = fresh.get();
            return;
        }
        // Otherwise invalidate the inherited caches and insert.
        let base = self.borrow().base.clone();
        if let Some(base) = base {
            base.define_fixup(ctx, name);
        }
        let fresh = ctx.alloc(true);
        let entry = MethodEntry{value, own: true, valid: fresh.get()};
        self.borrow_mut().methods.insert(name.to_owned(), entry);
    }

    fn define_fixup(&self, ctx: &Context, name: &str)
    {
        let owned = {
            let klass = self.borrow();
            klass.methods.get(name).map(|entry| entry.own)
        };
        match owned {
            // An ancestor's own definition: caches of it anywhere below
            // are now shadowed, so detonate and re-arm.
            Some(true) => {
                let fresh = ctx.alloc(true);
                let mut klass = self.borrow_mut();
                let entry = klass.methods.get_mut(name).expect("method table changed during define");
                *entry.valid.borrow_mut() = false;
                entry.valid = fresh.get();
            }
            // A cache along the chain is about to become stale.
            Some(false) => {
                self.borrow_mut().methods.remove(name);
                let base = self.borrow().base.clone();
                if let Some(base) = base {
                    base.define_fixup(ctx, name);
                }
            }
            None => {
                let base = self.borrow().base.clone();
                if let Some(base) = base {
                    base.define_fixup(ctx, name);
                }
            }
        }
    }

    /// Remove an owned method from the class and return it.
    ///
    /// Cached copies in descendants become stale lazily through the
    /// entry's detonator.
    pub fn remove(&self, name: &str) -> Option<Value>
    {
        let mut klass = self.borrow_mut();
        if !klass.methods.get(name).map_or(false, |entry| entry.own) {
            return None;
        }
        let entry = klass.methods.remove(name).expect("method table changed during remove");
        *entry.valid.borrow_mut() = false;
        Some(entry.value)
    }
}

/* -------------------------------------------------------------------------- */
/*                                  Functions                                 */
/* -------------------------------------------------------------------------- */

/// Either an absolute index into the VM data stack (open) or a value of
/// its own (closed).
///
/// An upvalue is open while the captured stack slot still exists; when
/// the slot is removed, the slot's value moves into the upvalue.
pub enum Upvalue
{
    /// The captured variable still lives on the data stack.
    Open(usize),
    /// The captured variable has been moved off the stack.
    Closed(Value),
}

impl Trace for Upvalue
{
    fn trace(&self, tracer: &mut Tracer)
    {
        match self {
            Upvalue::Open(..) => {}
            Upvalue::Closed(value) => value.trace(tracer),
        }
    }
}

/// Constant part of a function, shared between closures.
#[derive(Default)]
pub struct FunctionProto
{
    /// Number of arguments the function expects.
    pub nargs: u64,
    /// The function's bytecode.
    pub code: Vec<Instruction>,
    /// The function's constant pool.
    pub constants: Vec<Value>,
}

impl Trace for FunctionProto
{
    fn trace(&self, tracer: &mut Tracer)
    {
        self.constants.trace(tracer);
    }
}

/// A function closure: a shared proto plus per-closure upvalues.
pub struct Function
{
    /// The shared constant part.
    pub proto: Ptr<FunctionProto>,
    /// The closure's captured upvalues.
    pub upvalues: Vec<Ptr<Upvalue>>,
}

impl Function
{
    /// Create a closure with no upvalues.
    pub fn new(proto: Ptr<FunctionProto>) -> Self
    {
        Self{proto, upvalues: Vec::new()}
    }
}

impl Trace for Function
{
    fn trace(&self, tracer: &mut Tracer)
    {
        tracer.visit(&self.proto);
        self.upvalues.trace(tracer);
    }
}

impl Ptr<Function>
{
    /// Render a human-readable listing of the function's bytecode,
    /// including the bytecode of nested function constants.
    pub fn dump(&self) -> String
    {
        let mut buf = String::new();
        let mut labels = HashMap::new();
        self.dump_rec(&mut buf, &mut labels);
        buf
    }

    fn dump_rec(&self, buf: &mut String, labels: &mut HashMap<usize, usize>)
    {
        fn label(labels: &mut HashMap<usize, usize>, address: usize) -> usize
        {
            let next = labels.len();
            *labels.entry(address).or_insert(next)
        }

        let func = self.borrow();
        let proto = func.proto.borrow();
        let _ = writeln!(buf, "Function#{}", label(labels, self.address()));
        let _ = writeln!(buf, "nargs: {}", proto.nargs);
        let _ = writeln!(buf, "nconstants: {}", proto.constants.len());
        let _ = writeln!(buf, "code:");
        let width = proto.code.len().max(1).to_string().len();
        for (i, instr) in proto.code.iter().enumerate() {
            let _ = write!(buf, "  {i:>width$}  {instr}");
            if instr.op == Opcode::GetConst {
                let constant = &proto.constants[instr.arg() as usize];
                let text = match constant {
                    Value::Function(ptr) => format!("Function#{}", label(labels, ptr.address())),
                    Value::Foreign(ptr) => format!("ForeignFunction#{}", label(labels, ptr.address())),
                    Value::Object(ptr) => format!("Object#{}", label(labels, ptr.address())),
                    Value::ForeignObject(ptr) => format!("ForeignObject#{}", label(labels, ptr.address())),
                    Value::Class(ptr) => format!("Klass#{}", label(labels, ptr.address())),
                    immediate => immediate.inspect(),
                };
                let _ = write!(buf, " ({text})");
            }
            let _ = writeln!(buf);
        }
        for constant in &proto.constants {
            if let Value::Function(inner) = constant {
                let _ = writeln!(buf);
                inner.dump_rec(buf, labels);
            }
        }
    }
}

/* -------------------------------------------------------------------------- */
/*                              Foreign functions                             */
/* -------------------------------------------------------------------------- */

/// Result of a foreign function: a rooted value, or a raised one.
pub type ForeignResult = Result<Root<Value>, Exception>;

type ForeignCallback = Box<dyn Fn(&Context, &[Value], &[Value]) -> ForeignResult>;

/// A function implemented by the host.
///
/// Foreign functions may close over collector-managed values; the
/// captures are traced through the function's box and handed back to
/// the callback on every invocation. Script-visible errors are raised
/// by returning an [`Exception`]; the VM turns that into its `Throw`
/// machinery at the call boundary.
pub struct ForeignFunction
{
    /// Number of arguments the function expects; checked by the VM.
    pub nargs: u64,
    captures: Vec<Value>,
    callback: ForeignCallback,
}

impl ForeignFunction
{
    /// Create a foreign function from a callback.
    pub fn lambda<F>(nargs: u64, callback: F) -> Self
        where F: Fn(&Context, &[Value]) -> ForeignResult + 'static
    {
        Self{
            nargs,
            captures: Vec::new(),
            callback: Box::new(move |ctx, args, _| callback(ctx, args)),
        }
    }

    /// Create a foreign function closing over collector-managed values.
    ///
    /// The callback receives the captures as its third argument.
    pub fn lambda_with<F>(nargs: u64, captures: Vec<Value>, callback: F) -> Self
        where F: Fn(&Context, &[Value], &[Value]) -> ForeignResult + 'static
    {
        Self{nargs, captures, callback: Box::new(callback)}
    }

    /// Create a method.
    ///
    /// A method is a function of one argument, `self`, returning a
    /// freshly allocated closure of `nargs` arguments that carries the
    /// bound `self`.
    pub fn method<F>(nargs: u64, callback: F) -> Self
        where F: Fn(&Context, &Value, &[Value]) -> ForeignResult + 'static
    {
        Self::method_with(nargs, Vec::new(), move |ctx, this, args, _| {
            callback(ctx, this, args)
        })
    }

    /// Create a method closing over collector-managed values.
    pub fn method_with<F>(nargs: u64, captures: Vec<Value>, callback: F) -> Self
        where F: Fn(&Context, &Value, &[Value], &[Value]) -> ForeignResult + 'static
    {
        let callback = Rc::new(callback);
        Self{
            nargs: 1,
            captures,
            callback: Box::new(move |ctx, args, captures| {
                let callback = callback.clone();
                let mut bound = Vec::with_capacity(captures.len() + 1);
                bound.push(args[0].clone());
                bound.extend(captures.iter().cloned());
                let inner = ForeignFunction{
                    nargs,
                    captures: bound,
                    callback: Box::new(move |ctx, args, captures| {
                        (*callback)(ctx, &captures[0], args, &captures[1 ..])
                    }),
                };
                let inner = ctx.alloc(inner);
                Ok(ctx.root(Value::Foreign(inner.get())))
            }),
        }
    }

    /// Invoke the function.
    pub fn call(&self, ctx: &Context, args: &[Value]) -> ForeignResult
    {
        (self.callback)(ctx, args, &self.captures)
    }
}

impl Trace for ForeignFunction
{
    fn trace(&self, tracer: &mut Tracer)
    {
        self.captures.trace(tracer);
    }
}

#[cfg(test)]
mod tests
{
    use {super::*, crate::context::Context};

    #[test]
    fn inspect_immediates()
    {
        assert_eq!(Value::Nil.inspect(), "nil");
        assert_eq!(Value::Bool(true).inspect(), "true");
        assert_eq!(Value::Bool(false).inspect(), "false");
        assert_eq!(Value::Int(-17).inspect(), "-17");
    }

    #[test]
    fn inspect_string_escapes()
    {
        let ctx = Context::new();
        let string = ctx.alloc("a\"b\\c\n\x01".to_owned());
        let value = Value::String(string.get());
        assert_eq!(value.inspect(), "\"a\\\"b\\\\c\\n\\x01\"");
    }

    #[test]
    fn class_of_primitives()
    {
        let ctx = Context::new();
        assert!(Value::Nil.class_of(&ctx).ptr_eq(&ctx.nil_cls.get()));
        assert!(Value::Bool(true).class_of(&ctx).ptr_eq(&ctx.bool_cls.get()));
        assert!(Value::Int(1).class_of(&ctx).ptr_eq(&ctx.int_cls.get()));
        let string = ctx.alloc("s".to_owned());
        assert!(Value::String(string.get()).class_of(&ctx).ptr_eq(&ctx.string_cls.get()));
    }

    #[test]
    fn class_of_class_is_class()
    {
        let ctx = Context::new();
        let class = ctx.alloc(Klass::inheriting(&ctx, &ctx.object_cls.get()));
        let value = Value::Class(class.get());
        assert!(value.class_of(&ctx).ptr_eq(&ctx.class_cls.get()));
    }

    #[test]
    fn object_properties()
    {
        let ctx = Context::new();
        let object = ctx.alloc(Object::new(ctx.object_cls.get()));
        assert!(object.get().borrow().get_prop("x").is_none());
        object.get().borrow_mut().set_prop("x", Value::Int(5));
        assert_eq!(object.get().borrow().get_prop("x").unwrap().as_int(), Some(5));
    }

    #[test]
    fn lookup_walks_the_chain()
    {
        let ctx = Context::new();
        let parent = ctx.alloc(Klass::inheriting(&ctx, &ctx.object_cls.get()));
        let child = ctx.alloc(Klass::inheriting(&ctx, &parent.get()));
        assert!(child.get().lookup("m").is_none());
        parent.get().define(&ctx, "m", Value::Int(1));
        assert_eq!(child.get().lookup("m").unwrap().as_int(), Some(1));
        // The second lookup is served from the cache.
        assert_eq!(child.get().lookup("m").unwrap().as_int(), Some(1));
    }

    #[test]
    fn redefinition_invalidates_caches()
    {
        let ctx = Context::new();
        let parent = ctx.alloc(Klass::inheriting(&ctx, &ctx.object_cls.get()));
        let child = ctx.alloc(Klass::inheriting(&ctx, &parent.get()));
        parent.get().define(&ctx, "m", Value::Int(1));
        assert_eq!(child.get().lookup("m").unwrap().as_int(), Some(1));
        parent.get().define(&ctx, "m", Value::Int(2));
        assert_eq!(child.get().lookup("m").unwrap().as_int(), Some(2));
    }

    #[test]
    fn closer_definition_shadows_cached_ancestor()
    {
        let ctx = Context::new();
        let grandparent = ctx.alloc(Klass::inheriting(&ctx, &ctx.object_cls.get()));
        let parent = ctx.alloc(Klass::inheriting(&ctx, &grandparent.get()));
        let child = ctx.alloc(Klass::inheriting(&ctx, &parent.get()));
        grandparent.get().define(&ctx, "m", Value::Int(1));
        assert_eq!(child.get().lookup("m").unwrap().as_int(), Some(1));
        // Defining on the closer ancestor must defeat the caches that
        // lookup left in child and parent.
        parent.get().define(&ctx, "m", Value::Int(2));
        assert_eq!(child.get().lookup("m").unwrap().as_int(), Some(2));
        // Removing it re-exposes the further ancestor's definition.
        assert_eq!(parent.get().remove("m").unwrap().as_int(), Some(2));
        assert_eq!(child.get().lookup("m").unwrap().as_int(), Some(1));
    }

    #[test]
    fn remove_only_touches_owned_entries()
    {
        let ctx = Context::new();
        let parent = ctx.alloc(Klass::inheriting(&ctx, &ctx.object_cls.get()));
        let child = ctx.alloc(Klass::inheriting(&ctx, &parent.get()));
        parent.get().define(&ctx, "m", Value::Int(1));
        assert_eq!(child.get().lookup("m").unwrap().as_int(), Some(1));
        // The child only holds a cache, so removing from it is a no-op.
        assert!(child.get().remove("m").is_none());
        assert_eq!(child.get().lookup("m").unwrap().as_int(), Some(1));
    }

    #[test]
    fn methods_survive_collection()
    {
        let ctx = Context::new();
        let class = ctx.alloc(Klass::inheriting(&ctx, &ctx.object_cls.get()));
        {
            let method = ctx.alloc("the method".to_owned());
            class.get().define(&ctx, "m", Value::String(method.get()));
        }
        ctx.collect();
        let found = class.get().lookup("m").unwrap();
        match found {
            Value::String(ptr) => assert_eq!(&*ptr.borrow(), "the method"),
            _ => panic!("lookup returned the wrong value"),
        }
    }

    #[test]
    fn foreign_captures_are_traced()
    {
        let ctx = Context::new();
        let func = {
            let captured = ctx.alloc("captured".to_owned());
            ctx.alloc(ForeignFunction::lambda_with(
                0,
                vec![Value::String(captured.get())],
                |ctx, _, captures| Ok(ctx.root(captures[0].clone())),
            ))
        };
        ctx.collect();
        let result = func.get().borrow().call(&ctx, &[]).unwrap();
        match result.get() {
            Value::String(ptr) => assert_eq!(&*ptr.borrow(), "captured"),
            _ => panic!("capture was lost"),
        }
    }
}
