//! Interpreter contexts.

use {
    crate::{
        heap::{Collector, Ptr, Root, Trace},
        value::{Klass, Value},
    },
    std::collections::HashMap,
};

/// Process-wide state of one interpreter instance.
///
/// A context owns the collector, the well-known classes, and the table
/// of builtin names that compiled programs see as their outermost
/// lexical scope. It holds no global storage and is passed explicitly
/// to every allocation, compilation and VM operation; independent
/// contexts may coexist as long as values from one are never mixed into
/// another.
pub struct Context
{
    gc: Collector,
    /// Class of plain objects and root of every inheritance chain.
    pub object_cls: Root<Ptr<Klass>>,
    /// Class of classes. Its class is itself; its base is `Object`.
    pub class_cls: Root<Ptr<Klass>>,
    /// Class of the nil value.
    pub nil_cls: Root<Ptr<Klass>>,
    /// Class of booleans.
    pub bool_cls: Root<Ptr<Klass>>,
    /// Class of integers.
    pub int_cls: Root<Ptr<Klass>>,
    /// Class of strings.
    pub string_cls: Root<Ptr<Klass>>,
    /// Class of functions, bytecode and foreign alike.
    pub function_cls: Root<Ptr<Klass>>,
    builtins: Root<HashMap<String, Value>>,
}

impl Context
{
    /// Create a context with freshly bootstrapped classes and an empty
    /// builtin table.
    pub fn new() -> Self
    {
        let gc = Collector::new();

        // Object and Class refer to each other, so they are created
        // classless and tied together afterwards.
        let object_cls = gc.alloc(Klass::from_parts(Ptr::null(), None));
        let class_cls = gc.alloc(Klass::from_parts(Ptr::null(), None));
        object_cls.get().borrow_mut().klass = class_cls.get();
        {
            let ptr = class_cls.get();
            let mut class = ptr.borrow_mut();
            class.klass = class_cls.get();
            class.base = Some(object_cls.get());
        }

        let primitive = || Klass::from_parts(class_cls.get(), Some(object_cls.get()));
        let nil_cls = gc.alloc(primitive());
        let bool_cls = gc.alloc(primitive());
        let int_cls = gc.alloc(primitive());
        let string_cls = gc.alloc(primitive());
        let function_cls = gc.alloc(primitive());

        let builtins = gc.root(HashMap::new());

        Self{
            gc,
            object_cls,
            class_cls,
            nil_cls,
            bool_cls,
            int_cls,
            string_cls,
            function_cls,
            builtins,
        }
    }

    /// Allocate a collector-managed value; see [`Collector::alloc`].
    pub fn alloc<T: Trace + 'static>(&self, value: T) -> Root<Ptr<T>>
    {
        self.gc.alloc(value)
    }

    /// Root a value; see [`Collector::root`].
    pub fn root<T: Trace + 'static>(&self, value: T) -> Root<T>
    {
        self.gc.root(value)
    }

    /// Run one collection cycle; see [`Collector::collect`].
    pub fn collect(&self)
    {
        self.gc.collect()
    }

    /// Install a top-level name made available to every program
    /// compiled against this context.
    pub fn define_builtin(&self, name: &str, value: Value)
    {
        self.builtins.borrow_mut().insert(name.to_owned(), value);
    }

    /// Snapshot of the builtin table, in arbitrary order.
    pub fn builtins(&self) -> Vec<(String, Value)>
    {
        self.builtins.borrow()
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

impl Default for Context
{
    fn default() -> Self
    {
        Self::new()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn well_known_classes_are_wired_up()
    {
        let ctx = Context::new();
        let object = ctx.object_cls.get();
        let class = ctx.class_cls.get();
        assert!(object.borrow().klass.ptr_eq(&class));
        assert!(class.borrow().klass.ptr_eq(&class));
        assert!(class.borrow().base.as_ref().unwrap().ptr_eq(&object));
        for primitive in [&ctx.nil_cls, &ctx.bool_cls, &ctx.int_cls, &ctx.string_cls, &ctx.function_cls] {
            let ptr = primitive.get();
            assert!(ptr.borrow().klass.ptr_eq(&class));
            assert!(ptr.borrow().base.as_ref().unwrap().ptr_eq(&object));
        }
    }

    #[test]
    fn classes_survive_collection()
    {
        let ctx = Context::new();
        ctx.collect();
        assert!(ctx.object_cls.get().valid());
        assert!(ctx.function_cls.get().valid());
    }

    #[test]
    fn builtins_are_rooted()
    {
        let ctx = Context::new();
        {
            let hello = ctx.alloc("hello".to_owned());
            ctx.define_builtin("greeting", Value::String(hello.get()));
        }
        ctx.collect();
        let builtins = ctx.builtins();
        let (_, value) = builtins.iter().find(|(name, _)| name == "greeting").unwrap();
        match value {
            Value::String(ptr) => assert_eq!(&*ptr.borrow(), "hello"),
            _ => panic!("builtin has the wrong type"),
        }
    }
}
