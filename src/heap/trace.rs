//! Tracing of garbage-collected values.

use {
    super::{GcBox, Ptr},
    std::{collections::HashMap, rc::Rc},
};

/// Visitor handed to [`Trace::trace`] implementations.
///
/// Visiting a pointer schedules the box it references for tracing,
/// unless the box was already visited during the current cycle.
pub struct Tracer
{
    pub (super) queue: Vec<Rc<GcBox>>,
}

impl Tracer
{
    /// Visit one pointer reachable from the traced value.
    pub fn visit<T>(&mut self, ptr: &Ptr<T>)
    {
        let Some(gcbox) = ptr.weak.upgrade() else { return };
        if gcbox.marked.get() || gcbox.value.borrow().is_none() {
            return;
        }
        gcbox.marked.set(true);
        self.queue.push(gcbox);
    }
}

/// Types that can be managed or rooted by the collector.
///
/// An implementation must visit every [`Ptr`] directly reachable from
/// the value; the collector takes care of the transitive closure.
/// A value that owns no pointers implements this as a no-op.
pub trait Trace
{
    /// Visit every pointer directly held by the value.
    fn trace(&self, tracer: &mut Tracer);
}

macro_rules! trace_leaf
{
    ($($type:ty),* $(,)?) => {
        $(
            impl Trace for $type
            {
                fn trace(&self, _: &mut Tracer)
                {
                }
            }
        )*
    };
}

trace_leaf!
{
    (), bool, char,
    u8, u16, u32, u64, usize,
    i8, i16, i32, i64, isize,
    f32, f64,
    String,
}

impl<T> Trace for Ptr<T>
{
    fn trace(&self, tracer: &mut Tracer)
    {
        tracer.visit(self);
    }
}

impl<T: Trace> Trace for Vec<T>
{
    fn trace(&self, tracer: &mut Tracer)
    {
        for value in self {
            value.trace(tracer);
        }
    }
}

impl<T: Trace> Trace for Option<T>
{
    fn trace(&self, tracer: &mut Tracer)
    {
        if let Some(value) = self {
            value.trace(tracer);
        }
    }
}

impl<T: Trace + ?Sized> Trace for Box<T>
{
    fn trace(&self, tracer: &mut Tracer)
    {
        (**self).trace(tracer);
    }
}

impl<K: Trace, V: Trace> Trace for HashMap<K, V>
{
    fn trace(&self, tracer: &mut Tracer)
    {
        for (key, value) in self {
            key.trace(tracer);
            value.trace(tracer);
        }
    }
}
