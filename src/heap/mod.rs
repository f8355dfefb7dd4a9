//! Garbage-collected heap.
//!
//! The [`Collector`] owns every heap allocation and reclaims unreachable
//! ones with a tracing mark-and-sweep. Handing out direct references to
//! collected storage cannot be made safe, so the interface splits access
//! in two:
//!
//!  - [`Ptr`] is a *weak*, nullable handle. A collection cycle can
//!    invalidate it at any time, and every access is checked.
//!  - [`Root`] is a scoped strong anchor. Everything transitively
//!    reachable from a live root survives collection, so pointers held
//!    inside a root stay valid for the root's lifetime.
//!
//! Values become reachable through the [`Trace`] operation, which visits
//! the pointers a value holds. Tracing is structural: collections trace
//! their elements, sums trace the active variant, primitives are leaves.
//!
//! Roots should live on the stack or in host-owned structures. A value
//! managed by the collector must not itself contain a root; root cycles
//! would keep each other alive forever.

pub use self::trace::*;

use {
    log::debug,
    std::{
        any::Any,
        cell::{Cell, Ref, RefCell, RefMut},
        collections::HashMap,
        fmt,
        marker::PhantomData,
        mem::transmute,
        ops::{Deref, DerefMut},
        rc::{Rc, Weak},
    },
};

mod trace;

/// Collection threshold floor; see [`Collector::alloc`].
const MIN_THRESHOLD: usize = 128;

/* -------------------------------------------------------------------------- */
/*                                    Boxes                                   */
/* -------------------------------------------------------------------------- */

/// Object-safe shim over [`Trace`] + [`Any`], so boxes can hold payloads
/// of arbitrary traceable types and hand them back by checked downcast.
trait Payload: Any
{
    fn trace_payload(&self, tracer: &mut Tracer);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Trace + 'static> Payload for T
{
    fn trace_payload(&self, tracer: &mut Tracer)
    {
        self.trace(tracer);
    }

    fn as_any(&self) -> &dyn Any
    {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any
    {
        self
    }
}

/// Heap node: collector metadata plus the contained value.
///
/// The payload is destroyed in place when the box becomes unreachable;
/// the node itself lives on for as long as weak handles to it exist, so
/// dangling pointers keep failing their validity checks safely.
struct GcBox
{
    /// Switches to true when visited during the mark phase.
    marked: Cell<bool>,
    /// The contained value; [`None`] once the collector destroyed it.
    value: RefCell<Option<Box<dyn Payload>>>,
}

/* -------------------------------------------------------------------------- */
/*                                     Ptr                                    */
/* -------------------------------------------------------------------------- */

/// Weak, nullable handle to a heap value.
///
/// A collection cycle invalidates pointers to unreachable values, so a
/// pointer may dangle; [`valid`][`Self::valid`] tells. The borrow
/// methods check, and accessing an invalid pointer is a host bug that
/// aborts with a panic rather than a language-level error.
pub struct Ptr<T>
{
    weak: Weak<GcBox>,
    marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Ptr<T>
{
    fn clone(&self) -> Self
    {
        Self{weak: self.weak.clone(), marker: PhantomData}
    }
}

impl<T> Ptr<T>
{
    /// Create a null pointer. Null pointers are never valid.
    pub fn null() -> Self
    {
        Self{weak: Weak::new(), marker: PhantomData}
    }

    /// Re-type the pointer without any checks.
    ///
    /// This is the moral equivalent of a C-style cast: nothing is
    /// verified here, but a later checked borrow through the returned
    /// pointer fails if the payload is not a `U`.
    pub fn cast<U>(&self) -> Ptr<U>
    {
        Ptr{weak: self.weak.clone(), marker: PhantomData}
    }

    /// Whether two pointers refer to the same box.
    pub fn ptr_eq(&self, other: &Ptr<T>) -> bool
    {
        Weak::ptr_eq(&self.weak, &other.weak)
    }

    /// Address of the referenced box.
    ///
    /// Only useful as a stable identity, e.g. for labels in listings.
    pub fn address(&self) -> usize
    {
        self.weak.as_ptr() as *const () as usize
    }
}

impl<T: 'static> Ptr<T>
{
    /// Whether the pointer references a live value.
    pub fn valid(&self) -> bool
    {
        match self.weak.upgrade() {
            Some(gcbox) => gcbox.value.borrow().is_some(),
            None => false,
        }
    }

    /// Re-type the pointer with a runtime check.
    ///
    /// Yields the re-typed pointer if the referenced value is live and
    /// actually a `U`, and [`None`] otherwise.
    pub fn dyncast<U: 'static>(&self) -> Option<Ptr<U>>
    {
        let gcbox = self.weak.upgrade()?;
        let value = gcbox.value.borrow();
        match value.as_ref()?.as_any().is::<U>() {
            true => Some(self.cast()),
            false => None,
        }
    }

    /// Borrow the referenced value.
    ///
    /// # Panics
    ///
    /// Panics if the pointer is invalid, if the payload is not a `T`,
    /// or if the value is currently borrowed mutably.
    pub fn borrow(&self) -> GcRef<T>
    {
        let gcbox = self.weak.upgrade().expect("can't access an invalid Ptr");
        let borrow = Ref::map(gcbox.value.borrow(), |value| {
            value.as_ref().expect("can't access an invalid Ptr")
                .as_any().downcast_ref::<T>()
                .expect("Ptr was cast to the wrong type")
        });
        // SAFETY: The borrow points into the allocation kept alive by
        // `gcbox` below it in the guard; field order ends it first.
        let borrow = unsafe { transmute::<Ref<'_, T>, Ref<'static, T>>(borrow) };
        GcRef{borrow, _gcbox: gcbox}
    }

    /// Borrow the referenced value mutably.
    ///
    /// # Panics
    ///
    /// Panics if the pointer is invalid, if the payload is not a `T`,
    /// or if the value is already borrowed.
    pub fn borrow_mut(&self) -> GcRefMut<T>
    {
        let gcbox = self.weak.upgrade().expect("can't access an invalid Ptr");
        let borrow = RefMut::map(gcbox.value.borrow_mut(), |value| {
            value.as_mut().expect("can't access an invalid Ptr")
                .as_any_mut().downcast_mut::<T>()
                .expect("Ptr was cast to the wrong type")
        });
        // SAFETY: As in borrow; the guard keeps the allocation alive and
        // drops the borrow first.
        let borrow = unsafe { transmute::<RefMut<'_, T>, RefMut<'static, T>>(borrow) };
        GcRefMut{borrow, _gcbox: gcbox}
    }
}

impl<T> fmt::Debug for Ptr<T>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "Ptr({:#x})", self.address())
    }
}

/// Shared borrow of a live heap value, produced by [`Ptr::borrow`].
pub struct GcRef<T: 'static>
{
    // INVARIANT: The borrow points into the allocation below.
    borrow: Ref<'static, T>,
    _gcbox: Rc<GcBox>,
}

impl<T> Deref for GcRef<T>
{
    type Target = T;

    fn deref(&self) -> &T
    {
        &self.borrow
    }
}

/// Mutable borrow of a live heap value, produced by [`Ptr::borrow_mut`].
///
/// Holding one across an allocation is a bug: a collection triggered by
/// the allocation would fail to trace the borrowed box.
pub struct GcRefMut<T: 'static>
{
    // INVARIANT: The borrow points into the allocation below.
    borrow: RefMut<'static, T>,
    _gcbox: Rc<GcBox>,
}

impl<T> Deref for GcRefMut<T>
{
    type Target = T;

    fn deref(&self) -> &T
    {
        &self.borrow
    }
}

impl<T> DerefMut for GcRefMut<T>
{
    fn deref_mut(&mut self) -> &mut T
    {
        &mut self.borrow
    }
}

/* -------------------------------------------------------------------------- */
/*                                    Roots                                   */
/* -------------------------------------------------------------------------- */

trait DynRoot
{
    fn trace_root(&self, tracer: &mut Tracer);
}

struct RootCell<T>
{
    value: RefCell<T>,
}

impl<T: Trace> DynRoot for RootCell<T>
{
    fn trace_root(&self, tracer: &mut Tracer)
    {
        self.value.borrow().trace(tracer);
    }
}

type RootTable = RefCell<HashMap<u64, Rc<dyn DynRoot>>>;

/// Scoped strong anchor registered with the collector.
///
/// Mark phases start from every live root, so the contained value and
/// everything reachable from it survive collection. The registration is
/// released when the root is dropped.
pub struct Root<T: Trace + 'static>
{
    cell: Rc<RootCell<T>>,
    table: Rc<RootTable>,
    key: u64,
}

impl<T: Trace + 'static> Root<T>
{
    /// Clone the rooted value out.
    pub fn get(&self) -> T
        where T: Clone
    {
        self.cell.value.borrow().clone()
    }

    /// Replace the rooted value.
    pub fn set(&self, value: T)
    {
        *self.cell.value.borrow_mut() = value;
    }

    /// Borrow the rooted value.
    pub fn borrow(&self) -> Ref<T>
    {
        self.cell.value.borrow()
    }

    /// Borrow the rooted value mutably.
    pub fn borrow_mut(&self) -> RefMut<T>
    {
        self.cell.value.borrow_mut()
    }
}

impl<T: Trace + 'static> Drop for Root<T>
{
    fn drop(&mut self)
    {
        let mut table = self.table.borrow_mut();
        table.remove(&self.key);
    }
}

impl<T: Trace + 'static + fmt::Debug> fmt::Debug for Root<T>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Root").field("value", &*self.cell.value.borrow()).finish()
    }
}

/* -------------------------------------------------------------------------- */
/*                                  Collector                                 */
/* -------------------------------------------------------------------------- */

/// The garbage collector.
///
/// Owns every box allocated through it. Collection is triggered
/// explicitly with [`collect`][`Self::collect`] or implicitly by
/// [`alloc`][`Self::alloc`] once enough allocations have accumulated.
pub struct Collector
{
    boxes: RefCell<Vec<Rc<GcBox>>>,
    roots: Rc<RootTable>,
    next_root: Cell<u64>,
    allocations: Cell<usize>,
    threshold: Cell<usize>,
}

impl Collector
{
    /// Create an empty collector.
    pub fn new() -> Self
    {
        Self{
            boxes: RefCell::new(Vec::new()),
            roots: Rc::new(RefCell::new(HashMap::new())),
            next_root: Cell::new(0),
            allocations: Cell::new(0),
            threshold: Cell::new(MIN_THRESHOLD),
        }
    }

    /// Allocate a collector-managed value.
    ///
    /// The returned pointer comes back already rooted. When the number
    /// of live allocations has reached the current threshold, the
    /// allocation runs a collection cycle (with the new value rooted,
    /// so it always survives) and doubles the threshold, with a floor
    /// of 128.
    pub fn alloc<T: Trace + 'static>(&self, value: T) -> Root<Ptr<T>>
    {
        let collect_now = self.allocations.get() >= self.threshold.get();
        let gcbox = Rc::new(GcBox{
            marked: Cell::new(false),
            value: RefCell::new(Some(Box::new(value))),
        });
        let ptr = Ptr{weak: Rc::downgrade(&gcbox), marker: PhantomData};
        self.boxes.borrow_mut().push(gcbox);
        self.allocations.set(self.allocations.get() + 1);
        let root = self.root(ptr);
        if collect_now {
            self.collect();
            self.threshold.set((self.allocations.get() * 2).max(MIN_THRESHOLD));
        }
        root
    }

    /// Root a value.
    pub fn root<T: Trace + 'static>(&self, value: T) -> Root<T>
    {
        let key = self.next_root.get();
        self.next_root.set(key + 1);
        let cell = Rc::new(RootCell{value: RefCell::new(value)});
        self.roots.borrow_mut().insert(key, cell.clone());
        Root{cell, table: self.roots.clone(), key}
    }

    /// Number of live boxes.
    pub fn allocations(&self) -> usize
    {
        self.allocations.get()
    }

    /// Run one full mark-and-sweep cycle.
    ///
    /// Unreachable values are destroyed exactly once; their boxes are
    /// released, though the underlying storage lives on while weak
    /// handles to it remain.
    pub fn collect(&self)
    {
        // Mark: start from the roots, drain the work queue.
        let mut tracer = Tracer{queue: Vec::new()};
        for root in self.roots.borrow().values() {
            root.trace_root(&mut tracer);
        }
        while let Some(gcbox) = tracer.queue.pop() {
            if let Some(value) = &*gcbox.value.borrow() {
                value.trace_payload(&mut tracer);
            }
        }
        // Sweep: destroy and release everything unmarked.
        let mut boxes = self.boxes.borrow_mut();
        let before = boxes.len();
        boxes.retain(|gcbox| {
            if gcbox.marked.replace(false) {
                true
            } else {
                gcbox.value.borrow_mut().take();
                false
            }
        });
        let after = boxes.len();
        drop(boxes);
        self.allocations.set(after);
        debug!("collect: swept {} boxes, {} surviving", before - after, after);
    }
}

impl Default for Collector
{
    fn default() -> Self
    {
        Self::new()
    }
}
