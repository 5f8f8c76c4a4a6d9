//! Custom waker construction for the generic `TaskInner<T>`.
//!
//! `RawWaker`'s data pointer is a single machine word, which cannot hold a
//! fat pointer like `Arc<dyn RawTask>`. We instead build one vtable per
//! monomorphization of `T`: each instantiation of [`waker_for`] gets its own
//! `static RawWakerVTable` (the compiler guarantees exactly one instance per
//! monomorphization), so the erased `*const ()` can always be interpreted as
//! the concrete `Arc<TaskInner<T>>` it was built from. This is the same
//! technique used by crates such as `async-task`.

use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::task::{RawWaker, RawWakerVTable, Waker};

use crate::task::TaskInner;

/// Builds a zero-allocation [`Waker`] that reschedules `inner` when woken.
pub(crate) fn waker_for<T: Send + 'static>(inner: Arc<TaskInner<T>>) -> Waker {
    let ptr = Arc::into_raw(inner) as *const ();
    unsafe { Waker::from_raw(RawWaker::new(ptr, vtable::<T>())) }
}

fn vtable<T: Send + 'static>() -> &'static RawWakerVTable {
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone::<T>, wake::<T>, wake_by_ref::<T>, drop_fn::<T>);
    &VTABLE
}

unsafe fn clone<T: Send + 'static>(ptr: *const ()) -> RawWaker {
    let arc = ManuallyDrop::new(unsafe { Arc::from_raw(ptr as *const TaskInner<T>) });
    let cloned = Arc::clone(&arc);
    RawWaker::new(Arc::into_raw(cloned) as *const (), vtable::<T>())
}

unsafe fn wake<T: Send + 'static>(ptr: *const ()) {
    let arc = unsafe { Arc::from_raw(ptr as *const TaskInner<T>) };
    arc.reschedule();
}

unsafe fn wake_by_ref<T: Send + 'static>(ptr: *const ()) {
    let arc = ManuallyDrop::new(unsafe { Arc::from_raw(ptr as *const TaskInner<T>) });
    arc.reschedule();
}

unsafe fn drop_fn<T: Send + 'static>(ptr: *const ()) {
    drop(unsafe { Arc::from_raw(ptr as *const TaskInner<T>) });
}
