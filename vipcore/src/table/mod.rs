use crate::errors::VipError;
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
mod tests;

/// Opaque key of a table element. In "database" mode the handle is the dense
/// index itself.
pub(crate) type Handle = u64;

type FreeCallback<T> = Box<dyn Fn(usize, &T) + Send + Sync>;

/// A fixed-capacity, expandable, reference-counted slot table.
///
/// Every element lives in a slot addressed by a dense index that stays valid
/// across expansion. Concurrent users `use` an element (ref_count += 1) and
/// release it through the returned [`TableRef`]. Removal is deferred until the
/// last reference is released, so a slot is never handed out by `insert` while
/// somebody still holds a reference to its previous element.
///
/// Locking is split in three levels, always acquired in this order:
/// 1. `registry`: structural mutation (insert, remove, expand, handle lookup).
/// 2. `slots`: the expand lock. Readers for use/unuse, writer for expansion so
///    a lookup never sees a torn table.
/// 3. `Slot::state`: per-slot lock guarding only the use/unuse protocol.
pub(crate) struct HandleTable<T> {
    name: String,

    registry: Mutex<Registry>,

    slots: RwLock<Vec<Slot<T>>>,

    on_free: Option<FreeCallback<T>>,
}

struct Registry {
    capacity: usize,

    /// Slab keys are the dense indices handed out by the table. The value is
    /// the handle registered for that index.
    keys: Slab<Handle>,

    /// Handle to index lookup, only holding elements that are not marked for
    /// removal.
    handles: BTreeMap<Handle, usize>,

    expansions: usize,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
}

struct SlotState<T> {
    used: bool,
    remove: bool,
    ref_count: u32,
    handle: Handle,

    /// Bumped on every insert so references taken before a forced removal can
    /// be recognised as stale.
    generation: u64,

    element: Option<Arc<T>>,
}

impl<T> Slot<T> {
    fn vacant() -> Self {
        Self {
            state: Mutex::new(SlotState {
                used: false,
                remove: false,
                ref_count: 0,
                handle: 0,
                generation: 0,
                element: None,
            }),
        }
    }
}

impl<T> SlotState<T> {
    fn free(&mut self) -> Option<Arc<T>> {
        self.used = false;
        self.remove = false;
        self.ref_count = 0;
        self.element.take()
    }
}

impl<T> HandleTable<T> {
    pub(crate) fn new(name: impl Into<String>, capacity: usize) -> Result<Self, VipError> {
        let name = name.into();
        if capacity == 0 {
            return Err(VipError::invalid(format!(
                "{}: capacity must be greater than 0",
                name
            )));
        }

        Ok(Self {
            name,
            registry: Mutex::new(Registry {
                capacity,
                keys: Slab::with_capacity(capacity),
                handles: BTreeMap::new(),
                expansions: 0,
            }),
            slots: RwLock::new((0..capacity).map(|_| Slot::vacant()).collect()),
            on_free: None,
        })
    }

    /// Registers a callback invoked with the element when its slot is
    /// physically freed.
    pub(crate) fn with_free_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(usize, &T) + Send + Sync + 'static,
    {
        self.on_free = Some(Box::new(f));
        self
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Inserts an element keyed by its own index. Fails with `OutOfResource`
    /// when every slot is taken; the caller may `expand` and retry.
    pub(crate) fn insert(&self, value: T) -> Result<usize, VipError> {
        self.insert_inner(None, value, false)
    }

    /// Inserts an element under an opaque handle.
    pub(crate) fn insert_handle(&self, handle: Handle, value: T) -> Result<usize, VipError> {
        self.insert_inner(Some(handle), value, false)
    }

    /// Same as `insert`/`insert_handle` but doubles the capacity instead of
    /// failing when the table is full.
    pub(crate) fn insert_or_expand(
        &self,
        handle: Option<Handle>,
        value: T,
    ) -> Result<usize, VipError> {
        self.insert_inner(handle, value, true)
    }

    fn insert_inner(&self, handle: Option<Handle>, value: T, grow: bool) -> Result<usize, VipError> {
        let mut reg = self.registry.lock();

        if let Some(handle) = handle
            && reg.handles.contains_key(&handle)
        {
            return Err(VipError::invalid(format!(
                "{}: handle {:#x} already registered",
                self.name, handle
            )));
        }

        if reg.keys.len() >= reg.capacity {
            if !grow {
                return Err(VipError::out_of_resource(format!(
                    "{}: all {} slots are in use",
                    self.name, reg.capacity
                )));
            }
            self.expand_locked(&mut reg)?;
        }

        let entry = reg.keys.vacant_entry();
        let index = entry.key();
        let handle = handle.unwrap_or(index as Handle);
        entry.insert(handle);
        reg.handles.insert(handle, index);

        let slots = self.slots.read();
        let mut state = slots[index].state.lock();
        debug_assert!(!state.used && state.ref_count == 0);

        state.used = true;
        state.remove = false;
        state.ref_count = 0;
        state.handle = handle;
        state.generation += 1;
        state.element = Some(Arc::new(value));

        Ok(index)
    }

    /// Doubles the capacity. Indices already handed out stay valid.
    pub(crate) fn expand(&self) -> Result<usize, VipError> {
        let mut reg = self.registry.lock();
        self.expand_locked(&mut reg)
    }

    fn expand_locked(&self, reg: &mut Registry) -> Result<usize, VipError> {
        let new_capacity = reg.capacity.checked_mul(2).ok_or_else(|| {
            VipError::out_of_resource(format!("{}: capacity overflow", self.name))
        })?;

        let mut slots = self.slots.write();
        slots.extend((reg.capacity..new_capacity).map(|_| Slot::vacant()));

        reg.keys.reserve(new_capacity - reg.keys.len());
        reg.capacity = new_capacity;
        reg.expansions += 1;

        debug!(table = %self.name, capacity = new_capacity, "expanded handle table");
        Ok(new_capacity)
    }

    /// Takes a reference on the element at `index`. Fails if the slot is free
    /// or marked for removal.
    pub(crate) fn use_index(&self, index: usize) -> Result<TableRef<'_, T>, VipError> {
        self.use_inner(index, None)
    }

    /// Takes a reference on the element registered under `handle`.
    pub(crate) fn use_handle(&self, handle: Handle) -> Result<TableRef<'_, T>, VipError> {
        let index = self.index_of(handle)?;

        // The slot may have been recycled between the lookup and the use, so
        // the handle is checked again under the slot lock.
        self.use_inner(index, Some(handle))
    }

    fn use_inner(&self, index: usize, handle: Option<Handle>) -> Result<TableRef<'_, T>, VipError> {
        let slots = self.slots.read();
        let slot = slots.get(index).ok_or_else(|| {
            VipError::invalid(format!("{}: index {} out of range", self.name, index))
        })?;

        let mut state = slot.state.lock();
        let matches = handle.is_none_or(|h| h == state.handle);

        let element = match &state.element {
            Some(element) if state.used && !state.remove && matches => Arc::clone(element),
            _ => {
                return Err(VipError::invalid(format!(
                    "{}: index {} is not in use",
                    self.name, index
                )));
            }
        };

        state.ref_count += 1;

        Ok(TableRef {
            table: self,
            index,
            generation: state.generation,
            element,
            released: false,
        })
    }

    fn unuse(&self, index: usize, generation: u64, invoke_callback: bool) {
        let freed = {
            let slots = self.slots.read();
            let Some(slot) = slots.get(index) else {
                return;
            };

            let mut state = slot.state.lock();

            // Stale reference, the slot was force-removed (and maybe reused).
            if !state.used || state.generation != generation {
                return;
            }

            debug_assert!(state.ref_count > 0);
            state.ref_count = state.ref_count.saturating_sub(1);

            if state.ref_count == 0 && state.remove {
                state.free()
            } else {
                None
            }
        };

        // Slot lock and expand lock are dropped before touching the registry
        // to respect the lock order.
        if let Some(element) = freed {
            self.registry.lock().keys.try_remove(index);

            if invoke_callback {
                self.notify_free(index, &element);
            }
        }
    }

    /// Marks the element at `index` for removal. It is freed right away when
    /// `force` is set or nobody holds a reference, otherwise on the last
    /// release. Returns whether the slot was freed.
    pub(crate) fn remove_index(&self, index: usize, force: bool) -> Result<bool, VipError> {
        let freed = {
            let mut reg = self.registry.lock();
            let slots = self.slots.read();
            let slot = slots.get(index).ok_or_else(|| {
                VipError::invalid(format!("{}: index {} out of range", self.name, index))
            })?;

            let mut state = slot.state.lock();
            if !state.used {
                return Err(VipError::invalid(format!(
                    "{}: index {} is not in use",
                    self.name, index
                )));
            }

            if !state.remove {
                state.remove = true;
                reg.handles.remove(&state.handle);
            }

            if force || state.ref_count == 0 {
                let element = state.free();
                reg.keys.try_remove(index);
                element
            } else {
                None
            }
        };

        match freed {
            Some(element) => {
                self.notify_free(index, &element);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn remove_handle(&self, handle: Handle, force: bool) -> Result<bool, VipError> {
        let index = self.index_of(handle)?;
        self.remove_index(index, force)
    }

    fn notify_free(&self, index: usize, element: &T) {
        if let Some(on_free) = &self.on_free {
            on_free(index, element);
        }
    }

    pub(crate) fn index_of(&self, handle: Handle) -> Result<usize, VipError> {
        self.registry
            .lock()
            .handles
            .get(&handle)
            .copied()
            .ok_or_else(|| {
                VipError::invalid(format!("{}: handle {:#x} not found", self.name, handle))
            })
    }

    /// Live (not removed) entries as `(index, handle)` pairs, ordered by handle.
    pub(crate) fn snapshot(&self) -> Vec<(usize, Handle)> {
        self.registry
            .lock()
            .handles
            .iter()
            .map(|(handle, index)| (*index, *handle))
            .collect()
    }

    /// Number of occupied slots, including those pending removal.
    pub(crate) fn len(&self) -> usize {
        self.registry.lock().keys.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.registry.lock().capacity
    }

    pub(crate) fn expansions(&self) -> usize {
        self.registry.lock().expansions
    }

    pub(crate) fn ref_count(&self, index: usize) -> Option<u32> {
        let slots = self.slots.read();
        let state = slots.get(index)?.state.lock();
        state.used.then_some(state.ref_count)
    }
}

impl<T> fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = self.registry.lock();
        f.debug_struct("HandleTable")
            .field("name", &self.name)
            .field("len", &reg.keys.len())
            .field("capacity", &reg.capacity)
            .field("expansions", &reg.expansions)
            .finish()
    }
}

/// A counted reference on a table element. Dropping it releases the reference
/// and runs the free callback if the element was pending removal.
pub(crate) struct TableRef<'a, T> {
    table: &'a HandleTable<T>,
    index: usize,
    generation: u64,
    element: Arc<T>,
    released: bool,
}

impl<T> TableRef<'_, T> {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Releases the reference, choosing whether a pending removal notifies the
    /// free callback.
    pub(crate) fn release(mut self, invoke_callback: bool) {
        self.released = true;
        self.table.unuse(self.index, self.generation, invoke_callback);
    }
}

impl<T> Deref for TableRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.element
    }
}

impl<T> Drop for TableRef<'_, T> {
    fn drop(&mut self) {
        if !self.released {
            self.table.unuse(self.index, self.generation, true);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for TableRef<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableRef")
            .field("table", &self.table.name)
            .field("index", &self.index)
            .field("element", &self.element)
            .finish()
    }
}
