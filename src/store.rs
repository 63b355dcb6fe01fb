//! Typed shared state cells.
//!
//! The [`StateStore`] is the single source of truth for engine state shared
//! with a hosting client. Each cell holds one typed value; the host may
//! attach a setter per cell to mirror writes into its own reactive state.
//! Writes made before a setter is attached are buffered and flushed, last
//! write wins, the moment the setter arrives. This lets engine code run
//! before any client surface exists.
//!
//! Setters are invoked outside the store lock, so a setter may itself read
//! or write cells without deadlocking.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

type BoxedValue = Box<dyn Any + Send>;
type Setter = Arc<dyn Fn(BoxedValue) + Send + Sync>;

struct CellSlot {
    /// Engine-side mirror of the current value. Starts at the declared
    /// default and tracks every write.
    value: BoxedValue,
    /// Pending write made before any setter was attached.
    buffered: Option<BoxedValue>,
    setter: Option<Setter>,
}

/// Typed handle to one cell. Cheap to clone; carries the key and the value
/// type, nothing else.
pub struct CellHandle<T> {
    key: Arc<str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for CellHandle<T> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            _marker: PhantomData,
        }
    }
}

impl<T> CellHandle<T> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<T> std::fmt::Debug for CellHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CellHandle").field(&self.key).finish()
    }
}

#[derive(Default)]
pub struct StateStore {
    cells: Mutex<HashMap<String, CellSlot>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a cell with its default value and returns a typed handle.
    /// Declaring an existing key again is a no-op that returns a fresh
    /// handle; the first default stands.
    pub fn declare<T: Clone + Send + 'static>(&self, key: &str, default: T) -> CellHandle<T> {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells.entry(key.to_string()).or_insert_with(|| CellSlot {
            value: Box::new(default),
            buffered: None,
            setter: None,
        });
        CellHandle {
            key: Arc::from(key),
            _marker: PhantomData,
        }
    }

    /// Reads the current value of a cell. A buffered pre-attach write is
    /// already the current value from the engine's point of view.
    pub fn get<T: Clone + Send + 'static>(&self, handle: &CellHandle<T>) -> T {
        let cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        let slot = cells
            .get(handle.key())
            .unwrap_or_else(|| panic!("cell '{}' was never declared", handle.key()));
        let boxed = slot.buffered.as_ref().unwrap_or(&slot.value);
        boxed
            .downcast_ref::<T>()
            .unwrap_or_else(|| panic!("cell '{}' read with the wrong type", handle.key()))
            .clone()
    }

    /// Writes a cell. With a setter attached the write goes through it
    /// immediately; otherwise it is buffered until one is attached.
    pub fn set<T: Clone + Send + 'static>(&self, handle: &CellHandle<T>, value: T) {
        let setter = {
            let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
            let slot = cells
                .get_mut(handle.key())
                .unwrap_or_else(|| panic!("cell '{}' was never declared", handle.key()));
            match &slot.setter {
                Some(setter) => {
                    slot.value = Box::new(value.clone());
                    Arc::clone(setter)
                }
                None => {
                    tracing::debug!(cell = handle.key(), "buffering write, no setter attached");
                    slot.buffered = Some(Box::new(value));
                    return;
                }
            }
        };
        setter(Box::new(value));
    }

    /// Read-modify-write in one call. Not atomic against concurrent
    /// writers of the same cell; the engine serializes its own writes.
    pub fn update<T, F>(&self, handle: &CellHandle<T>, f: F)
    where
        T: Clone + Send + 'static,
        F: FnOnce(T) -> T,
    {
        let current = self.get(handle);
        self.set(handle, f(current));
    }

    /// Attaches the host-side setter for a cell, replacing any previous
    /// one. A buffered write is flushed through the new setter at once.
    pub fn attach<T, F>(&self, handle: &CellHandle<T>, setter: F)
    where
        T: Clone + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let wrapped: Setter = Arc::new(move |boxed: BoxedValue| {
            if let Ok(value) = boxed.downcast::<T>() {
                setter(*value);
            }
        });
        let flushed: Option<T> = {
            let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
            let slot = cells
                .get_mut(handle.key())
                .unwrap_or_else(|| panic!("cell '{}' was never declared", handle.key()));
            slot.setter = Some(Arc::clone(&wrapped));
            let flushed = slot
                .buffered
                .take()
                .and_then(|b| b.downcast::<T>().ok().map(|b| *b));
            if let Some(v) = &flushed {
                slot.value = Box::new(v.clone());
            }
            flushed
        };
        if let Some(value) = flushed {
            tracing::debug!(cell = handle.key(), "flushing buffered write");
            wrapped(Box::new(value));
        }
    }

    /// Detaches the setter of a cell. Subsequent writes buffer again.
    pub fn detach<T>(&self, handle: &CellHandle<T>) {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = cells.get_mut(handle.key()) {
            slot.setter = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_get_returns_default() {
        let store = StateStore::new();
        let cell = store.declare("count", 7_u32);
        assert_eq!(store.get(&cell), 7);
    }

    #[test]
    fn test_set_with_setter_attached() {
        let store = StateStore::new();
        let cell = store.declare("count", 0_u32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        store.attach(&cell, move |v: u32| seen2.lock().unwrap().push(v));

        store.set(&cell, 3);
        store.set(&cell, 9);
        assert_eq!(store.get(&cell), 9);
        assert_eq!(*seen.lock().unwrap(), vec![3, 9]);
    }

    #[test]
    fn test_pre_attach_writes_buffer_last_wins() {
        let store = StateStore::new();
        let cell = store.declare("name", String::new());
        store.set(&cell, "first".to_string());
        store.set(&cell, "second".to_string());
        // the buffered write is already visible to reads
        assert_eq!(store.get(&cell), "second");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        store.attach(&cell, move |v: String| seen2.lock().unwrap().push(v));
        // only the last buffered write flushes
        assert_eq!(*seen.lock().unwrap(), vec!["second".to_string()]);
        assert_eq!(store.get(&cell), "second");
    }

    #[test]
    fn test_writes_before_and_after_attach() {
        let store = StateStore::new();
        let cell = store.declare("mode", 0_u8);
        // no setter yet: the write buffers
        store.set(&cell, 1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        store.attach(&cell, move |v: u8| seen2.lock().unwrap().push(v));
        // with a setter: the write goes straight through
        store.set(&cell, 2);

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(store.get(&cell), 2);
    }

    #[test]
    fn test_redeclare_keeps_first_default() {
        let store = StateStore::new();
        let a = store.declare("x", 1_i32);
        store.set(&a, 5);
        let b = store.declare("x", 99_i32);
        assert_eq!(store.get(&b), 5);
    }

    #[test]
    fn test_setter_may_touch_other_cells() {
        let store = Arc::new(StateStore::new());
        let src = store.declare("src", 0_u32);
        let dst = store.declare("dst", 0_u32);
        let calls = Arc::new(AtomicUsize::new(0));

        let store2 = Arc::clone(&store);
        let dst2 = dst.clone();
        let calls2 = Arc::clone(&calls);
        store.attach(&src, move |v: u32| {
            calls2.fetch_add(1, Ordering::SeqCst);
            store2.set(&dst2, v * 2);
        });

        store.set(&src, 21);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(&dst), 42);
    }

    #[test]
    fn test_update() {
        let store = StateStore::new();
        let cell = store.declare("log", Vec::<String>::new());
        store.update(&cell, |mut v| {
            v.push("a".into());
            v
        });
        store.update(&cell, |mut v| {
            v.push("b".into());
            v
        });
        assert_eq!(store.get(&cell), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_detach_buffers_again() {
        let store = StateStore::new();
        let cell = store.declare("n", 0_u32);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        store.attach(&cell, move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        store.set(&cell, 1);
        store.detach(&cell);
        store.set(&cell, 2);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(&cell), 2);
    }
}
