//! Bounded pool of duplicated accelerator contexts.
//!
//! Each context is a loaded model instance bound to one compute core (an NPU
//! core, or the single GPU/CPU session). Callers lease a context for exactly
//! one inference call; while leased the context is moved out of its slot, so
//! it can never be handed to a second caller. Leases return their context on
//! drop, which pairs every acquire with one release on every exit path.
//!
//! Shutdown: [`AcceleratorContextPool::close`] wakes every blocked waiter and
//! makes them (and all later acquires) fail with
//! [`SynthesisError::PoolClosed`]. Contexts still leased at that point are
//! returned normally.

use std::{
    ops::{Deref, DerefMut},
    sync::{Condvar, Mutex, MutexGuard},
};

use crate::error::{Result, SynthesisError};

struct PoolState<C> {
    slots: Vec<Option<C>>,
    closed: bool,
}

pub struct AcceleratorContextPool<C> {
    state: Mutex<PoolState<C>>,
    available: Condvar,
    size: usize,
}

impl<C> std::fmt::Debug for AcceleratorContextPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceleratorContextPool")
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}

impl<C> AcceleratorContextPool<C> {
    /// Create `n` contexts with `factory(index)`.
    pub fn initialize<F>(n: usize, mut factory: F) -> Result<Self>
    where
        F: FnMut(usize) -> anyhow::Result<C>,
    {
        if n == 0 {
            return Err(SynthesisError::ResourceInit(
                "accelerator pool needs at least one context".into(),
            ));
        }
        let contexts = (0..n)
            .map(|i| {
                factory(i).map_err(|e| {
                    SynthesisError::ResourceInit(format!("failed to create context {i}: {e:#}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_contexts(contexts)
    }

    pub fn from_contexts(contexts: Vec<C>) -> Result<Self> {
        if contexts.is_empty() {
            return Err(SynthesisError::ResourceInit(
                "accelerator pool needs at least one context".into(),
            ));
        }
        let size = contexts.len();
        tracing::debug!(contexts = size, "accelerator context pool ready");
        Ok(Self {
            state: Mutex::new(PoolState {
                slots: contexts.into_iter().map(Some).collect(),
                closed: false,
            }),
            available: Condvar::new(),
            size,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        // Slots are only swapped in and out under the lock, never left half
        // updated, so a poisoned guard still holds a consistent table.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block until a context is free and lease it.
    pub fn acquire(&self) -> Result<ContextLease<'_, C>> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(SynthesisError::PoolClosed);
            }
            if let Some(index) = state.slots.iter().position(Option::is_some) {
                let context = state.slots[index].take();
                return Ok(ContextLease {
                    pool: self,
                    index,
                    context,
                });
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Lease a context without blocking, if one is free.
    pub fn try_acquire(&self) -> Result<Option<ContextLease<'_, C>>> {
        let mut state = self.lock();
        if state.closed {
            return Err(SynthesisError::PoolClosed);
        }
        Ok(state.slots.iter().position(Option::is_some).map(|index| {
            let context = state.slots[index].take();
            ContextLease {
                pool: self,
                index,
                context,
            }
        }))
    }

    /// Return a lease explicitly; equivalent to dropping it.
    pub fn release(&self, lease: ContextLease<'_, C>) {
        debug_assert!(std::ptr::eq(lease.pool, self), "lease released to a foreign pool");
        drop(lease);
    }

    fn give_back(&self, index: usize, context: C) {
        let mut state = self.lock();
        state.slots[index] = Some(context);
        drop(state);
        self.available.notify_one();
    }

    /// Refuse further leases and wake all blocked waiters.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        drop(state);
        self.available.notify_all();
        tracing::debug!("accelerator context pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of contexts currently free.
    pub fn available(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Exclusive use of one context; returns it to the pool on drop.
pub struct ContextLease<'a, C> {
    pool: &'a AcceleratorContextPool<C>,
    index: usize,
    context: Option<C>,
}

impl<C> ContextLease<'_, C> {
    /// Slot index of the leased context (its core binding).
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<C> Deref for ContextLease<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Populated from construction until drop.
        self.context.as_ref().expect("lease holds its context until dropped")
    }
}

impl<C> DerefMut for ContextLease<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.context.as_mut().expect("lease holds its context until dropped")
    }
}

impl<C> Drop for ContextLease<'_, C> {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.pool.give_back(self.index, context);
        }
    }
}
