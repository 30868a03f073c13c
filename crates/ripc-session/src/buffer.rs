//! Output buffer pool.
//!
//! Each channel owns a pool of `guaranteed` output buffers; beyond those it
//! may borrow from a per-worker shared budget. Handles are move-only
//! (index + generation): a buffer is either consumed by a successful write
//! or released back exactly once, and a stale handle can never reach live
//! data again.

use std::sync::{Arc, Mutex};

use bytes::BytesMut;

/// Per-worker shared overflow budget, counted in buffers.
///
/// The lock is held only for the counter mutation; this is the only
/// cross-channel shared state besides the accept hand-off queue.
#[derive(Debug, Clone)]
pub struct SharedBudget {
    remaining: Arc<Mutex<usize>>,
}

impl SharedBudget {
    pub fn new(buffers: usize) -> Self {
        Self {
            remaining: Arc::new(Mutex::new(buffers)),
        }
    }

    fn take(&self) -> bool {
        let mut remaining = self.remaining.lock().expect("shared budget poisoned");
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }

    fn put_back(&self) {
        let mut remaining = self.remaining.lock().expect("shared budget poisoned");
        *remaining += 1;
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.lock().expect("shared budget poisoned")
    }
}

impl Default for SharedBudget {
    fn default() -> Self {
        // Standalone channels (not attached to a worker) get a small
        // overflow allowance of their own.
        Self::new(8)
    }
}

/// A move-only handle to one pooled output buffer.
///
/// Not `Clone`: ownership is the release discipline. Dropping a handle
/// without returning it leaks the slot until the pool itself is dropped,
/// so every path must either write it or release it.
#[derive(Debug)]
pub struct PoolBuffer {
    index: usize,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    data: BytesMut,
    generation: u32,
    in_use: bool,
    shared: bool,
}

/// Fixed-capacity output buffer pool with a shared overflow budget.
#[derive(Debug)]
pub struct BufferPool {
    slots: Vec<Slot>,
    free: Vec<usize>,
    buffer_size: usize,
    shared: SharedBudget,
}

impl BufferPool {
    pub fn new(guaranteed: usize, buffer_size: usize, shared: SharedBudget) -> Self {
        let mut slots = Vec::with_capacity(guaranteed);
        let mut free = Vec::with_capacity(guaranteed);
        for index in 0..guaranteed {
            slots.push(Slot {
                data: BytesMut::with_capacity(buffer_size),
                generation: 0,
                in_use: false,
                shared: false,
            });
            free.push(index);
        }
        Self {
            slots,
            free,
            buffer_size,
            shared,
        }
    }

    /// Acquire a buffer from the guaranteed set, falling back to the shared
    /// budget. `None` means starvation — the caller decides whether to
    /// flush-and-retry or drop the message.
    pub fn acquire(&mut self) -> Option<PoolBuffer> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.in_use = true;
            slot.data.clear();
            return Some(PoolBuffer {
                index,
                generation: slot.generation,
            });
        }
        if self.shared.take() {
            let index = self.slots.len();
            self.slots.push(Slot {
                data: BytesMut::with_capacity(self.buffer_size),
                generation: 0,
                in_use: true,
                shared: true,
            });
            return Some(PoolBuffer {
                index,
                generation: 0,
            });
        }
        None
    }

    /// Mutable access to a held buffer's bytes.
    ///
    /// Panics on a stale handle; move-only ownership makes that unreachable
    /// from safe callers, so a panic here is a pool-accounting bug.
    pub fn data_mut(&mut self, handle: &PoolBuffer) -> &mut BytesMut {
        let slot = &mut self.slots[handle.index];
        assert!(
            slot.in_use && slot.generation == handle.generation,
            "stale pool buffer handle"
        );
        &mut slot.data
    }

    /// Read access to a held buffer's bytes.
    pub fn data(&self, handle: &PoolBuffer) -> &[u8] {
        let slot = &self.slots[handle.index];
        assert!(
            slot.in_use && slot.generation == handle.generation,
            "stale pool buffer handle"
        );
        &slot.data
    }

    /// Return a buffer to the pool, consuming the handle.
    pub fn release(&mut self, handle: PoolBuffer) {
        let slot = &mut self.slots[handle.index];
        assert!(
            slot.in_use && slot.generation == handle.generation,
            "double release of pool buffer"
        );
        slot.in_use = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.data.clear();
        if slot.shared {
            // Shared slots give their budget token back; the slot itself
            // stays parked and unreachable (never re-enters the free list).
            self.shared.put_back();
        } else {
            self.free.push(handle.index);
        }
    }

    /// Buffers currently available without touching the shared budget.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Buffers currently held by callers.
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        // Give outstanding shared tokens back to the worker budget.
        for slot in &self.slots {
            if slot.shared && slot.in_use {
                self.shared.put_back();
            }
        }
    }
}
