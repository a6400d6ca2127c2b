//! Packet buffer pool
//!
//! Both forwarding directions allocate one buffer per packet on the hot
//! path; a shared free list keyed by the tunnel MTU keeps steady-state
//! allocation bounded. The pool is a free list, not a semaphore: `acquire`
//! never blocks and allocates on miss, and there is no upper bound on how
//! many buffers may be outstanding at once.

use std::sync::Mutex;

/// Fixed-capacity pool of packet buffers.
///
/// Every buffer handed out has length and capacity equal to the pool's
/// configured capacity. Buffers whose capacity no longer matches (for
/// example because a caller grew them) are dropped on release instead of
/// being recycled.
#[derive(Debug)]
pub struct BufferPool {
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create a pool handing out buffers of exactly `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Mutex::new(Vec::new()),
        }
    }

    /// The buffer size this pool was configured with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take a buffer from the free list, allocating a fresh one on miss.
    pub fn acquire(&self) -> Vec<u8> {
        let recycled = self.free.lock().expect("buffer pool poisoned").pop();
        recycled.unwrap_or_else(|| vec![0u8; self.capacity])
    }

    /// Return a buffer to the free list.
    ///
    /// Buffers whose capacity differs from the pool's configured capacity
    /// are discarded; everything else is reset to full length and recycled.
    pub fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() != self.capacity {
            return;
        }
        buf.resize(self.capacity, 0);
        self.free.lock().expect("buffer pool poisoned").push(buf);
    }

    /// Number of buffers currently sitting in the free list.
    pub fn len(&self) -> usize {
        self.free.lock().expect("buffer pool poisoned").len()
    }

    /// True when no buffers are pooled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
