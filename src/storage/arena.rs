//! Byte-budgeted scratch memory accounting.
//!
//! Engines draw transient buffers (accumulator arrays, partition buffers,
//! sort keys) through a [`MemoryArena`]. Every allocation is fallible: it can
//! fail against the arena's byte budget or in the allocator itself, and both
//! surface as an out-of-memory error that callers may recover from by
//! switching strategy. Reservations are released when dropped.
//!
//! An arena attached to a worker pool keeps spare capacity in place while
//! one of the pool's parallel regions is running; it is only handed back to
//! the budget from single-threaded code.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Result, TesseraError};
use crate::pool::RegionFlag;

/// Shared byte budget for transient execution buffers.
#[derive(Debug)]
pub struct MemoryArena {
    /// Budget in bytes (0 = unlimited).
    limit: usize,
    /// Bytes currently reserved.
    in_use: AtomicUsize,
    /// High-water mark of `in_use`.
    peak: AtomicUsize,
    /// Parallel regions of the pool this arena serves, if any.
    regions: Option<RegionFlag>,
}

impl MemoryArena {
    /// Creates an arena with the given budget (0 = unlimited).
    #[must_use]
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            in_use: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            regions: None,
        })
    }

    /// Creates an arena serving the pool whose regions `regions` observes.
    #[must_use]
    pub fn for_pool(limit: usize, regions: RegionFlag) -> Arc<Self> {
        Arc::new(Self {
            limit,
            in_use: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            regions: Some(regions),
        })
    }

    /// Returns true while a parallel region of the attached pool is running.
    #[must_use]
    pub fn in_parallel(&self) -> bool {
        self.regions.as_ref().is_some_and(RegionFlag::is_raised)
    }

    /// Creates an arena without a budget.
    #[must_use]
    pub fn unlimited() -> Arc<Self> {
        Self::new(0)
    }

    /// Returns the budget in bytes (0 = unlimited).
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns the bytes currently reserved.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Returns the largest number of bytes reserved at once.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    fn charge(&self, bytes: usize, context: &'static str) -> Result<()> {
        let mut current = self.in_use.load(Ordering::Relaxed);
        loop {
            let next = current
                .checked_add(bytes)
                .ok_or_else(|| TesseraError::oom(bytes, context))?;
            if self.limit != 0 && next > self.limit {
                return Err(TesseraError::MemoryLimitExceeded {
                    used: next,
                    limit: self.limit,
                });
            }
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::Relaxed);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.in_use.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Reserves `bytes` against the budget.
    pub fn reserve(self: &Arc<Self>, bytes: usize, context: &'static str) -> Result<Reservation> {
        self.charge(bytes, context)?;
        Ok(Reservation {
            arena: Arc::clone(self),
            bytes,
            context,
        })
    }

    /// Allocates a vector of `len` copies of `value`, charged to the budget.
    pub fn alloc<T: Copy>(
        self: &Arc<Self>,
        len: usize,
        value: T,
        context: &'static str,
    ) -> Result<ScratchVec<T>> {
        let bytes = len.saturating_mul(std::mem::size_of::<T>());
        let reservation = self.reserve(bytes, context)?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| TesseraError::oom(bytes, context))?;
        data.resize(len, value);
        Ok(ScratchVec { data, reservation })
    }

    /// Allocates an empty vector with room for `capacity` elements.
    pub fn alloc_with_capacity<T>(
        self: &Arc<Self>,
        capacity: usize,
        context: &'static str,
    ) -> Result<ScratchVec<T>> {
        let bytes = capacity.saturating_mul(std::mem::size_of::<T>());
        let reservation = self.reserve(bytes, context)?;
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| TesseraError::oom(bytes, context))?;
        Ok(ScratchVec { data, reservation })
    }
}

/// Bytes held against an arena until dropped.
#[derive(Debug)]
pub struct Reservation {
    arena: Arc<MemoryArena>,
    bytes: usize,
    context: &'static str,
}

impl Reservation {
    /// Returns the reserved byte count.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Grows the reservation by `extra` bytes.
    pub fn grow(&mut self, extra: usize) -> Result<()> {
        self.arena.charge(extra, self.context)?;
        self.bytes += extra;
        Ok(())
    }

    fn shrink(&mut self, bytes: usize) {
        let bytes = bytes.min(self.bytes);
        self.arena.release(bytes);
        self.bytes -= bytes;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.arena.release(self.bytes);
    }
}

/// A vector whose capacity is charged to a [`MemoryArena`].
#[derive(Debug)]
pub struct ScratchVec<T> {
    data: Vec<T>,
    reservation: Reservation,
}

impl<T> ScratchVec<T> {
    /// Appends an element, doubling the capacity through the arena when full.
    pub fn try_push(&mut self, value: T) -> Result<()> {
        if self.data.len() == self.data.capacity() {
            self.try_grow(self.data.capacity().max(8))?;
        }
        self.data.push(value);
        Ok(())
    }

    /// Appends a slice, growing the capacity geometrically when full.
    pub fn try_extend_from_slice(&mut self, values: &[T]) -> Result<()>
    where
        T: Clone,
    {
        let needed = self.data.len() + values.len();
        if needed > self.data.capacity() {
            let target = needed.max(self.data.capacity() * 2);
            self.try_grow(target - self.data.capacity())?;
        }
        self.data.extend_from_slice(values);
        Ok(())
    }

    /// Resizes to `len`, growing capacity through the arena if needed.
    pub fn try_resize(&mut self, len: usize, value: T) -> Result<()>
    where
        T: Clone,
    {
        if len > self.data.capacity() {
            let target = len.max(self.data.capacity() * 2);
            self.try_grow(target - self.data.capacity())?;
        }
        self.data.resize(len, value);
        Ok(())
    }

    fn try_grow(&mut self, additional: usize) -> Result<()> {
        let bytes = additional.saturating_mul(std::mem::size_of::<T>());
        self.reservation.grow(bytes)?;
        let spare = self.data.capacity() - self.data.len();
        self.data
            .try_reserve_exact(spare + additional)
            .map_err(|_| TesseraError::oom(bytes, self.reservation.context))
    }

    /// Hands spare capacity back to the budget. Does nothing, and returns
    /// false, while the arena's pool is inside a parallel region.
    pub fn shrink_to_fit(&mut self) -> bool {
        if self.reservation.arena.in_parallel() {
            return false;
        }
        let before = self.data.capacity();
        self.data.shrink_to_fit();
        let freed = before.saturating_sub(self.data.capacity());
        self.reservation
            .shrink(freed.saturating_mul(std::mem::size_of::<T>()));
        true
    }

    /// Releases the reservation and returns the plain vector.
    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
}

impl<T> Deref for ScratchVec<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Vec<T> {
        &self.data
    }
}

impl<T> DerefMut for ScratchVec<T> {
    fn deref_mut(&mut self) -> &mut Vec<T> {
        &mut self.data
    }
}
