//! Dual-strength byte buffer used as the unit of data exchange between
//! codec stages.
//!
//! A [`Buffer`] either owns its allocation (*strong*) or wraps an externally
//! owned region (*weak*). Strong buffers grow on append; weak buffers have a
//! fixed capacity and fail any write that would exceed it, because growing
//! could invalidate the wrapped pointer.
//!
//! Ownership release replaces the strength-switching of earlier designs:
//! [`Buffer::into_raw_parts`] hands the raw allocation to the caller
//! explicitly, and [`Buffer::from_raw_parts`] reconstitutes it.
//!
//! # Thread safety
//!
//! `Buffer` is `Send` but not `Sync`: a buffer may move between threads, but
//! producers must not write to one instance from several threads at once.

use std::mem::ManuallyDrop;

use crate::error::BufferError;

// =============================================================================
// Strength
// =============================================================================

/// Ownership relation between a buffer and its backing bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strength {
    /// Wraps access to an externally owned region. Never reallocates.
    Weak,
    /// Owns the allocation; frees it on drop and may grow it.
    Strong,
}

// =============================================================================
// Buffer
// =============================================================================

enum Backing {
    /// Owned storage. The vector is kept fully initialized, so
    /// `vec.len()` is the buffer capacity.
    Owned(Vec<u8>),
    /// Externally owned region of fixed capacity.
    Borrowed { ptr: *mut u8, capacity: usize },
}

/// A byte container with weak (borrow) or strong (own) backing.
pub struct Buffer {
    backing: Backing,
    size: usize,
}

// SAFETY: `Borrowed` backings are only constructed through `wrap_weak` and
// `from_raw_parts`, whose contracts require the region to remain valid and
// unaliased for writes wherever the buffer travels.
unsafe impl Send for Buffer {}

impl Buffer {
    /// Create an empty strong buffer.
    pub fn new() -> Self {
        Buffer {
            backing: Backing::Owned(Vec::new()),
            size: 0,
        }
    }

    /// Create a strong buffer with `capacity` zeroed bytes reserved and a
    /// size of zero.
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            backing: Backing::Owned(vec![0u8; capacity]),
            size: 0,
        }
    }

    /// Create a strong buffer holding a copy of `data`.
    pub fn copy_from(data: &[u8]) -> Self {
        Buffer {
            backing: Backing::Owned(data.to_vec()),
            size: data.len(),
        }
    }

    /// Wrap an externally owned region of `len` valid bytes as a weak buffer.
    ///
    /// # Safety
    ///
    /// The region must remain valid for the lifetime of the buffer (and any
    /// clone of it), on whatever thread the buffer is moved to. If the region
    /// is shared or immutable, no mutating method may be called.
    pub unsafe fn wrap_weak(ptr: *mut u8, len: usize) -> Self {
        Buffer {
            backing: Backing::Borrowed { ptr, capacity: len },
            size: len,
        }
    }

    /// Ownership strength of this buffer.
    pub fn strength(&self) -> Strength {
        match self.backing {
            Backing::Owned(_) => Strength::Strong,
            Backing::Borrowed { .. } => Strength::Weak,
        }
    }

    /// Number of valid bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the buffer holds no valid bytes.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Total writable capacity.
    pub fn capacity(&self) -> usize {
        match &self.backing {
            Backing::Owned(vec) => vec.len(),
            Backing::Borrowed { capacity, .. } => *capacity,
        }
    }

    /// Bytes available past the current size.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.size
    }

    /// The valid bytes.
    pub fn data(&self) -> &[u8] {
        match &self.backing {
            Backing::Owned(vec) => &vec[..self.size],
            // SAFETY: `wrap_weak` guarantees `size` valid bytes at `ptr`.
            Backing::Borrowed { ptr, .. } => unsafe {
                std::slice::from_raw_parts(*ptr, self.size)
            },
        }
    }

    /// The valid bytes, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Owned(vec) => &mut vec[..self.size],
            // SAFETY: see `wrap_weak`; callers of mutating methods attest the
            // wrapped region is writable.
            Backing::Borrowed { ptr, .. } => unsafe {
                std::slice::from_raw_parts_mut(*ptr, self.size)
            },
        }
    }

    /// Reserve `bytes` past the current size and return the newly valid
    /// region for the caller to fill.
    ///
    /// Strong buffers grow as needed (new bytes arrive zeroed); weak buffers
    /// fail when the fixed capacity would be exceeded. Existing content is
    /// always preserved.
    pub fn append(&mut self, bytes: usize) -> Result<&mut [u8], BufferError> {
        let old_size = self.size;
        let new_size = old_size + bytes;
        match &mut self.backing {
            Backing::Owned(vec) => {
                if vec.len() < new_size {
                    let additional = new_size - vec.len();
                    vec.try_reserve(additional)
                        .map_err(|_| BufferError::AllocationFailed { requested: bytes })?;
                    vec.resize(new_size, 0);
                }
                self.size = new_size;
                Ok(&mut vec[old_size..new_size])
            }
            Backing::Borrowed { ptr, capacity } => {
                if new_size > *capacity {
                    return Err(BufferError::WeakCapacityExceeded {
                        requested: bytes,
                        available: *capacity - old_size,
                    });
                }
                self.size = new_size;
                // SAFETY: the region holds `capacity` writable bytes and
                // `new_size <= capacity`.
                Ok(unsafe { std::slice::from_raw_parts_mut(ptr.add(old_size), bytes) })
            }
        }
    }

    /// Append a copy of `data`, growing if strong.
    pub fn append_bytes(&mut self, data: &[u8]) -> Result<(), BufferError> {
        self.append(data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Set the valid byte count without touching content. Fails above the
    /// current capacity.
    pub fn set_size(&mut self, size: usize) -> Result<(), BufferError> {
        let capacity = self.capacity();
        if size > capacity {
            return Err(BufferError::SizeExceedsCapacity { size, capacity });
        }
        self.size = size;
        Ok(())
    }

    /// Release capacity beyond the current size. A no-op for weak buffers,
    /// which never reallocate.
    pub fn shrink_to_fit(&mut self) {
        if let Backing::Owned(vec) = &mut self.backing {
            vec.truncate(self.size);
            vec.shrink_to_fit();
        }
    }

    /// Copy a weak buffer's bytes into a fresh owned allocation, making this
    /// buffer strong. Strong buffers are unchanged.
    pub fn make_strong(&mut self) {
        if let Backing::Borrowed { .. } = self.backing {
            let owned = self.data().to_vec();
            self.backing = Backing::Owned(owned);
        }
    }

    /// Consume the buffer and return `(ptr, size, capacity)`.
    ///
    /// For a strong buffer the caller takes ownership of the allocation and
    /// must eventually pass the parts to [`Buffer::from_raw_parts`] (or an
    /// equivalent `Vec::from_raw_parts`) to release it. For a weak buffer
    /// the parts still belong to the original owner and must not be freed;
    /// check [`Buffer::strength`] first.
    pub fn into_raw_parts(self) -> (*mut u8, usize, usize) {
        let size = self.size;
        match self.backing {
            Backing::Owned(vec) => {
                let mut vec = ManuallyDrop::new(vec);
                (vec.as_mut_ptr(), size, vec.capacity())
            }
            Backing::Borrowed { ptr, capacity } => (ptr, size, capacity),
        }
    }

    /// Reconstitute a strong buffer from parts returned by
    /// [`Buffer::into_raw_parts`] on a strong buffer.
    ///
    /// # Safety
    ///
    /// The parts must originate from `into_raw_parts` of a strong buffer and
    /// must not have been freed or reconstituted already.
    pub unsafe fn from_raw_parts(ptr: *mut u8, size: usize, capacity: usize) -> Self {
        Buffer {
            backing: Backing::Owned(Vec::from_raw_parts(ptr, size, capacity)),
            size,
        }
    }

    /// Consume a strong buffer into its owned bytes. Weak buffers are copied.
    pub fn into_vec(mut self) -> Vec<u8> {
        match self.backing {
            Backing::Owned(ref mut vec) => {
                let mut vec = std::mem::take(vec);
                vec.truncate(self.size);
                vec
            }
            Backing::Borrowed { .. } => self.data().to_vec(),
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Clone for Buffer {
    /// Strong buffers deep-copy; weak buffers produce another weak view of
    /// the same region.
    fn clone(&self) -> Self {
        match &self.backing {
            Backing::Owned(vec) => Buffer {
                backing: Backing::Owned(vec.clone()),
                size: self.size,
            },
            Backing::Borrowed { ptr, capacity } => Buffer {
                backing: Backing::Borrowed {
                    ptr: *ptr,
                    capacity: *capacity,
                },
                size: self.size,
            },
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("strength", &self.strength())
            .field("size", &self.size)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(vec: Vec<u8>) -> Self {
        let size = vec.len();
        Buffer {
            backing: Backing::Owned(vec),
            size,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
