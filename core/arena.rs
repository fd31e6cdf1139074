// Copyright 2018-2026 the Deno authors. MIT license.

//! Reference counted bookkeeping for host allocations that were handed to V8
//! without copying.
//!
//! Each adopted allocation gets an entry with an explicit reference count.
//! The V8 backing store owns one reference and gives it back from its deleter.
//! Host side views of the same memory (see [`crate::bridge::PinnedBuf`]) take
//! extra references, so the memory outlives the `ArrayBuffer` while a request
//! is in flight.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buf::free_alloc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaHandle(u64);

impl ArenaHandle {
  pub fn as_u64(self) -> u64 {
    self.0
  }

  pub fn from_u64(v: u64) -> Self {
    Self(v)
  }
}

struct Allocation {
  ptr: *mut u8,
  len: usize,
  refs: usize,
  relinquished: bool,
}

#[derive(Default)]
struct ArenaInner {
  next_handle: u64,
  entries: HashMap<ArenaHandle, Allocation>,
}

// SAFETY: the raw pointers are only dereferenced by whoever holds a
// reference, and bookkeeping is behind a mutex.
unsafe impl Send for ArenaInner {}

impl Drop for ArenaInner {
  fn drop(&mut self) {
    for (handle, alloc) in self.entries.drain() {
      if !alloc.relinquished {
        log::debug!(
          "freeing arena allocation {:?} with {} live refs",
          handle,
          alloc.refs
        );
        // SAFETY: the arena owns every allocation it has not relinquished.
        unsafe { free_alloc(alloc.ptr, alloc.len) };
      }
    }
  }
}

#[derive(Clone, Default)]
pub struct BufferArena(Arc<Mutex<ArenaInner>>);

#[derive(Debug, PartialEq, Eq)]
pub enum RelinquishError {
  UnknownHandle,
  Pinned(usize),
}

impl BufferArena {
  pub fn new() -> Self {
    Self::default()
  }

  /// Takes ownership of an allocation. The returned handle starts with a
  /// single reference.
  pub fn adopt(&self, ptr: *mut u8, len: usize) -> ArenaHandle {
    let mut inner = self.0.lock();
    inner.next_handle += 1;
    let handle = ArenaHandle(inner.next_handle);
    inner.entries.insert(
      handle,
      Allocation {
        ptr,
        len,
        refs: 1,
        relinquished: false,
      },
    );
    log::trace!("arena adopt {:?} ({} bytes)", handle, len);
    handle
  }

  /// Adds a reference that is dropped together with the returned pin.
  pub fn retain(&self, handle: ArenaHandle) -> Option<ArenaPin> {
    let mut inner = self.0.lock();
    let alloc = inner.entries.get_mut(&handle)?;
    alloc.refs += 1;
    Some(ArenaPin {
      arena: self.clone(),
      handle,
    })
  }

  /// Drops one reference. The memory is freed when the count reaches zero,
  /// unless ownership went back to the host in the meantime.
  pub fn release(&self, handle: ArenaHandle) {
    let mut inner = self.0.lock();
    let Some(alloc) = inner.entries.get_mut(&handle) else {
      panic!("release of unknown arena handle {handle:?}");
    };
    assert!(alloc.refs > 0);
    alloc.refs -= 1;
    if alloc.refs > 0 {
      return;
    }
    let alloc = inner.entries.remove(&handle).unwrap();
    drop(inner);
    if alloc.relinquished {
      log::trace!("arena drop {:?} (owned by host)", handle);
    } else {
      log::trace!("arena free {:?}", handle);
      // SAFETY: the last reference is gone and the host never took it back.
      unsafe { free_alloc(alloc.ptr, alloc.len) };
    }
  }

  /// Gives ownership of the allocation back to the host. Only allowed while
  /// the backing store holds the sole reference.
  pub fn relinquish(
    &self,
    handle: ArenaHandle,
  ) -> Result<(*mut u8, usize), RelinquishError> {
    let mut inner = self.0.lock();
    let alloc = inner
      .entries
      .get_mut(&handle)
      .filter(|a| !a.relinquished)
      .ok_or(RelinquishError::UnknownHandle)?;
    if alloc.refs != 1 {
      return Err(RelinquishError::Pinned(alloc.refs - 1));
    }
    alloc.relinquished = true;
    Ok((alloc.ptr, alloc.len))
  }

  pub fn ref_count(&self, handle: ArenaHandle) -> usize {
    self.0.lock().entries.get(&handle).map_or(0, |a| a.refs)
  }

  pub fn len(&self) -> usize {
    self.0.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Boxed deleter data for [`backing_store_deleter`]. Owns one reference.
  pub(crate) fn deleter_data(&self, handle: ArenaHandle) -> *mut c_void {
    Box::into_raw(Box::new(ArenaRef {
      arena: self.clone(),
      handle,
    })) as *mut c_void
  }
}

/// Extra reference on an arena allocation, released on drop.
pub struct ArenaPin {
  arena: BufferArena,
  handle: ArenaHandle,
}

impl ArenaPin {
  pub fn handle(&self) -> ArenaHandle {
    self.handle
  }
}

impl Drop for ArenaPin {
  fn drop(&mut self) {
    self.arena.release(self.handle);
  }
}

struct ArenaRef {
  arena: BufferArena,
  handle: ArenaHandle,
}

/// Called by V8 when the last `ArrayBuffer` using an adopted allocation goes
/// away.
pub(crate) unsafe extern "C" fn backing_store_deleter(
  _data: *mut c_void,
  _byte_length: usize,
  deleter_data: *mut c_void,
) {
  // SAFETY: `deleter_data` was produced by `BufferArena::deleter_data`.
  let arena_ref = unsafe { Box::from_raw(deleter_data as *mut ArenaRef) };
  arena_ref.arena.release(arena_ref.handle);
}
