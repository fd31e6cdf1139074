// Copyright 2018-2026 the Deno authors. MIT license.

use std::alloc::Layout;
use std::ops::Deref;
use std::ops::DerefMut;
use std::ptr::NonNull;
use std::ptr::null_mut;

/// A chunk of binary data that crosses the boundary between the host and the
/// isolate.
///
/// The `alloc_*` fields describe the allocation that must eventually be
/// freed, the `data_*` fields describe the logical window the consumer reads.
/// A window may be narrower than its allocation, which is how a slice of a
/// larger allocation is handed over without copying.
///
/// If `alloc_ptr` is null and `data_ptr` is not, the buffer is borrowed: the
/// holder does not own the memory and has to copy it before keeping it around.
/// If both pointers are null the buffer is "null".
///
/// An owned `DenoBuf` must be handed off with [`DenoBuf::take`] or freed with
/// [`DenoBuf::delete`] before it is dropped. Dropping one that still owns its
/// allocation is a bug and panics in debug builds.
#[repr(C)]
#[derive(Debug)]
pub struct DenoBuf {
  alloc_ptr: *mut u8,
  alloc_len: usize,
  data_ptr: *mut u8,
  data_len: usize,
}

/// `DenoBuf` can not clone, and there is no interior mutability.
/// This type satisfies Send bound.
unsafe impl Send for DenoBuf {}

impl Default for DenoBuf {
  fn default() -> Self {
    Self::null()
  }
}

impl DenoBuf {
  #[inline]
  pub const fn null() -> Self {
    Self {
      alloc_ptr: null_mut(),
      alloc_len: 0,
      data_ptr: null_mut(),
      data_len: 0,
    }
  }

  /// Allocates `len` bytes. The allocation and the logical window are the
  /// same.
  pub fn new(len: usize, zero_init: bool) -> Self {
    let ptr = if len == 0 {
      NonNull::<u8>::dangling().as_ptr()
    } else {
      let layout = byte_layout(len);
      // SAFETY: `layout` has a non-zero size.
      let ptr = unsafe {
        if zero_init {
          std::alloc::alloc_zeroed(layout)
        } else {
          std::alloc::alloc(layout)
        }
      };
      if ptr.is_null() {
        std::alloc::handle_alloc_error(layout);
      }
      ptr
    };
    Self {
      alloc_ptr: ptr,
      alloc_len: len,
      data_ptr: ptr,
      data_len: len,
    }
  }

  /// A borrowed buffer over foreign memory.
  ///
  /// # Safety
  ///
  /// `ptr` must be valid for reads of `len` bytes for as long as the returned
  /// value is used.
  #[inline]
  pub unsafe fn from_raw_parts(ptr: *const u8, len: usize) -> Self {
    Self {
      alloc_ptr: null_mut(),
      alloc_len: 0,
      data_ptr: ptr as *mut u8,
      data_len: len,
    }
  }

  /// A borrowed buffer over `x`.
  ///
  /// # Safety
  ///
  /// `x` must stay alive and unchanged for as long as the returned value, or
  /// whoever it is handed to, reads it. A buffer returned from a
  /// [`ReceiveHandler`](crate::ReceiveHandler) is read after the handler
  /// returned, so its memory must outlive the handler call.
  #[inline]
  pub unsafe fn from_slice(x: &[u8]) -> Self {
    unsafe { Self::from_raw_parts(x.as_ptr(), x.len()) }
  }

  /// An owned buffer over an allocation made by [`DenoBuf::new`] (or handed
  /// back by an export), with a logical window inside of it.
  ///
  /// # Safety
  ///
  /// `alloc_ptr` / `alloc_len` must describe an allocation this crate made
  /// and that nobody else owns. The window must lie inside the allocation.
  pub unsafe fn from_raw_parts_owned(
    alloc_ptr: *mut u8,
    alloc_len: usize,
    data_ptr: *mut u8,
    data_len: usize,
  ) -> Self {
    debug_assert!(data_ptr as usize >= alloc_ptr as usize);
    debug_assert!(
      data_ptr as usize + data_len <= alloc_ptr as usize + alloc_len
    );
    Self {
      alloc_ptr,
      alloc_len,
      data_ptr,
      data_len,
    }
  }

  /// Frees the allocation, if any, and resets every field. Calling it on a
  /// borrowed or null buffer only resets the fields.
  pub fn delete(&mut self) {
    if !self.alloc_ptr.is_null() && self.alloc_len > 0 {
      // SAFETY: owned buffers are always allocated with `byte_layout`.
      unsafe { std::alloc::dealloc(self.alloc_ptr, byte_layout(self.alloc_len)) };
    }
    self.forget();
  }

  /// Moves the fields into a new value and leaves `self` null. Nothing is
  /// allocated or freed.
  #[inline]
  #[must_use]
  pub fn take(&mut self) -> Self {
    std::mem::take(self)
  }

  /// Hands out the raw fields and leaves `self` null without freeing.
  #[inline]
  pub(crate) fn into_raw_parts(mut self) -> (*mut u8, usize, *mut u8, usize) {
    let parts = (self.alloc_ptr, self.alloc_len, self.data_ptr, self.data_len);
    self.forget();
    parts
  }

  #[inline]
  fn forget(&mut self) {
    self.alloc_ptr = null_mut();
    self.alloc_len = 0;
    self.data_ptr = null_mut();
    self.data_len = 0;
  }

  #[inline]
  pub fn is_null(&self) -> bool {
    self.alloc_ptr.is_null() && self.data_ptr.is_null()
  }

  #[inline]
  pub fn is_borrowed(&self) -> bool {
    self.alloc_ptr.is_null() && !self.data_ptr.is_null()
  }

  #[inline]
  pub fn alloc_ptr(&self) -> *mut u8 {
    self.alloc_ptr
  }

  #[inline]
  pub fn alloc_len(&self) -> usize {
    self.alloc_len
  }

  #[inline]
  pub fn data_ptr(&self) -> *mut u8 {
    self.data_ptr
  }

  #[inline]
  pub fn data_len(&self) -> usize {
    self.data_len
  }

  /// Offset of the logical window inside the allocation.
  #[inline]
  pub fn data_offset(&self) -> usize {
    if self.alloc_ptr.is_null() {
      0
    } else {
      self.data_ptr as usize - self.alloc_ptr as usize
    }
  }
}

pub(crate) fn byte_layout(len: usize) -> Layout {
  // A byte array layout can only fail for lengths above isize::MAX, which no
  // allocation can have.
  Layout::array::<u8>(len).unwrap_or_else(|_| {
    panic!("buffer length {len} exceeds the maximum allocation size")
  })
}

/// Frees memory that was allocated through [`DenoBuf::new`].
///
/// # Safety
///
/// `ptr` / `len` must describe a live allocation made by this crate.
pub(crate) unsafe fn free_alloc(ptr: *mut u8, len: usize) {
  if !ptr.is_null() && len > 0 {
    unsafe { std::alloc::dealloc(ptr, byte_layout(len)) };
  }
}

impl Drop for DenoBuf {
  fn drop(&mut self) {
    if self.alloc_ptr.is_null() {
      return;
    }
    if cfg!(debug_assertions) && !std::thread::panicking() {
      panic!(
        "DenoBuf dropped while still owning {} bytes; call delete() or take()",
        self.alloc_len
      );
    }
    self.delete();
  }
}

impl From<Vec<u8>> for DenoBuf {
  fn from(vec: Vec<u8>) -> Self {
    Self::from(vec.into_boxed_slice())
  }
}

impl From<Box<[u8]>> for DenoBuf {
  fn from(boxed: Box<[u8]>) -> Self {
    let mut buf = Self::new(boxed.len(), false);
    buf.copy_from_slice(&boxed);
    buf
  }
}

impl Deref for DenoBuf {
  type Target = [u8];
  #[inline]
  fn deref(&self) -> &[u8] {
    if self.data_ptr.is_null() {
      return &[];
    }
    // SAFETY: a non-null window is valid for `data_len` bytes.
    unsafe { std::slice::from_raw_parts(self.data_ptr, self.data_len) }
  }
}

impl DerefMut for DenoBuf {
  #[inline]
  fn deref_mut(&mut self) -> &mut [u8] {
    if self.alloc_ptr.is_null() {
      panic!("Can't modify the buf");
    }
    // SAFETY: owned buffers are uniquely owned by `self`.
    unsafe { std::slice::from_raw_parts_mut(self.data_ptr, self.data_len) }
  }
}

impl AsRef<[u8]> for DenoBuf {
  #[inline]
  fn as_ref(&self) -> &[u8] {
    self
  }
}
