// Copyright 2018-2026 the Deno authors. MIT license.

//! Moves [`DenoBuf`]s into V8 as `Uint8Array`s and back out again.
//!
//! Borrowed buffers are copied. Copies of up to [`SCRATCH_BUF_SIZE`] bytes go
//! through a single scratch backing store that is reused by every import, so
//! the receiving script must consume (or copy) the view before the next import
//! happens. Every scratch import detaches the previous scratch `ArrayBuffer`,
//! which makes a stale view read as empty instead of showing the newer bytes.
//!
//! Owned buffers are handed to V8 without copying. Their allocation is adopted
//! by the isolate's [`BufferArena`] and given back by [`export`].

use std::ffi::c_void;
use std::ops::Deref;
use std::ops::DerefMut;
use std::ops::Range;

use crate::arena::ArenaHandle;
use crate::arena::ArenaPin;
use crate::arena::BufferArena;
use crate::arena::RelinquishError;
use crate::arena::backing_store_deleter;
use crate::buf::DenoBuf;
use crate::error::ExportError;

pub const SCRATCH_BUF_SIZE: usize = 1024;

const ARENA_HANDLE_KEY: &str = "deno::arena_handle";

#[derive(Default)]
pub struct Bridge {
  pub(crate) arena: BufferArena,
  scratch: Option<v8::SharedRef<v8::BackingStore>>,
  scratch_ab: Option<v8::Global<v8::ArrayBuffer>>,
}

impl Bridge {
  pub fn arena(&self) -> &BufferArena {
    &self.arena
  }

  fn import_scratch<'s, 'i>(
    &mut self,
    scope: &mut v8::PinScope<'s, 'i>,
    bytes: &[u8],
  ) -> Option<v8::Local<'s, v8::Uint8Array>> {
    debug_assert!(bytes.len() <= SCRATCH_BUF_SIZE);

    // Whoever still holds the previous view sees an empty buffer from now on.
    if let Some(prev) = self.scratch_ab.take() {
      let prev = v8::Local::new(scope, &prev);
      prev.detach(None);
    }

    let store = match &self.scratch {
      Some(store) => store.clone(),
      None => {
        let store =
          v8::ArrayBuffer::new_backing_store(scope, SCRATCH_BUF_SIZE)
            .make_shared();
        self.scratch = Some(store.clone());
        store
      }
    };
    if let Some(dst) = store.data() {
      // SAFETY: the scratch store is SCRATCH_BUF_SIZE bytes long and nothing
      // else reads it once the previous ArrayBuffer is detached.
      unsafe {
        std::ptr::copy_nonoverlapping(
          bytes.as_ptr(),
          dst.as_ptr() as *mut u8,
          bytes.len(),
        );
      }
    }

    let ab = v8::ArrayBuffer::with_backing_store(scope, &store);
    self.scratch_ab = Some(v8::Global::new(scope, ab));
    v8::Uint8Array::new(scope, ab, 0, bytes.len())
  }

  fn import_owned<'s, 'i>(
    &mut self,
    scope: &mut v8::PinScope<'s, 'i>,
    buf: DenoBuf,
  ) -> Option<v8::Local<'s, v8::Uint8Array>> {
    let offset = buf.data_offset();
    let (alloc_ptr, alloc_len, _, data_len) = buf.into_raw_parts();
    if alloc_len == 0 {
      let ab = v8::ArrayBuffer::new(scope, 0);
      return v8::Uint8Array::new(scope, ab, 0, 0);
    }

    let handle = self.arena.adopt(alloc_ptr, alloc_len);
    // SAFETY: the arena owns the allocation until the deleter releases it.
    let store = unsafe {
      v8::ArrayBuffer::new_backing_store_from_ptr(
        alloc_ptr as *mut c_void,
        alloc_len,
        backing_store_deleter,
        self.arena.deleter_data(handle),
      )
    }
    .make_shared();
    let ab = v8::ArrayBuffer::with_backing_store(scope, &store);
    let key = arena_key(scope);
    let tag = v8::BigInt::new_from_u64(scope, handle.as_u64());
    ab.set_private(scope, key, tag.into());
    v8::Uint8Array::new(scope, ab, offset, data_len)
  }

  /// Wraps the isolate's shared buffer without copying. Borrowed memory stays
  /// with the host; owned memory is adopted like any other owned import.
  pub(crate) fn shared_array_buffer<'s, 'i>(
    &mut self,
    scope: &mut v8::PinScope<'s, 'i>,
    buf: DenoBuf,
  ) -> v8::Local<'s, v8::ArrayBuffer> {
    if buf.data_len() == 0 {
      let mut buf = buf;
      buf.delete();
      return v8::ArrayBuffer::new(scope, 0);
    }
    let store = if buf.is_borrowed() {
      let (_, _, data_ptr, data_len) = buf.into_raw_parts();
      // SAFETY: the host keeps shared memory alive for the isolate's lifetime.
      unsafe {
        v8::ArrayBuffer::new_backing_store_from_ptr(
          data_ptr as *mut c_void,
          data_len,
          crate::bindings::nop_deleter,
          std::ptr::null_mut(),
        )
      }
    } else {
      let (alloc_ptr, alloc_len, data_ptr, data_len) = buf.into_raw_parts();
      let handle = self.arena.adopt(alloc_ptr, alloc_len);
      // SAFETY: the arena owns the allocation until the deleter releases it,
      // and the data window lies inside it.
      unsafe {
        v8::ArrayBuffer::new_backing_store_from_ptr(
          data_ptr as *mut c_void,
          data_len,
          backing_store_deleter,
          self.arena.deleter_data(handle),
        )
      }
    }
    .make_shared();
    v8::ArrayBuffer::with_backing_store(scope, &store)
  }
}

fn arena_key<'s, 'i>(
  scope: &mut v8::PinScope<'s, 'i>,
) -> v8::Local<'s, v8::Private> {
  let name = v8::String::new(scope, ARENA_HANDLE_KEY);
  v8::Private::for_api(scope, name)
}

fn arena_handle_of(
  scope: &mut v8::PinScope,
  ab: v8::Local<v8::ArrayBuffer>,
) -> Option<ArenaHandle> {
  let key = arena_key(scope);
  let value = ab.get_private(scope, key)?;
  let tag = v8::Local::<v8::BigInt>::try_from(value).ok()?;
  Some(ArenaHandle::from_u64(tag.u64_value().0))
}

/// Produces a `Uint8Array` over `buf`'s logical window. A null buffer becomes
/// `undefined`.
///
/// Small borrowed buffers land in the scratch store; see the module docs for
/// the lifetime rules that come with it.
pub fn import<'s, 'i>(
  scope: &mut v8::PinScope<'s, 'i>,
  bridge: &mut Bridge,
  buf: DenoBuf,
) -> Option<v8::Local<'s, v8::Value>> {
  if buf.is_null() {
    return Some(v8::undefined(scope).into());
  }
  let view = if buf.is_borrowed() {
    if buf.data_len() <= SCRATCH_BUF_SIZE {
      bridge.import_scratch(scope, &buf)
    } else {
      let store =
        v8::ArrayBuffer::new_backing_store_from_vec(buf.to_vec()).make_shared();
      let ab = v8::ArrayBuffer::with_backing_store(scope, &store);
      v8::Uint8Array::new(scope, ab, 0, buf.data_len())
    }
  } else {
    bridge.import_owned(scope, buf)
  };
  view.map(Into::into)
}

/// Moves the contents of `view` to the host and detaches its `ArrayBuffer`.
///
/// Memory that came from [`import`] of an owned buffer is handed back as is,
/// so the allocation window matches the imported buffer. Any other memory is
/// copied into a fresh allocation.
pub fn export(
  scope: &mut v8::PinScope,
  arena: &BufferArena,
  view: v8::Local<v8::ArrayBufferView>,
) -> Result<DenoBuf, ExportError> {
  let ab = view.buffer(scope).ok_or(ExportError::NoBuffer)?;
  if ab.was_detached() {
    return Err(ExportError::Detached);
  }
  if !ab.is_detachable() {
    return Err(ExportError::NotDetachable);
  }
  let offset = view.byte_offset();
  let len = view.byte_length();

  let Some(handle) = arena_handle_of(scope, ab) else {
    let mut buf = DenoBuf::new(len, false);
    view.copy_contents(&mut buf);
    ab.detach(None);
    return Ok(buf);
  };

  // Keep the store alive across the detach so the deleter runs after the
  // allocation is marked as relinquished.
  let store = ab.get_backing_store();
  let (alloc_ptr, alloc_len) =
    arena.relinquish(handle).map_err(|e| match e {
      RelinquishError::Pinned(n) => ExportError::Pinned(n),
      RelinquishError::UnknownHandle => ExportError::Detached,
    })?;
  ab.detach(None);
  drop(store);
  // SAFETY: the arena gave up ownership and the view lies inside the
  // allocation it was created over.
  Ok(unsafe {
    DenoBuf::from_raw_parts_owned(
      alloc_ptr,
      alloc_len,
      alloc_ptr.add(offset),
      len,
    )
  })
}

/// A host side reference to the bytes behind an `ArrayBufferView`.
///
/// The memory stays valid for as long as the `PinnedBuf` lives, even if
/// script drops or detaches the view. Zero-copy memory imported from the host
/// is additionally pinned in the arena, so it can not be exported while the
/// `PinnedBuf` exists.
pub struct PinnedBuf {
  store: v8::SharedRef<v8::BackingStore>,
  range: Range<usize>,
  _pin: Option<ArenaPin>,
}

unsafe impl Send for PinnedBuf {}

impl PinnedBuf {
  pub(crate) fn new(
    scope: &mut v8::PinScope,
    arena: &BufferArena,
    view: v8::Local<v8::ArrayBufferView>,
  ) -> Option<Self> {
    let ab = view.buffer(scope)?;
    let offset = view.byte_offset();
    let range = offset..offset + view.byte_length();
    let store = ab.get_backing_store();
    let pin = arena_handle_of(scope, ab).and_then(|h| arena.retain(h));
    Some(Self {
      store,
      range,
      _pin: pin,
    })
  }

  /// Copies the bytes into a `bytes::Bytes`.
  pub fn to_bytes(&self) -> bytes::Bytes {
    bytes::Bytes::copy_from_slice(self)
  }

  fn as_slice(&self) -> &[u8] {
    if self.range.is_empty() || self.store.data().is_none() {
      return &[];
    }
    // SAFETY: v8::SharedRef<v8::BackingStore> is similar to Arc<[u8]>,
    // it points to a fixed continuous slice of bytes on the heap.
    unsafe { &*(&self.store[self.range.clone()] as *const _ as *const [u8]) }
  }

  fn as_slice_mut(&mut self) -> &mut [u8] {
    if self.range.is_empty() || self.store.data().is_none() {
      return &mut [];
    }
    // SAFETY: see `as_slice`. The bytes are treated as an opaque bag and
    // script can not run while the host holds `&mut self`.
    #[allow(invalid_reference_casting)]
    unsafe {
      &mut *(&self.store[self.range.clone()] as *const _ as *mut [u8])
    }
  }
}

impl Deref for PinnedBuf {
  type Target = [u8];
  fn deref(&self) -> &[u8] {
    self.as_slice()
  }
}

impl DerefMut for PinnedBuf {
  fn deref_mut(&mut self) -> &mut [u8] {
    self.as_slice_mut()
  }
}

impl AsRef<[u8]> for PinnedBuf {
  fn as_ref(&self) -> &[u8] {
    self.as_slice()
  }
}
