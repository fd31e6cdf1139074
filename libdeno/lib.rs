// Copyright 2018-2026 the Deno authors. MIT license.

//! C bindings for `deno_isolate`, following the classic `deno_*` API.
//!
//! Every entry point takes the isolate's lock, so one isolate can be shared
//! by several host threads. A thread can hold the lock across several calls
//! with `deno_lock` / `deno_unlock`. `deno_terminate_execution` and the
//! `deno_buf_*` helpers do not lock. `user_data` is only used for callbacks
//! made during the call it was passed to.

#![allow(non_camel_case_types)]
#![allow(clippy::missing_safety_doc)]

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::ffi::CStr;
use std::ffi::CString;
use std::ptr::null;
use std::ptr::null_mut;
use std::rc::Rc;
use std::sync::OnceLock;

use anyhow::Context;
use deno_isolate::CoreError;
use deno_isolate::DenoBuf;
use deno_isolate::DynImportId;
use deno_isolate::DynamicImportHandler;
use deno_isolate::Isolate;
use deno_isolate::IsolateConfig;
use deno_isolate::IsolateHandle;
use deno_isolate::IsolateRef;
use deno_isolate::ModuleId;
use deno_isolate::Request;
use deno_isolate::RequestId;
use deno_isolate::ResolveHandler;
use deno_isolate::Snapshot;
use libc::c_char;
use libc::c_int;
use libc::c_void;
use libc::size_t;
use parking_lot::ReentrantMutex;
use parking_lot::ReentrantMutexGuard;

pub type deno_buf = DenoBuf;
pub type deno_mod = ModuleId;
pub type deno_dyn_import_id = DynImportId;

static_assertions::assert_eq_size!(deno_buf, [usize; 4]);
static_assertions::const_assert_eq!(
  std::mem::align_of::<deno_buf>(),
  std::mem::align_of::<usize>()
);

/// Called for every `Deno.core.send`. `control` and `data` are borrowed:
/// `control` is valid until the callback returns, `data` until the request
/// is responded to. Calling `deno_respond` with `req_id` before returning
/// answers synchronously.
pub type deno_recv_cb = unsafe extern "C" fn(
  user_data: *mut c_void,
  req_id: RequestId,
  control: deno_buf,
  data: deno_buf,
);

/// Returns the id of the module `specifier` refers to, or 0. The module may
/// be registered with `deno_mod_new` from inside the callback.
pub type deno_resolve_cb = unsafe extern "C" fn(
  user_data: *mut c_void,
  specifier: *const c_char,
  referrer: *const c_char,
  referrer_id: deno_mod,
) -> deno_mod;

/// Called for every `import()`. Answer it with `deno_dyn_import_done`.
pub type deno_dyn_import_cb = unsafe extern "C" fn(
  user_data: *mut c_void,
  specifier: *const c_char,
  referrer: *const c_char,
  import_id: deno_dyn_import_id,
);

#[repr(C)]
pub struct deno_config {
  pub will_snapshot: c_int,
  /// Copied during `deno_new`, the caller keeps ownership.
  pub load_snapshot: deno_buf,
  /// Borrowed memory must outlive the isolate. Owned memory is taken over.
  pub shared: deno_buf,
  pub recv_cb: Option<deno_recv_cb>,
  pub resolve_cb: Option<deno_resolve_cb>,
  pub dyn_import_cb: Option<deno_dyn_import_cb>,
}

/// Calls that arrived from inside a callback and run once the outer call is
/// done.
enum Deferred {
  Respond(RequestId, DenoBuf),
  DynImportDone(DynImportId, ModuleId),
}

struct CallbackCtx {
  user_data: Cell<*mut c_void>,
  in_call: Cell<bool>,
  current_req: Cell<Option<RequestId>>,
  sync_response: RefCell<Option<DenoBuf>>,
  deferred: RefCell<VecDeque<Deferred>>,
  last_exception: RefCell<Option<CString>>,
  import_specifiers: RefCell<HashMap<(ModuleId, usize), CString>>,
}

impl Drop for CallbackCtx {
  fn drop(&mut self) {
    if let Some(mut buf) = self.sync_response.get_mut().take() {
      buf.delete();
    }
    for deferred in self.deferred.get_mut().drain(..) {
      if let Deferred::Respond(_, mut buf) = deferred {
        buf.delete();
      }
    }
  }
}

/// Opaque to C.
pub struct isolate {
  inner: Option<Isolate>,
  isolate_ref: IsolateRef,
  handle: IsolateHandle,
  ctx: Rc<CallbackCtx>,
  lock: ReentrantMutex<()>,
}

struct CRecv {
  ctx: Rc<CallbackCtx>,
  cb: deno_recv_cb,
}

impl deno_isolate::ReceiveHandler for CRecv {
  fn recv(&mut self, req: Request<'_>) -> Option<DenoBuf> {
    // SAFETY: both views outlive the callback, and `data` stays pinned by
    // the isolate until the request is answered.
    let control = unsafe { DenoBuf::from_slice(req.control) };
    let data = req
      .data
      .as_deref()
      .map(|data| unsafe { DenoBuf::from_slice(data) })
      .unwrap_or_default();
    let prev = self.ctx.current_req.replace(Some(req.id));
    unsafe { (self.cb)(self.ctx.user_data.get(), req.id, control, data) };
    self.ctx.current_req.set(prev);
    self.ctx.sync_response.borrow_mut().take()
  }
}

struct CResolve {
  ctx: Rc<CallbackCtx>,
  cb: deno_resolve_cb,
}

impl ResolveHandler for CResolve {
  fn resolve(
    &mut self,
    specifier: &str,
    referrer: &str,
    referrer_id: ModuleId,
  ) -> ModuleId {
    let (Ok(specifier), Ok(referrer)) =
      (CString::new(specifier), CString::new(referrer))
    else {
      return 0;
    };
    unsafe {
      (self.cb)(
        self.ctx.user_data.get(),
        specifier.as_ptr(),
        referrer.as_ptr(),
        referrer_id,
      )
    }
  }
}

struct CDynImport {
  ctx: Rc<CallbackCtx>,
  cb: deno_dyn_import_cb,
}

impl DynamicImportHandler for CDynImport {
  fn dyn_import(&mut self, id: DynImportId, specifier: &str, referrer: &str) {
    let specifier = CString::new(specifier).unwrap_or_default();
    let referrer = CString::new(referrer).unwrap_or_default();
    unsafe {
      (self.cb)(
        self.ctx.user_data.get(),
        specifier.as_ptr(),
        referrer.as_ptr(),
        id,
      )
    }
  }
}

/// Takes the isolate's lock. It is reentrant, so callbacks may call back
/// into the isolate on the same thread.
unsafe fn lock<'a>(i: *const isolate) -> ReentrantMutexGuard<'a, ()> {
  unsafe { (*i).lock.lock() }
}

unsafe fn ctx_of(i: *const isolate) -> Rc<CallbackCtx> {
  unsafe { (*i).ctx.clone() }
}

/// Borrows the isolate for a call that may run script. The caller holds the
/// lock.
unsafe fn isolate_of<'a>(i: *mut isolate) -> &'a mut Isolate {
  let ctx = unsafe { ctx_of(i) };
  assert!(
    !ctx.in_call.get(),
    "libdeno function called from inside a libdeno callback"
  );
  unsafe { (*i).inner.as_mut() }
    .expect("isolate was consumed by deno_snapshot_new")
}

/// Runs `f` with `user_data` visible to callbacks, then replays every call
/// the callbacks deferred. The whole queue is replayed even if something
/// fails; the error of the last failure is the one `deno_last_exception`
/// reports.
unsafe fn with_isolate<R>(
  i: *mut isolate,
  user_data: *mut c_void,
  f: impl FnOnce(&mut Isolate) -> Result<R, CoreError>,
) -> Result<R, CoreError> {
  let _locker = unsafe { lock(i) };
  let ctx = unsafe { ctx_of(i) };
  let isolate = unsafe { isolate_of(i) };
  ctx.in_call.set(true);
  ctx.user_data.set(user_data);

  let mut result = f(isolate);
  let mut last_error =
    result.as_ref().err().and_then(CoreError::as_js_error).cloned();
  loop {
    let next = ctx.deferred.borrow_mut().pop_front();
    let Some(next) = next else {
      break;
    };
    let replayed = match next {
      Deferred::Respond(req_id, buf) => isolate.respond(req_id, buf),
      Deferred::DynImportDone(import_id, mod_id) => {
        isolate.dyn_import_done(import_id, mod_id)
      }
    };
    if let Err(err) = replayed {
      log::debug!("deferred libdeno call failed: {}", err);
      last_error = err.as_js_error().cloned();
      if result.is_ok() {
        result = Err(err);
      }
    }
  }
  if last_error.is_some() {
    isolate.set_last_exception(last_error);
  }

  ctx.user_data.set(null_mut());
  ctx.in_call.set(false);
  if let Err(err) = &result {
    log::debug!("libdeno call failed: {}", err);
  }
  result
}

/// Borrowed memory is only valid for the duration of the call that handed
/// it over, so it is copied before it is kept.
fn retain(buf: DenoBuf) -> DenoBuf {
  if buf.is_borrowed() {
    DenoBuf::from(buf.to_vec())
  } else {
    buf
  }
}

unsafe fn str_arg<'a>(ptr: *const c_char, what: &str) -> anyhow::Result<&'a str> {
  anyhow::ensure!(!ptr.is_null(), "{} is null", what);
  unsafe { CStr::from_ptr(ptr) }
    .to_str()
    .with_context(|| format!("{what} is not valid UTF-8"))
}

#[unsafe(no_mangle)]
pub extern "C" fn deno_init() {
  deno_isolate::v8_init();
}

#[unsafe(no_mangle)]
pub extern "C" fn deno_v8_version() -> *const c_char {
  static VERSION: OnceLock<CString> = OnceLock::new();
  VERSION
    .get_or_init(|| CString::new(deno_isolate::v8_version()).unwrap_or_default())
    .as_ptr()
}

/// Passes `argv` to V8. Recognized flags are removed: `argv` is compacted
/// in place and `argc` updated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_set_v8_flags(
  argc: *mut c_int,
  argv: *mut *mut c_char,
) {
  let len = unsafe { *argc } as usize;
  let argv = unsafe { std::slice::from_raw_parts_mut(argv, len) };
  let args: Vec<String> = argv
    .iter()
    .map(|&arg| unsafe { CStr::from_ptr(arg) }.to_string_lossy().into_owned())
    .collect();
  let rest = deno_isolate::v8_set_flags(args.clone());

  // Unrecognized arguments come back in their original order.
  let mut rest = rest.into_iter().peekable();
  let mut kept = 0;
  for idx in 0..len {
    if rest.peek() == Some(&args[idx]) {
      rest.next();
      argv[kept] = argv[idx];
      kept += 1;
    }
  }
  unsafe { *argc = kept as c_int };
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_new(config: deno_config) -> *mut isolate {
  let mut config = config;
  let ctx = Rc::new(CallbackCtx {
    user_data: Cell::new(null_mut()),
    in_call: Cell::new(false),
    current_req: Cell::new(None),
    sync_response: RefCell::new(None),
    deferred: RefCell::new(VecDeque::new()),
    last_exception: RefCell::new(None),
    import_specifiers: RefCell::new(HashMap::new()),
  });

  // The caller keeps ownership of the snapshot, only a copy is kept.
  let caller_snapshot = std::mem::ManuallyDrop::new(config.load_snapshot.take());
  let load_snapshot = if caller_snapshot.is_null() {
    None
  } else {
    Some(Snapshot::from(caller_snapshot.to_vec()))
  };
  let isolate_config = IsolateConfig {
    will_snapshot: config.will_snapshot != 0,
    load_snapshot,
    shared: config.shared.take(),
    recv_handler: config.recv_cb.map(|cb| {
      Box::new(CRecv {
        ctx: ctx.clone(),
        cb,
      }) as Box<dyn deno_isolate::ReceiveHandler>
    }),
    resolve_handler: config.resolve_cb.map(|cb| {
      Box::new(CResolve {
        ctx: ctx.clone(),
        cb,
      }) as Box<dyn ResolveHandler>
    }),
    dyn_import_handler: config.dyn_import_cb.map(|cb| {
      Box::new(CDynImport {
        ctx: ctx.clone(),
        cb,
      }) as Box<dyn DynamicImportHandler>
    }),
  };

  match Isolate::new(isolate_config).context("deno_new failed") {
    Ok(mut inner) => {
      let handle = inner.thread_safe_handle();
      let isolate_ref = inner.isolate_ref();
      Box::into_raw(Box::new(isolate {
        inner: Some(inner),
        isolate_ref,
        handle,
        ctx,
        lock: ReentrantMutex::new(()),
      }))
    }
    Err(err) => {
      log::error!("{:#}", err);
      null_mut()
    }
  }
}

/// Also releases a lock taken with `deno_lock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_delete(i: *mut isolate) {
  {
    let _locker = unsafe { lock(i) };
    let ctx = unsafe { ctx_of(i) };
    assert!(!ctx.in_call.get(), "deno_delete called from inside a callback");
  }
  drop(unsafe { Box::from_raw(i) });
}

/// Holds the isolate's lock until `deno_unlock`. Other threads block in
/// their next call meanwhile.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_lock(i: *const isolate) {
  std::mem::forget(unsafe { lock(i) });
}

/// Releases one `deno_lock`. Must be called on the thread that locked.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_unlock(i: *const isolate) {
  let lock = unsafe { &(*i).lock };
  assert!(
    lock.is_owned_by_current_thread(),
    "deno_unlock called by a thread that does not hold the lock"
  );
  // SAFETY: the guard of the matching `deno_lock` was forgotten on this
  // thread.
  unsafe { lock.force_unlock() };
}

/// Returns 1 on success and 0 on failure; see `deno_last_exception`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_execute(
  i: *mut isolate,
  user_data: *mut c_void,
  js_filename: *const c_char,
  js_source: *const c_char,
) -> c_int {
  let (filename, source) = match unsafe {
    (str_arg(js_filename, "js_filename"), str_arg(js_source, "js_source"))
  } {
    (Ok(filename), Ok(source)) => (filename, source),
    (Err(err), _) | (_, Err(err)) => {
      log::error!("deno_execute: {:#}", err);
      return 0;
    }
  };
  let result = unsafe {
    with_isolate(i, user_data, |isolate| isolate.execute(filename, source))
  };
  result.is_ok() as c_int
}

/// Answers a request. Inside `recv_cb` with the request being received this
/// is the synchronous response. Any other call delivers `buf` to the script's
/// `recv` callback; from inside a callback that happens once the outer call
/// is done.
///
/// Returns 0 on success, or when the response was queued, and 1 if the
/// script's `recv` callback threw; see `deno_last_exception`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_respond(
  i: *mut isolate,
  user_data: *mut c_void,
  req_id: RequestId,
  buf: deno_buf,
) -> c_int {
  let _locker = unsafe { lock(i) };
  let ctx = unsafe { ctx_of(i) };
  if ctx.in_call.get() {
    let buf = retain(buf);
    if ctx.current_req.get() == Some(req_id) {
      let mut slot = ctx.sync_response.borrow_mut();
      assert!(slot.is_none(), "deno_respond called twice for {req_id}");
      *slot = Some(buf);
    } else {
      ctx.deferred.borrow_mut().push_back(Deferred::Respond(req_id, buf));
    }
    return 0;
  }
  let result = unsafe {
    with_isolate(i, user_data, |isolate| isolate.respond(req_id, buf))
  };
  result.is_err() as c_int
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_check_promise_errors(i: *mut isolate) {
  let _locker = unsafe { lock(i) };
  let isolate = unsafe { isolate_of(i) };
  let errors = isolate.check_promise_errors();
  if !errors.is_empty() {
    log::debug!("{} unhandled promise rejections", errors.len());
  }
}

/// JSON encoding of the error of the latest call, or null. The string lives
/// until the next call to this function.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_last_exception(
  i: *mut isolate,
) -> *const c_char {
  let _locker = unsafe { lock(i) };
  let ctx = unsafe { ctx_of(i) };
  let mut slot = ctx.last_exception.borrow_mut();
  *slot = unsafe { &(*i).isolate_ref }
    .last_exception()
    .map(|json| CString::new(json).unwrap_or_default());
  slot.as_ref().map_or(null(), |json| json.as_ptr())
}

/// Can be called from any thread, without the lock.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_terminate_execution(i: *const isolate) {
  unsafe { (*i).handle.terminate_execution() };
}

/// Returns 0 on failure; see `deno_last_exception`. Can be called from
/// inside `resolve_cb`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_mod_new(
  i: *mut isolate,
  main: bool,
  name: *const c_char,
  source: *const c_char,
) -> deno_mod {
  let (name, source) =
    match unsafe { (str_arg(name, "name"), str_arg(source, "source")) } {
      (Ok(name), Ok(source)) => (name, source),
      (Err(err), _) | (_, Err(err)) => {
        log::error!("deno_mod_new: {:#}", err);
        return 0;
      }
    };
  let _locker = unsafe { lock(i) };
  match unsafe { &(*i).isolate_ref }.mod_new(main, name, source) {
    Ok(id) => id,
    Err(err) => {
      log::debug!("deno_mod_new failed: {}", err);
      0
    }
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_mod_imports_len(
  i: *mut isolate,
  id: deno_mod,
) -> size_t {
  let _locker = unsafe { lock(i) };
  unsafe { &(*i).isolate_ref }.mod_imports_len(id)
}

/// The string lives as long as the isolate. Out of range indices return
/// null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_mod_imports_get(
  i: *mut isolate,
  id: deno_mod,
  index: size_t,
) -> *const c_char {
  let _locker = unsafe { lock(i) };
  let ctx = unsafe { ctx_of(i) };
  let Some(specifier) =
    unsafe { &(*i).isolate_ref }.mod_imports_get(id, index)
  else {
    return null();
  };
  let mut cache = ctx.import_specifiers.borrow_mut();
  cache
    .entry((id, index))
    .or_insert_with(|| CString::new(specifier).unwrap_or_default())
    .as_ptr()
}

/// Without `resolve_cb` the one from `deno_config` is used, and without
/// that imports are resolved by module name.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_mod_instantiate(
  i: *mut isolate,
  user_data: *mut c_void,
  id: deno_mod,
  resolve_cb: Option<deno_resolve_cb>,
) {
  let _locker = unsafe { lock(i) };
  let ctx = unsafe { ctx_of(i) };
  let mut resolver = resolve_cb.map(|cb| CResolve { ctx, cb });
  let _ = unsafe {
    with_isolate(i, user_data, |isolate| {
      isolate.mod_instantiate(
        id,
        resolver.as_mut().map(|r| r as &mut dyn ResolveHandler),
      )
    })
  };
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_mod_evaluate(
  i: *mut isolate,
  user_data: *mut c_void,
  id: deno_mod,
) {
  let _ =
    unsafe { with_isolate(i, user_data, |isolate| isolate.mod_evaluate(id)) };
}

/// `mod_id` 0 rejects the `import()`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_dyn_import_done(
  i: *mut isolate,
  user_data: *mut c_void,
  import_id: deno_dyn_import_id,
  mod_id: deno_mod,
) {
  let _locker = unsafe { lock(i) };
  let ctx = unsafe { ctx_of(i) };
  if ctx.in_call.get() {
    ctx
      .deferred
      .borrow_mut()
      .push_back(Deferred::DynImportDone(import_id, mod_id));
    return;
  }
  let _ = unsafe {
    with_isolate(i, user_data, |isolate| {
      isolate.dyn_import_done(import_id, mod_id)
    })
  };
}

/// Consumes the isolate's engine state. Only `deno_delete` may be called on
/// `i` afterwards. Returns a null buffer on failure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_snapshot_new(i: *mut isolate) -> deno_buf {
  let _locker = unsafe { lock(i) };
  let ctx = unsafe { ctx_of(i) };
  assert!(!ctx.in_call.get(), "deno_snapshot_new called from a callback");
  let isolate = unsafe { (*i).inner.take() }
    .expect("isolate was consumed by deno_snapshot_new");
  match isolate.snapshot().context("deno_snapshot_new failed") {
    Ok(snapshot) => snapshot,
    Err(err) => {
      log::error!("{:#}", err);
      DenoBuf::null()
    }
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_snapshot_delete(snapshot: *mut deno_buf) {
  unsafe { deno_buf_delete(snapshot) };
}

#[unsafe(no_mangle)]
pub extern "C" fn deno_buf_new(len: size_t, zero_init: bool) -> deno_buf {
  DenoBuf::new(len, zero_init)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_buf_delete(buf: *mut deno_buf) {
  unsafe { (*buf).delete() };
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn deno_buf_move(buf: *mut deno_buf) -> deno_buf {
  unsafe { (*buf).take() }
}
