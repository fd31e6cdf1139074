// Copyright 2018-2026 the Deno authors. MIT license.

use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use indexmap::IndexMap;

use crate::bindings;
use crate::bridge;
use crate::bridge::Bridge;
use crate::buf::DenoBuf;
use crate::dispatch::Dispatcher;
use crate::dispatch::ReceiveHandler;
use crate::dispatch::RequestId;
use crate::error::CoreError;
use crate::flags::v8_init;
use crate::js_errors::JsError;
use crate::modules::DynImportId;
use crate::modules::DynImportMap;
use crate::modules::DynamicImportHandler;
use crate::modules::ModuleId;
use crate::modules::ModuleMap;
use crate::modules::ResolveHandler;
use crate::snapshot;
use crate::snapshot::SNAPSHOT_FORMAT;
use crate::snapshot::Snapshot;
use crate::snapshot::SnapshotSidecar;

/// Everything needed to create an [`Isolate`].
#[derive(Default)]
pub struct IsolateConfig {
  /// Create a snapshot creator. Such an isolate must be consumed with
  /// [`Isolate::snapshot`], otherwise it is leaked.
  pub will_snapshot: bool,
  /// Startup data made by [`Isolate::snapshot`].
  pub load_snapshot: Option<Snapshot>,
  /// Memory exposed to script as `Deno.core.shared`. Borrowed memory must
  /// outlive the isolate; owned memory is taken over by it.
  pub shared: DenoBuf,
  pub recv_handler: Option<Box<dyn ReceiveHandler>>,
  /// Consulted by `mod_instantiate` when no resolver is passed explicitly.
  pub resolve_handler: Option<Box<dyn ResolveHandler>>,
  pub dyn_import_handler: Option<Box<dyn DynamicImportHandler>>,
}

/// Internal state for Isolate which is stored in one of v8::Isolate's
/// embedder slots.
pub(crate) struct IsolateState {
  pub(crate) global_context: v8::Global<v8::Context>,
  pub(crate) js_recv_cb: Option<v8::Global<v8::Function>>,
  pub(crate) shared: DenoBuf,
  pub(crate) shared_ab: Option<v8::Global<v8::ArrayBuffer>>,
  pub(crate) pending_promise_exceptions:
    IndexMap<v8::Global<v8::Promise>, v8::Global<v8::Value>>,
  pub(crate) last_exception: Option<JsError>,
  pub(crate) bridge: Bridge,
  pub(crate) dispatcher: Dispatcher,
  pub(crate) modules: ModuleMap,
  pub(crate) dyn_imports: DynImportMap,
  /// Resolver lent out by the running `mod_instantiate` call.
  pub(crate) resolver: Option<*mut (dyn ResolveHandler + 'static)>,
  pub(crate) default_resolver: Option<Box<dyn ResolveHandler>>,
  pub(crate) dyn_import_handler: Option<Box<dyn DynamicImportHandler>>,
}

impl IsolateState {
  pub(crate) fn get(isolate: &v8::Isolate) -> Rc<RefCell<IsolateState>> {
    let s = isolate.get_slot::<Rc<RefCell<IsolateState>>>().unwrap();
    s.clone()
  }
}

impl Drop for IsolateState {
  fn drop(&mut self) {
    // Owned shared memory that script never looked at is still ours.
    self.shared.delete();
  }
}

macro_rules! context_scope {
  ($scope: ident, $state: expr, $isolate: expr) => {
    v8::scope!(let $scope, $isolate);
    let context = v8::Local::new($scope, &$state.borrow().global_context);
    let $scope = &mut v8::ContextScope::new($scope, context);
  };
}

macro_rules! caught_exception {
  ($tc_scope: ident) => {
    match $tc_scope.exception() {
      Some(exception) => exception,
      None => v8::null($tc_scope).into(),
    }
  };
}

/// Thread safe handle used to interrupt a running isolate.
#[derive(Clone)]
pub struct IsolateHandle(v8::IsolateHandle);

impl IsolateHandle {
  /// Forcefully stops the script that is currently running. The interrupted
  /// call returns an "execution terminated" error and the isolate stays
  /// usable. Returns false if the isolate is already gone.
  pub fn terminate_execution(&self) -> bool {
    self.0.terminate_execution()
  }
}

/// A handle for the isolate calls that never run script: registering
/// modules, querying their imports and reading the last exception.
///
/// Unlike [`Isolate`] it can be used from inside the handlers the isolate
/// calls, e.g. to register the module a [`ResolveHandler`] is asked for while
/// `mod_instantiate` is running.
///
/// Every method panics once the isolate is dropped or consumed by
/// [`Isolate::snapshot`].
#[derive(Clone)]
pub struct IsolateRef {
  isolate: v8::UnsafeRawIsolatePtr,
  state: Weak<RefCell<IsolateState>>,
}

impl IsolateRef {
  fn state(&self) -> Rc<RefCell<IsolateState>> {
    self.state.upgrade().expect("isolate is gone")
  }

  /// The state is removed from the V8 isolate before the V8 isolate is
  /// disposed, so a live state means a live V8 isolate.
  fn v8_isolate(&self, _state: &Rc<RefCell<IsolateState>>) -> v8::Isolate {
    // SAFETY: see above.
    unsafe { v8::Isolate::from_raw_isolate_ptr(self.isolate) }
  }

  /// Compiles an ES module and registers it under `name`. Registering a
  /// name twice returns the id of the first registration.
  pub fn mod_new(
    &self,
    main: bool,
    name: &str,
    source: &str,
  ) -> Result<ModuleId, CoreError> {
    let state_rc = self.state();
    state_rc.borrow_mut().last_exception = None;
    if let Some(id) = state_rc.borrow().modules.get_id(name) {
      log::debug!("module {} already registered as {}", name, id);
      return Ok(id);
    }
    let mut isolate = self.v8_isolate(&state_rc);
    context_scope!(scope, state_rc, &mut isolate);

    let name_str = v8::String::new(scope, name).unwrap();
    let source_str = v8::String::new(scope, source).unwrap();
    let origin = bindings::module_origin(scope, name_str);
    let mut source = v8::script_compiler::Source::new(source_str, Some(&origin));

    v8::tc_scope!(let tc_scope, scope);

    let Some(module) = v8::script_compiler::compile_module(tc_scope, &mut source)
    else {
      let exception = caught_exception!(tc_scope);
      return exception_to_err_result(tc_scope, exception);
    };

    let requests = module.get_module_requests();
    let mut import_specifiers = Vec::with_capacity(requests.length());
    for i in 0..requests.length() {
      let Some(request) = requests
        .get(tc_scope, i)
        .and_then(|r| v8::Local::<v8::ModuleRequest>::try_from(r).ok())
      else {
        continue;
      };
      let specifier = request.get_specifier();
      import_specifiers.push(specifier.to_rust_string_lossy(tc_scope));
    }

    let hash = module.get_identity_hash().get();
    let handle = v8::Global::new(tc_scope, module);
    let id = state_rc.borrow_mut().modules.register(
      name,
      main,
      handle,
      hash,
      import_specifiers,
    );
    Ok(id)
  }

  pub fn mod_imports_len(&self, id: ModuleId) -> usize {
    self
      .state()
      .borrow()
      .modules
      .get_info(id)
      .map_or(0, |info| info.import_specifiers.len())
  }

  pub fn mod_imports_get(&self, id: ModuleId, index: usize) -> Option<String> {
    self
      .state()
      .borrow()
      .modules
      .get_info(id)
      .and_then(|info| info.import_specifiers.get(index).cloned())
  }

  pub fn mod_get_imports(&self, id: ModuleId) -> Vec<String> {
    self
      .state()
      .borrow()
      .modules
      .get_info(id)
      .map(|info| info.import_specifiers.clone())
      .unwrap_or_default()
  }

  pub fn mod_name(&self, id: ModuleId) -> Option<String> {
    self
      .state()
      .borrow()
      .modules
      .get_info(id)
      .map(|info| info.name.clone())
  }

  /// JSON encoding of the error recorded by the most recent call, if it
  /// failed.
  pub fn last_exception(&self) -> Option<String> {
    self
      .state()
      .borrow()
      .last_exception
      .as_ref()
      .map(JsError::to_json)
  }

  pub fn last_js_error(&self) -> Option<JsError> {
    self.state().borrow().last_exception.clone()
  }
}

/// A single execution context of JavaScript. Corresponds roughly to the "Web
/// Worker" concept in the DOM.
///
/// Ops are created in JavaScript by calling Deno.core.send(), and in Rust
/// by the [`ReceiveHandler`] passed in [`IsolateConfig`]. Requests that are
/// not answered synchronously are answered later with [`Isolate::respond`].
pub struct Isolate {
  // This is an Option<OwnedIsolate> instead of just OwnedIsolate to workaround
  // a safety issue with snapshot creators. See Isolate::drop.
  v8_isolate: Option<v8::OwnedIsolate>,
  will_snapshot: bool,
  // Startup data has to outlive the V8 isolate that was created from it.
  _startup_snapshot: Option<Snapshot>,
}

impl Drop for Isolate {
  fn drop(&mut self) {
    let Some(mut isolate) = self.v8_isolate.take() else {
      return;
    };
    // Release every handle while the isolate is still alive.
    drop(isolate.remove_slot::<Rc<RefCell<IsolateState>>>());
    if self.will_snapshot {
      // V8 refuses to dispose a snapshot creator that never produced a blob.
      log::warn!("v8::OwnedIsolate for snapshot was leaked");
      std::mem::forget(isolate);
    }
  }
}

impl Isolate {
  pub fn new(mut config: IsolateConfig) -> Result<Isolate, CoreError> {
    v8_init();

    // Ownership of `shared` moves to the isolate even when creation fails.
    let shared = scopeguard::guard(config.shared.take(), |mut shared| {
      shared.delete();
    });

    if config.will_snapshot && config.load_snapshot.is_some() {
      return Err(CoreError::SnapshotWhileSnapshotting);
    }

    let layout = bindings::layout_fingerprint();
    let mut startup_snapshot = None;
    let mut sidecar = None;

    let mut isolate = if config.will_snapshot {
      v8::Isolate::snapshot_creator(
        Some(bindings::external_references()),
        Some(v8::CreateParams::default()),
      )
    } else {
      let mut params = v8::CreateParams::default()
        .external_references(bindings::external_references());
      if let Some(snapshot) = config.load_snapshot.take() {
        let (v8_data, data) =
          snapshot::deconstruct::<SnapshotSidecar>(snapshot.as_bytes())?;
        snapshot::check_layout(&data, layout)?;
        let v8_len = v8_data.len();
        let v8_data: &'static [u8] = match &snapshot {
          Snapshot::Static(data) => &(*data)[..v8_len],
          // SAFETY: the box is stored in the Isolate and dropped after the
          // V8 isolate. Moving a Box does not move its contents.
          Snapshot::Boxed(data) => unsafe {
            std::mem::transmute::<&[u8], &'static [u8]>(&data[..v8_len])
          },
        };
        params = params.snapshot_blob(v8::StartupData::from(v8_data));
        startup_snapshot = Some(snapshot);
        sidecar = Some(data);
      }
      v8::Isolate::new(params)
    };
    Isolate::setup_isolate(&mut isolate);

    let (global_context, js_recv_cb) = {
      v8::scope!(let scope, &mut isolate);
      let context = if sidecar.is_some() {
        v8::Context::from_snapshot(scope, 0, Default::default()).ok_or_else(
          || CoreError::InvalidSnapshot("missing context".to_string()),
        )?
      } else {
        bindings::initialize_context(scope)
      };

      let js_recv_cb = match sidecar.as_ref().and_then(|s| s.recv_cb) {
        Some(index) => {
          let scope = &mut v8::ContextScope::new(scope, context);
          let data = scope
            .get_context_data_from_snapshot_once::<v8::Data>(index as usize)
            .ok()
            .and_then(|data| v8::Local::<v8::Function>::try_from(data).ok())
            .ok_or_else(|| {
              CoreError::InvalidSnapshot("missing recv callback".to_string())
            })?;
          Some(v8::Global::new(scope, data))
        }
        None => None,
      };
      (v8::Global::new(scope, context), js_recv_cb)
    };

    isolate.set_slot(Rc::new(RefCell::new(IsolateState {
      global_context,
      js_recv_cb,
      shared: scopeguard::ScopeGuard::into_inner(shared),
      shared_ab: None,
      pending_promise_exceptions: IndexMap::new(),
      last_exception: None,
      bridge: Bridge::default(),
      dispatcher: Dispatcher::new(config.recv_handler.take()),
      modules: ModuleMap::default(),
      dyn_imports: DynImportMap::default(),
      resolver: None,
      default_resolver: config.resolve_handler.take(),
      dyn_import_handler: config.dyn_import_handler.take(),
    })));

    log::debug!(
      "isolate created (will_snapshot: {}, from snapshot: {})",
      config.will_snapshot,
      startup_snapshot.is_some()
    );

    Ok(Self {
      v8_isolate: Some(isolate),
      will_snapshot: config.will_snapshot,
      _startup_snapshot: startup_snapshot,
    })
  }

  fn setup_isolate(isolate: &mut v8::OwnedIsolate) {
    isolate.set_capture_stack_trace_for_uncaught_exceptions(true, 10);
    isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);
    isolate.set_promise_reject_callback(bindings::promise_reject_callback);
    isolate.set_host_import_module_dynamically_callback(
      bindings::host_import_module_dynamically_callback,
    );
    isolate.set_host_initialize_import_meta_object_callback(
      bindings::host_initialize_import_meta_object_callback,
    );
  }

  fn v8_isolate(&mut self) -> &mut v8::OwnedIsolate {
    self.v8_isolate.as_mut().unwrap()
  }

  fn state(&mut self) -> Rc<RefCell<IsolateState>> {
    IsolateState::get(self.v8_isolate())
  }

  /// Starts a call from the host: the error of the previous call is
  /// forgotten.
  fn begin_call(&mut self) -> Rc<RefCell<IsolateState>> {
    let state_rc = self.state();
    state_rc.borrow_mut().last_exception = None;
    state_rc
  }

  pub fn thread_safe_handle(&mut self) -> IsolateHandle {
    IsolateHandle(self.v8_isolate().thread_safe_handle())
  }

  pub fn isolate_ref(&mut self) -> IsolateRef {
    let state = Rc::downgrade(&self.state());
    // SAFETY: the pointer is only turned back into an isolate while `state`
    // is alive, see `IsolateRef::v8_isolate`.
    let isolate = unsafe { self.v8_isolate().as_raw_isolate_ptr() };
    IsolateRef { isolate, state }
  }

  /// Executes traditional JavaScript code (traditional = not ES modules).
  ///
  /// On failure the error is also kept as the last exception.
  pub fn execute(
    &mut self,
    js_filename: &str,
    js_source: &str,
  ) -> Result<(), CoreError> {
    let state_rc = self.begin_call();
    context_scope!(scope, state_rc, self.v8_isolate());

    let source = v8::String::new(scope, js_source).unwrap();
    let name = v8::String::new(scope, js_filename).unwrap();
    let origin = bindings::script_origin(scope, name);

    v8::tc_scope!(let tc_scope, scope);

    let script = match v8::Script::compile(tc_scope, source, Some(&origin)) {
      Some(script) => script,
      None => {
        let exception = caught_exception!(tc_scope);
        return exception_to_err_result(tc_scope, exception);
      }
    };

    match script.run(tc_scope) {
      Some(_) => {
        tc_scope.perform_microtask_checkpoint();
        Ok(())
      }
      None => {
        assert!(tc_scope.has_caught() || tc_scope.is_execution_terminating());
        let exception = caught_exception!(tc_scope);
        exception_to_err_result(tc_scope, exception)
      }
    }
  }

  /// Answers a request that `Deno.core.send` left pending. The buffer is
  /// passed to the callback registered with `Deno.core.recv`.
  ///
  /// Panics if `request_id` is not pending, which includes answering the
  /// same request twice.
  pub fn respond(
    &mut self,
    request_id: RequestId,
    buf: DenoBuf,
  ) -> Result<(), CoreError> {
    let state_rc = self.begin_call();
    context_scope!(scope, state_rc, self.v8_isolate());

    let (maybe_recv_cb, value) = {
      let mut state = state_rc.borrow_mut();
      // The tracked data buffer is released here.
      state.dispatcher.complete(request_id);
      let state = &mut *state;
      let value = bridge::import(scope, &mut state.bridge, buf);
      (state.js_recv_cb.clone(), value)
    };
    log::trace!("respond to request {}", request_id);

    v8::tc_scope!(let tc_scope, scope);

    let Some(recv_cb) = maybe_recv_cb else {
      let message =
        v8::String::new(tc_scope, "Deno.core.recv has not been called.")
          .unwrap();
      let exception = v8::Exception::type_error(tc_scope, message);
      return exception_to_err_result(tc_scope, exception);
    };
    let recv_cb = v8::Local::new(tc_scope, recv_cb);
    let this = v8::undefined(tc_scope).into();
    let args = match value {
      Some(value) => vec![value],
      None => vec![],
    };

    if recv_cb.call(tc_scope, this, &args).is_none() {
      let exception = caught_exception!(tc_scope);
      return exception_to_err_result(tc_scope, exception);
    }
    tc_scope.perform_microtask_checkpoint();
    Ok(())
  }

  /// Number of `Deno.core.send` requests waiting for [`Isolate::respond`].
  pub fn pending_request_count(&mut self) -> usize {
    self.state().borrow().dispatcher.pending_count()
  }

  /// Drains the table of rejected promises nobody handled. The last one
  /// becomes the last exception.
  pub fn check_promise_errors(&mut self) -> Vec<JsError> {
    let state_rc = self.state();
    context_scope!(scope, state_rc, self.v8_isolate());

    let pending: Vec<_> = state_rc
      .borrow_mut()
      .pending_promise_exceptions
      .drain(..)
      .map(|(_, exception)| exception)
      .collect();
    let errors: Vec<JsError> = pending
      .into_iter()
      .map(|exception| {
        let exception = v8::Local::new(scope, exception);
        JsError::from_v8_exception(scope, exception)
      })
      .collect();

    if let Some(last) = errors.last() {
      state_rc.borrow_mut().last_exception = Some(last.clone());
    }
    errors
  }

  /// JSON encoding of the error recorded by the most recent call, if it
  /// failed.
  pub fn last_exception(&mut self) -> Option<String> {
    self.isolate_ref().last_exception()
  }

  pub fn last_js_error(&mut self) -> Option<JsError> {
    self.isolate_ref().last_js_error()
  }

  /// Replaces the last exception. Hosts that make several calls on behalf of
  /// one call of their own use it to report the error of an earlier one.
  pub fn set_last_exception(&mut self, error: Option<JsError>) {
    self.state().borrow_mut().last_exception = error;
  }

  /// Moves the bytes of the global `name`, which must be an
  /// `ArrayBufferView`, to the host. The view's buffer is detached.
  pub fn export_global_view(
    &mut self,
    name: &str,
  ) -> Result<DenoBuf, CoreError> {
    let state_rc = self.state();
    context_scope!(scope, state_rc, self.v8_isolate());

    let key = v8::String::new(scope, name).unwrap();
    let global = scope.get_current_context().global(scope);
    let view = global
      .get(scope, key.into())
      .and_then(|v| v8::Local::<v8::ArrayBufferView>::try_from(v).ok())
      .ok_or_else(|| CoreError::NotABufferView(name.to_string()))?;
    let arena = state_rc.borrow().bridge.arena().clone();
    Ok(bridge::export(scope, &arena, view)?)
  }

  /// Compiles an ES module and registers it under `name`. Registering a
  /// name twice returns the id of the first registration.
  pub fn mod_new(
    &mut self,
    main: bool,
    name: &str,
    source: &str,
  ) -> Result<ModuleId, CoreError> {
    self.isolate_ref().mod_new(main, name, source)
  }

  pub fn mod_imports_len(&mut self, id: ModuleId) -> usize {
    self.isolate_ref().mod_imports_len(id)
  }

  pub fn mod_imports_get(
    &mut self,
    id: ModuleId,
    index: usize,
  ) -> Option<String> {
    self.isolate_ref().mod_imports_get(id, index)
  }

  pub fn mod_get_imports(&mut self, id: ModuleId) -> Vec<String> {
    self.isolate_ref().mod_get_imports(id)
  }

  pub fn mod_name(&mut self, id: ModuleId) -> Option<String> {
    self.isolate_ref().mod_name(id)
  }

  /// Links the module graph rooted at `id`. Every import is resolved through
  /// `resolver`, or the isolate's default resolver, or by module name.
  pub fn mod_instantiate(
    &mut self,
    id: ModuleId,
    resolver: Option<&mut dyn ResolveHandler>,
  ) -> Result<(), CoreError> {
    let state_rc = self.begin_call();
    assert!(
      state_rc.borrow().resolver.is_none(),
      "mod_instantiate called while another instantiation is running"
    );
    if let Some(resolver) = resolver {
      // SAFETY: the pointer only lives in the state until the guard below
      // clears it, which happens before `resolver` goes out of scope.
      let resolver = unsafe {
        std::mem::transmute::<
          &mut dyn ResolveHandler,
          &'static mut dyn ResolveHandler,
        >(resolver)
      };
      state_rc.borrow_mut().resolver = Some(resolver as *mut _);
    }
    let _clear_resolver = scopeguard::guard(state_rc.clone(), |state_rc| {
      state_rc.borrow_mut().resolver = None;
    });

    context_scope!(scope, state_rc, self.v8_isolate());
    v8::tc_scope!(let tc_scope, scope);

    let module = state_rc
      .borrow()
      .modules
      .get_handle(id)
      .map(|handle| v8::Local::new(tc_scope, handle))
      .expect("ModuleInfo not found");

    if module.get_status() == v8::ModuleStatus::Errored {
      let exception = module.get_exception();
      return exception_to_err_result(tc_scope, exception);
    }

    // IMPORTANT: No borrows to the state can be held at this point because
    // `module_resolve_callback` will be calling into it from within the
    // isolate.
    let instantiated =
      module.instantiate_module(tc_scope, bindings::module_resolve_callback);

    let failed = instantiated.is_none();
    if let Some(info) = state_rc.borrow_mut().modules.get_info_mut(id) {
      info.instantiate_failed = failed;
    }
    if failed {
      let exception = caught_exception!(tc_scope);
      return exception_to_err_result(tc_scope, exception);
    }
    Ok(())
  }

  /// Runs the body of an instantiated module and drains microtasks.
  ///
  /// Panics if the module is not instantiated.
  pub fn mod_evaluate(&mut self, id: ModuleId) -> Result<(), CoreError> {
    let state_rc = self.begin_call();
    context_scope!(scope, state_rc, self.v8_isolate());
    v8::tc_scope!(let tc_scope, scope);

    let module = state_rc
      .borrow()
      .modules
      .get_handle(id)
      .map(|handle| v8::Local::new(tc_scope, handle))
      .expect("ModuleInfo not found");
    let status = module.get_status();
    assert_eq!(
      status,
      v8::ModuleStatus::Instantiated,
      "module {id} must be instantiated before it is evaluated"
    );

    // With top-level await, evaluation returns a promise. A failing module
    // rejects it with nobody listening, which would put it in the pending
    // rejection table; the error is reported from here instead.
    let maybe_value = module.evaluate(tc_scope);

    let Some(value) = maybe_value else {
      let exception = if tc_scope.has_caught() {
        caught_exception!(tc_scope)
      } else {
        module.get_exception()
      };
      return exception_to_err_result(tc_scope, exception);
    };

    tc_scope.perform_microtask_checkpoint();

    let Ok(promise) = v8::Local::<v8::Promise>::try_from(value) else {
      return Ok(());
    };
    let promise_global = v8::Global::new(tc_scope, promise);
    state_rc
      .borrow_mut()
      .pending_promise_exceptions
      .shift_remove(&promise_global);

    if promise.state() == v8::PromiseState::Rejected {
      let exception = promise.result(tc_scope);
      return exception_to_err_result(tc_scope, exception);
    }
    if module.get_status() == v8::ModuleStatus::Errored {
      let exception = module.get_exception();
      return exception_to_err_result(tc_scope, exception);
    }
    Ok(())
  }

  /// The engine status of a module. A module whose instantiation failed is
  /// reported as errored.
  pub fn mod_status(&mut self, id: ModuleId) -> Option<v8::ModuleStatus> {
    let state_rc = self.state();
    v8::scope!(let scope, self.v8_isolate());
    let state = state_rc.borrow();
    let info = state.modules.get_info(id)?;
    let status = v8::Local::new(scope, &info.handle).get_status();
    if info.instantiate_failed && status == v8::ModuleStatus::Uninstantiated {
      return Some(v8::ModuleStatus::Errored);
    }
    Some(status)
  }

  /// Settles the promise of the `import()` identified by `import_id`.
  ///
  /// `mod_id` 0, or any id the isolate does not know, rejects it. Otherwise
  /// the module has to be at least instantiated, and the promise resolves to
  /// its namespace (or rejects with its error).
  ///
  /// Panics if `import_id` was never issued or was already settled.
  pub fn dyn_import_done(
    &mut self,
    import_id: DynImportId,
    mod_id: ModuleId,
  ) -> Result<(), CoreError> {
    let state_rc = self.begin_call();
    let request = state_rc.borrow_mut().dyn_imports.take(import_id);
    log::debug!(
      "dyn import {} ({}) done with module {}",
      import_id,
      request.specifier,
      mod_id
    );

    context_scope!(scope, state_rc, self.v8_isolate());
    v8::tc_scope!(let tc_scope, scope);

    let resolver = v8::Local::new(tc_scope, &request.resolver);
    let maybe_module = state_rc
      .borrow()
      .modules
      .get_handle(mod_id)
      .map(|handle| v8::Local::new(tc_scope, handle));

    match maybe_module {
      None => {
        let message = format!(
          r#"Cannot resolve module "{}" from "{}""#,
          request.specifier, request.referrer
        );
        let message = v8::String::new(tc_scope, &message).unwrap();
        let exception = v8::Exception::type_error(tc_scope, message);
        resolver.reject(tc_scope, exception);
      }
      Some(module) => {
        let status = module.get_status();
        if status == v8::ModuleStatus::Errored {
          let exception = module.get_exception();
          resolver.reject(tc_scope, exception);
        } else {
          assert!(
            matches!(
              status,
              v8::ModuleStatus::Instantiated
                | v8::ModuleStatus::Evaluating
                | v8::ModuleStatus::Evaluated
            ),
            "module {mod_id} must be instantiated before it is imported"
          );
          let namespace = module.get_module_namespace();
          resolver.resolve(tc_scope, namespace);
        }
      }
    }

    tc_scope.perform_microtask_checkpoint();
    if tc_scope.has_caught() || tc_scope.is_execution_terminating() {
      let exception = caught_exception!(tc_scope);
      return exception_to_err_result(tc_scope, exception);
    }
    Ok(())
  }

  /// Takes a snapshot and consumes the isolate. The isolate should have been
  /// created with `will_snapshot` set to true.
  ///
  /// Registered modules are not part of the snapshot.
  pub fn snapshot(mut self) -> Result<DenoBuf, CoreError> {
    assert!(
      self.will_snapshot,
      "snapshot() called on an isolate created without will_snapshot"
    );
    let mut isolate = self.v8_isolate.take().unwrap();
    let state_rc = isolate
      .remove_slot::<Rc<RefCell<IsolateState>>>()
      .unwrap();

    let recv_cb = {
      context_scope!(scope, state_rc, &mut isolate);
      let default_context = v8::Context::new(scope, Default::default());
      scope.set_default_context(default_context);
      let context = scope.get_current_context();
      scope.add_context(context);

      let mut state = state_rc.borrow_mut();
      log::debug!("dropping {} modules before snapshot", state.modules.len());
      state.modules.clear();

      match state.js_recv_cb.take() {
        Some(recv_cb) => {
          let recv_cb = v8::Local::new(scope, recv_cb);
          scope.add_context_data(context, recv_cb);
          // First and only piece of context data.
          Some(0)
        }
        None => None,
      }
    };

    // create_blob() must not see any live handles.
    drop(state_rc);

    let v8_data = isolate
      .create_blob(v8::FunctionCodeHandling::Keep)
      .ok_or(CoreError::SnapshotFailed)?;
    let sidecar = SnapshotSidecar {
      format: SNAPSHOT_FORMAT,
      layout: bindings::layout_fingerprint(),
      recv_cb,
    };
    let blob = snapshot::serialize(&v8_data, &sidecar);
    log::debug!("snapshot created ({} bytes)", blob.len());
    Ok(DenoBuf::from(blob))
  }
}

pub(crate) fn exception_to_err_result<'s, 'i, T>(
  scope: &mut v8::PinScope<'s, 'i>,
  exception: v8::Local<'s, v8::Value>,
) -> Result<T, CoreError> {
  let mut exception = exception;
  if scope.is_execution_terminating() {
    // TerminateExecution was called. Cancel exception termination so that the
    // exception can be created and the isolate can be used again.
    scope.cancel_terminate_execution();

    // Maybe make a new exception object.
    if exception.is_null_or_undefined() {
      let message = v8::String::new(scope, "execution terminated").unwrap();
      exception = v8::Exception::error(scope, message);
    }
  }

  let js_error = JsError::from_v8_exception(scope, exception);
  IsolateState::get(scope).borrow_mut().last_exception = Some(js_error.clone());
  Err(js_error.into())
}

pub fn js_check<T>(r: Result<T, CoreError>) -> T {
  match r {
    Ok(v) => v,
    Err(e) => panic!("{}", e),
  }
}

#[cfg(test)]
pub mod tests {
  use super::*;
  use crate::dispatch::Request;
  use crate::error::ExportError;
  use std::cell::Cell;
  use std::sync::Arc;
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;

  pub enum Mode {
    /// Every request is answered from inside `send`.
    Sync,
    /// Every request is left pending.
    Async,
    /// Requests carry a data buffer of the given length.
    AsyncData(usize),
  }

  pub fn setup(mode: Mode) -> (Isolate, Arc<AtomicUsize>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dispatch_count = Arc::new(AtomicUsize::new(0));
    let dispatch_count_ = dispatch_count.clone();

    let recv_handler = move |req: Request<'_>| -> Option<DenoBuf> {
      dispatch_count_.fetch_add(1, Ordering::Relaxed);
      match mode {
        Mode::Sync => {
          assert_eq!(req.control, &[42]);
          assert!(req.data.is_none());
          Some(DenoBuf::from(vec![43u8]))
        }
        Mode::Async => {
          assert_eq!(req.control, &[42]);
          None
        }
        Mode::AsyncData(len) => {
          assert_eq!(req.control, &[24]);
          let data = req.data.expect("data buffer");
          assert_eq!(data.len(), len);
          for (i, b) in data.iter().enumerate() {
            assert_eq!(*b as usize, i % 256);
          }
          None
        }
      }
    };

    let mut isolate = Isolate::new(IsolateConfig {
      recv_handler: Some(Box::new(recv_handler)),
      ..Default::default()
    })
    .unwrap();
    js_check(isolate.execute(
      "setup.js",
      r#"
        function assert(cond) {
          if (!cond) {
            throw Error("assert");
          }
        }
        "#,
    ));
    assert_eq!(dispatch_count.load(Ordering::Relaxed), 0);
    (isolate, dispatch_count)
  }

  fn owned(bytes: &[u8]) -> DenoBuf {
    let mut buf = DenoBuf::new(bytes.len(), false);
    buf.copy_from_slice(bytes);
    buf
  }

  #[test]
  fn test_dispatch_sync() {
    let (mut isolate, dispatch_count) = setup(Mode::Sync);
    js_check(isolate.execute(
      "filename.js",
      r#"
        let control = new Uint8Array([42]);
        let response = Deno.core.send(control);
        assert(response instanceof Uint8Array);
        assert(response.length == 1);
        assert(response[0] == 43);
        "#,
    ));
    assert_eq!(dispatch_count.load(Ordering::Relaxed), 1);
    assert_eq!(isolate.pending_request_count(), 0);
  }

  #[test]
  fn test_dispatch_async() {
    let (mut isolate, dispatch_count) = setup(Mode::Async);
    js_check(isolate.execute(
      "setup2.js",
      r#"
        let nrecv = 0;
        Deno.core.recv((buf) => {
          assert(buf.byteLength === 1);
          assert(buf[0] === 43);
          nrecv++;
        });
        let control = new Uint8Array([42]);
        assert(Deno.core.send(control) === undefined);
        assert(Deno.core.send(control) === undefined);
        assert(nrecv === 0);
        "#,
    ));
    assert_eq!(dispatch_count.load(Ordering::Relaxed), 2);
    assert_eq!(isolate.pending_request_count(), 2);

    js_check(isolate.respond(2, owned(&[43])));
    js_check(isolate.execute("check1.js", "assert(nrecv === 1);"));
    js_check(isolate.respond(1, unsafe { DenoBuf::from_slice(&[43]) }));
    js_check(isolate.execute("check2.js", "assert(nrecv === 2);"));
    assert_eq!(isolate.pending_request_count(), 0);
  }

  #[test]
  fn test_dispatch_data() {
    let (mut isolate, dispatch_count) = setup(Mode::AsyncData(2000));
    js_check(isolate.execute(
      "data.js",
      r#"
        let data = new Uint8Array(2000);
        for (let i = 0; i < data.length; i++) data[i] = i % 256;
        Deno.core.send(new Uint8Array([24]), data);
        Deno.core.send(new Uint8Array([24]), data.subarray(0));
        "#,
    ));
    assert_eq!(dispatch_count.load(Ordering::Relaxed), 2);
    assert_eq!(isolate.pending_request_count(), 2);
  }

  #[test]
  fn respond_with_null_buffer() {
    let (mut isolate, _dispatch_count) = setup(Mode::Async);
    js_check(isolate.execute(
      "null.js",
      r#"
        let got;
        Deno.core.recv((buf) => { got = buf; });
        Deno.core.send(new Uint8Array([42]));
        "#,
    ));
    js_check(isolate.respond(1, DenoBuf::null()));
    js_check(isolate.execute("check.js", "assert(got === undefined);"));
  }

  #[test]
  #[should_panic(expected = "unknown request id 1")]
  fn double_respond() {
    let (mut isolate, _dispatch_count) = setup(Mode::Async);
    js_check(isolate.execute(
      "double.js",
      r#"
        Deno.core.recv(() => {});
        Deno.core.send(new Uint8Array([42]));
        "#,
    ));
    js_check(isolate.respond(1, DenoBuf::null()));
    let _ = isolate.respond(1, DenoBuf::null());
  }

  #[test]
  #[should_panic(expected = "unknown request id 1")]
  fn respond_to_sync_request() {
    let (mut isolate, _dispatch_count) = setup(Mode::Sync);
    js_check(isolate.execute("sync.js", "Deno.core.send(new Uint8Array([42]));"));
    let _ = isolate.respond(1, DenoBuf::null());
  }

  #[test]
  fn respond_without_recv() {
    let (mut isolate, _dispatch_count) = setup(Mode::Async);
    js_check(isolate.execute("send.js", "Deno.core.send(new Uint8Array([42]));"));
    let err = isolate.respond(1, DenoBuf::null()).unwrap_err();
    assert!(err.to_string().contains("Deno.core.recv has not been called."));
    assert!(isolate.last_exception().is_some());
  }

  #[test]
  fn respond_recv_throws() {
    let (mut isolate, _dispatch_count) = setup(Mode::Async);
    js_check(isolate.execute(
      "throw.js",
      r#"
        Deno.core.recv(() => { throw new Error("in recv"); });
        Deno.core.send(new Uint8Array([42]));
        "#,
    ));
    let err = isolate.respond(1, DenoBuf::null()).unwrap_err();
    let js_error = err.as_js_error().unwrap();
    assert_eq!(js_error.message, "Uncaught Error: in recv");
    let json = isolate.last_exception().unwrap();
    assert_eq!(JsError::from_json(&json).unwrap(), *js_error);

    // A successful call forgets the error.
    js_check(isolate.execute("ok.js", "1 + 1"));
    assert!(isolate.last_exception().is_none());
  }

  /// Runs `source` from inside a handler, the way a host with direct access
  /// to the engine would. Returns what the script threw.
  fn run_nested(isolate_ref: &IsolateRef, source: &str) -> Option<String> {
    let state_rc = isolate_ref.state();
    let mut isolate = isolate_ref.v8_isolate(&state_rc);
    context_scope!(scope, state_rc, &mut isolate);
    let source = v8::String::new(scope, source).unwrap();
    v8::tc_scope!(let tc_scope, scope);
    let script = v8::Script::compile(tc_scope, source, None).unwrap();
    match script.run(tc_scope) {
      Some(_) => None,
      None => {
        let exception = tc_scope.exception().unwrap();
        Some(exception.to_rust_string_lossy(tc_scope))
      }
    }
  }

  #[test]
  fn send_from_receive_handler_is_rejected() {
    let slot: Rc<RefCell<Option<IsolateRef>>> = Default::default();
    let nested_error = Rc::new(RefCell::new(None));
    let count = Rc::new(Cell::new(0));
    let handler = {
      let slot = slot.clone();
      let nested_error = nested_error.clone();
      let count = count.clone();
      move |_: Request<'_>| -> Option<DenoBuf> {
        count.set(count.get() + 1);
        let isolate_ref = slot.borrow().clone().unwrap();
        *nested_error.borrow_mut() =
          run_nested(&isolate_ref, "Deno.core.send(new Uint8Array([2]));");
        None
      }
    };
    let mut isolate = Isolate::new(IsolateConfig {
      recv_handler: Some(Box::new(handler)),
      ..Default::default()
    })
    .unwrap();
    *slot.borrow_mut() = Some(isolate.isolate_ref());

    js_check(isolate.execute("send.js", "Deno.core.send(new Uint8Array([1]));"));
    assert_eq!(count.get(), 1);
    let err = nested_error.borrow().clone().unwrap();
    assert!(err.starts_with("TypeError"), "{err}");
    assert!(err.contains("from inside the receive handler"), "{err}");
    assert_eq!(isolate.pending_request_count(), 1);
  }

  #[test]
  fn pending_request_pins_data() {
    let handler = |req: Request<'_>| -> Option<DenoBuf> {
      if req.control[0] == 1 {
        return Some(owned(&[5, 6, 7]));
      }
      assert_eq!(&*req.data.unwrap(), &[5, 6, 7]);
      None
    };
    let mut isolate = Isolate::new(IsolateConfig {
      recv_handler: Some(Box::new(handler)),
      ..Default::default()
    })
    .unwrap();
    js_check(isolate.execute(
      "pin.js",
      r#"
        Deno.core.recv(() => {});
        globalThis.g = Deno.core.send(new Uint8Array([1]));
        Deno.core.send(new Uint8Array([2]), g);
        "#,
    ));

    // The handler dropped its reference, the pending request did not.
    let err = isolate.export_global_view("g").unwrap_err();
    assert!(matches!(err, CoreError::Export(ExportError::Pinned(1))));

    js_check(isolate.respond(2, DenoBuf::null()));
    let mut buf = isolate.export_global_view("g").unwrap();
    assert_eq!(&*buf, &[5, 6, 7]);
    buf.delete();
  }

  #[test]
  fn recv_twice() {
    let (mut isolate, _dispatch_count) = setup(Mode::Async);
    js_check(isolate.execute(
      "recv.js",
      r#"
        Deno.core.recv(() => {});
        let thrown;
        try {
          Deno.core.recv(() => {});
        } catch (e) {
          thrown = e;
        }
        assert(thrown instanceof TypeError);
        assert(thrown.message === "Deno.core.recv already called.");
        "#,
    ));
  }

  #[test]
  fn send_bad_arguments() {
    let (mut isolate, dispatch_count) = setup(Mode::Async);
    js_check(isolate.execute(
      "bad_args.js",
      r#"
        function throwsTypeError(f) {
          try {
            f();
          } catch (e) {
            return e instanceof TypeError;
          }
          return false;
        }
        assert(throwsTypeError(() => Deno.core.send("nope")));
        assert(throwsTypeError(() => Deno.core.send(new Uint8Array([42]), 5)));
        "#,
    ));
    assert_eq!(dispatch_count.load(Ordering::Relaxed), 0);
  }

  #[test]
  fn send_without_handler() {
    let mut isolate = Isolate::new(IsolateConfig::default()).unwrap();
    let err = isolate
      .execute("send.js", "Deno.core.send(new Uint8Array([1]));")
      .unwrap_err();
    assert!(err.to_string().contains("without a receive handler"));
  }

  #[test]
  fn shared_buffer() {
    let mut shared = vec![0u8; 4];
    // SAFETY: `shared` outlives the isolate.
    let shared_buf =
      unsafe { DenoBuf::from_raw_parts(shared.as_mut_ptr(), shared.len()) };
    let mut isolate = Isolate::new(IsolateConfig {
      shared: shared_buf,
      ..Default::default()
    })
    .unwrap();
    js_check(isolate.execute(
      "shared.js",
      r#"
        const ab = Deno.core.shared;
        if (!(ab instanceof ArrayBuffer)) throw Error("not an ArrayBuffer");
        if (Deno.core.shared !== ab) throw Error("not the same buffer");
        new Uint8Array(ab).set([1, 2, 3, 4]);
        "#,
    ));
    drop(isolate);
    assert_eq!(shared, vec![1, 2, 3, 4]);
  }

  #[test]
  fn error_to_json() {
    let (mut isolate, _dispatch_count) = setup(Mode::Async);
    js_check(isolate.execute(
      "error_to_json.js",
      r#"
        const json = JSON.parse(Deno.core.errorToJSON(new Error("boom")));
        assert(json.message.includes("Error: boom"));
        assert(json.scriptResourceName === "error_to_json.js");
        assert(Array.isArray(json.frames));
        "#,
    ));
  }

  #[test]
  fn terminate_execution() {
    let (mut isolate, _dispatch_count) = setup(Mode::Async);
    let isolate_handle = isolate.thread_safe_handle();

    let terminator_thread = std::thread::spawn(move || {
      // allow deno to boot and run
      std::thread::sleep(std::time::Duration::from_millis(100));

      // terminate execution
      let ok = isolate_handle.terminate_execution();
      assert!(ok);
    });

    // Run an infinite loop, which should be terminated.
    match isolate.execute("infinite_loop.js", "for(;;) {}") {
      Ok(_) => panic!("execution should be terminated"),
      Err(e) => {
        assert!(e.to_string().contains("execution terminated"))
      }
    };

    // Verify that the isolate usable again.
    isolate
      .execute("simple.js", "1 + 1")
      .expect("execution should be possible again");

    terminator_thread.join().unwrap();
  }

  #[test]
  fn dangling_shared_isolate() {
    let isolate_handle = {
      // isolate is dropped at the end of this block
      let (mut isolate, _dispatch_count) = setup(Mode::Async);
      isolate.thread_safe_handle()
    };

    // this should not SEGFAULT
    isolate_handle.terminate_execution();
  }

  #[test]
  fn syntax_error() {
    let mut isolate = Isolate::new(IsolateConfig::default()).unwrap();
    let src = "hocuspocus(";
    let r = isolate.execute("i.js", src);
    let e = r.unwrap_err();
    let js_error = e.as_js_error().unwrap();
    assert_eq!(js_error.end_column, 11);
    assert_eq!(js_error.script_resource_name.as_deref(), Some("i.js"));

    let json: serde_json::Value =
      serde_json::from_str(&isolate.last_exception().unwrap()).unwrap();
    assert_eq!(json["endColumn"], 11);
    assert_eq!(json["lineNumber"], 1);
  }

  #[test]
  fn promise_rejections() {
    let mut isolate = Isolate::new(IsolateConfig::default()).unwrap();
    js_check(isolate.execute(
      "reject.js",
      r#"
        Promise.reject(new Error("first"));
        const handledLater = Promise.reject(new Error("handled"));
        handledLater.catch(() => {});
        (async () => { throw new Error("last"); })();
        "#,
    ));
    let errors = isolate.check_promise_errors();
    let messages: Vec<_> = errors.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["Uncaught Error: first", "Uncaught Error: last"]);
    let last = isolate.last_js_error().unwrap();
    assert_eq!(last.message, "Uncaught Error: last");
    assert!(isolate.check_promise_errors().is_empty());
  }

  #[test]
  fn export_global_view() {
    let mut isolate = Isolate::new(IsolateConfig::default()).unwrap();
    js_check(isolate.execute(
      "export.js",
      "globalThis.out = new Uint8Array([1, 2, 3]); globalThis.n = 1;",
    ));
    let mut buf = isolate.export_global_view("out").unwrap();
    assert_eq!(&*buf, &[1, 2, 3]);
    buf.delete();
    js_check(isolate.execute("check.js", "if (out.length !== 0) throw 1;"));
    assert!(matches!(
      isolate.export_global_view("n").unwrap_err(),
      CoreError::NotABufferView(_)
    ));
  }

  #[test]
  fn test_mods() {
    let (mut isolate, dispatch_count) = setup(Mode::Async);
    let mod_a = isolate
      .mod_new(
        true,
        "a.js",
        r#"
        import { b } from 'b.js'
        if (b() != 'b') throw Error();
        let control = new Uint8Array([42]);
        Deno.core.send(control);
      "#,
      )
      .unwrap();
    assert_eq!(dispatch_count.load(Ordering::Relaxed), 0);

    let imports = isolate.mod_get_imports(mod_a);
    assert_eq!(imports, vec!["b.js".to_string()]);
    assert_eq!(isolate.mod_imports_len(mod_a), 1);
    assert_eq!(isolate.mod_imports_get(mod_a, 0).as_deref(), Some("b.js"));
    assert_eq!(isolate.mod_imports_get(mod_a, 1), None);

    let mod_b = isolate
      .mod_new(false, "b.js", "export function b() { return 'b' }")
      .unwrap();
    let imports = isolate.mod_get_imports(mod_b);
    assert_eq!(imports.len(), 0);

    let resolve_count = Arc::new(AtomicUsize::new(0));
    let resolve_count_ = resolve_count.clone();

    let mut resolve = move |specifier: &str,
                            referrer: &str,
                            referrer_id: ModuleId|
          -> ModuleId {
      resolve_count_.fetch_add(1, Ordering::SeqCst);
      assert_eq!(specifier, "b.js");
      assert_eq!(referrer, "a.js");
      assert_eq!(referrer_id, mod_a);
      mod_b
    };

    js_check(isolate.mod_instantiate(mod_b, Some(&mut resolve)));
    assert_eq!(dispatch_count.load(Ordering::Relaxed), 0);
    assert_eq!(resolve_count.load(Ordering::SeqCst), 0);

    js_check(isolate.mod_instantiate(mod_a, Some(&mut resolve)));
    assert_eq!(dispatch_count.load(Ordering::Relaxed), 0);
    assert_eq!(resolve_count.load(Ordering::SeqCst), 1);
    assert_eq!(
      isolate.mod_status(mod_a),
      Some(v8::ModuleStatus::Instantiated)
    );

    js_check(isolate.mod_evaluate(mod_a));
    assert_eq!(dispatch_count.load(Ordering::Relaxed), 1);
    assert_eq!(resolve_count.load(Ordering::SeqCst), 1);
    assert_eq!(isolate.mod_status(mod_a), Some(v8::ModuleStatus::Evaluated));
  }

  #[test]
  fn mod_new_twice_returns_same_id() {
    let mut isolate = Isolate::new(IsolateConfig::default()).unwrap();
    let a = isolate.mod_new(true, "a.js", "export const a = 1;").unwrap();
    let again = isolate.mod_new(true, "a.js", "export const a = 2;").unwrap();
    assert_eq!(a, again);
    assert_eq!(isolate.mod_name(a).as_deref(), Some("a.js"));
  }

  #[test]
  fn mod_new_syntax_error() {
    let mut isolate = Isolate::new(IsolateConfig::default()).unwrap();
    let err = isolate.mod_new(true, "bad.js", "export {").unwrap_err();
    assert!(err.as_js_error().is_some());
    assert!(isolate.last_exception().is_some());
  }

  #[test]
  fn resolution_by_name() {
    let mut isolate = Isolate::new(IsolateConfig::default()).unwrap();
    let a = isolate
      .mod_new(true, "a.js", "import { b } from 'b.js'; globalThis.r = b;")
      .unwrap();
    isolate.mod_new(false, "b.js", "export const b = 'b';").unwrap();
    js_check(isolate.mod_instantiate(a, None));
    js_check(isolate.mod_evaluate(a));
    js_check(isolate.execute("check.js", "if (r !== 'b') throw Error();"));
  }

  #[test]
  fn resolution_failure() {
    let mut isolate = Isolate::new(IsolateConfig::default()).unwrap();
    let a = isolate
      .mod_new(true, "a.js", "import { b } from 'missing.js';")
      .unwrap();
    let mut resolve = |_: &str, _: &str, _: ModuleId| -> ModuleId { 0 };
    let err = isolate.mod_instantiate(a, Some(&mut resolve)).unwrap_err();
    assert!(
      err
        .to_string()
        .contains(r#"Cannot resolve module "missing.js" from "a.js""#)
    );
    assert_eq!(isolate.mod_status(a), Some(v8::ModuleStatus::Errored));
    assert!(isolate.last_exception().is_some());
  }

  #[test]
  fn evaluate_after_resolution_failure() {
    let mut isolate = Isolate::new(IsolateConfig::default()).unwrap();
    let a = isolate
      .mod_new(true, "a.js", "import 'missing.js'; globalThis.ran = true;")
      .unwrap();
    let mut resolve = |_: &str, _: &str, _: ModuleId| -> ModuleId { 0 };
    assert!(isolate.mod_instantiate(a, Some(&mut resolve)).is_err());

    let evaluated = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
      || isolate.mod_evaluate(a),
    ));
    assert!(evaluated.is_err());
    js_check(isolate.execute(
      "check.js",
      "if (typeof ran !== 'undefined') throw Error('module body ran');",
    ));
  }

  #[test]
  fn register_module_while_resolving() {
    let mut isolate = Isolate::new(IsolateConfig::default()).unwrap();
    let a = isolate
      .mod_new(true, "a.js", "import { b } from 'b.js'; globalThis.r = b;")
      .unwrap();
    let isolate_ref = isolate.isolate_ref();
    let mut resolve = move |specifier: &str, _: &str, _: ModuleId| -> ModuleId {
      assert_eq!(specifier, "b.js");
      js_check(isolate_ref.mod_new(false, "b.js", "export const b = 'b';"))
    };
    js_check(isolate.mod_instantiate(a, Some(&mut resolve)));
    js_check(isolate.mod_evaluate(a));
    js_check(isolate.execute("check.js", "if (r !== 'b') throw Error();"));
    assert_eq!(isolate.mod_name(a + 1).as_deref(), Some("b.js"));
  }

  #[test]
  #[should_panic(expected = "isolate is gone")]
  fn isolate_ref_outlives_isolate() {
    let isolate_ref = Isolate::new(IsolateConfig::default())
      .unwrap()
      .isolate_ref();
    isolate_ref.mod_imports_len(1);
  }

  #[test]
  fn default_resolver() {
    let resolve_count = Arc::new(AtomicUsize::new(0));
    let resolve_count_ = resolve_count.clone();
    let resolver = move |specifier: &str, _: &str, _: ModuleId| -> ModuleId {
      resolve_count_.fetch_add(1, Ordering::SeqCst);
      assert_eq!(specifier, "./dep.js");
      2
    };
    let mut isolate = Isolate::new(IsolateConfig {
      resolve_handler: Some(Box::new(resolver)),
      ..Default::default()
    })
    .unwrap();
    let main = isolate
      .mod_new(true, "main.js", "import './dep.js';")
      .unwrap();
    let dep = isolate.mod_new(false, "dep.js", "").unwrap();
    assert_eq!(dep, 2);
    js_check(isolate.mod_instantiate(main, None));
    assert_eq!(resolve_count.load(Ordering::SeqCst), 1);
  }

  #[test]
  #[should_panic(expected = "must be instantiated before it is evaluated")]
  fn evaluate_uninstantiated() {
    let mut isolate = Isolate::new(IsolateConfig::default()).unwrap();
    let a = isolate.mod_new(true, "a.js", "").unwrap();
    let _ = isolate.mod_evaluate(a);
  }

  #[test]
  fn mod_evaluate_error() {
    let mut isolate = Isolate::new(IsolateConfig::default()).unwrap();
    let a = isolate
      .mod_new(true, "a.js", "throw new Error('module failed');")
      .unwrap();
    js_check(isolate.mod_instantiate(a, None));
    let err = isolate.mod_evaluate(a).unwrap_err();
    assert!(err.to_string().contains("module failed"));
    assert_eq!(isolate.mod_status(a), Some(v8::ModuleStatus::Errored));
    // The rejection of the evaluation promise is not reported twice.
    assert!(isolate.check_promise_errors().is_empty());
  }

  #[test]
  fn import_meta() {
    let mut isolate = Isolate::new(IsolateConfig::default()).unwrap();
    let a = isolate
      .mod_new(
        true,
        "file:///a.js",
        "globalThis.meta = [import.meta.url, import.meta.main];",
      )
      .unwrap();
    js_check(isolate.mod_instantiate(a, None));
    js_check(isolate.mod_evaluate(a));
    js_check(isolate.execute(
      "check.js",
      r#"if (meta[0] !== "file:///a.js" || meta[1] !== true) throw Error();"#,
    ));
  }

  fn dyn_import_isolate() -> (Isolate, Rc<RefCell<Vec<(DynImportId, String)>>>)
  {
    let requests = Rc::new(RefCell::new(vec![]));
    let requests_ = requests.clone();
    let handler = move |id: DynImportId, specifier: &str, referrer: &str| {
      assert_eq!(referrer, "dyn_import.js");
      requests_.borrow_mut().push((id, specifier.to_string()));
    };
    let isolate = Isolate::new(IsolateConfig {
      dyn_import_handler: Some(Box::new(handler)),
      ..Default::default()
    })
    .unwrap();
    (isolate, requests)
  }

  #[test]
  fn dyn_import_err() {
    // Test an erroneous dynamic import where the specified module isn't found.
    let (mut isolate, requests) = dyn_import_isolate();
    js_check(isolate.execute(
      "dyn_import.js",
      r#"
        globalThis.after = 0;
        (async () => {
          await import("foo.js");
          globalThis.after++;
        })();
        "#,
    ));
    assert_eq!(*requests.borrow(), vec![(1, "foo.js".to_string())]);

    js_check(isolate.dyn_import_done(1, 0));
    js_check(isolate.execute("check.js", "if (after !== 0) throw Error();"));

    let errors = isolate.check_promise_errors();
    assert_eq!(errors.len(), 1);
    assert!(
      errors[0]
        .message
        .contains(r#"Cannot resolve module "foo.js" from "dyn_import.js""#)
    );
  }

  #[test]
  fn dyn_import_ok() {
    let (mut isolate, requests) = dyn_import_isolate();

    let mod_b = isolate
      .mod_new(false, "b.js", "export function b() { return 'b' }")
      .unwrap();
    let mut resolve =
      move |_: &str, _: &str, _: ModuleId| -> ModuleId { unreachable!() };
    js_check(isolate.mod_instantiate(mod_b, Some(&mut resolve)));

    // Dynamically import mod_b
    js_check(isolate.execute(
      "dyn_import.js",
      r#"
        globalThis.count = 0;
        (async () => {
          let mod = await import("foo1.js");
          if (mod.b() !== 'b') {
            throw Error("bad1");
          }
          // And again!
          mod = await import("foo2.js");
          if (mod.b() !== 'b') {
            throw Error("bad2");
          }
          globalThis.count++;
        })();
        "#,
    ));

    assert_eq!(requests.borrow().len(), 1);
    js_check(isolate.dyn_import_done(1, mod_b));
    assert_eq!(requests.borrow().len(), 2);
    assert_eq!(requests.borrow()[1], (2, "foo2.js".to_string()));
    js_check(isolate.dyn_import_done(2, mod_b));
    js_check(isolate.execute("check.js", "if (count !== 1) throw Error();"));
    assert!(isolate.check_promise_errors().is_empty());
  }

  #[test]
  #[should_panic(expected = "unknown or finished id 1")]
  fn dyn_import_done_twice() {
    let (mut isolate, _requests) = dyn_import_isolate();
    js_check(isolate.execute("dyn_import.js", "import('x.js').catch(() => {});"));
    js_check(isolate.dyn_import_done(1, 0));
    let _ = isolate.dyn_import_done(1, 0);
  }

  #[test]
  fn dyn_import_without_handler() {
    let mut isolate = Isolate::new(IsolateConfig::default()).unwrap();
    js_check(isolate.execute(
      "dyn_import.js",
      r#"
        globalThis.failed = false;
        import("foo.js").catch((e) => { globalThis.failed = e instanceof TypeError; });
        "#,
    ));
    js_check(isolate.execute("check.js", "if (!failed) throw Error();"));
  }

  #[test]
  fn will_snapshot() {
    let snapshot = {
      let mut isolate = Isolate::new(IsolateConfig {
        will_snapshot: true,
        ..Default::default()
      })
      .unwrap();
      js_check(isolate.execute("a.js", "a = 1 + 2"));
      isolate.snapshot().unwrap()
    };

    let mut snapshot = snapshot;
    let boxed: Box<[u8]> = snapshot.to_vec().into_boxed_slice();
    snapshot.delete();

    let mut isolate2 = Isolate::new(IsolateConfig {
      load_snapshot: Some(Snapshot::Boxed(boxed)),
      ..Default::default()
    })
    .unwrap();
    js_check(isolate2.execute("check.js", "if (a != 3) throw Error('x')"));
    js_check(isolate2.execute(
      "core.js",
      "if (typeof Deno.core.send !== 'function') throw Error('no bindings')",
    ));
  }

  #[test]
  fn snapshot_keeps_recv_callback() {
    let snapshot = {
      let mut isolate = Isolate::new(IsolateConfig {
        will_snapshot: true,
        ..Default::default()
      })
      .unwrap();
      js_check(isolate.execute(
        "a.js",
        "globalThis.got = 0; Deno.core.recv((buf) => { got = buf[0]; });",
      ));
      let mut snapshot = isolate.snapshot().unwrap();
      let boxed: Box<[u8]> = snapshot.to_vec().into_boxed_slice();
      snapshot.delete();
      boxed
    };

    let recv_handler = |_: Request<'_>| -> Option<DenoBuf> { None };
    let mut isolate = Isolate::new(IsolateConfig {
      load_snapshot: Some(Snapshot::Boxed(snapshot)),
      recv_handler: Some(Box::new(recv_handler)),
      ..Default::default()
    })
    .unwrap();
    js_check(isolate.execute("send.js", "Deno.core.send(new Uint8Array(1));"));
    js_check(isolate.respond(1, owned(&[7])));
    js_check(isolate.execute("check.js", "if (got !== 7) throw Error();"));
  }

  #[test]
  fn snapshot_while_snapshotting() {
    let err = Isolate::new(IsolateConfig {
      will_snapshot: true,
      load_snapshot: Some(Snapshot::Static(&[])),
      ..Default::default()
    })
    .err()
    .unwrap();
    assert!(matches!(err, CoreError::SnapshotWhileSnapshotting));
  }

  #[test]
  fn snapshot_layout_mismatch() {
    let sidecar = SnapshotSidecar {
      format: SNAPSHOT_FORMAT,
      layout: bindings::layout_fingerprint() ^ 1,
      recv_cb: None,
    };
    let blob = snapshot::serialize(b"not really v8", &sidecar);
    let err = Isolate::new(IsolateConfig {
      load_snapshot: Some(Snapshot::Boxed(blob)),
      ..Default::default()
    })
    .err()
    .unwrap();
    assert!(matches!(err, CoreError::SnapshotLayoutMismatch { .. }));
  }

  #[test]
  #[should_panic(expected = "without will_snapshot")]
  fn snapshot_requires_creator() {
    let isolate = Isolate::new(IsolateConfig::default()).unwrap();
    let _ = isolate.snapshot();
  }
}
