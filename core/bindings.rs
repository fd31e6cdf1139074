// Copyright 2018-2026 the Deno authors. MIT license.

use std::borrow::Cow;
use std::ffi::c_void;

use v8::MapFnTo;

use crate::bridge;
use crate::bridge::PinnedBuf;
use crate::dispatch::Request;
use crate::isolate::IsolateState;
use crate::js_errors::JsError;

/// Names of the native functions reachable from the heap, in the order their
/// external references are registered. A snapshot stores a fingerprint of
/// this list and only loads into an isolate with the same layout.
pub(crate) const BINDING_NAMES: [&str; 5] =
  ["send", "recv", "print", "errorToJSON", "shared"];

/// External references handed to V8 through the isolate's create params.
pub(crate) fn external_references() -> Cow<'static, [v8::ExternalReference]> {
  let mut references = Vec::with_capacity(BINDING_NAMES.len() + 1);
  references.push(v8::ExternalReference {
    function: send.map_fn_to(),
  });
  references.push(v8::ExternalReference {
    function: recv.map_fn_to(),
  });
  references.push(v8::ExternalReference {
    function: print.map_fn_to(),
  });
  references.push(v8::ExternalReference {
    function: error_to_json.map_fn_to(),
  });
  references.push(v8::ExternalReference {
    function: shared_getter.map_fn_to(),
  });
  debug_assert_eq!(references.len(), BINDING_NAMES.len());

  // null terminate so rusty_v8 doesn't have to make a copy.
  references.push(v8::ExternalReference {
    pointer: std::ptr::null_mut(),
  });
  Cow::Owned(references)
}

/// FNV-1a over the binding names, in slot order.
pub(crate) fn layout_fingerprint() -> u64 {
  let mut hash: u64 = 0xcbf29ce484222325;
  for name in BINDING_NAMES {
    for byte in name.bytes().chain(std::iter::once(0)) {
      hash ^= byte as u64;
      hash = hash.wrapping_mul(0x100000001b3);
    }
  }
  hash
}

pub fn script_origin<'s, 'i>(
  scope: &mut v8::PinScope<'s, 'i>,
  resource_name: v8::Local<'s, v8::String>,
) -> v8::ScriptOrigin<'s> {
  v8::ScriptOrigin::new(
    scope,
    resource_name.into(),
    0,
    0,
    false,
    123,
    None,
    false,
    false,
    false,
    None,
  )
}

pub fn module_origin<'s, 'i>(
  scope: &mut v8::PinScope<'s, 'i>,
  resource_name: v8::Local<'s, v8::String>,
) -> v8::ScriptOrigin<'s> {
  v8::ScriptOrigin::new(
    scope,
    resource_name.into(),
    0,
    0,
    false,
    123,
    None,
    false,
    false,
    true,
    None,
  )
}

/// Creates the context and installs `Deno.core`.
pub(crate) fn initialize_context<'s, 'i>(
  scope: &mut v8::PinScope<'s, 'i, ()>,
) -> v8::Local<'s, v8::Context> {
  let context = v8::Context::new(scope, Default::default());
  let scope = &mut v8::ContextScope::new(scope, context);

  let global = context.global(scope);

  let deno_val = v8::Object::new(scope);
  let deno_key = v8::String::new(scope, "Deno").unwrap();
  global.set(scope, deno_key.into(), deno_val.into());

  let core_val = v8::Object::new(scope);
  let core_key = v8::String::new(scope, "core").unwrap();
  deno_val.set(scope, core_key.into(), core_val.into());

  set_func(scope, core_val, "send", send);
  set_func(scope, core_val, "recv", recv);
  set_func(scope, core_val, "print", print);
  set_func(scope, core_val, "errorToJSON", error_to_json);

  let shared_key = v8::String::new(scope, "shared").unwrap();
  let shared_fn = v8::Function::new(scope, shared_getter).unwrap();
  core_val.set_accessor_property(
    shared_key.into(),
    Some(shared_fn),
    None,
    v8::PropertyAttribute::READ_ONLY,
  );

  context
}

fn set_func(
  scope: &mut v8::PinScope,
  obj: v8::Local<v8::Object>,
  name: &'static str,
  callback: impl v8::MapFnTo<v8::FunctionCallback>,
) {
  let key = v8::String::new(scope, name).unwrap();
  let val = v8::Function::new(scope, callback).unwrap();
  val.set_name(key);
  obj.set(scope, key.into(), val.into());
}

pub(crate) fn throw_type_error(scope: &mut v8::PinScope, message: &str) {
  let message = v8::String::new(scope, message).unwrap();
  let exception = v8::Exception::type_error(scope, message);
  scope.throw_exception(exception);
}

fn send(
  scope: &mut v8::PinScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let Ok(control) = v8::Local::<v8::ArrayBufferView>::try_from(args.get(0))
  else {
    return throw_type_error(
      scope,
      "Deno.core.send: control must be an ArrayBufferView",
    );
  };
  let data_arg = args.get(1);
  let data = if data_arg.is_null_or_undefined() {
    None
  } else {
    match v8::Local::<v8::ArrayBufferView>::try_from(data_arg) {
      Ok(view) => Some(view),
      Err(_) => {
        return throw_type_error(
          scope,
          "Deno.core.send: data must be an ArrayBufferView",
        );
      }
    }
  };

  let state_rc = IsolateState::get(scope);
  let (id, mut handler, arena) = {
    let mut state = state_rc.borrow_mut();
    match state.dispatcher.begin() {
      Ok((id, handler)) => (id, handler, state.bridge.arena.clone()),
      Err(err) => {
        drop(state);
        return throw_type_error(scope, &err.to_string());
      }
    }
  };

  let control = PinnedBuf::new(scope, &arena, control);
  // One reference for the handler and one the dispatcher keeps until the
  // request is answered.
  let tracked = data.and_then(|view| PinnedBuf::new(scope, &arena, view));
  let data = data.and_then(|view| PinnedBuf::new(scope, &arena, view));

  log::trace!("send request {}", id);
  let response = handler.recv(Request {
    id,
    control: control.as_deref().unwrap_or_default(),
    data,
  });
  drop(control);

  let mut state = state_rc.borrow_mut();
  state.dispatcher.finish(handler);
  match response {
    Some(buf) => {
      // Synchronous response. Nothing is left to track for this request.
      if let Some(value) = bridge::import(scope, &mut state.bridge, buf) {
        rv.set(value);
      }
    }
    None => state.dispatcher.track(id, tracked),
  }
}

fn recv(
  scope: &mut v8::PinScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let Ok(recv_fn) = v8::Local::<v8::Function>::try_from(args.get(0)) else {
    return throw_type_error(scope, "Deno.core.recv: expected a function");
  };
  let state_rc = IsolateState::get(scope);
  let mut state = state_rc.borrow_mut();
  if state.js_recv_cb.is_some() {
    drop(state);
    return throw_type_error(scope, "Deno.core.recv already called.");
  }
  state.js_recv_cb = Some(v8::Global::new(scope, recv_fn));
}

fn print(
  scope: &mut v8::PinScope,
  args: v8::FunctionCallbackArguments,
  _rv: v8::ReturnValue,
) {
  let is_err = args.length() >= 2 && args.get(1).boolean_value(scope);
  let str_ = args.get(0).to_rust_string_lossy(scope);
  if is_err {
    eprint!("{}", str_);
  } else {
    print!("{}", str_);
  }
}

fn error_to_json(
  scope: &mut v8::PinScope,
  args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let json = JsError::from_v8_exception(scope, args.get(0)).to_json();
  let json = v8::String::new(scope, &json).unwrap();
  rv.set(json.into());
}

fn shared_getter(
  scope: &mut v8::PinScope,
  _args: v8::FunctionCallbackArguments,
  mut rv: v8::ReturnValue,
) {
  let state_rc = IsolateState::get(scope);
  let mut state = state_rc.borrow_mut();

  // Lazily initialize the persistent external ArrayBuffer.
  if state.shared_ab.is_none() {
    let shared = state.shared.take();
    if shared.is_null() {
      return;
    }
    let ab = state.bridge.shared_array_buffer(scope, shared);
    state.shared_ab = Some(v8::Global::new(scope, ab));
  }
  if let Some(ab) = &state.shared_ab {
    let ab = v8::Local::new(scope, ab);
    rv.set(ab.into());
  }
}

/// Called by V8 during `Isolate::mod_instantiate`, once for every import of
/// every module in the graph.
pub fn module_resolve_callback<'s>(
  context: v8::Local<'s, v8::Context>,
  specifier: v8::Local<'s, v8::String>,
  _import_attributes: v8::Local<'s, v8::FixedArray>,
  referrer: v8::Local<'s, v8::Module>,
) -> Option<v8::Local<'s, v8::Module>> {
  // SAFETY: `CallbackScope` can be safely constructed from `Local<Context>`
  v8::callback_scope!(unsafe scope, context);

  let state_rc = IsolateState::get(scope);
  let specifier_str = specifier.to_rust_string_lossy(scope);
  let referrer_global = v8::Global::new(scope, referrer);
  let (referrer_id, referrer_name) = {
    let state = state_rc.borrow();
    let info = state
      .modules
      .get_info_by_handle(referrer.get_identity_hash().get(), &referrer_global)
      .expect("ModuleInfo not found");
    (info.id, info.name.clone())
  };

  let id = crate::modules::resolve(
    &state_rc,
    &specifier_str,
    &referrer_name,
    referrer_id,
  );

  let handle = state_rc
    .borrow()
    .modules
    .get_handle(id)
    .map(|h| v8::Local::new(scope, h));
  if handle.is_none() {
    let msg = format!(
      r#"Cannot resolve module "{}" from "{}""#,
      specifier_str, referrer_name
    );
    throw_type_error(scope, &msg);
  }
  handle
}

#[allow(clippy::unnecessary_wraps)]
pub fn host_import_module_dynamically_callback<'s, 'i>(
  scope: &mut v8::PinScope<'s, 'i>,
  _host_defined_options: v8::Local<'s, v8::Data>,
  resource_name: v8::Local<'s, v8::Value>,
  specifier: v8::Local<'s, v8::String>,
  _import_attributes: v8::Local<'s, v8::FixedArray>,
) -> Option<v8::Local<'s, v8::Promise>> {
  // NOTE(bartlomieju): will crash for non-UTF-8 specifier
  let specifier_str = specifier.to_rust_string_lossy(scope);
  let referrer_name_str = resource_name.to_rust_string_lossy(scope);

  let resolver = v8::PromiseResolver::new(scope).unwrap();
  let promise = resolver.get_promise(scope);
  let resolver_handle = v8::Global::new(scope, resolver);

  let state_rc = IsolateState::get(scope);
  let started = crate::modules::start_dyn_import(
    &state_rc,
    specifier_str.clone(),
    referrer_name_str.clone(),
    resolver_handle,
  );
  if !started {
    let msg = format!(
      r#"Cannot dynamically import "{}" from "{}": no dynamic import handler"#,
      specifier_str, referrer_name_str
    );
    let msg = v8::String::new(scope, &msg).unwrap();
    let exception = v8::Exception::type_error(scope, msg);
    resolver.reject(scope, exception);
  }

  Some(promise)
}

pub extern "C" fn host_initialize_import_meta_object_callback(
  context: v8::Local<v8::Context>,
  module: v8::Local<v8::Module>,
  meta: v8::Local<v8::Object>,
) {
  // SAFETY: `CallbackScope` can be safely constructed from `Local<Context>`
  v8::callback_scope!(unsafe scope, context);
  let state_rc = IsolateState::get(scope);

  let module_global = v8::Global::new(scope, module);
  let (name, main) = {
    let state = state_rc.borrow();
    let info = state
      .modules
      .get_info_by_handle(module.get_identity_hash().get(), &module_global)
      .expect("Module not found");
    (info.name.clone(), info.main)
  };

  let url_key = v8::String::new(scope, "url").unwrap();
  let url_val = v8::String::new(scope, &name).unwrap();
  meta.create_data_property(scope, url_key.into(), url_val.into());

  let main_key = v8::String::new(scope, "main").unwrap();
  let main_val = v8::Boolean::new(scope, main);
  meta.create_data_property(scope, main_key.into(), main_val.into());
}

pub extern "C" fn promise_reject_callback(message: v8::PromiseRejectMessage) {
  // SAFETY: `CallbackScope` can be safely constructed from `&PromiseRejectMessage`
  v8::callback_scope!(unsafe scope, &message);

  let state_rc = IsolateState::get(scope);
  let promise = message.get_promise();
  let promise_global = v8::Global::new(scope, promise);

  match message.get_event() {
    v8::PromiseRejectEvent::PromiseRejectWithNoHandler => {
      let error = message
        .get_value()
        .unwrap_or_else(|| v8::undefined(scope).into());
      let error_global = v8::Global::new(scope, error);
      state_rc
        .borrow_mut()
        .pending_promise_exceptions
        .insert(promise_global, error_global);
    }
    v8::PromiseRejectEvent::PromiseHandlerAddedAfterReject => {
      state_rc
        .borrow_mut()
        .pending_promise_exceptions
        .shift_remove(&promise_global);
    }
    v8::PromiseRejectEvent::PromiseRejectAfterResolved => {}
    v8::PromiseRejectEvent::PromiseResolveAfterResolved => {
      // Should not warn. See #1272
    }
  }
}

/// `ArrayBuffer` deleter for memory the host keeps ownership of.
pub(crate) unsafe extern "C" fn nop_deleter(
  _data: *mut c_void,
  _byte_length: usize,
  _deleter_data: *mut c_void,
) {
}
