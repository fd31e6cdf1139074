// Copyright 2018-2026 the Deno authors. MIT license.

use std::sync::Once;

/// Initializes the V8 platform once per process. Every `Isolate::new` calls
/// this, so hosts only need it to set up V8 ahead of time.
pub fn v8_init() {
  static DENO_INIT: Once = Once::new();
  DENO_INIT.call_once(|| {
    let platform = v8::new_default_platform(0, false).make_shared();
    v8::V8::initialize_platform(platform);
    v8::V8::initialize();
    log::debug!("V8 {} initialized", v8::VERSION_STRING);
  });
}

/// Pass the command line arguments to v8.
/// Returns a vector of command line arguments that V8 did not understand.
pub fn v8_set_flags(args: Vec<String>) -> Vec<String> {
  v8::V8::set_flags_from_command_line(args)
}

pub fn v8_version() -> &'static str {
  v8::VERSION_STRING
}
