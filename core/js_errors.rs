// Copyright 2018-2026 the Deno authors. MIT license.

// V8 reports 1-indexed line and column numbers for messages and stack frames;
// they are passed through unchanged.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// A `JsError` represents an exception coming from V8, with stack frames and
/// line numbers. Its JSON form is what the C API hands to the host as the
/// "last exception".
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsError {
  pub message: String,
  pub source_line: Option<String>,
  pub script_resource_name: Option<String>,
  pub line_number: Option<i64>,
  pub start_position: i64,
  pub end_position: i64,
  pub error_level: i64,
  pub start_column: i64,
  pub end_column: i64,
  pub is_shared_cross_origin: bool,
  pub is_opaque: bool,
  pub frames: Vec<JsStackFrame>,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsStackFrame {
  pub line: i64,
  pub column: i64,
  pub function_name: Option<String>,
  pub script_name: Option<String>,
  pub is_eval: bool,
  pub is_constructor: bool,
  pub is_wasm: bool,
}

impl JsError {
  pub fn from_v8_exception(
    scope: &mut v8::PinScope,
    exception: v8::Local<v8::Value>,
  ) -> Self {
    let msg = v8::Exception::create_message(scope, exception);
    Self::from_v8_message(scope, msg)
  }

  pub fn from_v8_message(
    scope: &mut v8::PinScope,
    msg: v8::Local<v8::Message>,
  ) -> Self {
    let message = msg.get(scope).to_rust_string_lossy(scope);
    let source_line = msg
      .get_source_line(scope)
      .map(|v| v.to_rust_string_lossy(scope));
    let script_resource_name = msg
      .get_script_resource_name(scope)
      .and_then(|v| v8::Local::<v8::String>::try_from(v).ok())
      .map(|v| v.to_rust_string_lossy(scope));
    let line_number = msg.get_line_number(scope).map(|v| v as i64);

    let mut frames = vec![];
    if let Some(stack_trace) = msg.get_stack_trace(scope) {
      for i in 0..stack_trace.get_frame_count() {
        let Some(frame) = stack_trace.get_frame(scope, i) else {
          continue;
        };
        let function_name = frame
          .get_function_name(scope)
          .map(|s| s.to_rust_string_lossy(scope))
          .filter(|s| !s.is_empty());
        let script_name = frame
          .get_script_name(scope)
          .map(|s| s.to_rust_string_lossy(scope));
        frames.push(JsStackFrame {
          line: frame.get_line_number() as i64,
          column: frame.get_column() as i64,
          function_name,
          script_name,
          is_eval: frame.is_eval(),
          is_constructor: frame.is_constructor(),
          is_wasm: frame.is_wasm(),
        });
      }
    }

    Self {
      message,
      source_line,
      script_resource_name,
      line_number,
      start_position: msg.get_start_position() as i64,
      end_position: msg.get_end_position() as i64,
      error_level: msg.error_level() as i64,
      start_column: msg.get_start_column() as i64,
      end_column: msg.get_end_column() as i64,
      is_shared_cross_origin: msg.is_shared_cross_origin(),
      is_opaque: msg.is_opaque(),
      frames,
    }
  }

  pub fn to_json(&self) -> String {
    // Serializing plain strings, numbers and bools can not fail.
    serde_json::to_string(self).unwrap_or_default()
  }

  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }
}

impl std::error::Error for JsError {}

impl fmt::Display for JsError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    if let (Some(name), Some(line)) =
      (&self.script_resource_name, self.line_number)
    {
      write!(f, "{}:{}:{}", name, line, self.start_column + 1)?;
      if let Some(source_line) = &self.source_line {
        write!(f, "\n{}\n", source_line)?;
        let mut s = String::new();
        for i in 0..self.end_column {
          s.push(if i >= self.start_column { '^' } else { ' ' });
        }
        writeln!(f, "{}", s)?;
      } else {
        writeln!(f)?;
      }
    }

    write!(f, "{}", self.message)?;

    for frame in &self.frames {
      let location = format!(
        "{}:{}:{}",
        frame.script_name.as_deref().unwrap_or("<anonymous>"),
        frame.line,
        frame.column
      );
      match &frame.function_name {
        Some(name) => write!(f, "\n    at {} ({})", name, location)?,
        None => write!(f, "\n    at {}", location)?,
      }
    }
    Ok(())
  }
}
