// Copyright 2018-2026 the Deno authors. MIT license.

use crate::js_errors::JsError;

#[derive(Debug, thiserror::Error, deno_error::JsError)]
pub enum CoreError {
  #[class(generic)]
  #[error(transparent)]
  Js(#[from] JsError),
  #[class(inherit)]
  #[error(transparent)]
  Export(#[from] ExportError),
  #[class(type)]
  #[error("Cannot load a snapshot into an isolate that will be snapshotted")]
  SnapshotWhileSnapshotting,
  #[class(type)]
  #[error("Invalid snapshot: {0}")]
  InvalidSnapshot(String),
  #[class(type)]
  #[error(
    "Snapshot was created with a different binding layout (expected {expected:#x}, found {found:#x})"
  )]
  SnapshotLayoutMismatch { expected: u64, found: u64 },
  #[class(generic)]
  #[error("V8 failed to create a snapshot blob")]
  SnapshotFailed,
  #[class(type)]
  #[error("Global \"{0}\" is not an ArrayBufferView")]
  NotABufferView(String),
}

impl CoreError {
  /// The underlying script exception, if this error came from V8.
  pub fn as_js_error(&self) -> Option<&JsError> {
    match self {
      CoreError::Js(e) => Some(e),
      _ => None,
    }
  }
}

/// Failures while moving an engine buffer back to the host.
#[derive(Debug, thiserror::Error, deno_error::JsError, PartialEq, Eq)]
#[class(type)]
pub enum ExportError {
  #[error("ArrayBufferView has no backing ArrayBuffer")]
  NoBuffer,
  #[error("ArrayBuffer is already detached")]
  Detached,
  #[error("ArrayBuffer is not detachable")]
  NotDetachable,
  #[error("ArrayBuffer is still referenced by {0} in-flight request(s)")]
  Pinned(usize),
}
