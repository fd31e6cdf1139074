// Copyright 2018-2026 the Deno authors. MIT license.

//! An isolate embedding layer on top of V8: buffers that cross the
//! host/script boundary, `Deno.core.send`/`recv` dispatch, ES module
//! registration and startup snapshots.

mod arena;
mod bindings;
mod bridge;
mod buf;
mod dispatch;
mod error;
mod flags;
mod isolate;
mod js_errors;
mod modules;
mod snapshot;

// Re-exports
pub use serde_json;
pub use v8;

pub use crate::arena::ArenaHandle;
pub use crate::arena::ArenaPin;
pub use crate::arena::BufferArena;
pub use crate::arena::RelinquishError;
pub use crate::bridge::PinnedBuf;
pub use crate::bridge::SCRATCH_BUF_SIZE;
pub use crate::buf::DenoBuf;
pub use crate::dispatch::DispatchError;
pub use crate::dispatch::ReceiveHandler;
pub use crate::dispatch::Request;
pub use crate::dispatch::RequestId;
pub use crate::error::CoreError;
pub use crate::error::ExportError;
pub use crate::flags::v8_init;
pub use crate::flags::v8_set_flags;
pub use crate::flags::v8_version;
pub use crate::isolate::Isolate;
pub use crate::isolate::IsolateConfig;
pub use crate::isolate::IsolateHandle;
pub use crate::isolate::IsolateRef;
pub use crate::isolate::js_check;
pub use crate::js_errors::JsError;
pub use crate::js_errors::JsStackFrame;
pub use crate::modules::DynImportId;
pub use crate::modules::DynamicImportHandler;
pub use crate::modules::ModuleId;
pub use crate::modules::ResolveHandler;
pub use crate::snapshot::Snapshot;
pub use crate::snapshot::SnapshotData;
pub use crate::snapshot::SnapshotSidecar;
