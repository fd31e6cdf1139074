// Copyright 2018-2026 the Deno authors. MIT license.

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::error::CoreError;

/// Bumped whenever the sidecar layout changes.
pub(crate) const SNAPSHOT_FORMAT: u32 = 1;

const ULEN: usize = std::mem::size_of::<u64>();

/// Startup data for `IsolateConfig::load_snapshot`.
pub enum Snapshot {
  Static(&'static [u8]),
  Boxed(Box<[u8]>),
}

impl Snapshot {
  pub fn as_bytes(&self) -> &[u8] {
    match self {
      Snapshot::Static(b) => b,
      Snapshot::Boxed(b) => b,
    }
  }
}

impl From<&'static [u8]> for Snapshot {
  fn from(b: &'static [u8]) -> Self {
    Snapshot::Static(b)
  }
}

impl From<Box<[u8]>> for Snapshot {
  fn from(b: Box<[u8]>) -> Self {
    Snapshot::Boxed(b)
  }
}

impl From<Vec<u8>> for Snapshot {
  fn from(b: Vec<u8>) -> Self {
    Snapshot::Boxed(b.into_boxed_slice())
  }
}

/// Host side state that travels with the V8 startup data.
pub trait SnapshotData: Sized {
  fn serialize(&self) -> Bytes;
  fn deserialize(bytes: &Bytes) -> Result<Self, CoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSidecar {
  pub format: u32,
  /// Fingerprint of the external reference table the blob was made with.
  pub layout: u64,
  /// Context data index of the `Deno.core.recv` callback, if one was set.
  pub recv_cb: Option<u32>,
}

impl SnapshotData for SnapshotSidecar {
  fn serialize(&self) -> Bytes {
    // A struct of plain integers always serializes.
    Bytes::from(bincode::serialize(self).unwrap_or_default())
  }

  fn deserialize(bytes: &Bytes) -> Result<Self, CoreError> {
    let sidecar: SnapshotSidecar = bincode::deserialize(bytes)
      .map_err(|e| CoreError::InvalidSnapshot(e.to_string()))?;
    if sidecar.format != SNAPSHOT_FORMAT {
      return Err(CoreError::InvalidSnapshot(format!(
        "unsupported format {}",
        sidecar.format
      )));
    }
    Ok(sidecar)
  }
}

/// Lays out `[v8 data][sidecar][v8 data length as u64 LE]`.
pub(crate) fn serialize(
  v8_data: &[u8],
  sidecar: &impl SnapshotData,
) -> Box<[u8]> {
  let sidecar = sidecar.serialize();
  let mut data = Vec::with_capacity(v8_data.len() + sidecar.len() + ULEN);
  data.extend_from_slice(v8_data);
  data.extend_from_slice(&sidecar);
  data.extend_from_slice(&(v8_data.len() as u64).to_le_bytes());
  data.into_boxed_slice()
}

/// Splits a blob made by [`serialize`] back into V8 data and sidecar.
pub(crate) fn deconstruct<T: SnapshotData>(
  blob: &[u8],
) -> Result<(&[u8], T), CoreError> {
  if blob.len() < ULEN {
    return Err(CoreError::InvalidSnapshot("blob too short".to_string()));
  }
  let (rest, trailer) = blob.split_at(blob.len() - ULEN);
  let mut len_bytes = [0u8; ULEN];
  len_bytes.copy_from_slice(trailer);
  let v8_len = u64::from_le_bytes(len_bytes) as usize;
  if v8_len == 0 || v8_len > rest.len() {
    return Err(CoreError::InvalidSnapshot(format!(
      "bad startup data length {v8_len}"
    )));
  }
  let (v8_data, sidecar) = rest.split_at(v8_len);
  let sidecar = T::deserialize(&Bytes::copy_from_slice(sidecar))?;
  Ok((v8_data, sidecar))
}

/// Checks a sidecar against the binding layout of the running isolate.
pub(crate) fn check_layout(
  sidecar: &SnapshotSidecar,
  expected: u64,
) -> Result<(), CoreError> {
  if sidecar.layout != expected {
    return Err(CoreError::SnapshotLayoutMismatch {
      expected,
      found: sidecar.layout,
    });
  }
  Ok(())
}
