// Copyright 2018-2026 the Deno authors. MIT license.

//! Request bookkeeping for `Deno.core.send` and `Isolate::respond`.

use std::collections::HashMap;

use crate::bridge::PinnedBuf;
use crate::buf::DenoBuf;

pub type RequestId = u32;

/// A message sent from script. `control` is only valid for the duration of
/// the handler call. The memory behind `data` stays valid until the request
/// is answered, even after the handler drops its `PinnedBuf`.
pub struct Request<'a> {
  pub id: RequestId,
  pub control: &'a [u8],
  pub data: Option<PinnedBuf>,
}

/// Host side receiver of `Deno.core.send`.
///
/// Returning `Some` answers the request synchronously: the buffer becomes the
/// return value of `send` and the id is retired. Returning `None` leaves the
/// request pending until `Isolate::respond` is called with its id.
pub trait ReceiveHandler {
  fn recv(&mut self, req: Request<'_>) -> Option<DenoBuf>;
}

impl<F> ReceiveHandler for F
where
  F: FnMut(Request<'_>) -> Option<DenoBuf>,
{
  fn recv(&mut self, req: Request<'_>) -> Option<DenoBuf> {
    self(req)
  }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error, deno_error::JsError)]
#[class(type)]
pub enum DispatchError {
  #[error("Deno.core.send can not be called from inside the receive handler")]
  Reentrant,
  #[error("Deno.core.send called on an isolate without a receive handler")]
  NoHandler,
}

/// Entry kept for every request that was not answered synchronously. It
/// holds the request's data buffer, so the memory the host was handed stays
/// valid even if script detaches or transfers the buffer.
pub(crate) type PendingData = Option<PinnedBuf>;

pub(crate) struct Dispatcher {
  handler: Option<Box<dyn ReceiveHandler>>,
  next_request_id: RequestId,
  in_send: bool,
  pending: HashMap<RequestId, PendingData>,
}

impl Dispatcher {
  pub fn new(handler: Option<Box<dyn ReceiveHandler>>) -> Self {
    Self {
      handler,
      next_request_id: 1,
      in_send: false,
      pending: HashMap::new(),
    }
  }

  /// Allocates the next request id and lends out the handler. Every
  /// successful `begin` must be paired with `finish`.
  pub fn begin(
    &mut self,
  ) -> Result<(RequestId, Box<dyn ReceiveHandler>), DispatchError> {
    if self.in_send {
      return Err(DispatchError::Reentrant);
    }
    let handler = self.handler.take().ok_or(DispatchError::NoHandler)?;
    self.in_send = true;
    let id = self.next_request_id;
    // Id 0 is reserved as "no request".
    self.next_request_id = self.next_request_id.checked_add(1).unwrap_or(1);
    Ok((id, handler))
  }

  pub fn finish(&mut self, handler: Box<dyn ReceiveHandler>) {
    debug_assert!(self.in_send);
    self.in_send = false;
    self.handler = Some(handler);
  }

  /// Records a request that will be answered later.
  pub fn track(&mut self, id: RequestId, data: PendingData) {
    let prev = self.pending.insert(id, data);
    assert!(prev.is_none(), "request id {id} reused while pending");
  }

  /// Retires a pending request.
  ///
  /// Panics for ids that were never issued, were answered synchronously, or
  /// were already responded to.
  pub fn complete(&mut self, id: RequestId) -> PendingData {
    match self.pending.remove(&id) {
      Some(data) => data,
      None => panic!("respond called with unknown request id {id}"),
    }
  }

  pub fn pending_count(&self) -> usize {
    self.pending.len()
  }
}
