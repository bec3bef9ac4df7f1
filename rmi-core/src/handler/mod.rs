//! Remote handler traits.
//!
//! A handler is a unit struct describing one remotely callable function or
//! distributed-object method. Implementing [`Function`] or [`Method`] defines
//! its argument and return types and its body; deriving [`RemoteFunction`] or
//! [`RemoteMethod`] registers it with every binary that links it, under a
//! stable name (`module_path::TypeName`). The name, not a pointer, is what
//! both ends of a call agree on.
//!
//! Arguments travel as a single [`Serializable`] value, typically a tuple.
//! Handlers that return nothing use `()`, which makes every request answerable
//! with a uniform (empty) reply.
//!
//! ```
//! use rmi::handler::{CallContext, Function, RemoteFunction};
//! use rmi::async_trait;
//!
//! #[derive(RemoteFunction, Default)]
//! struct AddOne;
//!
//! #[async_trait]
//! impl Function for AddOne {
//!     type Args = u64;
//!     type Output = u64;
//!
//!     async fn call(&self, _ctx: &CallContext, x: u64) -> anyhow::Result<u64> {
//!         Ok(x + 1)
//!     }
//! }
//! ```
//!
//! Methods run against the local instance of a
//! [`DistObject`](crate::control::DistObject):
//!
//! ```
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use rmi::handler::{CallContext, Method, RemoteMethod};
//! use rmi::async_trait;
//!
//! #[derive(Default)]
//! struct Counter(AtomicU64);
//!
//! #[derive(RemoteMethod, Default)]
//! struct Increment;
//!
//! #[async_trait]
//! impl Method for Increment {
//!     type Object = Counter;
//!     type Args = u64;
//!     type Output = ();
//!
//!     async fn call(&self, counter: &Counter, _ctx: &CallContext, by: u64) -> anyhow::Result<()> {
//!         counter.0.fetch_add(by, Ordering::Relaxed);
//!         Ok(())
//!     }
//! }
//! ```
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Serialize;

use crate::{
    control::{object::ObjectCore, DistributedControl, ObjectId},
    dispatch::HandlerId,
    packet::{PacketHeader, PacketMask, ProcId},
    serializer::{Serializable, Serializer},
};

pub mod error;
pub use error::{Result, RpcError};
pub use rmi_handler_derive::{RemoteFunction, RemoteMethod};

/// Build-time identity of a handler. Implemented by the derive macros.
pub trait RemoteHandler: Send + Sync + 'static {
    /// Stable wire name of the handler.
    const NAME: &'static str;

    /// Dispatch identifier derived from [`Self::NAME`].
    fn id() -> HandlerId;
}

/// A free function callable on any node.
#[async_trait]
pub trait Function: RemoteHandler + Default {
    type Args: Serializable;
    type Output: Serializable;

    async fn call(&self, ctx: &CallContext, args: Self::Args) -> anyhow::Result<Self::Output>;
}

/// A method of a distributed object, invoked on the target node's instance.
#[async_trait]
pub trait Method: RemoteHandler + Default {
    type Object: Send + Sync + 'static;
    type Args: Serializable;
    type Output: Serializable;

    async fn call(
        &self,
        object: &Self::Object,
        ctx: &CallContext,
        args: Self::Args,
    ) -> anyhow::Result<Self::Output>;
}

/// Everything a handler knows about the call it is servicing.
#[derive(Clone)]
pub struct CallContext {
    pub(crate) dc: DistributedControl,
    pub(crate) header: PacketHeader,
    pub(crate) object: Option<Arc<ObjectCore>>,
}

impl CallContext {
    /// The local session, for issuing further calls.
    pub fn dc(&self) -> &DistributedControl {
        &self.dc
    }

    /// The node that issued the call.
    pub fn source(&self) -> ProcId {
        self.header.src
    }

    /// This node.
    pub fn procid(&self) -> ProcId {
        self.dc.procid()
    }

    pub fn sequentialization_key(&self) -> u8 {
        self.header.key
    }

    pub fn is_control(&self) -> bool {
        self.header.mask.is_control()
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        self.object.as_ref().map(|core| core.id())
    }

    /// The serializer the arguments were encoded with.
    pub fn serializer(&self) -> Serializer {
        self.dc.inner.serializer_for(self.header.mask)
    }

    pub(crate) fn encode<T: Serialize>(&self, value: &T) -> anyhow::Result<bytes::Bytes> {
        self.serializer().to_bytes(value)
    }

    /// The distributed object a method call was addressed to.
    pub(crate) fn object_core(&self) -> anyhow::Result<&Arc<ObjectCore>> {
        self.object
            .as_ref()
            .ok_or_else(|| anyhow!("call from node {} carries no object id", self.source()))
    }

    pub(crate) fn mask(&self) -> PacketMask {
        self.header.mask
    }
}
