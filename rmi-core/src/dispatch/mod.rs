//! The dispatch table.
//!
//! Every handler derived with [`RemoteFunction`](crate::handler::RemoteFunction)
//! or [`RemoteMethod`](crate::handler::RemoteMethod) contributes one
//! [`HandlerEntry`] to a linker-collected slice. At first use the entries are
//! indexed by [`HandlerId`], a hash of the handler's stable name, into a
//! read-only [`DispatchTable`] that every receive path consults without
//! locking.
//!
//! # Implementation details
//!
//! Each entry carries a monomorphized function pointer that decodes the
//! argument value from the packet body, runs the handler, and encodes its
//! return value. Looking up an id that no entry claims means the two ends of
//! the connection were built from different handler sets; the receive path
//! treats that as fatal.
use std::{any::type_name, collections::HashMap, sync::OnceLock};

use anyhow::anyhow;
use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::error;

use crate::{
    __private::HANDLERS,
    handler::{CallContext, Function, Method},
};

pub(crate) mod multiplexer;

/// Wire identifier of a handler.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HandlerId(pub u64);

impl HandlerId {
    /// Derives the identifier from a stable handler name.
    pub fn of(name: &str) -> Self {
        let hash = blake3::hash(name.as_bytes());
        let mut id = [0u8; 8];
        id.copy_from_slice(&hash.as_bytes()[..8]);
        Self(u64::from_le_bytes(id))
    }
}

/// Decodes arguments, runs a handler and encodes its output.
pub type DispatchFn = fn(CallContext, Bytes) -> BoxFuture<'static, anyhow::Result<Bytes>>;

/// A registered handler.
pub struct HandlerEntry {
    pub name: &'static str,
    pub dispatch: DispatchFn,
}

impl HandlerEntry {
    pub const fn function<F: Function>() -> Self {
        Self {
            name: F::NAME,
            dispatch: dispatch_function::<F>,
        }
    }

    pub const fn method<M: Method>() -> Self {
        Self {
            name: M::NAME,
            dispatch: dispatch_method::<M>,
        }
    }
}

fn dispatch_function<F: Function>(
    ctx: CallContext,
    args: Bytes,
) -> BoxFuture<'static, anyhow::Result<Bytes>> {
    Box::pin(async move {
        let args: F::Args = ctx.serializer().from_bytes(&args)?;
        let output = F::default().call(&ctx, args).await?;
        ctx.encode(&output)
    })
}

fn dispatch_method<M: Method>(
    ctx: CallContext,
    args: Bytes,
) -> BoxFuture<'static, anyhow::Result<Bytes>> {
    Box::pin(async move {
        let core = ctx.object_core()?.clone();
        let object = core.owner::<M::Object>().ok_or_else(|| {
            anyhow!(
                "object {} is not a {}, cannot run {}",
                core.id(),
                type_name::<M::Object>(),
                M::NAME
            )
        })?;
        let args: M::Args = ctx.serializer().from_bytes(&args)?;
        let output = M::default().call(&object, &ctx, args).await?;
        ctx.encode(&output)
    })
}

/// Read-only mapping from [`HandlerId`] to handler.
pub struct DispatchTable {
    handlers: HashMap<HandlerId, &'static HandlerEntry>,
}

impl DispatchTable {
    /// The table of every handler linked into this binary.
    pub fn global() -> &'static Self {
        static TABLE: OnceLock<DispatchTable> = OnceLock::new();
        TABLE.get_or_init(|| Self::from_entries(HANDLERS.iter()))
    }

    /// # Panics
    ///
    /// Two distinct names hashing to the same id cannot be told apart on the
    /// wire and abort table construction.
    fn from_entries(entries: impl IntoIterator<Item = &'static HandlerEntry>) -> Self {
        let mut handlers = HashMap::new();
        for entry in entries {
            let id = HandlerId::of(entry.name);
            if let Some(previous) = handlers.insert(id, entry) {
                error!(first = previous.name, second = entry.name, ?id, "handler id collision");
                panic!("handlers {} and {} share id {id:?}", previous.name, entry.name);
            }
        }
        Self { handlers }
    }

    pub fn lookup(&self, id: HandlerId) -> Option<&'static HandlerEntry> {
        self.handlers.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;

    use super::*;
    use crate::handler::{RemoteFunction, RemoteHandler};

    #[derive(RemoteFunction, Default)]
    #[rmi(internal)]
    struct Echo;

    #[async_trait]
    impl Function for Echo {
        type Args = String;
        type Output = String;

        async fn call(&self, _ctx: &CallContext, args: String) -> anyhow::Result<String> {
            Ok(args)
        }
    }

    #[test]
    fn it_names_handlers_by_module_path() {
        assert_eq!(Echo::NAME, concat!(module_path!(), "::Echo"));
        assert_eq!(Echo::id(), HandlerId::of(Echo::NAME));
    }

    #[test]
    fn it_registers_derived_handlers() {
        let table = DispatchTable::global();
        let entry = table.lookup(Echo::id()).expect("Echo is registered");
        assert_eq!(entry.name, Echo::NAME);
        assert!(table.lookup(HandlerId::of("no::such::Handler")).is_none());
    }

    #[test]
    fn it_derives_distinct_stable_ids() {
        assert_eq!(HandlerId::of("a::B"), HandlerId::of("a::B"));
        assert_ne!(HandlerId::of("a::B"), HandlerId::of("a::C"));
    }
}
