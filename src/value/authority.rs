//! Authoritative role: the single source of truth for a named value.
//!
//! On construction it declares the broadcast event `X` and registers
//! `get-X` and `set-X`. Writes, local or requested by a mirror, go through
//! the equality gate: an equal value produces no mutation, no notification
//! and no broadcast. Writes from different threads (including `set-X`
//! calls served on separate connections) are serialized, so the last one
//! applied is also the last one broadcast. A listener writing back from
//! inside a notification supersedes the write that triggered it, and only
//! the newer value is broadcast.

use std::cell::Cell;
use std::sync::Arc;

use parking_lot::ReentrantMutex;

use tracing::{debug, trace};

use super::{decode, encode, Equality, Role, Shared, Syncable, SyncedValue};
use crate::error::{Error, Result};
use crate::transport::{get_method, set_method, value_param, Payload, ServerTransport};

impl<T: Syncable> SyncedValue<T> {
    /// Authority comparing writes with `PartialEq`
    pub fn authority<S>(server: S, name: impl Into<String>) -> Self
    where
        S: ServerTransport + 'static,
        T: PartialEq,
    {
        Self::authority_with(server, name, Equality::partial_eq())
    }

    /// Authority with a custom equality predicate, e.g. [`Equality::json`]
    /// for composite values without `PartialEq`
    pub fn authority_with<S>(server: S, name: impl Into<String>, equality: Equality<T>) -> Self
    where
        S: ServerTransport + 'static,
    {
        let name = name.into();
        let server: Arc<dyn ServerTransport> = Arc::new(server);
        let value = Self::from_parts(
            name.clone(),
            Role::Authority {
                server: server.clone(),
                equality,
                writes: ReentrantMutex::new(Cell::new(0)),
            },
        );

        server.declare_event(&name);

        let weak = Arc::downgrade(&value.shared);
        server.register(
            &get_method(&name),
            Arc::new(move |_params: Option<Payload>| match weak.upgrade() {
                Some(shared) => shared.holder.with_value(|current| encode(current)),
                None => Ok(Payload::Null),
            }),
        );

        let weak = Arc::downgrade(&value.shared);
        server.register(
            &set_method(&name),
            Arc::new(move |params: Option<Payload>| {
                let Some(shared) = weak.upgrade() else {
                    return Ok(Payload::Null);
                };
                let next = decode::<T>(value_param(params)?)
                    .map_err(|e| Error::InvalidParams(e.to_string()))?;
                SyncedValue { shared }.apply_write(next)?;
                Ok(Payload::Null)
            }),
        );

        debug!(%name, "authoritative value registered");
        value
    }
}

/// Apply `next` if it differs from the current value: store it, notify
/// local listeners, then broadcast it.
///
/// A listener must not wait on a write made by another thread: that
/// writer is queued behind the one notifying.
pub(super) fn apply_write<T: Syncable>(
    shared: &Shared<T>,
    server: &dyn ServerTransport,
    equality: &Equality<T>,
    writes: &ReentrantMutex<Cell<u64>>,
    next: Option<T>,
) -> Result<()> {
    let sequence = writes.lock();
    if shared
        .holder
        .with_value(|current| equality.matches(current, next.as_ref()))
    {
        trace!(name = %shared.name, "write dropped, value unchanged");
        return Ok(());
    }

    let payload = encode(next.as_ref())?;
    let write = sequence.get() + 1;
    sequence.set(write);
    debug!(name = %shared.name, write, present = next.is_some(), "applying write");
    shared.holder.set_local_value(next);
    shared.holder.propagate_change();

    if sequence.get() != write {
        trace!(name = %shared.name, write, "superseded by a listener write, not broadcast");
        return Ok(());
    }
    server.emit(&shared.name, payload);
    Ok(())
}
