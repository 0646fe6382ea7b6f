//! Mirror role: a replica that only advances on data from the authority.
//!
//! On construction it subscribes to the broadcast event `X` and issues one
//! `get-X` call. Whichever of the two answers first initializes the mirror.
//! Every inbound value is applied and announced without an equality check;
//! the authority already deduplicates.
//!
//! Calls issued while the transport is down are the transport's business.
//! Nothing here buffers or replays a write.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{decode, encode, Role, Shared, Syncable, SyncedValue};
use crate::error::Result;
use crate::transport::{get_method, set_method, set_params, ClientTransport, Payload};

impl<T: Syncable> SyncedValue<T> {
    /// Mirror of the authoritative value `name` reachable through `client`
    pub fn mirror<C>(client: C, name: impl Into<String>) -> Self
    where
        C: ClientTransport + 'static,
    {
        let name = name.into();
        let client: Arc<dyn ClientTransport> = Arc::new(client);
        let value = Self::from_parts(
            name.clone(),
            Role::Mirror {
                client: client.clone(),
            },
        );

        let weak = Arc::downgrade(&value.shared);
        client.subscribe(
            &name,
            Arc::new(move |payload: Payload| match weak.upgrade() {
                Some(shared) => {
                    apply_remote(&shared, payload, "broadcast");
                    true
                }
                None => false,
            }),
        );

        let weak = Arc::downgrade(&value.shared);
        let event = name.clone();
        client.call(
            &get_method(&name),
            None,
            Box::new(move |result: Result<Payload>| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(payload) => apply_remote(&shared, payload, "initial fetch"),
                    Err(e) => {
                        debug!(name = %event, error = %e, "initial fetch failed, value unchanged")
                    }
                }
            }),
        );

        value
    }
}

fn apply_remote<T: Syncable>(shared: &Shared<T>, payload: Payload, source: &'static str) {
    match decode::<T>(payload) {
        Ok(next) => {
            debug!(name = %shared.name, source, present = next.is_some(), "applying remote value");
            shared.holder.set_local_value(next);
            shared.holder.propagate_change();
        }
        Err(e) => warn!(name = %shared.name, source, error = %e, "dropping undecodable value"),
    }
}

/// Ask the authority to apply `next`. Local state is left alone; the
/// outcome, if any, comes back as a broadcast.
pub(super) fn apply_write<T: Syncable>(
    shared: &Shared<T>,
    client: &dyn ClientTransport,
    next: Option<T>,
) -> Result<()> {
    let payload = encode(next.as_ref())?;
    let name = shared.name.clone();
    client.call(
        &set_method(&shared.name),
        Some(set_params(payload)),
        Box::new(move |result: Result<Payload>| {
            if let Err(e) = result {
                warn!(%name, error = %e, "change request failed");
            }
        }),
    );
    Ok(())
}
