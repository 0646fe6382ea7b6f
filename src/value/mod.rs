//! Value synchronization core.
//!
//! A [`ValueHolder`] owns the current value (possibly absent), its change
//! listeners and its one-shot init listeners. A [`SyncedValue`] wires a
//! holder to a transport in one of two roles:
//!
//! - **Authority**: the only side that accepts writes. A write is applied,
//!   announced to local change listeners and then broadcast, unless the
//!   equality predicate says nothing changed, in which case nothing at all
//!   happens.
//! - **Mirror**: never mutates its copy on write. It forwards a change
//!   request to the authority and only advances when a broadcast or the
//!   initial fetch delivers data.
//!
//! ```text
//! mirror.set_value(v) ──call set-X──▶ authority: equal? ──no──▶ apply, notify, emit X
//!                                                                         │
//! mirror listeners ◀── apply, notify ◀────────── broadcast X ◀────────────┘
//! ```

pub mod authority;
pub mod equality;
pub mod mirror;

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::transport::{ClientTransport, Payload, ServerTransport};

pub use equality::Equality;

/// Listener invoked with the new value on every applied update
pub type ChangeListener<T> = Arc<dyn Fn(Option<&T>) + Send + Sync>;

/// Listener invoked exactly once, with the first present value
pub type InitListener<T> = Box<dyn FnOnce(Option<&T>) + Send>;

/// Values that can travel between authority and mirrors
pub trait Syncable: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Syncable for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

struct Slot<T> {
    value: Option<T>,
    initialized: bool,
    change_listeners: Vec<ChangeListener<T>>,
    init_listeners: Vec<InitListener<T>>,
}

/// The value slot plus the init/change notification protocol.
///
/// The internal lock is never held while a listener runs, so listeners may
/// read or write the holder they are attached to. A panicking listener
/// unwinds into whoever triggered the notification and the remaining
/// listeners of that event are skipped.
pub struct ValueHolder<T> {
    slot: Mutex<Slot<T>>,
}

impl<T> Default for ValueHolder<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                initialized: false,
                change_listeners: Vec::new(),
                init_listeners: Vec::new(),
            }),
        }
    }
}

impl<T: Clone> ValueHolder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value, `None` while absent
    pub fn get_value(&self) -> Option<T> {
        self.slot.lock().value.clone()
    }

    /// Current value, or `default` while absent
    pub fn get_value_or(&self, default: T) -> T {
        self.get_value().unwrap_or(default)
    }

    /// Whether a present value has ever been stored. Never reverts.
    pub fn is_initialized(&self) -> bool {
        self.slot.lock().initialized
    }

    /// Run `f` against the current value without cloning it
    pub fn with_value<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        f(self.slot.lock().value.as_ref())
    }

    /// Call `listener` on every applied update. Not invoked on registration.
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(Option<&T>) + Send + Sync + 'static,
    {
        self.slot.lock().change_listeners.push(Arc::new(listener));
    }

    /// Call `listener` once with the current value: right now if the holder
    /// is already initialized, otherwise when the first present value lands.
    pub fn on_init<F>(&self, listener: F)
    where
        F: FnOnce(Option<&T>) + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if slot.initialized {
            let current = slot.value.clone();
            drop(slot);
            listener(current.as_ref());
        } else {
            slot.init_listeners.push(Box::new(listener));
        }
    }

    /// Overwrite the slot. The first present value flips `initialized` and
    /// drains the init listeners. Change listeners are not touched.
    pub(crate) fn set_local_value(&self, value: Option<T>) {
        let mut slot = self.slot.lock();
        slot.value = value;
        if slot.initialized || slot.value.is_none() {
            return;
        }
        slot.initialized = true;
        let listeners = std::mem::take(&mut slot.init_listeners);
        let current = slot.value.clone();
        drop(slot);

        for listener in listeners {
            listener(current.as_ref());
        }
    }

    /// Notify every change listener, in registration order, with the
    /// current value.
    pub(crate) fn propagate_change(&self) {
        let (listeners, current) = {
            let slot = self.slot.lock();
            (slot.change_listeners.clone(), slot.value.clone())
        };
        for listener in listeners {
            listener(current.as_ref());
        }
    }
}

enum Role<T> {
    Authority {
        server: Arc<dyn ServerTransport>,
        equality: Equality<T>,
        /// Write sequence number. Held for the whole compare, apply,
        /// notify and emit step so broadcasts leave in apply order.
        writes: ReentrantMutex<Cell<u64>>,
    },
    Mirror {
        client: Arc<dyn ClientTransport>,
    },
}

struct Shared<T> {
    name: String,
    holder: ValueHolder<T>,
    role: Role<T>,
}

/// A named value bound to a transport, as authority or as mirror.
///
/// Cloning is cheap and every clone observes the same value. Transport
/// registrations only hold weak references: once the last clone is
/// dropped, the procedures answer `null` and broadcasts are ignored.
pub struct SyncedValue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SyncedValue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Syncable + fmt::Debug> fmt::Debug for SyncedValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncedValue")
            .field("name", &self.shared.name)
            .field("authority", &self.is_authority())
            .field("value", &self.get_value())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl<T: Syncable> SyncedValue<T> {
    fn from_parts(name: String, role: Role<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                holder: ValueHolder::new(),
                role,
            }),
        }
    }

    /// Name shared by the broadcast event and both procedures
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_authority(&self) -> bool {
        matches!(self.shared.role, Role::Authority { .. })
    }

    /// The underlying holder, for read access and listener registration
    pub fn holder(&self) -> &ValueHolder<T> {
        &self.shared.holder
    }

    pub fn get_value(&self) -> Option<T> {
        self.shared.holder.get_value()
    }

    pub fn get_value_or(&self, default: T) -> T {
        self.shared.holder.get_value_or(default)
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.holder.is_initialized()
    }

    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(Option<&T>) + Send + Sync + 'static,
    {
        self.shared.holder.on_change(listener)
    }

    pub fn on_init<F>(&self, listener: F)
    where
        F: FnOnce(Option<&T>) + Send + 'static,
    {
        self.shared.holder.on_init(listener)
    }

    /// Write a new value with the semantics of this side's role.
    ///
    /// Fails only when the value cannot be encoded, before anything changed.
    pub fn set_value(&self, value: T) -> Result<()> {
        self.apply_write(Some(value))
    }

    /// Write "absent", subject to the same rules as any other write
    pub fn reset_value(&self) -> Result<()> {
        self.apply_write(None)
    }

    fn apply_write(&self, value: Option<T>) -> Result<()> {
        match &self.shared.role {
            Role::Authority {
                server,
                equality,
                writes,
            } => authority::apply_write(&self.shared, server.as_ref(), equality, writes, value),
            Role::Mirror { client } => mirror::apply_write(&self.shared, client.as_ref(), value),
        }
    }
}

/// Absent travels as `null`.
fn encode<T: Serialize>(value: Option<&T>) -> Result<Payload> {
    match value {
        Some(value) => Ok(serde_json::to_value(value)?),
        None => Ok(Payload::Null),
    }
}

fn decode<T: DeserializeOwned>(payload: Payload) -> Result<Option<T>> {
    match payload {
        Payload::Null => Ok(None),
        payload => Ok(Some(serde_json::from_value(payload)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Seen<T> = Arc<Mutex<Vec<Option<T>>>>;

    fn recorder<T: Clone + Send + 'static>() -> (Seen<T>, impl Fn(Option<&T>) + Send + Sync + 'static)
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |v: Option<&T>| sink.lock().push(v.cloned()))
    }

    #[test]
    fn test_absent_is_not_zero() {
        let holder = ValueHolder::<u32>::new();
        assert_eq!(holder.get_value(), None);
        assert_eq!(holder.get_value_or(7), 7);
        assert!(!holder.is_initialized());

        holder.set_local_value(Some(0));
        assert_eq!(holder.get_value(), Some(0));
        assert_eq!(holder.get_value_or(7), 0);
        assert!(holder.is_initialized());
    }

    #[test]
    fn test_init_fires_once_with_first_value() {
        let holder = ValueHolder::<u32>::new();
        let (seen, listener) = recorder();
        holder.on_init(listener);

        holder.set_local_value(None);
        assert!(seen.lock().is_empty());
        assert!(!holder.is_initialized());

        holder.set_local_value(Some(1));
        holder.set_local_value(Some(2));
        holder.set_local_value(None);
        holder.set_local_value(Some(3));
        assert_eq!(*seen.lock(), vec![Some(1)]);
    }

    #[test]
    fn test_late_init_fires_immediately() {
        let holder = ValueHolder::<u32>::new();
        holder.set_local_value(Some(5));

        let (seen, listener) = recorder();
        holder.on_init(listener);
        assert_eq!(*seen.lock(), vec![Some(5)]);

        // initialized never reverts, so late listeners see the reset value
        holder.set_local_value(None);
        assert!(holder.is_initialized());
        let (seen, listener) = recorder();
        holder.on_init(listener);
        assert_eq!(*seen.lock(), vec![None]);
    }

    #[test]
    fn test_set_local_value_does_not_notify_change() {
        let holder = ValueHolder::<u32>::new();
        let (seen, listener) = recorder();
        holder.on_change(listener);
        holder.set_local_value(Some(1));
        assert!(seen.lock().is_empty());

        holder.propagate_change();
        assert_eq!(*seen.lock(), vec![Some(1)]);
    }

    #[test]
    fn test_propagate_change_never_fires_init() {
        let holder = ValueHolder::<u32>::new();
        let (seen, listener) = recorder();
        holder.on_init(listener);
        holder.propagate_change();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_listener_order_and_duplicates() {
        let holder = ValueHolder::<u32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "a"] {
            let order = order.clone();
            holder.on_change(move |_| order.lock().push(tag));
        }
        holder.set_local_value(Some(1));
        holder.propagate_change();
        assert_eq!(*order.lock(), vec!["a", "b", "a"]);
    }

    #[test]
    fn test_listener_may_reenter_holder() {
        let holder = Arc::new(ValueHolder::<u32>::new());
        let reads = Arc::new(AtomicUsize::new(0));
        {
            let inner = holder.clone();
            let reads = reads.clone();
            holder.on_change(move |v| {
                assert_eq!(inner.get_value().as_ref(), v);
                reads.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let inner = holder.clone();
            holder.on_init(move |_| {
                inner.on_init(|v| assert_eq!(v, Some(&9)));
            });
        }
        holder.set_local_value(Some(9));
        holder.propagate_change();
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_skips_the_rest() {
        let holder = Arc::new(ValueHolder::<u32>::new());
        let after = Arc::new(AtomicUsize::new(0));
        holder.on_change(|_| panic!("listener failed"));
        {
            let after = after.clone();
            holder.on_change(move |_| {
                after.fetch_add(1, Ordering::SeqCst);
            });
        }
        holder.set_local_value(Some(1));

        let h = holder.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            h.propagate_change()
        }));
        assert!(result.is_err());
        assert_eq!(after.load(Ordering::SeqCst), 0);
        // the holder stays usable
        assert_eq!(holder.get_value(), Some(1));
    }

    #[test]
    fn test_codec_absent_is_null() {
        assert_eq!(encode::<u32>(None).unwrap(), Payload::Null);
        assert_eq!(encode(Some(&3u32)).unwrap(), serde_json::json!(3));
        assert_eq!(decode::<u32>(Payload::Null).unwrap(), None);
        assert_eq!(decode::<u32>(serde_json::json!(3)).unwrap(), Some(3));
        assert!(decode::<u32>(serde_json::json!("three")).is_err());
    }
}
