use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::model::SessionState;
use crate::protocol::{Device, DeviceError};

/// Console output forwarded from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceLogEvent {
    pub device: Device,
    pub method: String,
    pub payload: Vec<Value>,
}

/// Runtime error reported by a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceErrorEvent {
    pub error: DeviceError,
    pub device: Option<Device>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Join,
    Leave,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DevicePresenceEvent {
    pub device: Device,
    pub status: PresenceStatus,
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Entries<T> = Arc<parking_lot::Mutex<Vec<(u64, Callback<T>)>>>;

/// Ordered set of callbacks for one event kind. Dispatch walks a
/// snapshot of the registration list, so removing a listener during
/// dispatch never skips the ones registered after it at the same tick.
pub(crate) struct ListenerSet<T> {
    entries: Entries<T>,
    next_id: AtomicU64,
}

impl<T> Default for ListenerSet<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(parking_lot::Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T: 'static> ListenerSet<T> {
    pub fn add(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().push((id, Arc::new(callback)));
        let entries = Arc::downgrade(&self.entries);
        ListenerHandle {
            remove: Box::new(move || {
                if let Some(entries) = Weak::upgrade(&entries) {
                    entries.lock().retain(|(entry_id, _)| *entry_id != id);
                }
            }),
        }
    }

    pub fn dispatch(&self, event: &T) {
        let snapshot: Vec<Callback<T>> = self
            .entries
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }
}

/// Registration receipt; dropping it does nothing, calling [`remove`]
/// unregisters the callback.
///
/// [`remove`]: ListenerHandle::remove
pub struct ListenerHandle {
    remove: Box<dyn FnOnce() + Send>,
}

impl ListenerHandle {
    pub fn remove(self) {
        (self.remove)();
    }
}

/// All listener sets a session dispatches to.
#[derive(Default)]
pub(crate) struct Listeners {
    pub error: ListenerSet<DeviceErrorEvent>,
    pub log: ListenerSet<DeviceLogEvent>,
    pub presence: ListenerSet<DevicePresenceEvent>,
    pub state: ListenerSet<SessionState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn dispatch_runs_in_registration_order() {
        let set: ListenerSet<u32> = ListenerSet::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            set.add(move |value: &u32| seen.lock().unwrap().push((tag, *value)));
        }

        set.dispatch(&7);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", 7), ("second", 7), ("third", 7)]
        );
    }

    #[test]
    fn removal_stops_future_dispatch() {
        let set: ListenerSet<u32> = ListenerSet::default();
        let count = Arc::new(Mutex::new(0));
        let handle = {
            let count = count.clone();
            set.add(move |_| *count.lock().unwrap() += 1)
        };

        set.dispatch(&1);
        handle.remove();
        set.dispatch(&2);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn removal_during_dispatch_does_not_skip_later_listeners() {
        let set: Arc<ListenerSet<u32>> = Arc::new(ListenerSet::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handle_slot: Arc<Mutex<Option<ListenerHandle>>> = Arc::new(Mutex::new(None));
        {
            let handle_slot_for_closure = handle_slot.clone();
            let seen = seen.clone();
            let handle = set.add(move |value: &u32| {
                seen.lock().unwrap().push(("self-removing", *value));
                // Unregister ourselves mid-dispatch.
                if let Some(handle) = handle_slot_for_closure.lock().unwrap().take() {
                    handle.remove();
                }
            });
            *handle_slot.lock().unwrap() = Some(handle);
        }
        {
            let seen = seen.clone();
            set.add(move |value: &u32| seen.lock().unwrap().push(("later", *value)));
        }

        set.dispatch(&1);
        set.dispatch(&2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("self-removing", 1), ("later", 1), ("later", 2)]
        );
    }
}
