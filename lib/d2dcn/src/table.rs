//! Shared-table broker contract. The broker itself (membership, gossip,
//! master election) is an external collaborator; the library only consumes
//! this interface. `MemoryBroker` is an in-process implementation wiring
//! several coordinators together, used by tests and the demo binaries.

use hashbrown::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Callbacks delivered by the broker when any participant's table changes.
/// `data` is a payload sequence whose first element is a JSON blob.
pub trait TableEvents: Send + Sync {
    fn on_new_table_entry(&self, client: &str, key: &str, data: &[String]);
    fn on_update_table_entry(&self, client: &str, key: &str, data: &[String]);
    fn on_remove_table_entry(&self, client: &str, key: &str);
}

/// Minimal broker surface consumed by the library. An empty `data` sequence
/// passed to `update_table_entry` removes the entry.
pub trait SharedTable: Send + Sync {
    fn client_id(&self) -> String;
    fn update_table_entry(&self, key: &str, data: &[String]) -> bool;
    fn master_ip(&self) -> String;
    /// Snapshot of every participant's table: client id → key → payloads.
    fn map_data(&self) -> HashMap<String, HashMap<String, Vec<String>>>;
    fn set_observer(&self, observer: Arc<dyn TableEvents>);
    fn start(&self);
    fn stop(&self);
}

/// Hub shared by a set of in-process broker clients.
pub struct MemoryHub {
    state: Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    entries: HashMap<String, HashMap<String, Vec<String>>>,
    clients: Vec<Weak<MemoryBroker>>,
}

enum TableEvent<'a> {
    New(&'a [String]),
    Update(&'a [String]),
    Remove,
}

impl MemoryHub {
    pub fn new() -> Arc<MemoryHub> {
        Arc::new(MemoryHub {
            state: Mutex::new(HubState::default()),
        })
    }

    /// Creates a new stopped client attached to this hub.
    pub fn client(self: &Arc<Self>, id: &str) -> Arc<MemoryBroker> {
        let broker = Arc::new(MemoryBroker {
            hub: self.clone(),
            id: id.to_string(),
            observer: Mutex::new(None),
            running: AtomicBool::new(false),
        });

        let mut state = self.lock();
        state.clients.push(Arc::downgrade(&broker));
        broker
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Observers of every running client, the caller included; the adapters
    /// filter their own events by client id.
    fn observers(state: &mut HubState) -> Vec<Arc<dyn TableEvents>> {
        let mut observers = Vec::new();
        state.clients.retain(|slot| match slot.upgrade() {
            Some(client) => {
                if client.running.load(Ordering::Relaxed) {
                    if let Some(observer) = client.observer() {
                        observers.push(observer);
                    }
                }
                true
            }
            None => false,
        });
        observers
    }

    fn dispatch(observers: &[Arc<dyn TableEvents>], origin: &str, key: &str, event: &TableEvent<'_>) {
        for observer in observers {
            match event {
                TableEvent::New(data) => observer.on_new_table_entry(origin, key, data),
                TableEvent::Update(data) => observer.on_update_table_entry(origin, key, data),
                TableEvent::Remove => observer.on_remove_table_entry(origin, key),
            }
        }
    }
}

/// One participant of a `MemoryHub`.
pub struct MemoryBroker {
    hub: Arc<MemoryHub>,
    id: String,
    observer: Mutex<Option<Arc<dyn TableEvents>>>,
    running: AtomicBool,
}

impl MemoryBroker {
    fn observer(&self) -> Option<Arc<dyn TableEvents>> {
        match self.observer.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl SharedTable for MemoryBroker {
    fn client_id(&self) -> String {
        self.id.clone()
    }

    fn update_table_entry(&self, key: &str, data: &[String]) -> bool {
        if !self.running.load(Ordering::Relaxed) {
            return false;
        }

        let (observers, event) = {
            let mut state = self.hub.lock();
            let table = state.entries.entry(self.id.clone()).or_default();

            let event = if data.is_empty() {
                if table.remove(key).is_none() {
                    return true;
                }
                TableEvent::Remove
            } else if table.insert(key.to_string(), data.to_vec()).is_none() {
                TableEvent::New(data)
            } else {
                TableEvent::Update(data)
            };

            (MemoryHub::observers(&mut state), event)
        };

        MemoryHub::dispatch(&observers, &self.id, key, &event);
        true
    }

    fn master_ip(&self) -> String {
        "127.0.0.1".to_string()
    }

    fn map_data(&self) -> HashMap<String, HashMap<String, Vec<String>>> {
        self.hub.lock().entries.clone()
    }

    fn set_observer(&self, observer: Arc<dyn TableEvents>) {
        let mut slot = match self.observer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(observer);
    }

    /// Marks the client live and replays the other participants' current
    /// entries to its observer, the way a broker hands a joiner the table.
    fn start(&self) {
        self.running.store(true, Ordering::Relaxed);

        let replay: Vec<(String, String, Vec<String>)> = {
            let state = self.hub.lock();
            state
                .entries
                .iter()
                .filter(|(client, _)| client.as_str() != self.id)
                .flat_map(|(client, table)| {
                    table
                        .iter()
                        .map(move |(key, data)| (client.clone(), key.clone(), data.clone()))
                })
                .collect()
        };

        if let Some(observer) = self.observer() {
            for (client, key, data) in replay {
                observer.on_new_table_entry(&client, &key, &data);
            }
        }
    }

    /// Evicts this client's entries and notifies the remaining participants.
    fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);

        let (observers, keys) = {
            let mut state = self.hub.lock();
            let keys: Vec<String> = state
                .entries
                .remove(&self.id)
                .map(|table| table.into_iter().map(|(key, _)| key).collect())
                .unwrap_or_default();

            (MemoryHub::observers(&mut state), keys)
        };

        for key in keys {
            MemoryHub::dispatch(&observers, &self.id, &key, &TableEvent::Remove);
        }
    }
}
