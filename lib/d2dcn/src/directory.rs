//! Endpoint directory adapter: translates shared-table callbacks into typed
//! add/update/remove events and owns the weak cache of live proxies.
//!
//! Proxies are created lazily by the `get_available_*` scans; directory
//! events for a UID without a live proxy only carry the identity. A live
//! proxy is reconfigured in place, so a UID keeps resolving to the same
//! object for as long as any user holds it.

use crate::command::{CommandDescriptor, CommandInterface};
use crate::info::{InfoDescriptor, InfoReader};
use crate::logging;
use crate::path::{self, Mode, Uid};
use crate::table::{SharedTable, TableEvents};
use indexmap::IndexMap;
use regex::Regex;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

const SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// Callback slot payload for directory events.
pub type UidCallback = Box<dyn Fn(&Uid) + Send>;

#[derive(Default)]
struct EventSlots {
    command_add: Option<UidCallback>,
    command_update: Option<UidCallback>,
    command_remove: Option<UidCallback>,
    info_add: Option<UidCallback>,
    info_update: Option<UidCallback>,
    info_remove: Option<UidCallback>,
}

#[derive(Default)]
struct ProxyCache {
    commands: IndexMap<String, Weak<CommandInterface>>,
    readers: IndexMap<String, Weak<InfoReader>>,
}

pub struct Directory {
    table: Arc<dyn SharedTable>,
    own_client: String,
    cache: Mutex<ProxyCache>,
    events: Mutex<EventSlots>,
    log: logging::Logger,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Directory {
    pub(crate) fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        table: Arc<dyn SharedTable>,
        log: L,
    ) -> Arc<Directory> {
        Arc::new(Directory {
            own_client: table.client_id(),
            table,
            cache: Mutex::new(ProxyCache::default()),
            events: Mutex::new(EventSlots::default()),
            log: logging::child(log),
        })
    }

    pub(crate) fn set_command_add(&self, callback: Option<UidCallback>) {
        lock(&self.events).command_add = callback;
    }

    pub(crate) fn set_command_update(&self, callback: Option<UidCallback>) {
        lock(&self.events).command_update = callback;
    }

    pub(crate) fn set_command_remove(&self, callback: Option<UidCallback>) {
        lock(&self.events).command_remove = callback;
    }

    pub(crate) fn set_info_add(&self, callback: Option<UidCallback>) {
        lock(&self.events).info_add = callback;
    }

    pub(crate) fn set_info_update(&self, callback: Option<UidCallback>) {
        lock(&self.events).info_update = callback;
    }

    pub(crate) fn set_info_remove(&self, callback: Option<UidCallback>) {
        lock(&self.events).info_remove = callback;
    }

    fn emit<F>(&self, select: F, uid: &Uid)
    where
        F: Fn(&EventSlots) -> &Option<UidCallback>,
    {
        let slots = lock(&self.events);
        if let Some(callback) = select(&slots) {
            callback(uid);
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(data: &[String]) -> Option<T> {
        serde_json::from_str(data.first()?).ok()
    }

    /// Scans the directory snapshot for commands matching the query,
    /// instantiating proxies for unseen UIDs. With `wait` set, the scan
    /// repeats until at least one match appears or the deadline expires.
    pub(crate) fn get_available_commands(
        &self,
        name: &str,
        service: &str,
        category: &str,
        mac: &str,
        wait: Option<Duration>,
    ) -> Vec<Arc<CommandInterface>> {
        let pattern = path::create_regex_path(mac, service, category, Mode::Command, name);
        let regex = match Regex::new(&pattern) {
            Ok(regex) => regex,
            Err(_) => return Vec::new(),
        };

        self.poll(wait, || self.scan_commands(&regex))
    }

    /// Mirror of `get_available_commands` for info readers.
    pub(crate) fn get_available_info_readers(
        &self,
        name: &str,
        service: &str,
        category: &str,
        mac: &str,
        wait: Option<Duration>,
    ) -> Vec<Arc<InfoReader>> {
        let pattern = path::create_regex_path(mac, service, category, Mode::Info, name);
        let regex = match Regex::new(&pattern) {
            Ok(regex) => regex,
            Err(_) => return Vec::new(),
        };

        self.poll(wait, || self.scan_readers(&regex))
    }

    fn poll<T, F: Fn() -> Vec<T>>(&self, wait: Option<Duration>, scan: F) -> Vec<T> {
        let deadline = wait.map(|wait| Instant::now() + wait);

        loop {
            let found = scan();
            if !found.is_empty() {
                return found;
            }

            match deadline {
                Some(deadline) if Instant::now() < deadline => thread::sleep(SCAN_INTERVAL),
                _ => return found,
            }
        }
    }

    fn scan_commands(&self, regex: &Regex) -> Vec<Arc<CommandInterface>> {
        let snapshot = self.table.map_data();
        let mut cache = lock(&self.cache);
        let mut found = Vec::new();

        for (client, entries) in snapshot.iter() {
            if client.as_str() == self.own_client {
                continue;
            }

            for (key, data) in entries.iter() {
                if !regex.is_match(key) {
                    continue;
                }

                let uid = match path::extract_path_info(key) {
                    Some(uid) if uid.mode == Mode::Command => uid,
                    _ => continue,
                };

                if let Some(proxy) = cache.commands.get(key.as_str()).and_then(Weak::upgrade) {
                    found.push(proxy);
                    continue;
                }

                let descriptor: CommandDescriptor = match Self::parse(data) {
                    Some(descriptor) => descriptor,
                    None => {
                        logging::debug!(self.log, "undecodable command descriptor";
                                        "context" => "scan", "key" => key.as_str());
                        continue;
                    }
                };

                let proxy = Arc::new(CommandInterface::new(
                    uid.mac,
                    uid.service,
                    uid.category,
                    uid.name,
                    &descriptor,
                    &self.log,
                ));
                cache.commands.insert(key.clone(), Arc::downgrade(&proxy));
                found.push(proxy);
            }
        }

        cache.commands.retain(|_, weak| weak.strong_count() > 0);
        found
    }

    fn scan_readers(&self, regex: &Regex) -> Vec<Arc<InfoReader>> {
        let snapshot = self.table.map_data();
        let mut cache = lock(&self.cache);
        let mut found = Vec::new();

        for (client, entries) in snapshot.iter() {
            if client.as_str() == self.own_client {
                continue;
            }

            for (key, data) in entries.iter() {
                if !regex.is_match(key) {
                    continue;
                }

                let uid = match path::extract_path_info(key) {
                    Some(uid) if uid.mode == Mode::Info => uid,
                    _ => continue,
                };

                if let Some(reader) = cache.readers.get(key.as_str()).and_then(Weak::upgrade) {
                    found.push(reader);
                    continue;
                }

                let descriptor: InfoDescriptor = match Self::parse(data) {
                    Some(descriptor) => descriptor,
                    None => {
                        logging::debug!(self.log, "undecodable info descriptor";
                                        "context" => "scan", "key" => key.as_str());
                        continue;
                    }
                };

                let reader = Arc::new(InfoReader::new(
                    uid.mac,
                    uid.service,
                    uid.category,
                    uid.name,
                    descriptor.value_type,
                    &self.log,
                ));
                reader.configure(Some((descriptor.ip, descriptor.req_port, descriptor.update_port)));
                cache.readers.insert(key.clone(), Arc::downgrade(&reader));
                found.push(reader);
            }
        }

        cache.readers.retain(|_, weak| weak.strong_count() > 0);
        found
    }

    /// One descriptor change: a live proxy is reconfigured and reported as an
    /// update, an unseen UID is reported as an add.
    fn entry_changed(&self, client: &str, key: &str, data: &[String]) {
        if client == self.own_client {
            return;
        }

        let uid = match path::extract_path_info(key) {
            Some(uid) => uid,
            None => return,
        };

        match uid.mode {
            Mode::Command => {
                let descriptor: CommandDescriptor = match Self::parse(data) {
                    Some(descriptor) => descriptor,
                    None => return,
                };

                let live = lock(&self.cache).commands.get(key).and_then(Weak::upgrade);
                match live {
                    Some(proxy) => {
                        proxy.configure(&descriptor);
                        self.emit(|slots| &slots.command_update, &uid);
                    }
                    None => self.emit(|slots| &slots.command_add, &uid),
                }
            }
            Mode::Info => {
                let descriptor: InfoDescriptor = match Self::parse(data) {
                    Some(descriptor) => descriptor,
                    None => return,
                };

                let live = lock(&self.cache).readers.get(key).and_then(Weak::upgrade);
                match live {
                    Some(reader) => {
                        reader.configure(Some((
                            descriptor.ip,
                            descriptor.req_port,
                            descriptor.update_port,
                        )));
                        self.emit(|slots| &slots.info_update, &uid);
                    }
                    None => self.emit(|slots| &slots.info_add, &uid),
                }
            }
        }
    }
}

impl TableEvents for Directory {
    fn on_new_table_entry(&self, client: &str, key: &str, data: &[String]) {
        self.entry_changed(client, key, data);
    }

    fn on_update_table_entry(&self, client: &str, key: &str, data: &[String]) {
        self.entry_changed(client, key, data);
    }

    fn on_remove_table_entry(&self, client: &str, key: &str) {
        if client == self.own_client {
            return;
        }

        let uid = match path::extract_path_info(key) {
            Some(uid) => uid,
            None => return,
        };

        match uid.mode {
            Mode::Command => {
                let live = lock(&self.cache).commands.get(key).and_then(Weak::upgrade);
                if let Some(proxy) = live {
                    proxy.shutdown();
                }
                self.emit(|slots| &slots.command_remove, &uid);
            }
            Mode::Info => {
                let live = lock(&self.cache).readers.get(key).and_then(Weak::upgrade);
                if let Some(reader) = live {
                    reader.configure(None);
                }
                self.emit(|slots| &slots.info_remove, &uid);
            }
        }
    }
}
