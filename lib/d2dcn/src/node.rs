//! Top-level coordinator: holds the node identity, registers local commands
//! and info writers, publishes their descriptors into the directory and
//! exposes discovery plus the directory event callbacks.

use crate::command::{
    tcp_worker, to_indented_json, udp_worker, CommandContext, CommandDescriptor, CommandInterface,
    CommandProtocol,
};
use crate::directory::{Directory, UidCallback};
use crate::info::{InfoReader, InfoWriter};
use crate::logging;
use crate::net::tcp::TcpServer;
use crate::net::udp::UdpListener;
use crate::path::{create_uid, Mode, Uid};
use crate::route;
use crate::table::SharedTable;
use crate::types::{FieldSchema, ValueType};
use crate::category;
use hashbrown::HashMap;
use serde_json;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

enum CommandListener {
    Udp(Arc<UdpListener>),
    Tcp(Arc<TcpServer>),
}

impl CommandListener {
    fn close(&self) {
        match self {
            CommandListener::Udp(sock) => sock.close(),
            CommandListener::Tcp(sock) => sock.close(),
        }
    }
}

struct CommandRegistration {
    ctx: Arc<CommandContext>,
    descriptor: CommandDescriptor,
    path: String,
    listener: CommandListener,
    worker: Option<JoinHandle<()>>,
}

struct InfoRegistration {
    writer: Arc<InfoWriter>,
    path: String,
}

#[derive(Default)]
struct Registered {
    commands: HashMap<String, CommandRegistration>,
    writers: HashMap<String, InfoRegistration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The node identity mac: the host's node id as a bare lowercase hex
/// integer. Falls back to the process id when no interface reports one.
fn host_mac() -> String {
    match mac_address::get_mac_address() {
        Ok(Some(address)) => {
            let mut node: u64 = 0;
            for byte in address.bytes().iter() {
                node = (node << 8) | u64::from(*byte);
            }
            format!("{:x}", node)
        }
        _ => format!("{:x}", std::process::id()),
    }
}

/// The default service name: the current process image, stripped at the
/// first dot.
fn process_service() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|name| name.to_string_lossy().into_owned()))
        .and_then(|name| name.split('.').next().map(str::to_string))
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// One participant of the control network. Commands and info writers are
/// registered here; discovery of other participants' endpoints goes through
/// `get_available_commands` / `get_available_info_readers`.
pub struct Node {
    mac: String,
    service: String,
    table: Arc<dyn SharedTable>,
    directory: Arc<Directory>,
    registered: Mutex<Registered>,
    log: logging::Logger,
}

impl Node {
    /// Creates a node bound to a broker client. `service` overrides the
    /// process-image default.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        table: Arc<dyn SharedTable>,
        service: Option<&str>,
        log: L,
    ) -> Node {
        let log = logging::child(log);
        let directory = Directory::new(table.clone(), &log);
        table.set_observer(directory.clone());

        Node {
            mac: host_mac(),
            service: service.map(str::to_string).unwrap_or_else(process_service),
            table,
            directory,
            registered: Mutex::new(Registered::default()),
            log,
        }
    }

    #[inline]
    pub fn mac(&self) -> &str {
        &self.mac
    }

    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn start(&self) {
        self.table.start();
    }

    pub fn stop(&self) {
        self.table.stop();
    }

    /// The source address this host uses to reach the broker master; the
    /// address every published descriptor advertises.
    pub fn own_ip(&self) -> String {
        route::source_ip_for(&self.table.master_ip())
    }

    /// Registers a command served by `callback` and publishes its
    /// descriptor. Rejects a name already registered on this node.
    pub fn add_service_command<F>(
        &self,
        callback: F,
        name: &str,
        input: FieldSchema,
        output: FieldSchema,
        category: &str,
        enable: bool,
        timeout_secs: u64,
        protocol: CommandProtocol,
    ) -> bool
    where
        F: Fn(&serde_json::Map<String, serde_json::Value>) -> serde_json::Value + Send + Sync + 'static,
    {
        let mut registered = lock(&self.registered);
        if registered.commands.contains_key(name) {
            logging::warn!(self.log, "command name already registered";
                           "context" => "add_service_command",
                           "name" => name);
            return false;
        }

        let category = if category.is_empty() {
            category::GENERIC
        } else {
            category
        };

        let ctx = Arc::new(CommandContext {
            run: AtomicBool::new(true),
            enable: AtomicBool::new(enable),
            input: input.clone(),
            output: output.clone(),
            callback: Box::new(callback),
            log: self.log.new(logging::o!()),
        });

        let (listener, port, worker) = match protocol {
            CommandProtocol::JsonUdp => {
                let sock = match UdpListener::bind() {
                    Ok(sock) => Arc::new(sock),
                    Err(err) => {
                        logging::warn!(self.log, "listener bind failed";
                                       "context" => "add_service_command",
                                       "name" => name,
                                       "error" => %err);
                        return false;
                    }
                };

                let port = sock.port();
                let worker = {
                    let sock = sock.clone();
                    let ctx = ctx.clone();
                    thread::spawn(move || udp_worker(sock, ctx))
                };
                (CommandListener::Udp(sock), port, worker)
            }
            CommandProtocol::JsonTcp => {
                let sock = match TcpServer::bind() {
                    Ok(sock) => Arc::new(sock),
                    Err(err) => {
                        logging::warn!(self.log, "listener bind failed";
                                       "context" => "add_service_command",
                                       "name" => name,
                                       "error" => %err);
                        return false;
                    }
                };

                let port = sock.port();
                let worker = {
                    let sock = sock.clone();
                    let ctx = ctx.clone();
                    thread::spawn(move || tcp_worker(sock, ctx))
                };
                (CommandListener::Tcp(sock), port, worker)
            }
        };

        let descriptor = CommandDescriptor {
            protocol,
            ip: self.own_ip(),
            port,
            input,
            output,
            enable,
            timeout: timeout_secs,
        };

        let path = create_uid(&self.mac, &self.service, category, Mode::Command, name);
        let published = self.publish(&path, &descriptor);

        logging::info!(self.log, "command registered";
                       "context" => "add_service_command",
                       "path" => &path,
                       "port" => port,
                       "published" => published);

        registered.commands.insert(
            name.to_string(),
            CommandRegistration {
                ctx,
                descriptor,
                path,
                listener,
                worker: Some(worker),
            },
        );

        published
    }

    /// Flips a registered command's enable flag and republishes the
    /// descriptor; remote proxies pick the change up as a directory update.
    pub fn enable_command(&self, name: &str, enable: bool) -> bool {
        let mut registered = lock(&self.registered);

        let registration = match registered.commands.get_mut(name) {
            Some(registration) => registration,
            None => return false,
        };

        registration.ctx.enable.store(enable, Ordering::Relaxed);
        registration.descriptor.enable = enable;

        let descriptor = registration.descriptor.clone();
        let path = registration.path.clone();
        self.publish(&path, &descriptor)
    }

    /// Tears one command down: worker stopped and joined, descriptor removed
    /// from the directory.
    pub fn remove_service_command(&self, name: &str) -> bool {
        let mut registration = match lock(&self.registered).commands.remove(name) {
            Some(registration) => registration,
            None => return false,
        };

        registration.ctx.run.store(false, Ordering::Relaxed);
        registration.listener.close();
        if let Some(worker) = registration.worker.take() {
            drop(worker.join());
        }

        self.table.update_table_entry(&registration.path, &[])
    }

    /// Creates an info writer and publishes its descriptor. The returned
    /// handle is what sets values; it stays live past the node if held.
    pub fn add_info_writer(
        &self,
        name: &str,
        value_type: ValueType,
        category_name: &str,
        protocol: &str,
    ) -> Option<Arc<InfoWriter>> {
        let mut registered = lock(&self.registered);
        if registered.writers.contains_key(name) {
            logging::warn!(self.log, "info name already registered";
                           "context" => "add_info_writer",
                           "name" => name);
            return None;
        }

        let category_name = if category_name.is_empty() {
            category::GENERIC
        } else {
            category_name
        };

        let own_ip = self.own_ip();
        let iface = own_ip.parse::<Ipv4Addr>().unwrap_or(Ipv4Addr::UNSPECIFIED);

        let writer = match InfoWriter::new(
            self.mac.clone(),
            self.service.clone(),
            category_name.to_string(),
            name.to_string(),
            value_type,
            protocol.to_string(),
            iface,
            &self.log,
        ) {
            Ok(writer) => Arc::new(writer),
            Err(err) => {
                logging::warn!(self.log, "writer setup failed";
                               "context" => "add_info_writer",
                               "name" => name,
                               "error" => %err);
                return None;
            }
        };

        let path = create_uid(&self.mac, &self.service, category_name, Mode::Info, name);
        let descriptor = writer.descriptor(own_ip);
        let payload =
            to_indented_json(&serde_json::to_value(&descriptor).expect("Error encoding descriptor"));

        if !self.table.update_table_entry(&path, &[payload]) {
            logging::warn!(self.log, "descriptor publish failed";
                           "context" => "add_info_writer",
                           "path" => &path);
            return None;
        }

        logging::info!(self.log, "info writer registered";
                       "context" => "add_info_writer",
                       "path" => &path);

        registered.writers.insert(
            name.to_string(),
            InfoRegistration {
                writer: writer.clone(),
                path,
            },
        );

        Some(writer)
    }

    /// Removes an info writer's directory entry and drops the node's handle;
    /// remote readers go offline on the removal event.
    pub fn remove_info_writer(&self, name: &str) -> bool {
        let registration = match lock(&self.registered).writers.remove(name) {
            Some(registration) => registration,
            None => return false,
        };

        self.table.update_table_entry(&registration.path, &[])
    }

    pub fn get_available_commands(
        &self,
        name: &str,
        service: &str,
        category: &str,
        mac: &str,
        wait: Option<Duration>,
    ) -> Vec<Arc<CommandInterface>> {
        self.directory
            .get_available_commands(name, service, category, mac, wait)
    }

    pub fn get_available_info_readers(
        &self,
        name: &str,
        service: &str,
        category: &str,
        mac: &str,
        wait: Option<Duration>,
    ) -> Vec<Arc<InfoReader>> {
        self.directory
            .get_available_info_readers(name, service, category, mac, wait)
    }

    pub fn on_command_add(&self, callback: Option<UidCallback>) {
        self.directory.set_command_add(callback);
    }

    pub fn on_command_update(&self, callback: Option<UidCallback>) {
        self.directory.set_command_update(callback);
    }

    pub fn on_command_remove(&self, callback: Option<UidCallback>) {
        self.directory.set_command_remove(callback);
    }

    pub fn on_info_add(&self, callback: Option<UidCallback>) {
        self.directory.set_info_add(callback);
    }

    pub fn on_info_update(&self, callback: Option<UidCallback>) {
        self.directory.set_info_update(callback);
    }

    pub fn on_info_remove(&self, callback: Option<UidCallback>) {
        self.directory.set_info_remove(callback);
    }

    /// The UID a local command would be published under; useful to correlate
    /// directory events with local registrations.
    pub fn command_uid(&self, category_name: &str, name: &str) -> Uid {
        let category_name = if category_name.is_empty() {
            category::GENERIC
        } else {
            category_name
        };

        Uid {
            mac: self.mac.clone(),
            service: self.service.clone(),
            mode: Mode::Command,
            category: category_name.to_string(),
            name: name.to_string(),
        }
    }

    fn publish(&self, path: &str, descriptor: &CommandDescriptor) -> bool {
        let payload =
            to_indented_json(&serde_json::to_value(descriptor).expect("Error encoding descriptor"));
        self.table.update_table_entry(path, &[payload])
    }
}

impl Drop for Node {
    /// Broker client down first so peers see the eviction, then every
    /// command worker: run flags, sockets, joins, in that order.
    fn drop(&mut self) {
        self.table.stop();

        let mut registered = lock(&self.registered);

        for registration in registered.commands.values() {
            registration.ctx.run.store(false, Ordering::Relaxed);
            registration.listener.close();
        }

        for registration in registered.commands.values_mut() {
            if let Some(worker) = registration.worker.take() {
                drop(worker.join());
            }
        }

        registered.writers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::MemoryHub;
    use crate::types::{FieldDef, Value};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    fn int_schema(name: &str) -> FieldSchema {
        let mut schema = FieldSchema::new();
        schema.insert(name.to_string(), FieldDef::mandatory(ValueType::Int));
        schema
    }

    fn echo(args: &serde_json::Map<String, serde_json::Value>) -> serde_json::Value {
        serde_json::Value::Object(args.clone())
    }

    fn pair() -> (Node, Node) {
        let hub = MemoryHub::new();
        let a = Node::new(hub.client("a") as Arc<dyn SharedTable>, Some("svc_a"), None);
        let b = Node::new(hub.client("b") as Arc<dyn SharedTable>, Some("svc_b"), None);
        a.start();
        b.start();
        (a, b)
    }

    fn args(name: &str, value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        let mut args = serde_json::Map::new();
        args.insert(name.to_string(), value);
        args
    }

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_command_register_and_call() {
        let (a, b) = pair();

        assert!(a.add_service_command(
            echo,
            "cmd",
            int_schema("arg1"),
            int_schema("arg1"),
            "test",
            true,
            5,
            CommandProtocol::JsonUdp,
        ));

        let proxies = b.get_available_commands("cmd", "", "", "", WAIT);
        assert_eq!(proxies.len(), 1);
        let proxy = &proxies[0];
        assert_eq!(proxy.name(), "cmd");
        assert_eq!(proxy.service(), "svc_a");
        assert_eq!(proxy.category(), "test");

        let response = proxy.call(&args("arg1", json!(42)), None);
        assert!(response.success());
        assert_eq!(response.get("arg1"), Some(&json!(42)));
    }

    #[test]
    fn test_enable_disable_propagates() {
        let (a, b) = pair();

        a.add_service_command(
            echo,
            "cmd",
            int_schema("arg1"),
            int_schema("arg1"),
            "",
            true,
            5,
            CommandProtocol::JsonUdp,
        );

        let proxy = b.get_available_commands("cmd", "", "", "", WAIT).pop().unwrap();
        assert!(proxy.enable());

        assert!(a.enable_command("cmd", false));
        assert!(wait_for(|| !proxy.enable()));

        let response = proxy.call(&args("arg1", json!(1)), None);
        assert!(!response.success());
        assert_eq!(response.error(), Some("Command not enable"));

        assert!(a.enable_command("cmd", true));
        assert!(wait_for(|| proxy.enable()));

        let response = proxy.call(&args("arg1", json!(1)), None);
        assert!(response.success());
    }

    #[test]
    fn test_info_roundtrip_int_and_float_array() {
        let (a, b) = pair();

        let level = a
            .add_info_writer("level", ValueType::Int, "test", crate::INFO_PROTOCOL_ASCII)
            .unwrap();
        level.set_value(Value::Int(10));

        let reader = b
            .get_available_info_readers("level", "", "", "", WAIT)
            .pop()
            .unwrap();
        assert!(wait_for(|| reader.value() == Some(Value::Int(10))));
        assert!(reader.online());

        let samples = a
            .add_info_writer("samples", ValueType::FloatArray, "test", crate::INFO_PROTOCOL_ASCII)
            .unwrap();
        samples.set_value(Value::FloatArray(vec![1.5, 2.5]));

        let reader = b
            .get_available_info_readers("samples", "", "", "", WAIT)
            .pop()
            .unwrap();
        assert!(wait_for(|| reader.value() == Some(Value::FloatArray(vec![1.5, 2.5]))));
    }

    #[test]
    fn test_reader_offline_on_writer_removal() {
        let (a, b) = pair();

        let writer = a
            .add_info_writer("level", ValueType::Int, "", crate::INFO_PROTOCOL_ASCII)
            .unwrap();
        writer.set_value(Value::Int(3));

        let reader = b
            .get_available_info_readers("level", "", "", "", WAIT)
            .pop()
            .unwrap();
        assert!(wait_for(|| reader.online()));

        let cleared = Arc::new(AtomicUsize::new(0));
        let counter = cleared.clone();
        reader.add_on_update_callback(move |value| {
            if value.is_none() {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });

        assert!(a.remove_info_writer("level"));
        assert!(wait_for(|| !reader.online()));
        assert_eq!(reader.value(), None);
        assert_eq!(cleared.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_regex_discovery() {
        let (a, b) = pair();

        for name in &["command_example1", "command_example2", "other"] {
            assert!(a.add_service_command(
                echo,
                name,
                FieldSchema::new(),
                FieldSchema::new(),
                "",
                true,
                5,
                CommandProtocol::JsonUdp,
            ));
        }

        let mut names: Vec<String> = b
            .get_available_commands("command_example.*", "", "", "", WAIT)
            .iter()
            .map(|proxy| proxy.name().to_string())
            .collect();
        names.sort();

        assert_eq!(names, vec!["command_example1", "command_example2"]);
    }

    #[test]
    fn test_tcp_large_response() {
        let (a, b) = pair();

        let mut output = FieldSchema::new();
        output.insert("blob".to_string(), FieldDef::mandatory(ValueType::String));

        assert!(a.add_service_command(
            |_| json!({"blob": "x".repeat(2000)}),
            "big",
            int_schema("arg1"),
            output,
            "",
            true,
            5,
            CommandProtocol::JsonTcp,
        ));

        let proxy = b.get_available_commands("big", "", "", "", WAIT).pop().unwrap();
        let response = proxy.call(&args("arg1", json!(1)), WAIT);

        assert!(response.success());
        assert_eq!(response.get("blob"), Some(&json!("x".repeat(2000))));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let (a, _b) = pair();

        assert!(a.add_service_command(
            echo,
            "cmd",
            FieldSchema::new(),
            FieldSchema::new(),
            "",
            true,
            5,
            CommandProtocol::JsonUdp,
        ));
        assert!(!a.add_service_command(
            echo,
            "cmd",
            FieldSchema::new(),
            FieldSchema::new(),
            "",
            true,
            5,
            CommandProtocol::JsonUdp,
        ));

        assert!(a.add_info_writer("w", ValueType::Int, "", crate::INFO_PROTOCOL_ASCII).is_some());
        assert!(a.add_info_writer("w", ValueType::Int, "", crate::INFO_PROTOCOL_ASCII).is_none());
    }

    #[test]
    fn test_command_remove_event_reaches_peers() {
        let (a, b) = pair();

        a.add_service_command(
            echo,
            "cmd",
            FieldSchema::new(),
            FieldSchema::new(),
            "",
            true,
            5,
            CommandProtocol::JsonUdp,
        );

        let proxy = b.get_available_commands("cmd", "", "", "", WAIT).pop().unwrap();
        assert!(proxy.enable());

        let removed = Arc::new(AtomicUsize::new(0));
        let counter = removed.clone();
        b.on_command_remove(Some(Box::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })));

        assert!(a.remove_service_command("cmd"));
        assert!(wait_for(|| removed.load(Ordering::Relaxed) == 1));
        assert!(!proxy.enable());

        let response = proxy.call(&serde_json::Map::new(), None);
        assert_eq!(response.error(), Some("Command not enable"));
    }

    #[test]
    fn test_node_stop_evicts_registrations() {
        let hub = MemoryHub::new();
        let a = Node::new(hub.client("a") as Arc<dyn SharedTable>, Some("svc_a"), None);
        let b = Node::new(hub.client("b") as Arc<dyn SharedTable>, Some("svc_b"), None);
        a.start();
        b.start();

        a.add_service_command(
            echo,
            "cmd",
            FieldSchema::new(),
            FieldSchema::new(),
            "",
            true,
            5,
            CommandProtocol::JsonUdp,
        );
        assert_eq!(b.get_available_commands("cmd", "", "", "", WAIT).len(), 1);

        drop(a);
        assert!(wait_for(|| b
            .get_available_commands("cmd", "", "", "", None)
            .is_empty()));
    }

    #[test]
    fn test_identity_defaults() {
        let hub = MemoryHub::new();
        let node = Node::new(hub.client("a") as Arc<dyn SharedTable>, None, None);

        assert!(!node.mac().is_empty());
        assert!(!node.mac().starts_with("0x"));
        assert!(!node.service().is_empty());

        let uid = node.command_uid("", "cmd");
        assert_eq!(uid.category, "generic");
        assert_eq!(uid.path(), format!("d2dcn/{}/{}/command/generic/cmd", node.mac(), node.service()));
    }
}
