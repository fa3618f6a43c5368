//! Command plane: server-side registration contexts and request workers,
//! and the caller-side proxy with typed error results.

use crate::logging;
use crate::net::tcp::{TcpClient, TcpConnection, TcpServer};
use crate::net::udp::{UdpClient, UdpListener};
use crate::types::{check_fields, FieldSchema};
use crate::DEFAULT_COMMAND_TIMEOUT_SECS;
use serde::Serialize;
use serde_derive::Deserialize;
use serde_json;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Errors surfaced to callers as bare ASCII strings on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CommandError {
    BadInput,
    BadOutput,
    CallbackError,
    ConnectionError,
    TimeoutError,
    ExceptionRaised,
    NotEnable,
    IncompleteResponse,
    InvalidResponse,
}

impl CommandError {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandError::BadInput => "Invalid input",
            CommandError::BadOutput => "Invalid output",
            CommandError::CallbackError => "Command error",
            CommandError::ConnectionError => "Connection error",
            CommandError::TimeoutError => "Timeout error",
            CommandError::ExceptionRaised => "Exception raised",
            CommandError::NotEnable => "Command not enable",
            CommandError::IncompleteResponse => "Incomplete response",
            CommandError::InvalidResponse => "Invalid response",
        }
    }
}

/// Transport carrying a command's request/response exchange.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum CommandProtocol {
    #[serde(rename = "json-udp")]
    JsonUdp,
    #[serde(rename = "json-tcp")]
    JsonTcp,
}

fn default_enable() -> bool {
    true
}

fn default_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

/// Directory value behind a command UID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub protocol: CommandProtocol,
    pub ip: String,
    pub port: u16,
    pub input: FieldSchema,
    pub output: FieldSchema,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

/// Serializes a JSON value with the wire's one-space indent.
pub(crate) fn to_indented_json(value: &serde_json::Value) -> String {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);

    value.serialize(&mut serializer).expect("Error serializing JSON value");
    String::from_utf8(buf).expect("Serialized JSON must be UTF-8")
}

pub type CommandCallback =
    dyn Fn(&serde_json::Map<String, serde_json::Value>) -> serde_json::Value + Send + Sync;

/// Shared state of one local command registration, bundled for the workers
/// serving it.
pub(crate) struct CommandContext {
    pub run: AtomicBool,
    pub enable: AtomicBool,
    pub input: FieldSchema,
    pub output: FieldSchema,
    pub callback: Box<CommandCallback>,
    pub log: logging::Logger,
}

/// Runs one request through the pipeline: parse, enable gate, input check,
/// user callback, output check, serialize.
pub(crate) fn handle_request(ctx: &CommandContext, request: &[u8]) -> String {
    let parsed: serde_json::Value = match serde_json::from_slice(request) {
        Ok(value) => value,
        Err(_) => return CommandError::BadInput.as_str().to_string(),
    };

    let args = match parsed.as_object() {
        Some(map) => map,
        None => return CommandError::BadInput.as_str().to_string(),
    };

    if !ctx.enable.load(Ordering::Relaxed) {
        return CommandError::NotEnable.as_str().to_string();
    }

    if !check_fields(args, &ctx.input) {
        return CommandError::BadInput.as_str().to_string();
    }

    let response = (ctx.callback)(args);
    let fields = match response.as_object() {
        Some(map) => map,
        None => return CommandError::CallbackError.as_str().to_string(),
    };

    if !check_fields(fields, &ctx.output) {
        return CommandError::BadOutput.as_str().to_string();
    }

    to_indented_json(&response)
}

/// Serves one UDP command: every inbound datagram runs the pipeline and the
/// reply goes back to the sender.
pub(crate) fn udp_worker(sock: Arc<UdpListener>, ctx: Arc<CommandContext>) {
    while ctx.run.load(Ordering::Relaxed) {
        let (request, peer) = match sock.read(None) {
            Some(read) => read,
            None => break,
        };

        let response = handle_request(&ctx, &request);
        if let Err(err) = sock.send(peer, response.as_bytes()) {
            logging::debug!(ctx.log, "response send failed";
                            "context" => "udp_worker",
                            "error" => ?err);
        }
    }
}

/// Serves one TCP command: accepted connections get their own worker, all of
/// them funneling callback invocations through one mutex so user code never
/// sees concurrent calls.
pub(crate) fn tcp_worker(server: Arc<TcpServer>, ctx: Arc<CommandContext>) {
    let call_lock = Arc::new(Mutex::new(()));
    let mut workers = Vec::new();

    while ctx.run.load(Ordering::Relaxed) {
        let conn = match server.wait_connection(None) {
            Some(conn) => conn,
            None => break,
        };

        let ctx = ctx.clone();
        let call_lock = call_lock.clone();
        workers.push(thread::spawn(move || tcp_connection_worker(conn, ctx, call_lock)));
    }

    server.close();
    for worker in workers {
        drop(worker.join());
    }
}

fn tcp_connection_worker(conn: TcpConnection, ctx: Arc<CommandContext>, call_lock: Arc<Mutex<()>>) {
    while ctx.run.load(Ordering::Relaxed) {
        // Short read slices keep the worker responsive to a run-flag flip.
        let request = match conn.read(Some(crate::net::READ_POLL)) {
            Some(request) => request,
            None => {
                if conn.is_connected() {
                    continue;
                }
                break;
            }
        };

        let response = {
            let _serialized = lock(&call_lock);
            handle_request(&ctx, &request)
        };

        if let Err(err) = conn.send(response.as_bytes()) {
            logging::debug!(ctx.log, "response send failed";
                            "context" => "tcp_worker",
                            "error" => ?err);
            break;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Result of one command call. On success the response fields are available
/// by name; on failure `error` holds one of the wire error strings or the
/// raw response text.
#[derive(Debug)]
pub struct CommandResponse {
    success: bool,
    error: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl CommandResponse {
    pub(crate) fn from_error(error: CommandError) -> CommandResponse {
        CommandResponse {
            success: false,
            error: Some(error.as_str().to_string()),
            fields: serde_json::Map::new(),
        }
    }

    /// Decodes a raw response payload: a JSON object succeeds, any other
    /// valid text is the error verbatim, non-text maps to `Exception raised`.
    pub(crate) fn from_payload(payload: &[u8]) -> CommandResponse {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(_) => return CommandResponse::from_error(CommandError::ExceptionRaised),
        };

        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(serde_json::Value::Object(fields)) => CommandResponse {
                success: true,
                error: None,
                fields,
            },
            _ => CommandResponse {
                success: false,
                error: Some(text.to_string()),
                fields: serde_json::Map::new(),
            },
        }
    }

    #[inline]
    pub fn success(&self) -> bool {
        self.success
    }

    #[inline]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    #[inline]
    pub fn fields(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.fields
    }
}

enum ProxySocket {
    Udp(UdpClient),
    Tcp(TcpClient),
}

impl ProxySocket {
    fn open(protocol: CommandProtocol, ip: &str, port: u16) -> Option<ProxySocket> {
        let addr = SocketAddr::new(ip.parse::<IpAddr>().ok()?, port);

        match protocol {
            CommandProtocol::JsonUdp => UdpClient::new(addr).ok().map(ProxySocket::Udp),
            CommandProtocol::JsonTcp => Some(ProxySocket::Tcp(TcpClient::new(addr))),
        }
    }

    fn send(&self, payload: &[u8]) -> bool {
        match self {
            ProxySocket::Udp(client) => client.send(payload).is_ok(),
            ProxySocket::Tcp(client) => client.send(payload).is_ok(),
        }
    }

    fn read(&self, timeout: Duration) -> Option<Vec<u8>> {
        match self {
            ProxySocket::Udp(client) => client.read(Some(timeout)),
            ProxySocket::Tcp(client) => client.read(Some(timeout)),
        }
    }
}

struct ProxyState {
    protocol: CommandProtocol,
    ip: String,
    port: u16,
    input: FieldSchema,
    output: FieldSchema,
    enable: bool,
    timeout: Duration,
    socket: Option<Arc<ProxySocket>>,
}

/// Caller-side handle to one remote command. Identity is immutable; the
/// endpoint, schemas and enable flag track directory updates in place.
pub struct CommandInterface {
    mac: String,
    service: String,
    category: String,
    name: String,
    state: Mutex<ProxyState>,
    log: logging::Logger,
}

impl CommandInterface {
    pub(crate) fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        mac: String,
        service: String,
        category: String,
        name: String,
        descriptor: &CommandDescriptor,
        log: L,
    ) -> CommandInterface {
        let interface = CommandInterface {
            mac,
            service,
            category,
            name,
            state: Mutex::new(ProxyState {
                protocol: descriptor.protocol,
                ip: String::new(),
                port: 0,
                input: FieldSchema::new(),
                output: FieldSchema::new(),
                enable: false,
                timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
                socket: None,
            }),
            log: logging::child(log),
        };

        interface.configure(descriptor);
        interface
    }

    /// Applies a fresh descriptor, rebuilding the transport only when the
    /// endpoint actually moved.
    pub(crate) fn configure(&self, descriptor: &CommandDescriptor) {
        let mut state = lock(&self.state);

        let moved = state.socket.is_none()
            || state.protocol != descriptor.protocol
            || state.ip != descriptor.ip
            || state.port != descriptor.port;

        state.protocol = descriptor.protocol;
        state.ip = descriptor.ip.clone();
        state.port = descriptor.port;
        state.input = descriptor.input.clone();
        state.output = descriptor.output.clone();
        state.enable = descriptor.enable;
        state.timeout = Duration::from_secs(descriptor.timeout);

        if !descriptor.enable {
            state.socket = None;
        } else if moved {
            state.socket =
                ProxySocket::open(descriptor.protocol, &descriptor.ip, descriptor.port).map(Arc::new);
        }

        logging::debug!(self.log, "command proxy configured";
                        "context" => "configure",
                        "name" => &self.name,
                        "enable" => descriptor.enable,
                        "endpoint" => format!("{}:{}", descriptor.ip, descriptor.port));
    }

    /// Drops the transport and disables the proxy; used when the descriptor
    /// disappears from the directory.
    pub(crate) fn shutdown(&self) {
        let mut state = lock(&self.state);
        state.enable = false;
        state.socket = None;
    }

    #[inline]
    pub fn mac(&self) -> &str {
        &self.mac
    }

    #[inline]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[inline]
    pub fn category(&self) -> &str {
        &self.category
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enable(&self) -> bool {
        lock(&self.state).enable
    }

    pub fn protocol(&self) -> CommandProtocol {
        lock(&self.state).protocol
    }

    pub fn ip(&self) -> String {
        lock(&self.state).ip.clone()
    }

    pub fn input_schema(&self) -> FieldSchema {
        lock(&self.state).input.clone()
    }

    pub fn output_schema(&self) -> FieldSchema {
        lock(&self.state).output.clone()
    }

    /// Invokes the remote command. `timeout` falls back to the descriptor's;
    /// every failure mode is folded into the response's error string.
    pub fn call(
        &self,
        args: &serde_json::Map<String, serde_json::Value>,
        timeout: Option<Duration>,
    ) -> CommandResponse {
        let (socket, timeout) = {
            let state = lock(&self.state);

            let socket = match (&state.socket, state.enable) {
                (Some(socket), true) => socket.clone(),
                _ => return CommandResponse::from_error(CommandError::NotEnable),
            };

            (socket, timeout.unwrap_or(state.timeout))
        };

        let payload = to_indented_json(&serde_json::Value::Object(args.clone()));
        if !socket.send(payload.as_bytes()) {
            return CommandResponse::from_error(CommandError::ConnectionError);
        }

        let mut response = match socket.read(timeout) {
            Some(response) => response,
            None => return CommandResponse::from_error(CommandError::TimeoutError),
        };

        // A JSON body may span several segments; keep reading while it looks
        // like an unterminated object.
        loop {
            let text = match std::str::from_utf8(&response) {
                Ok(text) => text,
                Err(_) => return CommandResponse::from_error(CommandError::InvalidResponse),
            };

            if !text.starts_with('{') || text.ends_with('}') {
                break;
            }

            match socket.read(timeout) {
                Some(more) => response.extend_from_slice(&more),
                None => return CommandResponse::from_error(CommandError::IncompleteResponse),
            }
        }

        if response.is_empty() {
            return CommandResponse::from_error(CommandError::TimeoutError);
        }

        CommandResponse::from_payload(&response)
    }
}
