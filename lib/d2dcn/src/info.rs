//! Info plane: writers own a live value and push changes to the multicast
//! group, readers reconcile their copy from a one-shot request plus the
//! filtered update stream.

use crate::logging;
use crate::net::multicast::{MulticastReceiver, MulticastSender};
use crate::net::udp::{UdpClient, UdpListener};
use crate::net::READ_POLL;
use crate::route;
use crate::time::timestamp_secs;
use crate::types::{decode_ascii, encode_ascii, Value, ValueType};
use crate::INFO_REQUEST;
use serde_derive::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long a freshly attached reader waits for the writer to answer its
/// priming request.
const PRIME_TIMEOUT: Duration = Duration::from_secs(5);

/// Directory value behind an info UID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoDescriptor {
    pub protocol: String,
    pub ip: String,
    pub req_port: u16,
    pub update_port: u16,
    #[serde(rename = "type")]
    pub value_type: ValueType,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct WriterShared {
    run: AtomicBool,
    value: Mutex<Value>,
    request: UdpListener,
    log: logging::Logger,
}

/// Owner side of one info value. Starts at the type's zero and publishes
/// every change on the multicast group; a request listener serves the current
/// value point-to-point.
pub struct InfoWriter {
    mac: String,
    service: String,
    category: String,
    name: String,
    value_type: ValueType,
    protocol: String,
    shared: Arc<WriterShared>,
    mcast: MulticastSender,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InfoWriter {
    pub(crate) fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        mac: String,
        service: String,
        category: String,
        name: String,
        value_type: ValueType,
        protocol: String,
        iface: Ipv4Addr,
        log: L,
    ) -> io::Result<InfoWriter> {
        let zero = Value::zero(value_type).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Bare array is not a writable type")
        })?;

        let shared = Arc::new(WriterShared {
            run: AtomicBool::new(true),
            value: Mutex::new(zero),
            request: UdpListener::bind()?,
            log: logging::child(log),
        });

        let mcast = MulticastSender::new(iface)?;

        let worker = {
            let shared = shared.clone();
            thread::spawn(move || request_worker(shared))
        };

        Ok(InfoWriter {
            mac,
            service,
            category,
            name,
            value_type,
            protocol,
            shared,
            mcast,
            worker: Mutex::new(Some(worker)),
        })
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

    #[inline]
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn value(&self) -> Value {
        lock(&self.shared.value).clone()
    }

    /// Updates the value and multicasts its encoding. Writes equal to the
    /// current value are suppressed.
    ///
    /// # Panics
    ///
    /// Panics when the value's type does not match the writer's declared
    /// type; a type change is a programmer error, not a runtime condition.
    pub fn set_value(&self, value: Value) {
        if value.value_type() != self.value_type {
            panic!(
                "Info value type mismatch: writer holds {:?}, got {:?}",
                self.value_type,
                value.value_type()
            );
        }

        let encoded = {
            let mut current = lock(&self.shared.value);
            if *current == value {
                return;
            }
            *current = value;
            encode_ascii(&current)
        };

        if let Err(err) = self.mcast.send(encoded.as_bytes()) {
            logging::warn!(self.shared.log, "update publish failed";
                           "context" => "set_value",
                           "name" => &self.name,
                           "error" => ?err);
        }
    }

    /// Builds the directory descriptor for this writer at the given address.
    pub(crate) fn descriptor(&self, ip: String) -> InfoDescriptor {
        InfoDescriptor {
            protocol: self.protocol.clone(),
            ip,
            req_port: self.shared.request.port(),
            update_port: self.mcast.port(),
            value_type: self.value_type,
        }
    }
}

impl Drop for InfoWriter {
    fn drop(&mut self) {
        self.shared.run.store(false, Ordering::Relaxed);
        self.shared.request.close();

        if let Some(worker) = lock(&self.worker).take() {
            drop(worker.join());
        }
    }
}

/// Serves the writer's request port: the literal `req` datagram is answered
/// with the ASCII-encoded current value.
fn request_worker(shared: Arc<WriterShared>) {
    while shared.run.load(Ordering::Relaxed) {
        let (request, peer) = match shared.request.read(None) {
            Some(read) => read,
            None => break,
        };

        if request != INFO_REQUEST {
            logging::debug!(shared.log, "unexpected request datagram";
                            "context" => "request_worker",
                            "peer" => %peer,
                            "len" => request.len());
            continue;
        }

        let encoded = encode_ascii(&lock(&shared.value));
        if let Err(err) = shared.request.send(peer, encoded.as_bytes()) {
            logging::debug!(shared.log, "request answer failed";
                            "context" => "request_worker",
                            "peer" => %peer,
                            "error" => ?err);
        }
    }
}

type UpdateCallback = Box<dyn Fn(Option<&Value>) + Send>;

struct ReaderState {
    value: Option<Value>,
    epoch: Option<u64>,
}

struct ReaderShared {
    state: Mutex<ReaderState>,
    callbacks: Mutex<Vec<(u64, UpdateCallback)>>,
    next_token: AtomicU64,
    log: logging::Logger,
}

impl ReaderShared {
    fn store_and_fire(&self, value: Value) {
        {
            let mut state = lock(&self.state);
            state.value = Some(value.clone());
            state.epoch = Some(timestamp_secs());
        }
        self.fire(Some(&value));
    }

    fn clear_and_fire(&self) {
        {
            let mut state = lock(&self.state);
            state.value = None;
            state.epoch = None;
        }
        self.fire(None);
    }

    fn fire(&self, value: Option<&Value>) {
        let callbacks = lock(&self.callbacks);
        for (_, callback) in callbacks.iter() {
            callback(value);
        }
    }
}

struct WorkerCtx {
    run: AtomicBool,
}

#[derive(Default)]
struct ReaderWorker {
    ctx: Option<Arc<WorkerCtx>>,
    handle: Option<JoinHandle<()>>,
}

/// Remote observer of one info value. Offline until the first update
/// arrives; reconfigured in place as the writer moves or disappears.
pub struct InfoReader {
    mac: String,
    service: String,
    category: String,
    name: String,
    value_type: ValueType,
    shared: Arc<ReaderShared>,
    worker: Mutex<ReaderWorker>,
}

impl InfoReader {
    pub(crate) fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        mac: String,
        service: String,
        category: String,
        name: String,
        value_type: ValueType,
        log: L,
    ) -> InfoReader {
        InfoReader {
            mac,
            service,
            category,
            name,
            value_type,
            shared: Arc::new(ReaderShared {
                state: Mutex::new(ReaderState {
                    value: None,
                    epoch: None,
                }),
                callbacks: Mutex::new(Vec::new()),
                next_token: AtomicU64::new(1),
                log: logging::child(log),
            }),
            worker: Mutex::new(ReaderWorker::default()),
        }
    }

    /// Points the reader at a writer endpoint, replacing any previous worker.
    /// `None` tears the reader down: the value clears, update callbacks fire
    /// once with the cleared state and the reader goes offline.
    pub(crate) fn configure(&self, endpoint: Option<(String, u16, u16)>) {
        let mut worker = lock(&self.worker);
        Self::stop_worker(&mut worker);

        match endpoint {
            Some((ip, req_port, update_port)) => {
                let ctx = Arc::new(WorkerCtx {
                    run: AtomicBool::new(true),
                });

                let handle = {
                    let shared = self.shared.clone();
                    let ctx = ctx.clone();
                    let value_type = self.value_type;
                    thread::spawn(move || update_worker(shared, ctx, ip, req_port, update_port, value_type))
                };

                worker.ctx = Some(ctx);
                worker.handle = Some(handle);
            }
            None => self.shared.clear_and_fire(),
        }
    }

    fn stop_worker(worker: &mut ReaderWorker) {
        if let Some(ctx) = worker.ctx.take() {
            ctx.run.store(false, Ordering::Relaxed);
        }
        if let Some(handle) = worker.handle.take() {
            drop(handle.join());
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

    #[inline]
    pub fn category(&self) -> &str {
        &self.category
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn value(&self) -> Option<Value> {
        lock(&self.shared.state).value.clone()
    }

    pub fn epoch(&self) -> Option<u64> {
        lock(&self.shared.state).epoch
    }

    /// A reader is online exactly while it holds a value.
    pub fn online(&self) -> bool {
        lock(&self.shared.state).value.is_some()
    }

    /// Registers an update callback; the returned token removes it again.
    /// Callbacks receive the new value, or `None` when the reader clears.
    pub fn add_on_update_callback<F>(&self, callback: F) -> u64
    where
        F: Fn(Option<&Value>) + Send + 'static,
    {
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.callbacks).push((token, Box::new(callback)));
        token
    }

    pub fn remove_on_update_callback(&self, token: u64) -> bool {
        let mut callbacks = lock(&self.shared.callbacks);
        let before = callbacks.len();
        callbacks.retain(|(id, _)| *id != token);
        callbacks.len() != before
    }
}

impl Drop for InfoReader {
    fn drop(&mut self) {
        let mut worker = lock(&self.worker);
        Self::stop_worker(&mut worker);
    }
}

/// Primes the value with a one-shot request toward the writer, then follows
/// the source-filtered multicast stream.
fn update_worker(
    shared: Arc<ReaderShared>,
    ctx: Arc<WorkerCtx>,
    ip: String,
    req_port: u16,
    update_port: u16,
    value_type: ValueType,
) {
    prime_value(&shared, &ctx, &ip, req_port, value_type);

    let source = ip.parse::<Ipv4Addr>().ok();
    let iface = route::source_ip_for(&ip)
        .parse::<Ipv4Addr>()
        .unwrap_or(Ipv4Addr::UNSPECIFIED);

    let receiver = match MulticastReceiver::join(update_port, source, iface) {
        Ok(receiver) => receiver,
        Err(err) => {
            logging::warn!(shared.log, "update group join failed";
                           "context" => "update_worker",
                           "port" => update_port,
                           "error" => %err);
            return;
        }
    };

    while ctx.run.load(Ordering::Relaxed) {
        let payload = match receiver.read(Some(READ_POLL)) {
            Some(payload) => payload,
            None => continue,
        };

        match decode_payload(&payload, value_type) {
            Some(value) => shared.store_and_fire(value),
            None => logging::debug!(shared.log, "undecodable update";
                                    "context" => "update_worker",
                                    "len" => payload.len()),
        }
    }
}

fn prime_value(shared: &ReaderShared, ctx: &WorkerCtx, ip: &str, req_port: u16, value_type: ValueType) {
    let addr = match ip.parse::<IpAddr>() {
        Ok(addr) => addr,
        Err(_) => return,
    };

    let client = match UdpClient::new(SocketAddr::new(addr, req_port)) {
        Ok(client) => client,
        Err(_) => return,
    };

    if client.send(INFO_REQUEST).is_err() {
        return;
    }

    // Poll in short slices so a teardown during the prime stays prompt.
    let deadline = Instant::now() + PRIME_TIMEOUT;
    while ctx.run.load(Ordering::Relaxed) && Instant::now() < deadline {
        if let Some(payload) = client.read(Some(READ_POLL)) {
            if let Some(value) = decode_payload(&payload, value_type) {
                shared.store_and_fire(value);
            }
            break;
        }
    }

    client.close();
}

fn decode_payload(payload: &[u8], value_type: ValueType) -> Option<Value> {
    let text = std::str::from_utf8(payload).ok()?;
    decode_ascii(text, value_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const LOOPBACK: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    fn writer(name: &str, value_type: ValueType) -> InfoWriter {
        InfoWriter::new(
            "mac".to_string(),
            "svc".to_string(),
            "generic".to_string(),
            name.to_string(),
            value_type,
            crate::INFO_PROTOCOL_ASCII.to_string(),
            LOOPBACK,
            None,
        )
        .unwrap()
    }

    fn reader_for(writer: &InfoWriter) -> InfoReader {
        let reader = InfoReader::new(
            writer.mac().to_string(),
            writer.service().to_string(),
            writer.category().to_string(),
            writer.name().to_string(),
            writer.value_type(),
            None,
        );

        let descriptor = writer.descriptor("127.0.0.1".to_string());
        reader.configure(Some((descriptor.ip, descriptor.req_port, descriptor.update_port)));
        reader
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
    fn test_writer_starts_at_zero() {
        assert_eq!(writer("a", ValueType::Int).value(), Value::Int(0));
        assert_eq!(writer("b", ValueType::String).value(), Value::Str(String::new()));
        assert_eq!(
            writer("c", ValueType::FloatArray).value(),
            Value::FloatArray(Vec::new())
        );
    }

    #[test]
    #[should_panic(expected = "type mismatch")]
    fn test_writer_rejects_wrong_type() {
        writer("a", ValueType::Int).set_value(Value::Str("x".to_string()));
    }

    #[test]
    fn test_writer_answers_request() {
        let writer = writer("a", ValueType::Int);
        writer.set_value(Value::Int(10));

        let descriptor = writer.descriptor("127.0.0.1".to_string());
        let client =
            UdpClient::new(SocketAddr::new(IpAddr::V4(LOOPBACK), descriptor.req_port)).unwrap();

        client.send(INFO_REQUEST).unwrap();
        let answer = client.read(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(answer, b"10");
    }

    #[test]
    fn test_writer_ignores_other_datagrams() {
        let writer = writer("a", ValueType::Int);
        let descriptor = writer.descriptor("127.0.0.1".to_string());
        let client =
            UdpClient::new(SocketAddr::new(IpAddr::V4(LOOPBACK), descriptor.req_port)).unwrap();

        client.send(b"bogus").unwrap();
        assert!(client.read(Some(Duration::from_millis(300))).is_none());
    }

    #[test]
    fn test_writer_publishes_changes_and_suppresses_equal_writes() {
        let writer = writer("a", ValueType::Int);
        let receiver =
            MulticastReceiver::join(writer.descriptor(String::new()).update_port, Some(LOOPBACK), LOOPBACK)
                .unwrap();

        writer.set_value(Value::Int(7));
        assert_eq!(receiver.read(Some(Duration::from_secs(2))).unwrap(), b"7");

        // Same value again: no datagram.
        writer.set_value(Value::Int(7));
        assert!(receiver.read(Some(Duration::from_millis(300))).is_none());

        writer.set_value(Value::Int(8));
        assert_eq!(receiver.read(Some(Duration::from_secs(2))).unwrap(), b"8");
    }

    #[test]
    fn test_reader_primes_from_writer() {
        let writer = writer("a", ValueType::Int);
        writer.set_value(Value::Int(42));

        let reader = reader_for(&writer);
        assert!(wait_for(|| reader.value() == Some(Value::Int(42))));
        assert!(reader.online());
        assert!(reader.epoch().is_some());
    }

    #[test]
    fn test_reader_follows_updates() {
        let writer = writer("a", ValueType::FloatArray);
        let reader = reader_for(&writer);

        assert!(wait_for(|| reader.online()));

        writer.set_value(Value::FloatArray(vec![1.5, 2.5]));
        assert!(wait_for(|| reader.value() == Some(Value::FloatArray(vec![1.5, 2.5]))));
    }

    #[test]
    fn test_reader_offline_transition_fires_once() {
        let writer = writer("a", ValueType::Int);
        writer.set_value(Value::Int(1));

        let reader = reader_for(&writer);
        assert!(wait_for(|| reader.online()));

        let cleared = Arc::new(AtomicUsize::new(0));
        let counter = cleared.clone();
        reader.add_on_update_callback(move |value| {
            if value.is_none() {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });

        reader.configure(None);
        assert!(!reader.online());
        assert_eq!(reader.value(), None);
        assert_eq!(cleared.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_callback_token_removal() {
        let reader = InfoReader::new(
            "m".to_string(),
            "s".to_string(),
            "c".to_string(),
            "n".to_string(),
            ValueType::Int,
            None,
        );

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let token = reader.add_on_update_callback(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        reader.shared.store_and_fire(Value::Int(1));
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        assert!(reader.remove_on_update_callback(token));
        reader.shared.store_and_fire(Value::Int(2));
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        assert!(!reader.remove_on_update_callback(token));
    }
}
