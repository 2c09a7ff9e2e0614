#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use rvoip_sip_core::builder::SimpleRequestBuilder;
use rvoip_sip_fsm::message::{headers_mut, Param, TypedHeader, Via};
use rvoip_sip_fsm::utils::{build_ack, create_response};
use rvoip_sip_fsm::{
    Error, Message, Method, ResponseCallback, Result, ServerEvent, ServerEventCallback,
    SipMessageExt, StatusCode, TerminateCallback, Transaction, Transport, TransportHandle,
    TransportService,
};

pub const LOCAL: &str = "127.0.0.1:5060";
pub const REMOTE: &str = "192.0.2.10:5060";

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Call once per test; repeated calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Lets spawned transaction loops drain their queues without moving the clock.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// A message written by a [`MockTransport`].
#[derive(Debug, Clone)]
pub struct Sent {
    pub message: Message,
    /// `None` for writes on the connection itself.
    pub destination: Option<SocketAddr>,
    pub at: Instant,
}

/// Records every write instead of touching the network.
#[derive(Debug)]
pub struct MockTransport {
    local: SocketAddr,
    remote: SocketAddr,
    reliable: bool,
    scheme: String,
    /// Answer to keep-alives
    alive: AtomicBool,
    /// Fail every write when set
    broken: AtomicBool,
    sent: Mutex<Vec<Sent>>,
}

impl MockTransport {
    pub fn new(scheme: &str, reliable: bool, local: SocketAddr, remote: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            local,
            remote,
            reliable,
            scheme: scheme.to_string(),
            alive: AtomicBool::new(true),
            broken: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn udp() -> Arc<Self> {
        Self::new("udp", false, addr(LOCAL), addr(REMOTE))
    }

    pub fn tcp() -> Arc<Self> {
        Self::new("tcp", true, addr(LOCAL), addr(REMOTE))
    }

    pub fn handle(self: &Arc<Self>) -> TransportHandle {
        self.clone()
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Number of requests with `method` written so far.
    pub fn requests(&self, method: &Method) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.message.is_request_method(method))
            .count()
    }

    /// Number of responses with `status` written so far.
    pub fn responses(&self, status: u16) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.message.status_code() == Some(status))
            .count()
    }

    /// Times at which requests with `method` were written.
    pub fn request_times(&self, method: &Method) -> Vec<Instant> {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.message.is_request_method(method))
            .map(|s| s.at)
            .collect()
    }

    pub fn response_times(&self, status: u16) -> Vec<Instant> {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.message.status_code() == Some(status))
            .map(|s| s.at)
            .collect()
    }

    pub fn last(&self) -> Option<Sent> {
        self.sent.lock().last().cloned()
    }

    fn record(&self, message: &Message, destination: Option<SocketAddr>) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::TransportError("connection reset".into()));
        }
        self.sent.lock().push(Sent {
            message: message.clone(),
            destination,
            at: Instant::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write_message(&self, message: &Message) -> Result<()> {
        self.record(message, None)
    }

    async fn write_message_to(&self, message: &Message, destination: SocketAddr) -> Result<()> {
        self.record(message, Some(destination))
    }

    async fn write_keep_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn is_reliable_transport(&self) -> bool {
        self.reliable
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    fn local_address(&self) -> SocketAddr {
        self.local
    }

    fn transport_scheme(&self) -> &str {
        &self.scheme
    }
}

/// Arguments of one `create_client_transport` call.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub scheme: String,
    pub transport_id: Option<String>,
}

/// Hands out fresh mock transports and remembers what it was asked for.
#[derive(Debug, Default)]
pub struct MockTransportService {
    pub calls: Mutex<Vec<TransportRequest>>,
    pub created: Mutex<Vec<Arc<MockTransport>>>,
    pub fail: AtomicBool,
}

impl MockTransportService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_created(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl TransportService for MockTransportService {
    async fn create_client_transport(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        scheme: &str,
        transport_id: Option<&str>,
    ) -> Result<TransportHandle> {
        self.calls.lock().push(TransportRequest {
            local,
            remote,
            scheme: scheme.to_string(),
            transport_id: transport_id.map(str::to_string),
        });
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::TransportNotReady(format!("unable to reach {}", remote)));
        }
        let reliable = scheme != "udp";
        let transport = MockTransport::new(scheme, reliable, local, remote);
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}

pub fn request(method: Method, branch: &str, call_id: &str, cseq: u32) -> Message {
    let request = SimpleRequestBuilder::new(method, "sip:bob@biloxi.example.com")
        .unwrap()
        .via("192.0.2.10:5060", "UDP", Some(branch))
        .max_forwards(70)
        .from("Alice", "sip:alice@atlanta.example.com", Some("alice-1"))
        .to("Bob", "sip:bob@biloxi.example.com", None)
        .call_id(call_id)
        .cseq(cseq)
        .build();
    Message::Request(request)
}

pub fn invite(branch: &str, call_id: &str, cseq: u32) -> Message {
    request(Method::Invite, branch, call_id, cseq)
}

/// Response to `request`, optionally adding a To-tag.
pub fn response_to(request: &Message, status: u16, to_tag: Option<&str>) -> Message {
    let status = StatusCode::from_u16(status).unwrap();
    let mut response = create_response(request, status).unwrap();
    if let Some(tag) = to_tag {
        set_to_tag(&mut response, tag);
    }
    response
}

pub fn set_to_tag(message: &mut Message, tag: &str) {
    for header in headers_mut(message) {
        if let TypedHeader::To(to) = header {
            to.set_tag(tag);
        }
    }
}

/// Replaces every Via with a single one carrying `branch`.
pub fn set_branch(message: &mut Message, branch: &str) {
    let headers = headers_mut(message);
    headers.retain(|h| !matches!(h, TypedHeader::Via(_)));
    let via = Via::new(
        "SIP",
        "2.0",
        "UDP",
        "192.0.2.10",
        Some(5060),
        vec![Param::Branch(branch.to_string())],
    )
    .unwrap();
    headers.insert(0, TypedHeader::Via(via));
}

/// Asks for symmetric response routing on the top Via.
pub fn request_rport(message: &mut Message) {
    for header in headers_mut(message) {
        if let TypedHeader::Via(via) = header {
            via.0[0].params.push(Param::Rport(None));
            return;
        }
    }
}

/// ACK for a non-2xx final response (same branch as the INVITE).
pub fn ack_for(invite: &Message, response: &Message) -> Message {
    build_ack(invite, response).unwrap()
}

/// ACK for a 2xx: a new transaction with its own branch.
pub fn ack_for_2xx(invite: &Message, response: &Message, branch: &str) -> Message {
    let mut ack = build_ack(invite, response).unwrap();
    set_branch(&mut ack, branch);
    ack
}

/// Collects everything passed to a client transaction's response callback.
#[derive(Clone, Default)]
pub struct Responses(Arc<Mutex<Vec<Result<Message>>>>);

impl Responses {
    pub fn callback(&self) -> ResponseCallback {
        let seen = self.0.clone();
        Arc::new(move |result, _transport, _transaction| seen.lock().push(result))
    }

    pub fn all(&self) -> Vec<Result<Message>> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn statuses(&self) -> Vec<u16> {
        self.0
            .lock()
            .iter()
            .filter_map(|r| r.as_ref().ok().and_then(|m| m.status_code()))
            .collect()
    }

    pub fn errors(&self) -> Vec<Error> {
        self.0
            .lock()
            .iter()
            .filter_map(|r| r.as_ref().err().cloned())
            .collect()
    }
}

/// Counts termination callbacks.
#[derive(Clone, Default)]
pub struct Terminations(Arc<AtomicUsize>);

impl Terminations {
    pub fn callback(&self) -> TerminateCallback {
        let count = self.0.clone();
        Arc::new(move |_transaction| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Collects IST ACK notifications.
#[derive(Clone, Default)]
pub struct ServerEvents(Arc<Mutex<Vec<ServerEvent>>>);

impl ServerEvents {
    pub fn callback(&self) -> ServerEventCallback {
        let seen = self.0.clone();
        Arc::new(move |event, _transaction| seen.lock().push(event))
    }

    pub fn acks(&self) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|e| matches!(e, ServerEvent::AckReceived(_)))
            .count()
    }

    pub fn timeouts(&self) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|e| matches!(e, ServerEvent::AckTimeout(_)))
            .count()
    }
}

/// Requests handed to the application, with their server transactions.
#[derive(Clone, Default)]
pub struct Delivered(Arc<Mutex<Vec<(Message, Arc<Transaction>)>>>);

impl Delivered {
    pub fn push(&self, request: Message, transaction: Arc<Transaction>) {
        self.0.lock().push((request, transaction));
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn get(&self, index: usize) -> (Message, Arc<Transaction>) {
        self.0.lock()[index].clone()
    }
}

pub fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

pub fn millis(n: u64) -> Duration {
    Duration::from_millis(n)
}
