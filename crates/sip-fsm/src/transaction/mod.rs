//! # SIP Transactions
//!
//! A [`Transaction`] is one RFC 3261 Section 17 exchange: a request, its
//! provisional and final responses, and (for INVITE) the ACK for a non-2xx.
//!
//! Each transaction owns a single tokio task, its event loop, which holds the
//! state machine for the transaction type. Inbound messages, application sends
//! and timer firings are posted to that loop as commands, so the machine is only
//! ever touched from one place. Public methods on `Transaction` never block:
//! they validate, post a command and return.
//!
//! Transactions are created by a [`TransactionPool`](crate::pool::TransactionPool)
//! and leave it when they reach [`TransactionState::Terminated`], at which point
//! every timer is cancelled and the application's termination callback runs.
//!
//! ## Forking
//!
//! An INVITE client transaction may receive responses from several UAS
//! instances. When forking is enabled, responses carrying a different To-tag than
//! the first one are handed to a child transaction created on first sight. The
//! child shares a copy of the parent's request, transport and callbacks but has
//! its own state and timers. The parent is held weakly.

pub mod id;
pub(crate) mod runner;
pub mod state;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use id::{DialogId, TransactionId};
pub use state::{validate_transition, AtomicTransactionState, TransactionState};

use crate::dispatch::DispatchContext;
use crate::error::{Error, Result};
use crate::fsm::{self, StateMachine};
use crate::message::{Message, Method, RequestOptions, SipMessageExt};
use crate::pool::PoolShared;
use crate::timer::{TimerName, TimerProfile, TimerScheduler};
use crate::transport::TransportHandle;
use runner::Command;

/// The four RFC 3261 transaction types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionType {
    /// ICT, RFC 3261 Section 17.1.1
    InviteClient,
    /// IST, RFC 3261 Section 17.2.1
    InviteServer,
    /// NICT, RFC 3261 Section 17.1.2
    NonInviteClient,
    /// NIST, RFC 3261 Section 17.2.2
    NonInviteServer,
}

impl TransactionType {
    pub fn is_client(self) -> bool {
        matches!(self, TransactionType::InviteClient | TransactionType::NonInviteClient)
    }

    pub fn is_server(self) -> bool {
        !self.is_client()
    }

    pub fn is_invite(self) -> bool {
        matches!(self, TransactionType::InviteClient | TransactionType::InviteServer)
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionType::InviteClient => "ICT",
            TransactionType::InviteServer => "IST",
            TransactionType::NonInviteClient => "NICT",
            TransactionType::NonInviteServer => "NIST",
        };
        f.write_str(name)
    }
}

/// Events an INVITE server transaction reports after its final response went out.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The ACK for the final response arrived.
    AckReceived(Message),
    /// Timer H expired without an ACK.
    AckTimeout(Error),
}

/// Called for every response (or timeout) a client transaction passes up.
pub type ResponseCallback =
    Arc<dyn Fn(Result<Message>, Option<TransportHandle>, Arc<Transaction>) + Send + Sync>;

/// Called once when a transaction reaches TERMINATED.
pub type TerminateCallback = Arc<dyn Fn(Arc<Transaction>) + Send + Sync>;

/// Called with ACK notifications for an INVITE server transaction.
pub type ServerEventCallback = Arc<dyn Fn(ServerEvent, Arc<Transaction>) + Send + Sync>;

#[derive(Default)]
struct Binding {
    transport: Option<TransportHandle>,
    local_address: Option<SocketAddr>,
    remote_address: Option<SocketAddr>,
    send_address: Option<SocketAddr>,
    dialog_target: Option<SocketAddr>,
}

#[derive(Default, Clone)]
struct Callbacks {
    response: Option<ResponseCallback>,
    terminate: Option<TerminateCallback>,
    server_event: Option<ServerEventCallback>,
}

fn new_log_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

/// A SIP transaction. Always handled through `Arc<Transaction>`.
pub struct Transaction {
    id: TransactionId,
    kind: TransactionType,
    state: AtomicTransactionState,
    log_id: RwLock<String>,
    timers: TimerScheduler,
    commands: mpsc::UnboundedSender<Command>,
    binding: RwLock<Binding>,
    callbacks: RwLock<Callbacks>,
    request: RwLock<Option<Message>>,
    options: RwLock<RequestOptions>,
    requeued: AtomicBool,
    parent: Option<Weak<Transaction>>,
    children: Mutex<HashMap<String, Arc<Transaction>>>,
    fork_tag: Mutex<Option<String>>,
    pool: Weak<PoolShared>,
    context: Arc<DispatchContext>,
    finalized: AtomicBool,
}

impl Transaction {
    /// Creates the transaction and starts its event loop on the current runtime.
    pub(crate) fn spawn(
        id: TransactionId,
        kind: TransactionType,
        profile: TimerProfile,
        context: Arc<DispatchContext>,
        pool: Weak<PoolShared>,
        parent: Option<&Arc<Transaction>>,
        machine: Box<dyn StateMachine>,
    ) -> Arc<Self> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let log_id = parent.map(|p| p.log_id()).unwrap_or_else(new_log_id);
        let transaction = Arc::new(Self {
            id,
            kind,
            state: AtomicTransactionState::new(TransactionState::Idle),
            log_id: RwLock::new(log_id),
            timers: TimerScheduler::new(profile, commands.clone()),
            commands,
            binding: RwLock::new(Binding::default()),
            callbacks: RwLock::new(Callbacks::default()),
            request: RwLock::new(None),
            options: RwLock::new(RequestOptions::default()),
            requeued: AtomicBool::new(false),
            parent: parent.map(Arc::downgrade),
            children: Mutex::new(HashMap::new()),
            fork_tag: Mutex::new(None),
            pool,
            context,
            finalized: AtomicBool::new(false),
        });
        tokio::spawn(runner::run_transaction_loop(
            Arc::downgrade(&transaction),
            machine,
            command_rx,
        ));
        transaction
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn kind(&self) -> TransactionType {
        self.kind
    }

    pub fn state(&self) -> TransactionState {
        self.state.get()
    }

    /// Tag attached to every log line of this transaction (and its forked children).
    pub fn log_id(&self) -> String {
        self.log_id.read().clone()
    }

    pub fn set_log_id(&self, log_id: impl Into<String>) {
        *self.log_id.write() = log_id.into();
    }

    pub fn timer_profile(&self) -> TimerProfile {
        *self.timers.profile()
    }

    pub fn is_timer_armed(&self, name: TimerName) -> bool {
        self.timers.is_armed(name)
    }

    pub fn armed_timers(&self) -> Vec<TimerName> {
        self.timers.armed()
    }

    /// Delay the named timer was last armed with, while it is armed.
    pub fn armed_timer_delay(&self, name: TimerName) -> Option<std::time::Duration> {
        self.timers.armed_delay(name)
    }

    pub fn transport(&self) -> Option<TransportHandle> {
        self.binding.read().transport.clone()
    }

    pub fn is_reliable(&self) -> bool {
        self.binding
            .read()
            .transport
            .as_ref()
            .is_some_and(|t| t.is_reliable_transport())
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.binding.read().local_address
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.binding.read().remote_address
    }

    pub fn dialog_target(&self) -> Option<SocketAddr> {
        self.binding.read().dialog_target
    }

    /// The request that started a client transaction.
    pub fn request(&self) -> Option<Message> {
        self.request.read().clone()
    }

    /// Options the client transaction was started with.
    pub fn request_options(&self) -> RequestOptions {
        self.options.read().clone()
    }

    /// True when the request reached the application after being queued by the
    /// throttle handler.
    pub fn was_queued(&self) -> bool {
        self.requeued.load(Ordering::Acquire)
    }

    pub fn is_child(&self) -> bool {
        self.parent.is_some()
    }

    pub fn parent(&self) -> Option<Arc<Transaction>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn children(&self) -> Vec<Arc<Transaction>> {
        self.children.lock().values().cloned().collect()
    }

    pub fn find_child(&self, to_tag: &str) -> Option<Arc<Transaction>> {
        self.children.lock().get(to_tag).cloned()
    }

    /// To-tag of the dialog this (parent or child) transaction follows.
    pub fn fork_tag(&self) -> Option<String> {
        self.fork_tag.lock().clone()
    }

    /// Sends a response through a server transaction.
    ///
    /// The response goes to the address the request came from unless a send
    /// address was set with [`send_response_to`](Self::send_response_to).
    ///
    /// For an INVITE server transaction the ACK outcome (ACK received or Timer H
    /// expired) goes to the callback given to
    /// [`send_response_with_callback`](Self::send_response_with_callback), or to
    /// the dispatcher's server event handler when none was given.
    pub fn send_response(&self, response: Message) -> Result<()> {
        if !response.is_response() {
            return Err(Error::InvalidMessage(
                "send_response requires a response".into(),
            ));
        }
        if !self.kind.is_server() {
            return Err(Error::InvalidMessage(format!(
                "{} transactions do not send responses",
                self.kind
            )));
        }
        if self.state().is_terminated() {
            return Err(Error::TransactionTerminated(self.id.clone()));
        }
        if self.transport().is_none() {
            return Err(Error::TransportNotReady(format!(
                "no transport bound to {}",
                self.id
            )));
        }
        self.post(Command::Send { message: response })
    }

    /// Like [`send_response`](Self::send_response) with an explicit destination.
    pub fn send_response_to(&self, response: Message, send_address: SocketAddr) -> Result<()> {
        self.binding.write().send_address = Some(send_address);
        self.send_response(response)
    }

    /// Sends a response and registers a callback for the ACK outcome
    /// (INVITE server transactions).
    pub fn send_response_with_callback(
        &self,
        response: Message,
        on_event: ServerEventCallback,
    ) -> Result<()> {
        {
            let mut callbacks = self.callbacks.write();
            if callbacks.server_event.is_none() {
                callbacks.server_event = Some(on_event);
            }
        }
        self.send_response(response)
    }

    /// Sends the ACK for a 2xx straight to the dialog target.
    ///
    /// A 2xx ends the INVITE client transaction, so the ACK bypasses the state
    /// machine and only reuses the transaction's transport.
    pub fn send_ack_for_2xx(&self, ack: Message, dialog_target: SocketAddr) -> Result<()> {
        if !ack.is_request_method(&Method::Ack) {
            return Err(Error::InvalidMessage(
                "send_ack_for_2xx requires an ACK request".into(),
            ));
        }
        if self.kind != TransactionType::InviteClient {
            return Err(Error::InvalidMessage(format!(
                "{} transactions do not send ACKs",
                self.kind
            )));
        }
        let transport = self.transport().ok_or_else(|| {
            Error::TransportNotReady(format!("no transport bound to {}", self.id))
        })?;
        self.binding.write().dialog_target = Some(dialog_target);

        let log_id = self.log_id();
        let id = self.id.clone();
        tokio::spawn(async move {
            log_outbound(&log_id, &ack, &transport, Some(dialog_target));
            let result = if transport.is_reliable_transport() {
                transport.write_message(&ack).await
            } else {
                transport.write_message_to(&ack, dialog_target).await
            };
            if let Err(e) = result {
                warn!(id = %id, log_id = %log_id, error = %e, "Failed to send ACK for 2xx");
            }
        });
        Ok(())
    }

    /// Forces the transaction, and every forked child it spawned, to TERMINATED.
    pub fn terminate(&self) {
        self.force_terminate_tree();
    }

    pub(crate) fn post(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::TransactionTerminated(self.id.clone()))
    }

    pub(crate) fn timers(&self) -> &TimerScheduler {
        &self.timers
    }

    pub(crate) fn context(&self) -> &DispatchContext {
        &self.context
    }

    pub(crate) fn pool(&self) -> Option<Arc<PoolShared>> {
        self.pool.upgrade()
    }

    pub(crate) fn set_state(&self, new_state: TransactionState) -> Result<()> {
        let current = self.state();
        validate_transition(self.kind, current, new_state)?;
        if current != new_state {
            self.state.set(new_state);
            debug!(
                id = %self.id,
                log_id = %self.log_id(),
                "{} state {} -> {}",
                self.kind,
                current,
                new_state
            );
            if new_state.is_terminated() {
                self.entered_terminated();
            }
        }
        Ok(())
    }

    /// Synchronously moves to TERMINATED and cancels every timer; the event loop
    /// finishes the cleanup.
    pub(crate) fn force_terminate(&self) {
        let previous = self.state.set(TransactionState::Terminated);
        self.timers.cancel_all();
        if previous != TransactionState::Terminated {
            debug!(id = %self.id, log_id = %self.log_id(), "{} forced {} -> TERMINATED", self.kind, previous);
            self.entered_terminated();
        }
        let _ = self.post(Command::Terminate);
    }

    /// [`force_terminate`](Self::force_terminate) on this transaction and its
    /// forked children. Children are only reachable through their parent.
    pub(crate) fn force_terminate_tree(&self) {
        for child in self.children() {
            child.force_terminate();
        }
        self.force_terminate();
    }

    /// Runs on the thread that set TERMINATED, before the event loop cleans up.
    /// An INVITE server id is blocklisted here so a retransmission racing the
    /// cleanup cannot open a second transaction.
    fn entered_terminated(&self) {
        if self.kind == TransactionType::InviteServer {
            self.context.block_ist(&self.id);
        }
    }

    /// Returns true the first time it is called.
    pub(crate) fn mark_finalized(&self) -> bool {
        !self.finalized.swap(true, Ordering::AcqRel)
    }

    /// Binds the transport the first message arrived on (or was sent through).
    pub(crate) fn bind_transport(&self, transport: &TransportHandle) {
        let mut binding = self.binding.write();
        if binding.transport.is_none() {
            binding.transport = Some(transport.clone());
        }
        if binding.local_address.is_none() {
            binding.local_address = Some(transport.local_address());
        }
        if binding.remote_address.is_none() {
            binding.remote_address = Some(transport.remote_address());
        }
    }

    pub(crate) fn bind_addresses(&self, local: SocketAddr, remote: SocketAddr) {
        let mut binding = self.binding.write();
        binding.local_address = Some(local);
        binding.remote_address = Some(remote);
    }

    pub(crate) fn set_request(&self, request: Message, options: RequestOptions) {
        let mut slot = self.request.write();
        if slot.is_none() {
            *slot = Some(request);
            *self.options.write() = options;
        }
    }

    pub(crate) fn mark_queued(&self) {
        self.requeued.store(true, Ordering::Release);
    }

    pub(crate) fn set_client_callbacks(
        &self,
        on_response: ResponseCallback,
        on_terminated: Option<TerminateCallback>,
    ) {
        let mut callbacks = self.callbacks.write();
        if callbacks.response.is_none() {
            callbacks.response = Some(on_response);
        }
        if callbacks.terminate.is_none() {
            callbacks.terminate = on_terminated;
        }
    }

    /// Passes a response or timeout to the application unless already terminated.
    pub(crate) fn inform_tu(
        self: &Arc<Self>,
        result: Result<Message>,
        transport: Option<TransportHandle>,
    ) {
        if self.state().is_terminated() {
            return;
        }
        let callback = self.callbacks.read().response.clone();
        match callback {
            Some(callback) => callback(result, transport, self.clone()),
            None => debug!(id = %self.id, "No response handler registered, dropping event"),
        }
    }

    /// Hands an IST ACK outcome to the transaction's callback, falling back to
    /// the dispatcher's server event handler.
    pub(crate) fn notify_server_event(self: &Arc<Self>, event: ServerEvent) {
        let callback = self
            .callbacks
            .read()
            .server_event
            .clone()
            .or_else(|| self.context.server_event_handler());
        match callback {
            Some(callback) => callback(event, self.clone()),
            None => debug!(id = %self.id, ?event, "No server event handler registered, dropping event"),
        }
    }

    pub(crate) fn notify_terminated(self: &Arc<Self>) {
        let callback = self.callbacks.read().terminate.clone();
        if let Some(callback) = callback {
            callback(self.clone());
        }
    }

    /// Claims `tag` as this transaction's dialog tag if none is set yet.
    /// Returns true when `tag` is (now) the transaction's own tag.
    pub(crate) fn claim_fork_tag(&self, tag: &str) -> bool {
        let mut fork_tag = self.fork_tag.lock();
        if let Some(own) = fork_tag.as_ref() {
            return own == tag;
        }
        *fork_tag = Some(tag.to_string());
        true
    }

    /// Returns the child following `tag`, creating it on first sight.
    pub(crate) fn find_or_spawn_child(self: &Arc<Self>, tag: &str) -> Result<Arc<Transaction>> {
        let mut children = self.children.lock();
        if let Some(child) = children.get(tag) {
            return Ok(child.clone());
        }
        let request = self
            .request()
            .ok_or_else(|| Error::Other(format!("{} has no request to fork from", self.id)))?;
        let machine = fsm::child_machine(self.kind, request.clone())?;
        let child = Transaction::spawn(
            self.id.child(tag),
            self.kind,
            *self.timers.profile(),
            self.context.clone(),
            self.pool.clone(),
            Some(self),
            machine,
        );
        {
            let parent_binding = self.binding.read();
            let mut binding = child.binding.write();
            binding.transport = parent_binding.transport.clone();
            binding.local_address = parent_binding.local_address;
            binding.remote_address = parent_binding.remote_address;
        }
        *child.callbacks.write() = self.callbacks.read().clone();
        *child.request.write() = Some(request);
        *child.options.write() = self.options.read().clone();
        *child.fork_tag.lock() = Some(tag.to_string());

        info!(id = %child.id, log_id = %child.log_id(), parent = %self.id, "Forked child transaction CREATED");
        children.insert(tag.to_string(), child.clone());
        Ok(child)
    }

    /// A forked child's 2xx ends the fork-set: the parent and any sibling still
    /// waiting for a final response are terminated.
    pub(crate) fn terminate_fork_set(&self) -> Result<()> {
        let parent = self
            .parent()
            .ok_or_else(|| Error::OrphanedChild(self.id.clone()))?;
        if !parent.state().is_terminated() {
            parent.force_terminate();
        }
        for sibling in parent.children() {
            if sibling.id != self.id && sibling.state() < TransactionState::Completed {
                sibling.force_terminate();
            }
        }
        Ok(())
    }

    /// Writes through the bound transport.
    ///
    /// Requests go to the remote address. Responses go to the send address when
    /// one was set, otherwise back to the remote address. A reliable connection
    /// that fails its keep-alive is re-established through the transport
    /// service before a response is written (RFC 3261 Section 18.2.2).
    pub(crate) async fn write(&self, message: &Message) -> Result<()> {
        let (transport, destination) = {
            let binding = self.binding.read();
            let destination = if message.is_response() {
                binding.send_address.or(binding.remote_address)
            } else {
                binding.remote_address
            };
            (binding.transport.clone(), destination)
        };
        let mut transport = transport.ok_or_else(|| {
            Error::TransportNotReady(format!("no transport bound to {}", self.id))
        })?;

        if message.is_response()
            && transport.is_reliable_transport()
            && !transport.write_keep_alive().await
        {
            transport = self.reconnect(&transport, destination).await?;
        }

        log_outbound(&self.log_id(), message, &transport, destination);
        if transport.is_reliable_transport() {
            transport.write_message(message).await
        } else {
            let destination = destination.ok_or_else(|| {
                Error::TransportNotReady(format!("no destination known for {}", self.id))
            })?;
            transport.write_message_to(message, destination).await
        }
    }

    async fn reconnect(
        &self,
        stale: &TransportHandle,
        destination: Option<SocketAddr>,
    ) -> Result<TransportHandle> {
        let service = self.context.transport_service().ok_or_else(|| {
            Error::TransportNotReady("connection lost and no transport service registered".into())
        })?;
        let remote = destination.unwrap_or_else(|| stale.remote_address());
        warn!(
            id = %self.id,
            log_id = %self.log_id(),
            %remote,
            "Reliable transport lost, re-establishing connection for response"
        );
        let fresh = service
            .create_client_transport(stale.local_address(), remote, stale.transport_scheme(), None)
            .await?;
        self.binding.write().transport = Some(fresh.clone());
        Ok(fresh)
    }
}

fn log_outbound(
    log_id: &str,
    message: &Message,
    transport: &TransportHandle,
    destination: Option<SocketAddr>,
) {
    let destination = destination.unwrap_or_else(|| transport.remote_address());
    info!(
        log_id = %log_id,
        ">>> {} LEN: {} SRC: {} DST: {} PROT: {}",
        message.start_line_text(),
        message.wire_len(),
        transport.local_address(),
        destination,
        transport.transport_scheme()
    );
    debug!(log_id = %log_id, "\n{}", message);
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("is_child", &self.is_child())
            .finish()
    }
}
