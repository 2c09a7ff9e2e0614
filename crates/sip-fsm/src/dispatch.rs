//! # FSM Dispatcher
//!
//! The single routing authority between the transport layer, the application
//! and the four transaction pools.
//!
//! ## Inbound routing
//!
//! | Message | Pool | Lookup |
//! |---------|------|--------|
//! | INVITE | IST | create unless blocklisted |
//! | ACK | IST | non-creating, then ACKable sub-pool by dialog |
//! | other request | NIST | create |
//! | response, CSeq INVITE | ICT | non-creating, fork-aware |
//! | other response | NICT | non-creating |
//!
//! An unmatched ACK or an unmatched 2xx to an INVITE goes to the orphan handler
//! (they belong to dialogs, not transactions). Anything else unmatched is
//! logged and dropped.
//!
//! ## Outbound
//!
//! [`FsmDispatcher::send_request`] creates the client transaction, binds its
//! transport and addresses, registers the response/termination callbacks and
//! posts the request to the transaction's event loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::FsmConfig;
use crate::error::{Error, Result};
use crate::message::{
    Message, MessageClass, Method, RequestOptions, SipMessageExt, TransactionClass,
};
use crate::pool::{
    AckablePool, ForkResolver, InviteForking, IstBlocklist, NoForking, PoolShared, TransactionPool,
};
use crate::transaction::runner::Command;
use crate::transaction::{
    ResponseCallback, ServerEventCallback, TerminateCallback, Transaction, TransactionId,
    TransactionType,
};
use crate::transport::{TransportHandle, TransportService};

/// Receives every new inbound request together with its server transaction.
pub type RequestHandler = Arc<dyn Fn(Message, TransportHandle, Arc<Transaction>) + Send + Sync>;

/// Receives ACKs and 2xx responses that belong to no transaction.
pub type OrphanHandler = Arc<dyn Fn(Message, TransportHandle) + Send + Sync>;

/// Decides how long a new non-INVITE request waits before it is dispatched.
/// `Duration::ZERO` dispatches immediately.
pub type ThrottleHandler =
    Arc<dyn Fn(&Message, &TransportHandle, &Arc<Transaction>) -> Duration + Send + Sync>;

/// State shared by the dispatcher and every transaction it created.
pub(crate) struct DispatchContext {
    request_handler: RwLock<Option<RequestHandler>>,
    orphan_handler: RwLock<Option<OrphanHandler>>,
    throttle_handler: RwLock<Option<ThrottleHandler>>,
    server_event_handler: RwLock<Option<ServerEventCallback>>,
    transport_service: RwLock<Option<Arc<dyn TransportService>>>,
    ist_blocklist: Arc<IstBlocklist>,
    ackable: AckablePool,
}

impl DispatchContext {
    fn new(ist_blocklist: Arc<IstBlocklist>) -> Self {
        Self {
            request_handler: RwLock::new(None),
            orphan_handler: RwLock::new(None),
            throttle_handler: RwLock::new(None),
            server_event_handler: RwLock::new(None),
            transport_service: RwLock::new(None),
            ist_blocklist,
            ackable: AckablePool::new(),
        }
    }

    pub(crate) fn deliver_request(
        &self,
        request: Message,
        transport: TransportHandle,
        transaction: &Arc<Transaction>,
    ) {
        let handler = self.request_handler.read().clone();
        match handler {
            Some(handler) => handler(request, transport, transaction.clone()),
            None => warn!(
                id = %transaction.id(),
                "No request handler registered, dropping {}",
                request.start_line_text()
            ),
        }
    }

    pub(crate) fn notify_orphan(&self, message: Message, transport: TransportHandle) {
        let handler = self.orphan_handler.read().clone();
        match handler {
            Some(handler) => handler(message, transport),
            None => debug!("No orphan handler registered, dropping {}", message.start_line_text()),
        }
    }

    pub(crate) fn throttle_delay(
        &self,
        request: &Message,
        transport: &TransportHandle,
        transaction: &Arc<Transaction>,
    ) -> Duration {
        let handler = self.throttle_handler.read().clone();
        handler.map_or(Duration::ZERO, |handler| handler(request, transport, transaction))
    }

    pub(crate) fn server_event_handler(&self) -> Option<ServerEventCallback> {
        self.server_event_handler.read().clone()
    }

    pub(crate) fn transport_service(&self) -> Option<Arc<dyn TransportService>> {
        self.transport_service.read().clone()
    }

    pub(crate) fn block_ist(&self, id: &TransactionId) {
        self.ist_blocklist.insert(id.clone());
    }

    pub(crate) fn ackable(&self) -> &AckablePool {
        &self.ackable
    }
}

/// Routes SIP messages to RFC 3261 transactions.
pub struct FsmDispatcher {
    config: FsmConfig,
    context: Arc<DispatchContext>,
    forking: Arc<AtomicBool>,
    ict: TransactionPool,
    ist: TransactionPool,
    nict: TransactionPool,
    nist: TransactionPool,
    housekeeping: Mutex<Option<JoinHandle<()>>>,
}

impl FsmDispatcher {
    /// Creates a dispatcher with its own IST blocklist.
    ///
    /// When called inside a tokio runtime the housekeeping tick starts right
    /// away; otherwise call [`start_housekeeping`](Self::start_housekeeping) later.
    pub fn new(config: FsmConfig) -> Self {
        let blocklist = Arc::new(IstBlocklist::new(config.ist_block_duration));
        Self::with_blocklist(config, blocklist)
    }

    /// Creates a dispatcher sharing an existing IST blocklist.
    pub fn with_blocklist(config: FsmConfig, ist_blocklist: Arc<IstBlocklist>) -> Self {
        Self::build(config, ist_blocklist, Box::new(NoForking))
    }

    /// Creates a dispatcher whose non-INVITE client pool routes responses
    /// through `nict_forking`, e.g. a SUBSCRIBE answered from several dialogs.
    pub fn with_nict_forking(config: FsmConfig, nict_forking: Box<dyn ForkResolver>) -> Self {
        let blocklist = Arc::new(IstBlocklist::new(config.ist_block_duration));
        Self::build(config, blocklist, nict_forking)
    }

    fn build(
        config: FsmConfig,
        ist_blocklist: Arc<IstBlocklist>,
        nict_forking: Box<dyn ForkResolver>,
    ) -> Self {
        let context = Arc::new(DispatchContext::new(ist_blocklist));
        let forking = Arc::new(AtomicBool::new(config.enable_ict_forking));
        let profile = config.timers;

        let dispatcher = Self {
            ict: TransactionPool::new(
                TransactionType::InviteClient,
                profile,
                context.clone(),
                Box::new(InviteForking::new(forking.clone())),
            ),
            ist: TransactionPool::new(
                TransactionType::InviteServer,
                profile,
                context.clone(),
                Box::new(NoForking),
            ),
            nict: TransactionPool::new(
                TransactionType::NonInviteClient,
                profile,
                context.clone(),
                nict_forking,
            ),
            nist: TransactionPool::new(
                TransactionType::NonInviteServer,
                profile,
                context.clone(),
                Box::new(NoForking),
            ),
            config,
            context,
            forking,
            housekeeping: Mutex::new(None),
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            dispatcher.start_housekeeping();
        }
        dispatcher
    }

    pub fn config(&self) -> &FsmConfig {
        &self.config
    }

    pub fn set_request_handler(&self, handler: RequestHandler) {
        *self.context.request_handler.write() = Some(handler);
    }

    pub fn set_orphan_handler(&self, handler: OrphanHandler) {
        *self.context.orphan_handler.write() = Some(handler);
    }

    pub fn set_throttle_handler(&self, handler: ThrottleHandler) {
        *self.context.throttle_handler.write() = Some(handler);
    }

    /// Receives IST ACK outcomes (ACK received, Timer H expired) for
    /// transactions whose response was sent without a per-transaction callback.
    pub fn set_server_event_handler(&self, handler: ServerEventCallback) {
        *self.context.server_event_handler.write() = Some(handler);
    }

    pub fn set_transport_service(&self, service: Arc<dyn TransportService>) {
        *self.context.transport_service.write() = Some(service);
    }

    pub fn enable_ict_forking(&self, enabled: bool) {
        self.forking.store(enabled, Ordering::Release);
        info!(enabled, "ICT forking toggled");
    }

    pub fn is_ict_forking_enabled(&self) -> bool {
        self.forking.load(Ordering::Acquire)
    }

    pub fn ict_pool(&self) -> &TransactionPool {
        &self.ict
    }

    pub fn ist_pool(&self) -> &TransactionPool {
        &self.ist
    }

    pub fn nict_pool(&self) -> &TransactionPool {
        &self.nict
    }

    pub fn nist_pool(&self) -> &TransactionPool {
        &self.nist
    }

    pub fn ist_blocklist(&self) -> &Arc<IstBlocklist> {
        &self.context.ist_blocklist
    }

    /// Routes one inbound message. Never blocks: the message is posted to the
    /// matching transaction's event loop.
    pub fn on_received_message(&self, message: Message, transport: TransportHandle) {
        let Some(class) = message.class() else {
            warn!("Unable to classify {}, dropping", message.start_line_text());
            return;
        };
        let Some(id) = TransactionId::from_message(&message) else {
            warn!(
                "{} has no usable CSeq/Via/Call-ID, dropping",
                message.start_line_text()
            );
            return;
        };

        let mut created = false;
        let mut matched_by_dialog = false;
        let (found, expected) = match class {
            MessageClass::Request(TransactionClass::Invite) => {
                if self.context.ist_blocklist.contains(&id) {
                    warn!(id = %id, "Blocked request retransmission - {}", message.start_line_text());
                    return;
                }
                let (transaction, is_new) = self.ist.find_or_create(&id);
                created = is_new;
                (Some(transaction), TransactionType::InviteServer)
            }
            MessageClass::Request(TransactionClass::Ack) => {
                let found = self.ist.find(&id).or_else(|| {
                    let by_dialog = message
                        .dialog_id()
                        .and_then(|dialog| self.context.ackable.find(&dialog));
                    matched_by_dialog = by_dialog.is_some();
                    by_dialog
                });
                (found, TransactionType::InviteServer)
            }
            MessageClass::Request(TransactionClass::NonInvite) => {
                let (transaction, is_new) = self.nist.find_or_create(&id);
                created = is_new;
                (Some(transaction), TransactionType::NonInviteServer)
            }
            MessageClass::Response {
                class: TransactionClass::Invite,
                ..
            } => (
                self.ict
                    .find_for_response(&message, &id)
                    .filter(|t| !t.state().is_terminated()),
                TransactionType::InviteClient,
            ),
            MessageClass::Response { .. } => (
                self.nict
                    .find_for_response(&message, &id)
                    .filter(|t| !t.state().is_terminated()),
                TransactionType::NonInviteClient,
            ),
        };

        let Some(transaction) = found else {
            let is_ack = class == MessageClass::Request(TransactionClass::Ack);
            let is_invite_2xx = matches!(
                class,
                MessageClass::Response { status: 200..=299, class: TransactionClass::Invite }
            );
            if is_ack || is_invite_2xx {
                debug!(id = %id, "Orphaned {}", message.start_line_text());
                self.context.notify_orphan(message, transport);
            } else {
                warn!(
                    id = %id,
                    "Unable to match incoming message to a transaction - {}",
                    message.start_line_text()
                );
            }
            return;
        };

        if transaction.kind() != expected {
            error!(
                id = %id,
                found = %transaction.kind(),
                expected = %expected,
                "Pool returned a transaction of the wrong type, dropping message"
            );
            return;
        }

        if created {
            info!(id = %id, log_id = %transaction.log_id(), "{} transaction CREATED", expected);
        } else {
            trace!(id = %transaction.id(), "Found transaction");
        }
        transaction.bind_transport(&transport);

        let orphan_copy = matched_by_dialog.then(|| message.clone());
        if transaction
            .post(Command::Receive {
                message,
                transport: transport.clone(),
            })
            .is_err()
        {
            debug!(id = %transaction.id(), "Transaction loop already finished");
        }
        if let Some(ack) = orphan_copy {
            self.context.notify_orphan(ack, transport);
        }
    }

    /// Sends a request through a new client transaction, obtaining the transport
    /// from the registered [`TransportService`].
    ///
    /// The scheme comes from [`RequestOptions::target_transport`], falling back
    /// to the top Via transport.
    pub async fn send_request(
        &self,
        request: Message,
        options: RequestOptions,
        local_address: SocketAddr,
        remote_address: SocketAddr,
        on_response: ResponseCallback,
        on_terminated: Option<TerminateCallback>,
    ) -> Result<Arc<Transaction>> {
        self.start_client_transaction(
            request,
            options,
            None,
            local_address,
            remote_address,
            on_response,
            on_terminated,
        )
        .await
    }

    /// Sends a request through a new client transaction over `transport`.
    pub async fn send_request_on(
        &self,
        request: Message,
        options: RequestOptions,
        transport: TransportHandle,
        remote_address: SocketAddr,
        on_response: ResponseCallback,
        on_terminated: Option<TerminateCallback>,
    ) -> Result<Arc<Transaction>> {
        let local_address = transport.local_address();
        self.start_client_transaction(
            request,
            options,
            Some(transport),
            local_address,
            remote_address,
            on_response,
            on_terminated,
        )
        .await
    }

    async fn start_client_transaction(
        &self,
        request: Message,
        options: RequestOptions,
        transport: Option<TransportHandle>,
        local_address: SocketAddr,
        remote_address: SocketAddr,
        on_response: ResponseCallback,
        on_terminated: Option<TerminateCallback>,
    ) -> Result<Arc<Transaction>> {
        let Some(method) = request.request_method().cloned() else {
            return Err(Error::InvalidMessage(
                "sending a response through send_request is illegal".into(),
            ));
        };
        if method == Method::Ack {
            return Err(Error::InvalidMessage(
                "ACK is not sent through a client transaction, use Transaction::send_ack_for_2xx"
                    .into(),
            ));
        }
        let id = TransactionId::from_message(&request).ok_or(Error::MissingTransactionId)?;
        let pool = if method == Method::Invite { &self.ict } else { &self.nict };

        let (transaction, created) = pool.find_or_create(&id);
        if created {
            transaction.bind_addresses(local_address, remote_address);
            let transport = match transport {
                Some(transport) => Ok(transport),
                None => {
                    self.client_transport(&request, &options, local_address, remote_address)
                        .await
                }
            };
            match transport {
                Ok(transport) => transaction.bind_transport(&transport),
                Err(e) => {
                    error!(id = %id, error = %e, "Unable to obtain a transport for {}", request.start_line_text());
                    transaction.force_terminate();
                    return Err(e);
                }
            }
            transaction.set_request(request.clone(), options);
            info!(id = %id, log_id = %transaction.log_id(), "{} transaction CREATED", pool.kind());
        }
        transaction.set_client_callbacks(on_response, on_terminated);
        transaction.post(Command::Send { message: request })?;
        Ok(transaction)
    }

    async fn client_transport(
        &self,
        request: &Message,
        options: &RequestOptions,
        local_address: SocketAddr,
        remote_address: SocketAddr,
    ) -> Result<TransportHandle> {
        let service = self.context.transport_service().ok_or_else(|| {
            Error::TransportNotReady("no transport service registered".into())
        })?;
        let scheme = options
            .target_transport
            .as_deref()
            .or_else(|| request.top_via_transport())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| {
                Error::TransportNotReady("unable to determine transport scheme".into())
            })?;
        service
            .create_client_transport(
                local_address,
                remote_address,
                &scheme,
                options.transport_id.as_deref(),
            )
            .await
    }

    /// Terminates every transaction in every pool.
    pub fn stop(&self) {
        self.ict.stop_all();
        self.ist.stop_all();
        self.nict.stop_all();
        self.nist.stop_all();
        self.context.ackable.clear();
        info!("FSM dispatcher stopped");
    }

    /// Starts the periodic housekeeping tick on the current runtime.
    pub fn start_housekeeping(&self) {
        let pools: Vec<Weak<PoolShared>> = vec![
            self.ict.downgrade(),
            self.ist.downgrade(),
            self.nict.downgrade(),
            self.nist.downgrade(),
        ];
        let blocklist = Arc::downgrade(&self.context.ist_blocklist);
        let period = self.config.housekeeping_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut alive = false;
                for pool in pools.iter().filter_map(Weak::upgrade) {
                    alive = true;
                    let stats = pool.housekeeping();
                    trace!(pool = %stats.kind, live = stats.live, retired_forks = stats.retired_forks, "Pool housekeeping");
                }
                if !alive {
                    break;
                }
                if let Some(blocklist) = blocklist.upgrade() {
                    let expired = blocklist.sweep();
                    if expired > 0 {
                        trace!(expired, "IST blocklist swept");
                    }
                }
            }
        });
        if let Some(previous) = self.housekeeping.lock().replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for FsmDispatcher {
    fn drop(&mut self) {
        if let Some(handle) = self.housekeeping.lock().take() {
            handle.abort();
        }
    }
}
