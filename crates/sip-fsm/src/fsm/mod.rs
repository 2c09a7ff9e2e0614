//! # Transaction State Machines
//!
//! The four RFC 3261 Section 17 machines:
//!
//! - [`ict::InviteClient`]: INVITE client (17.1.1)
//! - [`ist::InviteServer`]: INVITE server (17.2.1)
//! - [`nict::NonInviteClient`]: non-INVITE client (17.1.2)
//! - [`nist::NonInviteServer`]: non-INVITE server (17.2.2)
//!
//! A machine is owned by its transaction's event loop and reaches the
//! transaction through an [`FsmContext`] built per command. Machines buffer the
//! message they may have to retransmit and arm timers through the transaction's
//! scheduler; they never call into the pool directly. Setting the state to
//! TERMINATED is enough, the event loop performs the cleanup.

pub(crate) mod ict;
pub(crate) mod ist;
pub(crate) mod nict;
pub(crate) mod nist;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, trace};

use crate::dispatch::DispatchContext;
use crate::error::{Error, Result};
use crate::message::{Message, SipMessageExt};
use crate::timer::{TimerName, TimerProfile, TimerScheduler};
use crate::transaction::{Transaction, TransactionState, TransactionType};
use crate::transport::TransportHandle;

/// Behaviour shared by the four transaction machines.
#[async_trait]
pub(crate) trait StateMachine: Send {
    /// A message routed to the transaction by the dispatcher.
    async fn on_received_message(
        &mut self,
        ctx: &FsmContext<'_>,
        message: Message,
        transport: TransportHandle,
    );

    /// A message the application sends. `Ok(true)` means the event loop must
    /// write it to the transport.
    async fn on_send_message(&mut self, ctx: &FsmContext<'_>, message: &Message) -> Result<bool>;

    async fn on_timer(&mut self, ctx: &FsmContext<'_>, timer: TimerName);

    /// Runs once during cleanup, after the timers were cancelled.
    fn on_terminate(&mut self, _ctx: &FsmContext<'_>) {}
}

/// What a machine sees of its transaction while handling one command.
pub(crate) struct FsmContext<'a> {
    transaction: &'a Arc<Transaction>,
}

impl<'a> FsmContext<'a> {
    pub(crate) fn new(transaction: &'a Arc<Transaction>) -> Self {
        Self { transaction }
    }

    pub(crate) fn transaction(&self) -> &'a Arc<Transaction> {
        self.transaction
    }

    pub(crate) fn timers(&self) -> &'a TimerScheduler {
        self.transaction.timers()
    }

    pub(crate) fn profile(&self) -> &'a TimerProfile {
        self.transaction.timers().profile()
    }

    pub(crate) fn dispatch(&self) -> &'a DispatchContext {
        self.transaction.context()
    }

    pub(crate) fn state(&self) -> TransactionState {
        self.transaction.state()
    }

    pub(crate) fn is_reliable(&self) -> bool {
        self.transaction.is_reliable()
    }

    /// Applies a transition, logging and refusing the ones the diagram forbids.
    pub(crate) fn set_state(&self, state: TransactionState) -> bool {
        match self.transaction.set_state(state) {
            Ok(()) => true,
            Err(e) => {
                error!(id = %self.transaction.id(), error = %e, "State transition refused");
                false
            }
        }
    }

    pub(crate) fn terminate(&self) {
        self.set_state(TransactionState::Terminated);
    }

    /// Arms `timer`, skipping the retransmission timers over a reliable transport.
    pub(crate) fn start_timer(&self, timer: TimerName, delay: Option<std::time::Duration>) {
        if timer.is_unreliable_only() && self.is_reliable() {
            trace!(id = %self.transaction.id(), %timer, "Reliable transport, timer not armed");
            return;
        }
        self.timers().start(timer, delay);
    }

    pub(crate) async fn write(&self, message: &Message) {
        if let Err(e) = self.transaction.write(message).await {
            error!(
                id = %self.transaction.id(),
                error = %e,
                "Failed to write {}",
                message.start_line_text()
            );
        }
    }
}

/// Fresh machine for a transaction created by a pool.
pub(crate) fn new_machine(kind: TransactionType) -> Box<dyn StateMachine> {
    match kind {
        TransactionType::InviteClient => Box::new(ict::InviteClient::new()),
        TransactionType::InviteServer => Box::new(ist::InviteServer::new()),
        TransactionType::NonInviteClient => Box::new(nict::NonInviteClient::new()),
        TransactionType::NonInviteServer => Box::new(nist::NonInviteServer::new()),
    }
}

/// Machine for a forked child that inherits the parent's request.
pub(crate) fn child_machine(kind: TransactionType, request: Message) -> Result<Box<dyn StateMachine>> {
    match kind {
        TransactionType::InviteClient => Ok(Box::new(ict::InviteClient::child(request))),
        TransactionType::NonInviteClient => Ok(Box::new(nict::NonInviteClient::child(request))),
        other => Err(Error::Other(format!("{} transactions cannot be forked", other))),
    }
}
