use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result, TimeoutKind};
use crate::fsm::{FsmContext, StateMachine};
use crate::message::{Message, Method, SipMessageExt};
use crate::timer::TimerName;
use crate::transaction::{DialogId, ServerEvent, TransactionState};
use crate::transport::TransportHandle;
use crate::utils::stamp_received;

/// INVITE server transaction (RFC 3261 Section 17.2.1).
///
/// The first INVITE moves the transaction to PROCEEDING and goes to the
/// application. A final response moves it to COMPLETED where Timer G
/// (unreliable only) retransmits the response until an ACK arrives or Timer H
/// gives up. Retransmitted INVITEs are answered from the cached response.
pub(crate) struct InviteServer {
    provisional: Option<Message>,
    final_response: Option<Message>,
    retransmit_interval: Duration,
    ackable: Option<DialogId>,
}

impl InviteServer {
    pub(crate) fn new() -> Self {
        Self {
            provisional: None,
            final_response: None,
            retransmit_interval: Duration::ZERO,
            ackable: None,
        }
    }
}

#[async_trait]
impl StateMachine for InviteServer {
    async fn on_received_message(
        &mut self,
        ctx: &FsmContext<'_>,
        message: Message,
        transport: TransportHandle,
    ) {
        let transaction = ctx.transaction();
        let method = match message.request_method() {
            Some(method) => method.clone(),
            None => {
                debug!(id = %transaction.id(), "IST ignoring response {}", message.start_line_text());
                return;
            }
        };

        match (ctx.state(), method) {
            (TransactionState::Idle, Method::Invite) => {
                ctx.timers().start(TimerName::MaxLifetime, None);
                let mut request = message;
                stamp_received(&mut request, transport.remote_address());
                ctx.set_state(TransactionState::Proceeding);
                ctx.dispatch().deliver_request(request, transport, transaction);
            }
            (TransactionState::Proceeding, Method::Invite) => {
                if let Some(provisional) = self.provisional.as_ref() {
                    debug!(id = %transaction.id(), "Retransmitted INVITE, resending provisional response");
                    ctx.write(provisional).await;
                }
            }
            (TransactionState::Completed, Method::Invite) => {
                if let Some(response) = self.final_response.as_ref() {
                    debug!(id = %transaction.id(), "Retransmitted INVITE, resending final response");
                    ctx.write(response).await;
                }
            }
            (TransactionState::Completed, Method::Ack) => {
                ctx.timers().cancel(TimerName::H);
                ctx.timers().cancel(TimerName::G);
                transaction.notify_server_event(ServerEvent::AckReceived(message));
                if ctx.is_reliable() {
                    ctx.terminate();
                } else {
                    ctx.set_state(TransactionState::Confirmed);
                    ctx.timers().start(TimerName::I, None);
                }
            }
            (TransactionState::Confirmed, Method::Ack) => {
                trace!(id = %transaction.id(), "Absorbing ACK retransmission");
            }
            (state, method) => {
                debug!(id = %transaction.id(), %state, %method, "IST ignoring request");
            }
        }
    }

    async fn on_send_message(&mut self, ctx: &FsmContext<'_>, message: &Message) -> Result<bool> {
        if !message.is_response() {
            return Err(Error::InvalidMessage(format!(
                "IST cannot send {}",
                message.start_line_text()
            )));
        }
        if ctx.state() != TransactionState::Proceeding {
            return Ok(false);
        }

        if message.is_1xx() {
            self.provisional = Some(message.clone());
            return Ok(true);
        }

        self.final_response = Some(message.clone());
        if !ctx.set_state(TransactionState::Completed) {
            return Ok(false);
        }
        self.retransmit_interval = ctx.profile().timer_g;
        ctx.start_timer(TimerName::G, Some(self.retransmit_interval));
        ctx.timers().start(TimerName::H, None);

        if message.is_2xx() {
            if let Some(dialog) = message.dialog_id() {
                ctx.dispatch().ackable().insert(dialog.clone(), ctx.transaction());
                self.ackable = Some(dialog);
            }
        }
        Ok(true)
    }

    async fn on_timer(&mut self, ctx: &FsmContext<'_>, timer: TimerName) {
        let transaction = ctx.transaction();
        match timer {
            TimerName::G if ctx.state() == TransactionState::Completed => {
                if let Some(response) = self.final_response.as_ref() {
                    ctx.write(response).await;
                }
                let profile = ctx.profile();
                self.retransmit_interval = profile.backoff(self.retransmit_interval, profile.timer_g);
                ctx.timers().start(TimerName::G, Some(self.retransmit_interval));
            }
            TimerName::H if ctx.state() == TransactionState::Completed => {
                ctx.timers().cancel(TimerName::G);
                let timeout = Error::TransactionTimeout {
                    kind: TimeoutKind::AckWait,
                    id: transaction.id().clone(),
                };
                warn!(id = %transaction.id(), log_id = %transaction.log_id(), "{}", timeout);
                transaction.notify_server_event(ServerEvent::AckTimeout(timeout));
                ctx.terminate();
            }
            TimerName::I => ctx.terminate(),
            other => trace!(id = %transaction.id(), timer = %other, "IST ignoring timer"),
        }
    }

    fn on_terminate(&mut self, ctx: &FsmContext<'_>) {
        if let Some(dialog) = self.ackable.take() {
            ctx.dispatch().ackable().remove(&dialog, ctx.transaction());
        }
    }
}
