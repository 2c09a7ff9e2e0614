use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result, TimeoutKind};
use crate::fsm::{FsmContext, StateMachine};
use crate::message::{Message, Method, SipMessageExt};
use crate::timer::{TimerName, TimerProfile};
use crate::transaction::TransactionState;
use crate::transport::TransportHandle;
use crate::utils::build_ack;

/// INVITE client transaction (RFC 3261 Section 17.1.1).
///
/// ```text
///            INVITE sent
///  Idle ─────────────────► Trying ──1xx──► Proceeding
///                            │ │               │ │
///                    Timer B │ └─300-699─┐     │ └─ 2xx ─► Terminated
///                            ▼           ▼     ▼
///                       Terminated    Completed ◄─ 300-699 (send ACK)
///                                        │
///                                 Timer D│ (immediately if reliable)
///                                        ▼
///                                    Terminated
/// ```
///
/// The ACK for a non-2xx final response is built once, cached and resent for
/// every retransmission of that response. 2xx responses end the transaction;
/// acknowledging them is the application's job.
pub(crate) struct InviteClient {
    request: Option<Message>,
    ack: Option<Message>,
    base_interval: Duration,
    retransmit_interval: Duration,
    is_child: bool,
}

impl InviteClient {
    pub(crate) fn new() -> Self {
        Self {
            request: None,
            ack: None,
            base_interval: Duration::ZERO,
            retransmit_interval: Duration::ZERO,
            is_child: false,
        }
    }

    /// A forked child starts from the parent's INVITE and never retransmits it.
    pub(crate) fn child(request: Message) -> Self {
        Self {
            request: Some(request),
            is_child: true,
            ..Self::new()
        }
    }

    /// Any response means the INVITE arrived: stop retransmitting, stop Timer B,
    /// on this transaction and on the fork parent.
    fn cancel_request_timers(&self, ctx: &FsmContext<'_>) {
        ctx.timers().cancel(TimerName::A);
        ctx.timers().cancel(TimerName::B);
        if self.is_child {
            match ctx.transaction().parent() {
                Some(parent) => {
                    parent.timers().cancel(TimerName::A);
                    parent.timers().cancel(TimerName::B);
                }
                None => error!(
                    error = %Error::OrphanedChild(ctx.transaction().id().clone()),
                    "Unable to cancel parent timers"
                ),
            }
        }
    }

    async fn send_ack(&mut self, ctx: &FsmContext<'_>, response: &Message) {
        if self.ack.is_none() {
            let Some(invite) = self.request.as_ref() else {
                error!(id = %ctx.transaction().id(), "No INVITE cached, cannot build ACK");
                return;
            };
            match build_ack(invite, response) {
                Ok(ack) => self.ack = Some(ack),
                Err(e) => {
                    error!(id = %ctx.transaction().id(), error = %e, "Failed to build ACK");
                    return;
                }
            }
        }
        if let Some(ack) = self.ack.as_ref() {
            ctx.write(ack).await;
        }
    }

    async fn handle_response(
        &mut self,
        ctx: &FsmContext<'_>,
        response: Message,
        transport: TransportHandle,
    ) {
        let transaction = ctx.transaction();

        if response.is_1xx() {
            if ctx.state() == TransactionState::Trying {
                ctx.set_state(TransactionState::Proceeding);
            }
            if self.is_child {
                if let Some(parent) = transaction.parent() {
                    if parent.state() == TransactionState::Trying {
                        let _ = parent.set_state(TransactionState::Proceeding);
                    }
                }
            }
            transaction.inform_tu(Ok(response), Some(transport));
        } else if response.is_2xx() {
            transaction.inform_tu(Ok(response), Some(transport));
            ctx.terminate();
            if self.is_child {
                if let Err(e) = transaction.terminate_fork_set() {
                    error!(id = %transaction.id(), error = %e, "Unable to close fork-set");
                }
            }
        } else if response.is_error_response() {
            ctx.set_state(TransactionState::Completed);
            transaction.inform_tu(Ok(response.clone()), Some(transport));
            self.send_ack(ctx, &response).await;
            if ctx.is_reliable() {
                ctx.terminate();
            } else {
                ctx.timers().start(TimerName::D, None);
            }
        }
    }
}

#[async_trait]
impl StateMachine for InviteClient {
    async fn on_received_message(
        &mut self,
        ctx: &FsmContext<'_>,
        message: Message,
        transport: TransportHandle,
    ) {
        if !message.is_response() {
            debug!(id = %ctx.transaction().id(), "ICT ignoring request {}", message.start_line_text());
            return;
        }

        match ctx.state() {
            TransactionState::Idle if self.is_child => {
                ctx.timers().start(TimerName::MaxLifetime, None);
                ctx.set_state(TransactionState::Trying);
                self.cancel_request_timers(ctx);
                self.handle_response(ctx, message, transport).await;
            }
            TransactionState::Trying => {
                self.cancel_request_timers(ctx);
                self.handle_response(ctx, message, transport).await;
            }
            TransactionState::Proceeding => {
                self.handle_response(ctx, message, transport).await;
            }
            TransactionState::Completed => {
                if message.is_error_response() {
                    debug!(id = %ctx.transaction().id(), "Retransmitted final response, resending ACK");
                    if let Some(ack) = self.ack.as_ref() {
                        ctx.write(ack).await;
                    }
                }
            }
            state => trace!(id = %ctx.transaction().id(), %state, "ICT ignoring response"),
        }
    }

    async fn on_send_message(&mut self, ctx: &FsmContext<'_>, message: &Message) -> Result<bool> {
        if message.is_request_method(&Method::Ack) {
            if self.ack.is_none() {
                self.ack = Some(message.clone());
            }
            return Ok(true);
        }
        if !message.is_request_method(&Method::Invite) {
            return Err(Error::InvalidMessage(format!(
                "ICT cannot send {}",
                message.start_line_text()
            )));
        }
        if self.is_child || ctx.state() != TransactionState::Idle {
            return Ok(false);
        }

        let timeout_base = TimerProfile::base_for_transaction_timeout(
            ctx.transaction().request_options().transaction_timeout,
        );
        let base = timeout_base.unwrap_or(ctx.profile().timer_a);
        let timer_b = timeout_base.map_or(ctx.profile().timer_b, |base| base * 64);

        self.request = Some(message.clone());
        self.base_interval = base;
        self.retransmit_interval = base;

        ctx.timers().start(TimerName::MaxLifetime, None);
        if !ctx.set_state(TransactionState::Trying) {
            return Ok(false);
        }
        ctx.start_timer(TimerName::A, Some(base));
        ctx.timers().start(TimerName::B, Some(timer_b));
        Ok(true)
    }

    async fn on_timer(&mut self, ctx: &FsmContext<'_>, timer: TimerName) {
        let transaction = ctx.transaction();
        match timer {
            TimerName::A if ctx.state() == TransactionState::Trying => {
                if let Some(request) = self.request.as_ref() {
                    ctx.write(request).await;
                }
                self.retransmit_interval = ctx
                    .profile()
                    .backoff(self.retransmit_interval, self.base_interval);
                ctx.timers().start(TimerName::A, Some(self.retransmit_interval));
            }
            TimerName::B if ctx.state() == TransactionState::Trying => {
                ctx.timers().cancel(TimerName::A);
                let timeout = Error::TransactionTimeout {
                    kind: TimeoutKind::Invite,
                    id: transaction.id().clone(),
                };
                warn!(id = %transaction.id(), log_id = %transaction.log_id(), "{}", timeout);
                transaction.inform_tu(Err(timeout), None);
                ctx.terminate();
            }
            TimerName::D => ctx.terminate(),
            other => trace!(id = %transaction.id(), timer = %other, "ICT ignoring timer"),
        }
    }
}
