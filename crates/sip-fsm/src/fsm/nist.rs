use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::fsm::{FsmContext, StateMachine};
use crate::message::{Message, SipMessageExt, StatusCode};
use crate::timer::TimerName;
use crate::transaction::TransactionState;
use crate::transport::TransportHandle;
use crate::utils::{create_response, stamp_received};

/// Re-queues allowed before the transaction answers 503 on its own.
const MAX_QUEUE_ATTEMPTS: u32 = 3;

/// Non-INVITE server transaction (RFC 3261 Section 17.2.2).
///
/// Besides the RFC states the transaction may sit in QUEUED when the
/// dispatcher's throttle handler asks for the request to be delayed. While
/// queued, retransmissions are absorbed and the request is re-offered to the
/// throttle when `RequestThrottle` fires.
pub(crate) struct NonInviteServer {
    response: Option<Message>,
    queued: Option<(Message, TransportHandle)>,
    queue_attempts: u32,
}

impl NonInviteServer {
    pub(crate) fn new() -> Self {
        Self {
            response: None,
            queued: None,
            queue_attempts: 0,
        }
    }

    async fn dispatch_request(
        &mut self,
        ctx: &FsmContext<'_>,
        request: Message,
        transport: TransportHandle,
    ) {
        let transaction = ctx.transaction();
        let delay = ctx.dispatch().throttle_delay(&request, &transport, transaction);

        if !delay.is_zero() {
            if self.queue_attempts >= MAX_QUEUE_ATTEMPTS {
                warn!(
                    id = %transaction.id(),
                    attempts = self.queue_attempts,
                    "Request throttled too many times, answering 503"
                );
                ctx.set_state(TransactionState::Trying);
                match create_response(&request, StatusCode::ServiceUnavailable) {
                    Ok(busy) => {
                        if self.accept_response(ctx, &busy) {
                            ctx.write(&busy).await;
                        }
                    }
                    Err(e) => warn!(id = %transaction.id(), error = %e, "Unable to build 503"),
                }
                return;
            }
            self.queue_attempts += 1;
            ctx.set_state(TransactionState::Queued);
            debug!(id = %transaction.id(), ?delay, attempt = self.queue_attempts, "Request queued");
            self.queued = Some((request, transport));
            ctx.timers().start(TimerName::RequestThrottle, Some(delay));
            return;
        }

        ctx.set_state(TransactionState::Trying);
        ctx.dispatch().deliver_request(request, transport, transaction);
    }

    /// Caches an outbound response and applies its transition. Returns false if
    /// the transaction can no longer send responses.
    fn accept_response(&mut self, ctx: &FsmContext<'_>, response: &Message) -> bool {
        if !matches!(
            ctx.state(),
            TransactionState::Trying | TransactionState::Proceeding
        ) {
            return false;
        }
        self.response = Some(response.clone());
        if response.is_1xx() {
            ctx.set_state(TransactionState::Proceeding);
        } else if ctx.is_reliable() {
            ctx.terminate();
        } else {
            ctx.set_state(TransactionState::Completed);
            ctx.timers().start(TimerName::J, None);
        }
        true
    }
}

#[async_trait]
impl StateMachine for NonInviteServer {
    async fn on_received_message(
        &mut self,
        ctx: &FsmContext<'_>,
        message: Message,
        transport: TransportHandle,
    ) {
        if !message.is_request() {
            debug!(id = %ctx.transaction().id(), "NIST ignoring response {}", message.start_line_text());
            return;
        }

        match ctx.state() {
            TransactionState::Idle => {
                ctx.timers().start(TimerName::MaxLifetime, None);
                let mut request = message;
                stamp_received(&mut request, transport.remote_address());
                self.dispatch_request(ctx, request, transport).await;
            }
            TransactionState::Queued => {
                trace!(id = %ctx.transaction().id(), "Absorbing retransmission of queued request");
            }
            _ => match self.response.as_ref() {
                Some(response) => {
                    debug!(id = %ctx.transaction().id(), "Retransmitted request, resending response");
                    ctx.write(response).await;
                }
                None => trace!(id = %ctx.transaction().id(), "Retransmitted request, no response yet"),
            },
        }
    }

    async fn on_send_message(&mut self, ctx: &FsmContext<'_>, message: &Message) -> Result<bool> {
        if !message.is_response() {
            return Err(Error::InvalidMessage(format!(
                "NIST cannot send {}",
                message.start_line_text()
            )));
        }
        Ok(self.accept_response(ctx, message))
    }

    async fn on_timer(&mut self, ctx: &FsmContext<'_>, timer: TimerName) {
        match timer {
            TimerName::RequestThrottle if ctx.state() == TransactionState::Queued => {
                if let Some((request, transport)) = self.queued.take() {
                    ctx.transaction().mark_queued();
                    self.dispatch_request(ctx, request, transport).await;
                }
            }
            TimerName::J => ctx.terminate(),
            other => trace!(id = %ctx.transaction().id(), timer = %other, "NIST ignoring timer"),
        }
    }
}
