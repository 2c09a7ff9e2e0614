use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result, TimeoutKind};
use crate::fsm::{FsmContext, StateMachine};
use crate::message::{Message, Method, SipMessageExt};
use crate::timer::{TimerName, TimerProfile};
use crate::transaction::TransactionState;
use crate::transport::TransportHandle;

/// Non-INVITE client transaction (RFC 3261 Section 17.1.2).
///
/// Timer E retransmits the request over unreliable transports, doubling up to
/// T2 while TRYING and every T2 once a provisional response arrived. Timer F
/// bounds the whole exchange; Timer K absorbs response retransmissions after
/// the final response.
pub(crate) struct NonInviteClient {
    request: Option<Message>,
    base_interval: Duration,
    retransmit_interval: Duration,
    is_child: bool,
}

impl NonInviteClient {
    pub(crate) fn new() -> Self {
        Self {
            request: None,
            base_interval: Duration::ZERO,
            retransmit_interval: Duration::ZERO,
            is_child: false,
        }
    }

    pub(crate) fn child(request: Message) -> Self {
        Self {
            request: Some(request),
            is_child: true,
            ..Self::new()
        }
    }

    fn handle_response(&mut self, ctx: &FsmContext<'_>, response: Message, transport: TransportHandle) {
        let transaction = ctx.transaction();

        if response.is_1xx() {
            if ctx.state() == TransactionState::Trying {
                ctx.set_state(TransactionState::Proceeding);
            }
            transaction.inform_tu(Ok(response), Some(transport));
            return;
        }

        ctx.timers().cancel(TimerName::E);
        ctx.timers().cancel(TimerName::F);
        ctx.set_state(TransactionState::Completed);
        let is_2xx = response.is_2xx();
        transaction.inform_tu(Ok(response), Some(transport));

        if is_2xx && self.is_child {
            if let Err(e) = transaction.terminate_fork_set() {
                error!(id = %transaction.id(), error = %e, "Unable to close fork-set");
            }
        }

        if ctx.is_reliable() {
            ctx.terminate();
        } else {
            ctx.timers().start(TimerName::K, None);
        }
    }
}

#[async_trait]
impl StateMachine for NonInviteClient {
    async fn on_received_message(
        &mut self,
        ctx: &FsmContext<'_>,
        message: Message,
        transport: TransportHandle,
    ) {
        if !message.is_response() {
            debug!(id = %ctx.transaction().id(), "NICT ignoring request {}", message.start_line_text());
            return;
        }

        match ctx.state() {
            TransactionState::Idle if self.is_child => {
                ctx.timers().start(TimerName::MaxLifetime, None);
                ctx.set_state(TransactionState::Trying);
                self.handle_response(ctx, message, transport);
            }
            TransactionState::Trying | TransactionState::Proceeding => {
                self.handle_response(ctx, message, transport);
            }
            state => trace!(id = %ctx.transaction().id(), %state, "Absorbing response retransmission"),
        }
    }

    async fn on_send_message(&mut self, ctx: &FsmContext<'_>, message: &Message) -> Result<bool> {
        if !message.is_request() || message.is_request_method(&Method::Ack) {
            return Err(Error::InvalidMessage(format!(
                "NICT cannot send {}",
                message.start_line_text()
            )));
        }
        if self.is_child || ctx.state() != TransactionState::Idle {
            return Ok(false);
        }

        let timeout_base = TimerProfile::base_for_transaction_timeout(
            ctx.transaction().request_options().transaction_timeout,
        );
        let base = timeout_base.unwrap_or(ctx.profile().timer_e);
        let timer_f = timeout_base.map_or(ctx.profile().timer_f, |base| base * 64);

        self.request = Some(message.clone());
        self.base_interval = base;
        self.retransmit_interval = base;

        ctx.timers().start(TimerName::MaxLifetime, None);
        if !ctx.set_state(TransactionState::Trying) {
            return Ok(false);
        }
        ctx.start_timer(TimerName::E, Some(base));
        ctx.timers().start(TimerName::F, Some(timer_f));
        Ok(true)
    }

    async fn on_timer(&mut self, ctx: &FsmContext<'_>, timer: TimerName) {
        let transaction = ctx.transaction();
        let state = ctx.state();
        let waiting = matches!(state, TransactionState::Trying | TransactionState::Proceeding);

        match timer {
            TimerName::E if waiting => {
                if let Some(request) = self.request.as_ref() {
                    ctx.write(request).await;
                }
                self.retransmit_interval = if state == TransactionState::Proceeding {
                    ctx.profile().t2
                } else {
                    ctx.profile()
                        .backoff(self.retransmit_interval, self.base_interval)
                };
                ctx.timers().start(TimerName::E, Some(self.retransmit_interval));
            }
            TimerName::F if waiting => {
                ctx.timers().cancel(TimerName::E);
                let timeout = Error::TransactionTimeout {
                    kind: TimeoutKind::NonInvite,
                    id: transaction.id().clone(),
                };
                warn!(id = %transaction.id(), log_id = %transaction.log_id(), "{}", timeout);
                transaction.inform_tu(Err(timeout), None);
                ctx.terminate();
            }
            TimerName::K => ctx.terminate(),
            other => trace!(id = %transaction.id(), timer = %other, "NICT ignoring timer"),
        }
    }
}
