//! # Transaction Runner
//!
//! The event loop behind every transaction. One loop per transaction owns the
//! state machine and processes, in order, every command posted for that
//! transaction:
//!
//! 1. inbound messages routed by the dispatcher,
//! 2. messages the application sends through the transaction,
//! 3. timer firings,
//! 4. forced termination.
//!
//! The loop holds the transaction weakly and upgrades it per command, so a
//! dropped transaction simply ends its loop. Once the state reaches TERMINATED
//! the loop runs the cleanup exactly once (cancel timers, machine hook, pool
//! removal, termination callback) and exits.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::fsm::{FsmContext, StateMachine};
use crate::message::{Message, SipMessageExt};
use crate::timer::TimerName;
use crate::transaction::Transaction;
use crate::transport::TransportHandle;

/// Commands processed by a transaction's event loop.
#[derive(Debug)]
pub(crate) enum Command {
    /// A message routed to this transaction by the dispatcher.
    Receive {
        message: Message,
        transport: TransportHandle,
    },
    /// A message the application sends through this transaction.
    Send { message: Message },
    /// A timer fired. Stale generations are ignored.
    Timer { name: TimerName, generation: u64 },
    /// Force TERMINATED and clean up.
    Terminate,
}

pub(crate) async fn run_transaction_loop(
    transaction: Weak<Transaction>,
    mut machine: Box<dyn StateMachine>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = commands.recv().await {
        let Some(transaction) = transaction.upgrade() else {
            break;
        };

        if !transaction.state().is_terminated() {
            let ctx = FsmContext::new(&transaction);
            match command {
                Command::Receive { message, transport } => {
                    log_inbound(&transaction, &message, &transport);
                    machine.on_received_message(&ctx, message, transport).await;
                }
                Command::Send { message } => {
                    handle_send(&ctx, machine.as_mut(), message).await;
                }
                Command::Timer { name, generation } => {
                    if !transaction.timers().claim(name, generation) {
                        trace!(id = %transaction.id(), timer = %name, generation, "Ignoring stale timer");
                    } else if name == TimerName::MaxLifetime {
                        warn!(
                            id = %transaction.id(),
                            log_id = %transaction.log_id(),
                            "{} reached its maximum lifetime in state {}",
                            transaction.kind(),
                            transaction.state()
                        );
                        ctx.terminate();
                    } else {
                        trace!(id = %transaction.id(), timer = %name, "Timer fired");
                        machine.on_timer(&ctx, name).await;
                    }
                }
                Command::Terminate => ctx.terminate(),
            }
        }

        if transaction.state().is_terminated() {
            finalize(&transaction, machine.as_mut());
            break;
        }
    }
}

async fn handle_send(ctx: &FsmContext<'_>, machine: &mut dyn StateMachine, message: Message) {
    let transaction = ctx.transaction();
    match machine.on_send_message(ctx, &message).await {
        Ok(true) => {
            if let Err(e) = transaction.write(&message).await {
                error!(
                    id = %transaction.id(),
                    log_id = %transaction.log_id(),
                    error = %e,
                    "Failed to write {}",
                    message.start_line_text()
                );
                if transaction.kind().is_client() {
                    transaction.inform_tu(Err(e), None);
                    ctx.terminate();
                }
            }
        }
        Ok(false) => debug!(
            id = %transaction.id(),
            "{} not sent by {} in state {}",
            message.start_line_text(),
            transaction.kind(),
            transaction.state()
        ),
        Err(e) => error!(id = %transaction.id(), error = %e, "Rejected outbound message"),
    }
}

fn finalize(transaction: &Arc<Transaction>, machine: &mut dyn StateMachine) {
    if !transaction.mark_finalized() {
        return;
    }
    transaction.timers().cancel_all();
    machine.on_terminate(&FsmContext::new(transaction));
    if let Some(pool) = transaction.pool() {
        pool.remove_transaction(transaction);
    }
    info!(
        id = %transaction.id(),
        log_id = %transaction.log_id(),
        "{} transaction TERMINATED",
        transaction.kind()
    );
    transaction.notify_terminated();
}

fn log_inbound(transaction: &Transaction, message: &Message, transport: &TransportHandle) {
    let log_id = transaction.log_id();
    info!(
        log_id = %log_id,
        "<<< {} LEN: {} SRC: {} DST: {} PROT: {}",
        message.start_line_text(),
        message.wire_len(),
        transport.remote_address(),
        transport.local_address(),
        transport.transport_scheme()
    );
    debug!(log_id = %log_id, "\n{}", message);
}
