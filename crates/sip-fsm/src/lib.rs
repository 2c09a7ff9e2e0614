//! # rvoip-sip-fsm
//!
//! RFC 3261 transaction layer for the rvoip stack: the four transaction state
//! machines, their timers, per-type transaction pools and the dispatcher that
//! routes messages between the transport layer, the transactions and the
//! application (typically a B2BUA).
//!
//! ## Architecture
//!
//! ```text
//!  transport ──► FsmDispatcher ──► TransactionPool (ICT | IST | NICT | NIST)
//!                    │                      │
//!                    │                      ▼
//!                    │              Transaction (event loop task)
//!                    │                 ├─ state machine
//!                    │                 └─ TimerScheduler
//!                    ▼
//!               application callbacks
//! ```
//!
//! - [`FsmDispatcher`] classifies each inbound message once, finds or creates the
//!   matching [`Transaction`], and posts the message to that transaction's event
//!   loop. Outbound requests enter through [`FsmDispatcher::send_request`].
//! - Each [`Transaction`] runs its state machine on a dedicated tokio task.
//!   Messages, application sends and timer firings for a transaction are
//!   processed strictly in order on that task.
//! - Timers are named ([`TimerName`]) and sized by a [`TimerProfile`].
//!   Retransmission timers are never armed over reliable transports.
//! - Messages are the `rvoip-sip-core` types; [`SipMessageExt`] adds the
//!   transaction-layer view (transaction id, top Via branch, tags).
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_sip_fsm::utils::create_response;
//! use rvoip_sip_fsm::{FsmConfig, FsmDispatcher, Message, RequestOptions, SipMessageExt, StatusCode};
//!
//! # async fn example(transport: rvoip_sip_fsm::TransportHandle, invite: Message) -> rvoip_sip_fsm::Result<()> {
//! let dispatcher = FsmDispatcher::new(FsmConfig::default());
//! dispatcher.set_request_handler(Arc::new(|request, _transport, transaction| {
//!     if let Ok(ringing) = create_response(&request, StatusCode::Ringing) {
//!         let _ = transaction.send_response(ringing);
//!     }
//! }));
//!
//! let remote = "192.0.2.1:5060".parse().unwrap();
//! dispatcher
//!     .send_request_on(
//!         invite,
//!         RequestOptions::default(),
//!         transport,
//!         remote,
//!         Arc::new(|response, _transport, _transaction| match response {
//!             Ok(response) => println!("got {}", response.start_line_text()),
//!             Err(e) => println!("failed: {}", e),
//!         }),
//!         None,
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
mod fsm;
pub mod message;
pub mod pool;
pub mod timer;
pub mod transaction;
pub mod transport;
pub mod utils;

pub use config::FsmConfig;
pub use dispatch::{FsmDispatcher, OrphanHandler, RequestHandler, ThrottleHandler};
pub use error::{Error, Result, TimeoutKind};
pub use message::{
    Message, MessageClass, Method, Request, RequestOptions, Response, SipMessageExt, StatusCode,
    TransactionClass,
};
pub use pool::{ForkResolver, InviteForking, IstBlocklist, NoForking, TransactionPool};
pub use timer::{TimerName, TimerProfile};
pub use transaction::{
    DialogId, ResponseCallback, ServerEvent, ServerEventCallback, TerminateCallback, Transaction,
    TransactionId, TransactionState, TransactionType,
};
pub use transport::{Transport, TransportHandle, TransportService};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Error, FsmConfig, FsmDispatcher, Message, Method, RequestOptions, Result, ServerEvent,
        SipMessageExt, StatusCode, TimerName, TimerProfile, Transaction, TransactionId,
        TransactionState, TransactionType, Transport, TransportHandle, TransportService,
    };
}
