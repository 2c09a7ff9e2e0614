//! # SIP Message Access
//!
//! Messages are the [`rvoip_sip_core`] types. This module adds what the
//! transaction layer reads on top of them: the transaction family, the top Via
//! branch and transport, the CSeq, both tags and a one-line summary for logs.
//!
//! Lookups walk the typed header list directly, so requests and responses answer
//! the same way.

use std::time::Duration;

pub use rvoip_sip_core::types::Param;
pub use rvoip_sip_core::types::via::ViaHeader;
pub use rvoip_sip_core::{CSeq, Message, Method, Request, Response, StatusCode, TypedHeader, Via};

use crate::transaction::{DialogId, TransactionId};

/// Which transaction family a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionClass {
    Invite,
    Ack,
    NonInvite,
}

/// Classification computed once when a message enters the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Request(TransactionClass),
    /// `class` is taken from the CSeq method; responses are never `Ack`.
    Response { status: u16, class: TransactionClass },
}

/// Options for an outbound request, read once when its client transaction
/// starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Overall transaction timeout. Timer A/E start at a 64th of it and Timer B/F
    /// fire at the full value.
    pub transaction_timeout: Option<Duration>,
    /// Transport scheme (`udp`, `tcp`, `tls`, `ws`). Defaults to the top Via transport.
    pub target_transport: Option<String>,
    /// Identifier of an existing connection to reuse.
    pub transport_id: Option<String>,
}

impl RequestOptions {
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = Some(timeout);
        self
    }

    pub fn with_target_transport(mut self, scheme: impl Into<String>) -> Self {
        self.target_transport = Some(scheme.into());
        self
    }

    pub fn with_transport_id(mut self, id: impl Into<String>) -> Self {
        self.transport_id = Some(id.into());
        self
    }
}

/// Typed header list of either kind of message.
pub fn headers(message: &Message) -> &[TypedHeader] {
    match message {
        Message::Request(request) => &request.headers,
        Message::Response(response) => &response.headers,
    }
}

pub fn headers_mut(message: &mut Message) -> &mut Vec<TypedHeader> {
    match message {
        Message::Request(request) => &mut request.headers,
        Message::Response(response) => &mut response.headers,
    }
}

/// Transaction-layer view of a [`Message`].
pub trait SipMessageExt {
    fn request_method(&self) -> Option<&Method>;

    /// Numeric status of a response.
    fn status_code(&self) -> Option<u16>;

    fn cseq_header(&self) -> Option<&CSeq>;

    fn call_id_value(&self) -> Option<&str>;

    fn from_tag(&self) -> Option<&str>;

    fn to_tag(&self) -> Option<&str>;

    /// First entry of the first Via header.
    fn top_via(&self) -> Option<&ViaHeader>;

    fn top_via_branch(&self) -> Option<&str>;

    /// Transport token of the top Via (`UDP` in `SIP/2.0/UDP host`).
    fn top_via_transport(&self) -> Option<&str>;

    /// Short one-line summary used in log lines.
    fn start_line_text(&self) -> String;

    /// Size of the wire rendering.
    fn wire_len(&self) -> usize;

    fn is_request_method(&self, method: &Method) -> bool {
        self.request_method() == Some(method)
    }

    fn is_1xx(&self) -> bool {
        matches!(self.status_code(), Some(100..=199))
    }

    fn is_2xx(&self) -> bool {
        matches!(self.status_code(), Some(200..=299))
    }

    /// True for 3xx-6xx final responses.
    fn is_error_response(&self) -> bool {
        matches!(self.status_code(), Some(s) if s >= 300)
    }

    fn is_final_response(&self) -> bool {
        matches!(self.status_code(), Some(s) if s >= 200)
    }

    /// Computes the transaction family and, for responses, the status code.
    fn class(&self) -> Option<MessageClass> {
        match (self.request_method(), self.status_code()) {
            (Some(method), _) => Some(MessageClass::Request(match method {
                Method::Invite => TransactionClass::Invite,
                Method::Ack => TransactionClass::Ack,
                _ => TransactionClass::NonInvite,
            })),
            (None, Some(status)) => {
                let class = if self.cseq_header()?.method == Method::Invite {
                    TransactionClass::Invite
                } else {
                    TransactionClass::NonInvite
                };
                Some(MessageClass::Response { status, class })
            }
            (None, None) => None,
        }
    }

    fn transaction_id(&self) -> Option<TransactionId>;

    fn dialog_id(&self) -> Option<DialogId>;
}

impl SipMessageExt for Message {
    fn request_method(&self) -> Option<&Method> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Response(_) => None,
        }
    }

    fn status_code(&self) -> Option<u16> {
        match self {
            Message::Response(response) => Some(response.status.as_u16()),
            Message::Request(_) => None,
        }
    }

    fn cseq_header(&self) -> Option<&CSeq> {
        headers(self).iter().find_map(|header| match header {
            TypedHeader::CSeq(cseq) => Some(cseq),
            _ => None,
        })
    }

    fn call_id_value(&self) -> Option<&str> {
        headers(self)
            .iter()
            .find_map(|header| match header {
                TypedHeader::CallId(call_id) => Some(call_id.0.trim()),
                _ => None,
            })
            .filter(|v| !v.is_empty())
    }

    fn from_tag(&self) -> Option<&str> {
        headers(self)
            .iter()
            .find_map(|header| match header {
                TypedHeader::From(from) => from.tag(),
                _ => None,
            })
            .filter(|t| !t.is_empty())
    }

    fn to_tag(&self) -> Option<&str> {
        headers(self)
            .iter()
            .find_map(|header| match header {
                TypedHeader::To(to) => to.tag(),
                _ => None,
            })
            .filter(|t| !t.is_empty())
    }

    fn top_via(&self) -> Option<&ViaHeader> {
        headers(self).iter().find_map(|header| match header {
            TypedHeader::Via(via) => via.0.first(),
            _ => None,
        })
    }

    fn top_via_branch(&self) -> Option<&str> {
        self.top_via()?
            .params
            .iter()
            .find_map(|param| match param {
                Param::Branch(branch) => Some(branch.as_str()),
                _ => None,
            })
            .filter(|b| !b.is_empty())
    }

    fn top_via_transport(&self) -> Option<&str> {
        let transport = self.top_via()?.sent_protocol.transport.as_str();
        (!transport.is_empty()).then_some(transport)
    }

    fn start_line_text(&self) -> String {
        match self {
            Message::Request(request) => format!("{} {} SIP/2.0", request.method, request.uri),
            Message::Response(response) => format!(
                "SIP/2.0 {} {}",
                response.status.as_u16(),
                response
                    .reason
                    .as_deref()
                    .unwrap_or_else(|| response.status.reason_phrase())
            ),
        }
    }

    fn wire_len(&self) -> usize {
        self.to_bytes().len()
    }

    fn transaction_id(&self) -> Option<TransactionId> {
        TransactionId::from_message(self)
    }

    fn dialog_id(&self) -> Option<DialogId> {
        DialogId::from_message(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::create_response;
    use rvoip_sip_core::builder::SimpleRequestBuilder;

    fn invite() -> Message {
        let request = SimpleRequestBuilder::new(Method::Invite, "sip:bob@biloxi.example.com")
            .unwrap()
            .from("Alice", "sip:alice@atlanta.example.com", Some("1928301774"))
            .to("Bob", "sip:bob@biloxi.example.com", None)
            .call_id("a84b4c76e66710")
            .cseq(314159)
            .via("pc33.atlanta.example.com", "UDP", Some("z9hG4bKnashds8"))
            .via("proxy.example.com", "UDP", Some("z9hG4bKproxy"))
            .build();
        Message::Request(request)
    }

    #[test]
    fn test_accessors() {
        let msg = invite();
        assert_eq!(msg.call_id_value(), Some("a84b4c76e66710"));
        assert_eq!(msg.from_tag(), Some("1928301774"));
        assert_eq!(msg.to_tag(), None);
        assert_eq!(msg.top_via_branch(), Some("z9hG4bKnashds8"));
        assert_eq!(msg.top_via_transport(), Some("UDP"));
        let cseq = msg.cseq_header().unwrap();
        assert_eq!(cseq.seq, 314159);
        assert_eq!(cseq.method, Method::Invite);
        assert_eq!(msg.class(), Some(MessageClass::Request(TransactionClass::Invite)));
        assert!(msg.start_line_text().starts_with("INVITE sip:bob@biloxi.example.com"));
    }

    #[test]
    fn test_response_class_uses_cseq_method() {
        let response = create_response(&invite(), StatusCode::Ringing).unwrap();
        assert_eq!(
            response.class(),
            Some(MessageClass::Response {
                status: 180,
                class: TransactionClass::Invite
            })
        );
        assert!(response.is_1xx());
        assert!(!response.is_final_response());
        assert_eq!(response.top_via_branch(), Some("z9hG4bKnashds8"));
        assert_eq!(response.start_line_text(), "SIP/2.0 180 Ringing");
    }

    #[test]
    fn test_request_options_builder() {
        let options = RequestOptions::default()
            .with_transaction_timeout(Duration::from_millis(6400))
            .with_target_transport("tcp")
            .with_transport_id("conn-1");
        assert_eq!(options.transaction_timeout, Some(Duration::from_millis(6400)));
        assert_eq!(options.target_transport.as_deref(), Some("tcp"));
        assert_eq!(options.transport_id.as_deref(), Some("conn-1"));
    }
}
