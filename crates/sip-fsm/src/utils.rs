//! Message helpers used by the state machines.

use std::net::SocketAddr;

use crate::error::{Error, Result};
use crate::message::{
    headers_mut, CSeq, Message, Method, Param, Request, Response, SipMessageExt, StatusCode,
    TypedHeader, Via,
};

/// Builds a response to `request`, copying Via, From, To, Call-ID and CSeq
/// (RFC 3261 Section 8.2.6.2).
pub fn create_response(request: &Message, status: StatusCode) -> Result<Message> {
    let Message::Request(request) = request else {
        return Err(Error::InvalidMessage("responses are built from requests".into()));
    };
    let mut response = Response::new(status);
    for header in &request.headers {
        if matches!(
            header,
            TypedHeader::Via(_)
                | TypedHeader::From(_)
                | TypedHeader::To(_)
                | TypedHeader::CallId(_)
                | TypedHeader::CSeq(_)
        ) {
            response.headers.push(header.clone());
        }
    }
    Ok(Message::Response(response))
}

/// Builds the ACK for a non-2xx final response to `invite` (RFC 3261 Section 17.1.1.3).
///
/// Request-URI, Call-ID, From, the CSeq number, Route headers and the top Via
/// come from the INVITE; To comes from the response so it carries the UAS tag.
/// The ACK has no body.
pub fn build_ack(invite: &Message, response: &Message) -> Result<Message> {
    let Message::Request(request) = invite else {
        return Err(Error::InvalidMessage("ACK must be built from a request".into()));
    };
    let cseq = invite
        .cseq_header()
        .ok_or_else(|| Error::InvalidMessage("INVITE has no CSeq".into()))?;
    let via = invite
        .top_via()
        .ok_or_else(|| Error::InvalidMessage("INVITE has no Via".into()))?;
    let to = find_to(response)
        .or_else(|| find_to(invite))
        .ok_or_else(|| Error::InvalidMessage("response has no To".into()))?;

    let mut ack = Request::new(Method::Ack, request.uri.clone())
        .with_header(TypedHeader::Via(Via(vec![via.clone()])));
    let mut has_from = false;
    let mut has_call_id = false;
    for header in &request.headers {
        match header {
            TypedHeader::Route(_) | TypedHeader::MaxForwards(_) => {}
            TypedHeader::From(_) => has_from = true,
            TypedHeader::CallId(_) => has_call_id = true,
            _ => continue,
        }
        ack.headers.push(header.clone());
    }
    if !has_from {
        return Err(Error::InvalidMessage("INVITE has no From".into()));
    }
    if !has_call_id {
        return Err(Error::InvalidMessage("INVITE has no Call-ID".into()));
    }
    ack.headers.push(to.clone());
    ack.headers.push(TypedHeader::CSeq(CSeq {
        seq: cseq.seq,
        method: Method::Ack,
    }));
    Ok(Message::Request(ack))
}

fn find_to(message: &Message) -> Option<&TypedHeader> {
    crate::message::headers(message)
        .iter()
        .find(|header| matches!(header, TypedHeader::To(_)))
}

fn is_rport(param: &Param) -> bool {
    matches!(param, Param::Rport(_))
        || matches!(param, Param::Other(name, _) if name.eq_ignore_ascii_case("rport"))
}

/// Stamps `received` and `rport` on the top Via when the client asked for
/// symmetric response routing (RFC 3581). Returns true if the Via changed.
pub fn stamp_received(message: &mut Message, source: SocketAddr) -> bool {
    let top = headers_mut(message).iter_mut().find_map(|header| match header {
        TypedHeader::Via(via) => via.0.first_mut(),
        _ => None,
    });
    let Some(top) = top else {
        return false;
    };
    if !top.params.iter().any(is_rport) {
        return false;
    }
    top.params
        .retain(|param| !is_rport(param) && !matches!(param, Param::Received(_)));
    top.params.push(Param::Received(source.ip()));
    top.params.push(Param::Rport(Some(source.port())));
    true
}
