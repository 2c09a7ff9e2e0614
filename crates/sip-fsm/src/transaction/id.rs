use std::fmt;

use crate::message::{Message, Method, SipMessageExt};

/// Key identifying a transaction inside its pool.
///
/// Built from the lower-cased CSeq method (with `ack` folded onto `invite` so a
/// non-2xx ACK finds its INVITE server transaction), the CSeq number and the top
/// Via branch. When the branch is missing (RFC 2543 peers) the Call-ID stands in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(method: &Method, cseq_number: u32, branch_or_call_id: &str) -> Self {
        let method = match method {
            Method::Ack => "invite".to_string(),
            other => other.to_string().to_ascii_lowercase(),
        };
        Self(format!("{}{}{}", method, cseq_number, branch_or_call_id))
    }

    pub fn from_message(message: &Message) -> Option<Self> {
        let cseq = message.cseq_header()?;
        let discriminator = match message.top_via_branch() {
            Some(branch) => branch,
            None => message.call_id_value()?,
        };
        Some(Self::new(&cseq.method, cseq.seq, discriminator))
    }

    /// Identifier of the forked child of this transaction for the given To-tag.
    pub fn child(&self, to_tag: &str) -> Self {
        Self(format!("{};tag={}", self.0, to_tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Call-ID plus both tags; keys the ACKable sub-pool so an ACK for a 2xx (which
/// carries a fresh branch) can still reach its INVITE server transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
}

impl DialogId {
    pub fn from_message(message: &Message) -> Option<Self> {
        Some(Self {
            call_id: message.call_id_value()?.to_string(),
            from_tag: message.from_tag()?.to_string(),
            to_tag: message.to_tag()?.to_string(),
        })
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};from-tag={};to-tag={}", self.call_id, self.from_tag, self.to_tag)
    }
}
