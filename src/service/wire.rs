//! Response message construction. The teacher builds replies on
//! `StreamTarget<Vec<u8>>` via `domain::net::server::util::mk_builder_for_target`
//! so the same builder can serve both transports; we build directly on a
//! plain `Vec<u8>` target instead and frame for TCP ourselves in the
//! listener, since we aren't pulling in the `domain::net::server` tree this
//! helper lives under.

use domain::base::iana::{Opcode, Rcode};
use domain::base::message_builder::{AdditionalBuilder, AnswerBuilder};
use domain::base::{Message, MessageBuilder};

use crate::error::Error;

/// Starts a reply to `request` with the given rcode: echoes the request's
/// ID, opcode and question section, and sets AA since every reply this
/// gateway sends speaks for a zone it is configured for.
pub fn start_answer(request: &Message<Vec<u8>>, rcode: Rcode) -> Result<AnswerBuilder<Vec<u8>>, Error> {
    let builder = MessageBuilder::from_target(Vec::new())
        .expect("an empty Vec<u8> is always a valid message target");
    let mut answer = builder
        .start_answer(request, rcode)
        .map_err(|e| Error::internal(format!("start answer: {e}")))?;
    answer.header_mut().set_aa(true);
    Ok(answer)
}

/// Sets the header fields an AXFR envelope must carry (RFC 5936 §2.2.1),
/// applied to every envelope in a transfer, not just the first.
pub fn set_axfr_header(request: &Message<Vec<u8>>, additional: &mut AdditionalBuilder<Vec<u8>>) {
    let header = additional.header_mut();
    header.set_id(request.header().id());
    header.set_qr(true);
    header.set_opcode(Opcode::QUERY);
    header.set_aa(true);
    header.set_tc(false);
    header.set_rd(request.header().rd());
    header.set_ra(false);
    header.set_z(false);
    header.set_ad(false);
    header.set_cd(false);
}

/// Builds a bodiless reply carrying only the given rcode (NXDOMAIN, REFUSED,
/// SERVFAIL, NOTIMP, FORMERR).
pub fn error_answer(request: &Message<Vec<u8>>, rcode: Rcode) -> Result<Vec<u8>, Error> {
    let answer = start_answer(request, rcode)?;
    Ok(answer.additional().finish())
}

/// Finalizes an answer section with no additional records.
pub fn finish(answer: AnswerBuilder<Vec<u8>>) -> Vec<u8> {
    answer.additional().finish()
}

/// Finalizes an already-built additional section.
pub fn finish_additional(additional: AdditionalBuilder<Vec<u8>>) -> Vec<u8> {
    additional.finish()
}
