//! The per-request pipeline: accept-time filtering, TSIG, opcode dispatch,
//! and the UDP/TCP accept loops. Business logic lives in [`handler`]; wire
//! construction lives in [`wire`]; TSIG verification in [`tsig`].
//!
//! Rather than the teacher's `domain::net::server::{Service, Middleware}`
//! composition (built around a per-core `DgramServer`/`StreamServer` and a
//! resident zone tree), [`Pipeline::handle`] is one async method that runs
//! Logger, Recoverer, Metrics, TsigChecker and the handler in that order by
//! hand, holding a single process-wide mutex across the whole thing. See
//! DESIGN.md for why.

pub mod handler;
pub mod metrics;
pub mod tsig;
pub mod wire;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use domain::base::iana::{Opcode, Rcode};
use domain::base::{Message, Rtype};
use domain::rdata::tsig::Time48;
use domain::tsig::{Key, ServerSequence, ServerTransaction};
use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::client::{Client, ClientRegistry};
use crate::error::Error;
use crate::upstream::Upstream;

const UDP_BUF_SIZE: usize = 4096;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);
/// TTL for synthesized answer RRs, matching the Cloudflare backend's default
/// record TTL (`upstream::cloudflare::DEFAULT_TTL`).
const ANSWER_TTL_SECS: u32 = 900;

fn answer_ttl() -> domain::base::Ttl {
    domain::base::Ttl::from_secs(ANSWER_TTL_SECS)
}

enum Signer {
    Transaction(ServerTransaction<Key>),
    Sequence(ServerSequence<Key>),
}

pub struct Pipeline {
    clients: Arc<ClientRegistry>,
    keystore: Arc<tsig::KeyStore>,
    upstream: Option<Arc<Upstream>>,
    lock: tokio::sync::Mutex<()>,
    stats: Arc<Mutex<metrics::Stats>>,
}

impl Pipeline {
    pub fn new(clients: ClientRegistry, keystore: tsig::KeyStore, upstream: Option<Upstream>) -> Self {
        Pipeline {
            clients: Arc::new(clients),
            keystore: Arc::new(keystore),
            upstream: upstream.map(Arc::new),
            lock: tokio::sync::Mutex::new(()),
            stats: Arc::new(Mutex::new(metrics::Stats::default())),
        }
    }

    /// Handles one request end to end. UDP callers get at most one response
    /// datagram back; AXFR over TCP yields a SOA/pages/SOA envelope sequence.
    async fn handle(&self, raw: Vec<u8>, is_udp: bool, peer: SocketAddr) -> Vec<Vec<u8>> {
        let start = Instant::now();
        let req_len = raw.len();
        {
            let mut stats = self.stats.lock().expect("stats mutex poisoned");
            stats.record_request(is_udp, peer.is_ipv4(), req_len);
        }

        let recovery_raw = raw.clone();
        let responses = match std::panic::AssertUnwindSafe(self.handle_inner(raw))
            .catch_unwind()
            .await
        {
            Ok(responses) => responses,
            Err(_) => {
                log::error!(target: "recoverer", "panic while handling request from {peer}");
                self.recover_response(&recovery_raw)
            }
        };

        let elapsed = start.elapsed();
        let resp_len: usize = responses.iter().map(Vec::len).sum();
        {
            let mut stats = self.stats.lock().expect("stats mutex poisoned");
            stats.record_response(elapsed, resp_len);
        }
        log::debug!(
            target: "listener",
            "{peer} {req_len}B in, {resp_len}B out, {elapsed:?}"
        );

        responses
    }

    async fn handle_inner(&self, raw: Vec<u8>) -> Vec<Vec<u8>> {
        let Ok(mut message) = Message::from_octets(raw) else {
            log::warn!(target: "listener", "dropping malformed message");
            return Vec::new();
        };

        if let Err(rcode) = accept(&message) {
            return wire::error_answer(&message, rcode)
                .map(|b| vec![b])
                .unwrap_or_default();
        }

        // Held across every `.await` below, including upstream HTTP calls:
        // the gateway processes one request at a time.
        let _guard = self.lock.lock().await;

        match self.dispatch(&mut message).await {
            Ok(responses) => responses,
            Err(err) => {
                // No signer reached this point (question parsing or
                // authentication itself failed), so there is nothing to
                // echo a TSIG record against.
                log::warn!(target: "listener", "request failed: {err}");
                wire::error_answer(&message, err.rcode())
                    .map(|b| vec![b])
                    .unwrap_or_default()
            }
        }
    }

    /// Best-effort SERVFAIL for a request whose handling panicked: echoes
    /// TSIG if the request carried a verifiable record, matching the
    /// Recoverer's "write a SERVFAIL response, with TSIG if the request
    /// carried one" (spec.md). Parsing or verification failing too just
    /// yields an unsigned answer, or none at all.
    fn recover_response(&self, raw: &[u8]) -> Vec<Vec<u8>> {
        let Ok(mut message) = Message::from_octets(raw.to_vec()) else {
            return Vec::new();
        };
        let signer = match tsig::verify(&self.keystore, &mut message) {
            Ok(tsig::Verified::Ok(tx)) => Some(Signer::Transaction(tx)),
            _ => None,
        };
        let Ok(answer) = wire::start_answer(&message, Rcode::SERVFAIL) else {
            return Vec::new();
        };
        let response = match signer {
            Some(signer) => self.sign(signer, answer),
            None => Ok(wire::finish(answer)),
        };
        response.map(|b| vec![b]).unwrap_or_default()
    }

    async fn dispatch(&self, message: &mut Message<Vec<u8>>) -> Result<Vec<Vec<u8>>, Error> {
        let question = message
            .sole_question()
            .map_err(|e| Error::parse(format!("malformed question: {e}")))?;
        let qname = question.qname().to_string();
        let qtype = question.qtype();
        let opcode = message.header().opcode();
        let is_axfr = qtype == Rtype::AXFR;

        let (client, signer) = self.authenticate(message, is_axfr)?;

        match opcode {
            Opcode::NOTIFY => {
                // Resolved Open Question (a): answered as a no-op,
                // NOERROR, query-shaped response.
                let answer = wire::start_answer(message, Rcode::NOERROR)?;
                Ok(vec![self.sign(signer, answer)?])
            }
            Opcode::QUERY if is_axfr => {
                let plan = match self.upstream() {
                    Ok(upstream) => handler::handle_transfer(&qname, client, upstream).await,
                    Err(err) => Err(err),
                };
                match plan {
                    Ok(plan) => self.render_transfer(message, signer, plan),
                    Err(err) => Ok(vec![self.sign_error(message, signer, err.rcode())?]),
                }
            }
            Opcode::QUERY => {
                let outcome = match self.upstream() {
                    Ok(upstream) => handler::handle_query(&qname, qtype, client, upstream).await,
                    Err(err) => Err(err),
                };
                match outcome {
                    Ok(outcome) => Ok(vec![self.render_query(message, signer, outcome)?]),
                    Err(err) => Ok(vec![self.sign_error(message, signer, err.rcode())?]),
                }
            }
            Opcode::UPDATE => {
                let result = match self.upstream() {
                    Ok(upstream) => handler::handle_update(message, client, upstream).await,
                    Err(err) => Err(err),
                };
                match result {
                    Ok(()) => {
                        let answer = wire::start_answer(message, Rcode::NOERROR)?;
                        Ok(vec![self.sign(signer, answer)?])
                    }
                    Err(err) => Ok(vec![self.sign_error(message, signer, err.rcode())?]),
                }
            }
            _ => Err(Error::internal("unsupported opcode reached dispatch")),
        }
    }

    /// Builds and signs a bodiless error reply, so a handler failure after
    /// successful TSIG verification still carries TSIG (spec.md §4.7,
    /// §6.1).
    fn sign_error(&self, message: &Message<Vec<u8>>, signer: Signer, rcode: Rcode) -> Result<Vec<u8>, Error> {
        let answer = wire::start_answer(message, rcode)?;
        self.sign(signer, answer)
    }

    fn authenticate<'a>(
        &'a self,
        message: &mut Message<Vec<u8>>,
        is_axfr: bool,
    ) -> Result<(&'a Client, Signer), Error> {
        if is_axfr {
            match tsig::verify_stream(&self.keystore, message)? {
                tsig::VerifiedStream::Absent => Err(Error::auth("missing tsig record")),
                tsig::VerifiedStream::Ok(seq) => {
                    let client = self.clients.for_key_name(&seq.key().name().to_string())?;
                    Ok((client, Signer::Sequence(seq)))
                }
            }
        } else {
            match tsig::verify(&self.keystore, message)? {
                tsig::Verified::Absent => Err(Error::auth("missing tsig record")),
                tsig::Verified::Ok(tx) => {
                    let client = self.clients.for_key_name(&tx.key().name().to_string())?;
                    Ok((client, Signer::Transaction(tx)))
                }
            }
        }
    }

    fn upstream(&self) -> Result<&Upstream, Error> {
        self.upstream
            .as_deref()
            .ok_or_else(|| Error::config("no upstream backend configured"))
    }

    fn sign(
        &self,
        signer: Signer,
        answer: domain::base::message_builder::AnswerBuilder<Vec<u8>>,
    ) -> Result<Vec<u8>, Error> {
        let mut additional = answer.additional();
        match signer {
            Signer::Transaction(tx) => tx
                .answer(&mut additional, Time48::now())
                .map_err(|e| Error::internal(format!("tsig sign: {e}")))?,
            Signer::Sequence(mut seq) => seq
                .answer(&mut additional, Time48::now())
                .map_err(|e| Error::internal(format!("tsig sign: {e}")))?,
        }
        Ok(wire::finish_additional(additional))
    }

    fn render_query(
        &self,
        message: &Message<Vec<u8>>,
        signer: Signer,
        outcome: handler::QueryOutcome,
    ) -> Result<Vec<u8>, Error> {
        let mut answer = wire::start_answer(message, Rcode::NOERROR)?;
        match outcome {
            handler::QueryOutcome::Soa(soa) => {
                answer
                    .push((soa.owner().clone(), soa.ttl(), soa.data().clone()))
                    .map_err(|e| Error::internal(format!("push soa: {e}")))?;
            }
            handler::QueryOutcome::Rules(rules) => {
                for rule in &rules {
                    rule.push_answer(&mut answer, answer_ttl())?;
                }
            }
        }
        self.sign(signer, answer)
    }

    fn render_transfer(
        &self,
        message: &Message<Vec<u8>>,
        signer: Signer,
        plan: handler::TransferPlan,
    ) -> Result<Vec<Vec<u8>>, Error> {
        let mut seq = match signer {
            Signer::Sequence(seq) => seq,
            Signer::Transaction(_) => return Err(Error::internal("axfr response requires a tsig sequence")),
        };

        let mut envelopes = Vec::with_capacity(plan.pages.len() + 2);

        envelopes.push(self.sign_axfr_envelope(message, &mut seq, |answer| {
            answer
                .push((plan.soa.owner().clone(), plan.soa.ttl(), plan.soa.data().clone()))
                .map_err(|e| Error::internal(format!("push soa: {e}")))
        })?);

        for page in &plan.pages {
            envelopes.push(self.sign_axfr_envelope(message, &mut seq, |answer| {
                for rule in page {
                    rule.push_answer(answer, answer_ttl())?;
                }
                Ok(())
            })?);
        }

        envelopes.push(self.sign_axfr_envelope(message, &mut seq, |answer| {
            answer
                .push((plan.soa.owner().clone(), plan.soa.ttl(), plan.soa.data().clone()))
                .map_err(|e| Error::internal(format!("push soa: {e}")))
        })?);

        Ok(envelopes)
    }

    fn sign_axfr_envelope(
        &self,
        message: &Message<Vec<u8>>,
        seq: &mut ServerSequence<Key>,
        fill: impl FnOnce(&mut domain::base::message_builder::AnswerBuilder<Vec<u8>>) -> Result<(), Error>,
    ) -> Result<Vec<u8>, Error> {
        let mut answer = wire::start_answer(message, Rcode::NOERROR)?;
        fill(&mut answer)?;
        let mut additional = answer.additional();
        wire::set_axfr_header(message, &mut additional);
        seq.answer(&mut additional, Time48::now())
            .map_err(|e| Error::internal(format!("tsig sign: {e}")))?;
        Ok(wire::finish_additional(additional))
    }
}

/// Rejects obviously malformed or unsupported requests before any expensive
/// work: QR already set, an opcode we don't serve, or section counts this
/// gateway never needs to handle.
fn accept(message: &Message<Vec<u8>>) -> Result<(), Rcode> {
    if message.header().qr() {
        return Err(Rcode::FORMERR);
    }
    match message.header().opcode() {
        Opcode::QUERY | Opcode::NOTIFY | Opcode::UPDATE => {}
        _ => return Err(Rcode::NOTIMP),
    }
    let counts = message.header_counts();
    if counts.qdcount() != 1 || counts.ancount() > 1 || counts.arcount() > 2 {
        return Err(Rcode::FORMERR);
    }
    Ok(())
}

/// Runs the configured listeners until `shutdown` resolves, then drains
/// in-flight connections for up to [`SHUTDOWN_GRACE`].
pub async fn run(
    addr: &str,
    nets: &[crate::config::Net],
    pipeline: Arc<Pipeline>,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<(), Error> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::config(format!("invalid listener address {addr:?}: {e}")))?;

    tokio::spawn(metrics::log_loop(pipeline.stats.clone()));

    let mut tasks = Vec::new();
    if nets.contains(&crate::config::Net::Udp) {
        let socket = UdpSocket::bind(addr).await?;
        log::info!(target: "listener", "udp listening on {addr}");
        tasks.push(tokio::spawn(run_udp(socket, pipeline.clone())));
    }
    if nets.contains(&crate::config::Net::Tcp) {
        let listener = TcpListener::bind(addr).await?;
        log::info!(target: "listener", "tcp listening on {addr}");
        tasks.push(tokio::spawn(run_tcp(listener, pipeline.clone())));
    }

    shutdown.await;
    log::info!(target: "listener", "shutting down, grace period {SHUTDOWN_GRACE:?}");

    for task in &tasks {
        task.abort();
    }
    // Aborting the accept loops only stops new work; per-request/connection
    // tasks they already spawned are untracked and keep running, so give
    // them the full grace period to finish before the process exits.
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    Ok(())
}

async fn run_udp(socket: UdpSocket, pipeline: Arc<Pipeline>) {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                log::error!(target: "listener", "udp recv error: {e}");
                continue;
            }
        };
        let raw = buf[..n].to_vec();
        let pipeline = pipeline.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            let responses = pipeline.handle(raw, true, peer).await;
            if let Some(response) = responses.into_iter().next() {
                if let Err(e) = socket.send_to(&response, peer).await {
                    log::error!(target: "listener", "udp send error to {peer}: {e}");
                }
            }
        });
    }
}

async fn run_tcp(listener: TcpListener, pipeline: Arc<Pipeline>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                log::error!(target: "listener", "tcp accept error: {e}");
                continue;
            }
        };
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_tcp_connection(stream, peer, pipeline).await {
                log::debug!(target: "listener", "tcp connection from {peer} closed: {e}");
            }
        });
    }
}

/// RFC 1035 §4.2.2: each TCP message is prefixed with its length as a
/// 2-byte big-endian integer. A connection may carry several requests
/// (notably a multi-envelope AXFR reply) in sequence.
async fn serve_tcp_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    pipeline: Arc<Pipeline>,
) -> std::io::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let len = u16::from_be_bytes(len_buf) as usize;

        let mut raw = vec![0u8; len];
        stream.read_exact(&mut raw).await?;

        for response in pipeline.handle(raw, false, peer).await {
            let len = u16::try_from(response.len())
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "response too large to frame"))?;
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(&response).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-assembles a minimal header + single root-name question, to avoid
    /// routing test fixtures through the same builder the code under test
    /// exercises.
    fn query_message(opcode: Opcode, qr: bool) -> Message<Vec<u8>> {
        let mut raw = vec![0u8; 12];
        raw[2] = ((qr as u8) << 7) | (u8::from(opcode) << 3);
        raw[4..6].copy_from_slice(&1u16.to_be_bytes()); // qdcount
        raw.push(0); // root name
        raw.extend_from_slice(&u16::from(Rtype::A).to_be_bytes());
        raw.extend_from_slice(&1u16.to_be_bytes()); // qclass IN
        Message::from_octets(raw).unwrap()
    }

    #[test]
    fn accept_rejects_response_flagged_messages() {
        let msg = query_message(Opcode::QUERY, true);
        assert_eq!(accept(&msg), Err(Rcode::FORMERR));
    }

    #[test]
    fn accept_rejects_unsupported_opcodes() {
        let msg = query_message(Opcode::STATUS, false);
        assert_eq!(accept(&msg), Err(Rcode::NOTIMP));
    }

    #[test]
    fn accept_allows_query_update_notify() {
        for opcode in [Opcode::QUERY, Opcode::UPDATE, Opcode::NOTIFY] {
            let msg = query_message(opcode, false);
            assert!(accept(&msg).is_ok());
        }
    }
}
