//! Ambient per-request counters, logged on a fixed interval. Carried over
//! from the teacher's `metric.rs`/`service/middleware/metric.rs` `Stats`
//! shape even though spec.md's middleware list doesn't name it: it's
//! observability, not request-handling correctness, and ambient concerns
//! survive the spec's Non-goals.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

const LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct Stats {
    slowest_req: Option<Duration>,
    fastest_req: Option<Duration>,
    num_req_bytes: u64,
    num_resp_bytes: u64,
    num_reqs: u64,
    num_ipv4: u64,
    num_ipv6: u64,
    num_udp: u64,
}

impl Stats {
    pub fn record_request(&mut self, is_udp: bool, is_ipv4: bool, req_bytes: usize) {
        self.num_reqs += 1;
        self.num_req_bytes += req_bytes as u64;
        if is_udp {
            self.num_udp += 1;
        }
        if is_ipv4 {
            self.num_ipv4 += 1;
        } else {
            self.num_ipv6 += 1;
        }
    }

    pub fn record_response(&mut self, elapsed: Duration, resp_bytes: usize) {
        self.num_resp_bytes += resp_bytes as u64;
        if elapsed < self.fastest_req.unwrap_or(Duration::MAX) {
            self.fastest_req = Some(elapsed);
        }
        if elapsed > self.slowest_req.unwrap_or(Duration::ZERO) {
            self.slowest_req = Some(elapsed);
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "# Reqs={} [UDP={}, IPv4={}, IPv6={}] Bytes [rx={}, tx={}] Speed [fastest={}, slowest={}]",
            self.num_reqs,
            self.num_udp,
            self.num_ipv4,
            self.num_ipv6,
            self.num_req_bytes,
            self.num_resp_bytes,
            self.fastest_req.map(|v| format!("{}us", v.as_micros())).unwrap_or_else(|| "-".to_string()),
            self.slowest_req.map(|v| format!("{}ms", v.as_millis())).unwrap_or_else(|| "-".to_string()),
        )
    }
}

/// Logs `stats` every [`LOG_INTERVAL`] until the process exits.
pub async fn log_loop(stats: std::sync::Arc<Mutex<Stats>>) {
    loop {
        tokio::time::sleep(LOG_INTERVAL).await;
        let stats = stats.lock().expect("stats mutex poisoned");
        log::info!(target: "metrics", "{stats}");
    }
}
