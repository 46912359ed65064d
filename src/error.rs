//! Error taxonomy (spec.md §7). Every handler-facing error carries the DNS
//! rcode it should be mapped to, the way the teacher's `Error` carries a
//! `message` alongside a `kind`.

use domain::base::iana::Rcode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: Option<String>,
    rcode_override: Option<Rcode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Startup/validation failure; terminates the process.
    Config,
    /// No TSIG, bad TSIG, unknown client, name/type not allowed.
    Auth,
    /// QUERY returned no matching rules.
    NotFound,
    /// Malformed rule or RR.
    Parse,
    /// Network/HTTP failure talking to the backing store.
    Upstream,
    /// Panics and other invariant violations.
    Internal,
}

impl ErrorKind {
    /// The rcode the middleware chain should answer with for this kind of
    /// failure (spec.md §7). `Internal` is reachable by the recoverer only.
    pub fn rcode(self) -> Rcode {
        match self {
            ErrorKind::Config => Rcode::SERVFAIL,
            ErrorKind::Auth => Rcode::REFUSED,
            ErrorKind::NotFound => Rcode::NXDOMAIN,
            ErrorKind::Parse => Rcode::SERVFAIL,
            ErrorKind::Upstream => Rcode::SERVFAIL,
            ErrorKind::Internal => Rcode::SERVFAIL,
        }
    }
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
            rcode_override: None,
        }
    }

    /// Overrides the rcode this error maps to, bypassing `ErrorKind`'s
    /// default (spec.md §7: "a first-class typed error carries an explicit
    /// DNS rcode... any handler may return it to bypass the default
    /// mapping"). Used where the same `ErrorKind` means different rcodes
    /// depending on which handler raised it (e.g. a parse failure is
    /// SERVFAIL on read but REFUSED on UPDATE).
    pub fn with_rcode(mut self, rcode: Rcode) -> Self {
        self.rcode_override = Some(rcode);
        self
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// The rcode a responder should write for this error: the explicit
    /// override if one was set, otherwise the kind's default (spec.md §7).
    pub fn rcode(&self) -> Rcode {
        self.rcode_override.unwrap_or_else(|| self.kind.rcode())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{message}"),
            None => self.kind.fmt(f),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ErrorKind::*;

        match self {
            Config => write!(f, "config error"),
            Auth => write!(f, "authorization error"),
            NotFound => write!(f, "not found"),
            Parse => write!(f, "parse error"),
            Upstream => write!(f, "upstream error"),
            Internal => write!(f, "internal error"),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_yaml::Error> for Error {
    fn from(value: serde_yaml::Error) -> Self {
        Self::config(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::new(ErrorKind::Internal, value.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Self::upstream(value.to_string())
    }
}
