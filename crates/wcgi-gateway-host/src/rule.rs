//! Allow/deny policy rules for outbound network access.
//!
//! A policy is built from a query-string-like rule specification containing
//! zero or more `bypass=<matcher-list>` clauses. Each clause's matcher list
//! is comma-separated; a clause prefixed with `~` denies matching addresses,
//! an unprefixed clause allows them.
//!
//! Evaluation walks the clauses in declared order: every clause that covers
//! the candidate address sets the verdict, and the last match wins. An
//! address no clause covers is allowed only when the rule consists purely of
//! deny clauses; with no clauses at all (the empty rule string) everything
//! is denied.

use std::net::SocketAddr;

use crate::matcher::{HostAddr, Matcher};

/// One allow/deny clause from a rule specification.
#[derive(Debug, Clone)]
struct Clause {
    /// `true` for `~`-prefixed clauses: matching addresses are denied.
    deny: bool,
    matchers: Vec<Matcher>,
}

impl Clause {
    /// A clause with an empty matcher list matches nothing.
    fn matches(&self, host: &HostAddr, port: u16) -> bool {
        self.matchers
            .iter()
            .any(|matcher| matcher.matches(host, port))
    }
}

/// A parsed outbound-network policy.
#[derive(Debug, Clone, Default)]
pub struct NetPolicy {
    clauses: Vec<Clause>,
}

impl NetPolicy {
    /// Parse a rule specification.
    ///
    /// Keys other than `bypass` are ignored; values are percent-decoded per
    /// query-string semantics. Parsing never fails — unrecognized matcher
    /// fragments simply never match.
    pub fn parse(rule: &str) -> Self {
        let mut clauses = Vec::new();
        for (key, value) in url::form_urlencoded::parse(rule.as_bytes()) {
            if key != "bypass" {
                continue;
            }
            let raw: &str = &value;
            let (deny, list) = match raw.strip_prefix('~') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };
            let matchers = list
                .split(',')
                .map(str::trim)
                .filter(|fragment| !fragment.is_empty())
                .map(Matcher::parse)
                .collect();
            clauses.push(Clause { deny, matchers });
        }
        Self { clauses }
    }

    /// Decide whether a connection to `host:port` is allowed.
    pub fn allows(&self, host: &HostAddr, port: u16) -> bool {
        if self.clauses.is_empty() {
            return false;
        }

        let mut verdict = None;
        for clause in &self.clauses {
            if clause.matches(host, port) {
                verdict = Some(!clause.deny);
            }
        }

        match verdict {
            Some(allowed) => allowed,
            // Unmatched addresses pass only a purely-deny rule set.
            None => self.clauses.iter().all(|clause| clause.deny),
        }
    }

    /// Decide whether a connection to a resolved socket address is allowed.
    pub fn allows_addr(&self, addr: &SocketAddr) -> bool {
        self.allows(&HostAddr::Ip(addr.ip()), addr.port())
    }

    /// Returns `true` if the rule specification contained no clauses.
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}
