//! Resolving a host name into socket addresses.
//!
//! A hostname request runs an A lookup and, when the host has IPv6
//! connectivity to offer, an AAAA lookup next to it. Completion is the
//! join of both: addresses accumulate across the two sub-queries and
//! are handed out in RFC 6724 order, each stamped with the requested
//! port. One family failing while the other delivers is still success;
//! only both failing surfaces the collected errors.
//!
//! Names whose host part already is an IP literal never touch the stub:
//! the result is posted straight to the event engine.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::fmt;
use std::mem;
use std::net::{Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::{debug, trace};

use super::{OnResolve, QueryKind, Request, State};
use crate::engine::EventEngine;
use crate::error::Error;
use crate::host_port::parse_ip_literal;
use crate::polled_fd::PolledFdFactory;
use crate::sort::{
    sort_destinations, SourceAddrLookup, SystemSourceAddrLookup,
};
use crate::stub::{ChannelFactory, Family, HostResult};

//------------ HostnameRequest -----------------------------------------------

/// A request resolving a `host:port` name into socket addresses.
pub struct HostnameRequest {
    /// The driver.
    inner: Arc<Request<HostnameQuery>>,
}

impl fmt::Debug for HostnameRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostnameRequest").finish_non_exhaustive()
    }
}

impl HostnameRequest {
    /// Creates an initialized hostname request.
    ///
    /// With `check_port`, a name without a port falls back to
    /// `default_port` and creation fails without one. A non-empty
    /// `dns_server` authority overrides the stub's server list.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        name: &str,
        default_port: Option<&str>,
        dns_server: Option<&str>,
        check_port: bool,
        timeout: Duration,
        fd_factory: Box<dyn PolledFdFactory>,
        channel_factory: &dyn ChannelFactory,
        engine: Arc<dyn EventEngine>,
    ) -> Result<Self, Error> {
        let inner = Request::new(
            name,
            default_port,
            timeout,
            fd_factory,
            engine,
            HostnameState {
                on_resolve: None,
                pending_queries: 0,
                addresses: Vec::new(),
                errors: Vec::new(),
                ipv6_available: ipv6_loopback_available(),
                source_lookup: Arc::new(SystemSourceAddrLookup),
            },
        );
        inner.initialize(channel_factory, dns_server, check_port)?;
        Ok(HostnameRequest { inner })
    }

    /// Starts the resolution.
    ///
    /// To be called exactly once. `on_resolve` is invoked exactly once
    /// on an event engine worker, unless the request is cancelled
    /// first.
    pub fn start(&self, on_resolve: OnResolve<Vec<SocketAddr>>) {
        self.inner.start_hostname(on_resolve);
    }

    /// Cancels the resolution.
    ///
    /// Returns `true` iff this call initiated shutdown; in that case
    /// `on_resolve` will never be invoked.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }
}

#[cfg(test)]
impl HostnameRequest {
    /// Forces the AAAA decision regardless of the host's networking.
    pub(crate) fn inject_ipv6_available(&self, available: bool) {
        let mut guard = self.inner.mu.lock().expect("request lock");
        guard.query.ipv6_available = available;
    }

    /// Replaces the source address discovery used for sorting.
    pub(crate) fn inject_source_lookup(
        &self,
        lookup: Arc<dyn SourceAddrLookup>,
    ) {
        let mut guard = self.inner.mu.lock().expect("request lock");
        guard.query.source_lookup = lookup;
    }
}

//------------ HostnameQuery -------------------------------------------------

/// The hostname flavour of [`Request`].
pub(crate) struct HostnameQuery;

/// The mutable state of a hostname request.
pub(crate) struct HostnameState {
    /// The caller's completion, consumed when posted.
    on_resolve: Option<OnResolve<Vec<SocketAddr>>>,

    /// How many of the A and AAAA sub-queries are still out.
    pending_queries: usize,

    /// Addresses accumulated across the sub-queries.
    addresses: Vec<SocketAddr>,

    /// Errors accumulated across the sub-queries.
    errors: Vec<Error>,

    /// Whether an AAAA lookup is worth issuing at all.
    ipv6_available: bool,

    /// Source address discovery for the RFC 6724 sort.
    source_lookup: Arc<dyn SourceAddrLookup>,
}

/// One completed hostname sub-query.
pub(crate) struct HostnameOutcome {
    /// Which lookup completed.
    qtype: &'static str,

    /// What the stub delivered.
    result: HostResult,
}

impl QueryKind for HostnameQuery {
    type State = HostnameState;
    type Outcome = HostnameOutcome;

    fn handle_outcome(
        request: &Request<Self>,
        state: &mut State<Self>,
        outcome: HostnameOutcome,
    ) {
        request.fold_outcome(state, outcome);
    }
}

impl Request<HostnameQuery> {
    /// Starts the resolution under the lock.
    fn start_hostname(&self, on_resolve: OnResolve<Vec<SocketAddr>>) {
        let mut guard = self.mu.lock().expect("request lock");
        let state = &mut *guard;
        debug_assert!(state.core.initialized);
        debug_assert!(state.query.on_resolve.is_none());
        if state.core.shutting_down {
            // Cancelled before we got going; cancellation is silent.
            return;
        }
        debug!(
            name = %self.name,
            default_port = ?self.default_port,
            "starting hostname resolution"
        );
        // Fast path: the host already is an address. No stub work, no
        // timers.
        if let Some(addr) =
            parse_ip_literal(&state.core.host, state.core.port)
        {
            debug!(name = %self.name, %addr, "resolved as ip literal");
            self.post_resolve(on_resolve, Ok(vec![addr]));
            return;
        }
        state.query.on_resolve = Some(on_resolve);
        state.start_ref = Some(self.strong());
        // Count both sub-queries before issuing either: the stub may
        // complete a query inline on malformed input, and the counter
        // decides when the join is complete.
        state.query.pending_queries = 1;
        if state.query.ipv6_available {
            state.query.pending_queries = 2;
        }
        let host = state.core.host.clone();
        let channel = state
            .core
            .channel
            .as_mut()
            .expect("initialized before start");
        if state.query.ipv6_available {
            let outcomes = self.outcomes.clone();
            channel.get_host_by_name(
                &host,
                Family::V6,
                Box::new(move |result| {
                    outcomes.push(HostnameOutcome {
                        qtype: "AAAA",
                        result,
                    });
                }),
            );
        }
        let outcomes = self.outcomes.clone();
        channel.get_host_by_name(
            &host,
            Family::V4,
            Box::new(move |result| {
                outcomes.push(HostnameOutcome { qtype: "A", result });
            }),
        );
        self.drain_outcomes(state);
        if !state.core.shutting_down {
            self.work(state);
            self.start_timers(state);
        }
    }

    /// Folds one completed sub-query into the join.
    fn fold_outcome(
        &self,
        state: &mut State<HostnameQuery>,
        outcome: HostnameOutcome,
    ) {
        let HostnameOutcome { qtype, result } = outcome;
        debug_assert!(state.query.pending_queries > 0);
        state.query.pending_queries -= 1;
        match result {
            Ok(addrs) => {
                trace!(
                    name = %self.name,
                    qtype,
                    count = addrs.len(),
                    "hostname sub-query succeeded"
                );
                let port = state.core.port;
                state.query.addresses.extend(
                    addrs
                        .into_iter()
                        .map(|addr| SocketAddr::new(addr, port)),
                );
            }
            Err(err) => {
                trace!(
                    name = %self.name,
                    qtype,
                    %err,
                    "hostname sub-query failed"
                );
                state
                    .query
                    .errors
                    .push(Error::from_stub(qtype, &state.core.host, err));
            }
        }
        if state.query.pending_queries > 0 {
            return;
        }
        // Both families have reported; this releases the start ref on
        // every path out.
        let _start_ref = state.start_ref.take();
        if state.core.cancelled {
            // Cancellation is silent.
            return;
        }
        state.core.shutting_down = true;
        self.cancel_timers(&mut state.core);
        let on_resolve = state
            .query
            .on_resolve
            .take()
            .expect("a request completes only once");
        if !state.query.addresses.is_empty() {
            // Records beat errors: one family failing is fine as long
            // as the other delivered.
            let mut addresses = mem::take(&mut state.query.addresses);
            sort_destinations(
                &mut addresses,
                &*state.query.source_lookup,
            );
            self.post_resolve(on_resolve, Ok(addresses));
        } else if state.core.deadline_exceeded {
            self.post_resolve(on_resolve, Err(Error::DeadlineExceeded));
        } else {
            let mut errors = mem::take(&mut state.query.errors);
            debug_assert!(!errors.is_empty());
            let error = if errors.len() == 1 {
                errors.pop().expect("one error")
            } else {
                Error::Multi(errors)
            };
            self.post_resolve(on_resolve, Err(error));
        }
    }
}

//------------ ipv6_loopback_available ---------------------------------------

/// Returns whether this host has IPv6 loopback at all.
///
/// Hosts without it will not have IPv6 connectivity either, so the
/// AAAA lookup would be wasted. Probed once per process.
fn ipv6_loopback_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        let available = UdpSocket::bind((Ipv6Addr::LOCALHOST, 0)).is_ok();
        debug!(available, "probed for ipv6 loopback");
        available
    })
}
