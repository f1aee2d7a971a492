//! Looking up SRV records.
//!
//! An SRV request queries the load-balancer name derived from the host,
//! `_grpclb._tcp.<host>`, and completes in one shot with the decoded
//! records in the order the stub delivered them. A localhost target is
//! rejected up front without ever dispatching to the stub.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::{OnResolve, QueryKind, Request, State};
use crate::engine::EventEngine;
use crate::error::Error;
use crate::polled_fd::PolledFdFactory;
use crate::stub::{ChannelFactory, SrvReply, StubCode, StubError};

//------------ SrvRecord -----------------------------------------------------

/// One resolved SRV record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SrvRecord {
    /// The target host name.
    pub host: String,

    /// The port on the target host.
    pub port: u16,

    /// The record's priority.
    pub priority: u16,

    /// The record's weight.
    pub weight: u16,
}

impl From<SrvReply> for SrvRecord {
    fn from(reply: SrvReply) -> Self {
        SrvRecord {
            host: reply.host,
            port: reply.port,
            priority: reply.priority,
            weight: reply.weight,
        }
    }
}

//------------ SrvRequest ----------------------------------------------------

/// A request looking up the SRV records of a host's service name.
pub struct SrvRequest {
    /// The driver.
    inner: Arc<Request<SrvQuery>>,
}

impl SrvRequest {
    /// Creates an initialized SRV request.
    pub fn create(
        name: &str,
        dns_server: Option<&str>,
        check_port: bool,
        timeout: Duration,
        fd_factory: Box<dyn PolledFdFactory>,
        channel_factory: &dyn ChannelFactory,
        engine: Arc<dyn EventEngine>,
    ) -> Result<Self, Error> {
        let inner = Request::new(
            name,
            None,
            timeout,
            fd_factory,
            engine,
            SrvState {
                on_resolve: None,
                service_name: String::new(),
            },
        );
        inner.initialize(channel_factory, dns_server, check_port)?;
        Ok(SrvRequest { inner })
    }

    /// Starts the lookup.
    ///
    /// To be called exactly once. `on_resolve` is invoked exactly once
    /// on an event engine worker, unless the request is cancelled
    /// first.
    pub fn start(&self, on_resolve: OnResolve<Vec<SrvRecord>>) {
        self.inner.start_srv(on_resolve);
    }

    /// Cancels the lookup.
    ///
    /// Returns `true` iff this call initiated shutdown; in that case
    /// `on_resolve` will never be invoked.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }
}

//------------ SrvQuery ------------------------------------------------------

/// The SRV flavour of [`Request`].
pub(crate) struct SrvQuery;

/// The mutable state of an SRV request.
pub(crate) struct SrvState {
    /// The caller's completion, consumed when posted.
    on_resolve: Option<OnResolve<Vec<SrvRecord>>>,

    /// The derived name the query runs under.
    service_name: String,
}

impl QueryKind for SrvQuery {
    type State = SrvState;
    type Outcome = Result<Vec<SrvReply>, StubError>;

    fn handle_outcome(
        request: &Request<Self>,
        state: &mut State<Self>,
        outcome: Self::Outcome,
    ) {
        request.fold_outcome(state, outcome);
    }
}

impl Request<SrvQuery> {
    /// Starts the lookup under the lock.
    fn start_srv(&self, on_resolve: OnResolve<Vec<SrvRecord>>) {
        let mut guard = self.mu.lock().expect("request lock");
        let state = &mut *guard;
        debug_assert!(state.core.initialized);
        debug_assert!(state.query.on_resolve.is_none());
        if state.core.shutting_down {
            // Cancelled before we got going; cancellation is silent.
            return;
        }
        if state.core.host.eq_ignore_ascii_case("localhost") {
            self.post_resolve(
                on_resolve,
                Err(Error::InvalidArgument(
                    "skip querying for SRV records for localhost target"
                        .into(),
                )),
            );
            return;
        }
        let service_name = format!("_grpclb._tcp.{}", state.core.host);
        debug!(name = %self.name, %service_name, "starting SRV lookup");
        state.query.on_resolve = Some(on_resolve);
        state.query.service_name = service_name.clone();
        state.start_ref = Some(self.strong());
        let outcomes = self.outcomes.clone();
        state
            .core
            .channel
            .as_mut()
            .expect("initialized before start")
            .query_srv(
                &service_name,
                Box::new(move |result| outcomes.push(result)),
            );
        self.drain_outcomes(state);
        if !state.core.shutting_down {
            self.work(state);
            self.start_timers(state);
        }
    }

    /// Completes the lookup; SRV completion is single-shot.
    fn fold_outcome(
        &self,
        state: &mut State<SrvQuery>,
        outcome: Result<Vec<SrvReply>, StubError>,
    ) {
        // Releases the start ref on every path out.
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
        let result = match outcome {
            Ok(replies) => {
                trace!(
                    name = %self.name,
                    count = replies.len(),
                    "SRV lookup succeeded"
                );
                Ok(replies.into_iter().map(SrvRecord::from).collect())
            }
            Err(err)
                if state.core.deadline_exceeded
                    && err.code() == StubCode::Cancelled =>
            {
                Err(Error::DeadlineExceeded)
            }
            Err(err) => {
                trace!(name = %self.name, %err, "SRV lookup failed");
                Err(Error::from_stub(
                    "SRV",
                    &state.query.service_name,
                    err,
                ))
            }
        };
        self.post_resolve(on_resolve, result);
    }
}
