//! Looking up the service config carried in TXT records.
//!
//! A TXT request queries the config name derived from the host,
//! `_grpc_config.<host>`, and extracts the payload of the first record
//! that starts with the literal `grpc_config=` prefix. A TXT record may
//! span several chunks; continuation chunks are concatenated onto the
//! payload until the next record starts. No matching record is still a
//! success, with an empty payload. A localhost target is rejected up
//! front without ever dispatching to the stub.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::{OnResolve, QueryKind, Request, State};
use crate::engine::EventEngine;
use crate::error::Error;
use crate::polled_fd::PolledFdFactory;
use crate::stub::{ChannelFactory, StubCode, StubError, TxtChunk};

/// The attribute prefix marking a service config TXT record.
const SERVICE_CONFIG_PREFIX: &[u8] = b"grpc_config=";

//------------ TxtRequest ----------------------------------------------------

/// A request looking up the service config of a host's config name.
pub struct TxtRequest {
    /// The driver.
    inner: Arc<Request<TxtQuery>>,
}

impl TxtRequest {
    /// Creates an initialized TXT request.
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
            TxtState {
                on_resolve: None,
                config_name: String::new(),
            },
        );
        inner.initialize(channel_factory, dns_server, check_port)?;
        Ok(TxtRequest { inner })
    }

    /// Starts the lookup.
    ///
    /// To be called exactly once. `on_resolve` is invoked exactly once
    /// on an event engine worker, unless the request is cancelled
    /// first.
    pub fn start(&self, on_resolve: OnResolve<String>) {
        self.inner.start_txt(on_resolve);
    }

    /// Cancels the lookup.
    ///
    /// Returns `true` iff this call initiated shutdown; in that case
    /// `on_resolve` will never be invoked.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }
}

//------------ TxtQuery ------------------------------------------------------

/// The TXT flavour of [`Request`].
pub(crate) struct TxtQuery;

/// The mutable state of a TXT request.
pub(crate) struct TxtState {
    /// The caller's completion, consumed when posted.
    on_resolve: Option<OnResolve<String>>,

    /// The derived name the query runs under.
    config_name: String,
}

impl QueryKind for TxtQuery {
    type State = TxtState;
    type Outcome = Result<Vec<TxtChunk>, StubError>;

    fn handle_outcome(
        request: &Request<Self>,
        state: &mut State<Self>,
        outcome: Self::Outcome,
    ) {
        request.fold_outcome(state, outcome);
    }
}

impl Request<TxtQuery> {
    /// Starts the lookup under the lock.
    fn start_txt(&self, on_resolve: OnResolve<String>) {
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
                    "skip querying for TXT records for localhost target"
                        .into(),
                )),
            );
            return;
        }
        let config_name = format!("_grpc_config.{}", state.core.host);
        debug!(name = %self.name, %config_name, "starting TXT lookup");
        state.query.on_resolve = Some(on_resolve);
        state.query.config_name = config_name.clone();
        state.start_ref = Some(self.strong());
        let outcomes = self.outcomes.clone();
        state
            .core
            .channel
            .as_mut()
            .expect("initialized before start")
            .search_txt(
                &config_name,
                Box::new(move |result| outcomes.push(result)),
            );
        self.drain_outcomes(state);
        if !state.core.shutting_down {
            self.work(state);
            self.start_timers(state);
        }
    }

    /// Completes the lookup; TXT completion is single-shot.
    fn fold_outcome(
        &self,
        state: &mut State<TxtQuery>,
        outcome: Result<Vec<TxtChunk>, StubError>,
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
            Ok(chunks) => {
                let config = extract_service_config(&chunks);
                trace!(
                    name = %self.name,
                    chunks = chunks.len(),
                    config_len = config.len(),
                    "TXT lookup succeeded"
                );
                Ok(config)
            }
            Err(err)
                if state.core.deadline_exceeded
                    && err.code() == StubCode::Cancelled =>
            {
                Err(Error::DeadlineExceeded)
            }
            Err(err) => {
                trace!(name = %self.name, %err, "TXT lookup failed");
                Err(Error::from_stub("TXT", &state.query.config_name, err))
            }
        };
        self.post_resolve(on_resolve, result);
    }
}

//------------ extract_service_config ----------------------------------------

/// Pulls the service config payload out of a decoded TXT reply.
///
/// The payload is everything after the prefix in the first
/// record-starting chunk that carries it, with all following
/// continuation chunks appended. An absent record yields an empty
/// string.
fn extract_service_config(chunks: &[TxtChunk]) -> String {
    let start = chunks.iter().position(|chunk| {
        chunk.record_start && chunk.data.starts_with(SERVICE_CONFIG_PREFIX)
    });
    let Some(start) = start else {
        return String::new();
    };
    let mut payload =
        chunks[start].data[SERVICE_CONFIG_PREFIX.len()..].to_vec();
    for chunk in &chunks[start + 1..] {
        if chunk.record_start {
            break;
        }
        payload.extend_from_slice(&chunk.data);
    }
    String::from_utf8_lossy(&payload).into_owned()
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk(record_start: bool, data: &str) -> TxtChunk {
        TxtChunk {
            record_start,
            data: Bytes::copy_from_slice(data.as_bytes()),
        }
    }

    #[test]
    fn finds_the_prefixed_record() {
        let chunks = vec![
            chunk(true, "unrelated"),
            chunk(true, "grpc_config={\"loadBalancingPolicy\":\"rr\"}"),
        ];
        assert_eq!(
            extract_service_config(&chunks),
            "{\"loadBalancingPolicy\":\"rr\"}"
        );
    }

    #[test]
    fn concatenates_continuation_chunks() {
        let chunks = vec![
            chunk(true, "v=spf1 -all"),
            chunk(true, "grpc_config={\"method"),
            chunk(false, "Config\":"),
            chunk(false, "[]}"),
            chunk(true, "another record"),
        ];
        assert_eq!(
            extract_service_config(&chunks),
            "{\"methodConfig\":[]}"
        );
    }

    #[test]
    fn missing_record_yields_empty_config() {
        let chunks =
            vec![chunk(true, "v=spf1 -all"), chunk(false, "more of it")];
        assert_eq!(extract_service_config(&chunks), "");
    }

    #[test]
    fn prefix_on_continuation_chunk_does_not_count() {
        let chunks = vec![
            chunk(true, "v=spf1 "),
            chunk(false, "grpc_config={}"),
        ];
        assert_eq!(extract_service_config(&chunks), "");
    }
}
