//! Driving a C-style stub DNS resolver from an event loop.
//!
//! A stub resolver library of the classic C lineage is synchronous in
//! construction: it owns a set of sockets, and it advances its internal
//! state machine whenever the application tells it that one of those
//! sockets became readable or writable, or that time has passed. This
//! crate turns such a library into a non-blocking, cancellable,
//! deadline-bounded resolver that integrates with a host event engine.
//!
//! The crate neither implements the stub nor a poller. Both are consumed
//! through trait seams: the stub through [`stub::Channel`] and
//! [`stub::ChannelFactory`], the poller through [`PolledFd`] and
//! [`PolledFdFactory`], and timers and deferred execution through
//! [`EventEngine`]. What the crate does own is the hard part in between:
//! tracking the stub's ever-changing set of interesting sockets, arming
//! one-shot readiness callbacks, kicking the stub along with a backup
//! poll timer when the network goes quiet, and funnelling every way a
//! request can end (answer, error, deadline, cancellation) through a
//! single completion path.
//!
//! Three query flavours are provided:
//!
//! *  [`HostnameRequest`] resolves a `host:port` name into socket
//!    addresses, running A and AAAA lookups side by side and ordering
//!    the combined result per RFC 6724.
//! *  [`SrvRequest`] fetches the SRV records of the load-balancer name
//!    derived from a host.
//! *  [`TxtRequest`] fetches the service-config payload carried in TXT
//!    records of the config name derived from a host.
//!
//! Each request is created through its `create` function, started exactly
//! once with a completion callback, and may be cancelled at any time
//! before the callback fires. Cancellation is silent: the callback is
//! simply never invoked.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

pub use self::engine::{EventEngine, TaskHandle, TokioEngine};
pub use self::error::Error;
pub use self::polled_fd::{PolledFd, PolledFdFactory, ReadinessCallback};
pub use self::request::hostname::HostnameRequest;
pub use self::request::srv::{SrvRecord, SrvRequest};
pub use self::request::txt::TxtRequest;
pub use self::request::OnResolve;

pub mod engine;
pub mod error;
pub mod host_port;
pub mod polled_fd;
pub mod request;
pub mod sort;
pub mod stub;
