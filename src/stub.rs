//! The surface of the underlying stub resolver library.
//!
//! The stub is a black box to this crate. It owns its sockets, it speaks
//! the DNS wire format, and it advances whenever it is told that a socket
//! became readable or writable or that time has passed. This module
//! renders the C API surface the driver consumes as a pair of object-safe
//! traits, [`Channel`] and [`ChannelFactory`], together with the plain
//! data types that cross the seam.
//!
//! Two properties of the C original shape the contracts here:
//!
//! *  The stub is non-reentrant per channel. The driver serializes every
//!    channel call under its request lock, and completion closures must
//!    not call back into the channel or the driver.
//! *  A query call may invoke its completion closure inline, before the
//!    call returns, when the input is malformed. Callers have to be in a
//!    consistent state before issuing any query.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;

/// A socket handle owned by the stub.
pub type Socket = i64;

/// The sentinel the stub uses for "no socket on this side".
pub const BAD_SOCKET: Socket = -1;

/// The maximum number of sockets the stub reports interest in at once.
pub const SOCKET_SET_SIZE: usize = 16;

//------------ SocketSet -----------------------------------------------------

/// The stub's current sockets of interest.
///
/// A fixed-size array of socket handles plus a bitmask encoding, per
/// slot, whether the stub wants to know about readability and
/// writability. A slot is interesting iff at least one of the two bits
/// is set; the handle in an uninteresting slot is meaningless.
#[derive(Clone, Copy, Debug)]
pub struct SocketSet {
    /// The socket handles, one per slot.
    sockets: [Socket; SOCKET_SET_SIZE],

    /// Bit `i` marks slot `i` readable, bit `SOCKET_SET_SIZE + i`
    /// writable.
    bitmask: u32,
}

impl SocketSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        SocketSet {
            sockets: [BAD_SOCKET; SOCKET_SET_SIZE],
            bitmask: 0,
        }
    }

    /// Fills a slot.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn set(
        &mut self,
        index: usize,
        socket: Socket,
        readable: bool,
        writable: bool,
    ) {
        assert!(index < SOCKET_SET_SIZE);
        self.sockets[index] = socket;
        if readable {
            self.bitmask |= 1 << index;
        }
        if writable {
            self.bitmask |= 1 << (SOCKET_SET_SIZE + index);
        }
    }

    /// Returns the socket handle in a slot.
    pub fn socket(&self, index: usize) -> Socket {
        self.sockets[index]
    }

    /// Returns whether the stub wants readability for a slot.
    pub fn readable(&self, index: usize) -> bool {
        self.bitmask & (1 << index) != 0
    }

    /// Returns whether the stub wants writability for a slot.
    pub fn writable(&self, index: usize) -> bool {
        self.bitmask & (1 << (SOCKET_SET_SIZE + index)) != 0
    }
}

impl Default for SocketSet {
    fn default() -> Self {
        Self::new()
    }
}

//------------ Family --------------------------------------------------------

/// The address family of a hostname query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Family {
    /// IPv4, i.e., an A lookup.
    V4,

    /// IPv6, i.e., an AAAA lookup.
    V6,
}

//------------ Replies -------------------------------------------------------

/// One SRV record from a decoded SRV reply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SrvReply {
    /// The target host name.
    pub host: String,

    /// The port on the target host.
    pub port: u16,

    /// The record's priority.
    pub priority: u16,

    /// The record's weight.
    pub weight: u16,
}

/// One chunk of a decoded extended TXT reply.
///
/// A TXT record consists of one or more character strings; the stub
/// delivers each as a chunk and flags the first chunk of each record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxtChunk {
    /// Whether this chunk starts a new TXT record.
    pub record_start: bool,

    /// The chunk payload.
    pub data: Bytes,
}

//------------ StubError -----------------------------------------------------

/// A failure reported by the stub.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StubError {
    /// The driver-visible classification of the failure.
    code: StubCode,

    /// The stub's own rendering of the failure.
    detail: String,
}

impl StubError {
    /// Creates a new error from a code and the stub's error string.
    pub fn new(code: StubCode, detail: impl Into<String>) -> Self {
        StubError {
            code,
            detail: detail.into(),
        }
    }

    /// Creates the error the stub reports for cancelled queries.
    pub fn cancelled() -> Self {
        StubError::new(StubCode::Cancelled, "query cancelled")
    }

    /// Returns the failure classification.
    pub fn code(&self) -> StubCode {
        self.code
    }
}

impl fmt::Display for StubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

impl std::error::Error for StubError {}

//------------ StubCode ------------------------------------------------------

/// The stub failure codes the driver distinguishes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StubCode {
    /// The queried record definitively does not exist.
    NotFound,

    /// The query was cancelled through [`Channel::cancel_queries`].
    Cancelled,

    /// The stub gave up after its internal retries timed out.
    Timeout,

    /// A server refused the query.
    Refused,

    /// A server reported a failure on its side.
    ServerFailure,

    /// The query name could not be encoded.
    BadName,

    /// A reply could not be decoded.
    BadResponse,

    /// Any other failure.
    Other,
}

//------------ Completion closures -------------------------------------------

/// What a hostname query resolves to: the addresses of one family.
pub type HostResult = Result<Vec<IpAddr>, StubError>;

/// Completion of a hostname query.
pub type HostDone = Box<dyn FnOnce(HostResult) + Send + 'static>;

/// Completion of an SRV query: the decoded records in reply order.
pub type SrvDone =
    Box<dyn FnOnce(Result<Vec<SrvReply>, StubError>) + Send + 'static>;

/// Completion of a TXT query: the decoded chunks in reply order.
pub type TxtDone =
    Box<dyn FnOnce(Result<Vec<TxtChunk>, StubError>) + Send + 'static>;

//------------ Channel -------------------------------------------------------

/// One instance of the stub resolver.
///
/// A channel is owned by exactly one request and is only ever called
/// into under that request's lock. Dropping the boxed channel destroys
/// the stub instance; implementations must complete or forget any
/// still-pending queries at that point without invoking their closures.
///
/// Every completion closure handed to a query method is invoked exactly
/// once: inline from the issuing call on malformed input, from within
/// [`process_fd`][Self::process_fd] when a reply or failure arrives, or
/// from within [`cancel_queries`][Self::cancel_queries] with a
/// [`StubCode::Cancelled`] error.
pub trait Channel: Send {
    /// Returns the sockets the stub currently wants watched.
    fn socket_set(&mut self) -> SocketSet;

    /// Advances the stub's state machine.
    ///
    /// `read_fd` and `write_fd` name the socket that became readable
    /// and writable respectively; either may be [`BAD_SOCKET`]. The
    /// stub decides itself what work that enables, including timing
    /// out and retrying queries internally.
    fn process_fd(&mut self, read_fd: Socket, write_fd: Socket);

    /// Issues a hostname lookup for one address family.
    fn get_host_by_name(
        &mut self,
        name: &str,
        family: Family,
        done: HostDone,
    );

    /// Issues a class-IN SRV query.
    fn query_srv(&mut self, name: &str, done: SrvDone);

    /// Issues a class-IN TXT query, honoring the stub's search domains.
    fn search_txt(&mut self, name: &str, done: TxtDone);

    /// Fails every pending query with [`StubCode::Cancelled`].
    ///
    /// The completion closures run inline from this call.
    fn cancel_queries(&mut self);

    /// Replaces the stub's server list with the single given server.
    ///
    /// Both the TCP and the UDP port are set to the address's port.
    fn set_servers(&mut self, server: SocketAddr) -> Result<(), StubError>;
}

//------------ ChannelOptions ------------------------------------------------

/// Options for creating a channel.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelOptions {
    /// Keep idle sockets open instead of closing them between queries.
    pub stay_open: bool,
}

//------------ ChannelFactory ------------------------------------------------

/// Creates stub channels.
///
/// The factory seam is also where tests and embedders inject channel
/// configuration the driver itself does not know about.
pub trait ChannelFactory: Send + Sync {
    /// Creates a fresh channel.
    fn create_channel(
        &self,
        options: &ChannelOptions,
    ) -> Result<Box<dyn Channel>, StubError>;
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_set_bitmask() {
        let mut set = SocketSet::new();
        set.set(0, 100, true, false);
        set.set(1, 101, false, true);
        set.set(2, 102, true, true);
        assert!(set.readable(0) && !set.writable(0));
        assert!(!set.readable(1) && set.writable(1));
        assert!(set.readable(2) && set.writable(2));
        assert_eq!(set.socket(0), 100);
        assert_eq!(set.socket(1), 101);
        assert!(!set.readable(3) && !set.writable(3));
        assert_eq!(set.socket(3), BAD_SOCKET);
    }
}
