//! Wrapping stub sockets for the host poller.
//!
//! The stub owns its sockets; the host owns the poll mechanism. A
//! [`PolledFd`] stands between the two: it is created through the
//! [`PolledFdFactory`] the embedder passes to a request, and it delivers
//! one-shot readiness callbacks from whatever poller the host runs.
//!
//! The driver's own bookkeeping around these wrappers, [`FdNode`] and
//! [`FdNodeList`], also lives here. A node pairs one stub socket with
//! its wrapper and remembers which readiness callbacks are in flight.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use crate::error::Error;
use crate::stub::Socket;

/// A one-shot readiness callback.
///
/// Invoked with `Ok(())` when the socket became ready, or with the
/// shutdown status when the wrapper was shut down while the arm was
/// outstanding.
pub type ReadinessCallback =
    Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

//------------ PolledFd ------------------------------------------------------

/// One stub socket wired into the host poller.
///
/// Implementations deliver callbacks on the host event loop, never from
/// inside the registering call.
pub trait PolledFd: Send {
    /// Arms a one-shot readable callback.
    ///
    /// Must not be called while a readable arm is outstanding, nor
    /// after [`shutdown`][Self::shutdown].
    fn register_readable(&mut self, cb: ReadinessCallback);

    /// Arms a one-shot writable callback.
    ///
    /// Must not be called while a writable arm is outstanding, nor
    /// after [`shutdown`][Self::shutdown].
    fn register_writable(&mut self, cb: ReadinessCallback);

    /// Returns whether the kernel buffer likely holds more data.
    ///
    /// Used to drain a readable socket in a tight loop without going
    /// back through the poller.
    fn is_still_readable(&mut self) -> bool;

    /// Stops the wrapper.
    ///
    /// Idempotent. Any outstanding callback must subsequently be
    /// delivered with a non-ok status: the given one if it is an error,
    /// or a generic non-ok status if the wrapper was shut down with
    /// `Ok(())` because the stub lost interest in the socket.
    fn shutdown(&mut self, status: Result<(), Error>);

    /// The socket handle the stub knows this wrapper by.
    fn wrapped_socket(&self) -> Socket;

    /// A name for debug logging.
    fn name(&self) -> String;
}

//------------ PolledFdFactory -----------------------------------------------

/// Creates [`PolledFd`]s for new stub sockets.
///
/// This is the registration hook of the embedder: when the driver first
/// sees a socket in the stub's interest set, it asks the factory to
/// wrap it, and the factory wires the descriptor into the host poll
/// mechanism. Called under the request lock.
pub trait PolledFdFactory: Send {
    /// Wraps a stub socket.
    fn new_polled_fd(&mut self, socket: Socket) -> Box<dyn PolledFd>;
}

impl<F> PolledFdFactory for F
where
    F: FnMut(Socket) -> Box<dyn PolledFd> + Send,
{
    fn new_polled_fd(&mut self, socket: Socket) -> Box<dyn PolledFd> {
        (self)(socket)
    }
}

//------------ FdNode --------------------------------------------------------

/// One tracked stub socket.
pub(crate) struct FdNode {
    /// The stub's handle for the socket.
    pub(crate) socket: Socket,

    /// The wrapper the host poller drives.
    pub(crate) polled_fd: Box<dyn PolledFd>,

    /// Whether a readable callback is outstanding.
    pub(crate) readable_registered: bool,

    /// Whether a writable callback is outstanding.
    pub(crate) writable_registered: bool,

    /// Whether the wrapper has been shut down.
    pub(crate) already_shutdown: bool,
}

impl FdNode {
    /// Creates a node for a freshly wrapped socket.
    pub(crate) fn new(socket: Socket, polled_fd: Box<dyn PolledFd>) -> Self {
        FdNode {
            socket,
            polled_fd,
            readable_registered: false,
            writable_registered: false,
            already_shutdown: false,
        }
    }
}

//------------ FdNodeList ----------------------------------------------------

/// The tracked sockets of one request.
///
/// A request never watches more than a handful of sockets, so a linear
/// scan is all the lookup we need.
#[derive(Default)]
pub(crate) struct FdNodeList {
    /// The nodes, in insertion order.
    nodes: Vec<FdNode>,
}

impl FdNodeList {
    /// Creates an empty list.
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Appends a node.
    ///
    /// A socket appears at most once in a list.
    pub(crate) fn push(&mut self, node: FdNode) {
        debug_assert!(self
            .nodes
            .iter()
            .all(|have| have.socket != node.socket));
        self.nodes.push(node);
    }

    /// Removes and returns the node for a socket, if tracked.
    pub(crate) fn pop(&mut self, socket: Socket) -> Option<FdNode> {
        let pos = self.nodes.iter().position(|node| node.socket == socket)?;
        Some(self.nodes.remove(pos))
    }

    /// Returns the node for a socket, if tracked.
    pub(crate) fn get_mut(&mut self, socket: Socket) -> Option<&mut FdNode> {
        self.nodes.iter_mut().find(|node| node.socket == socket)
    }

    /// Removes and returns all nodes.
    pub(crate) fn take_all(&mut self) -> Vec<FdNode> {
        std::mem::take(&mut self.nodes)
    }

    /// Iterates over the nodes.
    pub(crate) fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = &mut FdNode> + '_ {
        self.nodes.iter_mut()
    }

    /// Returns whether any node is tracked.
    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the number of tracked nodes.
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// A polled fd that does nothing at all.
    struct NullFd(Socket);

    impl PolledFd for NullFd {
        fn register_readable(&mut self, _cb: ReadinessCallback) {}
        fn register_writable(&mut self, _cb: ReadinessCallback) {}
        fn is_still_readable(&mut self) -> bool {
            false
        }
        fn shutdown(&mut self, _status: Result<(), Error>) {}
        fn wrapped_socket(&self) -> Socket {
            self.0
        }
        fn name(&self) -> String {
            format!("null:{}", self.0)
        }
    }

    fn node(socket: Socket) -> FdNode {
        FdNode::new(socket, Box::new(NullFd(socket)))
    }

    #[test]
    fn pop_removes_the_matching_node() {
        let mut list = FdNodeList::new();
        list.push(node(3));
        list.push(node(5));
        list.push(node(7));
        let popped = list.pop(5).unwrap();
        assert_eq!(popped.socket, 5);
        assert_eq!(list.len(), 2);
        assert!(list.pop(5).is_none());
        assert!(list.get_mut(3).is_some());
        assert!(list.get_mut(7).is_some());
    }

    #[test]
    fn take_all_empties_the_list() {
        let mut list = FdNodeList::new();
        list.push(node(1));
        list.push(node(2));
        let all = list.take_all();
        assert_eq!(all.len(), 2);
        assert!(list.is_empty());
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn duplicate_sockets_are_rejected() {
        let mut list = FdNodeList::new();
        list.push(node(4));
        list.push(node(4));
    }
}
