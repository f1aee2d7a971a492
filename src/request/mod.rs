//! The request driver shared by all query flavours.
//!
//! A request owns one stub channel, the bookkeeping for the channel's
//! sockets, and two timers. Everything mutable sits behind a single
//! mutex; every entry point, whether it comes from the caller, a timer,
//! or a readiness callback, takes that lock first. The stub is only
//! ever called under the lock, because it is non-reentrant per channel.
//! User completions are never invoked under the lock; they are posted
//! through the event engine instead.
//!
//! Lifetime works through reference counting. Every armed timer and
//! every armed readiness callback captures an [`Arc`] of the request;
//! the start of a resolution stores one more, the start ref, which is
//! released exactly once when the final completion is posted or found
//! to be cancelled. Once the last clone is gone the request drops and
//! takes the stub channel with it. The request keeps a [`Weak`] of
//! itself to mint those clones from.
//!
//! Completion closures handed to the stub cannot retake the request
//! lock, since the stub invokes them from calls the driver makes while
//! already holding it. They push the raw result into a small leaf-locked
//! queue instead, and the driver folds the queue into its state right
//! after every stub call. The pending counters are bumped before a
//! query is issued because the stub may complete it inline.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

pub mod hostname;
pub mod srv;
pub mod txt;


use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, trace};

use crate::engine::{EventEngine, TaskHandle};
use crate::error::Error;
use crate::host_port::{parse_authority, split_host_port};
use crate::polled_fd::{FdNode, FdNodeList, PolledFdFactory};
use crate::stub::{
    Channel, ChannelFactory, ChannelOptions, Socket, BAD_SOCKET,
    SOCKET_SET_SIZE,
};

/// A resolution completion callback.
///
/// Invoked exactly once, on an event engine worker, unless the request
/// was cancelled first, in which case it is never invoked.
pub type OnResolve<T> =
    Box<dyn FnOnce(Result<T, Error>) + Send + 'static>;

/// How often the stub gets poked when no socket events arrive.
///
/// The stub carries its own retry and timeout logic and just needs to
/// be called into now and then to exercise it. One second is the floor
/// the stub recommends.
const BACKUP_POLL_INTERVAL: Duration = Duration::from_secs(1);

//------------ QueryKind -----------------------------------------------------

/// What distinguishes one query flavour from another.
pub(crate) trait QueryKind: Send + Sized + 'static {
    /// Flavour-specific state, protected by the request lock.
    type State: Send + 'static;

    /// The raw result of one completed stub sub-query.
    type Outcome: Send + 'static;

    /// Folds a completed sub-query into the request state.
    ///
    /// Called with the request lock held.
    fn handle_outcome(
        request: &Request<Self>,
        state: &mut State<Self>,
        outcome: Self::Outcome,
    );
}

//------------ OutcomeQueue --------------------------------------------------

/// Where stub completion closures leave their results.
///
/// A leaf lock: nothing is called while it is held.
pub(crate) struct OutcomeQueue<T> {
    /// The completed sub-queries, oldest first.
    queue: Mutex<VecDeque<T>>,
}

impl<T> OutcomeQueue<T> {
    /// Appends an outcome.
    pub(crate) fn push(&self, outcome: T) {
        self.queue
            .lock()
            .expect("outcome queue lock")
            .push_back(outcome);
    }

    /// Removes the oldest outcome.
    fn pop(&self) -> Option<T> {
        self.queue.lock().expect("outcome queue lock").pop_front()
    }
}

impl<T> Default for OutcomeQueue<T> {
    fn default() -> Self {
        OutcomeQueue {
            queue: Mutex::new(VecDeque::new()),
        }
    }
}

//------------ State ---------------------------------------------------------

/// Everything a request may mutate, behind the request lock.
pub(crate) struct State<K: QueryKind> {
    /// The flavour-independent part.
    core: CoreState,

    /// Keeps the request alive from start until final completion.
    start_ref: Option<Arc<Request<K>>>,

    /// The flavour-specific part.
    query: K::State,
}

/// The flavour-independent mutable state.
pub(crate) struct CoreState {
    /// The host part of the request name; set by `initialize`.
    host: String,

    /// The port carried into every resolved address.
    port: u16,

    /// The stub channel. `Some` from successful `initialize` on;
    /// dropping it destroys the stub instance.
    channel: Option<Box<dyn Channel>>,

    /// The sockets currently tracked for the stub.
    fd_nodes: FdNodeList,

    /// Wraps new stub sockets for the host poller.
    fd_factory: Box<dyn PolledFdFactory>,

    /// Whether `initialize` succeeded.
    initialized: bool,

    /// Set once the request is on its way out; monotonic. No new stub
    /// queries, timer arms or fd registrations afterwards.
    shutting_down: bool,

    /// Whether shutdown was the user's explicit cancellation.
    cancelled: bool,

    /// Whether shutdown came from the deadline timer.
    deadline_exceeded: bool,

    /// The armed deadline timer, if any.
    query_timeout: Option<TaskHandle>,

    /// The armed backup poll timer, if any.
    backup_poll: Option<TaskHandle>,
}

//------------ Request -------------------------------------------------------

/// The driver for one resolution request.
pub(crate) struct Request<K: QueryKind> {
    /// Mints the strong references that timer and readiness closures
    /// capture.
    weak: Weak<Request<K>>,

    /// The `host:port` name the request was created with.
    name: String,

    /// The port to fall back to when the name carries none.
    default_port: Option<String>,

    /// The overall deadline; zero means unbounded.
    timeout: Duration,

    /// The host event engine.
    engine: Arc<dyn EventEngine>,

    /// Results of completed stub sub-queries, not yet folded in.
    outcomes: Arc<OutcomeQueue<K::Outcome>>,

    /// The request lock.
    mu: Mutex<State<K>>,
}

impl<K: QueryKind> Request<K> {
    /// Creates a request that still needs `initialize`.
    fn new(
        name: &str,
        default_port: Option<&str>,
        timeout: Duration,
        fd_factory: Box<dyn PolledFdFactory>,
        engine: Arc<dyn EventEngine>,
        query: K::State,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Request {
            weak: weak.clone(),
            name: name.into(),
            default_port: default_port.map(Into::into),
            timeout,
            engine,
            outcomes: Default::default(),
            mu: Mutex::new(State {
                core: CoreState {
                    host: String::new(),
                    port: 0,
                    channel: None,
                    fd_nodes: FdNodeList::new(),
                    fd_factory,
                    initialized: false,
                    shutting_down: false,
                    cancelled: false,
                    deadline_exceeded: false,
                    query_timeout: None,
                    backup_poll: None,
                },
                start_ref: None,
                query,
            }),
        })
    }

    /// Returns a strong reference to this request.
    ///
    /// Cannot fail while a caller is inside one of our methods: whoever
    /// called us holds a strong reference already.
    fn strong(&self) -> Arc<Self> {
        self.weak.upgrade().expect("request is alive")
    }

    /// Parses the name and creates the stub channel.
    ///
    /// With `check_port`, a name without a port falls back to the
    /// default port and fails without one. A non-empty `dns_server`
    /// must be an `<ip>:<port>` authority and becomes the channel's
    /// sole server. Any failure after channel creation drops the
    /// channel again before returning.
    fn initialize(
        &self,
        channel_factory: &dyn ChannelFactory,
        dns_server: Option<&str>,
        check_port: bool,
    ) -> Result<(), Error> {
        let mut guard = self.mu.lock().expect("request lock");
        let core = &mut guard.core;
        debug_assert!(!core.initialized);
        let (host, mut port) =
            split_host_port(&self.name).unwrap_or(("", ""));
        if host.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "unparseable host:port: {:?}",
                self.name
            )));
        }
        if check_port && port.is_empty() {
            match self.default_port.as_deref() {
                None | Some("") => {
                    return Err(Error::InvalidArgument(format!(
                        "no port in name: {:?}",
                        self.name
                    )));
                }
                Some(default_port) => port = default_port,
            }
        }
        let port = if port.is_empty() {
            0
        } else {
            port.parse::<u16>().map_err(|_| {
                Error::InvalidArgument(format!(
                    "unparseable port in name: {:?}",
                    self.name
                ))
            })?
        };
        let options = ChannelOptions { stay_open: true };
        let mut channel = channel_factory
            .create_channel(&options)
            .map_err(Error::ChannelSetup)?;
        if let Some(server) = dns_server.filter(|server| !server.is_empty()) {
            debug!(name = %self.name, server, "using dns server override");
            let addr = parse_authority(server).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "cannot parse authority {:?}",
                    server
                ))
            })?;
            channel
                .set_servers(addr)
                .map_err(Error::ChannelSetup)?;
        }
        core.host = host.into();
        core.port = port;
        core.channel = Some(channel);
        core.initialized = true;
        Ok(())
    }

    /// Cancels the request.
    ///
    /// Returns `true` iff this call was the one that started shutdown.
    /// After a successful cancel the completion callback will not be
    /// invoked. Callbacks already in flight still run, observe the
    /// shutdown and fall through to releasing their references.
    fn cancel(&self) -> bool {
        let mut guard = self.mu.lock().expect("request lock");
        let core = &mut guard.core;
        if std::mem::replace(&mut core.shutting_down, true) {
            // Already resolved, timed out or cancelled.
            return false;
        }
        debug!(name = %self.name, "cancelling request");
        core.cancelled = true;
        self.cancel_timers(core);
        Self::shutdown_poller_handles(core, Err(Error::Cancelled));
        true
    }

    /// Reconciles tracked sockets with the stub's interest set.
    ///
    /// The stub never says when it stops caring about a socket, so
    /// every turn diffs its claimed set against the tracked list. New
    /// sockets get wrapped and registered, known ones get missing
    /// registrations armed, and no-longer-wanted ones get shut down.
    /// A shut-down node with a callback still in flight stays in the
    /// list so the callback can find it; it is dropped on a later turn.
    fn work(&self, state: &mut State<K>) {
        let core = &mut state.core;
        let mut new_list = FdNodeList::new();
        if !core.shutting_down {
            let channel =
                core.channel.as_mut().expect("initialized before work");
            let set = channel.socket_set();
            for i in 0..SOCKET_SET_SIZE {
                let wants_read = set.readable(i);
                let wants_write = set.writable(i);
                if !wants_read && !wants_write {
                    continue;
                }
                let socket = set.socket(i);
                let mut node = match core.fd_nodes.pop(socket) {
                    Some(node) => node,
                    None => {
                        trace!(name = %self.name, socket, "new fd");
                        let polled_fd =
                            core.fd_factory.new_polled_fd(socket);
                        FdNode::new(socket, polled_fd)
                    }
                };
                if wants_read && !node.readable_registered {
                    trace!(name = %self.name, socket, "notify read");
                    node.readable_registered = true;
                    let this = self.strong();
                    node.polled_fd.register_readable(Box::new(
                        move |status| this.on_readable(socket, status),
                    ));
                }
                if wants_write && !node.writable_registered {
                    trace!(name = %self.name, socket, "notify write");
                    node.writable_registered = true;
                    let this = self.strong();
                    node.polled_fd.register_writable(Box::new(
                        move |status| this.on_writable(socket, status),
                    ));
                }
                new_list.push(node);
            }
        }
        // Whatever the stub did not claim this turn is no longer in
        // use.
        for mut node in core.fd_nodes.take_all() {
            if !node.already_shutdown {
                node.polled_fd.shutdown(Ok(()));
                node.already_shutdown = true;
            }
            if node.readable_registered || node.writable_registered {
                new_list.push(node);
            } else {
                trace!(
                    name = %self.name,
                    fd = %node.polled_fd.name(),
                    "delete fd"
                );
            }
        }
        core.fd_nodes = new_list;
    }

    /// Arms the deadline and backup poll timers.
    fn start_timers(&self, state: &mut State<K>) {
        let timeout = if self.timeout.is_zero() {
            Duration::MAX
        } else {
            self.timeout
        };
        debug!(name = %self.name, ?timeout, "starting timers");
        let this = self.strong();
        state.core.query_timeout = Some(self.engine.run_after(
            timeout,
            Box::new(move || this.on_query_timeout()),
        ));
        let this = self.strong();
        state.core.backup_poll = Some(self.engine.run_after(
            BACKUP_POLL_INTERVAL,
            Box::new(move || this.on_backup_poll()),
        ));
    }

    /// Disarms both timers where the engine still can.
    ///
    /// A successfully cancelled timer has its closure dropped by the
    /// engine, which releases the reference the closure captured. A
    /// timer past cancellation runs, observes the shutdown and releases
    /// its own reference.
    fn cancel_timers(&self, core: &mut CoreState) {
        if let Some(handle) = core.query_timeout.take() {
            self.engine.cancel(handle);
        }
        if let Some(handle) = core.backup_poll.take() {
            self.engine.cancel(handle);
        }
    }

    /// Shuts down every tracked polled fd that is still up.
    fn shutdown_poller_handles(
        core: &mut CoreState,
        status: Result<(), Error>,
    ) {
        for node in core.fd_nodes.iter_mut() {
            if !node.already_shutdown {
                node.polled_fd.shutdown(status.clone());
                node.already_shutdown = true;
            }
        }
    }

    /// Folds every queued sub-query result into the request state.
    fn drain_outcomes(&self, state: &mut State<K>) {
        while let Some(outcome) = self.outcomes.pop() {
            K::handle_outcome(self, state, outcome);
        }
    }

    /// A readable callback fired for a tracked socket.
    ///
    /// On a clean event the stub processes the socket until the kernel
    /// buffer is drained. On an error or during shutdown every pending
    /// query is cancelled instead; the per-query cancellations arrive
    /// through the normal completion funnel.
    fn on_readable(&self, socket: Socket, status: Result<(), Error>) {
        let mut guard = self.mu.lock().expect("request lock");
        let state = &mut *guard;
        {
            let core = &mut state.core;
            let Some(node) = core.fd_nodes.get_mut(socket) else {
                debug_assert!(false, "callback for untracked socket");
                return;
            };
            debug_assert!(node.readable_registered);
            node.readable_registered = false;
            trace!(
                name = %self.name,
                socket,
                ok = status.is_ok(),
                "on readable"
            );
            let channel =
                core.channel.as_mut().expect("initialized before events");
            if status.is_ok() && !core.shutting_down {
                loop {
                    channel.process_fd(socket, BAD_SOCKET);
                    if !node.polled_fd.is_still_readable() {
                        break;
                    }
                }
            } else {
                channel.cancel_queries();
            }
        }
        self.drain_outcomes(state);
        self.work(state);
    }

    /// A writable callback fired for a tracked socket.
    fn on_writable(&self, socket: Socket, status: Result<(), Error>) {
        let mut guard = self.mu.lock().expect("request lock");
        let state = &mut *guard;
        {
            let core = &mut state.core;
            let Some(node) = core.fd_nodes.get_mut(socket) else {
                debug_assert!(false, "callback for untracked socket");
                return;
            };
            debug_assert!(node.writable_registered);
            node.writable_registered = false;
            trace!(
                name = %self.name,
                socket,
                ok = status.is_ok(),
                "on writable"
            );
            let channel =
                core.channel.as_mut().expect("initialized before events");
            if status.is_ok() && !core.shutting_down {
                channel.process_fd(BAD_SOCKET, socket);
            } else {
                channel.cancel_queries();
            }
        }
        self.drain_outcomes(state);
        self.work(state);
    }

    /// The overall deadline fired.
    fn on_query_timeout(&self) {
        let mut guard = self.mu.lock().expect("request lock");
        let core = &mut guard.core;
        core.query_timeout = None;
        debug!(
            name = %self.name,
            shutting_down = core.shutting_down,
            "query timeout"
        );
        if !core.shutting_down {
            core.shutting_down = true;
            core.deadline_exceeded = true;
            Self::shutdown_poller_handles(
                core,
                Err(Error::DeadlineExceeded),
            );
        }
    }

    /// The backup poll timer fired.
    ///
    /// Feeds every live socket to the stub as both read and write side
    /// and lets the stub decide what that enables, then re-arms.
    fn on_backup_poll(&self) {
        let mut guard = self.mu.lock().expect("request lock");
        let state = &mut *guard;
        state.core.backup_poll = None;
        trace!(
            name = %self.name,
            shutting_down = state.core.shutting_down,
            "backup poll"
        );
        if state.core.shutting_down {
            return;
        }
        {
            let core = &mut state.core;
            let channel =
                core.channel.as_mut().expect("initialized before timers");
            for node in core.fd_nodes.iter_mut() {
                if !node.already_shutdown {
                    trace!(
                        name = %self.name,
                        socket = node.socket,
                        "backup poll process"
                    );
                    channel.process_fd(node.socket, node.socket);
                }
            }
        }
        self.drain_outcomes(state);
        if !state.core.shutting_down {
            let this = self.strong();
            state.core.backup_poll = Some(self.engine.run_after(
                BACKUP_POLL_INTERVAL,
                Box::new(move || this.on_backup_poll()),
            ));
            self.work(state);
        }
    }

    /// Posts a completion to the event engine.
    ///
    /// Never invokes the callback inline: the caller holds the request
    /// lock, and the callback may reach back into layers with locks of
    /// their own.
    fn post_resolve<T: Send + 'static>(
        &self,
        on_resolve: OnResolve<T>,
        result: Result<T, Error>,
    ) {
        self.engine.run(Box::new(move || on_resolve(result)));
    }
}
