// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection lifecycle and RPC facade.
//!
//! One [`Connection`] owns one TCP socket and three cooperating threads
//! (reader, writer, deadline ticker; plus an optional keep-alive pinger).
//! Any number of caller threads submit requests concurrently through the
//! pipeline slot table.
//!
//! # State Machine
//!
//! ```text
//!      +--------+   dial    +------------+   login ok   +-----------+
//!      |  Init  |---------->| Connecting |------------->| Connected |
//!      +--------+           +-----+------+              +-----+-----+
//!                                 |                           |
//!                                 | dial/login error          | I/O or protocol
//!                                 v                           v error, terminate
//!                            +--------+<----------------------+
//!                            | Failed |   (terminal, one-shot)
//!                            +--------+
//! ```
//!
//! The Failed transition happens exactly once: the first error stores itself
//! as the terminal error, closes the failure channel, and shuts the socket
//! down. Every current and future waiter then resolves with that same error.

use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use crossbeam::channel::{bounded, never, Receiver, RecvTimeoutError, Sender};
use crossbeam::select;
use parking_lot::{Condvar, Mutex};
use socket2::{SockRef, TcpKeepalive};

use crate::config::ConnectOptions;
use crate::errors::{Error, Result};
use crate::reader::spawn_reader;
use crate::slots::SlotTable;
use crate::ticker::{spawn_ticker, Clock};
use crate::uri::ConnString;
use crate::wire::{self, commands, Arg, STATUS_OK};
use crate::writer::{spawn_writer, WriteQueue};

/// Callback for server-initiated frames that match no live slot.
///
/// Receives the frame's sequence and raw payload. Late replies to locally
/// timed-out requests arrive here too, so a handler must tolerate stray
/// frames.
pub type UpdatesHandler = Box<dyn Fn(u32, Vec<u8>) + Send + Sync>;

// ============================================================================
// Connection state
// ============================================================================

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Created, no dial attempted yet
    #[default]
    Init,

    /// Dial and login in progress
    Connecting,

    /// Logged in and operational
    Connected,

    /// Terminally failed; the stored error reaches every waiter
    Failed,
}

impl ConnState {
    /// Check if requests can be submitted.
    pub fn is_operational(&self) -> bool {
        matches!(self, ConnState::Connected)
    }

    /// Check if the connection is past recovery.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnState::Failed)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnState::Connecting,
            2 => ConnState::Connected,
            3 => ConnState::Failed,
            _ => ConnState::Init,
        }
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnState::Init => "Init",
            ConnState::Connecting => "Connecting",
            ConnState::Connected => "Connected",
            ConnState::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Failure switch
// ============================================================================

/// One-shot failure path shared by every thread of a connection.
///
/// Tripping stores the terminal error, shuts the socket down, and closes the
/// failure channel by dropping its sender; later trips are no-ops.
pub(crate) struct FailSwitch {
    state: AtomicU8,
    error: Mutex<Option<Error>>,
    failure_tx: Mutex<Option<Sender<()>>>,
    socket: Mutex<Option<TcpStream>>,
}

impl FailSwitch {
    pub(crate) fn new(failure_tx: Sender<()>) -> Self {
        Self {
            state: AtomicU8::new(ConnState::Init as u8),
            error: Mutex::new(None),
            failure_tx: Mutex::new(Some(failure_tx)),
            socket: Mutex::new(None),
        }
    }

    /// Switch with no failure channel or socket attached (component tests).
    #[cfg(test)]
    pub(crate) fn new_detached() -> Self {
        Self {
            state: AtomicU8::new(ConnState::Connected as u8),
            error: Mutex::new(None),
            failure_tx: Mutex::new(None),
            socket: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move through the connect sequence; never leaves Failed.
    fn advance(&self, next: ConnState) {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if ConnState::from_u8(cur).is_terminal() {
                return;
            }
            match self.state.compare_exchange(
                cur,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Attach the socket that a later trip must shut down.
    fn set_socket(&self, sock: TcpStream) {
        *self.socket.lock() = Some(sock);
    }

    pub(crate) fn tripped(&self) -> bool {
        self.state().is_terminal()
    }

    /// Perform the one-shot Failed transition. Returns true for the caller
    /// that actually tripped it.
    pub(crate) fn trip(&self, err: Error) -> bool {
        let prev = self.state.swap(ConnState::Failed as u8, Ordering::AcqRel);
        if ConnState::from_u8(prev).is_terminal() {
            return false;
        }

        if err.is_fatal() {
            log::warn!("[conn] failed: {}", err);
        } else {
            log::debug!("[conn] closed: {}", err);
        }

        // The error must be visible before the channel close wakes waiters.
        *self.error.lock() = Some(err);

        if let Some(sock) = self.socket.lock().take() {
            let _ = sock.shutdown(Shutdown::Both);
        }

        drop(self.failure_tx.lock().take());
        true
    }

    /// The stored terminal error.
    pub(crate) fn terminal_error(&self) -> Error {
        self.error
            .lock()
            .clone()
            .unwrap_or_else(|| Error::Network("connection failed".into()))
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Per-connection transport counters, updated by whichever thread owns the
/// event.
#[derive(Default)]
pub(crate) struct ConnStats {
    pub(crate) frames_sent: AtomicU64,
    pub(crate) frames_received: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) timeouts_fired: AtomicU64,
    pub(crate) stale_frames: AtomicU64,
}

impl ConnStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            timeouts_fired: self.timeouts_fired.load(Ordering::Relaxed),
            stale_frames: self.stale_frames.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a connection's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Requests handed to the writer
    pub frames_sent: u64,
    /// Frames decoded off the socket
    pub frames_received: u64,
    /// Bytes flushed to the socket, framing included
    pub bytes_sent: u64,
    /// Bytes consumed from the socket, framing included
    pub bytes_received: u64,
    /// Per-request deadlines fired by the ticker
    pub timeouts_fired: u64,
    /// Frames dropped as stale (no owner and no updates handler)
    pub stale_frames: u64,
}

// ============================================================================
// Reply
// ============================================================================

/// A successful reply's result arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    /// Result arguments in server order
    pub args: Vec<Arg>,
}

// ============================================================================
// Pending completion accounting
// ============================================================================

/// Counts in-flight `call_async` completions so `finalize` can drain them.
#[derive(Default)]
struct PendingCompletions {
    count: Mutex<usize>,
    drained: Condvar,
}

impl PendingCompletions {
    fn inc(&self) {
        *self.count.lock() += 1;
    }

    fn dec(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn current(&self) -> usize {
        *self.count.lock()
    }

    fn wait_drained(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.drained.wait(&mut count);
        }
    }
}

// ============================================================================
// Shared connection state
// ============================================================================

struct Inner {
    opts: ConnectOptions,
    slots: Arc<SlotTable>,
    clock: Arc<Clock>,
    queue: Arc<WriteQueue>,
    fail: Arc<FailSwitch>,
    stats: Arc<ConnStats>,
    updates: Arc<ArcSwapOption<UpdatesHandler>>,
    failure_rx: Receiver<()>,
    server_start: AtomicI64,
    terminated: AtomicBool,
    pending: PendingCompletions,
}

impl Inner {
    /// Claim a slot, encode, and hand the frame to the writer.
    ///
    /// `inherit_default` substitutes the connection's request timeout for a
    /// zero deadline; login opts out so "wait indefinitely" stays literal.
    fn submit(
        &self,
        cmd: u16,
        deadline_secs: u32,
        inherit_default: bool,
        args: &[Arg],
    ) -> Result<u32> {
        // Surface unencodable arguments before any slot or byte moves.
        wire::validate_args(args)?;

        if self.fail.tripped() {
            return Err(self.fail.terminal_error());
        }

        let seq = self
            .slots
            .acquire(&self.failure_rx)
            .ok_or_else(|| self.fail.terminal_error())?;

        // acquire() may win the race against a concurrent failure; re-check
        // so we never queue bytes on a dead connection.
        if self.fail.tripped() {
            self.slots.release(seq);
            return Err(self.fail.terminal_error());
        }

        let effective = if deadline_secs != 0 {
            deadline_secs
        } else if inherit_default {
            self.opts.request_timeout
        } else {
            0
        };
        let deadline_abs = if effective != 0 {
            self.clock.now().saturating_add(effective)
        } else {
            0
        };
        self.slots.claim(seq, deadline_abs);

        let mut frame = Vec::with_capacity(128);
        if let Err(e) =
            wire::encode_request(&mut frame, cmd, seq, args, i64::from(effective) * 1000)
        {
            self.slots.release(seq);
            return Err(e);
        }

        self.queue.submit(&frame);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "[conn] -> {} seq={} deadline={}s",
            commands::command_name(cmd),
            seq,
            effective
        );
        Ok(seq)
    }

    /// Block on the slot's reply, its timeout, the connection failure, and
    /// the caller's optional cancellation; then recycle the slot.
    fn await_reply(&self, seq: u32, cancel: Option<&Receiver<()>>) -> Result<Reply> {
        let slot = self.slots.slot(seq);
        let nothing = never::<()>();
        let cancel_rx = cancel.unwrap_or(&nothing);

        let result = loop {
            select! {
                recv(&slot.reply_rx) -> msg => {
                    match msg {
                        // A previous occupant's leftover; not ours.
                        Ok((rseq, _)) if rseq != seq => continue,
                        Ok((_, payload)) => break self.parse_reply(&payload),
                        Err(_) => break Err(self.fail.terminal_error()),
                    }
                }
                recv(&slot.timeout_rx) -> msg => {
                    // Stale timeouts name a previous occupant; ignore them.
                    if msg == Ok(seq) {
                        break Err(Error::Timeout);
                    }
                }
                recv(&self.failure_rx) -> _ => break Err(self.fail.terminal_error()),
                recv(cancel_rx) -> _ => break Err(Error::Canceled),
            }
        };

        self.slots.release(seq);
        result
    }

    /// Decode a reply payload into a result.
    ///
    /// A payload that cannot be decoded is stream corruption and poisons the
    /// connection; a non-OK status is local to this request.
    fn parse_reply(&self, payload: &[u8]) -> Result<Reply> {
        let body = match wire::decode_reply(payload) {
            Ok(b) => b,
            Err(we) => {
                let e = Error::from(we);
                self.fail.trip(e.clone());
                return Err(e);
            }
        };
        if body.status != STATUS_OK {
            return Err(Error::Server {
                code: body.status,
                message: body.message,
            });
        }
        Ok(Reply { args: body.args })
    }

    fn call(
        &self,
        cmd: u16,
        deadline_secs: u32,
        inherit_default: bool,
        args: &[Arg],
        cancel: Option<&Receiver<()>>,
    ) -> Result<Reply> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(Error::Canceled);
        }
        let seq = self.submit(cmd, deadline_secs, inherit_default, args)?;
        self.await_reply(seq, cancel)
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A live cproto connection.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Dropping the
/// connection finalizes it.
pub struct Connection {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish()
    }
}

impl Connection {
    /// Dial, log in, and return an operational connection.
    ///
    /// The login timeout in `opts` budgets dial plus login together: the
    /// dial consumes the full budget as its socket timeout and the login
    /// send gets whatever the ticker says is left.
    pub fn connect(uri: &str, opts: ConnectOptions) -> Result<Connection> {
        opts.validate()?;
        let cs = ConnString::parse(uri)?;

        let (failure_tx, failure_rx) = bounded::<()>(1);
        let slots = Arc::new(SlotTable::new(opts.pipeline_depth));
        let clock = Arc::new(Clock::new());
        let stats = Arc::new(ConnStats::default());
        let queue = Arc::new(WriteQueue::new(opts.buffer_hint));
        let fail = Arc::new(FailSwitch::new(failure_tx));
        let updates: Arc<ArcSwapOption<UpdatesHandler>> = Arc::new(ArcSwapOption::empty());

        let inner = Arc::new(Inner {
            opts: opts.clone(),
            slots: Arc::clone(&slots),
            clock: Arc::clone(&clock),
            queue: Arc::clone(&queue),
            fail: Arc::clone(&fail),
            stats: Arc::clone(&stats),
            updates: Arc::clone(&updates),
            failure_rx: failure_rx.clone(),
            server_start: AtomicI64::new(0),
            terminated: AtomicBool::new(false),
            pending: PendingCompletions::default(),
        });

        let mut threads = vec![spawn_ticker(
            Arc::clone(&slots),
            Arc::clone(&clock),
            Arc::clone(&stats),
            failure_rx.clone(),
        )];

        fail.advance(ConnState::Connecting);
        log::debug!(
            "[conn] dialing {} (pipeline depth {})",
            cs.address(),
            slots.depth()
        );

        let sock = match dial(&cs, opts.login_timeout) {
            Ok(s) => s,
            Err(e) => {
                fail.trip(e.clone());
                join_all(threads);
                return Err(e);
            }
        };

        if let Err(e) = configure_socket(&sock, &opts) {
            fail.trip(e.clone());
            join_all(threads);
            return Err(e);
        }

        match (sock.try_clone(), sock.try_clone()) {
            (Ok(read_half), Ok(shutdown_handle)) => {
                fail.set_socket(shutdown_handle);
                threads.push(spawn_reader(
                    read_half,
                    Arc::clone(&slots),
                    Arc::clone(&clock),
                    Arc::clone(&updates),
                    Arc::clone(&fail),
                    Arc::clone(&stats),
                ));
                threads.push(spawn_writer(
                    sock,
                    Arc::clone(&queue),
                    Arc::clone(&fail),
                    Arc::clone(&stats),
                    failure_rx,
                ));
            }
            (Err(e), _) | (_, Err(e)) => {
                let err = Error::network(&e);
                fail.trip(err.clone());
                join_all(threads);
                return Err(err);
            }
        }

        if let Err(e) = login(&inner, &cs) {
            fail.trip(e.clone());
            join_all(threads);
            return Err(e);
        }
        fail.advance(ConnState::Connected);
        log::debug!(
            "[conn] connected to {} (database {:?})",
            cs.address(),
            cs.database
        );

        if opts.keep_alive_interval > 0 {
            threads.push(spawn_keepalive(Arc::clone(&inner)));
        }

        Ok(Connection {
            inner,
            threads: Mutex::new(threads),
        })
    }

    /// Issue a request and block for its outcome.
    ///
    /// `deadline_secs` of 0 inherits the connection's request timeout
    /// (0 there too means no deadline). Exactly one of reply, timeout, or
    /// connection failure resolves the call.
    pub fn call(&self, cmd: u16, deadline_secs: u32, args: &[Arg]) -> Result<Reply> {
        self.inner.call(cmd, deadline_secs, true, args, None)
    }

    /// Like [`Connection::call`], additionally resolving with
    /// [`Error::Canceled`] if the caller's channel closes or receives first.
    /// The slot is reclaimed on every path.
    pub fn call_with_cancel(
        &self,
        cmd: u16,
        deadline_secs: u32,
        args: &[Arg],
        cancel: &Receiver<()>,
    ) -> Result<Reply> {
        self.inner.call(cmd, deadline_secs, true, args, Some(cancel))
    }

    /// Issue a request and deliver the outcome to `completion`, exactly once,
    /// from a waiter thread.
    pub fn call_async<F>(&self, cmd: u16, deadline_secs: u32, args: Vec<Arg>, completion: F)
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        inner.pending.inc();

        #[allow(clippy::expect_used)] // thread spawn failure is unrecoverable
        thread::Builder::new()
            .name("cproto-waiter".into())
            .spawn(move || {
                let result = inner.call(cmd, deadline_secs, true, &args, None);
                completion(result);
                inner.pending.dec();
            })
            .expect("failed to spawn waiter thread");
    }

    /// Install the handler for frames that match no live slot.
    pub fn set_updates_handler<F>(&self, handler: F)
    where
        F: Fn(u32, Vec<u8>) + Send + Sync + 'static,
    {
        self.inner
            .updates
            .store(Some(Arc::new(Box::new(handler) as UpdatesHandler)));
    }

    /// Remove the updates handler; unmatched frames are drained again.
    pub fn clear_updates_handler(&self) {
        self.inner.updates.store(None);
    }

    /// Begin shutdown: reject new requests and resolve every in-flight one
    /// with [`Error::Canceled`]. Idempotent.
    pub fn set_terminate(&self) {
        if self.inner.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.fail.trip(Error::Canceled);
    }

    /// Terminate, wait for async completions to drain, and join the
    /// background threads.
    pub fn finalize(&self) {
        self.set_terminate();
        self.inner.pending.wait_drained();
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        join_all(handles);
    }

    /// Seconds since connect, as observed by the deadline ticker.
    pub fn now(&self) -> u32 {
        self.inner.clock.now()
    }

    /// Async completions submitted but not yet invoked.
    pub fn pending_completions(&self) -> usize {
        self.inner.pending.current()
    }

    /// Server start timestamp from the login reply (epoch seconds; 0 when the
    /// server did not report one). Outer clients use it for staleness checks.
    pub fn server_start_time(&self) -> i64 {
        self.inner.server_start.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.inner.fail.state()
    }

    /// Transport counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Dial, log in, and return an operational connection.
///
/// Convenience wrapper over [`Connection::connect`] with default pipeline
/// sizing.
pub fn new_connection(
    uri: &str,
    login_timeout_secs: u32,
    request_timeout_secs: u32,
) -> Result<Connection> {
    Connection::connect(
        uri,
        ConnectOptions::default()
            .with_login_timeout(login_timeout_secs)
            .with_request_timeout(request_timeout_secs),
    )
}

// ============================================================================
// Connect helpers
// ============================================================================

fn dial(cs: &ConnString, login_timeout_secs: u32) -> Result<TcpStream> {
    let addrs = (cs.host.as_str(), cs.port)
        .to_socket_addrs()
        .map_err(|e| Error::Network(format!("resolve {}: {}", cs.address(), e)))?;

    let mut last = Error::Network(format!("no addresses for {}", cs.address()));
    for addr in addrs {
        let attempt = if login_timeout_secs == 0 {
            TcpStream::connect(addr)
        } else {
            TcpStream::connect_timeout(&addr, Duration::from_secs(u64::from(login_timeout_secs)))
        };
        match attempt {
            Ok(sock) => return Ok(sock),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => last = Error::Timeout,
            Err(e) => last = Error::network(&e),
        }
    }
    Err(last)
}

fn configure_socket(sock: &TcpStream, opts: &ConnectOptions) -> Result<()> {
    sock.set_nodelay(true).map_err(|e| Error::network(&e))?;
    if opts.keep_alive_interval > 0 {
        let probes =
            TcpKeepalive::new().with_time(Duration::from_secs(u64::from(opts.keep_alive_interval)));
        SockRef::from(sock)
            .set_tcp_keepalive(&probes)
            .map_err(|e| Error::network(&e))?;
    }
    Ok(())
}

/// Issue the login command with the remaining login budget.
fn login(inner: &Inner, cs: &ConnString) -> Result<()> {
    let budget = inner.opts.login_timeout;
    let remaining = if budget == 0 {
        0
    } else {
        let elapsed = inner.clock.now();
        if elapsed >= budget {
            return Err(Error::Timeout);
        }
        budget - elapsed
    };

    let args = [
        Arg::from(cs.user.as_str()),
        Arg::from(cs.password.as_str()),
        Arg::from(cs.database.as_str()),
    ];
    let reply = inner.call(commands::CMD_LOGIN, remaining, false, &args, None)?;

    if let Some(ts) = reply.args.get(1).and_then(Arg::as_int64) {
        inner.server_start.store(ts, Ordering::Release);
    }
    Ok(())
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.join();
    }
}

// ============================================================================
// Keep-alive
// ============================================================================

/// Spawn the keep-alive pinger.
///
/// Wakes every interval and pings only when the reader has seen no traffic
/// for a full interval; the reply is discarded. Exits when the connection
/// fails or is finalized.
fn spawn_keepalive(inner: Arc<Inner>) -> JoinHandle<()> {
    let interval_secs = inner.opts.keep_alive_interval;
    let interval = Duration::from_secs(u64::from(interval_secs));

    #[allow(clippy::expect_used)] // thread spawn failure is unrecoverable
    let handle = thread::Builder::new()
        .name("cproto-keepalive".into())
        .spawn(move || {
            log::debug!("[keepalive] started (interval={}s)", interval_secs);

            loop {
                match inner.failure_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if inner.clock.idle_secs() < interval_secs {
                            log::trace!("[keepalive] link busy, ping skipped");
                            continue;
                        }
                        match inner.call(commands::CMD_PING, interval_secs, false, &[], None) {
                            Ok(_) => log::trace!("[keepalive] pong"),
                            Err(e) => log::debug!("[keepalive] ping failed: {}", e),
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            log::debug!("[keepalive] stopped");
        })
        .expect("failed to spawn keepalive thread");
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    #[test]
    fn test_state_helpers() {
        assert!(ConnState::Connected.is_operational());
        assert!(!ConnState::Connecting.is_operational());
        assert!(ConnState::Failed.is_terminal());
        assert!(!ConnState::Init.is_terminal());
        assert_eq!(ConnState::Connecting.to_string(), "Connecting");
    }

    #[test]
    fn test_fail_switch_one_shot() {
        let (tx, rx) = unbounded::<()>();
        let fs = FailSwitch::new(tx);
        fs.advance(ConnState::Connecting);
        fs.advance(ConnState::Connected);
        assert_eq!(fs.state(), ConnState::Connected);
        assert!(!fs.tripped());

        assert!(fs.trip(Error::Network("boom".into())));
        assert!(fs.tripped());
        // The failure channel is now closed.
        assert!(rx.recv().is_err());

        // Second trip loses and must not overwrite the stored error.
        assert!(!fs.trip(Error::Timeout));
        assert_eq!(fs.terminal_error(), Error::Network("boom".into()));

        // Advancing after failure is a no-op.
        fs.advance(ConnState::Connected);
        assert_eq!(fs.state(), ConnState::Failed);
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = ConnStats::default();
        stats.frames_sent.fetch_add(3, Ordering::Relaxed);
        stats.stale_frames.fetch_add(1, Ordering::Relaxed);
        let snap = stats.snapshot();
        assert_eq!(snap.frames_sent, 3);
        assert_eq!(snap.stale_frames, 1);
        assert_eq!(snap.timeouts_fired, 0);
    }

    #[test]
    fn test_pending_completions_drain() {
        let pending = Arc::new(PendingCompletions::default());
        pending.inc();
        pending.inc();
        assert_eq!(pending.current(), 2);

        let p2 = Arc::clone(&pending);
        let waiter = std::thread::spawn(move || p2.wait_drained());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        pending.dec();
        pending.dec();
        waiter.join().unwrap();
        assert_eq!(pending.current(), 0);
    }
}
