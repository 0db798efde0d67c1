use std::{
    collections::{HashMap, HashSet},
    fmt,
    io::{self, Read, Write},
    mem,
    net::SocketAddr,
    os::unix::io::{AsRawFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, Sender};
use mio::{
    event::Event,
    net::{TcpListener, TcpStream, UdpSocket},
    Events, Interest, Poll, Token,
};
use paumiot_core::{
    config::Config,
    constants::MAX_DATAGRAM_SIZE,
    error::{ErrorKind, Result},
    memory_pool::MemoryPool,
};
use paumiot_protocol::{
    detector::MIN_DETECT_LEN, DetectionCache, InternalMessage, PalRegistry, Protocol,
    ProtocolDetector, Transport,
};
use parking_lot::Mutex;
use socket2::{Domain, Socket as Socket2, Type};
use tracing::{debug, error, info, trace, warn};

use crate::{
    connection::ConnectionRecord,
    dispatch::{Dispatcher, MessageHandler},
    event_types::{Action, GatewayEvent},
    handlers::{self, HandlerContext, UNSUPPORTED_UDP_REPLY},
    session_table::SessionTable,
    socket_state::SocketState,
    stats::{GatewayStats, SharedStats, StatsSnapshot, ThroughputMonitor},
    time::{Clock, SystemClock},
};

const LISTENER: Token = Token(0);
const UDP: Token = Token(1);
const TOKEN_OFFSET: usize = 2;

/// Poll timeout while connections wait in the backlog.
const BACKLOG_POLL_TIMEOUT: Duration = Duration::from_millis(10);

#[inline]
fn token_of(fd: RawFd) -> Token {
    Token(fd as usize + TOKEN_OFFSET)
}

/// Applies socket options from configuration to a socket2 socket.
fn apply_socket_options(socket: &Socket2, config: &Config) -> io::Result<()> {
    socket.set_reuse_address(true)?;

    if let Some(size) = config.socket_recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.socket_send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }

    socket.set_nonblocking(true)
}

fn bind_listener(config: &Config) -> io::Result<TcpListener> {
    let address = config.socket_addr();
    let socket =
        Socket2::new(Domain::for_address(address), Type::STREAM, Some(socket2::Protocol::TCP))?;
    apply_socket_options(&socket, config)?;
    socket.bind(&address.into())?;
    socket.listen(config.listen_backlog)?;
    Ok(TcpListener::from_std(socket.into()))
}

fn bind_datagram(config: &Config, port: u16) -> io::Result<UdpSocket> {
    let address = SocketAddr::new(config.bind_address, port);
    let socket =
        Socket2::new(Domain::for_address(address), Type::DGRAM, Some(socket2::Protocol::UDP))?;
    apply_socket_options(&socket, config)?;
    socket.bind(&address.into())?;
    Ok(UdpSocket::from_std(socket.into()))
}

fn publish(sender: &Sender<GatewayEvent>, event: GatewayEvent) -> bool {
    sender.try_send(event).is_ok()
}

/// How a read pass over one connection ended.
enum Fill {
    /// The socket would block.
    Drained,
    /// The read buffer has no room left.
    Full,
    /// The peer closed its side.
    Eof,
}

/// Outcome of offering one framed message to admission and its handler.
enum Step {
    /// A frame was consumed; try the next one.
    Again,
    /// Nothing complete is buffered.
    Idle,
    /// Work remains but must wait for the backlog retry.
    Blocked,
}

/// Protocol-agnostic gateway serving TCP and UDP on one port from a single thread.
pub struct Gateway {
    config: Config,
    clock: Arc<dyn Clock>,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    udp: UdpSocket,
    streams: HashMap<RawFd, TcpStream>,
    sessions: SessionTable,
    pool: MemoryPool,
    detector: ProtocolDetector,
    cache: Option<DetectionCache>,
    pal: PalRegistry,
    dispatcher: Option<Dispatcher>,
    event_sender: Sender<GatewayEvent>,
    event_receiver: Receiver<GatewayEvent>,
    datagram: Vec<u8>,
    /// Messages produced this iteration, handed off in `flush_forwards`
    pending_forwards: Vec<InternalMessage>,
    /// Connections with buffered input waiting on admission or write space
    backlog: HashSet<RawFd>,
    /// Connections to close once their write buffer drains
    drain_then_close: HashSet<RawFd>,
    /// Connections in `Closing`, released at the end of the iteration
    closing: Vec<RawFd>,
    stats: GatewayStats,
    throughput: ThroughputMonitor,
    shared_stats: SharedStats,
    last_cleanup: Instant,
    last_stats: Instant,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("sessions", &self.sessions.len())
            .field("backlog", &self.backlog.len())
            .field("dispatcher", &self.dispatcher)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Gateway {
    /// Binds the TCP listener and the UDP socket described by `config`.
    pub fn bind(config: Config) -> Result<Self> {
        Self::bind_with_config_and_clock(config, Arc::new(SystemClock))
    }

    /// Binds with a custom clock, for tests.
    ///
    /// With port 0 the UDP socket takes whatever port the listener was given.
    pub fn bind_with_config_and_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let mut listener = bind_listener(&config)?;
        let port = listener.local_addr()?.port();
        let mut udp = bind_datagram(&config, port)?;

        let poll = Poll::new()?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        poll.registry().register(&mut udp, UDP, Interest::READABLE)?;

        let pool = MemoryPool::new(ConnectionRecord::block_size(&config), config.max_connections)?;
        let (event_sender, event_receiver) = bounded(config.event_channel_capacity);
        let cache = config.detection_cache_enabled.then(|| {
            DetectionCache::new(config.detection_cache_ttl, config.detection_cache_capacity)
        });
        let now = clock.now();

        info!(
            "[ACCEPT] listening on {}:{} (TCP and UDP), {} connection slots",
            config.bind_address, port, config.max_connections
        );

        Ok(Self {
            events: Events::with_capacity(config.max_events),
            streams: HashMap::new(),
            sessions: SessionTable::new(&config),
            pool,
            detector: ProtocolDetector::new(config.detect_encrypted),
            cache,
            pal: PalRegistry::with_default_adapters(),
            dispatcher: None,
            event_sender,
            event_receiver,
            datagram: vec![0; MAX_DATAGRAM_SIZE],
            pending_forwards: Vec::new(),
            backlog: HashSet::new(),
            drain_then_close: HashSet::new(),
            closing: Vec::new(),
            stats: GatewayStats::default(),
            throughput: ThroughputMonitor::new(config.stats_interval, now),
            shared_stats: Arc::new(Mutex::new(StatsSnapshot::default())),
            last_cleanup: now,
            last_stats: now,
            config,
            clock,
            poll,
            listener,
            udp,
        })
    }

    /// Routes decoded messages to `handler` through `dispatch_workers` threads.
    ///
    /// Without a handler, messages are published as [`GatewayEvent::Message`].
    pub fn with_message_handler(mut self, handler: Arc<dyn MessageHandler>) -> Result<Self> {
        if self.config.dispatch_workers == 0 {
            return Err(ErrorKind::InvalidParameter("dispatch_workers must be non-zero"));
        }
        self.dispatcher = Some(Dispatcher::new(
            self.config.dispatch_workers,
            self.config.dispatch_queue_capacity,
            handler,
        )?);
        Ok(self)
    }

    /// Returns the address the TCP listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Returns the address the UDP socket is bound to.
    pub fn udp_local_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    /// Returns a receiver for gateway events.
    pub fn get_event_receiver(&self) -> Receiver<GatewayEvent> {
        self.event_receiver.clone()
    }

    /// Returns the snapshot slot refreshed every `stats_interval`.
    pub fn stats_handle(&self) -> SharedStats {
        Arc::clone(&self.shared_stats)
    }

    /// Current event counters.
    pub fn stats(&self) -> GatewayStats {
        self.stats
    }

    /// Live session table.
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Adaptation layer used by the handlers.
    pub fn pal_mut(&mut self) -> &mut PalRegistry {
        &mut self.pal
    }

    /// Configuration the gateway was bound with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Builds a snapshot of the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut snapshot = StatsSnapshot {
            stats: self.stats,
            active_sessions: self.sessions.len(),
            bucket_histogram: self.sessions.bucket_histogram(),
            pool_available: self.pool.available(),
            last_throughput: self.throughput.last_throughput(),
            average_throughput: self.throughput.average(),
            pal: self.pal.stats(),
            ..StatsSnapshot::default()
        };
        for record in self.sessions.iter() {
            snapshot.sessions_by_protocol[record.protocol().index()] += 1;
            if record.state() == SocketState::Throttled {
                snapshot.throttled_sessions += 1;
            }
            if record.congestion.in_slow_start() {
                snapshot.slow_start_sessions += 1;
            }
            snapshot.stats.invalid_transitions += u64::from(record.invalid_transitions());
        }
        snapshot
    }

    /// Polls until `stop` is set, then closes every connection.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        let mut result = Ok(());
        while !stop.load(Ordering::Acquire) {
            if let Err(err) = self.manual_poll() {
                error!("[STATE] event loop failed: {}", err);
                result = Err(err);
                break;
            }
        }
        self.shutdown();
        result
    }

    /// Runs one loop iteration: wait for readiness, serve every event, then
    /// retry the backlog, hand off messages, run timers and release closed
    /// connections.
    pub fn manual_poll(&mut self) -> Result<()> {
        let timeout = if self.backlog.is_empty() {
            self.config.poll_timeout
        } else {
            self.config.poll_timeout.min(BACKLOG_POLL_TIMEOUT)
        };

        let mut events = mem::replace(&mut self.events, Events::with_capacity(0));
        let polled = match self.poll.poll(&mut events, Some(timeout)) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(()),
            other => other,
        };
        if polled.is_ok() {
            let now = self.clock.now();
            for event in events.iter() {
                self.handle_event(event, now);
            }
        }
        self.events = events;
        polled?;

        let now = self.clock.now();
        self.retry_backlog(now);
        self.flush_forwards();
        self.run_timers(now);
        self.reap(now);
        Ok(())
    }

    /// Closes every connection and stops the dispatch pool.
    pub fn shutdown(&mut self) {
        let now = self.clock.now();
        for fd in self.sessions.sockets() {
            self.schedule_close(fd, now);
        }
        self.reap(now);
        self.flush_forwards();
        if let Some(dispatcher) = self.dispatcher.as_mut() {
            dispatcher.shutdown();
        }
        *self.shared_stats.lock() = self.snapshot();
        info!("[STATS] shutdown: {}", self.snapshot());
    }

    // ========================================================================
    // Events
    // ========================================================================

    fn handle_event(&mut self, event: &Event, now: Instant) {
        match event.token() {
            LISTENER => self.accept_connections(now),
            UDP => self.receive_datagrams(),
            token => {
                let fd = (token.0 - TOKEN_OFFSET) as RawFd;
                match self.sessions.get_by_socket(fd) {
                    Some(record) if !record.state().is_closing() => {}
                    _ => return,
                }

                let mut result = Ok(());
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    result = self.service(fd, now);
                }
                if result.is_ok() && event.is_writable() {
                    result = self.flush(fd, now);
                }
                if let Err(err) = result {
                    self.fail(fd, err, now);
                }
            }
        }
    }

    fn accept_connections(&mut self, now: Instant) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit_connection(stream, peer, now),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.stats.connections_refused += 1;
                    error!("[ACCEPT] accept failed: {}", err);
                    break;
                }
            }
        }
    }

    fn admit_connection(&mut self, mut stream: TcpStream, peer: SocketAddr, now: Instant) {
        let fd = stream.as_raw_fd();
        let local = match stream.local_addr() {
            Ok(local) => local,
            Err(err) => {
                self.stats.connections_refused += 1;
                warn!("[ACCEPT] dropping {}: {}", peer, err);
                return;
            }
        };
        let Some(block) = self.pool.alloc() else {
            self.stats.connections_refused += 1;
            warn!("[ACCEPT] buffer pool exhausted, refusing {}", peer);
            return;
        };
        let created_unix = self.clock.unix_secs();
        let index = match self.sessions.create_session(
            fd,
            peer,
            local,
            Protocol::Unknown,
            now,
            created_unix,
        ) {
            Ok(index) => index,
            Err(err) => {
                self.pool.free(block);
                self.stats.connections_refused += 1;
                warn!("[ACCEPT] refusing {}: {}", peer, err);
                return;
            }
        };
        let registry = self.poll.registry();
        if let Err(err) = registry.register(&mut stream, token_of(fd), Interest::READABLE) {
            self.sessions.remove(fd);
            self.pool.free(block);
            self.stats.connections_refused += 1;
            warn!("[ACCEPT] could not register {}: {}", peer, err);
            return;
        }

        let Some(record) = self.sessions.get_mut(index) else { return };
        record.attach_buffers(block);
        let ready = record
            .transition(SocketState::Listening, now)
            .and_then(|()| record.transition(SocketState::Connected, now));
        let id = record.id();
        self.streams.insert(fd, stream);
        self.stats.connections_accepted += 1;
        if let Err(err) = ready {
            self.fail(fd, err, now);
            return;
        }

        info!("[ACCEPT] connection {} from {} (fd {})", id, peer, fd);
        publish(&self.event_sender, GatewayEvent::Connected { id, peer });
    }

    // ========================================================================
    // TCP read path
    // ========================================================================

    /// Reads what the socket has, then frames and dispatches buffered input.
    fn service(&mut self, fd: RawFd, now: Instant) -> Result<()> {
        self.backlog.remove(&fd);
        if let Some(record) = self.sessions.get_by_socket_mut(fd) {
            if record.state() != SocketState::Throttled {
                record.transition(SocketState::Reading, now)?;
            }
        }

        loop {
            let fill = self.fill(fd, now)?;
            self.process_input(fd, now)?;
            match fill {
                Fill::Drained => break,
                Fill::Eof => {
                    self.flush(fd, now)?;
                    return Err(ErrorKind::ConnectionLost);
                }
                Fill::Full => {
                    let still_full =
                        self.sessions.get_by_socket(fd).map_or(true, |record| record.read_full());
                    if still_full || self.backlog.contains(&fd) {
                        self.backlog.insert(fd);
                        break;
                    }
                }
            }
        }
        self.flush(fd, now)
    }

    fn fill(&mut self, fd: RawFd, now: Instant) -> Result<Fill> {
        let Self { sessions, pool, streams, stats, .. } = self;
        let record =
            sessions.get_by_socket_mut(fd).ok_or(ErrorKind::Internal("no session for socket"))?;
        let stream = streams.get_mut(&fd).ok_or(ErrorKind::Internal("no stream for socket"))?;
        let (read, _) = record.split_buffers(pool)?;

        let mut total = 0;
        let fill = loop {
            if record.read_full() {
                break Fill::Full;
            }
            match stream.read(&mut read[record.read_pos()..record.read_capacity()]) {
                Ok(0) => break Fill::Eof,
                Ok(n) => {
                    record.advance_read(n);
                    stats.bytes_read += n as u64;
                    total += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Fill::Drained,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        };
        if total > 0 {
            record.touch(now);
            trace!(
                "[READ] {} bytes from connection {} ({} buffered)",
                total,
                record.id(),
                record.read_pos()
            );
        }
        Ok(fill)
    }

    fn process_input(&mut self, fd: RawFd, now: Instant) -> Result<()> {
        if !self.classify(fd, now)? {
            return Ok(());
        }
        loop {
            match self.step(fd, now)? {
                Step::Again => continue,
                Step::Idle => return Ok(()),
                Step::Blocked => {
                    self.backlog.insert(fd);
                    return Ok(());
                }
            }
        }
    }

    /// Returns true once the connection has a protocol.
    fn classify(&mut self, fd: RawFd, now: Instant) -> Result<bool> {
        let max_attempts = self.config.max_detection_attempts;
        let Self { sessions, pool, cache, detector, stats, .. } = self;
        let record =
            sessions.get_by_socket_mut(fd).ok_or(ErrorKind::Internal("no session for socket"))?;
        if record.protocol() != Protocol::Unknown {
            return Ok(true);
        }

        let key = (record.peer(), record.local());
        let cached = cache.as_mut().and_then(|cache| cache.lookup(key, now));
        let (protocol, confidence) = match cached {
            Some(hit) => {
                stats.cache_hits += 1;
                debug!("[DETECTION] cache hit for {}: {}", record.peer(), hit.protocol);
                (hit.protocol, 100)
            }
            None => {
                if record.read_pos() < MIN_DETECT_LEN {
                    return Ok(false);
                }
                let (read, _) = record.split_buffers(pool)?;
                let detection = detector.detect(&read[..record.read_pos()], Transport::Tcp);
                record.detection_attempts += 1;
                record.last_detection = Some(now);

                if !detection.is_known() {
                    stats.detection_failures += 1;
                    if record.detection_attempts >= max_attempts || record.read_full() {
                        return Err(ErrorKind::ProtocolError("unrecognised protocol"));
                    }
                    debug!(
                        "[DETECTION] connection {}: {} bytes not recognised (attempt {})",
                        record.id(),
                        record.read_pos(),
                        record.detection_attempts
                    );
                    return Ok(false);
                }
                if let Some(cache) = cache.as_mut() {
                    cache.insert(key, detection, now);
                }
                stats.record_detection(detection.protocol, detection.confidence);
                (detection.protocol, detection.confidence)
            }
        };

        let id = record.id();
        sessions.update_protocol(fd, protocol, confidence)?;
        info!(
            "[DETECTION] connection {} classified as {} (confidence {})",
            id, protocol, confidence
        );
        publish(&self.event_sender, GatewayEvent::Classified { id, protocol, confidence });
        Ok(true)
    }

    /// Admits and handles the next complete frame at the front of the read buffer.
    fn step(&mut self, fd: RawFd, now: Instant) -> Result<Step> {
        let Self {
            sessions,
            pool,
            pal,
            stats,
            throughput,
            event_sender,
            pending_forwards,
            drain_then_close,
            ..
        } = self;
        let record =
            sessions.get_by_socket_mut(fd).ok_or(ErrorKind::Internal("no session for socket"))?;
        if record.read_pos() == 0 || record.state().is_closing() || drain_then_close.contains(&fd)
        {
            return Ok(Step::Idle);
        }
        if record.state() == SocketState::Throttled && !record.congestion.rate_window_elapsed(now) {
            return Ok(Step::Blocked);
        }

        let protocol = record.protocol();
        let buffered = record.read_pos();
        let (read, write) = record.split_buffers(pool)?;
        let Some(len) = handlers::next_frame(protocol, &read[..buffered], record.read_capacity())?
        else {
            return Ok(Step::Idle);
        };
        // Leave the frame buffered until earlier output drains enough for its reply
        let headroom = handlers::max_reply_len(protocol, len);
        if record.has_pending_write() && record.write_space() < headroom {
            return Ok(Step::Blocked);
        }

        let admission = record.congestion.admit(now);
        if !admission.is_accepted() {
            if admission.is_drop() {
                stats.messages_dropped += 1;
                if record.state() != SocketState::Throttled {
                    record.transition(SocketState::Throttled, now)?;
                    stats.throttle_events += 1;
                    warn!(
                        "[CONGESTION] throttling connection {} ({}): {:?}, window {}",
                        record.id(),
                        record.peer(),
                        admission,
                        record.congestion.window()
                    );
                    let event = GatewayEvent::Throttled { id: record.id(), peer: record.peer() };
                    publish(event_sender, event);
                }
            }
            return Ok(Step::Blocked);
        }
        if record.state() == SocketState::Throttled {
            record.transition(SocketState::Reading, now)?;
            info!(
                "[CONGESTION] connection {} resumed, window {}",
                record.id(),
                record.congestion.window()
            );
        }
        stats.messages_admitted += 1;
        throughput.record(1, now);

        let result = handlers::handle(record, &read[..len], &mut HandlerContext { pal: &mut *pal });
        read.copy_within(len..buffered, 0);
        record.consume_read(len);

        let actions = match result {
            Ok(actions) => {
                record.congestion.on_success();
                record.counters.messages += 1;
                actions
            }
            Err(err) => {
                record.congestion.release();
                record.congestion.on_failure();
                record.counters.errors += 1;
                if err.closes_connection() {
                    return Err(err);
                }
                stats.protocol_errors += 1;
                debug!("[{}] dropped {} byte frame from {}: {}", protocol, len, record.peer(), err);
                return Ok(Step::Again);
            }
        };

        for action in actions {
            match action {
                Action::Reply(bytes) => {
                    let start = record.bytes_to_write();
                    let available = record.write_capacity() - start;
                    if bytes.len() > available {
                        warn!(
                            "[WRITE] {} byte reply does not fit connection {}",
                            bytes.len(),
                            record.id()
                        );
                        return Err(ErrorKind::BufferOverflow { needed: bytes.len(), available });
                    }
                    write[start..start + bytes.len()].copy_from_slice(&bytes);
                    record.queue_write(bytes.len());
                }
                Action::Forward(message) => pending_forwards.push(message),
                Action::Close => {
                    drain_then_close.insert(fd);
                }
            }
        }
        Ok(Step::Again)
    }

    // ========================================================================
    // TCP write path
    // ========================================================================

    /// Writes pending output and keeps write interest in line with what is left.
    fn flush(&mut self, fd: RawFd, now: Instant) -> Result<()> {
        let Self { sessions, pool, streams, poll, stats, .. } = self;
        let record =
            sessions.get_by_socket_mut(fd).ok_or(ErrorKind::Internal("no session for socket"))?;
        if record.state().is_closing() {
            return Ok(());
        }
        let stream = streams.get_mut(&fd).ok_or(ErrorKind::Internal("no stream for socket"))?;

        if record.has_pending_write() {
            let (_, write) = record.split_buffers(pool)?;
            while record.has_pending_write() {
                match stream.write(&write[record.write_pos()..record.bytes_to_write()]) {
                    Ok(0) => return Err(ErrorKind::ConnectionLost),
                    Ok(n) => {
                        record.advance_write(n);
                        stats.bytes_written += n as u64;
                        trace!("[WRITE] {} bytes to connection {}", n, record.id());
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        }

        let pending = record.has_pending_write();
        if pending != record.write_armed {
            let interest =
                if pending { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
            poll.registry().reregister(stream, token_of(fd), interest)?;
            record.write_armed = pending;
        }
        let next = if pending { SocketState::Writing } else { SocketState::Connected };
        if matches!(record.state(), SocketState::Reading | SocketState::Writing)
            && record.state() != next
        {
            record.transition(next, now)?;
        }

        if !pending && self.drain_then_close.contains(&fd) {
            debug!("[WRITE] output drained on fd {}, closing", fd);
            self.schedule_close(fd, now);
        }
        Ok(())
    }

    // ========================================================================
    // UDP
    // ========================================================================

    fn receive_datagrams(&mut self) {
        loop {
            match self.udp.recv_from(&mut self.datagram) {
                Ok((len, peer)) => {
                    self.stats.udp_datagrams += 1;
                    self.handle_datagram(len, peer);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("[UDP] receive failed: {}", err);
                    break;
                }
            }
        }
    }

    fn handle_datagram(&mut self, len: usize, peer: SocketAddr) {
        let Self { udp, datagram, detector, pal, stats, pending_forwards, .. } = self;
        let bytes = &datagram[..len];
        let detection = detector.detect_fast(bytes, Transport::Udp);

        let supported = matches!(
            detection.protocol,
            Protocol::Dns | Protocol::Coap | Protocol::Tls | Protocol::Quic
        );
        if !supported {
            stats.protocol_errors += 1;
            debug!(
                "[UDP] unsupported {} byte datagram from {} ({})",
                len, peer, detection.protocol
            );
            if let Err(err) = udp.send_to(UNSUPPORTED_UDP_REPLY, peer) {
                warn!("[UDP] reply to {} failed: {}", peer, err);
            }
            return;
        }

        stats.record_detection(detection.protocol, detection.confidence);
        let mut ctx = HandlerContext { pal: &mut *pal };
        match handlers::handle_datagram(detection.protocol, bytes, &mut ctx) {
            Ok(actions) => {
                for action in actions {
                    match action {
                        Action::Reply(reply) => {
                            if let Err(err) = udp.send_to(&reply, peer) {
                                warn!("[UDP] reply to {} failed: {}", peer, err);
                            }
                        }
                        Action::Forward(mut message) => {
                            message.source.get_or_insert_with(|| peer.to_string());
                            pending_forwards.push(message);
                        }
                        Action::Close => {}
                    }
                }
            }
            Err(err) => {
                stats.protocol_errors += 1;
                debug!("[{}] dropped datagram from {}: {}", detection.protocol, peer, err);
            }
        }
    }

    // ========================================================================
    // Hand-off, timers and teardown
    // ========================================================================

    fn flush_forwards(&mut self) {
        for message in self.pending_forwards.drain(..) {
            let delivered = match &self.dispatcher {
                Some(dispatcher) => dispatcher.submit(message).is_ok(),
                None => publish(&self.event_sender, GatewayEvent::Message(message)),
            };
            if delivered {
                self.stats.messages_forwarded += 1;
            } else {
                self.stats.forward_dropped += 1;
                debug!("[DISPATCH] queue full, message dropped");
            }
        }
    }

    fn retry_backlog(&mut self, now: Instant) {
        if self.backlog.is_empty() {
            return;
        }
        let waiting: Vec<RawFd> = self.backlog.iter().copied().collect();
        for fd in waiting {
            let ready = match self.sessions.get_by_socket(fd) {
                Some(record) if !record.state().is_closing() => {
                    record.state() != SocketState::Throttled
                        || record.congestion.rate_window_elapsed(now)
                }
                _ => {
                    self.backlog.remove(&fd);
                    continue;
                }
            };
            if ready {
                if let Err(err) = self.service(fd, now) {
                    self.fail(fd, err, now);
                }
            }
        }
    }

    fn run_timers(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_cleanup) >= self.config.cleanup_interval {
            self.last_cleanup = now;
            self.cleanup(now);
        }
        if now.saturating_duration_since(self.last_stats) >= self.config.stats_interval {
            self.last_stats = now;
            self.dump_stats(now);
        }
    }

    /// Closes idle sessions, lifts stale throttles and purges the detection cache.
    fn cleanup(&mut self, now: Instant) {
        let idle_timeout = self.config.idle_timeout;
        let throttle_reset = self.config.throttle_reset_timeout;

        let mut stale = Vec::new();
        let mut resumed = Vec::new();
        for record in self.sessions.iter_mut() {
            if !record.state().is_open() {
                continue;
            }
            let idle = now.saturating_duration_since(record.last_activity());
            if idle > idle_timeout {
                stale.push((record.socket(), idle));
            } else if record.state() == SocketState::Throttled && idle > throttle_reset {
                record.congestion.reset_rate(now);
                if record.transition(SocketState::Connected, now).is_ok() {
                    resumed.push(record.socket());
                }
            }
        }

        for &(fd, idle) in &stale {
            self.stats.stale_closes += 1;
            info!("[CLEANUP] closing fd {} after {:?} idle", fd, idle);
            self.schedule_close(fd, now);
        }
        for &fd in &resumed {
            debug!("[CONGESTION] throttle lifted on fd {}", fd);
            self.backlog.insert(fd);
        }
        let purged = self.cache.as_mut().map_or(0, |cache| cache.purge(now));
        debug!(
            "[CLEANUP] sweep: {} idle, {} unthrottled, {} cache entries purged",
            stale.len(),
            resumed.len(),
            purged
        );
    }

    fn dump_stats(&mut self, now: Instant) {
        self.throughput.roll(now);
        let snapshot = self.snapshot();
        info!("[STATS] {}", snapshot);
        let per_protocol: Vec<String> = Protocol::ALL
            .iter()
            .map(|protocol| {
                format!("{}={}", protocol, snapshot.sessions_by_protocol[protocol.index()])
            })
            .collect();
        info!(
            "[STATS] sessions by protocol: {} UNKNOWN={}",
            per_protocol.join(" "),
            snapshot.sessions_by_protocol[Protocol::Unknown.index()]
        );
        info!(
            "[STATS] buckets by occupancy (0,1,2,3,4+): {:?}, throttle events {}, drops {}",
            snapshot.bucket_histogram,
            snapshot.stats.throttle_events,
            snapshot.stats.messages_dropped
        );
        *self.shared_stats.lock() = snapshot;
    }

    /// Logs and counts `err`, then schedules the connection for close.
    fn fail(&mut self, fd: RawFd, err: ErrorKind, now: Instant) {
        match &err {
            ErrorKind::ConnectionLost => debug!("[READ] fd {} closed by peer", fd),
            ErrorKind::IoError(_) | ErrorKind::Timeout => debug!("[READ] fd {}: {}", fd, err),
            ErrorKind::Internal(_) => {
                self.stats.internal_errors += 1;
                error!("[STATE] fd {}: {}", fd, err);
            }
            _ => {
                self.stats.protocol_errors += 1;
                warn!("[READ] closing fd {}: {}", fd, err);
            }
        }
        self.schedule_close(fd, now);
    }

    fn schedule_close(&mut self, fd: RawFd, now: Instant) {
        let Some(record) = self.sessions.get_by_socket_mut(fd) else { return };
        if record.state().is_closing() {
            return;
        }
        if record.transition(SocketState::Closing, now).is_err() {
            self.stats.internal_errors += 1;
        }
        self.closing.push(fd);
    }

    /// Releases every connection scheduled for close.
    fn reap(&mut self, now: Instant) {
        for fd in mem::take(&mut self.closing) {
            self.backlog.remove(&fd);
            self.drain_then_close.remove(&fd);
            if let Some(mut stream) = self.streams.remove(&fd) {
                if let Err(err) = self.poll.registry().deregister(&mut stream) {
                    debug!("[CLEANUP] deregistering fd {}: {}", fd, err);
                }
            }

            if let Some(record) = self.sessions.get_by_socket_mut(fd) {
                if record.state() == SocketState::Closing {
                    let released = record
                        .transition(SocketState::Closed, now)
                        .and_then(|()| record.transition(SocketState::Free, now));
                    if released.is_err() {
                        self.stats.internal_errors += 1;
                    }
                }
            }
            let Some(mut record) = self.sessions.remove(fd) else { continue };
            if let Some(block) = record.take_buffers() {
                if !self.pool.free(block) {
                    self.stats.internal_errors += 1;
                    error!("[CLEANUP] fd {} returned a block the pool does not own", fd);
                }
            }

            self.stats.connections_closed += 1;
            self.stats.invalid_transitions += u64::from(record.invalid_transitions());
            info!(
                "[CLEANUP] closed connection {} ({}, {}): {} bytes in, {} bytes out",
                record.id(),
                record.peer(),
                record.protocol(),
                record.counters.bytes_read,
                record.counters.bytes_written
            );
            let event = GatewayEvent::Disconnected { id: record.id(), peer: record.peer() };
            publish(&self.event_sender, event);
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if !self.sessions.is_empty() {
            self.shutdown();
        }
    }
}
