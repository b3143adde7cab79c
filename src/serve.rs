//! Purpose: Serve the shared command log over TCP, one worker thread per peer.
//! Exports: `ServeConfig`, `Server`, `ShutdownHandle`, `DEFAULT_PORT`.
//! Role: Accept loop, worker registry, periodic timestamp writer, shutdown.
//! Invariants: Every command-log access happens under the one shared lock.
//! Invariants: A peer failure kills only its own worker; a lock failure is
//! fatal to the whole process because consistency can no longer be shown.
//! Notes: Reads poll with a short timeout so blocked workers observe shutdown.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;
use tracing::{debug, error, info, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::log::{CommandLog, DEFAULT_CAPACITY};
use crate::core::record::{DELIMITER, PendingRecord, Record};
use crate::protocol::{self, Inbound};

pub const DEFAULT_PORT: u16 = 9000;

const READ_CHUNK: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct ServeConfig {
    /// Listening port; 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Command log slot count; must be nonzero.
    pub capacity: usize,
    /// When set, a timestamp record is appended at this interval.
    pub timestamp_interval: Option<Duration>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            capacity: DEFAULT_CAPACITY,
            timestamp_interval: None,
        }
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if config.capacity == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--capacity must be greater than zero")
            .with_hint("Use a positive slot count like 10."));
    }
    if let Some(interval) = config.timestamp_interval {
        if interval.is_zero() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("timestamp interval must be greater than zero")
                .with_hint("Omit the flag to disable timestamp records."));
        }
    }
    Ok(())
}

/// Requests server shutdown from any thread: raises the flag and unblocks
/// the accept loop. Safe to call more than once.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    listener: Arc<TcpListener>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if self.flag.swap(true, Ordering::SeqCst) {
            return;
        }
        // A listening socket has no std-level shutdown, so unblock the
        // accept loop through the raw fd.
        unsafe {
            libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct Server {
    listener: Arc<TcpListener>,
    log: Arc<Mutex<CommandLog>>,
    shutdown: Arc<AtomicBool>,
    fatal: Arc<Mutex<Option<Error>>>,
    timestamp_interval: Option<Duration>,
}

impl Server {
    /// Binds the listening socket and builds the shared command log. The
    /// returned server owns both until `run` tears them down.
    pub fn bind(config: ServeConfig) -> Result<Self, Error> {
        validate_config(&config)?;
        let listener =
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port)).map_err(|err| {
                Error::new(bind_error_kind(&err))
                    .with_message(format!("failed to bind port {}", config.port))
                    .with_source(err)
            })?;
        Ok(Self {
            listener: Arc::new(listener),
            log: Arc::new(Mutex::new(CommandLog::new(config.capacity))),
            shutdown: Arc::new(AtomicBool::new(false)),
            fatal: Arc::new(Mutex::new(None)),
            timestamp_interval: config.timestamp_interval,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener.local_addr().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read listener address")
                .with_source(err)
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            listener: Arc::clone(&self.listener),
        }
    }

    /// Accepts peers until shutdown, then joins every worker. Returns the
    /// first fatal error a worker recorded, if any.
    pub fn run(self) -> Result<(), Error> {
        let handle = self.shutdown_handle();
        info!(addr = %self.local_addr()?, "listening");

        let timestamp_worker = self.timestamp_interval.map(|interval| {
            spawn_timestamp_worker(
                interval,
                Arc::clone(&self.log),
                handle.clone(),
                Arc::clone(&self.fatal),
            )
        });

        let mut workers: Vec<Worker> = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    workers.push(Worker::spawn(
                        stream,
                        peer,
                        Arc::clone(&self.log),
                        handle.clone(),
                        Arc::clone(&self.fatal),
                    ));
                    reap_finished(&mut workers);
                }
                Err(_) if handle.is_shutdown() => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(%err, "accept failed");
                    continue;
                }
            }
        }

        info!("shutting down");
        if let Some(worker) = timestamp_worker {
            if worker.join().is_err() {
                error!("timestamp worker panicked");
            }
        }
        for worker in workers.drain(..) {
            worker.join();
        }

        match self.fatal.lock() {
            Ok(mut slot) => match slot.take() {
                Some(err) => Err(err),
                None => Ok(()),
            },
            Err(_) => Err(Error::new(ErrorKind::Internal).with_message("fatal-error slot poisoned")),
        }
    }
}

fn bind_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::AddrInUse => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

/// One connection worker: its join handle plus a completion flag the accept
/// loop polls to reap finished workers without blocking.
struct Worker {
    handle: JoinHandle<()>,
    peer: SocketAddr,
    done: Arc<AtomicBool>,
}

impl Worker {
    fn spawn(
        stream: TcpStream,
        peer: SocketAddr,
        log: Arc<Mutex<CommandLog>>,
        shutdown: ShutdownHandle,
        fatal: Arc<Mutex<Option<Error>>>,
    ) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let done_flag = Arc::clone(&done);
        let handle = thread::spawn(move || {
            if let Err(err) = handle_connection(stream, peer, &log, &shutdown) {
                if err.kind() == ErrorKind::Internal {
                    error!(%peer, %err, "fatal failure on connection worker");
                    record_fatal(&fatal, err);
                    shutdown.shutdown();
                } else {
                    warn!(%peer, %err, "connection failed");
                }
            }
            done_flag.store(true, Ordering::SeqCst);
        });
        Self { handle, peer, done }
    }

    fn is_finished(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn join(self) {
        if self.handle.join().is_err() {
            error!(peer = %self.peer, "connection worker panicked");
        }
    }
}

fn reap_finished(workers: &mut Vec<Worker>) {
    let mut index = 0;
    while index < workers.len() {
        if workers[index].is_finished() {
            workers.swap_remove(index).join();
        } else {
            index += 1;
        }
    }
}

fn record_fatal(slot: &Mutex<Option<Error>>, err: Error) {
    if let Ok(mut fatal) = slot.lock() {
        fatal.get_or_insert(err);
    }
}

fn lock_log<'a>(log: &'a Mutex<CommandLog>) -> Result<MutexGuard<'a, CommandLog>, Error> {
    log.lock()
        .map_err(|_| Error::new(ErrorKind::Internal).with_message("command log lock poisoned"))
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    pending: PendingRecord,
    /// Global byte offset the next replay starts from; 0 means the full log.
    cursor: usize,
}

fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    log: &Mutex<CommandLog>,
    shutdown: &ShutdownHandle,
) -> Result<(), Error> {
    info!(%peer, "accepted connection");
    stream
        .set_read_timeout(Some(POLL_INTERVAL))
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to set read timeout")
                .with_peer(peer)
                .with_source(err)
        })?;

    let mut conn = Connection {
        stream,
        peer,
        pending: PendingRecord::new(),
        cursor: 0,
    };
    let mut chunk = [0u8; READ_CHUNK];

    while !shutdown.is_shutdown() {
        let read = match conn.stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("peer read failed")
                    .with_peer(peer)
                    .with_source(err));
            }
        };
        conn.pending.push_bytes(&chunk[..read]);
        while let Some(record) = conn.pending.next_complete() {
            process_record(&mut conn, record, log)?;
        }
    }

    info!(%peer, "closed connection");
    Ok(())
}

fn process_record(
    conn: &mut Connection,
    record: Record,
    log: &Mutex<CommandLog>,
) -> Result<(), Error> {
    match protocol::classify_record(&record) {
        Ok(Inbound::Seek(seek)) => {
            let guard = lock_log(log)?;
            match guard.offset_for_command(seek.command_index, seek.intra_offset) {
                Some(offset) => {
                    debug!(peer = %conn.peer, offset, "seek repositioned read cursor");
                    conn.cursor = offset;
                }
                None => warn!(
                    peer = %conn.peer,
                    command_index = seek.command_index,
                    intra_offset = seek.intra_offset,
                    "seek request out of range"
                ),
            }
            Ok(())
        }
        Ok(Inbound::Data) => {
            // Snapshot under the lock so the replay observes a prefix of
            // completed appends; stream it after release.
            let reply = {
                let mut guard = lock_log(log)?;
                if let Some(evicted) = guard.add_entry(record) {
                    debug!(bytes = evicted.len(), "evicted oldest record");
                }
                replay_from(&guard, conn.cursor)
            };
            conn.cursor = 0;
            conn.stream.write_all(&reply).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("peer write failed")
                    .with_peer(conn.peer)
                    .with_source(err)
            })?;
            Ok(())
        }
        Err(err) => {
            // Malformed seek: no append, no replay, cursor unchanged.
            warn!(peer = %conn.peer, %err, "rejected malformed seek request");
            Ok(())
        }
    }
}

/// Log contents from the global byte offset `cursor` to the end, oldest to
/// newest, as one contiguous byte run.
fn replay_from(log: &CommandLog, cursor: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut offset = cursor;
    while let Some((record, intra)) = log.find_entry_for_offset(offset) {
        out.extend_from_slice(&record.as_bytes()[intra..]);
        offset += record.len() - intra;
    }
    out
}

fn spawn_timestamp_worker(
    interval: Duration,
    log: Arc<Mutex<CommandLog>>,
    shutdown: ShutdownHandle,
    fatal: Arc<Mutex<Option<Error>>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut next_tick = Instant::now() + interval;
        while !shutdown.is_shutdown() {
            // Sleep in short ticks so shutdown stays responsive.
            let now = Instant::now();
            if now < next_tick {
                thread::sleep(POLL_INTERVAL.min(next_tick - now));
                continue;
            }
            next_tick += interval;

            match timestamp_record() {
                Ok(record) => match lock_log(&log) {
                    Ok(mut guard) => {
                        debug!(bytes = record.len(), "appended timestamp record");
                        guard.add_entry(record);
                    }
                    Err(err) => {
                        error!(%err, "fatal failure on timestamp worker");
                        record_fatal(&fatal, err);
                        shutdown.shutdown();
                        return;
                    }
                },
                Err(err) => warn!(%err, "failed to format timestamp"),
            }
        }
    })
}

fn timestamp_record() -> Result<Record, Error> {
    let formatted = OffsetDateTime::now_utc().format(&Rfc2822).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to format timestamp")
            .with_source(err)
    })?;
    let mut bytes = format!("timestamp:{formatted}").into_bytes();
    bytes.push(DELIMITER);
    Ok(Record::new(bytes))
}
