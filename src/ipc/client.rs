//! RPC client for JSON-RPC communication with the worker process.
//!
//! [`RpcClient`] owns the worker for the lifetime of a connection. Two
//! background tasks serve it: a writer task that drains queued lines into
//! the worker's stdin, and a reader task that decodes the worker's stdout and
//! routes each response to the caller waiting on its id. Any number of
//! callers may have requests in flight at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::ipc::error::IpcError;
use crate::ipc::framing::{write_line, LineFramer};
use crate::ipc::pending::{Outcome, PendingGuard, PendingTable};
use crate::ipc::protocol::{Incoming, NotificationEnvelope, RequestEnvelope};
use crate::ipc::worker::{drain_stderr, shutdown_worker, spawn_worker};

/// Size of each read from the worker's stdout.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Lines queued for the writer task before senders have to wait.
const OUTBOX_CAPACITY: usize = 32;

/// Method name of the handshake request.
pub const INITIALIZE_METHOD: &str = "initialize";

/// Notification sent once the handshake has succeeded.
pub const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";

/// Lifecycle of the connection to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No worker has been started yet.
    Disconnected,
    /// Worker spawned, handshake in progress.
    Connecting,
    /// Handshake done; requests may be issued.
    Ready,
    /// Worker exited or was disconnected. A new `connect()` is required.
    Closed,
}

/// State shared between a connection and its background tasks.
#[derive(Debug)]
struct Shared {
    pending: PendingTable,
    state: Mutex<ConnectionState>,
    /// Feeds the writer task. Taken on close, which ends the task.
    outbox: Mutex<Option<mpsc::Sender<String>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    shutdown_grace: Duration,
}

impl Shared {
    fn new(outbox: mpsc::Sender<String>, child: Option<Child>, shutdown_grace: Duration) -> Self {
        Self {
            pending: PendingTable::new(),
            state: Mutex::new(ConnectionState::Connecting),
            outbox: Mutex::new(Some(outbox)),
            child: tokio::sync::Mutex::new(child),
            shutdown_grace,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    fn outbox(&self) -> Result<mpsc::Sender<String>, IpcError> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(IpcError::ConnectionClosed)
    }

    /// Move from `Connecting` to `Ready`. Fails if the connection already closed.
    fn mark_ready(&self) -> bool {
        let mut state = self.lock_state();
        if *state != ConnectionState::Connecting {
            return false;
        }
        *state = ConnectionState::Ready;
        true
    }

    /// Enter the terminal state, stop accepting writes and fail everything
    /// still pending.
    fn mark_closed(&self) -> usize {
        *self.lock_state() = ConnectionState::Closed;
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.pending.close_all()
    }

    /// Wait up to `grace` for the worker to exit, then kill it.
    async fn reap_worker(&self, grace: Duration) {
        let child = self.child.lock().await.take();
        if let Some(child) = child {
            shutdown_worker(child, grace).await;
        }
    }
}

/// One live connection: the tasks serving the worker's pipes.
struct Connection {
    shared: Arc<Shared>,
    /// Held while a line is queued, so ids reach the worker in order.
    send_order: tokio::sync::Mutex<()>,
    pid: Option<u32>,
    reader_task: JoinHandle<()>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    stderr_task: Option<JoinHandle<()>>,
    capabilities: OnceLock<Value>,
}

impl Connection {
    fn open<R, W>(
        reader: R,
        writer: W,
        child: Option<Child>,
        stderr_task: Option<JoinHandle<()>>,
        shutdown_grace: Duration,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pid = child.as_ref().and_then(Child::id);
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let shared = Arc::new(Shared::new(tx, child, shutdown_grace));

        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&shared)));
        let writer_task = tokio::spawn(write_loop(writer, rx, Arc::clone(&shared)));

        Self {
            shared,
            send_order: tokio::sync::Mutex::new(()),
            pid,
            reader_task,
            writer_task: Mutex::new(Some(writer_task)),
            stderr_task,
            capabilities: OnceLock::new(),
        }
    }

    fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn take_writer_task(&self) -> Option<JoinHandle<()>> {
        self.writer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Tear the connection down and reap the worker.
    ///
    /// Returns how many pending requests were failed.
    async fn close(&self) -> usize {
        let failed = self.shared.mark_closed();
        self.reader_task.abort();

        // With the outbox gone the writer flushes what is queued and drops
        // the worker's stdin. A worker that stopped reading never lets the
        // flush finish, so the writer is abandoned and the worker killed.
        let mut grace = self.shared.shutdown_grace;
        if let Some(task) = self.take_writer_task() {
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("Worker stopped reading its input; dropping queued writes");
                abort.abort();
                grace = Duration::ZERO;
            }
        }

        self.shared.reap_worker(grace).await;

        if let Some(task) = &self.stderr_task {
            task.abort();
        }

        failed
    }

    /// Queue a request line and register it as pending.
    ///
    /// Waits for room in the outbox; callers bound this with their deadline.
    async fn enqueue_request(
        &self,
        next_id: &AtomicU64,
        method: &str,
        params: &Value,
        deadline: Instant,
    ) -> Result<(PendingGuard<'_>, oneshot::Receiver<Outcome>), IpcError> {
        let outbox = self.shared.outbox()?;
        let _order = self.send_order.lock().await;
        let permit = outbox
            .reserve()
            .await
            .map_err(|_| IpcError::ConnectionClosed)?;

        let id = next_id.fetch_add(1, Ordering::SeqCst);
        let line = RequestEnvelope::new(method, params, id).to_line()?;
        let rx = self
            .shared
            .pending
            .register(id, method, deadline.into_std())?;
        let guard = PendingGuard::new(&self.shared.pending, id);

        debug!(id, method, "-> request");
        permit.send(line);
        Ok((guard, rx))
    }

    async fn send_notification(
        &self,
        method: &str,
        params: Option<&Value>,
        timeout: Duration,
    ) -> Result<(), IpcError> {
        let line = NotificationEnvelope::new(method, params).to_line()?;
        let outbox = self.shared.outbox()?;

        let queue = async {
            let _order = self.send_order.lock().await;
            debug!(method, "-> notification");
            outbox
                .send(line)
                .await
                .map_err(|_| IpcError::ConnectionClosed)
        };

        tokio::time::timeout(timeout, queue)
            .await
            .map_err(|_| IpcError::Timeout(timeout))?
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
        if let Some(task) = self.take_writer_task() {
            task.abort();
        }
        if let Some(task) = &self.stderr_task {
            task.abort();
        }
        self.shared.mark_closed();
        // The child, if any, is killed when dropped.
    }
}

/// Write queued lines to the worker until the outbox closes.
///
/// Returning drops `writer`, which closes the worker's stdin.
async fn write_loop<W>(mut writer: W, mut outbox: mpsc::Receiver<String>, shared: Arc<Shared>)
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(line) = outbox.recv().await {
        if let Err(e) = write_line(&mut writer, &line).await {
            error!("Failed to write to worker: {}", e);
            let failed = shared.mark_closed();
            if failed > 0 {
                warn!("{} pending request(s) failed after write error", failed);
            }
            return;
        }
    }
    debug!("Closing worker stdin");
}

/// Read the worker's stdout until it closes, routing every line.
///
/// Once the stream ends the connection is closed and the worker reaped.
async fn read_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin + Send,
{
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Worker stdout closed");
                break;
            }
            Ok(n) => {
                for line in framer.feed(&buf[..n]) {
                    route_line(&shared.pending, &line);
                }
            }
            Err(e) => {
                error!("Failed to read from worker: {}", e);
                break;
            }
        }
    }

    if let Some(line) = framer.finish() {
        route_line(&shared.pending, &line);
    }

    let failed = shared.mark_closed();
    if failed > 0 {
        warn!("Worker connection closed with {} request(s) pending", failed);
    } else {
        info!("Worker connection closed");
    }

    shared.reap_worker(shared.shutdown_grace).await;
}

/// Decode one line and hand it to the matching pending request.
fn route_line(pending: &PendingTable, line: &str) {
    let envelope = match Incoming::decode(line) {
        Ok(Incoming::Response(envelope)) => envelope,
        Ok(Incoming::WorkerMessage { method, id }) => {
            debug!(?id, method = %method, "Ignoring worker-initiated message");
            return;
        }
        Err(e) => {
            warn!("Skipping undecodable worker line: {}", e);
            return;
        }
    };

    let Some(id) = envelope.id else {
        warn!("Discarding response without id: {:?}", envelope.error);
        return;
    };

    if !pending.resolve(id, envelope.into_outcome()) {
        debug!(id, "Discarding orphaned response");
    }
}

/// What the client currently holds.
enum Slot {
    Idle,
    Active(Arc<Connection>),
    Closed,
}

/// JSON-RPC client for a worker process spoken to over stdio.
///
/// Methods take `&self`, so one client can be shared (for example behind an
/// `Arc`) by any number of concurrent callers.
///
/// # Connection Lifecycle
///
/// - `connect()` - Spawn the worker and perform the `initialize` handshake
/// - `call()` - Send a request and wait for its response (with timeout)
/// - `disconnect()` - Stop the worker and fail whatever is still pending
///
/// Request ids keep increasing across reconnects of the same client.
///
/// # Example
///
/// ```ignore
/// use memoria::config::WorkerConfig;
/// use memoria::ipc::RpcClient;
/// use serde_json::json;
///
/// let client = RpcClient::new(WorkerConfig::from_command_line("memoria-worker --stdio")?);
/// client.connect().await?;
///
/// let stats = client.call_default("memory_stats", json!({})).await?;
/// client.disconnect().await;
/// ```
pub struct RpcClient {
    config: WorkerConfig,
    /// Next request id to hand out.
    next_id: AtomicU64,
    slot: RwLock<Slot>,
    /// Serializes connect/disconnect.
    lifecycle: tokio::sync::Mutex<()>,
}

impl RpcClient {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(0),
            slot: RwLock::new(Slot::Idle),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn set_slot(&self, slot: Slot) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = slot;
    }

    fn current(&self) -> Option<Arc<Connection>> {
        match &*self.slot.read().unwrap_or_else(PoisonError::into_inner) {
            Slot::Active(conn) => Some(Arc::clone(conn)),
            Slot::Idle | Slot::Closed => None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        match &*self.slot.read().unwrap_or_else(PoisonError::into_inner) {
            Slot::Idle => ConnectionState::Disconnected,
            Slot::Active(conn) => conn.state(),
            Slot::Closed => ConnectionState::Closed,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.current().map_or(0, |conn| conn.shared.pending.len())
    }

    /// Process id of the running worker, if it was spawned by this client.
    pub fn worker_pid(&self) -> Option<u32> {
        self.current().and_then(|conn| conn.pid)
    }

    /// Capability data returned by the worker's `initialize` response.
    pub fn capabilities(&self) -> Option<Value> {
        self.current()
            .and_then(|conn| conn.capabilities.get().cloned())
    }

    /// Spawn the worker and perform the handshake.
    ///
    /// A no-op if the client is already ready.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::Spawn` if the worker cannot be launched and
    /// `IpcError::Handshake` if `initialize` fails or times out. Either way
    /// the client ends up `Closed`.
    pub async fn connect(&self) -> Result<(), IpcError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_ready() {
            return Ok(());
        }
        self.retire_current().await;

        let worker = match spawn_worker(&self.config) {
            Ok(worker) => worker,
            Err(e) => {
                error!("{}", e);
                self.set_slot(Slot::Closed);
                return Err(e);
            }
        };

        let stderr_task = drain_stderr(worker.stderr);
        let conn = Connection::open(
            worker.stdout,
            worker.stdin,
            Some(worker.child),
            Some(stderr_task),
            self.config.shutdown_grace(),
        );
        self.establish(Arc::new(conn)).await
    }

    /// Run the handshake and routing over caller-supplied byte streams.
    ///
    /// For workers hosted in-process or reached some other way than a
    /// child process. `reader` carries the worker's output, `writer` its
    /// input.
    pub async fn connect_streams<R, W>(&self, reader: R, writer: W) -> Result<(), IpcError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_ready() {
            return Ok(());
        }
        self.retire_current().await;

        let conn = Connection::open(reader, writer, None, None, self.config.shutdown_grace());
        self.establish(Arc::new(conn)).await
    }

    /// Connect with automatic retry and exponential backoff.
    ///
    /// Retries with delays of 100ms, 200ms, 400ms, etc. At least one attempt
    /// is always made.
    ///
    /// # Errors
    ///
    /// Returns the last connection error if all attempts fail.
    pub async fn connect_with_retry(&self, max_attempts: u32) -> Result<(), IpcError> {
        let attempts = max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    let delay = Duration::from_millis(100 * (1 << (attempt - 1).min(10)));
                    warn!("Connect attempt {} failed ({}); retrying in {:?}", attempt, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop the worker and fail every pending request with
    /// `IpcError::ConnectionClosed`.
    ///
    /// Safe to call when not connected.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(conn) = self.current() else {
            return;
        };

        self.set_slot(Slot::Closed);
        let failed = conn.close().await;
        info!("Disconnected from worker ({} pending request(s) failed)", failed);
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    ///
    /// - `IpcError::NotConnected` if the client is not ready
    /// - `IpcError::Timeout` if no response arrives within `timeout`
    /// - `IpcError::Remote` if the worker answers with an error
    /// - `IpcError::ConnectionClosed` if the connection goes away first
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, IpcError> {
        let conn = self.ready_connection()?;
        self.request(&conn, method, &params, timeout).await
    }

    /// [`call`](Self::call) with the configured default timeout.
    pub async fn call_default(&self, method: &str, params: Value) -> Result<Value, IpcError> {
        self.call(method, params, self.config.request_timeout()).await
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), IpcError> {
        let conn = self.ready_connection()?;
        conn.send_notification(method, params.as_ref(), self.config.request_timeout())
            .await
    }

    fn ready_connection(&self) -> Result<Arc<Connection>, IpcError> {
        match self.current() {
            Some(conn) if conn.state() == ConnectionState::Ready => Ok(conn),
            _ => Err(IpcError::NotConnected),
        }
    }

    /// Queue one request on `conn` and wait for its outcome.
    ///
    /// `timeout` covers both getting the line queued and the reply.
    async fn request(
        &self,
        conn: &Connection,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<Value, IpcError> {
        let deadline = Instant::now() + timeout;

        let queued = tokio::time::timeout_at(
            deadline,
            conn.enqueue_request(&self.next_id, method, params, deadline),
        )
        .await;
        let (guard, mut rx) = match queued {
            Ok(queued) => queued?,
            Err(_) => {
                warn!(method, "Request could not be sent within {:?}", timeout);
                return Err(IpcError::Timeout(timeout));
            }
        };

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(IpcError::ConnectionClosed),
            Err(_) => {
                if guard.cancel() {
                    warn!(id = guard.id(), method, "Request timed out after {:?}", timeout);
                    return Err(IpcError::Timeout(timeout));
                }
                // The response was routed just as the deadline passed.
                rx.await.unwrap_or(Err(IpcError::ConnectionClosed))
            }
        }
    }

    /// Make `conn` the active connection and run the handshake on it.
    async fn establish(&self, conn: Arc<Connection>) -> Result<(), IpcError> {
        self.set_slot(Slot::Active(Arc::clone(&conn)));

        let result = self.handshake(&conn).await.and_then(|capabilities| {
            let _ = conn.capabilities.set(capabilities);
            if conn.shared.mark_ready() {
                Ok(())
            } else {
                Err(IpcError::Handshake(
                    "worker closed the connection during handshake".to_string(),
                ))
            }
        });

        match result {
            Ok(()) => {
                info!(pid = ?conn.pid, "Connected to worker");
                Ok(())
            }
            Err(e) => {
                error!("{}", e);
                self.set_slot(Slot::Closed);
                conn.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, conn: &Connection) -> Result<Value, IpcError> {
        let params = json!({
            "protocolVersion": self.config.protocol_version,
            "clientInfo": {
                "name": self.config.client_name,
                "version": self.config.client_version,
            },
            "capabilities": {},
        });

        let capabilities = self
            .request(conn, INITIALIZE_METHOD, &params, self.config.handshake_timeout())
            .await
            .map_err(|e| IpcError::Handshake(e.to_string()))?;

        conn.send_notification(INITIALIZED_NOTIFICATION, None, self.config.handshake_timeout())
            .await
            .map_err(|e| IpcError::Handshake(e.to_string()))?;

        Ok(capabilities)
    }

    /// Reap a connection the worker closed on its own.
    async fn retire_current(&self) {
        if let Some(conn) = self.current() {
            conn.close().await;
        }
    }
}
