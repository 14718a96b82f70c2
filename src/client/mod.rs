//! Single-server job client.
//!
//! A [`Client`] owns one connection to a job server:
//! - **Writer**: frames from every caller are serialized by one async lock
//! - **Dispatch loop**: a spawned task that reads frames and routes them
//! - **Registry**: pending submissions, echo/status calls and live jobs
//!
//! # Submission contract
//!
//! Every submission returns as soon as the server acknowledges it with
//! JOB_CREATED, never when the job finishes. Work events for foreground jobs
//! reach the handler later, on a task dedicated to that job, so a slow
//! handler delays only its own job.
//!
//! # Echo and status
//!
//! These replies carry no request identifier. Outstanding calls are matched
//! to replies in the order they were written, so concurrent callers are
//! queued rather than rejected.

pub mod dispatch;
pub mod registry;
pub mod response;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{GearError, Result};
use crate::protocol::{codec, JobPriority, Packet, PacketType};
use crate::transport::{self, TransportWriter, WriteGuard};
use dispatch::DispatchLoop;
use registry::{PendingRegistry, PendingSubmission, Sink, SyncWaiter};

pub use response::{ErrorHandler, JobHandle, Response, ResponseHandler, Status};

pub struct Client {
    addr: String,
    config: ClientConfig,
    writer: TransportWriter,
    registry: Arc<PendingRegistry>,
    error_handler: Arc<RwLock<Option<ErrorHandler>>>,
    /// Cancelled by `close` or drop
    shutdown: CancellationToken,
    /// Cancelled when a write fails; the dispatch loop treats it as loss
    write_failed: CancellationToken,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    closed: OnceCell<Result<()>>,
}

impl Client {
    /// Connect to a job server over TCP.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the connection is not established within
    /// `config.connect_timeout()`, or `Io` if the connect itself fails.
    pub async fn connect(addr: &str, config: ClientConfig) -> Result<Self> {
        let stream = timeout(config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| GearError::Timeout)??;
        stream.set_nodelay(true)?;

        tracing::info!(addr, "Connected to job server");
        Ok(Self::from_stream(addr, stream, config))
    }

    /// Wrap an already-connected stream and start its dispatch loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_stream<S>(addr: impl Into<String>, stream: S, config: ClientConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let addr = addr.into();
        let (writer, reader) = transport::split(stream, config.max_frame_size);
        let registry = Arc::new(PendingRegistry::new());
        let error_handler = Arc::new(RwLock::new(None));
        let shutdown = CancellationToken::new();
        let write_failed = CancellationToken::new();

        let dispatch = DispatchLoop {
            addr: addr.clone(),
            reader,
            registry: registry.clone(),
            error_handler: error_handler.clone(),
            shutdown: shutdown.clone(),
            write_failed: write_failed.clone(),
        };
        let dispatch_handle = tokio::spawn(dispatch.run());

        Self {
            addr,
            config,
            writer,
            registry,
            error_handler,
            shutdown,
            write_failed,
            dispatch: Mutex::new(Some(dispatch_handle)),
            closed: OnceCell::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Install an observer for connection-level errors (lost connections,
    /// malformed frames, unsolicited server errors).
    pub async fn set_error_handler(&self, handler: ErrorHandler) {
        *self.error_handler.write().await = Some(handler);
    }

    /// Send `data` and wait for the server to return it unchanged.
    pub async fn echo(&self, data: &[u8]) -> Result<Vec<u8>> {
        let packet = Packet::request(PacketType::EchoReq, vec![data.to_vec()])?;
        let mut reply = self.round_trip(packet, PacketType::EchoRes).await?;
        Ok(reply.take_arg(0))
    }

    /// Query a job's status. An unknown handle yields `known == false`.
    pub async fn status(&self, handle: &JobHandle) -> Result<Status> {
        let packet = Packet::request(PacketType::GetStatus, vec![handle.as_bytes().to_vec()])?;
        let reply = self.round_trip(packet, PacketType::StatusRes).await?;
        Status::from_status_res(&reply)
    }

    /// Submit a foreground job and return its handle once the server has
    /// accepted it.
    ///
    /// `handler` is then called for every WORK_DATA, WORK_STATUS and
    /// WORK_WARNING event and for exactly one terminal event
    /// (WORK_COMPLETE, WORK_FAIL or WORK_EXCEPTION), or with the error that
    /// ended the connection first. With no handler the events are consumed
    /// and dropped.
    pub async fn submit(
        &self,
        deadline: Duration,
        function: &str,
        data: &[u8],
        priority: JobPriority,
        handler: Option<ResponseHandler>,
    ) -> Result<JobHandle> {
        let packet = Packet::request(
            priority.foreground_packet(),
            vec![function.as_bytes().to_vec(), unique_id(), data.to_vec()],
        )?;

        let (sink, gate) = Sink::for_handler(handler);
        let handle = self.submit_packet(deadline, packet, Some(sink)).await?;
        if let Some(gate) = gate {
            let _ = gate.send(());
        }

        tracing::debug!(addr = %self.addr, function, handle = %handle, %priority, "Job submitted");
        Ok(handle)
    }

    /// Submit a background job. No work events are delivered for it.
    pub async fn submit_background(
        &self,
        deadline: Duration,
        function: &str,
        data: &[u8],
        priority: JobPriority,
    ) -> Result<JobHandle> {
        let packet = Packet::request(
            priority.background_packet(),
            vec![function.as_bytes().to_vec(), unique_id(), data.to_vec()],
        )?;
        let handle = self.submit_packet(deadline, packet, None).await?;

        tracing::debug!(addr = %self.addr, function, handle = %handle, %priority, "Background job submitted");
        Ok(handle)
    }

    /// Submit a recurring background job.
    ///
    /// `cron_spec` holds five whitespace-separated fields: minute, hour,
    /// day of month, month and day of week.
    pub async fn submit_cron(
        &self,
        deadline: Duration,
        function: &str,
        cron_spec: &str,
        data: &[u8],
    ) -> Result<JobHandle> {
        let fields: Vec<&str> = cron_spec.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(GearError::InvalidArgument(format!(
                "cron spec needs 5 fields, got {} in {:?}",
                fields.len(),
                cron_spec
            )));
        }

        let mut args = vec![function.as_bytes().to_vec(), unique_id()];
        args.extend(fields.iter().map(|field| field.as_bytes().to_vec()));
        args.push(data.to_vec());
        let packet = Packet::request(PacketType::SubmitJobSched, args)?;
        let handle = self.submit_packet(deadline, packet, None).await?;

        tracing::debug!(addr = %self.addr, function, cron_spec, handle = %handle, "Cron job submitted");
        Ok(handle)
    }

    /// Submit a background job to run at `unix_epoch` (seconds).
    pub async fn submit_at(
        &self,
        deadline: Duration,
        function: &str,
        unix_epoch: i64,
        data: &[u8],
    ) -> Result<JobHandle> {
        let packet = Packet::request(
            PacketType::SubmitJobEpoch,
            vec![
                function.as_bytes().to_vec(),
                unique_id(),
                unix_epoch.to_string().into_bytes(),
                data.to_vec(),
            ],
        )?;
        let handle = self.submit_packet(deadline, packet, None).await?;

        tracing::debug!(addr = %self.addr, function, unix_epoch, handle = %handle, "Scheduled job submitted");
        Ok(handle)
    }

    /// Stop the dispatch loop, close the stream and fail every pending call
    /// with `ConnectionClosed`.
    ///
    /// Writes in progress are abandoned rather than awaited, and shutting
    /// the stream down is bounded by the connect timeout. Later calls
    /// return the first call's result without closing again.
    pub async fn close(&self) -> Result<()> {
        self.closed
            .get_or_init(|| async {
                // Interrupts any write holding the writer lock
                self.shutdown.cancel();
                let result = match timeout(self.config.connect_timeout(), self.writer.close()).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(addr = %self.addr, "Timed out shutting down job server stream");
                        Err(GearError::Timeout)
                    }
                };
                if let Some(handle) = self.dispatch.lock().await.take() {
                    if let Err(e) = handle.await {
                        tracing::warn!(addr = %self.addr, error = %e, "Dispatch task ended abnormally");
                    }
                }
                tracing::info!(addr = %self.addr, ok = result.is_ok(), "Closed job server connection");
                result
            })
            .await
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.initialized()
    }

    /// Foreground jobs still waiting for a terminal event.
    pub async fn pending_jobs(&self) -> usize {
        self.registry.pending_jobs().await
    }

    /// Packets dropped because their caller had already given up.
    pub fn orphans(&self) -> u64 {
        self.registry.orphans()
    }

    /// Queue a submission and write its packet under one lock, then wait
    /// for JOB_CREATED until `deadline` elapses.
    async fn submit_packet(
        &self,
        deadline: Duration,
        packet: Packet,
        sink: Option<Sink>,
    ) -> Result<JobHandle> {
        let deadline = Instant::now() + deadline;
        // Encode before taking a reply slot
        let frame = codec::encode(&packet)?;
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut writer = timeout_at(deadline, self.writer.lock())
                .await
                .map_err(|_| GearError::Timeout)?;
            self.registry
                .push_submission(PendingSubmission {
                    reply: reply_tx,
                    sink,
                })
                .await?;
            self.write(&mut writer, &frame, deadline).await?;
        }

        await_reply(deadline, reply_rx).await
    }

    async fn round_trip(&self, packet: Packet, expect: PacketType) -> Result<Packet> {
        let deadline = Instant::now() + self.config.request_timeout();
        let frame = codec::encode(&packet)?;
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut writer = timeout_at(deadline, self.writer.lock())
                .await
                .map_err(|_| GearError::Timeout)?;
            self.registry
                .push_sync(SyncWaiter {
                    expect,
                    reply: reply_tx,
                })
                .await?;
            self.write(&mut writer, &frame, deadline).await?;
        }

        await_reply(deadline, reply_rx).await
    }

    /// Write one frame, giving up at `deadline` or when the client closes.
    ///
    /// A write that fails or stops part way leaves the stream unusable, so
    /// it also ends the connection through `write_failed`.
    async fn write(&self, writer: &mut WriteGuard<'_>, frame: &[u8], deadline: Instant) -> Result<()> {
        if self.write_failed.is_cancelled() {
            return Err(GearError::ConnectionLost("write to job server failed".to_string()));
        }

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(GearError::ConnectionClosed),
            sent = timeout_at(deadline, writer.send_frame(frame)) => sent.unwrap_or(Err(GearError::Timeout)),
        };

        match &result {
            // The client is closing anyway
            Ok(()) | Err(GearError::ConnectionClosed) => {}
            Err(err) => {
                tracing::warn!(addr = %self.addr, error = %err, "Write to job server failed");
                self.write_failed.cancel();
            }
        }
        result
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Ends the dispatch task, which fails anything still pending
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn await_reply<T>(deadline: Instant, reply_rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    match timeout_at(deadline, reply_rx).await {
        Ok(Ok(result)) => result,
        // Sender dropped without a reply: the registry was torn down
        Ok(Err(_)) => Err(GearError::ConnectionClosed),
        Err(_) => Err(GearError::Timeout),
    }
}

fn unique_id() -> Vec<u8> {
    Uuid::new_v4().to_string().into_bytes()
}
