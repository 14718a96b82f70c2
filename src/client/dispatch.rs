use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::client::registry::PendingRegistry;
use crate::client::response::{ErrorHandler, JobHandle, Response};
use crate::error::GearError;
use crate::protocol::{Magic, Packet, PacketType};
use crate::transport::TransportReader;

/// Reader side of one connection.
///
/// Runs on its own task until the stream fails, a write fails, or the
/// client's shutdown token fires, routing every decoded frame through the
/// registry.
pub(crate) struct DispatchLoop {
    pub addr: String,
    pub reader: TransportReader,
    pub registry: Arc<PendingRegistry>,
    pub error_handler: Arc<RwLock<Option<ErrorHandler>>>,
    pub shutdown: CancellationToken,
    pub write_failed: CancellationToken,
}

/// Everything routing needs except the reader, which stays a local of
/// `run` so only the task itself ever borrows it.
struct Router {
    addr: String,
    registry: Arc<PendingRegistry>,
    error_handler: Arc<RwLock<Option<ErrorHandler>>>,
}

impl DispatchLoop {
    /// Route frames until the connection ends, then fail everything pending.
    ///
    /// A local close drains pending calls with `ConnectionClosed`; any read
    /// or framing failure drains them with `ConnectionLost` and is reported
    /// to the error observer.
    pub async fn run(self) {
        let DispatchLoop {
            addr,
            mut reader,
            registry,
            error_handler,
            shutdown,
            write_failed,
        } = self;
        let router = Router {
            addr,
            registry,
            error_handler,
        };
        tracing::debug!(addr = %router.addr, "Dispatch loop started");

        let exit = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break None,
                _ = write_failed.cancelled() => {
                    break Some(GearError::ConnectionLost("write to job server failed".to_string()));
                }
                next = reader.read_next() => next,
            };

            match next {
                Ok(packet) => router.route(packet).await,
                Err(err) => break Some(err),
            }
        };

        let drain_with = match exit {
            None => GearError::ConnectionClosed,
            Some(err) => {
                router.report(&err).await;
                match err {
                    GearError::ConnectionLost(reason) => GearError::ConnectionLost(reason),
                    other => GearError::ConnectionLost(other.to_string()),
                }
            }
        };

        let failed = router.registry.drain(&drain_with).await;
        tracing::debug!(addr = %router.addr, failed, "Dispatch loop stopped");
    }
}

impl Router {
    async fn route(&self, mut packet: Packet) {
        if packet.magic != Magic::Response {
            let err = GearError::Protocol(format!("unexpected request frame {}", packet.packet_type));
            self.report(&err).await;
            return;
        }

        match packet.packet_type {
            PacketType::JobCreated => {
                let handle = JobHandle::new(packet.take_arg(0));
                tracing::trace!(addr = %self.addr, handle = %handle, "Job created");
                self.registry.resolve_submission(handle).await;
            }
            packet_type if packet_type.is_work_event() => {
                self.registry.resolve(Response::from_work_packet(packet)).await;
            }
            PacketType::EchoRes | PacketType::StatusRes => {
                self.registry.resolve_sync(packet).await;
            }
            PacketType::Error => {
                let err = GearError::Server {
                    code: String::from_utf8_lossy(packet.arg(0)).into_owned(),
                    message: String::from_utf8_lossy(packet.arg(1)).into_owned(),
                };
                if let Err(unclaimed) = self.registry.fail_oldest(err).await {
                    self.report(&unclaimed).await;
                }
            }
            other => {
                let err = GearError::Protocol(format!("unexpected response {}", other));
                self.report(&err).await;
            }
        }
    }

    async fn report(&self, err: &GearError) {
        tracing::warn!(addr = %self.addr, error = %err, "Job server connection error");
        if let Some(handler) = self.error_handler.read().await.as_ref() {
            handler(err);
        }
    }
}
