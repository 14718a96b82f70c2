use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::client::response::{JobHandle, Response, ResponseHandler};
use crate::error::{GearError, Result};
use crate::protocol::{Packet, PacketType};

/// Event queued for a foreground job's handler task.
pub(crate) type JobEvent = std::result::Result<Response, GearError>;

/// Where work events for one handle go.
#[derive(Debug)]
pub(crate) enum Sink {
    /// Queue drained by the job's own handler task.
    Handler(mpsc::UnboundedSender<JobEvent>),
    /// No handler was supplied; events are consumed and dropped.
    Discard,
}

impl Sink {
    /// Build a sink for `handler`, spawning its delivery task.
    ///
    /// The task waits on the returned gate before invoking the handler, so
    /// the submitter sees the handle before the handler sees any event. If
    /// the gate is dropped unopened the task exits without calling it.
    pub(crate) fn for_handler(handler: Option<ResponseHandler>) -> (Self, Option<oneshot::Sender<()>>) {
        let Some(mut handler) = handler else {
            return (Sink::Discard, None);
        };

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<JobEvent>();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            if gate_rx.await.is_err() {
                return;
            }
            while let Some(event) = event_rx.recv().await {
                match &event {
                    Ok(response) => handler(Ok(response)),
                    Err(err) => handler(Err(err)),
                }
            }
        });

        (Sink::Handler(event_tx), Some(gate_tx))
    }

    fn deliver(&self, event: JobEvent) {
        if let Sink::Handler(tx) = self {
            // Closed when the submitter gave up before the gate opened
            let _ = tx.send(event);
        }
    }
}

/// A submission waiting for its JOB_CREATED.
pub(crate) struct PendingSubmission {
    pub reply: oneshot::Sender<Result<JobHandle>>,
    /// Present for foreground jobs only.
    pub sink: Option<Sink>,
}

/// An echo or status call waiting for its single reply.
pub(crate) struct SyncWaiter {
    pub expect: PacketType,
    pub reply: oneshot::Sender<Result<Packet>>,
}

/// A request whose reply carries no job handle.
enum Awaiting {
    Submission(PendingSubmission),
    Sync(SyncWaiter),
}

impl Awaiting {
    fn expects(&self) -> PacketType {
        match self {
            Awaiting::Submission(_) => PacketType::JobCreated,
            Awaiting::Sync(waiter) => waiter.expect,
        }
    }

    /// Complete the caller with `err`. False if the caller had left.
    fn fail(self, err: GearError) -> bool {
        match self {
            Awaiting::Submission(submission) => submission.reply.send(Err(err)).is_ok(),
            Awaiting::Sync(waiter) => waiter.reply.send(Err(err)).is_ok(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    calls: HashMap<JobHandle, Sink>,
    /// Submissions and echo/status calls in the order they were written.
    awaiting: VecDeque<Awaiting>,
    /// Set once drained; later requests fail with this error.
    closed: Option<GearError>,
}

/// Pending calls for one connection, keyed by job handle or by arrival
/// order for replies that carry no handle.
///
/// JOB_CREATED, ECHO_RES, STATUS_RES and ERROR replies are matched against
/// one FIFO holding every such request in the order it was written. An
/// entry whose caller gave up stays queued until its reply arrives, then
/// counts as an orphan.
#[derive(Default)]
pub struct PendingRegistry {
    state: Mutex<RegistryState>,
    orphans: AtomicU64,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle's sink. Fails if the handle is already pending.
    pub(crate) async fn register(&self, handle: JobHandle, sink: Sink) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::insert_call(&mut state, handle, sink)
    }

    fn insert_call(state: &mut RegistryState, handle: JobHandle, sink: Sink) -> Result<()> {
        if state.calls.contains_key(&handle) {
            return Err(GearError::DuplicateKey(handle.to_string()));
        }
        state.calls.insert(handle, sink);
        Ok(())
    }

    /// Deliver a work event by handle. Terminal events remove the entry.
    /// Returns false when nothing was pending for the handle.
    pub async fn resolve(&self, response: Response) -> bool {
        let mut state = self.state.lock().await;

        if response.is_terminal() {
            if let Some(sink) = state.calls.remove(&response.handle) {
                sink.deliver(Ok(response));
                return true;
            }
        } else if let Some(sink) = state.calls.get(&response.handle) {
            sink.deliver(Ok(response));
            return true;
        }

        self.orphans.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            handle = %response.handle,
            packet_type = %response.packet_type,
            "Dropped orphan work event"
        );
        false
    }

    /// Remove a handle without delivering anything further.
    pub async fn cancel(&self, handle: &JobHandle) -> bool {
        self.state.lock().await.calls.remove(handle).is_some()
    }

    /// Queue a submission for its JOB_CREATED. Fails once drained.
    pub(crate) async fn push_submission(&self, submission: PendingSubmission) -> Result<()> {
        self.push(Awaiting::Submission(submission)).await
    }

    /// Queue an echo/status call for its reply. Fails once drained.
    pub(crate) async fn push_sync(&self, waiter: SyncWaiter) -> Result<()> {
        self.push(Awaiting::Sync(waiter)).await
    }

    async fn push(&self, entry: Awaiting) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(err) = &state.closed {
            return Err(err.clone());
        }
        state.awaiting.push_back(entry);
        Ok(())
    }

    /// Pop the oldest request, failing it if it expected another reply.
    fn pop_expecting(&self, state: &mut RegistryState, got: PacketType) -> Option<Awaiting> {
        let Some(entry) = state.awaiting.pop_front() else {
            self.orphans.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(packet_type = %got, "Reply with no request waiting");
            return None;
        };

        let expect = entry.expects();
        if expect == got {
            return Some(entry);
        }

        tracing::warn!(expected = %expect, packet_type = %got, "Reply out of order");
        let err = GearError::Protocol(format!("expected {}, got {}", expect, got));
        if !entry.fail(err) {
            self.orphans.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Complete the oldest request with the handle from JOB_CREATED.
    ///
    /// Foreground handles are registered before the submitter is woken.
    /// Returns false if the oldest request was not a submission or its
    /// caller had left.
    pub async fn resolve_submission(&self, handle: JobHandle) -> bool {
        let mut state = self.state.lock().await;
        let entry = self.pop_expecting(&mut state, PacketType::JobCreated);
        let Some(Awaiting::Submission(submission)) = entry else {
            return false;
        };

        if submission.reply.is_closed() {
            self.orphans.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(handle = %handle, "Submission timed out before JOB_CREATED");
            return false;
        }

        if let Some(sink) = submission.sink {
            if let Err(err) = Self::insert_call(&mut state, handle.clone(), sink) {
                let _ = submission.reply.send(Err(err));
                return false;
            }
        }

        if submission.reply.send(Ok(handle.clone())).is_err() {
            state.calls.remove(&handle);
            self.orphans.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Complete the oldest request with an echo/status reply packet.
    pub async fn resolve_sync(&self, packet: Packet) -> bool {
        let entry = {
            let mut state = self.state.lock().await;
            self.pop_expecting(&mut state, packet.packet_type)
        };
        let Some(Awaiting::Sync(waiter)) = entry else {
            return false;
        };

        if waiter.reply.send(Ok(packet)).is_err() {
            self.orphans.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Dropped reply for a caller that timed out");
            return false;
        }
        true
    }

    /// Fail the oldest outstanding request, whatever its kind, with a
    /// server ERROR. Returns the error back if nothing was outstanding.
    pub async fn fail_oldest(&self, err: GearError) -> std::result::Result<(), GearError> {
        let Some(entry) = self.state.lock().await.awaiting.pop_front() else {
            return Err(err);
        };
        if !entry.fail(err) {
            self.orphans.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Fail every pending call with `err` and refuse new ones.
    ///
    /// Foreground handlers receive `err` as their final event; blocked
    /// callers receive it as their return value.
    pub async fn drain(&self, err: &GearError) -> usize {
        let mut state = self.state.lock().await;
        state.closed = Some(err.clone());
        let count = state.calls.len() + state.awaiting.len();

        for (_, sink) in state.calls.drain() {
            sink.deliver(Err(err.clone()));
        }
        for entry in state.awaiting.drain(..) {
            entry.fail(err.clone());
        }
        count
    }

    /// Number of handles currently awaiting work events.
    pub async fn pending_jobs(&self) -> usize {
        self.state.lock().await.calls.len()
    }

    /// Packets dropped because nothing was waiting for them.
    pub fn orphans(&self) -> u64 {
        self.orphans.load(Ordering::Relaxed)
    }
}
