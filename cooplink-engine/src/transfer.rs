//! File transfer engine for one connected session.
//!
//! [`Transfers`] is owned by the session actor and holds at most one active
//! task per direction. Outgoing tasks queue behind the active one; incoming
//! tasks are created by the peer's offer. Byte movement happens in worker
//! tasks: a sender that reads files and queues chunk frames, and a sink
//! that writes chunks into [`PartialFile`]s. Workers report back through
//! [`WorkerReport`]s and never touch task state themselves.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use dashmap::DashSet;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cooplink_core::device::DeviceId;
use cooplink_core::error::{CoreError, ErrorCode};
use cooplink_core::fs::{
    FileDescriptor, PartialFile, StorageProbe, find_available_path,
    sanitize_relative_path, validate_save_dir,
};
use cooplink_core::protocol::{
    FileChunk, FileEndPayload, MAX_CHUNK_DATA_LEN, Message, OfferedFile, TransferCancelPayload,
    TransferDecisionPayload, TransferDonePayload, TransferOfferPayload, encode_file_chunk,
};
use cooplink_core::settings::{CollisionPolicy, Settings};
use cooplink_core::state::{Direction, InvalidTransition, TaskId, TransferInput, TransferState};

use crate::history::{TransferHistory, TransferRecord};
use crate::link::Outbound;
use crate::progress::ProgressMeter;
use crate::session::{EventSink, SessionEvent};

const SINK_QUEUE: usize = 16;

/// Engine-wide resources shared by every session's transfers.
#[derive(Clone)]
pub(crate) struct TransferContext {
    pub(crate) storage: Arc<dyn StorageProbe>,
    /// Destination paths currently owned by an incoming task.
    pub(crate) leases: Arc<DashSet<PathBuf>>,
    pub(crate) history: Arc<TransferHistory>,
    pub(crate) task_ids: Arc<AtomicU64>,
    pub(crate) chunk_size: usize,
    pub(crate) response_timeout: Duration,
}

impl TransferContext {
    fn next_task_id(&self) -> TaskId {
        TaskId(self.task_ids.fetch_add(1, Ordering::Relaxed))
    }
}

/// Exclusive claim on a destination path; released on drop.
pub(crate) struct DestinationLease {
    leases: Arc<DashSet<PathBuf>>,
    path: PathBuf,
}

impl DestinationLease {
    pub(crate) fn acquire(leases: &Arc<DashSet<PathBuf>>, path: PathBuf) -> Option<Self> {
        leases.insert(path.clone()).then(|| Self {
            leases: Arc::clone(leases),
            path,
        })
    }
}

impl Drop for DestinationLease {
    fn drop(&mut self) {
        self.leases.remove(&self.path);
    }
}

#[derive(Debug)]
pub(crate) enum WorkerReport {
    SenderDone { task_id: TaskId },
    SenderFailed { task_id: TaskId, code: ErrorCode },
    SinkDone { task_id: TaskId },
    SinkFailed { task_id: TaskId, code: ErrorCode },
}

enum SinkInput {
    Chunk { file_index: u32, data: Bytes },
    End { file_index: u32, sha256_hex: String },
}

struct Worker {
    handle: JoinHandle<()>,
    cancel: Arc<AtomicBool>,
}

impl Worker {
    /// Stops the worker at its next checkpoint and waits until it is gone,
    /// so any partial file it owned has been removed.
    async fn stop(self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.handle.abort();
        let _ = self.handle.await;
    }
}

struct Outgoing {
    task_id: TaskId,
    files: Vec<FileDescriptor>,
    total: u64,
    state: TransferState,
    sent: Arc<AtomicU64>,
    meter: ProgressMeter,
    worker: Option<Worker>,
}

struct Incoming {
    task_id: TaskId,
    wire_id: u64,
    files: Vec<OfferedFile>,
    total: u64,
    state: TransferState,
    received: Arc<AtomicU64>,
    meter: ProgressMeter,
    /// Decision deadline while `Negotiating`.
    deadline: Option<Instant>,
    sink: Option<mpsc::Sender<SinkInput>>,
    /// Owns the destination leases for as long as it runs.
    worker: Option<Worker>,
}

pub(crate) struct Transfers {
    ctx: TransferContext,
    peer: DeviceId,
    outbound: Outbound,
    events: EventSink,
    reports: mpsc::UnboundedSender<WorkerReport>,
    outgoing: Option<Outgoing>,
    queue: VecDeque<Outgoing>,
    incoming: Option<Incoming>,
}

impl Transfers {
    pub(crate) fn new(
        ctx: TransferContext,
        peer: DeviceId,
        outbound: Outbound,
        events: EventSink,
        reports: mpsc::UnboundedSender<WorkerReport>,
    ) -> Self {
        Self {
            ctx,
            peer,
            outbound,
            events,
            reports,
            outgoing: None,
            queue: VecDeque::new(),
            incoming: None,
        }
    }

    // ── Sending side ────────────────────────────────────────────────

    /// Queues an inspected batch and starts it if nothing else is being sent.
    pub(crate) async fn submit(&mut self, files: Vec<FileDescriptor>) -> TaskId {
        let task_id = self.ctx.next_task_id();
        let total = files.iter().map(|f| f.size).sum();
        info!(task_id = %task_id, files = files.len(), total, "Transfer queued");

        self.queue.push_back(Outgoing {
            task_id,
            files,
            total,
            state: TransferState::Queued,
            sent: Arc::new(AtomicU64::new(0)),
            meter: ProgressMeter::new(total, Instant::now()),
            worker: None,
        });
        self.emit_state(task_id, Direction::Outbound, TransferState::Queued);
        self.promote_next().await;
        task_id
    }

    async fn promote_next(&mut self) {
        if self.outgoing.is_some() {
            return;
        }
        let Some(mut task) = self.queue.pop_front() else {
            return;
        };
        let Ok(next) = task.state.on(TransferInput::Promote) else {
            return;
        };
        task.state = next;
        self.emit_state(task.task_id, Direction::Outbound, task.state);

        let offer = TransferOfferPayload {
            transfer_id: task.task_id.0,
            files: task
                .files
                .iter()
                .map(|f| OfferedFile {
                    name: f.name.clone(),
                    size: f.size,
                })
                .collect(),
        };
        debug!(task_id = %task.task_id, "Offering transfer");
        self.outgoing = Some(task);
        self.send(Message::TransferOffer(offer));
    }

    pub(crate) async fn on_decision(&mut self, decision: TransferDecisionPayload) {
        let Some(task) = self
            .outgoing
            .as_mut()
            .filter(|t| t.task_id.0 == decision.transfer_id && t.state == TransferState::Negotiating)
        else {
            debug!(transfer_id = decision.transfer_id, "Decision for unknown transfer ignored");
            return;
        };

        if !decision.accept {
            let reason = decision.reason.unwrap_or(ErrorCode::Rejected);
            let input = match reason {
                ErrorCode::Rejected | ErrorCode::TimedOut => TransferInput::Reject(reason),
                other => TransferInput::Fail(other),
            };
            info!(task_id = %task.task_id, reason = ?reason, "Transfer declined");
            self.finish_outgoing(input).await;
            return;
        }

        task.state = TransferState::Transferring;
        task.meter = ProgressMeter::new(task.total, Instant::now());
        let task_id = task.task_id;
        info!(task_id = %task_id, "Transfer accepted, sending");

        let cancel = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_sender(
            task.task_id,
            task.files.clone(),
            self.outbound.clone(),
            Arc::clone(&task.sent),
            Arc::clone(&cancel),
            self.ctx.chunk_size,
            self.reports.clone(),
        ));
        task.worker = Some(Worker { handle, cancel });
        self.emit_state(task_id, Direction::Outbound, TransferState::Transferring);
    }

    pub(crate) async fn on_done(&mut self, done: TransferDonePayload) {
        let matches = self
            .outgoing
            .as_ref()
            .is_some_and(|t| t.task_id.0 == done.transfer_id && t.state == TransferState::Transferring);
        if !matches {
            debug!(transfer_id = done.transfer_id, "Completion for unknown transfer ignored");
            return;
        }
        if done.ok {
            if let Some(task) = self.outgoing.as_mut() {
                let progress = task.meter.complete();
                self.events.emit(SessionEvent::TransferProgress {
                    task_id: task.task_id,
                    progress,
                });
            }
            self.finish_outgoing(TransferInput::Finish).await;
        } else {
            let code = done.reason.unwrap_or(ErrorCode::Corrupted);
            self.finish_outgoing(TransferInput::Fail(code)).await;
        }
    }

    async fn finish_outgoing(&mut self, input: TransferInput) {
        let Some(mut task) = self.outgoing.take() else {
            return;
        };
        if let Some(worker) = task.worker.take() {
            worker.stop().await;
        }
        match task.state.on(input) {
            Ok(state) => task.state = state,
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "Ignoring transfer input");
                self.outgoing = Some(task);
                return;
            }
        }
        self.retire_outgoing(&task);
        self.promote_next().await;
    }

    fn retire_outgoing(&self, task: &Outgoing) {
        info!(task_id = %task.task_id, state = ?task.state, "Outgoing transfer finished");
        self.emit_state(task.task_id, Direction::Outbound, task.state);
        self.record(
            task.task_id,
            Direction::Outbound,
            task.files.iter().map(|f| f.name.clone()).collect(),
            task.total,
            task.state,
        );
    }

    // ── Receiving side ──────────────────────────────────────────────

    pub(crate) async fn on_offer(&mut self, offer: TransferOfferPayload, settings: &Settings) {
        if self.incoming.is_some() {
            warn!(transfer_id = offer.transfer_id, "Offer while another incoming transfer is active");
            self.decline(offer.transfer_id, ErrorCode::Rejected);
            return;
        }
        if offer.files.is_empty() || offer.files.iter().any(|f| f.size == 0) {
            warn!(transfer_id = offer.transfer_id, "Offer with invalid file set");
            self.decline(offer.transfer_id, ErrorCode::InvalidFileSet);
            return;
        }

        let task_id = self.ctx.next_task_id();
        let files: Vec<OfferedFile> = offer
            .files
            .into_iter()
            .map(|f| OfferedFile {
                name: sanitize_relative_path(&f.name),
                size: f.size,
            })
            .collect();
        let total = files.iter().map(|f| f.size).sum();

        let mut task = Incoming {
            task_id,
            wire_id: offer.transfer_id,
            files,
            total,
            state: TransferState::Negotiating,
            received: Arc::new(AtomicU64::new(0)),
            meter: ProgressMeter::new(total, Instant::now()),
            deadline: None,
            sink: None,
            worker: None,
        };

        if !settings.sender_allow_list.admits_offers() {
            info!(task_id = %task_id, "Incoming offer refused by sender allow-list");
            self.decline(task.wire_id, ErrorCode::Rejected);
            task.state = TransferState::Rejected(ErrorCode::Rejected);
            self.retire_incoming(&task);
            return;
        }

        info!(task_id = %task_id, files = task.files.len(), total, "Incoming transfer offer");
        task.deadline = Some(Instant::now() + self.ctx.response_timeout);
        self.emit_state(task_id, Direction::Inbound, task.state);
        self.events.emit(SessionEvent::IncomingTransferOffer {
            task_id,
            files: task.files.clone(),
            total_bytes: total,
        });
        self.incoming = Some(task);
    }

    /// Accepts or rejects the pending incoming offer `task_id`.
    ///
    /// Validation failures (`InvalidSaveLocation`, `DestinationBusy`) are
    /// returned and leave the offer pending. Pre-flight failures after
    /// validation end the task and surface as state events.
    pub(crate) async fn respond(
        &mut self,
        task_id: TaskId,
        accept: bool,
        settings: &Settings,
    ) -> Result<(), CoreError> {
        let task = self
            .incoming
            .as_ref()
            .filter(|t| t.task_id == task_id)
            .ok_or(CoreError::UnknownTransfer(task_id))?;
        if task.state != TransferState::Negotiating {
            return Err(InvalidTransition::new(task.state, TransferInput::Accept).into());
        }

        if !accept {
            info!(task_id = %task_id, "Incoming transfer rejected");
            self.decline(task.wire_id, ErrorCode::Rejected);
            self.finish_incoming(TransferInput::Reject(ErrorCode::Rejected)).await;
            return Ok(());
        }

        validate_save_dir(&settings.save_dir)?;
        let (paths, leases) = self.lease_destinations(task, settings)?;

        let wire_id = task.wire_id;
        let total = task.total;
        match self.ctx.storage.available_bytes(&settings.save_dir) {
            Ok(available) if available <= total => {
                warn!(task_id = %task_id, available, total, "Not enough free space");
                self.decline(wire_id, ErrorCode::InsufficientStorage);
                self.finish_incoming(TransferInput::Fail(ErrorCode::InsufficientStorage))
                    .await;
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!(task_id = %task_id, error = %e, "Free space unknown, proceeding"),
        }

        if self.outbound.is_closed() {
            self.finish_incoming(TransferInput::Fail(ErrorCode::NetworkUnavailable))
                .await;
            return Ok(());
        }

        self.send(Message::TransferDecision(TransferDecisionPayload {
            transfer_id: wire_id,
            accept: true,
            reason: None,
        }));

        let Some(task) = self.incoming.as_mut() else {
            return Ok(());
        };
        let destinations = paths.into_iter().zip(task.files.iter().map(|f| f.size)).collect();
        task.deadline = None;
        task.state = TransferState::Transferring;
        task.meter = ProgressMeter::new(task.total, Instant::now());
        info!(task_id = %task_id, "Receiving transfer");

        let (sink_tx, sink_rx) = mpsc::channel(SINK_QUEUE);
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_sink(
            task_id,
            leases,
            destinations,
            sink_rx,
            Arc::clone(&task.received),
            self.reports.clone(),
        ));
        task.sink = Some(sink_tx);
        task.worker = Some(Worker { handle, cancel });
        self.emit_state(task_id, Direction::Inbound, TransferState::Transferring);
        Ok(())
    }

    /// Resolves every offered name to a destination under the save dir and
    /// claims it. Returns one path per file, in offer order, and the leases
    /// held for the batch.
    ///
    /// Names with several components belong to a folder. The folder is
    /// resolved once per batch, so a collision renames the folder and the
    /// files inside it keep their names.
    fn lease_destinations(
        &self,
        task: &Incoming,
        settings: &Settings,
    ) -> Result<(Vec<PathBuf>, Vec<DestinationLease>), ErrorCode> {
        let mut batch: HashSet<PathBuf> = HashSet::new();
        let mut folders: HashMap<&str, PathBuf> = HashMap::new();
        let mut paths = Vec::with_capacity(task.files.len());
        let mut leases = Vec::with_capacity(task.files.len());

        for file in &task.files {
            let wanted = match file.name.split_once('/') {
                Some((top, rest)) => {
                    let folder = if let Some(folder) = folders.get(top) {
                        folder.clone()
                    } else {
                        let (lease, folder) = self.claim(settings.save_dir.join(top), settings, &mut batch)?;
                        leases.push(lease);
                        folders.insert(top, folder.clone());
                        folder
                    };
                    folder.join(rest)
                }
                None => settings.save_dir.join(&file.name),
            };
            let (lease, path) = self.claim(wanted, settings, &mut batch)?;
            leases.push(lease);
            paths.push(path);
        }
        Ok((paths, leases))
    }

    /// Applies the collision policy to one wanted path and leases the result.
    fn claim(
        &self,
        wanted: PathBuf,
        settings: &Settings,
        batch: &mut HashSet<PathBuf>,
    ) -> Result<(DestinationLease, PathBuf), ErrorCode> {
        let path = match settings.collision_policy {
            CollisionPolicy::Rename => {
                find_available_path(wanted, |p| self.ctx.leases.contains(p) || batch.contains(p))
            }
            CollisionPolicy::Overwrite => {
                if batch.contains(&wanted) {
                    return Err(ErrorCode::DestinationBusy);
                }
                wanted
            }
        };
        let lease = DestinationLease::acquire(&self.ctx.leases, path.clone()).ok_or_else(|| {
            debug!(path = %path.display(), "Destination leased by another transfer");
            ErrorCode::DestinationBusy
        })?;
        batch.insert(path.clone());
        Ok((lease, path))
    }

    pub(crate) async fn on_chunk(&mut self, chunk: FileChunk) {
        let Some(sink) = self
            .incoming
            .as_ref()
            .filter(|t| t.wire_id == chunk.transfer_id)
            .and_then(|t| t.sink.clone())
        else {
            debug!(transfer_id = chunk.transfer_id, "Chunk for inactive transfer dropped");
            return;
        };
        let _ = sink
            .send(SinkInput::Chunk {
                file_index: chunk.file_index,
                data: chunk.data,
            })
            .await;
    }

    pub(crate) async fn on_file_end(&mut self, end: FileEndPayload) {
        let Some(sink) = self
            .incoming
            .as_ref()
            .filter(|t| t.wire_id == end.transfer_id)
            .and_then(|t| t.sink.clone())
        else {
            debug!(transfer_id = end.transfer_id, "File end for inactive transfer dropped");
            return;
        };
        let _ = sink
            .send(SinkInput::End {
                file_index: end.file_index,
                sha256_hex: end.sha256_hex,
            })
            .await;
    }

    async fn finish_incoming(&mut self, input: TransferInput) {
        let Some(mut task) = self.incoming.take() else {
            return;
        };
        task.sink = None;
        if let Some(worker) = task.worker.take() {
            worker.stop().await;
        }
        match task.state.on(input) {
            Ok(state) => task.state = state,
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "Ignoring transfer input");
                self.incoming = Some(task);
                return;
            }
        }
        self.retire_incoming(&task);
    }

    fn retire_incoming(&self, task: &Incoming) {
        info!(task_id = %task.task_id, state = ?task.state, "Incoming transfer finished");
        self.emit_state(task.task_id, Direction::Inbound, task.state);
        self.record(
            task.task_id,
            Direction::Inbound,
            task.files.iter().map(|f| f.name.clone()).collect(),
            task.total,
            task.state,
        );
    }

    fn decline(&self, wire_id: u64, reason: ErrorCode) {
        self.send(Message::TransferDecision(TransferDecisionPayload {
            transfer_id: wire_id,
            accept: false,
            reason: Some(reason),
        }));
    }

    // ── Both sides ──────────────────────────────────────────────────

    /// Cancels a local task in either direction and notifies the peer.
    pub(crate) async fn cancel(&mut self, task_id: TaskId) -> Result<(), CoreError> {
        if let Some(pos) = self.queue.iter().position(|t| t.task_id == task_id) {
            if let Some(mut task) = self.queue.remove(pos) {
                task.state = task.state.on(TransferInput::Cancel)?;
                info!(task_id = %task_id, "Queued transfer canceled");
                self.retire_outgoing(&task);
            }
            return Ok(());
        }

        if let Some(task) = self.outgoing.as_ref().filter(|t| t.task_id == task_id) {
            task.state.on(TransferInput::Cancel)?;
            let wire_id = task.task_id.0;
            self.finish_outgoing(TransferInput::Cancel).await;
            self.send_cancel(wire_id, ErrorCode::Canceled);
            return Ok(());
        }

        if let Some(task) = self.incoming.as_ref().filter(|t| t.task_id == task_id) {
            task.state.on(TransferInput::Cancel)?;
            let wire_id = task.wire_id;
            self.finish_incoming(TransferInput::Cancel).await;
            self.send_cancel(wire_id, ErrorCode::Canceled);
            return Ok(());
        }

        Err(CoreError::UnknownTransfer(task_id))
    }

    /// The peer canceled or aborted one of the active tasks.
    pub(crate) async fn on_cancel(&mut self, cancel: TransferCancelPayload) {
        let input = if cancel.reason == ErrorCode::Canceled {
            TransferInput::Cancel
        } else {
            TransferInput::Fail(cancel.reason)
        };

        if self.outgoing.as_ref().is_some_and(|t| t.task_id.0 == cancel.transfer_id) {
            info!(transfer_id = cancel.transfer_id, reason = ?cancel.reason, "Peer stopped outgoing transfer");
            self.finish_outgoing(input).await;
        } else if self.incoming.as_ref().is_some_and(|t| t.wire_id == cancel.transfer_id) {
            info!(transfer_id = cancel.transfer_id, reason = ?cancel.reason, "Peer stopped incoming transfer");
            self.finish_incoming(input).await;
        } else {
            debug!(transfer_id = cancel.transfer_id, "Cancel for unknown transfer ignored");
        }
    }

    fn send_cancel(&self, wire_id: u64, reason: ErrorCode) {
        self.send(Message::TransferCancel(TransferCancelPayload {
            transfer_id: wire_id,
            reason,
        }));
    }

    pub(crate) async fn on_report(&mut self, report: WorkerReport) {
        match report {
            WorkerReport::SenderDone { task_id } => {
                debug!(task_id = %task_id, "All chunks queued, awaiting confirmation");
            }
            WorkerReport::SenderFailed { task_id, code } => {
                let active = self.outgoing.as_ref().is_some_and(|t| t.task_id == task_id);
                // A closed link is handled by session teardown.
                if !active || matches!(code, ErrorCode::Canceled | ErrorCode::NetworkUnavailable) {
                    return;
                }
                warn!(task_id = %task_id, reason = ?code, "Sending failed");
                self.finish_outgoing(TransferInput::Fail(code)).await;
                self.send_cancel(task_id.0, code);
            }
            WorkerReport::SinkDone { task_id } => {
                let Some(task) = self.incoming.as_mut().filter(|t| t.task_id == task_id) else {
                    return;
                };
                let wire_id = task.wire_id;
                let progress = task.meter.complete();
                self.events.emit(SessionEvent::TransferProgress { task_id, progress });
                self.send(Message::TransferDone(TransferDonePayload {
                    transfer_id: wire_id,
                    ok: true,
                    reason: None,
                }));
                self.finish_incoming(TransferInput::Finish).await;
            }
            WorkerReport::SinkFailed { task_id, code } => {
                let Some(task) = self.incoming.as_ref().filter(|t| t.task_id == task_id) else {
                    return;
                };
                warn!(task_id = %task_id, reason = ?code, "Receiving failed");
                let wire_id = task.wire_id;
                self.send(Message::TransferDone(TransferDonePayload {
                    transfer_id: wire_id,
                    ok: false,
                    reason: Some(code),
                }));
                self.finish_incoming(TransferInput::Fail(code)).await;
            }
        }
    }

    /// Earliest pending offer-decision deadline.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.incoming.as_ref().and_then(|t| t.deadline)
    }

    pub(crate) async fn on_deadline(&mut self, now: Instant) {
        let Some(task) = self
            .incoming
            .as_ref()
            .filter(|t| t.deadline.is_some_and(|d| d <= now))
        else {
            return;
        };
        info!(task_id = %task.task_id, "Offer not answered in time");
        let wire_id = task.wire_id;
        self.decline(wire_id, ErrorCode::TimedOut);
        self.finish_incoming(TransferInput::Reject(ErrorCode::TimedOut)).await;
    }

    /// Emits a progress snapshot for every task currently moving bytes.
    pub(crate) fn sample_progress(&mut self, now: Instant) {
        if let Some(task) = self
            .outgoing
            .as_mut()
            .filter(|t| t.state == TransferState::Transferring)
        {
            let progress = task.meter.sample(task.sent.load(Ordering::Relaxed), now);
            self.events.emit(SessionEvent::TransferProgress {
                task_id: task.task_id,
                progress,
            });
        }
        if let Some(task) = self
            .incoming
            .as_mut()
            .filter(|t| t.state == TransferState::Transferring)
        {
            let progress = task.meter.sample(task.received.load(Ordering::Relaxed), now);
            self.events.emit(SessionEvent::TransferProgress {
                task_id: task.task_id,
                progress,
            });
        }
    }

    /// Ends every task with `Failed(code)`; used when the session ends.
    pub(crate) async fn fail_all(&mut self, code: ErrorCode) {
        if let Some(mut task) = self.outgoing.take() {
            if let Some(worker) = task.worker.take() {
                worker.stop().await;
            }
            if let Ok(state) = task.state.on(TransferInput::Fail(code)) {
                task.state = state;
                self.retire_outgoing(&task);
            }
        }
        while let Some(mut task) = self.queue.pop_front() {
            if let Ok(state) = task.state.on(TransferInput::Fail(code)) {
                task.state = state;
                self.retire_outgoing(&task);
            }
        }
        if let Some(mut task) = self.incoming.take() {
            task.sink = None;
            if let Some(worker) = task.worker.take() {
                worker.stop().await;
            }
            if let Ok(state) = task.state.on(TransferInput::Fail(code)) {
                task.state = state;
                self.retire_incoming(&task);
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn send(&self, msg: Message) {
        if let Err(e) = self.outbound.send(&msg) {
            debug!(error = %e, msg_type = ?msg.msg_type(), "Dropping transfer message, link closed");
        }
    }

    fn emit_state(&self, task_id: TaskId, direction: Direction, state: TransferState) {
        self.events.emit(SessionEvent::TransferStateChanged {
            task_id,
            direction,
            state,
            reason: state.reason(),
        });
    }

    fn record(
        &self,
        task_id: TaskId,
        direction: Direction,
        files: Vec<String>,
        total_bytes: u64,
        state: TransferState,
    ) {
        self.ctx.history.record(TransferRecord {
            task_id,
            session_id: self.events.session_id(),
            peer: self.peer.clone(),
            direction,
            files,
            total_bytes,
            state,
            finished_at: SystemTime::now(),
        });
    }
}

// ── Workers ─────────────────────────────────────────────────────────

async fn run_sender(
    task_id: TaskId,
    files: Vec<FileDescriptor>,
    outbound: Outbound,
    sent: Arc<AtomicU64>,
    cancel: Arc<AtomicBool>,
    chunk_size: usize,
    reports: mpsc::UnboundedSender<WorkerReport>,
) {
    let report = match send_files(task_id.0, &files, &outbound, &sent, &cancel, chunk_size).await {
        Ok(()) => WorkerReport::SenderDone { task_id },
        Err(code) => WorkerReport::SenderFailed { task_id, code },
    };
    let _ = reports.send(report);
}

async fn send_files(
    wire_id: u64,
    files: &[FileDescriptor],
    outbound: &Outbound,
    sent: &AtomicU64,
    cancel: &AtomicBool,
    chunk_size: usize,
) -> Result<(), ErrorCode> {
    let mut buf = vec![0u8; chunk_size.clamp(1, MAX_CHUNK_DATA_LEN)];

    for (index, file) in files.iter().enumerate() {
        let file_index = u32::try_from(index).map_err(|_| ErrorCode::InvalidFileSet)?;
        let mut reader = tokio::fs::File::open(&file.path).await.map_err(|e| {
            warn!(path = %file.path.display(), error = %e, "Cannot open file for sending");
            ErrorCode::Corrupted
        })?;

        let mut hasher = Sha256::new();
        let mut remaining = file.size;
        while remaining > 0 {
            if cancel.load(Ordering::Relaxed) {
                return Err(ErrorCode::Canceled);
            }
            let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
            let n = reader.read(&mut buf[..want]).await.map_err(|e| {
                warn!(path = %file.path.display(), error = %e, "Read failed");
                ErrorCode::Corrupted
            })?;
            if n == 0 {
                warn!(path = %file.path.display(), remaining, "File shrank while sending");
                return Err(ErrorCode::Corrupted);
            }
            hasher.update(&buf[..n]);
            let frame = encode_file_chunk(wire_id, file_index, &buf[..n])
                .map_err(|_| ErrorCode::Corrupted)?;
            outbound
                .send_data(frame)
                .await
                .map_err(|_| ErrorCode::NetworkUnavailable)?;
            sent.fetch_add(n as u64, Ordering::Relaxed);
            remaining -= n as u64;
        }

        let end = Message::FileEnd(FileEndPayload {
            transfer_id: wire_id,
            file_index,
            sha256_hex: hex::encode(hasher.finalize()),
        })
        .encode()
        .map_err(|_| ErrorCode::Corrupted)?;
        // Same lane as the chunks so it cannot overtake them.
        outbound
            .send_data(end)
            .await
            .map_err(|_| ErrorCode::NetworkUnavailable)?;
        debug!(file = %file.name, "File sent");
    }
    Ok(())
}

async fn run_sink(
    task_id: TaskId,
    leases: Vec<DestinationLease>,
    destinations: Vec<(PathBuf, u64)>,
    input: mpsc::Receiver<SinkInput>,
    received: Arc<AtomicU64>,
    reports: mpsc::UnboundedSender<WorkerReport>,
) {
    let result = receive_files(destinations, input, &received).await;
    drop(leases);
    let report = match result {
        Ok(()) => WorkerReport::SinkDone { task_id },
        Err(code) => WorkerReport::SinkFailed { task_id, code },
    };
    let _ = reports.send(report);
}

/// Writes files strictly in declared order. Files completed before a
/// failure stay in place; the one in progress is removed.
async fn receive_files(
    destinations: Vec<(PathBuf, u64)>,
    mut input: mpsc::Receiver<SinkInput>,
    received: &AtomicU64,
) -> Result<(), ErrorCode> {
    for (index, (dest, size)) in destinations.into_iter().enumerate() {
        let mut partial = PartialFile::create(dest).await?;
        loop {
            match input.recv().await {
                Some(SinkInput::Chunk { file_index, data }) if file_index as usize == index => {
                    if partial.written() + data.len() as u64 > size {
                        warn!(path = %partial.dest().display(), "More data than offered");
                        return Err(ErrorCode::Corrupted);
                    }
                    partial.write(&data).await?;
                    received.fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                Some(SinkInput::End {
                    file_index,
                    sha256_hex,
                }) if file_index as usize == index => {
                    let stored = partial.finish(size, &sha256_hex).await?;
                    debug!(path = %stored.display(), "File received");
                    break;
                }
                Some(_) => {
                    warn!(expected = index, "Out-of-order file data");
                    return Err(ErrorCode::Corrupted);
                }
                None => return Err(ErrorCode::NetworkUnavailable),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leases() -> Arc<DashSet<PathBuf>> {
        Arc::new(DashSet::new())
    }

    #[test]
    fn given_leased_path_when_acquired_again_then_refused_until_released() {
        let set = leases();
        let path = PathBuf::from("/tmp/x");
        let first = DestinationLease::acquire(&set, path.clone()).unwrap();
        assert!(DestinationLease::acquire(&set, path.clone()).is_none());
        drop(first);
        assert!(DestinationLease::acquire(&set, path).is_some());
    }

    async fn sink_with(destinations: Vec<(PathBuf, u64)>) -> (mpsc::Sender<SinkInput>, JoinHandle<Result<(), ErrorCode>>) {
        let (tx, rx) = mpsc::channel(SINK_QUEUE);
        let handle = tokio::spawn(async move {
            let received = AtomicU64::new(0);
            receive_files(destinations, rx, &received).await
        });
        (tx, handle)
    }

    fn sha(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[tokio::test]
    async fn given_chunks_in_order_when_sinking_then_files_written_and_verified() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        let (tx, handle) = sink_with(vec![(a.clone(), 5), (b.clone(), 3)]).await;

        tx.send(SinkInput::Chunk { file_index: 0, data: Bytes::from_static(b"hel") }).await.unwrap();
        tx.send(SinkInput::Chunk { file_index: 0, data: Bytes::from_static(b"lo") }).await.unwrap();
        tx.send(SinkInput::End { file_index: 0, sha256_hex: sha(b"hello") }).await.unwrap();
        tx.send(SinkInput::Chunk { file_index: 1, data: Bytes::from_static(b"abc") }).await.unwrap();
        tx.send(SinkInput::End { file_index: 1, sha256_hex: sha(b"abc") }).await.unwrap();

        assert_eq!(handle.await.unwrap(), Ok(()));
        assert_eq!(std::fs::read(a).unwrap(), b"hello");
        assert_eq!(std::fs::read(b).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn given_wrong_digest_when_sinking_then_corrupted_and_no_file_left() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let (tx, handle) = sink_with(vec![(a.clone(), 5)]).await;

        tx.send(SinkInput::Chunk { file_index: 0, data: Bytes::from_static(b"hello") }).await.unwrap();
        tx.send(SinkInput::End { file_index: 0, sha256_hex: sha(b"world") }).await.unwrap();

        assert_eq!(handle.await.unwrap(), Err(ErrorCode::Corrupted));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn given_input_closed_mid_file_when_sinking_then_partial_removed() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let (tx, handle) = sink_with(vec![(a.clone(), 10)]).await;

        tx.send(SinkInput::Chunk { file_index: 0, data: Bytes::from_static(b"half") }).await.unwrap();
        drop(tx);

        assert_eq!(handle.await.unwrap(), Err(ErrorCode::NetworkUnavailable));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn given_oversized_data_when_sinking_then_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, handle) = sink_with(vec![(dir.path().join("a"), 2)]).await;
        tx.send(SinkInput::Chunk { file_index: 0, data: Bytes::from_static(b"toolong") }).await.unwrap();
        assert_eq!(handle.await.unwrap(), Err(ErrorCode::Corrupted));
    }

    #[tokio::test]
    async fn given_chunk_for_next_file_early_when_sinking_then_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, handle) =
            sink_with(vec![(dir.path().join("a"), 2), (dir.path().join("b"), 2)]).await;
        tx.send(SinkInput::Chunk { file_index: 1, data: Bytes::from_static(b"xx") }).await.unwrap();
        assert_eq!(handle.await.unwrap(), Err(ErrorCode::Corrupted));
    }
}
