// Copyright (C) 2023 QuerentAI LLC.
// This file is part of Querent.

// The Licensed Work is licensed under the Business Source License 1.1 (BSL 1.1).
// You may use this file in compliance with the BSL 1.1, subject to the following restrictions:
// 1. You may not use the Licensed Work for AI-related services, database services,
//    or any service or product offering that provides database, big data, or analytics
//    services to third parties unless explicitly authorized by QuerentAI LLC.
// 2. For more details, see the LICENSE file or visit https://mariadb.com/bsl11/.

// For inquiries about alternative licensing arrangements, please contact contact@querent.xyz.

// The Licensed Work is provided "AS IS", WITHOUT WARRANTY OF ANY KIND, express or implied,
// including but not limited to the warranties of merchantability, fitness for a particular purpose,
// and non-infringement. See the Business Source License for more details.

// This software includes code developed by QuerentAI LLC (https://querent.xyz).

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
};

use async_trait::async_trait;
use common::{new_quid, RuntimeType};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
	actor_state::LifecycleState,
	envelope::Envelope,
	error::ActorError,
	handle::{ActorHandle, ActorId},
	mailbox::{EnqueueError, Mailbox, MailboxKind, RejectionPolicy},
	message::AnyMessage,
	metrics::RUNTIME_METRICS,
};

/// No-op system message whose only effect is to wake a drain loop stuck
/// waiting on an empty mailbox, so it can notice a stop.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Nudge;

/// The scheduling strategies an actor can be registered with.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatcherKind {
	/// One dedicated OS thread per actor. Strongest isolation.
	ThreadBased,
	/// Every wake-up spawns a drain task on a shared pool.
	ExecutorEventDriven,
	/// All actors share one worker thread, one envelope at a time.
	CooperativeSingleThread,
	/// Shared pool of workers fed by a queue of ready mailboxes.
	#[default]
	CooperativePool,
	/// Like the shared pool, but a given actor always drains on the same
	/// worker thread. For selector-style io integrations.
	Pinned,
}

/// A dispatcher owns execution resources and drives mailbox drains.
///
/// It also owns the mailboxes themselves, keyed by actor id: handles
/// only keep a `(dispatcher, id)` pair, which breaks the
/// handle/mailbox/dispatcher reference cycle.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
	fn name(&self) -> &str;

	/// Admits an actor and allocates its mailbox.
	fn register(
		&self,
		handle: &ActorHandle,
		mailbox_kind: MailboxKind,
		rejection_policy: RejectionPolicy,
	) -> Result<(), ActorError>;

	/// Removes an actor and frees its mailbox, returning the envelopes
	/// that will never be drained.
	fn unregister(&self, handle: &ActorHandle) -> Vec<Envelope>;

	/// Enqueues a regular envelope and makes sure a drain is scheduled
	/// if the target is not currently processing.
	async fn dispatch(&self, handle: &ActorHandle, envelope: Envelope) -> Result<(), ActorError>;

	/// Enqueues a system envelope. Never subject to the rejection
	/// policy.
	fn dispatch_system(&self, handle: &ActorHandle, envelope: Envelope);

	fn mailbox_size(&self, handle: &ActorHandle) -> usize;

	/// Stops the dispatcher's own workers. Registered actors must have
	/// been stopped first.
	fn shutdown(&self);
}

pub(crate) fn start_dispatcher(kind: DispatcherKind, throughput: usize) -> Arc<dyn Dispatcher> {
	match kind {
		DispatcherKind::ThreadBased => Arc::new(ThreadBasedDispatcher::new()),
		DispatcherKind::ExecutorEventDriven =>
			Arc::new(ExecutorEventDrivenDispatcher::new(throughput)),
		DispatcherKind::CooperativeSingleThread => Arc::new(CooperativeSingleThreadDispatcher::new()),
		DispatcherKind::CooperativePool =>
			Arc::new(CooperativePoolDispatcher::new(throughput, num_cpus::get())),
		DispatcherKind::Pinned => Arc::new(PinnedDispatcher::new(throughput, num_cpus::get())),
	}
}

#[derive(Clone)]
struct MailboxSlot {
	mailbox: Mailbox,
	kind: MailboxKind,
	rejection_policy: RejectionPolicy,
}

#[derive(Clone, Default)]
struct MailboxTable {
	slots: Arc<Mutex<HashMap<ActorId, MailboxSlot>>>,
}

impl MailboxTable {
	fn insert(&self, actor_id: ActorId, slot: MailboxSlot) {
		self.slots.lock().unwrap().insert(actor_id, slot);
	}

	fn remove(&self, actor_id: &ActorId) -> Option<MailboxSlot> {
		self.slots.lock().unwrap().remove(actor_id)
	}

	fn get(&self, actor_id: &ActorId) -> Option<MailboxSlot> {
		self.slots.lock().unwrap().get(actor_id).cloned()
	}

	fn contains(&self, actor_id: &ActorId) -> bool {
		self.slots.lock().unwrap().contains_key(actor_id)
	}
}

/// Applies the rejection policy until the envelope is placed (or gone).
///
/// Returns true iff the envelope made it into the queue.
async fn enqueue_with_policy(
	slot: &MailboxSlot,
	handle: &ActorHandle,
	envelope: Envelope,
) -> Result<bool, ActorError> {
	if slot.kind == MailboxKind::Synchronous {
		// Rendezvous: the send completes when the draining thread takes
		// the envelope.
		return match slot.mailbox.enqueue_wait(envelope).await {
			Ok(()) => Ok(true),
			Err(EnqueueError::Full(envelope)) | Err(EnqueueError::Disconnected(envelope)) => {
				envelope.complete_exceptionally(ActorError::Stopped);
				Err(ActorError::Stopped)
			},
		};
	}
	let mut envelope = envelope;
	loop {
		match slot.mailbox.try_enqueue(envelope) {
			Ok(()) => return Ok(true),
			Err(EnqueueError::Disconnected(rejected)) => {
				rejected.complete_exceptionally(ActorError::Stopped);
				return Err(ActorError::Stopped);
			},
			Err(EnqueueError::Full(rejected)) => match slot.rejection_policy {
				RejectionPolicy::Abort => {
					RUNTIME_METRICS.mailbox_rejections.inc();
					rejected.complete_exceptionally(ActorError::MailboxFull);
					return Err(ActorError::MailboxFull);
				},
				RejectionPolicy::Discard => {
					RUNTIME_METRICS.mailbox_rejections.inc();
					rejected.complete_exceptionally(ActorError::MailboxFull);
					return Ok(false);
				},
				RejectionPolicy::DiscardOldest => {
					if let Some(oldest) = slot.mailbox.discard_oldest() {
						RUNTIME_METRICS.mailbox_rejections.inc();
						oldest.complete_exceptionally(ActorError::MailboxFull);
					}
					envelope = rejected;
				},
				RejectionPolicy::CallerRuns => {
					if slot.mailbox.try_acquire() {
						// The caller makes room itself, one envelope.
						if let Some(next) = slot.mailbox.drain_one() {
							handle.invoke(next).await;
						}
						slot.mailbox.release();
						envelope = rejected;
					} else {
						// The actor is processing: room will open up.
						return match slot.mailbox.enqueue_wait(rejected).await {
							Ok(()) => Ok(true),
							Err(EnqueueError::Full(rejected)) |
							Err(EnqueueError::Disconnected(rejected)) => {
								rejected.complete_exceptionally(ActorError::Stopped);
								Err(ActorError::Stopped)
							},
						};
					}
				},
			},
		}
	}
}

enum DrainOutcome {
	/// Someone else holds the processing token.
	TokenBusy,
	/// The mailbox was left empty.
	Drained,
	/// Envelopes remain: the caller must schedule another drain.
	MoreWork,
}

/// Drains up to `throughput` envelopes under the processing token.
///
/// The release/re-check order is what guarantees no lost wake-up: after
/// the token is released, a non-empty mailbox is re-announced by
/// whoever observes it, either this releaser or a concurrent enqueuer
/// that found the token free.
async fn drain(
	dispatcher_name: &str,
	handle: &ActorHandle,
	mailbox: &Mailbox,
	throughput: usize,
) -> DrainOutcome {
	if !mailbox.try_acquire() {
		return DrainOutcome::TokenBusy;
	}
	for _ in 0..throughput {
		if handle.state() == LifecycleState::Stopped {
			break;
		}
		match mailbox.drain_one() {
			Some(envelope) => {
				handle.invoke(envelope).await;
				RUNTIME_METRICS.messages_processed.with_label_values([dispatcher_name]).inc();
			},
			None => break,
		}
	}
	mailbox.release();
	if mailbox.is_empty() {
		DrainOutcome::Drained
	} else {
		DrainOutcome::MoreWork
	}
}

enum WorkItem {
	Drain(ActorHandle),
	Terminate,
}

async fn worker_loop(
	dispatcher_name: String,
	ready_rx: flume::Receiver<WorkItem>,
	ready_tx: flume::Sender<WorkItem>,
	table: MailboxTable,
	throughput: usize,
) {
	while let Ok(work_item) = ready_rx.recv_async().await {
		let handle = match work_item {
			WorkItem::Terminate => return,
			WorkItem::Drain(handle) => handle,
		};
		let Some(slot) = table.get(&handle.id()) else {
			continue;
		};
		if let DrainOutcome::MoreWork =
			drain(&dispatcher_name, &handle, &slot.mailbox, throughput).await
		{
			let _ = ready_tx.send(WorkItem::Drain(handle));
		}
	}
}

/// Registers the envelope and wakes a drain if the target is idle.
///
/// `wake` is the variant-specific way of announcing a ready mailbox.
async fn dispatch_through_queue(
	table: &MailboxTable,
	handle: &ActorHandle,
	envelope: Envelope,
	wake: impl Fn(ActorHandle),
) -> Result<(), ActorError> {
	let Some(slot) = table.get(&handle.id()) else {
		envelope.complete_exceptionally(ActorError::Stopped);
		return Err(ActorError::Stopped);
	};
	let enqueued = enqueue_with_policy(&slot, handle, envelope).await?;
	if !table.contains(&handle.id()) {
		// Lost the race against unregister: nothing will ever drain this
		// mailbox again.
		for leftover in slot.mailbox.drain_remaining() {
			leftover.complete_exceptionally(ActorError::Stopped);
		}
		return Err(ActorError::Stopped);
	}
	if enqueued && !slot.mailbox.is_processing() {
		wake(handle.clone());
	}
	Ok(())
}

fn dispatch_system_through_queue(
	table: &MailboxTable,
	handle: &ActorHandle,
	envelope: Envelope,
	wake: impl Fn(ActorHandle),
) {
	let Some(slot) = table.get(&handle.id()) else {
		envelope.complete_exceptionally(ActorError::Stopped);
		return;
	};
	slot.mailbox.enqueue_system(envelope);
	if !slot.mailbox.is_processing() {
		wake(handle.clone());
	}
}

/// Default dispatcher: a fixed pool of workers pulling ready mailboxes
/// off a shared MPMC queue.
pub struct CooperativePoolDispatcher {
	name: String,
	table: MailboxTable,
	ready_tx: flume::Sender<WorkItem>,
	num_workers: usize,
}

impl CooperativePoolDispatcher {
	pub fn new(throughput: usize, num_workers: usize) -> Self {
		let name = "pool".to_string();
		let table = MailboxTable::default();
		let (ready_tx, ready_rx) = flume::unbounded();
		let runtime_handle = RuntimeType::Blocking.get_runtime_handle();
		for _ in 0..num_workers {
			runtime_handle.spawn(worker_loop(
				name.clone(),
				ready_rx.clone(),
				ready_tx.clone(),
				table.clone(),
				throughput,
			));
		}
		CooperativePoolDispatcher { name, table, ready_tx, num_workers }
	}
}

#[async_trait]
impl Dispatcher for CooperativePoolDispatcher {
	fn name(&self) -> &str {
		&self.name
	}

	fn register(
		&self,
		handle: &ActorHandle,
		mailbox_kind: MailboxKind,
		rejection_policy: RejectionPolicy,
	) -> Result<(), ActorError> {
		reject_synchronous_mailbox(mailbox_kind, &self.name)?;
		let slot =
			MailboxSlot { mailbox: Mailbox::new(mailbox_kind), kind: mailbox_kind, rejection_policy };
		self.table.insert(handle.id(), slot);
		Ok(())
	}

	fn unregister(&self, handle: &ActorHandle) -> Vec<Envelope> {
		self.table.remove(&handle.id()).map(|slot| slot.mailbox.drain_remaining()).unwrap_or_default()
	}

	async fn dispatch(&self, handle: &ActorHandle, envelope: Envelope) -> Result<(), ActorError> {
		dispatch_through_queue(&self.table, handle, envelope, |handle| {
			let _ = self.ready_tx.send(WorkItem::Drain(handle));
		})
		.await
	}

	fn dispatch_system(&self, handle: &ActorHandle, envelope: Envelope) {
		dispatch_system_through_queue(&self.table, handle, envelope, |handle| {
			let _ = self.ready_tx.send(WorkItem::Drain(handle));
		});
	}

	fn mailbox_size(&self, handle: &ActorHandle) -> usize {
		self.table.get(&handle.id()).map(|slot| slot.mailbox.len()).unwrap_or(0)
	}

	fn shutdown(&self) {
		debug!(dispatcher = %self.name, "dispatcher-shutdown");
		for _ in 0..self.num_workers {
			let _ = self.ready_tx.send(WorkItem::Terminate);
		}
	}
}

/// Spawns a short-lived drain task on every wake-up instead of keeping
/// standing workers.
pub struct ExecutorEventDrivenDispatcher {
	name: String,
	table: MailboxTable,
	throughput: usize,
	runtime_handle: tokio::runtime::Handle,
}

impl ExecutorEventDrivenDispatcher {
	pub fn new(throughput: usize) -> Self {
		ExecutorEventDrivenDispatcher {
			name: "event-driven".to_string(),
			table: MailboxTable::default(),
			throughput,
			runtime_handle: RuntimeType::Blocking.get_runtime_handle(),
		}
	}

	fn spawn_drain(&self, handle: ActorHandle) {
		let dispatcher_name = self.name.clone();
		let table = self.table.clone();
		let throughput = self.throughput;
		self.runtime_handle.spawn(async move {
			loop {
				let Some(slot) = table.get(&handle.id()) else {
					return;
				};
				match drain(&dispatcher_name, &handle, &slot.mailbox, throughput).await {
					DrainOutcome::MoreWork => continue,
					DrainOutcome::TokenBusy | DrainOutcome::Drained => return,
				}
			}
		});
	}
}

#[async_trait]
impl Dispatcher for ExecutorEventDrivenDispatcher {
	fn name(&self) -> &str {
		&self.name
	}

	fn register(
		&self,
		handle: &ActorHandle,
		mailbox_kind: MailboxKind,
		rejection_policy: RejectionPolicy,
	) -> Result<(), ActorError> {
		reject_synchronous_mailbox(mailbox_kind, &self.name)?;
		let slot =
			MailboxSlot { mailbox: Mailbox::new(mailbox_kind), kind: mailbox_kind, rejection_policy };
		self.table.insert(handle.id(), slot);
		Ok(())
	}

	fn unregister(&self, handle: &ActorHandle) -> Vec<Envelope> {
		self.table.remove(&handle.id()).map(|slot| slot.mailbox.drain_remaining()).unwrap_or_default()
	}

	async fn dispatch(&self, handle: &ActorHandle, envelope: Envelope) -> Result<(), ActorError> {
		dispatch_through_queue(&self.table, handle, envelope, |handle| self.spawn_drain(handle))
			.await
	}

	fn dispatch_system(&self, handle: &ActorHandle, envelope: Envelope) {
		dispatch_system_through_queue(&self.table, handle, envelope, |handle| {
			self.spawn_drain(handle)
		});
	}

	fn mailbox_size(&self, handle: &ActorHandle) -> usize {
		self.table.get(&handle.id()).map(|slot| slot.mailbox.len()).unwrap_or(0)
	}

	fn shutdown(&self) {
		debug!(dispatcher = %self.name, "dispatcher-shutdown");
	}
}

/// Every actor shares one worker thread; one envelope per scheduling
/// slot. Deterministic and debuggable.
pub struct CooperativeSingleThreadDispatcher {
	name: String,
	table: MailboxTable,
	ready_tx: flume::Sender<WorkItem>,
}

impl CooperativeSingleThreadDispatcher {
	pub fn new() -> Self {
		let name = "single-thread".to_string();
		let table = MailboxTable::default();
		let (ready_tx, ready_rx) = flume::unbounded();
		let worker_name = new_quid(&name);
		let worker_table = table.clone();
		let worker_ready_tx = ready_tx.clone();
		let worker_dispatcher_name = name.clone();
		std::thread::Builder::new()
			.name(worker_name)
			.spawn(move || {
				let runtime = tokio::runtime::Builder::new_current_thread()
					.enable_all()
					.build()
					.expect("failed to build the single-thread dispatcher runtime");
				runtime.block_on(worker_loop(
					worker_dispatcher_name,
					ready_rx,
					worker_ready_tx,
					worker_table,
					1,
				));
			})
			.expect("failed to spawn the single-thread dispatcher worker");
		CooperativeSingleThreadDispatcher { name, table, ready_tx }
	}
}

impl Default for CooperativeSingleThreadDispatcher {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Dispatcher for CooperativeSingleThreadDispatcher {
	fn name(&self) -> &str {
		&self.name
	}

	fn register(
		&self,
		handle: &ActorHandle,
		mailbox_kind: MailboxKind,
		rejection_policy: RejectionPolicy,
	) -> Result<(), ActorError> {
		reject_synchronous_mailbox(mailbox_kind, &self.name)?;
		let slot =
			MailboxSlot { mailbox: Mailbox::new(mailbox_kind), kind: mailbox_kind, rejection_policy };
		self.table.insert(handle.id(), slot);
		Ok(())
	}

	fn unregister(&self, handle: &ActorHandle) -> Vec<Envelope> {
		self.table.remove(&handle.id()).map(|slot| slot.mailbox.drain_remaining()).unwrap_or_default()
	}

	async fn dispatch(&self, handle: &ActorHandle, envelope: Envelope) -> Result<(), ActorError> {
		dispatch_through_queue(&self.table, handle, envelope, |handle| {
			let _ = self.ready_tx.send(WorkItem::Drain(handle));
		})
		.await
	}

	fn dispatch_system(&self, handle: &ActorHandle, envelope: Envelope) {
		dispatch_system_through_queue(&self.table, handle, envelope, |handle| {
			let _ = self.ready_tx.send(WorkItem::Drain(handle));
		});
	}

	fn mailbox_size(&self, handle: &ActorHandle) -> usize {
		self.table.get(&handle.id()).map(|slot| slot.mailbox.len()).unwrap_or(0)
	}

	fn shutdown(&self) {
		debug!(dispatcher = %self.name, "dispatcher-shutdown");
		let _ = self.ready_tx.send(WorkItem::Terminate);
	}
}

/// One dedicated OS thread per actor, blocking on its mailbox.
///
/// The processing token is trivially held by the dedicated thread for
/// the lifetime of the actor: no other worker ever touches the mailbox.
/// This is also the only dispatcher that supports the rendezvous
/// mailbox.
pub struct ThreadBasedDispatcher {
	name: String,
	table: MailboxTable,
	threads: Mutex<HashMap<ActorId, std::thread::JoinHandle<()>>>,
}

impl ThreadBasedDispatcher {
	pub fn new() -> Self {
		ThreadBasedDispatcher {
			name: "thread-based".to_string(),
			table: MailboxTable::default(),
			threads: Mutex::new(HashMap::new()),
		}
	}
}

impl Default for ThreadBasedDispatcher {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Dispatcher for ThreadBasedDispatcher {
	fn name(&self) -> &str {
		&self.name
	}

	fn register(
		&self,
		handle: &ActorHandle,
		mailbox_kind: MailboxKind,
		rejection_policy: RejectionPolicy,
	) -> Result<(), ActorError> {
		let mailbox = Mailbox::new(mailbox_kind);
		let slot = MailboxSlot { mailbox: mailbox.clone(), kind: mailbox_kind, rejection_policy };
		self.table.insert(handle.id(), slot);
		let dispatcher_name = self.name.clone();
		let thread_handle = handle.clone();
		let thread_name = new_quid(&handle.tag());
		let join_handle = std::thread::Builder::new()
			.name(thread_name)
			.spawn(move || {
				let runtime = tokio::runtime::Builder::new_current_thread()
					.enable_all()
					.build()
					.expect("failed to build a thread-based dispatcher runtime");
				// The dedicated thread owns the token for good.
				let _ = mailbox.try_acquire();
				runtime.block_on(async {
					loop {
						let envelope = mailbox.recv().await;
						if thread_handle.state() == LifecycleState::Stopped {
							envelope.complete_exceptionally(ActorError::Stopped);
							break;
						}
						thread_handle.invoke(envelope).await;
						RUNTIME_METRICS
							.messages_processed
							.with_label_values([dispatcher_name.as_str()])
							.inc();
						if thread_handle.state() == LifecycleState::Stopped {
							break;
						}
					}
					for leftover in mailbox.drain_remaining() {
						leftover.complete_exceptionally(ActorError::Stopped);
					}
				});
				debug!(actor = %thread_handle.tag(), "actor-thread-exit");
			})
			.map_err(|spawn_err| {
				ActorError::InvalidConfig(format!("failed to spawn the actor thread: {spawn_err}"))
			})?;
		self.threads.lock().unwrap().insert(handle.id(), join_handle);
		Ok(())
	}

	fn unregister(&self, handle: &ActorHandle) -> Vec<Envelope> {
		// The dedicated thread finishes the drainage itself: wake it so
		// it observes the stop.
		if let Some(slot) = self.table.remove(&handle.id()) {
			slot.mailbox.enqueue_system(Envelope::new(AnyMessage::new(Nudge)));
		}
		self.threads.lock().unwrap().remove(&handle.id());
		Vec::new()
	}

	async fn dispatch(&self, handle: &ActorHandle, envelope: Envelope) -> Result<(), ActorError> {
		let Some(slot) = self.table.get(&handle.id()) else {
			envelope.complete_exceptionally(ActorError::Stopped);
			return Err(ActorError::Stopped);
		};
		// No wake handshake: the dedicated thread is parked in `recv`.
		enqueue_with_policy(&slot, handle, envelope).await.map(|_| ())
	}

	fn dispatch_system(&self, handle: &ActorHandle, envelope: Envelope) {
		let Some(slot) = self.table.get(&handle.id()) else {
			envelope.complete_exceptionally(ActorError::Stopped);
			return;
		};
		slot.mailbox.enqueue_system(envelope);
	}

	fn mailbox_size(&self, handle: &ActorHandle) -> usize {
		self.table.get(&handle.id()).map(|slot| slot.mailbox.len()).unwrap_or(0)
	}

	fn shutdown(&self) {
		debug!(dispatcher = %self.name, "dispatcher-shutdown");
	}
}

/// Shared pool with per-worker queues: a given actor is bound to one
/// worker at registration and always drains there.
pub struct PinnedDispatcher {
	name: String,
	table: MailboxTable,
	workers: Vec<flume::Sender<WorkItem>>,
	assignments: Mutex<HashMap<ActorId, usize>>,
	next_worker: AtomicUsize,
}

impl PinnedDispatcher {
	pub fn new(throughput: usize, num_workers: usize) -> Self {
		let name = "pinned".to_string();
		let table = MailboxTable::default();
		let mut workers = Vec::with_capacity(num_workers);
		for _ in 0..num_workers {
			let (ready_tx, ready_rx) = flume::unbounded();
			let worker_name = new_quid(&name);
			let worker_table = table.clone();
			let worker_ready_tx = ready_tx.clone();
			let worker_dispatcher_name = name.clone();
			std::thread::Builder::new()
				.name(worker_name)
				.spawn(move || {
					let runtime = tokio::runtime::Builder::new_current_thread()
						.enable_all()
						.build()
						.expect("failed to build a pinned dispatcher runtime");
					runtime.block_on(worker_loop(
						worker_dispatcher_name,
						ready_rx,
						worker_ready_tx,
						worker_table,
						throughput,
					));
				})
				.expect("failed to spawn a pinned dispatcher worker");
			workers.push(ready_tx);
		}
		PinnedDispatcher {
			name,
			table,
			workers,
			assignments: Mutex::new(HashMap::new()),
			next_worker: AtomicUsize::new(0),
		}
	}

	fn worker_of(&self, actor_id: &ActorId) -> Option<flume::Sender<WorkItem>> {
		let assignments = self.assignments.lock().unwrap();
		assignments.get(actor_id).map(|worker_index| self.workers[*worker_index].clone())
	}
}

#[async_trait]
impl Dispatcher for PinnedDispatcher {
	fn name(&self) -> &str {
		&self.name
	}

	fn register(
		&self,
		handle: &ActorHandle,
		mailbox_kind: MailboxKind,
		rejection_policy: RejectionPolicy,
	) -> Result<(), ActorError> {
		reject_synchronous_mailbox(mailbox_kind, &self.name)?;
		let worker_index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
		self.assignments.lock().unwrap().insert(handle.id(), worker_index);
		let slot =
			MailboxSlot { mailbox: Mailbox::new(mailbox_kind), kind: mailbox_kind, rejection_policy };
		self.table.insert(handle.id(), slot);
		Ok(())
	}

	fn unregister(&self, handle: &ActorHandle) -> Vec<Envelope> {
		self.assignments.lock().unwrap().remove(&handle.id());
		self.table.remove(&handle.id()).map(|slot| slot.mailbox.drain_remaining()).unwrap_or_default()
	}

	async fn dispatch(&self, handle: &ActorHandle, envelope: Envelope) -> Result<(), ActorError> {
		let Some(ready_tx) = self.worker_of(&handle.id()) else {
			envelope.complete_exceptionally(ActorError::Stopped);
			return Err(ActorError::Stopped);
		};
		dispatch_through_queue(&self.table, handle, envelope, |handle| {
			let _ = ready_tx.send(WorkItem::Drain(handle));
		})
		.await
	}

	fn dispatch_system(&self, handle: &ActorHandle, envelope: Envelope) {
		let Some(ready_tx) = self.worker_of(&handle.id()) else {
			envelope.complete_exceptionally(ActorError::Stopped);
			return;
		};
		dispatch_system_through_queue(&self.table, handle, envelope, |handle| {
			let _ = ready_tx.send(WorkItem::Drain(handle));
		});
	}

	fn mailbox_size(&self, handle: &ActorHandle) -> usize {
		self.table.get(&handle.id()).map(|slot| slot.mailbox.len()).unwrap_or(0)
	}

	fn shutdown(&self) {
		debug!(dispatcher = %self.name, "dispatcher-shutdown");
		for ready_tx in &self.workers {
			let _ = ready_tx.send(WorkItem::Terminate);
		}
	}
}

fn reject_synchronous_mailbox(
	mailbox_kind: MailboxKind,
	dispatcher_name: &str,
) -> Result<(), ActorError> {
	if mailbox_kind == MailboxKind::Synchronous {
		return Err(ActorError::InvalidConfig(format!(
			"the synchronous mailbox requires the thread-based dispatcher, not `{dispatcher_name}`"
		)));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::{
		sync::{
			atomic::{AtomicUsize, Ordering},
			Arc, Mutex,
		},
		time::Duration,
	};

	use super::*;
	use crate::{
		quorum::Quorum,
		tests::{CollectingActor, ConcurrencyProbeActor, EchoActor, SlowStartActor,
			ThreadRecordingActor},
	};

	const ALL_DISPATCHERS: [DispatcherKind; 5] = [
		DispatcherKind::ThreadBased,
		DispatcherKind::ExecutorEventDriven,
		DispatcherKind::CooperativeSingleThread,
		DispatcherKind::CooperativePool,
		DispatcherKind::Pinned,
	];

	#[tokio::test]
	async fn test_ask_roundtrip_on_every_dispatcher() {
		let quorum = Quorum::new();
		for kind in ALL_DISPATCHERS {
			let echo =
				quorum.spawn_builder().set_dispatcher(kind).spawn(|| EchoActor).await.unwrap();
			let reply = echo.ask("hello".to_string()).await.unwrap();
			assert_eq!(reply.downcast::<String>().unwrap(), "HELLO", "dispatcher {kind:?}");
			echo.stop().await.unwrap();
		}
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_sends_are_delivered_in_fifo_order() {
		let quorum = Quorum::new();
		for kind in ALL_DISPATCHERS {
			let seen = Arc::new(Mutex::new(Vec::new()));
			let actor_seen = seen.clone();
			let collector = quorum
				.spawn_builder()
				.set_dispatcher(kind)
				.spawn(move || CollectingActor { seen: actor_seen.clone() })
				.await
				.unwrap();
			for sequence_number in 0..100u64 {
				collector.tell(sequence_number).await.unwrap();
			}
			for _ in 0..50 {
				if seen.lock().unwrap().len() == 100 {
					break;
				}
				tokio::time::sleep(Duration::from_millis(20)).await;
			}
			let seen_order = seen.lock().unwrap().clone();
			assert_eq!(seen_order, (0..100u64).collect::<Vec<_>>(), "dispatcher {kind:?}");
			collector.stop().await.unwrap();
		}
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_processing_token_serializes_handler_calls() {
		let quorum = Quorum::new();
		let in_flight = Arc::new(AtomicUsize::new(0));
		let max_in_flight = Arc::new(AtomicUsize::new(0));
		let actor_in_flight = in_flight.clone();
		let actor_max = max_in_flight.clone();
		let probe = quorum
			.spawn(move || ConcurrencyProbeActor {
				in_flight: actor_in_flight.clone(),
				max_in_flight: actor_max.clone(),
			})
			.await
			.unwrap();
		for sequence_number in 0..200u64 {
			probe.tell(sequence_number).await.unwrap();
		}
		tokio::time::sleep(Duration::from_millis(500)).await;
		assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_pinned_actor_always_runs_on_the_same_thread() {
		let quorum = Quorum::new();
		for kind in [DispatcherKind::Pinned, DispatcherKind::ThreadBased] {
			let threads = Arc::new(Mutex::new(std::collections::HashSet::new()));
			let actor_threads = threads.clone();
			let recorder = quorum
				.spawn_builder()
				.set_dispatcher(kind)
				.spawn(move || ThreadRecordingActor { threads: actor_threads.clone() })
				.await
				.unwrap();
			for sequence_number in 0..50u64 {
				recorder.tell(sequence_number).await.unwrap();
			}
			tokio::time::sleep(Duration::from_millis(300)).await;
			assert_eq!(threads.lock().unwrap().len(), 1, "dispatcher {kind:?}");
			recorder.stop().await.unwrap();
		}
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_bounded_mailbox_aborts_when_saturated() {
		let quorum = Quorum::new();
		let seen = Arc::new(Mutex::new(Vec::new()));
		let actor_seen = seen.clone();
		let slow = quorum
			.spawn_builder()
			.set_mailbox(MailboxKind::BoundedLinked { capacity: 1 })
			.set_rejection_policy(RejectionPolicy::Abort)
			.spawn(move || SlowStartActor {
				seen: actor_seen.clone(),
				first_message_delay: Duration::from_millis(400),
				started: false,
			})
			.await
			.unwrap();
		// First message occupies the handler, second fills the queue.
		slow.tell(1u64).await.unwrap();
		tokio::time::sleep(Duration::from_millis(100)).await;
		slow.tell(2u64).await.unwrap();
		assert!(matches!(slow.tell(3u64).await, Err(ActorError::MailboxFull)));
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_discard_oldest_keeps_the_newest_envelope() {
		let quorum = Quorum::new();
		let seen = Arc::new(Mutex::new(Vec::new()));
		let actor_seen = seen.clone();
		let slow = quorum
			.spawn_builder()
			.set_mailbox(MailboxKind::BoundedLinked { capacity: 1 })
			.set_rejection_policy(RejectionPolicy::DiscardOldest)
			.spawn(move || SlowStartActor {
				seen: actor_seen.clone(),
				first_message_delay: Duration::from_millis(400),
				started: false,
			})
			.await
			.unwrap();
		slow.tell(1u64).await.unwrap();
		tokio::time::sleep(Duration::from_millis(100)).await;
		slow.tell(2u64).await.unwrap();
		// Saturated: 2 is dropped in favor of 3.
		slow.tell(3u64).await.unwrap();
		tokio::time::sleep(Duration::from_millis(600)).await;
		assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_synchronous_mailbox_requires_thread_based() {
		let quorum = Quorum::new();
		let spawn_res = quorum
			.spawn_builder()
			.set_mailbox(MailboxKind::Synchronous)
			.spawn(|| EchoActor)
			.await;
		assert!(matches!(spawn_res, Err(ActorError::InvalidConfig(_))));
		// The thread-based dispatcher supports the rendezvous handoff.
		let echo = quorum
			.spawn_builder()
			.set_dispatcher(DispatcherKind::ThreadBased)
			.set_mailbox(MailboxKind::Synchronous)
			.spawn(|| EchoActor)
			.await
			.unwrap();
		let reply = echo.ask("sync".to_string()).await.unwrap();
		assert_eq!(reply.downcast::<String>().unwrap(), "SYNC");
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_mailbox_size_is_observable() {
		let quorum = Quorum::new();
		let seen = Arc::new(Mutex::new(Vec::new()));
		let actor_seen = seen.clone();
		let slow = quorum
			.spawn(move || SlowStartActor {
				seen: actor_seen.clone(),
				first_message_delay: Duration::from_millis(300),
				started: false,
			})
			.await
			.unwrap();
		slow.tell(1u64).await.unwrap();
		tokio::time::sleep(Duration::from_millis(50)).await;
		slow.tell(2u64).await.unwrap();
		slow.tell(3u64).await.unwrap();
		assert!(slow.mailbox_size() >= 2);
		quorum.shutdown().await;
	}
}
