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
	any::TypeId,
	collections::{HashMap, HashSet},
	fmt,
	future::Future,
	hash::Hash,
	pin::Pin,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, RwLock, Weak,
	},
	time::Duration,
};

use common::{HostAddr, KillSwitch, RuntimeType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
	actor::{ActorFactory, BoxedActor},
	actor_context::ActorContext,
	actor_state::{AtomicLifecycleState, LifecycleState},
	config::OrphanedFailurePolicy,
	dispatcher::{Dispatcher, Nudge},
	envelope::{Envelope, ReplyFuture, ReplySlot},
	error::{ActorError, Fault, FaultKind},
	mailbox::{MailboxKind, RejectionPolicy},
	message::AnyMessage,
	metrics::RUNTIME_METRICS,
	remote::WireEnvelope,
	scheduler::{ReceiveTimeout, TimerHandle},
	spawn_builder::SpawnContext,
	stm::{TransactionMode, TransactionSet},
	supervision::{self, FaultPolicy, LifecyclePolicy, RestartCounter},
};

/// Globally unique actor identity, assigned at handle creation.
///
/// Stable across restarts and across serialization to a remote node, so
/// remote holders keep reaching the logical actor. Never reused after
/// stop.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ActorId(Uuid);

impl ActorId {
	pub(crate) fn random() -> ActorId {
		ActorId(Uuid::new_v4())
	}
}

impl fmt::Display for ActorId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		self.0.fmt(f)
	}
}

impl fmt::Debug for ActorId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "ActorId({})", self.0)
	}
}

/// The ambient view of the message being processed, installed by the
/// draining worker for the duration of one handler call.
pub(crate) struct CurrentMessage {
	pub sender: Option<ActorHandle>,
	pub reply_to: Option<ReplySlot>,
	pub transaction_set: Option<TransactionSet>,
}

/// Pre-start configuration of a handle, resolved by the spawn builder.
pub(crate) struct HandleSettings {
	pub tag: Option<String>,
	pub mailbox_kind: MailboxKind,
	pub rejection_policy: RejectionPolicy,
	pub lifecycle: LifecyclePolicy,
	pub fault_policy: Option<FaultPolicy>,
	pub trap_exits: HashSet<FaultKind>,
	pub receive_timeout: Option<Duration>,
	pub reply_timeout: Duration,
	pub remote_location: Option<HostAddr>,
	pub serialize_messages: bool,
	pub kill_switch: KillSwitch,
}

struct LocalState {
	spawn_ctx: SpawnContext,
	factory: ActorFactory,
	instance: tokio::sync::Mutex<Option<BoxedActor>>,
	dispatcher: Arc<dyn Dispatcher>,
	mailbox_kind: MailboxKind,
	rejection_policy: RejectionPolicy,
	serialize_messages: bool,
	reply_timeout: RwLock<Duration>,
	receive_timeout: RwLock<Option<Duration>>,
	receive_timer: Mutex<Option<TimerHandle>>,
	trap_exits: RwLock<HashSet<FaultKind>>,
	fault_policy: RwLock<Option<FaultPolicy>>,
	lifecycle: RwLock<LifecyclePolicy>,
	supervisor: Mutex<Option<WeakActorHandle>>,
	subordinates: Mutex<HashMap<ActorId, ActorHandle>>,
	restart_counter: Mutex<RestartCounter>,
	current_message: Mutex<Option<CurrentMessage>>,
	needs_shutdown: AtomicBool,
	// Short-critical-section guard for lifecycle transitions and link
	// mutations at this node. Never held across user code.
	guard: tokio::sync::Mutex<()>,
	remote_location: RwLock<Option<HostAddr>>,
	home: HostAddr,
	// A child of the quorum's switch, or of the supervisor's for
	// spawn-linked subordinates.
	kill_switch: KillSwitch,
}

struct RemoteState {
	location: HostAddr,
	spawn_ctx: SpawnContext,
}

enum HandleKind {
	Local(Box<LocalState>),
	Remote(RemoteState),
}

struct HandleInner {
	id: ActorId,
	tag: RwLock<String>,
	state: AtomicLifecycleState,
	kind: HandleKind,
}

/// The one externally visible reference to an actor, local or remote.
///
/// Lightweight to clone; compares and hashes by identity. A handle keeps
/// working across restarts: identity, mailbox and queued envelopes
/// survive the replacement of the instance behind it.
pub struct ActorHandle {
	inner: Arc<HandleInner>,
}

impl Clone for ActorHandle {
	fn clone(&self) -> Self {
		ActorHandle { inner: self.inner.clone() }
	}
}

pub struct WeakActorHandle {
	inner: Weak<HandleInner>,
}

impl Clone for WeakActorHandle {
	fn clone(&self) -> Self {
		WeakActorHandle { inner: self.inner.clone() }
	}
}

impl WeakActorHandle {
	pub fn upgrade(&self) -> Option<ActorHandle> {
		self.inner.upgrade().map(|inner| ActorHandle { inner })
	}
}

impl fmt::Debug for ActorHandle {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_tuple("ActorHandle").field(&self.tag()).field(&self.id()).finish()
	}
}

impl PartialEq for ActorHandle {
	fn eq(&self, other: &Self) -> bool {
		self.id() == other.id()
	}
}

impl Eq for ActorHandle {}

impl Hash for ActorHandle {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.id().hash(state)
	}
}

impl ActorHandle {
	pub(crate) fn new_local(
		spawn_ctx: SpawnContext,
		factory: ActorFactory,
		dispatcher: Arc<dyn Dispatcher>,
		settings: HandleSettings,
	) -> ActorHandle {
		let id = ActorId::random();
		let tag = settings.tag.unwrap_or_else(|| id.to_string());
		let home = spawn_ctx.self_address();
		ActorHandle {
			inner: Arc::new(HandleInner {
				id,
				tag: RwLock::new(tag),
				state: AtomicLifecycleState::default(),
				kind: HandleKind::Local(Box::new(LocalState {
					spawn_ctx,
					factory,
					instance: tokio::sync::Mutex::new(None),
					dispatcher,
					mailbox_kind: settings.mailbox_kind,
					rejection_policy: settings.rejection_policy,
					serialize_messages: settings.serialize_messages,
					reply_timeout: RwLock::new(settings.reply_timeout),
					receive_timeout: RwLock::new(settings.receive_timeout),
					receive_timer: Mutex::new(None),
					trap_exits: RwLock::new(settings.trap_exits),
					fault_policy: RwLock::new(settings.fault_policy),
					lifecycle: RwLock::new(settings.lifecycle),
					supervisor: Mutex::new(None),
					subordinates: Mutex::new(HashMap::new()),
					restart_counter: Mutex::new(RestartCounter::default()),
					current_message: Mutex::new(None),
					needs_shutdown: AtomicBool::new(false),
					guard: tokio::sync::Mutex::new(()),
					remote_location: RwLock::new(settings.remote_location),
					home,
					kill_switch: settings.kill_switch,
				})),
			}),
		}
	}

	/// Builds a proxy for an actor owned by another node. The proxy has
	/// no mailbox, dispatcher or instance: it only forwards.
	pub(crate) fn new_remote(
		spawn_ctx: SpawnContext,
		id: ActorId,
		location: HostAddr,
	) -> ActorHandle {
		let state = AtomicLifecycleState::default();
		state.start();
		ActorHandle {
			inner: Arc::new(HandleInner {
				id,
				tag: RwLock::new(id.to_string()),
				state,
				kind: HandleKind::Remote(RemoteState { location, spawn_ctx }),
			}),
		}
	}

	fn local(&self) -> Result<&LocalState, ActorError> {
		match &self.inner.kind {
			HandleKind::Local(local) => Ok(local),
			HandleKind::Remote(_) => Err(ActorError::RemoteOperationUnsupported),
		}
	}

	fn local_expect(&self) -> &LocalState {
		match &self.inner.kind {
			HandleKind::Local(local) => local,
			HandleKind::Remote(_) => {
				panic!("the runtime never drives invoke/supervision on a remote proxy")
			},
		}
	}

	pub fn downgrade(&self) -> WeakActorHandle {
		WeakActorHandle { inner: Arc::downgrade(&self.inner) }
	}

	pub fn id(&self) -> ActorId {
		self.inner.id
	}

	pub fn tag(&self) -> String {
		self.inner.tag.read().unwrap().clone()
	}

	/// Changes the user-visible label. Tags are not unique.
	pub fn set_tag(&self, tag: impl ToString) {
		let tag = tag.to_string();
		*self.inner.tag.write().unwrap() = tag.clone();
		if let Ok(local) = self.local() {
			local.spawn_ctx.registry.retag(&self.id(), tag);
		}
	}

	pub fn state(&self) -> LifecycleState {
		self.inner.state.get()
	}

	pub fn is_running(&self) -> bool {
		self.state() == LifecycleState::Running
	}

	/// The node that owns the actor.
	pub fn home_address(&self) -> HostAddr {
		match &self.inner.kind {
			HandleKind::Local(local) => local
				.remote_location
				.read()
				.unwrap()
				.clone()
				.unwrap_or_else(|| local.home.clone()),
			HandleKind::Remote(remote) => remote.location.clone(),
		}
	}

	/// Non-empty iff this handle routes over the transport.
	pub fn remote_location(&self) -> Option<HostAddr> {
		match &self.inner.kind {
			HandleKind::Local(local) => local.remote_location.read().unwrap().clone(),
			HandleKind::Remote(remote) => Some(remote.location.clone()),
		}
	}

	pub fn mailbox_size(&self) -> usize {
		match &self.inner.kind {
			HandleKind::Local(local) => local.dispatcher.mailbox_size(self),
			HandleKind::Remote(_) => 0,
		}
	}

	// ---- pre-start configuration ------------------------------------

	pub fn set_reply_timeout(&self, timeout: Duration) -> Result<(), ActorError> {
		*self.local()?.reply_timeout.write().unwrap() = timeout;
		Ok(())
	}

	pub fn set_receive_timeout(&self, timeout: Option<Duration>) -> Result<(), ActorError> {
		*self.local()?.receive_timeout.write().unwrap() = timeout;
		self.reschedule_receive_timeout();
		Ok(())
	}

	/// Adds a fault kind to the trap-exit set: as a supervisor, this
	/// actor will handle that kind instead of escalating it.
	pub fn trap_exit(&self, kind: FaultKind) -> Result<(), ActorError> {
		self.local()?.trap_exits.write().unwrap().insert(kind);
		Ok(())
	}

	pub fn set_fault_policy(&self, policy: FaultPolicy) -> Result<(), ActorError> {
		*self.local()?.fault_policy.write().unwrap() = Some(policy);
		Ok(())
	}

	pub fn set_lifecycle(&self, lifecycle: LifecyclePolicy) -> Result<(), ActorError> {
		*self.local()?.lifecycle.write().unwrap() = lifecycle;
		Ok(())
	}

	/// Routes this actor to a remote node. Only legal before start, or
	/// while the actor is being restarted.
	pub fn make_remote(&self, location: HostAddr) -> Result<(), ActorError> {
		let local = self.local()?;
		match self.state() {
			LifecycleState::NotStarted | LifecycleState::BeingRestarted => {
				*local.remote_location.write().unwrap() = Some(location);
				Ok(())
			},
			_ => Err(ActorError::InvalidConfig(
				"make_remote is only legal before start or during a restart".to_string(),
			)),
		}
	}

	// ---- lifecycle ---------------------------------------------------

	pub async fn start(&self) -> Result<(), ActorError> {
		let local = self.local()?;
		let _guard = local.guard.lock().await;
		match self.state() {
			LifecycleState::Stopped => return Err(ActorError::Stopped),
			LifecycleState::Running | LifecycleState::BeingRestarted => return Ok(()),
			LifecycleState::NotStarted => {},
		}
		if let Some(remote_addr) = local.remote_location.read().unwrap().clone() {
			let Some(transport) = local.spawn_ctx.transport.clone() else {
				return Err(ActorError::InvalidConfig(
					"no remote transport installed, cannot start a remote-routed actor"
						.to_string(),
				));
			};
			self.inner.state.start();
			transport.register_handle(&remote_addr, self.id());
			local.spawn_ctx.registry.register(self);
			info!(actor = %self.tag(), id = %self.id(), location = %remote_addr, "remote-actor-started");
			return Ok(());
		}
		local.dispatcher.register(self, local.mailbox_kind, local.rejection_policy)?;
		{
			// The instance lock is taken before the state flips to
			// Running: an envelope racing in behind `start` blocks on it
			// instead of finding an empty instance slot.
			let mut instance_slot = local.instance.lock().await;
			let mut instance = local.factory.build();
			self.inner.state.start();
			let ctx = ActorContext::new(self.clone());
			if let Err(init_error) = instance.init(&ctx).await {
				self.inner.state.stop();
				for leftover in local.dispatcher.unregister(self) {
					leftover.complete_exceptionally(ActorError::Stopped);
				}
				return Err(ActorError::InitializationFailed(Arc::new(init_error)));
			}
			*instance_slot = Some(instance);
		}
		local.spawn_ctx.registry.register(self);
		self.reschedule_receive_timeout();
		RUNTIME_METRICS.actor_starts.inc();
		info!(actor = %self.tag(), id = %self.id(), dispatcher = %local.dispatcher.name(), "actor-started");
		Ok(())
	}

	/// Stops the actor: subordinates first, then the actor itself.
	///
	/// Undrained envelopes are discarded; their reply futures complete
	/// exceptionally with `Stopped`. Stop is terminal and idempotent.
	pub fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), ActorError>> + Send + '_>> {
		Box::pin(self.stop_inner())
	}

	async fn stop_inner(&self) -> Result<(), ActorError> {
		let local = self.local()?;
		{
			let _guard = local.guard.lock().await;
			match self.state() {
				LifecycleState::NotStarted => return Err(ActorError::NotStarted),
				LifecycleState::Stopped => return Ok(()),
				LifecycleState::Running | LifecycleState::BeingRestarted => {},
			}
			self.inner.state.stop();
		}
		info!(actor = %self.tag(), "stopping-actor");
		let subordinates: Vec<ActorHandle> = {
			let mut subordinates = local.subordinates.lock().unwrap();
			subordinates.drain().map(|(_, subordinate)| subordinate).collect()
		};
		for subordinate in subordinates {
			subordinate.clear_supervisor();
			let _ = subordinate.stop().await;
		}
		if let Some(supervisor) = self.supervisor() {
			supervisor.remove_subordinate(&self.id());
		}
		self.clear_supervisor();
		if let Some(timer) = local.receive_timer.lock().unwrap().take() {
			timer.cancel();
		}
		if let Some(remote_addr) = local.remote_location.read().unwrap().clone() {
			if let Some(transport) = &local.spawn_ctx.transport {
				transport.unregister_handle(&remote_addr, self.id());
			}
		} else {
			for leftover in local.dispatcher.unregister(self) {
				leftover.complete_exceptionally(ActorError::Stopped);
			}
		}
		local.spawn_ctx.registry.unregister(&self.id());
		match local.instance.try_lock() {
			Ok(mut instance_slot) => {
				if let Some(instance) = instance_slot.as_mut() {
					let ctx = ActorContext::new(self.clone());
					instance.shutdown(&ctx).await;
				}
				*instance_slot = None;
			},
			Err(_) => {
				// Stop was called from inside the handler: the draining
				// worker runs the shutdown hook once the handler
				// returns.
				local.needs_shutdown.store(true, Ordering::SeqCst);
			},
		}
		RUNTIME_METRICS.actor_stops.inc();
		Ok(())
	}

	// ---- sends -------------------------------------------------------

	/// Fire-and-forget send.
	pub async fn tell<M: Send + 'static>(&self, message: M) -> Result<(), ActorError> {
		let message = self.prepare(AnyMessage::new(message))?;
		self.send_envelope(Envelope::new(message)).await
	}

	/// Fire-and-forget send carrying an explicit sender, so the receiver
	/// can `reply` without a reply future.
	pub async fn tell_from<M: Send + 'static>(
		&self,
		message: M,
		sender: &ActorHandle,
	) -> Result<(), ActorError> {
		let message = self.prepare(AnyMessage::new(message))?;
		self.send_envelope(Envelope::new(message).with_sender(sender.clone())).await
	}

	/// Send expecting a reply; waits up to the handle's default reply
	/// timeout.
	pub async fn ask<M: Send + 'static>(&self, message: M) -> Result<AnyMessage, ActorError> {
		let timeout = match &self.inner.kind {
			HandleKind::Local(local) => *local.reply_timeout.read().unwrap(),
			HandleKind::Remote(remote) => remote.spawn_ctx.config.default_reply_timeout(),
		};
		self.ask_with_timeout(message, timeout).await
	}

	pub async fn ask_with_timeout<M: Send + 'static>(
		&self,
		message: M,
		timeout: Duration,
	) -> Result<AnyMessage, ActorError> {
		let reply_future = self.ask_future(message).await?;
		match tokio::time::timeout(timeout, reply_future).await {
			Ok(reply) => reply,
			Err(_elapsed) => Err(ActorError::AskTimeout),
		}
	}

	/// Send expecting a reply; returns the future instead of waiting.
	pub async fn ask_future<M: Send + 'static>(
		&self,
		message: M,
	) -> Result<ReplyFuture, ActorError> {
		let message = self.prepare(AnyMessage::new(message))?;
		let (envelope, reply_future) = Envelope::new(message).with_reply();
		self.send_envelope(envelope).await?;
		Ok(reply_future)
	}

	/// Attaches a transaction set to a send, so the receiving handler
	/// joins it.
	pub async fn tell_in_transaction<M: Send + 'static>(
		&self,
		message: M,
		transaction_set: TransactionSet,
	) -> Result<(), ActorError> {
		let message = self.prepare(AnyMessage::new(message))?;
		self.send_envelope(Envelope::new(message).with_transaction_set(transaction_set)).await
	}

	/// Completes the current message's reply future, or falls back to a
	/// `tell` to its sender. Only meaningful while a handler call is in
	/// flight on this actor.
	pub async fn reply<M: Send + 'static>(&self, message: M) -> Result<(), ActorError> {
		enum ReplyRoute {
			Slot(ReplySlot),
			Sender(ActorHandle),
		}
		let local = self.local()?;
		let route = {
			let mut current = local.current_message.lock().unwrap();
			let Some(current_message) = current.as_mut() else {
				return Err(ActorError::NoSenderInScope);
			};
			if let Some(reply_to) = current_message.reply_to.take() {
				ReplyRoute::Slot(reply_to)
			} else if let Some(sender) = current_message.sender.clone() {
				ReplyRoute::Sender(sender)
			} else {
				return Err(ActorError::NoSenderInScope);
			}
		};
		match route {
			ReplyRoute::Slot(reply_to) => {
				// The asker may have given up on the reply. Fine.
				let _ = reply_to.send(Ok(AnyMessage::new(message)));
				Ok(())
			},
			ReplyRoute::Sender(sender) => sender.tell(message).await,
		}
	}

	/// Like `tell`, but the target inherits the current message's sender
	/// and reply future, so its eventual `reply` completes the original
	/// caller.
	pub async fn forward<M: Send + 'static>(
		&self,
		target: &ActorHandle,
		message: M,
	) -> Result<(), ActorError> {
		let local = self.local()?;
		let (sender, reply_to, transaction_set) = {
			let mut current = local.current_message.lock().unwrap();
			let Some(current_message) = current.as_mut() else {
				return Err(ActorError::NoSenderInScope);
			};
			(
				current_message.sender.clone(),
				current_message.reply_to.take(),
				current_message.transaction_set.clone(),
			)
		};
		let mut envelope = Envelope::new(AnyMessage::new(message));
		envelope.sender = sender;
		envelope.reply_to = reply_to;
		envelope.transaction_set = transaction_set;
		target.send_envelope(envelope).await
	}

	/// The sender of the message currently being processed, if any.
	pub fn sender(&self) -> Option<ActorHandle> {
		let local = self.local().ok()?;
		let current = local.current_message.lock().unwrap();
		current.as_ref()?.sender.clone()
	}

	/// Applies the `serialize_messages` deep copy.
	fn prepare(&self, message: AnyMessage) -> Result<AnyMessage, ActorError> {
		match &self.inner.kind {
			HandleKind::Local(local) if local.serialize_messages => {
				let codec = &local.spawn_ctx.codec;
				let bytes = codec.encode(&message).map_err(ActorError::serialization)?;
				codec.decode(&bytes).map_err(ActorError::serialization)
			},
			_ => Ok(message),
		}
	}

	pub(crate) async fn send_envelope(&self, envelope: Envelope) -> Result<(), ActorError> {
		match &self.inner.kind {
			HandleKind::Local(local) => match self.state() {
				LifecycleState::NotStarted => Err(ActorError::NotStarted),
				LifecycleState::Stopped => Err(ActorError::Stopped),
				LifecycleState::Running | LifecycleState::BeingRestarted => {
					let remote_addr = local.remote_location.read().unwrap().clone();
					if let Some(remote_addr) = remote_addr {
						self.send_remote(&local.spawn_ctx, remote_addr, envelope).await
					} else {
						local.dispatcher.dispatch(self, envelope).await
					}
				},
			},
			HandleKind::Remote(remote) => {
				let location = remote.location.clone();
				self.send_remote(&remote.spawn_ctx, location, envelope).await
			},
		}
	}

	async fn send_remote(
		&self,
		spawn_ctx: &SpawnContext,
		addr: HostAddr,
		envelope: Envelope,
	) -> Result<(), ActorError> {
		let Some(transport) = spawn_ctx.transport.clone() else {
			return Err(ActorError::InvalidConfig(
				"no remote transport installed, cannot reach a remote actor".to_string(),
			));
		};
		let payload =
			spawn_ctx.codec.encode(&envelope.message).map_err(ActorError::serialization)?;
		let wire = WireEnvelope {
			target: self.id(),
			sender: envelope.sender.as_ref().map(|sender| sender.id()),
			payload,
		};
		debug!(target = %self.tag(), addr = %addr, "remote-send");
		match envelope.reply_to {
			None => transport.send_one_way(&addr, wire).await.map_err(ActorError::transport),
			Some(reply_to) => {
				// Bridge the transport reply into the local reply
				// future. Transport failures surface as its exceptional
				// completion.
				let codec = spawn_ctx.codec.clone();
				RuntimeType::NonBlocking.get_runtime_handle().spawn(async move {
					let completion = match transport.send_expecting_reply(&addr, wire).await {
						Ok(reply_bytes) =>
							codec.decode(&reply_bytes).map_err(ActorError::serialization),
						Err(transport_error) => Err(ActorError::transport(transport_error)),
					};
					let _ = reply_to.send(completion);
				});
				Ok(())
			},
		}
	}

	// ---- link graph --------------------------------------------------

	/// Installs this actor as `other`'s supervisor.
	///
	/// A subordinate has at most one supervisor: linking an already
	/// supervised actor is a linkage error.
	pub async fn link(&self, other: &ActorHandle) -> Result<(), ActorError> {
		let local = self.local()?;
		let other_local = other.local()?;
		let _guard = local.guard.lock().await;
		{
			let mut supervisor_slot = other_local.supervisor.lock().unwrap();
			let already_supervised = supervisor_slot
				.as_ref()
				.and_then(|supervisor| supervisor.upgrade())
				.is_some();
			if already_supervised {
				return Err(crate::error::LinkageError::AlreadySupervised(other.id()).into());
			}
			*supervisor_slot = Some(self.downgrade());
		}
		local.subordinates.lock().unwrap().insert(other.id(), other.clone());
		debug!(supervisor = %self.tag(), subordinate = %other.tag(), "link");
		Ok(())
	}

	pub async fn unlink(&self, other: &ActorHandle) -> Result<(), ActorError> {
		let local = self.local()?;
		let _guard = local.guard.lock().await;
		if local.subordinates.lock().unwrap().remove(&other.id()).is_none() {
			return Err(crate::error::LinkageError::NotLinked(other.id()).into());
		}
		other.clear_supervisor();
		debug!(supervisor = %self.tag(), subordinate = %other.tag(), "unlink");
		Ok(())
	}

	/// Links, then starts: the subordinate is supervised from its very
	/// first message.
	pub async fn start_link(&self, other: &ActorHandle) -> Result<(), ActorError> {
		self.link(other).await?;
		if let Err(start_error) = other.start().await {
			let _ = self.unlink(other).await;
			return Err(start_error);
		}
		Ok(())
	}

	/// Builds and starts a new actor in the same quorum.
	pub async fn spawn<A, F>(&self, make: F) -> Result<ActorHandle, ActorError>
	where
		A: crate::actor::Actor,
		F: Fn() -> A + Send + Sync + 'static,
	{
		self.local()?.spawn_ctx.builder().spawn(make).await
	}

	/// Builds, links and starts a new subordinate, atomically from the
	/// holder's perspective. The subordinate's kill switch is a child of
	/// this actor's, so `kill` cascades down the supervision tree.
	pub async fn spawn_link<A, F>(&self, make: F) -> Result<ActorHandle, ActorError>
	where
		A: crate::actor::Actor,
		F: Fn() -> A + Send + Sync + 'static,
	{
		let local = self.local()?;
		let subordinate = local
			.spawn_ctx
			.builder()
			.set_kill_switch(local.kill_switch.child())
			.build(make);
		self.start_link(&subordinate).await?;
		Ok(subordinate)
	}

	pub async fn spawn_remote<A, F>(
		&self,
		location: HostAddr,
		make: F,
	) -> Result<ActorHandle, ActorError>
	where
		A: crate::actor::Actor,
		F: Fn() -> A + Send + Sync + 'static,
	{
		self.local()?.spawn_ctx.builder().set_remote_location(location).spawn(make).await
	}

	pub async fn spawn_link_remote<A, F>(
		&self,
		location: HostAddr,
		make: F,
	) -> Result<ActorHandle, ActorError>
	where
		A: crate::actor::Actor,
		F: Fn() -> A + Send + Sync + 'static,
	{
		let local = self.local()?;
		let subordinate = local
			.spawn_ctx
			.builder()
			.set_kill_switch(local.kill_switch.child())
			.set_remote_location(location)
			.build(make);
		self.start_link(&subordinate).await?;
		Ok(subordinate)
	}

	/// This actor's kill switch. Spawn-linked subordinates hold children
	/// of it.
	pub fn kill_switch(&self) -> Result<&KillSwitch, ActorError> {
		Ok(&self.local()?.kill_switch)
	}

	/// Kills this actor and its spawn-linked subtree: envelopes reaching
	/// their handlers from here on are discarded, their reply futures
	/// completed with `Stopped`. Unlike `stop`, no shutdown hooks run.
	pub fn kill(&self) -> Result<(), ActorError> {
		self.local()?.kill_switch.kill();
		Ok(())
	}

	// ---- invocation --------------------------------------------------

	/// Entry point called by a dispatcher worker holding the processing
	/// token.
	pub(crate) async fn invoke(&self, envelope: Envelope) {
		let local = self.local_expect();
		if self.state() == LifecycleState::Stopped {
			debug!(actor = %self.tag(), "discarding-envelope-after-stop");
			envelope.complete_exceptionally(ActorError::Stopped);
			return;
		}
		if local.kill_switch.is_dead() {
			debug!(actor = %self.tag(), "discarding-envelope-after-kill");
			envelope.complete_exceptionally(ActorError::Stopped);
			return;
		}
		if envelope.message.is::<Nudge>() {
			return;
		}
		let Envelope { message, sender, reply_to, transaction_set } = envelope;
		if let Some(transaction_set_ref) = &transaction_set {
			if let Err(join_error) = local
				.spawn_ctx
				.stm
				.join_transaction(transaction_set_ref, TransactionMode::Requires)
			{
				local.spawn_ctx.stm.abort(transaction_set_ref);
				let fault = Fault::new(FaultKind::TransactionAborted, join_error);
				if let Some(reply_to) = reply_to {
					let _ = reply_to.send(Err(ActorError::from(fault.clone())));
				}
				supervision::handle_failure(self.clone(), fault).await;
				return;
			}
		}
		*local.current_message.lock().unwrap() = Some(CurrentMessage {
			sender,
			reply_to,
			transaction_set: transaction_set.clone(),
		});
		let ctx = ActorContext::new(self.clone());
		let receive_result = {
			let mut instance_slot = local.instance.lock().await;
			match instance_slot.as_mut() {
				Some(instance) => instance.receive(message, &ctx).await,
				None => {
					debug!(actor = %self.tag(), "no-instance-discarding-envelope");
					Ok(())
				},
			}
		};
		if local.needs_shutdown.swap(false, Ordering::SeqCst) {
			let mut instance_slot = local.instance.lock().await;
			if let Some(instance) = instance_slot.as_mut() {
				instance.shutdown(&ctx).await;
			}
			*instance_slot = None;
		}
		match receive_result {
			Ok(()) => {
				if let Some(transaction_set_ref) = &transaction_set {
					local.spawn_ctx.stm.commit(transaction_set_ref);
				}
				*local.current_message.lock().unwrap() = None;
				self.reschedule_receive_timeout();
			},
			Err(handler_error) => {
				let fault = Fault::from_handler_error(handler_error);
				if let Some(transaction_set_ref) = &transaction_set {
					local.spawn_ctx.stm.abort(transaction_set_ref);
				}
				let leftover = local.current_message.lock().unwrap().take();
				if let Some(current_message) = leftover {
					if let Some(reply_to) = current_message.reply_to {
						let _ = reply_to.send(Err(ActorError::from(fault.clone())));
					}
				}
				supervision::handle_failure(self.clone(), fault).await;
			},
		}
	}

	// ---- supervision plumbing ---------------------------------------

	pub(crate) fn notify<M: Send + fmt::Debug + 'static>(&self, message: M) {
		let Ok(local) = self.local() else {
			return;
		};
		if self.state() == LifecycleState::Stopped {
			return;
		}
		debug!(actor = %self.tag(), msg = ?message, "system-notify");
		local.dispatcher.dispatch_system(self, Envelope::new(AnyMessage::new(message)));
	}

	pub(crate) fn supervisor(&self) -> Option<ActorHandle> {
		let local = self.local().ok()?;
		let supervisor_slot = local.supervisor.lock().unwrap();
		supervisor_slot.as_ref()?.upgrade()
	}

	pub(crate) fn clear_supervisor(&self) {
		if let Ok(local) = self.local() {
			*local.supervisor.lock().unwrap() = None;
		}
	}

	pub(crate) fn remove_subordinate(&self, subordinate_id: &ActorId) {
		if let Ok(local) = self.local() {
			local.subordinates.lock().unwrap().remove(subordinate_id);
		}
	}

	pub(crate) fn subordinates_snapshot(&self) -> Vec<ActorHandle> {
		match self.local() {
			Ok(local) => local.subordinates.lock().unwrap().values().cloned().collect(),
			Err(_) => Vec::new(),
		}
	}

	pub(crate) fn has_no_subordinates(&self) -> bool {
		self.subordinates_snapshot().is_empty()
	}

	pub fn fault_policy(&self) -> Option<FaultPolicy> {
		*self.local().ok()?.fault_policy.read().unwrap()
	}

	pub fn lifecycle(&self) -> LifecyclePolicy {
		self.local().map(|local| *local.lifecycle.read().unwrap()).unwrap_or_default()
	}

	pub(crate) fn traps(&self, kind: FaultKind) -> bool {
		self.local()
			.map(|local| local.trap_exits.read().unwrap().contains(&kind))
			.unwrap_or(false)
	}

	pub(crate) fn bump_restart_counter(&self, window: Duration) -> u32 {
		self.local_expect().restart_counter.lock().unwrap().bump(window)
	}

	pub(crate) fn orphaned_failure_policy(&self) -> OrphanedFailurePolicy {
		self.local_expect().spawn_ctx.config.orphaned_failure_policy
	}

	pub(crate) fn begin_restart(&self) -> bool {
		self.inner.state.begin_restart()
	}

	pub(crate) fn finish_restart(&self) -> bool {
		self.inner.state.finish_restart()
	}

	pub(crate) fn instance_slot(&self) -> &tokio::sync::Mutex<Option<BoxedActor>> {
		&self.local_expect().instance
	}

	pub(crate) fn build_instance(&self) -> BoxedActor {
		self.local_expect().factory.build()
	}

	pub(crate) fn impl_type(&self) -> Option<TypeId> {
		self.local().ok().map(|local| local.factory.impl_type())
	}

	pub(crate) fn spawn_ctx(&self) -> Result<&SpawnContext, ActorError> {
		Ok(&self.local()?.spawn_ctx)
	}

	/// Cancels the pending receive-timeout one-shot and schedules a
	/// fresh one, called after every processed message.
	pub(crate) fn reschedule_receive_timeout(&self) {
		let Ok(local) = self.local() else {
			return;
		};
		let timeout_opt = *local.receive_timeout.read().unwrap();
		let mut timer_slot = local.receive_timer.lock().unwrap();
		if let Some(previous_timer) = timer_slot.take() {
			previous_timer.cancel();
		}
		let Some(timeout) = timeout_opt else {
			return;
		};
		let weak_handle = self.downgrade();
		let timer = local.spawn_ctx.scheduler.schedule_once(timeout, move || {
			if let Some(handle) = weak_handle.upgrade() {
				if handle.state().is_alive() {
					handle.notify(ReceiveTimeout);
				}
			}
		});
		*timer_slot = Some(timer);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	};

	use super::*;
	use crate::{
		quorum::Quorum,
		tests::{
			CollectingActor, EchoActor, ForwardingActor, PongActor, Probe, ReplyingActor,
			SilentActor, TimeoutCountingActor,
		},
	};

	#[tokio::test]
	async fn test_forward_preserves_the_original_reply_future() {
		let quorum = Quorum::new();
		let final_target = quorum.spawn(|| PongActor).await.unwrap();
		let forwarder_target = final_target.clone();
		let forwarder = quorum
			.spawn(move || ForwardingActor { target: forwarder_target.clone() })
			.await
			.unwrap();
		// Asking the forwarder gets the final target's reply.
		let reply = forwarder.ask("ping".to_string()).await.unwrap();
		assert_eq!(reply.downcast::<String>().unwrap(), "pong");
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_reply_falls_back_to_the_sender_handle() {
		let quorum = Quorum::new();
		let seen = Arc::new(Mutex::new(Vec::new()));
		let collector_seen = seen.clone();
		let collector =
			quorum.spawn(move || CollectingActor { seen: collector_seen.clone() }).await.unwrap();
		let replier = quorum.spawn(|| ReplyingActor).await.unwrap();
		// No reply future: the reply routes as a tell to the sender.
		replier.tell_from(Probe, &collector).await.unwrap();
		tokio::time::sleep(Duration::from_millis(200)).await;
		assert_eq!(*seen.lock().unwrap(), vec![42]);
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_reply_outside_a_handler_has_no_sender_in_scope() {
		let quorum = Quorum::new();
		let echo = quorum.spawn(|| EchoActor).await.unwrap();
		assert!(matches!(
			echo.reply("out of nowhere".to_string()).await,
			Err(ActorError::NoSenderInScope)
		));
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_link_rejects_a_second_supervisor() {
		let quorum = Quorum::new();
		let first_supervisor = quorum.spawn(|| SilentActor).await.unwrap();
		let second_supervisor = quorum.spawn(|| SilentActor).await.unwrap();
		let subordinate = quorum.spawn(|| SilentActor).await.unwrap();
		first_supervisor.link(&subordinate).await.unwrap();
		let link_error = second_supervisor.link(&subordinate).await.unwrap_err();
		assert!(matches!(
			link_error,
			ActorError::Linkage(crate::error::LinkageError::AlreadySupervised(id))
				if id == subordinate.id()
		));
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_link_unlink_leaves_the_graph_unchanged() {
		let quorum = Quorum::new();
		let supervisor = quorum.spawn(|| SilentActor).await.unwrap();
		let subordinate = quorum.spawn(|| SilentActor).await.unwrap();
		supervisor.link(&subordinate).await.unwrap();
		supervisor.unlink(&subordinate).await.unwrap();
		assert!(supervisor.has_no_subordinates());
		assert!(subordinate.supervisor().is_none());
		// Unlinking a non-link is a linkage error.
		assert!(matches!(
			supervisor.unlink(&subordinate).await.unwrap_err(),
			ActorError::Linkage(crate::error::LinkageError::NotLinked(_))
		));
		// And the subordinate is linkable again.
		supervisor.link(&subordinate).await.unwrap();
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_stop_cascades_to_subordinates() {
		let quorum = Quorum::new();
		let supervisor = quorum.spawn(|| SilentActor).await.unwrap();
		let subordinate = quorum.spawn(|| SilentActor).await.unwrap();
		let grandchild = quorum.spawn(|| SilentActor).await.unwrap();
		supervisor.link(&subordinate).await.unwrap();
		subordinate.link(&grandchild).await.unwrap();
		supervisor.stop().await.unwrap();
		assert_eq!(subordinate.state(), LifecycleState::Stopped);
		assert_eq!(grandchild.state(), LifecycleState::Stopped);
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_make_remote_is_only_legal_before_start() {
		let quorum = Quorum::new();
		let unstarted = quorum.actor_of(|| SilentActor);
		unstarted.make_remote(HostAddr::new("10.0.0.7", 7626)).unwrap();
		assert_eq!(unstarted.remote_location(), Some(HostAddr::new("10.0.0.7", 7626)));
		let started = quorum.spawn(|| SilentActor).await.unwrap();
		assert!(matches!(
			started.make_remote(HostAddr::new("10.0.0.7", 7626)),
			Err(ActorError::InvalidConfig(_))
		));
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_kill_cascades_to_spawn_linked_subordinates() {
		let quorum = Quorum::new();
		let supervisor = quorum.spawn(|| SilentActor).await.unwrap();
		let subordinate = supervisor.spawn_link(|| EchoActor).await.unwrap();
		let unrelated = quorum.spawn(|| EchoActor).await.unwrap();
		supervisor.kill().unwrap();
		// The subordinate's switch is a child of the supervisor's.
		assert!(subordinate.kill_switch().unwrap().is_dead());
		assert!(matches!(
			subordinate.ask("hi".to_string()).await,
			Err(ActorError::Stopped)
		));
		// Actors outside the supervision tree are untouched.
		let reply = unrelated.ask("hi".to_string()).await.unwrap();
		assert_eq!(reply.downcast::<String>().unwrap(), "HI");
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_receive_timeout_fires_on_idle_mailbox() {
		let quorum = Quorum::new();
		let timeouts = Arc::new(AtomicUsize::new(0));
		let actor_timeouts = timeouts.clone();
		let _idler = quorum
			.spawn_builder()
			.set_receive_timeout(Duration::from_millis(50))
			.spawn(move || TimeoutCountingActor { timeouts: actor_timeouts.clone() })
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_millis(300)).await;
		assert!(timeouts.load(Ordering::SeqCst) >= 1);
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_ask_reply_roundtrip_returns_the_exact_value() {
		let quorum = Quorum::new();
		let echo = quorum.spawn(|| EchoActor).await.unwrap();
		let reply = echo.ask("exact".to_string()).await.unwrap();
		assert_eq!(reply.downcast::<String>().unwrap(), "EXACT");
		quorum.shutdown().await;
	}
}
