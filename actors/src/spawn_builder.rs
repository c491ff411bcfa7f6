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
	collections::{HashMap, HashSet},
	sync::{Arc, Mutex},
	time::Duration,
};

use common::{HostAddr, KillSwitch};

use crate::{
	actor::{Actor, ActorFactory},
	codec::MessageCodec,
	config::RuntimeConfig,
	dispatcher::{start_dispatcher, Dispatcher, DispatcherKind},
	error::{ActorError, FaultKind},
	handle::{ActorHandle, HandleSettings},
	mailbox::{MailboxKind, RejectionPolicy},
	registry::ActorRegistry,
	remote::RemoteTransport,
	scheduler::SchedulerClient,
	stm::Stm,
	supervision::{FaultPolicy, LifecyclePolicy},
};

/// Lazily started dispatchers, one per kind, shared by every actor of
/// the quorum.
#[derive(Clone, Default)]
pub(crate) struct DispatcherTable {
	inner: Arc<Mutex<HashMap<DispatcherKind, Arc<dyn Dispatcher>>>>,
}

impl DispatcherTable {
	pub fn get_or_start(&self, kind: DispatcherKind, throughput: usize) -> Arc<dyn Dispatcher> {
		let mut dispatchers = self.inner.lock().unwrap();
		dispatchers.entry(kind).or_insert_with(|| start_dispatcher(kind, throughput)).clone()
	}

	pub fn shutdown_all(&self) {
		let dispatchers = self.inner.lock().unwrap();
		for dispatcher in dispatchers.values() {
			dispatcher.shutdown();
		}
	}
}

/// Everything a handle needs from its quorum, cheap to clone.
///
/// Handles keep a spawn context instead of a reference to the quorum
/// itself, so actors can spawn children without reaching back to the
/// top-level object.
#[derive(Clone)]
pub struct SpawnContext {
	pub(crate) config: Arc<RuntimeConfig>,
	pub(crate) registry: ActorRegistry,
	pub(crate) scheduler: SchedulerClient,
	pub(crate) dispatchers: DispatcherTable,
	pub(crate) stm: Arc<dyn Stm>,
	pub(crate) transport: Option<Arc<dyn RemoteTransport>>,
	pub(crate) codec: Arc<dyn MessageCodec>,
	pub(crate) kill_switch: KillSwitch,
}

impl SpawnContext {
	pub(crate) fn new(
		config: RuntimeConfig,
		scheduler: SchedulerClient,
		stm: Arc<dyn Stm>,
		transport: Option<Arc<dyn RemoteTransport>>,
		codec: Arc<dyn MessageCodec>,
	) -> SpawnContext {
		SpawnContext {
			config: Arc::new(config),
			registry: ActorRegistry::default(),
			scheduler,
			dispatchers: DispatcherTable::default(),
			stm,
			transport,
			codec,
			kill_switch: KillSwitch::default(),
		}
	}

	pub fn builder(&self) -> ActorBuilder {
		ActorBuilder::new(self.clone())
	}

	pub fn registry(&self) -> &ActorRegistry {
		&self.registry
	}

	/// The address of this node, as reported by the transport; a
	/// placeholder loopback address when the quorum has no transport.
	pub(crate) fn self_address(&self) -> HostAddr {
		self.transport
			.as_ref()
			.map(|transport| transport.self_address())
			.unwrap_or_else(|| HostAddr::new("127.0.0.1", 0))
	}
}

/// Pre-start configuration of one actor. Every option not set falls
/// back to the quorum config.
pub struct ActorBuilder {
	spawn_ctx: SpawnContext,
	tag: Option<String>,
	dispatcher_kind: Option<DispatcherKind>,
	mailbox_kind: Option<MailboxKind>,
	rejection_policy: Option<RejectionPolicy>,
	lifecycle: Option<LifecyclePolicy>,
	fault_policy: Option<FaultPolicy>,
	trap_exits: HashSet<FaultKind>,
	receive_timeout: Option<Duration>,
	reply_timeout: Option<Duration>,
	remote_location: Option<HostAddr>,
	kill_switch: Option<KillSwitch>,
}

impl ActorBuilder {
	pub(crate) fn new(spawn_ctx: SpawnContext) -> ActorBuilder {
		ActorBuilder {
			spawn_ctx,
			tag: None,
			dispatcher_kind: None,
			mailbox_kind: None,
			rejection_policy: None,
			lifecycle: None,
			fault_policy: None,
			trap_exits: HashSet::new(),
			receive_timeout: None,
			reply_timeout: None,
			remote_location: None,
			kill_switch: None,
		}
	}

	pub fn set_tag(mut self, tag: impl ToString) -> Self {
		self.tag = Some(tag.to_string());
		self
	}

	pub fn set_dispatcher(mut self, kind: DispatcherKind) -> Self {
		self.dispatcher_kind = Some(kind);
		self
	}

	pub fn set_mailbox(mut self, kind: MailboxKind) -> Self {
		self.mailbox_kind = Some(kind);
		self
	}

	pub fn set_rejection_policy(mut self, policy: RejectionPolicy) -> Self {
		self.rejection_policy = Some(policy);
		self
	}

	pub fn set_lifecycle(mut self, lifecycle: LifecyclePolicy) -> Self {
		self.lifecycle = Some(lifecycle);
		self
	}

	pub fn set_fault_policy(mut self, policy: FaultPolicy) -> Self {
		self.fault_policy = Some(policy);
		self
	}

	/// Adds a fault kind to the trap-exit set of the spawned actor.
	pub fn set_trap_exit(mut self, kind: FaultKind) -> Self {
		self.trap_exits.insert(kind);
		self
	}

	pub fn set_receive_timeout(mut self, timeout: Duration) -> Self {
		self.receive_timeout = Some(timeout);
		self
	}

	pub fn set_reply_timeout(mut self, timeout: Duration) -> Self {
		self.reply_timeout = Some(timeout);
		self
	}

	/// Routes the spawned actor to a remote node from the start.
	pub fn set_remote_location(mut self, location: HostAddr) -> Self {
		self.remote_location = Some(location);
		self
	}

	/// Sets a specific kill switch for the actor.
	///
	/// By default, the actor gets a fresh child of the quorum's switch.
	/// `spawn_link` passes a child of the supervisor's switch instead,
	/// so kills cascade down the supervision tree.
	pub fn set_kill_switch(mut self, kill_switch: KillSwitch) -> Self {
		self.kill_switch = Some(kill_switch);
		self
	}

	/// Builds the handle without starting it.
	pub fn build<A, F>(self, make: F) -> ActorHandle
	where
		A: Actor,
		F: Fn() -> A + Send + Sync + 'static,
	{
		let config = self.spawn_ctx.config.clone();
		let dispatcher_kind = self.dispatcher_kind.unwrap_or(config.default_dispatcher);
		let dispatcher = self.spawn_ctx.dispatchers.get_or_start(dispatcher_kind, config.throughput);
		let factory = ActorFactory::new(make);
		let tag = self.tag;
		let kill_switch =
			self.kill_switch.unwrap_or_else(|| self.spawn_ctx.kill_switch.child());
		let settings = HandleSettings {
			tag,
			mailbox_kind: self.mailbox_kind.unwrap_or(config.mailbox),
			rejection_policy: self.rejection_policy.unwrap_or(config.rejection_policy),
			lifecycle: self.lifecycle.unwrap_or(config.default_lifecycle),
			fault_policy: self.fault_policy,
			trap_exits: self.trap_exits,
			receive_timeout: self.receive_timeout,
			reply_timeout: self.reply_timeout.unwrap_or_else(|| config.default_reply_timeout()),
			remote_location: self.remote_location,
			serialize_messages: config.serialize_messages,
			kill_switch,
		};
		ActorHandle::new_local(self.spawn_ctx, factory, dispatcher, settings)
	}

	/// Builds and starts: the atomic construct-and-start variant.
	pub async fn spawn<A, F>(self, make: F) -> Result<ActorHandle, ActorError>
	where
		A: Actor,
		F: Fn() -> A + Send + Sync + 'static,
	{
		let handle = self.build(make);
		handle.start().await?;
		Ok(handle)
	}
}
