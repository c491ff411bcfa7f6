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

use std::sync::Arc;

use common::HostAddr;
use tracing::info;

use crate::{
	actor::Actor,
	codec::{MessageCodec, NoopCodec},
	config::RuntimeConfig,
	error::ActorError,
	handle::{ActorHandle, ActorId},
	registry::ActorRegistry,
	remote::RemoteTransport,
	scheduler::start_scheduler,
	spawn_builder::{ActorBuilder, SpawnContext},
	stm::{NoopStm, Stm},
};

/// The top-level context in which actors are spawned.
///
/// It is *not* a singleton. A typical application has one quorum hosting
/// all of its actors, but unit tests each run their own and therefore
/// execute in parallel.
pub struct Quorum {
	spawn_ctx: SpawnContext,
}

/// Assembles a quorum with its collaborators. Everything defaults to the
/// in-process no-op implementations.
pub struct QuorumBuilder {
	config: RuntimeConfig,
	stm: Arc<dyn Stm>,
	transport: Option<Arc<dyn RemoteTransport>>,
	codec: Arc<dyn MessageCodec>,
}

impl QuorumBuilder {
	pub fn set_config(mut self, config: RuntimeConfig) -> Self {
		self.config = config;
		self
	}

	pub fn set_stm(mut self, stm: Arc<dyn Stm>) -> Self {
		self.stm = stm;
		self
	}

	pub fn set_transport(mut self, transport: Arc<dyn RemoteTransport>) -> Self {
		self.transport = Some(transport);
		self
	}

	pub fn set_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
		self.codec = codec;
		self
	}

	pub fn build(self) -> Quorum {
		let scheduler = start_scheduler();
		let spawn_ctx =
			SpawnContext::new(self.config, scheduler, self.stm, self.transport, self.codec);
		Quorum { spawn_ctx }
	}
}

impl Default for Quorum {
	fn default() -> Quorum {
		Quorum::new()
	}
}

impl Quorum {
	pub fn new() -> Quorum {
		Quorum::builder().build()
	}

	pub fn with_config(config: RuntimeConfig) -> Quorum {
		Quorum::builder().set_config(config).build()
	}

	pub fn builder() -> QuorumBuilder {
		QuorumBuilder {
			config: RuntimeConfig::default(),
			stm: Arc::new(NoopStm),
			transport: None,
			codec: Arc::new(NoopCodec),
		}
	}

	pub fn spawn_ctx(&self) -> &SpawnContext {
		&self.spawn_ctx
	}

	pub fn spawn_builder(&self) -> ActorBuilder {
		self.spawn_ctx.builder()
	}

	/// Builds a handle without starting it. The caller configures it and
	/// calls `start`.
	pub fn actor_of<A, F>(&self, make: F) -> ActorHandle
	where
		A: Actor,
		F: Fn() -> A + Send + Sync + 'static,
	{
		self.spawn_builder().build(make)
	}

	/// Builds and starts an actor with the quorum defaults.
	pub async fn spawn<A, F>(&self, make: F) -> Result<ActorHandle, ActorError>
	where
		A: Actor,
		F: Fn() -> A + Send + Sync + 'static,
	{
		self.spawn_builder().spawn(make).await
	}

	/// A proxy handle for an actor owned by another node.
	pub fn remote_actor(&self, id: ActorId, location: HostAddr) -> ActorHandle {
		ActorHandle::new_remote(self.spawn_ctx.clone(), id, location)
	}

	pub fn registry(&self) -> &ActorRegistry {
		&self.spawn_ctx.registry
	}

	pub fn find_by_id(&self, id: &ActorId) -> Option<ActorHandle> {
		self.registry().find_by_id(id)
	}

	pub fn find_by_tag(&self, tag: &str) -> Vec<ActorHandle> {
		self.registry().find_by_tag(tag)
	}

	pub fn find_by_impl<A: Actor>(&self) -> Vec<ActorHandle> {
		self.registry().find_by_impl::<A>()
	}

	/// Activates the quorum kill switch. Every actor's switch is a child
	/// of it, so the kill cascades: envelopes reaching any handler from
	/// here on are discarded. Unlike `shutdown`, no shutdown hooks run.
	pub fn kill(&self) {
		self.spawn_ctx.kill_switch.kill();
	}

	/// Stops every registered actor, supervisors before their trees,
	/// then the dispatchers' own workers.
	pub async fn shutdown(&self) {
		info!("quorum-shutdown");
		for handle in self.registry().all_alive() {
			if handle.supervisor().is_none() {
				let _ = handle.stop().await;
			}
		}
		// Anything left was supervised by an already stopped actor, or
		// joined the registry mid-shutdown.
		for handle in self.registry().all_alive() {
			let _ = handle.stop().await;
		}
		self.spawn_ctx.kill_switch.kill();
		self.spawn_ctx.dispatchers.shutdown_all();
	}
}

impl Drop for Quorum {
	fn drop(&mut self) {
		self.spawn_ctx.kill_switch.kill();
	}
}

#[cfg(test)]
mod tests {
	use std::time::{Duration, Instant};

	use super::*;
	use crate::{
		codec::TypedJsonCodec,
		tests::{CollectingActor, EchoActor, SilentActor},
	};

	#[tokio::test]
	async fn test_ask_echo() {
		let quorum = Quorum::new();
		let echo = quorum.spawn(|| EchoActor).await.unwrap();
		let reply = echo.ask("hi".to_string()).await.unwrap();
		assert_eq!(reply.downcast::<String>().unwrap(), "HI");
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_ask_times_out_on_silent_actor() {
		let quorum = Quorum::new();
		let silent = quorum.spawn(|| SilentActor).await.unwrap();
		let before_ask = Instant::now();
		let reply = silent.ask_with_timeout("anyone?".to_string(), Duration::from_millis(50)).await;
		assert!(matches!(reply, Err(ActorError::AskTimeout)));
		assert!(before_ask.elapsed() >= Duration::from_millis(50));
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_tell_before_start_and_after_stop() {
		let quorum = Quorum::new();
		let handle = quorum.actor_of(|| SilentActor);
		assert!(matches!(handle.tell(1u64).await, Err(ActorError::NotStarted)));
		handle.start().await.unwrap();
		handle.tell(1u64).await.unwrap();
		handle.stop().await.unwrap();
		assert!(matches!(handle.tell(2u64).await, Err(ActorError::Stopped)));
		// Stop is idempotent.
		handle.stop().await.unwrap();
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_stop_completes_pending_asks_exceptionally() {
		let quorum = Quorum::new();
		let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
		let actor_seen = seen.clone();
		let slow = quorum
			.spawn(move || crate::tests::SlowStartActor {
				seen: actor_seen.clone(),
				first_message_delay: Duration::from_millis(300),
				started: false,
			})
			.await
			.unwrap();
		// First message parks the actor; the second stays queued.
		slow.tell(1u64).await.unwrap();
		tokio::time::sleep(Duration::from_millis(50)).await;
		let pending = slow.ask_future(2u64).await.unwrap();
		slow.stop().await.unwrap();
		assert!(matches!(pending.await, Err(ActorError::Stopped)));
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_registry_lookup_by_id_tag_and_impl() {
		let quorum = Quorum::new();
		let echo =
			quorum.spawn_builder().set_tag("echo-front").spawn(|| EchoActor).await.unwrap();
		let found = quorum.find_by_id(&echo.id()).unwrap();
		assert_eq!(found, echo);
		assert_eq!(quorum.find_by_tag("echo-front").len(), 1);
		assert_eq!(quorum.find_by_impl::<EchoActor>().len(), 1);
		assert!(quorum.find_by_impl::<SilentActor>().is_empty());
		echo.set_tag("echo-back");
		assert!(quorum.find_by_tag("echo-front").is_empty());
		assert_eq!(quorum.find_by_tag("echo-back").len(), 1);
		echo.stop().await.unwrap();
		assert!(quorum.find_by_id(&echo.id()).is_none());
		assert!(quorum.find_by_tag("echo-back").is_empty());
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_shutdown_stops_everything() {
		let quorum = Quorum::new();
		let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
		let collector_seen = seen.clone();
		let collector =
			quorum.spawn(move || CollectingActor { seen: collector_seen.clone() }).await.unwrap();
		let echo = quorum.spawn(|| EchoActor).await.unwrap();
		quorum.shutdown().await;
		assert_eq!(collector.state(), crate::LifecycleState::Stopped);
		assert_eq!(echo.state(), crate::LifecycleState::Stopped);
		assert!(quorum.registry().is_empty());
	}

	#[tokio::test]
	async fn test_kill_discards_envelopes() {
		let quorum = Quorum::new();
		let echo = quorum.spawn(|| EchoActor).await.unwrap();
		quorum.kill();
		let reply = echo.ask("anyone?".to_string()).await;
		assert!(matches!(reply, Err(ActorError::Stopped)));
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_serialize_messages_requires_registered_codec() {
		let config = RuntimeConfig { serialize_messages: true, ..RuntimeConfig::default() };
		let quorum = Quorum::builder()
			.set_config(config)
			.set_codec(Arc::new(TypedJsonCodec::new().register::<String>()))
			.build();
		let echo = quorum.spawn(|| EchoActor).await.unwrap();
		// Registered payloads survive the deep copy.
		let reply = echo.ask("hi".to_string()).await.unwrap();
		assert_eq!(reply.downcast::<String>().unwrap(), "HI");
		// Unregistered payloads are rejected at the call site.
		assert!(matches!(echo.tell(7u64).await, Err(ActorError::Serialization(_))));
		quorum.shutdown().await;
	}
}
