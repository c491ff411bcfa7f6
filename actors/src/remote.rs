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

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use common::HostAddr;
use serde::{Deserialize, Serialize};

use crate::{codec::MessageCodec, handle::ActorId, registry::ActorRegistry};

/// A serialized envelope crossing node boundaries.
///
/// The sender travels as a bare identity: reply routing across nodes
/// goes through `send_expecting_reply`, not through a sender handle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireEnvelope {
	pub target: ActorId,
	pub sender: Option<ActorId>,
	pub payload: Vec<u8>,
}

/// The wire transport collaborator.
///
/// The runtime hands it encoded envelopes and registration events; the
/// transport owns connections, framing and retries. Failures surface as
/// errors here and become exceptional reply completions upstream.
#[async_trait]
pub trait RemoteTransport: Send + Sync + 'static {
	async fn send_one_way(&self, addr: &HostAddr, envelope: WireEnvelope) -> anyhow::Result<()>;

	async fn send_expecting_reply(
		&self,
		addr: &HostAddr,
		envelope: WireEnvelope,
	) -> anyhow::Result<Vec<u8>>;

	/// Announces that this node serves `id` at `addr`.
	fn register_handle(&self, addr: &HostAddr, id: ActorId);

	fn unregister_handle(&self, addr: &HostAddr, id: ActorId);

	fn self_address(&self) -> HostAddr;
}

/// Resolves an inbound wire envelope against the registry and delivers
/// it. Transport implementations call this on their receive path.
///
/// Returns the encoded reply for ask-style envelopes, `None` for
/// one-way deliveries.
pub async fn deliver_wire(
	registry: &ActorRegistry,
	codec: &dyn MessageCodec,
	wire: WireEnvelope,
	expect_reply: bool,
	reply_timeout: Duration,
) -> anyhow::Result<Option<Vec<u8>>> {
	let target = registry
		.find_by_id(&wire.target)
		.with_context(|| format!("no live actor registered under {}", wire.target))?;
	let message = codec.decode(&wire.payload)?;
	if expect_reply {
		let reply = target
			.ask_with_timeout(message, reply_timeout)
			.await
			.with_context(|| format!("ask on {} failed", wire.target))?;
		let reply_bytes = codec.encode(&reply)?;
		Ok(Some(reply_bytes))
	} else {
		target.tell(message).await.with_context(|| format!("tell on {} failed", wire.target))?;
		Ok(None)
	}
}

/// In-process transport for tests: "remote" sends resolve against a
/// peer registry, exercising the whole encode/resolve/decode path
/// without sockets.
#[cfg(any(test, feature = "testsuite"))]
pub struct LoopbackTransport {
	self_addr: HostAddr,
	peer_registry: ActorRegistry,
	peer_codec: std::sync::Arc<dyn MessageCodec>,
	reply_timeout: Duration,
	pub registered: std::sync::Mutex<Vec<(HostAddr, ActorId)>>,
}

#[cfg(any(test, feature = "testsuite"))]
impl LoopbackTransport {
	pub fn new(
		self_addr: HostAddr,
		peer_registry: ActorRegistry,
		peer_codec: std::sync::Arc<dyn MessageCodec>,
		reply_timeout: Duration,
	) -> LoopbackTransport {
		LoopbackTransport {
			self_addr,
			peer_registry,
			peer_codec,
			reply_timeout,
			registered: std::sync::Mutex::new(Vec::new()),
		}
	}
}

#[cfg(any(test, feature = "testsuite"))]
#[async_trait]
impl RemoteTransport for LoopbackTransport {
	async fn send_one_way(&self, _addr: &HostAddr, envelope: WireEnvelope) -> anyhow::Result<()> {
		deliver_wire(&self.peer_registry, &*self.peer_codec, envelope, false, self.reply_timeout)
			.await?;
		Ok(())
	}

	async fn send_expecting_reply(
		&self,
		_addr: &HostAddr,
		envelope: WireEnvelope,
	) -> anyhow::Result<Vec<u8>> {
		let reply_bytes =
			deliver_wire(&self.peer_registry, &*self.peer_codec, envelope, true, self.reply_timeout)
				.await?
				.context("expected a reply")?;
		Ok(reply_bytes)
	}

	fn register_handle(&self, addr: &HostAddr, id: ActorId) {
		self.registered.lock().unwrap().push((addr.clone(), id));
	}

	fn unregister_handle(&self, addr: &HostAddr, id: ActorId) {
		self.registered.lock().unwrap().retain(|(known_addr, known_id)| {
			known_addr != addr || *known_id != id
		});
	}

	fn self_address(&self) -> HostAddr {
		self.self_addr.clone()
	}
}

#[cfg(test)]
mod tests {
	use std::{sync::Arc, time::Duration};

	use super::*;
	use crate::{
		codec::TypedJsonCodec, error::ActorError, quorum::Quorum, tests::EchoActor,
	};

	fn shared_codec() -> Arc<TypedJsonCodec> {
		Arc::new(TypedJsonCodec::new().register::<String>().register::<u64>())
	}

	/// Two quorums wired through the loopback transport: node a holds a
	/// proxy, node b owns the actor.
	async fn two_nodes() -> (Quorum, Quorum, HostAddr) {
		let codec = shared_codec();
		let addr_b = HostAddr::new("node-b", 7626);
		let node_b = Quorum::builder().set_codec(codec.clone()).build();
		let transport = LoopbackTransport::new(
			HostAddr::new("node-a", 7626),
			node_b.registry().clone(),
			codec.clone(),
			Duration::from_secs(5),
		);
		let node_a = Quorum::builder()
			.set_codec(codec)
			.set_transport(Arc::new(transport))
			.build();
		(node_a, node_b, addr_b)
	}

	#[tokio::test]
	async fn test_proxy_ask_reaches_the_owning_node() {
		let (node_a, node_b, addr_b) = two_nodes().await;
		let echo = node_b.spawn(|| EchoActor).await.unwrap();
		let proxy = node_a.remote_actor(echo.id(), addr_b);
		assert_eq!(proxy.id(), echo.id());
		let reply = proxy.ask("over the wire".to_string()).await.unwrap();
		assert_eq!(reply.downcast::<String>().unwrap(), "OVER THE WIRE");
		node_b.shutdown().await;
		node_a.shutdown().await;
	}

	#[tokio::test]
	async fn test_proxy_tell_delivers_one_way() {
		let (node_a, node_b, addr_b) = two_nodes().await;
		let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
		let actor_seen = seen.clone();
		let collector = node_b
			.spawn(move || crate::tests::CollectingActor { seen: actor_seen.clone() })
			.await
			.unwrap();
		let proxy = node_a.remote_actor(collector.id(), addr_b);
		proxy.tell(7u64).await.unwrap();
		tokio::time::sleep(Duration::from_millis(200)).await;
		assert_eq!(*seen.lock().unwrap(), vec![7]);
		// Payload types the codec does not know fail at the call site.
		assert!(matches!(proxy.tell(true).await, Err(ActorError::Serialization(_))));
		node_b.shutdown().await;
		node_a.shutdown().await;
	}

	#[tokio::test]
	async fn test_lifecycle_operations_are_unsupported_on_a_proxy() {
		let (node_a, node_b, addr_b) = two_nodes().await;
		let echo = node_b.spawn(|| EchoActor).await.unwrap();
		let proxy = node_a.remote_actor(echo.id(), addr_b);
		assert!(matches!(proxy.start().await, Err(ActorError::RemoteOperationUnsupported)));
		assert!(matches!(proxy.stop().await, Err(ActorError::RemoteOperationUnsupported)));
		assert!(matches!(
			proxy.set_receive_timeout(Some(Duration::from_secs(1))),
			Err(ActorError::RemoteOperationUnsupported)
		));
		let other = node_a.spawn(|| EchoActor).await.unwrap();
		assert!(matches!(
			proxy.link(&other).await,
			Err(ActorError::RemoteOperationUnsupported)
		));
		node_b.shutdown().await;
		node_a.shutdown().await;
	}

	#[tokio::test]
	async fn test_proxy_ask_to_a_stopped_actor_fails() {
		let (node_a, node_b, addr_b) = two_nodes().await;
		let echo = node_b.spawn(|| EchoActor).await.unwrap();
		let proxy = node_a.remote_actor(echo.id(), addr_b);
		echo.stop().await.unwrap();
		// The target is no longer resolvable on the owning node: the
		// transport failure completes the reply future exceptionally.
		assert!(matches!(
			proxy.ask("anyone?".to_string()).await,
			Err(ActorError::Transport(_))
		));
		node_b.shutdown().await;
		node_a.shutdown().await;
	}

	#[tokio::test]
	async fn test_make_remote_registers_with_the_transport() {
		let codec = shared_codec();
		let peer = Quorum::builder().set_codec(codec.clone()).build();
		let transport = Arc::new(LoopbackTransport::new(
			HostAddr::new("node-a", 7626),
			peer.registry().clone(),
			codec.clone(),
			Duration::from_secs(5),
		));
		let quorum = Quorum::builder()
			.set_codec(codec)
			.set_transport(transport.clone())
			.build();
		let remote_addr = HostAddr::new("node-b", 7626);
		let handle = quorum.actor_of(|| EchoActor);
		handle.make_remote(remote_addr.clone()).unwrap();
		handle.start().await.unwrap();
		assert_eq!(
			*transport.registered.lock().unwrap(),
			vec![(remote_addr.clone(), handle.id())]
		);
		handle.stop().await.unwrap();
		assert!(transport.registered.lock().unwrap().is_empty());
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_deliver_wire_rejects_unknown_targets() {
		let codec = shared_codec();
		let quorum = Quorum::builder().set_codec(codec.clone()).build();
		let payload = codec.encode(&crate::AnyMessage::new("lost".to_string())).unwrap();
		let wire = WireEnvelope { target: ActorId::random(), sender: None, payload };
		let delivery = deliver_wire(
			quorum.registry(),
			&*codec,
			wire,
			false,
			Duration::from_millis(100),
		)
		.await;
		assert!(delivery.is_err());
		quorum.shutdown().await;
	}
}
