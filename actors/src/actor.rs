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

use std::any::{type_name, TypeId};

use async_trait::async_trait;

use crate::{actor_context::ActorContext, error::Fault, message::AnyMessage};

/// An actor has an internal state and processes a stream of messages,
/// one at a time.
///
/// While processing a message, the actor typically
/// - updates its state;
/// - emits one or more messages to other actors, or replies to its
///   sender.
///
/// Returning an error from `receive` hands the fault to the supervision
/// engine: depending on the supervisor's policy the actor is restarted,
/// stopped, or the fault is escalated.
#[async_trait]
pub trait Actor: Send + 'static {
	/// Processes one message.
	///
	/// The context gives access to the actor's own handle, the sender of
	/// the current message, and the reply and forward operations.
	async fn receive(&mut self, message: AnyMessage, ctx: &ActorContext) -> anyhow::Result<()>;

	/// Called once before the first message, when the actor starts.
	///
	/// An error here fails the start: the actor never runs.
	async fn init(&mut self, _ctx: &ActorContext) -> anyhow::Result<()> {
		Ok(())
	}

	/// Called on the failing instance right before it is replaced on
	/// restart.
	async fn pre_restart(&mut self, _cause: &Fault, _ctx: &ActorContext) {}

	/// Called on the fresh instance right after it replaced the failing
	/// one.
	async fn post_restart(&mut self, _cause: &Fault, _ctx: &ActorContext) {}

	/// Called once when the actor stops, after the last message.
	async fn shutdown(&mut self, _ctx: &ActorContext) {}

	/// Hook for rebuilding transactional references after a restart.
	/// Runs right after `init` on the replacement instance.
	fn init_transactional_state(&mut self) {}

	/// A name identifying the type of actor, for logs and default tags.
	/// It does not need to be instance-unique.
	fn name(&self) -> String {
		short_type_name::<Self>().to_string()
	}
}

pub(crate) type BoxedActor = Box<dyn Actor>;

/// The recipe used to build an actor instance.
///
/// It is stored on the handle at creation and replayed on every restart:
/// a restart never reuses the failed instance.
pub(crate) struct ActorFactory {
	make: Box<dyn Fn() -> BoxedActor + Send + Sync>,
	impl_type: TypeId,
	impl_name: &'static str,
}

impl ActorFactory {
	pub fn new<A, F>(make: F) -> ActorFactory
	where
		A: Actor,
		F: Fn() -> A + Send + Sync + 'static,
	{
		ActorFactory {
			make: Box::new(move || Box::new(make())),
			impl_type: TypeId::of::<A>(),
			impl_name: short_type_name::<A>(),
		}
	}

	pub fn build(&self) -> BoxedActor {
		(self.make)()
	}

	pub fn impl_type(&self) -> TypeId {
		self.impl_type
	}

	pub fn impl_name(&self) -> &'static str {
		self.impl_name
	}
}

/// `some::module::EchoActor` -> `EchoActor`.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
	let full_name = type_name::<T>();
	full_name.rsplit("::").next().unwrap_or(full_name)
}

#[cfg(test)]
mod tests {
	use super::*;

	struct SomeActor;

	#[async_trait]
	impl Actor for SomeActor {
		async fn receive(
			&mut self,
			_message: AnyMessage,
			_ctx: &ActorContext,
		) -> anyhow::Result<()> {
			Ok(())
		}
	}

	#[test]
	fn test_default_name_is_short_type_name() {
		assert_eq!(SomeActor.name(), "SomeActor");
	}

	#[test]
	fn test_factory_keeps_impl_identity() {
		let factory = ActorFactory::new(|| SomeActor);
		assert_eq!(factory.impl_type(), TypeId::of::<SomeActor>());
		assert_eq!(factory.impl_name(), "SomeActor");
		let _instance = factory.build();
	}
}
