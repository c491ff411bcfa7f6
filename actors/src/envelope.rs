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
	fmt,
	future::Future,
	pin::Pin,
	task::{Context, Poll},
};

use tokio::sync::oneshot;

use crate::{
	error::ActorError, handle::ActorHandle, message::AnyMessage, stm::TransactionSet,
};

pub(crate) type ReplySlot = oneshot::Sender<Result<AnyMessage, ActorError>>;

/// The unit flowing through mailboxes.
///
/// An envelope is created by the sender, owned by the mailbox until it is
/// drained, and consumed exactly once by `invoke`.
pub struct Envelope {
	pub(crate) message: AnyMessage,
	pub(crate) sender: Option<ActorHandle>,
	pub(crate) reply_to: Option<ReplySlot>,
	pub(crate) transaction_set: Option<TransactionSet>,
}

impl Envelope {
	pub(crate) fn new(message: AnyMessage) -> Envelope {
		Envelope { message, sender: None, reply_to: None, transaction_set: None }
	}

	pub(crate) fn with_sender(mut self, sender: ActorHandle) -> Envelope {
		self.sender = Some(sender);
		self
	}

	pub(crate) fn with_transaction_set(mut self, transaction_set: TransactionSet) -> Envelope {
		self.transaction_set = Some(transaction_set);
		self
	}

	/// Attaches a fresh reply slot and returns the matching future.
	pub(crate) fn with_reply(mut self) -> (Envelope, ReplyFuture) {
		let (reply_tx, reply_rx) = oneshot::channel();
		self.reply_to = Some(reply_tx);
		(self, ReplyFuture { reply_rx })
	}

	/// Completes the reply slot exceptionally, if there is one.
	///
	/// Used on every path where the envelope will never reach a handler:
	/// stop drainage, dispatch failures, post-stop discards.
	pub(crate) fn complete_exceptionally(self, error: ActorError) {
		if let Some(reply_to) = self.reply_to {
			// The caller may have dropped its future already. Fine.
			let _ = reply_to.send(Err(error));
		}
	}
}

impl fmt::Debug for Envelope {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("Envelope")
			.field("message", &self.message)
			.field("has_reply", &self.reply_to.is_some())
			.finish()
	}
}

/// The receiving end of an `ask`.
///
/// Completes with the value passed to `reply`, or exceptionally if the
/// handler raised or the actor stopped before replying. Dropping the
/// future does not cancel the processing of the message.
pub struct ReplyFuture {
	reply_rx: oneshot::Receiver<Result<AnyMessage, ActorError>>,
}

impl Future for ReplyFuture {
	type Output = Result<AnyMessage, ActorError>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.reply_rx).poll(cx).map(|recv_res| match recv_res {
			Ok(reply) => reply,
			// The reply slot was dropped without completion: the actor
			// stopped between enqueue and drain.
			Err(_) => Err(ActorError::Stopped),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_reply_future_completes_with_reply() {
		let (envelope, reply_future) = Envelope::new(AnyMessage::new("question")).with_reply();
		envelope.reply_to.unwrap().send(Ok(AnyMessage::new("answer"))).unwrap();
		let reply = reply_future.await.unwrap();
		assert_eq!(reply.downcast::<&str>().unwrap(), "answer");
	}

	#[tokio::test]
	async fn test_reply_future_exceptional_completion() {
		let (envelope, reply_future) = Envelope::new(AnyMessage::new("question")).with_reply();
		envelope.complete_exceptionally(ActorError::Stopped);
		assert!(matches!(reply_future.await, Err(ActorError::Stopped)));
	}

	#[tokio::test]
	async fn test_reply_future_dropped_slot_maps_to_stopped() {
		let (envelope, reply_future) = Envelope::new(AnyMessage::new("question")).with_reply();
		drop(envelope);
		assert!(matches!(reply_future.await, Err(ActorError::Stopped)));
	}
}
