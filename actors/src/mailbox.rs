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

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc,
};

use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;

/// Backing queue shape of a mailbox, decided by configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MailboxKind {
	#[default]
	Unbounded,
	BoundedLinked {
		capacity: usize,
	},
	BoundedArray {
		capacity: usize,
		fair: bool,
	},
	/// Rendezvous queue: an enqueue completes only when a drain takes the
	/// envelope. Only meaningful with the thread-based dispatcher, which
	/// blocks in `recv`.
	Synchronous,
}

impl MailboxKind {
	pub(crate) fn capacity(&self) -> Option<usize> {
		match self {
			MailboxKind::Unbounded => None,
			MailboxKind::BoundedLinked { capacity } => Some(*capacity),
			MailboxKind::BoundedArray { capacity, .. } => Some(*capacity),
			MailboxKind::Synchronous => Some(0),
		}
	}
}

/// What to do when a bounded mailbox is saturated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionPolicy {
	/// Surface `MailboxFull` at the caller.
	#[default]
	Abort,
	/// The caller itself drains one envelope of the saturated mailbox to
	/// make room, then retries.
	CallerRuns,
	/// Silently drop the new envelope.
	Discard,
	/// Silently drop the oldest queued envelope, then enqueue.
	DiscardOldest,
}

pub(crate) enum EnqueueError {
	Full(Envelope),
	Disconnected(Envelope),
}

/// An ordered queue of envelopes plus the processing token that enforces
/// serial execution.
///
/// Two queues actually: system and scheduled messages go through an
/// unbounded high-priority channel that is never subject to the
/// rejection policy, so supervision traffic cannot be starved or
/// rejected by a saturated mailbox.
///
/// The processing token is the per-mailbox permit: the worker holding it
/// is the only one draining, and the only one touching the actor
/// instance. Acquisition is a CAS; the release/re-check handshake lives
/// in the dispatchers.
#[derive(Clone)]
pub struct Mailbox {
	inner: Arc<MailboxInner>,
}

struct MailboxInner {
	high_tx: flume::Sender<Envelope>,
	high_rx: flume::Receiver<Envelope>,
	low_tx: flume::Sender<Envelope>,
	low_rx: flume::Receiver<Envelope>,
	processing: AtomicBool,
}

impl Mailbox {
	pub(crate) fn new(kind: MailboxKind) -> Mailbox {
		let (high_tx, high_rx) = flume::unbounded();
		let (low_tx, low_rx) = match kind.capacity() {
			Some(capacity) => flume::bounded(capacity),
			None => flume::unbounded(),
		};
		Mailbox {
			inner: Arc::new(MailboxInner {
				high_tx,
				high_rx,
				low_tx,
				low_rx,
				processing: AtomicBool::new(false),
			}),
		}
	}

	/// Appends a regular envelope, failing fast when bounded and full.
	pub(crate) fn try_enqueue(&self, envelope: Envelope) -> Result<(), EnqueueError> {
		match self.inner.low_tx.try_send(envelope) {
			Ok(()) => Ok(()),
			Err(flume::TrySendError::Full(envelope)) => Err(EnqueueError::Full(envelope)),
			Err(flume::TrySendError::Disconnected(envelope)) =>
				Err(EnqueueError::Disconnected(envelope)),
		}
	}

	/// Appends a regular envelope, waiting for room. Used by the
	/// rendezvous mailbox, where an enqueue completes only when the
	/// draining thread takes the envelope.
	pub(crate) async fn enqueue_wait(&self, envelope: Envelope) -> Result<(), EnqueueError> {
		self.inner
			.low_tx
			.send_async(envelope)
			.await
			.map_err(|flume::SendError(envelope)| EnqueueError::Disconnected(envelope))
	}

	/// Appends a system envelope. The high-priority queue is unbounded:
	/// supervision and timer traffic is never rejected.
	pub(crate) fn enqueue_system(&self, envelope: Envelope) {
		// Cannot fail: the mailbox owns both ends of the channel.
		let _ = self.inner.high_tx.send(envelope);
	}

	/// Takes the next envelope if any, system queue first.
	pub(crate) fn drain_one(&self) -> Option<Envelope> {
		if let Ok(envelope) = self.inner.high_rx.try_recv() {
			return Some(envelope);
		}
		self.inner.low_rx.try_recv().ok()
	}

	/// Waits for the next envelope, system queue first. Only the
	/// thread-based drain loops use this; pool workers pull with
	/// `drain_one` under the processing token.
	pub(crate) async fn recv(&self) -> Envelope {
		if let Ok(envelope) = self.inner.high_rx.try_recv() {
			return envelope;
		}
		tokio::select! {
			high = self.inner.high_rx.recv_async() => {
				high.expect("the mailbox owns the high-priority sender")
			}
			low = self.inner.low_rx.recv_async() => {
				low.expect("the mailbox owns the low-priority sender")
			}
		}
	}

	/// Drops the oldest regular envelope, returning it for exceptional
	/// completion.
	pub(crate) fn discard_oldest(&self) -> Option<Envelope> {
		self.inner.low_rx.try_recv().ok()
	}

	/// Empties both queues. Used on stop: the envelopes drained here
	/// never reach a handler.
	pub(crate) fn drain_remaining(&self) -> Vec<Envelope> {
		let mut envelopes = Vec::new();
		while let Ok(envelope) = self.inner.high_rx.try_recv() {
			envelopes.push(envelope);
		}
		while let Ok(envelope) = self.inner.low_rx.try_recv() {
			envelopes.push(envelope);
		}
		envelopes
	}

	pub(crate) fn try_acquire(&self) -> bool {
		self.inner
			.processing
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_ok()
	}

	pub(crate) fn release(&self) {
		self.inner.processing.store(false, Ordering::SeqCst);
	}

	pub(crate) fn is_processing(&self) -> bool {
		self.inner.processing.load(Ordering::SeqCst)
	}

	pub fn len(&self) -> usize {
		self.inner.high_rx.len() + self.inner.low_rx.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::message::AnyMessage;

	fn envelope(msg: &'static str) -> Envelope {
		Envelope::new(AnyMessage::new(msg))
	}

	fn message_of(envelope: Envelope) -> &'static str {
		envelope.message.downcast::<&'static str>().unwrap()
	}

	#[test]
	fn test_system_envelopes_drain_first() {
		let mailbox = Mailbox::new(MailboxKind::Unbounded);
		mailbox.try_enqueue(envelope("low")).ok().unwrap();
		mailbox.enqueue_system(envelope("high"));
		assert_eq!(mailbox.len(), 2);
		assert_eq!(message_of(mailbox.drain_one().unwrap()), "high");
		assert_eq!(message_of(mailbox.drain_one().unwrap()), "low");
		assert!(mailbox.drain_one().is_none());
	}

	#[test]
	fn test_bounded_mailbox_rejects_when_full() {
		let mailbox = Mailbox::new(MailboxKind::BoundedLinked { capacity: 1 });
		mailbox.try_enqueue(envelope("first")).ok().unwrap();
		assert!(matches!(mailbox.try_enqueue(envelope("second")), Err(EnqueueError::Full(_))));
		// The system queue is exempt from the bound.
		mailbox.enqueue_system(envelope("system"));
		assert_eq!(mailbox.len(), 2);
	}

	#[test]
	fn test_discard_oldest_skips_system_queue() {
		let mailbox = Mailbox::new(MailboxKind::BoundedLinked { capacity: 2 });
		mailbox.enqueue_system(envelope("system"));
		mailbox.try_enqueue(envelope("old")).ok().unwrap();
		mailbox.try_enqueue(envelope("new")).ok().unwrap();
		assert_eq!(message_of(mailbox.discard_oldest().unwrap()), "old");
		assert_eq!(message_of(mailbox.drain_one().unwrap()), "system");
		assert_eq!(message_of(mailbox.drain_one().unwrap()), "new");
	}

	#[test]
	fn test_processing_token_is_exclusive() {
		let mailbox = Mailbox::new(MailboxKind::Unbounded);
		assert!(!mailbox.is_processing());
		assert!(mailbox.try_acquire());
		assert!(!mailbox.try_acquire());
		assert!(mailbox.is_processing());
		mailbox.release();
		assert!(mailbox.try_acquire());
	}

	#[test]
	fn test_drain_remaining_empties_both_queues() {
		let mailbox = Mailbox::new(MailboxKind::Unbounded);
		mailbox.try_enqueue(envelope("a")).ok().unwrap();
		mailbox.enqueue_system(envelope("b"));
		mailbox.try_enqueue(envelope("c")).ok().unwrap();
		let remaining = mailbox.drain_remaining();
		assert_eq!(remaining.len(), 3);
		assert!(mailbox.is_empty());
	}

	#[tokio::test]
	async fn test_recv_waits_for_envelopes() {
		let mailbox = Mailbox::new(MailboxKind::Unbounded);
		let mailbox_clone = mailbox.clone();
		tokio::spawn(async move {
			tokio::time::sleep(std::time::Duration::from_millis(20)).await;
			mailbox_clone.try_enqueue(envelope("later")).ok().unwrap();
		});
		assert_eq!(message_of(mailbox.recv().await), "later");
	}
}
