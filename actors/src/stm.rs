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

use std::{any::Any, fmt, sync::Arc};

use thiserror::Error;

/// An opaque token identifying one transaction set of the external STM.
///
/// The runtime attaches it to envelopes and hands it back to the STM at
/// join/commit/abort time. It never looks inside.
#[derive(Clone)]
pub struct TransactionSet {
	token: Arc<dyn Any + Send + Sync>,
}

impl TransactionSet {
	pub fn new<T: Any + Send + Sync>(token: T) -> TransactionSet {
		TransactionSet { token: Arc::new(token) }
	}

	pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
		self.token.downcast_ref::<T>()
	}
}

impl fmt::Debug for TransactionSet {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("TransactionSet").finish_non_exhaustive()
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransactionMode {
	/// Join the existing transaction set; error if there is none.
	RequiresExisting,
	/// Join the existing transaction set, or start a new one.
	Requires,
	/// Always start a new transaction set.
	RequiresNew,
}

/// Raised inside a handler when the transaction set it joined has died.
/// The supervision engine translates it to the `TransactionAborted`
/// fault kind.
#[derive(Clone, Copy, Debug, Error)]
#[error("transaction set is dead")]
pub struct DeadTransaction;

/// The software-transactional-memory collaborator.
///
/// The STM itself is external; the runtime only drives this protocol
/// around handler invocations carrying a transaction set.
pub trait Stm: Send + Sync + 'static {
	fn current_transaction_set(&self) -> Option<TransactionSet>;
	fn create_new_transaction_set(&self) -> TransactionSet;
	fn clear_transaction_set(&self);
	fn abort(&self, transaction_set: &TransactionSet);
	fn commit(&self, transaction_set: &TransactionSet);
	fn join_transaction(
		&self,
		transaction_set: &TransactionSet,
		mode: TransactionMode,
	) -> anyhow::Result<()>;
}

/// Default collaborator for runtimes without an STM.
pub struct NoopStm;

impl Stm for NoopStm {
	fn current_transaction_set(&self) -> Option<TransactionSet> {
		None
	}

	fn create_new_transaction_set(&self) -> TransactionSet {
		TransactionSet::new(())
	}

	fn clear_transaction_set(&self) {}

	fn abort(&self, _transaction_set: &TransactionSet) {}

	fn commit(&self, _transaction_set: &TransactionSet) {}

	fn join_transaction(
		&self,
		_transaction_set: &TransactionSet,
		_mode: TransactionMode,
	) -> anyhow::Result<()> {
		Ok(())
	}
}

/// Records every call for assertions in tests.
#[cfg(any(test, feature = "testsuite"))]
pub struct RecordingStm {
	pub events: std::sync::Mutex<Vec<StmEvent>>,
}

#[cfg(any(test, feature = "testsuite"))]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StmEvent {
	Joined(TransactionMode),
	Committed,
	Aborted,
}

#[cfg(any(test, feature = "testsuite"))]
impl Default for RecordingStm {
	fn default() -> Self {
		RecordingStm { events: std::sync::Mutex::new(Vec::new()) }
	}
}

#[cfg(any(test, feature = "testsuite"))]
impl Stm for RecordingStm {
	fn current_transaction_set(&self) -> Option<TransactionSet> {
		None
	}

	fn create_new_transaction_set(&self) -> TransactionSet {
		TransactionSet::new(())
	}

	fn clear_transaction_set(&self) {}

	fn abort(&self, _transaction_set: &TransactionSet) {
		self.events.lock().unwrap().push(StmEvent::Aborted);
	}

	fn commit(&self, _transaction_set: &TransactionSet) {
		self.events.lock().unwrap().push(StmEvent::Committed);
	}

	fn join_transaction(
		&self,
		_transaction_set: &TransactionSet,
		mode: TransactionMode,
	) -> anyhow::Result<()> {
		self.events.lock().unwrap().push(StmEvent::Joined(mode));
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_transaction_set_downcast() {
		let transaction_set = TransactionSet::new(42u64);
		assert_eq!(transaction_set.downcast_ref::<u64>(), Some(&42));
		assert!(transaction_set.downcast_ref::<String>().is_none());
	}

	#[test]
	fn test_recording_stm_keeps_order() {
		let stm = RecordingStm::default();
		let transaction_set = stm.create_new_transaction_set();
		stm.join_transaction(&transaction_set, TransactionMode::Requires).unwrap();
		stm.abort(&transaction_set);
		assert_eq!(
			*stm.events.lock().unwrap(),
			vec![StmEvent::Joined(TransactionMode::Requires), StmEvent::Aborted]
		);
	}

	use std::{sync::Arc, time::Duration};

	use crate::{
		quorum::Quorum,
		tests::{Boom, FailingActor, LifecycleLog, Probe, SilentActor},
	};

	#[tokio::test]
	async fn test_transactional_send_joins_and_commits() {
		let stm = Arc::new(RecordingStm::default());
		let quorum = Quorum::builder().set_stm(stm.clone()).build();
		let actor = quorum.spawn(|| SilentActor).await.unwrap();
		let transaction_set = stm.create_new_transaction_set();
		actor.tell_in_transaction(Probe, transaction_set).await.unwrap();
		tokio::time::sleep(Duration::from_millis(200)).await;
		assert_eq!(
			*stm.events.lock().unwrap(),
			vec![StmEvent::Joined(TransactionMode::Requires), StmEvent::Committed]
		);
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_handler_raise_aborts_the_transaction_set() {
		let stm = Arc::new(RecordingStm::default());
		let quorum = Quorum::builder().set_stm(stm.clone()).build();
		let log = Arc::new(LifecycleLog::default());
		let actor_log = log.clone();
		let failing =
			quorum.spawn(move || FailingActor { log: actor_log.clone() }).await.unwrap();
		let transaction_set = stm.create_new_transaction_set();
		failing.tell_in_transaction(Boom, transaction_set).await.unwrap();
		tokio::time::sleep(Duration::from_millis(200)).await;
		assert_eq!(
			*stm.events.lock().unwrap(),
			vec![StmEvent::Joined(TransactionMode::Requires), StmEvent::Aborted]
		);
		quorum.shutdown().await;
	}

	#[tokio::test]
	async fn test_dead_transaction_is_a_transaction_aborted_fault() {
		struct DeadTransactionActor;

		#[async_trait::async_trait]
		impl crate::Actor for DeadTransactionActor {
			async fn receive(
				&mut self,
				_message: crate::AnyMessage,
				_ctx: &crate::ActorContext,
			) -> anyhow::Result<()> {
				Err(anyhow::Error::from(DeadTransaction))
			}
		}

		let quorum = Quorum::new();
		let actor = quorum.spawn(|| DeadTransactionActor).await.unwrap();
		let reply = actor.ask(Probe).await;
		assert!(matches!(reply, Err(crate::ActorError::TransactionSetAborted(_))));
		quorum.shutdown().await;
	}
}
