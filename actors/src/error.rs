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

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::{handle::ActorId, stm::DeadTransaction};

/// The class of a fault, without its payload.
///
/// Trap-exit sets are sets of `FaultKind`: a supervisor handles the kinds
/// it traps and escalates the rest.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FaultKind {
	/// The message handler returned an error.
	Handler,
	/// The handler died on a dead transaction set.
	TransactionAborted,
	/// `init` or a restart re-initialization failed.
	Initialization,
}

/// A fault is what the supervision engine sees when an actor raises.
///
/// The cause is shared: the same fault flows to restart hooks, failure
/// notices and reply futures.
#[derive(Clone, Debug, Error)]
#[error("{kind:?}: {cause}")]
pub struct Fault {
	pub kind: FaultKind,
	pub cause: Arc<anyhow::Error>,
}

impl Fault {
	pub(crate) fn new(kind: FaultKind, cause: anyhow::Error) -> Fault {
		Fault { kind, cause: Arc::new(cause) }
	}

	/// Classifies an error raised by a message handler.
	pub(crate) fn from_handler_error(cause: anyhow::Error) -> Fault {
		if cause.is::<DeadTransaction>() {
			Fault::new(FaultKind::TransactionAborted, cause)
		} else {
			Fault::new(FaultKind::Handler, cause)
		}
	}
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LinkageError {
	#[error("actor {0} already has a supervisor")]
	AlreadySupervised(ActorId),
	#[error("actor {0} is not linked to this supervisor")]
	NotLinked(ActorId),
}

/// Everything an actor operation can fail with.
///
/// Contract violations (`NotStarted`, `Stopped`, `NoSenderInScope`,
/// linkage and remote misuse) surface synchronously at the call site.
/// Handler faults never reach a dispatcher worker: they go through the
/// supervision engine and show up here only as the exceptional completion
/// of a reply future.
#[derive(Clone, Debug, Error)]
pub enum ActorError {
	#[error("actor has not been started")]
	NotStarted,
	#[error("actor has been stopped")]
	Stopped,
	#[error("mailbox is full")]
	MailboxFull,
	#[error("no reply before the ask timeout")]
	AskTimeout,
	#[error("no sender in scope for the current message")]
	NoSenderInScope,
	#[error(transparent)]
	Linkage(#[from] LinkageError),
	#[error("operation is not supported on a remote handle")]
	RemoteOperationUnsupported,
	#[error("handler failed: {0}")]
	HandlerFailed(#[source] Arc<anyhow::Error>),
	#[error("transaction set aborted: {0}")]
	TransactionSetAborted(#[source] Arc<anyhow::Error>),
	#[error("initialization failed: {0}")]
	InitializationFailed(#[source] Arc<anyhow::Error>),
	#[error("message serialization failed: {0}")]
	Serialization(#[source] Arc<anyhow::Error>),
	#[error("transport failed: {0}")]
	Transport(#[source] Arc<anyhow::Error>),
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),
}

impl From<Fault> for ActorError {
	fn from(fault: Fault) -> ActorError {
		match fault.kind {
			FaultKind::Handler => ActorError::HandlerFailed(fault.cause),
			FaultKind::TransactionAborted => ActorError::TransactionSetAborted(fault.cause),
			FaultKind::Initialization => ActorError::InitializationFailed(fault.cause),
		}
	}
}

impl ActorError {
	pub(crate) fn transport(cause: impl Into<anyhow::Error>) -> ActorError {
		ActorError::Transport(Arc::new(cause.into()))
	}

	pub(crate) fn serialization(cause: impl Into<anyhow::Error>) -> ActorError {
		ActorError::Serialization(Arc::new(cause.into()))
	}
}

impl fmt::Display for FaultKind {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_fault_classification() {
		let fault = Fault::from_handler_error(anyhow::anyhow!("boom"));
		assert_eq!(fault.kind, FaultKind::Handler);
		let fault = Fault::from_handler_error(anyhow::Error::from(DeadTransaction));
		assert_eq!(fault.kind, FaultKind::TransactionAborted);
	}

	#[test]
	fn test_fault_to_actor_error() {
		let fault = Fault::new(FaultKind::Initialization, anyhow::anyhow!("bad state"));
		assert!(matches!(ActorError::from(fault), ActorError::InitializationFailed(_)));
	}
}
