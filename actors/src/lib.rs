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

#![deny(clippy::disallowed_methods)]

//! actors is the runtime core of quorum.
//!
//! It turns message-handling objects into independently schedulable
//! actors with:
//! - location-transparent handles that survive restarts and can point at
//!   a remote node;
//! - pluggable dispatchers, from one-thread-per-actor to cooperative
//!   shared pools;
//! - supervised failure recovery with one-for-one and all-for-one
//!   restart policies.

mod actor;
mod actor_context;
mod actor_state;
mod codec;
mod config;
mod dispatcher;
mod envelope;
mod error;
mod handle;
mod mailbox;
mod message;
mod metrics;
mod quorum;
mod registry;
mod remote;
mod scheduler;
mod spawn_builder;
mod stm;
mod supervision;

pub use actor::Actor;
pub use actor_context::ActorContext;
pub use actor_state::LifecycleState;
pub use codec::{ActorStateCodec, MessageCodec, NoopCodec, TypedJsonCodec};
pub use config::{OrphanedFailurePolicy, RuntimeConfig};
pub use dispatcher::{Dispatcher, DispatcherKind};
pub use envelope::{Envelope, ReplyFuture};
pub use error::{ActorError, Fault, FaultKind, LinkageError};
pub use handle::{ActorHandle, ActorId, WeakActorHandle};
pub use mailbox::{Mailbox, MailboxKind, RejectionPolicy};
pub use message::AnyMessage;
pub use metrics::{RuntimeMetrics, RUNTIME_METRICS};
pub use quorum::{Quorum, QuorumBuilder};
pub use registry::ActorRegistry;
pub use remote::{deliver_wire, RemoteTransport, WireEnvelope};
#[cfg(any(test, feature = "testsuite"))]
pub use remote::LoopbackTransport;
pub use scheduler::{start_scheduler, ReceiveTimeout, SchedulerClient, TimerHandle};
pub use spawn_builder::{ActorBuilder, SpawnContext};
#[cfg(any(test, feature = "testsuite"))]
pub use stm::{RecordingStm, StmEvent};
pub use stm::{DeadTransaction, NoopStm, Stm, TransactionMode, TransactionSet};
pub use supervision::{
	Failed, FaultPolicy, LifecyclePolicy, MaxRestartsExceeded, UnlinkAndStop,
};
