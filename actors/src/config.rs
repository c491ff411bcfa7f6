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

use serde::{Deserialize, Serialize};

use crate::{
	dispatcher::DispatcherKind,
	mailbox::{MailboxKind, RejectionPolicy},
	supervision::LifecyclePolicy,
};

/// What happens to a failing actor whose supervisor is already stopped
/// at the time the failure notification would be sent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrphanedFailurePolicy {
	/// Treat the actor as unsupervised: stop it.
	#[default]
	StopActor,
	/// Leave the actor running and only log the fault.
	Ignore,
}

/// Runtime-wide defaults. Every option can be overridden per actor
/// through the spawn builder.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
	/// Default timeout of `ask` when none is given, in milliseconds.
	#[serde(default = "default_reply_timeout_ms")]
	pub default_reply_timeout_ms: u64,
	#[serde(default)]
	pub default_dispatcher: DispatcherKind,
	/// Envelopes drained per scheduling slot in the shared-pool
	/// dispatchers. Bounds starvation between actors sharing a pool.
	#[serde(default = "default_throughput")]
	pub throughput: usize,
	#[serde(default)]
	pub mailbox: MailboxKind,
	#[serde(default)]
	pub rejection_policy: RejectionPolicy,
	/// When true, every payload is round-tripped through the message
	/// codec before enqueue. Slow, but catches accidental sharing of
	/// mutable state between sender and receiver in tests.
	#[serde(default)]
	pub serialize_messages: bool,
	#[serde(default)]
	pub default_lifecycle: LifecyclePolicy,
	#[serde(default)]
	pub orphaned_failure_policy: OrphanedFailurePolicy,
}

fn default_reply_timeout_ms() -> u64 {
	5_000
}

fn default_throughput() -> usize {
	5
}

impl Default for RuntimeConfig {
	fn default() -> RuntimeConfig {
		RuntimeConfig {
			default_reply_timeout_ms: default_reply_timeout_ms(),
			default_dispatcher: DispatcherKind::default(),
			throughput: default_throughput(),
			mailbox: MailboxKind::default(),
			rejection_policy: RejectionPolicy::default(),
			serialize_messages: false,
			default_lifecycle: LifecyclePolicy::default(),
			orphaned_failure_policy: OrphanedFailurePolicy::default(),
		}
	}
}

impl RuntimeConfig {
	pub fn default_reply_timeout(&self) -> Duration {
		Duration::from_millis(self.default_reply_timeout_ms)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_config_defaults() {
		let config: RuntimeConfig = serde_json::from_str("{}").unwrap();
		assert_eq!(config.default_reply_timeout_ms, 5_000);
		assert_eq!(config.throughput, 5);
		assert_eq!(config.default_dispatcher, DispatcherKind::CooperativePool);
		assert_eq!(config.mailbox, MailboxKind::Unbounded);
		assert_eq!(config.rejection_policy, RejectionPolicy::Abort);
		assert!(!config.serialize_messages);
		assert_eq!(config.default_lifecycle, LifecyclePolicy::Permanent);
		assert_eq!(config.orphaned_failure_policy, OrphanedFailurePolicy::StopActor);
	}

	#[test]
	fn test_config_parses_explicit_options() {
		let config_json = r#"{
			"default_reply_timeout_ms": 250,
			"default_dispatcher": "thread-based",
			"throughput": 1,
			"mailbox": { "bounded-linked": { "capacity": 16 } },
			"rejection_policy": "discard-oldest",
			"serialize_messages": true,
			"default_lifecycle": "temporary",
			"orphaned_failure_policy": "ignore"
		}"#;
		let config: RuntimeConfig = serde_json::from_str(config_json).unwrap();
		assert_eq!(config.default_reply_timeout(), Duration::from_millis(250));
		assert_eq!(config.default_dispatcher, DispatcherKind::ThreadBased);
		assert_eq!(config.throughput, 1);
		assert_eq!(config.mailbox, MailboxKind::BoundedLinked { capacity: 16 });
		assert_eq!(config.rejection_policy, RejectionPolicy::DiscardOldest);
		assert!(config.serialize_messages);
		assert_eq!(config.default_lifecycle, LifecyclePolicy::Temporary);
		assert_eq!(config.orphaned_failure_policy, OrphanedFailurePolicy::Ignore);
	}
}
