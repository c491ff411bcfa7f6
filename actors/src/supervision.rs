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
	future::Future,
	pin::Pin,
	time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
	actor_context::ActorContext,
	config::OrphanedFailurePolicy,
	error::{Fault, FaultKind},
	handle::{ActorHandle, ActorId},
	metrics::RUNTIME_METRICS,
};

/// How a supervisor recovers the subordinates it traps faults for.
///
/// Plain data: the policy carries its retry budget, the engine carries
/// the counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultPolicy {
	/// Restart only the failing subordinate.
	OneForOne { max_retries: u32, window_ms: u64 },
	/// Restart every subordinate of the supervisor. The retry budget is
	/// counted on the supervisor, not per subordinate.
	AllForOne { max_retries: u32, window_ms: u64 },
}

/// Whether a failing actor is worth restarting at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecyclePolicy {
	/// Restart on failure, within the supervisor's retry budget.
	#[default]
	Permanent,
	/// Never restart: a failing temporary actor is stopped and removed
	/// from its supervisor.
	Temporary,
}

/// Notice delivered to a supervisor when a subordinate raised a fault
/// kind outside the trap-exit set.
#[derive(Debug)]
pub struct Failed {
	pub subordinate: ActorHandle,
	pub cause: Fault,
}

/// Notice delivered to a supervisor when a subordinate exhausted its
/// restart budget and was stopped. Exactly one notice per exhaustion.
#[derive(Debug)]
pub struct MaxRestartsExceeded {
	pub id: ActorId,
	pub max_retries: u32,
	pub window_ms: u64,
	pub cause: Fault,
}

/// Notice delivered to a supervisor whose last temporary subordinate was
/// removed after failing.
#[derive(Debug)]
pub struct UnlinkAndStop {
	pub subordinate: ActorHandle,
}

/// Failure counter with a sliding window, per the restart algorithm:
/// a failure outside the window opens a fresh one.
#[derive(Default)]
pub(crate) struct RestartCounter {
	window_start: Option<Instant>,
	count: u32,
}

impl RestartCounter {
	pub fn bump(&mut self, window: Duration) -> u32 {
		let now = Instant::now();
		match self.window_start {
			Some(window_start) if now.duration_since(window_start) <= window => {
				self.count += 1;
			},
			_ => {
				self.window_start = Some(now);
				self.count = 1;
			},
		}
		self.count
	}
}

/// Entry point of the supervision engine, called by `invoke` when a
/// handler raised. The processing token of the failing actor is still
/// held: the next drain sees the post-recovery instance.
pub(crate) async fn handle_failure(failing: ActorHandle, fault: Fault) {
	warn!(actor = %failing.tag(), fault = %fault, "actor-fault");
	let Some(supervisor) = failing.supervisor() else {
		info!(actor = %failing.tag(), "unsupervised-actor-stopping");
		let _ = failing.stop().await;
		return;
	};
	if !supervisor.state().is_alive() {
		match failing.orphaned_failure_policy() {
			OrphanedFailurePolicy::StopActor => {
				warn!(actor = %failing.tag(), "supervisor-stopped-stopping-orphan");
				let _ = failing.stop().await;
			},
			OrphanedFailurePolicy::Ignore => {
				warn!(actor = %failing.tag(), "supervisor-stopped-ignoring-fault");
			},
		}
		return;
	}
	let policy = supervisor.fault_policy().filter(|_| supervisor.traps(fault.kind));
	match policy {
		Some(FaultPolicy::OneForOne { max_retries, window_ms }) => {
			let window = Duration::from_millis(window_ms);
			let count = failing.bump_restart_counter(window);
			recover_one(&failing, &supervisor, fault, count, max_retries, window_ms).await;
		},
		Some(FaultPolicy::AllForOne { max_retries, window_ms }) => {
			let window = Duration::from_millis(window_ms);
			// The budget is collective: one counter on the supervisor.
			let count = supervisor.bump_restart_counter(window);
			if count > max_retries {
				exceed_restart_limit(&failing, &supervisor, fault, max_retries, window_ms).await;
				return;
			}
			if failing.lifecycle() == LifecyclePolicy::Temporary {
				remove_temporary(&failing, &supervisor).await;
				return;
			}
			for subordinate in supervisor.subordinates_snapshot() {
				restart_subtree(subordinate, fault.clone(), max_retries, window_ms).await;
			}
		},
		None => {
			// Not trapped: escalate. The supervisor's own handler (or
			// its supervisor in turn) decides.
			debug!(actor = %failing.tag(), supervisor = %supervisor.tag(), "escalating-fault");
			supervisor.notify(Failed { subordinate: failing.clone(), cause: fault });
		},
	}
}

/// One-for-one recovery of a single subordinate whose counter was
/// already bumped.
async fn recover_one(
	failing: &ActorHandle,
	supervisor: &ActorHandle,
	fault: Fault,
	count: u32,
	max_retries: u32,
	window_ms: u64,
) {
	if count > max_retries {
		exceed_restart_limit(failing, supervisor, fault, max_retries, window_ms).await;
	} else if failing.lifecycle() == LifecyclePolicy::Temporary {
		remove_temporary(failing, supervisor).await;
	} else {
		perform_restart(failing, &fault, max_retries, window_ms).await;
	}
}

async fn exceed_restart_limit(
	failing: &ActorHandle,
	supervisor: &ActorHandle,
	fault: Fault,
	max_retries: u32,
	window_ms: u64,
) {
	warn!(
		actor = %failing.tag(),
		max_retries = max_retries,
		window_ms = window_ms,
		"restart-limit-exceeded"
	);
	let failing_id = failing.id();
	let _ = failing.stop().await;
	supervisor.notify(MaxRestartsExceeded { id: failing_id, max_retries, window_ms, cause: fault });
}

async fn remove_temporary(failing: &ActorHandle, supervisor: &ActorHandle) {
	info!(actor = %failing.tag(), "removing-temporary-actor");
	// Stop unlinks the subordinate from its supervisor.
	let _ = failing.stop().await;
	if supervisor.has_no_subordinates() {
		supervisor.notify(UnlinkAndStop { subordinate: failing.clone() });
	}
}

/// Restarts an actor and, recursively, its own linked subordinates, each
/// bounded by its own counter.
fn restart_subtree(
	target: ActorHandle,
	fault: Fault,
	max_retries: u32,
	window_ms: u64,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
	Box::pin(async move {
		let count = target.bump_restart_counter(Duration::from_millis(window_ms));
		if count > max_retries {
			if let Some(supervisor) = target.supervisor() {
				exceed_restart_limit(&target, &supervisor, fault, max_retries, window_ms).await;
			} else {
				let _ = target.stop().await;
			}
			return;
		}
		perform_restart(&target, &fault, max_retries, window_ms).await;
	})
}

/// The restart sequence proper.
///
/// The old instance sees `pre_restart`, the replacement is built from
/// the saved factory and sees `init`, `init_transactional_state` and
/// `post_restart`. Identity, mailbox and queued envelopes are untouched.
async fn perform_restart(target: &ActorHandle, fault: &Fault, max_retries: u32, window_ms: u64) {
	if !target.begin_restart() {
		// Lost a race against stop or another restart.
		debug!(actor = %target.tag(), "restart-aborted");
		return;
	}
	info!(actor = %target.tag(), "restarting-actor");
	RUNTIME_METRICS.actor_restarts.inc();
	for subordinate in target.subordinates_snapshot() {
		restart_subtree(subordinate, fault.clone(), max_retries, window_ms).await;
	}
	let ctx = ActorContext::new(target.clone());
	let mut instance_slot = target.instance_slot().lock().await;
	if let Some(old_instance) = instance_slot.as_mut() {
		old_instance.pre_restart(fault, &ctx).await;
	}
	let mut fresh_instance = target.build_instance();
	if let Err(init_error) = fresh_instance.init(&ctx).await {
		error!(actor = %target.tag(), error = %init_error, "restart-initialization-failed");
		drop(instance_slot);
		let supervisor_opt = target.supervisor();
		let _ = target.stop().await;
		if let Some(supervisor) = supervisor_opt {
			supervisor.notify(Failed {
				subordinate: target.clone(),
				cause: Fault::new(FaultKind::Initialization, init_error),
			});
		}
		return;
	}
	fresh_instance.init_transactional_state();
	fresh_instance.post_restart(fault, &ctx).await;
	*instance_slot = Some(fresh_instance);
	drop(instance_slot);
	if !target.finish_restart() {
		debug!(actor = %target.tag(), "stopped-during-restart");
	}
}
