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
	Arc, Mutex, Weak,
};

use tracing::debug;

/// A cooperative shutdown flag shared by a tree of workers.
///
/// Switches form a tree: killing one kills every descendant, while a
/// killed child leaves its parent untouched. The actor runtime hands
/// every actor a child of its quorum's switch, and spawn-linked
/// subordinates a child of their supervisor's, so a kill cascades along
/// the supervision tree.
#[derive(Clone, Default)]
pub struct KillSwitch {
	state: Arc<State>,
}

struct State {
	alive: AtomicBool,
	children: Mutex<Vec<Weak<State>>>,
}

impl Default for State {
	fn default() -> Self {
		State { alive: AtomicBool::new(true), children: Mutex::default() }
	}
}

impl KillSwitch {
	pub fn is_alive(&self) -> bool {
		self.state.alive.load(Ordering::Relaxed)
	}

	pub fn is_dead(&self) -> bool {
		!self.is_alive()
	}

	/// Kills this switch and every descendant still alive.
	pub fn kill(&self) {
		debug!("kill-switch");
		// Iterative cascade over the subtree, holding at most one
		// children lock at a time.
		let mut pending: Vec<Arc<State>> = vec![self.state.clone()];
		while let Some(state) = pending.pop() {
			state.alive.store(false, Ordering::Relaxed);
			let mut children = state.children.lock().unwrap();
			pending.extend(children.drain(..).filter_map(|child| child.upgrade()));
		}
	}

	/// Creates a child switch.
	///
	/// A child born from a dead parent is dead on arrival.
	pub fn child(&self) -> KillSwitch {
		let child = KillSwitch {
			state: Arc::new(State {
				alive: AtomicBool::new(self.is_alive()),
				children: Mutex::default(),
			}),
		};
		let mut children = self.state.children.lock().unwrap();
		// Dropped children leave dangling weak refs behind; sweep them
		// while the lock is held anyway.
		children.retain(|weak| weak.strong_count() > 0);
		children.push(Arc::downgrade(&child.state));
		child
	}
}

#[cfg(test)]
mod tests {
	use super::KillSwitch;

	#[test]
	fn test_kill_switch() {
		let kill_switch = KillSwitch::default();
		assert!(kill_switch.is_alive());
		assert!(!kill_switch.is_dead());
		kill_switch.kill();
		assert!(!kill_switch.is_alive());
		assert!(kill_switch.is_dead());
		kill_switch.kill();
		assert!(kill_switch.is_dead());
	}

	#[test]
	fn test_kill_switch_reaches_all_children() {
		let kill_switch = KillSwitch::default();
		let child = kill_switch.child();
		let other_child = kill_switch.child();
		assert!(child.is_alive());
		assert!(other_child.is_alive());
		kill_switch.kill();
		assert!(child.is_dead());
		assert!(other_child.is_dead());
	}

	#[test]
	fn test_kill_switch_reaches_grandchildren() {
		let kill_switch = KillSwitch::default();
		let child = kill_switch.child();
		let grandchild = child.child();
		kill_switch.kill();
		assert!(kill_switch.is_dead());
		assert!(child.is_dead());
		assert!(grandchild.is_dead());
	}

	#[test]
	fn test_killing_a_child_spares_the_parent() {
		let kill_switch = KillSwitch::default();
		let child = kill_switch.child();
		child.kill();
		assert!(kill_switch.is_alive());
		assert!(child.is_dead());
	}

	#[test]
	fn test_child_of_dead_parent_is_dead() {
		let kill_switch = KillSwitch::default();
		kill_switch.kill();
		assert!(kill_switch.child().is_dead());
	}
}
