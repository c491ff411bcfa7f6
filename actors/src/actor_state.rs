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

use std::sync::atomic::{AtomicU32, Ordering};

/// The lifecycle of a handle.
///
/// ```text
/// NotStarted --start--> Running
/// Running    --fail--> BeingRestarted --restart ok--> Running
/// Running    --stop--> Stopped
/// BeingRestarted --restart limit--> Stopped
/// ```
///
/// `Stopped` is terminal: once stopped, a handle never runs again and its
/// identity is never reused.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleState {
	NotStarted = 0,
	Running = 1,
	BeingRestarted = 2,
	Stopped = 3,
}

impl From<u32> for LifecycleState {
	fn from(state_u32: u32) -> Self {
		match state_u32 {
			0 => LifecycleState::NotStarted,
			1 => LifecycleState::Running,
			2 => LifecycleState::BeingRestarted,
			3 => LifecycleState::Stopped,
			_ => {
				panic!("Found forbidden u32 value for LifecycleState `{state_u32}`. This should \
				        never happen.");
			},
		}
	}
}

impl LifecycleState {
	/// Running or mid-restart: the actor is reachable and `find_by_id`
	/// resolves it.
	pub fn is_alive(&self) -> bool {
		matches!(self, LifecycleState::Running | LifecycleState::BeingRestarted)
	}
}

pub(crate) struct AtomicLifecycleState(AtomicU32);

impl Default for AtomicLifecycleState {
	fn default() -> Self {
		AtomicLifecycleState(AtomicU32::new(LifecycleState::NotStarted as u32))
	}
}

impl AtomicLifecycleState {
	/// NotStarted -> Running. Returns false if the handle was already
	/// started (or stopped).
	pub fn start(&self) -> bool {
		self.0
			.compare_exchange(
				LifecycleState::NotStarted as u32,
				LifecycleState::Running as u32,
				Ordering::SeqCst,
				Ordering::SeqCst,
			)
			.is_ok()
	}

	/// Running -> BeingRestarted.
	pub fn begin_restart(&self) -> bool {
		self.0
			.compare_exchange(
				LifecycleState::Running as u32,
				LifecycleState::BeingRestarted as u32,
				Ordering::SeqCst,
				Ordering::SeqCst,
			)
			.is_ok()
	}

	/// BeingRestarted -> Running. Fails if a concurrent `stop` won the
	/// race: stop is terminal.
	pub fn finish_restart(&self) -> bool {
		self.0
			.compare_exchange(
				LifecycleState::BeingRestarted as u32,
				LifecycleState::Running as u32,
				Ordering::SeqCst,
				Ordering::SeqCst,
			)
			.is_ok()
	}

	/// Any state -> Stopped. `Stopped` has the highest discriminant, so a
	/// monotonic max keeps it terminal whatever the interleaving.
	pub fn stop(&self) {
		self.0.fetch_max(LifecycleState::Stopped as u32, Ordering::SeqCst);
	}

	pub fn get(&self) -> LifecycleState {
		LifecycleState::from(self.0.load(Ordering::SeqCst))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_start_only_from_not_started() {
		let state = AtomicLifecycleState::default();
		assert!(state.start());
		assert_eq!(state.get(), LifecycleState::Running);
		assert!(!state.start());
	}

	#[test]
	fn test_restart_cycle() {
		let state = AtomicLifecycleState::default();
		assert!(state.start());
		assert!(state.begin_restart());
		assert_eq!(state.get(), LifecycleState::BeingRestarted);
		assert!(state.finish_restart());
		assert_eq!(state.get(), LifecycleState::Running);
	}

	#[test]
	fn test_stop_is_terminal() {
		let state = AtomicLifecycleState::default();
		assert!(state.start());
		state.stop();
		assert_eq!(state.get(), LifecycleState::Stopped);
		assert!(!state.start());
		assert!(!state.begin_restart());
		assert!(!state.finish_restart());
		assert_eq!(state.get(), LifecycleState::Stopped);
	}

	#[test]
	fn test_stop_beats_concurrent_restart() {
		let state = AtomicLifecycleState::default();
		assert!(state.start());
		assert!(state.begin_restart());
		state.stop();
		assert!(!state.finish_restart());
		assert_eq!(state.get(), LifecycleState::Stopped);
	}

	#[test]
	fn test_is_alive() {
		assert!(!LifecycleState::NotStarted.is_alive());
		assert!(LifecycleState::Running.is_alive());
		assert!(LifecycleState::BeingRestarted.is_alive());
		assert!(!LifecycleState::Stopped.is_alive());
	}
}
