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
	cmp::Reverse,
	collections::{BinaryHeap, HashSet},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::{Duration, Instant},
};

use tracing::debug;

/// A message the actor receives when its mailbox stayed empty for the
/// configured receive-timeout duration.
#[derive(Clone, Copy, Debug)]
pub struct ReceiveTimeout;

pub(crate) struct Callback(pub Box<dyn FnMut() + Send>);

enum SchedulerCommand {
	Schedule { timer_id: u64, deadline: Instant, period: Option<Duration>, callback: Callback },
	Cancel { timer_id: u64 },
}

struct TimerEntry {
	deadline: Instant,
	timer_id: u64,
	period: Option<Duration>,
	callback: Callback,
}

impl PartialEq for TimerEntry {
	fn eq(&self, other: &Self) -> bool {
		self.deadline == other.deadline && self.timer_id == other.timer_id
	}
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for TimerEntry {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		(self.deadline, self.timer_id).cmp(&(other.deadline, other.timer_id))
	}
}

/// Handle to one scheduled timer. Cancellation is best-effort: a timer
/// that already fired cannot be recalled.
pub struct TimerHandle {
	timer_id: u64,
	command_tx: flume::Sender<SchedulerCommand>,
}

impl TimerHandle {
	pub fn cancel(&self) {
		let _ = self.command_tx.send(SchedulerCommand::Cancel { timer_id: self.timer_id });
	}
}

/// Client to the timer thread, cheap to clone.
///
/// Drives the receive-timeout machinery and user-scheduled messages. The
/// callbacks run on the scheduler thread and are required to be short:
/// in practice they only push an envelope into a mailbox.
#[derive(Clone)]
pub struct SchedulerClient {
	command_tx: flume::Sender<SchedulerCommand>,
	next_timer_id: Arc<AtomicU64>,
}

impl SchedulerClient {
	pub fn schedule_once<F: FnOnce() + Send + 'static>(
		&self,
		timeout: Duration,
		callback: F,
	) -> TimerHandle {
		let mut callback_once = Some(callback);
		self.schedule(timeout, None, move || {
			if let Some(callback) = callback_once.take() {
				callback();
			}
		})
	}

	pub fn schedule_periodic<F: FnMut() + Send + 'static>(
		&self,
		initial_delay: Duration,
		period: Duration,
		callback: F,
	) -> TimerHandle {
		self.schedule(initial_delay, Some(period), callback)
	}

	fn schedule<F: FnMut() + Send + 'static>(
		&self,
		timeout: Duration,
		period: Option<Duration>,
		callback: F,
	) -> TimerHandle {
		let timer_id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
		let _ = self.command_tx.send(SchedulerCommand::Schedule {
			timer_id,
			deadline: Instant::now() + timeout,
			period,
			callback: Callback(Box::new(callback)),
		});
		TimerHandle { timer_id, command_tx: self.command_tx.clone() }
	}
}

/// Starts the timer thread and returns a client to it.
///
/// The thread exits when every client (and timer handle) is gone.
pub fn start_scheduler() -> SchedulerClient {
	let (command_tx, command_rx) = flume::unbounded::<SchedulerCommand>();
	std::thread::Builder::new()
		.name("scheduler".to_string())
		.spawn(move || scheduler_loop(command_rx))
		.expect("failed to spawn the scheduler thread");
	SchedulerClient { command_tx, next_timer_id: Arc::new(AtomicU64::new(0)) }
}

fn scheduler_loop(command_rx: flume::Receiver<SchedulerCommand>) {
	let mut timers: BinaryHeap<Reverse<TimerEntry>> = BinaryHeap::new();
	let mut cancelled: HashSet<u64> = HashSet::new();
	loop {
		// Fire everything that is due before going back to sleep.
		let now = Instant::now();
		while timers.peek().map_or(false, |Reverse(entry)| entry.deadline <= now) {
			let Reverse(mut entry) = timers.pop().unwrap();
			if cancelled.remove(&entry.timer_id) {
				continue;
			}
			(entry.callback.0)();
			if let Some(period) = entry.period {
				entry.deadline += period;
				timers.push(Reverse(entry));
			}
		}
		let command_res = match timers.peek() {
			Some(Reverse(next_entry)) => {
				let wait = next_entry.deadline.saturating_duration_since(Instant::now());
				match command_rx.recv_timeout(wait) {
					Ok(command) => Ok(command),
					Err(flume::RecvTimeoutError::Timeout) => continue,
					Err(flume::RecvTimeoutError::Disconnected) => Err(()),
				}
			},
			None => command_rx.recv().map_err(|_| ()),
		};
		match command_res {
			Ok(SchedulerCommand::Schedule { timer_id, deadline, period, callback }) => {
				timers.push(Reverse(TimerEntry { deadline, timer_id, period, callback }));
			},
			Ok(SchedulerCommand::Cancel { timer_id }) => {
				cancelled.insert(timer_id);
			},
			Err(()) => {
				debug!("scheduler-thread-exit");
				return;
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	};

	use super::*;

	#[tokio::test]
	async fn test_one_shot_fires_once() {
		let scheduler = start_scheduler();
		let fired = Arc::new(AtomicUsize::new(0));
		let fired_clone = fired.clone();
		scheduler.schedule_once(Duration::from_millis(20), move || {
			fired_clone.fetch_add(1, Ordering::SeqCst);
		});
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_cancel_before_deadline() {
		let scheduler = start_scheduler();
		let fired = Arc::new(AtomicUsize::new(0));
		let fired_clone = fired.clone();
		let timer = scheduler.schedule_once(Duration::from_millis(60), move || {
			fired_clone.fetch_add(1, Ordering::SeqCst);
		});
		timer.cancel();
		tokio::time::sleep(Duration::from_millis(150)).await;
		assert_eq!(fired.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn test_periodic_fires_repeatedly() {
		let scheduler = start_scheduler();
		let fired = Arc::new(AtomicUsize::new(0));
		let fired_clone = fired.clone();
		let timer =
			scheduler.schedule_periodic(Duration::from_millis(10), Duration::from_millis(10), move || {
				fired_clone.fetch_add(1, Ordering::SeqCst);
			});
		tokio::time::sleep(Duration::from_millis(200)).await;
		timer.cancel();
		assert!(fired.load(Ordering::SeqCst) >= 3);
	}

	#[tokio::test]
	async fn test_timers_fire_in_deadline_order() {
		let scheduler = start_scheduler();
		let order = Arc::new(std::sync::Mutex::new(Vec::new()));
		for (delay_ms, label) in [(60u64, "late"), (20u64, "early")] {
			let order_clone = order.clone();
			scheduler.schedule_once(Duration::from_millis(delay_ms), move || {
				order_clone.lock().unwrap().push(label);
			});
		}
		tokio::time::sleep(Duration::from_millis(200)).await;
		assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
	}
}
