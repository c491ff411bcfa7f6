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

use std::{fmt, ops::Deref, time::Duration};

use tracing::debug;

use crate::handle::ActorHandle;

/// The view a handler gets of its own execution: "self", the sender of
/// the current message, reply and forward, child spawning.
///
/// Passed explicitly to every `receive` call rather than stashed in
/// process-wide state. The current-message slot behind `sender`/`reply`
/// is installed by the draining worker and cleared when the handler
/// returns, including on raise.
pub struct ActorContext {
	handle: ActorHandle,
}

impl Deref for ActorContext {
	type Target = ActorHandle;

	fn deref(&self) -> &ActorHandle {
		&self.handle
	}
}

impl ActorContext {
	pub(crate) fn new(handle: ActorHandle) -> ActorContext {
		ActorContext { handle }
	}

	/// The handle of the actor this handler runs in.
	pub fn handle(&self) -> &ActorHandle {
		&self.handle
	}

	/// Schedules a message to self after a delay, through the timer
	/// scheduler. The message is delivered with system priority.
	pub fn schedule_self_message<M: Send + fmt::Debug + 'static>(
		&self,
		after: Duration,
		message: M,
	) {
		let Ok(spawn_ctx) = self.handle.spawn_ctx() else {
			return;
		};
		debug!(actor = %self.handle.tag(), msg = ?message, "schedule-self-message");
		let weak_handle = self.handle.downgrade();
		spawn_ctx.scheduler.schedule_once(after, move || {
			if let Some(handle) = weak_handle.upgrade() {
				handle.notify(message);
			}
		});
	}
}
