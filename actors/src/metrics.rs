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

use common::metrics::{new_counter, new_counter_vec, IntCounter, IntCounterVec};
use once_cell::sync::Lazy;

pub struct RuntimeMetrics {
	pub messages_processed: IntCounterVec<1>,
	pub actor_starts: IntCounter,
	pub actor_restarts: IntCounter,
	pub actor_stops: IntCounter,
	pub mailbox_rejections: IntCounter,
}

impl Default for RuntimeMetrics {
	fn default() -> Self {
		RuntimeMetrics {
			messages_processed: new_counter_vec(
				"messages_processed_total",
				"Number of envelopes drained and handled, per dispatcher.",
				"quorum",
				["dispatcher"],
			),
			actor_starts: new_counter(
				"actor_starts_total",
				"Number of actors started.",
				"quorum",
			),
			actor_restarts: new_counter(
				"actor_restarts_total",
				"Number of actor restarts driven by supervision.",
				"quorum",
			),
			actor_stops: new_counter("actor_stops_total", "Number of actors stopped.", "quorum"),
			mailbox_rejections: new_counter(
				"mailbox_rejections_total",
				"Number of envelopes rejected by saturated mailboxes.",
				"quorum",
			),
		}
	}
}

/// Registered once per process.
pub static RUNTIME_METRICS: Lazy<RuntimeMetrics> = Lazy::new(RuntimeMetrics::default);
