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

use rand::{distributions::Alphanumeric, prelude::*};

const ADJECTIVES: &[&str] = &[
	"amber",
	"bold",
	"brisk",
	"calm",
	"cobalt",
	"crimson",
	"dawn",
	"dusty",
	"eager",
	"fleet",
	"frosty",
	"hidden",
	"keen",
	"lively",
	"misty",
	"nimble",
	"patient",
	"quiet",
	"restless",
	"silent",
	"solemn",
	"sturdy",
	"swift",
	"wandering",
];

/// Returns a readable unique label, e.g. `echo-swift-x3Fa`.
///
/// Used for actor instance labels and worker thread names, where a raw
/// uuid makes logs unreadable.
pub fn new_quid(name: &str) -> String {
	let mut rng = rand::thread_rng();
	let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
	let slug: String = rng.sample_iter(&Alphanumeric).take(4).map(char::from).collect();
	format!("{name}-{adjective}-{slug}")
}

#[cfg(test)]
mod tests {
	use std::collections::HashSet;

	use super::new_quid;

	#[test]
	fn test_quid_uniqueness() {
		let quids: HashSet<String> = std::iter::repeat_with(|| new_quid("echo")).take(100).collect();
		assert_eq!(quids.len(), 100);
		assert!(quids.iter().all(|quid| quid.starts_with("echo-")));
	}
}
