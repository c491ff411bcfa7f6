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
	any::TypeId,
	collections::{HashMap, HashSet},
	sync::{Arc, RwLock},
};

use crate::{
	actor::Actor,
	handle::{ActorHandle, ActorId, WeakActorHandle},
};

/// The quorum-wide map from actor identity to live handle.
///
/// Holds weak references only, so a stopped handle is collectable as
/// soon as its last user drops it. Lookups resolve a handle iff the
/// actor is Running or BeingRestarted.
///
/// The remote layer resolves inbound wire envelopes against this map.
#[derive(Clone, Default)]
pub struct ActorRegistry {
	inner: Arc<RwLock<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
	by_id: HashMap<ActorId, RegistryEntry>,
	by_tag: HashMap<String, HashSet<ActorId>>,
	by_impl: HashMap<TypeId, HashSet<ActorId>>,
}

struct RegistryEntry {
	handle: WeakActorHandle,
	tag: String,
	impl_type: Option<TypeId>,
}

impl ActorRegistry {
	pub(crate) fn register(&self, handle: &ActorHandle) {
		let actor_id = handle.id();
		let tag = handle.tag();
		let impl_type = handle.impl_type();
		let mut inner = self.inner.write().unwrap();
		inner.by_tag.entry(tag.clone()).or_default().insert(actor_id);
		if let Some(impl_type) = impl_type {
			inner.by_impl.entry(impl_type).or_default().insert(actor_id);
		}
		inner
			.by_id
			.insert(actor_id, RegistryEntry { handle: handle.downgrade(), tag, impl_type });
	}

	pub(crate) fn unregister(&self, actor_id: &ActorId) {
		let mut inner = self.inner.write().unwrap();
		if let Some(entry) = inner.by_id.remove(actor_id) {
			if let Some(ids) = inner.by_tag.get_mut(&entry.tag) {
				ids.remove(actor_id);
				if ids.is_empty() {
					inner.by_tag.remove(&entry.tag);
				}
			}
			if let Some(impl_type) = entry.impl_type {
				if let Some(ids) = inner.by_impl.get_mut(&impl_type) {
					ids.remove(actor_id);
					if ids.is_empty() {
						inner.by_impl.remove(&impl_type);
					}
				}
			}
		}
	}

	/// Re-indexes one actor after a tag change.
	pub(crate) fn retag(&self, actor_id: &ActorId, new_tag: String) {
		let mut inner = self.inner.write().unwrap();
		let Some(entry) = inner.by_id.get_mut(actor_id) else {
			return;
		};
		let old_tag = std::mem::replace(&mut entry.tag, new_tag.clone());
		if let Some(ids) = inner.by_tag.get_mut(&old_tag) {
			ids.remove(actor_id);
			if ids.is_empty() {
				inner.by_tag.remove(&old_tag);
			}
		}
		inner.by_tag.entry(new_tag).or_default().insert(*actor_id);
	}

	pub fn find_by_id(&self, actor_id: &ActorId) -> Option<ActorHandle> {
		let inner = self.inner.read().unwrap();
		let handle = inner.by_id.get(actor_id)?.handle.upgrade()?;
		handle.state().is_alive().then_some(handle)
	}

	pub fn find_by_tag(&self, tag: &str) -> Vec<ActorHandle> {
		let inner = self.inner.read().unwrap();
		let Some(ids) = inner.by_tag.get(tag) else {
			return Vec::new();
		};
		ids.iter()
			.filter_map(|actor_id| inner.by_id.get(actor_id)?.handle.upgrade())
			.filter(|handle| handle.state().is_alive())
			.collect()
	}

	pub fn find_by_impl<A: Actor>(&self) -> Vec<ActorHandle> {
		let inner = self.inner.read().unwrap();
		let Some(ids) = inner.by_impl.get(&TypeId::of::<A>()) else {
			return Vec::new();
		};
		ids.iter()
			.filter_map(|actor_id| inner.by_id.get(actor_id)?.handle.upgrade())
			.filter(|handle| handle.state().is_alive())
			.collect()
	}

	/// Every live handle, for quorum-wide shutdown.
	pub(crate) fn all_alive(&self) -> Vec<ActorHandle> {
		let inner = self.inner.read().unwrap();
		inner
			.by_id
			.values()
			.filter_map(|entry| entry.handle.upgrade())
			.filter(|handle| handle.state().is_alive())
			.collect()
	}

	pub fn len(&self) -> usize {
		self.inner.read().unwrap().by_id.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
