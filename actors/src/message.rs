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
	any::{type_name, Any},
	fmt,
};

/// A type-erased message payload.
///
/// Handles are not generic over the actor they point to, so every payload
/// crosses the mailbox as an `AnyMessage`. The receiving actor downcasts
/// to the concrete types it understands.
///
/// The originating type name is captured for logging; it is not a wire
/// identity.
pub struct AnyMessage {
	payload: Box<dyn Any + Send>,
	type_name: &'static str,
}

impl AnyMessage {
	pub fn new<M: Send + 'static>(message: M) -> AnyMessage {
		let boxed: Box<dyn Any + Send> = Box::new(message);
		// Wrapping an AnyMessage into an AnyMessage is always a caller
		// mistake. Flatten instead of nesting.
		match boxed.downcast::<AnyMessage>() {
			Ok(already_wrapped) => *already_wrapped,
			Err(payload) => AnyMessage { payload, type_name: type_name::<M>() },
		}
	}

	pub fn is<M: 'static>(&self) -> bool {
		self.payload.is::<M>()
	}

	pub fn downcast<M: 'static>(self) -> Result<M, AnyMessage> {
		let type_name = self.type_name;
		match self.payload.downcast::<M>() {
			Ok(message) => Ok(*message),
			Err(payload) => Err(AnyMessage { payload, type_name }),
		}
	}

	pub fn downcast_ref<M: 'static>(&self) -> Option<&M> {
		self.payload.downcast_ref::<M>()
	}

	/// Full path of the payload type, as captured at wrap time.
	pub fn type_name(&self) -> &'static str {
		self.type_name
	}

	pub fn payload_type_id(&self) -> std::any::TypeId {
		(*self.payload).type_id()
	}
}

impl fmt::Debug for AnyMessage {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_tuple("AnyMessage").field(&self.type_name).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::AnyMessage;

	#[test]
	fn test_any_message_downcast() {
		let message = AnyMessage::new("hi".to_string());
		assert!(message.is::<String>());
		assert!(!message.is::<usize>());
		assert_eq!(message.downcast_ref::<String>().unwrap(), "hi");
		assert_eq!(message.downcast::<String>().unwrap(), "hi");
	}

	#[test]
	fn test_any_message_downcast_wrong_type() {
		let message = AnyMessage::new(42usize);
		let message = message.downcast::<String>().unwrap_err();
		assert_eq!(message.downcast::<usize>().unwrap(), 42);
	}

	#[test]
	fn test_any_message_does_not_nest() {
		let message = AnyMessage::new(AnyMessage::new(42usize));
		assert!(message.is::<usize>());
	}

	#[test]
	fn test_any_message_type_name() {
		let message = AnyMessage::new(42usize);
		assert_eq!(message.type_name(), "usize");
	}
}
