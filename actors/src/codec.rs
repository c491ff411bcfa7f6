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
	any::{Any, TypeId},
	collections::HashMap,
	sync::RwLock,
};

use anyhow::{bail, Context};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::message::AnyMessage;

/// Turns message payloads into bytes and back.
///
/// Used when a handle routes to a remote node, and for the
/// `serialize_messages` deep-copy mode. The runtime never interprets the
/// bytes.
pub trait MessageCodec: Send + Sync + 'static {
	fn encode(&self, message: &AnyMessage) -> anyhow::Result<Vec<u8>>;
	fn decode(&self, bytes: &[u8]) -> anyhow::Result<AnyMessage>;
}

/// Turns an actor's internal state into bytes and back, for handle
/// migration. The runtime never interprets the bytes.
pub trait ActorStateCodec: Send + Sync + 'static {
	fn encode_state(&self, state: &dyn Any) -> anyhow::Result<Vec<u8>>;
	fn decode_state(&self, bytes: &[u8]) -> anyhow::Result<Box<dyn Any + Send>>;
}

/// Default codec: refuses everything.
///
/// Remote routing and `serialize_messages` require the embedding
/// application to install a real codec with its message types
/// registered.
pub struct NoopCodec;

impl MessageCodec for NoopCodec {
	fn encode(&self, message: &AnyMessage) -> anyhow::Result<Vec<u8>> {
		bail!("no message codec installed, cannot encode `{}`", message.type_name());
	}

	fn decode(&self, _bytes: &[u8]) -> anyhow::Result<AnyMessage> {
		bail!("no message codec installed");
	}
}

#[derive(Serialize, Deserialize)]
struct Frame {
	#[serde(rename = "type")]
	type_tag: String,
	value: serde_json::Value,
}

type EncodeFn = Box<dyn Fn(&AnyMessage) -> anyhow::Result<serde_json::Value> + Send + Sync>;
type DecodeFn = Box<dyn Fn(serde_json::Value) -> anyhow::Result<AnyMessage> + Send + Sync>;

/// A json codec over an explicit registry of message types.
///
/// Each registered type is framed with its short tag so the receiving
/// side can pick the right deserializer.
#[derive(Default)]
pub struct TypedJsonCodec {
	encoders: RwLock<HashMap<TypeId, (String, EncodeFn)>>,
	decoders: RwLock<HashMap<String, DecodeFn>>,
}

impl TypedJsonCodec {
	pub fn new() -> TypedJsonCodec {
		TypedJsonCodec::default()
	}

	/// Registers a message type under its short type name.
	pub fn register<M>(self) -> Self
	where
		M: Serialize + DeserializeOwned + Send + 'static,
	{
		let type_tag = crate::actor::short_type_name::<M>().to_string();
		let encode: EncodeFn = Box::new(|message: &AnyMessage| {
			let payload = message
				.downcast_ref::<M>()
				.context("payload type does not match its registration")?;
			Ok(serde_json::to_value(payload)?)
		});
		let type_tag_clone = type_tag.clone();
		let decode: DecodeFn = Box::new(move |value: serde_json::Value| {
			let payload: M = serde_json::from_value(value)
				.with_context(|| format!("invalid `{type_tag_clone}` payload"))?;
			Ok(AnyMessage::new(payload))
		});
		self.encoders.write().unwrap().insert(TypeId::of::<M>(), (type_tag.clone(), encode));
		self.decoders.write().unwrap().insert(type_tag, decode);
		self
	}
}

impl MessageCodec for TypedJsonCodec {
	fn encode(&self, message: &AnyMessage) -> anyhow::Result<Vec<u8>> {
		let encoders = self.encoders.read().unwrap();
		let Some((type_tag, encode)) = encoders.get(&message.payload_type_id()) else {
			bail!("message type `{}` is not registered with the codec", message.type_name());
		};
		let frame = Frame { type_tag: type_tag.clone(), value: encode(message)? };
		Ok(serde_json::to_vec(&frame)?)
	}

	fn decode(&self, bytes: &[u8]) -> anyhow::Result<AnyMessage> {
		let frame: Frame = serde_json::from_slice(bytes).context("invalid message frame")?;
		let decoders = self.decoders.read().unwrap();
		let Some(decode) = decoders.get(&frame.type_tag) else {
			bail!("message type `{}` is not registered with the codec", frame.type_tag);
		};
		decode(frame.value)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Serialize, Deserialize, Debug, PartialEq)]
	struct Ping {
		seq: u32,
	}

	#[test]
	fn test_typed_json_codec_roundtrip() {
		let codec = TypedJsonCodec::new().register::<Ping>();
		let bytes = codec.encode(&AnyMessage::new(Ping { seq: 7 })).unwrap();
		let decoded = codec.decode(&bytes).unwrap();
		assert_eq!(decoded.downcast::<Ping>().unwrap(), Ping { seq: 7 });
	}

	#[test]
	fn test_typed_json_codec_rejects_unregistered() {
		let codec = TypedJsonCodec::new().register::<Ping>();
		assert!(codec.encode(&AnyMessage::new("not registered".to_string())).is_err());
	}

	#[test]
	fn test_noop_codec_refuses() {
		assert!(NoopCodec.encode(&AnyMessage::new(1u32)).is_err());
		assert!(NoopCodec.decode(b"{}").is_err());
	}
}
