//! Tagged-envelope JSON processor.
//!
//! Every frame is a JSON object with exactly one field, keyed by the
//! message's wire tag: `{"Hello":{"name":"world"}}`.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use proto::{Message, NamedMessage, ProcessorError, RegisterError};
use serde_json::value::RawValue;
use tracing::debug;

use crate::agent::AgentHandle;
use crate::processor::{Delivery, MessageRouter, Processor};

type DecodeFn = fn(&RawValue) -> Result<Box<dyn Message>, serde_json::Error>;
type EncodeFn = fn(&dyn Message) -> Result<Box<RawValue>, ProcessorError>;

/// Registration entry for one message type.
struct MsgInfo {
    name: &'static str,
    type_id: TypeId,
    decode: DecodeFn,
    encode: EncodeFn,
    router: Option<Arc<dyn MessageRouter>>,
}

fn decode_as<T: NamedMessage>(raw: &RawValue) -> Result<Box<dyn Message>, serde_json::Error> {
    let msg: T = serde_json::from_str(raw.get())?;
    Ok(Box::new(msg))
}

fn encode_as<T: NamedMessage>(msg: &dyn Message) -> Result<Box<RawValue>, ProcessorError> {
    let msg = msg
        .downcast_ref::<T>()
        .ok_or(ProcessorError::UnknownType(msg.name()))?;
    serde_json::value::to_raw_value(msg).map_err(|e| ProcessorError::Encode(e.to_string()))
}

fn runtime_type(msg: &dyn Message) -> TypeId {
    <dyn Any as Any>::type_id(msg.as_any())
}

/// Collects message registrations before any traffic is served.
#[derive(Default)]
pub struct JsonProcessorBuilder {
    by_name: HashMap<&'static str, MsgInfo>,
    by_type: HashMap<TypeId, &'static str>,
}

impl JsonProcessorBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under its wire tag.
    pub fn register<T: NamedMessage>(&mut self) -> Result<&mut Self, RegisterError> {
        let name = T::NAME;
        if name.is_empty() {
            return Err(RegisterError::EmptyName);
        }
        if self.by_name.contains_key(name) {
            return Err(RegisterError::Duplicate(name.to_string()));
        }
        let type_id = TypeId::of::<T>();
        if let Some(existing) = self.by_type.get(&type_id) {
            return Err(RegisterError::DuplicateType {
                existing: *existing,
                requested: name,
            });
        }

        self.by_type.insert(type_id, name);
        self.by_name.insert(
            name,
            MsgInfo {
                name,
                type_id,
                decode: decode_as::<T>,
                encode: encode_as::<T>,
                router: None,
            },
        );
        debug!(msg_type = name, "Registered message type");
        Ok(self)
    }

    /// Attaches a router to the already registered `T`.
    pub fn set_router<T: NamedMessage>(
        &mut self,
        router: Arc<dyn MessageRouter>,
    ) -> Result<&mut Self, RegisterError> {
        match self.by_name.get_mut(T::NAME) {
            Some(info) if info.type_id == TypeId::of::<T>() => {
                info.router = Some(router);
                Ok(self)
            }
            _ => Err(RegisterError::NotRegistered(T::NAME.to_string())),
        }
    }

    /// Freezes the registration table.
    pub fn build(self) -> JsonProcessor {
        JsonProcessor {
            by_name: self.by_name,
            by_type: self.by_type,
        }
    }
}

/// Immutable tagged-envelope processor, safe to share across agents.
pub struct JsonProcessor {
    by_name: HashMap<&'static str, MsgInfo>,
    by_type: HashMap<TypeId, &'static str>,
}

impl JsonProcessor {
    /// Starts a registration phase.
    pub fn builder() -> JsonProcessorBuilder {
        JsonProcessorBuilder::new()
    }

    /// Returns `true` if `name` is a registered wire tag.
    pub fn is_registered(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Number of registered message types.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Returns `true` when no message type is registered.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    fn info_for(&self, msg: &dyn Message) -> Result<&MsgInfo, ProcessorError> {
        self.by_type
            .get(&runtime_type(msg))
            .and_then(|name| self.by_name.get(name))
            .ok_or(ProcessorError::UnknownType(msg.name()))
    }
}

impl Processor for JsonProcessor {
    fn unmarshal(&self, data: &[u8]) -> Result<Box<dyn Message>, ProcessorError> {
        // `null` decodes to no envelope at all.
        let envelope: Option<HashMap<String, &RawValue>> =
            serde_json::from_slice(data).map_err(|e| ProcessorError::Decode(e.to_string()))?;
        let Some(envelope) = envelope else {
            return Err(ProcessorError::InvalidData);
        };
        if envelope.len() != 1 {
            return Err(ProcessorError::InvalidData);
        }
        let Some((name, raw)) = envelope.into_iter().next() else {
            return Err(ProcessorError::InvalidData);
        };

        let info = self
            .by_name
            .get(name.as_str())
            .ok_or(ProcessorError::NotRegistered(name))?;
        (info.decode)(raw).map_err(|e| ProcessorError::Decode(e.to_string()))
    }

    fn marshal(&self, msg: &dyn Message) -> Result<Vec<Vec<u8>>, ProcessorError> {
        let info = self.info_for(msg)?;
        let payload = (info.encode)(msg)?;

        let mut envelope = HashMap::with_capacity(1);
        envelope.insert(info.name, payload);
        let data =
            serde_json::to_vec(&envelope).map_err(|e| ProcessorError::Encode(e.to_string()))?;
        Ok(vec![data])
    }

    fn route(&self, msg: Box<dyn Message>, agent: AgentHandle) -> Result<(), ProcessorError> {
        let info = self.info_for(&*msg)?;
        if let Some(router) = &info.router {
            router.deliver(Delivery {
                type_id: info.type_id,
                type_name: info.name,
                message: msg,
                agent,
            })?;
        }
        Ok(())
    }
}
