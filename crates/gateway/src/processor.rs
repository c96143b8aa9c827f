//! Wire-format adapter contract and the router hand-off it feeds.

use std::any::TypeId;

use proto::{DispatchError, Message, ProcessorError};

use crate::agent::AgentHandle;

/// Decodes, encodes and routes application messages for one wire format.
///
/// A processor is shared by every connection agent of a gate and is called
/// from all of their read loops and writers at once. Implementations must be
/// stateless after construction, or synchronize internally; registration
/// belongs to construction and never overlaps with traffic.
pub trait Processor: Send + Sync + 'static {
    /// Decodes one inbound frame into a typed message.
    fn unmarshal(&self, data: &[u8]) -> Result<Box<dyn Message>, ProcessorError>;

    /// Encodes a typed message into the frames of a single transport write.
    fn marshal(&self, msg: &dyn Message) -> Result<Vec<Vec<u8>>, ProcessorError>;

    /// Hands a decoded message and its originating agent to the registered router.
    ///
    /// A registered type without a router is accepted and dropped.
    fn route(&self, msg: Box<dyn Message>, agent: AgentHandle) -> Result<(), ProcessorError>;
}

/// One routed message on its way to a handler.
#[derive(Debug)]
pub struct Delivery {
    /// Runtime type of `message`.
    pub type_id: TypeId,
    /// Wire tag of `message`.
    pub type_name: &'static str,
    /// The decoded message.
    pub message: Box<dyn Message>,
    /// Agent the message was read from.
    pub agent: AgentHandle,
}

/// Receives routed messages for a registered type.
///
/// `deliver` runs on the agent's read loop and must only enqueue; the
/// handler itself runs wherever the router decides.
pub trait MessageRouter: Send + Sync {
    /// Enqueues a delivery without waiting for it to be handled.
    fn deliver(&self, delivery: Delivery) -> Result<(), DispatchError>;
}
