use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier of a connection agent within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub u64);

impl AgentId {
    /// Allocates the next identifier. Identifiers are never reused.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric identifier.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent-{}", self.0)
    }
}

impl From<u64> for AgentId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A decoded, type-erased application message.
///
/// Implemented for every [`NamedMessage`]; handlers recover the concrete
/// type with [`downcast_ref`](dyn Message::downcast_ref) or
/// [`downcast`](dyn Message::downcast).
pub trait Message: Any + Send + Sync + fmt::Debug {
    /// Wire tag of the concrete type.
    fn name(&self) -> &'static str;

    /// Borrows the message as [`Any`].
    fn as_any(&self) -> &dyn Any;

    /// Converts the boxed message into a boxed [`Any`].
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

/// A message type with a stable wire tag.
///
/// `NAME` is the key of the single-field envelope on the wire and must be
/// unique among the types registered with one processor.
pub trait NamedMessage: Serialize + DeserializeOwned + Any + Send + Sync + fmt::Debug {
    /// Case-sensitive wire tag.
    const NAME: &'static str;
}

impl<T: NamedMessage> Message for T {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

impl dyn Message {
    /// Returns `true` if the concrete type is `T`.
    pub fn is<T: Message>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Borrows the concrete message if it is a `T`.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Takes the concrete message if it is a `T`.
    pub fn downcast<T: Message>(self: Box<Self>) -> Option<Box<T>> {
        self.into_any().downcast::<T>().ok()
    }
}
