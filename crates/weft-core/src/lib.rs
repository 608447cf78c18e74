pub mod context;
pub mod envelope;
pub mod errors;
pub mod ids;

pub use context::{ContextDescriptor, ContextId, ContextKind, Liveness};
pub use envelope::{Envelope, Mode, Target};
pub use errors::{DisconnectReason, RouteError};
pub use ids::{MessageId, PortId, WakeId};
