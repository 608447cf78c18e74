//! Message routing between execution contexts, ordered port channels, and
//! lifecycle supervision of the ephemeral coordinator context.
//!
//! The host delivery primitive is abstracted behind [`HostTransport`]; an
//! in-process [`LoopbackTransport`] backs tests and demos.

pub mod ports;
pub mod registry;
pub mod router;
pub mod supervisor;
pub mod transport;

pub use ports::{PortEvent, PortHandle, PortManager, PortState};
pub use registry::ContextRegistry;
pub use router::{Router, RouterConfig, UnreachablePolicy};
pub use supervisor::{CoordinatorHandle, StartupHandler, Supervisor, WakeSchedule};
pub use transport::{HostTransport, LoopbackTransport, TransportError};
