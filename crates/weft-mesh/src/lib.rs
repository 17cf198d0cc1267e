//! weft-mesh — pipes, framing, reliable delivery, discovery, routing, and
//! the mesh orchestrator.
//!
//! Layering, bottom up: a [`pipe::Pipe`] moves size-bounded byte records
//! over one physical channel; the [`framer`] splits payloads into
//! hash-verified chunks and reassembles them; a [`reliability`] manager
//! turns one pipe into at-least-once, integrity-checked frame delivery;
//! [`discovery`] finds peers; [`routing`] remembers multi-hop paths; and
//! [`mesh`] ties them together into addressed and broadcast message
//! delivery across hops.

pub mod discovery;
pub mod framer;
pub mod listener;
pub mod mesh;
pub mod pipe;
pub mod reliability;
pub mod routing;

mod seen;

pub use discovery::{PeerEvent, UdpDiscovery};
pub use framer::{Framer, FramerError, InboundFrame, Reassembler};
pub use mesh::{MeshError, MeshHandle, MeshNode, MeshState};
pub use pipe::{Pipe, PipeError, PipeRegistry, PipeState, PipeStatus};
pub use reliability::{ReliabilityConfig, ReliabilityError, ReliabilityHandle, ReliabilityManager};
pub use routing::{RoutingEntry, RoutingTable};
