// dispatcher-bus: Umbrella crate re-exporting the protocol, transport and
// connection layers.  The integration suites under tests/integration/
// exercise the workspace end-to-end.

pub use dispatcher_core::*;
pub use dispatcher_proto as proto;
pub use dispatcher_transport as transport;
