/// Adapter-side helpers for the geodata services
///
/// Service adapters build requests and hand them to the engine as
/// `RepeatableOperation`s. `http` covers the common parts: status and
/// transport classification, and a JSON GET operation.
pub mod http;

pub use http::{build_client, classify_status, classify_transport, JsonGetOperation, TIMEOUT_SECS};
