//! HTTP transport and request layer.

mod request;
mod transport;

pub use request::{ApiClient, RequestError, make_url};
pub use transport::{TransportConfig, build_transport};
