pub mod transport;
#[cfg(feature = "http")]
pub mod http;
pub mod mock;

pub use transport::{HttpTransport, TransportError, TransportErrorKind};
#[cfg(feature = "http")]
pub use http::{ReqwestTransport, TransportConfig};
pub use mock::MockTransport;
