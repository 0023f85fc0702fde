mod connection;
mod cookies;
mod error;
mod page;
mod transport;
mod types;

pub use connection::{CdpConfig, CdpConnection, ConnectionEvent, ConnectionState};
pub use cookies::CookieBridge;
pub use error::CdpError;
pub use page::{Page, Viewport, clearable_origin};
pub use types::{CdpEvent, CdpResponse, result_str};
