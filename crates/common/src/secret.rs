//! Secret wrappers for credentials handled by the calls service.
//!
//! The coordination store URL, the host API token, the media daemon auth key,
//! the TURN static auth secret and bot session tokens all travel as
//! [`SecretString`]. Its `Debug` output is redacted and the value is zeroized
//! on drop, so structs that derive `Debug` stay safe to log.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct DaemonCredentials {
//!     client_id: String,
//!     auth_key: SecretString,
//! }
//!
//! let creds = DaemonCredentials {
//!     client_id: "node-a".to_string(),
//!     auth_key: SecretString::from("k3y"),
//! };
//!
//! assert!(!format!("{creds:?}").contains("k3y"));
//! assert_eq!(creds.auth_key.expose_secret(), "k3y");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
