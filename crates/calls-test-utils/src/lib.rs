//! # Calls Test Utilities
//!
//! Mocks and fixtures for exercising the calls service without a host,
//! a Redis server or a media daemon.
//!
//! ## Modules
//!
//! - `mock_identity` - Host identity API with a non-atomic create-if-absent
//! - `mock_transport` - Client transport that records writes
//! - `mock_backend` - Media backend driven by the test
//! - `mock_daemon` - Loopback WebSocket media daemon
//! - `mock_jobs` - Recording job service that counts init attempts
//! - `failing_store` - Coordination store that is always unreachable
//! - `fixtures` - Configuration and message builders
//!
//! ## Usage
//!
//! ```rust,ignore
//! use calls_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let identity = MockIdentityService::new();
//!     let transport = RecordingTransport::new();
//!     transport.connect("sess-1");
//!
//!     let config = TestConfig::new().node_id("node-a").build();
//!     let join = client_message("call-1", "sess-1", MessageKind::Join);
//!     // ...
//! }
//! ```

pub mod failing_store;
pub mod fixtures;
pub mod mock_backend;
pub mod mock_daemon;
pub mod mock_identity;
pub mod mock_jobs;
pub mod mock_transport;

pub use failing_store::*;
pub use fixtures::*;
pub use mock_backend::*;
pub use mock_daemon::*;
pub use mock_identity::*;
pub use mock_jobs::*;
pub use mock_transport::*;
