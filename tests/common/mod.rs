//! Common test utilities for gateway integration tests.

pub mod mock_transport;

pub use mock_transport::MockTransport;
