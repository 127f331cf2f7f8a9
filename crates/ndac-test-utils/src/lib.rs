// ndac-test-utils: Shared test utilities for the collector.
//
// Provides a mock NDAC REST server and a mock alarm webhook for integration
// testing of session handling, polling and notification.

pub mod mock_ndac_server;
pub mod mock_webhook;

pub use mock_ndac_server::{MockNdacServer, RecordedRequest};
pub use mock_webhook::MockWebhook;
