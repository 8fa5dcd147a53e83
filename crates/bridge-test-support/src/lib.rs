//! Shared test fixtures for the bridge workspace: an in-memory route target
//! for router tests, and a mock satellite-side socket for adapter tests.

mod mock_satellite_server;
mod recording_target;

pub use mock_satellite_server::MockSatelliteServer;
pub use recording_target::{failing_target, recording_target};
