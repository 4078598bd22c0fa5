//! Test support utilities for delivery and pipeline tests

pub mod mock_receiver;

pub use mock_receiver::MockReceiver;
