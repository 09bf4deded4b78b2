//! Controller-wide event broadcast
//!
//! A typed publish/subscribe hub with one channel per event kind. Ordering
//! is preserved within each channel; there is no cross-channel ordering
//! guarantee beyond "a `status_update` is observable after the mutation that
//! caused it".

mod hub;

pub use hub::{EventHub, EventHubConfig};
