pub mod registry;

pub use registry::{custom_counter, custom_summary, Metrics};
