pub mod controller;
pub mod loop_worker;
pub mod source;

pub use controller::SensingController;
pub use loop_worker::CaptureSettings;
pub use source::{ActivitySource, CaptureError, CommandSource};
