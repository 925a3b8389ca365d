mod context;
pub use context::{Builder, Context, Features, HardwareStatus, SubmitArgs, features};

mod device;

mod dispatch;
pub use dispatch::Strategy;

pub mod errors;
pub use errors::VipError;

pub mod platform;

mod queue;
pub use queue::QueueKind;

mod table;

pub mod task;

mod utils;

#[cfg(test)]
mod test_utils;
