// Exports
pub(crate) mod sim;
pub(crate) use sim::{CHIP_WITH_CANCEL, CHIP_WITHOUT_CANCEL, HwMode, SimPlatform};

pub(crate) mod spy;
pub(crate) use spy::{Call, Method};

use crate::context::{Builder, Context};
use std::sync::Arc;

/// Builds a context on top of `platform`, keeping a handle on the simulator.
pub(crate) fn context_with(builder: Builder, platform: &Arc<SimPlatform>) -> Context {
    builder
        .try_build(Arc::clone(platform) as Arc<dyn crate::platform::Platform>)
        .expect("failed to build context")
}
