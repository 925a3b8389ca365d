use crate::platform::{CoreMask, HardwareId, MemId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Allocate,
    Free,
    WriteRegister,
    Kick,
    HwInit,
    HwReset,
    HwCancel,
    HwWaitIdle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Allocate { size: usize },
    Free { mem_id: MemId },
    WriteRegister { hw: HardwareId, offset: u32, value: u32 },
    Kick { hw: HardwareId },
    HwInit { hw: HardwareId },
    HwReset { hw: HardwareId },
    HwCancel { device: usize, cores: CoreMask },
    HwWaitIdle { device: usize, expected: CoreMask },
}

const METHODS: [Method; 8] = [
    Method::Allocate,
    Method::Free,
    Method::WriteRegister,
    Method::Kick,
    Method::HwInit,
    Method::HwReset,
    Method::HwCancel,
    Method::HwWaitIdle,
];

#[derive(Debug, Clone)]
pub(crate) struct SpyState {
    calls: Arc<RwLock<HashMap<Method, Vec<Call>>>>,
}

impl SpyState {
    pub(crate) fn new() -> Self {
        Self {
            calls: Arc::new(RwLock::new(
                METHODS.iter().map(|m| (*m, Vec::new())).collect(),
            )),
        }
    }

    pub(crate) fn record(&self, method: Method, call: Call) {
        self.calls
            .write()
            .unwrap()
            .get_mut(&method)
            .expect("method not found")
            .push(call)
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.calls.read().unwrap().get(method).cloned().unwrap()
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.calls
            .read()
            .unwrap()
            .get(method)
            .map_or(0, |calls| calls.len())
    }
}
