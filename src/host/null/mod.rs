//! The fallback backend: compiles everywhere, enumerates nothing.

use std::sync::Arc;

use crate::driver::{Driver, OpenRequest};
use crate::error::{Error, Result};
use crate::platform::BackendId;
use crate::stream::StreamShared;
use crate::DeviceInfo;

pub(crate) struct NullDriver {
    shared: Arc<StreamShared>,
}

impl NullDriver {
    pub(crate) fn new() -> NullDriver {
        NullDriver {
            shared: StreamShared::new(),
        }
    }
}

impl Driver for NullDriver {
    fn backend(&self) -> BackendId {
        BackendId::Null
    }

    fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    fn device_count(&mut self) -> Result<usize> {
        Ok(0)
    }

    fn device_info(&mut self, device: usize) -> Result<DeviceInfo> {
        Err(Error::invalid_use(format!(
            "device index {device} out of range (0 devices)"
        )))
    }

    fn probe_open(&mut self, _request: &OpenRequest<'_>) -> Result<()> {
        Err(Error::system("the null backend has no devices"))
    }

    fn close(&mut self) {}

    fn start(&mut self) -> Result<()> {
        Err(Error::invalid_use("the stream is not open"))
    }

    fn stop(&mut self) -> Result<()> {
        Err(Error::invalid_use("the stream is not open"))
    }

    fn abort(&mut self) -> Result<()> {
        Err(Error::invalid_use("the stream is not open"))
    }
}
