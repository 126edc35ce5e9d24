//! The contract every backend driver implements.
//!
//! A driver owns the native handles for at most one stream and the thread
//! (its own, or one supplied by the native API) that drives the period loop.
//! The engine owns everything else — state machine, buffers, conversion
//! tables — inside the [`StreamShared`] the driver exposes.
//!
//! # The period loop
//!
//! Whatever the thread model, every backend performs the same cycle once per
//! period, holding the stream lock for the processing (not for blocking
//! waits):
//!
//! 1. Determine the period's input and output timestamps
//!    ([`StreamCore::period_timestamps`] unless the backend has better
//!    clocks).
//! 2. If capturing, read one period into
//!    [`StreamCore::input_read_target`] and call
//!    [`StreamCore::finish_input_period`].
//! 3. Invoke the user callback exactly once via
//!    [`StreamCore::run_callback`]; the status set delivered there reflects
//!    xrun latches recorded before entry.
//! 4. If playing, write the bytes returned by
//!    [`StreamCore::render_output_period`].
//! 5. Call [`StreamCore::tick_stream_time`].
//! 6. Honor the callback's verdict: [`CallbackResult::Stop`] drains then
//!    stops, [`CallbackResult::Abort`] discards and stops. Backends whose
//!    native API forbids stopping from inside its own callback post the
//!    request with [`StreamShared::post_stop_request`] and let a supervisor
//!    thread act on it.
//!
//! # Xruns
//!
//! Detect underrun/overflow from the native API's broken-pipe indicator or
//! short transfers, latch the corresponding [`StreamCore::xrun`] slot,
//! recover the device (prepare/restart) and keep running. An xrun is never
//! an error; it surfaces as a status flag on the next callback. Truly
//! unrecoverable native failures force the stream to `stopped` and are
//! reported from the next engine call that touches the driver.

#![allow(unused_imports)] // referenced by the contract docs above

use std::sync::Arc;

use crate::error::Result;
use crate::platform::BackendId;
use crate::stream::{Direction, StreamCore, StreamShared};
use crate::{CallbackResult, DeviceInfo, SampleFormat, StreamOptions, StreamParams};

/// Parameters for probing one direction of a stream open.
pub(crate) struct OpenRequest<'a> {
    pub direction: Direction,
    pub params: StreamParams,
    pub format: SampleFormat,
    pub sample_rate: u32,
    /// Requested period size; the driver writes the accepted value into
    /// `StreamCore::buffer_frames`. `0` means "your minimum".
    pub buffer_frames: u32,
    pub options: &'a StreamOptions,
}

/// A backend driver. One instance serves at most one stream.
pub(crate) trait Driver: Send {
    /// Which backend this driver talks to.
    fn backend(&self) -> BackendId;

    /// The engine state this driver's stream lives in.
    fn shared(&self) -> &Arc<StreamShared>;

    fn device_count(&mut self) -> Result<usize>;

    fn device_info(&mut self, device: usize) -> Result<DeviceInfo>;

    fn default_output_device(&mut self) -> usize {
        0
    }

    fn default_input_device(&mut self) -> usize {
        0
    }

    /// Attempts to open one direction against the native API.
    ///
    /// On success the driver has: selected the best-matching native format,
    /// filled the direction's endpoint descriptor (`device_channels`,
    /// `device_format`, `device_interleaved`, `do_byte_swap`, latency if
    /// known), written the accepted period size into
    /// `StreamCore::buffer_frames` and the period count into
    /// `StreamCore::n_buffers`, and called `StreamCore::setup_direction`.
    ///
    /// On failure nothing of the direction remains open; a failed second
    /// direction must not disturb the first (the engine closes the whole
    /// stream afterwards).
    fn probe_open(&mut self, request: &OpenRequest<'_>) -> Result<()>;

    /// Releases native handles and joins any device thread. The engine
    /// clears the stream core afterwards; the driver must not touch
    /// engine-owned buffers once this returns.
    fn close(&mut self);

    /// `stopped -> running`: make the device roll and wake the period loop.
    /// The stream clock has already been re-anchored.
    fn start(&mut self) -> Result<()>;

    /// `running -> stopped`, draining: everything already buffered plays out
    /// before this returns.
    fn stop(&mut self) -> Result<()>;

    /// `running -> stopped`, discarding buffered audio immediately.
    fn abort(&mut self) -> Result<()>;
}
