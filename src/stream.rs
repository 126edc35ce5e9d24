//! Stream state, per-direction descriptors and the period-processing core.
//!
//! A [`StreamCore`] holds everything the engine owns for one open stream:
//! the state machine, both direction descriptors, the user and device
//! buffers, the conversion tables and the stream clock. It lives behind the
//! stream mutex in a [`StreamShared`], which also carries the condition
//! variable a parked device thread waits on between `stop` and `start`.
//!
//! Locking discipline: the control path (`open`/`start`/`stop`/`abort`/
//! `close`) and the device thread both take the mutex; the device thread
//! holds it for the duration of one period's processing and re-checks the
//! state after every wakeup.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use crate::convert::{convert_buffer, ConvertInfo, SideLayout};
use crate::format::{byte_swap_buffer, SampleFormat};
use crate::{CallbackResult, Data, StreamData, StreamInstant, StreamStatus};

/// Boxed user callback as stored by the engine.
pub(crate) type BoxedCallback =
    Box<dyn FnMut(&mut StreamData<'_>) -> CallbackResult + Send + 'static>;

/// One of the two transfer directions of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Output,
    Input,
}

impl Direction {
    #[inline]
    pub(crate) fn idx(self) -> usize {
        match self {
            Direction::Output => 0,
            Direction::Input => 1,
        }
    }
}

/// Stream lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamState {
    Closed,
    Stopped,
    Running,
    /// A drain or discard was requested from inside the callback and has not
    /// completed yet.
    Stopping,
}

/// Which directions the open stream serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamMode {
    None,
    Output,
    Input,
    Duplex,
}

impl StreamMode {
    #[inline]
    pub(crate) fn has_output(self) -> bool {
        matches!(self, StreamMode::Output | StreamMode::Duplex)
    }

    #[inline]
    pub(crate) fn has_input(self) -> bool {
        matches!(self, StreamMode::Input | StreamMode::Duplex)
    }
}

/// How to wind the stream down after the current period.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopKind {
    Drain,
    Discard,
}

/// A byte buffer aligned for any sample type, so typed views handed to the
/// callback are always validly aligned.
#[derive(Debug, Default)]
pub(crate) struct AlignedBuffer {
    storage: Vec<u64>,
    len: usize,
}

impl AlignedBuffer {
    pub(crate) fn zeroed(len: usize) -> AlignedBuffer {
        AlignedBuffer {
            storage: vec![0; len.div_ceil(8)],
            len,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub(crate) fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.storage.as_ptr() as *const u8, self.len) }
    }

    #[inline]
    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.storage.as_mut_ptr() as *mut u8, self.len) }
    }

    #[inline]
    pub(crate) fn as_ptr_mut(&mut self) -> *mut () {
        self.storage.as_mut_ptr() as *mut ()
    }

    pub(crate) fn clear(&mut self) {
        self.storage.clear();
        self.len = 0;
    }
}

/// Everything the engine tracks for one direction.
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub device: usize,
    pub user_channels: u32,
    pub device_channels: u32,
    pub first_channel: u32,
    pub device_format: SampleFormat,
    pub device_interleaved: bool,
    pub do_byte_swap: bool,
    pub do_convert: bool,
    /// Frames of delay reported by the backend; 0 when unknown.
    pub latency: u64,
    pub user_buffer: AlignedBuffer,
    pub convert_info: Option<ConvertInfo>,
}

impl Default for Endpoint {
    fn default() -> Endpoint {
        Endpoint {
            device: usize::MAX,
            user_channels: 0,
            device_channels: 0,
            first_channel: 0,
            device_format: SampleFormat::I16,
            device_interleaved: true,
            do_byte_swap: false,
            do_convert: false,
            latency: 0,
            user_buffer: AlignedBuffer::default(),
            convert_info: None,
        }
    }
}

/// The engine-owned heart of a stream. Guarded by the stream mutex.
pub(crate) struct StreamCore {
    pub state: StreamState,
    pub mode: StreamMode,
    pub sample_rate: u32,
    pub buffer_frames: u32,
    pub n_buffers: u32,
    pub user_format: SampleFormat,
    pub user_interleaved: bool,
    /// Indexed by [`Direction::idx`]: output then input.
    pub endpoints: [Endpoint; 2],
    /// Shared by both directions; sized for the larger one. Present only
    /// when at least one direction converts.
    pub device_buffer: AlignedBuffer,
    pub callback: Option<BoxedCallback>,
    /// Xrun latches set by the driver, drained into the next period's status.
    pub xrun: [bool; 2],
    /// Cleared by `close` so device threads exit at their next suspension
    /// point.
    pub thread_running: bool,
    /// Stop request posted from inside a native callback, consumed by the
    /// driver's supervisor outside of it.
    pub pending_stop: Option<StopKind>,
    start_time: StreamInstant,
    duration_nanos: i64,
}

impl Default for StreamCore {
    fn default() -> StreamCore {
        StreamCore {
            state: StreamState::Closed,
            mode: StreamMode::None,
            sample_rate: 0,
            buffer_frames: 0,
            n_buffers: 0,
            user_format: SampleFormat::I16,
            user_interleaved: true,
            endpoints: [Endpoint::default(), Endpoint::default()],
            device_buffer: AlignedBuffer::default(),
            callback: None,
            xrun: [false, false],
            thread_running: false,
            pending_stop: None,
            start_time: StreamInstant::default(),
            duration_nanos: 0,
        }
    }
}

impl StreamCore {
    /// Resets every field to its closed-stream default, dropping buffers and
    /// the installed callback.
    pub(crate) fn clear(&mut self) {
        *self = StreamCore::default();
    }

    /// Computes `do_convert`, allocates the user buffer (and grows the shared
    /// device buffer if needed) and builds the conversion table for one
    /// successfully probed direction. The driver must already have filled the
    /// endpoint descriptor, `buffer_frames`, `sample_rate`, `user_format`
    /// and `user_interleaved`.
    pub(crate) fn setup_direction(&mut self, direction: Direction, first_channel: u32) {
        let frames = self.buffer_frames as usize;
        let idx = direction.idx();
        let user_format = self.user_format;
        let user_interleaved = self.user_interleaved;

        let ep = &mut self.endpoints[idx];
        ep.first_channel = first_channel;
        ep.do_convert = user_format != ep.device_format
            || ep.user_channels < ep.device_channels
            || (ep.device_interleaved != user_interleaved && ep.user_channels > 1);

        let user_bytes = ep.user_channels as usize * frames * user_format.sample_size();
        ep.user_buffer = AlignedBuffer::zeroed(user_bytes);

        if ep.do_convert {
            let device_bytes =
                ep.device_channels as usize * frames * ep.device_format.sample_size();
            ep.convert_info = Some(ConvertInfo::build(
                direction,
                SideLayout {
                    channels: ep.user_channels as usize,
                    format: user_format,
                    interleaved: user_interleaved,
                },
                SideLayout {
                    channels: ep.device_channels as usize,
                    format: ep.device_format,
                    interleaved: ep.device_interleaved,
                },
                frames,
                first_channel as usize,
            ));
            if device_bytes > self.device_buffer.len() {
                self.device_buffer = AlignedBuffer::zeroed(device_bytes);
            }
        }
    }

    /// Bytes one device-side period occupies for `direction`.
    pub(crate) fn device_period_bytes(&self, direction: Direction) -> usize {
        let ep = &self.endpoints[direction.idx()];
        let frames = self.buffer_frames as usize;
        if ep.do_convert {
            ep.device_channels as usize * frames * ep.device_format.sample_size()
        } else {
            ep.user_channels as usize * frames * self.user_format.sample_size()
        }
    }

    /// The buffer a driver should read one input period into: the shared
    /// device buffer when the direction converts, the user buffer otherwise.
    pub(crate) fn input_read_target(&mut self) -> &mut [u8] {
        let bytes = self.device_period_bytes(Direction::Input);
        if self.endpoints[1].do_convert {
            &mut self.device_buffer.as_bytes_mut()[..bytes]
        } else {
            &mut self.endpoints[1].user_buffer.as_bytes_mut()[..bytes]
        }
    }

    /// Byte-swaps and converts the freshly read input period into the user
    /// buffer.
    pub(crate) fn finish_input_period(&mut self) {
        let frames = self.buffer_frames as usize;
        let bytes = self.device_period_bytes(Direction::Input);
        let user_format = self.user_format;
        let StreamCore {
            endpoints,
            device_buffer,
            ..
        } = self;
        let ep = &mut endpoints[1];
        if ep.do_convert {
            if ep.do_byte_swap {
                byte_swap_buffer(&mut device_buffer.as_bytes_mut()[..bytes], ep.device_format);
            }
            let info = ep.convert_info.as_ref().expect("convert info for input");
            convert_buffer(
                ep.user_buffer.as_bytes_mut(),
                &device_buffer.as_bytes()[..bytes],
                info,
                frames,
                false,
            );
        } else if ep.do_byte_swap {
            byte_swap_buffer(ep.user_buffer.as_bytes_mut(), user_format);
        }
    }

    /// Converts and byte-swaps the user output buffer into device layout,
    /// returning the bytes to hand to the device for this period.
    pub(crate) fn render_output_period(&mut self) -> &[u8] {
        let frames = self.buffer_frames as usize;
        let bytes = self.device_period_bytes(Direction::Output);
        // Uncovered output channels of a lopsided duplex device stay silent.
        let zero_first = self.mode == StreamMode::Duplex
            && self.endpoints[0].device_channels < self.endpoints[1].device_channels;
        let user_format = self.user_format;
        let StreamCore {
            endpoints,
            device_buffer,
            ..
        } = self;
        let ep = &mut endpoints[0];
        if ep.do_convert {
            let info = ep.convert_info.as_ref().expect("convert info for output");
            convert_buffer(
                &mut device_buffer.as_bytes_mut()[..bytes],
                ep.user_buffer.as_bytes(),
                info,
                frames,
                zero_first,
            );
            if ep.do_byte_swap {
                byte_swap_buffer(&mut device_buffer.as_bytes_mut()[..bytes], ep.device_format);
            }
            &device_buffer.as_bytes()[..bytes]
        } else {
            if ep.do_byte_swap {
                byte_swap_buffer(ep.user_buffer.as_bytes_mut(), user_format);
            }
            &ep.user_buffer.as_bytes()[..bytes]
        }
    }

    /// Drains the xrun latches into a status set for the next callback.
    pub(crate) fn take_status(&mut self) -> StreamStatus {
        let status = StreamStatus {
            underflow: self.xrun[0],
            overflow: self.xrun[1],
        };
        self.xrun = [false, false];
        status
    }

    /// Invokes the user callback exactly once with views over the user
    /// buffers. The caller supplies per-period timestamps; status latches are
    /// drained here.
    pub(crate) fn run_callback(
        &mut self,
        input_time: StreamInstant,
        output_time: StreamInstant,
    ) -> CallbackResult {
        let status = self.take_status();
        let frames = self.buffer_frames as usize;
        let user_format = self.user_format;
        let mut callback = match self.callback.take() {
            Some(callback) => callback,
            None => return CallbackResult::Abort,
        };

        let input = if self.mode.has_input() {
            let ep = &mut self.endpoints[1];
            let samples = ep.user_channels as usize * frames;
            Some(unsafe { Data::from_parts(ep.user_buffer.as_ptr_mut(), samples, user_format) })
        } else {
            None
        };
        let mut output = if self.mode.has_output() {
            let ep = &mut self.endpoints[0];
            let samples = ep.user_channels as usize * frames;
            Some(unsafe { Data::from_parts(ep.user_buffer.as_ptr_mut(), samples, user_format) })
        } else {
            None
        };

        let mut data = StreamData {
            input: input.as_ref(),
            output: output.as_mut(),
            input_time,
            output_time,
            frames,
            status,
        };
        let flow = callback(&mut data);
        self.callback = Some(callback);
        flow
    }

    /// Anchors the stream clock; called once per `start_stream`.
    pub(crate) fn start_clock(&mut self) {
        self.start_time = monotonic_now();
        self.duration_nanos = 0;
    }

    /// Advances the stream clock by exactly one period.
    pub(crate) fn tick_stream_time(&mut self) {
        if self.sample_rate == 0 {
            return;
        }
        self.duration_nanos += self.buffer_frames as i64 * 1_000_000_000 / self.sample_rate as i64;
    }

    /// The clock anchor sampled at the last start.
    pub(crate) fn start_time(&self) -> StreamInstant {
        self.start_time
    }

    /// `start_time + duration`, or the zero instant while closed.
    pub(crate) fn stream_time(&self) -> StreamInstant {
        if self.state == StreamState::Closed {
            return StreamInstant::default();
        }
        StreamInstant::from_nanos(self.start_time.as_nanos() + self.duration_nanos)
    }

    /// Latency of one period expressed as wall time, used by drivers to
    /// offset the callback timestamps.
    pub(crate) fn frames_duration(&self, frames: u64) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(frames * 1_000_000_000 / self.sample_rate as u64)
    }

    /// Per-period timestamps for the callback: input shifted back by the
    /// capture delay, output shifted forward by the playback delay.
    pub(crate) fn period_timestamps(&self) -> (StreamInstant, StreamInstant) {
        let now = self.stream_time();
        let input = now.sub(self.frames_duration(self.endpoints[1].latency));
        let output = now.add(self.frames_duration(self.endpoints[0].latency));
        (input, output)
    }

    /// Sum of both directions' reported latencies, in frames.
    pub(crate) fn total_latency(&self) -> u64 {
        let mut total = 0;
        if self.mode.has_output() {
            total += self.endpoints[0].latency;
        }
        if self.mode.has_input() {
            total += self.endpoints[1].latency;
        }
        total
    }
}

/// What a parked device thread should do after waking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ThreadGate {
    Run,
    Exit,
}

/// The mutex/condvar pair shared between the control path and the device
/// thread of one stream.
pub(crate) struct StreamShared {
    core: Mutex<StreamCore>,
    runnable: Condvar,
}

impl StreamShared {
    pub(crate) fn new() -> Arc<StreamShared> {
        Arc::new(StreamShared {
            core: Mutex::new(StreamCore::default()),
            runnable: Condvar::new(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StreamCore> {
        self.core.lock().unwrap()
    }

    /// Non-blocking lock for native real-time callbacks: rather than risk a
    /// priority inversion against the control path, a contended period is
    /// skipped (silence out, input dropped).
    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, StreamCore>> {
        self.core.try_lock().ok()
    }

    /// Wakes a device thread parked in [`StreamShared::wait_runnable`].
    pub(crate) fn notify(&self) {
        self.runnable.notify_all();
    }

    /// Parks the calling device thread until the stream is running or the
    /// thread is asked to exit. Re-checks the state under the lock after
    /// every wakeup.
    pub(crate) fn wait_runnable(&self) -> ThreadGate {
        let mut core = self.lock();
        loop {
            if !core.thread_running {
                return ThreadGate::Exit;
            }
            match core.state {
                StreamState::Running | StreamState::Stopping => return ThreadGate::Run,
                _ => core = self.runnable.wait(core).unwrap(),
            }
        }
    }

    /// Posts a stop request from inside a native callback; a supervisor
    /// thread performs the actual stop outside of it.
    pub(crate) fn post_stop_request(&self, kind: StopKind) {
        let mut core = self.lock();
        if core.state == StreamState::Running {
            core.state = StreamState::Stopping;
        }
        core.pending_stop = Some(kind);
        drop(core);
        self.notify();
    }

    /// Blocks until a stop request or thread shutdown arrives. Used by the
    /// supervisor threads of callback-driven backends.
    pub(crate) fn wait_stop_request(&self) -> Option<StopKind> {
        let mut core = self.lock();
        loop {
            if let Some(kind) = core.pending_stop.take() {
                return Some(kind);
            }
            if !core.thread_running {
                return None;
            }
            core = self.runnable.wait(core).unwrap();
        }
    }
}

/// Consumes stop requests posted from inside native callbacks and completes
/// the `stopping -> stopped` transition outside of them. Used by backends
/// whose native API forbids stopping from its own callback.
pub(crate) fn spawn_stop_supervisor(
    shared: Arc<StreamShared>,
    name: &str,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("{name}-stop"))
        .spawn(move || {
            while let Some(_kind) = shared.wait_stop_request() {
                let mut core = shared.lock();
                if core.state == StreamState::Stopping {
                    core.state = StreamState::Stopped;
                }
            }
        })
}

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// The process-wide monotonic clock stream times are expressed in.
pub(crate) fn monotonic_now() -> StreamInstant {
    StreamInstant::from_nanos(epoch().elapsed().as_nanos() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn open_core(
        mode: StreamMode,
        user_format: SampleFormat,
        device_format: SampleFormat,
        user_channels: u32,
        device_channels: u32,
    ) -> StreamCore {
        let mut core = StreamCore::default();
        core.state = StreamState::Stopped;
        core.mode = mode;
        core.sample_rate = 48_000;
        core.buffer_frames = 64;
        core.user_format = user_format;
        if mode.has_output() {
            let ep = &mut core.endpoints[0];
            ep.device = 0;
            ep.user_channels = user_channels;
            ep.device_channels = device_channels;
            ep.device_format = device_format;
            core.setup_direction(Direction::Output, 0);
        }
        if mode.has_input() {
            let ep = &mut core.endpoints[1];
            ep.device = 0;
            ep.user_channels = user_channels;
            ep.device_channels = device_channels;
            ep.device_format = device_format;
            core.setup_direction(Direction::Input, 0);
        }
        core
    }

    #[test]
    fn user_buffer_sized_from_user_descriptor() {
        for format in SampleFormat::ALL {
            for channels in [1u32, 2, 6] {
                let core = open_core(StreamMode::Output, format, format, channels, channels);
                assert_eq!(
                    core.endpoints[0].user_buffer.len(),
                    channels as usize * 64 * format.sample_size(),
                );
            }
        }
    }

    #[test]
    fn convert_predicate_matches_descriptor_mismatches() {
        // Same everything: no conversion, no device buffer.
        let core = open_core(
            StreamMode::Output,
            SampleFormat::I16,
            SampleFormat::I16,
            2,
            2,
        );
        assert!(!core.endpoints[0].do_convert);
        assert!(core.device_buffer.is_empty());

        // Format mismatch.
        let core = open_core(
            StreamMode::Output,
            SampleFormat::F32,
            SampleFormat::I16,
            2,
            2,
        );
        assert!(core.endpoints[0].do_convert);
        assert_eq!(core.device_buffer.len(), 2 * 64 * 2);

        // Device wider than the user stream.
        let core = open_core(
            StreamMode::Output,
            SampleFormat::I16,
            SampleFormat::I16,
            2,
            8,
        );
        assert!(core.endpoints[0].do_convert);

        // Planar device, multi-channel user stream.
        let mut core = StreamCore::default();
        core.mode = StreamMode::Output;
        core.buffer_frames = 64;
        core.sample_rate = 48_000;
        core.user_format = SampleFormat::I16;
        let ep = &mut core.endpoints[0];
        ep.user_channels = 2;
        ep.device_channels = 2;
        ep.device_format = SampleFormat::I16;
        ep.device_interleaved = false;
        core.setup_direction(Direction::Output, 0);
        assert!(core.endpoints[0].do_convert);
    }

    #[test]
    fn stream_time_advances_exactly_one_period_per_tick() {
        let mut core = open_core(
            StreamMode::Output,
            SampleFormat::I16,
            SampleFormat::I16,
            2,
            2,
        );
        core.buffer_frames = 512;
        core.start_clock();
        let t0 = core.stream_time();
        let mut previous = t0;
        for _ in 0..5 {
            core.tick_stream_time();
            let now = core.stream_time();
            let delta = now.duration_since(&previous).unwrap();
            assert_eq!(delta.as_nanos() as i64, 512i64 * 1_000_000_000 / 48_000);
            previous = now;
        }
        assert_eq!(
            core.stream_time().duration_since(&t0).unwrap().as_nanos() as i64,
            5 * (512i64 * 1_000_000_000 / 48_000),
        );
    }

    #[test]
    fn closed_stream_reports_zero_time() {
        let mut core = StreamCore::default();
        core.start_clock();
        core.tick_stream_time();
        assert_eq!(core.stream_time(), StreamInstant::default());
    }

    #[test]
    fn callback_sees_buffers_and_status_once() {
        let mut core = open_core(
            StreamMode::Duplex,
            SampleFormat::F32,
            SampleFormat::F32,
            2,
            2,
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        core.callback = Some(Box::new(move |data: &mut StreamData<'_>| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(data.frames, 64);
            assert!(data.status.underflow);
            assert!(!data.status.overflow);
            let input = data.input.as_ref().unwrap();
            assert_eq!(input.len(), 2 * 64);
            let output = data.output.as_mut().unwrap();
            output.as_slice_mut::<f32>().unwrap().fill(0.25);
            CallbackResult::Continue
        }));
        core.xrun[0] = true;
        let (input_time, output_time) = core.period_timestamps();
        let flow = core.run_callback(input_time, output_time);
        assert_eq!(flow, CallbackResult::Continue);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The latch was drained with the delivery.
        assert!(core.take_status().is_ok());

        // The user's samples landed in the output user buffer.
        let rendered = core.render_output_period().to_vec();
        let samples: Vec<f32> = rendered
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert!(samples.iter().all(|s| *s == 0.25));
    }

    #[test]
    fn duplex_format_conversion_round_trip() {
        // f32 user stream on an i16 device: render then re-ingest.
        let mut core = open_core(
            StreamMode::Duplex,
            SampleFormat::F32,
            SampleFormat::I16,
            1,
            1,
        );
        assert!(core.endpoints[0].do_convert);
        assert!(core.endpoints[1].do_convert);

        core.callback = Some(Box::new(|data: &mut StreamData<'_>| {
            let output = data.output.as_mut().unwrap();
            let samples = output.as_slice_mut::<f32>().unwrap();
            for (i, sample) in samples.iter_mut().enumerate() {
                *sample = (i as f32 / 64.0) - 0.5;
            }
            CallbackResult::Continue
        }));
        let (input_time, output_time) = core.period_timestamps();
        core.run_callback(input_time, output_time);

        let device_bytes = core.render_output_period().to_vec();
        assert_eq!(device_bytes.len(), 64 * 2);

        // Loop the device period back in.
        core.input_read_target().copy_from_slice(&device_bytes);
        core.finish_input_period();
        let user = core.endpoints[1].user_buffer.as_bytes();
        let samples: Vec<f32> = user
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        for (i, sample) in samples.iter().enumerate() {
            let expected = (i as f32 / 64.0) - 0.5;
            assert!(
                (sample - expected).abs() < 2.0 / 32_768.0,
                "sample {i}: {sample} vs {expected}",
            );
        }
    }

    #[test]
    fn stop_request_transitions_to_stopping() {
        let shared = StreamShared::new();
        {
            let mut core = shared.lock();
            core.state = StreamState::Running;
            core.thread_running = true;
        }
        shared.post_stop_request(StopKind::Drain);
        {
            let core = shared.lock();
            assert_eq!(core.state, StreamState::Stopping);
        }
        assert_eq!(shared.wait_stop_request(), Some(StopKind::Drain));
    }
}
