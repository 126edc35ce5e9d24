//! Backend-independent stream orchestration.
//!
//! These functions implement the generic halves of the public stream
//! operations: parameter validation, probe sequencing, duplex resolution and
//! the state checks of the stream state machine. Everything
//! backend-specific happens inside the [`Driver`] the dispatcher hands in.

use log::{debug, warn};

use crate::driver::{Driver, OpenRequest};
use crate::error::{Error, Result};
use crate::stream::{BoxedCallback, Direction, StreamMode, StreamState};
use crate::{StreamInstant, StreamSpec};

/// Validates `spec`, probes the requested directions and installs the
/// callback. Returns the period size the hardware accepted.
pub(crate) fn open_stream(
    driver: &mut dyn Driver,
    spec: &StreamSpec,
    callback: BoxedCallback,
) -> Result<u32> {
    if driver.shared().lock().state != StreamState::Closed {
        return Err(Error::invalid_use("a stream is already open"));
    }
    let (output, input) = (spec.output, spec.input);
    if output.is_none() && input.is_none() {
        return Err(Error::invalid_use(
            "input and output stream parameters are both absent",
        ));
    }
    for params in [output, input].into_iter().flatten() {
        if params.channels == 0 {
            return Err(Error::invalid_use(
                "a stream direction cannot have zero channels",
            ));
        }
    }
    if spec.sample_rate == 0 {
        return Err(Error::invalid_use("sample rate must be positive"));
    }
    let devices = driver.device_count()?;
    for params in [output, input].into_iter().flatten() {
        if params.device >= devices {
            return Err(Error::invalid_use(format!(
                "device index {} out of range ({} devices)",
                params.device, devices,
            )));
        }
    }

    {
        let shared = driver.shared().clone();
        let mut core = shared.lock();
        core.clear();
        core.user_format = spec.format;
        core.user_interleaved = !spec.options.flags.noninterleaved;
        core.sample_rate = spec.sample_rate;
        core.buffer_frames = spec.buffer_frames;
    }

    if let Some(params) = output {
        driver.probe_open(&OpenRequest {
            direction: Direction::Output,
            params,
            format: spec.format,
            sample_rate: spec.sample_rate,
            buffer_frames: spec.buffer_frames,
            options: &spec.options,
        })?;
    }
    if let Some(params) = input {
        // The second direction must accept the period size the first one
        // already negotiated.
        let accepted = driver.shared().lock().buffer_frames;
        let result = driver.probe_open(&OpenRequest {
            direction: Direction::Input,
            params,
            format: spec.format,
            sample_rate: spec.sample_rate,
            buffer_frames: if output.is_some() {
                accepted
            } else {
                spec.buffer_frames
            },
            options: &spec.options,
        });
        if let Err(err) = result {
            if output.is_some() {
                driver.close();
                driver.shared().lock().clear();
            }
            return Err(err);
        }
    }

    let shared = driver.shared().clone();
    let mut core = shared.lock();
    core.mode = match (output.is_some(), input.is_some()) {
        (true, true) => StreamMode::Duplex,
        (true, false) => StreamMode::Output,
        (false, true) => StreamMode::Input,
        (false, false) => unreachable!(),
    };
    core.callback = Some(callback);
    core.state = StreamState::Stopped;
    let accepted = core.buffer_frames;
    debug!(
        "stream open on {}: mode {:?}, {} Hz, {} frames/period, {} periods",
        driver.backend(),
        core.mode,
        core.sample_rate,
        accepted,
        core.n_buffers,
    );
    Ok(accepted)
}

pub(crate) fn close_stream(driver: &mut dyn Driver) -> Result<()> {
    if driver.shared().lock().state == StreamState::Closed {
        return Err(Error::warning("no open stream to close"));
    }
    driver.close();
    driver.shared().lock().clear();
    debug!("stream closed on {}", driver.backend());
    Ok(())
}

pub(crate) fn start_stream(driver: &mut dyn Driver) -> Result<()> {
    {
        let shared = driver.shared().clone();
        let mut core = shared.lock();
        match core.state {
            StreamState::Closed => return Err(Error::invalid_use("the stream is not open")),
            StreamState::Running | StreamState::Stopping => {
                warn!("start requested but the stream is already running");
                return Err(Error::warning("the stream is already running"));
            }
            StreamState::Stopped => {}
        }
        core.start_clock();
    }
    driver.start()
}

pub(crate) fn stop_stream(driver: &mut dyn Driver) -> Result<()> {
    check_stoppable(driver)?;
    driver.stop()
}

pub(crate) fn abort_stream(driver: &mut dyn Driver) -> Result<()> {
    check_stoppable(driver)?;
    driver.abort()
}

fn check_stoppable(driver: &dyn Driver) -> Result<()> {
    match driver.shared().lock().state {
        StreamState::Closed => Err(Error::invalid_use("the stream is not open")),
        StreamState::Stopped => {
            warn!("stop requested but the stream is already stopped");
            Err(Error::warning("the stream is already stopped"))
        }
        StreamState::Running | StreamState::Stopping => Ok(()),
    }
}

pub(crate) fn is_stream_open(driver: &dyn Driver) -> bool {
    driver.shared().lock().state != StreamState::Closed
}

pub(crate) fn is_stream_running(driver: &dyn Driver) -> bool {
    driver.shared().lock().state == StreamState::Running
}

pub(crate) fn stream_time(driver: &dyn Driver) -> StreamInstant {
    driver.shared().lock().stream_time()
}

pub(crate) fn stream_latency(driver: &dyn Driver) -> u64 {
    let core = driver.shared().lock();
    if core.state == StreamState::Closed {
        return 0;
    }
    core.total_latency()
}

pub(crate) fn stream_sample_rate(driver: &dyn Driver) -> u32 {
    let core = driver.shared().lock();
    if core.state == StreamState::Closed {
        return 0;
    }
    core.sample_rate
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::platform::BackendId;
    use crate::stream::{StopKind, StreamShared};
    use crate::{
        CallbackResult, DeviceInfo, Error, SampleFormat, StreamOptions, StreamParams, StreamSpec,
        StreamStatus,
    };

    /// An in-memory backend: devices are imaginary, period I/O is driven by
    /// the test through `pump_periods`, drains are recorded.
    struct MockDriver {
        shared: Arc<StreamShared>,
        device_format: SampleFormat,
        device_channels: u32,
        fail_direction: Option<Direction>,
        min_period: u32,
        closes: usize,
        drains: usize,
        discards: usize,
        rendered: Vec<u8>,
        /// Sample pattern fed to the input side of every pumped period.
        input_fill: u8,
    }

    impl MockDriver {
        fn new() -> MockDriver {
            MockDriver {
                shared: StreamShared::new(),
                device_format: SampleFormat::I16,
                device_channels: 2,
                fail_direction: None,
                min_period: 128,
                closes: 0,
                drains: 0,
                discards: 0,
                rendered: Vec::new(),
                input_fill: 0,
            }
        }

        /// Processes up to `n` periods the way a device thread would, one
        /// lock hold per period. Returns how many were actually processed.
        fn pump_periods(&mut self, n: usize) -> usize {
            let shared = Arc::clone(&self.shared);
            let mut processed = 0;
            for _ in 0..n {
                let mut core = shared.lock();
                if core.state != StreamState::Running {
                    break;
                }
                if core.mode.has_input() {
                    let fill = self.input_fill;
                    core.input_read_target().fill(fill);
                    core.finish_input_period();
                }
                let (input_time, output_time) = core.period_timestamps();
                let flow = core.run_callback(input_time, output_time);
                if core.mode.has_output() {
                    let period = core.render_output_period().to_vec();
                    self.rendered.extend_from_slice(&period);
                }
                core.tick_stream_time();
                processed += 1;
                match flow {
                    CallbackResult::Continue => {}
                    CallbackResult::Stop => {
                        core.state = StreamState::Stopped;
                        drop(core);
                        self.drains += 1;
                        break;
                    }
                    CallbackResult::Abort => {
                        core.state = StreamState::Stopped;
                        drop(core);
                        self.discards += 1;
                        break;
                    }
                }
            }
            processed
        }
    }

    impl Driver for MockDriver {
        fn backend(&self) -> BackendId {
            BackendId::Null
        }

        fn shared(&self) -> &Arc<StreamShared> {
            &self.shared
        }

        fn device_count(&mut self) -> Result<usize> {
            Ok(2)
        }

        fn device_info(&mut self, _device: usize) -> Result<DeviceInfo> {
            Ok(DeviceInfo {
                name: "mock".into(),
                output_channels: self.device_channels,
                input_channels: self.device_channels,
                sample_rates: vec![44_100, 48_000],
                native_formats: vec![self.device_format],
                ..DeviceInfo::default()
            }
            .finish())
        }

        fn probe_open(&mut self, request: &OpenRequest<'_>) -> Result<()> {
            if self.fail_direction == Some(request.direction) {
                return Err(Error::system("mock probe failure"));
            }
            let wanted = request.params.channels + request.params.first_channel;
            if wanted > self.device_channels {
                return Err(Error::system("not enough device channels"));
            }
            let shared = Arc::clone(&self.shared);
            let mut core = shared.lock();
            core.buffer_frames = if request.buffer_frames == 0 {
                self.min_period
            } else {
                request.buffer_frames.max(self.min_period)
            };
            core.n_buffers = match request.options.number_of_buffers {
                0 => 4,
                n => n.max(2),
            };
            let ep = &mut core.endpoints[request.direction.idx()];
            ep.device = request.params.device;
            ep.user_channels = request.params.channels;
            ep.device_channels = self.device_channels;
            ep.device_format = self.device_format;
            ep.device_interleaved = true;
            ep.do_byte_swap = false;
            core.setup_direction(request.direction, request.params.first_channel);
            Ok(())
        }

        fn close(&mut self) {
            self.closes += 1;
            self.shared.lock().thread_running = false;
        }

        fn start(&mut self) -> Result<()> {
            let mut core = self.shared.lock();
            core.state = StreamState::Running;
            core.thread_running = true;
            drop(core);
            self.shared.notify();
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.drains += 1;
            self.shared.lock().state = StreamState::Stopped;
            Ok(())
        }

        fn abort(&mut self) -> Result<()> {
            self.discards += 1;
            self.shared.lock().state = StreamState::Stopped;
            Ok(())
        }
    }

    fn output_spec(frames: u32) -> StreamSpec {
        StreamSpec {
            output: Some(StreamParams {
                device: 0,
                channels: 2,
                first_channel: 0,
            }),
            input: None,
            format: SampleFormat::I16,
            sample_rate: 48_000,
            buffer_frames: frames,
            options: StreamOptions::default(),
        }
    }

    fn noop_callback() -> BoxedCallback {
        Box::new(|_| CallbackResult::Continue)
    }

    #[test]
    fn open_rejects_reopening() {
        let mut driver = MockDriver::new();
        open_stream(&mut driver, &output_spec(256), noop_callback()).unwrap();
        let err = open_stream(&mut driver, &output_spec(256), noop_callback()).unwrap_err();
        assert!(matches!(err, Error::InvalidUse(_)));
    }

    #[test]
    fn open_rejects_malformed_parameters() {
        let mut driver = MockDriver::new();

        let mut spec = output_spec(256);
        spec.output = None;
        assert!(matches!(
            open_stream(&mut driver, &spec, noop_callback()),
            Err(Error::InvalidUse(_)),
        ));

        let mut spec = output_spec(256);
        spec.output.as_mut().unwrap().channels = 0;
        assert!(matches!(
            open_stream(&mut driver, &spec, noop_callback()),
            Err(Error::InvalidUse(_)),
        ));

        let mut spec = output_spec(256);
        spec.output.as_mut().unwrap().device = 7;
        assert!(matches!(
            open_stream(&mut driver, &spec, noop_callback()),
            Err(Error::InvalidUse(_)),
        ));

        let mut spec = output_spec(256);
        spec.sample_rate = 0;
        assert!(matches!(
            open_stream(&mut driver, &spec, noop_callback()),
            Err(Error::InvalidUse(_)),
        ));

        // A failed validation leaves the state machine untouched.
        assert!(!is_stream_open(&driver));
    }

    #[test]
    fn open_writes_back_the_accepted_period_size() {
        let mut driver = MockDriver::new();
        let accepted = open_stream(&mut driver, &output_spec(0), noop_callback()).unwrap();
        assert_eq!(accepted, 128);
        let core = driver.shared.lock();
        assert_eq!(core.buffer_frames, 128);
        assert_eq!(
            core.endpoints[0].user_buffer.len(),
            2 * 128 * SampleFormat::I16.sample_size(),
        );
    }

    #[test]
    fn open_both_directions_yields_duplex() {
        let mut driver = MockDriver::new();
        let mut spec = output_spec(256);
        spec.input = Some(StreamParams {
            device: 0,
            channels: 2,
            first_channel: 0,
        });
        open_stream(&mut driver, &spec, noop_callback()).unwrap();
        let core = driver.shared.lock();
        assert_eq!(core.mode, StreamMode::Duplex);
        assert_eq!(core.state, StreamState::Stopped);
    }

    #[test]
    fn failed_second_direction_closes_the_first() {
        let mut driver = MockDriver::new();
        driver.fail_direction = Some(Direction::Input);
        let mut spec = output_spec(256);
        spec.input = Some(StreamParams {
            device: 0,
            channels: 2,
            first_channel: 0,
        });
        let err = open_stream(&mut driver, &spec, noop_callback()).unwrap_err();
        assert!(matches!(err, Error::SystemError(_)));
        assert_eq!(driver.closes, 1);
        assert!(!is_stream_open(&driver));
    }

    #[test]
    fn state_machine_follows_the_transition_table() {
        let mut driver = MockDriver::new();

        // Operations on a closed stream.
        assert!(matches!(
            start_stream(&mut driver),
            Err(Error::InvalidUse(_))
        ));
        assert!(matches!(stop_stream(&mut driver), Err(Error::InvalidUse(_))));
        assert!(matches!(
            close_stream(&mut driver),
            Err(Error::Warning(_))
        ));

        open_stream(&mut driver, &output_spec(256), noop_callback()).unwrap();
        assert!(is_stream_open(&driver));
        assert!(!is_stream_running(&driver));

        // stopped: stop/abort are warnings, start transitions.
        assert!(stop_stream(&mut driver).unwrap_err().is_warning());
        assert!(abort_stream(&mut driver).unwrap_err().is_warning());
        start_stream(&mut driver).unwrap();
        assert!(is_stream_running(&driver));

        // running: start is a warning, stop drains back to stopped.
        assert!(start_stream(&mut driver).unwrap_err().is_warning());
        stop_stream(&mut driver).unwrap();
        assert!(!is_stream_running(&driver));
        assert_eq!(driver.drains, 1);

        // running -> abort discards.
        start_stream(&mut driver).unwrap();
        abort_stream(&mut driver).unwrap();
        assert_eq!(driver.discards, 1);

        close_stream(&mut driver).unwrap();
        assert!(!is_stream_open(&driver));
        assert_eq!(stream_sample_rate(&driver), 0);
        assert_eq!(stream_latency(&driver), 0);
        assert_eq!(stream_time(&driver).as_nanos(), 0);
    }

    #[test]
    fn callback_runs_once_per_period_and_time_advances() {
        let mut driver = MockDriver::new();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let callback: BoxedCallback = Box::new(move |data| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let output = data.output.as_mut().unwrap();
            output.as_slice_mut::<i16>().unwrap().fill(999);
            CallbackResult::Continue
        });
        open_stream(&mut driver, &output_spec(256), callback).unwrap();
        start_stream(&mut driver).unwrap();

        let t0 = stream_time(&driver);
        assert_eq!(driver.pump_periods(10), 10);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 10);

        let elapsed = stream_time(&driver).duration_since(&t0).unwrap();
        let per_period = 256i64 * 1_000_000_000 / 48_000;
        assert_eq!(elapsed.as_nanos() as i64, 10 * per_period);

        // Rendered audio is the callback's samples, unconverted.
        assert_eq!(driver.rendered.len(), 10 * 256 * 2 * 2);
        let first = i16::from_ne_bytes([driver.rendered[0], driver.rendered[1]]);
        assert_eq!(first, 999);

        stop_stream(&mut driver).unwrap();
        let idle = driver.pump_periods(4);
        assert_eq!(idle, 0, "no callbacks after stop returns");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 10);
    }

    #[test]
    fn callback_stop_and_abort_requests_halt_the_stream() {
        let mut driver = MockDriver::new();
        let callback: BoxedCallback = Box::new(move |data| {
            if data.status.underflow {
                CallbackResult::Abort
            } else {
                CallbackResult::Stop
            }
        });
        open_stream(&mut driver, &output_spec(256), callback).unwrap();
        start_stream(&mut driver).unwrap();
        assert_eq!(driver.pump_periods(5), 1, "stop takes effect after one period");
        assert!(!is_stream_running(&driver));
        assert_eq!(driver.drains, 1);

        start_stream(&mut driver).unwrap();
        driver.shared.lock().xrun[0] = true;
        assert_eq!(driver.pump_periods(5), 1);
        assert_eq!(driver.discards, 1);
    }

    #[test]
    fn xrun_status_is_delivered_exactly_once() {
        let mut driver = MockDriver::new();
        let statuses = Arc::new(std::sync::Mutex::new(Vec::<StreamStatus>::new()));
        let sink = Arc::clone(&statuses);
        let callback: BoxedCallback = Box::new(move |data| {
            sink.lock().unwrap().push(data.status);
            CallbackResult::Continue
        });
        open_stream(&mut driver, &output_spec(256), callback).unwrap();
        start_stream(&mut driver).unwrap();

        driver.pump_periods(1);
        driver.shared.lock().xrun[0] = true;
        driver.pump_periods(2);

        let seen = statuses.lock().unwrap();
        assert!(seen[0].is_ok());
        assert!(seen[1].underflow);
        assert!(seen[2].is_ok());
    }

    #[test]
    fn duplex_loopback_passes_input_through() {
        let mut driver = MockDriver::new();
        driver.input_fill = 0x11; // i16 samples of 0x1111
        let mut spec = output_spec(64);
        spec.input = Some(StreamParams {
            device: 0,
            channels: 2,
            first_channel: 0,
        });
        let callback: BoxedCallback = Box::new(|data| {
            let input = data.input.as_ref().unwrap().bytes().to_vec();
            data.output.as_mut().unwrap().bytes_mut().copy_from_slice(&input);
            CallbackResult::Continue
        });
        open_stream(&mut driver, &spec, callback).unwrap();
        start_stream(&mut driver).unwrap();
        driver.pump_periods(3);
        assert!(driver.rendered.iter().all(|b| *b == 0x11));
        assert_eq!(driver.rendered.len(), 3 * 64 * 2 * 2);
    }

    #[test]
    fn posted_stop_requests_reach_the_supervisor() {
        let mut driver = MockDriver::new();
        open_stream(&mut driver, &output_spec(256), noop_callback()).unwrap();
        start_stream(&mut driver).unwrap();
        driver.shared.post_stop_request(StopKind::Drain);
        assert_eq!(driver.shared.wait_stop_request(), Some(StopKind::Drain));
        assert!(!is_stream_running(&driver));
    }
}
