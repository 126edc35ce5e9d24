//! PulseAudio backend, built on the blocking "simple" client API.
//!
//! One worker thread performs synchronous `read`/`write` transfers, one
//! period per cycle. The server does its own buffering and recovery, so the
//! simple API never reports xruns; `stop` drains the playback stream on the
//! server, `abort` flushes it. Duplex uses a playback and a record
//! connection side by side.

extern crate libpulse_binding as pulse;
extern crate libpulse_simple_binding as psimple;

use self::psimple::Simple;
use self::pulse::def::BufferAttr;
use self::pulse::sample::{Format as PaFormat, Spec};
use self::pulse::stream::Direction as PaDirection;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error};

use crate::driver::{Driver, OpenRequest};
use crate::error::{Error, Result};
use crate::platform::BackendId;
use crate::stream::{Direction, StopKind, StreamShared, StreamState, ThreadGate};
use crate::{DeviceInfo, SampleFormat, GENERIC_SAMPLE_RATES};

impl From<self::pulse::error::PAErr> for Error {
    fn from(err: self::pulse::error::PAErr) -> Error {
        Error::system(err)
    }
}

/// The nearest sample format the server speaks natively. Formats without a
/// PulseAudio counterpart go through the engine's conversion pass.
fn device_format_for(format: SampleFormat) -> (SampleFormat, PaFormat) {
    match format {
        SampleFormat::I16 => (SampleFormat::I16, PaFormat::S16NE),
        SampleFormat::I24 => (SampleFormat::I24, PaFormat::S24NE),
        SampleFormat::I32 => (SampleFormat::I32, PaFormat::S32NE),
        SampleFormat::F32 => (SampleFormat::F32, PaFormat::F32NE),
        // No signed-8/float-64 on the wire.
        SampleFormat::I8 => (SampleFormat::I16, PaFormat::S16NE),
        SampleFormat::F64 => (SampleFormat::F32, PaFormat::F32NE),
    }
}

struct PulseStream {
    playback: Option<Simple>,
    capture: Option<Simple>,
    sample_rate: u32,
}

// All handle access happens under the stream lock.
unsafe impl Send for PulseStream {}
unsafe impl Sync for PulseStream {}

// Simple-API handles may be parked in `pending_*` while the driver moves
// between threads with its `Host`.
unsafe impl Send for PulseDriver {}

pub(crate) struct PulseDriver {
    shared: Arc<StreamShared>,
    inner: Option<Arc<PulseStream>>,
    pending_playback: Option<Simple>,
    pending_capture: Option<Simple>,
    thread: Option<JoinHandle<()>>,
    stream_name: String,
}

impl PulseDriver {
    pub(crate) fn new() -> Result<PulseDriver> {
        Ok(PulseDriver {
            shared: StreamShared::new(),
            inner: None,
            pending_playback: None,
            pending_capture: None,
            thread: None,
            stream_name: String::new(),
        })
    }

    fn ensure_worker(&mut self) -> Result<Arc<PulseStream>> {
        if let Some(inner) = &self.inner {
            return Ok(Arc::clone(inner));
        }
        let sample_rate = self.shared.lock().sample_rate;
        let inner = Arc::new(PulseStream {
            playback: self.pending_playback.take(),
            capture: self.pending_capture.take(),
            sample_rate,
        });
        let worker_inner = Arc::clone(&inner);
        let worker_shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name(format!("{}-pulse-io", self.stream_name))
            .spawn(move || worker(worker_inner, worker_shared))
            .map_err(|err| Error::system(format!("could not spawn the device thread: {err}")))?;
        self.thread = Some(thread);
        self.inner = Some(Arc::clone(&inner));
        Ok(inner)
    }
}

impl Driver for PulseDriver {
    fn backend(&self) -> BackendId {
        BackendId::PulseAudio
    }

    fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    fn device_count(&mut self) -> Result<usize> {
        // The simple API routes through the server's current defaults.
        Ok(1)
    }

    fn device_info(&mut self, device: usize) -> Result<DeviceInfo> {
        if device != 0 {
            return Err(Error::invalid_use(format!(
                "device index {device} out of range (1 device)"
            )));
        }
        Ok(DeviceInfo {
            name: "default".to_owned(),
            output_channels: 2,
            input_channels: 2,
            is_default_output: true,
            is_default_input: true,
            sample_rates: GENERIC_SAMPLE_RATES.to_vec(),
            native_formats: vec![
                SampleFormat::I16,
                SampleFormat::I24,
                SampleFormat::I32,
                SampleFormat::F32,
            ],
            ..DeviceInfo::default()
        }
        .finish())
    }

    fn probe_open(&mut self, request: &OpenRequest<'_>) -> Result<()> {
        if request.params.device != 0 {
            return Err(Error::invalid_use("device index out of range"));
        }
        if request.params.first_channel != 0 {
            return Err(Error::system(
                "the PulseAudio backend cannot address a channel offset",
            ));
        }
        if request.params.channels > u8::MAX as u32 {
            return Err(Error::system("unsupported number of channels"));
        }
        if !GENERIC_SAMPLE_RATES.contains(&request.sample_rate) {
            return Err(Error::system(format!(
                "unsupported sample rate {}",
                request.sample_rate
            )));
        }

        let (device_format, pa_format) = device_format_for(request.format);
        let spec = Spec {
            format: pa_format,
            channels: request.params.channels as u8,
            rate: request.sample_rate,
        };
        if !spec.is_valid() {
            return Err(Error::system("invalid sample specification"));
        }

        let frames = if request.buffer_frames == 0 {
            512
        } else {
            request.buffer_frames
        };
        let periods = match request.options.number_of_buffers {
            0 if request.options.flags.minimize_latency => 2,
            0 => 4,
            n => n.max(2),
        };
        let period_bytes =
            frames * request.params.channels * device_format.sample_size() as u32;
        let attr = BufferAttr {
            maxlength: u32::MAX,
            tlength: period_bytes * periods,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: period_bytes,
        };

        let name = request.options.name().to_owned();
        let (pa_direction, description) = match request.direction {
            Direction::Output => (PaDirection::Playback, "playback"),
            Direction::Input => (PaDirection::Record, "record"),
        };
        debug!(
            "connecting to PulseAudio for {description}: {} ch @ {} Hz, format {device_format}",
            request.params.channels, request.sample_rate,
        );
        let simple = Simple::new(
            None,
            &name,
            pa_direction,
            None,
            description,
            &spec,
            None,
            Some(&attr),
        )
        .map_err(|err| {
            Error::system(format!("error connecting to the PulseAudio server: {err}"))
        })?;

        {
            let mut core = self.shared.lock();
            let other_active = core.endpoints[1 - request.direction.idx()].user_channels > 0;
            if other_active && core.buffer_frames != frames {
                return Err(Error::system("duplex period mismatch"));
            }
            core.buffer_frames = frames;
            core.sample_rate = request.sample_rate;
            core.n_buffers = periods;
            let ep = &mut core.endpoints[request.direction.idx()];
            ep.device = 0;
            ep.user_channels = request.params.channels;
            ep.device_channels = request.params.channels;
            ep.device_format = device_format;
            ep.device_interleaved = true;
            ep.do_byte_swap = false;
            ep.latency = 0;
            core.setup_direction(request.direction, 0);
        }

        match request.direction {
            Direction::Output => self.pending_playback = Some(simple),
            Direction::Input => self.pending_capture = Some(simple),
        }
        self.stream_name = name;
        Ok(())
    }

    fn close(&mut self) {
        {
            let mut core = self.shared.lock();
            core.thread_running = false;
            if matches!(core.state, StreamState::Running | StreamState::Stopping) {
                core.state = StreamState::Stopped;
            }
        }
        self.shared.notify();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if let Some(inner) = self.inner.take() {
            if let Some(playback) = &inner.playback {
                let _ = playback.flush();
            }
        }
        self.pending_playback = None;
        self.pending_capture = None;
    }

    fn start(&mut self) -> Result<()> {
        {
            let mut core = self.shared.lock();
            core.thread_running = true;
            core.pending_stop = None;
        }
        self.ensure_worker()?;
        self.shared.lock().state = StreamState::Running;
        self.shared.notify();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let inner = self
            .inner
            .clone()
            .ok_or_else(|| Error::Fail("stop on a stream that never started".into()))?;
        halt(&inner, &self.shared, StopKind::Drain)
    }

    fn abort(&mut self) -> Result<()> {
        let inner = self
            .inner
            .clone()
            .ok_or_else(|| Error::Fail("abort on a stream that never started".into()))?;
        halt(&inner, &self.shared, StopKind::Discard)
    }
}

impl Drop for PulseDriver {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.close();
        }
    }
}

fn halt(inner: &PulseStream, shared: &StreamShared, kind: StopKind) -> Result<()> {
    let mut core = shared.lock();
    if core.state == StreamState::Stopped {
        return Ok(());
    }
    core.state = StreamState::Stopped;
    if let Some(playback) = &inner.playback {
        let result = match kind {
            StopKind::Drain => playback.drain(),
            StopKind::Discard => playback.flush(),
        };
        if let Err(err) = result {
            error!("PulseAudio halt failed: {err}");
            return Err(err.into());
        }
    }
    Ok(())
}

fn worker(inner: Arc<PulseStream>, shared: Arc<StreamShared>) {
    loop {
        match shared.wait_runnable() {
            ThreadGate::Exit => return,
            ThreadGate::Run => {}
        }
        let mut core = shared.lock();
        if core.state != StreamState::Running {
            continue;
        }

        if let Some(capture) = &inner.capture {
            let target = core.input_read_target();
            match capture.read(target) {
                Ok(()) => core.finish_input_period(),
                Err(err) => {
                    error!("PulseAudio read failed, stopping stream: {err}");
                    core.state = StreamState::Stopped;
                    continue;
                }
            }
            if let Ok(latency) = capture.get_latency() {
                core.endpoints[1].latency = latency.0 * inner.sample_rate as u64 / 1_000_000;
            }
        }

        let (input_time, output_time) = core.period_timestamps();
        let flow = core.run_callback(input_time, output_time);

        if flow == crate::CallbackResult::Abort {
            drop(core);
            let _ = halt(&inner, &shared, StopKind::Discard);
            continue;
        }

        if let Some(playback) = &inner.playback {
            let buffer = core.render_output_period();
            if let Err(err) = playback.write(buffer) {
                error!("PulseAudio write failed, stopping stream: {err}");
                core.state = StreamState::Stopped;
                continue;
            }
            if let Ok(latency) = playback.get_latency() {
                core.endpoints[0].latency = latency.0 * inner.sample_rate as u64 / 1_000_000;
            }
        }

        core.tick_stream_time();
        drop(core);

        if flow == crate::CallbackResult::Stop {
            let _ = halt(&inner, &shared, StopKind::Drain);
        }
    }
}
