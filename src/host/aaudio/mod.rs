//! AAudio backend for Android.
//!
//! Devices and transport belong to the platform service; the driver keeps a
//! device id, builds one AAudio stream per direction and forwards the
//! service's data callbacks into the engine period cycle. Stop requests
//! from inside a data callback are posted as messages for the supervisor
//! thread.

extern crate ndk;

use self::ndk::audio::{
    AudioCallbackResult, AudioDirection, AudioFormat, AudioStream, AudioStreamBuilder,
};

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::debug;

use crate::driver::{Driver, OpenRequest};
use crate::error::{Error, Result};
use crate::platform::BackendId;
use crate::stream::{
    spawn_stop_supervisor, Direction, StopKind, StreamShared, StreamState,
};
use crate::{CallbackResult, DeviceInfo, SampleFormat, GENERIC_SAMPLE_RATES};

fn ndk_err(err: self::ndk::audio::AudioError) -> Error {
    Error::system(format!("AAudio error: {err}"))
}

/// The nearest format AAudio accepts natively.
fn device_format_for(format: SampleFormat) -> (SampleFormat, AudioFormat) {
    match format {
        SampleFormat::I16 => (SampleFormat::I16, AudioFormat::PCM_I16),
        SampleFormat::F32 => (SampleFormat::F32, AudioFormat::PCM_Float),
        SampleFormat::I8 | SampleFormat::I24 | SampleFormat::I32 => {
            (SampleFormat::I16, AudioFormat::PCM_I16)
        }
        SampleFormat::F64 => (SampleFormat::F32, AudioFormat::PCM_Float),
    }
}

struct AAudioStreams {
    output: Option<AudioStream>,
    input: Option<AudioStream>,
}

// The AAudio C API is thread safe; request_* calls are serialized by the
// stream lock on our side.
unsafe impl Send for AAudioStreams {}

pub(crate) struct AAudioDriver {
    shared: Arc<StreamShared>,
    streams: Arc<Mutex<AAudioStreams>>,
    supervisor: Option<JoinHandle<()>>,
    running: bool,
}

impl AAudioDriver {
    pub(crate) fn new() -> Result<AAudioDriver> {
        Ok(AAudioDriver {
            shared: StreamShared::new(),
            streams: Arc::new(Mutex::new(AAudioStreams {
                output: None,
                input: None,
            })),
            supervisor: None,
            running: false,
        })
    }
}

impl Driver for AAudioDriver {
    fn backend(&self) -> BackendId {
        BackendId::AAudio
    }

    fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    fn device_count(&mut self) -> Result<usize> {
        // The platform service routes; we address its default device.
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
            native_formats: vec![SampleFormat::I16, SampleFormat::F32],
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
                "the AAudio backend cannot address a channel offset",
            ));
        }
        let (device_format, aaudio_format) = device_format_for(request.format);
        let frames = if request.buffer_frames == 0 {
            256
        } else {
            request.buffer_frames
        };
        let direction = match request.direction {
            Direction::Output => AudioDirection::Output,
            Direction::Input => AudioDirection::Input,
        };
        debug!(
            "building AAudio stream {:?}: {} ch @ {} Hz, {frames} frames/period",
            request.direction, request.params.channels, request.sample_rate,
        );

        let shared = Arc::clone(&self.shared);
        let is_output = request.direction == Direction::Output;
        let stream = AudioStreamBuilder::new()
            .map_err(ndk_err)?
            .direction(direction)
            .format(aaudio_format)
            .channel_count(request.params.channels as i32)
            .sample_rate(request.sample_rate as i32)
            .frames_per_data_callback(frames as i32)
            .data_callback(Box::new(move |_stream, data, num_frames| {
                data_callback(&shared, is_output, data as *mut u8, num_frames as usize)
            }))
            .open_stream()
            .map_err(ndk_err)?;

        let accepted = frames;
        {
            let mut core = self.shared.lock();
            let other_active = core.endpoints[1 - request.direction.idx()].user_channels > 0;
            if other_active && core.buffer_frames != accepted {
                return Err(Error::system("duplex period mismatch"));
            }
            core.buffer_frames = accepted;
            core.sample_rate = request.sample_rate;
            core.n_buffers = 2;
            let ep = &mut core.endpoints[request.direction.idx()];
            ep.device = 0;
            ep.user_channels = request.params.channels;
            ep.device_channels = request.params.channels;
            ep.device_format = device_format;
            ep.device_interleaved = true;
            ep.do_byte_swap = false;
            ep.latency = accepted as u64;
            core.setup_direction(request.direction, 0);
        }

        let mut streams = self.streams.lock().unwrap();
        match request.direction {
            Direction::Output => streams.output = Some(stream),
            Direction::Input => streams.input = Some(stream),
        }
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
        {
            let mut streams = self.streams.lock().unwrap();
            if let Some(stream) = &streams.output {
                let _ = stream.request_stop();
            }
            if let Some(stream) = &streams.input {
                let _ = stream.request_stop();
            }
            streams.output = None;
            streams.input = None;
        }
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.join();
        }
        self.running = false;
    }

    fn start(&mut self) -> Result<()> {
        {
            let mut core = self.shared.lock();
            core.thread_running = true;
            core.pending_stop = None;
        }
        if self.supervisor.is_none() {
            let supervisor = spawn_stop_supervisor(Arc::clone(&self.shared), "aaudio")
                .map_err(|err| Error::system(format!("could not spawn supervisor: {err}")))?;
            self.supervisor = Some(supervisor);
        }
        if !self.running {
            let streams = self.streams.lock().unwrap();
            if let Some(stream) = &streams.input {
                stream.request_start().map_err(ndk_err)?;
            }
            if let Some(stream) = &streams.output {
                stream.request_start().map_err(ndk_err)?;
            }
            self.running = true;
        }
        self.shared.lock().state = StreamState::Running;
        self.shared.notify();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let streams = self.streams.lock().unwrap();
        // request_stop lets queued output play out before the state change.
        if let Some(stream) = &streams.output {
            stream.request_stop().map_err(ndk_err)?;
        }
        if let Some(stream) = &streams.input {
            stream.request_stop().map_err(ndk_err)?;
        }
        drop(streams);
        self.running = false;
        self.shared.lock().state = StreamState::Stopped;
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        let streams = self.streams.lock().unwrap();
        if let Some(stream) = &streams.output {
            // Pause halts consumption immediately, flush discards the queue.
            stream.request_pause().map_err(ndk_err)?;
            stream.request_flush().map_err(ndk_err)?;
        }
        if let Some(stream) = &streams.input {
            stream.request_stop().map_err(ndk_err)?;
        }
        drop(streams);
        self.running = false;
        self.shared.lock().state = StreamState::Stopped;
        Ok(())
    }
}

impl Drop for AAudioDriver {
    fn drop(&mut self) {
        self.close();
    }
}

/// One service callback: for output streams run the engine period and fill
/// the service buffer; for input streams stage the period (and complete the
/// cycle when the stream is input-only).
fn data_callback(
    shared: &Arc<StreamShared>,
    is_output: bool,
    data: *mut u8,
    num_frames: usize,
) -> AudioCallbackResult {
    let Some(mut core) = shared.try_lock() else {
        return AudioCallbackResult::Continue;
    };
    if core.state != StreamState::Running || num_frames != core.buffer_frames as usize {
        if is_output {
            let bytes = core.device_period_bytes(Direction::Output);
            unsafe { std::slice::from_raw_parts_mut(data, bytes) }.fill(0);
        }
        return AudioCallbackResult::Continue;
    }

    let flow = if is_output {
        let (input_time, output_time) = core.period_timestamps();
        let flow = core.run_callback(input_time, output_time);
        let rendered = core.render_output_period();
        let target = unsafe { std::slice::from_raw_parts_mut(data, rendered.len()) };
        target.copy_from_slice(rendered);
        core.tick_stream_time();
        flow
    } else {
        {
            let target = core.input_read_target();
            let source = unsafe { std::slice::from_raw_parts(data as *const u8, target.len()) };
            target.copy_from_slice(source);
        }
        core.finish_input_period();
        if core.mode.has_output() {
            // Duplex: the output callback completes the period.
            drop(core);
            return AudioCallbackResult::Continue;
        }
        let (input_time, output_time) = core.period_timestamps();
        let flow = core.run_callback(input_time, output_time);
        core.tick_stream_time();
        flow
    };
    drop(core);

    match flow {
        CallbackResult::Continue => {}
        CallbackResult::Stop => shared.post_stop_request(StopKind::Drain),
        CallbackResult::Abort => shared.post_stop_request(StopKind::Discard),
    }
    AudioCallbackResult::Continue
}
