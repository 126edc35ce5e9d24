//! ASIO backend for Windows.
//!
//! ASIO loads a single driver process-wide, so input and output must share
//! one device; the driver supplies its own buffer-switch callback with
//! per-channel (planar) device buffers. Stop requests raised inside the
//! buffer-switch callback are posted as messages and completed by a
//! dedicated supervisor thread, never from inside the driver's own callback.

extern crate asio_sys as sys;

use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use log::debug;

use crate::driver::{Driver, OpenRequest};
use crate::error::{Error, Result};
use crate::platform::BackendId;
use crate::stream::{
    spawn_stop_supervisor, Direction, StopKind, StreamShared, StreamState,
};
use crate::{CallbackResult, DeviceInfo, SampleFormat, GENERIC_SAMPLE_RATES};

/// ASIO can only load one driver at a time; every host shares this instance.
static GLOBAL_ASIO: OnceLock<Arc<sys::Asio>> = OnceLock::new();

fn global_asio() -> Arc<sys::Asio> {
    GLOBAL_ASIO
        .get_or_init(|| Arc::new(sys::Asio::new()))
        .clone()
}

fn asio_err(err: sys::AsioError) -> Error {
    Error::system(format!("ASIO driver error: {err}"))
}

/// Maps the driver's sample type onto an engine format plus a swap flag for
/// the off-host byte order.
fn convert_data_type(ty: &sys::AsioSampleType) -> Option<(SampleFormat, bool)> {
    let little = crate::host_is_little_endian();
    Some(match ty {
        sys::AsioSampleType::ASIOSTInt16LSB => (SampleFormat::I16, !little),
        sys::AsioSampleType::ASIOSTInt16MSB => (SampleFormat::I16, little),
        sys::AsioSampleType::ASIOSTInt24LSB => (SampleFormat::I24, !little),
        sys::AsioSampleType::ASIOSTInt24MSB => (SampleFormat::I24, little),
        sys::AsioSampleType::ASIOSTInt32LSB => (SampleFormat::I32, !little),
        sys::AsioSampleType::ASIOSTInt32MSB => (SampleFormat::I32, little),
        sys::AsioSampleType::ASIOSTFloat32LSB => (SampleFormat::F32, !little),
        sys::AsioSampleType::ASIOSTFloat32MSB => (SampleFormat::F32, little),
        sys::AsioSampleType::ASIOSTFloat64LSB => (SampleFormat::F64, !little),
        sys::AsioSampleType::ASIOSTFloat64MSB => (SampleFormat::F64, little),
        _ => return None,
    })
}

// The loaded driver handle travels with the `Host`; all driver calls are
// serialized by the control path.
unsafe impl Send for AsioDriver {}

pub(crate) struct AsioDriver {
    shared: Arc<StreamShared>,
    asio: Arc<sys::Asio>,
    driver: Option<Arc<sys::Driver>>,
    streams: Option<Arc<std::sync::Mutex<sys::AsioStreams>>>,
    callback_id: Option<sys::CallbackId>,
    supervisor: Option<JoinHandle<()>>,
    device_index: Option<usize>,
    running: bool,
}

impl AsioDriver {
    pub(crate) fn new() -> Result<AsioDriver> {
        Ok(AsioDriver {
            shared: StreamShared::new(),
            asio: global_asio(),
            driver: None,
            streams: None,
            callback_id: None,
            supervisor: None,
            device_index: None,
            running: false,
        })
    }

    fn load(&mut self, device: usize) -> Result<Arc<sys::Driver>> {
        if let (Some(driver), Some(index)) = (&self.driver, self.device_index) {
            if index == device {
                return Ok(Arc::clone(driver));
            }
            return Err(Error::system(
                "another ASIO driver is already loaded for this stream",
            ));
        }
        let names = self.asio.driver_names();
        let name = names
            .get(device)
            .ok_or_else(|| Error::invalid_use("device index out of range"))?;
        let driver = Arc::new(self.asio.load_driver(name).map_err(asio_err)?);
        self.driver = Some(Arc::clone(&driver));
        self.device_index = Some(device);
        Ok(driver)
    }
}

impl Driver for AsioDriver {
    fn backend(&self) -> BackendId {
        BackendId::Asio
    }

    fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    fn device_count(&mut self) -> Result<usize> {
        Ok(self.asio.driver_names().len())
    }

    fn device_info(&mut self, device: usize) -> Result<DeviceInfo> {
        let names = self.asio.driver_names();
        let name = names
            .get(device)
            .ok_or_else(|| Error::invalid_use(format!("device index {device} out of range")))?
            .clone();
        // Probing needs the driver loaded; respect a stream's loaded driver.
        let driver = self.load(device).or_else(|_| {
            self.asio
                .load_driver(&name)
                .map(Arc::new)
                .map_err(asio_err)
        })?;
        let channels = driver.channels().map_err(asio_err)?;
        let rate = driver.sample_rate().map_err(asio_err)? as u32;
        let mut native_formats = Vec::new();
        if let Ok(ty) = driver.output_data_type() {
            if let Some((format, _)) = convert_data_type(&ty) {
                native_formats.push(format);
            }
        }
        if let Ok(ty) = driver.input_data_type() {
            if let Some((format, _)) = convert_data_type(&ty) {
                if !native_formats.contains(&format) {
                    native_formats.push(format);
                }
            }
        }
        let mut sample_rates: Vec<u32> = GENERIC_SAMPLE_RATES
            .iter()
            .copied()
            .filter(|candidate| driver.can_sample_rate(*candidate as f64).unwrap_or(false))
            .collect();
        if sample_rates.is_empty() {
            sample_rates.push(rate);
        }
        Ok(DeviceInfo {
            name,
            output_channels: channels.outs as u32,
            input_channels: channels.ins as u32,
            is_default_output: device == 0,
            is_default_input: device == 0,
            sample_rates,
            native_formats,
            ..DeviceInfo::default()
        }
        .finish())
    }

    fn probe_open(&mut self, request: &OpenRequest<'_>) -> Result<()> {
        {
            let core = self.shared.lock();
            let other = &core.endpoints[1 - request.direction.idx()];
            if other.user_channels > 0 && other.device != request.params.device {
                return Err(Error::system(
                    "ASIO duplex streams must share a single device",
                ));
            }
        }
        let driver = self.load(request.params.device)?;

        let rate = driver.sample_rate().map_err(asio_err)? as u32;
        if rate != request.sample_rate {
            if driver
                .can_sample_rate(request.sample_rate as f64)
                .map_err(asio_err)?
            {
                driver
                    .set_sample_rate(request.sample_rate as f64)
                    .map_err(asio_err)?;
            } else {
                return Err(Error::system(format!(
                    "the loaded ASIO driver cannot run at {} Hz",
                    request.sample_rate
                )));
            }
        }

        let data_type = match request.direction {
            Direction::Output => driver.output_data_type(),
            Direction::Input => driver.input_data_type(),
        }
        .map_err(asio_err)?;
        let (device_format, do_byte_swap) = convert_data_type(&data_type).ok_or_else(|| {
            Error::system(format!("unsupported ASIO sample type {data_type:?}"))
        })?;

        let channels = driver.channels().map_err(asio_err)?;
        let available = match request.direction {
            Direction::Output => channels.outs,
            Direction::Input => channels.ins,
        } as u32;
        let device_channels = request.params.channels + request.params.first_channel;
        if available < device_channels {
            return Err(Error::system(format!(
                "driver offers {available} channels, {device_channels} requested"
            )));
        }

        let streams = match &self.streams {
            Some(streams) => Arc::clone(streams),
            None => {
                let streams = Arc::new(std::sync::Mutex::new(sys::AsioStreams {
                    input: None,
                    output: None,
                }));
                self.streams = Some(Arc::clone(&streams));
                streams
            }
        };
        let requested = if request.buffer_frames == 0 {
            None
        } else {
            Some(request.buffer_frames as i32)
        };
        let accepted = {
            let mut guard = streams.lock().unwrap();
            let sys::AsioStreams { input, output } = std::mem::replace(
                &mut *guard,
                sys::AsioStreams {
                    input: None,
                    output: None,
                },
            );
            let built = match request.direction {
                Direction::Output => driver
                    .prepare_output_stream(input, device_channels as usize, requested)
                    .map_err(asio_err)?,
                Direction::Input => driver
                    .prepare_input_stream(output, device_channels as usize, requested)
                    .map_err(asio_err)?,
            };
            let accepted = match request.direction {
                Direction::Output => built.output.as_ref().map(|s| s.buffer_size),
                Direction::Input => built.input.as_ref().map(|s| s.buffer_size),
            }
            .unwrap_or_default() as u32;
            *guard = built;
            accepted
        };
        debug!(
            "asio probe ok: {device_channels} ch {:?}, {} Hz, {accepted} frames/period",
            request.direction, request.sample_rate,
        );

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
            ep.device = request.params.device;
            ep.user_channels = request.params.channels;
            ep.device_channels = device_channels;
            ep.device_format = device_format;
            // One ASIO buffer per channel.
            ep.device_interleaved = false;
            ep.do_byte_swap = do_byte_swap;
            ep.latency = accepted as u64;
            core.setup_direction(request.direction, request.params.first_channel);
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
        if let (Some(driver), Some(id)) = (&self.driver, self.callback_id.take()) {
            if self.running {
                let _ = driver.stop();
            }
            driver.remove_callback(id);
        }
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.join();
        }
        self.streams = None;
        self.driver = None;
        self.device_index = None;
        self.running = false;
    }

    fn start(&mut self) -> Result<()> {
        {
            let mut core = self.shared.lock();
            core.thread_running = true;
            core.pending_stop = None;
        }
        if self.supervisor.is_none() {
            let supervisor = spawn_stop_supervisor(Arc::clone(&self.shared), "asio")
                .map_err(|err| Error::system(format!("could not spawn supervisor: {err}")))?;
            self.supervisor = Some(supervisor);
        }
        let driver = self
            .driver
            .clone()
            .ok_or_else(|| Error::Fail("start on a stream that never opened".into()))?;
        if self.callback_id.is_none() {
            let shared = Arc::clone(&self.shared);
            let streams = self
                .streams
                .clone()
                .ok_or_else(|| Error::Fail("no prepared ASIO buffers".into()))?;
            let id = driver.add_callback(move |info| {
                buffer_switch(&shared, &streams, info.buffer_index as usize);
            });
            self.callback_id = Some(id);
        }
        if !self.running {
            driver.start().map_err(asio_err)?;
            self.running = true;
        }
        self.shared.lock().state = StreamState::Running;
        self.shared.notify();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        // The driver owns a two-buffer ring; stopping after the switch in
        // flight is as close to a drain as ASIO allows.
        if let Some(driver) = &self.driver {
            driver.stop().map_err(asio_err)?;
        }
        self.running = false;
        self.shared.lock().state = StreamState::Stopped;
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.stop()
    }
}

impl Drop for AsioDriver {
    fn drop(&mut self) {
        self.close();
    }
}

/// One driver buffer switch: ingest the input half, run the engine period,
/// render the output half into the now-owned buffer index.
fn buffer_switch(
    shared: &Arc<StreamShared>,
    streams: &Arc<std::sync::Mutex<sys::AsioStreams>>,
    buffer_index: usize,
) {
    let Ok(streams) = streams.lock() else {
        return;
    };
    let Some(mut core) = shared.try_lock() else {
        return;
    };
    if core.state != StreamState::Running {
        if let Some(output) = &streams.output {
            silence_asio_stream(output, buffer_index, &core);
        }
        return;
    }
    let frames = core.buffer_frames as usize;

    if let Some(input) = &streams.input {
        let width = core.endpoints[1].device_format.sample_size();
        let target = core.input_read_target();
        for (ch, info) in input.buffer_infos.iter().enumerate() {
            let bytes = frames * width;
            let source = unsafe {
                std::slice::from_raw_parts(info.buffers[buffer_index] as *const u8, bytes)
            };
            target[ch * bytes..(ch + 1) * bytes].copy_from_slice(source);
        }
        core.finish_input_period();
    }

    let (input_time, output_time) = core.period_timestamps();
    let flow = core.run_callback(input_time, output_time);

    if let Some(output) = &streams.output {
        let width = core.endpoints[0].device_format.sample_size();
        let rendered = core.render_output_period();
        for (ch, info) in output.buffer_infos.iter().enumerate() {
            let bytes = frames * width;
            let target = unsafe {
                std::slice::from_raw_parts_mut(info.buffers[buffer_index] as *mut u8, bytes)
            };
            target.copy_from_slice(&rendered[ch * bytes..(ch + 1) * bytes]);
        }
    }

    core.tick_stream_time();
    drop(core);

    match flow {
        CallbackResult::Continue => {}
        CallbackResult::Stop => shared.post_stop_request(StopKind::Drain),
        CallbackResult::Abort => shared.post_stop_request(StopKind::Discard),
    }
}

fn silence_asio_stream(
    stream: &sys::AsioStream,
    buffer_index: usize,
    core: &crate::stream::StreamCore,
) {
    let width = core.endpoints[0].device_format.sample_size();
    let bytes = core.buffer_frames as usize * width;
    for info in &stream.buffer_infos {
        let target = unsafe {
            std::slice::from_raw_parts_mut(info.buffers[buffer_index] as *mut u8, bytes)
        };
        target.fill(0);
    }
}
