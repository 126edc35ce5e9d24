//! CoreAudio backend for macOS and iOS.
//!
//! Each direction runs on an AUHAL audio unit bound to the device; the OS
//! delivers render (output) and input callbacks on its own thread. The
//! virtual stream format is always packed interleaved float32 at the device
//! channel count; everything else goes through the engine's conversion
//! tables. A processor-overload listener latches the xrun flags; stop
//! requests from inside a callback are posted as messages and completed by
//! the supervisor thread.

extern crate coreaudio;

use self::coreaudio::audio_unit::audio_format::LinearPcmFlags;
use self::coreaudio::audio_unit::macos_helpers::{
    audio_unit_from_device_id, get_audio_device_ids, get_default_device_id, get_device_name,
};
use self::coreaudio::audio_unit::render_callback::{self, data};
use self::coreaudio::audio_unit::{AudioUnit, Element, Scope, StreamFormat};
use self::coreaudio::sys;

use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, warn};

use crate::driver::{Driver, OpenRequest};
use crate::error::{Error, Result};
use crate::platform::BackendId;
use crate::stream::{
    spawn_stop_supervisor, Direction, StopKind, StreamShared, StreamState,
};
use crate::{CallbackResult, DeviceInfo, SampleFormat, GENERIC_SAMPLE_RATES};

impl From<self::coreaudio::Error> for Error {
    fn from(err: self::coreaudio::Error) -> Error {
        Error::system(err)
    }
}

const COREAUDIO_FORMAT: SampleFormat = SampleFormat::F32;

fn property_address(
    selector: sys::AudioObjectPropertySelector,
    scope: sys::AudioObjectPropertyScope,
) -> sys::AudioObjectPropertyAddress {
    sys::AudioObjectPropertyAddress {
        mSelector: selector,
        mScope: scope,
        mElement: sys::kAudioObjectPropertyElementMaster,
    }
}

fn check_status(status: sys::OSStatus, what: &str) -> Result<()> {
    if status != 0 {
        return Err(Error::system(format!("{what} failed with OSStatus {status}")));
    }
    Ok(())
}

fn get_property<T: Default>(
    device: sys::AudioDeviceID,
    selector: sys::AudioObjectPropertySelector,
    scope: sys::AudioObjectPropertyScope,
) -> Result<T> {
    let address = property_address(selector, scope);
    let mut value = T::default();
    let mut size = std::mem::size_of::<T>() as u32;
    let status = unsafe {
        sys::AudioObjectGetPropertyData(
            device,
            &address as *const _,
            0,
            std::ptr::null(),
            &mut size as *mut _,
            &mut value as *mut T as *mut _,
        )
    };
    check_status(status, "AudioObjectGetPropertyData")?;
    Ok(value)
}

fn set_property<T>(
    device: sys::AudioDeviceID,
    selector: sys::AudioObjectPropertySelector,
    scope: sys::AudioObjectPropertyScope,
    value: &T,
) -> Result<()> {
    let address = property_address(selector, scope);
    let status = unsafe {
        sys::AudioObjectSetPropertyData(
            device,
            &address as *const _,
            0,
            std::ptr::null(),
            std::mem::size_of::<T>() as u32,
            value as *const T as *const _,
        )
    };
    check_status(status, "AudioObjectSetPropertyData")
}

/// Channels available on one scope of a device, summed over its streams.
fn scope_channels(device: sys::AudioDeviceID, input: bool) -> u32 {
    let scope = if input {
        sys::kAudioObjectPropertyScopeInput
    } else {
        sys::kAudioObjectPropertyScopeOutput
    };
    let address = property_address(sys::kAudioDevicePropertyStreamConfiguration, scope);
    let mut size = 0u32;
    let status = unsafe {
        sys::AudioObjectGetPropertyDataSize(
            device,
            &address as *const _,
            0,
            std::ptr::null(),
            &mut size as *mut _,
        )
    };
    if status != 0 || size == 0 {
        return 0;
    }
    let mut raw = vec![0u8; size as usize];
    let status = unsafe {
        sys::AudioObjectGetPropertyData(
            device,
            &address as *const _,
            0,
            std::ptr::null(),
            &mut size as *mut _,
            raw.as_mut_ptr() as *mut _,
        )
    };
    if status != 0 {
        return 0;
    }
    let list = raw.as_ptr() as *const sys::AudioBufferList;
    let mut channels = 0;
    unsafe {
        let count = (*list).mNumberBuffers as usize;
        let buffers = (*list).mBuffers.as_ptr();
        for i in 0..count {
            channels += (*buffers.add(i)).mNumberChannels;
        }
    }
    channels
}

/// Latches the stream's xrun flags whenever the device reports a processor
/// overload. Removed again on drop.
struct OverloadListener {
    device: sys::AudioDeviceID,
    shared: *const StreamShared,
}

extern "C" fn overload_trampoline(
    _device: sys::AudioObjectID,
    _n_addresses: u32,
    _addresses: *const sys::AudioObjectPropertyAddress,
    client_data: *mut std::os::raw::c_void,
) -> sys::OSStatus {
    let shared = unsafe { &*(client_data as *const StreamShared) };
    if let Some(mut core) = shared.try_lock() {
        if core.mode.has_output() {
            core.xrun[0] = true;
        }
        if core.mode.has_input() {
            core.xrun[1] = true;
        }
    }
    0
}

impl OverloadListener {
    fn install(device: sys::AudioDeviceID, shared: &Arc<StreamShared>) -> Result<OverloadListener> {
        let raw = Arc::as_ptr(shared);
        let address = property_address(
            sys::kAudioDeviceProcessorOverload,
            sys::kAudioObjectPropertyScopeGlobal,
        );
        let status = unsafe {
            sys::AudioObjectAddPropertyListener(
                device,
                &address as *const _,
                Some(overload_trampoline),
                raw as *mut _,
            )
        };
        check_status(status, "AudioObjectAddPropertyListener")?;
        Ok(OverloadListener {
            device,
            shared: raw,
        })
    }
}

impl Drop for OverloadListener {
    fn drop(&mut self) {
        let address = property_address(
            sys::kAudioDeviceProcessorOverload,
            sys::kAudioObjectPropertyScopeGlobal,
        );
        unsafe {
            sys::AudioObjectRemovePropertyListener(
                self.device,
                &address as *const _,
                Some(overload_trampoline),
                self.shared as *mut _,
            );
        }
    }
}

unsafe impl Send for OverloadListener {}

pub(crate) struct CoreAudioDriver {
    shared: Arc<StreamShared>,
    output_unit: Option<AudioUnit>,
    input_unit: Option<AudioUnit>,
    _listeners: Vec<OverloadListener>,
    supervisor: Option<JoinHandle<()>>,
    running: bool,
}

// The audio units are only manipulated from the control path; their
// callbacks communicate through `StreamShared` alone.
unsafe impl Send for CoreAudioDriver {}

impl CoreAudioDriver {
    pub(crate) fn new() -> Result<CoreAudioDriver> {
        Ok(CoreAudioDriver {
            shared: StreamShared::new(),
            output_unit: None,
            input_unit: None,
            _listeners: Vec::new(),
            supervisor: None,
            running: false,
        })
    }

    fn device_ids(&self) -> Result<Vec<sys::AudioDeviceID>> {
        get_audio_device_ids().map_err(Error::from)
    }
}

impl Driver for CoreAudioDriver {
    fn backend(&self) -> BackendId {
        BackendId::CoreAudio
    }

    fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    fn device_count(&mut self) -> Result<usize> {
        Ok(self.device_ids()?.len())
    }

    fn device_info(&mut self, device: usize) -> Result<DeviceInfo> {
        let ids = self.device_ids()?;
        let id = *ids
            .get(device)
            .ok_or_else(|| Error::invalid_use(format!("device index {device} out of range")))?;
        let name = get_device_name(id).unwrap_or_else(|_| format!("device {device}"));
        let nominal: f64 = get_property(
            id,
            sys::kAudioDevicePropertyNominalSampleRate,
            sys::kAudioObjectPropertyScopeGlobal,
        )
        .unwrap_or(0.0);
        let mut sample_rates: Vec<u32> = GENERIC_SAMPLE_RATES
            .iter()
            .copied()
            .filter(|rate| *rate == nominal as u32)
            .collect();
        if sample_rates.is_empty() && nominal > 0.0 {
            sample_rates.push(nominal as u32);
        }
        Ok(DeviceInfo {
            name,
            output_channels: scope_channels(id, false),
            input_channels: scope_channels(id, true),
            is_default_output: get_default_device_id(false) == Some(id),
            is_default_input: get_default_device_id(true) == Some(id),
            sample_rates,
            // The HAL converts to anything through the float32 virtual
            // format.
            native_formats: vec![COREAUDIO_FORMAT],
            ..DeviceInfo::default()
        }
        .finish())
    }

    fn default_output_device(&mut self) -> usize {
        let Some(id) = get_default_device_id(false) else {
            return 0;
        };
        self.device_ids()
            .ok()
            .and_then(|ids| ids.iter().position(|d| *d == id))
            .unwrap_or(0)
    }

    fn default_input_device(&mut self) -> usize {
        let Some(id) = get_default_device_id(true) else {
            return 0;
        };
        self.device_ids()
            .ok()
            .and_then(|ids| ids.iter().position(|d| *d == id))
            .unwrap_or(0)
    }

    fn probe_open(&mut self, request: &OpenRequest<'_>) -> Result<()> {
        let ids = self.device_ids()?;
        let id = *ids
            .get(request.params.device)
            .ok_or_else(|| Error::invalid_use("device index out of range"))?;
        let is_input = request.direction == Direction::Input;
        let device_channels = request.params.channels + request.params.first_channel;
        let available = scope_channels(id, is_input);
        if available < device_channels {
            return Err(Error::system(format!(
                "device offers {available} channels, {device_channels} requested"
            )));
        }
        debug!(
            "probing coreaudio device {id} for {:?}: {device_channels} ch @ {} Hz",
            request.direction, request.sample_rate,
        );

        // Align the device clock with the request.
        let nominal: f64 = get_property(
            id,
            sys::kAudioDevicePropertyNominalSampleRate,
            sys::kAudioObjectPropertyScopeGlobal,
        )?;
        if (nominal - request.sample_rate as f64).abs() > 0.5 {
            set_property(
                id,
                sys::kAudioDevicePropertyNominalSampleRate,
                sys::kAudioObjectPropertyScopeGlobal,
                &(request.sample_rate as f64),
            )?;
        }

        // One engine period per HAL callback.
        let frames = if request.buffer_frames == 0 {
            512
        } else {
            request.buffer_frames
        };
        let scope = if is_input {
            sys::kAudioObjectPropertyScopeInput
        } else {
            sys::kAudioObjectPropertyScopeOutput
        };
        set_property(id, sys::kAudioDevicePropertyBufferFrameSize, scope, &frames)?;
        let accepted: u32 =
            get_property(id, sys::kAudioDevicePropertyBufferFrameSize, scope).unwrap_or(frames);

        let mut unit = audio_unit_from_device_id(id, is_input)?;
        let stream_format = StreamFormat {
            sample_rate: request.sample_rate as f64,
            sample_format: self::coreaudio::audio_unit::SampleFormat::F32,
            flags: LinearPcmFlags::IS_FLOAT | LinearPcmFlags::IS_PACKED,
            channels: device_channels,
        };
        let asbd = stream_format.to_asbd();
        if is_input {
            unit.set_property(
                sys::kAudioUnitProperty_StreamFormat,
                Scope::Output,
                Element::Input,
                Some(&asbd),
            )?;
        } else {
            unit.set_property(
                sys::kAudioUnitProperty_StreamFormat,
                Scope::Input,
                Element::Output,
                Some(&asbd),
            )?;
        }

        let latency: u32 = get_property(id, sys::kAudioDevicePropertyLatency, scope).unwrap_or(0);

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
            ep.device_format = COREAUDIO_FORMAT;
            ep.device_interleaved = true;
            ep.do_byte_swap = false;
            ep.latency = latency as u64 + accepted as u64;
            core.setup_direction(request.direction, request.params.first_channel);
        }

        let shared = Arc::clone(&self.shared);
        if is_input {
            type Args = render_callback::Args<data::Raw>;
            unit.set_input_callback(move |args: Args| input_callback(&shared, args))?;
        } else {
            type Args = render_callback::Args<data::Raw>;
            unit.set_render_callback(move |args: Args| render_callback_fn(&shared, args))?;
        }
        unit.initialize()?;

        self._listeners
            .push(OverloadListener::install(id, &self.shared)?);
        match request.direction {
            Direction::Output => self.output_unit = Some(unit),
            Direction::Input => self.input_unit = Some(unit),
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
        if let Some(mut unit) = self.output_unit.take() {
            let _ = unit.stop();
        }
        if let Some(mut unit) = self.input_unit.take() {
            let _ = unit.stop();
        }
        self._listeners.clear();
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
            let supervisor = spawn_stop_supervisor(Arc::clone(&self.shared), "coreaudio")
                .map_err(|err| Error::system(format!("could not spawn supervisor: {err}")))?;
            self.supervisor = Some(supervisor);
        }
        if !self.running {
            if let Some(unit) = self.input_unit.as_mut() {
                unit.start()?;
            }
            if let Some(unit) = self.output_unit.as_mut() {
                unit.start()?;
            }
            self.running = true;
        }
        self.shared.lock().state = StreamState::Running;
        self.shared.notify();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        // The HAL holds at most one period; stopping the units after the
        // cycle in flight is the drain.
        if let Some(unit) = self.output_unit.as_mut() {
            unit.stop()?;
        }
        if let Some(unit) = self.input_unit.as_mut() {
            unit.stop()?;
        }
        self.running = false;
        self.shared.lock().state = StreamState::Stopped;
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.stop()
    }
}

impl Drop for CoreAudioDriver {
    fn drop(&mut self) {
        self.close();
    }
}

fn first_buffer<'a>(args: &'a render_callback::Args<data::Raw>) -> Option<(&'a mut [u8], usize)> {
    unsafe {
        let list = args.data.data;
        if (*list).mNumberBuffers == 0 {
            return None;
        }
        let buffer = &mut *(*list).mBuffers.as_mut_ptr();
        if buffer.mData.is_null() {
            return None;
        }
        Some((
            std::slice::from_raw_parts_mut(buffer.mData as *mut u8, buffer.mDataByteSize as usize),
            buffer.mNumberChannels as usize,
        ))
    }
}

/// Output-side HAL callback: runs the engine period (input staged by the
/// input callback when duplex) and renders into the HAL buffer.
fn render_callback_fn(
    shared: &Arc<StreamShared>,
    args: render_callback::Args<data::Raw>,
) -> std::result::Result<(), ()> {
    let Some((target, _channels)) = first_buffer(&args) else {
        return Err(());
    };
    let Some(mut core) = shared.try_lock() else {
        target.fill(0);
        return Ok(());
    };
    if core.state != StreamState::Running {
        target.fill(0);
        return Ok(());
    }
    if args.num_frames != core.buffer_frames as usize {
        warn!(
            "unexpected HAL slice of {} frames (period is {})",
            args.num_frames, core.buffer_frames,
        );
        target.fill(0);
        return Ok(());
    }

    let (input_time, output_time) = core.period_timestamps();
    let flow = core.run_callback(input_time, output_time);
    let rendered = core.render_output_period();
    let bytes = rendered.len().min(target.len());
    target[..bytes].copy_from_slice(&rendered[..bytes]);
    core.tick_stream_time();
    drop(core);

    match flow {
        CallbackResult::Continue => {}
        CallbackResult::Stop => shared.post_stop_request(StopKind::Drain),
        CallbackResult::Abort => shared.post_stop_request(StopKind::Discard),
    }
    Ok(())
}

/// Input-side HAL callback: stages one captured period. Input-only streams
/// run the whole engine period from here.
fn input_callback(
    shared: &Arc<StreamShared>,
    args: render_callback::Args<data::Raw>,
) -> std::result::Result<(), ()> {
    let Some((source, _channels)) = first_buffer(&args) else {
        return Err(());
    };
    let Some(mut core) = shared.try_lock() else {
        return Ok(());
    };
    if core.state != StreamState::Running {
        return Ok(());
    }
    if args.num_frames != core.buffer_frames as usize {
        return Ok(());
    }

    {
        let target = core.input_read_target();
        let bytes = source.len().min(target.len());
        target[..bytes].copy_from_slice(&source[..bytes]);
    }
    core.finish_input_period();

    if core.mode.has_output() {
        // Duplex: the render callback completes the period.
        return Ok(());
    }

    let (input_time, output_time) = core.period_timestamps();
    let flow = core.run_callback(input_time, output_time);
    core.tick_stream_time();
    drop(core);

    match flow {
        CallbackResult::Continue => {}
        CallbackResult::Stop => shared.post_stop_request(StopKind::Drain),
        CallbackResult::Abort => shared.post_stop_request(StopKind::Discard),
    }
    Ok(())
}
