//! DirectSound backend for Windows.
//!
//! One looping secondary buffer per direction, sized `n_buffers` periods.
//! A worker thread chases the device cursors: it keeps the next write
//! position a configurable lead time ahead of the safe write cursor, sleeps
//! half a period between visits, and handles ring wrap-around. Being
//! overtaken by the cursor latches the direction's xrun flag; the stream
//! keeps running. A device-requested shutdown (buffer lost) marks the
//! stream stopped; the callback-requested stop path is entirely separate.

use windows::core::GUID;
use windows::Win32::Foundation::HWND;
use windows::Win32::Media::Audio::DirectSound::{
    DirectSoundCaptureCreate, DirectSoundCreate, IDirectSound, IDirectSoundBuffer,
    IDirectSoundCapture, IDirectSoundCaptureBuffer, DSBCAPS_GETCURRENTPOSITION2,
    DSBCAPS_GLOBALFOCUS, DSBUFFERDESC, DSCBSTART_LOOPING, DSCBUFFERDESC, DSBPLAY_LOOPING,
    DSSCL_PRIORITY,
};
use windows::Win32::Media::Audio::{WAVEFORMATEX, WAVE_FORMAT_PCM};
use windows::Win32::UI::WindowsAndMessaging::GetDesktopWindow;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};

use crate::driver::{Driver, OpenRequest};
use crate::error::{Error, Result};
use crate::platform::BackendId;
use crate::stream::{Direction, StopKind, StreamShared, StreamState, ThreadGate};
use crate::{DeviceInfo, SampleFormat, GENERIC_SAMPLE_RATES};

const IEEE_FLOAT: u16 = 3; // WAVE_FORMAT_IEEE_FLOAT

fn win_err(what: &str, err: windows::core::Error) -> Error {
    Error::system(format!("{what} failed: {err}"))
}

/// The nearest PCM format DirectSound accepts.
fn device_format_for(format: SampleFormat) -> (SampleFormat, u16) {
    match format {
        SampleFormat::I8 => (SampleFormat::I8, WAVE_FORMAT_PCM as u16),
        SampleFormat::I16 => (SampleFormat::I16, WAVE_FORMAT_PCM as u16),
        SampleFormat::I24 => (SampleFormat::I24, WAVE_FORMAT_PCM as u16),
        SampleFormat::I32 => (SampleFormat::I32, WAVE_FORMAT_PCM as u16),
        SampleFormat::F32 => (SampleFormat::F32, IEEE_FLOAT),
        SampleFormat::F64 => (SampleFormat::F32, IEEE_FLOAT),
    }
}

fn wave_format(channels: u32, sample_rate: u32, format: SampleFormat, tag: u16) -> WAVEFORMATEX {
    let bits = (format.sample_size() * 8) as u16;
    let block_align = channels as u16 * (bits / 8);
    WAVEFORMATEX {
        wFormatTag: tag,
        nChannels: channels as u16,
        nSamplesPerSec: sample_rate,
        nAvgBytesPerSec: sample_rate * block_align as u32,
        nBlockAlign: block_align,
        wBitsPerSample: bits,
        cbSize: 0,
    }
}

struct DsPlayback {
    _ds: IDirectSound,
    buffer: IDirectSoundBuffer,
    ring_bytes: u32,
}

struct DsCapture {
    _ds: IDirectSoundCapture,
    buffer: IDirectSoundCaptureBuffer,
    ring_bytes: u32,
}

struct DsStream {
    playback: Option<DsPlayback>,
    capture: Option<DsCapture>,
    period_bytes: [u32; 2],
    /// Bytes to stay ahead of the safe write cursor.
    lead_bytes: u32,
    period: Duration,
}

// COM pointers are used from the worker and the control path; every
// multi-step sequence happens under the stream lock.
unsafe impl Send for DsStream {}
unsafe impl Sync for DsStream {}

// COM pointers may be parked in `pending_*` while the driver moves between
// threads with its `Host`.
unsafe impl Send for DirectSoundDriver {}

pub(crate) struct DirectSoundDriver {
    shared: Arc<StreamShared>,
    inner: Option<Arc<DsStream>>,
    pending_playback: Option<DsPlayback>,
    pending_capture: Option<DsCapture>,
    thread: Option<JoinHandle<()>>,
    stream_name: String,
}

impl DirectSoundDriver {
    pub(crate) fn new() -> Result<DirectSoundDriver> {
        Ok(DirectSoundDriver {
            shared: StreamShared::new(),
            inner: None,
            pending_playback: None,
            pending_capture: None,
            thread: None,
            stream_name: String::new(),
        })
    }

    fn ensure_worker(&mut self) -> Result<Arc<DsStream>> {
        if let Some(inner) = &self.inner {
            return Ok(Arc::clone(inner));
        }
        let (frames, rate, period_bytes, lead) = {
            let core = self.shared.lock();
            let out_bytes = core.device_period_bytes(Direction::Output) as u32;
            let in_bytes = core.device_period_bytes(Direction::Input) as u32;
            (
                core.buffer_frames,
                core.sample_rate.max(1),
                [out_bytes, in_bytes],
                out_bytes / 2,
            )
        };
        let inner = Arc::new(DsStream {
            playback: self.pending_playback.take(),
            capture: self.pending_capture.take(),
            period_bytes,
            lead_bytes: lead,
            period: Duration::from_nanos(frames as u64 * 1_000_000_000 / rate as u64),
        });
        let worker_inner = Arc::clone(&inner);
        let worker_shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name(format!("{}-ds-io", self.stream_name))
            .spawn(move || worker(worker_inner, worker_shared))
            .map_err(|err| Error::system(format!("could not spawn the device thread: {err}")))?;
        self.thread = Some(thread);
        self.inner = Some(Arc::clone(&inner));
        Ok(inner)
    }
}

impl Driver for DirectSoundDriver {
    fn backend(&self) -> BackendId {
        BackendId::DirectSound
    }

    fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    fn device_count(&mut self) -> Result<usize> {
        // The default playback/capture pair. Device GUID enumeration is
        // routed through the default device to keep one index space.
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
                SampleFormat::I8,
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
        let (device_format, tag) = device_format_for(request.format);
        let device_channels = request.params.channels + request.params.first_channel;
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
        let format = wave_format(device_channels, request.sample_rate, device_format, tag);
        let period_bytes = frames * format.nBlockAlign as u32;
        let ring_bytes = period_bytes * periods;
        debug!(
            "probing DirectSound for {:?}: {device_channels} ch @ {} Hz, ring {ring_bytes} bytes",
            request.direction, request.sample_rate,
        );

        match request.direction {
            Direction::Output => {
                let mut ds: Option<IDirectSound> = None;
                unsafe { DirectSoundCreate(None, &mut ds, None) }
                    .map_err(|err| win_err("DirectSoundCreate", err))?;
                let ds = ds.ok_or_else(|| Error::system("no DirectSound interface"))?;
                let window: HWND = unsafe { GetDesktopWindow() };
                unsafe { ds.SetCooperativeLevel(window, DSSCL_PRIORITY) }
                    .map_err(|err| win_err("SetCooperativeLevel", err))?;
                let desc = DSBUFFERDESC {
                    dwSize: std::mem::size_of::<DSBUFFERDESC>() as u32,
                    dwFlags: DSBCAPS_GETCURRENTPOSITION2 | DSBCAPS_GLOBALFOCUS,
                    dwBufferBytes: ring_bytes,
                    dwReserved: 0,
                    lpwfxFormat: &format as *const _ as *mut _,
                    guid3DAlgorithm: GUID::zeroed(),
                };
                let mut buffer: Option<IDirectSoundBuffer> = None;
                unsafe { ds.CreateSoundBuffer(&desc, &mut buffer, None) }
                    .map_err(|err| win_err("CreateSoundBuffer", err))?;
                let buffer = buffer.ok_or_else(|| Error::system("no playback buffer"))?;
                self.pending_playback = Some(DsPlayback {
                    _ds: ds,
                    buffer,
                    ring_bytes,
                });
            }
            Direction::Input => {
                let mut ds: Option<IDirectSoundCapture> = None;
                unsafe { DirectSoundCaptureCreate(None, &mut ds, None) }
                    .map_err(|err| win_err("DirectSoundCaptureCreate", err))?;
                let ds = ds.ok_or_else(|| Error::system("no capture interface"))?;
                let desc = DSCBUFFERDESC {
                    dwSize: std::mem::size_of::<DSCBUFFERDESC>() as u32,
                    dwFlags: 0,
                    dwBufferBytes: ring_bytes,
                    dwReserved: 0,
                    lpwfxFormat: &format as *const _ as *mut _,
                    dwFXCount: 0,
                    lpDSCFXDesc: std::ptr::null_mut(),
                };
                let mut buffer: Option<IDirectSoundCaptureBuffer> = None;
                unsafe { ds.CreateCaptureBuffer(&desc, &mut buffer, None) }
                    .map_err(|err| win_err("CreateCaptureBuffer", err))?;
                let buffer = buffer.ok_or_else(|| Error::system("no capture buffer"))?;
                self.pending_capture = Some(DsCapture {
                    _ds: ds,
                    buffer,
                    ring_bytes,
                });
            }
        }

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
            ep.device_channels = device_channels;
            ep.device_format = device_format;
            ep.device_interleaved = true;
            ep.do_byte_swap = false;
            ep.latency = (frames * periods / 2) as u64;
            core.setup_direction(request.direction, request.params.first_channel);
        }
        self.stream_name = request.options.name().to_owned();
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
                unsafe {
                    let _ = playback.buffer.Stop();
                }
            }
            if let Some(capture) = &inner.capture {
                unsafe {
                    let _ = capture.buffer.Stop();
                }
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
        let inner = self.ensure_worker()?;
        if let Some(playback) = &inner.playback {
            unsafe { playback.buffer.Play(0, 0, DSBPLAY_LOOPING) }
                .map_err(|err| win_err("Play", err))?;
        }
        if let Some(capture) = &inner.capture {
            unsafe { capture.buffer.Start(DSCBSTART_LOOPING) }
                .map_err(|err| win_err("Start", err))?;
        }
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

impl Drop for DirectSoundDriver {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.close();
        }
    }
}

fn halt(inner: &DsStream, shared: &StreamShared, kind: StopKind) -> Result<()> {
    if kind == StopKind::Drain {
        // Let the cursor consume what the worker already queued.
        let lead_periods = {
            let core = shared.lock();
            core.n_buffers.max(2)
        };
        thread::sleep(inner.period * lead_periods);
    }
    let mut core = shared.lock();
    if core.state == StreamState::Stopped {
        return Ok(());
    }
    core.state = StreamState::Stopped;
    if let Some(playback) = &inner.playback {
        unsafe {
            playback.buffer.Stop().map_err(|err| win_err("Stop", err))?;
            if kind == StopKind::Discard {
                let _ = playback.buffer.SetCurrentPosition(0);
            }
        }
    }
    if let Some(capture) = &inner.capture {
        unsafe {
            capture.buffer.Stop().map_err(|err| win_err("Stop", err))?;
        }
    }
    Ok(())
}

/// Locks the DirectSound ring at `offset` and copies `data` in, handling
/// wrap-around via the second locked region.
unsafe fn write_ring(buffer: &IDirectSoundBuffer, offset: u32, data: &[u8]) -> Result<()> {
    let mut ptr1 = std::ptr::null_mut();
    let mut len1 = 0u32;
    let mut ptr2 = std::ptr::null_mut();
    let mut len2 = 0u32;
    buffer
        .Lock(
            offset,
            data.len() as u32,
            &mut ptr1,
            &mut len1,
            Some(&mut ptr2),
            Some(&mut len2),
            0,
        )
        .map_err(|err| win_err("Lock", err))?;
    let first = len1.min(data.len() as u32) as usize;
    std::ptr::copy_nonoverlapping(data.as_ptr(), ptr1 as *mut u8, first);
    if !ptr2.is_null() && first < data.len() {
        let second = (data.len() - first).min(len2 as usize);
        std::ptr::copy_nonoverlapping(data.as_ptr().add(first), ptr2 as *mut u8, second);
    }
    buffer
        .Unlock(ptr1, len1, ptr2, len2)
        .map_err(|err| win_err("Unlock", err))
}

/// Reads one period out of the capture ring at `offset`.
unsafe fn read_ring(buffer: &IDirectSoundCaptureBuffer, offset: u32, data: &mut [u8]) -> Result<()> {
    let mut ptr1 = std::ptr::null_mut();
    let mut len1 = 0u32;
    let mut ptr2 = std::ptr::null_mut();
    let mut len2 = 0u32;
    buffer
        .Lock(
            offset,
            data.len() as u32,
            &mut ptr1,
            &mut len1,
            Some(&mut ptr2),
            Some(&mut len2),
            0,
        )
        .map_err(|err| win_err("Lock", err))?;
    let first = len1.min(data.len() as u32) as usize;
    std::ptr::copy_nonoverlapping(ptr1 as *const u8, data.as_mut_ptr(), first);
    if !ptr2.is_null() && first < data.len() {
        let second = (data.len() - first).min(len2 as usize);
        std::ptr::copy_nonoverlapping(ptr2 as *const u8, data.as_mut_ptr().add(first), second);
    }
    buffer
        .Unlock(ptr1, len1, ptr2, len2)
        .map_err(|err| win_err("Unlock", err))
}

fn worker(inner: Arc<DsStream>, shared: Arc<StreamShared>) {
    // Ring positions owned by the worker.
    let mut next_write = inner.lead_bytes;
    let mut next_read = 0u32;
    let mut input_scratch: Vec<u8> = vec![0; inner.period_bytes[1] as usize];
    loop {
        match shared.wait_runnable() {
            ThreadGate::Exit => return,
            ThreadGate::Run => {}
        }

        // Wait for cursor progress outside the lock.
        thread::sleep(inner.period / 2);

        let mut core = shared.lock();
        if core.state != StreamState::Running {
            continue;
        }

        // Input: copy the oldest unread period once it is behind the read
        // cursor.
        if let Some(capture) = &inner.capture {
            let mut capture_pos = 0u32;
            let mut read_pos = 0u32;
            if let Err(err) =
                unsafe { capture.buffer.GetCurrentPosition(Some(&mut capture_pos), Some(&mut read_pos)) }
            {
                error!("capture cursor query failed, stopping stream: {err}");
                core.state = StreamState::Stopped;
                continue;
            }
            let period = inner.period_bytes[1];
            let available = (read_pos + capture.ring_bytes - next_read) % capture.ring_bytes;
            if available < period {
                // Not a full period yet; revisit after the next sleep.
                drop(core);
                continue;
            }
            if available > capture.ring_bytes - period {
                // The capture cursor lapped us.
                warn!("capture ring overrun");
                core.xrun[1] = true;
                next_read = read_pos;
            }
            if let Err(err) = unsafe { read_ring(&capture.buffer, next_read, &mut input_scratch) } {
                error!("capture read failed, stopping stream: {err}");
                core.state = StreamState::Stopped;
                continue;
            }
            next_read = (next_read + period) % capture.ring_bytes;
            core.input_read_target().copy_from_slice(&input_scratch);
            core.finish_input_period();
        }

        let (input_time, output_time) = core.period_timestamps();
        let flow = core.run_callback(input_time, output_time);

        if flow == crate::CallbackResult::Abort {
            drop(core);
            let _ = halt(&inner, &shared, StopKind::Discard);
            continue;
        }

        if let Some(playback) = &inner.playback {
            let mut play_pos = 0u32;
            let mut write_pos = 0u32;
            if let Err(err) =
                unsafe { playback.buffer.GetCurrentPosition(Some(&mut play_pos), Some(&mut write_pos)) }
            {
                error!("playback cursor query failed, stopping stream: {err}");
                core.state = StreamState::Stopped;
                continue;
            }
            let period = inner.period_bytes[0];
            // Distance from the safe write cursor to our next slot; if the
            // cursor overtook it, the device played stale data.
            let ahead = (next_write + playback.ring_bytes - write_pos) % playback.ring_bytes;
            if ahead > playback.ring_bytes / 2 {
                warn!("playback cursor overtook the write position");
                core.xrun[0] = true;
                next_write = (write_pos + inner.lead_bytes) % playback.ring_bytes;
            }
            let rendered = core.render_output_period();
            let result = unsafe { write_ring(&playback.buffer, next_write, rendered) };
            if let Err(err) = result {
                error!("playback write failed, stopping stream: {err}");
                core.state = StreamState::Stopped;
                continue;
            }
            next_write = (next_write + period) % playback.ring_bytes;
        }

        core.tick_stream_time();
        drop(core);

        if flow == crate::CallbackResult::Stop {
            let _ = halt(&inner, &shared, StopKind::Drain);
        }
    }
}
