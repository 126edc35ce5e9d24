//! ALSA backend.
//!
//! Playback and capture run on paired PCM handles opened in non-blocking
//! RW-interleaved mode. One worker thread polls the PCM descriptors and
//! drives one period per wakeup: read, callback, write, tick. Xruns
//! (`-EPIPE`) re-prepare the device and latch a status flag; the stream keeps
//! running. Software parameters keep the device rolling across xruns: start
//! threshold 0, stop threshold at the boundary, silence fill, availability
//! minimum of half the ring.

extern crate alsa;
extern crate libc;

use self::alsa::device_name::HintIter;
use self::alsa::pcm::{Access, Format, Frames, HwParams, State, PCM};
use self::alsa::poll::Descriptors;
use self::alsa::ValueOr;

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};

use crate::driver::{Driver, OpenRequest};
use crate::error::{Error, Result};
use crate::platform::BackendId;
use crate::stream::{
    Direction, StopKind, StreamCore, StreamShared, StreamState, ThreadGate,
};
use crate::{
    DeviceInfo, SampleFormat, StreamInstant, TimestampMode, GENERIC_SAMPLE_RATES,
};

impl From<alsa::Error> for Error {
    fn from(err: alsa::Error) -> Error {
        Error::system(err)
    }
}

/// Self-pipe used to interrupt the worker's `poll` on shutdown.
struct TriggerSender(libc::c_int);

struct TriggerReceiver(libc::c_int);

impl TriggerSender {
    fn wakeup(&self) {
        let buf = 1u64;
        unsafe {
            libc::write(self.0, &buf as *const u64 as *const _, 8);
        }
    }
}

impl TriggerReceiver {
    fn clear_pipe(&self) {
        let mut out = 0u64;
        unsafe {
            libc::read(self.0, &mut out as *mut u64 as *mut _, 8);
        }
    }
}

fn trigger() -> Result<(TriggerSender, TriggerReceiver)> {
    let mut fds = [0, 0];
    match unsafe { libc::pipe(fds.as_mut_ptr()) } {
        0 => Ok((TriggerSender(fds[1]), TriggerReceiver(fds[0]))),
        _ => Err(Error::system("could not create a wakeup pipe")),
    }
}

impl Drop for TriggerSender {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

impl Drop for TriggerReceiver {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// How the worker derives callback timestamps.
enum Timestamping {
    /// Engine clock: start anchor advanced one period per tick.
    Engine,
    /// Hardware htstamp relative to the trigger stamp, re-anchored at every
    /// start.
    Hardware { anchor: Mutex<StreamInstant> },
}

/// Native handles shared between the control path and the worker thread.
struct AlsaStream {
    playback: Option<PCM>,
    capture: Option<PCM>,
    timestamping: Timestamping,
}

// The alsa library is thread safe; every multi-step sequence on a handle
// happens under the stream lock.
unsafe impl Send for AlsaStream {}
unsafe impl Sync for AlsaStream {}

impl AlsaStream {
    fn pacing_pcm(&self) -> &PCM {
        self.playback
            .as_ref()
            .or(self.capture.as_ref())
            .expect("an open stream has at least one pcm")
    }
}

// PCM handles may be parked in `pending_*` while the driver moves between
// threads with its `Host`.
unsafe impl Send for AlsaDriver {}

pub(crate) struct AlsaDriver {
    shared: Arc<StreamShared>,
    /// PCMs opened by `probe_open`, moved into the worker's `AlsaStream` on
    /// first start.
    pending_playback: Option<PCM>,
    pending_capture: Option<PCM>,
    inner: Option<Arc<AlsaStream>>,
    thread: Option<JoinHandle<()>>,
    trigger_tx: Option<TriggerSender>,
    stream_name: String,
    timestamp_mode: TimestampMode,
    /// Device info captured before the stream opened; ALSA cannot probe a
    /// device that is already open.
    saved_info: Vec<DeviceInfo>,
}

impl AlsaDriver {
    pub(crate) fn new() -> Result<AlsaDriver> {
        Ok(AlsaDriver {
            shared: StreamShared::new(),
            pending_playback: None,
            pending_capture: None,
            inner: None,
            thread: None,
            trigger_tx: None,
            stream_name: String::new(),
            timestamp_mode: TimestampMode::Soft,
            saved_info: Vec::new(),
        })
    }

    /// "default" first, then every pcm hint that is not the null device.
    fn device_names(&self) -> Vec<String> {
        let mut names = vec!["default".to_owned()];
        if let Ok(hints) = HintIter::new_str(None, "pcm") {
            for hint in hints {
                match hint.name {
                    Some(ref name) if name == "null" || name == "default" => continue,
                    Some(name) => names.push(name),
                    None => continue,
                }
            }
        }
        names
    }

    fn probe_device_info(&self, index: usize, name: &str) -> DeviceInfo {
        let mut info = DeviceInfo {
            name: name.to_owned(),
            is_default_output: index == 0,
            is_default_input: index == 0,
            ..DeviceInfo::default()
        };
        for (direction, channels) in [
            (alsa::Direction::Playback, &mut info.output_channels),
            (alsa::Direction::Capture, &mut info.input_channels),
        ] {
            let pcm = match PCM::new(name, direction, true) {
                Ok(pcm) => pcm,
                Err(_) => continue,
            };
            let hw = match HwParams::any(&pcm) {
                Ok(hw) => hw,
                Err(_) => continue,
            };
            *channels = hw.get_channels_max().unwrap_or(0);
            if info.sample_rates.is_empty() {
                info.sample_rates = GENERIC_SAMPLE_RATES
                    .iter()
                    .copied()
                    .filter(|rate| hw.test_rate(*rate).is_ok())
                    .collect();
            }
            if info.native_formats.is_empty() {
                for format in SampleFormat::ALL {
                    if let Some(native) = native_format(format, false) {
                        if hw.test_format(native).is_ok() {
                            info.native_formats.push(format);
                        }
                    }
                }
            }
        }
        info.finish()
    }

    fn ensure_worker(&mut self) -> Result<Arc<AlsaStream>> {
        if let Some(inner) = &self.inner {
            return Ok(Arc::clone(inner));
        }
        let timestamping = match self.timestamp_mode {
            TimestampMode::Hardware => Timestamping::Hardware {
                anchor: Mutex::new(StreamInstant::default()),
            },
            _ => Timestamping::Engine,
        };
        let inner = Arc::new(AlsaStream {
            playback: self.pending_playback.take(),
            capture: self.pending_capture.take(),
            timestamping,
        });
        let (tx, rx) = trigger()?;
        let worker_inner = Arc::clone(&inner);
        let worker_shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name(format!("{}-alsa-io", self.stream_name))
            .spawn(move || worker(worker_inner, worker_shared, rx))
            .map_err(|err| Error::system(format!("could not spawn the device thread: {err}")))?;
        self.trigger_tx = Some(tx);
        self.thread = Some(thread);
        self.inner = Some(Arc::clone(&inner));
        Ok(inner)
    }
}

/// The preferred device format for a user format, in native byte order or
/// explicitly swapped. 24-bit streams have no stable 3-byte PCM mapping
/// across plugins, so they fall through to the conversion table.
fn native_format(format: SampleFormat, swapped: bool) -> Option<Format> {
    let little = crate::host_is_little_endian() != swapped;
    Some(match (format, little) {
        (SampleFormat::I8, _) => Format::S8,
        (SampleFormat::I16, true) => Format::S16LE,
        (SampleFormat::I16, false) => Format::S16BE,
        (SampleFormat::I32, true) => Format::S32LE,
        (SampleFormat::I32, false) => Format::S32BE,
        (SampleFormat::F32, true) => Format::FloatLE,
        (SampleFormat::F32, false) => Format::FloatBE,
        (SampleFormat::F64, true) => Format::Float64LE,
        (SampleFormat::F64, false) => Format::Float64BE,
        (SampleFormat::I24, _) => return None,
    })
}

/// Walks the format preference for `wanted` against what the device accepts:
/// exact native order first, the byte-swapped variant second, then the
/// conversion fallbacks from widest to narrowest.
fn negotiate_format(
    hw: &HwParams<'_>,
    wanted: SampleFormat,
) -> Result<(SampleFormat, Format, bool)> {
    if let Some(native) = native_format(wanted, false) {
        if hw.test_format(native).is_ok() {
            return Ok((wanted, native, false));
        }
    }
    if let Some(swapped) = native_format(wanted, true) {
        if hw.test_format(swapped).is_ok() {
            return Ok((wanted, swapped, true));
        }
    }
    const FALLBACKS: [SampleFormat; 4] = [
        SampleFormat::F32,
        SampleFormat::I32,
        SampleFormat::I16,
        SampleFormat::I8,
    ];
    for fallback in FALLBACKS {
        if let Some(native) = native_format(fallback, false) {
            if hw.test_format(native).is_ok() {
                return Ok((fallback, native, false));
            }
        }
    }
    Err(Error::system(format!(
        "device supports no format reachable from {wanted}"
    )))
}

impl Driver for AlsaDriver {
    fn backend(&self) -> BackendId {
        BackendId::Alsa
    }

    fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    fn device_count(&mut self) -> Result<usize> {
        Ok(self.device_names().len())
    }

    fn device_info(&mut self, device: usize) -> Result<DeviceInfo> {
        if !self.saved_info.is_empty() {
            return self
                .saved_info
                .get(device)
                .cloned()
                .ok_or_else(|| Error::invalid_use(format!("device index {device} out of range")));
        }
        let names = self.device_names();
        let name = names
            .get(device)
            .ok_or_else(|| Error::invalid_use(format!("device index {device} out of range")))?;
        Ok(self.probe_device_info(device, name))
    }

    fn probe_open(&mut self, request: &OpenRequest<'_>) -> Result<()> {
        let names = self.device_names();
        let name = names
            .get(request.params.device)
            .ok_or_else(|| Error::invalid_use("device index out of range"))?
            .clone();

        // Snapshot enumeration data; the handles opened below make these
        // devices unprobeable until close.
        if self.saved_info.is_empty() {
            self.saved_info = names
                .iter()
                .enumerate()
                .map(|(i, n)| self.probe_device_info(i, n))
                .collect();
        }

        let direction = match request.direction {
            Direction::Output => alsa::Direction::Playback,
            Direction::Input => alsa::Direction::Capture,
        };
        debug!(
            "probing alsa device {name:?} for {:?}: {} ch @ {} Hz, format {}",
            request.direction, request.params.channels, request.sample_rate, request.format,
        );

        let pcm = PCM::new(&name, direction, true)?;
        let accepted_frames;
        let accepted_rate;
        let accepted_periods;
        let device_channels;
        let device_format;
        let alsa_format;
        let do_byte_swap;
        {
            let hw = HwParams::any(&pcm)?;
            hw.set_access(Access::RWInterleaved)?;

            let (chosen, native, swap) = negotiate_format(&hw, request.format)?;
            hw.set_format(native)?;
            device_format = chosen;
            alsa_format = native;
            do_byte_swap = swap;

            hw.set_rate(request.sample_rate, ValueOr::Nearest)?;
            accepted_rate = hw.get_rate()?;

            let wanted = request.params.channels + request.params.first_channel;
            let max = hw.get_channels_max()?;
            if max < wanted {
                return Err(Error::system(format!(
                    "device {name:?} offers {max} channels, {wanted} requested"
                )));
            }
            let min = hw.get_channels_min()?;
            device_channels = wanted.max(min);
            hw.set_channels(device_channels)?;

            let requested_frames = if request.buffer_frames == 0 {
                hw.get_period_size_min().unwrap_or(64) as u32
            } else {
                request.buffer_frames
            };
            accepted_frames =
                hw.set_period_size_near(requested_frames as Frames, ValueOr::Nearest)? as u32;

            let mut periods = match request.options.number_of_buffers {
                0 if request.options.flags.minimize_latency => 2,
                0 => 4,
                n => n,
            };
            if periods < 2 {
                periods = 2;
            }
            hw.set_periods(periods, ValueOr::Nearest)?;
            accepted_periods = hw.get_periods().unwrap_or(periods);

            pcm.hw_params(&hw)?;
        }

        {
            // Keep the device rolling across xruns and let the worker's poll
            // pace the stream: never start implicitly stopped, silence-fill
            // underruns, wake at half the ring.
            let sw = pcm.sw_params_current()?;
            sw.set_start_threshold(0)?;
            let boundary = sw.get_boundary()?;
            sw.set_stop_threshold(boundary)?;
            sw.set_silence_threshold(0)?;
            sw.set_silence_size(boundary)?;
            sw.set_avail_min((accepted_frames as Frames) * (accepted_periods as Frames) / 2)?;
            sw.set_tstamp_mode(true)?;
            sw.set_tstamp_type(alsa::pcm::TstampType::MonotonicRaw)?;
            if pcm.sw_params(&sw).is_err() {
                sw.set_tstamp_type(alsa::pcm::TstampType::Monotonic)?;
                pcm.sw_params(&sw)?;
            }
        }

        {
            let mut core = self.shared.lock();
            let other_active = core.endpoints[1 - request.direction.idx()].user_channels > 0;
            if other_active && core.buffer_frames != accepted_frames {
                return Err(Error::system(format!(
                    "duplex period mismatch: {} vs {} frames",
                    core.buffer_frames, accepted_frames,
                )));
            }
            core.buffer_frames = accepted_frames;
            core.sample_rate = accepted_rate;
            core.n_buffers = accepted_periods;
            let ep = &mut core.endpoints[request.direction.idx()];
            ep.device = request.params.device;
            ep.user_channels = request.params.channels;
            ep.device_channels = device_channels;
            ep.device_format = device_format;
            ep.device_interleaved = true;
            ep.do_byte_swap = do_byte_swap;
            ep.latency = 0;
            core.setup_direction(request.direction, request.params.first_channel);
        }
        debug!(
            "alsa accepted: {device_channels} ch, {accepted_rate} Hz, {accepted_frames} \
             frames/period x {accepted_periods}, format {alsa_format:?} (swap: {do_byte_swap})",
        );

        match request.direction {
            Direction::Output => self.pending_playback = Some(pcm),
            Direction::Input => self.pending_capture = Some(pcm),
        }
        self.stream_name = request.options.name().to_owned();
        self.timestamp_mode = request.options.timestamp_mode;
        Ok(())
    }

    fn close(&mut self) {
        {
            let mut core = self.shared.lock();
            core.thread_running = false;
            if matches!(core.state, StreamState::Running | StreamState::Stopping) {
                core.state = StreamState::Stopped;
                if let Some(inner) = &self.inner {
                    if let Some(pcm) = &inner.playback {
                        let _ = pcm.drop();
                    }
                    if let Some(pcm) = &inner.capture {
                        let _ = pcm.drop();
                    }
                }
            }
        }
        self.shared.notify();
        if let Some(tx) = &self.trigger_tx {
            tx.wakeup();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.trigger_tx = None;
        self.inner = None;
        self.pending_playback = None;
        self.pending_capture = None;
        self.saved_info.clear();
    }

    fn start(&mut self) -> Result<()> {
        {
            let mut core = self.shared.lock();
            core.thread_running = true;
            core.pending_stop = None;
        }
        let inner = self.ensure_worker()?;
        if let Some(pcm) = &inner.playback {
            if pcm.state() != State::Prepared {
                pcm.prepare()?;
            }
        }
        if let Some(pcm) = &inner.capture {
            if pcm.state() != State::Prepared {
                pcm.prepare()?;
            }
            pcm.start()?;
        }
        if let Timestamping::Hardware { anchor } = &inner.timestamping {
            *anchor.lock().unwrap() = self.shared.lock().start_time();
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

impl Drop for AlsaDriver {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.close();
        }
    }
}

/// Stops the device, draining or dropping buffered audio, and marks the
/// stream stopped. Safe to call from the control path or the worker.
fn halt(inner: &AlsaStream, shared: &StreamShared, kind: StopKind) -> Result<()> {
    {
        let mut core = shared.lock();
        if core.state == StreamState::Stopped {
            return Ok(());
        }
        core.state = StreamState::Stopped;
    }
    let mut result = Ok(());
    if let Some(pcm) = &inner.playback {
        let outcome = match kind {
            StopKind::Drain => drain_blocking(pcm),
            StopKind::Discard => pcm.drop().map_err(Error::from),
        };
        if let Err(err) = outcome {
            error!("alsa playback halt failed: {err}");
            result = Err(err);
        }
    }
    if let Some(pcm) = &inner.capture {
        if let Err(err) = pcm.drop() {
            error!("alsa capture halt failed: {err}");
            result = Err(Error::from(err));
        }
    }
    result
}

/// `snd_pcm_drain` on a non-blocking handle reports EAGAIN until the ring
/// empties; poll it so `stop_stream` returns only after the last frame
/// played.
fn drain_blocking(pcm: &PCM) -> Result<()> {
    loop {
        match pcm.drain() {
            Ok(()) => return Ok(()),
            Err(err) if err.errno() == libc::EAGAIN => {
                thread::sleep(Duration::from_millis(1));
            }
            Err(err) => return Err(err.into()),
        }
    }
}

enum Wait {
    Ready,
    Interrupted,
    Fatal(Error),
}

/// Polls the PCM descriptors (plus the shutdown pipe) until a period's worth
/// of work is available.
fn wait_period(inner: &AlsaStream, rx: &TriggerReceiver, fds: &mut Vec<libc::pollfd>) -> Wait {
    fds.clear();
    fds.push(libc::pollfd {
        fd: rx.0,
        events: libc::POLLIN,
        revents: 0,
    });
    for pcm in [inner.playback.as_ref(), inner.capture.as_ref()]
        .into_iter()
        .flatten()
    {
        let start = fds.len();
        fds.resize(
            start + pcm.count(),
            libc::pollfd {
                fd: 0,
                events: 0,
                revents: 0,
            },
        );
        if let Err(err) = pcm.fill(&mut fds[start..]) {
            return Wait::Fatal(err.into());
        }
    }
    match alsa::poll::poll(fds, -1) {
        Ok(_) => {}
        Err(err) => return Wait::Fatal(Error::system(err)),
    }
    if fds[0].revents != 0 {
        rx.clear_pipe();
        return Wait::Interrupted;
    }
    Wait::Ready
}

fn worker(inner: Arc<AlsaStream>, shared: Arc<StreamShared>, rx: TriggerReceiver) {
    let mut fds: Vec<libc::pollfd> = Vec::new();
    loop {
        match shared.wait_runnable() {
            ThreadGate::Exit => return,
            ThreadGate::Run => {}
        }
        match wait_period(&inner, &rx, &mut fds) {
            Wait::Ready => {}
            Wait::Interrupted => continue,
            Wait::Fatal(err) => {
                error!("alsa poll failed, stopping stream: {err}");
                shared.lock().state = StreamState::Stopped;
                continue;
            }
        }
        run_one_period(&inner, &shared);
    }
}

fn run_one_period(inner: &AlsaStream, shared: &StreamShared) {
    let mut core = shared.lock();
    if core.state != StreamState::Running {
        return;
    }
    let frames = core.buffer_frames as usize;

    // Input half: one period into the engine's read target.
    if let Some(pcm) = &inner.capture {
        let target = core.input_read_target();
        match pcm.io_bytes().readi(target) {
            Ok(read) if read == frames => {
                core.finish_input_period();
                if let Ok(delay) = pcm.delay() {
                    if delay > 0 {
                        core.endpoints[1].latency = delay as u64;
                    }
                }
            }
            Ok(short) => {
                warn!("alsa short read: {short}/{frames} frames");
                core.xrun[1] = true;
            }
            Err(err) if err.errno() == libc::EPIPE => {
                // Capture overran; recover and surface it next period.
                core.xrun[1] = true;
                if let Err(err) = pcm.try_recover(err, true) {
                    error!("alsa overrun recovery failed: {err}");
                    core.state = StreamState::Stopped;
                    return;
                }
                let _ = pcm.start();
            }
            Err(err) if err.errno() == libc::EAGAIN => {
                // Poll woke for the playback side only; deliver silence-free
                // output and try the input again next period.
            }
            Err(err) => {
                error!("alsa read failed, stopping stream: {err}");
                core.state = StreamState::Stopped;
                return;
            }
        }
    }

    let (input_time, output_time) = timestamps(inner, &core);
    let flow = core.run_callback(input_time, output_time);

    if flow == crate::CallbackResult::Abort {
        drop(core);
        let _ = halt(inner, shared, StopKind::Discard);
        return;
    }

    // Output half.
    if let Some(pcm) = &inner.playback {
        loop {
            let buffer = core.render_output_period();
            match pcm.io_bytes().writei(buffer) {
                Ok(written) if written == frames => break,
                Ok(short) => {
                    warn!("alsa short write: {short}/{frames} frames");
                    core.xrun[0] = true;
                    break;
                }
                Err(err) if err.errno() == libc::EPIPE => {
                    // Underrun; prepare and retry this period once.
                    core.xrun[0] = true;
                    if let Err(err) = pcm.try_recover(err, true) {
                        error!("alsa underrun recovery failed: {err}");
                        core.state = StreamState::Stopped;
                        return;
                    }
                }
                Err(err) if err.errno() == libc::EAGAIN => break,
                Err(err) => {
                    error!("alsa write failed, stopping stream: {err}");
                    core.state = StreamState::Stopped;
                    return;
                }
            }
        }
        if let Ok(delay) = pcm.delay() {
            if delay > 0 {
                core.endpoints[0].latency = delay as u64;
            }
        }
    }

    core.tick_stream_time();
    drop(core);

    if flow == crate::CallbackResult::Stop {
        let _ = halt(inner, shared, StopKind::Drain);
    }
}

/// Engine-clock timestamps, upgraded to hardware stamps when the device
/// clock is monotonic and the stream asked for them.
fn timestamps(inner: &AlsaStream, core: &StreamCore) -> (StreamInstant, StreamInstant) {
    if let Timestamping::Hardware { anchor } = &inner.timestamping {
        let pcm = inner.pacing_pcm();
        if let Ok(status) = pcm.status() {
            let ts = status.get_htstamp();
            let trigger_ts = status.get_trigger_htstamp();
            let nanos = timespec_diff_nanos(ts, trigger_ts);
            if nanos > 0 {
                let base = anchor.lock().unwrap().add(Duration::from_nanos(nanos as u64));
                let input = base.sub(core.frames_duration(core.endpoints[1].latency));
                let output = base.add(core.frames_duration(core.endpoints[0].latency));
                return (input, output);
            }
        }
    }
    core.period_timestamps()
}

fn timespec_to_nanos(ts: libc::timespec) -> i64 {
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

fn timespec_diff_nanos(a: libc::timespec, b: libc::timespec) -> i64 {
    timespec_to_nanos(a) - timespec_to_nanos(b)
}
