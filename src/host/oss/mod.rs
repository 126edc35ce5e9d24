//! OSS backend for the BSDs.
//!
//! Blocking `read`/`write` on `/dev/dsp*` file descriptors, one per
//! direction, driven by a worker thread. Fragment geometry is negotiated
//! with `SNDCTL_DSP_SETFRAGMENT`; duplex requires the device to report
//! `DSP_CAP_DUPLEX`. `stop` issues `SNDCTL_DSP_SYNC` (drain), `abort`
//! `SNDCTL_DSP_RESET`. Exclusive access (`hog_device`) maps to `O_EXCL`,
//! which bypasses in-kernel mixing.

extern crate libc;

use std::ffi::CString;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, warn};

use crate::driver::{Driver, OpenRequest};
use crate::error::{Error, Result};
use crate::platform::BackendId;
use crate::stream::{Direction, StopKind, StreamShared, StreamState, ThreadGate};
use crate::{DeviceInfo, SampleFormat, GENERIC_SAMPLE_RATES};

// ioctl encodings and AFMT bits from <sys/soundcard.h>.
const IOC_VOID: libc::c_ulong = 0x2000_0000;
const IOC_OUT: libc::c_ulong = 0x4000_0000;
const IOC_INOUT: libc::c_ulong = 0xc000_0000;

const fn io(group: libc::c_ulong, num: libc::c_ulong) -> libc::c_ulong {
    IOC_VOID | (group << 8) | num
}

const fn ior_int(group: libc::c_ulong, num: libc::c_ulong) -> libc::c_ulong {
    IOC_OUT | (4 << 16) | (group << 8) | num
}

const fn iowr_int(group: libc::c_ulong, num: libc::c_ulong) -> libc::c_ulong {
    IOC_INOUT | (4 << 16) | (group << 8) | num
}

const SNDCTL_DSP_RESET: libc::c_ulong = io(b'P' as libc::c_ulong, 0);
const SNDCTL_DSP_SYNC: libc::c_ulong = io(b'P' as libc::c_ulong, 1);
const SNDCTL_DSP_SPEED: libc::c_ulong = iowr_int(b'P' as libc::c_ulong, 2);
const SNDCTL_DSP_SETFMT: libc::c_ulong = iowr_int(b'P' as libc::c_ulong, 5);
const SNDCTL_DSP_CHANNELS: libc::c_ulong = iowr_int(b'P' as libc::c_ulong, 6);
const SNDCTL_DSP_SETFRAGMENT: libc::c_ulong = iowr_int(b'P' as libc::c_ulong, 10);
const SNDCTL_DSP_GETFMTS: libc::c_ulong = ior_int(b'P' as libc::c_ulong, 11);
const SNDCTL_DSP_GETCAPS: libc::c_ulong = ior_int(b'P' as libc::c_ulong, 15);

const DSP_CAP_DUPLEX: libc::c_int = 0x0000_0100;

const AFMT_S8: libc::c_int = 0x0000_0040;
const AFMT_S16_LE: libc::c_int = 0x0000_0010;
const AFMT_S16_BE: libc::c_int = 0x0000_0020;
const AFMT_S32_LE: libc::c_int = 0x0000_1000;
const AFMT_S32_BE: libc::c_int = 0x0000_2000;
const AFMT_S24_LE: libc::c_int = 0x0001_0000;
const AFMT_S24_BE: libc::c_int = 0x0002_0000;

fn last_os_error() -> Error {
    Error::system(std::io::Error::last_os_error())
}

fn dsp_ioctl(fd: libc::c_int, request: libc::c_ulong, value: &mut libc::c_int) -> Result<()> {
    if unsafe { libc::ioctl(fd, request, value as *mut libc::c_int) } == -1 {
        return Err(last_os_error());
    }
    Ok(())
}

fn dsp_ioctl_void(fd: libc::c_int, request: libc::c_ulong) -> Result<()> {
    if unsafe { libc::ioctl(fd, request) } == -1 {
        return Err(last_os_error());
    }
    Ok(())
}

/// An owned dsp file descriptor.
struct Dsp(libc::c_int);

impl Drop for Dsp {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

fn open_dsp(path: &str, flags: libc::c_int) -> Result<Dsp> {
    let cpath = CString::new(path).map_err(|_| Error::invalid_use("bad device path"))?;
    let fd = unsafe { libc::open(cpath.as_ptr(), flags, 0) };
    if fd == -1 {
        return Err(Error::system(format!(
            "could not open {path}: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(Dsp(fd))
}

fn device_paths() -> Vec<String> {
    let mut paths = Vec::new();
    if Path::new("/dev/dsp").exists() {
        paths.push("/dev/dsp".to_owned());
    }
    for i in 0..16 {
        let path = format!("/dev/dsp{i}");
        if Path::new(&path).exists() {
            paths.push(path);
        }
    }
    paths
}

/// Best native format for the user's, given the device's AFMT mask; native
/// byte order preferred, the swapped order tolerated, then narrower
/// fallbacks through the conversion pass.
fn negotiate_format(mask: libc::c_int, wanted: SampleFormat) -> Result<(SampleFormat, libc::c_int, bool)> {
    let little = crate::host_is_little_endian();
    let (ne16, oe16) = if little {
        (AFMT_S16_LE, AFMT_S16_BE)
    } else {
        (AFMT_S16_BE, AFMT_S16_LE)
    };
    let (ne24, oe24) = if little {
        (AFMT_S24_LE, AFMT_S24_BE)
    } else {
        (AFMT_S24_BE, AFMT_S24_LE)
    };
    let (ne32, oe32) = if little {
        (AFMT_S32_LE, AFMT_S32_BE)
    } else {
        (AFMT_S32_BE, AFMT_S32_LE)
    };
    let preferences: &[(SampleFormat, libc::c_int, bool)] = match wanted {
        SampleFormat::I8 => &[(SampleFormat::I8, AFMT_S8, false)],
        SampleFormat::I16 => &[
            (SampleFormat::I16, ne16, false),
            (SampleFormat::I16, oe16, true),
        ],
        SampleFormat::I24 => &[
            (SampleFormat::I24, ne24, false),
            (SampleFormat::I24, oe24, true),
        ],
        SampleFormat::I32 | SampleFormat::F32 | SampleFormat::F64 => &[
            (SampleFormat::I32, ne32, false),
            (SampleFormat::I32, oe32, true),
        ],
    };
    for &(format, afmt, swap) in preferences {
        if mask & afmt != 0 {
            return Ok((format, afmt, swap));
        }
    }
    // Anything the device does speak, widest first.
    let fallbacks = [
        (SampleFormat::I32, ne32, false),
        (SampleFormat::I32, oe32, true),
        (SampleFormat::I24, ne24, false),
        (SampleFormat::I24, oe24, true),
        (SampleFormat::I16, ne16, false),
        (SampleFormat::I16, oe16, true),
        (SampleFormat::I8, AFMT_S8, false),
    ];
    for (format, afmt, swap) in fallbacks {
        if mask & afmt != 0 {
            return Ok((format, afmt, swap));
        }
    }
    Err(Error::system("device reports no usable sample format"))
}

struct OssStream {
    playback: Option<Dsp>,
    capture: Option<Dsp>,
}

unsafe impl Send for OssStream {}
unsafe impl Sync for OssStream {}

pub(crate) struct OssDriver {
    shared: Arc<StreamShared>,
    inner: Option<Arc<OssStream>>,
    pending_playback: Option<Dsp>,
    pending_capture: Option<Dsp>,
    thread: Option<JoinHandle<()>>,
    stream_name: String,
}

impl OssDriver {
    pub(crate) fn new() -> Result<OssDriver> {
        Ok(OssDriver {
            shared: StreamShared::new(),
            inner: None,
            pending_playback: None,
            pending_capture: None,
            thread: None,
            stream_name: String::new(),
        })
    }

    fn ensure_worker(&mut self) -> Result<Arc<OssStream>> {
        if let Some(inner) = &self.inner {
            return Ok(Arc::clone(inner));
        }
        let inner = Arc::new(OssStream {
            playback: self.pending_playback.take(),
            capture: self.pending_capture.take(),
        });
        let worker_inner = Arc::clone(&inner);
        let worker_shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name(format!("{}-oss-io", self.stream_name))
            .spawn(move || worker(worker_inner, worker_shared))
            .map_err(|err| Error::system(format!("could not spawn the device thread: {err}")))?;
        self.thread = Some(thread);
        self.inner = Some(Arc::clone(&inner));
        Ok(inner)
    }
}

impl Driver for OssDriver {
    fn backend(&self) -> BackendId {
        BackendId::Oss
    }

    fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    fn device_count(&mut self) -> Result<usize> {
        Ok(device_paths().len())
    }

    fn device_info(&mut self, device: usize) -> Result<DeviceInfo> {
        let paths = device_paths();
        let path = paths
            .get(device)
            .ok_or_else(|| Error::invalid_use(format!("device index {device} out of range")))?;
        let mut info = DeviceInfo {
            name: path.clone(),
            is_default_output: device == 0,
            is_default_input: device == 0,
            sample_rates: GENERIC_SAMPLE_RATES.to_vec(),
            ..DeviceInfo::default()
        };
        if let Ok(dsp) = open_dsp(path, libc::O_WRONLY | libc::O_NONBLOCK) {
            info.output_channels = 2;
            let mut mask = 0;
            if dsp_ioctl(dsp.0, SNDCTL_DSP_GETFMTS, &mut mask).is_ok() {
                for (format, bit) in [
                    (SampleFormat::I8, AFMT_S8),
                    (SampleFormat::I16, AFMT_S16_LE | AFMT_S16_BE),
                    (SampleFormat::I24, AFMT_S24_LE | AFMT_S24_BE),
                    (SampleFormat::I32, AFMT_S32_LE | AFMT_S32_BE),
                ] {
                    if mask & bit != 0 {
                        info.native_formats.push(format);
                    }
                }
            }
        }
        if open_dsp(path, libc::O_RDONLY | libc::O_NONBLOCK).is_ok() {
            info.input_channels = 2;
        }
        Ok(info.finish())
    }

    fn probe_open(&mut self, request: &OpenRequest<'_>) -> Result<()> {
        let paths = device_paths();
        let path = paths
            .get(request.params.device)
            .ok_or_else(|| Error::invalid_use("device index out of range"))?
            .clone();
        if request.params.first_channel != 0 {
            return Err(Error::system(
                "the OSS backend cannot address a channel offset",
            ));
        }

        let mut flags = match request.direction {
            Direction::Output => libc::O_WRONLY,
            Direction::Input => libc::O_RDONLY,
        };
        if request.options.flags.hog_device {
            flags |= libc::O_EXCL;
        }
        let dsp = open_dsp(&path, flags)?;
        debug!(
            "probing oss device {path} for {:?}: {} ch @ {} Hz",
            request.direction, request.params.channels, request.sample_rate,
        );

        // Duplex only on devices that advertise it.
        {
            let core = self.shared.lock();
            let other_active = core.endpoints[1 - request.direction.idx()].user_channels > 0;
            drop(core);
            if other_active {
                let mut caps = 0;
                dsp_ioctl(dsp.0, SNDCTL_DSP_GETCAPS, &mut caps)?;
                if caps & DSP_CAP_DUPLEX == 0 {
                    return Err(Error::system(format!(
                        "{path} does not support duplex operation"
                    )));
                }
            }
        }

        let mut channels = request.params.channels as libc::c_int;
        dsp_ioctl(dsp.0, SNDCTL_DSP_CHANNELS, &mut channels)?;
        if (channels as u32) < request.params.channels {
            return Err(Error::system(format!(
                "{path} accepted only {channels} channels"
            )));
        }
        let device_channels = channels as u32;

        let mut mask = 0;
        dsp_ioctl(dsp.0, SNDCTL_DSP_GETFMTS, &mut mask)?;
        let (device_format, mut afmt, do_byte_swap) = negotiate_format(mask, request.format)?;
        let chosen = afmt;
        dsp_ioctl(dsp.0, SNDCTL_DSP_SETFMT, &mut afmt)?;
        if afmt != chosen {
            return Err(Error::system("device refused the negotiated sample format"));
        }

        // Fragment geometry: round one period up to a power-of-two byte
        // count, as the fragment interface requires.
        let frames = if request.buffer_frames == 0 {
            256
        } else {
            request.buffer_frames
        };
        let frame_bytes = device_channels * device_format.sample_size() as u32;
        let fragment_bytes = (frames * frame_bytes).next_power_of_two();
        let accepted_frames = fragment_bytes / frame_bytes;
        let periods = match request.options.number_of_buffers {
            0 if request.options.flags.minimize_latency => 2,
            0 => 4,
            n => n.max(2),
        };
        let mut fragment =
            ((periods as libc::c_int) << 16) | fragment_bytes.trailing_zeros() as libc::c_int;
        dsp_ioctl(dsp.0, SNDCTL_DSP_SETFRAGMENT, &mut fragment)?;

        let mut rate = request.sample_rate as libc::c_int;
        dsp_ioctl(dsp.0, SNDCTL_DSP_SPEED, &mut rate)?;
        if rate <= 0 {
            return Err(Error::system("device reported a nonsensical sample rate"));
        }

        {
            let mut core = self.shared.lock();
            let other_active = core.endpoints[1 - request.direction.idx()].user_channels > 0;
            if other_active && core.buffer_frames != accepted_frames {
                return Err(Error::system("duplex period mismatch"));
            }
            core.buffer_frames = accepted_frames;
            core.sample_rate = rate as u32;
            core.n_buffers = periods;
            let ep = &mut core.endpoints[request.direction.idx()];
            ep.device = request.params.device;
            ep.user_channels = request.params.channels;
            ep.device_channels = device_channels;
            ep.device_format = device_format;
            ep.device_interleaved = true;
            ep.do_byte_swap = do_byte_swap;
            ep.latency = (accepted_frames * periods) as u64 / 2;
            core.setup_direction(request.direction, 0);
        }

        match request.direction {
            Direction::Output => self.pending_playback = Some(dsp),
            Direction::Input => self.pending_capture = Some(dsp),
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
                if let Some(inner) = &self.inner {
                    if let Some(dsp) = &inner.playback {
                        let _ = dsp_ioctl_void(dsp.0, SNDCTL_DSP_RESET);
                    }
                    if let Some(dsp) = &inner.capture {
                        let _ = dsp_ioctl_void(dsp.0, SNDCTL_DSP_RESET);
                    }
                }
            }
        }
        self.shared.notify();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.inner = None;
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

impl Drop for OssDriver {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.close();
        }
    }
}

fn halt(inner: &OssStream, shared: &StreamShared, kind: StopKind) -> Result<()> {
    let mut core = shared.lock();
    if core.state == StreamState::Stopped {
        return Ok(());
    }
    core.state = StreamState::Stopped;
    let mut result = Ok(());
    if let Some(dsp) = &inner.playback {
        let request = match kind {
            StopKind::Drain => SNDCTL_DSP_SYNC,
            StopKind::Discard => SNDCTL_DSP_RESET,
        };
        if let Err(err) = dsp_ioctl_void(dsp.0, request) {
            error!("oss playback halt failed: {err}");
            result = Err(err);
        }
    }
    if let Some(dsp) = &inner.capture {
        if let Err(err) = dsp_ioctl_void(dsp.0, SNDCTL_DSP_RESET) {
            error!("oss capture halt failed: {err}");
            result = Err(err);
        }
    }
    result
}

fn worker(inner: Arc<OssStream>, shared: Arc<StreamShared>) {
    loop {
        match shared.wait_runnable() {
            ThreadGate::Exit => return,
            ThreadGate::Run => {}
        }
        let mut core = shared.lock();
        if core.state != StreamState::Running {
            continue;
        }

        if let Some(dsp) = &inner.capture {
            let target = core.input_read_target();
            let wanted = target.len();
            let got = unsafe { libc::read(dsp.0, target.as_mut_ptr() as *mut _, wanted) };
            if got < 0 {
                error!(
                    "oss read failed, stopping stream: {}",
                    std::io::Error::last_os_error()
                );
                core.state = StreamState::Stopped;
                continue;
            }
            if (got as usize) < wanted {
                warn!("oss short read: {got}/{wanted} bytes");
                core.xrun[1] = true;
            }
            core.finish_input_period();
        }

        let (input_time, output_time) = core.period_timestamps();
        let flow = core.run_callback(input_time, output_time);

        if flow == crate::CallbackResult::Abort {
            drop(core);
            let _ = halt(&inner, &shared, StopKind::Discard);
            continue;
        }

        if let Some(dsp) = &inner.playback {
            let buffer = core.render_output_period();
            let wanted = buffer.len();
            let put = unsafe { libc::write(dsp.0, buffer.as_ptr() as *const _, wanted) };
            if put < 0 {
                error!(
                    "oss write failed, stopping stream: {}",
                    std::io::Error::last_os_error()
                );
                core.state = StreamState::Stopped;
                continue;
            }
            if (put as usize) < wanted {
                warn!("oss short write: {put}/{wanted} bytes");
                core.xrun[0] = true;
            }
        }

        core.tick_stream_time();
        drop(core);

        if flow == crate::CallbackResult::Stop {
            let _ = halt(&inner, &shared, StopKind::Drain);
        }
    }
}
