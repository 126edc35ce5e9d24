//! # Real-time audio I/O with a uniform pull-style API
//!
//! `resound` exposes one API over the native audio subsystems of the major
//! platforms: ALSA, PulseAudio, JACK and OSS on Linux and the BSDs, CoreAudio
//! on Apple targets, DirectSound and ASIO on Windows, and AAudio on Android.
//!
//! An application:
//!
//! 1. instantiates a [`Host`] for a chosen or auto-selected backend,
//! 2. enumerates devices via [`Host::device_info`],
//! 3. opens a stream (output, input, or full duplex on one device) with a
//!    sample format, rate and period size,
//! 4. receives a pull callback once per period with the input period just
//!    read and the output period about to be written, and
//! 5. starts, stops (draining), aborts (discarding) and finally closes the
//!    stream.
//!
//! Sample rate, format and channel counts are fixed from open to close. The
//! engine adapts between the caller's buffer layout and whatever the device
//! negotiated: numeric format conversion, channel mapping, interleaving and
//! byte order are handled internally from tables precomputed at open.
//!
//! ```no_run
//! use resound::{
//!     CallbackResult, Host, SampleFormat, StreamOptions, StreamParams, StreamSpec,
//! };
//!
//! fn main() -> Result<(), resound::Error> {
//!     let mut host = Host::with_default_backend()?;
//!     let spec = StreamSpec {
//!         output: Some(StreamParams {
//!             device: host.default_output_device(),
//!             channels: 2,
//!             first_channel: 0,
//!         }),
//!         input: None,
//!         format: SampleFormat::F32,
//!         sample_rate: 48_000,
//!         buffer_frames: 512,
//!         options: StreamOptions::default(),
//!     };
//!     let mut phase = 0.0f32;
//!     host.open_stream(&spec, move |data| {
//!         if let Some(output) = data.output.as_mut() {
//!             let samples = output.as_slice_mut::<f32>().expect("f32 stream");
//!             for frame in samples.chunks_mut(2) {
//!                 let value = (phase * std::f32::consts::TAU).sin() * 0.2;
//!                 phase = (phase + 440.0 / 48_000.0).fract();
//!                 for sample in frame {
//!                     *sample = value;
//!                 }
//!             }
//!         }
//!         CallbackResult::Continue
//!     })?;
//!     host.start_stream()?;
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//!     host.stop_stream()?;
//!     host.close_stream()
//! }
//! ```
//!
//! The callback runs on the device thread. Buffers handed to it are only
//! valid for the duration of the call; keep the work inside bounded by the
//! period length or the device will underrun.

#![cfg_attr(docsrs, feature(doc_cfg))]

mod convert;
mod driver;
mod engine;
mod error;
mod format;
mod host;
mod platform;
mod stream;

pub use error::{Error, Result};
pub use format::{byte_swap_buffer, host_is_little_endian, SampleFormat, SizedSample};
pub use platform::{available_backends, default_backend, BackendId, Host};

pub use dasp_sample::{FromSample, Sample, I24};

use std::time::Duration;

/// The sample rates a device probe reports from, when the backend cannot
/// enumerate rates directly.
pub const GENERIC_SAMPLE_RATES: [u32; 16] = [
    4_000, 5_512, 8_000, 9_600, 11_025, 16_000, 22_050, 32_000, 44_100, 48_000, 64_000, 88_200,
    96_000, 128_000, 176_400, 192_000,
];

/// Addressing of one stream direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamParams {
    /// Backend device index, in `0..device_count()`.
    pub device: usize,
    /// Channels the caller wants to read or write.
    pub channels: u32,
    /// First device channel to map the stream onto. A stereo stream with
    /// `first_channel == 2` addresses device channels 2 and 3.
    pub first_channel: u32,
}

/// Behaviour toggles for [`Host::open_stream`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamFlags {
    /// Ask the backend for the smallest period count it supports.
    pub minimize_latency: bool,
    /// Request exclusive access to the device where the backend offers it.
    pub hog_device: bool,
    /// Present the user buffer planar (each channel contiguous) instead of
    /// interleaved.
    pub noninterleaved: bool,
}

/// How a driver should derive the per-period timestamps handed to the
/// callback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimestampMode {
    /// Process clock at the first period, advanced by one period per tick.
    #[default]
    Soft,
    /// The device's trigger timestamp sampled once at start, then advanced
    /// period by period.
    Triggered,
    /// Per-period hardware timestamps where the device clock is monotonic;
    /// falls back to [`TimestampMode::Triggered`] otherwise.
    Hardware,
}

/// Everything optional about a stream. `Default` gives sensible values for
/// all fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamOptions {
    pub flags: StreamFlags,
    /// Device periods to keep in flight; `0` lets the backend choose. Values
    /// below 2 are raised to 2.
    pub number_of_buffers: u32,
    /// Name for the device thread and, where the backend supports it, the
    /// client registered with the sound server.
    pub stream_name: Option<String>,
    pub timestamp_mode: TimestampMode,
}

impl StreamOptions {
    pub(crate) fn name(&self) -> &str {
        self.stream_name.as_deref().unwrap_or("resound")
    }
}

/// The fixed parameters of a stream to open. The callback is passed
/// separately to [`Host::open_stream`].
#[derive(Clone, Debug)]
pub struct StreamSpec {
    /// Output direction, if any. At least one direction must be present.
    pub output: Option<StreamParams>,
    /// Input direction, if any.
    pub input: Option<StreamParams>,
    /// Sample format of the user buffers, both directions.
    pub format: SampleFormat,
    /// Requested rate in Hz; the stream runs at whatever the device accepts.
    pub sample_rate: u32,
    /// Requested frames per period; `0` asks the backend for its minimum.
    /// The accepted value is returned by [`Host::open_stream`].
    pub buffer_frames: u32,
    pub options: StreamOptions,
}

/// Description of one audio device as reported by a backend.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceInfo {
    /// True only when every other field was successfully filled in.
    pub probed: bool,
    pub name: String,
    pub output_channels: u32,
    pub input_channels: u32,
    /// `min(output_channels, input_channels)` when both are non-zero.
    pub duplex_channels: u32,
    pub is_default_output: bool,
    pub is_default_input: bool,
    /// Supported rates, drawn from [`GENERIC_SAMPLE_RATES`].
    pub sample_rates: Vec<u32>,
    /// Sample formats the device accepts natively.
    pub native_formats: Vec<SampleFormat>,
}

impl DeviceInfo {
    pub(crate) fn finish(mut self) -> DeviceInfo {
        if self.output_channels > 0 && self.input_channels > 0 {
            self.duplex_channels = self.output_channels.min(self.input_channels);
        }
        self.probed = !self.sample_rates.is_empty() && !self.native_formats.is_empty();
        self
    }
}

/// Events observed by the driver since the previous period, delivered with
/// the next callback. An empty set means the period was clean.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStatus {
    /// The output device consumed the ring faster than it was filled.
    pub underflow: bool,
    /// The input device produced data faster than it was drained.
    pub overflow: bool,
}

impl StreamStatus {
    #[inline]
    #[must_use]
    pub fn is_ok(&self) -> bool {
        !self.underflow && !self.overflow
    }
}

/// What the stream should do after the current period.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CallbackResult {
    /// Keep running.
    #[default]
    Continue,
    /// Play out whatever is buffered, then stop.
    Stop,
    /// Stop immediately, discarding buffered audio.
    Abort,
}

/// A monotonic timestamp attached to the first sample of a period.
///
/// Instants from the same stream are comparable; the epoch is unspecified.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamInstant {
    nanos: i64,
}

impl StreamInstant {
    pub(crate) fn from_nanos(nanos: i64) -> StreamInstant {
        StreamInstant { nanos }
    }

    #[inline]
    #[must_use]
    pub fn as_nanos(&self) -> i64 {
        self.nanos
    }

    /// The amount of time elapsed from `earlier` to `self`, or `None` if
    /// `earlier` is the later of the two.
    pub fn duration_since(&self, earlier: &StreamInstant) -> Option<Duration> {
        if self.nanos < earlier.nanos {
            return None;
        }
        Some(Duration::from_nanos((self.nanos - earlier.nanos) as u64))
    }

    pub(crate) fn add(&self, duration: Duration) -> StreamInstant {
        StreamInstant {
            nanos: self.nanos.saturating_add(duration.as_nanos() as i64),
        }
    }

    pub(crate) fn sub(&self, duration: Duration) -> StreamInstant {
        StreamInstant {
            nanos: self.nanos.saturating_sub(duration.as_nanos() as i64),
        }
    }
}

/// A buffer of samples whose format is only known at run time.
///
/// Use [`Data::as_slice`] / [`Data::as_slice_mut`] with the stream's user
/// format to view it as typed samples, or [`Data::bytes`] for raw access.
/// 24-bit streams pack samples into three bytes and are only accessible as
/// bytes.
#[derive(Debug)]
pub struct Data {
    data: *mut (),
    /// Length in samples.
    len: usize,
    sample_format: SampleFormat,
}

// The pointer refers to an engine-owned buffer that outlives every `Data`
// handed out; access is confined to the device thread for the duration of
// one callback.
unsafe impl Send for Data {}

impl Data {
    /// # Safety
    ///
    /// `data` must point to `len * sample_format.sample_size()` bytes, valid
    /// for reads and writes for the lifetime of the `Data`.
    pub(crate) unsafe fn from_parts(data: *mut (), len: usize, sample_format: SampleFormat) -> Data {
        Data {
            data,
            len,
            sample_format,
        }
    }

    /// Length in samples (not bytes, not frames).
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub fn sample_format(&self) -> SampleFormat {
        self.sample_format
    }

    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        let len = self.len * self.sample_format.sample_size();
        unsafe { std::slice::from_raw_parts(self.data as *const u8, len) }
    }

    #[inline]
    #[must_use]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len * self.sample_format.sample_size();
        unsafe { std::slice::from_raw_parts_mut(self.data as *mut u8, len) }
    }

    /// Typed view of the buffer, or `None` when `T` does not match the
    /// stream's sample format (including the packed 24-bit format, whose
    /// in-memory type is wider than its stored width).
    pub fn as_slice<T: SizedSample>(&self) -> Option<&[T]> {
        if T::FORMAT == self.sample_format
            && std::mem::size_of::<T>() == self.sample_format.sample_size()
        {
            Some(unsafe { std::slice::from_raw_parts(self.data as *const T, self.len) })
        } else {
            None
        }
    }

    /// Mutable typed view; see [`Data::as_slice`].
    pub fn as_slice_mut<T: SizedSample>(&mut self) -> Option<&mut [T]> {
        if T::FORMAT == self.sample_format
            && std::mem::size_of::<T>() == self.sample_format.sample_size()
        {
            Some(unsafe { std::slice::from_raw_parts_mut(self.data as *mut T, self.len) })
        } else {
            None
        }
    }
}

/// Everything handed to the user callback for one period.
#[derive(Debug)]
pub struct StreamData<'a> {
    /// One period of captured audio; `None` unless the stream has an input
    /// direction.
    pub input: Option<&'a Data>,
    /// One period to fill with audio; `None` unless the stream has an output
    /// direction.
    pub output: Option<&'a mut Data>,
    /// Timestamp of the first captured sample.
    pub input_time: StreamInstant,
    /// Timestamp at which the first written sample will play.
    pub output_time: StreamInstant,
    /// Frames in this period; constant for the life of the stream.
    pub frames: usize,
    /// Xruns observed since the previous period.
    pub status: StreamStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_info_finish_derives_duplex_and_probed() {
        let info = DeviceInfo {
            name: "default".into(),
            output_channels: 8,
            input_channels: 2,
            sample_rates: vec![44_100, 48_000],
            native_formats: vec![SampleFormat::I16],
            ..DeviceInfo::default()
        }
        .finish();
        assert!(info.probed);
        assert_eq!(info.duplex_channels, 2);

        let unprobed = DeviceInfo {
            name: "broken".into(),
            output_channels: 2,
            ..DeviceInfo::default()
        }
        .finish();
        assert!(!unprobed.probed);
    }

    #[test]
    fn stream_instant_arithmetic() {
        let base = StreamInstant::from_nanos(1_000_000);
        let later = base.add(Duration::from_micros(500));
        assert_eq!(later.as_nanos(), 1_500_000);
        assert_eq!(
            later.duration_since(&base),
            Some(Duration::from_micros(500))
        );
        assert_eq!(base.duration_since(&later), None);
        assert_eq!(later.sub(Duration::from_micros(500)), base);
    }

    #[test]
    fn data_rejects_mismatched_sample_type() {
        let mut storage = [0f32; 8];
        let mut data = unsafe {
            Data::from_parts(storage.as_mut_ptr() as *mut (), 8, SampleFormat::F32)
        };
        assert!(data.as_slice::<f32>().is_some());
        assert!(data.as_slice::<i16>().is_none());
        assert_eq!(data.bytes().len(), 32);
        assert_eq!(data.as_slice_mut::<f32>().unwrap().len(), 8);
    }

    #[test]
    fn packed_24_bit_data_is_bytes_only() {
        let mut storage = [0u8; 12];
        let data = unsafe {
            Data::from_parts(storage.as_mut_ptr() as *mut (), 4, SampleFormat::I24)
        };
        assert!(data.as_slice::<I24>().is_none());
        assert_eq!(data.bytes().len(), 12);
    }

    #[test]
    fn status_default_is_ok() {
        assert!(StreamStatus::default().is_ok());
        assert!(!StreamStatus {
            underflow: true,
            ..Default::default()
        }
        .is_ok());
    }
}
