//! Platform-specific backend selection and the dispatching [`Host`].
//!
//! A [`Host`] owns exactly one backend driver and forwards the public stream
//! API to it. Backends are selected at run time from whatever the build
//! compiled in; [`available_backends`] lists them in default-preference
//! order.

use log::debug;

use crate::driver::Driver;
use crate::engine;
use crate::error::{Error, Result};
use crate::{CallbackResult, DeviceInfo, StreamData, StreamInstant, StreamSpec};

/// Identifier of one compiled-in backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum BackendId {
    #[cfg(all(
        any(
            target_os = "linux",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "netbsd"
        ),
        feature = "alsa"
    ))]
    Alsa,
    #[cfg(all(
        any(
            target_os = "linux",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "netbsd"
        ),
        feature = "pulseaudio"
    ))]
    PulseAudio,
    #[cfg(all(
        any(
            target_os = "linux",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "macos"
        ),
        feature = "jack"
    ))]
    Jack,
    #[cfg(all(
        any(
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "netbsd"
        ),
        feature = "oss"
    ))]
    Oss,
    #[cfg(target_vendor = "apple")]
    CoreAudio,
    #[cfg(target_os = "windows")]
    DirectSound,
    #[cfg(all(target_os = "windows", feature = "asio"))]
    Asio,
    #[cfg(target_os = "android")]
    AAudio,
    /// Always present; enumerates no devices. The fallback on platforms with
    /// no native backend compiled in.
    Null,
}

impl BackendId {
    /// Stable human-readable name, also accepted by [`BackendId::from_name`].
    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(all(
                any(
                    target_os = "linux",
                    target_os = "dragonfly",
                    target_os = "freebsd",
                    target_os = "netbsd"
                ),
                feature = "alsa"
            ))]
            BackendId::Alsa => "ALSA",
            #[cfg(all(
                any(
                    target_os = "linux",
                    target_os = "dragonfly",
                    target_os = "freebsd",
                    target_os = "netbsd"
                ),
                feature = "pulseaudio"
            ))]
            BackendId::PulseAudio => "PulseAudio",
            #[cfg(all(
                any(
                    target_os = "linux",
                    target_os = "dragonfly",
                    target_os = "freebsd",
                    target_os = "netbsd",
                    target_os = "macos"
                ),
                feature = "jack"
            ))]
            BackendId::Jack => "JACK",
            #[cfg(all(
                any(
                    target_os = "freebsd",
                    target_os = "dragonfly",
                    target_os = "netbsd"
                ),
                feature = "oss"
            ))]
            BackendId::Oss => "OSS",
            #[cfg(target_vendor = "apple")]
            BackendId::CoreAudio => "CoreAudio",
            #[cfg(target_os = "windows")]
            BackendId::DirectSound => "DirectSound",
            #[cfg(all(target_os = "windows", feature = "asio"))]
            BackendId::Asio => "ASIO",
            #[cfg(target_os = "android")]
            BackendId::AAudio => "AAudio",
            BackendId::Null => "Null",
        }
    }

    /// Looks a backend up by its [`BackendId::name`], case-insensitively.
    pub fn from_name(name: &str) -> Option<BackendId> {
        ALL_BACKENDS
            .iter()
            .copied()
            .find(|id| id.name().eq_ignore_ascii_case(name))
    }
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Backends compiled into this build, in default-preference order.
pub const ALL_BACKENDS: &[BackendId] = &[
    #[cfg(all(
        any(
            target_os = "linux",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "netbsd"
        ),
        feature = "alsa"
    ))]
    BackendId::Alsa,
    #[cfg(all(
        any(
            target_os = "linux",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "netbsd"
        ),
        feature = "pulseaudio"
    ))]
    BackendId::PulseAudio,
    #[cfg(all(
        any(
            target_os = "linux",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "macos"
        ),
        feature = "jack"
    ))]
    BackendId::Jack,
    #[cfg(all(
        any(
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "netbsd"
        ),
        feature = "oss"
    ))]
    BackendId::Oss,
    #[cfg(target_vendor = "apple")]
    BackendId::CoreAudio,
    #[cfg(target_os = "windows")]
    BackendId::DirectSound,
    #[cfg(all(target_os = "windows", feature = "asio"))]
    BackendId::Asio,
    #[cfg(target_os = "android")]
    BackendId::AAudio,
    BackendId::Null,
];

/// All backends compiled into this build, in default-preference order.
pub fn available_backends() -> Vec<BackendId> {
    ALL_BACKENDS.to_vec()
}

/// The backend [`Host::with_default_backend`] picks: the first native one
/// compiled in, falling back to [`BackendId::Null`].
pub fn default_backend() -> BackendId {
    ALL_BACKENDS
        .iter()
        .copied()
        .find(|id| *id != BackendId::Null)
        .unwrap_or(BackendId::Null)
}

fn instantiate(backend: BackendId) -> Result<Box<dyn Driver>> {
    match backend {
        #[cfg(all(
            any(
                target_os = "linux",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "netbsd"
            ),
            feature = "alsa"
        ))]
        BackendId::Alsa => Ok(Box::new(crate::host::alsa::AlsaDriver::new()?)),
        #[cfg(all(
            any(
                target_os = "linux",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "netbsd"
            ),
            feature = "pulseaudio"
        ))]
        BackendId::PulseAudio => Ok(Box::new(crate::host::pulseaudio::PulseDriver::new()?)),
        #[cfg(all(
            any(
                target_os = "linux",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "macos"
            ),
            feature = "jack"
        ))]
        BackendId::Jack => Ok(Box::new(crate::host::jack::JackDriver::new()?)),
        #[cfg(all(
            any(
                target_os = "freebsd",
                target_os = "dragonfly",
                target_os = "netbsd"
            ),
            feature = "oss"
        ))]
        BackendId::Oss => Ok(Box::new(crate::host::oss::OssDriver::new()?)),
        #[cfg(target_vendor = "apple")]
        BackendId::CoreAudio => Ok(Box::new(crate::host::coreaudio::CoreAudioDriver::new()?)),
        #[cfg(target_os = "windows")]
        BackendId::DirectSound => Ok(Box::new(
            crate::host::directsound::DirectSoundDriver::new()?,
        )),
        #[cfg(all(target_os = "windows", feature = "asio"))]
        BackendId::Asio => Ok(Box::new(crate::host::asio::AsioDriver::new()?)),
        #[cfg(target_os = "android")]
        BackendId::AAudio => Ok(Box::new(crate::host::aaudio::AAudioDriver::new()?)),
        BackendId::Null => Ok(Box::new(crate::host::null::NullDriver::new())),
    }
}

/// A handle to one backend and at most one stream on it.
///
/// All stream operations target the stream this host opened; the engine
/// enforces the state machine documented on each method.
pub struct Host {
    driver: Box<dyn Driver>,
}

impl Host {
    /// Instantiates the given backend.
    pub fn new(backend: BackendId) -> Result<Host> {
        let driver = instantiate(backend)?;
        debug!("instantiated backend {}", backend);
        Ok(Host { driver })
    }

    /// Instantiates the platform's preferred backend (see
    /// [`default_backend`]).
    pub fn with_default_backend() -> Result<Host> {
        Host::new(default_backend())
    }

    /// Instantiates a backend by its [`BackendId::name`], e.g. `"ALSA"`.
    /// Names that match no compiled-in backend yield [`Error::NoDriver`].
    pub fn from_name(name: &str) -> Result<Host> {
        match BackendId::from_name(name) {
            Some(id) => Host::new(id),
            None => Err(Error::NoDriver),
        }
    }

    /// The backend this host talks to.
    pub fn backend(&self) -> BackendId {
        self.driver.backend()
    }

    pub fn device_count(&mut self) -> Result<usize> {
        self.driver.device_count()
    }

    pub fn device_info(&mut self, device: usize) -> Result<DeviceInfo> {
        self.driver.device_info(device)
    }

    pub fn default_output_device(&mut self) -> usize {
        self.driver.default_output_device()
    }

    pub fn default_input_device(&mut self) -> usize {
        self.driver.default_input_device()
    }

    /// Opens a stream per `spec` and installs `callback`, leaving the stream
    /// `stopped`. Returns the period size the device actually accepted,
    /// which is what the callback will observe in
    /// [`StreamData::frames`] — always use this over the requested value.
    pub fn open_stream<F>(&mut self, spec: &StreamSpec, callback: F) -> Result<u32>
    where
        F: FnMut(&mut StreamData<'_>) -> CallbackResult + Send + 'static,
    {
        engine::open_stream(self.driver.as_mut(), spec, Box::new(callback))
    }

    /// Starts the open stream; the first callback follows within one period.
    pub fn start_stream(&mut self) -> Result<()> {
        engine::start_stream(self.driver.as_mut())
    }

    /// Stops the stream after playing out buffered audio (drain).
    pub fn stop_stream(&mut self) -> Result<()> {
        engine::stop_stream(self.driver.as_mut())
    }

    /// Stops the stream immediately, discarding buffered audio.
    pub fn abort_stream(&mut self) -> Result<()> {
        engine::abort_stream(self.driver.as_mut())
    }

    /// Stops if needed, releases device handles and frees stream buffers.
    pub fn close_stream(&mut self) -> Result<()> {
        engine::close_stream(self.driver.as_mut())
    }

    pub fn is_stream_open(&self) -> bool {
        engine::is_stream_open(self.driver.as_ref())
    }

    pub fn is_stream_running(&self) -> bool {
        engine::is_stream_running(self.driver.as_ref())
    }

    /// The stream clock: anchored at the last start, advanced one period per
    /// completed callback. The zero instant while no stream is open.
    pub fn stream_time(&self) -> StreamInstant {
        engine::stream_time(self.driver.as_ref())
    }

    /// Summed device latency of the active directions, in frames; 0 when
    /// unknown.
    pub fn stream_latency(&self) -> u64 {
        engine::stream_latency(self.driver.as_ref())
    }

    /// The rate the device actually runs at; 0 while no stream is open.
    pub fn stream_sample_rate(&self) -> u32 {
        engine::stream_sample_rate(self.driver.as_ref())
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if self.is_stream_open() {
            let _ = engine::close_stream(self.driver.as_mut());
        }
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("backend", &self.backend())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_backend_is_always_listed_last() {
        let backends = available_backends();
        assert_eq!(backends.last(), Some(&BackendId::Null));
    }

    #[test]
    fn backend_names_round_trip() {
        for id in available_backends() {
            assert_eq!(BackendId::from_name(id.name()), Some(id));
        }
        assert_eq!(BackendId::from_name("null"), Some(BackendId::Null));
        assert_eq!(BackendId::from_name("does-not-exist"), None);
    }

    #[test]
    fn unknown_backend_name_is_no_driver() {
        assert!(matches!(
            Host::from_name("does-not-exist"),
            Err(crate::Error::NoDriver)
        ));
        assert!(Host::from_name("Null").is_ok());
    }

    #[test]
    fn null_host_has_no_devices() {
        let mut host = Host::new(BackendId::Null).unwrap();
        assert_eq!(host.backend(), BackendId::Null);
        assert_eq!(host.device_count().unwrap(), 0);
        assert!(!host.is_stream_open());
        assert_eq!(host.stream_sample_rate(), 0);
    }
}
