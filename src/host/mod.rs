#[cfg(all(
    any(
        target_os = "linux",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "netbsd"
    ),
    feature = "alsa"
))]
pub(crate) mod alsa;
#[cfg(all(target_os = "windows", feature = "asio"))]
pub(crate) mod asio;
#[cfg(target_vendor = "apple")]
pub(crate) mod coreaudio;
#[cfg(target_os = "windows")]
pub(crate) mod directsound;
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
pub(crate) mod jack;
pub(crate) mod null;
#[cfg(all(
    any(
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "netbsd"
    ),
    feature = "oss"
))]
pub(crate) mod oss;
#[cfg(all(
    any(
        target_os = "linux",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "netbsd"
    ),
    feature = "pulseaudio"
))]
pub(crate) mod pulseaudio;
#[cfg(target_os = "android")]
pub(crate) mod aaudio;
