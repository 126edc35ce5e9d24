//! Duplex loopback: opens input and output on one device and copies the
//! captured period straight into the playback period.
//!
//! Mind the feedback when running this near a live microphone.

use resound::{CallbackResult, Host, SampleFormat, StreamOptions, StreamParams, StreamSpec};

fn main() -> anyhow::Result<()> {
    let mut host = Host::with_default_backend()?;
    println!("backend: {}", host.backend());

    let device = host.default_output_device();
    let spec = StreamSpec {
        output: Some(StreamParams {
            device,
            channels: 1,
            first_channel: 0,
        }),
        input: Some(StreamParams {
            device,
            channels: 1,
            first_channel: 0,
        }),
        format: SampleFormat::F32,
        sample_rate: 44_100,
        buffer_frames: 256,
        options: StreamOptions {
            stream_name: Some("loopback".to_owned()),
            ..StreamOptions::default()
        },
    };

    let frames = host.open_stream(&spec, |data| {
        let input = data.input.as_ref().expect("input stream").bytes().to_vec();
        let output = data.output.as_mut().expect("output stream");
        output.bytes_mut().copy_from_slice(&input);
        if !data.status.is_ok() {
            eprintln!("xrun: {:?}", data.status);
        }
        CallbackResult::Continue
    })?;
    println!(
        "looping {frames}-frame periods, about {} frames of device latency",
        host.stream_latency(),
    );

    host.start_stream()?;
    std::thread::sleep(std::time::Duration::from_secs(5));
    host.abort_stream()?;
    host.close_stream()?;
    Ok(())
}
