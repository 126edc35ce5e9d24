//! Plays a sine tone on the default output device for a couple of seconds.

use clap::Parser;
use resound::{
    BackendId, CallbackResult, Host, SampleFormat, StreamOptions, StreamParams, StreamSpec,
};

#[derive(Parser, Debug)]
#[command(version, about = "resound beep demo", long_about = None)]
struct Opt {
    /// Backend to use, by name (see the enumerate demo).
    #[arg(short, long)]
    backend: Option<String>,

    /// Tone frequency in Hz.
    #[arg(short, long, default_value_t = 440.0)]
    frequency: f32,
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let mut host = match opt.backend.as_deref() {
        Some(name) => {
            let id = BackendId::from_name(name)
                .ok_or_else(|| anyhow::anyhow!("unknown backend {name:?}"))?;
            Host::new(id)?
        }
        None => Host::with_default_backend()?,
    };
    println!("backend: {}", host.backend());

    const RATE: u32 = 48_000;
    let spec = StreamSpec {
        output: Some(StreamParams {
            device: host.default_output_device(),
            channels: 2,
            first_channel: 0,
        }),
        input: None,
        format: SampleFormat::F32,
        sample_rate: RATE,
        buffer_frames: 512,
        options: StreamOptions {
            stream_name: Some("beep".to_owned()),
            ..StreamOptions::default()
        },
    };

    let step = opt.frequency / RATE as f32;
    let mut phase = 0.0f32;
    let frames = host.open_stream(&spec, move |data| {
        let output = data.output.as_mut().expect("output stream");
        if data.status.underflow {
            eprintln!("underflow at {:?}", data.output_time);
        }
        let samples = output.as_slice_mut::<f32>().expect("f32 stream");
        for frame in samples.chunks_mut(2) {
            let value = (phase * std::f32::consts::TAU).sin() * 0.2;
            phase = (phase + step).fract();
            for sample in frame {
                *sample = value;
            }
        }
        CallbackResult::Continue
    })?;
    println!("period: {frames} frames @ {} Hz", host.stream_sample_rate());

    host.start_stream()?;
    std::thread::sleep(std::time::Duration::from_secs(2));
    host.stop_stream()?;
    host.close_stream()?;
    Ok(())
}
