//! User/device buffer adaptation.
//!
//! A [`ConvertInfo`] is a precomputed table of per-channel offsets and frame
//! strides built once at stream open. Applying it walks both buffers in a
//! single pass, performing channel selection, (de)interleaving and numeric
//! sample conversion in one loop. The per-period cost is
//! `O(frames * channels)` with no branching inside the loop.

use dasp_sample::{FromSample, I24};

use crate::format::SampleFormat;
use crate::stream::Direction;

/// Precomputed buffer-conversion table for one stream direction.
///
/// Offsets and jumps are expressed in samples, not bytes. Immutable from the
/// moment the stream reaches `stopped` until close.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ConvertInfo {
    pub channels: usize,
    pub in_jump: usize,
    pub out_jump: usize,
    pub in_format: SampleFormat,
    pub out_format: SampleFormat,
    pub in_offset: Vec<usize>,
    pub out_offset: Vec<usize>,
}

/// Layout of one side of a conversion.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SideLayout {
    pub channels: usize,
    pub format: SampleFormat,
    pub interleaved: bool,
}

impl ConvertInfo {
    /// Builds the table for `direction`.
    ///
    /// For input the source is the device side and the destination the user
    /// side; for output the roles swap. `first_channel` shifts the
    /// device-side offsets so a stream can address a channel group in the
    /// middle of a wide device.
    pub(crate) fn build(
        direction: Direction,
        user: SideLayout,
        device: SideLayout,
        buffer_frames: usize,
        first_channel: usize,
    ) -> ConvertInfo {
        let (src, dst) = match direction {
            Direction::Input => (device, user),
            Direction::Output => (user, device),
        };
        let channels = src.channels.min(dst.channels);

        let mut info = ConvertInfo {
            channels,
            in_jump: src.channels,
            out_jump: dst.channels,
            in_format: src.format,
            out_format: dst.format,
            in_offset: Vec::with_capacity(channels),
            out_offset: Vec::with_capacity(channels),
        };

        // Planar sides address each channel as a contiguous block and advance
        // one sample per frame; interleaved sides advance a whole frame.
        for ch in 0..channels {
            if src.interleaved {
                info.in_offset.push(ch);
            } else {
                info.in_offset.push(ch * buffer_frames);
            }
            if dst.interleaved {
                info.out_offset.push(ch);
            } else {
                info.out_offset.push(ch * buffer_frames);
            }
        }
        if !src.interleaved {
            info.in_jump = 1;
        }
        if !dst.interleaved {
            info.out_jump = 1;
        }

        if first_channel > 0 {
            let (device_offsets, device_interleaved) = match direction {
                Direction::Input => (&mut info.in_offset, device.interleaved),
                Direction::Output => (&mut info.out_offset, device.interleaved),
            };
            let shift = if device_interleaved {
                first_channel
            } else {
                first_channel * buffer_frames
            };
            for offset in device_offsets.iter_mut() {
                *offset += shift;
            }
        }

        info
    }
}

/// Applies `info` for `frames` frames, copying from `inp` into `out`.
///
/// When `zero_first` is set the whole destination region is silenced before
/// copying; required for the duplex case where the output device carries
/// fewer channels than the input device and the remainder must stay silent.
///
/// Both slices must cover at least the region the table addresses; the
/// engine sizes them from the same descriptors the table was built from.
pub(crate) fn convert_buffer(
    out: &mut [u8],
    inp: &[u8],
    info: &ConvertInfo,
    frames: usize,
    zero_first: bool,
) {
    if zero_first {
        out.fill(0);
    }
    match info.in_format {
        SampleFormat::I8 => convert_from::<i8>(out, inp, info, frames),
        SampleFormat::I16 => convert_from::<i16>(out, inp, info, frames),
        SampleFormat::I24 => convert_from::<I24>(out, inp, info, frames),
        SampleFormat::I32 => convert_from::<i32>(out, inp, info, frames),
        SampleFormat::F32 => convert_from::<f32>(out, inp, info, frames),
        SampleFormat::F64 => convert_from::<f64>(out, inp, info, frames),
    }
}

fn convert_from<I>(out: &mut [u8], inp: &[u8], info: &ConvertInfo, frames: usize)
where
    I: RawSample,
    i8: FromSample<I>,
    i16: FromSample<I>,
    I24: FromSample<I>,
    i32: FromSample<I>,
    f32: FromSample<I>,
    f64: FromSample<I>,
{
    match info.out_format {
        SampleFormat::I8 => convert_typed::<I, i8>(out, inp, info, frames),
        SampleFormat::I16 => convert_typed::<I, i16>(out, inp, info, frames),
        SampleFormat::I24 => convert_typed::<I, I24>(out, inp, info, frames),
        SampleFormat::I32 => convert_typed::<I, i32>(out, inp, info, frames),
        SampleFormat::F32 => convert_typed::<I, f32>(out, inp, info, frames),
        SampleFormat::F64 => convert_typed::<I, f64>(out, inp, info, frames),
    }
}

fn convert_typed<I, O>(out: &mut [u8], inp: &[u8], info: &ConvertInfo, frames: usize)
where
    I: RawSample,
    O: RawSample + FromSample<I>,
{
    let mut in_base = 0usize;
    let mut out_base = 0usize;
    for _ in 0..frames {
        for (in_ch, out_ch) in info.in_offset.iter().zip(info.out_offset.iter()) {
            let i = (in_base + in_ch) * I::BYTES;
            let o = (out_base + out_ch) * O::BYTES;
            let sample = I::read_ne(&inp[i..i + I::BYTES]);
            O::from_sample_(sample).write_ne(&mut out[o..o + O::BYTES]);
        }
        in_base += info.in_jump;
        out_base += info.out_jump;
    }
}

/// Fixed-width native-endian access to samples inside a byte buffer.
pub(crate) trait RawSample: Copy {
    const BYTES: usize;
    fn read_ne(bytes: &[u8]) -> Self;
    fn write_ne(self, bytes: &mut [u8]);
}

macro_rules! impl_raw_sample {
    ($($ty:ty),*) => {
        $(
            impl RawSample for $ty {
                const BYTES: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn read_ne(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                    <$ty>::from_ne_bytes(raw)
                }

                #[inline]
                fn write_ne(self, bytes: &mut [u8]) {
                    bytes[..std::mem::size_of::<$ty>()].copy_from_slice(&self.to_ne_bytes());
                }
            }
        )*
    };
}

impl_raw_sample!(i8, i16, i32, f32, f64);

// 24-bit samples occupy three bytes on the wire, native byte order, sign
// extended on read.
impl RawSample for I24 {
    const BYTES: usize = 3;

    #[inline]
    fn read_ne(bytes: &[u8]) -> Self {
        let (b0, b1, b2) = if cfg!(target_endian = "little") {
            (bytes[0], bytes[1], bytes[2])
        } else {
            (bytes[2], bytes[1], bytes[0])
        };
        let value = (b0 as i32) | ((b1 as i32) << 8) | (((b2 as i8) as i32) << 16);
        I24::new_unchecked(value)
    }

    #[inline]
    fn write_ne(self, bytes: &mut [u8]) {
        let value = self.inner();
        let raw = [
            (value & 0xff) as u8,
            ((value >> 8) & 0xff) as u8,
            ((value >> 16) & 0xff) as u8,
        ];
        if cfg!(target_endian = "little") {
            bytes[..3].copy_from_slice(&raw);
        } else {
            bytes[0] = raw[2];
            bytes[1] = raw[1];
            bytes[2] = raw[0];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAMES: usize = 4;

    fn interleaved(channels: usize, format: SampleFormat) -> SideLayout {
        SideLayout {
            channels,
            format,
            interleaved: true,
        }
    }

    fn planar(channels: usize, format: SampleFormat) -> SideLayout {
        SideLayout {
            channels,
            format,
            interleaved: false,
        }
    }

    fn as_i16(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_ne_bytes([c[0], c[1]]))
            .collect()
    }

    fn from_i16(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_ne_bytes()).collect()
    }

    #[test]
    fn identity_copy_round_trips() {
        // Equal channel counts, equal formats, interleaved both ways: applying
        // the table and then its role-swapped inverse reproduces the input.
        let out_info = ConvertInfo::build(
            Direction::Output,
            interleaved(2, SampleFormat::I16),
            interleaved(2, SampleFormat::I16),
            FRAMES,
            0,
        );
        let in_info = ConvertInfo::build(
            Direction::Input,
            interleaved(2, SampleFormat::I16),
            interleaved(2, SampleFormat::I16),
            FRAMES,
            0,
        );
        let user = from_i16(&[10, -10, 20, -20, 30, -30, 40, -40]);
        let mut device = vec![0u8; user.len()];
        let mut back = vec![0u8; user.len()];
        convert_buffer(&mut device, &user, &out_info, FRAMES, false);
        convert_buffer(&mut back, &device, &in_info, FRAMES, false);
        assert_eq!(back, user);
    }

    #[test]
    fn output_deinterleaves_to_planar_device() {
        let info = ConvertInfo::build(
            Direction::Output,
            interleaved(2, SampleFormat::I16),
            planar(2, SampleFormat::I16),
            FRAMES,
            0,
        );
        assert_eq!(info.in_jump, 2);
        assert_eq!(info.out_jump, 1);
        assert_eq!(info.out_offset, vec![0, FRAMES]);

        let user = from_i16(&[1, -1, 2, -2, 3, -3, 4, -4]);
        let mut device = vec![0u8; user.len()];
        convert_buffer(&mut device, &user, &info, FRAMES, false);
        assert_eq!(as_i16(&device), vec![1, 2, 3, 4, -1, -2, -3, -4]);
    }

    #[test]
    fn planar_user_buffer_interleaves_for_device() {
        let info = ConvertInfo::build(
            Direction::Output,
            planar(2, SampleFormat::I16),
            interleaved(2, SampleFormat::I16),
            FRAMES,
            0,
        );
        assert_eq!(info.in_jump, 1);
        assert_eq!(info.in_offset, vec![0, FRAMES]);

        let user = from_i16(&[1, 2, 3, 4, -1, -2, -3, -4]);
        let mut device = vec![0u8; user.len()];
        convert_buffer(&mut device, &user, &info, FRAMES, false);
        assert_eq!(as_i16(&device), vec![1, -1, 2, -2, 3, -3, 4, -4]);
    }

    #[test]
    fn first_channel_shifts_device_offsets() {
        // Mono user stream addressed onto channel 2 of a 4-channel device.
        let info = ConvertInfo::build(
            Direction::Output,
            interleaved(1, SampleFormat::I16),
            interleaved(4, SampleFormat::I16),
            FRAMES,
            2,
        );
        assert_eq!(info.out_offset, vec![2]);

        let user = from_i16(&[7, 8, 9, 10]);
        let mut device = vec![0u8; FRAMES * 4 * 2];
        convert_buffer(&mut device, &user, &info, FRAMES, false);
        let frames = as_i16(&device);
        assert_eq!(frames[2], 7);
        assert_eq!(frames[6], 8);
        assert_eq!(frames[0], 0);
        assert_eq!(frames[3], 0);
    }

    #[test]
    fn first_channel_on_planar_device_shifts_by_blocks() {
        let info = ConvertInfo::build(
            Direction::Input,
            interleaved(1, SampleFormat::I16),
            planar(3, SampleFormat::I16),
            FRAMES,
            1,
        );
        // Channel block 1 starts one full period into the device buffer.
        assert_eq!(info.in_offset, vec![FRAMES]);
        assert_eq!(info.in_jump, 1);
    }

    #[test]
    fn input_drops_extra_device_channels() {
        // Stereo device, mono user capture: only channel 0 survives.
        let info = ConvertInfo::build(
            Direction::Input,
            interleaved(1, SampleFormat::I16),
            interleaved(2, SampleFormat::I16),
            FRAMES,
            0,
        );
        assert_eq!(info.channels, 1);

        let device = from_i16(&[1, -1, 2, -2, 3, -3, 4, -4]);
        let mut user = vec![0u8; FRAMES * 2];
        convert_buffer(&mut user, &device, &info, FRAMES, false);
        assert_eq!(as_i16(&user), vec![1, 2, 3, 4]);
    }

    #[test]
    fn f32_to_i16_quantizes_within_one_step() {
        let info = ConvertInfo::build(
            Direction::Output,
            interleaved(1, SampleFormat::F32),
            interleaved(1, SampleFormat::I16),
            FRAMES,
            0,
        );
        let samples = [0.0f32, 0.5, -0.5, 0.999_97];
        let user: Vec<u8> = samples.iter().flat_map(|s| s.to_ne_bytes()).collect();
        let mut device = vec![0u8; FRAMES * 2];
        convert_buffer(&mut device, &user, &info, FRAMES, false);
        for (sample, quantized) in samples.iter().zip(as_i16(&device)) {
            let expected = (sample * 32768.0).clamp(-32768.0, 32767.0);
            assert!(
                (quantized as f32 - expected).abs() <= 1.0,
                "{sample} quantized to {quantized}, expected near {expected}"
            );
        }
    }

    #[test]
    fn i24_round_trips_through_three_bytes() {
        let info = ConvertInfo::build(
            Direction::Output,
            interleaved(1, SampleFormat::I24),
            interleaved(1, SampleFormat::I24),
            FRAMES,
            0,
        );
        let values = [-8_388_608i32, -1, 0, 8_388_607];
        let mut user = vec![0u8; FRAMES * 3];
        for (i, v) in values.iter().enumerate() {
            I24::new(*v).unwrap().write_ne(&mut user[i * 3..i * 3 + 3]);
        }
        let mut device = vec![0u8; FRAMES * 3];
        convert_buffer(&mut device, &user, &info, FRAMES, false);
        for (i, v) in values.iter().enumerate() {
            let got = I24::read_ne(&device[i * 3..i * 3 + 3]);
            assert_eq!(got.inner(), *v);
        }
    }

    #[test]
    fn zero_first_silences_uncovered_channels() {
        let info = ConvertInfo::build(
            Direction::Output,
            interleaved(1, SampleFormat::I16),
            interleaved(2, SampleFormat::I16),
            FRAMES,
            0,
        );
        let user = from_i16(&[5, 6, 7, 8]);
        let mut device = from_i16(&[9; FRAMES * 2]);
        convert_buffer(&mut device, &user, &info, FRAMES, true);
        let frames = as_i16(&device);
        assert_eq!(frames, vec![5, 0, 6, 0, 7, 0, 8, 0]);
    }
}
