use std::io::{Cursor, Seek, Write};

use base64::{engine::general_purpose, Engine as _};

use crate::error::{Result, SynthesisError};

fn spec(sample_rate: u32, channels: u16) -> hound::WavSpec {
    hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

fn sample_count(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| SynthesisError::Wav(format!("{len} samples do not fit in a WAV file")))
}

/// Write 16-bit PCM as a RIFF/WAV stream.
pub fn write_wav<W: Write + Seek>(samples: &[i16], sample_rate: u32, channels: u16, writer: W) -> Result<()> {
    let len = sample_count(samples.len())?;
    let mut wav = hound::WavWriter::new(writer, spec(sample_rate, channels))?;
    let mut pcm = wav.get_i16_writer(len);
    for &s in samples {
        pcm.write_sample(s);
    }
    pcm.flush()?;
    wav.finalize()?;
    Ok(())
}

/// Complete WAV file in memory.
pub fn wav_bytes(samples: &[i16], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    write_wav(samples, sample_rate, channels, &mut cursor)?;
    Ok(cursor.into_inner())
}

/// WAV file encoded as standard Base64, for JSON responses.
pub fn encode_wav_base64(samples: &[i16], sample_rate: u32, channels: u16) -> Result<String> {
    Ok(general_purpose::STANDARD.encode(wav_bytes(samples, sample_rate, channels)?))
}

/// Raw little-endian PCM bytes.
pub fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
