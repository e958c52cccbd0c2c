use anyhow::{anyhow, Result};
use std::time::Duration;

/// Parsed RIFF/WAVE layout of an in-memory clip.
#[derive(Debug, Clone, PartialEq)]
pub struct WavInfo {
    pub fmt_content: Vec<u8>,
    pub data_offset: usize,
    pub data_size: usize,
}

impl WavInfo {
    fn channels(&self) -> u16 {
        u16::from_le_bytes([self.fmt_content[2], self.fmt_content[3]])
    }

    fn sample_rate(&self) -> u32 {
        u32::from_le_bytes([
            self.fmt_content[4],
            self.fmt_content[5],
            self.fmt_content[6],
            self.fmt_content[7],
        ])
    }

    fn byte_rate(&self) -> u32 {
        u32::from_le_bytes([
            self.fmt_content[8],
            self.fmt_content[9],
            self.fmt_content[10],
            self.fmt_content[11],
        ])
    }

    fn block_align(&self) -> u16 {
        u16::from_le_bytes([self.fmt_content[12], self.fmt_content[13]])
    }

    pub fn duration(&self) -> Option<Duration> {
        let rate = self.byte_rate();
        if rate == 0 {
            return None;
        }
        Some(bytes_to_duration(self.data_size, rate as u64))
    }

    /// Bytes of PCM silence lasting `ms`, aligned to whole frames.
    pub fn silence_bytes(&self, ms: u32) -> usize {
        let align = self.block_align().max(1) as u64;
        let bytes = self.byte_rate() as u64 * ms as u64 / 1000;
        (bytes / align * align) as usize
    }
}

fn bytes_to_duration(bytes: usize, byte_rate: u64) -> Duration {
    Duration::from_nanos((bytes as u128 * 1_000_000_000 / byte_rate as u128) as u64)
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| anyhow!("Unexpected end of WAV data at byte {}", at))
}

pub fn scan_wav(bytes: &[u8]) -> Result<WavInfo> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" {
        return Err(anyhow!("Not a RIFF file"));
    }
    if &bytes[8..12] != b"WAVE" {
        return Err(anyhow!("Not a WAVE file"));
    }

    let mut fmt_content: Option<Vec<u8>> = None;
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let chunk_id = &bytes[pos..pos + 4];
        let chunk_size = read_u32(bytes, pos + 4)? as usize;
        let body = pos + 8;

        if chunk_id == b"fmt " {
            let content = bytes
                .get(body..body + chunk_size)
                .ok_or_else(|| anyhow!("Truncated fmt chunk"))?;
            if content.len() < 16 {
                return Err(anyhow!("fmt chunk too short"));
            }
            fmt_content = Some(content.to_vec());
        } else if chunk_id == b"data" {
            let fmt_content = fmt_content.ok_or_else(|| anyhow!("Missing fmt chunk before data"))?;
            // Streaming encoders write a placeholder size; trust the buffer.
            let data_size = chunk_size.min(bytes.len() - body);
            return Ok(WavInfo {
                fmt_content,
                data_offset: body,
                data_size,
            });
        }
        // Chunks are word aligned.
        pos = body + chunk_size + (chunk_size & 1);
    }
    Err(anyhow!("Missing data chunk"))
}

pub fn wav_duration(bytes: &[u8]) -> Option<Duration> {
    scan_wav(bytes).ok().and_then(|info| info.duration())
}

/// Byte range of one clip inside a merged buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipSpan {
    pub start: usize,
    pub end: usize,
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedAudio {
    pub data: Vec<u8>,
    pub spans: Vec<ClipSpan>,
    pub total_duration: Option<Duration>,
}

/// Concatenates opaque clips (MP3 and other stream formats).
pub fn merge_binary(clips: &[&[u8]]) -> MergedAudio {
    let mut data = Vec::with_capacity(clips.iter().map(|c| c.len()).sum());
    let mut spans = Vec::with_capacity(clips.len());
    for clip in clips {
        let start = data.len();
        data.extend_from_slice(clip);
        spans.push(ClipSpan {
            start,
            end: data.len(),
            start_ms: None,
            end_ms: None,
        });
    }
    MergedAudio {
        data,
        spans,
        total_duration: None,
    }
}

/// Concatenates the data chunks of WAV clips under one header.
///
/// All clips must share the same fmt chunk. `silence_ms` of zeroed samples
/// is inserted between consecutive clips.
pub fn merge_wav(clips: &[&[u8]], silence_ms: u32) -> Result<MergedAudio> {
    let first = clips.first().ok_or_else(|| anyhow!("No clips to merge"))?;
    let base = scan_wav(first)?;

    let mut infos = Vec::with_capacity(clips.len());
    for (i, clip) in clips.iter().enumerate() {
        let info = scan_wav(clip).map_err(|e| anyhow!("Failed to parse WAV clip {}: {}", i, e))?;
        if info.fmt_content != base.fmt_content {
            return Err(anyhow!(
                "WAV format mismatch in clip {}. All clips must have the same sample rate and channels.",
                i
            ));
        }
        infos.push(info);
    }

    let gap = base.silence_bytes(silence_ms);
    let total_data: usize =
        infos.iter().map(|i| i.data_size).sum::<usize>() + gap * clips.len().saturating_sub(1);
    let total_data_u32 =
        u32::try_from(total_data).map_err(|_| anyhow!("Merged WAV exceeds 4 GiB"))?;

    let header_len = 12 + 8 + base.fmt_content.len() + 8;
    let mut data = Vec::with_capacity(header_len + total_data);
    data.extend_from_slice(b"RIFF");
    let riff_size = 4 + 8 + base.fmt_content.len() as u32 + 8 + total_data_u32;
    data.extend_from_slice(&riff_size.to_le_bytes());
    data.extend_from_slice(b"WAVE");
    data.extend_from_slice(b"fmt ");
    data.extend_from_slice(&(base.fmt_content.len() as u32).to_le_bytes());
    data.extend_from_slice(&base.fmt_content);
    data.extend_from_slice(b"data");
    data.extend_from_slice(&total_data_u32.to_le_bytes());

    let byte_rate = base.byte_rate() as u64;
    let to_ms = |bytes: usize| -> Option<u64> {
        if byte_rate == 0 {
            None
        } else {
            Some((bytes - header_len) as u64 * 1000 / byte_rate)
        }
    };

    let mut spans = Vec::with_capacity(clips.len());
    for (i, (clip, info)) in clips.iter().zip(&infos).enumerate() {
        if i > 0 && gap > 0 {
            data.resize(data.len() + gap, 0);
        }
        let start = data.len();
        data.extend_from_slice(&clip[info.data_offset..info.data_offset + info.data_size]);
        let end = data.len();
        spans.push(ClipSpan {
            start,
            end,
            start_ms: to_ms(start),
            end_ms: to_ms(end),
        });
    }

    let total_duration = if byte_rate == 0 {
        None
    } else {
        Some(bytes_to_duration(total_data, byte_rate))
    };
    log::debug!(
        "Merged {} WAV clip(s): {} Hz, {} channel(s), {} data bytes",
        clips.len(),
        base.sample_rate(),
        base.channels(),
        total_data
    );
    Ok(MergedAudio {
        data,
        spans,
        total_duration,
    })
}
