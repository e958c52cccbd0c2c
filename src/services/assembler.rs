use log::info;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::core::error::{PipelineError, PipelineResult};
use crate::core::io::Storage;
use crate::core::state::{AudioFormat, AudioSegment, DialogueTurn, EpisodeAudio, SegmentBoundary};
use crate::utils::audio::{merge_binary, merge_wav, MergedAudio};

pub struct AudioAssembler {
    storage: Arc<dyn Storage>,
    output_folder: String,
    silence_ms: u32,
}

#[derive(Serialize)]
struct Manifest<'a> {
    episode: &'a str,
    audio_file: &'a str,
    format: AudioFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_duration_ms: Option<u64>,
    segments: &'a [SegmentBoundary],
}

impl AudioAssembler {
    pub fn new(storage: Arc<dyn Storage>, output_folder: &str, silence_ms: u32) -> Self {
        Self {
            storage,
            output_folder: output_folder.to_string(),
            silence_ms,
        }
    }

    /// Clips sorted by turn index, or `IncompleteAudioSet` unless they cover 0..expected exactly once.
    pub fn order(segments: &[AudioSegment], expected: usize) -> PipelineResult<Vec<&AudioSegment>> {
        let mut slots: Vec<Option<&AudioSegment>> = vec![None; expected];
        for seg in segments {
            match slots.get_mut(seg.turn_index) {
                Some(slot) if slot.is_none() => *slot = Some(seg),
                _ => {
                    log::error!(
                        "Clip for turn {} is duplicated or outside 0..{}",
                        seg.turn_index,
                        expected
                    );
                    return Err(PipelineError::IncompleteAudioSet {
                        missing: vec![seg.turn_index],
                        expected,
                    });
                }
            }
        }
        let missing: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .collect();
        if !missing.is_empty() || expected == 0 {
            return Err(PipelineError::IncompleteAudioSet { missing, expected });
        }
        Ok(slots.into_iter().flatten().collect())
    }

    /// Deterministic in-memory concatenation in turn order.
    pub fn concatenate(&self, ordered: &[&AudioSegment]) -> PipelineResult<(MergedAudio, AudioFormat)> {
        let format = ordered.first().map(|s| s.format).unwrap_or(AudioFormat::Other);
        let uniform = ordered.iter().all(|s| s.format == format);
        let clips: Vec<&[u8]> = ordered.iter().map(|s| s.data.as_slice()).collect();

        if uniform && format == AudioFormat::Wav {
            let merged = merge_wav(&clips, self.silence_ms).map_err(PipelineError::Storage)?;
            return Ok((merged, format));
        }
        if !uniform {
            log::warn!("Clips have mixed formats, concatenating bytes as is");
        }
        Ok((merge_binary(&clips), format))
    }

    /// Writes `<episode>.<ext>` and `<episode>.manifest.json` into the output folder.
    pub async fn assemble(
        &self,
        episode_name: &str,
        segments: &[AudioSegment],
        turns: &[DialogueTurn],
    ) -> PipelineResult<EpisodeAudio> {
        let ordered = Self::order(segments, turns.len())?;
        let (merged, format) = self.concatenate(&ordered)?;

        let boundaries: Vec<SegmentBoundary> = ordered
            .iter()
            .zip(&merged.spans)
            .map(|(seg, span)| SegmentBoundary {
                turn_index: seg.turn_index,
                speaker: turns[seg.turn_index].speaker.clone(),
                byte_start: span.start as u64,
                byte_end: span.end as u64,
                start_ms: span.start_ms,
                end_ms: span.end_ms,
            })
            .collect();
        let boundaries = fill_binary_timestamps(boundaries, &ordered);
        let total_duration_ms = merged
            .total_duration
            .map(|d| d.as_millis() as u64)
            .or_else(|| boundaries.last().and_then(|b| b.end_ms));

        let folder = Path::new(&self.output_folder);
        let audio_path = folder
            .join(format!("{}.{}", episode_name, format.extension()))
            .to_string_lossy()
            .to_string();
        let manifest_path = folder
            .join(format!("{}.manifest.json", episode_name))
            .to_string_lossy()
            .to_string();

        let manifest = Manifest {
            episode: episode_name,
            audio_file: &audio_path,
            format,
            total_duration_ms,
            segments: &boundaries,
        };
        let manifest_json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| PipelineError::Storage(e.into()))?;

        self.storage
            .write(&audio_path, &merged.data)
            .await
            .map_err(PipelineError::Storage)?;
        if let Err(e) = self.storage.write(&manifest_path, manifest_json.as_bytes()).await {
            // an episode is only published together with its manifest
            if let Err(cleanup) = self.storage.delete(&audio_path).await {
                log::warn!("Failed to remove {}: {:#}", audio_path, cleanup);
            }
            return Err(PipelineError::Storage(e));
        }
        info!(
            "Episode written to {} ({} bytes, {} turn(s))",
            audio_path,
            merged.data.len(),
            boundaries.len()
        );

        Ok(EpisodeAudio {
            path: audio_path,
            manifest_path,
            format,
            boundaries,
            total_duration_ms,
        })
    }
}

/// Timestamps for stream formats, when every clip knows its own duration.
fn fill_binary_timestamps(mut boundaries: Vec<SegmentBoundary>, ordered: &[&AudioSegment]) -> Vec<SegmentBoundary> {
    if boundaries.iter().all(|b| b.start_ms.is_some()) {
        return boundaries;
    }
    if ordered.iter().any(|s| s.duration.is_none()) {
        return boundaries;
    }
    let mut cursor = 0u64;
    for (b, seg) in boundaries.iter_mut().zip(ordered) {
        let len = seg.duration.map(|d| d.as_millis() as u64).unwrap_or(0);
        b.start_ms = Some(cursor);
        cursor += len;
        b.end_ms = Some(cursor);
    }
    boundaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::utils::audio::tests::create_dummy_wav;
    use crate::utils::audio::scan_wav;
    use std::time::Duration;

    fn turns(n: usize) -> Vec<DialogueTurn> {
        (0..n)
            .map(|i| DialogueTurn {
                speaker: if i % 2 == 0 { "Alice".into() } else { "Bob".into() },
                text: format!("t{}", i),
                emotion: String::new(),
                speed: 1.0,
            })
            .collect()
    }

    fn mp3_segment(i: usize) -> AudioSegment {
        AudioSegment {
            turn_index: i,
            data: format!("<clip {}>", i).into_bytes(),
            format: AudioFormat::Mp3,
            duration: Some(Duration::from_millis(500)),
            provider_used: "openai".into(),
        }
    }

    fn assembler(dir: &Path, silence_ms: u32) -> AudioAssembler {
        AudioAssembler::new(
            Arc::new(NativeStorage::new()),
            &dir.to_string_lossy(),
            silence_ms,
        )
    }

    #[tokio::test]
    async fn test_assembly_is_deterministic() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let asm = assembler(dir.path(), 0);
        // arrival order differs from turn order
        let segments: Vec<AudioSegment> = [3, 0, 4, 1, 2].iter().map(|i| mp3_segment(*i)).collect();

        let first = asm.assemble("ep", &segments, &turns(5)).await?;
        let bytes_first = std::fs::read(&first.path)?;
        let second = asm.assemble("ep", &segments, &turns(5)).await?;
        let bytes_second = std::fs::read(&second.path)?;

        assert_eq!(bytes_first, bytes_second);
        assert_eq!(bytes_first, b"<clip 0><clip 1><clip 2><clip 3><clip 4>");
        assert_eq!(first.boundaries[1].byte_start, 8);
        assert_eq!(first.boundaries[1].speaker, "Bob");
        assert_eq!(first.boundaries[4].end_ms, Some(2500));
        assert_eq!(first.total_duration_ms, Some(2500));
        assert!(first.path.ends_with("ep.mp3"));

        let manifest: serde_json::Value = serde_json::from_slice(&std::fs::read(&first.manifest_path)?)?;
        assert_eq!(manifest["segments"].as_array().map(|a| a.len()), Some(5));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_index_writes_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let asm = assembler(dir.path(), 0);
        let segments: Vec<AudioSegment> = [0, 1, 3, 4].iter().map(|i| mp3_segment(*i)).collect();

        match asm.assemble("ep", &segments, &turns(5)).await {
            Err(PipelineError::IncompleteAudioSet { missing, expected }) => {
                assert_eq!(missing, vec![2]);
                assert_eq!(expected, 5);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    /// Refuses to write manifests, delegates everything else.
    struct NoManifestStorage(NativeStorage);

    #[async_trait::async_trait]
    impl Storage for NoManifestStorage {
        async fn read(&self, path: &str) -> anyhow::Result<Vec<u8>> {
            self.0.read(path).await
        }

        async fn write(&self, path: &str, content: &[u8]) -> anyhow::Result<()> {
            if path.ends_with(".manifest.json") {
                anyhow::bail!("disk full");
            }
            self.0.write(path, content).await
        }

        async fn delete(&self, path: &str) -> anyhow::Result<()> {
            self.0.delete(path).await
        }

        async fn exists(&self, path: &str) -> anyhow::Result<bool> {
            self.0.exists(path).await
        }
    }

    #[tokio::test]
    async fn test_manifest_failure_removes_audio() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let asm = AudioAssembler::new(
            Arc::new(NoManifestStorage(NativeStorage::new())),
            &dir.path().to_string_lossy(),
            0,
        );
        let segments: Vec<AudioSegment> = (0..3).map(mp3_segment).collect();

        let err = asm.assemble("ep", &segments, &turns(3)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
        assert!(!dir.path().join("ep.mp3").exists());
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_duplicate_index_is_rejected() {
        let segments = vec![mp3_segment(0), mp3_segment(0)];
        assert!(matches!(
            AudioAssembler::order(&segments, 2),
            Err(PipelineError::IncompleteAudioSet { .. })
        ));
        assert!(AudioAssembler::order(&[], 0).is_err());
    }

    #[tokio::test]
    async fn test_wav_merge_with_silence() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let asm = assembler(dir.path(), 100);
        let segments: Vec<AudioSegment> = (0..3)
            .map(|i| AudioSegment {
                turn_index: i,
                data: create_dummy_wav(2000, 1000, i as u8 + 1),
                format: AudioFormat::Wav,
                duration: Some(Duration::from_secs(1)),
                provider_used: "soulx".into(),
            })
            .collect();

        let episode = asm.assemble("wav_ep", &segments, &turns(3)).await?;
        let data = std::fs::read(&episode.path)?;
        let info = scan_wav(&data)?;
        assert_eq!(info.data_size, 3 * 2000 + 2 * 200);
        assert_eq!(episode.boundaries[1].start_ms, Some(1100));
        assert_eq!(episode.total_duration_ms, Some(3200));
        Ok(())
    }
}
