//! Audio level measurement in dBFS

use roomcast_core::media::{Media, MediaStream, MediaTrack, TrackKind};

/// Reported for digital silence and for sources with nothing to measure
pub const SILENCE_DB: f64 = -160.0;

/// Magnitude statistics of one audio chunk, in dBFS
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelStats {
    pub min_db: f64,
    pub max_db: f64,
    pub average_db: f64,
}

impl LevelStats {
    pub const SILENT: Self = Self {
        min_db: SILENCE_DB,
        max_db: SILENCE_DB,
        average_db: SILENCE_DB,
    };
}

#[must_use]
pub fn to_dbfs(magnitude: f64) -> f64 {
    if magnitude <= 0.0 {
        SILENCE_DB
    } else {
        (20.0 * magnitude.min(1.0).log10()).max(SILENCE_DB)
    }
}

#[must_use]
pub fn analyze(samples: &[f32]) -> LevelStats {
    if samples.is_empty() {
        return LevelStats::SILENT;
    }

    let mut min = f64::MAX;
    let mut max = 0.0_f64;
    let mut sum = 0.0_f64;
    for sample in samples {
        let magnitude = f64::from(sample.abs());
        min = min.min(magnitude);
        max = max.max(magnitude);
        sum += magnitude;
    }

    LevelStats {
        min_db: to_dbfs(min),
        max_db: to_dbfs(max),
        average_db: to_dbfs(sum / samples.len() as f64),
    }
}

/// Anything the activity detector can sample
pub trait LevelSource: Send + Sync {
    /// Current level; `None` when the source has no audio at all
    fn level(&self) -> Option<LevelStats>;
}

impl LevelSource for MediaTrack {
    fn level(&self) -> Option<LevelStats> {
        if self.kind() != TrackKind::Audio {
            return None;
        }
        if self.is_ended() || self.is_muted() {
            return Some(LevelStats::SILENT);
        }
        Some(self.audio().map_or(LevelStats::SILENT, |chunk| analyze(&chunk.samples)))
    }
}

impl LevelSource for MediaStream {
    /// The loudest audio track
    fn level(&self) -> Option<LevelStats> {
        self.tracks_of(TrackKind::Audio)
            .iter()
            .filter_map(|track| track.level())
            .max_by(|a, b| a.max_db.total_cmp(&b.max_db))
    }
}

impl LevelSource for Media {
    fn level(&self) -> Option<LevelStats> {
        match self {
            Self::Track(track) => track.level(),
            Self::Stream(stream) => stream.level(),
        }
    }
}

/// Exponential smoothing of successive readings
#[derive(Debug, Clone)]
pub struct Smoother {
    constant: f64,
    value: Option<f64>,
}

impl Smoother {
    /// `constant` in `[0, 1)`; 0 disables smoothing
    #[must_use]
    pub fn new(constant: f64) -> Self {
        Self {
            constant: constant.clamp(0.0, 0.99),
            value: None,
        }
    }

    pub fn push(&mut self, reading: f64) -> f64 {
        let value = match self.value {
            Some(previous) => self.constant * previous + (1.0 - self.constant) * reading,
            None => reading,
        };
        self.value = Some(value);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_core::media::AudioChunk;

    #[test]
    fn test_dbfs_conversion() {
        assert_eq!(to_dbfs(1.0), 0.0);
        assert!((to_dbfs(0.1) + 20.0).abs() < 1e-9);
        assert_eq!(to_dbfs(0.0), SILENCE_DB);
        assert_eq!(to_dbfs(2.0), 0.0);
    }

    #[test]
    fn test_analyze_reports_extremes() {
        let stats = analyze(&[0.0, -0.1, 0.01]);
        assert_eq!(stats.min_db, SILENCE_DB);
        assert!((stats.max_db + 20.0).abs() < 1e-6);
        assert!(stats.average_db < stats.max_db);
        assert_eq!(analyze(&[]), LevelStats::SILENT);
    }

    #[test]
    fn test_track_levels() {
        let video = MediaTrack::new(TrackKind::Video);
        assert!(video.level().is_none());

        let audio = MediaTrack::new(TrackKind::Audio);
        assert_eq!(audio.level(), Some(LevelStats::SILENT));
        audio.push_audio(AudioChunk::new(48_000, vec![0.5_f32; 4]));
        assert!(audio.level().unwrap().max_db > -7.0);

        audio.set_muted(true);
        assert_eq!(audio.level(), Some(LevelStats::SILENT));
    }

    #[test]
    fn test_smoother() {
        let mut smoother = Smoother::new(0.5);
        assert_eq!(smoother.push(-40.0), -40.0);
        assert_eq!(smoother.push(-20.0), -30.0);
        assert_eq!(Smoother::new(0.0).push(-3.0), -3.0);
    }
}
