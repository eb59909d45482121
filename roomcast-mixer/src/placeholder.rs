//! Synthetic local media for running without capture devices

use parking_lot::Mutex;
use roomcast_core::media::{AudioChunk, MediaStream, MediaTrack, TrackKind};
use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::frame::{solid_frame, Color};

#[derive(Debug, Clone)]
pub struct PlaceholderOptions {
    /// Cycle colours and play a tone; otherwise black frames and silence
    pub enable: bool,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub sample_rate: u32,
    pub frame_ms: u64,
    pub frequency: f64,
}

impl Default for PlaceholderOptions {
    fn default() -> Self {
        Self {
            enable: false,
            width: 360,
            height: 420,
            fps: 10,
            sample_rate: 48_000,
            frame_ms: 20,
            frequency: 440.0,
        }
    }
}

struct Generator {
    frame: u64,
    phase: f64,
}

pub struct PlaceholderMedia {
    options: PlaceholderOptions,
    video: Arc<MediaTrack>,
    audio: Arc<MediaTrack>,
    stream: Arc<MediaStream>,
    generator: Mutex<Generator>,
    running: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for PlaceholderMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaceholderMedia")
            .field("options", &self.options)
            .field("stream", &self.stream.id())
            .finish_non_exhaustive()
    }
}

impl PlaceholderMedia {
    #[must_use]
    pub fn new(options: PlaceholderOptions) -> Self {
        info!(
            enable = options.enable,
            width = options.width,
            height = options.height,
            fps = options.fps,
            frequency = options.frequency,
            "Created placeholder media"
        );
        let video = MediaTrack::new(TrackKind::Video);
        let audio = MediaTrack::new(TrackKind::Audio);
        let media = Self {
            stream: MediaStream::new(vec![Arc::clone(&video), Arc::clone(&audio)]),
            video,
            audio,
            options,
            generator: Mutex::new(Generator { frame: 0, phase: 0.0 }),
            running: Mutex::new(None),
        };
        media.next_video_frame();
        media.next_audio_chunk();
        media
    }

    #[must_use]
    pub fn stream(&self) -> Arc<MediaStream> {
        Arc::clone(&self.stream)
    }

    #[must_use]
    pub fn video_track(&self) -> Arc<MediaTrack> {
        Arc::clone(&self.video)
    }

    #[must_use]
    pub fn audio_track(&self) -> Arc<MediaTrack> {
        Arc::clone(&self.audio)
    }

    /// Colour of frame `n`: black when disabled, a slow hue rotation otherwise
    #[must_use]
    pub fn color_at(&self, n: u64) -> Color {
        if !self.options.enable {
            return Color::BLACK;
        }
        hue_to_color((n * 7 % 360) as f64)
    }

    pub fn next_video_frame(&self) {
        let n = {
            let mut generator = self.generator.lock();
            let n = generator.frame;
            generator.frame += 1;
            n
        };
        self.video.push_frame(solid_frame(
            self.options.width,
            self.options.height,
            self.color_at(n),
        ));
    }

    pub fn next_audio_chunk(&self) {
        let len = (u64::from(self.options.sample_rate) * self.options.frame_ms / 1000) as usize;
        let samples = if self.options.enable {
            let step = TAU * self.options.frequency / f64::from(self.options.sample_rate.max(1));
            let mut generator = self.generator.lock();
            (0..len)
                .map(|_| {
                    let sample = 0.5 * generator.phase.sin();
                    generator.phase = (generator.phase + step) % TAU;
                    sample as f32
                })
                .collect()
        } else {
            vec![0.0; len]
        };
        self.audio
            .push_audio(AudioChunk::new(self.options.sample_rate, samples));
    }

    /// Produce frames and chunks in real time until [`stop`](Self::stop)
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *running = Some(token.clone());

        let media = Arc::downgrade(self);
        let video_interval = Duration::from_secs_f64(1.0 / f64::from(self.options.fps.max(1)));
        let audio_interval = Duration::from_millis(self.options.frame_ms.max(1));
        tokio::spawn(async move {
            let mut video = tokio::time::interval(video_interval);
            let mut audio = tokio::time::interval(audio_interval);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = video.tick() => match media.upgrade() {
                        Some(media) => media.next_video_frame(),
                        None => break,
                    },
                    _ = audio.tick() => match media.upgrade() {
                        Some(media) => media.next_audio_chunk(),
                        None => break,
                    },
                }
            }
            debug!("Placeholder media stopped");
        });
    }

    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
        }
    }
}

impl Drop for PlaceholderMedia {
    fn drop(&mut self) {
        self.stop();
        self.video.stop();
        self.audio.stop();
    }
}

/// Fully saturated colour for a hue in degrees
fn hue_to_color(hue: f64) -> Color {
    let sector = hue / 60.0;
    let x = 1.0 - (sector % 2.0 - 1.0).abs();
    let (r, g, b) = match sector as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    };
    let channel = |v: f64| (v * 255.0).round() as u8;
    Color::rgb(channel(r), channel(g), channel(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::levels::LevelSource;

    #[test]
    fn test_disabled_media_is_black_and_silent() {
        let media = PlaceholderMedia::new(PlaceholderOptions::default());
        let frame = media.video_track().frame().unwrap();
        assert_eq!((frame.width(), frame.height()), (360, 420));
        assert_eq!(frame.get_pixel(0, 0).0, [0, 0, 0, 255]);

        let level = media.audio_track().level().unwrap();
        assert_eq!(level.max_db, crate::levels::SILENCE_DB);
        assert_eq!(media.stream().tracks().len(), 2);
    }

    #[test]
    fn test_enabled_media_cycles_colour_and_plays_tone() {
        let media = PlaceholderMedia::new(PlaceholderOptions {
            enable: true,
            ..PlaceholderOptions::default()
        });
        assert_eq!(media.color_at(0), Color::rgb(255, 0, 0));
        assert_ne!(media.color_at(0), media.color_at(10));
        assert_eq!(media.color_at(0), media.color_at(360));

        let level = media.audio_track().level().unwrap();
        assert!(level.max_db > -7.0);
        assert_eq!(media.audio_track().audio().unwrap().samples.len(), 960);
    }

    #[test]
    fn test_hue_wheel() {
        assert_eq!(hue_to_color(120.0), Color::rgb(0, 255, 0));
        assert_eq!(hue_to_color(240.0), Color::rgb(0, 0, 255));
        assert_eq!(hue_to_color(60.0), Color::rgb(255, 255, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_loop_advances_frames() {
        let media = Arc::new(PlaceholderMedia::new(PlaceholderOptions {
            enable: true,
            ..PlaceholderOptions::default()
        }));
        let first = media.video_track().frame().unwrap();
        media.start();
        tokio::time::sleep(Duration::from_millis(250)).await;
        media.stop();

        let latest = media.video_track().frame().unwrap();
        assert_ne!(first.get_pixel(0, 0), latest.get_pixel(0, 0));
    }
}
