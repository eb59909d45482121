//! Audio compositor
//!
//! Every registered input contributes its latest chunk, scaled by its gain,
//! to one summed output chunk. The summing graph is rebuilt whenever inputs
//! are added, removed or re-weighted; with no inputs the output is silence.

use indexmap::IndexMap;
use parking_lot::Mutex;
use roomcast_core::config::AudioConfig;
use roomcast_core::error::{Error, Result};
use roomcast_core::media::{
    AudioChunk, Media, MediaConsumer, MediaSelector, MediaStream, MediaTrack, TrackKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Input {
    media: Media,
    track: Option<Arc<MediaTrack>>,
    gain: f32,
}

/// Fan-in of the current inputs into one output
#[derive(Default)]
struct MixGraph {
    inputs: Vec<(Arc<MediaTrack>, f32)>,
}

impl MixGraph {
    fn build(inputs: &IndexMap<String, Input>) -> Self {
        Self {
            inputs: inputs
                .values()
                .filter_map(|input| input.track.as_ref().map(|t| (Arc::clone(t), input.gain)))
                .collect(),
        }
    }

    fn input_count(&self) -> usize {
        self.inputs.len()
    }

    fn mix(&self, frame_len: usize) -> Vec<f32> {
        let mut mixed = vec![0.0_f32; frame_len];
        for (track, gain) in &self.inputs {
            if !track.is_live() || track.is_muted() {
                continue;
            }
            let Some(chunk) = track.audio() else {
                continue;
            };
            for (out, sample) in mixed.iter_mut().zip(chunk.samples.iter()) {
                *out += sample * gain;
            }
        }
        for sample in &mut mixed {
            *sample = sample.clamp(-1.0, 1.0);
        }
        mixed
    }
}

#[derive(Default)]
struct AudioState {
    inputs: IndexMap<String, Input>,
    graph: MixGraph,
}

impl AudioState {
    fn rebuild(&mut self) {
        self.graph = MixGraph::build(&self.inputs);
        debug!(inputs = self.graph.input_count(), "Rebuilt audio mix graph");
    }
}

pub struct AudioCompositor {
    sample_rate: u32,
    frame_len: usize,
    interval: Duration,
    state: Mutex<AudioState>,
    output: Arc<MediaTrack>,
    stream: Arc<MediaStream>,
    running: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for AudioCompositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCompositor")
            .field("sample_rate", &self.sample_rate)
            .field("inputs", &self.input_count())
            .finish_non_exhaustive()
    }
}

impl AudioCompositor {
    #[must_use]
    pub fn new(config: &AudioConfig) -> Self {
        let output = MediaTrack::new(TrackKind::Audio);
        Self {
            sample_rate: config.sample_rate,
            frame_len: config.frame_len(),
            interval: config.frame_interval(),
            state: Mutex::new(AudioState::default()),
            stream: MediaStream::new(vec![Arc::clone(&output)]),
            output,
            running: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn output_track(&self) -> Arc<MediaTrack> {
        Arc::clone(&self.output)
    }

    #[must_use]
    pub fn output_stream(&self) -> Arc<MediaStream> {
        Arc::clone(&self.stream)
    }

    /// Inputs currently wired into the mix
    #[must_use]
    pub fn input_count(&self) -> usize {
        self.state.lock().graph.input_count()
    }

    /// Input ids in registration order
    #[must_use]
    pub fn input_ids(&self) -> Vec<String> {
        self.state.lock().inputs.keys().cloned().collect()
    }

    pub fn set_gain(&self, id: &str, gain: f32) -> Result<()> {
        let mut state = self.state.lock();
        let input = state
            .inputs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("audio input {id:?}")))?;
        input.gain = gain.max(0.0);
        state.rebuild();
        Ok(())
    }

    /// Sum one frame of the current inputs and publish it on the output track
    pub fn mix(&self) -> AudioChunk {
        let samples = self.state.lock().graph.mix(self.frame_len);
        let chunk = AudioChunk::new(self.sample_rate, samples);
        self.output.push_audio(chunk.clone());
        chunk
    }

    /// Mix one frame per configured frame duration until [`stop`](Self::stop)
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *running = Some(token.clone());

        let compositor = Arc::downgrade(self);
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => match compositor.upgrade() {
                        Some(compositor) => {
                            compositor.mix();
                        }
                        None => break,
                    },
                }
            }
            debug!("Audio mixing stopped");
        });
    }

    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
        }
    }
}

impl Drop for AudioCompositor {
    fn drop(&mut self) {
        self.stop();
        self.output.stop();
    }
}

impl MediaConsumer for AudioCompositor {
    /// Register an input; its first audio track is mixed
    fn add_media(&self, media: Media, id: Option<&str>) -> Result<()> {
        let id = id.map_or_else(|| media.id(), str::to_string);
        let track = media.first_track(TrackKind::Audio);
        let mut state = self.state.lock();
        state.inputs.insert(
            id,
            Input {
                media,
                track,
                gain: 1.0,
            },
        );
        state.rebuild();
        Ok(())
    }

    fn remove_media(&self, selector: &MediaSelector) -> Result<()> {
        let mut state = self.state.lock();
        state
            .inputs
            .retain(|id, input| !selector.matches_media(&input.media, id));
        state.rebuild();
        Ok(())
    }

    fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.state
            .lock()
            .inputs
            .values()
            .flat_map(|input| input.media.tracks())
            .collect()
    }

    fn streams(&self) -> Vec<Arc<MediaStream>> {
        self.state
            .lock()
            .inputs
            .values()
            .filter_map(|input| input.media.stream().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compositor() -> AudioCompositor {
        AudioCompositor::new(&AudioConfig {
            sample_rate: 8_000,
            frame_ms: 1,
        })
    }

    fn microphone(samples: &[f32]) -> Arc<MediaTrack> {
        let track = MediaTrack::new(TrackKind::Audio);
        track.push_audio(AudioChunk::new(8_000, samples.to_vec()));
        track
    }

    #[test]
    fn test_no_inputs_is_silence() {
        let compositor = compositor();
        let chunk = compositor.mix();
        assert_eq!(chunk.samples.len(), 8);
        assert!(chunk.samples.iter().all(|s| *s == 0.0));
        assert_eq!(compositor.output_track().audio(), Some(chunk));
    }

    #[test]
    fn test_inputs_are_summed_with_gain_and_clamped() {
        let compositor = compositor();
        compositor
            .add_media(microphone(&[0.25; 8]).into(), Some("a"))
            .unwrap();
        compositor
            .add_media(microphone(&[0.5; 4]).into(), Some("b"))
            .unwrap();
        assert_eq!(compositor.input_count(), 2);

        let chunk = compositor.mix();
        assert_eq!(chunk.samples[0], 0.75);
        assert_eq!(chunk.samples[7], 0.25);

        compositor.set_gain("b", 2.0).unwrap();
        assert_eq!(compositor.mix().samples[0], 1.0);
        assert!(matches!(
            compositor.set_gain("missing", 1.0),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_muted_and_removed_inputs_drop_out() {
        let compositor = compositor();
        let a = microphone(&[0.25; 8]);
        compositor.add_media(a.clone().into(), Some("a")).unwrap();
        compositor
            .add_media(microphone(&[0.5; 8]).into(), Some("b"))
            .unwrap();

        a.set_muted(true);
        assert_eq!(compositor.mix().samples[0], 0.5);

        compositor
            .remove_media(&MediaSelector::Source("b".to_string()))
            .unwrap();
        assert_eq!(compositor.input_ids(), vec!["a".to_string()]);
        assert_eq!(compositor.mix().samples[0], 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixing_loop_publishes_frames() {
        let compositor = Arc::new(compositor());
        compositor
            .add_media(microphone(&[0.1; 8]).into(), Some("a"))
            .unwrap();
        compositor.start();
        tokio::time::sleep(Duration::from_millis(5)).await;
        compositor.stop();

        let chunk = compositor.output_track().audio().unwrap();
        assert!((chunk.samples[0] - 0.1).abs() < 1e-6);
    }
}
