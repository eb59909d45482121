//! Speech activity detection
//!
//! Every sampling tick measures each registered source. A source turns
//! speaking only after more than `required_samples_for_speech` consecutive
//! readings above the threshold, and turns silent on the first reading below
//! it. Aggregate state (sorted speaker set, silence flag and the sticky last
//! speaker) is derived after every tick.

use indexmap::IndexMap;
use parking_lot::Mutex;
use roomcast_core::config::ActivityConfig;
use roomcast_core::error::Result;
use roomcast_core::events::EventEmitter;
use roomcast_core::media::{Media, MediaConsumer, MediaSelector, MediaStream, MediaTrack};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::levels::{LevelSource, LevelStats, Smoother};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityEvent {
    /// One source went from silent to speaking
    SourceStarted(String),
    /// One source went from speaking to silent
    SourceEnded(String),
    /// Silence was broken by the given speakers
    SpeechStarted(Vec<String>),
    /// The last speaker went silent
    SpeechEnded,
    SpeakersChanged {
        current: Vec<String>,
        previous: Vec<String>,
    },
}

/// Per-source detector state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceActivity {
    pub consecutive_over_threshold: u32,
    pub speaking: bool,
    pub current: Option<LevelStats>,
}

struct Source {
    input: Arc<dyn LevelSource>,
    media: Option<Media>,
    smoother: Smoother,
    activity: SourceActivity,
}

struct DetectorState {
    sources: IndexMap<String, Source>,
    speakers: Vec<String>,
    silence: bool,
    last_speaker: Option<String>,
}

pub struct ActivityDetector {
    threshold: f64,
    required_samples: u32,
    smoothing: f64,
    interval: Duration,
    state: Mutex<DetectorState>,
    events: EventEmitter<ActivityEvent>,
    running: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for ActivityDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ActivityDetector")
            .field("threshold", &self.threshold)
            .field("sources", &state.sources.len())
            .field("speakers", &state.speakers)
            .field("last_speaker", &state.last_speaker)
            .finish_non_exhaustive()
    }
}

impl ActivityDetector {
    #[must_use]
    pub fn new(config: &ActivityConfig) -> Self {
        Self {
            threshold: config.threshold(),
            required_samples: config.required_samples_for_speech,
            smoothing: config.smoothing,
            interval: config.sampling_interval(),
            state: Mutex::new(DetectorState {
                sources: IndexMap::new(),
                speakers: Vec::new(),
                silence: true,
                last_speaker: None,
            }),
            events: EventEmitter::new(),
            running: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn events(&self) -> &EventEmitter<ActivityEvent> {
        &self.events
    }

    /// Threshold in dBFS, always negative
    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Register or replace a source under `id`
    pub fn add_source(&self, id: impl Into<String>, input: Arc<dyn LevelSource>) {
        self.insert(id.into(), input, None);
    }

    pub fn remove_source(&self, id: &str) -> bool {
        self.state.lock().sources.shift_remove(id).is_some()
    }

    fn insert(&self, id: String, input: Arc<dyn LevelSource>, media: Option<Media>) {
        let mut state = self.state.lock();
        if let Some(source) = state.sources.get_mut(&id) {
            // Replacing keeps the smoothed level and speech state
            source.input = input;
            source.media = media;
            return;
        }
        debug!(source = %id, "Added activity source");
        state.sources.insert(
            id,
            Source {
                input,
                media,
                smoother: Smoother::new(self.smoothing),
                activity: SourceActivity::default(),
            },
        );
    }

    /// Ids currently speaking, sorted
    #[must_use]
    pub fn speakers(&self) -> Vec<String> {
        self.state.lock().speakers.clone()
    }

    /// True while nobody speaks
    #[must_use]
    pub fn is_silent(&self) -> bool {
        self.state.lock().silence
    }

    /// The most recent source to start speaking; kept through silence
    #[must_use]
    pub fn last_speaker(&self) -> Option<String> {
        self.state.lock().last_speaker.clone()
    }

    #[must_use]
    pub fn activity(&self, id: &str) -> Option<SourceActivity> {
        self.state
            .lock()
            .sources
            .get(id)
            .map(|source| source.activity.clone())
    }

    /// Take one reading from every source and raise the resulting events
    pub fn sample(&self) {
        let events = {
            let mut state = self.state.lock();
            let mut events = Vec::new();

            for (id, source) in &mut state.sources {
                let reading = source.input.level();
                let loudness = reading.map(|stats| source.smoother.push(stats.max_db));
                let activity = &mut source.activity;
                activity.current = reading;

                if loudness.is_some_and(|db| db > self.threshold) {
                    activity.consecutive_over_threshold += 1;
                    if activity.consecutive_over_threshold > self.required_samples
                        && !activity.speaking
                    {
                        activity.speaking = true;
                        events.push(ActivityEvent::SourceStarted(id.clone()));
                    }
                } else {
                    activity.consecutive_over_threshold = 0;
                    if activity.speaking {
                        activity.speaking = false;
                        events.push(ActivityEvent::SourceEnded(id.clone()));
                    }
                }
            }

            if let Some(ActivityEvent::SourceStarted(id)) = events
                .iter()
                .rev()
                .find(|event| matches!(event, ActivityEvent::SourceStarted(_)))
            {
                state.last_speaker = Some(id.clone());
            }

            let mut current: Vec<String> = state
                .sources
                .iter()
                .filter(|(_, source)| source.activity.speaking)
                .map(|(id, _)| id.clone())
                .collect();
            current.sort();

            let previous = std::mem::replace(&mut state.speakers, current.clone());
            if !current.is_empty() && previous.is_empty() {
                state.silence = false;
                events.push(ActivityEvent::SpeechStarted(current.clone()));
            }
            if current.is_empty() && !previous.is_empty() {
                state.silence = true;
                events.push(ActivityEvent::SpeechEnded);
            }
            if current != previous {
                events.push(ActivityEvent::SpeakersChanged { current, previous });
            }
            events
        };

        for event in events {
            trace!(?event, "Activity event");
            self.events.emit(event);
        }
    }

    /// Sample on a fixed interval until [`stop`](Self::stop); a second call
    /// while running does nothing
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *running = Some(token.clone());

        let detector = Arc::downgrade(self);
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => match detector.upgrade() {
                        Some(detector) => detector.sample(),
                        None => break,
                    },
                }
            }
            debug!("Activity sampling stopped");
        });
    }

    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
        }
    }
}

impl Drop for ActivityDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl MediaConsumer for ActivityDetector {
    fn add_media(&self, media: Media, id: Option<&str>) -> Result<()> {
        let id = id.map_or_else(|| media.id(), str::to_string);
        self.insert(id, Arc::new(media.clone()), Some(media));
        Ok(())
    }

    fn remove_media(&self, selector: &MediaSelector) -> Result<()> {
        self.state.lock().sources.retain(|id, source| {
            source
                .media
                .as_ref()
                .map_or(*selector != MediaSelector::Source(id.clone()), |media| {
                    !selector.matches_media(media, id)
                })
        });
        Ok(())
    }

    fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.state
            .lock()
            .sources
            .values()
            .filter_map(|source| source.media.as_ref())
            .flat_map(Media::tracks)
            .collect()
    }

    fn streams(&self) -> Vec<Arc<MediaStream>> {
        self.state
            .lock()
            .sources
            .values()
            .filter_map(|source| source.media.as_ref().and_then(Media::stream).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Mutex<f64>);

    impl Fixed {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(-100.0)))
        }

        fn set(&self, db: f64) {
            *self.0.lock() = db;
        }
    }

    impl LevelSource for Fixed {
        fn level(&self) -> Option<LevelStats> {
            let db = *self.0.lock();
            Some(LevelStats {
                min_db: db,
                max_db: db,
                average_db: db,
            })
        }
    }

    fn detector(required: u32) -> ActivityDetector {
        ActivityDetector::new(&ActivityConfig {
            threshold_db: 50.0,
            smoothing: 0.0,
            required_samples_for_speech: required,
            ..ActivityConfig::default()
        })
    }

    const LOUD: f64 = -10.0;
    const QUIET: f64 = -90.0;

    #[test]
    fn test_positive_threshold_is_negated() {
        assert_eq!(detector(3).threshold(), -50.0);
    }

    #[test]
    fn test_short_burst_does_not_trigger_speech() {
        let detector = detector(3);
        let source = Fixed::new();
        detector.add_source("a", source.clone());

        source.set(LOUD);
        for _ in 0..2 {
            detector.sample();
        }
        source.set(QUIET);
        detector.sample();

        assert!(detector.is_silent());
        assert_eq!(detector.activity("a").unwrap().consecutive_over_threshold, 0);
        assert_eq!(detector.last_speaker(), None);
    }

    #[test]
    fn test_speech_after_required_plus_one_and_immediate_release() {
        let detector = detector(3);
        let source = Fixed::new();
        detector.add_source("a", source.clone());
        let mut events = detector.events().subscribe();

        source.set(LOUD);
        for _ in 0..3 {
            detector.sample();
            assert!(!detector.activity("a").unwrap().speaking);
        }
        detector.sample();
        assert!(detector.activity("a").unwrap().speaking);
        assert!(!detector.is_silent());

        source.set(QUIET);
        detector.sample();
        assert!(detector.is_silent());
        assert_eq!(detector.last_speaker().as_deref(), Some("a"));

        let seen: Vec<ActivityEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(
            seen,
            vec![
                ActivityEvent::SourceStarted("a".to_string()),
                ActivityEvent::SpeechStarted(vec!["a".to_string()]),
                ActivityEvent::SpeakersChanged {
                    current: vec!["a".to_string()],
                    previous: vec![],
                },
                ActivityEvent::SourceEnded("a".to_string()),
                ActivityEvent::SpeechEnded,
                ActivityEvent::SpeakersChanged {
                    current: vec![],
                    previous: vec!["a".to_string()],
                },
            ]
        );
    }

    #[test]
    fn test_speaker_set_is_sorted_and_last_speaker_tracks_newest() {
        let detector = detector(0);
        let b = Fixed::new();
        let a = Fixed::new();
        detector.add_source("b", b.clone());
        detector.add_source("a", a.clone());

        b.set(LOUD);
        detector.sample();
        assert_eq!(detector.last_speaker().as_deref(), Some("b"));

        a.set(LOUD);
        detector.sample();
        assert_eq!(detector.speakers(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(detector.last_speaker().as_deref(), Some("a"));

        assert!(detector.remove_source("a"));
        detector.sample();
        assert_eq!(detector.speakers(), vec!["b".to_string()]);
    }

    #[test]
    fn test_replacing_a_source_keeps_its_speech_state() {
        let detector = detector(0);
        let first = Fixed::new();
        first.set(LOUD);
        detector.add_source("a", first);
        detector.sample();
        assert!(detector.activity("a").unwrap().speaking);

        let second = Fixed::new();
        second.set(LOUD);
        detector.add_source("a", second);
        assert!(detector.activity("a").unwrap().speaking);
        detector.sample();
        assert_eq!(detector.speakers(), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_loop_runs_until_stopped() {
        let detector = Arc::new(detector(0));
        let source = Fixed::new();
        source.set(LOUD);
        detector.add_source("a", source.clone());

        detector.start();
        detector.start();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(detector.speakers(), vec!["a".to_string()]);

        detector.stop();
        source.set(QUIET);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(detector.speakers(), vec!["a".to_string()]);
    }
}
