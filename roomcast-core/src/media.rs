//! Media tracks, streams and the common consumer interface
//!
//! A [`MediaTrack`] carries the most recent decoded video frame or audio
//! chunk pushed by its producer, a mute flag and a live/ended state that
//! consumers can await. Streams group tracks and are active while any of
//! their tracks is live.

use image::RgbaImage;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::types::{StreamId, TrackId};

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            _ => Err(Error::NotFound(format!("track kind {s:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

pub type VideoFrame = Arc<RgbaImage>;

/// Mono PCM, samples in [-1, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub sample_rate: u32,
    pub samples: Arc<[f32]>,
}

impl AudioChunk {
    pub fn new(sample_rate: u32, samples: impl Into<Arc<[f32]>>) -> Self {
        Self {
            sample_rate,
            samples: samples.into(),
        }
    }

    #[must_use]
    pub fn silence(sample_rate: u32, len: usize) -> Self {
        Self::new(sample_rate, vec![0.0; len])
    }
}

pub struct MediaTrack {
    id: TrackId,
    kind: TrackKind,
    muted: AtomicBool,
    state: watch::Sender<TrackState>,
    frame: RwLock<Option<VideoFrame>>,
    audio: RwLock<Option<AudioChunk>>,
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("muted", &self.is_muted())
            .field("ended", &self.is_ended())
            .finish_non_exhaustive()
    }
}

impl MediaTrack {
    #[must_use]
    pub fn new(kind: TrackKind) -> Arc<Self> {
        Self::with_id(TrackId::generate(), kind)
    }

    #[must_use]
    pub fn with_id(id: TrackId, kind: TrackKind) -> Arc<Self> {
        let (state, _) = watch::channel(TrackState::Live);
        Arc::new(Self {
            id,
            kind,
            muted: AtomicBool::new(false),
            state,
            frame: RwLock::new(None),
            audio: RwLock::new(None),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &TrackId {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        *self.state.borrow() == TrackState::Ended
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.is_ended()
    }

    /// End the track; returns false if it had already ended
    pub fn stop(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == TrackState::Ended {
                false
            } else {
                *state = TrackState::Ended;
                true
            }
        })
    }

    /// Resolves once the track has ended
    pub async fn ended(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == TrackState::Ended).await;
    }

    pub fn push_frame(&self, frame: VideoFrame) {
        *self.frame.write() = Some(frame);
    }

    /// Latest video frame, if any was pushed
    #[must_use]
    pub fn frame(&self) -> Option<VideoFrame> {
        self.frame.read().clone()
    }

    pub fn push_audio(&self, chunk: AudioChunk) {
        *self.audio.write() = Some(chunk);
    }

    /// Latest audio chunk, if any was pushed
    #[must_use]
    pub fn audio(&self) -> Option<AudioChunk> {
        self.audio.read().clone()
    }
}

#[derive(Debug)]
pub struct MediaStream {
    id: StreamId,
    tracks: RwLock<Vec<Arc<MediaTrack>>>,
}

impl MediaStream {
    #[must_use]
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Arc<Self> {
        Self::with_id(StreamId::generate(), tracks)
    }

    #[must_use]
    pub fn with_id(id: StreamId, tracks: Vec<Arc<MediaTrack>>) -> Arc<Self> {
        Arc::new(Self {
            id,
            tracks: RwLock::new(tracks),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &StreamId {
        &self.id
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks.read().clone()
    }

    #[must_use]
    pub fn tracks_of(&self, kind: TrackKind) -> Vec<Arc<MediaTrack>> {
        self.tracks
            .read()
            .iter()
            .filter(|track| track.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn add_track(&self, track: Arc<MediaTrack>) {
        let mut tracks = self.tracks.write();
        if !tracks.iter().any(|t| t.id() == track.id()) {
            tracks.push(track);
        }
    }

    pub fn remove_track(&self, id: &TrackId) -> Option<Arc<MediaTrack>> {
        let mut tracks = self.tracks.write();
        let index = tracks.iter().position(|t| t.id() == id)?;
        Some(tracks.remove(index))
    }

    #[must_use]
    pub fn contains(&self, id: &TrackId) -> bool {
        self.tracks.read().iter().any(|t| t.id() == id)
    }

    /// A stream is active while any of its tracks is live
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.tracks.read().iter().any(|t| t.is_live())
    }
}

/// Anything that can be handed to [`MediaConsumer::add_media`]
#[derive(Debug, Clone)]
pub enum Media {
    Track(Arc<MediaTrack>),
    Stream(Arc<MediaStream>),
}

impl Media {
    /// Default source id: the stream id, or the track id for a bare track
    #[must_use]
    pub fn id(&self) -> String {
        match self {
            Self::Track(track) => track.id().to_string(),
            Self::Stream(stream) => stream.id().to_string(),
        }
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        match self {
            Self::Track(track) => vec![Arc::clone(track)],
            Self::Stream(stream) => stream.tracks(),
        }
    }

    #[must_use]
    pub fn first_track(&self, kind: TrackKind) -> Option<Arc<MediaTrack>> {
        self.tracks().into_iter().find(|t| t.kind() == kind)
    }

    #[must_use]
    pub const fn stream(&self) -> Option<&Arc<MediaStream>> {
        match self {
            Self::Track(_) => None,
            Self::Stream(stream) => Some(stream),
        }
    }
}

impl From<Arc<MediaTrack>> for Media {
    fn from(track: Arc<MediaTrack>) -> Self {
        Self::Track(track)
    }
}

impl From<Arc<MediaStream>> for Media {
    fn from(stream: Arc<MediaStream>) -> Self {
        Self::Stream(stream)
    }
}

/// Which media an operation applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSelector {
    All,
    Kind(TrackKind),
    Track(TrackId),
    Stream(StreamId),
    /// A compositor source id as passed to `add_media`
    Source(String),
}

impl MediaSelector {
    /// Whether `track`, belonging to the given streams, is selected.
    /// `Source` selectors never match individual tracks.
    #[must_use]
    pub fn matches_track(&self, track: &MediaTrack, streams: &[StreamId]) -> bool {
        match self {
            Self::All => true,
            Self::Kind(kind) => track.kind() == *kind,
            Self::Track(id) => track.id() == id,
            Self::Stream(id) => streams.contains(id),
            Self::Source(_) => false,
        }
    }

    /// Whether a whole media item registered under `source_id` is selected
    #[must_use]
    pub fn matches_media(&self, media: &Media, source_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Source(id) => id == source_id,
            Self::Stream(id) => media.stream().is_some_and(|s| s.id() == id),
            Self::Track(id) => media.tracks().iter().any(|t| t.id() == id),
            Self::Kind(kind) => {
                let tracks = media.tracks();
                !tracks.is_empty() && tracks.iter().all(|t| t.kind() == *kind)
            }
        }
    }
}

impl FromStr for MediaSelector {
    type Err = Error;

    /// `all`/`*`, `audio`, `video`, or anything else as a source id
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "*" | "all" => Self::All,
            other => match other.parse::<TrackKind>() {
                Ok(kind) => Self::Kind(kind),
                Err(_) => Self::Source(other.to_string()),
            },
        })
    }
}

/// Shared shape of everything that accepts local or remote media:
/// sessions, the session directory and the compositors.
pub trait MediaConsumer: Send + Sync {
    /// Register media, optionally under an explicit source id
    fn add_media(&self, media: Media, id: Option<&str>) -> Result<()>;

    fn remove_media(&self, selector: &MediaSelector) -> Result<()>;

    fn tracks(&self) -> Vec<Arc<MediaTrack>>;

    fn streams(&self) -> Vec<Arc<MediaStream>>;
}
