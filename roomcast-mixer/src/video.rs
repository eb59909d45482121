//! Video compositor
//!
//! Sources are drawn into one output frame according to the current mixing
//! configuration. The configuration is re-selected and positions re-bound on
//! every change to the source set or the registry; geometry is resolved per
//! frame so layouts can follow live state such as the active speaker.

use indexmap::IndexMap;
use parking_lot::Mutex;
use roomcast_core::config::VideoConfig;
use roomcast_core::error::Result;
use roomcast_core::events::EventEmitter;
use roomcast_core::media::{
    Media, MediaConsumer, MediaSelector, MediaStream, MediaTrack, TrackKind, VideoFrame,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::frame::{Color, FrameBuffer, Rect};
use crate::layout::{assign, ConfigChange, ConfigRegistry, MixingConfiguration, Placement, RenderStats};

/// One drawn slot of a rendered frame
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedSlot {
    pub id: String,
    pub draw_index: usize,
    pub rect: Rect,
    /// Drawn as a solid fill instead of the source image
    pub placeholder: bool,
}

/// What the last frame was made of
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSnapshot {
    pub config: String,
    /// `None` when the configuration paints frames itself
    pub background: Option<Color>,
    pub slots: Vec<RenderedSlot>,
}

struct Source {
    media: Media,
    track: Option<Arc<MediaTrack>>,
}

impl Source {
    /// The frame to draw, or `None` when a placeholder is due
    fn drawable(&self) -> Option<VideoFrame> {
        self.track
            .as_ref()
            .filter(|track| track.is_live() && !track.is_muted())
            .and_then(|track| track.frame())
    }
}

#[derive(Default)]
struct VideoState {
    sources: IndexMap<String, Source>,
    registry: ConfigRegistry,
    placements: Vec<Placement>,
}

impl VideoState {
    fn ids(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    /// Re-bind positions for the current configuration
    fn rebind(&mut self) -> Result<()> {
        self.placements.clear();
        let ids = self.ids();
        if let Some((_, config)) = self.registry.current() {
            if config.paint_fn().is_none() {
                self.placements = assign(config, &ids)?;
            }
        }
        Ok(())
    }

    fn sources_changed(&mut self) -> (Option<ConfigChange>, Result<()>) {
        let change = self.registry.update_ids(self.ids());
        (change, self.rebind())
    }
}

pub struct VideoCompositor {
    width: u32,
    height: u32,
    background: Color,
    placeholder: Color,
    interval: Duration,
    state: Mutex<VideoState>,
    output: Arc<MediaTrack>,
    stream: Arc<MediaStream>,
    events: EventEmitter<ConfigChange>,
    running: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for VideoCompositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VideoCompositor")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sources", &state.sources.len())
            .field("config", &state.registry.current_id())
            .finish_non_exhaustive()
    }
}

impl VideoCompositor {
    pub fn new(config: &VideoConfig) -> Result<Self> {
        let output = MediaTrack::new(TrackKind::Video);
        Ok(Self {
            width: config.width,
            height: config.height,
            background: config.background.parse()?,
            placeholder: config.placeholder.parse()?,
            interval: config.frame_interval(),
            state: Mutex::new(VideoState::default()),
            stream: MediaStream::new(vec![Arc::clone(&output)]),
            output,
            events: EventEmitter::new(),
            running: Mutex::new(None),
        })
    }

    /// Notified with (current, previous) whenever the current configuration
    /// changes
    #[must_use]
    pub fn events(&self) -> &EventEmitter<ConfigChange> {
        &self.events
    }

    #[must_use]
    pub fn output_track(&self) -> Arc<MediaTrack> {
        Arc::clone(&self.output)
    }

    #[must_use]
    pub fn output_stream(&self) -> Arc<MediaStream> {
        Arc::clone(&self.stream)
    }

    #[must_use]
    pub fn current_config(&self) -> Option<String> {
        self.state.lock().registry.current_id().map(str::to_string)
    }

    /// Source ids in registration order
    #[must_use]
    pub fn source_ids(&self) -> Vec<String> {
        self.state.lock().ids()
    }

    pub fn add_config(&self, id: impl Into<String>, config: MixingConfiguration) -> Result<()> {
        self.update(|state| {
            let change = state.registry.add(id, config);
            (change, state.rebind())
        })
    }

    pub fn remove_config(&self, id: &str) -> Result<()> {
        self.update(|state| match state.registry.remove(id) {
            Ok(change) => (change, state.rebind()),
            Err(e) => (None, Err(e)),
        })
    }

    /// Use `id` until the source set or the registry changes again
    pub fn force_config(&self, id: &str) -> Result<()> {
        self.update(|state| match state.registry.force(id) {
            Ok(change) => (change, state.rebind()),
            Err(e) => (None, Err(e)),
        })
    }

    /// Apply a state change, then announce a configuration switch outside
    /// the lock
    fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut VideoState) -> (Option<ConfigChange>, Result<()>),
    {
        let (change, result) = f(&mut self.state.lock());
        if let Err(e) = &result {
            warn!(error = %e, "Failed to place video sources");
        }
        if let Some(change) = change {
            self.events.emit(change);
        }
        result
    }

    /// Draw one frame into the output track
    ///
    /// Returns `None` when no configuration is current, in which case the
    /// frame is only the default background.
    pub fn render(&self) -> Result<Option<RenderSnapshot>> {
        let current = {
            let state = self.state.lock();
            state.registry.current().map(|(id, config)| {
                let sources: IndexMap<String, Option<VideoFrame>> = state
                    .sources
                    .iter()
                    .map(|(id, source)| (id.clone(), source.drawable()))
                    .collect();
                (
                    id.to_string(),
                    Arc::clone(config),
                    state.ids(),
                    state.placements.clone(),
                    sources,
                )
            })
        };

        let mut buffer = FrameBuffer::new(self.width, self.height);
        let Some((config_id, config, ids, placements, sources)) = current else {
            buffer.fill(self.background);
            self.output.push_frame(buffer.snapshot());
            return Ok(None);
        };

        if let Some(paint) = config.paint_fn() {
            let sources: Vec<(String, Option<VideoFrame>)> = sources.into_iter().collect();
            paint(&sources, &mut buffer);
            self.output.push_frame(buffer.snapshot());
            return Ok(Some(RenderSnapshot {
                config: config_id,
                background: None,
                slots: Vec::new(),
            }));
        }

        let (width, height) = (f64::from(self.width), f64::from(self.height));
        let stats = |id: &str, draw_index: usize| RenderStats {
            width,
            height,
            id: id.to_string(),
            draw_index,
        };

        // Explicit z ascending, unset last, stable otherwise
        let mut order: Vec<(Option<f64>, &Placement)> = placements
            .iter()
            .enumerate()
            .map(|(index, placement)| {
                let z = placement
                    .position
                    .z_index
                    .as_ref()
                    .map(|z| z.resolve(&stats(&placement.id, index)));
                (z, placement)
            })
            .collect();
        order.sort_by(|(a, _), (b, _)| match (a, b) {
            (Some(a), Some(b)) => a.total_cmp(b),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });

        let background = config.background_for(&ids);
        buffer.fill(background);

        let mut slots = Vec::with_capacity(order.len());
        for (draw_index, (_, placement)) in order.into_iter().enumerate() {
            let rect = placement.position.rect(&stats(&placement.id, draw_index));
            let frame = sources.get(&placement.id).cloned().flatten();
            match &frame {
                Some(frame) => buffer.draw_image(frame, rect),
                None => buffer.fill_rect(rect, self.placeholder),
            }
            slots.push(RenderedSlot {
                id: placement.id.clone(),
                draw_index,
                rect,
                placeholder: frame.is_none(),
            });
        }

        self.output.push_frame(buffer.snapshot());
        Ok(Some(RenderSnapshot {
            config: config_id,
            background: Some(background),
            slots,
        }))
    }

    /// Render at the configured frame rate until [`stop`](Self::stop)
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
                    _ = ticker.tick() => {
                        let Some(compositor) = compositor.upgrade() else { break };
                        if let Err(e) = compositor.render() {
                            warn!(error = %e, "Failed to render video frame");
                        }
                    }
                }
            }
            debug!("Video rendering stopped");
        });
    }

    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
        }
    }
}

impl Drop for VideoCompositor {
    fn drop(&mut self) {
        self.stop();
        self.output.stop();
    }
}

impl MediaConsumer for VideoCompositor {
    /// Register a source; its first video track is drawn, a source without
    /// one is always a placeholder
    fn add_media(&self, media: Media, id: Option<&str>) -> Result<()> {
        let id = id.map_or_else(|| media.id(), str::to_string);
        let track = media.first_track(TrackKind::Video);
        debug!(source = %id, has_video = track.is_some(), "Added video source");
        self.update(|state| {
            state.sources.insert(id, Source { media, track });
            state.sources_changed()
        })
    }

    fn remove_media(&self, selector: &MediaSelector) -> Result<()> {
        self.update(|state| {
            let before = state.sources.len();
            state
                .sources
                .retain(|id, source| !selector.matches_media(&source.media, id));
            if state.sources.len() == before {
                return (None, Ok(()));
            }
            state.sources_changed()
        })
    }

    fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.state
            .lock()
            .sources
            .values()
            .flat_map(|source| source.media.tracks())
            .collect()
    }

    fn streams(&self) -> Vec<Arc<MediaStream>> {
        self.state
            .lock()
            .sources
            .values()
            .filter_map(|source| source.media.stream().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::solid_frame;
    use crate::layout::{presets, Position, Positions};
    use roomcast_core::error::Error;

    const RED: Color = Color::rgb(255, 0, 0);
    const BLUE: Color = Color::rgb(0, 0, 255);

    fn compositor() -> VideoCompositor {
        VideoCompositor::new(&VideoConfig {
            width: 64,
            height: 48,
            ..VideoConfig::default()
        })
        .unwrap()
    }

    fn camera(color: Color) -> Arc<MediaTrack> {
        let track = MediaTrack::new(TrackKind::Video);
        track.push_frame(solid_frame(16, 12, color));
        track
    }

    fn pixel(compositor: &VideoCompositor, x: u32, y: u32) -> Color {
        let frame = compositor.output_track().frame().unwrap();
        let image::Rgba([r, g, b, a]) = *frame.get_pixel(x, y);
        Color { r, g, b, a }
    }

    #[test]
    fn test_speaker_config_selected_over_grid_for_two_sources() {
        let compositor = compositor();
        let mut changes = compositor.events().subscribe();
        compositor.add_config("grid", presets::grid(0.0)).unwrap();
        compositor
            .add_config(
                "speaker",
                MixingConfiguration::new(Positions::Template(Position::new(0.0, 0.0, 1.0, 1.0)))
                    .applicable_when(|ids| !ids.is_empty())
                    .priority(1.0),
            )
            .unwrap();
        assert_eq!(compositor.current_config().as_deref(), Some("grid"));

        compositor.add_media(camera(RED).into(), Some("a")).unwrap();
        compositor.add_media(camera(BLUE).into(), Some("b")).unwrap();
        assert_eq!(compositor.current_config().as_deref(), Some("speaker"));

        assert_eq!(
            changes.try_recv().unwrap(),
            ConfigChange {
                current: Some("grid".to_string()),
                previous: None,
            }
        );
        assert_eq!(
            changes.try_recv().unwrap(),
            ConfigChange {
                current: Some("speaker".to_string()),
                previous: Some("grid".to_string()),
            }
        );
    }

    #[test]
    fn test_grid_render_draws_each_source() {
        let compositor = compositor();
        compositor.add_config("grid", presets::grid(0.0)).unwrap();
        compositor.add_media(camera(RED).into(), Some("a")).unwrap();
        compositor.add_media(camera(BLUE).into(), Some("b")).unwrap();

        let snapshot = compositor.render().unwrap().unwrap();
        assert_eq!(snapshot.config, "grid");
        assert_eq!(snapshot.background, Some(crate::layout::DEFAULT_BACKGROUND));
        assert_eq!(snapshot.slots.len(), 2);
        assert!(snapshot.slots.iter().all(|slot| !slot.placeholder));

        assert_eq!(pixel(&compositor, 10, 24), RED);
        assert_eq!(pixel(&compositor, 50, 24), BLUE);
    }

    #[test]
    fn test_muted_source_keeps_its_slot_as_placeholder() {
        let compositor = compositor();
        compositor.add_config("grid", presets::grid(0.0)).unwrap();
        let muted = camera(RED);
        muted.set_muted(true);
        compositor.add_media(muted.into(), Some("a")).unwrap();
        compositor.add_media(camera(BLUE).into(), Some("b")).unwrap();

        let snapshot = compositor.render().unwrap().unwrap();
        assert!(snapshot.slots[0].placeholder);
        assert!(!snapshot.slots[1].placeholder);
        assert_eq!(pixel(&compositor, 10, 24), Color::BLACK);
    }

    #[test]
    fn test_z_order_unset_draws_last() {
        let compositor = compositor();
        let full = || Position::new(0.0, 0.0, 64.0, 48.0);
        compositor
            .add_config(
                "stack",
                MixingConfiguration::new(Positions::List(vec![
                    full(),
                    full().with_z_index(5.0),
                    full().with_z_index(1.0),
                ])),
            )
            .unwrap();
        compositor.add_media(camera(RED).into(), Some("a")).unwrap();
        compositor.add_media(camera(BLUE).into(), Some("b")).unwrap();
        compositor
            .add_media(camera(Color::rgb(0, 255, 0)).into(), Some("c"))
            .unwrap();

        let snapshot = compositor.render().unwrap().unwrap();
        let drawn: Vec<&str> = snapshot.slots.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(drawn, vec!["c", "b", "a"]);
        assert_eq!(pixel(&compositor, 32, 24), RED);
    }

    #[test]
    fn test_placement_errors_surface_to_caller() {
        let compositor = compositor();
        compositor
            .add_config(
                "pinned",
                MixingConfiguration::new(Positions::Template(
                    Position::new(0.0, 0.0, 1.0, 1.0).with_id("host"),
                )),
            )
            .unwrap();

        let result = compositor.add_media(camera(RED).into(), Some("guest"));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_force_and_remove_config() {
        let compositor = compositor();
        compositor.add_config("line", presets::line(0.0)).unwrap();
        compositor
            .add_config("middle", presets::middle(0.0))
            .unwrap();
        compositor.add_media(camera(RED).into(), Some("a")).unwrap();
        assert_eq!(compositor.current_config().as_deref(), Some("line"));

        assert!(matches!(
            compositor.force_config("missing"),
            Err(Error::NotFound(_))
        ));
        compositor.remove_config("line").unwrap();
        assert_eq!(compositor.current_config(), None);
        assert!(compositor.render().unwrap().is_none());
        assert_eq!(pixel(&compositor, 0, 0), Color::rgb(20, 20, 20));
    }

    #[test]
    fn test_custom_paint_gets_the_frame() {
        let compositor = compositor();
        compositor
            .add_config(
                "custom",
                MixingConfiguration::custom(|sources, buffer| {
                    let color = if sources.len() == 1 { RED } else { BLUE };
                    buffer.fill(color);
                }),
            )
            .unwrap();
        compositor.add_media(camera(BLUE).into(), Some("a")).unwrap();

        let snapshot = compositor.render().unwrap().unwrap();
        assert!(snapshot.slots.is_empty());
        assert_eq!(pixel(&compositor, 0, 0), RED);
    }

    #[test]
    fn test_remove_media_by_source_id() {
        let compositor = compositor();
        compositor.add_config("grid", presets::grid(0.0)).unwrap();
        compositor.add_media(camera(RED).into(), Some("a")).unwrap();
        compositor.add_media(camera(BLUE).into(), Some("b")).unwrap();

        compositor
            .remove_media(&MediaSelector::Source("a".to_string()))
            .unwrap();
        assert_eq!(compositor.source_ids(), vec!["b".to_string()]);
        assert_eq!(compositor.tracks().len(), 1);
    }
}
