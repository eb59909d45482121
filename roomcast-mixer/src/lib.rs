//! Roomcast mixer
//!
//! Software compositing for a mixing hub or a local preview: audio level
//! analysis and speech activity detection, mixing configurations with their
//! placement rules, and the video and audio compositors that turn many
//! sources into one output stream.

pub mod activity;
pub mod audio;
pub mod frame;
pub mod layout;
pub mod levels;
pub mod placeholder;
pub mod video;

pub use activity::{ActivityDetector, ActivityEvent};
pub use audio::AudioCompositor;
pub use frame::{Color, FrameBuffer, Rect};
pub use layout::{presets, ConfigChange, MixingConfiguration, Position, Positions, Value};
pub use levels::{LevelSource, LevelStats};
pub use placeholder::{PlaceholderMedia, PlaceholderOptions};
pub use video::{RenderSnapshot, VideoCompositor};
