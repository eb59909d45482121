//! Mixing configurations
//!
//! A [`MixingConfiguration`] decides whether it can be used for a set of
//! source ids, how strongly it wants to be used, where every source is drawn
//! and what fills the background. Geometry values may be constants or
//! functions of [`RenderStats`], evaluated on every frame.

mod placement;
pub mod presets;
mod registry;

pub use placement::{assign, Placement};
pub use registry::{ConfigChange, ConfigRegistry};

use roomcast_core::error::{Error, Result};
use roomcast_core::media::VideoFrame;
use std::fmt;
use std::sync::Arc;

use crate::frame::{Color, FrameBuffer, Rect};

/// Fallback background of a configuration that does not set one
pub const DEFAULT_BACKGROUND: Color = Color::rgb(20, 20, 20);

/// What a position sees when it is resolved for one frame
#[derive(Debug, Clone, PartialEq)]
pub struct RenderStats {
    pub width: f64,
    pub height: f64,
    /// Source id assigned to the position
    pub id: String,
    /// Position in z-sorted drawing order
    pub draw_index: usize,
}

type StatsFn = Arc<dyn Fn(&RenderStats) -> f64 + Send + Sync>;
type IdsFn<T> = Arc<dyn Fn(&[String]) -> T + Send + Sync>;

/// A geometry field: fixed, or computed per frame
#[derive(Clone)]
pub enum Value {
    Fixed(f64),
    Dynamic(StatsFn),
}

impl Value {
    pub fn dynamic(f: impl Fn(&RenderStats) -> f64 + Send + Sync + 'static) -> Self {
        Self::Dynamic(Arc::new(f))
    }

    #[must_use]
    pub fn resolve(&self, stats: &RenderStats) -> f64 {
        match self {
            Self::Fixed(value) => *value,
            Self::Dynamic(f) => f(stats),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Fixed(value)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(value) => write!(f, "Fixed({value})"),
            Self::Dynamic(_) => f.write_str("Dynamic"),
        }
    }
}

/// Which source a position is bound to
#[derive(Clone, Default)]
pub enum Target {
    /// An explicit source id
    Id(IdsFn<String>),
    /// An index into the registration-ordered id list
    Index(IdsFn<usize>),
    /// The first source not yet placed
    #[default]
    Auto,
}

impl Target {
    /// Placement tier: ids first, then indices, then automatic
    pub(crate) const fn tier(&self) -> u8 {
        match self {
            Self::Id(_) => 0,
            Self::Index(_) => 1,
            Self::Auto => 2,
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Id(_) => "Id",
            Self::Index(_) => "Index",
            Self::Auto => "Auto",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Position {
    pub x: Value,
    pub y: Value,
    pub width: Value,
    pub height: Value,
    pub z_index: Option<Value>,
    pub target: Target,
}

impl Position {
    pub fn new(
        x: impl Into<Value>,
        y: impl Into<Value>,
        width: impl Into<Value>,
        height: impl Into<Value>,
    ) -> Self {
        Self {
            x: x.into(),
            y: y.into(),
            width: width.into(),
            height: height.into(),
            z_index: None,
            target: Target::Auto,
        }
    }

    #[must_use]
    pub fn with_z_index(mut self, z_index: impl Into<Value>) -> Self {
        self.z_index = Some(z_index.into());
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.target = Target::Id(Arc::new(move |_| id.clone()));
        self
    }

    #[must_use]
    pub fn with_id_fn(mut self, f: impl Fn(&[String]) -> String + Send + Sync + 'static) -> Self {
        self.target = Target::Id(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_index(mut self, index: usize) -> Self {
        self.target = Target::Index(Arc::new(move |_| index));
        self
    }

    #[must_use]
    pub fn with_index_fn(mut self, f: impl Fn(&[String]) -> usize + Send + Sync + 'static) -> Self {
        self.target = Target::Index(Arc::new(f));
        self
    }

    #[must_use]
    pub fn rect(&self, stats: &RenderStats) -> Rect {
        Rect::new(
            self.x.resolve(stats),
            self.y.resolve(stats),
            self.width.resolve(stats),
            self.height.resolve(stats),
        )
    }
}

type GeneratorFn = Arc<dyn Fn(&str, usize, &[String]) -> Position + Send + Sync>;

/// How a configuration produces one position per source
#[derive(Clone)]
pub enum Positions {
    /// The i-th entry serves the i-th source; too few entries is an error
    List(Vec<Position>),
    /// The same position for every source
    Template(Position),
    /// Called with (id, index, ids) for every source
    Generator(GeneratorFn),
}

impl Positions {
    pub fn generator(
        f: impl Fn(&str, usize, &[String]) -> Position + Send + Sync + 'static,
    ) -> Self {
        Self::Generator(Arc::new(f))
    }
}

impl fmt::Debug for Positions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::List(list) => f.debug_tuple("List").field(&list.len()).finish(),
            Self::Template(_) => f.write_str("Template"),
            Self::Generator(_) => f.write_str("Generator"),
        }
    }
}

#[derive(Clone)]
enum Computed<T> {
    Fixed(T),
    Ids(IdsFn<T>),
}

impl<T: Clone> Computed<T> {
    fn evaluate(&self, ids: &[String]) -> T {
        match self {
            Self::Fixed(value) => value.clone(),
            Self::Ids(f) => f(ids),
        }
    }
}

/// Source ids with their current drawable frame, `None` when the source is
/// muted, ended or has not produced a frame yet
pub type PaintSources = [(String, Option<VideoFrame>)];

pub type PaintFn = Arc<dyn Fn(&PaintSources, &mut FrameBuffer) + Send + Sync>;

#[derive(Clone)]
pub struct MixingConfiguration {
    applicable: Computed<bool>,
    priority: Computed<f64>,
    positions: Positions,
    background: Computed<Color>,
    paint: Option<PaintFn>,
}

impl fmt::Debug for MixingConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MixingConfiguration")
            .field("positions", &self.positions)
            .field("custom_paint", &self.paint.is_some())
            .finish_non_exhaustive()
    }
}

impl MixingConfiguration {
    /// Always applicable, priority 0, default background
    #[must_use]
    pub fn new(positions: Positions) -> Self {
        Self {
            applicable: Computed::Fixed(true),
            priority: Computed::Fixed(0.0),
            positions,
            background: Computed::Fixed(DEFAULT_BACKGROUND),
            paint: None,
        }
    }

    /// A configuration that draws whole frames itself
    pub fn custom(paint: impl Fn(&PaintSources, &mut FrameBuffer) + Send + Sync + 'static) -> Self {
        Self {
            paint: Some(Arc::new(paint)),
            ..Self::new(Positions::List(Vec::new()))
        }
    }

    #[must_use]
    pub fn applicable(mut self, applicable: bool) -> Self {
        self.applicable = Computed::Fixed(applicable);
        self
    }

    #[must_use]
    pub fn applicable_when(mut self, f: impl Fn(&[String]) -> bool + Send + Sync + 'static) -> Self {
        self.applicable = Computed::Ids(Arc::new(f));
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = Computed::Fixed(priority);
        self
    }

    #[must_use]
    pub fn priority_fn(mut self, f: impl Fn(&[String]) -> f64 + Send + Sync + 'static) -> Self {
        self.priority = Computed::Ids(Arc::new(f));
        self
    }

    #[must_use]
    pub fn background(mut self, color: Color) -> Self {
        self.background = Computed::Fixed(color);
        self
    }

    #[must_use]
    pub fn background_fn(mut self, f: impl Fn(&[String]) -> Color + Send + Sync + 'static) -> Self {
        self.background = Computed::Ids(Arc::new(f));
        self
    }

    #[must_use]
    pub fn is_applicable(&self, ids: &[String]) -> bool {
        self.applicable.evaluate(ids)
    }

    #[must_use]
    pub fn priority_for(&self, ids: &[String]) -> f64 {
        self.priority.evaluate(ids)
    }

    #[must_use]
    pub fn background_for(&self, ids: &[String]) -> Color {
        self.background.evaluate(ids)
    }

    #[must_use]
    pub fn paint_fn(&self) -> Option<&PaintFn> {
        self.paint.as_ref()
    }

    /// Position declared for the source `id` at `index` of `ids`
    pub fn position(&self, id: &str, index: usize, ids: &[String]) -> Result<Position> {
        match &self.positions {
            Positions::List(list) => list.get(index).cloned().ok_or_else(|| {
                Error::Configuration(format!(
                    "{} positions declared for {} sources",
                    list.len(),
                    ids.len()
                ))
            }),
            Positions::Template(position) => Ok(position.clone()),
            Positions::Generator(f) => Ok(f(id, index, ids)),
        }
    }
}
