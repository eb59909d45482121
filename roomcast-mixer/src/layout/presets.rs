//! Ready-made mixing configurations

use std::sync::Arc;

use super::{MixingConfiguration, Position, Positions, RenderStats, Value};
use crate::activity::ActivityDetector;
use crate::frame::Color;

/// Rows and columns for `count` tiles: the factor pair closest to a square,
/// rows never exceeding columns
#[must_use]
pub fn grid_shape(count: usize) -> (usize, usize) {
    if count == 0 {
        return (0, 0);
    }
    let rows = (1..=count)
        .take_while(|r| r * r <= count)
        .filter(|r| count % r == 0)
        .last()
        .unwrap_or(1);
    (rows, count / rows)
}

/// Tiles in a grid; applicable while the grid is at most two columns wider
/// than it is tall
#[must_use]
pub fn grid(priority: f64) -> MixingConfiguration {
    MixingConfiguration::new(Positions::generator(|_, index, ids| {
        let (rows, columns) = grid_shape(ids.len());
        let (rows, columns) = (rows.max(1) as f64, columns.max(1) as f64);
        let column = (index as f64 % columns).floor();
        let row = (index as f64 / columns).floor();
        Position::new(
            Value::dynamic(move |s| column * s.width / columns),
            Value::dynamic(move |s| row * s.height / rows),
            Value::dynamic(move |s| s.width / columns),
            Value::dynamic(move |s| s.height / rows),
        )
    }))
    .applicable_when(|ids| {
        let (rows, columns) = grid_shape(ids.len());
        columns - rows <= 2
    })
    .priority(priority)
}

/// Side by side at full height, for fewer than three sources
#[must_use]
pub fn line(priority: f64) -> MixingConfiguration {
    MixingConfiguration::new(Positions::generator(|_, index, ids| {
        let count = ids.len().max(1) as f64;
        let index = index as f64;
        Position::new(
            Value::dynamic(move |s| index * s.width / count),
            0.0,
            Value::dynamic(move |s| s.width / count),
            Value::dynamic(|s| s.height),
        )
    }))
    .applicable_when(|ids| ids.len() < 3)
    .priority(priority)
}

/// A 2x2 grid with the fifth source centred on top; exactly five sources
#[must_use]
pub fn middle(priority: f64) -> MixingConfiguration {
    let half_width = || Value::dynamic(|s| s.width / 2.0);
    let half_height = || Value::dynamic(|s| s.height / 2.0);
    let quadrant = |x: Value, y: Value| Position::new(x, y, half_width(), half_height());

    MixingConfiguration::new(Positions::List(vec![
        quadrant(Value::Fixed(0.0), Value::Fixed(0.0)),
        quadrant(half_width(), Value::Fixed(0.0)),
        quadrant(Value::Fixed(0.0), half_height()),
        quadrant(half_width(), half_height()),
        quadrant(
            Value::dynamic(|s| s.width / 4.0),
            Value::dynamic(|s| s.height / 4.0),
        ),
    ]))
    .applicable_when(|ids| ids.len() == 5)
    .priority(priority)
}

const SILENCE_OFFSET: f64 = 2.0;
const NOISE_OFFSET: f64 = 5.0;
const THUMBNAIL_WIDTH: f64 = 80.0;
const THUMBNAIL_HEIGHT: f64 = 60.0;
const THUMBNAIL_OFFSET: f64 = 5.0;

const SILENT_BACKGROUND: Color = Color::rgb(0, 0, 0);
const SPEAKING_BACKGROUND: Color = Color::rgb(100, 200, 250);

/// The last speaker fills the frame, everyone else is a thumbnail along the
/// bottom edge. The margin around the speaker and the background colour show
/// whether anyone is speaking right now.
#[must_use]
pub fn speaker(detector: Arc<ActivityDetector>, priority: f64) -> MixingConfiguration {
    let featured = {
        let detector = Arc::clone(&detector);
        move |s: &RenderStats| match detector.last_speaker() {
            Some(last) => last == s.id,
            None => s.draw_index == 0,
        }
    };
    let margin = {
        let detector = Arc::clone(&detector);
        move || {
            if detector.is_silent() {
                SILENCE_OFFSET
            } else {
                NOISE_OFFSET
            }
        }
    };

    let x = {
        let (featured, margin) = (featured.clone(), margin.clone());
        Value::dynamic(move |s| {
            if featured(s) {
                margin()
            } else {
                THUMBNAIL_OFFSET + s.draw_index.saturating_sub(1) as f64 * THUMBNAIL_WIDTH
            }
        })
    };
    let y = {
        let (featured, margin) = (featured.clone(), margin.clone());
        Value::dynamic(move |s| {
            if featured(s) {
                margin()
            } else {
                s.height - THUMBNAIL_HEIGHT - NOISE_OFFSET
            }
        })
    };
    let width = {
        let (featured, margin) = (featured.clone(), margin.clone());
        Value::dynamic(move |s| {
            if featured(s) {
                s.width - 2.0 * margin()
            } else {
                THUMBNAIL_WIDTH
            }
        })
    };
    let height = {
        let featured = featured.clone();
        Value::dynamic(move |s| {
            if featured(s) {
                s.height - 2.0 * margin()
            } else {
                THUMBNAIL_HEIGHT
            }
        })
    };
    let z_index = Value::dynamic(move |s| if featured(s) { 0.0 } else { 1.0 });

    MixingConfiguration::new(Positions::Template(
        Position::new(x, y, width, height).with_z_index(z_index),
    ))
    .background_fn(move |_| {
        if detector.is_silent() {
            SILENT_BACKGROUND
        } else {
            SPEAKING_BACKGROUND
        }
    })
    .priority(priority)
}
