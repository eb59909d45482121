//! RGBA drawing surface used by the video compositor

use image::{imageops, Rgba, RgbaImage};
use roomcast_core::error::{Error, Result};
use roomcast_core::media::VideoFrame;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Self = Self::rgb(0, 0, 0);

    #[must_use]
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    #[must_use]
    pub const fn to_rgba(self) -> Rgba<u8> {
        Rgba([self.r, self.g, self.b, self.a])
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::BLACK
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.a == 255 {
            write!(f, "rgb({},{},{})", self.r, self.g, self.b)
        } else {
            let alpha = f64::from(self.a) / 255.0;
            write!(f, "rgba({},{},{},{alpha:.2})", self.r, self.g, self.b)
        }
    }
}

impl FromStr for Color {
    type Err = Error;

    /// Accepts `rgb(r,g,b)`, `rgba(r,g,b,a)` with alpha in [0, 1],
    /// `#rrggbb` and `#rgb`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || Error::Configuration(format!("invalid colour {s:?}"));

        if let Some(hex) = s.strip_prefix('#') {
            if !hex.is_ascii() {
                return Err(invalid());
            }
            let channel = |text: &str| u8::from_str_radix(text, 16).map_err(|_| invalid());
            return match hex.len() {
                6 => Ok(Self::rgb(
                    channel(&hex[0..2])?,
                    channel(&hex[2..4])?,
                    channel(&hex[4..6])?,
                )),
                3 => {
                    let short = |i: usize| channel(&hex[i..=i]).map(|v| v * 17);
                    Ok(Self::rgb(short(0)?, short(1)?, short(2)?))
                }
                _ => Err(invalid()),
            };
        }

        let (body, with_alpha) = if let Some(body) = s.strip_prefix("rgba(") {
            (body, true)
        } else if let Some(body) = s.strip_prefix("rgb(") {
            (body, false)
        } else {
            return Err(invalid());
        };
        let parts: Vec<&str> = body
            .strip_suffix(')')
            .ok_or_else(invalid)?
            .split(',')
            .map(str::trim)
            .collect();
        if parts.len() != if with_alpha { 4 } else { 3 } {
            return Err(invalid());
        }

        let channel = |text: &str| text.parse::<u8>().map_err(|_| invalid());
        let a = if with_alpha {
            let alpha: f64 = parts[3].parse().map_err(|_| invalid())?;
            if !(0.0..=1.0).contains(&alpha) {
                return Err(invalid());
            }
            (alpha * 255.0).round() as u8
        } else {
            255
        };

        Ok(Self {
            r: channel(parts[0])?,
            g: channel(parts[1])?,
            b: channel(parts[2])?,
            a,
        })
    }
}

/// Axis-aligned rectangle in output pixels
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    #[must_use]
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Integer pixel bounds clipped to a `width` x `height` surface
    fn clip(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.round().max(0.0);
        let y0 = self.y.round().max(0.0);
        let x1 = (self.x + self.width).round().min(f64::from(width));
        let y1 = (self.y + self.height).round().min(f64::from(height));
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

pub struct FrameBuffer {
    image: RgbaImage,
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .finish()
    }
}

impl FrameBuffer {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
        }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn fill(&mut self, color: Color) {
        let pixel = color.to_rgba();
        for p in self.image.pixels_mut() {
            *p = pixel;
        }
    }

    pub fn fill_rect(&mut self, rect: Rect, color: Color) {
        let Some((x, y, w, h)) = rect.clip(self.width(), self.height()) else {
            return;
        };
        let pixel = color.to_rgba();
        for py in y..y + h {
            for px in x..x + w {
                self.image.put_pixel(px, py, pixel);
            }
        }
    }

    /// Scale `frame` to `rect` and draw it over the current contents
    ///
    /// Only the part of `rect` that lands on the buffer is resampled, so an
    /// oversized rect costs no more than the buffer itself.
    pub fn draw_image(&mut self, frame: &RgbaImage, rect: Rect) {
        if rect.width < 1.0 || rect.height < 1.0 || frame.width() == 0 || frame.height() == 0 {
            return;
        }
        let Some((x, y, w, h)) = rect.clip(self.width(), self.height()) else {
            return;
        };

        // Source pixels per destination pixel on each axis
        let scale_x = f64::from(frame.width()) / rect.width;
        let scale_y = f64::from(frame.height()) / rect.height;
        let src_x = ((f64::from(x) - rect.x) * scale_x).floor().max(0.0) as u32;
        let src_y = ((f64::from(y) - rect.y) * scale_y).floor().max(0.0) as u32;
        let src_x = src_x.min(frame.width() - 1);
        let src_y = src_y.min(frame.height() - 1);
        let src_w = ((f64::from(w) * scale_x).ceil() as u32).clamp(1, frame.width() - src_x);
        let src_h = ((f64::from(h) * scale_y).ceil() as u32).clamp(1, frame.height() - src_y);

        let visible = imageops::crop_imm(frame, src_x, src_y, src_w, src_h).to_image();
        let scaled = if visible.width() == w && visible.height() == h {
            visible
        } else {
            imageops::resize(&visible, w, h, imageops::FilterType::Triangle)
        };
        imageops::overlay(&mut self.image, &scaled, i64::from(x), i64::from(y));
    }

    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<Color> {
        (x < self.width() && y < self.height()).then(|| {
            let Rgba([r, g, b, a]) = *self.image.get_pixel(x, y);
            Color { r, g, b, a }
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> VideoFrame {
        Arc::new(self.image.clone())
    }
}

/// A `width` x `height` frame filled with one colour
#[must_use]
pub fn solid_frame(width: u32, height: u32, color: Color) -> VideoFrame {
    Arc::new(RgbaImage::from_pixel(width, height, color.to_rgba()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_colours() {
        assert_eq!("rgb(20,20,20)".parse::<Color>().unwrap(), Color::rgb(20, 20, 20));
        assert_eq!(
            "rgba(100, 200, 250, 0.5)".parse::<Color>().unwrap(),
            Color {
                r: 100,
                g: 200,
                b: 250,
                a: 128
            }
        );
        assert_eq!("#ff8000".parse::<Color>().unwrap(), Color::rgb(255, 128, 0));
        assert_eq!("#0f0".parse::<Color>().unwrap(), Color::rgb(0, 255, 0));

        for bad in ["rgb(1,2)", "rgb(300,0,0)", "#12345", "blue", "rgba(1,2,3,2)"] {
            assert!(bad.parse::<Color>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_display_matches_parse() {
        let color = Color::rgb(100, 200, 250);
        assert_eq!(color.to_string(), "rgb(100,200,250)");
        assert_eq!(color.to_string().parse::<Color>().unwrap(), color);
    }

    #[test]
    fn test_fill_rect_is_clipped() {
        let mut buffer = FrameBuffer::new(10, 10);
        buffer.fill(Color::BLACK);
        buffer.fill_rect(Rect::new(5.0, 5.0, 20.0, 20.0), Color::rgb(255, 0, 0));

        assert_eq!(buffer.pixel(4, 4), Some(Color::BLACK));
        assert_eq!(buffer.pixel(9, 9), Some(Color::rgb(255, 0, 0)));
        assert_eq!(buffer.pixel(10, 10), None);

        buffer.fill_rect(Rect::new(-5.0, -5.0, 2.0, 2.0), Color::rgb(0, 255, 0));
        assert_eq!(buffer.pixel(0, 0), Some(Color::BLACK));
    }

    #[test]
    fn test_draw_image_scales_into_rect() {
        let mut buffer = FrameBuffer::new(8, 8);
        buffer.fill(Color::BLACK);
        let source = solid_frame(2, 2, Color::rgb(0, 0, 255));
        buffer.draw_image(&source, Rect::new(4.0, 0.0, 4.0, 4.0));

        assert_eq!(buffer.pixel(5, 2), Some(Color::rgb(0, 0, 255)));
        assert_eq!(buffer.pixel(2, 2), Some(Color::BLACK));
        assert_eq!(buffer.pixel(5, 6), Some(Color::BLACK));
    }

    #[test]
    fn test_draw_image_with_huge_rect_only_fills_the_buffer() {
        let mut buffer = FrameBuffer::new(64, 64);
        buffer.fill(Color::BLACK);
        let source = solid_frame(16, 16, Color::rgb(0, 255, 0));
        buffer.draw_image(&source, Rect::new(-50_000.0, -50_000.0, 100_000.0, 100_000.0));

        assert_eq!(buffer.pixel(0, 0), Some(Color::rgb(0, 255, 0)));
        assert_eq!(buffer.pixel(63, 63), Some(Color::rgb(0, 255, 0)));
    }

    #[test]
    fn test_draw_image_crops_the_source_to_the_visible_part() {
        let mut buffer = FrameBuffer::new(64, 64);
        buffer.fill(Color::BLACK);
        let mut source = RgbaImage::from_pixel(2, 1, Color::rgb(255, 0, 0).to_rgba());
        source.put_pixel(1, 0, Color::rgb(0, 255, 0).to_rgba());

        // Left half hangs off the buffer, so only the green column shows
        buffer.draw_image(&source, Rect::new(-64.0, 0.0, 128.0, 64.0));
        assert_eq!(buffer.pixel(0, 0), Some(Color::rgb(0, 255, 0)));
        assert_eq!(buffer.pixel(63, 32), Some(Color::rgb(0, 255, 0)));
    }
}
