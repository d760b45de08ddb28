//! RGB/HSV conversions shared by the bulb adapters.
//!
//! Tapo expresses color as hue/saturation, Tuya as a packed HSV hex string;
//! the model itself only speaks RGB.

use serde::{Deserialize, Serialize};

/// 8-bit RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Converts to hue (0–359 degrees), saturation and value (0.0–1.0).
    #[must_use]
    pub fn to_hsv(self) -> Hsv {
        let r = f64::from(self.r) / 255.0;
        let g = f64::from(self.g) / 255.0;
        let b = f64::from(self.b) / 255.0;

        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let diff = max - min;

        let hue = if diff == 0.0 {
            0.0
        } else if max == r {
            (60.0 * ((g - b) / diff) + 360.0) % 360.0
        } else if max == g {
            (60.0 * ((b - r) / diff) + 120.0) % 360.0
        } else {
            (60.0 * ((r - g) / diff) + 240.0) % 360.0
        };

        let saturation = if max == 0.0 { 0.0 } else { diff / max };

        Hsv {
            h: (hue.round() as u16) % 360,
            s: saturation,
            v: max,
        }
    }
}

/// Hue in degrees, saturation and value as fractions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hsv {
    pub h: u16,
    pub s: f64,
    pub v: f64,
}

impl Hsv {
    #[must_use]
    pub fn to_rgb(self) -> Rgb {
        let h = f64::from(self.h % 360);
        let s = self.s.clamp(0.0, 1.0);
        let v = self.v.clamp(0.0, 1.0);

        let c = v * s;
        let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
        let m = v - c;

        let (r, g, b) = match h as u16 {
            0..=59 => (c, x, 0.0),
            60..=119 => (x, c, 0.0),
            120..=179 => (0.0, c, x),
            180..=239 => (0.0, x, c),
            240..=299 => (x, 0.0, c),
            _ => (c, 0.0, x),
        };

        let channel = |value: f64| ((value + m) * 255.0).round().clamp(0.0, 255.0) as u8;
        Rgb::new(channel(r), channel(g), channel(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_colors_map_to_expected_hues() {
        assert_eq!(Rgb::new(255, 0, 0).to_hsv().h, 0);
        assert_eq!(Rgb::new(0, 255, 0).to_hsv().h, 120);
        assert_eq!(Rgb::new(0, 0, 255).to_hsv().h, 240);
    }

    #[test]
    fn white_has_no_saturation() {
        let hsv = Rgb::new(255, 255, 255).to_hsv();
        assert_eq!(hsv.s, 0.0);
        assert_eq!(hsv.v, 1.0);
    }

    #[test]
    fn hsv_to_rgb_recovers_saturated_colors() {
        let orange = Rgb::new(255, 128, 0);
        assert_eq!(orange.to_hsv().to_rgb(), Rgb::new(255, 128, 0));

        let teal = Hsv { h: 180, s: 1.0, v: 0.5 }.to_rgb();
        assert_eq!(teal, Rgb::new(0, 128, 128));
    }
}
