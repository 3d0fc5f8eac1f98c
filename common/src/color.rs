//! Color temperature to RGB conversion.
//!
//! Piecewise fit of the black-body curve (Tanner Helland). Breakpoints and
//! coefficients are shared with the server-side preview and must not drift.

use serde::Serialize;

const KELVIN_DIVISOR: f32 = 100.0;
const CHANNEL_MAX: f32 = 255.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rgb {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Rgb {
    pub const BLACK: Self = Self {
        red: 0,
        green: 0,
        blue: 0,
    };

    /// Scales every channel by an 8-bit level the way NeoPixel strips apply
    /// global brightness.
    pub fn scaled(self, level: u8) -> Self {
        let scale = |channel: u8| ((u16::from(channel) * (u16::from(level) + 1)) >> 8) as u8;
        Self {
            red: scale(self.red),
            green: scale(self.green),
            blue: scale(self.blue),
        }
    }
}

pub fn kelvin_to_rgb(kelvin: u32) -> Rgb {
    let temp = kelvin as f32 / KELVIN_DIVISOR;

    let red = if temp <= 66.0 {
        CHANNEL_MAX
    } else {
        329.698_727_446 * (temp - 60.0).powf(-0.133_204_759_2)
    };

    let green = if temp <= 66.0 {
        99.470_802_586_1 * temp.ln() - 161.119_568_166_1
    } else {
        288.122_169_528_3 * (temp - 60.0).powf(-0.075_514_849_2)
    };

    let blue = if temp >= 66.0 {
        CHANNEL_MAX
    } else if temp <= 19.0 {
        0.0
    } else {
        138.517_731_223_1 * (temp - 10.0).ln() - 305.044_792_730_7
    };

    Rgb {
        red: to_channel(red),
        green: to_channel(green),
        blue: to_channel(blue),
    }
}

fn to_channel(value: f32) -> u8 {
    // NaN and -inf (ln of 0 K) saturate to 0.
    value.clamp(0.0, CHANNEL_MAX) as u8
}
