// THEORY (single-pixel color heuristics):
// The candidate builder votes over several independent signal channels. The
// ones that need more than a luma value are computed here, one pixel at a
// time, with no knowledge of neighbors:
// - saturation (HSV, 0..255 like most imaging toolkits)
// - hue angle in degrees [0, 360)
// - the chromatic a*/b* pair of CIE L*a*b* (D65), used for stain deviation
//
// Lab needs linear light. The sRGB -> linear conversion uses a 256-entry
// `OnceLock` LUT so the hot path is a table lookup and a multiply.

pub mod pixel {
    use std::sync::OnceLock;

    pub type Channel = u8;
    pub type NormalizedChannel = f32;
    pub type Hue = f32;

    static SRGB_TO_LINEAR_LUT: OnceLock<[NormalizedChannel; 256]> = OnceLock::new();

    // D65 reference white.
    const WHITE_X: f32 = 0.950_47;
    const WHITE_Y: f32 = 1.0;
    const WHITE_Z: f32 = 1.088_83;

    /// A "dumb" RGB sample with the color heuristics the cue builder needs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Pixel {
        pub red: Channel,
        pub green: Channel,
        pub blue: Channel,
    }

    impl Pixel {
        pub fn new(red: Channel, green: Channel, blue: Channel) -> Self {
            Self { red, green, blue }
        }

        pub fn from_rgb(rgb: &image::Rgb<u8>) -> Self {
            Self::new(rgb[0], rgb[1], rgb[2])
        }

        #[inline]
        fn srgb_to_linear(value: Channel) -> NormalizedChannel {
            let table = SRGB_TO_LINEAR_LUT.get_or_init(|| {
                let mut table = [0.0f32; 256];
                for (i, slot) in table.iter_mut().enumerate() {
                    let srgb = i as NormalizedChannel / 255.0;
                    *slot = if srgb <= 0.04045 {
                        srgb / 12.92
                    } else {
                        ((srgb + 0.055) / 1.055).powf(2.4)
                    };
                }
                table
            });
            table[value as usize]
        }

        /// HSV saturation scaled to 0..255.
        pub fn saturation(&self) -> u8 {
            let max = self.red.max(self.green).max(self.blue);
            let min = self.red.min(self.green).min(self.blue);
            if max == 0 {
                return 0;
            }
            ((max - min) as u32 * 255 / max as u32) as u8
        }

        /// Hue angle in degrees [0, 360), computed on gamma-encoded channels.
        pub fn hue(&self) -> Hue {
            let r = self.red as f32 / 255.0;
            let g = self.green as f32 / 255.0;
            let b = self.blue as f32 / 255.0;
            let max = r.max(g.max(b));
            let min = r.min(g.min(b));
            let chroma = max - min;
            if chroma <= 1e-6 {
                return 0.0;
            }

            let (difference, sector) = if max == r {
                (g - b, 0.0)
            } else if max == g {
                (b - r, 2.0)
            } else {
                (r - g, 4.0)
            };

            let mut hue = (difference / chroma + sector) * 60.0;
            if hue < 0.0 {
                hue += 360.0;
            }
            hue
        }

        /// The a*/b* chromatic coordinates of CIE L*a*b*.
        pub fn lab_ab(&self) -> (f32, f32) {
            let r = Self::srgb_to_linear(self.red);
            let g = Self::srgb_to_linear(self.green);
            let b = Self::srgb_to_linear(self.blue);

            let x = (0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b) / WHITE_X;
            let y = (0.212_672_9 * r + 0.715_152_2 * g + 0.072_175 * b) / WHITE_Y;
            let z = (0.019_333_9 * r + 0.119_192 * g + 0.950_304_1 * b) / WHITE_Z;

            let (fx, fy, fz) = (lab_f(x), lab_f(y), lab_f(z));
            (500.0 * (fx - fy), 200.0 * (fy - fz))
        }
    }

    #[inline]
    fn lab_f(t: f32) -> f32 {
        const EPSILON: f32 = 216.0 / 24389.0;
        const KAPPA: f32 = 24389.0 / 27.0;
        if t > EPSILON {
            t.cbrt()
        } else {
            (KAPPA * t + 16.0) / 116.0
        }
    }

    /// Smallest angle between two hues, in degrees.
    pub fn hue_distance(a: Hue, b: Hue) -> Hue {
        let d = (a - b).abs() % 360.0;
        d.min(360.0 - d)
    }
}
