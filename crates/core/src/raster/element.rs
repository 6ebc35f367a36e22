//! Cell value types a raster may hold

use num_traits::{NumCast, Zero};
use std::fmt::Debug;

/// On-disk sample layout used when a raster is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    U16,
    I16,
    I32,
    F32,
    F64,
}

/// Types that can be stored in a raster cell.
///
/// Masks are `u8` (0/1), imagery and elevation are `f32`.
pub trait RasterElement:
    Copy + Clone + Debug + PartialOrd + PartialEq + NumCast + Zero + Send + Sync + 'static
{
    /// Sample layout written by the GeoTIFF encoder
    const FORMAT: SampleFormat;

    /// No-data value used when the caller does not supply one
    fn default_nodata() -> Self;

    /// Whether this value is no-data (NaN always is for floats)
    fn is_nodata(&self, nodata: Option<Self>) -> bool;

    /// Whether this type is a floating point type
    fn is_float() -> bool {
        matches!(Self::FORMAT, SampleFormat::F32 | SampleFormat::F64)
    }

    /// Lossy conversion to f64
    fn to_f64(self) -> Option<f64> {
        NumCast::from(self)
    }

    /// Conversion from f64, `None` when the value does not fit
    fn from_f64(v: f64) -> Option<Self> {
        NumCast::from(v)
    }
}

macro_rules! int_element {
    ($t:ty, $fmt:expr, $nd:expr) => {
        impl RasterElement for $t {
            const FORMAT: SampleFormat = $fmt;

            fn default_nodata() -> Self {
                $nd
            }

            fn is_nodata(&self, nodata: Option<Self>) -> bool {
                nodata.map_or(false, |nd| *self == nd)
            }
        }
    };
}

macro_rules! float_element {
    ($t:ty, $fmt:expr) => {
        impl RasterElement for $t {
            const FORMAT: SampleFormat = $fmt;

            fn default_nodata() -> Self {
                <$t>::NAN
            }

            fn is_nodata(&self, nodata: Option<Self>) -> bool {
                if self.is_nan() {
                    return true;
                }
                match nodata {
                    Some(nd) if nd.is_nan() => false,
                    Some(nd) => (self - nd).abs() <= <$t>::EPSILON * nd.abs().max(1.0),
                    None => false,
                }
            }
        }
    };
}

int_element!(u8, SampleFormat::U8, 0);
int_element!(u16, SampleFormat::U16, 0);
int_element!(i16, SampleFormat::I16, i16::MIN);
int_element!(i32, SampleFormat::I32, -9999);
float_element!(f32, SampleFormat::F32);
float_element!(f64, SampleFormat::F64);
