//! Radar moment products and their quantization parameters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A decodable radar moment.
///
/// The serialized (and on-disk) names are the snake_case strings used in
/// configuration files and directory paths, e.g. `"reflectivity"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Product {
    Reflectivity,
    Velocity,
    SpectrumWidth,
    DifferentialReflectivity,
    DifferentialPhase,
    CorrelationCoefficient,
}

/// Value range used when packing a product into `u8` grid cells.
///
/// Quantization clamps to `[min, max]`, maps linearly onto `[0, 255]`
/// and rounds to nearest. Cell value 0 doubles as the "empty" sentinel,
/// so a stored non-empty cell is always in `1..=255`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
    pub min: f32,
    pub max: f32,
}

impl Product {
    /// All products, in moment-table order.
    pub const ALL: [Product; 6] = [
        Product::Reflectivity,
        Product::Velocity,
        Product::SpectrumWidth,
        Product::DifferentialReflectivity,
        Product::DifferentialPhase,
        Product::CorrelationCoefficient,
    ];

    /// Directory / config name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Product::Reflectivity => "reflectivity",
            Product::Velocity => "velocity",
            Product::SpectrumWidth => "spectrum_width",
            Product::DifferentialReflectivity => "differential_reflectivity",
            Product::DifferentialPhase => "differential_phase",
            Product::CorrelationCoefficient => "correlation_coefficient",
        }
    }

    /// Returns true if a Message 31 moment-block name carries this
    /// product. Block names are 3 ASCII bytes; spectrum width is "SW "
    /// and matches on its first two bytes only.
    pub fn matches_block(&self, name: &[u8; 3]) -> bool {
        match self {
            Product::Reflectivity => name == b"REF",
            Product::Velocity => name == b"VEL",
            Product::SpectrumWidth => &name[..2] == b"SW",
            Product::DifferentialReflectivity => name == b"ZDR",
            Product::DifferentialPhase => name == b"PHI",
            Product::CorrelationCoefficient => name == b"RHO",
        }
    }

    /// Quantization range for grid storage.
    pub fn quant_params(&self) -> QuantParams {
        let (min, max) = match self {
            Product::Reflectivity => (-32.0, 94.5),
            Product::Velocity => (-100.0, 100.0),
            Product::SpectrumWidth => (0.0, 64.0),
            Product::DifferentialReflectivity => (-8.0, 8.0),
            Product::DifferentialPhase => (0.0, 360.0),
            Product::CorrelationCoefficient => (0.0, 1.1),
        };
        QuantParams { min, max }
    }

    /// Lowest physically meaningful value; decoded samples below this
    /// are dropped before they reach a grid. Only reflectivity has one.
    pub fn validity_floor(&self) -> Option<f32> {
        match self {
            Product::Reflectivity => Some(-32.0),
            _ => None,
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Product {
    type Err = crate::error::LeveliiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reflectivity" => Ok(Product::Reflectivity),
            "velocity" => Ok(Product::Velocity),
            "spectrum_width" => Ok(Product::SpectrumWidth),
            "differential_reflectivity" => Ok(Product::DifferentialReflectivity),
            "differential_phase" => Ok(Product::DifferentialPhase),
            // Both names appear in the wild for RHO.
            "correlation_coefficient" | "cross_correlation_ratio" => {
                Ok(Product::CorrelationCoefficient)
            }
            other => Err(crate::error::LeveliiError::Config(format!(
                "unknown product '{other}'"
            ))),
        }
    }
}

/// Quantize a physical value into a `u8` grid cell.
pub fn quantize(value: f32, params: QuantParams) -> u8 {
    let range = params.max - params.min;
    let normalized = ((value - params.min) / range).clamp(0.0, 1.0);
    (normalized * 255.0).round() as u8
}

/// Inverse of [`quantize`]. Round-trip error is bounded by one quantum,
/// `(max - min) / 255`.
pub fn dequantize(cell: u8, params: QuantParams) -> f32 {
    params.min + (cell as f32 / 255.0) * (params.max - params.min)
}

/// Round a decoded moment value to one decimal. Applied to every sample
/// before it is binned so equal gates compare equal across radials.
pub fn round_tenth(value: f32) -> f32 {
    (value * 10.0).round() * 0.1
}
