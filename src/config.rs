//! Configuration types for nano-rope.

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default RoPE base (theta) used by GPT-NeoX and LLaMA-style models.
pub const DEFAULT_ROPE_BASE: f64 = 10_000.0;

/// Storage format of the final cos/sin tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    #[default]
    F16,
    Bf16,
    F64,
}

impl Precision {
    /// Tensor dtype the tables are stored in.
    pub fn dtype(self) -> DType {
        match self {
            Precision::F32 => DType::F32,
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
            Precision::F64 => DType::F64,
        }
    }

    /// Dtype used for the angle and trigonometric computation.
    ///
    /// Narrow formats are computed in `f32` and only converted at the end.
    pub fn compute_dtype(self) -> DType {
        match self {
            Precision::F64 => DType::F64,
            _ => DType::F32,
        }
    }
}

/// Rotary embedding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotaryConfig {
    /// Rotated feature dimension (must be even).
    pub dim: usize,
    /// Base of the geometric frequency progression.
    #[serde(default = "default_base")]
    pub base: f64,
    /// Storage precision of the cos/sin tables.
    #[serde(default)]
    pub precision: Precision,
    /// Train the inverse frequencies instead of keeping them fixed.
    #[serde(default)]
    pub learnable: bool,
}

fn default_base() -> f64 {
    DEFAULT_ROPE_BASE
}

impl RotaryConfig {
    /// Creates a validated configuration with default base and precision.
    pub fn new(dim: usize) -> Result<Self> {
        Self {
            dim,
            base: DEFAULT_ROPE_BASE,
            precision: Precision::default(),
            learnable: false,
        }
        .validated()
    }

    /// Set the frequency base.
    pub fn with_base(mut self, base: f64) -> Result<Self> {
        self.base = base;
        self.validated()
    }

    /// Set the table precision.
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// Mark the inverse frequencies as trainable.
    pub fn with_learnable(mut self, learnable: bool) -> Self {
        self.learnable = learnable;
        self
    }

    /// Parses and validates a JSON document.
    ///
    /// Only `dim` is required; `base`, `precision` and `learnable` fall back to
    /// their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validated()
    }

    /// Number of rotated dimension pairs (`dim / 2`).
    pub fn half_dim(&self) -> usize {
        self.dim / 2
    }

    /// Checks the invariants every other component relies on.
    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(Error::Config("rotary dim must be greater than zero".into()));
        }
        if !self.dim.is_multiple_of(2) {
            return Err(Error::Config(format!(
                "rotary dim must be even, got {}",
                self.dim
            )));
        }
        if !self.base.is_finite() || self.base <= 0.0 {
            return Err(Error::Config(format!(
                "rotary base must be a positive finite number, got {}",
                self.base
            )));
        }
        Ok(())
    }

    fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }
}
