//! Robust kernels applied to edge residuals.
//!
//! A kernel maps the squared Mahalanobis error `e² = rᵀ Ω r` to `ρ(e²)`.
//! The optimizer scales the whitened residual by `sqrt(ρ(e²) / e²)` so the
//! least-squares cost becomes `Σ ρ(e²)`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SlamError};

/// Bounded-influence loss with its scale parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "delta")]
pub enum RobustKernel {
    Huber(f64),
    PseudoHuber(f64),
    Cauchy(f64),
    Tukey(f64),
    Welsch(f64),
    Fair(f64),
    Dcs(f64),
    Saturated(f64),
}

impl RobustKernel {
    /// Build a kernel from its configuration name.
    ///
    /// `"NONE"` (any case) yields `Ok(None)`.
    pub fn from_name(name: &str, delta: f64) -> Result<Option<Self>> {
        let kernel = match name.to_ascii_lowercase().as_str() {
            "none" | "" => return Ok(None),
            "huber" => Self::Huber(delta),
            "pseudohuber" => Self::PseudoHuber(delta),
            "cauchy" => Self::Cauchy(delta),
            "tukey" => Self::Tukey(delta),
            "welsch" => Self::Welsch(delta),
            "fair" => Self::Fair(delta),
            "dcs" => Self::Dcs(delta),
            "saturated" => Self::Saturated(delta),
            _ => return Err(SlamError::UnknownKernel(name.to_string())),
        };
        Ok(Some(kernel))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Huber(_) => "Huber",
            Self::PseudoHuber(_) => "PseudoHuber",
            Self::Cauchy(_) => "Cauchy",
            Self::Tukey(_) => "Tukey",
            Self::Welsch(_) => "Welsch",
            Self::Fair(_) => "Fair",
            Self::Dcs(_) => "DCS",
            Self::Saturated(_) => "Saturated",
        }
    }

    /// Robustified cost `ρ(e²)`.
    pub fn rho(&self, e2: f64) -> f64 {
        match *self {
            Self::Huber(delta) => {
                let d2 = delta * delta;
                if e2 <= d2 {
                    e2
                } else {
                    2.0 * e2.sqrt() * delta - d2
                }
            }
            Self::PseudoHuber(delta) => {
                let d2 = delta * delta;
                2.0 * d2 * ((1.0 + e2 / d2).sqrt() - 1.0)
            }
            Self::Cauchy(delta) => {
                let d2 = delta * delta;
                d2 * (e2 / d2 + 1.0).ln()
            }
            Self::Tukey(delta) => {
                let d2 = delta * delta;
                if e2 <= d2 {
                    let aux = 1.0 - e2 / d2;
                    d2 * (1.0 - aux * aux * aux) / 3.0
                } else {
                    d2 / 3.0
                }
            }
            Self::Welsch(delta) => {
                let d2 = delta * delta;
                d2 * (1.0 - (-e2 / d2).exp())
            }
            Self::Fair(delta) => {
                let ratio = e2.sqrt() / delta;
                2.0 * delta * delta * (ratio - (1.0 + ratio).ln())
            }
            Self::Dcs(phi) => {
                if e2 <= phi {
                    e2
                } else {
                    let scale = 2.0 * phi / (phi + e2);
                    scale * scale * e2
                }
            }
            Self::Saturated(delta) => e2.min(delta * delta),
        }
    }

    /// Factor applied to a whitened residual with squared norm `e2`.
    pub fn residual_scale(&self, e2: f64) -> f64 {
        if e2 <= f64::EPSILON {
            return 1.0;
        }
        (self.rho(e2).max(0.0) / e2).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_from_name() {
        assert_eq!(RobustKernel::from_name("NONE", 1.0).unwrap(), None);
        assert_eq!(
            RobustKernel::from_name("Huber", 1.0).unwrap(),
            Some(RobustKernel::Huber(1.0))
        );
        assert!(matches!(
            RobustKernel::from_name("Bogus", 1.0),
            Err(SlamError::UnknownKernel(_))
        ));
    }

    #[test]
    fn test_huber_is_quadratic_inside() {
        let kernel = RobustKernel::Huber(1.0);
        assert_relative_eq!(kernel.rho(0.25), 0.25);
        assert_relative_eq!(kernel.residual_scale(0.25), 1.0);
    }

    #[test]
    fn test_huber_is_linear_outside() {
        let kernel = RobustKernel::Huber(1.0);
        // e = 3, rho = 2*3*1 - 1 = 5
        assert_relative_eq!(kernel.rho(9.0), 5.0);
        assert!(kernel.residual_scale(9.0) < 1.0);
    }

    #[test]
    fn test_kernels_bound_large_errors() {
        for kernel in [
            RobustKernel::Cauchy(1.0),
            RobustKernel::Tukey(1.0),
            RobustKernel::Welsch(1.0),
            RobustKernel::Saturated(1.0),
        ] {
            assert!(kernel.rho(1e6) < 1e3, "{} not bounded", kernel.name());
        }
    }
}
