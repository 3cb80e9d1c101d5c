//! Power/current relation for directly modulated 06-DPL lasers.
//!
//! The laser is driven by its modulation high current. Output power follows
//! a fitted tangent curve:
//!
//! ```text
//! current_mA = a * tan(b * power_mW + c) + d
//! ```
//!
//! For the fitted constants, `b * power + c` lies in `(pi/2, 3pi/2)` over the
//! whole usable power range, where tangent is monotonic, so the inverse is
//! `power = (atan((current - d) / a) + pi - c) / b`.

use serde::Deserialize;
use std::f64::consts::PI;

/// Fitted tangent model.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct CurrentModel {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl Default for CurrentModel {
    /// Fit for the 06-DPL 561 nm head.
    fn default() -> Self {
        Self {
            a: 7.650_341_04e2,
            b: 1.070_974_44e-2,
            c: 1.963_261_00,
            d: 2.713_219_03e3,
        }
    }
}

impl CurrentModel {
    /// Drive current in mA for an output power in mW.
    pub fn current_ma(&self, power_mw: f64) -> f64 {
        self.a * (self.b * power_mw + self.c).tan() + self.d
    }

    /// Output power in mW for a drive current in mA.
    pub fn power_mw(&self, current_ma: f64) -> f64 {
        (((current_ma - self.d) / self.a).atan() + PI - self.c) / self.b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_over_power_range() {
        let model = CurrentModel::default();
        for mw in [0.0, 0.12, 1.0, 30.0, 60.0, 100.0, 120.0] {
            let back = model.power_mw(model.current_ma(mw));
            assert!((back - mw).abs() < 1e-6, "{} mW came back as {}", mw, back);
        }
    }

    #[test]
    fn test_current_increases_with_power() {
        let model = CurrentModel::default();
        let mut last = model.current_ma(0.0);
        for mw in 1..=120 {
            let current = model.current_ma(f64::from(mw));
            assert!(current > last);
            last = current;
        }
    }

    #[test]
    fn test_sixty_milliwatts() {
        let current = CurrentModel::default().current_ma(60.0);
        assert!((current - 2259.0).abs() < 5.0, "got {}", current);
    }
}
