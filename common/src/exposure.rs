//! Proportional exposure search.
//!
//! The imaging hardware only exposes coarse exposure-time and gain
//! controls with unknown response curves, so the target brightness is
//! approached iteratively: measure the gray-card region, nudge the
//! exposure time multiplicatively, repeat. The 7.5% step and 5-unit
//! tolerance are tuned together; changing one without the other makes
//! the search oscillate around the tolerance band.

pub const INITIAL_EXPOSURE_US: u32 = 50_000;
pub const INITIAL_ANALOGUE_GAIN: f32 = 1.0;
pub const MIN_EXPOSURE_US: u32 = 1_000;
pub const MAX_EXPOSURE_US: u32 = 1_000_000;
pub const EXPOSURE_STEP_FACTOR: f64 = 1.075;
pub const DEFAULT_TOLERANCE: f64 = 5.0;
pub const MAX_ITERATIONS: u32 = 20;

/// Next action for the calibration driver after one brightness
/// measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExposureStep {
    /// Measured brightness is within tolerance of the target.
    Converged,
    /// Apply these controls, settle, then measure again.
    Apply { exposure_us: u32, gain: f32 },
    /// The exposure clamp was reached while still off-target; further
    /// iteration cannot improve the result.
    AtBoundary,
    /// Iteration budget spent without converging.
    IterationsExhausted,
}

#[derive(Debug, Clone)]
pub struct ExposureSearch {
    target: f64,
    tolerance: f64,
    exposure_us: u32,
    gain: f32,
    iterations: u32,
}

impl ExposureSearch {
    pub fn new(target_brightness: u8) -> Self {
        Self {
            target: f64::from(target_brightness),
            tolerance: DEFAULT_TOLERANCE,
            exposure_us: INITIAL_EXPOSURE_US,
            gain: INITIAL_ANALOGUE_GAIN,
            iterations: 0,
        }
    }

    /// Controls to apply before the first measurement.
    pub fn initial_controls(&self) -> (u32, f32) {
        (self.exposure_us, self.gain)
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Feed one measured gray-card brightness (0-255 luma scale) and
    /// get the next action. Not a bracketing search: the step is damped
    /// but there is no converging interval, which is why the clamp
    /// boundaries double as stop conditions.
    pub fn step(&mut self, brightness: f64) -> ExposureStep {
        if (brightness - self.target).abs() <= self.tolerance {
            return ExposureStep::Converged;
        }
        if self.iterations >= MAX_ITERATIONS {
            return ExposureStep::IterationsExhausted;
        }

        if brightness < self.target {
            if self.exposure_us >= MAX_EXPOSURE_US {
                return ExposureStep::AtBoundary;
            }
            self.exposure_us =
                ((f64::from(self.exposure_us) * EXPOSURE_STEP_FACTOR) as u32).min(MAX_EXPOSURE_US);
        } else {
            if self.exposure_us <= MIN_EXPOSURE_US {
                return ExposureStep::AtBoundary;
            }
            self.exposure_us =
                ((f64::from(self.exposure_us) / EXPOSURE_STEP_FACTOR) as u32).max(MIN_EXPOSURE_US);
        }

        self.iterations += 1;
        ExposureStep::Apply {
            exposure_us: self.exposure_us,
            gain: self.gain,
        }
    }
}
