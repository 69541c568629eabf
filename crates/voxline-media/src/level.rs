//! Loudness telemetry for captured audio (diagnostics only).

use tracing::trace;

use voxline_core::types::AudioFrame;

/// Loudness of one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Level {
    pub rms: f64,
    /// `20·log10(rms)`; negative infinity for digital silence.
    pub db: f64,
}

/// Root mean square of 16-bit PCM samples.
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt()
}

pub fn to_db(rms: f64) -> f64 {
    20.0 * rms.log10()
}

/// Measure a whole frame.
pub fn measure(frame: &AudioFrame) -> Level {
    let samples: Vec<i16> = frame.samples().collect();
    let rms = rms(&samples);
    Level {
        rms,
        db: to_db(rms),
    }
}

/// Measures a random subset of frames and traces the result.
#[derive(Debug, Clone, Copy)]
pub struct LevelMeter {
    probability: f64,
}

impl LevelMeter {
    /// `probability` is clamped into `0..=1`.
    pub fn new(probability: f64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
        }
    }

    /// Measure the frame with the configured probability.
    pub fn observe(&self, frame: &AudioFrame) -> Option<Level> {
        if self.probability <= 0.0 || rand::random::<f64>() >= self.probability {
            return None;
        }
        let level = measure(frame);
        trace!(
            bytes = frame.len(),
            rms = level.rms,
            db = level.db,
            "Capture level"
        );
        Some(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_calculation() {
        assert_eq!(rms(&[0i16; 320]), 0.0);
        assert!((rms(&[100i16; 320]) - 100.0).abs() < 0.01);
        assert_eq!(rms(&[]), 0.0);
        // alternating sign has the same energy
        assert!((rms(&[-300, 300, -300, 300]) - 300.0).abs() < 0.01);
    }

    #[test]
    fn test_db() {
        assert!((to_db(1.0)).abs() < 1e-9);
        assert!((to_db(1000.0) - 60.0).abs() < 1e-9);
        assert_eq!(to_db(0.0), f64::NEG_INFINITY);
    }

    #[test]
    fn test_measure_frame() {
        let level = measure(&AudioFrame::from_samples(&[100; 160]));
        assert!((level.rms - 100.0).abs() < 0.01);
        assert!((level.db - 40.0).abs() < 0.01);
    }

    #[test]
    fn test_meter_sampling_bounds() {
        let frame = AudioFrame::from_samples(&[10; 32]);
        let never = LevelMeter::new(0.0);
        let always = LevelMeter::new(7.0);
        for _ in 0..100 {
            assert!(never.observe(&frame).is_none());
            assert!(always.observe(&frame).is_some());
        }
    }
}
