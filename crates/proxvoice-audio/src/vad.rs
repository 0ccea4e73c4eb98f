/// Level of digital silence, in dBFS.
pub const SILENCE_DB: f32 = -96.0;

/// RMS gate with a release hold, evaluated once per captured frame.
///
/// A frame louder than the threshold opens the gate; it stays open for
/// `hold_ms` of quieter frames so word endings are not clipped.
pub struct VoiceActivityDetector {
    threshold_db: f32,
    hold_frames: u32,
    /// Quiet frames seen since the last loud one.
    quiet_frames: u32,
    level_db: f32,
}

impl VoiceActivityDetector {
    pub fn new(threshold_db: f32, hold_ms: u32, frame_ms: u32) -> Self {
        let hold_frames = hold_ms.checked_div(frame_ms).unwrap_or(0);
        Self {
            threshold_db: threshold_db.clamp(SILENCE_DB, 0.0),
            hold_frames,
            // Closed until the first loud frame.
            quiet_frames: hold_frames.saturating_add(1),
            level_db: SILENCE_DB,
        }
    }

    /// Feed one frame; returns whether the gate is open afterwards.
    pub fn process(&mut self, samples: &[f32]) -> bool {
        self.level_db = level_db(samples);
        if self.level_db >= self.threshold_db {
            self.quiet_frames = 0;
        } else {
            self.quiet_frames = self.quiet_frames.saturating_add(1);
        }
        self.is_open()
    }

    pub fn is_open(&self) -> bool {
        self.quiet_frames <= self.hold_frames
    }

    /// Level of the last processed frame.
    pub fn level_db(&self) -> f32 {
        self.level_db
    }

    pub fn set_threshold_db(&mut self, db: f32) {
        self.threshold_db = db.clamp(SILENCE_DB, 0.0);
    }

    pub fn threshold_db(&self) -> f32 {
        self.threshold_db
    }

    /// Close the gate immediately.
    pub fn reset(&mut self) {
        self.quiet_frames = self.hold_frames.saturating_add(1);
        self.level_db = SILENCE_DB;
    }
}

/// RMS level of a frame in dBFS, floored at [`SILENCE_DB`].
pub fn level_db(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return SILENCE_DB;
    }
    let mean_square = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    let rms = mean_square.sqrt();
    if rms <= 0.0 {
        SILENCE_DB
    } else {
        (20.0 * rms.log10()).max(SILENCE_DB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_keeps_gate_closed() {
        let mut vad = VoiceActivityDetector::new(-40.0, 300, 20);
        assert!(!vad.process(&[0.0; 960]));
        assert_eq!(vad.level_db(), SILENCE_DB);
    }

    #[test]
    fn loud_frame_opens_gate() {
        let mut vad = VoiceActivityDetector::new(-40.0, 300, 20);
        // 0.1 amplitude is -20 dBFS
        assert!(vad.process(&[0.1; 960]));
        assert!((vad.level_db() + 20.0).abs() < 0.01);
    }

    #[test]
    fn hold_keeps_gate_open() {
        // 60 ms hold at 20 ms frames is three quiet frames.
        let mut vad = VoiceActivityDetector::new(-40.0, 60, 20);
        assert!(vad.process(&[0.1; 960]));
        assert!(vad.process(&[0.0; 960]));
        assert!(vad.process(&[0.0; 960]));
        assert!(vad.process(&[0.0; 960]));
        assert!(!vad.process(&[0.0; 960]));
    }

    #[test]
    fn reset_closes_gate() {
        let mut vad = VoiceActivityDetector::new(-40.0, 300, 20);
        vad.process(&[0.1; 960]);
        vad.reset();
        assert!(!vad.is_open());
    }

    #[test]
    fn threshold_is_clamped() {
        let mut vad = VoiceActivityDetector::new(-40.0, 300, 20);
        vad.set_threshold_db(12.0);
        assert_eq!(vad.threshold_db(), 0.0);
        vad.set_threshold_db(-200.0);
        assert_eq!(vad.threshold_db(), SILENCE_DB);
    }

    #[test]
    fn zero_frame_duration_means_no_hold() {
        let mut vad = VoiceActivityDetector::new(-40.0, 300, 0);
        assert!(vad.process(&[0.1; 10]));
        assert!(!vad.process(&[0.0; 10]));
    }
}
