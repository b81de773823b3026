//! Concrete stage implementations.

pub mod delay;
pub mod events;
pub mod gain;
pub mod pitch;
pub mod queue_source;
pub mod stt;
pub mod tts;
pub mod vc;

pub use delay::{DelayControl, DelayLine};
pub use events::{EventToText, TranscriptEvent, encode_events};
pub use gain::{Gain, GainControl};
pub use pitch::PitchShift;
pub use queue_source::QueueSource;
pub use stt::SttStage;
pub use tts::TtsStage;
pub use vc::VoiceConvertStage;

/// Handle to a stage parameter that can change while the pipeline runs.
#[derive(Clone)]
pub enum Control {
    Gain(GainControl),
    Delay(DelayControl),
}

impl Control {
    /// Applies a named parameter update. Returns false when this handle
    /// has no parameter with that name.
    pub fn apply(&self, param: &str, value: f64) -> bool {
        match (self, param) {
            (Control::Gain(ctl), "factor") => {
                ctl.set(value as f32);
                true
            }
            (Control::Delay(ctl), "ms") if value >= 0.0 => {
                ctl.set_ms(value as u64);
                true
            }
            _ => false,
        }
    }

    /// Current value of the mutable parameter, for introspection.
    pub fn current(&self) -> (&'static str, f64) {
        match self {
            Control::Gain(ctl) => ("factor", ctl.get() as f64),
            Control::Delay(ctl) => ("ms", ctl.get_ms() as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::AudioFormat;

    #[test]
    fn test_control_apply_routes_by_name() {
        let (_gain, ctl) = Gain::new(AudioFormat::pcm16(16000), 1.0);
        let control = Control::Gain(ctl.clone());
        assert!(control.apply("factor", 0.25));
        assert_eq!(ctl.get(), 0.25);
        assert!(!control.apply("ms", 100.0));
    }

    #[test]
    fn test_control_rejects_negative_delay() {
        let (_delay, ctl) = DelayLine::new(AudioFormat::pcm16(16000), 10);
        let control = Control::Delay(ctl.clone());
        assert!(!control.apply("ms", -5.0));
        assert_eq!(ctl.get_ms(), 10);
        assert!(control.apply("ms", 40.0));
        assert_eq!(control.current(), ("ms", 40.0));
    }
}
