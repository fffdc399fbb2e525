use crate::render::Color;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interpolation {
    Linear = 0,
    EaseIn = 1,
    EaseOut = 2,
    EaseInOut = 3,
}

impl Interpolation {
    pub const ALL: [(&'static str, Interpolation); 4] = [
        ("linear", Interpolation::Linear),
        ("ease_in", Interpolation::EaseIn),
        ("ease_out", Interpolation::EaseOut),
        ("ease_in_out", Interpolation::EaseInOut),
    ];

    pub fn from_index(index: i64) -> Option<Self> {
        Self::ALL
            .iter()
            .map(|(_, i)| *i)
            .find(|i| *i as i64 == index)
    }

    fn apply(self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Interpolation::Linear => t,
            Interpolation::EaseIn => t * t,
            Interpolation::EaseOut => 1.0 - (1.0 - t) * (1.0 - t),
            Interpolation::EaseInOut => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(2) / 2.0
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AnimValue {
    Float(f32),
    Color(Color),
}

impl AnimValue {
    fn lerp(self, to: AnimValue, t: f64) -> AnimValue {
        match (self, to) {
            (AnimValue::Float(a), AnimValue::Float(b)) => AnimValue::Float(a + (b - a) * t as f32),
            (AnimValue::Color(a), AnimValue::Color(b)) => AnimValue::Color(a.lerp(b, t as f32)),
            (_, target) => target,
        }
    }

    fn same_kind(&self, other: &AnimValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Time based tween between two values of the same kind. Sampled lazily
/// from the host clock, so it needs no per-frame stepping.
#[derive(Clone, Debug)]
pub struct Animator {
    from: AnimValue,
    to: AnimValue,
    started_at: f64,
    duration: f64,
    interpolation: Interpolation,
}

impl Animator {
    pub fn new(initial: AnimValue, duration: f64, interpolation: Interpolation) -> Result<Self, String> {
        if !(duration > 0.0) {
            return Err("duration must be greater than zero".to_string());
        }
        Ok(Self {
            from: initial,
            to: initial,
            started_at: 0.0,
            duration,
            interpolation,
        })
    }

    pub fn value(&self, now: f64) -> AnimValue {
        let t = (now - self.started_at) / self.duration;
        self.from.lerp(self.to, self.interpolation.apply(t))
    }

    pub fn direct(&mut self, target: AnimValue, from: Option<AnimValue>, now: f64) -> Result<(), String> {
        if !self.to.same_kind(&target) || from.is_some_and(|f| !f.same_kind(&target)) {
            return Err("animator value type mismatch".to_string());
        }
        self.from = from.unwrap_or_else(|| self.value(now));
        self.to = target;
        self.started_at = now;
        Ok(())
    }

    pub fn set_duration(&mut self, duration: f64) -> Result<(), String> {
        if !(duration > 0.0) {
            return Err("duration must be greater than zero".to_string());
        }
        self.duration = duration;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_animator_reaches_target_after_duration() {
        let mut anim = Animator::new(AnimValue::Float(0.0), 2.0, Interpolation::Linear).expect("animator");
        anim.direct(AnimValue::Float(10.0), None, 100.0).expect("direct");
        assert_eq!(anim.value(101.0), AnimValue::Float(5.0));
        assert_eq!(anim.value(105.0), AnimValue::Float(10.0));
    }

    #[test]
    fn rejects_bad_duration_and_kind_mismatch() {
        assert!(Animator::new(AnimValue::Float(0.0), 0.0, Interpolation::Linear).is_err());
        let mut anim = Animator::new(AnimValue::Float(0.0), 1.0, Interpolation::EaseIn).expect("animator");
        assert!(anim
            .direct(AnimValue::Color(Color::WHITE), None, 0.0)
            .is_err());
    }

    #[test]
    fn interpolation_indices_are_stable() {
        assert_eq!(Interpolation::from_index(3), Some(Interpolation::EaseInOut));
        assert_eq!(Interpolation::from_index(4), None);
    }
}
