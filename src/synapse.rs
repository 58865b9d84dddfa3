#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Synapse {
    pub pre_idx: usize,
    pub post_idx: usize,
    pub weight: f32,
}

impl Synapse {
    pub fn new(pre_idx: usize, post_idx: usize, weight: f32) -> Self {
        Self {
            pre_idx,
            post_idx,
            weight,
        }
    }

    /// Returns false if the change was rejected because the result would not be finite.
    pub fn process_weight_change(&mut self, weight_change: f32, weight_clip: Option<f32>) -> bool {
        let mut weight = self.weight + weight_change;

        if let Some(weight_clip) = weight_clip {
            weight = weight.clamp(-weight_clip, weight_clip);
        }

        if weight.is_finite() {
            self.weight = weight;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn weight_change() {
        let mut sut = Synapse::new(0, 1, 0.4);
        assert_approx_eq!(f32, sut.weight, 0.4);
        assert!(sut.process_weight_change(-0.1, None));
        assert_approx_eq!(f32, sut.weight, 0.3);
    }

    #[test]
    fn sign_change_allowed() {
        let mut sut = Synapse::new(0, 1, 0.4);
        assert!(sut.process_weight_change(-1.0, None));
        assert_approx_eq!(f32, sut.weight, -0.6);
    }

    #[test]
    fn weight_clip() {
        let mut sut = Synapse::new(0, 1, 0.4);
        assert!(sut.process_weight_change(0.3, Some(0.5)));
        assert_approx_eq!(f32, sut.weight, 0.5);
        assert!(sut.process_weight_change(-2.0, Some(0.5)));
        assert_approx_eq!(f32, sut.weight, -0.5);
    }

    #[test]
    fn non_finite_change_rejected() {
        let mut sut = Synapse::new(0, 1, 0.4);
        assert!(!sut.process_weight_change(f32::NAN, None));
        assert_approx_eq!(f32, sut.weight, 0.4);
        assert!(!sut.process_weight_change(f32::INFINITY, None));
        assert_approx_eq!(f32, sut.weight, 0.4);
    }
}
