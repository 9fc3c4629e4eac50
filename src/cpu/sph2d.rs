// smoothing kernels in 2D, shared by the reference stages
use std::f32::consts::PI;

use glam::Vec2;

/// Poly6 and spiky kernels for one smoothing length, coefficients precomputed.
#[derive(Clone, Copy, Debug)]
pub struct Kernels2d {
    pub h: f32,
    h2: f32,
    poly6: f32,
    spiky_grad: f32,
}

impl Kernels2d {
    pub fn new(h: f32) -> Self {
        Self {
            h,
            h2: h * h,
            poly6: 4.0 / (PI * h.powi(8)),
            spiky_grad: -10.0 / (PI * h.powi(5)),
        }
    }

    #[inline]
    pub fn h2(&self) -> f32 {
        self.h2
    }

    /// Poly6 of a squared distance.
    #[inline]
    pub fn w_poly6(&self, r2: f32) -> f32 {
        if (0.0..self.h2).contains(&r2) {
            self.poly6 * (self.h2 - r2).powi(3)
        } else {
            0.0
        }
    }

    /// Gradient of the spiky kernel with respect to the first particle.
    #[inline]
    pub fn grad_spiky(&self, r: Vec2) -> Vec2 {
        let r_len = r.length();
        if r_len == 0.0 || r_len >= self.h {
            Vec2::ZERO
        } else {
            self.spiky_grad * (self.h - r_len).powi(2) * (r / r_len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernels_vanish_at_support() {
        let k = Kernels2d::new(1.0);
        assert_eq!(k.w_poly6(1.0), 0.0);
        assert_eq!(k.grad_spiky(Vec2::new(1.0, 0.0)), Vec2::ZERO);
        assert_eq!(k.grad_spiky(Vec2::ZERO), Vec2::ZERO);
        assert!(k.w_poly6(0.0) > k.w_poly6(0.25));
    }

    #[test]
    fn spiky_gradient_points_inwards() {
        // pushing particle i away from j needs a negative gradient along r
        let k = Kernels2d::new(1.0);
        let g = k.grad_spiky(Vec2::new(0.5, 0.0));
        assert!(g.x < 0.0);
        assert_eq!(g.y, 0.0);
    }
}
