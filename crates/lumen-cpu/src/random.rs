use lumen_ir::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::ExecError;

/// Samples `N(mean, scale^2)` with the Box-Muller transform.
pub(crate) fn random_normal(
    shape: &[usize],
    mean: f32,
    scale: f32,
    seed: Option<u64>,
) -> Result<Tensor, ExecError> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let length: usize = shape.iter().product();
    let values = (0..length)
        .map(|_| {
            let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
            let u2: f32 = rng.r#gen();
            let z = (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos();
            mean + scale * z
        })
        .collect();
    Ok(Tensor::from_f32(shape, values)?)
}
