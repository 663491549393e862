//! Flushes subnormal float weights to signed zero.
//!
//! Subnormals are slow on most CPUs and flushed anyway by most GPUs, so
//! the model stores them as zero. The rewrite happens in the weight arena;
//! every constant aliasing a region sees the flushed values.

use std::collections::HashSet;

use lumen_ir::{DataType, Model, WeightRegion};
use rayon::prelude::*;

use crate::error::PassError;
use crate::Pass;

/// Bytes handled per parallel task. A multiple of the f32 size.
const BLOCK_BYTES: usize = 16 * 1024;

#[derive(Debug)]
pub struct RoundDenormalWeightsPass;

impl Pass for RoundDenormalWeightsPass {
    fn name(&self) -> &str {
        "round-denormal-weights"
    }

    fn run(&self, model: &mut Model) -> Result<bool, PassError> {
        let mut seen = HashSet::new();
        let regions: Vec<WeightRegion> = model
            .constants
            .iter()
            .filter(|c| c.data_type == DataType::Float)
            .map(|c| c.region)
            .filter(|r| seen.insert(*r))
            .collect();

        let mut flushed = 0;
        for region in regions {
            let bytes = model
                .weight_bytes_mut(region)
                .map_err(|e| PassError::new(self.name(), e))?;
            flushed += flush_subnormals(bytes);
        }
        if flushed > 0 {
            log::debug!("flushed {flushed} subnormal weights");
        }
        Ok(flushed > 0)
    }
}

/// Rewrites little-endian f32 subnormals in `bytes` as zero, keeping the
/// sign. Returns how many values changed.
fn flush_subnormals(bytes: &mut [u8]) -> usize {
    bytes
        .par_chunks_mut(BLOCK_BYTES)
        .map(|block| {
            let mut count = 0;
            for word in block.chunks_exact_mut(4) {
                let value = f32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                if value.is_subnormal() {
                    word.copy_from_slice(&0.0f32.copysign(value).to_le_bytes());
                    count += 1;
                }
            }
            count
        })
        .sum()
}
