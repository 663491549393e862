//! Graph optimization passes for lumen models.
//!
//! Provides a [`Pass`] trait, a [`PassManager`] that runs a fixed ordered
//! pipeline once, the partial-tensor inference that drives value-aware
//! passes, and the built-in passes themselves.

mod context;
mod contract;
mod cpu_fallback;
mod dedup;
mod denormal;
mod einsum;
mod error;
mod fuse_activations;
mod fuse_constants;
mod fuse_dense;
mod fuse_linear;
mod infer;
mod partial;
mod pattern;
mod remap;
mod remove_noops;
mod remove_unused;
mod validation;

pub use context::PartialInferenceContext;
pub use contract::ContractSubExpressionPass;
pub use cpu_fallback::CpuFallbackPass;
pub use dedup::{RemoveDuplicateConstantsPass, RemoveDuplicateLayersPass};
pub use denormal::RoundDenormalWeightsPass;
pub use einsum::EinsumToMatMulPass;
pub use error::{GraphValidationError, InferError, PassError, PassFailure};
pub use fuse_activations::FuseActivationsPass;
pub use fuse_constants::{FuseConstantsPass, MAX_FOLDED_ELEMENTS};
pub use fuse_dense::FuseDensePass;
pub use fuse_linear::FuseLinearLayersPass;
pub use partial::{MAX_TRACKED_ELEMENTS, PartialElement, PartialTensor};
pub use remove_noops::RemoveNoOpsPass;
pub use remove_unused::RemoveUnusedPass;
pub use validation::{
    ValidateBrokenLinksPass, ValidateUnconnectedLayersPass, ValidateUniqueOutputsPass,
};

use std::fmt::Debug;

use lumen_ir::Model;

/// A graph rewrite or check over a model.
pub trait Pass: Debug {
    /// Human-readable name of the pass.
    fn name(&self) -> &str;

    /// Run the pass on a model. Returns `true` if anything was modified.
    fn run(&self, model: &mut Model) -> Result<bool, PassError>;
}

/// Optimization level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OptLevel {
    /// Validation only.
    O0,
    /// Cleanup: constant folding, no-op and duplicate removal, dead layer
    /// elimination and CPU placement.
    O1,
    /// Full pipeline including fusion, pattern contraction and einsum
    /// lowering.
    #[default]
    O2,
}

/// Runs passes once, in order.
#[derive(Debug, Default)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
    validate_each_pass: bool,
}

impl PassManager {
    /// Creates an empty pass manager with no passes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pass manager with the pipeline for the given level.
    pub fn for_level(level: OptLevel) -> Self {
        let mut pm = Self::new();
        pm.add_pass(Box::new(ValidateBrokenLinksPass));
        match level {
            OptLevel::O0 => {}
            OptLevel::O1 => {
                pm.add_pass(Box::new(FuseConstantsPass));
                pm.add_pass(Box::new(RemoveNoOpsPass));
                pm.add_pass(Box::new(RemoveDuplicateLayersPass));
                pm.add_pass(Box::new(RemoveDuplicateConstantsPass));
                pm.add_pass(Box::new(RemoveUnusedPass));
                pm.add_pass(Box::new(CpuFallbackPass));
            }
            OptLevel::O2 => {
                pm.add_pass(Box::new(EinsumToMatMulPass));
                pm.add_pass(Box::new(FuseConstantsPass));
                pm.add_pass(Box::new(RemoveNoOpsPass));
                pm.add_pass(Box::new(RemoveDuplicateLayersPass));
                pm.add_pass(Box::new(ContractSubExpressionPass::new()));
                pm.add_pass(Box::new(FuseDensePass));
                pm.add_pass(Box::new(FuseLinearLayersPass));
                pm.add_pass(Box::new(FuseActivationsPass));
                pm.add_pass(Box::new(RemoveDuplicateConstantsPass));
                pm.add_pass(Box::new(RemoveUnusedPass));
                pm.add_pass(Box::new(RoundDenormalWeightsPass));
                pm.add_pass(Box::new(CpuFallbackPass));
            }
        }
        pm.add_pass(Box::new(ValidateUniqueOutputsPass));
        pm.add_pass(Box::new(ValidateBrokenLinksPass));
        pm.add_pass(Box::new(ValidateUnconnectedLayersPass));
        pm
    }

    /// Checks graph links after every pass that reports a change.
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validate_each_pass = enabled;
        self
    }

    /// Adds a pass to the pipeline.
    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    /// Names of the scheduled passes, in order.
    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Runs every pass once. Returns `true` if any pass changed the model.
    pub fn run(&self, model: &mut Model) -> Result<bool, PassError> {
        let mut changed = false;
        for pass in &self.passes {
            let pass_changed = pass.run(model)?;
            log::info!(
                "{}: {} ({} layers, {} constants)",
                pass.name(),
                if pass_changed { "changed" } else { "unchanged" },
                model.layers.len(),
                model.constants.len()
            );
            if pass_changed && self.validate_each_pass {
                validation::check_links(model).map_err(|e| PassError::new(pass.name(), e))?;
                validation::check_unique_outputs(model).map_err(|e| PassError::new(pass.name(), e))?;
            }
            changed |= pass_changed;
        }
        Ok(changed)
    }
}

/// Convenience function: runs the full pipeline on a model.
pub fn optimize(model: &mut Model) -> Result<bool, PassError> {
    PassManager::for_level(OptLevel::O2).run(model)
}
