//! Neighbor search: bucket particles into bins and reorder them so every bin
//! owns one contiguous index range.
//!
//! ```text
//! Clear      (prefix)  count = offset = cursor = 0
//! Bucket     (solver)  count[bin(p)] += 1, atomically
//! LocalScan  (prefix)  exclusive scan inside each block, block total
//! TreeGather (prefix)  scratch[b] = total[b] + total[b - space]   } ceil(log2(blocks))
//! TreeCommit (prefix)  total[b] = scratch[b]                      } times, space *= 2
//! Finalize   (prefix)  offset[i] += total[block(i) - 1]
//! Scatter    (solver)  shadow[offset[bin] + cursor[bin]++] = particle
//! publish              shadow generation becomes the published one
//! ```

use crate::device::ComputeDevice;
use crate::error::Result;
use crate::grid::BinGrid;
use crate::particles::ParticleStore;
use crate::program::StagedProgram;

/// Stages of the solver program, one invocation per particle.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverStage {
    Bucket = 0,
    Scatter = 1,
    Predict = 2,
    Lambda = 3,
    Correct = 4,
    Apply = 5,
    Commit = 6,
    Viscosity = 7,
}

/// Stages of the prefix-sum program, one invocation per block of bins.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrefixStage {
    LocalScan = 0,
    TreeGather = 1,
    TreeCommit = 2,
    Finalize = 3,
    Clear = 4,
}

/// Drives one complete sort pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeighborSearch;

impl NeighborSearch {
    /// Issues the whole pass in order and publishes the sorted generation.
    /// Every dispatch goes to the same in-order stream, so no stage starts
    /// before the one it depends on has finished.
    pub fn run<D: ComputeDevice>(
        &self,
        device: &mut D,
        solver: &mut StagedProgram<D>,
        prefix: &mut StagedProgram<D>,
        grid: &BinGrid<D>,
        particles: &mut ParticleStore<D>,
    ) -> Result<()> {
        grid.clear(&mut prefix.use_on(device))?;

        solver.use_on(device).execute(SolverStage::Bucket as u32)?;

        self.scan(device, prefix, grid)?;

        solver.use_on(device).execute(SolverStage::Scatter as u32)?;
        particles.publish(solver)
    }

    /// Turns per-bin counts into global offsets.
    pub fn scan<D: ComputeDevice>(
        &self,
        device: &mut D,
        prefix: &mut StagedProgram<D>,
        grid: &BinGrid<D>,
    ) -> Result<()> {
        let mut prefix = prefix.use_on(device);
        prefix.execute(PrefixStage::LocalScan as u32)?;

        // each step reads the totals the previous one wrote
        let mut space = 1u32;
        for _ in 0..grid.scan().tree_steps {
            prefix.set_uniform("space", space.into());
            prefix.execute(PrefixStage::TreeGather as u32)?;
            prefix.execute(PrefixStage::TreeCommit as u32)?;
            space *= 2;
        }

        prefix.execute(PrefixStage::Finalize as u32)
    }
}
