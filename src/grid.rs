use glam::{IVec2, Vec2};

use crate::buffer::StructuredBuffer;
use crate::device::{ComputeDevice, UniformValue};
use crate::error::Result;
use crate::gpu::ffi::{Bin, BlockSum};
use crate::particles::binding;
use crate::program::{ActiveProgram, StagedProgram};
use crate::search::PrefixStage;

/// Geometry of the uniform bin grid. Immutable for a run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridParams {
    /// Domain extents, centred on the origin.
    pub domain: Vec2,
    pub bin_width: f32,
    pub dims: [u32; 2],
}

impl GridParams {
    pub fn new(domain: Vec2, bin_width: f32) -> Self {
        let dims = [
            ((domain.x / bin_width) as u32).max(1),
            ((domain.y / bin_width) as u32).max(1),
        ];
        Self {
            domain,
            bin_width,
            dims,
        }
    }

    pub fn bin_count(&self) -> u32 {
        self.dims[0] * self.dims[1]
    }

    /// Integer cell of `position`, clamped into the grid. Out-of-domain
    /// positions land in the nearest boundary cell.
    ///
    /// The kernels evaluate the same expression in f32:
    /// `clamp(vec2<i32>(floor((p + domain * 0.5) / bin_width)), 0, dims - 1)`.
    #[inline]
    pub fn cell_of(&self, position: Vec2) -> IVec2 {
        let rel = ((position + self.domain * 0.5) / self.bin_width).floor();
        let max = IVec2::new(self.dims[0] as i32 - 1, self.dims[1] as i32 - 1);
        rel.as_ivec2().clamp(IVec2::ZERO, max)
    }

    #[inline]
    pub fn flatten(&self, cell: IVec2) -> u32 {
        cell.y as u32 * self.dims[0] + cell.x as u32
    }

    #[inline]
    pub fn cell_index_of(&self, position: Vec2) -> u32 {
        self.flatten(self.cell_of(position))
    }

    /// Flattened indices of the 3x3 block of bins around `cell` that lie in the grid.
    pub fn neighborhood(&self, cell: IVec2) -> impl Iterator<Item = u32> + '_ {
        (-1..=1).flat_map(move |oy| {
            (-1..=1).filter_map(move |ox| {
                let c = cell + IVec2::new(ox, oy);
                let inside = c.x >= 0
                    && c.y >= 0
                    && (c.x as u32) < self.dims[0]
                    && (c.y as u32) < self.dims[1];
                inside.then(|| self.flatten(c))
            })
        })
    }
}

/// How the bin array is cut into blocks for the prefix sum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanLayout {
    pub bin_count: u32,
    pub block_size: u32,
    pub block_count: u32,
    /// Hillis-Steele steps over block totals, `ceil(log2(block_count))`.
    pub tree_steps: u32,
}

impl ScanLayout {
    /// `block_size = None` derives `floor(log2(bin_count))`.
    pub fn new(bin_count: u32, block_size: Option<u32>) -> Self {
        let block_size = block_size
            .unwrap_or_else(|| bin_count.max(2).ilog2())
            .clamp(1, bin_count.max(1));
        let block_count = bin_count.div_ceil(block_size).max(1);
        let tree_steps = if block_count <= 1 {
            0
        } else {
            (block_count - 1).ilog2() + 1
        };
        Self {
            bin_count,
            block_size,
            block_count,
            tree_steps,
        }
    }
}

/// Per-bin counters and offsets plus the block totals of the scan.
pub struct BinGrid<D: ComputeDevice> {
    params: GridParams,
    scan: ScanLayout,
    bins: StructuredBuffer<Bin, D>,
    block_sums: StructuredBuffer<BlockSum, D>,
}

impl<D: ComputeDevice> BinGrid<D> {
    pub fn new(device: &mut D, params: GridParams, block_size: Option<u32>) -> Result<Self> {
        let scan = ScanLayout::new(params.bin_count(), block_size);

        let bins = StructuredBuffer::allocate(device, "bins", scan.bin_count as usize)?;
        let block_sums =
            match StructuredBuffer::allocate(device, "block_sums", scan.block_count as usize) {
                Ok(block_sums) => block_sums,
                Err(err) => {
                    bins.destroy(device);
                    return Err(err);
                }
            };

        let mut grid = Self {
            params,
            scan,
            bins,
            block_sums,
        };
        if let Err(err) = grid.shape(device) {
            grid.destroy(device);
            return Err(err);
        }
        Ok(grid)
    }

    fn shape(&mut self, device: &mut D) -> Result<()> {
        self.bins.resize(device, self.scan.bin_count as usize)?;
        self.bins.bind(binding::BINS);
        self.block_sums.resize(device, self.scan.block_count as usize)?;
        self.block_sums.bind(binding::BLOCK_SUMS);
        Ok(())
    }

    pub fn params(&self) -> &GridParams {
        &self.params
    }

    pub fn scan(&self) -> &ScanLayout {
        &self.scan
    }

    pub fn bin_count(&self) -> u32 {
        self.scan.bin_count
    }

    pub fn cell_index_of(&self, position: Vec2) -> u32 {
        self.params.cell_index_of(position)
    }

    pub fn bins(&self) -> &StructuredBuffer<Bin, D> {
        &self.bins
    }

    /// Binds the bin buffer to the solver and both buffers to the prefix program.
    pub fn attach(
        &self,
        solver: &mut StagedProgram<D>,
        prefix: &mut StagedProgram<D>,
    ) -> Result<()> {
        solver.attach(&self.bins)?;
        prefix.attach(&self.bins)?;
        prefix.attach(&self.block_sums)?;
        Ok(())
    }

    /// Stages the grid geometry on the solver program.
    pub fn sync_solver(&self, solver: &mut ActiveProgram<'_, D>) {
        solver.set_uniform("bin_count", self.scan.bin_count.into());
        solver.set_uniform("grid_dim", self.params.dims.into());
        solver.set_uniform("domain", self.params.domain.into());
        solver.set_uniform("bin_width", UniformValue::F32(self.params.bin_width));
    }

    /// Stages the scan layout on the prefix program and sizes its workgroups.
    pub fn sync_prefix(&self, prefix: &mut ActiveProgram<'_, D>) {
        prefix.set_workgroup_layout(self.scan.block_count);
        prefix.set_uniform("data_size", self.scan.bin_count.into());
        prefix.set_uniform("block_size", self.scan.block_size.into());
        prefix.set_uniform("block_count", self.scan.block_count.into());
        prefix.set_uniform("space", 1u32.into());
    }

    /// Zeros every per-bin counter. Runs on the device, in stream order.
    pub fn clear(&self, prefix: &mut ActiveProgram<'_, D>) -> Result<()> {
        prefix.execute(PrefixStage::Clear as u32)
    }

    /// Synchronous copy of the bins, for inspection only.
    pub fn download(&mut self, device: &mut D) -> Result<Vec<Bin>> {
        Ok(self.bins.download(device)?.to_vec())
    }

    pub fn destroy(self, device: &mut D) {
        self.bins.destroy(device);
        self.block_sums.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_domain_grid() {
        let grid = GridParams::new(Vec2::new(400.0, 400.0), 1.25);
        assert_eq!(grid.dims, [320, 320]);
        assert_eq!(grid.bin_count(), 102_400);
    }

    #[test]
    fn cells_clamp_to_boundary() {
        let grid = GridParams::new(Vec2::new(10.0, 10.0), 1.0);
        assert_eq!(grid.cell_of(Vec2::new(-5.0, -5.0)), IVec2::new(0, 0));
        assert_eq!(grid.cell_of(Vec2::new(-4.5, 0.2)), IVec2::new(0, 5));
        assert_eq!(grid.cell_of(Vec2::new(1e6, -1e6)), IVec2::new(9, 0));
        assert_eq!(grid.cell_of(Vec2::new(f32::NAN, 4.99)), IVec2::new(0, 9));
        assert_eq!(grid.cell_index_of(Vec2::new(4.99, 4.99)), 99);
    }

    #[test]
    fn neighborhood_stays_inside() {
        let grid = GridParams::new(Vec2::new(4.0, 4.0), 1.0);
        let corner: Vec<u32> = grid.neighborhood(IVec2::new(0, 0)).collect();
        assert_eq!(corner, vec![0, 1, 4, 5]);
        assert_eq!(grid.neighborhood(IVec2::new(1, 1)).count(), 9);
    }

    #[test]
    fn scan_layout_uses_log2_blocks() {
        let scan = ScanLayout::new(102_400, None);
        assert_eq!(scan.block_size, 16);
        assert_eq!(scan.block_count, 6400);
        assert_eq!(scan.tree_steps, 13);

        let single = ScanLayout::new(3, Some(8));
        assert_eq!(single.block_size, 3);
        assert_eq!(single.block_count, 1);
        assert_eq!(single.tree_steps, 0);

        let pow2 = ScanLayout::new(64, Some(4));
        assert_eq!(pow2.block_count, 16);
        assert_eq!(pow2.tree_steps, 4);
    }
}
