//! The seam between the solver core and whatever executes its kernels.
//!
//! The core only ever talks to a [`ComputeDevice`]: it allocates raw storage,
//! writes and reads bytes, and dispatches one stage of a program at a time with
//! an explicit binding table and uniform set. There is no hidden "current
//! program"; every dispatch names its program, stage, bindings and uniforms.

use std::collections::BTreeMap;

use crate::error::Result;

/// Slot a buffer is exposed at (`@binding(n)` on the device side).
pub type BindingPoint = u32;

/// Programs the solver runs. Each one is a set of independently dispatchable
/// stages sharing one binding table and one uniform block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Solver,
    PrefixSum,
}

impl ProgramKind {
    pub fn name(self) -> &'static str {
        match self {
            ProgramKind::Solver => "solver",
            ProgramKind::PrefixSum => "prefix_sum",
        }
    }

    pub fn stage_count(self) -> u32 {
        match self {
            ProgramKind::Solver => 8,
            ProgramKind::PrefixSum => 5,
        }
    }

    /// Entry point of each stage, in stage order.
    pub fn entry_points(self) -> &'static [&'static str] {
        match self {
            ProgramKind::Solver => &[
                "bucket",
                "scatter",
                "predict",
                "solve_lambda",
                "correct",
                "apply",
                "commit",
                "viscosity",
            ],
            ProgramKind::PrefixSum => &[
                "local_scan",
                "tree_gather",
                "tree_commit",
                "finalize",
                "clear",
            ],
        }
    }

    /// Uniform block layout, in declaration order of the WGSL struct.
    pub fn uniform_layout(self) -> &'static [(&'static str, UniformKind)] {
        use UniformKind::*;
        match self {
            ProgramKind::Solver => &[
                ("num_particles", U32),
                ("bin_count", U32),
                ("grid_dim", UVec2),
                ("domain", Vec2),
                ("gravity", Vec2),
                ("bin_width", F32),
                ("smoothing_radius", F32),
                ("particle_mass", F32),
                ("rest_density", F32),
                ("dt", F32),
                ("artificial_viscosity", F32),
                ("artificial_pressure", F32),
                ("over_relaxation", F32),
            ],
            ProgramKind::PrefixSum => &[
                ("data_size", U32),
                ("block_size", U32),
                ("block_count", U32),
                ("space", U32),
            ],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UniformKind {
    U32,
    F32,
    UVec2,
    Vec2,
}

impl UniformKind {
    fn align(self) -> usize {
        match self {
            UniformKind::U32 | UniformKind::F32 => 4,
            UniformKind::UVec2 | UniformKind::Vec2 => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UniformValue {
    U32(u32),
    F32(f32),
    UVec2([u32; 2]),
    Vec2([f32; 2]),
}

impl UniformValue {
    pub fn kind(&self) -> UniformKind {
        match self {
            UniformValue::U32(_) => UniformKind::U32,
            UniformValue::F32(_) => UniformKind::F32,
            UniformValue::UVec2(_) => UniformKind::UVec2,
            UniformValue::Vec2(_) => UniformKind::Vec2,
        }
    }

    fn write_to(&self, out: &mut [u8]) {
        match self {
            UniformValue::U32(v) => out[..4].copy_from_slice(bytemuck::bytes_of(v)),
            UniformValue::F32(v) => out[..4].copy_from_slice(bytemuck::bytes_of(v)),
            UniformValue::UVec2(v) => out[..8].copy_from_slice(bytemuck::bytes_of(v)),
            UniformValue::Vec2(v) => out[..8].copy_from_slice(bytemuck::bytes_of(v)),
        }
    }
}

impl From<u32> for UniformValue {
    fn from(v: u32) -> Self {
        UniformValue::U32(v)
    }
}

impl From<f32> for UniformValue {
    fn from(v: f32) -> Self {
        UniformValue::F32(v)
    }
}

impl From<[u32; 2]> for UniformValue {
    fn from(v: [u32; 2]) -> Self {
        UniformValue::UVec2(v)
    }
}

impl From<glam::Vec2> for UniformValue {
    fn from(v: glam::Vec2) -> Self {
        UniformValue::Vec2(v.to_array())
    }
}

/// Uniform writes staged on a program, effective on its next dispatch.
#[derive(Clone, Debug, Default)]
pub struct UniformSet {
    values: BTreeMap<&'static str, UniformValue>,
    revision: u64,
}

impl UniformSet {
    pub fn set(&mut self, name: &'static str, value: UniformValue) {
        if self.values.insert(name, value) != Some(value) {
            self.revision += 1;
        }
    }

    pub fn get(&self, name: &str) -> Option<UniformValue> {
        self.values.get(name).copied()
    }

    /// Bumped on every change; lets a device skip re-uploading an unchanged block.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Packs the values into the byte image of a WGSL uniform struct with the
    /// given field layout. Unset fields are zero.
    pub fn pack(&self, layout: &[(&'static str, UniformKind)]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64);
        for (name, kind) in layout {
            let align = kind.align();
            let offset = bytes.len().next_multiple_of(align);
            bytes.resize(offset + align, 0);
            if let Some(value) = self.values.get(name).filter(|v| v.kind() == *kind) {
                value.write_to(&mut bytes[offset..]);
            }
        }
        let size = bytes.len().next_multiple_of(16).max(16);
        bytes.resize(size, 0);
        bytes
    }
}

/// Which raw buffer sits at which binding point of a program.
#[derive(Clone, Debug)]
pub struct BindingTable<B> {
    slots: BTreeMap<BindingPoint, B>,
    revision: u64,
}

impl<B> Default for BindingTable<B> {
    fn default() -> Self {
        Self {
            slots: BTreeMap::new(),
            revision: 0,
        }
    }
}

impl<B: Clone> BindingTable<B> {
    pub fn attach(&mut self, point: BindingPoint, buffer: B) {
        self.slots.insert(point, buffer);
        self.revision += 1;
    }

    pub fn get(&self, point: BindingPoint) -> Option<&B> {
        self.slots.get(&point)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BindingPoint, &B)> {
        self.slots.iter().map(|(p, b)| (*p, b))
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}

/// One kernel invocation request.
pub struct Dispatch<'a, D: ComputeDevice + ?Sized> {
    pub program: ProgramKind,
    pub kernels: &'a mut D::Kernels,
    pub stage: u32,
    pub bindings: &'a BindingTable<D::Buffer>,
    pub uniforms: &'a UniformSet,
    pub workgroups: u32,
    pub workgroup_size: u32,
}

/// Executes solver programs. All dispatches go through one in-order stream:
/// a dispatch observes every write of the dispatches issued before it, and the
/// host only waits when it reads a buffer back.
pub trait ComputeDevice {
    /// Handle to device storage. Cloning the handle does not copy the storage.
    type Buffer: Clone;
    /// A compiled program.
    type Kernels;

    fn create_buffer(&mut self, label: &str, size: u64) -> Result<Self::Buffer>;

    fn destroy_buffer(&mut self, buffer: &Self::Buffer);

    fn write_buffer(&mut self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()>;

    /// Blocks until every prior dispatch has completed, then copies `size` bytes
    /// from the start of `buffer` to the host.
    fn read_buffer(&mut self, buffer: &Self::Buffer, size: u64) -> Result<Vec<u8>>;

    fn load_kernels(&mut self, program: ProgramKind) -> Result<Self::Kernels>;

    fn dispatch(&mut self, dispatch: Dispatch<'_, Self>) -> Result<()>;

    /// Surfaces device-side errors recorded since the last call.
    fn check_errors(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solver_uniforms_pack_like_wgsl() {
        let mut set = UniformSet::default();
        set.set("num_particles", 7u32.into());
        set.set("grid_dim", [3u32, 4].into());
        set.set("over_relaxation", 1.0f32.into());

        let bytes = set.pack(ProgramKind::Solver.uniform_layout());
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[0..4], &7u32.to_ne_bytes());
        assert_eq!(&bytes[8..12], &3u32.to_ne_bytes());
        assert_eq!(&bytes[12..16], &4u32.to_ne_bytes());
        assert_eq!(&bytes[60..64], &1.0f32.to_ne_bytes());
    }

    #[test]
    fn unchanged_uniform_keeps_revision() {
        let mut set = UniformSet::default();
        set.set("space", 1u32.into());
        let rev = set.revision();
        set.set("space", 1u32.into());
        assert_eq!(set.revision(), rev);
        set.set("space", 2u32.into());
        assert!(set.revision() > rev);
    }

    #[test]
    fn stage_tables_agree() {
        for kind in [ProgramKind::Solver, ProgramKind::PrefixSum] {
            assert_eq!(kind.entry_points().len() as u32, kind.stage_count());
        }
    }
}
