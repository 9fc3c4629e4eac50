use bevy::log::debug;
use bytemuck::Pod;

use crate::buffer::StructuredBuffer;
use crate::device::{
    BindingPoint, BindingTable, ComputeDevice, Dispatch, ProgramKind, UniformSet, UniformValue,
};
use crate::error::{Result, SolverError};

/// A compiled program with several independently dispatchable stages that
/// share one binding table and one uniform set.
pub struct StagedProgram<D: ComputeDevice> {
    kind: ProgramKind,
    kernels: D::Kernels,
    bindings: BindingTable<D::Buffer>,
    required: Vec<BindingPoint>,
    uniforms: UniformSet,
    workgroup_size: u32,
    workgroups: u32,
}

impl<D: ComputeDevice> StagedProgram<D> {
    /// Compiles `kind` on `device`. Every binding in `required` must be
    /// attached before the first dispatch.
    pub fn new(
        device: &mut D,
        kind: ProgramKind,
        workgroup_size: u32,
        required: impl IntoIterator<Item = BindingPoint>,
    ) -> Result<Self> {
        let kernels = device.load_kernels(kind)?;
        Ok(Self {
            kind,
            kernels,
            bindings: BindingTable::default(),
            required: required.into_iter().collect(),
            uniforms: UniformSet::default(),
            workgroup_size: workgroup_size.max(1),
            workgroups: 0,
        })
    }

    pub fn kind(&self) -> ProgramKind {
        self.kind
    }

    pub fn stage_count(&self) -> u32 {
        self.kind.stage_count()
    }

    pub fn workgroups(&self) -> u32 {
        self.workgroups
    }

    pub fn workgroup_size(&self) -> u32 {
        self.workgroup_size
    }

    /// Exposes `buffer` to every stage at its binding point.
    pub fn attach<T: Pod>(&mut self, buffer: &StructuredBuffer<T, D>) -> Result<()> {
        let point = buffer.binding_point()?;
        self.attach_raw(point, buffer.raw().clone());
        Ok(())
    }

    pub fn attach_raw(&mut self, point: BindingPoint, raw: D::Buffer) {
        self.bindings.attach(point, raw);
    }

    pub fn uniform(&self, name: &str) -> Option<UniformValue> {
        self.uniforms.get(name)
    }

    /// Selects this program as the target of the following uniform writes and
    /// dispatches. The returned handle is the only way to dispatch.
    pub fn use_on<'a>(&'a mut self, device: &'a mut D) -> ActiveProgram<'a, D> {
        ActiveProgram {
            program: self,
            device,
        }
    }
}

/// A program selected on a device.
pub struct ActiveProgram<'a, D: ComputeDevice> {
    program: &'a mut StagedProgram<D>,
    device: &'a mut D,
}

impl<D: ComputeDevice> ActiveProgram<'_, D> {
    /// Staged until the next dispatch of this program.
    pub fn set_uniform(&mut self, name: &'static str, value: UniformValue) {
        self.program.uniforms.set(name, value);
    }

    /// Sizes the dispatch for `element_count` invocations.
    pub fn set_workgroup_layout(&mut self, element_count: u32) {
        let size = self.program.workgroup_size;
        self.program.workgroups = element_count.div_ceil(size);
        debug!(
            "{}: {} workgroups of {} for {} elements",
            self.program.kind.name(),
            self.program.workgroups,
            size,
            element_count
        );
    }

    /// Dispatches exactly one stage. Nothing else runs implicitly.
    pub fn execute(&mut self, stage: u32) -> Result<()> {
        let program = &mut *self.program;
        let name = program.kind.name();
        if stage >= program.kind.stage_count() {
            return Err(SolverError::StageOutOfRange {
                program: name.into(),
                stage,
                stage_count: program.kind.stage_count(),
            });
        }
        if let Some(&binding) = program
            .required
            .iter()
            .find(|&&point| program.bindings.get(point).is_none())
        {
            return Err(SolverError::UnboundBinding {
                program: name.into(),
                binding,
            });
        }
        if program.workgroups == 0 {
            return Ok(());
        }
        self.device.dispatch(Dispatch {
            program: program.kind,
            kernels: &mut program.kernels,
            stage,
            bindings: &program.bindings,
            uniforms: &program.uniforms,
            workgroups: program.workgroups,
            workgroup_size: program.workgroup_size,
        })
    }
}
