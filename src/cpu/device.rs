//! Reference executor: runs every stage of a program on host memory, one
//! invocation after the other. A sequential run is one of the interleavings a
//! device may pick, so whatever holds here must hold on the GPU as well.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use bevy::log::warn;
use bytemuck::Pod;
use glam::Vec2;

use crate::cpu::kernels;
use crate::device::{BindingPoint, ComputeDevice, Dispatch, ProgramKind, UniformSet, UniformValue};
use crate::error::{Result, SolverError};

/// Handle to host storage owned by a [`HostDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostBuffer(usize);

struct Storage {
    label: String,
    words: Vec<u32>,
}

#[derive(Default)]
pub struct HostDevice {
    storage: Vec<Option<Storage>>,
    fault: Option<SolverError>,
    dispatches: u64,
    memory_limit: Option<u64>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that refuses allocations once `bytes` of storage are live,
    /// the way an adapter runs out of memory.
    pub fn with_memory_limit(bytes: u64) -> Self {
        Self {
            memory_limit: Some(bytes),
            ..Self::default()
        }
    }

    /// Bytes held by buffers that have not been destroyed.
    pub fn live_bytes(&self) -> u64 {
        self.storage
            .iter()
            .flatten()
            .map(|s| s.words.len() as u64 * 4)
            .sum()
    }

    /// Dispatches issued since creation.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }

    fn storage(&mut self, buffer: &HostBuffer) -> Result<&mut Storage> {
        self.storage
            .get_mut(buffer.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| SolverError::Device(format!("buffer {} was destroyed", buffer.0)))
    }
}

/// Compiled form of a program on the host: which stage table to run.
pub struct HostKernels {
    kind: ProgramKind,
}

impl ComputeDevice for HostDevice {
    type Buffer = HostBuffer;
    type Kernels = HostKernels;

    fn create_buffer(&mut self, label: &str, size: u64) -> Result<HostBuffer> {
        let words = usize::try_from(size.div_ceil(4))
            .map_err(|_| SolverError::Device(format!("`{label}` of {size} bytes is too large")))?;
        if let Some(limit) = self.memory_limit {
            let live = self.live_bytes();
            if live + words as u64 * 4 > limit {
                return Err(SolverError::Device(format!(
                    "out of memory allocating `{label}`: {live} of {limit} bytes in use"
                )));
            }
        }
        self.storage.push(Some(Storage {
            label: label.to_owned(),
            words: vec![0; words],
        }));
        Ok(HostBuffer(self.storage.len() - 1))
    }

    fn destroy_buffer(&mut self, buffer: &HostBuffer) {
        if let Some(slot) = self.storage.get_mut(buffer.0) {
            *slot = None;
        }
    }

    fn write_buffer(&mut self, buffer: &HostBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let storage = self.storage(buffer)?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut storage.words);
        let start = offset as usize;
        let end = start + data.len();
        if end > bytes.len() {
            return Err(SolverError::Device(format!(
                "write of {} bytes at {} overruns `{}` ({} bytes)",
                data.len(),
                offset,
                storage.label,
                bytes.len()
            )));
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: &HostBuffer, size: u64) -> Result<Vec<u8>> {
        let storage = self.storage(buffer)?;
        let bytes: &[u8] = bytemuck::cast_slice(&storage.words);
        bytes
            .get(..size as usize)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                SolverError::Readback(format!(
                    "{} bytes requested from `{}` ({} bytes)",
                    size,
                    storage.label,
                    bytes.len()
                ))
            })
    }

    fn load_kernels(&mut self, program: ProgramKind) -> Result<HostKernels> {
        Ok(HostKernels { kind: program })
    }

    fn dispatch(&mut self, dispatch: Dispatch<'_, Self>) -> Result<()> {
        // move the bound storage out so a stage can touch several buffers at once
        let mut slots = BTreeMap::new();
        let mut owners: HashMap<usize, BindingPoint> = HashMap::new();
        let mut taken = Vec::new();
        let mut result = Ok(());
        for (point, buffer) in dispatch.bindings.iter() {
            if let Some(&first) = owners.get(&buffer.0) {
                result = Err(SolverError::BindingAliased {
                    first,
                    second: point,
                });
                break;
            }
            match self.storage.get_mut(buffer.0).and_then(Option::take) {
                Some(storage) => {
                    owners.insert(buffer.0, point);
                    taken.push((point, buffer.0));
                    slots.insert(point, storage);
                }
                None => {
                    result = Err(SolverError::Device(format!(
                        "binding {point} refers to a destroyed buffer"
                    )));
                    break;
                }
            }
        }

        if result.is_ok() {
            let mut ctx = KernelContext {
                slots: slots.iter_mut().map(|(p, s)| (*p, &mut s.words)).collect(),
                uniforms: dispatch.uniforms,
                program: dispatch.kernels.kind,
                invocations: dispatch.workgroups * dispatch.workgroup_size,
                fault: RefCell::new(None),
            };
            result = kernels::run(dispatch.kernels.kind, dispatch.stage, &mut ctx);
            if let Some(message) = ctx.fault.into_inner() {
                warn!(
                    "{} stage {} faulted: {}",
                    dispatch.kernels.kind.name(),
                    dispatch.stage,
                    message
                );
                self.fault.get_or_insert(SolverError::KernelFault {
                    program: dispatch.program.name().into(),
                    stage: dispatch.stage,
                    message,
                });
            }
        }

        for (point, index) in taken {
            if let Some(storage) = slots.remove(&point) {
                self.storage[index] = Some(storage);
            }
        }
        self.dispatches += 1;
        result
    }

    fn check_errors(&mut self) -> Result<()> {
        match self.fault.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// What a stage sees while it runs: the bound buffers, the uniforms and the
/// number of invocations. Out-of-range accesses behave like robust buffer
/// access on a GPU (reads return zero, writes are dropped) and are reported
/// through [`ComputeDevice::check_errors`].
pub struct KernelContext<'a> {
    slots: BTreeMap<BindingPoint, &'a mut Vec<u32>>,
    uniforms: &'a UniformSet,
    program: ProgramKind,
    invocations: u32,
    fault: RefCell<Option<String>>,
}

impl KernelContext<'_> {
    pub fn invocations(&self) -> u32 {
        self.invocations
    }

    fn report(&self, message: String) {
        self.fault.borrow_mut().get_or_insert(message);
    }

    fn missing(&self, name: &str) -> SolverError {
        SolverError::MissingUniform {
            program: self.program.name().into(),
            name: name.into(),
        }
    }

    pub fn uniform_u32(&self, name: &str) -> Result<u32> {
        match self.uniforms.get(name) {
            Some(UniformValue::U32(v)) => Ok(v),
            _ => Err(self.missing(name)),
        }
    }

    pub fn uniform_f32(&self, name: &str) -> Result<f32> {
        match self.uniforms.get(name) {
            Some(UniformValue::F32(v)) => Ok(v),
            _ => Err(self.missing(name)),
        }
    }

    pub fn uniform_vec2(&self, name: &str) -> Result<Vec2> {
        match self.uniforms.get(name) {
            Some(UniformValue::Vec2(v)) => Ok(Vec2::from_array(v)),
            _ => Err(self.missing(name)),
        }
    }

    pub fn uniform_uvec2(&self, name: &str) -> Result<[u32; 2]> {
        match self.uniforms.get(name) {
            Some(UniformValue::UVec2(v)) => Ok(v),
            _ => Err(self.missing(name)),
        }
    }

    fn view<T: Pod>(&self, point: BindingPoint) -> &[T] {
        self.slots
            .get(&point)
            .and_then(|words| bytemuck::try_cast_slice(words.as_slice()).ok())
            .unwrap_or(&[])
    }

    /// Elements of `T` the buffer at `point` can hold.
    pub fn load<T: Pod>(&self, point: BindingPoint, index: u32) -> T {
        match self.view::<T>(point).get(index as usize) {
            Some(value) => *value,
            None => {
                self.report(format!("read of element {index} at binding {point} out of range"));
                T::zeroed()
            }
        }
    }

    pub fn store<T: Pod>(&mut self, point: BindingPoint, index: u32, value: T) {
        let written = match self
            .slots
            .get_mut(&point)
            .and_then(|words| bytemuck::try_cast_slice_mut::<u32, T>(words.as_mut_slice()).ok())
            .and_then(|elements| elements.get_mut(index as usize))
        {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        };
        if !written {
            self.report(format!("write of element {index} at binding {point} out of range"));
        }
    }

    /// Records a device-side fault without stopping the stage.
    pub fn fault(&self, message: String) {
        self.report(message);
    }
}
