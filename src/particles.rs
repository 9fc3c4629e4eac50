//! Structure-of-arrays particle state with a shadow generation for the sort.

use bevy::log::debug;
use bytemuck::Pod;

use crate::buffer::StructuredBuffer;
use crate::device::{BindingPoint, ComputeDevice};
use crate::error::{Result, SolverError};
use crate::gpu::ffi::{Float2, Meta};
use crate::program::StagedProgram;

/// Role-based binding points. The published generation of an attribute is
/// always at the even slot, its shadow at the odd slot after it.
pub mod binding {
    use crate::device::BindingPoint;

    pub const POSITION: BindingPoint = 0;
    pub const SHADOW_POSITION: BindingPoint = 1;
    pub const PREDICTED: BindingPoint = 2;
    pub const SHADOW_PREDICTED: BindingPoint = 3;
    pub const VELOCITY: BindingPoint = 4;
    pub const SHADOW_VELOCITY: BindingPoint = 5;
    pub const DENSITY: BindingPoint = 6;
    pub const SHADOW_DENSITY: BindingPoint = 7;
    pub const LAMBDA: BindingPoint = 8;
    pub const SHADOW_LAMBDA: BindingPoint = 9;
    pub const META: BindingPoint = 10;
    pub const SHADOW_META: BindingPoint = 11;
    pub const DELTA: BindingPoint = 12;
    pub const BINS: BindingPoint = 13;
    pub const BLOCK_SUMS: BindingPoint = 14;

    /// Every binding the solver program reads or writes.
    pub const SOLVER: [BindingPoint; 14] = [
        POSITION,
        SHADOW_POSITION,
        PREDICTED,
        SHADOW_PREDICTED,
        VELOCITY,
        SHADOW_VELOCITY,
        DENSITY,
        SHADOW_DENSITY,
        LAMBDA,
        SHADOW_LAMBDA,
        META,
        SHADOW_META,
        DELTA,
        BINS,
    ];

    pub const PREFIX_SUM: [BindingPoint; 2] = [BINS, BLOCK_SUMS];
}

/// Sorted per-particle attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attribute {
    Position,
    Predicted,
    Velocity,
    Density,
    Lambda,
    Meta,
}

impl Attribute {
    pub const ALL: [Attribute; 6] = [
        Attribute::Position,
        Attribute::Predicted,
        Attribute::Velocity,
        Attribute::Density,
        Attribute::Lambda,
        Attribute::Meta,
    ];

    /// Binding point of the published buffer; the shadow is the next one.
    pub fn binding(self) -> BindingPoint {
        match self {
            Attribute::Position => binding::POSITION,
            Attribute::Predicted => binding::PREDICTED,
            Attribute::Velocity => binding::VELOCITY,
            Attribute::Density => binding::DENSITY,
            Attribute::Lambda => binding::LAMBDA,
            Attribute::Meta => binding::META,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Attribute::Position => "position",
            Attribute::Predicted => "predicted_position",
            Attribute::Velocity => "velocity",
            Attribute::Density => "density",
            Attribute::Lambda => "lambda",
            Attribute::Meta => "meta",
        }
    }
}

/// Untyped view of one attribute buffer.
pub struct BufferView<'a, D: ComputeDevice> {
    pub label: &'a str,
    pub binding: BindingPoint,
    pub raw: &'a D::Buffer,
    pub len: usize,
}

/// Two equally shaped buffers of one attribute. Which one is published is
/// decided by the owning store, never by the pair.
struct Pair<T: Pod, D: ComputeDevice>([StructuredBuffer<T, D>; 2]);

impl<T: Pod, D: ComputeDevice> Pair<T, D> {
    fn allocate(
        device: &mut D,
        attribute: Attribute,
        capacity: usize,
        made: &mut Vec<D::Buffer>,
    ) -> Result<Self> {
        let a = tracked(device, attribute.label(), capacity, made)?;
        let b = tracked(device, &format!("cpy_{}", attribute.label()), capacity, made)?;
        Ok(Self([a, b]))
    }

    /// Points the published buffer at the even slot and the shadow at the odd one.
    fn assign(&mut self, front: usize, point: BindingPoint) {
        self.0[front].bind(point);
        self.0[1 - front].bind(point + 1);
    }

    fn resize(&mut self, device: &mut D, n: usize) -> Result<()> {
        for buffer in &mut self.0 {
            buffer.resize(device, n)?;
        }
        Ok(())
    }

    fn attach(&self, program: &mut StagedProgram<D>) -> Result<()> {
        for buffer in &self.0 {
            program.attach(buffer)?;
        }
        Ok(())
    }

    fn view(&self, index: usize) -> BufferView<'_, D> {
        let buffer = &self.0[index];
        BufferView {
            label: buffer.label(),
            binding: buffer.binding().unwrap_or_default(),
            raw: buffer.raw(),
            len: buffer.len(),
        }
    }

    fn destroy(self, device: &mut D) {
        let [a, b] = self.0;
        a.destroy(device);
        b.destroy(device);
    }
}

/// Allocates one buffer and records its handle so a failed store can be
/// released as a whole.
fn tracked<T: Pod, D: ComputeDevice>(
    device: &mut D,
    label: &str,
    capacity: usize,
    made: &mut Vec<D::Buffer>,
) -> Result<StructuredBuffer<T, D>> {
    let buffer = StructuredBuffer::allocate(device, label, capacity)?;
    made.push(buffer.raw().clone());
    Ok(buffer)
}

/// Host copy of the published generation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParticleSnapshot {
    pub position: Vec<Float2>,
    pub predicted: Vec<Float2>,
    pub velocity: Vec<Float2>,
    pub density: Vec<f32>,
    pub lambda: Vec<f32>,
    pub meta: Vec<Meta>,
}

impl ParticleSnapshot {
    pub fn len(&self) -> usize {
        self.position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_empty()
    }
}

/// Owns every particle attribute buffer, its shadow and the solver scratch buffer.
pub struct ParticleStore<D: ComputeDevice> {
    position: Pair<Float2, D>,
    predicted: Pair<Float2, D>,
    velocity: Pair<Float2, D>,
    density: Pair<f32, D>,
    lambda: Pair<f32, D>,
    meta: Pair<Meta, D>,
    delta: StructuredBuffer<Float2, D>,
    count: usize,
    capacity: usize,
    front: usize,
    generation: u64,
}

impl<D: ComputeDevice> ParticleStore<D> {
    /// Allocates every buffer of the store or none of them.
    pub fn new(device: &mut D, capacity: usize) -> Result<Self> {
        let mut made = Vec::new();
        let store = Self::allocate(device, capacity, &mut made);
        if store.is_err() {
            for raw in &made {
                device.destroy_buffer(raw);
            }
        }
        store
    }

    fn allocate(device: &mut D, capacity: usize, made: &mut Vec<D::Buffer>) -> Result<Self> {
        let mut delta = tracked(device, "delta", capacity, made)?;
        delta.bind(binding::DELTA);
        let mut store = Self {
            position: Pair::allocate(device, Attribute::Position, capacity, made)?,
            predicted: Pair::allocate(device, Attribute::Predicted, capacity, made)?,
            velocity: Pair::allocate(device, Attribute::Velocity, capacity, made)?,
            density: Pair::allocate(device, Attribute::Density, capacity, made)?,
            lambda: Pair::allocate(device, Attribute::Lambda, capacity, made)?,
            meta: Pair::allocate(device, Attribute::Meta, capacity, made)?,
            delta,
            count: 0,
            capacity,
            front: 0,
            generation: 0,
        };
        store.assign_roles();
        Ok(store)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of publishes since allocation. Every published attribute
    /// belongs to this generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn assign_roles(&mut self) {
        let front = self.front;
        self.position.assign(front, binding::POSITION);
        self.predicted.assign(front, binding::PREDICTED);
        self.velocity.assign(front, binding::VELOCITY);
        self.density.assign(front, binding::DENSITY);
        self.lambda.assign(front, binding::LAMBDA);
        self.meta.assign(front, binding::META);
    }

    /// Sets the logical length of every attribute buffer. Either all of them
    /// change or none does.
    pub fn set_count(&mut self, device: &mut D, n: usize) -> Result<()> {
        if n > self.capacity {
            return Err(SolverError::CapacityExceeded {
                requested: n,
                capacity: self.capacity,
            });
        }
        self.position.resize(device, n)?;
        self.predicted.resize(device, n)?;
        self.velocity.resize(device, n)?;
        self.density.resize(device, n)?;
        self.lambda.resize(device, n)?;
        self.meta.resize(device, n)?;
        self.delta.resize(device, n)?;
        self.count = n;
        Ok(())
    }

    /// The buffer the next scatter writes `attribute` into.
    pub fn shadow_of(&self, attribute: Attribute) -> BufferView<'_, D> {
        let back = 1 - self.front;
        match attribute {
            Attribute::Position => self.position.view(back),
            Attribute::Predicted => self.predicted.view(back),
            Attribute::Velocity => self.velocity.view(back),
            Attribute::Density => self.density.view(back),
            Attribute::Lambda => self.lambda.view(back),
            Attribute::Meta => self.meta.view(back),
        }
    }

    /// The published buffer of `attribute`.
    pub fn published(&self, attribute: Attribute) -> BufferView<'_, D> {
        match attribute {
            Attribute::Position => self.position.view(self.front),
            Attribute::Predicted => self.predicted.view(self.front),
            Attribute::Velocity => self.velocity.view(self.front),
            Attribute::Density => self.density.view(self.front),
            Attribute::Lambda => self.lambda.view(self.front),
            Attribute::Meta => self.meta.view(self.front),
        }
    }

    /// Binds every buffer to `program` at its current role.
    pub fn attach(&self, program: &mut StagedProgram<D>) -> Result<()> {
        self.position.attach(program)?;
        self.predicted.attach(program)?;
        self.velocity.attach(program)?;
        self.density.attach(program)?;
        self.lambda.attach(program)?;
        self.meta.attach(program)?;
        program.attach(&self.delta)
    }

    /// Makes the shadow generation the published one for every attribute at
    /// once and rebinds `program`. No data moves.
    pub fn publish(&mut self, program: &mut StagedProgram<D>) -> Result<()> {
        self.front = 1 - self.front;
        self.generation += 1;
        self.assign_roles();
        debug!("particle generation {} published", self.generation);
        self.attach(program)
    }

    /// Returns to the initial role assignment.
    pub fn reset_roles(&mut self, program: &mut StagedProgram<D>) -> Result<()> {
        self.front = 0;
        self.assign_roles();
        self.attach(program)
    }

    pub fn free_host_memory(&mut self) {
        for side in [0, 1] {
            self.position.0[side].free_host_memory();
            self.predicted.0[side].free_host_memory();
            self.velocity.0[side].free_host_memory();
            self.density.0[side].free_host_memory();
            self.lambda.0[side].free_host_memory();
            self.meta.0[side].free_host_memory();
        }
        self.delta.free_host_memory();
    }

    /// Replaces the published generation with `snapshot` and uploads it.
    /// The scratch buffer is zeroed.
    pub fn upload(&mut self, device: &mut D, snapshot: ParticleSnapshot) -> Result<()> {
        let n = snapshot.len();
        for (label, len) in [
            ("predicted_position", snapshot.predicted.len()),
            ("velocity", snapshot.velocity.len()),
            ("density", snapshot.density.len()),
            ("lambda", snapshot.lambda.len()),
            ("meta", snapshot.meta.len()),
        ] {
            if len != n {
                return Err(SolverError::LengthMismatch {
                    label: label.into(),
                    len,
                    expected: n,
                });
            }
        }
        self.set_count(device, n)?;

        let front = self.front;
        *self.position.0[front].host_mut() = snapshot.position;
        *self.predicted.0[front].host_mut() = snapshot.predicted;
        *self.velocity.0[front].host_mut() = snapshot.velocity;
        *self.density.0[front].host_mut() = snapshot.density;
        *self.lambda.0[front].host_mut() = snapshot.lambda;
        *self.meta.0[front].host_mut() = snapshot.meta;
        self.position.0[front].upload(device)?;
        self.predicted.0[front].upload(device)?;
        self.velocity.0[front].upload(device)?;
        self.density.0[front].upload(device)?;
        self.lambda.0[front].upload(device)?;
        self.meta.0[front].upload(device)?;
        self.delta.clear(device)
    }

    /// Synchronous copy of the published generation.
    pub fn download(&mut self, device: &mut D) -> Result<ParticleSnapshot> {
        let front = self.front;
        Ok(ParticleSnapshot {
            position: self.position.0[front].download(device)?.to_vec(),
            predicted: self.predicted.0[front].download(device)?.to_vec(),
            velocity: self.velocity.0[front].download(device)?.to_vec(),
            density: self.density.0[front].download(device)?.to_vec(),
            lambda: self.lambda.0[front].download(device)?.to_vec(),
            meta: self.meta.0[front].download(device)?.to_vec(),
        })
    }

    pub fn destroy(self, device: &mut D) {
        self.position.destroy(device);
        self.predicted.destroy(device);
        self.velocity.destroy(device);
        self.density.destroy(device);
        self.lambda.destroy(device);
        self.meta.destroy(device);
        self.delta.destroy(device);
    }
}
