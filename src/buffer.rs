use bytemuck::Pod;

use crate::device::{BindingPoint, ComputeDevice};
use crate::error::{Result, SolverError};

/// Outcome of [`StructuredBuffer::resize`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resized {
    /// Same storage, only the logical length changed.
    InPlace,
    /// New storage; every program the buffer was attached to must attach it again.
    Reallocated,
}

/// Typed device array with a host mirror and a binding identity.
///
/// The host mirror is only filled by [`download`](Self::download) or by the
/// caller through [`host_mut`](Self::host_mut) before an [`upload`](Self::upload).
pub struct StructuredBuffer<T: Pod, D: ComputeDevice> {
    label: String,
    raw: D::Buffer,
    capacity: usize,
    len: usize,
    binding: Option<BindingPoint>,
    host: Vec<T>,
}

impl<T: Pod, D: ComputeDevice> StructuredBuffer<T, D> {
    const STRIDE: u64 = std::mem::size_of::<T>() as u64;

    /// Reserves device storage for `capacity` elements. Logical length starts at 0.
    pub fn allocate(device: &mut D, label: &str, capacity: usize) -> Result<Self> {
        let raw = device.create_buffer(label, Self::bytes_for(capacity))?;
        Ok(Self {
            label: label.to_owned(),
            raw,
            capacity,
            len: 0,
            binding: None,
            host: Vec::new(),
        })
    }

    fn bytes_for(elements: usize) -> u64 {
        // zero sized storage bindings are rejected by the device
        (elements.max(1) as u64 * Self::STRIDE).next_multiple_of(4)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn raw(&self) -> &D::Buffer {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bind(&mut self, point: BindingPoint) {
        self.binding = Some(point);
    }

    pub fn binding(&self) -> Option<BindingPoint> {
        self.binding
    }

    /// Binding point, or an error for a buffer that was never bound.
    pub fn binding_point(&self) -> Result<BindingPoint> {
        self.binding.ok_or_else(|| SolverError::NoBindingPoint {
            label: self.label.clone(),
        })
    }

    pub fn host(&self) -> &[T] {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut Vec<T> {
        &mut self.host
    }

    pub fn free_host_memory(&mut self) {
        self.host = Vec::new();
    }

    /// Pushes the host mirror to the device. The mirror length becomes the
    /// logical length.
    pub fn upload(&mut self, device: &mut D) -> Result<()> {
        if self.host.len() > self.capacity {
            return Err(SolverError::CapacityExceeded {
                requested: self.host.len(),
                capacity: self.capacity,
            });
        }
        if !self.host.is_empty() {
            device.write_buffer(&self.raw, 0, bytemuck::cast_slice(&self.host))?;
        }
        self.len = self.host.len();
        Ok(())
    }

    /// Pulls the first `len` elements back into the host mirror.
    ///
    /// This is a synchronization point: the device drains every dispatch
    /// issued so far before the copy.
    pub fn download(&mut self, device: &mut D) -> Result<&[T]> {
        let bytes = device.read_buffer(&self.raw, self.len as u64 * Self::STRIDE)?;
        self.host = bytemuck::pod_collect_to_vec(&bytes);
        self.host.truncate(self.len);
        Ok(&self.host)
    }

    /// Writes zeros over the logical range.
    pub fn clear(&mut self, device: &mut D) -> Result<()> {
        if self.len == 0 {
            return Ok(());
        }
        let zeros = vec![0u8; (self.len as u64 * Self::STRIDE) as usize];
        device.write_buffer(&self.raw, 0, &zeros)
    }

    /// Changes the logical element count. Growing past capacity allocates new
    /// storage (contents are not preserved). The binding point survives the
    /// reallocation but programs still hold the old raw handle, so every
    /// program the buffer was attached to must attach it again.
    pub fn resize(&mut self, device: &mut D, n: usize) -> Result<Resized> {
        if n <= self.capacity {
            self.len = n;
            return Ok(Resized::InPlace);
        }
        let raw = device.create_buffer(&self.label, Self::bytes_for(n))?;
        device.destroy_buffer(&self.raw);
        self.raw = raw;
        self.capacity = n;
        self.len = n;
        Ok(Resized::Reallocated)
    }

    pub fn destroy(self, device: &mut D) {
        device.destroy_buffer(&self.raw);
    }
}
