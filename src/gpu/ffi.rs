use bytemuck::{Pod, Zeroable};

// not using glam in device layouts to make sure WGSL compatibility

/// `array<vec2<f32>>` element.
pub type Float2 = [f32; 2];

/// Material tag stored in `Meta::phase`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Fluid = 0,
    Granular = 1,
}

/// Identity of a particle across sort permutations, `vec4<u32>` on the device.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Meta {
    pub phase: u32,
    pub original_id: u32, // assigned at spawn, never reused
    pub sorted_id: u32,   // slot written by the last scatter
    pub reserved: u32,
}

impl Meta {
    pub fn spawn(phase: Phase, id: u32) -> Self {
        Self {
            phase: phase as u32,
            original_id: id,
            sorted_id: id,
            reserved: 0,
        }
    }
}

/// One spatial hash cell.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Bin {
    pub count: u32,         // particles bucketed into this bin
    pub global_offset: u32, // particles in all bins before this one
    pub cursor: u32,        // slots already claimed by the scatter
    pub index: u32,
}

/// Running total of one scan block plus the scratch slot of the tree step.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BlockSum {
    pub total: u32,
    pub scratch: u32,
}
