//! Position based fluids on a staged compute pipeline: particles are binned
//! and counting-sorted every substep, then a density constraint is solved
//! against the 3x3 bin neighborhood.

pub mod buffer;
pub mod device;
pub mod error;
pub mod grid;
pub mod particles;
pub mod program;
pub mod search;
pub mod settings;
pub mod simulation;

pub mod cpu {
    pub mod device;
    pub mod kernels;
    pub mod sph2d;
}

pub mod gpu {
    pub mod device;
    pub mod ffi;
    pub mod plugin;
}

pub use device::{ComputeDevice, ProgramKind};
pub use error::{Result, SolverError};
pub use settings::{Param, Settings};
pub use simulation::{RenderBinding, SimState, Simulation, SortReport};
