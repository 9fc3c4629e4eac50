use thiserror::Error;

use crate::simulation::SimState;

/// Everything the solver core can refuse or report.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    // configuration
    #[error("requested {requested} elements but capacity is {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },

    #[error("attribute buffer `{label}` holds {len} elements, expected {expected}")]
    LengthMismatch {
        label: String,
        len: usize,
        expected: usize,
    },

    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("spawn region produces no particles")]
    EmptyPopulation,

    // precondition
    #[error("not allowed while the simulation is {state:?}")]
    NotRunning { state: SimState },

    #[error("timestep {0} is not a positive finite number")]
    InvalidTimestep(f32),

    #[error("cannot go from {from:?} to {to:?}")]
    InvalidTransition { from: SimState, to: SimState },

    #[error("program `{program}` dispatched with nothing bound at binding {binding}")]
    UnboundBinding { program: String, binding: u32 },

    #[error("buffer `{label}` has no binding point")]
    NoBindingPoint { label: String },

    #[error("program `{program}` has {stage_count} stages, stage {stage} requested")]
    StageOutOfRange {
        program: String,
        stage: u32,
        stage_count: u32,
    },

    #[error("program `{program}` reads uniform `{name}` which was never set")]
    MissingUniform { program: String, name: String },

    #[error("one buffer is bound at bindings {first} and {second} of the same dispatch")]
    BindingAliased { first: u32, second: u32 },

    // device
    #[error("device error: {0}")]
    Device(String),

    #[error("kernel compilation failed for `{program}`: {message}")]
    KernelCompilation { program: String, message: String },

    #[error("stage {stage} of `{program}` faulted: {message}")]
    KernelFault {
        program: String,
        stage: u32,
        message: String,
    },

    #[error("readback failed: {0}")]
    Readback(String),

    // verification
    #[error("sort violation: {0}")]
    SortViolation(String),
}

pub type Result<T, E = SolverError> = std::result::Result<T, E>;
