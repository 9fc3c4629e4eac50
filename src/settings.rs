use bevy::prelude::Resource;
use glam::Vec2;

use crate::cpu::sph2d::Kernels2d;
use crate::device::{ComputeDevice, UniformValue};
use crate::error::{Result, SolverError};
use crate::program::ActiveProgram;

/// The viscosity and pressure multipliers are slider values; the solver sees
/// them scaled by this.
pub const MULTIPLIER_SCALE: f32 = 1e-3;

/// A runtime-tunable value that knows which uniform it feeds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Param<T> {
    name: &'static str,
    value: T,
}

impl<T: Copy + Into<UniformValue>> Param<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self { name, value }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn value(&self) -> T {
        self.value
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
    }

    /// Stages this value on `program` under its uniform name.
    pub fn sync<D: ComputeDevice>(&self, program: &mut ActiveProgram<'_, D>) {
        program.set_uniform(self.name, self.value.into());
    }
}

impl Param<f32> {
    pub fn sync_scaled<D: ComputeDevice>(&self, program: &mut ActiveProgram<'_, D>, scale: f32) {
        program.set_uniform(self.name, (self.value * scale).into());
    }
}

/// Flat solver configuration.
///
/// Structural values (radius, domain, spawn block, capacity, workgroup sizes,
/// scan block size) are read by `reset`. The `Param` values are synced to the
/// solver uniforms before the next step after they change.
#[derive(Resource, Clone, Debug, PartialEq)]
pub struct Settings {
    pub particle_radius: f32,
    /// Bin width equals the smoothing radius.
    pub smoothing_radius: f32,
    /// Domain extents, centred on the origin.
    pub domain: Vec2,
    /// Size of the lattice block filled by `reset`, anchored at the lower left corner.
    pub spawn_size: Vec2,

    pub timestep: Param<f32>,
    pub rest_density: Param<f32>,
    pub particle_mass: Param<f32>,
    pub artificial_viscosity: Param<f32>,
    pub artificial_pressure: Param<f32>,
    pub over_relaxation: Param<f32>,
    pub gravity: Vec2,

    pub solver_substeps: u32,
    pub solver_iterations: u32,
    pub integrate: bool,

    pub max_particles: usize,
    pub particle_workgroup_size: u32,
    pub bin_workgroup_size: u32,
    /// Bins per prefix-sum block. `None` keeps `floor(log2(bin_count))`.
    pub scan_block_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        let particle_radius = 0.25;
        let smoothing_radius = 5.0 * particle_radius;
        let mut settings = Self {
            particle_radius,
            smoothing_radius,
            domain: Vec2::new(400.0, 400.0),
            spawn_size: Vec2::new(100.0, 250.0),

            timestep: Param::new("dt", 0.0016),
            rest_density: Param::new("rest_density", 1.0),
            particle_mass: Param::new("particle_mass", 1.0),
            artificial_viscosity: Param::new("artificial_viscosity", 0.5),
            artificial_pressure: Param::new("artificial_pressure", 2.0),
            over_relaxation: Param::new("over_relaxation", 1.0),
            gravity: Vec2::new(0.0, -9.81),

            solver_substeps: 10,
            solver_iterations: 10,
            integrate: true,

            max_particles: 1_000_000,
            particle_workgroup_size: 256,
            bin_workgroup_size: 128,
            scan_block_size: None,
        };
        settings.particle_mass.set(settings.rest_mass());
        settings
    }
}

// slider ranges of the inspector
const SUBSTEPS: (u32, u32) = (1, 200);
const ITERATIONS: (u32, u32) = (1, 200);
const MASS: (f32, f32) = (0.1, 2.0);
const REST_DENSITY: (f32, f32) = (0.0, 2.0);
const MULTIPLIER: (f32, f32) = (0.0, 10.0);
const TIMESTEP: (f32, f32) = (1e-5, 0.02);
const RELAXATION: (f32, f32) = (0.1, 2.0);

fn clamp_param(param: &mut Param<f32>, (lo, hi): (f32, f32)) {
    let v = param.value();
    param.set(if v.is_nan() { lo } else { v.clamp(lo, hi) });
}

impl Settings {
    /// Particle spacing of the spawn lattice.
    pub fn spacing(&self) -> f32 {
        self.particle_radius * 2.0
    }

    pub fn bin_width(&self) -> f32 {
        self.smoothing_radius
    }

    /// Mass at which a particle inside the spawn lattice sits exactly at
    /// `rest_density`.
    pub fn rest_mass(&self) -> f32 {
        let kernels = Kernels2d::new(self.smoothing_radius);
        let spacing = self.spacing();
        let reach = (self.smoothing_radius / spacing).ceil() as i32;
        let mut sum = 0.0;
        for y in -reach..=reach {
            for x in -reach..=reach {
                let r = Vec2::new(x as f32, y as f32) * spacing;
                sum += kernels.w_poly6(r.length_squared());
            }
        }
        self.rest_density.value() / sum
    }

    /// Stages every runtime value except the timestep on the solver.
    pub fn sync_solver<D: ComputeDevice>(&self, solver: &mut ActiveProgram<'_, D>) {
        self.rest_density.sync(solver);
        self.particle_mass.sync(solver);
        self.artificial_viscosity.sync_scaled(solver, MULTIPLIER_SCALE);
        self.artificial_pressure.sync_scaled(solver, MULTIPLIER_SCALE);
        self.over_relaxation.sync(solver);
        solver.set_uniform("gravity", self.gravity.into());
        solver.set_uniform("smoothing_radius", self.smoothing_radius.into());
    }

    /// Clamps every runtime-tunable value into its valid range.
    pub fn sanitize(&mut self) {
        self.solver_substeps = self.solver_substeps.clamp(SUBSTEPS.0, SUBSTEPS.1);
        self.solver_iterations = self.solver_iterations.clamp(ITERATIONS.0, ITERATIONS.1);
        clamp_param(&mut self.particle_mass, MASS);
        clamp_param(&mut self.rest_density, REST_DENSITY);
        clamp_param(&mut self.artificial_viscosity, MULTIPLIER);
        clamp_param(&mut self.artificial_pressure, MULTIPLIER);
        clamp_param(&mut self.timestep, TIMESTEP);
        clamp_param(&mut self.over_relaxation, RELAXATION);
    }

    /// Rejects structural values no clamp can repair.
    pub fn validate(&self) -> Result<()> {
        let positive = |v: f32| v.is_finite() && v > 0.0;
        if !positive(self.particle_radius) || !positive(self.smoothing_radius) {
            return Err(SolverError::InvalidDomain(format!(
                "radii must be positive (particle {}, smoothing {})",
                self.particle_radius, self.smoothing_radius
            )));
        }
        if !positive(self.domain.x) || !positive(self.domain.y) {
            return Err(SolverError::InvalidDomain(format!(
                "domain {} is empty",
                self.domain
            )));
        }
        if self.domain.x < self.bin_width() || self.domain.y < self.bin_width() {
            return Err(SolverError::InvalidDomain(format!(
                "domain {} is smaller than one bin of width {}",
                self.domain,
                self.bin_width()
            )));
        }
        if self.spawn_size.x < 0.0 || self.spawn_size.y < 0.0 || !self.spawn_size.is_finite() {
            return Err(SolverError::InvalidDomain(format!(
                "spawn block {} is not a valid size",
                self.spawn_size
            )));
        }
        if self.particle_workgroup_size == 0 || self.bin_workgroup_size == 0 {
            return Err(SolverError::InvalidDomain(
                "workgroup sizes must be non-zero".into(),
            ));
        }
        if self.scan_block_size == Some(0) {
            return Err(SolverError::InvalidDomain("scan block size must be non-zero".into()));
        }
        if self.max_particles == 0 || self.max_particles > u32::MAX as usize {
            return Err(SolverError::CapacityExceeded {
                requested: self.max_particles,
                capacity: u32::MAX as usize,
            });
        }
        Ok(())
    }

    /// True when going from `self` to `other` needs a new buffer set.
    pub fn needs_reallocation(&self, other: &Settings) -> bool {
        self.smoothing_radius != other.smoothing_radius
            || self.domain != other.domain
            || self.max_particles != other.max_particles
            || self.scan_block_size != other.scan_block_size
            || self.particle_workgroup_size != other.particle_workgroup_size
            || self.bin_workgroup_size != other.bin_workgroup_size
    }

    /// Number of particles the spawn lattice produces.
    pub fn lattice_dims(&self) -> (u32, u32) {
        let spacing = self.spacing();
        let nx = (self.spawn_size.x / spacing + 1.0).floor() as u32;
        let ny = (self.spawn_size.y / spacing + 1.0).floor() as u32;
        (nx, ny)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_clamps_sliders() {
        let mut s = Settings::default();
        s.solver_substeps = 0;
        s.solver_iterations = 5000;
        s.particle_mass.set(-3.0);
        s.artificial_pressure.set(f32::NAN);
        s.sanitize();

        assert_eq!(s.solver_substeps, 1);
        assert_eq!(s.solver_iterations, 200);
        assert_eq!(s.particle_mass.value(), 0.1);
        assert_eq!(s.artificial_pressure.value(), 0.0);
    }

    #[test]
    fn default_mass_puts_the_lattice_at_rest_density() {
        let s = Settings::default();
        let mass = s.particle_mass.value();
        assert!((mass - 0.2515).abs() < 1e-3, "{mass}");

        let mut sanitized = s.clone();
        sanitized.sanitize();
        assert_eq!(sanitized.particle_mass.value(), mass);

        let mut denser = s.clone();
        denser.rest_density.set(2.0);
        assert!((denser.rest_mass() - 2.0 * mass).abs() < 1e-5);
    }

    #[test]
    fn default_lattice_matches_spawn_block() {
        let s = Settings::default();
        assert_eq!(s.lattice_dims(), (201, 501));
    }

    #[test]
    fn validate_rejects_tiny_domain() {
        let s = Settings {
            domain: Vec2::new(1.0, 400.0),
            ..Default::default()
        };
        assert!(matches!(s.validate(), Err(SolverError::InvalidDomain(_))));
    }

    #[test]
    fn runtime_params_do_not_reallocate() {
        let a = Settings::default();
        let mut b = a.clone();
        b.rest_density.set(1.5);
        b.solver_iterations = 3;
        assert!(!a.needs_reallocation(&b));
        b.max_particles = 10;
        assert!(a.needs_reallocation(&b));
    }
}
