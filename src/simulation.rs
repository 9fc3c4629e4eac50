//! The loop that owns every buffer and program and drives them frame by frame.

use bevy::log::{debug, info, warn};
use glam::Vec2;

use crate::device::{ComputeDevice, ProgramKind, UniformValue};
use crate::error::{Result, SolverError};
use crate::gpu::ffi::{Bin, Float2, Meta, Phase};
use crate::grid::{BinGrid, GridParams};
use crate::particles::{binding, Attribute, BufferView, ParticleSnapshot, ParticleStore};
use crate::program::StagedProgram;
use crate::search::{NeighborSearch, SolverStage};
use crate::settings::Settings;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimState {
    /// Buffers exist but hold no population.
    Idle,
    /// Population generated and uploaded, not advancing yet.
    Configured,
    Running,
    Paused,
}

/// Fills the spawn block with a regular lattice, row by row from the lower
/// left corner of the domain. Ids follow the scan order.
pub fn spawn_lattice(settings: &Settings) -> ParticleSnapshot {
    let spacing = settings.spacing();
    let (nx, ny) = settings.lattice_dims();
    let half = settings.domain * 0.5;
    let n = (nx * ny) as usize;

    let mut snapshot = ParticleSnapshot {
        position: Vec::with_capacity(n),
        predicted: Vec::with_capacity(n),
        velocity: vec![[0.0; 2]; n],
        density: vec![0.0; n],
        lambda: vec![0.0; n],
        meta: Vec::with_capacity(n),
    };
    let mut id = 0;
    for yi in 0..ny {
        for xi in 0..nx {
            let p = Vec2::new((xi + 1) as f32 * spacing, (yi + 1) as f32 * spacing) - half;
            snapshot.position.push(p.to_array());
            snapshot.predicted.push(p.to_array());
            snapshot.meta.push(Meta::spawn(Phase::Fluid, id));
            id += 1;
        }
    }
    snapshot
}

/// What the renderer needs to draw the current frame.
pub struct RenderBinding<'a, D: ComputeDevice> {
    pub position: BufferView<'a, D>,
    pub velocity: BufferView<'a, D>,
    pub meta: BufferView<'a, D>,
    /// Particle instances to draw.
    pub count: u32,
    /// Bin instances, for drawing the grid overlay.
    pub bin_count: u32,
    pub generation: u64,
}

/// Result of [`Simulation::verify_sort`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SortReport {
    pub particles: usize,
    /// Original ids absent from the published meta buffer.
    pub missing: Vec<u32>,
    /// Original ids present more than once.
    pub duplicated: Vec<u32>,
    /// Slots whose particle lies outside the range of its bin, or whose
    /// `sorted_id` is not the slot itself.
    pub misplaced: Vec<u32>,
    /// Bins whose offset is not the sum of the counts before them.
    pub offset_breaks: Vec<u32>,
    /// Sum of all bin counts.
    pub binned: u64,
}

impl SortReport {
    pub fn is_sorted(&self) -> bool {
        self.missing.is_empty()
            && self.duplicated.is_empty()
            && self.misplaced.is_empty()
            && self.offset_breaks.is_empty()
            && self.binned == self.particles as u64
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_sorted() {
            return Ok(self);
        }
        Err(SolverError::SortViolation(format!(
            "{} missing, {} duplicated, {} misplaced, {} offset breaks, {} of {} binned",
            self.missing.len(),
            self.duplicated.len(),
            self.misplaced.len(),
            self.offset_breaks.len(),
            self.binned,
            self.particles
        )))
    }
}

/// Everything sized by the structural settings. Replaced as a whole.
struct Buffers<D: ComputeDevice> {
    particles: ParticleStore<D>,
    grid: BinGrid<D>,
    solver: StagedProgram<D>,
    prefix: StagedProgram<D>,
}

impl<D: ComputeDevice> Buffers<D> {
    /// Allocates a complete set. Whatever was created before a failing
    /// allocation is released again.
    fn new(device: &mut D, settings: &Settings) -> Result<Self> {
        let solver = StagedProgram::new(
            device,
            ProgramKind::Solver,
            settings.particle_workgroup_size,
            binding::SOLVER,
        )?;
        let prefix = StagedProgram::new(
            device,
            ProgramKind::PrefixSum,
            settings.bin_workgroup_size,
            binding::PREFIX_SUM,
        )?;
        let params = GridParams::new(settings.domain, settings.bin_width());
        let grid = BinGrid::new(device, params, settings.scan_block_size)?;
        let particles = match ParticleStore::new(device, settings.max_particles) {
            Ok(particles) => particles,
            Err(err) => {
                grid.destroy(device);
                return Err(err);
            }
        };

        let mut buffers = Self {
            particles,
            grid,
            solver,
            prefix,
        };
        if let Err(err) = buffers.attach(device) {
            buffers.destroy(device);
            return Err(err);
        }
        info!(
            "allocated {} particle slots, {}x{} bins in {} blocks of {}",
            settings.max_particles,
            params.dims[0],
            params.dims[1],
            buffers.grid.scan().block_count,
            buffers.grid.scan().block_size
        );
        Ok(buffers)
    }

    fn attach(&mut self, device: &mut D) -> Result<()> {
        self.particles.attach(&mut self.solver)?;
        self.grid.attach(&mut self.solver, &mut self.prefix)?;
        self.grid.sync_prefix(&mut self.prefix.use_on(device));
        self.grid.sync_solver(&mut self.solver.use_on(device));
        Ok(())
    }

    /// Uploads `snapshot` as the published generation and stages every
    /// uniform the stages read.
    fn populate(
        &mut self,
        device: &mut D,
        settings: &Settings,
        snapshot: ParticleSnapshot,
    ) -> Result<()> {
        let n = snapshot.len() as u32;
        self.particles.reset_roles(&mut self.solver)?;
        self.particles.upload(device, snapshot)?;
        self.particles.free_host_memory();

        let mut solver = self.solver.use_on(device);
        solver.set_workgroup_layout(n);
        solver.set_uniform("num_particles", n.into());
        self.grid.sync_solver(&mut solver);
        settings.sync_solver(&mut solver);
        settings.timestep.sync(&mut solver);
        self.grid.sync_prefix(&mut self.prefix.use_on(device));
        device.check_errors()
    }

    fn destroy(self, device: &mut D) {
        self.particles.destroy(device);
        self.grid.destroy(device);
    }
}

/// A particle solver on one device.
///
/// ```text
/// Idle --reset--> Configured --resume--> Running <--pause/resume--> Paused
///                      ^------------------reset (from any state)-------'
/// ```
pub struct Simulation<D: ComputeDevice> {
    device: D,
    settings: Settings,
    /// Settings the current buffer set was sized for.
    allocated: Settings,
    buffers: Buffers<D>,
    search: NeighborSearch,
    state: SimState,
    params_dirty: bool,
    elapsed: f32,
    frame: u64,
}

impl<D: ComputeDevice> Simulation<D> {
    /// Allocates the buffer set for `settings`. No particles exist until
    /// [`reset`](Self::reset).
    pub fn new(mut device: D, mut settings: Settings) -> Result<Self> {
        settings.sanitize();
        settings.validate()?;
        let buffers = Buffers::new(&mut device, &settings)?;
        Ok(Self {
            device,
            allocated: settings.clone(),
            settings,
            buffers,
            search: NeighborSearch,
            state: SimState::Idle,
            params_dirty: true,
            elapsed: 0.0,
            frame: 0,
        })
    }

    pub fn state(&self) -> SimState {
        self.state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Edits the settings. Runtime parameters reach the device before the
    /// next step; structural ones at the next [`reset`](Self::reset).
    pub fn update_settings(&mut self, f: impl FnOnce(&mut Settings)) {
        f(&mut self.settings);
        self.settings.sanitize();
        self.params_dirty = true;
        if self.allocated.needs_reallocation(&self.settings) {
            debug!("structural settings changed, buffers are rebuilt on the next reset");
        }
    }

    pub fn particle_count(&self) -> usize {
        self.buffers.particles.count()
    }

    pub fn bin_count(&self) -> u32 {
        self.buffers.grid.bin_count()
    }

    pub fn grid(&self) -> &GridParams {
        self.buffers.grid.params()
    }

    /// Simulated seconds since the last reset.
    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }

    /// Steps since the last reset.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Value staged for `name` on one of the two programs.
    pub fn uniform(&self, program: ProgramKind, name: &str) -> Option<UniformValue> {
        match program {
            ProgramKind::Solver => self.buffers.solver.uniform(name),
            ProgramKind::PrefixSum => self.buffers.prefix.uniform(name),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Regenerates the initial population and uploads it. Allowed from any
    /// state.
    ///
    /// Everything that can be checked up front is checked before a buffer is
    /// touched, and a structural change builds the new buffer set next to the
    /// old one, so those failures keep the previous population and state. A
    /// device error while overwriting the current buffers leaves nothing valid
    /// to run and drops back to `Idle`.
    pub fn reset(&mut self) -> Result<()> {
        let settings = self.settings.clone();
        settings.validate()?;
        let snapshot = spawn_lattice(&settings);
        if snapshot.is_empty() {
            return Err(SolverError::EmptyPopulation);
        }
        if snapshot.len() > settings.max_particles {
            return Err(SolverError::CapacityExceeded {
                requested: snapshot.len(),
                capacity: settings.max_particles,
            });
        }
        // faults of earlier dispatches belong to the population being replaced
        if let Err(err) = self.device.check_errors() {
            warn!("discarding device error from before the reset: {err}");
        }

        let n = snapshot.len();
        if self.allocated.needs_reallocation(&settings) {
            let mut fresh = Buffers::new(&mut self.device, &settings)?;
            if let Err(err) = fresh.populate(&mut self.device, &settings, snapshot) {
                fresh.destroy(&mut self.device);
                warn!("reset failed: {err}");
                return Err(err);
            }
            let old = std::mem::replace(&mut self.buffers, fresh);
            old.destroy(&mut self.device);
            self.allocated = settings;
        } else if let Err(err) = self.buffers.populate(&mut self.device, &settings, snapshot) {
            warn!("reset failed: {err}");
            self.state = SimState::Idle;
            return Err(err);
        }

        self.params_dirty = false;
        self.elapsed = 0.0;
        self.frame = 0;
        self.state = SimState::Configured;
        info!(
            "reset: {} particles, {} bins, {} scan blocks",
            n,
            self.buffers.grid.bin_count(),
            self.buffers.grid.scan().block_count
        );
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        match self.state {
            SimState::Configured | SimState::Paused | SimState::Running => {
                self.state = SimState::Running;
                Ok(())
            }
            SimState::Idle => Err(SolverError::InvalidTransition {
                from: SimState::Idle,
                to: SimState::Running,
            }),
        }
    }

    /// Stops advancing at the next frame boundary. Buffers are untouched.
    pub fn pause(&mut self) -> Result<()> {
        match self.state {
            SimState::Configured | SimState::Running | SimState::Paused => {
                self.state = SimState::Paused;
                Ok(())
            }
            SimState::Idle => Err(SolverError::InvalidTransition {
                from: SimState::Idle,
                to: SimState::Paused,
            }),
        }
    }

    /// Advances by `dt` seconds split into `solver_substeps` substeps.
    ///
    /// Every dispatch is queued in order and nothing waits for completion;
    /// reading results back is a separate [`download`](Self::download).
    pub fn step(&mut self, dt: f32) -> Result<()> {
        if self.state != SimState::Running {
            return Err(SolverError::NotRunning { state: self.state });
        }
        if !dt.is_finite() || dt <= 0.0 {
            return Err(SolverError::InvalidTimestep(dt));
        }

        if let Err(err) = self.advance(dt) {
            // whatever the stages recorded before the failure is stale now
            if let Err(fault) = self.device.check_errors() {
                warn!("dropping device error of an aborted step: {fault}");
            }
            return Err(err);
        }
        self.elapsed += dt;
        self.frame += 1;
        self.device.check_errors()
    }

    fn advance(&mut self, dt: f32) -> Result<()> {
        let settings = &self.settings;
        let device = &mut self.device;
        let Buffers {
            particles,
            grid,
            solver,
            prefix,
        } = &mut self.buffers;

        {
            let mut active = solver.use_on(device);
            if self.params_dirty {
                settings.sync_solver(&mut active);
                self.params_dirty = false;
            }
            let mut substep = settings.timestep;
            substep.set(dt / settings.solver_substeps as f32);
            substep.sync(&mut active);
        }

        for _ in 0..settings.solver_substeps {
            solver.use_on(device).execute(SolverStage::Predict as u32)?;
            self.search.run(device, solver, prefix, grid, particles)?;
            if !settings.integrate {
                continue;
            }

            let mut active = solver.use_on(device);
            for _ in 0..settings.solver_iterations {
                active.execute(SolverStage::Lambda as u32)?;
                active.execute(SolverStage::Correct as u32)?;
                active.execute(SolverStage::Apply as u32)?;
            }
            // viscosity reads the positions commit overwrites
            active.execute(SolverStage::Viscosity as u32)?;
            active.execute(SolverStage::Commit as u32)?;
        }
        Ok(())
    }

    /// Dispatches one stage of one program with the current bindings and
    /// uniforms, nothing before or after it. A scatter run this way leaves
    /// its output in the shadow generation.
    pub fn execute_stage(&mut self, program: ProgramKind, stage: u32) -> Result<()> {
        if self.state == SimState::Idle {
            return Err(SolverError::NotRunning { state: self.state });
        }
        let target = match program {
            ProgramKind::Solver => &mut self.buffers.solver,
            ProgramKind::PrefixSum => &mut self.buffers.prefix,
        };
        target.use_on(&mut self.device).execute(stage)?;
        self.device.check_errors()
    }

    /// Blocks until the device is idle and copies the published generation back.
    pub fn download(&mut self) -> Result<ParticleSnapshot> {
        self.buffers.particles.download(&mut self.device)
    }

    pub fn download_bins(&mut self) -> Result<Vec<Bin>> {
        self.buffers.grid.download(&mut self.device)
    }

    /// Runs one neighbor search on the current predicted positions and checks
    /// the order it produced.
    pub fn verify_sort(&mut self) -> Result<SortReport> {
        if self.state == SimState::Idle {
            return Err(SolverError::NotRunning { state: self.state });
        }
        let Buffers {
            particles,
            grid,
            solver,
            prefix,
        } = &mut self.buffers;
        self.search
            .run(&mut self.device, solver, prefix, grid, particles)?;
        self.device.check_errors()?;

        let snapshot = self.download()?;
        let bins = self.download_bins()?;
        let report = check_sort(self.grid(), &snapshot.predicted, &snapshot.meta, &bins);
        if !report.is_sorted() {
            warn!("sort check failed: {report:?}");
        }
        Ok(report)
    }

    /// Buffers and counts the renderer draws from this frame.
    pub fn render_binding(&self) -> RenderBinding<'_, D> {
        let particles = &self.buffers.particles;
        RenderBinding {
            position: particles.published(Attribute::Position),
            velocity: particles.published(Attribute::Velocity),
            meta: particles.published(Attribute::Meta),
            count: particles.count() as u32,
            bin_count: self.buffers.grid.bin_count(),
            generation: particles.generation(),
        }
    }

    /// Releases every buffer and hands the device back.
    pub fn shutdown(mut self) -> D {
        self.buffers.destroy(&mut self.device);
        self.device
    }
}

fn check_sort(grid: &GridParams, predicted: &[Float2], meta: &[Meta], bins: &[Bin]) -> SortReport {
    let n = meta.len();
    let mut report = SortReport {
        particles: n,
        ..SortReport::default()
    };

    let mut seen = vec![0u32; n];
    for m in meta {
        match seen.get_mut(m.original_id as usize) {
            Some(count) => *count += 1,
            None => report.duplicated.push(m.original_id),
        }
    }
    for (id, &count) in seen.iter().enumerate() {
        match count {
            0 => report.missing.push(id as u32),
            1 => {}
            _ => report.duplicated.push(id as u32),
        }
    }

    let mut expected = 0u64;
    for (b, bin) in bins.iter().enumerate() {
        if bin.global_offset as u64 != expected {
            report.offset_breaks.push(b as u32);
        }
        expected += bin.count as u64;
    }
    report.binned = expected;

    for (slot, (p, m)) in predicted.iter().zip(meta).enumerate() {
        let slot = slot as u32;
        let placed = bins
            .get(grid.cell_index_of(Vec2::from_array(*p)) as usize)
            .is_some_and(|bin| (bin.global_offset..bin.global_offset + bin.count).contains(&slot));
        if !placed || m.sorted_id != slot {
            report.misplaced.push(slot);
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lattice_starts_one_spacing_inside_the_corner() {
        let settings = Settings {
            domain: Vec2::new(10.0, 10.0),
            spawn_size: Vec2::new(1.0, 0.5),
            ..Default::default()
        };
        let lattice = spawn_lattice(&settings);
        assert_eq!(lattice.len(), 3 * 2);
        assert_eq!(lattice.position[0], [-4.5, -4.5]);
        assert_eq!(lattice.position[2], [-3.5, -4.5]);
        assert_eq!(lattice.position[3], [-4.5, -4.0]);
        assert_eq!(lattice.meta[4], Meta::spawn(Phase::Fluid, 4));
        assert_eq!(lattice.position, lattice.predicted);
    }

    #[test]
    fn sort_check_flags_broken_offsets() {
        let grid = GridParams::new(Vec2::new(2.0, 2.0), 1.0);
        let predicted = [[-0.5, -0.5], [0.5, 0.5]];
        let meta = [Meta::spawn(Phase::Fluid, 0), Meta::spawn(Phase::Fluid, 1)];
        let mut bins = vec![
            Bin { count: 1, global_offset: 0, cursor: 1, index: 0 },
            Bin { count: 0, global_offset: 1, cursor: 0, index: 1 },
            Bin { count: 0, global_offset: 1, cursor: 0, index: 2 },
            Bin { count: 1, global_offset: 1, cursor: 1, index: 3 },
        ];
        assert!(check_sort(&grid, &predicted, &meta, &bins).is_sorted());

        bins[3].global_offset = 0;
        let report = check_sort(&grid, &predicted, &meta, &bins);
        assert_eq!(report.offset_breaks, vec![3]);
        assert_eq!(report.misplaced, vec![1]);
        assert!(matches!(report.into_result(), Err(SolverError::SortViolation(_))));
    }
}
