use bevy::prelude::*;
use bevy::render::extract_resource::{ExtractResource, ExtractResourcePlugin};
use bevy::render::render_resource::Buffer;
use bevy::render::renderer::{RenderDevice, RenderQueue};
use bevy::render::{Render, RenderApp, RenderSet};

use crate::gpu::device::GpuDevice;
use crate::settings::Settings;
use crate::simulation::{SimState, Simulation};

// ==================== resources ======================================

/// Main world handle on the solver. Copied into the render world every frame.
#[derive(Resource, Clone, ExtractResource)]
pub struct SolverControl {
    pub settings: Settings,
    /// Advance every frame when true, hold otherwise.
    pub running: bool,
    reset_requests: u64,
}

impl Default for SolverControl {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            running: true,
            // the first frame spawns the lattice
            reset_requests: 1,
        }
    }
}

impl SolverControl {
    /// Regenerates the population on the next frame. Structural settings
    /// changes take effect here.
    pub fn request_reset(&mut self) {
        self.reset_requests += 1;
    }
}

/// Render world owner of the solver.
#[derive(Resource)]
pub struct ParticleSimulation {
    pub simulation: Simulation<GpuDevice>,
    applied: Settings,
    resets: u64,
}

/// What a renderer needs to draw this frame's particles, refreshed after every step.
#[derive(Resource, Clone)]
pub struct ParticleRenderBinding {
    pub position: Buffer,
    pub velocity: Buffer,
    pub meta: Buffer,
    pub count: u32,
    pub bin_count: u32,
    pub generation: u64,
}

// =====================================================================

// ========================== systems ==================================

fn init_simulation(
    mut commands: Commands,
    render_device: Res<RenderDevice>,
    render_queue: Res<RenderQueue>,
    control: Res<SolverControl>,
    mut failed: Local<bool>,
) {
    if *failed {
        return;
    }
    let created = GpuDevice::new(render_device.clone(), render_queue.clone())
        .and_then(|device| Simulation::new(device, control.settings.clone()));
    match created {
        Ok(simulation) => commands.insert_resource(ParticleSimulation {
            simulation,
            applied: control.settings.clone(),
            resets: 0,
        }),
        Err(err) => {
            error!("particle solver unavailable: {err}");
            *failed = true;
        }
    }
}

fn step_simulation(
    mut commands: Commands,
    control: Res<SolverControl>,
    mut sim: ResMut<ParticleSimulation>,
) {
    let sim = &mut *sim;
    if sim.applied != control.settings {
        sim.applied = control.settings.clone();
        let settings = control.settings.clone();
        sim.simulation.update_settings(move |s| *s = settings);
    }

    if sim.resets != control.reset_requests {
        sim.resets = control.reset_requests;
        if let Err(err) = sim.simulation.reset() {
            warn!("reset failed: {err}");
        }
    }

    let toggled = if control.running {
        sim.simulation.resume()
    } else {
        sim.simulation.pause()
    };
    if let Err(err) = toggled {
        debug!("{err}");
    }

    if sim.simulation.state() == SimState::Running {
        let dt = sim.simulation.settings().timestep.value();
        if let Err(err) = sim.simulation.step(dt) {
            warn!("step failed: {err}");
            let _ = sim.simulation.pause();
        }
    }

    let binding = sim.simulation.render_binding();
    commands.insert_resource(ParticleRenderBinding {
        position: binding.position.raw.clone(),
        velocity: binding.velocity.raw.clone(),
        meta: binding.meta.raw.clone(),
        count: binding.count,
        bin_count: binding.bin_count,
        generation: binding.generation,
    });
}

// =====================================================================

// Plugin

/// Runs the solver in the render world, once per frame, before anything is drawn.
pub struct PbfSolverPlugin;

impl Plugin for PbfSolverPlugin {
    fn build(&self, app: &mut App) {
        // App
        app.init_resource::<SolverControl>()
            .add_plugins(ExtractResourcePlugin::<SolverControl>::default());

        // Render
        let render_app = app.sub_app_mut(RenderApp);
        render_app.add_systems(
            Render,
            (
                init_simulation.run_if(not(resource_exists::<ParticleSimulation>)),
                step_simulation.run_if(resource_exists::<ParticleSimulation>),
            )
                .chain()
                .in_set(RenderSet::Prepare),
        );
    }
}
