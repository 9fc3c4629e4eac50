// Headless run of the default scene on the reference executor: spawn, step a
// few frames, and check the counting sort after each one.
use bevy::app::AppExit;
use bevy::log::LogPlugin;
use bevy::prelude::*;
use bevy_pbf_fluid::cpu::device::HostDevice;
use bevy_pbf_fluid::{Settings, Simulation};

const FRAMES: u32 = 5;

fn main() {
    App::new()
        .add_plugins((MinimalPlugins, LogPlugin::default()))
        .add_systems(Startup, run_check)
        .run();
}

fn run_check(mut exit: EventWriter<AppExit>) {
    let settings = Settings {
        max_particles: 110_000,
        solver_substeps: 1,
        solver_iterations: 2,
        ..Default::default()
    };
    let outcome = Simulation::new(HostDevice::new(), settings).and_then(|mut sim| {
        sim.reset()?;
        info!("{} particles in {} bins", sim.particle_count(), sim.bin_count());
        sim.resume()?;
        for frame in 0..FRAMES {
            sim.step(sim.settings().timestep.value())?;
            let report = sim.verify_sort()?.into_result()?;
            info!("frame {frame}: {} particles sorted, {} binned", report.particles, report.binned);
        }
        Ok(sim.elapsed())
    });

    match outcome {
        Ok(elapsed) => {
            info!("sort held for {FRAMES} frames ({elapsed:.4} s simulated)");
            exit.write(AppExit::Success);
        }
        Err(err) => {
            error!("{err}");
            exit.write(AppExit::error());
        }
    }
}
