use bevy::diagnostic::{DiagnosticsStore, FrameTimeDiagnosticsPlugin};
use bevy::prelude::*;
use bevy::render::settings::{RenderCreation, WgpuLimits, WgpuSettings};
use bevy::render::{Render, RenderApp, RenderPlugin, RenderSet};
use bevy_pbf_fluid::gpu::device::REQUIRED_STORAGE_BUFFERS;
use bevy_pbf_fluid::gpu::plugin::{ParticleRenderBinding, PbfSolverPlugin, SolverControl};

fn main() {
    let mut app = App::new();
    app.add_plugins((
        DefaultPlugins.set(RenderPlugin {
            // the solver binds 15 storage buffers per stage
            render_creation: RenderCreation::Automatic(WgpuSettings {
                limits: WgpuLimits {
                    max_storage_buffers_per_shader_stage: REQUIRED_STORAGE_BUFFERS,
                    ..default()
                },
                ..default()
            }),
            ..default()
        }),
        FrameTimeDiagnosticsPlugin::default(),
    ))
    .insert_resource(ClearColor(Color::Srgba(
        bevy::color::palettes::css::DARK_SLATE_GRAY,
    )))
    .add_plugins(PbfSolverPlugin)
    .add_systems(Startup, |mut commands: Commands| {
        commands.spawn(Camera2d::default());
    })
    .add_systems(Update, (keyboard, log_fps));

    app.sub_app_mut(RenderApp)
        .add_systems(Render, log_binding.in_set(RenderSet::Queue));
    app.run();
}

// space pauses, R respawns, G flips gravity
fn keyboard(keys: Res<ButtonInput<KeyCode>>, mut control: ResMut<SolverControl>) {
    if keys.just_pressed(KeyCode::Space) {
        control.running = !control.running;
        info!("running: {}", control.running);
    }
    if keys.just_pressed(KeyCode::KeyR) {
        control.request_reset();
    }
    if keys.just_pressed(KeyCode::KeyG) {
        control.settings.gravity = -control.settings.gravity;
    }
}

fn log_binding(binding: Option<Res<ParticleRenderBinding>>, mut counter: Local<u32>) {
    let Some(binding) = binding else { return };
    *counter += 1;
    if *counter >= 120 {
        *counter = 0;
        info!(
            "{} particles over {} bins, generation {}",
            binding.count, binding.bin_count, binding.generation
        );
    }
}

fn log_fps(diagnostics: Res<DiagnosticsStore>, mut counter: Local<u32>) {
    *counter += 1;
    if *counter >= 120 {
        *counter = 0;

        if let Some(fps_diag) = diagnostics.get(&FrameTimeDiagnosticsPlugin::FPS) {
            if let Some(avg) = fps_diag.average() {
                info!("==== Average FPS over last ~2 s: {:.1} ====", avg);
            }
        }
    }
}
