use bevy_pbf_fluid::cpu::device::HostDevice;
use bevy_pbf_fluid::{Settings, Simulation};
use criterion::{criterion_group, criterion_main, Criterion};
use glam::Vec2;

fn block_5k() -> Settings {
    // 71 x 71 lattice in a 60 x 60 box
    Settings {
        domain: Vec2::new(60.0, 60.0),
        spawn_size: Vec2::new(35.0, 35.0),
        max_particles: 8_000,
        solver_substeps: 2,
        solver_iterations: 4,
        ..Default::default()
    }
}

fn bench_sort(c: &mut Criterion) {
    let mut sim = Simulation::new(HostDevice::new(), block_5k()).unwrap();
    sim.reset().unwrap();

    c.bench_function("sort_5k", |b| b.iter(|| sim.verify_sort().unwrap()));
}

fn bench_step(c: &mut Criterion) {
    let mut sim = Simulation::new(HostDevice::new(), block_5k()).unwrap();
    sim.reset().unwrap();
    sim.resume().unwrap();

    c.bench_function("step_5k", |b| b.iter(|| sim.step(0.0016).unwrap()));
}

criterion_group!(benches, bench_sort, bench_step);
criterion_main!(benches);
