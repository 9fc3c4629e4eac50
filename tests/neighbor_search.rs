use bevy_pbf_fluid::cpu::device::HostDevice;
use bevy_pbf_fluid::device::{ComputeDevice, ProgramKind};
use bevy_pbf_fluid::gpu::ffi::{Bin, Meta, Phase};
use bevy_pbf_fluid::grid::{BinGrid, GridParams};
use bevy_pbf_fluid::particles::{binding, Attribute, ParticleSnapshot, ParticleStore};
use bevy_pbf_fluid::program::{ActiveProgram, StagedProgram};
use bevy_pbf_fluid::search::{NeighborSearch, PrefixStage, SolverStage};
use bevy_pbf_fluid::{Settings, SolverError};
use glam::Vec2;

struct Rig {
    device: HostDevice,
    particles: ParticleStore<HostDevice>,
    grid: BinGrid<HostDevice>,
    solver: StagedProgram<HostDevice>,
    prefix: StagedProgram<HostDevice>,
}

fn sync_uniforms(s: &mut ActiveProgram<'_, HostDevice>, settings: &Settings) {
    settings.sync_solver(s);
    settings.timestep.sync(s);
}

fn rig(positions: &[Vec2], domain: Vec2, block_size: Option<u32>) -> Rig {
    let n = positions.len();
    let mut device = HostDevice::new();
    let mut solver =
        StagedProgram::new(&mut device, ProgramKind::Solver, 64, binding::SOLVER).unwrap();
    let mut prefix =
        StagedProgram::new(&mut device, ProgramKind::PrefixSum, 16, binding::PREFIX_SUM).unwrap();
    let grid = BinGrid::new(&mut device, GridParams::new(domain, 1.0), block_size).unwrap();
    let mut particles = ParticleStore::new(&mut device, n).unwrap();

    let snapshot = ParticleSnapshot {
        position: positions.iter().map(|p| p.to_array()).collect(),
        predicted: positions.iter().map(|p| p.to_array()).collect(),
        velocity: vec![[0.0; 2]; n],
        density: vec![0.0; n],
        lambda: vec![0.0; n],
        meta: (0..n as u32).map(|i| Meta::spawn(Phase::Fluid, i)).collect(),
    };
    particles.upload(&mut device, snapshot).unwrap();
    particles.attach(&mut solver).unwrap();
    grid.attach(&mut solver, &mut prefix).unwrap();

    {
        let mut s = solver.use_on(&mut device);
        s.set_workgroup_layout(n as u32);
        s.set_uniform("num_particles", (n as u32).into());
        grid.sync_solver(&mut s);
        sync_uniforms(&mut s, &Settings::default());
    }
    grid.sync_prefix(&mut prefix.use_on(&mut device));

    Rig {
        device,
        particles,
        grid,
        solver,
        prefix,
    }
}

impl Rig {
    fn search(&mut self) {
        NeighborSearch
            .run(
                &mut self.device,
                &mut self.solver,
                &mut self.prefix,
                &self.grid,
                &mut self.particles,
            )
            .unwrap();
        self.device.check_errors().unwrap();
    }

    fn bins(&mut self) -> Vec<Bin> {
        self.grid.download(&mut self.device).unwrap()
    }
}

// small xorshift so the scatter sees an unordered population
fn scattered(n: usize, domain: Vec2, seed: u32) -> Vec<Vec2> {
    let mut state = seed.max(1);
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state as f32 / u32::MAX as f32
    };
    (0..n)
        .map(|_| (Vec2::new(next(), next()) - 0.5) * domain)
        .collect()
}

fn assert_sorted(rig: &mut Rig, original: &[Vec2]) {
    let n = original.len();
    let snapshot = rig.particles.download(&mut rig.device).unwrap();
    let bins = rig.bins();
    let grid = *rig.grid.params();

    // slots form a permutation and carry their particle along
    let mut seen = vec![false; n];
    for (slot, meta) in snapshot.meta.iter().enumerate() {
        assert_eq!(meta.sorted_id as usize, slot);
        let id = meta.original_id as usize;
        assert!(!seen[id], "id {id} appears twice");
        seen[id] = true;
        assert_eq!(snapshot.position[slot], original[id].to_array());
    }
    assert!(seen.iter().all(|s| *s));

    // offsets are an exclusive scan of the counts
    let mut expected = 0;
    for bin in &bins {
        assert_eq!(bin.global_offset, expected);
        assert_eq!(bin.cursor, bin.count);
        expected += bin.count;
    }
    assert_eq!(expected as usize, n);

    // every particle sits inside its bin's range
    for (slot, p) in snapshot.predicted.iter().enumerate() {
        let bin = bins[grid.cell_index_of(Vec2::from_array(*p)) as usize];
        let slot = slot as u32;
        assert!(bin.global_offset <= slot && slot < bin.global_offset + bin.count);
    }
}

#[test]
fn sort_holds_for_every_block_size() {
    let domain = Vec2::new(20.0, 20.0); // 400 bins
    let positions = scattered(500, domain, 7);
    for block_size in [None, Some(1), Some(3), Some(7), Some(64), Some(400), Some(1000)] {
        let mut rig = rig(&positions, domain, block_size);
        rig.search();
        assert_sorted(&mut rig, &positions);
    }
}

#[test]
fn repeated_searches_stay_sorted() {
    let domain = Vec2::new(12.0, 6.0);
    let positions = scattered(300, domain, 42);
    let mut rig = rig(&positions, domain, Some(5));
    for _ in 0..3 {
        rig.search();
        assert_sorted(&mut rig, &positions);
    }
    assert_eq!(rig.particles.generation(), 3);
}

#[test]
fn positions_outside_the_domain_land_in_edge_bins() {
    let domain = Vec2::new(8.0, 8.0);
    let mut positions = scattered(40, domain, 3);
    positions.push(Vec2::new(1e4, -1e4));
    positions.push(Vec2::new(-50.0, 3.0));
    let mut rig = rig(&positions, domain, None);
    rig.search();
    assert_sorted(&mut rig, &positions);
}

#[test]
fn clearing_twice_leaves_every_counter_at_zero() {
    let domain = Vec2::new(10.0, 10.0);
    let positions = scattered(100, domain, 11);
    let mut rig = rig(&positions, domain, Some(4));
    rig.search();
    assert!(rig.bins().iter().any(|b| b.count > 0));

    for _ in 0..2 {
        rig.grid
            .clear(&mut rig.prefix.use_on(&mut rig.device))
            .unwrap();
    }
    let bins = rig.bins();
    assert!(bins.iter().all(|b| b.count == 0 && b.global_offset == 0 && b.cursor == 0));
    assert!(bins.iter().enumerate().all(|(i, b)| b.index == i as u32));
}

#[test]
fn publish_swaps_every_attribute_at_once() {
    let domain = Vec2::new(10.0, 10.0);
    let positions = scattered(20, domain, 5);
    let mut rig = rig(&positions, domain, None);

    let before: Vec<_> = Attribute::ALL
        .iter()
        .map(|a| *rig.particles.shadow_of(*a).raw)
        .collect();
    rig.search();
    for (attribute, shadow) in Attribute::ALL.iter().zip(before) {
        let published = rig.particles.published(*attribute);
        assert_eq!(*published.raw, shadow);
        assert_eq!(published.binding, attribute.binding());
        assert_eq!(rig.particles.shadow_of(*attribute).binding, attribute.binding() + 1);
    }
    assert_eq!(rig.particles.generation(), 1);
}

#[test]
fn dispatch_preconditions_are_reported() {
    let mut device = HostDevice::new();
    let mut solver =
        StagedProgram::new(&mut device, ProgramKind::Solver, 64, binding::SOLVER).unwrap();
    solver.use_on(&mut device).set_workgroup_layout(10);
    assert!(matches!(
        solver.use_on(&mut device).execute(SolverStage::Bucket as u32),
        Err(SolverError::UnboundBinding { binding: 0, .. })
    ));
    assert!(matches!(
        solver.use_on(&mut device).execute(8),
        Err(SolverError::StageOutOfRange { stage: 8, stage_count: 8, .. })
    ));
    assert_eq!(device.dispatch_count(), 0);
}

#[test]
fn stage_without_its_uniforms_is_refused() {
    let domain = Vec2::new(4.0, 4.0);
    let positions = scattered(8, domain, 9);
    let mut rig = rig(&positions, domain, None);
    let mut prefix =
        StagedProgram::new(&mut rig.device, ProgramKind::PrefixSum, 16, binding::PREFIX_SUM)
            .unwrap();
    rig.grid.attach(&mut rig.solver, &mut prefix).unwrap();
    prefix.use_on(&mut rig.device).set_workgroup_layout(16);
    assert!(matches!(
        prefix
            .use_on(&mut rig.device)
            .execute(PrefixStage::LocalScan as u32),
        Err(SolverError::MissingUniform { .. })
    ));
}

#[test]
fn aliased_bindings_are_refused() {
    let domain = Vec2::new(4.0, 4.0);
    let positions = scattered(8, domain, 13);
    let mut rig = rig(&positions, domain, None);
    let position = *rig.particles.published(Attribute::Position).raw;
    rig.solver.attach_raw(binding::SHADOW_POSITION, position);
    assert_eq!(
        rig.solver
            .use_on(&mut rig.device)
            .execute(SolverStage::Predict as u32),
        Err(SolverError::BindingAliased {
            first: binding::POSITION,
            second: binding::SHADOW_POSITION
        })
    );
}

#[test]
fn out_of_range_access_surfaces_as_a_fault() {
    let domain = Vec2::new(4.0, 4.0);
    let positions = scattered(10, domain, 21);
    let mut rig = rig(&positions, domain, None);
    {
        let mut s = rig.solver.use_on(&mut rig.device);
        s.set_uniform("num_particles", 40u32.into());
        // the dispatch itself succeeds, the fault is recorded
        s.execute(SolverStage::Predict as u32).unwrap();
    }
    assert!(matches!(
        rig.device.check_errors(),
        Err(SolverError::KernelFault { stage: 2, .. })
    ));
    assert!(rig.device.check_errors().is_ok());
}
