use bevy_pbf_fluid::buffer::{Resized, StructuredBuffer};
use bevy_pbf_fluid::cpu::device::HostDevice;
use bevy_pbf_fluid::device::ComputeDevice;
use bevy_pbf_fluid::gpu::ffi::{Bin, Meta, Phase};
use bevy_pbf_fluid::grid::{BinGrid, GridParams};
use bevy_pbf_fluid::particles::ParticleStore;
use bevy_pbf_fluid::SolverError;
use glam::Vec2;

#[test]
fn upload_sets_len_and_download_returns_it() {
    let mut device = HostDevice::new();
    let mut buf: StructuredBuffer<Meta, _> = StructuredBuffer::allocate(&mut device, "meta", 8).unwrap();
    assert_eq!(buf.len(), 0);
    assert_eq!(buf.capacity(), 8);

    *buf.host_mut() = (0..5).map(|i| Meta::spawn(Phase::Granular, i)).collect();
    buf.upload(&mut device).unwrap();
    assert_eq!(buf.len(), 5);

    buf.free_host_memory();
    assert!(buf.host().is_empty());
    let back = buf.download(&mut device).unwrap();
    assert_eq!(back.len(), 5);
    assert_eq!(back[3], Meta::spawn(Phase::Granular, 3));
}

#[test]
fn upload_past_capacity_is_refused() {
    let mut device = HostDevice::new();
    let mut buf: StructuredBuffer<f32, _> = StructuredBuffer::allocate(&mut device, "density", 4).unwrap();
    *buf.host_mut() = vec![1.0; 5];
    assert_eq!(
        buf.upload(&mut device),
        Err(SolverError::CapacityExceeded {
            requested: 5,
            capacity: 4
        })
    );
    assert_eq!(buf.len(), 0);
}

#[test]
fn resize_within_capacity_keeps_storage() {
    let mut device = HostDevice::new();
    let mut buf: StructuredBuffer<[f32; 2], _> =
        StructuredBuffer::allocate(&mut device, "position", 16).unwrap();
    buf.bind(0);
    let raw = *buf.raw();

    assert_eq!(buf.resize(&mut device, 10).unwrap(), Resized::InPlace);
    assert_eq!(*buf.raw(), raw);
    assert_eq!(buf.len(), 10);

    assert_eq!(buf.resize(&mut device, 32).unwrap(), Resized::Reallocated);
    assert_ne!(*buf.raw(), raw);
    assert_eq!(buf.capacity(), 32);
    // same slot, new storage: programs re-attach the new handle there
    assert_eq!(buf.binding(), Some(0));
    // the old storage is gone
    assert!(device.read_buffer(&raw, 4).is_err());
}

#[test]
fn clear_zeroes_the_logical_range() {
    let mut device = HostDevice::new();
    let mut buf: StructuredBuffer<u32, _> = StructuredBuffer::allocate(&mut device, "counts", 4).unwrap();
    *buf.host_mut() = vec![7, 8, 9, 10];
    buf.upload(&mut device).unwrap();
    buf.clear(&mut device).unwrap();
    assert_eq!(buf.download(&mut device).unwrap(), &[0, 0, 0, 0]);
}

#[test]
fn unbound_buffer_has_no_binding_point() {
    let mut device = HostDevice::new();
    let mut buf: StructuredBuffer<u32, _> = StructuredBuffer::allocate(&mut device, "loose", 1).unwrap();
    assert!(matches!(
        buf.binding_point(),
        Err(SolverError::NoBindingPoint { .. })
    ));
    buf.bind(3);
    assert_eq!(buf.binding_point(), Ok(3));
}

#[test]
fn host_writes_are_bounds_checked() {
    let mut device = HostDevice::new();
    let raw = device.create_buffer("small", 8).unwrap();
    assert!(device.write_buffer(&raw, 4, &[0u8; 4]).is_ok());
    assert!(matches!(
        device.write_buffer(&raw, 4, &[0u8; 8]),
        Err(SolverError::Device(_))
    ));
}

#[test]
fn failed_particle_store_releases_what_it_allocated() {
    // room for the scratch buffer and one attribute pair, not for the rest
    let mut device = HostDevice::with_memory_limit(2000);
    let store = ParticleStore::new(&mut device, 64);
    assert!(matches!(store, Err(SolverError::Device(_))));
    assert_eq!(device.live_bytes(), 0);
}

#[test]
fn failed_bin_grid_releases_its_bins() {
    let params = GridParams::new(Vec2::new(4.0, 4.0), 1.0);
    let bins_bytes = params.bin_count() as u64 * std::mem::size_of::<Bin>() as u64;
    let mut device = HostDevice::with_memory_limit(bins_bytes);
    let grid = BinGrid::new(&mut device, params, None);
    assert!(matches!(grid, Err(SolverError::Device(_))));
    assert_eq!(device.live_bytes(), 0);

    let mut roomy = HostDevice::with_memory_limit(bins_bytes * 2);
    let grid = BinGrid::new(&mut roomy, params, None).unwrap();
    assert!(roomy.live_bytes() > bins_bytes);
    grid.destroy(&mut roomy);
    assert_eq!(roomy.live_bytes(), 0);
}
