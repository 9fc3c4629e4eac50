//! Host versions of the kernels in `assets/shaders`. Each function is one
//! stage: a loop over invocation ids that does what a single GPU thread does.

use glam::Vec2;

use crate::cpu::device::KernelContext;
use crate::cpu::sph2d::Kernels2d;
use crate::device::ProgramKind;
use crate::error::{Result, SolverError};
use crate::gpu::ffi::{Bin, BlockSum, Float2, Meta};
use crate::grid::GridParams;
use crate::particles::binding::*;
use crate::search::{PrefixStage, SolverStage};

// tensile instability term, s_corr = -k (W(r) / W(DQ h))^N
const SCORR_DQ: f32 = 0.2;
const SCORR_N: i32 = 4;
const LAMBDA_EPS: f32 = 1e-4;

pub(crate) fn run(program: ProgramKind, stage: u32, ctx: &mut KernelContext<'_>) -> Result<()> {
    match program {
        ProgramKind::Solver => run_solver(stage, ctx),
        ProgramKind::PrefixSum => run_prefix(stage, ctx),
    }
}

fn unknown_stage(program: ProgramKind, stage: u32) -> SolverError {
    SolverError::StageOutOfRange {
        program: program.name().into(),
        stage,
        stage_count: program.stage_count(),
    }
}

// ============================ solver =================================

struct SolverParams {
    n: u32,
    grid: GridParams,
    gravity: Vec2,
    kernels: Kernels2d,
    mass: f32,
    rest_density: f32,
    dt: f32,
    viscosity: f32,
    pressure: f32,
    relaxation: f32,
}

impl SolverParams {
    fn read(ctx: &KernelContext<'_>) -> Result<Self> {
        let domain = ctx.uniform_vec2("domain")?;
        Ok(Self {
            n: ctx.uniform_u32("num_particles")?,
            grid: GridParams {
                domain,
                bin_width: ctx.uniform_f32("bin_width")?,
                dims: ctx.uniform_uvec2("grid_dim")?,
            },
            gravity: ctx.uniform_vec2("gravity")?,
            kernels: Kernels2d::new(ctx.uniform_f32("smoothing_radius")?),
            mass: ctx.uniform_f32("particle_mass")?,
            rest_density: ctx.uniform_f32("rest_density")?,
            dt: ctx.uniform_f32("dt")?,
            viscosity: ctx.uniform_f32("artificial_viscosity")?,
            pressure: ctx.uniform_f32("artificial_pressure")?,
            relaxation: ctx.uniform_f32("over_relaxation")?,
        })
    }

    /// Keeps a point inside the domain box.
    fn confine(&self, p: Vec2) -> Vec2 {
        let half = self.grid.domain * 0.5;
        p.clamp(-half, half)
    }

    fn inv_dt(&self) -> f32 {
        if self.dt > 0.0 { 1.0 / self.dt } else { 0.0 }
    }

    /// Number of invocations that map to a live particle.
    fn live(&self, ctx: &KernelContext<'_>) -> u32 {
        self.n.min(ctx.invocations())
    }
}

fn vec(ctx: &KernelContext<'_>, point: u32, i: u32) -> Vec2 {
    Vec2::from_array(ctx.load::<Float2>(point, i))
}

fn committed_velocity(ctx: &KernelContext<'_>, i: u32, inv_dt: f32) -> Vec2 {
    (vec(ctx, PREDICTED, i) - vec(ctx, POSITION, i)) * inv_dt
}

/// Calls `f(j)` for every particle index in the 3x3 bins around `p`.
fn for_each_neighbor(
    ctx: &KernelContext<'_>,
    params: &SolverParams,
    p: Vec2,
    mut f: impl FnMut(u32),
) {
    let cell = params.grid.cell_of(p);
    for b in params.grid.neighborhood(cell) {
        let bin = ctx.load::<Bin>(BINS, b);
        for j in bin.global_offset..bin.global_offset + bin.count {
            f(j);
        }
    }
}

fn run_solver(stage: u32, ctx: &mut KernelContext<'_>) -> Result<()> {
    let params = SolverParams::read(ctx)?;
    let n = params.live(ctx);
    match stage {
        s if s == SolverStage::Bucket as u32 => {
            for i in 0..n {
                let b = params.grid.cell_index_of(vec(ctx, PREDICTED, i));
                let mut bin = ctx.load::<Bin>(BINS, b);
                bin.count += 1;
                ctx.store(BINS, b, bin);
            }
        }
        s if s == SolverStage::Scatter as u32 => {
            for i in 0..n {
                let b = params.grid.cell_index_of(vec(ctx, PREDICTED, i));
                let mut bin = ctx.load::<Bin>(BINS, b);
                let slot = bin.global_offset + bin.cursor;
                bin.cursor += 1;
                ctx.store(BINS, b, bin);
                if slot >= params.n {
                    ctx.fault(format!("particle {i} scattered to slot {slot} of {}", params.n));
                    continue;
                }
                copy::<Float2>(ctx, POSITION, i, slot);
                copy::<Float2>(ctx, PREDICTED, i, slot);
                copy::<Float2>(ctx, VELOCITY, i, slot);
                copy::<f32>(ctx, DENSITY, i, slot);
                copy::<f32>(ctx, LAMBDA, i, slot);
                let meta = Meta {
                    sorted_id: slot,
                    ..ctx.load::<Meta>(META, i)
                };
                ctx.store(SHADOW_META, slot, meta);
            }
        }
        s if s == SolverStage::Predict as u32 => {
            for i in 0..n {
                let v = vec(ctx, VELOCITY, i) + params.gravity * params.dt;
                let predicted = params.confine(vec(ctx, POSITION, i) + v * params.dt);
                ctx.store(VELOCITY, i, v.to_array());
                ctx.store(PREDICTED, i, predicted.to_array());
            }
        }
        s if s == SolverStage::Lambda as u32 => {
            let k = params.kernels;
            let scale = params.mass / params.rest_density.max(f32::EPSILON);
            for i in 0..n {
                let pi = vec(ctx, PREDICTED, i);
                let mut rho = 0.0;
                let mut grad_i = Vec2::ZERO;
                let mut sum_grad2 = 0.0;
                for_each_neighbor(ctx, &params, pi, |j| {
                    let r = pi - vec(ctx, PREDICTED, j);
                    let r2 = r.length_squared();
                    if r2 >= k.h2() {
                        return;
                    }
                    rho += params.mass * k.w_poly6(r2);
                    if j != i {
                        let grad_j = scale * k.grad_spiky(r);
                        grad_i += grad_j;
                        sum_grad2 += grad_j.length_squared();
                    }
                });
                // only compression is corrected, a free surface is not pulled inwards
                let c = (rho / params.rest_density.max(f32::EPSILON) - 1.0).max(0.0);
                let lambda = -c / (sum_grad2 + grad_i.length_squared() + LAMBDA_EPS);
                ctx.store(DENSITY, i, rho);
                ctx.store(LAMBDA, i, lambda);
            }
        }
        s if s == SolverStage::Correct as u32 => {
            let k = params.kernels;
            let scale = params.mass / params.rest_density.max(f32::EPSILON);
            let w_dq = k.w_poly6((SCORR_DQ * k.h).powi(2)).max(f32::EPSILON);
            for i in 0..n {
                let pi = vec(ctx, PREDICTED, i);
                let lambda_i = ctx.load::<f32>(LAMBDA, i);
                let mut dp = Vec2::ZERO;
                for_each_neighbor(ctx, &params, pi, |j| {
                    if j == i {
                        return;
                    }
                    let r = pi - vec(ctx, PREDICTED, j);
                    let r2 = r.length_squared();
                    if r2 >= k.h2() {
                        return;
                    }
                    let s_corr = -params.pressure * (k.w_poly6(r2) / w_dq).powi(SCORR_N);
                    let lambda_j = ctx.load::<f32>(LAMBDA, j);
                    dp += (lambda_i + lambda_j + s_corr) * k.grad_spiky(r);
                });
                ctx.store(DELTA, i, (dp * scale * params.relaxation).to_array());
            }
        }
        s if s == SolverStage::Apply as u32 => {
            for i in 0..n {
                let p = params.confine(vec(ctx, PREDICTED, i) + vec(ctx, DELTA, i));
                ctx.store(PREDICTED, i, p.to_array());
                ctx.store(DELTA, i, [0.0f32; 2]);
            }
        }
        s if s == SolverStage::Viscosity as u32 => {
            // XSPH over the velocities the commit is about to write
            let k = params.kernels;
            let inv_dt = params.inv_dt();
            for i in 0..n {
                let pi = vec(ctx, PREDICTED, i);
                let vi = committed_velocity(ctx, i, inv_dt);
                let mut dv = Vec2::ZERO;
                for_each_neighbor(ctx, &params, pi, |j| {
                    if j == i {
                        return;
                    }
                    let r2 = (pi - vec(ctx, PREDICTED, j)).length_squared();
                    let rho_j = ctx.load::<f32>(DENSITY, j);
                    if r2 >= k.h2() || rho_j <= 0.0 {
                        return;
                    }
                    let vj = committed_velocity(ctx, j, inv_dt);
                    dv += (vj - vi) * k.w_poly6(r2) * params.mass / rho_j;
                });
                ctx.store(DELTA, i, (dv * params.viscosity).to_array());
            }
        }
        s if s == SolverStage::Commit as u32 => {
            // consumes the viscosity term, delta is dead until the next correction
            let inv_dt = params.inv_dt();
            for i in 0..n {
                let p = vec(ctx, PREDICTED, i);
                let v = (p - vec(ctx, POSITION, i)) * inv_dt + vec(ctx, DELTA, i);
                ctx.store(VELOCITY, i, v.to_array());
                ctx.store(POSITION, i, p.to_array());
                ctx.store(DELTA, i, [0.0f32; 2]);
            }
        }
        _ => return Err(unknown_stage(ProgramKind::Solver, stage)),
    }
    Ok(())
}

/// Copies element `from` of the published buffer at `point` into slot `to`
/// of its shadow.
fn copy<T: bytemuck::Pod>(ctx: &mut KernelContext<'_>, point: u32, from: u32, to: u32) {
    let value = ctx.load::<T>(point, from);
    ctx.store(point + 1, to, value);
}

// ============================ prefix sum =============================

fn run_prefix(stage: u32, ctx: &mut KernelContext<'_>) -> Result<()> {
    let data_size = ctx.uniform_u32("data_size")?;
    let block_size = ctx.uniform_u32("block_size")?.max(1);
    let block_count = ctx.uniform_u32("block_count")?;
    let blocks = block_count.min(ctx.invocations());
    let range = |b: u32| b * block_size..((b + 1) * block_size).min(data_size);

    match stage {
        s if s == PrefixStage::LocalScan as u32 => {
            for b in 0..blocks {
                let mut acc = 0;
                for i in range(b) {
                    let mut bin = ctx.load::<Bin>(BINS, i);
                    bin.global_offset = acc;
                    acc += bin.count;
                    ctx.store(BINS, i, bin);
                }
                let mut sum = ctx.load::<BlockSum>(BLOCK_SUMS, b);
                sum.total = acc;
                ctx.store(BLOCK_SUMS, b, sum);
            }
        }
        s if s == PrefixStage::TreeGather as u32 => {
            let space = ctx.uniform_u32("space")?;
            for b in 0..blocks {
                let mut sum = ctx.load::<BlockSum>(BLOCK_SUMS, b);
                sum.scratch = sum.total;
                if b >= space {
                    sum.scratch += ctx.load::<BlockSum>(BLOCK_SUMS, b - space).total;
                }
                ctx.store(BLOCK_SUMS, b, sum);
            }
        }
        s if s == PrefixStage::TreeCommit as u32 => {
            for b in 0..blocks {
                let mut sum = ctx.load::<BlockSum>(BLOCK_SUMS, b);
                sum.total = sum.scratch;
                ctx.store(BLOCK_SUMS, b, sum);
            }
        }
        s if s == PrefixStage::Finalize as u32 => {
            for b in 0..blocks {
                let carry = if b > 0 {
                    ctx.load::<BlockSum>(BLOCK_SUMS, b - 1).total
                } else {
                    0
                };
                for i in range(b) {
                    let mut bin = ctx.load::<Bin>(BINS, i);
                    bin.global_offset += carry;
                    bin.cursor = 0;
                    ctx.store(BINS, i, bin);
                }
            }
        }
        s if s == PrefixStage::Clear as u32 => {
            for b in 0..blocks {
                for i in range(b) {
                    ctx.store(
                        BINS,
                        i,
                        Bin {
                            index: i,
                            ..Bin::default()
                        },
                    );
                }
            }
        }
        _ => return Err(unknown_stage(ProgramKind::PrefixSum, stage)),
    }
    Ok(())
}
