use std::{process, ptr::NonNull};

use argh::FromArgs;
use region_allocator::{
    AllocError, FreelistAllocator, PoolAllocator, StackAllocator,
    config::{self, kib},
    debug::{self, DebugMemoryBlock, RegionInspect},
    tracker,
    tracking::DefaultTracking,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Carve one buffer into tracked regions, run a small workload and dump every
/// region's live allocations.
#[derive(Debug, FromArgs)]
struct Args {
    /// size of the stack region in KiB
    #[argh(option, default = "16")]
    stack_kib: usize,
    /// size of the freelist region in KiB
    #[argh(option, default = "64")]
    freelist_kib: usize,
    /// size of the pool region in KiB
    #[argh(option, default = "16")]
    pool_kib: usize,
    /// size of the tracking region in KiB
    #[argh(option, default = "config::TRACKING_POOL_SIZE / 1024")]
    tracking_kib: usize,
    /// number of allocations made in each region
    #[argh(option, default = "8")]
    allocations: usize,
    /// maximum number of blocks printed per region
    #[argh(option, default = "64")]
    max_blocks: usize,
}

#[derive(Debug)]
struct Particle {
    position: [f32; 3],
    velocity: [f32; 3],
    age: u32,
}

type Stack = StackAllocator<DefaultTracking<'static>>;
type Freelist = FreelistAllocator<DefaultTracking<'static>>;
type Pool = PoolAllocator<DefaultTracking<'static>>;

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Args = argh::from_env();
    if let Err(err) = run(&args) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), AllocError> {
    // tracking region first, then stack, freelist and pool back to back
    let sizes = [
        kib(args.tracking_kib),
        kib(args.stack_kib),
        kib(args.freelist_kib),
        kib(args.pool_kib),
    ];
    let total: usize = sizes.iter().sum();
    let buffer: &'static mut [u128] = vec![0; total.div_ceil(16)].leak();
    let start = NonNull::from(buffer).cast::<u8>();
    let mut bases = Vec::with_capacity(sizes.len());
    let mut offset = 0;
    for size in sizes {
        bases.push(unsafe { start.add(offset) });
        offset += size;
    }
    info!(total, "reserved region buffer");

    unsafe {
        tracker::init_global(bases[0], sizes[0])?;
    }
    let stack = Stack::default();
    let freelist = Freelist::default();
    let pool = Pool::new(DefaultTracking::global(), size_of::<Particle>());
    unsafe {
        stack.map(bases[1], sizes[1], "stack");
        freelist.map(bases[2], sizes[2], "freelist")?;
        pool.map(bases[3], sizes[3], "pool")?;
    }

    run_workload(args, &stack, &freelist, &pool)?;

    let regions: [&dyn RegionInspect; 3] = [&stack, &freelist, &pool];
    let mut blocks = vec![DebugMemoryBlock::EMPTY; args.max_blocks];
    for region in regions {
        dump_region(region, &mut blocks)?;
    }
    let global = tracker::global();
    println!(
        "tracker: live_allocations={} missing_entries={} capacity={}",
        global.live_allocations(),
        global.missing_entries(),
        global.capacity()
    );

    stack.free_all();
    freelist.free_all();
    pool.free_all();
    tracker::shutdown_global();
    Ok(())
}

fn run_workload(
    args: &Args,
    stack: &Stack,
    freelist: &Freelist,
    pool: &Pool,
) -> Result<(), AllocError> {
    for i in 0..args.allocations {
        let frame = stack.allocate_with(64 * (i + 1), "scratch")?;
        unsafe {
            frame.as_ptr().write_bytes(0xab, 64 * (i + 1));
        }
    }

    let mut blobs = Vec::with_capacity(args.allocations);
    for i in 0..args.allocations {
        blobs.push(freelist.allocate_with(100 + 37 * i, "blob")?);
    }
    // punch holes so the snapshot shows a fragmented region
    for blob in blobs.iter().step_by(2) {
        unsafe {
            freelist.free(*blob)?;
        }
    }
    if let Some(&kept) = blobs.iter().skip(1).step_by(2).next_back() {
        let grown = unsafe { freelist.reallocate(kept, 2048)? };
        debug!(address = grown.as_ptr().addr(), "grew last blob");
    }

    for i in 0..args.allocations {
        #[expect(clippy::cast_precision_loss)]
        let t = i as f32;
        let particle = pool.allocate_value(Particle {
            position: [t, t * 2.0, 0.0],
            velocity: [1.0, 0.0, -1.0],
            age: 0,
        })?;
        let particle = unsafe { particle.as_ref() };
        debug!(
            x = particle.position[0] + particle.velocity[0],
            age = particle.age,
            "spawned particle"
        );
    }

    info!(
        stack = stack.used_bytes(),
        freelist = freelist.used_bytes(),
        free_blocks = freelist.free_block_count(),
        pool = pool.used_bytes(),
        "workload done"
    );
    Ok(())
}

fn dump_region(
    region: &dyn RegionInspect,
    blocks: &mut [DebugMemoryBlock],
) -> Result<(), AllocError> {
    let info = region.info();
    println!(
        "{}: base={:#x} size={} used={}",
        info.name, info.base_address, info.size_in_bytes, info.used_bytes
    );
    let count = match debug::extract_snapshot(region, blocks) {
        Ok(count) => count,
        Err(err) if err.kind().is_snapshot_overflow() => {
            println!("  (more than {} live blocks, showing none)", blocks.len());
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    for block in &blocks[..count] {
        println!(
            "  {:#x} +{:<6} {}",
            block.frame_address, block.frame_size, block.description
        );
    }
    Ok(())
}
