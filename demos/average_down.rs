use std::net::TcpListener;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::info;
use serde::Serialize;

use gridflow::index_space::range2d;
use gridflow::message::{Communicator, LocalCommunicator, TcpCommunicator};
use gridflow::{
    average_down, build_dependency_graph, build_neighbor_graph, fill_boundary, BoxLayout, Error, Geometry,
    LevelData, Protocol, Runtime, RuntimeConfig, TransferStats, Weighting,
};




#[derive(Clone, Copy, Debug)]
enum Transport {
    Local,
    Tcp,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Transport::Local),
            "tcp" => Ok(Transport::Tcp),
            _ => Err(format!("unknown transport '{}', expected local or tcp", s)),
        }
    }
}




#[derive(Debug, Parser)]
#[clap(version = "1.0", author = "J. Zrake <jzrake@clemson.edu>")]
#[clap(about = "Fill the halos of a fine level, then average it down onto a coarse level")]
struct Opts {
    #[clap(short = 'n', long, default_value = "4")]
    num_ranks: usize,

    #[clap(short = 'b', long, default_value = "4")]
    num_blocks: i64,

    #[clap(short = 's', long, default_value = "16")]
    block_size: i64,

    #[clap(short = 'r', long, default_value = "2")]
    ratio: i64,

    #[clap(short = 'p', long, default_value = "pull")]
    protocol: Protocol,

    #[clap(short = 'w', long, default_value = "cell")]
    weighting: Weighting,

    #[clap(short = 't', long, default_value = "local")]
    transport: Transport,

    #[clap(long, default_value = "30000")]
    stall_timeout_ms: u64,

    #[clap(short = 'o', long, default_value = "coarse.cbor")]
    output: String,
}




/**
 * One coarse patch of the result, as written to the output file.
 */
#[derive(Serialize)]
struct Patch {
    index: usize,
    rank: usize,
    lo: [i64; 2],
    hi: [i64; 2],
    data: Vec<f64>,
}




/**
 * The fine level is a square grid of blocks dealt out to the ranks in turn.
 * The coarse level is cut into strips which do not line up with the fine
 * blocks, dealt out in the opposite order.
 */
fn layouts(opts: &Opts) -> (BoxLayout<2>, BoxLayout<2>) {
    let nb = opts.num_blocks;
    let bs = opts.block_size;
    let ranks = opts.num_ranks;

    let fine = BoxLayout::new(1, (0..nb * nb).map(|n| {
        let (i, j) = (n / nb, n % nb);
        (range2d(i * bs..(i + 1) * bs, j * bs..(j + 1) * bs), n as usize % ranks)
    }));

    let extent = nb * bs / opts.ratio;
    let strips = (nb - 1).max(1);
    let coarse = BoxLayout::new(0, (0..strips).map(|k| {
        let lo = k * extent / strips;
        let hi = (k + 1) * extent / strips;
        (range2d(lo..hi, 0..extent), (strips - 1 - k) as usize % ranks)
    }));

    (fine, coarse)
}

fn run_rank<C: Communicator>(runtime: &Runtime<C>, opts: &Opts) -> Result<(Vec<Patch>, TransferStats), Error> {
    let rank = runtime.rank();
    let (fine, coarse) = layouts(opts);
    let n = opts.num_blocks * opts.block_size;
    let fine_geom = Geometry::new(range2d(0..n, 0..n), [0.0, 0.0], [1.0, 1.0]).with_periodicity([true, true]);
    let coarse_geom = Geometry::new(range2d(0..n / opts.ratio, 0..n / opts.ratio), [0.0, 0.0], [1.0, 1.0]);

    let mut fine_data = LevelData::from_slice_function(&fine, rank, 1, 1, |index, f| {
        let [x, y] = fine_geom.cell_center(index);
        f[0] = (-50.0 * ((x - 0.5).powi(2) + (y - 0.5).powi(2))).exp()
    });
    let mut coarse_data = LevelData::new(&coarse, rank, 1, 0);

    let halo = build_neighbor_graph(&fine, &fine, 1, &fine_geom)?;
    fill_boundary(runtime, &mut fine_data, &halo, (0, 1), opts.protocol)?;

    let graph = build_dependency_graph(&fine, &coarse, opts.ratio)?;
    let stats = average_down(
        runtime,
        &fine_data,
        &mut coarse_data,
        &graph,
        &fine_geom,
        &coarse_geom,
        (0, 1),
        opts.ratio,
        opts.protocol,
        opts.weighting,
    )?;

    let patches = coarse_data
        .iter()
        .map(|region| Patch {
            index: region.id().index,
            rank,
            lo: region.valid_space().start(),
            hi: region.valid_space().end(),
            data: region.data().to_vec(),
        })
        .collect();
    Ok((patches, stats))
}

fn run_local(opts: &Opts, config: &RuntimeConfig) -> Vec<Result<(Vec<Patch>, TransferStats), Error>> {
    thread::scope(|scope| {
        let procs: Vec<_> = LocalCommunicator::group(opts.num_ranks)
            .into_iter()
            .map(|comm| {
                let runtime = Runtime::with_config(comm, config.clone());
                scope.spawn(move || run_rank(&runtime, opts))
            })
            .collect();
        procs.into_iter().map(|p| p.join().expect("rank thread panicked")).collect()
    })
}

fn run_tcp(opts: &Opts, config: &RuntimeConfig) -> std::io::Result<Vec<Result<(Vec<Patch>, TransferStats), Error>>> {
    let listeners = (0..opts.num_ranks)
        .map(|_| TcpListener::bind("127.0.0.1:0"))
        .collect::<Result<Vec<_>, _>>()?;
    let peers = listeners
        .iter()
        .map(|l| l.local_addr())
        .collect::<Result<Vec<_>, _>>()?;

    Ok(thread::scope(|scope| {
        let procs: Vec<_> = listeners
            .into_iter()
            .enumerate()
            .map(|(rank, listener)| {
                let peers = peers.clone();
                scope.spawn(move || {
                    let (comm, mut host) = TcpCommunicator::from_listener(rank, listener, peers);
                    let runtime = Runtime::with_config(comm, config.clone());
                    let result = run_rank(&runtime, opts);
                    drop(runtime);
                    host.join();
                    result
                })
            })
            .collect();
        procs.into_iter().map(|p| p.join().expect("rank thread panicked")).collect()
    }))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    simple_logger::init_with_level(log::Level::Info)?;

    let opts = Opts::parse();
    info!("{:?}", opts);

    let config = RuntimeConfig::default().with_stall_timeout(Duration::from_millis(opts.stall_timeout_ms));
    let start = std::time::Instant::now();

    let results = match opts.transport {
        Transport::Local => run_local(&opts, &config),
        Transport::Tcp => run_tcp(&opts, &config)?,
    };
    let elapsed = start.elapsed();
    let mut patches = Vec::new();

    for (rank, result) in results.into_iter().enumerate() {
        let (mut local, stats) = result?;
        info!("rank {}: {:?}", rank, stats);
        patches.append(&mut local);
    }
    patches.sort_by_key(|p| p.index);

    let total: f64 = patches.iter().flat_map(|p| p.data.iter()).sum();
    println!("{} coarse patches, sum {:.6}, {:.3}s", patches.len(), total, elapsed.as_secs_f64());

    let file = std::fs::File::create(&opts.output)?;
    let mut buffer = std::io::BufWriter::new(file);
    ciborium::ser::into_writer(&patches, &mut buffer)?;
    info!("wrote {}", opts.output);
    Ok(())
}
