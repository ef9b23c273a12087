/*
This program runs the ADMM coordinator on a synthetic ptycho-tomography problem
with in-process ranks and writes step and collective timings to CSV.
*/

use std::error::Error;
use std::f64::consts::PI;
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use futures::future::try_join_all;
use ndarray::{Array1, Array2, Array3, ArrayD, IxDyn};
use num_complex::Complex64;
use ptadmm_core::{
    comm::{Communicator, launch},
    config::{AdmmConfig, LocalConfig},
    ptychotomo::{AdmmInputs, admm},
    solver::{EchoPtychoSolver, EchoTomoSolver},
    storage::LocalStore,
};
use rand::prelude::*;
use rand_distr::{Normal, Uniform};

/// Profile the distributed ADMM coordinator on synthetic data.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The number of in-process ranks
    #[arg(short, long, default_value_t = 4)]
    ranks: usize,

    /// The number of views (rotation angles)
    #[arg(short = 't', long, default_value_t = 32)]
    views: usize,

    /// The number of object rows Z
    #[arg(short = 'z', long, default_value_t = 16)]
    rows: usize,

    /// The object width X = Y
    #[arg(short, long, default_value_t = 16)]
    width: usize,

    /// Outer ADMM iterations (ignored with --config)
    #[arg(short, long, default_value_t = 4)]
    niter: usize,

    #[arg(long, default_value_t = 0.5)]
    rho: f64,

    #[arg(long, default_value_t = 0.25)]
    gamma: f64,

    /// JSON file with an AdmmConfig; overrides niter, rho and gamma
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// The directory for timings and exported arrays
    #[arg(short, long, default_value = "data")]
    output: PathBuf,

    /// The prefix for the output files
    #[arg(short, long, default_value_t = ("profile-").to_string())]
    prefix: String,
}

fn synthetic_inputs(args: &Args) -> Result<AdmmInputs, Box<dyn Error>> {
    let mut rng = rand::rngs::SmallRng::seed_from_u64(args.seed);
    let delta = Normal::new(1e-4, 2e-5)?;
    let beta = Normal::new(1e-6, 2e-7)?;
    let intensity = Uniform::new(0.0, 1.0)?;

    let (z, w) = (args.rows, args.width);
    let obj = ArrayD::from_shape_simple_fn(IxDyn(&[z, w, w]), || {
        Complex64::new(rng.sample(delta), rng.sample(beta))
    });
    let data = Array3::from_shape_simple_fn((args.views, z, w), || rng.sample(intensity));

    Ok(AdmmInputs {
        obj,
        voxelsize: 1e-6,
        data,
        probe: Array2::ones((z, w)),
        theta: Array1::linspace(0.0, PI, args.views),
        v: Array1::zeros(args.views),
        h: Array1::zeros(args.views),
        energy: 5.0,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AdmmConfig::from_json_file(path)?,
        None => AdmmConfig::new(args.niter, args.rho, args.gamma),
    };

    let gen_start = Instant::now();
    let inputs = synthetic_inputs(&args)?;
    log::info!(
        "[Main] Generated {} views of a {}x{}x{} object in {:?}",
        args.views,
        args.rows,
        args.width,
        args.width,
        gen_start.elapsed()
    );

    let run_start = Instant::now();
    let outcomes = launch(args.ranks, move |comm| {
        let inputs = comm.is_root().then(|| inputs.clone());
        admm(comm, EchoPtychoSolver, EchoTomoSolver, inputs, config.clone())
    })
    .await?;
    log::info!(
        "[Main] {} ranks finished in {:?}",
        args.ranks,
        run_start.elapsed()
    );

    let Some(root) = outcomes.first() else {
        return Ok(());
    };
    for residual in &root.residuals {
        log::info!(
            "[Main] Iteration {}: r={:.6e}, s={:.6e}",
            residual.iteration,
            residual.primal,
            residual.dual
        );
    }

    std::fs::create_dir_all(&args.output)?;
    root.timings
        .write_step_timings_to_csv(&output_file(&args, "steps.csv"))?;
    root.timings
        .write_collective_timings_to_csv(&output_file(&args, "collectives.csv"))?;

    let store = LocalStore::new(&LocalConfig::new(&args.output, &args.prefix));
    let object_path = store.write("object", &root.object).await?;
    let ids: Vec<String> = (0..outcomes.len()).map(|rank| format!("lamda-rank{}", rank)).collect();
    let written = try_join_all(
        ids.iter()
            .zip(&outcomes)
            .map(|(id, outcome)| store.write(id, &outcome.lamda)),
    )
    .await?;
    log::info!(
        "[Main] Exported the object to {} and {} multiplier partitions",
        object_path.display(),
        written.len()
    );
    Ok(())
}

fn output_file(args: &Args, name: &str) -> PathBuf {
    args.output.join(format!("{}{}", args.prefix, name))
}
