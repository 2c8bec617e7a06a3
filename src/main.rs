//! Trains a fully connected classifier on a synthetic dataset and saves it as a
//! checkpoint, or evaluates/inspects a saved checkpoint, using `fcnet_rs`
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! cargo run -- train --dataset moon --hidden 16,16 --checkpoint moon.fcn
//! cargo run -- eval --checkpoint moon.fcn --dataset moon
//! cargo run -- inspect --checkpoint moon.fcn
//! ```

use std::{error::Error, path::PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use fcnet_rs::{
    checkpoint::{Checkpoint, load_checkpoint, save_checkpoint},
    dataloader::DataLoader,
    datasets::{Dataset, N_CLASSES, N_FEATURES, load_dataset},
    nn::{Module, Network},
    optim::{Adam, Optim, SGD},
    train::{fit, validation},
};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

#[derive(Parser)]
#[command(about = "Train, save and restore fully connected classifiers")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a network and save it as a checkpoint
    Train(TrainArgs),
    /// Restore a checkpoint and report loss and accuracy on fresh data
    Eval(EvalArgs),
    /// Print the architecture and parameter shapes stored in a checkpoint
    Inspect {
        #[arg(short, long)]
        checkpoint: PathBuf,
    },
}

#[derive(Debug, ValueEnum, Clone, Copy)]
enum Optimizer {
    Sgd,
    Adam,
}

#[derive(clap::Args)]
struct DataArgs {
    #[arg(short, long, default_value_t = Dataset::Xor)]
    dataset: Dataset,
    #[arg(long, default_value_t = 500)]
    class_size: usize,
    /// Seed for data, initialization and shuffling; random when omitted
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(clap::Args)]
struct TrainArgs {
    #[command(flatten)]
    data: DataArgs,
    #[arg(short, long, default_value_t = 50)]
    batch_size: usize,
    #[arg(short, long, default_value_t = 30)]
    epochs: usize,
    #[arg(long, default_value_t = 0.001)]
    lr: f32,
    /// Only used by SGD
    #[arg(short, long, default_value_t = 0.9)]
    momentum: f32,
    #[arg(long, value_enum, default_value_t = Optimizer::Adam)]
    optimizer: Optimizer,
    /// Width of each hidden layer, comma separated
    #[arg(long, value_delimiter = ',', default_value = "16,16")]
    hidden: Vec<usize>,
    #[arg(long, default_value_t = 0.2)]
    drop_p: f32,
    #[arg(short, long, default_value_t = 5)]
    print_epochs: usize,
    #[arg(short, long, default_value = "checkpoint.fcn")]
    checkpoint: PathBuf,
}

#[derive(clap::Args)]
struct EvalArgs {
    #[command(flatten)]
    data: DataArgs,
    #[arg(short, long)]
    checkpoint: PathBuf,
}

fn train(args: TrainArgs) -> Result<(), Box<dyn Error>> {
    let seed = args.data.seed.unwrap_or_else(rand::random);
    log::info!("seed: {}", seed);
    let mut rng = Pcg64Mcg::seed_from_u64(seed);

    let (data, labels) = load_dataset(args.data.dataset, args.data.class_size, &mut rng);
    let train_loader = DataLoader::new(data, labels, args.batch_size, true)?;
    let (data, labels) = load_dataset(args.data.dataset, args.data.class_size / 4 + 1, &mut rng);
    let valid_loader = DataLoader::new(data, labels, args.batch_size, false)?;

    let model = Network::with_seed(N_FEATURES, N_CLASSES, &args.hidden, args.drop_p, seed)?;
    let mut optim: Box<dyn Optim> = match args.optimizer {
        Optimizer::Sgd => Box::new(SGD::new(model.parameters(), args.lr, args.momentum)),
        Optimizer::Adam => Box::new(Adam::new(model.parameters(), args.lr)),
    };
    fit(
        &model,
        optim.as_mut(),
        &train_loader,
        &valid_loader,
        args.epochs,
        args.print_epochs,
        &mut rng,
    )?;

    save_checkpoint(&model, &args.checkpoint)?;
    Ok(())
}

fn eval(args: EvalArgs) -> Result<(), Box<dyn Error>> {
    let model = load_checkpoint(&args.checkpoint)?;
    let mut rng = match args.data.seed {
        Some(seed) => Pcg64Mcg::seed_from_u64(seed),
        None => Pcg64Mcg::seed_from_u64(rand::random()),
    };
    let (data, labels) = load_dataset(args.data.dataset, args.data.class_size, &mut rng);
    let loader = DataLoader::new(data, labels, 100, false)?;
    let result = validation(&model, &loader)?;
    println!(
        "{}: loss {:.4}, accuracy {:.3} over {} samples",
        args.data.dataset,
        result.loss,
        result.accuracy,
        loader.len()
    );
    Ok(())
}

fn inspect(path: PathBuf) -> Result<(), Box<dyn Error>> {
    let checkpoint = Checkpoint::load(&path)?;
    println!("checkpoint: {}", path.display());
    println!("input_size: {}", checkpoint.input_size);
    println!("output_size: {}", checkpoint.output_size);
    println!("hidden_layers: {:?}", checkpoint.hidden_layers);
    println!("drop_p: {}", checkpoint.drop_p);
    for (name, tensor) in checkpoint.parameters.iter() {
        println!("  {:<28} {:?}", name, tensor.shape());
    }
    println!("values: {}", checkpoint.n_values());
    match checkpoint.validate() {
        Ok(()) => println!("consistent: yes"),
        Err(e) => println!("consistent: no ({e})"),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    match Args::parse().command {
        Command::Train(args) => train(args),
        Command::Eval(args) => eval(args),
        Command::Inspect { checkpoint } => inspect(checkpoint),
    }
}
