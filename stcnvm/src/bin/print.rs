use anyhow::{Context, Result};
use burn::{backend::NdArray, prelude::*};
use clap::Parser;
use stcnvm_burn::{ConvGruConfig, HyperParameters, TemporalFusion};

type B = NdArray;

/// Builds the recurrent cell selected by `--which_model`, prints it, and runs
/// one zero-filled sequence through it.
#[derive(Parser)]
#[command(name = "stcnvm-print")]
struct Cli {
    /// Feature channels of the recurrent cell
    #[arg(long, default_value_t = 16)]
    channels: usize,

    #[command(flatten)]
    hyper: HyperParameters,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let hyper = cli.hyper.resolve_stage_defaults();
    let fusion = match hyper.temporal_fusion() {
        Ok(fusion) => fusion,
        Err(err) => {
            tracing::warn!(%err, "falling back to the plain recurrent cell");
            TemporalFusion::ConvGru
        }
    };

    let device = Default::default();
    let gru = ConvGruConfig::new(cli.channels)
        .with_fusion(fusion)
        .init::<B>(&device)
        .context("failed to build the recurrent cell")?;
    println!("{gru}");

    let frames = Tensor::<B, 5>::zeros(
        [1, hyper.seq_length, cli.channels, hyper.size, hyper.size],
        &device,
    );
    let (out, hidden) = gru
        .forward_time_series(frames, None)
        .context("forward pass failed")?;
    tracing::info!(output = ?out.dims(), hidden = ?hidden.dims(), "ran one sequence");

    Ok(())
}
