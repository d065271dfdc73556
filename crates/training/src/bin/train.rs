use clap::Parser;
use training::util::{run_train, TrainArgs};

fn main() -> anyhow::Result<()> {
    training::init_tracing();
    let args = TrainArgs::parse();
    let state = run_train(args)?;
    tracing::info!(
        iterations = state.iteration,
        best_mean_iou = state.best_score,
        "training finished"
    );
    Ok(())
}
