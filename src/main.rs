use anyhow::Context;

use gpulife::{
    driver::{CancelToken, FrameDriver, Scheduler, TickOutcome, run_blocking},
    sim::{HostSimulation, SimulationParameters},
};

fn main() -> anyhow::Result<()> {
    let parameters = SimulationParameters::from_env().context("invalid configuration")?;
    gpulife::init_logging(parameters.log_level);

    if std::env::var_os("GPULIFE_HEADLESS").is_some() {
        run_headless(parameters)
    } else {
        gpulife::start(parameters)
    }
}

/// Run the host reference backend on this thread, logging the live
/// population after every tick.
fn run_headless(parameters: SimulationParameters) -> anyhow::Result<()> {
    let initial = parameters
        .initial_state()
        .context("failed to seed the grid")?;
    log::info!(
        "Running {}x{} grid headless, {} cells alive",
        parameters.width,
        parameters.height,
        initial.primary.live_count()
    );

    let simulation = HostSimulation::new(initial).context("invalid initial state")?;
    let mut driver = FrameDriver::new(simulation);
    let mut scheduler = Scheduler::from_parameters(&parameters, CancelToken::new());

    let steps = run_blocking(&mut driver, &mut scheduler, |driver, outcome| {
        if let TickOutcome::Presented { step } = outcome {
            let population = driver
                .backend()
                .last_frame()
                .map_or(0, |frame| frame.visible().count());
            log::info!("step {step}: {population} cells alive");
        }
    })
    .context("headless run failed")?;

    log::info!("Finished after {steps} steps");
    Ok(())
}
