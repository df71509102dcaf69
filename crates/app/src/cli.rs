//! Command-line entry points: `serve` (API server) and `run` (headless
//! pipeline until Ctrl+C or end of input).

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::info;

use vigil::detect::{
    config::PipelineConfig,
    pipeline::{Orchestrator, PipelineError, RunState},
    server,
    telemetry,
};

const DEFAULT_BIND: (&str, u16) = ("0.0.0.0", 5000);

pub fn print_usage() {
    eprintln!(
        "Usage:\n  \
         vigil serve [--bind <host:port>]\n  \
         vigil run --source <uri> [--confidence <0..1>] [--no-tracking] [--no-speed] \
         [--loiter-threshold <secs>]"
    );
}

pub fn handle_commands(args: &[String]) -> Result<bool> {
    match args.get(1).map(|s| s.as_str()) {
        Some("serve") => {
            run_serve(args)?;
            Ok(true)
        }
        Some("run") => {
            run_headless(args)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn run_serve(args: &[String]) -> Result<()> {
    let mut bind = (DEFAULT_BIND.0.to_string(), DEFAULT_BIND.1);

    let mut idx = 2;
    while idx < args.len() {
        match args[idx].as_str() {
            "--bind" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| anyhow!("--bind requires a value"))?;
                let (host, port) = value
                    .rsplit_once(':')
                    .ok_or_else(|| anyhow!("--bind must be <host:port>"))?;
                bind = (
                    host.to_string(),
                    port.parse::<u16>()
                        .with_context(|| "--bind port must be an integer".to_string())?,
                );
                idx += 1;
            }
            other => bail!("Unrecognised flag: {other}"),
        }
    }

    let orchestrator = Arc::new(Orchestrator::new(PipelineConfig::default()));
    let api = server::spawn_api_server(Arc::clone(&orchestrator), bind.clone())?;
    info!("API server listening on {}:{}", bind.0, bind.1);

    wait_for_interrupt()?;
    info!("shutting down");
    match orchestrator.stop() {
        Ok(()) | Err(PipelineError::NotRunning) => {}
        Err(err) => bail!(err),
    }
    orchestrator.wait_until_idle(Duration::from_secs(5));
    api.stop();
    Ok(())
}

fn run_headless(args: &[String]) -> Result<()> {
    let mut config = PipelineConfig::default();
    let mut source: Option<String> = None;

    let mut idx = 2;
    while idx < args.len() {
        match args[idx].as_str() {
            "--source" => {
                idx += 1;
                source = Some(
                    args.get(idx)
                        .ok_or_else(|| anyhow!("--source requires a value"))?
                        .clone(),
                );
                idx += 1;
            }
            "--confidence" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| anyhow!("--confidence requires a value"))?
                    .parse::<f32>()
                    .with_context(|| "--confidence must be a number in 0..1".to_string())?;
                if !(0.0..=1.0).contains(&value) {
                    bail!("--confidence must be a number in 0..1");
                }
                config.live.confidence_threshold = value;
                idx += 1;
            }
            "--no-tracking" => {
                config.enable_tracking = false;
                config.enable_speed_estimation = false;
                idx += 1;
            }
            "--no-speed" => {
                config.enable_speed_estimation = false;
                idx += 1;
            }
            "--loiter-threshold" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| anyhow!("--loiter-threshold requires a value"))?
                    .parse::<f64>()
                    .with_context(|| "--loiter-threshold must be a positive number".to_string())?;
                if value <= 0.0 {
                    bail!("--loiter-threshold must be a positive number");
                }
                config.live.enable_loitering_detection = true;
                config.live.loitering_threshold_secs = value;
                idx += 1;
            }
            other => bail!("Unrecognised flag: {other}"),
        }
    }

    config.video_source = source.ok_or_else(|| anyhow!("run requires --source <uri>"))?;
    telemetry::init_metrics_recorder();

    let orchestrator = Orchestrator::new(config);
    orchestrator.start(None)?;

    let interrupted = interrupt_flag()?;
    loop {
        if interrupted.load(Ordering::Relaxed) {
            match orchestrator.stop() {
                Ok(()) | Err(PipelineError::NotRunning) => {}
                Err(err) => bail!(err),
            }
            break;
        }
        if orchestrator.state() == RunState::Idle {
            info!("source drained");
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    orchestrator.wait_until_idle(Duration::from_secs(5));
    Ok(())
}

fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(flag)
}

fn wait_for_interrupt() -> Result<()> {
    let flag = interrupt_flag()?;
    while !flag.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }
    Ok(())
}
