mod cli;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    vigil::detect::telemetry::init_tracing();
    let args: Vec<String> = std::env::args().collect();
    if cli::handle_commands(&args)? {
        return Ok(());
    }
    cli::print_usage();
    std::process::exit(2);
}
