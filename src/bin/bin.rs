use anyhow::{Context, Result};
use folio::{driver, Config, OkapiClient};
use log::info;
use std::{
    env,
    fs::File,
    io::{self, Read, Write},
    path::PathBuf,
    process,
};
use structopt::StructOpt;

/// Delete the permanent location of FOLIO items listed by barcode in the first column of a
/// tab separated file, writing a barcode, status, and message row for each one.
#[derive(StructOpt)]
struct Options {
    /// Input file (default: stdin)
    #[structopt(short, long, parse(from_os_str))]
    infile: Option<PathBuf>,
    /// Output file (truncate if exists, default: stdout)
    #[structopt(short, long, parse(from_os_str))]
    outfile: Option<PathBuf>,
    /// Name of config file
    #[structopt(short = "C", long = "config_file", default_value = "config.ini", parse(from_os_str))]
    config_file: PathBuf,
    /// Increase verbosity level
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load from .env file if it is present
    dotenv::dotenv().ok();
    // Get command line arguments
    let options = Options::from_args();
    // Initialize logging, RUST_LOG wins over -v
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level(options.verbose))).init();
    let config = match Config::load(&options.config_file) {
        Ok(config) => config.apply_overrides(|key| env::var(key).ok()),
        Err(error) => {
            eprintln!("{}", error);
            process::exit(error.exit_code());
        }
    };

    // Reading the input blocks this task, so Ctrl-C is watched from a task of its own
    exit_on_interrupt()?;
    run(&options, &config).await
}

fn interrupted() -> ! {
    println!("Interrupted");
    process::exit(0);
}

/// Install the Ctrl-C handler now, before any input is read, and exit with status 0 when it fires.
#[cfg(unix)]
fn exit_on_interrupt() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).context("installing the interrupt handler")?;
    tokio::spawn(async move {
        if interrupt.recv().await.is_some() {
            interrupted();
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn exit_on_interrupt() -> Result<()> {
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupted();
        }
    });
    Ok(())
}

async fn run(options: &Options, config: &Config) -> Result<()> {
    let input: Box<dyn Read> = match &options.infile {
        Some(path) => Box::new(File::open(path).with_context(|| format!("opening {}", path.display()))?),
        None => Box::new(io::stdin()),
    };
    let output: Box<dyn Write> = match &options.outfile {
        Some(path) => Box::new(File::create(path).with_context(|| format!("creating {}", path.display()))?),
        None => Box::new(io::stdout()),
    };
    // Construct okapi client
    let client = OkapiClient::login(config).await.context("logging in to Okapi")?;
    info!("logged in to {} as {}", config.okapi_url, config.username);

    let mut reader = driver::tsv_reader(input);
    let mut writer = driver::tsv_writer(output);
    let summary = driver::delete_location_loop(&client, &mut reader, &mut writer).await?;
    info!(
        "{} rows: {} items updated, {} skipped, {} errors.",
        summary.rows, summary.updated, summary.skipped, summary.errors
    );
    Ok(())
}
