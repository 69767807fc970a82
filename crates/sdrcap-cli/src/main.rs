//! sdrcap command line interface.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{warn, Level};

use sdrcap_core::{
    init_tracing, run_session, AbortSignal, DeviceRole, DeviceSpec, SessionConfig, Transport, Tuning,
};

#[derive(Parser)]
#[command(name = "sdrcap", version, about = "Multi-radio synchronized capture orchestrator")]
struct Cli {
    /// Verbose logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as newline-delimited JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a capture collection session
    StartSession(StartSessionArgs),
    /// Probe for attached capture devices
    ListDevices {
        /// Command used to enumerate boards
        #[arg(long, default_value = "hackrf_info")]
        probe: String,
    },
}

#[derive(Args)]
struct StartSessionArgs {
    /// Number of runs in the session
    #[arg(short = 'n', long, default_value_t = 1)]
    runs: u32,

    /// Root directory for session output
    #[arg(long, default_value = "Data", env = "SDRCAP_DATA_ROOT")]
    data_root: PathBuf,

    /// Label appended to the session directory name
    #[arg(long, default_value = "")]
    tag: String,

    /// Center frequency in Hz
    #[arg(long, default_value_t = 520_000_000)]
    freq_hz: u64,

    /// Sample rate in Hz
    #[arg(long, default_value_t = 20_000_000)]
    sample_rate_hz: u64,

    /// Samples per capture
    #[arg(long, default_value_t = 7_000)]
    num_samples: u64,

    /// Receiver LNA gain in dB
    #[arg(long, default_value_t = 32)]
    lna_db: u32,

    /// Receiver VGA gain in dB
    #[arg(long, default_value_t = 32)]
    vga_db: u32,

    /// Transmitter VGA gain in dB
    #[arg(long, default_value_t = 45)]
    txvga_db: u32,

    /// Disable the RF amplifier
    #[arg(long)]
    no_rf_amp: bool,

    /// Enable antenna port power (bias tee)
    #[arg(long)]
    antenna_power: bool,

    /// Waveform file replayed by the transmitter
    #[arg(long, default_value = "pilot.iq")]
    pulse: PathBuf,

    /// Serial of the first receiver board
    #[arg(long)]
    rx1_serial: Option<String>,

    /// Serial of the second receiver board
    #[arg(long)]
    rx2_serial: Option<String>,

    /// Serial of the transmitter board
    #[arg(long)]
    tx_serial: Option<String>,

    /// Run the second receiver on a remote host, as user@host
    #[arg(long)]
    rx2_remote: Option<String>,

    /// SSH identity file for remote hosts
    #[arg(long)]
    identity: Option<PathBuf>,

    /// Capture path on the remote host for the second receiver
    #[arg(long, default_value = "capture_2.iq")]
    rx2_remote_outfile: PathBuf,

    /// Run without the second receiver
    #[arg(long)]
    no_rx2: bool,

    /// Gate the transmitter on software readiness markers instead of the
    /// hardware trigger line
    #[arg(long)]
    no_hw_trigger: bool,

    /// Per-receiver readiness timeout in milliseconds
    #[arg(long, default_value_t = 500)]
    ready_timeout_ms: u64,

    /// Per-device exit wait after the capture window, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    tx_wait_timeout_ms: u64,

    /// Extra wait beyond the computed capture duration, in milliseconds
    #[arg(long, default_value_t = 1_000)]
    safety_margin_ms: u64,

    /// Stop the session after the first run that is not Ok
    #[arg(long)]
    fail_fast: bool,

    /// Skip the device preflight probe
    #[arg(long)]
    skip_preflight: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::StartSession(args) => start_session(args).await,
        Commands::ListDevices { probe } => list_devices(&probe).await,
    }
}

async fn start_session(args: StartSessionArgs) -> anyhow::Result<ExitCode> {
    let tuning = Tuning {
        freq_hz: args.freq_hz,
        sample_rate_hz: args.sample_rate_hz,
        num_samples: args.num_samples,
        lna_db: args.lna_db,
        vga_db: args.vga_db,
        txvga_db: args.txvga_db,
        rf_amp: !args.no_rf_amp,
        antenna_power: args.antenna_power,
    };

    let config = SessionConfig {
        runs: args.runs,
        data_root: args.data_root,
        tag: args.tag,
        tuning: tuning.clone(),
        pulse_path: args.pulse.clone(),
        ready_timeout_ms: args.ready_timeout_ms,
        tx_wait_timeout_ms: args.tx_wait_timeout_ms,
        safety_margin_ms: args.safety_margin_ms,
        hw_trigger: !args.no_hw_trigger,
        fail_fast: args.fail_fast,
        probe_command: if args.skip_preflight {
            None
        } else {
            SessionConfig::default().probe_command
        },
        ..SessionConfig::default()
    };

    let mut devices = vec![DeviceSpec::receiver(
        DeviceRole::Rx1,
        Transport::Local,
        args.rx1_serial,
        tuning.clone(),
    )];

    let rx2_transport = match &args.rx2_remote {
        Some(target) => {
            let (user, host) = target
                .split_once('@')
                .context("--rx2-remote must be user@host")?;
            Transport::Remote {
                host: host.to_string(),
                user: user.to_string(),
                identity_file: args.identity.clone(),
            }
        }
        None => Transport::Local,
    };
    let mut rx2 = DeviceSpec::receiver(DeviceRole::Rx2, rx2_transport, args.rx2_serial, tuning.clone());
    if args.rx2_remote.is_some() {
        rx2 = rx2.with_remote_outfile(args.rx2_remote_outfile);
    }
    if args.no_rx2 {
        rx2 = rx2.disabled();
    }
    devices.push(rx2);

    devices.push(DeviceSpec::transmitter(
        Transport::Local,
        args.tx_serial,
        tuning,
        args.pulse,
    ));

    let abort = AbortSignal::new();
    let interrupt = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; aborting session");
            interrupt.trigger();
        }
    });

    let summary = run_session(config, devices, abort)
        .await
        .context("session failed to start")?;

    println!(
        "session {}: {}/{} runs completed, {} failed{}",
        summary.session_dir.display(),
        summary.runs_completed,
        summary.runs_planned,
        summary.failure_count,
        if summary.aborted { " (aborted)" } else { "" },
    );

    Ok(if summary.all_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn list_devices(probe: &str) -> anyhow::Result<ExitCode> {
    let output = tokio::process::Command::new(probe)
        .output()
        .await
        .with_context(|| format!("failed to run {probe}"))?;
    print!("{}", String::from_utf8_lossy(&output.stdout));
    eprint!("{}", String::from_utf8_lossy(&output.stderr));
    Ok(if output.status.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
