use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use msd_core::config::FlashConfig;
use msd_core::events::{FlashEvent, FlashObserver, LogLevel};
use msd_core::integrity::verify_all_crcs;
use msd_core::session::{FlashRequest, FlashSession};
use msd_core::transport::SocketCanTransport;
use msd_core::validate::validate;
use msd_core::variant::EcuVariant;
use msd_core::{CalibrationImage, refresh_all_crcs};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "msdflash",
    author,
    version,
    about = "Safety-gated calibration flasher for BMW MSD80/MSD81 (N54)",
    long_about = "Validates, backs up, flashes and verifies MSD80/MSD81 calibration \
                  images over CAN. A seven-layer safety gate refuses anything that \
                  could brick the controller."
)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Controller variant override (msd80, msd81).
    #[arg(long, global = true)]
    variant: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a candidate image and flash it to the controller.
    Flash {
        /// Candidate calibration image.
        image: PathBuf,

        /// Known-stock image for diff classification.
        #[arg(long)]
        stock: Option<PathBuf>,

        /// Accept the validator's non-fatal warnings.
        #[arg(long)]
        ack_warnings: bool,

        /// Identity recorded in the backup sidecar.
        #[arg(long, default_value = "unknown")]
        ecu_id: String,
    },

    /// Read the calibration region and store a verified backup.
    Backup {
        /// Identity recorded in the backup sidecar.
        #[arg(long, default_value = "unknown")]
        ecu_id: String,
    },

    /// Run the safety gate and CRC verification on an on-disk image.
    Check {
        image: PathBuf,

        /// Known-stock image for diff classification.
        #[arg(long)]
        stock: Option<PathBuf>,
    },

    /// Recompute and rewrite the CRC slots of an on-disk image.
    FixCrc {
        image: PathBuf,

        /// Output path; defaults to `<image>.corrected.bin`.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the CRC zone map and guarded regions for a variant.
    Zones,
}

/// Observer that renders progress to stderr.
struct CliObserver {
    verbose: bool,
}

impl FlashObserver for CliObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::Connected { tx_id, rx_id } => {
                eprintln!("connected (tx 0x{tx_id:03X}, rx 0x{rx_id:03X})");
            }
            FlashEvent::PhaseChanged { to, .. } => {
                eprintln!("==> {to}");
            }
            FlashEvent::Progress {
                phase,
                bytes_done,
                bytes_total,
            } => {
                let pct = if *bytes_total > 0 {
                    bytes_done * 100 / bytes_total
                } else {
                    0
                };
                eprint!("\r[{pct:>3}%] {phase}: {bytes_done}/{bytes_total} bytes");
                if bytes_done == bytes_total {
                    eprintln!();
                }
            }
            FlashEvent::Warning { offset, message } => {
                eprintln!("warning @ 0x{offset:06X}: {message}");
            }
            FlashEvent::BackupWritten { path, sha256 } => {
                eprintln!("backup: {} (sha256 {})", path.display(), &sha256[..16]);
            }
            FlashEvent::Unlocked { algorithm } => match algorithm {
                Some(a) => eprintln!("unlocked via {a}"),
                None => eprintln!("controller already unlocked"),
            },
            FlashEvent::RollbackStarted => eprintln!("! attempting rollback from backup"),
            FlashEvent::RollbackFinished { ok } => {
                eprintln!("! rollback {}", if *ok { "succeeded" } else { "FAILED" });
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Error => eprintln!("ERROR: {message}"),
                LogLevel::Warn => eprintln!("WARN: {message}"),
                _ if self.verbose => eprintln!("{message}"),
                _ => {}
            },
            FlashEvent::Finalized => eprintln!("done."),
            FlashEvent::Aborted { phase } => eprintln!("aborted during {phase}"),
            FlashEvent::Failed { phase, message } => {
                eprintln!("FAILED during {phase}: {message}");
            }
        }
    }
}

fn load_config(cli: &Cli) -> Result<FlashConfig> {
    let mut config = match &cli.config {
        Some(path) => FlashConfig::load_from_file(path)?,
        None => FlashConfig::default(),
    };
    if let Some(variant) = &cli.variant {
        config.variant.id = variant
            .parse::<EcuVariant>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    Ok(config)
}

fn open_transport(config: &FlashConfig) -> Result<SocketCanTransport> {
    match config.transport.driver.as_str() {
        "socketcan" => Ok(SocketCanTransport::open(&config.transport.channel)?),
        other => bail!("unsupported transport driver '{other}'"),
    }
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn cmd_flash(
    config: FlashConfig,
    verbose: bool,
    image: &Path,
    stock: Option<&Path>,
    ack_warnings: bool,
    ecu_id: &str,
) -> Result<i32> {
    let candidate = read_image(image)?;
    let stock = stock.map(read_image).transpose()?;

    let transport = open_transport(&config)?;
    let observer = Arc::new(CliObserver { verbose });
    let mut session = FlashSession::with_observer(transport, config, observer);

    match session.flash(FlashRequest {
        candidate,
        stock,
        acknowledge_warnings: ack_warnings,
        source_ecu_id: ecu_id.to_string(),
    }) {
        Ok(summary) => {
            info!(bytes = summary.bytes_written, "flash complete");
            Ok(0)
        }
        Err(failure) => {
            eprintln!("{failure}");
            Ok(failure.exit_code())
        }
    }
}

fn cmd_backup(config: FlashConfig, verbose: bool, ecu_id: &str) -> Result<i32> {
    let transport = open_transport(&config)?;
    let observer = Arc::new(CliObserver { verbose });
    let mut session = FlashSession::with_observer(transport, config, observer);

    match session.backup_only(ecu_id) {
        Ok(record) => {
            println!("{}", record.bin_path.display());
            Ok(0)
        }
        Err(failure) => {
            eprintln!("{failure}");
            Ok(failure.exit_code())
        }
    }
}

fn cmd_check(config: &FlashConfig, image: &Path, stock: Option<&Path>) -> Result<i32> {
    let variant = config.variant.id;
    let candidate = read_image(image)?;
    let stock = stock.map(read_image).transpose()?;

    let report = match validate(variant, &candidate, stock.as_deref(), true, true) {
        Ok(report) => report,
        Err(refused) => {
            eprintln!("{refused}");
            return Ok(2);
        }
    };

    for warning in &report.warnings {
        println!("warning @ 0x{:06X}: {}", warning.offset, warning.message);
    }
    for class in &report.classified {
        println!(
            "modified 0x{:06X}+{}: {} ({})",
            class.offset, class.len, class.label, class.category
        );
    }

    match verify_all_crcs(report.image.bytes(), variant.spec()) {
        Ok(()) => {
            println!(
                "all {} CRC zones valid",
                variant.spec().zone_map.zones().len()
            );
            Ok(0)
        }
        Err(mismatches) => {
            for m in &mismatches {
                println!(
                    "zone {}: computed 0x{:08X}, stored 0x{:08X}",
                    m.zone, m.computed, m.stored
                );
            }
            println!(
                "{} zone(s) invalid; run fix-crc to rewrite the slots",
                mismatches.len()
            );
            Ok(2)
        }
    }
}

fn cmd_fix_crc(config: &FlashConfig, image: &Path, output: Option<&Path>) -> Result<i32> {
    let variant = config.variant.id;
    let data = read_image(image)?;
    let cal =
        CalibrationImage::from_bytes(variant, data).map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut bytes = cal.bytes().to_vec();
    refresh_all_crcs(&mut bytes, variant.spec()).map_err(|e| anyhow::anyhow!("{e}"))?;

    let out = match output {
        Some(path) => path.to_path_buf(),
        None => image.with_extension("corrected.bin"),
    };
    std::fs::write(&out, &bytes).with_context(|| format!("writing {}", out.display()))?;
    println!("{}", out.display());
    Ok(0)
}

fn cmd_zones(config: &FlashConfig) -> Result<i32> {
    let spec = config.variant.id.spec();
    println!(
        "{} calibration: base 0x{:08X}, {} bytes",
        spec.variant, spec.base_addr, spec.cal_size
    );
    println!("\nCRC zones:");
    for zone in spec.zone_map.zones() {
        println!(
            "  {:<8} 0x{:06X}..0x{:06X}  crc @ 0x{:06X}",
            zone.name, zone.start, zone.end, zone.crc_slot
        );
    }
    println!("\nforbidden regions:");
    for region in spec.forbidden {
        println!(
            "  0x{:06X}..0x{:06X}  {}",
            region.start, region.end, region.reason
        );
    }
    println!("\nrejected maps:");
    for map in spec.rejected {
        println!("  0x{:06X}+{:<4} {}", map.offset, map.len, map.label);
    }
    Ok(0)
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::WARN.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let result = load_config(&cli).and_then(|config| match &cli.command {
        Command::Flash {
            image,
            stock,
            ack_warnings,
            ecu_id,
        } => cmd_flash(
            config,
            cli.verbose,
            image,
            stock.as_deref(),
            *ack_warnings,
            ecu_id,
        ),
        Command::Backup { ecu_id } => cmd_backup(config, cli.verbose, ecu_id),
        Command::Check { image, stock } => cmd_check(&config, image, stock.as_deref()),
        Command::FixCrc { image, output } => cmd_fix_crc(&config, image, output.as_deref()),
        Command::Zones => cmd_zones(&config),
    });

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}
