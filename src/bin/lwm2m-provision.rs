#[macro_use]
extern crate log;

use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use lwm2m_harness::configuration::ENV_LOGLEVEL;
use lwm2m_harness::error::{HarnessError, Result};
use lwm2m_harness::provisioning::{
    parse_data_model, FirmwareHeader, ForcedError, MultiPackage, ProvisioningBuilder, LINKED_SLOTS_LENGTH,
    MAGIC_LENGTH,
};

#[derive(Parser, Debug)]
#[clap(version, about = "Builds factory-provisioning files and firmware packages", long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serialises a JSON data-model description as SenML CBOR
    DataModel {
        /// JSON description: object ID -> instance ID -> resource ID -> value
        #[clap(short, long)]
        input: PathBuf,
        #[clap(short, long)]
        output: PathBuf,
    },
    /// Prepends a firmware header to an image
    Firmware {
        #[clap(short, long)]
        input: PathBuf,
        #[clap(short, long)]
        output: PathBuf,
        /// Eight-character magic, e.g. ANJAY_FW
        #[clap(short, long, default_value = "ANJAY_FW")]
        magic: String,
        #[clap(short = 'V', long, default_value = "")]
        firmware_version: String,
        /// Failure path of the simulated update engine
        #[clap(short, long, default_value_t = 0)]
        forced_error: u16,
        /// Linked-slot bitmap as 16 hex digits
        #[clap(short, long)]
        linked_slots: Option<String>,
    },
    /// Concatenates packages into a multi-package
    Multipackage {
        #[clap(short, long)]
        output: PathBuf,
        #[clap(required = true)]
        packages: Vec<PathBuf>,
    },
}

fn fixed<const N: usize>(what: &str, bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| HarnessError::Setup(format!("{what} must be exactly {N} bytes")))
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::DataModel { input, output } => {
            let model = parse_data_model(&std::fs::read(&input)?)?;
            let mut builder = ProvisioningBuilder::new();
            builder.add_data_model(&model)?;
            std::fs::write(&output, builder.build()?)?;
            info!("Wrote {} records into {}", builder.records().len(), output.display());
        }
        Command::Firmware {
            input,
            output,
            magic,
            firmware_version,
            forced_error,
            linked_slots,
        } => {
            let mut header = FirmwareHeader::new(fixed::<MAGIC_LENGTH>("magic", magic.as_bytes())?, &firmware_version)
                .with_forced_error(ForcedError(forced_error));
            if let Some(slots) = linked_slots {
                let slots = hex::decode(&slots).map_err(|e| HarnessError::Setup(format!("linked slots: {e}")))?;
                header = header.with_linked_slots(fixed::<LINKED_SLOTS_LENGTH>("linked slots", &slots)?);
            }
            let package = header.wrap(&std::fs::read(&input)?)?;
            std::fs::write(&output, &package)?;
            info!("Wrote {} byte package into {}", package.len(), output.display());
        }
        Command::Multipackage { output, packages } => {
            let packages = packages
                .iter()
                .map(std::fs::read)
                .collect::<std::io::Result<Vec<_>>>()?;
            std::fs::write(&output, MultiPackage::new(packages).encode()?)?;
            info!("Wrote multi-package into {}", output.display());
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or(ENV_LOGLEVEL, "info")).init();

    match run(Args::parse().command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
