use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use xcpflash::{
    Flashing, LoaderSettings, TargetDB, Transport,
    device::parse_number,
    format,
    transport::{NetSettings, SerialSettings, UsbSettings},
};

#[derive(Parser)]
#[command(
    name = "xcpflash",
    version,
    about = "Command-line firmware loader for XCP bootloaders over serial, USB or TCP/IP"
)]
struct Cli {
    /// Serial port of the bootloader
    #[arg(long, short, global = true)]
    port: Option<String>,
    #[arg(long, short, global = true, default_value_t = 57600)]
    baud: u32,
    /// Append a byte checksum to every serial packet
    #[arg(long, global = true)]
    checksum: bool,
    /// Use the USB bulk interface instead of a serial port
    #[arg(long, global = true)]
    usb: bool,
    /// Use XCP on TCP/IP, as `host` or `host:port`
    #[arg(long, global = true)]
    net: Option<String>,
    /// Shared library with the seed/key algorithm
    #[arg(long, global = true)]
    seed_key: Option<PathBuf>,
    /// Check the firmware against a target description, e.g. STM32F103xB
    #[arg(long, global = true)]
    target: Option<String>,
    /// Load address of raw binary files
    #[arg(long, global = true, value_parser = parse_u32, default_value = "0x08000000")]
    base: u32,
    /// Command timeout in ms
    #[arg(long, global = true)]
    t1: Option<u64>,
    /// PROGRAM_START timeout in ms
    #[arg(long, global = true)]
    t3: Option<u64>,
    /// Erase timeout in ms
    #[arg(long, global = true)]
    t4: Option<u64>,
    /// Program and reset timeout in ms
    #[arg(long, global = true)]
    t5: Option<u64>,
    /// CONNECT timeout in ms
    #[arg(long, global = true)]
    t6: Option<u64>,
    /// Print packets, twice for everything
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print the session parameters
    Info,
    /// Reset the target into its user program
    Reset,
    /// Erase a flash range
    Erase {
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32)]
        len: u32,
    },
    /// Download a firmware file and reset
    Flash {
        /// S-record, Intel HEX, ELF or raw binary file
        path: PathBuf,
        /// Read the firmware back before the reset
        #[arg(long)]
        verify: bool,
    },
    /// Compare the flash contents with a firmware file
    Verify { path: PathBuf },
    /// Read memory and print a hexdump
    Read {
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32)]
        len: u32,
    },
    /// Convert a firmware file to S-records
    Convert { input: PathBuf, output: PathBuf },
}

fn parse_u32(s: &str) -> Result<u32, String> {
    parse_number(s).map_err(|e| e.to_string())
}

impl Cli {
    fn loader_settings(&self) -> LoaderSettings {
        let mut settings = LoaderSettings::default();
        let ms = Duration::from_millis;
        if let Some(t) = self.t1 {
            settings.t1 = ms(t);
        }
        if let Some(t) = self.t3 {
            settings.t3 = ms(t);
        }
        if let Some(t) = self.t4 {
            settings.t4 = ms(t);
        }
        if let Some(t) = self.t5 {
            settings.t5 = ms(t);
        }
        if let Some(t) = self.t6 {
            settings.t6 = ms(t);
        }
        settings.seed_key_library = self.seed_key.clone();
        settings
    }

    fn flashing(&self) -> Result<Flashing<Box<dyn Transport>>> {
        let loader_settings = self.loader_settings();
        if self.usb {
            return Flashing::new_from_usb(UsbSettings::default(), loader_settings);
        }
        if let Some(net) = &self.net {
            let settings = match net.rsplit_once(':') {
                Some((host, port)) => NetSettings {
                    address: host.to_string(),
                    port: port.parse()?,
                },
                None => NetSettings::new(net.as_str()),
            };
            return Ok(Flashing::new_from_net(settings, loader_settings));
        }
        let Some(port) = &self.port else {
            let ports = xcpflash::transport::SerialTransport::scan_ports()?;
            anyhow::bail!(
                "No transport selected, use --port, --usb or --net. Serial ports: {}",
                ports.join(", ")
            );
        };
        let settings = SerialSettings {
            baudrate: self.baud,
            checksum: self.checksum,
            ..SerialSettings::new(port.as_str())
        };
        Ok(Flashing::new_from_serial(settings, loader_settings))
    }

    fn load_firmware(&self, path: &Path) -> Result<xcpflash::FirmwareData> {
        let firmware = format::read_firmware_from_file(path, self.base)?;
        log::info!(
            "Firmware size: {} bytes in {} segment(s)",
            firmware.total_len(),
            firmware.segment_count()
        );
        if let Some(name) = &self.target {
            let target = TargetDB::load()?.find_target(name)?;
            log::info!("Target: {}", target);
            target.check_firmware(&firmware)?;
        }
        Ok(firmware)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    match &cli.command {
        Commands::Info => {
            cli.flashing()?.dump_info()?;
        }
        Commands::Reset => {
            cli.flashing()?.reset()?;
        }
        Commands::Erase { address, len } => {
            cli.flashing()?.erase(*address, *len)?;
        }
        Commands::Flash { path, verify } => {
            let firmware = cli.load_firmware(path)?;
            let mut flashing = cli.flashing()?;

            let bar = ProgressBar::new(firmware.total_len() as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
                    .progress_chars("#>-"),
            );
            let progress = |n: usize| bar.inc(n as u64);
            let result = if *verify {
                flashing.download_and_verify(&firmware, progress)
            } else {
                flashing.download(&firmware, progress)
            };
            bar.finish_and_clear();
            result?;
        }
        Commands::Verify { path } => {
            let firmware = cli.load_firmware(path)?;
            cli.flashing()?.verify(&firmware)?;
        }
        Commands::Read { address, len } => {
            let data = cli.flashing()?.read(*address, *len as usize)?;
            let mut out = Vec::new();
            hxdmp::hexdump(&data, &mut out)?;
            println!("{}", String::from_utf8_lossy(&out));
        }
        Commands::Convert { input, output } => {
            let firmware = cli.load_firmware(input)?;
            std::fs::write(output, format::write_srec(&firmware))?;
            log::info!("Wrote {}", output.display());
        }
    }

    Ok(())
}
