use std::fs;
use std::path::PathBuf;
use std::process::exit;

use anyhow::{bail, Context, Result};
use log::debug;
use structopt::clap::ErrorKind;
use structopt::StructOpt;

use romflash::chip::BK_BOOTLOADER_END;
use romflash::cli::{self, Command, Opts};
use romflash::transport::SerialTransport;
use romflash::{CancelToken, ChipFamily, EventSink, FlashOptions, FlasherState, LogLevel};

fn main() {
    pretty_env_logger::init();

    let args = cli::normalize_args(std::env::args());

    let opts = match Opts::from_iter_safe(args) {
        Ok(opts) => opts,
        Err(err)
            if err.kind == ErrorKind::HelpDisplayed || err.kind == ErrorKind::VersionDisplayed =>
        {
            println!("{}", err.message);
            exit(0);
        }
        Err(err) => {
            eprintln!("{}", err.message);
            exit(1);
        }
    };

    if let Err(err) = run(opts) {
        eprintln!("Error: {:#}", err);
        exit(1);
    }
}

fn run(opts: Opts) -> Result<()> {
    let chip = opts.chip;

    // The BK, WM and ESP ROMs listen at 115200 and negotiate up from
    // there; the Bouffalo ROM autobauds straight at the requested rate.
    let initial_baud = if chip.is_bl() { opts.baud } else { 115_200 };
    let transport = SerialTransport::new(&opts.port, initial_baud);

    let events = EventSink::new()
        .on_log(|level, message| match level {
            LogLevel::Info => println!("{}", message),
            LogLevel::Success => println!("[OK] {}", message),
            LogLevel::Warning => println!("[warn] {}", message),
            LogLevel::Error => eprintln!("[error] {}", message),
        })
        .on_progress(|done, total| {
            if total > 0 {
                print!("\r{:>3}% ({}/{} KiB)", done * 100 / total, done / 1024, total / 1024);

                if done == total {
                    println!();
                }
            }
        })
        .on_state(|state| {
            debug!("flasher state: {:?}", state);

            if matches!(state, FlasherState::Completed | FlasherState::Cancelled) {
                println!();
            }
        });

    let cancel = CancelToken::new();
    let mut flasher = romflash::flasher_for(
        chip,
        transport,
        opts.baud,
        FlashOptions::default(),
        events,
        cancel,
    );

    let outcome = match &opts.command {
        Command::FullRead => {
            flasher.do_read(0, 0, true).map_err(Into::into).and_then(|()| {
                let data = flasher
                    .read_result()
                    .context("read completed without a result buffer")?;

                save_backup(&opts, chip, 0, data)
            })
        }
        Command::ReadFlash => {
            let size = opts.size.context("read_flash needs --size")?;
            let start_sector = opts.addr / 4096;
            let sectors = (size + 4095) / 4096;

            flasher
                .do_read(start_sector, sectors, false)
                .map_err(Into::into)
                .and_then(|()| {
                    let data = flasher
                        .read_result()
                        .context("read completed without a result buffer")?;

                    save_backup(&opts, chip, opts.addr, data)
                })
        }
        Command::FullWrite { file } => write_file(flasher.as_mut(), chip, file, 0),
        Command::WriteFlash { file } => write_file(flasher.as_mut(), chip, file, opts.addr),
        Command::Test => run_test(flasher.as_mut(), &opts),
    };

    flasher.close();

    outcome
}

fn write_file(
    flasher: &mut dyn romflash::Flasher,
    chip: ChipFamily,
    file: &PathBuf,
    addr: u32,
) -> Result<()> {
    let data = fs::read(file).with_context(|| format!("could not read {}", file.display()))?;

    // QIO packages carry the bootloader in their first sectors. On the
    // T/U parts that region must not be rewritten, so the body is flashed
    // past it instead.
    let is_qio = file
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.contains("_QIO_"))
        .unwrap_or(false);

    if chip.is_bk_tu() && is_qio && addr == 0 {
        let skip = BK_BOOTLOADER_END as usize;

        if data.len() <= skip {
            bail!("{} is smaller than the bootloader region", file.display());
        }

        println!(
            "QIO image: skipping the first {:#x} bootloader bytes",
            BK_BOOTLOADER_END
        );

        flasher.do_write(BK_BOOTLOADER_END, &data[skip..])?;
    } else {
        flasher.do_write(addr, &data)?;
    }

    Ok(())
}

fn run_test(flasher: &mut dyn romflash::Flasher, opts: &Opts) -> Result<()> {
    let size = opts.size.unwrap_or(0x1000) as usize;
    let pattern: Vec<u8> = (0..size).map(|i| (i * 7 + 13) as u8).collect();

    println!("Writing a {} byte test pattern at {:#x}", size, opts.addr);
    flasher.do_write(opts.addr, &pattern)?;

    let start_sector = opts.addr / 4096;
    let sectors = (size as u32 + 4095) / 4096;

    flasher.do_read(start_sector, sectors, false)?;

    let read_back = flasher
        .read_result()
        .context("read completed without a result buffer")?;

    if read_back.len() < pattern.len() || read_back[..pattern.len()] != pattern[..] {
        bail!("test pattern mismatch after read-back");
    }

    println!("Test pattern verified");

    Ok(())
}

fn save_backup(opts: &Opts, chip: ChipFamily, start: u32, data: &[u8]) -> Result<()> {
    let path = match &opts.out {
        Some(path) => path.clone(),
        None => PathBuf::from(backup_name(chip, start)),
    };

    fs::write(&path, data).with_context(|| format!("could not write {}", path.display()))?;

    println!("Saved {} KiB to {}", data.len() / 1024, path.display());

    Ok(())
}

/// `readResult_{chip}_{QIO|UA}_{timestamp}.bin`: a read from the very
/// start of flash makes a QIO-shaped backup, one from past the bootloader
/// a UA-shaped one.
fn backup_name(chip: ChipFamily, start: u32) -> String {
    let flavour = if start == BK_BOOTLOADER_END { "UA" } else { "QIO" };
    let timestamp = chrono::Local::now().format("%Y-%d-%-m-%H-%M-%S");

    format!("readResult_{}_{}_{}.bin", chip.name(), flavour, timestamp)
}
