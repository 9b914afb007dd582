use std::path::PathBuf;

use structopt::StructOpt;

use crate::chip::ChipFamily;

#[derive(StructOpt, Debug)]
pub enum Command {
    /// Read the whole flash into a backup file
    #[structopt(name = "fread")]
    FullRead,
    /// Write a firmware file over the whole flash
    #[structopt(name = "fwrite")]
    FullWrite {
        /// The firmware file to flash
        file: PathBuf,
    },
    /// Read a flash range selected with --addr and --size
    #[structopt(name = "read_flash")]
    ReadFlash,
    /// Write a file at --addr
    #[structopt(name = "write_flash")]
    WriteFlash {
        /// The file to flash
        file: PathBuf,
    },
    /// Write a pattern, read it back and verify it
    #[structopt(name = "test")]
    Test,
}

#[derive(StructOpt, Debug)]
#[structopt(name = "romflash", about = "UART ROM bootloader flasher")]
pub struct Opts {
    #[structopt(subcommand)]
    pub command: Command,

    /// The serial device to flash through
    #[structopt(env = "SERIAL_PORT", short = "p", long = "port")]
    pub port: String,

    /// The baud rate negotiated once the bootloader answers
    #[structopt(env = "BAUD_RATE", short = "b", long = "baud", default_value = "921600")]
    pub baud: u32,

    /// Target chip family (BK7231N, BL602, ESP32C3, W800, ...)
    #[structopt(long = "chip")]
    pub chip: ChipFamily,

    /// Flash offset, decimal or 0x-hex
    #[structopt(long = "addr", default_value = "0", parse(try_from_str = parse_int))]
    pub addr: u32,

    /// Transfer size in bytes, decimal or 0x-hex
    #[structopt(long = "size", parse(try_from_str = parse_int))]
    pub size: Option<u32>,

    /// Output file name for reads
    #[structopt(long = "out")]
    pub out: Option<PathBuf>,
}

/// Parses a decimal or `0x`-prefixed integer.
pub fn parse_int(text: &str) -> Result<u32, String> {
    let text = text.trim();

    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        text.parse()
    };

    parsed.map_err(|_| format!("invalid integer: {}", text))
}

/// Rewrites the legacy single-dash argument spelling into the current one
/// before clap sees it.
pub fn normalize_args<I: IntoIterator<Item = String>>(args: I) -> Vec<String> {
    args.into_iter()
        .map(|arg| {
            match arg.as_str() {
                "-read" => "fread",
                "-write" => "fwrite",
                "-cread" => "read_flash",
                "-cwrite" => "write_flash",
                "-test" => "test",
                "-port" => "--port",
                "-baud" => "--baud",
                "-chip" => "--chip",
                "-ofs" => "--addr",
                "-len" => "--size",
                "-out" => "--out",
                "-help" | "/?" => "--help",
                other => other,
            }
            .to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn it_should_parse_decimal_and_hex_integers() {
        assert_eq!(parse_int("921600").unwrap(), 921_600);
        assert_eq!(parse_int("0x11000").unwrap(), 0x11000);
        assert_eq!(parse_int("0X1000").unwrap(), 0x1000);
        assert!(parse_int("banana").is_err());
        assert!(parse_int("0xZZ").is_err());
    }

    #[test]
    fn it_should_rewrite_legacy_arguments() {
        let rewritten = normalize_args(args(&[
            "romflash", "-read", "-port", "COM3", "-chip", "BK7231N", "-ofs", "0x1000",
        ]));

        assert_eq!(
            rewritten,
            args(&[
                "romflash", "fread", "--port", "COM3", "--chip", "BK7231N", "--addr", "0x1000",
            ])
        );
    }

    #[test]
    fn it_should_keep_modern_arguments_untouched() {
        let untouched = args(&["romflash", "write_flash", "fw.bin", "--port", "/dev/ttyUSB0"]);

        assert_eq!(normalize_args(untouched.clone()), untouched);
    }

    #[test]
    fn it_should_parse_a_full_command_line() {
        let opts = Opts::from_iter_safe(normalize_args(args(&[
            "romflash", "-cread", "-p", "/dev/ttyUSB0", "-chip", "w800", "-ofs", "0x0", "-len",
            "0x1000", "-out", "dump.bin",
        ])))
        .unwrap();

        assert!(matches!(opts.command, Command::ReadFlash));
        assert_eq!(opts.port, "/dev/ttyUSB0");
        assert_eq!(opts.baud, 921_600);
        assert_eq!(opts.chip, ChipFamily::W800);
        assert_eq!(opts.addr, 0);
        assert_eq!(opts.size, Some(0x1000));
        assert_eq!(opts.out, Some(PathBuf::from("dump.bin")));
    }

    #[test]
    fn it_should_require_a_chip_family() {
        let result = Opts::from_iter_safe(args(&["romflash", "fread", "-p", "COM3"]));

        assert!(result.is_err());
    }
}
