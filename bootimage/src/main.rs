use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process;

use abi::{Abi, Endian, WordSize};
use clap::Parser;
use log::error;

use bootimage::{write_boot_image, Filters, WriteConfig};
use runtime::{Classpath, Machine};

#[derive(Parser, Debug)]
#[command(
    name = "bootimage",
    about = "Write an ahead-of-time boot image from an initialized VM"
)]
struct Cli {
    /// Directory holding the .class files to process
    classpath: PathBuf,

    /// Where to write the image
    output: PathBuf,

    /// Only process this class
    class_name: Option<String>,

    /// Only compile methods with this name
    method_name: Option<String>,

    /// Only compile methods with this descriptor
    method_spec: Option<String>,

    /// Target word size in bits (defaults to the host's)
    #[arg(long, value_parser = ["32", "64"])]
    target_word: Option<String>,

    /// Emit a big-endian image
    #[arg(long)]
    big_endian: bool,

    /// Cross-check target layout against host layout (same-ABI targets only)
    #[arg(long)]
    debug_native_target: bool,
}

fn main() {
    pretty_env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprint!("{e}");
            process::exit(-1);
        }
    };

    let host = Abi::host();
    let target = Abi {
        word: match cli.target_word.as_deref() {
            Some("32") => WordSize::W32,
            Some("64") => WordSize::W64,
            _ => host.word,
        },
        endian: if cli.big_endian { Endian::Big } else { host.endian },
    };

    let classpath = match Classpath::open(&cli.classpath) {
        Ok(cp) => cp,
        Err(e) => {
            error!("unable to read classpath {}: {e}", cli.classpath.display());
            process::exit(-1);
        }
    };

    let output = match File::create(&cli.output) {
        Ok(f) => f,
        Err(e) => {
            error!("unable to open {}: {e}", cli.output.display());
            process::exit(-1);
        }
    };

    let mut config = WriteConfig::new(target);
    config.filters = Filters {
        class_name: cli.class_name,
        method_name: cli.method_name,
        method_spec: cli.method_spec,
    };
    config.debug_native_target = cli.debug_native_target;

    let mut machine = Machine::bootstrap(host);
    let mut out = BufWriter::new(output);
    match write_boot_image(&mut machine, &classpath, &mut out, &config) {
        Ok(_) => {}
        Err(e) => {
            error!("{e}");
            process::exit(-1);
        }
    }
}
