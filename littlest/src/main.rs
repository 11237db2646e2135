use std::error::Error;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use littlest::{
    DEFAULT_STEP_SLICE, ObjectMemory, Vm, bootstrap_classes, execute, load_source, read_image,
    read_split_image, write_image,
};

#[derive(Parser)]
#[command(name = "littlest", version, about = "A little Smalltalk virtual machine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a saved image until its system process finishes.
    Run {
        image: PathBuf,
        /// Payload file of a split image; the positional argument is
        /// then the header table.
        #[arg(long)]
        data: Option<PathBuf>,
        /// Bytecodes per scheduling slice.
        #[arg(long, default_value_t = DEFAULT_STEP_SLICE)]
        steps: usize,
        /// Trace sends to methods whose watch slot is set.
        #[arg(long)]
        watch: bool,
    },
    /// Bootstrap the core classes, load a source file, and save an
    /// image.
    Build {
        source: PathBuf,
        #[arg(short, long, default_value = "systemImage")]
        output: PathBuf,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run {
            image,
            data,
            steps,
            watch,
        } => run(&image, data.as_deref(), steps, watch),
        Command::Build { source, output } => build(&source, &output),
    };
    if let Err(e) = result {
        error!("{e}");
        exit(1);
    }
}

fn run(
    image: &std::path::Path,
    data: Option<&std::path::Path>,
    steps: usize,
    watch: bool,
) -> Result<(), Box<dyn Error>> {
    let mut mem = ObjectMemory::new();
    let symbols = match data {
        Some(data_path) => {
            let mut table = BufReader::new(File::open(image)?);
            let mut payloads = BufReader::new(File::open(data_path)?);
            read_split_image(&mut mem, &mut table, &mut payloads)?
        }
        None => {
            let mut input = BufReader::new(File::open(image)?);
            read_image(&mut mem, &mut input)?
        }
    };
    info!("loaded {} objects from {}", mem.object_count(), image.display());

    let mut vm = Vm::new();
    vm.adopt(mem, symbols);
    vm.watching = watch;

    let process = vm.global("systemProcess");
    if !process.is_object() {
        return Err("image has no systemProcess".into());
    }
    while execute(&mut vm, process, steps) {}
    Ok(())
}

fn build(source: &std::path::Path, output: &std::path::Path) -> Result<(), Box<dyn Error>> {
    let text = std::fs::read_to_string(source)?;
    let mut vm = Vm::new();
    bootstrap_classes(&mut vm);
    load_source(&mut vm, &text)?;
    if !vm.global("systemProcess").is_object() {
        warn!("source defined no systemProcess; the image will not run");
    }
    let rom_classes: Vec<_> = ["ByteArray", "String", "Symbol", "Block", "Method"]
        .iter()
        .map(|n| vm.global(n))
        .filter(|c| c.is_object())
        .collect();
    let mut out = BufWriter::new(File::create(output)?);
    write_image(&vm.mem, vm.symbols, &rom_classes, &mut out)?;
    info!(
        "wrote {} with {} objects",
        output.display(),
        vm.mem.object_count()
    );
    Ok(())
}
