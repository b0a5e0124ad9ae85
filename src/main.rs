use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use moca_native::NativeConfig;
use moca_native::scenario::{FrameSummary, Process, Scenario};
use moca_native::stack::{DescriptorTable, NativeSupport, StackError};

#[derive(Parser)]
#[command(name = "moca-native")]
#[command(about = "Inspect native stacks described by scenario files", long_about = None)]
struct Cli {
    /// Configuration file with a [native] table
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log trap, unwinder and patch events
    #[arg(long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the native stack
    Dump {
        /// The scenario file
        scenario: PathBuf,
    },
    /// List the frames of the native stack
    Walk {
        /// The scenario file
        scenario: PathBuf,

        /// Print frames as JSON
        #[arg(long)]
        json: bool,
    },
    /// Find the handler for an exception raised by the current call
    Unwind {
        /// The scenario file
        scenario: PathBuf,

        /// Catch depth of the process (negative: no active catch)
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        catches: i32,
    },
    /// Install the stack trap and print the scan boundary
    Trap {
        /// The scenario file
        scenario: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match NativeConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => NativeConfig::default(),
    };
    config.trace |= cli.trace;
    init_logging(config.trace);

    let result = match cli.command {
        Commands::Dump { scenario } => load(&scenario, &config).and_then(|p| dump(&p, &config)),
        Commands::Walk { scenario, json } => {
            load(&scenario, &config).and_then(|p| walk(&p, &config, json))
        }
        Commands::Unwind { scenario, catches } => {
            load(&scenario, &config).and_then(|mut p| unwind(&mut p, &config, catches))
        }
        Commands::Trap { scenario } => {
            load(&scenario, &config).and_then(|mut p| trap(&mut p, &config))
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn init_logging(trace: bool) {
    let default = if trace { "moca_native=trace,warn" } else { "warn" };
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(path: &Path, config: &NativeConfig) -> Result<Process, String> {
    Scenario::load(path)?.build(config)
}

fn stack_error(err: StackError) -> String {
    format!("inconsistent native stack: {}", err)
}

fn dump(process: &Process, config: &NativeConfig) -> Result<(), String> {
    let support = NativeSupport::new(&process.table, config, process.fail_handler);
    let dump = support
        .dump_stack(&process.stack, &process.ctx)
        .map_err(stack_error)?;
    print!("{}", dump);
    Ok(())
}

fn walk(process: &Process, config: &NativeConfig, json: bool) -> Result<(), String> {
    let support = NativeSupport::new(&process.table, config, process.fail_handler);
    let frames = support
        .frames(&process.stack, &process.ctx)
        .map_err(stack_error)?;
    let summaries: Vec<FrameSummary> = frames.iter().map(FrameSummary::from).collect();

    if json {
        let text = serde_json::to_string_pretty(&summaries)
            .map_err(|e| format!("failed to serialize frames: {}", e))?;
        println!("{}", text);
        return Ok(());
    }

    for frame in &summaries {
        print!(
            "{:>6}  ra={:#x} size={} arity={}",
            frame.base, frame.return_address, frame.frame_size, frame.arity
        );
        if let Some(handler) = frame.handler {
            print!(" handler={:#x}", handler);
        }
        if frame.trapped {
            print!(" [trap]");
        }
        println!();
    }
    println!("{} frames", summaries.len());
    Ok(())
}

fn unwind(process: &mut Process, config: &NativeConfig, catches: i32) -> Result<(), String> {
    let support = NativeSupport::new(&process.table, config, process.fail_handler);
    let handler = support
        .find_handler(&mut process.stack, &mut process.ctx, catches)
        .map_err(stack_error)?;
    let kind = if handler == process.fail_handler {
        "terminator"
    } else {
        "catch"
    };
    println!("handler  {:#x} ({})", handler, kind);
    println!("resume   sp={}", process.stack.top());
    if let Some(limit) = process.ctx.gray_limit {
        println!("graylim  {}", limit);
    }
    Ok(())
}

fn trap(process: &mut Process, config: &NativeConfig) -> Result<(), String> {
    let support = NativeSupport::new(&process.table, config, process.fail_handler);
    // Pop the current call's arguments, as on return into the innermost frame.
    let args = config.stack_arity(process.ctx.arity);
    if process.stack.top() + args > process.stack.end() {
        return Err(stack_error(StackError::Overrun {
            index: process.stack.top() + args,
            end: process.stack.end(),
        }));
    }
    process.stack.set_top(process.stack.top() + args);
    process.ctx.arity = 0;
    let start = process
        .table
        .find(process.ctx.return_address)
        .ok_or_else(|| {
            stack_error(StackError::MissingDescriptor {
                return_address: process.ctx.return_address,
            })
        })?;
    support
        .install_or_advance(&mut process.stack, &mut process.ctx, start)
        .map_err(stack_error)?;

    match (process.ctx.trap_slot, process.ctx.gray_limit) {
        (Some(slot), Some(limit)) => {
            println!("trap     slot {}", slot);
            println!("graylim  {}", limit);
            if let Some(ra) = process.ctx.saved_return {
                println!("saved ra {:#x}", ra);
            }
        }
        _ => println!("no trap: stack too shallow"),
    }
    Ok(())
}
