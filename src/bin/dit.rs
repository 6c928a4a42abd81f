use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dit::{DitError, ExecutionContext, Interpreter, Repl};

#[derive(Parser)]
#[command(author, version, about = "dit language interpreter")]
struct Args {
    /// Where generated guest files and worker drivers are written
    #[arg(long, env = "DIT_TMP_DIR", global = true)]
    tmp_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a .dit file
    Run { script: PathBuf },
    /// Start an interactive REPL session
    Repl,
    /// Evaluate a snippet of dit code
    Eval { source: String },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("DIT_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut context = ExecutionContext::default();
    if let Some(tmp_dir) = args.tmp_dir {
        context.tmp_dir = tmp_dir;
    }
    match execute(args.command.unwrap_or(Command::Repl), context) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn execute(command: Command, context: ExecutionContext) -> Result<(), DitError> {
    match command {
        Command::Run { script } => {
            let mut interpreter = Interpreter::with_context(context);
            interpreter.run_file(&script)?;
            interpreter.shutdown()
        }
        Command::Repl => Repl::with_context(context).run(),
        Command::Eval { source } => {
            let mut interpreter = Interpreter::with_context(context);
            interpreter.eval_source(&source)?;
            interpreter.shutdown()
        }
    }
}
