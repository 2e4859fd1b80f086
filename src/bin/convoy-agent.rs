//! convoy-agent - payload binary that runs native test functions on a machine.

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use convoy::suites;

#[derive(Parser)]
#[command(name = "convoy-agent")]
#[command(about = "Runs convoy native functions on the machine under test", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one native function
    Run {
        /// Name of the test that declares the function
        test: String,

        /// Name of the native function
        func: String,
    },

    /// List native functions
    List,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let registry = match suites::builtin() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("convoy-agent: {e}");
            return ExitCode::from(2);
        }
    };

    match cli.command {
        Commands::Run { test, func } => {
            let Some(native) = suites::native(&registry, &test, &func) else {
                eprintln!("convoy-agent: test {test:?} has no native function {func:?}");
                return ExitCode::from(2);
            };
            match (native.func)() {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("{test}/{func}: {e:#}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::List => {
            for desc in registry.iter() {
                for name in desc.native_func_names() {
                    println!("{} {}", desc.name, name);
                }
            }
            ExitCode::SUCCESS
        }
    }
}
