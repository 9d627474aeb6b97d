use crate::cli::Commands;
use anyhow::Result;

pub mod list;
pub mod namespaces;
pub mod run;

/// Dispatch command to appropriate handler, returning the process exit code
pub fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Run(args) => run::execute(&args),

        Commands::List => list::execute().map(|()| 0),

        Commands::Namespaces { pid } => namespaces::execute(pid).map(|()| 0),
    }
}
