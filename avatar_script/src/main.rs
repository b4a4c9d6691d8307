use anyhow::Result;

mod cli;
mod runtime;

use cli::Command;

fn main() -> Result<()> {
    env_logger::init();

    match cli::parse()? {
        Command::Run(args) => runtime::execute(args),
        Command::Strip(args) => runtime::strip(args),
    }
}
