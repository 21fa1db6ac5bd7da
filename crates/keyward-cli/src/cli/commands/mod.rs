use super::args::{Cli, Command};
use crate::exit_codes::SUCCESS;

pub(crate) mod allowances;
pub(crate) mod apply;
pub(crate) mod context;
pub(crate) mod prompt;
pub(crate) mod report;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let config = cli.config.as_deref();
    match cli.cmd {
        Command::Prompt(args) => prompt::run(args, config).await,
        Command::Apply(args) => apply::run(args, config).await,
        Command::Allowances(args) => allowances::run(args, config).await,
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(SUCCESS)
        }
    }
}
