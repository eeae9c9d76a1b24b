//! Config command - configuration inspection.

use anyhow::Result;
use clap::{Args, Subcommand};

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration as YAML
    Show,

    /// Show which config file is loaded
    Which,
}

pub fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => {
            print!("{}", ctx.loaded.config.to_yaml()?);
        }
        ConfigCommand::Which => match &ctx.loaded.source {
            Some(path) => println!("{}", path.display()),
            None => println!("(defaults, no config file)"),
        },
    }
    Ok(())
}
