//! Command dispatch: bridges CLI args -> engine operations -> output formatting.

pub mod config_cmd;
pub mod line;
pub mod reset;
pub mod util;

use simsync_core::Engine;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

/// Dispatch a provider-bound command to the appropriate handler.
pub async fn dispatch(cmd: Command, engine: &Engine, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        Command::Show(args) => line::show(engine, args, global).await,
        Command::Set(args) => line::set(engine, args, global).await,
        Command::Watch(args) => line::watch(engine, args, global).await,
        Command::Reset(args) => reset::handle(engine, args, global).await,
        // Config and Completions are handled before dispatch
        Command::Config(_) | Command::Completions(_) => Err(CliError::Internal(
            "command does not use the provider".into(),
        )),
    }
}
