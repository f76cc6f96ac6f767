use std::path::PathBuf;

pub type CmdResult<T> = divoc::Result<(T, i32)>;

pub(crate) struct GlobalArgs {
    /// Explicit divoc.json location (`--config`).
    pub config: Option<PathBuf>,
}

pub mod check;
pub mod config;
pub mod generate;

macro_rules! dispatch {
    ($args:expr, $global:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args, $global))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (divoc::Result<serde_json::Value>, i32) {
    match command {
        crate::Commands::Generate(args) => dispatch!(args, global, generate),
        crate::Commands::Check(args) => dispatch!(args, global, check),
        crate::Commands::Config(args) => dispatch!(args, global, config),
    }
}
