use clap::Parser;
use dumpshift::error::PipelineError;
use dumpshift::logging;

mod cmd;

use cmd::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let format = match cli.log_format() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };
    logging::init(&cli.log_level, format);

    if let Err(e) = cmd::run(cli).await {
        match e.downcast_ref::<PipelineError>() {
            Some(pe) => eprint!("{}", pe.format_detailed()),
            None => eprintln!("Error: {e:#}"),
        }
        std::process::exit(1);
    }
}
