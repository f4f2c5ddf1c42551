use structopt::StructOpt;

use recon::command::RebuildCommand;

fn main() {
    let cmd = RebuildCommand::from_args();

    if let Err(err) = cmd.init_logging() {
        eprintln!("warning: {}", err);
    }

    if let Err(err) = cmd.run() {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}
