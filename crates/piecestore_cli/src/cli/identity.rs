use anyhow::{bail, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use expanduser::expanduser;
use piecestore_core::Identity;

pub fn cli() -> Command {
    Command::new("identity")
        .about("Manage node identities")
        .subcommand_required(true)
        .subcommand(
            Command::new("new")
                .about("Generate a new identity and print its node ID")
                .arg(
                    Arg::new("out")
                        .long("out")
                        .value_name("file")
                        .help("Where to write the identity key")
                        .required(true)
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("force")
                        .long("force")
                        .help("Overwrite an existing key file")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("show")
                .about("Print the node ID of an identity key")
                .arg(
                    Arg::new("file")
                        .value_name("file")
                        .required(true)
                        .action(ArgAction::Set),
                ),
        )
}

pub fn exec(args: &ArgMatches) -> Result<()> {
    match args.subcommand() {
        Some(("new", cmd)) => {
            let Some(out) = cmd.get_one::<String>("out") else {
                bail!("Missing --out");
            };
            let path = expanduser(out)?;
            if path.exists() && !cmd.get_flag("force") {
                bail!("{} already exists, pass --force to overwrite", path.display());
            }

            let identity = Identity::generate();
            identity.save(&path)?;
            println!("{}", identity.node_id());
        }
        Some(("show", cmd)) => {
            let Some(file) = cmd.get_one::<String>("file") else {
                bail!("Missing identity file");
            };
            let identity = Identity::load(expanduser(file)?)?;
            println!("{}", identity.node_id());
        }
        _ => unreachable!(),
    }
    Ok(())
}
