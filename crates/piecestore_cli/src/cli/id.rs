//! Piece ID tools.

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use piecestore_core::{NodeId, PieceId};

pub fn cli() -> Command {
    Command::new("id")
        .about("Generate, parse and derive piece IDs")
        .subcommand_required(true)
        .subcommand(Command::new("new").about("Generate a random root piece ID"))
        .subcommand(
            Command::new("parse")
                .about("Print the raw bytes of a piece ID as hex")
                .arg(Arg::new("piece_id").required(true).action(ArgAction::Set)),
        )
        .subcommand(
            Command::new("derive")
                .about("Derive the piece ID stored on a node")
                .args([
                    Arg::new("root").required(true).action(ArgAction::Set),
                    Arg::new("node_id").required(true).action(ArgAction::Set),
                    Arg::new("piece_num")
                        .required(true)
                        .value_parser(value_parser!(i32))
                        .allow_negative_numbers(true)
                        .action(ArgAction::Set),
                ]),
        )
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a String> {
    match args.get_one::<String>(name) {
        Some(value) => Ok(value),
        None => bail!("Missing <{name}>"),
    }
}

pub fn exec(args: &ArgMatches) -> Result<()> {
    match args.subcommand() {
        Some(("new", _)) => println!("{}", PieceId::try_generate()?),
        Some(("parse", cmd)) => {
            let piece_id: PieceId = required(cmd, "piece_id")?.parse()?;
            println!("{}", hex::encode(piece_id.as_bytes()));
        }
        Some(("derive", cmd)) => {
            let root: PieceId = required(cmd, "root")?.parse()?;
            let node_id: NodeId = required(cmd, "node_id")?
                .parse()
                .context("Invalid node ID")?;
            let Some(piece_num) = cmd.get_one::<i32>("piece_num") else {
                bail!("Missing <piece_num>");
            };
            println!("{}", root.derive(&node_id, *piece_num));
        }
        _ => unreachable!(),
    }
    Ok(())
}
