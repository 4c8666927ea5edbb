use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use expanduser::expanduser;
use piecestore_storage::{PieceHeader, V1_HEADER_SIZE};

pub fn cli() -> Command {
    Command::new("piece")
        .about("Inspect stored pieces")
        .subcommand_required(true)
        .subcommand(
            Command::new("inspect")
                .about("Print the header of a V1 piece file (.sj1) or a V0 header file (.hdr)")
                .arg(
                    Arg::new("path")
                        .value_name("file")
                        .required(true)
                        .action(ArgAction::Set),
                ),
        )
}

/// Read the header of a piece file, picking the format from its extension.
fn read_header(path: &Path) -> Result<PieceHeader> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("sj1") => {
            let mut region = vec![0u8; V1_HEADER_SIZE];
            File::open(path)?.read_exact(&mut region)?;
            Ok(PieceHeader::decode_framed(&region)?)
        }
        Some("hdr") => Ok(PieceHeader::decode(&std::fs::read(path)?)?),
        _ => bail!(
            "Unrecognised piece file {}, expected a .sj1 or .hdr file",
            path.display()
        ),
    }
}

pub fn exec(args: &ArgMatches) -> Result<()> {
    match args.subcommand() {
        Some(("inspect", cmd)) => {
            let Some(path) = cmd.get_one::<String>("path") else {
                bail!("Missing piece file");
            };
            let header = read_header(&expanduser(path)?)?;
            println!("{}", serde_json::to_string_pretty(&header)?);
        }
        _ => unreachable!(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use piecestore_core::{HashAlgorithm, OrderLimit, PieceAction, PieceId, SerialNumber};
    use piecestore_storage::FormatVersion;

    use super::*;

    fn header() -> PieceHeader {
        let data = b"inspect me";
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        PieceHeader {
            format_version: FormatVersion::V1,
            hash: HashAlgorithm::Sha256.digest(data),
            hash_algorithm: HashAlgorithm::Sha256,
            creation_time: now,
            signature: vec![7; 64],
            order_limit: OrderLimit {
                serial_number: SerialNumber::generate(),
                satellite_id: Default::default(),
                uplink_public_key: Default::default(),
                storage_node_id: Default::default(),
                piece_id: PieceId::generate(),
                limit: data.len() as u64,
                action: PieceAction::Put,
                piece_expiration: None,
                order_creation: now,
                order_expiration: now,
                satellite_signature: Vec::new(),
            },
        }
    }

    #[test]
    fn reads_both_header_layouts() {
        let dir = tempfile::tempdir().unwrap();
        let header = header();

        let v1 = dir.path().join("piece.sj1");
        let mut contents = header.encode_framed().unwrap();
        contents.extend_from_slice(b"payload");
        std::fs::write(&v1, contents).unwrap();
        assert_eq!(read_header(&v1).unwrap(), header);

        let v0 = dir.path().join("piece.hdr");
        std::fs::write(&v0, header.encode().unwrap()).unwrap();
        assert_eq!(read_header(&v0).unwrap(), header);

        assert!(read_header(&dir.path().join("piece")).is_err());
    }
}
