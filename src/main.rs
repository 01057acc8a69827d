//! certificate-tag command-line interface.
//!
//! Thin I/O shell around the library: reads the input binary, applies the
//! requested tag operations and writes the result back (in place unless
//! `--out` is given). Exit codes: 0 on success, 1 on operation errors,
//! 255 on usage errors.

use anyhow::{Context, Result};
use certificate_tag::{find_tag, Binary};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::fmt::Write as _;

fn cli() -> Command {
    Command::new("certificate-tag")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Manipulate tags in Authenticode-signed Windows binaries")
        .arg(
            Arg::new("dump-appended-tag")
                .long("dump-appended-tag")
                .action(ArgAction::SetTrue)
                .help("Dump any appended tag to stdout"),
        )
        .arg(
            Arg::new("remove-appended-tag")
                .long("remove-appended-tag")
                .action(ArgAction::SetTrue)
                .help("Remove any appended tag and rewrite the binary"),
        )
        .arg(
            Arg::new("load-appended-tag")
                .long("load-appended-tag")
                .value_name("FILE")
                .help("Set the appended tag to the contents of this file and rewrite the binary"),
        )
        .arg(
            Arg::new("set-superfluous-cert-tag")
                .long("set-superfluous-cert-tag")
                .value_name("TAG")
                .help(
                    "Set a superfluous certificate tag with this value and rewrite the binary. \
                     A leading '0x' means the value is hex-encoded",
                ),
        )
        .arg(
            Arg::new("padded-length")
                .long("padded-length")
                .value_name("BYTES")
                .value_parser(clap::value_parser!(usize))
                .help("Zero-pad the superfluous cert tag to at least this many bytes"),
        )
        .arg(
            Arg::new("save-pkcs7")
                .long("save-pkcs7")
                .value_name("FILE")
                .help("Write the PKCS#7 data from the original binary to this file"),
        )
        .arg(
            Arg::new("out")
                .long("out")
                .value_name("FILE")
                .help("Write the updated binary to this file instead of updating in place"),
        )
        .arg(
            Arg::new("print-tag-details")
                .long("print-tag-details")
                .action(ArgAction::SetTrue)
                .help("Print the location and size of the superfluous cert tag buffer"),
        )
        .arg(
            Arg::new("binary")
                .value_name("BINARY")
                .required(true)
                .help("Signed PE or MSI file to operate on"),
        )
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = match cli().try_get_matches() {
        Ok(matches) => matches,
        Err(err)
            if matches!(
                err.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            err.exit()
        }
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(255);
        }
    };

    if let Err(err) = run(&matches) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run(matches: &ArgMatches) -> Result<()> {
    let in_path = matches.get_one::<String>("binary").unwrap();
    let out_path = matches
        .get_one::<String>("out")
        .cloned()
        .unwrap_or_else(|| in_path.clone());

    let contents =
        std::fs::read(in_path).with_context(|| format!("failed to read {in_path}"))?;
    let binary = Binary::parse(contents)?;

    let mut did_something = false;
    let mut final_contents: Option<Vec<u8>> = None;

    if let Some(path) = matches.get_one::<String>("save-pkcs7") {
        std::fs::write(path, binary.asn1_data())
            .with_context(|| format!("failed to write {path}"))?;
        did_something = true;
    }

    if matches.get_flag("dump-appended-tag") {
        match binary.appended_tag() {
            Some(tag) => print!("{}", hex_dump(tag)),
            None => eprintln!("No appended tag found"),
        }
        did_something = true;
    }

    if matches.get_flag("remove-appended-tag") {
        let updated = binary
            .remove_appended_tag()
            .context("error while removing appended tag")?;
        std::fs::write(&out_path, &updated)
            .with_context(|| format!("failed to write {out_path}"))?;
        final_contents = Some(updated);
        did_something = true;
    }

    if let Some(path) = matches.get_one::<String>("load-appended-tag") {
        let tag = std::fs::read(path).with_context(|| format!("failed to read {path}"))?;
        let updated = binary
            .set_appended_tag(&tag)
            .context("error while setting appended tag")?;
        std::fs::write(&out_path, &updated)
            .with_context(|| format!("failed to write {out_path}"))?;
        final_contents = Some(updated);
        did_something = true;
    }

    if let Some(value) = matches.get_one::<String>("set-superfluous-cert-tag") {
        let mut payload = if let Some(hex_value) = value.strip_prefix("0x") {
            hex::decode(hex_value).context("failed to parse tag contents from command line")?
        } else {
            value.clone().into_bytes()
        };
        if let Some(&padded_length) = matches.get_one::<usize>("padded-length") {
            if payload.len() < padded_length {
                payload.resize(padded_length, 0);
            }
        }

        let updated = binary
            .set_superfluous_cert_tag(&payload)
            .context("error while setting superfluous certificate tag")?;
        std::fs::write(&out_path, &updated)
            .with_context(|| format!("failed to write {out_path}"))?;
        final_contents = Some(updated);
        did_something = true;
    }

    if matches.get_flag("print-tag-details") {
        let (offset, length) = match &final_contents {
            Some(bytes) => {
                // Locate against the bytes just written; the rewrite may
                // have moved the signature stream.
                let reparsed = Binary::parse(bytes.clone())?;
                find_tag(bytes, reparsed.certificate_offset())
                    .context("error while searching for tag in file bytes")?
            }
            None => find_tag(binary.contents(), binary.certificate_offset())
                .context("error while searching for tag in file bytes")?,
        };
        println!("Tag offset, length: ({offset}, {length})");
        did_something = true;
    }

    if !did_something {
        match binary.appended_tag() {
            None => println!("No appended tag"),
            Some(tag) => println!("Appended tag included, {} bytes", tag.len()),
        }
    }

    Ok(())
}

/// Canonical sixteen-bytes-per-line hex dump with offset and ASCII columns.
fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", i * 16);
        for j in 0..16 {
            match chunk.get(j) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
            if j == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        for &b in chunk {
            out.push(if (0x20..0x7F).contains(&b) { b as char } else { '.' });
        }
        out.push_str("|\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_dump_formats_like_a_canonical_dump() {
        let dump = hex_dump(b"Gact\x05\x00\x00\x00hello");
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("00000000  47 61 63 74 05 00 00 00  68 65 6c 6c 6f"));
        assert!(lines[0].ends_with("|Gact....hello|"));
    }

    #[test]
    fn hex_dump_multiline_offsets() {
        let dump = hex_dump(&[0u8; 33]);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("00000010"));
        assert!(lines[2].starts_with("00000020"));
    }

    #[test]
    fn cli_accepts_all_flags() {
        cli().debug_assert();
    }
}
