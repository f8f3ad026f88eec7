use std::str::FromStr;

use byte_unit::Byte;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug, PartialEq)]
#[command(author, version, about, long_about)]
pub struct DslsFsCli {
    /// JSON file overriding the default configuration
    #[arg(short, long, global = true)]
    pub config: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// format a new volume inside an image file
    Mkfs(MkfsArgs),
    /// print the metadata header of an image file
    Inspect(InspectArgs),
}

/// make a new fs subcommand
#[derive(clap::Args, Debug, PartialEq)]
#[command(about = "format a new volume inside an image file")]
pub struct MkfsArgs {
    /// the path of the image file, which must not exist yet
    #[arg(short, long)]
    pub image: String,
    /// usable size of the volume, in bytes or with a unit such as `64MiB`
    #[arg(short, long, value_parser = parse_size)]
    pub size: u64,
    /// the volume name
    #[arg(short, long)]
    pub name: String,
    /// overrides the configured block size
    #[arg(short, long)]
    pub block_size: Option<u32>,
    /// format without a journal region
    #[arg(long)]
    pub no_journal: bool,
}

#[derive(clap::Args, Debug, PartialEq)]
#[command(about = "print the metadata header of an image file")]
pub struct InspectArgs {
    /// the path of the image file
    #[arg(short, long)]
    pub image: String,
    /// print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

fn parse_size(raw: &str) -> Result<u64, String> {
    let bytes = Byte::from_str(raw).map_err(|e| format!("{raw:?}: {e}"))?;
    u64::try_from(bytes.get_bytes()).map_err(|e| format!("{raw:?}: {e}"))
}


#[cfg(test)]
mod inspect_parse_args_tests {
    use super::*;

    #[test]
    fn test_inspect_json() {
        let args = DslsFsCli::parse_from(["dslsfs", "inspect", "--image", "test.img", "--json"]);
        assert_eq!(
            args.command,
            Command::Inspect(InspectArgs {
                image: "test.img".to_string(),
                json: true,
            })
        );
    }
}
