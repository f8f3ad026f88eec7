use clap::Parser;
use dslsfs::{
    cli_interface::{Command, DslsFsCli},
    FsConfig,
};

/// a CLI interface to users to format a volume inside an image file,
/// or look at the metadata header of one offline.
fn main() -> anyhow::Result<()> {
    env_logger::builder().format_timestamp_nanos().init();
    let args = DslsFsCli::parse();
    let mut config = match &args.config {
        Some(path) => FsConfig::from_json_file(path)?,
        None => FsConfig::default(),
    };
    match args.command {
        Command::Mkfs(args) => {
            if let Some(block_size) = args.block_size {
                config.block_size = block_size;
                // keep the cluster a whole number of blocks
                if config.cluster_size % block_size != 0 {
                    config.cluster_size = block_size;
                }
            }
            if args.no_journal {
                config.journal_enabled = false;
            }
            let info = dslsfs::mkfs::mkfs(&args.image, args.size, &args.name, &config)?;
            println!(
                "formatted {} on {}: {} blocks of {} bytes, {} inodes",
                info.name,
                args.image,
                info.size / info.block_size as u64,
                info.block_size,
                info.inode_count
            );
        }
        Command::Inspect(args) => {
            let summary = dslsfs::inspect::inspect(&args.image)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", summary.render());
            }
        }
    }
    Ok(())
}
