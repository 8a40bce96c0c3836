#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use cfs::{ChainFs, FileInfo, format_volume};
use cfs_block::FileBlockDevice;
use std::env;
use std::path::Path;

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "mkfs" => {
            let Some(path) = args.next() else {
                bail!("mkfs requires <image-path> <total-blocks>");
            };
            let Some(blocks) = args.next() else {
                bail!("mkfs requires <image-path> <total-blocks>");
            };
            let blocks: u16 = blocks
                .parse()
                .with_context(|| format!("invalid block count: {blocks}"))?;
            mkfs(Path::new(&path), blocks)
        }
        "info" => {
            let Some(path) = args.next() else {
                bail!("info requires a path argument");
            };
            let json = args.any(|arg| arg == "--json");
            info(Path::new(&path), json)
        }
        "ls" => {
            let Some(path) = args.next() else {
                bail!("ls requires a path argument");
            };
            let json = args.any(|arg| arg == "--json");
            ls(Path::new(&path), json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("cfs-cli\n");
    println!("USAGE:");
    println!("  cfs-cli mkfs <image-path> <total-blocks>");
    println!("  cfs-cli info <image-path> [--json]");
    println!("  cfs-cli ls <image-path> [--json]");
}

fn mkfs(path: &Path, blocks: u16) -> Result<()> {
    let dev = FileBlockDevice::create(path, u32::from(blocks))
        .with_context(|| format!("failed to create image {}", path.display()))?;
    let sb = format_volume(&dev).context("failed to format volume")?;
    println!(
        "formatted {}: {} blocks ({} data, chain table in {})",
        path.display(),
        sb.total_blocks,
        sb.data_block_count,
        sb.chain_table_blocks,
    );
    Ok(())
}

fn mount(path: &Path) -> Result<ChainFs> {
    let mut fs = ChainFs::new();
    fs.mount_path(path)
        .with_context(|| format!("failed to mount {}", path.display()))?;
    Ok(fs)
}

fn info(path: &Path, json: bool) -> Result<()> {
    let mut fs = mount(path)?;
    let info = fs.info()?;
    fs.unmount()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("total_blocks:      {}", info.total_blocks);
        println!("chain_table_blocks: {}", info.chain_table_blocks);
        println!("root_dir_block:    {}", info.root_dir_block);
        println!("data_start_block:  {}", info.data_start_block);
        println!("data_block_count:  {}", info.data_block_count);
        println!(
            "chain free:        {}/{}",
            info.free_chain_entries, info.data_block_count
        );
        println!("directory free:    {}/128", info.free_directory_entries);
    }
    Ok(())
}

fn ls(path: &Path, json: bool) -> Result<()> {
    let mut fs = mount(path)?;
    let rows: Vec<FileInfo> = fs.list()?.collect();
    fs.unmount()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for row in &rows {
            match row.first_block {
                Some(block) => {
                    println!("{:<16} {:>10} bytes  first block {block}", row.name, row.size);
                }
                None => println!("{:<16} {:>10} bytes", row.name, row.size),
            }
        }
    }
    Ok(())
}
