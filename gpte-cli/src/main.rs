use std::fs::OpenOptions;
use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use gpte_core::{FileBlockDevice, Gpt, GptProfile};

#[derive(Parser)]
#[command(name = "gpte")]
#[command(about = "Interactive GPT partition table editor", long_about = None)]
struct Cli {
    /// Path to the device or disk image to edit
    device: PathBuf,

    /// Partition-count policy: "default" (4-256 entries) or "constrained" (8-128)
    #[arg(long, default_value = "default")]
    profile: String,
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("E: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let profile = match cli.profile.as_str() {
        "default" => GptProfile::default_profile(),
        "constrained" => GptProfile::constrained(),
        other => bail!("unknown profile '{other}', expected default or constrained"),
    };

    let device = FileBlockDevice::open(&cli.device)
        .with_context(|| format!("opening {}", cli.device.display()))?;
    let mut gpt = Gpt::open(device, profile).context("reading GPT")?;

    let is_tty = std::io::stdin().is_terminal();
    let stdin = std::io::stdin();
    let mut out = std::io::stdout();

    loop {
        if is_tty {
            print!("gpte> ");
            let _ = out.flush();
        }

        let mut line = String::new();
        let bytes = stdin.lock().read_line(&mut line).unwrap_or(0);
        if bytes == 0 {
            if is_tty {
                println!();
            }
            break;
        }

        if dispatch(&mut gpt, line.trim_end_matches(['\n', '\r'])) {
            break;
        }
    }

    Ok(())
}

/// Run one command line against `gpt`. Returns true when the shell should
/// exit (the `quit` command).
fn dispatch(gpt: &mut Gpt<FileBlockDevice>, line: &str) -> bool {
    let line = line.trim_start();
    if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
        return false;
    }

    let args: Vec<&str> = line.split_whitespace().collect();
    match args[0] {
        "help" => cmd_help(),
        "quit" => return true,
        "show" => cmd_show(gpt),
        "write" => cmd_write(gpt),
        "part-add" => cmd_part_add(gpt, &args),
        "part-del" => cmd_part_del(gpt, &args),
        "part-move" => cmd_part_move(gpt, &args),
        "part-resize" => cmd_part_resize(gpt, &args),
        "part-save" => cmd_part_save(gpt, &args),
        "part-load" => cmd_part_load(gpt, &args),
        other => println!("Unknown command {other}"),
    }
    false
}

fn cmd_help() {
    println!("Commands:");
    println!("  help                                    show this text");
    println!("  quit                                    exit without writing");
    println!("  show                                    print headers and partitions");
    println!("  write                                   commit the table to disk");
    println!("  part-add <name> <lba|next> <size> [follow]   add a partition");
    println!("  part-del <name> [follow]                delete a partition");
    println!("  part-move <name> <lba> [follow]          move a partition");
    println!("  part-resize <name> <size|max> [follow]   resize a partition");
    println!("  part-save <name> <file>                  dump partition contents to a file");
    println!("  part-load <name> <file>                  restore partition contents from a file");
}

fn cmd_show(gpt: &Gpt<FileBlockDevice>) {
    print!("{}", gpt.show());
}

fn cmd_write(gpt: &mut Gpt<FileBlockDevice>) {
    if let Err(e) = gpt.write() {
        println!("E: write failed: {e}");
    }
}

fn find_or_report(gpt: &Gpt<FileBlockDevice>, name: &str) -> Option<u32> {
    match gpt.find(name) {
        Some(idx) => Some(idx),
        None => {
            println!("E: part {name} not found");
            None
        }
    }
}

fn cmd_part_add(gpt: &mut Gpt<FileBlockDevice>, args: &[&str]) {
    if args.len() < 4 {
        println!("E: not enough args");
        return;
    }
    let name = args[1];
    let lbsize = gpt.lbsize();
    let idx = gpt.table().last_used_idx().map_or(0, |l| l + 1);

    let first_lba = if args[2] == "next" {
        if idx == 0 {
            gpt.table().first_usable_lba()
        } else {
            match gpt.table().entry(idx - 1) {
                Ok(e) => e.last_lba + 1,
                Err(e) => {
                    println!("E: {e}");
                    return;
                }
            }
        }
    } else {
        match parse_number(args[2]) {
            Some(n) => n,
            None => {
                println!("E: bad lba {}", args[2]);
                return;
            }
        }
    };

    let size_bytes = match parse_number(args[3]) {
        Some(n) => n,
        None => {
            println!("E: bad size {}", args[3]);
            return;
        }
    };
    if size_bytes == 0 || size_bytes % lbsize as u64 != 0 {
        println!("E: size must be a positive multiple of the logical block size");
        return;
    }

    let last_lba = first_lba + size_bytes / lbsize as u64 - 1;
    let entry = gpte_core::PartitionEntry {
        type_guid: [0u8; 16],
        part_guid: gpte_core::codec::new_guid(),
        first_lba,
        last_lba,
        flags: 0,
        name: gpte_core::codec::name_to_raw(name),
    };

    if let Err(e) = gpt.table_mut().part_add(idx, entry) {
        println!("E: {e}");
    }
}

fn cmd_part_del(gpt: &mut Gpt<FileBlockDevice>, args: &[&str]) {
    if args.len() < 2 {
        println!("E: not enough args");
        return;
    }
    let Some(idx) = find_or_report(gpt, args[1]) else {
        return;
    };
    let follow = args.get(2) == Some(&"follow");
    if let Err(e) = gpt.table_mut().part_del(idx, follow) {
        println!("E: failed: {e}");
    }
}

fn cmd_part_move(gpt: &mut Gpt<FileBlockDevice>, args: &[&str]) {
    if args.len() < 3 {
        println!("E: not enough args");
        return;
    }
    let Some(idx) = find_or_report(gpt, args[1]) else {
        return;
    };
    let Some(lba) = parse_number(args[2]) else {
        println!("E: bad lba {}", args[2]);
        return;
    };
    let follow = args.get(3) == Some(&"follow");
    if let Err(e) = gpt.table_mut().part_move(idx, lba, follow) {
        println!("E: failed: {e}");
    }
}

fn cmd_part_resize(gpt: &mut Gpt<FileBlockDevice>, args: &[&str]) {
    if args.len() < 3 {
        println!("E: not enough args");
        return;
    }
    let Some(idx) = find_or_report(gpt, args[1]) else {
        return;
    };
    let follow = args.get(3) == Some(&"follow");
    let lbsize = gpt.lbsize();

    let size = if args[2] == "max" {
        match gpt.table().size_to_fill(idx, lbsize) {
            Ok(s) => s,
            Err(e) => {
                println!("E: {e}");
                return;
            }
        }
    } else {
        match parse_number(args[2]) {
            Some(n) => n,
            None => {
                println!("E: bad size {}", args[2]);
                return;
            }
        }
    };

    if let Err(e) = gpt.table_mut().part_resize(idx, size, lbsize, follow) {
        println!("E: failed: {e}");
    }
}

fn cmd_part_save(gpt: &mut Gpt<FileBlockDevice>, args: &[&str]) {
    if args.len() < 3 {
        println!("E: not enough args");
        return;
    }
    let Some(idx) = find_or_report(gpt, args[1]) else {
        return;
    };
    let mut file = match OpenOptions::new().write(true).create(true).truncate(true).open(args[2]) {
        Ok(f) => f,
        Err(e) => {
            println!("E: {e}");
            return;
        }
    };
    if let Err(e) = gpt.part_save(idx, &mut file) {
        println!("E: failed: {e}");
    }
}

fn cmd_part_load(gpt: &mut Gpt<FileBlockDevice>, args: &[&str]) {
    if args.len() < 3 {
        println!("E: not enough args");
        return;
    }
    let Some(idx) = find_or_report(gpt, args[1]) else {
        return;
    };
    let mut file = match OpenOptions::new().read(true).open(args[2]) {
        Ok(f) => f,
        Err(e) => {
            println!("E: {e}");
            return;
        }
    };
    if let Err(e) = gpt.part_load(idx, &mut file) {
        println!("E: failed: {e}");
    }
}

/// Parse a numeric argument with an optional trailing unit suffix:
/// `s` (x512), `k` (x1024), `m` (x1024^2), `g` (x1024^3). No suffix means
/// the caller-defined default unit (blocks for LBAs, bytes for sizes).
fn parse_number(s: &str) -> Option<u64> {
    let (digits, multiplier) = match s.chars().last() {
        Some('s') => (&s[..s.len() - 1], 512),
        Some('k') => (&s[..s.len() - 1], 1024),
        Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    digits.parse::<u64>().ok().map(|n| n * multiplier)
}
