//! smbvfs-shell: run single share operations against a configured export.
//!
//! Each invocation opens one share from `smbvfs.conf` (or a bare directory
//! with `--root`) and performs one operation through the same code path the
//! server uses.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use smbvfs::{
    AttrChangeSet, FileKind, FileRef, LocalBackend, NoLeases, OpenMode, SessionHandles,
    SessionId, ShareVfs, VfsOptions, XattrFlags,
};
use smbvfs_core::config::{GlobalSettings, Settings};
use tracing::debug;

const SESSION: SessionId = SessionId(1);
const READ_CHUNK: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "smbvfs-shell", version, about = "Inspect and modify an SMB share")]
struct Cli {
    /// Config file (default: ~/.config/smbvfs/smbvfs.conf)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Share name from the config file
    #[arg(short, long, conflicts_with = "root")]
    share: Option<String>,

    /// Export this directory directly instead of a configured share
    #[arg(long)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show metadata of a name
    Stat { path: String },
    /// List a directory
    Ls {
        #[arg(default_value = "\\")]
        path: String,
    },
    /// Print a file to stdout
    Cat { path: String },
    /// Write stdin (or --data) into a file, creating it if needed
    Write {
        path: String,
        #[arg(long)]
        data: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Flush before returning
        #[arg(long)]
        sync: bool,
    },
    /// Rename a file or directory
    Mv { from: String, to: String },
    /// Remove a file or empty directory
    Rm { path: String },
    /// Remove an empty directory
    Rmdir { path: String },
    /// Create a directory
    Mkdir {
        path: String,
        #[arg(long, default_value = "755", value_parser = parse_mode)]
        mode: u32,
    },
    /// Set the size of a file
    Truncate { path: String, size: u64 },
    /// Change permission bits (octal)
    Chmod {
        #[arg(value_parser = parse_mode)]
        mode: u32,
        path: String,
    },
    /// Create a hard link, or a symlink with -s
    Ln {
        target: String,
        link: String,
        #[arg(short, long)]
        symbolic: bool,
    },
    /// Extended attributes
    Xattr {
        #[command(subcommand)]
        op: XattrOp,
    },
}

#[derive(Subcommand)]
enum XattrOp {
    List { path: String },
    Get { path: String, name: String },
    Set {
        path: String,
        name: String,
        value: String,
        /// Fail if the attribute exists
        #[arg(long, conflicts_with = "replace")]
        create: bool,
        /// Fail if the attribute does not exist
        #[arg(long)]
        replace: bool,
    },
    Rm { path: String, name: String },
}

fn parse_mode(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s, 8).map_err(|e| format!("invalid octal mode {s:?}: {e}"))
}

fn open_share(cli: &Cli) -> Result<(ShareVfs<LocalBackend>, Arc<SessionHandles<smbvfs::LocalFile>>)> {
    let (root, options, log_level) = match &cli.root {
        Some(root) => {
            let global = GlobalSettings::default();
            let options = VfsOptions::from_settings(&global, None);
            (root.clone(), options, global.log_level)
        }
        None => {
            let settings = Settings::load(cli.config.as_deref())?;
            let share = match &cli.share {
                Some(name) => settings
                    .share(name)
                    .with_context(|| format!("No share named {name:?}"))?,
                None => match settings.shares.as_slice() {
                    [only] => only,
                    [] => bail!("No shares configured"),
                    _ => bail!("Several shares configured; pick one with --share"),
                },
            };
            let options = VfsOptions::from_settings(&settings.global, Some(share));
            (share.path.clone(), options, settings.global.log_level.clone())
        }
    };

    smbvfs_core::logging::init(&log_level);
    debug!("Exporting {:?} with {:?}", root, options);

    let backend =
        LocalBackend::new(&root).with_context(|| format!("Cannot export {:?}", root))?;
    let handles = Arc::new(SessionHandles::new());
    let vfs = ShareVfs::new(backend, handles.clone(), Arc::new(NoLeases), options);
    Ok((vfs, handles))
}

fn kind_char(kind: FileKind) -> char {
    match kind {
        FileKind::Directory => 'd',
        FileKind::Symlink => 'l',
        FileKind::Regular => '-',
        FileKind::Other => '?',
    }
}

fn run(cli: Cli) -> Result<()> {
    let (vfs, handles) = open_share(&cli)?;

    match cli.command {
        Command::Stat { path } => {
            let attrs = vfs.stat(&path)?;
            println!("  kind: {:?}", attrs.kind);
            println!("  mode: {:o}", attrs.permissions());
            println!(" owner: {}:{}", attrs.uid, attrs.gid);
            println!("  size: {}", attrs.size);
            println!(" links: {}", attrs.nlink);
            println!(" inode: {}:{}", attrs.node.dev, attrs.node.ino);
            if attrs.kind == FileKind::Symlink {
                println!("target: {}", vfs.readlink(&path)?);
            }
        }
        Command::Ls { path } => {
            let dir = handles.register(SESSION, vfs.open(&path, OpenMode::READ)?);
            for entry in vfs.readdir(SESSION, dir.fid())? {
                println!("{} {:>10} {}", kind_char(entry.kind), entry.ino, entry.name);
            }
        }
        Command::Cat { path } => {
            let file = handles.register(SESSION, vfs.open(&path, OpenMode::READ)?);
            let mut stdout = std::io::stdout().lock();
            let mut offset = 0u64;
            loop {
                let chunk = vfs.read(SESSION, file.fid(), READ_CHUNK, offset)?;
                if chunk.is_empty() {
                    break;
                }
                stdout.write_all(&chunk)?;
                offset += chunk.len() as u64;
            }
        }
        Command::Write {
            path,
            data,
            offset,
            sync,
        } => {
            let bytes = match data {
                Some(d) => d.into_bytes(),
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            match vfs.create(&path, 0o644) {
                Ok(()) | Err(smbvfs::VfsError::Exists(_)) => {}
                Err(e) => return Err(e.into()),
            }
            let file = handles.register(SESSION, vfs.open(&path, OpenMode::READ_WRITE)?);
            let written = vfs.write(SESSION, file.fid(), &bytes, offset, sync)?;
            println!("Wrote {written} bytes");
        }
        Command::Mv { from, to } => vfs.rename(&from, &to)?,
        Command::Rm { path } => vfs.remove_file(&path)?,
        Command::Rmdir { path } => vfs.rmdir(&path)?,
        Command::Mkdir { path, mode } => vfs.mkdir(&path, mode)?,
        Command::Truncate { path, size } => vfs.truncate(FileRef::Path(&path), size)?,
        Command::Chmod { mode, path } => {
            let changes = AttrChangeSet {
                mode: Some(mode),
                ..Default::default()
            };
            vfs.setattr(FileRef::Path(&path), &changes)?;
        }
        Command::Ln {
            target,
            link,
            symbolic,
        } => {
            if symbolic {
                vfs.symlink(&target, &link)?;
            } else {
                vfs.link(&target, &link)?;
            }
        }
        Command::Xattr { op } => match op {
            XattrOp::List { path } => {
                for name in vfs.listxattr(FileRef::Path(&path))? {
                    println!("{name}");
                }
            }
            XattrOp::Get { path, name } => {
                let capacity = vfs.options().xattr_list_max;
                let value = vfs.getxattr(FileRef::Path(&path), &name, capacity)?;
                println!("{}", String::from_utf8_lossy(&value));
            }
            XattrOp::Set {
                path,
                name,
                value,
                create,
                replace,
            } => {
                let mut flags = XattrFlags::empty();
                flags.set(XattrFlags::CREATE, create);
                flags.set(XattrFlags::REPLACE, replace);
                vfs.setxattr(FileRef::Path(&path), &name, value.as_bytes(), flags)?;
            }
            XattrOp::Rm { path, name } => vfs.removexattr(FileRef::Path(&path), &name)?,
        },
    }

    for handle in handles.remove_session(SESSION) {
        vfs.close(handle);
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        let code = e
            .downcast_ref::<smbvfs::VfsError>()
            .map(|v| v.errno())
            .unwrap_or(1);
        eprintln!("Error: {e:#}");
        std::process::exit(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("755"), Ok(0o755));
        assert_eq!(parse_mode("4750"), Ok(0o4750));
        assert!(parse_mode("9").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["smbvfs-shell", "--root", "/tmp", "mv", "a", "b"]).unwrap();
        assert!(matches!(cli.command, Command::Mv { .. }));
        assert!(Cli::try_parse_from(["smbvfs-shell", "--root", "/tmp", "--share", "x", "ls"]).is_err());
    }

    #[test]
    fn test_write_and_cat_through_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_str().unwrap();
        let cli = Cli::try_parse_from([
            "smbvfs-shell", "--root", root, "write", "\\a.txt", "--data", "hello",
        ])
        .unwrap();
        run(cli).unwrap();
        assert_eq!(std::fs::read(tmp.path().join("a.txt")).unwrap(), b"hello");

        let cli = Cli::try_parse_from(["smbvfs-shell", "--root", root, "mv", "a.txt", "b.txt"]).unwrap();
        run(cli).unwrap();
        assert!(tmp.path().join("b.txt").exists());
    }
}
