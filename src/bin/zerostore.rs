use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use ansi_term::Colour;
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use zerostore::store::{
    copy_tree_into, extractor_for_mime, manifest_from_dir, mime_for_url, CancelToken,
    ExtractOptions, Handler, ManifestDigest, ManifestFormat, Store,
};

/// A CLI for managing a content-addressed implementation store
#[derive(Debug, Parser)]
#[clap(name = "zerostore", version)]
pub struct ZerostoreArgs {
    /// Absolute or relative path to the store's root directory
    ///
    /// By default, this is `implementations` in the current directory.
    #[clap(short, long, value_name = "STORE_PATH")]
    pub store_path: Option<PathBuf>,

    /// Suppress error messages and other command specific logging
    #[clap(short, long)]
    pub quiet: bool,

    /// Increase log level
    #[clap(short = 'V', long)]
    pub verbose: bool,

    /// Disable all output styling
    #[clap(short = 'S', long)]
    pub no_styles: bool,

    /// Answer yes to any question instead of prompting
    #[clap(short, long)]
    pub yes: bool,

    /// Subcommand to execute
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add an implementation from a local archive or directory
    Add(AddCmd),
    /// Print the path of a stored implementation
    Find(DigestArg),
    /// List all stored implementation identifiers
    List,
    /// Re-derive an implementation's manifest and check it
    Verify(DigestArg),
    /// Verify every implementation in the store
    Audit,
    /// Delete an implementation
    Remove(DigestArg),
    /// Delete every implementation and temp directory
    Purge,
    /// Hardlink identical files across implementations
    Optimise,
    /// Compute the identifier of a directory without adding it
    Digest(DigestCmd),
    /// List orphaned temp directories
    ListTemp,
    /// Delete orphaned temp directories
    Clean,
}

#[derive(Args, Debug)]
pub struct AddCmd {
    /// Expected implementation identifier, e.g. sha256new_...
    #[clap(value_name = "DIGEST")]
    pub digest: String,

    /// Archive file or directory to add
    #[clap(value_name = "SOURCE")]
    pub source: PathBuf,
}

#[derive(Args, Debug)]
pub struct DigestArg {
    /// Implementation identifier, e.g. sha256new_...
    #[clap(value_name = "DIGEST")]
    pub digest: String,
}

#[derive(Args, Debug)]
pub struct DigestCmd {
    /// Directory to compute the identifier of
    #[clap(value_name = "DIRECTORY")]
    pub directory: PathBuf,

    /// Manifest format to use
    #[clap(short, long, value_name = "FORMAT", default_value = "sha256new")]
    pub format: String,
}

/// Answers questions on the terminal and reports lock waits.
struct ConsoleHandler {
    assume_yes: bool,
}

impl Handler for ConsoleHandler {
    fn waiting_for_lock(&self, name: &str) {
        eprintln!("Waiting for another process holding {name}...");
    }

    fn confirm(&self, message: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        eprint!("{message} [y/N] ");
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes")
    }
}

fn main() -> ExitCode {
    let mut args = ZerostoreArgs::parse();

    let log_level = if args.quiet {
        LevelFilter::Off
    } else if args.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::builder()
        .filter_level(log_level)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    // If the output is being piped then we should disable styling
    if atty::isnt(atty::Stream::Stdout) {
        args.no_styles = true;
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if !args.quiet {
                eprintln!("{}", style_error(&e.to_string(), args.no_styles));
            }
            ExitCode::FAILURE
        }
    }
}

fn run(args: &ZerostoreArgs) -> zerostore::store::Result<()> {
    let root = args
        .store_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("implementations"));
    let store = Store::new(root)?;
    let cancel = CancelToken::new();
    let handler = ConsoleHandler {
        assume_yes: args.yes,
    };

    match &args.command {
        Command::Add(cmd) => add(&store, cmd, &cancel),
        Command::Find(cmd) => {
            let digest = ManifestDigest::from_id(&cmd.digest)?;
            match store.get_path(&digest) {
                Some(path) => {
                    println!("{}", path.display());
                    Ok(())
                }
                None => Err(zerostore::store::Error::NotFound {
                    id: cmd.digest.clone(),
                }),
            }
        }
        Command::List => {
            for digest in store.list_all()? {
                if let Some(id) = digest.best_id() {
                    println!("{id}");
                }
            }
            Ok(())
        }
        Command::Verify(cmd) => {
            let digest = ManifestDigest::from_id(&cmd.digest)?;
            let result = store.verify(&digest, &handler);
            report_verdict(&cmd.digest, result.is_ok(), args.no_styles);
            result
        }
        Command::Audit => {
            let mut failures = 0;
            for digest in store.list_all()? {
                let id = digest.best_id().unwrap_or_default();
                let ok = store.verify(&digest, &handler).is_ok();
                report_verdict(&id, ok, args.no_styles);
                if !ok {
                    failures += 1;
                }
            }
            if failures == 0 {
                Ok(())
            } else {
                Err(zerostore::store::Error::DigestMismatch {
                    expected: format!("{failures} implementations"),
                    actual: "failed verification".into(),
                })
            }
        }
        Command::Remove(cmd) => {
            let digest = ManifestDigest::from_id(&cmd.digest)?;
            if store.remove(&digest)? {
                Ok(())
            } else {
                Err(zerostore::store::Error::NotFound {
                    id: cmd.digest.clone(),
                })
            }
        }
        Command::Purge => {
            let _lock = store.manager_lock(&handler, &cancel)?;
            store.purge()
        }
        Command::Optimise => {
            let _lock = store.manager_lock(&handler, &cancel)?;
            let saved = store.optimise()?;
            println!("Reclaimed {saved} bytes");
            Ok(())
        }
        Command::Digest(cmd) => {
            let format = ManifestFormat::from_str(&cmd.format).map_err(|_| {
                zerostore::store::Error::UnsupportedKind {
                    kind: format!("manifest format {}", cmd.format),
                }
            })?;
            let manifest = manifest_from_dir(&cmd.directory, format)?;
            println!("{}", manifest.identifier());
            Ok(())
        }
        Command::ListTemp => {
            for path in store.list_temp()? {
                println!("{}", path.display());
            }
            Ok(())
        }
        Command::Clean => {
            let _lock = store.manager_lock(&handler, &cancel)?;
            for path in store.list_temp()? {
                store.remove_temp(&path)?;
            }
            Ok(())
        }
    }
}

/// Admits an implementation from a local directory tree or archive file.
fn add(store: &Store, cmd: &AddCmd, cancel: &CancelToken) -> zerostore::store::Result<()> {
    let digest = ManifestDigest::from_id(&cmd.digest)?;

    if cmd.source.is_dir() {
        let source = cmd.source.clone();
        store.add(&digest, cancel, |builder| {
            copy_tree_into(builder, source, None, None)
        })?;
        return Ok(());
    }

    let name = cmd.source.to_string_lossy();
    let mime = mime_for_url(&name).ok_or_else(|| zerostore::store::Error::UnsupportedKind {
        kind: format!("archive type of {name}"),
    })?;
    let extractor = extractor_for_mime(mime)?;
    store.add(&digest, cancel, |builder| {
        extractor.extract(builder, &cmd.source, &ExtractOptions::new(cancel))
    })?;
    Ok(())
}

fn report_verdict(id: &str, ok: bool, no_styles: bool) {
    let verdict = if ok { "OK" } else { "FAILED" };
    if no_styles {
        println!("{id}: {verdict}");
    } else {
        let colour = if ok { Colour::Green } else { Colour::Red };
        println!("{id}: {}", colour.paint(verdict));
    }
}

fn style_error(message: &str, no_styles: bool) -> String {
    if no_styles {
        format!("Error: {message}")
    } else {
        format!("{}: {message}", Colour::Red.paint("Error"))
    }
}
