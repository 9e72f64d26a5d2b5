//! Frost command line front-end.
//!
//! One mutually exclusive action per invocation (`--backup`, `--restore`,
//! `--purge`, `--list`, ...), a handful of `--option value` parameters.
//! Parsing is a plain scan over `std::env::args`: every option consumes the
//! words following it up to the next `--` word.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use frost::progress::{Action, Progress};
use frost::restore::{OverwritePolicy, RestoreOptions};
use frost::{backup, list, purge, restore, safe_index, signals};
use frost_datastore::compression::Compressor;
use frost_datastore::file_formats::{CIPHERED_INDEX_SUFFIX, DEFAULT_INDEX_NAME};
use frost_datastore::index_file::IndexFile;
use frost_datastore::multichunk::MultiChunk;
use frost_key_config::KeyFactory;

// internal "this handler did not match, keep dispatching" sentinel;
// must never escape to the shell
const BAIL_OUT: i32 = 26748;

const DEFAULT_KEYVAULT: &str = "~/.frost/keys";

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let verbosity = args
        .iter()
        .filter(|a| *a == "-v" || *a == "--verbose")
        .count()
        + args.iter().filter(|a| *a == "-vv").count() * 2;
    // the short verbosity flags would otherwise be taken for action params
    let args: Vec<String> = args
        .into_iter()
        .filter(|a| a != "-v" && a != "-vv")
        .collect();
    let level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(level)
        .format_timestamp(None)
        .init();

    if args.is_empty() || get_params(&args, "help").is_some() {
        print_help();
        std::process::exit(0);
    }

    if let Err(err) = signals::install() {
        eprintln!("error: unable to install signal handlers: {}", err);
        std::process::exit(1);
    }

    let code = match dispatch(&args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            1
        }
    };
    debug_assert_ne!(code, BAIL_OUT);
    std::process::exit(if code == BAIL_OUT { 1 } else { code });
}

fn dispatch(args: &[String]) -> Result<i32, Error> {
    for action in [
        "backup",
        "restore",
        "purge",
        "list",
        "filelist",
        "cat",
        "dump",
        "decryptindex",
        "test",
    ] {
        let code = handle_action(args, action)?;
        if code != BAIL_OUT {
            return Ok(code);
        }
    }
    print_help();
    Ok(1)
}

// ---- option scanning ---------------------------------------------------

fn get_params(args: &[String], option: &str) -> Option<Vec<String>> {
    let flag = format!("--{}", option);
    let pos = args.iter().position(|a| *a == flag)?;
    let mut params = Vec::new();
    for arg in &args[pos + 1..] {
        if arg.starts_with("--") {
            break;
        }
        params.push(arg.clone());
    }
    Some(params)
}

fn get_value(args: &[String], option: &str) -> Result<Option<String>, Error> {
    match get_params(args, option) {
        None => Ok(None),
        Some(params) if params.len() == 1 => Ok(Some(params[0].clone())),
        Some(_) => bail!("option --{} expects exactly one value", option),
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn parse_size(value: &str) -> Result<usize, Error> {
    let (number, factor) = match value.as_bytes().last() {
        Some(b'K') => (&value[..value.len() - 1], 1024usize),
        Some(b'M') => (&value[..value.len() - 1], 1024 * 1024),
        Some(b'G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    let number: usize = number
        .parse()
        .map_err(|_| format_err!("expected a numeric value (K, M or G suffix accepted): {}", value))?;
    Ok(number * factor)
}

// ---- shared configuration ----------------------------------------------

struct Settings {
    remote: PathBuf,
    index_path: PathBuf,
    aes_path: PathBuf,
    keyvault: PathBuf,
    key_id: String,
    safe_index: bool,
    compressor: Compressor,
    multichunk_size: usize,
    entropy_threshold: f64,
    cache_size: usize,
    overwrite: OverwritePolicy,
}

impl Settings {
    fn from_args(args: &[String]) -> Result<Self, Error> {
        let remote = get_value(args, "remote")?
            .map(|s| expand_home(&s))
            .ok_or_else(|| format_err!("--remote is missing (that is where the backup is saved)"))?;

        // a directory (or anything not naming a .frost file) gets the
        // default index file name appended
        let index_base = get_value(args, "index")?
            .map(|s| expand_home(&s))
            .unwrap_or_else(|| remote.clone());
        let index_path = if !index_base.is_dir()
            && index_base
                .extension()
                .map_or(false, |ext| ext == "frost")
        {
            index_base
        } else {
            index_base.join(DEFAULT_INDEX_NAME)
        };
        let aes_path = remote.join(format!("{}{}", DEFAULT_INDEX_NAME, CIPHERED_INDEX_SUFFIX));

        let compressor = match get_value(args, "compression")?.as_deref() {
            None | Some("zlib") => Compressor::Zlib,
            Some("zstd") => Compressor::Zstd,
            Some("none") => Compressor::None,
            Some(other) => bail!("unknown compressor '{}' (use zlib or zstd)", other),
        };
        let multichunk_size = match get_value(args, "multichunk")? {
            Some(value) => parse_size(&value)?,
            None => compressor.default_multichunk_size(),
        };
        let entropy_threshold = match get_value(args, "entropy")? {
            Some(value) => value
                .parse::<f64>()
                .map_err(|_| format_err!("bad entropy threshold '{}'", value))?,
            None => 1.0,
        };
        let cache_size = match get_value(args, "cache")? {
            Some(value) => parse_size(&value)?,
            None => frost_datastore::multichunk_cache::DEFAULT_CACHE_SIZE,
        };
        let overwrite = match get_value(args, "overwrite")? {
            Some(value) => OverwritePolicy::parse(&value)?,
            None => OverwritePolicy::No,
        };

        Ok(Settings {
            remote,
            index_path,
            aes_path,
            keyvault: expand_home(
                &get_value(args, "keyvault")?.unwrap_or_else(|| DEFAULT_KEYVAULT.to_string()),
            ),
            key_id: get_value(args, "keyid")?.unwrap_or_default(),
            safe_index: args.iter().any(|a| a == "--safeindex"),
            compressor,
            multichunk_size,
            entropy_threshold,
            cache_size,
            overwrite,
        })
    }
}

fn query_password(args: &[String]) -> Result<String, Error> {
    if let Some(password) = get_value(args, "password")? {
        return Ok(password);
    }
    eprint!("Password: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|err| format_err!("cannot query a password - {}", err))?;
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

// ---- console progress --------------------------------------------------

struct ConsoleProgress {
    warnings: Vec<String>,
    last_line_len: usize,
    quiet: bool,
}

impl ConsoleProgress {
    fn new(quiet: bool) -> Self {
        Self {
            warnings: Vec::new(),
            last_line_len: 0,
            quiet,
        }
    }

    fn finish(&self) {
        if self.last_line_len > 0 {
            eprintln!();
        }
        if !self.warnings.is_empty() {
            eprintln!("\nReceived warnings:");
            for warning in &self.warnings {
                eprintln!("  {}", warning);
            }
        }
    }
}

impl Progress for ConsoleProgress {
    fn progressed(
        &mut self,
        action: Action,
        name: &str,
        done: u64,
        total: u64,
        index: u32,
        count: u32,
    ) -> bool {
        if self.quiet {
            return true;
        }
        let line = if total > 0 && done > 0 {
            format!(
                "{}: {} {:3}% [{}/{}]",
                action.name(),
                name,
                done * 100 / total,
                index,
                count
            )
        } else {
            format!("{}: {} [{}/{}]", action.name(), name, index, count)
        };
        let pad = self.last_line_len.saturating_sub(line.len());
        eprint!("\r{}{}", line, " ".repeat(pad));
        let _ = std::io::stderr().flush();
        self.last_line_len = line.len();
        true
    }

    fn warn(&mut self, action: Action, name: &str, message: &str) -> bool {
        if self.last_line_len > 0 {
            eprintln!();
            self.last_line_len = 0;
        }
        eprintln!("WARNING {}: {}: {}", action.name(), name, message);
        self.warnings.push(format!("{}: {}: {}", action.name(), name, message));
        true
    }
}

// ---- actions -----------------------------------------------------------

fn handle_action(args: &[String], action: &str) -> Result<i32, Error> {
    let params = match get_params(args, action) {
        Some(params) => params,
        None => return Ok(BAIL_OUT),
    };

    match action {
        "list" | "filelist" => {
            let settings = Settings::from_args(args)?;
            let index = IndexFile::open(&settings.index_path, false)?;
            let mut range = list::TimeRange::default();
            if params.len() >= 2 {
                range.start = Some(list::TimeRange::parse_bound(&params[0])?);
                range.end = Some(list::TimeRange::parse_bound(&params[1])?);
            } else if params.len() == 1 {
                range.end = Some(list::TimeRange::parse_bound(&params[0])?);
            }
            list::list_backups(&index, range, action == "filelist", &mut std::io::stdout())?;
            Ok(0)
        }
        "dump" => {
            let settings = Settings::from_args(args)?;
            let index = IndexFile::open(&settings.index_path, false)?;
            list::dump_index(&index, &mut std::io::stdout())?;
            Ok(0)
        }
        "decryptindex" => {
            let settings = Settings::from_args(args)?;
            let password = query_password(args)?;
            let key = frost_key_config::derive_password(&password);
            safe_index::ensure_valid_index(&settings.aes_path, &settings.index_path, &key, true)?;
            Ok(0)
        }
        "backup" => handle_backup(args, &params),
        "restore" => handle_restore(args, &params),
        "purge" => handle_purge(args, &params),
        "cat" => handle_cat(args, &params),
        "test" => handle_test(&params),
        _ => Ok(BAIL_OUT),
    }
}

fn decrypt_index_if_present(settings: &Settings, password: &str) -> Result<(), Error> {
    if settings.aes_path.exists() {
        let key = frost_key_config::derive_password(password);
        safe_index::ensure_valid_index(&settings.aes_path, &settings.index_path, &key, false)?;
    }
    Ok(())
}

fn handle_backup(args: &[String], params: &[String]) -> Result<i32, Error> {
    let source = params
        .first()
        .map(|p| expand_home(p))
        .ok_or_else(|| format_err!("--backup needs the directory to back up"))?;
    if !source.is_dir() {
        bail!("the --backup parameter {:?} is not a directory", source);
    }

    let settings = Settings::from_args(args)?;
    std::fs::create_dir_all(&settings.remote)?;

    // refusing to store the index inside the tree being backed up
    if let (Ok(index_dir), Ok(source_real)) = (
        settings
            .index_path
            .parent()
            .unwrap_or(Path::new("."))
            .canonicalize(),
        source.canonicalize(),
    ) {
        if index_dir.starts_with(&source_real) {
            bail!("the index path cannot live inside the backup source");
        }
    }

    let password = query_password(args)?;
    decrypt_index_if_present(&settings, &password)?;

    let (keys, mut index) = if settings.index_path.exists() {
        let index = IndexFile::open(&settings.index_path, true)?;
        let keys = KeyFactory::load_private_key(
            &settings.keyvault,
            index.ciphered_master_key(),
            &password,
            &settings.key_id,
        )?;
        (keys, index)
    } else {
        let (keys, ciphered) =
            KeyFactory::create_master_key(&settings.keyvault, &password, &settings.key_id)?;
        let index = IndexFile::create_new(
            &settings.index_path,
            &ciphered,
            &source.display().to_string(),
        )?;
        (keys, index)
    };

    let options = backup::BackupOptions {
        compressor: settings.compressor,
        multichunk_size: settings.multichunk_size,
        entropy_threshold: settings.entropy_threshold,
        excludes: frost::ExcludeList::load(
            get_value(args, "exclude")?.map(|p| expand_home(&p)).as_deref(),
            get_value(args, "include")?.map(|p| expand_home(&p)).as_deref(),
        )?,
    };

    let mut progress = ConsoleProgress::new(false);
    let stats = backup::backup_folder(
        &mut index,
        &keys,
        &source,
        &settings.remote,
        &options,
        &mut progress,
    )?;
    progress.finish();

    if stats.committed {
        println!(
            "Finished: {} (source size: {}, backup size: {}, {} files, {} directories)",
            source.display(),
            stats.input_bytes,
            stats.output_bytes,
            stats.file_count,
            stats.dir_count
        );
    } else {
        println!("Nothing changed, no new revision recorded");
    }

    if settings.safe_index && stats.committed {
        let key = frost_key_config::derive_password(&password);
        safe_index::encrypt_index(&settings.index_path, &settings.aes_path, &key)?;
    }

    Ok(if stats.interrupted { 1 } else { 0 })
}

fn handle_restore(args: &[String], params: &[String]) -> Result<i32, Error> {
    let dest = params
        .first()
        .map(|p| expand_home(p))
        .ok_or_else(|| format_err!("--restore needs the directory to restore into"))?;

    let settings = Settings::from_args(args)?;
    let password = query_password(args)?;
    decrypt_index_if_present(&settings, &password)?;

    let index = IndexFile::open(&settings.index_path, false)?;
    let keys = KeyFactory::load_private_key(
        &settings.keyvault,
        index.ciphered_master_key(),
        &password,
        &settings.key_id,
    )?;

    let revision = match params.get(1) {
        Some(value) => value
            .parse::<u32>()
            .map_err(|_| format_err!("bad revision number '{}'", value))?,
        None => index.current_revision(),
    };

    std::fs::create_dir_all(&dest)?;
    let options = RestoreOptions {
        overwrite: settings.overwrite,
        cache_size: settings.cache_size,
    };
    let mut progress = ConsoleProgress::new(false);
    let stats = restore::restore_backup(
        &index,
        &keys,
        &settings.remote,
        &dest,
        revision,
        &options,
        &mut progress,
    )?;
    progress.finish();
    println!(
        "Restored revision {}: {} files, {} directories, {} bytes",
        revision, stats.file_count, stats.dir_count, stats.bytes_written
    );
    Ok(0)
}

fn handle_purge(args: &[String], params: &[String]) -> Result<i32, Error> {
    let up_to = params
        .first()
        .and_then(|value| value.parse::<u32>().ok())
        .ok_or_else(|| {
            format_err!("no revision given; refusing to purge the whole backup set implicitly")
        })?;

    let settings = Settings::from_args(args)?;
    let password = query_password(args)?;
    decrypt_index_if_present(&settings, &password)?;

    let index = IndexFile::open(&settings.index_path, false)?;
    let keys = KeyFactory::load_private_key(
        &settings.keyvault,
        index.ciphered_master_key(),
        &password,
        &settings.key_id,
    )?;

    let threshold = match get_value(args, "strategy")?.as_deref() {
        None | Some("fast") => purge::STRATEGY_FAST,
        Some("slow") => purge::STRATEGY_SLOW,
        Some(value) => {
            let threshold: u32 = value
                .parse()
                .map_err(|_| format_err!("bad strategy '{}' (slow, fast or 0..100)", value))?;
            if threshold > 100 {
                bail!("strategy threshold must be between 0 and 100");
            }
            threshold
        }
    };

    let options = purge::PurgeOptions {
        threshold,
        compressor: settings.compressor,
        multichunk_size: settings.multichunk_size,
        cache_size: settings.cache_size,
    };
    let mut progress = ConsoleProgress::new(false);
    let stats = purge::purge_backup(index, &keys, &settings.remote, up_to, &options, &mut progress)?;
    progress.finish();
    println!(
        "Purged up to revision {}: removed {} chunks, deleted {} multichunks, repacked {}, kept {} revisions",
        up_to,
        stats.removed_chunks,
        stats.deleted_multichunks,
        stats.repacked_multichunks,
        stats.revisions_kept
    );
    Ok(0)
}

fn handle_cat(args: &[String], params: &[String]) -> Result<i32, Error> {
    let file = params
        .first()
        .ok_or_else(|| format_err!("--cat needs the path of the file to extract"))?;

    let settings = Settings::from_args(args)?;
    let password = query_password(args)?;
    decrypt_index_if_present(&settings, &password)?;

    let index = IndexFile::open(&settings.index_path, false)?;
    let keys = KeyFactory::load_private_key(
        &settings.keyvault,
        index.ciphered_master_key(),
        &password,
        &settings.key_id,
    )?;

    let revision = match params.get(1) {
        Some(value) => value
            .parse::<u32>()
            .map_err(|_| format_err!("bad revision number '{}'", value))?,
        None => index.current_revision(),
    };

    // stdout carries the file content; progress stays silent
    let mut progress = frost::LogProgress;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    restore::restore_single_file(
        &index,
        &keys,
        &settings.remote,
        Path::new(file),
        revision,
        settings.cache_size,
        &mut out,
        &mut progress,
    )?;
    out.flush()?;
    Ok(0)
}

fn handle_test(params: &[String]) -> Result<i32, Error> {
    match params.first().map(|s| s.as_str()) {
        Some("entropy") => {
            let path = params
                .get(1)
                .ok_or_else(|| format_err!("--test entropy needs a file"))?;
            let file = std::fs::File::open(path)?;
            let mut stream = frost_datastore::ChunkStream::new(file, backup::DEFAULT_CHUNK_SIZE_AVG);
            let (mut count, mut sum, mut min, mut max) = (0u64, 0.0f64, 1.0f64, 0.0f64);
            while let Some((data, _)) = stream.next_chunk()? {
                let entropy = MultiChunk::chunk_entropy(data);
                min = min.min(entropy);
                max = max.max(entropy);
                sum += entropy;
                count += 1;
            }
            if count > 0 {
                println!(
                    "{} chunks: entropy min {:.4} / avg {:.4} / max {:.4}",
                    count,
                    min,
                    sum / count as f64,
                    max
                );
            } else {
                println!("empty file");
            }
            Ok(0)
        }
        Some("chunker") => {
            let path = params
                .get(1)
                .ok_or_else(|| format_err!("--test chunker needs a file"))?;
            let file = std::fs::File::open(path)?;
            let mut stream = frost_datastore::ChunkStream::new(file, backup::DEFAULT_CHUNK_SIZE_AVG);
            let (mut count, mut total) = (0u64, 0u64);
            while let Some((data, _)) = stream.next_chunk()? {
                count += 1;
                total += data.len() as u64;
            }
            println!(
                "{} chunks, {} bytes, {} bytes/chunk average",
                count,
                total,
                if count > 0 { total / count } else { 0 }
            );
            Ok(0)
        }
        _ => {
            println!("available tests: entropy <file>, chunker <file>");
            Ok(1)
        }
    }
}

fn print_help() {
    println!(
        "\
Frost - encrypted, deduplicating, content-addressed backups

Usage:
  Actions (mutually exclusive):
    --backup dir          Back up the given directory
    --restore dir [rev]   Restore the revision (default: last) into dir
    --purge rev           Drop revisions 1..=rev from the backup set
    --list [range]        List revisions (range: 'YYYYMMDDhhmmss [YYYYMMDDhhmmss]')
    --filelist [range]    Like --list, with every recorded file
    --cat path [rev]      Extract one file to standard output
    --dump                Dump the index structure
    --decryptindex        Recreate the clear index from index.frost.aes
    --test name           Developer self tests ('--test help' to list them)
    --help                This message

  Required for backup, restore, purge and cat:
    --remote url          Directory holding the multichunks (and the index by default)
    --index path          Index file path (defaults to the remote directory)
    --keyvault file       Key vault path
    --keyid id            Key identifier inside the vault

  Optional:
    --password pw         Password (prompted on stdin when absent)
    --safeindex           Also keep an encrypted copy of the index remotely
    --cache size          Decoded multichunk cache (K/M/G suffix, default 64M)
    --overwrite policy    yes, no or update (restore, default no)
    --multichunk size     Multichunk payload limit (default 250K, 25M for zstd)
    --compression name    zlib (default) or zstd
    --strategy mode       Purge strategy: fast, slow or a 0..100 threshold
    --exclude file        Exclusion rule file (one rule per line)
    --include file        Inclusion rules applied after exclusion
    --entropy threshold   Compress only chunks at or below this entropy (default 1.0)
    --verbose             More output (-vv for trace)",
    );
    println!("\n  Default key vault: {}", DEFAULT_KEYVAULT);
}
