use anyhow::{bail, Context, Result};
use log::LevelFilter;
use plumepad::config::Config;
use plumepad::crash_guard::CrashGuard;
use plumepad::session_manager::{SessionError, SessionStore};
use plumepad::Workbench;
use std::path::PathBuf;
use std::time::Instant;
use textcore::EncodingResolver;

const USAGE: &str = "\
Usage:
  plumepad [FILES...]              open files, report routing and crash state
  plumepad sessions list           list saved sessions
  plumepad sessions show NAME      print the documents of a session
  plumepad sessions remove NAME... delete sessions
  plumepad sessions remove-all     delete every session
  plumepad detect FILE             guess the encoding of a file
  plumepad recover                 report unclean shutdowns and recovery buffers";

#[tokio::main]
async fn main() -> Result<()> {
    let mut logger = env_logger::Builder::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(LevelFilter::Info);
        logger.filter_module("plumepad", LevelFilter::Debug);
    }
    logger.init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        Some("-h") | Some("--help") => {
            println!("{}", USAGE);
            Ok(())
        }
        Some("-V") | Some("--version") => {
            println!("plumepad {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some("sessions") => sessions(&args[1..]).await,
        Some("detect") => detect(&args[1..]).await,
        Some("recover") => recover(),
        _ => open(&args).await,
    };

    if let Err(e) = &result {
        log::error!("{:#}", e);
    }
    result
}

async fn open(args: &[String]) -> Result<()> {
    let paths: Vec<PathBuf> = args.iter().map(PathBuf::from).collect();
    let mut workbench = Workbench::from_environment()
        .await
        .context("Failed to initialize")?;

    let report = workbench.launch(&paths).await;
    if report.crash.prior_crash_detected() {
        println!(
            "Previous session ended unexpectedly ({} recoverable buffer(s)); run `plumepad recover` for details",
            report.crash.recovery_files.len()
        );
    }
    for outcome in &report.opened {
        let path = workbench
            .document(outcome.window(), outcome.document())
            .and_then(|d| d.path())
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        println!("{:?}\t{}", outcome, path);
    }
    for (path, error) in &report.failed {
        eprintln!("{}: {}", path.display(), error);
    }

    workbench.tick(Instant::now());
    while let Some(message) = workbench.status_mut().dismiss() {
        println!("[{:?}] {}", message.message_type, message.content);
    }
    workbench.shutdown(true).await?;
    Ok(())
}

async fn sessions(args: &[String]) -> Result<()> {
    let store = SessionStore::new()?;
    match args.first().map(String::as_str) {
        None | Some("list") => {
            for summary in store.summaries().await {
                println!(
                    "{}\t{:?}\t{} document(s)\t{}",
                    summary.name,
                    summary.scope,
                    summary.documents,
                    summary.modified_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Some("show") => {
            let name = args.get(1).context("sessions show needs a NAME")?;
            let loaded = match store.load(name).await {
                Ok(loaded) => loaded,
                Err(SessionError::NoneRestorable { missing, .. }) => {
                    for path in missing {
                        println!("missing\t{}", path.display());
                    }
                    bail!("No file of session '{}' can be restored", name);
                }
                Err(e) => return Err(e.into()),
            };
            for document in &loaded.entry.documents {
                println!(
                    "{}\t{}\t{}\t{}",
                    document.window,
                    document.encoding,
                    document.cursor_position,
                    document.path.display()
                );
            }
            if let Some(SessionError::PartialRestore { missing }) = loaded.warning {
                for path in missing {
                    println!("missing\t{}", path.display());
                }
            }
        }
        Some("remove") => {
            if args.len() < 2 {
                bail!("sessions remove needs at least one NAME");
            }
            let removed = store.remove(args[1..].iter().map(String::as_str)).await?;
            println!("Removed {} session(s)", removed);
        }
        Some("remove-all") => {
            let removed = store.remove_all().await?;
            println!("Removed {} session(s)", removed);
        }
        Some(other) => bail!("Unknown sessions command '{}'\n{}", other, USAGE),
    }
    Ok(())
}

async fn detect(args: &[String]) -> Result<()> {
    let path = args.first().context("detect needs a FILE")?;
    let config = Config::load().await?;
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path))?;
    let detection = EncodingResolver::new(config.text.default_encoding).detect(&bytes, None);
    println!(
        "{}\t{}",
        detection.encoding,
        if detection.confident { "confident" } else { "guess" }
    );
    Ok(())
}

fn recover() -> Result<()> {
    let guard = CrashGuard::new(&Config::data_dir()?);
    let report = guard.inspect();
    if !report.prior_crash_detected() && !report.has_recovery() {
        println!("No unclean shutdown recorded");
        return Ok(());
    }
    for instance in &report.crashed {
        match instance.started_at {
            Some(started) => println!("pid {} started {} did not exit cleanly", instance.pid, started),
            None => println!("pid {} did not exit cleanly", instance.pid),
        }
    }
    for file in &report.recovery_files {
        println!("recoverable\t{}", file.display());
    }
    Ok(())
}
