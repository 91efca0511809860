//! Command-line front end: register videos, download them with progress
//! bars, list, delete or locate local copies.

mod progress;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::connectivity::{ConnectivityMonitor, TcpProbe};
use crate::coordinator::{Coordinator, CoordinatorHandle};
use crate::error::{Error, Result};
use crate::model::{ItemId, ItemState, Notice, Snapshot};
use crate::store::LocalStore;
use crate::transfer::{HttpTransferEngine, SessionId};
use crate::url::sanitize_source;

use progress::{ProgressView, print_items, print_notice, print_summary};

/// Parsed command line.
#[derive(Debug, Default, PartialEq, Eq)]
struct CliArgs {
    config: Option<PathBuf>,
    dir: Option<PathBuf>,
    list: bool,
    delete: Vec<ItemId>,
    play: Vec<ItemId>,
    reattach: Option<String>,
    sources: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Action {
    Help,
    Run(CliArgs),
}

fn next_value(flag: &str, args: &mut impl Iterator<Item = String>) -> Result<String> {
    args.next()
        .ok_or_else(|| Error::Config(format!("{flag} requires a value")))
}

fn parse_args<I>(args: I) -> Result<Action>
where
    I: IntoIterator<Item = String>,
{
    let mut cli = CliArgs::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => cli.config = Some(next_value(&arg, &mut args)?.into()),
            "-d" | "--dir" => cli.dir = Some(next_value(&arg, &mut args)?.into()),
            "-l" | "--list" => cli.list = true,
            "--delete" => cli.delete.push(next_value(&arg, &mut args)?.as_str().into()),
            "--play" => cli.play.push(next_value(&arg, &mut args)?.as_str().into()),
            "--reattach" => cli.reattach = Some(next_value(&arg, &mut args)?),
            "-h" | "--help" => return Ok(Action::Help),
            source if !source.starts_with('-') => cli.sources.push(source.to_string()),
            _ => return Err(Error::Config(format!("unknown option: {arg}"))),
        }
    }

    Ok(Action::Run(cli))
}

fn print_usage() {
    eprintln!("Usage: video-dl [OPTIONS] <url|@file>...");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  <url>               Video URL; item ids follow argument order");
    eprintln!("  @<file>             File with one URL per line ('#' starts a comment)");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <PATH> Configuration file (default: {})", AppConfig::default_path().display());
    eprintln!("  -d, --dir <DIR>     Download directory");
    eprintln!("  -l, --list          List videos and their state, then exit");
    eprintln!("      --delete <ID>   Delete the local copy of a video");
    eprintln!("      --play <ID>     Print the local path of a downloaded video");
    eprintln!("      --reattach <ID> Collect results of an earlier background session");
    eprintln!("  -h, --help          Show this help");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  RUST_LOG            Log filter (default: info)");
}

/// Expands `@file` arguments and cleans up every source.
fn expand_sources(args: &[String]) -> Result<Vec<String>> {
    let mut sources = Vec::new();
    for arg in args {
        if let Some(path) = arg.strip_prefix('@') {
            let contents = std::fs::read_to_string(path)?;
            sources.extend(
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(sanitize_source),
            );
        } else {
            sources.push(sanitize_source(arg));
        }
    }
    Ok(sources)
}

fn load_config(cli: &CliArgs) -> Result<AppConfig> {
    let path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_create(&path)?;
    if let Some(dir) = &cli.dir {
        config = config.with_download_dir(dir);
    }
    Ok(config)
}

/// Runs the CLI with the process arguments.
///
/// # Errors
///
/// Returns an error if the arguments or configuration are invalid, or the
/// coordinator cannot be started.
pub async fn run() -> Result<()> {
    let cli = match parse_args(std::env::args().skip(1)) {
        Ok(Action::Run(cli)) => cli,
        Ok(Action::Help) => {
            print_usage();
            return Ok(());
        }
        Err(e) => {
            print_usage();
            return Err(e);
        }
    };

    let sources = expand_sources(&cli.sources)?;
    if sources.is_empty() {
        print_usage();
        return Ok(());
    }
    let config = load_config(&cli)?;
    log::info!(
        "Storing videos in {}",
        config.paths.download_dir.display()
    );

    let probe = TcpProbe::new(
        config.connectivity.probe_targets.clone(),
        config.connectivity.probe_timeout(),
    );
    let monitor = ConnectivityMonitor::spawn(probe, config.connectivity.probe_interval()).await;
    let engine = Arc::new(HttpTransferEngine::new(&config)?);
    let store = LocalStore::new(
        &config.paths.download_dir,
        config.store.file_extension.clone(),
    );
    let handle = Coordinator::spawn(&config, engine, store, monitor.subscribe()).await?;
    let mut notices = handle.notices();

    let mut snapshot = handle.configure(sources).await?;
    if let Some(session) = &cli.reattach {
        reattach(&handle, session).await;
        snapshot = handle.snapshot();
    }
    drain_notices(&mut notices);

    if cli.list {
        print_items(&snapshot);
    } else if !cli.delete.is_empty() || !cli.play.is_empty() {
        manage(&handle, &cli).await;
    } else {
        download(&handle, &snapshot, notices).await?;
    }

    handle.shutdown().await
}

async fn reattach(handle: &CoordinatorHandle, session: &str) {
    let session = SessionId::new(session);
    let name = session.to_string();
    let result = handle
        .reattach(session, move || {
            log::info!("Session {name} reconciled");
        })
        .await;
    if let Err(e) = result {
        log::error!("Could not reattach: {e}");
    }
}

fn drain_notices(notices: &mut broadcast::Receiver<Notice>) {
    while let Ok(notice) = notices.try_recv() {
        print_notice(&notice);
    }
}

/// Handles `--delete` and `--play`.
async fn manage(handle: &CoordinatorHandle, cli: &CliArgs) {
    for id in &cli.delete {
        match handle.delete(id).await {
            Ok(ItemState::InProgress) => println!("Video {id} is downloading, not deleted."),
            Ok(_) => println!("Deleted video {id}."),
            Err(e) => eprintln!("Could not delete video {id}: {e}"),
        }
    }
    for id in &cli.play {
        match handle.playback_path(id).await {
            Ok(path) => println!("{}", path.display()),
            Err(e) => eprintln!("Cannot play video {id}: {e}"),
        }
    }
}

/// Requests every video not yet downloaded and follows progress until all
/// of them settle or the user interrupts.
async fn download(
    handle: &CoordinatorHandle,
    snapshot: &Snapshot,
    mut notices: broadcast::Receiver<Notice>,
) -> Result<()> {
    let wanted: Vec<ItemId> = snapshot
        .items
        .iter()
        .filter(|item| item.state != ItemState::Completed)
        .map(|item| item.id.clone())
        .collect();
    let cached = snapshot.items.len() - wanted.len();
    if cached > 0 {
        println!("{cached} video(s) already downloaded.");
    }
    if wanted.is_empty() {
        return Ok(());
    }

    let started = Instant::now();
    for id in &wanted {
        handle.request(id).await?;
    }

    let view = follow(handle, &mut notices).await;
    view.clear();
    print_summary(&handle.snapshot(), started.elapsed());
    Ok(())
}

async fn follow(
    handle: &CoordinatorHandle,
    notices: &mut broadcast::Receiver<Notice>,
) -> ProgressView {
    let mut view = ProgressView::new();
    let mut updates = handle.snapshots();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                log::info!("Received SIGINT");
                println!("Interrupted.");
                break;
            }
            update = updates.next() => {
                let Some(snapshot) = update else { break };
                view.update(&snapshot);
                if snapshot.is_settled() {
                    break;
                }
            }
            notice = notices.recv() => match notice {
                Ok(notice) => view.notice(&notice),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Skipped {skipped} notice(s)");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    while let Ok(notice) = notices.try_recv() {
        view.notice(&notice);
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn parses_sources_and_flags() {
        let action = parse_args(args(&[
            "https://host/a.mp4",
            "--dir",
            "/tmp/v",
            "--delete",
            "0",
            "--play",
            "1",
            "--reattach",
            "bg",
            "-l",
            "@list.txt",
        ]))
        .unwrap();

        let Action::Run(cli) = action else {
            panic!("expected run");
        };
        assert_eq!(cli.sources, ["https://host/a.mp4", "@list.txt"]);
        assert_eq!(cli.dir, Some(PathBuf::from("/tmp/v")));
        assert_eq!(cli.delete, vec![ItemId::from("0")]);
        assert_eq!(cli.play, vec![ItemId::from("1")]);
        assert_eq!(cli.reattach.as_deref(), Some("bg"));
        assert!(cli.list);
    }

    #[test]
    fn help_wins() {
        assert_eq!(parse_args(args(&["a", "-h"])).unwrap(), Action::Help);
    }

    #[test]
    fn missing_value_is_an_error() {
        assert!(matches!(
            parse_args(args(&["--dir"])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn unknown_option_is_an_error() {
        assert!(matches!(
            parse_args(args(&["--bogus"])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn source_files_are_expanded_and_cleaned() {
        let dir = tempfile::TempDir::new().unwrap();
        let list = dir.path().join("list.txt");
        std::fs::write(
            &list,
            "# favourites\nhttps://host/a.mp4?x=1&amp;y=2\n\n  https://host/b .mp4 \n",
        )
        .unwrap();

        let sources = expand_sources(&[
            format!("@{}", list.display()),
            "https://host/c.mp4\n".to_string(),
        ])
        .unwrap();
        assert_eq!(
            sources,
            [
                "https://host/a.mp4?x=1&y=2",
                "https://host/b.mp4",
                "https://host/c.mp4"
            ]
        );
    }

    #[test]
    fn missing_source_file_is_an_error() {
        assert!(expand_sources(&["@/definitely/not/here.txt".to_string()]).is_err());
    }
}
