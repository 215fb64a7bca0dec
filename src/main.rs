use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command, value_parser};
use log::{error, info, warn};
use std::io::BufRead;
use std::sync::mpsc::{self, Sender};
use std::{panic, process, thread};
use tracing_subscriber::EnvFilter;

use syncplay::config::{FrameDrop, PlayerConfig, SyncMode, app_name, version};
use syncplay::demo::{DemoSource, LogPresenter, NullAudioSink};
use syncplay::pipeline::{AudioSink, SeekTarget, VideoPresenter};
use syncplay::player::{Player, PlayerCommand};

/// Bytes skipped by one `>` or `<` keypress.
const BYTE_SEEK_STEP: i64 = 1_000_000;

fn cli() -> Command {
    Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON player configuration; flags override its values."),
        )
        .arg(
            Arg::new("sync")
                .long("sync")
                .value_name("TYPE")
                .help("Master clock: audio, video or ext.")
                .value_parser(["audio", "video", "ext", "external"]),
        )
        .arg(
            Arg::new("framedrop")
                .long("framedrop")
                .help("Drop late video frames even when video is the master clock.")
                .action(ArgAction::SetTrue)
                .conflicts_with("no-framedrop"),
        )
        .arg(
            Arg::new("no-framedrop")
                .long("no-framedrop")
                .help("Never drop late video frames.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("loop")
                .long("loop")
                .value_name("COUNT")
                .help("Play the input COUNT times, 0 loops forever.")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("autoexit")
                .long("autoexit")
                .help("Exit at the end of the input.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("paused")
                .long("paused")
                .help("Start paused on the first frame.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("seek")
                .short('s')
                .long("seek")
                .value_name("SECONDS")
                .help("Start position.")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("duration")
                .short('t')
                .long("duration")
                .value_name("SECONDS")
                .help("Length of the synthetic input.")
                .value_parser(value_parser!(f64))
                .default_value("10"),
        )
        .arg(
            Arg::new("fps")
                .long("fps")
                .value_name("RATE")
                .help("Frame rate of the synthetic video.")
                .value_parser(value_parser!(f64))
                .default_value("25"),
        )
        .arg(
            Arg::new("no-video")
                .long("vn")
                .help("Disable video.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-audio")
                .long("an")
                .help("Disable audio.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-subtitles")
                .long("sn")
                .help("Disable subtitles.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("realtime")
                .long("realtime")
                .help("Treat the input as a live source.")
                .action(ArgAction::SetTrue),
        )
}

fn build_config(matches: &clap::ArgMatches) -> Result<PlayerConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => PlayerConfig::from_json_file(path).with_context(|| format!("loading {path}"))?,
        None => PlayerConfig::default(),
    };
    if let Some(sync) = matches.get_one::<String>("sync") {
        config.sync_mode = sync.parse::<SyncMode>()?;
    }
    if matches.get_flag("framedrop") {
        config.frame_drop = FrameDrop::Always;
    } else if matches.get_flag("no-framedrop") {
        config.frame_drop = FrameDrop::Never;
    }
    if let Some(count) = matches.get_one::<u32>("loop") {
        config.loop_count = *count;
    }
    config.autoexit |= matches.get_flag("autoexit");
    config.start_paused |= matches.get_flag("paused");
    config.realtime |= matches.get_flag("realtime");
    config.validate()?;
    Ok(config)
}

/// Map stdin lines to player commands until the player goes away.
fn spawn_keyboard(commands: Sender<PlayerCommand>) -> Result<()> {
    thread::Builder::new().name("keyboard".into()).spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            let command = match line.trim() {
                "p" | "" => PlayerCommand::TogglePause,
                "s" => PlayerCommand::StepFrame,
                "q" => PlayerCommand::Quit,
                "+" => PlayerCommand::SeekRelative(10.0),
                "-" => PlayerCommand::SeekRelative(-10.0),
                ">" => PlayerCommand::SeekRelativeBytes(BYTE_SEEK_STEP),
                "<" => PlayerCommand::SeekRelativeBytes(-BYTE_SEEK_STEP),
                other => {
                    warn!("unknown command {other:?} (p, s, q, +, -, >, <)");
                    continue;
                }
            };
            if commands.send(command).is_err() {
                break;
            }
        }
    })?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = cli().get_matches();
    let config = build_config(&matches)?;

    let source = DemoSource {
        duration: *matches.get_one::<f64>("duration").unwrap_or(&10.0),
        frame_rate: *matches.get_one::<f64>("fps").unwrap_or(&25.0),
        subtitle_interval: (!matches.get_flag("no-subtitles")).then_some(2.0),
        realtime: config.realtime,
        ..DemoSource::default()
    };
    let presenter: Option<Box<dyn VideoPresenter>> =
        (!matches.get_flag("no-video")).then(|| Box::new(LogPresenter::default()) as Box<dyn VideoPresenter>);
    let audio_sink: Option<Box<dyn AudioSink>> = (!matches.get_flag("no-audio"))
        .then(|| Box::new(NullAudioSink::new(source.audio_spec())) as Box<dyn AudioSink>);
    let session = source.session(presenter, audio_sink)?;

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    let (tx, rx) = mpsc::channel();
    if let Some(pos) = matches.get_one::<f64>("seek") {
        tx.send(PlayerCommand::Seek(SeekTarget::Time(*pos)))?;
    }

    // stop playback cleanly on SIGINT, SIGTERM, or SIGHUP
    let interrupt = tx.clone();
    ctrlc::set_handler(move || {
        if interrupt.send(PlayerCommand::Quit).is_err() {
            process::exit(130);
        }
    })
    .context("setting Ctrl-C handler")?;
    spawn_keyboard(tx)?;

    info!("{} {} ({} master)", app_name(), version(), config.sync_mode);
    let mut player = Player::new(config)?;
    match player.run(session, rx) {
        Ok(summary) => {
            info!("playback finished: {summary}");
            Ok(())
        }
        Err(e) => {
            error!("playback failed: {e}");
            Err(e.into())
        }
    }
}
