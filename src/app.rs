use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tokio::sync::Notify;

use crate::cli::{Opts, ReplayOpts, SubCommand};
use crate::core::{
    config::{ConfigManager, MonitorSettings},
    error::MonitorError,
    model::Position,
    platform::AuditSink,
    proximity,
    replay::{FileMarkerFeed, JsonlAuditSink, LogAlertSink, ReplayPositionProvider, StaticPermissionGate},
    sampler::PositionSampler,
    session::{Collaborators, MonitoringSession},
};

/// Extra wait after the track's last reading before the replay stops.
const REPLAY_GRACE: Duration = Duration::from_secs(1);

pub fn run() -> Result<(), MonitorError> {
    let opts = Opts::parse();
    init_logging(&opts);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(dispatch(opts.subcmd))
}

fn init_logging(opts: &Opts) {
    let level = if opts.quiet {
        "error"
    } else {
        match opts.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

async fn dispatch(subcmd: SubCommand) -> Result<(), MonitorError> {
    match subcmd {
        SubCommand::Replay(replay) => run_replay(replay).await,
        SubCommand::Locate { track, settings_dir } => {
            let settings = load_settings(settings_dir.as_deref());
            let provider = ReplayPositionProvider::from_file(&track)?;
            let position = PositionSampler::new(Arc::new(provider), settings).sample().await?;
            println!("{}", serde_json::to_string(&position)?);
            Ok(())
        }
        SubCommand::Distance { lat1, lon1, lat2, lon2 } => {
            let from = Position::new(lat1, lon1, Utc::now())?;
            let to = Position::new(lat2, lon2, Utc::now())?;
            println!("{:.3} km", proximity::haversine_km(&from, to.latitude(), to.longitude()));
            Ok(())
        }
    }
}

fn load_settings(dir: Option<&Path>) -> MonitorSettings {
    match dir {
        Some(dir) => {
            let manager = ConfigManager::new(dir.to_path_buf());
            log::info!("Loading settings from {:?}", manager.path());
            manager.load()
        }
        None => MonitorSettings::default(),
    }
}

async fn run_replay(opts: ReplayOpts) -> Result<(), MonitorError> {
    let settings = load_settings(opts.settings_dir.as_deref());
    let provider = ReplayPositionProvider::from_file(&opts.track)?.with_speed(opts.speed);
    if provider.is_empty() {
        log::warn!("No readings in {:?}, nothing to replay", opts.track);
        return Ok(());
    }
    let span = provider.span();
    log::info!("Replaying {} readings over {:?}", provider.len(), span);

    let permissions = if opts.deny_location {
        StaticPermissionGate::denying_location()
    } else {
        StaticPermissionGate::granting_all()
    };
    let audit_sink = opts
        .audit
        .map(|path| Arc::new(JsonlAuditSink::new(path)) as Arc<dyn AuditSink>);

    let session = MonitoringSession::new(
        settings,
        Collaborators {
            permissions: Arc::new(permissions),
            provider: Arc::new(provider),
            feed: Arc::new(FileMarkerFeed::new(opts.markers)),
            alert_sink: Arc::new(LogAlertSink),
            audit_sink,
        },
    );

    let failed = Arc::new(Notify::new());
    let notify = failed.clone();
    session.on_error(move |_| notify.notify_one());
    session.on_danger(|zone| {
        log::debug!("In danger zone {} ({:.0}m)", zone.marker.id, zone.distance_m());
    });

    let handle = session.start().await?;
    if !handle.is_active() {
        log::warn!("Monitoring did not start");
        return Ok(());
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("Interrupted"),
        _ = failed.notified() => log::warn!("Monitoring ended early"),
        _ = tokio::time::sleep(span.saturating_add(REPLAY_GRACE)) => log::info!("Replay complete"),
    }

    handle.stop();
    Ok(())
}
