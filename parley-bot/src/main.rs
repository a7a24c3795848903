// Parley echo bot: accepts every friend request and echoes messages back over UDP.

mod config;
mod transport;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use parley_core::{
    Direction, Event, EventKind, FileControl, FriendId, ParleyCore, PublicKey, Router, UserStatus,
};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::transport::UdpRouter;

const STATUS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "parley-bot", version, about = "Parley echo bot")]
struct Cli {
    /// Save file: loaded on start if present, written on shutdown.
    #[arg(long)]
    save: Option<PathBuf>,

    /// Config file (default: ~/.config/parley/config.toml, then /etc/parley/config.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP listen address.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Extra bootstrap node; repeatable.
    #[arg(long, value_name = "ADDR:HEXKEY")]
    bootstrap: Vec<String>,
}

/// Work queued by event handlers and applied after the tick returns.
#[derive(Debug)]
enum BotCommand {
    Accept(PublicKey),
    Echo { friend: FriendId, message: Vec<u8> },
    RejectFile { friend: FriendId, slot: u8 },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_core=debug")),
        )
        .init();

    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(path) = cli.save {
        cfg.save_path = Some(path);
    }
    if let Some(bind) = cli.bind {
        cfg.bind = bind;
    }
    let extra_bootstrap = cli
        .bootstrap
        .iter()
        .map(|s| config::parse_node(s))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, extra_bootstrap))
}

async fn run(cfg: Config, extra_bootstrap: Vec<(SocketAddr, PublicKey)>) -> anyhow::Result<()> {
    let router = UdpRouter::bind(cfg.bind)
        .await
        .with_context(|| format!("binding {}", cfg.bind))?;
    info!(local = %router.local_addr()?, "listening");

    let mut core = open_engine(router, &cfg)?;
    core.set_status_message(cfg.status_message.as_bytes())?;
    core.set_user_status(UserStatus::None)?;

    for node in &cfg.bootstrap {
        let (addr, key) = node.resolve()?;
        core.bootstrap(addr, key)?;
    }
    for (addr, key) in extra_bootstrap {
        core.bootstrap(addr, key)?;
    }
    for node in &cfg.peers {
        let (addr, key) = node.resolve()?;
        core.router_mut().add_node(key, addr);
    }
    info!(address = %core.address()?, "parley address");

    let (tx, mut rx) = mpsc::unbounded_channel();
    register_handlers(&mut core, tx)?;

    let mut tick = tokio::time::interval(Duration::from_millis(cfg.tick_ms));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                info!("shutdown requested");
                break;
            }
            _ = tick.tick() => {
                if let Err(e) = core.tick() {
                    warn!(error = %e, "tick failed");
                }
                while let Ok(cmd) = rx.try_recv() {
                    if let Err(e) = apply(&mut core, cmd) {
                        warn!(error = %e, "command failed");
                    }
                }
            }
            _ = status.tick() => {
                info!(
                    connected = core.is_connected()?,
                    friends = core.friend_count()?,
                    online = core.online_friend_count()?,
                    "status"
                );
            }
        }
    }

    if let Some(path) = &cfg.save_path {
        write_save(path, &core.save()?)?;
        info!(path = %path.display(), "state saved");
    }
    core.kill();
    Ok(())
}

/// Load the save file if one exists; otherwise start with a fresh identity.
/// A save that exists but cannot be read or decoded is fatal, so it is never overwritten.
fn open_engine(router: UdpRouter, cfg: &Config) -> anyhow::Result<ParleyCore<UdpRouter>> {
    let engine = cfg.engine.clone();
    if let Some(path) = cfg.save_path.as_ref().filter(|p| p.exists()) {
        let blob =
            std::fs::read(path).with_context(|| format!("reading save {}", path.display()))?;
        let core = ParleyCore::from_save(router, engine, &blob)
            .with_context(|| format!("loading save {}", path.display()))?;
        info!(path = %path.display(), friends = core.friend_count()?, "state loaded");
        return Ok(core);
    }
    let mut core = ParleyCore::new(router, engine);
    core.set_name(cfg.name.as_bytes())?;
    info!("fresh identity");
    Ok(core)
}

/// Write via a sibling temp file so a crash mid-write leaves the old save intact.
fn write_save(path: &Path, blob: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, blob).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming to {}", path.display()))?;
    Ok(())
}

fn register_handlers(
    core: &mut ParleyCore<UdpRouter>,
    tx: mpsc::UnboundedSender<BotCommand>,
) -> anyhow::Result<()> {
    let t = tx.clone();
    core.on(EventKind::FriendRequest, move |e| {
        if let Event::FriendRequest {
            public_key,
            message,
        } = e
        {
            info!(peer = %public_key, message = %String::from_utf8_lossy(message), "friend request");
            queue(&t, BotCommand::Accept(*public_key))?;
        }
        Ok(())
    })?;

    let t = tx.clone();
    core.on(EventKind::FriendMessage, move |e| {
        if let Event::FriendMessage {
            friend, message, ..
        } = e
        {
            info!(%friend, message = %String::from_utf8_lossy(message), "message");
            queue(
                &t,
                BotCommand::Echo {
                    friend: *friend,
                    message: message.clone(),
                },
            )?;
        }
        Ok(())
    })?;

    let t = tx;
    core.on(EventKind::FileSendRequest, move |e| {
        if let Event::FileSendRequest {
            friend,
            slot,
            file_name,
            size,
        } = e
        {
            info!(%friend, slot, size, file = %String::from_utf8_lossy(file_name), "declining file");
            queue(
                &t,
                BotCommand::RejectFile {
                    friend: *friend,
                    slot: *slot,
                },
            )?;
        }
        Ok(())
    })?;

    core.on(EventKind::FriendAction, |e| {
        if let Event::FriendAction { friend, action, .. } = e {
            info!(%friend, action = %String::from_utf8_lossy(action), "action");
        }
        Ok(())
    })?;
    core.on(EventKind::NameChange, |e| {
        if let Event::NameChange { friend, name } = e {
            info!(%friend, name = %String::from_utf8_lossy(name), "name change");
        }
        Ok(())
    })?;
    core.on(EventKind::StatusMessage, |e| {
        if let Event::StatusMessage { friend, status } = e {
            info!(%friend, status = %String::from_utf8_lossy(status), "status message");
        }
        Ok(())
    })?;
    core.on(EventKind::UserStatus, |e| {
        if let Event::UserStatus { friend, status } = e {
            info!(%friend, ?status, "user status");
        }
        Ok(())
    })?;
    core.on(EventKind::ConnectionStatus, |e| {
        if let Event::ConnectionStatus { friend, online } = e {
            info!(%friend, online, "connection status");
        }
        Ok(())
    })?;
    Ok(())
}

fn queue(tx: &mpsc::UnboundedSender<BotCommand>, cmd: BotCommand) -> anyhow::Result<()> {
    tx.send(cmd)
        .map_err(|_| anyhow::anyhow!("command queue closed"))
}

fn apply(core: &mut ParleyCore<UdpRouter>, cmd: BotCommand) -> anyhow::Result<()> {
    match cmd {
        BotCommand::Accept(public_key) => {
            let friend = core.add_friend_no_request(&public_key)?;
            info!(%friend, peer = %public_key, "friend accepted");
        }
        BotCommand::Echo { friend, message } => {
            core.send_message(friend, &message)?;
            let action = echo_action(&core.friend_name(friend)?, core.online_friend_count()?);
            core.send_action(friend, action.as_bytes())?;
        }
        BotCommand::RejectFile { friend, slot } => {
            core.file_control(friend, Direction::Receiving, slot, FileControl::Kill, &[])?;
        }
    }
    Ok(())
}

fn echo_action(friend_name: &[u8], online: usize) -> String {
    format!(
        "thinks {} is cool. I have {} online friend(s).",
        String::from_utf8_lossy(friend_name),
        online
    )
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags() {
        let cli = Cli::parse_from([
            "parley-bot",
            "--save",
            "bot.save",
            "--bind",
            "127.0.0.1:4000",
            "--bootstrap",
            "1.2.3.4:33445:AB",
            "--bootstrap",
            "5.6.7.8:33445:CD",
        ]);
        assert_eq!(cli.save, Some(PathBuf::from("bot.save")));
        assert_eq!(cli.bind, Some("127.0.0.1:4000".parse().unwrap()));
        assert_eq!(cli.bootstrap.len(), 2);
        assert!(cli.config.is_none());
    }

    #[test]
    fn action_text() {
        assert_eq!(
            echo_action(b"Alice", 3),
            "thinks Alice is cool. I have 3 online friend(s)."
        );
    }

    #[tokio::test]
    async fn fresh_start_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let save = dir.path().join("bot.save");
        let cfg = Config {
            bind: "127.0.0.1:0".parse().unwrap(),
            save_path: Some(save.clone()),
            ..Config::default()
        };

        let core = open_engine(UdpRouter::bind(cfg.bind).await.unwrap(), &cfg).unwrap();
        assert_eq!(core.self_name().unwrap(), b"ParleyBot");
        let key = core.public_key().unwrap();
        write_save(&save, &core.save().unwrap()).unwrap();
        assert!(!dir.path().join("bot.tmp").exists());

        let reloaded = open_engine(UdpRouter::bind(cfg.bind).await.unwrap(), &cfg).unwrap();
        assert_eq!(reloaded.public_key().unwrap(), key);

        std::fs::write(&save, b"garbage").unwrap();
        assert!(open_engine(UdpRouter::bind(cfg.bind).await.unwrap(), &cfg).is_err());
    }
}
