// src/main.rs

use anyhow::{bail, Result};
use futures_util::StreamExt;
use install_sim::prelude::*;
use std::path::PathBuf;
use std::time::Duration;

const DEMO_DB: &str = "install_sim_demo.db";

fn catalog() -> Vec<DownloadableItem> {
    vec![
        DownloadableItem {
            id: "1459969523".into(),
            name: "Weather Radar".into(),
            developer_name: "Sky Labs".into(),
            icon_url: "https://example.invalid/icons/weather.png".into(),
        },
        DownloadableItem {
            id: "1477376905".into(),
            name: "Pocket Notes".into(),
            developer_name: "Paper Co".into(),
            icon_url: "https://example.invalid/icons/notes.png".into(),
        },
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // A config file keeps its database; the built-in demo starts from scratch.
    let (config, scratch_db) = match std::env::args().nth(1) {
        Some(path) => (EngineConfig::from_file(&PathBuf::from(path))?, None),
        None => {
            let config = EngineConfig {
                db_path: PathBuf::from(DEMO_DB),
                total_duration: Duration::from_secs(3),
                ..EngineConfig::default()
            };
            let _ = tokio::fs::remove_file(&config.db_path).await;
            let db = config.db_path.clone();
            (config, Some(db))
        }
    };

    println!("--- install engine demo ({}s per install) ---", config.total_duration.as_secs_f32());

    let engine = Engine::init(config).await?;
    engine.on_launch().await;
    engine.observe_network(NetworkPath::online(Transport::Wifi)).await;

    let apps = catalog();
    let watched = apps[0].id.clone();

    let mut list_row = Box::pin(engine.on_progress(&watched, Cadence::Slow).await.into_stream());
    let row_printer = tokio::spawn(async move {
        while let Some(event) = list_row.next().await {
            println!("[ROW] {} {:>5.1}%", event.id, event.progress * 100.0);
        }
    });

    let mut notices = Box::pin(engine.on_notice().into_stream());
    let banner_printer = tokio::spawn(async move {
        while let Some(notice) = notices.next().await {
            let banner = NetworkBanner::from(&notice);
            println!("[BANNER] {}", banner.message);
        }
    });

    println!("\n[ACTION] Installing {} apps...", apps.len());
    for app in &apps {
        engine.start(app.clone()).await;
    }
    tokio::time::sleep(Duration::from_millis(800)).await;

    println!("\n[ACTION] Dropping the connection...");
    engine.observe_network(NetworkPath::offline()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    for app in &apps {
        let button = InstallButton::from(engine.get_state(&app.id).await);
        println!("[STATE] {} -> {:?} ({})", app.name, engine.get_state(&app.id).await, button.label());
    }

    println!("\n[ACTION] Connection back, resuming by hand...");
    engine.observe_network(NetworkPath::online(Transport::Cellular)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    for app in &apps {
        engine.start(app.clone()).await;
    }

    println!("\n[ACTION] App goes to the background for 1s...");
    engine.on_enter_background().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    if let Some(summary) = engine.on_enter_foreground().await {
        println!("[VERIFY] Foreground reconciliation: {:?}", summary);
    }

    let mut waited = Duration::ZERO;
    loop {
        let installed = engine.installed_items().await;
        if installed.len() == apps.len() {
            break;
        }
        if waited > Duration::from_secs(10) {
            bail!("installs did not finish, {} of {} done", installed.len(), apps.len());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        waited += Duration::from_millis(250);
    }

    println!("\n[VERIFY] Installed:");
    for app in engine.installed_items().await {
        let button = InstallButton::from(engine.get_state(&app.id).await);
        println!("  {} by {} [{}]", app.name, app.developer_name, button.label());
    }

    println!("\n[ACTION] Deleting {}...", apps[1].name);
    engine.delete(&apps[1].id).await;
    let button = InstallButton::from(engine.get_state(&apps[1].id).await);
    println!("[STATE] {} -> {}", apps[1].name, button.label());

    engine.on_terminate().await;
    engine.shutdown().await;
    row_printer.abort();
    banner_printer.abort();

    if let Some(db) = scratch_db {
        tokio::fs::remove_file(&db).await?;
    }
    println!("\n--- Demo complete. ---");
    Ok(())
}
