use anyhow::{Context, Result};
use asisto_core::{FaceService, OnnxModelLoader, ARCFACE_EMBEDDING_DIM};
use asisto_hw::{Camera, FrameSource};
use asisto_store::Store;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod recognition;

use config::{BusKind, Config};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use recognition::{LoopSettings, OpenSource};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "asistod starting");

    let config = Config::load()?;

    let store = Arc::new(
        Store::open(&config.db_path, config.descriptor_dim)
            .await
            .with_context(|| format!("opening store {}", config.db_path.display()))?,
    );
    if store.descriptor_dim() != ARCFACE_EMBEDDING_DIM {
        tracing::warn!(
            store = store.descriptor_dim(),
            recognizer = ARCFACE_EMBEDDING_DIM,
            "descriptor_dim does not match the recognizer, enrollments will be rejected"
        );
    }

    if config.model_url.is_none() {
        tracing::info!(
            cache = %config.model_cache_dir.display(),
            fallback = %config.model_fallback_dir.display(),
            "no model_url set, face models are read from local directories only"
        );
    }
    let loader = OnnxModelLoader::new(config.model_source())?;
    let service = Arc::new(FaceService::new(Arc::new(loader)));
    service.set_threshold(config.threshold);

    let (device, width, height) = (
        config.camera_device.clone(),
        config.camera_width,
        config.camera_height,
    );
    let open_source: OpenSource = Arc::new(move || {
        Camera::open(&device, width, height).map(|c| Box::new(c) as Box<dyn FrameSource>)
    });

    let handle = recognition::spawn_recognition_loop(
        service,
        store.clone(),
        open_source,
        LoopSettings {
            min_frame_interval: config.min_frame_interval(),
            last_seen_interval: config.last_seen_interval(),
        },
    );

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(handle.clone(), store))?
        .build()
        .await
        .context("registering on D-Bus")?;

    let mut states = handle.watch();
    tokio::spawn(async move {
        let mut last = states.borrow().state;
        while states.changed().await.is_ok() {
            let state = states.borrow().state;
            if state != last {
                tracing::info!(from = %last, to = %state, "recognition state changed");
                last = state;
            }
        }
    });

    let arrivals = handle.subscribe();
    let signal_conn = conn.clone();
    tokio::spawn(async move {
        if let Err(e) = dbus_interface::forward_arrivals(signal_conn, arrivals).await {
            tracing::error!(error = %e, "attendance signal forwarding stopped");
        }
    });

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "asistod ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("asistod shutting down");
    if let Err(e) = handle.stop().await {
        tracing::warn!(error = %e, "recognition loop did not stop cleanly");
    }

    Ok(())
}
