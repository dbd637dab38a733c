pub mod device;
pub mod manager;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{RwLock, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use zbus::connection::Builder;

use crate::actor::{self, ActorContext, ActorHandle, DeviceSignal};
use crate::config::DaemonConfig;
use crate::device::DeviceInfo;
use crate::engine::{DeviceEvent, IntelliKeys};
use crate::firmware;
use crate::overlay::OverlayTable;
use crate::settings::SettingsStore;
use crate::udev_monitor::DeviceAction;

pub const BUS_NAME: &str = "org.freedesktop.intellikeys1";
pub const MANAGER_PATH: &str = "/org/freedesktop/intellikeys1";

/* Device events waiting for the server loop. */
const SIGNAL_DEPTH: usize = 256;

/* Object path for a device; anything outside [A-Za-z0-9_] becomes '_'. */
pub fn device_path(sysname: &str) -> String {
    let element: String = sysname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}/device/{}", MANAGER_PATH, element)
}

/* Shared, read-mostly state every device is brought up with. */
pub struct ServerContext {
    pub config: DaemonConfig,
    pub overlays: Arc<OverlayTable>,
    pub settings: Arc<SettingsStore>,
}

/* Everything the server loop reacts to. */
enum ServerEvent {
    Hotplug(DeviceAction),
    Device(DeviceSignal),
    MonitorClosed,
}

/* Starts the DBus server and registers all interfaces.
 *
 * Runs until the udev monitor goes away. Hotplug events from `device_rx`
 * are merged with the events published by the device actors. */
pub async fn run_server(device_rx: mpsc::Receiver<DeviceAction>, ctx: ServerContext) -> Result<()> {
    let manager = manager::IntelliKeysManager::default();

    let conn = Builder::system()?
        .name(BUS_NAME)?
        .serve_at(MANAGER_PATH, manager)?
        .build()
        .await?;

    info!("DBus server ready on {}", BUS_NAME);

    let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_DEPTH);
    let hotplug = ReceiverStream::new(device_rx)
        .map(ServerEvent::Hotplug)
        .chain(tokio_stream::once(ServerEvent::MonitorClosed));
    let mut events = hotplug.merge(ReceiverStream::new(signal_rx).map(ServerEvent::Device));

    /* Track actor handles so we can shut them down on removal */
    let mut actor_handles: HashMap<String, ActorHandle> = HashMap::new();

    /* Main event loop */
    while let Some(event) = events.next().await {
        match event {
            ServerEvent::Hotplug(DeviceAction::Add {
                sysname,
                devnode,
                name,
                bustype,
                vid,
                pid,
            }) => {
                if actor_handles.contains_key(&sysname) {
                    debug!("Device {} already registered", sysname);
                    continue;
                }

                let shared_info = Arc::new(RwLock::new(DeviceInfo::new(
                    &sysname, &name, bustype, vid, pid,
                )));
                let engine = IntelliKeys::new(
                    ctx.config.engine(),
                    Arc::clone(&ctx.overlays),
                    ctx.settings.get(),
                );
                let actor_ctx = ActorContext {
                    tick: ctx.config.tick,
                    settings: ctx.settings.subscribe(),
                    info: Arc::clone(&shared_info),
                    signals: signal_tx.clone(),
                };

                let handle = match actor::spawn_device_actor(&devnode, engine, actor_ctx).await {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!("Failed to start {}: {e:#}", sysname);
                        continue;
                    }
                };

                let path = device_path(&sysname);
                let device_obj = device::IntelliKeysDevice::new(
                    Arc::clone(&shared_info),
                    Arc::clone(&ctx.settings),
                    handle.clone(),
                );
                if let Err(e) = conn.object_server().at(path.as_str(), device_obj).await {
                    warn!("Failed to register device {}: {}", sysname, e);
                    handle.shutdown().await;
                    continue;
                }

                /* Update the manager's device list */
                let iface_ref = conn
                    .object_server()
                    .interface::<_, manager::IntelliKeysManager>(MANAGER_PATH)
                    .await?;
                iface_ref.get_mut().await.add_device(path.clone()).await;
                iface_ref
                    .get()
                    .await
                    .devices_changed(iface_ref.signal_emitter())
                    .await?;

                actor_handles.insert(sysname.clone(), handle);
                info!("Device {} ({}) registered at {}", name, sysname, path);
            }
            ServerEvent::Hotplug(DeviceAction::Remove { sysname }) => {
                /* Shut down the actor if one is running */
                let Some(handle) = actor_handles.remove(&sysname) else {
                    debug!("Device removed: {} (was not registered)", sysname);
                    continue;
                };
                handle.shutdown().await;

                let path = device_path(&sysname);
                let object_server = conn.object_server();
                if let Err(e) = object_server
                    .remove::<device::IntelliKeysDevice, _>(path.as_str())
                    .await
                {
                    warn!("Failed to unregister device {}: {}", sysname, e);
                }

                let iface_ref = object_server
                    .interface::<_, manager::IntelliKeysManager>(MANAGER_PATH)
                    .await?;
                iface_ref.get_mut().await.remove_device(&path).await;
                iface_ref
                    .get()
                    .await
                    .devices_changed(iface_ref.signal_emitter())
                    .await?;

                info!("Device {} removed", sysname);
            }
            ServerEvent::Hotplug(DeviceAction::NeedsFirmware { sysname, usb_node }) => {
                spawn_firmware_load(
                    sysname,
                    usb_node,
                    ctx.config.loader_hex.clone(),
                    ctx.config.firmware_hex.clone(),
                );
            }
            ServerEvent::Device(signal) => {
                if let Err(e) = emit_device_signal(&conn, &signal).await {
                    warn!("Failed to emit {:?} for {}: {}", signal.event, signal.sysname, e);
                }
            }
            ServerEvent::MonitorClosed => break,
        }
    }

    info!("udev monitor channel closed, shutting down");
    for (_, handle) in actor_handles.drain() {
        handle.shutdown().await;
    }
    Ok(())
}

/* Run the anchor load off the async runtime. On success the device drops
 * off the bus and comes back running its firmware, which arrives as a
 * regular hidraw add. */
fn spawn_firmware_load(sysname: String, usb_node: PathBuf, loader_hex: PathBuf, firmware_hex: PathBuf) {
    info!("Device {} needs firmware, loading", sysname);
    tokio::spawn(async move {
        let result = tokio::task::spawn_blocking(move || {
            firmware::load_device(&usb_node, &loader_hex, &firmware_hex)
        })
        .await;
        match result {
            Ok(Ok(())) => info!("Firmware loaded on {}, waiting for re-enumeration", sysname),
            Ok(Err(e)) => warn!("Firmware load failed on {}: {e:#}", sysname),
            Err(e) => warn!("Firmware load task for {} failed: {}", sysname, e),
        }
    });
}

/* Re-publish one engine event on the device's object. */
async fn emit_device_signal(conn: &zbus::Connection, signal: &DeviceSignal) -> zbus::Result<()> {
    let path = device_path(&signal.sysname);
    let Ok(iface_ref) = conn
        .object_server()
        .interface::<_, device::IntelliKeysDevice>(path.as_str())
        .await
    else {
        /* not registered yet, or already gone */
        return Ok(());
    };
    let emitter = iface_ref.signal_emitter();

    match &signal.event {
        DeviceEvent::MembraneChanged { row, col, pressed } => {
            device::IntelliKeysDevice::membrane_changed(emitter, *row as u32, *col as u32, *pressed)
                .await
        }
        DeviceEvent::SwitchChanged { number, pressed } => {
            device::IntelliKeysDevice::switch_changed(emitter, u32::from(*number), *pressed).await
        }
        DeviceEvent::ToggleChanged(_) => iface_ref.get().await.switched_on_changed(emitter).await,
        DeviceEvent::OverlayChanged(_) => {
            let iface = iface_ref.get().await;
            iface.current_overlay_changed(emitter).await?;
            iface.overlay_name_changed(emitter).await
        }
        DeviceEvent::FirmwareVersion { .. } => {
            iface_ref.get().await.firmware_version_changed(emitter).await
        }
        DeviceEvent::CalibrationValid(_) => {
            let iface = iface_ref.get().await;
            iface.calibration_valid_changed(emitter).await?;
            iface.serial_number_changed(emitter).await?;
            iface.intelli_switch_changed(emitter).await
        }
        DeviceEvent::ControlPanelRefresh => {
            let iface = iface_ref.get().await;
            iface.modifier_states_changed(emitter).await?;
            iface.shift_key_action_changed(emitter).await?;
            iface.indicator_lights_changed(emitter).await
        }
    }
}
