/* Device Actor — runs the protocol engine for a single connected device.
 *
 * Each physical device gets its own actor task (`tokio::spawn`), which owns
 * the `IntelliKeys` engine. A reader task feeds it inbound reports and a
 * writer task drains its outbound frames, so ticks and report handling are
 * serialized on the actor without blocking on the hidraw node.
 *
 * DBus objects talk to the actor through an `mpsc` channel and post device
 * commands straight into the engine's command queue. */

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::device::DeviceInfo;
use crate::engine::{DeviceEvent, IntelliKeys};
use crate::error::CommandError;
use crate::protocol::Frame;
use crate::queue::CommandQueue;
use crate::settings::Settings;
use crate::transport::{self, ChannelSink, ReportSource, ReportWriter};

/* Outbound frames buffered ahead of the writer task. A full channel reads as
 * "transport busy" to the dispatcher. */
const WRITER_DEPTH: usize = 4;

/* Inbound reports buffered ahead of the actor. */
const READER_DEPTH: usize = 64;

/* Commands that DBus interface objects can send to the device actor. */
#[derive(Debug)]
pub enum ActorMessage {
    /* Gracefully shut down the actor (e.g., on device removal). */
    Shutdown,
}

/* An engine event tagged with the device it came from. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSignal {
    pub sysname: String,
    pub event: DeviceEvent,
}

/* Handle used by DBus objects to reach the device actor. */
#[derive(Clone)]
pub struct ActorHandle {
    tx: mpsc::Sender<ActorMessage>,
    queue: Arc<CommandQueue>,
}

impl ActorHandle {
    /* Request the actor to shut down gracefully. */
    pub async fn shutdown(&self) {
        let _ = self.tx.send(ActorMessage::Shutdown).await;
    }

    /* Validate and enqueue a raw command for the device. */
    pub fn post_command(&self, frame: Frame) -> Result<(), CommandError> {
        self.queue.enqueue(frame)
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/* Everything an actor needs besides its engine and I/O. */
pub struct ActorContext {
    pub tick: Duration,
    pub settings: watch::Receiver<Settings>,
    pub info: Arc<RwLock<DeviceInfo>>,
    pub signals: mpsc::Sender<DeviceSignal>,
}

/* The device actor itself. Owns the engine. */
struct DeviceActor {
    engine: IntelliKeys,
    sink: ChannelSink,
    reports: mpsc::Receiver<Frame>,
    ctx: ActorContext,
    rx: mpsc::Receiver<ActorMessage>,
    sysname: String,
}

impl DeviceActor {
    /* Main actor loop: tick, handle reports and settings changes until
     * shutdown or the device goes away. */
    async fn run(mut self) {
        info!("Device actor started for {}", self.sysname);

        let mut interval = tokio::time::interval(self.ctx.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let outcome = self.engine.tick(Instant::now(), &mut self.sink);
                    trace!("{}: {:?}", self.sysname, outcome);
                }
                report = self.reports.recv() => match report {
                    Some(frame) => self.engine.handle_report(&frame, Instant::now()),
                    None => {
                        info!("Device {} stopped reporting", self.sysname);
                        break;
                    }
                },
                Ok(()) = self.ctx.settings.changed() => {
                    let settings = self.ctx.settings.borrow_and_update().clone();
                    debug!("{}: settings changed", self.sysname);
                    self.engine.set_settings(settings);
                }
                msg = self.rx.recv() => match msg {
                    Some(ActorMessage::Shutdown) | None => {
                        info!("Device actor shutting down for {}", self.sysname);
                        break;
                    }
                },
            }

            self.publish().await;
        }

        self.engine.stop();
        debug!("Device actor loop exited");
    }

    /* Mirror engine state into the shared `DeviceInfo` and forward events. */
    async fn publish(&mut self) {
        self.ctx.info.write().await.sync_from(&self.engine);

        for event in self.engine.drain_events() {
            let signal = DeviceSignal {
                sysname: self.sysname.clone(),
                event,
            };
            if let Err(err) = self.ctx.signals.try_send(signal) {
                warn!("{}: dropping device event: {}", self.sysname, err);
            }
        }
    }
}

fn spawn_reader(mut source: Box<dyn ReportSource>, tx: mpsc::Sender<Frame>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match source.read_report().await {
                Ok(frame) => {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Reader finished: {e:#}");
                    break;
                }
            }
        }
    })
}

fn spawn_writer(mut writer: Box<dyn ReportWriter>, mut rx: mpsc::Receiver<Frame>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_report(&frame).await {
                warn!("Writer finished: {e:#}");
                break;
            }
        }
    })
}

/* Spawn a device actor for an opened hidraw node.
 *
 * This function:
 * 1. Opens the `/dev/hidraw` device node, once per direction.
 * 2. Queues the engine's start-up sequence.
 * 3. Spawns the reader, writer and actor tasks and returns a handle for
 *    DBus objects. */
pub async fn spawn_device_actor(
    devnode: &Path,
    engine: IntelliKeys,
    ctx: ActorContext,
) -> Result<ActorHandle> {
    let (reader, writer) = transport::open_hidraw(devnode).await?;
    Ok(spawn_with_io(Box::new(reader), Box::new(writer), engine, ctx))
}

pub fn spawn_with_io(
    source: Box<dyn ReportSource>,
    writer: Box<dyn ReportWriter>,
    mut engine: IntelliKeys,
    ctx: ActorContext,
) -> ActorHandle {
    let (report_tx, reports) = mpsc::channel(READER_DEPTH);
    let (frame_tx, frame_rx) = mpsc::channel(WRITER_DEPTH);
    let reader_task = spawn_reader(source, report_tx);
    let writer_task = spawn_writer(writer, frame_rx);

    engine.start(Instant::now());
    let queue = engine.queue();

    /* Create the message channel and spawn the actor */
    let (tx, rx) = mpsc::channel(16);

    let sysname = ctx.info.try_read().map(|i| i.sysname.clone()).unwrap_or_default();
    let actor = DeviceActor {
        engine,
        sink: ChannelSink::new(frame_tx),
        reports,
        ctx,
        rx,
        sysname,
    };

    tokio::spawn(async move {
        actor.run().await;
        reader_task.abort();
        /* the writer ends once the actor's sink is dropped */
        let _ = writer_task.await;
    });

    ActorHandle { tx, queue }
}
