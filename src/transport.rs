/* Transport collaborators.
 *
 * The protocol engine never touches file descriptors. It talks to these
 * seams:
 *   - `ReportSink`: synchronous "can I send / send one frame / arm receive",
 *     polled by the dispatcher once per tick.
 *   - `ReportSource` / `ReportWriter`: async whole-report I/O, driven by the
 *     device actor's reader and writer tasks.
 *   - `ControlTransfer`: blocking vendor control requests for the EZ-USB
 *     anchor load. */

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::protocol::{Frame, REPORT_LEN};

/* Outgoing side as seen by the dispatcher. */
pub trait ReportSink {
    /* Whether a frame handed to `try_send` right now would be accepted. */
    fn is_ready(&self) -> bool;

    /* Hand one frame to the transport. Returns `false` if it was refused;
     * the caller keeps the frame and retries later. */
    fn try_send(&mut self, frame: &Frame) -> bool;

    /* Ask the transport to deliver the next inbound report. */
    fn arm_receive(&mut self);
}

/* Vendor control OUT requests on endpoint 0. */
pub trait ControlTransfer {
    fn vendor_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> std::result::Result<(), TransportError>;
}

/* Inbound half of a running device. */
#[async_trait]
pub trait ReportSource: Send {
    async fn read_report(&mut self) -> Result<Frame>;
}

/* Outbound half of a running device. */
#[async_trait]
pub trait ReportWriter: Send {
    async fn write_report(&mut self, frame: &Frame) -> Result<()>;
}

/* ------------------------------------------------------------------ */
/* Channel-backed sink                                                 */
/* ------------------------------------------------------------------ */

/* `ReportSink` feeding the actor's writer task. Free channel capacity is the
 * readiness signal. */
pub struct ChannelSink {
    tx: mpsc::Sender<Frame>,
    armed: u32,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx, armed: 0 }
    }
}

impl ReportSink for ChannelSink {
    fn is_ready(&self) -> bool {
        !self.tx.is_closed() && self.tx.capacity() > 0
    }

    fn try_send(&mut self, frame: &Frame) -> bool {
        self.tx.try_send(*frame).is_ok()
    }

    fn arm_receive(&mut self) {
        /* hidraw delivers every input report to readers unconditionally,
         * so arming only tracks how many responses are outstanding. */
        self.armed = self.armed.wrapping_add(1);
        trace!("Armed for inbound report ({} outstanding)", self.armed);
    }
}

/* ------------------------------------------------------------------ */
/* hidraw                                                              */
/* ------------------------------------------------------------------ */

/* A `/dev/hidraw` node, opened once per direction so the reader task can
 * sit in `read` while the writer task keeps sending. */
pub struct HidrawReader {
    file: tokio::fs::File,
    path: PathBuf,
}

pub struct HidrawWriter {
    file: tokio::fs::File,
    path: PathBuf,
}

pub async fn open_hidraw(path: &Path) -> Result<(HidrawReader, HidrawWriter)> {
    let reader = tokio::fs::OpenOptions::new()
        .read(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open hidraw device {} for reading", path.display()))?;
    let writer = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open hidraw device {} for writing", path.display()))?;

    Ok((
        HidrawReader {
            file: reader,
            path: path.to_path_buf(),
        },
        HidrawWriter {
            file: writer,
            path: path.to_path_buf(),
        },
    ))
}

#[async_trait]
impl ReportSource for HidrawReader {
    async fn read_report(&mut self) -> Result<Frame> {
        loop {
            let mut buf = [0u8; 64];
            let n = self
                .file
                .read(&mut buf)
                .await
                .with_context(|| format!("Read failed on {}", self.path.display()))?;
            if n == 0 {
                anyhow::bail!("{} closed", self.path.display());
            }
            debug!("RX {} bytes: {:02x?}", n, &buf[..n]);
            match Frame::parse(&buf[..n]) {
                Some(frame) => return Ok(frame),
                None => debug!("Ignoring {n}-byte report on {}", self.path.display()),
            }
        }
    }
}

#[async_trait]
impl ReportWriter for HidrawWriter {
    async fn write_report(&mut self, frame: &Frame) -> Result<()> {
        /* The device has no numbered reports, so hidraw wants report id 0 first. */
        let mut buf = [0u8; REPORT_LEN + 1];
        buf[1..].copy_from_slice(frame.as_bytes());
        self.file
            .write_all(&buf)
            .await
            .with_context(|| format!("Write failed on {}", self.path.display()))?;
        debug!("TX {} bytes: {:02x?}", REPORT_LEN, frame.as_bytes());
        Ok(())
    }
}

/* ------------------------------------------------------------------ */
/* usbfs control transfers                                             */
/* ------------------------------------------------------------------ */

/* Layout of `struct usbdevfs_ctrltransfer` from <linux/usbdevice_fs.h>. */
#[repr(C)]
pub struct UsbCtrlTransfer {
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
    timeout: u32,
    data: *mut std::ffi::c_void,
}

/* Layout of `struct usbdevfs_setinterface`. */
#[repr(C)]
pub struct UsbSetInterface {
    interface: u32,
    altsetting: u32,
}

nix::ioctl_readwrite!(usbdevfs_control, b'U', 0, UsbCtrlTransfer);
nix::ioctl_read!(usbdevfs_setinterface, b'U', 4, UsbSetInterface);
nix::ioctl_read!(usbdevfs_claiminterface, b'U', 15, u32);

/* bmRequestType: host-to-device, vendor, device recipient */
const REQUEST_TYPE_VENDOR_OUT: u8 = 0x40;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

/* Blocking control-transfer access through `/dev/bus/usb/BBB/DDD`. */
pub struct UsbfsControl {
    file: File,
    path: PathBuf,
}

impl UsbfsControl {
    /* Open the usbfs node and select interface 0, alternate setting 0. */
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open usb device {}", path.display()))?;
        let fd = file.as_raw_fd();

        let mut interface: u32 = 0;
        // SAFETY: `fd` is an open usbfs node and `interface` outlives the call.
        unsafe { usbdevfs_claiminterface(fd, &mut interface) }
            .with_context(|| format!("Claiming interface 0 on {}", path.display()))?;

        let mut setting = UsbSetInterface {
            interface: 0,
            altsetting: 0,
        };
        // SAFETY: as above; the struct matches the kernel layout.
        unsafe { usbdevfs_setinterface(fd, &mut setting) }
            .with_context(|| format!("Selecting alternate setting 0 on {}", path.display()))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl ControlTransfer for UsbfsControl {
    fn vendor_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> std::result::Result<(), TransportError> {
        let mut buf = data.to_vec();
        let length = u16::try_from(buf.len()).map_err(|_| TransportError::ShortTransfer {
            sent: 0,
            expected: buf.len(),
        })?;
        let mut xfer = UsbCtrlTransfer {
            request_type: REQUEST_TYPE_VENDOR_OUT,
            request,
            value,
            index,
            length,
            timeout: CONTROL_TIMEOUT.as_millis() as u32,
            data: buf.as_mut_ptr().cast(),
        };

        // SAFETY: `xfer.data` points into `buf`, which lives until the ioctl returns.
        let sent = unsafe { usbdevfs_control(self.file.as_raw_fd(), &mut xfer) }.map_err(|errno| {
            TransportError::ControlTransfer {
                request,
                value,
                source: std::io::Error::from(errno),
            }
        })?;

        let sent = sent as usize;
        if sent != buf.len() {
            return Err(TransportError::ShortTransfer {
                sent,
                expected: buf.len(),
            });
        }
        trace!(
            "CTRL 0x{request:02x} value=0x{value:04x} {} bytes on {}",
            buf.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    /* In-memory collaborators shared by the engine tests. */

    use super::*;

    /* Records every accepted frame; readiness and acceptance are scriptable. */
    #[derive(Default)]
    pub struct RecordingSink {
        pub sent: Vec<Frame>,
        pub ready: bool,
        pub refuse_next: usize,
        pub armed: usize,
    }

    impl RecordingSink {
        pub fn ready() -> Self {
            Self {
                ready: true,
                ..Default::default()
            }
        }
    }

    impl ReportSink for RecordingSink {
        fn is_ready(&self) -> bool {
            self.ready
        }

        fn try_send(&mut self, frame: &Frame) -> bool {
            if self.refuse_next > 0 {
                self.refuse_next -= 1;
                return false;
            }
            self.sent.push(*frame);
            true
        }

        fn arm_receive(&mut self) {
            self.armed += 1;
        }
    }

    /* Inbound reports fed from a channel; a dropped sender reads as unplug. */
    pub struct ChannelSource(pub mpsc::Receiver<Frame>);

    #[async_trait]
    impl ReportSource for ChannelSource {
        async fn read_report(&mut self) -> Result<Frame> {
            self.0.recv().await.context("device unplugged")
        }
    }

    /* Outbound reports captured into a channel. */
    pub struct ChannelWriter(pub mpsc::UnboundedSender<Frame>);

    #[async_trait]
    impl ReportWriter for ChannelWriter {
        async fn write_report(&mut self, frame: &Frame) -> Result<()> {
            self.0.send(*frame).context("writer closed")?;
            Ok(())
        }
    }

    /* One recorded control request. */
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ControlCall {
        pub request: u8,
        pub value: u16,
        pub data: Vec<u8>,
    }

    #[derive(Default)]
    pub struct RecordingControl {
        pub calls: Vec<ControlCall>,
        /* Fail the request with this (0-based) sequence number. */
        pub fail_at: Option<usize>,
    }

    impl ControlTransfer for RecordingControl {
        fn vendor_out(
            &mut self,
            request: u8,
            value: u16,
            _index: u16,
            data: &[u8],
        ) -> std::result::Result<(), TransportError> {
            if self.fail_at == Some(self.calls.len()) {
                return Err(TransportError::ControlTransfer {
                    request,
                    value,
                    source: std::io::Error::from(std::io::ErrorKind::BrokenPipe),
                });
            }
            self.calls.push(ControlCall {
                request,
                value,
                data: data.to_vec(),
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol;

    #[test]
    fn channel_sink_readiness_follows_capacity() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sink = ChannelSink::new(tx);
        assert!(sink.is_ready());
        assert!(sink.try_send(&protocol::set_led(1, true)));
        assert!(!sink.is_ready());
        assert!(!sink.try_send(&protocol::set_led(2, true)));

        assert_eq!(rx.try_recv().unwrap(), protocol::set_led(1, true));
        assert!(sink.is_ready());
    }

    #[test]
    fn closed_channel_is_not_ready() {
        let (tx, rx) = mpsc::channel(4);
        let sink = ChannelSink::new(tx);
        drop(rx);
        assert!(!sink.is_ready());
    }
}
