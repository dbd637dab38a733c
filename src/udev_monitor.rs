/* Hot-plug monitor.
 *
 * Runs on a blocking thread: enumerates devices already present, then
 * polls a udev monitor socket and forwards matching add/remove events to
 * the DBus server as `DeviceAction`s.
 *
 * Two kinds of node are interesting:
 *   - hidraw nodes whose HID parent is an IntelliKeys running its firmware
 *     (PID 0x0101), on USB interface 0;
 *   - bare usb_device nodes of an IntelliKeys that still needs its firmware
 *     (PID 0x0100). */

use std::ffi::OsStr;
use std::os::fd::AsFd;
use std::path::PathBuf;

use anyhow::{Context, Result};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{IK_PID_FWLOAD, IK_PID_RUNNING, IK_VID};

/* How often the blocking loop wakes up to notice a closed channel. */
const POLL_TIMEOUT_MS: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAction {
    /* A running IntelliKeys appeared as a hidraw node. */
    Add {
        sysname: String,
        devnode: PathBuf,
        name: String,
        bustype: u16,
        vid: u16,
        pid: u16,
    },
    /* A hidraw node went away. */
    Remove { sysname: String },
    /* An IntelliKeys enumerated without firmware; `usb_node` is its
     * `/dev/bus/usb/BBB/DDD` node. */
    NeedsFirmware { sysname: String, usb_node: PathBuf },
}

/* Parse a `HID_ID` property, `"0003:0000095E:00000101"`, into
 * (bustype, vid, pid). */
pub fn parse_hid_id(hid_id: &str) -> Option<(u16, u16, u16)> {
    let mut parts = hid_id.trim().split(':');
    let bustype = u32::from_str_radix(parts.next()?, 16).ok()?;
    let vid = u32::from_str_radix(parts.next()?, 16).ok()?;
    let pid = u32::from_str_radix(parts.next()?, 16).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((
        u16::try_from(bustype).ok()?,
        u16::try_from(vid).ok()?,
        u16::try_from(pid).ok()?,
    ))
}

/* Parse a sysfs `idVendor` / `idProduct` attribute (four hex digits). */
pub fn parse_usb_id(value: &str) -> Option<u16> {
    u16::from_str_radix(value.trim(), 16).ok()
}

pub fn is_running_intellikeys(vid: u16, pid: u16) -> bool {
    vid == IK_VID && pid == IK_PID_RUNNING
}

pub fn needs_firmware(vid: u16, pid: u16) -> bool {
    vid == IK_VID && pid == IK_PID_FWLOAD
}

fn os_str(value: Option<&OsStr>) -> Option<&str> {
    value.and_then(OsStr::to_str)
}

/* Turn a udev device into an action, if it is one of ours. */
fn classify(device: &udev::Device, added: bool) -> Option<DeviceAction> {
    let sysname = device.sysname().to_string_lossy().into_owned();
    let subsystem = os_str(device.subsystem())?;

    match subsystem {
        "hidraw" if !added => Some(DeviceAction::Remove { sysname }),
        "hidraw" => {
            let hid = device.parent_with_subsystem("hid").ok()??;
            let (bustype, vid, pid) = parse_hid_id(os_str(hid.property_value("HID_ID"))?)?;
            if !is_running_intellikeys(vid, pid) {
                return None;
            }

            /* Only interface 0 carries the vendor reports. */
            let interface = device
                .parent_with_subsystem_devtype("usb", "usb_interface")
                .ok()
                .flatten();
            if let Some(interface) = interface {
                let number = os_str(interface.attribute_value("bInterfaceNumber"));
                if number.is_some_and(|n| n.trim() != "00") {
                    debug!("Skipping {} on interface {:?}", sysname, number);
                    return None;
                }
            }

            let name = os_str(hid.property_value("HID_NAME"))
                .unwrap_or("IntelliKeys USB")
                .to_string();
            Some(DeviceAction::Add {
                sysname,
                devnode: device.devnode()?.to_path_buf(),
                name,
                bustype,
                vid,
                pid,
            })
        }
        "usb" if added => {
            if os_str(device.devtype()) != Some("usb_device") {
                return None;
            }
            let vid = parse_usb_id(os_str(device.attribute_value("idVendor"))?)?;
            let pid = parse_usb_id(os_str(device.attribute_value("idProduct"))?)?;
            if !needs_firmware(vid, pid) {
                return None;
            }
            Some(DeviceAction::NeedsFirmware {
                sysname,
                usb_node: device.devnode()?.to_path_buf(),
            })
        }
        _ => None,
    }
}

fn enumerate_existing(tx: &mpsc::Sender<DeviceAction>) -> Result<()> {
    for subsystem in ["usb", "hidraw"] {
        let mut enumerator = udev::Enumerator::new().context("Creating udev enumerator")?;
        enumerator
            .match_subsystem(subsystem)
            .with_context(|| format!("Matching subsystem {subsystem}"))?;

        for device in enumerator.scan_devices().context("Scanning udev devices")? {
            if let Some(action) = classify(&device, true) {
                debug!("Found existing device: {:?}", action);
                tx.blocking_send(action)?;
            }
        }
    }
    Ok(())
}

fn monitor_loop(tx: mpsc::Sender<DeviceAction>) -> Result<()> {
    let socket = udev::MonitorBuilder::new()
        .context("Creating udev monitor")?
        .match_subsystem("hidraw")?
        .match_subsystem_devtype("usb", "usb_device")?
        .listen()
        .context("Listening on udev monitor")?;

    /* Subscribe before enumerating so nothing plugged in between is lost. */
    enumerate_existing(&tx)?;
    info!("udev monitor running");

    loop {
        if tx.is_closed() {
            return Ok(());
        }

        let mut fds = [PollFd::new(socket.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e).context("Polling udev monitor"),
        }

        for event in socket.iter() {
            let added = match event.event_type() {
                udev::EventType::Add => true,
                udev::EventType::Remove => false,
                _ => continue,
            };
            if let Some(action) = classify(&event.device(), added) {
                debug!("udev event: {:?}", action);
                if tx.blocking_send(action).is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/* Start the monitor on a blocking thread. Returns the receiving end of the
 * action channel. */
pub fn spawn_monitor() -> mpsc::Receiver<DeviceAction> {
    let (tx, rx) = mpsc::channel(32);

    tokio::task::spawn_blocking(move || {
        if let Err(e) = monitor_loop(tx) {
            warn!("udev monitor stopped: {e:#}");
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hid_id() {
        assert_eq!(
            parse_hid_id("0003:0000095E:00000101"),
            Some((0x03, 0x095e, 0x0101))
        );
        assert_eq!(parse_hid_id("0003:0000095e:00000100\n"), Some((0x03, 0x095e, 0x0100)));
        assert_eq!(parse_hid_id("0003:0000095E"), None);
        assert_eq!(parse_hid_id("0003:0000095E:00000101:1"), None);
        assert_eq!(parse_hid_id("0003:0001095E:00000101"), None);
        assert_eq!(parse_hid_id("zz:0000095E:00000101"), None);
    }

    #[test]
    fn test_parse_usb_id() {
        assert_eq!(parse_usb_id("095e\n"), Some(0x095e));
        assert_eq!(parse_usb_id("0100"), Some(0x0100));
        assert_eq!(parse_usb_id("xyz"), None);
    }

    #[test]
    fn test_identity_checks() {
        assert!(is_running_intellikeys(0x095e, 0x0101));
        assert!(!is_running_intellikeys(0x095e, 0x0100));
        assert!(!is_running_intellikeys(0x046d, 0x0101));
        assert!(needs_firmware(0x095e, 0x0100));
        assert!(!needs_firmware(0x095e, 0x0101));
    }
}
