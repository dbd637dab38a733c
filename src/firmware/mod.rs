/* Firmware bootstrap for devices that enumerate without their runtime. */

pub mod hex;
pub mod loader;

use std::path::Path;

use anyhow::{Context, Result};

use crate::transport::UsbfsControl;
use hex::HexImage;
use loader::FirmwareLoader;

/* Load both images from disk and run the anchor load over usbfs. Blocking:
 * call from `spawn_blocking`. */
pub fn load_device(usb_node: &Path, loader_hex: &Path, firmware_hex: &Path) -> Result<()> {
    let loader = HexImage::from_file(loader_hex)?;
    let firmware = HexImage::from_file(firmware_hex)?;

    let mut ctrl = UsbfsControl::open(usb_node)?;
    FirmwareLoader::new(&mut ctrl)
        .load(&loader, &firmware)
        .with_context(|| format!("Anchor load on {}", usb_node.display()))
}
