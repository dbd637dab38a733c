/* EZ-USB anchor load.
 *
 * The bootstrap image carries a helper that implements the external-RAM
 * download request. External RAM is therefore loaded first, while that
 * helper runs; internal RAM is only written with the 8051 held in reset. */

use tracing::{debug, info};

use crate::error::{FirmwareError, LoadPhase};
use crate::firmware::hex::HexImage;
use crate::transport::ControlTransfer;

pub const ANCHOR_LOAD_INTERNAL: u8 = 0xa0;
pub const ANCHOR_LOAD_EXTERNAL: u8 = 0xa3;

/* 8051 control and status register; bit 0 holds the CPU in reset. */
pub const CPUCS_REG: u16 = 0x7f92;

/* Highest address backed by on-chip RAM. */
pub const MAX_INTERNAL_ADDRESS: u16 = 0x1b3f;

pub fn is_internal(address: u16) -> bool {
    address <= MAX_INTERNAL_ADDRESS
}

pub struct FirmwareLoader<'a> {
    ctrl: &'a mut dyn ControlTransfer,
}

impl<'a> FirmwareLoader<'a> {
    pub fn new(ctrl: &'a mut dyn ControlTransfer) -> Self {
        Self { ctrl }
    }

    /* Full two-pass load of `loader` and `firmware`. Any failed transfer
     * aborts; the caller must start over from the beginning. */
    pub fn load(&mut self, loader: &HexImage, firmware: &HexImage) -> Result<(), FirmwareError> {
        info!(
            "Downloading firmware ({} loader bytes, {} firmware bytes)",
            loader.size(),
            firmware.size()
        );

        self.reset(true)?;
        self.download(loader, false, LoadPhase::LoaderExternal)?;
        self.reset(false)?;

        self.download(firmware, false, LoadPhase::FirmwareExternal)?;

        self.reset(true)?;
        self.download(loader, true, LoadPhase::LoaderInternal)?;
        self.download(firmware, true, LoadPhase::FirmwareInternal)?;
        self.reset(false)?;

        info!("Downloaded firmware");
        Ok(())
    }

    /* Hold (`true`) or release the 8051. */
    pub fn reset(&mut self, hold: bool) -> Result<(), FirmwareError> {
        debug!("8051 reset {}", if hold { "asserted" } else { "released" });
        self.ctrl
            .vendor_out(ANCHOR_LOAD_INTERNAL, CPUCS_REG, 0, &[u8::from(hold)])
            .map_err(|source| FirmwareError::Transfer {
                phase: LoadPhase::Reset,
                address: CPUCS_REG,
                source,
            })
    }

    /* Send every record of `image` that belongs to the requested RAM. */
    fn download(
        &mut self,
        image: &HexImage,
        internal: bool,
        phase: LoadPhase,
    ) -> Result<(), FirmwareError> {
        let request = if internal {
            ANCHOR_LOAD_INTERNAL
        } else {
            ANCHOR_LOAD_EXTERNAL
        };

        let mut count = 0;
        for record in image.records.iter().filter(|r| is_internal(r.address) == internal) {
            self.ctrl
                .vendor_out(request, record.address, 0, &record.data)
                .map_err(|source| FirmwareError::Transfer {
                    phase,
                    address: record.address,
                    source,
                })?;
            count += 1;
        }
        debug!("{phase}: {count} records");
        Ok(())
    }
}
