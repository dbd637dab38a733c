/* Error types shared across the protocol engine. */

use thiserror::Error;

/* Rejections from the command queue. None of these are fatal: the caller
 * logs and moves on. */
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("invalid device command opcode {0}")]
    InvalidDeviceCommand(u8),

    #[error("invalid local command opcode {0}")]
    InvalidLocalCommand(u8),

    #[error("opcode {0} is not a command")]
    NotACommand(u8),

    #[error("command queue full ({capacity} frames), dropped opcode {opcode}")]
    QueueFull { opcode: u8, capacity: usize },
}

/* Failures of the raw transport collaborators. */
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("control transfer 0x{request:02x} (value 0x{value:04x}) failed: {source}")]
    ControlTransfer {
        request: u8,
        value: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("short control transfer: {sent} of {expected} bytes")]
    ShortTransfer { sent: usize, expected: usize },

    #[error("device I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/* Stage of the two-pass anchor load, used to say where a download died. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Reset,
    LoaderExternal,
    FirmwareExternal,
    LoaderInternal,
    FirmwareInternal,
}

impl std::fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Reset => "8051 reset",
            Self::LoaderExternal => "loader external RAM",
            Self::FirmwareExternal => "firmware external RAM",
            Self::LoaderInternal => "loader internal RAM",
            Self::FirmwareInternal => "firmware internal RAM",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("{phase} download failed at 0x{address:04x}")]
    Transfer {
        phase: LoadPhase,
        address: u16,
        #[source]
        source: TransportError,
    },

    #[error("firmware image: {0}")]
    Image(#[from] crate::firmware::hex::HexError),
}
