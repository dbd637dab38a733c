/* ikeysctl CLI: clap-driven client that talks to ikeysd over DBus to list IntelliKeys
 * keyboards, inspect their state, change the shared settings and send raw commands. */
mod dbus_client;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use dbus_client::IkeysClient;

/* Device command opcodes used by the convenience subcommands. */
const CMD_LED: u8 = 2;
const CMD_TONE: u8 = 4;
/* Host-side pause between queued commands (ms, little endian). */
const CMD_DELAY: u8 = 101;

const NUM_LEDS: u8 = 9;

/// ikeysctl — inspect and configure IntelliKeys keyboards via the ikeysd DBus daemon.
#[derive(Parser)]
#[command(name = "ikeysctl", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected devices.
    List,

    /// Show detailed information about a device.
    Info {
        /// Device index (0-based, from `ikeysctl list`) or sysname.
        device: String,
    },

    /// Get or set how modifier keys latch: latching, locking or nolatch.
    #[command(name = "shift-action")]
    ShiftAction {
        /// Device index or sysname.
        device: String,
        /// New behaviour (omit to read current).
        action: Option<String>,
    },

    /// Get or set the indicator light layout (3 or 6).
    Lights {
        /// Device index or sysname.
        device: String,
        /// Number of lights printed on the overlay frame (omit to read current).
        count: Option<u32>,
    },

    /// Play a tone on the device speaker.
    Tone {
        /// Device index or sysname.
        device: String,
        /// Frequency code (0-255).
        frequency: u8,
        /// Volume (0 is silent).
        #[arg(default_value_t = 2)]
        volume: u8,
        /// Duration in ms.
        #[arg(long, default_value_t = 200)]
        duration: u16,
    },

    /// Switch one indicator LED on or off.
    Led {
        /// Device index or sysname.
        device: String,
        /// LED number (1-9).
        number: u8,
        /// "on" or "off".
        state: String,
    },

    /// Queue a raw command frame.
    ///
    /// Bytes are decimal or 0x-prefixed hex, opcode first.
    /// Example: "4 120 2" (tone).
    Send {
        /// Device index or sysname.
        device: String,
        /// Up to 8 bytes.
        bytes: Vec<String>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = IkeysClient::connect()
        .await
        .context("Failed to connect to ikeysd on org.freedesktop.intellikeys1")?;

    match cli.command {
        Commands::List => cmd_list(&client).await,
        Commands::Info { device } => cmd_info(&client, &device).await,
        Commands::ShiftAction { device, action } => {
            cmd_shift_action(&client, &device, action.as_deref()).await
        }
        Commands::Lights { device, count } => cmd_lights(&client, &device, count).await,
        Commands::Tone {
            device,
            frequency,
            volume,
            duration,
        } => cmd_tone(&client, &device, frequency, volume, duration).await,
        Commands::Led {
            device,
            number,
            state,
        } => cmd_led(&client, &device, number, &state).await,
        Commands::Send { device, bytes } => cmd_send(&client, &device, &bytes).await,
    }
}

// ---------------------------------------------------------------------------
// Command implementations
// ---------------------------------------------------------------------------

async fn cmd_list(client: &IkeysClient) -> Result<()> {
    let api = client.get_api_version().await.unwrap_or(-1);
    let devices = client.list_devices().await?;
    if devices.is_empty() {
        println!("No devices found. (API version {})", api);
        return Ok(());
    }
    println!("API version: {}", api);
    for (i, path) in devices.iter().enumerate() {
        let name = client.get_device_name(path).await.unwrap_or_default();
        let model = client.get_device_model(path).await.unwrap_or_default();
        println!("{}: {} ({})", i, name, model);
    }
    Ok(())
}

async fn cmd_info(client: &IkeysClient, device: &str) -> Result<()> {
    let path = client.resolve_device(device).await?;
    let name = client.get_device_name(&path).await?;
    let model = client.get_device_model(&path).await?;
    let fw = client.get_device_firmware(&path).await?;
    let serial = client.get_serial_number(&path).await?;
    let calibrated = client.get_calibration_valid(&path).await?;
    let intelliswitch = client.get_intelliswitch(&path).await?;
    let overlay = client.get_current_overlay(&path).await?;
    let overlay_name = client.get_overlay_name(&path).await.unwrap_or_default();
    let switched_on = client.get_switched_on(&path).await?;
    let shift_action = client.get_shift_key_action(&path).await?;
    let lights = client.get_indicator_lights(&path).await?;
    let modifiers = client.get_modifier_states(&path).await?;

    println!("Device:      {}", name);
    println!("Model:       {}", model);
    if !fw.is_empty() {
        println!("Firmware:    {}", fw);
    }
    if calibrated {
        println!(
            "Serial:      {}{}",
            serial,
            if intelliswitch { " [IntelliSwitch]" } else { "" }
        );
    } else {
        println!("Serial:      (calibration not read yet)");
    }
    println!("Power:       {}", if switched_on { "on" } else { "off" });
    println!("Overlay:     {}", overlay_display(overlay, &overlay_name));
    println!("Shift keys:  {}", shift_action);
    println!("Lights:      {}", lights);
    println!("Modifiers:");
    for (key, state) in &modifiers {
        println!("  {:<11}{}", key, state);
    }
    Ok(())
}

async fn cmd_shift_action(client: &IkeysClient, device: &str, action: Option<&str>) -> Result<()> {
    let path = client.resolve_device(device).await?;
    match action {
        Some(action) => {
            let action = parse_shift_action(action)?;
            client.set_shift_key_action(&path, action).await?;
            println!("Shift key action set to {}.", action);
        }
        None => println!("{}", client.get_shift_key_action(&path).await?),
    }
    Ok(())
}

async fn cmd_lights(client: &IkeysClient, device: &str, count: Option<u32>) -> Result<()> {
    let path = client.resolve_device(device).await?;
    match count {
        Some(count) => {
            anyhow::ensure!(count == 3 || count == 6, "Lights must be 3 or 6, got {}", count);
            client.set_indicator_lights(&path, count).await?;
            println!("Indicator lights set to {}.", count);
        }
        None => println!("{}", client.get_indicator_lights(&path).await?),
    }
    Ok(())
}

async fn cmd_tone(
    client: &IkeysClient,
    device: &str,
    frequency: u8,
    volume: u8,
    duration: u16,
) -> Result<()> {
    let path = client.resolve_device(device).await?;
    let [lo, hi] = duration.to_le_bytes();
    for frame in [
        vec![CMD_TONE, frequency, volume],
        vec![CMD_DELAY, lo, hi],
        vec![CMD_TONE, 0, 0],
    ] {
        post(client, &path, &frame).await?;
    }
    Ok(())
}

async fn cmd_led(client: &IkeysClient, device: &str, number: u8, state: &str) -> Result<()> {
    anyhow::ensure!(
        (1..=NUM_LEDS).contains(&number),
        "LED number must be 1-{}, got {}",
        NUM_LEDS,
        number
    );
    let on = parse_on_off(state)?;
    let path = client.resolve_device(device).await?;
    post(client, &path, &[CMD_LED, number, u8::from(on)]).await
}

async fn cmd_send(client: &IkeysClient, device: &str, bytes: &[String]) -> Result<()> {
    let frame = parse_frame(bytes)?;
    let path = client.resolve_device(device).await?;
    post(client, &path, &frame).await?;
    println!("Queued {:02x?}", frame);
    Ok(())
}

async fn post(client: &IkeysClient, path: &str, frame: &[u8]) -> Result<()> {
    if !client.post_command(path, frame).await? {
        anyhow::bail!("Daemon rejected command {:02x?}", frame);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn overlay_display(number: i32, name: &str) -> String {
    match (number, name.is_empty()) {
        (n, true) if n < 0 => "none".to_string(),
        (n, false) if n < 0 => format!("\"{}\"", name),
        (n, true) => format!("#{}", n),
        (n, false) => format!("#{} \"{}\"", n, name),
    }
}

fn parse_shift_action(s: &str) -> Result<&'static str> {
    match s.to_lowercase().as_str() {
        "latching" | "latch" => Ok("latching"),
        "locking" | "lock" => Ok("locking"),
        "nolatch" | "no-latch" | "none" => Ok("nolatch"),
        _ => anyhow::bail!(
            "Unknown shift action '{}'. Use: latching, locking, nolatch",
            s
        ),
    }
}

fn parse_on_off(s: &str) -> Result<bool> {
    match s.to_lowercase().as_str() {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        _ => anyhow::bail!("LED state must be 'on' or 'off', got '{}'", s),
    }
}

fn parse_byte(s: &str) -> Result<u8> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.with_context(|| format!("Invalid byte '{}'", s))
}

/// Parse the bytes of a raw command frame, opcode first.
fn parse_frame(bytes: &[String]) -> Result<Vec<u8>> {
    anyhow::ensure!(
        !bytes.is_empty() && bytes.len() <= 8,
        "A command is 1 to 8 bytes, got {}",
        bytes.len()
    );
    bytes.iter().map(|b| parse_byte(b)).collect()
}
