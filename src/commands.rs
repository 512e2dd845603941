// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Console command parsing and execution.

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use crate::controller::LedController;

/// Help printed for `help`.
pub const HELP: &str = "\
Commands:
  on | off               power the strip on or off
  color R G B            set a static color (0-255 each)
  brightness N           set brightness (0-100)
  effect NAME|ID         start a built-in effect
  speed N                set effect speed (0-100)
  scan                   find and connect to a device
  connect ID             connect to a known device
  devices                list known devices
  history                show connection history
  disconnect             close the connection
  quit                   exit";

/// Effect selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectArg {
    Id(u8),
    Name(String),
}

/// A command typed on the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Power(bool),
    Color { r: u8, g: u8, b: u8 },
    Brightness(u8),
    Effect(EffectArg),
    Speed(u8),
    Scan,
    Connect(String),
    Devices,
    History,
    Disconnect,
    Help,
    Quit,
}

fn number(arg: Option<&str>, what: &str) -> Result<u8> {
    let arg = arg.ok_or_else(|| anyhow!("Missing {}", what))?;
    arg.parse()
        .with_context(|| format!("Invalid {}: {}", what, arg))
}

impl ConsoleCommand {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };

        let command = match verb.to_lowercase().as_str() {
            "on" => Self::Power(true),
            "off" => Self::Power(false),
            "color" | "colour" => Self::Color {
                r: number(words.next(), "red")?,
                g: number(words.next(), "green")?,
                b: number(words.next(), "blue")?,
            },
            "brightness" => Self::Brightness(number(words.next(), "brightness")?),
            "effect" => {
                let arg = words.next().ok_or_else(|| anyhow!("Missing effect"))?;
                match arg.parse::<u8>() {
                    Ok(id) => Self::Effect(EffectArg::Id(id)),
                    Err(_) => Self::Effect(EffectArg::Name(arg.to_string())),
                }
            }
            "speed" => Self::Speed(number(words.next(), "speed")?),
            "scan" => Self::Scan,
            "connect" => Self::Connect(
                words
                    .next()
                    .ok_or_else(|| anyhow!("Missing device id"))?
                    .to_string(),
            ),
            "devices" => Self::Devices,
            "history" => Self::History,
            "disconnect" => Self::Disconnect,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("Unknown command: {}", other),
        };

        Ok(Some(command))
    }

    /// Run the command and return the text to print.
    pub async fn execute(&self, controller: &LedController) -> Result<String> {
        debug!("Executing command: {:?}", self);

        let delivered = match self {
            Self::Power(on) => controller.power(*on).await,
            Self::Color { r, g, b } => controller.set_color(*r, *g, *b).await,
            Self::Brightness(level) => controller.set_brightness(*level).await,
            Self::Effect(EffectArg::Id(id)) => controller.set_effect(*id).await,
            Self::Effect(EffectArg::Name(name)) => controller.set_effect_by_name(name).await,
            Self::Speed(speed) => controller.set_effect_speed(*speed).await,
            Self::Scan => {
                let record = controller.scan_and_connect().await?;
                return Ok(format!("Connected to {} ({})", record.name, record.id));
            }
            Self::Connect(id) => {
                let record = controller.connect_known(id).await?;
                return Ok(format!("Connected to {} ({})", record.name, record.id));
            }
            Self::Devices => return Ok(list_devices(controller)),
            Self::History => return Ok(list_history(controller)),
            Self::Disconnect => {
                controller.disconnect().await?;
                return Ok("Disconnected".to_string());
            }
            Self::Help => return Ok(HELP.to_string()),
            Self::Quit => return Ok(String::new()),
        };

        if delivered {
            Ok("OK".to_string())
        } else {
            bail!("Command not delivered ({})", controller.state().get_status().as_str())
        }
    }
}

fn list_devices(controller: &LedController) -> String {
    let devices = controller.registry().devices();
    if devices.is_empty() {
        return "No known devices".to_string();
    }

    devices
        .iter()
        .map(|device| {
            format!(
                "{}  {}  [{}]{}",
                device.id,
                device.name,
                device.profile,
                if device.favorite { " *" } else { "" }
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn list_history(controller: &LedController) -> String {
    let history = controller.registry().history();
    if history.is_empty() {
        return "No connection history".to_string();
    }

    history
        .iter()
        .map(|entry| {
            format!(
                "{}  {}  {}",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.device_name,
                entry.outcome.as_str()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
