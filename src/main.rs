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

//! Ledstrip Desktop Application

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledstrip_desktop::bluetooth::BluezPlatform;
use ledstrip_desktop::commands::{ConsoleCommand, HELP};
use ledstrip_desktop::config::Config;
use ledstrip_desktop::storage::{DeviceRegistry, SqliteStore};
use ledstrip_desktop::LedController;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ledstrip_desktop=info")),
        )
        .init();

    info!("Starting Ledstrip Desktop v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    // Initialize storage
    let store = Arc::new(SqliteStore::new(&config.data_dir)?);
    let registry = Arc::new(DeviceRegistry::load(store)?);
    info!("Device registry initialized");

    // Initialize BLE central
    let platform = Arc::new(BluezPlatform::new(config.scan_timeout()).await?);
    let controller = LedController::new(platform, registry, &config);

    if config.bluetooth.auto_connect {
        match controller.auto_connect().await {
            Ok(Some(device)) => info!("Connected to {}", device.name),
            Ok(None) => info!("No known device, type 'scan' to find one"),
            Err(e) => warn!("Auto-connect failed: {}", e),
        }
    }

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Input closed");
                    break;
                };

                let command = match ConsoleCommand::parse(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                if command == ConsoleCommand::Quit {
                    info!("Quit requested");
                    break;
                }

                match command.execute(&controller).await {
                    Ok(output) => println!("{}", output),
                    Err(e) => {
                        error!("{}", e);
                        println!("Error: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    if let Err(e) = controller.disconnect().await {
        warn!("Error while disconnecting: {}", e);
    }

    info!("Ledstrip Desktop stopped");
    Ok(())
}
