use std::fs;
use std::path::Path;

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF
    embuild::espidf::sysenv::output();

    // Read the local deployment configuration if it exists
    let local_config_path = "wifi_config.h";
    if Path::new(local_config_path).exists() {
        let contents = fs::read_to_string(local_config_path)?;

        emit_define(&contents, "WIFI_SSID", "WIFI_SSID");
        emit_define(&contents, "WIFI_PASSWORD", "WIFI_PASSWORD");
        emit_define(&contents, "FIRMWARE_UPGRADE_URL", "FIRMWARE_UPGRADE_URL");
    } else {
        // Use empty defaults if no config file
        println!("cargo:rustc-env=WIFI_SSID=");
        println!("cargo:rustc-env=WIFI_PASSWORD=");
        println!("cargo:rustc-env=FIRMWARE_UPGRADE_URL=");
        println!("cargo:warning=wifi_config.h not found! Copy wifi_config.h.example to wifi_config.h and add your credentials and upgrade URL.");
    }

    Ok(())
}

fn emit_define(contents: &str, define: &str, env: &str) {
    let needle = format!("#define {define}");
    let value = contents
        .lines()
        .find(|l| l.contains(&needle))
        .and_then(|l| l.split('"').nth(1))
        .unwrap_or("");
    println!("cargo:rustc-env={env}={value}");
}
