//! Config command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::output::{print_error, print_info, print_success, print_warning};
use ps_core::config::{self, ConfigFile};

fn config_file_path(config_path: Option<&PathBuf>) -> PathBuf {
    config_path
        .cloned()
        .unwrap_or_else(config::default_config_path)
}

fn read_table(path: &Path) -> Result<toml::Table> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
}

/// Print a config value by dotted key, e.g. `client.endpoints.chat`
pub fn config_get(config_path: Option<&PathBuf>, key: &str) -> Result<()> {
    let path = config_file_path(config_path);
    if !path.exists() {
        print_error(&format!("Config file not found: {:?}", path));
        print_info("Run 'pairsync config init' to create one");
        return Ok(());
    }

    let root = toml::Value::Table(read_table(&path)?);
    match lookup(&root, key) {
        Some(toml::Value::String(s)) => println!("{}", s),
        Some(toml::Value::Table(t)) => print!("{}", toml::to_string_pretty(t)?),
        Some(other) => println!("{}", other),
        None => print_error(&format!("Key not found: {}", key)),
    }
    Ok(())
}

/// Set a config value by dotted key.
///
/// The edited file must still hold a valid client configuration, otherwise
/// nothing is written.
pub fn config_set(config_path: Option<&PathBuf>, key: &str, value: &str) -> Result<()> {
    let path = config_file_path(config_path);
    if !path.exists() {
        print_info("Creating default configuration...");
        config_init(config_path, false)?;
    }

    let mut table = read_table(&path)?;
    assign(&mut table, key, parse_value(value))?;

    let content = toml::to_string_pretty(&table)?;
    let file: ConfigFile = toml::from_str(&content)
        .with_context(|| format!("{} = {} does not fit the config schema", key, value))?;
    file.client
        .validate()
        .with_context(|| format!("Rejected {} = {}", key, value))?;

    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;
    print_success(&format!("Set {} = {}", key, value));
    Ok(())
}

/// Print the configuration file, or the effective defaults if there is none
pub fn config_show(config_path: Option<&PathBuf>) -> Result<()> {
    let path = config_file_path(config_path);
    if !path.exists() {
        print_warning(&format!("No configuration file found at {:?}", path));
        print_info("Showing built-in defaults. Run 'pairsync config init' to create a file");
        println!();
        print!("{}", toml::to_string_pretty(&ConfigFile::default())?);
        return Ok(());
    }

    print_info(&format!("Configuration file: {:?}", path));
    println!();
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    println!("{}", content);
    Ok(())
}

/// Write the default configuration file
pub fn config_init(config_path: Option<&PathBuf>, force: bool) -> Result<()> {
    let path = config_file_path(config_path);

    if path.exists() && !force {
        print_error(&format!("Config file already exists: {:?}", path));
        print_info("Use --force to overwrite");
        return Ok(());
    }

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config directory: {:?}", dir))?;
    }
    std::fs::write(&path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    print_success(&format!("Created configuration file: {:?}", path));
    Ok(())
}

/// Print the config file location
pub fn config_path(config_path: Option<&PathBuf>) {
    println!("{}", config_file_path(config_path).display());
}

fn lookup<'a>(root: &'a toml::Value, key: &str) -> Option<&'a toml::Value> {
    key.split('.')
        .try_fold(root, |value, part| value.as_table()?.get(part))
}

fn assign(table: &mut toml::Table, key: &str, value: toml::Value) -> Result<()> {
    let mut parts: Vec<&str> = key.split('.').collect();
    let last = match parts.pop() {
        Some(last) if !last.is_empty() => last,
        _ => anyhow::bail!("Invalid key: {:?}", key),
    };

    let mut current = table;
    for part in parts {
        current = current
            .entry(part)
            .or_insert(toml::Value::Table(toml::Table::new()))
            .as_table_mut()
            .ok_or_else(|| anyhow::anyhow!("{} is not a table in key {}", part, key))?;
    }
    current.insert(last.to_string(), value);
    Ok(())
}

fn parse_value(value: &str) -> toml::Value {
    if let Ok(b) = value.parse::<bool>() {
        toml::Value::Boolean(b)
    } else if let Ok(i) = value.parse::<i64>() {
        toml::Value::Integer(i)
    } else if let Ok(f) = value.parse::<f64>() {
        toml::Value::Float(f)
    } else {
        toml::Value::String(value.to_string())
    }
}

const DEFAULT_CONFIG: &str = r#"# pairsync configuration

[client]
# Backend address. Push channels use the same host with ws:// or wss://
api_url = "http://localhost:8000"

# Seconds between status polls while the push channel is down
poll_interval = 3

# Seconds before a request/response call times out
request_timeout = 30

# Fall back to polling when the status channel is silent this many seconds
# push_stall_timeout = 60

[client.endpoints]
pairing_code = "/api/qrcode"
connection_status = "/api/connection-status"
chat = "/api/chat"
health = "/"
status_channel = "/ws/whatsapp-status"
chat_channel = "/ws/chat"

[client.backoff]
# Delay before the first reconnect attempt, in seconds
initial = 1
# Upper bound on the delay, in seconds
max = 60
multiplier = 2.0
jitter = 0.25
# Give up after this many attempts
max_attempts = 5
"#;
