use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::fmt::Write as _;
use std::time::Duration;

// `#[zbus::proxy]` generates both `VigilProxy` (async) and
// `VigilProxyBlocking`. Only the blocking variant is used here.
#[zbus::proxy(
    interface = "org.freedesktop.Vigil1",
    default_service = "org.freedesktop.Vigil1",
    default_path = "/org/freedesktop/Vigil1"
)]
trait Vigil {
    async fn reload_labels(&self) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
    async fn recent_logs(&self, limit: u32) -> zbus::Result<String>;
    async fn analytics(&self, days: u32) -> zbus::Result<String>;
    async fn list_blacklist(&self) -> zbus::Result<String>;
    async fn add_blacklist(&self, name: &str, notes: &str) -> zbus::Result<i64>;
    async fn toggle_blacklist(&self, id: i64) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil face recognition admin CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Re-read the label directory
    Reload,
    /// Show recent recognition log entries
    Logs {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Show daily recognition counts and the most seen names
    Analytics {
        #[arg(short, long, default_value_t = 14)]
        days: u32,
    },
    /// Manage the blacklist
    Blacklist {
        #[command(subcommand)]
        action: BlacklistAction,
    },
    /// List V4L2 capture devices (does not need the daemon)
    Devices,
}

#[derive(Subcommand)]
enum BlacklistAction {
    /// List all entries
    List,
    /// Add a name to the blacklist
    Add {
        name: String,
        #[arg(short, long, default_value = "")]
        notes: String,
    },
    /// Activate or deactivate an entry
    Toggle { id: i64 },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Devices = cli.command {
        tracing::debug!("enumerating V4L2 devices");
        print!("{}", format_devices(&vigil_hw::Camera::list_devices()));
        return Ok(());
    }

    let bus = bus_label(cli.session);
    tracing::debug!(bus, "connecting to D-Bus");
    let builder = if cli.session {
        zbus::blocking::connection::Builder::session()?
    } else {
        zbus::blocking::connection::Builder::system()?
    };
    let conn = builder
        .method_timeout(Duration::from_secs(5))
        .build()
        .context("failed to connect to D-Bus")?;
    let proxy = VigilProxyBlocking::new(&conn)?;
    tracing::debug!(bus, unique_name = ?conn.unique_name(), "connected to D-Bus");

    match cli.command {
        Commands::Status => {
            let status = parse(&proxy.status().context("is vigild running?")?)?;
            print!("{}", format_status(&status));
        }
        Commands::Reload => {
            let count = proxy.reload_labels()?;
            println!("Reloaded {count} labels");
        }
        Commands::Logs { limit } => {
            print!("{}", format_logs(&parse(&proxy.recent_logs(limit)?)?));
        }
        Commands::Analytics { days } => {
            print!("{}", format_analytics(&parse(&proxy.analytics(days)?)?));
        }
        Commands::Blacklist { action } => match action {
            BlacklistAction::List => {
                print!("{}", format_blacklist(&parse(&proxy.list_blacklist()?)?));
            }
            BlacklistAction::Add { name, notes } => {
                let id = proxy.add_blacklist(&name, &notes)?;
                println!("Added blacklist entry #{id} ({name})");
            }
            BlacklistAction::Toggle { id } => {
                let active = proxy.toggle_blacklist(id)?;
                let state = if active { "active" } else { "inactive" };
                println!("Blacklist entry #{id} is now {state}");
            }
        },
        Commands::Devices => {}
    }

    Ok(())
}

fn bus_label(session: bool) -> &'static str {
    if session {
        "session"
    } else {
        "system"
    }
}

fn parse(json: &str) -> Result<Value> {
    serde_json::from_str(json).context("daemon returned malformed JSON")
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".into(),
        other => other.to_string(),
    }
}

fn format_status(status: &Value) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "vigild {}", text(&status["version"]));
    let _ = writeln!(out, "  camera:     {}", text(&status["camera"]));
    let _ = writeln!(out, "  uptime:     {}s", text(&status["uptime_secs"]));
    let _ = writeln!(out, "  labels:     {}", text(&status["labels"]));
    let _ = writeln!(out, "  threshold:  {}", text(&status["confidence_threshold"]));
    let pipeline = &status["pipeline"];
    let _ = writeln!(
        out,
        "  pipeline:   {} frames, {} faces, {} alerts, {} skipped, {} log failures",
        text(&pipeline["frames"]),
        text(&pipeline["faces"]),
        text(&pipeline["alerts"]),
        text(&pipeline["skipped"]),
        text(&pipeline["log_failures"]),
    );
    out
}

fn format_logs(logs: &Value) -> String {
    let rows = logs.as_array().map(Vec::as_slice).unwrap_or_default();
    if rows.is_empty() {
        return "No log entries\n".into();
    }
    let mut out = String::new();
    let _ = writeln!(out, "{:<32} {:<20} {:>10}", "TIMESTAMP", "NAME", "CONFIDENCE");
    for row in rows {
        let confidence = row["confidence"]
            .as_f64()
            .map(|c| format!("{c:.1}"))
            .unwrap_or_else(|| "-".into());
        let _ = writeln!(
            out,
            "{:<32} {:<20} {:>10}",
            text(&row["timestamp"]),
            text(&row["name"]),
            confidence
        );
    }
    out
}

fn format_analytics(stats: &Value) -> String {
    let mut out = String::new();
    let daily = stats["daily"].as_array().map(Vec::as_slice).unwrap_or_default();
    let peak = daily
        .iter()
        .filter_map(|d| d["count"].as_u64())
        .max()
        .unwrap_or(0)
        .max(1);
    let _ = writeln!(out, "Daily recognitions:");
    for day in daily {
        let count = day["count"].as_u64().unwrap_or(0);
        let bar = "#".repeat((count * 40 / peak) as usize);
        let _ = writeln!(out, "  {}  {:>6}  {bar}", text(&day["date"]), count);
    }
    let top = stats["top_names"].as_array().map(Vec::as_slice).unwrap_or_default();
    if !top.is_empty() {
        let _ = writeln!(out, "Top names:");
        for entry in top {
            let _ = writeln!(out, "  {:<20} {:>6}", text(&entry["name"]), text(&entry["count"]));
        }
    }
    out
}

fn format_blacklist(entries: &Value) -> String {
    let rows = entries.as_array().map(Vec::as_slice).unwrap_or_default();
    if rows.is_empty() {
        return "Blacklist is empty\n".into();
    }
    let mut out = String::new();
    let _ = writeln!(out, "{:>5} {:<20} {:<8} NOTES", "ID", "NAME", "STATE");
    for row in rows {
        let state = if row["active"].as_bool().unwrap_or(false) {
            "active"
        } else {
            "inactive"
        };
        let _ = writeln!(
            out,
            "{:>5} {:<20} {:<8} {}",
            text(&row["id"]),
            text(&row["name"]),
            state,
            text(&row["notes"])
        );
    }
    out
}

fn format_devices(devices: &[vigil_hw::DeviceInfo]) -> String {
    if devices.is_empty() {
        return "No V4L2 capture devices found\n".into();
    }
    let mut out = String::new();
    for device in devices {
        let _ = writeln!(out, "{}  {} ({}, {})", device.path, device.name, device.driver, device.bus);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cli_parses_blacklist_add() {
        let cli = Cli::try_parse_from(["vigil", "--session", "blacklist", "add", "mallory", "-n", "tailgating"])
            .unwrap();
        assert!(cli.session);
        match cli.command {
            Commands::Blacklist {
                action: BlacklistAction::Add { name, notes },
            } => {
                assert_eq!(name, "mallory");
                assert_eq!(notes, "tailgating");
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["vigil", "logs"]).unwrap();
        assert!(matches!(cli.command, Commands::Logs { limit: 20 }));
        let cli = Cli::try_parse_from(["vigil", "analytics", "--days", "7"]).unwrap();
        assert!(matches!(cli.command, Commands::Analytics { days: 7 }));
    }

    #[test]
    fn test_bus_label_follows_session_flag() {
        let cli = Cli::try_parse_from(["vigil", "status"]).unwrap();
        assert_eq!(bus_label(cli.session), "system");
        let cli = Cli::try_parse_from(["vigil", "reload", "--session"]).unwrap();
        assert_eq!(bus_label(cli.session), "session");
    }

    #[test]
    fn test_format_logs() {
        let logs = json!([
            {"id": 2, "name": "Unknown", "confidence": null, "timestamp": "2024-03-01T10:00:00Z"},
            {"id": 1, "name": "alice", "confidence": 41.3, "timestamp": "2024-03-01T09:00:00Z"},
        ]);
        let out = format_logs(&logs);
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("Unknown") && lines[1].trim_end().ends_with('-'));
        assert!(lines[2].contains("alice") && lines[2].contains("41.3"));
        assert_eq!(format_logs(&json!([])), "No log entries\n");
    }

    #[test]
    fn test_format_analytics_scales_bars() {
        let stats = json!({
            "daily": [
                {"date": "2024-03-01", "count": 4},
                {"date": "2024-03-02", "count": 0},
                {"date": "2024-03-03", "count": 2},
            ],
            "top_names": [{"name": "alice", "count": 6}],
        });
        let out = format_analytics(&stats);
        assert!(out.contains(&"#".repeat(40)));
        assert!(out.contains(&format!("2024-03-03       2  {}", "#".repeat(20))));
        assert!(out.contains("alice"));
    }

    #[test]
    fn test_format_blacklist() {
        let entries = json!([
            {"id": 1, "name": "mallory", "notes": null, "active": false, "created_at": "2024-03-01T09:00:00Z"},
        ]);
        let out = format_blacklist(&entries);
        assert!(out.contains("mallory"));
        assert!(out.contains("inactive"));
        assert_eq!(format_blacklist(&json!([])), "Blacklist is empty\n");
    }

    #[test]
    fn test_format_status() {
        let status = json!({
            "version": "0.1.0",
            "camera": "/dev/video0",
            "uptime_secs": 12,
            "labels": 3,
            "confidence_threshold": 70.0,
            "pipeline": {"frames": 100, "faces": 7, "alerts": 1, "skipped": 0, "log_failures": 0},
        });
        let out = format_status(&status);
        assert!(out.starts_with("vigild 0.1.0\n"));
        assert!(out.contains("100 frames, 7 faces, 1 alerts"));
    }
}
