use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.asisto.Attendance1",
    default_service = "org.asisto.Attendance1",
    default_path = "/org/asisto/Attendance1"
)]
trait Attendance {
    async fn start(&self) -> zbus::Result<String>;
    async fn stop(&self) -> zbus::Result<String>;
    async fn reload(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn remove_identity(&self, id: &str) -> zbus::Result<bool>;
    async fn select_unknown(&self, candidate: u64) -> zbus::Result<String>;
    async fn enroll_selected(&self, name: &str) -> zbus::Result<String>;
    async fn cancel_selection(&self) -> zbus::Result<String>;
    async fn enroll_from_image(&self, name: &str, path: &str) -> zbus::Result<String>;
    async fn announce(&self) -> zbus::Result<u32>;
    async fn attendance_on(&self, date: &str) -> zbus::Result<String>;
    async fn export(&self) -> zbus::Result<String>;
    async fn import(&self, json: &str) -> zbus::Result<u32>;
}

#[derive(Parser)]
#[command(name = "asisto", about = "Asisto face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon and recognition status
    Status,
    /// Start scanning (loads face models on first use)
    Start,
    /// Stop scanning
    Stop,
    /// Retry loading face models after a failure
    Reload,
    /// List enrolled people
    List,
    /// Remove an enrolled person (attendance history is kept)
    Remove {
        /// Identity ID to remove
        id: String,
    },
    /// Pause scanning on an unknown face (IDs are shown by `status`)
    Select {
        candidate: u64,
    },
    /// Enroll the selected unknown face and resume scanning
    Enroll {
        /// Full name of the person
        name: String,
    },
    /// Drop the selected face and resume scanning
    Cancel,
    /// Enroll a person from a photo
    EnrollImage {
        /// Full name of the person
        name: String,
        /// Image file containing the person's face
        path: PathBuf,
    },
    /// Re-send the arrival notification for everyone currently recognized
    Announce,
    /// Show attendance for a day
    Attendance {
        /// Day as YYYY-MM-DD (default: today)
        #[arg(short, long)]
        date: Option<String>,
    },
    /// Export all identities and attendance as JSON
    Export {
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Replace ALL identities and attendance with an export file
    Import {
        file: PathBuf,
        /// Confirm that existing data will be deleted
        #[arg(long)]
        yes: bool,
    },
    /// List local V4L2 capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Local diagnostics, no daemon needed.
    if let Commands::Devices = cli.command {
        print_devices();
        return Ok(());
    }

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("asistod is not reachable")?;

    match cli.command {
        Commands::Status => {
            let raw = proxy.status().await?;
            let status: serde_json::Value = serde_json::from_str(&raw)?;
            print_status(&status);
        }
        Commands::Start => println!("{}", proxy.start().await?),
        Commands::Stop => println!("{}", proxy.stop().await?),
        Commands::Reload => println!("{}", proxy.reload().await?),
        Commands::List => {
            let list: Vec<serde_json::Value> = serde_json::from_str(&proxy.list_identities().await?)?;
            if list.is_empty() {
                println!("No one enrolled");
            }
            for identity in &list {
                println!(
                    "{}  {:<8}  {}  last seen: {}",
                    field(identity, "id"),
                    field(identity, "shortCode"),
                    field(identity, "displayName"),
                    identity["lastSeenAt"].as_str().unwrap_or("never"),
                );
            }
        }
        Commands::Remove { id } => {
            if proxy.remove_identity(&id).await? {
                println!("Removed {id}");
            } else {
                println!("No identity {id}");
            }
        }
        Commands::Select { candidate } => {
            proxy.select_unknown(candidate).await?;
            println!("Scanning paused on face {candidate}; run `asisto enroll <name>` or `asisto cancel`");
        }
        Commands::Enroll { name } => {
            let identity: serde_json::Value = serde_json::from_str(&proxy.enroll_selected(&name).await?)?;
            print_enrolled(&identity);
        }
        Commands::Cancel => println!("{}", proxy.cancel_selection().await?),
        Commands::EnrollImage { name, path } => {
            let path = std::fs::canonicalize(&path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            let raw = proxy
                .enroll_from_image(&name, &path.to_string_lossy())
                .await?;
            print_enrolled(&serde_json::from_str(&raw)?);
        }
        Commands::Announce => {
            let count = proxy.announce().await?;
            println!("Announced {count} arrival(s)");
        }
        Commands::Attendance { date } => {
            let records: Vec<serde_json::Value> =
                serde_json::from_str(&proxy.attendance_on(date.as_deref().unwrap_or("")).await?)?;
            let identities: Vec<serde_json::Value> =
                serde_json::from_str(&proxy.list_identities().await?)?;
            if records.is_empty() {
                println!("No attendance recorded");
            }
            for record in &records {
                let id = field(record, "identityId");
                let name = identities
                    .iter()
                    .find(|i| i["id"] == record["identityId"])
                    .map(|i| field(i, "displayName"))
                    .unwrap_or("(removed)");
                println!(
                    "{}  {:<30}  {:.2}  {id}",
                    field(record, "timestamp"),
                    name,
                    record["confidence"].as_f64().unwrap_or(0.0),
                );
            }
        }
        Commands::Export { output } => {
            let json = proxy.export().await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &json)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Exported to {}", path.display());
                }
                None => println!("{json}"),
            }
        }
        Commands::Import { file, yes } => {
            if !yes {
                bail!("import deletes every enrolled identity and attendance record first; rerun with --yes");
            }
            let json = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let count = proxy.import(&json).await?;
            println!("Imported {count} identities");
        }
        Commands::Devices => print_devices(),
    }

    Ok(())
}

fn print_devices() {
    let devices = asisto_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
}

fn field<'a>(value: &'a serde_json::Value, key: &str) -> &'a str {
    value[key].as_str().unwrap_or("?")
}

fn print_enrolled(identity: &serde_json::Value) {
    println!(
        "Enrolled {} as {} (id {})",
        field(identity, "displayName"),
        field(identity, "shortCode"),
        field(identity, "id"),
    );
}

fn print_status(status: &serde_json::Value) {
    let lp = &status["loop"];
    println!("asistod {}", field(status, "version"));
    println!("  state:       {}", field(lp, "state"));
    println!("  models:      {}%", lp["modelProgress"].as_u64().unwrap_or(0));
    println!("  enrolled:    {}", status["identities"].as_u64().unwrap_or(0));
    println!("  fps:         {}", lp["fps"].as_u64().unwrap_or(0));
    for (label, key) in [("model error", "modelError"), ("camera", "cameraError"), ("storage", "storageFault")] {
        if let Some(msg) = lp[key].as_str() {
            println!("  {label}: {msg}");
        }
    }
    if let Some(recognized) = lp["recognized"].as_array() {
        for r in recognized {
            println!(
                "  present:     {} ({}) {:.2}",
                field(r, "displayName"),
                field(r, "shortCode"),
                r["confidence"].as_f64().unwrap_or(0.0)
            );
        }
    }
    if let Some(unknown) = lp["unknown"].as_array() {
        for u in unknown {
            println!("  unknown:     face {}", u["id"]);
        }
    }
    if let Some(selected) = lp["selected"].as_u64() {
        println!("  selected:    face {selected}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_flag_parses() {
        let cli = Cli::try_parse_from(["asisto", "import", "backup.json", "--yes"]).unwrap();
        assert!(matches!(cli.command, Commands::Import { yes: true, .. }));

        let cli = Cli::try_parse_from(["asisto", "import", "backup.json"]).unwrap();
        assert!(matches!(cli.command, Commands::Import { yes: false, .. }));
    }

    #[test]
    fn test_global_system_flag() {
        let cli = Cli::try_parse_from(["asisto", "status", "--system"]).unwrap();
        assert!(cli.system);
    }

    #[test]
    fn test_enroll_image_args() {
        let cli = Cli::try_parse_from(["asisto", "enroll-image", "Ana Pérez", "ana.jpg"]).unwrap();
        match cli.command {
            Commands::EnrollImage { name, path } => {
                assert_eq!(name, "Ana Pérez");
                assert_eq!(path, PathBuf::from("ana.jpg"));
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_select_requires_numeric_id() {
        assert!(Cli::try_parse_from(["asisto", "select", "abc"]).is_err());
    }

    #[test]
    fn test_field_defaults() {
        let v = serde_json::json!({ "id": "x" });
        assert_eq!(field(&v, "id"), "x");
        assert_eq!(field(&v, "missing"), "?");
    }
}
