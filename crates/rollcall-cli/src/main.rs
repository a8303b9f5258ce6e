use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn login(&self, phone: &str, password: &str, remember: bool) -> zbus::Result<String>;
    async fn remembered_phone(&self) -> zbus::Result<String>;
    async fn select_account(&self, account: &str) -> zbus::Result<bool>;
    async fn get_settings(&self) -> zbus::Result<String>;
    async fn update_settings(&self, patch: &str) -> zbus::Result<String>;
    async fn sync(&self, role: &str, org_id: &str) -> zbus::Result<String>;
    async fn register_photo(&self, person: &str, photo: &[u8]) -> zbus::Result<String>;
    async fn recognize_photo(&self, photo: &[u8]) -> zbus::Result<String>;
    async fn remove_person(&self, face_id: i64) -> zbus::Result<bool>;
    async fn list_people(&self, role: &str) -> zbus::Result<String>;
    async fn start_recognition(&self) -> zbus::Result<bool>;
    async fn stop_recognition(&self) -> zbus::Result<bool>;
    async fn last_result(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in to the attendance API
    Login {
        /// Defaults to the phone number remembered by the last login
        #[arg(short, long)]
        phone: Option<String>,
        /// Falls back to ROLLCALL_PASSWORD
        #[arg(long)]
        password: Option<String>,
        /// Remember the phone number and session across restarts
        #[arg(long)]
        remember: bool,
        /// Pick this account (by index) when the login offers several
        #[arg(long)]
        account: Option<usize>,
    },
    /// Show recognition settings
    Settings,
    /// Change recognition settings
    Set {
        #[arg(long)]
        front_camera: Option<bool>,
        #[arg(long)]
        liveness: Option<bool>,
        /// Similarity threshold, 0-100
        #[arg(long)]
        similarity: Option<f32>,
        /// Quality threshold, 0-100
        #[arg(long)]
        quality: Option<f32>,
        /// Preview resolution, e.g. 640x480
        #[arg(long)]
        resolution: Option<String>,
    },
    /// Sync rosters from the API into the feature hub
    Sync {
        /// teacher or student; both when omitted
        #[arg(short, long)]
        role: Option<String>,
        /// Organisation id; defaults to the daemon's
        #[arg(long)]
        org: Option<String>,
    },
    /// Register a person from a photo
    Register {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        role: String,
        /// Roster id; generated when omitted
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        org: Option<String>,
        photo: PathBuf,
    },
    /// Recognise the faces in a photo
    Recognize { photo: PathBuf },
    /// Remove a registered person by face id
    Remove { face_id: i64 },
    /// List registered people
    List {
        #[arg(short, long)]
        role: Option<String>,
    },
    /// Start the live recognition loop
    Start,
    /// Stop the live recognition loop
    Stop,
    /// Show the latest live recognition result
    Last,
    /// Show daemon status
    Status,
    /// Check a frame or photo locally, without the daemon
    CheckFrame {
        path: PathBuf,
        /// Share of dark pixels above which the frame counts as dark
        #[arg(long, default_value_t = 0.95)]
        dark_threshold: f32,
    },
}

fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => println!(
            "{}",
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| raw.to_string())
        ),
        Err(_) => println!("{raw}"),
    }
}

fn read_photo(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn check_frame(path: &Path, dark_threshold: f32) -> Result<()> {
    let image = rollcall_frame::frame::decode(&read_photo(path)?)
        .with_context(|| format!("decoding {}", path.display()))?;
    let frame = rollcall_frame::Frame::new(image, 0);
    println!("{}: {}x{}", path.display(), frame.width(), frame.height());
    println!("  brightness: {:.1}", frame.avg_brightness());
    println!("  dark: {}", frame.is_dark(dark_threshold));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Commands::CheckFrame {
            path,
            dark_threshold,
        } => check_frame(&path, dark_threshold),
        command => {
            let conn = zbus::Connection::session()
                .await
                .context("connecting to the session bus")?;
            let proxy = AttendanceProxy::new(&conn)
                .await
                .context("rollcalld is not reachable")?;
            run(&proxy, command).await
        }
    }
}

async fn run(proxy: &AttendanceProxy<'_>, command: Commands) -> Result<()> {
    match command {
        Commands::Login {
            phone,
            password,
            remember,
            account,
        } => {
            let password = match password.or_else(|| std::env::var("ROLLCALL_PASSWORD").ok()) {
                Some(p) => p,
                None => bail!("no password given (use --password or ROLLCALL_PASSWORD)"),
            };
            let phone = match phone {
                Some(phone) => phone,
                None => proxy.remembered_phone().await?,
            };
            if phone.trim().is_empty() {
                bail!("no phone number given and none remembered (use --phone)");
            }
            let raw = proxy.login(&phone, &password, remember).await?;
            let outcome: serde_json::Value = serde_json::from_str(&raw)?;
            match (outcome["outcome"].as_str(), account) {
                (Some("select_account"), Some(index)) => {
                    let Some(chosen) = outcome["accounts"].get(index) else {
                        bail!("no account at index {index}");
                    };
                    proxy.select_account(&chosen.to_string()).await?;
                    println!("Logged in as {}", chosen["name"].as_str().unwrap_or("?"));
                }
                _ => print_json(&raw),
            }
        }
        Commands::Settings => print_json(&proxy.get_settings().await?),
        Commands::Set {
            front_camera,
            liveness,
            similarity,
            quality,
            resolution,
        } => {
            let patch = serde_json::json!({
                "use_front_camera": front_camera,
                "liveness_enabled": liveness,
                "similarity_threshold": similarity,
                "quality_threshold": quality,
                "preview_resolution": resolution,
            });
            print_json(&proxy.update_settings(&patch.to_string()).await?);
        }
        Commands::Sync { role, org } => {
            let raw = proxy
                .sync(role.as_deref().unwrap_or(""), org.as_deref().unwrap_or(""))
                .await?;
            print_json(&raw);
        }
        Commands::Register {
            name,
            role,
            id,
            org,
            photo,
        } => {
            let person = serde_json::json!({
                "name": name,
                "role": role.to_lowercase(),
                "external_id": id,
                "org_id": org.unwrap_or_default(),
            });
            let bytes = read_photo(&photo)?;
            print_json(&proxy.register_photo(&person.to_string(), &bytes).await?);
        }
        Commands::Recognize { photo } => {
            let bytes = read_photo(&photo)?;
            print_json(&proxy.recognize_photo(&bytes).await?);
        }
        Commands::Remove { face_id } => {
            if proxy.remove_person(face_id).await? {
                println!("Removed face {face_id}");
            } else {
                println!("No person registered under face {face_id}");
            }
        }
        Commands::List { role } => {
            print_json(&proxy.list_people(role.as_deref().unwrap_or("")).await?)
        }
        Commands::Start => {
            proxy.start_recognition().await?;
            println!("Recognition started");
        }
        Commands::Stop => {
            if proxy.stop_recognition().await? {
                println!("Recognition stopped");
            } else {
                println!("Recognition was not running");
            }
        }
        Commands::Last => print_json(&proxy.last_result().await?),
        Commands::Status => print_json(&proxy.status().await?),
        Commands::CheckFrame {
            path,
            dark_threshold,
        } => check_frame(&path, dark_threshold)?,
    }

    Ok(())
}
