use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};

use voice_ledger::audio::{convert_raw_pcm, probe_duration, CpalInput, PcmFormat, VOICE_SAMPLE_RATE};
use voice_ledger::clip::{Metadata, RecordedClip, User};
use voice_ledger::library::RecordingLibrary;
use voice_ledger::notify::Notification;
use voice_ledger::settings::{default_settings_path, load_settings};
use voice_ledger::store::{ClipStore, JsonClipStore};
use voice_ledger::{init_logging, App, LifecycleState};

#[derive(Parser)]
#[command(name = "voice-ledger")]
#[command(about = "Record, play back and catalogue voice clips")]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Id of the user clips are archived for
    #[arg(long, global = true, requires = "username")]
    user_id: Option<String>,

    /// Name of the user clips are archived for
    #[arg(long, global = true, requires = "user_id")]
    username: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record from the input device until Ctrl+C (or --seconds elapse)
    Record {
        /// Session the clip belongs to
        #[arg(short, long)]
        session: String,

        /// Stop automatically after this many seconds
        #[arg(long)]
        seconds: Option<f64>,

        /// Metadata tag as key=value (repeatable)
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,
    },
    /// Play a clip until it ends or Ctrl+C
    Play {
        /// Clip file to play
        #[arg(required_unless_present = "last")]
        path: Option<PathBuf>,

        /// Play the most recent archived clip
        #[arg(long, conflicts_with = "path")]
        last: bool,
    },
    /// Print the playable length of a clip
    Duration { path: PathBuf },
    /// List archived clips, newest first
    List {
        #[arg(long)]
        session: Option<String>,

        /// Earliest start, as YYYY-MM-DD (UTC) or RFC 3339
        #[arg(long, value_parser = parse_from)]
        from: Option<DateTime<Utc>>,

        /// Latest start, inclusive; a bare date covers the whole day
        #[arg(long, value_parser = parse_to)]
        to: Option<DateTime<Utc>>,
    },
    /// Change the title of an archived clip
    Rename { id: u64, title: String },
    /// Replace the notes and keywords of an archived clip
    Annotate {
        id: u64,

        #[arg(long, default_value = "")]
        notes: String,

        /// Keyword to tag the clip with (repeatable)
        #[arg(long = "keyword")]
        keywords: Vec<String>,
    },
    /// Remove a clip from the library
    Delete {
        id: u64,

        /// Also delete the clip file
        #[arg(long)]
        remove_file: bool,
    },
    /// Wrap a raw 16-bit PCM file in a WAV container
    Wrap {
        pcm: PathBuf,
        wav: PathBuf,

        #[arg(long, default_value_t = VOICE_SAMPLE_RATE)]
        rate: u32,

        #[arg(long, default_value_t = 1)]
        channels: u16,

        #[arg(long, default_value_t = 16)]
        bits: u16,
    },
    /// List input devices
    Devices,
}

fn parse_tag(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {:?}", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("tag key is empty".to_string());
    }
    Ok((key.to_string(), value.trim().to_string()))
}

fn parse_from(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    parse_bound(raw, false)
}

fn parse_to(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    parse_bound(raw, true)
}

fn parse_bound(raw: &str, end_of_day: bool) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| format!("expected YYYY-MM-DD or RFC 3339, got {:?}", raw))?;
    let at = if end_of_day {
        date.and_hms_nano_opt(23, 59, 59, 999_999_999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    at.map(|naive| naive.and_utc())
        .ok_or_else(|| format!("invalid date {:?}", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();
    init_logging();

    let cli = Cli::parse();
    let settings_path = match cli.settings.clone() {
        Some(path) => path,
        None => default_settings_path()?,
    };
    let settings = load_settings(&settings_path);
    let user = match (cli.user_id, cli.username) {
        (Some(id), Some(username)) => Some(User { id, username }),
        _ => None,
    };

    match cli.command {
        Command::Record {
            session,
            seconds,
            tags,
        } => {
            let app = App::build(settings)?;
            app.library.set_user(user);
            record(app, &session, seconds, tags.into_iter().collect()).await
        }
        Command::Play { path, .. } => {
            let app = App::build(settings)?;
            let path = match path {
                Some(path) => path,
                None => match app.library.last_recording()? {
                    Some(clip) => clip.file_path,
                    None => bail!("The library is empty"),
                },
            };
            play(app, &path).await
        }
        Command::Duration { path } => {
            println!("{:.3}", probe_duration(&path).await);
            Ok(())
        }
        Command::List { session, from, to } => {
            let store = JsonClipStore::open(settings.library_path())?;
            let clips = if from.is_some() || to.is_some() {
                let mut clips = store.recordings_between(
                    from.unwrap_or(DateTime::<Utc>::MIN_UTC),
                    to.unwrap_or(DateTime::<Utc>::MAX_UTC),
                )?;
                if let Some(name) = &session {
                    clips.retain(|c| &c.session_name == name);
                }
                clips
            } else {
                match session {
                    Some(name) => store.recordings_for_session(&name)?,
                    None => store.all_recordings()?,
                }
            };
            for clip in &clips {
                print_clip(clip);
            }
            Ok(())
        }
        Command::Rename { id, title } => {
            let store = JsonClipStore::open(settings.library_path())?;
            let clip = store.rename(id, &title)?;
            print_clip(&clip);
            Ok(())
        }
        Command::Annotate { id, notes, keywords } => {
            let store = JsonClipStore::open(settings.library_path())?;
            let clip = store.annotate(id, &notes, &keywords)?;
            print_clip(&clip);
            if !clip.keywords.is_empty() {
                println!("      keywords: {}", clip.keywords.join(", "));
            }
            Ok(())
        }
        Command::Delete { id, remove_file } => {
            let library = RecordingLibrary::new(JsonClipStore::open(settings.library_path())?);
            let clip = library.delete(id, remove_file)?;
            println!("Deleted clip {} ({})", id, clip.file_path.display());
            Ok(())
        }
        Command::Wrap {
            pcm,
            wav,
            rate,
            channels,
            bits,
        } => {
            let len = convert_raw_pcm(&pcm, &wav, PcmFormat::new(rate, channels, bits))
                .with_context(|| format!("Failed to wrap {}", pcm.display()))?;
            println!("Wrote {} ({} data bytes)", wav.display(), len);
            Ok(())
        }
        Command::Devices => {
            for device in CpalInput::list_devices()? {
                println!(
                    "{:>2}{} {} ({} Hz, {} ch)",
                    device.index,
                    if device.is_default { "*" } else { " " },
                    device.name,
                    device.default_sample_rate,
                    device.channels
                );
            }
            Ok(())
        }
    }
}

async fn record(app: App, session: &str, seconds: Option<f64>, metadata: Metadata) -> Result<()> {
    let mut notifications = app.coordinator.subscribe();
    if !app.coordinator.start_recording(session, metadata).await? {
        bail!("Could not start recording: the recorder is busy");
    }
    println!("Recording session {:?} - press Ctrl+C to stop", session);

    let limit = async {
        match seconds {
            Some(secs) if secs > 0.0 => tokio::time::sleep(Duration::from_secs_f64(secs)).await,
            _ => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(limit);

    let mut elapsed = Duration::ZERO;
    let mut level = 0.0f32;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut limit => break,
            notification = notifications.recv() => match notification {
                Some(Notification::TimeUpdated(t)) => {
                    elapsed = t;
                    print_meter(elapsed, level);
                }
                Some(Notification::AmplitudeUpdated(a)) => level = a,
                Some(Notification::StateChanged(LifecycleState::Idle)) | None => break,
                Some(Notification::StateChanged(_)) => {}
            },
        }
    }
    println!();

    let clip = app.coordinator.stop_recording().await?;
    let outcome = match clip {
        Some(clip) => app
            .library
            .archive(clip)
            .map(|id| println!("Saved clip {}", id))
            .map_err(anyhow::Error::from),
        None => Err(anyhow::anyhow!("Recording ended without a clip")),
    };
    app.shutdown().await?;
    outcome
}

async fn play(app: App, path: &Path) -> Result<()> {
    if !app.coordinator.start_playback(path).await? {
        app.shutdown().await?;
        bail!("Nothing to play in {}", path.display());
    }
    println!("Playing {} - press Ctrl+C to stop", path.display());

    let mut status = app.coordinator.watch_status();
    loop {
        if status.borrow_and_update().state == LifecycleState::Idle {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                app.coordinator.stop().await?;
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    app.shutdown().await?;
    Ok(())
}

fn print_meter(elapsed: Duration, level: f32) {
    let width = (level.clamp(0.0, 1.0) * 40.0).round() as usize;
    print!("\r{:>7.1}s |{:<40}|", elapsed.as_secs_f64(), "#".repeat(width));
    let _ = std::io::stdout().flush();
}

fn print_clip(clip: &RecordedClip) {
    println!(
        "{:>4}  {}  {:>7.2}s  {:<16} {:<20} {}",
        clip.id.map(|id| id.to_string()).unwrap_or_default(),
        clip.recorded_at().format("%Y-%m-%d %H:%M:%S"),
        clip.duration_secs,
        clip.session_name,
        clip.display_title(),
        clip.device_used()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bare_dates_cover_the_whole_day() {
        let from = parse_from("2024-01-01").unwrap();
        let to = parse_to("2024-01-01").unwrap();
        assert_eq!(from, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert!(to > Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 59).unwrap());
        assert!(to < Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn rfc3339_bounds_are_taken_as_given() {
        let at = parse_to("2024-01-01T12:30:00+02:00").unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap());
        assert!(parse_from("yesterday").is_err());
        assert!(parse_from("2024-02-30").is_err());
    }
}
