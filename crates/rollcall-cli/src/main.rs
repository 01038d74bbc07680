use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDate};
use clap::{Parser, Subcommand};
use rollcall_core::{AttendanceLedger, EventKind, Outcome, Timestamp, EMBEDDING_DIM};
use rollcall_store::{SqliteStore, SubjectProfile};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face recognition attendance CLI")]
struct Cli {
    /// Database path (default: $ROLLCALL_DB_PATH or ~/.local/share/rollcall/attendance.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a subject, replacing any existing one with the same id
    Register {
        /// Stable subject identifier (e.g. student number)
        #[arg(long)]
        id: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        middle_name: Option<String>,
        #[arg(long)]
        course: Option<String>,
        #[arg(long)]
        year_level: Option<String>,
        #[arg(long)]
        section: Option<String>,
        #[arg(long)]
        email: Option<String>,
        /// Reference descriptor: a JSON array of 128 numbers, or @path to a file holding one
        #[arg(long)]
        embedding: String,
    },
    /// List registered subjects
    List,
    /// Record an arrival or departure by hand
    Record {
        subject: String,
        /// arrival | departure (also: in | out)
        #[arg(short, long, default_value = "arrival")]
        kind: EventKind,
        /// RFC 3339 time of the event (default: now)
        #[arg(long)]
        at: Option<String>,
    },
    /// Print attendance between two dates (inclusive)
    Report {
        /// First day, YYYY-MM-DD (default: today)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day, YYYY-MM-DD (default: today)
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Only this subject
        #[arg(long)]
        subject: Option<String>,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Set status and remarks on an existing attendance row
    Annotate {
        subject: String,
        /// Day of the row, YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// e.g. present, late, excused
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        remarks: Option<String>,
    },
    /// Show database status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(default_db_path);
    let store = SqliteStore::open(&db_path)
        .await
        .with_context(|| format!("failed to open database {}", db_path.display()))?;

    match cli.command {
        Commands::Register {
            id,
            first_name,
            last_name,
            middle_name,
            course,
            year_level,
            section,
            email,
            embedding,
        } => {
            let embedding = read_embedding(&embedding)?;
            let profile = SubjectProfile {
                subject_id: id,
                first_name,
                last_name,
                middle_name,
                course,
                year_level,
                section,
                email,
            };
            let name = profile.display_name();
            let subject_id = profile.subject_id.clone();
            store.register_subject(profile, &embedding).await?;
            println!("Registered {subject_id} ({name})");
        }
        Commands::List => {
            let subjects = store.list_subjects().await?;
            if subjects.is_empty() {
                println!("No subjects registered");
            }
            for s in subjects {
                println!(
                    "{:<12} {:<28} {}",
                    s.subject_id,
                    s.display_name(),
                    s.course.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Record { subject, kind, at } => {
            let timestamp = match at {
                Some(text) => DateTime::parse_from_rfc3339(&text)
                    .with_context(|| format!("invalid --at time '{text}'"))?,
                None => Local::now().fixed_offset(),
            };
            let store = Arc::new(store);
            let ledger = AttendanceLedger::new(store.clone(), store);
            let date = timestamp.date_naive();
            match ledger.record_event(&subject, kind, timestamp).await? {
                Outcome::Recorded => println!("recorded {kind} for {subject} at {timestamp}"),
                Outcome::Ignored => {
                    println!("ignored: {kind} already recorded for {subject} on {date}")
                }
            }
            if let Some(rec) = ledger.get_record(&subject, date).await? {
                println!(
                    "{date}: in {}, out {}",
                    clock_time(rec.time_in),
                    clock_time(rec.time_out)
                );
            }
        }
        Commands::Report {
            from,
            to,
            subject,
            json,
        } => {
            let today = Local::now().date_naive();
            let from = from.unwrap_or(today);
            let to = to.unwrap_or(today);
            if from > to {
                bail!("--from {from} is after --to {to}");
            }
            let rows = store.attendance_report(from, to, subject).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No attendance between {from} and {to}");
            } else {
                println!(
                    "{:<10} {:<12} {:<28} {:<8} {:<8} {:<10} REMARKS",
                    "DATE", "ID", "NAME", "IN", "OUT", "STATUS"
                );
                for r in rows {
                    println!(
                        "{:<10} {:<12} {:<28} {:<8} {:<8} {:<10} {}",
                        r.date,
                        r.subject_id,
                        format!("{} {}", r.first_name, r.last_name),
                        clock_time(r.time_in),
                        clock_time(r.time_out),
                        r.status.as_deref().unwrap_or("-"),
                        r.remarks.as_deref().unwrap_or(""),
                    );
                }
            }
        }
        Commands::Annotate {
            subject,
            date,
            status,
            remarks,
        } => {
            if status.is_none() && remarks.is_none() {
                bail!("nothing to set; pass --status and/or --remarks");
            }
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            if !store
                .annotate_attendance(&subject, date, status, remarks)
                .await?
            {
                bail!("no attendance for {subject} on {date}");
            }
            println!("annotated {subject} on {date}");
        }
        Commands::Status => {
            let status = serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "database": db_path.display().to_string(),
                "subjects": store.subject_count().await?,
                "attendance_rows": store.attendance_count().await?,
                "embedding_dim": EMBEDDING_DIM,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

fn default_db_path() -> PathBuf {
    std::env::var("ROLLCALL_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| rollcall_store::default_db_path())
}

fn clock_time(t: Option<Timestamp>) -> String {
    t.map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".into())
}

fn read_embedding(arg: &str) -> Result<serde_json::Value> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read embedding file {path}"))?,
        None => arg.to_string(),
    };
    serde_json::from_str(text.trim()).context("embedding is not valid JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_record_kind_alias() {
        let cli = Cli::try_parse_from(["rollcall", "record", "S001", "--kind", "out"]).unwrap();
        match cli.command {
            Commands::Record { subject, kind, at } => {
                assert_eq!(subject, "S001");
                assert_eq!(kind, EventKind::Departure);
                assert!(at.is_none());
            }
            _ => panic!("expected record"),
        }
    }

    #[test]
    fn test_parse_report_dates() {
        let cli = Cli::try_parse_from([
            "rollcall",
            "report",
            "--from",
            "2026-03-01",
            "--to",
            "2026-03-31",
        ])
        .unwrap();
        match cli.command {
            Commands::Report { from, to, .. } => {
                assert_eq!(from, NaiveDate::from_ymd_opt(2026, 3, 1));
                assert_eq!(to, NaiveDate::from_ymd_opt(2026, 3, 31));
            }
            _ => panic!("expected report"),
        }
    }

    #[test]
    fn test_parse_annotate() {
        let cli = Cli::try_parse_from([
            "rollcall",
            "annotate",
            "S001",
            "--date",
            "2026-03-02",
            "--status",
            "excused",
        ])
        .unwrap();
        match cli.command {
            Commands::Annotate {
                subject,
                date,
                status,
                remarks,
            } => {
                assert_eq!(subject, "S001");
                assert_eq!(date, NaiveDate::from_ymd_opt(2026, 3, 2));
                assert_eq!(status.as_deref(), Some("excused"));
                assert!(remarks.is_none());
            }
            _ => panic!("expected annotate"),
        }
    }

    #[test]
    fn test_clock_time() {
        use chrono::{FixedOffset, TimeZone};
        let t = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2026, 3, 2, 8, 5, 9)
            .unwrap();
        assert_eq!(clock_time(Some(t)), "08:05:09");
        assert_eq!(clock_time(None), "-");
    }

    #[test]
    fn test_read_inline_embedding() {
        let text = serde_json::to_string(&vec![0.5f32; EMBEDDING_DIM]).unwrap();
        let value = read_embedding(&text).unwrap();
        assert_eq!(value.as_array().unwrap().len(), EMBEDDING_DIM);
        assert!(read_embedding("[1, 2").is_err());
    }
}
