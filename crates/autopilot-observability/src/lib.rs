//! Structured logging for the control plane.
//!
//! Components report state changes through [`ControlPlaneEvent`], a builder
//! that correlates a tenant, an agent, and the record a step touched, and
//! lands on the `autopilot.obs` target. The engine binary calls
//! [`init_logging`] once to stand up the console layer plus a daily-rotated
//! JSON file with bounded retention.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Days, NaiveDate, Utc};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_TARGET: &str = "autopilot.obs";
const LOG_FILE_STEM: &str = "autopilot-engine";

/// One structured record per control-plane state change.
///
/// Only `component`, `event`, and `tenant_id` are mandatory; everything else
/// is attached where the step has it. Consumed by `emit`/`emit_warn`/
/// `emit_error`.
#[derive(Debug, Clone, Copy)]
pub struct ControlPlaneEvent<'a> {
    component: &'a str,
    event: &'a str,
    tenant_id: &'a str,
    agent_name: Option<&'a str>,
    request_id: Option<&'a str>,
    record: Option<(&'a str, &'a str)>,
    trigger_id: Option<&'a str>,
    status: Option<&'a str>,
    cached: Option<bool>,
    elapsed_ms: Option<u64>,
    detail: Option<&'a str>,
}

impl<'a> ControlPlaneEvent<'a> {
    pub fn new(component: &'a str, event: &'a str, tenant_id: &'a str) -> Self {
        Self {
            component,
            event,
            tenant_id,
            agent_name: None,
            request_id: None,
            record: None,
            trigger_id: None,
            status: None,
            cached: None,
            elapsed_ms: None,
            detail: None,
        }
    }

    pub fn agent(mut self, agent_name: &'a str) -> Self {
        self.agent_name = Some(agent_name);
        self
    }

    pub fn request(mut self, request_id: &'a str) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// The document this step touched, as (kind, id).
    pub fn record(mut self, kind: &'a str, id: &'a str) -> Self {
        self.record = Some((kind, id));
        self
    }

    pub fn trigger(mut self, trigger_id: &'a str) -> Self {
        self.trigger_id = Some(trigger_id);
        self
    }

    pub fn status(mut self, status: &'a str) -> Self {
        self.status = Some(status);
        self
    }

    pub fn cached(mut self, cached: bool) -> Self {
        self.cached = Some(cached);
        self
    }

    pub fn elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = Some(elapsed_ms);
        self
    }

    pub fn detail(mut self, detail: &'a str) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn emit(self) {
        self.dispatch(Level::INFO);
    }

    pub fn emit_warn(self) {
        self.dispatch(Level::WARN);
    }

    pub fn emit_error(self) {
        self.dispatch(Level::ERROR);
    }

    fn dispatch(self, level: Level) {
        let (record_kind, record_id) = self.record.unwrap_or(("", ""));
        // tracing requires a const level per call site; expand the field
        // list once and pick the arm at runtime.
        macro_rules! log_event {
            ($level:ident) => {
                tracing::$level!(
                    target: LOG_TARGET,
                    component = self.component,
                    event = self.event,
                    tenant_id = self.tenant_id,
                    agent = self.agent_name.unwrap_or(""),
                    request_id = self.request_id.unwrap_or(""),
                    record_kind,
                    record_id,
                    trigger_id = self.trigger_id.unwrap_or(""),
                    status = self.status.unwrap_or(""),
                    cached = self.cached.unwrap_or(false),
                    elapsed_ms = self.elapsed_ms.unwrap_or(0),
                    detail = self.detail.unwrap_or(""),
                    "control_plane_event"
                )
            };
        }
        match level {
            Level::ERROR => log_event!(error),
            Level::WARN => log_event!(warn),
            _ => log_event!(info),
        }
    }
}

/// Mask customer content (message bodies, reply text) before it reaches a
/// log line. Length and a short hash survive for correlation.
pub fn redact_text(input: &str) -> String {
    use std::hash::{Hash, Hasher};

    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    trimmed.hash(&mut hasher);
    format!(
        "[redacted len={} hash={:08x}]",
        trimmed.chars().count(),
        hasher.finish() as u32
    )
}

/// Where the engine keeps its log files, under the state directory.
pub fn default_logs_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("logs")
}

/// Stand up process logging: a compact console layer plus a daily-rotated
/// JSON file under `logs_dir`, pruning files older than `retention_days`.
/// The returned guard must outlive the process for the file writer to flush.
pub fn init_logging(logs_dir: &Path, retention_days: u64) -> anyhow::Result<WorkerGuard> {
    fs::create_dir_all(logs_dir)?;
    sweep_stale_logs(logs_dir, retention_days)?;

    let appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(LOG_FILE_STEM)
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_ansi(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init()
        .ok();

    Ok(guard)
}

/// Delete rotated files whose date stamp has aged out. File names look like
/// `autopilot-engine.2026-08-01.jsonl`; anything that does not parse is left
/// alone. Returns how many files were removed.
fn sweep_stale_logs(logs_dir: &Path, retention_days: u64) -> anyhow::Result<usize> {
    let cutoff = Utc::now()
        .date_naive()
        .checked_sub_days(Days::new(retention_days))
        .unwrap_or_else(|| Utc::now().date_naive());

    let mut removed = 0;
    for entry in fs::read_dir(logs_dir)? {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(_) => continue,
        };
        if !path.is_file() {
            continue;
        }
        let Some(date) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(rotation_date)
        else {
            continue;
        };
        if date < cutoff && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

fn rotation_date(file_name: &str) -> Option<NaiveDate> {
    let stamped = file_name
        .strip_prefix(LOG_FILE_STEM)?
        .strip_prefix('.')?
        .strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(stamped, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_text_masks_content_but_keeps_length() {
        let raw = "Hi Priya! A 2pm slot with Anjali just opened up";
        let redacted = redact_text(raw);
        assert!(redacted.starts_with("[redacted len=47"));
        assert!(!redacted.contains("Priya"));
        assert_eq!(redact_text("  \t "), "");
    }

    #[test]
    fn redaction_is_stable_for_correlation() {
        assert_eq!(redact_text("yes"), redact_text(" yes "));
        assert_ne!(redact_text("yes"), redact_text("no"));
    }

    #[test]
    fn default_logs_dir_nests_under_state() {
        let dir = default_logs_dir(Path::new("/var/lib/autopilot"));
        assert_eq!(dir, PathBuf::from("/var/lib/autopilot/logs"));
    }

    #[test]
    fn rotation_dates_parse_only_our_files() {
        assert_eq!(
            rotation_date("autopilot-engine.2026-08-01.jsonl"),
            NaiveDate::from_ymd_opt(2026, 8, 1)
        );
        assert!(rotation_date("autopilot-engine.not-a-date.jsonl").is_none());
        assert!(rotation_date("other-service.2026-08-01.jsonl").is_none());
        assert!(rotation_date("autopilot-engine.jsonl").is_none());
    }

    #[test]
    fn stale_logs_are_swept_and_fresh_ones_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let old = tmp.path().join("autopilot-engine.2000-01-01.jsonl");
        let today = Utc::now().date_naive().format("%Y-%m-%d");
        let fresh = tmp.path().join(format!("autopilot-engine.{today}.jsonl"));
        let foreign = tmp.path().join("notes.txt");
        for path in [&old, &fresh, &foreign] {
            fs::write(path, "{}").unwrap();
        }

        let removed = sweep_stale_logs(tmp.path(), 14).unwrap();
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(foreign.exists());
    }

    #[test]
    fn events_emit_at_every_level() {
        let event = ControlPlaneEvent::new("gap_fill", "gap_filled", "t-1")
            .agent("gap_fill_agent")
            .record("booking", "b123")
            .trigger("gap-1")
            .status("ok")
            .cached(false)
            .elapsed_ms(12)
            .detail("revenue=800");
        event.emit();
        event.emit_warn();
        event.emit_error();
    }
}
