// Daily Memory Store
// Append-only raw events plus upsertable per-day summary snapshots, keyed
// by local day. Includes the one-shot legacy file migration.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use steward_core::{day_key_for, local_day_key, Result, StewardError};

use crate::queue::{DbQueue, SqlRequest};

const RAW_FALLBACK_MAX_LINES: usize = 80;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyMemoryEvent {
    pub event_id: i64,
    pub day: String,
    pub event_time: String,
    pub session_id: Option<String>,
    pub kind: String,
    pub text: String,
    pub layer: String,
}

pub struct DailyMemoryStore {
    queue: Arc<DbQueue>,
    timezone: Option<String>,
    legacy_root: Option<PathBuf>,
}

impl DailyMemoryStore {
    pub fn new(queue: Arc<DbQueue>, timezone: Option<String>) -> Self {
        Self {
            queue,
            timezone,
            legacy_root: None,
        }
    }

    /// Enable the legacy `memory/daily/{raw,summary}` markdown migration
    /// under the given repository root.
    pub fn with_legacy_root(mut self, root: impl AsRef<Path>) -> Self {
        self.legacy_root = Some(root.as_ref().join("memory").join("daily"));
        self
    }

    pub fn local_day(&self) -> String {
        local_day_key(self.timezone.as_deref())
    }

    pub fn day_for(&self, instant: DateTime<Utc>) -> String {
        day_key_for(instant, self.timezone.as_deref())
    }

    async fn write(&self, sql: &str, params: Vec<Value>) -> Result<u64> {
        let response = self.queue.execute(SqlRequest::write(sql, params)).await;
        if !response.ok {
            return Err(StewardError::Memory(response.error.unwrap_or_default()));
        }
        Ok(response.rows_affected)
    }

    async fn read(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Value>> {
        let response = self
            .queue
            .execute(SqlRequest::read(sql, params).with_max_rows(2000))
            .await;
        if !response.ok {
            return Err(StewardError::Memory(response.error.unwrap_or_default()));
        }
        Ok(response.rows)
    }

    /// Append one raw (or summary-layer) event. Empty text is rejected.
    pub async fn append_event(
        &self,
        text: &str,
        kind: &str,
        session_id: Option<&str>,
        day: Option<&str>,
        event_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let clean = text.trim();
        if clean.is_empty() {
            return Err(StewardError::Validation("event text is empty".to_string()));
        }
        let instant = event_time.unwrap_or_else(Utc::now);
        let day_key = day
            .map(str::to_string)
            .unwrap_or_else(|| self.day_for(instant));
        self.write(
            "INSERT INTO daily_memory_events (
                day, event_time, session_id, kind, text, layer, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'raw', ?6)",
            vec![
                json!(day_key),
                json!(instant.to_rfc3339()),
                json!(session_id),
                json!(if kind.trim().is_empty() { "note" } else { kind }),
                json!(clean),
                json!(Utc::now().to_rfc3339()),
            ],
        )
        .await?;
        Ok(())
    }

    /// Raw events for one day in (event_time, event_id) order.
    pub async fn list_day_events(&self, day: &str) -> Result<Vec<DailyMemoryEvent>> {
        let rows = self
            .read(
                "SELECT event_id, day, event_time, session_id, kind, text, layer
                 FROM daily_memory_events
                 WHERE day = ?1 AND layer = 'raw'
                 ORDER BY event_time ASC, event_id ASC",
                vec![json!(day)],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| DailyMemoryEvent {
                event_id: row["event_id"].as_i64().unwrap_or(0),
                day: row["day"].as_str().unwrap_or_default().to_string(),
                event_time: row["event_time"].as_str().unwrap_or_default().to_string(),
                session_id: row["session_id"].as_str().map(str::to_string),
                kind: row["kind"].as_str().unwrap_or_default().to_string(),
                text: row["text"].as_str().unwrap_or_default().to_string(),
                layer: row["layer"].as_str().unwrap_or_default().to_string(),
            })
            .collect())
    }

    /// Upsert the rendered summary snapshot for a day.
    pub async fn write_summary_snapshot(
        &self,
        day: &str,
        text: &str,
        session_id: Option<&str>,
    ) -> Result<()> {
        let body = text.trim();
        if body.is_empty() {
            return Err(StewardError::Validation("summary text is empty".to_string()));
        }
        let updated_at = Utc::now();
        let bulleted = if body.starts_with('-') || body.starts_with('#') {
            body.to_string()
        } else {
            format!("- {body}")
        };
        let rendered = format!(
            "# Daily Summary {day}\n\n- Last updated: [{}]{}\n\n{bulleted}\n",
            updated_at.format("%H:%M:%S"),
            session_id
                .map(|sid| format!(" ({sid})"))
                .unwrap_or_default(),
        );
        self.write(
            "INSERT INTO daily_memory_summaries (day, updated_at, session_id, text)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(day) DO UPDATE SET
                updated_at = excluded.updated_at,
                session_id = excluded.session_id,
                text = excluded.text",
            vec![
                json!(day),
                json!(updated_at.to_rfc3339()),
                json!(session_id),
                json!(rendered),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_summary_snapshot(&self, day: &str) -> Result<Option<String>> {
        let rows = self
            .read(
                "SELECT text FROM daily_memory_summaries WHERE day = ?1",
                vec![json!(day)],
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row["text"].as_str())
            .map(str::to_string))
    }

    fn render_raw_fallback(day: &str, events: &[DailyMemoryEvent]) -> String {
        let tail_start = events.len().saturating_sub(RAW_FALLBACK_MAX_LINES);
        let mut lines = Vec::new();
        for event in &events[tail_start..] {
            let time = DateTime::parse_from_rfc3339(&event.event_time)
                .map(|parsed| parsed.format("%H:%M:%S").to_string())
                .unwrap_or_else(|_| "??:??:??".to_string());
            let session = event
                .session_id
                .as_deref()
                .map(|sid| format!(" ({sid})"))
                .unwrap_or_default();
            lines.push(format!("- [{time}] [{}]{session} {}", event.kind, event.text));
        }
        let body = if lines.is_empty() {
            "- (no raw entries)\n".to_string()
        } else {
            format!("{}\n", lines.join("\n"))
        };
        format!(
            "# Daily Raw Snapshot {day}\n\nSummary snapshot not available yet; this is a trimmed raw fallback.\n\n{body}"
        )
    }

    /// For each of the last `days` local days, return the summary snapshot
    /// or a trimmed raw fallback when no summary exists yet. Keys are
    /// stable context-item ids.
    pub async fn load_recent_daily_memory(&self, days: u32) -> Result<BTreeMap<String, String>> {
        let mut loaded = BTreeMap::new();
        if days == 0 {
            return Ok(loaded);
        }
        let now = Utc::now();
        for offset in 0..days {
            let day = self.day_for(now - Duration::days(offset as i64));
            if let Some(summary) = self.get_summary_snapshot(&day).await? {
                if !summary.trim().is_empty() {
                    loaded.insert(format!("memory/db/summary/{day}.md"), summary);
                    continue;
                }
            }
            let events = self.list_day_events(&day).await?;
            if !events.is_empty() {
                loaded.insert(
                    format!("memory/db/raw/{day}.md#raw_fallback"),
                    Self::render_raw_fallback(&day, &events),
                );
            }
        }
        Ok(loaded)
    }

    /// One-shot migration of legacy per-day markdown files into the events
    /// and summary tables. Days already present in the tables are skipped.
    pub async fn migrate_legacy_files(&self) -> Result<u64> {
        let Some(base) = &self.legacy_root else {
            return Ok(0);
        };
        let mut migrated = 0u64;

        let raw_dir = base.join("raw");
        if raw_dir.is_dir() {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(&raw_dir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().map(|ext| ext == "md").unwrap_or(false))
                .collect();
            paths.sort();
            for path in paths {
                let Some(day) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                let existing = self
                    .read(
                        "SELECT COUNT(*) AS count FROM daily_memory_events WHERE day = ?1",
                        vec![json!(day)],
                    )
                    .await?;
                if existing
                    .first()
                    .and_then(|row| row["count"].as_u64())
                    .unwrap_or(0)
                    > 0
                {
                    continue;
                }
                let content = std::fs::read_to_string(&path).unwrap_or_default();
                for line in content.lines() {
                    let Some((time, kind, session_id, text)) = parse_legacy_line(line) else {
                        continue;
                    };
                    let event_time = format!("{day}T{time}+00:00");
                    self.write(
                        "INSERT INTO daily_memory_events (
                            day, event_time, session_id, kind, text, layer, created_at
                        ) VALUES (?1, ?2, ?3, ?4, ?5, 'raw', ?6)",
                        vec![
                            json!(day),
                            json!(event_time),
                            json!(session_id),
                            json!(kind),
                            json!(text),
                            json!(Utc::now().to_rfc3339()),
                        ],
                    )
                    .await?;
                    migrated += 1;
                }
            }
        }

        let summary_dir = base.join("summary");
        if summary_dir.is_dir() {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(&summary_dir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().map(|ext| ext == "md").unwrap_or(false))
                .collect();
            paths.sort();
            for path in paths {
                let Some(day) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                let content = std::fs::read_to_string(&path).unwrap_or_default();
                if content.trim().is_empty() {
                    continue;
                }
                let inserted = self
                    .write(
                        "INSERT INTO daily_memory_summaries (day, updated_at, session_id, text)
                         VALUES (?1, ?2, NULL, ?3)
                         ON CONFLICT(day) DO NOTHING",
                        vec![json!(day), json!(Utc::now().to_rfc3339()), json!(content)],
                    )
                    .await?;
                migrated += inserted;
            }
        }

        Ok(migrated)
    }
}

/// `- [HH:MM:SS] [kind] (session)? text`
fn parse_legacy_line(line: &str) -> Option<(String, String, Option<String>, String)> {
    let rest = line.trim().strip_prefix("- [")?;
    let (time, rest) = rest.split_once("] [")?;
    let (kind, rest) = rest.split_once(']')?;
    let rest = rest.trim_start();
    let (session_id, text) = if let Some(stripped) = rest.strip_prefix('(') {
        let (session, text) = stripped.split_once(')')?;
        (Some(session.to_string()), text.trim_start())
    } else {
        (None, rest)
    };
    if text.trim().is_empty() {
        return None;
    }
    Some((
        time.to_string(),
        if kind.trim().is_empty() { "note" } else { kind.trim() }.to_string(),
        session_id,
        text.trim().to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(dir: &tempfile::TempDir) -> DailyMemoryStore {
        let queue = DbQueue::new(dir.path().join("core.db"), 5000);
        crate::schema::ensure_schema(&queue).await.unwrap();
        DailyMemoryStore::new(queue, Some("UTC".to_string())).with_legacy_root(dir.path())
    }

    #[tokio::test]
    async fn events_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let day = store.local_day();

        store
            .append_event("first message", "user", Some("s1"), None, None)
            .await
            .unwrap();
        store
            .append_event("second message", "main_agent", Some("s1"), None, None)
            .await
            .unwrap();

        let events = store.list_day_events(&day).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].text, "first message");
        assert_eq!(events[1].kind, "main_agent");
        assert!(store
            .append_event("   ", "user", None, None, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn summary_snapshot_upserts_and_wins_over_raw() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let day = store.local_day();

        store
            .append_event("raw line", "user", None, None, None)
            .await
            .unwrap();
        let recent = store.load_recent_daily_memory(1).await.unwrap();
        assert!(recent.keys().next().unwrap().contains("raw_fallback"));

        store
            .write_summary_snapshot(&day, "did the thing", Some("s1"))
            .await
            .unwrap();
        store
            .write_summary_snapshot(&day, "did the thing, updated", Some("s1"))
            .await
            .unwrap();

        let recent = store.load_recent_daily_memory(1).await.unwrap();
        let (key, text) = recent.iter().next().unwrap();
        assert!(key.contains("summary"));
        assert!(text.contains("did the thing, updated"));
        assert!(text.starts_with(&format!("# Daily Summary {day}")));
    }

    #[tokio::test]
    async fn raw_fallback_keeps_most_recent_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let day = store.local_day();
        for idx in 0..100 {
            store
                .append_event(&format!("line {idx}"), "user", None, None, None)
                .await
                .unwrap();
        }

        let recent = store.load_recent_daily_memory(1).await.unwrap();
        let text = recent.values().next().unwrap();
        assert!(!text.contains("line 19\n"));
        assert!(text.contains("line 99"));
        assert_eq!(
            text.lines().filter(|line| line.starts_with("- [")).count(),
            RAW_FALLBACK_MAX_LINES
        );
        let _ = day;
    }

    #[tokio::test]
    async fn legacy_files_migrate_once() {
        let dir = tempfile::tempdir().unwrap();
        let raw_dir = dir.path().join("memory").join("daily").join("raw");
        std::fs::create_dir_all(&raw_dir).unwrap();
        std::fs::write(
            raw_dir.join("2026-01-05.md"),
            "- [09:15:00] [user] (s1) hello from the past\n- not an entry\n- [09:16:00] [main_agent] reply\n",
        )
        .unwrap();
        let summary_dir = dir.path().join("memory").join("daily").join("summary");
        std::fs::create_dir_all(&summary_dir).unwrap();
        std::fs::write(summary_dir.join("2026-01-05.md"), "# old summary\n").unwrap();

        let store = store(&dir).await;
        let migrated = store.migrate_legacy_files().await.unwrap();
        assert_eq!(migrated, 3);

        let events = store.list_day_events("2026-01-05").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].session_id.as_deref(), Some("s1"));
        assert_eq!(events[0].event_time, "2026-01-05T09:15:00+00:00");

        // Second pass is a no-op.
        assert_eq!(store.migrate_legacy_files().await.unwrap(), 0);
    }
}
