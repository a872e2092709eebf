// Daily Summary Pipeline
// Condenses raw daily events into narrative memory bullets, via the model
// when enabled and through a deterministic fallback otherwise.
use std::sync::Arc;

use serde_json::{json, Value};

use steward_core::{estimate_text_tokens, ConfigStore, Result};
use steward_providers::LlmCaller;
use steward_store::{DailyMemoryStore, MemoryIndexStore};
use steward_types::{ChatMessage, LlmRequest};

const SUMMARY_MAX_INPUT_TOKENS: u64 = 4000;
const SUMMARY_MAX_RECURSION_DEPTH: usize = 6;
const SUMMARY_MODEL_OUTPUT_TOKENS: u64 = 220;

#[derive(Debug, Clone)]
pub struct SummaryEntry {
    pub speaker: String,
    pub text: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessedJobs {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub jobs: Vec<Value>,
}

pub struct MemoryPipeline {
    daily: Arc<DailyMemoryStore>,
    index: Arc<MemoryIndexStore>,
    llm: Arc<dyn LlmCaller>,
    config: ConfigStore,
}

fn clean_text(value: &str, max_chars: usize) -> String {
    let mut joined = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.len() > max_chars {
        joined.truncate(max_chars);
    }
    joined
}

fn entry_line(entry: &SummaryEntry) -> String {
    format!("- [{}] {}", entry.speaker, entry.text)
}

fn entries_token_estimate(entries: &[SummaryEntry]) -> u64 {
    let text = entries.iter().map(entry_line).collect::<Vec<_>>().join("\n");
    estimate_text_tokens(&text)
}

fn is_low_signal(entry: &SummaryEntry) -> bool {
    let speaker = entry.speaker.to_lowercase();
    let text = entry.text.trim().to_lowercase();

    if !matches!(
        speaker.as_str(),
        "user" | "main_agent" | "task_agent_event" | "worker_event"
    ) {
        return true;
    }
    if text.len() < 8 {
        return true;
    }
    if matches!(speaker.as_str(), "worker_event" | "task_agent_event") && text.len() < 20 {
        return true;
    }
    matches!(
        text.as_str(),
        "thanks" | "thank you" | "ok" | "okay" | "cool" | "nice" | "yes" | "no" | "sounds good"
            | "got it"
    )
}

/// Deterministic 4-bullet narrative built from the highest-signal entries.
fn narrative_fallback(entries: &[SummaryEntry]) -> String {
    if entries.is_empty() {
        return "- What user wanted: no clear request captured.\n\
                - Key decisions: none recorded.\n\
                - What was executed: no concrete actions recorded.\n\
                - Final state: no stable outcome captured."
            .to_string();
    }

    let texts_for = |speakers: &[&str]| -> Vec<&str> {
        entries
            .iter()
            .filter(|entry| speakers.contains(&entry.speaker.to_lowercase().as_str()))
            .map(|entry| entry.text.trim())
            .filter(|text| !text.is_empty())
            .collect()
    };
    let user_msgs = texts_for(&["user"]);
    let agent_msgs = texts_for(&["main_agent"]);
    let task_msgs = texts_for(&["task_agent_event", "worker_event"]);

    let key_user = if user_msgs.is_empty() {
        "no clear request captured.".to_string()
    } else {
        user_msgs.iter().take(2).copied().collect::<Vec<_>>().join("; ")
    };
    let key_agent = if agent_msgs.is_empty() {
        "no explicit recommendation recorded.".to_string()
    } else {
        agent_msgs.iter().take(2).copied().collect::<Vec<_>>().join("; ")
    };
    let key_tasks = if task_msgs.is_empty() {
        "no concrete task lifecycle events recorded.".to_string()
    } else {
        task_msgs
            .iter()
            .rev()
            .take(2)
            .rev()
            .copied()
            .collect::<Vec<_>>()
            .join("; ")
    };
    let final_state = agent_msgs
        .last()
        .copied()
        .unwrap_or("no stable outcome captured.");

    format!(
        "- What user wanted: {key_user}\n\
         - Key decisions: {key_agent}\n\
         - What was executed: {key_tasks}\n\
         - Final state: {final_state}"
    )
}

fn summary_prompt(raw_lines: &str) -> String {
    format!(
        "Summarize this raw daily transcript into concise narrative memory bullets.\n\
         Transcript format:\n\
         - [user] text from human\n\
         - [main_agent] assistant reply\n\
         - [worker_event] worker-to-main event payload\n\
         - [task_agent_event] central scheduler/task-agent lifecycle event\n\
         - Other entries may exist; ignore low-signal/internal noise.\n\n\
         Requirements:\n\
         - Use this exact 4-bullet structure:\n\
         \x20 - What user wanted\n\
         \x20 - Key decisions\n\
         \x20 - What was executed\n\
         \x20 - Final state\n\
         - Focus only on meaningful user-agent collaboration and task outcomes.\n\
         - Do not include routes, internal metadata, tool call traces, or telemetry counts.\n\
         - Mention next step only if explicit.\n\
         - Keep it concise and factual.\n\n\
         Transcript:\n{raw_lines}"
    )
}

impl MemoryPipeline {
    pub fn new(
        daily: Arc<DailyMemoryStore>,
        index: Arc<MemoryIndexStore>,
        llm: Arc<dyn LlmCaller>,
        config: ConfigStore,
    ) -> Self {
        Self {
            daily,
            index,
            llm,
            config,
        }
    }

    pub fn daily(&self) -> &Arc<DailyMemoryStore> {
        &self.daily
    }

    pub fn index(&self) -> &Arc<MemoryIndexStore> {
        &self.index
    }

    async fn model_enabled(&self) -> bool {
        self.config.get().await.memory.daily_summary_use_model
    }

    async fn summarize_batch(&self, entries: &[SummaryEntry], use_model: bool) -> String {
        let signal: Vec<&SummaryEntry> =
            entries.iter().filter(|entry| !is_low_signal(entry)).collect();
        let for_summary: Vec<SummaryEntry> = if signal.is_empty() {
            entries.to_vec()
        } else {
            signal.into_iter().cloned().collect()
        };

        if use_model {
            let mut raw_lines = for_summary
                .iter()
                .map(entry_line)
                .collect::<Vec<_>>()
                .join("\n");
            raw_lines.truncate(12_000);
            let request = LlmRequest::new(vec![
                ChatMessage::system("You write compact, practical memory summaries."),
                ChatMessage::user(summary_prompt(&raw_lines)),
            ])
            .with_model("low");
            let mut request = request;
            request.max_output_tokens = Some(SUMMARY_MODEL_OUTPUT_TOKENS);
            let response = self.llm.call(request).await;
            if response.ok {
                if let Some(text) = response.text.as_deref() {
                    let compact = text.split_whitespace().collect::<Vec<_>>().join(" ");
                    if !compact.is_empty() {
                        return compact;
                    }
                }
            }
        }

        narrative_fallback(&for_summary)
    }

    /// Recursive segmentation: halve oversized transcripts, summarize each
    /// segment, then summarize the segment summaries.
    pub async fn summarize_entries(&self, entries: &[SummaryEntry]) -> String {
        let use_model = self.model_enabled().await;
        self.summarize_recursive(entries, use_model, 0).await
    }

    async fn summarize_recursive(
        &self,
        entries: &[SummaryEntry],
        use_model: bool,
        depth: usize,
    ) -> String {
        if entries.is_empty() {
            return "- No daily transcript entries to summarize.".to_string();
        }
        if !use_model || depth >= SUMMARY_MAX_RECURSION_DEPTH {
            return self.summarize_batch(entries, use_model).await;
        }
        if entries_token_estimate(entries) <= SUMMARY_MAX_INPUT_TOKENS || entries.len() <= 4 {
            return self.summarize_batch(entries, use_model).await;
        }

        let mid = (entries.len() / 2).max(1);
        let left = Box::pin(self.summarize_recursive(&entries[..mid], use_model, depth + 1)).await;
        let right = Box::pin(self.summarize_recursive(&entries[mid..], use_model, depth + 1)).await;
        let merged = vec![
            SummaryEntry {
                speaker: "segment_summary".to_string(),
                text: format!("segment_left: {left}"),
            },
            SummaryEntry {
                speaker: "segment_summary".to_string(),
                text: format!("segment_right: {right}"),
            },
        ];
        self.summarize_batch(&merged, use_model).await
    }

    async fn load_day_entries(&self, day: &str) -> Result<Vec<SummaryEntry>> {
        let events = self.daily.list_day_events(day).await?;
        Ok(events
            .into_iter()
            .filter_map(|event| {
                let text = clean_text(&event.text, 4000);
                if text.is_empty() {
                    return None;
                }
                Some(SummaryEntry {
                    speaker: clean_text(&event.kind, 80),
                    text,
                })
            })
            .collect())
    }

    /// Summarize one day from its raw events, upsert the snapshot, and
    /// mark the day summarized (optionally finalized).
    pub async fn summarize_day_from_raw(
        &self,
        day: &str,
        reason: &str,
        session_id: &str,
        finalize: bool,
    ) -> Result<Value> {
        let entries = self.load_day_entries(day).await?;
        let summary_text = self.summarize_entries(&entries).await;
        let rendered = format!(
            "- Summary reason: {reason}\n- Day event entries: {}\n{summary_text}",
            entries.len()
        );
        self.daily
            .write_summary_snapshot(day, &rendered, Some(session_id))
            .await?;
        let status = self
            .index
            .mark_day_summarized(day, entries.len() as u64, finalize)
            .await?;
        Ok(json!({
            "ok": true,
            "source": "daily_summary_pipeline",
            "day": day,
            "summary_entries": entries.len(),
            "finalize": finalize,
            "status": serde_json::to_value(&status)?,
        }))
    }

    /// Drain up to `max_jobs` pending summary jobs. Days strictly before
    /// today finalize as part of the pass.
    pub async fn process_pending_jobs(&self, max_jobs: usize, session_id: &str) -> ProcessedJobs {
        let mut out = ProcessedJobs {
            processed: 0,
            completed: 0,
            failed: 0,
            jobs: Vec::new(),
        };
        let today = self.daily.local_day();

        while out.processed < max_jobs.max(1) {
            let claimed = match self.index.claim_next_summary_job().await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("summary job claim failed: {err}");
                    break;
                }
            };
            out.processed += 1;
            let finalize = !claimed.day.is_empty() && claimed.day < today;
            let reason = format!("queued:{}", claimed.reason);

            match self
                .summarize_day_from_raw(&claimed.day, &reason, session_id, finalize)
                .await
            {
                Ok(_) => {
                    if let Err(err) = self
                        .index
                        .complete_summary_job(claimed.job_id, true, None)
                        .await
                    {
                        tracing::warn!("summary job completion failed: {err}");
                    }
                    out.completed += 1;
                    out.jobs.push(json!({
                        "job_id": claimed.job_id,
                        "day": claimed.day,
                        "ok": true,
                    }));
                }
                Err(err) => {
                    let detail = err.to_string();
                    let _ = self
                        .index
                        .complete_summary_job(claimed.job_id, false, Some(&detail))
                        .await;
                    out.failed += 1;
                    out.jobs.push(json!({
                        "job_id": claimed.job_id,
                        "day": claimed.day,
                        "ok": false,
                        "error": detail,
                    }));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use steward_store::{ensure_schema, DbQueue};
    use steward_types::LlmResponse;

    struct CountingLlm {
        calls: AtomicU32,
        reply: Option<String>,
    }

    #[async_trait]
    impl LlmCaller for CountingLlm {
        async fn call(&self, _request: LlmRequest) -> LlmResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Some(text) => LlmResponse {
                    ok: true,
                    provider: Some("scripted".to_string()),
                    model: None,
                    text: Some(text.clone()),
                    tool_calls: None,
                    finish_reason: Some("stop".to_string()),
                    usage: None,
                    error: None,
                    attempts_used: 1,
                    attempts_configured: 1,
                    retryable_error: false,
                    retry_backoff_schedule_sec: vec![],
                },
                None => LlmResponse::failure("provider offline"),
            }
        }
    }

    async fn pipeline(
        dir: &tempfile::TempDir,
        use_model: bool,
        reply: Option<String>,
    ) -> (MemoryPipeline, Arc<CountingLlm>) {
        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            format!(r#"{{"timezone": "UTC", "memory": {{"daily_summary_use_model": {use_model}}}}}"#),
        )
        .unwrap();
        let config = ConfigStore::new(dir.path(), config_path);

        let queue = DbQueue::new(dir.path().join("core.db"), 5000);
        ensure_schema(&queue).await.unwrap();
        let daily = Arc::new(DailyMemoryStore::new(queue.clone(), Some("UTC".to_string())));
        let index = Arc::new(MemoryIndexStore::new(queue));
        let llm = Arc::new(CountingLlm {
            calls: AtomicU32::new(0),
            reply,
        });
        (
            MemoryPipeline::new(daily, index, llm.clone(), config),
            llm,
        )
    }

    fn entry(speaker: &str, text: &str) -> SummaryEntry {
        SummaryEntry {
            speaker: speaker.to_string(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn fallback_produces_four_bullets_without_model() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, llm) = pipeline(&dir, false, None).await;

        let summary = pipeline
            .summarize_entries(&[
                entry("user", "please prepare the weekly report today"),
                entry("main_agent", "drafted the report and saved it to outputs"),
                entry("task_agent_event", "run_finished status=done summary=report uploaded"),
            ])
            .await;
        assert!(summary.contains("- What user wanted: please prepare the weekly report"));
        assert!(summary.contains("- Key decisions:"));
        assert!(summary.contains("- What was executed:"));
        assert!(summary.contains("- Final state:"));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn low_signal_entries_are_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(&dir, false, None).await;
        let summary = pipeline
            .summarize_entries(&[
                entry("user", "thanks"),
                entry("telemetry", "route=chat latency=12ms"),
                entry("user", "set up the job application tracker for me"),
            ])
            .await;
        assert!(summary.contains("job application tracker"));
        assert!(!summary.contains("latency"));
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_narrative() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, llm) = pipeline(&dir, true, None).await;
        let summary = pipeline
            .summarize_entries(&[entry("user", "summarize my day for the record please")])
            .await;
        assert!(summary.contains("- What user wanted:"));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_transcript_segments_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, llm) = pipeline(&dir, true, Some("segment summary".to_string())).await;
        let entries: Vec<SummaryEntry> = (0..40)
            .map(|idx| entry("user", &format!("message {idx} {}", "x".repeat(600))))
            .collect();
        let summary = pipeline.summarize_entries(&entries).await;
        assert_eq!(summary, "segment summary");
        // Two halves plus the merge pass at minimum.
        assert!(llm.calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn jobs_drain_write_snapshot_and_finalize_past_days() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline(&dir, false, None).await;
        let yesterday = pipeline
            .daily()
            .day_for(chrono::Utc::now() - chrono::Duration::days(1));

        pipeline
            .daily()
            .append_event(
                "remember to renew the passport",
                "user",
                Some("s1"),
                Some(&yesterday),
                None,
            )
            .await
            .unwrap();
        pipeline
            .index()
            .increment_day_message_count(&yesterday, 1)
            .await
            .unwrap();
        pipeline
            .index()
            .enqueue_summary_job(&yesterday, "turn_threshold")
            .await
            .unwrap();

        let processed = pipeline.process_pending_jobs(5, "memory_summary_worker").await;
        assert_eq!(processed.processed, 1);
        assert_eq!(processed.completed, 1);

        let status = pipeline
            .index()
            .get_day_status(&yesterday)
            .await
            .unwrap()
            .unwrap();
        assert!(status.is_finalized);
        assert_eq!(status.messages_since_last_summary, 0);

        let snapshot = pipeline
            .daily()
            .get_summary_snapshot(&yesterday)
            .await
            .unwrap()
            .unwrap();
        assert!(snapshot.contains("Summary reason: queued:turn_threshold"));
        assert!(snapshot.contains("renew the passport"));
    }
}
