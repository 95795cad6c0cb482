use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use crate::error::GalleryError;
use crate::models::{JobEvent, JobPhase, JobStatus, JobSummary, ProgressEvent, format_size};
use crate::orchestrator::{Orchestrator, default_archive_name, is_link, parse_urls};
use crate::retry::RetryPolicy;
use crate::session::JobState;
use crate::state::is_valid_archive_name;
use crate::transport::{MessageId, Transport, edit_with_retry, send_with_retry};

pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
const SESSION_TTL: Duration = Duration::from_secs(6 * 60 * 60);

const HELP: &str = "Send one or more gallery URLs, one per line.\n\
    After the URLs you can name the archive or send /skip.\n\
    /cancel  stop the running job (downloaded images are still packaged)\n\
    /files   list archives\n\
    /file <name>    show an archive and its source URLs\n\
    /delete <name>  delete one archive\n\
    /deleteall      delete every archive";

/// Allows one update per `interval`; the first one passes immediately.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Turns chat input into pipeline calls and pipeline events into messages.
pub struct Bot {
    orchestrator: Arc<Orchestrator>,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    progress_interval: Duration,
    relays: Mutex<Vec<JoinHandle<()>>>,
}

impl Bot {
    pub fn new(orchestrator: Arc<Orchestrator>, transport: Arc<dyn Transport>) -> Self {
        Self {
            orchestrator,
            transport,
            retry: RetryPolicy::transport(),
            progress_interval: PROGRESS_INTERVAL,
            relays: Mutex::new(Vec::new()),
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Waits until every launched job has reported its result.
    pub async fn drain(&self) {
        let relays: Vec<_> = {
            let mut relays = self.relays.lock().unwrap_or_else(|e| e.into_inner());
            relays.drain(..).collect()
        };
        for relay in relays {
            let _ = relay.await;
        }
    }

    async fn reply(&self, chat: &str, text: &str) -> Option<MessageId> {
        match send_with_retry(self.transport.as_ref(), &self.retry, chat, text).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(chat, error = %e, "failed to send message");
                None
            }
        }
    }

    pub async fn handle(&self, user: &str, input: &str) {
        self.orchestrator.sessions().evict_idle(SESSION_TTL);

        let input = input.trim();
        if input.is_empty() {
            return;
        }
        let (command, argument) = match input.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (input, ""),
        };

        match command {
            "/start" => self.start(user).await,
            "/help" => {
                self.reply(user, HELP).await;
            }
            "/cancel" => self.cancel(user).await,
            "/skip" => self.skip(user).await,
            "/files" => self.list_files(user).await,
            "/file" => self.show_file(user, argument).await,
            "/delete" => self.delete_file(user, argument).await,
            "/deleteall" => self.delete_all(user).await,
            _ if command.starts_with('/') => {
                self.reply(user, "Unknown command. Send /help for usage.").await;
            }
            _ => self.text(user, input).await,
        }
    }

    /// Inline-button presses: `skip` for the naming step, `cancel` for the
    /// running job. The press is acknowledged before acting on it.
    pub async fn handle_callback(&self, user: &str, callback_id: &str, data: &str) {
        let (ack, command) = match data {
            "skip" => ("Using a generated name", "/skip"),
            "cancel" => ("Cancelling", "/cancel"),
            _ => ("Unknown action", ""),
        };
        if let Err(e) = self.transport.answer_callback(callback_id, ack).await {
            warn!(callback_id, error = %e, "failed to answer callback");
        }
        if !command.is_empty() {
            self.handle(user, command).await;
        }
    }

    async fn start(&self, user: &str) {
        let domains = self
            .orchestrator
            .registry()
            .list_domains()
            .map(|d| d.join(", "))
            .unwrap_or_default();
        let text = format!(
            "Send gallery URLs and get every image back as one ZIP archive.\n\
             Supported sites: {}\nOther sites are tried with every known strategy.\n\n{}",
            domains, HELP
        );
        self.reply(user, &text).await;
    }

    async fn cancel(&self, user: &str) {
        if self.orchestrator.cancel(user) {
            self.reply(user, "Cancelling... images downloaded so far will still be packaged.")
                .await;
        } else {
            self.orchestrator.sessions().reset(user);
            self.reply(user, "Nothing to cancel.").await;
        }
    }

    async fn skip(&self, user: &str) {
        match self.orchestrator.sessions().pending_urls(user) {
            Some(urls) => self.launch(user, urls, default_archive_name()).await,
            None => {
                self.reply(user, "Nothing to name. Send gallery URLs first.").await;
            }
        }
    }

    async fn text(&self, user: &str, input: &str) {
        let sessions = self.orchestrator.sessions();
        let urls = parse_urls(input);

        if sessions.state(user) == JobState::Processing {
            self.reply_busy(user).await;
            return;
        }

        let pending = sessions.pending_urls(user);
        if let Some(pending) = &pending {
            // a name like `http_dump` still counts as a name
            if !is_link(input) && is_valid_archive_name(input) {
                self.launch(user, pending.clone(), input.to_string()).await;
                return;
            }
        }

        if urls.is_empty() {
            let text = if pending.is_some() {
                "Invalid name: use 2-80 letters, digits, '-', '_' or '.', or send /skip."
            } else {
                "No valid URLs found. Send one gallery URL per line."
            };
            self.reply(user, text).await;
            return;
        }

        match sessions.stage(user, urls) {
            Ok(count) => {
                let text = format!(
                    "{} URL(s) received. Send more, a name for the archive, or /skip.",
                    count
                );
                self.reply(user, &text).await;
            }
            Err(GalleryError::AlreadyProcessing) => self.reply_busy(user).await,
            Err(e) => {
                self.reply(user, &format!("Could not accept URLs: {}", e)).await;
            }
        }
    }

    async fn reply_busy(&self, user: &str) {
        let name = self
            .orchestrator
            .sessions()
            .active_archive(user)
            .unwrap_or_default();
        let text = format!(
            "Already processing {}. Wait for it to finish or send /cancel.",
            name
        );
        self.reply(user, &text).await;
    }

    async fn launch(&self, user: &str, urls: Vec<String>, archive_name: String) {
        let (tx, rx) = mpsc::unbounded_channel();
        let total = urls.len();
        match self.orchestrator.submit(user, urls, Some(archive_name), tx) {
            Ok(_) => {
                let status = self
                    .reply(user, &format!("Processing {} gallery URL(s)...", total))
                    .await;
                let relay = tokio::spawn(relay_events(
                    Arc::clone(&self.transport),
                    self.retry.clone(),
                    user.to_string(),
                    status,
                    rx,
                    self.progress_interval,
                ));
                let mut relays = self.relays.lock().unwrap_or_else(|e| e.into_inner());
                relays.retain(|handle| !handle.is_finished());
                relays.push(relay);
            }
            Err(GalleryError::AlreadyProcessing) => self.reply_busy(user).await,
            Err(e) => {
                self.reply(user, &format!("Could not start: {}", e)).await;
            }
        }
    }

    async fn list_files(&self, user: &str) {
        let text = match self.orchestrator.store().list() {
            Ok(entries) if entries.is_empty() => "No archives yet.".to_string(),
            Ok(entries) => entries
                .iter()
                .map(|e| {
                    format!(
                        "{}  {}  {}",
                        e.base,
                        format_size(e.size_bytes),
                        e.modified.format("%Y-%m-%d %H:%M")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("Could not list archives: {}", e),
        };
        self.reply(user, &text).await;
    }

    async fn show_file(&self, user: &str, base: &str) {
        let store = self.orchestrator.store();
        let text = match store.get(base) {
            Ok(entry) => {
                let mut text = format!(
                    "{}\nSize: {}\nLink: {}",
                    entry.file_name,
                    format_size(entry.size_bytes),
                    self.orchestrator.settings().download_url(&entry.file_name)
                );
                if let Some(record) = entry.record {
                    text.push_str(&format!("\nImages: {}\nSources:", record.image_count));
                    for url in record.urls {
                        text.push_str("\n  ");
                        text.push_str(&url);
                    }
                }
                text
            }
            Err(e) => format!("{}", e),
        };
        self.reply(user, &text).await;
    }

    async fn delete_file(&self, user: &str, base: &str) {
        let text = match self.orchestrator.store().delete(base) {
            Ok(()) => format!("Deleted {}.", base),
            Err(e) => format!("{}", e),
        };
        self.reply(user, &text).await;
    }

    async fn delete_all(&self, user: &str) {
        let text = match self.orchestrator.store().delete_all() {
            Ok(count) => format!("Deleted {} archive(s).", count),
            Err(e) => format!("Could not delete archives: {}", e),
        };
        self.reply(user, &text).await;
    }
}

/// Forwards job events to the chat: progress at most once per `interval`
/// by editing the status message, the final summary always.
pub async fn relay_events(
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    chat: String,
    status: Option<MessageId>,
    mut events: mpsc::UnboundedReceiver<JobEvent>,
    interval: Duration,
) {
    let mut throttle = Throttle::new(interval);
    while let Some(event) = events.recv().await {
        match event {
            JobEvent::Progress(progress) => {
                if !throttle.ready() {
                    continue;
                }
                if let Some(id) = status {
                    let text = render_progress(&progress);
                    if let Err(e) =
                        edit_with_retry(transport.as_ref(), &retry, &chat, id, &text).await
                    {
                        warn!(chat = %chat, error = %e, "failed to update progress");
                    }
                }
            }
            JobEvent::Finished(summary) => {
                let text = render_summary(&summary);
                if let Err(e) = send_with_retry(transport.as_ref(), &retry, &chat, &text).await {
                    warn!(chat = %chat, error = %e, "failed to send result");
                }
                break;
            }
        }
    }
}

pub fn render_progress(progress: &ProgressEvent) -> String {
    match progress.phase {
        JobPhase::Extracting => format!(
            "Extracting: {}/{} galleries done, {} images found",
            progress.galleries_done, progress.galleries_total, progress.images_done
        ),
        JobPhase::Downloading => format!(
            "Downloading gallery {}/{} ({}): {}/{} images",
            progress.galleries_done + 1,
            progress.galleries_total,
            progress.current_gallery.as_deref().unwrap_or("-"),
            progress.images_done,
            progress.images_total
        ),
        JobPhase::Packaging => format!(
            "Packaging {}/{} images...",
            progress.images_done, progress.images_total
        ),
    }
}

pub fn render_summary(summary: &JobSummary) -> String {
    let mut text = match summary.status {
        JobStatus::Done | JobStatus::Partial => {
            let heading = if summary.status == JobStatus::Done {
                "Done"
            } else {
                "Partially done"
            };
            format!(
                "{}: {}/{} images\nArchive: {} ({})\nLink: {}",
                heading,
                summary.success_count,
                summary.total_count,
                summary.archive_file.as_deref().unwrap_or("-"),
                format_size(summary.artifact_size_bytes.unwrap_or(0)),
                summary.download_url.as_deref().unwrap_or("-")
            )
        }
        JobStatus::Cancelled => "Job cancelled; nothing was downloaded.".to_string(),
        JobStatus::Failed => format!(
            "Job failed: {}. Please send the URLs again.",
            summary.error.as_deref().unwrap_or("unknown error")
        ),
    };
    if !summary.failed_urls.is_empty() {
        text.push_str(&format!(
            "\n{} URL(s) could not be processed:",
            summary.failed_urls.len()
        ));
        for failed in &summary.failed_urls {
            text.push_str(&format!("\n  {} ({})", failed.url, failed.reason));
        }
    }
    text
}
