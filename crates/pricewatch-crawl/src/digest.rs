//! Weekly digest job: verified diffs from the lookback window, one email
//! per eligible user. The actual delivery is an external collaborator
//! behind the `EmailSender` trait.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use pricewatch_core::entitlements::resolve_entitlements;
use pricewatch_core::model::{Diff, Severity};
use pricewatch_storage::Store;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CrawlConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Logs instead of sending. Default when no provider is configured.
#[derive(Default)]
pub struct NoopEmailSender;

#[async_trait]
impl EmailSender for NoopEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(to = %message.to, subject = %message.subject, "digest email suppressed (no sender configured)");
        Ok(())
    }
}

/// Captures messages for tests.
#[derive(Default)]
pub struct RecordingEmailSender {
    sent: Mutex<Vec<EmailMessage>>,
}

impl RecordingEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DigestResult {
    pub considered: usize,
    pub sent: usize,
    pub skipped_no_email: usize,
    pub skipped_not_eligible: usize,
    pub skipped_recently_sent: usize,
    pub skipped_no_changes: usize,
}

pub struct DigestJob {
    store: Arc<dyn Store>,
    email: Arc<dyn EmailSender>,
    config: Arc<CrawlConfig>,
}

impl DigestJob {
    pub fn new(
        store: Arc<dyn Store>,
        email: Arc<dyn EmailSender>,
        config: Arc<CrawlConfig>,
    ) -> Self {
        Self {
            store,
            email,
            config,
        }
    }

    pub async fn run(&self) -> Result<DigestResult> {
        let now = Utc::now();
        let lookback_start = now - self.config.digest_lookback;
        let mut result = DigestResult::default();

        for user in self.store.list_users().await? {
            result.considered += 1;
            let Some(email) = user.email.clone() else {
                result.skipped_no_email += 1;
                continue;
            };
            let entitlements = resolve_entitlements(&user, &self.config.plan_rules, now);
            if !entitlements.can_receive_weekly_digest {
                result.skipped_not_eligible += 1;
                continue;
            }
            if let Some(last_sent) = user.last_digest_sent_at {
                if last_sent > lookback_start {
                    result.skipped_recently_sent += 1;
                    continue;
                }
            }
            let diffs = self
                .store
                .list_verified_diffs_since(user.user_id, lookback_start, self.config.digest_max_diffs)
                .await?;
            if diffs.is_empty() {
                result.skipped_no_changes += 1;
                continue;
            }

            let message = self.compose(&email, &diffs).await?;
            if let Err(err) = self.email.send(&message).await {
                warn!(user_id = %user.user_id, %err, "digest send failed");
                continue;
            }
            self.store
                .set_last_digest_sent_at(user.user_id, now)
                .await?;
            result.sent += 1;
        }

        info!(sent = result.sent, considered = result.considered, "digest run complete");
        Ok(result)
    }

    async fn compose(&self, email: &str, diffs: &[Diff]) -> Result<EmailMessage> {
        let mut severity_counts: HashMap<Severity, usize> = HashMap::new();
        for diff in diffs {
            *severity_counts.entry(diff.severity).or_default() += 1;
        }
        let high = severity_counts.get(&Severity::High).copied().unwrap_or(0);
        let medium = severity_counts.get(&Severity::Medium).copied().unwrap_or(0);
        let low = severity_counts.get(&Severity::Low).copied().unwrap_or(0);

        let mut company_names: HashMap<Uuid, String> = HashMap::new();
        for diff in diffs {
            if let std::collections::hash_map::Entry::Vacant(entry) =
                company_names.entry(diff.company_id)
            {
                let name = self
                    .store
                    .get_company(diff.company_id)
                    .await?
                    .map(|c| c.name)
                    .unwrap_or_else(|| "unknown competitor".to_string());
                entry.insert(name);
            }
        }
        let line_for = |diff: &Diff| -> String {
            let name = company_names
                .get(&diff.company_id)
                .cloned()
                .unwrap_or_default();
            format!(
                "[{}] {} — {} updated, {} added, {} removed price points",
                diff.severity.as_str(),
                name,
                diff.normalized
                    .buckets
                    .iter()
                    .map(|b| b.updated.len())
                    .sum::<usize>(),
                diff.normalized
                    .buckets
                    .iter()
                    .map(|b| b.added.len())
                    .sum::<usize>(),
                diff.normalized
                    .buckets
                    .iter()
                    .map(|b| b.removed.len())
                    .sum::<usize>(),
            )
        };

        let subject = format!(
            "Weekly competitor pricing digest: {} change{}",
            diffs.len(),
            if diffs.len() == 1 { "" } else { "s" }
        );
        let header = format!("{high} high / {medium} medium / {low} low severity changes this week");
        let text_lines: Vec<String> = diffs.iter().map(|d| line_for(d)).collect();
        let text_body = format!("{header}\n\n{}\n", text_lines.join("\n"));
        let html_items: Vec<String> = diffs
            .iter()
            .map(|d| format!("<li>{}</li>", line_for(d)))
            .collect();
        let html_body = format!("<p>{header}</p><ul>{}</ul>", html_items.join(""));

        Ok(EmailMessage {
            to: email.to_string(),
            subject,
            text_body,
            html_body,
        })
    }
}
