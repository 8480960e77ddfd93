// =============================================================================
// Operator command loop (spec §5 task 5, §6 "Operator commands")
// =============================================================================
//
// Long-polls the alert channel's inbox, authorizes each update against the
// configured chat and allow-list, applies at most one command, and persists
// both the poll offset and an audit entry before moving to the next update.
// =============================================================================

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;
use tracing::{info, warn};

use crate::alerts::telegram::{AlertChannel, Update};
use crate::persistence::keys::{audit_key, OPERATOR_LAST_UPDATE_ID_KEY};
use crate::persistence::kv::KvStore;
use crate::strategy::orchestrator::Orchestrator;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Status,
    Pause,
    Resume,
    RiskShow,
    RiskSet(Vec<(String, String)>),
    RiskReset,
    Help,
}

/// Parses Telegram command text (spec §6: "case-insensitive after `/`").
/// Returns `None` for anything that isn't a recognized command.
pub fn parse_command(text: &str) -> Option<Command> {
    let trimmed = text.trim().strip_prefix('/')?;
    let mut tokens = trimmed.split_whitespace();
    let head = tokens.next()?.to_ascii_lowercase();

    match head.as_str() {
        "status" => Some(Command::Status),
        "pause" => Some(Command::Pause),
        "resume" => Some(Command::Resume),
        "help" => Some(Command::Help),
        "risk" => match tokens.next()?.to_ascii_lowercase().as_str() {
            "show" => Some(Command::RiskShow),
            "reset" => Some(Command::RiskReset),
            "set" => {
                let pairs: Vec<(String, String)> = tokens
                    .filter_map(|kv| {
                        let (k, v) = kv.split_once('=')?;
                        Some((k.to_string(), v.to_string()))
                    })
                    .collect();
                Some(Command::RiskSet(pairs))
            }
            _ => None,
        },
        _ => None,
    }
}

const HELP_TEXT: &str = "Commands: status, pause, resume, risk show, risk set k=v ..., risk reset, help";

pub struct OperatorLoop {
    orchestrator: Arc<Orchestrator>,
    alerts: Arc<dyn AlertChannel>,
    store: Arc<dyn KvStore>,
    telegram_chat_id: Option<i64>,
    operator_allowed_user_ids: Vec<i64>,
    poll_timeout_secs: u64,
}

impl OperatorLoop {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        alerts: Arc<dyn AlertChannel>,
        store: Arc<dyn KvStore>,
        telegram_chat_id: Option<i64>,
        operator_allowed_user_ids: Vec<i64>,
        poll_timeout_secs: u64,
    ) -> Self {
        Self {
            orchestrator,
            alerts,
            store,
            telegram_chat_id,
            operator_allowed_user_ids,
            poll_timeout_secs,
        }
    }

    async fn last_update_id(&self) -> u64 {
        match self.store.get(OPERATOR_LAST_UPDATE_ID_KEY).await {
            Ok(Some(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    fn authorized(&self, message: &crate::alerts::telegram::Message) -> bool {
        if let Some(chat_id) = self.telegram_chat_id {
            if message.chat.id != chat_id {
                return false;
            }
        }
        if self.operator_allowed_user_ids.is_empty() {
            return true;
        }
        message
            .from
            .as_ref()
            .map(|u| self.operator_allowed_user_ids.contains(&u.id))
            .unwrap_or(false)
    }

    /// Runs until cancelled. Each iteration long-polls, processes whatever
    /// updates arrived, and advances the persisted offset one update at a
    /// time so a crash mid-batch never reprocesses an already-applied one.
    pub async fn run(&self) {
        let mut offset = self.last_update_id().await + 1;
        loop {
            let updates = match self.alerts.get_updates(offset, self.poll_timeout_secs).await {
                Ok(updates) => updates,
                Err(e) => {
                    warn!(error = %e, "operator poll failed, backing off");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };

            for update in updates {
                offset = update.update_id + 1;
                self.process_update(&update).await;
                if let Err(e) = self.store.set(OPERATOR_LAST_UPDATE_ID_KEY, &offset.to_string()).await {
                    warn!(error = %e, "failed to persist operator offset");
                }
            }
        }
    }

    async fn process_update(&self, update: &Update) {
        let Some(message) = &update.message else { return };
        let Some(text) = &message.text else { return };
        if !self.authorized(message) {
            info!(chat_id = message.chat.id, "ignoring command from unauthorized chat/user");
            return;
        }
        let Some(command) = parse_command(text) else { return };

        let reply = self.apply(&command, update, message).await;
        if let Err(e) = self.alerts.send(&reply).await {
            warn!(error = %e, "failed to send operator reply");
        }
    }

    async fn apply(&self, command: &Command, update: &Update, message: &crate::alerts::telegram::Message) -> String {
        let paused_before = self.orchestrator.is_paused();
        let risk_before = self.orchestrator.risk_snapshot();

        let reply = match command {
            Command::Status => self.orchestrator.status_text(),
            Command::Pause => {
                self.orchestrator.pause();
                "paused".to_string()
            }
            Command::Resume => {
                self.orchestrator.resume();
                "resumed".to_string()
            }
            Command::RiskShow => serde_json::to_string_pretty(&risk_before).unwrap_or_default(),
            Command::RiskSet(pairs) => {
                let rejected = self.orchestrator.risk_set(pairs);
                if rejected.is_empty() {
                    "risk limits updated".to_string()
                } else {
                    format!("updated with rejected keys: {}", rejected.join(", "))
                }
            }
            Command::RiskReset => {
                self.orchestrator.risk_reset();
                "risk limits reset to defaults".to_string()
            }
            Command::Help => HELP_TEXT.to_string(),
        };

        let paused_after = self.orchestrator.is_paused();
        let risk_after = self.orchestrator.risk_snapshot();
        self.record_audit(command, update, message, paused_before, paused_after, &risk_before, &risk_after)
            .await;
        reply
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_audit(
        &self,
        command: &Command,
        update: &Update,
        message: &crate::alerts::telegram::Message,
        paused_before: bool,
        paused_after: bool,
        risk_before: &crate::config::RiskLimits,
        risk_after: &crate::config::RiskLimits,
    ) {
        let now_ns = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
        let action = command_name(command);
        let mut entry = json!({
            "update_id": update.update_id,
            "time": now_ns / 1_000_000,
            "action": action,
            "command": format!("{:?}", command),
            "user_id": message.from.as_ref().map(|u| u.id),
            "chat_id": message.chat.id,
        });
        if let Some(username) = message.from.as_ref().and_then(|u| u.username.clone()) {
            entry["username"] = json!(username);
        }
        if matches!(command, Command::Pause | Command::Resume) {
            entry["paused_before"] = json!(paused_before);
            entry["paused_after"] = json!(paused_after);
        }
        if matches!(command, Command::RiskSet(_) | Command::RiskReset) {
            entry["risk_before"] = serde_json::to_value(risk_before).unwrap_or(json!(null));
            entry["risk_after"] = serde_json::to_value(risk_after).unwrap_or(json!(null));
        }

        let key = audit_key(now_ns, update.update_id);
        if let Err(e) = self.store.set(&key, &entry.to_string()).await {
            warn!(error = %e, "failed to persist operator audit entry");
        }
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Status => "status",
        Command::Pause => "pause",
        Command::Resume => "resume",
        Command::RiskShow => "risk_show",
        Command::RiskSet(_) => "risk_set",
        Command::RiskReset => "risk_reset",
        Command::Help => "help",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_is_case_insensitive_after_slash() {
        assert_eq!(parse_command("/STATUS"), Some(Command::Status));
        assert_eq!(parse_command("/Pause"), Some(Command::Pause));
    }

    #[test]
    fn parse_command_rejects_text_without_leading_slash() {
        assert_eq!(parse_command("status"), None);
    }

    #[test]
    fn parse_command_risk_set_collects_key_value_pairs() {
        let command = parse_command("/risk set max_notional_usd=9000 max_open_orders=4").unwrap();
        assert_eq!(
            command,
            Command::RiskSet(vec![
                ("max_notional_usd".to_string(), "9000".to_string()),
                ("max_open_orders".to_string(), "4".to_string()),
            ])
        );
    }

    #[test]
    fn parse_command_risk_set_ignores_malformed_pairs() {
        let command = parse_command("/risk set not_a_pair max_open_orders=4").unwrap();
        assert_eq!(command, Command::RiskSet(vec![("max_open_orders".to_string(), "4".to_string())]));
    }

    #[test]
    fn parse_command_unknown_subcommand_is_none() {
        assert_eq!(parse_command("/risk bogus"), None);
        assert_eq!(parse_command("/bogus"), None);
    }

    #[test]
    fn parse_command_risk_show_and_reset() {
        assert_eq!(parse_command("/risk show"), Some(Command::RiskShow));
        assert_eq!(parse_command("/risk reset"), Some(Command::RiskReset));
    }
}
