//! Turns a session's flat message log into bounded (user, assistant) pairs.

use crate::models::{Message, Role};
use crate::services::store::ChatStore;
use service_core::error::AppError;
use tracing::debug;
use uuid::Uuid;

/// One prior exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextPair {
    pub user: Message,
    pub assistant: Message,
}

/// How many recent messages to read so that `limit_pairs` pairs survive a
/// few unpaired stragglers.
pub fn fetch_window(limit_pairs: usize, exclude_latest_user: bool) -> usize {
    2 * limit_pairs + 2 + usize::from(exclude_latest_user)
}

/// Pair up messages.
///
/// `newest_first` is the recent tail of the log, newest message first, as
/// returned by the store. A `user` message immediately followed by an
/// `assistant` message forms a pair; anything else is dropped. Only the last
/// `limit_pairs` pairs are kept, oldest first. With `exclude_latest_user`
/// the most recent `user` message is removed before pairing.
pub fn assemble(
    mut newest_first: Vec<Message>,
    limit_pairs: usize,
    exclude_latest_user: bool,
) -> Vec<ContextPair> {
    if exclude_latest_user {
        if let Some(pos) = newest_first.iter().position(|m| m.role == Role::User) {
            newest_first.remove(pos);
        }
    }

    newest_first.reverse();
    let log = newest_first;

    let mut pairs = Vec::new();
    let mut i = 0;
    while i < log.len() {
        match (log[i].role, log.get(i + 1).map(|m| m.role)) {
            (Role::User, Some(Role::Assistant)) => {
                pairs.push(ContextPair {
                    user: log[i].clone(),
                    assistant: log[i + 1].clone(),
                });
                i += 2;
            }
            _ => i += 1,
        }
    }

    let skip = pairs.len().saturating_sub(limit_pairs);
    pairs.split_off(skip)
}

/// Read the recent log of `session_id` and assemble its context.
pub async fn load_context(
    store: &dyn ChatStore,
    session_id: Uuid,
    limit_pairs: usize,
    exclude_latest_user: bool,
) -> Result<Vec<ContextPair>, AppError> {
    if limit_pairs == 0 {
        return Ok(Vec::new());
    }

    let recent = store
        .recent_messages(session_id, fetch_window(limit_pairs, exclude_latest_user))
        .await?;
    let fetched = recent.len();
    let pairs = assemble(recent, limit_pairs, exclude_latest_user);

    debug!(
        session_id = %session_id,
        fetched,
        pairs = pairs.len(),
        "Assembled conversation context"
    );
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a log from a compact description such as "UAUAU", oldest first,
    /// and return it newest first the way the store does.
    fn log(shape: &str) -> Vec<Message> {
        let session_id = Uuid::new_v4();
        let mut messages: Vec<Message> = shape
            .chars()
            .enumerate()
            .map(|(i, c)| match c {
                'U' => Message::user(session_id, format!("U{}", i / 2 + 1), vec![]),
                _ => Message::assistant(
                    Uuid::new_v4(),
                    session_id,
                    format!("A{}", i / 2 + 1),
                    0,
                    None,
                ),
            })
            .collect();
        messages.reverse();
        messages
    }

    fn labels(pairs: &[ContextPair]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|p| (p.user.content().to_string(), p.assistant.content().to_string()))
            .collect()
    }

    fn pair(u: &str, a: &str) -> (String, String) {
        (u.to_string(), a.to_string())
    }

    #[test]
    fn empty_log_gives_empty_context() {
        assert!(assemble(Vec::new(), 5, false).is_empty());
        assert!(assemble(Vec::new(), 5, true).is_empty());
    }

    #[test]
    fn trailing_unpaired_user_is_excluded() {
        let pairs = assemble(log("UAUAU"), 5, false);
        assert_eq!(labels(&pairs), vec![pair("U1", "A1"), pair("U2", "A2")]);
    }

    #[test]
    fn keeps_only_the_last_limit_pairs_oldest_first() {
        let pairs = assemble(log("UAUAUAUAUAUA"), 5, false);
        assert_eq!(
            labels(&pairs),
            vec![
                pair("U2", "A2"),
                pair("U3", "A3"),
                pair("U4", "A4"),
                pair("U5", "A5"),
                pair("U6", "A6"),
            ]
        );
    }

    #[test]
    fn never_exceeds_limit() {
        for limit in 0..4 {
            assert!(assemble(log("UAUAUAUAUA"), limit, false).len() <= limit);
        }
    }

    #[test]
    fn stragglers_are_dropped_without_breaking_later_pairs() {
        // Two user messages in a row, two replies in a row, then a clean pair.
        let pairs = assemble(log("UUAAUA"), 5, false);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].user.content(), "U1");
        assert_eq!(pairs[1].user.content(), "U3");
    }

    #[test]
    fn exclude_latest_user_removes_only_the_newest_user_message() {
        let pairs = assemble(log("UAUAU"), 5, true);
        assert_eq!(labels(&pairs), vec![pair("U1", "A1"), pair("U2", "A2")]);

        // The newest user message is not last in the log: its pair is lost.
        let pairs = assemble(log("UAUA"), 5, true);
        assert_eq!(labels(&pairs), vec![pair("U1", "A1")]);
    }

    #[test]
    fn fetch_window_tolerates_stragglers() {
        assert_eq!(fetch_window(5, false), 12);
        assert_eq!(fetch_window(5, true), 13);
    }
}
