//! Recipient resolution — turns a run target into (user, chat id) pairs.
//!
//! Resolution runs on the caller's connection so the enqueue path can resolve
//! and insert inside a single transaction.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgExecutor, Postgres, QueryBuilder};

use courier_common::types::{Recipient, RunTarget};

/// A validated audience selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetSpec {
    All,
    Vip,
    Role(String),
    Users(Vec<i64>),
    ChannelSubscribers,
}

impl TargetSpec {
    pub fn kind(&self) -> RunTarget {
        match self {
            TargetSpec::All => RunTarget::All,
            TargetSpec::Vip => RunTarget::Vip,
            TargetSpec::Role(_) => RunTarget::Role,
            TargetSpec::Users(_) => RunTarget::Users,
            TargetSpec::ChannelSubscribers => RunTarget::ChannelSubscribers,
        }
    }

    pub fn role(&self) -> Option<&str> {
        match self {
            TargetSpec::Role(role) => Some(role),
            _ => None,
        }
    }

    pub fn user_ids(&self) -> Option<&[i64]> {
        match self {
            TargetSpec::Users(ids) => Some(ids),
            _ => None,
        }
    }

    /// Rebuild a spec from the discriminated columns stored on a run.
    pub fn from_stored(
        target: RunTarget,
        role: Option<&str>,
        user_ids: Option<&[i64]>,
    ) -> Option<Self> {
        match target {
            RunTarget::All => Some(TargetSpec::All),
            RunTarget::Vip => Some(TargetSpec::Vip),
            RunTarget::ChannelSubscribers => Some(TargetSpec::ChannelSubscribers),
            RunTarget::Role => role.map(|r| TargetSpec::Role(r.to_string())),
            RunTarget::Users => user_ids.map(|ids| TargetSpec::Users(ids.to_vec())),
        }
    }
}

/// De-duplicate by chat id (first occurrence wins), drop blank addresses,
/// then apply the optional recipient cap.
pub fn prepare_recipients(raw: Vec<Recipient>, limit: Option<usize>) -> Vec<Recipient> {
    let mut seen = HashSet::with_capacity(raw.len());
    let mut recipients: Vec<Recipient> = raw
        .into_iter()
        .filter_map(|r| {
            let chat_id = r.chat_id.trim();
            if chat_id.is_empty() || !seen.insert(chat_id.to_string()) {
                return None;
            }
            Some(Recipient {
                user_id: r.user_id,
                chat_id: chat_id.to_string(),
            })
        })
        .collect();

    if let Some(limit) = limit {
        recipients.truncate(limit);
    }
    recipients
}

/// Active channel subscribers, oldest first.
pub async fn fetch_active_subscribers<'e, E>(executor: E) -> Result<Vec<Recipient>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as(
        r#"
        SELECT user_id, chat_id
        FROM bot_subscribers
        WHERE is_active = TRUE
        ORDER BY id
        "#,
    )
    .fetch_all(executor)
    .await
}

/// Users with a chat id, minus addresses the subscriber registry has
/// deactivated. Target-specific predicates are appended.
const USER_RECIPIENTS_SQL: &str = r#"
    SELECT u.id AS user_id, BTRIM(u.telegram_chat_id) AS chat_id
    FROM users u
    WHERE u.telegram_chat_id IS NOT NULL
      AND BTRIM(u.telegram_chat_id) <> ''
      AND NOT EXISTS (
          SELECT 1 FROM bot_subscribers s
          WHERE s.chat_id = BTRIM(u.telegram_chat_id) AND s.is_active = FALSE
      )
"#;

/// Postgres-backed resolver.
#[derive(Debug, Clone)]
pub struct RecipientResolver {
    vip_min_orders: i64,
}

impl RecipientResolver {
    pub fn new(vip_min_orders: i64) -> Self {
        Self { vip_min_orders }
    }

    /// Resolve the raw (possibly duplicated) recipient list for `target`.
    pub async fn resolve(
        &self,
        conn: &mut PgConnection,
        target: &TargetSpec,
    ) -> Result<Vec<Recipient>, sqlx::Error> {
        let mut query = QueryBuilder::<Postgres>::new(USER_RECIPIENTS_SQL);

        match target {
            TargetSpec::All => {}
            TargetSpec::Role(role) => {
                query.push(" AND u.role = ").push_bind(role.clone());
            }
            TargetSpec::Vip => {
                query
                    .push(
                        " AND (SELECT COUNT(*) FROM orders o \
                         WHERE o.user_id = u.id AND o.status = 'completed') >= ",
                    )
                    .push_bind(self.vip_min_orders);
            }
            TargetSpec::Users(ids) => {
                query.push(" AND u.id = ANY(").push_bind(ids.clone()).push(")");
            }
            TargetSpec::ChannelSubscribers => return fetch_active_subscribers(conn).await,
        }

        query.push(" ORDER BY u.id");
        query.build_query_as::<Recipient>().fetch_all(conn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient(user_id: i64, chat_id: &str) -> Recipient {
        Recipient {
            user_id: Some(user_id),
            chat_id: chat_id.to_string(),
        }
    }

    #[test]
    fn test_prepare_dedupes_by_chat_id() {
        let raw = vec![
            recipient(1, "100"),
            recipient(2, "200"),
            recipient(3, "100"),
            recipient(4, " 200 "),
        ];
        let out = prepare_recipients(raw, None);
        assert_eq!(out, vec![recipient(1, "100"), recipient(2, "200")]);
    }

    #[test]
    fn test_prepare_drops_blank_addresses() {
        let out = prepare_recipients(vec![recipient(1, "  "), recipient(2, "7")], None);
        assert_eq!(out, vec![recipient(2, "7")]);
    }

    #[test]
    fn test_prepare_applies_limit_after_dedupe() {
        let raw = vec![
            recipient(1, "a"),
            recipient(2, "a"),
            recipient(3, "b"),
            recipient(4, "c"),
        ];
        let out = prepare_recipients(raw, Some(2));
        assert_eq!(out, vec![recipient(1, "a"), recipient(3, "b")]);
    }

    #[test]
    fn test_from_stored_requires_discriminated_fields() {
        assert_eq!(
            TargetSpec::from_stored(RunTarget::Role, Some("admin"), None),
            Some(TargetSpec::Role("admin".into()))
        );
        assert_eq!(TargetSpec::from_stored(RunTarget::Role, None, None), None);
        assert_eq!(
            TargetSpec::from_stored(RunTarget::Users, None, Some(&[1, 2])),
            Some(TargetSpec::Users(vec![1, 2]))
        );
        assert_eq!(
            TargetSpec::from_stored(RunTarget::Vip, None, None),
            Some(TargetSpec::Vip)
        );
    }
}
