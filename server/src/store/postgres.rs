use async_trait::async_trait;
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    types::Json,
    PgPool, Postgres, QueryBuilder, Row,
};

use super::{Appended, ClaimOutcome, Repository, TicketInsert};
use crate::{
    error::{StoreError, StoreResult},
    types::{
        now_utc, new_id, Conversation, ConversationStatus, Message, MessageDraft, PageRequest,
        Sender, Ticket, TicketFilter, TicketPage, TicketStatus, Workload,
    },
};

const CONVERSATION_COLUMNS: &str =
    "id, customer_id, title, status, created_at, updated_at, last_sequence, offer_pending";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sequence, sender, content, created_at, idempotency_key";
const TICKET_COLUMNS: &str = "id, conversation_id, customer_id, agent_id, status, priority, reason, version, created_at, updated_at, resolved_at";

/// PostgreSQL engine. Sequencing relies on a row lock on the conversation,
/// the one-active-ticket rule on the partial unique index `idx_tickets_one_active`.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool and applies the embedded migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| StoreError::Backend(format!("migration failed: {err}")))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn corrupt(err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

fn parse_conversation_row(row: &PgRow) -> StoreResult<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        title: row.try_get("title")?,
        status: row
            .try_get::<String, _>("status")?
            .parse::<ConversationStatus>()
            .map_err(corrupt)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_sequence: row.try_get("last_sequence")?,
        offer_pending: row.try_get("offer_pending")?,
    })
}

fn parse_message_row(row: &PgRow) -> StoreResult<Message> {
    let Json(sender) = row.try_get::<Json<Sender>, _>("sender")?;
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sequence: row.try_get("sequence")?,
        sender,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
        idempotency_key: row.try_get("idempotency_key")?,
    })
}

fn parse_ticket_row(row: &PgRow) -> StoreResult<Ticket> {
    Ok(Ticket {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        customer_id: row.try_get("customer_id")?,
        agent_id: row.try_get("agent_id")?,
        status: row
            .try_get::<String, _>("status")?
            .parse()
            .map_err(corrupt)?,
        priority: row
            .try_get::<String, _>("priority")?
            .parse()
            .map_err(corrupt)?,
        reason: row.try_get("reason")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

fn push_ticket_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &TicketFilter) {
    builder.push(" WHERE TRUE");
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(priority) = filter.priority {
        builder.push(" AND priority = ").push_bind(priority.as_str());
    }
    if let Some(agent_id) = &filter.agent_id {
        builder.push(" AND agent_id = ").push_bind(agent_id.clone());
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO conversations (id, customer_id, title, status, created_at, updated_at, last_sequence, offer_pending) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&conversation.id)
        .bind(&conversation.customer_id)
        .bind(&conversation.title)
        .bind(conversation.status.as_str())
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .bind(conversation.last_sequence)
        .bind(conversation.offer_pending)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn conversation(&self, id: &str) -> StoreResult<Conversation> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        parse_conversation_row(&row)
    }

    async fn list_conversations(&self, customer_id: Option<&str>) -> StoreResult<Vec<Conversation>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE ($1::TEXT IS NULL OR customer_id = $1) \
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_conversation_row).collect()
    }

    async fn set_conversation_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> StoreResult<Conversation> {
        let row = sqlx::query(&format!(
            "UPDATE conversations \
             SET status = $2, updated_at = CASE WHEN status = $2 THEN updated_at ELSE $3 END \
             WHERE id = $1 \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(now_utc())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        parse_conversation_row(&row)
    }

    async fn set_title_if_missing(&self, id: &str, title: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE conversations SET title = COALESCE(title, $2) WHERE id = $1",
        )
        .bind(id)
        .bind(title)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_offer_pending(&self, id: &str, pending: bool) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE conversations SET offer_pending = $2 WHERE id = $1 AND offer_pending = $3",
        )
        .bind(id)
        .bind(pending)
        .bind(!pending)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM conversations WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        if exists == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(false)
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        draft: &MessageDraft,
    ) -> StoreResult<Appended> {
        let mut tx = self.pool.begin().await?;

        let last_sequence = sqlx::query_scalar::<_, i64>(
            "SELECT last_sequence FROM conversations WHERE id = $1 FOR UPDATE",
        )
        .bind(conversation_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound)?;

        if let Some(key) = draft.idempotency_key.as_deref() {
            let existing = sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 AND idempotency_key = $2"
            ))
            .bind(conversation_id)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = existing {
                return Ok(Appended {
                    message: parse_message_row(&row)?,
                    created: false,
                });
            }
        }

        let message = Message {
            id: new_id(),
            conversation_id: conversation_id.to_string(),
            sequence: last_sequence + 1,
            sender: draft.sender.clone(),
            content: draft.content.clone(),
            created_at: now_utc(),
            idempotency_key: draft.idempotency_key.clone(),
        };

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, sequence, sender, content, created_at, idempotency_key) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.sequence)
        .bind(Json(&message.sender))
        .bind(&message.content)
        .bind(message.created_at)
        .bind(&message.idempotency_key)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE conversations SET last_sequence = $2, updated_at = $3 WHERE id = $1")
            .bind(conversation_id)
            .bind(message.sequence)
            .bind(message.created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Appended {
            message,
            created: true,
        })
    }

    async fn messages_since(
        &self,
        conversation_id: &str,
        after_sequence: i64,
        limit: Option<u32>,
    ) -> StoreResult<Vec<Message>> {
        // Distinguish "no such conversation" from "nothing new".
        self.conversation(conversation_id).await?;

        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE conversation_id = $1 AND sequence > $2 \
             ORDER BY sequence ASC \
             LIMIT $3"
        ))
        .bind(conversation_id)
        .bind(after_sequence)
        .bind(limit.map(i64::from))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_message_row).collect()
    }

    async fn insert_ticket_if_none_active(&self, ticket: &Ticket) -> StoreResult<TicketInsert> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO tickets ({TICKET_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (conversation_id) WHERE status <> 'closed' DO NOTHING \
             RETURNING {TICKET_COLUMNS}"
        ))
        .bind(&ticket.id)
        .bind(&ticket.conversation_id)
        .bind(&ticket.customer_id)
        .bind(&ticket.agent_id)
        .bind(ticket.status.as_str())
        .bind(ticket.priority.as_str())
        .bind(&ticket.reason)
        .bind(ticket.version)
        .bind(ticket.created_at)
        .bind(ticket.updated_at)
        .bind(ticket.resolved_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(TicketInsert::Created(parse_ticket_row(&row)?));
        }

        // The winner may close its ticket between our insert and this read.
        match self.active_ticket(&ticket.conversation_id).await? {
            Some(existing) => Ok(TicketInsert::Existing(existing)),
            None => Err(StoreError::Unavailable(
                "active ticket changed during insert".to_string(),
            )),
        }
    }

    async fn ticket(&self, id: &str) -> StoreResult<Ticket> {
        let row = sqlx::query(&format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        parse_ticket_row(&row)
    }

    async fn active_ticket(&self, conversation_id: &str) -> StoreResult<Option<Ticket>> {
        let row = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE conversation_id = $1 AND status <> 'closed'"
        ))
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_ticket_row).transpose()
    }

    async fn update_ticket_versioned(
        &self,
        ticket: &Ticket,
        expected_version: i64,
    ) -> StoreResult<Option<Ticket>> {
        let row = sqlx::query(&format!(
            "UPDATE tickets \
             SET agent_id = $3, status = $4, priority = $5, reason = $6, updated_at = $7, resolved_at = $8, version = version + 1 \
             WHERE id = $1 AND version = $2 \
             RETURNING {TICKET_COLUMNS}"
        ))
        .bind(&ticket.id)
        .bind(expected_version)
        .bind(&ticket.agent_id)
        .bind(ticket.status.as_str())
        .bind(ticket.priority.as_str())
        .bind(&ticket.reason)
        .bind(ticket.updated_at)
        .bind(ticket.resolved_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => parse_ticket_row(&row).map(Some),
            None => {
                // Lost the race, or the ticket never existed.
                self.ticket(&ticket.id).await?;
                Ok(None)
            }
        }
    }

    async fn claim_ticket(&self, id: &str, agent_id: &str) -> StoreResult<ClaimOutcome> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound)?;
        let mut ticket = parse_ticket_row(&row)?;

        if ticket.status.is_finished() {
            return Ok(ClaimOutcome {
                ticket,
                claimed: false,
                started: false,
            });
        }

        let claimed = ticket.agent_id.is_none();
        let started = ticket.status == TicketStatus::Open;
        if !claimed && !started {
            return Ok(ClaimOutcome {
                ticket,
                claimed,
                started,
            });
        }

        if claimed {
            ticket.agent_id = Some(agent_id.to_string());
        }
        if started {
            ticket.status = TicketStatus::InProgress;
        }
        ticket.updated_at = now_utc();

        let row = sqlx::query(&format!(
            "UPDATE tickets SET agent_id = $2, status = $3, updated_at = $4, version = version + 1 \
             WHERE id = $1 \
             RETURNING {TICKET_COLUMNS}"
        ))
        .bind(id)
        .bind(&ticket.agent_id)
        .bind(ticket.status.as_str())
        .bind(ticket.updated_at)
        .fetch_one(&mut *tx)
        .await?;
        let ticket = parse_ticket_row(&row)?;
        tx.commit().await?;

        Ok(ClaimOutcome {
            ticket,
            claimed,
            started,
        })
    }

    async fn list_tickets(
        &self,
        filter: &TicketFilter,
        page: PageRequest,
    ) -> StoreResult<TicketPage> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(1) FROM tickets");
        push_ticket_filter(&mut count, filter);
        let total = count
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {TICKET_COLUMNS} FROM tickets"));
        push_ticket_filter(&mut select, filter);
        select
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(page.limit))
            .push(" OFFSET ")
            .push_bind(i64::try_from(page.offset()).unwrap_or(i64::MAX));
        let rows = select.build().fetch_all(&self.pool).await?;

        Ok(TicketPage {
            items: rows.iter().map(parse_ticket_row).collect::<StoreResult<_>>()?,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }

    async fn workload(&self, agent_id: &str) -> StoreResult<Workload> {
        let rows = sqlx::query(
            "SELECT status, COUNT(1) AS count FROM tickets \
             WHERE agent_id = $1 AND status <> 'closed' \
             GROUP BY status",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        let mut workload = Workload::default();
        for row in rows {
            let count = u64::try_from(row.try_get::<i64, _>("count")?).unwrap_or_default();
            match row.try_get::<String, _>("status")?.parse::<TicketStatus>() {
                Ok(TicketStatus::Open) => workload.open = count,
                Ok(TicketStatus::InProgress) => workload.in_progress = count,
                Ok(TicketStatus::Resolved) => workload.resolved = count,
                Ok(TicketStatus::Closed) => continue,
                Err(err) => return Err(corrupt(err)),
            }
            workload.total += count;
        }
        Ok(workload)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::future::join_all;

    use super::*;
    use crate::types::TicketPriority;

    async fn connect() -> Option<PgRepository> {
        let url = std::env::var("DATABASE_URL").ok()?;
        Some(PgRepository::connect(&url, 5).await.unwrap())
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL pointing at a scratch database"]
    async fn conditional_insert_and_append_against_postgres() {
        let Some(repo) = connect().await else {
            return;
        };
        let repo = Arc::new(repo);
        let conversation = Conversation::new(format!("cust-{}", new_id()), None);
        repo.insert_conversation(&conversation).await.unwrap();

        let inserts = (0..8).map(|_| {
            let repo = repo.clone();
            let candidate = Ticket::open(&conversation, TicketPriority::Medium, None);
            tokio::spawn(async move { repo.insert_ticket_if_none_active(&candidate).await.unwrap() })
        });
        let outcomes = join_all(inserts)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect::<Vec<_>>();
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, TicketInsert::Created(_)))
                .count(),
            1
        );
        let active = repo.active_ticket(&conversation.id).await.unwrap().unwrap();
        assert!(outcomes.iter().all(|o| o.ticket().id == active.id));

        let draft = MessageDraft::customer("hello").with_key(Some("pg-key-1".to_string()));
        let first = repo.append_message(&conversation.id, &draft).await.unwrap();
        let second = repo.append_message(&conversation.id, &draft).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.message.id, second.message.id);
        assert_eq!(second.message.sequence, 1);

        let mut closed = active.clone();
        closed.status = TicketStatus::Closed;
        let updated = repo
            .update_ticket_versioned(&closed, active.version)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.version, active.version + 1);
        assert!(repo
            .update_ticket_versioned(&closed, active.version)
            .await
            .unwrap()
            .is_none());
        assert!(repo.active_ticket(&conversation.id).await.unwrap().is_none());
    }
}
