use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::{GeneratedBatch, StoreError, TicketStore};
use crate::admission::procedure::{AdmissionAttempt, AdmissionOutcome, AdmissionPolicy};
use crate::models::{
    ConsumedRow, Event, IndividualTicket, LegacyTicket, Purchase, PurchaseDetails,
    RedeemableUnit, TicketType, UnitFormat,
};

const INDIVIDUAL_COLUMNS: &str =
    "ticket_code, purchase_id, ordinal, is_used, used_at, used_by, admitted_via";
const LEGACY_COLUMNS: &str =
    "purchase_code, purchase_id, use_count, total_quantity, last_admitted_at";
const PURCHASE_COLUMNS: &str = "id, purchase_code, customer_name, customer_email, \
     customer_phone, event_id, ticket_type_id, quantity, price, currency, unit_format, \
     purchased_at";

#[derive(FromRow)]
struct PurchaseRow {
    id: Uuid,
    purchase_code: String,
    customer_name: String,
    customer_email: String,
    customer_phone: Option<String>,
    event_id: Uuid,
    ticket_type_id: Uuid,
    quantity: i32,
    price: Decimal,
    currency: String,
    unit_format: String,
    purchased_at: DateTime<Utc>,
}

impl TryFrom<PurchaseRow> for Purchase {
    type Error = StoreError;

    fn try_from(row: PurchaseRow) -> Result<Self, Self::Error> {
        let unit_format = row
            .unit_format
            .parse::<UnitFormat>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Purchase {
            id: row.id,
            purchase_code: row.purchase_code,
            customer_name: row.customer_name,
            customer_email: row.customer_email,
            customer_phone: row.customer_phone,
            event_id: row.event_id,
            ticket_type_id: row.ticket_type_id,
            quantity: row.quantity,
            price: row.price,
            currency: row.currency.trim_end().to_string(),
            unit_format,
            purchased_at: row.purchased_at,
        })
    }
}

#[derive(FromRow)]
struct CatalogRow {
    event_title: String,
    event_date_text: String,
    event_time_text: String,
    event_venue: String,
    event_created_at: DateTime<Utc>,
    ticket_type_name: String,
    admissions_per_unit: i32,
    ticket_type_created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PgTicketStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgTicketStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        lock_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(database_url)
            .await?;

        Ok(Self::from_pool(pool, lock_timeout))
    }

    pub fn from_pool(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!().run(&self.pool).await?;
        info!("Migrations completed successfully.");
        Ok(())
    }

    async fn begin_locked(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Resolves and locks the unit for `identifier`. Lock order is unit row
    /// then purchase row for aggregates, purchase row then ticket rows for
    /// purchase-code scans of individual tickets.
    async fn lock_unit(
        tx: &mut Transaction<'static, Postgres>,
        identifier: &str,
    ) -> Result<Option<RedeemableUnit>, StoreError> {
        let individual = sqlx::query_as::<_, IndividualTicket>(&format!(
            "SELECT {INDIVIDUAL_COLUMNS} FROM individual_tickets WHERE ticket_code = $1 FOR UPDATE"
        ))
        .bind(identifier)
        .fetch_optional(&mut **tx)
        .await?;
        if let Some(ticket) = individual {
            return Ok(Some(RedeemableUnit::IndividualUnit(ticket)));
        }

        let legacy = sqlx::query_as::<_, LegacyTicket>(&format!(
            "SELECT {LEGACY_COLUMNS} FROM legacy_tickets WHERE purchase_code = $1 FOR UPDATE"
        ))
        .bind(identifier)
        .fetch_optional(&mut **tx)
        .await?;
        if let Some(ticket) = legacy {
            let parent: Option<Uuid> =
                sqlx::query_scalar("SELECT id FROM purchases WHERE id = $1 FOR UPDATE")
                    .bind(ticket.purchase_id)
                    .fetch_optional(&mut **tx)
                    .await?;
            if parent.is_none() {
                return Err(StoreError::OrphanedTicket(identifier.to_string()));
            }
            return Ok(Some(RedeemableUnit::LegacyAggregate(ticket)));
        }

        let purchase_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM purchases WHERE purchase_code = $1 AND unit_format = 'individual' FOR UPDATE",
        )
        .bind(identifier)
        .fetch_optional(&mut **tx)
        .await?;
        let Some(purchase_id) = purchase_id else {
            return Ok(None);
        };
        let tickets = sqlx::query_as::<_, IndividualTicket>(&format!(
            "SELECT {INDIVIDUAL_COLUMNS} FROM individual_tickets WHERE purchase_id = $1 ORDER BY ordinal FOR UPDATE"
        ))
        .bind(purchase_id)
        .fetch_all(&mut **tx)
        .await?;

        Ok(Some(RedeemableUnit::IndividualSet {
            purchase_id,
            purchase_code: identifier.to_string(),
            tickets,
        }))
    }

    async fn persist(
        tx: &mut Transaction<'static, Postgres>,
        row: &ConsumedRow,
        attempt: &AdmissionAttempt<'_>,
    ) -> Result<(), StoreError> {
        let result = match row {
            ConsumedRow::Legacy { purchase_code } => {
                sqlx::query(
                    "UPDATE legacy_tickets SET use_count = use_count + 1, last_admitted_at = $2 \
                     WHERE purchase_code = $1 AND use_count < total_quantity",
                )
                .bind(purchase_code)
                .bind(attempt.at)
                .execute(&mut **tx)
                .await?
            }
            ConsumedRow::Individual { ticket_code } => {
                sqlx::query(
                    "UPDATE individual_tickets \
                     SET is_used = TRUE, used_at = $2, used_by = $3, admitted_via = $4 \
                     WHERE ticket_code = $1 AND NOT is_used",
                )
                .bind(ticket_code)
                .bind(attempt.at)
                .bind(attempt.verified_by)
                .bind(attempt.identifier)
                .execute(&mut **tx)
                .await?
            }
        };

        if result.rows_affected() != 1 {
            return Err(StoreError::LostUpdate(attempt.identifier.to_string()));
        }
        Ok(())
    }

    async fn fetch_individual(
        executor: &mut sqlx::PgConnection,
        purchase_id: Uuid,
    ) -> Result<Vec<IndividualTicket>, StoreError> {
        let tickets = sqlx::query_as::<_, IndividualTicket>(&format!(
            "SELECT {INDIVIDUAL_COLUMNS} FROM individual_tickets WHERE purchase_id = $1 ORDER BY ordinal"
        ))
        .bind(purchase_id)
        .fetch_all(executor)
        .await?;
        Ok(tickets)
    }
}

#[async_trait]
impl TicketStore for PgTicketStore {
    async fn find_unit(&self, identifier: &str) -> Result<Option<RedeemableUnit>, StoreError> {
        let individual = sqlx::query_as::<_, IndividualTicket>(&format!(
            "SELECT {INDIVIDUAL_COLUMNS} FROM individual_tickets WHERE ticket_code = $1"
        ))
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(ticket) = individual {
            return Ok(Some(RedeemableUnit::IndividualUnit(ticket)));
        }

        let legacy = sqlx::query_as::<_, LegacyTicket>(&format!(
            "SELECT {LEGACY_COLUMNS} FROM legacy_tickets WHERE purchase_code = $1"
        ))
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(ticket) = legacy {
            return Ok(Some(RedeemableUnit::LegacyAggregate(ticket)));
        }

        let purchase_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM purchases WHERE purchase_code = $1 AND unit_format = 'individual'",
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;
        let Some(purchase_id) = purchase_id else {
            return Ok(None);
        };
        let mut conn = self.pool.acquire().await?;
        let tickets = Self::fetch_individual(&mut conn, purchase_id).await?;

        Ok(Some(RedeemableUnit::IndividualSet {
            purchase_id,
            purchase_code: identifier.to_string(),
            tickets,
        }))
    }

    async fn purchase_details(
        &self,
        purchase_id: Uuid,
    ) -> Result<Option<PurchaseDetails>, StoreError> {
        let Some(purchase) = sqlx::query_as::<_, PurchaseRow>(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases WHERE id = $1"
        ))
        .bind(purchase_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };
        let purchase = Purchase::try_from(purchase)?;

        let catalog = sqlx::query_as::<_, CatalogRow>(
            r#"
            SELECT e.title AS event_title, e.date_text AS event_date_text,
                   e.time_text AS event_time_text, e.venue AS event_venue,
                   e.created_at AS event_created_at, t.name AS ticket_type_name,
                   t.admissions_per_unit, t.created_at AS ticket_type_created_at
            FROM ticket_types t
            JOIN events e ON e.id = t.event_id
            WHERE t.id = $1
            "#,
        )
        .bind(purchase.ticket_type_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            StoreError::Corrupt(format!(
                "ticket type {} of purchase {} missing",
                purchase.ticket_type_id, purchase.id
            ))
        })?;

        let event = Event {
            id: purchase.event_id,
            title: catalog.event_title,
            date_text: catalog.event_date_text,
            time_text: catalog.event_time_text,
            venue: catalog.event_venue,
            created_at: catalog.event_created_at,
        };
        let ticket_type = TicketType {
            id: purchase.ticket_type_id,
            event_id: purchase.event_id,
            name: catalog.ticket_type_name,
            admissions_per_unit: catalog.admissions_per_unit,
            created_at: catalog.ticket_type_created_at,
        };

        Ok(Some(PurchaseDetails {
            purchase,
            event,
            ticket_type,
        }))
    }

    async fn find_purchase_by_code(
        &self,
        purchase_code: &str,
    ) -> Result<Option<Purchase>, StoreError> {
        sqlx::query_as::<_, PurchaseRow>(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases WHERE purchase_code = $1"
        ))
        .bind(purchase_code)
        .fetch_optional(&self.pool)
        .await?
        .map(Purchase::try_from)
        .transpose()
    }

    async fn ticket_type(&self, id: Uuid) -> Result<Option<TicketType>, StoreError> {
        let ticket_type = sqlx::query_as::<_, TicketType>(
            "SELECT id, event_id, name, admissions_per_unit, created_at FROM ticket_types WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(ticket_type)
    }

    async fn insert_purchase(
        &self,
        purchase: &Purchase,
        legacy: Option<&LegacyTicket>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO purchases ({PURCHASE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (purchase_code) DO NOTHING"
        ))
        .bind(purchase.id)
        .bind(&purchase.purchase_code)
        .bind(&purchase.customer_name)
        .bind(&purchase.customer_email)
        .bind(&purchase.customer_phone)
        .bind(purchase.event_id)
        .bind(purchase.ticket_type_id)
        .bind(purchase.quantity)
        .bind(purchase.price)
        .bind(&purchase.currency)
        .bind(purchase.unit_format.as_str())
        .bind(purchase.purchased_at)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::DuplicatePurchaseCode(
                purchase.purchase_code.clone(),
            ));
        }

        if let Some(ticket) = legacy {
            sqlx::query(&format!(
                "INSERT INTO legacy_tickets ({LEGACY_COLUMNS}) VALUES ($1, $2, $3, $4, $5)"
            ))
            .bind(&ticket.purchase_code)
            .bind(ticket.purchase_id)
            .bind(ticket.use_count)
            .bind(ticket.total_quantity)
            .bind(ticket.last_admitted_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn admit(
        &self,
        attempt: &AdmissionAttempt<'_>,
        policy: &AdmissionPolicy,
    ) -> Result<AdmissionOutcome, StoreError> {
        let mut tx = self.begin_locked().await?;

        // Counters are only trusted once the row lock is held.
        let Some(mut unit) = Self::lock_unit(&mut tx, attempt.identifier).await? else {
            tx.rollback().await?;
            return Ok(AdmissionOutcome::NotFound);
        };

        let (outcome, row) = policy.apply(&mut unit, attempt);
        if let Some(row) = &row {
            Self::persist(&mut tx, row, attempt).await?;
        }

        sqlx::query(
            "INSERT INTO admission_log (identifier, verified_by, outcome, remaining, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(attempt.identifier)
        .bind(attempt.verified_by)
        .bind(outcome.as_str())
        .bind(unit.remaining())
        .bind(attempt.at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(
            identifier = attempt.identifier,
            outcome = outcome.as_str(),
            "Admission committed"
        );
        Ok(outcome)
    }

    async fn create_individual_tickets(
        &self,
        purchase_id: Uuid,
        codes: &[String],
    ) -> Result<GeneratedBatch, StoreError> {
        let mut tx = self.pool.begin().await?;

        // A concurrent generator blocks here on the primary key until the
        // first one commits, then inserts nothing and reads its rows.
        let claimed = sqlx::query(
            "INSERT INTO individual_ticket_batches (purchase_id, unit_count) VALUES ($1, $2) \
             ON CONFLICT (purchase_id) DO NOTHING",
        )
        .bind(purchase_id)
        .bind(codes.len() as i32)
        .execute(&mut *tx)
        .await?;
        let created = claimed.rows_affected() == 1;

        if created {
            let ordinals: Vec<i32> = (1..=codes.len() as i32).collect();
            sqlx::query(
                "INSERT INTO individual_tickets (ticket_code, purchase_id, ordinal) \
                 SELECT code, $1, ordinal FROM UNNEST($2::text[], $3::int4[]) AS t(code, ordinal)",
            )
            .bind(purchase_id)
            .bind(codes)
            .bind(&ordinals)
            .execute(&mut *tx)
            .await?;
        }

        let tickets = Self::fetch_individual(&mut tx, purchase_id).await?;
        tx.commit().await?;

        Ok(GeneratedBatch { tickets, created })
    }

    async fn individual_tickets(
        &self,
        purchase_id: Uuid,
    ) -> Result<Vec<IndividualTicket>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_individual(&mut conn, purchase_id).await
    }
}
