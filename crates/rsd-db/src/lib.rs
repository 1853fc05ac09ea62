//! Postgres persistence for the handover protocol.
//!
//! [`PgHandoverStore`] implements the storage seams of `rsd-handover`. Every
//! state-changing method is one conditional statement (`update … where …
//! returning`), so concurrent callers are serialized by the row, not by the
//! application.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use rsd_handover::ports::{
    AccountDirectory, ClaimBinding, CodeRepository, MarkUsed, OwnershipStore, TransferLease,
};
use rsd_handover::types::{
    AccessCode, Account, AccountId, ActionType, OwnershipCategory, ResidenceId, Role,
    TransferPhase,
};

pub const ENV_DB_URL: &str = "RSD_DATABASE_URL";

/// Connect to Postgres using RSD_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL)
        .with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='access_codes'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_access_codes_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_access_codes_table: bool,
}

/// Table holding the rows of one ownership category. All of them key the
/// owning account as `owner_id`.
fn table_of(category: OwnershipCategory) -> &'static str {
    match category {
        OwnershipCategory::Residence => "residences",
        OwnershipCategory::Residents => "residents",
        OwnershipCategory::Fees => "fees",
        OwnershipCategory::ExpenseCategories => "expense_categories",
        OwnershipCategory::Payments => "payments",
        OwnershipCategory::ContributionPlans => "contribution_plans",
        OwnershipCategory::DocumentSubmissions => "document_submissions",
    }
}

// ---------------------------------------------------------------------------
// Seeding helpers (operators + DB tests)
// ---------------------------------------------------------------------------

/// Insert an account row. Fails on a duplicate id or (case-insensitive) email.
pub async fn insert_account(pool: &PgPool, account: &Account) -> Result<()> {
    sqlx::query(
        r#"
        insert into accounts (id, email, role, residence_id)
        values ($1, $2, $3, $4)
        "#,
    )
    .bind(account.id.0)
    .bind(account.email.trim())
    .bind(account.role.as_str())
    .bind(account.residence_id.map(|r| r.0))
    .execute(pool)
    .await
    .context("insert_account failed")?;
    Ok(())
}

pub async fn insert_residence(
    pool: &PgPool,
    residence: ResidenceId,
    name: &str,
    owner: AccountId,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into residences (id, name, owner_id)
        values ($1, $2, $3)
        "#,
    )
    .bind(residence.0)
    .bind(name)
    .bind(owner.0)
    .execute(pool)
    .await
    .context("insert_residence failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// PgHandoverStore
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct PgHandoverStore {
    pool: PgPool,
}

impl PgHandoverStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const CODE_COLUMNS: &str = r#"
    code, original_owner_id, replacement_email, action_type, residence_id,
    failed_attempts, used, phase, claimed_by_account_id, used_by_account_id,
    created_at, expires_at, used_at
"#;

fn code_from_row(row: &PgRow) -> Result<AccessCode> {
    Ok(AccessCode {
        code: row.try_get("code")?,
        original_owner_id: AccountId(row.try_get("original_owner_id")?),
        replacement_email: row.try_get("replacement_email")?,
        action_type: ActionType::parse(&row.try_get::<String, _>("action_type")?)?,
        residence_id: ResidenceId(row.try_get("residence_id")?),
        failed_attempts: row.try_get("failed_attempts")?,
        used: row.try_get("used")?,
        phase: TransferPhase::parse(&row.try_get::<String, _>("phase")?)?,
        claimed_by_account_id: row
            .try_get::<Option<Uuid>, _>("claimed_by_account_id")?
            .map(AccountId),
        used_by_account_id: row
            .try_get::<Option<Uuid>, _>("used_by_account_id")?
            .map(AccountId),
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        used_at: row.try_get("used_at")?,
    })
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        id: AccountId(row.try_get("id")?),
        email: row.try_get("email")?,
        role: Role::parse(&row.try_get::<String, _>("role")?)?,
        residence_id: row.try_get::<Option<i64>, _>("residence_id")?.map(ResidenceId),
    })
}

#[async_trait]
impl CodeRepository for PgHandoverStore {
    async fn insert_code(&self, code: &AccessCode) -> Result<bool> {
        let res = sqlx::query(
            r#"
            insert into access_codes (
              code, original_owner_id, replacement_email, action_type, residence_id,
              failed_attempts, used, phase, claimed_by_account_id, used_by_account_id,
              created_at, expires_at, used_at
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13
            )
            on conflict (code) do nothing
            "#,
        )
        .bind(&code.code)
        .bind(code.original_owner_id.0)
        .bind(&code.replacement_email)
        .bind(code.action_type.as_str())
        .bind(code.residence_id.0)
        .bind(code.failed_attempts)
        .bind(code.used)
        .bind(code.phase.as_str())
        .bind(code.claimed_by_account_id.map(|a| a.0))
        .bind(code.used_by_account_id.map(|a| a.0))
        .bind(code.created_at)
        .bind(code.expires_at)
        .bind(code.used_at)
        .execute(&self.pool)
        .await
        .context("insert_code failed")?;

        Ok(res.rows_affected() == 1)
    }

    async fn fetch_code(&self, code: &str) -> Result<Option<AccessCode>> {
        let sql = format!("select {CODE_COLUMNS} from access_codes where code = $1");
        let row = sqlx::query(&sql)
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .context("fetch_code failed")?;
        row.as_ref().map(code_from_row).transpose()
    }

    async fn list_codes_for_owner(&self, owner: AccountId) -> Result<Vec<AccessCode>> {
        let sql = format!(
            "select {CODE_COLUMNS} from access_codes \
             where original_owner_id = $1 order by created_at desc"
        );
        let rows = sqlx::query(&sql)
            .bind(owner.0)
            .fetch_all(&self.pool)
            .await
            .context("list_codes_for_owner failed")?;
        rows.iter().map(code_from_row).collect()
    }

    async fn delete_cancellable_code(&self, code: &str, owner: AccountId) -> Result<bool> {
        let res = sqlx::query(
            r#"
            delete from access_codes
            where code = $1
              and original_owner_id = $2
              and used = false
              and phase in ('ISSUED','CLAIM_PENDING')
            "#,
        )
        .bind(code)
        .bind(owner.0)
        .execute(&self.pool)
        .await
        .context("delete_cancellable_code failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn supersede_outstanding(
        &self,
        owner: AccountId,
        residence: ResidenceId,
        action: ActionType,
    ) -> Result<u64> {
        let res = sqlx::query(
            r#"
            delete from access_codes
            where original_owner_id = $1
              and residence_id = $2
              and action_type = $3
              and used = false
              and phase in ('ISSUED','CLAIM_PENDING')
            "#,
        )
        .bind(owner.0)
        .bind(residence.0)
        .bind(action.as_str())
        .execute(&self.pool)
        .await
        .context("supersede_outstanding failed")?;
        Ok(res.rows_affected())
    }

    async fn increment_failed_attempts(&self, code: &str) -> Result<Option<i32>> {
        let row: Option<(i32,)> = sqlx::query_as::<_, (i32,)>(
            r#"
            update access_codes
               set failed_attempts = failed_attempts + 1
             where code = $1
            returning failed_attempts
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .context("increment_failed_attempts failed")?;
        Ok(row.map(|(n,)| n))
    }

    async fn bind_claimant(&self, code: &str, claimant: AccountId) -> Result<ClaimBinding> {
        let bound: Option<(String,)> = sqlx::query_as::<_, (String,)>(
            r#"
            update access_codes
               set claimed_by_account_id = $2,
                   phase = 'CLAIM_PENDING'
             where code = $1
               and used = false
               and claimed_by_account_id is null
               and phase = 'ISSUED'
            returning code
            "#,
        )
        .bind(code)
        .bind(claimant.0)
        .fetch_optional(&self.pool)
        .await
        .context("bind_claimant update failed")?;
        if bound.is_some() {
            return Ok(ClaimBinding::Bound);
        }

        // Lost the conditional write; classify what is there now.
        let row: Option<(bool, Option<Uuid>)> = sqlx::query_as::<_, (bool, Option<Uuid>)>(
            "select used, claimed_by_account_id from access_codes where code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .context("bind_claimant select failed")?;

        Ok(match row {
            None => ClaimBinding::Missing,
            Some((true, _)) => ClaimBinding::Closed,
            Some((false, Some(bound))) if bound == claimant.0 => ClaimBinding::Bound,
            Some((false, Some(other))) => ClaimBinding::BoundToOther(AccountId(other)),
            Some((false, None)) => ClaimBinding::Closed,
        })
    }

    async fn advance_phase(&self, code: &str, to: TransferPhase) -> Result<bool> {
        let earlier: Vec<String> = to
            .predecessors()
            .iter()
            .map(|p| p.as_str().to_string())
            .collect();

        let row: Option<(String,)> = sqlx::query_as::<_, (String,)>(
            r#"
            update access_codes
               set phase = case when phase = any($3) then $2 else phase end
             where code = $1
               and used = false
            returning phase
            "#,
        )
        .bind(code)
        .bind(to.as_str())
        .bind(&earlier)
        .fetch_optional(&self.pool)
        .await
        .context("advance_phase failed")?;
        Ok(row.is_some())
    }

    async fn acquire_transfer_lease(
        &self,
        code: &str,
        holder: Uuid,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<TransferLease> {
        let granted: Option<(String,)> = sqlx::query_as::<_, (String,)>(
            r#"
            update access_codes
               set transfer_lease_holder = $2,
                   transfer_lease_expires_at = $4
             where code = $1
               and used = false
               and (transfer_lease_holder is null
                    or transfer_lease_holder = $2
                    or transfer_lease_expires_at <= $3)
            returning phase
            "#,
        )
        .bind(code)
        .bind(holder)
        .bind(now)
        .bind(until)
        .fetch_optional(&self.pool)
        .await
        .context("acquire_transfer_lease update failed")?;
        if let Some((phase,)) = granted {
            return Ok(TransferLease::Granted(TransferPhase::parse(&phase)?));
        }

        let used: Option<(bool,)> =
            sqlx::query_as::<_, (bool,)>("select used from access_codes where code = $1")
                .bind(code)
                .fetch_optional(&self.pool)
                .await
                .context("acquire_transfer_lease select failed")?;
        Ok(match used {
            Some((false,)) => TransferLease::Held,
            _ => TransferLease::Closed,
        })
    }

    async fn release_transfer_lease(&self, code: &str, holder: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            update access_codes
               set transfer_lease_holder = null,
                   transfer_lease_expires_at = null
             where code = $1
               and transfer_lease_holder = $2
            "#,
        )
        .bind(code)
        .bind(holder)
        .execute(&self.pool)
        .await
        .context("release_transfer_lease failed")?;
        Ok(())
    }

    async fn mark_used(
        &self,
        code: &str,
        account: AccountId,
        at: DateTime<Utc>,
    ) -> Result<MarkUsed> {
        let marked: Option<(String,)> = sqlx::query_as::<_, (String,)>(
            r#"
            update access_codes
               set used = true,
                   used_by_account_id = $2,
                   used_at = $3,
                   phase = 'COMPLETE',
                   transfer_lease_holder = null,
                   transfer_lease_expires_at = null
             where code = $1
               and used = false
            returning code
            "#,
        )
        .bind(code)
        .bind(account.0)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .context("mark_used update failed")?;
        if marked.is_some() {
            return Ok(MarkUsed::Marked);
        }

        let row: Option<(bool, Option<Uuid>)> = sqlx::query_as::<_, (bool, Option<Uuid>)>(
            "select used, used_by_account_id from access_codes where code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .context("mark_used select failed")?;

        match row {
            None => Ok(MarkUsed::Missing),
            Some((true, winner)) => Ok(MarkUsed::AlreadyUsedBy(winner.map(AccountId))),
            // `used` never goes back to false.
            Some((false, _)) => Err(anyhow!("mark_used: code {} neither marked nor used", code)),
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query(
            r#"
            delete from access_codes
            where expires_at < $1
              and used = false
              and phase in ('ISSUED','CLAIM_PENDING')
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .context("purge_expired failed")?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl OwnershipStore for PgHandoverStore {
    async fn count_owned(&self, category: OwnershipCategory, owner: AccountId) -> Result<u64> {
        let sql = format!(
            "select count(*)::bigint from {} where owner_id = $1",
            table_of(category)
        );
        let (n,): (i64,) = sqlx::query_as::<_, (i64,)>(&sql)
            .bind(owner.0)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("count_owned({category}) failed"))?;
        Ok(n.max(0) as u64)
    }

    async fn repoint(
        &self,
        category: OwnershipCategory,
        from: AccountId,
        to: AccountId,
    ) -> Result<u64> {
        let sql = format!(
            "update {} set owner_id = $2 where owner_id = $1",
            table_of(category)
        );
        let res = sqlx::query(&sql)
            .bind(from.0)
            .bind(to.0)
            .execute(&self.pool)
            .await
            .with_context(|| format!("repoint({category}) failed"))?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl AccountDirectory for PgHandoverStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>> {
        let row = sqlx::query(
            r#"
            select id, email, role, residence_id
            from accounts
            where lower(email) = lower($1)
            "#,
        )
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await
        .context("find_by_email failed")?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_by_id(&self, id: AccountId) -> Result<Option<Account>> {
        let row = sqlx::query("select id, email, role, residence_id from accounts where id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .context("find_by_id failed")?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn set_role(
        &self,
        id: AccountId,
        role: Role,
        residence: Option<ResidenceId>,
    ) -> Result<()> {
        let res = sqlx::query("update accounts set role = $2, residence_id = $3 where id = $1")
            .bind(id.0)
            .bind(role.as_str())
            .bind(residence.map(|r| r.0))
            .execute(&self.pool)
            .await
            .context("set_role failed")?;
        if res.rows_affected() == 0 {
            bail!("set_role: account {} not found", id);
        }
        Ok(())
    }

    async fn delete_account_cascade(&self, id: AccountId) -> Result<()> {
        // Owned rows and issued codes go with the account (on delete cascade).
        let res = sqlx::query("delete from accounts where id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .context("delete_account_cascade failed")?;
        if res.rows_affected() == 0 {
            bail!("delete: account {} not found", id);
        }
        tracing::info!(account = %id, "account deleted with owned records");
        Ok(())
    }
}
