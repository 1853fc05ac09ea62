//! Scenario: a full one-party role transfer against Postgres.
//!
//! # Invariants under test
//!
//! 1. Every ownership table is re-pointed to the claimant.
//! 2. Roles swap: claimant becomes syndic, former owner becomes resident.
//! 3. A second completion by the same claimant is AlreadyUsed and moves nothing.
//!
//! DB-backed test. Skips if RSD_DATABASE_URL is not set.

use std::sync::Arc;

use uuid::Uuid;

use rsd_db::PgHandoverStore;
use rsd_handover::ports::{AccountDirectory, OwnershipStore};
use rsd_handover::{
    Account, AccountId, ActionType, Coordinator, HandoverDeps, HandoverSettings,
    OwnershipCategory, ResidenceId, Role, VerifiedIdentity,
};
use rsd_testkit::{FakeBilling, ManualClock, RecordingAudit};

const CHILD_TABLES: [&str; 6] = [
    "residents",
    "fees",
    "expense_categories",
    "payments",
    "contribution_plans",
    "document_submissions",
];

#[tokio::test]
async fn one_party_transfer_repoints_every_table() -> anyhow::Result<()> {
    let url = match std::env::var(rsd_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: RSD_DATABASE_URL not set");
            return Ok(());
        }
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await?;
    rsd_db::migrate(&pool).await?;

    let residence = ResidenceId((Uuid::new_v4().as_u128() as i64) & 0x7fff_ffff_ffff);
    let tag = Uuid::new_v4().simple().to_string();
    let owner = Account {
        id: AccountId::new_v4(),
        email: format!("owner-{tag}@example.com"),
        role: Role::Syndic,
        residence_id: Some(residence),
    };
    let claimant = Account {
        id: AccountId::new_v4(),
        email: format!("claimant-{tag}@example.com"),
        role: Role::Resident,
        residence_id: None,
    };
    rsd_db::insert_account(&pool, &owner).await?;
    rsd_db::insert_account(&pool, &claimant).await?;
    rsd_db::insert_residence(&pool, residence, "Residence under test", owner.id).await?;

    for table in CHILD_TABLES {
        let sql = match table {
            "fees" | "payments" => format!(
                "insert into {table} (residence_id, amount_cents, owner_id) values ($1, 1000, $2)"
            ),
            "residents" => format!(
                "insert into {table} (residence_id, full_name, owner_id) values ($1, 'A. Resident', $2)"
            ),
            "document_submissions" => format!(
                "insert into {table} (residence_id, title, owner_id) values ($1, 'Minutes', $2)"
            ),
            _ => format!(
                "insert into {table} (residence_id, label, owner_id) values ($1, 'Label', $2)"
            ),
        };
        for _ in 0..2 {
            sqlx::query(&sql)
                .bind(residence.0)
                .bind(owner.id.0)
                .execute(&pool)
                .await?;
        }
    }

    let store = Arc::new(PgHandoverStore::new(pool.clone()));
    let billing = Arc::new(FakeBilling::new());
    billing.add_subscription(owner.id, "sub_pg_1");
    let audit = Arc::new(RecordingAudit::new());
    let coordinator = Coordinator::new(
        HandoverDeps {
            codes: store.clone(),
            ownership: store.clone(),
            accounts: store.clone(),
            billing: billing.clone(),
            audit: audit.clone(),
            clock: Arc::new(ManualClock::new(chrono::Utc::now())),
        },
        HandoverSettings::default(),
    );

    let issued = coordinator
        .issue_code(owner.id, &claimant.email, residence, ActionType::ChangeRole)
        .await?;
    let who = VerifiedIdentity::new(claimant.id, claimant.email.clone());

    let report = coordinator.complete_claim(&issued.code.code, &who).await?;
    assert_eq!(report.new_owner, claimant.id);
    assert_eq!(report.former_owner, owner.id);

    for category in OwnershipCategory::ALL {
        assert_eq!(store.count_owned(category, owner.id).await?, 0, "{category}");
    }
    assert_eq!(store.count_owned(OwnershipCategory::Residence, claimant.id).await?, 1);
    assert_eq!(store.count_owned(OwnershipCategory::Fees, claimant.id).await?, 2);

    let new_syndic = store.find_by_id(claimant.id).await?.expect("claimant");
    assert!(new_syndic.is_syndic_of(residence));
    let former = store.find_by_id(owner.id).await?.expect("owner");
    assert_eq!(former.role, Role::Resident);
    assert_eq!(former.residence_id, Some(residence));
    assert_eq!(billing.cancelled().len(), 1);

    let again = coordinator
        .complete_claim(&issued.code.code, &who)
        .await
        .expect_err("second completion");
    assert!(again.is_already_used(), "got {again:?}");
    assert_eq!(audit.count("CODE_CONSUMED"), 1);

    // Cleanup: the claimant now owns everything, so deleting it clears the rows.
    store.delete_account_cascade(claimant.id).await?;
    store.delete_account_cascade(owner.id).await?;
    Ok(())
}
