//! Postgres store: raw-table reads and canonical-table writes.
//!
//! The raw tables are produced by the regulator's bulk-export loader and are
//! read-only here. The canonical tables are owned by this workspace; filers
//! and committees are rebuilt wholesale each run, while propositions and
//! their filer associations are only ever created or updated.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::info;

use cfb_core::{
    Committee, Election, Filer, FilerType, Position, Proposition, RawFilerName, RawFilerType,
    RawFiling, RawLink,
};

/// Canonical-table DDL. Idempotent so every batch entry point can run it.
///
/// `proposition_filer.filer_id` carries no foreign key: the filer table is
/// truncated and reloaded on every rebuild, and associations from an earlier
/// scrape must survive until the next scrape refreshes them.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS filer (
    id BIGINT PRIMARY KEY,
    filer_id_raw BIGINT NOT NULL,
    status TEXT,
    effective_date DATE,
    xref_filer_id TEXT,
    filer_type TEXT NOT NULL,
    name TEXT NOT NULL,
    party TEXT
);
CREATE INDEX IF NOT EXISTS filer_filer_id_raw_idx ON filer (filer_id_raw);
CREATE INDEX IF NOT EXISTS filer_xref_filer_id_idx ON filer (xref_filer_id);

CREATE TABLE IF NOT EXISTS committee (
    id BIGINT PRIMARY KEY,
    filer_id BIGINT NOT NULL REFERENCES filer (id),
    filer_id_raw BIGINT NOT NULL,
    xref_filer_id TEXT,
    name TEXT NOT NULL,
    committee_type TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS committee_filer_id_raw_idx ON committee (filer_id_raw);

CREATE TABLE IF NOT EXISTS election (
    id BIGSERIAL PRIMARY KEY,
    year INT NOT NULL,
    kind TEXT NOT NULL,
    date DATE
);

CREATE TABLE IF NOT EXISTS proposition (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    external_id TEXT NOT NULL,
    election_id BIGINT REFERENCES election (id),
    UNIQUE (name, external_id)
);

CREATE TABLE IF NOT EXISTS proposition_filer (
    id BIGSERIAL PRIMARY KEY,
    proposition_id BIGINT NOT NULL REFERENCES proposition (id),
    filer_id BIGINT NOT NULL,
    "position" TEXT NOT NULL,
    UNIQUE (proposition_id, filer_id, "position")
);
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unknown filer type code {0:?}")]
    UnknownFilerType(String),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Every row of the raw filer-name table. Numeric columns are cast so the
    /// export loader's integer widths don't leak into the domain types.
    pub async fn raw_filer_names(&self) -> Result<Vec<RawFilerName>> {
        let rows = sqlx::query(
            r#"
            SELECT filer_id::bigint AS filer_id,
                   id::bigint AS record_id,
                   filer_type::text AS filer_type,
                   status::text AS status,
                   effect_dt AS effective_date,
                   xref_filer_id::text AS xref_filer_id,
                   namt::text AS namt,
                   namf::text AS namf,
                   naml::text AS naml,
                   nams::text AS nams
              FROM filername_cd
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RawFilerName {
                filer_id: row.try_get("filer_id")?,
                record_id: row.try_get("record_id")?,
                filer_type: row
                    .try_get::<Option<String>, _>("filer_type")?
                    .unwrap_or_default(),
                status: row.try_get("status")?,
                effective_date: row.try_get("effective_date")?,
                xref_filer_id: row.try_get("xref_filer_id")?,
                title: row.try_get::<Option<String>, _>("namt")?.unwrap_or_default(),
                first: row.try_get::<Option<String>, _>("namf")?.unwrap_or_default(),
                last: row.try_get::<Option<String>, _>("naml")?.unwrap_or_default(),
                suffix: row.try_get::<Option<String>, _>("nams")?.unwrap_or_default(),
            });
        }
        Ok(out)
    }

    pub async fn raw_filer_types(&self) -> Result<Vec<RawFilerType>> {
        let rows = sqlx::query(
            r#"
            SELECT filer_id::bigint AS filer_id,
                   id::bigint AS record_id,
                   party_cd::text AS party
              FROM filer_to_filer_type_cd
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RawFilerType {
                filer_id: row.try_get("filer_id")?,
                record_id: row.try_get("record_id")?,
                party: row.try_get("party")?,
            });
        }
        Ok(out)
    }

    /// Distinct link pairs of one link type.
    pub async fn raw_links(&self, link_type: &str) -> Result<Vec<RawLink>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT filer_id_a::bigint AS filer_id_a,
                   filer_id_b::bigint AS filer_id_b,
                   link_type::text AS link_type
              FROM filer_links_cd
             WHERE link_type::text = $1
            "#,
        )
        .bind(link_type)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RawLink {
                filer_id_a: row.try_get("filer_id_a")?,
                filer_id_b: row.try_get("filer_id_b")?,
                link_type: row.try_get("link_type")?,
            });
        }
        Ok(out)
    }

    /// Distinct (filer, form) pairs from the filing headers.
    pub async fn raw_filings(&self, forms: &[&str]) -> Result<Vec<RawFiling>> {
        let forms: Vec<String> = forms.iter().map(|f| f.to_string()).collect();
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT filer_id::bigint AS filer_id,
                   form_id::text AS form_id
              FROM filer_filings_cd
             WHERE form_id::text = ANY($1)
            "#,
        )
        .bind(&forms)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RawFiling {
                filer_id: row.try_get("filer_id")?,
                form_id: row.try_get("form_id")?,
            });
        }
        Ok(out)
    }

    /// Replace the canonical filer and committee tables in one transaction.
    /// A failure anywhere rolls the whole rebuild back, leaving the previous
    /// tables untouched for a clean rerun.
    pub async fn rebuild_filers_and_committees(
        &self,
        filers: &[Filer],
        committees: &[Committee],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("TRUNCATE filer, committee").execute(&mut *tx).await?;

        for filer in filers {
            sqlx::query(
                r#"
                INSERT INTO filer
                    (id, filer_id_raw, status, effective_date, xref_filer_id,
                     filer_type, name, party)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(filer.id)
            .bind(filer.filer_id_raw)
            .bind(&filer.status)
            .bind(filer.effective_date)
            .bind(&filer.xref_filer_id)
            .bind(filer.filer_type.as_str())
            .bind(&filer.name)
            .bind(&filer.party)
            .execute(&mut *tx)
            .await?;
        }

        for committee in committees {
            sqlx::query(
                r#"
                INSERT INTO committee
                    (id, filer_id, filer_id_raw, xref_filer_id, name, committee_type)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(committee.id)
            .bind(committee.filer_id)
            .bind(committee.filer_id_raw)
            .bind(&committee.xref_filer_id)
            .bind(&committee.name)
            .bind(committee.committee_type.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(
            filers = filers.len(),
            committees = committees.len(),
            "canonical filer and committee tables rebuilt"
        );
        Ok(())
    }
}

fn filer_from_row(row: &PgRow) -> Result<Filer> {
    let type_code: String = row.try_get("filer_type")?;
    let filer_type =
        FilerType::from_code(&type_code).ok_or(StoreError::UnknownFilerType(type_code))?;
    Ok(Filer {
        id: row.try_get("id")?,
        filer_id_raw: row.try_get("filer_id_raw")?,
        status: row.try_get("status")?,
        effective_date: row.try_get("effective_date")?,
        xref_filer_id: row.try_get("xref_filer_id")?,
        filer_type,
        name: row.try_get("name")?,
        party: row.try_get("party")?,
    })
}

fn proposition_from_row(row: &PgRow) -> Result<Proposition> {
    Ok(Proposition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        external_id: row.try_get("external_id")?,
        election_id: row.try_get("election_id")?,
    })
}

/// Store operations the proposition reconciler needs. A trait so the
/// reconciler can run against an in-memory double in tests.
#[async_trait]
pub trait PropositionStore: Send + Sync {
    async fn elections_for(&self, year: i32, kind: &str) -> Result<Vec<Election>>;

    async fn set_election_date(&self, election_id: i64, date: NaiveDate) -> Result<()>;

    async fn find_or_create_proposition(
        &self,
        name: &str,
        external_id: &str,
    ) -> Result<Proposition>;

    async fn set_proposition_election(
        &self,
        proposition_id: i64,
        election_id: Option<i64>,
    ) -> Result<()>;

    async fn filer_by_raw_id(&self, filer_id_raw: i64) -> Result<Option<Filer>>;

    async fn filer_by_xref(&self, xref_filer_id: &str) -> Result<Option<Filer>>;

    /// Returns whether a new association row was written.
    async fn find_or_create_proposition_filer(
        &self,
        proposition_id: i64,
        filer_id: i64,
        position: Position,
    ) -> Result<bool>;
}

#[async_trait]
impl PropositionStore for PgStore {
    async fn elections_for(&self, year: i32, kind: &str) -> Result<Vec<Election>> {
        let rows = sqlx::query(
            "SELECT id, year, kind, date FROM election WHERE year = $1 AND kind = $2 ORDER BY id",
        )
        .bind(year)
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Election {
                id: row.try_get("id")?,
                year: row.try_get("year")?,
                kind: row.try_get("kind")?,
                date: row.try_get("date")?,
            });
        }
        Ok(out)
    }

    async fn set_election_date(&self, election_id: i64, date: NaiveDate) -> Result<()> {
        sqlx::query("UPDATE election SET date = $2 WHERE id = $1")
            .bind(election_id)
            .bind(date)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_or_create_proposition(
        &self,
        name: &str,
        external_id: &str,
    ) -> Result<Proposition> {
        let existing = sqlx::query(
            "SELECT id, name, external_id, election_id FROM proposition
              WHERE name = $1 AND external_id = $2",
        )
        .bind(name)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = existing {
            return proposition_from_row(&row);
        }

        let row = sqlx::query(
            "INSERT INTO proposition (name, external_id) VALUES ($1, $2)
             RETURNING id, name, external_id, election_id",
        )
        .bind(name)
        .bind(external_id)
        .fetch_one(&self.pool)
        .await?;
        proposition_from_row(&row)
    }

    async fn set_proposition_election(
        &self,
        proposition_id: i64,
        election_id: Option<i64>,
    ) -> Result<()> {
        sqlx::query("UPDATE proposition SET election_id = $2 WHERE id = $1")
            .bind(proposition_id)
            .bind(election_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn filer_by_raw_id(&self, filer_id_raw: i64) -> Result<Option<Filer>> {
        let row = sqlx::query(
            "SELECT id, filer_id_raw, status, effective_date, xref_filer_id,
                    filer_type, name, party
               FROM filer WHERE filer_id_raw = $1 ORDER BY id LIMIT 1",
        )
        .bind(filer_id_raw)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(filer_from_row).transpose()
    }

    async fn filer_by_xref(&self, xref_filer_id: &str) -> Result<Option<Filer>> {
        let row = sqlx::query(
            "SELECT id, filer_id_raw, status, effective_date, xref_filer_id,
                    filer_type, name, party
               FROM filer WHERE xref_filer_id = $1 ORDER BY id LIMIT 1",
        )
        .bind(xref_filer_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(filer_from_row).transpose()
    }

    async fn find_or_create_proposition_filer(
        &self,
        proposition_id: i64,
        filer_id: i64,
        position: Position,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO proposition_filer (proposition_id, filer_id, "position")
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(proposition_id)
        .bind(filer_id)
        .bind(position.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
