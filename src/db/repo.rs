use super::model::{LinkRecord, ShareCounts};
use crate::error::Result;
use crate::model::{Destination, FailureKind, LinkGrant, LinkedAccount, ShareRequest, ShareState, StepId};
use chrono::NaiveDateTime;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.starts_with("sqlite::memory");
    // WAL and stricter durability; the busy timeout lets concurrent checkouts queue.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));
    // Every in-memory connection is its own database.
    let max_connections = if in_memory { 1 } else { 8 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(?err, dir = %parent.display(), "could not create database directory");
            }
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const SHARE_COLUMNS: &str =
    "id, file_path, endpoint_id, destination_id, state, failure, created_at";

fn share_request_from_row(row: &SqliteRow) -> Result<ShareRequest> {
    let id: i64 = row.try_get("id")?;
    let state: String = row.try_get("state")?;
    let failure: Option<String> = row.try_get("failure")?;
    let state = ShareState::parse_state(&state, failure.as_deref()).ok_or_else(|| {
        sqlx::Error::Decode(format!("share request {} has unknown state {}", id, state).into())
    })?;
    let created_at: NaiveDateTime = row.try_get("created_at")?;
    Ok(ShareRequest {
        id,
        file_path: row.try_get("file_path")?,
        destination: Destination::new(row.try_get("endpoint_id")?, row.try_get("destination_id")?),
        state,
        created_at: created_at.and_utc(),
    })
}

/// Queue a file for delivery. No file existence check happens here.
#[instrument(skip_all, fields(destination = %destination))]
pub async fn create_share_request(
    pool: &Pool,
    file_path: &str,
    destination: Destination,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO share_requests (file_path, endpoint_id, destination_id, state) VALUES (?, ?, ?, 'pending') RETURNING id",
    )
    .bind(file_path)
    .bind(destination.endpoint_id())
    .bind(destination.destination_id())
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Queue a file only while the owning endpoint is linked to `destination`.
/// Returns None when the guard rejected the insert.
#[instrument(skip_all, fields(destination = %destination))]
pub async fn create_linked_share_request(
    pool: &Pool,
    file_path: &str,
    destination: Destination,
) -> Result<Option<i64>> {
    let id: Option<i64> = sqlx::query_scalar(
        "INSERT INTO share_requests (file_path, endpoint_id, destination_id, state) \
         SELECT ?, ?, ?, 'pending' \
         WHERE EXISTS (SELECT 1 FROM endpoint_links WHERE endpoint_id = ? AND linked = 1 AND destination_id = ?) \
         RETURNING id",
    )
    .bind(file_path)
    .bind(destination.endpoint_id())
    .bind(destination.destination_id())
    .bind(destination.endpoint_id())
    .bind(destination.destination_id())
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

/// Claim every pending request of `destination` for `owner`. The claim is a
/// single UPDATE, so two concurrent callers never receive the same row.
#[instrument(skip_all, fields(destination = %destination))]
pub async fn checkout_share_requests(
    pool: &Pool,
    destination: Destination,
    owner: &str,
) -> Result<Vec<ShareRequest>> {
    let sql = format!(
        "UPDATE share_requests SET state = 'processing', claim_owner = ?, claimed_at = CURRENT_TIMESTAMP, \
         updated_at = CURRENT_TIMESTAMP \
         WHERE state = 'pending' AND endpoint_id = ? AND destination_id = ? \
         RETURNING {SHARE_COLUMNS}"
    );
    let rows = sqlx::query(&sql)
        .bind(owner)
        .bind(destination.endpoint_id())
        .bind(destination.destination_id())
        .fetch_all(pool)
        .await?;
    let mut requests = rows
        .iter()
        .map(share_request_from_row)
        .collect::<Result<Vec<_>>>()?;
    // RETURNING order is unspecified; deliver in enqueue order.
    requests.sort_by_key(|r| r.id);
    Ok(requests)
}

/// Refresh `owner`'s claim on a processing row right before it is delivered.
/// False means the claim was recovered or purged and the row must be skipped.
#[instrument(skip_all)]
pub async fn renew_claim(pool: &Pool, id: i64, owner: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE share_requests SET claimed_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND state = 'processing' AND claim_owner = ?",
    )
    .bind(id)
    .bind(owner)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Success is terminal; the row is removed.
#[instrument(skip_all)]
pub async fn mark_successful(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM share_requests WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_failed(pool: &Pool, id: i64, kind: FailureKind) -> Result<()> {
    sqlx::query(
        "UPDATE share_requests SET state = 'failed', failure = ?, claim_owner = NULL, claimed_at = NULL, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(kind.as_str())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all, fields(destination = %destination))]
pub async fn delete_share_requests(pool: &Pool, destination: Destination) -> Result<u64> {
    let res = sqlx::query("DELETE FROM share_requests WHERE endpoint_id = ? AND destination_id = ?")
        .bind(destination.endpoint_id())
        .bind(destination.destination_id())
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

/// Explicit retry decision: transient failures go back to pending. Auth and
/// permanent failures are left alone.
#[instrument(skip_all, fields(destination = %destination))]
pub async fn retry_failed(pool: &Pool, destination: Destination) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE share_requests SET state = 'pending', failure = NULL, updated_at = CURRENT_TIMESTAMP \
         WHERE state = 'failed' AND failure = 'transient' AND endpoint_id = ? AND destination_id = ?",
    )
    .bind(destination.endpoint_id())
    .bind(destination.destination_id())
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Claims not renewed within `lease` belong to a cycle that died or was
/// cancelled. Those rows may have been delivered, so they become transient
/// failures rather than pending. Live claims of other processes are left alone.
#[instrument(skip_all)]
pub async fn recover_interrupted(pool: &Pool, lease: Duration) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE share_requests SET state = 'failed', failure = 'transient', claim_owner = NULL, \
         claimed_at = NULL, updated_at = CURRENT_TIMESTAMP \
         WHERE state = 'processing' \
         AND (claimed_at IS NULL OR datetime(claimed_at) <= datetime('now', ? || ' seconds'))",
    )
    .bind(-seconds(lease))
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

fn seconds(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

#[instrument(skip_all)]
pub async fn prune_failed(pool: &Pool, older_than: Duration) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM share_requests WHERE state = 'failed' AND datetime(updated_at) <= datetime('now', ? || ' seconds')",
    )
    .bind(-seconds(older_than))
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn count_share_requests(pool: &Pool, destination: Destination) -> Result<ShareCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT state, COUNT(*) FROM share_requests WHERE endpoint_id = ? AND destination_id = ? GROUP BY state",
    )
    .bind(destination.endpoint_id())
    .bind(destination.destination_id())
    .fetch_all(pool)
    .await?;
    let mut counts = ShareCounts::default();
    for (state, count) in rows {
        match state.as_str() {
            "pending" => counts.pending = count,
            "processing" => counts.processing = count,
            "failed" => counts.failed = count,
            _ => {}
        }
    }
    Ok(counts)
}

pub async fn list_share_requests(pool: &Pool, destination: Destination) -> Result<Vec<ShareRequest>> {
    let sql = format!(
        "SELECT {SHARE_COLUMNS} FROM share_requests WHERE endpoint_id = ? AND destination_id = ? ORDER BY id"
    );
    let rows = sqlx::query(&sql)
        .bind(destination.endpoint_id())
        .bind(destination.destination_id())
        .fetch_all(pool)
        .await?;
    rows.iter().map(share_request_from_row).collect()
}

#[instrument(skip_all)]
pub async fn load_link_record(pool: &Pool, endpoint_id: i32) -> Result<LinkRecord> {
    let row = sqlx::query(
        "SELECT linked, account_name, destination_id, destination_description, credential, settings, link_step, link_draft \
         FROM endpoint_links WHERE endpoint_id = ?",
    )
    .bind(endpoint_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(LinkRecord {
            endpoint_id,
            ..Default::default()
        });
    };

    Ok(LinkRecord {
        endpoint_id,
        linked: row.try_get("linked")?,
        account_name: row.try_get("account_name")?,
        destination_id: row.try_get("destination_id")?,
        destination_description: row.try_get("destination_description")?,
        credential: row.try_get("credential")?,
        settings: row.try_get("settings")?,
        link_step: row.try_get("link_step")?,
        link_draft: row.try_get("link_draft")?,
    })
}

/// Reset the record to `LinkInProgress(0)` with an empty draft.
#[instrument(skip_all)]
pub async fn begin_link(pool: &Pool, endpoint_id: i32) -> Result<()> {
    advance_link(pool, endpoint_id, 0, &LinkGrant::default()).await
}

#[instrument(skip_all)]
pub async fn advance_link(pool: &Pool, endpoint_id: i32, step: StepId, draft: &LinkGrant) -> Result<()> {
    let draft = serde_json::to_string(draft)?;
    sqlx::query(
        "INSERT INTO endpoint_links (endpoint_id, linked, link_step, link_draft) VALUES (?, 0, ?, ?) \
         ON CONFLICT(endpoint_id) DO UPDATE SET linked = 0, account_name = NULL, destination_id = NULL, \
         destination_description = NULL, credential = NULL, settings = NULL, \
         link_step = excluded.link_step, link_draft = excluded.link_draft, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(endpoint_id)
    .bind(step as i64)
    .bind(draft)
    .execute(pool)
    .await?;
    Ok(())
}

/// Persist a completed link and clear the in-progress markers.
#[instrument(skip_all)]
pub async fn store_link(pool: &Pool, account: &LinkedAccount) -> Result<()> {
    let settings = serde_json::to_string(&account.credential.settings)?;
    sqlx::query(
        "INSERT INTO endpoint_links (endpoint_id, linked, account_name, destination_id, destination_description, credential, settings) \
         VALUES (?, 1, ?, ?, ?, ?, ?) \
         ON CONFLICT(endpoint_id) DO UPDATE SET linked = 1, account_name = excluded.account_name, \
         destination_id = excluded.destination_id, destination_description = excluded.destination_description, \
         credential = excluded.credential, settings = excluded.settings, link_step = NULL, link_draft = NULL, \
         updated_at = CURRENT_TIMESTAMP",
    )
    .bind(account.destination.endpoint_id())
    .bind(&account.account_name)
    .bind(account.destination.destination_id())
    .bind(&account.destination_description)
    .bind(&account.credential.token)
    .bind(settings)
    .execute(pool)
    .await?;
    Ok(())
}

/// Clear the link record and purge every share request of the endpoint in one
/// transaction. Returns the number of purged requests.
#[instrument(skip_all)]
pub async fn unlink_and_purge(pool: &Pool, endpoint_id: i32) -> Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO endpoint_links (endpoint_id, linked) VALUES (?, 0) \
         ON CONFLICT(endpoint_id) DO UPDATE SET linked = 0, account_name = NULL, destination_id = NULL, \
         destination_description = NULL, credential = NULL, settings = NULL, link_step = NULL, \
         link_draft = NULL, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(endpoint_id)
    .execute(&mut *tx)
    .await?;
    let purged = sqlx::query("DELETE FROM share_requests WHERE endpoint_id = ?")
        .bind(endpoint_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;
    Ok(purged)
}
