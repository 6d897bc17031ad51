//! Imported row queries

use chrono::NaiveDate;
use sqlx::PgPool;

use crate::types::{DateGroup, GroupedRowsResponse, PageMeta, ParsedRow, StoredRow};

/// Insert a batch in one statement and return the stored rows.
/// Either the whole batch is written or none of it is.
pub async fn insert_rows(pool: &PgPool, rows: &[ParsedRow]) -> Result<Vec<StoredRow>, sqlx::Error> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let external_ids: Vec<i64> = rows.iter().map(|r| r.external_id).collect();
    let names: Vec<String> = rows.iter().map(|r| r.name.clone()).collect();
    let dates: Vec<NaiveDate> = rows.iter().map(|r| r.date).collect();

    sqlx::query_as::<_, StoredRow>(
        r#"
        INSERT INTO imported_rows (external_id, name, date)
        SELECT * FROM UNNEST($1::bigint[], $2::text[], $3::date[])
        RETURNING id, external_id, name, date
        "#,
    )
    .bind(external_ids)
    .bind(names)
    .bind(dates)
    .fetch_all(pool)
    .await
}

/// One page of distinct dates (oldest first) with every row stored on them
pub async fn grouped_by_date(pool: &PgPool, page: u32, limit: u32) -> Result<GroupedRowsResponse, sqlx::Error> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT date) FROM imported_rows")
        .fetch_one(pool)
        .await?;
    let meta = PageMeta::new(total.max(0) as u64, page, limit);

    let dates: Vec<NaiveDate> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT date FROM imported_rows
        ORDER BY date ASC
        LIMIT $1 OFFSET $2
        "#,
    )
    .bind(i64::from(limit))
    .bind(page_offset(page, limit))
    .fetch_all(pool)
    .await?;

    if dates.is_empty() {
        return Ok(GroupedRowsResponse { data: Vec::new(), meta });
    }

    let rows = sqlx::query_as::<_, StoredRow>(
        r#"
        SELECT id, external_id, name, date FROM imported_rows
        WHERE date = ANY($1)
        ORDER BY date ASC, id ASC
        "#,
    )
    .bind(&dates)
    .fetch_all(pool)
    .await?;

    Ok(GroupedRowsResponse {
        data: group_by_date(dates, rows),
        meta,
    })
}

fn page_offset(page: u32, limit: u32) -> i64 {
    i64::from(page.saturating_sub(1)) * i64::from(limit)
}

/// One group per date in `dates` order; a date with no rows gets an empty group
fn group_by_date(dates: Vec<NaiveDate>, rows: Vec<StoredRow>) -> Vec<DateGroup> {
    let mut groups: Vec<DateGroup> = dates
        .into_iter()
        .map(|date| DateGroup { date, items: Vec::new() })
        .collect();
    for row in rows {
        if let Some(group) = groups.iter_mut().find(|g| g.date == row.date) {
            group.items.push(row);
        }
    }
    groups
}
